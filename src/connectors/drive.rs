//! Google Drive v3 REST connector.
//!
//! Speaks just the endpoints the pipeline uses: `files.list`, `files.get`
//! (metadata and `alt=media`), `files.update`, `files.create` for folders,
//! `files.watch` and `channels.stop`. Authentication is a bearer token taken
//! from the installation's credentials; obtaining and refreshing that token
//! happens elsewhere.

use super::{
    ConnectorFactory, FileOperations, FileQuery, FolderQuery, ProviderError, ProviderResult,
    StorageConnector, WatchChannelClient,
};
use crate::models::drive_file::{DriveFile, FOLDER_MIME_TYPE};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info};

pub const DEFAULT_DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";

const FILE_FIELDS: &str = "id,name,mimeType,parents,properties,owners,trashed";
const PAGE_SIZE: &str = "1000";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileResource {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    mime_type: String,
    #[serde(default)]
    parents: Vec<String>,
    #[serde(default)]
    properties: Option<HashMap<String, String>>,
    #[serde(default)]
    owners: Vec<Owner>,
    #[serde(default)]
    trashed: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Owner {
    email_address: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<FileResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    resource_id: String,
}

impl From<FileResource> for DriveFile {
    fn from(f: FileResource) -> Self {
        DriveFile {
            id: f.id,
            name: f.name,
            mime_type: f.mime_type,
            parent_ids: f.parents,
            properties: f.properties.unwrap_or_default(),
            owner: f.owners.into_iter().find_map(|o| o.email_address),
            trashed: f.trashed,
        }
    }
}

/// Drive client bound to one access token.
#[derive(Clone, Debug)]
pub struct DriveConnector {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
}

impl DriveConnector {
    pub fn new(
        http: reqwest::Client,
        base_url: impl Into<String>,
        access_token: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn send(
        &self,
        request: reqwest::RequestBuilder,
        context: &str,
    ) -> ProviderResult<reqwest::Response> {
        debug!("drive: START {}", context);
        let response = request.bearer_auth(&self.access_token).send().await?;
        let status = response.status();
        if status.is_success() {
            debug!("drive: FINISH {}", context);
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ProviderError::from_status(
            status.as_u16(),
            format!("{context}: {body}"),
        ))
    }
}

#[async_trait]
impl FolderQuery for DriveConnector {
    async fn list(&self, query: &FileQuery) -> ProviderResult<Vec<DriveFile>> {
        let q = query.to_drive_q();
        let fields = format!("nextPageToken,files({FILE_FIELDS})");
        let mut page_token: Option<String> = None;
        let mut files = Vec::new();

        loop {
            let mut params = vec![
                ("q", q.as_str()),
                ("fields", fields.as_str()),
                ("pageSize", PAGE_SIZE),
            ];
            if let Some(token) = page_token.as_deref() {
                params.push(("pageToken", token));
            }
            let request = self.http.get(self.url("files")).query(&params);
            let page: FileList = self
                .send(request, "listing files that match filters")
                .await?
                .json()
                .await?;

            files.extend(
                page.files
                    .into_iter()
                    .map(DriveFile::from)
                    .filter(|f| query.matches(f)),
            );
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(files)
    }

    async fn get(&self, file_id: &str) -> ProviderResult<DriveFile> {
        let request = self
            .http
            .get(self.url(&format!("files/{file_id}")))
            .query(&[("fields", FILE_FIELDS)]);
        let resource: FileResource = self
            .send(request, &format!("getting file {file_id}"))
            .await?
            .json()
            .await?;
        Ok(resource.into())
    }
}

#[async_trait]
impl FileOperations for DriveConnector {
    async fn download(&self, file_id: &str) -> ProviderResult<Bytes> {
        let request = self
            .http
            .get(self.url(&format!("files/{file_id}")))
            .query(&[("alt", "media")]);
        let bytes = self
            .send(request, &format!("downloading file {file_id}"))
            .await?
            .bytes()
            .await?;
        Ok(bytes)
    }

    async fn move_file(
        &self,
        file_id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> ProviderResult<()> {
        let request = self
            .http
            .patch(self.url(&format!("files/{file_id}")))
            .query(&[
                ("addParents", to_parent),
                ("removeParents", from_parent),
                ("fields", "id"),
            ])
            .json(&json!({}));
        self.send(request, &format!("moving file {file_id} to {to_parent}"))
            .await?;
        Ok(())
    }

    async fn set_properties(
        &self,
        file_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<()> {
        let request = self
            .http
            .patch(self.url(&format!("files/{file_id}")))
            .query(&[("fields", "id")])
            .json(&json!({ "properties": properties }));
        self.send(request, &format!("updating properties of {file_id}"))
            .await?;
        Ok(())
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<DriveFile> {
        let request = self
            .http
            .post(self.url("files"))
            .query(&[("fields", FILE_FIELDS)])
            .json(&json!({
                "name": name,
                "mimeType": FOLDER_MIME_TYPE,
                "parents": [parent_id],
                "properties": properties,
            }));
        let resource: FileResource = self
            .send(request, &format!("creating folder {name}"))
            .await?
            .json()
            .await?;
        Ok(resource.into())
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> ProviderResult<()> {
        let request = self
            .http
            .patch(self.url(&format!("files/{file_id}")))
            .query(&[("fields", "id")])
            .json(&json!({ "name": new_name }));
        self.send(request, &format!("renaming {file_id}")).await?;
        Ok(())
    }
}

#[async_trait]
impl WatchChannelClient for DriveConnector {
    async fn create_channel(
        &self,
        channel_id: &str,
        folder_id: &str,
        callback_url: &str,
        expires_at: DateTime<Utc>,
    ) -> ProviderResult<String> {
        info!(channel_id, folder_id, %expires_at, "watcher: creating watch channel");
        let request = self
            .http
            .post(self.url(&format!("files/{folder_id}/watch")))
            .json(&watch_body(channel_id, callback_url, expires_at));
        let response: WatchResponse = self
            .send(request, &format!("creating watch channel {channel_id}"))
            .await?
            .json()
            .await?;
        info!(
            channel_id,
            resource_id = %response.resource_id,
            "watcher: created watch channel"
        );
        Ok(response.resource_id)
    }

    async fn cancel_channel(&self, channel_id: &str, resource_id: &str) -> ProviderResult<()> {
        info!(channel_id, resource_id, "watcher: closing watch channel");
        let request = self.http.post(self.url("channels/stop")).json(&json!({
            "id": channel_id,
            "resourceId": resource_id,
        }));
        self.send(request, &format!("closing watch channel {channel_id}"))
            .await?;
        Ok(())
    }
}

/// Body of a `files.watch` request. Without `expiration` Drive closes the
/// channel after one hour.
fn watch_body(channel_id: &str, callback_url: &str, expires_at: DateTime<Utc>) -> serde_json::Value {
    json!({
        "id": channel_id,
        "type": "web_hook",
        "address": callback_url,
        "expiration": expires_at.timestamp_millis().to_string(),
    })
}

/// Builds a `DriveConnector` per installation, sharing one HTTP client.
#[derive(Clone, Debug)]
pub struct DriveConnectorFactory {
    http: reqwest::Client,
    base_url: String,
}

impl DriveConnectorFactory {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

impl ConnectorFactory for DriveConnectorFactory {
    fn connect(&self, credentials: &str) -> Arc<dyn StorageConnector> {
        Arc::new(DriveConnector::new(
            self.http.clone(),
            self.base_url.clone(),
            credentials,
        ))
    }
}
