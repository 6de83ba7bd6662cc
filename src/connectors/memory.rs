//! In-memory storage provider and stub collaborators for tests.

use super::{
    ConnectorFactory, FileOperations, FileQuery, FolderQuery, ProviderError, ProviderResult,
    StorageConnector, WatchChannelClient,
    classifier::{Classification, DocumentClassifier},
    ocr::TextExtractor,
    pdf::PdfRasterizer,
};
use crate::models::{
    bucket::ACTION_PROPERTY,
    drive_file::{DriveFile, FOLDER_MIME_TYPE},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex},
};

#[derive(Default)]
struct DriveState {
    files: HashMap<String, DriveFile>,
    contents: HashMap<String, Bytes>,
    /// Open channels: channel id -> (folder id, resource id).
    channels: HashMap<String, (String, String)>,
    created: Vec<String>,
    /// Requested expiry per channel id, as last created.
    expirations: HashMap<String, DateTime<Utc>>,
    cancelled: Vec<String>,
    next_id: u64,
    fail_create: bool,
    fail_cancel: bool,
    fail_download: HashSet<String>,
    fail_set_properties: HashSet<String>,
}

/// A tiny Drive: files keyed by id, custom properties, parents and watch
/// channels. Duplicate channel ids are refused like the real provider does.
#[derive(Default, Clone)]
pub struct MemoryDrive {
    state: Arc<Mutex<DriveState>>,
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<T>(&self, f: impl FnOnce(&mut DriveState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    pub fn add_folder(&self, id: &str, name: &str, parent: Option<&str>, action: Option<&str>) {
        let mut properties = HashMap::new();
        if let Some(action) = action {
            properties.insert(ACTION_PROPERTY.to_string(), action.to_string());
        }
        self.insert(DriveFile {
            id: id.into(),
            name: name.into(),
            mime_type: FOLDER_MIME_TYPE.into(),
            parent_ids: parent.into_iter().map(String::from).collect(),
            properties,
            owner: None,
            trashed: false,
        });
    }

    pub fn add_file(&self, id: &str, name: &str, mime_type: &str, parent: &str) {
        self.insert(DriveFile {
            id: id.into(),
            name: name.into(),
            mime_type: mime_type.into(),
            parent_ids: vec![parent.into()],
            ..Default::default()
        });
        self.with(|s| {
            s.contents
                .insert(id.to_string(), Bytes::from(format!("contents of {name}")))
        });
    }

    pub fn insert(&self, file: DriveFile) {
        self.with(|s| s.files.insert(file.id.clone(), file));
    }

    pub fn file(&self, id: &str) -> Option<DriveFile> {
        self.with(|s| s.files.get(id).cloned())
    }

    pub fn set_property(&self, id: &str, key: &str, value: &str) {
        self.with(|s| {
            if let Some(f) = s.files.get_mut(id) {
                f.properties.insert(key.into(), value.into());
            }
        });
    }

    pub fn open_channels(&self) -> HashMap<String, (String, String)> {
        self.with(|s| s.channels.clone())
    }

    pub fn created_channels(&self) -> Vec<String> {
        self.with(|s| s.created.clone())
    }

    pub fn channel_expiry(&self, channel_id: &str) -> Option<DateTime<Utc>> {
        self.with(|s| s.expirations.get(channel_id).copied())
    }

    pub fn cancelled_channels(&self) -> Vec<String> {
        self.with(|s| s.cancelled.clone())
    }

    /// Drop a channel as if it expired on the provider side.
    pub fn expire_channel(&self, channel_id: &str) {
        self.with(|s| s.channels.remove(channel_id));
    }

    pub fn fail_channel_creation(&self, fail: bool) {
        self.with(|s| s.fail_create = fail);
    }

    pub fn fail_channel_cancellation(&self, fail: bool) {
        self.with(|s| s.fail_cancel = fail);
    }

    pub fn fail_download_of(&self, file_id: &str) {
        self.with(|s| s.fail_download.insert(file_id.to_string()));
    }

    pub fn fail_set_properties_of(&self, file_id: &str) {
        self.with(|s| s.fail_set_properties.insert(file_id.to_string()));
    }
}

#[async_trait]
impl FolderQuery for MemoryDrive {
    async fn list(&self, query: &FileQuery) -> ProviderResult<Vec<DriveFile>> {
        Ok(self.with(|s| {
            let mut files: Vec<DriveFile> = s
                .files
                .values()
                .filter(|f| query.matches(f))
                .cloned()
                .collect();
            files.sort_by(|a, b| a.id.cmp(&b.id));
            files
        }))
    }

    async fn get(&self, file_id: &str) -> ProviderResult<DriveFile> {
        self.file(file_id)
            .ok_or_else(|| ProviderError::NotFound(file_id.to_string()))
    }
}

#[async_trait]
impl FileOperations for MemoryDrive {
    async fn download(&self, file_id: &str) -> ProviderResult<Bytes> {
        self.with(|s| {
            if s.fail_download.contains(file_id) {
                return Err(ProviderError::Transport(format!("download of {file_id} reset")));
            }
            s.contents
                .get(file_id)
                .cloned()
                .ok_or_else(|| ProviderError::NotFound(file_id.to_string()))
        })
    }

    async fn move_file(
        &self,
        file_id: &str,
        from_parent: &str,
        to_parent: &str,
    ) -> ProviderResult<()> {
        self.with(|s| {
            let file = s
                .files
                .get_mut(file_id)
                .ok_or_else(|| ProviderError::NotFound(file_id.to_string()))?;
            file.parent_ids.retain(|p| p != from_parent);
            file.parent_ids.push(to_parent.to_string());
            Ok(())
        })
    }

    async fn set_properties(
        &self,
        file_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<()> {
        self.with(|s| {
            if s.fail_set_properties.contains(file_id) {
                return Err(ProviderError::Authorization(format!("{file_id} is read-only")));
            }
            let file = s
                .files
                .get_mut(file_id)
                .ok_or_else(|| ProviderError::NotFound(file_id.to_string()))?;
            file.properties.extend(properties);
            Ok(())
        })
    }

    async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<DriveFile> {
        let id = self.with(|s| {
            s.next_id += 1;
            format!("new-folder-{}", s.next_id)
        });
        let folder = DriveFile {
            id,
            name: name.into(),
            mime_type: FOLDER_MIME_TYPE.into(),
            parent_ids: vec![parent_id.into()],
            properties,
            owner: None,
            trashed: false,
        };
        self.insert(folder.clone());
        Ok(folder)
    }

    async fn rename(&self, file_id: &str, new_name: &str) -> ProviderResult<()> {
        self.with(|s| {
            let file = s
                .files
                .get_mut(file_id)
                .ok_or_else(|| ProviderError::NotFound(file_id.to_string()))?;
            file.name = new_name.to_string();
            Ok(())
        })
    }
}

#[async_trait]
impl WatchChannelClient for MemoryDrive {
    async fn create_channel(
        &self,
        channel_id: &str,
        folder_id: &str,
        _callback_url: &str,
        expires_at: DateTime<Utc>,
    ) -> ProviderResult<String> {
        self.with(|s| {
            if s.fail_create {
                return Err(ProviderError::Transport("watch endpoint unavailable".into()));
            }
            if s.channels.contains_key(channel_id) {
                return Err(ProviderError::Application(format!(
                    "channel id {channel_id} not unique"
                )));
            }
            s.next_id += 1;
            let resource_id = format!("res-{}", s.next_id);
            s.channels.insert(
                channel_id.to_string(),
                (folder_id.to_string(), resource_id.clone()),
            );
            s.created.push(channel_id.to_string());
            s.expirations.insert(channel_id.to_string(), expires_at);
            Ok(resource_id)
        })
    }

    async fn cancel_channel(&self, channel_id: &str, resource_id: &str) -> ProviderResult<()> {
        self.with(|s| {
            if s.fail_cancel {
                return Err(ProviderError::Transport("stop endpoint unavailable".into()));
            }
            match s.channels.get(channel_id) {
                Some((_, open)) if open == resource_id => {
                    s.channels.remove(channel_id);
                    s.cancelled.push(channel_id.to_string());
                    Ok(())
                }
                _ => Err(ProviderError::NotFound(format!("channel {channel_id}"))),
            }
        })
    }
}

/// Hands out the same `MemoryDrive` for every installation.
#[derive(Clone, Default)]
pub struct MemoryConnectorFactory {
    pub drive: MemoryDrive,
}

impl ConnectorFactory for MemoryConnectorFactory {
    fn connect(&self, _credentials: &str) -> Arc<dyn StorageConnector> {
        Arc::new(self.drive.clone())
    }
}

/// OCR that always returns the same text, or always fails.
pub struct StubOcr {
    pub text: Option<String>,
}

#[async_trait]
impl TextExtractor for StubOcr {
    async fn extract_text(&self, _image: &[u8], _mime_type: &str) -> ProviderResult<String> {
        self.text
            .clone()
            .ok_or_else(|| ProviderError::Transport("vision unavailable".into()))
    }
}

/// Classifier driven by the image contents: looks up a destination by the
/// file name embedded in `MemoryDrive` contents.
#[derive(Default)]
pub struct StubClassifier {
    by_name: HashMap<String, Option<String>>,
    failing: HashSet<String>,
    seen_text: Mutex<Vec<String>>,
}

impl StubClassifier {
    pub fn route(mut self, file_name: &str, bucket: Option<&str>) -> Self {
        self.by_name
            .insert(file_name.to_string(), bucket.map(String::from));
        self
    }

    pub fn fail_on(mut self, file_name: &str) -> Self {
        self.failing.insert(file_name.to_string());
        self
    }

    pub fn seen_text(&self) -> Vec<String> {
        self.seen_text.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentClassifier for StubClassifier {
    async fn classify(
        &self,
        image: &[u8],
        _mime_type: &str,
        extracted_text: &str,
        _candidate_buckets: &[String],
    ) -> ProviderResult<Classification> {
        self.seen_text
            .lock()
            .unwrap()
            .push(extracted_text.to_string());
        let contents = String::from_utf8_lossy(image);
        let name = contents.trim_start_matches("contents of ").to_string();
        if self.failing.contains(&name) {
            return Err(ProviderError::Transport(format!("classifier choked on {name}")));
        }
        Ok(Classification {
            bucket: self.by_name.get(&name).cloned().flatten(),
            ..Default::default()
        })
    }
}

/// Rasterizer that returns the PDF bytes unchanged.
pub struct PassthroughRasterizer;

#[async_trait]
impl PdfRasterizer for PassthroughRasterizer {
    async fn flatten(&self, pdf: &Path) -> ProviderResult<Vec<u8>> {
        tokio::fs::read(pdf)
            .await
            .map_err(|err| ProviderError::Transport(err.to_string()))
    }
}

/// Rasterizer that rejects every PDF.
pub struct FailingRasterizer;

#[async_trait]
impl PdfRasterizer for FailingRasterizer {
    async fn flatten(&self, pdf: &Path) -> ProviderResult<Vec<u8>> {
        Err(ProviderError::Application(format!(
            "pdftoppm failed on {}",
            pdf.display()
        )))
    }
}
