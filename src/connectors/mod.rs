//! Narrow interfaces to the external collaborators of the intake pipeline.
//!
//! The storage provider is split into capabilities (`FolderQuery`,
//! `FileOperations`, `WatchChannelClient`); components ask for the
//! combined `StorageConnector` and only call what they need. Each connector
//! is scoped to one installation's credentials and is handed to components
//! explicitly, never held globally.

use crate::models::drive_file::DriveFile;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::{collections::HashMap, sync::Arc};
use thiserror::Error;

pub mod classifier;
pub mod drive;
pub mod folder_query;
#[cfg(test)]
pub mod memory;
pub mod ocr;
pub mod pdf;

pub use folder_query::FileQuery;

/// Failures reported by external collaborators, classified the way the
/// pipeline reacts to them.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// Credentials expired, invalid or lacking scope. Not retried.
    #[error("access denied: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// The request was understood and refused; retrying will not help.
    #[error("rejected: {0}")]
    Application(String),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("timed out: {0}")]
    Timeout(String),
}

impl ProviderError {
    /// Classify an HTTP status returned by a provider API.
    pub fn from_status(status: u16, context: impl Into<String>) -> Self {
        let context = context.into();
        match status {
            404 => ProviderError::NotFound(context),
            401 | 403 => ProviderError::Authorization(context),
            // rate limited; transient
            429 => ProviderError::Transport(format!("HTTP 429: {context}")),
            400..=499 => ProviderError::Application(context),
            _ => ProviderError::Transport(format!("HTTP {status}: {context}")),
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Read-only listing of folder contents.
#[async_trait]
pub trait FolderQuery: Send + Sync {
    async fn list(&self, query: &FileQuery) -> ProviderResult<Vec<DriveFile>>;

    async fn get(&self, file_id: &str) -> ProviderResult<DriveFile>;
}

/// Mutations and content access on individual files.
#[async_trait]
pub trait FileOperations: Send + Sync {
    async fn download(&self, file_id: &str) -> ProviderResult<Bytes>;

    /// Move a file from one parent folder to another.
    async fn move_file(&self, file_id: &str, from_parent: &str, to_parent: &str)
    -> ProviderResult<()>;

    /// Merge `properties` into the file's custom properties.
    async fn set_properties(
        &self,
        file_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<()>;

    async fn create_folder(
        &self,
        name: &str,
        parent_id: &str,
        properties: HashMap<String, String>,
    ) -> ProviderResult<DriveFile>;

    async fn rename(&self, file_id: &str, new_name: &str) -> ProviderResult<()>;
}

/// Push-notification subscriptions on single folders.
#[async_trait]
pub trait WatchChannelClient: Send + Sync {
    /// Open a channel that lives until `expires_at` and return the
    /// provider's resource id for it.
    async fn create_channel(
        &self,
        channel_id: &str,
        folder_id: &str,
        callback_url: &str,
        expires_at: DateTime<Utc>,
    ) -> ProviderResult<String>;

    async fn cancel_channel(&self, channel_id: &str, resource_id: &str) -> ProviderResult<()>;
}

/// Everything the pipeline needs from the storage provider.
pub trait StorageConnector: FolderQuery + FileOperations + WatchChannelClient {}

impl<T> StorageConnector for T where T: FolderQuery + FileOperations + WatchChannelClient {}

/// Builds a connector bound to one installation's credentials.
pub trait ConnectorFactory: Send + Sync {
    fn connect(&self, credentials: &str) -> Arc<dyn StorageConnector>;
}
