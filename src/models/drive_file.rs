//! File descriptor as reported by the storage provider.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Mime type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// A file or folder in the storage provider.
///
/// Only the fields the intake pipeline reads are kept. `properties` holds the
/// provider's custom key/value properties, where bucket actions and change
/// markers live.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Default)]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    pub parent_ids: Vec<String>,
    pub properties: HashMap<String, String>,
    pub owner: Option<String>,
    pub trashed: bool,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// The first parent. Multi-parent files are legacy and treated as
    /// invalid wherever parentage matters.
    pub fn parent_id(&self) -> Option<&str> {
        self.parent_ids.first().map(String::as_str)
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}
