//! Represents a bucket: an action-tagged folder directly under an
//! installation's root.

use crate::models::drive_file::DriveFile;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Folder property holding the bucket's action.
pub const ACTION_PROPERTY: &str = "dof_action";

/// Folder property marking an installation's root folder.
pub const ROOT_PROPERTY: &str = "dof_root";

/// What happens to files that land in a bucket.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BucketAction {
    /// Files are stored, nothing else.
    None,
    /// Files are classified and moved to the bucket the classifier names.
    Classify,
}

impl BucketAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketAction::None => "none",
            BucketAction::Classify => "classify",
        }
    }

    /// Buckets whose action does work on arrival need a watch channel.
    pub fn is_watched(&self) -> bool {
        match self {
            BucketAction::None => false,
            BucketAction::Classify => true,
        }
    }
}

impl fmt::Display for BucketAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BucketAction {
    type Err = BucketError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(BucketAction::None),
            "classify" => Ok(BucketAction::Classify),
            other => Err(BucketError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BucketError {
    #[error("`{0}` is not a valid bucket action")]
    UnknownAction(String),
    #[error("folder `{folder_id}` is not a direct child of root `{root_folder_id}`")]
    InvalidParent {
        folder_id: String,
        root_folder_id: String,
    },
    #[error("`{0}` is not a folder")]
    NotAFolder(String),
    #[error("bucket name `{name}` invalid: {reason}")]
    InvalidName { name: String, reason: String },
}

/// A bucket resolved from a provider folder.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Bucket {
    pub folder_id: String,
    pub name: String,
    pub action: BucketAction,
}

impl Bucket {
    /// Interpret `folder` as a bucket of the installation rooted at
    /// `root_folder_id`.
    ///
    /// Returns `Ok(None)` for folders without an action property. Folders with
    /// an unknown action, or not parented solely by the root, are errors.
    pub fn from_folder(folder: &DriveFile, root_folder_id: &str) -> Result<Option<Self>, BucketError> {
        if !folder.is_folder() {
            return Err(BucketError::NotAFolder(folder.id.clone()));
        }
        let Some(raw_action) = folder.property(ACTION_PROPERTY) else {
            return Ok(None);
        };
        if folder.parent_ids.len() != 1 || folder.parent_id() != Some(root_folder_id) {
            return Err(BucketError::InvalidParent {
                folder_id: folder.id.clone(),
                root_folder_id: root_folder_id.to_string(),
            });
        }
        let action = raw_action.parse()?;
        Ok(Some(Self {
            folder_id: folder.id.clone(),
            name: folder.name.clone(),
            action,
        }))
    }
}

/// Bucket names become folder names under the root.
pub fn ensure_bucket_name_valid(name: &str) -> Result<(), BucketError> {
    let reason = if name.trim().is_empty() {
        "may not be empty"
    } else if name.contains('/') {
        "may not contain slashes"
    } else if name.trim() != name {
        "cannot begin or end with whitespace"
    } else {
        return Ok(());
    };
    Err(BucketError::InvalidName {
        name: name.to_string(),
        reason: reason.into(),
    })
}
