//! Composable query over a folder's contents.
//!
//! A `FileQuery` renders to a Drive search expression for the HTTP connector
//! and can also be evaluated locally with [`FileQuery::matches`], which is how
//! post-filters (custom properties) are applied.

use crate::models::drive_file::{DriveFile, FOLDER_MIME_TYPE};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum KindFilter {
    #[default]
    Any,
    OnlyFolders,
    ExcludingFolders,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileQuery {
    parent_id: Option<String>,
    name: Option<String>,
    kind: KindFilter,
    include_trashed: bool,
    property: Option<String>,
}

impl FileQuery {
    /// Direct children of `parent_id`. Not recursive.
    pub fn children_of(parent_id: impl Into<String>) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            ..Self::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn only_folders(mut self) -> Self {
        self.kind = KindFilter::OnlyFolders;
        self
    }

    pub fn excluding_folders(mut self) -> Self {
        self.kind = KindFilter::ExcludingFolders;
        self
    }

    pub fn including_trashed(mut self) -> Self {
        self.include_trashed = true;
        self
    }

    /// Keep only files carrying a non-empty value for `key`.
    pub fn having_property(mut self, key: impl Into<String>) -> Self {
        self.property = Some(key.into());
        self
    }

    pub fn matches(&self, file: &DriveFile) -> bool {
        if let Some(parent) = &self.parent_id {
            if !file.parent_ids.iter().any(|p| p == parent) {
                return false;
            }
        }
        if let Some(name) = &self.name {
            if &file.name != name {
                return false;
            }
        }
        match self.kind {
            KindFilter::Any => {}
            KindFilter::OnlyFolders if !file.is_folder() => return false,
            KindFilter::ExcludingFolders if file.is_folder() => return false,
            _ => {}
        }
        if !self.include_trashed && file.trashed {
            return false;
        }
        if let Some(key) = &self.property {
            if file.property(key).is_none() {
                return false;
            }
        }
        true
    }

    /// Drive `q` expression for the server-side part of the query.
    ///
    /// The property filter has no server-side form without a value, so it is
    /// left to [`FileQuery::matches`].
    pub fn to_drive_q(&self) -> String {
        let mut parts = Vec::new();
        if let Some(name) = &self.name {
            parts.push(format!("name = '{}'", escape_q(name)));
        }
        if let Some(parent) = &self.parent_id {
            parts.push(format!("'{}' in parents", escape_q(parent)));
        }
        match self.kind {
            KindFilter::Any => {}
            KindFilter::OnlyFolders => parts.push(format!("mimeType = '{FOLDER_MIME_TYPE}'")),
            KindFilter::ExcludingFolders => {
                parts.push(format!("mimeType != '{FOLDER_MIME_TYPE}'"))
            }
        }
        if !self.include_trashed {
            parts.push("trashed = false".to_string());
        }
        parts.join(" and ")
    }
}

fn escape_q(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
