//! src/services/buckets.rs
//!
//! BucketManager: bucket discovery and administration under one
//! installation's root.

use super::bounded;
use crate::{
    connectors::{FileQuery, ProviderError, StorageConnector},
    models::bucket::{ACTION_PROPERTY, Bucket, BucketAction, BucketError, ensure_bucket_name_valid},
};
use chrono::NaiveDate;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BucketOpError {
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Invalid(#[from] BucketError),
    #[error("folder `{0}` is not a bucket")]
    NotABucket(String),
    #[error("no bucket named `{0}`")]
    NoSuchBucket(String),
    #[error("more than one bucket named `{0}`")]
    Ambiguous(String),
    #[error("there is already a file named `{0}`")]
    NameTaken(String),
}

#[derive(Clone)]
pub struct BucketManager {
    connector: Arc<dyn StorageConnector>,
    root_folder_id: String,
    call_timeout: Duration,
}

impl BucketManager {
    pub fn new(
        connector: Arc<dyn StorageConnector>,
        root_folder_id: impl Into<String>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            root_folder_id: root_folder_id.into(),
            call_timeout,
        }
    }

    fn tagged_folders(&self) -> FileQuery {
        FileQuery::children_of(&self.root_folder_id)
            .only_folders()
            .having_property(ACTION_PROPERTY)
    }

    /// Every action-tagged folder under the root, each parsed on its own so
    /// one malformed bucket does not hide the others.
    pub async fn scan(&self) -> Result<Vec<Result<Bucket, BucketError>>, ProviderError> {
        let folders = bounded(
            self.call_timeout,
            "listing buckets",
            self.connector.list(&self.tagged_folders()),
        )
        .await?;
        Ok(folders
            .iter()
            .filter_map(|f| Bucket::from_folder(f, &self.root_folder_id).transpose())
            .collect())
    }

    /// Valid buckets only; invalid ones are logged and skipped.
    pub async fn buckets(&self) -> Result<Vec<Bucket>, ProviderError> {
        let mut buckets = Vec::new();
        for scanned in self.scan().await? {
            match scanned {
                Ok(bucket) => buckets.push(bucket),
                Err(err) => warn!(root_folder_id = %self.root_folder_id, "skipping bucket: {}", err),
            }
        }
        Ok(buckets)
    }

    /// Resolve `folder_id` as a bucket of this installation.
    pub async fn resolve(&self, folder_id: &str) -> Result<Bucket, BucketOpError> {
        let folder = bounded(
            self.call_timeout,
            "getting bucket folder",
            self.connector.get(folder_id),
        )
        .await?;
        if !folder.is_folder() || folder.trashed {
            return Err(BucketOpError::NotABucket(folder_id.to_string()));
        }
        Bucket::from_folder(&folder, &self.root_folder_id)?
            .ok_or_else(|| BucketOpError::NotABucket(folder_id.to_string()))
    }

    /// Find the single bucket called `name`.
    pub async fn find_by_name(&self, name: &str) -> Result<Bucket, BucketOpError> {
        let mut matches = bounded(
            self.call_timeout,
            "looking up bucket by name",
            self.connector.list(&self.tagged_folders().named(name)),
        )
        .await?;
        match matches.len() {
            0 => Err(BucketOpError::NoSuchBucket(name.to_string())),
            1 => {
                let folder = matches.remove(0);
                Bucket::from_folder(&folder, &self.root_folder_id)?
                    .ok_or_else(|| BucketOpError::NoSuchBucket(name.to_string()))
            }
            _ => Err(BucketOpError::Ambiguous(name.to_string())),
        }
    }

    /// Create a bucket folder, or adopt an existing folder with that name.
    ///
    /// A non-folder file already using the name is an error unless
    /// `rename_existing` is set, in which case it is renamed out of the way
    /// with a date suffix.
    pub async fn create_bucket(
        &self,
        name: &str,
        action: BucketAction,
        rename_existing: bool,
        today: NaiveDate,
    ) -> Result<Bucket, BucketOpError> {
        ensure_bucket_name_valid(name)?;
        let properties = HashMap::from([(ACTION_PROPERTY.to_string(), action.to_string())]);

        let existing = bounded(
            self.call_timeout,
            "checking for existing file",
            self.connector
                .list(&FileQuery::children_of(&self.root_folder_id).named(name)),
        )
        .await?;

        if let Some(folder) = existing.iter().find(|f| f.is_folder()) {
            info!(name, folder_id = %folder.id, "reusing existing folder");
            bounded(
                self.call_timeout,
                "tagging existing folder",
                self.connector.set_properties(&folder.id, properties),
            )
            .await?;
            return Ok(Bucket {
                folder_id: folder.id.clone(),
                name: name.to_string(),
                action,
            });
        }

        if let Some(file) = existing.first() {
            if !rename_existing {
                return Err(BucketOpError::NameTaken(name.to_string()));
            }
            let new_name = format!("{}-{}", name, today.format("%Y-%m-%d"));
            info!(name, new_name, "renaming existing file");
            bounded(
                self.call_timeout,
                "renaming existing file",
                self.connector.rename(&file.id, &new_name),
            )
            .await?;
        }

        info!(name, "creating new folder");
        let folder = bounded(
            self.call_timeout,
            "creating bucket folder",
            self.connector
                .create_folder(name, &self.root_folder_id, properties),
        )
        .await?;
        Ok(Bucket {
            folder_id: folder.id,
            name: name.to_string(),
            action,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectors::memory::MemoryDrive;

    const ROOT: &str = "root";

    fn manager(drive: &MemoryDrive) -> BucketManager {
        BucketManager::new(Arc::new(drive.clone()), ROOT, Duration::from_secs(5))
    }

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()
    }

    #[tokio::test]
    async fn scan_isolates_bad_buckets() {
        let drive = MemoryDrive::new();
        drive.add_folder("inbox", "Inbox", Some(ROOT), Some("classify"));
        drive.add_folder("weird", "Weird", Some(ROOT), Some("tabulate"));
        drive.add_folder("plain", "Plain", Some(ROOT), None);

        let scanned = manager(&drive).scan().await.unwrap();
        assert_eq!(scanned.len(), 2);
        let buckets = manager(&drive).buckets().await.unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].folder_id, "inbox");
    }

    #[tokio::test]
    async fn resolve_rejects_untagged_folders() {
        let drive = MemoryDrive::new();
        drive.add_folder("plain", "Plain", Some(ROOT), None);
        assert!(matches!(
            manager(&drive).resolve("plain").await,
            Err(BucketOpError::NotABucket(_))
        ));
        assert!(matches!(
            manager(&drive).resolve("missing").await,
            Err(BucketOpError::Provider(ProviderError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn find_by_name_detects_duplicates() {
        let drive = MemoryDrive::new();
        drive.add_folder("a", "Receipts", Some(ROOT), Some("none"));
        drive.add_folder("b", "Receipts", Some(ROOT), Some("none"));
        assert!(matches!(
            manager(&drive).find_by_name("Receipts").await,
            Err(BucketOpError::Ambiguous(_))
        ));
        assert!(matches!(
            manager(&drive).find_by_name("Taxes").await,
            Err(BucketOpError::NoSuchBucket(_))
        ));
    }

    #[tokio::test]
    async fn create_bucket_reuses_existing_folder() {
        let drive = MemoryDrive::new();
        drive.add_folder("taxes", "Taxes", Some(ROOT), None);
        let bucket = manager(&drive)
            .create_bucket("Taxes", BucketAction::Classify, false, today())
            .await
            .unwrap();
        assert_eq!(bucket.folder_id, "taxes");
        assert_eq!(
            drive.file("taxes").unwrap().property(ACTION_PROPERTY),
            Some("classify")
        );
    }

    #[tokio::test]
    async fn create_bucket_moves_conflicting_file_aside() {
        let drive = MemoryDrive::new();
        drive.add_file("doc", "Taxes", "application/pdf", ROOT);

        assert!(matches!(
            manager(&drive)
                .create_bucket("Taxes", BucketAction::None, false, today())
                .await,
            Err(BucketOpError::NameTaken(_))
        ));

        let bucket = manager(&drive)
            .create_bucket("Taxes", BucketAction::None, true, today())
            .await
            .unwrap();
        assert_eq!(drive.file("doc").unwrap().name, "Taxes-2026-10-15");
        assert_eq!(drive.file(&bucket.folder_id).unwrap().name, "Taxes");
    }
}
