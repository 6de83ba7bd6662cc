//! src/services/intake_service.rs
//!
//! IntakeService: shared application state. Holds the installation store,
//! the connector factory and the classification collaborators, and builds
//! per-installation components (lifecycle manager, dedup processor,
//! dispatcher) with a connector scoped to that installation's credentials.

use super::{
    bounded,
    buckets::{BucketManager, BucketOpError},
    dedup::{ChangeDedupProcessor, DedupError, DedupSummary},
    dispatcher::ClassificationDispatcher,
    installation_store::{InstallationStore, InstallationUpdate, StoreError},
    lifecycle::{LifecycleError, LifecycleManager, PassOutcome},
};
use crate::{
    connectors::{
        ConnectorFactory, ProviderError, StorageConnector, classifier::DocumentClassifier,
        ocr::TextExtractor, pdf::PdfRasterizer,
    },
    models::{
        bucket::{Bucket, BucketAction, ROOT_PROPERTY},
        channel::ChannelId,
        installation::{Installation, InstallationStatus, NewInstallation},
        pattern::{BucketPattern, PatternError},
    },
};
use chrono::{DateTime, TimeDelta, Utc};
use futures::{StreamExt, stream};
use serde::Serialize;
use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{error, info, warn};

/// Tunables shared by every component of the pipeline.
#[derive(Clone, Debug)]
pub struct PipelineSettings {
    /// Address the provider posts change notifications to.
    pub webhook_url: String,
    /// Channels older than this are recreated; must be shorter than the
    /// provider's own expiry.
    pub refresh_interval: TimeDelta,
    /// Upper bound for any single provider or collaborator call.
    pub call_timeout: Duration,
    /// Installations maintained concurrently during a batch.
    pub maintenance_concurrency: usize,
    /// Where transient downloads are written.
    pub scratch_dir: PathBuf,
}

/// The OCR, classification and PDF collaborators.
#[derive(Clone)]
pub struct Collaborators {
    pub text_extractor: Option<Arc<dyn TextExtractor>>,
    pub classifier: Arc<dyn DocumentClassifier>,
    pub rasterizer: Arc<dyn PdfRasterizer>,
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("installation `{0}` not found")]
    UnknownInstallation(i64),
    #[error("channel `{0}` is not a known watch channel")]
    UnknownChannel(String),
    #[error("installation `{id}` is not in service ({status})")]
    NotServiceable {
        id: i64,
        status: InstallationStatus,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// How a notification was handled at the door.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAck {
    /// Processing was handed off to a background task.
    Dispatched,
    /// The provider's channel-creation handshake; nothing to process.
    Sync,
}

/// Result of an administrative termination request.
#[derive(Debug, Clone, Serialize)]
pub struct TerminationRequest {
    pub installation: Installation,
    pub already_marked: bool,
}

/// What an administrative teardown released.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct TeardownReport {
    pub installation_id: i64,
    pub cancelled: usize,
    pub failed: usize,
}

/// Per-installation line of a maintenance batch.
#[derive(Debug, Clone, Serialize)]
pub struct PassReport {
    pub installation_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<PassOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Clone)]
pub struct IntakeService {
    pub store: InstallationStore,
    pub connectors: Arc<dyn ConnectorFactory>,
    pub collaborators: Collaborators,
    pub settings: Arc<PipelineSettings>,
}

impl IntakeService {
    pub fn new(
        store: InstallationStore,
        connectors: Arc<dyn ConnectorFactory>,
        collaborators: Collaborators,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            store,
            connectors,
            collaborators,
            settings: Arc::new(settings),
        }
    }

    pub fn lifecycle(&self, installation: &Installation) -> LifecycleManager {
        LifecycleManager::new(
            self.store.clone(),
            self.connectors.connect(&installation.credentials),
            self.settings.clone(),
        )
    }

    pub fn bucket_manager(&self, installation: &Installation) -> BucketManager {
        BucketManager::new(
            self.connectors.connect(&installation.credentials),
            &installation.root_folder_id,
            self.settings.call_timeout,
        )
    }

    pub fn dispatcher(&self, installation: &Installation) -> ClassificationDispatcher {
        ClassificationDispatcher::new(
            self.connectors.connect(&installation.credentials),
            self.bucket_manager(installation),
            self.collaborators.clone(),
            self.settings.clone(),
        )
    }

    pub fn dedup_processor(&self, installation: &Installation) -> ChangeDedupProcessor {
        ChangeDedupProcessor::new(
            self.connectors.connect(&installation.credentials),
            self.bucket_manager(installation),
            self.dispatcher(installation),
            self.settings.call_timeout,
        )
    }

    /// Run one maintenance pass for a single installation.
    pub async fn maintain(&self, id: i64, now: DateTime<Utc>) -> Result<PassOutcome, LifecycleError> {
        let installation = self.store.require(id).await?;
        self.lifecycle(&installation)
            .run_pass(&installation, now)
            .await
    }

    /// Run a maintenance pass over every installation that is not yet
    /// terminated. Failures are reported per installation and never stop
    /// the batch.
    pub async fn run_maintenance(&self, now: DateTime<Utc>) -> Result<Vec<PassReport>, StoreError> {
        let installations = self.store.list(false).await?;
        let concurrency = self.settings.maintenance_concurrency.max(1);

        let mut reports: Vec<PassReport> = stream::iter(installations)
            .map(|installation| async move {
                let result = self
                    .lifecycle(&installation)
                    .run_pass(&installation, now)
                    .await;
                match result {
                    Ok(outcome) => PassReport {
                        installation_id: installation.id,
                        outcome: Some(outcome),
                        error: None,
                    },
                    Err(err) => {
                        error!(installation_id = installation.id, "maintenance pass failed: {}", err);
                        PassReport {
                            installation_id: installation.id,
                            outcome: None,
                            error: Some(err.to_string()),
                        }
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        reports.sort_by_key(|r| r.installation_id);
        Ok(reports)
    }

    /// Validate an inbound notification and, if it is actionable, hand the
    /// folder off to a background task.
    pub async fn accept_notification(
        &self,
        channel: &ChannelId,
        resource_state: Option<&str>,
    ) -> Result<NotificationAck, NotificationError> {
        let installation = self
            .store
            .get(channel.installation_id)
            .await?
            .ok_or(NotificationError::UnknownInstallation(channel.installation_id))?;

        let encoded = channel.encode();
        let known = self.store.find_channel(&encoded).await?;
        if known.is_none() {
            return Err(NotificationError::UnknownChannel(encoded));
        }
        if !installation.is_serviceable() {
            return Err(NotificationError::NotServiceable {
                id: installation.id,
                status: installation.status,
            });
        }
        if resource_state == Some("sync") {
            return Ok(NotificationAck::Sync);
        }

        let service = self.clone();
        let folder_id = channel.folder_id.clone();
        let installation_id = installation.id;
        tokio::spawn(async move {
            match service
                .handle_change(installation_id, &folder_id, Utc::now())
                .await
            {
                Ok(summary) => info!(
                    installation_id,
                    folder_id = %folder_id,
                    claimed = summary.claimed,
                    skipped = summary.skipped,
                    failed = summary.failed,
                    "change processed"
                ),
                Err(err) => warn!(installation_id, folder_id = %folder_id, "change ignored: {}", err),
            }
        });
        Ok(NotificationAck::Dispatched)
    }

    /// Process a change notification for one watched folder.
    pub async fn handle_change(
        &self,
        installation_id: i64,
        folder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DedupSummary, DedupError> {
        let installation = self
            .store
            .get(installation_id)
            .await?
            .ok_or(DedupError::UnknownInstallation(installation_id))?;
        self.dedup_processor(&installation)
            .process(&installation, folder_id, now)
            .await
    }

    /// Onboard a tenant. The root folder must be visible to the supplied
    /// credentials; it is tagged as a root before the installation is
    /// recorded.
    ///
    /// A root that already belongs to a BLOCKED installation is taken over
    /// with the new creator and credentials, and the next pass retries it.
    /// Any other existing installation keeps the root.
    pub async fn create_installation(&self, values: NewInstallation) -> Result<Installation, AdminError> {
        InstallationStore::validate_new(&values)?;
        let existing = self.store.find_by_root_folder(&values.root_folder_id).await?;
        if let Some(existing) = &existing {
            if existing.status != InstallationStatus::Blocked {
                return Err(StoreError::RootFolderTaken(values.root_folder_id).into());
            }
        }

        let connector = self.connectors.connect(&values.credentials);
        self.prepare_root(connector.as_ref(), &values.root_folder_id)
            .await?;

        let installation = match existing {
            Some(blocked) => {
                let revived = self
                    .store
                    .update(
                        blocked.id,
                        blocked.version,
                        InstallationUpdate::default()
                            .onboarded_by(values.creator, values.credentials)
                            .last_refresh(None),
                    )
                    .await?;
                info!(installation_id = revived.id, "blocked installation onboarded again");
                revived
            }
            None => {
                let created = self.store.create(values).await?;
                info!(
                    installation_id = created.id,
                    root_folder_id = %created.root_folder_id,
                    "installation created"
                );
                created
            }
        };
        Ok(installation)
    }

    async fn prepare_root(
        &self,
        connector: &dyn StorageConnector,
        root_folder_id: &str,
    ) -> Result<(), AdminError> {
        let timeout = self.settings.call_timeout;
        let root = match bounded(timeout, "getting root folder", connector.get(root_folder_id)).await {
            Ok(root) => root,
            Err(ProviderError::NotFound(_)) => {
                return Err(AdminError::InvalidRoot(format!(
                    "root folder `{root_folder_id}` not found or not shared with the service"
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if !root.is_folder() || root.trashed {
            return Err(AdminError::InvalidRoot(format!(
                "`{root_folder_id}` is not a usable folder"
            )));
        }
        bounded(
            timeout,
            "tagging root folder",
            connector.set_properties(
                root_folder_id,
                HashMap::from([(ROOT_PROPERTY.to_string(), "true".to_string())]),
            ),
        )
        .await?;
        Ok(())
    }

    /// Look up an installation by numeric id or by root folder id.
    pub async fn find_installation(&self, ident: &str) -> Result<Option<Installation>, StoreError> {
        if let Ok(id) = ident.parse::<i64>() {
            if let Some(installation) = self.store.get(id).await? {
                return Ok(Some(installation));
            }
        }
        self.store.find_by_root_folder(ident).await
    }

    /// Flag an installation so the next maintenance pass tears it down.
    pub async fn mark_for_termination(&self, id: i64) -> Result<TerminationRequest, LifecycleError> {
        let installation = self.store.require(id).await?;
        match installation.status {
            InstallationStatus::MarkedForTermination => Ok(TerminationRequest {
                installation,
                already_marked: true,
            }),
            InstallationStatus::Terminated => Err(LifecycleError::InvalidTransition {
                id,
                from: installation.status,
                to: InstallationStatus::MarkedForTermination,
            }),
            _ => {
                let updated = self
                    .store
                    .update(
                        id,
                        installation.version,
                        InstallationUpdate::status(InstallationStatus::MarkedForTermination),
                    )
                    .await?;
                info!(installation_id = id, "installation marked for termination");
                Ok(TerminationRequest {
                    installation: updated,
                    already_marked: false,
                })
            }
        }
    }

    pub async fn list_buckets(&self, id: i64) -> Result<Vec<Bucket>, AdminError> {
        let installation = self.store.require(id).await?;
        Ok(self.bucket_manager(&installation).buckets().await?)
    }

    /// Create (or adopt) a bucket and force the next pass to refresh the
    /// installation's watch channels.
    pub async fn create_bucket(
        &self,
        id: i64,
        name: &str,
        action: BucketAction,
        rename_existing: bool,
    ) -> Result<Bucket, AdminError> {
        let installation = self.store.require(id).await?;
        let bucket = self
            .bucket_manager(&installation)
            .create_bucket(name, action, rename_existing, Utc::now().date_naive())
            .await?;
        self.force_refresh(&installation).await?;
        Ok(bucket)
    }

    /// Create every bucket of `pattern`, moving conflicting files aside.
    /// Buckets created before a failure are kept.
    pub async fn apply_pattern(
        &self,
        id: i64,
        pattern: &BucketPattern,
    ) -> Result<Vec<Bucket>, AdminError> {
        pattern.validate()?;
        let installation = self.store.require(id).await?;
        let manager = self.bucket_manager(&installation);
        let today = Utc::now().date_naive();

        let mut buckets = Vec::with_capacity(pattern.buckets.len());
        let mut failure = None;
        for entry in &pattern.buckets {
            match manager
                .create_bucket(&entry.name, entry.action, true, today)
                .await
            {
                Ok(bucket) => buckets.push(bucket),
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if !buckets.is_empty() {
            self.force_refresh(&installation).await?;
        }
        if let Some(err) = failure {
            return Err(err.into());
        }
        info!(installation_id = id, buckets = buckets.len(), "bucket pattern applied");
        Ok(buckets)
    }

    async fn force_refresh(&self, installation: &Installation) -> Result<(), StoreError> {
        self.store
            .update(
                installation.id,
                installation.version,
                InstallationUpdate::default().last_refresh(None),
            )
            .await?;
        Ok(())
    }

    /// Cancel every channel (best effort) and delete the installation.
    pub async fn teardown(&self, id: i64) -> Result<TeardownReport, LifecycleError> {
        let installation = self.store.require(id).await?;
        let (cancelled, failed) = self
            .lifecycle(&installation)
            .release_channels(&installation)
            .await?;
        self.store.delete(id).await?;
        info!(installation_id = id, cancelled, failed, "installation torn down");
        Ok(TeardownReport {
            installation_id: id,
            cancelled,
            failed,
        })
    }
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bucket(#[from] BucketOpError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Pattern(#[from] PatternError),
    #[error("invalid root folder: {0}")]
    InvalidRoot(String),
}
