//! src/services/lifecycle.rs
//!
//! LifecycleManager: moves one installation through its status state
//! machine and owns the watch channels of its buckets.
//!
//! ```text
//! READY ──pass──▶ IN_SERVICE ──pass (refresh due)──▶ IN_SERVICE
//!   │                 │
//!   └──channel error──┴──▶ BLOCKED ──pass (retry)──▶ IN_SERVICE | BLOCKED
//!
//! MARKED_FOR_TERMINATION ──pass──▶ TERMINATED
//! ```
//!
//! A transition into service is only recorded once every channel operation
//! of the pass has succeeded; otherwise the installation is recorded as
//! blocked and `last_refresh` keeps its old value. Termination is best
//! effort: cancellation failures are logged and the installation is
//! terminated regardless.

use super::{
    bounded,
    buckets::BucketManager,
    installation_store::{InstallationStore, InstallationUpdate, StoreError},
    intake_service::PipelineSettings,
};
use crate::{
    connectors::{ProviderError, StorageConnector},
    models::{
        bucket::Bucket,
        channel::{ChannelId, WatchChannel, channel_expiry},
        installation::{Installation, InstallationStatus},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashSet, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error("installation `{id}` cannot move from {from} to {to}")]
    InvalidTransition {
        id: i64,
        from: InstallationStatus,
        to: InstallationStatus,
    },
}

/// What one maintenance pass did.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PassOutcome {
    Activated { channels: usize },
    Refreshed { channels: usize },
    /// In service and channels still fresh.
    Idle,
    Blocked { reason: String },
    Terminated { cancelled: usize, failed: usize },
    /// Already terminated; nothing to do.
    Inert,
}

pub struct LifecycleManager {
    store: InstallationStore,
    connector: Arc<dyn StorageConnector>,
    settings: Arc<PipelineSettings>,
}

impl LifecycleManager {
    pub fn new(
        store: InstallationStore,
        connector: Arc<dyn StorageConnector>,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        Self {
            store,
            connector,
            settings,
        }
    }

    /// Evaluate `installation` once and apply whatever transition is due.
    pub async fn run_pass(
        &self,
        installation: &Installation,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome, LifecycleError> {
        use InstallationStatus::*;
        match installation.status {
            Ready | Blocked => self.bring_into_service(installation, now).await,
            InService if installation.refresh_due(now, self.settings.refresh_interval) => {
                self.bring_into_service(installation, now).await
            }
            InService => {
                debug!(installation_id = installation.id, "channels fresh, nothing to do");
                Ok(PassOutcome::Idle)
            }
            MarkedForTermination => self.terminate(installation).await,
            Terminated => Ok(PassOutcome::Inert),
        }
    }

    /// Start, refresh or retry the installation's channels.
    async fn bring_into_service(
        &self,
        installation: &Installation,
        now: DateTime<Utc>,
    ) -> Result<PassOutcome, LifecycleError> {
        let refreshing = installation.status == InstallationStatus::InService;
        info!(
            installation_id = installation.id,
            status = %installation.status,
            "{} service",
            if refreshing { "refreshing" } else { "starting up" }
        );

        match self.sync_channels(installation, now).await {
            Ok(channels) => {
                self.transition(
                    installation,
                    InstallationUpdate::status(InstallationStatus::InService)
                        .last_refresh(Some(now)),
                )
                .await?;
                Ok(if refreshing {
                    PassOutcome::Refreshed { channels }
                } else {
                    PassOutcome::Activated { channels }
                })
            }
            // Provider or store: either way channels may be half synced.
            Err(err) => {
                error!(
                    installation_id = installation.id,
                    "channel maintenance failed, blocking installation: {}", err
                );
                self.transition(
                    installation,
                    InstallationUpdate::status(InstallationStatus::Blocked),
                )
                .await?;
                Ok(PassOutcome::Blocked {
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Make the recorded channel set match the current watched buckets,
    /// cancelling before recreating. Returns the number of open channels.
    async fn sync_channels(
        &self,
        installation: &Installation,
        now: DateTime<Utc>,
    ) -> Result<usize, LifecycleError> {
        let root = bounded(
            self.settings.call_timeout,
            "getting root folder",
            self.connector.get(&installation.root_folder_id),
        )
        .await?;
        if !root.is_folder() || root.trashed {
            return Err(ProviderError::Application(format!(
                "root `{}` is not a usable folder",
                root.id
            ))
            .into());
        }

        let buckets: Vec<Bucket> = BucketManager::new(
            self.connector.clone(),
            &installation.root_folder_id,
            self.settings.call_timeout,
        )
        .buckets()
        .await?
        .into_iter()
        .filter(|b| b.action.is_watched())
        .collect();

        let known = self.store.channels(installation.id).await?;
        let watched: HashSet<&str> = buckets.iter().map(|b| b.folder_id.as_str()).collect();

        for stale in known
            .iter()
            .filter(|c| !watched.contains(c.folder_id.as_str()))
        {
            info!(channel_id = %stale.channel_id, "folder no longer watched");
            self.close_channel(stale).await?;
            self.store
                .delete_channel(installation.id, &stale.folder_id)
                .await?;
        }

        for bucket in &buckets {
            if let Some(existing) = known.iter().find(|c| c.folder_id == bucket.folder_id) {
                self.close_channel(existing).await?;
                self.store
                    .delete_channel(installation.id, &existing.folder_id)
                    .await?;
            }
            self.open_channel(installation, bucket, now).await?;
        }

        Ok(buckets.len())
    }

    async fn open_channel(
        &self,
        installation: &Installation,
        bucket: &Bucket,
        now: DateTime<Utc>,
    ) -> Result<(), LifecycleError> {
        let channel_id = ChannelId::new(installation.id, &bucket.folder_id).encode();
        let resource_id = bounded(
            self.settings.call_timeout,
            "creating watch channel",
            self.connector.create_channel(
                &channel_id,
                &bucket.folder_id,
                &self.settings.webhook_url,
                channel_expiry(now),
            ),
        )
        .await?;
        let channel = WatchChannel {
            installation_id: installation.id,
            folder_id: bucket.folder_id.clone(),
            channel_id,
            resource_id: Some(resource_id),
            created_at: now,
        };
        if let Err(err) = self.store.save_channel(&channel).await {
            // An unrecorded channel could never be cancelled.
            if let Err(cancel_err) = self.close_channel(&channel).await {
                warn!(
                    channel_id = %channel.channel_id,
                    "could not cancel unrecorded channel: {}", cancel_err
                );
            }
            return Err(err.into());
        }
        Ok(())
    }

    /// Cancel a channel on the provider side. Returns whether anything was
    /// actually cancelled: channels without a resource id, or already gone
    /// on the provider side, count as absent.
    async fn close_channel(&self, channel: &WatchChannel) -> Result<bool, ProviderError> {
        let Some(resource_id) = channel.resource_id.as_deref() else {
            debug!(channel_id = %channel.channel_id, "no resource id, nothing to cancel");
            return Ok(false);
        };
        match bounded(
            self.settings.call_timeout,
            "closing watch channel",
            self.connector
                .cancel_channel(&channel.channel_id, resource_id),
        )
        .await
        {
            Ok(()) => Ok(true),
            Err(ProviderError::NotFound(_)) => {
                debug!(channel_id = %channel.channel_id, "channel already gone");
                Ok(false)
            }
            Err(err) => Err(err),
        }
    }

    async fn terminate(&self, installation: &Installation) -> Result<PassOutcome, LifecycleError> {
        info!(installation_id = installation.id, "terminating service");
        let (cancelled, failed) = self.release_channels(installation).await?;

        self.transition(
            installation,
            InstallationUpdate::status(InstallationStatus::Terminated),
        )
        .await?;
        Ok(PassOutcome::Terminated { cancelled, failed })
    }

    /// Cancel every recorded channel and forget it. Cancellation failures are
    /// logged and counted, never returned. Yields `(cancelled, failed)`.
    pub async fn release_channels(
        &self,
        installation: &Installation,
    ) -> Result<(usize, usize), LifecycleError> {
        let mut cancelled = 0;
        let mut failed = 0;

        for channel in self.store.channels(installation.id).await? {
            match self.close_channel(&channel).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(err) => {
                    failed += 1;
                    warn!(
                        installation_id = installation.id,
                        channel_id = %channel.channel_id,
                        "ignoring cancellation failure while releasing channels: {}", err
                    );
                }
            }
            self.store
                .delete_channel(installation.id, &channel.folder_id)
                .await?;
        }
        Ok((cancelled, failed))
    }

    async fn transition(
        &self,
        installation: &Installation,
        changes: InstallationUpdate,
    ) -> Result<Installation, LifecycleError> {
        if let Some(next) = changes.status {
            if !installation.status.can_transition_to(next) {
                return Err(LifecycleError::InvalidTransition {
                    id: installation.id,
                    from: installation.status,
                    to: next,
                });
            }
        }
        Ok(self
            .store
            .update(installation.id, installation.version, changes)
            .await?)
    }
}
