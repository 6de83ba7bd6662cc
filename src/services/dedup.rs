//! src/services/dedup.rs
//!
//! ChangeDedupProcessor: turns a "something changed in this folder"
//! notification into at most one dispatch per file.
//!
//! A file is claimed by stamping it with the `dof_initiated_at` marker
//! before it is dispatched; a marker younger than the suppression window
//! means another notification already claimed it. The provider offers no
//! conditional property write, so two overlapping listings can both claim
//! the same file: delivery is at least once.

use super::{
    bounded,
    buckets::{BucketManager, BucketOpError},
    dispatcher::ClassificationDispatcher,
    installation_store::StoreError,
};
use crate::{
    connectors::{FileQuery, ProviderError, StorageConnector},
    models::{
        bucket::BucketAction,
        installation::{Installation, InstallationStatus},
        marker::{ChangeMarker, INITIATED_AT_PROPERTY},
    },
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{debug, error, info};

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("installation `{0}` not found")]
    UnknownInstallation(i64),
    #[error("installation `{id}` is not in service ({status})")]
    NotServiceable {
        id: i64,
        status: InstallationStatus,
    },
    #[error(transparent)]
    Bucket(#[from] BucketOpError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Per-notification tally.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupSummary {
    /// Files claimed and dispatched without error.
    pub claimed: usize,
    /// Files still inside another claim's suppression window.
    pub skipped: usize,
    /// Files whose claim or dispatch failed.
    pub failed: usize,
}

pub struct ChangeDedupProcessor {
    connector: Arc<dyn StorageConnector>,
    buckets: BucketManager,
    dispatcher: ClassificationDispatcher,
    call_timeout: Duration,
}

impl ChangeDedupProcessor {
    pub fn new(
        connector: Arc<dyn StorageConnector>,
        buckets: BucketManager,
        dispatcher: ClassificationDispatcher,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            buckets,
            dispatcher,
            call_timeout,
        }
    }

    pub async fn process(
        &self,
        installation: &Installation,
        folder_id: &str,
        now: DateTime<Utc>,
    ) -> Result<DedupSummary, DedupError> {
        if !installation.is_serviceable() {
            return Err(DedupError::NotServiceable {
                id: installation.id,
                status: installation.status,
            });
        }

        let bucket = self.buckets.resolve(folder_id).await?;
        match bucket.action {
            BucketAction::None => {
                debug!(folder_id, "bucket has no action");
                return Ok(DedupSummary::default());
            }
            BucketAction::Classify => {}
        }

        let files = bounded(
            self.call_timeout,
            "listing bucket contents",
            self.connector
                .list(&FileQuery::children_of(folder_id).excluding_folders()),
        )
        .await?;

        let mut summary = DedupSummary::default();
        for file in &files {
            if ChangeMarker::read(file).is_some_and(|m| m.suppresses(now)) {
                debug!(file_id = %file.id, "recently claimed, skipping");
                summary.skipped += 1;
                continue;
            }

            let marker = HashMap::from([(
                INITIATED_AT_PROPERTY.to_string(),
                ChangeMarker::new(now).to_property_value(),
            )]);
            if let Err(err) = bounded(
                self.call_timeout,
                "claiming file",
                self.connector.set_properties(&file.id, marker),
            )
            .await
            {
                error!(file_id = %file.id, folder_id, "could not claim file: {}", err);
                summary.failed += 1;
                continue;
            }

            match self.dispatcher.dispatch(&bucket, file).await {
                Ok(outcome) => {
                    debug!(file_id = %file.id, ?outcome, "dispatched");
                    summary.claimed += 1;
                }
                Err(err) => {
                    error!(
                        file_id = %file.id,
                        folder_id,
                        error_kind = err.kind(),
                        "dispatch failed: {}", err
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(
            installation_id = installation.id,
            folder_id,
            files = files.len(),
            "folder processed"
        );
        Ok(summary)
    }
}
