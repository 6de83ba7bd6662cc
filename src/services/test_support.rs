//! src/services/test_support.rs
//!
//! Shared fixtures for service tests: an in-memory store, a `MemoryDrive`
//! with a small bucket layout and an `IntakeService` wired to stubs.

use super::{
    installation_store::InstallationStore,
    intake_service::{Collaborators, IntakeService, PipelineSettings},
};
use crate::{
    connectors::{
        memory::{
            MemoryConnectorFactory, MemoryDrive, PassthroughRasterizer, StubClassifier, StubOcr,
        },
        pdf::PdfRasterizer,
    },
    models::installation::{Installation, NewInstallation},
};
use chrono::{TimeDelta, Utc};
use std::{sync::Arc, time::Duration};
use tempfile::TempDir;

pub const ROOT: &str = "1RootFolderAbcdefghijklmnopq";

pub struct Harness {
    pub store: InstallationStore,
    pub drive: MemoryDrive,
    pub service: IntakeService,
    pub classifier: Arc<StubClassifier>,
    scratch: TempDir,
}

/// Root with one watched inbox and two plain buckets.
pub fn standard_layout(drive: &MemoryDrive) {
    drive.add_folder(ROOT, "Dropfolder", None, None);
    drive.add_folder("inbox", "Inbox", Some(ROOT), Some("classify"));
    drive.add_folder("receipts", "Receipts", Some(ROOT), Some("none"));
    drive.add_folder("taxes", "Taxes", Some(ROOT), Some("none"));
}

pub fn settings(scratch: &TempDir) -> PipelineSettings {
    PipelineSettings {
        webhook_url: "https://intake.example.com/webhook".into(),
        refresh_interval: TimeDelta::hours(12),
        call_timeout: Duration::from_secs(5),
        maintenance_concurrency: 4,
        scratch_dir: scratch.path().to_path_buf(),
    }
}

impl Harness {
    pub async fn new() -> Self {
        Self::build(standard_layout, StubClassifier::default(), Some("extracted text"), None).await
    }

    /// Start from an empty drive laid out by `setup`.
    pub async fn with_drive(setup: impl FnOnce(&MemoryDrive)) -> Self {
        Self::build(setup, StubClassifier::default(), Some("extracted text"), None).await
    }

    /// Standard layout with a scripted classifier; `ocr_text: None` makes
    /// text extraction fail.
    pub async fn with_classifier(classifier: StubClassifier, ocr_text: Option<&str>) -> Self {
        Self::build(standard_layout, classifier, ocr_text, None).await
    }

    /// Standard layout with a specific PDF rasterizer.
    pub async fn with_rasterizer(rasterizer: Arc<dyn PdfRasterizer>) -> Self {
        Self::build(
            standard_layout,
            StubClassifier::default(),
            Some("extracted text"),
            Some(rasterizer),
        )
        .await
    }

    async fn build(
        setup: impl FnOnce(&MemoryDrive),
        classifier: StubClassifier,
        ocr_text: Option<&str>,
        rasterizer: Option<Arc<dyn PdfRasterizer>>,
    ) -> Self {
        let drive = MemoryDrive::new();
        setup(&drive);
        let rasterizer: Arc<dyn PdfRasterizer> = match rasterizer {
            Some(rasterizer) => rasterizer,
            None => Arc::new(PassthroughRasterizer),
        };

        let store = InstallationStore::open_in_memory().await;
        let scratch = tempfile::tempdir().unwrap();
        let classifier = Arc::new(classifier);
        let service = IntakeService::new(
            store.clone(),
            Arc::new(MemoryConnectorFactory {
                drive: drive.clone(),
            }),
            Collaborators {
                text_extractor: Some(Arc::new(StubOcr {
                    text: ocr_text.map(String::from),
                })),
                classifier: classifier.clone(),
                rasterizer,
            },
            settings(&scratch),
        );

        Self {
            store,
            drive,
            service,
            classifier,
            scratch,
        }
    }

    /// A fresh READY installation rooted at `ROOT`.
    pub async fn installation(&self) -> Installation {
        self.service
            .create_installation(NewInstallation {
                creator: "owner@example.com".into(),
                root_folder_id: ROOT.into(),
                credentials: "test-token".into(),
            })
            .await
            .unwrap()
    }

    /// An installation that has been through its first maintenance pass.
    pub async fn in_service(&self) -> Installation {
        let installation = self.installation().await;
        self.service
            .maintain(installation.id, Utc::now())
            .await
            .unwrap();
        self.store.require(installation.id).await.unwrap()
    }

    pub fn scratch_entries(&self) -> usize {
        std::fs::read_dir(self.scratch.path()).unwrap().count()
    }
}
