//! src/services/dispatcher.rs
//!
//! ClassificationDispatcher: routes one claimed file to the bucket the
//! classifier picks for it.

use super::{
    bounded,
    buckets::{BucketManager, BucketOpError},
    intake_service::{Collaborators, PipelineSettings},
};
use crate::{
    connectors::{ProviderError, StorageConnector},
    models::{bucket::Bucket, drive_file::DriveFile},
};
use bytes::Bytes;
use serde::Serialize;
use std::{io, sync::Arc};
use thiserror::Error;
use tracing::{debug, info, warn};

const PDF_MIME_TYPE: &str = "application/pdf";
const PNG_MIME_TYPE: &str = "image/png";

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("file `{file_id}` has unsupported type `{mime_type}`; only images and PDFs are classified")]
    UnsupportedMimeType { file_id: String, mime_type: String },
    #[error("classifier chose `{0}`, which is not a bucket of this installation")]
    DestinationNotFound(String),
    #[error("classifier chose `{0}`, which names more than one bucket")]
    AmbiguousDestination(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Bucket(BucketOpError),
    #[error("scratch file: {0}")]
    Scratch(#[from] io::Error),
}

impl DispatchError {
    /// Coarse error class used in log fields.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Provider(ProviderError::Authorization(_)) => "authorization",
            Self::Provider(ProviderError::NotFound(_)) => "not_found",
            Self::Provider(ProviderError::Transport(_) | ProviderError::Timeout(_)) => "unexpected",
            Self::Scratch(_) => "unexpected",
            _ => "application",
        }
    }
}

impl From<BucketOpError> for DispatchError {
    fn from(err: BucketOpError) -> Self {
        match err {
            BucketOpError::Provider(err) => Self::Provider(err),
            BucketOpError::NoSuchBucket(name) => Self::DestinationNotFound(name),
            BucketOpError::Ambiguous(name) => Self::AmbiguousDestination(name),
            other => Self::Bucket(other),
        }
    }
}

/// What happened to a dispatched file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Moved { to: String },
    /// The classifier declined to pick a bucket.
    NoDestination,
    /// The classifier picked the bucket the file is already in.
    AlreadyInPlace,
}

pub struct ClassificationDispatcher {
    connector: Arc<dyn StorageConnector>,
    buckets: BucketManager,
    collaborators: Collaborators,
    settings: Arc<PipelineSettings>,
}

impl ClassificationDispatcher {
    pub fn new(
        connector: Arc<dyn StorageConnector>,
        buckets: BucketManager,
        collaborators: Collaborators,
        settings: Arc<PipelineSettings>,
    ) -> Self {
        Self {
            connector,
            buckets,
            collaborators,
            settings,
        }
    }

    /// Classify `file` (currently in `source`) and move it to the chosen
    /// bucket.
    pub async fn dispatch(
        &self,
        source: &Bucket,
        file: &DriveFile,
    ) -> Result<DispatchOutcome, DispatchError> {
        let is_pdf = file.mime_type == PDF_MIME_TYPE;
        let image_type = image_mime_type(&file.mime_type);
        if !is_pdf && image_type.is_none() {
            return Err(DispatchError::UnsupportedMimeType {
                file_id: file.id.clone(),
                mime_type: file.mime_type.clone(),
            });
        }

        let contents = bounded(
            self.settings.call_timeout,
            "downloading file",
            self.connector.download(&file.id),
        )
        .await?;
        let (image, mime_type) = match image_type {
            Some(mime_type) => (contents.to_vec(), mime_type),
            None => (self.flatten_pdf(contents).await?, PNG_MIME_TYPE),
        };

        let text = self.extract_text(file, &image, mime_type).await;

        let candidates: Vec<String> = self
            .buckets
            .buckets()
            .await?
            .into_iter()
            .map(|b| b.name)
            .collect();
        let classification = bounded(
            self.settings.call_timeout,
            "classifying document",
            self.collaborators
                .classifier
                .classify(&image, mime_type, &text, &candidates),
        )
        .await?;

        let Some(destination) = classification.destination() else {
            info!(file_id = %file.id, "classifier chose no destination");
            return Ok(DispatchOutcome::NoDestination);
        };
        let target = self.buckets.find_by_name(destination).await?;
        if target.folder_id == source.folder_id {
            debug!(file_id = %file.id, bucket = %target.name, "already in chosen bucket");
            return Ok(DispatchOutcome::AlreadyInPlace);
        }

        bounded(
            self.settings.call_timeout,
            "moving file",
            self.connector
                .move_file(&file.id, &source.folder_id, &target.folder_id),
        )
        .await?;
        info!(
            file_id = %file.id,
            from = %source.name,
            to = %target.name,
            "file classified"
        );
        Ok(DispatchOutcome::Moved { to: target.name })
    }

    /// Spool a PDF to a scratch file and flatten it into a single PNG. The
    /// scratch file is removed when this returns, on success or failure.
    async fn flatten_pdf(&self, contents: Bytes) -> Result<Vec<u8>, DispatchError> {
        let scratch = tempfile::Builder::new()
            .prefix("dof-")
            .suffix(".pdf")
            .tempfile_in(&self.settings.scratch_dir)?;
        tokio::fs::write(scratch.path(), &contents).await?;
        let image = bounded(
            self.settings.call_timeout,
            "flattening PDF",
            self.collaborators.rasterizer.flatten(scratch.path()),
        )
        .await?;
        Ok(image)
    }

    /// OCR is best effort: any failure degrades to no text.
    async fn extract_text(&self, file: &DriveFile, image: &[u8], mime_type: &str) -> String {
        let Some(extractor) = &self.collaborators.text_extractor else {
            return String::new();
        };
        match bounded(
            self.settings.call_timeout,
            "extracting text",
            extractor.extract_text(image, mime_type),
        )
        .await
        {
            Ok(text) => text,
            Err(err) => {
                warn!(file_id = %file.id, "text extraction failed, classifying without text: {}", err);
                String::new()
            }
        }
    }
}

/// Image types the classifier accepts as they are.
fn image_mime_type(mime_type: &str) -> Option<&'static str> {
    match mime_type {
        "image/jpeg" | "image/jpg" => Some("image/jpeg"),
        "image/png" => Some(PNG_MIME_TYPE),
        "image/gif" => Some("image/gif"),
        "image/webp" => Some("image/webp"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connectors::memory::{FailingRasterizer, StubClassifier},
        models::installation::Installation,
        services::test_support::Harness,
    };

    async fn dispatch(h: &Harness, inst: &Installation, file_id: &str) -> Result<DispatchOutcome, DispatchError> {
        let inbox = h.service.bucket_manager(inst).resolve("inbox").await.unwrap();
        let file = h.drive.file(file_id).unwrap();
        h.service.dispatcher(inst).dispatch(&inbox, &file).await
    }

    #[tokio::test]
    async fn moves_image_to_chosen_bucket() {
        let h = Harness::with_classifier(StubClassifier::default().route("receipt.jpg", Some("Receipts")), Some("ACME total 12.00")).await;
        h.drive.add_file("f1", "receipt.jpg", "image/jpeg", "inbox");
        let inst = h.installation().await;

        assert_eq!(
            dispatch(&h, &inst, "f1").await.unwrap(),
            DispatchOutcome::Moved { to: "Receipts".into() }
        );
        assert_eq!(h.drive.file("f1").unwrap().parent_ids, vec!["receipts".to_string()]);
        assert_eq!(h.classifier.seen_text(), vec!["ACME total 12.00".to_string()]);
    }

    #[tokio::test]
    async fn pdf_is_flattened_through_a_removed_scratch_file() {
        let h = Harness::with_classifier(StubClassifier::default().route("return.pdf", Some("Taxes")), None).await;
        h.drive.add_file("f1", "return.pdf", "application/pdf", "inbox");
        let inst = h.installation().await;

        assert_eq!(
            dispatch(&h, &inst, "f1").await.unwrap(),
            DispatchOutcome::Moved { to: "Taxes".into() }
        );
        assert_eq!(h.scratch_entries(), 0);
    }

    #[tokio::test]
    async fn scratch_file_is_removed_when_flattening_fails() {
        let h = Harness::with_rasterizer(Arc::new(FailingRasterizer)).await;
        h.drive.add_file("f1", "broken.pdf", "application/pdf", "inbox");
        let inst = h.installation().await;

        let err = dispatch(&h, &inst, "f1").await.unwrap_err();
        assert!(matches!(err, DispatchError::Provider(ProviderError::Application(_))));
        assert_eq!(h.scratch_entries(), 0);
        assert!(h.classifier.seen_text().is_empty());
        assert_eq!(h.drive.file("f1").unwrap().parent_ids, vec!["inbox".to_string()]);
    }

    #[tokio::test]
    async fn ocr_failure_degrades_to_empty_text() {
        let h = Harness::with_classifier(StubClassifier::default().route("a.png", Some("Taxes")), None).await;
        h.drive.add_file("f1", "a.png", "image/png", "inbox");
        let inst = h.installation().await;

        dispatch(&h, &inst, "f1").await.unwrap();
        assert_eq!(h.classifier.seen_text(), vec![String::new()]);
    }

    #[tokio::test]
    async fn no_destination_leaves_file_alone() {
        let h = Harness::with_classifier(StubClassifier::default().route("a.png", Some(" none ")), None).await;
        h.drive.add_file("f1", "a.png", "image/png", "inbox");
        let inst = h.installation().await;

        assert_eq!(dispatch(&h, &inst, "f1").await.unwrap(), DispatchOutcome::NoDestination);
        assert_eq!(h.drive.file("f1").unwrap().parent_ids, vec!["inbox".to_string()]);
    }

    #[tokio::test]
    async fn destination_equal_to_source_is_a_no_op() {
        let h = Harness::with_classifier(StubClassifier::default().route("a.png", Some("Inbox")), None).await;
        h.drive.add_file("f1", "a.png", "image/png", "inbox");
        let inst = h.installation().await;

        assert_eq!(dispatch(&h, &inst, "f1").await.unwrap(), DispatchOutcome::AlreadyInPlace);
    }

    #[tokio::test]
    async fn unknown_or_ambiguous_destinations_are_application_errors() {
        let h = Harness::with_classifier(
            StubClassifier::default()
                .route("a.png", Some("Invoices"))
                .route("b.png", Some("Taxes")),
            None,
        )
        .await;
        h.drive.add_file("a", "a.png", "image/png", "inbox");
        h.drive.add_file("b", "b.png", "image/png", "inbox");
        h.drive.add_folder("taxes-2", "Taxes", Some(crate::services::test_support::ROOT), Some("none"));
        let inst = h.installation().await;

        let err = dispatch(&h, &inst, "a").await.unwrap_err();
        assert!(matches!(err, DispatchError::DestinationNotFound(ref name) if name == "Invoices"));
        assert_eq!(err.kind(), "application");
        assert!(matches!(
            dispatch(&h, &inst, "b").await,
            Err(DispatchError::AmbiguousDestination(_))
        ));
    }

    #[tokio::test]
    async fn unsupported_types_are_rejected_before_download() {
        let h = Harness::new().await;
        h.drive.add_file("f1", "notes.txt", "text/plain", "inbox");
        h.drive.fail_download_of("f1");
        let inst = h.installation().await;

        let err = dispatch(&h, &inst, "f1").await.unwrap_err();
        assert!(matches!(err, DispatchError::UnsupportedMimeType { .. }));
        assert!(h.classifier.seen_text().is_empty());
    }

    #[tokio::test]
    async fn image_types_the_classifier_cannot_read_are_rejected() {
        let h = Harness::new().await;
        h.drive.add_file("tiff", "scan.tiff", "image/tiff", "inbox");
        h.drive.add_file("heic", "photo.heic", "image/heic", "inbox");
        let inst = h.installation().await;

        for id in ["tiff", "heic"] {
            let err = dispatch(&h, &inst, id).await.unwrap_err();
            assert!(matches!(err, DispatchError::UnsupportedMimeType { ref mime_type, .. } if mime_type.starts_with("image/")));
        }
        assert!(h.classifier.seen_text().is_empty());
    }
}
