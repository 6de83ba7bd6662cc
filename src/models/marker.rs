//! Per-file change marker used to suppress duplicate notifications.

use crate::models::drive_file::DriveFile;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};

/// File property recording when a file was claimed for processing.
pub const INITIATED_AT_PROPERTY: &str = "dof_initiated_at";

/// How long a claim suppresses further processing of the same file.
pub const SUPPRESSION_WINDOW: TimeDelta = TimeDelta::hours(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChangeMarker {
    pub initiated_at: DateTime<Utc>,
}

impl ChangeMarker {
    pub fn new(initiated_at: DateTime<Utc>) -> Self {
        Self { initiated_at }
    }

    /// Read the marker from a file. An unparseable value counts as absent.
    pub fn read(file: &DriveFile) -> Option<Self> {
        let raw = file.property(INITIATED_AT_PROPERTY)?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|ts| Self::new(ts.with_timezone(&Utc)))
    }

    pub fn suppresses(&self, now: DateTime<Utc>) -> bool {
        now - self.initiated_at < SUPPRESSION_WINDOW
    }

    /// The property value to write when claiming a file.
    pub fn to_property_value(&self) -> String {
        self.initiated_at.to_rfc3339_opts(SecondsFormat::Secs, true)
    }
}
