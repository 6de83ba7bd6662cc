//! Represents an installation: one tenant rooted at a Drive folder.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;

/// Lifecycle status of an installation.
///
/// `Ready` is the initial state and `Terminated` is terminal. Only the
/// lifecycle manager and the administrative termination request move an
/// installation between states.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, sqlx::Type)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[sqlx(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallationStatus {
    Ready,
    InService,
    MarkedForTermination,
    Terminated,
    Blocked,
}

impl InstallationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstallationStatus::Ready => "READY",
            InstallationStatus::InService => "IN_SERVICE",
            InstallationStatus::MarkedForTermination => "MARKED_FOR_TERMINATION",
            InstallationStatus::Terminated => "TERMINATED",
            InstallationStatus::Blocked => "BLOCKED",
        }
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// Staying in the same status is always allowed, except that nothing
    /// leaves `Terminated`.
    pub fn can_transition_to(self, next: InstallationStatus) -> bool {
        use InstallationStatus::*;
        if self == next {
            return true;
        }
        match self {
            Ready => matches!(next, InService | Blocked | MarkedForTermination),
            InService => matches!(next, Blocked | MarkedForTermination),
            Blocked => matches!(next, InService | MarkedForTermination),
            MarkedForTermination => matches!(next, Terminated),
            Terminated => false,
        }
    }
}

impl fmt::Display for InstallationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A tenant of the intake service.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct Installation {
    /// Internal identifier.
    pub id: i64,

    /// Email address of the user who onboarded this installation.
    pub creator: String,

    /// Drive id of the root folder. Unique across installations.
    pub root_folder_id: String,

    /// Opaque access credential handed to the storage connector.
    #[serde(skip_serializing)]
    pub credentials: String,

    pub status: InstallationStatus,

    /// When watch channels were last successfully (re)created.
    pub last_refresh: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,

    /// Optimistic concurrency counter, bumped on every update.
    pub version: i64,
}

impl Installation {
    /// Notifications are only processed for installations in service.
    pub fn is_serviceable(&self) -> bool {
        self.status == InstallationStatus::InService
    }

    /// True when the watch channels should be recreated at `now`.
    pub fn refresh_due(&self, now: DateTime<Utc>, interval: TimeDelta) -> bool {
        match self.last_refresh {
            Some(last) => now - last >= interval,
            None => true,
        }
    }
}

/// Values accepted when onboarding a new installation.
#[derive(Deserialize, Clone, Debug)]
pub struct NewInstallation {
    pub creator: String,
    pub root_folder_id: String,
    pub credentials: String,
}
