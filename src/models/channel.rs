//! Watch channels and the versioned channel-id scheme.
//!
//! A channel id must let the webhook recover the installation and folder a
//! notification belongs to, so it is derived from exactly those two values:
//!
//! ```text
//! dof1-<installation id>-<folder id>
//! ```
//!
//! Installation ids are decimal integers and Drive folder ids use the
//! alphabet `[A-Za-z0-9_-]`, so splitting on the first two `-` is
//! unambiguous even when the folder id itself contains dashes.

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use thiserror::Error;

const SCHEME_PREFIX: &str = "dof1";

/// Longest lifetime Drive grants a file watch channel. Channels are opened
/// with this expiry, so the refresh interval must stay below it.
pub const CHANNEL_TTL_SECS: u64 = 24 * 60 * 60;

/// Expiry requested for a channel opened at `opened_at`.
pub fn channel_expiry(opened_at: DateTime<Utc>) -> DateTime<Utc> {
    opened_at + TimeDelta::seconds(CHANNEL_TTL_SECS as i64)
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelIdError {
    #[error("channel id `{0}` does not use a supported scheme")]
    UnknownScheme(String),
    #[error("channel id `{0}` has no valid installation id")]
    BadInstallationId(String),
    #[error("channel id `{0}` has no valid folder id")]
    BadFolderId(String),
}

/// Identity of a watch channel: one per (installation, folder).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct ChannelId {
    pub installation_id: i64,
    pub folder_id: String,
}

impl ChannelId {
    pub fn new(installation_id: i64, folder_id: impl Into<String>) -> Self {
        Self {
            installation_id,
            folder_id: folder_id.into(),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}-{}-{}",
            SCHEME_PREFIX, self.installation_id, self.folder_id
        )
    }

    pub fn decode(raw: &str) -> Result<Self, ChannelIdError> {
        let (scheme, rest) = raw
            .split_once('-')
            .ok_or_else(|| ChannelIdError::UnknownScheme(raw.to_string()))?;
        if scheme != SCHEME_PREFIX {
            return Err(ChannelIdError::UnknownScheme(raw.to_string()));
        }

        let (installation, folder_id) = rest
            .split_once('-')
            .ok_or_else(|| ChannelIdError::BadFolderId(raw.to_string()))?;
        if installation.is_empty() || !installation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(ChannelIdError::BadInstallationId(raw.to_string()));
        }
        let installation_id = installation
            .parse::<i64>()
            .ok()
            .filter(|id| *id > 0)
            .ok_or_else(|| ChannelIdError::BadInstallationId(raw.to_string()))?;

        if !is_drive_id(folder_id) {
            return Err(ChannelIdError::BadFolderId(raw.to_string()));
        }

        Ok(Self::new(installation_id, folder_id))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Drive ids are non-empty and URL-safe.
pub fn is_drive_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

/// A watch channel the service believes is open on the provider side.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct WatchChannel {
    pub installation_id: i64,
    pub folder_id: String,
    pub channel_id: String,

    /// Handle returned by the provider when the channel was opened. Without
    /// it the channel cannot be closed and is treated as already gone.
    pub resource_id: Option<String>,

    pub created_at: DateTime<Utc>,
}
