//! src/services/installation_store.rs
//!
//! InstallationStore: durable state for installations and the watch
//! channels opened on their behalf, kept in SQLite. Every installation update
//! is a compare-and-set on the row's `version`, so two writers working from
//! the same snapshot cannot both succeed.

use crate::models::{
    channel::{WatchChannel, is_drive_id},
    installation::{Installation, InstallationStatus, NewInstallation},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, SqlitePool, sqlite::Sqlite};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Schema applied by `migrate`.
pub const MIGRATION_SQL: &str = include_str!("../../migrations/0001_init.sql");

const INSTALLATION_COLUMNS: &str =
    "id, creator, root_folder_id, credentials, status, last_refresh, created_at, version";
const CHANNEL_COLUMNS: &str = "installation_id, folder_id, channel_id, resource_id, created_at";

const ROOT_FOLDER_ID_MIN_LEN: usize = 25;
const ROOT_FOLDER_ID_MAX_LEN: usize = 60;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("installation `{0}` not found")]
    NotFound(i64),
    #[error("root folder `{0}` already belongs to an installation")]
    RootFolderTaken(String),
    #[error("installation `{0}` was modified concurrently")]
    VersionConflict(i64),
    #[error("invalid installation: {0}")]
    Invalid(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Field changes applied by [`InstallationStore::update`]. `None` leaves a
/// field untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct InstallationUpdate {
    pub status: Option<InstallationStatus>,
    pub last_refresh: Option<Option<DateTime<Utc>>>,
    pub creator: Option<String>,
    pub credentials: Option<String>,
}

impl InstallationUpdate {
    pub fn status(status: InstallationStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn last_refresh(mut self, at: Option<DateTime<Utc>>) -> Self {
        self.last_refresh = Some(at);
        self
    }

    /// Replace who onboarded the installation and the credential it uses.
    pub fn onboarded_by(mut self, creator: impl Into<String>, credentials: impl Into<String>) -> Self {
        self.creator = Some(creator.into());
        self.credentials = Some(credentials.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct InstallationStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

impl InstallationStore {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    /// Apply the embedded schema. Safe to run repeatedly.
    pub async fn migrate(&self) -> StoreResult<()> {
        let statements = MIGRATION_SQL
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        debug!("Running {} migration statements...", statements.len());
        for stmt in statements {
            sqlx::query(stmt).execute(&*self.db).await?;
        }
        Ok(())
    }

    /// Cheap connectivity check used by readiness.
    pub async fn ping(&self) -> StoreResult<i64> {
        Ok(sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?)
    }

    /// Field checks applied by [`create`](Self::create); callers can run
    /// them before doing any provider work.
    pub fn validate_new(values: &NewInstallation) -> StoreResult<()> {
        ensure_creator_valid(&values.creator)?;
        ensure_root_folder_id_valid(&values.root_folder_id)?;
        if values.credentials.trim().is_empty() {
            return Err(StoreError::Invalid("credentials may not be empty".into()));
        }
        Ok(())
    }

    pub async fn create(&self, values: NewInstallation) -> StoreResult<Installation> {
        Self::validate_new(&values)?;

        let query = format!(
            "INSERT INTO installations
                (creator, root_folder_id, credentials, status, last_refresh, created_at, version)
             VALUES (?, ?, ?, ?, NULL, ?, 1)
             RETURNING {INSTALLATION_COLUMNS}"
        );
        sqlx::query_as::<_, Installation>(&query)
            .bind(&values.creator)
            .bind(&values.root_folder_id)
            .bind(&values.credentials)
            .bind(InstallationStatus::Ready)
            .bind(Utc::now())
            .fetch_one(&*self.db)
            .await
            .map_err(|err| {
                if is_unique_violation(&err) {
                    StoreError::RootFolderTaken(values.root_folder_id.clone())
                } else {
                    StoreError::Sqlx(err)
                }
            })
    }

    pub async fn get(&self, id: i64) -> StoreResult<Option<Installation>> {
        let query = format!("SELECT {INSTALLATION_COLUMNS} FROM installations WHERE id = ?");
        Ok(sqlx::query_as::<_, Installation>(&query)
            .bind(id)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Like [`get`](Self::get) but a missing row is an error.
    pub async fn require(&self, id: i64) -> StoreResult<Installation> {
        self.get(id).await?.ok_or(StoreError::NotFound(id))
    }

    pub async fn find_by_root_folder(&self, root_folder_id: &str) -> StoreResult<Option<Installation>> {
        let query =
            format!("SELECT {INSTALLATION_COLUMNS} FROM installations WHERE root_folder_id = ?");
        Ok(sqlx::query_as::<_, Installation>(&query)
            .bind(root_folder_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    pub async fn list(&self, include_terminated: bool) -> StoreResult<Vec<Installation>> {
        let mut builder = QueryBuilder::<Sqlite>::new(format!(
            "SELECT {INSTALLATION_COLUMNS} FROM installations"
        ));
        if !include_terminated {
            builder.push(" WHERE status != ");
            builder.push_bind(InstallationStatus::Terminated);
        }
        builder.push(" ORDER BY id ASC");
        Ok(builder.build_query_as().fetch_all(&*self.db).await?)
    }

    /// Apply `changes` if the row is still at `expected_version`.
    ///
    /// Returns the updated installation, `VersionConflict` if another writer
    /// got there first, or `NotFound` if the row is gone.
    pub async fn update(
        &self,
        id: i64,
        expected_version: i64,
        changes: InstallationUpdate,
    ) -> StoreResult<Installation> {
        let mut builder =
            QueryBuilder::<Sqlite>::new("UPDATE installations SET version = version + 1");
        if let Some(status) = changes.status {
            builder.push(", status = ");
            builder.push_bind(status);
        }
        if let Some(last_refresh) = changes.last_refresh {
            builder.push(", last_refresh = ");
            builder.push_bind(last_refresh);
        }
        if let Some(creator) = changes.creator {
            builder.push(", creator = ");
            builder.push_bind(creator);
        }
        if let Some(credentials) = changes.credentials {
            builder.push(", credentials = ");
            builder.push_bind(credentials);
        }
        builder.push(" WHERE id = ");
        builder.push_bind(id);
        builder.push(" AND version = ");
        builder.push_bind(expected_version);
        builder.push(" RETURNING ");
        builder.push(INSTALLATION_COLUMNS);

        let updated: Option<Installation> =
            builder.build_query_as().fetch_optional(&*self.db).await?;
        match updated {
            Some(installation) => Ok(installation),
            None if self.get(id).await?.is_some() => Err(StoreError::VersionConflict(id)),
            None => Err(StoreError::NotFound(id)),
        }
    }

    /// Remove an installation and its channel records for good.
    pub async fn delete(&self, id: i64) -> StoreResult<()> {
        let mut tx = self.db.begin().await?;
        sqlx::query("DELETE FROM watch_channels WHERE installation_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let deleted = sqlx::query("DELETE FROM installations WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if deleted == 0 {
            return Err(StoreError::NotFound(id));
        }
        tx.commit().await?;
        debug!(installation_id = id, "installation row deleted");
        Ok(())
    }

    pub async fn channels(&self, installation_id: i64) -> StoreResult<Vec<WatchChannel>> {
        let query = format!(
            "SELECT {CHANNEL_COLUMNS} FROM watch_channels
             WHERE installation_id = ? ORDER BY folder_id ASC"
        );
        Ok(sqlx::query_as::<_, WatchChannel>(&query)
            .bind(installation_id)
            .fetch_all(&*self.db)
            .await?)
    }

    pub async fn find_channel(&self, channel_id: &str) -> StoreResult<Option<WatchChannel>> {
        let query = format!("SELECT {CHANNEL_COLUMNS} FROM watch_channels WHERE channel_id = ?");
        Ok(sqlx::query_as::<_, WatchChannel>(&query)
            .bind(channel_id)
            .fetch_optional(&*self.db)
            .await?)
    }

    /// Record (or replace) the channel for `(installation_id, folder_id)`.
    pub async fn save_channel(&self, channel: &WatchChannel) -> StoreResult<()> {
        sqlx::query(
            "INSERT INTO watch_channels
                (installation_id, folder_id, channel_id, resource_id, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(installation_id, folder_id) DO UPDATE SET
                channel_id = excluded.channel_id,
                resource_id = excluded.resource_id,
                created_at = excluded.created_at",
        )
        .bind(channel.installation_id)
        .bind(&channel.folder_id)
        .bind(&channel.channel_id)
        .bind(&channel.resource_id)
        .bind(channel.created_at)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    pub async fn delete_channel(&self, installation_id: i64, folder_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM watch_channels WHERE installation_id = ? AND folder_id = ?")
            .bind(installation_id)
            .bind(folder_id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    /// Open a private in-memory database with the schema applied.
    #[cfg(test)]
    pub async fn open_in_memory() -> Self {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        let store = Self::new(Arc::new(pool));
        store.migrate().await.expect("schema");
        store
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

fn ensure_creator_valid(creator: &str) -> StoreResult<()> {
    let valid = match creator.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty()
                && local
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "_.+-".contains(c))
                && domain.contains('.')
                && !domain.starts_with('.')
                && !domain.ends_with('.')
                && domain
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!("invalid email address: {creator}")))
    }
}

fn ensure_root_folder_id_valid(root_folder_id: &str) -> StoreResult<()> {
    let len = root_folder_id.len();
    if is_drive_id(root_folder_id)
        && (ROOT_FOLDER_ID_MIN_LEN..=ROOT_FOLDER_ID_MAX_LEN).contains(&len)
    {
        Ok(())
    } else {
        Err(StoreError::Invalid(format!(
            "invalid Drive folder id: {root_folder_id}"
        )))
    }
}
