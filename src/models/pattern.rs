//! Bucket patterns: a named set of buckets, modelling one kind of business,
//! applied to an installation in one go.
//!
//! A pattern is a JSON array:
//!
//! ```json
//! [
//!   { "name": "Inbox", "action": "classify" },
//!   { "name": "Receipts" }
//! ]
//! ```
//!
//! `action` defaults to `none`.

use crate::models::bucket::{BucketAction, BucketError, ensure_bucket_name_valid};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("pattern is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("pattern names no buckets")]
    Empty,
    #[error(transparent)]
    Invalid(#[from] BucketError),
    #[error("pattern names bucket `{0}` more than once")]
    Duplicate(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PatternBucket {
    pub name: String,
    #[serde(default = "no_action")]
    pub action: BucketAction,
}

fn no_action() -> BucketAction {
    BucketAction::None
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(transparent)]
pub struct BucketPattern {
    pub buckets: Vec<PatternBucket>,
}

impl BucketPattern {
    pub fn from_json(raw: &str) -> Result<Self, PatternError> {
        let pattern: Self = serde_json::from_str(raw)?;
        pattern.validate()?;
        Ok(pattern)
    }

    pub fn validate(&self) -> Result<(), PatternError> {
        if self.buckets.is_empty() {
            return Err(PatternError::Empty);
        }
        let mut seen = HashSet::new();
        for bucket in &self.buckets {
            ensure_bucket_name_valid(&bucket.name)?;
            if !seen.insert(bucket.name.as_str()) {
                return Err(PatternError::Duplicate(bucket.name.clone()));
            }
        }
        Ok(())
    }
}
