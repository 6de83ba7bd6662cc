//! Core data models for the intake service.
//!
//! Installations and watch channels are persisted in SQLite via
//! `sqlx::FromRow`. Buckets, files and change markers live in the storage
//! provider and are only mirrored here as plain values.

pub mod bucket;
pub mod channel;
pub mod drive_file;
pub mod installation;
pub mod marker;
pub mod pattern;
