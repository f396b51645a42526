//! Core data models for the migration state.
//!
//! These entities mirror the persisted tables (`objects`, `bucket_status`,
//! `migration_metadata`). Row structs map onto SQLite via `sqlx::FromRow`;
//! the typed records built from them are what the services work with.

pub mod bucket;
pub mod digest;
pub mod metadata;
pub mod object;
pub mod phase;
