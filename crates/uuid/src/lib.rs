//! Record identifiers for labflow.
//!
//! Reports, intermediate versions, bundle artifacts and edit-history entries are identified by a
//! random UUID held in a *canonical* form: **32 lowercase hexadecimal characters** (no hyphens).
//!
//! These identifiers are for bookkeeping only. Identifiers that appear inside generated bundles
//! are content-derived and live in `labflow-core`; a [`RecordId`] never reaches bundle content.
//!
//! ## Canonical form
//! - Length: 32
//! - Characters: `0-9` and `a-f` only
//! - Example: `550e8400e29b41d4a716446655440000`
//!
//! Non-canonical values (uppercase, hyphenated, wrong length, non-hex) are rejected by
//! [`RecordId::parse`].

mod record_id;

pub use record_id::{RecordId, Uuid};

/// Error type for identifier operations.
#[derive(Debug, thiserror::Error)]
pub enum UuidError {
    /// Invalid input provided
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Result type for identifier operations.
pub type UuidResult<T> = Result<T, UuidError>;
