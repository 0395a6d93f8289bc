use crate::state::ReportStatus;
use labflow_uuid::RecordId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: ReportStatus, to: ReportStatus },
    #[error("stale state: expected {expected}, found {actual}")]
    StaleState {
        expected: ReportStatus,
        actual: ReportStatus,
    },
    #[error("projection invariant violated: {0}")]
    ProjectionInvariantViolation(String),
    #[error("report {0} has no valid intermediate version")]
    NoValidVersion(RecordId),
    #[error("storage error: {0}")]
    Storage(String),

    #[error("FHIR error: {0}")]
    Fhir(#[from] fhir::FhirError),
    #[error("failed to serialize payload: {0}")]
    Serialization(serde_json::Error),
    #[error("failed to deserialize YAML: {0}")]
    YamlDeserialization(serde_yaml::Error),
    #[error("failed to read file: {0}")]
    FileRead(std::io::Error),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Stable machine-readable reason a report ended up `failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    ExtractionFailed,
    SchemaValidationFailed,
    BundleGenerationFailed,
    ProjectionInvariantViolation,
    ProcessingError,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ExtractionFailed => "extraction_failed",
            ErrorCode::SchemaValidationFailed => "schema_validation_failed",
            ErrorCode::BundleGenerationFailed => "bundle_generation_failed",
            ErrorCode::ProjectionInvariantViolation => "projection_invariant_violation",
            ErrorCode::ProcessingError => "processing_error",
        }
    }

    /// Error code recorded when bundle generation fails with `err`.
    pub fn for_bundle_failure(err: &CoreError) -> Self {
        match err {
            CoreError::ProjectionInvariantViolation(_) => ErrorCode::ProjectionInvariantViolation,
            CoreError::NoValidVersion(_) => ErrorCode::SchemaValidationFailed,
            _ => ErrorCode::BundleGenerationFailed,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
