//! FHIR R4 wire/boundary support for labflow.
//!
//! This crate provides **wire models** and **render/parse helpers** for the transaction
//! bundle produced from a validated lab report:
//! - Patient, DocumentReference, DiagnosticReport and Observation resources
//! - the enclosing `transaction` Bundle with `PUT <Type>/<id>` entries
//!
//! This crate focuses on:
//! - FHIR JSON serialisation with a fixed field order (rendering is byte-stable)
//! - strict deserialisation (`deny_unknown_fields`, path-bearing error messages)
//! - translation between domain-level carriers and wire structs
//!
//! It knows nothing about how identifiers, codes or defaults are chosen. The caller hands
//! over fully-populated carriers and gets JSON back.

pub mod bundle;
pub mod datatypes;
pub mod diagnostic_report;
pub mod document_reference;
pub mod observation;
pub mod patient;

// Re-export facades
pub use bundle::LabBundle;

// Re-export public domain-level types
pub use bundle::BundleData;
pub use datatypes::{Attachment, CodeableConcept, Coding, Identifier, Quantity, QuantityComparator};
pub use diagnostic_report::DiagnosticReportData;
pub use document_reference::{CompositionStatus, DocumentReferenceData, DocumentReferenceStatus};
pub use observation::{ObservationData, ObservationValue, ResultStatus};
pub use patient::PatientData;

/// Errors returned by the `fhir` boundary crate.
#[derive(Debug, thiserror::Error)]
pub enum FhirError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Type alias for Results that can fail with a [`FhirError`].
pub type FhirResult<T> = Result<T, FhirError>;
