//! # labflow Core
//!
//! Deterministic processing core for uploaded laboratory reports.
//!
//! This crate turns an untrusted extraction payload into a reproducible FHIR transaction
//! bundle:
//! - schema validation that reports every field error at once
//! - analyte and unit normalization against alias tables
//! - content-derived resource ids
//! - an append-only version log with field-level edit history
//! - a report state machine guarded by compare-and-set
//!
//! **No I/O concerns**: PDF text extraction, LLM calls, file storage and bundle delivery are
//! collaborators. They hand their results to [`pipeline::ReportPipeline`] synchronously.

pub mod config;
pub mod constants;
pub mod error;
pub mod history;
pub mod ids;
pub mod normalization;
pub mod pipeline;
pub mod projector;
pub mod schema;
pub mod state;
pub mod store;
pub mod validation;

pub use config::{CoreConfig, NumericPolicy, TextLayerPolicy};
pub use error::{CoreError, CoreResult, ErrorCode};
pub use history::{CorrectionOutcome, FieldChange};
pub use normalization::{NormalizationTables, NormalizedPayload};
pub use pipeline::{Clock, FixedClock, ReportPipeline, SystemClock, Upload};
pub use projector::{project, ProjectedBundle, ReportMetadata};
pub use schema::{
    BundleArtifact, BundleMode, ClinicalTime, EditHistoryEntry, FieldError, IntermediateVersion,
    LabPayload, Measurement, MeasurementValue, ValidationOutcome,
};
pub use state::{ReportRecord, ReportStatus};
pub use store::{InMemoryStore, ReportStore, StatusChange, UploadOutcome};
pub use validation::SchemaValidator;
