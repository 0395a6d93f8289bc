//! Pipeline orchestrator.
//!
//! Drives one report through its lifecycle:
//!
//! ```text
//! uploaded -> parsing -> review_pending <-> editing
//!                              |
//!                              v
//!                      generating_bundle -> completed <-> regenerating_bundle
//! ```
//!
//! with `failed` reachable from every non-terminal step and `duplicate` from `uploaded`.
//! Extraction, PDF handling and delivery belong to collaborators; they hand results in
//! synchronously. Every mutating call is a compare-and-set on the report's status, so two
//! callers racing on the same report cannot both succeed.

use crate::config::CoreConfig;
use crate::constants::MAX_METADATA_LEN;
use crate::error::ErrorCode;
use crate::history::{plan_correction, CorrectionOutcome, CorrectionPlan};
use crate::ids;
use crate::projector::{project, ReportMetadata};
use crate::schema::{
    current_version, BundleArtifact, BundleMode, EditHistoryEntry, IntermediateVersion,
    NewVersion, ValidationOutcome, VersionContent, VersionKind,
};
use crate::state::{ReportRecord, ReportStatus};
use crate::store::{ReportStore, StatusChange, UploadOutcome};
use crate::validation::SchemaValidator;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use labflow_types::{NonEmptyText, Sha256Hash};
use labflow_uuid::RecordId;
use serde_json::Value;
use std::sync::Arc;

/// Source of "now" for timestamps and temporal validation.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock stuck at one instant.
#[derive(Clone, Copy, Debug)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Metadata handed over by the upload collaborator alongside the file bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upload {
    pub subject_id: String,
    pub original_filename: String,
    pub content_type: String,
    pub storage_locator: Option<String>,
    /// Hex SHA-256 the collaborator computed, if any. Checked against the bytes.
    pub declared_hash: Option<String>,
}

/// Report pipeline over a [`ReportStore`].
pub struct ReportPipeline<S> {
    cfg: Arc<CoreConfig>,
    validator: SchemaValidator,
    store: S,
    clock: Arc<dyn Clock>,
}

impl<S: ReportStore> ReportPipeline<S> {
    pub fn new(cfg: Arc<CoreConfig>, store: S) -> Self {
        Self::with_clock(cfg, store, Arc::new(SystemClock))
    }

    pub fn with_clock(cfg: Arc<CoreConfig>, store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            validator: SchemaValidator::new(cfg.clone()),
            cfg,
            store,
            clock,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn validator(&self) -> &SchemaValidator {
        &self.validator
    }

    /// Registers an uploaded file.
    ///
    /// Uploading bytes that were seen before is not an error: the new record is resolved as
    /// `duplicate` and linked to the first report.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the subject id is blank or too long, or if
    /// `declared_hash` is malformed or does not match `bytes`.
    pub fn register_upload(&self, upload: Upload, bytes: &[u8]) -> CoreResult<UploadOutcome> {
        let subject_id = NonEmptyText::with_max_len(&upload.subject_id, MAX_METADATA_LEN)
            .map_err(|e| CoreError::InvalidInput(format!("subject id: {e}")))?;

        let file_hash = ids::file_hash(bytes);
        if let Some(declared) = &upload.declared_hash {
            let declared = Sha256Hash::parse(&declared.trim().to_ascii_lowercase())
                .map_err(|e| CoreError::InvalidInput(format!("declared hash: {e}")))?;
            if declared != file_hash {
                return Err(CoreError::InvalidInput(format!(
                    "declared hash {} does not match file content {}",
                    declared.to_hex(),
                    file_hash.to_hex()
                )));
            }
        }

        let record = ReportRecord::uploaded(
            subject_id,
            upload.original_filename,
            upload.content_type,
            upload.storage_locator,
            file_hash,
            self.clock.now(),
        );
        self.store.register_upload(record)
    }

    /// `uploaded -> parsing`.
    pub fn start_parsing(&self, report_id: RecordId) -> CoreResult<ReportRecord> {
        self.move_to(report_id, ReportStatus::Uploaded, ReportStatus::Parsing)
    }

    /// Stores the extractor's raw payload as the original version and moves
    /// `parsing -> review_pending`.
    ///
    /// An invalid payload is stored too, with its errors, so a reviewer can correct it.
    pub fn record_extraction(
        &self,
        report_id: RecordId,
        raw: &Value,
        extractor: &str,
    ) -> CoreResult<IntermediateVersion> {
        let now = self.clock.now();
        let content = match self.validator.validate(raw, now) {
            ValidationOutcome::Valid(payload) => VersionContent::Valid { payload },
            ValidationOutcome::Invalid(errors) => {
                tracing::warn!(
                    report_id = %report_id,
                    error_count = errors.len(),
                    "extracted payload failed validation"
                );
                VersionContent::Invalid {
                    raw: raw.clone(),
                    errors,
                }
            }
        };

        self.store.append_version(
            NewVersion {
                id: RecordId::new(),
                report_id,
                kind: VersionKind::Original,
                schema_version: self.cfg.schema_version().to_string(),
                content,
                created_at: now,
                created_by: extractor.to_string(),
            },
            Some(StatusChange::new(
                ReportStatus::Parsing,
                ReportStatus::ReviewPending,
                now,
            )),
        )
    }

    /// `parsing -> failed` with `extraction_failed`.
    pub fn record_extraction_failure(
        &self,
        report_id: RecordId,
        message: &str,
    ) -> CoreResult<ReportRecord> {
        self.store.transition(
            report_id,
            StatusChange::failed(
                ReportStatus::Parsing,
                ErrorCode::ExtractionFailed,
                message,
                self.clock.now(),
            ),
        )
    }

    /// `review_pending -> editing`.
    pub fn begin_editing(&self, report_id: RecordId) -> CoreResult<ReportRecord> {
        self.move_to(report_id, ReportStatus::ReviewPending, ReportStatus::Editing)
    }

    /// `editing -> review_pending` without a correction.
    pub fn cancel_editing(&self, report_id: RecordId) -> CoreResult<ReportRecord> {
        self.move_to(report_id, ReportStatus::Editing, ReportStatus::ReviewPending)
    }

    /// Submits a full proposed payload for a report in `editing`.
    ///
    /// On success the corrected version becomes current, one history entry is stored per
    /// changed field, and the report returns to `review_pending`. A rejected or no-op
    /// correction persists nothing and leaves the report in `editing`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StaleState`] if the report is not in `editing`.
    pub fn submit_correction(
        &self,
        report_id: RecordId,
        proposed: &Value,
        editor: &str,
    ) -> CoreResult<CorrectionOutcome> {
        let report = self.store.report(report_id)?;
        if report.status != ReportStatus::Editing {
            return Err(CoreError::StaleState {
                expected: ReportStatus::Editing,
                actual: report.status,
            });
        }

        let versions = self.store.versions(report_id)?;
        let base = versions
            .last()
            .ok_or_else(|| CoreError::InvalidInput(format!("report {report_id} has no versions")))?;

        let now = self.clock.now();
        let (payload, changes) = match plan_correction(&self.validator, base, proposed, now)? {
            CorrectionPlan::Rejected(errors) => {
                tracing::warn!(
                    report_id = %report_id,
                    error_count = errors.len(),
                    "correction rejected"
                );
                return Ok(CorrectionOutcome::Rejected(errors));
            }
            CorrectionPlan::Unchanged => {
                tracing::info!(report_id = %report_id, "correction changes nothing");
                return Ok(CorrectionOutcome::Unchanged);
            }
            CorrectionPlan::Apply { payload, changes } => (payload, changes),
        };

        let version_id = RecordId::new();
        let entries: Vec<EditHistoryEntry> = changes
            .into_iter()
            .map(|change| EditHistoryEntry {
                id: RecordId::new(),
                version_id,
                field_path: change.field_path,
                old_value: change.old_value,
                new_value: change.new_value,
                editor: editor.to_string(),
                timestamp: now,
            })
            .collect();

        let version = self.store.append_correction(
            NewVersion {
                id: version_id,
                report_id,
                kind: VersionKind::Corrected,
                schema_version: self.cfg.schema_version().to_string(),
                content: VersionContent::Valid { payload },
                created_at: now,
                created_by: editor.to_string(),
            },
            entries.clone(),
            StatusChange::new(ReportStatus::Editing, ReportStatus::ReviewPending, now),
        )?;
        tracing::info!(
            report_id = %report_id,
            version_number = version.version_number,
            changed_fields = entries.len(),
            "correction applied"
        );

        Ok(CorrectionOutcome::Applied { version, entries })
    }

    /// Projects the current version: `review_pending -> generating_bundle -> completed`.
    ///
    /// If projection fails the report ends `failed` with a stable error code and the error
    /// is returned.
    pub fn generate_bundle(&self, report_id: RecordId) -> CoreResult<BundleArtifact> {
        let report = self.move_to(
            report_id,
            ReportStatus::ReviewPending,
            ReportStatus::GeneratingBundle,
        )?;

        // From here on every failure must end in `failed`, including store reads.
        let built = self.store.versions(report_id).and_then(|versions| {
            current_version(&versions)
                .ok_or(CoreError::NoValidVersion(report_id))
                .and_then(|version| self.build_bundle(&report, version, BundleMode::Initial))
        });
        self.finish_bundle(report_id, ReportStatus::GeneratingBundle, built)
    }

    /// Re-projects a stored version of a completed report:
    /// `completed -> regenerating_bundle -> completed`.
    ///
    /// Regenerating from the version a previous bundle came from yields identical content.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if the version does not belong to the report and
    /// [`CoreError::InvalidInput`] if it is not valid; in both cases the status is untouched.
    pub fn regenerate_bundle(
        &self,
        report_id: RecordId,
        source_version_id: RecordId,
    ) -> CoreResult<BundleArtifact> {
        let version = self.store.version(source_version_id)?;
        if version.report_id != report_id {
            return Err(CoreError::NotFound {
                entity: "version",
                id: source_version_id.to_string(),
            });
        }
        if version.payload().is_none() {
            return Err(CoreError::InvalidInput(format!(
                "version {source_version_id} did not pass validation"
            )));
        }

        let report = self.move_to(
            report_id,
            ReportStatus::Completed,
            ReportStatus::RegeneratingBundle,
        )?;
        let built = self.build_bundle(&report, &version, BundleMode::Regeneration);
        self.finish_bundle(report_id, ReportStatus::RegeneratingBundle, built)
    }

    /// Marks a report failed from its current status.
    pub fn fail_report(
        &self,
        report_id: RecordId,
        error_code: ErrorCode,
        message: &str,
    ) -> CoreResult<ReportRecord> {
        let report = self.store.report(report_id)?;
        self.store.transition(
            report_id,
            StatusChange::failed(report.status, error_code, message, self.clock.now()),
        )
    }

    pub fn report(&self, report_id: RecordId) -> CoreResult<ReportRecord> {
        self.store.report(report_id)
    }

    pub fn reports(&self) -> CoreResult<Vec<ReportRecord>> {
        self.store.reports()
    }

    pub fn versions(&self, report_id: RecordId) -> CoreResult<Vec<IntermediateVersion>> {
        self.store.versions(report_id)
    }

    /// The latest valid version, if any.
    pub fn current_version(&self, report_id: RecordId) -> CoreResult<Option<IntermediateVersion>> {
        let versions = self.store.versions(report_id)?;
        Ok(current_version(&versions).cloned())
    }

    pub fn history(&self, report_id: RecordId) -> CoreResult<Vec<EditHistoryEntry>> {
        self.store.history(report_id)
    }

    pub fn bundles(&self, report_id: RecordId) -> CoreResult<Vec<BundleArtifact>> {
        self.store.bundles(report_id)
    }

    pub fn latest_bundle(&self, report_id: RecordId) -> CoreResult<Option<BundleArtifact>> {
        Ok(self.store.bundles(report_id)?.pop())
    }

    fn move_to(
        &self,
        report_id: RecordId,
        expected: ReportStatus,
        next: ReportStatus,
    ) -> CoreResult<ReportRecord> {
        self.store.transition(
            report_id,
            StatusChange::new(expected, next, self.clock.now()),
        )
    }

    fn build_bundle(
        &self,
        report: &ReportRecord,
        version: &IntermediateVersion,
        mode: BundleMode,
    ) -> CoreResult<BundleArtifact> {
        let payload = version
            .payload()
            .ok_or(CoreError::NoValidVersion(report.id))?;
        let normalized = self.cfg.tables().normalize(payload);
        let projected = project(&normalized, &ReportMetadata::from(report))?;

        Ok(BundleArtifact {
            id: RecordId::new(),
            report_id: report.id,
            source_version_id: version.id,
            bundle_content: projected.content,
            content_hash: projected.content_hash,
            generated_at: self.clock.now(),
            mode,
        })
    }

    fn finish_bundle(
        &self,
        report_id: RecordId,
        from: ReportStatus,
        built: CoreResult<BundleArtifact>,
    ) -> CoreResult<BundleArtifact> {
        let now = self.clock.now();
        match built {
            Ok(artifact) => {
                self.store.append_bundle(
                    artifact.clone(),
                    StatusChange::new(from, ReportStatus::Completed, now),
                )?;
                tracing::info!(
                    report_id = %report_id,
                    version_id = %artifact.source_version_id,
                    content_hash = %artifact.content_hash.to_hex(),
                    mode = ?artifact.mode,
                    "bundle generated"
                );
                Ok(artifact)
            }
            Err(err) => {
                let code = ErrorCode::for_bundle_failure(&err);
                tracing::error!(report_id = %report_id, error_code = %code, error = %err, "bundle generation failed");
                self.store.transition(
                    report_id,
                    StatusChange::failed(from, code, err.to_string(), now),
                )?;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use chrono::TimeZone;
    use serde_json::json;

    fn pipeline() -> ReportPipeline<InMemoryStore> {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap());
        ReportPipeline::with_clock(
            Arc::new(CoreConfig::default()),
            InMemoryStore::new(),
            Arc::new(clock),
        )
    }

    fn upload() -> Upload {
        Upload {
            subject_id: "S".into(),
            original_filename: "glucose.pdf".into(),
            content_type: "application/pdf".into(),
            storage_locator: Some("file:///uploads/glucose.pdf".into()),
            declared_hash: None,
        }
    }

    fn glucose(value: f64) -> Value {
        json!({
            "performingLab": "Acme Labs",
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": value,
                "originalUnit": "mg/dL",
                "collectionTime": "2024-01-15"
            }]
        })
    }

    fn registered(p: &ReportPipeline<InMemoryStore>, bytes: &[u8]) -> ReportRecord {
        match p.register_upload(upload(), bytes).expect("register upload") {
            UploadOutcome::Registered(report) => report,
            other => panic!("expected Registered, got {other:?}"),
        }
    }

    /// Uploads, extracts `raw` and leaves the report in `review_pending`.
    fn extracted(p: &ReportPipeline<InMemoryStore>, raw: &Value) -> ReportRecord {
        let report = registered(p, b"%PDF-1.7 glucose");
        p.start_parsing(report.id).expect("start parsing");
        p.record_extraction(report.id, raw, "extractor")
            .expect("record extraction");
        p.report(report.id).expect("report")
    }

    fn observation_ids(artifact: &BundleArtifact) -> Vec<String> {
        fhir::LabBundle::parse(&artifact.bundle_content)
            .expect("bundle parses")
            .observations
            .into_iter()
            .map(|o| o.id)
            .collect()
    }

    #[test]
    fn glucose_report_end_to_end() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        assert_eq!(report.status, ReportStatus::ReviewPending);

        let artifact = p.generate_bundle(report.id).expect("generate bundle");
        assert_eq!(p.report(report.id).expect("report").status, ReportStatus::Completed);
        assert_eq!(artifact.mode, BundleMode::Initial);
        assert_eq!(artifact.content_hash, Sha256Hash::digest(&artifact.bundle_content));
        assert_eq!(
            observation_ids(&artifact),
            vec![ids::measurement_id("S", "2024-01-15", "GLUCOSE", "95", "mg/dL")]
        );
    }

    #[test]
    fn re_upload_is_a_duplicate() {
        let p = pipeline();
        let original = registered(&p, b"same bytes");
        match p.register_upload(upload(), b"same bytes").expect("second upload") {
            UploadOutcome::Duplicate {
                report,
                original_id,
            } => {
                assert_eq!(original_id, original.id);
                assert_eq!(report.status, ReportStatus::Duplicate);
                let err = p.start_parsing(report.id).expect_err("duplicate is terminal");
                assert!(matches!(err, CoreError::StaleState { .. }));
            }
            other => panic!("expected Duplicate, got {other:?}"),
        }
    }

    #[test]
    fn declared_hash_must_match_bytes() {
        let p = pipeline();
        let mut declared = upload();
        declared.declared_hash = Some(Sha256Hash::digest(b"bytes").to_hex().to_uppercase());
        p.register_upload(declared.clone(), b"bytes")
            .expect("matching hash in any case");

        declared.declared_hash = Some(Sha256Hash::digest(b"other").to_hex());
        let err = p
            .register_upload(declared, b"bytes")
            .expect_err("mismatched hash");
        match err {
            CoreError::InvalidInput(msg) => assert!(msg.contains("does not match")),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }

        let mut blank = upload();
        blank.subject_id = "  ".into();
        assert!(matches!(
            p.register_upload(blank, b"x").expect_err("blank subject"),
            CoreError::InvalidInput(_)
        ));
    }

    #[test]
    fn correction_creates_new_identity_and_keeps_history() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        let v1 = p
            .current_version(report.id)
            .expect("current")
            .expect("original is valid");

        p.begin_editing(report.id).expect("begin editing");
        let outcome = p
            .submit_correction(report.id, &glucose(105.0), "reviewer")
            .expect("submit correction");
        let (v2, entries) = match outcome {
            CorrectionOutcome::Applied { version, entries } => (version, entries),
            other => panic!("expected Applied, got {other:?}"),
        };
        assert_eq!(v2.version_number, 2);
        assert_eq!(v2.kind, VersionKind::Corrected);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].field_path, "measurements[0].numericValue");
        assert_eq!(entries[0].version_id, v2.id);
        assert_eq!(p.history(report.id).expect("history"), entries);
        assert_eq!(
            p.current_version(report.id).expect("current").map(|v| v.id),
            Some(v2.id)
        );
        assert_eq!(p.versions(report.id).expect("versions").len(), 2);
        assert_eq!(p.report(report.id).expect("report").status, ReportStatus::ReviewPending);

        let corrected = p.generate_bundle(report.id).expect("generate");
        assert_eq!(corrected.source_version_id, v2.id);
        assert_eq!(
            observation_ids(&corrected),
            vec![ids::measurement_id("S", "2024-01-15", "GLUCOSE", "105", "mg/dL")]
        );

        let from_v1 = p.regenerate_bundle(report.id, v1.id).expect("regenerate v1");
        assert_eq!(from_v1.mode, BundleMode::Regeneration);
        assert_ne!(observation_ids(&from_v1), observation_ids(&corrected));

        let parsed_v1 = fhir::LabBundle::parse(&from_v1.bundle_content).expect("parse v1");
        let parsed_v2 = fhir::LabBundle::parse(&corrected.bundle_content).expect("parse v2");
        assert_eq!(parsed_v1.patient.id, parsed_v2.patient.id);
        assert_eq!(parsed_v1.document.id, parsed_v2.document.id);
    }

    #[test]
    fn regeneration_reproduces_identical_content() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        let first = p.generate_bundle(report.id).expect("generate");

        let again = p
            .regenerate_bundle(report.id, first.source_version_id)
            .expect("regenerate");
        assert_eq!(again.bundle_content, first.bundle_content);
        assert_eq!(again.content_hash, first.content_hash);
        assert_ne!(again.id, first.id);
        assert_eq!(p.bundles(report.id).expect("bundles").len(), 2);
        assert_eq!(
            p.latest_bundle(report.id).expect("latest").map(|b| b.id),
            Some(again.id)
        );
    }

    #[test]
    fn invalid_correction_changes_nothing() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        p.begin_editing(report.id).expect("begin editing");

        let bad = json!({
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": "ninety",
                "collectionTime": "2099-01-01"
            }]
        });
        match p
            .submit_correction(report.id, &bad, "reviewer")
            .expect("submit")
        {
            CorrectionOutcome::Rejected(errors) => assert_eq!(errors.len(), 2),
            other => panic!("expected Rejected, got {other:?}"),
        }
        assert_eq!(p.versions(report.id).expect("versions").len(), 1);
        assert!(p.history(report.id).expect("history").is_empty());
        assert_eq!(p.report(report.id).expect("report").status, ReportStatus::Editing);

        assert_eq!(
            p.submit_correction(report.id, &glucose(95.0), "reviewer")
                .expect("submit"),
            CorrectionOutcome::Unchanged
        );
        p.cancel_editing(report.id).expect("cancel editing");
        assert_eq!(p.report(report.id).expect("report").status, ReportStatus::ReviewPending);
    }

    #[test]
    fn correction_requires_editing() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        let err = p
            .submit_correction(report.id, &glucose(105.0), "reviewer")
            .expect_err("not editing");
        match err {
            CoreError::StaleState { expected, actual } => {
                assert_eq!(expected, ReportStatus::Editing);
                assert_eq!(actual, ReportStatus::ReviewPending);
            }
            other => panic!("expected StaleState error, got {other:?}"),
        }
    }

    #[test]
    fn invalid_extraction_is_stored_and_correctable() {
        let p = pipeline();
        let raw = json!({"measurements": [{"originalName": "Glucose", "numericValue": 95}]});
        let report = extracted(&p, &raw);
        assert_eq!(report.status, ReportStatus::ReviewPending);

        let versions = p.versions(report.id).expect("versions");
        assert_eq!(versions.len(), 1);
        assert_eq!(
            versions[0].validation_errors()[0].field_path,
            "measurements[0].collectionTime"
        );
        assert!(p.current_version(report.id).expect("current").is_none());

        p.begin_editing(report.id).expect("begin editing");
        let outcome = p
            .submit_correction(report.id, &glucose(95.0), "reviewer")
            .expect("submit");
        let CorrectionOutcome::Applied { entries, .. } = outcome else {
            panic!("expected Applied, got {outcome:?}");
        };
        let paths: Vec<&str> = entries.iter().map(|e| e.field_path.as_str()).collect();
        assert_eq!(
            paths,
            vec![
                "measurements[0].collectionTime",
                "measurements[0].originalUnit",
                "performingLab",
            ]
        );
        p.generate_bundle(report.id).expect("generate from corrected version");
    }

    #[test]
    fn generating_without_a_valid_version_fails_the_report() {
        let p = pipeline();
        let report = extracted(&p, &json!({"measurements": []}));

        let err = p.generate_bundle(report.id).expect_err("no valid version");
        assert!(matches!(err, CoreError::NoValidVersion(_)));

        let failed = p.report(report.id).expect("report");
        assert_eq!(failed.status, ReportStatus::Failed);
        let failure = failed.failure.expect("failure recorded");
        assert_eq!(failure.error_code, ErrorCode::SchemaValidationFailed);
        assert!(p.bundles(report.id).expect("bundles").is_empty());
    }

    #[test]
    fn regeneration_rejects_foreign_or_invalid_versions() {
        let p = pipeline();
        let report = extracted(&p, &glucose(95.0));
        p.generate_bundle(report.id).expect("generate");

        let err = p
            .regenerate_bundle(report.id, RecordId::new())
            .expect_err("unknown version");
        assert!(matches!(err, CoreError::NotFound { entity: "version", .. }));
        assert_eq!(p.report(report.id).expect("report").status, ReportStatus::Completed);

        let err = p
            .generate_bundle(report.id)
            .expect_err("completed report cannot generate again");
        assert!(matches!(err, CoreError::StaleState { .. }));
    }

    #[test]
    fn extraction_failure_and_manual_failure_record_codes() {
        let p = pipeline();
        let report = registered(&p, b"scanned");
        p.start_parsing(report.id).expect("start parsing");
        let failed = p
            .record_extraction_failure(report.id, "no text layer")
            .expect("record failure");
        assert_eq!(
            failed.failure.map(|f| f.error_code),
            Some(ErrorCode::ExtractionFailed)
        );
        let err = p
            .fail_report(report.id, ErrorCode::ProcessingError, "again")
            .expect_err("failed is terminal");
        assert!(matches!(err, CoreError::InvalidTransition { .. }));

        let other = registered(&p, b"another");
        let failed = p
            .fail_report(other.id, ErrorCode::ProcessingError, "worker crashed")
            .expect("fail from uploaded");
        assert_eq!(failed.status, ReportStatus::Failed);
    }

    /// Delegates to an in-memory store, but version reads fail once `broken` is set.
    struct UnreadableVersions {
        inner: InMemoryStore,
        broken: std::sync::atomic::AtomicBool,
    }

    impl ReportStore for UnreadableVersions {
        fn register_upload(&self, record: ReportRecord) -> CoreResult<UploadOutcome> {
            self.inner.register_upload(record)
        }
        fn report(&self, id: RecordId) -> CoreResult<ReportRecord> {
            self.inner.report(id)
        }
        fn reports(&self) -> CoreResult<Vec<ReportRecord>> {
            self.inner.reports()
        }
        fn transition(&self, id: RecordId, change: StatusChange) -> CoreResult<ReportRecord> {
            self.inner.transition(id, change)
        }
        fn append_version(
            &self,
            version: NewVersion,
            change: Option<StatusChange>,
        ) -> CoreResult<IntermediateVersion> {
            self.inner.append_version(version, change)
        }
        fn append_correction(
            &self,
            version: NewVersion,
            entries: Vec<EditHistoryEntry>,
            change: StatusChange,
        ) -> CoreResult<IntermediateVersion> {
            self.inner.append_correction(version, entries, change)
        }
        fn versions(&self, report_id: RecordId) -> CoreResult<Vec<IntermediateVersion>> {
            if self.broken.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(CoreError::Storage("versions unavailable".into()));
            }
            self.inner.versions(report_id)
        }
        fn version(&self, version_id: RecordId) -> CoreResult<IntermediateVersion> {
            self.inner.version(version_id)
        }
        fn history(&self, report_id: RecordId) -> CoreResult<Vec<EditHistoryEntry>> {
            self.inner.history(report_id)
        }
        fn append_bundle(
            &self,
            artifact: BundleArtifact,
            change: StatusChange,
        ) -> CoreResult<ReportRecord> {
            self.inner.append_bundle(artifact, change)
        }
        fn bundles(&self, report_id: RecordId) -> CoreResult<Vec<BundleArtifact>> {
            self.inner.bundles(report_id)
        }
    }

    #[test]
    fn storage_failure_while_generating_fails_the_report() {
        let clock = FixedClock(Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap());
        let p = ReportPipeline::with_clock(
            Arc::new(CoreConfig::default()),
            UnreadableVersions {
                inner: InMemoryStore::new(),
                broken: std::sync::atomic::AtomicBool::new(false),
            },
            Arc::new(clock),
        );
        let report = match p.register_upload(upload(), b"%PDF").expect("register upload") {
            UploadOutcome::Registered(report) => report,
            other => panic!("expected Registered, got {other:?}"),
        };
        p.start_parsing(report.id).expect("start parsing");
        p.record_extraction(report.id, &glucose(95.0), "extractor")
            .expect("record extraction");

        p.store
            .broken
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let err = p.generate_bundle(report.id).expect_err("versions unreadable");
        assert!(matches!(err, CoreError::Storage(_)));

        let failed = p.report(report.id).expect("report");
        assert_eq!(failed.status, ReportStatus::Failed);
        assert_eq!(
            failed.failure.map(|f| f.error_code),
            Some(ErrorCode::BundleGenerationFailed)
        );
    }
}
