//! Persistence boundary.
//!
//! The core needs exactly one coordination primitive from storage: a compare-and-set on a
//! report's status. Every write that accompanies a status change (a new version, a
//! correction with its history, a bundle) is committed together with that change or not at
//! all.
//!
//! [`InMemoryStore`] is the reference implementation used by the CLI and the tests.

use crate::error::ErrorCode;
use crate::schema::{
    BundleArtifact, EditHistoryEntry, IntermediateVersion, NewVersion, VersionKind,
};
use crate::state::{ReportFailure, ReportRecord, ReportStatus};
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use labflow_uuid::RecordId;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Result of registering an upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UploadOutcome {
    Registered(ReportRecord),
    /// The bytes were already uploaded; `report` is the new record, resolved as `duplicate`.
    Duplicate {
        report: ReportRecord,
        original_id: RecordId,
    },
}

impl UploadOutcome {
    pub fn report(&self) -> &ReportRecord {
        match self {
            UploadOutcome::Registered(report) | UploadOutcome::Duplicate { report, .. } => report,
        }
    }
}

/// A guarded status change: applied only if the report is still in `expected`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusChange {
    pub expected: ReportStatus,
    pub next: ReportStatus,
    pub failure: Option<ReportFailure>,
    pub at: DateTime<Utc>,
}

impl StatusChange {
    pub fn new(expected: ReportStatus, next: ReportStatus, at: DateTime<Utc>) -> Self {
        Self {
            expected,
            next,
            failure: None,
            at,
        }
    }

    /// A move to `failed` with a stable reason.
    pub fn failed(
        expected: ReportStatus,
        error_code: ErrorCode,
        error_message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            expected,
            next: ReportStatus::Failed,
            failure: Some(ReportFailure {
                error_code,
                error_message: error_message.into(),
            }),
            at,
        }
    }

    fn apply(&self, record: &mut ReportRecord) -> CoreResult<()> {
        match &self.failure {
            Some(failure) => record.fail(
                self.expected,
                failure.error_code,
                failure.error_message.clone(),
                self.at,
            ),
            None => record.transition(self.expected, self.next, self.at),
        }
    }
}

/// Storage for reports, versions, edit history and bundles.
///
/// Implementations must make each method atomic. Nothing is ever deleted.
pub trait ReportStore: Send + Sync {
    /// Inserts a fresh `uploaded` record, or resolves it as a duplicate of the first report
    /// with the same file hash.
    fn register_upload(&self, record: ReportRecord) -> CoreResult<UploadOutcome>;

    fn report(&self, id: RecordId) -> CoreResult<ReportRecord>;

    /// All reports in upload order.
    fn reports(&self) -> CoreResult<Vec<ReportRecord>>;

    /// Applies `change` if the report is still in `change.expected`.
    fn transition(&self, id: RecordId, change: StatusChange) -> CoreResult<ReportRecord>;

    /// Appends a version, assigning the next version number, optionally with a status change.
    fn append_version(
        &self,
        version: NewVersion,
        change: Option<StatusChange>,
    ) -> CoreResult<IntermediateVersion>;

    /// Appends a corrected version together with its history entries and status change.
    fn append_correction(
        &self,
        version: NewVersion,
        entries: Vec<EditHistoryEntry>,
        change: StatusChange,
    ) -> CoreResult<IntermediateVersion>;

    /// Versions of a report by ascending number.
    fn versions(&self, report_id: RecordId) -> CoreResult<Vec<IntermediateVersion>>;

    fn version(&self, version_id: RecordId) -> CoreResult<IntermediateVersion>;

    /// Edit history of a report in the order it was recorded.
    fn history(&self, report_id: RecordId) -> CoreResult<Vec<EditHistoryEntry>>;

    /// Appends a bundle together with its status change.
    fn append_bundle(&self, artifact: BundleArtifact, change: StatusChange) -> CoreResult<ReportRecord>;

    /// Bundles of a report in generation order.
    fn bundles(&self, report_id: RecordId) -> CoreResult<Vec<BundleArtifact>>;
}

#[derive(Debug, Default)]
struct Inner {
    reports: Vec<ReportRecord>,
    versions: Vec<IntermediateVersion>,
    history: Vec<EditHistoryEntry>,
    bundles: Vec<BundleArtifact>,
}

impl Inner {
    fn report_mut(&mut self, id: RecordId) -> CoreResult<&mut ReportRecord> {
        self.reports
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| not_found("report", id))
    }

    /// Applies `change` to a copy so the caller can commit it together with other writes.
    fn staged(&self, id: RecordId, change: &StatusChange) -> CoreResult<ReportRecord> {
        let mut record = self
            .reports
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| not_found("report", id))?;
        change.apply(&mut record)?;
        Ok(record)
    }

    fn commit(&mut self, record: ReportRecord) -> CoreResult<ReportRecord> {
        let slot = self.report_mut(record.id)?;
        *slot = record.clone();
        Ok(record)
    }

    fn next_version(&self, version: &NewVersion) -> CoreResult<u32> {
        if !self.reports.iter().any(|r| r.id == version.report_id) {
            return Err(not_found("report", version.report_id));
        }
        let latest = self
            .versions
            .iter()
            .filter(|v| v.report_id == version.report_id)
            .map(|v| v.version_number)
            .max();

        match (version.kind, latest) {
            (VersionKind::Original, None) => Ok(1),
            (VersionKind::Original, Some(_)) => Err(CoreError::InvalidInput(format!(
                "report {} already has an original version",
                version.report_id
            ))),
            (VersionKind::Corrected, None) => Err(CoreError::InvalidInput(format!(
                "report {} has no version to correct",
                version.report_id
            ))),
            (VersionKind::Corrected, Some(n)) => Ok(n + 1),
        }
    }
}

/// In-process [`ReportStore`] behind a single `RwLock`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> CoreResult<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| CoreError::Storage("report store lock poisoned".into()))
    }

    fn write(&self) -> CoreResult<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| CoreError::Storage("report store lock poisoned".into()))
    }
}

impl ReportStore for InMemoryStore {
    fn register_upload(&self, mut record: ReportRecord) -> CoreResult<UploadOutcome> {
        let mut inner = self.write()?;
        if inner.reports.iter().any(|r| r.id == record.id) {
            return Err(CoreError::InvalidInput(format!(
                "report {} already exists",
                record.id
            )));
        }

        let original = inner
            .reports
            .iter()
            .find(|r| r.file_hash == record.file_hash && r.duplicate_of_id.is_none())
            .map(|r| r.id);

        match original {
            Some(original_id) => {
                let at = record.updated_at;
                record.mark_duplicate(original_id, at)?;
                inner.reports.push(record.clone());
                tracing::info!(
                    report_id = %record.id,
                    original_id = %original_id,
                    file_hash = %record.file_hash.to_hex(),
                    "duplicate upload"
                );
                Ok(UploadOutcome::Duplicate {
                    report: record,
                    original_id,
                })
            }
            None => {
                inner.reports.push(record.clone());
                tracing::info!(report_id = %record.id, "upload registered");
                Ok(UploadOutcome::Registered(record))
            }
        }
    }

    fn report(&self, id: RecordId) -> CoreResult<ReportRecord> {
        self.read()?
            .reports
            .iter()
            .find(|r| r.id == id)
            .cloned()
            .ok_or_else(|| not_found("report", id))
    }

    fn reports(&self) -> CoreResult<Vec<ReportRecord>> {
        Ok(self.read()?.reports.clone())
    }

    fn transition(&self, id: RecordId, change: StatusChange) -> CoreResult<ReportRecord> {
        let mut inner = self.write()?;
        let record = inner.staged(id, &change)?;
        inner.commit(record)
    }

    fn append_version(
        &self,
        version: NewVersion,
        change: Option<StatusChange>,
    ) -> CoreResult<IntermediateVersion> {
        let mut inner = self.write()?;
        let number = inner.next_version(&version)?;
        let record = match &change {
            Some(change) => Some(inner.staged(version.report_id, change)?),
            None => None,
        };

        let stored = IntermediateVersion::from_new(version, number);
        inner.versions.push(stored.clone());
        if let Some(record) = record {
            inner.commit(record)?;
        }
        tracing::info!(
            report_id = %stored.report_id,
            version_id = %stored.id,
            version_number = stored.version_number,
            "intermediate version stored"
        );
        Ok(stored)
    }

    fn append_correction(
        &self,
        version: NewVersion,
        entries: Vec<EditHistoryEntry>,
        change: StatusChange,
    ) -> CoreResult<IntermediateVersion> {
        if version.kind != VersionKind::Corrected {
            return Err(CoreError::InvalidInput(
                "a correction must be a corrected version".into(),
            ));
        }
        if entries.iter().any(|e| e.version_id != version.id) {
            return Err(CoreError::InvalidInput(
                "edit history entries must reference the corrected version".into(),
            ));
        }

        let mut inner = self.write()?;
        let number = inner.next_version(&version)?;
        let record = inner.staged(version.report_id, &change)?;

        let stored = IntermediateVersion::from_new(version, number);
        inner.versions.push(stored.clone());
        inner.history.extend(entries);
        inner.commit(record)?;
        Ok(stored)
    }

    fn versions(&self, report_id: RecordId) -> CoreResult<Vec<IntermediateVersion>> {
        let inner = self.read()?;
        let mut versions: Vec<IntermediateVersion> = inner
            .versions
            .iter()
            .filter(|v| v.report_id == report_id)
            .cloned()
            .collect();
        versions.sort_by_key(|v| v.version_number);
        Ok(versions)
    }

    fn version(&self, version_id: RecordId) -> CoreResult<IntermediateVersion> {
        self.read()?
            .versions
            .iter()
            .find(|v| v.id == version_id)
            .cloned()
            .ok_or_else(|| not_found("version", version_id))
    }

    fn history(&self, report_id: RecordId) -> CoreResult<Vec<EditHistoryEntry>> {
        let inner = self.read()?;
        let version_ids: Vec<RecordId> = inner
            .versions
            .iter()
            .filter(|v| v.report_id == report_id)
            .map(|v| v.id)
            .collect();
        Ok(inner
            .history
            .iter()
            .filter(|e| version_ids.contains(&e.version_id))
            .cloned()
            .collect())
    }

    fn append_bundle(&self, artifact: BundleArtifact, change: StatusChange) -> CoreResult<ReportRecord> {
        let mut inner = self.write()?;
        let owns_version = inner
            .versions
            .iter()
            .any(|v| v.id == artifact.source_version_id && v.report_id == artifact.report_id);
        if !owns_version {
            return Err(not_found("version", artifact.source_version_id));
        }
        let record = inner.staged(artifact.report_id, &change)?;

        inner.bundles.push(artifact);
        inner.commit(record)
    }

    fn bundles(&self, report_id: RecordId) -> CoreResult<Vec<BundleArtifact>> {
        Ok(self
            .read()?
            .bundles
            .iter()
            .filter(|b| b.report_id == report_id)
            .cloned()
            .collect())
    }
}

fn not_found(entity: &'static str, id: RecordId) -> CoreError {
    CoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}
