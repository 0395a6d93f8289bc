//! Report lifecycle state machine.
//!
//! Only the edges listed in [`ReportStatus::allowed_transitions`] are legal. Every transition
//! is a compare-and-set: the caller names the status it believes the report is in, and a
//! mismatch fails with [`CoreError::StaleState`] instead of overwriting.
//!
//! `failed` and `duplicate` are terminal.

use crate::error::ErrorCode;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use labflow_types::{NonEmptyText, Sha256Hash};
use labflow_uuid::RecordId;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportStatus {
    Uploaded,
    Parsing,
    ReviewPending,
    Editing,
    GeneratingBundle,
    RegeneratingBundle,
    Completed,
    Failed,
    Duplicate,
}

impl ReportStatus {
    pub const ALL: [ReportStatus; 9] = [
        ReportStatus::Uploaded,
        ReportStatus::Parsing,
        ReportStatus::ReviewPending,
        ReportStatus::Editing,
        ReportStatus::GeneratingBundle,
        ReportStatus::RegeneratingBundle,
        ReportStatus::Completed,
        ReportStatus::Failed,
        ReportStatus::Duplicate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportStatus::Uploaded => "uploaded",
            ReportStatus::Parsing => "parsing",
            ReportStatus::ReviewPending => "review_pending",
            ReportStatus::Editing => "editing",
            ReportStatus::GeneratingBundle => "generating_bundle",
            ReportStatus::RegeneratingBundle => "regenerating_bundle",
            ReportStatus::Completed => "completed",
            ReportStatus::Failed => "failed",
            ReportStatus::Duplicate => "duplicate",
        }
    }

    /// Statuses reachable in one step from `self`.
    pub fn allowed_transitions(&self) -> &'static [ReportStatus] {
        use ReportStatus::*;
        match self {
            Uploaded => &[Parsing, Duplicate, Failed],
            Parsing => &[ReviewPending, Failed],
            ReviewPending => &[Editing, GeneratingBundle, Failed],
            Editing => &[ReviewPending, Failed],
            GeneratingBundle => &[Completed, Failed],
            Completed => &[RegeneratingBundle],
            RegeneratingBundle => &[Completed, Failed],
            Failed | Duplicate => &[],
        }
    }

    pub fn can_transition_to(&self, next: ReportStatus) -> bool {
        self.allowed_transitions().contains(&next)
    }

    pub fn is_terminal(&self) -> bool {
        self.allowed_transitions().is_empty()
    }

    /// Work is under way and no user action is expected.
    pub fn is_processing(&self) -> bool {
        matches!(
            self,
            ReportStatus::Parsing | ReportStatus::GeneratingBundle | ReportStatus::RegeneratingBundle
        )
    }

    /// A user is expected to act.
    pub fn is_user_actionable(&self) -> bool {
        matches!(
            self,
            ReportStatus::ReviewPending | ReportStatus::Editing | ReportStatus::Failed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ReportStatus::Completed)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ReportStatus::Failed)
    }

    pub fn metadata(&self) -> StatusMetadata {
        StatusMetadata {
            status: *self,
            is_terminal: self.is_terminal(),
            is_processing: self.is_processing(),
            is_user_actionable: self.is_user_actionable(),
            is_success: self.is_success(),
            is_error: self.is_error(),
            allowed_transitions: self.allowed_transitions().to_vec(),
        }
    }
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display and routing facts about a status.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusMetadata {
    pub status: ReportStatus,
    pub is_terminal: bool,
    pub is_processing: bool,
    pub is_user_actionable: bool,
    pub is_success: bool,
    pub is_error: bool,
    pub allowed_transitions: Vec<ReportStatus>,
}

/// Stable reason a report failed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportFailure {
    pub error_code: ErrorCode,
    pub error_message: String,
}

/// One uploaded document under processing. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRecord {
    pub id: RecordId,
    pub subject_id: NonEmptyText,
    pub original_filename: String,
    pub content_type: String,
    /// Where the storage collaborator keeps the bytes, if it said.
    pub storage_locator: Option<String>,
    pub file_hash: Sha256Hash,
    pub status: ReportStatus,
    #[serde(flatten)]
    pub failure: Option<ReportFailure>,
    pub duplicate_of_id: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ReportRecord {
    /// A freshly uploaded report.
    pub fn uploaded(
        subject_id: NonEmptyText,
        original_filename: String,
        content_type: String,
        storage_locator: Option<String>,
        file_hash: Sha256Hash,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::new(),
            subject_id,
            original_filename,
            content_type,
            storage_locator,
            file_hash,
            status: ReportStatus::Uploaded,
            failure: None,
            duplicate_of_id: None,
            created_at: at,
            updated_at: at,
        }
    }

    /// Moves from `expected` to `next`.
    ///
    /// # Errors
    ///
    /// - [`CoreError::StaleState`] if the record is not in `expected`;
    /// - [`CoreError::InvalidTransition`] if `expected -> next` is not a legal edge.
    pub fn transition(
        &mut self,
        expected: ReportStatus,
        next: ReportStatus,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        if self.status != expected {
            tracing::error!(
                report_id = %self.id,
                expected = %expected,
                actual = %self.status,
                "stale report status"
            );
            return Err(CoreError::StaleState {
                expected,
                actual: self.status,
            });
        }
        if !expected.can_transition_to(next) {
            tracing::error!(
                report_id = %self.id,
                from = %expected,
                to = %next,
                "illegal report transition"
            );
            return Err(CoreError::InvalidTransition {
                from: expected,
                to: next,
            });
        }

        self.status = next;
        self.updated_at = at;
        tracing::info!(report_id = %self.id, from = %expected, to = %next, "report transition");
        Ok(())
    }

    /// Moves to `failed`, recording why.
    pub fn fail(
        &mut self,
        expected: ReportStatus,
        error_code: ErrorCode,
        error_message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.transition(expected, ReportStatus::Failed, at)?;
        self.failure = Some(ReportFailure {
            error_code,
            error_message: error_message.into(),
        });
        Ok(())
    }

    /// Resolves a fresh upload as a duplicate of `original`.
    pub fn mark_duplicate(&mut self, original: RecordId, at: DateTime<Utc>) -> CoreResult<()> {
        self.transition(ReportStatus::Uploaded, ReportStatus::Duplicate, at)?;
        self.duplicate_of_id = Some(original);
        Ok(())
    }
}
