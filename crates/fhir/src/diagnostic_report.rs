//! FHIR DiagnosticReport wire model summarising one lab report.

use crate::datatypes::{exactly_one, CodeableConcept, ReferenceWire};
use crate::observation::ResultStatus;
use crate::FhirError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for the report summary.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DiagnosticReportData {
    /// Resource id (`diag-<hex>`).
    pub id: String,

    pub status: ResultStatus,

    pub category: CodeableConcept,

    pub code: CodeableConcept,

    /// Id of the Patient resource.
    pub subject_id: String,

    /// Clinically relevant time of the report, if one is known.
    pub effective_date_time: Option<String>,

    /// Name of the performing laboratory, rendered as a display-only reference.
    pub performer_display: Option<String>,

    /// Ids of the Observation resources, in bundle order.
    pub result_ids: Vec<String>,
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct DiagnosticReportWire {
    pub id: String,
    pub status: ResultStatus,
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: ReferenceWire,
    #[serde(
        rename = "effectiveDateTime",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub effective_date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub performer: Vec<ReferenceWire>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub result: Vec<ReferenceWire>,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

pub(crate) fn domain_to_wire(data: &DiagnosticReportData) -> DiagnosticReportWire {
    DiagnosticReportWire {
        id: data.id.clone(),
        status: data.status,
        category: vec![data.category.clone()],
        code: data.code.clone(),
        subject: ReferenceWire::to("Patient", &data.subject_id),
        effective_date_time: data.effective_date_time.clone(),
        performer: data
            .performer_display
            .iter()
            .map(|name| ReferenceWire::display_only(name))
            .collect(),
        result: data
            .result_ids
            .iter()
            .map(|id| ReferenceWire::to("Observation", id))
            .collect(),
    }
}

pub(crate) fn wire_to_domain(wire: DiagnosticReportWire) -> Result<DiagnosticReportData, FhirError> {
    let subject_id = wire
        .subject
        .target_id("Patient", "DiagnosticReport.subject")?;

    let category = exactly_one(wire.category).ok_or_else(|| {
        FhirError::Translation(format!(
            "DiagnosticReport {} must carry exactly one category",
            wire.id
        ))
    })?;

    let performer_display = match wire.performer.len() {
        0 => None,
        1 => wire.performer.into_iter().next().and_then(|p| p.display),
        _ => {
            return Err(FhirError::Translation(format!(
                "DiagnosticReport {} carries more than one performer",
                wire.id
            )))
        }
    };

    let result_ids = wire
        .result
        .iter()
        .map(|r| r.target_id("Observation", "DiagnosticReport.result"))
        .collect::<Result<Vec<_>, FhirError>>()?;

    Ok(DiagnosticReportData {
        id: wire.id,
        status: wire.status,
        category,
        code: wire.code,
        subject_id,
        effective_date_time: wire.effective_date_time,
        performer_display,
        result_ids,
    })
}
