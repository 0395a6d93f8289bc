//! FHIR Observation wire model for a single lab measurement.
//!
//! Responsibilities:
//! - Carry one analyte result as either a quantity or a string value
//! - Enforce that exactly one `value[x]` member is present on the wire
//! - Translate references and reference-range text between carrier and wire

use crate::datatypes::{exactly_one, CodeableConcept, Quantity, ReferenceWire};
use crate::FhirError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for one measurement.
#[derive(Clone, Debug, PartialEq)]
pub struct ObservationData {
    /// Resource id (`obs-<hex>`).
    pub id: String,

    pub status: ResultStatus,

    pub category: CodeableConcept,

    /// What was measured.
    pub code: CodeableConcept,

    /// Id of the Patient resource.
    pub subject_id: String,

    /// When the specimen was collected.
    pub effective_date_time: String,

    /// When the result was made available.
    pub issued: String,

    pub value: ObservationValue,

    /// Free-text reference range as printed on the report.
    pub reference_range_text: Option<String>,
}

/// The `value[x]` choice of an observation.
#[derive(Clone, Debug, PartialEq)]
pub enum ObservationValue {
    Quantity(Quantity),
    Text(String),
}

/// Status of an observation or diagnostic report.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResultStatus {
    Registered,
    Preliminary,
    Final,
    Amended,
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ObservationWire {
    pub id: String,
    pub status: ResultStatus,
    pub category: Vec<CodeableConcept>,
    pub code: CodeableConcept,
    pub subject: ReferenceWire,
    #[serde(rename = "effectiveDateTime")]
    pub effective_date_time: String,
    pub issued: String,
    #[serde(
        rename = "valueQuantity",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub value_quantity: Option<Quantity>,
    #[serde(
        rename = "valueString",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub value_string: Option<String>,
    #[serde(
        rename = "referenceRange",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub reference_range: Vec<ReferenceRangeWire>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReferenceRangeWire {
    pub text: String,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

pub(crate) fn domain_to_wire(data: &ObservationData) -> ObservationWire {
    let (value_quantity, value_string) = match &data.value {
        ObservationValue::Quantity(quantity) => (Some(quantity.clone()), None),
        ObservationValue::Text(text) => (None, Some(text.clone())),
    };

    ObservationWire {
        id: data.id.clone(),
        status: data.status,
        category: vec![data.category.clone()],
        code: data.code.clone(),
        subject: ReferenceWire::to("Patient", &data.subject_id),
        effective_date_time: data.effective_date_time.clone(),
        issued: data.issued.clone(),
        value_quantity,
        value_string,
        reference_range: data
            .reference_range_text
            .iter()
            .map(|text| ReferenceRangeWire { text: text.clone() })
            .collect(),
    }
}

pub(crate) fn wire_to_domain(wire: ObservationWire) -> Result<ObservationData, FhirError> {
    let subject_id = wire.subject.target_id("Patient", "Observation.subject")?;

    let value = match (wire.value_quantity, wire.value_string) {
        (Some(quantity), None) => ObservationValue::Quantity(quantity),
        (None, Some(text)) => ObservationValue::Text(text),
        (Some(_), Some(_)) => {
            return Err(FhirError::Translation(format!(
                "Observation {} has both valueQuantity and valueString",
                wire.id
            )))
        }
        (None, None) => {
            return Err(FhirError::Translation(format!(
                "Observation {} has no value",
                wire.id
            )))
        }
    };

    let category = exactly_one(wire.category).ok_or_else(|| {
        FhirError::Translation(format!(
            "Observation {} must carry exactly one category",
            wire.id
        ))
    })?;

    if wire.reference_range.len() > 1 {
        return Err(FhirError::Translation(format!(
            "Observation {} carries more than one reference range",
            wire.id
        )));
    }
    let reference_range_text = wire.reference_range.into_iter().next().map(|r| r.text);

    Ok(ObservationData {
        id: wire.id,
        status: wire.status,
        category,
        code: wire.code,
        subject_id,
        effective_date_time: wire.effective_date_time,
        issued: wire.issued,
        value,
        reference_range_text,
    })
}
