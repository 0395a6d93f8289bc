//! FHIR Patient wire model.
//!
//! The patient resource carries nothing beyond the subject identifier: labflow never
//! receives demographics from the extraction, so none are rendered.

use crate::datatypes::{exactly_one, Identifier};
use crate::FhirError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for the subject of a lab report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PatientData {
    /// Resource id (`pat-<hex>`).
    pub id: String,

    /// The subject identifier in its namespace.
    pub identifier: Identifier,

    pub active: bool,
}

// ============================================================================
// Wire types (internal)
// ============================================================================

/// Wire representation of a Patient resource (the `resourceType` tag is owned by the bundle).
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct PatientWire {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub active: bool,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

pub(crate) fn domain_to_wire(data: &PatientData) -> PatientWire {
    PatientWire {
        id: data.id.clone(),
        identifier: vec![data.identifier.clone()],
        active: data.active,
    }
}

pub(crate) fn wire_to_domain(wire: PatientWire) -> Result<PatientData, FhirError> {
    let PatientWire {
        id,
        identifier,
        active,
    } = wire;

    let identifier = exactly_one(identifier).ok_or_else(|| {
        FhirError::Translation(format!("Patient {id} must carry exactly one identifier"))
    })?;

    Ok(PatientData {
        id,
        identifier,
        active,
    })
}
