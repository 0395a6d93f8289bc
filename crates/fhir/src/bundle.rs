//! FHIR transaction Bundle for one lab report.
//!
//! Responsibilities:
//! - Render a [`BundleData`] as compact JSON with a fixed entry order
//! - Parse bundle JSON strictly, reporting the failing path on schema mismatch
//! - Reject bundles whose shape is not canonical (entry order, request URLs, result links)
//!
//! Entry order is fixed: Patient, DocumentReference, DiagnosticReport, then the Observations
//! sorted by id. Every entry is a `PUT <Type>/<id>` request so re-submitting a bundle is an
//! idempotent upsert.

use crate::diagnostic_report::{self, DiagnosticReportData, DiagnosticReportWire};
use crate::document_reference::{self, DocumentReferenceData, DocumentReferenceWire};
use crate::observation::{self, ObservationData, ObservationWire};
use crate::patient::{self, PatientData, PatientWire};
use crate::FhirError;
use serde::{Deserialize, Serialize};

const BUNDLE_RESOURCE_TYPE: &str = "Bundle";
const BUNDLE_TYPE: &str = "transaction";
const REQUEST_METHOD: &str = "PUT";

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for everything rendered into one bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct BundleData {
    pub patient: PatientData,
    pub document: DocumentReferenceData,
    pub report: DiagnosticReportData,
    /// Sorted ascending by id, with no repeats.
    pub observations: Vec<ObservationData>,
}

// ============================================================================
// Public LabBundle operations
// ============================================================================

/// Lab bundle operations.
///
/// This is a zero-sized type used for namespacing bundle-related operations.
/// All methods are associated functions.
pub struct LabBundle;

impl LabBundle {
    /// Render a bundle as compact JSON.
    ///
    /// Rendering is a pure function of `data`: the same carrier always produces the same bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::InvalidInput`] if the observations are not strictly ascending by
    /// id or the report's result links do not list exactly those observations in order.
    /// Returns [`FhirError::Json`] if serialisation fails.
    pub fn render(data: &BundleData) -> Result<String, FhirError> {
        check_canonical(data).map_err(FhirError::InvalidInput)?;
        let wire = domain_to_wire(data);
        Ok(serde_json::to_string(&wire)?)
    }

    /// Parse a bundle from JSON text.
    ///
    /// This uses `serde_path_to_error` to surface a best-effort path (e.g. `entry[3].resource.status`)
    /// to the failing field when the JSON does not match the wire schema.
    ///
    /// # Errors
    ///
    /// Returns [`FhirError::Translation`] if:
    /// - the JSON does not match the wire schema, or has unknown keys,
    /// - the bundle is not a `transaction` bundle,
    /// - entries are out of order or a request is not `PUT <Type>/<id>`,
    /// - any resource fails its own translation checks,
    /// - the parsed bundle is not canonical.
    pub fn parse(json_text: &str) -> Result<BundleData, FhirError> {
        let mut deserializer = serde_json::Deserializer::from_str(json_text);

        let wire = match serde_path_to_error::deserialize::<_, BundleWire>(&mut deserializer) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() || path == "." {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(FhirError::Translation(format!(
                    "Bundle schema mismatch at {path}: {source}"
                )));
            }
        };

        let data = wire_to_domain(wire)?;
        check_canonical(&data).map_err(FhirError::Translation)?;
        Ok(data)
    }
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct BundleWire {
    #[serde(rename = "resourceType")]
    resource_type: String,
    #[serde(rename = "type")]
    bundle_type: String,
    entry: Vec<EntryWire>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(deny_unknown_fields)]
struct EntryWire {
    #[serde(rename = "fullUrl")]
    full_url: String,
    resource: ResourceWire,
    request: RequestWire,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "resourceType")]
enum ResourceWire {
    Patient(PatientWire),
    DocumentReference(DocumentReferenceWire),
    DiagnosticReport(DiagnosticReportWire),
    Observation(ObservationWire),
}

impl ResourceWire {
    fn resource_type(&self) -> &'static str {
        match self {
            ResourceWire::Patient(_) => "Patient",
            ResourceWire::DocumentReference(_) => "DocumentReference",
            ResourceWire::DiagnosticReport(_) => "DiagnosticReport",
            ResourceWire::Observation(_) => "Observation",
        }
    }

    fn id(&self) -> &str {
        match self {
            ResourceWire::Patient(r) => &r.id,
            ResourceWire::DocumentReference(r) => &r.id,
            ResourceWire::DiagnosticReport(r) => &r.id,
            ResourceWire::Observation(r) => &r.id,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
struct RequestWire {
    method: String,
    url: String,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

fn entry(resource: ResourceWire) -> EntryWire {
    let url = format!("{}/{}", resource.resource_type(), resource.id());
    EntryWire {
        full_url: url.clone(),
        resource,
        request: RequestWire {
            method: REQUEST_METHOD.to_string(),
            url,
        },
    }
}

fn domain_to_wire(data: &BundleData) -> BundleWire {
    let mut entries = Vec::with_capacity(3 + data.observations.len());
    entries.push(entry(ResourceWire::Patient(patient::domain_to_wire(
        &data.patient,
    ))));
    entries.push(entry(ResourceWire::DocumentReference(
        document_reference::domain_to_wire(&data.document),
    )));
    entries.push(entry(ResourceWire::DiagnosticReport(
        diagnostic_report::domain_to_wire(&data.report),
    )));
    entries.extend(
        data.observations
            .iter()
            .map(|obs| entry(ResourceWire::Observation(observation::domain_to_wire(obs)))),
    );

    BundleWire {
        resource_type: BUNDLE_RESOURCE_TYPE.to_string(),
        bundle_type: BUNDLE_TYPE.to_string(),
        entry: entries,
    }
}

fn wire_to_domain(wire: BundleWire) -> Result<BundleData, FhirError> {
    if wire.resource_type != BUNDLE_RESOURCE_TYPE {
        return Err(FhirError::Translation(format!(
            "expected resourceType '{BUNDLE_RESOURCE_TYPE}', got '{}'",
            wire.resource_type
        )));
    }
    if wire.bundle_type != BUNDLE_TYPE {
        return Err(FhirError::Translation(format!(
            "expected bundle type '{BUNDLE_TYPE}', got '{}'",
            wire.bundle_type
        )));
    }

    for (index, entry) in wire.entry.iter().enumerate() {
        let expected = format!("{}/{}", entry.resource.resource_type(), entry.resource.id());
        if entry.request.method != REQUEST_METHOD || entry.request.url != expected {
            return Err(FhirError::Translation(format!(
                "entry[{index}] request must be '{REQUEST_METHOD} {expected}', got '{} {}'",
                entry.request.method, entry.request.url
            )));
        }
        if entry.full_url != expected {
            return Err(FhirError::Translation(format!(
                "entry[{index}] fullUrl must be '{expected}', got '{}'",
                entry.full_url
            )));
        }
    }

    let mut resources = wire.entry.into_iter().map(|e| e.resource);

    let patient = match resources.next() {
        Some(ResourceWire::Patient(p)) => patient::wire_to_domain(p)?,
        other => return Err(unexpected_entry(0, "Patient", other.as_ref())),
    };
    let document = match resources.next() {
        Some(ResourceWire::DocumentReference(d)) => document_reference::wire_to_domain(d)?,
        other => return Err(unexpected_entry(1, "DocumentReference", other.as_ref())),
    };
    let report = match resources.next() {
        Some(ResourceWire::DiagnosticReport(r)) => diagnostic_report::wire_to_domain(r)?,
        other => return Err(unexpected_entry(2, "DiagnosticReport", other.as_ref())),
    };

    let mut observations = Vec::new();
    for (offset, resource) in resources.enumerate() {
        match resource {
            ResourceWire::Observation(o) => observations.push(observation::wire_to_domain(o)?),
            other => return Err(unexpected_entry(3 + offset, "Observation", Some(&other))),
        }
    }

    Ok(BundleData {
        patient,
        document,
        report,
        observations,
    })
}

fn unexpected_entry(index: usize, expected: &str, found: Option<&ResourceWire>) -> FhirError {
    let found = found.map_or("nothing", |r| r.resource_type());
    FhirError::Translation(format!(
        "entry[{index}] must be a {expected}, found {found}"
    ))
}

/// Checks the ordering and linking rules every rendered bundle satisfies.
fn check_canonical(data: &BundleData) -> Result<(), String> {
    for pair in data.observations.windows(2) {
        if pair[0].id >= pair[1].id {
            return Err(format!(
                "observations must be strictly ascending by id ('{}' precedes '{}')",
                pair[0].id, pair[1].id
            ));
        }
    }

    let observation_ids = data.observations.iter().map(|o| o.id.as_str());
    if !observation_ids.eq(data.report.result_ids.iter().map(String::as_str)) {
        return Err(format!(
            "DiagnosticReport {} results do not match the bundle's observations",
            data.report.id
        ));
    }

    Ok(())
}
