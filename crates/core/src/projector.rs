//! Resource projector.
//!
//! Turns one validated, normalized payload plus the report's stable metadata into a FHIR
//! transaction bundle. This is a pure function: every id is derived from content, every
//! default is a constant, and measurements are ordered by id. Projecting the same version
//! again yields the same bytes, which is what makes regeneration reproducible.

use crate::constants::{
    ANALYTE_FALLBACK_SYSTEM, DEFAULT_CONTENT_TYPE, DIAGNOSTIC_SERVICE_SECTION_SYSTEM,
    FILE_HASH_SYSTEM, LAB_REPORT_LOINC_CODE, LAB_REPORT_LOINC_DISPLAY, LOINC_SYSTEM,
    OBSERVATION_CATEGORY_CODE, OBSERVATION_CATEGORY_DISPLAY, OBSERVATION_CATEGORY_SYSTEM,
    REPORT_CATEGORY_CODE, REPORT_CATEGORY_DISPLAY, SUBJECT_ID_SYSTEM, UCUM_SYSTEM,
};
use crate::ids;
use crate::normalization::{Annotation, NormalizedPayload};
use crate::schema::{ComparisonOperator, Measurement, MeasurementValue};
use crate::state::ReportRecord;
use crate::{CoreError, CoreResult};
use fhir::{
    Attachment, BundleData, CodeableConcept, Coding, CompositionStatus, DiagnosticReportData,
    DocumentReferenceData, DocumentReferenceStatus, Identifier, LabBundle, ObservationData,
    ObservationValue, PatientData, Quantity, QuantityComparator, ResultStatus,
};
use labflow_types::Sha256Hash;

/// Report facts that do not change across versions.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReportMetadata {
    pub subject_id: String,
    pub original_filename: String,
    pub content_type: String,
    pub file_hash: Sha256Hash,
    pub storage_locator: Option<String>,
}

impl From<&ReportRecord> for ReportMetadata {
    fn from(record: &ReportRecord) -> Self {
        Self {
            subject_id: record.subject_id.as_str().to_string(),
            original_filename: record.original_filename.clone(),
            content_type: record.content_type.clone(),
            file_hash: record.file_hash,
            storage_locator: record.storage_locator.clone(),
        }
    }
}

/// A rendered bundle.
#[derive(Clone, Debug, PartialEq)]
pub struct ProjectedBundle {
    /// Compact JSON, byte-stable for a given input.
    pub content: String,
    /// SHA-256 of `content`.
    pub content_hash: Sha256Hash,
    pub data: BundleData,
}

/// Projects `normalized` into a transaction bundle.
///
/// # Errors
///
/// Returns [`CoreError::ProjectionInvariantViolation`] if the payload breaks a guarantee
/// the validator is supposed to provide (no measurements, an empty analyte code, a
/// non-finite or empty value). Such a payload is never rendered.
pub fn project(normalized: &NormalizedPayload, metadata: &ReportMetadata) -> CoreResult<ProjectedBundle> {
    check_invariants(normalized)?;

    let subject = metadata.subject_id.as_str();
    let patient_id = ids::subject_id(subject);

    let mut observations: Vec<ObservationData> = normalized
        .measurements()
        .map(|(measurement, annotation)| observation(measurement, annotation, subject, &patient_id))
        .collect();
    observations.sort_by(|a, b| a.id.cmp(&b.id));
    let before = observations.len();
    observations.dedup_by(|later, earlier| later.id == earlier.id);
    if observations.len() != before {
        tracing::warn!(
            subject = %subject,
            collapsed = before - observations.len(),
            "identical measurements collapsed into one observation"
        );
    }

    let payload = &normalized.payload;
    let effective = payload
        .report_date
        .or_else(|| payload.earliest_collection())
        .map(|t| t.canonical());

    let report = DiagnosticReportData {
        id: ids::report_id(subject, &metadata.file_hash),
        status: ResultStatus::Final,
        category: CodeableConcept::single(
            Coding::new(DIAGNOSTIC_SERVICE_SECTION_SYSTEM, REPORT_CATEGORY_CODE)
                .with_display(REPORT_CATEGORY_DISPLAY),
        ),
        code: lab_report_code(),
        subject_id: patient_id.clone(),
        effective_date_time: effective,
        performer_display: payload.performing_lab.clone(),
        result_ids: observations.iter().map(|o| o.id.clone()).collect(),
    };

    let content_type = if metadata.content_type.trim().is_empty() {
        DEFAULT_CONTENT_TYPE.to_string()
    } else {
        metadata.content_type.clone()
    };
    let document = DocumentReferenceData {
        id: ids::document_id(&metadata.file_hash),
        identifier: Identifier::new(FILE_HASH_SYSTEM, metadata.file_hash.to_hex()),
        status: DocumentReferenceStatus::Current,
        doc_status: CompositionStatus::Final,
        doc_type: lab_report_code(),
        subject_id: patient_id.clone(),
        attachment: Attachment {
            content_type,
            url: metadata.storage_locator.clone(),
            title: metadata.original_filename.clone(),
            hash: ids::attachment_hash(&metadata.file_hash),
        },
    };

    let patient = PatientData {
        id: patient_id,
        identifier: Identifier::new(SUBJECT_ID_SYSTEM, subject),
        active: true,
    };

    let data = BundleData {
        patient,
        document,
        report,
        observations,
    };
    let content = LabBundle::render(&data)?;
    let content_hash = Sha256Hash::digest(&content);

    Ok(ProjectedBundle {
        content,
        content_hash,
        data,
    })
}

fn check_invariants(normalized: &NormalizedPayload) -> CoreResult<()> {
    let violation = |message: String| {
        tracing::error!(%message, "projection invariant violated");
        Err(CoreError::ProjectionInvariantViolation(message))
    };

    let count = normalized.payload.measurements.len();
    if count == 0 {
        return violation("payload has no measurements".into());
    }
    if normalized.annotations.len() != count {
        return violation(format!(
            "{count} measurements but {} normalization annotations",
            normalized.annotations.len()
        ));
    }
    for (index, (measurement, annotation)) in normalized.measurements().enumerate() {
        if annotation.analyte.code.trim().is_empty() {
            return violation(format!("measurements[{index}] has no analyte code"));
        }
        if let Err(message) = measurement.value.check() {
            return violation(format!("measurements[{index}]: {message}"));
        }
    }
    Ok(())
}

fn observation(
    measurement: &Measurement,
    annotation: &Annotation,
    subject: &str,
    patient_id: &str,
) -> ObservationData {
    let unit = annotation.unit.canonical.as_deref();
    let id = ids::measurement_id(
        subject,
        &measurement.collection_time.canonical(),
        &annotation.analyte.code,
        &measurement.value.canonical(),
        unit.unwrap_or(""),
    );

    let coding = match &annotation.analyte.loinc {
        Some(loinc) => Coding::new(LOINC_SYSTEM, &loinc.code).with_display(&loinc.display),
        None => Coding::new(ANALYTE_FALLBACK_SYSTEM, &annotation.analyte.code),
    };

    let quantity = |value: f64, comparator: Option<QuantityComparator>| {
        let ucum = annotation.unit.ucum.as_ref();
        Quantity {
            value,
            comparator,
            unit: unit.map(str::to_string),
            system: ucum.map(|_| UCUM_SYSTEM.to_string()),
            code: ucum.cloned(),
        }
    };
    let value = match &measurement.value {
        MeasurementValue::Numeric(value) => ObservationValue::Quantity(quantity(*value, None)),
        MeasurementValue::OperatorNumeric { operator, value } => {
            ObservationValue::Quantity(quantity(*value, Some(comparator(*operator))))
        }
        MeasurementValue::Qualitative(text) => ObservationValue::Text(text.trim().to_string()),
    };

    ObservationData {
        id,
        status: ResultStatus::Final,
        category: CodeableConcept::single(
            Coding::new(OBSERVATION_CATEGORY_SYSTEM, OBSERVATION_CATEGORY_CODE)
                .with_display(OBSERVATION_CATEGORY_DISPLAY),
        ),
        code: CodeableConcept::single(coding).with_text(&measurement.original_name),
        subject_id: patient_id.to_string(),
        effective_date_time: measurement.collection_time.canonical(),
        // Result time falls back to collection time here, never in the stored payload.
        issued: measurement
            .result_time
            .unwrap_or(measurement.collection_time)
            .instant(),
        value,
        reference_range_text: measurement.reference_range_text.clone(),
    }
}

fn comparator(operator: ComparisonOperator) -> QuantityComparator {
    match operator {
        ComparisonOperator::LessThan => QuantityComparator::LessThan,
        ComparisonOperator::LessOrEqual => QuantityComparator::LessOrEqual,
        ComparisonOperator::GreaterThan => QuantityComparator::GreaterThan,
        ComparisonOperator::GreaterOrEqual => QuantityComparator::GreaterOrEqual,
    }
}

fn lab_report_code() -> CodeableConcept {
    CodeableConcept::single(
        Coding::new(LOINC_SYSTEM, LAB_REPORT_LOINC_CODE).with_display(LAB_REPORT_LOINC_DISPLAY),
    )
}
