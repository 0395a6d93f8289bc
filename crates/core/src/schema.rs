//! Typed intermediate representation of an extracted lab report.
//!
//! Everything in this module is produced by the schema validator (or by a correction, which
//! goes through the same validator). Nothing here is optional-everything: a measurement value
//! is a closed sum type, and times are parsed before they are stored.
//!
//! The serialised form of [`LabPayload`] is the canonical payload JSON: it uses camelCase
//! field names and is accepted back by the validator unchanged.

use crate::constants::MAX_QUALITATIVE_LEN;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use labflow_types::Sha256Hash;
use labflow_uuid::RecordId;
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;

// ============================================================================
// Clinical time
// ============================================================================

/// A collection, result or report time.
///
/// Lab reports frequently print a date with no time of day. Such values stay date-only all
/// the way into the bundle rather than being padded with an invented midnight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ClinicalTime {
    Date(NaiveDate),
    DateTime(DateTime<Utc>),
}

impl ClinicalTime {
    /// Parses a date (`2024-01-15`), an RFC 3339 date-time, or a naive date-time (read as UTC).
    pub fn parse(input: &str) -> Result<Self, String> {
        let input = input.trim();
        if let Ok(date) = NaiveDate::parse_from_str(input, "%Y-%m-%d") {
            return Ok(ClinicalTime::Date(date));
        }
        if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
            return Ok(ClinicalTime::DateTime(dt.with_timezone(&Utc)));
        }
        for format in [
            "%Y-%m-%dT%H:%M:%S%.f",
            "%Y-%m-%d %H:%M:%S%.f",
            "%Y-%m-%dT%H:%M",
            "%Y-%m-%d %H:%M",
        ] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
                return Ok(ClinicalTime::DateTime(naive.and_utc()));
            }
        }
        Err(format!(
            "'{input}' is not a date (YYYY-MM-DD) or date-time (RFC 3339)"
        ))
    }

    /// Canonical text form: `YYYY-MM-DD`, or RFC 3339 in UTC with a `Z` suffix.
    pub fn canonical(&self) -> String {
        match self {
            ClinicalTime::Date(date) => date.format("%Y-%m-%d").to_string(),
            ClinicalTime::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        }
    }

    /// Full instant form; a date-only value becomes midnight UTC.
    pub fn instant(&self) -> String {
        self.start().to_rfc3339_opts(SecondsFormat::AutoSi, true)
    }

    /// Earliest instant covered by this time.
    pub fn start(&self) -> DateTime<Utc> {
        match self {
            ClinicalTime::Date(date) => date.and_time(chrono::NaiveTime::MIN).and_utc(),
            ClinicalTime::DateTime(dt) => *dt,
        }
    }

    /// True when this time lies after `now`. A date is in the future only once the whole
    /// day is.
    pub fn is_after(&self, now: DateTime<Utc>) -> bool {
        match self {
            ClinicalTime::Date(date) => *date > now.date_naive(),
            ClinicalTime::DateTime(dt) => *dt > now,
        }
    }
}

impl Ord for ClinicalTime {
    fn cmp(&self, other: &Self) -> Ordering {
        let rank = |t: &ClinicalTime| match t {
            ClinicalTime::Date(_) => 0u8,
            ClinicalTime::DateTime(_) => 1u8,
        };
        self.start()
            .cmp(&other.start())
            .then_with(|| rank(self).cmp(&rank(other)))
    }
}

impl PartialOrd for ClinicalTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ClinicalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl Serialize for ClinicalTime {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for ClinicalTime {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        ClinicalTime::parse(&s).map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Measurement values
// ============================================================================

/// Comparison operator attached to a censored numeric result (`<0.1`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComparisonOperator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl ComparisonOperator {
    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonOperator::LessThan => "<",
            ComparisonOperator::LessOrEqual => "<=",
            ComparisonOperator::GreaterThan => ">",
            ComparisonOperator::GreaterOrEqual => ">=",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol.trim() {
            "<" => Some(ComparisonOperator::LessThan),
            "<=" => Some(ComparisonOperator::LessOrEqual),
            ">" => Some(ComparisonOperator::GreaterThan),
            ">=" => Some(ComparisonOperator::GreaterOrEqual),
            _ => None,
        }
    }
}

/// Discriminant of a [`MeasurementValue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValueKind {
    Numeric,
    OperatorNumeric,
    Qualitative,
}

impl ValueKind {
    /// Accepts the camelCase and snake_case spellings.
    pub fn parse(input: &str) -> Option<Self> {
        match input.trim() {
            "numeric" => Some(ValueKind::Numeric),
            "operatorNumeric" | "operator_numeric" => Some(ValueKind::OperatorNumeric),
            "qualitative" => Some(ValueKind::Qualitative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::Numeric => "numeric",
            ValueKind::OperatorNumeric => "operatorNumeric",
            ValueKind::Qualitative => "qualitative",
        }
    }
}

/// Result value of one measurement. Exactly one branch exists by construction.
#[derive(Clone, Debug, PartialEq)]
pub enum MeasurementValue {
    Numeric(f64),
    OperatorNumeric {
        operator: ComparisonOperator,
        value: f64,
    },
    Qualitative(String),
}

impl MeasurementValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            MeasurementValue::Numeric(_) => ValueKind::Numeric,
            MeasurementValue::OperatorNumeric { .. } => ValueKind::OperatorNumeric,
            MeasurementValue::Qualitative(_) => ValueKind::Qualitative,
        }
    }

    /// The numeric part, if any.
    pub fn number(&self) -> Option<f64> {
        match self {
            MeasurementValue::Numeric(value) | MeasurementValue::OperatorNumeric { value, .. } => {
                Some(*value)
            }
            MeasurementValue::Qualitative(_) => None,
        }
    }

    /// Canonical text used in identifiers: `95`, `<0.1`, or the trimmed qualitative text.
    pub fn canonical(&self) -> String {
        match self {
            MeasurementValue::Numeric(value) => format_number(*value),
            MeasurementValue::OperatorNumeric { operator, value } => {
                format!("{}{}", operator.symbol(), format_number(*value))
            }
            MeasurementValue::Qualitative(text) => text.trim().to_string(),
        }
    }

    /// Checks the invariants every validated value satisfies.
    pub fn check(&self) -> Result<(), String> {
        match self {
            MeasurementValue::Numeric(value) | MeasurementValue::OperatorNumeric { value, .. } => {
                if value.is_finite() {
                    Ok(())
                } else {
                    Err(format!("numeric value {value} is not finite"))
                }
            }
            MeasurementValue::Qualitative(text) => {
                let len = text.trim().chars().count();
                if len == 0 {
                    Err("qualitative value is empty".into())
                } else if len > MAX_QUALITATIVE_LEN {
                    Err(format!(
                        "qualitative value exceeds {MAX_QUALITATIVE_LEN} characters"
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// Shortest decimal form of `value` (`95`, `0.1`); negative zero prints as `0`.
pub fn format_number(value: f64) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{value}")
}

// ============================================================================
// Payload
// ============================================================================

/// One analyte result.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub original_name: String,
    /// Code hint supplied by the extractor, or the resolved code on a normalized copy.
    pub normalized_code: Option<String>,
    pub value: MeasurementValue,
    pub original_unit: Option<String>,
    /// Unit hint supplied by the extractor, or the canonical unit on a normalized copy.
    pub normalized_unit: Option<String>,
    pub reference_range_text: Option<String>,
    pub collection_time: ClinicalTime,
    /// Left empty when the report does not state it; defaulted at projection time.
    pub result_time: Option<ClinicalTime>,
}

/// A validated extraction payload.
#[derive(Clone, Debug, PartialEq)]
pub struct LabPayload {
    pub schema_version: String,
    /// Subject identifier as printed on the report (informational; identity comes from the upload).
    pub subject_identifier: Option<String>,
    pub report_date: Option<ClinicalTime>,
    pub ordering_provider: Option<String>,
    pub performing_lab: Option<String>,
    pub measurements: Vec<Measurement>,
}

impl LabPayload {
    /// Canonical JSON form of this payload.
    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::to_value(self)
    }

    /// Earliest collection time across all measurements.
    pub fn earliest_collection(&self) -> Option<ClinicalTime> {
        self.measurements.iter().map(|m| m.collection_time).min()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PayloadRecord<'a> {
    schema_version: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    subject_identifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    report_date: Option<ClinicalTime>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ordering_provider: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    performing_lab: Option<&'a str>,
    measurements: Vec<MeasurementRecord<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MeasurementRecord<'a> {
    original_name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized_code: Option<&'a str>,
    value_kind: ValueKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    numeric_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    operator: Option<ComparisonOperator>,
    #[serde(skip_serializing_if = "Option::is_none")]
    qualitative_value: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    original_unit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    normalized_unit: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reference_range_text: Option<&'a str>,
    collection_time: ClinicalTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_time: Option<ClinicalTime>,
}

impl<'a> From<&'a Measurement> for MeasurementRecord<'a> {
    fn from(m: &'a Measurement) -> Self {
        let (numeric_value, operator, qualitative_value) = match &m.value {
            MeasurementValue::Numeric(value) => (Some(*value), None, None),
            MeasurementValue::OperatorNumeric { operator, value } => {
                (Some(*value), Some(*operator), None)
            }
            MeasurementValue::Qualitative(text) => (None, None, Some(text.as_str())),
        };
        MeasurementRecord {
            original_name: &m.original_name,
            normalized_code: m.normalized_code.as_deref(),
            value_kind: m.value.kind(),
            numeric_value,
            operator,
            qualitative_value,
            original_unit: m.original_unit.as_deref(),
            normalized_unit: m.normalized_unit.as_deref(),
            reference_range_text: m.reference_range_text.as_deref(),
            collection_time: m.collection_time,
            result_time: m.result_time,
        }
    }
}

impl Serialize for LabPayload {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        PayloadRecord {
            schema_version: &self.schema_version,
            subject_identifier: self.subject_identifier.as_deref(),
            report_date: self.report_date,
            ordering_provider: self.ordering_provider.as_deref(),
            performing_lab: self.performing_lab.as_deref(),
            measurements: self.measurements.iter().map(MeasurementRecord::from).collect(),
        }
        .serialize(serializer)
    }
}

// ============================================================================
// Validation results
// ============================================================================

/// One field-level validation error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldError {
    /// Path into the payload, e.g. `measurements[0].collectionTime`.
    pub field_path: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field_path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field_path: field_path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field_path, self.message)
    }
}

/// Outcome of validating a raw payload. Invalid input is data, not an error.
#[derive(Clone, Debug, PartialEq)]
pub enum ValidationOutcome {
    Valid(LabPayload),
    /// Every error found, in payload order.
    Invalid(Vec<FieldError>),
}

impl ValidationOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ValidationOutcome::Valid(_))
    }
}

// ============================================================================
// Stored records
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionKind {
    Original,
    Corrected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Valid,
    Invalid,
}

/// Payload of a version: a typed record, or the rejected raw input with its errors.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "validationStatus")]
pub enum VersionContent {
    #[serde(rename = "valid")]
    Valid { payload: LabPayload },
    #[serde(rename = "invalid")]
    Invalid {
        raw: serde_json::Value,
        #[serde(rename = "validationErrors")]
        errors: Vec<FieldError>,
    },
}

/// Content of a version before the store assigns its number.
#[derive(Clone, Debug, PartialEq)]
pub struct NewVersion {
    pub id: RecordId,
    pub report_id: RecordId,
    pub kind: VersionKind,
    pub schema_version: String,
    pub content: VersionContent,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

/// One immutable snapshot of extracted data for a report.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntermediateVersion {
    pub id: RecordId,
    pub report_id: RecordId,
    /// Starts at 1 and increases by one per version of the same report.
    pub version_number: u32,
    pub kind: VersionKind,
    pub schema_version: String,
    #[serde(flatten)]
    pub content: VersionContent,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl IntermediateVersion {
    pub fn from_new(new: NewVersion, version_number: u32) -> Self {
        Self {
            id: new.id,
            report_id: new.report_id,
            version_number,
            kind: new.kind,
            schema_version: new.schema_version,
            content: new.content,
            created_at: new.created_at,
            created_by: new.created_by,
        }
    }

    pub fn validation_status(&self) -> ValidationStatus {
        match self.content {
            VersionContent::Valid { .. } => ValidationStatus::Valid,
            VersionContent::Invalid { .. } => ValidationStatus::Invalid,
        }
    }

    /// The typed payload, when this version is valid.
    pub fn payload(&self) -> Option<&LabPayload> {
        match &self.content {
            VersionContent::Valid { payload } => Some(payload),
            VersionContent::Invalid { .. } => None,
        }
    }

    pub fn validation_errors(&self) -> &[FieldError] {
        match &self.content {
            VersionContent::Valid { .. } => &[],
            VersionContent::Invalid { errors, .. } => errors,
        }
    }
}

/// The latest valid version by number.
pub fn current_version(versions: &[IntermediateVersion]) -> Option<&IntermediateVersion> {
    versions
        .iter()
        .filter(|v| v.validation_status() == ValidationStatus::Valid)
        .max_by_key(|v| v.version_number)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleMode {
    Initial,
    Regeneration,
}

/// One generated bundle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BundleArtifact {
    pub id: RecordId,
    pub report_id: RecordId,
    pub source_version_id: RecordId,
    pub bundle_content: String,
    /// SHA-256 of `bundle_content`.
    pub content_hash: Sha256Hash,
    pub generated_at: DateTime<Utc>,
    pub mode: BundleMode,
}

/// One field-level correction.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EditHistoryEntry {
    pub id: RecordId,
    /// The corrected version this change produced.
    pub version_id: RecordId,
    pub field_path: String,
    pub old_value: serde_json::Value,
    pub new_value: serde_json::Value,
    pub editor: String,
    pub timestamp: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn clinical_time_accepts_dates_and_date_times() {
        assert_eq!(
            ClinicalTime::parse("2024-01-15").expect("date").canonical(),
            "2024-01-15"
        );
        assert_eq!(
            ClinicalTime::parse("2024-01-15T08:30:00+02:00")
                .expect("offset date-time")
                .canonical(),
            "2024-01-15T06:30:00Z"
        );
        assert_eq!(
            ClinicalTime::parse("2024-01-15 08:30")
                .expect("naive date-time")
                .canonical(),
            "2024-01-15T08:30:00Z"
        );
        assert!(ClinicalTime::parse("15/01/2024").is_err());
    }

    #[test]
    fn date_only_is_future_only_after_the_day() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 9, 0, 0).unwrap();
        let today = ClinicalTime::parse("2024-01-15").expect("date");
        let tomorrow = ClinicalTime::parse("2024-01-16").expect("date");
        let later_today = ClinicalTime::parse("2024-01-15T10:00:00Z").expect("date-time");
        assert!(!today.is_after(now));
        assert!(tomorrow.is_after(now));
        assert!(later_today.is_after(now));
    }

    #[test]
    fn clinical_time_orders_chronologically() {
        let date = ClinicalTime::parse("2024-01-15").expect("date");
        let morning = ClinicalTime::parse("2024-01-15T08:00:00Z").expect("date-time");
        let earlier = ClinicalTime::parse("2024-01-14T23:00:00Z").expect("date-time");
        let mut times = vec![morning, date, earlier];
        times.sort();
        assert_eq!(times, vec![earlier, date, morning]);
        assert_eq!(date.instant(), "2024-01-15T00:00:00Z");
    }

    #[test]
    fn canonical_values_are_compact() {
        assert_eq!(MeasurementValue::Numeric(95.0).canonical(), "95");
        assert_eq!(MeasurementValue::Numeric(-0.0).canonical(), "0");
        assert_eq!(
            MeasurementValue::OperatorNumeric {
                operator: ComparisonOperator::LessThan,
                value: 0.1
            }
            .canonical(),
            "<0.1"
        );
        assert_eq!(
            MeasurementValue::Qualitative(" Negative ".into()).canonical(),
            "Negative"
        );
    }

    #[test]
    fn value_check_rejects_non_finite_and_empty() {
        assert!(MeasurementValue::Numeric(f64::NAN).check().is_err());
        assert!(MeasurementValue::Qualitative("  ".into()).check().is_err());
        assert!(MeasurementValue::Numeric(1.5).check().is_ok());
    }

    #[test]
    fn payload_serialises_with_camel_case_and_value_kind() {
        let payload = LabPayload {
            schema_version: "1.0".into(),
            subject_identifier: None,
            report_date: None,
            ordering_provider: None,
            performing_lab: Some("Acme Labs".into()),
            measurements: vec![Measurement {
                original_name: "Glucose".into(),
                normalized_code: None,
                value: MeasurementValue::Numeric(95.0),
                original_unit: Some("mg/dL".into()),
                normalized_unit: None,
                reference_range_text: None,
                collection_time: ClinicalTime::parse("2024-01-15").expect("date"),
                result_time: None,
            }],
        };
        let value = payload.to_value().expect("serialise");
        assert_eq!(value["schemaVersion"], "1.0");
        assert_eq!(value["performingLab"], "Acme Labs");
        let m = &value["measurements"][0];
        assert_eq!(m["valueKind"], "numeric");
        assert_eq!(m["numericValue"], 95.0);
        assert_eq!(m["collectionTime"], "2024-01-15");
        assert!(m.get("resultTime").is_none());
        assert!(m.get("qualitativeValue").is_none());
    }

    #[test]
    fn current_version_is_latest_valid() {
        let report_id = RecordId::new();
        let make = |number: u32, content: VersionContent| {
            IntermediateVersion::from_new(
                NewVersion {
                    id: RecordId::new(),
                    report_id,
                    kind: if number == 1 {
                        VersionKind::Original
                    } else {
                        VersionKind::Corrected
                    },
                    schema_version: "1.0".into(),
                    content,
                    created_at: Utc::now(),
                    created_by: "test".into(),
                },
                number,
            )
        };
        let invalid = || VersionContent::Invalid {
            raw: serde_json::json!({}),
            errors: vec![FieldError::new("measurements", "required")],
        };
        let valid = || VersionContent::Valid {
            payload: LabPayload {
                schema_version: "1.0".into(),
                subject_identifier: None,
                report_date: None,
                ordering_provider: None,
                performing_lab: None,
                measurements: vec![],
            },
        };

        let versions = vec![make(1, invalid()), make(2, valid()), make(3, invalid())];
        let current = current_version(&versions).expect("a valid version exists");
        assert_eq!(current.version_number, 2);
        assert!(current_version(&versions[..1]).is_none());
    }

    #[test]
    fn invalid_version_serialises_status_and_errors() {
        let version = IntermediateVersion::from_new(
            NewVersion {
                id: RecordId::new(),
                report_id: RecordId::new(),
                kind: VersionKind::Original,
                schema_version: "1.0".into(),
                content: VersionContent::Invalid {
                    raw: serde_json::json!({"measurements": []}),
                    errors: vec![FieldError::new("measurements", "at least one measurement is required")],
                },
                created_at: Utc::now(),
                created_by: "extractor".into(),
            },
            1,
        );
        let json = serde_json::to_value(&version).expect("serialise version");
        assert_eq!(json["validationStatus"], "invalid");
        assert_eq!(json["kind"], "original");
        assert_eq!(json["versionNumber"], 1);
        assert_eq!(json["validationErrors"][0]["fieldPath"], "measurements");
    }
}
