//! Schema validation of untrusted extraction payloads.
//!
//! The validator walks the raw JSON by hand rather than deserialising into a struct, so that
//! it can report *every* problem in one pass instead of stopping at the first. A payload is
//! either fully valid or rejected with the complete list of field errors; nothing is ever
//! partially accepted.
//!
//! Rules, in order, per measurement:
//! 1. structure: required fields present, known fields only, correct JSON types
//! 2. value kind: exactly one of numeric / operator + numeric / qualitative
//! 3. time: collection, result and report times are not after `now`
//! 4. numeric sanity: finite values, non-negative where the policy says so
//!
//! Field names are accepted in camelCase and in the snake_case spellings extractors emit.
//! Error paths always use the camelCase name.

use crate::config::CoreConfig;
use crate::constants::{
    MAX_CODE_LEN, MAX_METADATA_LEN, MAX_NAME_LEN, MAX_QUALITATIVE_LEN, MAX_REFERENCE_RANGE_LEN,
    MAX_UNIT_LEN,
};
use crate::schema::{
    ClinicalTime, ComparisonOperator, FieldError, LabPayload, Measurement, MeasurementValue,
    ValidationOutcome, ValueKind,
};
use chrono::{DateTime, Utc};
use labflow_types::{NonEmptyText, TextError};
use serde_json::{Map, Value};
use std::sync::Arc;

const ROOT_PATH: &str = "payload";

/// (canonical name, accepted spellings)
type FieldTable = &'static [(&'static str, &'static [&'static str])];

const TOP_LEVEL_FIELDS: FieldTable = &[
    ("schemaVersion", &["schemaVersion", "schema_version"]),
    ("subjectIdentifier", &["subjectIdentifier", "subject_identifier"]),
    ("reportDate", &["reportDate", "report_date"]),
    ("orderingProvider", &["orderingProvider", "ordering_provider"]),
    ("performingLab", &["performingLab", "performing_lab"]),
    ("measurements", &["measurements"]),
];

const MEASUREMENT_FIELDS: FieldTable = &[
    (
        "originalName",
        &[
            "originalName",
            "original_name",
            "originalAnalyteName",
            "original_analyte_name",
        ],
    ),
    (
        "normalizedCode",
        &[
            "normalizedCode",
            "normalized_code",
            "normalizedAnalyteCode",
            "normalized_analyte_code",
        ],
    ),
    (
        "valueKind",
        &["valueKind", "value_kind", "valueType", "value_type"],
    ),
    ("numericValue", &["numericValue", "numeric_value"]),
    ("operator", &["operator"]),
    ("qualitativeValue", &["qualitativeValue", "qualitative_value"]),
    ("originalUnit", &["originalUnit", "original_unit", "unit"]),
    (
        "normalizedUnit",
        &[
            "normalizedUnit",
            "normalized_unit",
            "normalizedUnitUcum",
            "normalized_unit_ucum",
        ],
    ),
    (
        "referenceRangeText",
        &[
            "referenceRangeText",
            "reference_range_text",
            "referenceRange",
            "reference_range",
        ],
    ),
    (
        "collectionTime",
        &[
            "collectionTime",
            "collection_time",
            "collectionDate",
            "collection_date",
            "collectionDatetime",
            "collection_datetime",
        ],
    ),
    (
        "resultTime",
        &["resultTime", "result_time", "resultDatetime", "result_datetime"],
    ),
];

/// Validates raw payloads against the intermediate schema.
#[derive(Clone, Debug)]
pub struct SchemaValidator {
    config: Arc<CoreConfig>,
}

impl SchemaValidator {
    pub fn new(config: Arc<CoreConfig>) -> Self {
        Self { config }
    }

    /// Validate `raw` as of `now`.
    ///
    /// `now` is injected so that re-validating the same payload at the same instant is
    /// deterministic and so temporal rules are testable.
    pub fn validate(&self, raw: &Value, now: DateTime<Utc>) -> ValidationOutcome {
        let mut errors = Errors::default();
        let payload = self.validate_payload(raw, now, &mut errors);

        match payload {
            Some(payload) if errors.is_empty() => ValidationOutcome::Valid(payload),
            _ => {
                tracing::debug!(error_count = errors.0.len(), "payload failed validation");
                ValidationOutcome::Invalid(errors.0)
            }
        }
    }

    /// Rewrites a raw payload, valid or not, the way a validated payload serialises.
    ///
    /// Known fields move to their camelCase name, blank fields are dropped, and text,
    /// numbers, operators and times are written in canonical form. The schema version and
    /// an unambiguous value kind are filled in. Anything that cannot be read is kept as
    /// given. A payload that validates maps to exactly its validated JSON, so a correction
    /// can be diffed against rejected input without reporting spelling differences.
    pub fn canonical_form(&self, raw: &Value) -> Value {
        let Some(object) = raw.as_object() else {
            return raw.clone();
        };
        let mut out = renamed(object, TOP_LEVEL_FIELDS);
        out.entry("schemaVersion")
            .or_insert_with(|| Value::from(self.config.schema_version()));
        for key in ["schemaVersion", "subjectIdentifier", "orderingProvider", "performingLab"] {
            canonical_text(&mut out, key);
        }
        canonical_time(&mut out, "reportDate");
        if let Some(Value::Array(items)) = out.get_mut("measurements") {
            for item in items.iter_mut() {
                if let Value::Object(measurement) = item {
                    *measurement = canonical_measurement(measurement);
                }
            }
        }
        Value::Object(out)
    }

    fn validate_payload(
        &self,
        raw: &Value,
        now: DateTime<Utc>,
        errors: &mut Errors,
    ) -> Option<LabPayload> {
        let Some(object) = raw.as_object() else {
            errors.push(ROOT_PATH, "payload must be a JSON object");
            return None;
        };
        let fields = Fields::new(object, TOP_LEVEL_FIELDS, None, errors);

        let schema_version = match text(fields.get("schemaVersion"), "schemaVersion", 50, errors)
        {
            Slot::Present(version) if version != self.config.schema_version() => {
                errors.push(
                    "schemaVersion",
                    format!(
                        "unsupported schema version '{version}' (expected '{}')",
                        self.config.schema_version()
                    ),
                );
                None
            }
            Slot::Present(version) => Some(version),
            Slot::Absent => Some(self.config.schema_version().to_string()),
            Slot::Invalid => None,
        };

        let subject_identifier = text(
            fields.get("subjectIdentifier"),
            "subjectIdentifier",
            MAX_METADATA_LEN,
            errors,
        )
        .into_option();
        let report_date = time(fields.get("reportDate"), "reportDate", now, errors).into_option();
        let ordering_provider = text(
            fields.get("orderingProvider"),
            "orderingProvider",
            MAX_METADATA_LEN,
            errors,
        )
        .into_option();
        let performing_lab = text(
            fields.get("performingLab"),
            "performingLab",
            MAX_METADATA_LEN,
            errors,
        )
        .into_option();

        let measurements = match fields.get("measurements") {
            None => {
                errors.push("measurements", "at least one measurement is required");
                None
            }
            Some(Value::Array(items)) if items.is_empty() => {
                errors.push("measurements", "at least one measurement is required");
                None
            }
            Some(Value::Array(items)) => {
                let parsed: Vec<Option<Measurement>> = items
                    .iter()
                    .enumerate()
                    .map(|(index, item)| self.validate_measurement(index, item, now, errors))
                    .collect();
                parsed.into_iter().collect::<Option<Vec<_>>>()
            }
            Some(_) => {
                errors.push("measurements", "must be an array");
                None
            }
        };

        Some(LabPayload {
            schema_version: schema_version?,
            subject_identifier,
            report_date,
            ordering_provider,
            performing_lab,
            measurements: measurements?,
        })
    }

    fn validate_measurement(
        &self,
        index: usize,
        raw: &Value,
        now: DateTime<Utc>,
        errors: &mut Errors,
    ) -> Option<Measurement> {
        let prefix = format!("measurements[{index}]");
        let Some(object) = raw.as_object() else {
            errors.push(&prefix, "measurement must be a JSON object");
            return None;
        };
        let fields = Fields::new(object, MEASUREMENT_FIELDS, Some(&prefix), errors);
        let path = |name: &str| format!("{prefix}.{name}");

        let original_name = text(
            fields.get("originalName"),
            &path("originalName"),
            MAX_NAME_LEN,
            errors,
        )
        .required(&path("originalName"), errors);
        let normalized_code = text(
            fields.get("normalizedCode"),
            &path("normalizedCode"),
            MAX_CODE_LEN,
            errors,
        )
        .into_option();

        let value_kind = match text(fields.get("valueKind"), &path("valueKind"), 50, errors) {
            Slot::Present(kind) => match ValueKind::parse(&kind) {
                Some(kind) => Slot::Present(kind),
                None => {
                    errors.push(
                        path("valueKind"),
                        format!("'{kind}' is not one of numeric, operatorNumeric, qualitative"),
                    );
                    Slot::Invalid
                }
            },
            Slot::Absent => Slot::Absent,
            Slot::Invalid => Slot::Invalid,
        };
        let numeric = number(fields.get("numericValue"), &path("numericValue"), errors);
        let operator = operator(fields.get("operator"), &path("operator"), errors);
        let qualitative = text(
            fields.get("qualitativeValue"),
            &path("qualitativeValue"),
            MAX_QUALITATIVE_LEN,
            errors,
        );

        let value = resolve_value(&prefix, value_kind, numeric, operator, qualitative, errors);

        let original_unit = text(
            fields.get("originalUnit"),
            &path("originalUnit"),
            MAX_UNIT_LEN,
            errors,
        )
        .into_option();
        let normalized_unit = text(
            fields.get("normalizedUnit"),
            &path("normalizedUnit"),
            MAX_UNIT_LEN,
            errors,
        )
        .into_option();
        let reference_range_text = text(
            fields.get("referenceRangeText"),
            &path("referenceRangeText"),
            MAX_REFERENCE_RANGE_LEN,
            errors,
        )
        .into_option();

        let collection_time = time(
            fields.get("collectionTime"),
            &path("collectionTime"),
            now,
            errors,
        )
        .required(&path("collectionTime"), errors);
        let result_time = time(fields.get("resultTime"), &path("resultTime"), now, errors)
            .into_option();

        if let (Some(name), Some(value)) = (&original_name, &value) {
            self.check_sign(&path("numericValue"), name, normalized_code.as_deref(), value, errors);
        }

        Some(Measurement {
            original_name: original_name?,
            normalized_code,
            value: value?,
            original_unit,
            normalized_unit,
            reference_range_text,
            collection_time: collection_time?,
            result_time,
        })
    }

    /// Rejects negative results for analytes the numeric policy marks non-negative.
    fn check_sign(
        &self,
        path: &str,
        name: &str,
        hint: Option<&str>,
        value: &MeasurementValue,
        errors: &mut Errors,
    ) {
        let Some(number) = value.number() else {
            return;
        };
        if number >= 0.0 {
            return;
        }
        let analyte = self.config.tables().resolve_analyte(name, hint);
        if self
            .config
            .numeric_policy()
            .requires_non_negative(&analyte.code)
        {
            errors.push(
                path,
                format!("{} cannot be negative (got {number})", analyte.code),
            );
        }
    }
}

// ============================================================================
// Helper types (internal)
// ============================================================================

#[derive(Default)]
struct Errors(Vec<FieldError>);

impl Errors {
    fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError::new(path, message));
    }

    fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// A field that may be absent, present but unusable (already reported), or usable.
#[derive(Debug, PartialEq)]
enum Slot<T> {
    Absent,
    Invalid,
    Present(T),
}

impl<T> Slot<T> {
    fn into_option(self) -> Option<T> {
        match self {
            Slot::Present(value) => Some(value),
            Slot::Absent | Slot::Invalid => None,
        }
    }

    fn required(self, path: &str, errors: &mut Errors) -> Option<T> {
        match self {
            Slot::Present(value) => Some(value),
            Slot::Absent => {
                errors.push(path, "is required");
                None
            }
            Slot::Invalid => None,
        }
    }

    fn is_set(&self) -> bool {
        !matches!(self, Slot::Absent)
    }
}

/// Spelling-tolerant view of one JSON object.
struct Fields<'a> {
    object: &'a Map<String, Value>,
    table: FieldTable,
}

impl<'a> Fields<'a> {
    /// Reports unknown keys and keys given under more than one spelling.
    fn new(
        object: &'a Map<String, Value>,
        table: FieldTable,
        prefix: Option<&str>,
        errors: &mut Errors,
    ) -> Self {
        let path = |name: &str| match prefix {
            Some(prefix) => format!("{prefix}.{name}"),
            None => name.to_string(),
        };

        for key in object.keys() {
            if !table.iter().any(|(_, spellings)| spellings.contains(&key.as_str())) {
                errors.push(path(key), "unknown field");
            }
        }
        for (canonical, spellings) in table {
            let given: Vec<&str> = spellings
                .iter()
                .copied()
                .filter(|s| object.get(*s).is_some_and(|v| !v.is_null()))
                .collect();
            if given.len() > 1 {
                errors.push(
                    path(canonical),
                    format!("given more than once (as {})", given.join(", ")),
                );
            }
        }

        Self { object, table }
    }

    /// First non-null value under any spelling of `canonical`.
    fn get(&self, canonical: &str) -> Option<&'a Value> {
        let spellings = self
            .table
            .iter()
            .find(|(name, _)| *name == canonical)
            .map_or(&[][..], |(_, spellings)| *spellings);
        spellings
            .iter()
            .filter_map(|s| self.object.get(*s))
            .find(|v| !v.is_null())
    }
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

/// Copy of `object` with known keys under their canonical name. Null and blank values are
/// dropped; unknown keys, and a second spelling of a key already taken, are kept as given.
fn renamed(object: &Map<String, Value>, table: FieldTable) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in object {
        let blank = match value {
            Value::Null => true,
            Value::String(s) => s.trim().is_empty(),
            _ => false,
        };
        if blank {
            continue;
        }
        let canonical = table
            .iter()
            .find(|(_, spellings)| spellings.contains(&key.as_str()))
            .map(|(name, _)| *name)
            .filter(|name| !out.contains_key(*name));
        out.insert(canonical.unwrap_or(key.as_str()).to_string(), value.clone());
    }
    out
}

fn canonical_measurement(object: &Map<String, Value>) -> Map<String, Value> {
    let mut out = renamed(object, MEASUREMENT_FIELDS);
    for key in [
        "originalName",
        "normalizedCode",
        "qualitativeValue",
        "originalUnit",
        "normalizedUnit",
        "referenceRangeText",
    ] {
        canonical_text(&mut out, key);
    }
    canonical_time(&mut out, "collectionTime");
    canonical_time(&mut out, "resultTime");

    if let Some(value) = out.get_mut("numericValue") {
        let parsed = match value {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        };
        if let Some(n) = parsed.filter(|n| n.is_finite()) {
            *value = Value::from(n);
        }
    }
    if let Some(Value::String(symbol)) = out.get_mut("operator") {
        if let Some(op) = ComparisonOperator::from_symbol(symbol.as_str()) {
            *symbol = op.symbol().to_string();
        }
    }

    let kind = match out.get("valueKind") {
        Some(Value::String(kind)) => ValueKind::parse(kind),
        Some(_) => None,
        None => match (
            out.contains_key("numericValue"),
            out.contains_key("operator"),
            out.contains_key("qualitativeValue"),
        ) {
            (true, false, false) => Some(ValueKind::Numeric),
            (true, true, false) => Some(ValueKind::OperatorNumeric),
            (false, false, true) => Some(ValueKind::Qualitative),
            _ => None,
        },
    };
    if let Some(kind) = kind {
        out.insert("valueKind".to_string(), Value::from(kind.as_str()));
    }
    out
}

fn canonical_text(object: &mut Map<String, Value>, key: &str) {
    if let Some(Value::String(s)) = object.get_mut(key) {
        *s = s.trim().to_string();
    }
}

fn canonical_time(object: &mut Map<String, Value>, key: &str) {
    if let Some(Value::String(s)) = object.get_mut(key) {
        if let Ok(time) = ClinicalTime::parse(s.as_str()) {
            *s = time.canonical();
        }
    }
}

/// Trimmed text, bounded in characters. Blank strings count as absent.
fn text(value: Option<&Value>, path: &str, max: usize, errors: &mut Errors) -> Slot<String> {
    match value {
        None => Slot::Absent,
        Some(Value::String(s)) => match NonEmptyText::with_max_len(s, max) {
            Ok(text) => Slot::Present(text.into_string()),
            Err(TextError::Empty) => Slot::Absent,
            Err(TextError::TooLong { max, actual }) => {
                errors.push(
                    path,
                    format!("exceeds {max} characters (got {actual})"),
                );
                Slot::Invalid
            }
        },
        Some(_) => {
            errors.push(path, "must be a string");
            Slot::Invalid
        }
    }
}

/// A finite number, given as a JSON number or a numeric string.
fn number(value: Option<&Value>, path: &str, errors: &mut Errors) -> Slot<f64> {
    let parsed = match value {
        None => return Slot::Absent,
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) if s.trim().is_empty() => return Slot::Absent,
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match parsed {
        Some(n) if n.is_finite() => Slot::Present(n),
        Some(n) => {
            errors.push(path, format!("must be a finite number (got {n})"));
            Slot::Invalid
        }
        None => {
            errors.push(path, "must be a number");
            Slot::Invalid
        }
    }
}

/// A comparison operator. Anything other than the four symbols, however long, is unknown.
fn operator(value: Option<&Value>, path: &str, errors: &mut Errors) -> Slot<ComparisonOperator> {
    match value {
        None => Slot::Absent,
        Some(Value::String(s)) if s.trim().is_empty() => Slot::Absent,
        Some(Value::String(s)) => match ComparisonOperator::from_symbol(s) {
            Some(op) => Slot::Present(op),
            None => {
                errors.push(path, format!("'{}' is not one of <, <=, >, >=", s.trim()));
                Slot::Invalid
            }
        },
        Some(_) => {
            errors.push(path, "must be a string");
            Slot::Invalid
        }
    }
}

/// A date or date-time that is not after `now`.
fn time(
    value: Option<&Value>,
    path: &str,
    now: DateTime<Utc>,
    errors: &mut Errors,
) -> Slot<ClinicalTime> {
    let raw = match text(value, path, 64, errors) {
        Slot::Present(raw) => raw,
        Slot::Absent => return Slot::Absent,
        Slot::Invalid => return Slot::Invalid,
    };
    match ClinicalTime::parse(&raw) {
        Ok(parsed) if parsed.is_after(now) => {
            errors.push(
                path,
                format!("{} is in the future", parsed.canonical()),
            );
            Slot::Invalid
        }
        Ok(parsed) => Slot::Present(parsed),
        Err(message) => {
            errors.push(path, message);
            Slot::Invalid
        }
    }
}

/// Builds the value branch, reporting any ambiguity.
fn resolve_value(
    prefix: &str,
    kind: Slot<ValueKind>,
    numeric: Slot<f64>,
    operator: Slot<ComparisonOperator>,
    qualitative: Slot<String>,
    errors: &mut Errors,
) -> Option<MeasurementValue> {
    let path = |name: &str| format!("{prefix}.{name}");

    if matches!(kind, Slot::Invalid)
        || matches!(numeric, Slot::Invalid)
        || matches!(operator, Slot::Invalid)
        || matches!(qualitative, Slot::Invalid)
    {
        return None;
    }

    let kind = match kind {
        Slot::Present(kind) => kind,
        _ => match (numeric.is_set(), operator.is_set(), qualitative.is_set()) {
            (true, false, false) => ValueKind::Numeric,
            (true, true, false) => ValueKind::OperatorNumeric,
            (false, false, true) => ValueKind::Qualitative,
            (false, false, false) => {
                errors.push(
                    prefix,
                    "no value: one of numericValue or qualitativeValue is required",
                );
                return None;
            }
            (false, true, _) => {
                errors.push(path("operator"), "operator requires numericValue");
                return None;
            }
            (true, _, true) => {
                errors.push(
                    prefix,
                    "ambiguous value: both numericValue and qualitativeValue are set",
                );
                return None;
            }
        },
    };

    let (need_numeric, need_operator, need_qualitative) = match kind {
        ValueKind::Numeric => (true, false, false),
        ValueKind::OperatorNumeric => (true, true, false),
        ValueKind::Qualitative => (false, false, true),
    };

    let mut consistent = true;
    for (name, needed, given) in [
        ("numericValue", need_numeric, numeric.is_set()),
        ("operator", need_operator, operator.is_set()),
        ("qualitativeValue", need_qualitative, qualitative.is_set()),
    ] {
        if needed && !given {
            errors.push(
                path(name),
                format!("is required when valueKind is {}", kind.as_str()),
            );
            consistent = false;
        } else if !needed && given {
            errors.push(
                path(name),
                format!("is not allowed when valueKind is {}", kind.as_str()),
            );
            consistent = false;
        }
    }
    if !consistent {
        return None;
    }

    match (kind, numeric, operator, qualitative) {
        (ValueKind::Numeric, Slot::Present(value), _, _) => Some(MeasurementValue::Numeric(value)),
        (ValueKind::OperatorNumeric, Slot::Present(value), Slot::Present(operator), _) => {
            Some(MeasurementValue::OperatorNumeric { operator, value })
        }
        (ValueKind::Qualitative, _, _, Slot::Present(text)) => {
            Some(MeasurementValue::Qualitative(text))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn validator() -> SchemaValidator {
        SchemaValidator::new(Arc::new(CoreConfig::default()))
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn glucose() -> Value {
        json!({
            "schemaVersion": "1.0",
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": 95,
                "originalUnit": "mg/dL",
                "collectionTime": "2024-01-15"
            }]
        })
    }

    fn errors_of(outcome: ValidationOutcome) -> Vec<FieldError> {
        match outcome {
            ValidationOutcome::Invalid(errors) => errors,
            ValidationOutcome::Valid(payload) => panic!("expected invalid, got {payload:?}"),
        }
    }

    fn paths(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|e| e.field_path.as_str()).collect()
    }

    #[test]
    fn accepts_simple_glucose_payload() {
        let outcome = validator().validate(&glucose(), now());
        let ValidationOutcome::Valid(payload) = outcome else {
            panic!("expected valid payload, got {outcome:?}");
        };
        let m = &payload.measurements[0];
        assert_eq!(m.value, MeasurementValue::Numeric(95.0));
        assert_eq!(m.collection_time.canonical(), "2024-01-15");
        assert!(m.result_time.is_none());
        assert!(m.normalized_code.is_none());
    }

    #[test]
    fn infers_operator_and_qualitative_kinds() {
        let raw = json!({
            "measurements": [
                {"originalName": "CRP", "operator": "<", "numericValue": "0.1", "collectionTime": "2024-01-15"},
                {"originalName": "HCG", "qualitativeValue": "Negative", "collectionTime": "2024-01-15"}
            ]
        });
        let ValidationOutcome::Valid(payload) = validator().validate(&raw, now()) else {
            panic!("expected valid payload");
        };
        assert_eq!(
            payload.measurements[0].value,
            MeasurementValue::OperatorNumeric {
                operator: ComparisonOperator::LessThan,
                value: 0.1
            }
        );
        assert_eq!(
            payload.measurements[1].value,
            MeasurementValue::Qualitative("Negative".into())
        );
        assert_eq!(payload.schema_version, "1.0");
    }

    #[test]
    fn accepts_snake_case_spellings() {
        let raw = json!({
            "schema_version": "1.0",
            "performing_lab": "Acme Labs",
            "measurements": [{
                "original_analyte_name": "Sodium",
                "value_type": "numeric",
                "numeric_value": 140,
                "unit": "mmol/L",
                "reference_range": "135-145",
                "collection_datetime": "2024-01-15T08:30:00",
                "result_datetime": "2024-01-15T14:00:00Z"
            }]
        });
        let ValidationOutcome::Valid(payload) = validator().validate(&raw, now()) else {
            panic!("expected valid payload");
        };
        let m = &payload.measurements[0];
        assert_eq!(m.original_unit.as_deref(), Some("mmol/L"));
        assert_eq!(m.reference_range_text.as_deref(), Some("135-145"));
        assert_eq!(m.collection_time.canonical(), "2024-01-15T08:30:00Z");
        assert_eq!(
            m.result_time.map(|t| t.canonical()).as_deref(),
            Some("2024-01-15T14:00:00Z")
        );
        assert_eq!(payload.performing_lab.as_deref(), Some("Acme Labs"));
    }

    #[test]
    fn reports_every_error_in_one_pass() {
        let raw = json!({
            "schemaVersion": "2.0",
            "measurements": [
                {"originalName": "Glucose", "numericValue": 95},
                {"originalName": "Sodium", "numericValue": 140, "qualitativeValue": "high", "collectionTime": "2024-01-15"},
                {"originalName": "Potassium", "operator": "=", "numericValue": 4, "collectionTime": "2024-01-15"},
                {"originalName": "Glucose", "numericValue": -3, "collectionTime": "2099-01-01"},
                {"numericValue": 1, "collectionTime": "2024-01-15", "colour": "red"}
            ]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(
            paths(&errors),
            vec![
                "schemaVersion",
                "measurements[0].collectionTime",
                "measurements[1]",
                "measurements[2].operator",
                "measurements[3].collectionTime",
                "measurements[3].numericValue",
                "measurements[4].colour",
                "measurements[4].originalName",
            ]
        );
        assert!(errors[6].message.contains("unknown field"));
        assert!(errors[5].message.contains("GLUCOSE cannot be negative"));
    }

    #[test]
    fn requires_at_least_one_measurement() {
        let errors = errors_of(validator().validate(&json!({"measurements": []}), now()));
        assert_eq!(paths(&errors), vec!["measurements"]);

        let errors = errors_of(validator().validate(&json!({}), now()));
        assert_eq!(paths(&errors), vec!["measurements"]);

        let errors = errors_of(validator().validate(&json!([1, 2]), now()));
        assert_eq!(paths(&errors), vec!["payload"]);
    }

    #[test]
    fn explicit_kind_must_match_branches() {
        let raw = json!({
            "measurements": [
                {"originalName": "CRP", "valueKind": "operatorNumeric", "numericValue": 0.1, "collectionTime": "2024-01-15"},
                {"originalName": "HCG", "valueKind": "qualitative", "qualitativeValue": "Neg", "numericValue": 0, "collectionTime": "2024-01-15"},
                {"originalName": "X", "valueKind": "fuzzy", "numericValue": 1, "collectionTime": "2024-01-15"}
            ]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(
            paths(&errors),
            vec![
                "measurements[0].operator",
                "measurements[1].numericValue",
                "measurements[2].valueKind",
            ]
        );
        assert!(errors[0].message.contains("required when valueKind is operatorNumeric"));
    }

    #[test]
    fn rejects_non_finite_and_non_numeric_values() {
        let raw = json!({
            "measurements": [
                {"originalName": "A", "numericValue": "NaN", "collectionTime": "2024-01-15"},
                {"originalName": "B", "numericValue": "ninety", "collectionTime": "2024-01-15"},
                {"originalName": "C", "numericValue": true, "collectionTime": "2024-01-15"}
            ]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(errors.len(), 3);
        assert!(errors[0].message.contains("finite"));
        assert_eq!(errors[1].message, "must be a number");
    }

    #[test]
    fn negative_values_allowed_for_unlisted_analytes() {
        let raw = json!({
            "measurements": [{"originalName": "Base excess", "numericValue": -2.5, "collectionTime": "2024-01-15"}]
        });
        assert!(validator().validate(&raw, now()).is_valid());
    }

    #[test]
    fn rejects_future_result_and_report_times() {
        let raw = json!({
            "reportDate": "2024-03-01",
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": 95,
                "collectionTime": "2024-02-01T11:00:00Z",
                "resultTime": "2024-02-01T12:00:01Z"
            }]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(
            paths(&errors),
            vec!["reportDate", "measurements[0].resultTime"]
        );
    }

    #[test]
    fn enforces_length_limits() {
        let raw = json!({
            "measurements": [{
                "originalName": "G".repeat(501),
                "numericValue": 1,
                "originalUnit": "u".repeat(101),
                "collectionTime": "2024-01-15"
            }]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(
            paths(&errors),
            vec!["measurements[0].originalName", "measurements[0].originalUnit"]
        );
        assert!(errors[0].message.contains("exceeds 500 characters"));
    }

    #[test]
    fn rejects_field_given_under_two_spellings() {
        let raw = json!({
            "measurements": [{
                "originalName": "Glucose",
                "original_name": "Glucose",
                "numericValue": 95,
                "collectionTime": "2024-01-15"
            }]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(paths(&errors), vec!["measurements[0].originalName"]);
        assert!(errors[0].message.contains("more than once"));
    }

    #[test]
    fn canonical_form_validates_to_the_same_payload() {
        let raw = json!({
            "performing_lab": "Acme",
            "measurements": [
                {"original_name": "CRP", "operator": "<=", "numeric_value": "5", "unit": "mg/L", "collection_date": "2024-01-15"},
                {"original_name": "HCG", "qualitative_value": "Negative", "collection_date": "2024-01-15 09:00"}
            ]
        });
        let ValidationOutcome::Valid(first) = validator().validate(&raw, now()) else {
            panic!("expected valid payload");
        };
        let canonical = first.to_value().expect("serialise");
        let ValidationOutcome::Valid(second) = validator().validate(&canonical, now()) else {
            panic!("canonical form should validate");
        };
        assert_eq!(first, second);
    }

    #[test]
    fn validation_is_repeatable() {
        let a = validator().validate(&glucose(), now());
        let b = validator().validate(&glucose(), now());
        assert_eq!(a, b);
    }

    #[test]
    fn accepts_extraction_adapter_payload() {
        let raw = json!({
            "schema_version": "1.0",
            "subject_identifier": "patient-12345",
            "report_date": "2024-01-15T10:30:00Z",
            "ordering_provider": "Dr. Jane Smith",
            "performing_lab": "Quest Diagnostics",
            "measurements": [{
                "original_analyte_name": "Glucose",
                "normalized_analyte_code": "GLU",
                "value_type": "numeric",
                "numeric_value": 95.0,
                "operator": null,
                "qualitative_value": null,
                "original_unit": "mg/dL",
                "normalized_unit_ucum": "mg/dL",
                "reference_range_text": "70-100 mg/dL",
                "collection_datetime": "2024-01-15T08:00:00Z",
                "result_datetime": "2024-01-15T10:30:00Z"
            }]
        });
        let outcome = validator().validate(&raw, now());
        let ValidationOutcome::Valid(payload) = outcome else {
            panic!("expected valid payload, got {outcome:?}");
        };
        let m = &payload.measurements[0];
        assert_eq!(m.normalized_unit.as_deref(), Some("mg/dL"));
        assert_eq!(m.normalized_code.as_deref(), Some("GLU"));
        assert_eq!(m.value, MeasurementValue::Numeric(95.0));
        assert_eq!(payload.subject_identifier.as_deref(), Some("patient-12345"));
    }

    #[test]
    fn long_operator_is_reported_as_unknown() {
        let raw = json!({
            "measurements": [{
                "originalName": "CRP",
                "operator": "=<=",
                "numericValue": 1,
                "collectionTime": "2024-01-15"
            }]
        });
        let errors = errors_of(validator().validate(&raw, now()));
        assert_eq!(paths(&errors), vec!["measurements[0].operator"]);
        assert_eq!(errors[0].message, "'=<=' is not one of <, <=, >, >=");
    }

    #[test]
    fn canonical_form_of_a_valid_payload_is_its_validated_json() {
        let raw = json!({
            "performing_lab": " Acme ",
            "measurements": [
                {"original_name": "CRP", "operator": " <= ", "numeric_value": "5", "unit": "mg/L", "collection_date": "2024-01-15"},
                {"original_name": "HCG", "qualitative_value": "Negative", "reference_range": "", "collection_date": "2024-01-15 09:00"}
            ]
        });
        let ValidationOutcome::Valid(payload) = validator().validate(&raw, now()) else {
            panic!("expected valid payload");
        };
        assert_eq!(
            validator().canonical_form(&raw),
            payload.to_value().expect("serialise")
        );
    }

    #[test]
    fn canonical_form_keeps_what_it_cannot_read() {
        let raw = json!({
            "measurements": [{"original_name": "Glucose", "numeric_value": "abc", "colour": "red"}]
        });
        assert_eq!(
            validator().canonical_form(&raw),
            json!({
                "schemaVersion": "1.0",
                "measurements": [{
                    "originalName": "Glucose",
                    "numericValue": "abc",
                    "valueKind": "numeric",
                    "colour": "red"
                }]
            })
        );
    }
}
