//! Edit history for manual corrections.
//!
//! A correction is a full proposed payload. It is validated exactly like an extraction; if it
//! fails, nothing is persisted. If it passes, the canonical JSON of the base and the proposal
//! are diffed leaf by leaf, and each changed leaf becomes one [`FieldChange`].

use crate::schema::{
    EditHistoryEntry, FieldError, IntermediateVersion, LabPayload, ValidationOutcome,
    VersionContent,
};
use crate::validation::SchemaValidator;
use crate::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeSet;

/// One changed leaf value.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldChange {
    /// e.g. `measurements[0].numericValue`
    pub field_path: String,
    /// `null` when the field did not exist before.
    pub old_value: Value,
    /// `null` when the field was removed.
    pub new_value: Value,
}

/// What to do with a proposed correction.
#[derive(Clone, Debug, PartialEq)]
pub enum CorrectionPlan {
    /// Persist `payload` as a new corrected version with these changes.
    Apply {
        payload: LabPayload,
        changes: Vec<FieldChange>,
    },
    /// The proposal failed validation; persist nothing.
    Rejected(Vec<FieldError>),
    /// The proposal is identical to the base; persist nothing.
    Unchanged,
}

/// Result of submitting a correction.
#[derive(Clone, Debug, PartialEq)]
pub enum CorrectionOutcome {
    /// A new corrected version is now current.
    Applied {
        version: IntermediateVersion,
        entries: Vec<EditHistoryEntry>,
    },
    /// Nothing was persisted; the current version is unchanged.
    Rejected(Vec<FieldError>),
    Unchanged,
}

/// Plans a correction of `base` to `proposed`.
///
/// An invalid base is compared in its canonical form, so renamed keys, filled-in defaults
/// and reformatted numbers or times are not reported as changes.
///
/// # Errors
///
/// Returns [`CoreError::Serialization`] if a payload cannot be rendered as JSON.
pub fn plan_correction(
    validator: &SchemaValidator,
    base: &IntermediateVersion,
    proposed: &Value,
    now: DateTime<Utc>,
) -> CoreResult<CorrectionPlan> {
    let payload = match validator.validate(proposed, now) {
        ValidationOutcome::Valid(payload) => payload,
        ValidationOutcome::Invalid(errors) => return Ok(CorrectionPlan::Rejected(errors)),
    };

    let old = match &base.content {
        VersionContent::Valid { payload } => payload.to_value().map_err(CoreError::Serialization)?,
        VersionContent::Invalid { raw, .. } => validator.canonical_form(raw),
    };
    let new = payload.to_value().map_err(CoreError::Serialization)?;
    let changes = diff(&old, &new);

    if changes.is_empty() {
        return Ok(CorrectionPlan::Unchanged);
    }
    Ok(CorrectionPlan::Apply { payload, changes })
}

/// Leaf-level differences between two JSON documents, in path order.
///
/// Objects are compared key by key (union of keys, sorted); arrays index by index, with
/// missing elements on either side compared against `null`. Anything else is a leaf.
pub fn diff(old: &Value, new: &Value) -> Vec<FieldChange> {
    let mut changes = Vec::new();
    diff_into(String::new(), old, new, &mut changes);
    changes
}

fn diff_into(path: String, old: &Value, new: &Value, changes: &mut Vec<FieldChange>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_into(
                    child,
                    a.get(key).unwrap_or(&Value::Null),
                    b.get(key).unwrap_or(&Value::Null),
                    changes,
                );
            }
        }
        (Value::Array(a), Value::Array(b)) => {
            for index in 0..a.len().max(b.len()) {
                diff_into(
                    format!("{path}[{index}]"),
                    a.get(index).unwrap_or(&Value::Null),
                    b.get(index).unwrap_or(&Value::Null),
                    changes,
                );
            }
        }
        // A whole container appearing or disappearing is reported at its leaves.
        (Value::Object(_) | Value::Array(_), Value::Null) if !is_empty_container(old) => {
            diff_into(path, old, &empty_like(old), changes)
        }
        (Value::Null, Value::Object(_) | Value::Array(_)) if !is_empty_container(new) => {
            diff_into(path, &empty_like(new), new, changes)
        }
        _ if old != new => changes.push(FieldChange {
            field_path: path,
            old_value: old.clone(),
            new_value: new.clone(),
        }),
        _ => {}
    }
}

fn is_empty_container(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn empty_like(value: &Value) -> Value {
    match value {
        Value::Array(_) => Value::Array(Vec::new()),
        _ => Value::Object(serde_json::Map::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::schema::{NewVersion, VersionContent, VersionKind};
    use chrono::TimeZone;
    use labflow_uuid::RecordId;
    use serde_json::json;
    use std::sync::Arc;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()
    }

    fn validator() -> SchemaValidator {
        SchemaValidator::new(Arc::new(CoreConfig::default()))
    }

    fn base_version(raw: Value) -> IntermediateVersion {
        let content = match validator().validate(&raw, now()) {
            ValidationOutcome::Valid(payload) => VersionContent::Valid { payload },
            ValidationOutcome::Invalid(errors) => VersionContent::Invalid { raw, errors },
        };
        IntermediateVersion::from_new(
            NewVersion {
                id: RecordId::new(),
                report_id: RecordId::new(),
                kind: VersionKind::Original,
                schema_version: "1.0".into(),
                content,
                created_at: now(),
                created_by: "extractor".into(),
            },
            1,
        )
    }

    fn glucose(value: Value) -> Value {
        json!({
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": value,
                "originalUnit": "mg/dL",
                "collectionTime": "2024-01-15"
            }]
        })
    }

    #[test]
    fn diff_reports_changed_leaves_with_paths() {
        let old = json!({"a": 1, "list": [{"x": "1"}, {"x": "2"}], "gone": true});
        let new = json!({"a": 2, "list": [{"x": "1"}, {"x": "3"}, {"x": "4"}], "added": "y"});
        let changes = diff(&old, &new);
        let paths: Vec<&str> = changes.iter().map(|c| c.field_path.as_str()).collect();
        assert_eq!(paths, vec!["a", "added", "gone", "list[1].x", "list[2].x"]);
        assert_eq!(changes[2].new_value, Value::Null);
        assert_eq!(changes[4].old_value, Value::Null);
        assert_eq!(changes[4].new_value, json!("4"));
    }

    #[test]
    fn removed_containers_are_reported_by_leaf() {
        let changes = diff(&json!({"m": [{"x": 1}], "e": {}}), &json!({}));
        let paths: Vec<&str> = changes.iter().map(|c| c.field_path.as_str()).collect();
        assert_eq!(paths, vec!["e", "m[0].x"]);
        assert_eq!(changes[0].old_value, json!({}));
    }

    #[test]
    fn identical_documents_have_no_changes() {
        let doc = json!({"a": [1, {"b": null}]});
        assert!(diff(&doc, &doc.clone()).is_empty());
    }

    #[test]
    fn value_correction_produces_one_change() {
        let base = base_version(glucose(json!(95)));
        let plan = plan_correction(&validator(), &base, &glucose(json!(105)), now())
            .expect("plan correction");
        match plan {
            CorrectionPlan::Apply { payload, changes } => {
                assert_eq!(changes.len(), 1);
                assert_eq!(changes[0].field_path, "measurements[0].numericValue");
                assert_eq!(changes[0].old_value, json!(95.0));
                assert_eq!(changes[0].new_value, json!(105.0));
                assert_eq!(payload.measurements[0].value.canonical(), "105");
            }
            other => panic!("expected Apply, got {other:?}"),
        }
    }

    #[test]
    fn spelling_only_differences_are_unchanged() {
        let base = base_version(glucose(json!(95)));
        let proposed = json!({
            "measurements": [{
                "original_name": "Glucose",
                "numeric_value": "95",
                "unit": "mg/dL",
                "collection_date": "2024-01-15"
            }]
        });
        let plan = plan_correction(&validator(), &base, &proposed, now()).expect("plan");
        assert_eq!(plan, CorrectionPlan::Unchanged);
    }

    #[test]
    fn invalid_proposal_is_rejected_whole() {
        let base = base_version(glucose(json!(95)));
        let plan = plan_correction(&validator(), &base, &glucose(json!("abc")), now())
            .expect("plan");
        match plan {
            CorrectionPlan::Rejected(errors) => {
                assert_eq!(errors[0].field_path, "measurements[0].numericValue")
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[test]
    fn correcting_an_invalid_original_records_only_real_edits() {
        let raw = json!({"measurements": [{"originalName": "Glucose", "numericValue": 95, "originalUnit": "mg/dL"}]});
        let base = base_version(raw);
        let plan = plan_correction(&validator(), &base, &glucose(json!(95)), now())
            .expect("plan");
        let CorrectionPlan::Apply { changes, .. } = plan else {
            panic!("expected Apply");
        };
        assert_eq!(
            changes,
            vec![FieldChange {
                field_path: "measurements[0].collectionTime".into(),
                old_value: Value::Null,
                new_value: json!("2024-01-15"),
            }]
        );
    }

    #[test]
    fn invalid_snake_case_original_is_compared_by_meaning() {
        let raw = json!({
            "schema_version": "1.0",
            "measurements": [{
                "original_analyte_name": " Glucose ",
                "value_type": "numeric",
                "numeric_value": "95",
                "unit": "mg/dL",
                "collection_datetime": "2024-01-15T08:00:00",
                "colour": "red"
            }]
        });
        let base = base_version(raw);
        assert!(base.payload().is_none());

        let proposed = json!({
            "measurements": [{
                "originalName": "Glucose",
                "numericValue": 95,
                "originalUnit": "mg/dL",
                "collectionTime": "2024-01-15T08:00:00Z"
            }]
        });
        let plan = plan_correction(&validator(), &base, &proposed, now()).expect("plan");
        let CorrectionPlan::Apply { changes, .. } = plan else {
            panic!("expected Apply");
        };
        let paths: Vec<&str> = changes.iter().map(|c| c.field_path.as_str()).collect();
        assert_eq!(paths, vec!["measurements[0].colour"]);
        assert_eq!(changes[0].new_value, Value::Null);
    }
}
