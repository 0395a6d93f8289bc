//! Deterministic identifiers.
//!
//! Two uses share one algorithm family:
//! - the upload dedup key is the SHA-256 of the raw file bytes;
//! - a resource id is `<tag>-<first 16 hex chars>` of the SHA-256 of a canonical key.
//!
//! The canonical key is a JSON object with sorted keys (including `type`) and compact
//! separators, so the same business fields always hash to the same id and changing any of
//! them changes it.

use crate::constants::{DOCUMENT_TAG, ID_HEX_LEN, MEASUREMENT_TAG, REPORT_TAG, SUBJECT_TAG};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use labflow_types::Sha256Hash;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Dedup key for an uploaded file.
pub fn file_hash(bytes: &[u8]) -> Sha256Hash {
    Sha256Hash::digest(bytes)
}

/// Canonical key text: a sorted, compact JSON object of `type` plus `fields`.
pub fn canonical_key(kind: &str, fields: &[(&str, &str)]) -> String {
    let mut sorted: BTreeMap<&str, &str> = fields.iter().copied().collect();
    sorted.insert("type", kind);

    let object: Map<String, Value> = sorted
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::String(v.to_string())))
        .collect();
    Value::Object(object).to_string()
}

/// `<tag>-<hex prefix>` over the canonical key of `kind` and `fields`.
pub fn resource_id(tag: &str, kind: &str, fields: &[(&str, &str)]) -> String {
    let digest = Sha256Hash::digest(canonical_key(kind, fields)).to_hex();
    format!("{tag}-{}", &digest[..ID_HEX_LEN])
}

/// Id of a measurement resource.
///
/// Key fields: subject, collection time, analyte code, value and unit. Anything else
/// (reference range, result time, original spelling) does not affect identity.
pub fn measurement_id(subject: &str, time: &str, code: &str, value: &str, unit: &str) -> String {
    resource_id(
        MEASUREMENT_TAG,
        "measurement",
        &[
            ("subject", subject),
            ("time", time),
            ("code", code),
            ("value", value),
            ("unit", unit),
        ],
    )
}

pub fn subject_id(subject: &str) -> String {
    resource_id(SUBJECT_TAG, "subject", &[("subject", subject)])
}

pub fn document_id(file_hash: &Sha256Hash) -> String {
    resource_id(DOCUMENT_TAG, "document", &[("fileHash", &file_hash.to_hex())])
}

/// Id of the report-summary resource; one per subject and document.
pub fn report_id(subject: &str, file_hash: &Sha256Hash) -> String {
    resource_id(
        REPORT_TAG,
        "report",
        &[("subject", subject), ("fileHash", &file_hash.to_hex())],
    )
}

/// Base64 of the raw digest bytes, as embedded in an attachment hash. Does not re-hash.
pub fn attachment_hash(file_hash: &Sha256Hash) -> String {
    STANDARD.encode(file_hash.as_bytes())
}
