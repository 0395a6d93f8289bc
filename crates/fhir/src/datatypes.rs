//! FHIR R4 general-purpose datatypes shared by the lab resources.
//!
//! These are used directly on the wire and inside the domain carriers, because their JSON
//! shape and their domain shape are the same thing. Optional members are omitted from the
//! output rather than rendered as `null`.

use crate::FhirError;
use serde::{Deserialize, Serialize};

/// A business identifier within a namespace.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Identifier {
    pub system: String,
    pub value: String,
}

impl Identifier {
    pub fn new(system: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            value: value.into(),
        }
    }
}

/// A code defined by a terminology system.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Coding {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl Coding {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            code: code.into(),
            display: None,
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }
}

/// A concept expressed as one or more codings plus optional text.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeableConcept {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub coding: Vec<Coding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl CodeableConcept {
    /// A concept with a single coding and no text.
    pub fn single(coding: Coding) -> Self {
        Self {
            coding: vec![coding],
            text: None,
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// Comparator for a measured quantity whose true value lies beyond the stated one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QuantityComparator {
    #[serde(rename = "<")]
    LessThan,
    #[serde(rename = "<=")]
    LessOrEqual,
    #[serde(rename = ">")]
    GreaterThan,
    #[serde(rename = ">=")]
    GreaterOrEqual,
}

impl QuantityComparator {
    /// Returns the FHIR symbol for this comparator.
    pub fn symbol(&self) -> &'static str {
        match self {
            QuantityComparator::LessThan => "<",
            QuantityComparator::LessOrEqual => "<=",
            QuantityComparator::GreaterThan => ">",
            QuantityComparator::GreaterOrEqual => ">=",
        }
    }

    /// Parses a FHIR comparator symbol.
    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "<" => Some(QuantityComparator::LessThan),
            "<=" => Some(QuantityComparator::LessOrEqual),
            ">" => Some(QuantityComparator::GreaterThan),
            ">=" => Some(QuantityComparator::GreaterOrEqual),
            _ => None,
        }
    }
}

/// A measured amount.
///
/// `system` and `code` are only populated when the unit is a recognised UCUM unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Quantity {
    pub value: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparator: Option<QuantityComparator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

/// Content metadata for the source document.
///
/// `hash` is the base64 encoding of the raw digest bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Attachment {
    #[serde(rename = "contentType")]
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub title: String,
    pub hash: String,
}

// ============================================================================
// Reference helpers (crate-internal)
// ============================================================================

/// Wire representation of a FHIR Reference.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct ReferenceWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
}

impl ReferenceWire {
    /// A literal reference to `<resource_type>/<id>`.
    pub(crate) fn to(resource_type: &str, id: &str) -> Self {
        Self {
            reference: Some(format!("{resource_type}/{id}")),
            display: None,
        }
    }

    /// A display-only reference with no target.
    pub(crate) fn display_only(display: &str) -> Self {
        Self {
            reference: None,
            display: Some(display.to_string()),
        }
    }

    /// Extracts the target id from a literal reference of the expected type.
    pub(crate) fn target_id(&self, resource_type: &str, field: &str) -> Result<String, FhirError> {
        let reference = self.reference.as_deref().ok_or_else(|| {
            FhirError::Translation(format!("{field} is missing a literal reference"))
        })?;
        match reference.split_once('/') {
            Some((kind, id)) if kind == resource_type && !id.is_empty() => Ok(id.to_string()),
            _ => Err(FhirError::Translation(format!(
                "{field} must reference {resource_type}/<id>, got '{reference}'"
            ))),
        }
    }
}

/// Returns the only element of `items`, or `None` when there are zero or several.
pub(crate) fn exactly_one<T>(items: Vec<T>) -> Option<T> {
    let mut iter = items.into_iter();
    let first = iter.next()?;
    match iter.next() {
        Some(_) => None,
        None => Some(first),
    }
}
