//! FHIR DocumentReference wire model for the uploaded source document.
//!
//! Responsibilities:
//! - Carry the file-hash identifier, document type and attachment metadata
//! - Translate to and from the strict wire shape (`content[].attachment`)

use crate::datatypes::{exactly_one, Attachment, CodeableConcept, Identifier, ReferenceWire};
use crate::FhirError;
use serde::{Deserialize, Serialize};

// ============================================================================
// Public domain-level types
// ============================================================================

/// Domain-level carrier for the source document of a lab report.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DocumentReferenceData {
    /// Resource id (`doc-<hex>`).
    pub id: String,

    /// File-hash identifier of the uploaded bytes.
    pub identifier: Identifier,

    pub status: DocumentReferenceStatus,

    pub doc_status: CompositionStatus,

    /// Kind of document (rendered as `type`).
    pub doc_type: CodeableConcept,

    /// Id of the Patient resource this document is about.
    pub subject_id: String,

    pub attachment: Attachment,
}

/// Status of the document reference itself.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentReferenceStatus {
    Current,
    Superseded,
    EnteredInError,
}

/// Status of the underlying document content.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompositionStatus {
    Preliminary,
    Final,
    Amended,
    EnteredInError,
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct DocumentReferenceWire {
    pub id: String,
    pub identifier: Vec<Identifier>,
    pub status: DocumentReferenceStatus,
    #[serde(rename = "docStatus")]
    pub doc_status: CompositionStatus,
    #[serde(rename = "type")]
    pub doc_type: CodeableConcept,
    pub subject: ReferenceWire,
    pub content: Vec<ContentWire>,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub(crate) struct ContentWire {
    pub attachment: Attachment,
}

// ============================================================================
// Helper functions (internal)
// ============================================================================

pub(crate) fn domain_to_wire(data: &DocumentReferenceData) -> DocumentReferenceWire {
    DocumentReferenceWire {
        id: data.id.clone(),
        identifier: vec![data.identifier.clone()],
        status: data.status,
        doc_status: data.doc_status,
        doc_type: data.doc_type.clone(),
        subject: ReferenceWire::to("Patient", &data.subject_id),
        content: vec![ContentWire {
            attachment: data.attachment.clone(),
        }],
    }
}

pub(crate) fn wire_to_domain(wire: DocumentReferenceWire) -> Result<DocumentReferenceData, FhirError> {
    let subject_id = wire.subject.target_id("Patient", "DocumentReference.subject")?;

    let identifier = exactly_one(wire.identifier).ok_or_else(|| {
        FhirError::Translation(format!(
            "DocumentReference {} must carry exactly one identifier",
            wire.id
        ))
    })?;

    let content = exactly_one(wire.content).ok_or_else(|| {
        FhirError::Translation(format!(
            "DocumentReference {} must carry exactly one content attachment",
            wire.id
        ))
    })?;

    Ok(DocumentReferenceData {
        id: wire.id,
        identifier,
        status: wire.status,
        doc_status: wire.doc_status,
        doc_type: wire.doc_type,
        subject_id,
        attachment: content.attachment,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::datatypes::Coding;

    fn sample() -> DocumentReferenceData {
        DocumentReferenceData {
            id: "doc-0123456789abcdef".into(),
            identifier: Identifier::new("urn:labflow:file-sha256", "ab".repeat(32)),
            status: DocumentReferenceStatus::Current,
            doc_status: CompositionStatus::Final,
            doc_type: CodeableConcept::single(
                Coding::new("http://loinc.org", "11502-2").with_display("Laboratory report"),
            ),
            subject_id: "pat-fedcba9876543210".into(),
            attachment: Attachment {
                content_type: "application/pdf".into(),
                url: Some("s3://reports/abc.pdf".into()),
                title: "cbc.pdf".into(),
                hash: "q6urq6urq6urq6urq6urq6urq6urq6urq6urq6urq6s=".into(),
            },
        }
    }

    #[test]
    fn statuses_use_fhir_codes() {
        let wire = domain_to_wire(&sample());
        let json = serde_json::to_value(&wire).expect("serialise");
        assert_eq!(json["status"], "current");
        assert_eq!(json["docStatus"], "final");
        assert_eq!(json["type"]["coding"][0]["code"], "11502-2");
        assert_eq!(json["subject"]["reference"], "Patient/pat-fedcba9876543210");
        assert_eq!(json["content"][0]["attachment"]["contentType"], "application/pdf");

        let entered = serde_json::to_string(&DocumentReferenceStatus::EnteredInError)
            .expect("serialise status");
        assert_eq!(entered, "\"entered-in-error\"");
    }

    #[test]
    fn wire_round_trip_preserves_domain() {
        let data = sample();
        let back = wire_to_domain(domain_to_wire(&data)).expect("translate back");
        assert_eq!(back, data);
    }

    #[test]
    fn rejects_missing_attachment() {
        let mut wire = domain_to_wire(&sample());
        wire.content.clear();
        let err = wire_to_domain(wire).expect_err("no content should fail");
        match err {
            FhirError::Translation(msg) => assert!(msg.contains("content attachment")),
            other => panic!("expected Translation error, got {other:?}"),
        }
    }
}
