//! Constants used throughout the labflow core crate.
//!
//! Identifier systems, terminology URLs and fixed resource defaults live here so the
//! projected bundle never infers any of them from data.

/// Schema version of the intermediate representation understood by this build.
pub const DEFAULT_SCHEMA_VERSION: &str = "1.0";

/// Number of hex characters kept from a digest when forming a resource id.
pub const ID_HEX_LEN: usize = 16;

/// Type tag for measurement (Observation) resource ids.
pub const MEASUREMENT_TAG: &str = "obs";
/// Type tag for subject (Patient) resource ids.
pub const SUBJECT_TAG: &str = "pat";
/// Type tag for source-document (DocumentReference) resource ids.
pub const DOCUMENT_TAG: &str = "doc";
/// Type tag for report-summary (DiagnosticReport) resource ids.
pub const REPORT_TAG: &str = "diag";

/// Identifier system for the subject identifier supplied at upload.
pub const SUBJECT_ID_SYSTEM: &str = "urn:labflow:subject-id";
/// Identifier system for the SHA-256 of the uploaded file.
pub const FILE_HASH_SYSTEM: &str = "urn:labflow:file-sha256";
/// Fallback coding system for analytes with no external code.
pub const ANALYTE_FALLBACK_SYSTEM: &str = "urn:labflow:analyte";

pub const LOINC_SYSTEM: &str = "http://loinc.org";
pub const UCUM_SYSTEM: &str = "http://unitsofmeasure.org";
pub const OBSERVATION_CATEGORY_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/observation-category";
pub const DIAGNOSTIC_SERVICE_SECTION_SYSTEM: &str =
    "http://terminology.hl7.org/CodeSystem/v2-0074";

/// LOINC code used for both the document type and the report-summary code.
pub const LAB_REPORT_LOINC_CODE: &str = "11502-2";
pub const LAB_REPORT_LOINC_DISPLAY: &str = "Laboratory report";

pub const OBSERVATION_CATEGORY_CODE: &str = "laboratory";
pub const OBSERVATION_CATEGORY_DISPLAY: &str = "Laboratory";
pub const REPORT_CATEGORY_CODE: &str = "LAB";
pub const REPORT_CATEGORY_DISPLAY: &str = "Laboratory";

/// Content type stamped on the document attachment when the upload did not declare one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/pdf";

/// Maximum length (characters) of an analyte name.
pub const MAX_NAME_LEN: usize = 500;
/// Maximum length (characters) of an analyte code.
pub const MAX_CODE_LEN: usize = 200;
/// Maximum length (characters) of a unit string.
pub const MAX_UNIT_LEN: usize = 100;
/// Maximum length (characters) of reference-range text.
pub const MAX_REFERENCE_RANGE_LEN: usize = 500;
/// Maximum length (characters) of a qualitative result.
pub const MAX_QUALITATIVE_LEN: usize = 500;
/// Maximum length (characters) of free-text report metadata and subject identifiers.
pub const MAX_METADATA_LEN: usize = 500;

/// Aliases shorter than this only ever match a whole analyte name.
pub const MIN_PARTIAL_ALIAS_LEN: usize = 3;

/// Default minimum character count for a PDF text layer to be trusted.
pub const DEFAULT_MIN_TEXT_CHARS: usize = 50;
/// Default minimum word count for a PDF text layer to be trusted.
pub const DEFAULT_MIN_TEXT_WORDS: usize = 20;
