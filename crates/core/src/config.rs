//! Core runtime configuration.
//!
//! This module defines configuration that should be resolved once at process startup and then
//! passed into core services as an `Arc<CoreConfig>`. Core code never reads environment
//! variables; the binary reads them and hands the raw values to the `*_from_env_value(s)`
//! helpers below.

use crate::constants::{DEFAULT_MIN_TEXT_CHARS, DEFAULT_MIN_TEXT_WORDS, DEFAULT_SCHEMA_VERSION};
use crate::normalization::NormalizationTables;
use crate::{CoreError, CoreResult};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Core configuration resolved at startup.
#[derive(Clone, Debug)]
pub struct CoreConfig {
    schema_version: String,
    tables: NormalizationTables,
    numeric_policy: NumericPolicy,
    text_layer_policy: TextLayerPolicy,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let tables = NormalizationTables::builtin();
        Self {
            schema_version: DEFAULT_SCHEMA_VERSION.to_string(),
            numeric_policy: NumericPolicy::from_tables(&tables),
            tables,
            text_layer_policy: TextLayerPolicy::default(),
        }
    }
}

impl CoreConfig {
    /// Create a new `CoreConfig`.
    ///
    /// The numeric policy is derived from `tables`.
    pub fn new(
        schema_version: String,
        tables: NormalizationTables,
        text_layer_policy: TextLayerPolicy,
    ) -> CoreResult<Self> {
        let schema_version = schema_version.trim().to_string();
        if schema_version.is_empty() {
            return Err(CoreError::InvalidInput(
                "schema_version cannot be empty".into(),
            ));
        }

        Ok(Self {
            schema_version,
            numeric_policy: NumericPolicy::from_tables(&tables),
            tables,
            text_layer_policy,
        })
    }

    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    pub fn tables(&self) -> &NormalizationTables {
        &self.tables
    }

    pub fn numeric_policy(&self) -> &NumericPolicy {
        &self.numeric_policy
    }

    pub fn text_layer_policy(&self) -> TextLayerPolicy {
        self.text_layer_policy
    }
}

/// Analytes whose results can never be negative.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NumericPolicy {
    non_negative: BTreeSet<String>,
}

impl NumericPolicy {
    pub fn from_tables(tables: &NormalizationTables) -> Self {
        Self {
            non_negative: tables
                .analytes()
                .filter(|a| a.non_negative)
                .map(|a| a.code.clone())
                .collect(),
        }
    }

    pub fn requires_non_negative(&self, code: &str) -> bool {
        self.non_negative.contains(code)
    }
}

/// Threshold below which a PDF's text layer is treated as absent (a scanned document).
///
/// This is policy for the extraction collaborator; the core only carries it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TextLayerPolicy {
    pub min_chars: usize,
    pub min_words: usize,
}

impl Default for TextLayerPolicy {
    fn default() -> Self {
        Self {
            min_chars: DEFAULT_MIN_TEXT_CHARS,
            min_words: DEFAULT_MIN_TEXT_WORDS,
        }
    }
}

impl TextLayerPolicy {
    /// True when `text` is too sparse to be a real text layer.
    pub fn looks_scanned(&self, text: &str) -> bool {
        let trimmed = text.trim();
        trimmed.chars().count() < self.min_chars
            || trimmed.split_whitespace().count() < self.min_words
    }
}

/// Parse the supported schema version from an optional string value.
///
/// If `value` is `None` or empty/whitespace, returns the built-in default.
pub fn schema_version_from_env_value(value: Option<String>) -> String {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_SCHEMA_VERSION.to_string())
}

/// Parse the text-layer thresholds from optional string values.
///
/// Missing or blank values fall back to the defaults.
pub fn text_layer_policy_from_env_values(
    min_chars: Option<String>,
    min_words: Option<String>,
) -> CoreResult<TextLayerPolicy> {
    fn parse(name: &str, value: Option<String>, default: usize) -> CoreResult<usize> {
        let value = value
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        match value {
            None => Ok(default),
            Some(v) => v.parse::<usize>().map_err(|e| {
                CoreError::InvalidInput(format!("{name} must be a non-negative integer: {e}"))
            }),
        }
    }

    Ok(TextLayerPolicy {
        min_chars: parse("LABFLOW_MIN_TEXT_CHARS", min_chars, DEFAULT_MIN_TEXT_CHARS)?,
        min_words: parse("LABFLOW_MIN_TEXT_WORDS", min_words, DEFAULT_MIN_TEXT_WORDS)?,
    })
}

/// Load the normalization tables, extending the built-ins from `override_file` if provided.
pub fn load_normalization_tables(override_file: Option<PathBuf>) -> CoreResult<NormalizationTables> {
    let mut tables = NormalizationTables::builtin();
    if let Some(path) = override_file {
        let text = std::fs::read_to_string(&path).map_err(CoreError::FileRead)?;
        tables.extend_from_yaml(&text)?;
        tracing::info!(path = %path.display(), "loaded normalization table overrides");
    }
    Ok(tables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn schema_version_defaults_when_blank() {
        assert_eq!(schema_version_from_env_value(None), "1.0");
        assert_eq!(schema_version_from_env_value(Some("  ".into())), "1.0");
        assert_eq!(schema_version_from_env_value(Some(" 2.0 ".into())), "2.0");
    }

    #[test]
    fn new_rejects_empty_schema_version() {
        let err = CoreConfig::new(
            " ".into(),
            NormalizationTables::builtin(),
            TextLayerPolicy::default(),
        )
        .expect_err("empty schema version should fail");
        assert!(matches!(err, CoreError::InvalidInput(_)));
    }

    #[test]
    fn text_layer_policy_parses_overrides() {
        let policy = text_layer_policy_from_env_values(Some("10".into()), None)
            .expect("valid thresholds");
        assert_eq!(policy.min_chars, 10);
        assert_eq!(policy.min_words, 20);

        let err = text_layer_policy_from_env_values(None, Some("many".into()))
            .expect_err("non-numeric should fail");
        match err {
            CoreError::InvalidInput(msg) => assert!(msg.contains("LABFLOW_MIN_TEXT_WORDS")),
            other => panic!("expected InvalidInput error, got {other:?}"),
        }
    }

    #[test]
    fn looks_scanned_uses_both_thresholds() {
        let policy = TextLayerPolicy::default();
        assert!(policy.looks_scanned("   "));
        assert!(policy.looks_scanned(&"x".repeat(200)));
        let prose = "glucose ninety five milligrams per decilitre ".repeat(5);
        assert!(!policy.looks_scanned(&prose));
    }

    #[test]
    fn numeric_policy_covers_builtin_analytes() {
        let config = CoreConfig::default();
        assert!(config.numeric_policy().requires_non_negative("GLUCOSE"));
        assert!(!config.numeric_policy().requires_non_negative("Mystery"));
    }

    #[test]
    fn load_normalization_tables_reads_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "analytes:\n  - code: BASE_EXCESS\n    aliases: [Base Excess]\n    non_negative: false"
        )
        .expect("write yaml");

        let tables =
            load_normalization_tables(Some(file.path().to_path_buf())).expect("load tables");
        let base = tables.analyte("BASE EXCESS").expect("code is folded");
        assert!(!base.non_negative);
        assert!(!NumericPolicy::from_tables(&tables).requires_non_negative("BASE EXCESS"));
    }

    #[test]
    fn load_normalization_tables_reports_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let err = load_normalization_tables(Some(dir.path().join("missing.yaml")))
            .expect_err("missing file should fail");
        assert!(matches!(err, CoreError::FileRead(_)));
    }
}
