//! Analyte and unit normalization.
//!
//! Two independent, total mappings:
//! - analyte name -> canonical code (plus an external LOINC coding where one is known)
//! - unit spelling -> canonical unit (plus its UCUM code)
//!
//! Unknown inputs are never an error: they pass through unchanged and are flagged
//! [`Confidence::Unmapped`]. Normalizing a payload works on a copy; the stored version is never
//! touched.
//!
//! The built-in tables can be extended at startup from a YAML file (see
//! [`NormalizationTables::extend_from_yaml`]).

use crate::constants::MIN_PARTIAL_ALIAS_LEN;
use crate::schema::{LabPayload, Measurement};
use crate::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// Public domain-level types
// ============================================================================

/// How an input was matched against a table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    /// The folded input equals an alias.
    Exact,
    /// An alias occurs as a run of whole words inside the folded input. Carries no
    /// external code.
    Partial,
    /// No mapping; the original value is passed through.
    Unmapped,
}

/// An external (LOINC) coding for a canonical analyte.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExternalCode {
    pub code: String,
    pub display: String,
}

/// One entry in the analyte table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyteDefinition {
    pub code: String,
    pub loinc: Option<ExternalCode>,
    /// Whether a negative result is impossible for this analyte.
    pub non_negative: bool,
}

/// One entry in the unit table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitDefinition {
    pub canonical: String,
    pub ucum: String,
}

/// Result of resolving an analyte name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AnalyteMatch {
    /// Canonical code, or the trimmed original name when unmapped.
    pub code: String,
    pub confidence: Confidence,
    pub loinc: Option<ExternalCode>,
}

/// Result of resolving a unit. The original spelling is always retained.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnitMatch {
    pub original: Option<String>,
    /// Canonical unit, or the original spelling when unmapped.
    pub canonical: Option<String>,
    /// UCUM code, only for mapped units.
    pub ucum: Option<String>,
    pub confidence: Confidence,
}

/// Normalization annotations for one measurement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Annotation {
    pub analyte: AnalyteMatch,
    pub unit: UnitMatch,
}

/// A normalized working copy of a payload.
///
/// `payload.measurements[i].normalized_code`/`normalized_unit` carry the resolved values and
/// `annotations[i]` records how they were obtained.
#[derive(Clone, Debug, PartialEq)]
pub struct NormalizedPayload {
    pub payload: LabPayload,
    pub annotations: Vec<Annotation>,
}

impl NormalizedPayload {
    pub fn measurements(&self) -> impl Iterator<Item = (&Measurement, &Annotation)> {
        self.payload.measurements.iter().zip(self.annotations.iter())
    }
}

// ============================================================================
// Tables
// ============================================================================

/// Alias and unit lookup tables.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizationTables {
    analytes: BTreeMap<String, AnalyteDefinition>,
    /// Folded alias -> canonical code.
    aliases: BTreeMap<String, String>,
    /// Folded unit spelling -> definition.
    units: BTreeMap<String, UnitDefinition>,
}

impl Default for NormalizationTables {
    fn default() -> Self {
        Self::builtin()
    }
}

/// (code, aliases, LOINC code, LOINC display)
const BUILTIN_ANALYTES: &[(&str, &[&str], &str, &str)] = &[
    (
        "GLUCOSE",
        &["GLU", "GLUCOSE", "BLOOD GLUCOSE", "FASTING GLUCOSE"],
        "2339-0",
        "Glucose [Mass/volume] in Blood",
    ),
    (
        "HBA1C",
        &["HBA1C", "HB A1C", "HEMOGLOBIN A1C", "HAEMOGLOBIN A1C", "GLYCATED HEMOGLOBIN"],
        "4548-4",
        "Hemoglobin A1c/Hemoglobin.total in Blood",
    ),
    (
        "CREATININE",
        &["CREATININE", "CREAT"],
        "2160-0",
        "Creatinine [Mass/volume] in Serum or Plasma",
    ),
    (
        "BUN",
        &["BUN", "BLOOD UREA NITROGEN", "UREA NITROGEN"],
        "3094-0",
        "Urea nitrogen [Mass/volume] in Serum or Plasma",
    ),
    (
        "SODIUM",
        &["SODIUM", "NA"],
        "2951-2",
        "Sodium [Moles/volume] in Serum or Plasma",
    ),
    (
        "POTASSIUM",
        &["POTASSIUM", "K"],
        "2823-3",
        "Potassium [Moles/volume] in Serum or Plasma",
    ),
    (
        "CHLORIDE",
        &["CHLORIDE", "CL"],
        "2075-0",
        "Chloride [Moles/volume] in Serum or Plasma",
    ),
    (
        "CO2",
        &["CO2", "CARBON DIOXIDE", "BICARBONATE", "TOTAL CO2"],
        "2028-9",
        "Carbon dioxide, total [Moles/volume] in Serum or Plasma",
    ),
    (
        "CALCIUM",
        &["CALCIUM", "CA"],
        "17861-6",
        "Calcium [Mass/volume] in Serum or Plasma",
    ),
    (
        "ALT",
        &["ALT", "ALANINE AMINOTRANSFERASE", "SGPT"],
        "1742-6",
        "Alanine aminotransferase [Enzymatic activity/volume] in Serum or Plasma",
    ),
    (
        "AST",
        &["AST", "ASPARTATE AMINOTRANSFERASE", "SGOT"],
        "1920-8",
        "Aspartate aminotransferase [Enzymatic activity/volume] in Serum or Plasma",
    ),
    (
        "WBC",
        &["WBC", "WHITE BLOOD CELLS", "WHITE BLOOD CELL COUNT", "LEUKOCYTES"],
        "6690-2",
        "Leukocytes [#/volume] in Blood by Automated count",
    ),
    (
        "RBC",
        &["RBC", "RED BLOOD CELLS", "RED BLOOD CELL COUNT", "ERYTHROCYTES"],
        "789-8",
        "Erythrocytes [#/volume] in Blood by Automated count",
    ),
    (
        "HEMOGLOBIN",
        &["HEMOGLOBIN", "HAEMOGLOBIN", "HGB", "HB"],
        "718-7",
        "Hemoglobin [Mass/volume] in Blood",
    ),
    (
        "HEMATOCRIT",
        &["HEMATOCRIT", "HAEMATOCRIT", "HCT"],
        "4544-3",
        "Hematocrit [Volume Fraction] of Blood by Automated count",
    ),
    (
        "PLATELETS",
        &["PLATELETS", "PLT", "PLATELET COUNT"],
        "777-3",
        "Platelets [#/volume] in Blood by Automated count",
    ),
];

/// (canonical, UCUM code, spellings)
const BUILTIN_UNITS: &[(&str, &str, &[&str])] = &[
    ("mg/dL", "mg/dL", &["mg/dl"]),
    ("g/dL", "g/dL", &["g/dl"]),
    ("g/L", "g/L", &["g/l"]),
    ("mg/L", "mg/L", &["mg/l"]),
    ("mmol/L", "mmol/L", &["mmol/l"]),
    ("umol/L", "umol/L", &["umol/l", "micromol/l"]),
    ("ug/dL", "ug/dL", &["ug/dl", "mcg/dl"]),
    ("ng/mL", "ng/mL", &["ng/ml"]),
    ("pg/mL", "pg/mL", &["pg/ml"]),
    ("mEq/L", "meq/L", &["meq/l"]),
    ("IU/L", "[IU]/L", &["iu/l"]),
    ("U/L", "U/L", &["u/l"]),
    ("cells/uL", "{cells}/uL", &["cells/ul"]),
    ("10*3/uL", "10*3/uL", &["10*3/ul", "10^3/ul", "x10^3/ul", "k/ul", "thou/ul"]),
    ("10*6/uL", "10*6/uL", &["10*6/ul", "10^6/ul", "x10^6/ul", "m/ul", "mil/ul"]),
    ("fL", "fL", &["fl"]),
    ("%", "%", &["%", "percent"]),
];

impl NormalizationTables {
    /// Tables with no entries.
    pub fn empty() -> Self {
        Self {
            analytes: BTreeMap::new(),
            aliases: BTreeMap::new(),
            units: BTreeMap::new(),
        }
    }

    /// The built-in analyte and unit tables.
    pub fn builtin() -> Self {
        let mut tables = Self::empty();
        for (code, aliases, loinc, display) in BUILTIN_ANALYTES {
            tables.analytes.insert(
                (*code).to_string(),
                AnalyteDefinition {
                    code: (*code).to_string(),
                    loinc: Some(ExternalCode {
                        code: (*loinc).to_string(),
                        display: (*display).to_string(),
                    }),
                    non_negative: true,
                },
            );
            tables.aliases.insert(fold_analyte(code), (*code).to_string());
            for alias in aliases.iter() {
                tables.aliases.insert(fold_analyte(alias), (*code).to_string());
            }
        }
        for (canonical, ucum, spellings) in BUILTIN_UNITS {
            let definition = UnitDefinition {
                canonical: (*canonical).to_string(),
                ucum: (*ucum).to_string(),
            };
            tables.units.insert(fold_unit(canonical), definition.clone());
            for spelling in spellings.iter() {
                tables.units.insert(fold_unit(spelling), definition.clone());
            }
        }
        tables
    }

    pub fn analyte(&self, code: &str) -> Option<&AnalyteDefinition> {
        self.analytes.get(code)
    }

    pub fn analytes(&self) -> impl Iterator<Item = &AnalyteDefinition> {
        self.analytes.values()
    }

    /// Adds or extends an analyte. Aliases already bound to another code are rejected.
    pub fn add_analyte(
        &mut self,
        code: &str,
        aliases: &[String],
        loinc: Option<ExternalCode>,
        non_negative: bool,
    ) -> CoreResult<()> {
        let code = fold_analyte(code);
        if code.is_empty() {
            return Err(CoreError::InvalidInput("analyte code cannot be empty".into()));
        }

        let mut folded = vec![code.clone()];
        for alias in aliases {
            let alias = fold_analyte(alias);
            if alias.is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "analyte {code} has an empty alias"
                )));
            }
            folded.push(alias);
        }
        for alias in &folded {
            if let Some(existing) = self.aliases.get(alias) {
                if *existing != code {
                    return Err(CoreError::InvalidInput(format!(
                        "alias '{alias}' is already bound to analyte {existing}"
                    )));
                }
            }
        }

        let entry = self
            .analytes
            .entry(code.clone())
            .or_insert_with(|| AnalyteDefinition {
                code: code.clone(),
                loinc: None,
                non_negative,
            });
        if loinc.is_some() {
            entry.loinc = loinc;
        }
        entry.non_negative = non_negative;

        for alias in folded {
            self.aliases.insert(alias, code.clone());
        }
        Ok(())
    }

    /// Adds spellings for a canonical unit. Spellings already bound to another unit are rejected.
    pub fn add_unit(
        &mut self,
        canonical: &str,
        ucum: Option<&str>,
        spellings: &[String],
    ) -> CoreResult<()> {
        let canonical = canonical.trim();
        if canonical.is_empty() {
            return Err(CoreError::InvalidInput("canonical unit cannot be empty".into()));
        }
        let definition = UnitDefinition {
            canonical: canonical.to_string(),
            ucum: ucum.map_or_else(|| canonical.to_string(), |u| u.trim().to_string()),
        };

        let mut keys = vec![fold_unit(canonical)];
        keys.extend(spellings.iter().map(|s| fold_unit(s)));
        for key in &keys {
            if key.is_empty() {
                return Err(CoreError::InvalidInput(format!(
                    "unit {canonical} has an empty spelling"
                )));
            }
            if let Some(existing) = self.units.get(key) {
                if existing.canonical != definition.canonical {
                    return Err(CoreError::InvalidInput(format!(
                        "unit spelling '{key}' is already bound to {}",
                        existing.canonical
                    )));
                }
            }
        }
        for key in keys {
            self.units.insert(key, definition.clone());
        }
        Ok(())
    }

    /// Extends these tables from YAML text.
    ///
    /// ```yaml
    /// analytes:
    ///   - code: FERRITIN
    ///     aliases: [Ferritin, Serum Ferritin]
    ///     loinc: { code: "2276-4", display: "Ferritin [Mass/volume] in Serum or Plasma" }
    /// units:
    ///   - canonical: ng/mL
    ///     spellings: [nanogram/ml]
    /// ```
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the YAML does not match the schema (the message
    /// includes the failing path) or an alias/spelling conflicts with an existing entry.
    pub fn extend_from_yaml(&mut self, yaml_text: &str) -> CoreResult<()> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml_text);
        let wire = match serde_path_to_error::deserialize::<_, TablesWire>(deserializer) {
            Ok(parsed) => parsed,
            Err(err) => {
                let path = err.path().to_string();
                let source = err.into_inner();
                let path = if path.is_empty() || path == "." {
                    "<root>"
                } else {
                    path.as_str()
                };
                return Err(CoreError::InvalidInput(format!(
                    "normalization table schema mismatch at {path}: {source}"
                )));
            }
        };

        for analyte in wire.analytes {
            self.add_analyte(
                &analyte.code,
                &analyte.aliases,
                analyte.loinc,
                analyte.non_negative,
            )?;
        }
        for unit in wire.units {
            self.add_unit(&unit.canonical, unit.ucum.as_deref(), &unit.spellings)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------------

    /// Resolves an analyte name, falling back to the extractor's code hint.
    ///
    /// Order: exact alias match on the name, exact match on the hint, longest partial alias
    /// match on the name, then unmapped.
    pub fn resolve_analyte(&self, name: &str, hint: Option<&str>) -> AnalyteMatch {
        let folded = fold_analyte(name);

        if let Some(code) = self.aliases.get(&folded) {
            return self.matched(code, Confidence::Exact);
        }
        if let Some(code) = hint.map(fold_analyte).and_then(|h| self.aliases.get(&h)) {
            return self.matched(code, Confidence::Exact);
        }
        // A partial match can name a different specimen ("Urine Sodium"), so it keeps the
        // canonical code but never borrows the alias's LOINC code.
        if let Some(code) = self.longest_partial_alias(&folded) {
            return AnalyteMatch {
                code: code.clone(),
                confidence: Confidence::Partial,
                loinc: None,
            };
        }

        AnalyteMatch {
            code: name.trim().to_string(),
            confidence: Confidence::Unmapped,
            loinc: None,
        }
    }

    /// Resolves a unit, falling back to the extractor's unit hint.
    pub fn resolve_unit(&self, original: Option<&str>, hint: Option<&str>) -> UnitMatch {
        let original = original.map(str::trim).filter(|u| !u.is_empty());
        let hint = hint.map(str::trim).filter(|u| !u.is_empty());

        let mapped = original
            .and_then(|u| self.units.get(&fold_unit(u)))
            .or_else(|| hint.and_then(|u| self.units.get(&fold_unit(u))));

        match mapped {
            Some(definition) => UnitMatch {
                original: original.map(str::to_string),
                canonical: Some(definition.canonical.clone()),
                ucum: Some(definition.ucum.clone()),
                confidence: Confidence::Exact,
            },
            None => UnitMatch {
                original: original.map(str::to_string),
                canonical: original.or(hint).map(str::to_string),
                ucum: None,
                confidence: Confidence::Unmapped,
            },
        }
    }

    /// Normalizes a copy of `payload`.
    pub fn normalize(&self, payload: &LabPayload) -> NormalizedPayload {
        let mut copy = payload.clone();
        let mut annotations = Vec::with_capacity(copy.measurements.len());

        for measurement in &mut copy.measurements {
            let analyte = self.resolve_analyte(
                &measurement.original_name,
                measurement.normalized_code.as_deref(),
            );
            let unit = self.resolve_unit(
                measurement.original_unit.as_deref(),
                measurement.normalized_unit.as_deref(),
            );
            if analyte.confidence == Confidence::Unmapped {
                tracing::debug!(name = %measurement.original_name, "analyte not in alias table");
            }
            measurement.normalized_code = Some(analyte.code.clone());
            measurement.normalized_unit = unit.canonical.clone();
            annotations.push(Annotation { analyte, unit });
        }

        NormalizedPayload {
            payload: copy,
            annotations,
        }
    }

    fn matched(&self, code: &str, confidence: Confidence) -> AnalyteMatch {
        AnalyteMatch {
            code: code.to_string(),
            confidence,
            loinc: self.analytes.get(code).and_then(|a| a.loinc.clone()),
        }
    }

    /// Longest alias (in words, then characters) that occurs as a run of whole words in
    /// `folded`. Remaining ties go to the smallest code.
    fn longest_partial_alias(&self, folded: &str) -> Option<&String> {
        let words: Vec<&str> = folded.split(' ').filter(|w| !w.is_empty()).collect();
        if words.is_empty() {
            return None;
        }

        let mut best: Option<(usize, usize, &String)> = None;
        for (alias, code) in &self.aliases {
            if alias.len() < MIN_PARTIAL_ALIAS_LEN {
                continue;
            }
            let alias_words: Vec<&str> = alias.split(' ').collect();
            if alias_words.len() > words.len()
                || !words.windows(alias_words.len()).any(|w| w == alias_words.as_slice())
            {
                continue;
            }
            let candidate = (alias_words.len(), alias.len(), code);
            best = match best {
                None => Some(candidate),
                Some(current) => {
                    let better = (candidate.0, candidate.1) > (current.0, current.1)
                        || ((candidate.0, candidate.1) == (current.0, current.1)
                            && candidate.2 < current.2);
                    Some(if better { candidate } else { current })
                }
            };
        }
        best.map(|(_, _, code)| code)
    }
}

/// Uppercases, turns punctuation into spaces and collapses whitespace.
pub fn fold_analyte(input: &str) -> String {
    let spaced: String = input
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .to_uppercase();
    spaced.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Lowercases, maps micro signs to `u`, `mcl` to `ul` and drops whitespace.
pub fn fold_unit(input: &str) -> String {
    input
        .trim()
        .chars()
        .filter(|c| !c.is_whitespace())
        .map(|c| match c {
            'μ' | 'µ' => 'u',
            other => other,
        })
        .collect::<String>()
        .to_lowercase()
        .replace("mcl", "ul")
}

// ============================================================================
// Wire types (internal)
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TablesWire {
    #[serde(default)]
    analytes: Vec<AnalyteWire>,
    #[serde(default)]
    units: Vec<UnitWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AnalyteWire {
    code: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    loinc: Option<ExternalCode>,
    #[serde(default = "default_non_negative")]
    non_negative: bool,
}

fn default_non_negative() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UnitWire {
    canonical: String,
    #[serde(default)]
    ucum: Option<String>,
    #[serde(default)]
    spellings: Vec<String>,
}
