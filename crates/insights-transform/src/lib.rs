// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-transform
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The declarative rule engine that rewrites derived facts.
//!
//! Rules are loaded once at startup from a JSON or YAML file and are
//! read-only for the life of the process. Each rule matches the *source
//! record* that produced a fact (by record kind and field predicates) and
//! mutates the *derived fact* (assignments plus the key-fact flag). Field
//! access is table-driven over a closed union of record kinds — there is no
//! reflection, and no way to register new kinds at runtime.

use insights_core::Fact;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Input records
// ---------------------------------------------------------------------------

/// The source record a fact was derived from.
///
/// `matchType` aliases name the first three kinds; `RawFact` is reachable
/// only through field predicates on untyped rules (raw facts payloads feed
/// the parsed fact itself back through the engine).
#[derive(Debug, Clone, PartialEq)]
pub enum InputRecord {
    /// A `KEY=VALUE` environment variable from an image inspection.
    EnvironmentVariable {
        /// Variable name.
        key: String,
        /// Variable value.
        value: String,
    },
    /// A software package from an SBOM component.
    Package {
        /// Package name.
        name: String,
        /// Package version.
        version: String,
        /// Package URL.
        purl: String,
    },
    /// A label from an image inspection.
    InspectLabel {
        /// Label key.
        key: String,
        /// Label value.
        value: String,
    },
    /// A fact taken verbatim from a raw facts payload.
    RawFact(Fact),
}

impl InputRecord {
    /// Whether a `matchType` alias selects this record kind.
    #[must_use]
    pub fn matches_alias(&self, alias: &str) -> bool {
        matches!(
            (alias, self),
            ("EnvironmentVariable", Self::EnvironmentVariable { .. })
                | ("Package", Self::Package { .. })
                | ("InspectLabel", Self::InspectLabel { .. })
        )
    }

    /// Table-driven field access using the symbolic names rule files use.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&str> {
        match self {
            Self::EnvironmentVariable { key, value } | Self::InspectLabel { key, value } => {
                match name {
                    "Key" => Some(key),
                    "Value" => Some(value),
                    _ => None,
                }
            }
            Self::Package {
                name: pkg,
                version,
                purl,
            } => match name {
                "Name" => Some(pkg),
                "Version" => Some(version),
                "PackageURL" => Some(purl),
                _ => None,
            },
            Self::RawFact(fact) => match name {
                "Name" => Some(&fact.name),
                "Value" => Some(&fact.value),
                "Source" => Some(&fact.source),
                "Description" => Some(&fact.description),
                "Category" => Some(&fact.category),
                _ => None,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// One field predicate of a [`TransformRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LookupPredicate {
    /// Symbolic field name on the input record.
    pub field: String,
    /// Literal value (`exactMatch`) or regular expression.
    pub value: String,
    /// Exact string comparison instead of regex matching.
    #[serde(rename = "exactMatch", default)]
    pub exact_match: bool,
}

/// One field assignment of a [`TransformRule`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    /// Symbolic field name on the derived fact.
    pub field: String,
    /// Value to assign.
    pub value: String,
}

/// A declarative match-and-assign rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformRule {
    /// Record-kind alias; the rule is skipped when it names a different kind.
    #[serde(rename = "matchType", default, skip_serializing_if = "Option::is_none")]
    pub match_type: Option<String>,
    /// All predicates must hold for the assignments to run.
    #[serde(rename = "lookupPredicates", default)]
    pub lookup_predicates: Vec<LookupPredicate>,
    /// Applied in order; later assignments overwrite earlier ones.
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    /// Mark the derived fact as a key fact.
    #[serde(rename = "setKeyFact", default)]
    pub set_key_fact: bool,
}

/// On-disk rule file wrapper.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RuleFile {
    #[serde(default)]
    transforms: Vec<TransformRule>,
}

/// Errors loading a rule file.
#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    /// The rule file could not be read.
    #[error("unable to read rules file: {0}")]
    Io(#[from] std::io::Error),

    /// The rule file was not valid JSON.
    #[error("unable to parse JSON rules: {0}")]
    Json(#[from] serde_json::Error),

    /// The rule file was not valid YAML.
    #[error("unable to parse YAML rules: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// The file extension names no supported format.
    #[error("unsupported rules file extension: {0}")]
    UnsupportedExtension(String),
}

// ---------------------------------------------------------------------------
// Transformer
// ---------------------------------------------------------------------------

/// The rule engine. Built once at startup, shared read-only across workers.
#[derive(Debug, Default)]
pub struct FactTransformer {
    rules: Vec<TransformRule>,
}

impl FactTransformer {
    /// A transformer with no rules (facts pass through untouched).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build a transformer from in-memory rules.
    #[must_use]
    pub fn new(rules: Vec<TransformRule>) -> Self {
        Self { rules }
    }

    /// Load rules from a file; JSON and YAML are selected by extension.
    ///
    /// # Errors
    ///
    /// [`TransformError`] on read, parse, or extension problems.
    pub fn load(path: &Path) -> Result<Self, TransformError> {
        let content = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        let file: RuleFile = match ext {
            "json" => serde_json::from_str(&content)?,
            "yaml" | "yml" => serde_yaml::from_str(&content)?,
            other => return Err(TransformError::UnsupportedExtension(other.to_string())),
        };
        debug!(rules = file.transforms.len(), path = %path.display(), "loaded transform rules");
        Ok(Self::new(file.transforms))
    }

    /// Number of loaded rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }

    /// Whether no rules are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Run every rule, in load order, against one derived fact.
    ///
    /// A rule whose type check or predicates fail — or that hits an unknown
    /// field or an invalid regex — contributes nothing for this input; it
    /// never aborts the batch. Assignments commit atomically per rule, so a
    /// rule that errors half-way leaves the fact untouched.
    #[must_use]
    pub fn apply(&self, fact: &Fact, record: &InputRecord) -> Fact {
        let mut out = fact.clone();

        'rules: for rule in &self.rules {
            if let Some(alias) = &rule.match_type
                && !record.matches_alias(alias)
            {
                continue;
            }

            for predicate in &rule.lookup_predicates {
                let Some(actual) = record.field(&predicate.field) else {
                    warn!(field = %predicate.field, "predicate names an unknown record field; skipping rule");
                    continue 'rules;
                };

                let matched = if predicate.exact_match {
                    actual == predicate.value
                } else {
                    match Regex::new(&predicate.value) {
                        Ok(re) => re.is_match(actual),
                        Err(err) => {
                            warn!(pattern = %predicate.value, %err, "invalid predicate regex; skipping rule");
                            continue 'rules;
                        }
                    }
                };

                if !matched {
                    continue 'rules;
                }
            }

            let mut scratch = out.clone();
            for assignment in &rule.assignments {
                if !set_fact_field(&mut scratch, &assignment.field, &assignment.value) {
                    warn!(field = %assignment.field, "assignment names an unknown fact field; skipping rule");
                    continue 'rules;
                }
            }
            if rule.set_key_fact {
                scratch.key_fact = true;
            }
            out = scratch;
        }

        out
    }
}

/// Assign a fact field by its symbolic name. Returns `false` for unknown
/// names.
fn set_fact_field(fact: &mut Fact, field: &str, value: &str) -> bool {
    match field {
        "Name" => fact.name = value.to_string(),
        "Value" => fact.value = value.to_string(),
        "Source" => fact.source = value.to_string(),
        "Description" => fact.description = value.to_string(),
        "Category" => fact.category = value.to_string(),
        "Service" => fact.service = Some(value.to_string()),
        _ => return false,
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env_record(key: &str, value: &str) -> InputRecord {
        InputRecord::EnvironmentVariable {
            key: key.into(),
            value: value.into(),
        }
    }

    fn fact_named(name: &str) -> Fact {
        Fact {
            name: name.into(),
            value: "8.1".into(),
            ..Default::default()
        }
    }

    fn rule(json: serde_json::Value) -> TransformRule {
        serde_json::from_value(json).unwrap()
    }

    // -- 1. Regex predicate + assignment + key fact ---------------------------

    #[test]
    fn regex_rule_renames_and_marks_key_fact() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "matchType": "EnvironmentVariable",
            "lookupPredicates": [{"field": "Key", "value": "^PHP_", "exactMatch": false}],
            "assignments": [{"field": "Name", "value": "PHP version"}],
            "setKeyFact": true
        }))]);

        let out = transformer.apply(
            &fact_named("PHP_VERSION"),
            &env_record("PHP_VERSION", "8.1"),
        );
        assert_eq!(out.name, "PHP version");
        assert!(out.key_fact);
    }

    // -- 2. Failed predicates leave the fact untouched -------------------------

    #[test]
    fn failed_predicate_has_no_side_effects() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "lookupPredicates": [{"field": "Key", "value": "NODE_VERSION", "exactMatch": true}],
            "assignments": [{"field": "Name", "value": "should not appear"}],
            "setKeyFact": true
        }))]);

        let out = transformer.apply(
            &fact_named("PHP_VERSION"),
            &env_record("PHP_VERSION", "8.1"),
        );
        assert_eq!(out.name, "PHP_VERSION");
        assert!(!out.key_fact);
    }

    // -- 3. Type mismatch skips the rule -----------------------------------------

    #[test]
    fn mismatched_type_skips_rule() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "matchType": "Package",
            "assignments": [{"field": "Name", "value": "nope"}]
        }))]);

        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.name, "X");
    }

    // -- 4. Unknown matchType alias never matches ---------------------------------

    #[test]
    fn unknown_alias_never_matches() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "matchType": "SomethingElse",
            "assignments": [{"field": "Name", "value": "nope"}]
        }))]);

        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.name, "X");
    }

    // -- 5. Exact match is not a substring match -----------------------------------

    #[test]
    fn exact_match_is_strict() {
        let mk = |exact| {
            FactTransformer::new(vec![rule(serde_json::json!({
                "lookupPredicates": [{"field": "Key", "value": "PHP", "exactMatch": exact}],
                "assignments": [{"field": "Name", "value": "renamed"}]
            }))])
        };

        // regex "PHP" matches inside PHP_VERSION
        let out = mk(false).apply(&fact_named("PHP_VERSION"), &env_record("PHP_VERSION", "8"));
        assert_eq!(out.name, "renamed");

        // exact "PHP" does not equal "PHP_VERSION"
        let out = mk(true).apply(&fact_named("PHP_VERSION"), &env_record("PHP_VERSION", "8"));
        assert_eq!(out.name, "PHP_VERSION");
    }

    // -- 6. Invalid regex removes the rule for this input ---------------------------

    #[test]
    fn invalid_regex_skips_rule_without_aborting() {
        let transformer = FactTransformer::new(vec![
            rule(serde_json::json!({
                "lookupPredicates": [{"field": "Key", "value": "([unclosed", "exactMatch": false}],
                "assignments": [{"field": "Name", "value": "broken"}]
            })),
            rule(serde_json::json!({
                "lookupPredicates": [{"field": "Key", "value": "^PHP_", "exactMatch": false}],
                "assignments": [{"field": "Name", "value": "working"}]
            })),
        ]);

        let out = transformer.apply(&fact_named("PHP_VERSION"), &env_record("PHP_VERSION", "8"));
        assert_eq!(out.name, "working");
    }

    // -- 7. Unknown predicate field removes the rule ---------------------------------

    #[test]
    fn unknown_predicate_field_skips_rule() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "lookupPredicates": [{"field": "Nonexistent", "value": ".*", "exactMatch": false}],
            "assignments": [{"field": "Name", "value": "nope"}]
        }))]);

        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.name, "X");
    }

    // -- 8. Unknown assignment field discards the whole rule ---------------------------

    #[test]
    fn unknown_assignment_field_discards_rule_atomically() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "assignments": [
                {"field": "Name", "value": "partially applied"},
                {"field": "Bogus", "value": "boom"}
            ],
            "setKeyFact": true
        }))]);

        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.name, "X", "half-applied assignments must not commit");
        assert!(!out.key_fact);
    }

    // -- 9. Later rules overwrite earlier assignments -----------------------------------

    #[test]
    fn rules_apply_in_load_order() {
        let transformer = FactTransformer::new(vec![
            rule(serde_json::json!({"assignments": [{"field": "Name", "value": "first"}]})),
            rule(serde_json::json!({"assignments": [{"field": "Name", "value": "second"}]})),
        ]);

        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.name, "second");
    }

    // -- 10. Package records expose SBOM fields -------------------------------------------

    #[test]
    fn package_record_fields() {
        let record = InputRecord::Package {
            name: "npm-foo".into(),
            version: "1.0".into(),
            purl: "pkg:npm/npm-foo@1.0".into(),
        };
        assert_eq!(record.field("Name"), Some("npm-foo"));
        assert_eq!(record.field("Version"), Some("1.0"));
        assert_eq!(record.field("PackageURL"), Some("pkg:npm/npm-foo@1.0"));
        assert_eq!(record.field("Key"), None);
    }

    // -- 11. Raw fact records expose fact fields -------------------------------------------

    #[test]
    fn raw_fact_record_fields() {
        let record = InputRecord::RawFact(Fact {
            name: "php".into(),
            value: "8.1".into(),
            source: "drush-pml".into(),
            category: "runtime".into(),
            ..Default::default()
        });
        assert_eq!(record.field("Name"), Some("php"));
        assert_eq!(record.field("Source"), Some("drush-pml"));
        assert_eq!(record.field("Category"), Some("runtime"));
    }

    // -- 12. JSON and YAML rule files load identically ---------------------------------------

    #[test]
    fn json_and_yaml_rule_files_load_identically() {
        let dir = tempfile::tempdir().unwrap();

        let json_path = dir.path().join("rules.json");
        std::fs::File::create(&json_path)
            .unwrap()
            .write_all(
                br#"{"transforms": [{
                    "matchType": "EnvironmentVariable",
                    "lookupPredicates": [{"field": "Key", "value": "^PHP_", "exactMatch": false}],
                    "assignments": [{"field": "Name", "value": "PHP version"}],
                    "setKeyFact": true
                }]}"#,
            )
            .unwrap();

        let yaml_path = dir.path().join("rules.yaml");
        std::fs::File::create(&yaml_path)
            .unwrap()
            .write_all(
                br#"transforms:
  - matchType: EnvironmentVariable
    lookupPredicates:
      - field: Key
        value: "^PHP_"
        exactMatch: false
    assignments:
      - field: Name
        value: PHP version
    setKeyFact: true
"#,
            )
            .unwrap();

        let from_json = FactTransformer::load(&json_path).unwrap();
        let from_yaml = FactTransformer::load(&yaml_path).unwrap();
        assert_eq!(from_json.rules, from_yaml.rules);
        assert_eq!(from_json.len(), 1);
    }

    // -- 13. Unsupported extensions error ------------------------------------------------------

    #[test]
    fn unsupported_extension_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.toml");
        std::fs::write(&path, "x = 1").unwrap();
        let err = FactTransformer::load(&path).unwrap_err();
        assert!(matches!(err, TransformError::UnsupportedExtension(_)));
    }

    // -- 14. Service assignment fills the optional field ----------------------------------------

    #[test]
    fn service_assignment_sets_option() {
        let transformer = FactTransformer::new(vec![rule(serde_json::json!({
            "assignments": [{"field": "Service", "value": "cli"}]
        }))]);
        let out = transformer.apply(&fact_named("X"), &env_record("X", "1"));
        assert_eq!(out.service.as_deref(), Some("cli"));
    }
}
