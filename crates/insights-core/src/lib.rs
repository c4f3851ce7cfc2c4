// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-core
#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! The wire contract for the insights handler: the broker envelope, the
//! findings it produces (facts and problems), the classified view of an
//! envelope, and the sink traits the rest of the workspace writes through.
//!
//! If you only take one dependency, take this one.

/// Label-driven envelope classification.
pub mod classify;
/// Sink traits and the transient/permanent error taxonomy.
pub mod sink;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Source string stamped on every problem produced by the trivy enricher.
pub const TRIVY_PROBLEM_SOURCE: &str = "insights-handler-trivy";

/// Maximum number of times a failing envelope is republished before it is
/// dropped as a terminal failure.
pub const MAX_REQUEUE_ATTEMPTS: u32 = 3;

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// One broker message.
///
/// Direct envelopes carry a `type` tag (`direct.facts`, `direct.problems`,
/// `direct.delete.facts`, `direct.delete.problems`) and a typed body that is
/// parsed separately. Inferred envelopes carry no tag; their routing is
/// derived from `labels` and `annotations`, and exactly one of `payload` or
/// `binary_payload` is populated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Envelope {
    /// Direct-path tag; absent on inferred envelopes.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    /// Classifying labels. A `BTreeMap` so iteration order is lexicographic.
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Auxiliary annotations (only `lagoon.sh/branch` is read today).
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    /// Structured payload items (JSON objects).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<serde_json::Value>>,

    /// Opaque payload entries: base64-encoded, possibly gzipped, keyed by an
    /// arbitrary producer-chosen name.
    #[serde(
        rename = "binaryPayload",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub binary_payload: Option<BTreeMap<String, String>>,

    /// Number of times this envelope has already been republished after a
    /// transient sink failure. Mutated only by the retry controller.
    #[serde(rename = "requeueAttempts", default)]
    pub requeue_attempts: u32,
}

impl Envelope {
    /// Look up a label value.
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Copy of this envelope with the requeue counter bumped by one.
    #[must_use]
    pub fn requeued(&self) -> Self {
        let mut next = self.clone();
        next.requeue_attempts += 1;
        next
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// Value type of a [`Fact`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum FactType {
    /// Free-form text (the default).
    #[default]
    Text,
    /// A URL.
    Url,
    /// A semantic version.
    Semver,
}

impl FactType {
    /// Map an arbitrary incoming string onto a known fact type.
    ///
    /// Anything other than `TEXT`, `URL`, or `SEMVER` collapses to `TEXT`.
    #[must_use]
    pub fn normalize(raw: &str) -> Self {
        match raw {
            "URL" => Self::Url,
            "SEMVER" => Self::Semver,
            _ => Self::Text,
        }
    }
}

/// One structured finding about an environment.
///
/// Identified by `(environment, source, name)`; `(environment, source)` is
/// the unit of deletion before insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Fact {
    /// Numeric environment id in the upstream API.
    pub environment: i64,
    /// Fact name, unique per source within a batch after deduplication.
    pub name: String,
    /// Fact value.
    pub value: String,
    /// Namespacing string identifying the producer.
    pub source: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Grouping category.
    #[serde(default)]
    pub category: String,
    /// Whether this fact is flagged as salient.
    #[serde(rename = "keyFact", default)]
    pub key_fact: bool,
    /// Value type.
    #[serde(rename = "type", default)]
    pub fact_type: FactType,
    /// Originating service, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
}

// ---------------------------------------------------------------------------
// Problems
// ---------------------------------------------------------------------------

/// Severity rating of a [`Problem`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "UPPERCASE")]
#[allow(missing_docs)]
pub enum ProblemSeverity {
    None,
    #[default]
    Unknown,
    Negligible,
    Low,
    Medium,
    High,
    Critical,
}

impl ProblemSeverity {
    /// Parse a scanner-reported severity label, case-insensitively.
    /// Unrecognised labels collapse to `UNKNOWN`.
    #[must_use]
    pub fn from_label(raw: &str) -> Self {
        match raw.to_ascii_uppercase().as_str() {
            "NONE" => Self::None,
            "NEGLIGIBLE" => Self::Negligible,
            "LOW" => Self::Low,
            "MEDIUM" => Self::Medium,
            "HIGH" => Self::High,
            "CRITICAL" => Self::Critical,
            _ => Self::Unknown,
        }
    }
}

/// One vulnerability finding.
///
/// Identified by `(environment, service, source, identifier)`;
/// `(environment, service, source)` is the unit of deletion before insertion.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Problem {
    /// Numeric environment id in the upstream API.
    pub environment: i64,
    /// Vulnerability identifier (CVE id, advisory id, …).
    pub identifier: String,
    /// Installed version of the affected package.
    #[serde(default)]
    pub version: String,
    /// First fixed version, when known.
    #[serde(rename = "fixedVersion", default)]
    pub fixed_version: String,
    /// Namespacing string identifying the producer.
    #[serde(default)]
    pub source: String,
    /// Affected service.
    #[serde(default)]
    pub service: String,
    /// Free-form JSON side data.
    #[serde(default = "Problem::empty_data")]
    pub data: String,
    /// Severity rating.
    #[serde(default)]
    pub severity: ProblemSeverity,
    /// Normalised severity score in `[0, 1]`.
    #[serde(rename = "severityScore", default)]
    pub severity_score: f64,
    /// Affected package name.
    #[serde(rename = "associatedPackage", default)]
    pub associated_package: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Reference link.
    #[serde(default)]
    pub links: String,
}

impl Problem {
    fn empty_data() -> String {
        "{}".to_string()
    }
}

// ---------------------------------------------------------------------------
// Resource targets
// ---------------------------------------------------------------------------

/// Where an inferred envelope's findings belong, as named by its labels.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResourceTarget {
    /// Lagoon project name.
    pub project: String,
    /// Environment name (possibly overridden by the branch annotation).
    pub environment: String,
    /// Service name.
    pub service: String,
}

/// A [`ResourceTarget`] resolved against the upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ResolvedTarget {
    /// Numeric project id.
    pub project_id: i64,
    /// Project name as the API reports it.
    pub project: String,
    /// Numeric environment id (always non-zero once resolved).
    pub environment_id: i64,
    /// Environment name as the API reports it.
    pub environment: String,
    /// Service name carried over from the target.
    pub service: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- 1. Envelope serde defaults -------------------------------------------

    #[test]
    fn envelope_defaults_from_minimal_json() {
        let env: Envelope = serde_json::from_str("{}").unwrap();
        assert!(env.message_type.is_none());
        assert!(env.labels.is_empty());
        assert!(env.payload.is_none());
        assert!(env.binary_payload.is_none());
        assert_eq!(env.requeue_attempts, 0);
    }

    // -- 2. Requeue counter round-trips through serde -------------------------

    #[test]
    fn requeue_attempts_roundtrip() {
        let env: Envelope = serde_json::from_str(r#"{"requeueAttempts": 2}"#).unwrap();
        assert_eq!(env.requeue_attempts, 2);

        let bumped = env.requeued();
        let json = serde_json::to_value(&bumped).unwrap();
        assert_eq!(json["requeueAttempts"], 3);
    }

    // -- 3. Fact type normalisation -------------------------------------------

    #[test]
    fn fact_type_normalize_collapses_unknown_to_text() {
        assert_eq!(FactType::normalize("URL"), FactType::Url);
        assert_eq!(FactType::normalize("SEMVER"), FactType::Semver);
        assert_eq!(FactType::normalize("TEXT"), FactType::Text);
        assert_eq!(FactType::normalize("banana"), FactType::Text);
        assert_eq!(FactType::normalize(""), FactType::Text);
    }

    // -- 4. Severity label parsing --------------------------------------------

    #[test]
    fn severity_from_label_is_case_insensitive() {
        assert_eq!(ProblemSeverity::from_label("critical"), ProblemSeverity::Critical);
        assert_eq!(ProblemSeverity::from_label("HIGH"), ProblemSeverity::High);
        assert_eq!(ProblemSeverity::from_label("Medium"), ProblemSeverity::Medium);
        assert_eq!(ProblemSeverity::from_label("???"), ProblemSeverity::Unknown);
    }

    // -- 5. Severity serialises screaming-case --------------------------------

    #[test]
    fn severity_serialises_uppercase() {
        let json = serde_json::to_string(&ProblemSeverity::Negligible).unwrap();
        assert_eq!(json, r#""NEGLIGIBLE""#);
    }

    // -- 6. Fact wire names ----------------------------------------------------

    #[test]
    fn fact_uses_api_field_names() {
        let fact = Fact {
            environment: 3,
            name: "php".into(),
            value: "8.1".into(),
            source: "drush-pml".into(),
            key_fact: true,
            fact_type: FactType::Semver,
            ..Default::default()
        };
        let json = serde_json::to_value(&fact).unwrap();
        assert_eq!(json["keyFact"], true);
        assert_eq!(json["type"], "SEMVER");
        assert!(json.get("service").is_none());
    }

    // -- 7. Problem data defaults to an empty JSON object ----------------------

    #[test]
    fn problem_data_defaults_to_empty_object() {
        let p: Problem = serde_json::from_str(r#"{"environment": 1, "identifier": "CVE-1"}"#).unwrap();
        assert_eq!(p.data, "{}");
        assert_eq!(p.severity, ProblemSeverity::Unknown);
    }
}
