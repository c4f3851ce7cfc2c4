// SPDX-License-Identifier: MIT OR Apache-2.0
//! Label inference: derive an [`InsightsDescriptor`] and a [`ResourceTarget`]
//! from an envelope's labels and annotations.
//!
//! Classification is a pure function of the envelope. Labels are walked in
//! lexicographic order so logs are stable, but the outcome never depends on
//! ordering.

use crate::{Envelope, ResourceTarget};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Label naming the Lagoon project.
pub const LABEL_PROJECT: &str = "lagoon.sh/project";
/// Label naming the environment.
pub const LABEL_ENVIRONMENT: &str = "lagoon.sh/environment";
/// Label naming the service.
pub const LABEL_SERVICE: &str = "lagoon.sh/service";
/// Label selecting the insights payload kind.
pub const LABEL_INSIGHTS_TYPE: &str = "lagoon.sh/insightsType";
/// Label requesting gzipped archiver output.
pub const LABEL_OUTPUT_COMPRESSED: &str = "lagoon.sh/insightsOutputCompressed";
/// Label overriding the archiver output media type.
pub const LABEL_OUTPUT_MIME: &str = "lagoon.sh/insightsOutputFileMIMEType";
/// Label overriding the archiver output file extension.
pub const LABEL_OUTPUT_EXT: &str = "lagoon.sh/insightsOutputFileExt";
/// Label carrying the build type (`pullrequest` suppresses branch override).
pub const LABEL_BUILD_TYPE: &str = "lagoon.sh/buildType";
/// Annotation carrying the branch name.
pub const ANNOTATION_BRANCH: &str = "lagoon.sh/branch";

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Payload kind derived from `lagoon.sh/insightsType`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InsightKind {
    /// Unrecognised or absent insights type; handled by the raw filters.
    #[default]
    Raw,
    /// A CycloneDX software bill of materials.
    Sbom,
    /// A container image inspection record.
    Image,
    /// Reserved for the typed direct envelopes (never produced by labels).
    Direct,
}

impl std::fmt::Display for InsightKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Raw => "raw",
            Self::Sbom => "sbom",
            Self::Image => "image",
            Self::Direct => "direct",
        };
        f.write_str(s)
    }
}

/// Which of the two envelope payload fields is populated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PayloadShape {
    /// `payload`: structured JSON items.
    Json,
    /// `binaryPayload`: base64 (possibly gzipped) strings.
    Binary,
}

/// The family of findings an envelope produces.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LagoonType {
    /// Plain facts (the default).
    #[default]
    Facts,
    /// Facts extracted from an image inspection.
    ImageFacts,
    /// Problems.
    Problems,
}

/// The classified view of an inferred envelope, driving pipeline routing and
/// archiver output naming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InsightsDescriptor {
    /// Payload kind.
    pub kind: InsightKind,
    /// Which payload field is populated.
    pub payload_shape: PayloadShape,
    /// Findings family.
    pub lagoon_type: LagoonType,
    /// Raw `lagoon.sh/insightsType` label value.
    pub input_type: String,
    /// Whether archived output should be re-gzipped.
    pub output_compressed: bool,
    /// Media type for archived output.
    pub output_mime: String,
    /// File extension for archived output.
    pub output_ext: String,
}

/// Result of classifying an envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    /// The descriptor driving pipeline routing.
    pub descriptor: InsightsDescriptor,
    /// Where the findings belong.
    pub target: ResourceTarget,
}

/// Errors produced by [`classify`]. All of them are permanent: the envelope
/// is rejected without requeue.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ClassifyError {
    /// A legacy, un-suffixed insights type was supplied.
    #[error(
        "legacy insights type `{0}` is not accepted; use `sbom-gz`, `image-gz`, \
         or a typed direct.* envelope"
    )]
    LegacyTag(String),

    /// Neither `payload` nor `binaryPayload` is populated.
    #[error("envelope carries neither payload nor binaryPayload")]
    MissingPayload,
}

// ---------------------------------------------------------------------------
// Classification
// ---------------------------------------------------------------------------

/// Derive the descriptor and resource target for an inferred envelope.
///
/// # Errors
///
/// [`ClassifyError::LegacyTag`] for the un-suffixed `sbom`/`image`/`direct`
/// tags, [`ClassifyError::MissingPayload`] when both payload fields are
/// empty.
pub fn classify(envelope: &Envelope) -> Result<Classification, ClassifyError> {
    let mut target = ResourceTarget::default();
    let mut input_type = String::new();
    let mut output_compressed = false;
    let mut output_mime = "application/json".to_string();
    let mut output_ext = "json".to_string();

    // BTreeMap iteration is lexicographic already; the walk exists for its
    // stable debug output, the outcome is order-independent.
    for (label, value) in &envelope.labels {
        debug!(label = %label, value = %value, "classifying label");
        match label.as_str() {
            LABEL_PROJECT => target.project = value.clone(),
            LABEL_ENVIRONMENT => target.environment = value.clone(),
            LABEL_SERVICE => target.service = value.clone(),
            LABEL_INSIGHTS_TYPE => input_type = value.clone(),
            LABEL_OUTPUT_COMPRESSED => {
                output_compressed = value.parse::<bool>().unwrap_or(false);
            }
            LABEL_OUTPUT_MIME => output_mime = value.clone(),
            LABEL_OUTPUT_EXT => output_ext = value.clone(),
            _ => {}
        }
    }

    let (kind, lagoon_type) = match input_type.as_str() {
        "sbom-gz" => (InsightKind::Sbom, LagoonType::Facts),
        "image-gz" => (InsightKind::Image, LagoonType::ImageFacts),
        "problems" => (InsightKind::Raw, LagoonType::Problems),
        "sbom" | "image" | "direct" => {
            return Err(ClassifyError::LegacyTag(input_type));
        }
        _ => (InsightKind::Raw, LagoonType::Facts),
    };

    // Non-PR builds take their environment name from the branch annotation.
    if envelope.label(LABEL_BUILD_TYPE) != Some("pullrequest")
        && let Some(branch) = envelope.annotations.get(ANNOTATION_BRANCH)
    {
        target.environment = branch.clone();
    }

    let has_payload = envelope.payload.as_ref().is_some_and(|p| !p.is_empty());
    let has_binary = envelope
        .binary_payload
        .as_ref()
        .is_some_and(|p| !p.is_empty());

    let payload_shape = match (has_payload, has_binary) {
        (_, true) => PayloadShape::Binary,
        (true, false) => PayloadShape::Json,
        (false, false) => return Err(ClassifyError::MissingPayload),
    };

    Ok(Classification {
        descriptor: InsightsDescriptor {
            kind,
            payload_shape,
            lagoon_type,
            input_type,
            output_compressed,
            output_mime,
            output_ext,
        },
        target,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn envelope_with(labels: &[(&str, &str)]) -> Envelope {
        Envelope {
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            binary_payload: Some(BTreeMap::from([("item".into(), "aGk=".into())])),
            ..Default::default()
        }
    }

    // -- 1. SBOM labels produce an Sbom/Facts descriptor ----------------------

    #[test]
    fn sbom_gz_classifies_as_sbom_facts() {
        let env = envelope_with(&[
            (LABEL_PROJECT, "p"),
            (LABEL_ENVIRONMENT, "main"),
            (LABEL_SERVICE, "cli"),
            (LABEL_INSIGHTS_TYPE, "sbom-gz"),
        ]);
        let c = classify(&env).unwrap();
        assert_eq!(c.descriptor.kind, InsightKind::Sbom);
        assert_eq!(c.descriptor.lagoon_type, LagoonType::Facts);
        assert_eq!(c.descriptor.payload_shape, PayloadShape::Binary);
        assert_eq!(
            c.target,
            ResourceTarget {
                project: "p".into(),
                environment: "main".into(),
                service: "cli".into(),
            }
        );
    }

    // -- 2. image-gz selects ImageFacts ---------------------------------------

    #[test]
    fn image_gz_classifies_as_image_facts() {
        let env = envelope_with(&[(LABEL_INSIGHTS_TYPE, "image-gz")]);
        let c = classify(&env).unwrap();
        assert_eq!(c.descriptor.kind, InsightKind::Image);
        assert_eq!(c.descriptor.lagoon_type, LagoonType::ImageFacts);
    }

    // -- 3. Legacy tags are rejected ------------------------------------------

    #[test]
    fn legacy_tags_are_rejected() {
        for tag in ["sbom", "image", "direct"] {
            let env = envelope_with(&[(LABEL_INSIGHTS_TYPE, tag)]);
            assert_eq!(
                classify(&env),
                Err(ClassifyError::LegacyTag(tag.to_string())),
                "tag {tag} should be rejected"
            );
        }
    }

    // -- 4. Unknown insights types fall through to Raw ------------------------

    #[test]
    fn unknown_insights_type_falls_through_to_raw() {
        let env = envelope_with(&[(LABEL_INSIGHTS_TYPE, "something-new")]);
        let c = classify(&env).unwrap();
        assert_eq!(c.descriptor.kind, InsightKind::Raw);
        assert_eq!(c.descriptor.lagoon_type, LagoonType::Facts);
    }

    // -- 5. `problems` routes to the raw problems filter ----------------------

    #[test]
    fn problems_type_selects_problems_lagoon_type() {
        let env = envelope_with(&[(LABEL_INSIGHTS_TYPE, "problems")]);
        let c = classify(&env).unwrap();
        assert_eq!(c.descriptor.kind, InsightKind::Raw);
        assert_eq!(c.descriptor.lagoon_type, LagoonType::Problems);
    }

    // -- 6. Branch annotation overrides environment for non-PR builds ---------

    #[test]
    fn branch_annotation_overrides_environment() {
        let mut env = envelope_with(&[
            (LABEL_ENVIRONMENT, "pr-42"),
            (LABEL_BUILD_TYPE, "branch"),
        ]);
        env.annotations
            .insert(ANNOTATION_BRANCH.into(), "main".into());
        let c = classify(&env).unwrap();
        assert_eq!(c.target.environment, "main");
    }

    // -- 7. Pull-request builds keep the labelled environment -----------------

    #[test]
    fn pullrequest_builds_ignore_branch_annotation() {
        let mut env = envelope_with(&[
            (LABEL_ENVIRONMENT, "pr-42"),
            (LABEL_BUILD_TYPE, "pullrequest"),
        ]);
        env.annotations
            .insert(ANNOTATION_BRANCH.into(), "main".into());
        let c = classify(&env).unwrap();
        assert_eq!(c.target.environment, "pr-42");
    }

    // -- 8. Missing payloads are rejected --------------------------------------

    #[test]
    fn missing_payload_is_rejected() {
        let mut env = envelope_with(&[(LABEL_INSIGHTS_TYPE, "sbom-gz")]);
        env.binary_payload = None;
        assert_eq!(classify(&env), Err(ClassifyError::MissingPayload));

        env.payload = Some(vec![]);
        assert_eq!(classify(&env), Err(ClassifyError::MissingPayload));
    }

    // -- 9. JSON payload shape -------------------------------------------------

    #[test]
    fn populated_payload_selects_json_shape() {
        let mut env = envelope_with(&[]);
        env.binary_payload = None;
        env.payload = Some(vec![serde_json::json!({"facts": []})]);
        let c = classify(&env).unwrap();
        assert_eq!(c.descriptor.payload_shape, PayloadShape::Json);
    }

    // -- 10. Output naming labels ----------------------------------------------

    #[test]
    fn output_labels_shape_the_descriptor() {
        let env = envelope_with(&[
            (LABEL_OUTPUT_COMPRESSED, "true"),
            (LABEL_OUTPUT_EXT, "cdx.json"),
            (LABEL_OUTPUT_MIME, "application/vnd.cyclonedx+json"),
        ]);
        let c = classify(&env).unwrap();
        assert!(c.descriptor.output_compressed);
        assert_eq!(c.descriptor.output_ext, "cdx.json");
        assert_eq!(c.descriptor.output_mime, "application/vnd.cyclonedx+json");
    }

    // -- 11. Classification is label-order independent (P5) --------------------

    #[test]
    fn classification_depends_only_on_label_content() {
        // Same labels inserted in two different orders; BTreeMap normalises
        // storage, so both envelopes must classify identically.
        let a = envelope_with(&[
            (LABEL_PROJECT, "p"),
            (LABEL_SERVICE, "cli"),
            (LABEL_INSIGHTS_TYPE, "sbom-gz"),
            (LABEL_ENVIRONMENT, "main"),
        ]);
        let b = envelope_with(&[
            (LABEL_INSIGHTS_TYPE, "sbom-gz"),
            (LABEL_ENVIRONMENT, "main"),
            (LABEL_SERVICE, "cli"),
            (LABEL_PROJECT, "p"),
        ]);
        assert_eq!(classify(&a).unwrap(), classify(&b).unwrap());
    }

    // -- 12. Default output naming ---------------------------------------------

    #[test]
    fn default_output_naming_is_json() {
        let c = classify(&envelope_with(&[])).unwrap();
        assert!(!c.descriptor.output_compressed);
        assert_eq!(c.descriptor.output_ext, "json");
        assert_eq!(c.descriptor.output_mime, "application/json");
    }
}
