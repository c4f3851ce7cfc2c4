// SPDX-License-Identifier: MIT OR Apache-2.0
//! The four concrete parser-filters.

use crate::{
    Findings, FilterOutput, ParserFilter, PipelineError, dedupe_first_seen, key_facts_filter,
};
use insights_codec::cyclonedx::SbomDocument;
use insights_codec::decode_binary_json;
use insights_core::classify::{InsightKind, InsightsDescriptor, LagoonType};
use insights_core::{Fact, FactType, Problem, ResolvedTarget};
use insights_transform::{FactTransformer, InputRecord};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// SBOM
// ---------------------------------------------------------------------------

/// Projects CycloneDX components into facts and hands the BOM onward for
/// enrichment.
pub struct SbomFilter {
    transformer: Arc<FactTransformer>,
}

impl SbomFilter {
    /// Build the filter over the shared rule engine.
    pub fn new(transformer: Arc<FactTransformer>) -> Self {
        Self { transformer }
    }
}

impl ParserFilter for SbomFilter {
    fn name(&self) -> &'static str {
        "sbom"
    }

    fn apply(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Option<FilterOutput>, PipelineError> {
        if descriptor.kind != InsightKind::Sbom {
            return Ok(None);
        }

        let source = format!("insights:sbom:{}", target.service);
        let doc = SbomDocument::from_payload(payload)?;

        let components = dedupe_first_seen(doc.components(), |c| c.name.as_str());
        let mut facts = Vec::with_capacity(components.len());
        for component in components {
            let fact = Fact {
                environment: target.environment_id,
                name: component.name.clone(),
                value: component.version.clone(),
                source: source.clone(),
                description: component.purl.clone(),
                fact_type: FactType::Text,
                ..Default::default()
            };
            let record = InputRecord::Package {
                name: component.name,
                version: component.version,
                purl: component.purl,
            };
            facts.push(self.transformer.apply(&fact, &record));
        }
        let facts = key_facts_filter(facts, &self.transformer);

        debug!(
            source,
            image = doc.subject_name().unwrap_or("<unnamed>"),
            facts = facts.len(),
            "decoded sbom"
        );

        Ok(Some(FilterOutput {
            source,
            findings: Findings::Facts(facts),
            sbom: Some(doc),
        }))
    }
}

// ---------------------------------------------------------------------------
// Image inspect
// ---------------------------------------------------------------------------

/// The subset of an image inspection record the filter reads.
#[derive(Debug, Default, Deserialize)]
struct ImageData {
    #[serde(default)]
    env: Vec<String>,
}

/// Turns the `env` block of an image inspection into facts.
pub struct ImageInspectFilter {
    transformer: Arc<FactTransformer>,
}

impl ImageInspectFilter {
    /// Build the filter over the shared rule engine.
    pub fn new(transformer: Arc<FactTransformer>) -> Self {
        Self { transformer }
    }
}

impl ParserFilter for ImageInspectFilter {
    fn name(&self) -> &'static str {
        "image-inspect"
    }

    fn apply(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Option<FilterOutput>, PipelineError> {
        if descriptor.kind != InsightKind::Image {
            return Ok(None);
        }

        let source = format!("insights:image:{}", target.service);
        let value = decode_binary_json(payload)?;
        let image: ImageData =
            serde_json::from_value(value).map_err(|e| PipelineError::Malformed {
                what: "image inspect",
                source: e,
            })?;

        // KEY=VALUE entries; anything without a separator carries no fact.
        let variables: Vec<(String, String)> = image
            .env
            .iter()
            .filter_map(|entry| entry.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let variables = dedupe_first_seen(variables, |(k, _)| k.as_str());

        let mut facts = Vec::with_capacity(variables.len());
        for (key, value) in variables {
            let fact = Fact {
                environment: target.environment_id,
                name: key.clone(),
                value: value.clone(),
                source: source.clone(),
                category: "Environment Variable".into(),
                fact_type: FactType::Text,
                service: Some(target.service.clone()),
                ..Default::default()
            };
            let record = InputRecord::EnvironmentVariable { key, value };
            facts.push(self.transformer.apply(&fact, &record));
        }
        let facts = key_facts_filter(facts, &self.transformer);

        debug!(source, facts = facts.len(), "decoded image inspect");

        Ok(Some(FilterOutput {
            source,
            findings: Findings::Facts(facts),
            sbom: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Raw facts
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct FactsPayload {
    #[serde(default)]
    facts: Vec<Fact>,
}

/// Projects a `{"facts": [...]}` payload into facts.
pub struct RawFactsFilter {
    transformer: Arc<FactTransformer>,
}

impl RawFactsFilter {
    /// Build the filter over the shared rule engine.
    pub fn new(transformer: Arc<FactTransformer>) -> Self {
        Self { transformer }
    }
}

impl ParserFilter for RawFactsFilter {
    fn name(&self) -> &'static str {
        "raw-facts"
    }

    fn apply(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Option<FilterOutput>, PipelineError> {
        if descriptor.kind != InsightKind::Raw || descriptor.lagoon_type != LagoonType::Facts {
            return Ok(None);
        }

        let source = format!("insights:facts:{}", target.service);
        let parsed: FactsPayload =
            serde_json::from_str(payload).map_err(|e| PipelineError::Malformed {
                what: "facts",
                source: e,
            })?;

        let incoming = dedupe_first_seen(parsed.facts, |f| f.name.as_str());
        let mut facts = Vec::with_capacity(incoming.len());
        for raw in incoming {
            let fact = Fact {
                environment: target.environment_id,
                name: raw.name.clone(),
                value: raw.value.clone(),
                source: source.clone(),
                description: raw.description.clone(),
                category: raw.category.clone(),
                key_fact: raw.key_fact,
                fact_type: FactType::Text,
                service: raw.service.clone(),
            };
            facts.push(self.transformer.apply(&fact, &InputRecord::RawFact(raw)));
        }
        let facts = key_facts_filter(facts, &self.transformer);

        debug!(source, facts = facts.len(), "processed raw facts");

        Ok(Some(FilterOutput {
            source,
            findings: Findings::Facts(facts),
            sbom: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Raw problems
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct ProblemsPayload {
    #[serde(default)]
    problems: Vec<Problem>,
}

/// Projects a `{"problems": [...]}` payload into problems, stamped with the
/// resolved environment and batch source.
pub struct RawProblemsFilter;

impl ParserFilter for RawProblemsFilter {
    fn name(&self) -> &'static str {
        "raw-problems"
    }

    fn apply(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Option<FilterOutput>, PipelineError> {
        if descriptor.kind != InsightKind::Raw || descriptor.lagoon_type != LagoonType::Problems {
            return Ok(None);
        }

        let source = format!("insights:problems:{}", target.service);
        let parsed: ProblemsPayload =
            serde_json::from_str(payload).map_err(|e| PipelineError::Malformed {
                what: "problems",
                source: e,
            })?;

        let problems: Vec<Problem> = parsed
            .problems
            .into_iter()
            .map(|mut p| {
                // Incoming environment ids are never trusted.
                p.environment = target.environment_id;
                p.source = source.clone();
                if p.service.is_empty() {
                    p.service = target.service.clone();
                }
                p
            })
            .collect();

        debug!(source, problems = problems.len(), "processed raw problems");

        Ok(Some(FilterOutput {
            source,
            findings: Findings::Problems(problems),
            sbom: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
