// SPDX-License-Identifier: MIT OR Apache-2.0
//! The typed direct envelopes: facts, problems, and the two delete forms.
//!
//! Direct messages bypass the classifier, the pipeline, the enricher, and
//! the archiver entirely; the body carries everything, already resolved to
//! numeric environment ids. Producers send those ids as JSON numbers or
//! numeric strings, so id fields accept both.

use insights_core::sink::{FindingsSink, SinkError};
use insights_core::{Fact, FactType, Problem};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Errors from the direct paths.
#[derive(Debug, thiserror::Error)]
pub enum DirectError {
    /// The body did not parse as the typed direct message.
    #[error("malformed direct message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// No environment id was carried anywhere in the message.
    #[error("direct message carries no environment id")]
    MissingEnvironment,

    /// Writing to the sink failed.
    #[error(transparent)]
    Sink(#[from] SinkError),
}

// ---------------------------------------------------------------------------
// Flexible ids
// ---------------------------------------------------------------------------

fn flexible_id<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(id)) => Ok(Some(id)),
        Some(Raw::Text(text)) if text.is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .parse::<i64>()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid environment id `{text}`"))),
    }
}

// ---------------------------------------------------------------------------
// Direct facts
// ---------------------------------------------------------------------------

/// Body of a `direct.facts` envelope.
#[derive(Debug, Deserialize)]
pub struct DirectFacts {
    /// Environment id applying to facts that carry none of their own.
    #[serde(rename = "environment", default, deserialize_with = "flexible_id")]
    pub environment: Option<i64>,
    /// Project name, for logs only.
    #[serde(rename = "projectName", default)]
    pub project_name: String,
    /// Environment name, for logs only.
    #[serde(rename = "environmentName", default)]
    pub environment_name: String,
    /// The facts themselves.
    #[serde(default)]
    pub facts: Vec<DirectFact>,
}

/// One fact in a `direct.facts` body.
#[derive(Debug, Deserialize)]
pub struct DirectFact {
    /// Per-fact environment id, overriding the body-level one.
    #[serde(rename = "environment", default, deserialize_with = "flexible_id")]
    pub environment: Option<i64>,
    /// Fact name.
    pub name: String,
    /// Fact value.
    #[serde(default)]
    pub value: String,
    /// Producer source string.
    #[serde(default)]
    pub source: String,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Declared value type; anything unknown collapses to `TEXT`.
    #[serde(rename = "type", default)]
    pub fact_type: String,
    /// Category.
    #[serde(default)]
    pub category: String,
    /// Service.
    #[serde(default)]
    pub service: Option<String>,
}

/// Process a `direct.facts` body: per `(environment, source)` group, delete
/// then insert.
///
/// # Errors
///
/// [`DirectError`] on parse or sink failure.
pub async fn process_direct_facts(
    body: &[u8],
    sink: &dyn FindingsSink,
) -> Result<String, DirectError> {
    let direct: DirectFacts = serde_json::from_slice(body)?;
    debug!(
        project = %direct.project_name,
        environment = %direct.environment_name,
        facts = direct.facts.len(),
        "processing direct facts"
    );

    let mut batches: BTreeMap<(i64, String), Vec<Fact>> = BTreeMap::new();
    for fact in direct.facts {
        let environment = fact
            .environment
            .or(direct.environment)
            .ok_or(DirectError::MissingEnvironment)?;
        batches
            .entry((environment, fact.source.clone()))
            .or_default()
            .push(Fact {
                environment,
                name: fact.name,
                value: fact.value,
                source: fact.source,
                description: fact.description,
                category: fact.category,
                key_fact: false,
                fact_type: FactType::normalize(&fact.fact_type),
                service: fact.service,
            });
    }

    let mut written = 0usize;
    for ((environment, source), facts) in batches {
        written += facts.len();
        let summary = sink.replace_facts(environment, &source, facts).await?;
        info!(environment, source, summary, "direct facts written");
    }

    Ok(format!("processed {written} direct fact(s)"))
}

// ---------------------------------------------------------------------------
// Direct problems
// ---------------------------------------------------------------------------

/// Body of a `direct.problems` envelope.
#[derive(Debug, Deserialize)]
pub struct DirectProblems {
    /// Environment id every problem is forced onto.
    #[serde(rename = "environment", default, deserialize_with = "flexible_id")]
    pub environment: Option<i64>,
    /// Project name, for logs only.
    #[serde(rename = "projectName", default)]
    pub project_name: String,
    /// Environment name, for logs only.
    #[serde(rename = "environmentName", default)]
    pub environment_name: String,
    /// The problems themselves.
    #[serde(default)]
    pub problems: Vec<Problem>,
}

/// Process a `direct.problems` body: per `(service, source)` group, delete
/// then insert. Incoming per-problem environment ids are overwritten with
/// the body-level id so producers cannot smuggle writes into other
/// environments.
///
/// # Errors
///
/// [`DirectError`] on parse or sink failure.
pub async fn process_direct_problems(
    body: &[u8],
    sink: &dyn FindingsSink,
) -> Result<Vec<String>, DirectError> {
    let direct: DirectProblems = serde_json::from_slice(body)?;
    let environment = direct.environment.ok_or(DirectError::MissingEnvironment)?;
    debug!(
        project = %direct.project_name,
        environment_name = %direct.environment_name,
        problems = direct.problems.len(),
        "processing direct problems"
    );

    let mut batches: BTreeMap<(String, String), Vec<Problem>> = BTreeMap::new();
    for mut problem in direct.problems {
        problem.environment = environment;
        batches
            .entry((problem.service.clone(), problem.source.clone()))
            .or_default()
            .push(problem);
    }

    let mut summaries = Vec::new();
    for ((service, source), problems) in batches {
        let mut batch = sink
            .replace_problems(environment, &service, &source, problems)
            .await?;
        info!(environment, service, source, written = batch.len(), "direct problems written");
        summaries.append(&mut batch);
    }

    Ok(summaries)
}

// ---------------------------------------------------------------------------
// Direct deletes
// ---------------------------------------------------------------------------

/// Body of the `direct.delete.facts` / `direct.delete.problems` envelopes.
#[derive(Debug, Deserialize)]
pub struct DirectDeleteMessage {
    /// Environment id.
    #[serde(rename = "environment", default, deserialize_with = "flexible_id")]
    pub environment: Option<i64>,
    /// Source whose findings are removed.
    #[serde(default)]
    pub source: String,
    /// Service (problems only).
    #[serde(default)]
    pub service: String,
}

/// Process a `direct.delete.facts` body.
///
/// # Errors
///
/// [`DirectError`] on parse or sink failure.
pub async fn process_direct_delete_facts(
    body: &[u8],
    sink: &dyn FindingsSink,
) -> Result<String, DirectError> {
    let delete: DirectDeleteMessage = serde_json::from_slice(body)?;
    let environment = delete.environment.ok_or(DirectError::MissingEnvironment)?;

    let removed = sink.delete_facts(environment, &delete.source).await?;
    info!(environment, source = %delete.source, removed, "deleted facts");
    Ok(format!("deleted {removed} fact(s)"))
}

/// Process a `direct.delete.problems` body.
///
/// # Errors
///
/// [`DirectError`] on parse or sink failure.
pub async fn process_direct_delete_problems(
    body: &[u8],
    sink: &dyn FindingsSink,
) -> Result<String, DirectError> {
    let delete: DirectDeleteMessage = serde_json::from_slice(body)?;
    let environment = delete.environment.ok_or(DirectError::MissingEnvironment)?;

    let result = sink
        .delete_problems(environment, &delete.service, &delete.source)
        .await?;
    info!(
        environment,
        service = %delete.service,
        source = %delete.source,
        "deleted problems"
    );
    Ok(result)
}
