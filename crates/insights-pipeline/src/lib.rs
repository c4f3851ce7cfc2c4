// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-pipeline
#![deny(unsafe_code)]
//!
//! The fixed list of parser-filters that turn a classified payload into
//! facts and problems.
//!
//! A [`Pipeline`] is built once at startup by [`build_pipeline`] and passed
//! through the dispatcher; there is no global registry and no late
//! registration. Each filter inspects the descriptor, returns `None` when it
//! does not apply, and otherwise yields a `(source, findings)` association
//! the sink writes atomically per source.

/// The concrete parser-filters.
pub mod filters;

use insights_codec::CodecError;
use insights_codec::cyclonedx::SbomDocument;
use insights_core::classify::InsightsDescriptor;
use insights_core::{Fact, Problem, ResolvedTarget};
use insights_transform::FactTransformer;
use std::sync::Arc;
use tracing::debug;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while running payloads through the pipeline. All of them
/// fail the current envelope permanently; none of them panic.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Payload bytes could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// A payload decoded but did not have the shape the filter expects.
    #[error("malformed {what} payload: {source}")]
    Malformed {
        /// What the filter was trying to parse.
        what: &'static str,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

// ---------------------------------------------------------------------------
// Filter contract
// ---------------------------------------------------------------------------

/// Findings produced by one filter for one payload item.
#[derive(Debug, Clone, PartialEq)]
pub enum Findings {
    /// A batch of facts, written under the output's source.
    Facts(Vec<Fact>),
    /// A batch of problems, written per `(service, source)` key.
    Problems(Vec<Problem>),
}

/// One `(source, findings)` association produced by a matching filter.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterOutput {
    /// Namespacing source string (`insights:<kind>:<service>`).
    pub source: String,
    /// The findings themselves.
    pub findings: Findings,
    /// The decoded BOM, when this filter parsed one, for the enricher.
    pub sbom: Option<SbomDocument>,
}

/// A registered parser-filter.
///
/// Implementations must be pure with respect to process state: everything
/// they need arrives through the arguments, so the pipeline can be shared
/// read-only across workers.
pub trait ParserFilter: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Run the filter against one payload item.
    ///
    /// `Ok(None)` means the descriptor predicate did not match and the
    /// filter was skipped.
    ///
    /// # Errors
    ///
    /// [`PipelineError`] when the payload matched this filter but could not
    /// be decoded.
    fn apply(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Option<FilterOutput>, PipelineError>;
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// The process-wide, immutable, ordered filter list.
pub struct Pipeline {
    filters: Vec<Box<dyn ParserFilter>>,
}

impl Pipeline {
    /// Run every filter over one payload item, collecting the outputs of
    /// those that matched.
    ///
    /// # Errors
    ///
    /// The first [`PipelineError`] from a matching filter.
    pub fn process_item(
        &self,
        descriptor: &InsightsDescriptor,
        payload: &str,
        target: &ResolvedTarget,
    ) -> Result<Vec<FilterOutput>, PipelineError> {
        let mut outputs = Vec::new();
        for filter in &self.filters {
            match filter.apply(descriptor, payload, target)? {
                Some(output) => {
                    debug!(
                        filter = filter.name(),
                        source = %output.source,
                        "filter matched"
                    );
                    outputs.push(output);
                }
                None => debug!(filter = filter.name(), "filter skipped"),
            }
        }
        Ok(outputs)
    }

    /// Number of registered filters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.filters.len()
    }

    /// Whether the pipeline has no filters.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}

/// Build the fixed pipeline: SBOM, image-inspect, raw facts, raw problems.
#[must_use]
pub fn build_pipeline(transformer: Arc<FactTransformer>) -> Pipeline {
    Pipeline {
        filters: vec![
            Box::new(filters::SbomFilter::new(Arc::clone(&transformer))),
            Box::new(filters::ImageInspectFilter::new(Arc::clone(&transformer))),
            Box::new(filters::RawFactsFilter::new(Arc::clone(&transformer))),
            Box::new(filters::RawProblemsFilter),
        ],
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Collapse duplicates, keeping the first occurrence of each key.
pub(crate) fn dedupe_first_seen<T>(items: Vec<T>, key: impl Fn(&T) -> &str) -> Vec<T> {
    let mut seen = std::collections::HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(key(item).to_string()))
        .collect()
}

/// The key-facts post-filter for inferred paths.
///
/// Key facts are selected by transform rules; when no rules are loaded
/// nothing can be marked and the filter would erase every batch, so it only
/// applies when the transformer actually carries rules.
pub(crate) fn key_facts_filter(facts: Vec<Fact>, transformer: &FactTransformer) -> Vec<Fact> {
    if transformer.is_empty() {
        return facts;
    }
    facts.into_iter().filter(|f| f.key_fact).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedupe_keeps_first_occurrence() {
        let items = vec![("a", 1), ("b", 2), ("a", 3)];
        let out = dedupe_first_seen(items, |(k, _)| *k);
        assert_eq!(out, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn built_pipeline_has_all_four_filters() {
        let pipeline = build_pipeline(Arc::new(FactTransformer::empty()));
        assert_eq!(pipeline.len(), 4);
        assert!(!pipeline.is_empty());
    }
}
