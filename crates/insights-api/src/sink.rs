// SPDX-License-Identifier: MIT OR Apache-2.0
//! The delete-then-insert sink.
//!
//! For every `(environment, source)` — or `(environment, service, source)`
//! for problems — the matching delete is issued strictly before the add.
//! That ordering is the only idempotency mechanism the service has, so it
//! also holds when the new batch is empty: stale findings from a source must
//! disappear even when the source now reports nothing.

use async_trait::async_trait;
use insights_core::sink::{FindingsSink, InsightsApi, MirrorWriter, SinkError};
use insights_core::{Fact, Problem, ResolvedTarget, ResourceTarget};
use std::sync::Arc;
use tracing::{info, warn};

/// [`FindingsSink`] implementation over the upstream API, with an optional
/// best-effort local mirror.
pub struct LagoonSink {
    api: Arc<dyn InsightsApi>,
    mirror: Option<Arc<dyn MirrorWriter>>,
}

impl LagoonSink {
    /// Sink writing to the upstream API only.
    pub fn new(api: Arc<dyn InsightsApi>) -> Self {
        Self { api, mirror: None }
    }

    /// Sink that also mirrors every write locally. Mirror failures are
    /// logged and never fail the batch.
    pub fn with_mirror(api: Arc<dyn InsightsApi>, mirror: Arc<dyn MirrorWriter>) -> Self {
        Self {
            api,
            mirror: Some(mirror),
        }
    }
}

#[async_trait]
impl FindingsSink for LagoonSink {
    async fn resolve(&self, target: &ResourceTarget) -> Result<ResolvedTarget, SinkError> {
        if target.project.is_empty() && target.environment.is_empty() {
            return Err(SinkError::permanent(
                "no resource definition labels found in payload \
                 (lagoon.sh/project or lagoon.sh/environment)",
            ));
        }

        let project = self.api.get_project_by_name(&target.project).await?;
        if project.id == 0 {
            return Err(SinkError::permanent(format!(
                "unable to determine resource destination (does {}:{} exist?)",
                target.project, target.environment
            )));
        }

        let environment = self
            .api
            .get_environment_from_name(&target.environment, project.id)
            .await?;
        if environment.id == 0 {
            return Err(SinkError::permanent(format!(
                "unable to determine resource destination (does {}:{} exist?)",
                target.project, target.environment
            )));
        }

        Ok(ResolvedTarget {
            project_id: project.id,
            project: project.name,
            environment_id: environment.id,
            environment: environment.name,
            service: target.service.clone(),
        })
    }

    async fn replace_facts(
        &self,
        environment: i64,
        source: &str,
        facts: Vec<Fact>,
    ) -> Result<String, SinkError> {
        let removed = self.api.delete_facts_from_source(environment, source).await?;
        info!(environment, source, removed, "deleted previous facts");

        let summary = if facts.is_empty() {
            "no new facts".to_string()
        } else {
            self.api.add_facts(&facts).await?
        };

        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.mirror_facts(environment, source, &facts).await
        {
            warn!(environment, source, %err, "mirror write failed");
        }

        Ok(summary)
    }

    async fn replace_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
        problems: Vec<Problem>,
    ) -> Result<Vec<String>, SinkError> {
        let deleted = self
            .api
            .delete_problems_from_source(environment, service, source)
            .await?;
        info!(environment, service, source, deleted, "deleted previous problems");

        let summaries = if problems.is_empty() {
            Vec::new()
        } else {
            self.api.add_problems(&problems).await?
        };

        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror
                .mirror_problems(environment, service, source, &problems)
                .await
        {
            warn!(environment, service, source, %err, "mirror write failed");
        }

        Ok(summaries)
    }

    async fn delete_facts(&self, environment: i64, source: &str) -> Result<i64, SinkError> {
        let removed = self.api.delete_facts_from_source(environment, source).await?;

        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror.mirror_delete_facts(environment, source).await
        {
            warn!(environment, source, %err, "mirror delete failed");
        }

        Ok(removed)
    }

    async fn delete_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<String, SinkError> {
        let result = self
            .api
            .delete_problems_from_source(environment, service, source)
            .await?;

        if let Some(mirror) = &self.mirror
            && let Err(err) = mirror
                .mirror_delete_problems(environment, service, source)
                .await
        {
            warn!(environment, service, source, %err, "mirror delete failed");
        }

        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
