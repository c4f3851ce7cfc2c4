// SPDX-License-Identifier: MIT OR Apache-2.0
//! Sink traits for findings, and the transient/permanent error taxonomy the
//! retry controller keys off.

use crate::{Fact, Problem, ResolvedTarget, ResourceTarget};
use async_trait::async_trait;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Whether a sink failure may succeed on redelivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkErrorKind {
    /// Network-shaped failures: timeouts, transport errors, 5xx responses.
    /// Eligible for the retry controller's republish path.
    Transient,
    /// Failures that will recur on redelivery: unresolvable resources,
    /// GraphQL rejections, malformed bodies.
    Permanent,
}

/// A failure writing to (or resolving against) a sink.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct SinkError {
    /// Retry eligibility.
    pub kind: SinkErrorKind,
    /// Human-readable detail.
    pub message: String,
}

impl SinkError {
    /// A failure worth republishing for.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Transient,
            message: message.into(),
        }
    }

    /// A failure that will recur on redelivery.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SinkErrorKind::Permanent,
            message: message.into(),
        }
    }

    /// Whether the retry controller should consider republishing.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.kind == SinkErrorKind::Transient
    }
}

/// A failure writing to the local mirror. Never fails a batch; only logged.
#[derive(Debug, thiserror::Error)]
#[error("mirror storage error: {0}")]
pub struct MirrorError(pub String);

// ---------------------------------------------------------------------------
// Upstream API operations
// ---------------------------------------------------------------------------

/// A project as reported by the upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectRef {
    /// Numeric id; zero means "not found".
    pub id: i64,
    /// Project name.
    pub name: String,
}

/// An environment as reported by the upstream API.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentRef {
    /// Numeric id; zero means "not found".
    pub id: i64,
    /// Environment name.
    pub name: String,
}

/// The upstream GraphQL operations this service invokes, modelled abstractly
/// so tests can observe call ordering with a recording mock.
#[async_trait]
pub trait InsightsApi: Send + Sync {
    /// Look up a project by name.
    async fn get_project_by_name(&self, name: &str) -> Result<ProjectRef, SinkError>;

    /// Look up an environment by name within a project.
    async fn get_environment_from_name(
        &self,
        name: &str,
        project_id: i64,
    ) -> Result<EnvironmentRef, SinkError>;

    /// Add a batch of facts; returns the API's summary string.
    async fn add_facts(&self, facts: &[Fact]) -> Result<String, SinkError>;

    /// Delete all facts for `(environment, source)`; returns rows removed.
    async fn delete_facts_from_source(
        &self,
        environment: i64,
        source: &str,
    ) -> Result<i64, SinkError>;

    /// Add a batch of problems; returns one summary string per problem.
    async fn add_problems(&self, problems: &[Problem]) -> Result<Vec<String>, SinkError>;

    /// Delete all problems for `(environment, service, source)`.
    async fn delete_problems_from_source(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<String, SinkError>;
}

// ---------------------------------------------------------------------------
// Findings sink
// ---------------------------------------------------------------------------

/// The write surface the dispatcher and enricher use.
///
/// Every `replace_*` implementation must issue the matching delete-by-key
/// strictly before the add; that ordering is the service's sole idempotency
/// mechanism.
#[async_trait]
pub trait FindingsSink: Send + Sync {
    /// Resolve a named target to numeric ids. Fails permanently when the
    /// project or environment does not resolve to a non-zero id.
    async fn resolve(&self, target: &ResourceTarget) -> Result<ResolvedTarget, SinkError>;

    /// Delete facts for `(environment, source)`, then add `facts`.
    async fn replace_facts(
        &self,
        environment: i64,
        source: &str,
        facts: Vec<Fact>,
    ) -> Result<String, SinkError>;

    /// Delete problems for `(environment, service, source)`, then add
    /// `problems`.
    async fn replace_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
        problems: Vec<Problem>,
    ) -> Result<Vec<String>, SinkError>;

    /// Delete facts for `(environment, source)` without adding new ones.
    async fn delete_facts(&self, environment: i64, source: &str) -> Result<i64, SinkError>;

    /// Delete problems for `(environment, service, source)`.
    async fn delete_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<String, SinkError>;
}

// ---------------------------------------------------------------------------
// Local mirror
// ---------------------------------------------------------------------------

/// Best-effort local mirror of the upstream writes. Implementations must
/// apply the same delete-then-insert sequence; callers log failures and
/// continue.
#[async_trait]
pub trait MirrorWriter: Send + Sync {
    /// Mirror a fact replacement.
    async fn mirror_facts(
        &self,
        environment: i64,
        source: &str,
        facts: &[Fact],
    ) -> Result<(), MirrorError>;

    /// Mirror a problem replacement.
    async fn mirror_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
        problems: &[Problem],
    ) -> Result<(), MirrorError>;

    /// Mirror a bare fact deletion.
    async fn mirror_delete_facts(&self, environment: i64, source: &str) -> Result<(), MirrorError>;

    /// Mirror a bare problem deletion.
    async fn mirror_delete_problems(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<(), MirrorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_and_permanent_are_distinguished() {
        assert!(SinkError::transient("timeout").is_transient());
        assert!(!SinkError::permanent("no such environment").is_transient());
    }

    #[test]
    fn sink_error_displays_its_message() {
        let err = SinkError::transient("connection reset");
        assert_eq!(err.to_string(), "connection reset");
    }
}
