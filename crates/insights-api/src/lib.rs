// SPDX-License-Identifier: MIT OR Apache-2.0
//! insights-api
#![deny(unsafe_code)]
//!
//! The upstream GraphQL control-plane client.
//!
//! Every request is authenticated with a freshly minted one-minute admin
//! bearer token, so there is no token cache and nothing to refresh. The
//! GraphQL schema is modelled only by the handful of operations this service
//! invokes.

/// The delete-then-insert sink over the client.
pub mod sink;

pub use sink::LagoonSink;

use async_trait::async_trait;
use chrono::Utc;
use insights_core::sink::{EnvironmentRef, InsightsApi, ProjectRef, SinkError};
use insights_core::{Fact, Problem};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Connection and token-signing parameters for the upstream API.
#[derive(Debug, Clone)]
pub struct ApiClientConfig {
    /// GraphQL endpoint URL.
    pub endpoint: String,
    /// HS256 signing key for admin tokens.
    pub token_signing_key: String,
    /// JWT audience claim.
    pub audience: String,
    /// JWT subject claim.
    pub subject: String,
    /// JWT issuer claim.
    pub issuer: String,
    /// Per-request deadline.
    pub request_timeout: Duration,
}

impl ApiClientConfig {
    /// Sensible deadline unless configured otherwise.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
}

// ---------------------------------------------------------------------------
// Token minting
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct AdminClaims {
    role: String,
    aud: String,
    sub: String,
    iss: String,
    iat: i64,
    exp: i64,
}

/// Mint a one-minute admin token for a single request.
///
/// # Errors
///
/// [`SinkError`] (permanent) when signing fails.
pub fn mint_admin_token(config: &ApiClientConfig) -> Result<String, SinkError> {
    let now = Utc::now().timestamp();
    let claims = AdminClaims {
        role: "admin".into(),
        aud: config.audience.clone(),
        sub: config.subject.clone(),
        iss: config.issuer.clone(),
        iat: now,
        exp: now + 60,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(config.token_signing_key.as_bytes()),
    )
    .map_err(|e| SinkError::permanent(format!("unable to sign admin token: {e}")))
}

// ---------------------------------------------------------------------------
// GraphQL plumbing
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GraphQlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphQlError>,
}

#[derive(Debug, Deserialize)]
struct GraphQlError {
    message: String,
}

const GET_PROJECT_BY_NAME: &str = r"
query getProjectByName($name: String!) {
  projectByName(name: $name) { id name }
}";

const GET_ENVIRONMENT_FROM_NAME: &str = r"
query getEnvironmentFromName($name: String!, $project: Int!) {
  environmentByName(name: $name, project: $project) { id name }
}";

const ADD_FACTS: &str = r"
mutation addFacts($facts: [AddFactInput]!) {
  addFacts(input: { facts: $facts }) { id }
}";

const DELETE_FACTS_FROM_SOURCE: &str = r"
mutation deleteFactsFromSource($environment: Int!, $source: String!) {
  deleteFactsFromSource(input: { environment: $environment, source: $source })
}";

const ADD_PROBLEM: &str = r"
mutation addProblem($input: AddProblemInput!) {
  addProblem(input: $input) { id }
}";

const DELETE_PROBLEMS_FROM_SOURCE: &str = r"
mutation deleteProblemsFromSource($environment: Int!, $service: String!, $source: String!) {
  deleteProblemsFromSource(input: {
    environment: $environment, service: $service, source: $source
  })
}";

/// The reqwest-backed client.
#[derive(Debug, Clone)]
pub struct LagoonApiClient {
    http: reqwest::Client,
    config: ApiClientConfig,
}

impl LagoonApiClient {
    /// Build a client; the underlying connection pool is shared by clones.
    pub fn new(config: ApiClientConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        operation: &'static str,
        query: &str,
        variables: serde_json::Value,
    ) -> Result<T, SinkError> {
        let token = mint_admin_token(&self.config)?;

        debug!(operation, "calling upstream api");
        let response = self
            .http
            .post(&self.config.endpoint)
            .timeout(self.config.request_timeout)
            .bearer_auth(token)
            .json(&serde_json::json!({ "query": query, "variables": variables }))
            .send()
            .await
            .map_err(|e| SinkError::transient(format!("{operation}: {e}")))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SinkError::transient(format!(
                "{operation}: upstream returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(SinkError::permanent(format!(
                "{operation}: upstream returned {status}"
            )));
        }

        let body: GraphQlResponse<T> = response
            .json()
            .await
            .map_err(|e| SinkError::transient(format!("{operation}: reading response: {e}")))?;

        if !body.errors.is_empty() {
            let messages: Vec<String> = body.errors.into_iter().map(|e| e.message).collect();
            return Err(SinkError::permanent(format!(
                "{operation}: {}",
                messages.join("; ")
            )));
        }

        body.data
            .ok_or_else(|| SinkError::permanent(format!("{operation}: response carried no data")))
    }
}

#[derive(Debug, Deserialize)]
struct IdOnly {
    #[allow(dead_code)]
    id: i64,
}

#[async_trait]
impl InsightsApi for LagoonApiClient {
    async fn get_project_by_name(&self, name: &str) -> Result<ProjectRef, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "projectByName", default)]
            project: Option<Project>,
        }
        #[derive(Deserialize)]
        struct Project {
            id: i64,
            name: String,
        }

        let data: Data = self
            .request(
                "getProjectByName",
                GET_PROJECT_BY_NAME,
                serde_json::json!({ "name": name }),
            )
            .await?;
        Ok(data
            .project
            .map(|p| ProjectRef { id: p.id, name: p.name })
            .unwrap_or_default())
    }

    async fn get_environment_from_name(
        &self,
        name: &str,
        project_id: i64,
    ) -> Result<EnvironmentRef, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "environmentByName", default)]
            environment: Option<Environment>,
        }
        #[derive(Deserialize)]
        struct Environment {
            id: i64,
            name: String,
        }

        let data: Data = self
            .request(
                "getEnvironmentFromName",
                GET_ENVIRONMENT_FROM_NAME,
                serde_json::json!({ "name": name, "project": project_id }),
            )
            .await?;
        Ok(data
            .environment
            .map(|e| EnvironmentRef { id: e.id, name: e.name })
            .unwrap_or_default())
    }

    async fn add_facts(&self, facts: &[Fact]) -> Result<String, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "addFacts", default)]
            added: Vec<IdOnly>,
        }

        let data: Data = self
            .request(
                "addFacts",
                ADD_FACTS,
                serde_json::json!({ "facts": facts }),
            )
            .await?;
        Ok(format!("added {} fact(s)", data.added.len()))
    }

    async fn delete_facts_from_source(
        &self,
        environment: i64,
        source: &str,
    ) -> Result<i64, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "deleteFactsFromSource", default)]
            removed: i64,
        }

        let data: Data = self
            .request(
                "deleteFactsFromSource",
                DELETE_FACTS_FROM_SOURCE,
                serde_json::json!({ "environment": environment, "source": source }),
            )
            .await?;
        Ok(data.removed)
    }

    async fn add_problems(&self, problems: &[Problem]) -> Result<Vec<String>, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "addProblem")]
            added: IdOnly,
        }

        // The upstream schema adds problems one at a time.
        let mut summaries = Vec::with_capacity(problems.len());
        for problem in problems {
            let result: Result<Data, SinkError> = self
                .request(
                    "addProblem",
                    ADD_PROBLEM,
                    serde_json::json!({ "input": problem }),
                )
                .await;
            match result {
                Ok(data) => summaries.push(format!(
                    "added {} with id {}",
                    problem.identifier, data.added.id
                )),
                Err(err) if err.is_transient() => return Err(err),
                Err(err) => summaries.push(format!(
                    "error adding {}: {err}",
                    problem.identifier
                )),
            }
        }
        Ok(summaries)
    }

    async fn delete_problems_from_source(
        &self,
        environment: i64,
        service: &str,
        source: &str,
    ) -> Result<String, SinkError> {
        #[derive(Deserialize)]
        struct Data {
            #[serde(rename = "deleteProblemsFromSource", default)]
            result: String,
        }

        let data: Data = self
            .request(
                "deleteProblemsFromSource",
                DELETE_PROBLEMS_FROM_SOURCE,
                serde_json::json!({
                    "environment": environment,
                    "service": service,
                    "source": source,
                }),
            )
            .await?;
        Ok(data.result)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
