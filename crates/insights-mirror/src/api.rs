// SPDX-License-Identifier: MIT OR Apache-2.0
//! The read-back REST surface over the mirror store.
//!
//! Status codes are part of the contract: 200 for list/delete, 201 for
//! create, 400 for a bad id or body, 404 when a delete matched nothing,
//! 500 for storage errors.

use crate::MirrorStore;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use insights_core::Fact;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info};

/// JSON error body with an explicit status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn storage(err: crate::MirrorStoreError) -> Self {
        error!(%err, "mirror storage error");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "storage error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

/// Build the mirror router.
pub fn build_router(store: Arc<MirrorStore>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/environment/{id}/facts",
            get(list_facts).post(create_facts).delete(delete_facts),
        )
        .route("/environment/{id}/problems", get(list_problems))
        .with_state(store)
}

/// Bind and serve the router until the process exits.
///
/// # Errors
///
/// Propagates bind/serve I/O failures.
pub async fn serve(store: Arc<MirrorStore>, addr: &str) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr, "mirror webservice listening");
    axum::serve(listener, build_router(store)).await
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn parse_environment_id(raw: &str) -> Result<i64, ApiError> {
    raw.parse::<i64>()
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid environment id"))
}

async fn list_facts(
    Path(id): Path<String>,
    State(store): State<Arc<MirrorStore>>,
) -> Result<Json<Vec<Fact>>, ApiError> {
    let environment = parse_environment_id(&id)?;
    let facts = store
        .facts_by_environment(environment)
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(facts))
}

async fn create_facts(
    Path(id): Path<String>,
    State(store): State<Arc<MirrorStore>>,
    body: String,
) -> Result<Response, ApiError> {
    let environment = parse_environment_id(&id)?;
    let mut facts: Vec<Fact> = serde_json::from_str(&body)
        .map_err(|_| ApiError::new(StatusCode::BAD_REQUEST, "invalid fact body"))?;

    for fact in &mut facts {
        fact.environment = environment;
    }
    store.insert_facts(&facts).await.map_err(ApiError::storage)?;

    Ok((StatusCode::CREATED, Json(facts)).into_response())
}

#[derive(Debug, Deserialize)]
struct DeleteFactsQuery {
    source: Option<String>,
}

async fn delete_facts(
    Path(id): Path<String>,
    Query(query): Query<DeleteFactsQuery>,
    State(store): State<Arc<MirrorStore>>,
) -> Result<Response, ApiError> {
    let environment = parse_environment_id(&id)?;
    let removed = store
        .delete_facts(environment, query.source.as_deref())
        .await
        .map_err(ApiError::storage)?;

    if removed == 0 {
        return Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "no matching facts found for deletion",
        ));
    }

    Ok(Json(json!({ "message": "facts deleted", "removed": removed })).into_response())
}

async fn list_problems(
    Path(id): Path<String>,
    State(store): State<Arc<MirrorStore>>,
) -> Result<Json<Vec<insights_core::Problem>>, ApiError> {
    let environment = parse_environment_id(&id)?;
    let problems = store
        .problems_by_environment(environment)
        .await
        .map_err(ApiError::storage)?;
    Ok(Json(problems))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
