//! HTTP handlers: thin adapters translating requests into agent calls.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use crate::core::agent::{Agent, AgentError, Inventory};
use crate::metrics::MetricSet;

/// User-visible failure: a status code plus a plain `{"error": "..."}`
/// JSON body.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        let status = match &err {
            AgentError::UnknownCollector(_) => StatusCode::NOT_FOUND,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// `GET /` and `GET /run`: full collection pass, merged metric document.
pub async fn run(State(agent): State<Arc<Agent>>) -> Result<Json<MetricSet>, ApiError> {
    Ok(Json(agent.run("").await?))
}

/// `GET /run/{id}`: pass scoped to one collector; 404 when unknown.
pub async fn run_scoped(
    State(agent): State<Arc<Agent>>,
    Path(id): Path<String>,
) -> Result<Json<MetricSet>, ApiError> {
    Ok(Json(agent.run(&id).await?))
}

/// `GET /inventory`: known plugin and builtin ids.
pub async fn inventory(State(agent): State<Arc<Agent>>) -> Json<Inventory> {
    Json(agent.inventory())
}

/// `GET /stats`: the process-wide stats map.
pub async fn stats(State(agent): State<Arc<Agent>>) -> Response {
    Json(agent.stats().snapshot()).into_response()
}

/// `PUT /write/{id}`: accepts a MetricSet for a named source.
pub async fn write(
    State(agent): State<Arc<Agent>>,
    Path(id): Path<String>,
    Json(metrics): Json<MetricSet>,
) -> StatusCode {
    agent.write(&id, metrics);
    StatusCode::NO_CONTENT
}
