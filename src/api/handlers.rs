use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::fixtures::{self, Benchmark, Dao, Insight, MarketAgent, Proposal, Transaction, Treasury};
use super::ApiState;
use crate::core::RelayError;
use crate::relay::ReplySource;

type ApiResult<T> = Result<Json<T>, ApiError>;

/// 非 2xx 响应：`{error, message}`
#[derive(Debug)]
pub enum ApiError {
    NotFound(&'static str),
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(e: RelayError) -> Self {
        ApiError::Relay(e)
    }
}

/// 中继错误 → HTTP 状态码
pub fn relay_status(err: &RelayError) -> StatusCode {
    match err {
        RelayError::InvalidInput => StatusCode::BAD_REQUEST,
        RelayError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RelayError::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        RelayError::UpstreamError(_) | RelayError::DirectoryLookupFailed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(what) => (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": format!("{what} not found") })),
            )
                .into_response(),
            ApiError::Relay(err) => {
                let status = relay_status(&err);
                if status.is_server_error() {
                    tracing::warn!("Chat request failed: {}", err);
                }
                (
                    status,
                    Json(json!({ "error": err.kind(), "message": err.to_string() })),
                )
                    .into_response()
            }
        }
    }
}

pub async fn health(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "upstream": state.relay.sessions().state().to_string(),
    }))
}

pub async fn list_daos(State(state): State<Arc<ApiState>>) -> Json<Vec<Dao>> {
    Json(state.fixtures.daos.clone())
}

pub async fn get_dao(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> ApiResult<Dao> {
    state
        .fixtures
        .dao(&id)
        .cloned()
        .map(Json)
        .ok_or(ApiError::NotFound("DAO"))
}

pub async fn get_treasury(Path(_id): Path<String>) -> Json<Treasury> {
    Json(fixtures::treasury())
}

pub async fn list_transactions(Path(_id): Path<String>) -> Json<Vec<Transaction>> {
    Json(fixtures::transactions())
}

pub async fn list_proposals(
    State(state): State<Arc<ApiState>>,
    Path(_id): Path<String>,
) -> Json<Vec<Proposal>> {
    Json(state.fixtures.proposals.clone())
}

/// `/agents` 查询过滤条件
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentFilter {
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub availability: Option<String>,
    pub min_rating: Option<f64>,
}

impl AgentFilter {
    fn matches(&self, agent: &MarketAgent) -> bool {
        self.kind
            .as_deref()
            .map_or(true, |k| agent.kind.eq_ignore_ascii_case(k))
            && self
                .availability
                .as_deref()
                .map_or(true, |a| agent.availability.as_str().eq_ignore_ascii_case(a))
            && self.min_rating.map_or(true, |r| agent.rating >= r)
    }
}

pub async fn list_agents(
    State(state): State<Arc<ApiState>>,
    Query(filter): Query<AgentFilter>,
) -> Json<Vec<MarketAgent>> {
    Json(
        state
            .fixtures
            .agents
            .iter()
            .filter(|a| filter.matches(a))
            .cloned()
            .collect(),
    )
}

pub async fn get_agent(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<MarketAgent> {
    state
        .fixtures
        .agent(&id)
        .cloned()
        .map(Json)
        .ok_or(ApiError::NotFound("Agent"))
}

pub async fn list_insights() -> Json<Vec<Insight>> {
    Json(fixtures::insights())
}

pub async fn list_benchmarks(Path(_dao_id): Path<String>) -> Json<Vec<Benchmark>> {
    Json(fixtures::benchmarks())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatResponse {
    pub message: String,
    pub agent_id: String,
    pub source: ReplySource,
}

pub async fn chat(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ChatRequest>, JsonRejection>,
) -> ApiResult<ChatResponse> {
    // 非 JSON、message 不是字符串等都视为输入错误
    let Json(req) = payload.map_err(|e| {
        tracing::debug!("Rejected chat body: {}", e);
        RelayError::InvalidInput
    })?;
    let message = req.message.unwrap_or_default();

    let reply = state
        .relay
        .send_chat(&message, req.agent_id.as_deref())
        .await?;

    Ok(Json(ChatResponse {
        message: reply.text,
        agent_id: reply.agent_id,
        source: reply.source,
    }))
}
