//! HTTP API（axum）
//!
//! 仪表盘的 REST 端点（静态演示数据）、`POST /agent/chat` 聊天中继与 `/ws` 实时通道。

pub mod fixtures;
pub mod handlers;
pub mod ws;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::relay::ChatRelay;
use fixtures::Fixtures;

/// 路由共享状态
pub struct ApiState {
    pub relay: Arc<ChatRelay>,
    pub fixtures: Fixtures,
}

impl ApiState {
    pub fn new(relay: Arc<ChatRelay>) -> Self {
        Self {
            relay,
            fixtures: Fixtures::demo(),
        }
    }
}

/// 创建完整路由（CORS 放开，与旧 Express 服务一致）
pub fn create_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/daos", get(handlers::list_daos))
        .route("/daos/:id", get(handlers::get_dao))
        .route("/daos/:id/treasury", get(handlers::get_treasury))
        .route("/daos/:id/transactions", get(handlers::list_transactions))
        .route("/daos/:id/proposals", get(handlers::list_proposals))
        .route("/agents", get(handlers::list_agents))
        .route("/agents/:id", get(handlers::get_agent))
        .route("/intelligence/insights", get(handlers::list_insights))
        .route("/intelligence/benchmarks/:dao_id", get(handlers::list_benchmarks))
        .route("/agent/chat", post(handlers::chat))
        .route("/ws", get(ws::upgrade))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
