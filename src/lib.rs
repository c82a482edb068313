//! Obsidian - Obsidian Network 后端
//!
//! 模块划分：
//! - **api**: axum 路由（DAO / 市场 / 情报演示数据、聊天中继、实时 WebSocket）
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 错误类型与优雅关闭
//! - **observability**: tracing 日志初始化
//! - **relay**: 聊天中继核心（Upstream Session Manager + Request/Reply Correlator）

pub mod api;
pub mod config;
pub mod core;
pub mod observability;
pub mod relay;

pub use crate::core::RelayError;
pub use relay::{ChatRelay, ChatReply, ReplySource};
