//! 中继错误类型
//!
//! 聊天中继每个阶段的失败都映射为可区分的 RelayError；HTTP 层按 `kind()` 与状态码转换为 `{error, message}`。

use std::time::Duration;

use thiserror::Error;

/// 聊天中继过程中可能出现的错误（输入校验、上游连接、上游报错、等待超时、目录查询）
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// 空消息或非文本消息：不接触上游直接失败
    #[error("Message must be a non-empty string")]
    InvalidInput,

    /// 连接失败、重连次数耗尽或交换过程中连接断开
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// 上游显式发出 error 事件
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    /// 有界等待内未收到匹配的广播
    #[error("No reply from agent within {0:?}")]
    Timeout(Duration),

    /// 目录查询失败；在 Correlator 内部回退到默认 agent id，不向调用方暴露
    #[error("Agent directory lookup failed: {0}")]
    DirectoryLookupFailed(String),
}

impl RelayError {
    /// 稳定的错误码（snake_case），用于 HTTP 响应体的 `error` 字段
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::InvalidInput => "invalid_input",
            RelayError::UpstreamUnavailable(_) => "upstream_unavailable",
            RelayError::UpstreamError(_) => "upstream_error",
            RelayError::Timeout(_) => "timeout",
            RelayError::DirectoryLookupFailed(_) => "directory_lookup_failed",
        }
    }

    /// 是否允许降级为模拟回复（仅连接类与超时类错误）
    pub fn is_recoverable_by_mock(&self) -> bool {
        matches!(
            self,
            RelayError::UpstreamUnavailable(_) | RelayError::Timeout(_)
        )
    }
}
