//! Request/Reply Correlator
//!
//! 把一条聊天消息变成一条关联回复：
//! `Created → AgentResolved → RoomJoined → MessageSent → (Resolved | Failed)`
//!
//! Eliza 的加入房间没有确认事件。Waiter 在 join 之前注册，join 与消息按顺序写在同一条连接上，
//! 因此 join 生效前到达的回复仍能被接住；剩余的窗口只在上游自己乱序处理两条事件时存在。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::time::Instant;

use super::directory::{find_agent, AgentDirectory, CachedDirectory, HttpAgentDirectory};
use super::fallback::mock_reply;
use super::message::{ChatEnvelope, RelayIdentity};
use super::pending::PendingReplies;
use super::session::{RetryPolicy, UpstreamSessionManager};
use super::socketio::SocketIoConnector;
use crate::config::AppConfig;
use crate::core::RelayError;

/// 回复来源
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplySource {
    /// 上游 Socket.IO 广播
    #[serde(rename = "socketio")]
    SocketIo,
    /// 本地模拟回复
    Mock,
}

impl ReplySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplySource::SocketIo => "socketio",
            ReplySource::Mock => "mock",
        }
    }
}

/// 一次聊天交换的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatReply {
    pub text: String,
    pub agent_id: String,
    pub source: ReplySource,
}

/// 交换状态（仅用于日志）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Created,
    AgentResolved,
    RoomJoined,
    MessageSent,
    Resolved,
    Failed,
}

/// Correlator 配置
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub default_agent_id: String,
    pub reply_timeout: Duration,
    pub fallback_to_mock: bool,
    pub identity: RelayIdentity,
}

impl RelaySettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let upstream = &cfg.upstream;
        Self {
            default_agent_id: upstream.default_agent_id.clone(),
            reply_timeout: upstream.reply_timeout(),
            fallback_to_mock: cfg.chat.fallback_to_mock,
            identity: RelayIdentity::new(
                upstream.entity_id.clone(),
                &upstream.sender_name,
                &upstream.server_id,
            ),
        }
    }
}

/// 聊天中继：Correlator + 其依赖的 Session Manager 与目录
pub struct ChatRelay {
    sessions: Arc<UpstreamSessionManager>,
    directory: Arc<dyn AgentDirectory>,
    settings: RelaySettings,
    room_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChatRelay {
    pub fn new(
        sessions: Arc<UpstreamSessionManager>,
        directory: Arc<dyn AgentDirectory>,
        settings: RelaySettings,
    ) -> Self {
        Self {
            sessions,
            directory,
            settings,
            room_locks: Mutex::new(HashMap::new()),
        }
    }

    /// 按配置装配真实的 Socket.IO 连接器与 HTTP 目录
    pub fn from_config(cfg: &AppConfig) -> anyhow::Result<Self> {
        let upstream = &cfg.upstream;
        let settings = RelaySettings::from_config(cfg);

        let connector = Arc::new(SocketIoConnector::new(
            &upstream.base_url,
            upstream.transports.clone(),
        ));
        let sessions = UpstreamSessionManager::new(
            connector,
            RetryPolicy::from_config(upstream),
            Arc::new(PendingReplies::new()),
        )
        .with_ack_timeout(upstream.ack_timeout())
        .with_ignored_sender(&settings.identity.entity_id);

        let http = HttpAgentDirectory::new(&upstream.base_url, upstream.directory_timeout())
            .map_err(|e| anyhow::anyhow!("failed to build directory client: {}", e))?;
        let directory: Arc<dyn AgentDirectory> = match upstream.directory_cache_ttl() {
            Some(ttl) => Arc::new(CachedDirectory::new(http, ttl)),
            None => Arc::new(http),
        };

        tracing::info!(
            "Chat relay -> {} (default agent {}, entity {})",
            upstream.base_url,
            settings.default_agent_id,
            settings.identity.entity_id
        );
        Ok(Self::new(Arc::new(sessions), directory, settings))
    }

    pub fn sessions(&self) -> &Arc<UpstreamSessionManager> {
        &self.sessions
    }

    pub fn settings(&self) -> &RelaySettings {
        &self.settings
    }

    /// 发送一条聊天消息并等待关联回复
    pub async fn send_chat(
        &self,
        message: &str,
        agent_hint: Option<&str>,
    ) -> Result<ChatReply, RelayError> {
        if message.trim().is_empty() {
            return Err(RelayError::InvalidInput);
        }
        log_state(ExchangeState::Created, None);

        let agent_id = self.resolve_agent(agent_hint).await;
        log_state(ExchangeState::AgentResolved, Some(&agent_id));

        match self.exchange(message, &agent_id).await {
            Ok(text) => {
                log_state(ExchangeState::Resolved, Some(&agent_id));
                Ok(ChatReply {
                    text,
                    agent_id,
                    source: ReplySource::SocketIo,
                })
            }
            Err(e) => {
                log_state(ExchangeState::Failed, Some(&agent_id));
                if self.settings.fallback_to_mock && e.is_recoverable_by_mock() {
                    tracing::warn!("Chat with {} failed ({}), answering with mock reply", agent_id, e);
                    return Ok(mock_reply(message, &agent_id));
                }
                Err(e)
            }
        }
    }

    /// 解析目标 agent id：目录按 id / 名称匹配；未命中或查询失败时，
    /// 提示本身是 UUID 则直接使用，否则用默认 agent
    async fn resolve_agent(&self, agent_hint: Option<&str>) -> String {
        let hint = agent_hint.map(str::trim).filter(|h| !h.is_empty());
        let wanted = hint.unwrap_or(&self.settings.default_agent_id);

        match self.directory.list_agents().await {
            Ok(entries) => {
                if let Some(entry) = find_agent(&entries, wanted) {
                    return entry.id.clone();
                }
                tracing::debug!("Agent {} not listed by upstream directory", wanted);
            }
            Err(e) => tracing::warn!("{}; using fallback agent id", e),
        }

        match hint {
            Some(h) if uuid::Uuid::parse_str(h).is_ok() => h.to_string(),
            _ => self.settings.default_agent_id.clone(),
        }
    }

    /// 同房间的交换按到达顺序串行
    fn room_lease(&self, room_id: &str) -> RoomLease<'_> {
        let mut locks = self.room_locks.lock().unwrap_or_else(|e| e.into_inner());
        RoomLease {
            relay: self,
            room_id: room_id.to_string(),
            lock: Arc::clone(locks.entry(room_id.to_string()).or_default()),
        }
    }

    fn release_room_lock(&self, room_id: &str) {
        let mut locks = self.room_locks.lock().unwrap_or_else(|e| e.into_inner());
        // 表中一份 + 当前调用方一份：没有其他等待者
        if locks.get(room_id).is_some_and(|l| Arc::strong_count(l) <= 2) {
            locks.remove(room_id);
        }
    }

    /// 排队等锁与等待回复共用一个截止时间
    async fn exchange(&self, message: &str, room_id: &str) -> Result<String, RelayError> {
        let budget = self.settings.reply_timeout;
        let deadline = Instant::now() + budget;

        let lease = self.room_lease(room_id);
        let _turn = tokio::time::timeout_at(deadline, lease.lock.lock())
            .await
            .map_err(|_| RelayError::Timeout(budget))?;
        self.exchange_locked(message, room_id, deadline).await
    }

    async fn exchange_locked(
        &self,
        message: &str,
        room_id: &str,
        deadline: Instant,
    ) -> Result<String, RelayError> {
        let session = self.sessions.ensure_connected().await?;
        let identity = &self.settings.identity;
        let envelope = ChatEnvelope::new(room_id, message, identity);

        // 先注册再 join：join 与发送之间到达的回复也能匹配
        let waiter = self
            .sessions
            .pending()
            .register(room_id, &envelope.message_id, session.id())?;

        self.sessions.join_room(&session, room_id, identity)?;
        log_state(ExchangeState::RoomJoined, Some(room_id));

        let message_id = envelope.message_id.clone();
        if let Some(ack) = self.sessions.emit_message(&session, envelope).await? {
            tracing::debug!(message_id = %message_id, "Upstream ack: {}", ack);
        }
        log_state(ExchangeState::MessageSent, Some(room_id));

        let reply = waiter
            .wait_until(deadline, self.settings.reply_timeout)
            .await?;
        Ok(reply.text)
    }
}

/// 房间锁表项的持有凭证；drop 时（含调用方放弃）清理无人等待的表项
struct RoomLease<'a> {
    relay: &'a ChatRelay,
    room_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for RoomLease<'_> {
    fn drop(&mut self) {
        self.relay.release_room_lock(&self.room_id);
    }
}

fn log_state(state: ExchangeState, room_id: Option<&str>) {
    tracing::debug!(room_id = room_id.unwrap_or("-"), "Exchange {:?}", state);
}
