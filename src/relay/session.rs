//! Upstream Session Manager
//!
//! 进程内最多一个存活的上游 Session：
//! - `ensure_connected` 已连接时直接返回，否则串行化建连（同一时刻只有一次握手在进行，
//!   等待同一次握手的并发调用方得到相同结果）
//! - 建连按重试策略退避重试，耗尽后返回 `UpstreamUnavailable`，下一次调用从头再来
//! - 每个 Session 有一个 pump 任务把入站事件分发到 Waiter 表；断线时只失败在该 Session 上发出的请求
//! - 关闭时主动断开并快速失败在途请求

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use tokio_util::sync::CancellationToken;

use super::message::{ChatEnvelope, InboundEvent, OutboundEvent, RelayIdentity, RoomJoin};
use super::pending::PendingReplies;
use super::socketio::{OutboundCommand, UpstreamConnector, UpstreamLink};
use crate::config::UpstreamSection;
use crate::core::{RelayError, ShutdownCleanup};

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 单次 ensure_connected 内最多尝试次数（至少 1）
    pub attempts: u32,
    /// 首次退避
    pub delay: Duration,
    /// 退避上限（每次翻倍）
    pub delay_max: Duration,
    /// 单次尝试超时
    pub connect_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&UpstreamSection::default())
    }
}

impl RetryPolicy {
    pub fn from_config(cfg: &UpstreamSection) -> Self {
        Self {
            attempts: cfg.reconnection_attempts.max(1),
            delay: cfg.reconnection_delay(),
            delay_max: cfg.reconnection_delay_max(),
            connect_timeout: cfg.connect_timeout(),
        }
    }

    /// 第 attempt 次失败后的退避时间（attempt 从 1 开始）
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.delay.saturating_mul(factor).min(self.delay_max)
    }
}

/// 一条存活的上游连接
#[derive(Debug)]
pub struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<OutboundCommand>,
    alive: AtomicBool,
    connected_at: Instant,
}

impl Session {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst) && !self.outbound.is_closed()
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn send(&self, command: OutboundCommand) -> Result<(), RelayError> {
        if !self.is_alive() {
            return Err(RelayError::UpstreamUnavailable("connection closed".to_string()));
        }
        self.outbound
            .send(command)
            .map_err(|_| RelayError::UpstreamUnavailable("connection closed".to_string()))
    }
}

/// 最近一次建连结果（epoch 用于让并发等待者共享同一次结果）
struct ConnectOutcome {
    epoch: u64,
    failure: Option<RelayError>,
}

/// Upstream Session Manager
pub struct UpstreamSessionManager {
    connector: Arc<dyn UpstreamConnector>,
    policy: RetryPolicy,
    pending: Arc<PendingReplies>,
    current: RwLock<Option<Arc<Session>>>,
    /// 当前 Session 的 id，0 表示没有；旧 Session 的 pump 据此判断是否还能改写连接状态
    live_id: Arc<AtomicU64>,
    connect_lock: tokio::sync::Mutex<()>,
    outcome: Mutex<ConnectOutcome>,
    epoch: AtomicU64,
    next_session_id: AtomicU64,
    handshakes: AtomicU64,
    state: watch::Sender<ConnectionState>,
    ack_timeout: Option<Duration>,
    ignore_sender: Option<String>,
    shutdown: CancellationToken,
}

impl UpstreamSessionManager {
    pub fn new(
        connector: Arc<dyn UpstreamConnector>,
        policy: RetryPolicy,
        pending: Arc<PendingReplies>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            policy,
            pending,
            current: RwLock::new(None),
            live_id: Arc::new(AtomicU64::new(0)),
            connect_lock: tokio::sync::Mutex::new(()),
            outcome: Mutex::new(ConnectOutcome {
                epoch: 0,
                failure: None,
            }),
            epoch: AtomicU64::new(0),
            next_session_id: AtomicU64::new(1),
            handshakes: AtomicU64::new(0),
            state,
            ack_timeout: None,
            ignore_sender: None,
            shutdown: CancellationToken::new(),
        }
    }

    /// 请求 Socket.IO ack 并最多等待该时长
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// 忽略该发送方的广播（中继自己的消息回显）
    pub fn with_ignored_sender(mut self, entity_id: &str) -> Self {
        self.ignore_sender = Some(entity_id.to_string());
        self
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// 累计握手次数（每次连接尝试 +1）
    pub fn handshake_count(&self) -> u64 {
        self.handshakes.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> &Arc<PendingReplies> {
        &self.pending
    }

    async fn live_session(&self) -> Option<Arc<Session>> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|s| s.is_alive())
            .cloned()
    }

    fn lock_outcome(&self) -> std::sync::MutexGuard<'_, ConnectOutcome> {
        self.outcome.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 返回存活的 Session，必要时建立新连接
    pub async fn ensure_connected(&self) -> Result<Arc<Session>, RelayError> {
        if let Some(session) = self.live_session().await {
            return Ok(session);
        }
        if self.shutdown.is_cancelled() {
            return Err(RelayError::UpstreamUnavailable("shutting down".to_string()));
        }

        let seen_epoch = self.epoch.load(Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;

        if let Some(session) = self.live_session().await {
            return Ok(session);
        }
        {
            // 等锁期间有一次建连已经结束并失败：共享其结果
            let outcome = self.lock_outcome();
            if outcome.epoch > seen_epoch {
                if let Some(err) = &outcome.failure {
                    return Err(err.clone());
                }
            }
        }
        if self.shutdown.is_cancelled() {
            return Err(RelayError::UpstreamUnavailable("shutting down".to_string()));
        }

        self.state.send_replace(ConnectionState::Connecting);
        let result = self.connect_with_retry().await;

        let result = match result {
            Ok(link) => Ok(self.install(link).await),
            Err(e) => {
                self.state.send_replace(ConnectionState::Disconnected);
                Err(e)
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lock_outcome() = ConnectOutcome {
            epoch,
            failure: result.as_ref().err().cloned(),
        };
        result
    }

    async fn connect_with_retry(&self) -> Result<UpstreamLink, RelayError> {
        let attempts = self.policy.attempts.max(1);
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=attempts {
            if self.shutdown.is_cancelled() {
                last_error = "shutting down".to_string();
                break;
            }
            self.handshakes.fetch_add(1, Ordering::SeqCst);

            match tokio::time::timeout(self.policy.connect_timeout, self.connector.connect()).await {
                Ok(Ok(link)) => return Ok(link),
                Ok(Err(e)) => {
                    last_error = match e {
                        RelayError::UpstreamUnavailable(reason) => reason,
                        other => other.to_string(),
                    };
                }
                Err(_) => {
                    last_error = format!("connect timed out after {:?}", self.policy.connect_timeout);
                }
            }
            tracing::warn!(
                attempt,
                attempts,
                "Upstream connect attempt failed: {}",
                last_error
            );

            if attempt < attempts {
                let delay = self.policy.backoff(attempt);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.shutdown.cancelled() => {
                        last_error = "shutting down".to_string();
                        break;
                    }
                }
            }
        }

        Err(RelayError::UpstreamUnavailable(format!(
            "gave up after {attempts} attempt(s): {last_error}"
        )))
    }

    /// 安装新 Session 并启动 pump 任务
    async fn install(&self, link: UpstreamLink) -> Arc<Session> {
        let UpstreamLink { outbound, inbound } = link;
        let session = Arc::new(Session {
            id: self.next_session_id.fetch_add(1, Ordering::SeqCst),
            outbound,
            alive: AtomicBool::new(true),
            connected_at: Instant::now(),
        });

        if let Some(stale) = self.current.write().await.replace(Arc::clone(&session)) {
            stale.mark_dead();
        }
        self.live_id.store(session.id, Ordering::SeqCst);
        self.state.send_replace(ConnectionState::Connected);
        tracing::info!(session_id = session.id, "Upstream session established");

        tokio::spawn(pump(
            Arc::clone(&session),
            inbound,
            Arc::clone(&self.pending),
            self.state.clone(),
            Arc::clone(&self.live_id),
            self.ignore_sender.clone(),
        ));
        session
    }

    /// 发出加入房间信号（不等待确认）
    pub fn join_room(
        &self,
        session: &Session,
        room_id: &str,
        identity: &RelayIdentity,
    ) -> Result<(), RelayError> {
        session.send(OutboundCommand::Emit {
            event: OutboundEvent::JoinRoom(RoomJoin::new(room_id, identity)),
            ack: None,
        })
    }

    /// 发送聊天信封；配置了 ack 超时则等待传输层确认（超时返回 None）
    pub async fn emit_message(
        &self,
        session: &Session,
        envelope: ChatEnvelope,
    ) -> Result<Option<Value>, RelayError> {
        let event = OutboundEvent::SendMessage(envelope);
        let Some(timeout) = self.ack_timeout else {
            session.send(OutboundCommand::Emit { event, ack: None })?;
            return Ok(None);
        };

        let (tx, rx) = oneshot::channel();
        session.send(OutboundCommand::Emit {
            event,
            ack: Some(tx),
        })?;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(mut args)) => Ok(Some(match args.len() {
                0 => Value::Null,
                1 => args.remove(0),
                _ => Value::Array(args),
            })),
            Ok(Err(_)) => Err(RelayError::UpstreamUnavailable(
                "connection closed before ack".to_string(),
            )),
            Err(_) => {
                tracing::debug!("No ack within {:?}", timeout);
                Ok(None)
            }
        }
    }

    /// 主动断开当前 Session，失败在途请求；之后的 ensure_connected 一律失败
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let _guard = self.connect_lock.lock().await;

        self.live_id.store(0, Ordering::SeqCst);
        if let Some(session) = self.current.write().await.take() {
            let _ = session.outbound.send(OutboundCommand::Disconnect);
            session.mark_dead();
            tracing::info!(session_id = session.id, "Upstream session closed");
        }
        let failed = self
            .pending
            .fail_all(RelayError::UpstreamUnavailable("shutting down".to_string()));
        if failed > 0 {
            tracing::warn!("Failed {} in-flight chat request(s) on shutdown", failed);
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

/// 入站事件分发：广播 → Waiter 表；error → 按房间失败；
/// 断线 → 失败本 Session 的在途请求，若仍是当前 Session 则把状态置为断开
async fn pump(
    session: Arc<Session>,
    mut inbound: mpsc::UnboundedReceiver<InboundEvent>,
    pending: Arc<PendingReplies>,
    state: watch::Sender<ConnectionState>,
    live_id: Arc<AtomicU64>,
    ignore_sender: Option<String>,
) {
    let reason = loop {
        match inbound.recv().await {
            Some(InboundEvent::Broadcast(broadcast)) => {
                if ignore_sender.is_some() && broadcast.sender_id == ignore_sender {
                    tracing::trace!("Ignoring echo of own message");
                    continue;
                }
                if !pending.dispatch(&broadcast) {
                    tracing::debug!(
                        room_id = ?broadcast.room_id,
                        channel_id = ?broadcast.channel_id,
                        "Broadcast matched no open exchange"
                    );
                }
            }
            Some(InboundEvent::Error(fault)) => {
                let failed = pending.fail_scoped(&fault);
                tracing::warn!("Upstream error event ({} exchange(s) failed): {}", failed, fault.message);
            }
            Some(InboundEvent::Disconnected(reason)) => break reason,
            None => break "link closed".to_string(),
        }
    };

    if session.alive.swap(false, Ordering::SeqCst) {
        tracing::warn!(session_id = session.id, "Upstream session lost: {}", reason);
    } else {
        tracing::debug!(session_id = session.id, "Retired upstream session closed: {}", reason);
    }
    let failed = pending.fail_session(
        session.id,
        RelayError::UpstreamUnavailable(format!("connection lost: {reason}")),
    );
    if failed > 0 {
        tracing::warn!("Failed {} in-flight chat request(s)", failed);
    }
    if live_id
        .compare_exchange(session.id, 0, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok()
    {
        state.send_replace(ConnectionState::Disconnected);
    }
}

#[async_trait::async_trait]
impl ShutdownCleanup for UpstreamSessionManager {
    async fn cleanup(&self) -> anyhow::Result<()> {
        self.shutdown().await;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "UpstreamSession"
    }
}
