//! 等待中的聊天请求（Waiter）表
//!
//! correlation key（房间 id）→ 一次性完成槽（oneshot）。
//! - 发送前 `register`，得到 [`Waiter`]；Waiter 被 drop 时（成功、失败、超时、调用方放弃）自动注销
//! - 读任务收到广播后 `dispatch`，只会解析 key 完全匹配的 Waiter，解析后立即移除
//! - 某条连接断开时 `fail_session` 只失败在该连接上发出的请求；关闭时 `fail_all`；
//!   上游 error 事件按房间 `fail_scoped`
//!
//! 用 `std::sync::Mutex`：临界区只有 HashMap 插入/删除，且 Drop 中需要同步注销。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;

use super::message::{MessageBroadcast, UpstreamFault};
use crate::core::RelayError;

/// 解析后的回复
#[derive(Debug, Clone, PartialEq)]
pub struct InboundReply {
    pub text: String,
    pub room_id: Option<String>,
    pub channel_id: Option<String>,
    pub sender_name: Option<String>,
    pub metadata: Option<Value>,
}

type Completion = Result<InboundReply, RelayError>;

/// 一个在途请求
struct PendingRequest {
    ticket: u64,
    /// 发出该请求的 Session
    session_id: u64,
    message_id: String,
    created_at: Instant,
    slot: oneshot::Sender<Completion>,
}

/// Waiter 表
#[derive(Default)]
pub struct PendingReplies {
    waiters: Mutex<HashMap<String, PendingRequest>>,
    next_ticket: AtomicU64,
}

impl PendingReplies {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 注册 Waiter；同一 key 已有在途请求时拒绝（调用方应按房间串行化）
    pub fn register(
        self: &Arc<Self>,
        key: &str,
        message_id: &str,
        session_id: u64,
    ) -> Result<Waiter, RelayError> {
        let mut waiters = self.lock();
        if waiters.contains_key(key) {
            return Err(RelayError::UpstreamError(format!(
                "an exchange is already open for room {key}"
            )));
        }

        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (slot, rx) = oneshot::channel();
        waiters.insert(
            key.to_string(),
            PendingRequest {
                ticket,
                session_id,
                message_id: message_id.to_string(),
                created_at: Instant::now(),
                slot,
            },
        );

        Ok(Waiter {
            table: Arc::clone(self),
            key: key.to_string(),
            ticket,
            rx: Some(rx),
        })
    }

    /// 用广播解析匹配的 Waiter：roomId 或 channelId 等于 key；若广播声明了 inReplyTo，还必须等于该 Waiter 的 message id。
    /// 没有可提取正文的广播不解析任何 Waiter。返回是否解析成功。
    pub fn dispatch(&self, broadcast: &MessageBroadcast) -> bool {
        let Some(text) = broadcast.reply_text() else {
            tracing::debug!(
                room_id = ?broadcast.room_id,
                "Broadcast without text content ignored"
            );
            return false;
        };

        let mut waiters = self.lock();
        let key = broadcast.correlation_keys().into_iter().find(|key| {
            waiters.get(*key).is_some_and(|pending| {
                broadcast
                    .reply_to()
                    .map_or(true, |reply_to| reply_to == pending.message_id)
            })
        });
        let Some(key) = key else {
            return false;
        };
        let Some(pending) = waiters.remove(key) else {
            return false;
        };
        drop(waiters);

        tracing::debug!(
            room_id = key,
            message_id = %pending.message_id,
            elapsed_ms = pending.created_at.elapsed().as_millis() as u64,
            "Reply correlated"
        );
        let reply = InboundReply {
            text,
            room_id: broadcast.room_id.clone(),
            channel_id: broadcast.channel_id.clone(),
            sender_name: broadcast.sender_name.clone(),
            metadata: broadcast.metadata.clone(),
        };
        pending.slot.send(Ok(reply)).is_ok()
    }

    /// 以同一错误失败所有在途请求，返回失败数量
    pub fn fail_all(&self, err: RelayError) -> usize {
        let drained: Vec<PendingRequest> = self.lock().drain().map(|(_, p)| p).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(err.clone()));
        }
        count
    }

    /// 只失败在该 Session 上发出的请求，返回失败数量
    pub fn fail_session(&self, session_id: u64, err: RelayError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut waiters = self.lock();
            let keys: Vec<String> = waiters
                .iter()
                .filter(|(_, p)| p.session_id == session_id)
                .map(|(k, _)| k.clone())
                .collect();
            keys.iter().filter_map(|k| waiters.remove(k)).collect()
        };
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(err.clone()));
        }
        count
    }

    /// 上游 error 事件：指明房间时只失败该房间，否则失败全部
    pub fn fail_scoped(&self, fault: &UpstreamFault) -> usize {
        let err = RelayError::UpstreamError(fault.message.clone());
        match fault.scope() {
            Some(key) => {
                let removed = self.lock().remove(key);
                match removed {
                    Some(pending) => {
                        let _ = pending.slot.send(Err(err));
                        1
                    }
                    None => 0,
                }
            }
            None => self.fail_all(err),
        }
    }

    /// 在途请求数
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// 只移除属于该 ticket 的条目（同 key 的新请求不受影响）
    fn deregister(&self, key: &str, ticket: u64) {
        let mut waiters = self.lock();
        if waiters.get(key).is_some_and(|p| p.ticket == ticket) {
            waiters.remove(key);
        }
    }
}

/// 已注册的等待句柄
pub struct Waiter {
    table: Arc<PendingReplies>,
    key: String,
    ticket: u64,
    rx: Option<oneshot::Receiver<Completion>>,
}

impl Waiter {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// 有界等待回复；超时返回 `Timeout`，完成槽被丢弃返回 `UpstreamUnavailable`
    pub async fn wait(self, timeout: Duration) -> Result<InboundReply, RelayError> {
        self.wait_until(tokio::time::Instant::now() + timeout, timeout)
            .await
    }

    /// 等到绝对截止时间；超时错误携带整个交换的预算 `budget`
    pub async fn wait_until(
        mut self,
        deadline: tokio::time::Instant,
        budget: Duration,
    ) -> Result<InboundReply, RelayError> {
        let Some(rx) = self.rx.take() else {
            return Err(RelayError::UpstreamUnavailable("waiter already consumed".into()));
        };
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RelayError::UpstreamUnavailable(
                "connection closed before reply".into(),
            )),
            Err(_) => Err(RelayError::Timeout(budget)),
        }
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        self.table.deregister(&self.key, self.ticket);
    }
}
