//! Eliza 消息协议定义
//!
//! 上游通过 Socket.IO 的 `message` 事件接收指令（type 1 = 加入房间，type 2 = 发送消息），
//! 通过 `messageBroadcast` 事件广播 Agent 回复，通过 `error` 事件报告错误。

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// 出站事件名
pub const OUTBOUND_EVENT: &str = "message";
/// 入站广播事件名
pub const BROADCAST_EVENT: &str = "messageBroadcast";
/// 入站错误事件名
pub const ERROR_EVENT: &str = "error";

/// 出站 `message` 事件的类型码
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketMessageType {
    RoomJoining = 1,
    SendMessage = 2,
}

/// 中继在上游的身份
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayIdentity {
    pub entity_id: String,
    pub sender_name: String,
    pub server_id: String,
}

impl RelayIdentity {
    pub fn new(entity_id: Option<String>, sender_name: &str, server_id: &str) -> Self {
        Self {
            entity_id: entity_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            sender_name: sender_name.to_string(),
            server_id: server_id.to_string(),
        }
    }
}

/// 加入房间
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomJoin {
    pub room_id: String,
    pub channel_id: String,
    pub entity_id: String,
    pub server_id: String,
}

impl RoomJoin {
    pub fn new(room_id: &str, identity: &RelayIdentity) -> Self {
        Self {
            room_id: room_id.to_string(),
            channel_id: room_id.to_string(),
            entity_id: identity.entity_id.clone(),
            server_id: identity.server_id.clone(),
        }
    }
}

/// 出站聊天信封
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatEnvelope {
    pub channel_id: String,
    pub room_id: String,
    pub message_id: String,
    pub message: String,
    pub sender_id: String,
    pub sender_name: String,
    pub server_id: String,
    pub source: String,
    /// 毫秒时间戳
    pub timestamp: i64,
}

impl ChatEnvelope {
    pub fn new(room_id: &str, text: &str, identity: &RelayIdentity) -> Self {
        Self {
            channel_id: room_id.to_string(),
            room_id: room_id.to_string(),
            message_id: uuid::Uuid::new_v4().to_string(),
            message: text.to_string(),
            sender_id: identity.entity_id.clone(),
            sender_name: identity.sender_name.clone(),
            server_id: identity.server_id.clone(),
            source: "obsidian_api".to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }
}

/// 出站事件
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundEvent {
    JoinRoom(RoomJoin),
    SendMessage(ChatEnvelope),
}

impl OutboundEvent {
    pub fn message_type(&self) -> SocketMessageType {
        match self {
            OutboundEvent::JoinRoom(_) => SocketMessageType::RoomJoining,
            OutboundEvent::SendMessage(_) => SocketMessageType::SendMessage,
        }
    }

    /// Socket.IO 事件参数：`[{"type": n, "payload": {...}}]`
    pub fn to_args(&self) -> Vec<Value> {
        let payload = match self {
            OutboundEvent::JoinRoom(join) => serde_json::to_value(join),
            OutboundEvent::SendMessage(envelope) => serde_json::to_value(envelope),
        }
        .unwrap_or(Value::Null);
        vec![json!({
            "type": self.message_type() as u8,
            "payload": payload,
        })]
    }
}

/// 入站 `messageBroadcast` 事件
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageBroadcast {
    pub room_id: Option<String>,
    pub channel_id: Option<String>,
    pub text: Option<String>,
    pub content: Option<Value>,
    pub sender_id: Option<String>,
    pub sender_name: Option<String>,
    pub in_reply_to: Option<String>,
    pub metadata: Option<Value>,
}

impl MessageBroadcast {
    /// 回复正文：text → content（字符串）→ content.text，取第一个非空值
    pub fn reply_text(&self) -> Option<String> {
        let from_text = self.text.as_deref();
        let from_content = self.content.as_ref().and_then(Value::as_str);
        let from_wrapper = self
            .content
            .as_ref()
            .and_then(|c| c.get("text"))
            .and_then(Value::as_str);

        [from_text, from_content, from_wrapper]
            .into_iter()
            .flatten()
            .find(|s| !s.trim().is_empty())
            .map(str::to_string)
    }

    /// 广播声明回复的出站消息 id（顶层 inReplyTo 或 metadata.inReplyTo）
    pub fn reply_to(&self) -> Option<&str> {
        self.in_reply_to.as_deref().or_else(|| {
            self.metadata
                .as_ref()
                .and_then(|m| m.get("inReplyTo"))
                .and_then(Value::as_str)
        })
    }

    /// 可作为关联键的 id：roomId 与 channelId（去重）
    pub fn correlation_keys(&self) -> Vec<&str> {
        let mut keys = Vec::with_capacity(2);
        for key in [self.room_id.as_deref(), self.channel_id.as_deref()]
            .into_iter()
            .flatten()
        {
            if !key.is_empty() && !keys.contains(&key) {
                keys.push(key);
            }
        }
        keys
    }
}

/// 入站 `error` 事件：字符串或 `{message, roomId?, channelId?}`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFault {
    pub message: String,
    pub room_id: Option<String>,
    pub channel_id: Option<String>,
}

impl UpstreamFault {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::String(message) => Self {
                message: message.clone(),
                room_id: None,
                channel_id: None,
            },
            Value::Object(obj) => {
                let field = |name: &str| obj.get(name).and_then(Value::as_str).map(str::to_string);
                Self {
                    message: field("message")
                        .or_else(|| field("error"))
                        .unwrap_or_else(|| value.to_string()),
                    room_id: field("roomId"),
                    channel_id: field("channelId"),
                }
            }
            other => Self {
                message: other.to_string(),
                room_id: None,
                channel_id: None,
            },
        }
    }

    /// 错误指明的房间（roomId 优先）
    pub fn scope(&self) -> Option<&str> {
        self.room_id.as_deref().or(self.channel_id.as_deref())
    }
}

/// 从上游连接收到的事件
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Broadcast(MessageBroadcast),
    Error(UpstreamFault),
    /// 连接断开（原因）
    Disconnected(String),
}

impl InboundEvent {
    /// 将 Socket.IO 事件转换为入站事件；不关心的事件返回 None
    pub fn from_socket_event(name: &str, args: &[Value]) -> Option<Self> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        match name {
            BROADCAST_EVENT => match serde_json::from_value::<MessageBroadcast>(first) {
                Ok(broadcast) => Some(InboundEvent::Broadcast(broadcast)),
                Err(e) => {
                    tracing::warn!("Ignoring malformed messageBroadcast: {}", e);
                    None
                }
            },
            ERROR_EVENT => Some(InboundEvent::Error(UpstreamFault::from_value(&first))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> RelayIdentity {
        RelayIdentity::new(Some("user-1".into()), "Tester", "srv-0")
    }

    #[test]
    fn test_send_message_args_shape() {
        let envelope = ChatEnvelope::new("agent-42", "hello", &identity());
        let args = OutboundEvent::SendMessage(envelope.clone()).to_args();
        assert_eq!(args.len(), 1);
        assert_eq!(args[0]["type"], 2);
        let payload = &args[0]["payload"];
        assert_eq!(payload["channelId"], "agent-42");
        assert_eq!(payload["roomId"], "agent-42");
        assert_eq!(payload["message"], "hello");
        assert_eq!(payload["senderId"], "user-1");
        assert_eq!(payload["serverId"], "srv-0");
        assert_eq!(payload["messageId"], envelope.message_id.as_str());
        assert!(payload["timestamp"].as_i64().unwrap() > 0);
    }

    #[test]
    fn test_join_args_shape() {
        let args = OutboundEvent::JoinRoom(RoomJoin::new("agent-42", &identity())).to_args();
        assert_eq!(args[0]["type"], 1);
        assert_eq!(args[0]["payload"]["entityId"], "user-1");
        assert_eq!(args[0]["payload"]["roomId"], "agent-42");
    }

    #[test]
    fn test_envelope_ids_are_unique() {
        let a = ChatEnvelope::new("r", "x", &identity());
        let b = ChatEnvelope::new("r", "x", &identity());
        assert_ne!(a.message_id, b.message_id);
    }

    #[test]
    fn test_reply_text_precedence() {
        let b: MessageBroadcast = serde_json::from_value(json!({
            "text": "from text",
            "content": "from content"
        }))
        .unwrap();
        assert_eq!(b.reply_text().as_deref(), Some("from text"));

        let b: MessageBroadcast = serde_json::from_value(json!({
            "text": "  ",
            "content": "from content"
        }))
        .unwrap();
        assert_eq!(b.reply_text().as_deref(), Some("from content"));

        let b: MessageBroadcast = serde_json::from_value(json!({
            "content": {"text": "wrapped", "actions": ["REPLY"]}
        }))
        .unwrap();
        assert_eq!(b.reply_text().as_deref(), Some("wrapped"));

        let b: MessageBroadcast = serde_json::from_value(json!({"roomId": "r"})).unwrap();
        assert_eq!(b.reply_text(), None);
    }

    #[test]
    fn test_correlation_keys_dedup() {
        let b: MessageBroadcast =
            serde_json::from_value(json!({"roomId": "r1", "channelId": "r1"})).unwrap();
        assert_eq!(b.correlation_keys(), vec!["r1"]);

        let b: MessageBroadcast =
            serde_json::from_value(json!({"roomId": "r1", "channelId": "c1"})).unwrap();
        assert_eq!(b.correlation_keys(), vec!["r1", "c1"]);
    }

    #[test]
    fn test_reply_to_from_metadata() {
        let b: MessageBroadcast =
            serde_json::from_value(json!({"metadata": {"inReplyTo": "m-1"}})).unwrap();
        assert_eq!(b.reply_to(), Some("m-1"));
    }

    #[test]
    fn test_fault_parsing() {
        let fault = UpstreamFault::from_value(&json!("boom"));
        assert_eq!(fault.message, "boom");
        assert_eq!(fault.scope(), None);

        let fault = UpstreamFault::from_value(&json!({"message": "agent crashed", "channelId": "c9"}));
        assert_eq!(fault.message, "agent crashed");
        assert_eq!(fault.scope(), Some("c9"));
    }

    #[test]
    fn test_inbound_from_socket_event() {
        let event = InboundEvent::from_socket_event(
            BROADCAST_EVENT,
            &[json!({"roomId": "agent-42", "text": "Treasury is healthy", "senderName": "Obsidian"})],
        );
        match event {
            Some(InboundEvent::Broadcast(b)) => {
                assert_eq!(b.room_id.as_deref(), Some("agent-42"));
                assert_eq!(b.sender_name.as_deref(), Some("Obsidian"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(InboundEvent::from_socket_event("messageComplete", &[]).is_none());
        assert!(matches!(
            InboundEvent::from_socket_event(ERROR_EVENT, &[json!({"error": "bad"})]),
            Some(InboundEvent::Error(UpstreamFault { .. }))
        ));
    }
}
