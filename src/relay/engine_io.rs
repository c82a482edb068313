//! Engine.IO v4 / Socket.IO v5 文本协议编解码
//!
//! 只覆盖中继需要的子集：
//! - Engine 层：open(0) / close(1) / ping(2) / pong(3) / message(4) / upgrade(5) / noop(6)
//! - Socket 层（默认命名空间）：connect(0) / disconnect(1) / event(2) / ack(3) / connect_error(4)
//!
//! 二进制附件（Socket 类型 5、6）不支持，解码时报错由上层丢弃。

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// 长轮询 payload 中多个包之间的分隔符
pub const RECORD_SEPARATOR: char = '\u{1e}';

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type '{0}'")]
    UnknownType(char),
    #[error("invalid packet payload: {0}")]
    InvalidPayload(String),
    #[error("unsupported packet: {0}")]
    Unsupported(&'static str),
}

/// Engine.IO open 包携带的握手参数
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenInfo {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    #[serde(default = "default_ping_interval")]
    pub ping_interval: u64,
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

fn default_ping_interval() -> u64 {
    25_000
}

fn default_ping_timeout() -> u64 {
    20_000
}

impl OpenInfo {
    /// 服务端心跳最长静默时间（pingInterval + pingTimeout），超过即视为断线
    pub fn heartbeat_deadline(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

/// Engine.IO 包
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnginePacket {
    Open(OpenInfo),
    Close,
    Ping(String),
    Pong(String),
    Message(String),
    Upgrade,
    Noop,
}

impl EnginePacket {
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let rest = chars.as_str();
        match kind {
            '0' => serde_json::from_str(rest)
                .map(EnginePacket::Open)
                .map_err(|e| PacketError::InvalidPayload(e.to_string())),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(rest.to_string())),
            '3' => Ok(EnginePacket::Pong(rest.to_string())),
            '4' => Ok(EnginePacket::Message(rest.to_string())),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            'b' => Err(PacketError::Unsupported("base64 binary message")),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    /// 编码为文本帧；open 包只由服务端发送，客户端不会编码
    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(data) => format!("2{data}"),
            EnginePacket::Pong(data) => format!("3{data}"),
            EnginePacket::Message(data) => format!("4{data}"),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

/// 拆分长轮询 payload（以 0x1e 分隔）
pub fn decode_payload(body: &str) -> Vec<String> {
    body.split(RECORD_SEPARATOR)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// 合并为长轮询 payload
pub fn encode_payload(packets: &[String]) -> String {
    packets.join(&RECORD_SEPARATOR.to_string())
}

/// Socket.IO 包（承载在 Engine message 内）
#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect(Option<Value>),
    Disconnect,
    Event {
        id: Option<u64>,
        name: String,
        args: Vec<Value>,
    },
    Ack {
        id: u64,
        args: Vec<Value>,
    },
    ConnectError(String),
}

impl SocketPacket {
    pub fn event(name: &str, args: Vec<Value>, id: Option<u64>) -> Self {
        SocketPacket::Event {
            id,
            name: name.to_string(),
            args,
        }
    }

    /// 解码 Socket.IO 包；非默认命名空间的前缀（`/nsp,`）会被剥离
    pub fn decode(text: &str) -> Result<Self, PacketError> {
        let mut chars = text.chars();
        let kind = chars.next().ok_or(PacketError::Empty)?;
        let body = strip_namespace(chars.as_str());

        match kind {
            '0' => {
                let data = if body.trim().is_empty() {
                    None
                } else {
                    Some(parse_json(body)?)
                };
                Ok(SocketPacket::Connect(data))
            }
            '1' => Ok(SocketPacket::Disconnect),
            '2' => {
                let (id, json) = split_ack_id(body);
                let mut args = parse_array(json)?;
                if args.is_empty() {
                    return Err(PacketError::InvalidPayload("event without name".into()));
                }
                let name = match args.remove(0) {
                    Value::String(name) => name,
                    other => {
                        return Err(PacketError::InvalidPayload(format!(
                            "event name must be a string, got {other}"
                        )))
                    }
                };
                Ok(SocketPacket::Event { id, name, args })
            }
            '3' => {
                let (id, json) = split_ack_id(body);
                let id = id.ok_or_else(|| PacketError::InvalidPayload("ack without id".into()))?;
                Ok(SocketPacket::Ack {
                    id,
                    args: parse_array(json)?,
                })
            }
            '4' => {
                let message = match serde_json::from_str::<Value>(body) {
                    Ok(Value::Object(obj)) => obj
                        .get("message")
                        .and_then(Value::as_str)
                        .unwrap_or("connect error")
                        .to_string(),
                    Ok(Value::String(s)) => s,
                    _ => body.to_string(),
                };
                Ok(SocketPacket::ConnectError(message))
            }
            '5' | '6' => Err(PacketError::Unsupported("binary event")),
            other => Err(PacketError::UnknownType(other)),
        }
    }

    /// 编码为 Engine message 的内容（不含外层 `4`）
    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect(None) => "0".to_string(),
            SocketPacket::Connect(Some(data)) => format!("0{data}"),
            SocketPacket::Disconnect => "1".to_string(),
            SocketPacket::Event { id, name, args } => {
                let mut items = Vec::with_capacity(args.len() + 1);
                items.push(Value::String(name.clone()));
                items.extend(args.iter().cloned());
                let id = id.map(|i| i.to_string()).unwrap_or_default();
                format!("2{id}{}", Value::Array(items))
            }
            SocketPacket::Ack { id, args } => format!("3{id}{}", Value::Array(args.clone())),
            SocketPacket::ConnectError(message) => {
                format!("4{}", serde_json::json!({ "message": message }))
            }
        }
    }

    /// 直接编码为完整的 Engine 文本帧
    pub fn to_frame(&self) -> String {
        EnginePacket::Message(self.encode()).encode()
    }
}

fn strip_namespace(body: &str) -> &str {
    if body.starts_with('/') {
        match body.find(',') {
            Some(idx) => &body[idx + 1..],
            None => "",
        }
    } else {
        body
    }
}

fn split_ack_id(body: &str) -> (Option<u64>, &str) {
    let digits = body.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return (None, body);
    }
    (body[..digits].parse().ok(), &body[digits..])
}

fn parse_json(body: &str) -> Result<Value, PacketError> {
    serde_json::from_str(body).map_err(|e| PacketError::InvalidPayload(e.to_string()))
}

fn parse_array(body: &str) -> Result<Vec<Value>, PacketError> {
    match parse_json(body)? {
        Value::Array(items) => Ok(items),
        other => Err(PacketError::InvalidPayload(format!(
            "expected array, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_open() {
        let packet = EnginePacket::decode(
            r#"0{"sid":"abc","upgrades":["websocket"],"pingInterval":25000,"pingTimeout":20000,"maxPayload":1000000}"#,
        )
        .unwrap();
        match packet {
            EnginePacket::Open(info) => {
                assert_eq!(info.sid, "abc");
                assert_eq!(info.upgrades, vec!["websocket".to_string()]);
                assert_eq!(info.heartbeat_deadline().as_millis(), 45_000);
            }
            other => panic!("expected open, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_ping_and_message() {
        assert_eq!(EnginePacket::decode("2").unwrap(), EnginePacket::Ping(String::new()));
        assert_eq!(
            EnginePacket::decode("40").unwrap(),
            EnginePacket::Message("0".to_string())
        );
        assert_eq!(EnginePacket::Pong(String::new()).encode(), "3");
        assert_eq!(EnginePacket::decode(""), Err(PacketError::Empty));
        assert_eq!(EnginePacket::decode("x"), Err(PacketError::UnknownType('x')));
    }

    #[test]
    fn test_event_frame_encoding() {
        let frame = SocketPacket::event("message", vec![json!({"type": 1})], None).to_frame();
        assert_eq!(frame, r#"42["message",{"type":1}]"#);

        let with_ack = SocketPacket::event("message", vec![json!("hi")], Some(7)).to_frame();
        assert_eq!(with_ack, r#"427["message","hi"]"#);
    }

    #[test]
    fn test_decode_event_with_namespace_and_ack() {
        let packet = SocketPacket::decode(r#"2/chat,12["messageBroadcast",{"text":"hi"}]"#).unwrap();
        assert_eq!(
            packet,
            SocketPacket::Event {
                id: Some(12),
                name: "messageBroadcast".to_string(),
                args: vec![json!({"text": "hi"})],
            }
        );
    }

    #[test]
    fn test_decode_ack_and_connect_error() {
        assert_eq!(
            SocketPacket::decode(r#"33[{"ok":true}]"#).unwrap(),
            SocketPacket::Ack {
                id: 3,
                args: vec![json!({"ok": true})]
            }
        );
        assert_eq!(
            SocketPacket::decode(r#"4{"message":"Not authorized"}"#).unwrap(),
            SocketPacket::ConnectError("Not authorized".to_string())
        );
        assert_eq!(
            SocketPacket::decode(r#"0{"sid":"s1"}"#).unwrap(),
            SocketPacket::Connect(Some(json!({"sid": "s1"})))
        );
    }

    #[test]
    fn test_rejects_malformed_events() {
        assert!(SocketPacket::decode("2[]").is_err());
        assert!(SocketPacket::decode("2[42]").is_err());
        assert!(SocketPacket::decode("3[]").is_err());
        assert_eq!(
            SocketPacket::decode(r#"51-["file",{"_placeholder":true,"num":0}]"#),
            Err(PacketError::Unsupported("binary event"))
        );
    }

    #[test]
    fn test_polling_payload_split() {
        let body = format!("0{{\"sid\":\"a\"}}{RECORD_SEPARATOR}40{RECORD_SEPARATOR}2");
        let packets = decode_payload(&body);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[2], "2");
        assert_eq!(encode_payload(&packets), body);
    }
}
