//! Engine.IO 传输层
//!
//! 两种传输都被拆成「发送半边」与「接收半边」，分别交给写任务与读任务持有：
//! - **websocket**：tokio-tungstenite，一帧一个包
//! - **polling**：reqwest HTTP 长轮询，GET 拉取（多包以 0x1e 分隔），POST 推送

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::engine_io::{decode_payload, EnginePacket, OpenInfo};
use crate::config::TransportKind;
use crate::core::RelayError;

/// 长轮询请求在心跳截止时间之外额外预留的时间
const POLL_GRACE: Duration = Duration::from_secs(5);

/// 传输发送半边
#[async_trait]
pub trait PacketSink: Send {
    /// 发送一个完整的 Engine 文本包
    async fn send(&mut self, frame: String) -> Result<(), RelayError>;

    /// 关闭传输（尽力而为）
    async fn close(&mut self);
}

/// 传输接收半边
#[async_trait]
pub trait PacketStream: Send {
    /// 下一个 Engine 文本包；None 表示传输已关闭
    async fn next_packet(&mut self) -> Option<Result<String, RelayError>>;
}

/// 已完成 Engine 握手的传输
pub struct OpenedTransport {
    pub kind: TransportKind,
    pub sink: Box<dyn PacketSink>,
    pub stream: Box<dyn PacketStream>,
    pub open: OpenInfo,
}

fn unavailable(context: &str, err: impl std::fmt::Display) -> RelayError {
    RelayError::UpstreamUnavailable(format!("{context}: {err}"))
}

/// 由上游 base_url 推导 Engine.IO 端点，如 `http://host:3000` → `ws://host:3000/socket.io/?EIO=4&transport=websocket`
pub fn engine_url(base_url: &str, kind: TransportKind) -> Result<reqwest::Url, RelayError> {
    let mut url = reqwest::Url::parse(base_url).map_err(|e| unavailable("invalid upstream url", e))?;
    let path = format!("{}/socket.io/", url.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some(&format!("EIO=4&transport={kind}")));

    let scheme = match (kind, url.scheme()) {
        (TransportKind::Websocket, "http") => Some("ws"),
        (TransportKind::Websocket, "https") => Some("wss"),
        (TransportKind::Polling, "ws") => Some("http"),
        (TransportKind::Polling, "wss") => Some("https"),
        _ => None,
    };
    if let Some(scheme) = scheme {
        url.set_scheme(scheme)
            .map_err(|_| unavailable("invalid upstream url", format!("cannot use scheme {scheme}")))?;
    }
    Ok(url)
}

/// 建立指定类型的传输并完成 Engine.IO 握手（收到 open 包）
pub async fn open_transport(
    kind: TransportKind,
    base_url: &str,
) -> Result<OpenedTransport, RelayError> {
    let url = engine_url(base_url, kind)?;
    match kind {
        TransportKind::Websocket => open_websocket(url).await,
        TransportKind::Polling => open_polling(url).await,
    }
}

// ============================================================================
// WebSocket
// ============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct WsSink(SplitSink<WsStream, WsMessage>);

struct WsPackets(SplitStream<WsStream>);

#[async_trait]
impl PacketSink for WsSink {
    async fn send(&mut self, frame: String) -> Result<(), RelayError> {
        self.0
            .send(WsMessage::Text(frame))
            .await
            .map_err(|e| unavailable("websocket send failed", e))
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

#[async_trait]
impl PacketStream for WsPackets {
    async fn next_packet(&mut self) -> Option<Result<String, RelayError>> {
        loop {
            match self.0.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(text)),
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => continue,
                Err(e) => return Some(Err(unavailable("websocket receive failed", e))),
            }
        }
    }
}

async fn open_websocket(url: reqwest::Url) -> Result<OpenedTransport, RelayError> {
    let (ws, _) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| unavailable("websocket handshake failed", e))?;
    let (sink, stream) = ws.split();
    let mut stream = WsPackets(stream);

    let first = stream
        .next_packet()
        .await
        .ok_or_else(|| RelayError::UpstreamUnavailable("closed before engine open".into()))??;
    let open = expect_open(&first)?;

    Ok(OpenedTransport {
        kind: TransportKind::Websocket,
        sink: Box::new(WsSink(sink)),
        stream: Box::new(stream),
        open,
    })
}

// ============================================================================
// HTTP 长轮询
// ============================================================================

struct PollingShared {
    client: reqwest::Client,
    url: reqwest::Url,
    poll_timeout: Duration,
}

struct PollingSink {
    shared: Arc<PollingShared>,
}

struct PollingPackets {
    shared: Arc<PollingShared>,
    buffer: VecDeque<String>,
    closed: bool,
}

#[async_trait]
impl PacketSink for PollingSink {
    async fn send(&mut self, frame: String) -> Result<(), RelayError> {
        let response = self
            .shared
            .client
            .post(self.shared.url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain;charset=UTF-8")
            .body(frame)
            .send()
            .await
            .map_err(|e| unavailable("polling send failed", e))?;
        if !response.status().is_success() {
            return Err(unavailable("polling send rejected", response.status()));
        }
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.send(EnginePacket::Close.encode()).await;
    }
}

#[async_trait]
impl PacketStream for PollingPackets {
    async fn next_packet(&mut self) -> Option<Result<String, RelayError>> {
        loop {
            if let Some(packet) = self.buffer.pop_front() {
                return Some(Ok(packet));
            }
            if self.closed {
                return None;
            }
            let response = match self
                .shared
                .client
                .get(self.shared.url.clone())
                .timeout(self.shared.poll_timeout)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    self.closed = true;
                    return Some(Err(unavailable("polling request failed", e)));
                }
            };
            if !response.status().is_success() {
                // 会话已被服务端丢弃（sid 失效等）
                self.closed = true;
                return Some(Err(unavailable("polling rejected", response.status())));
            }
            match response.text().await {
                Ok(body) => self.buffer.extend(decode_payload(&body)),
                Err(e) => {
                    self.closed = true;
                    return Some(Err(unavailable("polling body read failed", e)));
                }
            }
        }
    }
}

async fn open_polling(url: reqwest::Url) -> Result<OpenedTransport, RelayError> {
    let client = reqwest::Client::new();
    let body = client
        .get(url.clone())
        .send()
        .await
        .map_err(|e| unavailable("polling handshake failed", e))?
        .error_for_status()
        .map_err(|e| unavailable("polling handshake rejected", e))?
        .text()
        .await
        .map_err(|e| unavailable("polling handshake failed", e))?;

    let mut packets: VecDeque<String> = decode_payload(&body).into();
    let first = packets
        .pop_front()
        .ok_or_else(|| RelayError::UpstreamUnavailable("empty polling handshake".into()))?;
    let open = expect_open(&first)?;

    let mut session_url = url;
    session_url
        .query_pairs_mut()
        .append_pair("sid", &open.sid);

    let shared = Arc::new(PollingShared {
        client,
        url: session_url,
        poll_timeout: open.heartbeat_deadline() + POLL_GRACE,
    });

    Ok(OpenedTransport {
        kind: TransportKind::Polling,
        sink: Box::new(PollingSink {
            shared: Arc::clone(&shared),
        }),
        stream: Box::new(PollingPackets {
            shared,
            buffer: packets,
            closed: false,
        }),
        open,
    })
}

fn expect_open(packet: &str) -> Result<OpenInfo, RelayError> {
    match EnginePacket::decode(packet) {
        Ok(EnginePacket::Open(info)) => Ok(info),
        Ok(other) => Err(RelayError::UpstreamUnavailable(format!(
            "expected engine open, got {other:?}"
        ))),
        Err(e) => Err(unavailable("invalid engine open", e)),
    }
}
