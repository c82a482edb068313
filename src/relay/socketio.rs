//! 上游连接（Link）抽象与 Socket.IO 连接器
//!
//! Session Manager 只依赖 [`UpstreamConnector`]：连接成功后得到一个 [`UpstreamLink`]，
//! 出站指令写入 `outbound`，入站事件从 `inbound` 读取。真实实现 [`SocketIoConnector`]
//! 在握手完成后启动读写两个后台任务，把 Engine.IO 传输桥接到这两个 channel；测试可以直接
//! 用 [`UpstreamLink::pair`] 构造替身。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};

use super::engine_io::{EnginePacket, OpenInfo, SocketPacket};
use super::message::{InboundEvent, OutboundEvent, OUTBOUND_EVENT};
use super::transport::{open_transport, OpenedTransport, PacketSink, PacketStream};
use crate::config::TransportKind;
use crate::core::RelayError;

/// 发往上游的指令
#[derive(Debug)]
pub enum OutboundCommand {
    /// 发出事件；ack 为 Some 时请求 Socket.IO 送达确认
    Emit {
        event: OutboundEvent,
        ack: Option<oneshot::Sender<Vec<Value>>>,
    },
    /// 主动断开
    Disconnect,
}

/// 一条已建立的上游连接（由 Session 独占）
pub struct UpstreamLink {
    pub outbound: mpsc::UnboundedSender<OutboundCommand>,
    pub inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

/// Link 的远端：连接器（或测试替身）从这里读指令、写事件
pub struct LinkEndpoint {
    pub commands: mpsc::UnboundedReceiver<OutboundCommand>,
    pub events: mpsc::UnboundedSender<InboundEvent>,
}

impl UpstreamLink {
    pub fn pair() -> (UpstreamLink, LinkEndpoint) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (
            UpstreamLink { outbound, inbound },
            LinkEndpoint { commands, events },
        )
    }
}

/// 上游连接器 trait：每次调用建立一条全新的连接
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<UpstreamLink, RelayError>;
}

/// Socket.IO（Engine.IO v4）连接器，按配置顺序尝试各传输
pub struct SocketIoConnector {
    base_url: String,
    transports: Vec<TransportKind>,
}

impl SocketIoConnector {
    pub fn new(base_url: &str, transports: Vec<TransportKind>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            transports,
        }
    }

    async fn connect_via(&self, kind: TransportKind) -> Result<UpstreamLink, RelayError> {
        let OpenedTransport {
            kind,
            mut sink,
            mut stream,
            open,
        } = open_transport(kind, &self.base_url).await?;

        sink.send(SocketPacket::Connect(None).to_frame()).await?;
        wait_namespace_connect(sink.as_mut(), stream.as_mut()).await?;

        tracing::info!(
            "Connected to upstream {} via {} (sid {})",
            self.base_url,
            kind,
            open.sid
        );

        let (link, endpoint) = UpstreamLink::pair();
        spawn_driver(sink, stream, open, endpoint);
        Ok(link)
    }
}

#[async_trait]
impl UpstreamConnector for SocketIoConnector {
    async fn connect(&self) -> Result<UpstreamLink, RelayError> {
        let mut last_err = None;
        for kind in &self.transports {
            match self.connect_via(*kind).await {
                Ok(link) => return Ok(link),
                Err(e) => {
                    tracing::warn!("Upstream {} transport failed: {}", kind, e);
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| {
            RelayError::UpstreamUnavailable("no transports configured".to_string())
        }))
    }
}

/// 等待默认命名空间的 connect 确认，期间应答心跳
async fn wait_namespace_connect(
    sink: &mut dyn PacketSink,
    stream: &mut dyn PacketStream,
) -> Result<(), RelayError> {
    loop {
        let packet = match stream.next_packet().await {
            Some(packet) => packet?,
            None => {
                return Err(RelayError::UpstreamUnavailable(
                    "closed during namespace connect".to_string(),
                ))
            }
        };
        match EnginePacket::decode(&packet) {
            Ok(EnginePacket::Ping(data)) => sink.send(EnginePacket::Pong(data).encode()).await?,
            Ok(EnginePacket::Message(body)) => match SocketPacket::decode(&body) {
                Ok(SocketPacket::Connect(_)) => return Ok(()),
                Ok(SocketPacket::ConnectError(message)) => {
                    return Err(RelayError::UpstreamUnavailable(format!(
                        "namespace connect rejected: {message}"
                    )))
                }
                _ => {}
            },
            Ok(EnginePacket::Close) => {
                return Err(RelayError::UpstreamUnavailable(
                    "closed during namespace connect".to_string(),
                ))
            }
            _ => {}
        }
    }
}

type AckTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Vec<Value>>>>>;

fn lock_acks(acks: &AckTable) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Vec<Value>>>> {
    acks.lock().unwrap_or_else(|e| e.into_inner())
}

/// 启动读写任务：写任务串行化所有出站帧（指令 + 心跳应答），读任务分发入站事件
fn spawn_driver(
    mut sink: Box<dyn PacketSink>,
    mut stream: Box<dyn PacketStream>,
    open: OpenInfo,
    endpoint: LinkEndpoint,
) {
    let LinkEndpoint {
        mut commands,
        events,
    } = endpoint;
    let acks: AckTable = Arc::new(Mutex::new(HashMap::new()));
    let (raw_tx, mut raw_rx) = mpsc::unbounded_channel::<String>();

    let writer_acks = Arc::clone(&acks);
    tokio::spawn(async move {
        let mut next_ack_id = 0u64;
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(OutboundCommand::Emit { event, ack }) => {
                        let id = ack.map(|tx| {
                            let id = next_ack_id;
                            next_ack_id += 1;
                            lock_acks(&writer_acks).insert(id, tx);
                            id
                        });
                        let frame = SocketPacket::event(OUTBOUND_EVENT, event.to_args(), id).to_frame();
                        if let Err(e) = sink.send(frame).await {
                            tracing::warn!("Upstream write failed: {}", e);
                            break;
                        }
                    }
                    Some(OutboundCommand::Disconnect) | None => {
                        let _ = sink.send(SocketPacket::Disconnect.to_frame()).await;
                        break;
                    }
                },
                raw = raw_rx.recv() => match raw {
                    Some(frame) => {
                        if sink.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // 读任务已退出
                    None => break,
                },
            }
        }
        sink.close().await;
    });

    tokio::spawn(async move {
        let deadline = open.heartbeat_deadline();
        let reason = loop {
            let packet = match tokio::time::timeout(deadline, stream.next_packet()).await {
                Err(_) => break "heartbeat timeout".to_string(),
                Ok(None) => break "transport closed".to_string(),
                Ok(Some(Err(e))) => break e.to_string(),
                Ok(Some(Ok(packet))) => packet,
            };

            match EnginePacket::decode(&packet) {
                Ok(EnginePacket::Ping(data)) => {
                    let _ = raw_tx.send(EnginePacket::Pong(data).encode());
                }
                Ok(EnginePacket::Message(body)) => match SocketPacket::decode(&body) {
                    Ok(SocketPacket::Event { name, args, .. }) => {
                        if let Some(event) = InboundEvent::from_socket_event(&name, &args) {
                            if events.send(event).is_err() {
                                break "link dropped".to_string();
                            }
                        }
                    }
                    Ok(SocketPacket::Ack { id, args }) => {
                        if let Some(tx) = lock_acks(&acks).remove(&id) {
                            let _ = tx.send(args);
                        }
                    }
                    Ok(SocketPacket::Disconnect) => break "server disconnected".to_string(),
                    Ok(_) => {}
                    Err(e) => tracing::debug!("Ignoring socket packet: {}", e),
                },
                Ok(EnginePacket::Close) => break "server closed".to_string(),
                Ok(_) => {}
                Err(e) => tracing::debug!("Ignoring engine packet: {}", e),
            }
        };

        tracing::info!("Upstream connection ended: {}", reason);
        lock_acks(&acks).clear();
        let _ = events.send(InboundEvent::Disconnected(reason));
    });
}
