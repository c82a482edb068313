//! 测试用的 Eliza 替身：`GET /api/agents` 目录 + Engine.IO v4（websocket 与长轮询）
//!
//! 收到 `SEND_MESSAGE` 后先把用户消息原样广播回房间（与真实 Eliza 一样），
//! 再延迟广播 `Echo: <message>`。消息中带有以下标记时改变行为：
//! - `[silent]`：不回复
//! - `[error]`：对该房间发出 error 事件
//! - `[drop]`：断开该连接

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};

use obsidian::config::{AppConfig, TransportKind};
use obsidian::relay::engine_io::{decode_payload, encode_payload, EnginePacket, SocketPacket};

pub const AGENT_ID: &str = "agent-42";

enum Reaction {
    Send { delay: Duration, frame: String },
    Close,
}

type PollingQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>;

struct PollingClient {
    tx: mpsc::UnboundedSender<String>,
    rx: PollingQueue,
}

pub struct FakeState {
    pub connections: AtomicUsize,
    pub joins: Mutex<Vec<String>>,
    pub messages: Mutex<Vec<Value>>,
    pub directory_fails: AtomicBool,
    reply_delay: Duration,
    kill: broadcast::Sender<()>,
    polling: Mutex<HashMap<String, PollingClient>>,
}

pub struct FakeEliza {
    pub base_url: String,
    pub state: Arc<FakeState>,
}

impl FakeEliza {
    pub async fn start() -> Self {
        Self::start_with_delay(Duration::from_millis(50)).await
    }

    pub async fn start_with_delay(reply_delay: Duration) -> Self {
        let (kill, _) = broadcast::channel(4);
        let state = Arc::new(FakeState {
            connections: AtomicUsize::new(0),
            joins: Mutex::new(Vec::new()),
            messages: Mutex::new(Vec::new()),
            directory_fails: AtomicBool::new(false),
            reply_delay,
            kill,
            polling: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/api/agents", get(list_agents))
            .route("/socket.io/", get(engine_get).post(engine_post))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    /// 服务端主动断开所有连接
    pub fn drop_all(&self) {
        let _ = self.state.kill.send(());
        self.state.polling.lock().unwrap().clear();
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> Vec<String> {
        self.state.joins.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<Value> {
        self.state.messages.lock().unwrap().clone()
    }

    /// 指向本替身的配置：短超时、单次重试
    pub fn config(&self, transports: Vec<TransportKind>) -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.upstream.base_url = self.base_url.clone();
        cfg.upstream.transports = transports;
        cfg.upstream.entity_id = Some("11111111-1111-4111-8111-111111111111".into());
        cfg.upstream.reconnection_attempts = 2;
        cfg.upstream.reconnection_delay_ms = 10;
        cfg.upstream.reconnection_delay_max_ms = 20;
        cfg.upstream.connect_timeout_secs = 2;
        cfg.upstream.reply_timeout_secs = 5;
        cfg.upstream.directory_timeout_secs = 2;
        cfg
    }
}

/// 指向一个没有服务的地址
pub fn unreachable_config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.upstream.base_url = "http://127.0.0.1:1".into();
    cfg.upstream.reconnection_attempts = 2;
    cfg.upstream.reconnection_delay_ms = 10;
    cfg.upstream.reconnection_delay_max_ms = 20;
    cfg.upstream.connect_timeout_secs = 2;
    cfg.upstream.directory_timeout_secs = 1;
    cfg
}

async fn list_agents(State(state): State<Arc<FakeState>>) -> Response {
    if state.directory_fails.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({
        "success": true,
        "data": {"agents": [
            {"id": AGENT_ID, "name": "Obsidian", "status": "active"},
            {"id": "agent-7", "name": "Sentinel", "status": "active"},
        ]}
    }))
    .into_response()
}

fn open_frame(sid: &str) -> String {
    format!(
        "0{}",
        json!({"sid": sid, "upgrades": [], "pingInterval": 25000, "pingTimeout": 20000, "maxPayload": 1000000})
    )
}

/// 处理一个客户端 Engine 包
fn react(state: &FakeState, packet: &str) -> Vec<Reaction> {
    let now = |frame: String| Reaction::Send {
        delay: Duration::ZERO,
        frame,
    };
    let body = match EnginePacket::decode(packet) {
        Ok(EnginePacket::Message(body)) => body,
        Ok(EnginePacket::Close) => return vec![Reaction::Close],
        _ => return Vec::new(),
    };

    match SocketPacket::decode(&body) {
        Ok(SocketPacket::Connect(_)) => {
            vec![now(SocketPacket::Connect(Some(json!({"sid": uuid::Uuid::new_v4().to_string()}))).to_frame())]
        }
        Ok(SocketPacket::Disconnect) => vec![Reaction::Close],
        Ok(SocketPacket::Event { id, name, args }) if name == "message" => {
            let mut out = Vec::new();
            if let Some(id) = id {
                out.push(now(
                    SocketPacket::Ack {
                        id,
                        args: vec![json!({"ok": true})],
                    }
                    .to_frame(),
                ));
            }
            let envelope = args.first().cloned().unwrap_or(Value::Null);
            let payload = envelope["payload"].clone();
            let room = payload["roomId"].as_str().unwrap_or_default().to_string();

            match envelope["type"].as_u64() {
                Some(1) => state.joins.lock().unwrap().push(room),
                Some(2) => {
                    state.messages.lock().unwrap().push(payload.clone());
                    let text = payload["message"].as_str().unwrap_or_default().to_string();
                    let broadcast = |body: Value| SocketPacket::event("messageBroadcast", vec![body], None).to_frame();

                    if text.contains("[drop]") {
                        out.push(Reaction::Close);
                    } else if text.contains("[error]") {
                        out.push(now(
                            SocketPacket::event(
                                "error",
                                vec![json!({"message": "agent crashed", "roomId": room})],
                                None,
                            )
                            .to_frame(),
                        ));
                    } else if !text.contains("[silent]") {
                        out.push(now(broadcast(json!({
                            "roomId": room,
                            "channelId": room,
                            "text": text,
                            "senderId": payload["senderId"],
                            "senderName": payload["senderName"],
                        }))));
                        out.push(Reaction::Send {
                            delay: state.reply_delay,
                            frame: broadcast(json!({
                                "roomId": room,
                                "channelId": room,
                                "content": {"text": format!("Echo: {text}")},
                                "senderId": room,
                                "senderName": "Obsidian",
                            })),
                        });
                    }
                }
                _ => {}
            }
            out
        }
        _ => Vec::new(),
    }
}

/// 把反应写入连接的出站队列；返回是否需要关闭连接
fn dispatch(reactions: Vec<Reaction>, out: &mpsc::UnboundedSender<String>) -> bool {
    let mut close = false;
    for reaction in reactions {
        match reaction {
            Reaction::Send { delay, frame } if delay.is_zero() => {
                let _ = out.send(frame);
            }
            Reaction::Send { delay, frame } => {
                let out = out.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = out.send(frame);
                });
            }
            Reaction::Close => close = true,
        }
    }
    close
}

#[derive(Debug, Deserialize)]
struct EngineQuery {
    #[serde(rename = "EIO")]
    eio: Option<String>,
    transport: Option<String>,
    sid: Option<String>,
}

async fn engine_get(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<EngineQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    if query.eio.as_deref() != Some("4") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match (query.transport.as_deref(), ws) {
        (Some("websocket"), Some(ws)) => ws.on_upgrade(move |socket| websocket_session(state, socket)),
        (Some("polling"), _) => match query.sid {
            None => polling_open(&state),
            Some(sid) => polling_poll(&state, &sid).await,
        },
        _ => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn websocket_session(state: Arc<FakeState>, mut socket: WebSocket) {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let mut kill = state.kill.subscribe();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let sid = uuid::Uuid::new_v4().to_string();
    if socket.send(Message::Text(open_frame(&sid))).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if dispatch(react(&state, &text), &tx) {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
            _ = kill.recv() => break,
        }
    }
}

fn polling_open(state: &FakeState) -> Response {
    state.connections.fetch_add(1, Ordering::SeqCst);
    let sid = uuid::Uuid::new_v4().to_string();
    let (tx, rx) = mpsc::unbounded_channel();
    state.polling.lock().unwrap().insert(
        sid.clone(),
        PollingClient {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
        },
    );
    open_frame(&sid).into_response()
}

async fn polling_poll(state: &FakeState, sid: &str) -> Response {
    let queue = match state.polling.lock().unwrap().get(sid) {
        Some(client) => Arc::clone(&client.rx),
        None => return StatusCode::BAD_REQUEST.into_response(),
    };
    let mut rx = queue.lock().await;
    let first = match tokio::time::timeout(Duration::from_secs(1), rx.recv()).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return StatusCode::BAD_REQUEST.into_response(),
        // 没有数据：noop
        Err(_) => "6".to_string(),
    };
    let mut frames = vec![first];
    while let Ok(frame) = rx.try_recv() {
        frames.push(frame);
    }
    encode_payload(&frames).into_response()
}

async fn engine_post(
    State(state): State<Arc<FakeState>>,
    Query(query): Query<EngineQuery>,
    body: String,
) -> Response {
    let Some(sid) = query.sid else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let tx = match state.polling.lock().unwrap().get(&sid) {
        Some(client) => client.tx.clone(),
        None => return StatusCode::BAD_REQUEST.into_response(),
    };
    for packet in decode_payload(&body) {
        if dispatch(react(&state, &packet), &tx) {
            state.polling.lock().unwrap().remove(&sid);
            break;
        }
    }
    "ok".into_response()
}
