//! `/ws` 实时通道：连接时发送欢迎消息，收到的帧只记录日志

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    response::Response,
};
use serde_json::json;

pub const WELCOME_TEXT: &str = "Connected to Obsidian Network";

pub async fn upgrade(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(handle_socket)
}

async fn handle_socket(mut socket: WebSocket) {
    let client_id = uuid::Uuid::new_v4();
    tracing::info!(%client_id, "New WebSocket connection");

    let welcome = json!({ "type": "welcome", "message": WELCOME_TEXT }).to_string();
    if socket.send(Message::Text(welcome)).await.is_err() {
        return;
    }

    while let Some(msg) = socket.recv().await {
        match msg {
            Ok(Message::Text(text)) => tracing::info!(%client_id, "Received: {}", text),
            Ok(Message::Binary(data)) => {
                tracing::info!(%client_id, "Received {} binary bytes", data.len())
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(%client_id, "WebSocket receive error: {}", e);
                break;
            }
        }
    }

    tracing::info!(%client_id, "WebSocket connection closed");
}
