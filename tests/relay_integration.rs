//! 聊天中继端到端测试：真实 Socket.IO 连接器 ↔ 进程内 Eliza 替身

mod common;

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use common::{unreachable_config, FakeEliza, AGENT_ID};
use obsidian::config::TransportKind;
use obsidian::relay::{ChatRelay, ConnectionState, ReplySource};
use obsidian::RelayError;

#[tokio::test]
async fn test_websocket_round_trip() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let reply = relay
        .send_chat("How is the treasury?", Some("obsidian"))
        .await
        .unwrap();
    // 用户消息的回显被忽略，收到的是 agent 的回复
    assert_eq!(reply.text, "Echo: How is the treasury?");
    assert_eq!(reply.agent_id, AGENT_ID);
    assert_eq!(reply.source, ReplySource::SocketIo);

    assert_eq!(eliza.joins(), vec![AGENT_ID.to_string()]);
    let messages = eliza.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0]["roomId"], AGENT_ID);
    assert_eq!(messages[0]["senderId"], "11111111-1111-4111-8111-111111111111");
    assert_eq!(messages[0]["source"], "obsidian_api");
    assert!(relay.sessions().pending().is_empty());
}

#[tokio::test]
async fn test_polling_round_trip() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Polling])).unwrap();

    let reply = relay.send_chat("risk report", None).await.unwrap();
    assert_eq!(reply.text, "Echo: risk report");
    assert_eq!(reply.agent_id, AGENT_ID);
    assert_eq!(relay.sessions().state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_session_reused_across_chats() {
    let eliza = FakeEliza::start_with_delay(Duration::from_millis(10)).await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    for i in 0..3 {
        let reply = relay.send_chat(&format!("ping {i}"), None).await.unwrap();
        assert_eq!(reply.text, format!("Echo: ping {i}"));
    }
    assert_eq!(eliza.connections(), 1);
    assert_eq!(relay.sessions().handshake_count(), 1);
}

#[tokio::test]
async fn test_concurrent_agents_no_cross_delivery() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let (a, b) = tokio::join!(
        relay.send_chat("treasury?", Some("Obsidian")),
        relay.send_chat("threats?", Some("Sentinel")),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert_eq!((a.agent_id.as_str(), a.text.as_str()), (AGENT_ID, "Echo: treasury?"));
    assert_eq!((b.agent_id.as_str(), b.text.as_str()), ("agent-7", "Echo: threats?"));
    assert_eq!(eliza.connections(), 1);
}

#[tokio::test]
async fn test_server_drop_fails_exchange_then_reconnects() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let started = Instant::now();
    let err = relay.send_chat("bye [drop]", None).await.unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnavailable(_)), "{err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(relay.sessions().pending().is_empty());

    let reply = relay.send_chat("hello again", None).await.unwrap();
    assert_eq!(reply.text, "Echo: hello again");
    assert_eq!(eliza.connections(), 2);
}

#[tokio::test]
async fn test_drop_all_while_waiting() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let (result, _) = tokio::join!(relay.send_chat("[silent]", None), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        eliza.drop_all();
    });
    assert!(matches!(result, Err(RelayError::UpstreamUnavailable(_))));
    assert!(relay.sessions().pending().is_empty());
}

#[tokio::test]
async fn test_upstream_error_event() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    assert_eq!(
        relay.send_chat("boom [error]", None).await,
        Err(RelayError::UpstreamError("agent crashed".into()))
    );
    // 连接本身仍可用
    assert!(relay.send_chat("still there?", None).await.is_ok());
    assert_eq!(eliza.connections(), 1);
}

#[tokio::test]
async fn test_emit_with_ack() {
    let eliza = FakeEliza::start().await;
    let mut cfg = eliza.config(vec![TransportKind::Websocket]);
    cfg.upstream.ack_timeout_ms = 500;
    let relay = ChatRelay::from_config(&cfg).unwrap();

    let reply = relay.send_chat("acked", None).await.unwrap();
    assert_eq!(reply.text, "Echo: acked");
}

#[tokio::test]
async fn test_directory_failure_uses_default_agent() {
    let eliza = FakeEliza::start().await;
    eliza.state.directory_fails.store(true, Ordering::SeqCst);
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let reply = relay.send_chat("hello", Some("Obsidian")).await.unwrap();
    assert_eq!(reply.agent_id, "obsidian");
    assert_eq!(eliza.joins(), vec!["obsidian".to_string()]);
}

#[tokio::test]
async fn test_unreachable_upstream() {
    let relay = ChatRelay::from_config(&unreachable_config()).unwrap();
    let err = relay.send_chat("hello", None).await.unwrap_err();
    assert!(matches!(err, RelayError::UpstreamUnavailable(ref m) if m.contains("gave up after 2")));
    assert_eq!(relay.sessions().state(), ConnectionState::Disconnected);
    assert_eq!(relay.sessions().handshake_count(), 2);

    let mut cfg = unreachable_config();
    cfg.chat.fallback_to_mock = true;
    let relay = ChatRelay::from_config(&cfg).unwrap();
    let reply = relay.send_chat("what about yield?", None).await.unwrap();
    assert_eq!(reply.source, ReplySource::Mock);
    assert_eq!(reply.agent_id, "obsidian");
}

#[tokio::test]
async fn test_shutdown_fails_in_flight_chat() {
    let eliza = FakeEliza::start().await;
    let relay = ChatRelay::from_config(&eliza.config(vec![TransportKind::Websocket])).unwrap();

    let (result, _) = tokio::join!(relay.send_chat("[silent]", None), async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        relay.sessions().shutdown().await;
    });
    assert!(matches!(result, Err(RelayError::UpstreamUnavailable(_))));
    assert!(relay.send_chat("after shutdown", None).await.is_err());
}
