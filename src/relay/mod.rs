//! 聊天中继核心
//!
//! HTTP 的一问一答 ↔ 上游 Eliza Socket.IO 的事件广播：
//!
//! ```text
//!  send_chat ──► directory (agent id = room id)
//!      │
//!      ├──► UpstreamSessionManager::ensure_connected ──► SocketIoConnector (websocket / polling)
//!      ├──► PendingReplies::register(room)
//!      ├──► join_room + emit_message
//!      └──◄ Waiter::wait(reply_timeout) ◄── pump ◄── messageBroadcast / error / disconnect
//! ```
//!
//! - **engine_io**: Engine.IO v4 / Socket.IO v5 文本包编解码
//! - **transport**: websocket 与 HTTP 长轮询传输
//! - **socketio**: 连接器与读写驱动任务
//! - **message**: Eliza 消息载荷
//! - **session**: Upstream Session Manager
//! - **pending**: Waiter 表
//! - **directory**: Agent 目录
//! - **correlator**: Request/Reply Correlator（`ChatRelay`）
//! - **fallback**: 模拟回复

pub mod correlator;
pub mod directory;
pub mod engine_io;
pub mod fallback;
pub mod message;
pub mod pending;
pub mod session;
pub mod socketio;
pub mod transport;

pub use correlator::{ChatRelay, ChatReply, RelaySettings, ReplySource};
pub use directory::{AgentDirectory, AgentDirectoryEntry, CachedDirectory, HttpAgentDirectory};
pub use message::RelayIdentity;
pub use pending::{InboundReply, PendingReplies, Waiter};
pub use session::{ConnectionState, RetryPolicy, Session, UpstreamSessionManager};
pub use socketio::{SocketIoConnector, UpstreamConnector, UpstreamLink};
