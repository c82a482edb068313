//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `OBSIDIAN__*` 覆盖（双下划线表示嵌套，如 `OBSIDIAN__UPSTREAM__BASE_URL=http://eliza:3000`），
//! 最后兼容旧版 Express 服务的 `PORT`、`ELIZA_URL`、`AGENT_ID`。

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerSection,
    pub upstream: UpstreamSection,
    pub chat: ChatSection,
}

/// [server] 段：HTTP 监听地址
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind_addr: String,
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            port: 3001,
        }
    }
}

impl ServerSection {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// 上游传输方式（按配置顺序逐个尝试）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Engine.IO over WebSocket
    Websocket,
    /// Engine.IO HTTP 长轮询
    Polling,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Websocket => write!(f, "websocket"),
            TransportKind::Polling => write!(f, "polling"),
        }
    }
}

/// [upstream] 段：Eliza 服务地址、身份、重连策略与各类超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSection {
    pub base_url: String,
    /// 目录查询失败或无匹配时使用的 agent id
    pub default_agent_id: String,
    pub server_id: String,
    /// 发送方实体 id；未设置时每个进程生成一个 UUID
    pub entity_id: Option<String>,
    pub sender_name: String,
    pub transports: Vec<TransportKind>,
    /// 单次 ensure_connected 内的最大连接尝试次数
    pub reconnection_attempts: u32,
    pub reconnection_delay_ms: u64,
    pub reconnection_delay_max_ms: u64,
    pub connect_timeout_secs: u64,
    pub reply_timeout_secs: u64,
    /// 0 表示不请求 Socket.IO ack
    pub ack_timeout_ms: u64,
    pub directory_timeout_secs: u64,
    /// 目录缓存秒数，0 表示每次请求都查询
    pub directory_cache_secs: u64,
    /// 启动时即建立上游连接（否则首个聊天请求时懒连接）
    pub connect_on_startup: bool,
}

impl Default for UpstreamSection {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            default_agent_id: "obsidian".to_string(),
            server_id: "00000000-0000-0000-0000-000000000000".to_string(),
            entity_id: None,
            sender_name: "Obsidian User".to_string(),
            transports: vec![TransportKind::Websocket, TransportKind::Polling],
            reconnection_attempts: 5,
            reconnection_delay_ms: 1000,
            reconnection_delay_max_ms: 5000,
            connect_timeout_secs: 10,
            reply_timeout_secs: 30,
            ack_timeout_ms: 0,
            directory_timeout_secs: 5,
            directory_cache_secs: 0,
            connect_on_startup: false,
        }
    }
}

impl UpstreamSection {
    pub fn reconnection_delay(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_ms)
    }

    pub fn reconnection_delay_max(&self) -> Duration {
        Duration::from_millis(self.reconnection_delay_max_ms.max(self.reconnection_delay_ms))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn reply_timeout(&self) -> Duration {
        Duration::from_secs(self.reply_timeout_secs)
    }

    pub fn ack_timeout(&self) -> Option<Duration> {
        (self.ack_timeout_ms > 0).then(|| Duration::from_millis(self.ack_timeout_ms))
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(self.directory_timeout_secs)
    }

    pub fn directory_cache_ttl(&self) -> Option<Duration> {
        (self.directory_cache_secs > 0).then(|| Duration::from_secs(self.directory_cache_secs))
    }
}

/// [chat] 段：上游不可用时是否降级为模拟回复
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChatSection {
    pub fallback_to_mock: bool,
}

/// 从 config 目录加载配置，环境变量 OBSIDIAN__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 叠加环境变量 OBSIDIAN__*（双下划线表示嵌套键，列表用逗号分隔）
/// 4. 兼容旧变量 PORT / ELIZA_URL / AGENT_ID
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("OBSIDIAN")
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("upstream.transports")
            .try_parsing(true),
    );

    let mut cfg: AppConfig = builder.build()?.try_deserialize()?;
    apply_legacy_env(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// 兼容 Express 版本的环境变量；lookup 便于测试注入
pub fn apply_legacy_env(cfg: &mut AppConfig, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
        cfg.server.port = port;
    }
    if let Some(url) = lookup("ELIZA_URL").filter(|u| !u.trim().is_empty()) {
        cfg.upstream.base_url = url.trim().trim_end_matches('/').to_string();
    }
    if let Some(agent) = lookup("AGENT_ID").filter(|a| !a.trim().is_empty()) {
        cfg.upstream.default_agent_id = agent.trim().to_string();
    }
}
