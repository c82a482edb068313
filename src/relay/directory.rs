//! Agent 目录：逻辑名称 → 上游 agent id
//!
//! 上游 `GET /api/agents` 的返回格式不统一：裸数组、`{agents: [...]}` 或 `{success, data: {agents: [...]}}`，三种都接受。

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::core::RelayError;

/// 目录条目
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentDirectoryEntry {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

/// Agent 目录 trait
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// 列出所有 agent；失败返回 `DirectoryLookupFailed`
    async fn list_agents(&self) -> Result<Vec<AgentDirectoryEntry>, RelayError>;
}

/// 按 id 精确匹配，否则按名称（忽略大小写）匹配
pub fn find_agent<'a>(entries: &'a [AgentDirectoryEntry], wanted: &str) -> Option<&'a AgentDirectoryEntry> {
    entries
        .iter()
        .find(|e| e.id == wanted)
        .or_else(|| entries.iter().find(|e| e.name.eq_ignore_ascii_case(wanted)))
}

/// 解析目录响应体
pub fn parse_agent_list(body: &Value) -> Result<Vec<AgentDirectoryEntry>, RelayError> {
    let list = match body {
        Value::Array(_) => body,
        Value::Object(obj) => obj
            .get("data")
            .and_then(|d| d.get("agents"))
            .or_else(|| obj.get("agents"))
            .ok_or_else(|| {
                RelayError::DirectoryLookupFailed("response has no agents list".to_string())
            })?,
        _ => {
            return Err(RelayError::DirectoryLookupFailed(
                "unexpected response shape".to_string(),
            ))
        }
    };
    serde_json::from_value(list.clone())
        .map_err(|e| RelayError::DirectoryLookupFailed(format!("invalid agents list: {e}")))
}

/// 通过 HTTP 查询上游目录
pub struct HttpAgentDirectory {
    client: reqwest::Client,
    url: String,
}

impl HttpAgentDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/agents", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl AgentDirectory for HttpAgentDirectory {
    async fn list_agents(&self) -> Result<Vec<AgentDirectoryEntry>, RelayError> {
        let lookup_err = |e: reqwest::Error| RelayError::DirectoryLookupFailed(e.to_string());
        let body: Value = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(lookup_err)?
            .error_for_status()
            .map_err(lookup_err)?
            .json()
            .await
            .map_err(lookup_err)?;
        parse_agent_list(&body)
    }
}

/// 带 TTL 缓存的目录（只缓存成功结果）
pub struct CachedDirectory<D> {
    inner: D,
    ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<AgentDirectoryEntry>)>>,
}

impl<D: AgentDirectory> CachedDirectory<D> {
    pub fn new(inner: D, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            cache: Mutex::new(None),
        }
    }

    fn cached(&self) -> Option<Vec<AgentDirectoryEntry>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, entries)| entries.clone())
    }
}

#[async_trait]
impl<D: AgentDirectory> AgentDirectory for CachedDirectory<D> {
    async fn list_agents(&self) -> Result<Vec<AgentDirectoryEntry>, RelayError> {
        if let Some(entries) = self.cached() {
            return Ok(entries);
        }
        let entries = self.inner.list_agents().await?;
        *self.cache.lock().unwrap_or_else(|e| e.into_inner()) = Some((Instant::now(), entries.clone()));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn entry(id: &str, name: &str) -> AgentDirectoryEntry {
        AgentDirectoryEntry {
            id: id.to_string(),
            name: name.to_string(),
        }
    }

    #[test]
    fn test_parse_agent_list_shapes() {
        let wrapped = json!({"success": true, "data": {"agents": [{"id": "agent-42", "name": "Obsidian", "status": "active"}]}});
        assert_eq!(parse_agent_list(&wrapped).unwrap(), vec![entry("agent-42", "Obsidian")]);

        let flat = json!({"agents": [{"id": "a1"}]});
        assert_eq!(parse_agent_list(&flat).unwrap(), vec![entry("a1", "")]);

        let bare = json!([{"id": "a2", "name": "Other"}]);
        assert_eq!(parse_agent_list(&bare).unwrap().len(), 1);

        assert!(matches!(
            parse_agent_list(&json!({"success": false})),
            Err(RelayError::DirectoryLookupFailed(_))
        ));
        assert!(parse_agent_list(&json!("nope")).is_err());
    }

    #[test]
    fn test_find_agent_by_id_then_name() {
        let entries = vec![entry("agent-42", "Obsidian"), entry("obsidian", "Shadow")];
        // id 精确匹配优先于名称匹配
        assert_eq!(find_agent(&entries, "obsidian").unwrap().id, "obsidian");
        assert_eq!(find_agent(&entries, "OBSIDIAN").unwrap().id, "agent-42");
        assert!(find_agent(&entries, "nobody").is_none());
    }

    struct CountingDirectory {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl AgentDirectory for CountingDirectory {
        async fn list_agents(&self) -> Result<Vec<AgentDirectoryEntry>, RelayError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![entry("agent-42", "Obsidian")])
        }
    }

    #[tokio::test]
    async fn test_cached_directory_reuses_within_ttl() {
        let cached = CachedDirectory::new(
            CountingDirectory {
                calls: AtomicUsize::new(0),
            },
            Duration::from_secs(60),
        );
        cached.list_agents().await.unwrap();
        cached.list_agents().await.unwrap();
        assert_eq!(cached.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_http_directory_unreachable() {
        let directory = HttpAgentDirectory::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        assert!(matches!(
            directory.list_agents().await,
            Err(RelayError::DirectoryLookupFailed(_))
        ));
    }
}
