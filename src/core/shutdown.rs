//! 优雅关闭
//!
//! 关闭信号（Ctrl+C、SIGTERM、HTTP 服务异常）只记录第一个原因并取消同一个 token：
//! - axum 据 token 停止接收新请求
//! - [`ShutdownCoordinator::run`] 等到关闭后依次执行清理（断开上游会话、快速失败在途聊天）

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// 关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    /// Ctrl+C
    UserInitiated,
    /// SIGTERM
    Signal,
    /// 致命错误（如 HTTP 服务异常退出）
    FatalError(String),
}

/// 关闭信号：token + 首个关闭原因
pub struct ShutdownManager {
    token: CancellationToken,
    reason: watch::Sender<Option<ShutdownReason>>,
}

impl ShutdownManager {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: watch::channel(None).0,
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 触发关闭；重复触发时保留最早的原因
    pub fn shutdown(&self, reason: ShutdownReason) {
        self.reason.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = Some(reason);
            true
        });
        self.token.cancel();
    }

    /// 已记录的关闭原因（尚未关闭时为 None）
    pub fn reason(&self) -> Option<ShutdownReason> {
        self.reason.borrow().clone()
    }

    /// 等待关闭并返回原因
    pub async fn wait_for_shutdown(&self) -> ShutdownReason {
        self.token.cancelled().await;
        // token 只在写入原因之后取消
        self.reason().unwrap_or(ShutdownReason::Signal)
    }

    /// 安装 Ctrl+C / SIGTERM 处理器
    pub fn install_signal_handlers(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, shutting down");
                manager.shutdown(ShutdownReason::UserInitiated);
            }
        });

        #[cfg(unix)]
        {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                use tokio::signal::unix::{signal, SignalKind};
                match signal(SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        tracing::info!("Received SIGTERM, shutting down");
                        manager.shutdown(ShutdownReason::Signal);
                    }
                    Err(e) => tracing::warn!("SIGTERM handler not installed: {}", e),
                }
            });
        }
    }
}

impl Default for ShutdownManager {
    fn default() -> Self {
        Self::new()
    }
}

/// 关闭时执行的清理任务
#[async_trait::async_trait]
pub trait ShutdownCleanup: Send + Sync {
    async fn cleanup(&self) -> anyhow::Result<()>;

    /// 用于日志
    fn name(&self) -> &'static str;
}

/// 一次清理的结果统计
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub completed: Vec<&'static str>,
    pub failed: Vec<&'static str>,
    pub timed_out: Vec<&'static str>,
}

/// 关闭协调器：按注册顺序清理，每个任务独立超时，失败不影响后续任务
pub struct ShutdownCoordinator {
    manager: Arc<ShutdownManager>,
    tasks: Vec<Arc<dyn ShutdownCleanup>>,
    per_task_timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(manager: Arc<ShutdownManager>) -> Self {
        Self {
            manager,
            tasks: Vec::new(),
            per_task_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.per_task_timeout = timeout;
        self
    }

    pub fn register(&mut self, task: Arc<dyn ShutdownCleanup>) {
        self.tasks.push(task);
    }

    /// 等待关闭信号，然后执行全部清理
    pub async fn run(self) -> CleanupReport {
        let reason = self.manager.wait_for_shutdown().await;
        tracing::info!("Shutting down ({:?})", reason);
        self.run_cleanup().await
    }

    pub async fn run_cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();
        for task in &self.tasks {
            let name = task.name();
            match tokio::time::timeout(self.per_task_timeout, task.cleanup()).await {
                Ok(Ok(())) => {
                    tracing::info!("Cleanup '{}' done", name);
                    report.completed.push(name);
                }
                Ok(Err(e)) => {
                    tracing::warn!("Cleanup '{}' failed: {}", name, e);
                    report.failed.push(name);
                }
                Err(_) => {
                    tracing::warn!("Cleanup '{}' timed out after {:?}", name, self.per_task_timeout);
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}
