//! Obsidian API 服务
//!
//! 运行方式：
//! ```bash
//! ELIZA_URL=http://localhost:3000 cargo run
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use obsidian::api::{create_router, ApiState};
use obsidian::config::load_config;
use obsidian::core::{ShutdownCleanup, ShutdownCoordinator, ShutdownManager, ShutdownReason};
use obsidian::observability;
use obsidian::relay::ChatRelay;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let config_path = std::env::args().nth(1).map(std::path::PathBuf::from);
    let cfg = load_config(config_path).context("Failed to load configuration")?;

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    let relay = Arc::new(ChatRelay::from_config(&cfg).context("Failed to build chat relay")?);

    let mut coordinator = ShutdownCoordinator::new(Arc::clone(&shutdown)).with_timeout(Duration::from_secs(5));
    let upstream_cleanup: Arc<dyn ShutdownCleanup> = relay.sessions().clone();
    coordinator.register(upstream_cleanup);

    if cfg.upstream.connect_on_startup {
        let sessions = Arc::clone(relay.sessions());
        tokio::spawn(async move {
            if let Err(e) = sessions.ensure_connected().await {
                tracing::warn!("Eager upstream connect failed (will retry on first chat): {}", e);
            }
        });
    }

    // 关闭信号 → 断开上游，在途聊天请求立即失败
    let cleanup = tokio::spawn(coordinator.run());

    let app = create_router(Arc::new(ApiState::new(relay)));
    let addr = cfg.server.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    tracing::info!("Obsidian API server listening on http://{}", addr);
    tracing::info!("WebSocket endpoint ready at ws://{}/ws", addr);
    tracing::info!("Relaying chat to Eliza at {}", cfg.upstream.base_url);

    let token = shutdown.token();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await;
    if let Err(e) = &served {
        shutdown.shutdown(ShutdownReason::FatalError(e.to_string()));
    }

    match cleanup.await {
        Ok(report) if !report.failed.is_empty() || !report.timed_out.is_empty() => {
            tracing::warn!("Unclean shutdown: {:?}", report);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Cleanup task panicked: {}", e),
    }
    served.context("HTTP server error")?;
    tracing::info!("Obsidian API server stopped");
    Ok(())
}
