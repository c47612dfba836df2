//! 主应用程序入口
//!
//! 加载配置、连接数据库并启动 Axum 服务（REST + WebSocket）。

use std::sync::Arc;

use application::{Clock, RateLimits, SystemClock};
use config::AppConfig;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState, JwtService, StateDependencies};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load()?;
    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        "configuration loaded"
    );

    // 连接池 + 迁移
    let storage = infrastructure::connect(&config.database).await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let state = AppState::new(StateDependencies {
        conversations: storage.conversations.clone(),
        messages: storage.messages.clone(),
        calls: storage.calls.clone(),
        users: storage.directory.clone(),
        ads: storage.directory.clone(),
        verifier: Arc::new(JwtService::new(config.jwt.clone())),
        clock,
        chat: config.chat.clone(),
    });

    spawn_limiter_purge(state.limits.clone(), config.chat.limiter_purge_interval());

    let app = router(state, &config.server.cors_origins);
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("marketplace chat listening on http://{addr}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

/// 定期清理过期的限流窗口
fn spawn_limiter_purge(limits: Arc<RateLimits>, every: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let removed = limits.purge_expired();
            if removed > 0 {
                tracing::debug!(removed, "purged expired rate limit windows");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
