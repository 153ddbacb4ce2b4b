use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::settings::HealthConfig;

/// Liveness only: answers while the process is up, whatever the scheduler is doing.
pub fn router(path: &str) -> Router {
    Router::new().route(path, get(alive))
}

async fn alive() -> &'static str {
    "ok"
}

/// Serve the liveness route until `shutdown` is cancelled.
pub async fn serve(cfg: HealthConfig, shutdown: CancellationToken) -> Result<()> {
    let addr = cfg.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {}", addr))?;

    info!(%addr, path = %cfg.path, "Health endpoint listening");
    axum::serve(listener, router(&cfg.path))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn responds_ok_and_stops_on_cancel() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, router("/"))
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
        });

        let resp = reqwest::get(format!("http://{}/", addr)).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "ok");

        let missing = reqwest::get(format!("http://{}/other", addr)).await.unwrap();
        assert_eq!(missing.status(), 404);

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
