//! Liveness endpoint, separate from the proxy listener so orchestrators can
//! probe it without speaking the proxy protocol.

use std::net::SocketAddr;
use tokio::sync::broadcast;
use warp::Filter;

use crate::error::Result;

pub async fn serve(addr: SocketAddr, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
    let health = warp::path("health")
        .and(warp::get())
        .map(|| "git proxy is alive\n");

    let (bound, server) = warp::serve(health).bind_with_graceful_shutdown(addr, async move {
        let _ = shutdown.recv().await;
    });

    tracing::info!(addr = %bound, "Health endpoint listening");
    server.await;
    tracing::info!("Health endpoint stopped");
    Ok(())
}
