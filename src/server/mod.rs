//! HTTP API server for the engine.

pub mod routes;

use std::sync::Arc;

use tracing::{info, warn};

use crate::engine::Engine;

/// Shared application state for the HTTP server.
#[derive(Debug)]
pub struct AppState {
    pub engine: Arc<Engine>,
}

/// Serve `engine` on `addr` until Ctrl-C, then shut the engine down.
pub async fn start(addr: &str, engine: Arc<Engine>) -> anyhow::Result<()> {
    let state = Arc::new(AppState {
        engine: Arc::clone(&engine),
    });

    let app = routes::create_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, dimension = engine.dimension(), metric = %engine.metric(), "server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for ctrl-c");
            }
        })
        .await?;

    tokio::task::spawn_blocking(move || engine.shutdown()).await??;
    Ok(())
}
