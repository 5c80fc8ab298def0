//! HTTP server: control API, push channel and socket transport on one listener.

pub mod api;

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;

use crate::agents::AgentProcessRegistry;
use crate::config::StagehandToml;
use crate::hub::{SocketUpgradeRouter, StreamHub};
use crate::preview::{PreviewSupervisor, ProjectsRoot};

pub use api::{AppState, SharedState, api_router};

/// Everything a running server owns.
pub struct App {
    pub state: SharedState,
    pub router: Router,
}

impl App {
    /// Build state and router from configuration. Must be called inside a
    /// Tokio runtime: the hub starts its maintenance tasks here.
    pub fn new(config: &StagehandToml) -> Result<Self> {
        let hub = StreamHub::start(config.hub_config());
        let previews = PreviewSupervisor::new(
            config.preview_settings(),
            Arc::clone(&hub),
            Arc::new(ProjectsRoot::new(config.projects_root())),
        )
        .context("Failed to set up preview supervisor")?;
        let agents = Arc::new(AgentProcessRegistry::new(Arc::clone(&hub)));
        let state = Arc::new(AppState {
            hub,
            previews,
            agents,
        });

        let sockets = SocketUpgradeRouter::new(config.socket_settings());
        let mut router = build_router(Arc::clone(&state), &sockets);
        if config.server.dev_mode {
            router = router.layer(CorsLayer::permissive());
        }

        Ok(Self { state, router })
    }
}

/// The full application router: API routes plus the socket upgrade route.
pub fn build_router(state: SharedState, sockets: &SocketUpgradeRouter) -> Router {
    let hub = Arc::clone(&state.hub);
    sockets.mount(api_router(), hub).with_state(state)
}

/// Serve `app` on `listener` until `shutdown` resolves, then stop every
/// preview and agent process.
///
/// When `shutdown` fires the hub closes every stream, so open push channels
/// and sockets end instead of holding the graceful shutdown open.
pub async fn serve(
    app: App,
    listener: TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let App { state, router } = app;

    let hub = Arc::clone(&state.hub);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            shutdown.await;
            hub.close_all();
        })
        .await
        .context("Server error")?;

    tracing::info!("Stopping previews and agent processes");
    state.previews.shutdown().await;
    state.agents.shutdown().await;
    Ok(())
}

/// Bind the configured address and serve until Ctrl+C.
pub async fn start_server(config: StagehandToml) -> Result<()> {
    let app = App::new(&config)?;

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        address = %local_addr,
        projects_root = %config.projects_root().display(),
        dev_mode = config.server.dev_mode,
        "Stagehand listening"
    );

    serve(app, listener, shutdown_signal()).await?;
    tracing::info!("Server shut down gracefully");
    Ok(())
}

/// Resolves on the first Ctrl+C. A second Ctrl+C exits immediately, even if
/// a dev server is still inside its stop grace period.
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for Ctrl+C: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutting down; press Ctrl+C again to exit immediately");
    tokio::spawn(async {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Second Ctrl+C received; exiting without cleanup");
            std::process::exit(130);
        }
    });
}
