use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use stopnik_core::config::Config;
use stopnik_core::keys::KeyRegistry;
use stopnik_core::session::Sessions;
use stopnik_core::token::TokenService;

use crate::routes;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub keys: Arc<KeyRegistry>,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<Sessions>,
}

impl AppState {
    pub fn new(config: Config, keys: KeyRegistry) -> Self {
        let config = Arc::new(config);
        let keys = Arc::new(keys);
        let session_timeout =
            chrono::Duration::seconds(config.server.session_timeout_seconds as i64);
        Self {
            tokens: Arc::new(TokenService::new(Arc::clone(&config), Arc::clone(&keys))),
            sessions: Arc::new(Sessions::new(session_timeout)),
            config,
            keys,
        }
    }

    /// Start one sweeper per session and token store.
    pub fn spawn_sweepers(&self, shutdown: &watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = self.sessions.spawn_sweepers(shutdown);
        handles.extend(self.tokens.spawn_sweepers(shutdown));
        handles
    }
}

/// The complete application: routes, CORS and request tracing.
pub fn app(state: AppState) -> Router {
    let cors = build_cors(&state.config);
    Router::new()
        .merge(routes::router(&state.config))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(config: Config, keys: KeyRegistry) -> anyhow::Result<()> {
    let addr = listen_addr(&config.server.addr);
    if config.server.tls.is_some() {
        tracing::info!("tls section present, expecting termination at the fronting proxy");
    }

    let state = AppState::new(config, keys);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweepers = state.spawn_sweepers(&shutdown_rx);

    let app = app(state);

    tracing::info!(%addr, "starting server");
    let listener = TcpListener::bind(&addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    shutdown_tx.send(true).ok();
    for sweeper in sweepers {
        sweeper.await.ok();
    }
    tracing::info!("server stopped");

    Ok(())
}

/// `:8080` binds every interface.
fn listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_string(),
    }
}

fn build_cors(config: &Config) -> CorsLayer {
    let origins = &config.server.cors_origins;
    if origins.is_empty() {
        tracing::debug!("no cors_origins configured, using permissive CORS");
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([
                axum::http::header::CONTENT_TYPE,
                axum::http::header::AUTHORIZATION,
            ])
            .allow_credentials(true)
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => tracing::info!("received CTRL+C"),
                    _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
                tracing::info!("received CTRL+C");
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        tracing::info!("received CTRL+C");
    }
}
