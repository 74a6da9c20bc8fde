use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use nicolive::{Connector, HttpConnector};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tower_http::cors::CorsLayer;
use tower_http::trace::MakeSpan;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod broadcaster;
mod config;
mod error;
mod handlers;
mod metrics;
mod registry;
mod subscriber;
#[cfg(test)]
mod test_helpers;
mod views;
mod ws;

use crate::config::{AccountSource, FileConfig, RelayDirs};
use crate::metrics::RelayMetrics;
use crate::registry::SessionRegistry;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "relay")]
#[command(about = "Relay live broadcast comments to websocket clients")]
struct Cli {
    /// Custom data directory (defaults to ~/.comment-relay)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub account: Arc<AccountSource>,
    pub metrics: Arc<RelayMetrics>,
    /// Capacity of each websocket client's comment queue
    pub subscriber_queue: usize,
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(views::index_page))
        .route("/{live_id}", get(views::viewer_page))
        .route("/{live_id}/comment", get(ws::comment_socket_handler))
        .route("/api/sessions", get(handlers::sessions_handler))
        .route("/api/metrics", get(handlers::metrics_handler))
        .route("/health", get(handlers::health_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "relay=debug,nicolive=debug,tower_http=debug,info"
    } else {
        "relay=info,nicolive=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting comment relay");

    let dirs = RelayDirs::new(cli.data_dir)?;
    let file_config: FileConfig = config::load_config(&dirs.data_dir)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", dirs.config_toml_path().display()))?;

    let account = AccountSource::from_file(&file_config.account)?;
    info!("Upstream account: {}", account.describe());

    let session_config = file_config.session.to_session_config();
    let connector: Arc<dyn Connector> = Arc::new(HttpConnector::new(
        file_config.upstream.to_endpoints(),
        session_config.connect_timeout,
    ));
    let metrics = Arc::new(RelayMetrics::new());
    let registry = Arc::new(SessionRegistry::new(
        connector,
        session_config,
        metrics.clone(),
    ));

    let state = AppState {
        registry: registry.clone(),
        account: Arc::new(account),
        metrics,
        subscriber_queue: file_config.server.subscriber_queue,
    };
    let app = router(state);

    let host = cli.host.unwrap_or(file_config.server.host);
    let port = cli.port.unwrap_or(file_config.server.port);
    let addr = format!("{}:{}", host, port)
        .parse::<SocketAddr>()
        .with_context(|| format!("Invalid listen address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    info!("Comment relay listening on http://{}", actual_addr);
    info!("  GET /{{live_id}}          - Viewer page");
    info!("  GET /{{live_id}}/comment  - WebSocket comment stream");
    info!("  GET /api/sessions       - Active sessions");
    info!("  GET /api/metrics        - Relay metrics");

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal, cleaning up...");
    };

    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    info!("Closing upstream sessions...");
    registry.shutdown().await;

    info!("Shutdown complete");
    server_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::Upstream;
    use axum::{body::Body, http::Request, http::StatusCode};
    use nicolive::LiveId;
    use tower::ServiceExt;

    async fn get_body(app: Router, uri: &str) -> (StatusCode, String) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let upstream = Upstream::start().await;
        let (status, body) = get_body(router(upstream.app_state()), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["sessions"], 0);
    }

    #[tokio::test]
    async fn test_sessions_lists_active_sessions() {
        let upstream = Upstream::start().await;
        let state = upstream.app_state();
        let registry = state.registry.clone();
        let (subscriber, _feed) = crate::subscriber::ChannelSubscriber::new(4);
        registry
            .subscribe(&LiveId::parse("lv5").unwrap(), upstream.auth(), Arc::new(subscriber))
            .await
            .unwrap();

        let (status, body) = get_body(router(state.clone()), "/api/sessions").await;
        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        let sessions = json.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["live_id"], "lv5");
        assert_eq!(sessions[0]["subscribers"], 1);
        assert_eq!(sessions[0]["state"], "stream_open");

        let (_, body) = get_body(router(state), "/api/metrics").await;
        let json: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(json["sessions"]["active"], 1);
        assert_eq!(json["sessions"]["opened"], 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_viewer_page() {
        let upstream = Upstream::start().await;
        let (status, body) = get_body(router(upstream.app_state()), "/lv42").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"data-live-id="lv42""#));
        assert!(body.contains("new WebSocket"));
    }

    #[tokio::test]
    async fn test_viewer_page_rejects_bad_id() {
        let upstream = Upstream::start().await;
        let (status, body) = get_body(router(upstream.app_state()), "/sm123").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.contains("invalid live identifier"));
    }

    #[tokio::test]
    async fn test_index_page_empty() {
        let upstream = Upstream::start().await;
        let (status, body) = get_body(router(upstream.app_state()), "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("No broadcasts are being relayed"));
    }
}
