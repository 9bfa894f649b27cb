use crate::web::api::{detect_handler, download_handler, get_config, get_runs};
use crate::web::assets::{index_handler, static_handler};
use crate::web::AppState;
use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{info, warn};

/// Uploaded videos can be large.
const MAX_UPLOAD_BYTES: usize = 1024 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    let outputs = ServeDir::new(&state.workspace.output_root);

    Router::new()
        .route("/", get(index_handler))
        .route("/static/*path", get(static_handler))
        .route(
            "/api/detect",
            post(detect_handler).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/api/runs", get(get_runs))
        .route("/api/config", get(get_config))
        .route("/api/download", get(download_handler))
        .nest_service("/outputs", outputs)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let host = state.args.host;
    let mut current_port = state.args.port;
    let listener = loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                break listener;
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port
                    .checked_add(1)
                    .ok_or_else(|| anyhow::anyhow!("No available ports found"))?;
            }
        }
    };

    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "Tree detection server started on http://{}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app).await?;

    Ok(())
}
