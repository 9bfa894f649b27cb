mod cli;
mod error;
mod pipeline;
mod run_context;
mod video;
mod web;

use anyhow::{Context, Result};
use cli::Args;
use pipeline::detection::{shared, UslsDetector};
use pipeline::predictor::Predictor;
use run_context::Workspace;
use std::sync::Arc;
use web::{server::run_server, AppState};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::fmt::init();

    let args = Args::parse_args();

    let workspace = Workspace::from_args(&args);
    workspace.prepare().context("Failed to create working directories")?;

    let detector = UslsDetector::new(&args.model, args.force_cpu)
        .with_context(|| format!("Failed to load model {}", args.model.display()))?;
    tracing::info!(
        "Model ready (force_cpu={}, video_backend={:?})",
        args.force_cpu,
        args.video_backend
    );
    let predictor = Predictor::new(shared(detector), args.video_backend);

    let state = Arc::new(AppState {
        args,
        workspace,
        predictor,
    });

    run_server(state).await?;

    Ok(())
}
