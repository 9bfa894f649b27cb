pub mod api;
pub mod assets;
pub mod error;
pub mod server;

use crate::cli::Args;
use crate::pipeline::predictor::Predictor;
use crate::run_context::Workspace;

/// Shared by every handler.
pub struct AppState {
    pub args: Args,
    pub workspace: Workspace,
    pub predictor: Predictor,
}
