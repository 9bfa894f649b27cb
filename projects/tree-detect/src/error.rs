//! Error types for the detection and re-encode boundaries.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while resolving input and running detection.
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("Please upload an image or provide a valid folder path.")]
    MissingInput,

    #[error("Source not found: {0}")]
    SourceNotFound(PathBuf),

    #[error("Unsupported file type: {0}")]
    UnsupportedFile(PathBuf),

    #[error("No supported images or videos found in {0}")]
    EmptySource(PathBuf),

    #[error("Invalid options: {0}")]
    InvalidOptions(String),

    #[error("Result not found for {0}. Check the model output path.")]
    ResultMissing(String),

    #[error("Detection failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DetectError {
    pub fn inference(err: impl Into<anyhow::Error>) -> Self {
        Self::Inference(err.into())
    }

    /// True for errors caused by the request rather than the model or host.
    pub fn is_invalid_input(&self) -> bool {
        matches!(
            self,
            Self::MissingInput
                | Self::SourceNotFound(_)
                | Self::UnsupportedFile(_)
                | Self::EmptySource(_)
                | Self::InvalidOptions(_)
                | Self::ResultMissing(_)
        )
    }
}

/// Errors raised by the video normalizer.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Cannot open video for reading: {0}")]
    SourceUnreadable(PathBuf),

    #[error("Video has no frames: {0}")]
    EmptySource(PathBuf),

    #[error("Unsupported output container: {0}")]
    UnsupportedContainer(PathBuf),

    #[error("Cannot open video writer for {0}")]
    WriterUnavailable(PathBuf),

    #[error("No frames were transcoded into {0}")]
    NothingWritten(PathBuf),

    #[error("Decode failed: {0:#}")]
    Decode(anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
