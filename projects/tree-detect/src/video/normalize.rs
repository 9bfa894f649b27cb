//! Re-encode a video into a container/codec pair that browsers can play.

use crate::error::NormalizeError;
use crate::video::{open_reader, writer, writer::OpencvWriter, VideoBackend};
use opencv::{core::Size, prelude::*};
use serde::Serialize;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NormalizeReport {
    pub frames: usize,
    pub width: i32,
    pub height: i32,
    pub fps: f64,
    pub fourcc: String,
}

/// Transcode `src` into `dst`, keeping resolution, fps and every frame.
///
/// The codec follows the extension of `dst`. Reader and writer are dropped
/// (and so released) on every return path.
pub fn normalize_video(
    src: &Path,
    dst: &Path,
    backend: VideoBackend,
) -> Result<NormalizeReport, NormalizeError> {
    if writer::codecs_for(dst).is_none() {
        return Err(NormalizeError::UnsupportedContainer(dst.to_path_buf()));
    }

    let mut reader = open_reader(src, backend).map_err(|e| {
        tracing::warn!("Normalizer could not open {}: {:#}", src.display(), e);
        NormalizeError::SourceUnreadable(src.to_path_buf())
    })?;
    let fps = reader.source_fps().map_err(NormalizeError::Decode)?;
    let (header_w, header_h) = reader.frame_size().map_err(NormalizeError::Decode)?;

    let Some(first) = reader.read_frame().map_err(NormalizeError::Decode)? else {
        return Err(NormalizeError::EmptySource(src.to_path_buf()));
    };

    let (width, height) = if header_w > 0 && header_h > 0 {
        (header_w, header_h)
    } else {
        (first.cols(), first.rows())
    };

    if let Some(parent) = dst.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let mut out = OpencvWriter::create(dst, fps, Size::new(width, height)).map_err(|e| {
        tracing::warn!("{:#}", e);
        NormalizeError::WriterUnavailable(dst.to_path_buf())
    })?;
    let fourcc = out.fourcc().to_string();

    out.write(&first).map_err(NormalizeError::Decode)?;
    while let Some(frame) = reader.read_frame().map_err(NormalizeError::Decode)? {
        out.write(&frame).map_err(NormalizeError::Decode)?;
    }
    drop(reader);
    let frames = out.finish().map_err(NormalizeError::Decode)?;

    let written = std::fs::metadata(dst).map(|m| m.len()).unwrap_or(0);
    if frames == 0 || written == 0 {
        return Err(NormalizeError::NothingWritten(dst.to_path_buf()));
    }

    tracing::info!(
        "Normalized {} -> {} ({} frames, {}x{} @ {:.2} fps, {})",
        src.display(),
        dst.display(),
        frames,
        width,
        height,
        fps,
        fourcc
    );

    Ok(NormalizeReport {
        frames,
        width,
        height,
        fps,
        fourcc,
    })
}
