use anyhow::{anyhow, Result};
use opencv::{
    core::{Mat, Size},
    prelude::*,
    videoio::VideoWriter,
};
use std::path::{Path, PathBuf};

/// Codec candidates for a container, in preference order.
pub fn codecs_for(path: &Path) -> Option<&'static [[char; 4]]> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())?;
    match ext.as_str() {
        "mp4" | "m4v" | "mov" => Some(&[['a', 'v', 'c', '1'], ['m', 'p', '4', 'v']]),
        "avi" => Some(&[['M', 'J', 'P', 'G'], ['X', 'V', 'I', 'D']]),
        "mkv" => Some(&[['a', 'v', 'c', '1'], ['X', 'V', 'I', 'D']]),
        "webm" => Some(&[['V', 'P', '8', '0']]),
        _ => None,
    }
}

/// A `cv::VideoWriter` that is released on drop, so partial output is
/// always flushed and the file handle closed.
pub struct OpencvWriter {
    writer: VideoWriter,
    path: PathBuf,
    fourcc: String,
    frames_written: usize,
}

impl OpencvWriter {
    /// Open a writer for `path`, trying each codec the container supports.
    pub fn create(path: &Path, fps: f64, size: Size) -> Result<Self> {
        let codecs = codecs_for(path)
            .ok_or_else(|| anyhow!("Unsupported video container: {}", path.display()))?;
        let path_str = path
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 video path: {:?}", path))?;

        for code in codecs {
            let fourcc = VideoWriter::fourcc(code[0], code[1], code[2], code[3])?;
            let writer = VideoWriter::new(path_str, fourcc, fps, size, true)?;
            if writer.is_opened()? {
                let fourcc: String = code.iter().collect();
                tracing::info!(
                    "Opened video writer {} ({}x{} @ {:.2} fps, {})",
                    path_str,
                    size.width,
                    size.height,
                    fps,
                    fourcc
                );
                return Ok(Self {
                    writer,
                    path: path.to_path_buf(),
                    fourcc,
                    frames_written: 0,
                });
            }
            tracing::debug!("Codec {:?} unavailable for {}", code, path_str);
        }

        Err(anyhow!("No codec could open a writer for {}", path_str))
    }

    pub fn write(&mut self, frame: &Mat) -> Result<()> {
        self.writer.write(frame)?;
        self.frames_written += 1;
        Ok(())
    }

    pub fn fourcc(&self) -> &str {
        &self.fourcc
    }

    /// Release the writer now and report how many frames went in.
    pub fn finish(mut self) -> Result<usize> {
        self.writer.release()?;
        Ok(self.frames_written)
    }
}

impl Drop for OpencvWriter {
    fn drop(&mut self) {
        // release() is idempotent, so a prior finish() makes this a no-op
        if let Err(e) = self.writer.release() {
            tracing::warn!("Failed to release writer for {}: {}", self.path.display(), e);
        }
    }
}
