pub mod ffmpeg_reader;
pub mod normalize;
pub mod opencv_reader;
pub mod processor;
pub mod writer;

use anyhow::Result;
use clap::ValueEnum;
use opencv::core::Mat;
use std::path::Path;

use ffmpeg_reader::FfmpegReader;
use opencv_reader::OpencvReader;

/// Frame-sequential video source. Frames are BGR `Mat`s.
pub trait VideoReader: Send {
    fn frame_count(&self) -> Result<usize>;
    fn source_fps(&self) -> Result<f64>;
    /// (width, height) as reported by the stream header.
    fn frame_size(&self) -> Result<(i32, i32)>;
    /// Decode the next frame; `None` at end of stream.
    fn read_frame(&mut self) -> Result<Option<Mat>>;
    /// Advance past the next frame without converting it; `false` at end of stream.
    fn skip_frame(&mut self) -> Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VideoBackend {
    Opencv,
    Ffmpeg,
}

pub fn open_reader(path: &Path, backend: VideoBackend) -> Result<Box<dyn VideoReader>> {
    let reader: Box<dyn VideoReader> = match backend {
        VideoBackend::Opencv => Box::new(OpencvReader::new(path)?),
        VideoBackend::Ffmpeg => Box::new(FfmpegReader::new(path)?),
    };
    Ok(reader)
}
