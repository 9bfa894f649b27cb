use crate::video::VideoReader;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressStyle};
use opencv::core::Mat;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessingStats {
    /// Frames handed to the processor.
    pub processed_frames: usize,
    /// Frames decoded or skipped, in total.
    pub seen_frames: usize,
    pub duration: Duration,
}

/// A trait for handling video frames. This separates the "how to process"
/// from the "how to read and orchestrate" logic.
pub trait FrameProcessor {
    fn process(&mut self, index: usize, frame: Mat) -> Result<()>;
}

/// Blanket implementation so any closure with the right signature
/// automatically implements FrameProcessor.
impl<F> FrameProcessor for F
where
    F: FnMut(usize, Mat) -> Result<()>,
{
    fn process(&mut self, index: usize, frame: Mat) -> Result<()> {
        self(index, frame)
    }
}

fn progress_bar(len: usize) -> Result<ProgressBar> {
    let pb = ProgressBar::new(len as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec:.1.yellow} fps, {eta})")?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// Walk every frame of `reader`, handing frame `i` to `processor` when
/// `i % stride == 0` and skipping the rest without conversion.
pub fn process_video<P>(
    reader: &mut dyn VideoReader,
    stride: usize,
    mut processor: P,
) -> Result<ProcessingStats>
where
    P: FrameProcessor,
{
    let stride = stride.max(1);
    let total_frames = reader.frame_count()?;
    let pb = progress_bar(total_frames.div_ceil(stride))?;
    let start_time = Instant::now();

    let mut index = 0usize;
    let mut processed_frames = 0usize;
    loop {
        if index % stride == 0 {
            let Some(frame) = reader.read_frame()? else {
                break;
            };
            processor.process(index, frame)?;
            processed_frames += 1;
            pb.inc(1);
        } else if !reader.skip_frame()? {
            break;
        }
        index += 1;
    }

    pb.finish_and_clear();

    Ok(ProcessingStats {
        processed_frames,
        seen_frames: index,
        duration: start_time.elapsed(),
    })
}
