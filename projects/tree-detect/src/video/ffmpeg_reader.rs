use super::VideoReader;
use anyhow::{anyhow, Context, Result};
use ffmpeg_next::ffi;
use opencv::{core, prelude::*};
use std::path::Path;

/// Video reader backed by FFmpeg via ffmpeg-next, decoding on the CPU and
/// converting every frame to BGR24.
pub struct FfmpegReader {
    input_ctx: ffmpeg_next::format::context::Input,
    decoder: ffmpeg_next::codec::decoder::Video,
    video_stream_index: usize,
    /// Lazily created on first frame (source pixel format is only known then).
    scaler: Option<ffmpeg_next::software::scaling::Context>,
    width: u32,
    height: u32,
    source_fps: f64,
    total_frames: usize,
    reuse_packet: ffmpeg_next::codec::packet::Packet,
    eof_sent: bool,
}

// SAFETY: a reader is owned by exactly one thread at a time; the raw
// pointers inside ffmpeg-next types are never shared.
unsafe impl Send for FfmpegReader {}

impl FfmpegReader {
    pub fn new(path: &Path) -> Result<Self> {
        ffmpeg_next::init().context("Failed to initialize FFmpeg")?;

        if !path.exists() {
            return Err(anyhow!("Video file not found: {}", path.display()));
        }

        let input_ctx = ffmpeg_next::format::input(&path).context("Failed to open video file")?;

        let video_stream = input_ctx
            .streams()
            .best(ffmpeg_next::media::Type::Video)
            .ok_or_else(|| anyhow!("No video stream found in {}", path.display()))?;

        let video_stream_index = video_stream.index();

        let rational_fps = video_stream.avg_frame_rate();
        let source_fps = if rational_fps.denominator() > 0 && rational_fps.numerator() > 0 {
            rational_fps.numerator() as f64 / rational_fps.denominator() as f64
        } else {
            tracing::warn!("FfmpegReader: could not determine FPS, defaulting to 30.0");
            30.0
        };

        let stream_frames = video_stream.frames().max(0) as usize;
        let duration_secs = input_ctx.duration().max(0) as f64 / ffi::AV_TIME_BASE as f64;
        let total_frames = if stream_frames == 0 {
            (duration_secs * source_fps).round() as usize
        } else {
            stream_frames
        };

        let decoder_ctx =
            ffmpeg_next::codec::context::Context::from_parameters(video_stream.parameters())
                .context("Failed to create decoder context")?;
        let decoder = decoder_ctx
            .decoder()
            .video()
            .context("Failed to open video decoder")?;

        let width = decoder.width();
        let height = decoder.height();

        tracing::info!(
            "FfmpegReader: opened {}, {}x{}, duration={:.2}s, fps={:.2}, frames={}",
            path.display(),
            width,
            height,
            duration_secs,
            source_fps,
            total_frames
        );

        Ok(Self {
            input_ctx,
            decoder,
            video_stream_index,
            scaler: None,
            width,
            height,
            source_fps,
            total_frames,
            reuse_packet: ffmpeg_next::codec::packet::Packet::empty(),
            eof_sent: false,
        })
    }

    /// Pull the next decoded frame, feeding packets as needed.
    /// Returns `false` once the decoder is fully drained.
    fn decode_next(&mut self, target: &mut ffmpeg_next::util::frame::Video) -> Result<bool> {
        loop {
            match self.decoder.receive_frame(target) {
                Ok(()) => return Ok(true),
                Err(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }) => {
                    if self.eof_sent {
                        return Ok(false);
                    }
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(false),
                Err(e) => return Err(anyhow!("Decoder error: {}", e)),
            }

            let mut found_packet = false;
            while self.reuse_packet.read(&mut self.input_ctx).is_ok() {
                if self.reuse_packet.stream() == self.video_stream_index {
                    self.decoder
                        .send_packet(&self.reuse_packet)
                        .context("Failed to send packet to decoder")?;
                    found_packet = true;
                    break;
                }
            }

            if !found_packet {
                // End of input: flush whatever the decoder still holds.
                self.decoder
                    .send_eof()
                    .context("Failed to send EOF to decoder")?;
                self.eof_sent = true;
            }
        }
    }

    fn get_or_create_scaler(
        &mut self,
        src_format: ffmpeg_next::format::Pixel,
    ) -> Result<&mut ffmpeg_next::software::scaling::Context> {
        if self.scaler.is_none() {
            let scaler = ffmpeg_next::software::scaling::Context::get(
                src_format,
                self.width,
                self.height,
                ffmpeg_next::format::Pixel::BGR24,
                self.width,
                self.height,
                ffmpeg_next::software::scaling::Flags::BILINEAR,
            )
            .context("Failed to create scaler")?;
            self.scaler = Some(scaler);
        }
        self.scaler
            .as_mut()
            .ok_or_else(|| anyhow!("Scaler unavailable"))
    }
}

/// Deep-copy a BGR24 ffmpeg frame into an owned OpenCV Mat.
fn bgr_frame_to_mat(frame: &ffmpeg_next::util::frame::Video) -> Result<core::Mat> {
    let width = frame.width() as i32;
    let height = frame.height() as i32;
    let data = frame.data(0);
    let stride = frame.stride(0);
    let row_bytes = width as usize * 3;

    let mut mat = core::Mat::new_rows_cols_with_default(
        height,
        width,
        core::CV_8UC3,
        core::Scalar::all(0.0),
    )?;

    // A freshly allocated Mat is continuous, so rows are packed back to back.
    let dst = mat.data_bytes_mut()?;
    for y in 0..height as usize {
        let src_offset = y * stride;
        let src_row = &data[src_offset..src_offset + row_bytes];
        dst[y * row_bytes..(y + 1) * row_bytes].copy_from_slice(src_row);
    }

    Ok(mat)
}

impl VideoReader for FfmpegReader {
    fn frame_count(&self) -> Result<usize> {
        Ok(self.total_frames)
    }

    fn source_fps(&self) -> Result<f64> {
        Ok(self.source_fps)
    }

    fn frame_size(&self) -> Result<(i32, i32)> {
        Ok((self.width as i32, self.height as i32))
    }

    fn read_frame(&mut self) -> Result<Option<core::Mat>> {
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        if !self.decode_next(&mut raw)? {
            return Ok(None);
        }

        let scaler = self.get_or_create_scaler(raw.format())?;
        let mut bgr = ffmpeg_next::util::frame::Video::empty();
        scaler.run(&raw, &mut bgr).context("Scaler failed")?;

        Ok(Some(bgr_frame_to_mat(&bgr)?))
    }

    fn skip_frame(&mut self) -> Result<bool> {
        let mut raw = ffmpeg_next::util::frame::Video::empty();
        self.decode_next(&mut raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::normalize::normalize_video;
    use crate::video::processor::process_video;
    use crate::video::writer::OpencvWriter;
    use crate::video::VideoBackend;
    use opencv::core::{Mat, Scalar, Size, CV_8UC3};
    use opencv::prelude::*;

    fn write_clip(path: &Path, frames: usize) {
        let mut w = OpencvWriter::create(path, 10.0, Size::new(64, 48)).unwrap();
        assert_eq!(w.fourcc(), "MJPG");
        for i in 0..frames {
            let f = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(i as f64 * 40.0))
                .unwrap();
            w.write(&f).unwrap();
        }
        w.finish().unwrap();
    }

    #[test]
    fn decodes_every_frame_as_bgr() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.avi");
        write_clip(&src, 6);

        let mut reader = FfmpegReader::new(&src).unwrap();
        assert_eq!(reader.frame_size().unwrap(), (64, 48));
        assert!((reader.source_fps().unwrap() - 10.0).abs() < 0.01);

        let mut frames = 0;
        while let Some(frame) = reader.read_frame().unwrap() {
            assert_eq!((frame.cols(), frame.rows()), (64, 48));
            assert_eq!(frame.typ(), CV_8UC3);
            frames += 1;
        }
        assert_eq!(frames, 6);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn stride_two_skips_without_decoding_to_mats() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.avi");
        write_clip(&src, 6);

        let mut reader = FfmpegReader::new(&src).unwrap();
        let mut picked = Vec::new();
        let stats = process_video(&mut reader, 2, |i: usize, _: Mat| -> Result<()> {
            picked.push(i);
            Ok(())
        })
        .unwrap();
        assert_eq!(picked, vec![0, 2, 4]);
        assert_eq!(stats.processed_frames, 3);
        assert_eq!(stats.seen_frames, 6);
    }

    #[test]
    fn normalizes_through_the_ffmpeg_backend() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("raw.avi");
        write_clip(&src, 6);

        let dst = dir.path().join("out").join("clip.avi");
        let report = normalize_video(&src, &dst, VideoBackend::Ffmpeg).unwrap();
        assert_eq!(report.frames, 6);
        assert_eq!((report.width, report.height), (64, 48));
        assert!((report.fps - 10.0).abs() < 0.01);

        let mut reread = FfmpegReader::new(&dst).unwrap();
        let mut frames = 0;
        while reread.read_frame().unwrap().is_some() {
            frames += 1;
        }
        assert_eq!(frames, 6);
    }

    #[test]
    fn missing_file_is_an_error() {
        let err = FfmpegReader::new(Path::new("/no/such/clip.avi")).err().unwrap();
        assert!(err.to_string().contains("Video file not found"));
    }
}
