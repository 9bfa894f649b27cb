//! Runs the shared detector over an image, a video, or a folder of either,
//! and writes annotated copies into a run directory.

use crate::error::DetectError;
use crate::pipeline::annotate::draw_detections;
use crate::pipeline::detection::{Detector, SharedDetector};
use crate::pipeline::types::{Detection, MediaKind};
use crate::video::processor::process_video;
use crate::video::writer::OpencvWriter;
use crate::video::{open_reader, VideoBackend};
use anyhow::anyhow;
use opencv::core::{Mat, Size, Vector};
use opencv::imgcodecs;
use opencv::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Extension of the raw annotated video written for each video input.
pub const RAW_VIDEO_EXT: &str = "avi";

#[derive(Debug, Clone)]
pub struct PredictOptions {
    pub conf: f32,
    pub save: bool,
    pub project: PathBuf,
    pub name: String,
    pub vid_stride: usize,
}

impl PredictOptions {
    pub fn validate(&self) -> Result<(), DetectError> {
        if !(0.0..=1.0).contains(&self.conf) {
            return Err(DetectError::InvalidOptions(format!(
                "conf must be within [0, 1], got {}",
                self.conf
            )));
        }
        if self.vid_stride == 0 {
            return Err(DetectError::InvalidOptions(
                "vid_stride must be at least 1".to_string(),
            ));
        }
        let name = Path::new(&self.name);
        if self.name.is_empty() || name.components().count() != 1 || name.is_absolute() {
            return Err(DetectError::InvalidOptions(format!(
                "run name must be a single path component, got {:?}",
                self.name
            )));
        }
        Ok(())
    }

    pub fn run_dir(&self) -> PathBuf {
        self.project.join(&self.name)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictedItem {
    pub source: PathBuf,
    pub file_name: String,
    pub kind: MediaKind,
    /// Annotated artifact, when saving was requested.
    pub output: Option<PathBuf>,
    /// Frames handed to the detector (1 for images).
    pub frames: usize,
    pub detection_count: usize,
    /// Per-box results; only kept for images.
    pub detections: Vec<Detection>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub run_dir: PathBuf,
    pub items: Vec<PredictedItem>,
}

impl Prediction {
    /// The result produced for the input called `file_name`.
    pub fn item_for(&self, file_name: &str) -> Result<&PredictedItem, DetectError> {
        self.items
            .iter()
            .find(|item| item.file_name == file_name)
            .ok_or_else(|| DetectError::ResultMissing(file_name.to_string()))
    }
}

fn file_name_of(path: &Path) -> Result<String, DetectError> {
    path.file_name()
        .and_then(|s| s.to_str())
        .map(str::to_string)
        .ok_or_else(|| DetectError::UnsupportedFile(path.to_path_buf()))
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Where the annotated copy of each input lands inside `run_dir`.
///
/// Images keep their file name. Videos become `<stem>.avi`; when two videos
/// share a stem (`clip.mp4`, `clip.mov`) the source extension is folded in
/// (`clip_mp4.avi`, `clip_mov.avi`). Inputs that would still collide are
/// rejected.
pub fn plan_outputs(
    run_dir: &Path,
    inputs: &[(PathBuf, MediaKind)],
) -> Result<Vec<PathBuf>, DetectError> {
    let mut video_stems: HashMap<String, usize> = HashMap::new();
    for (path, kind) in inputs {
        if *kind == MediaKind::Video {
            *video_stems.entry(stem_of(path)).or_default() += 1;
        }
    }

    let mut claimed: HashMap<PathBuf, &Path> = HashMap::new();
    let mut outputs = Vec::with_capacity(inputs.len());
    for (path, kind) in inputs {
        let output = match kind {
            MediaKind::Image => run_dir.join(file_name_of(path)?),
            MediaKind::Video => {
                let stem = stem_of(path);
                let name = if video_stems.get(&stem).copied().unwrap_or(0) > 1 {
                    let ext = path
                        .extension()
                        .map(|e| e.to_string_lossy().to_lowercase())
                        .unwrap_or_default();
                    format!("{}_{}", stem, ext)
                } else {
                    stem
                };
                run_dir.join(format!("{}.{}", name, RAW_VIDEO_EXT))
            }
        };
        if let Some(other) = claimed.insert(output.clone(), path) {
            return Err(DetectError::InvalidOptions(format!(
                "{} and {} would both be written to {}",
                other.display(),
                path.display(),
                output.display()
            )));
        }
        outputs.push(output);
    }
    Ok(outputs)
}

/// Expand `source` into the list of inputs to run, without touching the disk.
pub fn resolve_source(source: &Path) -> Result<Vec<(PathBuf, MediaKind)>, DetectError> {
    if !source.exists() {
        return Err(DetectError::SourceNotFound(source.to_path_buf()));
    }

    if source.is_file() {
        let kind = MediaKind::from_path(source)
            .ok_or_else(|| DetectError::UnsupportedFile(source.to_path_buf()))?;
        return Ok(vec![(source.to_path_buf(), kind)]);
    }

    let inputs: Vec<(PathBuf, MediaKind)> = WalkDir::new(source)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| MediaKind::from_path(e.path()).map(|k| (e.path().to_path_buf(), k)))
        .collect();

    if inputs.is_empty() {
        return Err(DetectError::EmptySource(source.to_path_buf()));
    }
    Ok(inputs)
}

pub struct Predictor {
    detector: SharedDetector,
    backend: VideoBackend,
}

impl Predictor {
    pub fn new(detector: SharedDetector, backend: VideoBackend) -> Self {
        Self { detector, backend }
    }

    pub fn predict(&self, source: &Path, opts: &PredictOptions) -> Result<Prediction, DetectError> {
        opts.validate()?;
        let inputs = resolve_source(source)?;

        let run_dir = opts.run_dir();
        let outputs = plan_outputs(&run_dir, &inputs)?;
        if opts.save {
            fs::create_dir_all(&run_dir)?;
        }

        // One forward pass at a time; the lock is held for the whole call.
        // A panic in an earlier call poisons the lock but leaves the model usable.
        let mut guard = self.detector.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Detection model lock was poisoned by an earlier panic; recovering");
            poisoned.into_inner()
        });
        let detector: &mut dyn Detector = &mut **guard;

        tracing::info!(
            "Running detection on {} input(s) from {} (conf={}, vid_stride={}, save={})",
            inputs.len(),
            source.display(),
            opts.conf,
            opts.vid_stride,
            opts.save
        );

        let mut items = Vec::with_capacity(inputs.len());
        for ((path, kind), planned) in inputs.into_iter().zip(outputs) {
            let file_name = file_name_of(&path)?;
            let output = opts.save.then_some(planned);

            let item = match kind {
                MediaKind::Image => {
                    predict_image(detector, &path, &file_name, output.as_deref(), opts.conf)?
                }
                MediaKind::Video => predict_video(
                    detector,
                    &path,
                    &file_name,
                    output.as_deref(),
                    opts,
                    self.backend,
                )?,
            };

            if let Some(out) = &item.output {
                if !out.is_file() {
                    return Err(DetectError::ResultMissing(file_name));
                }
            }
            items.push(item);
        }

        Ok(Prediction { run_dir, items })
    }
}

fn path_str(path: &Path) -> Result<&str, DetectError> {
    path.to_str()
        .ok_or_else(|| DetectError::inference(anyhow!("Non UTF-8 path: {:?}", path)))
}

fn predict_image(
    detector: &mut dyn Detector,
    path: &Path,
    file_name: &str,
    output: Option<&Path>,
    conf: f32,
) -> Result<PredictedItem, DetectError> {
    let mut frame = imgcodecs::imread(path_str(path)?, imgcodecs::IMREAD_COLOR)
        .map_err(DetectError::inference)?;
    if frame.empty() {
        return Err(DetectError::inference(anyhow!(
            "Failed to decode image {}",
            path.display()
        )));
    }

    let detections = detector
        .detect(&frame, conf)
        .map_err(DetectError::Inference)?;
    tracing::debug!("{}: {} detection(s)", file_name, detections.len());

    if let Some(out) = output {
        draw_detections(&mut frame, &detections).map_err(DetectError::Inference)?;
        let ok = imgcodecs::imwrite(path_str(out)?, &frame, &Vector::new())
            .map_err(DetectError::inference)?;
        if !ok {
            return Err(DetectError::inference(anyhow!(
                "Failed to write {}",
                out.display()
            )));
        }
    }

    Ok(PredictedItem {
        source: path.to_path_buf(),
        file_name: file_name.to_string(),
        kind: MediaKind::Image,
        output: output.map(Path::to_path_buf),
        frames: 1,
        detection_count: detections.len(),
        detections,
    })
}

fn predict_video(
    detector: &mut dyn Detector,
    path: &Path,
    file_name: &str,
    output: Option<&Path>,
    opts: &PredictOptions,
    backend: VideoBackend,
) -> Result<PredictedItem, DetectError> {
    let mut reader = open_reader(path, backend).map_err(DetectError::Inference)?;
    let fps = reader.source_fps().map_err(DetectError::Inference)?;
    let (width, height) = reader.frame_size().map_err(DetectError::Inference)?;

    // Only every n-th frame is kept, so the output plays at the reduced rate.
    let out_fps = fps / opts.vid_stride as f64;
    let mut writer = output
        .map(|out| OpencvWriter::create(out, out_fps, Size::new(width, height)))
        .transpose()
        .map_err(DetectError::Inference)?;

    let conf = opts.conf;
    let mut detection_count = 0usize;
    let stats = process_video(
        reader.as_mut(),
        opts.vid_stride,
        |_index: usize, mut frame: Mat| -> anyhow::Result<()> {
            let detections = detector.detect(&frame, conf)?;
            detection_count += detections.len();
            if let Some(w) = writer.as_mut() {
                draw_detections(&mut frame, &detections)?;
                w.write(&frame)?;
            }
            Ok(())
        },
    )
    .map_err(DetectError::Inference)?;
    drop(reader);

    if let Some(w) = writer {
        w.finish().map_err(DetectError::Inference)?;
    }

    tracing::info!(
        "{}: {} of {} frame(s) processed in {:.2?}, {} detection(s)",
        file_name,
        stats.processed_frames,
        stats.seen_frames,
        stats.duration,
        detection_count
    );

    if stats.processed_frames == 0 {
        return Err(DetectError::inference(anyhow!(
            "No frames could be decoded from {}",
            path.display()
        )));
    }

    Ok(PredictedItem {
        source: path.to_path_buf(),
        file_name: file_name.to_string(),
        kind: MediaKind::Video,
        output: output.map(Path::to_path_buf),
        frames: stats.processed_frames,
        detection_count,
        detections: Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::detection::shared;
    use crate::pipeline::types::BBox;
    use crate::video::opencv_reader::OpencvReader;
    use crate::video::VideoReader;
    use opencv::core::{Scalar, CV_8UC3};
    use opencv::prelude::*;
    use std::sync::{Arc, Mutex};

    /// Returns one box at confidence 0.5 per frame and records every threshold it sees.
    struct RecordingDetector {
        seen: Arc<Mutex<Vec<f32>>>,
    }

    impl Detector for RecordingDetector {
        fn detect(&mut self, frame: &Mat, min_conf: f32) -> anyhow::Result<Vec<Detection>> {
            self.seen.lock().unwrap().push(min_conf);
            let d = Detection {
                bbox: BBox {
                    x: 2.0,
                    y: 2.0,
                    w: (frame.cols() / 2) as f32,
                    h: (frame.rows() / 2) as f32,
                },
                confidence: 0.5,
                class_id: Some(0),
                class_name: Some("tree".into()),
            };
            Ok(if d.confidence >= min_conf { vec![d] } else { vec![] })
        }
    }

    fn predictor() -> (Predictor, Arc<Mutex<Vec<f32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let detector = shared(RecordingDetector { seen: seen.clone() });
        (Predictor::new(detector, VideoBackend::Opencv), seen)
    }

    fn options(project: &Path) -> PredictOptions {
        PredictOptions {
            conf: 0.25,
            save: true,
            project: project.to_path_buf(),
            name: "run".to_string(),
            vid_stride: 1,
        }
    }

    fn write_image(path: &Path) {
        let img = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(90.0)).unwrap();
        assert!(imgcodecs::imwrite(path.to_str().unwrap(), &img, &Vector::new()).unwrap());
    }

    fn write_video(path: &Path, frames: usize) {
        let mut w = OpencvWriter::create(path, 10.0, Size::new(64, 48)).unwrap();
        for i in 0..frames {
            let f = Mat::new_rows_cols_with_default(48, 64, CV_8UC3, Scalar::all(i as f64 * 30.0))
                .unwrap();
            w.write(&f).unwrap();
        }
        w.finish().unwrap();
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn image_yields_one_output_with_the_same_name() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree.jpg");
        write_image(&src);
        let project = dir.path().join("results");

        let (p, seen) = predictor();
        let prediction = p.predict(&src, &options(&project)).unwrap();

        assert_eq!(prediction.run_dir, project.join("run"));
        assert_eq!(dir_entries(&prediction.run_dir), vec!["tree.jpg"]);
        let item = prediction.item_for("tree.jpg").unwrap();
        assert_eq!(item.output.as_deref(), Some(project.join("run/tree.jpg").as_path()));
        assert_eq!(item.detection_count, 1);
        assert_eq!(*seen.lock().unwrap(), vec![0.25]);
    }

    #[test]
    fn missing_source_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("results");
        let (p, seen) = predictor();

        let err = p
            .predict(&dir.path().join("nope.jpg"), &options(&project))
            .unwrap_err();
        assert!(matches!(err, DetectError::SourceNotFound(_)));
        assert!(err.is_invalid_input());
        assert!(!project.exists());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn threshold_is_passed_through_and_run_dir_is_reused() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree.png");
        write_image(&src);
        let project = dir.path().join("results");
        let (p, seen) = predictor();

        let low = p.predict(&src, &options(&project)).unwrap();
        let mut strict = options(&project);
        strict.conf = 0.9;
        let high = p.predict(&src, &strict).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.9]);
        assert_eq!(low.run_dir, high.run_dir);
        assert_eq!(
            low.item_for("tree.png").unwrap().output,
            high.item_for("tree.png").unwrap().output
        );
        assert_eq!(high.item_for("tree.png").unwrap().detection_count, 0);
        assert_eq!(dir_entries(&high.run_dir), vec!["tree.png"]);
    }

    #[test]
    fn directory_maps_each_input_to_its_own_output() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("batch");
        fs::create_dir_all(&folder).unwrap();
        write_image(&folder.join("b.png"));
        write_image(&folder.join("a.jpg"));
        fs::write(folder.join("notes.txt"), "ignored").unwrap();
        let project = dir.path().join("results");
        let (p, _) = predictor();

        let prediction = p.predict(&folder, &options(&project)).unwrap();

        let names: Vec<&str> = prediction.items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, vec!["a.jpg", "b.png"]);
        for name in ["a.jpg", "b.png"] {
            let item = prediction.item_for(name).unwrap();
            assert_eq!(item.output.as_deref(), Some(prediction.run_dir.join(name).as_path()));
        }
        assert!(matches!(
            prediction.item_for("notes.txt"),
            Err(DetectError::ResultMissing(_))
        ));
    }

    #[test]
    fn unsupported_files_and_empty_folders_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let txt = dir.path().join("notes.txt");
        fs::write(&txt, "x").unwrap();
        let empty = dir.path().join("empty");
        fs::create_dir_all(&empty).unwrap();
        let (p, _) = predictor();
        let opts = options(&dir.path().join("results"));

        assert!(matches!(
            p.predict(&txt, &opts),
            Err(DetectError::UnsupportedFile(_))
        ));
        assert!(matches!(
            p.predict(&empty, &opts),
            Err(DetectError::EmptySource(_))
        ));
    }

    #[test]
    fn invalid_options_are_rejected_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree.jpg");
        write_image(&src);
        let (p, seen) = predictor();

        let mut opts = options(&dir.path().join("results"));
        opts.vid_stride = 0;
        assert!(matches!(
            p.predict(&src, &opts),
            Err(DetectError::InvalidOptions(_))
        ));
        let mut opts = options(&dir.path().join("results"));
        opts.conf = 1.5;
        assert!(p.predict(&src, &opts).is_err());
        let mut opts = options(&dir.path().join("results"));
        opts.name = "../escape".into();
        assert!(p.predict(&src, &opts).is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn save_false_writes_nothing_but_still_detects() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree.jpg");
        write_image(&src);
        let project = dir.path().join("results");
        let (p, _) = predictor();

        let mut opts = options(&project);
        opts.save = false;
        let prediction = p.predict(&src, &opts).unwrap();

        assert!(!project.exists());
        let item = prediction.item_for("tree.jpg").unwrap();
        assert!(item.output.is_none());
        assert_eq!(item.detections.len(), 1);
    }

    #[test]
    fn directory_videos_with_same_stem_get_distinct_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let folder = dir.path().join("clips");
        fs::create_dir_all(&folder).unwrap();
        write_video(&folder.join("clip.avi"), 2);
        // Same MJPEG/AVI payload under another video extension; the decoder
        // reads the container, not the name.
        fs::copy(folder.join("clip.avi"), folder.join("clip.mov")).unwrap();
        let project = dir.path().join("results");
        let (p, _) = predictor();

        let prediction = p.predict(&folder, &options(&project)).unwrap();

        let avi = prediction.item_for("clip.avi").unwrap().output.clone().unwrap();
        let mov = prediction.item_for("clip.mov").unwrap().output.clone().unwrap();
        assert_eq!(avi, prediction.run_dir.join("clip_avi.avi"));
        assert_eq!(mov, prediction.run_dir.join("clip_mov.avi"));
        assert_eq!(
            dir_entries(&prediction.run_dir),
            vec!["clip_avi.avi", "clip_mov.avi"]
        );
    }

    #[test]
    fn output_plan_keeps_unique_stems_and_dotted_names() {
        let run = Path::new("run");
        let inputs = vec![
            (PathBuf::from("in/my.clip.mp4"), MediaKind::Video),
            (PathBuf::from("in/tree.jpg"), MediaKind::Image),
        ];
        let outputs = plan_outputs(run, &inputs).unwrap();
        assert_eq!(outputs, vec![run.join("my.clip.avi"), run.join("tree.jpg")]);
    }

    #[test]
    fn output_plan_rejects_collisions_it_cannot_rename() {
        let run = Path::new("run");
        // `clip.mp4` + `clip.MP4` both fold to `clip_mp4.avi`.
        let inputs = vec![
            (PathBuf::from("in/clip.MP4"), MediaKind::Video),
            (PathBuf::from("in/clip.mp4"), MediaKind::Video),
        ];
        assert!(matches!(
            plan_outputs(run, &inputs),
            Err(DetectError::InvalidOptions(_))
        ));
    }

    #[test]
    fn a_panicking_request_does_not_poison_later_ones() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("tree.jpg");
        write_image(&src);
        let (p, seen) = predictor();

        let detector = p.detector.clone();
        let crashed = std::thread::spawn(move || {
            let _guard = detector.lock().unwrap();
            panic!("model crashed mid-request");
        })
        .join();
        assert!(crashed.is_err());
        assert!(p.detector.is_poisoned());

        let prediction = p.predict(&src, &options(&dir.path().join("results"))).unwrap();
        assert_eq!(prediction.items.len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![0.25]);
    }

    #[test]
    fn video_stride_keeps_every_other_frame() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("clip.avi");
        write_video(&src, 6);
        let project = dir.path().join("results");
        let (p, seen) = predictor();

        let mut opts = options(&project);
        opts.vid_stride = 2;
        let prediction = p.predict(&src, &opts).unwrap();

        let item = prediction.item_for("clip.avi").unwrap();
        assert_eq!(item.kind, MediaKind::Video);
        assert_eq!(item.frames, 3);
        assert_eq!(seen.lock().unwrap().len(), 3);

        let out = item.output.clone().unwrap();
        assert_eq!(out, project.join("run").join("clip.avi"));
        let mut reader = OpencvReader::new(&out).unwrap();
        let mut written = 0;
        while reader.read_frame().unwrap().is_some() {
            written += 1;
        }
        assert_eq!(written, 3);
        assert!((reader.source_fps().unwrap() - 5.0).abs() < 0.01);
    }
}
