use crate::pipeline::types::{BBox, Detection};
use anyhow::{anyhow, Result};
use image::{DynamicImage, ImageBuffer, Rgb};
use opencv::core::Mat;
use opencv::prelude::*;
use std::path::Path;
use std::sync::{Arc, Mutex};
use usls::models::RTDETR;
use usls::{Config, Image};

/// The detection routine. Implementations need `&mut self` for a forward pass.
pub trait Detector {
    /// Detect objects in a BGR frame, keeping only those at or above `min_conf`.
    fn detect(&mut self, frame: &Mat, min_conf: f32) -> Result<Vec<Detection>>;
}

/// Model handle loaded once in `main` and shared by every request.
pub type SharedDetector = Arc<Mutex<Box<dyn Detector + Send>>>;

pub fn shared(detector: impl Detector + Send + 'static) -> SharedDetector {
    Arc::new(Mutex::new(Box::new(detector)))
}

/// A wrapper around the USLS RT-DETR model that handles BGR-to-RGB conversion
/// and corrects for aspect-ratio padding bugs in the underlying model library.
pub struct UslsDetector {
    model: RTDETR,
}

impl UslsDetector {
    pub fn new(model_path: &Path, force_cpu: bool) -> Result<Self> {
        if !model_path.exists() {
            return Err(anyhow!("Model file not found: {}", model_path.display()));
        }
        let model_file = model_path
            .to_str()
            .ok_or_else(|| anyhow!("Non UTF-8 model path: {:?}", model_path))?;

        let config = Config::default()
            .with_model_file(model_file)
            .with_class_names(&usls::NAMES_COCO_80);

        #[cfg(target_os = "macos")]
        let config = if force_cpu {
            config
        } else {
            config.with_model_device(usls::Device::CoreMl)
        };
        #[cfg(not(target_os = "macos"))]
        let _ = force_cpu;

        let config = config.commit()?;
        let model = RTDETR::new(config)?;
        tracing::info!("Loaded detection model from {}", model_file);
        Ok(Self { model })
    }
}

impl Detector for UslsDetector {
    fn detect(&mut self, frame: &Mat, min_conf: f32) -> Result<Vec<Detection>> {
        let dynamic_image = mat_to_dynamic_image(frame)?;

        // usls RT-DETR scales boxes as if the input were square.
        let size = frame.size()?;
        let img_w = size.width as f32;
        let img_h = size.height as f32;
        let (x_corr, y_corr) = if img_w > img_h {
            (img_w / img_h, 1.0)
        } else if img_h > img_w {
            (1.0, img_h / img_w)
        } else {
            (1.0, 1.0)
        };

        let results = self.model.forward(&[Image::from(dynamic_image)])?;
        let Some(y) = results.into_iter().next() else {
            return Ok(Vec::new());
        };

        let detections = y
            .hbbs
            .iter()
            .filter_map(|hbb| {
                let confidence = hbb.confidence().unwrap_or(0.0);
                if confidence < min_conf {
                    return None;
                }
                Some(Detection {
                    bbox: BBox {
                        x: hbb.xmin() * x_corr,
                        y: hbb.ymin() * y_corr,
                        w: hbb.width() * x_corr,
                        h: hbb.height() * y_corr,
                    },
                    confidence,
                    class_id: hbb.id(),
                    class_name: hbb.name().map(|n| n.to_string()),
                })
            })
            .collect();

        Ok(detections)
    }
}

/// Convert an OpenCV Mat (BGR) to an image::DynamicImage (RGB)
fn mat_to_dynamic_image(mat: &Mat) -> Result<DynamicImage> {
    let mut rgb_mat = Mat::default();
    opencv::imgproc::cvt_color_def(mat, &mut rgb_mat, opencv::imgproc::COLOR_BGR2RGB)?;

    let size = rgb_mat.size()?;
    if !rgb_mat.is_continuous() {
        return Err(anyhow!("Mat is not continuous"));
    }

    let buffer = rgb_mat.data_bytes()?.to_vec();
    let img_buffer =
        ImageBuffer::<Rgb<u8>, _>::from_vec(size.width as u32, size.height as u32, buffer)
            .ok_or_else(|| anyhow!("Failed to create ImageBuffer from Mat data"))?;

    Ok(DynamicImage::ImageRgb8(img_buffer))
}
