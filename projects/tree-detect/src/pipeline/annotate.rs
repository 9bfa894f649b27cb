use crate::pipeline::types::Detection;
use anyhow::Result;
use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::prelude::*;

// BGR
const PALETTE: [(f64, f64, f64); 6] = [
    (56.0, 56.0, 255.0),
    (151.0, 157.0, 255.0),
    (31.0, 112.0, 255.0),
    (29.0, 178.0, 255.0),
    (49.0, 210.0, 207.0),
    (10.0, 249.0, 72.0),
];

fn color_for(class_id: Option<usize>) -> Scalar {
    let (b, g, r) = PALETTE[class_id.unwrap_or(0) % PALETTE.len()];
    Scalar::new(b, g, r, 0.0)
}

/// Clamp a detection box to the frame, keeping at least one pixel.
fn clamp_rect(d: &Detection, cols: i32, rows: i32) -> Rect {
    let x1 = (d.bbox.x.round() as i32).clamp(0, (cols - 1).max(0));
    let y1 = (d.bbox.y.round() as i32).clamp(0, (rows - 1).max(0));
    let x2 = ((d.bbox.x + d.bbox.w).round() as i32).clamp(x1 + 1, cols.max(x1 + 1));
    let y2 = ((d.bbox.y + d.bbox.h).round() as i32).clamp(y1 + 1, rows.max(y1 + 1));
    Rect::new(x1, y1, x2 - x1, y2 - y1)
}

/// Draw boxes and `name conf` labels onto `frame` in place.
pub fn draw_detections(frame: &mut Mat, detections: &[Detection]) -> Result<()> {
    let (cols, rows) = (frame.cols(), frame.rows());
    for d in detections {
        let rect = clamp_rect(d, cols, rows);
        let color = color_for(d.class_id);
        imgproc::rectangle(frame, rect, color, 2, imgproc::LINE_8, 0)?;

        let label = d.label();
        let mut baseline = 0;
        let text_size =
            imgproc::get_text_size(&label, imgproc::FONT_HERSHEY_SIMPLEX, 0.5, 1, &mut baseline)?;
        // Put the label above the box, or inside it when the box touches the top edge.
        let top = if rect.y - text_size.height - baseline >= 0 {
            rect.y - text_size.height - baseline
        } else {
            rect.y
        };
        let background = Rect::new(
            rect.x,
            top,
            text_size.width,
            text_size.height + baseline,
        );
        imgproc::rectangle(frame, background, color, imgproc::FILLED, imgproc::LINE_8, 0)?;
        imgproc::put_text(
            frame,
            &label,
            Point::new(rect.x, top + text_size.height),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            1,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::BBox;
    use opencv::core::{Vec3b, CV_8UC3};
    use opencv::prelude::*;

    fn det(x: f32, y: f32, w: f32, h: f32) -> Detection {
        Detection {
            bbox: BBox { x, y, w, h },
            confidence: 0.9,
            class_id: Some(0),
            class_name: Some("tree".into()),
        }
    }

    #[test]
    fn boxes_are_clamped_to_the_frame() {
        let r = clamp_rect(&det(-5.0, -5.0, 500.0, 500.0), 100, 80);
        assert_eq!(r, Rect::new(0, 0, 100, 80));
        let r = clamp_rect(&det(10.0, 10.0, 0.0, 0.0), 100, 80);
        assert_eq!((r.width, r.height), (1, 1));
    }

    #[test]
    fn drawing_changes_pixels_on_the_box_edge() {
        let mut frame =
            Mat::new_rows_cols_with_default(100, 100, CV_8UC3, Scalar::all(0.0)).unwrap();
        draw_detections(&mut frame, &[det(40.0, 40.0, 30.0, 30.0)]).unwrap();
        let edge = *frame.at_2d::<Vec3b>(55, 40).unwrap();
        assert_ne!(edge, Vec3b::from([0, 0, 0]));
        let outside = *frame.at_2d::<Vec3b>(95, 5).unwrap();
        assert_eq!(outside, Vec3b::from([0, 0, 0]));
    }

    #[test]
    fn no_detections_leaves_frame_untouched() {
        let mut frame =
            Mat::new_rows_cols_with_default(10, 10, CV_8UC3, Scalar::all(7.0)).unwrap();
        draw_detections(&mut frame, &[]).unwrap();
        assert_eq!(*frame.at_2d::<Vec3b>(5, 5).unwrap(), Vec3b::from([7, 7, 7]));
    }
}
