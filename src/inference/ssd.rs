use super::coco;
use super::preprocess::Preprocessor;
use super::types::{BoundingBox, Detection, ObjectDetector};
use crate::config::DetectorConfig;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

/// SSD-MobileNet object detector trained on COCO.
///
/// Expects the TensorFlow object-detection export: a `uint8` NHWC image
/// input and `detection_boxes` / `detection_scores` / `detection_classes`
/// outputs, boxes as normalized `(ymin, xmin, ymax, xmax)`.
pub struct SsdDetector {
    session: Session,
    config: DetectorConfig,
}

impl SsdDetector {
    pub fn new<P: AsRef<Path>>(model_path: P, config: DetectorConfig) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading SSD detector from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("SSD detector loaded successfully");

        Ok(Self { session, config })
    }
}

impl ObjectDetector for SsdDetector {
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let _span = tracing::debug_span!("ssd_detect").entered();

        let (frame_width, frame_height) = frame.dimensions();
        let input = Tensor::from_array(Preprocessor::raw_nhwc(frame))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (_, boxes) = outputs["detection_boxes"].try_extract_tensor::<f32>()?;
        let (_, scores) = outputs["detection_scores"].try_extract_tensor::<f32>()?;
        let (_, classes) = outputs["detection_classes"].try_extract_tensor::<f32>()?;

        if boxes.len() != scores.len() * 4 || classes.len() != scores.len() {
            bail!(
                "Inconsistent SSD outputs: {} boxes, {} scores, {} classes",
                boxes.len(),
                scores.len(),
                classes.len()
            );
        }

        let raw: Vec<(f32, u32, [f32; 4])> = scores
            .iter()
            .zip(classes.iter())
            .zip(boxes.chunks_exact(4))
            .map(|((&score, &class), b)| (score, class as u32, [b[0], b[1], b[2], b[3]]))
            .collect();

        Ok(decode_detections(
            &raw,
            (frame_width, frame_height),
            self.config,
        ))
    }
}

/// Turns `(score, class id, normalized yxyx box)` rows into pixel-space
/// detections, best first.
pub fn decode_detections(
    raw: &[(f32, u32, [f32; 4])],
    frame: (u32, u32),
    config: DetectorConfig,
) -> Vec<Detection> {
    let (width, height) = (frame.0 as f32, frame.1 as f32);

    let mut detections: Vec<Detection> = raw
        .iter()
        .filter(|(score, _, _)| *score >= config.min_score)
        .filter_map(|&(score, class_id, [ymin, xmin, ymax, xmax])| {
            let label = coco::label_for(class_id)?;
            let x = xmin.clamp(0.0, 1.0) * width;
            let y = ymin.clamp(0.0, 1.0) * height;
            Some(Detection {
                class_label: label.to_string(),
                score,
                bbox: BoundingBox {
                    x,
                    y,
                    width: (xmax.clamp(0.0, 1.0) * width - x).max(0.0),
                    height: (ymax.clamp(0.0, 1.0) * height - y).max(0.0),
                },
            })
        })
        .collect();

    detections.sort_by(|a, b| b.score.total_cmp(&a.score));
    detections.truncate(config.max_detections);
    detections
}
