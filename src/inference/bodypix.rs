use super::preprocess::{sigmoid, Preprocessor};
use super::types::{PartMask, PartSegmenter};
use crate::config::SegmenterConfig;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::Path;

pub const NUM_PARTS: usize = 24;

/// BodyPix person-part segmentation network.
///
/// Outputs are `float_segments` `[1, h, w, 1]` person logits and
/// `float_part_heatmaps` `[1, h, w, 24]` part logits on the stride grid.
pub struct BodyPixSegmenter {
    session: Session,
    config: SegmenterConfig,
}

impl BodyPixSegmenter {
    pub fn new<P: AsRef<Path>>(model_path: P, config: SegmenterConfig) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!(
            "Loading BodyPix {} (multiplier {}, stride {}, {} quant bytes) from {}",
            config.architecture,
            config.multiplier,
            config.output_stride,
            config.quant_bytes,
            path.display()
        );

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("BodyPix model loaded successfully");

        Ok(Self { session, config })
    }
}

impl PartSegmenter for BodyPixSegmenter {
    fn segment_parts(&mut self, frame: &RgbImage) -> Result<PartMask> {
        let _span = tracing::debug_span!("bodypix_segment").entered();

        let (frame_width, frame_height) = frame.dimensions();
        let preprocessor = Preprocessor::for_stride(
            (frame_width, frame_height),
            self.config.internal_resolution,
            self.config.output_stride,
        );
        let input = Tensor::from_array(preprocessor.mobilenet_nhwc(frame))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (seg_shape, segments) = outputs["float_segments"].try_extract_tensor::<f32>()?;
        let (_, part_logits) = outputs["float_part_heatmaps"].try_extract_tensor::<f32>()?;

        if seg_shape.len() != 4 {
            bail!("Unexpected segment output rank {}", seg_shape.len());
        }
        let grid_height = seg_shape[1] as u32;
        let grid_width = seg_shape[2] as u32;

        let grid = decode_part_grid(
            segments,
            part_logits,
            self.config.segmentation_threshold,
        )?;

        let parts = Preprocessor::upscale_labels(
            &grid,
            grid_width,
            grid_height,
            frame_width,
            frame_height,
        );

        Ok(PartMask {
            width: frame_width,
            height: frame_height,
            parts,
        })
    }
}

/// Cells whose person probability exceeds `threshold` take the argmax part
/// id; all other cells are background.
pub fn decode_part_grid(segments: &[f32], part_logits: &[f32], threshold: f32) -> Result<Vec<i8>> {
    if part_logits.len() != segments.len() * NUM_PARTS {
        bail!(
            "Part heatmaps hold {} values for {} cells",
            part_logits.len(),
            segments.len()
        );
    }

    Ok(segments
        .iter()
        .zip(part_logits.chunks_exact(NUM_PARTS))
        .map(|(&logit, parts)| {
            if sigmoid(logit) <= threshold {
                return -1;
            }
            parts
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| id as i8)
                .unwrap_or(-1)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_below_threshold() {
        let segments = [-4.0, 4.0];
        let mut parts = vec![0.0; 2 * NUM_PARTS];
        parts[3] = 5.0;
        parts[NUM_PARTS + 17] = 2.0;
        let grid = decode_part_grid(&segments, &parts, 0.5).unwrap();
        assert_eq!(grid, vec![-1, 17]);
    }

    #[test]
    fn rejects_mismatched_heatmaps() {
        assert!(decode_part_grid(&[0.0; 4], &[0.0; 24], 0.5).is_err());
    }
}
