mod bodypix;
mod coco;
mod posenet;
mod preprocess;
mod ssd;
pub mod types;

pub use bodypix::BodyPixSegmenter;
pub use posenet::PoseNetEstimator;
pub use ssd::SsdDetector;
pub use types::{
    BoundingBox, Detection, JointName, Keypoint, Mode, ModelBackend, ObjectDetector, PartMask,
    PartSegmenter, Pose, PoseEstimator, SegmentationFrame, SegmenterHandle,
};

use crate::config::{DetectorConfig, ModelPaths, PoseConfig, SegmenterConfig};
use anyhow::Result;

/// Loads the ONNX models from disk.
pub struct OnnxBackend {
    paths: ModelPaths,
    detector: DetectorConfig,
    segmenter: SegmenterConfig,
    pose: PoseConfig,
}

impl OnnxBackend {
    pub fn new(
        paths: ModelPaths,
        detector: DetectorConfig,
        segmenter: SegmenterConfig,
        pose: PoseConfig,
    ) -> Self {
        Self {
            paths,
            detector,
            segmenter,
            pose,
        }
    }
}

impl ModelBackend for OnnxBackend {
    fn load_detector(&self) -> Result<Box<dyn ObjectDetector>> {
        let model = SsdDetector::new(self.paths.detector_path(), self.detector)?;
        Ok(Box::new(model))
    }

    fn load_part_segmenter(&self) -> Result<Box<dyn PartSegmenter>> {
        let model = BodyPixSegmenter::new(
            self.paths.segmenter_path(&self.segmenter),
            self.segmenter.clone(),
        )?;
        Ok(Box::new(model))
    }

    fn load_pose_estimator(&self) -> Result<Box<dyn PoseEstimator>> {
        let model = PoseNetEstimator::new(
            self.paths.pose_path(self.segmenter.multiplier),
            self.pose,
            self.segmenter.internal_resolution,
        )?;
        Ok(Box::new(model))
    }
}
