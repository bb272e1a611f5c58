use anyhow::Result;
use image::RgbImage;
use std::fmt;

/// The active inference pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    Detection,
    Segmentation,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Detection => f.write_str("detection"),
            Mode::Segmentation => f.write_str("segmentation"),
        }
    }
}

/// Axis-aligned box in model-input pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub class_label: String,
    /// 0.0-1.0
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    /// Caption drawn above the box, e.g. `person: 87%`.
    pub fn caption(&self) -> String {
        format!("{}: {}%", self.class_label, (self.score * 100.0).round() as u32)
    }
}

/// The seventeen PoseNet joints, in network channel order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JointName {
    Nose,
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    LeftShoulder,
    RightShoulder,
    LeftElbow,
    RightElbow,
    LeftWrist,
    RightWrist,
    LeftHip,
    RightHip,
    LeftKnee,
    RightKnee,
    LeftAnkle,
    RightAnkle,
}

pub const NUM_KEYPOINTS: usize = 17;

impl JointName {
    pub const ALL: [JointName; NUM_KEYPOINTS] = [
        JointName::Nose,
        JointName::LeftEye,
        JointName::RightEye,
        JointName::LeftEar,
        JointName::RightEar,
        JointName::LeftShoulder,
        JointName::RightShoulder,
        JointName::LeftElbow,
        JointName::RightElbow,
        JointName::LeftWrist,
        JointName::RightWrist,
        JointName::LeftHip,
        JointName::RightHip,
        JointName::LeftKnee,
        JointName::RightKnee,
        JointName::LeftAnkle,
        JointName::RightAnkle,
    ];

    pub fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub x: f32,
    pub y: f32,
    pub score: f32,
    pub joint: JointName,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
    pub score: f32,
}

impl Pose {
    pub fn keypoint(&self, joint: JointName) -> Option<&Keypoint> {
        self.keypoints.iter().find(|k| k.joint == joint)
    }
}

/// Per-pixel body part ids, row-major. `-1` marks background.
#[derive(Debug, Clone, PartialEq)]
pub struct PartMask {
    pub width: u32,
    pub height: u32,
    pub parts: Vec<i8>,
}

impl PartMask {
    #[cfg(test)]
    pub fn background(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            parts: vec![-1; (width * height) as usize],
        }
    }

    pub fn part_at(&self, x: u32, y: u32) -> Option<i8> {
        if x >= self.width || y >= self.height {
            return None;
        }
        self.parts.get((y * self.width + x) as usize).copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SegmentationFrame {
    pub mask: PartMask,
    pub poses: Vec<Pose>,
}

/// Trait for object detection backends
pub trait ObjectDetector: Send {
    /// Boxes are returned in the pixel space of `frame`.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<Detection>>;
}

/// Trait for per-pixel body part segmentation
pub trait PartSegmenter: Send {
    /// The mask has the dimensions of `frame`.
    fn segment_parts(&mut self, frame: &RgbImage) -> Result<PartMask>;
}

/// Trait for pose estimation, the auxiliary capability of the
/// segmentation pipeline
pub trait PoseEstimator: Send {
    fn estimate_single(&mut self, frame: &RgbImage) -> Result<Pose>;

    fn estimate_multi(&mut self, frame: &RgbImage) -> Result<Vec<Pose>>;
}

/// Loaded segmentation pipeline: part segmenter plus its pose estimator.
pub struct SegmenterHandle {
    parts: Box<dyn PartSegmenter>,
    poses: Box<dyn PoseEstimator>,
}

impl SegmenterHandle {
    pub fn new(parts: Box<dyn PartSegmenter>, poses: Box<dyn PoseEstimator>) -> Self {
        Self { parts, poses }
    }

    pub fn segment_single(&mut self, frame: &RgbImage) -> Result<SegmentationFrame> {
        let mask = self.parts.segment_parts(frame)?;
        let pose = self.poses.estimate_single(frame)?;
        Ok(SegmentationFrame {
            mask,
            poses: vec![pose],
        })
    }

    pub fn segment_multi(&mut self, frame: &RgbImage) -> Result<SegmentationFrame> {
        let mask = self.parts.segment_parts(frame)?;
        let poses = self.poses.estimate_multi(frame)?;
        Ok(SegmentationFrame { mask, poses })
    }
}

/// Loads the blocking model capabilities. Implementations run on the
/// blocking thread pool.
pub trait ModelBackend: Send + Sync + 'static {
    fn load_detector(&self) -> Result<Box<dyn ObjectDetector>>;

    fn load_part_segmenter(&self) -> Result<Box<dyn PartSegmenter>>;

    fn load_pose_estimator(&self) -> Result<Box<dyn PoseEstimator>>;
}
