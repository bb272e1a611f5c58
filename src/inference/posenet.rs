use super::preprocess::{sigmoid, Preprocessor};
use super::types::{JointName, Keypoint, Pose, PoseEstimator, NUM_KEYPOINTS};
use crate::config::PoseConfig;
use anyhow::{bail, Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::path::Path;

/// Parent/child joint pairs walked outward from a root joint when decoding
/// several people at once.
const POSE_CHAIN: [(JointName, JointName); 16] = [
    (JointName::Nose, JointName::LeftEye),
    (JointName::LeftEye, JointName::LeftEar),
    (JointName::Nose, JointName::RightEye),
    (JointName::RightEye, JointName::RightEar),
    (JointName::Nose, JointName::LeftShoulder),
    (JointName::LeftShoulder, JointName::LeftElbow),
    (JointName::LeftElbow, JointName::LeftWrist),
    (JointName::LeftShoulder, JointName::LeftHip),
    (JointName::LeftHip, JointName::LeftKnee),
    (JointName::LeftKnee, JointName::LeftAnkle),
    (JointName::Nose, JointName::RightShoulder),
    (JointName::RightShoulder, JointName::RightElbow),
    (JointName::RightElbow, JointName::RightWrist),
    (JointName::RightShoulder, JointName::RightHip),
    (JointName::RightHip, JointName::RightKnee),
    (JointName::RightKnee, JointName::RightAnkle),
];

const OFFSET_REFINE_STEPS: usize = 2;

/// PoseNet keypoint network.
pub struct PoseNetEstimator {
    session: Session,
    config: PoseConfig,
    internal_resolution: f32,
}

impl PoseNetEstimator {
    pub fn new<P: AsRef<Path>>(model_path: P, config: PoseConfig, internal_resolution: f32) -> Result<Self> {
        let path = model_path.as_ref();

        tracing::info!("Loading PoseNet from {}", path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(path)
            .with_context(|| format!("Failed to load model from {}", path.display()))?;

        tracing::info!("PoseNet model loaded successfully");

        Ok(Self {
            session,
            config,
            internal_resolution,
        })
    }

    /// Runs the network and returns its decoded output maps plus the
    /// factors mapping input pixels back to frame pixels.
    fn infer(&mut self, frame: &RgbImage) -> Result<(PoseMaps, (f32, f32))> {
        let (frame_width, frame_height) = frame.dimensions();
        let preprocessor = Preprocessor::for_stride(
            (frame_width, frame_height),
            self.internal_resolution,
            self.config.output_stride,
        );
        let (input_width, input_height) = preprocessor.target_size();
        let input = Tensor::from_array(preprocessor.mobilenet_nhwc(frame))?;

        let _infer_span = tracing::debug_span!("inference").entered();
        let outputs = self
            .session
            .run(ort::inputs![input])
            .context("Failed to run inference")?;
        drop(_infer_span);

        let (shape, heatmaps) = outputs["heatmap"].try_extract_tensor::<f32>()?;
        let (_, offsets) = outputs["offset_2"].try_extract_tensor::<f32>()?;
        let (_, displacement_fwd) = outputs["displacement_fwd_2"].try_extract_tensor::<f32>()?;
        let (_, displacement_bwd) = outputs["displacement_bwd_2"].try_extract_tensor::<f32>()?;

        if shape.len() != 4 {
            bail!("Unexpected heatmap output rank {}", shape.len());
        }

        let maps = PoseMaps::new(
            shape[1] as usize,
            shape[2] as usize,
            heatmaps.iter().map(|&v| sigmoid(v)).collect(),
            offsets.to_vec(),
            displacement_fwd.to_vec(),
            displacement_bwd.to_vec(),
        )?;

        let scale = (
            frame_width as f32 / input_width as f32,
            frame_height as f32 / input_height as f32,
        );
        Ok((maps, scale))
    }
}

impl PoseEstimator for PoseNetEstimator {
    fn estimate_single(&mut self, frame: &RgbImage) -> Result<Pose> {
        let _span = tracing::debug_span!("posenet_single").entered();
        let (maps, scale) = self.infer(frame)?;
        let pose = decode_single_pose(&maps, self.config.output_stride as f32);
        Ok(rescale_pose(pose, scale))
    }

    fn estimate_multi(&mut self, frame: &RgbImage) -> Result<Vec<Pose>> {
        let _span = tracing::debug_span!("posenet_multi").entered();
        let (maps, scale) = self.infer(frame)?;
        Ok(decode_multiple_poses(&maps, &self.config)
            .into_iter()
            .map(|pose| rescale_pose(pose, scale))
            .collect())
    }
}

fn rescale_pose(mut pose: Pose, (sx, sy): (f32, f32)) -> Pose {
    for keypoint in &mut pose.keypoints {
        keypoint.x *= sx;
        keypoint.y *= sy;
    }
    pose
}

/// PoseNet output maps on the stride grid, NHWC with the batch dropped.
/// Heatmap scores are already passed through a sigmoid.
pub struct PoseMaps {
    height: usize,
    width: usize,
    scores: Vec<f32>,
    offsets: Vec<f32>,
    displacement_fwd: Vec<f32>,
    displacement_bwd: Vec<f32>,
}

impl PoseMaps {
    pub fn new(
        height: usize,
        width: usize,
        scores: Vec<f32>,
        offsets: Vec<f32>,
        displacement_fwd: Vec<f32>,
        displacement_bwd: Vec<f32>,
    ) -> Result<Self> {
        let cells = height * width;
        let edges = POSE_CHAIN.len();
        if scores.len() != cells * NUM_KEYPOINTS
            || offsets.len() != cells * NUM_KEYPOINTS * 2
            || displacement_fwd.len() != cells * edges * 2
            || displacement_bwd.len() != cells * edges * 2
        {
            bail!("PoseNet outputs do not match a {}x{} grid", width, height);
        }
        Ok(Self {
            height,
            width,
            scores,
            offsets,
            displacement_fwd,
            displacement_bwd,
        })
    }

    fn score(&self, y: usize, x: usize, joint: usize) -> f32 {
        self.scores[(y * self.width + x) * NUM_KEYPOINTS + joint]
    }

    /// `(dy, dx)` refinement of a joint inside its grid cell.
    fn offset(&self, y: usize, x: usize, joint: usize) -> (f32, f32) {
        let base = (y * self.width + x) * NUM_KEYPOINTS * 2;
        (self.offsets[base + joint], self.offsets[base + NUM_KEYPOINTS + joint])
    }

    fn displacement(&self, field: &[f32], y: usize, x: usize, edge: usize) -> (f32, f32) {
        let edges = POSE_CHAIN.len();
        let base = (y * self.width + x) * edges * 2;
        (field[base + edge], field[base + edges + edge])
    }

    /// Grid cell closest to an image-space point.
    fn nearest_cell(&self, (y, x): (f32, f32), stride: f32) -> (usize, usize) {
        let clamp = |v: f32, max: usize| (v / stride).round().clamp(0.0, (max - 1) as f32) as usize;
        (clamp(y, self.height), clamp(x, self.width))
    }

    fn image_coords(&self, y: usize, x: usize, joint: usize, stride: f32) -> (f32, f32) {
        let (dy, dx) = self.offset(y, x, joint);
        (y as f32 * stride + dy, x as f32 * stride + dx)
    }

    fn is_local_maximum(&self, y: usize, x: usize, joint: usize, radius: usize) -> bool {
        let score = self.score(y, x, joint);
        let y_end = (y + radius + 1).min(self.height);
        let x_end = (x + radius + 1).min(self.width);
        for cy in y.saturating_sub(radius)..y_end {
            for cx in x.saturating_sub(radius)..x_end {
                if self.score(cy, cx, joint) > score {
                    return false;
                }
            }
        }
        true
    }
}

/// Best cell per joint; the pose score is the mean joint score.
pub fn decode_single_pose(maps: &PoseMaps, stride: f32) -> Pose {
    let keypoints: Vec<Keypoint> = JointName::ALL
        .iter()
        .map(|&joint| {
            let j = joint.index();
            let mut best = (0, 0, f32::MIN);
            for y in 0..maps.height {
                for x in 0..maps.width {
                    let score = maps.score(y, x, j);
                    if score > best.2 {
                        best = (y, x, score);
                    }
                }
            }
            let (py, px) = maps.image_coords(best.0, best.1, j, stride);
            Keypoint {
                x: px,
                y: py,
                score: best.2,
                joint,
            }
        })
        .collect();

    let score = keypoints.iter().map(|k| k.score).sum::<f32>() / NUM_KEYPOINTS as f32;
    Pose { keypoints, score }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct PartCandidate {
    score: f32,
    y: usize,
    x: usize,
    joint: usize,
}

impl Eq for PartCandidate {}

impl Ord for PartCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score.total_cmp(&other.score)
    }
}

impl PartialOrd for PartCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

fn within_nms_radius(poses: &[Pose], squared_radius: f32, (y, x): (f32, f32), joint: usize) -> bool {
    poses.iter().any(|pose| {
        let k = &pose.keypoints[joint];
        (k.y - y).powi(2) + (k.x - x).powi(2) <= squared_radius
    })
}

/// Root candidates are local maxima above the score threshold, strongest
/// first. Each root not already claimed by a detected person seeds a pose
/// whose remaining joints are found by following displacement fields along
/// the pose chain.
pub fn decode_multiple_poses(maps: &PoseMaps, config: &PoseConfig) -> Vec<Pose> {
    let stride = config.output_stride as f32;
    let squared_radius = config.nms_radius * config.nms_radius;

    let mut queue = BinaryHeap::new();
    for y in 0..maps.height {
        for x in 0..maps.width {
            for joint in 0..NUM_KEYPOINTS {
                let score = maps.score(y, x, joint);
                if score >= config.score_threshold
                    && maps.is_local_maximum(y, x, joint, config.local_maximum_radius)
                {
                    queue.push(PartCandidate { score, y, x, joint });
                }
            }
        }
    }

    let mut poses: Vec<Pose> = Vec::new();
    while poses.len() < config.max_poses {
        let Some(root) = queue.pop() else {
            break;
        };
        let root_point = maps.image_coords(root.y, root.x, root.joint, stride);
        if within_nms_radius(&poses, squared_radius, root_point, root.joint) {
            continue;
        }

        let keypoints = decode_pose_from_root(maps, root, root_point, stride);
        let unclaimed: f32 = keypoints
            .iter()
            .enumerate()
            .filter(|(joint, k)| !within_nms_radius(&poses, squared_radius, (k.y, k.x), *joint))
            .map(|(_, k)| k.score)
            .sum();

        poses.push(Pose {
            keypoints,
            score: unclaimed / NUM_KEYPOINTS as f32,
        });
    }

    poses
}

fn decode_pose_from_root(
    maps: &PoseMaps,
    root: PartCandidate,
    root_point: (f32, f32),
    stride: f32,
) -> Vec<Keypoint> {
    let mut found: [Option<Keypoint>; NUM_KEYPOINTS] = [None; NUM_KEYPOINTS];
    found[root.joint] = Some(Keypoint {
        x: root_point.1,
        y: root_point.0,
        score: root.score,
        joint: JointName::ALL[root.joint],
    });

    for edge in (0..POSE_CHAIN.len()).rev() {
        let (parent, child) = POSE_CHAIN[edge];
        if let (Some(source), None) = (found[child.index()], found[parent.index()]) {
            found[parent.index()] =
                Some(traverse(maps, edge, &source, parent, &maps.displacement_bwd, stride));
        }
    }

    for (edge, &(parent, child)) in POSE_CHAIN.iter().enumerate() {
        if let (Some(source), None) = (found[parent.index()], found[child.index()]) {
            found[child.index()] =
                Some(traverse(maps, edge, &source, child, &maps.displacement_fwd, stride));
        }
    }

    JointName::ALL
        .iter()
        .map(|&joint| {
            found[joint.index()].unwrap_or(Keypoint {
                x: 0.0,
                y: 0.0,
                score: 0.0,
                joint,
            })
        })
        .collect()
}

fn traverse(
    maps: &PoseMaps,
    edge: usize,
    source: &Keypoint,
    target: JointName,
    field: &[f32],
    stride: f32,
) -> Keypoint {
    let (sy, sx) = maps.nearest_cell((source.y, source.x), stride);
    let (dy, dx) = maps.displacement(field, sy, sx, edge);
    let mut point = (source.y + dy, source.x + dx);

    for _ in 0..OFFSET_REFINE_STEPS {
        let (ty, tx) = maps.nearest_cell(point, stride);
        point = maps.image_coords(ty, tx, target.index(), stride);
    }

    let (ty, tx) = maps.nearest_cell(point, stride);
    Keypoint {
        x: point.1,
        y: point.0,
        score: maps.score(ty, tx, target.index()),
        joint: target,
    }
}
