use super::{DrawingSurface, RectF};
use crate::config::OverlaySettings;
use crate::inference::{Detection, JointName, PartMask, Pose, SegmentationFrame};
use image::{Rgba, RgbImage, RgbaImage};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// BodyPix "rainbow" colours, indexed by part id.
pub const PART_COLORS: [[u8; 3]; 24] = [
    [110, 64, 170],
    [143, 61, 178],
    [178, 60, 178],
    [210, 62, 167],
    [238, 67, 149],
    [255, 78, 125],
    [255, 94, 99],
    [255, 115, 75],
    [255, 140, 56],
    [239, 167, 47],
    [217, 194, 44],
    [194, 219, 50],
    [175, 240, 91],
    [135, 245, 87],
    [96, 247, 96],
    [64, 243, 115],
    [40, 234, 141],
    [28, 219, 169],
    [26, 199, 194],
    [33, 176, 213],
    [47, 153, 226],
    [65, 129, 232],
    [80, 106, 231],
    [95, 85, 219],
];

/// Joint pairs joined by a skeleton segment.
pub const ADJACENT_JOINTS: [(JointName, JointName); 12] = [
    (JointName::LeftHip, JointName::LeftShoulder),
    (JointName::LeftElbow, JointName::LeftShoulder),
    (JointName::LeftElbow, JointName::LeftWrist),
    (JointName::LeftHip, JointName::LeftKnee),
    (JointName::LeftKnee, JointName::LeftAnkle),
    (JointName::RightHip, JointName::RightShoulder),
    (JointName::RightElbow, JointName::RightShoulder),
    (JointName::RightElbow, JointName::RightWrist),
    (JointName::RightHip, JointName::RightKnee),
    (JointName::RightKnee, JointName::RightAnkle),
    (JointName::LeftShoulder, JointName::RightShoulder),
    (JointName::LeftHip, JointName::RightHip),
];

const FIXED_CLASS_COLORS: [(&str, [u8; 3]); 4] = [
    ("person", [0xff, 0x0e, 0x1d]),
    ("cup", [0x76, 0xff, 0x53]),
    ("bottle", [0x61, 0x91, 0xff]),
    ("cell phone", [0xf0, 0x7a, 0xfa]),
];

/// Class label to box colour. A label keeps its first colour for the
/// lifetime of the assignment.
pub struct ColorAssignment {
    colors: HashMap<String, Rgba<u8>>,
    rng: StdRng,
}

impl ColorAssignment {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        let colors = FIXED_CLASS_COLORS
            .iter()
            .map(|(label, [r, g, b])| (label.to_string(), Rgba([*r, *g, *b, 255])))
            .collect();
        Self { colors, rng }
    }

    pub fn color_for(&mut self, label: &str) -> Rgba<u8> {
        if let Some(color) = self.colors.get(label) {
            return *color;
        }
        let [r, g, b]: [u8; 3] = self.rng.gen();
        let color = Rgba([r, g, b, 255]);
        self.colors.insert(label.to_string(), color);
        tracing::debug!(
            "Assigned colour {:?} to new class '{}' ({} classes coloured)",
            color,
            label,
            self.len()
        );
        color
    }

    pub fn len(&self) -> usize {
        self.colors.len()
    }
}

impl Default for ColorAssignment {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionStyle {
    pub font_px: f32,
    pub padding: f32,
    pub line_width: f32,
    pub text_color: Rgba<u8>,
}

impl From<&OverlaySettings> for DetectionStyle {
    fn from(settings: &OverlaySettings) -> Self {
        Self {
            font_px: settings.label_font_px,
            padding: settings.label_padding,
            line_width: settings.box_line_width,
            text_color: settings.label_text_color,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SkeletonStyle {
    pub min_confidence: f32,
    pub point_radius: f32,
    pub line_width: f32,
    pub color: Rgba<u8>,
}

impl From<&OverlaySettings> for SkeletonStyle {
    fn from(settings: &OverlaySettings) -> Self {
        Self {
            min_confidence: settings.keypoint_threshold,
            point_radius: settings.keypoint_radius,
            line_width: settings.skeleton_line_width,
            color: settings.skeleton_color,
        }
    }
}

/// Clears the surface and draws every detection: boxes and label
/// backgrounds first, then all captions so no box covers a caption.
pub fn render_detections<S: DrawingSurface + ?Sized>(
    surface: &mut S,
    detections: &[Detection],
    (sx, sy): (f32, f32),
    colors: &mut ColorAssignment,
    style: &DetectionStyle,
) {
    let _span = tracing::debug_span!("render_detections", count = detections.len()).entered();

    surface.clear();

    for detection in detections {
        let color = colors.color_for(&detection.class_label);
        let bbox = detection.bbox.scaled(sx, sy);
        surface.stroke_rect(
            RectF::new(bbox.x, bbox.y, bbox.width, bbox.height),
            color,
            style.line_width,
        );

        let text_width = surface.measure_text(&detection.caption(), style.font_px);
        surface.fill_rect(
            RectF::new(
                bbox.x,
                bbox.y,
                text_width + style.padding,
                style.font_px + style.padding,
            ),
            color,
        );
    }

    for detection in detections {
        surface.fill_text(
            &detection.caption(),
            detection.bbox.x * sx,
            detection.bbox.y * sy,
            style.font_px,
            style.text_color,
        );
    }
}

/// Part ids coloured with [`PART_COLORS`]; background stays transparent.
pub fn colored_part_mask(mask: &PartMask) -> RgbaImage {
    RgbaImage::from_fn(mask.width, mask.height, |x, y| {
        match mask.part_at(x, y) {
            Some(part) if part >= 0 => {
                let [r, g, b] = PART_COLORS[part as usize % PART_COLORS.len()];
                Rgba([r, g, b, 255])
            }
            _ => Rgba([0, 0, 0, 0]),
        }
    })
}

/// Composites the coloured part mask over `source` and optionally draws
/// every pose's confident keypoints and skeleton segments.
pub fn render_segmentation<S: DrawingSurface + ?Sized>(
    surface: &mut S,
    source: &RgbImage,
    frame: &SegmentationFrame,
    opacity: f32,
    draw_skeleton: bool,
    style: &SkeletonStyle,
) {
    let _span = tracing::debug_span!("render_segmentation", poses = frame.poses.len()).entered();

    let mask = colored_part_mask(&frame.mask);
    surface.draw_mask(source, &mask, opacity);

    if !draw_skeleton {
        return;
    }
    for pose in &frame.poses {
        draw_keypoints(surface, pose, style);
        draw_skeleton_segments(surface, pose, style);
    }
}

fn draw_keypoints<S: DrawingSurface + ?Sized>(surface: &mut S, pose: &Pose, style: &SkeletonStyle) {
    for keypoint in &pose.keypoints {
        if keypoint.score < style.min_confidence {
            continue;
        }
        surface.draw_point(keypoint.x, keypoint.y, style.point_radius, style.color);
    }
}

fn draw_skeleton_segments<S: DrawingSurface + ?Sized>(
    surface: &mut S,
    pose: &Pose,
    style: &SkeletonStyle,
) {
    for (a, b) in ADJACENT_JOINTS {
        let (Some(from), Some(to)) = (pose.keypoint(a), pose.keypoint(b)) else {
            continue;
        };
        if from.score < style.min_confidence || to.score < style.min_confidence {
            continue;
        }
        surface.draw_line((from.x, from.y), (to.x, to.y), style.color, style.line_width);
    }
}
