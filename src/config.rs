use clap::ValueEnum;
use image::Rgba;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Hardware profile the overlay runs on.
///
/// Mobile-class devices get the lighter segmentation network, single-person
/// decoding and keep their frame loop alive across resizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DeviceClass {
    Desktop,
    Mobile,
}

impl DeviceClass {
    pub fn is_mobile(self) -> bool {
        matches!(self, DeviceClass::Mobile)
    }

    pub fn mobilenet_multiplier(self) -> f32 {
        if self.is_mobile() {
            0.5
        } else {
            0.75
        }
    }

    pub fn quant_bytes(self) -> u8 {
        if self.is_mobile() {
            2
        } else {
            4
        }
    }

    /// Whether a resize event restarts a running frame loop.
    pub fn restarts_on_resize(self) -> bool {
        !self.is_mobile()
    }
}

/// Fixed drawing and scheduling constants.
#[derive(Debug, Clone)]
pub struct OverlaySettings {
    pub mask_opacity: f32,
    pub keypoint_threshold: f32,
    pub narrow_threshold: u32,
    pub narrow_margin: u32,
    pub readiness_poll: Duration,
    pub refresh_hz: u32,
    pub label_font_px: f32,
    pub label_padding: f32,
    pub box_line_width: f32,
    pub skeleton_line_width: f32,
    pub keypoint_radius: f32,
    pub skeleton_color: Rgba<u8>,
    pub label_text_color: Rgba<u8>,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            mask_opacity: 0.7,
            keypoint_threshold: 0.1,
            narrow_threshold: 680,
            narrow_margin: 32,
            readiness_poll: Duration::from_millis(500),
            refresh_hz: 60,
            label_font_px: 16.0,
            label_padding: 4.0,
            box_line_width: 3.0,
            skeleton_line_width: 2.0,
            keypoint_radius: 3.0,
            // aqua
            skeleton_color: Rgba([0, 255, 255, 255]),
            label_text_color: Rgba([0, 0, 0, 255]),
        }
    }
}

impl OverlaySettings {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.refresh_hz.max(1) as f64)
    }
}

/// Object detector tuning; filtering happens inside the capability.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    pub min_score: f32,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_score: 0.5,
            max_detections: 20,
        }
    }
}

/// Body-part segmentation network selection.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    pub architecture: String,
    pub output_stride: u32,
    pub multiplier: f32,
    pub quant_bytes: u8,
    /// Probability above which a cell counts as "person".
    pub segmentation_threshold: f32,
    /// Fraction of the frame size fed to the network.
    pub internal_resolution: f32,
}

impl SegmenterConfig {
    pub fn for_device(device: DeviceClass) -> Self {
        Self {
            architecture: "MobileNetV1".to_string(),
            output_stride: 16,
            multiplier: device.mobilenet_multiplier(),
            quant_bytes: device.quant_bytes(),
            segmentation_threshold: 0.5,
            internal_resolution: 0.5,
        }
    }

    /// e.g. `bodypix_mobilenetv1_075_stride16_q4.onnx`
    pub fn model_file_name(&self) -> String {
        format!(
            "bodypix_{}_{:03}_stride{}_q{}.onnx",
            self.architecture.to_lowercase(),
            (self.multiplier * 100.0).round() as u32,
            self.output_stride,
            self.quant_bytes
        )
    }
}

/// Multi-person pose decoding parameters.
#[derive(Debug, Clone, Copy)]
pub struct PoseConfig {
    pub output_stride: u32,
    pub max_poses: usize,
    pub score_threshold: f32,
    pub nms_radius: f32,
    pub local_maximum_radius: usize,
}

impl Default for PoseConfig {
    fn default() -> Self {
        Self {
            output_stride: 16,
            max_poses: 5,
            score_threshold: 0.5,
            nms_radius: 20.0,
            local_maximum_radius: 1,
        }
    }
}

/// Where the ONNX files live on disk.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub model_dir: PathBuf,
    pub detector: Option<PathBuf>,
    pub segmenter: Option<PathBuf>,
    pub pose: Option<PathBuf>,
}

impl ModelPaths {
    pub fn detector_path(&self) -> PathBuf {
        self.resolve(self.detector.as_deref(), "ssd_mobilenet_v1.onnx")
    }

    pub fn segmenter_path(&self, config: &SegmenterConfig) -> PathBuf {
        self.resolve(self.segmenter.as_deref(), &config.model_file_name())
    }

    pub fn pose_path(&self, multiplier: f32) -> PathBuf {
        let default = format!(
            "posenet_mobilenetv1_{:03}_stride16.onnx",
            (multiplier * 100.0).round() as u32
        );
        self.resolve(self.pose.as_deref(), &default)
    }

    fn resolve(&self, explicit: Option<&Path>, default_name: &str) -> PathBuf {
        match explicit {
            Some(path) => path.to_path_buf(),
            None => self.model_dir.join(default_name),
        }
    }
}
