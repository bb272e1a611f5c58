use super::CaptureSource;
use crate::error::CameraError;
use anyhow::{Context, Result};
use image::RgbImage;
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{ApiBackend, CameraIndex, RequestedFormat, RequestedFormatType};
use nokhwa::Camera;

pub struct WebcamCapture {
    camera: Camera,
    width: u32,
    height: u32,
}

impl WebcamCapture {
    /// Opens the device at its highest resolution.
    pub fn open(device_index: u32) -> Result<Self, CameraError> {
        tracing::info!("Initializing webcam {}", device_index);

        let devices = nokhwa::query(ApiBackend::Auto)
            .map_err(|err| CameraError::classify(err.to_string()))?;
        if devices.is_empty() {
            return Err(CameraError::NoDevice);
        }

        let index = CameraIndex::Index(device_index);
        let requested =
            RequestedFormat::new::<RgbFormat>(RequestedFormatType::AbsoluteHighestResolution);

        let mut camera =
            Camera::new(index, requested).map_err(|err| CameraError::classify(err.to_string()))?;

        camera
            .open_stream()
            .map_err(|err| CameraError::classify(err.to_string()))?;

        let resolution = camera.resolution();
        tracing::info!(
            "Webcam initialized at {}x{}",
            resolution.width(),
            resolution.height()
        );

        Ok(Self {
            camera,
            width: resolution.width(),
            height: resolution.height(),
        })
    }
}

impl CaptureSource for WebcamCapture {
    fn capture_frame(&mut self) -> Result<RgbImage> {
        let frame = self
            .camera
            .frame()
            .context("Failed to capture frame")?;

        let decoded = frame
            .decode_image::<RgbFormat>()
            .context("Failed to decode frame")?;

        Ok(decoded)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}
