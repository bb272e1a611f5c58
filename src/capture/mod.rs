mod v4l_capture;

pub use v4l_capture::WebcamCapture;

use crate::error::CameraError;
use anyhow::Result;
use image::RgbImage;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};

/// Consecutive capture failures tolerated before the capture thread gives up.
const MAX_CAPTURE_FAILURES: u32 = 30;

/// Trait for camera capture sources
pub trait CaptureSource {
    /// Capture a single frame
    fn capture_frame(&mut self) -> Result<RgbImage>;

    /// Get the resolution of captured frames
    fn resolution(&self) -> (u32, u32);
}

pub type LatestFrame = Option<Arc<RgbImage>>;

/// A live camera stream: its native resolution plus the most recent frame.
#[derive(Clone)]
pub struct StreamHandle {
    resolution: (u32, u32),
    frames: watch::Receiver<LatestFrame>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("resolution", &self.resolution)
            .finish_non_exhaustive()
    }
}

impl StreamHandle {
    pub fn new(resolution: (u32, u32), frames: watch::Receiver<LatestFrame>) -> Self {
        Self { resolution, frames }
    }

    /// A stream that always yields the same frame.
    #[cfg(test)]
    pub fn still(frame: RgbImage) -> Self {
        let resolution = frame.dimensions();
        let (_tx, rx) = watch::channel(Some(Arc::new(frame)));
        Self::new(resolution, rx)
    }

    pub fn resolution(&self) -> (u32, u32) {
        self.resolution
    }

    /// Height over width.
    pub fn aspect_ratio(&self) -> f32 {
        let (width, height) = self.resolution;
        height as f32 / width.max(1) as f32
    }

    pub fn latest(&self) -> LatestFrame {
        self.frames.borrow().clone()
    }
}

/// Opens the camera on a dedicated capture thread. Resolves once the
/// device reports its resolution.
pub async fn acquire(device_index: u32) -> Result<StreamHandle, CameraError> {
    let (ready_tx, ready_rx) = oneshot::channel();
    let (frame_tx, frame_rx) = watch::channel(None);

    std::thread::Builder::new()
        .name("camera-capture".to_string())
        .spawn(move || {
            let mut capture = match WebcamCapture::open(device_index) {
                Ok(capture) => {
                    let _ = ready_tx.send(Ok(capture.resolution()));
                    capture
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            run_capture_loop(&mut capture, &frame_tx);
        })
        .map_err(|err| CameraError::Backend(err.to_string()))?;

    let resolution = ready_rx
        .await
        .map_err(|_| CameraError::Backend("capture thread exited before opening".to_string()))??;

    Ok(StreamHandle::new(resolution, frame_rx))
}

/// Publishes frames until every [`StreamHandle`] is dropped or the source
/// keeps failing.
pub fn run_capture_loop<C: CaptureSource>(capture: &mut C, frames: &watch::Sender<LatestFrame>) {
    let mut failures = 0;
    loop {
        if frames.is_closed() {
            tracing::info!("Camera stream released");
            return;
        }

        match capture.capture_frame() {
            Ok(frame) => {
                failures = 0;
                frames.send_replace(Some(Arc::new(frame)));
            }
            Err(err) => {
                failures += 1;
                tracing::warn!("Capture failed ({}/{}): {:#}", failures, MAX_CAPTURE_FAILURES, err);
                if failures >= MAX_CAPTURE_FAILURES {
                    tracing::error!("Giving up on camera after repeated failures");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::bail;
    use image::Rgb;

    struct ScriptedSource {
        good_frames: u32,
        calls: u32,
    }

    impl CaptureSource for ScriptedSource {
        fn capture_frame(&mut self) -> Result<RgbImage> {
            self.calls += 1;
            if self.calls <= self.good_frames {
                Ok(RgbImage::from_pixel(2, 2, Rgb([self.calls as u8, 0, 0])))
            } else {
                bail!("device unplugged")
            }
        }

        fn resolution(&self) -> (u32, u32) {
            (2, 2)
        }
    }

    #[test]
    fn loop_publishes_latest_and_stops_after_failures() {
        let (tx, rx) = watch::channel(None);
        let handle = StreamHandle::new((2, 2), rx);
        let mut source = ScriptedSource {
            good_frames: 3,
            calls: 0,
        };

        run_capture_loop(&mut source, &tx);

        assert_eq!(source.calls, 3 + MAX_CAPTURE_FAILURES);
        let latest = handle.latest().expect("a frame was published");
        assert_eq!(latest.get_pixel(0, 0)[0], 3);
    }

    #[test]
    fn loop_stops_when_stream_is_released() {
        let (tx, rx) = watch::channel(None);
        drop(rx);
        let mut source = ScriptedSource {
            good_frames: 100,
            calls: 0,
        };
        run_capture_loop(&mut source, &tx);
        assert_eq!(source.calls, 0);
    }

    #[test]
    fn still_stream_reports_metadata() {
        let stream = StreamHandle::still(RgbImage::new(640, 480));
        assert_eq!(stream.resolution(), (640, 480));
        assert!((stream.aspect_ratio() - 0.75).abs() < 1e-6);
        assert!(stream.latest().is_some());
    }
}
