use super::{ColorAssignment, DrawingSurface};
use crate::output::OutputSink;
use anyhow::{Context, Result};
use image::{imageops, RgbImage, RgbaImage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Whether the camera frame shows beneath the canvas when presenting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoLayer {
    /// Canvas is a transparent overlay on top of the frame.
    Visible,
    /// Canvas already contains the frame.
    Hidden,
}

/// The drawing surface, its class colours and the optional output device.
/// This is the one piece of state frame loops and the controller share.
pub struct Stage {
    surface: Box<dyn DrawingSurface>,
    colors: ColorAssignment,
    sink: Option<Box<dyn OutputSink>>,
    presented: u64,
}

pub type SharedStage = Arc<Mutex<Stage>>;

impl Stage {
    pub fn new(
        surface: Box<dyn DrawingSurface>,
        colors: ColorAssignment,
        sink: Option<Box<dyn OutputSink>>,
    ) -> Self {
        Self {
            surface,
            colors,
            sink,
            presented: 0,
        }
    }

    pub fn shared(self) -> SharedStage {
        Arc::new(Mutex::new(self))
    }

    /// Locks a shared stage, recovering the guard if a frame loop panicked
    /// while holding it.
    pub fn lock(stage: &SharedStage) -> MutexGuard<'_, Stage> {
        stage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.surface.dimensions()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if self.surface.dimensions() != (width, height) {
            tracing::debug!("Resizing canvas to {}x{}", width, height);
            self.surface.resize(width, height);
        }
        self.surface.clear();
    }

    pub fn clear(&mut self) {
        self.surface.clear();
    }

    /// Surface and colour table, borrowed together for rendering.
    pub fn parts_mut(&mut self) -> (&mut dyn DrawingSurface, &mut ColorAssignment) {
        (self.surface.as_mut(), &mut self.colors)
    }

    pub fn surface_mut(&mut self) -> &mut dyn DrawingSurface {
        self.surface.as_mut()
    }

    pub fn presented_frames(&self) -> u64 {
        self.presented
    }

    /// Writes the canvas to the output device, if any. A hidden video layer
    /// sends the canvas as is; a visible one blends it over `frame` first.
    pub fn present(&mut self, frame: &RgbImage, layer: VideoLayer) -> Result<()> {
        self.presented += 1;
        let Some(sink) = self.sink.as_mut() else {
            return Ok(());
        };
        let written = match layer {
            VideoLayer::Hidden => sink.write_canvas(self.surface.pixels()),
            VideoLayer::Visible => {
                let composed = compose_over(self.surface.pixels(), frame);
                sink.write_frame(&composed)
            }
        };
        written.context("Failed to write frame")
    }

}

/// Alpha-blends `canvas` over `frame`, scaling the frame to the canvas.
fn compose_over(canvas: &RgbaImage, frame: &RgbImage) -> RgbImage {
    let _span = tracing::debug_span!("compose").entered();

    let (width, height) = canvas.dimensions();
    let mut base = if frame.dimensions() != (width, height) {
        imageops::resize(frame, width, height, imageops::FilterType::Triangle)
    } else {
        frame.clone()
    };
    for (x, y, out) in base.enumerate_pixels_mut() {
        let overlay = canvas.get_pixel(x, y);
        let alpha = overlay[3] as f32 / 255.0;
        if alpha == 0.0 {
            continue;
        }
        for c in 0..3 {
            out[c] = (out[c] as f32 * (1.0 - alpha) + overlay[c] as f32 * alpha).round() as u8;
        }
    }
    base
}
