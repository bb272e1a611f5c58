mod loopback;

pub use loopback::V4L2Output;

use anyhow::{Context, Result};
use image::{RgbImage, RgbaImage};

/// Where presented overlay frames go.
pub trait OutputSink: Send {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()>;

    /// Writes an RGBA canvas that already holds the whole picture.
    fn write_canvas(&mut self, canvas: &RgbaImage) -> Result<()>;

    /// Resolution frames are scaled to before writing.
    fn resolution(&self) -> (u32, u32);
}

/// Opens the loopback device at `device`, or returns `None` to run headless.
pub fn open_sink(device: Option<&str>, width: u32, height: u32) -> Result<Option<Box<dyn OutputSink>>> {
    let Some(path) = device else {
        tracing::info!("No output device given; running headless");
        return Ok(None);
    };

    let output = V4L2Output::new(path, width, height)
        .context("Failed to initialize v4l2loopback output")?;
    let (out_width, out_height) = output.resolution();
    tracing::info!("Presenting to {} at {}x{}", path, out_width, out_height);
    Ok(Some(Box::new(output)))
}
