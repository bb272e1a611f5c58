mod canvas;
mod overlay;
mod stage;

pub use canvas::Canvas;
pub use overlay::{
    render_detections, render_segmentation, ColorAssignment, DetectionStyle, SkeletonStyle,
};
pub use stage::{SharedStage, Stage, VideoLayer};

use image::{Rgba, RgbImage, RgbaImage};

/// Rectangle in canvas pixel space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RectF {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl RectF {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// 2D drawing primitives over a fixed-size pixel grid.
pub trait DrawingSurface: Send {
    fn dimensions(&self) -> (u32, u32);

    /// Reallocates the grid; contents are cleared.
    fn resize(&mut self, width: u32, height: u32);

    fn clear(&mut self);

    fn stroke_rect(&mut self, rect: RectF, color: Rgba<u8>, line_width: f32);

    fn fill_rect(&mut self, rect: RectF, color: Rgba<u8>);

    /// Rendered width of `text` in pixels.
    fn measure_text(&self, text: &str, font_px: f32) -> f32;

    /// Draws `text` with its top-left corner at `(x, y)`.
    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Rgba<u8>);

    fn draw_point(&mut self, x: f32, y: f32, radius: f32, color: Rgba<u8>);

    fn draw_line(&mut self, from: (f32, f32), to: (f32, f32), color: Rgba<u8>, line_width: f32);

    /// Paints `source` and blends `mask` over it at `opacity`. Transparent
    /// mask pixels leave the source untouched.
    fn draw_mask(&mut self, source: &RgbImage, mask: &RgbaImage, opacity: f32);

    /// Current contents, RGBA with alpha 0 where nothing was drawn.
    fn pixels(&self) -> &RgbaImage;
}

#[cfg(test)]
pub(crate) mod testing {
    use super::{DrawingSurface, RectF};
    use image::{Rgba, RgbImage, RgbaImage};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum Op {
        Clear,
        StrokeRect(RectF, Rgba<u8>),
        FillRect(RectF, Rgba<u8>),
        FillText(String, f32, f32),
        Point(f32, f32),
        Line((f32, f32), (f32, f32)),
        Mask(f32),
    }

    /// Surface that records every call. The op log is shared so tests can
    /// inspect it after handing the surface to a stage.
    pub struct RecordingSurface {
        pub ops: Arc<Mutex<Vec<Op>>>,
        image: RgbaImage,
    }

    impl RecordingSurface {
        pub fn new(width: u32, height: u32) -> Self {
            Self {
                ops: Arc::new(Mutex::new(Vec::new())),
                image: RgbaImage::new(width, height),
            }
        }

        pub fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn push(&self, op: Op) {
            self.ops.lock().unwrap().push(op);
        }
    }

    impl DrawingSurface for RecordingSurface {
        fn dimensions(&self) -> (u32, u32) {
            self.image.dimensions()
        }

        fn resize(&mut self, width: u32, height: u32) {
            self.image = RgbaImage::new(width, height);
        }

        fn clear(&mut self) {
            self.push(Op::Clear);
        }

        fn stroke_rect(&mut self, rect: RectF, color: Rgba<u8>, _line_width: f32) {
            self.push(Op::StrokeRect(rect, color));
        }

        fn fill_rect(&mut self, rect: RectF, color: Rgba<u8>) {
            self.push(Op::FillRect(rect, color));
        }

        fn measure_text(&self, text: &str, _font_px: f32) -> f32 {
            text.chars().count() as f32 * 8.0
        }

        fn fill_text(&mut self, text: &str, x: f32, y: f32, _font_px: f32, _color: Rgba<u8>) {
            self.push(Op::FillText(text.to_string(), x, y));
        }

        fn draw_point(&mut self, x: f32, y: f32, _radius: f32, _color: Rgba<u8>) {
            self.push(Op::Point(x, y));
        }

        fn draw_line(&mut self, from: (f32, f32), to: (f32, f32), _color: Rgba<u8>, _line_width: f32) {
            self.push(Op::Line(from, to));
        }

        fn draw_mask(&mut self, _source: &RgbImage, _mask: &RgbaImage, opacity: f32) {
            self.push(Op::Mask(opacity));
        }

        fn pixels(&self) -> &RgbaImage {
            &self.image
        }
    }
}
