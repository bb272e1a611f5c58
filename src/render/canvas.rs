use super::{DrawingSurface, RectF};
use ab_glyph::{FontArc, PxScale};
use anyhow::{Context, Result};
use image::{imageops, Rgba, RgbImage, RgbaImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_line_segment_mut,
    draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use std::path::Path;

const SYSTEM_FONTS: [&str; 4] = [
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf",
];

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// RGBA drawing surface backed by `imageproc`.
pub struct Canvas {
    image: RgbaImage,
    font: Option<FontArc>,
    warned_no_font: bool,
}

impl Canvas {
    pub fn new(width: u32, height: u32, font: Option<FontArc>) -> Self {
        Self {
            image: RgbaImage::new(width.max(1), height.max(1)),
            font,
            warned_no_font: false,
        }
    }

    pub fn load_font<P: AsRef<Path>>(path: P) -> Result<FontArc> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read font {}", path.display()))?;
        FontArc::try_from_vec(bytes)
            .with_context(|| format!("Failed to parse font {}", path.display()))
    }

    /// First readable font among common system locations.
    pub fn find_system_font() -> Option<FontArc> {
        SYSTEM_FONTS.iter().find_map(|path| match Self::load_font(path) {
            Ok(font) => {
                tracing::debug!("Using label font {}", path);
                Some(font)
            }
            Err(_) => None,
        })
    }

    fn rect(&self, rect: RectF) -> Option<Rect> {
        let width = rect.width.round() as i64;
        let height = rect.height.round() as i64;
        if width <= 0 || height <= 0 {
            return None;
        }
        Some(Rect::at(rect.x.round() as i32, rect.y.round() as i32).of_size(width as u32, height as u32))
    }
}

impl DrawingSurface for Canvas {
    fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }

    fn resize(&mut self, width: u32, height: u32) {
        self.image = RgbaImage::new(width.max(1), height.max(1));
    }

    fn clear(&mut self) {
        for pixel in self.image.pixels_mut() {
            *pixel = TRANSPARENT;
        }
    }

    fn stroke_rect(&mut self, rect: RectF, color: Rgba<u8>, line_width: f32) {
        let steps = line_width.round().max(1.0) as i32;
        for t in 0..steps {
            let inset = RectF::new(
                rect.x + t as f32,
                rect.y + t as f32,
                rect.width - 2.0 * t as f32,
                rect.height - 2.0 * t as f32,
            );
            if let Some(r) = self.rect(inset) {
                draw_hollow_rect_mut(&mut self.image, r, color);
            }
        }
    }

    fn fill_rect(&mut self, rect: RectF, color: Rgba<u8>) {
        if let Some(r) = self.rect(rect) {
            draw_filled_rect_mut(&mut self.image, r, color);
        }
    }

    fn measure_text(&self, text: &str, font_px: f32) -> f32 {
        match &self.font {
            Some(font) => text_size(PxScale::from(font_px), font, text).0 as f32,
            None => text.chars().count() as f32 * font_px * 0.5,
        }
    }

    fn fill_text(&mut self, text: &str, x: f32, y: f32, font_px: f32, color: Rgba<u8>) {
        match &self.font {
            Some(font) => draw_text_mut(
                &mut self.image,
                color,
                x.round() as i32,
                y.round() as i32,
                PxScale::from(font_px),
                font,
                text,
            ),
            None => {
                if !self.warned_no_font {
                    tracing::warn!("No label font available; captions are drawn without text");
                    self.warned_no_font = true;
                }
            }
        }
    }

    fn draw_point(&mut self, x: f32, y: f32, radius: f32, color: Rgba<u8>) {
        draw_filled_circle_mut(
            &mut self.image,
            (x.round() as i32, y.round() as i32),
            radius.round() as i32,
            color,
        );
    }

    fn draw_line(&mut self, from: (f32, f32), to: (f32, f32), color: Rgba<u8>, line_width: f32) {
        let steps = line_width.round().max(1.0) as i32;
        for i in 0..steps {
            let offset = i as f32 - (steps - 1) as f32 / 2.0;
            draw_line_segment_mut(
                &mut self.image,
                (from.0 + offset, from.1),
                (to.0 + offset, to.1),
                color,
            );
            draw_line_segment_mut(
                &mut self.image,
                (from.0, from.1 + offset),
                (to.0, to.1 + offset),
                color,
            );
        }
    }

    fn draw_mask(&mut self, source: &RgbImage, mask: &RgbaImage, opacity: f32) {
        let _span = tracing::debug_span!("draw_mask").entered();

        let (width, height) = self.image.dimensions();
        let source = if source.dimensions() != (width, height) {
            imageops::resize(source, width, height, imageops::FilterType::Triangle)
        } else {
            source.clone()
        };
        let mask = if mask.dimensions() != (width, height) {
            imageops::resize(mask, width, height, imageops::FilterType::Nearest)
        } else {
            mask.clone()
        };

        let opacity = opacity.clamp(0.0, 1.0);
        for (x, y, out) in self.image.enumerate_pixels_mut() {
            let src = source.get_pixel(x, y);
            let overlay = mask.get_pixel(x, y);
            let alpha = opacity * overlay[3] as f32 / 255.0;
            let blend = |s: u8, m: u8| (s as f32 * (1.0 - alpha) + m as f32 * alpha).round() as u8;
            *out = Rgba([
                blend(src[0], overlay[0]),
                blend(src[1], overlay[1]),
                blend(src[2], overlay[2]),
                255,
            ]);
        }
    }

    fn pixels(&self) -> &RgbaImage {
        &self.image
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn clear_makes_every_pixel_transparent() {
        let mut canvas = Canvas::new(8, 8, None);
        canvas.fill_rect(RectF::new(0.0, 0.0, 8.0, 8.0), Rgba([255, 0, 0, 255]));
        assert_eq!(*canvas.pixels().get_pixel(3, 3), Rgba([255, 0, 0, 255]));
        canvas.clear();
        assert!(canvas.pixels().pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn stroke_leaves_interior_untouched() {
        let mut canvas = Canvas::new(20, 20, None);
        canvas.stroke_rect(RectF::new(2.0, 2.0, 16.0, 16.0), Rgba([0, 255, 0, 255]), 3.0);
        assert_eq!(*canvas.pixels().get_pixel(2, 10), Rgba([0, 255, 0, 255]));
        assert_eq!(*canvas.pixels().get_pixel(4, 10), Rgba([0, 255, 0, 255]));
        assert_eq!(*canvas.pixels().get_pixel(10, 10), TRANSPARENT);
    }

    #[test]
    fn degenerate_rects_are_skipped() {
        let mut canvas = Canvas::new(4, 4, None);
        canvas.fill_rect(RectF::new(1.0, 1.0, 0.0, 3.0), Rgba([1, 2, 3, 255]));
        canvas.stroke_rect(RectF::new(1.0, 1.0, 2.0, 0.2), Rgba([1, 2, 3, 255]), 3.0);
        assert!(canvas.pixels().pixels().all(|p| *p == TRANSPARENT));
    }

    #[test]
    fn mask_blends_over_visible_source() {
        let mut canvas = Canvas::new(2, 1, None);
        let source = RgbImage::from_pixel(2, 1, Rgb([100, 100, 100]));
        let mut mask = RgbaImage::new(2, 1);
        mask.put_pixel(0, 0, Rgba([200, 0, 0, 255]));

        canvas.draw_mask(&source, &mask, 0.5);
        assert_eq!(*canvas.pixels().get_pixel(0, 0), Rgba([150, 50, 50, 255]));
        assert_eq!(*canvas.pixels().get_pixel(1, 0), Rgba([100, 100, 100, 255]));
    }

    #[test]
    fn measuring_without_font_estimates_width() {
        let canvas = Canvas::new(1, 1, None);
        assert_eq!(canvas.measure_text("abcd", 16.0), 32.0);
    }
}
