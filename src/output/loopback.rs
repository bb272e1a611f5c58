use super::OutputSink;
use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Pixel, Rgb, RgbImage, RgbaImage};
use std::fs::File;
use std::io::Write;
use std::path::Path;
use v4l::video::Output;
use v4l::{Device, FourCC};

/// Writes composed overlay frames to a v4l2loopback device so any video
/// consumer can display them.
pub struct V4L2Output {
    file: File,
    width: u32,
    height: u32,
}

impl V4L2Output {
    pub fn new<P: AsRef<Path>>(device_path: P, width: u32, height: u32) -> Result<Self> {
        let path = device_path.as_ref();
        tracing::info!(
            "Opening v4l2loopback device at {} ({}x{})",
            path.display(),
            width,
            height
        );

        let device = Device::with_path(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;
        let mut format = Output::format(&device).context("Failed to query output format")?;
        format.width = width;
        format.height = height;
        format.fourcc = FourCC::new(b"YUYV");
        let applied = Output::set_format(&device, &format).context("Failed to set output format")?;
        if (applied.width, applied.height) != (width, height) {
            tracing::warn!(
                "Loopback device accepted {}x{} instead of {}x{}",
                applied.width,
                applied.height,
                width,
                height
            );
        }

        // v4l2loopback accepts raw frame data written to the device file
        let file = File::options()
            .write(true)
            .open(path)
            .with_context(|| format!("Failed to open v4l2loopback device at {}", path.display()))?;

        tracing::info!("v4l2loopback device opened successfully");

        Ok(Self {
            file,
            width: applied.width,
            height: applied.height,
        })
    }
}

impl V4L2Output {
    fn write_image<P>(&mut self, image: &ImageBuffer<P, Vec<u8>>) -> Result<()>
    where
        P: Pixel<Subpixel = u8> + 'static,
    {
        let _span = tracing::debug_span!("loopback_write").entered();

        let yuyv = if image.dimensions() != (self.width, self.height) {
            let resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
            pack_yuyv(&resized)
        } else {
            pack_yuyv(image)
        };

        self.file
            .write_all(&yuyv)
            .context("Failed to write frame to v4l2loopback device")
    }
}

/// Packs any 8-bit image into YUV 4:2:2 (YUYV), two pixels per four bytes.
/// Alpha is dropped; an RGBA canvas packs the same as its RGB channels.
fn pack_yuyv<P: Pixel<Subpixel = u8>>(image: &ImageBuffer<P, Vec<u8>>) -> Vec<u8> {
    let (width, height) = image.dimensions();
    let mut yuyv = Vec::with_capacity((width * height * 2) as usize);

    for y in 0..height {
        for x in (0..width).step_by(2) {
            let left = image.get_pixel(x, y).to_rgb();
            let right = if x + 1 < width {
                image.get_pixel(x + 1, y).to_rgb()
            } else {
                left
            };

            let (y0, u0, v0) = bt601(left);
            let (y1, u1, v1) = bt601(right);
            yuyv.extend_from_slice(&[y0, ((u0 + u1) / 2) as u8, y1, ((v0 + v1) / 2) as u8]);
        }
    }

    yuyv
}

/// Fixed-point BT.601 full-range conversion. Chroma is returned wide so
/// pairs can be averaged without overflow.
fn bt601(Rgb([r, g, b]): Rgb<u8>) -> (u8, u16, u16) {
    let (r, g, b) = (r as i32, g as i32, b as i32);
    let y = (77 * r + 150 * g + 29 * b) >> 8;
    let u = ((-43 * r - 85 * g + 128 * b) >> 8) + 128;
    let v = ((128 * r - 107 * g - 21 * b) >> 8) + 128;
    (y.clamp(0, 255) as u8, u.clamp(0, 255) as u16, v.clamp(0, 255) as u16)
}

impl OutputSink for V4L2Output {
    fn write_frame(&mut self, frame: &RgbImage) -> Result<()> {
        self.write_image(frame)
    }

    fn write_canvas(&mut self, canvas: &RgbaImage) -> Result<()> {
        self.write_image(canvas)
    }

    fn resolution(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn yuyv_is_two_bytes_per_pixel() {
        let img = RgbImage::from_pixel(4, 2, Rgb([255, 255, 255]));
        let packed = pack_yuyv(&img);
        assert_eq!(packed.len(), 16);
        assert_eq!(&packed[..4], &[255, 128, 255, 128]);
    }

    #[test]
    fn grey_has_neutral_chroma() {
        let (y, u, v) = bt601(Rgb([128, 128, 128]));
        assert_eq!((y, u, v), (128, 128, 128));
    }

    #[test]
    fn pure_red_pushes_v_high() {
        let (y, u, v) = bt601(Rgb([255, 0, 0]));
        assert_eq!(y, 76);
        assert!(u < 128);
        assert_eq!(v, 255);
    }

    #[test]
    fn canvas_packs_without_alpha() {
        let opaque = RgbaImage::from_pixel(3, 1, Rgba([40, 200, 90, 255]));
        let clear = RgbaImage::from_pixel(3, 1, Rgba([40, 200, 90, 0]));
        let rgb = RgbImage::from_pixel(3, 1, Rgb([40, 200, 90]));
        assert_eq!(pack_yuyv(&opaque), pack_yuyv(&rgb));
        assert_eq!(pack_yuyv(&clear), pack_yuyv(&rgb));
        // odd width repeats the last pixel
        assert_eq!(pack_yuyv(&rgb).len(), 8);
    }
}
