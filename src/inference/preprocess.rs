use image::{imageops, RgbImage};
use ndarray::Array4;

/// Preprocessor for converting RGB frames to model input tensors
pub struct Preprocessor {
    target_width: u32,
    target_height: u32,
}

impl Preprocessor {
    pub fn new(target_width: u32, target_height: u32) -> Self {
        Self {
            target_width,
            target_height,
        }
    }

    /// Network input size for a frame, snapped so `(size - 1)` is a
    /// multiple of `stride`.
    pub fn for_stride(frame: (u32, u32), internal_resolution: f32, stride: u32) -> Self {
        let snap = |dim: u32| {
            let scaled = (dim as f32 * internal_resolution).max(1.0) as u32;
            (scaled / stride) * stride + 1
        };
        Self::new(snap(frame.0), snap(frame.1))
    }

    pub fn target_size(&self) -> (u32, u32) {
        (self.target_width, self.target_height)
    }

    fn resized(&self, image: &RgbImage) -> RgbImage {
        if image.dimensions() != (self.target_width, self.target_height) {
            imageops::resize(
                image,
                self.target_width,
                self.target_height,
                imageops::FilterType::Triangle,
            )
        } else {
            image.clone()
        }
    }

    /// NHWC float tensor with MobileNet normalisation (`x / 127.5 - 1`).
    ///
    /// Returns: Array4<f32> with shape [1, height, width, 3]
    pub fn mobilenet_nhwc(&self, image: &RgbImage) -> Array4<f32> {
        let _span = tracing::debug_span!("preprocess").entered();

        let resized = self.resized(image);
        let (width, height) = resized.dimensions();
        let mut tensor = Array4::<f32>::zeros((1, height as usize, width as usize, 3));

        for (x, y, pixel) in resized.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c] as f32 / 127.5 - 1.0;
            }
        }

        tensor
    }

    /// NHWC uint8 tensor at the frame's own resolution.
    pub fn raw_nhwc(image: &RgbImage) -> Array4<u8> {
        let _span = tracing::debug_span!("preprocess").entered();

        let (width, height) = image.dimensions();
        let mut tensor = Array4::<u8>::zeros((1, height as usize, width as usize, 3));
        for (x, y, pixel) in image.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, y as usize, x as usize, c]] = pixel[c];
            }
        }
        tensor
    }

    /// Nearest-neighbour resize of a label grid back to frame dimensions.
    pub fn upscale_labels(
        labels: &[i8],
        grid_width: u32,
        grid_height: u32,
        target_width: u32,
        target_height: u32,
    ) -> Vec<i8> {
        let _span = tracing::debug_span!("postprocess").entered();

        if grid_width == target_width && grid_height == target_height {
            return labels.to_vec();
        }

        let mut output = Vec::with_capacity((target_width * target_height) as usize);
        for y in 0..target_height {
            let gy = ((y as u64 * grid_height as u64) / target_height.max(1) as u64) as u32;
            let gy = gy.min(grid_height.saturating_sub(1));
            for x in 0..target_width {
                let gx = ((x as u64 * grid_width as u64) / target_width.max(1) as u64) as u32;
                let gx = gx.min(grid_width.saturating_sub(1));
                output.push(labels[(gy * grid_width + gx) as usize]);
            }
        }
        output
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn stride_snapping() {
        let pre = Preprocessor::for_stride((640, 480), 0.5, 16);
        assert_eq!(pre.target_size(), (321, 241));
    }

    #[test]
    fn mobilenet_normalisation_range() {
        let mut img = RgbImage::new(2, 1);
        img.put_pixel(0, 0, Rgb([0, 0, 0]));
        img.put_pixel(1, 0, Rgb([255, 255, 255]));
        let tensor = Preprocessor::new(2, 1).mobilenet_nhwc(&img);
        assert_eq!(tensor.shape(), &[1, 1, 2, 3]);
        assert!((tensor[[0, 0, 0, 0]] + 1.0).abs() < 1e-6);
        assert!((tensor[[0, 0, 1, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn labels_upscale_nearest() {
        let labels = [0i8, 1, 2, -1];
        let out = Preprocessor::upscale_labels(&labels, 2, 2, 4, 4);
        assert_eq!(out.len(), 16);
        assert_eq!(&out[0..4], &[0, 0, 1, 1]);
        assert_eq!(&out[12..16], &[2, 2, -1, -1]);
    }
}
