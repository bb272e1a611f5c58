//! Canvas and video sizing.

/// Video resolution assumed before a stream is attached.
pub const DEFAULT_SOURCE: (u32, u32) = (640, 480);

/// Aspect ratio (height / width) assumed before stream metadata arrives.
pub const DEFAULT_ASPECT_RATIO: f32 = 0.75;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewportDimensions {
    pub video_width: u32,
    pub video_height: u32,
    pub canvas_width: u32,
    pub canvas_height: u32,
    /// Height over width.
    pub aspect_ratio: f32,
}

/// Factors mapping `source` pixels onto a `canvas` of the given size.
pub fn scale_factors(canvas: (u32, u32), source: (u32, u32)) -> (f32, f32) {
    (
        canvas.0 as f32 / source.0.max(1) as f32,
        canvas.1 as f32 / source.1.max(1) as f32,
    )
}

impl ViewportDimensions {
    pub fn canvas_size(&self) -> (u32, u32) {
        (self.canvas_width, self.canvas_height)
    }
}

/// Breakpoint policy between narrow and wide viewports.
#[derive(Debug, Clone, Copy)]
pub struct ViewportGeometry {
    pub narrow_threshold: u32,
    pub margin: u32,
}

impl ViewportGeometry {
    pub fn new(narrow_threshold: u32, margin: u32) -> Self {
        Self {
            narrow_threshold,
            margin,
        }
    }

    pub fn is_narrow(&self, container_width: u32) -> bool {
        container_width < self.narrow_threshold
    }

    pub fn compute(
        &self,
        container_width: u32,
        aspect_ratio: f32,
        source: Option<(u32, u32)>,
    ) -> ViewportDimensions {
        compute_dimensions(
            container_width,
            aspect_ratio,
            self.is_narrow(container_width),
            self.margin,
            source,
        )
    }
}

/// Narrow viewports clamp to the container minus `margin` and derive the
/// height from the aspect ratio. Wide viewports use the native resolution.
pub fn compute_dimensions(
    container_width: u32,
    aspect_ratio: f32,
    is_narrow: bool,
    margin: u32,
    source: Option<(u32, u32)>,
) -> ViewportDimensions {
    let (width, height) = if is_narrow {
        let width = container_width.saturating_sub(margin).max(1);
        let height = ((width as f32 * aspect_ratio) as u32).max(1);
        (width, height)
    } else {
        source.unwrap_or(DEFAULT_SOURCE)
    };

    ViewportDimensions {
        video_width: width,
        video_height: height,
        canvas_width: width,
        canvas_height: height,
        aspect_ratio,
    }
}
