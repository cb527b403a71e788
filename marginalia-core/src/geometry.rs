use tracing::debug;

use crate::model::PageRegion;

/// Smallest scale the normalizer will divide by.
pub const MIN_SCALE: f32 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportPoint {
    pub x: f32,
    pub y: f32,
}

impl ViewportPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Screen-space rectangle in viewport pixels. Volatile: invalidated by any
/// zoom or scroll.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ViewportRect {
    pub left: f32,
    pub top: f32,
    pub width: f32,
    pub height: f32,
}

impl ViewportRect {
    pub fn new(left: f32, top: f32, width: f32, height: f32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    pub fn contains(&self, point: ViewportPoint) -> bool {
        point.x >= self.left
            && point.x <= self.left + self.width
            && point.y >= self.top
            && point.y <= self.top + self.height
    }
}

/// Reports the on-screen origin of a rendered page container.
///
/// Implemented by the embedding viewer; the core never measures the screen
/// itself, which keeps the coordinate math testable without a renderer.
pub trait PageMetrics {
    fn container_origin(&self, page: u32) -> Option<ViewportPoint>;
}

/// Converts between volatile viewport coordinates and stable, unscaled
/// document units: `normalized = (raw - origin) / scale`.
#[derive(Debug, Clone, Copy)]
pub struct GeometryNormalizer {
    origin: Option<ViewportPoint>,
    scale: f32,
}

impl Default for GeometryNormalizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryNormalizer {
    pub fn new() -> Self {
        Self {
            origin: None,
            scale: 1.0,
        }
    }

    pub fn scale(&self) -> f32 {
        self.scale
    }

    pub fn set_scale(&mut self, scale: f32) {
        self.scale = scale.max(MIN_SCALE);
    }

    pub fn origin(&self) -> Option<ViewportPoint> {
        self.origin
    }

    /// Render-complete hook: re-measure the container origin for the page now
    /// displayed. Must be called whenever the displayed page or scale
    /// changes.
    pub fn remeasure(&mut self, metrics: &dyn PageMetrics, page: u32) {
        self.origin = metrics.container_origin(page);
        if self.origin.is_none() {
            debug!(page, "page container not measured; using raw coordinates");
        }
    }

    /// Drops the measured origin until the next `remeasure`.
    pub fn invalidate(&mut self) {
        self.origin = None;
    }

    /// Converts a viewport rectangle into unscaled document units. When the
    /// container has not been measured yet the raw coordinates are kept as an
    /// approximate placement; the anchor degrades rather than being lost.
    pub fn normalize(&self, raw: ViewportRect) -> PageRegion {
        let Some(origin) = self.origin else {
            return PageRegion::Rect {
                x: raw.left,
                y: raw.top,
                width: raw.width,
                height: raw.height,
            };
        };
        let scale = self.scale.max(MIN_SCALE);
        PageRegion::Rect {
            x: (raw.left - origin.x) / scale,
            y: (raw.top - origin.y) / scale,
            width: raw.width / scale,
            height: raw.height / scale,
        }
    }

    /// Projects a stored region back to the screen at the scale current at
    /// render time, not capture time. This is what makes an anchor stick to
    /// its text across zoom changes.
    pub fn project(&self, region: &PageRegion) -> ViewportRect {
        let (x, y) = region.origin();
        let (width, height) = region.size().unwrap_or((0.0, 0.0));
        let Some(origin) = self.origin else {
            return ViewportRect::new(x, y, width, height);
        };
        let scale = self.scale.max(MIN_SCALE);
        ViewportRect::new(
            x * scale + origin.x,
            y * scale + origin.y,
            width * scale,
            height * scale,
        )
    }
}
