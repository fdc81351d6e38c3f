use shared::graph::{Position, ViewportState};

pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 5.0;
pub const ZOOM_STEP: f64 = 1.2;

/// Axis-aligned rectangle in canvas space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CanvasRect {
    pub min: Position,
    pub max: Position,
}

impl CanvasRect {
    pub fn new(min: Position, max: Position) -> Self {
        Self { min, max }
    }

    pub fn width(&self) -> f64 {
        self.max.x - self.min.x
    }

    pub fn height(&self) -> f64 {
        self.max.y - self.min.y
    }

    pub fn center(&self) -> Position {
        self.min.lerp(self.max, 0.5)
    }

    pub fn contains(&self, point: Position) -> bool {
        point.x >= self.min.x
            && point.x <= self.max.x
            && point.y >= self.min.y
            && point.y <= self.max.y
    }
}

/// Screen/canvas transform: `screen = canvas * zoom + pan`.
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportController {
    zoom: f64,
    pan_x: f64,
    pan_y: f64,
    width: f64,
    height: f64,
}

impl Default for ViewportController {
    fn default() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
            width: 0.0,
            height: 0.0,
        }
    }
}

impl ViewportController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn zoom(&self) -> f64 {
        self.zoom
    }

    pub fn pan(&self) -> (f64, f64) {
        (self.pan_x, self.pan_y)
    }

    pub fn surface_size(&self) -> (f64, f64) {
        (self.width, self.height)
    }

    pub fn state(&self) -> ViewportState {
        ViewportState {
            zoom: self.zoom,
            pan_x: self.pan_x,
            pan_y: self.pan_y,
        }
    }

    /// Applies a persisted viewport; zoom is clamped and non-finite values ignored.
    pub fn apply(&mut self, state: ViewportState) -> bool {
        self.apply_remote(Some(state.zoom), Some(state.pan_x), Some(state.pan_y))
    }

    pub fn screen_to_canvas(&self, x: f64, y: f64) -> Position {
        Position::new((x - self.pan_x) / self.zoom, (y - self.pan_y) / self.zoom)
    }

    pub fn canvas_to_screen(&self, x: f64, y: f64) -> Position {
        Position::new(x * self.zoom + self.pan_x, y * self.zoom + self.pan_y)
    }

    /// Returns whether the transform changed.
    pub fn set_zoom(&mut self, new_zoom: f64, anchor: Option<(f64, f64)>) -> bool {
        if !new_zoom.is_finite() {
            return false;
        }
        let old_zoom = self.zoom;
        let new_zoom = clamp_zoom(new_zoom);
        if new_zoom == old_zoom {
            return false;
        }

        if let Some((anchor_x, anchor_y)) = anchor {
            let ratio = new_zoom / old_zoom;
            self.pan_x = anchor_x - (anchor_x - self.pan_x) * ratio;
            self.pan_y = anchor_y - (anchor_y - self.pan_y) * ratio;
        }
        self.zoom = new_zoom;
        true
    }

    pub fn zoom_in(&mut self, anchor: Option<(f64, f64)>) -> bool {
        let anchor = anchor.or_else(|| self.surface_center());
        self.set_zoom(self.zoom * ZOOM_STEP, anchor)
    }

    pub fn zoom_out(&mut self, anchor: Option<(f64, f64)>) -> bool {
        let anchor = anchor.or_else(|| self.surface_center());
        self.set_zoom(self.zoom / ZOOM_STEP, anchor)
    }

    pub fn pan_by(&mut self, dx: f64, dy: f64) -> bool {
        if !dx.is_finite() || !dy.is_finite() || (dx == 0.0 && dy == 0.0) {
            return false;
        }
        self.pan_x += dx;
        self.pan_y += dy;
        true
    }

    pub fn set_surface_size(&mut self, width: f64, height: f64) {
        self.width = width.max(0.0);
        self.height = height.max(0.0);
    }

    /// Values pushed by the backend; absent fields keep their local value.
    pub fn apply_remote(
        &mut self,
        zoom: Option<f64>,
        pan_x: Option<f64>,
        pan_y: Option<f64>,
    ) -> bool {
        let before = self.state();
        if let Some(zoom) = zoom.filter(|z| z.is_finite() && *z > 0.0) {
            self.zoom = clamp_zoom(zoom);
        }
        if let Some(pan_x) = pan_x.filter(|v| v.is_finite()) {
            self.pan_x = pan_x;
        }
        if let Some(pan_y) = pan_y.filter(|v| v.is_finite()) {
            self.pan_y = pan_y;
        }
        self.state() != before
    }

    /// Centers `bounds` in the surface with `padding` screen pixels on every side.
    pub fn fit_to_bounds(&mut self, bounds: CanvasRect, padding: f64) -> bool {
        if self.width <= 0.0 || self.height <= 0.0 {
            return false;
        }
        let usable_w = (self.width - padding * 2.0).max(1.0);
        let usable_h = (self.height - padding * 2.0).max(1.0);
        let zoom = if bounds.width() > 0.0 && bounds.height() > 0.0 {
            clamp_zoom((usable_w / bounds.width()).min(usable_h / bounds.height()))
        } else {
            self.zoom
        };
        let center = bounds.center();
        let before = self.state();
        self.zoom = zoom;
        self.pan_x = self.width / 2.0 - center.x * zoom;
        self.pan_y = self.height / 2.0 - center.y * zoom;
        self.state() != before
    }

    pub fn visible_canvas_rect(&self) -> CanvasRect {
        CanvasRect::new(
            self.screen_to_canvas(0.0, 0.0),
            self.screen_to_canvas(self.width, self.height),
        )
    }

    pub fn surface_center(&self) -> Option<(f64, f64)> {
        (self.width > 0.0 && self.height > 0.0).then(|| (self.width / 2.0, self.height / 2.0))
    }
}

fn clamp_zoom(zoom: f64) -> f64 {
    zoom.clamp(MIN_ZOOM, MAX_ZOOM)
}

#[cfg(test)]
#[path = "tests/viewport_tests.rs"]
mod tests;
