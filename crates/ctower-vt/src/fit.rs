//! Container-to-grid geometry, the equivalent of a "fit" addon.

/// Approximate advance width of a monospace glyph relative to its font size.
const CHAR_WIDTH_RATIO: f64 = 0.6;

/// Slack absorbed before flooring, so float noise never drops a whole cell.
const FIT_SLACK: f64 = 1e-3;

const MIN_COLS: u32 = 2;
const MIN_ROWS: u32 = 1;

/// Terminal grid size in character cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl TermSize {
    pub const fn new(cols: u16, rows: u16) -> Self {
        Self { cols, rows }
    }

    /// Sizes this small only show up when a container is hidden.
    pub fn is_degenerate(&self) -> bool {
        self.cols < 2 || self.rows < 2
    }
}

impl Default for TermSize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

/// Font parameters that determine the cell size.
///
/// `line_height` is a geometry-mode parameter: an instance built for one line
/// height cannot be reused for another. `font_size` can change in place.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeometryOptions {
    pub font_size: u16,
    pub line_height: f32,
}

impl GeometryOptions {
    pub fn new(font_size: u16, line_height: f32) -> Self {
        Self {
            font_size,
            line_height,
        }
    }

    /// Whether an instance built with `other` can be reused for `self`.
    pub fn same_mode(&self, other: &GeometryOptions) -> bool {
        (self.line_height - other.line_height).abs() < f32::EPSILON
    }

    fn cell_width(&self) -> f64 {
        f64::from(self.font_size) * CHAR_WIDTH_RATIO
    }

    fn cell_height(&self) -> f64 {
        f64::from(self.font_size) * f64::from(self.line_height)
    }
}

impl Default for GeometryOptions {
    fn default() -> Self {
        Self::new(14, 1.2)
    }
}

/// Pixel size of the element a terminal is rendered into.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ContainerSize {
    pub width: u32,
    pub height: u32,
}

impl ContainerSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// A zero-area container is hidden (e.g. `display: none`).
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Compute the grid that fits into `container` with the given font options.
///
/// Returns `None` for a zero-area container; fitting a hidden element would
/// collapse the grid to a sliver.
pub fn fit(container: ContainerSize, options: &GeometryOptions) -> Option<TermSize> {
    if container.is_empty() || options.font_size == 0 {
        return None;
    }

    let cols = (f64::from(container.width) / options.cell_width() + FIT_SLACK).floor() as u32;
    let rows = (f64::from(container.height) / options.cell_height() + FIT_SLACK).floor() as u32;

    Some(TermSize {
        cols: cols.clamp(MIN_COLS, u32::from(u16::MAX)) as u16,
        rows: rows.clamp(MIN_ROWS, u32::from(u16::MAX)) as u16,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fit_default_font() {
        let size = fit(ContainerSize::new(840, 510), &GeometryOptions::default()).unwrap();
        assert_eq!(size, TermSize::new(100, 30));
    }

    #[test]
    fn test_fit_exact_boundary() {
        // 14px * 1.2 = 16.8px rows; 504px is exactly 30 rows.
        let size = fit(ContainerSize::new(840, 504), &GeometryOptions::default()).unwrap();
        assert_eq!(size.rows, 30);
    }

    #[test]
    fn test_fit_zero_area() {
        let opts = GeometryOptions::default();
        assert!(fit(ContainerSize::new(0, 500), &opts).is_none());
        assert!(fit(ContainerSize::new(500, 0), &opts).is_none());
    }

    #[test]
    fn test_fit_tiny_container_clamps() {
        let size = fit(ContainerSize::new(3, 3), &GeometryOptions::default()).unwrap();
        assert_eq!(size, TermSize::new(2, 1));
    }

    #[test]
    fn test_larger_font_fewer_cells() {
        let small = fit(ContainerSize::new(1000, 600), &GeometryOptions::new(12, 1.2)).unwrap();
        let large = fit(ContainerSize::new(1000, 600), &GeometryOptions::new(24, 1.2)).unwrap();
        assert!(large.cols < small.cols);
        assert!(large.rows < small.rows);
    }

    #[test]
    fn test_same_mode_ignores_font_size() {
        let a = GeometryOptions::new(12, 1.2);
        let b = GeometryOptions::new(20, 1.2);
        let c = GeometryOptions::new(12, 1.5);
        assert!(a.same_mode(&b));
        assert!(!a.same_mode(&c));
    }

    #[test]
    fn test_degenerate_sizes() {
        assert!(TermSize::new(1, 1).is_degenerate());
        assert!(TermSize::new(80, 1).is_degenerate());
        assert!(!TermSize::new(2, 2).is_degenerate());
    }
}
