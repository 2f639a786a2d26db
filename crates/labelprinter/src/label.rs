//! Label geometry options.
//!
//! These options control the TSPL setup commands emitted ahead of the bitmap:
//! print width in dots, physical label size, inter-label gap and feed direction.

use crate::PRINT_WIDTH_DOTS;

/// Feed direction sent with the `DIRECTION` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrintDirection {
    /// `DIRECTION 0`: label comes out bottom first.
    Forward,
    /// `DIRECTION 1`: label comes out top first.
    #[default]
    Reverse,
}

impl PrintDirection {
    pub fn as_flag(self) -> u8 {
        match self {
            PrintDirection::Forward => 0,
            PrintDirection::Reverse => 1,
        }
    }

    pub fn from_flag(flag: u8) -> Option<Self> {
        match flag {
            0 => Some(PrintDirection::Forward),
            1 => Some(PrintDirection::Reverse),
            _ => None,
        }
    }
}

/// Target label geometry for the bitmap encoder.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelOptions {
    /// Print width in dots; images are scaled to exactly this width.
    pub dot_width: u32,

    /// Label width in inches (`SIZE` first argument).
    pub width_in: f32,

    /// Label height in inches (`SIZE` second argument).
    pub height_in: f32,

    /// Gap between labels in millimetres.
    pub gap_mm: f32,

    pub direction: PrintDirection,
}

impl Default for LabelOptions {
    fn default() -> Self {
        Self {
            dot_width: PRINT_WIDTH_DOTS,
            width_in: 4.0,
            height_in: 6.0,
            gap_mm: 3.0,
            direction: PrintDirection::Reverse,
        }
    }
}

impl LabelOptions {
    /// Create options for a 4x6 inch label on an 800-dot head.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set print width in dots.
    ///
    /// # Panics
    /// Panics if `dots` is zero.
    pub fn with_dot_width(mut self, dots: u32) -> Self {
        assert!(dots > 0, "Dot width must be positive, got {dots}");
        self.dot_width = dots;
        self
    }

    /// Builder: set label size in inches.
    ///
    /// # Panics
    /// Panics if either dimension is not strictly positive.
    pub fn with_size(mut self, width_in: f32, height_in: f32) -> Self {
        assert!(
            width_in > 0.0 && height_in > 0.0,
            "Label size must be positive, got {width_in}x{height_in}"
        );
        self.width_in = width_in;
        self.height_in = height_in;
        self
    }

    /// Builder: set gap between labels in millimetres.
    pub fn with_gap_mm(mut self, gap_mm: f32) -> Self {
        self.gap_mm = gap_mm.max(0.0);
        self
    }

    /// Builder: set feed direction.
    pub fn with_direction(mut self, direction: PrintDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Bytes per bitmap row (`ceil(dot_width / 8)`).
    pub fn width_bytes(&self) -> usize {
        (self.dot_width as usize).div_ceil(8)
    }
}
