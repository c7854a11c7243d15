//! Height dependent position corrections.
//!
//! Two calibration representations answer the same question, "what is the
//! correction of each calibration grid cell at height h":
//! - `HeightCalibrationSeries`: slices sampled at known heights, linearly
//!   interpolated between the bracketing pair.
//! - `RegressionSeries`: a cubic per cell and axis, evaluated directly.
//!
//! Both accept an optional `HeightCompensation` that shifts the query height
//! per cell by the leveling offset of the bed region the cell lies in.

use std::collections::{BTreeMap, HashMap};

use crate::curve::{Grid, GridIndex};
use crate::error::CalibrationError;

/// Region letters in row-major order over the 3x3 bed partition.
pub const REGION_KEYS: [&str; 9] = ["A", "B", "C", "D", "E", "F", "G", "H", "I"];

/// Chessboard pixel layout used to place calibration cells on the bed.
const DPMM: f64 = 5.0;
const PADDING_PX: f64 = 100.0;
const SQUARE_MM: f64 = 10.0;

/// Height offsets (mm) per bed third.
///
/// ```text
/// A | B | C
/// D | E | F
/// G | H | I
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LevelingOffsetGrid {
    pub offsets: [f64; 9],
}

impl LevelingOffsetGrid {
    /// Regions absent from `map` are treated as level.
    pub fn from_map(map: &BTreeMap<String, f64>) -> Self {
        let mut offsets = [0.0; 9];
        for (slot, key) in offsets.iter_mut().zip(REGION_KEYS) {
            *slot = map.get(key).copied().unwrap_or(0.0);
        }
        Self { offsets }
    }

    /// Offset of the region containing `(x, y)`. Points on a boundary belong
    /// to the lower region.
    pub fn offset_at(&self, x: f64, y: f64, workarea: [f64; 2]) -> f64 {
        let third = |v: f64, extent: f64| {
            if v > extent * (2.0 / 3.0) {
                2
            } else if v > extent * (1.0 / 3.0) {
                1
            } else {
                0
            }
        };
        let xi = third(x, workarea[0]);
        let yi = third(y, workarea[1]);
        self.offsets[yi * 3 + xi]
    }
}

/// Inputs for per-cell height compensation.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightCompensation {
    /// Bed center in the perspective-corrected image, px.
    pub center_px: [f64; 2],
    /// Chessboard dimension in squares.
    pub chessboard: [usize; 2],
    /// Bed size, mm.
    pub workarea: [f64; 2],
    pub leveling: LevelingOffsetGrid,
}

impl HeightCompensation {
    /// Bed position (mm) of every cell of a `rows` x `cols` calibration grid.
    ///
    /// The first grid axis walks the chessboard's x direction.
    pub fn cell_positions(&self, rows: usize, cols: usize) -> Grid<[f64; 2]> {
        let split = [rows.saturating_sub(1), cols.saturating_sub(1)];
        let square = |i: usize, axis: usize| -> usize {
            let n = self.chessboard[axis];
            if split[axis] == 0 || n == 0 {
                return 0;
            }
            ((i * n) / split[axis]).min(n - 1)
        };
        let to_mm = |square: usize, axis: usize| {
            let px = PADDING_PX + square as f64 * SQUARE_MM * DPMM;
            (px - self.center_px[axis]) / DPMM + self.workarea[axis] / 2.0
        };
        Grid::from_fn(rows, cols, |GridIndex { row, col }| {
            [to_mm(square(row, 0), 0), to_mm(square(col, 1), 1)]
        })
    }

    fn heights(&self, h: f64, rows: usize, cols: usize) -> Grid<f64> {
        self.cell_positions(rows, cols)
            .map(|&[x, y]| h + self.leveling.offset_at(x, y, self.workarea))
    }
}

/// Correction slices sampled at ascending heights.
#[derive(Debug, Clone, PartialEq)]
pub struct HeightCalibrationSeries {
    heights: Vec<f64>,
    slices: Vec<Grid<[f64; 2]>>,
}

impl HeightCalibrationSeries {
    pub fn new(heights: Vec<f64>, slices: Vec<Grid<[f64; 2]>>) -> Result<Self, CalibrationError> {
        if heights.len() != slices.len() {
            return Err(CalibrationError::LengthMismatch {
                heights: heights.len(),
                slices: slices.len(),
            });
        }
        if heights
            .windows(2)
            .any(|w| w[0].partial_cmp(&w[1]) != Some(std::cmp::Ordering::Less))
        {
            return Err(CalibrationError::UnsortedHeights);
        }
        if let Some(first) = slices.first() {
            let expected = first.shape();
            if let Some((index, s)) = slices.iter().enumerate().find(|(_, s)| s.shape() != expected)
            {
                return Err(CalibrationError::ShapeMismatch {
                    index,
                    expected,
                    actual: s.shape(),
                });
            }
        }
        Ok(Self { heights, slices })
    }

    pub fn heights(&self) -> &[f64] {
        &self.heights
    }

    pub fn slices(&self) -> &[Grid<[f64; 2]>] {
        &self.slices
    }

    /// Largest `i` in `[0, len - 2]` with `heights[i] <= h`, 0 if none.
    fn bracket(&self, h: f64) -> usize {
        let upper = self.heights.len().saturating_sub(1);
        self.heights[..upper]
            .partition_point(|&v| v <= h)
            .saturating_sub(1)
    }

    /// Correction grid at height `h`.
    ///
    /// Heights outside the calibrated range extrapolate linearly from the
    /// first or last bracket.
    pub fn interpolate(&self, h: f64, compensation: Option<&HeightCompensation>) -> Grid<[f64; 2]> {
        match self.slices.as_slice() {
            [] => return Grid::empty(),
            [only] => return only.clone(),
            _ => {}
        }
        let (rows, cols) = self.slices[0].shape();
        let cell_heights = compensation.map(|c| c.heights(h, rows, cols));

        let mut brackets: HashMap<u64, usize> = HashMap::new();
        Grid::from_fn(rows, cols, |idx| {
            let h = cell_heights.as_ref().map_or(h, |g| g[idx]);
            let i = *brackets.entry(h.to_bits()).or_insert_with(|| self.bracket(h));
            let (h0, h1) = (self.heights[i], self.heights[i + 1]);
            let (v0, v1) = (self.slices[i][idx], self.slices[i + 1][idx]);
            let r = (h - h0) / (h1 - h0);
            [
                v0[0] * (1.0 - r) + v1[0] * r,
                v0[1] * (1.0 - r) + v1[1] * r,
            ]
        })
    }
}

/// Cubic coefficients `[a, b, c, d]` for x and y of one cell.
pub type CellRegression = [[f64; 4]; 2];

#[derive(Debug, Clone, PartialEq)]
pub struct RegressionSeries {
    params: Grid<CellRegression>,
}

impl RegressionSeries {
    pub fn new(params: Grid<CellRegression>) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Grid<CellRegression> {
        &self.params
    }

    pub fn evaluate(&self, h: f64, compensation: Option<&HeightCompensation>) -> Grid<[f64; 2]> {
        let (rows, cols) = self.params.shape();
        let cell_heights = compensation.map(|c| c.heights(h, rows, cols));
        Grid::from_fn(rows, cols, |idx| {
            let h = cell_heights.as_ref().map_or(h, |g| g[idx]);
            let [px, py] = self.params[idx];
            [cubic(px, h), cubic(py, h)]
        })
    }
}

#[inline]
fn cubic([a, b, c, d]: [f64; 4], h: f64) -> f64 {
    a * h.powi(3) + b * h.powi(2) + c * h + d
}
