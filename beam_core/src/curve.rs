//! Sampled height field over a rectangular bed region.

use std::cell::OnceCell;
use std::ops::Index;

use crate::error::CalibrationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GridIndex {
    pub row: usize,
    pub col: usize,
}

impl GridIndex {
    #[inline]
    pub const fn new(row: usize, col: usize) -> Self {
        Self { row, col }
    }
}

/// Row-major 2D grid whose dimensions never change after construction.
#[derive(Debug, Clone, PartialEq)]
pub struct Grid<T> {
    rows: usize,
    cols: usize,
    cells: Vec<T>,
}

impl<T> Grid<T> {
    pub fn from_fn(rows: usize, cols: usize, mut f: impl FnMut(GridIndex) -> T) -> Self {
        let mut cells = Vec::with_capacity(rows * cols);
        for row in 0..rows {
            for col in 0..cols {
                cells.push(f(GridIndex::new(row, col)));
            }
        }
        Self { rows, cols, cells }
    }

    /// Build from nested rows; `None` when the rows are ragged.
    pub fn from_rows(rows: Vec<Vec<T>>) -> Option<Self> {
        let n_rows = rows.len();
        let n_cols = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|r| r.len() != n_cols) {
            return None;
        }
        let cells: Vec<T> = rows.into_iter().flatten().collect();
        Some(Self {
            rows: n_rows,
            cols: if cells.is_empty() { 0 } else { n_cols },
            cells,
        })
    }

    pub fn empty() -> Self {
        Self {
            rows: 0,
            cols: 0,
            cells: Vec::new(),
        }
    }

    #[inline]
    pub fn rows(&self) -> usize {
        self.rows
    }

    #[inline]
    pub fn cols(&self) -> usize {
        self.cols
    }

    #[inline]
    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline]
    pub fn contains(&self, idx: GridIndex) -> bool {
        idx.row < self.rows && idx.col < self.cols
    }

    pub fn get(&self, idx: GridIndex) -> Option<&T> {
        self.contains(idx)
            .then(|| &self.cells[idx.row * self.cols + idx.col])
    }

    pub(crate) fn get_mut(&mut self, idx: GridIndex) -> Option<&mut T> {
        if self.contains(idx) {
            Some(&mut self.cells[idx.row * self.cols + idx.col])
        } else {
            None
        }
    }

    pub fn row(&self, row: usize) -> &[T] {
        let start = (row * self.cols).min(self.cells.len());
        let end = ((row + 1) * self.cols).min(self.cells.len());
        &self.cells[start..end]
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.cells.iter()
    }

    pub fn indexed(&self) -> impl Iterator<Item = (GridIndex, &T)> {
        let cols = self.cols.max(1);
        self.cells
            .iter()
            .enumerate()
            .map(move |(i, v)| (GridIndex::new(i / cols, i % cols), v))
    }

    pub fn indices(&self) -> impl Iterator<Item = GridIndex> + use<T> {
        let cols = self.cols;
        (0..self.rows).flat_map(move |r| (0..cols).map(move |c| GridIndex::new(r, c)))
    }

    pub fn map<U>(&self, mut f: impl FnMut(&T) -> U) -> Grid<U> {
        Grid {
            rows: self.rows,
            cols: self.cols,
            cells: self.cells.iter().map(&mut f).collect(),
        }
    }
}

impl<T> Index<GridIndex> for Grid<T> {
    type Output = T;

    fn index(&self, idx: GridIndex) -> &T {
        assert!(self.contains(idx), "grid index {idx:?} out of bounds");
        &self.cells[idx.row * self.cols + idx.col]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct BBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl BBox {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// One grid sample. `z == None` marks a point that failed to measure.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct MeasuredPoint {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
    pub quality: [Option<f64>; 2],
}

/// Upper bound on samples along one grid axis.
pub const MAX_SAMPLES_PER_AXIS: usize = 1_000;

/// Number of samples along an extent: one per gap plus the far edge.
/// `None` when that would exceed `MAX_SAMPLES_PER_AXIS`.
fn samples_along(extent: f64, gap: f64) -> Option<usize> {
    if !(extent > 0.0) {
        return Some(1);
    }
    // Guard against 40.000000001 / 20 producing an extra column.
    let steps = (extent / gap - 1e-9).ceil().max(0.0);
    if !(steps < MAX_SAMPLES_PER_AXIS as f64) {
        return None;
    }
    Some(steps as usize + 1)
}

/// Plan sample positions for `bbox` at spacing `gap`. The last row/column
/// is clamped to the far edge.
pub fn plan_grid(bbox: &BBox, gap: [f64; 2]) -> Result<Grid<[f64; 2]>, CalibrationError> {
    for (axis, g) in ["gap_x", "gap_y"].into_iter().zip(gap) {
        if !(g.is_finite() && g > 0.0) {
            return Err(CalibrationError::InvalidValue {
                key: axis.to_string(),
                value: g.to_string(),
            });
        }
    }
    if bbox.width < 0.0 || bbox.height < 0.0 {
        return Err(CalibrationError::OutOfEnvelope {
            width: bbox.width,
            height: bbox.height,
        });
    }
    let too_dense = |key: &str, extent: f64, g: f64| CalibrationError::InvalidValue {
        key: key.to_string(),
        value: format!("{g} (over {MAX_SAMPLES_PER_AXIS} samples across {extent} mm)"),
    };
    let cols =
        samples_along(bbox.width, gap[0]).ok_or_else(|| too_dense("gap_x", bbox.width, gap[0]))?;
    let rows =
        samples_along(bbox.height, gap[1]).ok_or_else(|| too_dense("gap_y", bbox.height, gap[1]))?;
    Ok(Grid::from_fn(rows, cols, |idx| {
        [
            bbox.x + (idx.col as f64 * gap[0]).min(bbox.width),
            bbox.y + (idx.row as f64 * gap[1]).min(bbox.height),
        ]
    }))
}

/// Result of measuring a batch of points: new values for the given cells.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MeasureData {
    pub points: Vec<(GridIndex, MeasuredPoint)>,
    pub failed: Vec<GridIndex>,
}

/// Measured height field plus its derived extrema.
#[derive(Debug, Clone)]
pub struct CurveEngravingData {
    pub bbox: BBox,
    pub gap: [f64; 2],
    points: Grid<MeasuredPoint>,
    errors: Vec<GridIndex>,
    highest: f64,
    lowest: f64,
    object_height: f64,
    margin: f64,
    subdivided: OnceCell<Grid<MeasuredPoint>>,
}

impl PartialEq for CurveEngravingData {
    // The subdivision cache is derived state and does not take part.
    fn eq(&self, other: &Self) -> bool {
        self.bbox == other.bbox
            && self.gap == other.gap
            && self.points == other.points
            && self.margin == other.margin
    }
}

impl CurveEngravingData {
    /// Unmeasured data for `bbox`: every point present with `z == None`.
    pub fn planned(bbox: BBox, gap: [f64; 2], margin: f64) -> Result<Self, CalibrationError> {
        let layout = plan_grid(&bbox, gap)?;
        let points = layout.map(|&[x, y]| MeasuredPoint {
            x,
            y,
            ..MeasuredPoint::default()
        });
        Ok(Self::from_points(bbox, gap, points, margin))
    }

    /// Wrap an existing grid (e.g. restored from a saved document).
    pub fn from_points(bbox: BBox, gap: [f64; 2], points: Grid<MeasuredPoint>, margin: f64) -> Self {
        let mut data = Self {
            bbox,
            gap,
            points,
            errors: Vec::new(),
            highest: 0.0,
            lowest: 0.0,
            object_height: 0.0,
            margin,
            subdivided: OnceCell::new(),
        };
        data.recompute();
        data
    }

    #[inline]
    pub fn points(&self) -> &Grid<MeasuredPoint> {
        &self.points
    }

    #[inline]
    pub fn errors(&self) -> &[GridIndex] {
        &self.errors
    }

    #[inline]
    pub fn highest(&self) -> f64 {
        self.highest
    }

    #[inline]
    pub fn lowest(&self) -> f64 {
        self.lowest
    }

    #[inline]
    pub fn object_height(&self) -> f64 {
        self.object_height
    }

    /// Overwrite the given cells and recompute derived values.
    ///
    /// Fails without touching anything when an index is outside the grid.
    pub fn apply(&mut self, measured: &MeasureData) -> Result<(), GridIndex> {
        if let Some(bad) = measured
            .points
            .iter()
            .map(|(i, _)| *i)
            .chain(measured.failed.iter().copied())
            .find(|i| !self.points.contains(*i))
        {
            return Err(bad);
        }
        for (idx, p) in &measured.points {
            if let Some(cell) = self.points.get_mut(*idx) {
                *cell = *p;
            }
        }
        for idx in &measured.failed {
            if let Some(cell) = self.points.get_mut(*idx) {
                cell.z = None;
            }
        }
        self.recompute();
        Ok(())
    }

    fn recompute(&mut self) {
        let mut highest = f64::NEG_INFINITY;
        let mut lowest = f64::INFINITY;
        self.errors.clear();
        for (idx, p) in self.points.indexed() {
            match p.z {
                Some(z) => {
                    highest = highest.max(z);
                    lowest = lowest.min(z);
                }
                None => self.errors.push(idx),
            }
        }
        if highest.is_finite() {
            self.highest = highest;
            self.lowest = lowest;
        } else {
            self.highest = 0.0;
            self.lowest = 0.0;
        }
        self.object_height = self.highest + self.margin;
        self.subdivided = OnceCell::new();
    }

    /// Denser grid for rendering: one midpoint between every pair of
    /// neighbours, bilinear in z. Regenerated lazily after any change.
    pub fn subdivided(&self) -> &Grid<MeasuredPoint> {
        self.subdivided.get_or_init(|| subdivide(&self.points))
    }

    /// Whether the derived subdivided grid is currently cached.
    pub fn is_subdivided_cached(&self) -> bool {
        self.subdivided.get().is_some()
    }

    /// Points that carry a height.
    pub fn measured_points(&self) -> impl Iterator<Item = &MeasuredPoint> {
        self.points.iter().filter(|p| p.z.is_some())
    }

    /// Height at which the head can travel over the object without touching it.
    pub fn safe_height(&self) -> f64 {
        self.highest.min(self.lowest - self.object_height).max(0.0)
    }
}

fn mean(values: &[Option<f64>]) -> Option<f64> {
    let mut sum = 0.0;
    for v in values {
        sum += (*v)?;
    }
    Some(sum / values.len() as f64)
}

fn subdivide(points: &Grid<MeasuredPoint>) -> Grid<MeasuredPoint> {
    if points.is_empty() {
        return Grid::empty();
    }
    let rows = points.rows() * 2 - 1;
    let cols = points.cols() * 2 - 1;
    Grid::from_fn(rows, cols, |idx| {
        let r0 = idx.row / 2;
        let c0 = idx.col / 2;
        let r1 = r0 + idx.row % 2;
        let c1 = c0 + idx.col % 2;
        let corners = [
            points[GridIndex::new(r0, c0)],
            points[GridIndex::new(r0, c1)],
            points[GridIndex::new(r1, c0)],
            points[GridIndex::new(r1, c1)],
        ];
        MeasuredPoint {
            x: (corners[0].x + corners[3].x) / 2.0,
            y: (corners[0].y + corners[3].y) / 2.0,
            z: mean(&corners.map(|p| p.z)),
            quality: [None, None],
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(BBox::new(0.0, 0.0, 40.0, 20.0), [20.0, 20.0], (2, 3))]
    #[case(BBox::new(0.0, 0.0, 45.0, 20.0), [20.0, 20.0], (2, 4))]
    #[case(BBox::new(5.0, 5.0, 0.0, 0.0), [20.0, 20.0], (1, 1))]
    fn grid_shape(#[case] bbox: BBox, #[case] gap: [f64; 2], #[case] shape: (usize, usize)) {
        assert_eq!(plan_grid(&bbox, gap).unwrap().shape(), shape);
    }

    #[test]
    fn last_column_is_clamped_to_edge() {
        let g = plan_grid(&BBox::new(10.0, 0.0, 45.0, 0.0), [20.0, 20.0]).unwrap();
        let xs: Vec<f64> = g.row(0).iter().map(|p| p[0]).collect();
        assert_eq!(xs, [10.0, 30.0, 50.0, 55.0]);
    }

    #[test]
    fn zero_gap_is_rejected() {
        assert!(plan_grid(&BBox::new(0.0, 0.0, 10.0, 10.0), [0.0, 5.0]).is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        assert!(Grid::from_rows(vec![vec![1, 2], vec![3]]).is_none());
        let g = Grid::from_rows(vec![vec![1, 2], vec![3, 4]]).unwrap();
        assert_eq!(g[GridIndex::new(1, 0)], 3);
    }

    #[test]
    fn planning_rejects_grids_too_dense_to_allocate() {
        let bbox = BBox::new(0.0, 0.0, 100.0, 100.0);
        let err = CurveEngravingData::planned(bbox, [1e-300, 20.0], 10.0).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidValue { ref key, .. } if key == "gap_x"));

        let err = plan_grid(&BBox::new(0.0, 0.0, 400.0, 400.0), [20.0, 0.001]).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidValue { ref key, .. } if key == "gap_y"));

        let err = plan_grid(&BBox::new(0.0, 0.0, f64::INFINITY, 10.0), [20.0, 20.0]).unwrap_err();
        assert!(matches!(err, CalibrationError::InvalidValue { .. }));

        let g = plan_grid(&BBox::new(0.0, 0.0, 999.0, 0.0), [1.0, 1.0]).unwrap();
        assert_eq!(g.shape(), (1, 1_000));
    }

    #[test]
    fn planned_data_has_no_heights() {
        let d = CurveEngravingData::planned(BBox::new(0.0, 0.0, 20.0, 20.0), [10.0, 10.0], 10.0)
            .unwrap();
        assert_eq!(d.errors().len(), 9);
        assert_eq!(d.highest(), 0.0);
        assert_eq!(d.object_height(), 10.0);
        assert_eq!(d.measured_points().count(), 0);
    }

    #[test]
    fn apply_recomputes_and_invalidates() {
        let mut d =
            CurveEngravingData::planned(BBox::new(0.0, 0.0, 10.0, 0.0), [10.0, 10.0], 5.0).unwrap();
        let _ = d.subdivided();
        assert!(d.is_subdivided_cached());

        let at = |col, z| {
            (
                GridIndex::new(0, col),
                MeasuredPoint {
                    x: col as f64 * 10.0,
                    y: 0.0,
                    z: Some(z),
                    quality: [None, None],
                },
            )
        };
        d.apply(&MeasureData {
            points: vec![at(0, 2.0), at(1, -1.0)],
            failed: vec![],
        })
        .unwrap();

        assert_eq!(d.highest(), 2.0);
        assert_eq!(d.lowest(), -1.0);
        assert_eq!(d.object_height(), 7.0);
        assert!(d.errors().is_empty());
        assert!(!d.is_subdivided_cached());

        let sub = d.subdivided();
        assert_eq!(sub.shape(), (1, 3));
        assert_eq!(sub[GridIndex::new(0, 1)].z, Some(0.5));
        assert_eq!(sub[GridIndex::new(0, 1)].x, 5.0);
    }

    #[test]
    fn apply_with_bad_index_changes_nothing() {
        let mut d =
            CurveEngravingData::planned(BBox::new(0.0, 0.0, 10.0, 0.0), [10.0, 10.0], 5.0).unwrap();
        let before = d.clone();
        let bad = GridIndex::new(3, 0);
        assert_eq!(
            d.apply(&MeasureData {
                points: vec![(GridIndex::new(0, 0), MeasuredPoint::default())],
                failed: vec![bad],
            }),
            Err(bad)
        );
        assert_eq!(d, before);
    }

    #[test]
    fn safe_height_never_negative() {
        let points = Grid::from_rows(vec![vec![
            MeasuredPoint { z: Some(3.0), ..Default::default() },
            MeasuredPoint { z: Some(1.0), ..Default::default() },
        ]])
        .unwrap();
        let d = CurveEngravingData::from_points(BBox::default(), [10.0, 10.0], points, 10.0);
        // lowest - object_height = 1 - 13 < 0
        assert_eq!(d.safe_height(), 0.0);
    }
}
