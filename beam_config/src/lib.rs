#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]
//! Config schemas and calibration series parsing for the calibration engine.
//!
//! - `Config` and sub-structs are deserialized from TOML and validated.
//! - The height series CSV loader enforces headers and a complete grid per
//!   height before handing the slices to the core.
use std::collections::BTreeMap;

use serde::Deserialize;

/// Height calibration series CSV schema.
///
/// Expected headers:
/// height,row,col,dx,dy
///
/// Example:
/// height,row,col,dx,dy
/// 0.0,0,0,1.25,-0.5
/// 0.0,0,1,1.30,-0.4
#[derive(Debug, Deserialize, Clone, Copy, PartialEq)]
pub struct SeriesRow {
    pub height: f64,
    pub row: usize,
    pub col: usize,
    pub dx: f64,
    pub dy: f64,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Device {
    /// Device identifier handed to the transport on connect.
    pub id: String,
    /// Workarea model; must match one of the `[[workarea]]` entries.
    pub model: String,
    /// Firmware command dialect: 1 or 2.
    pub fcode_version: u8,
    /// Wrap workflow motion in line-checked mode.
    pub line_check: bool,
}

impl Default for Device {
    fn default() -> Self {
        Self {
            id: "simulator".into(),
            model: "ado1".into(),
            fcode_version: 2,
            line_check: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Response timeout per raw command (ms).
    pub command_ms: u64,
    pub home_ms: u64,
    /// Delay after entering raw mode (ms).
    pub settle_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            command_ms: 30_000,
            home_ms: 10_000,
            settle_ms: 3_000,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Raw {
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Default feed rate for moves (mm/min)
    pub feed_rate: u32,
}

impl Default for Raw {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_backoff_ms: 200,
            feed_rate: 6_000,
        }
    }
}

/// Smallest sample spacing accepted for curve measurement.
pub const MIN_GAP_MM: f64 = 1.0;

/// Largest grid index accepted in a height series CSV.
pub const MAX_SERIES_INDEX: usize = 1_000;

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Curve {
    pub gap_x: f64,
    pub gap_y: f64,
    pub object_height_margin_mm: f64,
    pub probe_timeout_ms: u64,
}

impl Default for Curve {
    fn default() -> Self {
        Self {
            gap_x: 20.0,
            gap_y: 20.0,
            object_height_margin_mm: 10.0,
            probe_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Preferences {
    /// Open-bottom mode; selects the borderless camera offset when supported.
    pub borderless: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Workarea {
    pub model: String,
    pub width: f64,
    pub height: f64,
    /// Auto-focus probe offset from the head, `[x, y, z]` mm.
    #[serde(default)]
    pub auto_focus_offset: Option<[f64; 3]>,
    #[serde(default)]
    pub camera_center: Option<[f64; 2]>,
    #[serde(default)]
    pub supports_curve_engraving: bool,
    #[serde(default)]
    pub supports_open_bottom: bool,
}

/// Per-region leveling offsets (mm) and the chessboard layout used to place
/// calibration cells on the bed.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Leveling {
    /// Region offsets keyed `A`..`I`, row-major over bed thirds.
    pub offsets: BTreeMap<String, f64>,
    /// Bed center in the perspective-corrected image (px).
    pub center_px: Option<[f64; 2]>,
    /// Chessboard dimension in squares.
    pub chessboard: [usize; 2],
}

impl Default for Leveling {
    fn default() -> Self {
        Self {
            offsets: BTreeMap::new(),
            center_px: None,
            chessboard: [24, 14],
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Logging {
    pub file: Option<String>,  // path to .log (JSON lines)
    pub level: Option<String>, // "info","debug"
    /// Log rotation policy: "never" | "daily" | "hourly" (default: never)
    pub rotation: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: Device,
    pub timeouts: Timeouts,
    pub raw: Raw,
    pub curve: Curve,
    pub preferences: Preferences,
    #[serde(rename = "workarea")]
    pub workareas: Vec<Workarea>,
    pub leveling: Leveling,
    pub logging: Logging,
}

pub fn load_toml(s: &str) -> Result<Config, toml::de::Error> {
    toml::from_str::<Config>(s)
}

impl Config {
    /// The `[[workarea]]` entry for the configured device model.
    pub fn active_workarea(&self) -> Option<&Workarea> {
        self.workareas.iter().find(|w| w.model == self.device.model)
    }

    pub fn validate(&self) -> eyre::Result<()> {
        // Device
        if self.device.id.trim().is_empty() {
            eyre::bail!("device.id must not be empty");
        }
        if !matches!(self.device.fcode_version, 1 | 2) {
            eyre::bail!("device.fcode_version must be 1 or 2");
        }

        // Timeouts
        if self.timeouts.command_ms == 0 {
            eyre::bail!("timeouts.command_ms must be >= 1");
        }
        if self.timeouts.home_ms == 0 {
            eyre::bail!("timeouts.home_ms must be >= 1");
        }
        if self.timeouts.settle_ms > 60_000 {
            eyre::bail!("timeouts.settle_ms is unreasonably large (>60s)");
        }

        // Raw
        if self.raw.max_retries > 100 {
            eyre::bail!("raw.max_retries must be <= 100");
        }
        if self.raw.feed_rate == 0 {
            eyre::bail!("raw.feed_rate must be > 0");
        }

        // Curve
        if !(self.curve.gap_x.is_finite() && self.curve.gap_x >= MIN_GAP_MM) {
            eyre::bail!("curve.gap_x must be >= {MIN_GAP_MM} mm");
        }
        if !(self.curve.gap_y.is_finite() && self.curve.gap_y >= MIN_GAP_MM) {
            eyre::bail!("curve.gap_y must be >= {MIN_GAP_MM} mm");
        }
        if !(self.curve.object_height_margin_mm >= 0.0) {
            eyre::bail!("curve.object_height_margin_mm must be >= 0");
        }
        if self.curve.probe_timeout_ms == 0 {
            eyre::bail!("curve.probe_timeout_ms must be >= 1");
        }

        // Workareas
        for (i, w) in self.workareas.iter().enumerate() {
            if w.model.trim().is_empty() {
                eyre::bail!("workarea[{i}].model must not be empty");
            }
            if !(w.width > 0.0 && w.height > 0.0) {
                eyre::bail!("workarea '{}' must have positive width and height", w.model);
            }
            if self.workareas[..i].iter().any(|o| o.model == w.model) {
                eyre::bail!("workarea '{}' is defined more than once", w.model);
            }
        }

        // Leveling
        const REGIONS: [&str; 9] = ["A", "B", "C", "D", "E", "F", "G", "H", "I"];
        if let Some(key) = self.leveling.offsets.keys().find(|k| !REGIONS.contains(&k.as_str())) {
            eyre::bail!("leveling.offsets has unknown region '{key}' (expected A..I)");
        }
        if self.leveling.chessboard.contains(&0) {
            eyre::bail!("leveling.chessboard dimensions must be >= 1");
        }

        // Logging
        if let Some(r) = self.logging.rotation.as_deref()
            && !matches!(r, "never" | "daily" | "hourly")
        {
            eyre::bail!("logging.rotation must be one of never|daily|hourly, got '{r}'");
        }

        Ok(())
    }
}

/// Height calibration slices grouped by ascending height.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct HeightSeriesTable {
    pub heights: Vec<f64>,
    /// `slices[k][row][col] = [dx, dy]` for `heights[k]`.
    pub slices: Vec<Vec<Vec<[f64; 2]>>>,
}

impl HeightSeriesTable {
    /// Group rows by height. Every height must cover a full grid, each cell
    /// exactly once, and all heights must share one grid shape.
    pub fn from_rows(rows: &[SeriesRow]) -> eyre::Result<Self> {
        let mut by_height: Vec<(f64, Vec<SeriesRow>)> = Vec::new();
        let limit = rows.len().min(MAX_SERIES_INDEX);
        for (i, r) in rows.iter().enumerate() {
            if !r.height.is_finite() {
                eyre::bail!("height series contains non-finite height");
            }
            if r.row >= limit || r.col >= limit {
                eyre::bail!(
                    "height series entry {}: cell ({}, {}) is out of range (limit {limit})",
                    i + 1,
                    r.row,
                    r.col
                );
            }
            match by_height.iter_mut().find(|(h, _)| *h == r.height) {
                Some((_, v)) => v.push(*r),
                None => by_height.push((r.height, vec![*r])),
            }
        }
        by_height.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut table = Self::default();
        let mut shape: Option<(usize, usize)> = None;
        for (height, cells) in by_height {
            let n_rows = cells.iter().map(|c| c.row).max().map_or(0, |m| m + 1);
            let n_cols = cells.iter().map(|c| c.col).max().map_or(0, |m| m + 1);
            match shape {
                None => shape = Some((n_rows, n_cols)),
                Some(s) if s != (n_rows, n_cols) => eyre::bail!(
                    "height {height} has a {n_rows}x{n_cols} grid, expected {}x{}",
                    s.0,
                    s.1
                ),
                Some(_) => {}
            }
            let mut grid: Vec<Vec<Option<[f64; 2]>>> = vec![vec![None; n_cols]; n_rows];
            for c in &cells {
                let slot = &mut grid[c.row][c.col];
                if slot.is_some() {
                    eyre::bail!("height {height} has duplicate cell ({}, {})", c.row, c.col);
                }
                *slot = Some([c.dx, c.dy]);
            }
            let mut slice = Vec::with_capacity(n_rows);
            for (r, row) in grid.into_iter().enumerate() {
                let mut out = Vec::with_capacity(n_cols);
                for (c, cell) in row.into_iter().enumerate() {
                    let Some(v) = cell else {
                        eyre::bail!("height {height} is missing cell ({r}, {c})");
                    };
                    out.push(v);
                }
                slice.push(out);
            }
            table.heights.push(height);
            table.slices.push(slice);
        }
        Ok(table)
    }
}

pub fn load_height_series_csv(path: &std::path::Path) -> eyre::Result<HeightSeriesTable> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| eyre::eyre!("open height series CSV {:?}: {}", path, e))?;

    // Enforce exact headers
    let headers = rdr
        .headers()
        .map_err(|e| eyre::eyre!("read CSV headers {:?}: {}", path, e))?
        .clone();
    let expected = ["height", "row", "col", "dx", "dy"];
    let actual: Vec<String> = headers.iter().map(|s| s.to_string()).collect();
    if actual != expected {
        eyre::bail!(
            "height series CSV must have headers 'height,row,col,dx,dy', got: {}",
            actual.join(",")
        );
    }

    let mut rows = Vec::new();
    for (idx, rec) in rdr.deserialize::<SeriesRow>().enumerate() {
        match rec {
            Ok(row) => rows.push(row),
            Err(e) => {
                eyre::bail!("invalid CSV row {}: {}", idx + 2, e);
            }
        }
    }
    if rows.is_empty() {
        eyre::bail!("height series CSV {:?} has no rows", path);
    }

    HeightSeriesTable::from_rows(&rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg = load_toml("").unwrap();
        assert_eq!(cfg.device.fcode_version, 2);
        assert!(cfg.device.line_check);
        assert_eq!(cfg.timeouts.command_ms, 30_000);
        assert_eq!(cfg.leveling.chessboard, [24, 14]);
        assert!(cfg.workareas.is_empty());
        cfg.validate().unwrap();
    }

    #[test]
    fn active_workarea_follows_device_model() {
        let cfg = load_toml(
            r#"
[device]
model = "fbb2"

[[workarea]]
model = "ado1"
width = 430
height = 300

[[workarea]]
model = "fbb2"
width = 600
height = 375
supports_curve_engraving = true
"#,
        )
        .unwrap();
        let w = cfg.active_workarea().unwrap();
        assert_eq!(w.width, 600.0);
        assert!(w.supports_curve_engraving);
        assert!(!w.supports_open_bottom);
    }
}
