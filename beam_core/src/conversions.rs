//! `From` implementations bridging `beam_config` types to `beam_core` types.
//!
//! Workarea and preference lookups get small local wrappers since both the
//! config structs and the collaborator traits live in other crates.

use std::collections::BTreeMap;

use beam_traits::{PreferenceStore, WorkareaGeometry, WorkareaProvider};

use crate::config::{CurveCfg, FcodeVersion, RawSessionCfg};
use crate::curve::Grid;
use crate::error::CalibrationError;
use crate::interpolation::{HeightCalibrationSeries, HeightCompensation, LevelingOffsetGrid};

// ── RawSessionCfg ────────────────────────────────────────────────────────────

impl From<&beam_config::Config> for RawSessionCfg {
    fn from(c: &beam_config::Config) -> Self {
        Self {
            fcode: if c.device.fcode_version == 1 {
                FcodeVersion::V1
            } else {
                FcodeVersion::V2
            },
            line_check: c.device.line_check,
            command_ms: c.timeouts.command_ms,
            home_ms: c.timeouts.home_ms,
            settle_ms: c.timeouts.settle_ms,
            max_retries: c.raw.max_retries,
            retry_backoff_ms: c.raw.retry_backoff_ms,
            feed_rate: c.raw.feed_rate,
        }
    }
}

// ── CurveCfg ─────────────────────────────────────────────────────────────────

impl From<&beam_config::Curve> for CurveCfg {
    fn from(c: &beam_config::Curve) -> Self {
        Self {
            gap: [c.gap_x, c.gap_y],
            object_height_margin: c.object_height_margin_mm,
            probe_ms: c.probe_timeout_ms,
        }
    }
}

// ── Leveling ─────────────────────────────────────────────────────────────────

/// Regions missing from the config are treated as level.
impl From<&beam_config::Leveling> for LevelingOffsetGrid {
    fn from(c: &beam_config::Leveling) -> Self {
        Self::from_map(&c.offsets)
    }
}

/// Compensation inputs for `workarea`; `None` without a calibrated image center.
pub fn height_compensation(
    leveling: &beam_config::Leveling,
    workarea: &WorkareaGeometry,
) -> Option<HeightCompensation> {
    Some(HeightCompensation {
        center_px: leveling.center_px?,
        chessboard: leveling.chessboard,
        workarea: [workarea.width, workarea.height],
        leveling: LevelingOffsetGrid::from(leveling),
    })
}

// ── Height series ────────────────────────────────────────────────────────────

impl TryFrom<&beam_config::HeightSeriesTable> for HeightCalibrationSeries {
    type Error = CalibrationError;

    fn try_from(t: &beam_config::HeightSeriesTable) -> Result<Self, Self::Error> {
        let mut slices = Vec::with_capacity(t.slices.len());
        for (index, s) in t.slices.iter().enumerate() {
            let grid = Grid::from_rows(s.clone()).ok_or_else(|| CalibrationError::InvalidValue {
                key: format!("slices[{index}]"),
                value: "ragged rows".into(),
            })?;
            slices.push(grid);
        }
        Self::new(t.heights.clone(), slices)
    }
}

// ── Workareas ────────────────────────────────────────────────────────────────

pub fn workarea_geometry(w: &beam_config::Workarea) -> WorkareaGeometry {
    WorkareaGeometry {
        width: w.width,
        height: w.height,
        auto_focus_offset: w.auto_focus_offset,
        camera_center: w.camera_center,
        supports_curve_engraving: w.supports_curve_engraving,
        supports_open_bottom: w.supports_open_bottom,
    }
}

/// Workarea lookup backed by the `[[workarea]]` table.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredWorkareas {
    by_model: BTreeMap<String, WorkareaGeometry>,
}

impl From<&[beam_config::Workarea]> for ConfiguredWorkareas {
    fn from(entries: &[beam_config::Workarea]) -> Self {
        Self {
            by_model: entries
                .iter()
                .map(|w| (w.model.clone(), workarea_geometry(w)))
                .collect(),
        }
    }
}

impl WorkareaProvider for ConfiguredWorkareas {
    fn workarea(&self, model: &str) -> Option<WorkareaGeometry> {
        self.by_model.get(model).cloned()
    }
}

// ── Preferences ──────────────────────────────────────────────────────────────

/// Preference lookup backed by the `[preferences]` section.
#[derive(Debug, Clone, Default)]
pub struct ConfiguredPreferences {
    borderless: bool,
}

impl From<&beam_config::Preferences> for ConfiguredPreferences {
    fn from(p: &beam_config::Preferences) -> Self {
        Self {
            borderless: p.borderless,
        }
    }
}

impl PreferenceStore for ConfiguredPreferences {
    fn get_bool(&self, name: &str) -> Option<bool> {
        match name {
            "borderless" => Some(self.borderless),
            _ => None,
        }
    }

    fn get_f64(&self, _name: &str) -> Option<f64> {
        None
    }
}
