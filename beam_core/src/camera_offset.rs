//! Camera-to-bed offset parsing.
//!
//! The device stores the offset as a whitespace separated list of `KEY:value`
//! tokens, e.g. `Y:-2.0 X:1.5 R:0.01 S:1.6 SX:1.62 SY:1.58`.

use std::collections::BTreeMap;

use beam_traits::{Clock, PreferenceStore, Transport};
use eyre::WrapErr;

use crate::error::{CalibrationError, Result};
use crate::hw_error::map_boxed;
use crate::session::RawSession;

pub const SETTING_KEY: &str = "camera_offset";
pub const SETTING_KEY_BORDERLESS: &str = "camera_offset_borderless";

/// Geometric offset between the camera image and the bed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraOffset {
    /// mm
    pub x: f64,
    /// mm
    pub y: f64,
    /// radians, as stored by the device
    pub angle: f64,
    pub scale_ratio_x: f64,
    pub scale_ratio_y: f64,
}

/// Offset used when the device has never been calibrated.
pub const IDEAL_CAMERA_OFFSET: CameraOffset = CameraOffset {
    x: 20.0,
    y: 30.0,
    angle: 0.0,
    scale_ratio_x: (585.0 / 720.0) * 2.0,
    scale_ratio_y: (585.0 / 720.0) * 2.0,
};

/// Split a setting string into `KEY -> value`. Malformed tokens are skipped;
/// a value separated from its colon by whitespace (`X: 1.5`) is accepted.
pub fn tokenize(s: &str) -> BTreeMap<String, f64> {
    let mut out = BTreeMap::new();
    let mut pending: Option<&str> = None;
    for tok in s.split_whitespace() {
        if let Some(key) = pending.take() {
            if let Ok(v) = tok.parse::<f64>() {
                out.insert(key.to_string(), v);
                continue;
            }
        }
        let Some((key, value)) = tok.split_once(':') else {
            continue;
        };
        if key.is_empty() {
            continue;
        }
        if value.is_empty() {
            pending = Some(key);
            continue;
        }
        if let Ok(v) = value.parse::<f64>() {
            out.insert(key.to_string(), v);
        } else {
            tracing::debug!(token = tok, "skipping malformed camera offset token");
        }
    }
    out
}

enum Source {
    Key(&'static str),
    /// First key present wins.
    FirstOf(&'static str, &'static str),
}

/// Sources for x, y, angle, scale_ratio_x and scale_ratio_y, in that order.
const RULES: [Source; 5] = [
    Source::Key("X"),
    Source::Key("Y"),
    Source::Key("R"),
    Source::FirstOf("SX", "S"),
    Source::FirstOf("SY", "S"),
];

impl CameraOffset {
    /// Project tokens onto the offset fields.
    pub fn from_tokens(tokens: &BTreeMap<String, f64>) -> std::result::Result<Self, CalibrationError> {
        let mut vals = [0.0f64; 5];
        for (slot, source) in vals.iter_mut().zip(RULES.iter()) {
            *slot = match source {
                Source::Key(k) => *tokens.get(*k).ok_or(CalibrationError::MissingKey(*k))?,
                Source::FirstOf(a, b) => *tokens
                    .get(*a)
                    .or_else(|| tokens.get(*b))
                    .ok_or(CalibrationError::MissingKey(*b))?,
            };
        }
        let [x, y, angle, scale_ratio_x, scale_ratio_y] = vals;
        Ok(Self {
            x,
            y,
            angle,
            scale_ratio_x,
            scale_ratio_y,
        })
    }

    /// Serialize in the device's setting format.
    pub fn to_setting_string(&self) -> String {
        let s = (self.scale_ratio_x + self.scale_ratio_y) / 2.0;
        format!(
            "Y:{:.1} X:{:.1} R:{} S:{} SX:{} SY:{}",
            self.y, self.x, self.angle, s, self.scale_ratio_x, self.scale_ratio_y
        )
    }

    pub fn is_ideal(&self) -> bool {
        *self == IDEAL_CAMERA_OFFSET
    }
}

/// Parse a stored offset. An offset at exactly (0, 0) means the device was
/// never calibrated and is replaced by `IDEAL_CAMERA_OFFSET`.
pub fn parse_camera_offset(s: &str) -> std::result::Result<CameraOffset, CalibrationError> {
    let parsed = CameraOffset::from_tokens(&tokenize(s))?;
    if parsed.x == 0.0 && parsed.y == 0.0 {
        tracing::debug!("camera offset unset, using ideal offset");
        return Ok(IDEAL_CAMERA_OFFSET);
    }
    Ok(parsed)
}

/// Setting key holding the offset for the current bottom configuration.
pub fn camera_offset_key(prefs: &dyn PreferenceStore, supports_open_bottom: bool) -> &'static str {
    let borderless = prefs.get_bool("borderless").unwrap_or(false);
    if borderless && supports_open_bottom {
        SETTING_KEY_BORDERLESS
    } else {
        SETTING_KEY
    }
}

/// Read and parse the offset from the device.
///
/// Settings can only be read outside raw mode, so any line-check or raw
/// sub-task left over is ended first.
pub fn fetch_camera_offset<T: Transport, C: Clock>(
    session: &mut RawSession<T, C>,
    key: &str,
) -> Result<CameraOffset> {
    session
        .end_line_check()
        .map_err(eyre::Report::new)
        .wrap_err("end line-check before reading camera offset")?;
    session
        .exit_raw()
        .map_err(eyre::Report::new)
        .wrap_err("leave raw mode before reading camera offset")?;

    let timeout = session.cfg().command_timeout();
    let raw = session
        .transport_mut()
        .get_setting(key, timeout)
        .map_err(|e| eyre::Report::new(map_boxed(e)))
        .wrap_err_with(|| format!("read setting {key}"))?;
    tracing::debug!(key, value = %raw, "camera offset setting");

    let offset = parse_camera_offset(&raw).map_err(eyre::Report::new)?;
    tracing::info!(?offset, "camera offset");
    Ok(offset)
}
