//! Runtime configuration for the session controller and curve store.
//!
//! These are separate from the TOML-deserialized config in `beam_config`;
//! see `conversions` for the bridge.

use std::time::Duration;

/// Firmware command dialect. v1 uses `B` codes, v2 uses `M136`/`M137` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FcodeVersion {
    V1,
    #[default]
    V2,
}

/// Raw session behaviour.
#[derive(Debug, Clone)]
pub struct RawSessionCfg {
    pub fcode: FcodeVersion,
    /// Whether workflows should wrap motion in line-check mode.
    pub line_check: bool,
    /// Per-command response timeout (ms).
    pub command_ms: u64,
    /// Response timeout while homing (ms).
    pub home_ms: u64,
    /// Delay after `task raw` before the firmware accepts raw commands (ms).
    pub settle_ms: u64,
    /// Resends allowed after `ER:RESET`/`error:` or a line-check rejection.
    pub max_retries: u32,
    /// Pause before a resend (ms).
    pub retry_backoff_ms: u64,
    /// Feed rate used when a move does not specify one (mm/min).
    pub feed_rate: u32,
}

impl Default for RawSessionCfg {
    fn default() -> Self {
        Self {
            fcode: FcodeVersion::V2,
            line_check: true,
            command_ms: 30_000,
            home_ms: 10_000,
            settle_ms: 3_000,
            max_retries: 5,
            retry_backoff_ms: 200,
            feed_rate: 6_000,
        }
    }
}

impl RawSessionCfg {
    #[inline]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_ms)
    }

    #[inline]
    pub fn home_timeout(&self) -> Duration {
        Duration::from_millis(self.home_ms)
    }
}

/// Curve engraving measurement settings.
#[derive(Debug, Clone)]
pub struct CurveCfg {
    /// Grid spacing along x and y (mm).
    pub gap: [f64; 2],
    /// Added to the highest measured point to get the object height (mm).
    pub object_height_margin: f64,
    /// Per-point probe timeout (ms).
    pub probe_ms: u64,
}

impl Default for CurveCfg {
    fn default() -> Self {
        Self {
            gap: [20.0, 20.0],
            object_height_margin: 10.0,
            probe_ms: 30_000,
        }
    }
}
