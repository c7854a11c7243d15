//! CLI argument definitions and shared statics.

use beam_core::GridIndex;
use clap::{ArgAction, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::OnceLock;

pub static FILE_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();
/// Whether the user asked for JSON output (controls structured error output).
pub static JSON_MODE: OnceLock<bool> = OnceLock::new();

pub fn json_mode() -> bool {
    JSON_MODE.get().copied().unwrap_or(false)
}

#[derive(Parser, Debug)]
#[command(name = "beam", version, about = "Laser raw-control and curve calibration CLI")]
pub struct Cli {
    /// Path to config TOML (typed)
    #[arg(long, value_name = "FILE", default_value = "etc/beam.toml")]
    pub config: PathBuf,

    /// Print results and errors as JSON, and log as JSON lines
    #[arg(long, action = ArgAction::SetTrue)]
    pub json: bool,

    /// Console log level (error|warn|info|debug|trace); RUST_LOG wins when set
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Parse a camera offset setting, or read it from the machine
    CameraOffset {
        /// Setting text, e.g. "X:1.5 Y:-2.0 R:0.01 S:1.6"; read from the machine when omitted
        setting: Option<String>,
    },
    /// Interpolate the height calibration series at one object height
    Interpolate {
        /// Calibration CSV (strict header: height,row,col,dx,dy)
        #[arg(long, value_name = "FILE")]
        series: PathBuf,
        /// Object height in mm
        #[arg(long, allow_negative_numbers = true)]
        height: f64,
        /// Apply bed leveling offsets from [leveling]
        #[arg(long, action = ArgAction::SetTrue)]
        compensate: bool,
    },
    /// Move the head to a bed position and release the machine
    MoveToPoint {
        #[arg(long, allow_negative_numbers = true)]
        x: f64,
        #[arg(long, allow_negative_numbers = true)]
        y: f64,
    },
    /// Measure a curve engraving area, optionally remeasuring some points
    Measure {
        #[arg(long, allow_negative_numbers = true)]
        x: f64,
        #[arg(long, allow_negative_numbers = true)]
        y: f64,
        #[arg(long)]
        width: f64,
        #[arg(long)]
        height: f64,
        /// Grid cell to remeasure after the area is set, as ROW,COL (repeatable)
        #[arg(long, value_name = "ROW,COL", value_parser = parse_grid_index)]
        remeasure: Vec<GridIndex>,
    },
    /// Quick health check (config and machine backend)
    SelfCheck,
}

fn parse_grid_index(s: &str) -> Result<GridIndex, String> {
    let (r, c) = s
        .split_once(',')
        .ok_or_else(|| format!("expected ROW,COL, got '{s}'"))?;
    let row = r
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid row '{r}': {e}"))?;
    let col = c
        .trim()
        .parse::<usize>()
        .map_err(|e| format!("invalid column '{c}': {e}"))?;
    Ok(GridIndex::new(row, col))
}
