//! Command handlers. Machine access goes through the simulator backend.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use beam_config::Config;
use beam_core::camera_offset::camera_offset_key;
use beam_core::conversions::{ConfiguredPreferences, ConfiguredWorkareas, height_compensation};
use beam_core::{
    BBox, CalibrationError, CameraOffset, CurveCfg, CurveEngravingData, CurveEngravingStore,
    GridIndex, HeightCalibrationSeries, MeasurementError, Measurer, MeasurerGuard, MoveCommand,
    ProbeMeasurer, RawSession, RawSessionCfg, RawSessionProbe, fetch_camera_offset,
    move_to_point, parse_camera_offset, prepare_preview, release_preview,
};
use beam_hardware::{HwError, SimulatedDevice};
use beam_traits::{ProgressSink, ProgressUpdate, WorkareaGeometry, WorkareaProvider};
use eyre::{Result, WrapErr, eyre};
use serde_json::json;

use crate::cli::Commands;

/// Fault injection for tests: `PREFIX=kind;...` with kind one of
/// `timeout|unknown|mode|operation`.
const SIM_FAIL_ENV: &str = "BEAM_TEST_SIM_FAIL";
/// Settings preloaded into the simulator: `key=value;...`.
const SIM_SETTINGS_ENV: &str = "BEAM_TEST_SIM_SETTINGS";

pub fn dispatch(cmd: &Commands, cfg: &Config, json: bool, shutdown: &Arc<AtomicBool>) -> Result<()> {
    match cmd {
        Commands::CameraOffset { setting } => camera_offset(cfg, setting.as_deref(), json),
        Commands::Interpolate {
            series,
            height,
            compensate,
        } => interpolate(cfg, series, *height, *compensate, json),
        Commands::MoveToPoint { x, y } => move_head(cfg, *x, *y, json),
        Commands::Measure {
            x,
            y,
            width,
            height,
            remeasure,
        } => measure(
            cfg,
            BBox::new(*x, *y, *width, *height),
            remeasure,
            json,
            shutdown,
        ),
        Commands::SelfCheck => self_check(cfg, json),
    }
}

// ── Simulator backend ────────────────────────────────────────────────────────

/// Gently tilted board, a few millimetres thick.
fn sim_surface(x: f64, y: f64) -> Option<f64> {
    Some(0.01f64.mul_add(x, 0.005f64.mul_add(y, 3.0)))
}

fn parse_fault(kind: &str, prefix: &str) -> Result<HwError> {
    Ok(match kind {
        "timeout" => HwError::Timeout,
        "unknown" => HwError::UnknownCommand(prefix.to_string()),
        "mode" => HwError::ModeError(prefix.to_string()),
        "operation" => HwError::OperationError(prefix.to_string()),
        other => eyre::bail!("{SIM_FAIL_ENV}: unknown fault kind '{other}'"),
    })
}

fn env_pairs(var: &str) -> Result<Vec<(String, String)>> {
    let Ok(raw) = std::env::var(var) else {
        return Ok(Vec::new());
    };
    raw.split(';')
        .filter(|s| !s.trim().is_empty())
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| eyre!("{var}: expected KEY=VALUE, got '{pair}'"))
        })
        .collect()
}

fn sim_device() -> Result<SimulatedDevice> {
    let dev = SimulatedDevice::with_surface(sim_surface);
    for (prefix, kind) in env_pairs(SIM_FAIL_ENV)? {
        dev.fail_next(&prefix, parse_fault(&kind, &prefix)?);
    }
    for (key, value) in env_pairs(SIM_SETTINGS_ENV)? {
        dev.set_setting(&key, &value);
    }
    Ok(dev)
}

fn sim_session(cfg: &Config) -> Result<RawSession<SimulatedDevice>> {
    Ok(RawSession::new(
        sim_device()?,
        cfg.device.id.clone(),
        RawSessionCfg::from(cfg),
    ))
}

fn active_workarea(cfg: &Config) -> Result<WorkareaGeometry> {
    ConfiguredWorkareas::from(cfg.workareas.as_slice())
        .workarea(&cfg.device.model)
        .ok_or_else(|| eyre!("no workarea configured for model '{}'", cfg.device.model))
}

// ── Progress ─────────────────────────────────────────────────────────────────

/// Progress notifier for a terminal: milestones go to the log, alerts to stderr.
struct ConsoleProgress {
    json: bool,
    alerts: Vec<String>,
}

impl ConsoleProgress {
    fn new(json: bool) -> Self {
        Self {
            json,
            alerts: Vec::new(),
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn open(&mut self, id: &str, message: &str) {
        tracing::info!(id, message, "progress started");
    }

    fn update(&mut self, id: &str, update: ProgressUpdate) {
        if let Some(p) = update.percentage {
            tracing::info!(id, percent = p, "progress");
        }
        if let Some(m) = update.message {
            tracing::debug!(id, message = %m, "progress");
        }
    }

    fn close(&mut self, id: &str) {
        tracing::debug!(id, "progress closed");
    }

    fn pop_up_error(&mut self, message: &str) {
        tracing::error!(message, "alert");
        if !self.json {
            eprintln!("{message}");
        }
        self.alerts.push(message.to_string());
    }
}

// ── camera-offset ────────────────────────────────────────────────────────────

fn camera_offset(cfg: &Config, setting: Option<&str>, json: bool) -> Result<()> {
    let prefs = ConfiguredPreferences::from(&cfg.preferences);
    let open_bottom = active_workarea(cfg).is_ok_and(|w| w.supports_open_bottom);
    let key = camera_offset_key(&prefs, open_bottom);

    let offset: CameraOffset = match setting {
        Some(s) => parse_camera_offset(s)?,
        None => {
            let mut session = sim_session(cfg)?;
            fetch_camera_offset(&mut session, key)?
        }
    };

    if json {
        println!(
            "{}",
            json!({
                "key": key,
                "x": offset.x,
                "y": offset.y,
                "angle": offset.angle,
                "scale_ratio_x": offset.scale_ratio_x,
                "scale_ratio_y": offset.scale_ratio_y,
                "ideal": offset.is_ideal(),
                "setting": offset.to_setting_string(),
            })
        );
    } else {
        println!("key: {key}");
        println!("x: {:.3} mm", offset.x);
        println!("y: {:.3} mm", offset.y);
        println!("angle: {:.4} rad", offset.angle);
        println!(
            "scale: {:.4} x {:.4}",
            offset.scale_ratio_x, offset.scale_ratio_y
        );
        if offset.is_ideal() {
            println!("camera not calibrated, using ideal offset");
        }
        println!("setting: {}", offset.to_setting_string());
    }
    Ok(())
}

// ── interpolate ──────────────────────────────────────────────────────────────

fn interpolate(
    cfg: &Config,
    path: &std::path::Path,
    height: f64,
    compensate: bool,
    json: bool,
) -> Result<()> {
    let table = beam_config::load_height_series_csv(path)?;
    let series = HeightCalibrationSeries::try_from(&table)?;
    let compensation = if compensate {
        let workarea = active_workarea(cfg)?;
        Some(height_compensation(&cfg.leveling, &workarea).ok_or_else(|| {
            eyre!("height compensation needs [leveling] center_px")
        })?)
    } else {
        None
    };

    let grid = series.interpolate(height, compensation.as_ref());
    tracing::info!(
        height,
        compensate,
        rows = grid.rows(),
        cols = grid.cols(),
        "interpolated"
    );

    if json {
        let rows: Vec<&[[f64; 2]]> = (0..grid.rows()).map(|r| grid.row(r)).collect();
        println!("{}", json!({ "height": height, "grid": rows }));
    } else {
        println!("height: {height} mm ({}x{})", grid.rows(), grid.cols());
        for (idx, [dx, dy]) in grid.indexed() {
            println!("{} {} {dx:.4} {dy:.4}", idx.row, idx.col);
        }
    }
    Ok(())
}

// ── move-to-point ────────────────────────────────────────────────────────────

fn move_head(cfg: &Config, x: f64, y: f64, json: bool) -> Result<()> {
    let mut session = sim_session(cfg)?;
    move_to_point(&mut session, || Ok(MoveCommand::xy(x, y)))?;

    let position = session.transport().state().position;
    if json {
        println!(
            "{}",
            json!({ "x": position[0], "y": position[1], "state": format!("{:?}", session.state()) })
        );
    } else {
        println!("moved to ({:.3}, {:.3})", position[0], position[1]);
    }
    Ok(())
}

// ── measure ──────────────────────────────────────────────────────────────────

fn measure(
    cfg: &Config,
    bbox: BBox,
    remeasure: &[GridIndex],
    json: bool,
    shutdown: &Arc<AtomicBool>,
) -> Result<()> {
    let workarea = active_workarea(cfg)?;
    if !workarea.supports_curve_engraving {
        eyre::bail!("model '{}' does not support curve engraving", cfg.device.model);
    }
    let af = workarea.auto_focus_offset.unwrap_or_default();
    let probe = RawSessionProbe::new(sim_session(cfg)?, [af[0], af[1]]);
    let mut measurer = ProbeMeasurer::new(probe, Duration::from_millis(cfg.curve.probe_timeout_ms));

    let mut store = CurveEngravingStore::new(CurveCfg::from(&cfg.curve));
    let events = store.subscribe();
    let mut progress = ConsoleProgress::new(json);

    if !store.set_area(bbox, &mut measurer, &workarea, &mut progress)? {
        return Err(CalibrationError::OutOfEnvelope {
            width: bbox.width,
            height: bbox.height,
        }
        .into());
    }

    if !remeasure.is_empty() {
        if let Some(data) = store.data()
            && let Some(bad) = remeasure.iter().find(|i| !data.points().contains(**i))
        {
            return Err(MeasurementError::InvalidIndex(*bad).into());
        }
        let cancel = || shutdown.load(Ordering::SeqCst);
        let mut guard = MeasurerGuard::new(&mut measurer);
        match guard.setup(&mut |text: &str| tracing::info!(text, "measurer")) {
            Ok(true) => {}
            Ok(false) => return Err(MeasurementError::SetupFailed.into()),
            Err(e) => {
                tracing::error!(error = %e, "measurer setup failed before remeasure");
                return Err(MeasurementError::SetupFailed.into());
            }
        }
        if store
            .remeasure_points(remeasure, &mut *guard, &cancel, &mut progress)
            .is_none()
        {
            if cancel() {
                return Err(MeasurementError::Cancelled.into());
            }
            return Err(MeasurementError::Failed("remeasure did not complete".into()).into());
        }
    }

    let data = store
        .data()
        .ok_or_else(|| eyre::Report::new(MeasurementError::NoArea))?;
    let events: Vec<String> = events.drain().iter().map(|e| format!("{e:?}")).collect();
    print_area(data, remeasure.len(), &events, json);
    Ok(())
}

fn print_area(data: &CurveEngravingData, remeasured: usize, events: &[String], json: bool) {
    let points = data.points();
    let (rows, cols) = points.shape();
    if json {
        let z: Vec<Vec<Option<f64>>> = (0..rows)
            .map(|r| points.row(r).iter().map(|p| p.z).collect())
            .collect();
        let errors: Vec<[usize; 2]> = data.errors().iter().map(|i| [i.row, i.col]).collect();
        println!(
            "{}",
            json!({
                "bbox": {
                    "x": data.bbox.x,
                    "y": data.bbox.y,
                    "width": data.bbox.width,
                    "height": data.bbox.height,
                },
                "rows": rows,
                "cols": cols,
                "highest": data.highest(),
                "lowest": data.lowest(),
                "object_height": data.object_height(),
                "errors": errors,
                "z": z,
                "remeasured": remeasured,
                "events": events,
            })
        );
        return;
    }

    let b = &data.bbox;
    println!(
        "area: x={:.1} y={:.1} width={:.1} height={:.1}",
        b.x, b.y, b.width, b.height
    );
    println!("points: {rows}x{cols}, failed: {}", data.errors().len());
    println!(
        "highest: {:.3} mm, lowest: {:.3} mm, object height: {:.3} mm",
        data.highest(),
        data.lowest(),
        data.object_height()
    );
    for r in 0..rows {
        let line: Vec<String> = points
            .row(r)
            .iter()
            .map(|p| p.z.map_or_else(|| "   --  ".to_string(), |z| format!("{z:7.3}")))
            .collect();
        println!("{}", line.join(" "));
    }
    if remeasured > 0 {
        println!("remeasured {remeasured} point(s)");
    }
}

// ── self-check ───────────────────────────────────────────────────────────────

fn self_check(cfg: &Config, json: bool) -> Result<()> {
    let workarea = active_workarea(cfg);
    if let Err(e) = &workarea {
        tracing::warn!(error = %e, "self-check: curve engraving unavailable");
    }

    let mut session = sim_session(cfg)?;
    prepare_preview(&mut session)?;
    let report = release_preview(&mut session);
    if let Some(e) = report.first_failure() {
        return Err(e.clone()).wrap_err("release machine after self-check");
    }

    if json {
        println!(
            "{}",
            json!({
                "ok": true,
                "device": cfg.device.id,
                "model": cfg.device.model,
                "curve_engraving": workarea.is_ok_and(|w| w.supports_curve_engraving),
            })
        );
    } else {
        println!("OK");
    }
    Ok(())
}
