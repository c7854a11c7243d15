//! Raw-mode session controller.
//!
//! A `RawSession` owns the transport for one device connection and moves it
//! between normal mode, raw mode and the line-check sub-mode. Owning the
//! transport is what guarantees a single active session per connection.

use std::fmt::Write as _;
use std::time::Duration;

use beam_traits::{Clock, ControlMode, MonotonicClock, Transport};
pub use beam_traits::line_checksum;

use crate::config::{FcodeVersion, RawSessionCfg};
use crate::error::{DeviceError, DeviceErrorKind};
use crate::hw_error::map_boxed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Normal,
    EnteringRaw,
    Raw,
    RawLineCheck,
    Faulted,
}

impl SessionState {
    #[inline]
    pub fn is_raw(self) -> bool {
        matches!(self, Self::Raw | Self::RawLineCheck)
    }
}

/// Linear move. Axes left as `None` are not sent and stay where they are.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MoveCommand {
    pub x: Option<f64>,
    pub y: Option<f64>,
    pub z: Option<f64>,
    pub a: Option<f64>,
    pub feed_rate: Option<u32>,
}

impl MoveCommand {
    pub fn xy(x: f64, y: f64) -> Self {
        Self {
            x: Some(x),
            y: Some(y),
            ..Self::default()
        }
    }
}

/// Probe position report (`M136P254`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbePosition {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub a: f64,
    /// Whether the last auto-focus found a surface.
    pub did_af: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Actuator {
    WaterPump,
    AirPump,
    Fan,
}

fn actuator_code(fcode: FcodeVersion, actuator: Actuator, on: bool) -> &'static str {
    use Actuator::{AirPump, Fan, WaterPump};
    match (fcode, actuator, on) {
        (FcodeVersion::V1, WaterPump, true) => "B1",
        (FcodeVersion::V1, WaterPump, false) => "B2",
        (FcodeVersion::V1, AirPump, true) => "B3",
        (FcodeVersion::V1, AirPump, false) => "B4",
        (FcodeVersion::V1, Fan, true) => "B5",
        (FcodeVersion::V1, Fan, false) => "B6",
        (FcodeVersion::V2, WaterPump, true) => "M136P1",
        (FcodeVersion::V2, WaterPump, false) => "M136P2",
        (FcodeVersion::V2, AirPump, true) => "M136P3",
        (FcodeVersion::V2, AirPump, false) => "M136P4",
        (FcodeVersion::V2, Fan, true) => "M136P5",
        (FcodeVersion::V2, Fan, false) => "M136P6",
    }
}

const CMD_ENTER_RAW: &str = "task raw";
const CMD_EXIT_RAW: &str = "task quit";
const CMD_HOME: &str = "raw home";
const CMD_START_LINE_CHECK: &str = "$@";
const CMD_END_LINE_CHECK: &str = "M172";
const CMD_PROBE_POSITION: &str = "M136P254";

/// Frame `cmd` as line `line`: `N{line}{cmd}*{crc}`.
pub fn frame_line(line: u32, cmd: &str) -> String {
    let payload = format!("N{line}{cmd}");
    let crc = line_checksum(&payload);
    format!("{payload}*{crc}")
}

fn round3(v: f64) -> f64 {
    let r = (v * 1000.0).round() / 1000.0;
    if r == 0.0 { 0.0 } else { r }
}

/// Render a move as `G1F{f}X{x}Y{y}Z{z}A{a}`, omitting absent axes.
pub fn move_gcode(cmd: &MoveCommand, default_feed: u32) -> String {
    let mut out = format!("G1F{}", cmd.feed_rate.unwrap_or(default_feed));
    for (axis, value) in [('X', cmd.x), ('Y', cmd.y), ('Z', cmd.z), ('A', cmd.a)] {
        if let Some(v) = value {
            let _ = write!(out, "{axis}{}", round3(v));
        }
    }
    out
}

/// Parse `[PRB:x,y,z,a:af]` out of a probe report.
pub fn parse_probe_position(resp: &str) -> Result<ProbePosition, DeviceError> {
    let bad = || DeviceError::other(format!("malformed probe report: {resp:?}"));
    let start = resp.find("[PRB:").ok_or_else(bad)? + "[PRB:".len();
    let end = start + resp[start..].find(']').ok_or_else(bad)?;
    let (coords, flag) = resp[start..end].rsplit_once(':').ok_or_else(bad)?;

    let mut vals = [0.0f64; 4];
    let mut parts = coords.split(',');
    for slot in &mut vals {
        *slot = parts
            .next()
            .and_then(|p| p.trim().parse::<f64>().ok())
            .ok_or_else(bad)?;
    }
    if parts.next().is_some() {
        return Err(bad());
    }
    let did_af = match flag.trim() {
        "1" => true,
        "0" => false,
        _ => return Err(bad()),
    };
    let [x, y, z, a] = vals;
    Ok(ProbePosition { x, y, z, a, did_af })
}

fn is_reset(resp: &str) -> bool {
    resp.contains("ER:RESET") || resp.contains("DEBUG: RESET") || resp.contains("error:")
}

pub struct RawSession<T: Transport, C: Clock = MonotonicClock> {
    transport: T,
    clock: C,
    cfg: RawSessionCfg,
    device_id: String,
    state: SessionState,
    line: u32,
}

impl<T: Transport> RawSession<T, MonotonicClock> {
    pub fn new(transport: T, device_id: impl Into<String>, cfg: RawSessionCfg) -> Self {
        Self::with_clock(transport, device_id, cfg, MonotonicClock::new())
    }
}

impl<T: Transport, C: Clock> RawSession<T, C> {
    pub fn with_clock(
        transport: T,
        device_id: impl Into<String>,
        cfg: RawSessionCfg,
        clock: C,
    ) -> Self {
        Self {
            transport,
            clock,
            cfg,
            device_id: device_id.into(),
            state: SessionState::Normal,
            line: 0,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[inline]
    pub fn cfg(&self) -> &RawSessionCfg {
        &self.cfg
    }

    /// Next line number that will be framed in line-check mode.
    #[inline]
    pub fn line_number(&self) -> u32 {
        self.line
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    fn send(&mut self, cmd: &str, timeout: Duration) -> Result<String, DeviceError> {
        tracing::debug!(cmd = %cmd, "raw >>");
        let resp = self.transport.send_raw(cmd, timeout).map_err(map_boxed)?;
        tracing::trace!(resp = %resp, "raw <<");
        Ok(resp)
    }

    fn require_raw(&self, op: &str) -> Result<(), DeviceError> {
        if self.state.is_raw() {
            Ok(())
        } else {
            Err(DeviceError::mode(format!(
                "{op} requires raw mode (state {:?})",
                self.state
            )))
        }
    }

    /// Send `cmd` until a response line satisfies `accept`, resending after
    /// a reset report at most `max_retries` times.
    fn send_until(
        &mut self,
        cmd: &str,
        timeout: Duration,
        accept: impl Fn(&str) -> bool,
    ) -> Result<String, DeviceError> {
        let mut retries = 0;
        loop {
            let resp = self.send(cmd, timeout)?;
            if resp.lines().map(str::trim).any(&accept) {
                return Ok(resp);
            }
            if !is_reset(&resp) {
                return Err(DeviceError::other(format!(
                    "unexpected response to {cmd}: {resp:?}"
                )));
            }
            if retries >= self.cfg.max_retries {
                return Err(DeviceError::other(format!(
                    "{cmd} failed after {retries} retries: {resp:?}"
                )));
            }
            retries += 1;
            tracing::warn!(cmd = %cmd, retries, "device reset during command, resending");
            self.clock
                .sleep(Duration::from_millis(self.cfg.retry_backoff_ms));
        }
    }

    /// Send a raw-mode command, framed when line-check is active.
    fn command(&mut self, cmd: &str) -> Result<String, DeviceError> {
        self.command_within(cmd, self.cfg.command_timeout())
    }

    fn command_within(&mut self, cmd: &str, timeout: Duration) -> Result<String, DeviceError> {
        self.require_raw(cmd)?;
        if self.state == SessionState::RawLineCheck {
            return self.line_checked(cmd, timeout);
        }
        let resp = self.send(cmd, timeout)?;
        if is_reset(&resp) {
            return Err(DeviceError::other(format!("{cmd} rejected: {resp:?}")));
        }
        Ok(resp)
    }

    fn line_checked(&mut self, cmd: &str, timeout: Duration) -> Result<String, DeviceError> {
        let mut resends = 0;
        loop {
            let framed = frame_line(self.line, cmd);
            let resp = self.send(&framed, timeout)?;
            if resp.contains("ER:RESET") || resp.contains("error:") {
                return Err(DeviceError::other(format!("{cmd} rejected: {resp:?}")));
            }

            let lines: Vec<&str> = resp
                .lines()
                .map(str::trim)
                .filter(|l| !l.starts_with("DEBUG:"))
                .collect();
            let done_ln = format!("LN{} 0", self.line);
            let done_l = format!("L{} 0", self.line);
            if lines
                .iter()
                .any(|l| l.starts_with(&done_ln) || l.starts_with(&done_l))
            {
                self.line += 1;
                return Ok(resp);
            }

            let resync = lines.iter().find_map(|l| {
                l.strip_prefix("ERL")?
                    .split_whitespace()
                    .next()?
                    .parse::<u32>()
                    .ok()
            });
            if let Some(n) = resync {
                tracing::debug!(from = self.line, to = n, "line-check resync");
                self.line = n;
            } else if !lines.iter().any(|l| l.starts_with("ER")) {
                return Err(DeviceError::other(format!(
                    "no line-check acknowledgement for {cmd}: {resp:?}"
                )));
            }

            if resends >= self.cfg.max_retries {
                return Err(DeviceError::other(format!(
                    "{cmd} not acknowledged after {resends} resends"
                )));
            }
            resends += 1;
        }
    }

    /// Switch the connection into raw mode.
    ///
    /// A no-op when the transport already reports raw mode.
    pub fn enter_raw(&mut self) -> Result<(), DeviceError> {
        if self.transport.control_mode() == ControlMode::Raw {
            if self.state != SessionState::RawLineCheck {
                self.state = SessionState::Raw;
            }
            tracing::debug!("already in raw mode");
            return Ok(());
        }

        self.state = SessionState::EnteringRaw;
        if let Err(e) = self.send(CMD_ENTER_RAW, self.cfg.command_timeout()) {
            self.state = SessionState::Faulted;
            tracing::error!(error = %e, "enter raw failed");
            return Err(e);
        }
        self.clock.sleep(Duration::from_millis(self.cfg.settle_ms));
        self.state = SessionState::Raw;
        tracing::info!(device = %self.device_id, "entered raw mode");
        Ok(())
    }

    pub fn home(&mut self) -> Result<(), DeviceError> {
        self.require_raw(CMD_HOME)?;
        let timeout = self.cfg.home_timeout();
        self.send_until(CMD_HOME, timeout, |l| l.contains("ok"))?;
        tracing::info!("homed");
        Ok(())
    }

    pub fn start_line_check(&mut self) -> Result<(), DeviceError> {
        match self.state {
            SessionState::RawLineCheck => return Ok(()),
            SessionState::Raw => {}
            other => {
                return Err(DeviceError::mode(format!(
                    "line-check requires raw mode (state {other:?})"
                )));
            }
        }
        let timeout = self.cfg.command_timeout();
        self.send_until(CMD_START_LINE_CHECK, timeout, |l| {
            l == "CTRL LINECHECK_ENABLED" || l == "ok"
        })?;
        self.line = 1;
        self.state = SessionState::RawLineCheck;
        tracing::debug!("line-check enabled");
        Ok(())
    }

    /// Leave line-check mode.
    ///
    /// Succeeds without sending anything when line-check is not active, and
    /// tolerates firmware that does not know `M172` or is no longer in raw mode.
    pub fn end_line_check(&mut self) -> Result<(), DeviceError> {
        if self.state != SessionState::RawLineCheck {
            tracing::debug!(state = ?self.state, "line-check not active");
            return Ok(());
        }
        let timeout = self.cfg.command_timeout();
        let res = self.send_until(CMD_END_LINE_CHECK, timeout, |l| {
            l == "CTRL LINECHECK_DISABLED" || l == "ok"
        });
        match res {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind,
                    DeviceErrorKind::UnknownCommand | DeviceErrorKind::ControlSocketModeError
                ) =>
            {
                tracing::debug!(error = %e, "ignoring end line-check failure");
            }
            Err(e) => return Err(e),
        }
        self.state = SessionState::Raw;
        Ok(())
    }

    pub fn move_to(&mut self, cmd: &MoveCommand) -> Result<(), DeviceError> {
        let gcode = move_gcode(cmd, self.cfg.feed_rate);
        self.command(&gcode)?;
        Ok(())
    }

    fn set_actuator(&mut self, actuator: Actuator, on: bool) -> Result<(), DeviceError> {
        let code = actuator_code(self.cfg.fcode, actuator, on);
        self.command(code)?;
        tracing::debug!(?actuator, on, "actuator set");
        Ok(())
    }

    pub fn set_fan(&mut self, on: bool) -> Result<(), DeviceError> {
        self.set_actuator(Actuator::Fan, on)
    }

    pub fn set_air_pump(&mut self, on: bool) -> Result<(), DeviceError> {
        self.set_actuator(Actuator::AirPump, on)
    }

    pub fn set_water_pump(&mut self, on: bool) -> Result<(), DeviceError> {
        self.set_actuator(Actuator::WaterPump, on)
    }

    /// Release the stepper motors so the head can be moved by hand.
    pub fn loose_motor(&mut self) -> Result<(), DeviceError> {
        let code = match self.cfg.fcode {
            FcodeVersion::V1 => "B34",
            FcodeVersion::V2 => "M137P34",
        };
        self.command(code)?;
        Ok(())
    }

    /// Run auto-focus at the current head position, waiting up to `timeout`
    /// for the probe to land.
    pub fn auto_focus(&mut self, timeout: Duration) -> Result<(), DeviceError> {
        let code = match self.cfg.fcode {
            FcodeVersion::V1 => "B206",
            FcodeVersion::V2 => "M137P179Q1",
        };
        self.command_within(code, timeout)?;
        Ok(())
    }

    pub fn probe_position(&mut self) -> Result<ProbePosition, DeviceError> {
        let resp = self.command(CMD_PROBE_POSITION)?;
        parse_probe_position(&resp)
    }

    fn quit_task(&mut self) -> Result<(), DeviceError> {
        match self.send(CMD_EXIT_RAW, self.cfg.command_timeout()) {
            Ok(_) => Ok(()),
            Err(e)
                if matches!(
                    e.kind,
                    DeviceErrorKind::UnknownCommand
                        | DeviceErrorKind::ControlSocketModeError
                        | DeviceErrorKind::OperationError
                ) =>
            {
                tracing::debug!(error = %e, "device already out of raw mode");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Leave raw mode. A timeout triggers one reconnect and one retry.
    /// Nothing is sent when neither the session nor the device is in raw mode.
    pub fn exit_raw(&mut self) -> Result<(), DeviceError> {
        if self.state == SessionState::Normal && self.transport.control_mode() != ControlMode::Raw {
            tracing::debug!("not in raw mode, nothing to leave");
            return Ok(());
        }
        match self.quit_task() {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                tracing::warn!(error = %e, "timeout leaving raw mode, reconnecting");
                let retried = self.reconnect().and_then(|()| self.quit_task());
                if let Err(e) = retried {
                    self.state = SessionState::Faulted;
                    return Err(e);
                }
            }
            Err(e) => {
                self.state = SessionState::Faulted;
                return Err(e);
            }
        }
        self.state = SessionState::Normal;
        tracing::info!(device = %self.device_id, "left raw mode");
        Ok(())
    }

    /// Reopen the connection, restoring raw and line-check state if the
    /// session was in raw mode before.
    pub fn reconnect(&mut self) -> Result<(), DeviceError> {
        let was_raw = self.state.is_raw();
        let line_check = self.state == SessionState::RawLineCheck;
        let line = self.line;

        tracing::info!(device = %self.device_id, "reconnecting");
        if let Err(e) = self.transport.connect(&self.device_id) {
            self.state = SessionState::Faulted;
            return Err(map_boxed(e));
        }
        self.state = SessionState::Normal;

        if was_raw {
            self.enter_raw()?;
            if line_check {
                self.state = SessionState::RawLineCheck;
                self.line = line;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn checksum_matches_firmware_rule() {
        // N1G1: 'N'=78, '1'=49, 'G'=71, '1'=49
        let mut crc = 0u32;
        for c in [78u32, 49, 71, 49] {
            crc ^= c;
            crc += c;
        }
        assert_eq!(line_checksum("N1G1"), crc % 65536);
        assert_eq!(line_checksum("N1 G1"), line_checksum("N1G1"));
    }

    #[test]
    fn frame_has_line_and_crc() {
        let f = frame_line(7, "B5");
        assert!(f.starts_with("N7B5*"));
        assert_eq!(f, format!("N7B5*{}", line_checksum("N7B5")));
    }

    #[rstest]
    #[case(MoveCommand::xy(10.0, 20.0), "G1F6000X10Y20")]
    #[case(MoveCommand { x: Some(1.23456), feed_rate: Some(1200), ..Default::default() }, "G1F1200X1.235")]
    #[case(MoveCommand { a: Some(-0.0001), ..Default::default() }, "G1F6000A0")]
    #[case(MoveCommand::default(), "G1F6000")]
    fn move_rendering(#[case] cmd: MoveCommand, #[case] expected: &str) {
        assert_eq!(move_gcode(&cmd, 6000), expected);
    }

    #[test]
    fn probe_report_parses() {
        let p = parse_probe_position("junk\n[PRB:1.5,-2,3.25,0:1]\nok").unwrap();
        assert_eq!(
            p,
            ProbePosition {
                x: 1.5,
                y: -2.0,
                z: 3.25,
                a: 0.0,
                did_af: true
            }
        );
    }

    #[rstest]
    #[case("ok")]
    #[case("[PRB:1,2,3:1]")]
    #[case("[PRB:1,2,3,4:x]")]
    #[case("[PRB:1,2,3,4,5:0]")]
    fn probe_report_rejects_garbage(#[case] resp: &str) {
        assert!(parse_probe_position(resp).is_err());
    }

    #[test]
    fn actuator_codes_follow_firmware_profile() {
        assert_eq!(actuator_code(FcodeVersion::V1, Actuator::AirPump, false), "B4");
        assert_eq!(
            actuator_code(FcodeVersion::V2, Actuator::WaterPump, true),
            "M136P1"
        );
    }
}
