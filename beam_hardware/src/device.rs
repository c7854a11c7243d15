//! Simulated laser controller speaking the raw-mode command set.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use beam_traits::{BoxError, ControlMode, Transport, line_checksum};

use crate::error::HwError;

type Surface = Box<dyn Fn(f64, f64) -> Option<f64>>;

/// Observable state of the simulated machine.
pub struct SimState {
    pub mode: ControlMode,
    pub connected: bool,
    pub connects: u32,
    pub line_check: bool,
    pub next_line: u32,
    pub homed: bool,
    pub position: [f64; 4],
    pub fan: bool,
    pub air_pump: bool,
    pub water_pump: bool,
    pub motors_loose: bool,
    /// Every command exactly as received, framing included.
    pub sent: Vec<String>,
    pub settings: HashMap<String, String>,
    /// Number of upcoming `raw home` requests answered with `ER:RESET`.
    pub home_resets: u32,
    faults: Vec<(String, HwError)>,
    delays: Vec<(String, Duration)>,
    surface: Surface,
    last_focus: Option<f64>,
}

impl SimState {
    /// Commands with framing stripped, in the order they were received.
    pub fn bodies(&self) -> Vec<String> {
        self.sent.iter().map(|c| strip_frame(c).to_string()).collect()
    }

    pub fn count(&self, body: &str) -> usize {
        self.sent.iter().filter(|c| strip_frame(c) == body).count()
    }
}

fn strip_frame(cmd: &str) -> &str {
    let Some(rest) = cmd.strip_prefix('N') else {
        return cmd;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    if digits == 0 {
        return cmd;
    }
    let body = &rest[digits..];
    match body.rfind('*') {
        Some(star) => &body[..star],
        None => body,
    }
}

/// In-memory device. Clones share state, so a test can keep a handle while
/// the session under test owns the transport.
#[derive(Clone)]
pub struct SimulatedDevice {
    state: Rc<RefCell<SimState>>,
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    pub fn new() -> Self {
        Self::with_surface(|_, _| Some(0.0))
    }

    /// Device whose auto-focus reports `surface(x, y)` at the head position.
    pub fn with_surface(surface: impl Fn(f64, f64) -> Option<f64> + 'static) -> Self {
        let state = SimState {
            mode: ControlMode::Normal,
            connected: true,
            connects: 0,
            line_check: false,
            next_line: 1,
            homed: false,
            position: [0.0; 4],
            fan: true,
            air_pump: true,
            water_pump: true,
            motors_loose: false,
            sent: Vec::new(),
            settings: HashMap::new(),
            home_resets: 0,
            faults: Vec::new(),
            delays: Vec::new(),
            surface: Box::new(surface),
            last_focus: None,
        };
        Self {
            state: Rc::new(RefCell::new(state)),
        }
    }

    pub fn set_setting(&self, key: &str, value: &str) {
        self.state
            .borrow_mut()
            .settings
            .insert(key.to_string(), value.to_string());
    }

    /// Fail the next command whose body starts with `prefix`.
    pub fn fail_next(&self, prefix: &str, err: HwError) {
        self.state
            .borrow_mut()
            .faults
            .push((prefix.to_string(), err));
    }

    /// Answer commands whose body starts with `prefix` after `delay`. A
    /// caller waiting less than that sees a timeout and the command is lost.
    pub fn set_reply_delay(&self, prefix: &str, delay: Duration) {
        self.state
            .borrow_mut()
            .delays
            .push((prefix.to_string(), delay));
    }

    pub fn state(&self) -> std::cell::Ref<'_, SimState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> std::cell::RefMut<'_, SimState> {
        self.state.borrow_mut()
    }

    fn dispatch(st: &mut SimState, body: &str) -> Result<String, HwError> {
        let raw = st.mode == ControlMode::Raw;
        match body {
            "task raw" => {
                st.mode = ControlMode::Raw;
                return Ok("ok".into());
            }
            "task quit" => {
                if !raw {
                    return Err(HwError::OperationError("not in sub task".into()));
                }
                st.mode = ControlMode::Normal;
                return Ok("ok".into());
            }
            _ => {}
        }
        if !raw {
            return Err(HwError::ModeError(body.to_string()));
        }
        match body {
            "raw home" => {
                if st.home_resets > 0 {
                    st.home_resets -= 1;
                    return Ok("ER:RESET".into());
                }
                st.homed = true;
                st.position = [0.0; 4];
                Ok("ok".into())
            }
            "$@" => {
                st.line_check = true;
                st.next_line = 1;
                Ok("CTRL LINECHECK_ENABLED".into())
            }
            "M172" => {
                st.line_check = false;
                Ok("CTRL LINECHECK_DISABLED".into())
            }
            "M136P1" | "B1" => Self::toggle(&mut st.water_pump, true),
            "M136P2" | "B2" => Self::toggle(&mut st.water_pump, false),
            "M136P3" | "B3" => Self::toggle(&mut st.air_pump, true),
            "M136P4" | "B4" => Self::toggle(&mut st.air_pump, false),
            "M136P5" | "B5" => Self::toggle(&mut st.fan, true),
            "M136P6" | "B6" => Self::toggle(&mut st.fan, false),
            "M137P34" | "B34" => Self::toggle(&mut st.motors_loose, true),
            "M137P179Q1" | "B206" => {
                st.last_focus = (st.surface)(st.position[0], st.position[1]);
                Ok("ok".into())
            }
            "M136P254" => {
                let [x, y, _, a] = st.position;
                let (z, did_af) = match st.last_focus {
                    Some(z) => (z, 1),
                    None => (0.0, 0),
                };
                Ok(format!("[PRB:{x:.3},{y:.3},{z:.3},{a:.3}:{did_af}]\nok"))
            }
            move_cmd if move_cmd.starts_with("G1") => {
                Self::apply_move(st, &move_cmd[2..]);
                st.motors_loose = false;
                Ok("ok".into())
            }
            other => Err(HwError::UnknownCommand(other.to_string())),
        }
    }

    fn toggle(flag: &mut bool, on: bool) -> Result<String, HwError> {
        *flag = on;
        Ok("ok".into())
    }

    fn apply_move(st: &mut SimState, args: &str) {
        let mut axis: Option<char> = None;
        let mut num = String::new();
        let flush = |axis: Option<char>, num: &str, st: &mut SimState| {
            let Ok(v) = num.parse::<f64>() else { return };
            match axis {
                Some('X') => st.position[0] = v,
                Some('Y') => st.position[1] = v,
                Some('Z') => st.position[2] = v,
                Some('A') => st.position[3] = v,
                _ => {}
            }
        };
        for ch in args.chars() {
            if ch.is_ascii_alphabetic() {
                flush(axis, &num, st);
                axis = Some(ch);
                num.clear();
            } else {
                num.push(ch);
            }
        }
        flush(axis, &num, st);
    }

    fn handle(&self, cmd: &str, timeout: Duration) -> Result<String, HwError> {
        let mut st = self.state.borrow_mut();
        st.sent.push(cmd.to_string());
        if !st.connected {
            return Err(HwError::Disconnected);
        }

        let body = strip_frame(cmd).to_string();
        if let Some(pos) = st.faults.iter().position(|(p, _)| body.starts_with(p.as_str())) {
            let (_, err) = st.faults.remove(pos);
            tracing::debug!(cmd = %body, error = %err, "sim: injected fault");
            return Err(err);
        }
        let delay = st
            .delays
            .iter()
            .find(|(p, _)| body.starts_with(p.as_str()))
            .map(|(_, d)| *d);
        if let Some(delay) = delay
            && delay > timeout
        {
            tracing::debug!(cmd = %body, ?delay, ?timeout, "sim: reply too slow");
            return Err(HwError::Timeout);
        }

        let framed = body.len() != cmd.len();
        if !framed {
            return Self::dispatch(&mut st, &body);
        }

        let digits = cmd[1..].bytes().take_while(u8::is_ascii_digit).count();
        let Ok(n) = cmd[1..=digits].parse::<u32>() else {
            return Ok(format!("ERL{}", st.next_line));
        };
        let expected_crc = cmd
            .rsplit_once('*')
            .and_then(|(_, c)| c.parse::<u32>().ok());
        let payload = &cmd[..cmd.rfind('*').unwrap_or(cmd.len())];
        if expected_crc != Some(line_checksum(payload)) {
            return Ok(format!("ER CHECKSUM {n}"));
        }
        if n != st.next_line {
            return Ok(format!("ERL{}", st.next_line));
        }
        let reply = Self::dispatch(&mut st, &body)?;
        st.next_line += 1;
        Ok(format!("{reply}\nLN{n} 0"))
    }
}

impl Transport for SimulatedDevice {
    fn connect(&mut self, device_id: &str) -> Result<(), BoxError> {
        let mut st = self.state.borrow_mut();
        st.connects += 1;
        st.connected = true;
        st.mode = ControlMode::Normal;
        tracing::debug!(device_id, "sim: connected");
        Ok(())
    }

    fn send_raw(&mut self, cmd: &str, timeout: Duration) -> Result<String, BoxError> {
        self.handle(cmd, timeout).map_err(Into::into)
    }

    fn control_mode(&self) -> ControlMode {
        self.state.borrow().mode.clone()
    }

    fn get_setting(&mut self, key: &str, _timeout: Duration) -> Result<String, BoxError> {
        let st = self.state.borrow();
        if st.mode == ControlMode::Raw {
            return Err(HwError::ModeError(format!("get {key}")).into());
        }
        st.settings
            .get(key)
            .cloned()
            .ok_or_else(|| HwError::OperationError(format!("no setting {key}")).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_skips_spaces() {
        assert_eq!(line_checksum("N1G1 X1"), line_checksum("N1G1X1"));
    }

    #[test]
    fn strip_frame_leaves_plain_commands() {
        assert_eq!(strip_frame("M172"), "M172");
        assert_eq!(strip_frame("N12G1F6000X1*321"), "G1F6000X1");
    }

    #[test]
    fn raw_only_commands_fail_outside_raw() {
        let mut dev = SimulatedDevice::new();
        let err = dev.send_raw("raw home", Duration::from_secs(1)).unwrap_err();
        assert!(err.to_string().contains("CONTROL_SOCKET_MODE_ERROR"));
    }

    #[test]
    fn framed_command_out_of_sequence_asks_for_resync() {
        let mut dev = SimulatedDevice::new();
        dev.send_raw("task raw", Duration::from_secs(1)).unwrap();
        dev.send_raw("$@", Duration::from_secs(1)).unwrap();
        let payload = "N5B5";
        let cmd = format!("{payload}*{}", line_checksum(payload));
        let reply = dev.send_raw(&cmd, Duration::from_secs(1)).unwrap();
        assert_eq!(reply, "ERL1");
    }

    #[test]
    fn oversized_line_number_asks_for_resync() {
        let mut dev = SimulatedDevice::new();
        dev.send_raw("task raw", Duration::from_secs(1)).unwrap();
        dev.send_raw("$@", Duration::from_secs(1)).unwrap();
        let payload = "N99999999999999999999B5";
        let cmd = format!("{payload}*{}", line_checksum(payload));
        let reply = dev.send_raw(&cmd, Duration::from_secs(1)).unwrap();
        assert_eq!(reply, "ERL1");
    }

    #[test]
    fn slow_reply_times_out_only_for_short_waits() {
        let mut dev = SimulatedDevice::new();
        dev.set_reply_delay("task raw", Duration::from_secs(5));
        let err = dev.send_raw("task raw", Duration::from_secs(1)).unwrap_err();
        assert_eq!(err.to_string(), "device timeout");
        assert_eq!(dev.control_mode(), ControlMode::Normal);
        dev.send_raw("task raw", Duration::from_secs(10)).unwrap();
        assert_eq!(dev.control_mode(), ControlMode::Raw);
    }
}
