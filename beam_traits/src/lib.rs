//! Collaborator contracts for the raw-control and calibration engine.
//!
//! Everything the core talks to lives behind one of these traits: the
//! machine transport, the height probe, the workarea geometry lookup, the
//! progress notifier and the preference store. Errors cross the boundary
//! boxed so implementations can carry their own typed errors.

pub mod clock;

use std::time::Duration;

pub use clock::{Clock, MonotonicClock, TestClock};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Control mode the device connection currently reports.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ControlMode {
    #[default]
    Normal,
    Raw,
    Other(String),
}

/// Request/response channel to the machine's control socket.
pub trait Transport {
    /// (Re)open the control connection to `device_id`.
    fn connect(&mut self, device_id: &str) -> Result<(), BoxError>;

    /// Send one command and block until a response arrives or `timeout` elapses.
    /// The response may span several lines.
    fn send_raw(&mut self, cmd: &str, timeout: Duration) -> Result<String, BoxError>;

    fn control_mode(&self) -> ControlMode;

    fn get_setting(&mut self, key: &str, timeout: Duration) -> Result<String, BoxError>;
}

/// Firmware checksum for line-check frames: for every non-space byte,
/// xor then add, modulo 65536. Shared by the session and any transport
/// that validates frames.
pub fn line_checksum(payload: &str) -> u32 {
    payload
        .bytes()
        .filter(|b| *b != b' ')
        .fold(0u32, |crc, b| (crc ^ u32::from(b)).wrapping_add(u32::from(b)))
        % 65536
}

/// One height sample. `z` is `None` when the probe could not resolve a surface.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ProbeReading {
    pub z: Option<f64>,
    pub quality: [Option<f64>; 2],
}

pub trait HeightProbe {
    fn prepare(&mut self) -> Result<(), BoxError>;
    fn probe(&mut self, x: f64, y: f64, timeout: Duration) -> Result<ProbeReading, BoxError>;
    fn release(&mut self) -> Result<(), BoxError>;
}

/// Bed geometry for one machine model, in millimetres.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkareaGeometry {
    pub width: f64,
    pub height: f64,
    /// Offset of the auto-focus probe from the laser head (x, y, z).
    pub auto_focus_offset: Option<[f64; 3]>,
    /// Fixed camera centre in image pixels, when the model has one.
    pub camera_center: Option<[f64; 2]>,
    pub supports_curve_engraving: bool,
    pub supports_open_bottom: bool,
}

pub trait WorkareaProvider {
    fn workarea(&self, model: &str) -> Option<WorkareaGeometry>;
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProgressUpdate {
    pub message: Option<String>,
    pub percentage: Option<f64>,
}

/// On-screen progress and alert notifier.
pub trait ProgressSink {
    fn open(&mut self, id: &str, message: &str);
    fn update(&mut self, id: &str, update: ProgressUpdate);
    fn close(&mut self, id: &str);
    fn pop_up_error(&mut self, message: &str);
}

pub trait PreferenceStore {
    fn get_bool(&self, name: &str) -> Option<bool>;
    fn get_f64(&self, name: &str) -> Option<f64>;
}

/// Progress sink that drops everything; handy for headless callers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn open(&mut self, _id: &str, _message: &str) {}
    fn update(&mut self, _id: &str, _update: ProgressUpdate) {}
    fn close(&mut self, _id: &str) {}
    fn pop_up_error(&mut self, _message: &str) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn connect(&mut self, device_id: &str) -> Result<(), BoxError> {
        (**self).connect(device_id)
    }
    fn send_raw(&mut self, cmd: &str, timeout: Duration) -> Result<String, BoxError> {
        (**self).send_raw(cmd, timeout)
    }
    fn control_mode(&self) -> ControlMode {
        (**self).control_mode()
    }
    fn get_setting(&mut self, key: &str, timeout: Duration) -> Result<String, BoxError> {
        (**self).get_setting(key, timeout)
    }
}
