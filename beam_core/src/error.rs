use std::fmt;

use thiserror::Error;

use crate::curve::GridIndex;

/// Classification of a transport/protocol failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErrorKind {
    Timeout,
    UnknownCommand,
    /// The command is not valid in the connection's current mode.
    ControlSocketModeError,
    /// The firmware refused the operation (e.g. quitting a task that is not running).
    OperationError,
    Other,
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Timeout => "TIMEOUT",
            Self::UnknownCommand => "L_UNKNOWN_COMMAND",
            Self::ControlSocketModeError => "CONTROL_SOCKET_MODE_ERROR",
            Self::OperationError => "OPERATION_ERROR",
            Self::Other => "DEVICE_ERROR",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeviceError {
    pub kind: DeviceErrorKind,
    pub message: String,
}

impl DeviceError {
    pub fn new(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn mode(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::ControlSocketModeError, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::new(DeviceErrorKind::Other, message)
    }

    pub fn is_timeout(&self) -> bool {
        self.kind == DeviceErrorKind::Timeout
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("camera offset is missing key {0:?}")]
    MissingKey(&'static str),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: String, value: String },
    #[error("area {width}x{height} mm lies outside the reachable envelope")]
    OutOfEnvelope { width: f64, height: f64 },
    #[error("calibration slice {index} has shape {actual:?}, expected {expected:?}")]
    ShapeMismatch {
        index: usize,
        expected: (usize, usize),
        actual: (usize, usize),
    },
    #[error("calibration heights must be strictly ascending")]
    UnsortedHeights,
    #[error("{heights} heights given for {slices} slices")]
    LengthMismatch { heights: usize, slices: usize },
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MeasurementError {
    #[error("failed to start curve engraving measurer")]
    SetupFailed,
    #[error("measurement cancelled")]
    Cancelled,
    #[error("measurement failed: {0}")]
    Failed(String),
    #[error("grid index {0:?} is outside the measured area")]
    InvalidIndex(GridIndex),
    #[error("no curve engraving area is set")]
    NoArea,
}

/// Failure of a move-to-point style workflow.
///
/// The primary error is always the first step that failed; cleanup failures
/// are logged and carried separately.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum WorkflowError {
    #[error("failed to enter raw mode: {0}")]
    EnterRaw(DeviceError),
    #[error("failed to move: {0}")]
    Move(DeviceError),
}

impl WorkflowError {
    pub fn device_error(&self) -> &DeviceError {
        match self {
            Self::EnterRaw(e) | Self::Move(e) => e,
        }
    }
}

pub type Result<T> = eyre::Result<T>;
pub use eyre::Report;
