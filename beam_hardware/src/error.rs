use thiserror::Error;

/// Failures reported by a device connection.
///
/// The string payloads carry the firmware's own error text so callers can
/// log exactly what the machine said.
#[derive(Debug, Error)]
pub enum HwError {
    #[error("device timeout")]
    Timeout,
    #[error("L_UNKNOWN_COMMAND: {0}")]
    UnknownCommand(String),
    #[error("CONTROL_SOCKET_MODE_ERROR: {0}")]
    ModeError(String),
    #[error("OPERATION_ERROR: {0}")]
    OperationError(String),
    #[error("device disconnected")]
    Disconnected,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HwError>;
