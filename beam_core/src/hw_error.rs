//! Maps `Box<dyn Error>` from trait boundaries to typed `DeviceError`.
//!
//! The traits in `beam_traits` use `Box<dyn Error + Send + Sync>`; this module
//! classifies those errors, with an optional feature-gated path for
//! `beam_hardware::HwError` downcasting.

use crate::error::{DeviceError, DeviceErrorKind};

/// Map a trait-boundary error to a typed `DeviceError`.
///
/// Known hardware error types are downcast first, then the message is
/// matched against the firmware's error tokens.
pub fn map_hw_error(e: &(dyn std::error::Error + 'static)) -> DeviceError {
    if let Some(de) = e.downcast_ref::<DeviceError>() {
        return de.clone();
    }

    #[cfg(feature = "hardware-errors")]
    {
        use beam_hardware::HwError;
        if let Some(hw) = e.downcast_ref::<HwError>() {
            let kind = match hw {
                HwError::Timeout | HwError::Disconnected => DeviceErrorKind::Timeout,
                HwError::UnknownCommand(_) => DeviceErrorKind::UnknownCommand,
                HwError::ModeError(_) => DeviceErrorKind::ControlSocketModeError,
                HwError::OperationError(_) => DeviceErrorKind::OperationError,
                HwError::Io(_) => DeviceErrorKind::Other,
            };
            return DeviceError::new(kind, hw.to_string());
        }
    }

    let s = e.to_string();
    DeviceError::new(classify_message(&s), s)
}

/// Convenience for `map_err` on boxed trait results.
pub fn map_boxed(e: beam_traits::BoxError) -> DeviceError {
    map_hw_error(e.as_ref())
}

fn classify_message(s: &str) -> DeviceErrorKind {
    let lower = s.to_ascii_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        DeviceErrorKind::Timeout
    } else if s.contains("L_UNKNOWN_COMMAND") || lower.contains("unknown command") {
        DeviceErrorKind::UnknownCommand
    } else if s.contains("CONTROL_SOCKET_MODE_ERROR") {
        DeviceErrorKind::ControlSocketModeError
    } else if s.contains("OPERATION_ERROR") {
        DeviceErrorKind::OperationError
    } else {
        DeviceErrorKind::Other
    }
}
