//! Human-readable error descriptions and structured JSON error formatting.

use beam_core::{CalibrationError, DeviceError, DeviceErrorKind, MeasurementError, WorkflowError};
use serde_json::json;

fn device_text(e: &DeviceError) -> String {
    match e.kind {
        DeviceErrorKind::Timeout => format!(
            "What happened: The machine did not answer in time ({e}).\nLikely causes: Network drop, machine powered off, or a busy controller.\nHow to fix: Check the connection and consider raising timeouts.command_ms in the config."
        ),
        DeviceErrorKind::ControlSocketModeError => format!(
            "What happened: The machine rejected a command in its current mode ({e}).\nLikely causes: Another task owns the machine, or raw mode was left by someone else.\nHow to fix: Stop the running task on the machine and try again."
        ),
        DeviceErrorKind::UnknownCommand => format!(
            "What happened: The machine does not know a command we sent ({e}).\nLikely causes: Old firmware or the wrong device.fcode_version.\nHow to fix: Update the firmware or set device.fcode_version to match it."
        ),
        DeviceErrorKind::OperationError | DeviceErrorKind::Other => format!(
            "What happened: The machine reported an error ({e}).\nLikely causes: See logs.\nHow to fix: Re-run with --log-level=debug or set RUST_LOG for more detail."
        ),
    }
}

/// Map an eyre::Report to a human-readable explanation with likely causes and fix hints.
pub fn humanize(err: &eyre::Report) -> String {
    // Typed matches first
    if let Some(we) = err.downcast_ref::<WorkflowError>() {
        return match we {
            WorkflowError::EnterRaw(e) => format!(
                "What happened: The machine refused to enter raw mode ({e}).\nLikely causes: A job or another client is using the machine.\nHow to fix: Wait for the current task to finish, then try again."
            ),
            WorkflowError::Move(e) => format!(
                "What happened: Moving the head failed; the machine was released.\n{}",
                device_text(e)
            ),
        };
    }

    if let Some(de) = err.downcast_ref::<DeviceError>() {
        return device_text(de);
    }

    if let Some(me) = err.downcast_ref::<MeasurementError>() {
        return match me {
            MeasurementError::SetupFailed => {
                "What happened: Failed to start curve engraving measurer.\nLikely causes: The machine could not enter raw mode or home.\nHow to fix: Make sure the machine is idle and the lid is closed, then try again.".to_string()
            }
            MeasurementError::Cancelled => {
                "What happened: Measurement cancelled.\nLikely causes: Ctrl-C was pressed.\nHow to fix: Run the command again to measure.".to_string()
            }
            MeasurementError::Failed(msg) => format!(
                "What happened: Measurement failed ({msg}).\nLikely causes: Auto-focus could not reach the surface or the machine stopped answering.\nHow to fix: Check the object under the head; previously measured data was kept."
            ),
            MeasurementError::InvalidIndex(idx) => format!(
                "What happened: Point ({}, {}) is not part of the measured grid.\nLikely causes: A --remeasure index larger than the grid.\nHow to fix: Use ROW,COL values inside the grid printed by `beam measure`.",
                idx.row, idx.col
            ),
            MeasurementError::NoArea => {
                "What happened: No curve engraving area is set.\nLikely causes: Remeasure requested before measuring.\nHow to fix: Measure an area first.".to_string()
            }
        };
    }

    if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        return match ce {
            CalibrationError::MissingKey(key) => format!(
                "What happened: Camera offset is missing key {key}.\nLikely causes: The camera was never calibrated or the setting is truncated.\nHow to fix: Provide X, Y, R and S (or SX and SY) values, or recalibrate the camera."
            ),
            CalibrationError::OutOfEnvelope { .. } => format!(
                "What happened: {ce}.\nLikely causes: The area lies where the auto-focus probe cannot reach.\nHow to fix: Move the area inside the bed, away from the edges the probe cannot cover."
            ),
            CalibrationError::InvalidValue { .. } => format!(
                "What happened: {ce}.\nLikely causes: A zero or non-finite value in the config or input.\nHow to fix: Fix the value and try again."
            ),
            CalibrationError::ShapeMismatch { .. }
            | CalibrationError::UnsortedHeights
            | CalibrationError::LengthMismatch { .. } => format!(
                "What happened: The height calibration series is inconsistent ({ce}).\nLikely causes: A calibration file from a different grid or a partial export.\nHow to fix: Re-export the calibration series."
            ),
        };
    }

    // String-based heuristics for errors coming from init or config
    let msg = err.to_string();
    let lower = msg.to_ascii_lowercase();

    if lower.contains("height series csv must have headers") {
        return "Invalid headers in height series CSV. Expected 'height,row,col,dx,dy'.".to_string();
    }

    if lower.contains("invalid configuration") || lower.contains("parse config") {
        let detail = err
            .chain()
            .skip(1)
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(": ");
        return format!(
            "What happened: Configuration is invalid ({detail}).\nLikely causes: A typo or an out-of-range value in the TOML.\nHow to fix: Edit the config file and try again."
        );
    }

    if lower.contains("read config") {
        return format!(
            "What happened: Could not read the config file ({msg}).\nLikely causes: Wrong --config path.\nHow to fix: Pass --config with the path to your beam.toml."
        );
    }

    if lower.contains("no workarea") {
        return format!(
            "What happened: {msg}.\nLikely causes: Missing [[workarea]] entry for device.model.\nHow to fix: Add a [[workarea]] table whose model matches device.model."
        );
    }

    // Generic fallback
    let mut cause = String::new();
    if let Some(src) = err.chain().nth(1) {
        cause = format!(" Cause: {src}");
    }
    format!(
        "Something went wrong.{cause}\nHow to fix: Re-run with --log-level=debug for details. Original: {msg}"
    )
}

/// Stable exit codes per error family; everything else is 1.
pub fn exit_code_for_error(err: &eyre::Report) -> i32 {
    if err.downcast_ref::<WorkflowError>().is_some() || err.downcast_ref::<DeviceError>().is_some()
    {
        return 3;
    }
    if err.downcast_ref::<MeasurementError>().is_some() {
        return 4;
    }
    if err.downcast_ref::<CalibrationError>().is_some() {
        return 5;
    }
    1
}

fn device_json(e: &DeviceError) -> serde_json::Value {
    json!({ "kind": e.kind.to_string(), "message": e.message })
}

/// Structured JSON for errors when --json is enabled.
pub fn format_error_json(err: &eyre::Report) -> String {
    let msg = humanize(err);

    let (reason, details) = if let Some(we) = err.downcast_ref::<WorkflowError>() {
        let reason = match we {
            WorkflowError::EnterRaw(_) => "EnterRaw",
            WorkflowError::Move(_) => "Move",
        };
        (reason, Some(device_json(we.device_error())))
    } else if let Some(de) = err.downcast_ref::<DeviceError>() {
        ("Device", Some(device_json(de)))
    } else if let Some(me) = err.downcast_ref::<MeasurementError>() {
        let reason = match me {
            MeasurementError::SetupFailed => "SetupFailed",
            MeasurementError::Cancelled => "Cancelled",
            MeasurementError::Failed(_) => "MeasurementFailed",
            MeasurementError::InvalidIndex(_) => "InvalidIndex",
            MeasurementError::NoArea => "NoArea",
        };
        let details = match me {
            MeasurementError::InvalidIndex(idx) => Some(json!({ "row": idx.row, "col": idx.col })),
            _ => None,
        };
        (reason, details)
    } else if let Some(ce) = err.downcast_ref::<CalibrationError>() {
        let reason = match ce {
            CalibrationError::MissingKey(_) => "MissingKey",
            CalibrationError::InvalidValue { .. } => "InvalidValue",
            CalibrationError::OutOfEnvelope { .. } => "OutOfEnvelope",
            CalibrationError::ShapeMismatch { .. } => "ShapeMismatch",
            CalibrationError::UnsortedHeights => "UnsortedHeights",
            CalibrationError::LengthMismatch { .. } => "LengthMismatch",
        };
        let details = match ce {
            CalibrationError::MissingKey(key) => Some(json!({ "key": key })),
            CalibrationError::OutOfEnvelope { width, height } => {
                Some(json!({ "width": width, "height": height }))
            }
            _ => None,
        };
        (reason, details)
    } else {
        ("Error", None)
    };

    let obj = match details {
        Some(d) => json!({ "reason": reason, "details": d, "message": msg }),
        None => json!({ "reason": reason, "message": msg }),
    };
    obj.to_string()
}
