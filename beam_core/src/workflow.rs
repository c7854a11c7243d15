//! Multi-step raw-mode workflows with guaranteed cleanup.

use beam_traits::{Clock, Transport};

use crate::cleanup::{CleanupRegion, CleanupReport};
use crate::error::{DeviceError, WorkflowError};
use crate::session::{MoveCommand, RawSession};

/// Steps that put the device back in a safe state after raw-mode work:
/// end line-check (only when it was entered), loose motor, exit raw.
pub fn release_region<'a, T, C>(line_check_entered: bool) -> CleanupRegion<'a, RawSession<T, C>>
where
    T: Transport + 'a,
    C: Clock + 'a,
{
    CleanupRegion::new()
        .step_if(line_check_entered, "end_line_check", |s: &mut RawSession<T, C>| {
            s.end_line_check()
        })
        .step("loose_motor", |s: &mut RawSession<T, C>| s.loose_motor())
        .step("exit_raw", |s: &mut RawSession<T, C>| s.exit_raw())
}

/// Drive the head to a single computed point.
///
/// enter raw, home, start line-check (when configured), compute the target,
/// one move, then the release steps. The release steps always run once raw
/// mode was entered; the first failure of the whole sequence is returned.
pub fn move_to_point<T, C, F>(session: &mut RawSession<T, C>, target: F) -> Result<(), WorkflowError>
where
    T: Transport,
    C: Clock,
    F: FnOnce() -> Result<MoveCommand, DeviceError>,
{
    if let Err(e) = session.enter_raw() {
        tracing::error!(error = %e, "move to point aborted before raw mode");
        return Err(WorkflowError::EnterRaw(e));
    }

    let use_line_check = session.cfg().line_check;
    let mut line_check_entered = false;
    let primary = (|| -> Result<(), DeviceError> {
        session.home()?;
        if use_line_check {
            session.start_line_check()?;
            line_check_entered = true;
        }
        let cmd = target()?;
        tracing::info!(x = ?cmd.x, y = ?cmd.y, "moving to point");
        session.move_to(&cmd)
    })();

    let report = release_region(line_check_entered).run(session);
    finish(primary, &report).map_err(WorkflowError::Move)
}

fn finish(primary: Result<(), DeviceError>, report: &CleanupReport) -> Result<(), DeviceError> {
    match (primary, report.first_failure()) {
        (Err(e), _) => {
            tracing::error!(error = %e, cleanup_failures = report.failures.len(), "failed to move");
            Err(e)
        }
        (Ok(()), Some(e)) => Err(e.clone()),
        (Ok(()), None) => Ok(()),
    }
}

/// Put the machine in the state the camera preview expects: raw mode, homed,
/// line-check when supported, fan and pumps off.
///
/// On failure the preview release path runs before the error is returned.
pub fn prepare_preview<T: Transport, C: Clock>(
    session: &mut RawSession<T, C>,
) -> Result<(), DeviceError> {
    let use_line_check = session.cfg().line_check;
    let res = (|| -> Result<(), DeviceError> {
        session.enter_raw()?;
        session.home()?;
        if use_line_check {
            session.start_line_check()?;
        }
        session.set_fan(false)?;
        session.set_air_pump(false)?;
        session.set_water_pump(false)
    })();

    if let Err(e) = res {
        tracing::error!(error = %e, "preview setup failed");
        release_preview(session);
        return Err(e);
    }
    tracing::info!("preview ready");
    Ok(())
}

/// Undo `prepare_preview`. Every step is attempted.
pub fn release_preview<T: Transport, C: Clock>(session: &mut RawSession<T, C>) -> CleanupReport {
    let needs_raw = !session.state().is_raw();
    let line_check = session.state() == crate::session::SessionState::RawLineCheck;
    CleanupRegion::new()
        .step_if(needs_raw, "enter_raw", |s: &mut RawSession<T, C>| s.enter_raw())
        .step_if(line_check, "end_line_check", |s: &mut RawSession<T, C>| {
            s.end_line_check()
        })
        .step("loose_motor", |s: &mut RawSession<T, C>| s.loose_motor())
        .step("exit_raw", |s: &mut RawSession<T, C>| s.exit_raw())
        .run(session)
}
