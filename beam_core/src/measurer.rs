//! Height measurement devices.
//!
//! A `Measurer` turns grid indices into heights. `ProbeMeasurer` does so one
//! point at a time over any `HeightProbe`; `RawSessionProbe` is a probe that
//! drives the head through a raw session and reads the auto-focus result.

use std::time::Duration;

use beam_traits::{BoxError, Clock, HeightProbe, ProbeReading, Transport};

use crate::curve::{CurveEngravingData, GridIndex, MeasureData, MeasuredPoint};
use crate::error::{DeviceError, MeasurementError};
use crate::session::{MoveCommand, RawSession};
use crate::workflow::release_region;

/// Callbacks a batch measurement reports through.
pub struct MeasureHooks<'a> {
    /// Checked before every point; returning true stops the batch.
    pub check_cancel: &'a dyn Fn() -> bool,
    /// Called with the number of finished points after each point.
    pub on_point_finished: &'a mut dyn FnMut(usize),
    pub on_progress_text: &'a mut dyn FnMut(&str),
}

pub trait Measurer {
    /// Prepare the device. `Ok(false)` means it is not usable.
    fn setup(&mut self, on_progress: &mut dyn FnMut(&str)) -> Result<bool, BoxError>;

    /// Measure `indices` of `data`. `Ok(None)` means the batch was cancelled.
    fn measure_points(
        &mut self,
        data: &CurveEngravingData,
        indices: &[GridIndex],
        hooks: &mut MeasureHooks<'_>,
    ) -> Result<Option<MeasureData>, BoxError>;

    fn end(&mut self) -> Result<(), BoxError>;
}

/// Calls `end()` on the wrapped measurer when dropped.
pub struct MeasurerGuard<'a, M: Measurer + ?Sized> {
    inner: &'a mut M,
}

impl<'a, M: Measurer + ?Sized> MeasurerGuard<'a, M> {
    pub fn new(inner: &'a mut M) -> Self {
        Self { inner }
    }
}

impl<M: Measurer + ?Sized> std::ops::Deref for MeasurerGuard<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.inner
    }
}

impl<M: Measurer + ?Sized> std::ops::DerefMut for MeasurerGuard<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.inner
    }
}

impl<M: Measurer + ?Sized> Drop for MeasurerGuard<'_, M> {
    fn drop(&mut self) {
        if let Err(e) = self.inner.end() {
            tracing::warn!(error = %e, "failed to release measurer");
        }
    }
}

/// Point-by-point measurer over a height probe.
pub struct ProbeMeasurer<P: HeightProbe> {
    probe: P,
    timeout: Duration,
    ready: bool,
}

impl<P: HeightProbe> ProbeMeasurer<P> {
    pub fn new(probe: P, timeout: Duration) -> Self {
        Self {
            probe,
            timeout,
            ready: false,
        }
    }

    pub fn probe(&self) -> &P {
        &self.probe
    }

    pub fn into_probe(self) -> P {
        self.probe
    }
}

impl<P: HeightProbe> Measurer for ProbeMeasurer<P> {
    fn setup(&mut self, on_progress: &mut dyn FnMut(&str)) -> Result<bool, BoxError> {
        on_progress("preparing height probe");
        self.probe.prepare()?;
        self.ready = true;
        Ok(true)
    }

    fn measure_points(
        &mut self,
        data: &CurveEngravingData,
        indices: &[GridIndex],
        hooks: &mut MeasureHooks<'_>,
    ) -> Result<Option<MeasureData>, BoxError> {
        if !self.ready {
            return Err(Box::new(MeasurementError::SetupFailed));
        }
        let mut out = MeasureData::default();
        for (done, idx) in indices.iter().enumerate() {
            if (hooks.check_cancel)() {
                tracing::info!(done, total = indices.len(), "measurement cancelled");
                return Ok(None);
            }
            let Some(cell) = data.points().get(*idx) else {
                return Err(Box::new(MeasurementError::InvalidIndex(*idx)));
            };
            (hooks.on_progress_text)(&format!("measuring ({:.1}, {:.1})", cell.x, cell.y));

            let ProbeReading { z, quality } = self.probe.probe(cell.x, cell.y, self.timeout)?;
            tracing::debug!(row = idx.row, col = idx.col, ?z, "measured point");
            out.points.push((
                *idx,
                MeasuredPoint {
                    x: cell.x,
                    y: cell.y,
                    z,
                    quality,
                },
            ));
            if z.is_none() {
                out.failed.push(*idx);
            }
            (hooks.on_point_finished)(done + 1);
        }
        Ok(Some(out))
    }

    fn end(&mut self) -> Result<(), BoxError> {
        if !self.ready {
            return Ok(());
        }
        self.ready = false;
        self.probe.release()
    }
}

/// Probe that moves the head over each point and auto-focuses there.
///
/// prepare: enter raw, home, line-check when configured.
/// probe: move, auto-focus, read the probe position.
/// release: the usual raw-mode release steps.
pub struct RawSessionProbe<T: Transport, C: Clock> {
    session: RawSession<T, C>,
    line_check: bool,
    /// Offset of the auto-focus probe from the head; the head is moved so
    /// that the probe lands on the requested point.
    probe_offset: [f64; 2],
}

impl<T: Transport, C: Clock> RawSessionProbe<T, C> {
    pub fn new(session: RawSession<T, C>, probe_offset: [f64; 2]) -> Self {
        Self {
            session,
            line_check: false,
            probe_offset,
        }
    }

    pub fn session(&self) -> &RawSession<T, C> {
        &self.session
    }

    pub fn into_session(self) -> RawSession<T, C> {
        self.session
    }
}

impl<T: Transport, C: Clock> HeightProbe for RawSessionProbe<T, C> {
    fn prepare(&mut self) -> Result<(), BoxError> {
        let use_line_check = self.session.cfg().line_check;
        let res = (|| -> Result<(), DeviceError> {
            self.session.enter_raw()?;
            self.session.home()?;
            if use_line_check {
                self.session.start_line_check()?;
                self.line_check = true;
            }
            Ok(())
        })();
        if let Err(e) = res {
            if let Err(re) = self.release() {
                tracing::warn!(error = %re, "release after failed prepare also failed");
            }
            return Err(Box::new(e));
        }
        Ok(())
    }

    fn probe(&mut self, x: f64, y: f64, timeout: Duration) -> Result<ProbeReading, BoxError> {
        let [dx, dy] = self.probe_offset;
        self.session.move_to(&MoveCommand::xy(x - dx, y - dy))?;
        self.session.auto_focus(timeout)?;
        let pos = self.session.probe_position()?;
        let z = pos.did_af.then_some(pos.z);
        Ok(ProbeReading {
            z,
            quality: [Some(if pos.did_af { 1.0 } else { 0.0 }), None],
        })
    }

    fn release(&mut self) -> Result<(), BoxError> {
        let line_check = std::mem::take(&mut self.line_check);
        let report = release_region(line_check).run(&mut self.session);
        match report.failures.into_iter().next() {
            Some((_, e)) => Err(Box::new(e)),
            None => Ok(()),
        }
    }
}
