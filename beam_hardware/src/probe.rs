use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use beam_traits::{BoxError, HeightProbe, ProbeReading};

use crate::error::HwError;

type Surface = Box<dyn Fn(f64, f64) -> Option<f64>>;

/// Height probe over an analytic surface, without any transport underneath.
pub struct SimulatedProbe {
    surface: Surface,
    prepared: Rc<Cell<bool>>,
    probes: Rc<Cell<usize>>,
    fail_after: Option<usize>,
    latency: Duration,
}

impl SimulatedProbe {
    pub fn new(surface: impl Fn(f64, f64) -> Option<f64> + 'static) -> Self {
        Self {
            surface: Box::new(surface),
            prepared: Rc::new(Cell::new(false)),
            probes: Rc::new(Cell::new(0)),
            fail_after: None,
            latency: Duration::ZERO,
        }
    }

    pub fn flat(z: f64) -> Self {
        Self::new(move |_, _| Some(z))
    }

    /// Time out on every probe once `n` probes have succeeded.
    #[must_use]
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }

    /// Each probe takes `latency`; callers waiting less see a timeout.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Shared counter of completed probes.
    pub fn probe_count(&self) -> Rc<Cell<usize>> {
        Rc::clone(&self.probes)
    }

    pub fn prepared_flag(&self) -> Rc<Cell<bool>> {
        Rc::clone(&self.prepared)
    }
}

impl HeightProbe for SimulatedProbe {
    fn prepare(&mut self) -> Result<(), BoxError> {
        self.prepared.set(true);
        Ok(())
    }

    fn probe(&mut self, x: f64, y: f64, timeout: Duration) -> Result<ProbeReading, BoxError> {
        if !self.prepared.get() {
            return Err(HwError::ModeError("probe not prepared".into()).into());
        }
        if self.latency > timeout || self.fail_after.is_some_and(|n| self.probes.get() >= n) {
            return Err(HwError::Timeout.into());
        }
        self.probes.set(self.probes.get() + 1);
        let z = (self.surface)(x, y);
        tracing::trace!(x, y, ?z, "sim probe");
        Ok(ProbeReading {
            z,
            quality: [z.map(|_| 1.0), None],
        })
    }

    fn release(&mut self) -> Result<(), BoxError> {
        self.prepared.set(false);
        Ok(())
    }
}
