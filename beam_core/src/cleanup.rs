//! Ordered, best-effort cleanup.
//!
//! Every step runs even when earlier ones fail; failures are logged and
//! collected so the caller can decide which one to surface.

use crate::error::DeviceError;

type Step<'a, S> = Box<dyn FnOnce(&mut S) -> Result<(), DeviceError> + 'a>;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct CleanupReport {
    pub attempted: Vec<&'static str>,
    pub failures: Vec<(&'static str, DeviceError)>,
}

impl CleanupReport {
    #[inline]
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn first_failure(&self) -> Option<&DeviceError> {
        self.failures.first().map(|(_, e)| e)
    }
}

pub struct CleanupRegion<'a, S> {
    steps: Vec<(&'static str, Step<'a, S>)>,
}

impl<S> Default for CleanupRegion<'_, S> {
    fn default() -> Self {
        Self { steps: Vec::new() }
    }
}

impl<'a, S> CleanupRegion<'a, S> {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn step(
        mut self,
        name: &'static str,
        f: impl FnOnce(&mut S) -> Result<(), DeviceError> + 'a,
    ) -> Self {
        self.steps.push((name, Box::new(f)));
        self
    }

    #[must_use]
    pub fn step_if(
        self,
        cond: bool,
        name: &'static str,
        f: impl FnOnce(&mut S) -> Result<(), DeviceError> + 'a,
    ) -> Self {
        if cond { self.step(name, f) } else { self }
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn run(self, target: &mut S) -> CleanupReport {
        let mut report = CleanupReport::default();
        for (name, f) in self.steps {
            report.attempted.push(name);
            if let Err(e) = f(target) {
                tracing::warn!(step = name, error = %e, "cleanup step failed");
                report.failures.push((name, e));
            }
        }
        report
    }
}
