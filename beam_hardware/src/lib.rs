//! Simulated machine backends.
//!
//! `SimulatedDevice` answers the raw-mode command set the way the controller
//! firmware does (mode checks, line-check framing, `ER:RESET` on homing) and
//! supports fault injection. `SimulatedProbe` samples an analytic surface.

pub mod device;
pub mod error;
pub mod probe;

pub use beam_traits::line_checksum;
pub use device::{SimState, SimulatedDevice};
pub use error::HwError;
pub use probe::SimulatedProbe;
