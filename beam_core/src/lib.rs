#![cfg_attr(all(not(debug_assertions), not(test)), deny(warnings))]
#![cfg_attr(
    all(not(debug_assertions), not(test)),
    deny(clippy::all, clippy::pedantic, clippy::nursery)
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
#![cfg_attr(not(test), deny(clippy::unwrap_used, clippy::expect_used))]
//! Raw-control and curve-compensation core (hardware-agnostic).
//!
//! All machine interaction goes through the `beam_traits` collaborator
//! traits, so the same code drives the simulator in tests and a real control
//! socket in production.
//!
//! ## Architecture
//!
//! - **Raw session**: state machine over the control socket (`session`),
//!   line-check framing, reconnect recovery
//! - **Cleanup**: ordered best-effort release steps (`cleanup`) and the
//!   workflows built on them (`workflow`)
//! - **Camera offset**: setting string parsing (`camera_offset`)
//! - **Curve engraving**: height field (`curve`), measurers (`measurer`),
//!   the owning store with change events (`store`, `events`)
//! - **Interpolation**: height dependent corrections (`interpolation`)
//!
//! Errors are typed per concern (`error`) and travel as `eyre::Report` at
//! the crate boundary.

pub mod camera_offset;
pub mod cleanup;
pub mod config;
pub mod conversions;
pub mod curve;
pub mod error;
pub mod events;
pub mod hw_error;
pub mod interpolation;
pub mod measurer;
pub mod session;
pub mod store;
pub mod workflow;

pub use camera_offset::{CameraOffset, IDEAL_CAMERA_OFFSET, fetch_camera_offset, parse_camera_offset};
pub use cleanup::{CleanupRegion, CleanupReport};
pub use config::{CurveCfg, FcodeVersion, RawSessionCfg};
pub use curve::{BBox, CurveEngravingData, Grid, GridIndex, MeasureData, MeasuredPoint};
pub use error::{
    CalibrationError, DeviceError, DeviceErrorKind, MeasurementError, Report, Result,
    WorkflowError,
};
pub use events::{CurveEvent, EventBus, Subscription};
pub use interpolation::{
    HeightCalibrationSeries, HeightCompensation, LevelingOffsetGrid, RegressionSeries,
};
pub use measurer::{MeasureHooks, Measurer, MeasurerGuard, ProbeMeasurer, RawSessionProbe};
pub use session::{MoveCommand, ProbePosition, RawSession, SessionState};
pub use store::{ClearConfirm, CurveEngravingStore};
pub use workflow::{move_to_point, prepare_preview, release_preview};
