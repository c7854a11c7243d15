//! Owner of the curve engraving height field for one editing session.
//!
//! All mutation goes through the store: full measurement of a new area,
//! partial remeasurement of selected cells, and clearing. Every successful
//! mutation is announced on the event bus.

use std::cell::{Cell, RefCell};

use beam_traits::{ProgressSink, ProgressUpdate, WorkareaGeometry};

use crate::config::CurveCfg;
use crate::curve::{BBox, CurveEngravingData, GridIndex};
use crate::error::{MeasurementError, Result};
use crate::events::{CurveEvent, EventBus, Subscription};
use crate::measurer::{MeasureHooks, Measurer, MeasurerGuard};

pub const INIT_PROGRESS_ID: &str = "init-measurer";
pub const MEASURE_PROGRESS_ID: &str = "measure-area";
pub const REMEASURE_PROGRESS_ID: &str = "remeasure-points";

const SETUP_FAILED_MESSAGE: &str = "Failed to start curve engraving measurer.";

/// How `clear_area` should ask before discarding data.
pub enum ClearConfirm<'a> {
    Ask(&'a dyn Fn() -> bool),
    /// Used when the workarea loses curve engraving support.
    Skip,
}

/// Clip `bbox` to the part of the bed the auto-focus probe can reach.
///
/// A positive probe offset shrinks the near edge, a negative one the far
/// edge. `None` when nothing of `bbox` remains.
pub fn reachable_area(bbox: &BBox, workarea: &WorkareaGeometry) -> Option<BBox> {
    let [afx, afy, _] = workarea.auto_focus_offset.unwrap_or([0.0; 3]);
    let left = afx.max(0.0);
    let right = workarea.width + afx.min(0.0);
    let top = afy.max(0.0);
    let bottom = workarea.height + afy.min(0.0);

    let BBox {
        mut x,
        mut y,
        mut width,
        mut height,
    } = *bbox;
    if x < left {
        width -= left - x;
        x = left;
    }
    if x + width > right {
        width = right - x;
    }
    if y < top {
        height -= top - y;
        y = top;
    }
    if y + height > bottom {
        height = bottom - y;
    }
    (width > 0.0 && height > 0.0).then_some(BBox {
        x,
        y,
        width,
        height,
    })
}

pub struct CurveEngravingStore {
    data: Option<CurveEngravingData>,
    cfg: CurveCfg,
    events: EventBus,
}

impl CurveEngravingStore {
    pub fn new(cfg: CurveCfg) -> Self {
        Self {
            data: None,
            cfg,
            events: EventBus::new(),
        }
    }

    pub fn data(&self) -> Option<&CurveEngravingData> {
        self.data.as_ref()
    }

    pub fn has_area(&self) -> bool {
        self.data.is_some()
    }

    pub fn cfg(&self) -> &CurveCfg {
        &self.cfg
    }

    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    /// Restore previously measured data, e.g. from a saved document.
    /// Ignored when the workarea cannot do curve engraving.
    pub fn load_data(&mut self, data: CurveEngravingData, workarea: &WorkareaGeometry) -> bool {
        if !workarea.supports_curve_engraving {
            tracing::warn!("workarea does not support curve engraving, ignoring saved data");
            return false;
        }
        self.data = Some(data);
        self.events.emit(CurveEvent::AreaSet);
        true
    }

    /// Measure a new area.
    ///
    /// Returns `Ok(false)` without touching the device when the clamped area
    /// is empty. The measurer is released on every path once acquired; a
    /// failed or cancelled measurement leaves the stored data as it was.
    pub fn set_area(
        &mut self,
        bbox: BBox,
        measurer: &mut dyn Measurer,
        workarea: &WorkareaGeometry,
        progress: &mut dyn ProgressSink,
    ) -> Result<bool> {
        let Some(area) = reachable_area(&bbox, workarea) else {
            tracing::info!(?bbox, "area outside reachable envelope, ignoring");
            return Ok(false);
        };
        let mut planned =
            CurveEngravingData::planned(area, self.cfg.gap, self.cfg.object_height_margin)
                .map_err(eyre::Report::new)?;

        let mut guard = MeasurerGuard::new(measurer);

        progress.open(INIT_PROGRESS_ID, "preparing measurer");
        let setup = guard.setup(&mut |text: &str| {
            progress.update(
                INIT_PROGRESS_ID,
                ProgressUpdate {
                    message: Some(text.to_string()),
                    percentage: None,
                },
            );
        });
        progress.close(INIT_PROGRESS_ID);
        match setup {
            Ok(true) => {}
            Ok(false) => {
                progress.pop_up_error(SETUP_FAILED_MESSAGE);
                return Err(eyre::Report::new(MeasurementError::SetupFailed));
            }
            Err(e) => {
                tracing::error!(error = %e, "measurer setup failed");
                progress.pop_up_error(SETUP_FAILED_MESSAGE);
                return Err(eyre::Report::new(MeasurementError::SetupFailed));
            }
        }

        let indices: Vec<GridIndex> = planned.points().indices().collect();
        let total = indices.len();
        tracing::info!(?area, points = total, "measuring area");

        let progress = RefCell::new(progress);
        progress
            .borrow_mut()
            .open(MEASURE_PROGRESS_ID, "measuring area");
        let never = || false;
        let mut on_point = |count: usize| {
            progress.borrow_mut().update(
                MEASURE_PROGRESS_ID,
                ProgressUpdate {
                    message: None,
                    percentage: Some(count as f64 / total as f64 * 100.0),
                },
            );
        };
        let mut on_text = |text: &str| {
            progress.borrow_mut().update(
                MEASURE_PROGRESS_ID,
                ProgressUpdate {
                    message: Some(text.to_string()),
                    percentage: None,
                },
            );
        };
        let mut hooks = MeasureHooks {
            check_cancel: &never,
            on_point_finished: &mut on_point,
            on_progress_text: &mut on_text,
        };
        let res = guard.measure_points(&planned, &indices, &mut hooks);
        drop(hooks);
        progress.borrow_mut().close(MEASURE_PROGRESS_ID);

        let measured = match res {
            Ok(Some(m)) => m,
            Ok(None) => return Err(eyre::Report::new(MeasurementError::Cancelled)),
            Err(e) => {
                return Err(eyre::Report::new(MeasurementError::Failed(e.to_string())));
            }
        };
        planned
            .apply(&measured)
            .map_err(|idx| eyre::Report::new(MeasurementError::InvalidIndex(idx)))?;

        tracing::info!(
            highest = planned.highest(),
            lowest = planned.lowest(),
            failed = planned.errors().len(),
            "area measured"
        );
        self.data = Some(planned);
        self.events.emit(CurveEvent::AreaSet);
        Ok(true)
    }

    /// Re-sample selected cells with an already set-up measurer.
    ///
    /// All-or-nothing: on cancellation or failure `None` is returned and the
    /// stored data is untouched.
    pub fn remeasure_points(
        &mut self,
        indices: &[GridIndex],
        measurer: &mut dyn Measurer,
        check_cancel: &dyn Fn() -> bool,
        progress: &mut dyn ProgressSink,
    ) -> Option<CurveEngravingData> {
        let Some(data) = self.data.as_ref() else {
            tracing::warn!("remeasure requested without an area");
            return None;
        };
        if let Some(bad) = indices.iter().find(|i| !data.points().contains(**i)) {
            tracing::warn!(row = bad.row, col = bad.col, "remeasure index out of range");
            return None;
        }

        progress.open(REMEASURE_PROGRESS_ID, "connecting");
        if check_cancel() {
            progress.close(REMEASURE_PROGRESS_ID);
            return None;
        }

        let total = indices.len();
        let completed = Cell::new(0usize);
        let progress = RefCell::new(progress);
        let mut on_point = |count: usize| {
            completed.set(count);
            progress.borrow_mut().update(
                REMEASURE_PROGRESS_ID,
                ProgressUpdate {
                    message: None,
                    percentage: Some(count as f64 / total as f64 * 100.0),
                },
            );
        };
        let mut on_text = |text: &str| {
            progress.borrow_mut().update(
                REMEASURE_PROGRESS_ID,
                ProgressUpdate {
                    message: Some(format!(
                        "remeasuring points {}/{total}\n{text}",
                        completed.get()
                    )),
                    percentage: None,
                },
            );
        };
        let mut hooks = MeasureHooks {
            check_cancel,
            on_point_finished: &mut on_point,
            on_progress_text: &mut on_text,
        };
        let res = measurer.measure_points(data, indices, &mut hooks);
        drop(hooks);
        progress.borrow_mut().close(REMEASURE_PROGRESS_ID);

        let measured = match res {
            Ok(Some(m)) => m,
            Ok(None) => {
                tracing::info!("remeasure cancelled");
                return None;
            }
            Err(e) => {
                tracing::warn!(error = %e, "remeasure failed");
                return None;
            }
        };

        let mut next = data.clone();
        if let Err(idx) = next.apply(&measured) {
            tracing::warn!(row = idx.row, col = idx.col, "measurer returned foreign index");
            return None;
        }
        tracing::info!(points = total, highest = next.highest(), lowest = next.lowest(), "points remeasured");
        self.data = Some(next.clone());
        self.events.emit(CurveEvent::PointsRemeasured);
        Some(next)
    }

    /// Discard the current area. Returns whether anything was cleared.
    pub fn clear_area(&mut self, confirm: ClearConfirm<'_>) -> bool {
        if self.data.is_none() {
            return false;
        }
        if let ClearConfirm::Ask(ask) = confirm {
            if !ask() {
                return false;
            }
        }
        self.data = None;
        self.events.emit(CurveEvent::AreaCleared);
        tracing::info!("curve engraving area cleared");
        true
    }

    /// Drop the area without asking when the new workarea cannot use it.
    pub fn on_workarea_changed(&mut self, workarea: &WorkareaGeometry) {
        if !workarea.supports_curve_engraving {
            self.clear_area(ClearConfirm::Skip);
        }
    }
}
