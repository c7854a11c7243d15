use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use beam_core::store::{MEASURE_PROGRESS_ID, REMEASURE_PROGRESS_ID};
use beam_core::{
    BBox, CurveCfg, CurveEngravingData, CurveEngravingStore, CurveEvent, GridIndex, MeasureData,
    MeasureHooks, MeasurementError, Measurer, MeasurerGuard, ProbeMeasurer, RawSession,
    RawSessionCfg, RawSessionProbe,
};
use beam_hardware::{SimulatedDevice, SimulatedProbe};
use beam_traits::{BoxError, ControlMode, ProgressSink, ProgressUpdate, TestClock, WorkareaGeometry};
use rstest::{fixture, rstest};

#[derive(Default)]
struct RecordingProgress {
    opened: Vec<String>,
    closed: Vec<String>,
    percentages: Vec<(String, f64)>,
    messages: Vec<String>,
    errors: Vec<String>,
}

impl ProgressSink for RecordingProgress {
    fn open(&mut self, id: &str, _message: &str) {
        self.opened.push(id.to_string());
    }
    fn update(&mut self, id: &str, update: ProgressUpdate) {
        if let Some(p) = update.percentage {
            self.percentages.push((id.to_string(), p));
        }
        if let Some(m) = update.message {
            self.messages.push(m);
        }
    }
    fn close(&mut self, id: &str) {
        self.closed.push(id.to_string());
    }
    fn pop_up_error(&mut self, message: &str) {
        self.errors.push(message.to_string());
    }
}

/// Measurer whose device never becomes ready.
#[derive(Default)]
struct Refusing {
    ended: usize,
}

impl Measurer for Refusing {
    fn setup(&mut self, _on_progress: &mut dyn FnMut(&str)) -> Result<bool, BoxError> {
        Ok(false)
    }
    fn measure_points(
        &mut self,
        _data: &CurveEngravingData,
        _indices: &[GridIndex],
        _hooks: &mut MeasureHooks<'_>,
    ) -> Result<Option<MeasureData>, BoxError> {
        Err("not ready".into())
    }
    fn end(&mut self) -> Result<(), BoxError> {
        self.ended += 1;
        Ok(())
    }
}

#[fixture]
fn bed() -> WorkareaGeometry {
    WorkareaGeometry {
        width: 400.0,
        height: 300.0,
        auto_focus_offset: Some([20.0, 5.0, 0.0]),
        supports_curve_engraving: true,
        ..WorkareaGeometry::default()
    }
}

fn store() -> CurveEngravingStore {
    CurveEngravingStore::new(CurveCfg::default())
}

fn sloped(bump: Rc<Cell<f64>>) -> SimulatedProbe {
    SimulatedProbe::new(move |x, _| Some(x / 10.0 + bump.get()))
}

fn measurer(probe: SimulatedProbe) -> ProbeMeasurer<SimulatedProbe> {
    ProbeMeasurer::new(probe, Duration::from_secs(1))
}

#[rstest]
fn set_area_clamps_and_measures(bed: WorkareaGeometry) {
    let mut store = store();
    let events = store.subscribe();
    let probe = sloped(Rc::default());
    let prepared = probe.prepared_flag();
    let mut m = measurer(probe);
    let mut progress = RecordingProgress::default();

    let changed = store
        .set_area(BBox::new(0.0, 0.0, 60.0, 45.0), &mut m, &bed, &mut progress)
        .unwrap();

    assert!(changed);
    let data = store.data().unwrap();
    assert_eq!(data.bbox, BBox::new(20.0, 5.0, 40.0, 40.0));
    assert_eq!(data.points().shape(), (3, 3));
    assert!(data.errors().is_empty());
    assert!((data.highest() - 6.0).abs() < 1e-12);
    assert!((data.lowest() - 2.0).abs() < 1e-12);
    assert!((data.object_height() - 16.0).abs() < 1e-12);
    assert_eq!(events.drain(), [CurveEvent::AreaSet]);
    assert!(!prepared.get(), "measurer must be released");

    let last = progress
        .percentages
        .iter()
        .filter(|(id, _)| id == MEASURE_PROGRESS_ID)
        .last()
        .unwrap();
    assert!((last.1 - 100.0).abs() < 1e-9);
    assert_eq!(progress.opened.len(), progress.closed.len());
}

#[rstest]
#[case(BBox::new(0.0, 0.0, 15.0, 100.0))]
#[case(BBox::new(400.0, 0.0, 50.0, 50.0))]
#[case(BBox::new(100.0, 100.0, 0.0, 10.0))]
fn set_area_outside_envelope_is_a_no_op(bed: WorkareaGeometry, #[case] bbox: BBox) {
    let mut store = store();
    let events = store.subscribe();
    let probe = SimulatedProbe::flat(1.0);
    let (count, prepared) = (probe.probe_count(), probe.prepared_flag());
    let mut m = measurer(probe);

    let changed = store
        .set_area(bbox, &mut m, &bed, &mut RecordingProgress::default())
        .unwrap();

    assert!(!changed);
    assert!(!store.has_area());
    assert_eq!(count.get(), 0);
    assert!(!prepared.get());
    assert!(events.drain().is_empty());
}

#[rstest]
fn setup_failure_alerts_and_releases(bed: WorkareaGeometry) {
    let mut store = store();
    let mut m = Refusing::default();
    let mut progress = RecordingProgress::default();

    let err = store
        .set_area(BBox::new(50.0, 50.0, 20.0, 20.0), &mut m, &bed, &mut progress)
        .unwrap_err();

    assert_eq!(
        err.downcast_ref::<MeasurementError>(),
        Some(&MeasurementError::SetupFailed)
    );
    assert_eq!(progress.errors, ["Failed to start curve engraving measurer."]);
    assert_eq!(m.ended, 1);
    assert!(!store.has_area());
}

#[rstest]
fn measurement_failure_keeps_previous_area(bed: WorkareaGeometry) {
    let mut store = store();
    let mut first = measurer(SimulatedProbe::flat(3.0));
    store
        .set_area(BBox::new(50.0, 50.0, 20.0, 20.0), &mut first, &bed, &mut RecordingProgress::default())
        .unwrap();
    let before = store.data().cloned();

    let probe = SimulatedProbe::flat(9.0).failing_after(2);
    let prepared = probe.prepared_flag();
    let mut m = measurer(probe);
    let err = store
        .set_area(BBox::new(50.0, 50.0, 40.0, 40.0), &mut m, &bed, &mut RecordingProgress::default())
        .unwrap_err();

    assert!(matches!(
        err.downcast_ref::<MeasurementError>(),
        Some(MeasurementError::Failed(_))
    ));
    assert_eq!(store.data().cloned(), before);
    assert!(!prepared.get());
}

#[rstest]
fn remeasure_updates_selected_cells(bed: WorkareaGeometry) {
    let mut store = store();
    let bump = Rc::new(Cell::new(0.0));
    let mut m = measurer(sloped(Rc::clone(&bump)));
    store
        .set_area(BBox::new(100.0, 100.0, 40.0, 40.0), &mut m, &bed, &mut RecordingProgress::default())
        .unwrap();
    let events = store.subscribe();
    let before = store.data().cloned().unwrap();

    bump.set(5.0);
    let targets = [GridIndex::new(1, 1), GridIndex::new(0, 2)];
    let mut progress = RecordingProgress::default();
    let after = {
        let mut guard = MeasurerGuard::new(&mut m);
        guard.setup(&mut |_: &str| {}).unwrap();
        store.remeasure_points(&targets, &mut *guard, &|| false, &mut progress)
    }
    .unwrap();

    assert_eq!(store.data(), Some(&after));
    for (idx, p) in after.points().indexed() {
        let old = before.points()[idx];
        if targets.contains(&idx) {
            assert!((p.z.unwrap() - old.z.unwrap() - 5.0).abs() < 1e-12);
        } else {
            assert_eq!(*p, old);
        }
    }
    // (0, 2) sits at x = 140
    assert!((after.highest() - 19.0).abs() < 1e-12);
    assert!((after.lowest() - 10.0).abs() < 1e-12);
    assert_eq!(events.drain(), [CurveEvent::PointsRemeasured]);

    let pcts: Vec<f64> = progress
        .percentages
        .iter()
        .filter(|(id, _)| id == REMEASURE_PROGRESS_ID)
        .map(|(_, p)| *p)
        .collect();
    assert_eq!(pcts, [50.0, 100.0]);
    assert!(progress.messages.iter().any(|m| m.starts_with("remeasuring points")));
    assert_eq!(progress.closed, [REMEASURE_PROGRESS_ID]);
}

#[rstest]
fn remeasure_cancelled_leaves_data_untouched(bed: WorkareaGeometry) {
    let mut store = store();
    let probe = SimulatedProbe::flat(2.0);
    let count = probe.probe_count();
    let mut m = measurer(probe);
    store
        .set_area(BBox::new(100.0, 100.0, 20.0, 20.0), &mut m, &bed, &mut RecordingProgress::default())
        .unwrap();
    let events = store.subscribe();
    let before = store.data().cloned();
    let probes_before = count.get();

    let mut guard = MeasurerGuard::new(&mut m);
    guard.setup(&mut |_: &str| {}).unwrap();
    let out = store.remeasure_points(
        &[GridIndex::new(0, 0)],
        &mut *guard,
        &|| true,
        &mut RecordingProgress::default(),
    );

    assert!(out.is_none());
    assert_eq!(store.data().cloned(), before);
    assert_eq!(count.get(), probes_before);
    assert!(events.drain().is_empty());
}

#[rstest]
fn remeasure_rejects_foreign_indices(bed: WorkareaGeometry) {
    let mut store = store();
    let mut m = measurer(SimulatedProbe::flat(2.0));
    assert!(
        store
            .remeasure_points(&[GridIndex::new(0, 0)], &mut m, &|| false, &mut RecordingProgress::default())
            .is_none()
    );

    store
        .set_area(BBox::new(100.0, 100.0, 20.0, 20.0), &mut m, &bed, &mut RecordingProgress::default())
        .unwrap();
    let out = store.remeasure_points(
        &[GridIndex::new(7, 0)],
        &mut m,
        &|| false,
        &mut RecordingProgress::default(),
    );
    assert!(out.is_none());
}

#[rstest]
fn measures_through_raw_session(bed: WorkareaGeometry) {
    let dev = SimulatedDevice::with_surface(|x, y| (x < 130.0).then_some(y / 100.0));
    let session = RawSession::with_clock(
        dev.clone(),
        "sim-01",
        RawSessionCfg::default(),
        TestClock::new(),
    );
    let mut m = measurer_over(session);
    let mut store = store();

    store
        .set_area(BBox::new(100.0, 100.0, 40.0, 20.0), &mut m, &bed, &mut RecordingProgress::default())
        .unwrap();

    let data = store.data().unwrap();
    assert_eq!(data.points().shape(), (2, 3));
    // the right column is beyond the simulated surface
    assert_eq!(data.errors(), [GridIndex::new(0, 2), GridIndex::new(1, 2)]);
    assert!((data.highest() - 1.2).abs() < 1e-9);
    assert!((data.lowest() - 1.0).abs() < 1e-9);

    let st = dev.state();
    assert_eq!(st.mode, ControlMode::Normal);
    assert_eq!(st.count("task quit"), 1);
    assert_eq!(st.count("M136P254"), 6);
    assert!(st.motors_loose);
}

fn measurer_over(
    session: RawSession<SimulatedDevice, TestClock>,
) -> ProbeMeasurer<RawSessionProbe<SimulatedDevice, TestClock>> {
    ProbeMeasurer::new(RawSessionProbe::new(session, [0.0, 0.0]), Duration::from_secs(1))
}
