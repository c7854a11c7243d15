use std::time::Duration;

use beam_core::error::DeviceErrorKind;
use beam_core::{
    DeviceError, MoveCommand, RawSession, RawSessionCfg, SessionState, WorkflowError,
    move_to_point, prepare_preview, release_preview,
};
use beam_hardware::{HwError, SimulatedDevice};
use beam_traits::{ControlMode, TestClock};
use rstest::{fixture, rstest};

struct Rig {
    dev: SimulatedDevice,
    clock: TestClock,
    session: RawSession<SimulatedDevice, TestClock>,
}

fn rig_with(cfg: RawSessionCfg) -> Rig {
    let dev = SimulatedDevice::new();
    let clock = TestClock::new();
    let session = RawSession::with_clock(dev.clone(), "sim-01", cfg, clock.clone());
    Rig {
        dev,
        clock,
        session,
    }
}

#[fixture]
fn rig() -> Rig {
    rig_with(RawSessionCfg::default())
}

fn point(x: f64, y: f64) -> impl FnOnce() -> Result<MoveCommand, DeviceError> {
    move || Ok(MoveCommand::xy(x, y))
}

#[rstest]
fn move_to_point_releases_in_order(mut rig: Rig) {
    move_to_point(&mut rig.session, point(10.0, 20.0)).unwrap();

    assert_eq!(
        rig.dev.state().bodies(),
        [
            "task raw",
            "raw home",
            "$@",
            "G1F6000X10Y20",
            "M172",
            "M137P34",
            "task quit"
        ]
    );
    let st = rig.dev.state();
    assert_eq!(st.mode, ControlMode::Normal);
    assert_eq!(st.position[..2], [10.0, 20.0]);
    assert!(st.motors_loose);
    assert_eq!(rig.session.state(), SessionState::Normal);
    // settle delay after entering raw mode
    assert_eq!(rig.clock.elapsed(), Duration::from_millis(3000));
}

#[rstest]
fn move_without_line_check_skips_framing() {
    let mut rig = rig_with(RawSessionCfg {
        line_check: false,
        ..RawSessionCfg::default()
    });
    move_to_point(&mut rig.session, point(1.0, 2.0)).unwrap();
    let st = rig.dev.state();
    assert_eq!(st.count("$@"), 0);
    assert_eq!(st.count("M172"), 0);
    assert!(st.sent.iter().all(|c| !c.starts_with('N')));
}

#[rstest]
fn failed_move_still_releases_device(mut rig: Rig) {
    rig.dev.fail_next("G1", HwError::Timeout);

    let err = move_to_point(&mut rig.session, point(5.0, 5.0)).unwrap_err();
    match &err {
        WorkflowError::Move(e) => assert_eq!(e.kind, DeviceErrorKind::Timeout),
        other => panic!("expected move error, got {other:?}"),
    }
    let st = rig.dev.state();
    assert_eq!(st.count("M172"), 1);
    assert_eq!(st.count("M137P34"), 1);
    assert_eq!(st.count("task quit"), 1);
    assert_eq!(st.mode, ControlMode::Normal);
}

#[rstest]
fn failed_target_skips_move_but_releases(mut rig: Rig) {
    let err = move_to_point(&mut rig.session, || {
        Err(DeviceError::other("camera offset unavailable"))
    })
    .unwrap_err();
    assert!(err.to_string().contains("camera offset unavailable"));
    let st = rig.dev.state();
    assert!(st.bodies().iter().all(|b| !b.starts_with("G1")));
    assert_eq!(st.count("task quit"), 1);
}

#[rstest]
fn enter_raw_failure_sends_no_cleanup(mut rig: Rig) {
    rig.dev
        .fail_next("task raw", HwError::OperationError("busy".into()));
    let err = move_to_point(&mut rig.session, point(0.0, 0.0)).unwrap_err();
    assert!(matches!(err, WorkflowError::EnterRaw(_)));
    assert_eq!(rig.dev.state().bodies(), ["task raw"]);
    assert_eq!(rig.session.state(), SessionState::Faulted);
}

#[rstest]
#[case(HwError::UnknownCommand("M172".into()))]
#[case(HwError::ModeError("M172".into()))]
fn end_line_check_tolerates_old_firmware(mut rig: Rig, #[case] err: HwError) {
    rig.dev.fail_next("M172", err);
    move_to_point(&mut rig.session, point(3.0, 4.0)).unwrap();
    assert_eq!(rig.dev.state().count("task quit"), 1);
    assert_eq!(rig.session.state(), SessionState::Normal);
}

#[rstest]
fn end_line_check_without_line_check_sends_nothing(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.session.end_line_check().unwrap();
    assert_eq!(rig.dev.state().count("M172"), 0);
}

#[rstest]
fn cleanup_failure_surfaces_when_move_succeeded(mut rig: Rig) {
    rig.dev
        .fail_next("M137P34", HwError::OperationError("motor driver".into()));
    let err = move_to_point(&mut rig.session, point(1.0, 1.0)).unwrap_err();
    assert_eq!(err.device_error().kind, DeviceErrorKind::OperationError);
    // exit is still attempted after the failed release step
    assert_eq!(rig.dev.state().count("task quit"), 1);
    assert_eq!(rig.dev.state().mode, ControlMode::Normal);
}

#[rstest]
fn exit_timeout_reconnects_once_and_retries(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.dev.fail_next("task quit", HwError::Timeout);

    rig.session.exit_raw().unwrap();

    let st = rig.dev.state();
    assert_eq!(st.connects, 1);
    assert_eq!(st.count("task quit"), 2);
    assert_eq!(st.mode, ControlMode::Normal);
    assert_eq!(rig.session.state(), SessionState::Normal);
}

#[rstest]
fn exit_timeout_twice_faults_session(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.dev.fail_next("task quit", HwError::Timeout);
    rig.dev.fail_next("task quit", HwError::Timeout);

    let err = rig.session.exit_raw().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(rig.dev.state().connects, 1);
    assert_eq!(rig.dev.state().count("task quit"), 2);
    assert_eq!(rig.session.state(), SessionState::Faulted);
}

#[rstest]
fn exit_outside_raw_sends_nothing(mut rig: Rig) {
    rig.session.exit_raw().unwrap();
    assert_eq!(rig.dev.state().count("task quit"), 0);
    assert_eq!(rig.session.state(), SessionState::Normal);
}

#[rstest]
fn exit_tolerates_device_already_out_of_raw(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.dev.state_mut().mode = ControlMode::Normal;
    rig.session.exit_raw().unwrap();
    assert_eq!(rig.dev.state().count("task quit"), 1);
    assert_eq!(rig.session.state(), SessionState::Normal);
}

#[rstest]
fn line_check_resyncs_on_erl(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.session.start_line_check().unwrap();
    assert_eq!(rig.session.line_number(), 1);
    rig.dev.state_mut().next_line = 5;

    rig.session.move_to(&MoveCommand::xy(7.0, 8.0)).unwrap();

    assert_eq!(rig.session.line_number(), 6);
    let st = rig.dev.state();
    let frames: Vec<&String> = st.sent.iter().filter(|c| c.starts_with('N')).collect();
    assert_eq!(frames.len(), 2);
    assert!(frames[0].starts_with("N1G1"));
    assert!(frames[1].starts_with("N5G1"));
    assert_eq!(st.position[..2], [7.0, 8.0]);
}

#[rstest]
fn line_numbers_advance_per_command(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.session.start_line_check().unwrap();
    rig.session.set_fan(false).unwrap();
    rig.session.set_air_pump(false).unwrap();
    assert_eq!(rig.session.line_number(), 3);
    assert_eq!(rig.dev.state().next_line, 3);
}

#[rstest]
fn home_resends_after_reset() {
    let mut rig = rig_with(RawSessionCfg {
        settle_ms: 0,
        ..RawSessionCfg::default()
    });
    rig.dev.state_mut().home_resets = 2;
    rig.session.enter_raw().unwrap();
    rig.session.home().unwrap();
    assert_eq!(rig.dev.state().count("raw home"), 3);
    assert!(rig.dev.state().homed);
    assert_eq!(rig.clock.elapsed(), Duration::from_millis(400));
}

#[rstest]
fn home_gives_up_after_max_retries(mut rig: Rig) {
    rig.dev.state_mut().home_resets = 100;
    rig.session.enter_raw().unwrap();
    assert!(rig.session.home().is_err());
    assert_eq!(rig.dev.state().count("raw home"), 6);
}

#[rstest]
fn raw_commands_require_raw_mode(mut rig: Rig) {
    let err = rig.session.move_to(&MoveCommand::xy(1.0, 1.0)).unwrap_err();
    assert_eq!(err.kind, DeviceErrorKind::ControlSocketModeError);
    let err = rig.session.start_line_check().unwrap_err();
    assert_eq!(err.kind, DeviceErrorKind::ControlSocketModeError);
    assert!(rig.dev.state().sent.is_empty());
}

#[rstest]
fn enter_raw_is_idempotent(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.session.enter_raw().unwrap();
    assert_eq!(rig.dev.state().count("task raw"), 1);
    assert_eq!(rig.session.state(), SessionState::Raw);
}

#[rstest]
fn reconnect_restores_raw_and_line_check(mut rig: Rig) {
    rig.session.enter_raw().unwrap();
    rig.session.start_line_check().unwrap();
    rig.session.move_to(&MoveCommand::xy(1.0, 1.0)).unwrap();

    rig.session.reconnect().unwrap();

    assert_eq!(rig.session.state(), SessionState::RawLineCheck);
    assert_eq!(rig.session.line_number(), 2);
    assert_eq!(rig.dev.state().mode, ControlMode::Raw);
    assert_eq!(rig.dev.state().count("task raw"), 2);
    rig.session.move_to(&MoveCommand::xy(2.0, 2.0)).unwrap();
    assert_eq!(rig.session.line_number(), 3);
}

#[rstest]
fn reconnect_from_normal_stays_normal(mut rig: Rig) {
    rig.session.reconnect().unwrap();
    assert_eq!(rig.session.state(), SessionState::Normal);
    assert_eq!(rig.dev.state().count("task raw"), 0);
}

#[rstest]
fn preview_prepare_and_release(mut rig: Rig) {
    prepare_preview(&mut rig.session).unwrap();
    {
        let st = rig.dev.state();
        assert!(!st.fan && !st.air_pump && !st.water_pump);
        assert!(st.homed);
    }
    assert_eq!(rig.session.state(), SessionState::RawLineCheck);

    let report = release_preview(&mut rig.session);
    assert!(report.is_clean());
    assert_eq!(report.attempted, ["end_line_check", "loose_motor", "exit_raw"]);
    assert_eq!(rig.dev.state().mode, ControlMode::Normal);
}

#[rstest]
fn preview_setup_failure_releases(mut rig: Rig) {
    rig.dev
        .fail_next("M136P4", HwError::OperationError("air pump".into()));
    let err = prepare_preview(&mut rig.session).unwrap_err();
    assert_eq!(err.kind, DeviceErrorKind::OperationError);
    let st = rig.dev.state();
    assert_eq!(st.count("task quit"), 1);
    assert_eq!(st.mode, ControlMode::Normal);
}

#[rstest]
fn auto_focus_waits_for_the_probe_timeout() {
    let mut rig = rig_with(RawSessionCfg {
        command_ms: 1_000,
        ..RawSessionCfg::default()
    });
    rig.dev.set_reply_delay("M137P179Q1", Duration::from_secs(5));
    rig.session.enter_raw().unwrap();
    rig.session.home().unwrap();
    rig.session.start_line_check().unwrap();

    let err = rig.session.auto_focus(Duration::from_secs(1)).unwrap_err();
    assert_eq!(err.kind, DeviceErrorKind::Timeout);

    rig.session.auto_focus(Duration::from_secs(20)).unwrap();
    assert_eq!(rig.dev.state().count("M137P179Q1"), 2);
}
