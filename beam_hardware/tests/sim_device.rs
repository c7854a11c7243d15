use std::time::Duration;

use beam_hardware::{HwError, SimulatedDevice, SimulatedProbe};
use beam_traits::{ControlMode, HeightProbe, Transport};
use rstest::rstest;

const T: Duration = Duration::from_millis(100);

fn raw_device() -> SimulatedDevice {
    let mut dev = SimulatedDevice::new();
    dev.send_raw("task raw", T).unwrap();
    dev
}

#[rstest]
#[case("B5", true)]
#[case("B6", false)]
#[case("M136P5", true)]
#[case("M136P6", false)]
fn fan_codes_for_both_firmware_profiles(#[case] cmd: &str, #[case] on: bool) {
    let mut dev = raw_device();
    dev.state_mut().fan = !on;
    dev.send_raw(cmd, T).unwrap();
    assert_eq!(dev.state().fan, on);
}

#[test]
fn home_answers_reset_then_ok() {
    let mut dev = raw_device();
    dev.state_mut().home_resets = 1;
    assert_eq!(dev.send_raw("raw home", T).unwrap(), "ER:RESET");
    assert_eq!(dev.send_raw("raw home", T).unwrap(), "ok");
    assert!(dev.state().homed);
}

#[test]
fn move_updates_only_given_axes() {
    let mut dev = raw_device();
    dev.send_raw("G1F6000X10Y20", T).unwrap();
    dev.send_raw("G1F6000A5", T).unwrap();
    assert_eq!(dev.state().position, [10.0, 20.0, 0.0, 5.0]);
}

#[test]
fn injected_fault_fires_once() {
    let mut dev = raw_device();
    dev.fail_next("task quit", HwError::Timeout);
    let err = dev.send_raw("task quit", T).unwrap_err();
    assert!(err.to_string().contains("timeout"));
    assert_eq!(dev.send_raw("task quit", T).unwrap(), "ok");
    assert_eq!(dev.control_mode(), ControlMode::Normal);
}

#[test]
fn settings_unavailable_in_raw_mode() {
    let mut dev = raw_device();
    dev.set_setting("camera_offset", "X:1 Y:2 R:0 S:1");
    assert!(dev.get_setting("camera_offset", T).is_err());
    dev.send_raw("task quit", T).unwrap();
    assert_eq!(dev.get_setting("camera_offset", T).unwrap(), "X:1 Y:2 R:0 S:1");
}

#[test]
fn probe_position_reports_focus_height() {
    let mut dev = SimulatedDevice::with_surface(|x, y| Some(x / 10.0 + y / 100.0));
    dev.send_raw("task raw", T).unwrap();
    dev.send_raw("G1F6000X20Y100", T).unwrap();
    dev.send_raw("B206", T).unwrap();
    let reply = dev.send_raw("M136P254", T).unwrap();
    assert!(reply.starts_with("[PRB:20.000,100.000,3.000,0.000:1]"), "{reply}");
}

#[test]
fn simulated_probe_requires_prepare_and_can_fail() {
    let mut probe = SimulatedProbe::flat(4.0).failing_after(1);
    assert!(probe.probe(0.0, 0.0, T).is_err());
    probe.prepare().unwrap();
    assert_eq!(probe.probe(0.0, 0.0, T).unwrap().z, Some(4.0));
    assert!(probe.probe(1.0, 0.0, T).is_err());
    assert_eq!(probe.probe_count().get(), 1);
}

#[test]
fn slow_probe_respects_caller_timeout() {
    let mut probe = SimulatedProbe::flat(1.0).with_latency(Duration::from_millis(500));
    probe.prepare().unwrap();
    assert!(probe.probe(0.0, 0.0, T).is_err());
    assert_eq!(probe.probe(0.0, 0.0, Duration::from_secs(1)).unwrap().z, Some(1.0));
}
