//! End-to-end protocol behaviour against a scripted device and the simulator.

use force_stage::mock_serial::{self, MockDeviceHarness};
use force_stage::protocol::STOP_CONFIRMATION;
use force_stage::serial::wrap_shared;
use force_stage::{
    sim, DriverConfig, DriverError, DriverErrorKind, ForceStage, PartialPolicy, ProtocolRevision,
    SweepPlan,
};
use futures::StreamExt;
use std::time::Duration;

fn fast_config() -> DriverConfig {
    DriverConfig {
        timeout_ms: 300,
        drain_window_ms: 5,
        ..Default::default()
    }
}

fn scripted(config: &DriverConfig) -> (ForceStage, MockDeviceHarness) {
    let (port, device) = mock_serial::new();
    let stage = ForceStage::new(wrap_shared(Box::new(port)), config).unwrap();
    (stage, device)
}

fn simulated(config: &DriverConfig) -> (ForceStage, sim::SimHandle) {
    let (port, handle, _task) = sim::spawn(config);
    (ForceStage::new(port, config).unwrap(), handle)
}

#[tokio::test]
async fn streaming_header_and_body_lines_decode_in_order() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let task = tokio::spawn(async move { stage.stream(3, 100).await });
    device.expect_frame("#CR 3,100;").await;
    device
        .send_lines([": 0;1.5", ": 100,1.6", ": 200,1.7", ": 300,1.8"])
        .unwrap();

    let readings = task.await.unwrap().unwrap();
    let pairs: Vec<(i64, f64)> = readings
        .iter()
        .map(|r| (r.timestamp_millis(), r.force))
        .collect();
    assert_eq!(pairs, [(0, 1.5), (100, 1.6), (200, 1.7), (300, 1.8)]);
    assert_eq!(readings[3].timestamp_nanos, 300_000_000);
}

#[tokio::test]
async fn streaming_timeout_exposes_partial_samples() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let task = tokio::spawn(async move { stage.stream(4, 10).await });
    device.expect_frame("#CR 4,10;").await;
    device.send_lines([": 0;2.0", ": 10,2.5"]).unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    let partial = err.into_partial_readings().unwrap();
    assert_eq!(partial.len(), 2);
    assert_eq!(partial[1].force, 2.5);
}

#[tokio::test]
async fn streaming_fault_discards_or_keeps_per_policy() {
    let config = fast_config();

    let (stage, mut device) = scripted(&config);
    let task = tokio::spawn(async move { stage.stream(3, 5).await });
    device.expect_frame("#CR 3,5;").await;
    device
        .send_lines([": 0;1.0", "[ERROR]: sensor saturated"])
        .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::DeviceFault(ref l) if l == "[ERROR]: sensor saturated"));

    let (stage, mut device) = scripted(&config);
    let task = tokio::spawn(async move { stage.stream_with(3, 5, PartialPolicy::Keep).await });
    device.expect_frame("#CR 3,5;").await;
    device
        .send_lines([": 0;1.0", "[ERROR]: sensor saturated"])
        .unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), DriverErrorKind::DeviceFault);
    assert_eq!(err.partial_readings().unwrap().len(), 1);
}

#[tokio::test]
async fn huge_stream_count_is_bounded_by_what_arrives() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let task = tokio::spawn(async move { stage.stream(u32::MAX, 0).await });
    device.expect_frame("#CR 4294967295,0;").await;
    device.send_lines([": 0;1.5", ": 1,1.1"]).unwrap();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_timeout());
    assert_eq!(err.partial_readings().map(<[_]>::len), Some(2));
}

#[tokio::test]
async fn header_is_not_read_before_one_interval() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let started = tokio::time::Instant::now();
    let task = tokio::spawn(async move { stage.stream(1, 150).await });
    device.expect_frame("#CR 1,150;").await;
    device.send_lines([": 0;1.5", ": 150,1.6"]).unwrap();

    let readings = task.await.unwrap().unwrap();
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert_eq!(readings.len(), 2);
    assert_eq!(readings[1].timestamp_millis(), 150);
}

#[tokio::test]
async fn cancelled_stream_leaves_no_stale_lines_for_the_next_command() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let streamer = stage.clone();
    let session = tokio::spawn(async move { streamer.stream(5, 10).await });
    device.expect_frame("#CR 5,10;").await;
    device.send_lines([": 0;1.0", ": 10,1.0"]).unwrap();
    tokio::time::sleep(Duration::from_millis(40)).await;
    session.abort();
    assert!(session.await.unwrap_err().is_cancelled());
    assert!(stage.needs_reset());

    // The device keeps streaming after the host gave up.
    device.send_lines([": 20,1.0", ": 30,1.0"]).unwrap();

    let next = stage.clone();
    let query = tokio::spawn(async move { next.get_position().await });
    device.expect_and_respond("#GP;", "Position: 12").await;
    assert_eq!(query.await.unwrap().unwrap(), 12);
    assert!(!stage.needs_reset());
}

#[tokio::test]
async fn header_with_body_separator_is_a_decode_error() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);
    let task = tokio::spawn(async move { stage.stream(1, 5).await });
    device.expect_frame("#CR 1,5;").await;
    device.send_lines([": 0,1.5", ": 5,1.6"]).unwrap();
    let err = task.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), DriverErrorKind::Decode);
}

#[tokio::test]
async fn second_command_during_a_stream_is_busy() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let streamer = stage.clone();
    let session = tokio::spawn(async move { streamer.stream(2, 10).await });
    device.expect_frame("#CR 2,10;").await;

    // The session owns the port until its last line is read.
    let err = stage.get_position().await.unwrap_err();
    assert_eq!(err.kind(), DriverErrorKind::Busy);
    assert!(device.is_silent(Duration::from_millis(20)).await);

    device.send_lines([": 0;1.0", ": 10,1.1", ": 20,1.2"]).unwrap();
    assert_eq!(session.await.unwrap().unwrap().len(), 3);

    let task = tokio::spawn(async move { stage.get_position().await });
    device.expect_and_respond("#GP;", "Position: 4").await;
    assert_eq!(task.await.unwrap().unwrap(), 4);
}

#[tokio::test]
async fn concurrent_commands_never_interleave() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let first = stage.clone();
    let pending = tokio::spawn(async move { first.get_velocity().await });
    device.expect_frame("#GV;").await;

    let err = stage.version().await.unwrap_err();
    assert!(matches!(err, DriverError::Busy));

    device.send_line("Velocity: 9").unwrap();
    assert_eq!(pending.await.unwrap().unwrap(), 9);
    assert!(device.is_silent(Duration::from_millis(20)).await);
}

#[tokio::test]
async fn stop_confirmation_is_success_and_other_faults_are_not() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);

    let s = stage.clone();
    let task = tokio::spawn(async move { s.stop().await });
    device.expect_and_respond("#ST;", STOP_CONFIRMATION).await;
    assert!(task.await.unwrap().is_ok());

    let s = stage.clone();
    let task = tokio::spawn(async move { s.stop().await });
    device.expect_and_respond("#ST;", "[ERROR]: stage fault").await;
    assert!(matches!(
        task.await.unwrap(),
        Err(DriverError::DeviceFault(ref l)) if l == "[ERROR]: stage fault"
    ));

    let s = stage.clone();
    let task = tokio::spawn(async move { s.home().await });
    device.expect_and_respond("#HM;", STOP_CONFIRMATION).await;
    assert_eq!(
        task.await.unwrap().unwrap_err().kind(),
        DriverErrorKind::DeviceFault
    );
}

#[tokio::test]
async fn empty_response_is_not_success() {
    let config = fast_config();
    let (stage, mut device) = scripted(&config);
    let task = tokio::spawn(async move { stage.tare().await });
    device.expect_and_respond("#TR;", "").await;
    let err = task.await.unwrap().unwrap_err();
    assert!(matches!(err, DriverError::Decode { ref reason, .. } if reason == "no response"));
}

#[tokio::test]
async fn every_current_command_round_trips_through_the_simulator() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);

    stage.set_velocity(8).await.unwrap();
    assert_eq!(stage.get_velocity().await.unwrap(), 8);
    stage.set_position(23).await.unwrap();
    assert_eq!(stage.get_position().await.unwrap(), 23);
    stage.tare().await.unwrap();
    stage.set_calibration_force(2.5).await.unwrap();
    stage.set_display(false).await.unwrap();
    sim.set_zero_counts(40.0);
    assert_eq!(stage.single_read().await.unwrap(), 40.0);
    assert_eq!(stage.stream(2, 5).await.unwrap().len(), 3);
    assert!(stage.version().await.unwrap().starts_with("Version: "));
    assert_eq!(stage.id().await.unwrap(), "ID: SIM-0001");

    stage.stop().await.unwrap();
    let locked = stage.set_position(10).await.unwrap_err();
    assert_eq!(locked.to_string(), format!("Device fault: {}", STOP_CONFIRMATION));
    stage.home().await.unwrap();
    stage.set_position(10).await.unwrap();

    let state = sim.snapshot();
    assert_eq!(state.position, 10);
    assert_eq!(state.velocity, 8);
    assert_eq!(state.display_force, 2.5);
    assert!(!state.display);
    assert_eq!(
        sim.history(),
        ["SV", "GV", "SP", "GP", "TR", "SF", "DC", "SR", "CR", "VR", "ID", "ST", "SP", "HM", "SP"]
    );
}

#[tokio::test]
async fn legacy_commands_round_trip_through_the_simulator() {
    let config = DriverConfig {
        revision: ProtocolRevision::Legacy,
        ..fast_config()
    };
    let (stage, sim) = simulated(&config);

    assert_eq!(stage.get_mode().await.unwrap(), "single");
    stage.toggle_mode().await.unwrap();
    assert_eq!(stage.get_mode().await.unwrap(), "continuous");
    stage.calibrate_loading().await.unwrap();
    stage.save_config().await.unwrap();
    sim.set_zero_counts(7.0);
    assert_eq!(stage.continuous_toggle(50).await.unwrap().force, 7.0);
    assert_eq!(
        stage.version().await.unwrap_err().kind(),
        DriverErrorKind::Unsupported
    );
}

#[tokio::test]
async fn re_gauge_against_constant_counts_is_exact() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);
    let k = 8_388_607.3;
    sim.set_zero_counts(k);

    let gauge = stage.re_gauge(10, 3).await.unwrap();
    assert_eq!(gauge, k);
    assert_eq!(stage.calibration().snapshot().gauge_value, k);
    let reads = sim.history().iter().filter(|m| *m == "SR").count();
    assert_eq!(reads, 13);
}

#[tokio::test]
async fn calibrate_scale_then_read_known_force() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);
    sim.update(|s| {
        s.zero_counts = 1000.0;
        s.counts_per_unit = 250.0;
    });

    stage.re_gauge(4, 1).await.unwrap();
    sim.set_load(2.0);
    let upc = stage.calibrate_scale(2.0, 5).await.unwrap();
    assert_eq!(upc, 0.004);
    assert_eq!(stage.read_force().await.unwrap().force, 2.0);
    assert_eq!(stage.read_force_averaged(1, 3).await.unwrap(), 2.0);
}

#[tokio::test]
async fn calibrate_scale_with_zero_counts_fails_cleanly() {
    let config = fast_config();
    let (stage, _sim) = simulated(&config);
    let err = stage.calibrate_scale(2.0, 3).await.unwrap_err();
    assert_eq!(err.kind(), DriverErrorKind::Calibration);
    assert_eq!(stage.calibration().snapshot().units_per_count, 1.0);
}

#[tokio::test]
async fn zero_reading_is_a_successful_probe() {
    let config = fast_config();
    let (stage, _sim) = simulated(&config);
    assert_eq!(stage.probe().await.unwrap(), 0.0);
}

#[tokio::test]
async fn acquisition_stream_is_lazy_and_bounded() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);
    sim.set_zero_counts(3.0);

    let readings: Vec<_> = stage
        .acquire(Duration::from_millis(5), Some(4))
        .collect()
        .await;
    assert_eq!(readings.len(), 4);
    let stamps: Vec<i64> = readings
        .iter()
        .map(|r| r.as_ref().unwrap().timestamp_nanos)
        .collect();
    assert!(stamps.windows(2).all(|w| w[0] < w[1]), "{stamps:?}");
    assert_eq!(sim.history().len(), 4);
}

#[tokio::test]
async fn acquisition_ends_after_first_error() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);
    sim.update(|s| s.mute_frames = 1);

    let items: Vec<_> = stage.acquire(Duration::from_millis(1), None).collect().await;
    assert_eq!(items.len(), 1);
    assert!(items[0].as_ref().unwrap_err().is_timeout());
}

#[tokio::test]
async fn sweep_moves_and_samples() {
    let config = fast_config();
    let (stage, sim) = simulated(&config);

    let plan = SweepPlan {
        start: 40,
        end: 39,
        velocity: 20,
    };
    let samples = stage.sweep(plan, Duration::from_millis(10)).await.unwrap();
    assert!(!samples.is_empty());
    let last = samples.last().unwrap();
    assert!(last.elapsed >= plan.travel_time());
    assert_eq!(last.position_estimate, 39.0);
    assert_eq!(sim.snapshot().position, 39);

    let bad = SweepPlan { end: 60, ..plan };
    assert_eq!(
        stage.sweep(bad, Duration::from_millis(10)).await.unwrap_err().kind(),
        DriverErrorKind::OutOfRange
    );
}
