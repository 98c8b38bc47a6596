//! Force stage driver
//!
//! Protocol Overview:
//! - Format: ASCII frames `#<CMD>[ <arg0>[,<arg1>...]];`
//! - Responses: one `\r\n`-terminated line per command (CR streams several)
//! - Faults: any line starting with `[ERROR]`
//! - Numeric payloads follow the first `": "` of the line
//!
//! # Exchange model
//!
//! The link is strictly half-duplex: responses are matched to requests by arrival
//! order only. Every exchange therefore claims the port with `try_lock`; a second
//! command issued while one is in flight (including a CR streaming session) fails with
//! [`DriverError::Busy`] instead of queuing behind it.
//!
//! An exchange marks the port as stale before writing and clears the mark only after
//! its response has been fully consumed. A timeout, a transport error or a cancelled
//! future leaves the mark set, and the next exchange resets the input buffer before
//! sending.
//!
//! # Example Usage
//!
//! ```rust,ignore
//! use force_stage::{config::DriverConfig, driver::ForceStage};
//!
//! # async fn demo() -> force_stage::error::DriverResult<()> {
//! let config = DriverConfig::load()?;
//! let stage = ForceStage::open(&config).await?;
//!
//! stage.home().await?;
//! stage.set_position(20).await?;
//! let force = stage.read_force().await?;
//! println!("{:.3} at {} ns", force.force, force.timestamp_nanos);
//! # Ok(())
//! # }
//! ```

use crate::calibration::{self, Calibration, CalibrationState};
use crate::config::DriverConfig;
use crate::error::{DriverError, DriverErrorKind, DriverResult};
use crate::motion::{ForceLimit, MotionLimits};
use crate::protocol::{
    decode_line, parse_labeled, parse_labeled_pair, CommandSpec, FrameConfig, ProtocolRevision,
    ResponseOutcome, ResponseShape, BODY_PAIR_SEPARATOR, HEADER_PAIR_SEPARATOR, MOVE_COMMAND,
    STOP_CONFIRMATION,
};
use crate::reading::Reading;
use crate::serial::{read_line_timeout, reset_input, write_all_flush, BufferedPort, SharedPort};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::instrument;

/// Exclusive hold on the port for the duration of one exchange or session.
pub(crate) type PortGuard = OwnedMutexGuard<BufferedPort>;

/// Decoded payload of a successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Acknowledgement only.
    None,
    /// Labeled integer (positions, velocities).
    Int(i64),
    /// Labeled float (raw force).
    Float(f64),
    /// Free text (identification, mode).
    Text(String),
    /// Device time (ms) and raw force.
    Pair(i64, f64),
}

impl Payload {
    fn mismatch(self, command: &str, wanted: &str) -> DriverError {
        DriverError::decode(command, &format!("{:?}", self), format!("expected {}", wanted))
    }

    fn into_unit(self, command: &str) -> DriverResult<()> {
        match self {
            Payload::None => Ok(()),
            other => Err(other.mismatch(command, "acknowledgement")),
        }
    }

    fn into_int(self, command: &str) -> DriverResult<i64> {
        match self {
            Payload::Int(v) => Ok(v),
            other => Err(other.mismatch(command, "integer")),
        }
    }

    fn into_float(self, command: &str) -> DriverResult<f64> {
        match self {
            Payload::Float(v) => Ok(v),
            other => Err(other.mismatch(command, "float")),
        }
    }

    fn into_text(self, command: &str) -> DriverResult<String> {
        match self {
            Payload::Text(v) => Ok(v),
            other => Err(other.mismatch(command, "text")),
        }
    }

    fn into_pair(self, command: &str) -> DriverResult<(i64, f64)> {
        match self {
            Payload::Pair(t, f) => Ok((t, f)),
            other => Err(other.mismatch(command, "time/force pair")),
        }
    }
}

/// Decode a classified response line according to the command's response shape.
///
/// `ST` is the only command for which a fault line (the exact stop confirmation) is
/// success; for every other command a fault is a [`DriverError::DeviceFault`].
pub fn decode_payload(spec: &CommandSpec, outcome: ResponseOutcome) -> DriverResult<Payload> {
    let command = spec.mnemonic;
    match (spec.response, outcome) {
        (ResponseShape::StopConfirmation, ResponseOutcome::Fault(line)) => {
            if line == STOP_CONFIRMATION {
                Ok(Payload::None)
            } else {
                Err(DriverError::DeviceFault(line))
            }
        }
        (ResponseShape::StopConfirmation, ResponseOutcome::Success(line)) => Err(
            DriverError::decode(command, &line, "expected the stop confirmation"),
        ),
        (_, ResponseOutcome::Fault(line)) => Err(DriverError::DeviceFault(line)),
        (ResponseShape::Ack, ResponseOutcome::Success(_)) => Ok(Payload::None),
        (ResponseShape::LabeledInt, ResponseOutcome::Success(line)) => {
            parse_labeled::<i64>(command, &line).map(Payload::Int)
        }
        (ResponseShape::LabeledFloat, ResponseOutcome::Success(line)) => {
            parse_labeled::<f64>(command, &line).map(Payload::Float)
        }
        (ResponseShape::Text, ResponseOutcome::Success(line)) => Ok(Payload::Text(line)),
        (ResponseShape::Word, ResponseOutcome::Success(line)) => line
            .split_whitespace()
            .last()
            .map(|word| Payload::Text(word.to_string()))
            .ok_or_else(|| DriverError::decode(command, &line, "no word in response")),
        (ResponseShape::LabeledPair, ResponseOutcome::Success(line)) => {
            parse_labeled_pair(command, &line, HEADER_PAIR_SEPARATOR)
                .map(|(t, f)| Payload::Pair(t, f))
        }
        (ResponseShape::Stream, ResponseOutcome::Success(line)) => Err(DriverError::decode(
            command,
            &line,
            "streaming responses are decoded by a streaming session",
        )),
    }
}

/// Convert a duration to whole nanoseconds, saturating.
pub(crate) fn nanos(d: Duration) -> i64 {
    i64::try_from(d.as_nanos()).unwrap_or(i64::MAX)
}

/// Driver for one force stage on one serial link.
///
/// Cloning is cheap and every clone shares the port, the calibration and the stale
/// marker, so a clone can be moved into a worker task.
#[derive(Clone)]
pub struct ForceStage {
    port: SharedPort,
    frame: FrameConfig,
    revision: ProtocolRevision,
    calibration: Calibration,
    limits: MotionLimits,
    force_limit: ForceLimit,
    read_timeout: Duration,
    drain_window: Duration,
    stale: Arc<AtomicBool>,
    epoch: Instant,
}

impl std::fmt::Debug for ForceStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ForceStage")
            .field("revision", &self.revision)
            .field("frame", &self.frame)
            .field("limits", &self.limits)
            .field("calibration", &self.calibration.snapshot())
            .field("read_timeout", &self.read_timeout)
            .finish_non_exhaustive()
    }
}

impl ForceStage {
    /// Create a driver on an already-open port.
    ///
    /// # Errors
    /// [`DriverError::Configuration`] if `config` does not validate.
    pub fn new(port: SharedPort, config: &DriverConfig) -> DriverResult<Self> {
        config.validate()?;
        Ok(Self {
            port,
            frame: config.frame_config(),
            revision: config.revision,
            calibration: Calibration::new(config.calibration()?),
            limits: config.limits()?,
            force_limit: config.force_limit(),
            read_timeout: config.read_timeout(),
            drain_window: config.drain_window(),
            // Whatever the device printed before we connected is unread.
            stale: Arc::new(AtomicBool::new(true)),
            epoch: Instant::now(),
        })
    }

    /// Open `config.port` at `config.baud_rate` (8N1, no flow control).
    #[cfg(feature = "instrument_serial")]
    pub async fn open(config: &DriverConfig) -> DriverResult<Self> {
        let port = crate::serial::open_serial_async(&config.port, config.baud_rate)
            .await
            .map_err(|e| {
                DriverError::Io(std::io::Error::new(std::io::ErrorKind::Other, format!("{:#}", e)))
            })?;
        tracing::info!(port = %config.port, baud = config.baud_rate, "Opened force stage");
        Self::new(crate::serial::wrap_shared(Box::new(port)), config)
    }

    /// Active command table.
    pub fn revision(&self) -> ProtocolRevision {
        self.revision
    }

    /// Frame delimiters in use.
    pub fn frame_config(&self) -> FrameConfig {
        self.frame
    }

    /// Shared calibration handle.
    pub fn calibration(&self) -> &Calibration {
        &self.calibration
    }

    /// Travel limits enforced before every move.
    pub fn limits(&self) -> MotionLimits {
        self.limits
    }

    /// Per-line read timeout.
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Replace the calibration (manual calibration).
    pub fn set_calibration(&self, state: CalibrationState) -> DriverResult<()> {
        self.calibration.set(state)
    }

    // ---- exchange plumbing -------------------------------------------------------

    pub(crate) fn lookup(&self, mnemonic: &str) -> DriverResult<&'static CommandSpec> {
        self.revision.lookup(mnemonic)
    }

    /// Validate arguments, apply the motion guard and render the frame.
    pub(crate) fn render(&self, spec: &CommandSpec, args: Vec<String>) -> DriverResult<String> {
        let frame = spec.frame(args)?;
        if spec.mnemonic == MOVE_COMMAND {
            if let Some(position) = frame.arguments().first().and_then(|a| a.parse().ok()) {
                self.limits.validate(position)?;
            }
        }
        frame.render(&self.frame)
    }

    /// Take the port or fail with `Busy`.
    pub(crate) fn claim(&self) -> DriverResult<PortGuard> {
        self.port
            .clone()
            .try_lock_owned()
            .map_err(|_| DriverError::Busy)
    }

    /// Reset the input if needed, then write one frame.
    pub(crate) async fn transmit(
        &self,
        port: &mut BufferedPort,
        spec: &CommandSpec,
        frame: &str,
    ) -> DriverResult<()> {
        if spec.drain_before || self.stale.load(Ordering::Acquire) {
            reset_input(port, self.drain_window).await;
        }
        self.stale.store(true, Ordering::Release);
        tracing::trace!(frame, "->");
        write_all_flush(port, frame.as_bytes()).await
    }

    /// Read and classify one response line.
    pub(crate) async fn receive(
        &self,
        port: &mut BufferedPort,
        command: &str,
    ) -> DriverResult<ResponseOutcome> {
        let raw = read_line_timeout(port, self.read_timeout).await?;
        tracing::trace!(command, line = raw.trim_end(), "<-");
        decode_line(command, &raw)
    }

    /// Mark the input buffer clean after a fully consumed exchange.
    pub(crate) fn settle(&self) {
        self.stale.store(false, Ordering::Release);
    }

    /// True if the next exchange will reset the input buffer first.
    pub fn needs_reset(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Calibrate a raw count into a reading and run the overload check.
    pub(crate) fn calibrated(&self, timestamp_nanos: i64, raw: f64) -> Reading {
        let force = self.calibration.convert(raw);
        self.force_limit.check(force);
        Reading::new(timestamp_nanos, force)
    }

    /// Nanoseconds since this driver was created, on the host clock.
    pub(crate) fn host_nanos(&self) -> i64 {
        nanos(self.epoch.elapsed())
    }

    /// Execute one single-line command by mnemonic.
    ///
    /// This is the generic entry point every typed method below goes through. `CR`
    /// is rejected here; use [`ForceStage::stream`].
    pub async fn execute(&self, mnemonic: &str, args: Vec<String>) -> DriverResult<Payload> {
        let spec = self.lookup(mnemonic)?;
        if spec.response == ResponseShape::Stream {
            return Err(DriverError::InvalidArgument(format!(
                "{} opens a streaming session; use stream()",
                mnemonic
            )));
        }
        let frame = self.render(spec, args)?;
        let mut port = self.claim()?;
        self.transmit(&mut port, spec, &frame).await?;
        let outcome = self.receive(&mut port, spec.mnemonic).await?;
        self.settle();
        decode_payload(spec, outcome)
    }

    // ---- motion ------------------------------------------------------------------

    /// Move to `position` mm. Rejected locally if outside the travel limits.
    #[instrument(skip(self), err)]
    pub async fn set_position(&self, position: i64) -> DriverResult<()> {
        self.limits.validate(position)?;
        self.execute("SP", vec![position.to_string()])
            .await?
            .into_unit("SP")
    }

    /// Current position, or the target while moving (mm).
    #[instrument(skip(self), err)]
    pub async fn get_position(&self) -> DriverResult<i64> {
        self.execute("GP", Vec::new()).await?.into_int("GP")
    }

    /// Set travel velocity (mm/s).
    #[instrument(skip(self), err)]
    pub async fn set_velocity(&self, velocity: i64) -> DriverResult<()> {
        self.execute("SV", vec![velocity.to_string()])
            .await?
            .into_unit("SV")
    }

    /// Travel velocity (mm/s).
    #[instrument(skip(self), err)]
    pub async fn get_velocity(&self) -> DriverResult<i64> {
        self.execute("GV", Vec::new()).await?.into_int("GV")
    }

    /// Start the homing sequence.
    ///
    /// Resolves when the device acknowledges, not when the stage reaches home.
    #[instrument(skip(self), err)]
    pub async fn home(&self) -> DriverResult<()> {
        self.execute("HM", Vec::new()).await?.into_unit("HM")
    }

    /// Emergency stop. The stage stays locked until [`ForceStage::home`].
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> DriverResult<()> {
        self.execute("ST", Vec::new()).await?.into_unit("ST")?;
        tracing::warn!("Stage stopped; home required before the next move");
        Ok(())
    }

    // ---- load cell ---------------------------------------------------------------

    /// Tare the device display. Local calibration is unaffected.
    #[instrument(skip(self), err)]
    pub async fn tare(&self) -> DriverResult<()> {
        self.execute("TR", Vec::new()).await?.into_unit("TR")
    }

    /// Set the device display scale. Raw `SR` counts are unaffected.
    #[instrument(skip(self), err)]
    pub async fn set_calibration_force(&self, force: f64) -> DriverResult<()> {
        self.execute("SF", vec![force.to_string()])
            .await?
            .into_unit("SF")
    }

    /// One raw sample, uncalibrated.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn single_read(&self) -> DriverResult<f64> {
        self.execute("SR", Vec::new()).await?.into_float("SR")
    }

    /// One calibrated sample, timestamped on the host clock.
    pub async fn read_force(&self) -> DriverResult<Reading> {
        let raw = self.single_read().await?;
        Ok(self.calibrated(self.host_nanos(), raw))
    }

    /// Mean calibrated force over `samples` reads after discarding `skips`.
    #[instrument(skip(self), err)]
    pub async fn read_force_averaged(&self, skips: usize, samples: usize) -> DriverResult<f64> {
        let raw = self.collect_raw(skips, samples).await?;
        let force = self.calibration.convert(calibration::mean(&raw)?);
        self.force_limit.check(force);
        Ok(force)
    }

    /// Check that the device answers `SR` with a decodable value.
    ///
    /// A reading of exactly zero is a successful probe.
    #[instrument(skip(self), err)]
    pub async fn probe(&self) -> DriverResult<f64> {
        let raw = self.single_read().await?;
        tracing::info!(raw, "Force stage responded");
        Ok(raw)
    }

    /// Toggle the device's display-only flag.
    #[instrument(skip(self), err)]
    pub async fn set_display(&self, enabled: bool) -> DriverResult<()> {
        self.execute("DC", vec![u8::from(enabled).to_string()])
            .await?
            .into_unit("DC")
    }

    /// Firmware version line.
    #[instrument(skip(self), err)]
    pub async fn version(&self) -> DriverResult<String> {
        self.execute("VR", Vec::new()).await?.into_text("VR")
    }

    /// Device identification line.
    #[instrument(skip(self), err)]
    pub async fn id(&self) -> DriverResult<String> {
        self.execute("ID", Vec::new()).await?.into_text("ID")
    }

    // ---- calibration procedures --------------------------------------------------

    async fn collect_raw(&self, skips: usize, samples: usize) -> DriverResult<Vec<f64>> {
        if samples == 0 {
            return Err(DriverError::Calibration(
                "at least one sample is required".into(),
            ));
        }
        for _ in 0..skips {
            match self.single_read().await {
                Ok(_) => {}
                // Settling reads may still decode leftovers from an earlier exchange.
                Err(e) if e.kind() == DriverErrorKind::Decode => {
                    tracing::debug!(error = %e, "Ignoring undecodable settling read");
                }
                Err(e) => return Err(e),
            }
        }
        let mut raw = Vec::with_capacity(samples);
        for _ in 0..samples {
            raw.push(self.single_read().await?);
        }
        Ok(raw)
    }

    /// Re-zero: average `samples` raw reads after `skips` settling reads and store the
    /// result as the gauge value.
    ///
    /// The sensor must be unloaded. A load during re-gauge biases every later reading
    /// and is not detected.
    #[instrument(skip(self), err)]
    pub async fn re_gauge(&self, samples: usize, skips: usize) -> DriverResult<f64> {
        let raw = self.collect_raw(skips, samples).await?;
        let gauge_value = calibration::mean(&raw)?;
        self.calibration.set_gauge_value(gauge_value)?;
        Ok(gauge_value)
    }

    /// Derive the scale factor from `known_force` applied to the sensor.
    ///
    /// `units_per_count = known_force / (mean_raw - gauge_value)`, so that converting
    /// the averaged count afterwards yields `known_force`. With a zero gauge value this
    /// is `known_force / mean_raw`. Fails with [`DriverError::Calibration`] if the
    /// denominator is zero.
    #[instrument(skip(self), err)]
    pub async fn calibrate_scale(&self, known_force: f64, samples: usize) -> DriverResult<f64> {
        let raw = self.collect_raw(0, samples).await?;
        let gauge_value = self.calibration.snapshot().gauge_value;
        let units_per_count = calibration::scale_for_known_force(known_force, &raw, gauge_value)?;
        self.calibration.set_units_per_count(units_per_count)?;
        Ok(units_per_count)
    }

    // ---- legacy firmware ---------------------------------------------------------

    /// Current acquisition mode word.
    #[instrument(skip(self), err)]
    pub async fn get_mode(&self) -> DriverResult<String> {
        self.execute("GM", Vec::new()).await?.into_text("GM")
    }

    /// Switch between single and continuous acquisition.
    #[instrument(skip(self), err)]
    pub async fn toggle_mode(&self) -> DriverResult<()> {
        self.execute("TM", Vec::new()).await?.into_unit("TM")
    }

    /// Run the device's loading calibration.
    #[instrument(skip(self), err)]
    pub async fn calibrate_loading(&self) -> DriverResult<()> {
        self.execute("CL", Vec::new()).await?.into_unit("CL")
    }

    /// Persist the device configuration to flash.
    #[instrument(skip(self), err)]
    pub async fn save_config(&self) -> DriverResult<()> {
        self.execute("SC", Vec::new()).await?.into_unit("SC")
    }

    /// Debug continuous toggle; answers with one device-timestamped sample.
    #[instrument(skip(self), err)]
    pub async fn continuous_toggle(&self, interval_ms: i64) -> DriverResult<Reading> {
        let (time_ms, raw) = self
            .execute("CC", vec![interval_ms.to_string()])
            .await?
            .into_pair("CC")?;
        Ok(self.calibrated(time_ms.saturating_mul(1_000_000), raw))
    }

    /// Read one free-running `id,force` line without sending a command.
    ///
    /// The device clock is not part of this format, so the reading is timestamped on
    /// the host.
    #[instrument(level = "debug", skip(self), err)]
    pub async fn read_legacy_line(&self) -> DriverResult<Reading> {
        let mut port = self.claim()?;
        let line = self.receive(&mut port, "line").await?.into_payload()?;
        self.settle();

        let body = line
            .split_once(": ")
            .map(|(_, value)| value)
            .unwrap_or(&line);
        let (id, raw) = body
            .split_once(BODY_PAIR_SEPARATOR)
            .ok_or_else(|| DriverError::decode("line", &line, "expected '<id>,<force>'"))?;
        let id = id
            .trim()
            .parse::<u32>()
            .map_err(|e| DriverError::decode("line", &line, format!("id field: {}", e)))?;
        let raw = raw
            .trim()
            .parse::<f64>()
            .map_err(|e| DriverError::decode("line", &line, format!("force field: {}", e)))?;
        Ok(self.calibrated(self.host_nanos(), raw).with_id(id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock_serial;
    use crate::serial::wrap_shared;

    fn stage_with(config: DriverConfig) -> (ForceStage, mock_serial::MockDeviceHarness) {
        let (port, device) = mock_serial::new();
        let stage = ForceStage::new(wrap_shared(Box::new(port)), &config).unwrap();
        (stage, device)
    }

    fn test_config() -> DriverConfig {
        DriverConfig {
            timeout_ms: 200,
            drain_window_ms: 5,
            ..Default::default()
        }
    }

    #[test]
    fn stop_confirmation_is_the_only_fault_that_succeeds() {
        let st = ProtocolRevision::Current.lookup("ST").unwrap();
        let sp = ProtocolRevision::Current.lookup("SP").unwrap();
        let confirm = ResponseOutcome::Fault(STOP_CONFIRMATION.to_string());

        assert_eq!(decode_payload(st, confirm.clone()).unwrap(), Payload::None);
        assert!(matches!(
            decode_payload(sp, confirm),
            Err(DriverError::DeviceFault(_))
        ));
        assert!(matches!(
            decode_payload(st, ResponseOutcome::Fault("[ERROR]: stage fault".into())),
            Err(DriverError::DeviceFault(ref line)) if line == "[ERROR]: stage fault"
        ));
        assert_eq!(
            decode_payload(st, ResponseOutcome::Success("ok".into()))
                .unwrap_err()
                .kind(),
            DriverErrorKind::Decode
        );
    }

    #[test]
    fn fault_decodes_as_fault_for_every_other_command() {
        for rev in [ProtocolRevision::Current, ProtocolRevision::Legacy] {
            for spec in rev.commands().iter().filter(|s| s.mnemonic != "ST") {
                let err = decode_payload(spec, ResponseOutcome::Fault("[ERROR]: stage fault".into()))
                    .unwrap_err();
                assert!(
                    matches!(err, DriverError::DeviceFault(ref l) if l == "[ERROR]: stage fault"),
                    "{} in {}",
                    spec.mnemonic,
                    rev
                );
            }
        }
    }

    #[test]
    fn malformed_numbers_are_decode_errors_not_zero() {
        let gp = ProtocolRevision::Current.lookup("GP").unwrap();
        let sr = ProtocolRevision::Current.lookup("SR").unwrap();
        for line in ["Position: ", "Position:12", "Position: 1.5", "garbage"] {
            let err = decode_payload(gp, ResponseOutcome::Success(line.into())).unwrap_err();
            assert_eq!(err.kind(), DriverErrorKind::Decode, "{line}");
        }
        assert_eq!(
            decode_payload(sr, ResponseOutcome::Success("Force: 0".into())).unwrap(),
            Payload::Float(0.0)
        );
    }

    #[test]
    fn word_and_pair_shapes() {
        let gm = ProtocolRevision::Legacy.lookup("GM").unwrap();
        let cc = ProtocolRevision::Legacy.lookup("CC").unwrap();
        assert_eq!(
            decode_payload(gm, ResponseOutcome::Success("Mode: continuous".into())).unwrap(),
            Payload::Text("continuous".into())
        );
        assert_eq!(
            decode_payload(cc, ResponseOutcome::Success("Sample: 40;512.5".into())).unwrap(),
            Payload::Pair(40, 512.5)
        );
    }

    #[tokio::test]
    async fn out_of_range_move_never_reaches_the_device() {
        let (stage, mut device) = stage_with(test_config());
        for position in [0, 47, -3] {
            let err = stage.set_position(position).await.unwrap_err();
            assert_eq!(err.kind(), DriverErrorKind::OutOfRange);
        }
        // The generic path is guarded too.
        assert!(stage.execute("SP", vec!["99".into()]).await.is_err());
        assert!(device.is_silent(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn labeled_integer_round_trip() {
        let (stage, mut device) = stage_with(test_config());
        let task = tokio::spawn(async move { stage.get_position().await });
        device.expect_and_respond("#GP;", "Position: 12").await;
        assert_eq!(task.await.unwrap().unwrap(), 12);
    }

    #[tokio::test]
    async fn device_fault_is_passed_through_verbatim() {
        let (stage, mut device) = stage_with(test_config());
        let task = tokio::spawn(async move { stage.set_position(20).await });
        device
            .expect_and_respond("#SP 20;", "[ERROR]: stage fault")
            .await;
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.to_string(), "Device fault: [ERROR]: stage fault");
    }

    #[tokio::test]
    async fn legacy_revision_rejects_current_only_commands_locally() {
        let config = DriverConfig {
            revision: ProtocolRevision::Legacy,
            ..test_config()
        };
        let (stage, mut device) = stage_with(config);
        let err = stage.stop().await.unwrap_err();
        assert_eq!(err.kind(), DriverErrorKind::Unsupported);
        assert!(device.is_silent(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn timeout_marks_port_for_reset() {
        let (stage, mut device) = stage_with(test_config());
        let probe = stage.clone();
        let task = tokio::spawn(async move { probe.get_velocity().await });
        device.expect_frame("#GV;").await;
        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_timeout());
        assert!(stage.needs_reset());

        // A late answer to the abandoned exchange must not be taken for the next one.
        device.send_line("Velocity: 3").unwrap();
        let next = stage.clone();
        let task = tokio::spawn(async move { next.get_velocity().await });
        device.expect_and_respond("#GV;", "Velocity: 7").await;
        assert_eq!(task.await.unwrap().unwrap(), 7);
        assert!(!stage.needs_reset());
    }

    #[tokio::test]
    async fn legacy_free_running_line_carries_id() {
        let config = DriverConfig {
            revision: ProtocolRevision::Legacy,
            gauge_value: 100.0,
            units_per_count: 0.5,
            ..test_config()
        };
        let (stage, device) = stage_with(config);
        device.send_line("17,110").unwrap();
        let reading = stage.read_legacy_line().await.unwrap();
        assert_eq!(reading.id, Some(17));
        assert_eq!(reading.force, 5.0);
    }
}
