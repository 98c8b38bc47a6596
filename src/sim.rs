//! Simulated force stage.
//!
//! Answers the command dialect from internal state on the device side of a
//! [`MockDeviceHarness`]. Motion is instantaneous; the load cell reports
//! `zero_counts + load * counts_per_unit` raw counts.
//!
//! Used by the integration tests and by the CLI's `--simulate` mode.
//!
//! ```rust,ignore
//! let (port, sim, _task) = sim::spawn(&config);
//! sim.set_load(1.5);
//! let stage = ForceStage::new(port, &config)?;
//! ```

use crate::config::DriverConfig;
use crate::mock_serial::{self, MockDeviceHarness};
use crate::motion::MotionLimits;
use crate::protocol::{
    parse_frame, CommandFrame, FrameConfig, ProtocolRevision, MOVE_COMMAND, STOP_CONFIRMATION,
};
use crate::serial::{wrap_shared, SharedPort};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Observable and adjustable state of the simulated instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct SimState {
    /// Stage position (mm)
    pub position: i64,
    /// Travel velocity (mm/s)
    pub velocity: i64,
    /// Set by `ST`, cleared by `HM`
    pub locked: bool,
    /// Display flag set by `DC`
    pub display: bool,
    /// Display scale set by `SF`
    pub display_force: f64,
    /// Legacy continuous acquisition mode
    pub continuous: bool,
    /// Raw counts at zero load
    pub zero_counts: f64,
    /// Raw counts per unit of applied load
    pub counts_per_unit: f64,
    /// Applied load
    pub load: f64,
    /// Answer nothing to the next N frames
    pub mute_frames: usize,
    /// Stop a `CR` session after this many body lines
    pub truncate_stream: Option<u32>,
    /// Mnemonics received, in order
    pub history: Vec<String>,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            position: 1,
            velocity: 5,
            locked: false,
            display: true,
            display_force: 1.0,
            continuous: false,
            zero_counts: 0.0,
            counts_per_unit: 1.0,
            load: 0.0,
            mute_frames: 0,
            truncate_stream: None,
            history: Vec::new(),
        }
    }
}

impl SimState {
    fn raw_counts(&self) -> f64 {
        self.zero_counts + self.load * self.counts_per_unit
    }
}

/// Handle for adjusting a running simulation from the outside.
#[derive(Debug, Clone, Default)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    /// Copy of the current state.
    pub fn snapshot(&self) -> SimState {
        self.state.lock().clone()
    }

    /// Mutate the state in place.
    pub fn update(&self, f: impl FnOnce(&mut SimState)) {
        f(&mut self.state.lock());
    }

    /// Apply a load to the sensor.
    pub fn set_load(&self, load: f64) {
        self.update(|s| s.load = load);
    }

    /// Set the raw reading at zero load.
    pub fn set_zero_counts(&self, counts: f64) {
        self.update(|s| s.zero_counts = counts);
    }

    /// Mnemonics received so far.
    pub fn history(&self) -> Vec<String> {
        self.state.lock().history.clone()
    }
}

/// Device side of a simulated link.
pub struct SimulatedInstrument {
    harness: MockDeviceHarness,
    frame: FrameConfig,
    revision: ProtocolRevision,
    limits: MotionLimits,
    handle: SimHandle,
    epoch: Instant,
}

impl SimulatedInstrument {
    /// Simulate a device that speaks `config`'s dialect and enforces its travel limits.
    pub fn new(harness: MockDeviceHarness, config: &DriverConfig) -> Self {
        Self {
            harness,
            frame: config.frame_config(),
            revision: config.revision,
            limits: config.limits().unwrap_or_default(),
            handle: SimHandle::default(),
            epoch: Instant::now(),
        }
    }

    /// Handle sharing this instrument's state.
    pub fn handle(&self) -> SimHandle {
        self.handle.clone()
    }

    /// Answer frames until the driver side is dropped.
    pub async fn run(mut self) {
        let end = self.frame.end as u8;
        while let Some(text) = self.harness.next_frame(end).await {
            let replies = self.respond(&text);
            for (delay, line) in replies {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if self.harness.send_line(&line).is_err() {
                    return;
                }
            }
        }
    }

    /// Lines (each preceded by a delay) the device sends in answer to `text`.
    pub fn respond(&self, text: &str) -> Vec<(Duration, String)> {
        let now = Duration::ZERO;
        let frame = match parse_frame(text, &self.frame) {
            Ok(frame) => frame,
            Err(_) => return vec![(now, "[ERROR]: malformed frame".to_string())],
        };

        let mut state = self.handle.state.lock();
        state.history.push(frame.name().to_string());
        if state.mute_frames > 0 {
            state.mute_frames -= 1;
            return Vec::new();
        }

        let spec = match self.revision.lookup(frame.name()) {
            Ok(spec) => spec,
            Err(_) => return vec![(now, format!("[ERROR]: unknown command {}", frame.name()))],
        };
        if spec.frame(frame.arguments().iter().cloned()).is_err() {
            return vec![(now, format!("[ERROR]: bad arguments to {}", frame.name()))];
        }

        let line = |s: String| vec![(now, s)];
        match frame.name() {
            MOVE_COMMAND => {
                let target = int_arg(&frame, 0);
                if state.locked {
                    line(STOP_CONFIRMATION.to_string())
                } else if self.limits.validate(target).is_err() {
                    line(format!("[ERROR]: position {} out of range", target))
                } else {
                    state.position = target;
                    line(format!("Target: {}", target))
                }
            }
            "GP" => line(format!("Position: {}", state.position)),
            "SV" => {
                state.velocity = int_arg(&frame, 0);
                line(format!("Velocity set: {}", state.velocity))
            }
            "GV" => line(format!("Velocity: {}", state.velocity)),
            "HM" => {
                state.locked = false;
                state.position = self.limits.min_position();
                line("Homing".to_string())
            }
            "ST" => {
                state.locked = true;
                line(STOP_CONFIRMATION.to_string())
            }
            "TR" => line("Tared".to_string()),
            "SF" => {
                if let Some(force) = frame.arguments().first().and_then(|a| a.parse().ok()) {
                    state.display_force = force;
                }
                line(format!("Calibration force: {}", state.display_force))
            }
            "SR" => line(format!("Force: {}", state.raw_counts())),
            "CR" => self.stream_lines(&state, &frame),
            "DC" => {
                state.display = int_arg(&frame, 0) != 0;
                line(format!("Display: {}", if state.display { "on" } else { "off" }))
            }
            "VR" => line("Version: force-stage-sim 1.0".to_string()),
            "ID" => line("ID: SIM-0001".to_string()),
            "GM" => line(format!(
                "Mode: {}",
                if state.continuous { "continuous" } else { "single" }
            )),
            "TM" => {
                state.continuous = !state.continuous;
                line("Mode toggled".to_string())
            }
            "CL" => line("Loading calibrated".to_string()),
            "SC" => line("Configuration saved".to_string()),
            "CC" => line(format!(
                "Sample: {};{}",
                self.epoch.elapsed().as_millis(),
                state.raw_counts()
            )),
            other => line(format!("[ERROR]: unknown command {}", other)),
        }
    }

    fn stream_lines(&self, state: &SimState, frame: &CommandFrame) -> Vec<(Duration, String)> {
        let count = int_arg(frame, 0).max(0) as u32;
        let interval = int_arg(frame, 1).max(0) as u64;
        let step = Duration::from_millis(interval);
        let raw = state.raw_counts();
        let body = state.truncate_stream.map_or(count, |n| n.min(count));

        let mut lines = vec![(step, format!("Sample: 0;{}", raw))];
        lines.extend((1..=u64::from(body)).map(|k| (step, format!("Sample: {},{}", k * interval, raw))));
        lines
    }
}

fn int_arg(frame: &CommandFrame, index: usize) -> i64 {
    frame
        .arguments()
        .get(index)
        .and_then(|a| a.parse().ok())
        .unwrap_or_default()
}

/// Start a simulated instrument on a fresh mock link.
///
/// Returns the driver-side port, a state handle and the task answering frames. The
/// task ends when every clone of the port is dropped.
pub fn spawn(config: &DriverConfig) -> (SharedPort, SimHandle, JoinHandle<()>) {
    let (port, harness) = mock_serial::new();
    let instrument = SimulatedInstrument::new(harness, config);
    let handle = instrument.handle();
    let task = tokio::spawn(instrument.run());
    (wrap_shared(Box::new(port)), handle, task)
}
