//! # Force Stage Driver
//!
//! Async driver for a combined load-cell / stepper-motor instrument that speaks a
//! compact ASCII command dialect over a serial link.
//!
//! ## Crate Structure
//!
//! - **`protocol`**: Frame codec (command frames out, classified response lines in) and
//!   the versioned command tables.
//! - **`driver`**: `ForceStage`, the request/response exchange owner. One exchange at a
//!   time; concurrent callers are rejected with `Busy`.
//! - **`stream`**: The `CR` streaming session, host-timed acquisition as a
//!   `futures::Stream`, and sampled sweeps.
//! - **`calibration`**: Gauge offset and scale factor, shared and live-adjustable.
//! - **`motion`**: Travel limits checked before every move, and the overload warning.
//! - **`serial`**: Transport primitives on any `AsyncRead + AsyncWrite` port.
//! - **`config`**: `DriverConfig`, loaded with figment from TOML and environment.
//! - **`error`**: `DriverError` and its classification.
//! - **`logging`**: tracing-subscriber setup for binaries.
//! - **`mock_serial`** / **`sim`**: In-memory port and a simulated instrument for tests
//!   and `--simulate`.

pub mod calibration;
pub mod config;
pub mod driver;
pub mod error;
pub mod logging;
pub mod mock_serial;
pub mod motion;
pub mod protocol;
pub mod reading;
pub mod serial;
pub mod sim;
pub mod stream;

pub use calibration::{Calibration, CalibrationState};
pub use config::DriverConfig;
pub use driver::{ForceStage, Payload};
pub use error::{DriverError, DriverErrorKind, DriverResult};
pub use motion::{ForceLimit, MotionLimits};
pub use protocol::ProtocolRevision;
pub use reading::Reading;
pub use stream::{PartialPolicy, SweepPlan, SweepSample};
