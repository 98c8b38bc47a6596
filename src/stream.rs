//! Multi-sample acquisition.
//!
//! Three ways to get more than one reading:
//!
//! - [`ForceStage::stream`]: one `CR` request, the device paces and timestamps the
//!   samples. The header line carries the first sample as `<t>;<f>`, each of the
//!   `count` body lines as `<t>,<f>`.
//! - [`ForceStage::acquire`]: repeated `SR` on a host timer, timestamped on the host,
//!   exposed as a lazy `futures::Stream`.
//! - [`ForceStage::sweep`]: move across a range while sampling.
//!
//! A `CR` session holds the port for its whole duration; any other command issued
//! meanwhile fails with [`DriverError::Busy`].

use crate::driver::{nanos, ForceStage, PortGuard};
use crate::error::{DriverError, DriverResult};
use crate::protocol::{parse_labeled_pair, BODY_PAIR_SEPARATOR, HEADER_PAIR_SEPARATOR};
use crate::reading::Reading;
use futures::stream::{self, Stream};
use std::time::Duration;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::instrument;

/// What a failed streaming session does with the samples it already decoded.
///
/// Timeouts always hand partial samples back inside
/// [`DriverError::StreamInterrupted`]; this policy governs device faults and decode
/// errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartialPolicy {
    /// A failed stream yields no partial result.
    #[default]
    Discard,
    /// Wrap every failure in `StreamInterrupted` with the samples so far.
    Keep,
}

/// Samples preallocated for a session; larger counts grow on arrival.
const PREALLOCATED_SAMPLES: usize = 1024;

/// State of one `CR` invocation.
#[derive(Debug)]
struct StreamSession {
    requested_count: u32,
    interval_ms: u32,
    samples: Vec<Reading>,
}

impl StreamSession {
    fn new(requested_count: u32, interval_ms: u32) -> Self {
        Self {
            requested_count,
            interval_ms,
            samples: Vec::with_capacity(
                usize::try_from(requested_count).map_or(PREALLOCATED_SAMPLES, |n| {
                    n.min(PREALLOCATED_SAMPLES)
                }),
            ),
        }
    }

    fn fail(self, source: DriverError, policy: PartialPolicy) -> DriverError {
        tracing::warn!(
            requested = self.requested_count,
            interval_ms = self.interval_ms,
            received = self.samples.len(),
            error = %source,
            "Streaming session aborted"
        );
        if source.is_timeout() || policy == PartialPolicy::Keep {
            DriverError::StreamInterrupted {
                source: Box::new(source),
                partial: self.samples,
            }
        } else {
            source
        }
    }
}

/// A constant-velocity move sampled along the way.
///
/// Timing estimates assume `velocity` is in mm/s as sent with `SV`. Firmware that
/// interprets `SV` in step units needs the value converted before building the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepPlan {
    /// Starting position (mm)
    pub start: i64,
    /// Final position (mm)
    pub end: i64,
    /// Travel velocity (mm/s)
    pub velocity: i64,
}

impl SweepPlan {
    /// Estimated time from `start` to `end`.
    pub fn travel_time(&self) -> Duration {
        let distance = (self.end - self.start).unsigned_abs() as f64;
        Duration::from_secs_f64(distance / self.velocity.max(1) as f64)
    }

    /// Estimated position `elapsed` after leaving `start`.
    pub fn position_at(&self, elapsed: Duration) -> f64 {
        let distance = (self.end - self.start).abs() as f64;
        let travelled = (self.velocity as f64 * elapsed.as_secs_f64()).min(distance);
        self.start as f64 + travelled * (self.end - self.start).signum() as f64
    }
}

/// One reading taken during a sweep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    /// Time since the move towards `end` was dispatched
    pub elapsed: Duration,
    /// Estimated stage position (mm)
    pub position_estimate: f64,
    /// Calibrated reading, timestamped with `elapsed`
    pub reading: Reading,
}

struct Acquisition {
    stage: ForceStage,
    period: Duration,
    ticker: Option<Interval>,
    started: Instant,
    taken: usize,
    limit: Option<usize>,
    finished: bool,
}

impl ForceStage {
    /// Run a `CR` streaming session and return `count + 1` samples in arrival order.
    ///
    /// Device timestamps (milliseconds) are authoritative and converted to nanoseconds.
    /// Failures discard partial samples, except timeouts; see [`PartialPolicy`].
    pub async fn stream(&self, count: u32, interval_ms: u32) -> DriverResult<Vec<Reading>> {
        self.stream_with(count, interval_ms, PartialPolicy::default())
            .await
    }

    /// [`ForceStage::stream`] with an explicit partial-result policy.
    #[instrument(skip(self), err)]
    pub async fn stream_with(
        &self,
        count: u32,
        interval_ms: u32,
        policy: PartialPolicy,
    ) -> DriverResult<Vec<Reading>> {
        let spec = self.lookup("CR")?;
        let frame = self.render(spec, vec![count.to_string(), interval_ms.to_string()])?;
        let mut port = self.claim()?;
        self.transmit(&mut port, spec, &frame).await?;

        // The first sample is taken one interval after the request.
        tokio::time::sleep(Duration::from_millis(u64::from(interval_ms))).await;

        let mut session = StreamSession::new(count, interval_ms);
        match self.read_session(&mut port, &mut session).await {
            Ok(()) => {
                self.settle();
                tracing::debug!(samples = session.samples.len(), "Streaming session complete");
                Ok(session.samples)
            }
            Err(source) => Err(session.fail(source, policy)),
        }
    }

    async fn read_session(
        &self,
        port: &mut PortGuard,
        session: &mut StreamSession,
    ) -> DriverResult<()> {
        for index in 0..=session.requested_count {
            let line = self.receive(port, "CR").await?.into_payload()?;
            let separator = if index == 0 {
                HEADER_PAIR_SEPARATOR
            } else {
                BODY_PAIR_SEPARATOR
            };
            let (time_ms, raw) = parse_labeled_pair("CR", &line, separator)?;
            session
                .samples
                .push(self.calibrated(time_ms.saturating_mul(1_000_000), raw));
        }
        Ok(())
    }

    /// Poll `SR` every `interval` as a lazy stream of calibrated readings.
    ///
    /// Timestamps are nanoseconds since the stream was first polled. The stream ends
    /// after `limit` readings (if given) or after the first error, which it yields.
    /// Dropping the stream stops acquisition; nothing is buffered beyond the item
    /// being produced.
    pub fn acquire(
        &self,
        interval: Duration,
        limit: Option<usize>,
    ) -> impl Stream<Item = DriverResult<Reading>> + Send + 'static {
        let state = Acquisition {
            stage: self.clone(),
            period: interval.max(Duration::from_millis(1)),
            ticker: None,
            started: Instant::now(),
            taken: 0,
            limit,
            finished: false,
        };
        stream::unfold(state, |mut acq| async move {
            if acq.finished || acq.limit.is_some_and(|limit| acq.taken >= limit) {
                return None;
            }
            let ticker = acq.ticker.get_or_insert_with(|| {
                let mut ticker = tokio::time::interval(acq.period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                ticker
            });
            let tick = ticker.tick().await;
            if acq.taken == 0 {
                acq.started = tick;
            }
            let item = match acq.stage.single_read().await {
                Ok(raw) => Ok(acq.stage.calibrated(nanos(acq.started.elapsed()), raw)),
                Err(e) => {
                    acq.finished = true;
                    Err(e)
                }
            };
            acq.taken += 1;
            Some((item, acq))
        })
    }

    /// Move to `plan.start`, then to `plan.end` at `plan.velocity`, sampling force every
    /// `sample_interval` until the estimated travel time has elapsed.
    ///
    /// Both endpoints are checked against the travel limits before anything is sent.
    #[instrument(skip(self), err)]
    pub async fn sweep(
        &self,
        plan: SweepPlan,
        sample_interval: Duration,
    ) -> DriverResult<Vec<SweepSample>> {
        self.limits().validate(plan.start)?;
        self.limits().validate(plan.end)?;
        if plan.velocity <= 0 {
            return Err(DriverError::InvalidArgument(format!(
                "sweep velocity must be positive, got {}",
                plan.velocity
            )));
        }
        let sample_interval = sample_interval.max(Duration::from_millis(1));

        self.set_velocity(plan.velocity).await?;
        self.set_position(plan.start).await?;
        self.wait_for_position(plan, sample_interval).await?;

        let travel = plan.travel_time();
        self.set_position(plan.end).await?;
        let started = Instant::now();

        let mut ticker = tokio::time::interval(sample_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut samples = Vec::new();
        loop {
            ticker.tick().await;
            let raw = self.single_read().await?;
            let elapsed = started.elapsed();
            samples.push(SweepSample {
                elapsed,
                position_estimate: plan.position_at(elapsed),
                reading: self.calibrated(nanos(elapsed), raw),
            });
            if elapsed >= travel {
                break;
            }
        }
        Ok(samples)
    }

    async fn wait_for_position(&self, plan: SweepPlan, poll: Duration) -> DriverResult<()> {
        let span = (self.limits().max_position() - self.limits().min_position()) as f64;
        let waited = Duration::from_secs_f64(span / plan.velocity as f64) + self.read_timeout();
        let deadline = Instant::now() + waited;
        loop {
            if self.get_position().await? == plan.start {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(DriverError::Timeout { waited });
            }
            tokio::time::sleep(poll).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sweep_estimates_clamp_at_the_end() {
        let plan = SweepPlan {
            start: 30,
            end: 10,
            velocity: 4,
        };
        assert_eq!(plan.travel_time(), Duration::from_secs(5));
        assert_eq!(plan.position_at(Duration::ZERO), 30.0);
        assert_eq!(plan.position_at(Duration::from_millis(2500)), 20.0);
        assert_eq!(plan.position_at(Duration::from_secs(60)), 10.0);
    }

    #[test]
    fn session_preallocation_is_capped() {
        let session = StreamSession::new(u32::MAX, 0);
        assert!(session.samples.capacity() <= PREALLOCATED_SAMPLES);
        assert!(StreamSession::new(3, 0).samples.capacity() >= 3);
    }

    #[test]
    fn timeouts_always_keep_partials() {
        let mut session = StreamSession::new(5, 10);
        session.samples.push(Reading::new(0, 1.0));
        let err = session.fail(
            DriverError::Timeout {
                waited: Duration::from_millis(10),
            },
            PartialPolicy::Discard,
        );
        assert_eq!(err.partial_readings().map(<[Reading]>::len), Some(1));

        let mut session = StreamSession::new(5, 10);
        session.samples.push(Reading::new(0, 1.0));
        let err = session.fail(DriverError::DeviceFault("[ERROR]: x".into()), PartialPolicy::Discard);
        assert!(err.partial_readings().is_none());
    }
}
