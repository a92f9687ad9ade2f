//! Liveness monitoring for a running cluster.
//!
//! The monitor keeps one [`ProgressState`] per validator and is driven once
//! per tick with the readings collected for that tick. A reading that
//! changes the recorded height resets that validator's stagnation clock;
//! a reading equal to the recorded height for at least the stagnation
//! timeout marks the validator stagnated. Any stagnated validator stops the
//! whole cluster.
//!
//! A validator that has never reported a height is never stagnated. A
//! validator that reported a height and then became unreachable keeps its
//! last state, so its clock keeps running.

use std::collections::BTreeMap;
use std::time::Duration;

use consensus_simulation::{Height, SimulationConfig, ValidatorId};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{HarnessError, HarnessResult};

/// Capacity of the liveness event channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Stop thresholds evaluated on every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessConfig {
    pub stagnation_timeout: Duration,
    pub duration_limit: Option<Duration>,
}

impl From<&SimulationConfig> for LivenessConfig {
    fn from(config: &SimulationConfig) -> Self {
        Self {
            stagnation_timeout: config.stagnation_timeout(),
            duration_limit: config.duration_limit(),
        }
    }
}

/// Last observed height of one validator and when it last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressState {
    pub last_value: Option<Height>,
    pub last_change: Instant,
}

impl ProgressState {
    fn new(now: Instant) -> Self {
        Self {
            last_value: None,
            last_change: now,
        }
    }

    fn record(&mut self, value: Height, now: Instant) {
        self.last_value = Some(value);
        self.last_change = now;
    }

    /// Time since the height last changed
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_change)
    }
}

/// Events published while monitoring
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LivenessEvent {
    FirstReading { validator: ValidatorId, height: Height },
    Advanced { validator: ValidatorId, from: Height, to: Height },
    /// A previously ready validator returned no reading
    Unreachable { validator: ValidatorId, last_height: Height },
    Stagnated { validator: ValidatorId, height: Height, idle_ms: u64 },
    DurationElapsed { elapsed_ms: u64 },
}

/// Why the cluster should stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Stagnated { validators: Vec<ValidatorId> },
    DurationElapsed,
}

/// Cluster-level decision for one tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickVerdict {
    Continue,
    Stop(StopReason),
}

/// Per-validator progress tracking and stop decisions
#[derive(Debug)]
pub struct LivenessMonitor {
    config: LivenessConfig,
    started_at: Instant,
    progress: BTreeMap<ValidatorId, ProgressState>,
    event_sender: broadcast::Sender<LivenessEvent>,
    ticks: u64,
}

impl LivenessMonitor {
    pub fn new(config: LivenessConfig, started_at: Instant) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(config, started_at, event_sender)
    }

    /// Create a monitor publishing into an existing channel
    pub fn with_events(
        config: LivenessConfig,
        started_at: Instant,
        event_sender: broadcast::Sender<LivenessEvent>,
    ) -> Self {
        Self {
            config,
            started_at,
            progress: BTreeMap::new(),
            event_sender,
            ticks: 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LivenessEvent> {
        self.event_sender.subscribe()
    }

    pub fn config(&self) -> &LivenessConfig {
        &self.config
    }

    pub fn progress(&self, id: ValidatorId) -> Option<&ProgressState> {
        self.progress.get(&id)
    }

    /// Last recorded height of every validator seen so far
    pub fn last_heights(&self) -> BTreeMap<ValidatorId, Option<Height>> {
        self.progress
            .iter()
            .map(|(id, state)| (*id, state.last_value))
            .collect()
    }

    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Record one reading for `id`.
    ///
    /// Returns whether the validator is stagnated after this reading, or a
    /// [`HarnessError::ProgressRegression`] if the height went backwards.
    pub fn observe(
        &mut self,
        id: ValidatorId,
        reading: Option<Height>,
        now: Instant,
    ) -> HarnessResult<bool> {
        let state = self.progress.entry(id).or_insert_with(|| ProgressState::new(now));

        let previous = match (state.last_value, reading) {
            (None, None) => return Ok(false),
            (None, Some(height)) => {
                state.record(height, now);
                debug!(validator = id, height, "first progress reading");
                let _ = self.event_sender.send(LivenessEvent::FirstReading { validator: id, height });
                return Ok(false);
            }
            (Some(previous), None) => {
                debug!(validator = id, last_height = previous, "validator unreachable");
                let _ = self.event_sender.send(LivenessEvent::Unreachable {
                    validator: id,
                    last_height: previous,
                });
                previous
            }
            (Some(previous), Some(current)) if current < previous => {
                warn!(validator = id, previous, current, "progress counter regressed");
                return Err(HarnessError::ProgressRegression { id, previous, current });
            }
            (Some(previous), Some(current)) if current > previous => {
                state.record(current, now);
                debug!(validator = id, from = previous, to = current, "progress advanced");
                let _ = self.event_sender.send(LivenessEvent::Advanced {
                    validator: id,
                    from: previous,
                    to: current,
                });
                return Ok(false);
            }
            (Some(previous), Some(_)) => previous,
        };

        let idle = state.idle(now);
        if idle < self.config.stagnation_timeout {
            return Ok(false);
        }

        warn!(validator = id, height = previous, idle_secs = idle.as_secs(), "validator stagnated");
        let _ = self.event_sender.send(LivenessEvent::Stagnated {
            validator: id,
            height: previous,
            idle_ms: idle.as_millis() as u64,
        });
        Ok(true)
    }

    /// Observe a full tick of readings and decide whether to stop.
    ///
    /// Every reading is recorded before the verdict is computed. When both
    /// conditions hold on the same tick, stagnation is reported.
    pub fn evaluate(
        &mut self,
        readings: &[(ValidatorId, Option<Height>)],
        now: Instant,
    ) -> HarnessResult<TickVerdict> {
        self.ticks += 1;

        let mut stagnated = Vec::new();
        for (id, reading) in readings {
            if self.observe(*id, *reading, now)? {
                stagnated.push(*id);
            }
        }

        if !stagnated.is_empty() {
            stagnated.sort_unstable();
            info!(validators = ?stagnated, tick = self.ticks, "cluster stagnated");
            return Ok(TickVerdict::Stop(StopReason::Stagnated { validators: stagnated }));
        }

        if let Some(limit) = self.config.duration_limit {
            let elapsed = self.elapsed(now);
            if elapsed >= limit {
                info!(elapsed_secs = elapsed.as_secs(), tick = self.ticks, "run duration elapsed");
                let _ = self.event_sender.send(LivenessEvent::DurationElapsed {
                    elapsed_ms: elapsed.as_millis() as u64,
                });
                return Ok(TickVerdict::Stop(StopReason::DurationElapsed));
            }
        }

        Ok(TickVerdict::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn config(stagnation_secs: u64, duration_secs: Option<u64>) -> LivenessConfig {
        LivenessConfig {
            stagnation_timeout: Duration::from_secs(stagnation_secs),
            duration_limit: duration_secs.map(Duration::from_secs),
        }
    }

    fn at(start: Instant, secs: u64) -> Instant {
        start + Duration::from_secs(secs)
    }

    #[test]
    fn test_non_decreasing_sequence_is_accepted() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(3600, None), start);

        for (i, height) in [5, 5, 5, 7, 7, 9].into_iter().enumerate() {
            assert!(monitor.observe(0, Some(height), at(start, i as u64)).is_ok());
        }
        assert_eq!(monitor.progress(0).unwrap().last_value, Some(9));
    }

    #[test]
    fn test_regression_is_an_error() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(3600, None), start);

        monitor.observe(3, Some(5), at(start, 0)).unwrap();
        monitor.observe(3, Some(7), at(start, 1)).unwrap();
        match monitor.observe(3, Some(6), at(start, 2)) {
            Err(HarnessError::ProgressRegression { id, previous, current }) => {
                assert_eq!((id, previous, current), (3, 7, 6));
            }
            other => panic!("expected regression, got {:?}", other),
        }
    }

    #[test]
    fn test_stagnation_at_first_tick_past_timeout() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(30, None), start);

        for secs in [0, 10, 20] {
            let verdict = monitor.evaluate(&[(0, Some(5)), (1, Some(5))], at(start, secs)).unwrap();
            assert_eq!(verdict, TickVerdict::Continue, "no stagnation at t={}", secs);
        }

        let verdict = monitor.evaluate(&[(0, Some(5)), (1, Some(5))], at(start, 30)).unwrap();
        assert_eq!(
            verdict,
            TickVerdict::Stop(StopReason::Stagnated { validators: vec![0, 1] })
        );
    }

    #[test]
    fn test_change_resets_stagnation_clock() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(30, None), start);

        monitor.observe(0, Some(5), at(start, 0)).unwrap();
        assert!(!monitor.observe(0, Some(6), at(start, 25)).unwrap());
        assert!(!monitor.observe(0, Some(6), at(start, 50)).unwrap());
        assert!(monitor.observe(0, Some(6), at(start, 55)).unwrap());
    }

    #[test]
    fn test_single_stagnant_validator_stops_cluster() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(30, None), start);

        monitor.evaluate(&[(0, Some(1)), (1, Some(1))], at(start, 0)).unwrap();
        let verdict = monitor.evaluate(&[(0, Some(9)), (1, Some(1))], at(start, 30)).unwrap();
        assert_eq!(verdict, TickVerdict::Stop(StopReason::Stagnated { validators: vec![1] }));
    }

    #[test]
    fn test_never_ready_validator_is_never_stagnated() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(30, None), start);

        for secs in (0..=600).step_by(10) {
            let verdict = monitor.evaluate(&[(2, None)], at(start, secs)).unwrap();
            assert_eq!(verdict, TickVerdict::Continue);
        }
        assert_eq!(monitor.last_heights().get(&2), Some(&None));
    }

    #[test]
    fn test_unreachable_after_reading_keeps_clock() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(30, None), start);
        let mut events = monitor.subscribe();

        monitor.observe(1, Some(4), at(start, 0)).unwrap();
        assert!(!monitor.observe(1, None, at(start, 10)).unwrap());
        assert!(monitor.observe(1, None, at(start, 30)).unwrap());
        assert_eq!(monitor.progress(1).unwrap().last_value, Some(4));

        assert_eq!(events.try_recv().unwrap(), LivenessEvent::FirstReading { validator: 1, height: 4 });
        assert_eq!(events.try_recv().unwrap(), LivenessEvent::Unreachable { validator: 1, last_height: 4 });
    }

    #[test]
    fn test_duration_expiry() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(3600, Some(20)), start);
        let mut events = monitor.subscribe();

        assert_eq!(monitor.evaluate(&[(0, Some(1))], at(start, 10)).unwrap(), TickVerdict::Continue);
        assert_eq!(monitor.evaluate(&[(0, Some(2))], at(start, 19)).unwrap(), TickVerdict::Continue);
        assert_eq!(
            monitor.evaluate(&[(0, Some(3))], at(start, 20)).unwrap(),
            TickVerdict::Stop(StopReason::DurationElapsed)
        );
        assert_eq!(monitor.ticks(), 3);

        let last = std::iter::from_fn(|| events.try_recv().ok()).last();
        assert_eq!(last, Some(LivenessEvent::DurationElapsed { elapsed_ms: 20_000 }));
    }

    #[test]
    fn test_advanced_events_are_published() {
        let start = Instant::now();
        let mut monitor = LivenessMonitor::new(config(3600, None), start);
        let mut events = monitor.subscribe();

        monitor.observe(0, Some(1), start).unwrap();
        monitor.observe(0, Some(1), start).unwrap();
        monitor.observe(0, Some(3), start).unwrap();

        assert!(matches!(events.try_recv(), Ok(LivenessEvent::FirstReading { .. })));
        assert_eq!(
            events.try_recv().unwrap(),
            LivenessEvent::Advanced { validator: 0, from: 1, to: 3 }
        );
        assert!(events.try_recv().is_err());
    }

    proptest! {
        #[test]
        fn prop_non_decreasing_readings_never_fail(
            first in 0u64..1_000,
            steps in prop::collection::vec(0u64..3, 1..50),
        ) {
            let start = Instant::now();
            let mut monitor = LivenessMonitor::new(config(3600, None), start);
            let mut height = first;

            for (i, step) in steps.iter().enumerate() {
                height += step;
                prop_assert!(monitor.observe(0, Some(height), at(start, i as u64)).is_ok());
            }
            prop_assert_eq!(monitor.progress(0).unwrap().last_value, Some(height));
        }

        #[test]
        fn prop_any_decrease_is_detected(
            high in 1u64..1_000,
            drop in 1u64..1_000,
        ) {
            let start = Instant::now();
            let mut monitor = LivenessMonitor::new(config(3600, None), start);
            let low = high.saturating_sub(drop);
            prop_assume!(low < high);

            monitor.observe(0, Some(high), start).unwrap();
            let is_regression = matches!(
                monitor.observe(0, Some(low), at(start, 1)),
                Err(HarnessError::ProgressRegression { .. })
            );
            prop_assert!(is_regression);
        }
    }
}
