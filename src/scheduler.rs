//! Polling scheduler.
//!
//! Two independent, self-rescheduling tasks:
//!
//! - **Probe timer**: runs [`StageConnectionManager::probe_connection`] every
//!   probe interval. The interval starts at `probe_fast` and widens to
//!   `probe_keepalive` once the connection is established.
//! - **Stream timer**: runs the [`TelemetryEmitter`] every `stream` interval
//!   regardless of connection state and publishes the sample.
//!
//! Tick I/O is bounded by the hardware-call timeouts inside the manager, so a
//! hung bus delays one tick and never stalls the other timer.

use crate::stage::{ConnectionState, PositionSample, StageConnectionManager};
use crate::telemetry::TelemetryEmitter;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info};

/// Probe interval before the controller has answered.
pub const DEFAULT_PROBE_FAST: Duration = Duration::from_millis(1_000);

/// Probe interval once the controller has answered (1 hour).
pub const DEFAULT_PROBE_KEEPALIVE: Duration = Duration::from_millis(3_600_000);

/// Telemetry stream interval.
pub const DEFAULT_STREAM: Duration = Duration::from_millis(500);

/// What a failed probe does after the connection was established.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectPolicy {
    /// Established is permanent for the session
    #[default]
    Latch,
    /// A failed keepalive probe reverts to Disconnected and fast probing
    Reprobe,
}

/// Timer intervals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollingPolicy {
    /// Probe interval while disconnected
    pub probe_fast: Duration,
    /// Probe interval while established
    pub probe_keepalive: Duration,
    /// Stream interval
    pub stream: Duration,
}

impl Default for PollingPolicy {
    fn default() -> Self {
        Self {
            probe_fast: DEFAULT_PROBE_FAST,
            probe_keepalive: DEFAULT_PROBE_KEEPALIVE,
            stream: DEFAULT_STREAM,
        }
    }
}

/// Current probe interval, driven by the connection state.
#[derive(Debug)]
pub struct ProbeSchedule {
    policy: PollingPolicy,
    keepalive: AtomicBool,
}

impl ProbeSchedule {
    /// Start at the fast interval.
    pub fn new(policy: PollingPolicy) -> Self {
        Self {
            policy,
            keepalive: AtomicBool::new(false),
        }
    }

    /// Interval until the next probe.
    pub fn interval(&self) -> Duration {
        if self.keepalive.load(Ordering::SeqCst) {
            self.policy.probe_keepalive
        } else {
            self.policy.probe_fast
        }
    }

    /// Update the interval after a probe.
    pub fn observe(&self, state: ConnectionState) {
        let widen = state.is_established();
        let was_widened = self.keepalive.swap(widen, Ordering::SeqCst);
        if widen && !was_widened {
            info!(
                "Probe interval widened to {:?} (keepalive)",
                self.policy.probe_keepalive
            );
        } else if !widen && was_widened {
            info!("Probe interval restored to {:?}", self.policy.probe_fast);
        }
    }

    /// Configured intervals.
    pub fn policy(&self) -> PollingPolicy {
        self.policy
    }
}

/// Drives the probe and stream timers.
pub struct PollingScheduler {
    manager: Arc<StageConnectionManager>,
    emitter: TelemetryEmitter,
    schedule: ProbeSchedule,
    telemetry: watch::Sender<PositionSample>,
}

impl PollingScheduler {
    /// Create the scheduler. Timers start with [`PollingScheduler::spawn`].
    pub fn new(manager: Arc<StageConnectionManager>, policy: PollingPolicy) -> Self {
        let emitter = TelemetryEmitter::new(Arc::clone(&manager));
        let (telemetry, _) = watch::channel(PositionSample::zeroed_now());
        Self {
            manager,
            emitter,
            schedule: ProbeSchedule::new(policy),
            telemetry,
        }
    }

    /// One probe-timer firing: probe, then adjust the interval.
    pub async fn probe_tick(&self) -> ConnectionState {
        self.manager.probe_connection().await;
        let state = self.manager.state();
        self.schedule.observe(state);
        debug!("Probe tick: {:?}, next in {:?}", state, self.schedule.interval());
        state
    }

    /// One stream-timer firing: emit a sample and publish it.
    pub async fn stream_tick(&self) -> PositionSample {
        let sample = self.emitter.emit().await;
        self.telemetry.send_replace(sample);
        sample
    }

    /// Interval until the next probe.
    pub fn probe_interval(&self) -> Duration {
        self.schedule.interval()
    }

    /// Configured intervals.
    pub fn policy(&self) -> PollingPolicy {
        self.schedule.policy()
    }

    /// Latest published sample.
    pub fn latest_sample(&self) -> PositionSample {
        *self.telemetry.borrow()
    }

    /// Subscribe to published samples. Only the newest is retained.
    pub fn subscribe_telemetry(&self) -> watch::Receiver<PositionSample> {
        self.telemetry.subscribe()
    }

    /// Start both timers.
    pub fn spawn(self: &Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let probe_task = tokio::spawn(Arc::clone(self).run_probe_timer(shutdown_rx.clone()));
        let stream_task = tokio::spawn(Arc::clone(self).run_stream_timer(shutdown_rx));

        info!(
            "Polling started (probe {:?}, stream {:?})",
            self.probe_interval(),
            self.policy().stream
        );

        SchedulerHandle {
            shutdown_tx,
            probe_task,
            stream_task,
        }
    }

    async fn run_probe_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.probe_tick().await;
            let wait = self.schedule.interval();
            tokio::select! {
                _ = sleep(wait) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("Probe timer stopped");
    }

    async fn run_stream_timer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.policy().stream);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.stream_tick().await;
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("Stream timer stopped");
    }
}

/// Running timers. Dropping the handle without [`SchedulerHandle::shutdown`]
/// also stops them at their next wait.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    probe_task: JoinHandle<()>,
    stream_task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop both timers and wait for in-flight ticks to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.probe_task.await;
        let _ = self.stream_task.await;
        info!("Polling stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StageConfig;
    use crate::hardware::mock::MockStageBus;
    use crate::stage::StageConnection;

    fn scheduler(bus: &MockStageBus, policy: PollingPolicy) -> Arc<PollingScheduler> {
        let manager = StageConnectionManager::new(
            Arc::new(bus.clone()),
            StageConnection::from_config(&StageConfig::default()),
            ReconnectPolicy::Latch,
            Duration::from_millis(200),
        );
        Arc::new(PollingScheduler::new(Arc::new(manager), policy))
    }

    #[test]
    fn test_schedule_widens_on_established() {
        let schedule = ProbeSchedule::new(PollingPolicy::default());
        assert_eq!(schedule.interval(), Duration::from_millis(1_000));

        schedule.observe(ConnectionState::Disconnected);
        assert_eq!(schedule.interval(), Duration::from_millis(1_000));

        schedule.observe(ConnectionState::Established);
        assert_eq!(schedule.interval(), Duration::from_millis(3_600_000));
    }

    #[test]
    fn test_schedule_restores_fast_when_state_reverts() {
        let schedule = ProbeSchedule::new(PollingPolicy::default());
        schedule.observe(ConnectionState::Established);
        schedule.observe(ConnectionState::Disconnected);
        assert_eq!(schedule.interval(), DEFAULT_PROBE_FAST);
    }

    #[tokio::test]
    async fn test_probe_never_succeeding_stays_fast() {
        let bus = MockStageBus::new();
        let scheduler = scheduler(&bus, PollingPolicy::default());
        for _ in 0..5 {
            assert_eq!(scheduler.probe_tick().await, ConnectionState::Disconnected);
        }
        assert_eq!(scheduler.probe_interval(), DEFAULT_PROBE_FAST);
    }

    #[tokio::test]
    async fn test_stream_tick_publishes_latest() {
        let bus = MockStageBus::with_identity("ESP300");
        bus.set_positions(4.0, 5.0, 6.0);
        let scheduler = scheduler(&bus, PollingPolicy::default());
        let rx = scheduler.subscribe_telemetry();

        assert!(scheduler.stream_tick().await.is_zero());
        scheduler.probe_tick().await;
        let sample = scheduler.stream_tick().await;

        assert_eq!(sample.y, 5.0);
        assert_eq!(*rx.borrow(), sample);
        assert_eq!(scheduler.latest_sample(), sample);
    }

    #[tokio::test]
    async fn test_timers_run_and_stop() {
        let bus = MockStageBus::new();
        bus.push_identity(None);
        bus.set_fallback_identity(Some("ESP300"));
        bus.set_positions(1.0, 2.0, 3.0);
        let policy = PollingPolicy {
            probe_fast: Duration::from_millis(20),
            probe_keepalive: Duration::from_secs(60),
            stream: Duration::from_millis(25),
        };
        let scheduler = scheduler(&bus, policy);
        let mut rx = scheduler.subscribe_telemetry();

        let handle = scheduler.spawn();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown().await;

        // One failed probe, one success, then keepalive takes over
        assert_eq!(bus.identity_queries(), 2);
        assert_eq!(scheduler.probe_interval(), Duration::from_secs(60));
        assert!(rx.has_changed().unwrap_or(false));
        assert_eq!(rx.borrow_and_update().x, 1.0);

        let queries_after_stop = bus.position_queries();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(bus.position_queries(), queries_after_stop);
    }
}
