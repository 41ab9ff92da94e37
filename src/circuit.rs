//! Error aggregation and circuit breaking.
//!
//! The [`ErrorMonitor`] keeps a sliding window of recent classified errors,
//! trips a circuit when the window crosses the configured threshold, and
//! publishes everything it sees: every error on a central channel and on a
//! per-kind channel, circuit transitions on a latest-value channel, and an
//! errors-per-second rate recomputed on each report and on a 1 s tick.
//!
//! Recovery follows the half-open probe protocol: after the circuit timeout
//! one caller is allowed through as a probe; its success closes the circuit,
//! its failure reopens it. While the probe is in flight every other caller
//! is rejected.

use crate::channel::{EventChannel, EventStream, LatestStream, LatestValue};
use crate::clock::{Clock, MonotonicClock};
use crate::config::CircuitConfig;
use crate::error::{ClassifiedError, ClientError, ErrorKind};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Public circuit state. The open-since instant backing the recovery
/// timeout lives inside the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitCore {
    state: CircuitState,
    /// Clock millis when the circuit last opened.
    opened_at: u64,
    probe_in_flight: bool,
    /// Clock millis when the current probe was admitted.
    probe_started: u64,
    window: VecDeque<(u64, ErrorKind)>,
}

struct MonitorInner {
    config: CircuitConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<CircuitCore>,
    errors: EventChannel<ClassifiedError>,
    by_kind: [EventChannel<ClassifiedError>; 8],
    circuit_state: LatestValue<CircuitState>,
    error_rate: LatestValue<f64>,
    rate_tick: Mutex<Option<JoinHandle<()>>>,
}

/// Shared error-and-circuit handler. Cloning shares the same window and
/// circuit; independent clients build independent monitors.
#[derive(Clone)]
pub struct ErrorMonitor {
    inner: Arc<MonitorInner>,
}

impl ErrorMonitor {
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(MonotonicClock::default()))
    }

    /// Override the clock for deterministic tests.
    pub fn with_clock(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(MonitorInner {
            config,
            clock,
            core: Mutex::new(CircuitCore {
                state: CircuitState::Closed,
                opened_at: 0,
                probe_in_flight: false,
                probe_started: 0,
                window: VecDeque::new(),
            }),
            errors: EventChannel::new(),
            by_kind: std::array::from_fn(|_| EventChannel::new()),
            circuit_state: LatestValue::seeded(CircuitState::Closed),
            error_rate: LatestValue::seeded(0.0),
            rate_tick: Mutex::new(None),
        });

        let weak: Weak<MonitorInner> = Arc::downgrade(&inner);
        let tick = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let mut core = inner.core.lock().unwrap_or_else(|p| p.into_inner());
                let now = inner.clock.now_millis();
                inner.evict_and_rate(&mut core, now);
            }
        });
        *inner.rate_tick.lock().unwrap_or_else(|p| p.into_inner()) = Some(tick);

        Self { inner }
    }

    /// Record a classified error: window it, publish it, and update the
    /// circuit. A failure reported while the half-open probe is out drops
    /// the probe and reopens the circuit.
    pub fn report(&self, err: ClassifiedError) {
        let inner = &self.inner;
        let mut core = inner.core.lock().unwrap_or_else(|p| p.into_inner());
        let now = inner.clock.now_millis();

        core.window.push_back((now, err.kind));
        inner.evict_and_rate(&mut core, now);

        inner.errors.publish(err.clone());
        inner.by_kind[err.kind.index()].publish(err);

        if !inner.config.enabled {
            return;
        }
        match core.state {
            CircuitState::HalfOpen => {
                core.state = CircuitState::Open;
                core.opened_at = now;
                core.probe_in_flight = false;
                tracing::warn!("circuit probe failed, reopening");
                inner.circuit_state.publish(CircuitState::Open);
            }
            CircuitState::Closed if core.window.len() >= inner.config.threshold => {
                core.state = CircuitState::Open;
                core.opened_at = now;
                tracing::error!(
                    failures = core.window.len(),
                    threshold = inner.config.threshold,
                    "circuit opened"
                );
                inner.circuit_state.publish(CircuitState::Open);
            }
            _ => {}
        }
    }

    /// Whether a call may proceed right now.
    ///
    /// Open circuits flip to half-open once the recovery timeout elapses;
    /// the caller that triggers the flip holds the single probe slot until
    /// it reports an outcome. A probe abandoned without an outcome (the
    /// caller was cancelled) is reclaimed after another recovery timeout.
    pub fn allow(&self) -> bool {
        let inner = &self.inner;
        if !inner.config.enabled {
            return true;
        }
        let mut core = inner.core.lock().unwrap_or_else(|p| p.into_inner());
        let now = inner.clock.now_millis();
        match core.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = now.saturating_sub(core.opened_at);
                if elapsed >= inner.config.timeout.as_millis() as u64 {
                    core.state = CircuitState::HalfOpen;
                    core.probe_in_flight = true;
                    core.probe_started = now;
                    tracing::info!("circuit half-open, admitting probe");
                    inner.circuit_state.publish(CircuitState::HalfOpen);
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                let probe_age = now.saturating_sub(core.probe_started);
                let stale = probe_age >= inner.config.timeout.as_millis() as u64;
                if !core.probe_in_flight || stale {
                    core.probe_in_flight = true;
                    core.probe_started = now;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call. Closes a half-open circuit and resets the
    /// window; a success under a closed circuit changes nothing.
    pub fn record_success(&self) {
        let inner = &self.inner;
        let mut core = inner.core.lock().unwrap_or_else(|p| p.into_inner());
        if core.state == CircuitState::HalfOpen {
            core.state = CircuitState::Closed;
            core.probe_in_flight = false;
            core.window.clear();
            tracing::info!("circuit closed");
            inner.circuit_state.publish(CircuitState::Closed);
            inner.error_rate.publish(0.0);
        }
    }

    /// Current circuit state.
    pub fn state(&self) -> CircuitState {
        self.inner.core.lock().unwrap_or_else(|p| p.into_inner()).state
    }

    /// How long the circuit has been open, when it is.
    pub fn open_for(&self) -> Option<Duration> {
        let core = self.inner.core.lock().unwrap_or_else(|p| p.into_inner());
        match core.state {
            CircuitState::Open => {
                let now = self.inner.clock.now_millis();
                Some(Duration::from_millis(now.saturating_sub(core.opened_at)))
            }
            _ => None,
        }
    }

    /// The rejection surfaced to callers while the circuit blocks them.
    pub fn rejection(&self) -> ClientError {
        let core = self.inner.core.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.inner.clock.now_millis();
        ClientError::CircuitOpen {
            failures: core.window.len(),
            open_for: Duration::from_millis(now.saturating_sub(core.opened_at)),
        }
    }

    /// Errors currently inside the sliding window.
    pub fn errors_in_window(&self) -> usize {
        let mut core = self.inner.core.lock().unwrap_or_else(|p| p.into_inner());
        let now = self.inner.clock.now_millis();
        self.inner.evict_and_rate(&mut core, now);
        core.window.len()
    }

    /// Every classified error, as reported.
    pub fn errors(&self) -> EventStream<ClassifiedError> {
        self.inner.errors.subscribe()
    }

    /// Errors of one kind only.
    pub fn errors_of(&self, kind: ErrorKind) -> EventStream<ClassifiedError> {
        self.inner.by_kind[kind.index()].subscribe()
    }

    /// Circuit state as latest value plus changes.
    pub fn circuit_state(&self) -> LatestStream<CircuitState> {
        self.inner.circuit_state.subscribe()
    }

    /// Errors per second over the window, as latest value plus changes.
    pub fn error_rate(&self) -> LatestStream<f64> {
        self.inner.error_rate.subscribe()
    }

    /// Stop the rate tick and close all published channels.
    pub fn close(&self) {
        if let Some(handle) =
            self.inner.rate_tick.lock().unwrap_or_else(|p| p.into_inner()).take()
        {
            handle.abort();
        }
        self.inner.errors.close();
        for channel in &self.inner.by_kind {
            channel.close();
        }
        self.inner.circuit_state.close();
        self.inner.error_rate.close();
    }
}

impl MonitorInner {
    /// Drop window entries older than `now - window` and republish the rate.
    fn evict_and_rate(&self, core: &mut CircuitCore, now: u64) {
        let horizon = now.saturating_sub(self.config.window.as_millis() as u64);
        while core.window.front().is_some_and(|(at, _)| *at < horizon) {
            core.window.pop_front();
        }
        let window_secs = self.config.window.as_secs_f64().max(f64::EPSILON);
        self.error_rate.publish(core.window.len() as f64 / window_secs);
    }
}
