// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-target circuit breaking.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tick::Clock;
use tracing::Level;

use crate::config::BreakerConfig;
use crate::error::{CircuitOpenError, Classification, ConfigError, Error};
use crate::identity::WorkloadId;

type Classify<E> = Arc<dyn Fn(&E) -> Classification + Send + Sync>;

/// The state of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls pass through and failures are counted.
    Closed,
    /// Calls are rejected until the recovery timeout elapses.
    Open,
    /// A single probe call at a time is let through to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// The `snake_case` name used in telemetry.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point-in-time snapshot of a breaker.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct BreakerMetrics {
    /// The breaker name, the target identity for registry breakers.
    pub name: String,
    /// The current state.
    pub state: CircuitState,
    /// Consecutive counted failures.
    pub consecutive_failures: u32,
    /// Consecutive successful probes, meaningful in [`CircuitState::HalfOpen`].
    pub consecutive_successes: u32,
    /// Time elapsed since the last state transition.
    pub since_transition: Duration,
    /// Cumulative successful calls.
    pub successes: u64,
    /// Cumulative counted failures.
    pub failures: u64,
    /// Cumulative calls rejected without being invoked.
    pub rejections: u64,
    /// How many times the circuit opened.
    pub times_opened: u64,
}

/// A three-state circuit breaker.
///
/// While closed, `failure_threshold` consecutive failures open the circuit. While open,
/// every call fails with [`CircuitOpenError`] without invoking the operation. Once
/// `recovery_timeout` has elapsed, the next call becomes a probe and the circuit is
/// half-open; exactly one probe is in flight at a time and concurrent calls are rejected.
/// `success_threshold` consecutive successful probes close the circuit, a single
/// failed probe opens it again.
///
/// Failures classified as [`Classification::Excluded`] are passed through without
/// affecting any counter.
///
/// # Thread safety
///
/// The state is guarded by a per-breaker lock that is never held across the operation.
pub struct CircuitBreaker<E = Error> {
    engine: Engine,
    classify: Classify<E>,
}

impl CircuitBreaker<Error> {
    /// Creates a breaker for the crate's [`Error`]. Kinds listed in
    /// [`BreakerConfig::excluded`] are not counted.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn new(name: impl Into<String>, config: BreakerConfig, clock: Clock) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::for_error(name.into(), config, clock))
    }

    fn for_error(name: String, config: BreakerConfig, clock: Clock) -> Self {
        let excluded = config.excluded.clone();

        Self {
            engine: Engine::new(name, config, clock),
            classify: Arc::new(move |error: &Error| {
                if excluded.contains(&error.kind()) {
                    Classification::Excluded
                } else {
                    Classification::Terminal
                }
            }),
        }
    }
}

impl<E> CircuitBreaker<E> {
    /// Creates a breaker that classifies failures with `classify`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn with_classifier(
        name: impl Into<String>,
        config: BreakerConfig,
        clock: Clock,
        classify: impl Fn(&E) -> Classification + Send + Sync + 'static,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            engine: Engine::new(name.into(), config, clock),
            classify: Arc::new(classify),
        })
    }

    /// The breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.engine.name
    }

    /// The current state.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.engine.core.lock().state.kind()
    }

    /// A snapshot of state and counters.
    #[must_use]
    pub fn metrics(&self) -> BreakerMetrics {
        self.engine.metrics(self.engine.clock.instant())
    }

    /// Forces the circuit closed and clears the counters of the current cycle.
    ///
    /// Meant for operator intervention; every reset is logged at `WARN`.
    pub fn reset(&self) {
        let now = self.engine.clock.instant();
        let previous = {
            let mut core = self.engine.core.lock();
            let previous = core.state.kind();
            core.transition(State::Closed { failures: 0 }, now);
            previous
        };

        tracing::event!(
            name: "tether.breaker.reset",
            Level::WARN,
            breaker.name = %self.engine.name,
            breaker.previous_state = previous.as_str(),
        );
    }

    /// Invokes `operation` unless the circuit rejects the call, and records the outcome.
    ///
    /// Dropping the returned future before it completes records nothing, and a
    /// probe slot it held is released.
    ///
    /// # Errors
    ///
    /// Returns the circuit-open error converted into `E`, or the operation's own error unchanged.
    pub async fn call<T, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let permit = self.engine.enter().map_err(E::from)?;
        let result = operation().await;

        let outcome = match &result {
            Ok(_) => Outcome::Success,
            Err(error) => match (self.classify)(error) {
                Classification::Excluded => Outcome::Excluded,
                Classification::Transient | Classification::Terminal => Outcome::Failure,
            },
        };

        permit.complete(outcome);
        result
    }
}

impl<E> fmt::Debug for CircuitBreaker<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.engine.name)
            .field("config", &self.engine.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// Breakers keyed by target identity, created on first use.
///
/// Breakers of different targets never contend with each other; the registry lock
/// only guards the map.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    config: BreakerConfig,
    clock: Clock,
    breakers: Mutex<HashMap<WorkloadId, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Creates an empty registry whose breakers share `config`.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when `config` is out of bounds.
    pub fn new(config: BreakerConfig, clock: Clock) -> Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            config,
            clock,
            breakers: Mutex::default(),
        })
    }

    /// Returns the breaker for `target`, creating it if needed.
    #[must_use]
    pub fn get(&self, target: &WorkloadId) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();

        let breaker = breakers.entry(target.clone()).or_insert_with(|| {
            Arc::new(CircuitBreaker::for_error(
                target.to_string(),
                self.config.clone(),
                self.clock.clone(),
            ))
        });

        Arc::clone(breaker)
    }

    /// Snapshots every breaker, ordered by name.
    #[must_use]
    pub fn metrics(&self) -> Vec<BreakerMetrics> {
        let breakers: Vec<_> = self.breakers.lock().values().map(Arc::clone).collect();

        let mut metrics: Vec<_> = breakers.iter().map(|breaker| breaker.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Resets the breaker for `target`. Returns `false` if no breaker exists for it.
    pub fn reset(&self, target: &WorkloadId) -> bool {
        let breaker = self.breakers.lock().get(target).map(Arc::clone);

        match breaker {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }
}

#[derive(Debug)]
struct Engine {
    name: String,
    config: BreakerConfig,
    clock: Clock,
    core: Mutex<Core>,
}

impl Engine {
    fn new(name: String, config: BreakerConfig, clock: Clock) -> Self {
        let core = Core::new(clock.instant());

        Self {
            name,
            config,
            clock,
            core: Mutex::new(core),
        }
    }

    fn enter(&self) -> Result<Permit<'_>, CircuitOpenError> {
        // Read the time outside of the lock.
        let now = self.clock.instant();
        let (admission, transition) = self.core.lock().enter(now);

        if let Some(state) = transition {
            self.log_transition(state);
        }

        match admission {
            Some(mode) => Ok(Permit {
                engine: self,
                mode,
                completed: false,
            }),
            None => {
                tracing::event!(
                    name: "tether.breaker.rejected",
                    Level::DEBUG,
                    breaker.name = %self.name,
                );

                Err(CircuitOpenError::new(self.metrics(now)))
            }
        }
    }

    fn exit(&self, mode: Mode, outcome: Outcome) {
        let now = self.clock.instant();
        let transition = self.core.lock().exit(mode, outcome, now, &self.config);

        if let Some(state) = transition {
            self.log_transition(state);
        }
    }

    fn abandon(&self, mode: Mode) {
        if mode == Mode::Probe {
            self.core.lock().release_probe();
        }
    }

    fn metrics(&self, now: Instant) -> BreakerMetrics {
        let core = self.core.lock();
        let (consecutive_failures, consecutive_successes) = match core.state {
            State::Closed { failures } | State::Open { failures, .. } => (failures, 0),
            State::HalfOpen { successes, .. } => (0, successes),
        };

        BreakerMetrics {
            name: self.name.clone(),
            state: core.state.kind(),
            consecutive_failures,
            consecutive_successes,
            since_transition: now.saturating_duration_since(core.since),
            successes: core.totals.successes,
            failures: core.totals.failures,
            rejections: core.totals.rejections,
            times_opened: core.totals.opened,
        }
    }

    fn log_transition(&self, state: CircuitState) {
        if state == CircuitState::Open {
            tracing::event!(
                name: "tether.breaker.transition",
                Level::WARN,
                breaker.name = %self.name,
                breaker.state = state.as_str(),
            );
        } else {
            tracing::event!(
                name: "tether.breaker.transition",
                Level::INFO,
                breaker.name = %self.name,
                breaker.state = state.as_str(),
            );
        }
    }
}

/// Admission of a single call. Dropping it without completing releases a probe slot.
#[derive(Debug)]
struct Permit<'a> {
    engine: &'a Engine,
    mode: Mode,
    completed: bool,
}

impl Permit<'_> {
    fn complete(mut self, outcome: Outcome) {
        self.completed = true;
        self.engine.exit(self.mode, outcome);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.engine.abandon(self.mode);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    Probe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Success,
    Failure,
    Excluded,
}

#[derive(Debug)]
struct Core {
    state: State,
    since: Instant,
    totals: Totals,
}

#[derive(Debug, Clone, Copy)]
enum State {
    Closed { failures: u32 },
    Open { until: Instant, failures: u32 },
    HalfOpen { successes: u32, probing: bool },
}

impl State {
    fn kind(self) -> CircuitState {
        match self {
            Self::Closed { .. } => CircuitState::Closed,
            Self::Open { .. } => CircuitState::Open,
            Self::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

#[derive(Debug, Default)]
struct Totals {
    successes: u64,
    failures: u64,
    rejections: u64,
    opened: u64,
}

impl Core {
    fn new(now: Instant) -> Self {
        Self {
            state: State::Closed { failures: 0 },
            since: now,
            totals: Totals::default(),
        }
    }

    fn transition(&mut self, state: State, now: Instant) {
        if matches!(state, State::Open { .. }) {
            self.totals.opened = self.totals.opened.saturating_add(1);
        }

        self.state = state;
        self.since = now;
    }

    fn enter(&mut self, now: Instant) -> (Option<Mode>, Option<CircuitState>) {
        match self.state {
            State::Closed { .. } => (Some(Mode::Normal), None),
            State::Open { until, .. } if now >= until => {
                self.transition(
                    State::HalfOpen {
                        successes: 0,
                        probing: true,
                    },
                    now,
                );
                (Some(Mode::Probe), Some(CircuitState::HalfOpen))
            }
            State::HalfOpen {
                successes,
                probing: false,
            } => {
                self.state = State::HalfOpen {
                    successes,
                    probing: true,
                };
                (Some(Mode::Probe), None)
            }
            State::Open { .. } | State::HalfOpen { .. } => {
                self.totals.rejections = self.totals.rejections.saturating_add(1);
                (None, None)
            }
        }
    }

    fn exit(&mut self, mode: Mode, outcome: Outcome, now: Instant, config: &BreakerConfig) -> Option<CircuitState> {
        match outcome {
            Outcome::Success => self.totals.successes = self.totals.successes.saturating_add(1),
            Outcome::Failure => self.totals.failures = self.totals.failures.saturating_add(1),
            Outcome::Excluded => {}
        }

        match (self.state, mode, outcome) {
            (State::Closed { .. }, Mode::Normal, Outcome::Success) => {
                self.state = State::Closed { failures: 0 };
                None
            }
            (State::Closed { failures }, Mode::Normal, Outcome::Failure) => {
                let failures = failures.saturating_add(1);

                if failures < config.failure_threshold {
                    self.state = State::Closed { failures };
                    return None;
                }

                self.transition(
                    State::Open {
                        until: now + config.recovery_timeout,
                        failures,
                    },
                    now,
                );
                Some(CircuitState::Open)
            }
            (State::HalfOpen { successes, .. }, Mode::Probe, Outcome::Success) => {
                let successes = successes.saturating_add(1);

                if successes < config.success_threshold {
                    self.state = State::HalfOpen {
                        successes,
                        probing: false,
                    };
                    return None;
                }

                self.transition(State::Closed { failures: 0 }, now);
                Some(CircuitState::Closed)
            }
            (State::HalfOpen { .. }, Mode::Probe, Outcome::Failure) => {
                self.transition(
                    State::Open {
                        until: now + config.recovery_timeout,
                        failures: 1,
                    },
                    now,
                );
                Some(CircuitState::Open)
            }
            (State::HalfOpen { .. }, Mode::Probe, Outcome::Excluded) => {
                self.release_probe();
                None
            }
            // Excluded outcomes in the closed state, and late outcomes of calls admitted
            // before the state changed underneath them, leave the state untouched.
            _ => None,
        }
    }

    fn release_probe(&mut self) {
        if let State::HalfOpen { probing, .. } = &mut self.state {
            *probing = false;
        }
    }
}
