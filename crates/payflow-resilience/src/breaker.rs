//! Circuit breaker for the acquirer dependency.
//!
//! # States
//! - Closed: calls pass through; outcomes fill a count-based rolling window
//! - Open: the dependency is assumed down; calls fail fast
//! - Half-Open: exactly one trial call is let through
//!
//! # State Transitions
//! ```text
//! Closed → Open:      window holds >= minimum_calls outcomes and
//!                     failure ratio >= failure_rate_threshold
//! Open → Half-Open:   first call after open_duration has elapsed
//! Half-Open → Closed: trial succeeds
//! Half-Open → Open:   trial fails (or is abandoned)
//! ```
//!
//! All transitions happen under one mutex, so concurrent callers can never
//! both open the breaker or overwrite each other's close.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use payflow_core::clock;

/// Breaker tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerConfig {
    /// Failure ratio in `(0, 1]` that opens the breaker.
    pub failure_rate_threshold: f64,
    /// Number of most recent outcomes kept in the rolling window.
    pub sliding_window_size: usize,
    /// Outcomes required in the window before the ratio is evaluated.
    pub minimum_calls: usize,
    /// How long the breaker stays open before admitting a trial.
    pub open_duration: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 0.5,
            sliding_window_size: 10,
            minimum_calls: 10,
            open_duration: Duration::from_secs(30),
        }
    }
}

/// Externally visible breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Calls pass through.
    Closed,
    /// Calls fail fast.
    Open,
    /// A single trial is allowed through.
    HalfOpen,
}

impl BreakerState {
    fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        f.write_str(name)
    }
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    /// `true` marks a failure.
    window: VecDeque<bool>,
    opened_at: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// A circuit breaker guarding one named dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    /// Creates a closed breaker.
    #[must_use]
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        let breaker = Self {
            name: name.into(),
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                window: VecDeque::with_capacity(config.sliding_window_size),
                opened_at: None,
                trial_in_flight: false,
            }),
            config,
        };
        breaker.export_state(BreakerState::Closed);
        breaker
    }

    /// Dependency name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Asks to make a call at `now`. Returns `None` when the breaker is open
    /// (or half-open with its trial already taken).
    pub fn try_acquire(&self, now: DateTime<Utc>) -> Option<CallPermit<'_>> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Some(CallPermit::new(self, false, now)),
            BreakerState::Open => {
                let opened_at = inner.opened_at.unwrap_or(now);
                if now < clock::after(opened_at, self.config.open_duration) {
                    return None;
                }
                self.transition(&mut inner, BreakerState::HalfOpen);
                inner.trial_in_flight = true;
                Some(CallPermit::new(self, true, now))
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return None;
                }
                inner.trial_in_flight = true;
                Some(CallPermit::new(self, true, now))
            }
        }
    }

    // Every transition leaves `Inner` consistent, so a poisoned lock is
    // still safe to use.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            inner.window.clear();
            inner.opened_at = None;
            self.transition(&mut inner, BreakerState::Closed);
        } else if inner.state == BreakerState::Closed {
            self.push_outcome(&mut inner, false);
        }
    }

    fn on_failure(&self, trial: bool, now: DateTime<Utc>) {
        let mut inner = self.lock();
        if trial {
            inner.trial_in_flight = false;
            self.open(&mut inner, now);
            return;
        }
        if inner.state != BreakerState::Closed {
            return;
        }
        self.push_outcome(&mut inner, true);

        let calls = inner.window.len();
        if calls < self.config.minimum_calls.max(1) {
            return;
        }
        let failures = inner.window.iter().filter(|failed| **failed).count();
        #[allow(clippy::cast_precision_loss)]
        let ratio = failures as f64 / calls as f64;
        if ratio >= self.config.failure_rate_threshold {
            tracing::warn!(
                dependency = %self.name,
                failures,
                calls,
                failure_ratio = ratio,
                "failure threshold reached, opening circuit"
            );
            self.open(&mut inner, now);
        }
    }

    fn push_outcome(&self, inner: &mut Inner, failed: bool) {
        inner.window.push_back(failed);
        while inner.window.len() > self.config.sliding_window_size.max(1) {
            inner.window.pop_front();
        }
    }

    fn open(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner.window.clear();
        inner.opened_at = Some(now);
        self.transition(inner, BreakerState::Open);
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => {
                tracing::warn!(dependency = %self.name, %from, %to, "circuit breaker transition");
            }
            _ => {
                tracing::info!(dependency = %self.name, %from, %to, "circuit breaker transition");
            }
        }
        self.export_state(to);
    }

    fn export_state(&self, state: BreakerState) {
        metrics::gauge!("payflow_circuit_breaker_state", "dependency" => self.name.clone())
            .set(state.gauge_value());
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]. The holder must
/// report the call's outcome; a trial dropped without a report counts as a
/// failure so the breaker cannot stay half-open forever.
#[derive(Debug)]
#[must_use = "report the outcome with record_success or record_failure"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    issued_at: DateTime<Utc>,
    reported: bool,
}

impl<'a> CallPermit<'a> {
    fn new(breaker: &'a CircuitBreaker, trial: bool, issued_at: DateTime<Utc>) -> Self {
        Self {
            breaker,
            trial,
            issued_at,
            reported: false,
        }
    }

    /// Whether this call is the half-open trial.
    #[must_use]
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    /// Records a successful call.
    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.trial);
    }

    /// Records a failed call at `now`.
    pub fn record_failure(mut self, now: DateTime<Utc>) {
        self.reported = true;
        self.breaker.on_failure(self.trial, now);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.reported && self.trial {
            self.breaker.on_failure(true, self.issued_at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payflow_test_support::fixed_now;

    fn breaker(window: usize, threshold: f64) -> CircuitBreaker {
        CircuitBreaker::new(
            "acquirer",
            BreakerConfig {
                failure_rate_threshold: threshold,
                sliding_window_size: window,
                minimum_calls: window,
                open_duration: Duration::from_secs(30),
            },
        )
    }

    fn fail(breaker: &CircuitBreaker, now: DateTime<Utc>) {
        breaker.try_acquire(now).unwrap().record_failure(now);
    }

    fn succeed(breaker: &CircuitBreaker, now: DateTime<Utc>) {
        breaker.try_acquire(now).unwrap().record_success();
    }

    #[test]
    fn test_opens_when_full_window_reaches_failure_ratio() {
        // Arrange
        let now = fixed_now();
        let breaker = breaker(4, 0.5);

        // Act
        succeed(&breaker, now);
        fail(&breaker, now);
        succeed(&breaker, now);
        assert_eq!(breaker.state(), BreakerState::Closed);
        fail(&breaker, now);

        // Assert
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(breaker.try_acquire(now).is_none());
    }

    #[test]
    fn test_stays_closed_until_minimum_calls_recorded() {
        let now = fixed_now();
        let breaker = breaker(5, 0.5);

        for _ in 0..4 {
            fail(&breaker, now);
        }

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_window_only_keeps_most_recent_outcomes() {
        let now = fixed_now();
        let breaker = breaker(4, 0.75);

        fail(&breaker, now);
        fail(&breaker, now);
        succeed(&breaker, now);
        succeed(&breaker, now);
        // Window is now [F, F, S, S]; ratio 0.5 < 0.75.
        assert_eq!(breaker.state(), BreakerState::Closed);
        succeed(&breaker, now);
        fail(&breaker, now);
        // Window is [S, S, S, F]; the two old failures rolled out.

        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_half_open_after_cool_down_admits_single_trial() {
        // Arrange
        let now = fixed_now();
        let breaker = breaker(2, 0.5);
        fail(&breaker, now);
        fail(&breaker, now);
        assert_eq!(breaker.state(), BreakerState::Open);

        // Act
        let before_cool_down = clock::after(now, Duration::from_secs(29));
        let after_cool_down = clock::after(now, Duration::from_secs(30));
        assert!(breaker.try_acquire(before_cool_down).is_none());
        let trial = breaker.try_acquire(after_cool_down).unwrap();

        // Assert
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(breaker.try_acquire(after_cool_down).is_none());
        trial.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_failed_trial_reopens_and_restarts_cool_down() {
        let now = fixed_now();
        let breaker = breaker(2, 0.5);
        fail(&breaker, now);
        fail(&breaker, now);

        let trial_time = clock::after(now, Duration::from_secs(31));
        breaker
            .try_acquire(trial_time)
            .unwrap()
            .record_failure(trial_time);

        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(
            breaker
                .try_acquire(clock::after(trial_time, Duration::from_secs(29)))
                .is_none()
        );
        assert!(
            breaker
                .try_acquire(clock::after(trial_time, Duration::from_secs(30)))
                .is_some()
        );
    }

    #[test]
    fn test_abandoned_trial_counts_as_failure() {
        let now = fixed_now();
        let breaker = breaker(1, 1.0);
        fail(&breaker, now);

        let trial_time = clock::after(now, Duration::from_secs(30));
        drop(breaker.try_acquire(trial_time).unwrap());

        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_late_result_of_pre_open_call_is_ignored() {
        let now = fixed_now();
        let breaker = breaker(2, 0.5);
        let straggler = breaker.try_acquire(now).unwrap();
        fail(&breaker, now);
        fail(&breaker, now);
        assert_eq!(breaker.state(), BreakerState::Open);

        straggler.record_success();

        assert_eq!(breaker.state(), BreakerState::Open);
    }
}
