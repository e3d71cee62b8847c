//! The Resilience Core (spec.md §4.D): retry, timeout, and circuit-breaker
//! policies wrapped around the three operations that talk to the outside
//! world — Kafka publish, message processing, and upstream reconnect.
//!
//! The circuit breaker is a small hand-rolled atomics state machine; retry
//! and backoff delegate to the `backoff` crate the way the wider example
//! pack uses it for exponential/linear retry schedules.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use crate::error::{CircuitOpenError, OperationCancelled};

/// Parameters for one policy. The three named constructors below match the
/// concrete numbers spec.md §4.D assigns to Kafka publish, message
/// processing, and connection reconnect.
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub max_attempts: u32,
    pub backoff: BackoffKind,
    pub timeout: Option<Duration>,
    pub breaker: Option<BreakerConfig>,
}

#[derive(Debug, Clone)]
pub enum BackoffKind {
    Exponential { initial: Duration, max: Duration },
    Linear { step: Duration },
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_ratio: f64,
    pub window: Duration,
    pub minimum_throughput: u32,
    pub break_duration: Duration,
}

impl PolicyConfig {
    /// Kafka publish: 3 attempts, exponential 1s-30s, 30s timeout, breaker
    /// trips at a 50% failure ratio over a 60s window with at least 10
    /// observations, breaking for 30s.
    pub fn kafka_publish() -> Self {
        PolicyConfig {
            max_attempts: 3,
            backoff: BackoffKind::Exponential {
                initial: Duration::from_secs(1),
                max: Duration::from_secs(30),
            },
            timeout: Some(Duration::from_secs(30)),
            breaker: Some(BreakerConfig {
                failure_ratio: 0.5,
                window: Duration::from_secs(60),
                minimum_throughput: 10,
                break_duration: Duration::from_secs(30),
            }),
        }
    }

    /// Message processing: 2 attempts, linear 500ms steps, 10s timeout, no
    /// breaker — a single bad frame must never trip a circuit shared by
    /// every other frame.
    pub fn message_processing() -> Self {
        PolicyConfig {
            max_attempts: 2,
            backoff: BackoffKind::Linear {
                step: Duration::from_millis(500),
            },
            timeout: Some(Duration::from_secs(10)),
            breaker: None,
        }
    }

    /// Connection reconnect: 5 attempts, exponential 2s-60s, no timeout (a
    /// reconnect attempt runs until the underlying socket call itself gives
    /// up), breaker at 70% over 120s with at least 5 observations, breaking
    /// for 60s.
    pub fn connection_reconnect() -> Self {
        PolicyConfig {
            max_attempts: 5,
            backoff: BackoffKind::Exponential {
                initial: Duration::from_secs(2),
                max: Duration::from_secs(60),
            },
            timeout: None,
            breaker: Some(BreakerConfig {
                failure_ratio: 0.7,
                window: Duration::from_secs(120),
                minimum_throughput: 5,
                break_duration: Duration::from_secs(60),
            }),
        }
    }

    fn to_exponential_backoff(&self) -> Option<ExponentialBackoff> {
        match &self.backoff {
            BackoffKind::Exponential { initial, max } => Some(ExponentialBackoff {
                initial_interval: *initial,
                max_interval: *max,
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            }),
            BackoffKind::Linear { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            1 => BreakerState::Open,
            2 => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

/// A sliding window of outcome counts plus a state machine, shared behind
/// an `Arc` by every caller of a given policy (spec.md §4.D, "Circuit
/// Breaker").
struct CircuitBreaker {
    config: BreakerConfig,
    state: AtomicU8,
    successes: AtomicU32,
    failures: AtomicU32,
    window_started_at_millis: AtomicU64,
    opened_at_millis: AtomicU64,
}

impl CircuitBreaker {
    fn new(config: BreakerConfig, now_millis: u64) -> Self {
        CircuitBreaker {
            config,
            state: AtomicU8::new(BreakerState::Closed as u8),
            successes: AtomicU32::new(0),
            failures: AtomicU32::new(0),
            window_started_at_millis: AtomicU64::new(now_millis),
            opened_at_millis: AtomicU64::new(0),
        }
    }

    fn state(&self) -> BreakerState {
        self.state.load(Ordering::SeqCst).into()
    }

    /// Check whether a call is permitted right now, transitioning
    /// Open -> HalfOpen once `break_duration` has elapsed.
    fn allow(&self, now_millis: u64) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = self.opened_at_millis.load(Ordering::SeqCst);
                let elapsed = now_millis.saturating_sub(opened_at);
                if elapsed >= self.config.break_duration.as_millis() as u64 {
                    self.state.store(BreakerState::HalfOpen as u8, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn reset_window(&self, now_millis: u64) {
        self.successes.store(0, Ordering::SeqCst);
        self.failures.store(0, Ordering::SeqCst);
        self.window_started_at_millis.store(now_millis, Ordering::SeqCst);
    }

    fn record(&self, success: bool, now_millis: u64) {
        let window_started = self.window_started_at_millis.load(Ordering::SeqCst);
        if now_millis.saturating_sub(window_started) >= self.config.window.as_millis() as u64 {
            self.reset_window(now_millis);
        }

        if self.state() == BreakerState::HalfOpen {
            if success {
                self.state.store(BreakerState::Closed as u8, Ordering::SeqCst);
                self.reset_window(now_millis);
            } else {
                self.state.store(BreakerState::Open as u8, Ordering::SeqCst);
                self.opened_at_millis.store(now_millis, Ordering::SeqCst);
            }
            return;
        }

        if success {
            self.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }

        let successes = self.successes.load(Ordering::SeqCst);
        let failures = self.failures.load(Ordering::SeqCst);
        let total = successes + failures;
        if total < self.config.minimum_throughput {
            return;
        }
        let ratio = failures as f64 / total as f64;
        if ratio >= self.config.failure_ratio {
            self.state.store(BreakerState::Open as u8, Ordering::SeqCst);
            self.opened_at_millis.store(now_millis, Ordering::SeqCst);
        }
    }
}

fn now_millis() -> u64 {
    // Policies only ever compare relative offsets within a single process
    // lifetime, so a monotonic clock sourced from `std::time::Instant`
    // epoch-ed at first use is sufficient and avoids depending on wall-clock
    // time here.
    static START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    let start = START.get_or_init(std::time::Instant::now);
    start.elapsed().as_millis() as u64
}

/// One configured policy, ready to wrap async operations. Cloneable and
/// cheap to share across worker tasks — the breaker state lives behind an
/// `Arc`.
#[derive(Clone)]
pub struct ResiliencePolicy {
    config: PolicyConfig,
    breaker: Option<Arc<CircuitBreaker>>,
}

impl ResiliencePolicy {
    pub fn new(config: PolicyConfig) -> Self {
        let breaker = config
            .breaker
            .clone()
            .map(|b| Arc::new(CircuitBreaker::new(b, now_millis())));
        ResiliencePolicy { config, breaker }
    }

    pub fn is_circuit_open(&self) -> bool {
        match &self.breaker {
            Some(b) => !b.allow(now_millis()),
            None => false,
        }
    }

    /// Run `op`, retrying per this policy's schedule until it succeeds, the
    /// attempt budget is exhausted, the timeout (if any) fires, the breaker
    /// is open, or `cancel` fires. `op` must itself be idempotent-safe to
    /// retry; enforcing that is the caller's responsibility (spec.md §4.D).
    pub async fn run<F, Fut, T, E>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, RetryOutcome<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(breaker) = &self.breaker {
            if !breaker.allow(now_millis()) {
                return Err(RetryOutcome::CircuitOpen(CircuitOpenError));
            }
        }

        let mut exp_backoff = self.config.to_exponential_backoff();
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(RetryOutcome::Cancelled(OperationCancelled));
            }

            let attempt_future = op();
            let outcome = match self.config.timeout {
                Some(timeout) => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled(OperationCancelled)),
                        result = tokio::time::timeout(timeout, attempt_future) => {
                            match result {
                                Ok(inner) => inner,
                                Err(_) => {
                                    warn!("resilience: attempt {attempt} timed out after {timeout:?}");
                                    if let Some(b) = &self.breaker {
                                        b.record(false, now_millis());
                                    }
                                    if attempt >= self.config.max_attempts {
                                        return Err(RetryOutcome::AttemptsExhausted);
                                    }
                                    self.sleep_between_attempts(&mut exp_backoff, attempt, cancel).await;
                                    continue;
                                }
                            }
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(RetryOutcome::Cancelled(OperationCancelled)),
                        result = attempt_future => result,
                    }
                }
            };

            match outcome {
                Ok(value) => {
                    if let Some(b) = &self.breaker {
                        b.record(true, now_millis());
                    }
                    return Ok(value);
                }
                Err(err) => {
                    if let Some(b) = &self.breaker {
                        b.record(false, now_millis());
                    }
                    if attempt >= self.config.max_attempts {
                        return Err(RetryOutcome::OperationFailed(err));
                    }
                    info!("resilience: attempt {attempt} failed, retrying");
                    self.sleep_between_attempts(&mut exp_backoff, attempt, cancel).await;
                }
            }
        }
    }

    async fn sleep_between_attempts(
        &self,
        exp_backoff: &mut Option<ExponentialBackoff>,
        attempt: u32,
        cancel: &CancellationToken,
    ) {
        let delay = match (&self.config.backoff, exp_backoff.as_mut()) {
            (BackoffKind::Exponential { .. }, Some(b)) => b.next_backoff().unwrap_or(b.max_interval),
            (BackoffKind::Linear { step }, _) => *step * attempt,
            _ => Duration::from_millis(0),
        };
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Why a `ResiliencePolicy::run` call did not return a successful value.
#[derive(Debug)]
pub enum RetryOutcome<E> {
    OperationFailed(E),
    AttemptsExhausted,
    CircuitOpen(CircuitOpenError),
    Cancelled(OperationCancelled),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32 as Counter;

    #[tokio::test]
    async fn retries_until_success_within_attempt_budget() {
        let policy = ResiliencePolicy::new(PolicyConfig::message_processing());
        let cancel = CancellationToken::new();
        let attempts = Arc::new(Counter::new(0));
        let attempts2 = attempts.clone();

        let result: Result<(), RetryOutcome<&str>> = policy
            .run(&cancel, || {
                let attempts = attempts2.clone();
                async move {
                    let n = attempts.fetch_add(1, Ordering::SeqCst);
                    if n == 0 {
                        Err("transient")
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_surfaces_the_last_error() {
        let policy = ResiliencePolicy::new(PolicyConfig::message_processing());
        let cancel = CancellationToken::new();

        let result: Result<(), RetryOutcome<&str>> =
            policy.run(&cancel, || async { Err("always fails") }).await;

        assert!(matches!(result, Err(RetryOutcome::OperationFailed("always fails"))));
    }

    #[tokio::test]
    async fn breaker_opens_after_minimum_throughput_and_failure_ratio_exceeded() {
        let config = PolicyConfig {
            max_attempts: 1,
            backoff: BackoffKind::Linear {
                step: Duration::from_millis(1),
            },
            timeout: None,
            breaker: Some(BreakerConfig {
                failure_ratio: 0.5,
                window: Duration::from_secs(60),
                minimum_throughput: 2,
                break_duration: Duration::from_secs(60),
            }),
        };
        let policy = ResiliencePolicy::new(config);
        let cancel = CancellationToken::new();

        for _ in 0..2 {
            let _: Result<(), RetryOutcome<&str>> = policy.run(&cancel, || async { Err("boom") }).await;
        }

        assert!(policy.is_circuit_open());
        let result: Result<(), RetryOutcome<&str>> = policy.run(&cancel, || async { Ok(()) }).await;
        assert!(matches!(result, Err(RetryOutcome::CircuitOpen(_))));
    }

    #[tokio::test]
    async fn cancellation_short_circuits_retries() {
        let policy = ResiliencePolicy::new(PolicyConfig::connection_reconnect());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<(), RetryOutcome<&str>> = policy.run(&cancel, || async { Err("boom") }).await;
        assert!(matches!(result, Err(RetryOutcome::Cancelled(_))));
    }
}
