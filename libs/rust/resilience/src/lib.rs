//! Resilience utilities for outbound collaborators: retry with backoff + circuit breaker.
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use parking_lot::Mutex;
use tracing::{warn, debug};
use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};
use rand::{thread_rng, Rng};

static RETRY_ATTEMPTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("registry_resilience_retry_attempts_total", "Total retry attempts executed")
        .expect("retry counter registration")
});

static CIRCUIT_OPEN: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("registry_resilience_breaker_open_total", "Number of times a circuit transitioned to open")
        .expect("breaker counter registration")
});

#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    #[error("circuit open")] CircuitOpen,
    #[error(transparent)] Inner(E),
}

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64, // 0.0 - 1.0
}
impl Default for RetryConfig { fn default() -> Self { Self { max_retries: 3, base_delay: Duration::from_millis(50), max_delay: Duration::from_millis(1500), jitter: 0.25 } } }

impl RetryConfig {
    fn delay_for(&self, attempt: usize) -> Duration {
        let exp = self.base_delay.mul_f64(2f64.powi(attempt as i32));
        let delay = std::cmp::min(exp, self.max_delay);
        if self.jitter <= 0.0 { return delay; }
        let jitter_ms = (delay.as_millis() as f64 * self.jitter) as i64;
        let offset: i64 = thread_rng().gen_range(-jitter_ms..=jitter_ms);
        Duration::from_millis((delay.as_millis() as i64 + offset).max(0) as u64)
    }
}

/// Runs `op` until it succeeds or `max_retries` extra attempts are spent.
/// The attempt index (0-based) is passed to `op`.
pub async fn retry_async<F, Fut, T, E>(cfg: &RetryConfig, mut op: F) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        RETRY_ATTEMPTS.inc();
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) if attempt >= cfg.max_retries => return Err(e),
            Err(e) => {
                let delay = cfg.delay_for(attempt);
                debug!(attempt, error=%e, delay_ms=delay.as_millis() as u64, "retry_scheduled");
                tokio::time::sleep(delay).await;
            }
        }
        attempt += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState { Closed, Open, HalfOpen }

pub struct CircuitBreaker {
    state: Mutex<State>,
    half_open_after: Duration,
    failure_threshold: u32,
}

struct State { failures: u32, opened_at: Option<Instant>, trial: bool }

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, half_open_after: Duration) -> Self {
        Self { state: Mutex::new(State { failures: 0, opened_at: None, trial: false }), half_open_after, failure_threshold: failure_threshold.max(1) }
    }

    pub fn state(&self) -> BreakerState {
        let st = self.state.lock();
        match st.opened_at {
            None if st.trial => BreakerState::HalfOpen,
            None => BreakerState::Closed,
            Some(opened) if opened.elapsed() >= self.half_open_after => BreakerState::HalfOpen,
            Some(_) => BreakerState::Open,
        }
    }

    pub fn allow(&self) -> bool {
        let mut st = self.state.lock();
        if let Some(opened) = st.opened_at {
            if opened.elapsed() >= self.half_open_after { debug!("half-open trial"); st.opened_at = None; st.trial = true; return true; }
            return false;
        }
        true
    }

    pub fn record_success(&self) { let mut st = self.state.lock(); st.failures = 0; st.trial = false; }

    pub fn record_failure(&self) {
        let mut st = self.state.lock();
        st.failures += 1;
        if (st.trial || st.failures >= self.failure_threshold) && st.opened_at.is_none() {
            st.opened_at = Some(Instant::now());
            st.trial = false;
            CIRCUIT_OPEN.inc();
            warn!(failures = st.failures, "circuit opened");
        }
    }

    /// Runs `op` unless the circuit is open, recording the outcome.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, ResilienceError<E>>
    where F: FnOnce() -> Fut, Fut: Future<Output = Result<T, E>> {
        if !self.allow() { return Err(ResilienceError::CircuitOpen); }
        match op().await {
            Ok(v) => { self.record_success(); Ok(v) }
            Err(e) => { self.record_failure(); Err(ResilienceError::Inner(e)) }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn retry_eventual_success() {
        let cfg = RetryConfig { max_retries: 3, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(5), jitter: 0.0 };
        let mut attempts = 0;
        let res: Result<u32, &str> = retry_async(&cfg, |_i| { attempts += 1; let n = attempts; async move { if n < 3 { Err("fail") } else { Ok(42) } } }).await;
        assert_eq!(res.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn retry_gives_up_after_budget() {
        let cfg = RetryConfig { max_retries: 2, base_delay: Duration::from_millis(1), max_delay: Duration::from_millis(2), jitter: 0.5 };
        let mut attempts = 0;
        let res: Result<(), &str> = retry_async(&cfg, |_| { attempts += 1; async { Err("boom") } }).await;
        assert_eq!(res.unwrap_err(), "boom");
        assert_eq!(attempts, 3);
    }

    #[tokio::test]
    async fn breaker_opens_then_half_opens() {
        let cb = CircuitBreaker::new(2, Duration::from_millis(5));
        for _ in 0..2 { let _ = cb.call(|| async { Err::<(), _>("boom") }).await; }
        assert_eq!(cb.state(), BreakerState::Open);
        let blocked = cb.call(|| async { Ok::<(), &str>(()) }).await;
        assert!(matches!(blocked, Err(ResilienceError::CircuitOpen)));
        tokio::time::sleep(Duration::from_millis(8)).await;
        assert!(cb.call(|| async { Ok::<(), &str>(()) }).await.is_ok());
        assert_eq!(cb.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn failed_trial_reopens() {
        let cb = CircuitBreaker::new(1, Duration::from_millis(2));
        let _ = cb.call(|| async { Err::<(), _>("boom") }).await;
        tokio::time::sleep(Duration::from_millis(4)).await;
        let _ = cb.call(|| async { Err::<(), _>("still down") }).await;
        assert_eq!(cb.state(), BreakerState::Open);
    }
}
