//! Generic circuit breaker (C10): wraps any outbound async call (Cache
//! primary, relay HTTP probes) with failure isolation independent per callee.

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::CoreError;

/// Injectable time source so breaker tests can advance time deterministically
/// instead of sleeping in wall-clock time (§9 design note).
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub call_timeout: Duration,
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            call_timeout: Duration::from_secs(1),
            reset_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
    timeouts: AtomicU64,
    consecutive_failures: AtomicU32,
    consecutive_successes: AtomicU32,
}

struct Inner {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
}

/// A named circuit breaker guarding a single callee (a relay, the cache
/// primary, ...). Stats are guarded by a plain mutex held only across the
/// state transition; the wrapped call always runs outside any lock (§5).
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    clock: Arc<dyn Clock>,
    inner: RwLock<Inner>,
    counters: Counters,
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    pub rejected: u64,
    pub timeouts: u64,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub success_rate_pct: f64,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(name: impl Into<String>, config: BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: RwLock::new(Inner { state: CircuitState::Closed, opened_at: None }),
            counters: Counters::default(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.read().expect("breaker lock poisoned").state
    }

    /// Run `f` through the breaker. Rejects immediately with
    /// `CoreError::BreakerOpen` while `OPEN` and `reset_timeout` has not
    /// elapsed; otherwise runs `f` under `call_timeout` and records the
    /// outcome.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.counters.total.fetch_add(1, Ordering::SeqCst);

        if !self.allow_request() {
            self.counters.rejected.fetch_add(1, Ordering::SeqCst);
            return Err(CoreError::BreakerOpen(format!("circuit '{}' is open", self.name)));
        }

        match tokio::time::timeout(self.config.call_timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.on_failure();
                Err(err)
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::SeqCst);
                self.on_failure();
                Err(CoreError::ServiceUnavailable(format!("circuit '{}' call timed out", self.name)))
            }
        }
    }

    fn allow_request(&self) -> bool {
        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed_ok = inner
                    .opened_at
                    .map(|opened| self.clock.now() - opened >= chrono::Duration::from_std(self.config.reset_timeout).unwrap())
                    .unwrap_or(false);
                if elapsed_ok {
                    info!(breaker = %self.name, "reset_timeout elapsed, transitioning to HALF_OPEN");
                    inner.state = CircuitState::HalfOpen;
                    self.counters.consecutive_successes.store(0, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            }
        }
    }

    fn on_success(&self) {
        self.counters.successful.fetch_add(1, Ordering::SeqCst);
        self.counters.consecutive_failures.store(0, Ordering::SeqCst);

        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::Closed => {}
            CircuitState::HalfOpen => {
                let successes = self.counters.consecutive_successes.fetch_add(1, Ordering::SeqCst) + 1;
                if successes >= self.config.success_threshold {
                    debug!(breaker = %self.name, "success_threshold reached, closing breaker");
                    inner.state = CircuitState::Closed;
                    inner.opened_at = None;
                    self.counters.consecutive_successes.store(0, Ordering::SeqCst);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self) {
        self.counters.failed.fetch_add(1, Ordering::SeqCst);
        self.counters.consecutive_successes.store(0, Ordering::SeqCst);

        let mut inner = self.inner.write().expect("breaker lock poisoned");
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(breaker = %self.name, "failure in HALF_OPEN, reopening");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(self.clock.now());
                self.counters.consecutive_failures.store(0, Ordering::SeqCst);
            }
            CircuitState::Closed => {
                let failures = self.counters.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                if failures >= self.config.failure_threshold {
                    warn!(breaker = %self.name, failures, "failure_threshold reached, opening breaker");
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(self.clock.now());
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().expect("breaker lock poisoned");
        let total = self.counters.total.load(Ordering::SeqCst);
        let successful = self.counters.successful.load(Ordering::SeqCst);
        let failed = self.counters.failed.load(Ordering::SeqCst);
        let success_rate_pct = if total == 0 { 100.0 } else { successful as f64 / total as f64 * 100.0 };
        let next_attempt_at = match inner.state {
            CircuitState::Open => inner
                .opened_at
                .map(|opened| opened + chrono::Duration::from_std(self.config.reset_timeout).unwrap()),
            _ => None,
        };

        CircuitBreakerStats {
            total,
            successful,
            failed,
            rejected: self.counters.rejected.load(Ordering::SeqCst),
            timeouts: self.counters.timeouts.load(Ordering::SeqCst),
            state: inner.state,
            failure_count: self.counters.consecutive_failures.load(Ordering::SeqCst),
            success_count: self.counters.consecutive_successes.load(Ordering::SeqCst),
            success_rate_pct,
            next_attempt_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeClock(Mutex<DateTime<Utc>>);

    impl FakeClock {
        fn new() -> Arc<Self> {
            Arc::new(Self(Mutex::new(Utc::now())))
        }

        fn advance(&self, d: chrono::Duration) {
            let mut t = self.0.lock().unwrap();
            *t += d;
        }
    }

    impl Clock for FakeClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn breaker_with_clock(clock: Arc<FakeClock>) -> CircuitBreaker {
        CircuitBreaker::with_clock(
            "test",
            BreakerConfig {
                failure_threshold: 3,
                success_threshold: 2,
                call_timeout: Duration::from_millis(50),
                reset_timeout: Duration::from_secs(5),
            },
            clock as Arc<dyn Clock>,
        )
    }

    async fn fail() -> Result<(), CoreError> {
        Err(CoreError::ServiceUnavailable("boom".into()))
    }

    async fn ok() -> Result<(), CoreError> {
        Ok(())
    }

    #[tokio::test]
    async fn opens_after_exactly_failure_threshold() {
        let breaker = breaker_with_clock(FakeClock::new());
        assert_eq!(breaker.state(), CircuitState::Closed);

        for _ in 0..2 {
            let _ = breaker.call(fail).await;
            assert_eq!(breaker.state(), CircuitState::Closed);
        }
        let _ = breaker.call(fail).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn rejects_immediately_while_open() {
        let breaker = breaker_with_clock(FakeClock::new());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);
        let result = breaker.call(ok).await;
        assert!(matches!(result, Err(CoreError::BreakerOpen(_))));
        assert_eq!(breaker.stats().rejected, 1);
    }

    #[tokio::test]
    async fn half_opens_after_reset_timeout_and_closes_after_success_threshold() {
        let clock = FakeClock::new();
        let breaker = breaker_with_clock(clock.clone());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        clock.advance(chrono::Duration::seconds(6));
        let _ = breaker.call(ok).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = breaker.call(ok).await;
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn single_failure_in_half_open_reopens() {
        let clock = FakeClock::new();
        let breaker = breaker_with_clock(clock.clone());
        for _ in 0..3 {
            let _ = breaker.call(fail).await;
        }
        clock.advance(chrono::Duration::seconds(6));
        let _ = breaker.call(ok).await;
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let _ = breaker.call(fail).await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn timeout_counts_as_failure_and_is_tracked_separately() {
        let breaker = CircuitBreaker::new(
            "slow",
            BreakerConfig {
                failure_threshold: 1,
                success_threshold: 1,
                call_timeout: Duration::from_millis(10),
                reset_timeout: Duration::from_secs(5),
            },
        );
        let result = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok::<(), CoreError>(())
            })
            .await;
        assert!(result.is_err());
        let stats = breaker.stats();
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
