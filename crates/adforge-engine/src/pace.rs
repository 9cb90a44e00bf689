use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::{Duration, Instant};

/// Paces calls to one provider at a fixed rate.
///
/// A single mutex guards the last-release instant; callers queue on the lock
/// and sleep out their share of the interval while holding it, which gives
/// best-effort FIFO ordering. `wait` cannot fail.
pub(crate) struct RateLimiter {
    interval: Duration,
    last_release: tokio::sync::Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub(crate) fn new(calls_per_second: f64) -> Self {
        let calls_per_second = calls_per_second.max(0.001);
        Self {
            interval: Duration::from_secs_f64(1.0 / calls_per_second),
            last_release: tokio::sync::Mutex::new(None),
        }
    }

    pub(crate) async fn wait(&self) {
        let mut last = self.last_release.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.interval;
            let now = Instant::now();
            if next > now {
                tokio::time::sleep(next - now).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Disables a failing provider after `threshold` consecutive failures and
/// half-opens it again once `cooldown` has elapsed.
///
/// The `is_open` probe both tests and transitions: the first probe after the
/// cooldown clears the open state and grants one trial call. Concurrent
/// probers racing on that edge may each get the trial; that is acceptable.
pub(crate) struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub(crate) fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            state: Mutex::new(BreakerState::default()),
        }
    }

    pub(crate) fn record_success(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures = 0;
        state.opened_at = None;
    }

    pub(crate) fn record_failure(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold {
            state.opened_at = Some(Instant::now());
            tracing::warn!(
                failures = state.consecutive_failures,
                "circuit breaker open"
            );
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(opened_at) = state.opened_at else {
            return false;
        };
        if opened_at.elapsed() > self.cooldown {
            tracing::info!("circuit breaker half-open, allowing retry");
            state.opened_at = None;
            state.consecutive_failures = 0;
            return false;
        }
        true
    }
}
