use crate::summarize::config::RateLimitConfig;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetWait {
    Granted,
    Cancelled,
    TimedOut { waited: Duration },
}

#[derive(Debug)]
struct BucketState {
    available: u64,
    last_refill: Instant,
}

/// Per-minute token bucket shared by every dispatch group of a process.
///
/// Refill is minute-granular: a check less than a minute after the last
/// refill sees no partial credit. Reservations only check the balance; the
/// provider-reported usage is deducted afterwards with [`RateLimiter::deduct`].
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u64,
    safety_ratio: f64,
    poll_interval: Duration,
    state: Mutex<BucketState>,
}

impl RateLimiter {
    pub fn new(capacity: u64, safety_ratio: f64, poll_interval: Duration) -> Self {
        Self {
            capacity,
            safety_ratio,
            poll_interval,
            state: Mutex::new(BucketState {
                available: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(cfg: &RateLimitConfig) -> Self {
        Self::new(cfg.tokens_per_minute, cfg.safety_ratio, cfg.poll_interval())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn margin(&self) -> u64 {
        (self.capacity as f64 * self.safety_ratio).ceil() as u64
    }

    fn refill_locked(&self, state: &mut BucketState, now: Instant) {
        let elapsed_minutes = now.duration_since(state.last_refill).as_secs_f64() / 60.0;
        if elapsed_minutes >= 1.0 {
            let credit = (self.capacity as f64 * elapsed_minutes).floor() as u64;
            state.available = state.available.saturating_add(credit).min(self.capacity);
            state.last_refill = now;
        }
    }

    pub fn available(&self) -> u64 {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, Instant::now());
        state.available
    }

    /// True when `needed` plus the safety margin fits the current balance.
    /// Requests larger than the usable capacity are clamped to it, otherwise
    /// they could never be granted.
    pub fn try_reserve(&self, needed: u64) -> bool {
        let margin = self.margin();
        let needed = needed.min(self.capacity.saturating_sub(margin));
        let mut state = self.state.lock();
        self.refill_locked(&mut state, Instant::now());
        state.available >= needed.saturating_add(margin)
    }

    pub fn deduct(&self, used: u64) {
        let mut state = self.state.lock();
        self.refill_locked(&mut state, Instant::now());
        state.available = state.available.saturating_sub(used);
    }

    /// Polls [`RateLimiter::try_reserve`] every poll interval until granted,
    /// cancelled, or `max_wait` has elapsed.
    pub async fn wait_for(
        &self,
        needed: u64,
        cancel: &CancellationToken,
        max_wait: Duration,
    ) -> BudgetWait {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return BudgetWait::Cancelled;
            }
            if self.try_reserve(needed) {
                return BudgetWait::Granted;
            }
            let waited = started.elapsed();
            if waited >= max_wait {
                return BudgetWait::TimedOut { waited };
            }
            debug!(needed, available = self.available(), "token budget low, waiting");
            tokio::select! {
                _ = cancel.cancelled() => return BudgetWait::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BudgetWait, RateLimiter};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn limiter(capacity: u64) -> RateLimiter {
        RateLimiter::new(capacity, 0.10, Duration::from_secs(5))
    }

    #[tokio::test(start_paused = true)]
    async fn reserve_requires_safety_margin() {
        let rl = limiter(1000);
        assert!(rl.try_reserve(900));
        assert!(!rl.try_reserve(901));
        // reservation does not deduct
        assert_eq!(rl.available(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn deduct_never_goes_negative() {
        let rl = limiter(1000);
        rl.deduct(600);
        rl.deduct(600);
        assert_eq!(rl.available(), 0);
        assert!(!rl.try_reserve(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refill_is_minute_granular() {
        let rl = limiter(1000);
        rl.deduct(800);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(rl.available(), 200);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(rl.available(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_minute_restores_full_capacity_without_overflow() {
        let rl = limiter(1000);
        rl.deduct(10);
        tokio::time::advance(Duration::from_secs(180)).await;
        assert_eq!(rl.available(), 1000);
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_request_is_clamped_to_usable_capacity() {
        let rl = limiter(1000);
        assert!(rl.try_reserve(50_000));
        rl.deduct(1);
        assert!(!rl.try_reserve(50_000));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_is_granted_after_refill() {
        let rl = Arc::new(limiter(1000));
        rl.deduct(1000);
        let cancel = CancellationToken::new();
        let outcome = rl.wait_for(500, &cancel, Duration::from_secs(300)).await;
        assert_eq!(outcome, BudgetWait::Granted);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_observes_cancellation() {
        let rl = Arc::new(limiter(1000));
        rl.deduct(1000);
        let cancel = CancellationToken::new();
        let waiter = {
            let rl = Arc::clone(&rl);
            let cancel = cancel.clone();
            tokio::spawn(async move { rl.wait_for(500, &cancel, Duration::from_secs(300)).await })
        };
        tokio::time::advance(Duration::from_secs(7)).await;
        cancel.cancel();
        let outcome = waiter.await.expect("join");
        assert_eq!(outcome, BudgetWait::Cancelled);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_times_out_at_ceiling() {
        let rl = limiter(1000);
        rl.deduct(1000);
        let cancel = CancellationToken::new();
        let outcome = rl.wait_for(500, &cancel, Duration::from_secs(30)).await;
        match outcome {
            BudgetWait::TimedOut { waited } => assert!(waited >= Duration::from_secs(30)),
            other => panic!("expected timeout, got {other:?}"),
        }
    }
}
