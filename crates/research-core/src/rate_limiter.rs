//! Token bucket guarding outbound language-model calls.
//!
//! A single bucket instance is shared (via `Arc`) by every caller that talks
//! to the model service. The refill-check-debit step runs under an async
//! mutex; the guard is released before any waiting so other acquirers can
//! make progress while one sleeps.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

use crate::ResearchError;
use crate::config::RateLimitConfig;
use crate::metrics;
use crate::state::ConversationMessage;

/// Smallest sleep between retries; keeps float rounding from spinning.
const MIN_WAIT: Duration = Duration::from_millis(1);
/// Longest single sleep; long deficits are waited out in several rounds.
const MAX_WAIT: Duration = Duration::from_secs(60);
/// Rate used when the configured one is zero, negative or not finite.
const MIN_REFILL_PER_SECOND: f64 = 0.001;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl BucketState {
    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
    }
}

/// Token bucket with a fixed capacity and refill rate.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: u64,
    refill_per_second: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Create a full bucket.
    ///
    /// A refill rate that is not a positive finite number is raised to a
    /// small positive floor, so waiting always terminates.
    pub fn new(capacity: u64, refill_per_second: f64) -> Self {
        let refill_per_second = if refill_per_second.is_finite() && refill_per_second > 0.0 {
            refill_per_second
        } else {
            warn!(
                refill_per_second,
                floor = MIN_REFILL_PER_SECOND,
                "invalid refill rate; using the minimum"
            );
            MIN_REFILL_PER_SECOND
        };

        Self {
            capacity,
            refill_per_second,
            state: Mutex::new(BucketState {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.capacity, config.refill_per_second)
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn refill_per_second(&self) -> f64 {
        self.refill_per_second
    }

    /// Tokens available right now, after applying refill.
    pub async fn available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.capacity as f64, self.refill_per_second);
        state.tokens
    }

    /// Wait until `cost` tokens are available and debit them.
    ///
    /// Returns how long the caller was held back.
    pub async fn acquire(&self, cost: u64) -> Duration {
        let cost = self.effective_cost(cost);
        let started = Instant::now();
        loop {
            match self.try_debit(cost).await {
                Ok(()) => return debited(started),
                Err(wait) => sleep(wait).await,
            }
        }
    }

    /// Like [`TokenBucket::acquire`], but gives up with
    /// [`ResearchError::RateLimitTimeout`] once waiting would exceed `timeout`.
    /// A timed-out caller never debits anything.
    pub async fn acquire_with_timeout(
        &self,
        cost: u64,
        timeout: Duration,
    ) -> Result<Duration, ResearchError> {
        let cost = self.effective_cost(cost);
        let started = Instant::now();
        loop {
            let wait = match self.try_debit(cost).await {
                Ok(()) => return Ok(debited(started)),
                Err(wait) => wait,
            };

            let waited = started.elapsed();
            if waited.saturating_add(wait) > timeout {
                return Err(ResearchError::RateLimitTimeout {
                    cost,
                    waited_ms: waited.as_millis() as u64,
                });
            }
            sleep(wait).await;
        }
    }

    fn effective_cost(&self, cost: u64) -> u64 {
        if cost > self.capacity {
            warn!(
                cost,
                capacity = self.capacity,
                "request cost exceeds bucket capacity; clamping to capacity"
            );
            self.capacity
        } else {
            cost
        }
    }

    /// Refill, then debit `cost` if it is covered. Otherwise returns how long
    /// to sleep before the next attempt.
    async fn try_debit(&self, cost: u64) -> Result<(), Duration> {
        if cost == 0 {
            return Ok(());
        }

        let mut state = self.state.lock().await;
        state.refill(Instant::now(), self.capacity as f64, self.refill_per_second);
        if state.tokens >= cost as f64 {
            state.tokens -= cost as f64;
            debug!(cost, remaining = state.tokens, "rate limiter debited tokens");
            return Ok(());
        }

        let deficit = cost as f64 - state.tokens;
        let wait = Duration::try_from_secs_f64(deficit / self.refill_per_second)
            .unwrap_or(MAX_WAIT)
            .clamp(MIN_WAIT, MAX_WAIT);
        Err(wait)
    }
}

fn debited(started: Instant) -> Duration {
    let waited = started.elapsed();
    if !waited.is_zero() {
        debug!(waited_ms = waited.as_millis() as u64, "rate limiter held caller back");
    }
    metrics::record_rate_limit_wait(waited);
    waited
}

/// Conservative character-based token estimate for model requests.
#[derive(Debug, Clone, Copy)]
pub struct TokenEstimator {
    chars_per_token: f64,
}

impl TokenEstimator {
    pub fn new(chars_per_token: f64) -> Self {
        Self { chars_per_token }
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.chars_per_token)
    }

    /// `ceil(chars / chars_per_token)`.
    pub fn estimate(&self, text: &str) -> u64 {
        let chars = text.chars().count() as f64;
        (chars / self.chars_per_token).ceil() as u64
    }

    /// Input estimate over every message plus the response budget.
    pub fn request_cost(&self, messages: &[ConversationMessage], max_response_tokens: u32) -> u64 {
        let input: u64 = messages
            .iter()
            .map(|message| self.estimate(&message.serialized_content()))
            .sum();
        input + u64::from(max_response_tokens)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(3.5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn acquire_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(100, 10.0);
        let waited = bucket.acquire(60).await;
        assert_eq!(waited, Duration::ZERO);
        assert!((bucket.available().await - 40.0).abs() < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_waits_for_deficit_to_refill() {
        let bucket = TokenBucket::new(100, 10.0);
        bucket.acquire(100).await;

        let start = Instant::now();
        bucket.acquire(50).await;
        let elapsed = start.elapsed();

        assert!(elapsed >= Duration::from_millis(4_990), "waited {elapsed:?}");
        assert!(elapsed < Duration::from_millis(5_100), "waited {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_acquirers_never_overdraw() {
        let bucket = Arc::new(TokenBucket::new(50, 10.0));
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                bucket.acquire(10).await;
                let observed = bucket.available().await;
                assert!(observed >= 0.0, "observed {observed}");
                assert!(observed <= 50.0, "observed {observed}");
            }));
        }
        for handle in handles {
            handle.await.expect("acquirer task");
        }

        // 200 tokens requested, 50 up front: the other 150 need 15s of refill.
        assert!(start.elapsed() >= Duration::from_millis(14_900));
        let remaining = bucket.available().await;
        assert!((0.0..=50.0).contains(&remaining));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fails_without_debiting() {
        let bucket = TokenBucket::new(10, 1.0);
        bucket.acquire(10).await;

        let err = bucket
            .acquire_with_timeout(5, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::RateLimitTimeout { cost: 5, .. }));

        // The failed attempt left the refill untouched.
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(bucket.acquire_with_timeout(5, Duration::from_millis(10)).await.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn zero_refill_rate_still_terminates() {
        let bucket = TokenBucket::new(10, 0.0);
        assert!(bucket.refill_per_second() > 0.0);

        bucket.acquire(10).await;
        let err = bucket
            .acquire_with_timeout(10, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ResearchError::RateLimitTimeout { cost: 10, .. }));

        let negative = TokenBucket::new(10, -3.0);
        let nan = TokenBucket::new(10, f64::NAN);
        assert!(negative.refill_per_second() > 0.0);
        assert!(nan.refill_per_second() > 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn long_deficits_are_waited_out_in_rounds() {
        // 10 tokens at 0.1/s is 100s, longer than a single sleep.
        let bucket = TokenBucket::new(10, 0.1);
        bucket.acquire(10).await;

        let waited = bucket.acquire(10).await;
        assert!(waited >= Duration::from_secs(99), "waited {waited:?}");
        assert!(waited < Duration::from_secs(101), "waited {waited:?}");
        assert!(bucket.available().await < 1e-6);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_cost_never_waits() {
        let bucket = TokenBucket::new(10, 1.0);
        bucket.acquire(10).await;
        assert_eq!(bucket.acquire(0).await, Duration::ZERO);
        assert_eq!(
            bucket
                .acquire_with_timeout(0, Duration::ZERO)
                .await
                .unwrap(),
            Duration::ZERO
        );
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_cost_is_clamped_to_capacity() {
        let bucket = TokenBucket::new(20, 5.0);
        let waited = bucket.acquire(500).await;
        assert_eq!(waited, Duration::ZERO);
        assert!(bucket.available().await < 1e-6);
    }

    #[test]
    fn estimator_rounds_up() {
        let estimator = TokenEstimator::new(3.5);
        assert_eq!(estimator.estimate(""), 0);
        assert_eq!(estimator.estimate("abcdefg"), 2);
        assert_eq!(estimator.estimate("abcdefgh"), 3);
    }

    #[test]
    fn request_cost_adds_response_budget() {
        let estimator = TokenEstimator::new(3.5);
        let messages = vec![ConversationMessage::PlannerRequest {
            content: "x".repeat(35),
        }];
        assert_eq!(estimator.request_cost(&messages, 2000), 2010);
    }
}
