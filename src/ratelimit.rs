//! C8: sliding-window rate limiter with escalating-backoff block on
//! consecutive failures (§4.8). Consolidates the spec's own note that one
//! source module spells the initial cooldown 30s and another 5min — this
//! adopts the escalating-from-30s formulation per §9.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;

pub struct RateLimitConfig {
    pub window_secs: i64,
    pub max_attempts: usize,
    pub failure_threshold: u32,
    pub block_initial_secs: i64,
    pub block_cap_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: 60,
            max_attempts: 10,
            failure_threshold: 5,
            block_initial_secs: 30,
            block_cap_secs: 300,
        }
    }
}

#[derive(Default)]
struct RateState {
    attempts: VecDeque<DateTime<Utc>>,
    consecutive_failures: u32,
    blocked_until: Option<DateTime<Utc>>,
    block_duration_secs: i64,
}

pub enum AllowResult {
    Allowed,
    Denied { retry_after_secs: u64 },
}

pub struct RateLimiter {
    config: RateLimitConfig,
    states: RwLock<HashMap<u64, RateState>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            states: RwLock::new(HashMap::new()),
        }
    }

    pub async fn allow(&self, id: u64) -> AllowResult {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let state = states.entry(id).or_default();

        if let Some(blocked_until) = state.blocked_until {
            if now < blocked_until {
                let retry_after = (blocked_until - now).num_seconds().max(0) as u64;
                return AllowResult::Denied {
                    retry_after_secs: retry_after,
                };
            }
        }

        let window_start = now - chrono::Duration::seconds(self.config.window_secs);
        while matches!(state.attempts.front(), Some(t) if *t < window_start) {
            state.attempts.pop_front();
        }

        if state.attempts.len() >= self.config.max_attempts {
            let oldest = *state.attempts.front().unwrap();
            let retry_after =
                (oldest + chrono::Duration::seconds(self.config.window_secs) - now)
                    .num_seconds()
                    .max(1) as u64;
            return AllowResult::Denied {
                retry_after_secs: retry_after,
            };
        }

        state.attempts.push_back(now);
        AllowResult::Allowed
    }

    pub async fn record_failure(&self, id: u64) {
        let now = Utc::now();
        let mut states = self.states.write().await;
        let state = states.entry(id).or_default();
        state.consecutive_failures += 1;

        // A new block is triggered every time the failure count crosses a
        // fresh multiple of the threshold (5, 10, 15, ...), escalating the
        // duration each time rather than on every failure past the first
        // block — matches §8's "5 ⇒ initial; 10 ⇒ initial×2" boundary table.
        if state.consecutive_failures % self.config.failure_threshold == 0 {
            let is_first_block = state.block_duration_secs == 0;
            state.block_duration_secs = if is_first_block {
                self.config.block_initial_secs
            } else {
                (state.block_duration_secs * 2).min(self.config.block_cap_secs)
            };
            state.blocked_until = Some(now + chrono::Duration::seconds(state.block_duration_secs));
        }
    }

    pub async fn record_success(&self, id: u64) {
        let mut states = self.states.write().await;
        if let Some(state) = states.get_mut(&id) {
            state.consecutive_failures = 0;
            state.block_duration_secs = 0;
            state.blocked_until = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[tokio::test]
    async fn tenth_attempt_allowed_eleventh_denied() {
        let limiter = test_limiter();
        for _ in 0..10 {
            assert!(matches!(limiter.allow(1).await, AllowResult::Allowed));
        }
        assert!(matches!(
            limiter.allow(1).await,
            AllowResult::Denied { .. }
        ));
    }

    #[tokio::test]
    async fn escalating_block_doubles_and_caps() {
        let limiter = test_limiter();

        for _ in 0..5 {
            limiter.record_failure(1).await;
        }
        match limiter.allow(1).await {
            AllowResult::Denied { retry_after_secs } => assert!(retry_after_secs <= 30 && retry_after_secs > 0),
            AllowResult::Allowed => panic!("expected block after 5 failures"),
        }

        limiter.record_success(1).await;
        assert!(matches!(limiter.allow(1).await, AllowResult::Allowed));

        for _ in 0..5 {
            limiter.record_failure(2).await;
        }
        for _ in 0..5 {
            limiter.record_failure(2).await;
        }
        match limiter.allow(2).await {
            AllowResult::Denied { retry_after_secs } => assert!(retry_after_secs <= 60),
            AllowResult::Allowed => panic!("expected second escalation"),
        }
    }

    #[tokio::test]
    async fn four_failures_still_permitted() {
        let limiter = test_limiter();
        for _ in 0..4 {
            limiter.record_failure(1).await;
        }
        assert!(matches!(limiter.allow(1).await, AllowResult::Allowed));
    }

    #[tokio::test]
    async fn record_success_resets_failures() {
        let limiter = test_limiter();
        for _ in 0..5 {
            limiter.record_failure(1).await;
        }
        limiter.record_success(1).await;
        assert!(matches!(limiter.allow(1).await, AllowResult::Allowed));
    }
}
