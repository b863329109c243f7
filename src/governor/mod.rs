//! Rate Governor: per-account in-memory token bucket plus a
//! flood-wait calendar. Shared across all jobs that use a given account —
//! the whole point is to keep concurrent jobs from tripping the account's
//! server-side rate limit together.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::sync::Mutex;

use crate::domain::AccountId;

/// Result of an `Acquire` call.
#[derive(Debug, Clone, Copy)]
pub enum Acquired {
    Granted,
    Wait(Duration),
}

struct RateState {
    window_start: Instant,
    sent_in_window: u32,
    flood_until: Option<Instant>,
}

impl RateState {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            sent_in_window: 0,
            flood_until: None,
        }
    }

    fn roll_window(&mut self, now: Instant) {
        if now.duration_since(self.window_start) >= Duration::from_secs(60) {
            self.window_start = now;
            self.sent_in_window = 0;
        }
    }
}

pub struct RateGovernor {
    accounts: Mutex<HashMap<AccountId, RateState>>,
}

impl Default for RateGovernor {
    fn default() -> Self {
        Self::new()
    }
}

impl RateGovernor {
    pub fn new() -> Self {
        Self {
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Grant a send token for `account_id`, or report how long the caller
    /// must wait. `max_per_minute` is the ceiling from the calling job's
    /// `RateParams` — accounts shared across jobs with different ceilings
    /// are checked against whichever caller is asking.
    pub async fn acquire(&self, account_id: &AccountId, max_per_minute: u32) -> Acquired {
        let now = Instant::now();
        let mut accounts = self.accounts.lock().await;
        let state = accounts
            .entry(account_id.clone())
            .or_insert_with(RateState::new);

        if let Some(until) = state.flood_until {
            if now < until {
                return Acquired::Wait(until - now);
            }
            state.flood_until = None;
        }

        state.roll_window(now);

        if state.sent_in_window >= max_per_minute {
            let wait = Duration::from_secs(60) - now.duration_since(state.window_start);
            return Acquired::Wait(wait);
        }

        state.sent_in_window += 1;
        Acquired::Granted
    }

    /// Record a server-signaled flood-wait: `flood_until = now + seconds +
    /// jitter(2..7s)` to desynchronize retries across jobs sharing the
    /// account.
    pub async fn note_flood_wait(&self, account_id: &AccountId, seconds: u64) {
        let jitter = rand::rng().random_range(2.0..7.0);
        let until = Instant::now() + Duration::from_secs(seconds) + Duration::from_secs_f64(jitter);
        let mut accounts = self.accounts.lock().await;
        accounts
            .entry(account_id.clone())
            .or_insert_with(RateState::new)
            .flood_until = Some(until);
    }

    /// Whether `account_id` is currently under a flood-wait.
    pub async fn is_eligible(&self, account_id: &AccountId) -> bool {
        let accounts = self.accounts.lock().await;
        match accounts.get(account_id) {
            Some(state) => state.flood_until.is_none_or(|until| Instant::now() >= until),
            None => true,
        }
    }

    /// Earliest instant at which `account_id` becomes eligible again, or
    /// `None` if it already is.
    pub async fn next_eligible_at(&self, account_id: &AccountId) -> Option<Instant> {
        let accounts = self.accounts.lock().await;
        accounts.get(account_id).and_then(|state| state.flood_until)
    }
}

/// Post-send sleep heuristic: not a correctness invariant, just throttling
/// texture so bursts of successes speed up and recent failures slow down.
pub fn dynamic_delay(base_secs: f64, consecutive_successes: u32, had_recent_failure: bool) -> Duration {
    let mut rng = rand::rng();
    let secs = if consecutive_successes > 20 {
        rng.random_range(0.5..base_secs.max(0.51))
    } else if had_recent_failure {
        rng.random_range(base_secs..base_secs * 3.0)
    } else {
        rng.random_range(base_secs * 0.8..base_secs * 1.2)
    };
    Duration::from_secs_f64(secs.max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_grants_under_cap_then_waits() {
        let gov = RateGovernor::new();
        let acct = "a1".to_string();
        for _ in 0..3 {
            assert!(matches!(gov.acquire(&acct, 3).await, Acquired::Granted));
        }
        assert!(matches!(gov.acquire(&acct, 3).await, Acquired::Wait(_)));
    }

    #[tokio::test]
    async fn flood_wait_blocks_until_elapsed() {
        let gov = RateGovernor::new();
        let acct = "a1".to_string();
        gov.note_flood_wait(&acct, 0).await;
        // jitter guarantees at least ~2s, so immediately after it's ineligible
        assert!(!gov.is_eligible(&acct).await);
        assert!(matches!(gov.acquire(&acct, 100).await, Acquired::Wait(_)));
    }

    #[tokio::test]
    async fn unknown_account_is_eligible() {
        let gov = RateGovernor::new();
        assert!(gov.is_eligible(&"unseen".to_string()).await);
    }

    #[test]
    fn dynamic_delay_bounds() {
        let d = dynamic_delay(2.0, 25, false);
        assert!(d.as_secs_f64() <= 2.0);
        let d = dynamic_delay(2.0, 1, true);
        assert!(d.as_secs_f64() >= 2.0 && d.as_secs_f64() <= 6.0);
    }
}
