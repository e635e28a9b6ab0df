use indexmap::IndexMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

use crate::error::BackoffError;

/// Why a retry slept.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BackoffReason {
    /// The region map no longer knows one of the regions we asked about.
    RegionMiss,
    /// A storage-node RPC failed or its response stream broke.
    Rpc,
}

impl BackoffReason {
    /// First sleep for this reason. Region misses resolve as soon as the map
    /// refreshes, RPC failures need the node to come back.
    fn base_ms(self) -> u64 {
        match self {
            BackoffReason::RegionMiss => 2,
            BackoffReason::Rpc => 100,
        }
    }

    /// Cap on a single sleep for this reason.
    fn cap_ms(self) -> u64 {
        match self {
            BackoffReason::RegionMiss => 500,
            BackoffReason::Rpc => 10_000,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackoffReason::RegionMiss => "region-miss",
            BackoffReason::Rpc => "rpc",
        }
    }
}

impl fmt::Display for BackoffReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct ReasonStat {
    slept: Duration,
    times: u32,
    attempt: u32,
}

/// Per-request retry pacer and latency ledger.
///
/// Sleeps double per attempt of a reason, capped per reason, and the sum over
/// all reasons is bounded by the budget. Crossing the budget turns the retry
/// into a terminal error carrying the last cause. The accounting side feeds
/// the runtime stats attached to every response record.
///
/// Never shared between workers: each worker paces itself.
#[derive(Debug)]
pub struct Backoff {
    budget: Duration,
    total_slept: Duration,
    reasons: IndexMap<BackoffReason, ReasonStat>,
}

impl Backoff {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            total_slept: Duration::ZERO,
            reasons: IndexMap::new(),
        }
    }

    /// Sleep once for `reason`, or fail when the sleep would cross the
    /// budget.
    pub async fn backoff(
        &mut self,
        reason: BackoffReason,
        cause: impl fmt::Display,
    ) -> Result<(), BackoffError> {
        let stat = self.reasons.entry(reason).or_default();
        let exp = stat.attempt.min(16);
        let sleep_ms = reason
            .base_ms()
            .checked_shl(exp)
            .unwrap_or(u64::MAX)
            .min(reason.cap_ms());
        let sleep = Duration::from_millis(sleep_ms);
        if self.total_slept + sleep > self.budget {
            return Err(BackoffError {
                reason,
                budget_ms: self.budget.as_millis() as u64,
                cause: cause.to_string(),
            });
        }
        stat.attempt += 1;
        stat.times += 1;
        stat.slept += sleep;
        self.total_slept += sleep;
        debug!(
            reason = %reason,
            sleep_ms,
            total_ms = self.total_slept.as_millis() as u64,
            cause = %cause,
            "backing off",
        );
        tokio::time::sleep(sleep).await;
        Ok(())
    }

    /// Total time slept so far, across every reason.
    pub fn total_sleep(&self) -> Duration {
        self.total_slept
    }

    /// Time slept for one reason.
    pub fn sleep_for(&self, reason: BackoffReason) -> Duration {
        self.reasons
            .get(&reason)
            .map(|stat| stat.slept)
            .unwrap_or_default()
    }

    /// How many times one reason slept.
    pub fn times_for(&self, reason: BackoffReason) -> u32 {
        self.reasons
            .get(&reason)
            .map(|stat| stat.times)
            .unwrap_or_default()
    }

    /// Every reason seen so far with its slept time and count, in first-seen
    /// order.
    pub fn reasons(&self) -> impl Iterator<Item = (BackoffReason, Duration, u32)> + '_ {
        self.reasons
            .iter()
            .map(|(reason, stat)| (*reason, stat.slept, stat.times))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn sleeps_double_until_the_cap() {
        let mut bo = Backoff::new(Duration::from_secs(60));
        for _ in 0..12 {
            bo.backoff(BackoffReason::RegionMiss, "stale map")
                .await
                .expect("within budget");
        }
        // 2 + 4 + ... doubling, each term capped at 500ms
        assert_eq!(bo.times_for(BackoffReason::RegionMiss), 12);
        let slept = bo.sleep_for(BackoffReason::RegionMiss);
        assert!(slept < Duration::from_millis(12 * 500));
        assert_eq!(bo.total_sleep(), slept);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_is_terminal() {
        let mut bo = Backoff::new(Duration::from_millis(250));
        let mut failed = None;
        for _ in 0..32 {
            if let Err(err) = bo.backoff(BackoffReason::Rpc, "recv failed").await {
                failed = Some(err);
                break;
            }
        }
        let err = failed.expect("budget must run out");
        assert_eq!(err.reason, BackoffReason::Rpc);
        assert_eq!(err.cause, "recv failed");
        assert!(bo.total_sleep() <= Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn reasons_account_independently() {
        let mut bo = Backoff::new(Duration::from_secs(10));
        bo.backoff(BackoffReason::RegionMiss, "miss")
            .await
            .expect("within budget");
        bo.backoff(BackoffReason::Rpc, "recv")
            .await
            .expect("within budget");
        assert_eq!(bo.times_for(BackoffReason::RegionMiss), 1);
        assert_eq!(bo.times_for(BackoffReason::Rpc), 1);
        assert_eq!(
            bo.total_sleep(),
            bo.sleep_for(BackoffReason::RegionMiss) + bo.sleep_for(BackoffReason::Rpc)
        );
        assert_eq!(bo.reasons().count(), 2);
    }
}
