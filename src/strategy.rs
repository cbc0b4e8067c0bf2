//! Flush trigger policies.
//!
//! A [`TriggerStrategy`] is evaluated every time an action is enqueued and
//! decides whether the pool should request a flush right away. Strategies read
//! pool-owned counters through a [`TriggerContext`]; they never touch the queue.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ActionType;

/// Threshold attached by the default `CountFromLast` strategy.
pub const DEFAULT_COUNT_THRESHOLD: u64 = 5;

/// Delay attached by the default `DelayFromLast` strategy.
pub const DEFAULT_DELAY: Duration = Duration::from_secs(60);

/// Policy deciding whether an enqueue should provoke an immediate flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerStrategy {
    /// Fires once `count` actions of the owning type were enqueued since the last successful flush.
    CountFromLast { count: u64 },
    /// Fires once more than `delay_ms` elapsed since the last successful flush.
    DelayFromLast { delay_ms: u64 },
}

impl TriggerStrategy {
    /// Fires on the `count`th enqueue since the last successful flush.
    #[must_use]
    pub const fn count_from_last(count: u64) -> Self {
        Self::CountFromLast { count }
    }

    /// Fires once `delay` has passed since the last successful flush.
    #[must_use]
    pub fn delay_from_last(delay: Duration) -> Self {
        Self::DelayFromLast {
            delay_ms: delay.as_millis().min(u128::from(u64::MAX)) as u64,
        }
    }

    /// `CountFromLast` with the default threshold.
    #[must_use]
    pub const fn count_from_last_default() -> Self {
        Self::count_from_last(DEFAULT_COUNT_THRESHOLD)
    }

    /// `DelayFromLast` with the default delay.
    #[must_use]
    pub fn delay_from_last_default() -> Self {
        Self::delay_from_last(DEFAULT_DELAY)
    }

    /// Fires on every enqueue of the owning type.
    #[must_use]
    pub const fn immediate() -> Self {
        Self::count_from_last(1)
    }

    /// Evaluates the policy. A zero count behaves like a count of one.
    #[must_use]
    pub fn should_fire(&self, ctx: &TriggerContext<'_>) -> bool {
        match *self {
            Self::CountFromLast { count } => ctx.count_since_flush() >= count.max(1),
            Self::DelayFromLast { delay_ms } => {
                let elapsed = ctx.elapsed_since_flush();
                elapsed > chrono::Duration::milliseconds(i64::try_from(delay_ms).unwrap_or(i64::MAX))
            }
        }
    }
}

/// Returns true if any of the strategies fires. Strategies are OR-combined.
#[must_use]
pub fn any_fires(strategies: &[TriggerStrategy], ctx: &TriggerContext<'_>) -> bool {
    strategies.iter().any(|s| s.should_fire(ctx))
}

/// Counters maintained by one pool between successful flushes.
#[derive(Debug, Clone)]
pub struct TriggerState {
    counts: HashMap<ActionType, u64>,
    last_flush_at: DateTime<Utc>,
}

impl TriggerState {
    /// Creates an empty state whose last flush is `now`.
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            counts: HashMap::new(),
            last_flush_at: now,
        }
    }

    /// Counts one enqueued action of the given type and returns the new count.
    pub fn record(&mut self, action_type: ActionType) -> u64 {
        let count = self.counts.entry(action_type).or_insert(0);
        *count += 1;
        *count
    }

    /// Actions of the given type enqueued since the last successful flush.
    #[must_use]
    pub fn count(&self, action_type: ActionType) -> u64 {
        self.counts.get(&action_type).copied().unwrap_or(0)
    }

    /// Time of the last successful flush (or pool start).
    #[must_use]
    pub const fn last_flush_at(&self) -> DateTime<Utc> {
        self.last_flush_at
    }

    /// Called after a successful flush only.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.counts.clear();
        self.last_flush_at = now;
    }

    /// Builds the evaluation context for an action of the given type.
    #[must_use]
    pub const fn context(&self, action_type: ActionType, now: DateTime<Utc>) -> TriggerContext<'_> {
        TriggerContext {
            action_type,
            state: self,
            now,
        }
    }
}

/// Read-only view handed to strategies.
#[derive(Debug, Clone, Copy)]
pub struct TriggerContext<'a> {
    action_type: ActionType,
    state: &'a TriggerState,
    now: DateTime<Utc>,
}

impl TriggerContext<'_> {
    /// Type of the action being enqueued.
    #[must_use]
    pub const fn action_type(&self) -> ActionType {
        self.action_type
    }

    /// Actions of this type since the last successful flush.
    #[must_use]
    pub fn count_since_flush(&self) -> u64 {
        self.state.count(self.action_type)
    }

    /// Time since the last successful flush.
    #[must_use]
    pub fn elapsed_since_flush(&self) -> chrono::Duration {
        self.now - self.state.last_flush_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_from_last_fires_at_threshold() {
        let now = Utc::now();
        let mut state = TriggerState::new(now);
        let strategy = TriggerStrategy::count_from_last(3);

        for expected in [false, false, true, true] {
            state.record(ActionType::Like);
            assert_eq!(strategy.should_fire(&state.context(ActionType::Like, now)), expected);
        }
    }

    #[test]
    fn test_counts_are_per_type() {
        let now = Utc::now();
        let mut state = TriggerState::new(now);
        state.record(ActionType::Like);
        state.record(ActionType::Like);
        state.record(ActionType::Unlike);

        let strategy = TriggerStrategy::count_from_last(2);
        assert!(strategy.should_fire(&state.context(ActionType::Like, now)));
        assert!(!strategy.should_fire(&state.context(ActionType::Unlike, now)));
    }

    #[test]
    fn test_delay_from_last() {
        let start = Utc::now();
        let state = TriggerState::new(start);
        let strategy = TriggerStrategy::delay_from_last(Duration::from_secs(30));

        let early = start + chrono::Duration::seconds(30);
        assert!(!strategy.should_fire(&state.context(ActionType::Like, early)));

        let late = start + chrono::Duration::seconds(31);
        assert!(strategy.should_fire(&state.context(ActionType::Like, late)));
    }

    #[test]
    fn test_reset_clears_counts_and_moves_flush_time() {
        let start = Utc::now();
        let mut state = TriggerState::new(start);
        state.record(ActionType::Like);
        state.record(ActionType::Like);

        let later = start + chrono::Duration::minutes(5);
        state.reset(later);
        assert_eq!(state.count(ActionType::Like), 0);
        assert_eq!(state.last_flush_at(), later);

        let strategy = TriggerStrategy::delay_from_last(Duration::from_secs(60));
        assert!(!strategy.should_fire(&state.context(ActionType::Like, later)));
    }

    #[test]
    fn test_strategies_or_combined() {
        let now = Utc::now();
        let mut state = TriggerState::new(now);
        state.record(ActionType::Unlike);

        let strategies = [
            TriggerStrategy::count_from_last(10),
            TriggerStrategy::delay_from_last(Duration::from_secs(1)),
        ];
        assert!(!any_fires(&strategies, &state.context(ActionType::Unlike, now)));

        let later = now + chrono::Duration::seconds(2);
        assert!(any_fires(&strategies, &state.context(ActionType::Unlike, later)));
        assert!(!any_fires(&[], &state.context(ActionType::Unlike, later)));
    }

    #[test]
    fn test_zero_count_behaves_like_one() {
        let now = Utc::now();
        let mut state = TriggerState::new(now);
        let strategy = TriggerStrategy::count_from_last(0);
        assert!(!strategy.should_fire(&state.context(ActionType::View, now)));
        state.record(ActionType::View);
        assert!(strategy.should_fire(&state.context(ActionType::View, now)));
    }
}
