//! Keyed timer table.
//!
//! One slot per [`TimerKind`]. Arming a slot replaces its previous deadline,
//! so repeated connect/disconnect cycles can never stack timers. The driver
//! sleeps until [`TimerTable::next_deadline`] and then hands due slots back to
//! the manager via [`TimerTable::take_due`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    FastWatchdog,
    SlowWatchdog,
    StatusStall,
    AutoReconnect,
    /// Cooldown between the steps of a Full or Deep attempt.
    RecoveryStep,
    /// Backoff before retrying after a failed attempt.
    RecoveryRetry,
    /// Trailing identity fetch after a debounced request.
    AccountFetch,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TimerTable {
    slots: BTreeMap<TimerKind, DateTime<Utc>>,
}

impl TimerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when an existing deadline was replaced.
    pub fn arm(&mut self, kind: TimerKind, deadline: DateTime<Utc>) -> bool {
        self.slots.insert(kind, deadline).is_some()
    }

    /// Arms only if the slot is empty; returns true when armed.
    pub fn arm_if_idle(&mut self, kind: TimerKind, deadline: DateTime<Utc>) -> bool {
        if self.slots.contains_key(&kind) {
            return false;
        }
        self.slots.insert(kind, deadline);
        true
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        self.slots.remove(&kind).is_some()
    }

    pub fn is_armed(&self, kind: TimerKind) -> bool {
        self.slots.contains_key(&kind)
    }

    pub fn deadline(&self, kind: TimerKind) -> Option<DateTime<Utc>> {
        self.slots.get(&kind).copied()
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.slots.values().min().copied()
    }

    /// Removes and returns every slot due at `now`, earliest first.
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<TimerKind> {
        let mut due: Vec<(DateTime<Utc>, TimerKind)> = self
            .slots
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(kind, deadline)| (*deadline, *kind))
            .collect();
        due.sort();
        for (_, kind) in &due {
            self.slots.remove(kind);
        }
        due.into_iter().map(|(_, kind)| kind).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn rearming_replaces_instead_of_stacking() {
        let now = Utc::now();
        let mut timers = TimerTable::new();
        for offset in 0..5 {
            timers.arm(TimerKind::FastWatchdog, now + Duration::seconds(offset));
        }
        assert_eq!(timers.active_count(), 1);
        assert_eq!(
            timers.deadline(TimerKind::FastWatchdog),
            Some(now + Duration::seconds(4))
        );
    }

    #[test]
    fn arm_if_idle_keeps_existing_deadline() {
        let now = Utc::now();
        let mut timers = TimerTable::new();
        assert!(timers.arm_if_idle(TimerKind::AccountFetch, now));
        assert!(!timers.arm_if_idle(TimerKind::AccountFetch, now + Duration::seconds(9)));
        assert_eq!(timers.deadline(TimerKind::AccountFetch), Some(now));
    }

    #[test]
    fn take_due_returns_in_deadline_order_and_removes() {
        let now = Utc::now();
        let mut timers = TimerTable::new();
        timers.arm(TimerKind::SlowWatchdog, now - Duration::seconds(1));
        timers.arm(TimerKind::FastWatchdog, now - Duration::seconds(5));
        timers.arm(TimerKind::StatusStall, now + Duration::seconds(30));

        assert_eq!(
            timers.take_due(now),
            vec![TimerKind::FastWatchdog, TimerKind::SlowWatchdog]
        );
        assert_eq!(timers.active_count(), 1);
        assert_eq!(timers.next_deadline(), Some(now + Duration::seconds(30)));
    }
}
