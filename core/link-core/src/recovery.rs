//! Tiered, rate-limited recovery.
//!
//! Tiers escalate `Simple -> Full -> Deep`:
//!
//! - **Simple**: `repairConnection()`.
//! - **Full**: `disconnect(false)`, cooldown, `connect(intent.deleted)`.
//! - **Deep**: `resetSession()`, longer cooldown, `connect(true)`.
//!
//! Exactly one attempt may be pending; requests that arrive while an attempt
//! runs (or while a retry is scheduled) are coalesced, not queued. Failures
//! within `failure_window` accumulate per tier; reaching `max_tier_failures`
//! moves the episode to the next tier, otherwise the same tier is retried
//! after a linearly growing cooldown. A Deep failure ends the cycle: the
//! escalator stays exhausted until the slow watchdog forces the next Deep run.
//!
//! This type makes decisions only. The manager performs the backend calls and
//! arms the timers it asks for.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::cmp;
use std::collections::VecDeque;

use crate::config::RecoveryConfig;

const HISTORY_LIMIT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTier {
    Simple,
    Full,
    Deep,
}

impl RecoveryTier {
    pub fn next(self) -> RecoveryTier {
        match self {
            RecoveryTier::Simple => RecoveryTier::Full,
            RecoveryTier::Full | RecoveryTier::Deep => RecoveryTier::Deep,
        }
    }

    fn first_action(self) -> StepAction {
        match self {
            RecoveryTier::Simple => StepAction::Repair,
            RecoveryTier::Full => StepAction::Teardown,
            RecoveryTier::Deep => StepAction::Reset,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    Pending,
    Success,
    Failed,
}

/// Why recovery was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryCause {
    BackendError,
    ConnectionDropped,
    FalseConnected,
    SessionNotConnected,
    PollFailed,
    StatusMismatch,
    ProlongedDisconnect,
    Retry,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RecoveryAttempt {
    pub id: u64,
    pub tier: RecoveryTier,
    pub cause: RecoveryCause,
    pub started_at: DateTime<Utc>,
    pub outcome: RecoveryOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

/// Backend work the manager must perform for the running attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    Repair,
    Teardown,
    Reset,
    Reconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestDecision {
    Start {
        attempt_id: u64,
        tier: RecoveryTier,
        action: StepAction,
    },
    Coalesced { reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Progress {
    /// Wait this long, then call [`RecoveryEscalator::cooldown_elapsed`].
    Cooldown(Duration),
    Completed(RecoveryAttempt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Setback {
    Retry {
        failed: RecoveryAttempt,
        next_tier: RecoveryTier,
        at: DateTime<Utc>,
    },
    Exhausted(RecoveryAttempt),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Awaiting(StepAction),
    Cooldown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    Running { attempt: RecoveryAttempt, step: Step },
    BackingOff { tier: RecoveryTier, until: DateTime<Utc> },
    Exhausted,
}

#[derive(Debug, Clone)]
pub struct RecoveryEscalator {
    config: RecoveryConfig,
    phase: Phase,
    episode_tier: RecoveryTier,
    tier_failures: Vec<DateTime<Utc>>,
    last_failure_at: Option<DateTime<Utc>>,
    next_attempt_id: u64,
    history: VecDeque<RecoveryAttempt>,
}

impl RecoveryEscalator {
    pub fn new(config: RecoveryConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            episode_tier: RecoveryTier::Simple,
            tier_failures: Vec::new(),
            last_failure_at: None,
            next_attempt_id: 1,
            history: VecDeque::new(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.phase, Phase::Running { .. })
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.phase, Phase::Exhausted)
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.phase, Phase::Idle)
    }

    pub fn current(&self) -> Option<&RecoveryAttempt> {
        match &self.phase {
            Phase::Running { attempt, .. } => Some(attempt),
            _ => None,
        }
    }

    pub fn current_attempt_id(&self) -> Option<u64> {
        self.current().map(|attempt| attempt.id)
    }

    pub fn episode_tier(&self) -> RecoveryTier {
        self.episode_tier
    }

    pub fn history(&self) -> impl Iterator<Item = &RecoveryAttempt> {
        self.history.iter()
    }

    /// Entry point for failure sources. Acquires the lock when idle.
    pub fn request(&mut self, cause: RecoveryCause, now: DateTime<Utc>) -> RequestDecision {
        match self.phase {
            Phase::Running { .. } => RequestDecision::Coalesced {
                reason: "attempt_pending",
            },
            Phase::BackingOff { .. } => RequestDecision::Coalesced {
                reason: "retry_scheduled",
            },
            Phase::Exhausted => RequestDecision::Coalesced {
                reason: "cycle_exhausted",
            },
            Phase::Idle => {
                self.expire_episode(now);
                self.start(self.episode_tier, cause, now)
            }
        }
    }

    /// Slow-watchdog escape hatch: Deep regardless of attempt history, but
    /// still never alongside a pending attempt.
    pub fn force_deep(&mut self, cause: RecoveryCause, now: DateTime<Utc>) -> RequestDecision {
        if self.is_pending() {
            return RequestDecision::Coalesced {
                reason: "attempt_pending",
            };
        }
        self.tier_failures.clear();
        self.episode_tier = RecoveryTier::Deep;
        self.start(RecoveryTier::Deep, cause, now)
    }

    /// Called when the scheduled retry deadline passes.
    pub fn retry_due(&mut self, now: DateTime<Utc>) -> Option<RequestDecision> {
        match self.phase {
            Phase::BackingOff { tier, until } if until <= now => {
                Some(self.start(tier, RecoveryCause::Retry, now))
            }
            _ => None,
        }
    }

    pub fn step_succeeded(&mut self, now: DateTime<Utc>) -> Option<Progress> {
        let Phase::Running { attempt, step } = &mut self.phase else {
            return None;
        };
        let Step::Awaiting(action) = *step else {
            return None;
        };
        match action {
            StepAction::Teardown => {
                *step = Step::Cooldown;
                Some(Progress::Cooldown(secs(self.config.full_cooldown_secs)))
            }
            StepAction::Reset => {
                *step = Step::Cooldown;
                Some(Progress::Cooldown(secs(self.config.deep_cooldown_secs)))
            }
            StepAction::Repair | StepAction::Reconnect => {
                let mut finished = attempt.clone();
                finished.outcome = RecoveryOutcome::Success;
                finished.finished_at = Some(now);
                self.phase = Phase::Idle;
                self.push_history(finished.clone());
                Some(Progress::Completed(finished))
            }
        }
    }

    /// Ends the cooldown of a Full/Deep attempt; the caller issues `connect`.
    pub fn cooldown_elapsed(&mut self) -> Option<(RecoveryTier, StepAction)> {
        let Phase::Running { attempt, step } = &mut self.phase else {
            return None;
        };
        if *step != Step::Cooldown {
            return None;
        }
        *step = Step::Awaiting(StepAction::Reconnect);
        Some((attempt.tier, StepAction::Reconnect))
    }

    pub fn step_failed(&mut self, now: DateTime<Utc>) -> Option<Setback> {
        let Phase::Running { attempt, .. } = &self.phase else {
            return None;
        };
        let mut failed = attempt.clone();
        failed.outcome = RecoveryOutcome::Failed;
        failed.finished_at = Some(now);
        self.push_history(failed.clone());
        self.last_failure_at = Some(now);

        if failed.tier == RecoveryTier::Deep {
            self.phase = Phase::Exhausted;
            return Some(Setback::Exhausted(failed));
        }

        let window = secs(self.config.failure_window_secs);
        self.tier_failures
            .retain(|failed_at| now.signed_duration_since(*failed_at) <= window);
        self.tier_failures.push(now);

        let (next_tier, delay) =
            if self.tier_failures.len() >= self.config.max_tier_failures as usize {
                self.tier_failures.clear();
                (failed.tier.next(), secs(self.config.retry_cooldown_secs))
            } else {
                (failed.tier, self.backoff_delay(self.tier_failures.len()))
            };

        self.episode_tier = next_tier;
        let at = now + delay;
        self.phase = Phase::BackingOff {
            tier: next_tier,
            until: at,
        };
        Some(Setback::Retry {
            failed,
            next_tier,
            at,
        })
    }

    /// Drops the running attempt (user disconnect/logout) or any scheduled
    /// retry. The in-flight backend call may still answer; its reply no longer
    /// matches [`Self::current_attempt_id`] and is ignored.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Option<RecoveryAttempt> {
        let cancelled = match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::Running { mut attempt, .. } => {
                attempt.outcome = RecoveryOutcome::Failed;
                attempt.finished_at = Some(now);
                self.push_history(attempt.clone());
                Some(attempt)
            }
            _ => None,
        };
        self.reset_episode();
        cancelled
    }

    /// Abandons a scheduled retry whose gate no longer holds.
    pub fn abandon_retry(&mut self) {
        if matches!(self.phase, Phase::BackingOff { .. }) {
            self.phase = Phase::Idle;
        }
    }

    /// Health verified: the next outage starts again at Simple.
    pub fn reset_episode(&mut self) {
        self.episode_tier = RecoveryTier::Simple;
        self.tier_failures.clear();
        self.last_failure_at = None;
        if matches!(self.phase, Phase::Exhausted | Phase::BackingOff { .. }) {
            self.phase = Phase::Idle;
        }
    }

    fn start(
        &mut self,
        tier: RecoveryTier,
        cause: RecoveryCause,
        now: DateTime<Utc>,
    ) -> RequestDecision {
        let attempt_id = self.next_attempt_id;
        self.next_attempt_id = self.next_attempt_id.saturating_add(1);
        let action = tier.first_action();
        self.phase = Phase::Running {
            attempt: RecoveryAttempt {
                id: attempt_id,
                tier,
                cause,
                started_at: now,
                outcome: RecoveryOutcome::Pending,
                finished_at: None,
            },
            step: Step::Awaiting(action),
        };
        RequestDecision::Start {
            attempt_id,
            tier,
            action,
        }
    }

    fn expire_episode(&mut self, now: DateTime<Utc>) {
        let window = secs(self.config.failure_window_secs);
        let expired = self
            .last_failure_at
            .map(|last| now.signed_duration_since(last) > window)
            .unwrap_or(false);
        if expired {
            self.reset_episode();
        }
    }

    fn backoff_delay(&self, failures: usize) -> Duration {
        let step = self.config.backoff_step_secs;
        let backoff = step.saturating_mul(failures as u64);
        secs(cmp::min(backoff, self.config.backoff_max_secs))
    }

    fn push_history(&mut self, attempt: RecoveryAttempt) {
        if self.history.len() == HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(attempt);
    }
}

fn secs(value: u64) -> Duration {
    Duration::seconds(i64::try_from(value).unwrap_or(i64::MAX / 1_000_000))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn escalator() -> RecoveryEscalator {
        RecoveryEscalator::new(RecoveryConfig::default())
    }

    fn started_tier(decision: RequestDecision) -> RecoveryTier {
        match decision {
            RequestDecision::Start { tier, .. } => tier,
            other => panic!("expected start, got {:?}", other),
        }
    }

    #[test]
    fn second_request_is_coalesced_while_pending() {
        let mut recovery = escalator();
        assert_eq!(
            started_tier(recovery.request(RecoveryCause::BackendError, t0())),
            RecoveryTier::Simple
        );
        assert_eq!(
            recovery.request(RecoveryCause::FalseConnected, t0()),
            RequestDecision::Coalesced {
                reason: "attempt_pending"
            }
        );
        assert!(recovery.is_pending());
    }

    #[test]
    fn three_simple_failures_escalate_to_full() {
        let mut recovery = escalator();
        let mut now = t0();
        recovery.request(RecoveryCause::ConnectionDropped, now);

        for round in 1..=3 {
            let setback = recovery.step_failed(now).expect("running");
            let Setback::Retry { next_tier, at, .. } = setback else {
                panic!("simple failure must not exhaust");
            };
            if round < 3 {
                assert_eq!(next_tier, RecoveryTier::Simple);
                assert_eq!(at, now + Duration::seconds(5 * round));
            } else {
                assert_eq!(next_tier, RecoveryTier::Full);
                assert_eq!(at, now + Duration::seconds(3));
            }
            now = at;
            let decision = recovery.retry_due(now).expect("retry due");
            if round < 3 {
                assert_eq!(started_tier(decision), RecoveryTier::Simple);
            } else {
                assert!(matches!(
                    decision,
                    RequestDecision::Start {
                        tier: RecoveryTier::Full,
                        action: StepAction::Teardown,
                        ..
                    }
                ));
            }
        }
    }

    #[test]
    fn requests_during_backoff_are_coalesced() {
        let mut recovery = escalator();
        recovery.request(RecoveryCause::BackendError, t0());
        recovery.step_failed(t0());
        assert_eq!(
            recovery.request(RecoveryCause::BackendError, t0()),
            RequestDecision::Coalesced {
                reason: "retry_scheduled"
            }
        );
        assert_eq!(recovery.retry_due(t0()), None);
    }

    #[test]
    fn full_tier_walks_teardown_cooldown_reconnect() {
        let mut config = RecoveryConfig::default();
        config.max_tier_failures = 1;
        let mut recovery = RecoveryEscalator::new(config);
        recovery.request(RecoveryCause::BackendError, t0());
        let Some(Setback::Retry { at, .. }) = recovery.step_failed(t0()) else {
            panic!("expected retry");
        };
        recovery.retry_due(at).expect("full starts");

        assert_eq!(
            recovery.step_succeeded(at),
            Some(Progress::Cooldown(Duration::seconds(3)))
        );
        assert_eq!(
            recovery.cooldown_elapsed(),
            Some((RecoveryTier::Full, StepAction::Reconnect))
        );
        let Some(Progress::Completed(attempt)) = recovery.step_succeeded(at) else {
            panic!("expected completion");
        };
        assert_eq!(attempt.tier, RecoveryTier::Full);
        assert_eq!(attempt.outcome, RecoveryOutcome::Success);
        assert!(recovery.is_idle());
    }

    #[test]
    fn deep_failure_exhausts_until_forced() {
        let mut recovery = escalator();
        assert!(matches!(
            recovery.force_deep(RecoveryCause::ProlongedDisconnect, t0()),
            RequestDecision::Start {
                tier: RecoveryTier::Deep,
                action: StepAction::Reset,
                ..
            }
        ));
        assert!(matches!(
            recovery.step_failed(t0()),
            Some(Setback::Exhausted(_))
        ));
        assert!(recovery.is_exhausted());
        assert_eq!(
            recovery.request(RecoveryCause::FalseConnected, t0()),
            RequestDecision::Coalesced {
                reason: "cycle_exhausted"
            }
        );
        assert_eq!(
            started_tier(recovery.force_deep(RecoveryCause::ProlongedDisconnect, t0())),
            RecoveryTier::Deep
        );
    }

    #[test]
    fn force_deep_never_runs_alongside_pending_attempt() {
        let mut recovery = escalator();
        recovery.request(RecoveryCause::BackendError, t0());
        assert!(matches!(
            recovery.force_deep(RecoveryCause::ProlongedDisconnect, t0()),
            RequestDecision::Coalesced { .. }
        ));
    }

    #[test]
    fn cancel_releases_lock_and_invalidates_attempt() {
        let mut recovery = escalator();
        let RequestDecision::Start { attempt_id, .. } =
            recovery.request(RecoveryCause::BackendError, t0())
        else {
            panic!("expected start");
        };
        let cancelled = recovery.cancel(t0()).expect("cancelled attempt");
        assert_eq!(cancelled.id, attempt_id);
        assert_eq!(cancelled.outcome, RecoveryOutcome::Failed);
        assert_eq!(recovery.current_attempt_id(), None);
        assert_eq!(recovery.step_succeeded(t0()), None);
    }

    #[test]
    fn old_failures_fall_out_of_the_window() {
        let mut recovery = escalator();
        recovery.request(RecoveryCause::BackendError, t0());
        recovery.step_failed(t0());
        recovery.abandon_retry();

        let later = t0() + Duration::seconds(301);
        assert_eq!(
            started_tier(recovery.request(RecoveryCause::BackendError, later)),
            RecoveryTier::Simple
        );
        let Some(Setback::Retry { at, .. }) = recovery.step_failed(later) else {
            panic!("expected retry");
        };
        assert_eq!(at, later + Duration::seconds(5));
    }

    #[test]
    fn history_is_bounded() {
        let mut recovery = escalator();
        for _ in 0..40 {
            recovery.request(RecoveryCause::BackendError, t0());
            recovery.cancel(t0());
        }
        assert_eq!(recovery.history().count(), HISTORY_LIMIT);
    }
}
