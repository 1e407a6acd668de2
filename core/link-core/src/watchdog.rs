//! Pull-based supervision that runs independently of push events.
//!
//! Two periodic ticks:
//!
//! - **fast** (~3 min): pull `getStatus()`, then verify identity when the
//!   backend claims to be connected. Disagreement is drift and goes to Simple
//!   recovery.
//! - **slow** (~15 min): if the outage has lasted longer than
//!   `prolonged_disconnect`, force Deep recovery regardless of history.
//!
//! Both ticks live while the connection is supervised: armed on entry to
//! `Connected`, kept across involuntary drops, disarmed on user teardown.

use chrono::{DateTime, Utc};
use sessionlink_protocol::{AccountInfo, StatusReport};

use crate::config::LinkConfig;
use crate::state::{ConnectionState, ConnectionStatus};
use crate::timers::{TimerKind, TimerTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusVerdict {
    /// Backend claims connected; confirm with an identity fetch.
    VerifyIdentity,
    /// Backend is disconnected while a session exists: drift.
    SessionNotConnected,
    /// Same as above, but the user asked to stay logged out.
    AwaitingManualReconnect,
    /// We believed we were connected, but the backend has no session at all.
    SessionGone,
    Consistent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityVerdict {
    Healthy(AccountInfo),
    FalseConnected,
}

pub fn classify_status(
    report: &StatusReport,
    local: ConnectionStatus,
    intent_deleted: bool,
) -> StatusVerdict {
    if report.is_connected {
        return StatusVerdict::VerifyIdentity;
    }
    if local.is_handshake() || local == ConnectionStatus::Reconnecting {
        return StatusVerdict::Consistent;
    }
    if report.has_existing_session {
        if intent_deleted {
            StatusVerdict::AwaitingManualReconnect
        } else {
            StatusVerdict::SessionNotConnected
        }
    } else if local == ConnectionStatus::Connected {
        StatusVerdict::SessionGone
    } else {
        StatusVerdict::Consistent
    }
}

pub fn classify_identity(fetched: Option<AccountInfo>) -> IdentityVerdict {
    match fetched {
        Some(info) if info.connected => IdentityVerdict::Healthy(info),
        _ => IdentityVerdict::FalseConnected,
    }
}

pub fn needs_deep_recovery(
    state: &ConnectionState,
    now: DateTime<Utc>,
    config: &LinkConfig,
    intent_deleted: bool,
) -> bool {
    if intent_deleted {
        return false;
    }
    if !matches!(
        state.status(),
        ConnectionStatus::Disconnected | ConnectionStatus::Error
    ) {
        return false;
    }
    state
        .disconnected_since()
        .map(|since| now.signed_duration_since(since) >= config.prolonged_disconnect())
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Idle,
    AwaitingStatus,
    AwaitingIdentity,
}

#[derive(Debug, Clone)]
pub struct Watchdog {
    armed: bool,
    probe: Probe,
    fast_ticks: u64,
    slow_ticks: u64,
}

impl Default for Watchdog {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog {
    pub fn new() -> Self {
        Self {
            armed: false,
            probe: Probe::Idle,
            fast_ticks: 0,
            slow_ticks: 0,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    pub fn fast_ticks(&self) -> u64 {
        self.fast_ticks
    }

    pub fn slow_ticks(&self) -> u64 {
        self.slow_ticks
    }

    /// (Re)arms both ticks. Replaces any previous deadlines.
    pub fn arm(&mut self, now: DateTime<Utc>, config: &LinkConfig, timers: &mut TimerTable) {
        if !self.armed {
            tracing::debug!("Watchdog armed");
        }
        self.armed = true;
        timers.arm(TimerKind::FastWatchdog, now + config.fast_interval());
        timers.arm(TimerKind::SlowWatchdog, now + config.slow_interval());
    }

    pub fn disarm(&mut self, timers: &mut TimerTable) {
        if self.armed {
            tracing::debug!("Watchdog disarmed");
        }
        self.armed = false;
        self.probe = Probe::Idle;
        timers.cancel(TimerKind::FastWatchdog);
        timers.cancel(TimerKind::SlowWatchdog);
    }

    /// Handles the fast tick firing. Returns true when a status probe should
    /// be issued now.
    pub fn on_fast_tick(
        &mut self,
        now: DateTime<Utc>,
        config: &LinkConfig,
        timers: &mut TimerTable,
    ) -> bool {
        if !self.armed {
            return false;
        }
        self.fast_ticks = self.fast_ticks.saturating_add(1);
        timers.arm(TimerKind::FastWatchdog, now + config.fast_interval());
        self.begin_probe()
    }

    pub fn on_slow_tick(
        &mut self,
        now: DateTime<Utc>,
        config: &LinkConfig,
        timers: &mut TimerTable,
    ) -> bool {
        if !self.armed {
            return false;
        }
        self.slow_ticks = self.slow_ticks.saturating_add(1);
        timers.arm(TimerKind::SlowWatchdog, now + config.slow_interval());
        true
    }

    /// Starts an out-of-band probe (stall detection). False if one is running.
    pub fn begin_probe(&mut self) -> bool {
        if self.probe != Probe::Idle {
            return false;
        }
        self.probe = Probe::AwaitingStatus;
        true
    }

    pub fn awaiting_status(&self) -> bool {
        self.probe == Probe::AwaitingStatus
    }

    pub fn awaiting_identity(&self) -> bool {
        self.probe == Probe::AwaitingIdentity
    }

    pub fn expect_identity(&mut self) {
        self.probe = Probe::AwaitingIdentity;
    }

    pub fn finish_probe(&mut self) {
        self.probe = Probe::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Signal;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn report(is_connected: bool, has_existing_session: bool) -> StatusReport {
        StatusReport {
            is_connected,
            has_existing_session,
            status: String::new(),
        }
    }

    #[test]
    fn connected_report_requires_identity_check() {
        assert_eq!(
            classify_status(&report(true, true), ConnectionStatus::Connected, false),
            StatusVerdict::VerifyIdentity
        );
    }

    #[test]
    fn disconnected_with_session_is_drift_unless_logged_out() {
        assert_eq!(
            classify_status(&report(false, true), ConnectionStatus::Connected, false),
            StatusVerdict::SessionNotConnected
        );
        assert_eq!(
            classify_status(&report(false, true), ConnectionStatus::Disconnected, true),
            StatusVerdict::AwaitingManualReconnect
        );
    }

    #[test]
    fn handshake_in_progress_is_not_drift() {
        assert_eq!(
            classify_status(&report(false, true), ConnectionStatus::Scanning, false),
            StatusVerdict::Consistent
        );
    }

    #[test]
    fn lost_session_while_connected_is_reported() {
        assert_eq!(
            classify_status(&report(false, false), ConnectionStatus::Connected, false),
            StatusVerdict::SessionGone
        );
        assert_eq!(
            classify_status(&report(false, false), ConnectionStatus::Disconnected, false),
            StatusVerdict::Consistent
        );
    }

    #[test]
    fn missing_or_offline_identity_is_false_connected() {
        assert_eq!(classify_identity(None), IdentityVerdict::FalseConnected);
        let info = AccountInfo {
            phone_number: "1".to_string(),
            display_name: "A".to_string(),
            avatar_url: None,
            connected: false,
            observed_at: t0(),
        };
        assert_eq!(classify_identity(Some(info.clone())), IdentityVerdict::FalseConnected);
        let online = AccountInfo {
            connected: true,
            ..info
        };
        assert_eq!(
            classify_identity(Some(online.clone())),
            IdentityVerdict::Healthy(online)
        );
    }

    #[test]
    fn deep_recovery_needs_a_prolonged_outage() {
        let config = LinkConfig::default();
        let mut state = ConnectionState::new(t0());
        state.apply(Signal::ConnectRequested { explicit: true }, t0()).unwrap();
        state.apply(Signal::Ready, t0()).unwrap();
        state.apply(Signal::Dropped, t0()).unwrap();

        assert!(!needs_deep_recovery(&state, t0() + Duration::minutes(5), &config, false));
        assert!(needs_deep_recovery(&state, t0() + Duration::minutes(10), &config, false));
        assert!(!needs_deep_recovery(&state, t0() + Duration::minutes(10), &config, true));
    }

    #[test]
    fn rearming_keeps_one_timer_per_tick() {
        let config = LinkConfig::default();
        let mut timers = TimerTable::new();
        let mut watchdog = Watchdog::new();
        for round in 0..5 {
            watchdog.arm(t0() + Duration::seconds(round), &config, &mut timers);
        }
        assert_eq!(timers.active_count(), 2);
        watchdog.disarm(&mut timers);
        assert_eq!(timers.active_count(), 0);
        assert!(!watchdog.on_fast_tick(t0(), &config, &mut timers));
    }

    #[test]
    fn overlapping_probes_are_refused() {
        let config = LinkConfig::default();
        let mut timers = TimerTable::new();
        let mut watchdog = Watchdog::new();
        watchdog.arm(t0(), &config, &mut timers);
        assert!(watchdog.on_fast_tick(t0(), &config, &mut timers));
        assert!(!watchdog.on_fast_tick(t0(), &config, &mut timers));
        assert_eq!(watchdog.fast_ticks(), 2);
        watchdog.finish_probe();
        assert!(watchdog.begin_probe());
    }
}
