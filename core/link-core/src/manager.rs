//! The connection lifecycle context.
//!
//! `LifecycleManager` owns the connection state, the session intent, the
//! identity cache, the watchdog, the recovery escalator and every timer.
//! It performs no I/O: each input takes `now` and returns the [`Action`]s the
//! driver must carry out (backend calls, presenter updates). Backend replies
//! come back through [`LifecycleManager::handle_reply`] keyed by [`CallId`];
//! replies whose call was cancelled or superseded are dropped there.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sessionlink_protocol::{
    AccountInfo, BackendReply, BackendRequest, DisconnectReason, PushEvent, SessionRecord,
    StatusReport,
};
use std::collections::HashMap;
use tracing::{debug, error, info, warn};

use crate::account::{AccountInfoCache, CacheUpdate, FetchDecision};
use crate::config::LinkConfig;
use crate::error::{BackendError, LinkError};
use crate::ingest::{EventIngester, Ingested};
use crate::intent::SessionIntent;
use crate::recovery::{
    Progress, RecoveryAttempt, RecoveryCause, RecoveryEscalator, RecoveryTier, RequestDecision,
    Setback, StepAction,
};
use crate::state::{is_allowed, ConnectionState, ConnectionStatus, Effect, Signal};
use crate::timers::{TimerKind, TimerTable};
use crate::watchdog::{
    classify_identity, classify_status, needs_deep_recovery, IdentityVerdict, StatusVerdict,
    Watchdog,
};

pub type CallId = u64;

/// Presenter-facing notification. Emitted only when the status or the
/// account identity actually changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub status: ConnectionStatus,
    pub account: Option<AccountInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "action")]
pub enum Action {
    Call { id: CallId, request: BackendRequest },
    Publish(StateChange),
    Notice(Notice),
    ShowQr { payload: String },
    ClearQr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallPurpose {
    InitialCheck,
    Connect,
    Disconnect,
    Logout,
    SessionDelete,
    Probe,
    AccountFetch,
    Recovery { attempt_id: u64, action: StepAction },
}

/// Diagnostics view of the manager.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub status: ConnectionStatus,
    pub status_since: DateTime<Utc>,
    pub session: Option<SessionRecord>,
    pub intent: SessionIntent,
    pub account: Option<AccountInfo>,
    pub watchdog_armed: bool,
    pub recovery_pending: Option<RecoveryAttempt>,
    pub recovery_tier: RecoveryTier,
    pub recent_attempts: Vec<RecoveryAttempt>,
    pub timers: TimerTable,
    pub calls_in_flight: usize,
    pub events_accepted: u64,
    pub events_dropped: u64,
    pub illegal_transitions: u64,
}

pub struct LifecycleManager {
    config: LinkConfig,
    state: ConnectionState,
    intent: SessionIntent,
    accounts: AccountInfoCache,
    ingester: EventIngester,
    watchdog: Watchdog,
    recovery: RecoveryEscalator,
    timers: TimerTable,
    calls: HashMap<CallId, CallPurpose>,
    next_call_id: CallId,
    outbox: Vec<Action>,
    pending_reason: Option<String>,
    last_published: Option<(ConnectionStatus, Option<AccountInfo>)>,
    started: bool,
    awaiting_initial_check: bool,
    /// Whether the current handshake came from an explicit user connect.
    user_handshake: bool,
    illegal_transitions: u64,
}

impl LifecycleManager {
    pub fn new(config: LinkConfig, now: DateTime<Utc>) -> Self {
        let accounts = AccountInfoCache::new(config.fetch_debounce());
        let recovery = RecoveryEscalator::new(config.recovery.clone());
        Self {
            config,
            state: ConnectionState::new(now),
            intent: SessionIntent::default(),
            accounts,
            ingester: EventIngester::new(),
            watchdog: Watchdog::new(),
            recovery,
            timers: TimerTable::new(),
            calls: HashMap::new(),
            next_call_id: 1,
            outbox: Vec::new(),
            pending_reason: None,
            last_published: None,
            started: false,
            awaiting_initial_check: false,
            user_handshake: false,
            illegal_transitions: 0,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn status(&self) -> ConnectionStatus {
        self.state.status()
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn intent(&self) -> SessionIntent {
        self.intent
    }

    pub fn account(&self) -> Option<&AccountInfo> {
        self.accounts.snapshot()
    }

    pub fn recovery(&self) -> &RecoveryEscalator {
        &self.recovery
    }

    pub fn watchdog(&self) -> &Watchdog {
        &self.watchdog
    }

    pub fn timers(&self) -> &TimerTable {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.timers.next_deadline()
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            status: self.state.status(),
            status_since: self.state.status_since(),
            session: self.state.session().copied(),
            intent: self.intent,
            account: self.accounts.snapshot().cloned(),
            watchdog_armed: self.watchdog.is_armed(),
            recovery_pending: self.recovery.current().cloned(),
            recovery_tier: self.recovery.episode_tier(),
            recent_attempts: self.recovery.history().cloned().collect(),
            timers: self.timers.clone(),
            calls_in_flight: self.calls.len(),
            events_accepted: self.ingester.accepted(),
            events_dropped: self.ingester.dropped(),
            illegal_transitions: self.illegal_transitions,
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // User commands
    // ─────────────────────────────────────────────────────────────────────

    /// Startup session check: pull status once and resume an existing session.
    pub fn start(&mut self, _now: DateTime<Utc>) -> Vec<Action> {
        if !self.started {
            self.started = true;
            self.awaiting_initial_check = true;
            debug!("Running initial session check");
            self.issue(BackendRequest::GetStatus, CallPurpose::InitialCheck);
        }
        self.drain()
    }

    /// Explicit user connect. The only path that clears the logout intent.
    pub fn connect(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        self.awaiting_initial_check = false;
        let was_deleted = self.intent.clear_for_explicit_connect(now);
        if was_deleted {
            info!("Logout intent cleared by explicit connect");
        }

        match self.state.status() {
            ConnectionStatus::Connected
            | ConnectionStatus::Connecting
            | ConnectionStatus::Scanning
            | ConnectionStatus::Authenticated
            | ConnectionStatus::Reconnecting => {
                debug!(
                    status = %self.state.status(),
                    "Connect ignored; connection already in progress"
                );
                return self.drain();
            }
            ConnectionStatus::Disconnecting | ConnectionStatus::LoggingOut => {
                self.notice(
                    NoticeLevel::Warning,
                    "Disconnect still in progress; try again shortly",
                );
                return self.drain();
            }
            ConnectionStatus::Error => {
                self.transition(Signal::Dropped, now);
            }
            ConnectionStatus::Disconnected | ConnectionStatus::LoggedOut => {}
        }

        self.recovery.cancel(now);
        self.cancel_recovery_timers();

        let force_new_session = was_deleted || self.state.has_existing_session() == Some(false);
        if self.transition(Signal::ConnectRequested { explicit: true }, now) {
            info!(force_new_session, "User connect");
            self.issue(
                BackendRequest::Connect { force_new_session },
                CallPurpose::Connect,
            );
        }
        self.drain()
    }

    /// Explicit user disconnect that keeps the stored session.
    pub fn disconnect(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        self.awaiting_initial_check = false;
        self.end_supervision(now);

        match self.state.status() {
            ConnectionStatus::Connected => {
                self.transition(Signal::DisconnectRequested, now);
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: false,
                    },
                    CallPurpose::Disconnect,
                );
            }
            ConnectionStatus::Connecting
            | ConnectionStatus::Scanning
            | ConnectionStatus::Authenticated
            | ConnectionStatus::Reconnecting
            | ConnectionStatus::Error => {
                self.transition(Signal::Dropped, now);
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: false,
                    },
                    CallPurpose::Disconnect,
                );
            }
            ConnectionStatus::Disconnected
            | ConnectionStatus::Disconnecting
            | ConnectionStatus::LoggingOut
            | ConnectionStatus::LoggedOut => {
                debug!(status = %self.state.status(), "Disconnect ignored");
            }
        }
        self.state.forget_outage();
        self.drain()
    }

    /// Explicit user logout: deletes the session and suppresses every
    /// automatic reconnect until the next explicit connect.
    pub fn logout(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        self.awaiting_initial_check = false;
        if self.intent.mark_deleted(now) {
            info!("Logout intent set; automatic reconnects suppressed");
        }
        self.end_supervision(now);

        match self.state.status() {
            ConnectionStatus::Connected => {
                self.transition(Signal::DisconnectRequested, now);
                self.transition(Signal::LogoutRequested, now);
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: true,
                    },
                    CallPurpose::Logout,
                );
            }
            ConnectionStatus::Disconnecting => {
                self.transition(Signal::LogoutRequested, now);
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: true,
                    },
                    CallPurpose::Logout,
                );
            }
            ConnectionStatus::LoggingOut | ConnectionStatus::LoggedOut => {
                debug!(status = %self.state.status(), "Logout ignored");
            }
            ConnectionStatus::Disconnected => {
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: true,
                    },
                    CallPurpose::SessionDelete,
                );
                self.notice(NoticeLevel::Info, "Session deleted; connect to pair again");
            }
            ConnectionStatus::Connecting
            | ConnectionStatus::Scanning
            | ConnectionStatus::Authenticated
            | ConnectionStatus::Reconnecting
            | ConnectionStatus::Error => {
                self.pending_reason =
                    Some("Session deleted; awaiting manual reconnect".to_string());
                self.transition(Signal::Dropped, now);
                self.issue(
                    BackendRequest::Disconnect {
                        delete_session: true,
                    },
                    CallPurpose::SessionDelete,
                );
            }
        }
        self.state.forget_outage();
        self.drain()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Push events
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_raw_push(&mut self, now: DateTime<Utc>, raw: Value) -> Vec<Action> {
        match self.ingester.parse_raw(raw, now) {
            Ok(event) => self.handle_push(now, event),
            Err(err) => {
                warn!(error = %err, "Dropping malformed push event");
                self.drain()
            }
        }
    }

    pub fn handle_push(&mut self, now: DateTime<Utc>, event: PushEvent) -> Vec<Action> {
        let channel = event.channel();
        let current = self.state.status();
        match self.ingester.ingest(event, current) {
            Err(err) => {
                warn!(channel, error = %err, "Dropping malformed push event");
            }
            Ok(Ingested::Dropped { reason }) => {
                debug!(channel, reason, status = %current, "Push event dropped");
            }
            Ok(Ingested::Qr(payload)) => {
                self.transition(Signal::QrIssued, now);
                if self.state.status() == ConnectionStatus::Scanning {
                    self.outbox.push(Action::ShowQr { payload });
                } else {
                    self.ingester.forget_qr();
                }
            }
            Ok(Ingested::Status(signal)) => self.on_status_signal(signal, now),
            Ok(Ingested::Disconnected(reason)) => self.on_disconnected(reason, now),
            Ok(Ingested::Failure(message)) => self.on_backend_failure(message, now),
            Ok(Ingested::Account(info)) => self.apply_account(info),
            Ok(Ingested::AccountRefresh) => self.request_account_fetch(now),
            Ok(Ingested::SessionCheck(record)) => {
                self.state.record_session(record);
                self.resume_existing_session(record.has_existing_session, now);
            }
        }
        self.drain()
    }

    fn on_status_signal(&mut self, signal: Signal, now: DateTime<Utc>) {
        match signal.target() {
            ConnectionStatus::Connected => self.route_to_connected(now),
            ConnectionStatus::Connecting => {
                let current = self.state.status();
                let automatic = matches!(
                    current,
                    ConnectionStatus::Disconnected | ConnectionStatus::LoggedOut
                );
                if automatic && !self.intent.allows_automatic_connect() {
                    debug!("Ignoring backend connecting report while logged out");
                    return;
                }
                self.transition(signal, now);
            }
            ConnectionStatus::Disconnected => {
                self.on_disconnected(DisconnectReason::Other("STATE_DISCONNECTED".to_string()), now)
            }
            ConnectionStatus::Error => {
                self.on_backend_failure("backend reported error state".to_string(), now)
            }
            _ => {
                self.transition(signal, now);
            }
        }
    }

    /// Brings the status to `Connected` along legal edges.
    fn route_to_connected(&mut self, now: DateTime<Utc>) {
        match self.state.status() {
            ConnectionStatus::Error => {
                self.transition(Signal::RecoveryStarted, now);
            }
            ConnectionStatus::Disconnected => {
                if !self.intent.allows_automatic_connect() {
                    warn!("Backend reports ready while logged out; ignoring");
                    return;
                }
                self.transition(Signal::ConnectRequested { explicit: false }, now);
            }
            _ => {}
        }
        if self.transition(Signal::Ready, now) || self.state.status() == ConnectionStatus::Connected
        {
            self.timers.cancel(TimerKind::AutoReconnect);
            if !self.recovery.is_pending() {
                self.recovery.reset_episode();
                self.timers.cancel(TimerKind::RecoveryRetry);
            }
        }
    }

    fn on_disconnected(&mut self, reason: DisconnectReason, now: DateTime<Utc>) {
        let previous = self.state.status();

        if reason == DisconnectReason::Logout {
            if self.intent.mark_deleted(now) {
                info!("Remote logout; automatic reconnects suppressed");
            }
            self.end_supervision(now);
            self.pending_reason = Some("Logged out; connect to pair again".to_string());
            match previous {
                ConnectionStatus::Connected => {
                    self.transition(Signal::DisconnectRequested, now);
                    self.transition(Signal::LogoutRequested, now);
                    self.transition(Signal::LogoutCompleted, now);
                }
                ConnectionStatus::Disconnecting => {
                    self.transition(Signal::LogoutRequested, now);
                    self.transition(Signal::LogoutCompleted, now);
                }
                ConnectionStatus::LoggingOut => {
                    self.transition(Signal::LogoutCompleted, now);
                }
                ConnectionStatus::LoggedOut | ConnectionStatus::Disconnected => {}
                _ => {
                    self.transition(Signal::Dropped, now);
                }
            }
            self.pending_reason = None;
            self.state.forget_outage();
            return;
        }

        match previous {
            ConnectionStatus::Disconnecting => {
                self.transition(Signal::Dropped, now);
                return;
            }
            ConnectionStatus::LoggingOut | ConnectionStatus::LoggedOut => return,
            _ => {}
        }

        let auth_failure = reason.is_auth_failure()
            || (previous.is_handshake() && self.user_handshake && !self.recovery.is_pending());
        if auth_failure {
            let err = LinkError::AuthFailure(reason.as_str().to_string());
            warn!(error = %err, status = %previous, "Pairing lost");
            self.pending_reason = Some(err.to_string());
            self.watchdog.disarm(&mut self.timers);
            self.notice(
                NoticeLevel::Warning,
                "Pairing was lost; connect again to get a new QR code",
            );
        } else {
            info!(reason = reason.as_str(), status = %previous, "Connection dropped");
        }

        if previous != ConnectionStatus::Disconnected {
            self.transition(Signal::Dropped, now);
        }
        self.pending_reason = None;

        if auth_failure {
            return;
        }
        if self.recovery.is_pending() {
            debug!("Disconnect during recovery; recovery keeps ownership");
            return;
        }
        if !self.intent.allows_automatic_connect() {
            debug!("Disconnect while logged out; awaiting manual reconnect");
            return;
        }
        if !self.watchdog.is_armed() {
            debug!("Disconnect before supervision started; not reconnecting");
            return;
        }
        self.timers.arm(
            TimerKind::AutoReconnect,
            now + self.config.auto_reconnect_delay(),
        );
    }

    fn on_backend_failure(&mut self, message: String, now: DateTime<Utc>) {
        let err = LinkError::TransientBackend(message);
        let previous = self.state.status();
        match previous {
            ConnectionStatus::Disconnecting
            | ConnectionStatus::LoggingOut
            | ConnectionStatus::LoggedOut
            | ConnectionStatus::Disconnected => {
                debug!(error = %err, status = %previous, "Backend error while not connected");
                return;
            }
            ConnectionStatus::Reconnecting => {
                debug!(error = %err, "Backend error during recovery");
                return;
            }
            ConnectionStatus::Error => {}
            ConnectionStatus::Connecting
            | ConnectionStatus::Scanning
            | ConnectionStatus::Authenticated
            | ConnectionStatus::Connected => {
                warn!(error = %err, status = %previous, "Backend error");
                self.pending_reason = Some(err.to_string());
                self.transition(Signal::Failed, now);
                self.pending_reason = None;
            }
        }

        if previous.is_handshake() && self.user_handshake {
            self.notice(NoticeLevel::Error, "Connection attempt failed; try connecting again");
            return;
        }
        self.request_recovery(RecoveryCause::BackendError, now);
    }

    fn resume_existing_session(&mut self, has_existing_session: bool, now: DateTime<Utc>) {
        if !self.awaiting_initial_check {
            return;
        }
        self.awaiting_initial_check = false;
        if !has_existing_session {
            debug!("No stored session; waiting for user connect");
            return;
        }
        if !self.intent.allows_automatic_connect()
            || self.state.status() != ConnectionStatus::Disconnected
        {
            return;
        }
        if self.transition(Signal::ConnectRequested { explicit: false }, now) {
            info!("Stored session found; resuming");
            self.issue(
                BackendRequest::Connect {
                    force_new_session: false,
                },
                CallPurpose::Connect,
            );
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Backend replies
    // ─────────────────────────────────────────────────────────────────────

    pub fn handle_reply(
        &mut self,
        now: DateTime<Utc>,
        id: CallId,
        result: Result<BackendReply, BackendError>,
    ) -> Vec<Action> {
        let Some(purpose) = self.calls.remove(&id) else {
            debug!(call_id = id, "Reply for unknown call dropped");
            return self.drain();
        };

        match purpose {
            CallPurpose::InitialCheck => self.on_initial_check(result, now),
            CallPurpose::Connect => self.on_connect_reply(result, now),
            CallPurpose::Disconnect => {
                if let Err(err) = &result {
                    warn!(error = %err, "Disconnect call failed");
                }
                if self.state.status() == ConnectionStatus::Disconnecting {
                    self.transition(Signal::Dropped, now);
                    self.state.forget_outage();
                }
            }
            CallPurpose::Logout => {
                if let Err(err) = &result {
                    warn!(error = %err, "Logout call failed");
                    self.pending_reason = Some(format!("Logout incomplete: {}", err));
                    self.notice(
                        NoticeLevel::Warning,
                        "Logout did not complete on the backend; the session may still exist",
                    );
                }
                if self.state.status() == ConnectionStatus::LoggingOut {
                    self.transition(Signal::LogoutCompleted, now);
                }
                self.pending_reason = None;
            }
            CallPurpose::SessionDelete => {
                if let Err(err) = &result {
                    warn!(error = %err, "Session delete failed");
                }
            }
            CallPurpose::Probe => self.on_probe_reply(result, now),
            CallPurpose::AccountFetch => self.on_account_reply(result, now),
            CallPurpose::Recovery { attempt_id, action } => {
                self.on_recovery_reply(attempt_id, action, result, now)
            }
        }
        self.drain()
    }

    fn on_initial_check(&mut self, result: Result<BackendReply, BackendError>, now: DateTime<Utc>) {
        match result {
            Ok(BackendReply::Status(report)) => {
                self.record_report(&report, now);
                self.resume_existing_session(report.has_existing_session, now);
            }
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to status check");
                self.awaiting_initial_check = false;
            }
            Err(err) => {
                warn!(error = %err, "Initial session check failed");
                self.awaiting_initial_check = false;
            }
        }
    }

    fn on_connect_reply(&mut self, result: Result<BackendReply, BackendError>, now: DateTime<Utc>) {
        let Err(err) = result else {
            return;
        };
        if !self.state.status().is_handshake() {
            debug!(error = %err, "Connect failure arrived after status moved on");
            return;
        }
        warn!(error = %err, "Connect failed");
        self.pending_reason = Some(format!("Connect failed: {}", err));
        self.transition(Signal::Failed, now);
        self.pending_reason = None;
        self.notice(NoticeLevel::Error, "Could not connect; try again");
    }

    fn on_probe_reply(&mut self, result: Result<BackendReply, BackendError>, now: DateTime<Utc>) {
        if !self.watchdog.awaiting_status() {
            debug!("Status probe reply after watchdog reset; dropped");
            return;
        }
        let report = match result {
            Ok(BackendReply::Status(report)) => report,
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to status probe");
                self.watchdog.finish_probe();
                return;
            }
            Err(err) => {
                warn!(error = %err, "Status probe failed");
                self.watchdog.finish_probe();
                if matches!(
                    self.state.status(),
                    ConnectionStatus::Connected | ConnectionStatus::Error
                ) {
                    self.request_recovery(RecoveryCause::PollFailed, now);
                }
                return;
            }
        };

        self.record_report(&report, now);
        let status = self.state.status();
        match classify_status(&report, status, self.intent.is_deleted()) {
            StatusVerdict::VerifyIdentity => {
                self.watchdog.expect_identity();
                self.request_account_fetch(now);
            }
            StatusVerdict::SessionNotConnected => {
                self.watchdog.finish_probe();
                let drift = LinkError::SessionDrift(format!(
                    "backend disconnected while local status is {}",
                    status
                ));
                info!(error = %drift, "Watchdog drift");
                self.request_recovery(RecoveryCause::SessionNotConnected, now);
            }
            StatusVerdict::AwaitingManualReconnect => {
                self.watchdog.finish_probe();
                debug!("Session exists but logout intent is set; awaiting manual reconnect");
            }
            StatusVerdict::SessionGone => {
                self.watchdog.finish_probe();
                let err = LinkError::AuthFailure("stored session no longer exists".to_string());
                warn!(error = %err, "Watchdog found no session");
                self.pending_reason = Some(err.to_string());
                self.watchdog.disarm(&mut self.timers);
                self.transition(Signal::Dropped, now);
                self.pending_reason = None;
                self.notice(
                    NoticeLevel::Warning,
                    "Session expired; connect again to get a new QR code",
                );
            }
            StatusVerdict::Consistent => {
                self.watchdog.finish_probe();
            }
        }
    }

    fn on_account_reply(&mut self, result: Result<BackendReply, BackendError>, now: DateTime<Utc>) {
        self.accounts.finish_fetch();
        let verifying = self.watchdog.awaiting_identity();
        let fetched = match result {
            Ok(BackendReply::Account(info)) => info,
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to account fetch");
                None
            }
            Err(err) => {
                warn!(error = %err, "Account fetch failed");
                None
            }
        };

        if let Some(info) = fetched.as_ref().filter(|info| info.connected) {
            self.apply_account(info.clone());
        }
        if !verifying {
            return;
        }
        self.watchdog.finish_probe();

        match classify_identity(fetched) {
            IdentityVerdict::Healthy(_) => match self.state.status() {
                ConnectionStatus::Connected => {
                    debug!("Watchdog verified connection");
                    if !self.recovery.is_pending() {
                        self.recovery.reset_episode();
                        self.timers.cancel(TimerKind::RecoveryRetry);
                    }
                }
                ConnectionStatus::Authenticated
                | ConnectionStatus::Connecting
                | ConnectionStatus::Scanning => {
                    debug!("Watchdog found backend connected; catching up");
                    self.route_to_connected(now);
                }
                status => {
                    let drift = LinkError::SessionDrift(format!(
                        "backend connected while local status is {}",
                        status
                    ));
                    info!(error = %drift, "Watchdog drift");
                    self.request_recovery(RecoveryCause::StatusMismatch, now);
                }
            },
            IdentityVerdict::FalseConnected => {
                let drift = LinkError::SessionDrift(
                    "backend reports connected but identity is unavailable".to_string(),
                );
                info!(error = %drift, "Watchdog drift");
                self.request_recovery(RecoveryCause::FalseConnected, now);
            }
        }
    }

    fn on_recovery_reply(
        &mut self,
        attempt_id: u64,
        action: StepAction,
        result: Result<BackendReply, BackendError>,
        now: DateTime<Utc>,
    ) {
        if self.recovery.current_attempt_id() != Some(attempt_id) {
            debug!(attempt_id, "Reply for cancelled recovery attempt dropped");
            return;
        }
        if let Err(err) = result {
            self.fail_attempt(err, now);
            return;
        }

        match self.recovery.step_succeeded(now) {
            Some(Progress::Cooldown(delay)) => {
                debug!(?action, "Recovery step done; cooling down");
                if !matches!(
                    self.state.status(),
                    ConnectionStatus::Disconnected | ConnectionStatus::LoggedOut
                ) {
                    self.transition(Signal::Dropped, now);
                }
                self.timers.arm(TimerKind::RecoveryStep, now + delay);
            }
            Some(Progress::Completed(attempt)) => {
                info!(tier = ?attempt.tier, cause = ?attempt.cause, "Recovery attempt succeeded");
                if action == StepAction::Repair {
                    self.route_to_connected(now);
                }
            }
            None => {}
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Timers
    // ─────────────────────────────────────────────────────────────────────

    /// Fires every timer due at `now`.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<Action> {
        for kind in self.timers.take_due(now) {
            self.on_timer(kind, now);
        }
        self.drain()
    }

    fn on_timer(&mut self, kind: TimerKind, now: DateTime<Utc>) {
        match kind {
            TimerKind::FastWatchdog => {
                if self
                    .watchdog
                    .on_fast_tick(now, &self.config, &mut self.timers)
                {
                    self.issue(BackendRequest::GetStatus, CallPurpose::Probe);
                }
            }
            TimerKind::SlowWatchdog => {
                if !self
                    .watchdog
                    .on_slow_tick(now, &self.config, &mut self.timers)
                {
                    return;
                }
                if needs_deep_recovery(&self.state, now, &self.config, self.intent.is_deleted()) {
                    warn!("Prolonged disconnect; forcing deep recovery");
                    let decision = self
                        .recovery
                        .force_deep(RecoveryCause::ProlongedDisconnect, now);
                    self.follow_decision(decision, now);
                }
            }
            TimerKind::StatusStall => self.on_status_stall(now),
            TimerKind::AutoReconnect => {
                if matches!(
                    self.state.status(),
                    ConnectionStatus::Disconnected | ConnectionStatus::Error
                ) {
                    self.request_recovery(RecoveryCause::ConnectionDropped, now);
                }
            }
            TimerKind::RecoveryStep => self.on_recovery_cooldown(now),
            TimerKind::RecoveryRetry => {
                if !self.automatic_paths_allowed() {
                    self.recovery.abandon_retry();
                    return;
                }
                if let Some(decision) = self.recovery.retry_due(now) {
                    self.follow_decision(decision, now);
                }
            }
            TimerKind::AccountFetch => self.request_account_fetch(now),
        }
    }

    fn on_status_stall(&mut self, now: DateTime<Utc>) {
        let status = self.state.status();
        if status.is_terminal() {
            return;
        }
        warn!(
            status = %status,
            since = %self.state.status_since(),
            "Status did not resolve in time"
        );
        match status {
            ConnectionStatus::Disconnecting => {
                self.transition(Signal::Dropped, now);
                self.state.forget_outage();
            }
            ConnectionStatus::LoggingOut => {
                self.transition(Signal::LogoutCompleted, now);
            }
            ConnectionStatus::Reconnecting | ConnectionStatus::Connecting
                if self.recovery.is_pending() =>
            {
                let secs = self.config.stall_window().num_seconds().max(0) as u64;
                self.fail_attempt(BackendError::Timeout { secs }, now);
            }
            _ => {
                if self.watchdog.begin_probe() {
                    self.issue(BackendRequest::GetStatus, CallPurpose::Probe);
                }
                if self.state.status() == status {
                    self.timers
                        .arm(TimerKind::StatusStall, now + self.stall_window(status));
                }
            }
        }
    }

    fn on_recovery_cooldown(&mut self, now: DateTime<Utc>) {
        let Some((tier, StepAction::Reconnect)) = self.recovery.cooldown_elapsed() else {
            return;
        };
        let Some(attempt_id) = self.recovery.current_attempt_id() else {
            return;
        };
        if !self.automatic_paths_allowed() {
            self.recovery.cancel(now);
            return;
        }
        if !self.enter_connecting_automatically(now) {
            self.fail_attempt(
                BackendError::Crashed(format!(
                    "cannot reconnect from {}",
                    self.state.status()
                )),
                now,
            );
            return;
        }
        let force_new_session = tier == RecoveryTier::Deep || self.intent.is_deleted();
        self.issue(
            BackendRequest::Connect { force_new_session },
            CallPurpose::Recovery {
                attempt_id,
                action: StepAction::Reconnect,
            },
        );
    }

    // ─────────────────────────────────────────────────────────────────────
    // Recovery plumbing
    // ─────────────────────────────────────────────────────────────────────

    fn automatic_paths_allowed(&self) -> bool {
        self.intent.allows_automatic_connect() && self.watchdog.is_armed()
    }

    fn request_recovery(&mut self, cause: RecoveryCause, now: DateTime<Utc>) {
        if !self.intent.allows_automatic_connect() {
            debug!(?cause, "Recovery suppressed by logout intent");
            return;
        }
        if !self.watchdog.is_armed() {
            debug!(?cause, "Recovery skipped; connection is not supervised");
            return;
        }
        let decision = self.recovery.request(cause, now);
        self.follow_decision(decision, now);
    }

    fn follow_decision(&mut self, decision: RequestDecision, now: DateTime<Utc>) {
        match decision {
            RequestDecision::Coalesced { reason } => {
                debug!(reason, "Recovery request coalesced");
            }
            RequestDecision::Start {
                attempt_id,
                tier,
                action,
            } => self.begin_attempt(attempt_id, tier, action, now),
        }
    }

    fn begin_attempt(
        &mut self,
        attempt_id: u64,
        tier: RecoveryTier,
        action: StepAction,
        now: DateTime<Utc>,
    ) {
        self.timers.cancel(TimerKind::AutoReconnect);
        self.timers.cancel(TimerKind::RecoveryRetry);
        info!(attempt_id, tier = ?tier, "Recovery attempt started");

        if tier == RecoveryTier::Deep {
            self.notice(
                NoticeLevel::Warning,
                "Connection could not be repaired; resetting the session",
            );
        }

        match self.state.status() {
            ConnectionStatus::Connected | ConnectionStatus::Error => {
                self.transition(Signal::RecoveryStarted, now);
            }
            ConnectionStatus::Disconnected
                if matches!(action, StepAction::Repair | StepAction::Reconnect) =>
            {
                self.transition(Signal::ConnectRequested { explicit: false }, now);
            }
            _ => {}
        }

        let request = match action {
            StepAction::Repair => BackendRequest::RepairConnection,
            StepAction::Teardown => BackendRequest::Disconnect {
                delete_session: false,
            },
            StepAction::Reset => BackendRequest::ResetSession,
            StepAction::Reconnect => BackendRequest::Connect {
                force_new_session: tier == RecoveryTier::Deep || self.intent.is_deleted(),
            },
        };
        self.issue(request, CallPurpose::Recovery { attempt_id, action });
    }

    fn fail_attempt(&mut self, err: BackendError, now: DateTime<Utc>) {
        match self.recovery.step_failed(now) {
            Some(Setback::Retry {
                failed,
                next_tier,
                at,
            }) => {
                warn!(
                    error = %err,
                    tier = ?failed.tier,
                    next_tier = ?next_tier,
                    retry_at = %at,
                    "Recovery attempt failed"
                );
                self.pending_reason = Some(LinkError::from(err).to_string());
                self.fall_back_to_error(now);
                self.pending_reason = None;
                self.timers.arm(TimerKind::RecoveryRetry, at);
            }
            Some(Setback::Exhausted(failed)) => {
                let fatal = LinkError::FatalSessionCorruption(err.to_string());
                error!(error = %fatal, tier = ?failed.tier, "Recovery exhausted for this cycle");
                self.pending_reason = Some(fatal.to_string());
                self.fall_back_to_error(now);
                self.pending_reason = None;
                self.notice(
                    NoticeLevel::Error,
                    "Automatic recovery failed; it will be retried later",
                );
            }
            None => {}
        }
    }

    /// Moves to `Error` when legal, otherwise to `Disconnected`.
    fn fall_back_to_error(&mut self, now: DateTime<Utc>) {
        let status = self.state.status();
        if status == ConnectionStatus::Error {
            return;
        }
        if is_allowed(status, ConnectionStatus::Error) {
            self.transition(Signal::Failed, now);
        } else if status != ConnectionStatus::Disconnected
            && is_allowed(status, ConnectionStatus::Disconnected)
        {
            self.transition(Signal::Dropped, now);
        }
    }

    /// Walks to `Connecting` for an automatic connect. Callers check intent.
    fn enter_connecting_automatically(&mut self, now: DateTime<Utc>) -> bool {
        match self.state.status() {
            ConnectionStatus::Connecting => true,
            ConnectionStatus::Disconnected => {
                self.transition(Signal::ConnectRequested { explicit: false }, now)
            }
            ConnectionStatus::Error | ConnectionStatus::Reconnecting => {
                self.transition(Signal::Dropped, now)
                    && self.transition(Signal::ConnectRequested { explicit: false }, now)
            }
            _ => false,
        }
    }

    /// User teardown: cancel recovery intent and stop supervising.
    fn end_supervision(&mut self, now: DateTime<Utc>) {
        if let Some(attempt) = self.recovery.cancel(now) {
            info!(attempt_id = attempt.id, tier = ?attempt.tier, "Recovery attempt cancelled");
        }
        self.cancel_recovery_timers();
        self.watchdog.disarm(&mut self.timers);
    }

    fn cancel_recovery_timers(&mut self) {
        self.timers.cancel(TimerKind::AutoReconnect);
        self.timers.cancel(TimerKind::RecoveryStep);
        self.timers.cancel(TimerKind::RecoveryRetry);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────

    fn request_account_fetch(&mut self, now: DateTime<Utc>) {
        match self.accounts.request_fetch(now) {
            FetchDecision::Issue => {
                self.issue(BackendRequest::GetAccountInfo, CallPurpose::AccountFetch);
            }
            FetchDecision::Coalesced => {
                debug!("Account fetch already in flight");
            }
            FetchDecision::Deferred(at) => {
                self.timers.arm_if_idle(TimerKind::AccountFetch, at);
            }
        }
    }

    fn apply_account(&mut self, info: AccountInfo) {
        if !matches!(
            self.state.status(),
            ConnectionStatus::Connected | ConnectionStatus::Reconnecting
        ) {
            debug!(status = %self.state.status(), "Account info ignored while not connected");
            return;
        }
        if self.accounts.update(info) == CacheUpdate::Changed {
            self.publish();
        }
    }

    fn record_report(&mut self, report: &StatusReport, now: DateTime<Utc>) {
        self.state.record_session(SessionRecord {
            has_existing_session: report.has_existing_session,
            is_connected: report.is_connected,
            observed_at: now,
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions and output
    // ─────────────────────────────────────────────────────────────────────

    /// Applies a signal. Returns true when the status changed.
    fn transition(&mut self, signal: Signal, now: DateTime<Utc>) -> bool {
        let transition = match self.state.apply(signal, now) {
            Ok(transition) => transition,
            Err(err) => {
                self.illegal_transitions = self.illegal_transitions.saturating_add(1);
                warn!(error = %err, ?signal, "Ignoring illegal transition");
                return false;
            }
        };
        if !transition.changed() {
            return false;
        }
        info!(from = %transition.from, to = %transition.to, "Connection status changed");
        if transition.to == ConnectionStatus::Connecting {
            self.user_handshake = matches!(signal, Signal::ConnectRequested { explicit: true });
        }

        if !matches!(
            transition.to,
            ConnectionStatus::Disconnected | ConnectionStatus::Error
        ) {
            self.timers.cancel(TimerKind::AutoReconnect);
        }

        let mut notify = false;
        for effect in transition.effects {
            match effect {
                Effect::Notify => notify = true,
                Effect::ClearQr => {
                    self.ingester.forget_qr();
                    self.outbox.push(Action::ClearQr);
                }
                Effect::ArmWatchdog => self.watchdog.arm(now, &self.config, &mut self.timers),
                Effect::DisarmWatchdog => self.watchdog.disarm(&mut self.timers),
                Effect::FetchAccountInfo => self.request_account_fetch(now),
                Effect::ClearAccountInfo => {
                    self.accounts.clear();
                    self.timers.cancel(TimerKind::AccountFetch);
                }
                Effect::ArmStallTimer => {
                    self.timers.arm(
                        TimerKind::StatusStall,
                        now + self.stall_window(transition.to),
                    );
                }
                Effect::CancelStallTimer => {
                    self.timers.cancel(TimerKind::StatusStall);
                }
            }
        }
        if notify {
            self.publish();
        }
        true
    }

    fn stall_window(&self, status: ConnectionStatus) -> chrono::Duration {
        if status == ConnectionStatus::Scanning {
            self.config.scanning_stall_window()
        } else {
            self.config.stall_window()
        }
    }

    fn publish(&mut self) {
        let status = self.state.status();
        let account = self.accounts.snapshot().cloned();
        let unchanged = match &self.last_published {
            Some((last_status, last_account)) => {
                *last_status == status
                    && match (last_account, &account) {
                        (None, None) => true,
                        (Some(previous), Some(current)) => !previous.identity_differs(current),
                        _ => false,
                    }
            }
            None => false,
        };
        if unchanged {
            return;
        }
        self.last_published = Some((status, account.clone()));
        self.outbox.push(Action::Publish(StateChange {
            status,
            account,
            reason: self.pending_reason.clone(),
        }));
    }

    fn notice(&mut self, level: NoticeLevel, message: &str) {
        self.outbox.push(Action::Notice(Notice {
            level,
            message: message.to_string(),
        }));
    }

    fn issue(&mut self, request: BackendRequest, purpose: CallPurpose) -> CallId {
        let id = self.next_call_id;
        self.next_call_id = self.next_call_id.saturating_add(1);
        self.calls.insert(id, purpose);
        debug!(call_id = id, operation = request.operation(), "Backend call issued");
        self.outbox.push(Action::Call { id, request });
        id
    }

    fn drain(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn calls(actions: &[Action]) -> Vec<(CallId, BackendRequest)> {
        actions
            .iter()
            .filter_map(|action| match action {
                Action::Call { id, request } => Some((*id, *request)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn start_issues_single_status_check() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        let actions = manager.start(t0());
        assert_eq!(calls(&actions).len(), 1);
        assert!(manager.start(t0()).is_empty());
    }

    #[test]
    fn initial_check_resumes_stored_session() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        let (id, _) = calls(&manager.start(t0()))[0];
        let actions = manager.handle_reply(
            t0(),
            id,
            Ok(BackendReply::Status(StatusReport {
                is_connected: false,
                has_existing_session: true,
                status: "UNLAUNCHED".to_string(),
            })),
        );
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        assert_eq!(
            calls(&actions)[0].1,
            BackendRequest::Connect {
                force_new_session: false
            }
        );
    }

    #[test]
    fn initial_check_without_session_waits_for_user() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        let (id, _) = calls(&manager.start(t0()))[0];
        let actions = manager.handle_reply(
            t0(),
            id,
            Ok(BackendReply::Status(StatusReport {
                is_connected: false,
                has_existing_session: false,
                status: String::new(),
            })),
        );
        assert!(calls(&actions).is_empty());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert_eq!(manager.state().has_existing_session(), Some(false));
    }

    #[test]
    fn connect_from_error_walks_through_disconnected() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        manager.connect(t0());
        manager.handle_push(
            t0(),
            PushEvent::Error {
                message: "browser crashed".to_string(),
            },
        );
        assert_eq!(manager.status(), ConnectionStatus::Error);

        let actions = manager.connect(t0() + Duration::seconds(1));
        assert_eq!(manager.status(), ConnectionStatus::Connecting);
        let statuses: Vec<ConnectionStatus> = actions
            .iter()
            .filter_map(|action| match action {
                Action::Publish(change) => Some(change.status),
                _ => None,
            })
            .collect();
        assert_eq!(
            statuses,
            vec![ConnectionStatus::Disconnected, ConnectionStatus::Connecting]
        );
    }

    #[test]
    fn unknown_reply_is_ignored() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        assert!(manager
            .handle_reply(t0(), 999, Ok(BackendReply::Ack))
            .is_empty());
    }

    #[test]
    fn malformed_raw_event_changes_nothing() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        let actions = manager.handle_raw_push(t0(), serde_json::json!({"channel": "state"}));
        assert!(actions.is_empty());
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn stalled_disconnect_completes_locally() {
        let mut manager = LifecycleManager::new(LinkConfig::default(), t0());
        manager.connect(t0());
        manager.handle_push(t0(), PushEvent::Ready);
        manager.disconnect(t0());
        assert_eq!(manager.status(), ConnectionStatus::Disconnecting);

        manager.tick(t0() + Duration::seconds(91));
        assert_eq!(manager.status(), ConnectionStatus::Disconnected);
        assert!(!manager.timers().is_armed(TimerKind::StatusStall));
    }
}
