//! Connection status and the state record that owns it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sessionlink_protocol::SessionRecord;
use std::fmt;

use super::transition::{apply_transition, Signal, Transition};
use crate::error::LinkError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Scanning,
    Authenticated,
    Connected,
    Disconnecting,
    LoggingOut,
    LoggedOut,
    Reconnecting,
    Error,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 10] = [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Scanning,
        ConnectionStatus::Authenticated,
        ConnectionStatus::Connected,
        ConnectionStatus::Disconnecting,
        ConnectionStatus::LoggingOut,
        ConnectionStatus::LoggedOut,
        ConnectionStatus::Reconnecting,
        ConnectionStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Scanning => "scanning",
            ConnectionStatus::Authenticated => "authenticated",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnecting => "disconnecting",
            ConnectionStatus::LoggingOut => "logging_out",
            ConnectionStatus::LoggedOut => "logged_out",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        }
    }

    /// Maps a backend status label onto a status. Accepts our own snake-case
    /// names and the bridge's upper-case vocabulary.
    pub fn from_label(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        let status = match normalized.as_str() {
            "disconnected" | "unpaired" | "unpaired_idle" | "unlaunched" => {
                ConnectionStatus::Disconnected
            }
            "connecting" | "opening" => ConnectionStatus::Connecting,
            "scanning" | "pairing" | "qr" => ConnectionStatus::Scanning,
            "authenticated" => ConnectionStatus::Authenticated,
            "connected" | "ready" => ConnectionStatus::Connected,
            "disconnecting" => ConnectionStatus::Disconnecting,
            "logging_out" => ConnectionStatus::LoggingOut,
            "logged_out" => ConnectionStatus::LoggedOut,
            "reconnecting" => ConnectionStatus::Reconnecting,
            "error" | "timeout" | "conflict" => ConnectionStatus::Error,
            _ => return None,
        };
        Some(status)
    }

    /// Statuses that may legitimately persist indefinitely.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::LoggedOut
                | ConnectionStatus::Connected
                | ConnectionStatus::Disconnected
        )
    }

    /// Position along the handshake path. Only handshake statuses are ranked;
    /// everything else is outside the forward ordering.
    pub fn lifecycle_rank(&self) -> Option<u8> {
        match self {
            ConnectionStatus::Connecting => Some(1),
            ConnectionStatus::Scanning => Some(2),
            ConnectionStatus::Authenticated => Some(3),
            ConnectionStatus::Connected => Some(4),
            _ => None,
        }
    }

    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            ConnectionStatus::Connecting
                | ConnectionStatus::Scanning
                | ConnectionStatus::Authenticated
        )
    }
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Single source of truth for the connection. Only [`ConnectionState::apply`]
/// changes the status, and only along the transition table.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionState {
    status: ConnectionStatus,
    status_since: DateTime<Utc>,
    session: Option<SessionRecord>,
    disconnected_since: Option<DateTime<Utc>>,
}

impl ConnectionState {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            status_since: now,
            session: None,
            disconnected_since: None,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn status_since(&self) -> DateTime<Utc> {
        self.status_since
    }

    pub fn session(&self) -> Option<&SessionRecord> {
        self.session.as_ref()
    }

    /// `None` until the backend has told us either way.
    pub fn has_existing_session(&self) -> Option<bool> {
        self.session.map(|record| record.has_existing_session)
    }

    /// Start of the current involuntary outage, if any.
    pub fn disconnected_since(&self) -> Option<DateTime<Utc>> {
        self.disconnected_since
    }

    pub fn record_session(&mut self, record: SessionRecord) {
        match self.session {
            Some(existing) if existing.observed_at > record.observed_at => {}
            _ => self.session = Some(record),
        }
    }

    pub fn apply(&mut self, signal: Signal, now: DateTime<Utc>) -> Result<Transition, LinkError> {
        let transition = apply_transition(self.status, signal)?;
        if transition.changed() {
            self.status = transition.to;
            self.status_since = now;
            match transition.to {
                ConnectionStatus::Connected
                | ConnectionStatus::Disconnecting
                | ConnectionStatus::LoggingOut
                | ConnectionStatus::LoggedOut => self.disconnected_since = None,
                ConnectionStatus::Disconnected | ConnectionStatus::Error => {
                    if self.disconnected_since.is_none() {
                        self.disconnected_since = Some(now);
                    }
                }
                _ => {}
            }
        }
        Ok(transition)
    }

    /// Clears the outage clock after a user-initiated teardown so the slow
    /// watchdog does not treat it as a prolonged failure.
    pub fn forget_outage(&mut self) {
        self.disconnected_since = None;
    }
}
