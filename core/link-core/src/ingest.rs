//! Normalizes push notifications into reducer inputs.
//!
//! Ordering rule: an event whose implied status sits earlier on the handshake
//! path than the current status is a late delivery and is dropped. A QR code
//! identical to the one on screen is dropped as a duplicate. Everything else
//! maps to exactly one [`Ingested`] value, in arrival order.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sessionlink_protocol::{
    parse_push_value, AccountInfo, DisconnectReason, PushEvent, SessionRecord,
};

use crate::error::LinkError;
use crate::state::{is_stale, ConnectionStatus, Signal};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ingested {
    Qr(String),
    Status(Signal),
    Disconnected(DisconnectReason),
    Failure(String),
    Account(AccountInfo),
    AccountRefresh,
    SessionCheck(SessionRecord),
    Dropped { reason: &'static str },
}

#[derive(Debug, Clone, Default)]
pub struct EventIngester {
    shown_qr: Option<String>,
    accepted: u64,
    dropped: u64,
}

impl EventIngester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Parses a raw bridge envelope. Shape errors become `MalformedEvent`.
    pub fn parse_raw(
        &self,
        raw: Value,
        received_at: DateTime<Utc>,
    ) -> Result<PushEvent, LinkError> {
        parse_push_value(raw, received_at).map_err(|err| LinkError::MalformedEvent(err.to_string()))
    }

    pub fn ingest(
        &mut self,
        event: PushEvent,
        current: ConnectionStatus,
    ) -> Result<Ingested, LinkError> {
        let ingested = self.normalize(event, current)?;
        match ingested {
            Ingested::Dropped { .. } => self.dropped = self.dropped.saturating_add(1),
            _ => self.accepted = self.accepted.saturating_add(1),
        }
        Ok(ingested)
    }

    /// Called when the QR leaves the screen.
    pub fn forget_qr(&mut self) {
        self.shown_qr = None;
    }

    fn normalize(
        &mut self,
        event: PushEvent,
        current: ConnectionStatus,
    ) -> Result<Ingested, LinkError> {
        let ingested = match event {
            PushEvent::Qr { payload } => {
                if is_stale(current, ConnectionStatus::Scanning) {
                    Ingested::Dropped { reason: "stale_qr" }
                } else if current == ConnectionStatus::Scanning
                    && self.shown_qr.as_deref() == Some(payload.as_str())
                {
                    Ingested::Dropped {
                        reason: "duplicate_qr",
                    }
                } else {
                    self.shown_qr = Some(payload.clone());
                    Ingested::Qr(payload)
                }
            }
            PushEvent::Authenticated => {
                if is_stale(current, ConnectionStatus::Authenticated) {
                    Ingested::Dropped {
                        reason: "stale_authenticated",
                    }
                } else {
                    Ingested::Status(Signal::Authenticated)
                }
            }
            PushEvent::Ready => Ingested::Status(Signal::Ready),
            PushEvent::State { label } => {
                let status = ConnectionStatus::from_label(&label).ok_or_else(|| {
                    LinkError::MalformedEvent(format!("unknown state label: {}", label))
                })?;
                if is_stale(current, status) {
                    Ingested::Dropped {
                        reason: "stale_state",
                    }
                } else if status == ConnectionStatus::LoggedOut {
                    Ingested::Disconnected(DisconnectReason::Logout)
                } else {
                    Ingested::Status(Signal::Reported(status))
                }
            }
            PushEvent::Disconnected { reason } => Ingested::Disconnected(reason),
            PushEvent::Error { message } => Ingested::Failure(message),
            PushEvent::Info(Some(info)) => Ingested::Account(info),
            PushEvent::Info(None) => Ingested::AccountRefresh,
            PushEvent::SessionCheck(record) => Ingested::SessionCheck(record),
        };
        Ok(ingested)
    }
}
