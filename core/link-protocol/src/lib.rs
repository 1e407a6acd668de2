//! Wire types shared by the session bridge and the lifecycle manager.
//!
//! The bridge pushes loosely shaped notifications (`channel` + `payload`).
//! This crate is the only place that knows those shapes: everything past
//! [`parse_push`] works with the typed [`PushEvent`]. Validation failures are
//! reported as [`ErrorInfo`] and never panic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MAX_QR_PAYLOAD_BYTES: usize = 8 * 1024;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Raw notification as it arrives from the bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushEnvelope {
    pub channel: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub recorded_at: Option<String>,
}

/// Remote account identity reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInfo {
    pub phone_number: String,
    pub display_name: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub connected: bool,
    pub observed_at: DateTime<Utc>,
}

impl AccountInfo {
    /// True when the identity fields differ. `connected` and `observed_at`
    /// are bookkeeping and do not count as an identity change.
    pub fn identity_differs(&self, other: &AccountInfo) -> bool {
        self.phone_number != other.phone_number
            || self.display_name != other.display_name
            || self.avatar_url != other.avatar_url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub has_existing_session: bool,
    pub is_connected: bool,
    pub observed_at: DateTime<Utc>,
}

/// Reply body of `getStatus()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub is_connected: bool,
    pub has_existing_session: bool,
    #[serde(default)]
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "reason")]
pub enum DisconnectReason {
    Logout,
    Other(String),
}

impl DisconnectReason {
    pub fn from_label(label: &str) -> Self {
        let trimmed = label.trim();
        if trimmed.eq_ignore_ascii_case("LOGOUT") {
            DisconnectReason::Logout
        } else if trimmed.is_empty() {
            DisconnectReason::Other("UNKNOWN".to_string())
        } else {
            DisconnectReason::Other(trimmed.to_ascii_uppercase())
        }
    }

    /// Reasons that mean the pairing itself is gone; a fresh QR is required.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            DisconnectReason::Logout => false,
            DisconnectReason::Other(label) => {
                matches!(label.as_str(), "AUTH_FAILURE" | "UNPAIRED" | "QR_EXPIRED")
            }
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DisconnectReason::Logout => "LOGOUT",
            DisconnectReason::Other(label) => label.as_str(),
        }
    }
}

/// Normalized push notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushEvent {
    Qr { payload: String },
    Ready,
    Authenticated,
    Disconnected { reason: DisconnectReason },
    /// Backend-reported status label; mapped to a connection status by the consumer.
    State { label: String },
    Error { message: String },
    /// `None` means "identity may have changed, fetch it".
    Info(Option<AccountInfo>),
    SessionCheck(SessionRecord),
}

impl PushEvent {
    pub fn channel(&self) -> &'static str {
        match self {
            PushEvent::Qr { .. } => "qr",
            PushEvent::Ready => "ready",
            PushEvent::Authenticated => "authenticated",
            PushEvent::Disconnected { .. } => "disconnected",
            PushEvent::State { .. } => "state",
            PushEvent::Error { .. } => "error",
            PushEvent::Info(_) => "info",
            PushEvent::SessionCheck(_) => "session_check",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum BackendRequest {
    Connect { force_new_session: bool },
    Disconnect { delete_session: bool },
    GetStatus,
    GetAccountInfo,
    RepairConnection,
    ResetSession,
}

impl BackendRequest {
    pub fn operation(&self) -> &'static str {
        match self {
            BackendRequest::Connect { .. } => "connect",
            BackendRequest::Disconnect { .. } => "disconnect",
            BackendRequest::GetStatus => "get_status",
            BackendRequest::GetAccountInfo => "get_account_info",
            BackendRequest::RepairConnection => "repair_connection",
            BackendRequest::ResetSession => "reset_session",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "body")]
pub enum BackendReply {
    Ack,
    Status(StatusReport),
    Account(Option<AccountInfo>),
}

pub fn parse_push_value(raw: Value, received_at: DateTime<Utc>) -> Result<PushEvent, ErrorInfo> {
    let envelope: PushEnvelope = serde_json::from_value(raw).map_err(|err| {
        ErrorInfo::new(
            "invalid_envelope",
            format!("push envelope is invalid: {}", err),
        )
    })?;
    parse_push(envelope, received_at)
}

pub fn parse_push(
    envelope: PushEnvelope,
    received_at: DateTime<Utc>,
) -> Result<PushEvent, ErrorInfo> {
    let observed_at = match envelope.recorded_at.as_deref() {
        Some(value) => DateTime::parse_from_rfc3339(value)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|_| ErrorInfo::new("invalid_timestamp", "recorded_at must be RFC3339"))?,
        None => received_at,
    };
    let payload = envelope.payload;

    match normalize_channel(&envelope.channel).as_str() {
        "qr" => {
            let qr = require_text(&payload, &["qr", "code"], "qr")?;
            if qr.len() > MAX_QR_PAYLOAD_BYTES {
                return Err(ErrorInfo::new("invalid_payload", "qr payload is too large"));
            }
            Ok(PushEvent::Qr { payload: qr })
        }
        "ready" => Ok(PushEvent::Ready),
        "authenticated" => Ok(PushEvent::Authenticated),
        "disconnected" => {
            let reason = optional_text(&payload, &["reason"]).unwrap_or_default();
            Ok(PushEvent::Disconnected {
                reason: DisconnectReason::from_label(&reason),
            })
        }
        "auth_failure" => Ok(PushEvent::Disconnected {
            reason: DisconnectReason::Other("AUTH_FAILURE".to_string()),
        }),
        "state" | "change_state" => {
            let label = require_text(&payload, &["status", "state"], "status")?;
            Ok(PushEvent::State { label })
        }
        "error" => {
            let message = require_text(&payload, &["message", "error"], "message")?;
            Ok(PushEvent::Error { message })
        }
        "info" => {
            if payload.is_null() {
                return Ok(PushEvent::Info(None));
            }
            parse_account_info(&payload, observed_at).map(|info| PushEvent::Info(Some(info)))
        }
        "session_check" => parse_session_record(&payload, observed_at).map(PushEvent::SessionCheck),
        _ => Err(ErrorInfo::new(
            "invalid_channel",
            format!("unknown push channel: {}", envelope.channel),
        )),
    }
}

/// Parses an account payload, accepting the bridge's alternate field names.
pub fn parse_account_info(
    value: &Value,
    observed_at: DateTime<Utc>,
) -> Result<AccountInfo, ErrorInfo> {
    if !value.is_object() {
        return Err(ErrorInfo::new(
            "invalid_payload",
            "account info must be an object",
        ));
    }
    let phone_number = require_text(value, &["phoneNumber", "phone", "number"], "phoneNumber")?;
    let display_name =
        optional_text(value, &["displayName", "pushname", "name"]).unwrap_or_default();
    let avatar_url = optional_text(value, &["avatarUrl", "profilePicUrl"]);
    let connected = value
        .get("connected")
        .and_then(Value::as_bool)
        .unwrap_or(true);

    Ok(AccountInfo {
        phone_number,
        display_name,
        avatar_url,
        connected,
        observed_at,
    })
}

fn parse_session_record(
    value: &Value,
    observed_at: DateTime<Utc>,
) -> Result<SessionRecord, ErrorInfo> {
    let has_existing_session = value
        .get("hasExistingSession")
        .or_else(|| value.get("exists"))
        .and_then(Value::as_bool)
        .ok_or_else(|| ErrorInfo::new("missing_field", "hasExistingSession is required"))?;
    let is_connected = value
        .get("isConnected")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    Ok(SessionRecord {
        has_existing_session,
        is_connected,
        observed_at,
    })
}

/// `changeState`, `change-state`, `CHANGE_STATE` and `QR` all map to the
/// snake_case channel name.
fn normalize_channel(channel: &str) -> String {
    let mut normalized = String::with_capacity(channel.len() + 4);
    let mut previous: Option<char> = None;
    for ch in channel.trim().chars() {
        if ch == '-' {
            normalized.push('_');
        } else if ch.is_ascii_uppercase() {
            if previous.is_some_and(|prev| prev.is_ascii_lowercase() || prev.is_ascii_digit()) {
                normalized.push('_');
            }
            normalized.push(ch.to_ascii_lowercase());
        } else {
            normalized.push(ch);
        }
        previous = Some(ch);
    }
    normalized
}

fn optional_text(value: &Value, keys: &[&str]) -> Option<String> {
    let candidate = match value {
        Value::String(text) => Some(text.as_str()),
        Value::Object(map) => keys
            .iter()
            .find_map(|key| map.get(*key).and_then(Value::as_str)),
        _ => None,
    };
    candidate
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

fn require_text(value: &Value, keys: &[&str], field: &str) -> Result<String, ErrorInfo> {
    optional_text(value, keys)
        .ok_or_else(|| ErrorInfo::new("missing_field", format!("{} is required", field)))
}
