//! Sticky "user logged out" decision.
//!
//! Set only by an explicit logout (or a remote `LOGOUT` disconnect), cleared
//! only by an explicit connect. Every automatic reconnect path reads it first.

use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionIntent {
    deleted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    changed_at: Option<DateTime<Utc>>,
}

impl SessionIntent {
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Returns true when the flag flipped.
    pub fn mark_deleted(&mut self, now: DateTime<Utc>) -> bool {
        if self.deleted {
            return false;
        }
        self.deleted = true;
        self.changed_at = Some(now);
        true
    }

    /// Only a user-initiated connect may call this.
    pub fn clear_for_explicit_connect(&mut self, now: DateTime<Utc>) -> bool {
        if !self.deleted {
            return false;
        }
        self.deleted = false;
        self.changed_at = Some(now);
        true
    }

    /// Gate for automatic paths (watchdog, auto-reconnect, recovery).
    pub fn allows_automatic_connect(&self) -> bool {
        !self.deleted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_is_sticky_until_explicit_connect() {
        let now = Utc::now();
        let mut intent = SessionIntent::default();
        assert!(intent.allows_automatic_connect());

        assert!(intent.mark_deleted(now));
        assert!(!intent.mark_deleted(now));
        assert!(!intent.allows_automatic_connect());

        assert!(intent.clear_for_explicit_connect(now));
        assert!(intent.allows_automatic_connect());
        assert!(!intent.clear_for_explicit_connect(now));
    }
}
