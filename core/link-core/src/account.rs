//! Deduplicating holder of the remote account identity.
//!
//! Observers only hear about identity changes, never about re-reads of the
//! same identity. Fetches are debounced: at most one in flight, and no new
//! fetch within `debounce` of the previous one. Requests inside the window
//! collapse into a single trailing fetch.

use chrono::{DateTime, Duration, Utc};
use sessionlink_protocol::AccountInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheUpdate {
    Changed,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchDecision {
    /// Issue the fetch now.
    Issue,
    /// A fetch is already in flight; its result will serve this request.
    Coalesced,
    /// Too soon after the previous fetch; run one trailing fetch at this time.
    Deferred(DateTime<Utc>),
}

#[derive(Debug, Clone)]
pub struct AccountInfoCache {
    snapshot: Option<AccountInfo>,
    debounce: Duration,
    in_flight: bool,
    last_fetch_at: Option<DateTime<Utc>>,
}

impl AccountInfoCache {
    pub fn new(debounce: Duration) -> Self {
        Self {
            snapshot: None,
            debounce,
            in_flight: false,
            last_fetch_at: None,
        }
    }

    pub fn snapshot(&self) -> Option<&AccountInfo> {
        self.snapshot.as_ref()
    }

    pub fn update(&mut self, candidate: AccountInfo) -> CacheUpdate {
        let outcome = match &self.snapshot {
            Some(current) if !current.identity_differs(&candidate) => CacheUpdate::Unchanged,
            _ => CacheUpdate::Changed,
        };
        self.snapshot = Some(candidate);
        outcome
    }

    /// Drops the identity. Returns true when something was cached.
    pub fn clear(&mut self) -> bool {
        self.snapshot.take().is_some()
    }

    pub fn request_fetch(&mut self, now: DateTime<Utc>) -> FetchDecision {
        if self.in_flight {
            return FetchDecision::Coalesced;
        }
        if let Some(last) = self.last_fetch_at {
            let earliest = last + self.debounce;
            if now < earliest {
                return FetchDecision::Deferred(earliest);
            }
        }
        self.in_flight = true;
        self.last_fetch_at = Some(now);
        FetchDecision::Issue
    }

    pub fn fetch_in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn finish_fetch(&mut self) {
        self.in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-02T09:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn info(name: &str) -> AccountInfo {
        AccountInfo {
            phone_number: "15550100".to_string(),
            display_name: name.to_string(),
            avatar_url: None,
            connected: true,
            observed_at: t0(),
        }
    }

    #[test]
    fn identical_update_is_unchanged() {
        let mut cache = AccountInfoCache::new(Duration::seconds(5));
        assert_eq!(cache.update(info("Ana")), CacheUpdate::Changed);
        assert_eq!(cache.update(info("Ana")), CacheUpdate::Unchanged);
        assert_eq!(cache.update(info("Ana B.")), CacheUpdate::Changed);
    }

    #[test]
    fn refreshed_timestamp_alone_is_unchanged_but_stored() {
        let mut cache = AccountInfoCache::new(Duration::seconds(5));
        cache.update(info("Ana"));
        let mut later = info("Ana");
        later.observed_at = t0() + Duration::minutes(3);
        assert_eq!(cache.update(later), CacheUpdate::Unchanged);
        assert_eq!(
            cache.snapshot().map(|snapshot| snapshot.observed_at),
            Some(t0() + Duration::minutes(3))
        );
    }

    #[test]
    fn clear_makes_next_update_a_change() {
        let mut cache = AccountInfoCache::new(Duration::seconds(5));
        cache.update(info("Ana"));
        assert!(cache.clear());
        assert!(!cache.clear());
        assert_eq!(cache.update(info("Ana")), CacheUpdate::Changed);
    }

    #[test]
    fn burst_of_requests_collapses() {
        let mut cache = AccountInfoCache::new(Duration::seconds(5));
        assert_eq!(cache.request_fetch(t0()), FetchDecision::Issue);
        assert_eq!(cache.request_fetch(t0()), FetchDecision::Coalesced);
        cache.finish_fetch();

        let soon = t0() + Duration::seconds(2);
        assert_eq!(
            cache.request_fetch(soon),
            FetchDecision::Deferred(t0() + Duration::seconds(5))
        );
        assert_eq!(
            cache.request_fetch(t0() + Duration::seconds(5)),
            FetchDecision::Issue
        );
    }
}
