//! Per-identity cooldown for firehose-triggered reconciliation.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Minimum time between two firehose-triggered passes for the same identity.
pub const DEFAULT_SYNC_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Remembers when each identity was last handed to the crawler.
#[derive(Debug)]
pub struct SyncLimiter {
    cooldown: Duration,
    last_sync: Mutex<HashMap<String, Instant>>,
}

impl SyncLimiter {
    /// Create a new limiter refusing repeat requests within `cooldown`.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_sync: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` and records the attempt when `did` is outside its cooldown.
    pub fn should_sync(&self, did: &str) -> bool {
        self.should_sync_at(did, Instant::now())
    }

    /// [`should_sync`](Self::should_sync) with an explicit clock reading.
    ///
    /// Granting a request also forgets every identity whose cooldown has expired.
    pub fn should_sync_at(&self, did: &str, now: Instant) -> bool {
        let mut last_sync = self.last_sync.lock();
        if let Some(last) = last_sync.get(did) {
            if now.saturating_duration_since(*last) < self.cooldown {
                return false;
            }
        }
        let cooldown = self.cooldown;
        last_sync.retain(|_, last| now.saturating_duration_since(*last) < cooldown);
        last_sync.insert(did.to_string(), now);
        true
    }

    /// Number of identities currently inside their cooldown window (or not yet pruned).
    pub fn tracked(&self) -> usize {
        self.last_sync.lock().len()
    }
}

impl Default for SyncLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_COOLDOWN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_request_within_cooldown_is_refused() {
        let limiter = SyncLimiter::default();
        let start = Instant::now();
        assert!(limiter.should_sync_at("did:plc:alice", start));
        assert!(!limiter.should_sync_at("did:plc:alice", start + Duration::from_secs(60)));
        assert!(limiter.should_sync_at("did:plc:alice", start + DEFAULT_SYNC_COOLDOWN));
    }

    #[test]
    fn identities_are_independent() {
        let limiter = SyncLimiter::default();
        assert!(limiter.should_sync("did:plc:alice"));
        assert!(limiter.should_sync("did:plc:bob"));
        assert!(!limiter.should_sync("did:plc:alice"));
        assert_eq!(limiter.tracked(), 2);
    }

    #[test]
    fn expired_identities_are_forgotten() {
        let limiter = SyncLimiter::new(Duration::from_secs(60));
        let start = Instant::now();
        for i in 0..100 {
            assert!(limiter.should_sync_at(&format!("did:plc:user{i}"), start));
        }
        assert_eq!(limiter.tracked(), 100);

        let later = start + Duration::from_secs(61);
        assert!(limiter.should_sync_at("did:plc:late", later));
        assert_eq!(limiter.tracked(), 1);
        assert!(!limiter.should_sync_at("did:plc:late", later + Duration::from_secs(1)));
    }

    #[test]
    fn zero_cooldown_always_allows() {
        let limiter = SyncLimiter::new(Duration::ZERO);
        assert!(limiter.should_sync("did:plc:alice"));
        assert!(limiter.should_sync("did:plc:alice"));
    }

    #[test]
    fn concurrent_checks_grant_exactly_one() {
        let limiter = std::sync::Arc::new(SyncLimiter::default());
        let granted: usize = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.should_sync("did:plc:alice"))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|handle| handle.join().expect("thread") as usize)
            .sum();
        assert_eq!(granted, 1);
    }
}
