//! Process-local cache of resolved tunnel URLs.
//!
//! Tunnels expire at an unknown point in time. Entries are trusted for a
//! fixed [`ResolutionCache::TTL`] and then treated as absent, even while they
//! are still stored. The TTL only saves extraction calls: a fresh entry can
//! still point at a dead tunnel, which the self-healing controller handles.

use std::{collections::HashMap, time::Duration};

use tokio::time::Instant;
use url::Url;

use crate::track::TrackId;

#[derive(Clone, Debug)]
struct Entry {
    url: Url,
    resolved_at: Instant,
}

impl Entry {
    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.resolved_at) < ResolutionCache::TTL
    }
}

/// Maps track identifiers to their most recently resolved URL.
///
/// Uses the tokio clock so that expiry follows a paused test clock.
#[derive(Debug, Default)]
pub struct ResolutionCache {
    entries: HashMap<TrackId, Entry>,
}

impl ResolutionCache {
    /// How long a resolved URL is trusted.
    pub const TTL: Duration = Duration::from_secs(15 * 60);

    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached URL, unless it was resolved [`Self::TTL`] or more
    /// ago.
    #[must_use]
    pub fn get(&self, id: &TrackId) -> Option<&Url> {
        let now = Instant::now();
        self.entries
            .get(id)
            .filter(|entry| entry.is_fresh(now))
            .map(|entry| &entry.url)
    }

    /// Stores `url` as resolved now, replacing any previous entry.
    pub fn put(&mut self, id: TrackId, url: Url) {
        trace!("caching resolution for {id}");
        self.entries.insert(
            id,
            Entry {
                url,
                resolved_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&mut self, id: &TrackId) {
        if self.entries.remove(id).is_some() {
            debug!("invalidated cached resolution for {id}");
        }
    }

    /// Drops all entries that `get` would no longer return.
    pub fn purge_expired(&mut self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));

        let purged = before - self.entries.len();
        if purged > 0 {
            trace!("purged {purged} expired resolutions");
        }
        purged
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> TrackId {
        s.parse().unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn entries_expire_after_ttl() {
        let mut cache = ResolutionCache::new();
        cache.put(id("t1"), url("https://tunnel.example.net/a"));

        tokio::time::advance(Duration::from_secs(14 * 60 + 59)).await;
        assert_eq!(
            cache.get(&id("t1")).map(Url::as_str),
            Some("https://tunnel.example.net/a")
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cache.get(&id("t1")), None);

        // Expired, but still stored until purged.
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.purge_expired(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn put_overwrites_and_restarts_the_clock() {
        let mut cache = ResolutionCache::new();
        cache.put(id("t1"), url("https://tunnel.example.net/a"));

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        cache.put(id("t1"), url("https://tunnel.example.net/b"));

        tokio::time::advance(Duration::from_secs(10 * 60)).await;
        assert_eq!(
            cache.get(&id("t1")).map(Url::as_str),
            Some("https://tunnel.example.net/b")
        );
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn invalidate_only_affects_one_track() {
        let mut cache = ResolutionCache::new();
        cache.put(id("t1"), url("https://tunnel.example.net/a"));
        cache.put(id("t2"), url("https://tunnel.example.net/b"));

        cache.invalidate(&id("t1"));
        assert_eq!(cache.get(&id("t1")), None);
        assert!(cache.get(&id("t2")).is_some());

        // Invalidating a missing entry is fine.
        cache.invalidate(&id("t3"));
        assert_eq!(cache.purge_expired(), 0);
    }
}
