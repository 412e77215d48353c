//! Duplicate event suppression
//!
//! A fingerprint is SHA-256 over the event name, its canonical property
//! encoding, the user id and a coarse time bucket. Identical fingerprints seen
//! inside the window are suppressed. The window is not extended by repeats:
//! a burst of identical events lets one through per window. Near a bucket
//! boundary the previous bucket's fingerprint is consulted as well.

use crate::config::DedupConfig;
use crate::types::Properties;
use chrono::{DateTime, Duration, Utc};
use lru::LruCache;
use sha2::{Digest, Sha256};
use std::num::NonZeroUsize;
use std::sync::Mutex;

/// Bounded TTL set of recent fingerprints
pub struct Deduplicator {
    window: Duration,
    bucket_secs: i64,
    /// Fingerprint -> first seen
    seen: Mutex<LruCache<String, DateTime<Utc>>>,
}

impl Deduplicator {
    pub fn new(config: &DedupConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            window: Duration::seconds(config.window_secs as i64),
            bucket_secs: config.bucket_secs as i64,
            seen: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn bucket(&self, now: DateTime<Utc>) -> i64 {
        if self.bucket_secs > 0 {
            now.timestamp().div_euclid(self.bucket_secs)
        } else {
            0
        }
    }

    /// Compute the fingerprint of an event
    ///
    /// Returns a 32-character hex digest.
    pub fn fingerprint(
        &self,
        name: &str,
        properties: &Properties,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> String {
        fingerprint_in_bucket(name, properties, user_id, self.bucket(now))
    }

    /// Returns `true` if an identical event was accepted within the window.
    ///
    /// Near the start of a bucket the previous bucket's fingerprint is checked
    /// too, so two events straddling a bucket boundary are still caught.
    pub fn is_duplicate(
        &self,
        name: &str,
        properties: &Properties,
        user_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let bucket = self.bucket(now);
        let current = fingerprint_in_bucket(name, properties, user_id, bucket);

        let into_bucket = now.timestamp() - bucket * self.bucket_secs;
        if self.bucket_secs > 0 && into_bucket < self.window.num_seconds() {
            let previous = fingerprint_in_bucket(name, properties, user_id, bucket - 1);
            let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
            if within_window(&mut seen, &previous, now, self.window) {
                return true;
            }
        }

        self.should_suppress(&current, now)
    }

    /// Returns `true` if `fingerprint` was seen within the window.
    ///
    /// A miss (or an expired hit) records the fingerprint with `now`.
    pub fn should_suppress(&self, fingerprint: &str, now: DateTime<Utc>) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());

        if within_window(&mut seen, fingerprint, now, self.window) {
            return true;
        }

        seen.put(fingerprint.to_string(), now);
        false
    }

    /// Fingerprints currently remembered (expired ones included until evicted)
    pub fn len(&self) -> usize {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn within_window(
    seen: &mut LruCache<String, DateTime<Utc>>,
    fingerprint: &str,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    seen.get(fingerprint)
        .is_some_and(|first_seen| now - *first_seen < window)
}

fn fingerprint_in_bucket(
    name: &str,
    properties: &Properties,
    user_id: Option<&str>,
    bucket: i64,
) -> String {
    // Properties are a BTreeMap, so the encoding is key-ordered
    let content = serde_json::to_string(properties).unwrap_or_default();
    let hash_input = format!(
        "{}:{}:{}:{}",
        name,
        content,
        user_id.unwrap_or(""),
        bucket
    );

    let mut hasher = Sha256::new();
    hasher.update(hash_input.as_bytes());
    let result = hasher.finalize();

    hex::encode(&result[..16])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::props;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 10, 15, 0).unwrap()
    }

    fn dedup() -> Deduplicator {
        Deduplicator::new(&DedupConfig::default())
    }

    #[test]
    fn test_suppressed_within_window() {
        let dedup = dedup();
        let fp = dedup.fingerprint("note_created", &props! { "noteId" => "n1" }, None, t0());

        assert!(!dedup.should_suppress(&fp, t0()));
        assert!(dedup.should_suppress(&fp, t0() + Duration::seconds(30)));
        assert!(dedup.should_suppress(&fp, t0() + Duration::seconds(59)));
    }

    #[test]
    fn test_accepted_after_window() {
        let dedup = dedup();
        let fp = dedup.fingerprint("note_created", &props! { "noteId" => "n1" }, None, t0());

        assert!(!dedup.should_suppress(&fp, t0()));
        assert!(!dedup.should_suppress(&fp, t0() + Duration::seconds(61)));
        // The accepted repeat opened a fresh window
        assert!(dedup.should_suppress(&fp, t0() + Duration::seconds(62)));
    }

    #[test]
    fn test_repeats_do_not_extend_window() {
        let dedup = dedup();
        let fp = "abc";
        assert!(!dedup.should_suppress(fp, t0()));
        assert!(dedup.should_suppress(fp, t0() + Duration::seconds(40)));
        assert!(!dedup.should_suppress(fp, t0() + Duration::seconds(60)));
    }

    #[test]
    fn test_fingerprint_inputs() {
        let dedup = dedup();
        let props = props! { "noteId" => "n1" };
        let base = dedup.fingerprint("note_created", &props, None, t0());

        assert_eq!(base.len(), 32);
        assert_eq!(base, dedup.fingerprint("note_created", &props, None, t0()));
        assert_ne!(base, dedup.fingerprint("note_deleted", &props, None, t0()));
        assert_ne!(
            base,
            dedup.fingerprint("note_created", &props! { "noteId" => "n2" }, None, t0())
        );
        assert_ne!(base, dedup.fingerprint("note_created", &props, Some("u1"), t0()));
    }

    #[test]
    fn test_duplicates_straddling_bucket_boundary() {
        let dedup = dedup();
        let props = props! { "noteId" => "n1" };
        let before = Utc.with_ymd_and_hms(2026, 3, 2, 9, 59, 50).unwrap();
        let after = before + Duration::seconds(20);

        // Different buckets, so the raw fingerprints differ
        assert_ne!(
            dedup.fingerprint("note_created", &props, None, before),
            dedup.fingerprint("note_created", &props, None, after)
        );
        assert!(!dedup.is_duplicate("note_created", &props, None, before));
        assert!(dedup.is_duplicate("note_created", &props, None, after));

        // Once the window has passed the repeat is accepted again
        let later = before + Duration::seconds(61);
        assert!(!dedup.is_duplicate("note_created", &props, None, later));
        assert!(!dedup.is_duplicate("note_created", &props, Some("u1"), later));
    }

    #[test]
    fn test_is_duplicate_without_buckets() {
        let dedup = Deduplicator::new(&DedupConfig {
            bucket_secs: 0,
            ..Default::default()
        });
        let props = props! { "noteId" => "n1" };
        assert!(!dedup.is_duplicate("note_created", &props, None, t0()));
        assert!(dedup.is_duplicate("note_created", &props, None, t0() + Duration::seconds(59)));
        assert!(!dedup.is_duplicate("note_created", &props, None, t0() + Duration::seconds(60)));
    }

    #[test]
    fn test_lru_capacity_evicts_oldest() {
        let dedup = Deduplicator::new(&DedupConfig {
            capacity: 2,
            ..Default::default()
        });
        assert!(!dedup.should_suppress("a", t0()));
        assert!(!dedup.should_suppress("b", t0()));
        assert!(!dedup.should_suppress("c", t0()));
        assert_eq!(dedup.len(), 2);
        // "a" was evicted, so it is accepted again
        assert!(!dedup.should_suppress("a", t0()));
    }
}
