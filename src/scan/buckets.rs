use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct ProxyBucket {
    url: String,
    disabled_until: Option<Instant>,
    consecutive_failures: u32,
}

impl ProxyBucket {
    fn is_available(&self, now: Instant) -> bool {
        self.disabled_until.map_or(true, |until| now >= until)
    }
}

/// Per-proxy circuit state for one scan run
///
/// Selection is round-robin from a caller-supplied start index, skipping
/// buckets that are disabled.
#[derive(Debug)]
pub struct ProxyBuckets {
    buckets: RwLock<Vec<ProxyBucket>>,
}

impl ProxyBuckets {
    pub fn new(urls: &[String]) -> Self {
        Self {
            buckets: RwLock::new(
                urls.iter()
                    .map(|url| ProxyBucket {
                        url: url.clone(),
                        disabled_until: None,
                        consecutive_failures: 0,
                    })
                    .collect(),
            ),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// First available bucket at or after `start`, wrapping around
    pub fn pick(&self, start: usize) -> Option<(usize, String)> {
        let buckets = self.buckets.read();
        let len = buckets.len();
        let now = Instant::now();

        (0..len)
            .map(|offset| (start + offset) % len)
            .find(|&idx| buckets[idx].is_available(now))
            .map(|idx| (idx, buckets[idx].url.clone()))
    }

    pub fn available_count(&self) -> usize {
        let now = Instant::now();
        self.buckets
            .read()
            .iter()
            .filter(|b| b.is_available(now))
            .count()
    }

    pub fn record_success(&self, idx: usize) {
        if let Some(bucket) = self.buckets.write().get_mut(idx) {
            bucket.consecutive_failures = 0;
        }
    }

    /// Count a proxy-level failure; disables the bucket for `disable_for`
    /// once `threshold` consecutive failures are reached. Returns whether
    /// the bucket was disabled.
    pub fn record_failure(&self, idx: usize, threshold: u32, disable_for: Duration) -> bool {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(idx) else {
            return false;
        };

        bucket.consecutive_failures += 1;
        if bucket.consecutive_failures < threshold.max(1) {
            return false;
        }

        bucket.consecutive_failures = 0;
        let until = Instant::now() + disable_for;
        bucket.disabled_until = Some(bucket.disabled_until.map_or(until, |prev| prev.max(until)));
        true
    }

    /// Disable a bucket until `until`; an existing later deadline wins
    pub fn disable_until(&self, idx: usize, until: Instant) {
        if let Some(bucket) = self.buckets.write().get_mut(idx) {
            bucket.disabled_until = Some(bucket.disabled_until.map_or(until, |prev| prev.max(until)));
        }
    }
}
