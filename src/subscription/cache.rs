use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// One cached subscription body
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedBody {
    url: String,
    fetched_at_ms: i64,
    body: String,
}

/// On-disk cache of the last good body per subscription URL
///
/// Used only as a fallback when a live fetch fails.
#[derive(Debug, Clone)]
pub struct SubscriptionCache {
    dir: PathBuf,
    ttl: Duration,
}

impl SubscriptionCache {
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            dir: dir.into(),
            ttl,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, url: &str) -> PathBuf {
        let hash = blake3::hash(url.as_bytes()).to_hex();
        self.dir.join(format!("{}.json", &hash[..16]))
    }

    /// Persist a body, replacing the previous one atomically
    pub async fn store(&self, url: &str, body: &str) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let entry = CachedBody {
            url: url.to_string(),
            fetched_at_ms: Utc::now().timestamp_millis(),
            body: body.to_string(),
        };
        let path = self.path_for(url);
        let tmp = path.with_extension("json.tmp");

        tokio::fs::write(&tmp, serde_json::to_vec(&entry)?).await?;
        tokio::fs::rename(&tmp, &path).await?;

        debug!(url = %url, path = %path.display(), "Cached subscription body");
        Ok(())
    }

    /// Cached body for `url` if one exists and is younger than the TTL
    pub async fn load_fresh(&self, url: &str) -> Option<String> {
        let path = self.path_for(url);
        let bytes = tokio::fs::read(&path).await.ok()?;

        let entry: CachedBody = match serde_json::from_slice(&bytes) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring corrupt subscription cache entry");
                return None;
            }
        };

        let age_ms = Utc::now().timestamp_millis().saturating_sub(entry.fetched_at_ms).max(0) as u128;
        if entry.url != url || age_ms > self.ttl.as_millis() {
            return None;
        }

        Some(entry.body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path().join("subs"), Duration::from_secs(60));

        assert!(cache.load_fresh("https://a.example/sub").await.is_none());

        cache.store("https://a.example/sub", "trojan://x@y:443").await.unwrap();
        assert_eq!(
            cache.load_fresh("https://a.example/sub").await.as_deref(),
            Some("trojan://x@y:443")
        );
        assert!(cache.load_fresh("https://b.example/sub").await.is_none());
    }

    #[tokio::test]
    async fn test_expired_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::ZERO);

        let entry = CachedBody {
            url: "https://a.example/sub".to_string(),
            fetched_at_ms: Utc::now().timestamp_millis() - 10_000,
            body: "old".to_string(),
        };
        std::fs::write(
            cache.path_for("https://a.example/sub"),
            serde_json::to_vec(&entry).unwrap(),
        )
        .unwrap();

        assert!(cache.load_fresh("https://a.example/sub").await.is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let cache = SubscriptionCache::new(dir.path(), Duration::from_secs(60));
        std::fs::write(cache.path_for("https://a.example/sub"), b"{not json").unwrap();

        assert!(cache.load_fresh("https://a.example/sub").await.is_none());
    }
}
