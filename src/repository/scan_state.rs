use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::debug;

use crate::config::ScanConfig;
use crate::error::Result;
use crate::models::{AttemptMeta, PersistedScanRecord, SkipDecision, SkipReason};

/// Durable, cross-process scan state consumed by the scan orchestrator
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Decide whether an item must be skipped without a network call
    async fn should_skip(&self, item_id: &str) -> Result<SkipDecision>;

    async fn record_success(&self, item_id: &str, meta: &AttemptMeta) -> Result<()>;

    /// Record a failed attempt; `meta.retry_after` sets the earliest retry
    async fn record_failure(&self, item_id: &str, meta: &AttemptMeta) -> Result<()>;

    /// Never retry this item again
    async fn mark_permanent(&self, item_id: &str, meta: &AttemptMeta) -> Result<()>;

    /// Reserve the next slot of `bucket`, spaced `interval` after the
    /// previous one. Returns how long the caller must wait for its slot.
    async fn reserve_rate_limit(&self, bucket: &str, interval: Duration) -> Result<Duration>;

    /// Failed items whose retry-after has passed, oldest first
    async fn list_due_retry(&self, limit: usize) -> Result<Vec<String>>;

    /// Non-permanent items not checked for at least `min_age`, oldest first
    async fn list_stale(&self, limit: usize, min_age: Duration) -> Result<Vec<String>>;

    async fn save_cursor(&self, name: &str, value: &Value) -> Result<()>;

    async fn load_cursor(&self, name: &str) -> Result<Option<Value>>;
}

/// SQLite-backed [`StateStore`] scoped to one domain
#[derive(Clone)]
pub struct ScanStateRepository {
    pool: SqlitePool,
    domain: String,
    fresh_success_ttl: Duration,
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

impl ScanStateRepository {
    pub fn new(pool: SqlitePool, domain: impl Into<String>) -> Self {
        Self {
            pool,
            domain: domain.into(),
            fresh_success_ttl: Duration::ZERO,
        }
    }

    /// Repository for the scan settings' domain and fresh-success window
    pub fn from_config(pool: SqlitePool, config: &ScanConfig) -> Self {
        Self::new(pool, config.domain.clone()).with_fresh_success_ttl(config.fresh_success_ttl)
    }

    /// Skip items that succeeded more recently than `ttl`
    pub fn with_fresh_success_ttl(mut self, ttl: Duration) -> Self {
        self.fresh_success_ttl = ttl;
        self
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Get the stored record of an item
    pub async fn get_record(&self, item_id: &str) -> Result<Option<PersistedScanRecord>> {
        let record = sqlx::query_as::<_, PersistedScanRecord>(
            r#"
            SELECT domain, item_id, status, last_checked_ms, consecutive_failures,
                   retry_after_ms, permanent, attempts, last_http_status, last_error,
                   last_proxy, last_success_ms
            FROM scan_records
            WHERE domain = ?1 AND item_id = ?2
            "#,
        )
        .bind(&self.domain)
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    fn decide(&self, record: &PersistedScanRecord, now: i64) -> SkipDecision {
        if record.permanent {
            return SkipDecision::Skip(SkipReason::Permanent);
        }
        if let Some(retry_after_ms) = record.retry_after_ms {
            if retry_after_ms > now {
                return SkipDecision::Skip(SkipReason::NotDue { retry_after_ms });
            }
        }
        if !self.fresh_success_ttl.is_zero() {
            if let Some(success_ms) = record.last_success_ms {
                if now - success_ms < duration_ms(self.fresh_success_ttl) {
                    return SkipDecision::Skip(SkipReason::Fresh);
                }
            }
        }
        SkipDecision::Attempt
    }
}

#[async_trait]
impl StateStore for ScanStateRepository {
    async fn should_skip(&self, item_id: &str) -> Result<SkipDecision> {
        let decision = match self.get_record(item_id).await? {
            Some(record) => self.decide(&record, now_ms()),
            None => SkipDecision::Attempt,
        };
        Ok(decision)
    }

    async fn record_success(&self, item_id: &str, meta: &AttemptMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_records (
                domain, item_id, status, last_checked_ms, consecutive_failures,
                retry_after_ms, permanent, attempts, last_http_status, last_error,
                last_proxy, last_success_ms
            )
            VALUES (?1, ?2, 'success', ?3, 0, NULL, 0, 1, ?4, NULL, ?5, ?3)
            ON CONFLICT (domain, item_id) DO UPDATE SET
                status = 'success',
                last_checked_ms = ?3,
                consecutive_failures = 0,
                retry_after_ms = NULL,
                attempts = scan_records.attempts + 1,
                last_http_status = ?4,
                last_error = NULL,
                last_proxy = ?5,
                last_success_ms = ?3
            "#,
        )
        .bind(&self.domain)
        .bind(item_id)
        .bind(now_ms())
        .bind(meta.http_status.map(i64::from))
        .bind(meta.proxy.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn record_failure(&self, item_id: &str, meta: &AttemptMeta) -> Result<()> {
        let now = now_ms();
        let retry_after_ms = meta.retry_after.map(|d| now.saturating_add(duration_ms(d)));

        sqlx::query(
            r#"
            INSERT INTO scan_records (
                domain, item_id, status, last_checked_ms, consecutive_failures,
                retry_after_ms, permanent, attempts, last_http_status, last_error, last_proxy
            )
            VALUES (?1, ?2, 'failure', ?3, 1, ?4, 0, 1, ?5, ?6, ?7)
            ON CONFLICT (domain, item_id) DO UPDATE SET
                status = CASE WHEN scan_records.permanent = 1 THEN 'permanent' ELSE 'failure' END,
                last_checked_ms = ?3,
                consecutive_failures = scan_records.consecutive_failures + 1,
                retry_after_ms = ?4,
                attempts = scan_records.attempts + 1,
                last_http_status = ?5,
                last_error = ?6,
                last_proxy = ?7
            "#,
        )
        .bind(&self.domain)
        .bind(item_id)
        .bind(now)
        .bind(retry_after_ms)
        .bind(meta.http_status.map(i64::from))
        .bind(meta.error.as_deref())
        .bind(meta.proxy.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_permanent(&self, item_id: &str, meta: &AttemptMeta) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_records (
                domain, item_id, status, last_checked_ms, consecutive_failures,
                retry_after_ms, permanent, attempts, last_http_status, last_error, last_proxy
            )
            VALUES (?1, ?2, 'permanent', ?3, 0, NULL, 1, 1, ?4, ?5, ?6)
            ON CONFLICT (domain, item_id) DO UPDATE SET
                status = 'permanent',
                last_checked_ms = ?3,
                retry_after_ms = NULL,
                permanent = 1,
                attempts = scan_records.attempts + 1,
                last_http_status = ?4,
                last_error = ?5,
                last_proxy = ?6
            "#,
        )
        .bind(&self.domain)
        .bind(item_id)
        .bind(now_ms())
        .bind(meta.http_status.map(i64::from))
        .bind(meta.error.as_deref())
        .bind(meta.proxy.as_deref())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn reserve_rate_limit(&self, bucket: &str, interval: Duration) -> Result<Duration> {
        let now = now_ms();
        let interval_ms = duration_ms(interval);

        // One statement: the slot is max(previous next_allowed, now) and the
        // bucket advances to slot + interval. SQLite serializes writers, so
        // concurrent callers in any process never receive overlapping slots.
        let granted_ms: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO rate_limits (bucket, next_allowed_ms, updated_at_ms)
            VALUES (?1, ?2 + ?3, ?2)
            ON CONFLICT (bucket) DO UPDATE SET
                next_allowed_ms = MAX(rate_limits.next_allowed_ms, ?2) + ?3,
                updated_at_ms = ?2
            RETURNING next_allowed_ms - ?3
            "#,
        )
        .bind(bucket)
        .bind(now)
        .bind(interval_ms)
        .fetch_one(&self.pool)
        .await?;

        let wait_ms = (granted_ms - now).max(0);
        debug!(bucket = bucket, wait_ms = wait_ms, "Reserved rate-limit slot");

        Ok(Duration::from_millis(wait_ms as u64))
    }

    async fn list_due_retry(&self, limit: usize) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT item_id FROM scan_records
            WHERE domain = ?1
              AND status = 'failure'
              AND permanent = 0
              AND (retry_after_ms IS NULL OR retry_after_ms <= ?2)
            ORDER BY COALESCE(retry_after_ms, last_checked_ms) ASC, item_id ASC
            LIMIT ?3
            "#,
        )
        .bind(&self.domain)
        .bind(now_ms())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn list_stale(&self, limit: usize, min_age: Duration) -> Result<Vec<String>> {
        let cutoff = now_ms().saturating_sub(duration_ms(min_age));

        let ids = sqlx::query_scalar::<_, String>(
            r#"
            SELECT item_id FROM scan_records
            WHERE domain = ?1
              AND permanent = 0
              AND last_checked_ms <= ?2
            ORDER BY last_checked_ms ASC, item_id ASC
            LIMIT ?3
            "#,
        )
        .bind(&self.domain)
        .bind(cutoff)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        Ok(ids)
    }

    async fn save_cursor(&self, name: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO scan_cursors (domain, name, value, updated_at_ms)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (domain, name) DO UPDATE SET
                value = ?3,
                updated_at_ms = ?4
            "#,
        )
        .bind(&self.domain)
        .bind(name)
        .bind(Json(value))
        .bind(now_ms())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn load_cursor(&self, name: &str) -> Result<Option<Value>> {
        let value = sqlx::query_scalar::<_, Json<Value>>(
            "SELECT value FROM scan_cursors WHERE domain = ?1 AND name = ?2",
        )
        .bind(&self.domain)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(|json| json.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigOptions, StateConfig};
    use crate::database::Database;
    use crate::models::ScanStatus;
    use serde_json::json;

    async fn create_test_repo() -> ScanStateRepository {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        ScanStateRepository::new(db.pool().clone(), "test")
    }

    fn failure(retry_after: Option<Duration>) -> AttemptMeta {
        AttemptMeta {
            http_status: Some(502),
            error: Some("bad gateway".to_string()),
            proxy: Some("http://127.0.0.1:18000".to_string()),
            retry_after,
        }
    }

    #[tokio::test]
    async fn test_unknown_item_is_attempted() {
        let repo = create_test_repo().await;
        assert_eq!(repo.should_skip("1").await.unwrap(), SkipDecision::Attempt);
    }

    #[tokio::test]
    async fn test_permanent_is_skipped_forever() {
        let repo = create_test_repo().await;
        repo.mark_permanent("42", &AttemptMeta::default())
            .await
            .unwrap();
        // A later failure does not clear the permanent flag
        repo.record_failure("42", &failure(None)).await.unwrap();

        assert_eq!(
            repo.should_skip("42").await.unwrap(),
            SkipDecision::Skip(SkipReason::Permanent)
        );
        let record = repo.get_record("42").await.unwrap().unwrap();
        assert_eq!(record.status, ScanStatus::Permanent);
        assert_eq!(record.attempts, 2);
    }

    #[tokio::test]
    async fn test_failure_with_retry_after_is_not_due() {
        let repo = create_test_repo().await;
        repo.record_failure("7", &failure(Some(Duration::from_secs(600))))
            .await
            .unwrap();
        assert!(matches!(
            repo.should_skip("7").await.unwrap(),
            SkipDecision::Skip(SkipReason::NotDue { .. })
        ));

        repo.record_failure("8", &failure(None)).await.unwrap();
        assert_eq!(repo.should_skip("8").await.unwrap(), SkipDecision::Attempt);

        let record = repo.get_record("7").await.unwrap().unwrap();
        assert_eq!(record.consecutive_failures, 1);
        assert_eq!(record.last_http_status, Some(502));
        assert!(record.retry_after().is_some());
    }

    #[tokio::test]
    async fn test_success_resets_failures() {
        let repo = create_test_repo().await;
        repo.record_failure("9", &failure(None)).await.unwrap();
        repo.record_failure("9", &failure(None)).await.unwrap();
        repo.record_success(
            "9",
            &AttemptMeta {
                http_status: Some(200),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let record = repo.get_record("9").await.unwrap().unwrap();
        assert_eq!(record.status, ScanStatus::Success);
        assert_eq!(record.consecutive_failures, 0);
        assert_eq!(record.attempts, 3);
        assert!(record.last_success_ms.is_some());
        assert!(record.last_error.is_none());
    }

    #[tokio::test]
    async fn test_fresh_success_is_skipped_with_ttl() {
        let repo = create_test_repo()
            .await
            .with_fresh_success_ttl(Duration::from_secs(3600));
        repo.record_success("5", &AttemptMeta::default())
            .await
            .unwrap();
        assert_eq!(
            repo.should_skip("5").await.unwrap(),
            SkipDecision::Skip(SkipReason::Fresh)
        );
    }

    #[tokio::test]
    async fn test_from_config_applies_domain_and_fresh_ttl() {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let options = ConfigOptions {
            scan_domain: Some("catalog".to_string()),
            scan_fresh_success_ttl_secs: Some(3600),
            ..Default::default()
        };
        let config = Config::resolve(options, ConfigOptions::default(), ConfigOptions::default())
            .unwrap();

        let repo = ScanStateRepository::from_config(db.pool().clone(), &config.scan);
        assert_eq!(repo.domain(), "catalog");

        repo.record_success("7", &AttemptMeta::default())
            .await
            .unwrap();
        assert_eq!(
            repo.should_skip("7").await.unwrap(),
            SkipDecision::Skip(SkipReason::Fresh)
        );

        let other = ScanStateRepository::new(db.pool().clone(), "catalog");
        assert_eq!(other.should_skip("7").await.unwrap(), SkipDecision::Attempt);
    }

    #[tokio::test]
    async fn test_reservations_are_spaced_by_interval() {
        let repo = create_test_repo().await;
        let interval = Duration::from_millis(200);

        let started = now_ms();
        let mut granted = Vec::new();
        for _ in 0..5 {
            let wait = repo.reserve_rate_limit("proxy:a", interval).await.unwrap();
            granted.push(started + wait.as_millis() as i64);
        }

        for pair in granted.windows(2) {
            // Allow a few ms for the clock moving between calls
            assert!(pair[1] - pair[0] >= 200 - 20, "{:?}", granted);
        }

        // Other buckets are independent
        let other = repo.reserve_rate_limit("proxy:b", interval).await.unwrap();
        assert!(other < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_reservations_shared_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let config = StateConfig {
            path: dir.path().join("shared.db"),
            busy_timeout: Duration::from_secs(5),
            max_connections: 2,
        };
        let first = Database::new(&config).await.unwrap();
        first.run_migrations().await.unwrap();
        let second = Database::new(&config).await.unwrap();
        second.run_migrations().await.unwrap();

        let a = ScanStateRepository::new(first.pool().clone(), "shared");
        let b = ScanStateRepository::new(second.pool().clone(), "shared");
        let interval = Duration::from_secs(10);

        let (wa, wb) = tokio::join!(
            a.reserve_rate_limit("direct", interval),
            b.reserve_rate_limit("direct", interval)
        );
        let mut waits = vec![wa.unwrap(), wb.unwrap()];
        waits.sort();

        assert!(waits[0] < Duration::from_secs(1));
        assert!(waits[1] >= Duration::from_secs(9));
    }

    #[tokio::test]
    async fn test_list_due_retry_and_stale() {
        let repo = create_test_repo().await;
        repo.record_failure("due", &failure(None)).await.unwrap();
        repo.record_failure("later", &failure(Some(Duration::from_secs(600))))
            .await
            .unwrap();
        repo.mark_permanent("gone", &AttemptMeta::default())
            .await
            .unwrap();
        repo.record_success("done", &AttemptMeta::default())
            .await
            .unwrap();

        assert_eq!(repo.list_due_retry(10).await.unwrap(), vec!["due".to_string()]);

        let mut stale = repo.list_stale(10, Duration::ZERO).await.unwrap();
        stale.sort();
        assert_eq!(stale, vec!["done", "due", "later"]);
        assert!(repo
            .list_stale(10, Duration::from_secs(3600))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_cursor_roundtrip_is_domain_scoped() {
        let repo = create_test_repo().await;
        repo.save_cursor("backlog", &json!({"offset": 120}))
            .await
            .unwrap();
        repo.save_cursor("backlog", &json!({"offset": 240}))
            .await
            .unwrap();

        assert_eq!(
            repo.load_cursor("backlog").await.unwrap(),
            Some(json!({"offset": 240}))
        );

        let other = ScanStateRepository::new(repo.pool.clone(), "other");
        assert_eq!(other.load_cursor("backlog").await.unwrap(), None);
    }
}
