use sqlx::SqlitePool;
use tracing::info;

use crate::error::Result;

/// Run all database migrations
///
/// Safe to run from several processes at once: every statement is
/// idempotent and recording a version ignores duplicates.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    create_migrations_table(pool).await?;

    for (version, name, statements) in get_migrations() {
        if is_migration_applied(pool, version).await? {
            continue;
        }

        info!(version = version, name = name, "Applying migration");

        let mut tx = pool.begin().await?;
        for sql in statements {
            sqlx::query(sql).execute(&mut *tx).await?;
        }
        sqlx::query("INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (?1, ?2)")
            .bind(version)
            .bind(name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        info!(version = version, name = name, "Migration applied successfully");
    }

    Ok(())
}

/// Create the migrations tracking table
async fn create_migrations_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at INTEGER NOT NULL DEFAULT (CAST(strftime('%s', 'now') AS INTEGER))
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Check if a migration has been applied
async fn is_migration_applied(pool: &SqlitePool, version: i32) -> Result<bool> {
    let count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM schema_migrations WHERE version = ?1")
            .bind(version)
            .fetch_one(pool)
            .await?;

    Ok(count > 0)
}

/// Get all migrations in order
fn get_migrations() -> Vec<(i32, &'static str, &'static [&'static str])> {
    vec![
        (1, "scan_records", MIGRATION_001_SCAN_RECORDS),
        (2, "rate_limits", MIGRATION_002_RATE_LIMITS),
        (3, "scan_cursors", MIGRATION_003_SCAN_CURSORS),
    ]
}

// Migration 1: per-item scan state, never deleted
const MIGRATION_001_SCAN_RECORDS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS scan_records (
        domain TEXT NOT NULL,
        item_id TEXT NOT NULL,
        status TEXT NOT NULL,
        last_checked_ms INTEGER NOT NULL,
        consecutive_failures INTEGER NOT NULL DEFAULT 0,
        retry_after_ms INTEGER,
        permanent INTEGER NOT NULL DEFAULT 0,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_http_status INTEGER,
        last_error TEXT,
        last_proxy TEXT,
        last_success_ms INTEGER,
        PRIMARY KEY (domain, item_id)
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_scan_records_retry ON scan_records(domain, status, retry_after_ms)",
    "CREATE INDEX IF NOT EXISTS idx_scan_records_checked ON scan_records(domain, last_checked_ms)",
];

// Migration 2: rate-limit reservations, one row per bucket
const MIGRATION_002_RATE_LIMITS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS rate_limits (
        bucket TEXT PRIMARY KEY,
        next_allowed_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    )
    "#];

// Migration 3: resumable scan cursors
const MIGRATION_003_SCAN_CURSORS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS scan_cursors (
        domain TEXT NOT NULL,
        name TEXT NOT NULL,
        value TEXT NOT NULL,
        updated_at_ms INTEGER NOT NULL,
        PRIMARY KEY (domain, name)
    )
    "#];
