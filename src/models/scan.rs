use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Last recorded status of an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Success,
    Failure,
    Permanent,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Success => "success",
            ScanStatus::Failure => "failure",
            ScanStatus::Permanent => "permanent",
        }
    }
}

/// Durable memory of what has been tried for one item
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct PersistedScanRecord {
    pub domain: String,
    pub item_id: String,
    pub status: ScanStatus,
    pub last_checked_ms: i64,
    pub consecutive_failures: i64,
    pub retry_after_ms: Option<i64>,
    pub permanent: bool,
    pub attempts: i64,
    pub last_http_status: Option<i64>,
    pub last_error: Option<String>,
    pub last_proxy: Option<String>,
    pub last_success_ms: Option<i64>,
}

impl PersistedScanRecord {
    pub fn last_checked(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.last_checked_ms).single()
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        self.retry_after_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Why an item is not attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Permanent,
    /// Retry-after has not passed yet
    NotDue { retry_after_ms: i64 },
    /// Succeeded within the fresh-success window
    Fresh,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Permanent => write!(f, "permanent"),
            SkipReason::NotDue { retry_after_ms } => write!(f, "not due until {}", retry_after_ms),
            SkipReason::Fresh => write!(f, "fresh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipDecision {
    Attempt,
    Skip(SkipReason),
}

impl SkipDecision {
    pub fn is_skip(&self) -> bool {
        matches!(self, SkipDecision::Skip(_))
    }
}

/// Details recorded alongside an attempt
#[derive(Debug, Clone, Default)]
pub struct AttemptMeta {
    pub http_status: Option<u16>,
    pub error: Option<String>,
    pub proxy: Option<String>,
    /// Earliest time the item may be retried, relative to now
    pub retry_after: Option<Duration>,
}

/// Classified result of one fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// The API confirmed the item invalid or forbidden
    Permanent,
    RateLimited,
    BlockedPage,
    /// Connection failure or timeout
    Transport,
    HttpError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Permanent => "permanent",
            Outcome::RateLimited => "rate_limited",
            Outcome::BlockedPage => "blocked_page",
            Outcome::Transport => "transport",
            Outcome::HttpError => "http_error",
        }
    }
}

/// Why a scan run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    #[default]
    Completed,
    BreakerTripped,
    ProxiesExhausted,
    Cancelled,
}

/// Counts by classification for one scan run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub total: usize,
    pub ok: usize,
    pub permanent: usize,
    pub rate_limited: usize,
    pub blocked: usize,
    /// Transport failures and timeouts
    pub transport: usize,
    pub http_error: usize,
    pub skipped: usize,
    /// Backlog entries never attempted because the run stopped early
    pub unattempted: usize,
    pub stop_reason: StopReason,
}

impl RunSummary {
    pub fn record(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Success => self.ok += 1,
            Outcome::Permanent => self.permanent += 1,
            Outcome::RateLimited => self.rate_limited += 1,
            Outcome::BlockedPage => self.blocked += 1,
            Outcome::Transport => self.transport += 1,
            Outcome::HttpError => self.http_error += 1,
        }
    }

    /// Items that reached a fetch or a skip decision
    pub fn processed(&self) -> usize {
        self.ok
            + self.permanent
            + self.rate_limited
            + self.blocked
            + self.transport
            + self.http_error
            + self.skipped
    }
}
