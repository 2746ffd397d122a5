//! Worker loops that drive a backlog of items through fetch, classification
//! and persisted state

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn, Span};
use uuid::Uuid;

use super::buckets::ProxyBuckets;
use super::classify::classify;
use super::concurrency::AdaptiveConcurrency;
use super::fetch::{FetchResponse, ItemFetcher, ItemHandler};
use crate::config::ScanConfig;
use crate::database::Database;
use crate::error::{FetchError, ProxyScanError, Result};
use crate::models::{AttemptMeta, Outcome, RunSummary, SkipDecision, StopReason};
use crate::repository::{ScanStateRepository, StateStore};
use crate::shutdown::Shutdown;

/// Where one request goes out
#[derive(Debug, Clone)]
enum Route {
    Proxy { idx: usize, url: String },
    Direct,
}

impl Route {
    fn proxy_url(&self) -> Option<&str> {
        match self {
            Route::Proxy { url, .. } => Some(url),
            Route::Direct => None,
        }
    }
}

/// Shared state of one run
struct RunContext {
    items: Vec<String>,
    next: AtomicUsize,
    stop: Mutex<Option<StopReason>>,
    summary: Mutex<RunSummary>,
    buckets: ProxyBuckets,
    concurrency: AdaptiveConcurrency,
    direct_failures: AtomicU32,
}

impl RunContext {
    fn claim(&self) -> Option<&str> {
        let idx = self.next.fetch_add(1, Ordering::SeqCst);
        self.items.get(idx).map(String::as_str)
    }

    fn backlog_empty(&self) -> bool {
        self.next.load(Ordering::SeqCst) >= self.items.len()
    }

    fn claimed(&self) -> usize {
        self.next.load(Ordering::SeqCst).min(self.items.len())
    }

    /// First stop reason wins
    fn stop(&self, reason: StopReason) {
        let mut stop = self.stop.lock();
        if stop.is_none() {
            *stop = Some(reason);
        }
    }

    fn stopped(&self) -> bool {
        self.stop.lock().is_some()
    }

    fn capacity(&self) -> usize {
        if self.buckets.is_empty() {
            1
        } else {
            self.buckets.available_count().max(1)
        }
    }
}

/// Adaptive, rate-limited scan over a backlog of item identifiers
pub struct ScanOrchestrator {
    config: ScanConfig,
    store: Arc<dyn StateStore>,
    fetcher: Arc<dyn ItemFetcher>,
    handler: Arc<dyn ItemHandler>,
    shutdown: Shutdown,
    cursor: Option<String>,
}

impl ScanOrchestrator {
    pub fn new(
        config: ScanConfig,
        store: Arc<dyn StateStore>,
        fetcher: Arc<dyn ItemFetcher>,
        handler: Arc<dyn ItemHandler>,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            config,
            store,
            fetcher,
            handler,
            shutdown,
            cursor: None,
        }
    }

    /// Orchestrator backed by the state database, scoped to the configured
    /// domain and fresh-success window
    pub fn with_database(
        config: ScanConfig,
        db: &Database,
        fetcher: Arc<dyn ItemFetcher>,
        handler: Arc<dyn ItemHandler>,
        shutdown: Shutdown,
    ) -> Self {
        let store = Arc::new(ScanStateRepository::from_config(db.pool().clone(), &config));
        Self::new(config, store, fetcher, handler, shutdown)
    }

    /// Persist the number of claimed items under `name` when a run ends
    pub fn with_cursor(mut self, name: impl Into<String>) -> Self {
        self.cursor = Some(name.into());
        self
    }

    /// Items whose retry-after has passed, oldest first
    pub async fn retry_backlog(&self, limit: usize) -> Result<Vec<String>> {
        self.store.list_due_retry(limit).await
    }

    /// Scan `items` through `proxies` (empty for direct mode).
    ///
    /// Always returns a summary, including when the run stops early.
    #[instrument(
        skip_all,
        fields(domain = %self.config.domain, run_id = tracing::field::Empty)
    )]
    pub async fn run(&self, items: Vec<String>, proxies: Vec<String>) -> RunSummary {
        let run_id = Uuid::new_v4().to_string();
        Span::current().record("run_id", run_id.as_str());

        let workers = self.config.max_workers.max(1);
        let ctx = RunContext {
            summary: Mutex::new(RunSummary {
                run_id,
                total: items.len(),
                ..Default::default()
            }),
            items,
            next: AtomicUsize::new(0),
            stop: Mutex::new(None),
            buckets: ProxyBuckets::new(&proxies),
            concurrency: AdaptiveConcurrency::new(1, workers, self.config.adjust_cooldown),
            direct_failures: AtomicU32::new(0),
        };

        info!(
            items = ctx.items.len(),
            proxies = proxies.len(),
            workers = workers,
            "Starting scan run"
        );

        if proxies.is_empty() && self.config.require_proxies {
            warn!("Proxies are required but none were supplied");
            ctx.stop(StopReason::ProxiesExhausted);
        }

        futures::future::join_all((0..workers).map(|index| self.worker(&ctx, index))).await;

        let claimed = ctx.claimed();
        let mut summary = ctx.summary.into_inner();
        summary.unattempted = summary.total.saturating_sub(summary.processed());
        summary.stop_reason = ctx.stop.into_inner().unwrap_or_default();

        if let Some(name) = &self.cursor {
            let value = serde_json::json!({
                "run_id": summary.run_id,
                "claimed": claimed,
                "total": summary.total,
            });
            if let Err(e) = self.store.save_cursor(name, &value).await {
                warn!(cursor = %name, error = %e, "Failed to save scan cursor");
            }
        }

        info!(
            total = summary.total,
            ok = summary.ok,
            permanent = summary.permanent,
            rate_limited = summary.rate_limited,
            blocked = summary.blocked,
            transport = summary.transport,
            http_error = summary.http_error,
            skipped = summary.skipped,
            unattempted = summary.unattempted,
            stop_reason = ?summary.stop_reason,
            "Scan run finished"
        );
        summary
    }

    async fn worker(&self, ctx: &RunContext, index: usize) {
        let mut shutdown = self.shutdown.clone();
        let mut hint = index;

        loop {
            if shutdown.is_triggered() {
                ctx.stop(StopReason::Cancelled);
                break;
            }
            if ctx.stopped() || ctx.backlog_empty() {
                break;
            }

            ctx.concurrency.set_max(ctx.capacity());
            if index >= ctx.concurrency.current() {
                if shutdown.sleep(self.config.idle_poll).await.is_err() {
                    ctx.stop(StopReason::Cancelled);
                    break;
                }
                continue;
            }

            let Some(item) = ctx.claim() else {
                break;
            };

            match self.process_item(ctx, &mut shutdown, item, &mut hint).await {
                Ok(()) => {}
                Err(ProxyScanError::Cancelled) => {
                    ctx.stop(StopReason::Cancelled);
                    break;
                }
                Err(e) => warn!(item = %item, error = %e, "Item processing failed"),
            }
        }

        debug!(worker = index, "Scan worker exiting");
    }

    async fn process_item(
        &self,
        ctx: &RunContext,
        shutdown: &mut Shutdown,
        item: &str,
        hint: &mut usize,
    ) -> Result<()> {
        match self.store.should_skip(item).await {
            Ok(SkipDecision::Skip(reason)) => {
                debug!(item = %item, reason = %reason, "Skipping item");
                ctx.summary.lock().skipped += 1;
                return Ok(());
            }
            Ok(SkipDecision::Attempt) => {}
            Err(e) => warn!(item = %item, error = %e, "Skip check failed; attempting anyway"),
        }

        let route = if ctx.buckets.is_empty() {
            Route::Direct
        } else {
            match ctx.buckets.pick(*hint) {
                Some((idx, url)) => Route::Proxy { idx, url },
                None if self.config.require_proxies => {
                    warn!(item = %item, "All proxies are disabled; stopping run");
                    ctx.stop(StopReason::ProxiesExhausted);
                    return Ok(());
                }
                None => {
                    debug!(item = %item, "All proxies are disabled; going direct");
                    Route::Direct
                }
            }
        };

        ctx.concurrency.wait_if_backoff(shutdown).await?;
        self.throttle(shutdown, &route).await?;

        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.config.fetch_timeout,
            self.fetcher.fetch(item, route.proxy_url()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(self.config.fetch_timeout)),
        };

        let outcome = classify(&result, &self.config.permanent_statuses);
        debug!(
            item = %item,
            proxy = route.proxy_url().unwrap_or("direct"),
            outcome = outcome.as_str(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Fetched item"
        );
        ctx.summary.lock().record(outcome);

        self.apply(ctx, item, &route, outcome, result, hint).await;
        Ok(())
    }

    /// Reserve a rate-limit slot for the route and sleep until it is granted
    async fn throttle(&self, shutdown: &mut Shutdown, route: &Route) -> Result<()> {
        let (bucket, interval) = match route {
            Route::Proxy { url, .. } => (
                format!("{}:proxy:{}", self.config.domain, url),
                self.config.request_interval,
            ),
            Route::Direct => (
                format!("{}:direct", self.config.domain),
                self.config.direct_interval,
            ),
        };
        let interval = interval + jitter(self.config.jitter);

        let wait = match self.store.reserve_rate_limit(&bucket, interval).await {
            Ok(wait) => wait,
            Err(e) => {
                warn!(bucket = %bucket, error = %e, "Rate-limit reservation failed; waiting a full interval");
                interval
            }
        };
        shutdown.sleep(wait).await
    }

    async fn apply(
        &self,
        ctx: &RunContext,
        item: &str,
        route: &Route,
        outcome: Outcome,
        result: std::result::Result<FetchResponse, FetchError>,
        hint: &mut usize,
    ) {
        let (response, error) = match result {
            Ok(response) => (Some(response), None),
            Err(e) => (None, Some(e)),
        };
        let mut meta = AttemptMeta {
            http_status: response
                .as_ref()
                .map(|r| r.status)
                .or(match &error {
                    Some(FetchError::Http(status)) => Some(*status),
                    _ => None,
                }),
            error: error.as_ref().map(|e| e.to_string()),
            proxy: route.proxy_url().map(str::to_string),
            retry_after: None,
        };

        match outcome {
            Outcome::Success => {
                self.persist(item, self.store.record_success(item, &meta).await);
                if let Route::Proxy { idx, .. } = route {
                    ctx.buckets.record_success(*idx);
                    *hint = *idx;
                }
                ctx.concurrency.on_success();
                ctx.direct_failures.store(0, Ordering::SeqCst);

                if let Some(response) = response {
                    if let Err(e) = self.handler.handle(item, response).await {
                        warn!(item = %item, error = %e, "Item handler failed");
                    }
                }
            }
            Outcome::Permanent => {
                self.persist(item, self.store.mark_permanent(item, &meta).await);
                ctx.concurrency.on_transient_error();
                ctx.direct_failures.store(0, Ordering::SeqCst);
            }
            Outcome::RateLimited => {
                let retry = response
                    .as_ref()
                    .and_then(|r| r.retry_after)
                    .unwrap_or_default()
                    .max(self.config.rate_limit_retry_after);
                meta.retry_after = Some(retry);
                self.persist(item, self.store.record_failure(item, &meta).await);

                match route {
                    Route::Proxy { idx, url } => {
                        warn!(
                            proxy = %url,
                            retry_secs = retry.as_secs_f64(),
                            "Proxy rate limited; disabling"
                        );
                        ctx.buckets.disable_until(*idx, Instant::now() + retry);
                        *hint = idx + 1;
                    }
                    Route::Direct if self.config.breaker_on_429 => {
                        warn!(item = %item, "Rate limited without a proxy; tripping breaker");
                        ctx.stop(StopReason::BreakerTripped);
                    }
                    Route::Direct => self.count_direct_failure(ctx),
                }

                let backoff = ctx
                    .concurrency
                    .on_429(self.config.backoff_base, self.config.backoff_max);
                debug!(backoff_ms = backoff.as_millis() as u64, "Entering backoff");
            }
            Outcome::BlockedPage | Outcome::Transport | Outcome::HttpError => {
                meta.retry_after = Some(self.config.failure_retry_after);
                self.persist(item, self.store.record_failure(item, &meta).await);
                ctx.concurrency.on_transient_error();

                match route {
                    Route::Proxy { idx, url } => {
                        *hint = idx + 1;
                        let proxy_level = outcome != Outcome::HttpError;
                        if proxy_level
                            && ctx.buckets.record_failure(
                                *idx,
                                self.config.proxy_max_consecutive_fails,
                                self.config.proxy_disable_for,
                            )
                        {
                            warn!(
                                proxy = %url,
                                disable_secs = self.config.proxy_disable_for.as_secs_f64(),
                                "Proxy failed repeatedly; disabling"
                            );
                        }
                    }
                    Route::Direct => self.count_direct_failure(ctx),
                }
            }
        }
    }

    fn count_direct_failure(&self, ctx: &RunContext) {
        let failures = ctx.direct_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= self.config.breaker_max_consecutive_fails {
            warn!(
                failures = failures,
                "Consecutive direct failures reached the breaker threshold; stopping run"
            );
            ctx.stop(StopReason::BreakerTripped);
        }
    }

    fn persist(&self, item: &str, result: Result<()>) {
        if let Err(e) = result {
            warn!(item = %item, error = %e, "Failed to persist scan state");
        }
    }
}

fn jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
}
