use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Client;
use tracing::{debug, info, instrument, warn};

use super::cache::SubscriptionCache;
use super::parse::{parse_subscription, ParsedSubscription};
use crate::config::SubscriptionConfig;
use crate::error::{FetchError, ProxyScanError, Result, SourceFailure};
use crate::models::NodeDescriptor;
use crate::shutdown::Shutdown;

/// Anything that can produce the current candidate node list
#[async_trait]
pub trait NodeSource: Send + Sync {
    async fn load(&self) -> Result<Vec<NodeDescriptor>>;
}

/// Fetches subscription URLs with retries and merges their nodes
pub struct SubscriptionLoader {
    urls: Vec<String>,
    retries: u32,
    backoff_base: Duration,
    timeout: Duration,
    client: Client,
    /// Browser-like HTTP/1.1 client for sources that reject the primary one
    alt_client: Client,
    cache: Option<SubscriptionCache>,
    shutdown: Shutdown,
}

impl SubscriptionLoader {
    pub fn new(config: &SubscriptionConfig, shutdown: Shutdown) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        let alt_client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.alt_user_agent.as_str())
            .http1_only()
            .build()?;

        Ok(Self {
            urls: config.urls.clone(),
            retries: config.retries.max(1),
            backoff_base: config.backoff_base,
            timeout: config.timeout,
            client,
            alt_client,
            cache: config
                .cache_dir
                .as_ref()
                .map(|dir| SubscriptionCache::new(dir, config.cache_ttl)),
            shutdown,
        })
    }

    /// Fetch one source, retrying retryable failures with exponential backoff
    #[instrument(skip(self))]
    pub async fn fetch_source(&self, url: &str) -> Result<String> {
        let mut shutdown = self.shutdown.clone();
        let mut last_err = None;

        for attempt in 1..=self.retries {
            if attempt > 1 {
                let delay = self.backoff_base.saturating_mul(1 << (attempt - 2).min(16));
                debug!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Retrying subscription fetch");
                shutdown.sleep(delay).await?;
            }

            match self.fetch_once(url).await {
                Ok(body) => return Ok(body),
                Err(e) => {
                    warn!(attempt = attempt, error = %e, "Subscription fetch failed");
                    let retryable = e.is_retryable();
                    last_err = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        Err(last_err
            .unwrap_or_else(|| FetchError::Transport("no attempt made".to_string()))
            .into())
    }

    async fn fetch_once(&self, url: &str) -> std::result::Result<String, FetchError> {
        match self.get(&self.client, url).await {
            Err(e) if wants_alternate(&e) => {
                debug!(url = %url, error = %e, "Retrying with alternate client");
                self.get(&self.alt_client, url).await
            }
            result => result,
        }
    }

    async fn get(&self, client: &Client, url: &str) -> std::result::Result<String, FetchError> {
        let response = client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::from_reqwest(&e, self.timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http(status.as_u16()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| FetchError::from_reqwest(&e, self.timeout))?;
        if body.trim().is_empty() {
            return Err(FetchError::InvalidBody("empty body".to_string()));
        }

        Ok(body)
    }

    /// Fetch and parse one source. A body that yields no nodes counts as a
    /// failed fetch, so it never replaces a good cached body.
    async fn load_source(&self, url: &str) -> Result<ParsedSubscription> {
        let err = match self.fetch_source(url).await {
            Ok(body) => {
                let parsed = parse_subscription(&body);
                if parsed.nodes.is_empty() {
                    FetchError::InvalidBody(format!(
                        "no nodes in subscription body ({} entries skipped)",
                        parsed.skipped
                    ))
                    .into()
                } else {
                    if let Some(cache) = &self.cache {
                        if let Err(e) = cache.store(url, &body).await {
                            warn!(url = %url, error = %e, "Failed to cache subscription body");
                        }
                    }
                    return Ok(parsed);
                }
            }
            Err(ProxyScanError::Cancelled) => return Err(ProxyScanError::Cancelled),
            Err(e) => e,
        };

        let cached = match &self.cache {
            Some(cache) => cache.load_fresh(url).await,
            None => None,
        };
        match cached.map(|body| parse_subscription(&body)) {
            Some(parsed) if !parsed.nodes.is_empty() => {
                warn!(url = %url, error = %err, "Using cached subscription body");
                Ok(parsed)
            }
            _ => Err(err),
        }
    }
}

/// Status codes and failures that suggest the source filters clients
fn wants_alternate(err: &FetchError) -> bool {
    matches!(
        err,
        FetchError::Http(401 | 403 | 406 | 418 | 451) | FetchError::Transport(_)
    )
}

#[async_trait]
impl NodeSource for SubscriptionLoader {
    async fn load(&self) -> Result<Vec<NodeDescriptor>> {
        if self.urls.is_empty() {
            return Err(ProxyScanError::InvalidConfig(
                "no subscription URLs configured".to_string(),
            ));
        }

        let sources = join_all(self.urls.iter().map(|url| self.load_source(url))).await;

        let mut nodes = Vec::new();
        let mut seen = HashSet::new();
        let mut failures = Vec::new();

        for (url, source) in self.urls.iter().zip(sources) {
            let parsed = match source {
                Ok(parsed) => parsed,
                Err(ProxyScanError::Cancelled) => return Err(ProxyScanError::Cancelled),
                Err(e) => {
                    failures.push(SourceFailure {
                        url: url.clone(),
                        cause: e.to_string(),
                    });
                    continue;
                }
            };

            info!(
                url = %url,
                nodes = parsed.nodes.len(),
                skipped = parsed.skipped,
                duplicates = parsed.duplicates,
                "Parsed subscription"
            );

            for node in parsed.nodes {
                if seen.insert(node.identity_key()) {
                    nodes.push(node);
                }
            }
        }

        if failures.len() == self.urls.len() {
            return Err(ProxyScanError::AggregateFetchFailure { causes: failures });
        }

        info!(
            sources = self.urls.len(),
            failed = failures.len(),
            nodes = nodes.len(),
            "Loaded subscription nodes"
        );
        Ok(nodes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubResponse, StubServer};

    fn config(urls: Vec<String>) -> SubscriptionConfig {
        SubscriptionConfig {
            urls,
            retries: 3,
            backoff_base: Duration::from_millis(1),
            timeout: Duration::from_secs(5),
            cache_dir: None,
            cache_ttl: Duration::from_secs(60),
            user_agent: "clash.meta".to_string(),
            alt_user_agent: "Mozilla/5.0 test".to_string(),
        }
    }

    fn loader(config: &SubscriptionConfig) -> SubscriptionLoader {
        SubscriptionLoader::new(config, Shutdown::never()).unwrap()
    }

    #[tokio::test]
    async fn test_load_merges_and_dedups_sources() {
        let a = StubServer::start(vec![StubResponse::text(
            200,
            "trojan://pw@one.example:443#one\ntrojan://pw@two.example:443#two\n",
        )])
        .await;
        let b = StubServer::start(vec![StubResponse::text(
            200,
            "trojan://pw@two.example:443#two-again\ntrojan://pw@three.example:443#three\n",
        )])
        .await;

        let nodes = loader(&config(vec![a.url("/sub"), b.url("/sub")]))
            .load()
            .await
            .unwrap();

        let hosts: Vec<&str> = nodes.iter().map(|n| n.host.as_str()).collect();
        assert_eq!(hosts, vec!["one.example", "two.example", "three.example"]);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let stub = StubServer::start(vec![
            StubResponse::text(503, "busy"),
            StubResponse::text(200, "trojan://pw@one.example:443"),
        ])
        .await;

        let body = loader(&config(vec![stub.url("/sub")]))
            .fetch_source(&stub.url("/sub"))
            .await
            .unwrap();
        assert!(body.contains("one.example"));
        assert_eq!(stub.hits(), 2);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let stub = StubServer::start(vec![StubResponse::text(404, "missing")]).await;

        let err = loader(&config(vec![stub.url("/sub")]))
            .fetch_source(&stub.url("/sub"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyScanError::Fetch(FetchError::Http(404))));
        assert_eq!(stub.hits(), 1);
    }

    #[tokio::test]
    async fn test_forbidden_switches_to_alternate_client() {
        let stub = StubServer::start(vec![
            StubResponse::text(403, "no bots"),
            StubResponse::text(200, "trojan://pw@one.example:443"),
        ])
        .await;
        let mut cfg = config(vec![stub.url("/sub")]);
        cfg.retries = 1;

        let body = loader(&cfg).fetch_source(&stub.url("/sub")).await.unwrap();
        assert!(body.contains("one.example"));
        assert_eq!(
            stub.user_agents(),
            vec!["clash.meta".to_string(), "Mozilla/5.0 test".to_string()]
        );
    }

    #[tokio::test]
    async fn test_all_sources_failing_is_aggregate_error() {
        let a = StubServer::start(vec![StubResponse::text(404, "")]).await;
        let b = StubServer::start(vec![StubResponse::text(410, "")]).await;

        let err = loader(&config(vec![a.url("/a"), b.url("/b")]))
            .load()
            .await
            .unwrap_err();
        match err {
            ProxyScanError::AggregateFetchFailure { causes } => {
                assert_eq!(causes.len(), 2);
                assert!(causes[0].cause.contains("404"));
                assert!(causes[1].cause.contains("410"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_still_loads() {
        let good = StubServer::start(vec![StubResponse::text(200, "trojan://pw@one.example:443")]).await;
        let bad = StubServer::start(vec![StubResponse::text(404, "")]).await;

        let nodes = loader(&config(vec![bad.url("/sub"), good.url("/sub")]))
            .load()
            .await
            .unwrap();
        assert_eq!(nodes.len(), 1);
    }

    #[tokio::test]
    async fn test_cache_fallback_when_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubServer::start(vec![
            StubResponse::text(200, "trojan://pw@cached.example:443"),
            StubResponse::text(404, ""),
        ])
        .await;
        let mut cfg = config(vec![stub.url("/sub")]);
        cfg.cache_dir = Some(dir.path().to_path_buf());

        let first = loader(&cfg).load().await.unwrap();
        let second = loader(&cfg).load().await.unwrap();

        assert_eq!(stub.hits(), 2);
        assert_eq!(first, second);
        assert_eq!(second[0].host, "cached.example");
    }

    #[tokio::test]
    async fn test_block_page_keeps_cached_body() {
        let dir = tempfile::tempdir().unwrap();
        let stub = StubServer::start(vec![
            StubResponse::text(200, "trojan://pw@cached.example:443"),
            StubResponse::html(200, "<html>Access denied</html>"),
            StubResponse::text(404, ""),
        ])
        .await;
        let mut cfg = config(vec![stub.url("/sub")]);
        cfg.cache_dir = Some(dir.path().to_path_buf());

        let first = loader(&cfg).load().await.unwrap();
        let blocked = loader(&cfg).load().await.unwrap();
        let failed = loader(&cfg).load().await.unwrap();

        assert_eq!(first.len(), 1);
        assert_eq!(blocked, first);
        assert_eq!(failed, first);
        assert_eq!(failed[0].host, "cached.example");
    }

    #[tokio::test]
    async fn test_sources_without_nodes_are_aggregate_error() {
        let a = StubServer::start(vec![StubResponse::html(200, "<html>blocked</html>")]).await;
        let b = StubServer::start(vec![StubResponse::text(200, "not a subscription")]).await;

        let err = loader(&config(vec![a.url("/a"), b.url("/b")]))
            .load()
            .await
            .unwrap_err();
        match err {
            ProxyScanError::AggregateFetchFailure { causes } => {
                assert_eq!(causes.len(), 2);
                assert!(causes.iter().all(|c| c.cause.contains("no nodes")));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_urls_is_config_error() {
        let err = loader(&config(Vec::new())).load().await.unwrap_err();
        assert!(matches!(err, ProxyScanError::InvalidConfig(_)));
    }
}
