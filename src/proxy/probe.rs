//! Probing a local proxy endpoint against the real target API
//!
//! A proxy is usable when the target answers through it with something the
//! API itself would produce: a JSON body or one of the known API error
//! statuses. An HTML document is a block or WAF page and is never usable.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::BytesMut;
use reqwest::{Client, Proxy, Response};
use serde::de::IgnoredAny;
use tracing::{debug, instrument};

use crate::config::ProbeConfig;
use crate::error::FetchError;
use crate::models::ProbeResult;

/// Classifies one local proxy endpoint as usable or not
#[async_trait]
pub trait NodeProber: Send + Sync {
    async fn probe(&self, proxy_url: &str) -> ProbeResult;
}

/// Prober that sends one HTTP request through the proxy
pub struct HttpProber {
    config: ProbeConfig,
}

impl HttpProber {
    pub fn new(config: &ProbeConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl NodeProber for HttpProber {
    async fn probe(&self, proxy_url: &str) -> ProbeResult {
        probe(proxy_url, &self.config).await
    }
}

/// Send one request to the probe URL through `proxy_url` and classify it
#[instrument(skip(config), fields(probe_url = %config.url))]
pub async fn probe(proxy_url: &str, config: &ProbeConfig) -> ProbeResult {
    let started = Instant::now();

    let client = match build_client(proxy_url, config.timeout) {
        Ok(client) => client,
        Err(e) => return ProbeResult::unusable(None, 0, format!("invalid proxy: {}", e)),
    };

    let mut request = client.get(&config.url);
    for (name, value) in &config.headers {
        request = request.header(name.as_str(), value.as_str());
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            let err = FetchError::from_reqwest(&e, config.timeout);
            return ProbeResult::unusable(None, elapsed_ms(started), err.to_string());
        }
    };

    let status = response.status().as_u16();
    let (body, truncated) = match read_capped(response, config.max_body_bytes).await {
        Ok(read) => read,
        Err(e) => {
            let err = FetchError::from_reqwest(&e, config.timeout);
            return ProbeResult::unusable(Some(status), elapsed_ms(started), err.to_string());
        }
    };

    let result = classify_probe_response(
        status,
        &body,
        truncated,
        &config.ok_statuses,
        elapsed_ms(started),
    );
    debug!(
        status = status,
        ok = result.ok,
        latency_ms = result.latency_ms,
        "Probe finished"
    );
    result
}

fn build_client(proxy_url: &str, timeout: Duration) -> reqwest::Result<Client> {
    Client::builder()
        .proxy(Proxy::all(proxy_url)?)
        .timeout(timeout)
        .build()
}

/// Read at most `cap` bytes of the body; the flag is set when the body was
/// cut at the cap
async fn read_capped(mut response: Response, cap: usize) -> reqwest::Result<(BytesMut, bool)> {
    let mut body = BytesMut::new();
    loop {
        match response.chunk().await? {
            Some(chunk) => {
                let room = cap - body.len();
                if chunk.len() > room {
                    body.extend_from_slice(&chunk[..room]);
                    return Ok((body, true));
                }
                body.extend_from_slice(&chunk);
            }
            None => return Ok((body, false)),
        }
    }
}

/// Classify a probe answer
///
/// A `truncated` body cannot be parsed whole, so it counts as JSON when it
/// opens like a JSON object or array.
pub fn classify_probe_response(
    status: u16,
    body: &[u8],
    truncated: bool,
    ok_statuses: &[u16],
    latency_ms: u64,
) -> ProbeResult {
    if looks_like_html(body) {
        return ProbeResult::unusable(Some(status), latency_ms, "HTML page returned");
    }
    let is_json = if truncated {
        looks_like_json(body)
    } else {
        serde_json::from_slice::<IgnoredAny>(body).is_ok()
    };
    if is_json || ok_statuses.contains(&status) {
        return ProbeResult::usable(status, latency_ms);
    }
    ProbeResult::unusable(
        Some(status),
        latency_ms,
        format!("unexpected status {} without JSON body", status),
    )
}

/// Whether the first non-whitespace byte opens a markup tag
pub fn looks_like_html(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<')
}

fn looks_like_json(body: &[u8]) -> bool {
    body.iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| matches!(b, b'{' | b'['))
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{StubResponse, StubServer};

    const OK: &[u16] = &[400, 403, 404, 424];

    fn config(url: String) -> ProbeConfig {
        ProbeConfig {
            url,
            timeout: Duration::from_secs(5),
            headers: vec![("X-Probe".to_string(), "1".to_string())],
            ok_statuses: OK.to_vec(),
            max_body_bytes: 1024,
        }
    }

    #[test]
    fn test_html_is_never_usable() {
        let page = b"\n  <!DOCTYPE html><html><body>Access denied</body></html>";
        assert!(!classify_probe_response(200, page, false, OK, 5).ok);
        assert!(!classify_probe_response(404, page, false, OK, 5).ok);
    }

    #[test]
    fn test_json_or_known_status_is_usable() {
        assert!(classify_probe_response(404, br#"{"error":"not found"}"#, false, OK, 5).ok);
        assert!(classify_probe_response(200, b"[1,2,3]", false, OK, 5).ok);
        assert!(classify_probe_response(403, b"forbidden", false, OK, 5).ok);
    }

    #[test]
    fn test_truncated_json_is_usable() {
        assert!(classify_probe_response(200, br#"  {"data":"xxxx"#, true, OK, 5).ok);
        assert!(!classify_probe_response(200, br#"{"data":"xxxx"#, false, OK, 5).ok);
        assert!(!classify_probe_response(200, b"plain text", true, OK, 5).ok);
    }

    #[test]
    fn test_other_answers_are_unusable() {
        let result = classify_probe_response(502, b"bad gateway", false, OK, 5);
        assert!(!result.ok);
        assert_eq!(result.status, Some(502));
        assert!(result.error.unwrap().contains("502"));
    }

    #[tokio::test]
    async fn test_probe_through_proxy() {
        let proxy = StubServer::start(vec![
            StubResponse::html(200, "<html>blocked</html>"),
            StubResponse::json(404, r#"{"message":"no such item"}"#),
        ])
        .await;
        let config = config("http://api.invalid/probe".to_string());

        let blocked = probe(&proxy.proxy_url(), &config).await;
        assert!(!blocked.ok);
        assert_eq!(blocked.status, Some(200));

        let reached = probe(&proxy.proxy_url(), &config).await;
        assert!(reached.ok);
        assert_eq!(reached.status, Some(404));

        let lines = proxy.request_lines();
        assert!(lines[0].starts_with("GET http://api.invalid/probe"));
    }

    #[tokio::test]
    async fn test_probe_large_json_body_over_cap() {
        let body = format!(r#"{{"data":"{}"}}"#, "x".repeat(100 * 1024));
        let proxy = StubServer::start(vec![StubResponse::json(200, body)]).await;
        let mut config = config("http://api.invalid/probe".to_string());
        config.max_body_bytes = 64 * 1024;

        let result = probe(&proxy.proxy_url(), &config).await;
        assert!(result.ok, "large JSON answer rejected: {:?}", result.error);
        assert_eq!(result.status, Some(200));
    }

    #[tokio::test]
    async fn test_probe_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = HttpProber::new(&config("http://api.invalid/probe".to_string()))
            .probe(&dead)
            .await;
        assert!(!result.ok);
        assert_eq!(result.status, None);
        assert!(result.error.is_some());
    }
}
