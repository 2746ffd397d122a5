//! Caller-supplied collaborators of a scan run

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{FetchError, Result};

/// Answer of the remote API for one item
#[derive(Debug, Clone, Default)]
pub struct FetchResponse {
    pub status: u16,
    pub body: Bytes,
    /// The fetcher recognized a block or challenge page
    pub is_blocked_page: bool,
    /// Parsed `Retry-After`, if the API sent one
    pub retry_after: Option<Duration>,
}

impl FetchResponse {
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            body: body.into(),
            ..Default::default()
        }
    }
}

/// Fetches one item, optionally through a proxy URL
#[async_trait]
pub trait ItemFetcher: Send + Sync {
    async fn fetch(
        &self,
        item_id: &str,
        proxy: Option<&str>,
    ) -> std::result::Result<FetchResponse, FetchError>;
}

/// Receives the payload of every successfully fetched item
#[async_trait]
pub trait ItemHandler: Send + Sync {
    async fn handle(&self, item_id: &str, response: FetchResponse) -> Result<()>;
}
