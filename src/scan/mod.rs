//! Adaptive, rate-limited scanning of item backlogs

pub mod buckets;
pub mod classify;
pub mod concurrency;
pub mod fetch;
pub mod orchestrator;

pub use buckets::ProxyBuckets;
pub use classify::classify;
pub use concurrency::AdaptiveConcurrency;
pub use fetch::{FetchResponse, ItemFetcher, ItemHandler};
pub use orchestrator::ScanOrchestrator;
