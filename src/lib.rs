//! Proxyscan - Proxy Pool and Adaptive Scanner
//!
//! Keeps a pool of local proxy endpoints healthy and drives rate-limited
//! scans through it.
//!
//! ## Features
//!
//! - Subscription loading (URI lists, base64, Clash YAML) with retry and cache
//! - Tunnel engine subprocesses per node (xray, mihomo) on loopback ports
//! - Probing, background refill and health-check eviction
//! - Adaptive concurrency with 429 backoff and per-proxy circuit breaking
//! - Scan state and rate-limit reservations persisted in SQLite

pub mod config;
pub mod database;
pub mod error;
pub mod models;
pub mod pool;
pub mod proxy;
pub mod repository;
pub mod scan;
pub mod shutdown;
pub mod subscription;

#[cfg(test)]
mod test_support;

pub use config::Config;
pub use database::Database;
pub use error::{ProxyScanError, Result};
pub use pool::{PoolDeps, ProxyPool};
pub use scan::ScanOrchestrator;
pub use shutdown::{Shutdown, ShutdownHandle};
