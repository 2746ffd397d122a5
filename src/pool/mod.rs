//! Proxy pool manager
//!
//! Builds a set of healthy local proxy endpoints from subscription nodes and
//! keeps it at its target size:
//! - bring-up workers drain a candidate queue (launch, grace, probe, retain)
//! - a refill tick tops the pool up with fresh candidates
//! - a health tick re-probes running instances and evicts failing ones
//!
//! Consumers read the live URL list through [`ProxyPool::proxy_urls`] or get
//! it pushed through [`ProxyPool::on_update`].

mod bringup;
pub mod candidates;
mod maintenance;
pub mod ports;
mod state;

use std::sync::Arc;

use arc_swap::ArcSwap;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, PoolConfig};
use crate::error::{ProxyScanError, Result};
use crate::models::PoolStatus;
use crate::proxy::{EngineSet, NodeProber};
use crate::shutdown::{Shutdown, ShutdownHandle};
use crate::subscription::NodeSource;

pub use candidates::{spread_sample, CandidateQueue};
pub use ports::PortAllocator;
pub use state::local_proxy_url;

use state::{PoolState, RunningProxyInstance};

/// Callback receiving the live proxy URL list after every change
pub type UpdateListener = Arc<dyn Fn(&[String]) + Send + Sync>;

/// Collaborators of the pool
pub struct PoolDeps {
    pub source: Arc<dyn NodeSource>,
    pub prober: Arc<dyn NodeProber>,
    pub engines: EngineSet,
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    probe_url: String,
    deps: PoolDeps,
    state: Mutex<PoolState>,
    /// Separate from `state` so teardown callbacks never contend with it
    ports: Arc<Mutex<PortAllocator>>,
    urls: ArcSwap<Vec<String>>,
    listeners: RwLock<Vec<UpdateListener>>,
    /// Number of usable instances
    ready_tx: watch::Sender<usize>,
    /// Serializes candidate draining between start, refill and rebuild
    bringup: tokio::sync::Mutex<()>,
    shutdown_handle: ShutdownHandle,
    shutdown: Shutdown,
}

impl PoolInner {
    fn new(config: PoolConfig, probe_url: String, deps: PoolDeps) -> Self {
        let (shutdown_handle, shutdown) = ShutdownHandle::new();
        let (ready_tx, _) = watch::channel(0);
        let ports = PortAllocator::new(config.base_port, config.port_count);

        Self {
            config,
            probe_url,
            deps,
            state: Mutex::new(PoolState::default()),
            ports: Arc::new(Mutex::new(ports)),
            urls: ArcSwap::from_pointee(Vec::new()),
            listeners: RwLock::new(Vec::new()),
            ready_tx,
            bringup: tokio::sync::Mutex::new(()),
            shutdown_handle,
            shutdown,
        }
    }

    fn is_full(&self, state: &PoolState) -> bool {
        state.running.len() >= self.config.size
    }

    fn allocate_port(&self) -> Option<u16> {
        self.ports.lock().allocate()
    }

    fn release_port(&self, port: u16) {
        self.ports.lock().release(port);
    }

    /// Teardown callback returning `port` to the allocator
    fn port_releaser(&self, port: u16) -> impl FnOnce() + Send + 'static {
        let ports = self.ports.clone();
        move || ports.lock().release(port)
    }

    fn record_error(&self, err: &ProxyScanError) {
        self.state.lock().last_error = Some(err.to_string());
    }

    /// Load nodes from the source and remember them as the last good list
    async fn load_nodes(&self) -> Result<usize> {
        let nodes = self.deps.source.load().await?;
        let count = nodes.len();

        let mut state = self.state.lock();
        state.nodes = nodes.into_iter().map(Arc::new).collect();
        info!(nodes = count, "Loaded candidate nodes");
        Ok(count)
    }

    /// Resample the candidate queue, skipping running and in-flight nodes
    fn rebuild_queue(&self) -> usize {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let exclude = state.busy_keys();
        state
            .queue
            .rebuild(&state.nodes, self.config.max_probe, &exclude);
        state.queue.remaining()
    }

    /// Recompute the live URL list and notify listeners
    fn publish(&self) {
        let urls = {
            let state = self.state.lock();
            let urls = state.proxy_urls();
            self.urls.store(Arc::new(urls.clone()));
            self.ready_tx.send_replace(state.usable_count());
            urls
        };

        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&urls);
        }
    }

    fn status(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            enabled: self.config.enabled,
            target_size: self.config.size,
            usable: state.usable_count(),
            running: state.running.len(),
            candidates_remaining: state.queue.remaining(),
            attempts: state.attempts,
            last_error: state.last_error.clone(),
            basic_engine_available: self.deps.engines.basic_available(),
            advanced_engine_available: self.deps.engines.advanced_available(),
            closed: state.closed,
        }
    }

    /// Move every running instance out and shut it down
    async fn evict_all(&self) {
        let evicted = std::mem::take(&mut self.state.lock().running);
        join_all(evicted.into_iter().map(|r| r.process.shutdown())).await;
        self.publish();
    }
}

/// A self-maintaining pool of local proxy endpoints
pub struct ProxyPool {
    inner: Arc<PoolInner>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ProxyPool {
    /// Start the pool
    ///
    /// Returns once `min_ready` instances are usable or the candidates are
    /// exhausted; the rest of the target is reached in the background.
    #[instrument(skip_all, fields(size = config.pool.size, min_ready = config.pool.min_ready))]
    pub async fn start(config: &Config, deps: PoolDeps) -> Result<Self> {
        let inner = Arc::new(PoolInner::new(
            config.pool.clone(),
            config.probe.url.clone(),
            deps,
        ));
        let pool = ProxyPool {
            inner: inner.clone(),
            tasks: Mutex::new(Vec::new()),
        };
        let cfg = &inner.config;

        if !cfg.enabled {
            info!("Proxy pool disabled");
            return Ok(pool);
        }

        if !inner.deps.engines.any_available() {
            let err = ProxyScanError::EngineUnavailable {
                engine: config.engine.mode.as_str().to_string(),
                reason: "no usable tunnel engine binary found".to_string(),
            };
            if cfg.required {
                return Err(err);
            }
            warn!(error = %err, "Continuing without a proxy pool");
            inner.record_error(&err);
            return Ok(pool);
        }

        tokio::fs::create_dir_all(&cfg.work_dir).await?;

        if let Err(e) = inner.load_nodes().await {
            if cfg.required {
                return Err(e);
            }
            warn!(error = %e, "Failed to load subscription nodes; starting with an empty pool");
            inner.record_error(&e);
        }
        let queued = inner.rebuild_queue();
        info!(candidates = queued, "Starting proxy bring-up");

        let mut drain = tokio::spawn(bringup::run(inner.clone()));
        let mut ready = inner.ready_tx.subscribe();
        let min_ready = cfg.min_ready.max(1);

        tokio::select! {
            _ = ready.wait_for(|usable| *usable >= min_ready) => {}
            _ = &mut drain => {}
        }
        if !drain.is_finished() {
            pool.tasks.lock().push(drain);
        }

        let usable = inner.state.lock().usable_count();
        if usable == 0 {
            if cfg.required {
                let tried = inner.state.lock().attempts;
                pool.close().await;
                return Err(ProxyScanError::PoolExhausted {
                    probe_url: inner.probe_url.clone(),
                    tried,
                });
            }
            warn!(
                probe_url = %inner.probe_url,
                "No usable proxies found; continuing without proxies"
            );
        } else if usable < min_ready {
            warn!(usable = usable, min_ready = min_ready, "Proxy pool started below min_ready");
        }

        pool.tasks
            .lock()
            .push(tokio::spawn(maintenance::run(inner.clone())));

        info!(usable = usable, target = cfg.size, "Proxy pool started");
        Ok(pool)
    }

    /// Current live proxy URLs
    pub fn proxy_urls(&self) -> Vec<String> {
        self.inner.urls.load().as_ref().clone()
    }

    /// Register a listener; it is called immediately with the current list
    pub fn on_update(&self, listener: impl Fn(&[String]) + Send + Sync + 'static) {
        let listener: UpdateListener = Arc::new(listener);
        self.inner.listeners.write().push(listener.clone());
        listener(&self.proxy_urls());
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    /// Tear everything down and bring the pool up again from a fresh load
    ///
    /// Falls back to the last loaded node list when the reload fails.
    #[instrument(skip(self))]
    pub async fn rebuild(&self) -> Result<()> {
        let inner = &self.inner;
        if !inner.config.enabled {
            return Ok(());
        }

        let _guard = inner.bringup.lock().await;
        if inner.state.lock().closed {
            return Err(ProxyScanError::Cancelled);
        }

        inner.state.lock().queue.clear();
        inner.evict_all().await;

        if let Err(e) = inner.load_nodes().await {
            if matches!(e, ProxyScanError::Cancelled) || inner.state.lock().nodes.is_empty() {
                inner.record_error(&e);
                return Err(e);
            }
            warn!(error = %e, "Reload failed; rebuilding from the last node list");
            inner.record_error(&e);
        }

        let queued = inner.rebuild_queue();
        info!(candidates = queued, "Rebuilding proxy pool");
        bringup::drain(inner).await;
        Ok(())
    }

    /// Stop background work and tear down every instance; idempotent
    pub async fn close(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.queue.clear();
        }
        self.inner.shutdown_handle.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
            let _ = task.await;
        }

        self.inner.evict_all().await;
        debug!(leased_ports = self.inner.ports.lock().leased(), "Ports after close");
        info!("Proxy pool closed");
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        self.inner.shutdown_handle.shutdown();
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
