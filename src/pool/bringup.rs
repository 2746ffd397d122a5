//! Candidate bring-up: launch, grace, probe, retain or discard

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, info};

use super::state::{local_proxy_url, RunningProxyInstance};
use super::PoolInner;
use crate::error::{ProxyScanError, Result};
use crate::models::{NodeDescriptor, NodeKey};

/// Drain the queue while holding the bring-up lock
pub(super) async fn run(inner: Arc<PoolInner>) {
    let _guard = inner.bringup.lock().await;
    drain(&inner).await;
}

/// Run the configured number of workers until the pool is full or the
/// queue is empty. Caller holds the bring-up lock.
pub(super) async fn drain(inner: &Arc<PoolInner>) {
    let workers = inner.config.workers.max(1);
    join_all((0..workers).map(|id| worker(inner.clone(), id))).await;
}

async fn worker(inner: Arc<PoolInner>, id: usize) {
    while let Some((node, key)) = claim(&inner) {
        let result = bring_up(&inner, &node, &key).await;
        inner.state.lock().attempting.remove(&key);

        match result {
            Ok(()) => {}
            Err(ProxyScanError::Cancelled) => break,
            Err(e) => {
                debug!(worker = id, node = %node.display_name(), error = %e, "Candidate rejected");
                inner.record_error(&e);
            }
        }
    }
}

/// Take the next candidate that is neither running nor in flight
fn claim(inner: &PoolInner) -> Option<(Arc<NodeDescriptor>, NodeKey)> {
    let mut state = inner.state.lock();
    if state.closed || inner.is_full(&state) {
        return None;
    }

    while let Some(node) = state.queue.pop() {
        let key = node.identity_key();
        if state.attempting.contains(&key) || state.is_running(&key) {
            continue;
        }
        state.attempting.insert(key.clone());
        state.attempts += 1;
        return Some((node, key));
    }
    None
}

async fn bring_up(inner: &PoolInner, node: &Arc<NodeDescriptor>, key: &NodeKey) -> Result<()> {
    let engine = inner.deps.engines.select(node)?;
    let port = inner
        .allocate_port()
        .ok_or_else(|| ProxyScanError::ProxyUnavailable("no free local port".to_string()))?;

    let mut process = match engine.launch(node, port, &inner.config.work_dir).await {
        Ok(process) => process.with_teardown(inner.port_releaser(port)),
        Err(e) => {
            inner.release_port(port);
            return Err(e);
        }
    };

    let mut shutdown = inner.shutdown.clone();
    if let Err(e) = shutdown.sleep(inner.config.startup_grace).await {
        process.shutdown().await;
        return Err(e);
    }
    if process.has_exited() {
        process.shutdown().await;
        return Err(ProxyScanError::ProxyUnavailable(format!(
            "{} engine exited during startup",
            engine.kind()
        )));
    }

    let probe = inner.deps.prober.probe(&local_proxy_url(port)).await;
    if !probe.ok {
        process.shutdown().await;
        return Err(ProxyScanError::ProxyUnavailable(format!(
            "probe failed: {}",
            probe.error.as_deref().unwrap_or("unusable response")
        )));
    }

    let latency_ms = probe.latency_ms;
    let rejected = {
        let mut state = inner.state.lock();
        if state.closed || inner.is_full(&state) {
            Some(process)
        } else {
            state.running.push(RunningProxyInstance {
                node: node.clone(),
                key: key.clone(),
                port,
                engine: engine.kind(),
                process,
                last_probe: probe,
                health_failures: 0,
            });
            None
        }
    };

    match rejected {
        Some(process) => {
            debug!(node = %node.display_name(), "Pool already full; discarding instance");
            process.shutdown().await;
        }
        None => {
            info!(
                node = %node.display_name(),
                key = %key,
                port = port,
                engine = %engine.kind(),
                latency_ms = latency_ms,
                "Proxy instance ready"
            );
            inner.publish();
        }
    }
    Ok(())
}
