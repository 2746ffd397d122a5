//! Background refill and health-check loops

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{bringup, PoolInner};
use crate::models::{NodeKey, ProbeResult};

use super::state::{local_proxy_url, RunningProxyInstance};

const MIN_TICK: Duration = Duration::from_millis(1);

/// Run until the pool's shutdown signal fires
pub(super) async fn run(inner: Arc<PoolInner>) {
    info!(
        refill_secs = inner.config.refill_interval.as_secs_f64(),
        health_secs = inner.config.health_interval.as_secs_f64(),
        "Starting pool maintenance"
    );

    let mut refill_tick = interval(inner.config.refill_interval.max(MIN_TICK));
    let mut health_tick = interval(inner.config.health_interval.max(MIN_TICK));
    refill_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    health_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // Both fire immediately; bring-up just ran
    refill_tick.tick().await;
    health_tick.tick().await;

    let mut shutdown = inner.shutdown.clone();

    loop {
        tokio::select! {
            _ = refill_tick.tick() => refill(&inner).await,
            _ = health_tick.tick() => health_check(&inner).await,
            _ = shutdown.triggered() => {
                info!("Pool maintenance shutting down");
                break;
            }
        }
    }
}

/// Top the pool up with fresh candidates when below target
pub(super) async fn refill(inner: &Arc<PoolInner>) {
    {
        let mut state = inner.state.lock();
        if state.closed || inner.is_full(&state) {
            return;
        }
        if let Some(last) = state.last_refill {
            if last.elapsed() < inner.config.refill_cooldown {
                return;
            }
        }
        state.last_refill = Some(Instant::now());
    }

    let Ok(_guard) = inner.bringup.try_lock() else {
        debug!("Bring-up in progress; skipping refill");
        return;
    };

    if inner.state.lock().nodes.is_empty() {
        if let Err(e) = inner.load_nodes().await {
            warn!(error = %e, "Refill could not load nodes");
            inner.record_error(&e);
            return;
        }
    }

    let mut queued = inner.state.lock().queue.remaining();
    if queued == 0 {
        queued = inner.rebuild_queue();
    }
    if queued == 0 {
        debug!("No candidates left for refill");
        return;
    }

    let (running, target) = (inner.state.lock().running.len(), inner.config.size);
    info!(running = running, target = target, candidates = queued, "Refilling proxy pool");
    bringup::drain(inner).await;
}

/// Re-probe every running instance and evict repeat failures
pub(super) async fn health_check(inner: &Arc<PoolInner>) {
    let targets: Vec<(NodeKey, u16)> = inner
        .state
        .lock()
        .running
        .iter()
        .map(|r| (r.key.clone(), r.port))
        .collect();
    if targets.is_empty() {
        return;
    }

    let results: Vec<(NodeKey, ProbeResult)> = futures::stream::iter(targets)
        .map(|(key, port)| {
            let prober = inner.deps.prober.clone();
            async move { (key, prober.probe(&local_proxy_url(port)).await) }
        })
        .buffer_unordered(inner.config.workers.max(1))
        .collect()
        .await;

    let threshold = inner.config.health_fail_threshold.max(1);
    let evicted: Vec<RunningProxyInstance> = {
        let mut state = inner.state.lock();
        for (key, result) in results {
            if let Some(instance) = state.running.iter_mut().find(|r| r.key == key) {
                if result.ok {
                    instance.health_failures = 0;
                } else {
                    instance.health_failures += 1;
                }
                instance.last_probe = result;
            }
        }

        let (keep, evict) = std::mem::take(&mut state.running)
            .into_iter()
            .partition(|r| r.health_failures < threshold);
        state.running = keep;
        evict
    };

    let healthy = inner.state.lock().usable_count();
    debug!(healthy = healthy, evicted = evicted.len(), "Health check finished");

    for instance in evicted {
        warn!(
            node = %instance.node.display_name(),
            port = instance.port,
            engine = %instance.engine,
            failures = instance.health_failures,
            error = instance.last_probe.error.as_deref().unwrap_or(""),
            "Evicting unhealthy proxy instance"
        );
        instance.process.shutdown().await;
    }

    inner.publish();
}
