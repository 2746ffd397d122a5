use std::collections::HashSet;
use std::sync::Arc;

use tokio::time::Instant;

use super::candidates::CandidateQueue;
use crate::models::{NodeDescriptor, NodeKey, ProbeResult};
use crate::proxy::{EngineKind, TunnelProcess};

/// URL of the loopback proxy listening on `port`
pub fn local_proxy_url(port: u16) -> String {
    format!("http://127.0.0.1:{}", port)
}

/// A tunnel process that passed its bring-up probe
pub(crate) struct RunningProxyInstance {
    pub node: Arc<NodeDescriptor>,
    pub key: NodeKey,
    pub port: u16,
    pub engine: EngineKind,
    pub process: TunnelProcess,
    pub last_probe: ProbeResult,
    /// Consecutive failed health probes
    pub health_failures: u32,
}

impl RunningProxyInstance {
    pub fn proxy_url(&self) -> String {
        local_proxy_url(self.port)
    }
}

/// Mutable pool bookkeeping, guarded by one lock
///
/// Nothing that owns a [`TunnelProcess`] may be dropped while this lock is
/// held; evicted instances are moved out first and shut down afterwards.
#[derive(Default)]
pub(crate) struct PoolState {
    pub running: Vec<RunningProxyInstance>,
    /// Nodes currently between claim and retain/discard
    pub attempting: HashSet<NodeKey>,
    pub queue: CandidateQueue,
    /// Last successfully loaded node list
    pub nodes: Vec<Arc<NodeDescriptor>>,
    pub last_error: Option<String>,
    pub last_refill: Option<Instant>,
    /// Candidates claimed since start
    pub attempts: u64,
    pub closed: bool,
}

impl PoolState {
    /// Keys that must not be claimed again
    pub fn busy_keys(&self) -> HashSet<NodeKey> {
        self.running
            .iter()
            .map(|r| r.key.clone())
            .chain(self.attempting.iter().cloned())
            .collect()
    }

    pub fn is_running(&self, key: &NodeKey) -> bool {
        self.running.iter().any(|r| &r.key == key)
    }

    pub fn usable_count(&self) -> usize {
        self.running.iter().filter(|r| r.last_probe.ok).count()
    }

    /// Proxy URLs of running instances whose last probe passed
    pub fn proxy_urls(&self) -> Vec<String> {
        self.running
            .iter()
            .filter(|r| r.last_probe.ok)
            .map(RunningProxyInstance::proxy_url)
            .collect()
    }
}
