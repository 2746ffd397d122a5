use serde::Serialize;

/// Result of one probe through a local proxy endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    pub ok: bool,
    pub status: Option<u16>,
    pub latency_ms: u64,
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn usable(status: u16, latency_ms: u64) -> Self {
        Self {
            ok: true,
            status: Some(status),
            latency_ms,
            error: None,
        }
    }

    pub fn unusable(status: Option<u16>, latency_ms: u64, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            status,
            latency_ms,
            error: Some(error.into()),
        }
    }
}

/// Snapshot of a proxy pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub enabled: bool,
    pub target_size: usize,
    /// Running instances that passed their last probe
    pub usable: usize,
    pub running: usize,
    pub candidates_remaining: usize,
    /// Candidates claimed for bring-up since start
    pub attempts: u64,
    pub last_error: Option<String>,
    pub basic_engine_available: bool,
    pub advanced_engine_available: bool,
    pub closed: bool,
}
