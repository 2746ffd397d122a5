//! Tunnel engine adapters
//!
//! An engine turns one [`NodeDescriptor`] into a loopback HTTP proxy by
//! spawning an external binary. Two backends exist: the basic engine covers
//! the common protocols, the advanced engine everything it cannot carry.

pub mod mihomo;
pub mod process;
pub mod xray;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{EngineConfig, EngineMode};
use crate::error::{ProxyScanError, Result};
use crate::models::NodeDescriptor;

pub use mihomo::MihomoEngine;
pub use process::TunnelProcess;
pub use xray::XrayEngine;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Basic,
    Advanced,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Basic => "basic",
            EngineKind::Advanced => "advanced",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Starts tunnel processes for nodes
#[async_trait]
pub trait TunnelEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    /// Whether the engine binary can be started at all
    fn is_available(&self) -> bool;

    /// Spawn a process exposing `node` as an HTTP proxy on `127.0.0.1:port`
    async fn launch(&self, node: &NodeDescriptor, port: u16, work_dir: &Path)
        -> Result<TunnelProcess>;
}

/// The configured engines plus the selection policy
#[derive(Clone)]
pub struct EngineSet {
    basic: Option<Arc<dyn TunnelEngine>>,
    advanced: Option<Arc<dyn TunnelEngine>>,
    mode: EngineMode,
}

impl EngineSet {
    pub fn new(
        basic: Option<Arc<dyn TunnelEngine>>,
        advanced: Option<Arc<dyn TunnelEngine>>,
        mode: EngineMode,
    ) -> Self {
        Self {
            basic,
            advanced,
            mode,
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        let basic = config
            .xray_bin
            .as_ref()
            .map(|bin| Arc::new(XrayEngine::new(bin)) as Arc<dyn TunnelEngine>);
        let advanced = config
            .mihomo_bin
            .as_ref()
            .map(|bin| Arc::new(MihomoEngine::new(bin)) as Arc<dyn TunnelEngine>);
        Self::new(basic, advanced, config.mode)
    }

    fn available(engine: &Option<Arc<dyn TunnelEngine>>) -> Option<&Arc<dyn TunnelEngine>> {
        engine.as_ref().filter(|e| e.is_available())
    }

    pub fn basic_available(&self) -> bool {
        Self::available(&self.basic).is_some()
    }

    pub fn advanced_available(&self) -> bool {
        Self::available(&self.advanced).is_some()
    }

    /// Whether the selection policy can start anything at all
    pub fn any_available(&self) -> bool {
        match self.mode {
            EngineMode::Basic => self.basic_available(),
            EngineMode::Advanced => self.advanced_available(),
            EngineMode::Auto => self.basic_available() || self.advanced_available(),
        }
    }

    /// Pick the engine that should carry `node`
    pub fn select(&self, node: &NodeDescriptor) -> Result<Arc<dyn TunnelEngine>> {
        let needs_advanced = node.requires_advanced_engine();

        let picked = match self.mode {
            EngineMode::Basic if needs_advanced => {
                return Err(unavailable(
                    EngineKind::Basic,
                    format!("{} needs the advanced engine", node.kind()),
                ))
            }
            EngineMode::Basic => Self::available(&self.basic).ok_or(EngineKind::Basic),
            EngineMode::Advanced => Self::available(&self.advanced).ok_or(EngineKind::Advanced),
            EngineMode::Auto if needs_advanced => {
                Self::available(&self.advanced).ok_or(EngineKind::Advanced)
            }
            EngineMode::Auto => Self::available(&self.basic)
                .or_else(|| Self::available(&self.advanced))
                .ok_or(EngineKind::Basic),
        };

        picked
            .cloned()
            .map_err(|kind| unavailable(kind, "binary not found".to_string()))
    }
}

fn unavailable(kind: EngineKind, reason: String) -> ProxyScanError {
    ProxyScanError::EngineUnavailable {
        engine: kind.to_string(),
        reason,
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;
    use crate::models::{
        NodePayload, Security, TransportOptions, TrojanPayload, TuicPayload,
    };

    fn trojan() -> NodeDescriptor {
        NodeDescriptor {
            host: "t.example".to_string(),
            port: 443,
            payload: NodePayload::Trojan(TrojanPayload {
                password: "pw".to_string(),
            }),
            transport: TransportOptions {
                security: Security::Tls,
                ..Default::default()
            },
            tag: None,
            raw: None,
        }
    }

    fn tuic() -> NodeDescriptor {
        NodeDescriptor {
            payload: NodePayload::Tuic(TuicPayload {
                uuid: "u".to_string(),
                password: "p".to_string(),
                congestion_control: None,
            }),
            ..trojan()
        }
    }

    fn engines(basic: bool, advanced: bool, mode: EngineMode) -> EngineSet {
        let make = |kind, up: bool| {
            Some(Arc::new(if up {
                FakeEngine::new(kind)
            } else {
                FakeEngine::unavailable(kind)
            }) as Arc<dyn TunnelEngine>)
        };
        EngineSet::new(
            make(EngineKind::Basic, basic),
            make(EngineKind::Advanced, advanced),
            mode,
        )
    }

    #[test]
    fn test_auto_selection_is_protocol_driven() {
        let set = engines(true, true, EngineMode::Auto);
        assert_eq!(set.select(&trojan()).unwrap().kind(), EngineKind::Basic);
        assert_eq!(set.select(&tuic()).unwrap().kind(), EngineKind::Advanced);
    }

    #[test]
    fn test_auto_falls_back_to_advanced() {
        let set = engines(false, true, EngineMode::Auto);
        assert_eq!(set.select(&trojan()).unwrap().kind(), EngineKind::Advanced);
        assert!(set.any_available());
    }

    #[test]
    fn test_advanced_node_without_advanced_engine() {
        let set = engines(true, false, EngineMode::Auto);
        let err = set.select(&tuic()).err().unwrap();
        assert!(matches!(err, ProxyScanError::EngineUnavailable { ref engine, .. } if engine == "advanced"));
    }

    #[test]
    fn test_operator_override() {
        let set = engines(true, true, EngineMode::Advanced);
        assert_eq!(set.select(&trojan()).unwrap().kind(), EngineKind::Advanced);

        let set = engines(true, true, EngineMode::Basic);
        assert!(set.select(&tuic()).is_err());

        let set = engines(false, true, EngineMode::Basic);
        assert!(!set.any_available());
    }

    #[test]
    fn test_from_config_with_missing_binaries() {
        let set = EngineSet::from_config(&EngineConfig {
            mode: EngineMode::Auto,
            xray_bin: Some("/nonexistent/xray".into()),
            mihomo_bin: None,
        });
        assert!(!set.basic_available());
        assert!(!set.advanced_available());
        assert!(!set.any_available());
    }
}
