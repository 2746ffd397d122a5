use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tunnel protocol of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Vmess,
    Vless,
    Trojan,
    Shadowsocks,
    Hysteria2,
    Tuic,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Vmess => "vmess",
            NodeKind::Vless => "vless",
            NodeKind::Trojan => "trojan",
            NodeKind::Shadowsocks => "ss",
            NodeKind::Hysteria2 => "hysteria2",
            NodeKind::Tuic => "tuic",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmessPayload {
    pub id: String,
    pub alter_id: u32,
    /// Payload cipher (`auto`, `aes-128-gcm`, ...)
    pub cipher: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlessPayload {
    pub id: String,
    /// `none` unless the node uses an encrypted handshake
    pub encryption: String,
    pub flow: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrojanPayload {
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShadowsocksPayload {
    pub method: String,
    pub password: String,
    pub plugin: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hysteria2Payload {
    pub password: String,
    pub obfs: Option<String>,
    pub obfs_password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuicPayload {
    pub uuid: String,
    pub password: String,
    pub congestion_control: Option<String>,
}

/// Protocol-specific credentials, one payload type per kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NodePayload {
    Vmess(VmessPayload),
    Vless(VlessPayload),
    Trojan(TrojanPayload),
    Shadowsocks(ShadowsocksPayload),
    Hysteria2(Hysteria2Payload),
    Tuic(TuicPayload),
}

impl NodePayload {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodePayload::Vmess(_) => NodeKind::Vmess,
            NodePayload::Vless(_) => NodeKind::Vless,
            NodePayload::Trojan(_) => NodeKind::Trojan,
            NodePayload::Shadowsocks(_) => NodeKind::Shadowsocks,
            NodePayload::Hysteria2(_) => NodeKind::Hysteria2,
            NodePayload::Tuic(_) => NodeKind::Tuic,
        }
    }

    /// First non-empty of id, password, method
    pub fn primary_credential(&self) -> &str {
        match self {
            NodePayload::Vmess(p) => &p.id,
            NodePayload::Vless(p) => &p.id,
            NodePayload::Trojan(p) => &p.password,
            NodePayload::Shadowsocks(p) if !p.password.is_empty() => &p.password,
            NodePayload::Shadowsocks(p) => &p.method,
            NodePayload::Hysteria2(p) => &p.password,
            NodePayload::Tuic(p) => &p.uuid,
        }
    }
}

/// Stream transport of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Tcp,
    Ws,
    Grpc,
    H2,
    Http,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::H2 => "h2",
            Network::Http => "http",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "" | "tcp" | "raw" => Some(Network::Tcp),
            "ws" | "websocket" => Some(Network::Ws),
            "grpc" | "gun" => Some(Network::Grpc),
            "h2" => Some(Network::H2),
            "http" => Some(Network::Http),
            _ => None,
        }
    }
}

/// Transport security layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    #[default]
    None,
    Tls,
    Reality,
}

impl Security {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "tls" | "xtls" | "true" | "1" => Security::Tls,
            "reality" => Security::Reality,
            _ => Security::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportOptions {
    pub network: Network,
    pub security: Security,
    pub sni: Option<String>,
    pub allow_insecure: bool,
    /// Host header for ws/h2/http transports
    pub host: Option<String>,
    pub path: Option<String>,
    pub grpc_service_name: Option<String>,
    pub alpn: Vec<String>,
    /// uTLS client fingerprint
    pub fingerprint: Option<String>,
    pub reality_public_key: Option<String>,
    pub reality_short_id: Option<String>,
}

/// Stable identity of a node, used for dedup and "already running" checks
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeKey(String);

impl NodeKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0[..12.min(self.0.len())])
    }
}

/// A parsed remote relay endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub host: String,
    pub port: u16,
    pub payload: NodePayload,
    pub transport: TransportOptions,
    /// Display name from the subscription
    pub tag: Option<String>,
    /// Original structured entry, passed through to the advanced engine
    pub raw: Option<Value>,
}

impl NodeDescriptor {
    pub fn kind(&self) -> NodeKind {
        self.payload.kind()
    }

    /// BLAKE3 of `kind|host|port|credential`; the tag does not participate
    pub fn identity_key(&self) -> NodeKey {
        let material = format!(
            "{}|{}|{}|{}",
            self.kind().as_str(),
            self.host,
            self.port,
            self.payload.primary_credential()
        );
        NodeKey(blake3::hash(material.as_bytes()).to_hex().to_string())
    }

    pub fn display_name(&self) -> String {
        match &self.tag {
            Some(tag) if !tag.is_empty() => tag.clone(),
            _ => format!("{}:{}:{}", self.kind(), self.host, self.port),
        }
    }

    /// Protocols and handshakes only the advanced engine can carry
    pub fn requires_advanced_engine(&self) -> bool {
        match &self.payload {
            NodePayload::Hysteria2(_) | NodePayload::Tuic(_) => true,
            NodePayload::Vless(p) => {
                self.transport.security == Security::Reality
                    || !(p.encryption.is_empty() || p.encryption.eq_ignore_ascii_case("none"))
            }
            _ => false,
        }
    }
}
