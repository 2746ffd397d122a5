//! Advanced engine: Mihomo (Clash-Meta) driven by a YAML config
//!
//! Nodes that came from a Clash document are passed through as-is so that
//! options this crate does not model survive. URI-sourced nodes get a
//! synthesized proxy entry.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::process::{spawn, LaunchSpec, TunnelProcess};
use super::{EngineKind, TunnelEngine};
use crate::error::Result;
use crate::models::{Network, NodeDescriptor, NodePayload, Security, TransportOptions};

/// Name of the single proxy in every generated config
pub const PROXY_NAME: &str = "proxyscan-node";

pub struct MihomoEngine {
    bin: PathBuf,
}

impl MihomoEngine {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl TunnelEngine for MihomoEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Advanced
    }

    fn is_available(&self) -> bool {
        self.bin.is_file()
    }

    async fn launch(
        &self,
        node: &NodeDescriptor,
        port: u16,
        work_dir: &Path,
    ) -> Result<TunnelProcess> {
        let home = work_dir.join(format!("mihomo-{}", port));
        let config_path = home.join("config.yaml");

        spawn(LaunchSpec {
            bin: &self.bin,
            args: vec![
                "-f".into(),
                config_path.clone().into(),
                "-d".into(),
                home.clone().into(),
            ],
            config_body: serde_yaml::to_string(&build_config(node, port))?.into_bytes(),
            log_path: home.join("engine.log"),
            config_path,
            extra_artifacts: vec![home],
        })
        .await
    }
}

/// Config exposing `node` on a loopback mixed (HTTP + SOCKS) port
pub fn build_config(node: &NodeDescriptor, port: u16) -> Value {
    json!({
        "mixed-port": port,
        "allow-lan": false,
        "mode": "rule",
        "log-level": "warning",
        "ipv6": false,
        "proxies": [proxy_entry(node)],
        "rules": [format!("MATCH,{}", PROXY_NAME)]
    })
}

fn proxy_entry(node: &NodeDescriptor) -> Value {
    if let Some(Value::Object(raw)) = &node.raw {
        let mut entry = raw.clone();
        entry.insert("name".into(), json!(PROXY_NAME));
        return Value::Object(entry);
    }

    let t = &node.transport;
    let mut entry = Map::new();
    entry.insert("name".into(), json!(PROXY_NAME));
    entry.insert("server".into(), json!(node.host));
    entry.insert("port".into(), json!(node.port));
    entry.insert("udp".into(), json!(true));

    match &node.payload {
        NodePayload::Vmess(p) => {
            entry.insert("type".into(), json!("vmess"));
            entry.insert("uuid".into(), json!(p.id));
            entry.insert("alterId".into(), json!(p.alter_id));
            entry.insert("cipher".into(), json!(p.cipher));
            stream_options(&mut entry, t, "servername");
        }
        NodePayload::Vless(p) => {
            entry.insert("type".into(), json!("vless"));
            entry.insert("uuid".into(), json!(p.id));
            if let Some(flow) = &p.flow {
                entry.insert("flow".into(), json!(flow));
            }
            if !p.encryption.eq_ignore_ascii_case("none") && !p.encryption.is_empty() {
                entry.insert("encryption".into(), json!(p.encryption));
            }
            stream_options(&mut entry, t, "servername");
        }
        NodePayload::Trojan(p) => {
            entry.insert("type".into(), json!("trojan"));
            entry.insert("password".into(), json!(p.password));
            stream_options(&mut entry, t, "sni");
        }
        NodePayload::Shadowsocks(p) => {
            entry.insert("type".into(), json!("ss"));
            entry.insert("cipher".into(), json!(p.method));
            entry.insert("password".into(), json!(p.password));
            if let Some(plugin) = &p.plugin {
                let (name, opts) = plugin_options(plugin);
                entry.insert("plugin".into(), json!(name));
                entry.insert("plugin-opts".into(), opts);
            }
        }
        NodePayload::Hysteria2(p) => {
            entry.insert("type".into(), json!("hysteria2"));
            entry.insert("password".into(), json!(p.password));
            if let Some(obfs) = &p.obfs {
                entry.insert("obfs".into(), json!(obfs));
            }
            if let Some(obfs_password) = &p.obfs_password {
                entry.insert("obfs-password".into(), json!(obfs_password));
            }
            quic_options(&mut entry, t);
        }
        NodePayload::Tuic(p) => {
            entry.insert("type".into(), json!("tuic"));
            entry.insert("uuid".into(), json!(p.uuid));
            entry.insert("password".into(), json!(p.password));
            if let Some(cc) = &p.congestion_control {
                entry.insert("congestion-controller".into(), json!(cc));
            }
            quic_options(&mut entry, t);
        }
    }

    Value::Object(entry)
}

fn stream_options(entry: &mut Map<String, Value>, t: &TransportOptions, sni_key: &str) {
    if t.security != Security::None {
        entry.insert("tls".into(), json!(true));
    }
    if let Some(sni) = &t.sni {
        entry.insert(sni_key.into(), json!(sni));
    }
    if t.allow_insecure {
        entry.insert("skip-cert-verify".into(), json!(true));
    }
    if !t.alpn.is_empty() {
        entry.insert("alpn".into(), json!(t.alpn));
    }
    if let Some(fp) = &t.fingerprint {
        entry.insert("client-fingerprint".into(), json!(fp));
    }
    if t.security == Security::Reality {
        entry.insert(
            "reality-opts".into(),
            json!({
                "public-key": t.reality_public_key.clone().unwrap_or_default(),
                "short-id": t.reality_short_id.clone().unwrap_or_default()
            }),
        );
    }

    match t.network {
        Network::Tcp => {}
        Network::Ws => {
            let mut ws = json!({ "path": t.path.clone().unwrap_or_else(|| "/".to_string()) });
            if let Some(host) = &t.host {
                ws["headers"] = json!({ "Host": host });
            }
            entry.insert("network".into(), json!("ws"));
            entry.insert("ws-opts".into(), ws);
        }
        Network::Grpc => {
            entry.insert("network".into(), json!("grpc"));
            entry.insert(
                "grpc-opts".into(),
                json!({ "grpc-service-name": t.grpc_service_name.clone().unwrap_or_default() }),
            );
        }
        Network::H2 | Network::Http => {
            let mut h2 = json!({ "path": t.path.clone().unwrap_or_else(|| "/".to_string()) });
            if let Some(host) = &t.host {
                h2["host"] = json!([host]);
            }
            entry.insert("network".into(), json!("h2"));
            entry.insert("h2-opts".into(), h2);
        }
    }
}

fn quic_options(entry: &mut Map<String, Value>, t: &TransportOptions) {
    if let Some(sni) = &t.sni {
        entry.insert("sni".into(), json!(sni));
    }
    if t.allow_insecure {
        entry.insert("skip-cert-verify".into(), json!(true));
    }
    if !t.alpn.is_empty() {
        entry.insert("alpn".into(), json!(t.alpn));
    }
}

/// Translate a SIP003 plugin string (`obfs-local;obfs=http;obfs-host=x`)
fn plugin_options(plugin: &str) -> (String, Value) {
    let mut parts = plugin.split(';').map(str::trim);
    let name = parts.next().unwrap_or_default();
    let mut opts = Map::new();

    for part in parts.filter(|p| !p.is_empty()) {
        let (key, value) = part.split_once('=').unwrap_or((part, "true"));
        let key = match key {
            "obfs" => "mode",
            "obfs-host" => "host",
            other => other,
        };
        let value = match value {
            "true" => json!(true),
            other => json!(other),
        };
        opts.insert(key.to_string(), value);
    }

    let name = match name {
        "obfs-local" | "simple-obfs" => "obfs",
        other => other,
    };
    (name.to_string(), Value::Object(opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Hysteria2Payload, ShadowsocksPayload};

    fn hy2() -> NodeDescriptor {
        NodeDescriptor {
            host: "hy.example".to_string(),
            port: 8443,
            payload: NodePayload::Hysteria2(Hysteria2Payload {
                password: "pw".to_string(),
                obfs: Some("salamander".to_string()),
                obfs_password: Some("x".to_string()),
            }),
            transport: TransportOptions {
                security: Security::Tls,
                sni: Some("hy.example".to_string()),
                ..Default::default()
            },
            tag: Some("hy".to_string()),
            raw: None,
        }
    }

    #[test]
    fn test_config_routes_everything_through_node() {
        let config = build_config(&hy2(), 18002);
        assert_eq!(config["mixed-port"], 18002);
        assert_eq!(config["allow-lan"], false);
        assert_eq!(config["rules"][0], format!("MATCH,{}", PROXY_NAME));

        let proxy = &config["proxies"][0];
        assert_eq!(proxy["name"], PROXY_NAME);
        assert_eq!(proxy["type"], "hysteria2");
        assert_eq!(proxy["obfs"], "salamander");
        assert_eq!(proxy["sni"], "hy.example");

        let yaml = serde_yaml::to_string(&config).unwrap();
        assert!(yaml.contains("mixed-port: 18002"));
    }

    #[test]
    fn test_raw_entry_is_passed_through() {
        let mut node = hy2();
        node.raw = Some(json!({
            "name": "original",
            "type": "hysteria2",
            "server": "hy.example",
            "port": 8443,
            "password": "pw",
            "up": "30 Mbps"
        }));

        let proxy = proxy_entry(&node);
        assert_eq!(proxy["name"], PROXY_NAME);
        assert_eq!(proxy["up"], "30 Mbps");
    }

    #[test]
    fn test_shadowsocks_plugin_translation() {
        let node = NodeDescriptor {
            payload: NodePayload::Shadowsocks(ShadowsocksPayload {
                method: "aes-256-gcm".to_string(),
                password: "pw".to_string(),
                plugin: Some("obfs-local;obfs=http;obfs-host=cdn.example".to_string()),
            }),
            transport: TransportOptions::default(),
            ..hy2()
        };

        let proxy = proxy_entry(&node);
        assert_eq!(proxy["plugin"], "obfs");
        assert_eq!(proxy["plugin-opts"]["mode"], "http");
        assert_eq!(proxy["plugin-opts"]["host"], "cdn.example");
    }
}
