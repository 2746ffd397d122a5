//! Basic engine: an Xray-compatible binary driven by a JSON config

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{json, Map, Value};

use super::process::{spawn, LaunchSpec, TunnelProcess};
use super::{EngineKind, TunnelEngine};
use crate::error::{ProxyScanError, Result};
use crate::models::{Network, NodeDescriptor, NodePayload, Security};

pub struct XrayEngine {
    bin: PathBuf,
}

impl XrayEngine {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl TunnelEngine for XrayEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Basic
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
        let config = build_config(node, port)?;
        let config_path = work_dir.join(format!("xray-{}.json", port));

        spawn(LaunchSpec {
            bin: &self.bin,
            args: vec!["run".into(), "-c".into(), config_path.clone().into()],
            config_body: serde_json::to_vec_pretty(&config)?,
            log_path: work_dir.join(format!("xray-{}.log", port)),
            config_path,
            extra_artifacts: Vec::new(),
        })
        .await
    }
}

/// Config with one loopback HTTP inbound on `port` and one outbound for `node`
pub fn build_config(node: &NodeDescriptor, port: u16) -> Result<Value> {
    let mut outbound = match &node.payload {
        NodePayload::Vmess(p) => json!({
            "protocol": "vmess",
            "settings": {
                "vnext": [{
                    "address": node.host,
                    "port": node.port,
                    "users": [{ "id": p.id, "alterId": p.alter_id, "security": p.cipher }]
                }]
            }
        }),
        NodePayload::Vless(p) => {
            let mut user = json!({ "id": p.id, "encryption": p.encryption });
            if let Some(flow) = &p.flow {
                user["flow"] = json!(flow);
            }
            json!({
                "protocol": "vless",
                "settings": {
                    "vnext": [{ "address": node.host, "port": node.port, "users": [user] }]
                }
            })
        }
        NodePayload::Trojan(p) => json!({
            "protocol": "trojan",
            "settings": {
                "servers": [{ "address": node.host, "port": node.port, "password": p.password }]
            }
        }),
        NodePayload::Shadowsocks(p) => {
            if p.plugin.is_some() {
                return Err(unsupported(node, "shadowsocks plugins"));
            }
            json!({
                "protocol": "shadowsocks",
                "settings": {
                    "servers": [{
                        "address": node.host,
                        "port": node.port,
                        "method": p.method,
                        "password": p.password
                    }]
                }
            })
        }
        NodePayload::Hysteria2(_) | NodePayload::Tuic(_) => {
            return Err(unsupported(node, node.kind().as_str()))
        }
    };

    outbound["tag"] = json!("proxy");
    outbound["streamSettings"] = stream_settings(node);

    Ok(json!({
        "log": { "loglevel": "warning" },
        "inbounds": [{
            "tag": "http-in",
            "listen": "127.0.0.1",
            "port": port,
            "protocol": "http",
            "settings": {}
        }],
        "outbounds": [outbound]
    }))
}

fn stream_settings(node: &NodeDescriptor) -> Value {
    let t = &node.transport;
    let mut stream = Map::new();

    let network = match t.network {
        Network::H2 | Network::Http => "http",
        other => other.as_str(),
    };
    stream.insert("network".into(), json!(network));

    let server_name = t
        .sni
        .clone()
        .or_else(|| t.host.clone())
        .unwrap_or_else(|| node.host.clone());

    match t.security {
        Security::None => {
            stream.insert("security".into(), json!("none"));
        }
        Security::Tls => {
            let mut tls = json!({ "serverName": server_name, "allowInsecure": t.allow_insecure });
            if !t.alpn.is_empty() {
                tls["alpn"] = json!(t.alpn);
            }
            if let Some(fp) = &t.fingerprint {
                tls["fingerprint"] = json!(fp);
            }
            stream.insert("security".into(), json!("tls"));
            stream.insert("tlsSettings".into(), tls);
        }
        Security::Reality => {
            stream.insert("security".into(), json!("reality"));
            stream.insert(
                "realitySettings".into(),
                json!({
                    "serverName": server_name,
                    "publicKey": t.reality_public_key.clone().unwrap_or_default(),
                    "shortId": t.reality_short_id.clone().unwrap_or_default(),
                    "fingerprint": t.fingerprint.clone().unwrap_or_else(|| "chrome".to_string())
                }),
            );
        }
    }

    match t.network {
        Network::Ws => {
            let mut ws = json!({ "path": t.path.clone().unwrap_or_else(|| "/".to_string()) });
            if let Some(host) = &t.host {
                ws["headers"] = json!({ "Host": host });
            }
            stream.insert("wsSettings".into(), ws);
        }
        Network::Grpc => {
            stream.insert(
                "grpcSettings".into(),
                json!({ "serviceName": t.grpc_service_name.clone().unwrap_or_default() }),
            );
        }
        Network::H2 | Network::Http => {
            let mut http = json!({ "path": t.path.clone().unwrap_or_else(|| "/".to_string()) });
            if let Some(host) = &t.host {
                http["host"] = json!([host]);
            }
            stream.insert("httpSettings".into(), http);
        }
        Network::Tcp => {}
    }

    Value::Object(stream)
}

fn unsupported(node: &NodeDescriptor, what: &str) -> ProxyScanError {
    ProxyScanError::ProxyUnavailable(format!(
        "{} uses {}, which the basic engine cannot carry",
        node.display_name(),
        what
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Hysteria2Payload, TransportOptions, VmessPayload};

    fn vmess_ws() -> NodeDescriptor {
        NodeDescriptor {
            host: "vm.example".to_string(),
            port: 443,
            payload: NodePayload::Vmess(VmessPayload {
                id: "11111111-2222-3333-4444-555555555555".to_string(),
                alter_id: 0,
                cipher: "auto".to_string(),
            }),
            transport: TransportOptions {
                network: Network::Ws,
                security: Security::Tls,
                host: Some("cdn.example".to_string()),
                path: Some("/ray".to_string()),
                ..Default::default()
            },
            tag: Some("vm".to_string()),
            raw: None,
        }
    }

    #[test]
    fn test_vmess_ws_tls_config() {
        let config = build_config(&vmess_ws(), 18001).unwrap();

        let inbound = &config["inbounds"][0];
        assert_eq!(inbound["listen"], "127.0.0.1");
        assert_eq!(inbound["port"], 18001);
        assert_eq!(inbound["protocol"], "http");

        let outbound = &config["outbounds"][0];
        assert_eq!(outbound["protocol"], "vmess");
        assert_eq!(outbound["settings"]["vnext"][0]["address"], "vm.example");
        let stream = &outbound["streamSettings"];
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example");
        assert_eq!(stream["wsSettings"]["path"], "/ray");
    }

    #[test]
    fn test_advanced_only_protocols_are_rejected() {
        let node = NodeDescriptor {
            payload: NodePayload::Hysteria2(Hysteria2Payload {
                password: "pw".to_string(),
                obfs: None,
                obfs_password: None,
            }),
            ..vmess_ws()
        };
        assert!(matches!(
            build_config(&node, 18001),
            Err(ProxyScanError::ProxyUnavailable(_))
        ));
    }
}
