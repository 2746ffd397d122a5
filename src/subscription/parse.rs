//! Subscription payload decoding
//!
//! A payload is one of:
//! - a Clash-style YAML document with a `proxies:` list
//! - a base64-wrapped URI list
//! - a plain URI-per-line list
//!
//! Every entry is normalized into a [`NodeDescriptor`]. Malformed entries are
//! counted and skipped, never fatal.

use std::collections::{HashMap, HashSet};

use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use percent_encoding::percent_decode_str;
use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use tracing::debug;
use url::Url;

use crate::error::ParseError;
use crate::models::{
    Hysteria2Payload, Network, NodeDescriptor, NodePayload, Security, ShadowsocksPayload,
    TransportOptions, TrojanPayload, TuicPayload, VlessPayload, VmessPayload,
};

type ParseResult<T> = std::result::Result<T, ParseError>;

/// Shape of a subscription payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionFormat {
    ClashYaml,
    Base64,
    UriList,
}

/// Deduplicated nodes of one payload plus skip statistics
#[derive(Debug, Default)]
pub struct ParsedSubscription {
    pub nodes: Vec<NodeDescriptor>,
    /// Malformed or unsupported entries
    pub skipped: usize,
    /// Entries sharing an identity key with an earlier one
    pub duplicates: usize,
}

pub fn detect_format(text: &str) -> SubscriptionFormat {
    let is_clash = text.lines().any(|line| {
        let line = line.trim_start();
        line.starts_with("proxies:") || line.starts_with("proxy-groups:")
    });

    if is_clash {
        SubscriptionFormat::ClashYaml
    } else if !text.contains("://") && looks_like_base64(text) {
        SubscriptionFormat::Base64
    } else {
        SubscriptionFormat::UriList
    }
}

/// Parse one subscription payload into deduplicated nodes
pub fn parse_subscription(text: &str) -> ParsedSubscription {
    let raw = text.trim();

    let entries = match detect_format(raw) {
        SubscriptionFormat::ClashYaml => {
            parse_clash_document(raw).unwrap_or_else(|e| vec![Err(e)])
        }
        SubscriptionFormat::Base64 => match decode_base64_text(raw) {
            Some(decoded) => parse_uri_lines(&decoded),
            None => vec![Err(ParseError::InvalidBase64)],
        },
        SubscriptionFormat::UriList => parse_uri_lines(raw),
    };

    let mut parsed = ParsedSubscription::default();
    let mut seen = HashSet::new();

    for entry in entries {
        match entry {
            Ok(node) => {
                if seen.insert(node.identity_key()) {
                    parsed.nodes.push(node);
                } else {
                    parsed.duplicates += 1;
                }
            }
            Err(e) => {
                debug!(error = %e, "Skipping malformed subscription entry");
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

fn parse_uri_lines(text: &str) -> Vec<ParseResult<NodeDescriptor>> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_uri)
        .collect()
}

/// Parse one share URI (`vmess://`, `vless://`, `trojan://`, `ss://`,
/// `hysteria2://`/`hy2://`, `tuic://`)
pub fn parse_uri(line: &str) -> ParseResult<NodeDescriptor> {
    let (scheme, rest) = line
        .split_once("://")
        .ok_or_else(|| ParseError::InvalidUri(abbreviate(line)))?;

    match scheme.to_lowercase().as_str() {
        "vmess" => parse_vmess(rest),
        "vless" => parse_vless(line),
        "trojan" => parse_trojan(line),
        "ss" => parse_shadowsocks(rest),
        "hysteria2" | "hy2" => parse_hysteria2(line),
        "tuic" => parse_tuic(line),
        other => Err(ParseError::UnsupportedScheme(other.to_string())),
    }
}

fn parse_vmess(encoded: &str) -> ParseResult<NodeDescriptor> {
    let json_text = decode_base64_text(encoded).ok_or(ParseError::InvalidBase64)?;
    let obj: JsonValue = serde_json::from_str(&json_text)
        .map_err(|e| ParseError::InvalidDocument(e.to_string()))?;
    let field = |key: &str| json_str(&obj, key);

    let host = field("add")
        .or_else(|| field("host"))
        .ok_or(ParseError::MissingField("add"))?;
    let port = parse_port(&field("port").ok_or(ParseError::MissingField("port"))?)?;
    let id = field("id").ok_or(ParseError::MissingField("id"))?;

    let net = field("net").unwrap_or_default();
    let network = Network::from_str(&net).ok_or_else(|| ParseError::InvalidField {
        field: "net",
        value: net.clone(),
    })?;

    let transport = TransportOptions {
        network,
        security: Security::from_str(&field("tls").unwrap_or_default()),
        sni: field("sni").or_else(|| field("serverName")),
        allow_insecure: ["allowInsecure", "allow_insecure", "skip-cert-verify"]
            .iter()
            .find_map(|key| field(key))
            .map(|v| to_bool(&v))
            .unwrap_or(false),
        host: field("host"),
        path: field("path"),
        grpc_service_name: (network == Network::Grpc).then(|| field("path")).flatten(),
        alpn: split_list(field("alpn").as_deref()),
        fingerprint: field("fp"),
        ..Default::default()
    };

    Ok(NodeDescriptor {
        host,
        port,
        payload: NodePayload::Vmess(VmessPayload {
            id,
            alter_id: field("aid").and_then(|v| v.parse().ok()).unwrap_or(0),
            cipher: field("scy")
                .or_else(|| field("cipher"))
                .unwrap_or_else(|| "auto".to_string()),
        }),
        transport,
        tag: field("ps"),
        raw: None,
    })
}

/// Pieces shared by the `scheme://user@host:port?params#tag` forms
struct ShareUri {
    host: String,
    port: u16,
    user: String,
    password: Option<String>,
    params: HashMap<String, String>,
    tag: Option<String>,
}

impl ShareUri {
    fn parse(uri: &str) -> ParseResult<Self> {
        let url = Url::parse(uri)?;

        let host = url
            .host_str()
            .map(|h| h.trim_matches(|c| c == '[' || c == ']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or(ParseError::MissingField("host"))?;
        let port = url
            .port()
            .filter(|p| *p != 0)
            .ok_or(ParseError::MissingField("port"))?;

        Ok(ShareUri {
            host,
            port,
            user: percent_decode(url.username()),
            password: url.password().map(percent_decode),
            params: url.query_pairs().into_owned().collect(),
            tag: url.fragment().map(percent_decode).filter(|t| !t.is_empty()),
        })
    }

    fn param(&self, keys: &[&str]) -> Option<String> {
        keys.iter()
            .filter_map(|key| self.params.get(*key))
            .map(|v| v.trim())
            .find(|v| !v.is_empty())
            .map(str::to_string)
    }

    fn transport(&self, default_security: Security) -> ParseResult<TransportOptions> {
        let net = self.param(&["type"]).unwrap_or_default();
        let network = Network::from_str(&net).ok_or_else(|| ParseError::InvalidField {
            field: "type",
            value: net.clone(),
        })?;

        Ok(TransportOptions {
            network,
            security: self
                .param(&["security"])
                .map(|s| Security::from_str(&s))
                .unwrap_or(default_security),
            sni: self.param(&["sni", "peer", "serverName"]),
            allow_insecure: self
                .param(&["allowInsecure", "allow_insecure", "insecure"])
                .map(|v| to_bool(&v))
                .unwrap_or(false),
            host: self.param(&["host"]),
            path: self.param(&["path"]),
            grpc_service_name: self.param(&["serviceName"]),
            alpn: split_list(self.param(&["alpn"]).as_deref()),
            fingerprint: self.param(&["fp"]),
            reality_public_key: self.param(&["pbk"]),
            reality_short_id: self.param(&["sid"]),
        })
    }

    fn credential(&self, field: &'static str) -> ParseResult<String> {
        let user = self.user.trim();
        if user.is_empty() {
            return Err(ParseError::MissingField(field));
        }
        Ok(user.to_string())
    }
}

fn parse_vless(uri: &str) -> ParseResult<NodeDescriptor> {
    let share = ShareUri::parse(uri)?;
    let id = share.credential("id")?;
    let transport = share.transport(Security::None)?;

    Ok(NodeDescriptor {
        payload: NodePayload::Vless(VlessPayload {
            id,
            encryption: share
                .param(&["encryption"])
                .unwrap_or_else(|| "none".to_string()),
            flow: share.param(&["flow"]),
        }),
        transport,
        host: share.host,
        port: share.port,
        tag: share.tag,
        raw: None,
    })
}

fn parse_trojan(uri: &str) -> ParseResult<NodeDescriptor> {
    let share = ShareUri::parse(uri)?;
    let password = share.credential("password")?;
    let transport = share.transport(Security::Tls)?;

    Ok(NodeDescriptor {
        payload: NodePayload::Trojan(TrojanPayload { password }),
        transport,
        host: share.host,
        port: share.port,
        tag: share.tag,
        raw: None,
    })
}

fn parse_hysteria2(uri: &str) -> ParseResult<NodeDescriptor> {
    let share = ShareUri::parse(uri)?;
    let user = share.credential("password")?;
    // `user:pass` auth is sent verbatim
    let password = match &share.password {
        Some(pass) => format!("{}:{}", user, pass),
        None => user,
    };
    let mut transport = share.transport(Security::Tls)?;
    transport.security = Security::Tls;

    Ok(NodeDescriptor {
        payload: NodePayload::Hysteria2(Hysteria2Payload {
            password,
            obfs: share.param(&["obfs"]),
            obfs_password: share.param(&["obfs-password", "obfs_password"]),
        }),
        transport,
        host: share.host,
        port: share.port,
        tag: share.tag,
        raw: None,
    })
}

fn parse_tuic(uri: &str) -> ParseResult<NodeDescriptor> {
    let share = ShareUri::parse(uri)?;
    let uuid = share.credential("uuid")?;
    let password = share
        .password
        .clone()
        .filter(|p| !p.is_empty())
        .ok_or(ParseError::MissingField("password"))?;
    let mut transport = share.transport(Security::Tls)?;
    transport.security = Security::Tls;

    Ok(NodeDescriptor {
        payload: NodePayload::Tuic(TuicPayload {
            uuid,
            password,
            congestion_control: share.param(&["congestion_control", "congestion-control"]),
        }),
        transport,
        host: share.host,
        port: share.port,
        tag: share.tag,
        raw: None,
    })
}

/// SIP002 (`ss://base64(method:pass)@host:port`), plain userinfo, and the
/// legacy fully-encoded `ss://base64(method:pass@host:port)` form
fn parse_shadowsocks(rest: &str) -> ParseResult<NodeDescriptor> {
    let (body, tag) = match rest.split_once('#') {
        Some((body, tag)) => (body, Some(percent_decode(tag)).filter(|t| !t.is_empty())),
        None => (rest, None),
    };
    let (main, query) = match body.split_once('?') {
        Some((main, query)) => (main, Some(query)),
        None => (body, None),
    };
    let main = main.trim().trim_end_matches('/');
    if main.is_empty() {
        return Err(ParseError::MissingField("host"));
    }

    let (userinfo, host_port) = match main.rsplit_once('@') {
        Some((userinfo, host_port)) => (decode_ss_userinfo(userinfo)?, host_port.to_string()),
        None => {
            let decoded = decode_base64_text(main).ok_or(ParseError::InvalidBase64)?;
            let (userinfo, host_port) =
                decoded
                    .trim()
                    .rsplit_once('@')
                    .ok_or_else(|| ParseError::InvalidField {
                        field: "userinfo",
                        value: abbreviate(&decoded),
                    })?;
            (userinfo.to_string(), host_port.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or(ParseError::MissingField("password"))?;
    if method.trim().is_empty() {
        return Err(ParseError::MissingField("method"));
    }

    let (host, port) = host_port
        .trim()
        .rsplit_once(':')
        .ok_or(ParseError::MissingField("port"))?;
    let host = host.trim_matches(|c| c == '[' || c == ']');
    if host.is_empty() {
        return Err(ParseError::MissingField("host"));
    }

    let plugin = query.and_then(|q| {
        url::form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == "plugin")
            .map(|(_, v)| v.into_owned())
            .filter(|v| !v.is_empty())
    });

    Ok(NodeDescriptor {
        host: host.to_string(),
        port: parse_port(port)?,
        payload: NodePayload::Shadowsocks(ShadowsocksPayload {
            method: method.trim().to_string(),
            password: password.to_string(),
            plugin,
        }),
        transport: TransportOptions::default(),
        tag,
        raw: None,
    })
}

fn decode_ss_userinfo(raw: &str) -> ParseResult<String> {
    let decoded = percent_decode(raw);
    if decoded.contains(':') {
        return Ok(decoded);
    }
    decode_base64_text(&decoded)
        .filter(|s| s.contains(':'))
        .ok_or(ParseError::InvalidBase64)
}

/// Parse the `proxies:` list of a Clash-style document
///
/// Returns one result per entry so the caller can count skips.
pub fn parse_clash_document(text: &str) -> ParseResult<Vec<ParseResult<NodeDescriptor>>> {
    let doc: YamlValue =
        serde_yaml::from_str(text).map_err(|e| ParseError::InvalidDocument(e.to_string()))?;
    let proxies = doc
        .get("proxies")
        .and_then(YamlValue::as_sequence)
        .ok_or(ParseError::MissingField("proxies"))?;

    Ok(proxies.iter().map(parse_clash_proxy).collect())
}

/// Lenient accessors over one YAML proxy mapping
struct ClashEntry<'a>(&'a YamlValue);

impl<'a> ClashEntry<'a> {
    fn lookup(&self, path: &[&str]) -> Option<&'a YamlValue> {
        path.iter().try_fold(self.0, |value, key| value.get(*key))
    }

    fn str_at(&self, path: &[&str]) -> Option<String> {
        self.lookup(path).and_then(yaml_scalar)
    }

    fn str(&self, key: &str) -> Option<String> {
        self.str_at(&[key])
    }

    fn str_any(&self, keys: &[&str]) -> Option<String> {
        keys.iter().find_map(|key| self.str(key))
    }

    fn bool(&self, key: &str) -> Option<bool> {
        match self.lookup(&[key])? {
            YamlValue::Bool(b) => Some(*b),
            other => yaml_scalar(other).map(|s| to_bool(&s)),
        }
    }

    fn list(&self, key: &str) -> Vec<String> {
        match self.lookup(&[key]) {
            Some(YamlValue::Sequence(seq)) => seq.iter().filter_map(yaml_scalar).collect(),
            Some(other) => split_list(yaml_scalar(other).as_deref()),
            None => Vec::new(),
        }
    }
}

fn parse_clash_proxy(value: &YamlValue) -> ParseResult<NodeDescriptor> {
    if !value.is_mapping() {
        return Err(ParseError::InvalidDocument(
            "proxy entry is not a mapping".to_string(),
        ));
    }
    let entry = ClashEntry(value);

    let kind = entry
        .str("type")
        .ok_or(ParseError::MissingField("type"))?
        .to_lowercase();
    let host = entry.str("server").ok_or(ParseError::MissingField("server"))?;
    let port = parse_port(&entry.str("port").ok_or(ParseError::MissingField("port"))?)?;

    let net = entry.str("network").unwrap_or_default();
    let network = Network::from_str(&net).ok_or_else(|| ParseError::InvalidField {
        field: "network",
        value: net.clone(),
    })?;

    let mut transport = TransportOptions {
        network,
        security: if entry.bool("tls").unwrap_or(false) {
            Security::Tls
        } else {
            Security::None
        },
        sni: entry.str_any(&["servername", "sni"]),
        allow_insecure: entry.bool("skip-cert-verify").unwrap_or(false),
        host: entry
            .str_at(&["ws-opts", "headers", "Host"])
            .or_else(|| entry.str_at(&["ws-opts", "headers", "host"])),
        path: entry.str_at(&["ws-opts", "path"]),
        grpc_service_name: entry.str_at(&["grpc-opts", "grpc-service-name"]),
        alpn: entry.list("alpn"),
        fingerprint: entry.str("client-fingerprint"),
        reality_public_key: entry.str_at(&["reality-opts", "public-key"]),
        reality_short_id: entry.str_at(&["reality-opts", "short-id"]),
    };
    if transport.reality_public_key.is_some() {
        transport.security = Security::Reality;
    }

    let payload = match kind.as_str() {
        "vmess" => NodePayload::Vmess(VmessPayload {
            id: entry.str("uuid").ok_or(ParseError::MissingField("uuid"))?,
            alter_id: entry.str("alterId").and_then(|v| v.parse().ok()).unwrap_or(0),
            cipher: entry.str("cipher").unwrap_or_else(|| "auto".to_string()),
        }),
        "vless" => NodePayload::Vless(VlessPayload {
            id: entry.str("uuid").ok_or(ParseError::MissingField("uuid"))?,
            encryption: entry
                .str("encryption")
                .unwrap_or_else(|| "none".to_string()),
            flow: entry.str("flow"),
        }),
        "trojan" => {
            if transport.security == Security::None {
                transport.security = Security::Tls;
            }
            NodePayload::Trojan(TrojanPayload {
                password: entry
                    .str("password")
                    .ok_or(ParseError::MissingField("password"))?,
            })
        }
        "ss" | "shadowsocks" => NodePayload::Shadowsocks(ShadowsocksPayload {
            method: entry
                .str_any(&["cipher", "method"])
                .ok_or(ParseError::MissingField("cipher"))?,
            password: entry
                .str("password")
                .ok_or(ParseError::MissingField("password"))?,
            plugin: entry.str("plugin"),
        }),
        "hysteria2" | "hy2" => {
            transport.security = Security::Tls;
            NodePayload::Hysteria2(Hysteria2Payload {
                password: entry
                    .str_any(&["password", "auth", "auth-str"])
                    .ok_or(ParseError::MissingField("password"))?,
                obfs: entry.str("obfs"),
                obfs_password: entry.str("obfs-password"),
            })
        }
        "tuic" => {
            transport.security = Security::Tls;
            NodePayload::Tuic(TuicPayload {
                uuid: entry.str("uuid").ok_or(ParseError::MissingField("uuid"))?,
                password: entry
                    .str("password")
                    .ok_or(ParseError::MissingField("password"))?,
                congestion_control: entry.str("congestion-controller"),
            })
        }
        other => return Err(ParseError::UnsupportedType(other.to_string())),
    };

    Ok(NodeDescriptor {
        host,
        port,
        payload,
        transport,
        tag: entry.str("name"),
        raw: serde_json::to_value(value).ok(),
    })
}

/// Heuristic for a base64-wrapped list: long enough and base64 alphabet only
pub fn looks_like_base64(text: &str) -> bool {
    let s = text.trim();
    s.len() >= 16
        && s.chars().all(|c| {
            c.is_whitespace() || c.is_ascii_alphanumeric() || matches!(c, '+' | '/' | '=' | '-' | '_')
        })
}

/// Decode standard or URL-safe base64, padded or not, into UTF-8 text
pub fn decode_base64_text(input: &str) -> Option<String> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    let unpadded = cleaned.trim_end_matches('=');
    let padded = match unpadded.len() % 4 {
        0 => unpadded.to_string(),
        rem => format!("{}{}", unpadded, "=".repeat(4 - rem)),
    };

    [&STANDARD, &URL_SAFE]
        .iter()
        .filter_map(|engine| engine.decode(&padded).ok())
        .filter_map(|bytes| String::from_utf8(bytes).ok())
        .find(|text| !text.trim().is_empty())
}

fn json_str(obj: &JsonValue, key: &str) -> Option<String> {
    let value = match obj.get(key)? {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!value.is_empty()).then_some(value)
}

fn yaml_scalar(value: &YamlValue) -> Option<String> {
    let s = match value {
        YamlValue::String(s) => s.trim().to_string(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        _ => return None,
    };
    (!s.is_empty()).then_some(s)
}

fn parse_port(raw: &str) -> ParseResult<u16> {
    match raw.trim().parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ParseError::InvalidField {
            field: "port",
            value: raw.to_string(),
        }),
    }
}

fn percent_decode(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn to_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "y" | "on"
    )
}

fn split_list(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| {
        s.split(',')
            .map(|part| part.trim().to_string())
            .filter(|part| !part.is_empty())
            .collect()
    })
    .unwrap_or_default()
}

fn abbreviate(raw: &str) -> String {
    raw.chars().take(48).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NodeKind;
    use serde_json::json;

    fn vmess_uri(obj: serde_json::Value) -> String {
        format!("vmess://{}", STANDARD.encode(obj.to_string()))
    }

    #[test]
    fn test_duplicate_entries_collapse_to_one_node() {
        let text = "\
trojan://secret@edge.example:443?sni=cdn.example#HK%2001
trojan://secret@edge.example:443?sni=cdn.example#HK%2002
trojan://secret@edge.example:443#Backup
";
        let parsed = parse_subscription(text);
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.duplicates, 2);
        assert_eq!(parsed.nodes[0].tag.as_deref(), Some("HK 01"));
    }

    #[test]
    fn test_parse_vmess_uri() {
        let uri = vmess_uri(json!({
            "v": "2", "ps": "SG ws", "add": "sg.example", "port": "8080",
            "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "aid": "0", "scy": "auto",
            "net": "ws", "host": "cdn.example", "path": "/ray", "tls": "tls", "sni": "cdn.example"
        }));

        let node = parse_uri(&uri).unwrap();
        assert_eq!(node.kind(), NodeKind::Vmess);
        assert_eq!(node.host, "sg.example");
        assert_eq!(node.port, 8080);
        assert_eq!(node.transport.network, Network::Ws);
        assert_eq!(node.transport.security, Security::Tls);
        assert_eq!(node.transport.host.as_deref(), Some("cdn.example"));
        assert_eq!(node.transport.path.as_deref(), Some("/ray"));
        assert_eq!(node.tag.as_deref(), Some("SG ws"));
    }

    #[test]
    fn test_parse_vless_reality_uri() {
        let uri = "vless://0b3f7a36-7e5c-4b6a-9d0a-4d2c0c1f1a11@203.0.113.7:443?security=reality&sni=www.example.com&fp=chrome&pbk=PUBKEY&sid=ab12&type=tcp&flow=xtls-rprx-vision#JP%20reality";
        let node = parse_uri(uri).unwrap();

        assert_eq!(node.kind(), NodeKind::Vless);
        assert_eq!(node.transport.security, Security::Reality);
        assert_eq!(node.transport.reality_public_key.as_deref(), Some("PUBKEY"));
        assert_eq!(node.transport.fingerprint.as_deref(), Some("chrome"));
        assert!(node.requires_advanced_engine());
        match &node.payload {
            NodePayload::Vless(p) => {
                assert_eq!(p.encryption, "none");
                assert_eq!(p.flow.as_deref(), Some("xtls-rprx-vision"));
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_trojan_defaults_to_tls() {
        let node = parse_uri("trojan://pw@t.example:443").unwrap();
        assert_eq!(node.transport.security, Security::Tls);
        assert_eq!(node.display_name(), "trojan:t.example:443");
    }

    #[test]
    fn test_parse_shadowsocks_forms() {
        let sip002 = format!(
            "ss://{}@ss.example:8388/?plugin=obfs-local%3Bobfs%3Dhttp#SS%20one",
            URL_SAFE.encode("aes-256-gcm:pass").trim_end_matches('=')
        );
        let node = parse_uri(&sip002).unwrap();
        assert_eq!(node.host, "ss.example");
        assert_eq!(node.port, 8388);
        assert_eq!(node.tag.as_deref(), Some("SS one"));
        match &node.payload {
            NodePayload::Shadowsocks(p) => {
                assert_eq!(p.method, "aes-256-gcm");
                assert_eq!(p.password, "pass");
                assert_eq!(p.plugin.as_deref(), Some("obfs-local;obfs=http"));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let legacy = format!(
            "ss://{}#legacy",
            STANDARD.encode("chacha20-ietf-poly1305:p@ss@198.51.100.4:443")
        );
        let node = parse_uri(&legacy).unwrap();
        assert_eq!(node.host, "198.51.100.4");
        assert_eq!(node.port, 443);
        match &node.payload {
            NodePayload::Shadowsocks(p) => assert_eq!(p.password, "p@ss"),
            other => panic!("unexpected payload {:?}", other),
        }

        let plain = parse_uri("ss://aes-128-gcm:hunter2@[2001:db8::1]:8443").unwrap();
        assert_eq!(plain.host, "2001:db8::1");
        assert_eq!(plain.port, 8443);
    }

    #[test]
    fn test_parse_hysteria2_and_tuic_uris() {
        let hy2 = parse_uri("hy2://letmein@hy.example:8443/?sni=hy.example&obfs=salamander&obfs-password=x#HY").unwrap();
        assert_eq!(hy2.kind(), NodeKind::Hysteria2);
        assert!(hy2.requires_advanced_engine());
        match &hy2.payload {
            NodePayload::Hysteria2(p) => {
                assert_eq!(p.password, "letmein");
                assert_eq!(p.obfs.as_deref(), Some("salamander"));
            }
            other => panic!("unexpected payload {:?}", other),
        }

        let tuic = parse_uri("tuic://uuid-1:pw@tu.example:443?congestion_control=bbr&alpn=h3").unwrap();
        assert_eq!(tuic.kind(), NodeKind::Tuic);
        assert_eq!(tuic.transport.alpn, vec!["h3".to_string()]);

        assert_eq!(
            parse_uri("tuic://uuid-1@tu.example:443").unwrap_err(),
            ParseError::MissingField("password")
        );
    }

    #[test]
    fn test_base64_wrapped_list() {
        let list = "trojan://a@one.example:443#one\nvless://id-2@two.example:443?type=ws&path=%2Fws#two\n";
        let wrapped = URL_SAFE.encode(list);
        let wrapped = wrapped.trim_end_matches('=');

        assert_eq!(detect_format(wrapped), SubscriptionFormat::Base64);
        let parsed = parse_subscription(wrapped);
        assert_eq!(parsed.nodes.len(), 2);
        assert_eq!(parsed.nodes[1].transport.path.as_deref(), Some("/ws"));
    }

    #[test]
    fn test_malformed_entries_are_skipped() {
        let text = "\
trojan://good@ok.example:443
trojan://@missing-password.example:443
vless://id@no-port.example
socks5://user@proxy.example:1080
not a uri at all
";
        let parsed = parse_subscription(text);
        assert_eq!(parsed.nodes.len(), 1);
        assert_eq!(parsed.skipped, 4);
    }

    #[test]
    fn test_parse_clash_document() {
        let text = r#"
port: 7890
proxies:
  - name: "vmess ws"
    type: vmess
    server: vm.example
    port: 443
    uuid: 11111111-2222-3333-4444-555555555555
    alterId: 0
    cipher: auto
    tls: true
    network: ws
    ws-opts:
      path: /vm
      headers:
        Host: cdn.example
  - name: hy2
    type: hysteria2
    server: hy.example
    port: "8443"
    password: pw
  - name: tuic
    type: tuic
    server: tu.example
    port: 443
    uuid: u-1
    password: p-1
  - name: reality
    type: vless
    server: re.example
    port: 443
    uuid: u-2
    reality-opts:
      public-key: KEY
      short-id: "01"
  - name: broken
    type: trojan
    port: 443
    password: nope
proxy-groups:
  - name: auto
    type: url-test
"#;
        assert_eq!(detect_format(text), SubscriptionFormat::ClashYaml);
        let parsed = parse_subscription(text);

        assert_eq!(parsed.nodes.len(), 4);
        assert_eq!(parsed.skipped, 1);

        let vmess = &parsed.nodes[0];
        assert_eq!(vmess.transport.network, Network::Ws);
        assert_eq!(vmess.transport.security, Security::Tls);
        assert_eq!(vmess.transport.host.as_deref(), Some("cdn.example"));
        let raw = vmess.raw.as_ref().unwrap();
        assert_eq!(raw["server"], json!("vm.example"));

        assert_eq!(parsed.nodes[1].port, 8443);
        assert_eq!(parsed.nodes[1].kind(), NodeKind::Hysteria2);
        assert_eq!(parsed.nodes[2].kind(), NodeKind::Tuic);
        assert_eq!(parsed.nodes[3].transport.security, Security::Reality);
        assert!(parsed.nodes[3].requires_advanced_engine());
    }

    #[test]
    fn test_looks_like_base64() {
        assert!(looks_like_base64("dHJvamFuOi8vYUBiOjQ0Mw=="));
        assert!(!looks_like_base64("short"));
        assert!(!looks_like_base64("trojan://a@b:443 trojan://c@d:443"));
    }
}
