use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use percent_encoding::percent_decode_str;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use url::Url;

use crate::node::{Credentials, Node, RealityOptions, TlsOptions, Transport};

#[derive(Debug, Error)]
pub enum ParseError {
    /// Scheme or line we deliberately do not handle. Skipped without noise.
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("malformed: {0}")]
    Malformed(String),
}

fn malformed(msg: impl Into<String>) -> ParseError {
    ParseError::Malformed(msg.into())
}

/// Parses one proxy link and dispatches by scheme.
pub fn parse_node_uri(uri: &str) -> Result<Node, ParseError> {
    let uri = uri.trim();
    if uri.is_empty() || uri.starts_with('#') || uri.starts_with("//") {
        return Err(ParseError::Unsupported("comment".into()));
    }

    match uri.split_once("://").map(|(scheme, _)| scheme) {
        Some("vmess") => parse_vmess(uri),
        Some("vless") => parse_vless(uri),
        Some("trojan") => parse_trojan(uri),
        Some("ss") => parse_shadowsocks(uri),
        Some(other) => Err(ParseError::Unsupported(other.to_string())),
        None => Err(malformed(format!("not a proxy URI: {}", truncate(uri, 30)))),
    }
}

/// Parses a line-separated link list. A bad line never aborts the batch; it
/// is logged at debug and discarded.
pub fn parse_node_list(content: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_node_uri(line) {
            Ok(node) => nodes.push(node),
            Err(ParseError::Unsupported(what)) => {
                log::debug!("skipping line {} ({what})", line_num + 1);
            }
            Err(e) => {
                log::debug!("discarding line {}: {e}", line_num + 1);
            }
        }
    }
    nodes
}

fn parse_vmess(uri: &str) -> Result<Node, ParseError> {
    let encoded = uri.strip_prefix("vmess://").unwrap_or(uri);
    let decoded =
        decode_b64_lenient(encoded).ok_or_else(|| malformed("vmess body is not base64"))?;
    let body: Value = serde_json::from_slice(&decoded)
        .map_err(|e| malformed(format!("vmess body is not valid JSON: {e}")))?;

    let server = str_field(&body, &["add"]).ok_or_else(|| malformed("vmess missing 'add'"))?;
    let port = int_field(&body, &["port"]).ok_or_else(|| malformed("vmess missing 'port'"))?;
    let port = validate_port(port)?;
    let uuid = str_field(&body, &["id"]).ok_or_else(|| malformed("vmess missing 'id'"))?;
    let alter_id = int_field(&body, &["aid"]).unwrap_or(0).max(0) as u32;
    let security = str_field(&body, &["scy"]).unwrap_or_else(|| "auto".to_string());

    let network = str_field(&body, &["net"]).unwrap_or_else(|| "tcp".to_string());
    let path = str_field(&body, &["path"]);
    let host = str_field(&body, &["host"]).filter(|h| !h.is_empty());
    let service_name = str_field(&body, &["serviceName", "grpc-service-name", "path"]);
    let transport = build_transport(&network, path, host.clone(), service_name);

    let tls = if str_field(&body, &["tls"]).as_deref() == Some("tls") {
        Some(TlsOptions {
            sni: str_field(&body, &["sni"])
                .filter(|s| !s.is_empty())
                .or(host)
                .or_else(|| Some(server.clone())),
            ..TlsOptions::default()
        })
    } else {
        None
    };

    let name = str_field(&body, &["ps"])
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{server}:{port}"));

    Ok(Node {
        name,
        server,
        port,
        credentials: Credentials::Vmess {
            uuid,
            alter_id,
            security,
        },
        transport,
        tls,
        origin_uri: uri.to_string(),
    })
}

fn parse_vless(uri: &str) -> Result<Node, ParseError> {
    let url = Url::parse(uri).map_err(|e| malformed(format!("vless URL: {e}")))?;

    let uuid = decode_component(url.username());
    if uuid.is_empty() {
        return Err(malformed("vless missing user id"));
    }
    let server = host_string(&url)?;
    let port = url.port().ok_or_else(|| malformed("vless missing port"))?;
    let port = validate_port(port as i64)?;

    let params = query_map(&url);
    let transport = transport_from_params(&params);

    let tls = match params.get("security").map(String::as_str) {
        Some("tls") => Some(TlsOptions {
            sni: params.get("sni").cloned().or_else(|| Some(server.clone())),
            alpn: alpn_list(&params),
            fingerprint: params.get("fp").cloned(),
            reality: None,
        }),
        Some("reality") => {
            let public_key = params
                .get("pbk")
                .cloned()
                .ok_or_else(|| malformed("reality requires a public key"))?;
            let short_id = params
                .get("sid")
                .cloned()
                .ok_or_else(|| malformed("reality requires a short id"))?;
            Some(TlsOptions {
                sni: params.get("sni").cloned().or_else(|| Some(server.clone())),
                alpn: alpn_list(&params),
                fingerprint: params.get("fp").cloned(),
                reality: Some(RealityOptions {
                    public_key,
                    short_id,
                }),
            })
        }
        _ => None,
    };

    Ok(Node {
        name: fragment_name(&url, &server, port),
        server,
        port,
        credentials: Credentials::Vless {
            uuid,
            flow: params.get("flow").cloned(),
        },
        transport,
        tls,
        origin_uri: uri.to_string(),
    })
}

fn parse_trojan(uri: &str) -> Result<Node, ParseError> {
    let url = Url::parse(uri).map_err(|e| malformed(format!("trojan URL: {e}")))?;

    let password = decode_component(url.username());
    if password.is_empty() {
        return Err(malformed("trojan missing password"));
    }
    let server = host_string(&url)?;
    let port = url.port().ok_or_else(|| malformed("trojan missing port"))?;
    let port = validate_port(port as i64)?;

    let params = query_map(&url);
    let transport = transport_from_params(&params);

    // TLS is assumed for trojan.
    let tls = Some(TlsOptions {
        sni: params.get("sni").cloned().or_else(|| Some(server.clone())),
        alpn: alpn_list(&params),
        fingerprint: params.get("fp").cloned(),
        reality: None,
    });

    Ok(Node {
        name: fragment_name(&url, &server, port),
        server,
        port,
        credentials: Credentials::Trojan { password },
        transport,
        tls,
        origin_uri: uri.to_string(),
    })
}

fn parse_shadowsocks(uri: &str) -> Result<Node, ParseError> {
    let rest = uri.strip_prefix("ss://").unwrap_or(uri);
    let (body, fragment) = match rest.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (rest, None),
    };
    // Plugin and other query parameters are irrelevant for testing.
    let body = body.split_once('?').map(|(b, _)| b).unwrap_or(body);

    let (method, password, host_port) = if let Some((userinfo, host_port)) = body.rsplit_once('@') {
        let userinfo = decode_component(userinfo);
        let (method, password) = if userinfo.contains(':') {
            split_method_password(&userinfo)?
        } else {
            let decoded = decode_b64_lenient(&userinfo)
                .ok_or_else(|| malformed("ss userinfo is neither plain nor base64"))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|_| malformed("ss userinfo decodes to invalid UTF-8"))?;
            split_method_password(&decoded)?
        };
        (method, password, host_port.to_string())
    } else {
        // Whole body is base64 of method:password@host:port.
        let decoded = decode_b64_lenient(body).ok_or_else(|| malformed("ss body is not base64"))?;
        let decoded = String::from_utf8(decoded)
            .map_err(|_| malformed("ss body decodes to invalid UTF-8"))?;
        let (userinfo, host_port) = decoded
            .rsplit_once('@')
            .ok_or_else(|| malformed("ss body missing '@'"))?;
        let (method, password) = split_method_password(userinfo)?;
        (method, password, host_port.to_string())
    };

    let (server, port) = split_host_port(&host_port)?;
    let name = fragment
        .map(decode_component)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{server}:{port}"));

    Ok(Node {
        name,
        server,
        port,
        credentials: Credentials::Shadowsocks { method, password },
        transport: Transport::Tcp,
        tls: None,
        origin_uri: uri.to_string(),
    })
}

/// Parses one structured (Clash-style) proxy entry. The entry arrives as a
/// JSON value so YAML mappings can be fed through after transcoding; scalar
/// fields wrapped in one-element lists are unwrapped here and nowhere else.
pub fn parse_structured(entry: &Value) -> Result<Node, ParseError> {
    let kind = str_field(entry, &["type"]).ok_or_else(|| malformed("entry missing 'type'"))?;

    let server = str_field(entry, &["server"]).ok_or_else(|| malformed("entry missing 'server'"))?;
    let port = int_field(entry, &["port"]).ok_or_else(|| malformed("entry missing 'port'"))?;
    let port = validate_port(port)?;
    let name = str_field(entry, &["name"])
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{server}:{port}"));

    let network = str_field(entry, &["network"]).unwrap_or_else(|| "tcp".to_string());
    let ws_path = nested_str(entry, &["ws-opts", "path"]).or_else(|| str_field(entry, &["path"]));
    let ws_host = nested_str(entry, &["ws-opts", "headers", "Host"])
        .or_else(|| str_field(entry, &["host"]));
    let service_name = nested_str(entry, &["grpc-opts", "grpc-service-name"])
        .or_else(|| str_field(entry, &["serviceName", "grpc-service-name"]));
    let transport = build_transport(&network, ws_path, ws_host.clone(), service_name);

    let tls_enabled = bool_field(entry, &["tls"]).unwrap_or(false);
    let sni = str_field(entry, &["servername", "sni"])
        .filter(|s| !s.is_empty())
        .or_else(|| Some(server.clone()));

    let (credentials, tls) = match kind.as_str() {
        "vmess" => {
            let uuid =
                str_field(entry, &["uuid"]).ok_or_else(|| malformed("vmess missing 'uuid'"))?;
            let alter_id = int_field(entry, &["alterId", "aid"]).unwrap_or(0).max(0) as u32;
            let security =
                str_field(entry, &["cipher", "security"]).unwrap_or_else(|| "auto".to_string());
            let tls = tls_enabled.then(|| TlsOptions {
                sni,
                ..TlsOptions::default()
            });
            (
                Credentials::Vmess {
                    uuid,
                    alter_id,
                    security,
                },
                tls,
            )
        }
        "vless" => {
            let uuid =
                str_field(entry, &["uuid"]).ok_or_else(|| malformed("vless missing 'uuid'"))?;
            let fingerprint = str_field(entry, &["client-fingerprint"]);
            let tls = if let Some(public_key) = nested_str(entry, &["reality-opts", "public-key"])
            {
                Some(TlsOptions {
                    sni,
                    fingerprint,
                    reality: Some(RealityOptions {
                        public_key,
                        short_id: nested_str(entry, &["reality-opts", "short-id"])
                            .unwrap_or_default(),
                    }),
                    ..TlsOptions::default()
                })
            } else {
                tls_enabled.then(|| TlsOptions {
                    sni,
                    fingerprint,
                    ..TlsOptions::default()
                })
            };
            (
                Credentials::Vless {
                    uuid,
                    flow: str_field(entry, &["flow"]),
                },
                tls,
            )
        }
        "trojan" => {
            let password = str_field(entry, &["password"])
                .ok_or_else(|| malformed("trojan missing 'password'"))?;
            (
                Credentials::Trojan { password },
                Some(TlsOptions {
                    sni,
                    ..TlsOptions::default()
                }),
            )
        }
        "ss" | "shadowsocks" => {
            let method = str_field(entry, &["cipher", "method"])
                .ok_or_else(|| malformed("ss missing cipher"))?;
            let password =
                str_field(entry, &["password"]).ok_or_else(|| malformed("ss missing 'password'"))?;
            (Credentials::Shadowsocks { method, password }, None)
        }
        other => return Err(ParseError::Unsupported(other.to_string())),
    };

    Ok(Node {
        name,
        server: server.clone(),
        port,
        credentials,
        transport,
        tls,
        origin_uri: format!("{kind}://{server}:{port}"),
    })
}

fn build_transport(
    network: &str,
    path: Option<String>,
    host: Option<String>,
    service_name: Option<String>,
) -> Transport {
    match network {
        "ws" | "websocket" => Transport::Ws {
            path: path.unwrap_or_else(|| "/".to_string()),
            host,
        },
        "grpc" => Transport::Grpc {
            service_name: service_name.unwrap_or_default(),
        },
        "h2" | "http" => Transport::H2 {
            path: path.unwrap_or_else(|| "/".to_string()),
            host,
        },
        "tcp" | "" => Transport::Tcp,
        other => {
            // sing-box has no counterpart for xhttp/httpupgrade/splithttp.
            log::debug!("downgrading unsupported transport '{other}' to tcp");
            Transport::Tcp
        }
    }
}

fn transport_from_params(params: &HashMap<String, String>) -> Transport {
    let network = params.get("type").map(String::as_str).unwrap_or("tcp");
    build_transport(
        network,
        params.get("path").cloned(),
        params.get("host").cloned().filter(|h| !h.is_empty()),
        params
            .get("serviceName")
            .or_else(|| params.get("grpc-service-name"))
            .cloned(),
    )
}

fn alpn_list(params: &HashMap<String, String>) -> Vec<String> {
    params
        .get("alpn")
        .map(|s| s.split(',').map(|x| x.trim().to_string()).collect())
        .unwrap_or_default()
}

fn query_map(url: &Url) -> HashMap<String, String> {
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn fragment_name(url: &Url, server: &str, port: u16) -> String {
    url.fragment()
        .map(decode_component)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| format!("{server}:{port}"))
}

fn host_string(url: &Url) -> Result<String, ParseError> {
    let host = url.host_str().ok_or_else(|| malformed("URL missing host"))?;
    // The url crate serializes IPv6 hosts with brackets; the engine wants
    // the bare address.
    Ok(host.trim_start_matches('[').trim_end_matches(']').to_string())
}

fn decode_component(s: &str) -> String {
    percent_decode_str(s)
        .decode_utf8()
        .map(|c| c.into_owned())
        .unwrap_or_else(|_| s.to_string())
}

fn split_method_password(userinfo: &str) -> Result<(String, String), ParseError> {
    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| malformed("ss userinfo missing ':'"))?;
    if method.is_empty() {
        return Err(malformed("ss missing method"));
    }
    Ok((method.to_string(), password.to_string()))
}

fn split_host_port(token: &str) -> Result<(String, u16), ParseError> {
    let (host, port_str) = if let Some(rest) = token.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| malformed(format!("unclosed IPv6 host in {token}")))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| malformed(format!("missing port after IPv6 host in {token}")))?;
        (host, port)
    } else {
        token
            .rsplit_once(':')
            .ok_or_else(|| malformed(format!("expected host:port, got {token}")))?
    };

    if host.is_empty() {
        return Err(malformed("empty host"));
    }
    let port: i64 = port_str
        .parse()
        .map_err(|_| malformed(format!("invalid port '{port_str}'")))?;
    Ok((host.to_string(), validate_port(port)?))
}

fn validate_port(port: i64) -> Result<u16, ParseError> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(malformed(format!("port {port} out of range")))
    }
}

/// Base64 decode tolerating both alphabets, stray whitespace, and missing or
/// present padding.
fn decode_b64_lenient(input: &str) -> Option<Vec<u8>> {
    let compact: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(compact)
        .or_else(|_| URL_SAFE_NO_PAD.decode(compact))
        .ok()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Unwraps a scalar that arrived wrapped in a one-element list.
fn scalar(value: &Value) -> &Value {
    match value {
        Value::Array(items) if items.len() == 1 => &items[0],
        other => other,
    }
}

fn field<'a>(map: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|k| map.get(k))
        .map(scalar)
        .find(|v| !v.is_null())
}

fn nested_str(map: &Value, path: &[&str]) -> Option<String> {
    let mut current = map;
    for key in &path[..path.len() - 1] {
        current = scalar(current.get(key)?);
    }
    str_field(current, &path[path.len() - 1..])
}

fn str_field(map: &Value, keys: &[&str]) -> Option<String> {
    match field(map, keys)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn int_field(map: &Value, keys: &[&str]) -> Option<i64> {
    match field(map, keys)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bool_field(map: &Value, keys: &[&str]) -> Option<bool> {
    match field(map, keys)? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => Some(s == "true" || s == "tls"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeKind;
    use base64::engine::general_purpose::STANDARD;
    use serde_json::json;

    #[test]
    fn test_parse_vmess_ws_tls() {
        let body = r#"{"add":"1.2.3.4","port":"443","id":"00000000-0000-0000-0000-000000000000","net":"ws","tls":"tls"}"#;
        let uri = format!("vmess://{}", STANDARD.encode(body));
        let node = parse_node_uri(&uri).unwrap();

        assert_eq!(node.kind(), NodeKind::Vmess);
        assert_eq!(node.server, "1.2.3.4");
        assert_eq!(node.port, 443);
        assert!(matches!(node.transport, Transport::Ws { .. }));
        let tls = node.tls.unwrap();
        assert_eq!(tls.sni.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_parse_vmess_unpadded_base64() {
        let body = r#"{"add":"example.com","port":8443,"id":"uuid","aid":"2","ps":"node-1"}"#;
        let uri = format!("vmess://{}", STANDARD.encode(body).trim_end_matches('='));
        let node = parse_node_uri(&uri).unwrap();

        assert_eq!(node.name, "node-1");
        assert_eq!(node.port, 8443);
        match node.credentials {
            Credentials::Vmess { alter_id, .. } => assert_eq!(alter_id, 2),
            _ => panic!("expected vmess"),
        }
        assert!(node.tls.is_none());
    }

    #[test]
    fn test_parse_vmess_missing_uuid() {
        let body = r#"{"add":"example.com","port":"443"}"#;
        let uri = format!("vmess://{}", STANDARD.encode(body));
        assert!(parse_node_uri(&uri).is_err());
    }

    #[test]
    fn test_parse_vless_reality() {
        let uri = "vless://uuid@server.example.com:443?security=reality&sni=sni.example.com&fp=chrome&pbk=pubkey&sid=42&type=tcp&flow=xtls-rprx-vision#node";
        let node = parse_node_uri(uri).unwrap();

        assert_eq!(node.name, "node");
        let tls = node.tls.unwrap();
        assert_eq!(tls.sni.as_deref(), Some("sni.example.com"));
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
        let reality = tls.reality.unwrap();
        assert_eq!(reality.public_key, "pubkey");
        assert_eq!(reality.short_id, "42");
        match node.credentials {
            Credentials::Vless { flow, .. } => {
                assert_eq!(flow.as_deref(), Some("xtls-rprx-vision"));
            }
            _ => panic!("expected vless"),
        }
    }

    #[test]
    fn test_parse_vless_grpc() {
        let uri = "vless://uuid@example.com:443?type=grpc&serviceName=Svc&security=tls";
        let node = parse_node_uri(uri).unwrap();
        match node.transport {
            Transport::Grpc { service_name } => assert_eq!(service_name, "Svc"),
            other => panic!("expected grpc transport, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_vless_missing_port() {
        assert!(parse_node_uri("vless://uuid@example.com?type=tcp").is_err());
    }

    #[test]
    fn test_parse_trojan_basic() {
        let uri = "trojan://secret@t.example.com:443?sni=cdn.example.com#My%20Node";
        let node = parse_node_uri(uri).unwrap();

        assert_eq!(node.name, "My Node");
        assert_eq!(node.server, "t.example.com");
        match node.credentials {
            Credentials::Trojan { ref password } => assert_eq!(password, "secret"),
            _ => panic!("expected trojan"),
        }
        assert_eq!(node.tls.unwrap().sni.as_deref(), Some("cdn.example.com"));
    }

    #[test]
    fn test_parse_trojan_without_port() {
        assert!(parse_node_uri("trojan://secret@t.example.com").is_err());
    }

    #[test]
    fn test_parse_ss_plain_userinfo() {
        let node = parse_node_uri("ss://aes-128-gcm:secret@example.com:8388#ssnode").unwrap();
        assert_eq!(node.name, "ssnode");
        match node.credentials {
            Credentials::Shadowsocks {
                ref method,
                ref password,
            } => {
                assert_eq!(method, "aes-128-gcm");
                assert_eq!(password, "secret");
            }
            _ => panic!("expected shadowsocks"),
        }
    }

    #[test]
    fn test_parse_ss_encoded_userinfo() {
        let userinfo = URL_SAFE_NO_PAD.encode("chacha20-ietf-poly1305:pw");
        let node = parse_node_uri(&format!("ss://{userinfo}@1.2.3.4:8388")).unwrap();
        assert_eq!(node.server, "1.2.3.4");
        match node.credentials {
            Credentials::Shadowsocks { ref method, .. } => {
                assert_eq!(method, "chacha20-ietf-poly1305");
            }
            _ => panic!("expected shadowsocks"),
        }
    }

    #[test]
    fn test_parse_ss_fully_encoded() {
        let body = STANDARD.encode("aes-256-gcm:pw@host.example.com:9000");
        let node = parse_node_uri(&format!("ss://{body}#enc")).unwrap();
        assert_eq!(node.server, "host.example.com");
        assert_eq!(node.port, 9000);
        assert_eq!(node.name, "enc");
    }

    #[test]
    fn test_parse_ss_ipv6_host() {
        let node = parse_node_uri("ss://aes-256-gcm:pw@[2001:db8::1]:8388").unwrap();
        assert_eq!(node.server, "2001:db8::1");
        assert_eq!(node.port, 8388);
    }

    #[test]
    fn test_port_out_of_range() {
        assert!(parse_node_uri("ss://aes-256-gcm:pw@host:0").is_err());
        assert!(parse_node_uri("ss://aes-256-gcm:pw@host:70000").is_err());
    }

    #[test]
    fn test_unsupported_schemes_are_skipped() {
        for uri in [
            "ssr://abcdef",
            "hysteria2://x@y:443",
            "tuic://x@y:443",
            "wireguard://x",
            "https://example.com/sub",
            "# a comment",
        ] {
            assert!(
                matches!(parse_node_uri(uri), Err(ParseError::Unsupported(_))),
                "{uri} should be skipped"
            );
        }
    }

    #[test]
    fn test_parse_node_list_mixed() {
        let body = STANDARD.encode(r#"{"add":"v.example.com","port":"443","id":"uuid"}"#);
        let content = format!(
            "# header\n\
             vmess://{body}\n\
             trojan://pw@t.example.com:443\n\
             ssr://ignored\n\
             not-a-uri\n\
             ss://aes-256-gcm:pw@s.example.com:8388\n"
        );
        let nodes = parse_node_list(&content);
        assert_eq!(nodes.len(), 3);
        assert_eq!(nodes[0].kind(), NodeKind::Vmess);
        assert_eq!(nodes[1].kind(), NodeKind::Trojan);
        assert_eq!(nodes[2].kind(), NodeKind::Shadowsocks);
    }

    #[test]
    fn test_parse_structured_vmess_with_list_wrapped_scalars() {
        let entry = json!({
            "type": ["vmess"],
            "name": "clash-node",
            "server": ["10.0.0.1"],
            "port": "443",
            "uuid": "uuid",
            "alterId": 4,
            "cipher": "auto",
            "network": "ws",
            "tls": true,
            "servername": "sni.example.com",
            "ws-opts": { "path": "/ws", "headers": { "Host": "h.example.com" } }
        });
        let node = parse_structured(&entry).unwrap();
        assert_eq!(node.server, "10.0.0.1");
        assert_eq!(node.port, 443);
        match node.transport {
            Transport::Ws { ref path, ref host } => {
                assert_eq!(path, "/ws");
                assert_eq!(host.as_deref(), Some("h.example.com"));
            }
            _ => panic!("expected ws transport"),
        }
        assert_eq!(node.tls.unwrap().sni.as_deref(), Some("sni.example.com"));
    }

    #[test]
    fn test_parse_structured_vless_reality_opts() {
        let entry = json!({
            "type": "vless",
            "name": "r",
            "server": "r.example.com",
            "port": 443,
            "uuid": "uuid",
            "servername": "sni.example.com",
            "client-fingerprint": "chrome",
            "reality-opts": { "public-key": "pbk", "short-id": "42" }
        });
        let node = parse_structured(&entry).unwrap();
        let tls = node.tls.unwrap();
        let reality = tls.reality.unwrap();
        assert_eq!(reality.public_key, "pbk");
        assert_eq!(reality.short_id, "42");
        assert_eq!(tls.fingerprint.as_deref(), Some("chrome"));
    }

    #[test]
    fn test_parse_structured_rejects_unknown_type() {
        let entry = json!({ "type": "snell", "server": "x", "port": 1 });
        assert!(matches!(
            parse_structured(&entry),
            Err(ParseError::Unsupported(_))
        ));
    }

    #[test]
    fn test_vmess_reencode_is_dedup_equivalent() {
        let body = r#"{"add":"1.2.3.4","port":"443","id":"uuid","net":"ws","tls":"tls"}"#;
        let node = parse_node_uri(&format!("vmess://{}", STANDARD.encode(body))).unwrap();

        let reencoded = json!({
            "add": node.server,
            "port": node.port.to_string(),
            "id": "uuid",
            "net": "ws",
            "tls": "tls",
        });
        let round = parse_node_uri(&format!(
            "vmess://{}",
            STANDARD.encode(reencoded.to_string())
        ))
        .unwrap();
        assert_eq!(round.server, node.server);
        assert_eq!(round.port, node.port);
        assert_eq!(round.kind(), node.kind());
    }
}
