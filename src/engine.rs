use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use thiserror::Error;

use crate::node::{Credentials, Node, Transport};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("sing-box binary not found (searched {0} locations)")]
    BinaryNotFound(usize),
    #[error("failed to write engine config: {0}")]
    ConfigWrite(#[from] std::io::Error),
    #[error("failed to serialize engine config: {0}")]
    ConfigSerialize(#[from] serde_json::Error),
    #[error("failed to spawn sing-box: {0}")]
    Spawn(std::io::Error),
    #[error("sing-box did not become ready: {0}")]
    Startup(String),
}

/// Builds the full sing-box configuration for one test attempt: a single
/// SOCKS5 inbound on the allocated loopback port and one outbound
/// synthesized from the node.
pub fn build_config(node: &Node, socks_port: u16) -> Value {
    json!({
        "log": { "level": "error" },
        "inbounds": [{
            "type": "socks",
            "listen": "127.0.0.1",
            "listen_port": socks_port,
            "sniff": true
        }],
        "outbounds": [build_outbound(node)]
    })
}

fn build_outbound(node: &Node) -> Value {
    let mut outbound = json!({
        "type": node.kind().as_str(),
        "tag": "proxy",
        "server": node.server,
        "server_port": node.port,
    });

    match &node.credentials {
        Credentials::Shadowsocks { method, password } => {
            outbound["method"] = json!(method);
            outbound["password"] = json!(password);
        }
        Credentials::Vmess {
            uuid,
            alter_id,
            security,
        } => {
            outbound["uuid"] = json!(uuid);
            outbound["alter_id"] = json!(alter_id);
            outbound["security"] = json!(security);
        }
        Credentials::Vless { uuid, flow } => {
            outbound["uuid"] = json!(uuid);
            if let Some(flow) = flow.as_deref().filter(|f| !f.is_empty()) {
                outbound["flow"] = json!(flow);
            }
        }
        Credentials::Trojan { password } => {
            outbound["password"] = json!(password);
        }
    }

    if let Some(transport) = build_transport(&node.transport) {
        outbound["transport"] = transport;
    }
    if let Some(tls) = build_tls(node) {
        outbound["tls"] = tls;
    }

    outbound
}

fn build_transport(transport: &Transport) -> Option<Value> {
    match transport {
        Transport::Tcp => None,
        Transport::Ws { path, host } => {
            let mut t = json!({ "type": "ws", "path": path });
            if let Some(host) = host {
                t["headers"] = json!({ "Host": host });
            }
            Some(t)
        }
        Transport::Grpc { service_name } => {
            Some(json!({ "type": "grpc", "service_name": service_name }))
        }
        Transport::H2 { path, host } => {
            let mut t = json!({ "type": "http", "path": path });
            if let Some(host) = host {
                t["host"] = json!([host]);
            }
            Some(t)
        }
    }
}

fn build_tls(node: &Node) -> Option<Value> {
    let opts = node.tls.as_ref()?;
    let server_name = opts.sni.clone().unwrap_or_else(|| node.server.clone());

    let mut tls = json!({
        "enabled": true,
        "server_name": server_name,
        "insecure": true,
    });
    if !opts.alpn.is_empty() {
        tls["alpn"] = json!(opts.alpn);
    }
    if let Some(reality) = &opts.reality {
        // REALITY validates the peer itself.
        tls["insecure"] = json!(false);
        tls["reality"] = json!({
            "enabled": true,
            "public_key": reality.public_key,
            "short_id": reality.short_id,
        });
    }
    if let Some(fp) = &opts.fingerprint {
        tls["utls"] = json!({ "enabled": true, "fingerprint": fp });
    }
    Some(tls)
}

/// Locates the sing-box binary: an explicit override first, then the usual
/// install spots, finally a PATH lookup.
pub fn locate_binary(explicit: Option<&Path>) -> Result<PathBuf, EngineError> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(path) = explicit {
        candidates.push(path.to_path_buf());
    }
    if let Ok(env_path) = std::env::var("SUBPROBE_ENGINE") {
        candidates.push(PathBuf::from(env_path));
    }
    candidates.push(PathBuf::from(binary_name()));
    candidates.push(PathBuf::from("bin").join(binary_name()));
    #[cfg(unix)]
    {
        candidates.push(PathBuf::from("/usr/local/bin/sing-box"));
        candidates.push(PathBuf::from("/usr/bin/sing-box"));
        if let Ok(home) = std::env::var("HOME") {
            candidates.push(PathBuf::from(home).join(".local/bin/sing-box"));
        }
    }

    let searched = candidates.len() + 1;
    for candidate in candidates {
        if candidate.is_file() {
            ensure_executable(&candidate);
            return Ok(candidate);
        }
    }

    // Fall back to whatever PATH resolves.
    if let Some(found) = find_in_path(binary_name()) {
        return Ok(found);
    }

    Err(EngineError::BinaryNotFound(searched))
}

fn binary_name() -> &'static str {
    if cfg!(windows) { "sing-box.exe" } else { "sing-box" }
}

fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

#[cfg(unix)]
fn ensure_executable(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(meta) = std::fs::metadata(path) {
        let mut perms = meta.permissions();
        if perms.mode() & 0o111 == 0 {
            perms.set_mode(perms.mode() | 0o755);
            if let Err(e) = std::fs::set_permissions(path, perms) {
                log::warn!("could not mark {} executable: {e}", path.display());
            }
        }
    }
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) {}
