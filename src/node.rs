use std::collections::HashSet;
use std::fmt;

use serde::Serialize;

/// Protocol family of a node. Unsupported families (ssr, hysteria, tuic,
/// wireguard) are rejected at parse time and never reach this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Shadowsocks,
    Vmess,
    Vless,
    Trojan,
}

impl NodeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeKind::Shadowsocks => "shadowsocks",
            NodeKind::Vmess => "vmess",
            NodeKind::Vless => "vless",
            NodeKind::Trojan => "trojan",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-family credential set.
#[derive(Debug, Clone, PartialEq)]
pub enum Credentials {
    Shadowsocks {
        method: String,
        password: String,
    },
    Vmess {
        uuid: String,
        alter_id: u32,
        security: String,
    },
    Vless {
        uuid: String,
        flow: Option<String>,
    },
    Trojan {
        password: String,
    },
}

impl Credentials {
    pub fn kind(&self) -> NodeKind {
        match self {
            Credentials::Shadowsocks { .. } => NodeKind::Shadowsocks,
            Credentials::Vmess { .. } => NodeKind::Vmess,
            Credentials::Vless { .. } => NodeKind::Vless,
            Credentials::Trojan { .. } => NodeKind::Trojan,
        }
    }
}

/// Stream transport carried under the protocol layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Transport {
    #[default]
    Tcp,
    Ws {
        path: String,
        host: Option<String>,
    },
    Grpc {
        service_name: String,
    },
    H2 {
        path: String,
        host: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealityOptions {
    pub public_key: String,
    pub short_id: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TlsOptions {
    pub sni: Option<String>,
    pub alpn: Vec<String>,
    pub fingerprint: Option<String>,
    pub reality: Option<RealityOptions>,
}

/// One proxy-server description, immutable after parsing.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub server: String,
    pub port: u16,
    pub credentials: Credentials,
    pub transport: Transport,
    pub tls: Option<TlsOptions>,
    /// Canonical source string, preserved for report export.
    pub origin_uri: String,
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        self.credentials.kind()
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }

    fn dedup_key(&self) -> (String, u16, NodeKind) {
        (self.server.clone(), self.port, self.kind())
    }
}

/// Order-preserving filter keeping the first occurrence of each
/// `(server, port, kind)` triple.
pub fn dedupe(nodes: Vec<Node>) -> Vec<Node> {
    let mut seen = HashSet::new();
    nodes
        .into_iter()
        .filter(|node| seen.insert(node.dedup_key()))
        .collect()
}
