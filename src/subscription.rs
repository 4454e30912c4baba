use std::io::Read;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use flate2::read::{GzDecoder, ZlibDecoder};
use futures::StreamExt;
use rand::Rng;
use thiserror::Error;

use crate::config::NetworkSettings;
use crate::node::Node;
use crate::parser;

const PROXY_PREFIXES: &[&str] = &[
    "ss://",
    "vmess://",
    "vless://",
    "trojan://",
    "hysteria://",
    "tuic://",
];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("retries exhausted for {0}")]
    Exhausted(String),
}

/// Retrieves subscription bodies with retries and exponential backoff.
pub struct Fetcher {
    client: reqwest::Client,
    retries: u32,
}

impl Fetcher {
    pub fn new(settings: &NetworkSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(settings.fetch_timeout_secs))
            .user_agent(settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(1))
            .build()?;
        Ok(Self {
            client,
            retries: settings.fetch_retries.max(1),
        })
    }

    pub async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let mut delay = Duration::from_secs(1);
        for attempt in 1..=self.retries {
            match self.fetch_once(url).await {
                Ok(bytes) => return Ok(bytes),
                Err(e) => {
                    log::debug!(
                        "fetch attempt {attempt}/{} for {url} failed: {e}",
                        self.retries
                    );
                    if attempt < self.retries {
                        let jitter: f64 = rand::rng().random_range(0.5..1.5);
                        tokio::time::sleep(delay.mul_f64(jitter)).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(FetchError::Exhausted(url.to_string()))
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        Ok(response.bytes().await?.to_vec())
    }
}

/// Decodes a subscription body. Plain text, base64, gzip and zlib are all
/// tried; the candidate yielding the most proxy-URI-like lines wins, with
/// plain text winning ties.
pub fn decode_body(raw: &[u8]) -> String {
    let mut candidates: Vec<String> = Vec::new();

    let plain = String::from_utf8_lossy(raw).into_owned();
    candidates.push(plain.clone());

    let compact: String = plain.chars().filter(|c| !c.is_whitespace()).collect();
    let compact = compact.trim_end_matches('=');
    if let Ok(decoded) = STANDARD_NO_PAD
        .decode(compact)
        .or_else(|_| URL_SAFE_NO_PAD.decode(compact))
    {
        candidates.push(String::from_utf8_lossy(&decoded).into_owned());
    }

    let mut gz_out = Vec::new();
    if GzDecoder::new(raw).read_to_end(&mut gz_out).is_ok() {
        candidates.push(String::from_utf8_lossy(&gz_out).into_owned());
    }

    let mut zlib_out = Vec::new();
    if ZlibDecoder::new(raw).read_to_end(&mut zlib_out).is_ok() {
        candidates.push(String::from_utf8_lossy(&zlib_out).into_owned());
    }

    // First candidate wins ties, so plain text beats a spurious decode.
    let mut best_index = 0;
    let mut best_score = 0;
    for (index, candidate) in candidates.iter().enumerate() {
        let score = proxy_line_score(candidate);
        if score > best_score {
            best_index = index;
            best_score = score;
        }
    }
    candidates.swap_remove(best_index)
}

fn proxy_line_score(text: &str) -> usize {
    text.lines()
        .map(str::trim)
        .filter(|line| PROXY_PREFIXES.iter().any(|p| line.starts_with(p)))
        .count()
}

/// A line that points at another subscription rather than a node.
pub fn looks_like_subscription(line: &str) -> bool {
    (line.starts_with("http://") || line.starts_with("https://"))
        && (line.contains("subscribe") || line.contains("sub"))
}

/// Nodes plus any nested subscription URLs found in a decoded body.
pub struct ExtractedBody {
    pub nodes: Vec<Node>,
    pub nested: Vec<String>,
}

/// Turns a decoded subscription body into nodes. A Clash-style YAML mapping
/// with a `proxies` sequence goes through the structured parser; anything
/// else is treated as a link list.
pub fn extract_nodes(text: &str) -> ExtractedBody {
    if let Some(nodes) = try_clash_yaml(text) {
        return ExtractedBody {
            nodes,
            nested: Vec::new(),
        };
    }

    let mut nodes = Vec::new();
    let mut nested = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if looks_like_subscription(line) {
            nested.push(line.to_string());
            continue;
        }
        match parser::parse_node_uri(line) {
            Ok(node) => nodes.push(node),
            Err(parser::ParseError::Unsupported(what)) => {
                log::debug!("skipping line ({what})");
            }
            Err(e) => log::debug!("discarding line: {e}"),
        }
    }
    ExtractedBody { nodes, nested }
}

fn try_clash_yaml(text: &str) -> Option<Vec<Node>> {
    let doc: serde_yml::Value = serde_yml::from_str(text).ok()?;
    let proxies = doc.get("proxies")?.as_sequence()?;
    log::debug!("body parsed as Clash YAML with {} proxies", proxies.len());

    let mut nodes = Vec::new();
    for entry in proxies {
        // Transcode to JSON so the structured parser sees one value shape.
        let Ok(entry) = serde_json::to_value(entry) else {
            continue;
        };
        match parser::parse_structured(&entry) {
            Ok(node) => nodes.push(node),
            Err(e) => log::debug!("skipping clash proxy entry: {e}"),
        }
    }
    Some(nodes)
}

/// Fetches every subscription URL with bounded parallelism and collects
/// parsed nodes. Lines pointing at further subscriptions are followed one
/// level deep. Once `max_nodes` raw nodes have accumulated, outstanding
/// fetches are dropped.
pub async fn collect_nodes(
    fetcher: &Fetcher,
    urls: &[String],
    max_nodes: usize,
    concurrency: usize,
) -> Vec<Node> {
    let mut all_nodes = Vec::new();
    let mut stream = futures::stream::iter(urls.iter().cloned())
        .map(|url| async move {
            let nodes = fetch_and_extract(fetcher, &url, 0).await;
            (url, nodes)
        })
        .buffer_unordered(concurrency.max(1));

    while let Some((url, nodes)) = stream.next().await {
        log::info!("subscription {url} yielded {} node(s)", nodes.len());
        all_nodes.extend(nodes);
        if max_nodes > 0 && all_nodes.len() >= max_nodes {
            log::info!("node cap {max_nodes} reached, cancelling remaining fetches");
            break;
        }
    }
    all_nodes
}

/// Recursion is bounded at one level to keep subscription cycles from
/// looping forever.
async fn fetch_and_extract(fetcher: &Fetcher, url: &str, depth: u8) -> Vec<Node> {
    let raw = match fetcher.fetch(url).await {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!("skipping subscription {url}: {e}");
            return Vec::new();
        }
    };

    let body = decode_body(&raw);
    let ExtractedBody { mut nodes, nested } = extract_nodes(&body);

    if depth == 0 {
        for nested_url in nested {
            log::debug!("following nested subscription {nested_url}");
            nodes.extend(Box::pin(fetch_and_extract(fetcher, &nested_url, 1)).await);
        }
    } else if !nested.is_empty() {
        log::debug!(
            "ignoring {} nested subscription(s) beyond depth 1",
            nested.len()
        );
    }
    nodes
}

/// Reads a subscription list file: one URL per line, `#` comments and blank
/// lines ignored.
pub fn read_subscription_file(path: &std::path::Path) -> anyhow::Result<Vec<String>> {
    use anyhow::Context;
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read subscription file {}", path.display()))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use std::io::Write;

    const LINKS: &str = "ss://aes-256-gcm:pw@a.example.com:8388\ntrojan://pw@b.example.com:443\n";

    #[test]
    fn test_decode_plain_body() {
        let body = decode_body(LINKS.as_bytes());
        assert_eq!(extract_nodes(&body).nodes.len(), 2);
    }

    #[test]
    fn test_decode_base64_body() {
        let encoded = STANDARD.encode(LINKS);
        let body = decode_body(encoded.as_bytes());
        assert_eq!(extract_nodes(&body).nodes.len(), 2);
    }

    #[test]
    fn test_decode_base64_with_whitespace_and_no_padding() {
        let encoded = STANDARD.encode(LINKS);
        let mangled = format!("  {}  \n", encoded.trim_end_matches('='));
        let body = decode_body(mangled.as_bytes());
        assert_eq!(extract_nodes(&body).nodes.len(), 2);
    }

    #[test]
    fn test_decode_gzip_body() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(LINKS.as_bytes()).unwrap();
        let body = decode_body(&encoder.finish().unwrap());
        assert_eq!(extract_nodes(&body).nodes.len(), 2);
    }

    #[test]
    fn test_decode_zlib_body() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(LINKS.as_bytes()).unwrap();
        let body = decode_body(&encoder.finish().unwrap());
        assert_eq!(extract_nodes(&body).nodes.len(), 2);
    }

    #[test]
    fn test_extract_clash_yaml_proxies() {
        let yaml = r#"
proxies:
  - { name: "n1", type: ss, server: s1.example.com, port: 8388, cipher: aes-256-gcm, password: pw }
  - { name: "n2", type: trojan, server: s2.example.com, port: 443, password: pw, sni: sni.example.com }
  - { name: "bad", type: snell, server: s3.example.com, port: 1 }
"#;
        let extracted = extract_nodes(yaml);
        assert_eq!(extracted.nodes.len(), 2);
        assert_eq!(extracted.nodes[0].name, "n1");
        assert!(extracted.nested.is_empty());
    }

    #[test]
    fn test_extract_separates_nested_subscription_urls() {
        let body = "ss://aes-256-gcm:pw@a.example.com:8388\n\
                    https://example.com/api/v1/subscribe?token=x\n\
                    vmess://broken\n";
        let extracted = extract_nodes(body);
        assert_eq!(extracted.nodes.len(), 1);
        assert_eq!(extracted.nested.len(), 1);
        assert!(extracted.nested[0].contains("subscribe"));
    }

    #[test]
    fn test_looks_like_subscription() {
        assert!(looks_like_subscription("https://x.example.com/subscribe"));
        assert!(looks_like_subscription("http://x.example.com/sub?token=1"));
        assert!(!looks_like_subscription("https://x.example.com/nodes"));
        assert!(!looks_like_subscription("vmess://abcd"));
    }

    #[test]
    fn test_plain_wins_score_tie() {
        // Gibberish with no proxy lines anywhere must come back verbatim.
        let body = decode_body(b"hello world\n");
        assert_eq!(body, "hello world\n");
    }

    #[test]
    fn test_read_subscription_file_filters_comments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("subs.txt");
        std::fs::write(&path, "# comment\nhttps://a.example.com/s\n\nhttps://b.example.com/s\n")
            .unwrap();
        let urls = read_subscription_file(&path).unwrap();
        assert_eq!(urls.len(), 2);
    }
}
