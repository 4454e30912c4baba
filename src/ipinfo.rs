use std::time::Duration;

use serde_json::Value;

use crate::config::IpCheckSettings;

const ECHO_URLS: &[&str] = &[
    "https://api.ipify.org?format=json",
    "http://ip-api.com/json/?fields=query",
];

/// Classifies the egress IP a node exposes (Hosting, Residential, ...).
/// Disabled unless an API token is configured; failures never fail the
/// node's result.
pub struct IpChecker {
    enabled: bool,
    token: String,
    timeout: Duration,
}

impl IpChecker {
    pub fn new(settings: &IpCheckSettings) -> Self {
        Self {
            enabled: settings.enabled && !settings.api_token.is_empty(),
            token: settings.api_token.clone(),
            timeout: Duration::from_secs(15),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn check(&self, proxy_port: u16) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let exit_ip = self.exit_ip(proxy_port).await?;
        log::debug!("egress IP via port {proxy_port}: {exit_ip}");

        let info = self.query_ip_info(&exit_ip).await?;
        let purity = purity_from_info(&info);
        log::debug!("egress IP {exit_ip} classified as {purity}");
        Some(purity)
    }

    /// Asks an IP-echo service through the engine what address it sees.
    async fn exit_ip(&self, proxy_port: u16) -> Option<String> {
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{proxy_port}")).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .build()
            .ok()?;

        for url in ECHO_URLS {
            match client.get(*url).send().await {
                Ok(response) if response.status().is_success() => {
                    if let Ok(body) = response.json::<Value>().await {
                        let ip = body["ip"].as_str().or_else(|| body["query"].as_str());
                        if let Some(ip) = ip {
                            return Some(ip.to_string());
                        }
                    }
                }
                Ok(response) => {
                    log::debug!("IP echo {url} returned {}", response.status());
                }
                Err(e) => {
                    log::debug!("IP echo {url} failed: {e}");
                }
            }
        }
        None
    }

    /// The classification query goes out directly, not through the engine.
    async fn query_ip_info(&self, ip: &str) -> Option<Value> {
        let url = format!("https://api.findip.net/{ip}/?token={}", self.token);
        let client = reqwest::Client::builder().timeout(self.timeout).build().ok()?;
        match client.get(&url).send().await {
            Ok(response) if response.status().is_success() => response.json().await.ok(),
            Ok(response) => {
                log::warn!("IP info API returned {}", response.status());
                None
            }
            Err(e) => {
                log::warn!("IP info query failed: {e}");
                None
            }
        }
    }
}

fn purity_from_info(info: &Value) -> String {
    let traits = &info["traits"];
    traits["user_type"]
        .as_str()
        .or_else(|| traits["connection_type"].as_str())
        .unwrap_or("Unknown")
        .to_string()
}
