use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

/// Application settings, loaded from a YAML file. Every section has
/// workable defaults so a missing file still yields a runnable config.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Settings {
    pub network: NetworkSettings,
    pub test: TestSettings,
    pub speed_test: SpeedTestSettings,
    pub ip_check: IpCheckSettings,
    pub output: OutputSettings,
    pub scheduler: SchedulerSettings,
    pub engine: EngineSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub user_agent: String,
    pub fetch_retries: u32,
    pub fetch_concurrency: usize,
    pub fetch_timeout_secs: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            user_agent: concat!("subprobe/", env!("CARGO_PKG_VERSION")).to_string(),
            fetch_retries: 3,
            fetch_concurrency: 4,
            fetch_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TestSettings {
    /// Worker count of the testing pool.
    pub concurrency: usize,
    /// Cap on how many deduplicated nodes enter the pool.
    pub max_nodes: usize,
    /// Stop after this many successful nodes; 0 means unlimited.
    pub success_limit: usize,
    pub timeout_secs: u64,
    pub latency_urls: Vec<String>,
    /// Count 4xx replies from censored endpoints as connectivity.
    pub accept_any_status_below_500: bool,
    pub base_port: u16,
    pub recycle_delay_secs: u64,
}

impl Default for TestSettings {
    fn default() -> Self {
        Self {
            concurrency: 20,
            max_nodes: 200,
            success_limit: 0,
            timeout_secs: 15,
            latency_urls: vec![
                "http://www.gstatic.com/generate_204".to_string(),
                "http://cp.cloudflare.com/".to_string(),
            ],
            accept_any_status_below_500: true,
            base_port: 41000,
            recycle_delay_secs: 8,
        }
    }
}

impl TestSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn recycle_delay(&self) -> Duration {
        Duration::from_secs(self.recycle_delay_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SpeedTestSettings {
    pub enabled: bool,
    pub download_timeout_secs: u64,
    pub download_mb: u64,
    /// Canonical speed floor; slower measurements are discarded.
    pub min_speed_kbps: f64,
    /// Global egress cap in MB/s shared by all workers; 0 disables it.
    pub total_speed_limit: f64,
    /// Short small-file pass to weed out clearly broken nodes before the
    /// full-length measurement.
    pub pre_test: bool,
    pub repeats: u32,
    pub anchors: Vec<Anchor>,
    pub pre_test_anchor: Anchor,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Anchor {
    pub host: String,
    pub port: u16,
    pub path: String,
}

impl Anchor {
    pub fn new(host: &str, port: u16, path: &str) -> Self {
        Self {
            host: host.to_string(),
            port,
            path: path.to_string(),
        }
    }
}

impl Default for SpeedTestSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            download_timeout_secs: 10,
            download_mb: 20,
            min_speed_kbps: 512.0,
            total_speed_limit: 0.0,
            pre_test: true,
            repeats: 1,
            anchors: vec![
                Anchor::new(
                    "releases.ubuntu.com",
                    80,
                    "/20.04/ubuntu-20.04.6-live-server-amd64.iso",
                ),
                Anchor::new(
                    "download.mozilla.org",
                    80,
                    "/pub/firefox/releases/latest/win64/en-US/Firefox%20Setup.exe",
                ),
                Anchor::new("speed.cloudflare.com", 80, "/__down?bytes=100000000"),
            ],
            pre_test_anchor: Anchor::new("speed.cloudflare.com", 80, "/__down?bytes=5000000"),
        }
    }
}

impl SpeedTestSettings {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }

    pub fn download_limit_bytes(&self) -> u64 {
        self.download_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct IpCheckSettings {
    pub enabled: bool,
    pub api_token: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub results_dir: String,
    pub show_top_nodes: usize,
    pub save_all_results: bool,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            results_dir: "results".to_string(),
            show_top_nodes: 10,
            save_all_results: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub enabled: bool,
    /// Local wall-clock HH:MM of the daily run.
    pub time: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            time: "20:00".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    pub binary: Option<String>,
    pub startup_timeout_secs: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            binary: None,
            startup_timeout_secs: 3,
        }
    }
}

impl EngineSettings {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

/// Loads settings from `path`. A missing file yields the defaults; a file
/// that exists but does not parse is an error.
pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        log::info!("no config file at {}, using defaults", path.display());
        return Ok(Settings::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = expand_env(&raw);
    let settings: Settings = serde_yml::from_str(&expanded)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    log::info!("loaded config from {}", path.display());
    Ok(settings)
}

/// Replaces `${VAR}` placeholders with environment values. Unset variables
/// are left verbatim so the error surfaces where the value is used.
fn expand_env(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                match std::env::var(name) {
                    Ok(value) => out.push_str(&value),
                    Err(_) => {
                        log::warn!("config references unset variable ${{{name}}}");
                        out.push_str(&rest[start..start + 2 + end + 1]);
                    }
                }
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_sane() {
        let settings = Settings::default();
        assert_eq!(settings.test.concurrency, 20);
        assert_eq!(settings.test.base_port, 41000);
        assert_eq!(settings.test.recycle_delay_secs, 8);
        assert_eq!(settings.speed_test.download_mb, 20);
        assert_eq!(settings.speed_test.min_speed_kbps, 512.0);
        assert!(!settings.ip_check.enabled);
        assert!(!settings.scheduler.enabled);
    }

    #[test]
    fn test_partial_yaml_overrides_defaults() {
        let yaml = "test:\n  concurrency: 4\n  success_limit: 2\nspeed_test:\n  enabled: false\n";
        let settings: Settings = serde_yml::from_str(yaml).unwrap();
        assert_eq!(settings.test.concurrency, 4);
        assert_eq!(settings.test.success_limit, 2);
        assert!(!settings.speed_test.enabled);
        // Untouched sections keep their defaults.
        assert_eq!(settings.output.results_dir, "results");
    }

    #[test]
    fn test_expand_env_substitutes_known_vars() {
        unsafe { std::env::set_var("SUBPROBE_TEST_TOKEN", "tok-123") };
        let expanded = expand_env("api_token: \"${SUBPROBE_TEST_TOKEN}\"");
        assert_eq!(expanded, "api_token: \"tok-123\"");
    }

    #[test]
    fn test_expand_env_leaves_unknown_vars() {
        let expanded = expand_env("value: ${SUBPROBE_DEFINITELY_UNSET_VAR}");
        assert_eq!(expanded, "value: ${SUBPROBE_DEFINITELY_UNSET_VAR}");
    }

    #[test]
    fn test_load_settings_missing_file_defaults() {
        let settings = load_settings(Path::new("/nonexistent/subprobe.yaml")).unwrap();
        assert_eq!(settings.test.max_nodes, 200);
    }

    #[test]
    fn test_load_settings_reads_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "output:\n  show_top_nodes: 3\n").unwrap();
        let settings = load_settings(&path).unwrap();
        assert_eq!(settings.output.show_top_nodes, 3);
    }
}
