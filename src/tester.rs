use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::{Instant, sleep, timeout};

use crate::config::{Anchor, Settings};
use crate::engine;
use crate::ipinfo::IpChecker;
use crate::limiter::{GlobalStats, TokenBucket, create_rate_limiter};
use crate::node::{Node, NodeKind};
use crate::probe::DirectProber;
use crate::process::EngineInstance;
use crate::resources::ResourceManager;
use crate::socks;

/// Warm-up prefix discarded before the measured window opens, to keep
/// slow-start and connect artefacts out of the number.
const WARM_UP_BYTES: u64 = 256 * 1024;
/// Floor for the quick pre-test pass; anything slower is considered broken.
const PRE_TEST_FLOOR_MBPS: f64 = 0.01;
const PRE_TEST_DURATION: Duration = Duration::from_secs(5);
/// Stable CONNECT anchor for the SOCKS5 latency stage.
const SOCKS_PROBE_TARGET: (&str, u16) = ("8.8.8.8", 53);
/// Post-release pause letting the OS finish TIME_WAIT on the inbound port.
const PORT_RELEASE_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LatencySource {
    Direct,
    Socks5,
    Http,
}

/// Outcome of one node's test run.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub name: String,
    pub server: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    pub status: TestStatus,
    pub error: Option<String>,
    pub latency_ms: Option<f64>,
    pub latency_source: Option<LatencySource>,
    pub speed_mbps: Option<f64>,
    pub ip_purity: Option<String>,
}

impl TestResult {
    fn failed(node: &Node, error: impl Into<String>) -> Self {
        Self {
            name: node.name.clone(),
            server: node.server.clone(),
            port: node.port,
            kind: node.kind(),
            status: TestStatus::Failed,
            error: Some(error.into()),
            latency_ms: None,
            latency_source: None,
            speed_mbps: None,
            ip_purity: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TestStatus::Success
    }
}

/// Shared state of one pipeline run: settings, counters, the global rate
/// limiter and the resource book-keeping. Explicitly constructed so tests
/// can instantiate the pipeline with fresh state.
pub struct TestContext {
    pub settings: Settings,
    pub stats: GlobalStats,
    pub limiter: Option<Arc<TokenBucket>>,
    pub resources: Arc<ResourceManager>,
    pub engine_binary: PathBuf,
}

impl TestContext {
    pub fn new(settings: Settings, resources: Arc<ResourceManager>) -> anyhow::Result<Self> {
        let engine_binary = engine::locate_binary(
            settings.engine.binary.as_deref().map(std::path::Path::new),
        )?;
        log::info!("using engine binary {}", engine_binary.display());
        let limiter = create_rate_limiter(settings.speed_test.total_speed_limit);
        Ok(Self {
            settings,
            stats: GlobalStats::new(),
            limiter,
            resources,
            engine_binary,
        })
    }
}

/// Drives one node through the full test pipeline: engine bring-up,
/// reachability, latency, egress-IP classification, bandwidth.
pub struct NodeTester {
    ctx: Arc<TestContext>,
    prober: DirectProber,
    ip_checker: IpChecker,
}

impl NodeTester {
    pub fn new(ctx: Arc<TestContext>) -> Self {
        let prober = DirectProber::new(ctx.settings.test.timeout());
        let ip_checker = IpChecker::new(&ctx.settings.ip_check);
        Self {
            ctx,
            prober,
            ip_checker,
        }
    }

    pub async fn test_node(&self, node: &Node, index: usize) -> TestResult {
        log::info!("testing [{:>3}] {}", index + 1, node.name);

        if self.ctx.resources.stop_requested() {
            return TestResult::failed(node, "cancelled");
        }

        let port = match self.ctx.resources.ports.allocate(&node.name).await {
            Ok(port) => port,
            Err(e) => {
                log::warn!("  x {} - {e}", node.name);
                return TestResult::failed(node, e.to_string());
            }
        };

        let result = self.run_with_engine(node, port).await;

        self.ctx.resources.ports.release(port).await;
        sleep(PORT_RELEASE_PAUSE).await;

        match &result.status {
            TestStatus::Success => log::info!(
                "  + {} - latency {:.0}ms | speed {}",
                node.name,
                result.latency_ms.unwrap_or_default(),
                result
                    .speed_mbps
                    .map(|s| format!("{s:.2}Mbps"))
                    .unwrap_or_else(|| "n/a".to_string()),
            ),
            TestStatus::Failed => log::warn!(
                "  x {} - {}",
                node.name,
                result.error.as_deref().unwrap_or("failed")
            ),
        }
        result
    }

    /// Engine lifetime is scoped to this call; teardown runs on every path.
    async fn run_with_engine(&self, node: &Node, port: u16) -> TestResult {
        let engine = match EngineInstance::start(
            node,
            port,
            &self.ctx.engine_binary,
            self.ctx.settings.engine.startup_timeout(),
            self.ctx.resources.registry.clone(),
        )
        .await
        {
            Ok(engine) => engine,
            Err(e) => return TestResult::failed(node, e.to_string()),
        };

        let result = self.run_stages(node, port).await;
        engine.terminate().await;
        result
    }

    async fn run_stages(&self, node: &Node, port: u16) -> TestResult {
        // Stage A: reachability and latency.
        let Some((latency, source)) = self.stage_latency(node, port).await else {
            return TestResult::failed(node, "All connectivity tests failed");
        };
        log::debug!("{}: latency {latency:.0}ms via {source:?}", node.name);

        if self.ctx.resources.stop_requested() {
            return TestResult::failed(node, "cancelled");
        }

        // Stage B: egress IP classification. Failures never fail the node.
        let ip_purity = self.ip_checker.check(port).await;
        if let Some(purity) = &ip_purity {
            log::info!("  - {} egress IP type: {purity}", node.name);
        }

        if self.ctx.resources.stop_requested() {
            return TestResult::failed(node, "cancelled");
        }

        // Stage C: bandwidth.
        let speed_mbps = self.stage_bandwidth(port).await;

        TestResult {
            name: node.name.clone(),
            server: node.server.clone(),
            port: node.port,
            kind: node.kind(),
            status: TestStatus::Success,
            error: None,
            latency_ms: Some(latency),
            latency_source: Some(source),
            speed_mbps,
            ip_purity,
        }
    }

    /// Runs the connectivity ladder in order until one method succeeds:
    /// direct protocol probe, SOCKS5 CONNECT through the engine, HTTP GET
    /// through the engine.
    async fn stage_latency(&self, node: &Node, port: u16) -> Option<(f64, LatencySource)> {
        if let Some(latency) = self.prober.probe(node).await {
            return Some((latency, LatencySource::Direct));
        }

        let (target_host, target_port) = SOCKS_PROBE_TARGET;
        match socks::connect_probe(
            port,
            target_host,
            target_port,
            self.ctx.settings.test.timeout(),
        )
        .await
        {
            Ok(latency) => return Some((latency, LatencySource::Socks5)),
            Err(e) => log::debug!("{}: socks5 probe failed: {e}", node.name),
        }

        self.http_latency(port)
            .await
            .map(|latency| (latency, LatencySource::Http))
    }

    /// HTTP fallback for censored regions: any status below 500 proves the
    /// tunnel relays bytes, even when the endpoint rejects the request.
    async fn http_latency(&self, port: u16) -> Option<f64> {
        let test = &self.ctx.settings.test;
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{port}")).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(test.timeout())
            .danger_accept_invalid_certs(true)
            .build()
            .ok()?;

        let mut best: Option<f64> = None;
        for url in &test.latency_urls {
            let start = Instant::now();
            match client.get(url).send().await {
                Ok(response) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    let status = response.status().as_u16();
                    let accepted = if test.accept_any_status_below_500 {
                        status < 500
                    } else {
                        response.status().is_success()
                    };
                    if accepted {
                        log::debug!("http probe {url}: {status} in {elapsed:.0}ms");
                        best = Some(best.map_or(elapsed, |b: f64| b.min(elapsed)));
                    } else {
                        log::debug!("http probe {url}: server error {status}");
                    }
                }
                Err(e) => log::debug!("http probe {url} failed: {e}"),
            }
        }
        best
    }

    /// Bandwidth stage: gated on a local SOCKS5 handshake, engine-native
    /// measurement first, plain HTTP download as fallback.
    async fn stage_bandwidth(&self, port: u16) -> Option<f64> {
        let speed = &self.ctx.settings.speed_test;
        if !speed.enabled {
            return None;
        }

        if let Err(e) = socks::handshake_probe(port, Duration::from_secs(5)).await {
            log::debug!("skipping bandwidth stage, SOCKS5 listener unusable: {e}");
            return None;
        }

        if speed.pre_test {
            match self
                .measure_download(port, &speed.pre_test_anchor, PRE_TEST_DURATION, false)
                .await
            {
                Some(mbps) if mbps >= PRE_TEST_FLOOR_MBPS => {
                    log::debug!("pre-test passed at {mbps:.4}Mbps");
                }
                other => {
                    log::debug!("pre-test failed ({other:?}), skipping main measurement");
                    return None;
                }
            }
        }

        let repeats = speed.repeats.max(1);
        for anchor in &speed.anchors {
            if self.ctx.resources.stop_requested() {
                return None;
            }
            let mut runs = Vec::new();
            for attempt in 1..=repeats {
                match self
                    .measure_download(port, anchor, speed.download_timeout(), true)
                    .await
                {
                    Some(mbps) => {
                        log::debug!("{}: run {attempt}/{repeats} at {mbps:.4}Mbps", anchor.host);
                        runs.push(mbps);
                    }
                    None => log::debug!("{}: run {attempt}/{repeats} failed", anchor.host),
                }
            }
            if !runs.is_empty() {
                let avg = runs.iter().sum::<f64>() / runs.len() as f64;
                return Some(round4(avg));
            }
        }

        log::debug!("engine-native measurement failed on all anchors, trying HTTP fallback");
        self.http_bandwidth(port).await
    }

    /// Engine-native measurement: raw CONNECT tunnel, minimal HTTP/1.1 GET,
    /// discarded headers, optional warm-up prefix, then a read loop bounded
    /// by the duration, the byte cap, and EOF. Every chunk passes the
    /// global token bucket; the clock keeps running during limiter stalls
    /// so a configured cap shows up in the measured number.
    async fn measure_download(
        &self,
        port: u16,
        anchor: &Anchor,
        duration: Duration,
        full: bool,
    ) -> Option<f64> {
        let speed = &self.ctx.settings.speed_test;
        let mut stream =
            match socks::connect(port, &anchor.host, anchor.port, Duration::from_secs(15)).await {
                Ok(stream) => stream,
                Err(e) => {
                    log::debug!("{}: tunnel failed: {e}", anchor.host);
                    return None;
                }
            };

        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: Mozilla/5.0\r\nAccept: */*\r\nConnection: close\r\n\r\n",
            anchor.path, anchor.host
        );
        stream.write_all(request.as_bytes()).await.ok()?;

        // Read and discard the response headers.
        let mut header = Vec::new();
        let mut chunk = [0u8; 8192];
        let body_overhang = loop {
            let n = timeout(Duration::from_secs(10), stream.read(&mut chunk))
                .await
                .ok()?
                .ok()?;
            if n == 0 {
                return None;
            }
            header.extend_from_slice(&chunk[..n]);
            if let Some(end) = header_end(&header) {
                break (header.len() - end) as u64;
            }
            if header.len() > 64 * 1024 {
                log::debug!("{}: response headers never ended", anchor.host);
                return None;
            }
        };

        let mut discarded = body_overhang;
        if full {
            while discarded < WARM_UP_BYTES {
                match timeout(Duration::from_secs(10), stream.read(&mut chunk)).await {
                    Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                    Ok(Ok(n)) => discarded += n as u64,
                }
            }
            log::debug!("{}: warm-up done ({:.1}KiB)", anchor.host, discarded as f64 / 1024.0);
        }

        // Measured window.
        let byte_cap = speed.download_limit_bytes();
        let start = Instant::now();
        let mut bytes: u64 = 0;
        loop {
            let elapsed = start.elapsed();
            if elapsed >= duration || bytes >= byte_cap || self.ctx.resources.stop_requested() {
                break;
            }
            let read_limit = (duration - elapsed).max(Duration::from_secs(1));
            match timeout(read_limit, stream.read(&mut chunk)).await {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => {
                    if let Some(limiter) = &self.ctx.limiter {
                        limiter.throttle(n).await;
                    }
                    bytes += n as u64;
                    self.ctx.stats.add_bytes(n as u64);
                }
                Ok(Err(_)) | Err(_) => break,
            }
        }

        let elapsed = start.elapsed().as_secs_f64();
        if elapsed < 0.5 || bytes == 0 {
            log::debug!("{}: download too short ({bytes} bytes in {elapsed:.2}s)", anchor.host);
            return None;
        }

        let kbps = speed_kbps(bytes, elapsed);
        if full && kbps < speed.min_speed_kbps {
            log::debug!(
                "{}: below speed floor ({kbps:.1}KiB/s < {}KiB/s)",
                anchor.host,
                speed.min_speed_kbps
            );
            return None;
        }
        Some(round4(speed_mbps(bytes, elapsed)))
    }

    /// Fallback measurement over a plain HTTP client when the raw tunnel
    /// path keeps failing.
    async fn http_bandwidth(&self, port: u16) -> Option<f64> {
        use futures::StreamExt;

        let speed = &self.ctx.settings.speed_test;
        let proxy = reqwest::Proxy::all(format!("socks5://127.0.0.1:{port}")).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .connect_timeout(Duration::from_secs(10))
            .timeout(speed.download_timeout() + Duration::from_secs(20))
            .danger_accept_invalid_certs(true)
            .build()
            .ok()?;

        for anchor in &speed.anchors {
            let scheme = if anchor.port == 443 { "https" } else { "http" };
            let url = format!("{scheme}://{}{}", anchor.host, anchor.path);
            let Ok(response) = client.get(&url).send().await else {
                continue;
            };
            if !response.status().is_success() {
                continue;
            }

            let duration = speed.download_timeout();
            let byte_cap = speed.download_limit_bytes();
            let start = Instant::now();
            let mut bytes: u64 = 0;
            let mut body = response.bytes_stream();
            while let Some(Ok(data)) = body.next().await {
                if let Some(limiter) = &self.ctx.limiter {
                    limiter.throttle(data.len()).await;
                }
                bytes += data.len() as u64;
                self.ctx.stats.add_bytes(data.len() as u64);
                if start.elapsed() >= duration
                    || bytes >= byte_cap
                    || self.ctx.resources.stop_requested()
                {
                    break;
                }
            }

            let elapsed = start.elapsed().as_secs_f64();
            if elapsed < 0.5 || bytes == 0 {
                continue;
            }
            if speed_kbps(bytes, elapsed) < speed.min_speed_kbps {
                continue;
            }
            return Some(round4(speed_mbps(bytes, elapsed)));
        }
        None
    }
}

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn speed_kbps(bytes: u64, elapsed_secs: f64) -> f64 {
    bytes as f64 / 1024.0 / elapsed_secs
}

fn speed_mbps(bytes: u64, elapsed_secs: f64) -> f64 {
    bytes as f64 * 8.0 / elapsed_secs / 1_000_000.0
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}
