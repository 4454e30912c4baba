use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use crate::engine::{self, EngineError};
use crate::node::Node;

const READINESS_POLL: Duration = Duration::from_millis(100);
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(3);
const STDERR_EXCERPT_LIMIT: usize = 500;

#[cfg(windows)]
const PORT_SETTLE_DELAY: Duration = Duration::from_secs(3);
#[cfg(not(windows))]
const PORT_SETTLE_DELAY: Duration = Duration::from_secs(1);

/// Registry of live engine pids. The signal-driven cleanup path walks this
/// to reap engines whose owning worker never got to run its exit path.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<u32, RegistryEntry>>>,
}

#[derive(Debug, Clone)]
struct RegistryEntry {
    tag: String,
    config_path: PathBuf,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, pid: u32, tag: &str, config_path: &Path) {
        self.inner.lock().unwrap().insert(
            pid,
            RegistryEntry {
                tag: tag.to_string(),
                config_path: config_path.to_path_buf(),
            },
        );
    }

    fn deregister(&self, pid: u32) {
        self.inner.lock().unwrap().remove(&pid);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Force-kills every registered engine and removes its temp config.
    /// Cleanup failures are logged, never propagated.
    pub async fn reap_all(&self) {
        let drained: Vec<(u32, RegistryEntry)> =
            self.inner.lock().unwrap().drain().collect();
        if drained.is_empty() {
            return;
        }

        log::info!("reaping {} leftover engine process(es)", drained.len());
        for (pid, entry) in &drained {
            log::debug!("terminating engine pid {pid} ({})", entry.tag);
            send_signal(*pid, false);
        }
        sleep(Duration::from_millis(500)).await;
        for (pid, entry) in &drained {
            send_signal(*pid, true);
            if let Err(e) = std::fs::remove_file(&entry.config_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::debug!("could not remove {}: {e}", entry.config_path.display());
                }
            }
        }
    }
}

#[cfg(unix)]
fn send_signal(pid: u32, force: bool) {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    let _ = kill(Pid::from_raw(pid as i32), signal);
}

#[cfg(not(unix))]
fn send_signal(_pid: u32, _force: bool) {
    // Children are spawned with kill_on_drop; dropping the handles on the
    // cancellation path takes them down.
}

/// Deletes the temp config file when the owning instance goes away, on
/// every path including panics and cancellation.
struct ConfigFile {
    path: PathBuf,
}

impl ConfigFile {
    fn write(node: &Node, port: u16) -> Result<Self, EngineError> {
        let dir = std::env::temp_dir().join("subprobe_configs");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("config_{port}.json"));
        let config = engine::build_config(node, port);
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(Self { path })
    }
}

impl Drop for ConfigFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                log::debug!("could not remove {}: {e}", self.path.display());
            }
        }
    }
}

/// One engine subprocess scoped to one node's test attempt. Entry spawns
/// and waits for readiness; `terminate` guarantees teardown of the process,
/// its pipes, and the temp config file.
pub struct EngineInstance {
    pub port: u16,
    child: Child,
    pid: Option<u32>,
    config_file: ConfigFile,
    registry: ProcessRegistry,
    tag: String,
}

impl EngineInstance {
    pub async fn start(
        node: &Node,
        port: u16,
        binary: &Path,
        startup_timeout: Duration,
        registry: ProcessRegistry,
    ) -> Result<Self, EngineError> {
        let config_file = ConfigFile::write(node, port)?;
        let tag = format!("{}@{port}", node.name);

        let mut command = Command::new(binary);
        command
            .arg("run")
            .arg("-c")
            .arg(&config_file.path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The engine must reach the node directly, not through whatever
        // egress proxy this host is configured with.
        for var in [
            "HTTP_PROXY",
            "HTTPS_PROXY",
            "ALL_PROXY",
            "http_proxy",
            "https_proxy",
            "all_proxy",
        ] {
            command.env_remove(var);
        }
        #[cfg(windows)]
        {
            const CREATE_NO_WINDOW: u32 = 0x0800_0000;
            command.creation_flags(CREATE_NO_WINDOW);
        }

        let mut child = command.spawn().map_err(EngineError::Spawn)?;
        let pid = child.id();
        if let Some(pid) = pid {
            registry.register(pid, &tag, &config_file.path);
        }
        log::debug!("spawned sing-box (pid {pid:?}) for {tag}");

        let mut instance = Self {
            port,
            child,
            pid,
            config_file,
            registry,
            tag,
        };

        if let Err(e) = instance.wait_ready(startup_timeout).await {
            instance.terminate().await;
            return Err(e);
        }
        Ok(instance)
    }

    /// Polls until the process is alive and the SOCKS5 inbound accepts a
    /// connection, or the startup timeout passes. An early exit surfaces a
    /// truncated stderr excerpt.
    async fn wait_ready(&mut self, startup_timeout: Duration) -> Result<(), EngineError> {
        let deadline = tokio::time::Instant::now() + startup_timeout;
        loop {
            if let Some(status) = self.child.try_wait().map_err(EngineError::Spawn)? {
                let excerpt = self.read_stderr_excerpt().await;
                return Err(EngineError::Startup(format!(
                    "exited during startup with {status}: {excerpt}"
                )));
            }

            if TcpStream::connect(("127.0.0.1", self.port)).await.is_ok() {
                log::debug!("engine for {} ready on port {}", self.tag, self.port);
                return Ok(());
            }

            if tokio::time::Instant::now() >= deadline {
                // Process is alive but the inbound never answered; let the
                // probes decide rather than failing the node here.
                log::debug!(
                    "engine for {} alive but port {} unconfirmed after {startup_timeout:?}",
                    self.tag,
                    self.port
                );
                return Ok(());
            }
            sleep(READINESS_POLL).await;
        }
    }

    async fn read_stderr_excerpt(&mut self) -> String {
        let Some(mut stderr) = self.child.stderr.take() else {
            return "no stderr captured".to_string();
        };
        let mut buf = Vec::new();
        let _ = timeout(Duration::from_millis(500), stderr.read_to_end(&mut buf)).await;
        let mut text = String::from_utf8_lossy(&buf).into_owned();
        if text.len() > STDERR_EXCERPT_LIMIT {
            let mut cut = STDERR_EXCERPT_LIMIT;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            text.push_str("...");
        }
        text
    }

    /// Guaranteed teardown: polite signal, timed wait, forced kill, pipe
    /// closure, temp-file deletion, registry removal, then a settle delay
    /// so the OS finishes tearing down the inbound listener.
    pub async fn terminate(mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.pid {
            send_signal(pid, false);
        }
        #[cfg(not(unix))]
        {
            let _ = self.child.start_kill();
        }

        match timeout(TERMINATE_TIMEOUT, self.child.wait()).await {
            Ok(Ok(status)) => {
                log::debug!("engine for {} stopped with {status}", self.tag);
            }
            Ok(Err(e)) => {
                log::debug!("waiting on engine for {} failed: {e}", self.tag);
            }
            Err(_) => {
                log::warn!(
                    "engine for {} ignored the stop signal, killing it",
                    self.tag
                );
                let _ = self.child.kill().await;
            }
        }

        drop(self.child.stdout.take());
        drop(self.child.stderr.take());
        if let Some(pid) = self.pid {
            self.registry.deregister(pid);
        }
        // ConfigFile deletes the temp config when `self` drops below.

        sleep(PORT_SETTLE_DELAY).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Credentials, Transport};

    fn node() -> Node {
        Node {
            name: "n".to_string(),
            server: "example.com".to_string(),
            port: 443,
            credentials: Credentials::Trojan {
                password: "pw".to_string(),
            },
            transport: Transport::Tcp,
            tls: None,
            origin_uri: String::new(),
        }
    }

    #[test]
    fn test_config_file_removed_on_drop() {
        let file = ConfigFile::write(&node(), 45999).unwrap();
        let path = file.path.clone();
        assert!(path.exists());
        drop(file);
        assert!(!path.exists());
    }

    #[test]
    fn test_config_file_contains_wire_shape() {
        let file = ConfigFile::write(&node(), 45998).unwrap();
        let written: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&file.path).unwrap()).unwrap();
        assert_eq!(written["inbounds"][0]["listen_port"], 45998);
        assert_eq!(written["outbounds"][0]["type"], "trojan");
    }

    #[test]
    fn test_registry_counts_and_drains() {
        let registry = ProcessRegistry::new();
        registry.register(1111, "a", Path::new("/tmp/none-a.json"));
        registry.register(2222, "b", Path::new("/tmp/none-b.json"));
        assert_eq!(registry.active_count(), 2);
        registry.deregister(1111);
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_reap_all_empties_registry() {
        let registry = ProcessRegistry::new();
        // A pid that certainly is not ours; reaping must not error out.
        registry.register(u32::MAX - 1, "ghost", Path::new("/tmp/none.json"));
        registry.reap_all().await;
        assert_eq!(registry.active_count(), 0);
    }
}
