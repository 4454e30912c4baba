use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;

use crate::config::TestSettings;
use crate::ports::PortManager;
use crate::process::ProcessRegistry;

/// Owns the process registry and port manager and carries the global stop
/// flag. One instance per pipeline run; tests construct their own.
pub struct ResourceManager {
    pub ports: PortManager,
    pub registry: ProcessRegistry,
    stop: AtomicBool,
}

impl ResourceManager {
    pub fn new(settings: &TestSettings) -> Self {
        Self {
            ports: PortManager::new(settings.base_port, settings.recycle_delay()),
            registry: ProcessRegistry::new(),
            stop: AtomicBool::new(false),
        }
    }

    #[cfg(test)]
    pub fn for_tests(base_port: u16) -> Self {
        Self {
            ports: PortManager::new(base_port, std::time::Duration::from_millis(50)),
            registry: ProcessRegistry::new(),
            stop: AtomicBool::new(false),
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Reaps every live engine and clears the port maps. Best-effort on
    /// every path; errors are logged inside, never returned.
    pub async fn cleanup_all(&self) {
        self.registry.reap_all().await;
        self.ports.clear().await;
        log::debug!("resource cleanup finished");
    }
}

/// Installs the interrupt handler. The first SIGINT/SIGTERM sets the stop
/// flag; workers drain, and the main flow runs cleanup and writes the
/// partial report before exiting.
pub fn spawn_signal_handler(resources: Arc<ResourceManager>) -> JoinHandle<()> {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        log::warn!("interrupt received, draining workers...");
        resources.request_stop();
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            log::error!("unable to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
