use std::collections::HashMap;
use std::net::TcpListener;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::Mutex;

/// How many ports above the base port are scanned before giving up.
const SCAN_RANGE: u16 = 1000;

#[derive(Debug, Error)]
pub enum PortError {
    #[error("no free port within {SCAN_RANGE} ports of base {base}")]
    Exhausted { base: u16 },
}

#[derive(Debug, Clone)]
pub struct PortLease {
    pub holder: String,
    pub allocated_at: Instant,
}

struct PortState {
    allocated: HashMap<u16, PortLease>,
    cooling: HashMap<u16, Instant>,
}

/// Hands out loopback ports for engine inbounds. Released ports sit in a
/// cooldown map for `recycle_delay` before they can be reused: engines
/// sometimes leak TCP state after SIGTERM, and immediate reuse of the same
/// port turns into bind failures.
pub struct PortManager {
    base_port: u16,
    recycle_delay: Duration,
    state: Mutex<PortState>,
}

impl PortManager {
    pub fn new(base_port: u16, recycle_delay: Duration) -> Self {
        Self {
            base_port,
            recycle_delay,
            state: Mutex::new(PortState {
                allocated: HashMap::new(),
                cooling: HashMap::new(),
            }),
        }
    }

    pub async fn allocate(&self, holder: &str) -> Result<u16, PortError> {
        let mut state = self.state.lock().await;

        let now = Instant::now();
        let recycle_delay = self.recycle_delay;
        state
            .cooling
            .retain(|_, released| now.duration_since(*released) < recycle_delay);

        for port in self.base_port..self.base_port.saturating_add(SCAN_RANGE) {
            if state.allocated.contains_key(&port) || state.cooling.contains_key(&port) {
                continue;
            }
            if !port_is_free(port) {
                continue;
            }
            state.allocated.insert(
                port,
                PortLease {
                    holder: holder.to_string(),
                    allocated_at: now,
                },
            );
            log::debug!("allocated port {port} to {holder}");
            return Ok(port);
        }

        Err(PortError::Exhausted {
            base: self.base_port,
        })
    }

    pub async fn release(&self, port: u16) {
        let mut state = self.state.lock().await;
        if let Some(lease) = state.allocated.remove(&port) {
            state.cooling.insert(port, Instant::now());
            log::debug!("released port {port} (held by {})", lease.holder);
        }
    }

    pub async fn allocated_count(&self) -> usize {
        self.state.lock().await.allocated.len()
    }

    /// Drops all book-keeping. Used by the final cleanup path only.
    pub async fn clear(&self) {
        let mut state = self.state.lock().await;
        state.allocated.clear();
        state.cooling.clear();
    }
}

fn port_is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}
