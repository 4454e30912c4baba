use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Token-bucket rate limiter shared across all bandwidth workers. Models an
/// egress cap on the testing host, not a per-connection limit.
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_update: Instant,
}

impl TokenBucket {
    pub fn new(rate_bytes_per_sec: f64, capacity_bytes: f64) -> Self {
        Self {
            rate: rate_bytes_per_sec,
            capacity: capacity_bytes,
            state: Mutex::new(BucketState {
                tokens: capacity_bytes,
                last_update: Instant::now(),
            }),
        }
    }

    /// Deducts `n` tokens. Returns zero if the bucket covered the request,
    /// otherwise the time to sleep before the balance is whole again.
    pub fn take(&self, n: usize) -> Duration {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();
        let refill = now.duration_since(state.last_update).as_secs_f64() * self.rate;
        state.tokens = (state.tokens + refill).min(self.capacity);
        state.last_update = now;

        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / self.rate)
        }
    }

    /// Applies the limit to one chunk, suspending the caller as needed.
    pub async fn throttle(&self, n: usize) {
        let wait = self.take(n);
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Builds the global limiter from the configured cap in MB/s. Zero or
/// negative disables limiting. Capacity is 10x the rate to allow bursts.
pub fn create_rate_limiter(limit_mb_per_sec: f64) -> Option<Arc<TokenBucket>> {
    if limit_mb_per_sec <= 0.0 {
        return None;
    }
    let rate = limit_mb_per_sec * 1024.0 * 1024.0;
    Some(Arc::new(TokenBucket::new(rate, rate * 10.0)))
}

/// Process-wide counters, zeroed at run start and read by the reporter at
/// run end.
#[derive(Default)]
pub struct GlobalStats {
    total_bytes: AtomicU64,
    nodes_tested: AtomicU64,
    successful_nodes: AtomicU64,
    failed_nodes: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub total_bytes: u64,
    pub nodes_tested: u64,
    pub successful_nodes: u64,
    pub failed_nodes: u64,
}

impl GlobalStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_bytes(&self, n: u64) {
        self.total_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn record_node(&self, success: bool) {
        self.nodes_tested.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_nodes.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_nodes.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_bytes: self.total_bytes.load(Ordering::Relaxed),
            nodes_tested: self.nodes_tested.load(Ordering::Relaxed),
            successful_nodes: self.successful_nodes.load(Ordering::Relaxed),
            failed_nodes: self.failed_nodes.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    pub fn success_rate(&self) -> f64 {
        if self.nodes_tested == 0 {
            0.0
        } else {
            self.successful_nodes as f64 / self.nodes_tested as f64 * 100.0
        }
    }

    pub fn total_mib(&self) -> f64 {
        self.total_bytes as f64 / (1024.0 * 1024.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_within_capacity_is_immediate() {
        let bucket = TokenBucket::new(1024.0, 10_240.0);
        assert_eq!(bucket.take(1024), Duration::ZERO);
        assert_eq!(bucket.take(9216), Duration::ZERO);
    }

    #[test]
    fn test_take_past_capacity_returns_wait() {
        let bucket = TokenBucket::new(1000.0, 1000.0);
        assert_eq!(bucket.take(1000), Duration::ZERO);
        // Bucket is empty; 500 more bytes cost about half a second.
        let wait = bucket.take(500);
        assert!(wait >= Duration::from_millis(400), "wait was {wait:?}");
        assert!(wait <= Duration::from_millis(600), "wait was {wait:?}");
    }

    #[test]
    fn test_refill_is_capped_at_capacity() {
        let bucket = TokenBucket::new(1_000_000_000.0, 100.0);
        bucket.take(100);
        std::thread::sleep(Duration::from_millis(20));
        // Despite the huge rate the refill must not exceed capacity.
        assert_eq!(bucket.take(100), Duration::ZERO);
        assert!(!bucket.take(200).is_zero());
    }

    #[test]
    fn test_create_rate_limiter_disabled_for_zero() {
        assert!(create_rate_limiter(0.0).is_none());
        assert!(create_rate_limiter(-1.0).is_none());
        assert!(create_rate_limiter(1.0).is_some());
    }

    #[test]
    fn test_stats_counters() {
        let stats = GlobalStats::new();
        stats.add_bytes(2048);
        stats.record_node(true);
        stats.record_node(true);
        stats.record_node(false);

        let snap = stats.snapshot();
        assert_eq!(snap.total_bytes, 2048);
        assert_eq!(snap.nodes_tested, 3);
        assert_eq!(snap.successful_nodes, 2);
        assert_eq!(snap.failed_nodes, 1);
        assert!((snap.success_rate() - 66.6).abs() < 1.0);
    }
}
