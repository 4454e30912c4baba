use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep};

use crate::node::Node;
use crate::resources::ResourceManager;
use crate::tester::TestResult;

/// Bounded producer-consumer pool: a fixed set of worker tasks pulls nodes
/// from a shared queue, tests them, and emits results. A success cap or the
/// global stop flag drains the pool promptly; each worker finishes at most
/// its current task.
pub struct WorkerPool {
    worker_count: usize,
    success_limit: usize,
}

impl WorkerPool {
    pub fn new(worker_count: usize, success_limit: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
            success_limit,
        }
    }

    pub async fn run<F, Fut>(
        &self,
        nodes: Vec<Node>,
        resources: Arc<ResourceManager>,
        test_fn: F,
    ) -> Vec<TestResult>
    where
        F: Fn(Node, usize) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = TestResult> + Send,
    {
        if nodes.is_empty() {
            return Vec::new();
        }

        let total = nodes.len();
        let worker_count = self.worker_count.min(total);
        let success_limit = self.success_limit;
        log::info!("starting {worker_count} worker(s) for {total} node(s)");

        let (task_tx, task_rx) = mpsc::channel::<(usize, Node)>(worker_count * 2);
        let task_rx = Arc::new(Mutex::new(task_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<TestResult>(total.max(1));

        let successful = Arc::new(AtomicUsize::new(0));
        let processed = Arc::new(AtomicUsize::new(0));

        let reporter = spawn_progress_reporter(
            total,
            Arc::clone(&processed),
            Arc::clone(&successful),
        );

        // Distributor: feeds tasks in node order, stops at the success cap
        // or on cancellation, then closes the queue as end-of-stream.
        let distributor: JoinHandle<()> = tokio::spawn({
            let resources = Arc::clone(&resources);
            let successful = Arc::clone(&successful);
            async move {
                for (index, node) in nodes.into_iter().enumerate() {
                    if resources.stop_requested() {
                        log::debug!("distributor stopping: cancellation requested");
                        break;
                    }
                    if success_limit > 0 && successful.load(Ordering::Acquire) >= success_limit {
                        log::info!("success limit {success_limit} reached, no more tasks");
                        break;
                    }
                    if task_tx.send((index, node)).await.is_err() {
                        break;
                    }
                }
            }
        });

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let task_rx = Arc::clone(&task_rx);
            let result_tx = result_tx.clone();
            let resources = Arc::clone(&resources);
            let successful = Arc::clone(&successful);
            let processed = Arc::clone(&processed);
            let test_fn = test_fn.clone();
            workers.push(tokio::spawn(async move {
                log::debug!("worker {worker_id} started");
                loop {
                    if resources.stop_requested() {
                        break;
                    }
                    if success_limit > 0 && successful.load(Ordering::Acquire) >= success_limit {
                        break;
                    }
                    let task = { task_rx.lock().await.recv().await };
                    let Some((index, node)) = task else { break };

                    let result = test_fn(node, index).await;
                    if result.is_success() {
                        successful.fetch_add(1, Ordering::Release);
                    }
                    processed.fetch_add(1, Ordering::Release);
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
                log::debug!("worker {worker_id} exited");
            }));
        }
        drop(result_tx);
        // Once every worker has dropped its queue handle the channel
        // closes, which unblocks a distributor stuck on a full buffer.
        drop(task_rx);

        // Collector: the channel closes once every worker has exited.
        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }

        let _ = distributor.await;
        for worker in workers {
            if let Err(e) = worker.await {
                log::error!("worker panicked: {e}");
            }
        }
        reporter.abort();

        log::info!(
            "pool finished: {} result(s), {} successful",
            results.len(),
            successful.load(Ordering::Acquire)
        );
        results
    }
}

/// Prints percent complete, success count, and a linear-extrapolation ETA
/// about once a second. The ETA is advisory only.
fn spawn_progress_reporter(
    total: usize,
    processed: Arc<AtomicUsize>,
    successful: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = Instant::now();
        loop {
            sleep(Duration::from_secs(1)).await;
            let done = processed.load(Ordering::Acquire);
            let ok = successful.load(Ordering::Acquire);
            let percent = done as f64 / total as f64 * 100.0;
            let eta = if done > 0 {
                let per_node = start.elapsed().as_secs_f64() / done as f64;
                per_node * (total - done) as f64
            } else {
                0.0
            };
            log::info!(
                "[{}] {percent:.1}% ({done}/{total}) success: {ok} ETA: {eta:.0}s",
                progress_bar(percent, 40)
            );
            if done >= total {
                break;
            }
        }
    })
}

fn progress_bar(percent: f64, width: usize) -> String {
    let filled = ((percent / 100.0) * width as f64) as usize;
    let filled = filled.min(width);
    format!("{}{}", "=".repeat(filled), "-".repeat(width - filled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::{Credentials, Transport};
    use crate::tester::{TestStatus, TestResult};

    fn nodes(count: usize) -> Vec<Node> {
        (0..count)
            .map(|i| Node {
                name: format!("node-{i}"),
                server: format!("10.0.0.{i}"),
                port: 8388,
                credentials: Credentials::Shadowsocks {
                    method: "aes-256-gcm".to_string(),
                    password: "pw".to_string(),
                },
                transport: Transport::Tcp,
                tls: None,
                origin_uri: String::new(),
            })
            .collect()
    }

    fn passing(node: &Node) -> TestResult {
        TestResult {
            name: node.name.clone(),
            server: node.server.clone(),
            port: node.port,
            kind: node.kind(),
            status: TestStatus::Success,
            error: None,
            latency_ms: Some(10.0),
            latency_source: None,
            speed_mbps: None,
            ip_purity: None,
        }
    }

    fn failing(node: &Node) -> TestResult {
        TestResult {
            name: node.name.clone(),
            server: node.server.clone(),
            port: node.port,
            kind: node.kind(),
            status: TestStatus::Failed,
            error: Some("All connectivity tests failed".to_string()),
            latency_ms: None,
            latency_source: None,
            speed_mbps: None,
            ip_purity: None,
        }
    }

    #[tokio::test]
    async fn test_pool_tests_every_node() {
        let pool = WorkerPool::new(4, 0);
        let resources = Arc::new(ResourceManager::for_tests(43200));
        let results = pool
            .run(nodes(10), resources, |node, _| async move { passing(&node) })
            .await;
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(TestResult::is_success));
    }

    #[tokio::test]
    async fn test_pool_empty_input() {
        let pool = WorkerPool::new(4, 0);
        let resources = Arc::new(ResourceManager::for_tests(43300));
        let results = pool
            .run(Vec::new(), resources, |node, _| async move { passing(&node) })
            .await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_success_limit_bounds_results() {
        let worker_count = 4;
        let limit = 2;
        let pool = WorkerPool::new(worker_count, limit);
        let resources = Arc::new(ResourceManager::for_tests(43400));
        let results = pool
            .run(nodes(20), resources, |node, _| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                passing(&node)
            })
            .await;

        let successes = results.iter().filter(|r| r.is_success()).count();
        assert!(successes >= limit);
        // At most one extra in-flight task per worker after the cap.
        assert!(results.len() <= limit + worker_count);
    }

    #[tokio::test]
    async fn test_stop_flag_drains_promptly() {
        let pool = WorkerPool::new(2, 0);
        let resources = Arc::new(ResourceManager::for_tests(43500));
        resources.request_stop();
        let results = pool
            .run(nodes(50), resources, |node, _| async move { passing(&node) })
            .await;
        // Workers observe the flag before pulling; nothing gets tested.
        assert!(results.len() <= 2);
    }

    #[test]
    fn test_progress_bar_rendering() {
        assert_eq!(progress_bar(0.0, 10), "----------");
        assert_eq!(progress_bar(50.0, 10), "=====-----");
        assert_eq!(progress_bar(100.0, 10), "==========");
        assert_eq!(progress_bar(150.0, 10), "==========");
    }

    #[tokio::test]
    async fn test_failures_are_collected_not_dropped() {
        let pool = WorkerPool::new(3, 0);
        let resources = Arc::new(ResourceManager::for_tests(43600));
        let results = pool
            .run(nodes(6), resources, |node, idx| async move {
                if idx % 2 == 0 {
                    passing(&node)
                } else {
                    failing(&node)
                }
            })
            .await;
        assert_eq!(results.len(), 6);
        assert_eq!(results.iter().filter(|r| r.is_success()).count(), 3);
        assert_eq!(results.iter().filter(|r| !r.is_success()).count(), 3);
    }
}
