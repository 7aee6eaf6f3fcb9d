//! CPU mining worker implementation
//!
//! Multi-threaded SHA-256 nonce search. Each job runs on its own named OS
//! threads, outside the async runtime and its blocking pool, so a long job
//! on one connection cannot hold up another's. Each thread walks its own
//! stride of the counter space and checks for cancellation once per batch.

use super::{MiningStats, MiningWorker, Solution};
use crate::crypto::CanonicalTemplate;
use crate::{Difficulty, Error, Nonce, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name prefix of search threads
pub const THREAD_NAME_PREFIX: &str = "powerplant-miner";

/// Default number of hashes between cancellation checks
pub const DEFAULT_BATCH_SIZE: u64 = 10_000;

/// CPU worker settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuWorkerConfig {
    /// Worker threads; `0` means one per logical CPU
    pub threads: usize,
    /// Hashes per thread between cancellation checks
    pub batch_size: u64,
}

impl Default for CpuWorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// CPU mining worker using dedicated search threads
pub struct CpuWorker {
    thread_count: usize,
    batch_size: u64,
    last_stats: Mutex<MiningStats>,
}

/// Candidate reported by one thread
struct Found {
    thread_id: usize,
    nonce: Nonce,
    hash: [u8; 32],
}

impl CpuWorker {
    /// Create a new CPU worker
    pub fn new(config: CpuWorkerConfig) -> Self {
        let thread_count = Self::effective_threads(config.threads);

        debug!(
            "Creating CPU worker with {} threads, batch size {}",
            thread_count, config.batch_size
        );

        Self {
            thread_count,
            batch_size: config.batch_size.max(1),
            last_stats: Mutex::new(MiningStats::default()),
        }
    }

    /// Number of search threads per job
    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    /// Threads a job will use for a configured count
    pub fn effective_threads(configured: usize) -> usize {
        if configured == 0 {
            num_cpus::get()
        } else {
            configured
        }
    }

    /// Search the stride `thread_id, thread_id + stride, ...`
    fn mine_thread(
        thread_id: usize,
        stride: u64,
        batch_size: u64,
        template: &CanonicalTemplate,
        target: Difficulty,
        hashes: &AtomicU64,
        cancellation: &CancellationToken,
    ) -> Option<Found> {
        let mut nonce = Nonce::new(thread_id as u64);

        loop {
            if cancellation.is_cancelled() {
                debug!("Thread {} cancelled", thread_id);
                return None;
            }

            let mut computed = 0u64;
            for _ in 0..batch_size {
                let (meets, hash) = template.hash_and_check(nonce, target);
                computed += 1;
                if meets {
                    hashes.fetch_add(computed, Ordering::Relaxed);
                    return Some(Found {
                        thread_id,
                        nonce,
                        hash,
                    });
                }

                nonce = match nonce.checked_add(stride) {
                    Some(next) => next,
                    None => {
                        hashes.fetch_add(computed, Ordering::Relaxed);
                        warn!("Thread {} exhausted its nonce range", thread_id);
                        return None;
                    }
                };
            }
            hashes.fetch_add(computed, Ordering::Relaxed);
        }
    }
}

#[async_trait]
impl MiningWorker for CpuWorker {
    fn worker_type(&self) -> &'static str {
        "cpu"
    }

    async fn mine(
        &self,
        template: Arc<CanonicalTemplate>,
        target: Difficulty,
        cancellation: CancellationToken,
    ) -> Result<Solution> {
        let start = Instant::now();
        let hashes = Arc::new(AtomicU64::new(0));
        let threads = cancellation.child_token();

        // Channel for solutions from mining threads
        let (solution_tx, mut solution_rx) = mpsc::unbounded_channel();

        let stride = self.thread_count as u64;
        for thread_id in 0..self.thread_count {
            let template = Arc::clone(&template);
            let hashes = Arc::clone(&hashes);
            let threads_token = threads.clone();
            let solution_tx = solution_tx.clone();
            let batch_size = self.batch_size;

            let spawned = thread::Builder::new()
                .name(format!("{}-{}", THREAD_NAME_PREFIX, thread_id))
                .spawn(move || {
                    if let Some(found) = Self::mine_thread(
                        thread_id,
                        stride,
                        batch_size,
                        &template,
                        target,
                        &hashes,
                        &threads_token,
                    ) {
                        // Receiver is gone once another thread won
                        let _ = solution_tx.send(found);
                    }
                });

            if let Err(e) = spawned {
                warn!("Failed to spawn mining thread {}: {}", thread_id, e);
                threads.cancel();
                break;
            }
        }

        // Channel closes when every thread has returned
        drop(solution_tx);

        let result = tokio::select! {
            biased;
            _ = cancellation.cancelled() => Err(Error::cancelled("CPU mining")),
            found = solution_rx.recv() => match found {
                Some(found) => Ok(found),
                None => Err(Error::internal("all mining threads stopped without a solution")),
            },
        };

        // Wait for every thread to drop its sender
        threads.cancel();
        while solution_rx.recv().await.is_some() {}

        let stats = MiningStats::new(hashes.load(Ordering::Relaxed), start.elapsed());
        *self.last_stats.lock() = stats;

        let found = result?;
        debug!(
            "Solution found by thread {} with nonce {}",
            found.thread_id, found.nonce
        );
        info!(
            "CPU mining completed. Total hashes: {}, Hash rate: {:.2} MH/s",
            stats.total_hashes,
            stats.hash_rate / 1_000_000.0
        );

        Ok(Solution {
            nonce: found.nonce,
            difficulty: Difficulty::of_hash(&found.hash),
            hash: found.hash,
            stats,
        })
    }

    fn stats(&self) -> MiningStats {
        *self.last_stats.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Event;
    use assert_matches::assert_matches;
    use std::time::Duration;

    fn template(target: Difficulty) -> Arc<CanonicalTemplate> {
        let event = Event {
            id: None,
            created_at: 1_700_000_000,
            kind: 1,
            tags: vec![],
            content: "Hello, World!".to_string(),
            pubkey: "test_pubkey".to_string(),
        };
        Arc::new(CanonicalTemplate::new(&event, target).unwrap())
    }

    fn worker(threads: usize) -> CpuWorker {
        CpuWorker::new(CpuWorkerConfig {
            threads,
            batch_size: 256,
        })
    }

    #[tokio::test]
    async fn test_cpu_worker_creation() {
        let worker = worker(2);
        assert_eq!(worker.thread_count(), 2);
        assert_eq!(worker.worker_type(), "cpu");
        assert!(CpuWorker::new(CpuWorkerConfig::default()).thread_count() >= 1);
    }

    #[tokio::test]
    async fn test_zero_target_returns_first_candidate() {
        let worker = worker(1);
        let solution = worker
            .mine(template(Difficulty(0)), Difficulty(0), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(solution.nonce, Nonce::new(0));
        assert_eq!(solution.stats.total_hashes, 1);
    }

    #[tokio::test]
    async fn test_cpu_worker_finds_solution() {
        let target = Difficulty(10);
        let template = template(target);
        let worker = worker(4);
        let solution = worker
            .mine(Arc::clone(&template), target, CancellationToken::new())
            .await
            .unwrap();

        assert!(solution.difficulty.meets(target));
        assert_eq!(template.digest(solution.nonce), solution.hash);
        assert_eq!(worker.stats(), solution.stats);
        assert!(solution.stats.total_hashes >= 1);
    }

    #[tokio::test]
    async fn test_cpu_worker_cancellation() {
        let worker = worker(1);
        let cancellation = CancellationToken::new();
        cancellation.cancel();

        let result = worker
            .mine(template(Difficulty::MAX), Difficulty::MAX, cancellation)
            .await;
        assert_matches!(result, Err(Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_cpu_worker_cancellation_mid_search() {
        let worker = Arc::new(worker(2));
        let cancellation = CancellationToken::new();

        let handle = {
            let worker = Arc::clone(&worker);
            let cancellation = cancellation.clone();
            tokio::spawn(async move {
                worker
                    .mine(template(Difficulty(200)), Difficulty(200), cancellation)
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("search did not stop after cancellation")
            .unwrap();
        assert_matches!(result, Err(Error::Cancelled { .. }));
        assert!(worker.stats().total_hashes > 0);
    }

    #[test]
    fn test_search_runs_outside_blocking_pool() {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(1)
            .enable_all()
            .build()
            .unwrap();

        runtime.block_on(async {
            // Occupy the only blocking thread for the whole search
            let release = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let occupied = {
                let release = Arc::clone(&release);
                tokio::task::spawn_blocking(move || {
                    while !release.load(Ordering::Relaxed) {
                        std::thread::sleep(Duration::from_millis(5));
                    }
                })
            };

            let target = Difficulty(8);
            let solution = tokio::time::timeout(
                Duration::from_secs(10),
                worker(2).mine(template(target), target, CancellationToken::new()),
            )
            .await;

            release.store(true, Ordering::Relaxed);
            occupied.await.unwrap();

            let solution = solution.expect("search waited on the blocking pool").unwrap();
            assert!(solution.difficulty.meets(target));
        });
    }
}
