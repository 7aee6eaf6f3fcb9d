//! Nonce search engines
//!
//! A worker takes a prepared [`CanonicalTemplate`] and a target difficulty
//! and searches the nonce space until a candidate meets the target or the
//! job is cancelled.

use crate::crypto::CanonicalTemplate;
use crate::{Difficulty, Nonce, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Span;

pub mod cpu;

pub use cpu::{CpuWorker, CpuWorkerConfig};

/// Statistics for a single search run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MiningStats {
    /// Hashes computed across all threads
    pub total_hashes: u64,
    /// Wall-clock time of the run
    pub elapsed: Duration,
    /// Hashes per second over the run
    pub hash_rate: f64,
}

impl MiningStats {
    /// Build stats from a hash count and elapsed time
    pub fn new(total_hashes: u64, elapsed: Duration) -> Self {
        Self {
            total_hashes,
            elapsed,
            hash_rate: compute_hash_rate(total_hashes, elapsed),
        }
    }
}

/// Winning candidate of a search
#[derive(Debug, Clone, PartialEq)]
pub struct Solution {
    /// Nonce that produced the digest
    pub nonce: Nonce,
    /// Leading zero bits achieved by `hash`
    pub difficulty: Difficulty,
    /// Digest of the commitment with `nonce` spliced in
    pub hash: [u8; 32],
    /// Statistics of the run that found it
    pub stats: MiningStats,
}

/// Mining worker trait
///
/// Implementations must honour the cancellation token with bounded latency
/// and must not block the async executor.
#[async_trait]
pub trait MiningWorker: Send + Sync {
    /// Get the worker type name for logging
    fn worker_type(&self) -> &'static str;

    /// Search for a nonce whose digest meets `target`.
    ///
    /// Returns [`crate::Error::Cancelled`] if `cancellation` fires first.
    async fn mine(
        &self,
        template: Arc<CanonicalTemplate>,
        target: Difficulty,
        cancellation: CancellationToken,
    ) -> Result<Solution>;

    /// Statistics of the last completed run
    fn stats(&self) -> MiningStats {
        MiningStats::default()
    }
}

/// Utility function to compute hash rate over a time period
pub fn compute_hash_rate(hashes: u64, elapsed: Duration) -> f64 {
    if elapsed.as_secs_f64() > 0.0 {
        hashes as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    }
}

/// Create a tracing span for mining operations
pub fn mining_span(worker_type: &str, job: u64, target: Difficulty) -> Span {
    tracing::info_span!(
        "mining",
        worker_type = worker_type,
        job = job,
        target = target.value(),
    )
}
