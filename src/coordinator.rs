//! Per-connection mining job control
//!
//! A [`MiningCoordinator`] owns a single job slot. Submitting a new request
//! cancels whatever is in the slot, so a superseded job never produces an
//! outcome.

use crate::crypto::CanonicalTemplate;
use crate::utils::format_hash_rate;
use crate::worker::{mining_span, MiningWorker, Solution};
use crate::{Difficulty, Error, Event, MiningRequest, MiningResult, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, Instrument};

/// Sequence number of a job within one connection
pub type JobId = u64;

/// Difficulty policy applied to every request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowLimits {
    /// Used when a request asks for `target_pow: 0`
    pub default_difficulty: Difficulty,
    /// Highest accepted target; never above [`Difficulty::MAX`]
    pub max_difficulty: Difficulty,
    /// Search time budget, if any
    pub max_job_duration: Option<Duration>,
}

impl Default for PowLimits {
    fn default() -> Self {
        Self {
            default_difficulty: Difficulty(0),
            max_difficulty: Difficulty::MAX,
            max_job_duration: None,
        }
    }
}

struct ActiveJob {
    id: JobId,
    cancellation: CancellationToken,
    handle: JoinHandle<Result<MiningResult>>,
}

/// Single-slot job controller for one connection
pub struct MiningCoordinator {
    engine: Arc<dyn MiningWorker>,
    limits: PowLimits,
    current: Option<ActiveJob>,
    job_counter: JobId,
    connection: CancellationToken,
}

impl MiningCoordinator {
    /// Create a coordinator whose jobs are cancelled with `connection`
    pub fn new(
        engine: Arc<dyn MiningWorker>,
        limits: PowLimits,
        connection: CancellationToken,
    ) -> Self {
        Self {
            engine,
            limits,
            current: None,
            job_counter: 0,
            connection,
        }
    }

    /// Check a request and resolve its effective target
    pub fn validate(&self, request: &MiningRequest) -> Result<Difficulty> {
        let max = self.limits.max_difficulty.min(Difficulty::MAX);
        if request.target_pow > u64::from(max.value()) {
            return Err(Error::target_too_high(request.target_pow, max.value()));
        }

        if request.event.nonce_tag().is_some() {
            return Err(Error::invalid_request("event already carries a nonce tag"));
        }

        Ok(match request.target_pow {
            0 => self.limits.default_difficulty,
            bits => Difficulty(bits as u32),
        })
    }

    /// Replace the current job with `request`.
    ///
    /// The previous job is cancelled even when `request` fails validation.
    pub fn submit(&mut self, request: MiningRequest) -> Result<JobId> {
        if let Some(previous) = self.cancel_current() {
            debug!("Job {} superseded", previous);
        }

        let target = self.validate(&request)?;
        let template = Arc::new(CanonicalTemplate::new(&request.event, target)?);

        self.job_counter += 1;
        let id = self.job_counter;
        let cancellation = self.connection.child_token();
        let span = mining_span(self.engine.worker_type(), id, target);

        let handle = tokio::spawn(
            run_job(
                Arc::clone(&self.engine),
                template,
                request.event,
                target,
                self.limits.max_job_duration,
                cancellation.clone(),
            )
            .instrument(span),
        );

        debug!("Job {} started at target {}", id, target);
        self.current = Some(ActiveJob {
            id,
            cancellation,
            handle,
        });
        Ok(id)
    }

    /// Cancel the in-flight job, if any, discarding its outcome
    pub fn cancel_current(&mut self) -> Option<JobId> {
        let job = self.current.take()?;
        job.cancellation.cancel();
        Some(job.id)
    }

    /// Whether a job occupies the slot
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    /// Wait for the current job to finish.
    ///
    /// Pending forever while the slot is empty. Cancel safe: dropping the
    /// future leaves the job in place.
    pub async fn next_outcome(&mut self) -> (JobId, Result<MiningResult>) {
        let Some(job) = self.current.as_mut() else {
            return std::future::pending().await;
        };

        let outcome = match (&mut job.handle).await {
            Ok(result) => result,
            Err(e) => Err(Error::internal(format!("mining task failed: {e}"))),
        };
        let id = job.id;
        self.current = None;
        (id, outcome)
    }
}

impl Drop for MiningCoordinator {
    fn drop(&mut self) {
        self.cancel_current();
    }
}

async fn run_job(
    engine: Arc<dyn MiningWorker>,
    template: Arc<CanonicalTemplate>,
    event: Event,
    target: Difficulty,
    limit: Option<Duration>,
    cancellation: CancellationToken,
) -> Result<MiningResult> {
    let search = engine.mine(template, target, cancellation.clone());
    let solution = match limit {
        Some(limit) => match tokio::time::timeout(limit, search).await {
            Ok(result) => result?,
            Err(_) => {
                cancellation.cancel();
                return Err(Error::timeout(format!(
                    "mining exceeded {}",
                    humantime::format_duration(limit)
                )));
            }
        },
        None => search.await?,
    };

    info!(
        "Mined nonce {} at difficulty {}: {} hashes in {:?} ({})",
        solution.nonce,
        solution.difficulty,
        solution.stats.total_hashes,
        solution.stats.elapsed,
        format_hash_rate(solution.stats.hash_rate)
    );

    finalize(event, target, &solution)
}

/// Attach the winning nonce and recompute the id
fn finalize(mut event: Event, target: Difficulty, solution: &Solution) -> Result<MiningResult> {
    event.push_nonce_tag(solution.nonce, target);
    let digest = event.assign_id()?;
    if digest != solution.hash {
        return Err(Error::internal("mined digest does not match event id"));
    }

    Ok(MiningResult {
        pow: Difficulty::of_hash(&digest).value(),
        event,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::{CpuWorker, CpuWorkerConfig};
    use assert_matches::assert_matches;

    fn hello_request(target_pow: u64) -> MiningRequest {
        MiningRequest {
            event: Event {
                id: None,
                created_at: 1_700_000_000,
                kind: 1,
                tags: vec![],
                content: "Hello, World!".to_string(),
                pubkey: "test_pubkey".to_string(),
            },
            target_pow,
        }
    }

    fn coordinator(limits: PowLimits) -> MiningCoordinator {
        let engine = Arc::new(CpuWorker::new(CpuWorkerConfig {
            threads: 2,
            batch_size: 512,
        }));
        MiningCoordinator::new(engine, limits, CancellationToken::new())
    }

    #[tokio::test]
    async fn test_validate_targets() {
        let limits = PowLimits {
            default_difficulty: Difficulty(4),
            max_difficulty: Difficulty(20),
            max_job_duration: None,
        };
        let coordinator = coordinator(limits);

        assert_eq!(coordinator.validate(&hello_request(0)).unwrap(), Difficulty(4));
        assert_eq!(coordinator.validate(&hello_request(20)).unwrap(), Difficulty(20));
        assert_matches!(
            coordinator.validate(&hello_request(21)),
            Err(Error::TargetTooHigh { requested: 21, max: 20 })
        );
    }

    #[tokio::test]
    async fn test_validate_rejects_bad_templates() {
        let coordinator = coordinator(PowLimits::default());
        assert_matches!(
            coordinator.validate(&hello_request(257)),
            Err(Error::TargetTooHigh { requested: 257, max: 256 })
        );

        assert_matches!(
            coordinator.validate(&hello_request(4_294_967_296)),
            Err(Error::TargetTooHigh {
                requested: 4_294_967_296,
                max: 256
            })
        );

        let mut request = hello_request(8);
        request.event.tags.push(vec!["nonce".into(), "1".into(), "8".into()]);
        assert_matches!(coordinator.validate(&request), Err(Error::InvalidRequest { .. }));
    }

    #[tokio::test]
    async fn test_submit_and_finalize() {
        let mut coordinator = coordinator(PowLimits::default());
        let id = coordinator.submit(hello_request(8)).unwrap();
        assert!(coordinator.is_busy());

        let (done, outcome) = coordinator.next_outcome().await;
        assert_eq!(done, id);
        assert!(!coordinator.is_busy());

        let result = outcome.unwrap();
        assert!(result.pow >= 8);
        assert_eq!(result.event.tags.len(), 1);
        assert_eq!(result.event.tags[0][0], "nonce");
        assert_eq!(result.event.tags[0][2], "8");

        let id_bytes = hex::decode(result.event.id.as_ref().unwrap()).unwrap();
        assert_eq!(Difficulty::of_hash(&id_bytes).value(), result.pow);
        assert_eq!(result.event.digest().unwrap().to_vec(), id_bytes);
    }

    #[tokio::test]
    async fn test_empty_tag_entry_is_kept() {
        let mut coordinator = coordinator(PowLimits::default());
        let mut request = hello_request(4);
        request.event.tags.push(vec![]);
        coordinator.submit(request).unwrap();

        let (_, outcome) = coordinator.next_outcome().await;
        let result = outcome.unwrap();
        assert_eq!(result.event.tags.len(), 2);
        assert!(result.event.tags[0].is_empty());
        assert_eq!(result.event.tags[1][0], "nonce");
        assert_eq!(
            result.event.digest().unwrap().to_vec(),
            hex::decode(result.event.id.as_ref().unwrap()).unwrap()
        );
    }

    #[tokio::test]
    async fn test_supersession_discards_previous_job() {
        let mut coordinator = coordinator(PowLimits::default());
        let first = coordinator.submit(hello_request(250)).unwrap();
        let second = coordinator.submit(hello_request(4)).unwrap();
        assert_ne!(first, second);

        let (done, outcome) = coordinator.next_outcome().await;
        assert_eq!(done, second);
        assert!(outcome.unwrap().pow >= 4);
    }

    #[tokio::test]
    async fn test_invalid_submit_still_supersedes() {
        let mut coordinator = coordinator(PowLimits::default());
        coordinator.submit(hello_request(250)).unwrap();
        assert_matches!(
            coordinator.submit(hello_request(300)),
            Err(Error::TargetTooHigh { .. })
        );
        assert!(!coordinator.is_busy());
    }

    #[tokio::test]
    async fn test_idle_coordinator_has_no_outcome() {
        let mut coordinator = coordinator(PowLimits::default());
        coordinator.submit(hello_request(250)).unwrap();
        assert!(coordinator.cancel_current().is_some());
        assert!(coordinator.cancel_current().is_none());

        let waited =
            tokio::time::timeout(Duration::from_millis(100), coordinator.next_outcome()).await;
        assert!(waited.is_err());
    }

    #[tokio::test]
    async fn test_job_time_limit() {
        let mut coordinator = coordinator(PowLimits {
            max_job_duration: Some(Duration::from_millis(50)),
            ..PowLimits::default()
        });
        coordinator.submit(hello_request(250)).unwrap();

        let (_, outcome) = coordinator.next_outcome().await;
        assert_matches!(outcome, Err(Error::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_connection_cancel_stops_job() {
        let connection = CancellationToken::new();
        let engine = Arc::new(CpuWorker::new(CpuWorkerConfig {
            threads: 1,
            batch_size: 512,
        }));
        let mut coordinator =
            MiningCoordinator::new(engine, PowLimits::default(), connection.clone());
        coordinator.submit(hello_request(250)).unwrap();

        connection.cancel();
        let (_, outcome) = coordinator.next_outcome().await;
        assert_matches!(outcome, Err(Error::Cancelled { .. }));
    }
}
