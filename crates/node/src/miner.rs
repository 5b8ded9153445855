//! Proof-of-work miner: a scoped worker pool over disjoint nonce strides,
//! sized from system load and guarded by a circuit breaker.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use powd_consensus::Hash256;
use powd_pow::difficulty::compact_to_target;
use powd_pow::{search_nonces, NonceRange, SearchOutcome};
use powd_primitives::block::BlockHeader;

use crate::breaker::{BreakerConfig, CircuitBreaker};
use crate::load::{adaptive_workers, LoadProbe, MIN_MEMORY_AVAILABLE};

const MAX_DEGRADE_STEPS: u32 = 8;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum MiningError {
    #[error("mining deadline passed")]
    Timeout,
    #[error("mining cancelled")]
    Cancelled,
    #[error("circuit breaker open, retry in {retry_after:?}")]
    BreakerOpen { retry_after: Duration },
    #[error("insufficient resources: {0}")]
    Resource(String),
    #[error("mining worker panicked")]
    WorkerPanicked,
    #[error("nonce space exhausted")]
    Exhausted,
    #[error("invalid target bits {0:#010x}")]
    InvalidTarget(u32),
    #[error("template is stale")]
    Stale,
}

#[derive(Clone, Debug)]
pub struct MinerConfig {
    pub max_workers: usize,
    /// Hashes between cancellation checks.
    pub poll_every: u64,
    pub deadline: Option<Duration>,
    pub breaker: BreakerConfig,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            max_workers: num_cpus::get().max(1),
            poll_every: 4_096,
            deadline: Some(Duration::from_secs(60)),
            breaker: BreakerConfig::default(),
        }
    }
}

/// Cooperative stop signal shared with mining workers.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Mined {
    pub nonce: u64,
    pub hash: Hash256,
    pub workers: usize,
    pub elapsed: Duration,
}

pub struct Miner {
    config: MinerConfig,
    breaker: CircuitBreaker,
    probe: Arc<dyn LoadProbe>,
    current: Mutex<Option<CancelToken>>,
    degrade: AtomicU32,
    last_workers: AtomicUsize,
    found: AtomicU64,
}

impl Miner {
    pub fn new(config: MinerConfig, probe: Arc<dyn LoadProbe>) -> Self {
        let breaker = CircuitBreaker::new(config.breaker);
        Self {
            config,
            breaker,
            probe,
            current: Mutex::new(None),
            degrade: AtomicU32::new(0),
            last_workers: AtomicUsize::new(0),
            found: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn last_workers(&self) -> usize {
        self.last_workers.load(Ordering::Relaxed)
    }

    pub fn blocks_found(&self) -> u64 {
        self.found.load(Ordering::Relaxed)
    }

    /// Starts a new job, cancelling whichever one was in flight.
    pub fn begin_job(&self) -> CancelToken {
        let token = CancelToken::new();
        if let Some(previous) = self.current.lock().replace(token.clone()) {
            previous.cancel();
        }
        token
    }

    pub fn cancel_current(&self) {
        if let Some(token) = self.current.lock().take() {
            token.cancel();
        }
    }

    /// Searches for a nonce that brings `header` under its target. Blocks the
    /// calling thread until a worker succeeds, `cancel` fires, or the deadline
    /// passes.
    pub fn mine(&self, header: &BlockHeader, cancel: &CancelToken) -> Result<Mined, MiningError> {
        self.breaker
            .allow()
            .map_err(|open| MiningError::BreakerOpen {
                retry_after: open.retry_after,
            })?;
        let target =
            compact_to_target(header.bits).map_err(|_| MiningError::InvalidTarget(header.bits))?;

        let sample = self.probe.sample();
        if sample.memory_available < MIN_MEMORY_AVAILABLE {
            self.breaker.record_failure();
            return Err(MiningError::Resource(format!(
                "only {:.1}% memory available",
                sample.memory_available * 100.0
            )));
        }
        let workers = adaptive_workers(
            &sample,
            self.config.max_workers,
            self.degrade.load(Ordering::Relaxed),
        );
        let previous = self.last_workers.swap(workers, Ordering::Relaxed);
        if previous != workers {
            log_info!(
                "Miner using {workers} worker(s) (was {previous}, cpu busy {:.0}%)",
                sample.cpu_busy * 100.0
            );
        }

        let start = Instant::now();
        let deadline = self.config.deadline.map(|limit| start + limit);
        let found = AtomicBool::new(false);
        let (tx, rx) = crossbeam_channel::bounded(workers);
        let stride = workers as u64;
        let poll_every = self.config.poll_every;

        let all_joined = std::thread::scope(|scope| {
            let found = &found;
            let target = &target;
            let handles: Vec<_> = (0..workers)
                .map(|worker| {
                    let tx = tx.clone();
                    scope.spawn(move || {
                        let range = NonceRange {
                            start: header.nonce.wrapping_add(worker as u64),
                            stride,
                            max_attempts: u64::MAX / stride,
                            poll_every,
                        };
                        let outcome = search_nonces(header, target, range, || {
                            found.load(Ordering::Relaxed)
                                || cancel.is_cancelled()
                                || deadline.is_some_and(|limit| Instant::now() >= limit)
                        });
                        if matches!(outcome, SearchOutcome::Found { .. }) {
                            found.store(true, Ordering::Relaxed);
                        }
                        let _ = tx.send(outcome);
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().is_ok())
                .fold(true, |all, ok| all && ok)
        });
        drop(tx);

        let winner = rx.try_iter().find_map(|outcome| match outcome {
            SearchOutcome::Found { nonce, hash } => Some((nonce, hash)),
            _ => None,
        });
        if let Some((nonce, hash)) = winner {
            self.breaker.record_success();
            self.degrade.store(0, Ordering::Relaxed);
            self.found.fetch_add(1, Ordering::Relaxed);
            return Ok(Mined {
                nonce,
                hash,
                workers,
                elapsed: start.elapsed(),
            });
        }
        if !all_joined {
            self.breaker.record_failure();
            return Err(MiningError::WorkerPanicked);
        }
        if cancel.is_cancelled() {
            return Err(MiningError::Cancelled);
        }
        self.breaker.record_failure();
        if deadline.is_some_and(|limit| Instant::now() >= limit) {
            let steps = self.degrade.load(Ordering::Relaxed);
            if steps < MAX_DEGRADE_STEPS {
                self.degrade.store(steps + 1, Ordering::Relaxed);
            }
            return Err(MiningError::Timeout);
        }
        Err(MiningError::Exhausted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::load::{FixedProbe, LoadSample};
    use powd_pow::difficulty::hash_meets_target;

    fn probe(memory_available: f32) -> Arc<dyn LoadProbe> {
        Arc::new(FixedProbe(LoadSample {
            cpu_busy: 0.0,
            memory_available,
            cores: 4,
        }))
    }

    fn header(bits: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block: [3; 32],
            merkle_root: [4; 32],
            time: 1_767_225_600,
            bits,
            nonce: 0,
            height: 1,
        }
    }

    fn config(deadline: Option<Duration>) -> MinerConfig {
        MinerConfig {
            max_workers: 3,
            poll_every: 64,
            deadline,
            breaker: BreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(60),
                cooldown: Duration::from_secs(60),
                half_open_trials: 1,
            },
        }
    }

    #[test]
    fn mined_hash_meets_target() {
        let miner = Miner::new(config(None), probe(0.9));
        let mut header = header(0x207f_ffff);
        let mined = miner.mine(&header, &CancelToken::new()).expect("mined");
        header.nonce = mined.nonce;
        assert_eq!(header.hash(), mined.hash);
        let target = compact_to_target(header.bits).unwrap();
        assert!(hash_meets_target(&mined.hash, &target));
        assert_eq!(mined.workers, 3);
        assert_eq!(miner.blocks_found(), 1);
    }

    #[test]
    fn cancelled_job_returns_promptly() {
        let miner = Miner::new(config(None), probe(0.9));
        let token = miner.begin_job();
        miner.cancel_current();
        let started = Instant::now();
        let err = miner.mine(&header(0x0300_0001), &token).unwrap_err();
        assert_eq!(err, MiningError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(miner.breaker().trips(), 0);
    }

    #[test]
    fn new_job_cancels_previous() {
        let miner = Miner::new(config(None), probe(0.9));
        let first = miner.begin_job();
        let second = miner.begin_job();
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
    }

    #[test]
    fn timeouts_trip_breaker_and_degrade() {
        let miner = Miner::new(config(Some(Duration::from_millis(20))), probe(0.9));
        let impossible = header(0x0300_0001);
        for _ in 0..2 {
            assert_eq!(
                miner.mine(&impossible, &CancelToken::new()),
                Err(MiningError::Timeout)
            );
        }
        assert!(matches!(
            miner.mine(&impossible, &CancelToken::new()),
            Err(MiningError::BreakerOpen { .. })
        ));
        assert_eq!(miner.degrade.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn low_memory_is_a_resource_error() {
        let miner = Miner::new(config(None), probe(0.01));
        assert!(matches!(
            miner.mine(&header(0x207f_ffff), &CancelToken::new()),
            Err(MiningError::Resource(_))
        ));
    }
}
