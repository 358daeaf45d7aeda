//! Basic safety validator (spec §4.8): the fixed pipeline of structural
//! checks every submission passes through before it reaches conflict
//! detection and priority scoring. Tracks per-check attempt/rejection
//! counters and an exponential moving average latency, for `health_report`
//! (spec §4.10).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::MempoolError;
use crate::ports::TxHashService;
use crate::types::{Transaction, TxId};

/// One stage of the validation pipeline, in the fixed order the spec
/// mandates (§4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckKind {
    Format,
    Hash,
    Size,
    Duplicate,
    MemoryLimit,
}

impl CheckKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckKind::Format => "format",
            CheckKind::Hash => "hash",
            CheckKind::Size => "size",
            CheckKind::Duplicate => "duplicate",
            CheckKind::MemoryLimit => "memory_limit",
        }
    }
}

#[derive(Debug, Default)]
struct CheckStat {
    attempts: AtomicU64,
    rejections: AtomicU64,
    ema_micros: Mutex<f64>,
}

/// Snapshot of one check's counters, for reporting.
#[derive(Debug, Clone, Copy)]
pub struct CheckReport {
    pub attempts: u64,
    pub rejections: u64,
    pub ema_latency: Duration,
}

const EMA_ALPHA: f64 = 0.2;

/// A transaction seen this recently is treated as a duplicate even if it has
/// since aged out of the LRU's capacity (spec §4.8's "short-lived" cache).
const RECENT_TTL: Duration = Duration::from_secs(300);

/// Stateful validator: owns per-check counters plus the recently-seen cache
/// backing the duplicate check.
pub struct Validator {
    stats: DashMap<CheckKind, CheckStat>,
    recent: Mutex<LruCache<TxId, Instant>>,
}

impl Validator {
    pub fn new(recent_capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(recent_capacity.max(1)).unwrap();
        Self {
            stats: DashMap::new(),
            recent: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Standalone format check, run by the caller ahead of compliance and
    /// hash computation (spec §4.1 step 2's format -> compliance -> hash
    /// order). Timed and counted under `CheckKind::Format` like every other
    /// stage.
    pub fn check_format(&self, tx: &Transaction) -> Result<(), MempoolError> {
        self.timed(CheckKind::Format, || self.check_format_inner(tx))
    }

    /// Runs the remainder of the pipeline (hash self-consistency, size,
    /// duplicate, memory limit) in spec order, recording timing/outcome for
    /// each stage and returning on the first failure. `known_ids` is a
    /// snapshot of every id already resident in the pool, taken by the
    /// caller before this call; it is the primary "not in any bucket" check
    /// (spec §4.1, §4.8), checked ahead of the recently-seen TTL cache.
    pub async fn validate_submission(
        &self,
        tx: &Transaction,
        tx_id: TxId,
        size: u64,
        config: &Config,
        now: Instant,
        hash_service: &dyn TxHashService,
        known_ids: &HashSet<TxId>,
    ) -> Result<(), MempoolError> {
        self.timed_async(CheckKind::Hash, self.check_hash(tx, &tx_id, hash_service))
            .await?;
        self.timed(CheckKind::Size, || self.check_size(size, config.max_tx_size))?;
        self.timed(CheckKind::Duplicate, || {
            self.check_duplicate(&tx_id, now, known_ids)
        })?;
        // A transaction that alone exceeds the memory ceiling can never be
        // admitted no matter how much room cleanup/eviction frees, so this
        // check rejects it outright as `MemoryLimit`. The storage core's own
        // admission algorithm separately handles the "pool is just full
        // right now" case (cleanup, then eviction, then `PoolFull`).
        self.timed(CheckKind::MemoryLimit, || {
            self.check_memory_limit(size, config.memory_limit)
        })?;
        Ok(())
    }

    fn timed<F>(&self, kind: CheckKind, f: F) -> Result<(), MempoolError>
    where
        F: FnOnce() -> Result<(), MempoolError>,
    {
        let start = Instant::now();
        let result = f();
        self.record(kind, start.elapsed(), result.is_err());
        result
    }

    async fn timed_async(
        &self,
        kind: CheckKind,
        fut: impl std::future::Future<Output = Result<(), MempoolError>>,
    ) -> Result<(), MempoolError> {
        let start = Instant::now();
        let result = fut.await;
        self.record(kind, start.elapsed(), result.is_err());
        result
    }

    fn record(&self, kind: CheckKind, elapsed: Duration, rejected: bool) {
        let entry = self.stats.entry(kind).or_default();
        entry.attempts.fetch_add(1, AtomicOrdering::Relaxed);
        if rejected {
            entry.rejections.fetch_add(1, AtomicOrdering::Relaxed);
        }
        let sample = elapsed.as_micros() as f64;
        let mut ema = entry.ema_micros.lock();
        *ema = if *ema == 0.0 {
            sample
        } else {
            EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * *ema
        };
    }

    /// Structural check: a non-coinbase transaction must declare at least
    /// one output. Coinbase transactions are exempt (spec §4.2).
    fn check_format_inner(&self, tx: &Transaction) -> Result<(), MempoolError> {
        if tx.outputs.is_empty() {
            return Err(MempoolError::InvalidFormat("transaction has no outputs".into()));
        }
        Ok(())
    }

    async fn check_hash(
        &self,
        tx: &Transaction,
        expected: &TxId,
        hash_service: &dyn TxHashService,
    ) -> Result<(), MempoolError> {
        let valid = hash_service
            .validate_hash(tx, expected)
            .await
            .map_err(|e| MempoolError::NetworkFailure(e.to_string()))?;
        if !valid {
            return Err(MempoolError::InvalidHash);
        }
        Ok(())
    }

    fn check_size(&self, size: u64, max_tx_size: u64) -> Result<(), MempoolError> {
        if size > max_tx_size {
            return Err(MempoolError::TxTooLarge {
                size,
                max: max_tx_size,
            });
        }
        Ok(())
    }

    /// `known_ids` (everything currently resident in the pool) is checked
    /// first, unbounded by cache capacity or TTL. Falling through to the
    /// recently-seen cache catches ids that were resident recently enough to
    /// still be considered a resubmission but have since left the pool
    /// (rejected, expired, or evicted).
    fn check_duplicate(
        &self,
        tx_id: &TxId,
        now: Instant,
        known_ids: &HashSet<TxId>,
    ) -> Result<(), MempoolError> {
        if known_ids.contains(tx_id) {
            return Err(MempoolError::DuplicateTx);
        }
        let mut recent = self.recent.lock();
        if let Some(seen_at) = recent.get(tx_id) {
            if now.saturating_duration_since(*seen_at) < RECENT_TTL {
                return Err(MempoolError::DuplicateTx);
            }
        }
        recent.put(*tx_id, now);
        Ok(())
    }

    fn check_memory_limit(&self, incoming: u64, memory_limit: u64) -> Result<(), MempoolError> {
        if incoming > memory_limit {
            return Err(MempoolError::MemoryLimit);
        }
        Ok(())
    }

    /// Forgets `tx_id` from the duplicate cache, e.g. after a reject so a
    /// resubmission under a corrected hash is not spuriously blocked.
    pub fn forget(&self, tx_id: &TxId) {
        self.recent.lock().pop(tx_id);
    }

    pub fn report(&self, kind: CheckKind) -> CheckReport {
        match self.stats.get(&kind) {
            Some(stat) => CheckReport {
                attempts: stat.attempts.load(AtomicOrdering::Relaxed),
                rejections: stat.rejections.load(AtomicOrdering::Relaxed),
                ema_latency: Duration::from_micros(*stat.ema_micros.lock() as u64),
            },
            None => CheckReport {
                attempts: 0,
                rejections: 0,
                ema_latency: Duration::ZERO,
            },
        }
    }

    pub fn all_reports(&self) -> Vec<(CheckKind, CheckReport)> {
        [
            CheckKind::Format,
            CheckKind::Hash,
            CheckKind::Size,
            CheckKind::Duplicate,
            CheckKind::MemoryLimit,
        ]
        .into_iter()
        .map(|k| (k, self.report(k)))
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::Sha256HashService;
    use crate::types::{TxOutput, TxInput, OutPoint};

    fn sample_tx() -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    tx_id: TxId([9u8; 32]),
                    output_index: 0,
                },
                is_reference_only: false,
            }],
            outputs: vec![TxOutput { payload: vec![1, 2, 3] }],
            nonce: 1,
            metadata: vec![],
            fee_mechanism: 1000,
        }
    }

    #[test]
    fn accepts_well_formed_format() {
        let validator = Validator::new(100);
        let tx = sample_tx();
        assert!(validator.check_format(&tx).is_ok());
        assert_eq!(validator.report(CheckKind::Format).attempts, 1);
    }

    #[tokio::test]
    async fn accepts_well_formed_unique_transaction() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let config = Config::default();
        let now = Instant::now();

        validator.check_format(&tx).unwrap();
        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &HashSet::new())
            .await;
        assert!(result.is_ok());
    }

    #[test]
    fn rejects_empty_outputs_as_invalid_format() {
        let validator = Validator::new(100);
        let mut tx = sample_tx();
        tx.outputs.clear();

        let result = validator.check_format(&tx);
        assert_eq!(result, Err(MempoolError::InvalidFormat("transaction has no outputs".into())));
    }

    #[tokio::test]
    async fn rejects_oversized_transaction() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let mut config = Config::default();
        config.max_tx_size = 10;
        let now = Instant::now();

        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &HashSet::new())
            .await;
        assert_eq!(result, Err(MempoolError::TxTooLarge { size: 100, max: 10 }));
    }

    #[tokio::test]
    async fn rejects_second_submission_of_same_id() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let config = Config::default();
        let now = Instant::now();

        validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &HashSet::new())
            .await
            .unwrap();
        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &HashSet::new())
            .await;
        assert_eq!(result, Err(MempoolError::DuplicateTx));
    }

    #[tokio::test]
    async fn rejects_known_id_already_resident_in_pool() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let config = Config::default();
        let now = Instant::now();
        let mut known_ids = HashSet::new();
        known_ids.insert(tx_id);

        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &known_ids)
            .await;
        assert_eq!(result, Err(MempoolError::DuplicateTx));
    }

    #[tokio::test]
    async fn duplicate_cache_entry_expires_after_ttl() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let config = Config::default();
        let first_seen = Instant::now();

        validator
            .validate_submission(&tx, tx_id, 100, &config, first_seen, &hash_service, &HashSet::new())
            .await
            .unwrap();
        let after_ttl = first_seen + RECENT_TTL + Duration::from_secs(1);
        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, after_ttl, &hash_service, &HashSet::new())
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn rejects_when_memory_limit_would_be_exceeded() {
        let validator = Validator::new(100);
        let hash_service = Sha256HashService;
        let tx = sample_tx();
        let (tx_id, _) = hash_service.compute_hash(&tx).await.unwrap();
        let mut config = Config::default();
        config.memory_limit = 50;
        let now = Instant::now();

        let result = validator
            .validate_submission(&tx, tx_id, 100, &config, now, &hash_service, &HashSet::new())
            .await;
        assert_eq!(result, Err(MempoolError::MemoryLimit));
    }
}
