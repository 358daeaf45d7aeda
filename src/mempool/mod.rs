//! The mempool core (spec §4.1, §5): a single in-process, priority-ordered
//! store of UTXO-model transactions moving through the lifecycle FSM
//! (Pending → Mining → PendingConfirm → Confirmed, with Rejected/Expired
//! sinks). All mutating operations funnel through one
//! `parking_lot::RwLock<MempoolInner>` guarding the primary map, the
//! priority heap, the conflict index, the quota protector, and the live
//! counters together, so a reader never observes them partway updated.
//!
//! Async port calls (hash computation, compliance checks) are always made
//! *before* acquiring that lock, never while holding it — ports may call
//! out to other services, and holding a sync lock across an `.await` would
//! stall every other operation on the pool for the duration of that call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::conflict::{BatchGuard, ConflictIndex};
use crate::config::Config;
use crate::dependency;
use crate::error::{MempoolError, Result};
use crate::eviction::{EvictionPolicy, HybridPolicy};
use crate::heap::IndexedHeap;
use crate::maintenance::{self, MaintenanceHandle};
use crate::metrics::{self, HealthReport, PoolMetrics, PoolSnapshot, UsageReport};
use crate::ports::{AllowAllCompliance, AllowAllWriteGate, CompliancePolicy, EventSink, BlobStore, NoopEventSink, TxHashService, WriteGate};
use crate::priority::{compute_priority, estimate_fee};
use crate::protector::{QuotaProtector, ALL_SOURCES};
use crate::snapshot;
use crate::types::{classify_tx, Transaction, TxEntry, TxId, TxStatus};
use crate::validator::Validator;

/// State guarded by the single write-discipline lock (spec §5).
struct MempoolInner {
    entries: HashMap<TxId, TxEntry>,
    heap: IndexedHeap,
    conflict: ConflictIndex,
    protector: QuotaProtector,
    sources: HashMap<TxId, String>,
    snapshot: PoolSnapshot,
    config: Config,
}

impl MempoolInner {
    fn new(config: Config) -> Self {
        Self {
            entries: HashMap::new(),
            heap: IndexedHeap::new(),
            conflict: ConflictIndex::new(),
            protector: QuotaProtector::new(0, config.max_size),
            sources: HashMap::new(),
            snapshot: PoolSnapshot::default(),
            config,
        }
    }

    fn pending_entries(&self) -> Vec<&TxEntry> {
        self.entries
            .values()
            .filter(|e| e.status == TxStatus::Pending)
            .collect()
    }

    fn live_entries(&self) -> Vec<&TxEntry> {
        self.entries
            .values()
            .filter(|e| matches!(e.status, TxStatus::Pending | TxStatus::Mining | TxStatus::PendingConfirm))
            .collect()
    }

    /// Recomputes `dependent_count` for every Pending entry from the current
    /// in-pool dependency graph (spec §4.4). Run after any admission or
    /// removal that touches the Pending set.
    fn refresh_dependents(&mut self) {
        let refs: Vec<&TxEntry> = self.pending_entries();
        if refs.is_empty() {
            return;
        }
        let resolution = dependency::resolve(&refs);
        for (id, count) in resolution.dependent_counts {
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.dependent_count = count;
            }
        }
    }

    /// Evicts Pending entries (via the hybrid policy) until at least
    /// `required_bytes` have been freed, or candidates are exhausted.
    /// Returns the evicted ids. Eviction runs only after expiration
    /// cleanup has already failed to free enough space (spec §4.3).
    fn evict_to_free(&mut self, required_bytes: u64, now: Instant) -> Vec<TxId> {
        let policy = HybridPolicy::new(self.config.lifetime);
        let refs: Vec<&TxEntry> = self.pending_entries();
        if refs.is_empty() {
            return Vec::new();
        }
        let locals: HashSet<TxId> = if self.config.keep_locals {
            self.sources
                .iter()
                .filter(|(_, source)| source.as_str() == "local")
                .map(|(id, _)| *id)
                .collect()
        } else {
            HashSet::new()
        };
        let victims = policy.select_to_evict(&refs, required_bytes, now, &locals);
        for id in &victims {
            self.remove_entry(id);
        }
        if !victims.is_empty() {
            self.refresh_dependents();
        }
        victims
    }

    /// Walks Pending looking for entries whose age exceeds `config.lifetime`
    /// and moves each to Expired: removed from the heap and conflict index,
    /// protector count decremented, but retained in `entries` for
    /// observability (spec §4.6, §4.10). Returns the expired ids.
    fn expire_stale(&mut self, now: Instant) -> Vec<TxId> {
        let lifetime = self.config.lifetime;
        let stale: Vec<TxId> = self
            .pending_entries()
            .into_iter()
            .filter(|e| e.age(now) > lifetime)
            .map(|e| e.tx_id)
            .collect();
        for id in &stale {
            if let Some(entry) = self.entries.get(id) {
                let tx = entry.tx.clone();
                self.heap.remove(id);
                self.conflict.remove(&tx);
            }
            self.protector.remove(ALL_SOURCES);
            if let Some(entry) = self.entries.get_mut(id) {
                entry.status = TxStatus::Expired;
                entry.heap_index = -1;
            }
            self.snapshot.record(TxStatus::Pending, -1);
            self.snapshot.record(TxStatus::Expired, 1);
        }
        if !stale.is_empty() {
            self.refresh_dependents();
        }
        stale
    }

    /// Recomputes priority for every Pending entry and fixes its heap
    /// position (spec §4.2's 5-minute recompute, run by the cleanup tick).
    fn recompute_pending_priorities(&mut self, now: Instant) {
        let price_limit = self.config.price_limit;
        let ids: Vec<TxId> = self.pending_entries().into_iter().map(|e| e.tx_id).collect();
        for id in ids {
            let Some(entry) = self.entries.get(&id) else { continue };
            let fee = estimate_fee(&entry.tx, entry.size, price_limit);
            let priority = compute_priority(fee, entry.size, entry.tx_type, entry.received_at, now);
            self.heap.fix(&id, priority);
            if let Some(entry) = self.entries.get_mut(&id) {
                entry.priority = priority;
                entry.heap_index = self.heap.position(&id).map(|p| p as isize).unwrap_or(-1);
            }
        }
    }

    /// Unconditionally removes an entry and keeps the heap/conflict/
    /// protector/snapshot/byte-count bookkeeping consistent. Does not
    /// refresh dependents (batched by the caller).
    fn remove_entry(&mut self, tx_id: &TxId) -> Option<TxEntry> {
        let entry = self.entries.remove(tx_id)?;
        if entry.status == TxStatus::Pending {
            self.heap.remove(tx_id);
            self.conflict.remove(&entry.tx);
        }
        self.sources.remove(tx_id);
        if matches!(entry.status, TxStatus::Pending | TxStatus::Mining | TxStatus::PendingConfirm) {
            self.protector.remove(ALL_SOURCES);
        }
        self.snapshot.record(entry.status, -1);
        self.snapshot.total_bytes = self.snapshot.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    /// Pending → Mining. Returns `true` on success; any other current status
    /// is a silent no-op (spec §4.6).
    fn mark_mining_one(&mut self, tx_id: &TxId) -> bool {
        let Some(entry) = self.entries.get(tx_id) else { return false };
        if entry.status != TxStatus::Pending {
            debug!(tx_id = %tx_id, from = entry.status.as_str(), to = "mining", "ignored invalid lifecycle transition");
            return false;
        }
        let tx = entry.tx.clone();
        self.heap.remove(tx_id);
        self.conflict.remove(&tx);
        let entry = self.entries.get_mut(tx_id).expect("checked above");
        entry.status = TxStatus::Mining;
        entry.heap_index = -1;
        self.snapshot.record(TxStatus::Pending, -1);
        self.snapshot.record(TxStatus::Mining, 1);
        true
    }

    /// Mining → PendingConfirm. Returns `true` on success; any other current
    /// status is a silent no-op (spec §4.6).
    fn mark_pending_confirm_one(&mut self, tx_id: &TxId) -> bool {
        let Some(entry) = self.entries.get_mut(tx_id) else { return false };
        if entry.status != TxStatus::Mining {
            debug!(tx_id = %tx_id, from = entry.status.as_str(), to = "pending_confirm", "ignored invalid lifecycle transition");
            return false;
        }
        entry.status = TxStatus::PendingConfirm;
        self.snapshot.record(TxStatus::Mining, -1);
        self.snapshot.record(TxStatus::PendingConfirm, 1);
        true
    }

    /// {Mining, Pending, PendingConfirm} → Confirmed: the entry is fully
    /// deleted, memory reclaimed (spec §4.6). Returns the removed entry, or
    /// `None` if the id is missing or not in a confirmable status.
    fn confirm_one(&mut self, tx_id: &TxId) -> Option<TxEntry> {
        let status = self.entries.get(tx_id)?.status;
        if !matches!(status, TxStatus::Mining | TxStatus::Pending | TxStatus::PendingConfirm) {
            debug!(tx_id = %tx_id, from = status.as_str(), to = "confirmed", "ignored invalid lifecycle transition");
            return None;
        }
        self.remove_entry(tx_id)
    }

    /// Mining → Pending requeue: resets `received_at`, recomputes priority,
    /// and re-inserts into the heap/conflict index (spec §4.1's reject
    /// algorithm). Any other current status is a silent no-op. Returns the
    /// restored entry on success.
    fn reject_one(&mut self, tx_id: &TxId, now: Instant) -> Option<TxEntry> {
        let entry = self.entries.get(tx_id)?;
        if entry.status != TxStatus::Mining {
            debug!(tx_id = %tx_id, from = entry.status.as_str(), to = "pending (reject)", "ignored invalid lifecycle transition");
            return None;
        }
        let tx = entry.tx.clone();
        let size = entry.size;
        let tx_type = entry.tx_type;
        let fee = estimate_fee(&tx, size, self.config.price_limit);
        let priority = compute_priority(fee, size, tx_type, now, now);

        self.conflict.insert(*tx_id, &tx);
        self.heap.push(*tx_id, priority, now);
        let heap_index = self.heap.position(tx_id).map(|p| p as isize).unwrap_or(-1);

        let entry = self.entries.get_mut(tx_id).expect("checked above");
        entry.status = TxStatus::Pending;
        entry.received_at = now;
        entry.priority = priority;
        entry.heap_index = heap_index;
        self.snapshot.record(TxStatus::Mining, -1);
        self.snapshot.record(TxStatus::Pending, 1);
        Some(entry.clone())
    }

    /// Administrative Pending → Rejected (spec §4.6's `update_status`).
    /// Removed from the heap/conflict index and protector count, but
    /// retained in `entries` for observability until `reset` or overwritten
    /// by a later admission under the same id. Any other transition is a
    /// silent no-op.
    fn update_status_one(&mut self, tx_id: &TxId, to: TxStatus) -> bool {
        let Some(entry) = self.entries.get(tx_id) else { return false };
        if entry.status != TxStatus::Pending || to != TxStatus::Rejected {
            debug!(tx_id = %tx_id, from = entry.status.as_str(), to = to.as_str(), "update_status ignored: not a permitted administrative transition");
            return false;
        }
        let tx = entry.tx.clone();
        self.heap.remove(tx_id);
        self.conflict.remove(&tx);
        self.protector.remove(ALL_SOURCES);
        let entry = self.entries.get_mut(tx_id).expect("checked above");
        entry.status = TxStatus::Rejected;
        entry.heap_index = -1;
        self.snapshot.record(TxStatus::Pending, -1);
        self.snapshot.record(TxStatus::Rejected, 1);
        true
    }

    /// Derived occupancy figures for a metrics tick (spec §4.10).
    fn usage_report(&self, now: Instant) -> UsageReport {
        let total_bytes = self.snapshot.total_bytes;
        let live = self.snapshot.total_live();
        let memory_mb = total_bytes as f64 / (1024.0 * 1024.0);
        let limit_mb = self.config.memory_limit as f64 / (1024.0 * 1024.0);
        let usage_pct = if self.config.memory_limit > 0 {
            total_bytes as f64 / self.config.memory_limit as f64 * 100.0
        } else {
            0.0
        };
        let capacity_pct = if self.config.max_size > 0 {
            live as f64 / self.config.max_size as f64 * 100.0
        } else {
            0.0
        };
        let avg_tx_size = if live > 0 { total_bytes as f64 / live as f64 } else { 0.0 };

        let (oldest_age, sum_age, count) = self.live_entries().into_iter().fold(
            (Duration::ZERO, Duration::ZERO, 0u32),
            |(oldest, sum, count), e| {
                let age = e.age(now);
                (oldest.max(age), sum + age, count + 1)
            },
        );
        let average_age = if count > 0 { sum_age / count } else { Duration::ZERO };

        UsageReport {
            memory_mb,
            limit_mb,
            usage_pct,
            capacity_pct,
            avg_tx_size,
            total_tx_size: total_bytes,
            oldest_age,
            average_age,
        }
    }
}

/// The transaction mempool. Cheap to wrap in an `Arc` and share across
/// tasks; every method takes `&self`.
pub struct Mempool {
    inner: RwLock<MempoolInner>,
    hash_service: Arc<dyn TxHashService>,
    compliance: Arc<dyn CompliancePolicy>,
    write_gate: RwLock<Arc<dyn WriteGate>>,
    event_sink: RwLock<Arc<dyn EventSink>>,
    persistent_store: RwLock<Option<Arc<dyn BlobStore>>>,
    validator: Validator,
    metrics: PoolMetrics,
    closed: AtomicBool,
    running: AtomicBool,
    maintenance: AsyncMutex<Option<MaintenanceHandle>>,
}

const RECENT_CACHE_CAPACITY: usize = 50_000;

impl Mempool {
    /// Builds a new, empty mempool. `hash_service` is mandatory (spec §6:
    /// "missing dependency" is a construction-time error); `compliance` and
    /// `write_gate` default to allow-all when not supplied explicitly via
    /// [`Mempool::with_ports`].
    pub fn new(config: Config, hash_service: Arc<dyn TxHashService>) -> Result<Self> {
        Self::with_ports(config, hash_service, Arc::new(AllowAllCompliance), Arc::new(AllowAllWriteGate))
    }

    pub fn with_ports(
        config: Config,
        hash_service: Arc<dyn TxHashService>,
        compliance: Arc<dyn CompliancePolicy>,
        write_gate: Arc<dyn WriteGate>,
    ) -> Result<Self> {
        config.validate().map_err(MempoolError::InvalidConfig)?;
        Ok(Self {
            inner: RwLock::new(MempoolInner::new(config)),
            hash_service,
            compliance,
            write_gate: RwLock::new(write_gate),
            event_sink: RwLock::new(Arc::new(NoopEventSink)),
            persistent_store: RwLock::new(None),
            validator: Validator::new(RECENT_CACHE_CAPACITY),
            metrics: PoolMetrics::new(),
            closed: AtomicBool::new(false),
            running: AtomicBool::new(false),
            maintenance: AsyncMutex::new(None),
        })
    }

    pub fn set_event_sink(&self, sink: Arc<dyn EventSink>) {
        *self.event_sink.write() = sink;
    }

    pub fn set_write_gate(&self, gate: Arc<dyn WriteGate>) {
        *self.write_gate.write() = gate;
    }

    pub fn set_persistent_store(&self, store: Arc<dyn BlobStore>) {
        *self.persistent_store.write() = Some(store);
    }

    /// Replaces the effective configuration after re-validating it. Rebuilds
    /// the protector's live-entry accounting from scratch, then — if the new
    /// `memory_limit` is now below current usage — runs cleanup and, if
    /// still over, eviction in the same critical section.
    pub fn update_config(&self, config: Config) -> Result<()> {
        config.validate().map_err(MempoolError::InvalidConfig)?;
        let now = Instant::now();
        let (expired_ids, evicted_ids, pool_snapshot) = {
            let mut inner = self.inner.write();

            let mut protector = QuotaProtector::new(0, config.max_size);
            let live_count = inner.live_entries().len();
            for _ in 0..live_count {
                protector.add(ALL_SOURCES);
            }
            inner.protector = protector;
            inner.config = config;

            let mut expired_ids = Vec::new();
            let mut evicted_ids = Vec::new();
            if inner.snapshot.total_bytes > inner.config.memory_limit {
                expired_ids = inner.expire_stale(now);
                if inner.snapshot.total_bytes > inner.config.memory_limit {
                    let required = inner.snapshot.total_bytes - inner.config.memory_limit;
                    evicted_ids = inner.evict_to_free(required, now);
                }
            }
            (expired_ids, evicted_ids, inner.snapshot)
        };

        if !expired_ids.is_empty() || !evicted_ids.is_empty() {
            let sink = self.event_sink();
            for id in &expired_ids {
                self.metrics.record_expired();
                sink.on_expired(id);
                sink.on_removed(id);
            }
            if !evicted_ids.is_empty() {
                self.metrics.record_evicted(evicted_ids.len() as u64);
                for id in &evicted_ids {
                    sink.on_removed(id);
                }
            }
            sink.on_pool_state_changed(&pool_snapshot);
        }
        Ok(())
    }

    fn event_sink(&self) -> Arc<dyn EventSink> {
        self.event_sink.read().clone()
    }

    /// Loads a previously saved snapshot (spec §4.9) into an empty pool.
    /// Call before [`Mempool::start`]. A missing or unreadable snapshot is
    /// not an error (see [`crate::snapshot::restore`]). Entries past their
    /// lifetime are discarded and surviving entries are re-scored by
    /// `restore` itself; `memory_usage` is finally overwritten from the
    /// snapshot's own declared total to preserve reported totals.
    pub async fn load_snapshot(&self) -> Result<usize> {
        let store = self.persistent_store.read().clone();
        let Some(store) = store else {
            return Ok(0);
        };
        let now = Instant::now();
        let live_config = self.inner.read().config.clone();
        let restored = snapshot::restore(store.as_ref(), &live_config, now).await;
        let memory_usage = restored.memory_usage;

        let mut inner = self.inner.write();
        let count = restored.entries.len();
        for mut entry in restored.entries {
            if inner.entries.contains_key(&entry.tx_id) {
                continue;
            }
            inner.conflict.insert(entry.tx_id, &entry.tx);
            inner.heap.push(entry.tx_id, entry.priority, entry.received_at);
            entry.heap_index = inner.heap.position(&entry.tx_id).map(|p| p as isize).unwrap_or(-1);
            inner.sources.insert(entry.tx_id, "restored".to_string());
            inner.protector.add(ALL_SOURCES);
            inner.snapshot.record(entry.status, 1);
            inner.entries.insert(entry.tx_id, entry);
        }
        inner.refresh_dependents();
        inner.snapshot.total_bytes = memory_usage;
        Ok(count)
    }

    /// Starts the background maintenance loop (cleanup/health/metrics
    /// tickers). Errors with `AlreadyRunning` if already started.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, AtomicOrdering::AcqRel) {
            return Err(MempoolError::AlreadyRunning);
        }
        let (metrics_enabled, metrics_interval) = {
            let inner = self.inner.read();
            (inner.config.metrics_enabled, inner.config.metrics_interval)
        };
        let handle = maintenance::spawn(self.clone(), metrics_enabled, metrics_interval);
        // The mutex is only contended at start/stop, never on the hot path;
        // try_lock is safe here because nothing else touches it this early.
        if let Ok(mut slot) = self.maintenance.try_lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    /// Stops the background maintenance loop. Errors with `NotRunning` if
    /// not currently started. `close()` alone does not stop this loop; a
    /// caller that wants the task to end should call both.
    pub async fn stop(&self) -> Result<()> {
        if !self.running.swap(false, AtomicOrdering::AcqRel) {
            return Err(MempoolError::NotRunning);
        }
        if let Some(handle) = self.maintenance.lock().await.take() {
            handle.stop().await;
        }
        Ok(())
    }

    /// Permanently closes the pool: all subsequent mutating operations
    /// return `PoolClosed`. Idempotent — a second or later call is a no-op
    /// and still returns `Ok(())` (spec §7, §8 property P8).
    pub fn close(&self) -> Result<()> {
        self.closed.store(true, AtomicOrdering::Release);
        Ok(())
    }

    /// Clears all entries back to an empty pool, preserving the current
    /// configuration. Always succeeds, even on a closed pool — `reset` has
    /// no error column in the operations table (spec §4.1).
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.write();
        let config = inner.config.clone();
        *inner = MempoolInner::new(config);
        Ok(())
    }

    fn guard_write(&self, op_name: &str) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(MempoolError::PoolClosed);
        }
        if let Err(reason) = self.write_gate.read().assert_write_allowed(op_name) {
            warn!(op = op_name, reason, "write gate denied operation");
            return Err(MempoolError::NotRunning);
        }
        Ok(())
    }

    /// Validates, scores, and admits a transaction as Pending (spec §4.1's
    /// admission algorithm): closed check, format, compliance, hash
    /// compute + self-consistency, size, duplicate, UTXO conflict, memory
    /// pressure (cleanup then eviction), protector quota, insert. `source`
    /// identifies the submitter for quota and eviction-preference purposes
    /// (e.g. a peer id, or `"local"`); quota accounting itself is tracked
    /// under the single synthetic source `"all"` (spec §4.7 — per-source
    /// quotas are a planned extension).
    pub async fn submit(&self, tx: Transaction, source: &str) -> Result<TxId> {
        self.guard_write("submit")?;

        // Format is checked standalone, ahead of compliance and hashing, so
        // a structurally invalid transaction is rejected before either cost
        // is paid (spec §4.1 step 2's format -> compliance -> hash order).
        self.validator.check_format(&tx)?;

        let decision = self
            .compliance
            .check_transaction(&tx, source)
            .await
            .map_err(|e| MempoolError::NetworkFailure(e.to_string()))?;
        if !decision.allowed {
            return Err(MempoolError::ComplianceViolation(
                decision
                    .reason
                    .unwrap_or_else(|| "compliance policy denied transaction".to_string()),
            ));
        }

        let (tx_id, hash_valid) = self
            .hash_service
            .compute_hash(&tx)
            .await
            .map_err(|e| MempoolError::NetworkFailure(e.to_string()))?;
        if !hash_valid {
            return Err(MempoolError::InvalidHash);
        }

        let size = tx.estimated_size();
        let (config_snapshot, known_ids) = {
            let inner = self.inner.read();
            (inner.config.clone(), inner.entries.keys().copied().collect::<HashSet<TxId>>())
        };
        let now = Instant::now();

        self.validator
            .validate_submission(&tx, tx_id, size, &config_snapshot, now, self.hash_service.as_ref(), &known_ids)
            .await?;

        let mut expired_ids = Vec::new();
        let mut evicted_ids = Vec::new();
        let (entry, pool_snapshot) = {
            let mut inner = self.inner.write();
            if self.closed.load(AtomicOrdering::Acquire) {
                return Err(MempoolError::PoolClosed);
            }
            if inner.entries.contains_key(&tx_id) {
                return Err(MempoolError::TxExists);
            }
            if inner.conflict.find_conflict(&tx).is_some() {
                return Err(MempoolError::UtxoConflict);
            }

            if inner.snapshot.total_bytes.saturating_add(size) > inner.config.memory_limit {
                expired_ids = inner.expire_stale(now);
                if inner.snapshot.total_bytes.saturating_add(size) > inner.config.memory_limit {
                    let required = (inner.snapshot.total_bytes + size).saturating_sub(inner.config.memory_limit);
                    evicted_ids = inner.evict_to_free(required, now);
                    if inner.snapshot.total_bytes.saturating_add(size) > inner.config.memory_limit {
                        return Err(MempoolError::PoolFull);
                    }
                }
            }

            if !inner.protector.check(ALL_SOURCES) {
                return Err(MempoolError::PoolFull);
            }

            let tx_type = classify_tx(&tx);
            let estimated_fee = estimate_fee(&tx, size, inner.config.price_limit);
            let priority = compute_priority(estimated_fee, size, tx_type, now, now);

            let mut entry = TxEntry {
                tx_id,
                tx: tx.clone(),
                received_at: now,
                status: TxStatus::Pending,
                priority,
                size,
                tx_type,
                dependent_count: 0,
                heap_index: -1,
            };

            inner.conflict.insert(tx_id, &tx);
            inner.heap.push(tx_id, priority, now);
            entry.heap_index = inner.heap.position(&tx_id).map(|p| p as isize).unwrap_or(-1);
            inner.protector.add(ALL_SOURCES);
            inner.sources.insert(tx_id, source.to_string());
            inner.snapshot.record(TxStatus::Pending, 1);
            inner.snapshot.total_bytes += size;
            inner.entries.insert(tx_id, entry.clone());
            inner.refresh_dependents();
            let entry = inner.entries.get(&tx_id).cloned().unwrap_or(entry);

            (entry, inner.snapshot)
        };

        let sink = self.event_sink();
        for id in &expired_ids {
            self.metrics.record_expired();
            sink.on_expired(id);
            sink.on_removed(id);
        }
        if !evicted_ids.is_empty() {
            self.metrics.record_evicted(evicted_ids.len() as u64);
            for id in &evicted_ids {
                sink.on_removed(id);
            }
        }
        self.metrics.record_submitted();
        sink.on_added(&entry);
        sink.on_pool_state_changed(&pool_snapshot);

        Ok(tx_id)
    }

    pub fn get(&self, tx_id: &TxId) -> Option<TxEntry> {
        self.inner.read().entries.get(tx_id).cloned()
    }

    pub fn status(&self, tx_id: &TxId) -> Result<TxStatus> {
        self.inner
            .read()
            .entries
            .get(tx_id)
            .map(|e| e.status)
            .ok_or(MempoolError::TxNotFound)
    }

    /// Removes an entry outright, regardless of its current status, e.g. for
    /// operator-driven cleanup. Not a lifecycle transition.
    pub fn remove(&self, tx_id: &TxId) -> Result<()> {
        self.guard_write("remove")?;
        let mut inner = self.inner.write();
        let entry = inner.remove_entry(tx_id).ok_or(MempoolError::TxNotFound)?;
        inner.refresh_dependents();
        drop(inner);
        self.validator.forget(&entry.tx_id);
        self.event_sink().on_removed(&entry.tx_id);
        Ok(())
    }

    /// Pending → Mining, for each id in `ids`. Ids not currently Pending are
    /// silently skipped (spec §4.6).
    pub fn mark_mining(&self, ids: &[TxId]) -> Result<()> {
        self.guard_write("mark_mining")?;
        let mut inner = self.inner.write();
        for id in ids {
            inner.mark_mining_one(id);
        }
        Ok(())
    }

    /// Mining → PendingConfirm, for each id in `ids`. `height` identifies the
    /// block the miner produced containing these transactions; it is not
    /// stored on the entry (no operation's observable behavior reads it back
    /// before `confirm`), only logged for traceability.
    pub fn mark_pending_confirm(&self, ids: &[TxId], height: u64) -> Result<()> {
        self.guard_write("mark_pending_confirm")?;
        let mut inner = self.inner.write();
        for id in ids {
            inner.mark_pending_confirm_one(id);
        }
        drop(inner);
        debug!(count = ids.len(), height, "transactions moved to pending_confirm");
        Ok(())
    }

    /// {Mining, Pending, PendingConfirm} → Confirmed, for each id in `ids`.
    /// Confirmed entries are deleted outright; missing ids are silently
    /// skipped (spec §4.1).
    pub fn confirm(&self, ids: &[TxId], height: u64) -> Result<()> {
        self.guard_write("confirm")?;
        let mut confirmed = Vec::new();
        {
            let mut inner = self.inner.write();
            for id in ids {
                if let Some(entry) = inner.confirm_one(id) {
                    confirmed.push(entry);
                }
            }
        }
        if !confirmed.is_empty() {
            let sink = self.event_sink();
            for entry in &confirmed {
                self.metrics.record_confirmed();
                self.validator.forget(&entry.tx_id);
                sink.on_confirmed(&entry.tx_id, height);
            }
        }
        Ok(())
    }

    /// Mining → Pending requeue, for each id in `ids`: `received_at` is
    /// reset and priority recomputed. Ids in any other status are left
    /// unchanged, not an error (spec §4.1, §9).
    pub fn reject(&self, ids: &[TxId]) -> Result<()> {
        self.guard_write("reject")?;
        let now = Instant::now();
        let mut restored = Vec::new();
        {
            let mut inner = self.inner.write();
            for id in ids {
                if let Some(entry) = inner.reject_one(id, now) {
                    restored.push(entry);
                }
            }
            if !restored.is_empty() {
                inner.refresh_dependents();
            }
        }
        if !restored.is_empty() {
            let sink = self.event_sink();
            for entry in &restored {
                sink.on_added(entry);
            }
        }
        Ok(())
    }

    /// Administrative Pending → Rejected transition (spec §4.6). Distinct
    /// from [`Mempool::reject`], which requeues Mining entries back to
    /// Pending. Any other current status is a silent no-op.
    pub fn update_status(&self, tx_id: &TxId, to: TxStatus) -> Result<()> {
        self.guard_write("update_status")?;
        let mut inner = self.inner.write();
        if inner.update_status_one(tx_id, to) {
            drop(inner);
            self.metrics.record_rejected();
        }
        Ok(())
    }

    /// Expires stale Pending entries whose age exceeds `config.lifetime`,
    /// then recomputes priority for every remaining Pending entry and fixes
    /// its heap position (spec §4.2, §4.10). Called by the maintenance
    /// loop; also safe to call directly.
    pub fn run_cleanup(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut inner = self.inner.write();
            let expired = inner.expire_stale(now);
            inner.recompute_pending_priorities(now);
            expired
        };
        if !expired.is_empty() {
            let sink = self.event_sink();
            for id in &expired {
                self.metrics.record_expired();
                sink.on_expired(id);
                sink.on_removed(id);
            }
        }
        expired.len()
    }

    /// Returns up to `max_n` Pending entries, in priority order, whose
    /// cumulative size does not exceed `max_bytes`, excluding any id present
    /// in `excluded`. Read-only; for inspection/browsing.
    pub fn select_pending(&self, max_n: usize, max_bytes: u64, excluded: &[TxId]) -> Result<Vec<TxEntry>> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(MempoolError::PoolClosed);
        }
        let excluded: HashSet<TxId> = excluded.iter().copied().collect();
        let inner = self.inner.read();
        let mut candidates: Vec<&TxEntry> = inner
            .pending_entries()
            .into_iter()
            .filter(|e| !excluded.contains(&e.tx_id))
            .collect();
        candidates.sort_by(|a, b| crate::types::heap_order(a, b));

        let mut result = Vec::new();
        let mut total_bytes = 0u64;
        for entry in candidates.drain(..) {
            if result.len() >= max_n {
                break;
            }
            if total_bytes.saturating_add(entry.size) > max_bytes {
                continue;
            }
            total_bytes += entry.size;
            result.push(entry.clone());
        }
        Ok(result)
    }

    /// Returns up to `limit` ids from the current Pending set in
    /// dependency-then-priority order (spec §4.4). Always succeeds, even on
    /// a closed pool — there is no error column for this operation.
    pub fn select_by_dependency(&self, limit: usize) -> Vec<TxId> {
        let inner = self.inner.read();
        let candidates = inner.pending_entries();
        let order = dependency::resolve(&candidates).order;
        order.into_iter().take(limit).collect()
    }

    /// Selects a dependency-ordered, conflict-free batch of Pending
    /// transactions respecting the configured mining caps (spec §4.1, §4.4,
    /// §4.5). Read-only: selected entries are NOT transitioned to Mining —
    /// callers that intend to mine the returned batch must follow up with
    /// an explicit [`Mempool::mark_mining`] call (spec §8 scenario S5).
    pub async fn select_for_mining(&self) -> Result<Vec<TxEntry>> {
        if self.closed.load(AtomicOrdering::Acquire) {
            return Err(MempoolError::PoolClosed);
        }
        let (config, candidates) = {
            let inner = self.inner.read();
            let mut candidates: Vec<TxEntry> = inner.pending_entries().into_iter().cloned().collect();
            candidates.sort_by(|a, b| crate::types::heap_order(a, b));
            (inner.config.clone(), candidates)
        };
        let max_txs = config.mining.max_transactions_for_mining;
        let max_bytes = config.mining.max_block_size_for_mining;
        // No pre-truncation here: `dependency::resolve` below must see every
        // Pending entry that passed compliance, or an in-pool parent ranked
        // outside a truncated window would be silently dropped from the
        // graph, letting its child be selected with no ancestor present.

        let mut passed = Vec::with_capacity(candidates.len());
        for entry in candidates {
            match self.compliance.check_transaction(&entry.tx, "mempool").await {
                Ok(decision) if decision.allowed => passed.push(entry),
                Ok(_) => continue,
                Err(e) => {
                    warn!(tx_id = %entry.tx_id, error = %e, "compliance re-check failed during mining selection; excluding candidate");
                    continue;
                }
            }
        }

        let refs: Vec<&TxEntry> = passed.iter().collect();
        let ordered_ids = dependency::resolve(&refs).order;
        let by_id: HashMap<TxId, &TxEntry> = passed.iter().map(|e| (e.tx_id, e)).collect();

        let mut guard = BatchGuard::new();
        let mut selected = Vec::new();
        let mut total_bytes = 0u64;
        for id in ordered_ids {
            if selected.len() >= max_txs {
                break;
            }
            let Some(entry) = by_id.get(&id) else { continue };
            if total_bytes.saturating_add(entry.size) > max_bytes {
                continue;
            }
            if !guard.try_accept(&entry.tx) {
                continue;
            }
            total_bytes += entry.size;
            selected.push((*entry).clone());
        }
        Ok(selected)
    }

    /// Assembles a health report from current occupancy, lifetime counters,
    /// and the validator's per-check breakdown, plus the four unhealthy
    /// thresholds (spec §4.10).
    pub fn health_report(&self) -> HealthReport {
        let (snapshot, memory_limit, max_size) = {
            let inner = self.inner.read();
            (inner.snapshot, inner.config.memory_limit, inner.config.max_size)
        };
        let metrics_snapshot = self.metrics.snapshot();
        let (healthy, reasons) = metrics::evaluate_health(&snapshot, &metrics_snapshot, memory_limit, max_size);
        HealthReport {
            snapshot,
            metrics: metrics_snapshot,
            checks: self
                .validator
                .all_reports()
                .into_iter()
                .map(|(kind, report)| (kind.as_str().to_string(), report))
                .collect(),
            running: self.running.load(AtomicOrdering::Acquire),
            healthy,
            reasons,
        }
    }

    /// Logs the per-tick metrics summary, pushes the current snapshot to the
    /// event sink, and — if a persistent store is attached — saves a fresh
    /// snapshot blob (spec §4.9, §4.10).
    pub async fn emit_metrics(&self) {
        let now = Instant::now();
        let (snapshot, usage) = {
            let inner = self.inner.read();
            (inner.snapshot, inner.usage_report(now))
        };
        info!(
            pending = snapshot.pending,
            mining = snapshot.mining,
            pending_confirm = snapshot.pending_confirm,
            confirmed = snapshot.confirmed,
            rejected = snapshot.rejected,
            expired = snapshot.expired,
            memory_mb = usage.memory_mb,
            limit_mb = usage.limit_mb,
            usage_pct = usage.usage_pct,
            capacity_pct = usage.capacity_pct,
            avg_tx_size = usage.avg_tx_size,
            total_tx_size = usage.total_tx_size,
            oldest_age_secs = usage.oldest_age.as_secs_f64(),
            average_age_secs = usage.average_age.as_secs_f64(),
            "mempool metrics"
        );
        self.event_sink().on_pool_state_changed(&snapshot);
        if self.persistent_store.read().is_some() {
            self.save_snapshot().await;
        }
    }

    /// Persists the full set of Pending entries, the effective
    /// configuration, and the current `memory_usage` to the configured
    /// store, if any (spec §4.9). A no-op when no store is attached.
    pub async fn save_snapshot(&self) {
        let store = self.persistent_store.read().clone();
        let Some(store) = store else {
            return;
        };
        let now = Instant::now();
        let (entries_owned, config, memory_usage) = {
            let inner = self.inner.read();
            let entries: Vec<TxEntry> = inner
                .entries
                .values()
                .filter(|e| e.status == TxStatus::Pending)
                .cloned()
                .collect();
            (entries, inner.config.clone(), inner.snapshot.total_bytes)
        };
        let refs: Vec<&TxEntry> = entries_owned.iter().collect();
        snapshot::save(store.as_ref(), &refs, &config, memory_usage, now).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ports::{RecordingEventSink, Sha256HashService};
    use crate::types::{OutPoint, TxInput, TxOutput};

    fn make_mempool() -> Mempool {
        Mempool::new(Config::default(), Arc::new(Sha256HashService)).unwrap()
    }

    fn coinbase(nonce: u64) -> Transaction {
        Transaction {
            inputs: vec![],
            outputs: vec![TxOutput { payload: vec![nonce as u8] }],
            nonce,
            metadata: vec![],
            fee_mechanism: 0,
        }
    }

    fn spending(nonce: u64, parent: TxId) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                previous_output: OutPoint { tx_id: parent, output_index: 0 },
                is_reference_only: false,
            }],
            outputs: vec![TxOutput { payload: vec![nonce as u8] }],
            nonce,
            metadata: vec![],
            fee_mechanism: 5_000,
        }
    }

    #[tokio::test]
    async fn submit_then_get_round_trips() {
        let pool = make_mempool();
        let tx = coinbase(1);
        let tx_id = pool.submit(tx.clone(), "local").await.unwrap();
        let entry = pool.get(&tx_id).unwrap();
        assert_eq!(entry.tx, tx);
        assert_eq!(entry.status, TxStatus::Pending);
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let pool = make_mempool();
        let tx = coinbase(2);
        pool.submit(tx.clone(), "local").await.unwrap();
        let result = pool.submit(tx, "local").await;
        assert_eq!(result, Err(MempoolError::DuplicateTx));
    }

    #[tokio::test]
    async fn double_spend_is_rejected_as_utxo_conflict() {
        let pool = make_mempool();
        let parent = TxId([7u8; 32]);
        let a = spending(1, parent);
        let b = spending(2, parent);
        pool.submit(a, "local").await.unwrap();
        let result = pool.submit(b, "local").await;
        assert_eq!(result, Err(MempoolError::UtxoConflict));
    }

    #[tokio::test]
    async fn lifecycle_follows_the_mining_and_confirm_path() {
        let pool = make_mempool();
        let tx_id = pool.submit(coinbase(3), "local").await.unwrap();

        // mark_pending_confirm before mark_mining is not a legal transition;
        // it is silently ignored rather than erroring.
        pool.mark_pending_confirm(&[tx_id], 1).unwrap();
        assert_eq!(pool.status(&tx_id).unwrap(), TxStatus::Pending);

        pool.mark_mining(&[tx_id]).unwrap();
        assert_eq!(pool.status(&tx_id).unwrap(), TxStatus::Mining);

        pool.mark_pending_confirm(&[tx_id], 100).unwrap();
        assert_eq!(pool.status(&tx_id).unwrap(), TxStatus::PendingConfirm);

        pool.confirm(&[tx_id], 100).unwrap();
        assert_eq!(pool.status(&tx_id), Err(MempoolError::TxNotFound));
    }

    #[tokio::test]
    async fn reject_requeues_a_mining_transaction_back_to_pending() {
        let pool = make_mempool();
        let tx_id = pool.submit(coinbase(4), "local").await.unwrap();
        pool.mark_mining(&[tx_id]).unwrap();

        pool.reject(&[tx_id]).unwrap();
        assert_eq!(pool.status(&tx_id).unwrap(), TxStatus::Pending);
        assert_eq!(pool.select_pending(10, u64::MAX, &[]).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_status_administratively_rejects_a_pending_transaction() {
        let pool = make_mempool();
        let tx_id = pool.submit(coinbase(5), "local").await.unwrap();

        pool.update_status(&tx_id, TxStatus::Rejected).unwrap();
        assert_eq!(pool.status(&tx_id).unwrap(), TxStatus::Rejected);
        assert_eq!(pool.select_pending(10, u64::MAX, &[]).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn select_for_mining_is_read_only_and_mark_mining_is_separate() {
        let pool = make_mempool();
        let parent_tx = coinbase(6);
        let parent_id = pool.submit(parent_tx, "local").await.unwrap();
        let child_id = pool.submit(spending(7, parent_id), "local").await.unwrap();

        let selected = pool.select_for_mining().await.unwrap();
        let ids: Vec<TxId> = selected.iter().map(|e| e.tx_id).collect();
        let pos_parent = ids.iter().position(|x| *x == parent_id).unwrap();
        let pos_child = ids.iter().position(|x| *x == child_id).unwrap();
        assert!(pos_parent < pos_child);
        // Selection alone must not mutate status.
        assert_eq!(pool.status(&parent_id).unwrap(), TxStatus::Pending);
        assert_eq!(pool.status(&child_id).unwrap(), TxStatus::Pending);

        pool.mark_mining(&ids).unwrap();
        assert_eq!(pool.status(&parent_id).unwrap(), TxStatus::Mining);
        assert_eq!(pool.status(&child_id).unwrap(), TxStatus::Mining);
    }

    #[tokio::test]
    async fn event_sink_observes_admission_and_requeue() {
        let pool = make_mempool();
        let sink = Arc::new(RecordingEventSink::new());
        pool.set_event_sink(sink.clone());

        let tx_id = pool.submit(coinbase(8), "local").await.unwrap();
        pool.mark_mining(&[tx_id]).unwrap();
        pool.reject(&[tx_id]).unwrap();

        let events = sink.events();
        let added_count = events
            .iter()
            .filter(|e| matches!(e, crate::ports::RecordedEvent::Added(id) if *id == tx_id))
            .count();
        // Once on submit, once more on the reject requeue (spec §4.6: "each
        // transition to Pending emits on_added").
        assert_eq!(added_count, 2);
    }

    #[tokio::test]
    async fn reset_clears_the_pool() {
        let pool = make_mempool();
        pool.submit(coinbase(9), "local").await.unwrap();
        pool.reset().unwrap();
        assert_eq!(pool.select_pending(10, u64::MAX, &[]).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn closed_pool_rejects_submissions() {
        let pool = make_mempool();
        pool.close().unwrap();
        let result = pool.submit(coinbase(10), "local").await;
        assert_eq!(result, Err(MempoolError::PoolClosed));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_never_errors() {
        let pool = make_mempool();
        assert!(pool.close().is_ok());
        assert!(pool.close().is_ok());
        assert_eq!(pool.submit(coinbase(11), "local").await, Err(MempoolError::PoolClosed));
    }

    #[tokio::test]
    async fn reset_succeeds_even_on_a_closed_pool() {
        let pool = make_mempool();
        pool.submit(coinbase(12), "local").await.unwrap();
        pool.close().unwrap();
        assert!(pool.reset().is_ok());
    }
}
