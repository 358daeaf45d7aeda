//! External collaborator interfaces (spec §6).
//!
//! The mempool core only depends on these traits; concrete implementations
//! (a real hash service, a compliance microservice client, a persistence
//! backend, an event bus publisher) live outside this crate. Reference
//! implementations below exist purely so this crate's own tests can drive a
//! [`crate::mempool::Mempool`] end-to-end.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::metrics::PoolSnapshot;
use crate::types::{Transaction, TxEntry, TxId};

/// Computes and validates transaction hashes. Wire serialization and hash
/// computation proper are out of scope for this crate (spec §1); this is
/// the seam where a real implementation plugs in.
#[async_trait]
pub trait TxHashService: Send + Sync {
    /// Computes the id for `tx`. `is_valid = false` means the transaction is
    /// structurally unhashable and admission must fail with `InvalidHash`.
    async fn compute_hash(&self, tx: &Transaction) -> anyhow::Result<(TxId, bool)>;

    /// Confirms that `tx` hashes to `expected`.
    async fn validate_hash(&self, tx: &Transaction, expected: &TxId) -> anyhow::Result<bool>;
}

/// Admission veto. A `None` policy is equivalent to allow-all (spec §6).
#[async_trait]
pub trait CompliancePolicy: Send + Sync {
    async fn check_transaction(&self, tx: &Transaction, source: &str) -> anyhow::Result<ComplianceDecision>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComplianceDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub country: Option<String>,
    pub source: String,
}

/// Optional persistence backend for snapshot save/restore (spec §4.9).
/// Errors during `restore` are non-fatal by contract; errors during `set`
/// (save) are logged only.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()>;
}

/// Lifecycle event fan-out. Implementations MUST NOT re-enter the mempool:
/// sinks are invoked after the triggering operation's write lock has
/// already been released, so a re-entrant call would observe the new state
/// rather than deadlock, but is still disallowed by contract.
pub trait EventSink: Send + Sync {
    fn on_added(&self, _entry: &TxEntry) {}
    fn on_removed(&self, _tx_id: &TxId) {}
    fn on_confirmed(&self, _tx_id: &TxId, _height: u64) {}
    fn on_expired(&self, _tx_id: &TxId) {}
    fn on_pool_state_changed(&self, _snapshot: &PoolSnapshot) {}
}

/// No-op sink, the default when none is attached.
pub struct NoopEventSink;
impl EventSink for NoopEventSink {}

/// Gate checked before every mutating operation (spec §5 "Write-gate"). A
/// rejection surfaces as a fatal error from that call, without side
/// effects. `None` is equivalent to always-allow.
pub trait WriteGate: Send + Sync {
    fn assert_write_allowed(&self, op_name: &str) -> Result<(), String>;
}

/// Always-allow gate, the default when none is attached.
pub struct AllowAllWriteGate;
impl WriteGate for AllowAllWriteGate {
    fn assert_write_allowed(&self, _op_name: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Allow-all compliance policy, matching spec §6's "nil policy ⇒ allow-all".
pub struct AllowAllCompliance;
#[async_trait]
impl CompliancePolicy for AllowAllCompliance {
    async fn check_transaction(&self, _tx: &Transaction, source: &str) -> anyhow::Result<ComplianceDecision> {
        Ok(ComplianceDecision {
            allowed: true,
            reason: None,
            country: None,
            source: source.to_string(),
        })
    }
}

/// Deterministic SHA-256-based hash service used by this crate's tests and
/// fixtures. Not exported as a production default: callers of
/// [`crate::mempool::Mempool::new`] must supply their own.
pub struct Sha256HashService;

#[async_trait]
impl TxHashService for Sha256HashService {
    async fn compute_hash(&self, tx: &Transaction) -> anyhow::Result<(TxId, bool)> {
        use sha2::{Digest, Sha256};
        let bytes = bincode::serialize(tx)?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        Ok((TxId(out), true))
    }

    async fn validate_hash(&self, tx: &Transaction, expected: &TxId) -> anyhow::Result<bool> {
        let (actual, valid) = self.compute_hash(tx).await?;
        Ok(valid && actual == *expected)
    }
}

/// In-memory `BlobStore`, for tests and as a reference implementation.
#[derive(Default)]
pub struct InMemoryBlobStore {
    inner: Mutex<std::collections::HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.inner.lock().unwrap().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> anyhow::Result<()> {
        self.inner.lock().unwrap().insert(key.to_string(), value);
        Ok(())
    }
}

/// Recording event sink, for tests that assert on emitted events.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    Added(TxId),
    Removed(TxId),
    Confirmed(TxId, u64),
    Expired(TxId),
}

#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
    counter: AtomicU64,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self) -> u64 {
        self.counter.load(AtomicOrdering::SeqCst)
    }
}

impl EventSink for RecordingEventSink {
    fn on_added(&self, entry: &TxEntry) {
        self.events.lock().unwrap().push(RecordedEvent::Added(entry.tx_id));
        self.counter.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn on_removed(&self, tx_id: &TxId) {
        self.events.lock().unwrap().push(RecordedEvent::Removed(*tx_id));
        self.counter.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn on_confirmed(&self, tx_id: &TxId, height: u64) {
        self.events
            .lock()
            .unwrap()
            .push(RecordedEvent::Confirmed(*tx_id, height));
        self.counter.fetch_add(1, AtomicOrdering::SeqCst);
    }

    fn on_expired(&self, tx_id: &TxId) {
        self.events.lock().unwrap().push(RecordedEvent::Expired(*tx_id));
        self.counter.fetch_add(1, AtomicOrdering::SeqCst);
    }
}
