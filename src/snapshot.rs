//! JSON snapshot save/restore (spec §4.9).
//!
//! The wire format is a versioned JSON document with hex-encoded `tx_id`s,
//! so it is legible outside this crate (e.g. for an operator inspecting a
//! dumped blob). `received_at` is monotonic and cannot itself be persisted;
//! each entry instead carries its age at snapshot time, and `restore`
//! reconstructs a fresh `Instant` by subtracting that age from `now`. Only
//! Pending entries are ever snapshotted — Mining/PendingConfirm state is a
//! handoff in progress and is not meaningful to resume from a cold start.
//!
//! Per SPEC_FULL.md's resolution of Open Question 3, every failure mode
//! during `restore` — an absent key, a transport error, or malformed JSON —
//! is treated as "no snapshot" and logged at `warn!`, never surfaced as a
//! fatal error to the caller. `save` failures are likewise logged, not
//! propagated, matching the "errors during save are logged only" contract
//! on [`crate::ports::BlobStore`].

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::Config;
use crate::ports::BlobStore;
use crate::priority::{compute_priority, estimate_fee};
use crate::types::{Transaction, TxEntry, TxId, TxStatus, TxType};

pub const SNAPSHOT_KEY: &str = "mempool:state:snapshot";
const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    tx_id: String,
    tx: Transaction,
    size: u64,
    tx_type: TxType,
    age_millis: u64,
}

/// Carries the effective configuration and reported memory usage alongside
/// the Pending set (spec §4.9), for operator inspection of a dumped blob.
#[derive(Debug, Serialize, Deserialize)]
struct SnapshotDocument {
    version: String,
    config: Config,
    memory_usage: u64,
    entries: Vec<SnapshotEntry>,
}

fn to_document(entries: &[&TxEntry], config: &Config, memory_usage: u64, now: Instant) -> SnapshotDocument {
    SnapshotDocument {
        version: SNAPSHOT_VERSION.to_string(),
        config: config.clone(),
        memory_usage,
        entries: entries
            .iter()
            .map(|e| SnapshotEntry {
                tx_id: e.tx_id.to_hex(),
                tx: e.tx.clone(),
                size: e.size,
                tx_type: e.tx_type,
                age_millis: e.age(now).as_millis() as u64,
            })
            .collect(),
    }
}

/// Result of a `restore` call: the Pending entries to re-admit plus the
/// snapshot's own declared `memory_usage`, which the caller overwrites its
/// running total with (spec §4.9's "finally memory_usage is overwritten
/// from the snapshot to preserve reported totals").
pub struct RestoreResult {
    pub entries: Vec<TxEntry>,
    pub memory_usage: u64,
}

/// Decodes, age-filters, and re-scores the document's entries against
/// `live_config` — the configuration of the mempool being restored into,
/// not the (informational only) configuration embedded in the blob.
fn from_document(doc: SnapshotDocument, live_config: &Config, now: Instant) -> RestoreResult {
    let entries = doc
        .entries
        .into_iter()
        .filter_map(|e| {
            let tx_id = match TxId::from_hex(&e.tx_id) {
                Some(id) => id,
                None => {
                    warn!(tx_id = %e.tx_id, "dropping snapshot entry with malformed tx_id");
                    return None;
                }
            };
            let received_at = now
                .checked_sub(Duration::from_millis(e.age_millis))
                .unwrap_or(now);
            let age = now.saturating_duration_since(received_at);
            if age > live_config.lifetime {
                warn!(tx_id = %e.tx_id, "discarding snapshot entry older than the configured lifetime");
                return None;
            }
            let estimated_fee = estimate_fee(&e.tx, e.size, live_config.price_limit);
            let priority = compute_priority(estimated_fee, e.size, e.tx_type, received_at, now);
            Some(TxEntry {
                tx_id,
                tx: e.tx,
                received_at,
                status: TxStatus::Pending,
                priority,
                size: e.size,
                tx_type: e.tx_type,
                dependent_count: 0,
                heap_index: -1,
            })
        })
        .collect();
    RestoreResult {
        entries,
        memory_usage: doc.memory_usage,
    }
}

/// Serializes `entries` (the full Pending set, plus config/memory_usage)
/// and writes them to `store` under [`SNAPSHOT_KEY`]. Failures are logged
/// at `warn!` and otherwise swallowed.
pub async fn save(store: &dyn BlobStore, entries: &[&TxEntry], config: &Config, memory_usage: u64, now: Instant) {
    let doc = to_document(entries, config, memory_usage, now);
    let bytes = match serde_json::to_vec(&doc) {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to serialize mempool snapshot");
            return;
        }
    };
    if let Err(e) = store.set(SNAPSHOT_KEY, bytes).await {
        warn!(error = %e, "failed to persist mempool snapshot");
    }
}

/// Reads and deserializes the snapshot at [`SNAPSHOT_KEY`], if any. Every
/// failure mode — missing key, transport error, malformed JSON, unknown
/// version — resolves to an empty result plus a `warn!` log, never an
/// error returned to the caller.
pub async fn restore(store: &dyn BlobStore, live_config: &Config, now: Instant) -> RestoreResult {
    let empty = || RestoreResult { entries: Vec::new(), memory_usage: 0 };
    let bytes = match store.get(SNAPSHOT_KEY).await {
        Ok(Some(b)) => b,
        Ok(None) => return empty(),
        Err(e) => {
            warn!(error = %e, "failed to read mempool snapshot; starting empty");
            return empty();
        }
    };
    let doc: SnapshotDocument = match serde_json::from_slice(&bytes) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, "failed to parse mempool snapshot; starting empty");
            return empty();
        }
    };
    if doc.version != SNAPSHOT_VERSION {
        warn!(version = %doc.version, "unknown snapshot version; starting empty");
        return empty();
    }
    from_document(doc, live_config, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::InMemoryBlobStore;
    use crate::types::TxOutput;

    fn entry(id: u8, age: Duration, now: Instant) -> TxEntry {
        TxEntry {
            tx_id: TxId([id; 32]),
            tx: Transaction {
                inputs: vec![],
                outputs: vec![TxOutput { payload: vec![7] }],
                nonce: 0,
                metadata: vec![],
                fee_mechanism: 1000,
            },
            received_at: now - age,
            status: TxStatus::Pending,
            priority: 42,
            size: 128,
            tx_type: TxType::Normal,
            dependent_count: 0,
            heap_index: -1,
        }
    }

    #[tokio::test]
    async fn round_trips_through_blob_store() {
        let now = Instant::now();
        let e1 = entry(1, Duration::from_secs(10), now);
        let e2 = entry(2, Duration::from_secs(20), now);
        let store = InMemoryBlobStore::new();
        let config = Config::default();

        save(&store, &[&e1, &e2], &config, 256, now).await;
        let restored = restore(&store, &config, now).await;

        assert_eq!(restored.memory_usage, 256);
        assert_eq!(restored.entries.len(), 2);
        let ids: Vec<TxId> = restored.entries.iter().map(|e| e.tx_id).collect();
        assert!(ids.contains(&e1.tx_id));
        assert!(ids.contains(&e2.tx_id));
        for e in &restored.entries {
            assert_eq!(e.heap_index, -1);
            assert_eq!(e.status, TxStatus::Pending);
        }
    }

    #[tokio::test]
    async fn entries_older_than_lifetime_are_discarded_on_restore() {
        let now = Instant::now();
        let fresh = entry(1, Duration::from_secs(10), now);
        let stale = entry(2, Duration::from_secs(1000), now);
        let store = InMemoryBlobStore::new();
        let mut config = Config::default();
        config.lifetime = Duration::from_secs(100);

        save(&store, &[&fresh, &stale], &config, 256, now).await;
        let restored = restore(&store, &config, now).await;

        assert_eq!(restored.entries.len(), 1);
        assert_eq!(restored.entries[0].tx_id, fresh.tx_id);
    }

    #[tokio::test]
    async fn missing_snapshot_restores_empty_without_error() {
        let store = InMemoryBlobStore::new();
        let config = Config::default();
        let restored = restore(&store, &config, Instant::now()).await;
        assert!(restored.entries.is_empty());
    }

    #[tokio::test]
    async fn malformed_snapshot_restores_empty_without_error() {
        let store = InMemoryBlobStore::new();
        store.set(SNAPSHOT_KEY, b"not json".to_vec()).await.unwrap();
        let config = Config::default();
        let restored = restore(&store, &config, Instant::now()).await;
        assert!(restored.entries.is_empty());
    }
}
