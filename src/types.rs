//! Core data model (spec §3).

use std::cmp::Ordering;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// 32-byte transaction identity, produced by the external [`crate::ports::TxHashService`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TxId(pub [u8; 32]);

impl TxId {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(TxId(arr))
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Identifier of a specific transaction output: `(tx_id, output_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct OutPoint {
    pub tx_id: TxId,
    pub output_index: u32,
}

/// A transaction input. `is_reference_only` inputs name an OutPoint for
/// reading but do not consume it — they take no part in double-spend
/// detection or the dependency graph (spec GLOSSARY).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    pub previous_output: OutPoint,
    pub is_reference_only: bool,
}

/// An opaque transaction output. The mempool never interprets the payload;
/// balance/value semantics are a business-layer concern (Non-goal).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    pub payload: Vec<u8>,
}

/// The transaction payload. Identity is the externally computed [`TxId`],
/// not any field here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// May be empty for a coinbase/genesis transaction.
    pub inputs: Vec<TxInput>,
    /// Must be non-empty for a valid (non-coinbase) transaction.
    pub outputs: Vec<TxOutput>,
    pub nonce: u64,
    /// Opaque bytes; may carry a user priority hint, not interpreted here.
    pub metadata: Vec<u8>,
    /// Declared minimum fee for this transaction.
    pub fee_mechanism: u64,
}

impl Transaction {
    /// A coinbase/genesis transaction has no inputs and is always
    /// admissible regardless of minimum-fee checks (spec §4.2).
    pub fn is_coinbase(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Approximate serialized byte length, used for size-based admission
    /// and scoring. Real wire serialization is out of scope (spec §1); this
    /// is an estimate via `bincode`, mirroring the teacher's `Tx::size()`.
    pub fn estimated_size(&self) -> u64 {
        bincode::serialize(self).map(|b| b.len() as u64).unwrap_or(0)
    }
}

/// Lifecycle states (spec §4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxStatus {
    Pending,
    Mining,
    PendingConfirm,
    Confirmed,
    Rejected,
    Expired,
}

impl TxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TxStatus::Pending => "pending",
            TxStatus::Mining => "mining",
            TxStatus::PendingConfirm => "pending_confirm",
            TxStatus::Confirmed => "confirmed",
            TxStatus::Rejected => "rejected",
            TxStatus::Expired => "expired",
        }
    }
}

/// Coarse classification used by the priority engine's `type_bonus` term
/// (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxType {
    Normal,
    System,
    Contract,
    Resource,
}

/// Classifies a transaction from its outputs and fee mechanism.
///
/// The spec leaves the exact classification rule to the implementation; we
/// use the declared fee mechanism as the signal a real chain would expose
/// through an output's program/script type. `fee_mechanism == 0` on a
/// non-coinbase transaction marks a `System` transaction (e.g. protocol
/// housekeeping), odd/even bands of `metadata`'s first byte distinguish
/// `Contract` vs `Resource` hints, and everything else is `Normal`.
pub fn classify_tx(tx: &Transaction) -> TxType {
    if !tx.is_coinbase() && tx.fee_mechanism == 0 {
        return TxType::System;
    }
    match tx.metadata.first() {
        Some(b) if *b == b'C' => TxType::Contract,
        Some(b) if *b == b'R' => TxType::Resource,
        _ => TxType::Normal,
    }
}

/// Internal record for one accepted transaction (spec §3).
#[derive(Debug, Clone)]
pub struct TxEntry {
    pub tx_id: TxId,
    pub tx: Transaction,
    pub received_at: Instant,
    pub status: TxStatus,
    pub priority: i32,
    pub size: u64,
    pub tx_type: TxType,
    pub dependent_count: u32,
    /// Back-pointer into the priority heap; `-1` when not heap-resident.
    pub heap_index: isize,
}

impl TxEntry {
    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.saturating_duration_since(self.received_at)
    }
}

/// The comparator used by both the priority heap and the dependency
/// resolver's ready queue (spec §4.1 "priority heap", §4.4 "Ready-queue
/// ordering"): `(priority desc, received_at asc, tx_id lex asc)`.
pub fn heap_order(a: &TxEntry, b: &TxEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.received_at.cmp(&b.received_at))
        .then_with(|| a.tx_id.cmp(&b.tx_id))
}
