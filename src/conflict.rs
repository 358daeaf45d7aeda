//! UTXO double-spend detector (spec §4.5).

use std::collections::HashMap;

use crate::types::{OutPoint, Transaction, TxId};

/// Auxiliary `OutPoint -> TxId` index over all consuming (non-reference-only)
/// inputs of the Pending set, allowing O(|inputs|) conflict lookups instead
/// of an O(pending) scan per admission.
#[derive(Debug, Default)]
pub struct ConflictIndex {
    spenders: HashMap<OutPoint, TxId>,
}

impl ConflictIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `tx_id` as the spender of every non-reference-only input
    /// in `tx`. Caller must have already confirmed no conflict exists.
    pub fn insert(&mut self, tx_id: TxId, tx: &Transaction) {
        for input in consuming_inputs(tx) {
            self.spenders.insert(input.previous_output, tx_id);
        }
    }

    /// Unregisters every OutPoint consumed by `tx`.
    pub fn remove(&mut self, tx: &Transaction) {
        for input in consuming_inputs(tx) {
            self.spenders.remove(&input.previous_output);
        }
    }

    /// Returns the conflicting `TxId`, if `tx` shares a consumed OutPoint
    /// with any currently indexed Pending entry.
    pub fn find_conflict(&self, tx: &Transaction) -> Option<TxId> {
        consuming_inputs(tx)
            .find_map(|input| self.spenders.get(&input.previous_output).copied())
    }

    pub fn contains_outpoint(&self, outpoint: &OutPoint) -> bool {
        self.spenders.contains_key(outpoint)
    }
}

fn consuming_inputs(tx: &Transaction) -> impl Iterator<Item = &crate::types::TxInput> {
    tx.inputs.iter().filter(|i| !i.is_reference_only)
}

/// Intra-batch uniqueness guard used by `select_for_mining` (spec §4.5): a
/// candidate is skipped if it would collide with an OutPoint already
/// claimed by an earlier candidate in the same selection.
#[derive(Debug, Default)]
pub struct BatchGuard {
    claimed: std::collections::HashSet<OutPoint>,
}

impl BatchGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` (and claims the outpoints) iff `tx` does not collide
    /// with any previously accepted candidate in this batch.
    pub fn try_accept(&mut self, tx: &Transaction) -> bool {
        let outpoints: Vec<OutPoint> = consuming_inputs(tx).map(|i| i.previous_output).collect();
        if outpoints.iter().any(|o| self.claimed.contains(o)) {
            return false;
        }
        self.claimed.extend(outpoints);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TxInput, TxOutput};

    fn tx_with_input(tx_id: TxId, index: u32, ref_only: bool) -> Transaction {
        Transaction {
            inputs: vec![TxInput {
                previous_output: OutPoint {
                    tx_id,
                    output_index: index,
                },
                is_reference_only: ref_only,
            }],
            outputs: vec![TxOutput { payload: vec![] }],
            nonce: 0,
            metadata: vec![],
            fee_mechanism: 1000,
        }
    }

    #[test]
    fn detects_double_spend() {
        let mut idx = ConflictIndex::new();
        let parent = TxId([1u8; 32]);
        let a = tx_with_input(parent, 0, false);
        idx.insert(TxId([2u8; 32]), &a);

        let b = tx_with_input(parent, 0, false);
        assert_eq!(idx.find_conflict(&b), Some(TxId([2u8; 32])));
    }

    #[test]
    fn reference_only_inputs_never_conflict() {
        let mut idx = ConflictIndex::new();
        let parent = TxId([1u8; 32]);
        let a = tx_with_input(parent, 0, true);
        idx.insert(TxId([2u8; 32]), &a);

        let b = tx_with_input(parent, 0, true);
        assert_eq!(idx.find_conflict(&b), None);
    }

    #[test]
    fn batch_guard_skips_intra_batch_collision() {
        let mut guard = BatchGuard::new();
        let parent = TxId([1u8; 32]);
        let a = tx_with_input(parent, 0, false);
        let b = tx_with_input(parent, 0, false);

        assert!(guard.try_accept(&a));
        assert!(!guard.try_accept(&b));
    }
}
