//! Topological ordering of Pending transactions for block selection (spec §4.4).

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::types::{heap_order, TxEntry, TxId};

/// Result of [`resolve`]: a best-effort topological order plus the
/// `dependent_count` update each entry should receive.
pub struct DependencyResolution {
    /// Entries in dependency order (parents before children); any residual
    /// cycle is appended at the end in comparator order (spec: "the
    /// function never fails").
    pub order: Vec<TxId>,
    /// `tx_id -> number of in-pool successors`, to be written back onto
    /// each entry's `dependent_count` field.
    pub dependent_counts: HashMap<TxId, u32>,
}

/// Runs Kahn's algorithm over the in-pool dependency graph formed by
/// `entries` (all assumed Pending). An edge `P -> C` exists iff `C` has a
/// non-reference-only input whose previous_output.tx_id == P.tx_id and `P`
/// is present in `entries`. Self-edges are skipped with a warning.
pub fn resolve(entries: &[&TxEntry]) -> DependencyResolution {
    let present: HashSet<TxId> = entries.iter().map(|e| e.tx_id).collect();
    let by_id: HashMap<TxId, &TxEntry> = entries.iter().map(|e| (e.tx_id, *e)).collect();

    // children[P] = set of C such that P -> C
    let mut children: HashMap<TxId, Vec<TxId>> = HashMap::new();
    let mut in_degree: HashMap<TxId, u32> = entries.iter().map(|e| (e.tx_id, 0)).collect();

    for entry in entries {
        let mut parents: HashSet<TxId> = HashSet::new();
        for input in entry.tx.inputs.iter().filter(|i| !i.is_reference_only) {
            let parent_id = input.previous_output.tx_id;
            if parent_id == entry.tx_id {
                warn!(tx_id = %entry.tx_id, "self-referential input skipped in dependency graph");
                continue;
            }
            if present.contains(&parent_id) {
                parents.insert(parent_id);
            }
        }
        for parent_id in parents {
            children.entry(parent_id).or_default().push(entry.tx_id);
            *in_degree.entry(entry.tx_id).or_insert(0) += 1;
        }
    }

    let dependent_counts: HashMap<TxId, u32> = entries
        .iter()
        .map(|e| {
            let count = children.get(&e.tx_id).map(|c| c.len() as u32).unwrap_or(0);
            (e.tx_id, count)
        })
        .collect();

    // Kahn's algorithm; the ready set is ordered with the same comparator as
    // the priority heap, for determinism (spec §4.4, P7).
    let mut ready: Vec<TxId> = in_degree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(id, _)| *id)
        .collect();
    sort_by_heap_order(&mut ready, &by_id);

    let mut order = Vec::with_capacity(entries.len());
    let mut remaining_in_degree = in_degree.clone();
    let mut idx = 0;
    while idx < ready.len() {
        let id = ready[idx];
        idx += 1;
        order.push(id);

        if let Some(kids) = children.get(&id) {
            let mut newly_ready = Vec::new();
            for &kid in kids {
                let deg = remaining_in_degree.get_mut(&kid).expect("tracked");
                *deg -= 1;
                if *deg == 0 {
                    newly_ready.push(kid);
                }
            }
            if !newly_ready.is_empty() {
                sort_by_heap_order(&mut newly_ready, &by_id);
                // Insert newly-ready items at the tail, preserving ready-set
                // ordering invariants among items discovered at the same
                // "round"; exact interleaving beyond the comparator is not
                // spec-mandated.
                ready.splice(ready.len().., newly_ready);
            }
        }
    }

    if order.len() < entries.len() {
        let visited: HashSet<TxId> = order.iter().copied().collect();
        let mut leftover: Vec<TxId> = entries
            .iter()
            .map(|e| e.tx_id)
            .filter(|id| !visited.contains(id))
            .collect();
        warn!(
            count = leftover.len(),
            "dependency cycle detected; appending residual entries in comparator order"
        );
        sort_by_heap_order(&mut leftover, &by_id);
        order.extend(leftover);
    }

    DependencyResolution {
        order,
        dependent_counts,
    }
}

fn sort_by_heap_order(ids: &mut [TxId], by_id: &HashMap<TxId, &TxEntry>) {
    ids.sort_by(|a, b| heap_order(by_id[a], by_id[b]));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TxInput, TxOutput, TxStatus, TxType};
    use std::time::Instant;

    fn entry(id: u8, inputs: Vec<TxInput>, priority: i32) -> TxEntry {
        TxEntry {
            tx_id: TxId([id; 32]),
            tx: crate::types::Transaction {
                inputs,
                outputs: vec![TxOutput { payload: vec![] }],
                nonce: 0,
                metadata: vec![],
                fee_mechanism: 1000,
            },
            received_at: Instant::now(),
            status: TxStatus::Pending,
            priority,
            size: 100,
            tx_type: TxType::Normal,
            dependent_count: 0,
            heap_index: -1,
        }
    }

    fn input_on(id: u8) -> TxInput {
        TxInput {
            previous_output: OutPoint {
                tx_id: TxId([id; 32]),
                output_index: 0,
            },
            is_reference_only: false,
        }
    }

    #[test]
    fn simple_chain_orders_parent_before_child() {
        let p = entry(1, vec![], 10);
        let c = entry(2, vec![input_on(1)], 1000); // higher priority, still must come after
        let entries = vec![&p, &c];
        let res = resolve(&entries);
        let pos_p = res.order.iter().position(|x| *x == p.tx_id).unwrap();
        let pos_c = res.order.iter().position(|x| *x == c.tx_id).unwrap();
        assert!(pos_p < pos_c);
        assert_eq!(res.dependent_counts[&p.tx_id], 1);
        assert_eq!(res.dependent_counts[&c.tx_id], 0);
    }

    #[test]
    fn diamond_resolves_deterministically() {
        let a = entry(1, vec![], 5);
        let b = entry(2, vec![input_on(1)], 20);
        let c = entry(3, vec![input_on(1)], 10);
        let d = entry(4, vec![input_on(2), input_on(3)], 1);
        let entries = vec![&a, &b, &c, &d];
        let res = resolve(&entries);
        assert_eq!(res.order.len(), 4);
        let pos = |id: TxId| res.order.iter().position(|x| *x == id).unwrap();
        assert!(pos(a.tx_id) < pos(b.tx_id));
        assert!(pos(a.tx_id) < pos(c.tx_id));
        assert!(pos(b.tx_id) < pos(d.tx_id));
        assert!(pos(c.tx_id) < pos(d.tx_id));
    }

    #[test]
    fn cycle_is_appended_without_failing() {
        let a = entry(1, vec![input_on(2)], 5);
        let b = entry(2, vec![input_on(1)], 5);
        let entries = vec![&a, &b];
        let res = resolve(&entries);
        assert_eq!(res.order.len(), 2);
    }

    #[test]
    fn reference_only_input_creates_no_edge() {
        let mut refonly = input_on(1);
        refonly.is_reference_only = true;
        let p = entry(1, vec![], 5);
        let c = entry(2, vec![refonly], 5);
        let entries = vec![&p, &c];
        let res = resolve(&entries);
        assert_eq!(res.dependent_counts[&p.tx_id], 0);
    }
}
