//! Eviction policies (spec §4.3): given candidates and a byte target, return
//! an ordered list of `TxId`s to remove to free at least `required_bytes`.
//! Only Pending entries are evictable.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use crate::types::{TxEntry, TxId, TxType};

/// Common contract every eviction primitive implements; `Hybrid` composes
/// the other three. `locals` names ids submitted with source `"local"`
/// (spec §6's `keep_locals`); policies that account for submission origin
/// use it to push those entries later in the worst-first order.
pub trait EvictionPolicy {
    /// Returns candidate ids ordered worst-first (first to evict).
    fn rank(&self, candidates: &[&TxEntry], now: Instant, locals: &HashSet<TxId>) -> Vec<TxId>;

    /// Selects ids to evict, stopping once `required_bytes` would be freed.
    fn select_to_evict(
        &self,
        candidates: &[&TxEntry],
        required_bytes: u64,
        now: Instant,
        locals: &HashSet<TxId>,
    ) -> Vec<TxId> {
        let sizes: HashMap<TxId, u64> = candidates.iter().map(|e| (e.tx_id, e.size)).collect();
        let mut freed = 0u64;
        let mut chosen = Vec::new();
        for id in self.rank(candidates, now, locals) {
            if freed >= required_bytes {
                break;
            }
            freed += sizes.get(&id).copied().unwrap_or(0);
            chosen.push(id);
        }
        chosen
    }
}

fn type_rank(tx_type: TxType) -> i64 {
    match tx_type {
        TxType::System => 3,
        TxType::Contract => 2,
        TxType::Resource => 1,
        TxType::Normal => 0,
    }
}

/// Design-constant weights for the priority-based primitive (spec §4.3).
pub const TYPE_WEIGHT: f64 = 1000.0;
pub const SIZE_WEIGHT: f64 = 1000.0;
pub const TIME_WEIGHT: f64 = 100.0;
pub const DEP_WEIGHT: f64 = 500.0;
/// Bonus added to a local entry's score so it ranks later in the worst-first
/// eviction order (spec §6's `keep_locals`), without being able to outrank
/// the type/priority spread entirely.
pub const LOCAL_WEIGHT: f64 = 750.0;

/// Scores ascending (lowest first = worst = evicted first):
/// `type_weight*type + (1/size)*size_weight*1000 + (1/(age+1))*time_weight*100 + dependent_count*dep_weight`,
/// plus `LOCAL_WEIGHT` when the entry is in `locals`, with the entry's
/// already-computed (fee-dominated) `priority` folded in as the primary term.
///
/// Spec §4.3's literal formula has no fee term, yet §8 scenario S3 requires
/// eviction to prefer the lowest-fee entry when every other factor (type,
/// size, age, dependent_count) is equal. Resolved here by keeping the listed
/// terms as secondary refinements and using `entry.priority` (fee and
/// fee-rate dominated, per §4.2) as the primary signal — see DESIGN.md.
pub struct PriorityPolicy;

impl EvictionPolicy for PriorityPolicy {
    fn rank(&self, candidates: &[&TxEntry], now: Instant, locals: &HashSet<TxId>) -> Vec<TxId> {
        let mut scored: Vec<(f64, &TxEntry)> = candidates
            .iter()
            .map(|e| {
                let age_secs = e.age(now).as_secs_f64();
                let local_bonus = if locals.contains(&e.tx_id) { LOCAL_WEIGHT } else { 0.0 };
                let score = e.priority as f64
                    + type_rank(e.tx_type) as f64 * TYPE_WEIGHT
                    + (1.0 / (e.size.max(1) as f64)) * SIZE_WEIGHT * 1000.0
                    + (1.0 / (age_secs + 1.0)) * TIME_WEIGHT * 100.0
                    + e.dependent_count as f64 * DEP_WEIGHT
                    + local_bonus;
                (score, *e)
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.received_at.cmp(&b.1.received_at))
                .then_with(|| a.1.tx_id.cmp(&b.1.tx_id))
        });
        scored.into_iter().map(|(_, e)| e.tx_id).collect()
    }
}

/// Evicts entries older than `max_time_in_pool` first; pads with the oldest
/// remaining if that is not enough.
pub struct TimePolicy {
    pub max_time_in_pool: Duration,
}

impl EvictionPolicy for TimePolicy {
    fn rank(&self, candidates: &[&TxEntry], now: Instant, _locals: &HashSet<TxId>) -> Vec<TxId> {
        let mut sorted: Vec<&TxEntry> = candidates.to_vec();
        sorted.sort_by_key(|e| e.received_at);
        let (expired, rest): (Vec<&TxEntry>, Vec<&TxEntry>) = sorted
            .into_iter()
            .partition(|e| e.age(now) > self.max_time_in_pool);
        expired
            .into_iter()
            .chain(rest)
            .map(|e| e.tx_id)
            .collect()
    }
}

/// Evicts the largest entries first.
pub struct SizePolicy;

impl EvictionPolicy for SizePolicy {
    fn rank(&self, candidates: &[&TxEntry], _now: Instant, _locals: &HashSet<TxId>) -> Vec<TxId> {
        let mut sorted: Vec<&TxEntry> = candidates.to_vec();
        sorted.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.tx_id.cmp(&b.tx_id)));
        sorted.into_iter().map(|e| e.tx_id).collect()
    }
}

/// Default policy: runs all three primitives in parallel, each contributing
/// a rank-weighted vote `w * (1 - i/N)` to its nominee; final order is
/// descending total vote, evicted greedily until the byte target is met.
pub struct HybridPolicy {
    pub priority: PriorityPolicy,
    pub time: TimePolicy,
    pub size: SizePolicy,
    pub priority_weight: f64,
    pub time_weight: f64,
    pub size_weight: f64,
}

impl HybridPolicy {
    pub fn new(max_time_in_pool: Duration) -> Self {
        Self {
            priority: PriorityPolicy,
            time: TimePolicy { max_time_in_pool },
            size: SizePolicy,
            priority_weight: 0.5,
            time_weight: 0.25,
            size_weight: 0.25,
        }
    }
}

impl EvictionPolicy for HybridPolicy {
    fn rank(&self, candidates: &[&TxEntry], now: Instant, locals: &HashSet<TxId>) -> Vec<TxId> {
        let n = candidates.len().max(1) as f64;
        let mut votes: HashMap<TxId, f64> = HashMap::new();

        let mut tally = |ids: Vec<TxId>, weight: f64| {
            for (i, id) in ids.into_iter().enumerate() {
                let vote = weight * (1.0 - (i as f64 / n));
                *votes.entry(id).or_insert(0.0) += vote;
            }
        };
        tally(self.priority.rank(candidates, now, locals), self.priority_weight);
        tally(self.time.rank(candidates, now, locals), self.time_weight);
        tally(self.size.rank(candidates, now, locals), self.size_weight);

        // Evict ascending = lowest vote (i.e. least economically worth
        // keeping) first, so sort descending by vote then reverse, i.e.
        // directly sort ascending by vote score.
        let by_id: HashMap<TxId, &TxEntry> = candidates.iter().map(|e| (e.tx_id, *e)).collect();
        let mut ranked: Vec<(TxId, f64)> = votes.into_iter().collect();
        ranked.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| by_id[&a.0].received_at.cmp(&by_id[&b.0].received_at))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.into_iter().map(|(id, _)| id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TxOutput, TxStatus};

    fn entry(id: u8, size: u64, fee_priority: i32, age_secs: u64, now: Instant) -> TxEntry {
        TxEntry {
            tx_id: TxId([id; 32]),
            tx: Transaction {
                inputs: vec![],
                outputs: vec![TxOutput { payload: vec![] }],
                nonce: 0,
                metadata: vec![],
                fee_mechanism: 1000,
            },
            received_at: now - Duration::from_secs(age_secs),
            status: TxStatus::Pending,
            priority: fee_priority,
            size,
            tx_type: TxType::Normal,
            dependent_count: 0,
            heap_index: -1,
        }
    }

    #[test]
    fn size_policy_evicts_largest_first() {
        let now = Instant::now();
        let a = entry(1, 100, 0, 0, now);
        let b = entry(2, 900, 0, 0, now);
        let entries = vec![&a, &b];
        let ranked = SizePolicy.rank(&entries, now, &HashSet::new());
        assert_eq!(ranked, vec![b.tx_id, a.tx_id]);
    }

    #[test]
    fn time_policy_prefers_expired_entries() {
        let now = Instant::now();
        let max = Duration::from_secs(100);
        let old = entry(1, 100, 0, 200, now);
        let fresh = entry(2, 100, 0, 1, now);
        let entries = vec![&fresh, &old];
        let policy = TimePolicy {
            max_time_in_pool: max,
        };
        let ranked = policy.rank(&entries, now, &HashSet::new());
        assert_eq!(ranked[0], old.tx_id);
    }

    #[test]
    fn hybrid_frees_required_bytes_scenario_s3() {
        // Reproduces spec scenario S3: five 500B txs with fees 100..500,
        // fifth submission needs to evict the fee=100 tx.
        let now = Instant::now();
        let e1 = entry(1, 500, 100, 0, now);
        let e2 = entry(2, 500, 200, 0, now);
        let e3 = entry(3, 500, 300, 0, now);
        let e4 = entry(4, 500, 400, 0, now);
        let e5 = entry(5, 500, 500, 0, now);
        let entries = vec![&e1, &e2, &e3, &e4, &e5];

        let hybrid = HybridPolicy::new(Duration::from_secs(3600));
        let evicted = hybrid.select_to_evict(&entries, 500, now, &HashSet::new());
        assert_eq!(evicted, vec![e1.tx_id]);
    }

    #[test]
    fn priority_policy_prefers_evicting_non_local_over_local_at_equal_fee() {
        let now = Instant::now();
        let local = entry(1, 500, 100, 0, now);
        let remote = entry(2, 500, 100, 0, now);
        let entries = vec![&local, &remote];
        let mut locals = HashSet::new();
        locals.insert(local.tx_id);

        let ranked = PriorityPolicy.rank(&entries, now, &locals);
        assert_eq!(ranked[0], remote.tx_id, "non-local entry should be evicted first");
    }
}
