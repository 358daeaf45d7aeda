//! Quota protector (spec §4.7): per-source admission counting, independent
//! of byte-size accounting. Sources are caller-supplied labels (e.g. a peer
//! id or `"local"`); submissions with no distinguishable source are counted
//! under a single synthetic `"all"` bucket alongside everything else.

use std::collections::HashMap;

/// Tracks live (Pending..PendingConfirm) entry counts per source and overall,
/// gating admission against configured caps. `max_per_source == 0` or
/// `max_total == 0` disables that particular cap.
#[derive(Debug, Default)]
pub struct QuotaProtector {
    per_source: HashMap<String, usize>,
    total: usize,
    max_per_source: usize,
    max_total: usize,
}

/// Catch-all bucket key for submissions that do not carry a distinct source
/// label, and the key under which the global total is also tracked.
pub const ALL_SOURCES: &str = "all";

impl QuotaProtector {
    pub fn new(max_per_source: usize, max_total: usize) -> Self {
        Self {
            per_source: HashMap::new(),
            total: 0,
            max_per_source,
            max_total,
        }
    }

    /// Returns `true` iff admitting one more entry from `source` would stay
    /// within both the per-source and global caps. Does not mutate state.
    pub fn check(&self, source: &str) -> bool {
        if self.max_total > 0 && self.total >= self.max_total {
            return false;
        }
        if self.max_per_source > 0 {
            let current = self.per_source.get(source).copied().unwrap_or(0);
            let current_all = if source != ALL_SOURCES {
                self.per_source.get(ALL_SOURCES).copied().unwrap_or(0)
            } else {
                0
            };
            if current + current_all >= self.max_per_source {
                return false;
            }
        }
        true
    }

    /// Records one admitted entry from `source`. Caller must have checked
    /// [`check`] first; this never rejects.
    pub fn add(&mut self, source: &str) {
        *self.per_source.entry(source.to_string()).or_insert(0) += 1;
        self.total += 1;
    }

    /// Records one entry leaving the live set (removed, confirmed, expired,
    /// rejected).
    pub fn remove(&mut self, source: &str) {
        if let Some(count) = self.per_source.get_mut(source) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.per_source.remove(source);
            }
        }
        self.total = self.total.saturating_sub(1);
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn count_for(&self, source: &str) -> usize {
        self.per_source.get(source).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_once_global_cap_reached() {
        let mut protector = QuotaProtector::new(0, 2);
        assert!(protector.check("peer-a"));
        protector.add("peer-a");
        assert!(protector.check("peer-b"));
        protector.add("peer-b");
        assert!(!protector.check("peer-c"));
    }

    #[test]
    fn rejects_once_per_source_cap_reached() {
        let mut protector = QuotaProtector::new(2, 0);
        protector.add("peer-a");
        protector.add("peer-a");
        assert!(!protector.check("peer-a"));
        assert!(protector.check("peer-b"));
    }

    #[test]
    fn remove_frees_quota() {
        let mut protector = QuotaProtector::new(1, 0);
        protector.add("peer-a");
        assert!(!protector.check("peer-a"));
        protector.remove("peer-a");
        assert!(protector.check("peer-a"));
        assert_eq!(protector.total(), 0);
    }

    #[test]
    fn zero_caps_disable_limiting() {
        let protector = QuotaProtector::new(0, 0);
        assert!(protector.check("anyone"));
    }
}
