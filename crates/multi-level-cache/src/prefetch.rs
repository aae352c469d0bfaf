use dashmap::DashMap;
use parking_lot::Mutex;

/// Observes consecutive `get` calls and records conditional access
/// probabilities `P(B|A)` (§4.4 "Optional prefetching"). Disabled by
/// default; when enabled, `record_and_predict` returns the best
/// successor key whose estimated probability clears `threshold`.
pub struct PrefetchTracker {
    enabled: bool,
    threshold: f64,
    last_key: Mutex<Option<Vec<u8>>>,
    pair_counts: DashMap<(Vec<u8>, Vec<u8>), u64>,
    key_counts: DashMap<Vec<u8>, u64>,
}

impl PrefetchTracker {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            threshold: 1.0,
            last_key: Mutex::new(None),
            pair_counts: DashMap::new(),
            key_counts: DashMap::new(),
        }
    }

    pub fn enabled(threshold: f64) -> Self {
        Self {
            enabled: true,
            threshold,
            last_key: Mutex::new(None),
            pair_counts: DashMap::new(),
            key_counts: DashMap::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Call on every `get(key)`. Returns `Some(successor)` if a
    /// successor's conditional probability given `key` meets the
    /// threshold.
    pub fn record_and_predict(&self, key: &[u8]) -> Option<Vec<u8>> {
        if !self.enabled {
            return None;
        }
        *self.key_counts.entry(key.to_vec()).or_insert(0) += 1;

        let mut last = self.last_key.lock();
        let previous = last.replace(key.to_vec());
        if let Some(previous_key) = previous {
            *self.pair_counts.entry((previous_key, key.to_vec())).or_insert(0) += 1;
        }
        drop(last);

        let total_for_key = *self.key_counts.get(key).map(|v| *v).get_or_insert(0);
        if total_for_key == 0 {
            return None;
        }

        self.pair_counts
            .iter()
            .filter(|entry| entry.key().0 == key)
            .map(|entry| (entry.key().1.clone(), *entry.value() as f64 / total_for_key as f64))
            .filter(|(_, probability)| *probability >= self.threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(successor, _)| successor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_tracker_never_predicts() {
        let tracker = PrefetchTracker::disabled();
        tracker.record_and_predict(b"a");
        assert_eq!(tracker.record_and_predict(b"b"), None);
    }

    #[test]
    fn consistent_pair_crosses_threshold() {
        let tracker = PrefetchTracker::enabled(0.5);
        // First round just seeds the (a, b) pair; no prediction possible yet.
        assert_eq!(tracker.record_and_predict(b"a"), None);
        assert_eq!(tracker.record_and_predict(b"b"), None);

        // Second "a" has one prior (a, b) observation out of one prior "a"
        // access, so P(b|a) = 1.0 clears the 0.5 threshold.
        assert_eq!(tracker.record_and_predict(b"a"), Some(b"b".to_vec()));
    }
}
