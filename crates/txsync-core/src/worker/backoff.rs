//! Retry pacing for ids that could not be resolved
//!
//! An id with multiplier `m` is attempted on cycle `c` iff `c % m == 0`.
//! Each failed attempt doubles `m` up to a cap; success forgets the id.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;

/// Multipliers of unresolved ids
#[derive(Debug)]
pub struct Backoff<K> {
    entries: Mutex<HashMap<K, u64>>,
    cap: u64,
}

impl<K: Eq + Hash + Clone> Backoff<K> {
    pub fn new(cap: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            cap: cap.max(1),
        }
    }

    /// Start tracking an id with multiplier 1. Returns `false` if already tracked.
    pub fn track(&self, id: &K) -> bool {
        let mut entries = self.entries.lock();
        if entries.contains_key(id) {
            return false;
        }
        entries.insert(id.clone(), 1);
        true
    }

    /// Untracked ids are always due
    pub fn is_due(&self, id: &K, cycle: u64) -> bool {
        match self.entries.lock().get(id) {
            Some(multiplier) => cycle % multiplier == 0,
            None => true,
        }
    }

    /// Record a failed attempt and return the new multiplier.
    ///
    /// An untracked id starts at 1.
    pub fn failed(&self, id: &K) -> u64 {
        let mut entries = self.entries.lock();
        match entries.get_mut(id) {
            Some(multiplier) => {
                *multiplier = multiplier.saturating_mul(2).min(self.cap);
                *multiplier
            }
            None => {
                entries.insert(id.clone(), 1);
                1
            }
        }
    }

    /// Forget an id after it resolved
    pub fn succeeded(&self, id: &K) -> bool {
        self.entries.lock().remove(id).is_some()
    }

    pub fn multiplier(&self, id: &K) -> Option<u64> {
        self.entries.lock().get(id).copied()
    }

    pub fn ids(&self) -> Vec<K> {
        self.entries.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_is_always_due() {
        let backoff: Backoff<&str> = Backoff::new(1024);
        assert!(backoff.is_due(&"x", 7));
        assert_eq!(backoff.multiplier(&"x"), None);
    }

    #[test]
    fn test_failures_double_until_cap() {
        let backoff = Backoff::new(8);
        assert!(backoff.track(&"x"));
        assert!(!backoff.track(&"x"));

        assert_eq!(backoff.failed(&"x"), 2);
        assert_eq!(backoff.failed(&"x"), 4);
        assert_eq!(backoff.failed(&"x"), 8);
        assert_eq!(backoff.failed(&"x"), 8);
    }

    #[test]
    fn test_due_cycles_follow_multiplier() {
        let backoff = Backoff::new(1024);
        backoff.track(&"x");
        backoff.failed(&"x");
        backoff.failed(&"x");

        let due: Vec<u64> = (1..=12).filter(|c| backoff.is_due(&"x", *c)).collect();
        assert_eq!(due, vec![4, 8, 12]);
    }

    #[test]
    fn test_success_forgets_id() {
        let backoff = Backoff::new(1024);
        backoff.failed(&"x");
        backoff.failed(&"x");
        assert!(backoff.succeeded(&"x"));
        assert!(!backoff.succeeded(&"x"));
        assert!(backoff.is_due(&"x", 3));
        assert!(backoff.is_empty());
    }
}
