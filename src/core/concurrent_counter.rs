// src/core/concurrent_counter.rs

//! Thread-safe bag of `type -> count`, used to track pending launches
//! (component C). All operations are safe under parallel mutation;
//! `breakdown()` is a point-in-time copy.

use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

#[derive(Default)]
pub struct ConcurrentCounter {
    by_key: DashMap<String, AtomicI64>,
}

impl ConcurrentCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self, key: &str, n: i64) {
        self.by_key
            .entry(key.to_string())
            .or_insert_with(|| AtomicI64::new(0))
            .fetch_add(n, Ordering::SeqCst);
    }

    pub fn dec(&self, key: &str, n: i64) {
        self.inc(key, -n);
    }

    /// Total across all keys.
    pub fn value(&self) -> i64 {
        self.by_key
            .iter()
            .map(|entry| entry.value().load(Ordering::SeqCst))
            .sum()
    }

    /// Point-in-time snapshot of non-zero entries.
    pub fn breakdown(&self) -> HashMap<String, i64> {
        self.by_key
            .iter()
            .filter_map(|entry| {
                let v = entry.value().load(Ordering::SeqCst);
                if v != 0 {
                    Some((entry.key().clone(), v))
                } else {
                    None
                }
            })
            .collect()
    }

    pub fn get(&self, key: &str) -> i64 {
        self.by_key
            .get(key)
            .map(|v| v.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn inc_dec_and_breakdown() {
        let counter = ConcurrentCounter::new();
        counter.inc("worker", 3);
        counter.inc("gpu", 1);
        counter.dec("worker", 1);

        let breakdown = counter.breakdown();
        assert_eq!(breakdown.get("worker"), Some(&2));
        assert_eq!(breakdown.get("gpu"), Some(&1));
        assert_eq!(counter.value(), 3);
    }

    #[test]
    fn breakdown_omits_zeroed_entries() {
        let counter = ConcurrentCounter::new();
        counter.inc("worker", 2);
        counter.dec("worker", 2);
        assert!(counter.breakdown().is_empty());
    }

    #[test]
    fn concurrent_increments_are_consistent() {
        let counter = Arc::new(ConcurrentCounter::new());
        let mut handles = vec![];
        for _ in 0..8 {
            let c = counter.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    c.inc("worker", 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.get("worker"), 8000);
    }
}
