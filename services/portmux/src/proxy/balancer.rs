//! Per-service backend selection.
//!
//! Round-robin over a fixed target list. There is no health tracking: a
//! dead target stays in rotation and the session's retry loop moves past it.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::ConfigError;

/// Round-robin selector over a service's targets.
#[derive(Debug)]
pub struct LoadBalancer {
    /// Backend addresses (`host:port`) in rotation order.
    targets: Vec<String>,
    /// Round-robin counter.
    cursor: AtomicUsize,
}

impl LoadBalancer {
    /// Create a balancer for `service`. An empty target list is rejected here
    /// so `next` never has to handle it.
    pub fn new(service: &str, targets: Vec<String>) -> Result<Self, ConfigError> {
        if targets.is_empty() {
            return Err(ConfigError::EmptyTargets(service.to_string()));
        }

        Ok(Self {
            targets,
            cursor: AtomicUsize::new(0),
        })
    }

    /// Pick the next target.
    ///
    /// The index comes from a single `fetch_add`, so concurrent callers never
    /// observe the same cursor value. Wrapping of the counter itself only
    /// shifts which target comes next.
    pub fn next(&self) -> &str {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.targets.len();
        &self.targets[idx]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn targets(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("127.0.0.1:{}", 9001 + i)).collect()
    }

    #[test]
    fn test_empty_targets_rejected() {
        match LoadBalancer::new("web", Vec::new()) {
            Err(ConfigError::EmptyTargets(name)) => assert_eq!(name, "web"),
            other => panic!("Expected EmptyTargets, got {:?}", other),
        }
    }

    #[test]
    fn test_round_robin_order() {
        for len in 1..=5 {
            let lb = LoadBalancer::new("web", targets(len)).unwrap();

            let picked: Vec<String> = (0..len).map(|_| lb.next().to_string()).collect();
            assert_eq!(picked, targets(len));

            // L+1-th call wraps to the first target
            assert_eq!(lb.next(), targets(len)[0]);
        }
    }

    #[test]
    fn test_dead_targets_stay_in_rotation() {
        let lb = LoadBalancer::new(
            "web",
            vec!["127.0.0.1:1".to_string(), "127.0.0.1:9001".to_string()],
        )
        .unwrap();

        assert_eq!(lb.next(), "127.0.0.1:1");
        assert_eq!(lb.next(), "127.0.0.1:9001");
        assert_eq!(lb.next(), "127.0.0.1:1");
    }

    #[test]
    fn test_concurrent_selection_is_fair() {
        const THREADS: usize = 8;
        const CALLS_PER_THREAD: usize = 3000;
        const TARGETS: usize = 3;

        let lb = Arc::new(LoadBalancer::new("web", targets(TARGETS)).unwrap());

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let lb = Arc::clone(&lb);
                std::thread::spawn(move || {
                    let mut counts: HashMap<String, usize> = HashMap::new();
                    for _ in 0..CALLS_PER_THREAD {
                        *counts.entry(lb.next().to_string()).or_default() += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals: HashMap<String, usize> = HashMap::new();
        for handle in handles {
            for (target, count) in handle.join().unwrap() {
                *totals.entry(target).or_default() += count;
            }
        }

        // N calls hand out exactly N/L of each target, whatever the interleaving
        let expected = THREADS * CALLS_PER_THREAD / TARGETS;
        assert_eq!(totals.len(), TARGETS);
        for target in targets(TARGETS) {
            assert_eq!(totals[&target], expected, "target {}", target);
        }
    }
}
