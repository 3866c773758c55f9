//! Backend selection strategies over the shared pool.
//!
//! Two algorithms are supported, chosen by name at construction time:
//!
//! - `roundrobin`: a lock-free monotonic cursor advanced exactly once per
//!   selection, scanning forward past dead backends.
//! - `random`: a uniform starting position per selection, with the same
//!   forward scan.
//!
//! Selection never mutates liveness; it only reads the atomic flags the
//! health prober maintains. The returned backend is advisory: it was
//! alive at the moment of the decision but may die before the caller
//! finishes using it.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use crate::backend::{Backend, BackendPool};
use crate::{Error, Result};

#[derive(Debug, Clone)]
enum Strategy {
    RoundRobin(Arc<AtomicUsize>),
    Random,
}

/// A backend selector, safe to call concurrently from every request task.
#[derive(Debug, Clone)]
pub struct Balancer {
    pool: BackendPool,
    strategy: Strategy,
}

impl Balancer {
    /// Builds a balancer from its configured algorithm name.
    ///
    /// Unknown names are a configuration error.
    pub fn new(algorithm: &str, pool: BackendPool) -> Result<Self> {
        let strategy = match algorithm {
            "roundrobin" => Strategy::RoundRobin(Arc::new(AtomicUsize::new(0))),
            "random" => Strategy::Random,
            other => {
                return Err(Error::Config(format!("invalid balancer algorithm: {other}")));
            }
        };

        Ok(Self { pool, strategy })
    }

    /// Selects a backend that was observed alive at the moment of the call.
    ///
    /// Starts at the strategy's position and scans forward at most one
    /// full rotation; returns `None` when the pool is empty or no backend
    /// is alive. The round-robin cursor advances exactly once per call,
    /// regardless of how many dead backends the scan skips.
    pub fn next(&self) -> Option<Backend> {
        let backends = self.pool.all();
        let n = backends.len();
        if n == 0 {
            return None;
        }

        let start = match &self.strategy {
            Strategy::RoundRobin(cursor) => cursor.fetch_add(1, Ordering::Relaxed) % n,
            Strategy::Random => rand::thread_rng().gen_range(0..n),
        };

        (0..n)
            .map(|offset| &backends[(start + offset) % n])
            .find(|backend| backend.is_alive())
            .cloned()
    }

    /// The pool this balancer selects from.
    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn make_pool(n: usize) -> BackendPool {
        let urls: Vec<String> = (0..n).map(|i| format!("http://b{i}:9000")).collect();
        BackendPool::from_urls(&urls).expect("test pool must be valid")
    }

    fn host_of(backend: &Backend) -> String {
        backend.url().host().unwrap().to_string()
    }

    fn selection_counts(balancer: &Balancer, calls: usize) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for _ in 0..calls {
            let backend = balancer.next().expect("a backend must be available");
            *counts.entry(host_of(&backend)).or_insert(0) += 1;
        }
        counts
    }

    #[test]
    fn round_robin_distributes_equally_when_all_alive() {
        let balancer = Balancer::new("roundrobin", make_pool(3)).unwrap();

        let counts = selection_counts(&balancer, 9);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|&c| c == 3), "expected 3/3/3, got {counts:?}");
    }

    #[test]
    fn round_robin_fairness_within_one() {
        let balancer = Balancer::new("roundrobin", make_pool(4)).unwrap();

        let counts = selection_counts(&balancer, 26);
        let min = counts.values().min().copied().unwrap();
        let max = counts.values().max().copied().unwrap();
        assert!(max - min <= 1, "distribution drifted: {counts:?}");
    }

    #[test]
    fn round_robin_never_selects_dead_backend() {
        let pool = make_pool(3);
        pool.all()[1].set_alive(false);
        let balancer = Balancer::new("roundrobin", pool).unwrap();

        let counts = selection_counts(&balancer, 6);
        assert!(!counts.contains_key("b1"), "dead backend was selected: {counts:?}");
        assert!(counts.contains_key("b0"));
        assert!(counts.contains_key("b2"));
    }

    #[test]
    fn next_returns_none_when_all_dead() {
        let pool = make_pool(2);
        for backend in pool.all() {
            backend.set_alive(false);
        }
        let balancer = Balancer::new("roundrobin", pool).unwrap();

        assert!(balancer.next().is_none());
    }

    #[test]
    fn next_returns_none_on_empty_pool() {
        for algorithm in ["roundrobin", "random"] {
            let balancer = Balancer::new(algorithm, make_pool(0)).unwrap();
            assert!(balancer.next().is_none());
        }
    }

    #[test]
    fn single_backend_is_always_selected() {
        let balancer = Balancer::new("roundrobin", make_pool(1)).unwrap();

        for _ in 0..5 {
            assert_eq!(host_of(&balancer.next().unwrap()), "b0");
        }

        balancer.pool().all()[0].set_alive(false);
        assert!(balancer.next().is_none());
    }

    #[test]
    fn revived_backend_returns_to_rotation() {
        let pool = make_pool(2);
        pool.all()[0].set_alive(false);
        let balancer = Balancer::new("roundrobin", pool).unwrap();

        for _ in 0..4 {
            assert_eq!(host_of(&balancer.next().unwrap()), "b1");
        }

        balancer.pool().all()[0].set_alive(true);
        let counts = selection_counts(&balancer, 4);
        assert_eq!(counts.get("b0"), Some(&2));
        assert_eq!(counts.get("b1"), Some(&2));
    }

    #[test]
    fn random_selects_every_alive_backend_eventually() {
        let balancer = Balancer::new("random", make_pool(3)).unwrap();

        let counts = selection_counts(&balancer, 600);
        assert_eq!(counts.len(), 3, "all alive backends should be hit: {counts:?}");
        assert!(
            counts.values().all(|&c| c > 100),
            "distribution far from uniform: {counts:?}"
        );
    }

    #[test]
    fn random_skips_dead_backends() {
        let pool = make_pool(3);
        pool.all()[0].set_alive(false);
        pool.all()[2].set_alive(false);
        let balancer = Balancer::new("random", pool).unwrap();

        for _ in 0..50 {
            assert_eq!(host_of(&balancer.next().unwrap()), "b1");
        }
    }

    #[test]
    fn unknown_algorithm_fails_construction() {
        let result = Balancer::new("leastconn", make_pool(2));
        assert!(result.is_err());
    }
}
