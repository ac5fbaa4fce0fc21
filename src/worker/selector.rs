use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::WorkerError;

/// How a pool (or the cluster) picks the instance that handles a message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// Same key, same instance. Required wherever state is keyed.
    #[default]
    Affinity,
    /// Spread messages evenly, ignoring the key.
    RoundRobin,
}

impl SelectionStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Affinity => "affinity",
            Self::RoundRobin => "round_robin",
        }
    }
}

/// Process-independent 64-bit hash of a routing key.
///
/// First 8 bytes (big-endian) of the SHA-256 digest of the UTF-8 key, so
/// every node and every restart maps a key to the same value.
pub fn stable_hash(key: &str) -> u64 {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(prefix)
}

/// Picks an index in `[0, pool_size)` for each message.
#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    pool_size: usize,
    counter: AtomicUsize,
}

impl Selector {
    /// Creates a selector over a fixed pool. An empty pool is rejected.
    pub fn new(strategy: SelectionStrategy, pool_size: usize) -> Result<Self, WorkerError> {
        if pool_size == 0 {
            return Err(WorkerError::EmptyPool);
        }
        Ok(Self {
            strategy,
            pool_size,
            counter: AtomicUsize::new(0),
        })
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Returns the instance index for `key`.
    pub fn select(&self, key: &str) -> usize {
        match self.strategy {
            SelectionStrategy::Affinity => (stable_hash(key) % self.pool_size as u64) as usize,
            SelectionStrategy::RoundRobin => {
                self.counter.fetch_add(1, Ordering::Relaxed) % self.pool_size
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stable_hash_pinned() {
        assert_eq!(stable_hash("svcA"), 0xcf74_7a06_12ab_0799);
        assert_eq!(stable_hash("k"), 0x8254_c329_a928_50f6);
        assert_eq!(stable_hash("b1_svcA"), 0x090b_0625_30a8_c95a);
    }

    #[test]
    fn test_affinity_is_stable() {
        let a = Selector::new(SelectionStrategy::Affinity, 3).unwrap();
        let b = Selector::new(SelectionStrategy::Affinity, 3).unwrap();
        assert_eq!(a.select("svcA"), 2);
        assert_eq!(a.select("svcB"), 0);
        assert_eq!(a.select("k"), 1);
        for key in ["svcA", "svcB", "k", "b1_svcA"] {
            assert_eq!(a.select(key), b.select(key));
            assert_eq!(a.select(key), a.select(key));
        }
    }

    #[test]
    fn test_round_robin_cycles() {
        let s = Selector::new(SelectionStrategy::RoundRobin, 3).unwrap();
        let picks: Vec<usize> = (0..6).map(|_| s.select("ignored")).collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_empty_pool_rejected() {
        assert!(matches!(
            Selector::new(SelectionStrategy::Affinity, 0),
            Err(WorkerError::EmptyPool)
        ));
    }
}
