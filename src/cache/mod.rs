pub mod lru;

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::util::hash::hash;

/// A bounded concurrent map with per-entry charges. The database uses
/// one instance for decoded data blocks and one for open table handles.
pub trait Cache<K, V>: Send + Sync
where
    K: Send + Sync,
    V: Send + Sync + Clone,
{
    /// Inserts `key -> value`, accounting `charge` against the capacity.
    /// Returns the value previously stored under `key`, if any.
    fn insert(&self, key: K, value: V, charge: usize) -> Option<V>;

    fn get(&self, key: &K) -> Option<V>;

    fn erase(&self, key: &K);

    /// Sum of the charges of all resident entries.
    fn total_charge(&self) -> usize;
}

/// Splits a cache into independently locked shards to cut contention.
pub struct ShardedCache<C, K, V>
where
    C: Cache<K, V>,
    K: Send + Sync,
    V: Send + Sync + Clone,
{
    shards: Vec<C>,
    _marker: PhantomData<(fn(K), fn(V))>,
}

impl<C, K, V> ShardedCache<C, K, V>
where
    C: Cache<K, V>,
    K: Send + Sync + Hash + Eq,
    V: Send + Sync + Clone,
{
    pub fn new(shards: Vec<C>) -> Self {
        assert!(!shards.is_empty());
        ShardedCache {
            shards,
            _marker: PhantomData,
        }
    }

    fn shard(&self, key: &K) -> &C {
        let mut hasher = ShardHasher::default();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }
}

impl<C, K, V> Cache<K, V> for ShardedCache<C, K, V>
where
    C: Cache<K, V>,
    K: Send + Sync + Hash + Eq,
    V: Send + Sync + Clone,
{
    fn insert(&self, key: K, value: V, charge: usize) -> Option<V> {
        self.shard(&key).insert(key, value, charge)
    }

    fn get(&self, key: &K) -> Option<V> {
        self.shard(key).get(key)
    }

    fn erase(&self, key: &K) {
        self.shard(key).erase(key)
    }

    fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.total_charge()).sum()
    }
}

/// Routes `Hash` output through the crate hash so shard selection is
/// stable across platforms and runs.
#[derive(Default)]
struct ShardHasher {
    state: u32,
}

impl Hasher for ShardHasher {
    fn write(&mut self, bytes: &[u8]) {
        self.state = hash(bytes, self.state ^ 0x51_7c_c1_b7);
    }

    fn finish(&self) -> u64 {
        self.state as u64
    }
}

#[cfg(test)]
mod tests {
    use super::lru::LRUCache;
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;

    fn sharded(n: usize) -> ShardedCache<LRUCache<String, String>, String, String> {
        ShardedCache::new((0..n).map(|_| LRUCache::new(1 << 20)).collect())
    }

    #[test]
    fn test_sharded_basics() {
        let cache = sharded(8);
        assert_eq!(cache.insert("a".into(), "va".into(), 2), None);
        assert_eq!(cache.insert("b".into(), "vb".into(), 3), None);
        assert_eq!(cache.get(&"a".into()), Some("va".into()));
        assert_eq!(cache.total_charge(), 5);
        cache.erase(&"a".into());
        assert_eq!(cache.get(&"a".into()), None);
        assert_eq!(cache.total_charge(), 3);
    }

    #[test]
    fn test_concurrent_inserts_account_charges() {
        let cache = Arc::new(sharded(4));
        let total = Arc::new(AtomicUsize::new(0));
        let mut handles = vec![];
        for t in 0..4 {
            let cache = cache.clone();
            let total = total.clone();
            handles.push(thread::spawn(move || {
                for i in 1..=50usize {
                    let key = format!("{}-{}", t, i);
                    total.fetch_add(i, Ordering::SeqCst);
                    assert_eq!(cache.insert(key.clone(), key, i), None);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(cache.total_charge(), total.load(Ordering::SeqCst));
        for t in 0..4 {
            for i in 1..=50usize {
                let key = format!("{}-{}", t, i);
                assert_eq!(cache.get(&key), Some(key.clone()));
            }
        }
    }
}
