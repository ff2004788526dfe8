use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::cache::Cache;

/// A slot in the slab backing the recency list. Index 0 is the sentinel:
/// `next` of the sentinel is the most recent entry, `prev` the least.
struct Slot<K, V> {
    key: Option<K>,
    value: Option<V>,
    charge: usize,
    prev: usize,
    next: usize,
}

struct LRUInner<K, V> {
    table: HashMap<K, usize>,
    slots: Vec<Slot<K, V>>,
    free: Vec<usize>,
}

impl<K, V> LRUInner<K, V> {
    fn detach(&mut self, i: usize) {
        let (prev, next) = (self.slots[i].prev, self.slots[i].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn attach_front(&mut self, i: usize) {
        let first = self.slots[0].next;
        self.slots[i].prev = 0;
        self.slots[i].next = first;
        self.slots[first].prev = i;
        self.slots[0].next = i;
    }

    fn allot(&mut self, key: K, value: V, charge: usize) -> usize {
        let slot = Slot {
            key: Some(key),
            value: Some(value),
            charge,
            prev: 0,
            next: 0,
        };
        match self.free.pop() {
            Some(i) => {
                self.slots[i] = slot;
                i
            }
            None => {
                self.slots.push(slot);
                self.slots.len() - 1
            }
        }
    }
}

/// A least-recently-used cache bounded by total charge. All operations
/// lock one mutex; contention is the sharded wrapper's problem.
pub struct LRUCache<K, V: Clone> {
    capacity: usize,
    usage: AtomicUsize,
    inner: Mutex<LRUInner<K, V>>,
}

impl<K: Hash + Eq + Clone, V: Clone> LRUCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        let sentinel = Slot {
            key: None,
            value: None,
            charge: 0,
            prev: 0,
            next: 0,
        };
        LRUCache {
            capacity,
            usage: AtomicUsize::new(0),
            inner: Mutex::new(LRUInner {
                table: HashMap::new(),
                slots: vec![sentinel],
                free: vec![],
            }),
        }
    }

    /// Evicts least-recent entries until usage fits the capacity, never
    /// evicting `keep` (the entry just inserted).
    fn evict_over_capacity(&self, inner: &mut LRUInner<K, V>, keep: usize) {
        while self.usage.load(Ordering::Relaxed) > self.capacity {
            let oldest = inner.slots[0].prev;
            if oldest == 0 || oldest == keep {
                break;
            }
            self.remove_slot(inner, oldest);
        }
    }

    fn remove_slot(&self, inner: &mut LRUInner<K, V>, i: usize) -> Option<V> {
        inner.detach(i);
        let charge = inner.slots[i].charge;
        self.usage.fetch_sub(charge, Ordering::Relaxed);
        let key = inner.slots[i].key.take().expect("sentinel cannot be removed");
        inner.table.remove(&key);
        let value = inner.slots[i].value.take();
        inner.free.push(i);
        value
    }
}

impl<K, V> Cache<K, V> for LRUCache<K, V>
where
    K: Hash + Eq + Clone + Send + Sync,
    V: Clone + Send + Sync,
{
    fn insert(&self, key: K, value: V, charge: usize) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let existing = inner.table.get(&key).copied();
        let old = match existing {
            Some(i) => {
                let old = {
                    let slot = &mut inner.slots[i];
                    let old = slot.value.replace(value);
                    self.usage
                        .fetch_add(charge.wrapping_sub(slot.charge), Ordering::Relaxed);
                    slot.charge = charge;
                    old
                };
                inner.detach(i);
                inner.attach_front(i);
                self.evict_over_capacity(&mut inner, i);
                old
            }
            None => {
                let i = inner.allot(key.clone(), value, charge);
                inner.table.insert(key, i);
                inner.attach_front(i);
                self.usage.fetch_add(charge, Ordering::Relaxed);
                self.evict_over_capacity(&mut inner, i);
                None
            }
        };
        old
    }

    fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let i = *inner.table.get(key)?;
        inner.detach(i);
        inner.attach_front(i);
        inner.slots[i].value.clone()
    }

    fn erase(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(i) = inner.table.get(key).copied() {
            self.remove_slot(&mut inner, i);
        }
    }

    fn total_charge(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }
}
