//! Bounded arena table with an access-ordered eviction list.
//!
//! Slots live in a `Vec` that never grows past `capacity`; freed slots are
//! recycled through a free list. List position encodes last access time:
//! `head` is the most recently accessed entry and `tail` the least, so
//! capacity eviction pops the tail.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

struct Slot<V> {
    key: String,
    value: V,
    inserted_at: Instant,
    prev: Option<usize>,
    next: Option<usize>,
}

/// Result of a lookup.
#[derive(Debug, PartialEq)]
pub(crate) enum Lookup<V> {
    Hit(V),
    Miss,
    /// The entry was present but past its TTL; it has been removed.
    Expired,
}

pub(crate) struct LruTable<V> {
    slots: Vec<Option<Slot<V>>>,
    free: Vec<usize>,
    index: HashMap<String, usize>,
    head: Option<usize>,
    tail: Option<usize>,
    capacity: usize,
}

impl<V: Clone> LruTable<V> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            free: Vec::new(),
            index: HashMap::with_capacity(capacity),
            head: None,
            tail: None,
            capacity,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Look up `key`, treating entries at least `ttl` old as absent.
    pub(crate) fn get(&mut self, key: &str, now: Instant, ttl: Duration) -> Lookup<V> {
        let Some(&idx) = self.index.get(key) else {
            return Lookup::Miss;
        };
        let expired = self
            .slot(idx)
            .is_some_and(|s| now.saturating_duration_since(s.inserted_at) >= ttl);
        if expired {
            self.remove_at(idx);
            return Lookup::Expired;
        }

        self.unlink(idx);
        self.push_front(idx);
        match self.slot(idx) {
            Some(slot) => Lookup::Hit(slot.value.clone()),
            None => Lookup::Miss,
        }
    }

    /// Insert or replace `key`. Returns the key evicted to make room, if any.
    ///
    /// Replacing an entry restarts its TTL.
    pub(crate) fn insert(&mut self, key: String, value: V, now: Instant) -> Option<String> {
        if let Some(&idx) = self.index.get(&key) {
            if let Some(slot) = self.slots[idx].as_mut() {
                slot.value = value;
                slot.inserted_at = now;
            }
            self.unlink(idx);
            self.push_front(idx);
            return None;
        }

        if self.capacity == 0 {
            return None;
        }

        let evicted = if self.index.len() >= self.capacity {
            self.tail.and_then(|idx| self.remove_at(idx))
        } else {
            None
        };

        let slot = Slot {
            key: key.clone(),
            value,
            inserted_at: now,
            prev: None,
            next: None,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.slots[idx] = Some(slot);
                idx
            }
            None => {
                self.slots.push(Some(slot));
                self.slots.len() - 1
            }
        };
        self.index.insert(key, idx);
        self.push_front(idx);
        evicted
    }

    pub(crate) fn remove(&mut self, key: &str) -> bool {
        match self.index.get(key) {
            Some(&idx) => self.remove_at(idx).is_some(),
            None => false,
        }
    }

    /// Remove every entry at least `ttl` old and return their keys.
    pub(crate) fn remove_expired(&mut self, now: Instant, ttl: Duration) -> Vec<String> {
        let stale: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                slot.as_ref()
                    .filter(|s| now.saturating_duration_since(s.inserted_at) >= ttl)
                    .map(|_| idx)
            })
            .collect();
        stale.into_iter().filter_map(|idx| self.remove_at(idx)).collect()
    }

    /// Drop every entry, returning how many there were.
    pub(crate) fn clear(&mut self) -> usize {
        let n = self.index.len();
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = None;
        self.tail = None;
        n
    }

    /// Keys from most to least recently accessed.
    #[cfg(test)]
    pub(crate) fn keys_by_recency(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            match self.slot(idx) {
                Some(slot) => {
                    keys.push(slot.key.clone());
                    cursor = slot.next;
                }
                None => break,
            }
        }
        keys
    }

    fn slot(&self, idx: usize) -> Option<&Slot<V>> {
        self.slots.get(idx).and_then(Option::as_ref)
    }

    fn remove_at(&mut self, idx: usize) -> Option<String> {
        self.unlink(idx);
        let slot = self.slots.get_mut(idx)?.take()?;
        self.index.remove(&slot.key);
        self.free.push(idx);
        Some(slot.key)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.slot(idx) {
            Some(s) => (s.prev, s.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(s) = self.slots[p].as_mut() {
                    s.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(s) = self.slots[n].as_mut() {
                    s.prev = prev;
                }
            }
            None => self.tail = prev,
        }
        if let Some(s) = self.slots[idx].as_mut() {
            s.prev = None;
            s.next = None;
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(s) = self.slots[idx].as_mut() {
            s.prev = None;
            s.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(s) = self.slots[h].as_mut() {
                s.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[test]
    fn insert_and_get() {
        let now = Instant::now();
        let mut t = LruTable::new(4);
        assert_eq!(t.insert("a".into(), 1, now), None);
        assert_eq!(t.get("a", now, TTL), Lookup::Hit(1));
        assert_eq!(t.get("b", now, TTL), Lookup::Miss);
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn access_moves_entry_to_front() {
        let now = Instant::now();
        let mut t = LruTable::new(4);
        t.insert("a".into(), 1, now);
        t.insert("b".into(), 2, now);
        t.insert("c".into(), 3, now);
        assert_eq!(t.keys_by_recency(), vec!["c", "b", "a"]);
        t.get("a", now, TTL);
        assert_eq!(t.keys_by_recency(), vec!["a", "c", "b"]);
    }

    #[test]
    fn full_table_evicts_least_recently_accessed() {
        let now = Instant::now();
        let mut t = LruTable::new(2);
        t.insert("a".into(), 1, now);
        t.insert("b".into(), 2, now);
        t.get("a", now, TTL);
        assert_eq!(t.insert("c".into(), 3, now), Some("b".to_string()));
        assert_eq!(t.len(), 2);
        assert_eq!(t.get("b", now, TTL), Lookup::Miss);
        assert_eq!(t.keys_by_recency(), vec!["c", "a"]);
    }

    #[test]
    fn replacing_does_not_evict() {
        let now = Instant::now();
        let mut t = LruTable::new(2);
        t.insert("a".into(), 1, now);
        t.insert("b".into(), 2, now);
        assert_eq!(t.insert("a".into(), 10, now), None);
        assert_eq!(t.get("a", now, TTL), Lookup::Hit(10));
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn freed_slots_are_reused() {
        let now = Instant::now();
        let mut t = LruTable::new(3);
        for i in 0..50 {
            t.insert(format!("k{i}"), i, now);
            if i % 2 == 0 {
                t.remove(&format!("k{i}"));
            }
        }
        assert!(t.slots.len() <= t.capacity());
    }

    #[test]
    fn expired_entry_is_removed_on_get() {
        let start = Instant::now();
        let mut t = LruTable::new(2);
        t.insert("a".into(), 1, start);
        assert_eq!(t.get("a", start + TTL, TTL), Lookup::Expired);
        assert_eq!(t.len(), 0);
        assert_eq!(t.get("a", start + TTL, TTL), Lookup::Miss);
    }

    #[test]
    fn remove_expired_keeps_fresh_entries() {
        let start = Instant::now();
        let mut t = LruTable::new(4);
        t.insert("old".into(), 1, start);
        t.insert("new".into(), 2, start + Duration::from_secs(200));
        let removed = t.remove_expired(start + TTL, TTL);
        assert_eq!(removed, vec!["old".to_string()]);
        assert_eq!(t.keys_by_recency(), vec!["new"]);
    }

    #[test]
    fn clear_empties_everything() {
        let now = Instant::now();
        let mut t = LruTable::new(4);
        t.insert("a".into(), 1, now);
        t.insert("b".into(), 2, now);
        assert_eq!(t.clear(), 2);
        assert_eq!(t.len(), 0);
        assert!(t.keys_by_recency().is_empty());
        t.insert("c".into(), 3, now);
        assert_eq!(t.keys_by_recency(), vec!["c"]);
    }
}
