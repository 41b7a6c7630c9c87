use std::collections::VecDeque;

use rustc_hash::FxHashMap;


/// Duplicate-broadcast suppression: a bounded FIFO of recently forwarded
///  packet ids. The multiset counter tolerates the same id being recorded
///  several times with independent evictions.
///
/// IDs are 32-bit random values; a collision merely costs one redundant
///  forward, so nothing here needs to be cryptographically strong.
pub struct IdCache {
    age: VecDeque<u32>,
    counts: FxHashMap<u32, u32>,
    max_size: usize,
}

impl IdCache {
    pub fn new(max_size: usize) -> IdCache {
        IdCache {
            age: VecDeque::new(),
            counts: FxHashMap::default(),
            max_size: max_size.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.age.len()
    }

    pub fn already_seen(&self, id: u32) -> bool {
        self.counts.contains_key(&id)
    }

    pub fn record(&mut self, id: u32) {
        while self.age.len() >= self.max_size {
            let Some(oldest) = self.age.pop_front() else {
                break;
            };
            if let Some(count) = self.counts.get_mut(&oldest) {
                *count -= 1;
                if *count == 0 {
                    self.counts.remove(&oldest);
                }
            }
        }
        *self.counts.entry(id).or_insert(0) += 1;
        self.age.push_back(id);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_record_and_lookup() {
        let mut cache = IdCache::new(4);
        assert!(!cache.already_seen(1));
        cache.record(1);
        assert!(cache.already_seen(1));
        assert!(!cache.already_seen(2));
    }

    #[test]
    fn test_fifo_eviction() {
        let mut cache = IdCache::new(3);
        for id in 1..=3 {
            cache.record(id);
        }
        assert_eq!(cache.len(), 3);

        cache.record(4);
        assert_eq!(cache.len(), 3);
        assert!(!cache.already_seen(1));
        assert!(cache.already_seen(2));
        assert!(cache.already_seen(4));
    }

    #[test]
    fn test_repeated_id_survives_partial_eviction() {
        let mut cache = IdCache::new(3);
        cache.record(7);
        cache.record(8);
        cache.record(7);

        // evicts the oldest entry for 7, but the newer one remains
        cache.record(9);
        assert!(cache.already_seen(7));

        // evicting 8 and then the second 7 finally forgets it
        cache.record(10);
        cache.record(11);
        assert!(!cache.already_seen(7));
    }

    #[test]
    fn test_bound_is_never_exceeded() {
        let mut cache = IdCache::new(16);
        for id in 0..1000 {
            cache.record(id % 5);
            assert!(cache.len() <= 16);
        }
    }
}
