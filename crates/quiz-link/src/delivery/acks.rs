use std::collections::{HashSet, VecDeque};

/// Insertion-ordered set of message ids with a hard cap. When an insert would
/// exceed the cap, the oldest half is evicted.
#[derive(Debug)]
pub struct BoundedIdSet {
    order: VecDeque<String>,
    members: HashSet<String>,
    capacity: usize,
}

impl BoundedIdSet {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            order: VecDeque::with_capacity(capacity),
            members: HashSet::with_capacity(capacity),
            capacity,
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.members.contains(id)
    }

    /// Returns `false` if the id was already present.
    pub fn insert(&mut self, id: &str) -> bool {
        if self.members.contains(id) {
            return false;
        }
        if self.order.len() >= self.capacity {
            let evict = self.capacity / 2;
            for stale in self.order.drain(..evict) {
                self.members.remove(&stale);
            }
        }
        self.order.push_back(id.to_string());
        self.members.insert(id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.members.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_evicts_oldest_half() {
        let mut set = BoundedIdSet::new(100);
        for idx in 0..100 {
            assert!(set.insert(&format!("m{idx}")));
        }
        assert_eq!(set.len(), 100);

        set.insert("m100");
        assert_eq!(set.len(), 51);
        assert!(!set.contains("m0"));
        assert!(!set.contains("m49"));
        assert!(set.contains("m50"));
        assert!(set.contains("m100"));
    }

    #[test]
    fn duplicate_insert_is_reported() {
        let mut set = BoundedIdSet::new(4);
        assert!(set.insert("a"));
        assert!(!set.insert("a"));
        assert_eq!(set.len(), 1);
    }
}
