use crate::time::Offset;

/// Half-open `[start, stop)` intervals sorted by start offset.
#[derive(Clone, Debug)]
pub struct IntervalIndex<K> {
    entries: Vec<(Offset, Offset, K)>,
}

impl<K> Default for IntervalIndex<K> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<K: Copy + Ord> IntervalIndex<K> {
    pub fn insert(&mut self, key: K, start: Offset, stop: Offset) {
        self.remove(key);
        let index = self.entries.partition_point(|(existing, _, existing_key)| {
            (*existing, *existing_key) < (start, key)
        });
        self.entries.insert(index, (start, stop, key));
    }

    pub fn remove(&mut self, key: K) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(_, _, existing)| *existing != key);
        before != self.entries.len()
    }

    /// Keys whose interval contains `offset`.
    #[must_use]
    pub fn find_intersection(&self, offset: Offset) -> Vec<K> {
        let candidates = self.entries.partition_point(|(start, _, _)| *start <= offset);
        let mut keys: Vec<K> = self.entries[..candidates]
            .iter()
            .filter(|(_, stop, _)| offset < *stop)
            .map(|(_, _, key)| *key)
            .collect();
        keys.sort_unstable();
        keys
    }

    #[must_use]
    pub fn max_stop(&self) -> Option<Offset> {
        self.entries.iter().map(|(_, stop, _)| *stop).max()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intersection_is_half_open() {
        let mut index = IntervalIndex::default();
        index.insert(1_u32, Offset::ZERO, Offset::from(10.0));
        index.insert(2, Offset::from(5.0), Offset::from(15.0));
        index.insert(3, Offset::from(10.0), Offset::INFINITY);

        assert_eq!(index.find_intersection(Offset::ZERO), vec![1]);
        assert_eq!(index.find_intersection(Offset::from(7.0)), vec![1, 2]);
        assert_eq!(index.find_intersection(Offset::from(10.0)), vec![2, 3]);
        assert_eq!(index.find_intersection(Offset::from(99.0)), vec![3]);
        assert_eq!(index.max_stop(), Some(Offset::INFINITY));
    }

    #[test]
    fn reinserting_replaces_the_interval() {
        let mut index = IntervalIndex::default();
        index.insert(1_u32, Offset::ZERO, Offset::from(10.0));
        index.insert(1, Offset::ZERO, Offset::from(4.0));
        assert_eq!(index.len(), 1);
        assert!(index.find_intersection(Offset::from(5.0)).is_empty());
        assert!(index.remove(1));
        assert!(index.is_empty());
    }
}
