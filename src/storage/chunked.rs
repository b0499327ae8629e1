use std::collections::VecDeque;

/// Default number of entries per chunk
pub const DEFAULT_CHUNK_SIZE: usize = 512;

/// Fixed-capacity run of sorted keys and their values.
/// Chunks are never empty while they are linked into the array.
#[derive(Debug, Clone)]
struct Chunk<K, V> {
    keys: Vec<K>,
    values: Vec<V>,
}

impl<K: Ord + Copy, V> Chunk<K, V> {
    fn with_entry(capacity: usize, key: K, value: V) -> Self {
        let mut keys = Vec::with_capacity(capacity);
        let mut values = Vec::with_capacity(capacity);
        keys.push(key);
        values.push(value);
        Self { keys, values }
    }

    fn first(&self) -> K {
        self.keys[0]
    }

    fn last(&self) -> K {
        self.keys[self.keys.len() - 1]
    }

    fn len(&self) -> usize {
        self.keys.len()
    }
}

/// Ordered map keyed by timestamp, stored as a list of sorted chunks.
///
/// Built for the time-series append pattern: appending a key larger than
/// every stored key is O(1), range scans touch only the chunks that overlap
/// the range, and `trim` drops whole chunks from the front without moving
/// the remaining data.
#[derive(Debug, Clone)]
pub struct ChunkedAssociativeArray<K, V> {
    chunks: VecDeque<Chunk<K, V>>,
    chunk_size: usize,
    len: usize,
}

impl<K: Ord + Copy, V> Default for ChunkedAssociativeArray<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Ord + Copy, V> ChunkedAssociativeArray<K, V> {
    pub fn new() -> Self {
        Self::with_chunk_size(DEFAULT_CHUNK_SIZE)
    }

    pub fn with_chunk_size(chunk_size: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            chunk_size: chunk_size.max(2),
            len: 0,
        }
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of linked chunks
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn first_key(&self) -> Option<K> {
        self.chunks.front().map(|c| c.first())
    }

    pub fn last_key(&self) -> Option<K> {
        self.chunks.back().map(|c| c.last())
    }

    /// Insert or overwrite the value stored under `key`
    pub fn put(&mut self, key: K, value: V) {
        let chunk_size = self.chunk_size;
        match self.chunks.back_mut() {
            None => {
                self.chunks.push_back(Chunk::with_entry(chunk_size, key, value));
                self.len += 1;
            }
            Some(back) if key > back.last() => {
                if back.len() >= chunk_size {
                    self.chunks.push_back(Chunk::with_entry(chunk_size, key, value));
                } else {
                    back.keys.push(key);
                    back.values.push(value);
                }
                self.len += 1;
            }
            Some(back) if key == back.last() => {
                if let Some(slot) = back.values.last_mut() {
                    *slot = value;
                }
            }
            Some(_) => self.insert_ordered(key, value),
        }
    }

    /// Out-of-order insert. Splits the target chunk when it overflows.
    fn insert_ordered(&mut self, key: K, value: V) {
        let idx = self.chunks.partition_point(|c| c.last() < key);
        let chunk_size = self.chunk_size;
        let chunk = &mut self.chunks[idx];

        match chunk.keys.binary_search(&key) {
            Ok(pos) => chunk.values[pos] = value,
            Err(pos) => {
                chunk.keys.insert(pos, key);
                chunk.values.insert(pos, value);
                self.len += 1;

                if chunk.len() > chunk_size {
                    let half = chunk.len() / 2;
                    let keys = chunk.keys.split_off(half);
                    let values = chunk.values.split_off(half);
                    self.chunks.insert(idx + 1, Chunk { keys, values });
                }
            }
        }
    }

    fn locate(&self, key: K) -> Option<(usize, usize)> {
        let idx = self.chunks.partition_point(|c| c.last() < key);
        let chunk = self.chunks.get(idx)?;
        chunk.keys.binary_search(&key).ok().map(|pos| (idx, pos))
    }

    pub fn get(&self, key: K) -> Option<&V> {
        let (idx, pos) = self.locate(key)?;
        self.chunks[idx].values.get(pos)
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        let (idx, pos) = self.locate(key)?;
        self.chunks[idx].values.get_mut(pos)
    }

    pub fn contains_key(&self, key: K) -> bool {
        self.locate(key).is_some()
    }

    /// Entries whose keys fall in `[start, end]`, in key order
    pub fn range(&self, start: K, end: K) -> impl Iterator<Item = (K, &V)> + '_ {
        let first = self.chunks.partition_point(|c| c.last() < start);
        self.chunks
            .range(first..)
            .flat_map(|c| c.keys.iter().copied().zip(c.values.iter()))
            .skip_while(move |(k, _)| *k < start)
            .take_while(move |(k, _)| *k <= end)
    }

    /// All entries in key order
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.chunks
            .iter()
            .flat_map(|c| c.keys.iter().copied().zip(c.values.iter()))
    }

    /// Drop every entry with a key below `min_key`. Returns the number removed.
    pub fn trim(&mut self, min_key: K) -> usize {
        let mut removed = 0;

        while let Some(front) = self.chunks.front() {
            if front.last() >= min_key {
                break;
            }
            removed += front.len();
            self.chunks.pop_front();
        }

        if let Some(front) = self.chunks.front_mut() {
            let cut = front.keys.partition_point(|k| *k < min_key);
            if cut > 0 {
                front.keys.drain(..cut);
                front.values.drain(..cut);
                removed += cut;
            }
        }

        self.len -= removed;
        removed
    }

    pub fn clear(&mut self) {
        self.chunks.clear();
        self.len = 0;
    }
}

impl<K: Ord + Copy, V: Clone> ChunkedAssociativeArray<K, V> {
    /// Values whose keys fall in `[start, end]`
    pub fn get_values(&self, start: K, end: K) -> Vec<V> {
        self.range(start, end).map(|(_, v)| v.clone()).collect()
    }

    /// Every stored value in key order
    pub fn values(&self) -> Vec<V> {
        self.iter().map(|(_, v)| v.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled(chunk_size: usize, keys: impl IntoIterator<Item = i64>) -> ChunkedAssociativeArray<i64, i64> {
        let mut arr = ChunkedAssociativeArray::with_chunk_size(chunk_size);
        for k in keys {
            arr.put(k, k * 10);
        }
        arr
    }

    #[test]
    fn test_append_and_chunking() {
        let arr = filled(4, 0..10);
        assert_eq!(arr.len(), 10);
        assert_eq!(arr.chunk_count(), 3);
        assert_eq!(arr.first_key(), Some(0));
        assert_eq!(arr.last_key(), Some(9));
        assert_eq!(arr.get(7), Some(&70));
        assert_eq!(arr.get(10), None);
    }

    #[test]
    fn test_get_values_closed_range() {
        let arr = filled(4, (0..50).map(|i| i * 10));
        assert_eq!(arr.get_values(95, 140), vec![1000, 1100, 1200, 1300, 1400]);
        assert_eq!(arr.get_values(100, 100), vec![1000]);
        assert!(arr.get_values(1000, 2000).is_empty());
        assert!(arr.get_values(50, 40).is_empty());
    }

    #[test]
    fn test_trim_keeps_suffix_in_order() {
        let mut arr = filled(4, 0..20);
        let removed = arr.trim(9);

        assert_eq!(removed, 9);
        assert_eq!(arr.len(), 11);
        assert_eq!(arr.first_key(), Some(9));
        let expected: Vec<i64> = (9..20).map(|k| k * 10).collect();
        assert_eq!(arr.values(), expected);
    }

    #[test]
    fn test_trim_everything() {
        let mut arr = filled(4, 0..10);
        assert_eq!(arr.trim(100), 10);
        assert!(arr.is_empty());
        assert_eq!(arr.chunk_count(), 0);
        assert_eq!(arr.trim(200), 0);
    }

    #[test]
    fn test_equal_key_overwrites() {
        let mut arr = filled(4, 0..3);
        arr.put(2, -1);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(2), Some(&-1));
    }

    #[test]
    fn test_out_of_order_insert_splits() {
        let mut arr = filled(4, (0..8).map(|i| i * 10));
        arr.put(15, 1);
        arr.put(12, 2);
        arr.put(35, 3);
        arr.put(20, 4);

        let keys: Vec<i64> = arr.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec![0, 10, 12, 15, 20, 30, 35, 40, 50, 60, 70]);
        assert_eq!(arr.len(), 11);
        assert_eq!(arr.get(20), Some(&4));
    }

    #[test]
    fn test_get_mut() {
        let mut arr: ChunkedAssociativeArray<i64, Vec<&str>> = ChunkedAssociativeArray::new();
        arr.put(5, vec!["a"]);
        if let Some(v) = arr.get_mut(5) {
            v.push("b");
        }
        assert_eq!(arr.get(5), Some(&vec!["a", "b"]));
    }
}
