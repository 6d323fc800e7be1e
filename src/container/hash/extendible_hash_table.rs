use std::collections::hash_map::RandomState;
use std::hash::{BuildHasher, Hash};

use parking_lot::Mutex;

/// Local depth past which a full bucket grows instead of splitting
const MAX_DEPTH: usize = 24;

/// A fixed-capacity bucket of key/value pairs
#[derive(Debug)]
struct Bucket<K, V> {
    items: Vec<(K, V)>,
    depth: usize,
}

impl<K: Eq, V> Bucket<K, V> {
    fn new(capacity: usize, depth: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            depth,
        }
    }

    fn position(&self, key: &K) -> Option<usize> {
        self.items.iter().position(|(k, _)| k == key)
    }
}

#[derive(Debug)]
struct TableState<K, V> {
    global_depth: usize,
    /// Directory slots, each an index into `buckets`
    dir: Vec<usize>,
    buckets: Vec<Bucket<K, V>>,
}

/// Extendible hash table.
///
/// The directory has `2^global_depth` slots; slot `hash(key) & mask` routes to
/// the bucket that may hold `key`. A full bucket splits on insert, doubling the
/// directory first when its local depth has caught up with the global depth.
/// The table never shrinks, and the directory never grows past `2^24` slots.
///
/// A single latch guards directory and buckets, so readers never see a
/// directory whose depths are out of step.
pub struct ExtendibleHashTable<K, V, S = RandomState> {
    bucket_size: usize,
    hash_builder: S,
    state: Mutex<TableState<K, V>>,
}

impl<K, V> ExtendibleHashTable<K, V, RandomState>
where
    K: Hash + Eq,
    V: Clone,
{
    /// Creates an empty table whose buckets hold up to `bucket_size` entries.
    pub fn new(bucket_size: usize) -> Self {
        Self::with_hasher(bucket_size, RandomState::new())
    }
}

impl<K, V, S> ExtendibleHashTable<K, V, S>
where
    K: Hash + Eq,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(bucket_size: usize, hash_builder: S) -> Self {
        let bucket_size = bucket_size.max(1);
        Self {
            bucket_size,
            hash_builder,
            state: Mutex::new(TableState {
                global_depth: 0,
                dir: vec![0],
                buckets: vec![Bucket::new(bucket_size, 0)],
            }),
        }
    }

    fn hash(&self, key: &K) -> u64 {
        self.hash_builder.hash_one(key)
    }

    fn index_of(hash: u64, depth: usize) -> usize {
        let mask = (1u64 << depth) - 1;
        (hash & mask) as usize
    }

    /// Looks up the value stored for `key`.
    pub fn find(&self, key: &K) -> Option<V> {
        let hash = self.hash(key);
        let state = self.state.lock();
        let bucket = &state.buckets[state.dir[Self::index_of(hash, state.global_depth)]];
        bucket
            .items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    /// Removes `key`, returning whether it was present.
    pub fn remove(&self, key: &K) -> bool {
        let hash = self.hash(key);
        let mut state = self.state.lock();
        let slot = state.dir[Self::index_of(hash, state.global_depth)];
        let bucket = &mut state.buckets[slot];
        match bucket.position(key) {
            Some(pos) => {
                bucket.items.swap_remove(pos);
                true
            }
            None => false,
        }
    }

    /// Inserts or overwrites the value for `key`.
    ///
    /// Splitting repeats until the target bucket has room, since a split may
    /// leave every colliding key on the same side. A bucket whose keys all
    /// share one hash, or that reached the depth limit, overflows instead.
    pub fn insert(&self, key: K, value: V) {
        let hash = self.hash(&key);
        let mut state = self.state.lock();

        loop {
            let slot = state.dir[Self::index_of(hash, state.global_depth)];
            let bucket = &mut state.buckets[slot];

            if let Some(pos) = bucket.position(&key) {
                bucket.items[pos].1 = value;
                return;
            }
            if bucket.items.len() < self.bucket_size {
                bucket.items.push((key, value));
                return;
            }
            // No split can separate keys that share a full hash
            if bucket.depth >= MAX_DEPTH || bucket.items.iter().all(|(k, _)| self.hash(k) == hash) {
                bucket.items.push((key, value));
                return;
            }

            self.split(&mut state, slot);
        }
    }

    /// Splits the bucket at arena index `slot`, growing the directory if needed.
    fn split(&self, state: &mut TableState<K, V>, slot: usize) {
        let local_depth = state.buckets[slot].depth;

        if local_depth == state.global_depth {
            // Slot i + 2^d mirrors slot i
            let len = state.dir.len();
            for i in 0..len {
                let target = state.dir[i];
                state.dir.push(target);
            }
            state.global_depth += 1;
        }

        let new_depth = local_depth + 1;
        let high_bit = 1usize << local_depth;
        let sibling = state.buckets.len();
        state.buckets.push(Bucket::new(self.bucket_size, new_depth));
        state.buckets[slot].depth = new_depth;

        for i in 0..state.dir.len() {
            if state.dir[i] == slot && i & high_bit != 0 {
                state.dir[i] = sibling;
            }
        }

        let items = std::mem::take(&mut state.buckets[slot].items);
        for (k, v) in items {
            let hash = self.hash(&k);
            let target = if (hash as usize) & high_bit != 0 {
                sibling
            } else {
                slot
            };
            state.buckets[target].items.push((k, v));
        }
    }

    pub fn global_depth(&self) -> usize {
        self.state.lock().global_depth
    }

    /// Local depth of the bucket behind directory slot `dir_index`.
    pub fn local_depth(&self, dir_index: usize) -> Option<usize> {
        let state = self.state.lock();
        state
            .dir
            .get(dir_index)
            .map(|&bucket| state.buckets[bucket].depth)
    }

    pub fn num_buckets(&self) -> usize {
        self.state.lock().buckets.len()
    }

    /// Number of directory slots, always `2^global_depth`.
    pub fn dir_size(&self) -> usize {
        self.state.lock().dir.len()
    }

    pub fn len(&self) -> usize {
        self.state.lock().buckets.iter().map(|b| b.items.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
