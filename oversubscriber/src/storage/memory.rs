use std::{collections::HashMap, io, num::NonZeroUsize};

use parking_lot::RwLock;

use super::{EmbeddingRow, Key, Keys, RowDims, RowStore, store::check_row};

/// A host-resident `RowStore`.
///
/// Rows are partitioned into lock shards so concurrent flushes and fetches of
/// unrelated keys don't contend. Nothing outlives the process, durability is
/// left to checkpoints.
#[derive(Debug)]
pub struct MemoryRowStore {
    dims: RowDims,
    shards: Box<[RwLock<HashMap<Key, EmbeddingRow>>]>,
}

impl MemoryRowStore {
    /// Creates a new empty `MemoryRowStore`.
    ///
    /// # Arguments
    /// * `dims` - The widths of every row.
    /// * `shards` - The amount of lock shards.
    ///
    /// # Returns
    /// A new `MemoryRowStore` instance.
    pub fn new(dims: RowDims, shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self { dims, shards }
    }

    fn shard(&self, key: Key) -> &RwLock<HashMap<Key, EmbeddingRow>> {
        &self.shards[(key % self.shards.len() as Key) as usize]
    }
}

impl RowStore for MemoryRowStore {
    fn dims(&self) -> RowDims {
        self.dims
    }

    fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.read().len()).sum()
    }

    fn contains(&self, key: Key) -> bool {
        self.shard(key).read().contains_key(&key)
    }

    fn lookup(&self, key: Key) -> io::Result<Option<EmbeddingRow>> {
        Ok(self.shard(key).read().get(&key).cloned())
    }

    fn put(&self, key: Key, row: &EmbeddingRow) -> io::Result<()> {
        check_row(self.dims, row)?;
        self.shard(key).write().insert(key, row.clone());
        Ok(())
    }

    fn keys(&self) -> Keys<'_> {
        let keys = self
            .shards
            .iter()
            .flat_map(|shard| shard.read().keys().copied().collect::<Vec<_>>())
            .map(Ok);

        Box::new(keys)
    }

    fn sync(&self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryRowStore {
        MemoryRowStore::new(RowDims::new(2, 1), NonZeroUsize::new(4).unwrap())
    }

    #[test]
    fn unknown_keys_are_zeroed() {
        let store = store();

        assert!(!store.contains(9));
        assert!(store.lookup(9).unwrap().is_none());
        assert_eq!(store.get(9).unwrap(), EmbeddingRow::zeroed(store.dims()));
        assert!(store.is_empty());
    }

    #[test]
    fn put_upserts() {
        let store = store();

        store.put(1, &EmbeddingRow::new(vec![1., 1.], vec![0.])).unwrap();
        store.put(1, &EmbeddingRow::new(vec![2., 2.], vec![1.])).unwrap();

        assert_eq!(store.len(), 1);
        assert_eq!(store.get(1).unwrap().weights(), &[2., 2.]);
    }

    #[test]
    fn put_rejects_wrong_widths() {
        let store = store();
        let err = store.put(1, &EmbeddingRow::new(vec![1.], vec![0.])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn keys_are_listed_once() {
        let store = store();
        for key in 0..10 {
            store.put(key, &EmbeddingRow::zeroed(store.dims())).unwrap();
        }

        let mut keys: Vec<_> = store.keys().collect::<io::Result<_>>().unwrap();
        keys.sort_unstable();
        assert_eq!(keys, (0..10).collect::<Vec<_>>());
    }
}
