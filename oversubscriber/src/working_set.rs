use std::{
    collections::{HashMap, HashSet},
    io,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::RwLock;
use rayon::prelude::*;

use crate::{
    error::{OversubErr, Result},
    initialization::RowInit,
    optimization::RowOptimizer,
    storage::{EmbeddingRow, Key, RowDims, RowStore},
};

/// A resident row and whether it diverged from the row store.
#[derive(Debug)]
struct Slot {
    row: EmbeddingRow,
    dirty: bool,
}

type Shard = RwLock<HashMap<Key, Slot>>;

/// A snapshot of the working set's occupancy, meant for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryUsage {
    pub resident_rows: usize,
    pub dirty_rows: usize,
    pub capacity: usize,
    pub resident_bytes: usize,
    pub capacity_bytes: usize,
}

/// The bounded, device-side table holding the rows the current shard needs.
///
/// Rows are spread over lock shards by `key % shards`. Compute reads take a
/// shard's read lock, compute writes and residency changes take its write lock,
/// so a key can never be evicted or admitted while it's being read or trained.
#[derive(Debug)]
pub struct WorkingSet {
    dims: RowDims,
    capacity: usize,
    len: AtomicUsize,
    shards: Box<[Shard]>,
}

impl WorkingSet {
    /// Creates a new empty `WorkingSet`.
    ///
    /// # Arguments
    /// * `dims` - The widths of every row.
    /// * `capacity` - The maximum amount of resident rows.
    /// * `shards` - The amount of lock shards.
    ///
    /// # Returns
    /// A new `WorkingSet` instance.
    pub fn new(dims: RowDims, capacity: NonZeroUsize, shards: NonZeroUsize) -> Self {
        let shards = (0..shards.get())
            .map(|_| RwLock::new(HashMap::new()))
            .collect();

        Self {
            dims,
            capacity: capacity.get(),
            len: AtomicUsize::new(0),
            shards,
        }
    }

    #[inline]
    pub fn dims(&self) -> RowDims {
        self.dims
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the amount of resident rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` is resident.
    pub fn contains(&self, key: Key) -> bool {
        self.shard(key).read().contains_key(&key)
    }

    /// Returns a copy of the resident row of `key`.
    ///
    /// # Returns
    /// The row or `NotResident` if `key` isn't in the working set.
    pub fn get(&self, key: Key) -> Result<EmbeddingRow> {
        self.with_row(key, EmbeddingRow::clone)
    }

    /// Runs `f` over the resident row of `key` while holding its shard's read lock.
    ///
    /// # Arguments
    /// * `key` - The resident key to read.
    /// * `f` - The closure reading the row.
    ///
    /// # Returns
    /// Whatever `f` returns or `NotResident` if `key` isn't in the working set.
    pub fn with_row<T, F>(&self, key: Key, f: F) -> Result<T>
    where
        F: FnOnce(&EmbeddingRow) -> T,
    {
        let shard = self.shard(key).read();
        let slot = shard.get(&key).ok_or(OversubErr::NotResident(key))?;
        Ok(f(&slot.row))
    }

    /// Runs `f` over the resident row of `key` mutably and marks it dirty.
    ///
    /// # Arguments
    /// * `key` - The resident key to write.
    /// * `f` - The closure mutating the row.
    ///
    /// # Returns
    /// Whatever `f` returns or `NotResident` if `key` isn't in the working set.
    pub fn write_row<T, F>(&self, key: Key, f: F) -> Result<T>
    where
        F: FnOnce(&mut EmbeddingRow) -> T,
    {
        let mut shard = self.shard(key).write();
        let slot = shard.get_mut(&key).ok_or(OversubErr::NotResident(key))?;
        slot.dirty = true;
        Ok(f(&mut slot.row))
    }

    /// Trains the resident row of `key` with `grad`, the compute write-back path.
    ///
    /// # Arguments
    /// * `key` - The resident key whose row gets updated.
    /// * `grad` - The gradient of the row's weights.
    /// * `optimizer` - The sparse optimizer owning the row's state layout.
    ///
    /// # Returns
    /// `NotResident` if `key` isn't in the working set, `SizeMismatch` if `grad` has the wrong width.
    pub fn apply_gradient<O>(&self, key: Key, grad: &[f32], optimizer: &O) -> Result<()>
    where
        O: RowOptimizer + ?Sized,
    {
        let mut shard = self.shard(key).write();
        let slot = shard.get_mut(&key).ok_or(OversubErr::NotResident(key))?;

        let (weights, state) = slot.row.split_mut();
        optimizer.update_row(grad, weights, state)?;
        slot.dirty = true;
        Ok(())
    }

    /// Inserts or overwrites the row of `key`.
    ///
    /// An overwrite never clears a pending dirty flag, a dirty row stays dirty until it's flushed.
    ///
    /// # Arguments
    /// * `key` - The key owning the row.
    /// * `row` - The row to make resident.
    /// * `dirty` - Whether `row` differs from the row store's copy.
    ///
    /// # Returns
    /// `Capacity` if admitting a new key would exceed the capacity, `SizeMismatch` for wrong widths.
    pub fn put(&self, key: Key, row: EmbeddingRow, dirty: bool) -> Result<()> {
        row.check_dims(self.dims)?;

        let mut shard = self.shard(key).write();

        if let Some(slot) = shard.get_mut(&key) {
            slot.row = row;
            slot.dirty |= dirty;
            return Ok(());
        }

        self.reserve()?;
        shard.insert(key, Slot { row, dirty });
        Ok(())
    }

    /// Removes the row of `key` from the working set and hands it over to the caller.
    ///
    /// # Returns
    /// The evicted row or `NotResident` if `key` isn't in the working set.
    pub fn evict(&self, key: Key) -> Result<EmbeddingRow> {
        let slot = self
            .shard(key)
            .write()
            .remove(&key)
            .ok_or(OversubErr::NotResident(key))?;

        self.len.fetch_sub(1, Ordering::AcqRel);
        Ok(slot.row)
    }

    /// Drops every resident row without flushing it.
    ///
    /// # Returns
    /// The amount of dropped rows.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;

        for shard in self.shards.iter() {
            let mut shard = shard.write();
            dropped += shard.len();
            shard.clear();
        }

        self.len.fetch_sub(dropped, Ordering::AcqRel);
        dropped
    }

    /// Returns whether the resident row of `key` has unflushed changes.
    pub fn is_dirty(&self, key: Key) -> Result<bool> {
        let shard = self.shard(key).read();
        let slot = shard.get(&key).ok_or(OversubErr::NotResident(key))?;
        Ok(slot.dirty)
    }

    /// Returns the set of resident keys.
    pub fn resident_keys(&self) -> HashSet<Key> {
        self.shards
            .iter()
            .flat_map(|shard| shard.read().keys().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Clears the dirty flag of `key` once its row is known to match the row store.
    pub fn mark_clean(&self, key: Key) -> Result<()> {
        let mut shard = self.shard(key).write();
        let slot = shard.get_mut(&key).ok_or(OversubErr::NotResident(key))?;
        slot.dirty = false;
        Ok(())
    }

    /// Returns the resident keys with unflushed changes.
    pub fn dirty_keys(&self) -> Vec<Key> {
        self.shards
            .iter()
            .flat_map(|shard| {
                shard
                    .read()
                    .iter()
                    .filter(|(_, slot)| slot.dirty)
                    .map(|(key, _)| *key)
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Returns the current occupancy of the working set.
    pub fn memory_usage(&self) -> MemoryUsage {
        let row_bytes = self.dims.values() * size_of::<f32>();
        let resident_rows = self.len();

        MemoryUsage {
            resident_rows,
            dirty_rows: self.dirty_keys().len(),
            capacity: self.capacity,
            resident_bytes: resident_rows * row_bytes,
            capacity_bytes: self.capacity * row_bytes,
        }
    }

    /// Writes every dirty row back to `store`, the rows stay resident and become clean.
    ///
    /// It doesn't sync `store`, that's up to the caller.
    ///
    /// # Returns
    /// The amount of flushed rows or the first io error, rows that failed to flush stay dirty.
    pub fn drain_dirty<S>(&self, store: &S) -> io::Result<usize>
    where
        S: RowStore + ?Sized,
    {
        self.shards
            .par_iter()
            .map(|shard| {
                let mut shard = shard.write();
                let mut flushed = 0;

                for (key, slot) in shard.iter_mut().filter(|(_, slot)| slot.dirty) {
                    store.put(*key, &slot.row)?;
                    slot.dirty = false;
                    flushed += 1;
                }

                Ok(flushed)
            })
            .try_reduce(|| 0, |a, b| Ok(a + b))
    }

    /// Returns the amount of lock shards.
    pub(crate) fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Returns the lock shard index owning `key`.
    pub(crate) fn shard_of(&self, key: Key) -> usize {
        (key % self.shards.len() as Key) as usize
    }

    /// Flushes (when dirty) and evicts every key of `keys` owned by shard `idx`.
    ///
    /// The shard stays write locked for the whole batch, so each key's flush and
    /// eviction happen atomically with respect to compute accesses.
    ///
    /// # Returns
    /// The amount of flushed rows, or the keys left resident and the io error that stopped the batch.
    pub(crate) fn flush_evict<S>(
        &self,
        idx: usize,
        keys: &[Key],
        store: &S,
    ) -> std::result::Result<usize, (Vec<Key>, io::Error)>
    where
        S: RowStore + ?Sized,
    {
        let mut shard = self.shards[idx].write();
        let mut flushed = 0;

        for (i, key) in keys.iter().enumerate() {
            let Some(slot) = shard.get(key) else {
                continue;
            };

            if slot.dirty {
                if let Err(e) = store.put(*key, &slot.row) {
                    return Err((keys[i..].to_vec(), e));
                }

                flushed += 1;
            }

            shard.remove(key);
            self.len.fetch_sub(1, Ordering::AcqRel);
        }

        Ok(flushed)
    }

    /// Fetches every key of `keys` owned by shard `idx` from `store` and admits it.
    ///
    /// Rows read from `store` are admitted clean. Keys unknown to `store` are materialized
    /// by `init`, and admitted dirty unless `init` yields the store's zero row, so that a
    /// clean resident row always matches `store`.
    ///
    /// # Returns
    /// The amount of fresh rows, or the keys left out and the io error that stopped the batch.
    pub(crate) fn admit<S, I>(
        &self,
        idx: usize,
        keys: &[Key],
        store: &S,
        init: &I,
    ) -> std::result::Result<usize, (Vec<Key>, io::Error)>
    where
        S: RowStore + ?Sized,
        I: RowInit + ?Sized,
    {
        let mut shard = self.shards[idx].write();
        let mut fresh = 0;
        let fresh_dirty = !init.is_zero();

        for (i, &key) in keys.iter().enumerate() {
            if shard.contains_key(&key) {
                continue;
            }

            let (row, dirty) = match store.lookup(key) {
                Ok(Some(row)) => (row, false),
                Ok(None) => {
                    fresh += 1;
                    (init.fresh_row(key, self.dims), fresh_dirty)
                }
                Err(e) => return Err((keys[i..].to_vec(), e)),
            };

            if self.reserve().is_err() {
                let e = io::Error::other(format!(
                    "working set capacity of {} rows reached",
                    self.capacity
                ));
                return Err((keys[i..].to_vec(), e));
            }

            shard.insert(key, Slot { row, dirty });
        }

        Ok(fresh)
    }

    fn shard(&self, key: Key) -> &Shard {
        &self.shards[self.shard_of(key)]
    }

    /// Claims room for one more row without ever overshooting the capacity.
    fn reserve(&self) -> Result<()> {
        self.len
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |len| {
                (len < self.capacity).then_some(len + 1)
            })
            .map(|_| ())
            .map_err(|len| OversubErr::Capacity {
                requested: len + 1,
                capacity: self.capacity,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        initialization::ConstRowInit, optimization::GradientDescent, storage::MemoryRowStore,
    };

    const DIMS: RowDims = RowDims {
        embedding_dim: 2,
        state_dim: 0,
    };

    fn working_set(capacity: usize) -> WorkingSet {
        WorkingSet::new(
            DIMS,
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(2).unwrap(),
        )
    }

    fn row(v: f32) -> EmbeddingRow {
        EmbeddingRow::new(vec![v; 2], vec![])
    }

    #[test]
    fn put_get_evict() {
        let ws = working_set(2);

        ws.put(1, row(1.), false).unwrap();
        assert!(ws.contains(1));
        assert_eq!(ws.get(1).unwrap(), row(1.));
        assert_eq!(ws.len(), 1);

        assert_eq!(ws.evict(1).unwrap(), row(1.));
        assert!(!ws.contains(1));
        assert!(ws.is_empty());
        assert!(matches!(ws.get(1), Err(OversubErr::NotResident(1))));
        assert!(matches!(ws.evict(1), Err(OversubErr::NotResident(1))));
    }

    #[test]
    fn put_beyond_capacity_fails() {
        let ws = working_set(2);

        ws.put(1, row(1.), false).unwrap();
        ws.put(2, row(2.), false).unwrap();
        ws.put(2, row(3.), true).unwrap();

        let err = ws.put(3, row(3.), false).unwrap_err();
        assert!(matches!(
            err,
            OversubErr::Capacity {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(ws.len(), 2);
        assert_eq!(ws.resident_keys(), HashSet::from([1, 2]));
    }

    #[test]
    fn overwrite_keeps_dirty_flag() {
        let ws = working_set(2);

        ws.put(1, row(1.), true).unwrap();
        ws.put(1, row(2.), false).unwrap();
        assert!(ws.is_dirty(1).unwrap());
        assert_eq!(ws.get(1).unwrap(), row(2.));
    }

    #[test]
    fn put_rejects_wrong_widths() {
        let ws = working_set(2);
        let err = ws.put(1, EmbeddingRow::new(vec![1.], vec![]), false).unwrap_err();
        assert!(matches!(err, OversubErr::SizeMismatch(_)));
        assert!(ws.is_empty());
    }

    #[test]
    fn training_marks_rows_dirty() {
        let ws = working_set(2);
        ws.put(4, row(1.), false).unwrap();
        assert!(!ws.is_dirty(4).unwrap());

        ws.apply_gradient(4, &[1., 1.], &GradientDescent::new(0.5))
            .unwrap();
        assert!(ws.is_dirty(4).unwrap());
        assert_eq!(ws.get(4).unwrap(), row(0.5));
        assert_eq!(ws.dirty_keys(), vec![4]);

        ws.mark_clean(4).unwrap();
        assert!(ws.dirty_keys().is_empty());

        let err = ws.apply_gradient(5, &[1., 1.], &GradientDescent::new(0.5));
        assert!(matches!(err, Err(OversubErr::NotResident(5))));
    }

    #[test]
    fn drain_dirty_cleans_rows_in_place() {
        let ws = working_set(3);
        let store = MemoryRowStore::new(DIMS, NonZeroUsize::new(1).unwrap());

        ws.put(1, row(1.), true).unwrap();
        ws.put(2, row(2.), false).unwrap();
        ws.write_row(3, |_| ()).unwrap_err();

        assert_eq!(ws.drain_dirty(&store).unwrap(), 1);
        assert!(ws.dirty_keys().is_empty());
        assert_eq!(ws.len(), 2);
        assert_eq!(store.lookup(1).unwrap(), Some(row(1.)));
        assert!(!store.contains(2));
    }

    #[test]
    fn admit_and_flush_evict_per_shard() {
        let ws = working_set(4);
        let store = MemoryRowStore::new(DIMS, NonZeroUsize::new(1).unwrap());
        store.put(2, &row(2.)).unwrap();

        let init = ConstRowInit::new(0.25);
        let fresh = ws.admit(0, &[2, 4], &store, &init).unwrap();
        assert_eq!(fresh, 1);
        assert_eq!(ws.get(2).unwrap(), row(2.));
        assert_eq!(ws.get(4).unwrap(), row(0.25));
        assert!(!ws.is_dirty(2).unwrap());
        assert!(ws.is_dirty(4).unwrap());

        ws.write_row(4, |r| r.weights_mut().fill(9.)).unwrap();
        let flushed = ws.flush_evict(0, &[2, 4], &store).unwrap();
        assert_eq!(flushed, 1);
        assert!(ws.is_empty());
        assert_eq!(store.lookup(4).unwrap(), Some(row(9.)));
    }

    #[test]
    fn memory_usage_reports_occupancy() {
        let ws = working_set(4);
        ws.put(1, row(1.), true).unwrap();
        ws.put(2, row(1.), false).unwrap();

        let usage = ws.memory_usage();
        assert_eq!(usage.resident_rows, 2);
        assert_eq!(usage.dirty_rows, 1);
        assert_eq!(usage.capacity, 4);
        assert_eq!(usage.resident_bytes, 2 * 2 * size_of::<f32>());
        assert_eq!(usage.capacity_bytes, 4 * 2 * size_of::<f32>());
    }
}
