use std::{
    collections::HashSet,
    io,
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use parking_lot::Mutex;
use rayon::prelude::*;

use crate::{
    error::{OversubErr, Result, SwapPhase},
    initialization::{ConstRowInit, RowInit},
    storage::{Key, RowStore},
    working_set::WorkingSet,
};

/// What a single swap pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapReport {
    /// Distinct keys of the keyset.
    pub target: usize,
    /// Resident keys the keyset didn't need, all of them evicted.
    pub stale: usize,
    /// Stale rows that were dirty and got written back.
    pub flushed: usize,
    /// Rows brought into the working set.
    pub admitted: usize,
    /// Admitted rows the row store had never seen.
    pub fresh: usize,
    pub elapsed: Duration,
}

type ShardOutcome = std::result::Result<usize, (Vec<Key>, io::Error)>;

/// Moves embedding rows between the row store and the working set so that
/// exactly the rows of the upcoming keyset are resident.
pub struct Oversubscriber {
    init: Box<dyn RowInit>,
    lock: Mutex<()>,
}

impl Default for Oversubscriber {
    fn default() -> Self {
        Self::new(Box::new(ConstRowInit::default()))
    }
}

impl Oversubscriber {
    /// Creates a new `Oversubscriber`.
    ///
    /// # Arguments
    /// * `init` - Materializes the rows of keys the row store has never seen.
    ///
    /// # Returns
    /// A new `Oversubscriber` instance.
    pub fn new(init: Box<dyn RowInit>) -> Self {
        Self {
            init,
            lock: Mutex::new(()),
        }
    }

    /// Swaps the working set over to the keys of `keyset`.
    ///
    /// Stale rows are flushed (when dirty) and evicted first, the row store is synced,
    /// and only then the missing rows are fetched and admitted, so the working set never
    /// goes beyond its capacity. Both phases run in parallel across the working set's
    /// lock shards. Concurrent calls are serialized.
    ///
    /// # Arguments
    /// * `store` - The row store backing the working set.
    /// * `working_set` - The table to repopulate.
    /// * `keyset` - The keys of the upcoming data shard, duplicates allowed.
    ///
    /// # Returns
    /// A report of the pass, `Capacity` (with nothing touched) if the distinct keys don't fit,
    /// or `Swap` listing every key that couldn't be moved. A failed call can be retried as is.
    pub fn update<S>(&self, store: &S, working_set: &WorkingSet, keyset: &[Key]) -> Result<SwapReport>
    where
        S: RowStore + ?Sized,
    {
        let _guard = self.lock.lock();
        let start = Instant::now();

        let target: HashSet<Key> = keyset.iter().copied().collect();
        if target.len() > working_set.capacity() {
            return Err(OversubErr::Capacity {
                requested: target.len(),
                capacity: working_set.capacity(),
            });
        }

        let resident = working_set.resident_keys();
        let stale = partition(working_set, resident.difference(&target));
        let stale_len = stale.iter().map(Vec::len).sum::<usize>();

        let outcomes: Vec<ShardOutcome> = stale
            .par_iter()
            .enumerate()
            .map(|(idx, keys)| working_set.flush_evict(idx, keys, store))
            .collect();

        // Rows evicted before a shard failed only live in the store now, they're
        // synced before the failure is reported.
        let flushed = settle(outcomes, SwapPhase::Flush);
        let synced = store.sync();

        let flushed = match (flushed, synced) {
            (Ok(flushed), Ok(())) => flushed,
            (Err(e), Ok(())) => return Err(e),
            (Err(e), Err(sync_err)) => {
                warn!(error:% = sync_err; "row store sync failed after a failed flush");
                return Err(e);
            }
            (Ok(_), Err(source)) => {
                let resident = working_set.resident_keys();
                return Err(OversubErr::Swap {
                    phase: SwapPhase::Sync,
                    failed: target.difference(&resident).copied().collect(),
                    source,
                });
            }
        };
        debug!(stale = stale_len, flushed = flushed; "stale rows evicted");

        let resident = working_set.resident_keys();
        let missing = partition(working_set, target.difference(&resident));
        let missing_len = missing.iter().map(Vec::len).sum::<usize>();

        let init = self.init.as_ref();
        let outcomes: Vec<ShardOutcome> = missing
            .par_iter()
            .enumerate()
            .map(|(idx, keys)| working_set.admit(idx, keys, store, init))
            .collect();

        let fresh = settle(outcomes, SwapPhase::Admit)?;
        debug!(admitted = missing_len, fresh = fresh; "missing rows admitted");

        let report = SwapReport {
            target: target.len(),
            stale: stale_len,
            flushed,
            admitted: missing_len,
            fresh,
            elapsed: start.elapsed(),
        };

        info!(
            target = report.target,
            stale = report.stale,
            flushed = report.flushed,
            admitted = report.admitted,
            fresh = report.fresh,
            elapsed_ms = report.elapsed.as_millis() as u64;
            "swap completed"
        );

        Ok(report)
    }
}

/// Buckets `keys` by the working set shard owning them.
fn partition<'a>(working_set: &WorkingSet, keys: impl Iterator<Item = &'a Key>) -> Vec<Vec<Key>> {
    let mut buckets = vec![Vec::new(); working_set.shard_count()];
    for &key in keys {
        buckets[working_set.shard_of(key)].push(key);
    }

    buckets
}

/// Adds up the per shard counts, or gathers every failed key under the first error.
fn settle(outcomes: Vec<ShardOutcome>, phase: SwapPhase) -> Result<usize> {
    let mut total = 0;
    let mut failed = Vec::new();
    let mut first = None;

    for outcome in outcomes {
        match outcome {
            Ok(n) => total += n,
            Err((keys, e)) => {
                failed.extend(keys);
                first.get_or_insert(e);
            }
        }
    }

    match first {
        None => Ok(total),
        Some(source) => Err(OversubErr::Swap {
            phase,
            failed,
            source,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::{
        num::NonZeroUsize,
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::storage::{EmbeddingRow, Keys, MemoryRowStore, RowDims};

    const DIMS: RowDims = RowDims {
        embedding_dim: 2,
        state_dim: 0,
    };

    fn setup(capacity: usize) -> (MemoryRowStore, WorkingSet) {
        let shards = NonZeroUsize::new(4).unwrap();
        let store = MemoryRowStore::new(DIMS, shards);
        let ws = WorkingSet::new(DIMS, NonZeroUsize::new(capacity).unwrap(), shards);
        (store, ws)
    }

    fn row(v: f32) -> EmbeddingRow {
        EmbeddingRow::new(vec![v; 2], vec![])
    }

    #[test]
    fn swap_flushes_dirty_and_admits_fresh() {
        let (store, ws) = setup(3);
        let oversub = Oversubscriber::default();

        let report = oversub.update(&store, &ws, &[1, 2, 3]).unwrap();
        assert_eq!(report.admitted, 3);
        assert_eq!(report.fresh, 3);
        assert_eq!(ws.resident_keys(), HashSet::from([1, 2, 3]));

        ws.write_row(2, |r| r.weights_mut().fill(5.)).unwrap();

        let report = oversub.update(&store, &ws, &[3, 4, 5]).unwrap();
        assert_eq!(report.stale, 2);
        assert_eq!(report.flushed, 1);
        assert_eq!(report.admitted, 2);
        assert_eq!(ws.resident_keys(), HashSet::from([3, 4, 5]));
        assert_eq!(ws.get(4).unwrap(), row(0.));

        assert_eq!(store.lookup(2).unwrap(), Some(row(5.)));
        assert_eq!(store.lookup(1).unwrap(), None);
    }

    #[test]
    fn duplicates_are_ignored() {
        let (store, ws) = setup(2);
        let report = Oversubscriber::default()
            .update(&store, &ws, &[7, 7, 8])
            .unwrap();

        assert_eq!(report.target, 2);
        assert_eq!(ws.resident_keys(), HashSet::from([7, 8]));
    }

    #[test]
    fn oversized_keyset_leaves_working_set_untouched() {
        let (store, ws) = setup(2);
        let oversub = Oversubscriber::default();
        oversub.update(&store, &ws, &[1, 2]).unwrap();
        ws.write_row(1, |r| r.weights_mut().fill(1.)).unwrap();

        let err = oversub.update(&store, &ws, &[3, 4, 5]).unwrap_err();
        assert!(matches!(
            err,
            OversubErr::Capacity {
                requested: 3,
                capacity: 2
            }
        ));
        assert_eq!(ws.resident_keys(), HashSet::from([1, 2]));
        assert!(ws.is_dirty(1).unwrap());
        assert!(store.is_empty());
    }

    /// Fails every `put` of a given key, counts syncs.
    struct FaultyStore {
        inner: MemoryRowStore,
        poisoned: Key,
        syncs: AtomicUsize,
    }

    impl FaultyStore {
        fn new(inner: MemoryRowStore, poisoned: Key) -> Self {
            Self {
                inner,
                poisoned,
                syncs: AtomicUsize::new(0),
            }
        }

        fn syncs(&self) -> usize {
            self.syncs.load(Ordering::Acquire)
        }
    }

    impl RowStore for FaultyStore {
        fn dims(&self) -> RowDims {
            self.inner.dims()
        }

        fn len(&self) -> usize {
            self.inner.len()
        }

        fn contains(&self, key: Key) -> bool {
            self.inner.contains(key)
        }

        fn lookup(&self, key: Key) -> io::Result<Option<EmbeddingRow>> {
            self.inner.lookup(key)
        }

        fn put(&self, key: Key, row: &EmbeddingRow) -> io::Result<()> {
            if key == self.poisoned {
                return Err(io::Error::other("disk full"));
            }

            self.inner.put(key, row)
        }

        fn keys(&self) -> Keys<'_> {
            self.inner.keys()
        }

        fn sync(&self) -> io::Result<()> {
            self.syncs.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }

    #[test]
    fn failed_flush_keeps_the_row_resident() {
        let (inner, ws) = setup(4);
        let store = FaultyStore::new(inner, 1);
        let oversub = Oversubscriber::default();

        oversub.update(&store, &ws, &[1, 2]).unwrap();
        ws.write_row(1, |r| r.weights_mut().fill(3.)).unwrap();
        ws.write_row(2, |r| r.weights_mut().fill(4.)).unwrap();
        let syncs = store.syncs();

        let err = oversub.update(&store, &ws, &[5, 6]).unwrap_err();
        let (phase, failed) = match err {
            OversubErr::Swap { phase, failed, .. } => (phase, failed),
            other => panic!("expected a swap error, got {other:?}"),
        };

        assert_eq!(phase, SwapPhase::Flush);
        assert_eq!(failed, vec![1]);
        assert_eq!(ws.get(1).unwrap(), row(3.));
        assert!(ws.is_dirty(1).unwrap());
        assert!(!ws.contains(2));
        assert_eq!(store.lookup(2).unwrap(), Some(row(4.)));
        assert_eq!(store.syncs(), syncs + 1);

        let report = oversub.update(&store, &ws, &[1, 5, 6]).unwrap();
        assert_eq!(report.stale, 0);
        assert_eq!(ws.resident_keys(), HashSet::from([1, 5, 6]));
    }
}
