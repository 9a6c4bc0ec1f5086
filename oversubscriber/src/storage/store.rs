use std::io;

use super::{EmbeddingRow, Key, RowDims};

/// A lazy, finite sequence of the keys held by a `RowStore`.
///
/// It can't be restarted, a new one must be requested from the store.
pub type Keys<'a> = Box<dyn Iterator<Item = io::Result<Key>> + 'a>;

/// The host (or disk) resident table holding the full set of embedding rows.
///
/// It's the single source of truth at rest, every method takes `&self` so
/// the swap can flush and fetch rows from several threads at once.
pub trait RowStore: Send + Sync {
    /// Returns the widths of every row in this store.
    fn dims(&self) -> RowDims;

    /// Returns the amount of rows in the store.
    fn len(&self) -> usize;

    /// Returns `true` if the store holds no rows.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `key` has a row in the store.
    fn contains(&self, key: Key) -> bool;

    /// Should return a copy of the row stored under `key`, if any.
    ///
    /// # Arguments
    /// * `key` - The key to look up.
    ///
    /// # Returns
    /// The row or `None` if the key was never written, an io error if the backend fails.
    fn lookup(&self, key: Key) -> io::Result<Option<EmbeddingRow>>;

    /// Returns the row stored under `key`, unknown keys yield a zero-initialized row.
    fn get(&self, key: Key) -> io::Result<EmbeddingRow> {
        let row = self
            .lookup(key)?
            .unwrap_or_else(|| EmbeddingRow::zeroed(self.dims()));

        Ok(row)
    }

    /// Should insert or overwrite the row stored under `key`.
    ///
    /// # Arguments
    /// * `key` - The key owning the row.
    /// * `row` - The latest value of the row.
    ///
    /// # Returns
    /// An `InvalidInput` io error if `row` doesn't match `dims`, or any backend failure.
    fn put(&self, key: Key, row: &EmbeddingRow) -> io::Result<()>;

    /// Should lazily list every key of the store, each exactly once and in no particular order.
    fn keys(&self) -> Keys<'_>;

    /// Should make every completed `put` durable.
    fn sync(&self) -> io::Result<()>;
}

/// Maps a row width mismatch into an io error for the store interface.
pub(crate) fn check_row(dims: RowDims, row: &EmbeddingRow) -> io::Result<()> {
    row.check_dims(dims)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}
