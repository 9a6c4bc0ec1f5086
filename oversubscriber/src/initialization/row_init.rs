use crate::storage::{EmbeddingRow, Key, RowDims};

/// A `RowInit` materializes the row of a key the row store has never seen.
pub trait RowInit: Send + Sync {
    /// Should fill the weights of the fresh row for `key`.
    ///
    /// It must be a pure function of `key` so that the result doesn't depend on the
    /// order in which a swap admits rows.
    ///
    /// # Arguments
    /// * `key` - The key being materialized.
    /// * `weights` - The zeroed embedding vector to fill.
    fn fill(&self, key: Key, weights: &mut [f32]);

    /// Whether every fresh row equals the zero row a row store serves for unknown keys.
    ///
    /// Fresh rows of any other initializer diverge from the row store from the start,
    /// so they're admitted dirty and written back like trained rows.
    fn is_zero(&self) -> bool {
        false
    }

    /// Creates the fresh row for `key`, its optimizer state always starts at zero.
    fn fresh_row(&self, key: Key, dims: RowDims) -> EmbeddingRow {
        let mut row = EmbeddingRow::zeroed(dims);
        self.fill(key, row.weights_mut());
        row
    }
}
