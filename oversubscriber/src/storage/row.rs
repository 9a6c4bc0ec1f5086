use serde::{Deserialize, Serialize};

use super::{Result, SizeMismatchErr};

/// Identifier of a categorical feature value, stable across runs.
pub type Key = u64;

/// Size in bytes of a serialized key.
pub const KEY_SIZE: usize = size_of::<Key>();

/// The fixed widths shared by every row of an embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowDims {
    pub embedding_dim: usize,
    pub state_dim: usize,
}

impl RowDims {
    /// Creates a new `RowDims`.
    ///
    /// # Arguments
    /// * `embedding_dim` - The amount of weights per row.
    /// * `state_dim` - The amount of optimizer accumulators per row.
    ///
    /// # Returns
    /// A new `RowDims` instance.
    pub fn new(embedding_dim: usize, state_dim: usize) -> Self {
        Self {
            embedding_dim,
            state_dim,
        }
    }

    /// Returns the amount of `f32` values held by a single row.
    pub fn values(&self) -> usize {
        self.embedding_dim + self.state_dim
    }

    /// Returns the size in bytes of a serialized `(key, weights, state)` record.
    pub fn record_size(&self) -> usize {
        KEY_SIZE + self.values() * size_of::<f32>()
    }
}

/// A single embedding vector together with its optimizer accumulators.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingRow {
    weights: Box<[f32]>,
    state: Box<[f32]>,
}

impl EmbeddingRow {
    /// Creates a new `EmbeddingRow` from owned buffers.
    ///
    /// # Arguments
    /// * `weights` - The embedding vector.
    /// * `state` - The optimizer state.
    ///
    /// # Returns
    /// A new `EmbeddingRow` instance.
    pub fn new(weights: Vec<f32>, state: Vec<f32>) -> Self {
        Self {
            weights: weights.into_boxed_slice(),
            state: state.into_boxed_slice(),
        }
    }

    /// Creates a row whose weights and state are all zero.
    pub fn zeroed(dims: RowDims) -> Self {
        Self::new(vec![0.; dims.embedding_dim], vec![0.; dims.state_dim])
    }

    /// Creates a row from a flat `[weights.., state..]` buffer.
    ///
    /// # Arguments
    /// * `dims` - The widths of the table.
    /// * `values` - Exactly `dims.values()` numbers.
    ///
    /// # Returns
    /// The row or a `SizeMismatchErr` if `values` has the wrong length.
    pub fn from_flat(dims: RowDims, mut values: Vec<f32>) -> Result<Self> {
        SizeMismatchErr::check(values.len(), dims.values())?;

        let state = values.split_off(dims.embedding_dim);
        Ok(Self::new(values, state))
    }

    #[inline]
    pub fn weights(&self) -> &[f32] {
        &self.weights
    }

    #[inline]
    pub fn weights_mut(&mut self) -> &mut [f32] {
        &mut self.weights
    }

    #[inline]
    pub fn state(&self) -> &[f32] {
        &self.state
    }

    /// Borrows both halves of the row mutably at once.
    #[inline]
    pub fn split_mut(&mut self) -> (&mut [f32], &mut [f32]) {
        (&mut self.weights, &mut self.state)
    }

    /// Checks that this row has the widths of `dims`.
    ///
    /// # Returns
    /// A `SizeMismatchErr` reporting the first mismatching half.
    pub fn check_dims(&self, dims: RowDims) -> Result<()> {
        SizeMismatchErr::check(self.weights.len(), dims.embedding_dim)?;
        SizeMismatchErr::check(self.state.len(), dims.state_dim)
    }

    /// Appends the `(key, weights, state)` record to `buf`, key little-endian, values in host layout.
    ///
    /// # Arguments
    /// * `key` - The key owning this row.
    /// * `buf` - The destination buffer.
    pub fn encode_record(&self, key: Key, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&key.to_le_bytes());
        buf.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&self.weights));
        buf.extend_from_slice(bytemuck::cast_slice::<f32, u8>(&self.state));
    }

    /// Decodes a record previously written by `encode_record`.
    ///
    /// # Arguments
    /// * `dims` - The widths of the table.
    /// * `record` - Exactly `dims.record_size()` bytes.
    ///
    /// # Returns
    /// The key and its row, or a `SizeMismatchErr` if `record` has the wrong length.
    pub fn decode_record(dims: RowDims, record: &[u8]) -> Result<(Key, Self)> {
        SizeMismatchErr::check(record.len(), dims.record_size())?;

        let (key_bytes, values) = record.split_at(KEY_SIZE);

        // SAFETY: We splitted the record to be of size `KEY_SIZE` just above.
        let key = Key::from_le_bytes(key_bytes.try_into().unwrap());
        let values: Vec<f32> = bytemuck::pod_collect_to_vec(values);

        Ok((key, Self::from_flat(dims, values)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_layout() {
        let dims = RowDims::new(2, 1);
        let row = EmbeddingRow::new(vec![1., 2.], vec![3.]);

        let mut buf = Vec::new();
        row.encode_record(7, &mut buf);
        assert_eq!(buf.len(), dims.record_size());
        assert_eq!(&buf[..KEY_SIZE], &7u64.to_le_bytes());

        let (key, decoded) = EmbeddingRow::decode_record(dims, &buf).unwrap();
        assert_eq!(key, 7);
        assert_eq!(decoded, row);
    }

    #[test]
    fn decode_rejects_short_records() {
        let dims = RowDims::new(4, 0);
        let err = EmbeddingRow::decode_record(dims, &[0; 10]).unwrap_err();
        assert_eq!(err.expected, dims.record_size());
    }

    #[test]
    fn dims_check() {
        let row = EmbeddingRow::zeroed(RowDims::new(3, 2));
        assert!(row.check_dims(RowDims::new(3, 2)).is_ok());
        assert!(row.check_dims(RowDims::new(3, 0)).is_err());
        assert!(row.check_dims(RowDims::new(2, 2)).is_err());
    }
}
