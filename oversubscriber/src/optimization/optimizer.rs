use crate::storage::{Result, SizeMismatchErr};

/// Defines the strategy for updating a single embedding row based on its gradient.
///
/// Hyperparameters live in the optimizer, the per-row accumulators travel with
/// the row itself so they are swapped and checkpointed together with the weights.
pub trait RowOptimizer: Send + Sync {
    /// Returns the width of the optimizer state of a row with `embedding_dim` weights.
    fn state_dim(&self, embedding_dim: usize) -> usize;

    /// Should update the weights of a row and its optimizer state using `grad`.
    ///
    /// # Arguments
    /// * `grad` - The gradient of the row's weights.
    /// * `weights` - The weights to update.
    /// * `state` - The row's optimizer accumulators.
    ///
    /// # Returns
    /// An error if there's a mismatch in the sizes of `grad`, `weights` and `state`.
    fn update_row(&self, grad: &[f32], weights: &mut [f32], state: &mut [f32]) -> Result<()>;

    /// Checks the sizes of the buffers handed to `update_row`.
    fn check_sizes(&self, grad: &[f32], weights: &[f32], state: &[f32]) -> Result<()> {
        SizeMismatchErr::check(grad.len(), weights.len())?;
        SizeMismatchErr::check(state.len(), self.state_dim(weights.len()))
    }
}
