use super::RowOptimizer;
use crate::storage::Result;

#[derive(Debug, Clone, Copy)]
pub struct GradientDescent {
    learning_rate: f32,
}

impl GradientDescent {
    /// Creates a new `GradientDescent` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    ///
    /// # Returns
    /// A new `GradientDescent` instance.
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl RowOptimizer for GradientDescent {
    fn state_dim(&self, _embedding_dim: usize) -> usize {
        0
    }

    fn update_row(&self, grad: &[f32], weights: &mut [f32], state: &mut [f32]) -> Result<()> {
        self.check_sizes(grad, weights, state)?;

        let lr = self.learning_rate;

        for (w, g) in weights.iter_mut().zip(grad) {
            *w -= lr * g;
        }

        Ok(())
    }
}
