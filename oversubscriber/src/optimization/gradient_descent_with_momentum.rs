use super::RowOptimizer;
use crate::storage::Result;

/// Gradient descent keeping one velocity accumulator per weight.
#[derive(Debug, Clone, Copy)]
pub struct GradientDescentWithMomentum {
    learning_rate: f32,
    momentum: f32,
}

impl GradientDescentWithMomentum {
    /// Creates a new `GradientDescentWithMomentum` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `momentum` - Hyperparameter to the optimization algorithm.
    ///
    /// # Returns
    /// A new `GradientDescentWithMomentum` instance.
    pub fn new(learning_rate: f32, momentum: f32) -> Self {
        Self {
            learning_rate,
            momentum,
        }
    }
}

impl RowOptimizer for GradientDescentWithMomentum {
    fn state_dim(&self, embedding_dim: usize) -> usize {
        embedding_dim
    }

    fn update_row(&self, grad: &[f32], weights: &mut [f32], state: &mut [f32]) -> Result<()> {
        self.check_sizes(grad, weights, state)?;

        let lr = self.learning_rate;
        let mu = self.momentum;

        weights
            .iter_mut()
            .zip(grad)
            .zip(state.iter_mut())
            .for_each(|((w, g), v)| {
                *v = (mu * *v) + g;
                *w -= lr * *v;
            });

        Ok(())
    }
}
