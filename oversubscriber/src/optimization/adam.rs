use super::RowOptimizer;
use crate::storage::Result;

/// Amount of trailing state slots holding the bias correction powers.
const BIAS_SLOTS: usize = 2;

/// Lazy Adam: moments and bias correction advance only when a row receives a gradient.
///
/// A row's state is laid out as `[v.., s.., beta1^t, beta2^t]`, where a zeroed
/// state means the row was never trained.
#[derive(Debug, Clone, Copy)]
pub struct Adam {
    learning_rate: f32,
    beta1: f32,
    beta2: f32,
    epsilon: f32,
}

impl Adam {
    /// Creates a new `Adam` optimizer.
    ///
    /// # Arguments
    /// * `learning_rate` - The small coefficient that modulates the amount of training per update.
    /// * `beta1`, `beta2`, `epsilon` - Hyperparameters to the optimization algorithm.
    ///
    /// # Returns
    /// A new `Adam` instance.
    pub fn new(learning_rate: f32, beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        }
    }
}

impl RowOptimizer for Adam {
    fn state_dim(&self, embedding_dim: usize) -> usize {
        2 * embedding_dim + BIAS_SLOTS
    }

    fn update_row(&self, grad: &[f32], weights: &mut [f32], state: &mut [f32]) -> Result<()> {
        self.check_sizes(grad, weights, state)?;

        let Self {
            learning_rate: lr,
            beta1: b1,
            beta2: b2,
            epsilon: eps,
        } = *self;

        let dim = weights.len();
        let (moments, powers) = state.split_at_mut(2 * dim);
        let (v, s) = moments.split_at_mut(dim);

        // A never trained row starts its powers at 1.
        if powers[0] == 0. {
            powers.fill(1.);
        }

        // Powers saturate instead of underflowing back into the untrained marker.
        powers[0] = (powers[0] * b1).max(f32::MIN_POSITIVE);
        powers[1] = (powers[1] * b2).max(f32::MIN_POSITIVE);

        let bc1 = 1. - powers[0];
        let bc2 = 1. - powers[1];
        let step_size = lr * (bc2.sqrt() / bc1);

        weights
            .iter_mut()
            .zip(grad)
            .zip(v.iter_mut())
            .zip(s.iter_mut())
            .for_each(|(((w, g), v), s)| {
                *v = b1 * *v + (1. - b1) * g;
                *s = b2 * *s + (1. - b2) * g.powi(2);
                *w -= step_size * *v / (s.sqrt() + eps);
            });

        Ok(())
    }
}
