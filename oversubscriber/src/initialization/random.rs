use rand::{SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Normal, Uniform};

use super::{RandErr, Result, RowInit};
use crate::storage::Key;

/// Spreads consecutive keys over the seed space.
const KEY_MIX: u64 = 0x9E37_79B9_7F4A_7C15;

/// A row initializer that samples the weights from a probabilistic distribution.
///
/// Each key draws from its own generator seeded with `(seed, key)`, so a fresh
/// row is reproducible no matter which thread or swap pass materializes it.
#[derive(Debug, Clone)]
pub struct RandRowInit<D: Distribution<f32>> {
    seed: u64,
    distribution: D,
}

impl<D: Distribution<f32>> RandRowInit<D> {
    /// Creates a new `RandRowInit` row initializer.
    ///
    /// # Arguments
    /// * `seed` - The base seed shared by every key.
    /// * `distribution` - The distribution to sample the weights from.
    pub fn new(seed: u64, distribution: D) -> Self {
        Self { seed, distribution }
    }

    fn rng_for(&self, key: Key) -> StdRng {
        StdRng::seed_from_u64(self.seed ^ key.wrapping_mul(KEY_MIX))
    }
}

impl RandRowInit<Uniform<f32>> {
    /// Creates a new `RandRowInit` row initializer with a uniform distribution.
    ///
    /// # Arguments
    /// * `seed` - The base seed shared by every key.
    /// * `low` - The inclusive lower limit.
    /// * `high` - The exclusive upper limit.
    ///
    /// # Returns
    /// An error if the range is invalid (low >= high).
    pub fn uniform(seed: u64, low: f32, high: f32) -> Result<Self> {
        let distribution = Uniform::new(low, high).map_err(|_| RandErr::EmptyRange { low, high })?;
        Ok(Self::new(seed, distribution))
    }
}

impl RandRowInit<Normal<f32>> {
    /// Creates a new `RandRowInit` row initializer with a normal distribution.
    ///
    /// # Arguments
    /// * `seed` - The base seed shared by every key.
    /// * `mean` - The mean of the distribution.
    /// * `std_dev` - The standard deviation of the distribution.
    ///
    /// # Returns
    /// An error if `std_dev` is not finite (Nan or infinite).
    pub fn normal(seed: u64, mean: f32, std_dev: f32) -> Result<Self> {
        let distribution = Normal::new(mean, std_dev).map_err(|_| RandErr::InvalidStdDev(std_dev))?;
        Ok(Self::new(seed, distribution))
    }
}

impl<D> RowInit for RandRowInit<D>
where
    D: Distribution<f32> + Send + Sync,
{
    fn fill(&self, key: Key, weights: &mut [f32]) {
        let mut rng = self.rng_for(key);
        weights
            .iter_mut()
            .for_each(|w| *w = self.distribution.sample(&mut rng));
    }
}
