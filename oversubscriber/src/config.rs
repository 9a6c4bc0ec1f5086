use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{OversubErr, Result},
    initialization::{ConstRowInit, RandErr, RandRowInit, RowInit},
    keyset::KeysetFormat,
    optimization::{Adam, GradientDescent, GradientDescentWithMomentum, RowOptimizer},
    storage::RowDims,
};

const DEFAULT_SWAP_SHARDS: usize = 16;

/// The embedding table being oversubscribed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    pub embedding_dim: usize,
    /// Derived from the optimizer when missing, must agree with it otherwise.
    #[serde(default)]
    pub state_dim: Option<usize>,
    /// The working set budget, in rows.
    pub capacity: usize,
}

/// Where cold rows live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// Host memory, lost on exit unless checkpointed.
    #[default]
    Memory,
    /// A row file inside `dir`, survives crashes between swaps.
    File { dir: PathBuf },
}

/// How rows unknown to the row store are materialized.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowInitConfig {
    Const { value: f32 },
    Uniform { low: f32, high: f32 },
    Normal { mean: f32, std_dev: f32 },
}

impl Default for RowInitConfig {
    fn default() -> Self {
        Self::Const { value: 0. }
    }
}

impl RowInitConfig {
    /// Resolves the configured `RowInit`.
    ///
    /// # Arguments
    /// * `seed` - The base seed of the random initializers.
    ///
    /// # Returns
    /// The row initializer or `InvalidConfig` if the distribution parameters are invalid.
    pub fn resolve(&self, seed: u64) -> Result<Box<dyn RowInit>> {
        let invalid = |e: RandErr| OversubErr::InvalidConfig(format!("init: {e}"));

        let init: Box<dyn RowInit> = match *self {
            Self::Const { value } => Box::new(ConstRowInit::new(value)),
            Self::Uniform { low, high } => {
                Box::new(RandRowInit::uniform(seed, low, high).map_err(invalid)?)
            }
            Self::Normal { mean, std_dev } => {
                Box::new(RandRowInit::normal(seed, mean, std_dev).map_err(invalid)?)
            }
        };

        Ok(init)
    }
}

/// The sparse optimizer used on the compute write-back path.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerConfig {
    Adam {
        learning_rate: f32,
        beta1: f32,
        beta2: f32,
        epsilon: f32,
    },
    GradientDescent {
        learning_rate: f32,
    },
    GradientDescentWithMomentum {
        learning_rate: f32,
        momentum: f32,
    },
}

impl OptimizerConfig {
    /// Resolves the configured `RowOptimizer`.
    pub fn resolve(&self) -> Box<dyn RowOptimizer> {
        match *self {
            Self::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => Box::new(Adam::new(learning_rate, beta1, beta2, epsilon)),
            Self::GradientDescent { learning_rate } => Box::new(GradientDescent::new(learning_rate)),
            Self::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => Box::new(GradientDescentWithMomentum::new(learning_rate, momentum)),
        }
    }

    fn validate(&self) -> Result<()> {
        let (learning_rate, fractions, epsilon) = match *self {
            Self::Adam {
                learning_rate,
                beta1,
                beta2,
                epsilon,
            } => (learning_rate, vec![("beta1", beta1), ("beta2", beta2)], Some(epsilon)),
            Self::GradientDescent { learning_rate } => (learning_rate, vec![], None),
            Self::GradientDescentWithMomentum {
                learning_rate,
                momentum,
            } => (learning_rate, vec![("momentum", momentum)], None),
        };

        if !(learning_rate.is_finite() && learning_rate > 0.) {
            return Err(invalid(format!(
                "learning rate must be positive, got {learning_rate}"
            )));
        }

        if let Some((name, value)) = fractions
            .into_iter()
            .find(|(_, value)| !(0. ..1.).contains(value))
        {
            return Err(invalid(format!("{name} must be in [0, 1), got {value}")));
        }

        match epsilon {
            Some(epsilon) if !(epsilon.is_finite() && epsilon > 0.) => Err(invalid(format!(
                "epsilon must be positive, got {epsilon}"
            ))),
            _ => Ok(()),
        }
    }
}

/// A data shard of the dataset, paired with the keyset declaring its keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardConfig {
    pub source: PathBuf,
    pub keyset: PathBuf,
}

/// Everything needed to open a `Session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub table: TableConfig,
    pub checkpoint_dir: PathBuf,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub init: RowInitConfig,
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub keyset_format: KeysetFormat,
    #[serde(default = "default_swap_shards")]
    pub swap_shards: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub dataset: Vec<ShardConfig>,
}

fn default_swap_shards() -> usize {
    DEFAULT_SWAP_SHARDS
}

fn invalid(msg: impl Into<String>) -> OversubErr {
    OversubErr::InvalidConfig(msg.into())
}

impl SessionConfig {
    /// Reads and validates the JSON config at `path`.
    ///
    /// # Returns
    /// The config, `NotFound` if there's no file or `InvalidConfig` if it can't be accepted.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| OversubErr::from_open(path, e))?;
        Self::from_json(&content)
    }

    /// Parses and validates a JSON config.
    pub fn from_json(content: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| invalid(format!("invalid JSON: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Checks every constraint that can be verified before touching any storage.
    ///
    /// # Returns
    /// `InvalidConfig` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        let TableConfig {
            name,
            embedding_dim,
            state_dim,
            capacity,
        } = &self.table;

        if name.is_empty() || name.contains(['/', '\\']) || name.starts_with('.') {
            return Err(invalid(format!("invalid table name {name:?}")));
        }

        if *embedding_dim == 0 {
            return Err(invalid("embedding dim must be positive"));
        }

        if *capacity == 0 {
            return Err(invalid("working set capacity must be positive"));
        }

        if self.swap_shards == 0 {
            return Err(invalid("swap shards must be positive"));
        }

        self.optimizer.validate()?;

        let expected = self.optimizer.resolve().state_dim(*embedding_dim);
        if let Some(state_dim) = state_dim.filter(|state_dim| *state_dim != expected) {
            return Err(invalid(format!(
                "state dim {state_dim} disagrees with the optimizer, which needs {expected}"
            )));
        }

        self.init.resolve(0).map(|_| ())
    }

    /// Returns the row widths of the table.
    pub fn dims(&self) -> RowDims {
        let state_dim = self
            .table
            .state_dim
            .unwrap_or_else(|| self.optimizer.resolve().state_dim(self.table.embedding_dim));

        RowDims::new(self.table.embedding_dim, state_dim)
    }

    /// Returns the working set capacity, `None` if it's zero.
    pub fn capacity(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.table.capacity)
    }

    /// Returns the amount of lock shards, `None` if it's zero.
    pub fn shards(&self) -> Option<NonZeroUsize> {
        NonZeroUsize::new(self.swap_shards)
    }
}
