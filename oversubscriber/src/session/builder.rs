use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{debug, info};
use rand::{Rng, SeedableRng, rngs::StdRng};

use super::Session;
use crate::{
    checkpoint,
    config::{SessionConfig, StoreConfig},
    error::{OversubErr, Result},
    storage::{FileRowStore, MemoryRowStore, RowDims, RowStore},
    swap::Oversubscriber,
    working_set::WorkingSet,
};

const ROWS_EXTENSION: &str = "rows";

/// Returns the row file of `table` inside the spill directory `dir`.
pub(super) fn rows_path(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.{ROWS_EXTENSION}"))
}

/// Builds `Session`s given a configuration.
pub struct SessionBuilder;

impl SessionBuilder {
    /// Creates a new `SessionBuilder`.
    ///
    /// # Returns
    /// A new `SessionBuilder` instance.
    pub fn new() -> Self {
        Self
    }

    /// Builds a new `Session` following a config.
    ///
    /// The row store starts from the table's checkpoint when there's one, otherwise empty. A
    /// file store that already holds rows, left by a previous run, is kept as is since it's at
    /// least as recent as the last checkpoint taken from it.
    ///
    /// # Arguments
    /// * `config` - The configuration of the session.
    ///
    /// # Returns
    /// A new session, `InvalidConfig` if the config is rejected, `Corruption` if the
    /// checkpoint is invalid, or any io error raised while opening the storage.
    pub fn build(&self, config: SessionConfig) -> Result<Session> {
        config.validate()?;

        let (Some(capacity), Some(shards)) = (config.capacity(), config.shards()) else {
            return Err(OversubErr::InvalidConfig("zero sized working set".into()));
        };

        let dims = config.dims();
        let store = self.resolve_store(&config, dims, shards)?;

        let seed = self.generate_seed(config.seed);
        let init = config.init.resolve(seed)?;
        let optimizer = config.optimizer.resolve();

        let working_set = WorkingSet::new(dims, capacity, shards);
        let oversubscriber = Oversubscriber::new(init);

        info!(
            table = config.table.name.as_str(),
            embedding_dim = dims.embedding_dim,
            state_dim = dims.state_dim,
            capacity = capacity.get(),
            stored_rows = store.len();
            "session opened"
        );

        Ok(Session::from_parts(
            config,
            store,
            working_set,
            oversubscriber,
            optimizer,
        ))
    }

    /// Generates the base seed of the row initializers given (or not) a seed.
    ///
    /// # Arguments
    /// * `seed` - An optional seed.
    ///
    /// # Returns
    /// The given seed or a random one.
    fn generate_seed(&self, seed: Option<u64>) -> u64 {
        seed.unwrap_or_else(|| StdRng::from_os_rng().random())
    }

    /// Resolves the `RowStore` for this session and fills it from the checkpoint if needed.
    ///
    /// # Arguments
    /// * `config` - The configuration of the session.
    /// * `dims` - The widths of the table's rows.
    /// * `shards` - The amount of lock shards of a memory store.
    ///
    /// # Returns
    /// The row store or the error raised while opening or loading it.
    fn resolve_store(
        &self,
        config: &SessionConfig,
        dims: RowDims,
        shards: NonZeroUsize,
    ) -> Result<Box<dyn RowStore>> {
        let table = config.table.name.as_str();
        let checkpoint_dir = config.checkpoint_dir.as_path();

        let store: Box<dyn RowStore> = match &config.store {
            StoreConfig::Memory => Box::new(MemoryRowStore::new(dims, shards)),
            StoreConfig::File { dir } => Box::new(FileRowStore::open(rows_path(dir, table), dims)?),
        };

        if !store.is_empty() {
            debug!(rows = store.len(); "row store recovered from a previous run");
            return Ok(store);
        }

        match checkpoint::load_into(checkpoint_dir, table, store.as_ref()) {
            Ok(_) => Ok(store),
            Err(OversubErr::NotFound(path)) => {
                debug!(path:? = path; "no checkpoint found, starting empty");
                Ok(store)
            }
            Err(e) => Err(e),
        }
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}
