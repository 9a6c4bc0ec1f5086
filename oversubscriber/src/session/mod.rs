mod builder;
mod handle;

use std::{
    fs,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{info, warn};

pub use builder::SessionBuilder;
pub use handle::SessionHandle;

use crate::{
    checkpoint,
    config::{SessionConfig, StoreConfig},
    error::Result,
    keyset::Keyset,
    optimization::RowOptimizer,
    storage::{FileRowStore, Key, MemoryRowStore, RowStore},
    swap::{Oversubscriber, SwapReport},
    working_set::{MemoryUsage, WorkingSet},
};

/// The object graph of a training run: the row store, the working set and the
/// oversubscriber moving rows between them.
///
/// The driver owns it and sequences `update`, training and `save` calls.
pub struct Session {
    config: SessionConfig,
    store: Box<dyn RowStore>,
    working_set: WorkingSet,
    oversubscriber: Oversubscriber,
    optimizer: Box<dyn RowOptimizer>,
}

impl Session {
    /// Opens a new session, see `SessionBuilder::build`.
    pub fn open(config: SessionConfig) -> Result<Self> {
        SessionBuilder::new().build(config)
    }

    pub(crate) fn from_parts(
        config: SessionConfig,
        store: Box<dyn RowStore>,
        working_set: WorkingSet,
        oversubscriber: Oversubscriber,
        optimizer: Box<dyn RowOptimizer>,
    ) -> Self {
        Self {
            config,
            store,
            working_set,
            oversubscriber,
            optimizer,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Swaps the working set over to the keys of the keyset manifest at `path`.
    ///
    /// # Arguments
    /// * `path` - The keyset of the upcoming data shard, in the configured format.
    ///
    /// # Returns
    /// What the swap did, or the keyset and swap errors.
    pub fn update(&self, path: impl AsRef<Path>) -> Result<SwapReport> {
        let keyset = Keyset::load(path, self.config.keyset_format)?;
        self.update_keys(keyset.keys())
    }

    /// Swaps the working set over to `keys`.
    pub fn update_keys(&self, keys: &[Key]) -> Result<SwapReport> {
        self.oversubscriber
            .update(self.store.as_ref(), &self.working_set, keys)
    }

    /// Trains the resident row of `key` with the configured optimizer.
    pub fn apply_gradient(&self, key: Key, grad: &[f32]) -> Result<()> {
        self.working_set
            .apply_gradient(key, grad, self.optimizer.as_ref())
    }

    /// Checkpoints the table into the configured checkpoint directory.
    pub fn save(&self) -> Result<PathBuf> {
        self.save_to(&self.config.checkpoint_dir)
    }

    /// Checkpoints the table into `dir`, flushing the working set first.
    ///
    /// # Returns
    /// The path of the written checkpoint.
    pub fn save_to(&self, dir: impl AsRef<Path>) -> Result<PathBuf> {
        let (path, _) = checkpoint::save(
            dir.as_ref(),
            &self.config.table.name,
            self.store.as_ref(),
            &self.working_set,
        )?;

        Ok(path)
    }

    /// Replaces the whole table with the checkpoint in `dir`.
    ///
    /// The checkpoint is loaded into a new row store which only replaces the current one once
    /// it's fully read, an invalid checkpoint leaves the session untouched. The resident keys
    /// stay resident, now holding the checkpoint's rows, unsaved changes are discarded.
    ///
    /// # Returns
    /// The amount of rows loaded, `NotFound` or `Corruption` if the checkpoint can't be used.
    pub fn load_from(&mut self, dir: impl AsRef<Path>) -> Result<u64> {
        let dir = dir.as_ref();
        let table = self.config.table.name.as_str();
        let dims = self.working_set.dims();

        let (store, rows) = match &self.config.store {
            StoreConfig::Memory => {
                let shards = NonZeroUsize::new(self.working_set.shard_count())
                    .unwrap_or(NonZeroUsize::MIN);
                let store = MemoryRowStore::new(dims, shards);
                let rows = checkpoint::load_into(dir, table, &store)?;
                let store: Box<dyn RowStore> = Box::new(store);
                (store, rows)
            }
            StoreConfig::File { dir: spill } => {
                let main = builder::rows_path(spill, table);
                let staging = main.with_extension("rows.load");

                let rows = {
                    let store = FileRowStore::create(&staging, dims)?;
                    checkpoint::load_into(dir, table, &store)
                };

                let rows = match rows {
                    Ok(rows) => rows,
                    Err(e) => {
                        if let Err(rm) = fs::remove_file(&staging) {
                            warn!(path:? = staging, error:% = rm; "failed to remove staging row store");
                        }

                        return Err(e);
                    }
                };

                fs::rename(&staging, &main)?;
                let store: Box<dyn RowStore> = Box::new(FileRowStore::open(&main, dims)?);
                (store, rows)
            }
        };

        let resident: Vec<Key> = self.working_set.resident_keys().into_iter().collect();
        self.working_set.clear();
        self.store = store;
        self.update_keys(&resident)?;

        info!(path:? = dir, rows = rows, resident = resident.len(); "table replaced from checkpoint");
        Ok(rows)
    }

    /// Returns the current occupancy of the working set.
    pub fn memory_usage(&self) -> MemoryUsage {
        self.working_set.memory_usage()
    }

    pub fn working_set(&self) -> &WorkingSet {
        &self.working_set
    }

    pub fn store(&self) -> &dyn RowStore {
        self.store.as_ref()
    }

    /// Ends the session, every resident row is flushed and the table is checkpointed.
    ///
    /// # Returns
    /// The path of the final checkpoint.
    pub fn shutdown(self) -> Result<PathBuf> {
        let path = self.save()?;
        let usage = self.memory_usage();

        info!(
            path:? = path,
            stored_rows = self.store.len(),
            resident_rows = usage.resident_rows;
            "session shut down"
        );

        Ok(path)
    }
}
