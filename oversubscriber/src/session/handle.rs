use std::{path::PathBuf, sync::Arc};

use parking_lot::RwLock;
use tokio::task;

use super::Session;
use crate::{
    error::Result,
    storage::Key,
    swap::SwapReport,
    working_set::MemoryUsage,
};

/// Drives a `Session` from the async runtime.
///
/// Bridges async drivers and the blocking, CPU and disk bound swap passes, it must
/// be used from a multi-threaded runtime.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<RwLock<Session>>,
}

impl SessionHandle {
    /// Creates a new `SessionHandle`.
    ///
    /// # Arguments
    /// * `session` - The session to drive.
    pub fn new(session: Session) -> Self {
        Self {
            inner: Arc::new(RwLock::new(session)),
        }
    }

    pub async fn update(&self, path: PathBuf) -> Result<SwapReport> {
        task::block_in_place(|| self.inner.read().update(path))
    }

    pub async fn update_keys(&self, keys: &[Key]) -> Result<SwapReport> {
        task::block_in_place(|| self.inner.read().update_keys(keys))
    }

    pub async fn apply_gradient(&self, key: Key, grad: &[f32]) -> Result<()> {
        task::block_in_place(|| self.inner.read().apply_gradient(key, grad))
    }

    pub async fn save(&self) -> Result<PathBuf> {
        task::block_in_place(|| self.inner.read().save())
    }

    pub async fn load_from(&self, dir: PathBuf) -> Result<u64> {
        task::block_in_place(|| self.inner.write().load_from(dir))
    }

    pub async fn memory_usage(&self) -> MemoryUsage {
        self.inner.read().memory_usage()
    }

    /// Shuts the session down, see `Session::shutdown`.
    ///
    /// If other handles are still alive the session can't be ended, the table is only checkpointed.
    pub async fn shutdown(self) -> Result<PathBuf> {
        task::block_in_place(|| match Arc::try_unwrap(self.inner) {
            Ok(session) => session.into_inner().shutdown(),
            Err(shared) => shared.read().save(),
        })
    }
}
