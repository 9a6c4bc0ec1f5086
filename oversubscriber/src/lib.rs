pub mod checkpoint;
pub mod config;
pub mod error;
pub mod initialization;
pub mod keyset;
pub mod optimization;
pub mod session;
pub mod storage;
pub mod swap;
pub mod working_set;

pub use config::SessionConfig;
pub use error::{OversubErr, Result, SwapPhase};
pub use keyset::{Keyset, KeysetFormat};
pub use session::{Session, SessionBuilder, SessionHandle};
pub use storage::{EmbeddingRow, Key, RowDims, RowStore};
pub use swap::{Oversubscriber, SwapReport};
pub use working_set::{MemoryUsage, WorkingSet};
