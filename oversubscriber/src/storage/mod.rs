mod error;
mod file;
mod memory;
mod row;
mod store;

pub use error::{Result, SizeMismatchErr};
pub use file::FileRowStore;
pub use memory::MemoryRowStore;
pub use row::{EmbeddingRow, KEY_SIZE, Key, RowDims};
pub use store::{Keys, RowStore};
