mod constant;
mod error;
mod random;
mod row_init;

pub use constant::ConstRowInit;
pub use error::{RandErr, Result};
pub use random::RandRowInit;
pub use row_init::RowInit;
