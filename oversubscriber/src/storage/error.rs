use std::{
    error::Error,
    fmt::{self, Display},
};

/// The specific result type for size mismatch checks inside the storage module.
pub type Result<T> = std::result::Result<T, SizeMismatchErr>;

/// Error returned whenever a row, a gradient or an external buffer doesn't match
/// the widths configured for an embedding table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeMismatchErr {
    pub got: usize,
    pub expected: usize,
}

impl SizeMismatchErr {
    /// Checks that `got` equals `expected`.
    ///
    /// # Arguments
    /// * `got` - The length of the provided buffer.
    /// * `expected` - The length required by the table.
    ///
    /// # Returns
    /// A `SizeMismatchErr` if both lengths differ.
    pub fn check(got: usize, expected: usize) -> Result<()> {
        if got != expected {
            return Err(Self { got, expected });
        }

        Ok(())
    }
}

impl Display for SizeMismatchErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "size mismatch: the provided buffer has length {}, the table expects {}",
            self.got, self.expected
        )
    }
}

impl Error for SizeMismatchErr {}
