use std::{
    error::Error,
    fmt::{self, Display},
};

pub type Result<T> = std::result::Result<T, RandErr>;

/// Rejected distribution parameters of a `RandRowInit`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RandErr {
    /// `low..high` is empty or not finite.
    EmptyRange { low: f32, high: f32 },
    /// The standard deviation is negative or not finite.
    InvalidStdDev(f32),
}

impl Display for RandErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRange { low, high } => {
                write!(f, "can't sample fresh rows from the range {low}..{high}")
            }
            Self::InvalidStdDev(std_dev) => {
                write!(f, "standard deviation {std_dev} must be finite and non negative")
            }
        }
    }
}

impl Error for RandErr {}
