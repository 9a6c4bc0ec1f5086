use std::{error::Error, fmt, io, path::PathBuf};

use crate::storage::{Key, SizeMismatchErr};

/// The oversubscriber's result type.
pub type Result<T> = std::result::Result<T, OversubErr>;

/// The stage of a swap pass in which a failure happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwapPhase {
    /// Writing dirty stale rows back to the row store and evicting them.
    Flush,
    /// Making the flushed rows durable.
    Sync,
    /// Fetching missing rows from the row store and admitting them.
    Admit,
}

impl fmt::Display for SwapPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SwapPhase::Flush => "flush",
            SwapPhase::Sync => "sync",
            SwapPhase::Admit => "admit",
        };

        f.write_str(name)
    }
}

/// Every failure the oversubscription engine can report to its driver.
#[derive(Debug)]
pub enum OversubErr {
    /// A keyset manifest is malformed.
    Format {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    /// A keyset or checkpoint file doesn't exist.
    NotFound(PathBuf),
    /// The requested keyset doesn't fit in the working set.
    Capacity { requested: usize, capacity: usize },
    /// A key was addressed while not being resident in the working set.
    NotResident(Key),
    /// A checkpoint is structurally invalid.
    Corruption { path: PathBuf, reason: String },
    /// A row of the wrong width was handed to a table.
    SizeMismatch(SizeMismatchErr),
    /// Invalid configuration, caught before touching any storage.
    InvalidConfig(String),
    /// A swap pass aborted, `failed` lists the keys it couldn't move.
    Swap {
        phase: SwapPhase,
        failed: Vec<Key>,
        source: io::Error,
    },
    /// An underlying I/O error not covered by the above variants.
    Io(io::Error),
}

impl OversubErr {
    /// Creates a `Format` error for `path` at a given line.
    ///
    /// # Arguments
    /// * `path` - The manifest that failed to parse.
    /// * `line` - The 1-based line (or record) number.
    /// * `reason` - A human readable description.
    ///
    /// # Returns
    /// A new `OversubErr::Format`.
    pub fn format(path: impl Into<PathBuf>, line: usize, reason: impl Into<String>) -> Self {
        Self::Format {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    /// Creates a `Corruption` error for `path`.
    pub fn corruption(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::Corruption {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Maps an `io::Error` raised while opening `path`, turning `NotFound` into its own variant.
    ///
    /// # Arguments
    /// * `path` - The path that was being opened.
    /// * `err` - The raised error.
    ///
    /// # Returns
    /// The corresponding `OversubErr`.
    pub fn from_open(path: impl Into<PathBuf>, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.into()),
            _ => Self::Io(err),
        }
    }
}

impl fmt::Display for OversubErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Format { path, line, reason } => {
                write!(f, "malformed input {}:{line}: {reason}", path.display())
            }
            Self::NotFound(path) => write!(f, "no such file: {}", path.display()),
            Self::Capacity {
                requested,
                capacity,
            } => write!(
                f,
                "keyset of {requested} unique keys exceeds working set capacity of {capacity} rows"
            ),
            Self::NotResident(key) => write!(f, "key {key} is not resident in the working set"),
            Self::Corruption { path, reason } => {
                write!(f, "corrupted checkpoint {}: {reason}", path.display())
            }
            Self::SizeMismatch(e) => write!(f, "{e}"),
            Self::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            Self::Swap {
                phase,
                failed,
                source,
            } => write!(
                f,
                "swap aborted during {phase}, {} keys affected: {source}",
                failed.len()
            ),
            Self::Io(e) => write!(f, "io error: {e}"),
        }
    }
}

impl Error for OversubErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::SizeMismatch(e) => Some(e),
            Self::Swap { source, .. } => Some(source),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for OversubErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<SizeMismatchErr> for OversubErr {
    fn from(value: SizeMismatchErr) -> Self {
        Self::SizeMismatch(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<OversubErr> for io::Error {
    fn from(value: OversubErr) -> Self {
        match value {
            OversubErr::Io(e) => e,
            OversubErr::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, value),
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
