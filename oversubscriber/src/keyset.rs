use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{OversubErr, Result},
    storage::Key,
};

/// The on-disk encoding of a keyset manifest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeysetFormat {
    /// One plain integer per line.
    #[default]
    Text,
    /// Packed little-endian 32-bit keys.
    Binary32,
    /// Packed little-endian 64-bit keys.
    Binary64,
}

/// The ordered keys a data shard is going to reference, duplicates included.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyset {
    keys: Vec<Key>,
}

impl Keyset {
    /// Creates a new `Keyset` from already parsed keys.
    pub fn new(keys: Vec<Key>) -> Self {
        Self { keys }
    }

    /// Reads the keyset manifest at `path`.
    ///
    /// Reading has no side effects, the same manifest can be loaded any number of times.
    ///
    /// # Arguments
    /// * `path` - The manifest to read.
    /// * `format` - How the keys are encoded.
    ///
    /// # Returns
    /// The keys in file order, `NotFound` if `path` doesn't exist or `Format` if it's malformed.
    pub fn load(path: impl AsRef<Path>, format: KeysetFormat) -> Result<Self> {
        let path = path.as_ref();

        match format {
            KeysetFormat::Text => {
                let file = File::open(path).map_err(|e| OversubErr::from_open(path, e))?;
                Self::parse_text(BufReader::new(file), path)
            }
            KeysetFormat::Binary32 | KeysetFormat::Binary64 => {
                let bytes = fs::read(path).map_err(|e| OversubErr::from_open(path, e))?;
                Self::parse_binary(&bytes, format, path)
            }
        }
    }

    /// Parses a text manifest, one key per line. Blank lines are skipped.
    ///
    /// # Arguments
    /// * `reader` - The manifest contents.
    /// * `path` - The manifest's path, only used for error reporting.
    ///
    /// # Returns
    /// The parsed keyset or a `Format` error pointing at the first bad line.
    pub fn parse_text<R: BufRead>(reader: R, path: &Path) -> Result<Self> {
        let mut keys = Vec::new();

        for (i, line) in reader.lines().enumerate() {
            let line = line.map_err(|e| match e.kind() {
                io::ErrorKind::InvalidData => OversubErr::format(path, i + 1, "not valid utf-8"),
                _ => OversubErr::Io(e),
            })?;

            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let key = line.parse::<Key>().map_err(|e| {
                OversubErr::format(path, i + 1, format!("invalid key {line:?}: {e}"))
            })?;

            keys.push(key);
        }

        Ok(Self { keys })
    }

    /// Parses a packed binary manifest.
    ///
    /// # Arguments
    /// * `bytes` - The manifest contents.
    /// * `format` - Either `Binary32` or `Binary64`.
    /// * `path` - The manifest's path, only used for error reporting.
    ///
    /// # Returns
    /// The parsed keyset or a `Format` error if the contents aren't a whole amount of keys.
    pub fn parse_binary(bytes: &[u8], format: KeysetFormat, path: &Path) -> Result<Self> {
        let width = match format {
            KeysetFormat::Binary32 => size_of::<u32>(),
            KeysetFormat::Binary64 => size_of::<u64>(),
            KeysetFormat::Text => {
                return Err(OversubErr::format(path, 0, "text manifest given as binary"));
            }
        };

        if bytes.len() % width != 0 {
            return Err(OversubErr::format(
                path,
                bytes.len() / width + 1,
                format!("truncated record, {} trailing bytes", bytes.len() % width),
            ));
        }

        // SAFETY: `chunks_exact` yields slices of exactly `width` bytes.
        let keys = bytes
            .chunks_exact(width)
            .map(|chunk| match format {
                KeysetFormat::Binary32 => u32::from_le_bytes(chunk.try_into().unwrap()) as Key,
                _ => Key::from_le_bytes(chunk.try_into().unwrap()),
            })
            .collect();

        Ok(Self { keys })
    }

    /// Returns the keys in manifest order, duplicates included.
    #[inline]
    pub fn keys(&self) -> &[Key] {
        &self.keys
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl From<Vec<Key>> for Keyset {
    fn from(keys: Vec<Key>) -> Self {
        Self::new(keys)
    }
}
