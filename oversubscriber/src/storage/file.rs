use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use log::{debug, warn};
use parking_lot::Mutex;

use super::{EmbeddingRow, KEY_SIZE, Key, Keys, RowDims, RowStore, store::check_row};

#[derive(Debug)]
struct Inner {
    file: File,
    index: HashMap<Key, u64>,
    slots: u64,
    buf: Vec<u8>,
}

/// A disk-backed `RowStore`.
///
/// Rows live in a single file of fixed-width `(key, weights, state)` records,
/// an in-memory index maps every key to its slot. Overwrites happen in place
/// and new keys are appended, so every key appears in the file exactly once.
#[derive(Debug)]
pub struct FileRowStore {
    path: PathBuf,
    dims: RowDims,
    inner: Mutex<Inner>,
}

impl FileRowStore {
    /// Creates a new empty `FileRowStore`, truncating whatever was at `path`.
    ///
    /// # Arguments
    /// * `path` - The backing file.
    /// * `dims` - The widths of every row.
    ///
    /// # Returns
    /// A new `FileRowStore` or an io error if the file can't be created.
    pub fn create(path: impl AsRef<Path>, dims: RowDims) -> io::Result<Self> {
        let path = path.as_ref();
        Self::ensure_parent(path)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        Ok(Self::from_parts(path, dims, file, HashMap::new(), 0))
    }

    /// Opens the `FileRowStore` at `path`, rebuilding its index from the records already there.
    ///
    /// A torn trailing record, left by a crash in the middle of a write, is trimmed off.
    ///
    /// # Arguments
    /// * `path` - The backing file, created if missing.
    /// * `dims` - The widths of every row.
    ///
    /// # Returns
    /// The reopened store or an io error if the file can't be read.
    pub fn open(path: impl AsRef<Path>, dims: RowDims) -> io::Result<Self> {
        let path = path.as_ref();
        Self::ensure_parent(path)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let record_size = dims.record_size() as u64;
        let len = file.metadata()?.len();
        let slots = len / record_size;

        if len % record_size != 0 {
            warn!(
                path:? = path, trailing = len % record_size;
                "trimming torn record at the end of the row store"
            );
            file.set_len(slots * record_size)?;
        }

        let mut index = HashMap::with_capacity(slots as usize);
        let mut reader = BufReader::new(&mut file);
        let mut key_buf = [0; KEY_SIZE];

        for slot in 0..slots {
            reader.read_exact(&mut key_buf)?;
            reader.seek_relative(record_size as i64 - KEY_SIZE as i64)?;

            if index.insert(Key::from_le_bytes(key_buf), slot).is_some() {
                warn!(
                    key = Key::from_le_bytes(key_buf), slot = slot;
                    "duplicated key in row store, keeping the latest slot"
                );
            }
        }

        drop(reader);
        debug!(path:? = path, rows = index.len(); "row store reopened");
        Ok(Self::from_parts(path, dims, file, index, slots))
    }

    /// Returns the path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn from_parts(
        path: &Path,
        dims: RowDims,
        file: File,
        index: HashMap<Key, u64>,
        slots: u64,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            dims,
            inner: Mutex::new(Inner {
                file,
                index,
                slots,
                buf: Vec::with_capacity(dims.record_size()),
            }),
        }
    }

    fn ensure_parent(path: &Path) -> io::Result<()> {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }

    fn offset(&self, slot: u64) -> u64 {
        slot * self.dims.record_size() as u64
    }
}

impl RowStore for FileRowStore {
    fn dims(&self) -> RowDims {
        self.dims
    }

    fn len(&self) -> usize {
        self.inner.lock().index.len()
    }

    fn contains(&self, key: Key) -> bool {
        self.inner.lock().index.contains_key(&key)
    }

    fn lookup(&self, key: Key) -> io::Result<Option<EmbeddingRow>> {
        let mut inner = self.inner.lock();
        let Inner {
            file, index, buf, ..
        } = &mut *inner;

        let Some(&slot) = index.get(&key) else {
            return Ok(None);
        };

        buf.resize(self.dims.record_size(), 0);
        file.seek(SeekFrom::Start(self.offset(slot)))?;
        file.read_exact(buf)?;

        let (stored, row) = EmbeddingRow::decode_record(self.dims, buf)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        if stored != key {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("slot {slot} holds key {stored}, expected {key}"),
            ));
        }

        Ok(Some(row))
    }

    fn put(&self, key: Key, row: &EmbeddingRow) -> io::Result<()> {
        check_row(self.dims, row)?;

        let mut inner = self.inner.lock();
        let Inner {
            file,
            index,
            slots,
            buf,
        } = &mut *inner;

        let (slot, fresh) = match index.get(&key) {
            Some(&slot) => (slot, false),
            None => (*slots, true),
        };

        buf.clear();
        row.encode_record(key, buf);
        file.seek(SeekFrom::Start(self.offset(slot)))?;
        file.write_all(buf)?;

        if fresh {
            index.insert(key, slot);
            *slots += 1;
        }

        Ok(())
    }

    fn keys(&self) -> Keys<'_> {
        let slots = self.inner.lock().slots;

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) => return Box::new(std::iter::once(Err(e))),
        };

        Box::new(RecordKeys {
            reader: BufReader::new(file),
            record: vec![0; self.dims.record_size()],
            remaining: slots,
        })
    }

    fn sync(&self) -> io::Result<()> {
        self.inner.lock().file.sync_data()
    }
}

/// Streams the keys of a row store file from its own read handle.
struct RecordKeys {
    reader: BufReader<File>,
    record: Vec<u8>,
    remaining: u64,
}

impl Iterator for RecordKeys {
    type Item = io::Result<Key>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }

        self.remaining -= 1;

        if let Err(e) = self.reader.read_exact(&mut self.record) {
            self.remaining = 0;
            return Some(Err(e));
        }

        // SAFETY: Every record is at least `KEY_SIZE` bytes long.
        let key = Key::from_le_bytes(self.record[..KEY_SIZE].try_into().unwrap());
        Some(Ok(key))
    }
}
