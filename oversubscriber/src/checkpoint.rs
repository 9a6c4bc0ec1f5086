use std::{
    collections::HashSet,
    fs::{self, File},
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use log::{debug, info};

use crate::{
    error::{OversubErr, Result},
    storage::{EmbeddingRow, MemoryRowStore, RowDims, RowStore},
    working_set::WorkingSet,
};

/// Identifies an embedding table checkpoint.
pub const MAGIC: [u8; 4] = *b"EMBT";
/// The only layout version this crate reads and writes.
pub const VERSION: u32 = 1;
/// Size in bytes of the checkpoint header.
pub const HEADER_SIZE: usize = 24;

const EXTENSION: &str = "emb";
const TMP_EXTENSION: &str = "emb.tmp";
const ROWS_OFFSET: u64 = 8;

/// The fixed-size prefix of a checkpoint file.
///
/// Layout, all little-endian: magic, version `u32`, rows `u64`, embedding dim `u32`, state dim `u32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointHeader {
    pub rows: u64,
    pub dims: RowDims,
}

impl CheckpointHeader {
    fn encode(&self) -> Result<[u8; HEADER_SIZE]> {
        let embedding_dim = u32::try_from(self.dims.embedding_dim)
            .map_err(|_| OversubErr::InvalidConfig("embedding dim doesn't fit in 32 bits".into()))?;
        let state_dim = u32::try_from(self.dims.state_dim)
            .map_err(|_| OversubErr::InvalidConfig("state dim doesn't fit in 32 bits".into()))?;

        let mut buf = [0; HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..8].copy_from_slice(&VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.rows.to_le_bytes());
        buf[16..20].copy_from_slice(&embedding_dim.to_le_bytes());
        buf[20..24].copy_from_slice(&state_dim.to_le_bytes());
        Ok(buf)
    }

    fn decode(buf: &[u8; HEADER_SIZE], path: &Path) -> Result<Self> {
        if buf[0..4] != MAGIC {
            return Err(OversubErr::corruption(path, "bad magic"));
        }

        // SAFETY: Every range below is within the `HEADER_SIZE` bytes of `buf`.
        let version = u32::from_le_bytes(buf[4..8].try_into().unwrap());
        if version != VERSION {
            return Err(OversubErr::corruption(
                path,
                format!("unsupported version {version}"),
            ));
        }

        let rows = u64::from_le_bytes(buf[8..16].try_into().unwrap());
        let embedding_dim = u32::from_le_bytes(buf[16..20].try_into().unwrap()) as usize;
        let state_dim = u32::from_le_bytes(buf[20..24].try_into().unwrap()) as usize;

        Ok(Self {
            rows,
            dims: RowDims::new(embedding_dim, state_dim),
        })
    }
}

/// Returns the checkpoint file of `table` inside `dir`.
pub fn path_for(dir: &Path, table: &str) -> PathBuf {
    dir.join(format!("{table}.{EXTENSION}"))
}

/// Persists the whole table into `dir`.
///
/// Dirty working set rows are flushed into `store` first (they stay resident, now clean) and
/// `store` is synced. The file is then written next to its target, synced and renamed over it,
/// so a crash mid-write never damages the previous checkpoint.
///
/// # Arguments
/// * `dir` - The checkpoint directory, created if missing.
/// * `table` - The name of the table, it names the file.
/// * `store` - The row store holding every cold row.
/// * `working_set` - The resident rows to flush before writing.
///
/// # Returns
/// The path of the written checkpoint and its amount of rows.
pub fn save<S>(dir: &Path, table: &str, store: &S, working_set: &WorkingSet) -> Result<(PathBuf, u64)>
where
    S: RowStore + ?Sized,
{
    let flushed = working_set.drain_dirty(store)?;
    store.sync()?;
    debug!(flushed = flushed; "working set flushed before checkpoint");

    fs::create_dir_all(dir)?;
    let path = path_for(dir, table);
    let tmp = dir.join(format!("{table}.{TMP_EXTENSION}"));
    let dims = store.dims();

    let mut writer = BufWriter::new(File::create(&tmp)?);
    writer.write_all(&CheckpointHeader { rows: 0, dims }.encode()?)?;

    let mut rows = 0u64;
    let mut buf = Vec::with_capacity(dims.record_size());

    for key in store.keys() {
        let key = key?;
        let Some(row) = store.lookup(key)? else {
            continue;
        };

        buf.clear();
        row.encode_record(key, &mut buf);
        writer.write_all(&buf)?;
        rows += 1;
    }

    let mut file = writer.into_inner().map_err(|e| e.into_error())?;
    file.seek(SeekFrom::Start(ROWS_OFFSET))?;
    file.write_all(&rows.to_le_bytes())?;
    file.sync_all()?;
    drop(file);

    fs::rename(&tmp, &path)?;
    sync_dir(dir)?;

    info!(path:? = path, rows = rows; "checkpoint saved");
    Ok((path, rows))
}

/// Reads and validates the header of the checkpoint at `path`.
///
/// # Returns
/// The header, `NotFound` if there's no file or `Corruption` if it isn't a valid checkpoint.
pub fn read_header(path: &Path) -> Result<CheckpointHeader> {
    let mut file = File::open(path).map_err(|e| OversubErr::from_open(path, e))?;
    validate(&mut file, path, None)
}

/// Streams the checkpoint of `table` in `dir` into `store`.
///
/// The header and file length are validated before any row is written, a duplicated key
/// is only found while streaming so `store` may end up partially filled in that case.
///
/// # Returns
/// The amount of loaded rows, `NotFound` if there's no checkpoint or `Corruption` if
/// it's invalid or its row widths disagree with `store`.
pub fn load_into<S>(dir: &Path, table: &str, store: &S) -> Result<u64>
where
    S: RowStore + ?Sized,
{
    let path = path_for(dir, table);
    let dims = store.dims();

    let mut file = File::open(&path).map_err(|e| OversubErr::from_open(&path, e))?;
    let header = validate(&mut file, &path, Some(dims))?;

    let mut reader = BufReader::new(file);
    let mut record = vec![0; dims.record_size()];
    let mut seen = HashSet::with_capacity(header.rows as usize);

    for _ in 0..header.rows {
        reader.read_exact(&mut record)?;

        let (key, row) = EmbeddingRow::decode_record(dims, &record)
            .map_err(|e| OversubErr::corruption(&path, e.to_string()))?;

        if !seen.insert(key) {
            return Err(OversubErr::corruption(&path, format!("duplicated key {key}")));
        }

        store.put(key, &row)?;
    }

    store.sync()?;
    info!(path:? = path, rows = header.rows; "checkpoint loaded");
    Ok(header.rows)
}

/// Loads the checkpoint of `table` in `dir` into a new host-resident row store.
///
/// # Arguments
/// * `dir` - The checkpoint directory.
/// * `table` - The name of the table.
/// * `dims` - The configured row widths, the checkpoint must match them.
/// * `shards` - The amount of lock shards of the new store.
///
/// # Returns
/// The filled row store or the same errors as `load_into`.
pub fn load(dir: &Path, table: &str, dims: RowDims, shards: NonZeroUsize) -> Result<MemoryRowStore> {
    let store = MemoryRowStore::new(dims, shards);
    load_into(dir, table, &store)?;
    Ok(store)
}

/// Checks the header of `file` and that its length matches the declared rows exactly.
fn validate(
    file: &mut File,
    path: &Path,
    expected: Option<RowDims>,
) -> Result<CheckpointHeader> {
    let len = file.metadata()?.len();
    if len < HEADER_SIZE as u64 {
        return Err(OversubErr::corruption(path, "truncated header"));
    }

    let mut buf = [0; HEADER_SIZE];
    file.read_exact(&mut buf)?;
    let header = CheckpointHeader::decode(&buf, path)?;

    if let Some(dims) = expected.filter(|dims| *dims != header.dims) {
        return Err(OversubErr::corruption(
            path,
            format!(
                "row widths {}+{} inconsistent with configured {}+{}",
                header.dims.embedding_dim,
                header.dims.state_dim,
                dims.embedding_dim,
                dims.state_dim
            ),
        ));
    }

    let body = header
        .rows
        .checked_mul(header.dims.record_size() as u64)
        .and_then(|body| body.checked_add(HEADER_SIZE as u64));

    if body != Some(len) {
        return Err(OversubErr::corruption(
            path,
            format!("{} rows declared but the file is {len} bytes long", header.rows),
        ));
    }

    Ok(header)
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIMS: RowDims = RowDims {
        embedding_dim: 2,
        state_dim: 1,
    };

    fn shards() -> NonZeroUsize {
        NonZeroUsize::new(2).unwrap()
    }

    fn row(v: f32) -> EmbeddingRow {
        EmbeddingRow::new(vec![v; 2], vec![-v])
    }

    fn saved(dir: &Path) -> MemoryRowStore {
        let store = MemoryRowStore::new(DIMS, shards());
        let ws = WorkingSet::new(DIMS, NonZeroUsize::new(4).unwrap(), shards());

        store.put(1, &row(1.)).unwrap();
        store.put(2, &row(2.)).unwrap();
        ws.put(2, row(20.), true).unwrap();
        ws.put(3, row(3.), true).unwrap();

        let (path, rows) = save(dir, "table", &store, &ws).unwrap();
        assert_eq!(path, dir.join("table.emb"));
        assert_eq!(rows, 3);
        assert!(ws.dirty_keys().is_empty());
        assert_eq!(ws.len(), 2);
        store
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());

        let loaded = load(dir.path(), "table", DIMS, shards()).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded.lookup(1).unwrap(), Some(row(1.)));
        assert_eq!(loaded.lookup(2).unwrap(), Some(row(20.)));
        assert_eq!(loaded.lookup(3).unwrap(), Some(row(3.)));
        assert!(!dir.path().join("table.emb.tmp").exists());
    }

    #[test]
    fn header_describes_the_table() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());

        let header = read_header(&path_for(dir.path(), "table")).unwrap();
        assert_eq!(header, CheckpointHeader { rows: 3, dims: DIMS });
    }

    #[test]
    fn missing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let err = load(dir.path(), "table", DIMS, shards()).unwrap_err();
        assert!(matches!(err, OversubErr::NotFound(_)));
    }

    #[test]
    fn mismatched_widths_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());

        let err = load(dir.path(), "table", RowDims::new(3, 1), shards()).unwrap_err();
        assert!(matches!(err, OversubErr::Corruption { .. }));
    }

    #[test]
    fn truncated_file_is_corruption() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());

        let path = path_for(dir.path(), "table");
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

        let err = load(dir.path(), "table", DIMS, shards()).unwrap_err();
        assert!(matches!(err, OversubErr::Corruption { .. }));

        fs::write(&path, &bytes[..10]).unwrap();
        let err = load(dir.path(), "table", DIMS, shards()).unwrap_err();
        assert!(matches!(err, OversubErr::Corruption { .. }));
    }

    #[test]
    fn bad_magic_and_duplicates_are_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let path = path_for(dir.path(), "table");

        let header = CheckpointHeader { rows: 2, dims: DIMS };
        let mut bytes = header.encode().unwrap().to_vec();
        row(1.).encode_record(5, &mut bytes);
        row(2.).encode_record(5, &mut bytes);
        fs::write(&path, &bytes).unwrap();

        let err = load(dir.path(), "table", DIMS, shards()).unwrap_err();
        assert!(matches!(err, OversubErr::Corruption { ref reason, .. } if reason.contains("duplicated")));

        bytes[0] = b'X';
        fs::write(&path, &bytes).unwrap();
        let err = load(dir.path(), "table", DIMS, shards()).unwrap_err();
        assert!(matches!(err, OversubErr::Corruption { ref reason, .. } if reason == "bad magic"));
    }

    #[test]
    fn failed_save_keeps_previous_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        saved(dir.path());

        let path = path_for(dir.path(), "table");
        let before = fs::read(&path).unwrap();

        fs::create_dir(dir.path().join("table.emb.tmp")).unwrap();
        let store = MemoryRowStore::new(DIMS, shards());
        let ws = WorkingSet::new(DIMS, NonZeroUsize::new(1).unwrap(), shards());
        assert!(save(dir.path(), "table", &store, &ws).is_err());

        assert_eq!(fs::read(&path).unwrap(), before);
    }
}
