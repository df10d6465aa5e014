//! Chunk store — durable, write-once storage for fixed-size binary chunks.
//!
//! Every chunk lives in its own file under `base_path/chunks/`, fanned out
//! by the low byte of its id:
//!   chunks/00/0000000000000100.chk, chunks/01/0000000000000001.chk, …
//!
//! ## File Layout
//!
//! ```text
//! [ChunkHeader : 16 bytes]
//!   magic      : [u8;4]  = b"VCHK"
//!   chunk_id   : u64     (LE) — must match the file name
//!   data_len   : u32     (LE)
//!
//! [raw data    : data_len bytes]
//! ```
//!
//! Writes go to `<id>.tmp`, are fsynced, then renamed into place, so a
//! chunk is either fully visible or absent. Ids come from a monotonic
//! counter that resumes past the highest id found on disk; the owner raises
//! it further with [`ChunkStore::advance_past`] for ids still referenced
//! elsewhere whose files may be gone.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Cursor, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{StoreError, Result};

// ─────────────────────────────── constants ───────────────────────────────────

pub const CHUNK_MAGIC: &[u8; 4] = b"VCHK";
pub const CHUNK_HEADER_SIZE: u64 = 4 + 8 + 4; // 16 bytes
const CHUNK_EXT: &str = "chk";
const TMP_EXT: &str = "tmp";

// ─────────────────────────────── types ───────────────────────────────────────

/// Opaque, store-assigned chunk identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct ChunkId(u64);

impl ChunkId {
    pub fn from_raw(raw: u64) -> Self {
        ChunkId(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

// ─────────────────────────────── ChunkStore ──────────────────────────────────

/// Thread-safe, file-per-chunk store. All methods take `&self`; share it
/// behind an `Arc`. Calls perform blocking file I/O.
pub struct ChunkStore {
    root: PathBuf,
    max_chunk_size: usize,
    sync_writes: bool,
    next_id: AtomicU64,
}

impl ChunkStore {
    /// Open (or create) the chunk directory under `base_path`.
    pub fn open(base_path: &Path, max_chunk_size: usize, sync_writes: bool) -> Result<Self> {
        let root = base_path.join("chunks");
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::Storage(format!("Cannot create chunk dir {root:?}: {e}")))?;

        let mut highest: Option<u64> = None;
        let mut stale = 0usize;
        for path in chunk_files(&root)? {
            match path.extension().and_then(|e| e.to_str()) {
                Some(TMP_EXT) => {
                    // Leftover of a write interrupted before its rename.
                    fs::remove_file(&path)?;
                    stale += 1;
                }
                Some(CHUNK_EXT) => {
                    if let Some(id) = parse_chunk_id(&path) {
                        highest = Some(highest.map_or(id, |h| h.max(id)));
                    }
                }
                _ => {}
            }
        }
        if stale > 0 {
            warn!(removed = stale, "Removed interrupted chunk writes");
        }

        let next = highest.map_or(0, |h| h + 1);
        info!(root = ?root, next_id = next, max_chunk_size, "Chunk store opened");

        Ok(ChunkStore {
            root,
            max_chunk_size,
            sync_writes,
            next_id: AtomicU64::new(next),
        })
    }

    /// Never hand out `id` or anything below it.
    pub fn advance_past(&self, id: ChunkId) {
        let floor = id.0.saturating_add(1);
        let prev = self.next_id.fetch_max(floor, Ordering::SeqCst);
        if prev < floor {
            debug!(from = prev, to = floor, "Chunk id counter advanced");
        }
    }

    /// Durably store one chunk and return its id.
    pub fn put(&self, data: &[u8]) -> Result<ChunkId> {
        if data.len() > self.max_chunk_size {
            return Err(StoreError::ChunkTooLarge {
                len: data.len(),
                limit: self.max_chunk_size,
            });
        }

        let id = ChunkId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let path = self.chunk_path(id);
        let dir = self.fanout_dir(id);
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Storage(format!("create {dir:?}: {e}")))?;

        let tmp = path.with_extension(TMP_EXT);
        let mut file = BufWriter::new(
            File::create(&tmp).map_err(|e| StoreError::Storage(format!("create {tmp:?}: {e}")))?,
        );
        file.write_all(CHUNK_MAGIC)?;
        file.write_u64::<LittleEndian>(id.0)?;
        file.write_u32::<LittleEndian>(data.len() as u32)?;
        file.write_all(data)?;
        let file = file.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
        if self.sync_writes {
            file.sync_all()?;
        }
        drop(file);

        fs::rename(&tmp, &path)
            .map_err(|e| StoreError::Storage(format!("rename {tmp:?}: {e}")))?;
        if self.sync_writes {
            sync_dir(&dir)?;
        }

        debug!(chunk_id = %id, bytes = data.len(), "Chunk written");
        Ok(id)
    }

    /// Read back exactly the bytes stored under `id`.
    pub fn get(&self, id: ChunkId) -> Result<Bytes> {
        let path = self.chunk_path(id);
        let raw = match fs::read(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(StoreError::ChunkNotFound(id)),
            Err(e) => return Err(StoreError::Storage(format!("read {path:?}: {e}"))),
        };

        let corrupt = |reason: String| StoreError::CorruptChunk { id, reason };
        if (raw.len() as u64) < CHUNK_HEADER_SIZE {
            return Err(corrupt(format!("{} bytes is shorter than the header", raw.len())));
        }

        let mut cur = Cursor::new(&raw[..]);
        let mut magic = [0u8; 4];
        cur.read_exact(&mut magic)?;
        if &magic != CHUNK_MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let stored_id = cur.read_u64::<LittleEndian>()?;
        if stored_id != id.0 {
            return Err(corrupt(format!("header names chunk {stored_id:016x}")));
        }
        let data_len = cur.read_u32::<LittleEndian>()? as u64;
        let actual = raw.len() as u64 - CHUNK_HEADER_SIZE;
        if data_len != actual {
            return Err(corrupt(format!("header says {data_len} bytes, file holds {actual}")));
        }

        let mut bytes = Bytes::from(raw);
        Ok(bytes.split_off(CHUNK_HEADER_SIZE as usize))
    }

    /// Remove a chunk. A second delete of the same id reports `ChunkNotFound`.
    pub fn delete(&self, id: ChunkId) -> Result<()> {
        let path = self.chunk_path(id);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(chunk_id = %id, "Chunk deleted");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::ChunkNotFound(id)),
            Err(e) => Err(StoreError::Storage(format!("delete {path:?}: {e}"))),
        }
    }

    pub fn contains(&self, id: ChunkId) -> bool {
        self.chunk_path(id).is_file()
    }

    /// All chunk ids currently on disk, ascending.
    pub fn ids(&self) -> Result<Vec<ChunkId>> {
        let mut ids: Vec<ChunkId> = chunk_files(&self.root)?
            .iter()
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(CHUNK_EXT))
            .filter_map(|p| parse_chunk_id(p))
            .map(ChunkId)
            .collect();
        ids.sort();
        Ok(ids)
    }

    pub fn max_chunk_size(&self) -> usize {
        self.max_chunk_size
    }

    fn fanout_dir(&self, id: ChunkId) -> PathBuf {
        self.root.join(format!("{:02x}", id.0 & 0xff))
    }

    fn chunk_path(&self, id: ChunkId) -> PathBuf {
        self.fanout_dir(id).join(format!("{id}.{CHUNK_EXT}"))
    }
}

impl fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkStore")
            .field("root", &self.root)
            .field("max_chunk_size", &self.max_chunk_size)
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

/// Every file one level below the fan-out directories.
fn chunk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for dir in fs::read_dir(root)? {
        let dir = dir?;
        if !dir.file_type()?.is_dir() {
            continue;
        }
        for entry in fs::read_dir(dir.path())? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                files.push(entry.path());
            }
        }
    }
    Ok(files)
}

fn parse_chunk_id(path: &Path) -> Option<u64> {
    let stem = path.file_stem()?.to_str()?;
    u64::from_str_radix(stem, 16).ok()
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}
