// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Metadata catalog — maps (name, version) → ordered chunk list.
//!
//! The catalog lives in memory but is **persistent**: every mutation is
//! appended to `catalog.log` and fsynced before the call returns. On
//! startup the log is replayed to rebuild the records, the commit order
//! and the per-name version counters.
//!
//! ## File Layout
//!
//! ```text
//! [LogHeader : 8 bytes]
//!   magic    : [u8;8]  = b"VCATLOG0"
//!
//! [Entry, repeated]
//!   tag      : [u8;4]  = b"VRSV" | b"VCMT" | b"VDEL"
//!   name_len : u16     (LE)
//!   name     : [u8; name_len] (UTF-8)
//!   version  : u64     (LE)
//!   -- VCMT only --
//!   length     : u64   (LE)
//!   created_at : i64   (unix millis, LE)
//!   chunk_size : u32   (LE)
//!   chunk_count: u32   (LE)
//!   chunk_ids  : [u64 LE; chunk_count]
//! ```
//!
//! `VRSV` entries are the persisted counter table: a version handed out by
//! [`MetadataCatalog::next_version`] is never handed out again, even across
//! restarts and even if its ingest never committed.
//!
//! A failed append is rolled back by truncating the log to its length before
//! the write, so the file only ever holds whole entries that were applied.

use std::collections::{BTreeMap, HashMap};
use std::fs::{File, OpenOptions};
use std::io::{self, Cursor, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{StoreError, Result};
use crate::storage::chunk_store::ChunkId;

// ─────────────────────────────── constants ───────────────────────────────────

pub const LOG_MAGIC: &[u8; 8] = b"VCATLOG0";
pub const TAG_RESERVE: &[u8; 4] = b"VRSV";
pub const TAG_COMMIT: &[u8; 4] = b"VCMT";
pub const TAG_DELETE: &[u8; 4] = b"VDEL";
/// Longest accepted object name in bytes.
pub const MAX_NAME_LEN: usize = 1024;

// ─────────────────────────────── types ───────────────────────────────────────

/// One complete, committed version of a named object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionRecord {
    pub name: String,
    pub version: u64,
    /// Total byte length of the reassembled object.
    pub length: u64,
    /// Chunk size used at ingest; every chunk but the last has this length.
    pub chunk_size: u32,
    /// Ordered chunk list; order defines byte order.
    pub chunk_ids: Vec<ChunkId>,
    pub created_at: DateTime<Utc>,
}

impl VersionRecord {
    pub fn summary(&self) -> VersionSummary {
        VersionSummary {
            name: self.name.clone(),
            version: self.version,
            length: self.length,
            created_at: self.created_at,
        }
    }

    /// Byte length chunk `idx` must have.
    pub fn expected_chunk_len(&self, idx: usize) -> u64 {
        let start = idx as u64 * self.chunk_size as u64;
        self.length.saturating_sub(start).min(self.chunk_size as u64)
    }

    /// Number of chunks `length` splits into at `chunk_size`.
    pub fn expected_chunk_count(&self) -> usize {
        if self.chunk_size == 0 {
            return 0;
        }
        self.length.div_ceil(self.chunk_size as u64) as usize
    }
}

/// Listing view of a version: no chunk list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VersionSummary {
    pub name: String,
    pub version: u64,
    pub length: u64,
    pub created_at: DateTime<Utc>,
}

enum LogEntry {
    Reserve { name: String, version: u64 },
    Commit(VersionRecord),
    Delete { name: String, version: u64 },
}

#[derive(Debug, Default)]
struct CatalogState {
    /// name → version → record.
    by_name: HashMap<String, BTreeMap<u64, Arc<VersionRecord>>>,
    /// Commit order, used by `list_all`.
    order: Vec<Arc<VersionRecord>>,
    /// name → next version to hand out.
    next: HashMap<String, u64>,
    /// Highest chunk id any commit entry ever referenced, removed ones included.
    chunk_high_water: Option<u64>,
}

impl CatalogState {
    fn apply(&mut self, entry: LogEntry) {
        match entry {
            LogEntry::Reserve { name, version } => self.bump(&name, version),
            LogEntry::Commit(record) => {
                self.bump(&record.name, record.version);
                if let Some(max) = record.chunk_ids.iter().map(|id| id.as_u64()).max() {
                    self.chunk_high_water = Some(self.chunk_high_water.map_or(max, |h| h.max(max)));
                }
                let record = Arc::new(record);
                self.by_name
                    .entry(record.name.clone())
                    .or_default()
                    .insert(record.version, record.clone());
                self.order.push(record);
            }
            LogEntry::Delete { name, version } => {
                if let Some(versions) = self.by_name.get_mut(&name) {
                    versions.remove(&version);
                    if versions.is_empty() {
                        self.by_name.remove(&name);
                    }
                }
                self.order.retain(|r| !(r.name == name && r.version == version));
            }
        }
    }

    fn bump(&mut self, name: &str, version: u64) {
        let next = self.next.entry(name.to_string()).or_insert(0);
        *next = (*next).max(version + 1);
    }

    fn get(&self, name: &str, version: u64) -> Option<&Arc<VersionRecord>> {
        self.by_name.get(name)?.get(&version)
    }
}

// ─────────────────────────────── MetadataCatalog ─────────────────────────────

/// Durable version catalog. Safe for concurrent use; share behind an `Arc`.
///
/// Mutations serialise on the log mutex and do their blocking file I/O
/// there; the state lock is only taken to read or apply in-memory changes,
/// so readers never wait on a log fsync.
#[derive(Debug)]
pub struct MetadataCatalog {
    path: PathBuf,
    sync_writes: bool,
    state: RwLock<CatalogState>,
    log: Mutex<File>,
    /// Set when a failed append could not be rolled back.
    wedged: AtomicBool,
}

impl MetadataCatalog {
    /// Open (or create) `base_path/catalog.log` and replay it.
    pub fn open(base_path: &Path, sync_writes: bool) -> Result<Self> {
        std::fs::create_dir_all(base_path)
            .map_err(|e| StoreError::Storage(format!("Cannot create storage dir: {e}")))?;
        let path = base_path.join("catalog.log");

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| StoreError::Storage(format!("open {path:?}: {e}")))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut state = CatalogState::default();
        if raw.len() < LOG_MAGIC.len() {
            if !raw.is_empty() {
                warn!(path = ?path, "Catalog log header incomplete, reinitialising");
            }
            file.set_len(0)?;
            file.seek(SeekFrom::Start(0))?;
            file.write_all(LOG_MAGIC)?;
            file.sync_all()?;
        } else {
            let (entries, good_len) = scan_log(&raw)?;
            let count = entries.len();
            for entry in entries {
                state.apply(entry);
            }
            if good_len < raw.len() as u64 {
                warn!(
                    path = ?path,
                    dropped_bytes = raw.len() as u64 - good_len,
                    "Catalog log has a torn tail, truncating"
                );
                file.set_len(good_len)?;
                file.sync_all()?;
            }
            if count > 0 {
                info!(entries = count, records = state.order.len(), "Catalog rebuilt from log");
            }
        }

        // Appends always land at the end; OpenOptions::append keeps it that
        // way even after the truncation above.
        drop(file);
        let log = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| StoreError::Storage(format!("open {path:?} for append: {e}")))?;

        Ok(MetadataCatalog {
            path,
            sync_writes,
            state: RwLock::new(state),
            log: Mutex::new(log),
            wedged: AtomicBool::new(false),
        })
    }

    /// Reserve the next version number for `name`.
    ///
    /// Atomic read-and-increment: concurrent callers for the same name
    /// always receive distinct, increasing numbers.
    pub fn next_version(&self, name: &str) -> Result<u64> {
        validate_name(name)?;
        let mut log = self.log.lock();
        let version = self.state.read().next.get(name).copied().unwrap_or(0);
        self.append(&mut log, &encode_reserve(name, version))?;
        self.state.write().bump(name, version);
        Ok(version)
    }

    /// Durably record a complete version. Fails with `Conflict` if
    /// `(name, version)` is already committed, and with `InvalidRecord` if
    /// the chunk list cannot hold `length` bytes at `chunk_size`.
    pub fn commit(
        &self,
        name: &str,
        version: u64,
        chunk_ids: Vec<ChunkId>,
        length: u64,
        chunk_size: u32,
    ) -> Result<VersionRecord> {
        validate_name(name)?;
        if chunk_size == 0 {
            return Err(StoreError::InvalidRecord(format!(
                "'{name}' v{version}: chunk size must be > 0"
            )));
        }
        let expected = length.div_ceil(chunk_size as u64);
        if chunk_ids.len() as u64 != expected {
            return Err(StoreError::InvalidRecord(format!(
                "'{name}' v{version}: {} chunks for {length} bytes at {chunk_size}, expected {expected}",
                chunk_ids.len()
            )));
        }

        let mut log = self.log.lock();
        if self.state.read().get(name, version).is_some() {
            error!(name, version, "Version already committed; reservation was reused");
            return Err(StoreError::Conflict { name: name.to_string(), version });
        }

        let record = VersionRecord {
            name: name.to_string(),
            version,
            length,
            chunk_size,
            chunk_ids,
            created_at: now_millis(),
        };
        self.append(&mut log, &encode_commit(&record))?;
        self.state.write().apply(LogEntry::Commit(record.clone()));
        Ok(record)
    }

    pub fn get(&self, name: &str, version: u64) -> Result<VersionRecord> {
        self.state
            .read()
            .get(name, version)
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound { name: name.to_string(), version: Some(version) })
    }

    /// Highest committed version of `name`.
    pub fn get_latest(&self, name: &str) -> Result<VersionRecord> {
        self.state
            .read()
            .by_name
            .get(name)
            .and_then(|versions| versions.values().next_back())
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound { name: name.to_string(), version: None })
    }

    /// Summaries of every committed version, in commit order.
    pub fn list_all(&self) -> Vec<VersionSummary> {
        self.state.read().order.iter().map(|r| r.summary()).collect()
    }

    /// Summaries of every committed version of `name`, ascending.
    pub fn versions(&self, name: &str) -> Vec<VersionSummary> {
        self.state
            .read()
            .by_name
            .get(name)
            .map(|versions| versions.values().map(|r| r.summary()).collect())
            .unwrap_or_default()
    }

    /// Remove a committed version and return it. Its chunks become
    /// unreferenced; deleting them is up to the caller.
    pub fn remove(&self, name: &str, version: u64) -> Result<VersionRecord> {
        let mut log = self.log.lock();
        let record = self
            .state
            .read()
            .get(name, version)
            .map(|r| r.as_ref().clone())
            .ok_or_else(|| StoreError::NotFound { name: name.to_string(), version: Some(version) })?;
        self.append(&mut log, &encode_delete(name, version))?;
        self.state.write().apply(LogEntry::Delete { name: name.to_string(), version });
        Ok(record)
    }

    /// Number of committed versions across all names.
    pub fn len(&self) -> usize {
        self.state.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().order.is_empty()
    }

    /// Highest chunk id ever committed. New chunk ids must stay above it,
    /// or a lost chunk could be replaced by another object's data.
    pub fn highest_chunk_id(&self) -> Option<ChunkId> {
        self.state.read().chunk_high_water.map(ChunkId::from_raw)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the log to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.lock().sync_all()?;
        Ok(())
    }

    /// Called with the log mutex held, which serialises mutations.
    fn append(&self, log: &mut File, entry: &[u8]) -> Result<()> {
        if self.wedged.load(Ordering::Acquire) {
            return Err(StoreError::Storage(format!(
                "{:?} holds a partial entry; reopen the store",
                self.path
            )));
        }
        match append_entry(log, entry, self.sync_writes) {
            Ok(()) => Ok(()),
            Err(AppendError::RolledBack(e)) => {
                warn!(path = ?self.path, error = %e, "Catalog append failed, rolled back");
                Err(StoreError::Storage(format!("append {:?}: {e}", self.path)))
            }
            Err(AppendError::Wedged { write, rollback }) => {
                self.wedged.store(true, Ordering::Release);
                error!(
                    path = ?self.path,
                    error = %write,
                    rollback_error = %rollback,
                    "Catalog append failed and could not be rolled back"
                );
                Err(StoreError::Storage(format!("append {:?}: {write}", self.path)))
            }
        }
    }
}

// ─────────────────────────────── log file ────────────────────────────────────

/// The operations the catalog needs from its log file.
pub trait LogFile: Write {
    fn size(&self) -> io::Result<u64>;
    fn truncate(&mut self, len: u64) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
}

impl LogFile for File {
    fn size(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }
}

#[derive(Debug)]
pub enum AppendError {
    /// The entry was not appended; the log is as it was.
    RolledBack(io::Error),
    /// The log may end in a partial entry.
    Wedged { write: io::Error, rollback: io::Error },
}

/// Append one whole entry, or leave the log at its previous length.
pub fn append_entry<L: LogFile>(
    log: &mut L,
    entry: &[u8],
    sync: bool,
) -> std::result::Result<(), AppendError> {
    let before = log.size().map_err(AppendError::RolledBack)?;
    let written = log.write_all(entry).and_then(|()| if sync { log.sync() } else { Ok(()) });
    let Err(write) = written else {
        return Ok(());
    };
    match log.truncate(before).and_then(|()| log.sync()) {
        Ok(()) => Err(AppendError::RolledBack(write)),
        Err(rollback) => Err(AppendError::Wedged { write, rollback }),
    }
}

pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(StoreError::InvalidName("name must not be empty".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(StoreError::InvalidName(format!(
            "name is {} bytes, limit is {MAX_NAME_LEN}",
            name.len()
        )));
    }
    if name.contains('\0') {
        return Err(StoreError::InvalidName("name contains NUL".into()));
    }
    Ok(())
}

fn now_millis() -> DateTime<Utc> {
    // Millisecond precision so the value survives a log round-trip unchanged.
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

// ─────────────────────────────── encoding ────────────────────────────────────

fn encode_head(buf: &mut Vec<u8>, tag: &[u8; 4], name: &str, version: u64) {
    buf.extend_from_slice(tag);
    // Vec<u8> writes are infallible; names are capped at MAX_NAME_LEN.
    let _ = buf.write_u16::<LittleEndian>(name.len() as u16);
    buf.extend_from_slice(name.as_bytes());
    let _ = buf.write_u64::<LittleEndian>(version);
}

fn encode_reserve(name: &str, version: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 2 + name.len() + 8);
    encode_head(&mut buf, TAG_RESERVE, name, version);
    buf
}

fn encode_delete(name: &str, version: u64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 2 + name.len() + 8);
    encode_head(&mut buf, TAG_DELETE, name, version);
    buf
}

fn encode_commit(record: &VersionRecord) -> Vec<u8> {
    let mut buf = Vec::with_capacity(4 + 2 + record.name.len() + 32 + record.chunk_ids.len() * 8);
    encode_head(&mut buf, TAG_COMMIT, &record.name, record.version);
    let _ = buf.write_u64::<LittleEndian>(record.length);
    let _ = buf.write_i64::<LittleEndian>(record.created_at.timestamp_millis());
    let _ = buf.write_u32::<LittleEndian>(record.chunk_size);
    let _ = buf.write_u32::<LittleEndian>(record.chunk_ids.len() as u32);
    for id in &record.chunk_ids {
        let _ = buf.write_u64::<LittleEndian>(id.as_u64());
    }
    buf
}

/// Decode every complete entry. Returns the entries and the byte length
/// of the valid prefix; anything after it is a torn write.
fn scan_log(raw: &[u8]) -> Result<(Vec<LogEntry>, u64)> {
    if raw.len() < LOG_MAGIC.len() || &raw[..LOG_MAGIC.len()] != LOG_MAGIC {
        return Err(StoreError::Storage("catalog log has a bad header".into()));
    }

    let mut cur = Cursor::new(raw);
    cur.set_position(LOG_MAGIC.len() as u64);
    let mut entries = Vec::new();
    let mut good_len = cur.position();

    while (cur.position() as usize) < raw.len() {
        match read_entry(&mut cur) {
            Ok(entry) => {
                entries.push(entry);
                good_len = cur.position();
            }
            Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e),
        }
    }
    Ok((entries, good_len))
}

fn read_entry(cur: &mut Cursor<&[u8]>) -> Result<LogEntry> {
    let offset = cur.position();
    let mut tag = [0u8; 4];
    cur.read_exact(&mut tag)?;

    let name_len = cur.read_u16::<LittleEndian>()? as usize;
    let mut name = vec![0u8; name_len];
    cur.read_exact(&mut name)?;
    let name = String::from_utf8(name)
        .map_err(|_| StoreError::Storage(format!("catalog entry at {offset} has a non UTF-8 name")))?;
    let version = cur.read_u64::<LittleEndian>()?;

    match &tag {
        TAG_RESERVE => Ok(LogEntry::Reserve { name, version }),
        TAG_DELETE => Ok(LogEntry::Delete { name, version }),
        TAG_COMMIT => {
            let length = cur.read_u64::<LittleEndian>()?;
            let millis = cur.read_i64::<LittleEndian>()?;
            let chunk_size = cur.read_u32::<LittleEndian>()?;
            let count = cur.read_u32::<LittleEndian>()? as usize;
            let remaining = cur.get_ref().len() as u64 - cur.position();
            if (count as u64) * 8 > remaining {
                return Err(StoreError::Io(ErrorKind::UnexpectedEof.into()));
            }
            let mut chunk_ids = Vec::with_capacity(count);
            for _ in 0..count {
                chunk_ids.push(ChunkId::from_raw(cur.read_u64::<LittleEndian>()?));
            }
            let created_at = DateTime::from_timestamp_millis(millis).ok_or_else(|| {
                StoreError::Storage(format!("catalog entry at {offset} has a bad timestamp"))
            })?;
            Ok(LogEntry::Commit(VersionRecord {
                name,
                version,
                length,
                chunk_size,
                chunk_ids,
                created_at,
            }))
        }
        other => Err(StoreError::Storage(format!(
            "unknown catalog entry tag {other:?} at offset {offset}"
        ))),
    }
}
