//! Storage integration tests: chunk store + metadata catalog.
//!
//! Run with: `cargo test`

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use verstore::storage::catalog::{append_entry, AppendError, LogFile, MetadataCatalog};
use verstore::storage::chunk_store::{ChunkId, ChunkStore, CHUNK_HEADER_SIZE};
use verstore::StoreError;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn chunk_path(base: &Path, id: ChunkId) -> PathBuf {
    base.join("chunks")
        .join(format!("{:02x}", id.as_u64() & 0xff))
        .join(format!("{id}.chk"))
}

/// Log file that accepts `budget` bytes and then fails like a full disk.
struct FlakyLog {
    file: File,
    budget: usize,
    fail_sync: bool,
    fail_truncate: bool,
}

impl FlakyLog {
    fn open(path: &Path, budget: usize) -> Self {
        let file = OpenOptions::new().append(true).open(path).expect("open log");
        FlakyLog { file, budget, fail_sync: false, fail_truncate: false }
    }
}

impl Write for FlakyLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.budget == 0 {
            return Err(io::Error::other("no space left on device"));
        }
        let n = buf.len().min(self.budget);
        let written = self.file.write(&buf[..n])?;
        self.budget -= written;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl LogFile for FlakyLog {
    fn size(&self) -> io::Result<u64> {
        self.file.size()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        if self.fail_truncate {
            return Err(io::Error::other("truncate refused"));
        }
        self.file.truncate(len)
    }

    fn sync(&mut self) -> io::Result<()> {
        if self.fail_sync {
            return Err(io::Error::other("sync failed"));
        }
        self.file.sync()
    }
}

fn reserve_entry(name: &str, version: u64) -> Vec<u8> {
    let mut entry = b"VRSV".to_vec();
    entry.extend_from_slice(&(name.len() as u16).to_le_bytes());
    entry.extend_from_slice(name.as_bytes());
    entry.extend_from_slice(&version.to_le_bytes());
    entry
}

// ─────────────────────────────── chunk store ─────────────────────────────────

#[test]
fn test_put_and_get_chunk() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");

    let id = store.put(b"%PDF-1.7 fake body").expect("put");
    assert!(store.contains(id));
    assert_eq!(&store.get(id).expect("get")[..], b"%PDF-1.7 fake body");

    let empty = store.put(b"").expect("put empty");
    assert!(store.get(empty).expect("get empty").is_empty());
    assert_ne!(id, empty);
}

#[test]
fn test_chunk_too_large_errors() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 16, true).expect("open store");
    let err = store.put(&[0u8; 17]).expect_err("oversized chunk");
    assert!(matches!(err, StoreError::ChunkTooLarge { len: 17, limit: 16 }));
    assert!(store.ids().expect("ids").is_empty());
}

#[test]
fn test_unknown_chunk_is_not_found() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
    let err = store.get(ChunkId::from_raw(42)).expect_err("missing chunk");
    assert!(matches!(err, StoreError::ChunkNotFound(id) if id.as_u64() == 42));
}

#[test]
fn test_delete_twice_reports_not_found() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
    let id = store.put(b"gone soon").expect("put");

    store.delete(id).expect("first delete");
    assert!(!store.contains(id));
    assert!(matches!(store.delete(id), Err(StoreError::ChunkNotFound(_))));
    assert!(matches!(store.get(id), Err(StoreError::ChunkNotFound(_))));
}

#[test]
fn test_truncated_chunk_is_corrupt() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
    let id = store.put(&[0x5Au8; 100]).expect("put");

    let file = OpenOptions::new()
        .write(true)
        .open(chunk_path(dir.path(), id))
        .expect("open chunk file");
    file.set_len(CHUNK_HEADER_SIZE + 10).expect("truncate");

    let err = store.get(id).expect_err("short chunk");
    assert!(matches!(err, StoreError::CorruptChunk { .. }));
    assert!(err.is_corruption());
}

#[test]
fn test_chunk_ids_resume_after_reopen() {
    let dir = tmp_dir();
    let first: Vec<ChunkId> = {
        let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
        (0..300).map(|i| store.put(&[i as u8; 4]).expect("put")).collect()
        // Store dropped here — simulates a restart.
    };

    let store = ChunkStore::open(dir.path(), 1024, true).expect("reopen store");
    assert_eq!(store.ids().expect("ids"), first);

    let next = store.put(b"after restart").expect("put");
    assert!(first.iter().all(|id| *id < next), "ids must never be reused");
    for (i, id) in first.iter().enumerate() {
        assert_eq!(&store.get(*id).expect("get")[..], &[i as u8; 4]);
    }
}

#[test]
fn test_advance_past_skips_ids_without_files() {
    let dir = tmp_dir();
    let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
    assert_eq!(store.put(b"a").expect("put"), ChunkId::from_raw(0));

    store.advance_past(ChunkId::from_raw(41));
    assert_eq!(store.put(b"b").expect("put"), ChunkId::from_raw(42));

    // Lower floors never move the counter back.
    store.advance_past(ChunkId::from_raw(3));
    assert_eq!(store.put(b"c").expect("put"), ChunkId::from_raw(43));
}

#[test]
fn test_interrupted_write_is_cleaned_on_open() {
    let dir = tmp_dir();
    let id = {
        let store = ChunkStore::open(dir.path(), 1024, true).expect("open store");
        store.put(b"kept").expect("put")
    };

    // Leave a half-written temp file behind, as a crash mid-put would.
    let tmp = chunk_path(dir.path(), ChunkId::from_raw(id.as_u64() + 1)).with_extension("tmp");
    std::fs::create_dir_all(tmp.parent().expect("parent")).expect("mkdir");
    std::fs::write(&tmp, b"VCHK partial").expect("write tmp");

    let store = ChunkStore::open(dir.path(), 1024, true).expect("reopen store");
    assert!(!tmp.exists());
    assert_eq!(store.ids().expect("ids"), vec![id]);
}

#[test]
fn test_concurrent_puts_get_distinct_ids() {
    let dir = tmp_dir();
    let store = Arc::new(ChunkStore::open(dir.path(), 1024, false).expect("open store"));

    let mut ids: Vec<ChunkId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                s.spawn(move || {
                    (0..25)
                        .map(|i| store.put(format!("t{t}-c{i}").as_bytes()).expect("put"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().expect("join")).collect()
    });

    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 200);
}

// ─────────────────────────────── catalog ─────────────────────────────────────

#[test]
fn test_next_version_is_sequential_per_name() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");

    assert_eq!(catalog.next_version("a.pdf").expect("reserve"), 0);
    assert_eq!(catalog.next_version("a.pdf").expect("reserve"), 1);
    assert_eq!(catalog.next_version("b.pdf").expect("reserve"), 0);
    assert_eq!(catalog.next_version("a.pdf").expect("reserve"), 2);
}

#[test]
fn test_commit_get_and_latest() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");

    for expected in 0..3u64 {
        let v = catalog.next_version("doc.pdf").expect("reserve");
        assert_eq!(v, expected);
        let ids = vec![ChunkId::from_raw(v * 10), ChunkId::from_raw(v * 10 + 1)];
        let rec = catalog.commit("doc.pdf", v, ids.clone(), 12 + v, 8).expect("commit");
        assert_eq!(rec.chunk_ids, ids);
        assert_eq!(rec.length, 12 + v);
    }

    let rec = catalog.get("doc.pdf", 1).expect("get");
    assert_eq!(rec.version, 1);
    assert_eq!(rec.length, 13);

    let latest = catalog.get_latest("doc.pdf").expect("latest");
    assert_eq!(latest.version, 2);

    assert!(catalog.get("doc.pdf", 3).expect_err("absent").is_not_found());
    assert!(catalog.get_latest("other.pdf").expect_err("absent").is_not_found());
}

#[test]
fn test_commit_conflict() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");

    let v = catalog.next_version("dup.pdf").expect("reserve");
    catalog.commit("dup.pdf", v, vec![], 0, 8).expect("first commit");
    let err = catalog.commit("dup.pdf", v, vec![], 0, 8).expect_err("second commit");
    assert!(matches!(err, StoreError::Conflict { version: 0, .. }));
    assert_eq!(catalog.len(), 1);
}

#[test]
fn test_list_all_in_commit_order() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");

    let a0 = catalog.next_version("a").expect("reserve");
    let b0 = catalog.next_version("b").expect("reserve");
    let a1 = catalog.next_version("a").expect("reserve");
    // Commit out of reservation order.
    catalog.commit("a", a1, vec![], 0, 8).expect("commit");
    catalog.commit("b", b0, vec![ChunkId::from_raw(1)], 5, 8).expect("commit");
    catalog.commit("a", a0, vec![ChunkId::from_raw(2)], 3, 8).expect("commit");

    let listed: Vec<(String, u64, u64)> = catalog
        .list_all()
        .into_iter()
        .map(|s| (s.name, s.version, s.length))
        .collect();
    assert_eq!(
        listed,
        vec![("a".into(), 1, 0), ("b".into(), 0, 5), ("a".into(), 0, 3)]
    );

    let versions: Vec<u64> = catalog.versions("a").iter().map(|s| s.version).collect();
    assert_eq!(versions, vec![0, 1]);
}

#[test]
fn test_catalog_restart_recovery() {
    let dir = tmp_dir();
    let created_at;
    {
        let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
        let v0 = catalog.next_version("a").expect("reserve");
        let rec = catalog
            .commit("a", v0, vec![ChunkId::from_raw(7), ChunkId::from_raw(9)], 20, 16)
            .expect("commit");
        created_at = rec.created_at;
        // Reserved, never committed (crashed ingest).
        assert_eq!(catalog.next_version("a").expect("reserve"), 1);
        let b = catalog.next_version("b").expect("reserve");
        catalog.commit("b", b, vec![], 0, 16).expect("commit");
    }

    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen catalog");
    assert_eq!(catalog.len(), 2);

    let rec = catalog.get("a", 0).expect("recovered record");
    assert_eq!(rec.chunk_ids, vec![ChunkId::from_raw(7), ChunkId::from_raw(9)]);
    assert_eq!(rec.length, 20);
    assert_eq!(rec.chunk_size, 16);
    assert_eq!(rec.created_at, created_at);

    // Version 1 was handed out before the restart and must not be reused.
    assert_eq!(catalog.next_version("a").expect("reserve"), 2);
    assert_eq!(catalog.next_version("b").expect("reserve"), 1);
}

#[test]
fn test_torn_log_tail_is_truncated() {
    let dir = tmp_dir();
    {
        let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
        let v = catalog.next_version("a").expect("reserve");
        catalog.commit("a", v, vec![ChunkId::from_raw(1)], 4, 8).expect("commit");
    }

    let log_path = dir.path().join("catalog.log");
    let good_len = std::fs::metadata(&log_path).expect("stat").len();
    {
        // Half of a commit entry: tag, name length, part of the name.
        let mut log = OpenOptions::new().append(true).open(&log_path).expect("open log");
        log.write_all(b"VCMT\x05\x00ab").expect("append torn entry");
    }

    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen catalog");
    assert_eq!(catalog.len(), 1);
    assert_eq!(std::fs::metadata(&log_path).expect("stat").len(), good_len);

    // The repaired log accepts new entries.
    let v = catalog.next_version("a").expect("reserve");
    catalog.commit("a", v, vec![], 0, 8).expect("commit");
    drop(catalog);
    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen again");
    assert_eq!(catalog.versions("a").len(), 2);
}

#[test]
fn test_unknown_log_entry_is_an_error() {
    let dir = tmp_dir();
    {
        MetadataCatalog::open(dir.path(), true).expect("open catalog");
    }
    let mut log = OpenOptions::new()
        .append(true)
        .open(dir.path().join("catalog.log"))
        .expect("open log");
    log.write_all(b"JUNK\x01\x00x\x00\x00\x00\x00\x00\x00\x00\x00").expect("append");
    drop(log);

    let err = MetadataCatalog::open(dir.path(), true).expect_err("garbage entry");
    assert!(matches!(err, StoreError::Storage(_)));
}

#[test]
fn test_commit_rejects_inconsistent_records() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
    let v = catalog.next_version("x").expect("reserve");

    for (ids, length, chunk_size) in [
        (vec![], 5, 0),
        (vec![], 0, 0),
        (vec![], 5, 8),
        (vec![ChunkId::from_raw(1)], 9, 8),
        (vec![ChunkId::from_raw(1), ChunkId::from_raw(2)], 8, 8),
    ] {
        let err = catalog.commit("x", v, ids, length, chunk_size).expect_err("inconsistent");
        assert!(matches!(err, StoreError::InvalidRecord(_)), "{err}");
    }
    assert!(catalog.is_empty());

    catalog.commit("x", v, vec![ChunkId::from_raw(1)], 8, 8).expect("exact fit");
}

#[test]
fn test_highest_chunk_id_survives_removal_and_restart() {
    let dir = tmp_dir();
    {
        let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
        assert_eq!(catalog.highest_chunk_id(), None);
        let v = catalog.next_version("a").expect("reserve");
        catalog
            .commit("a", v, vec![ChunkId::from_raw(9), ChunkId::from_raw(4)], 10, 8)
            .expect("commit");
        let v = catalog.next_version("b").expect("reserve");
        catalog.commit("b", v, vec![ChunkId::from_raw(2)], 1, 8).expect("commit");
        catalog.remove("a", 0).expect("remove");
        assert_eq!(catalog.highest_chunk_id(), Some(ChunkId::from_raw(9)));
    }

    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen catalog");
    assert_eq!(catalog.highest_chunk_id(), Some(ChunkId::from_raw(9)));
}

#[test]
fn test_failed_append_is_rolled_back() {
    let dir = tmp_dir();
    {
        let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
        catalog.next_version("a").expect("reserve");
    }
    let log_path = dir.path().join("catalog.log");
    let before = std::fs::metadata(&log_path).expect("stat").len();

    // Disk fills up halfway through the entry.
    let mut log = FlakyLog::open(&log_path, 5);
    let err = append_entry(&mut log, &reserve_entry("a", 1), true).expect_err("disk full");
    assert!(matches!(err, AppendError::RolledBack(_)));
    assert_eq!(std::fs::metadata(&log_path).expect("stat").len(), before);

    // The write lands but the fsync fails: the entry must not survive.
    let mut log = FlakyLog::open(&log_path, usize::MAX);
    log.fail_sync = true;
    let err = append_entry(&mut log, &reserve_entry("a", 1), true).expect_err("sync failed");
    assert!(matches!(err, AppendError::RolledBack(_)));
    assert_eq!(std::fs::metadata(&log_path).expect("stat").len(), before);

    // Later appends follow a clean entry boundary.
    let mut log = FlakyLog::open(&log_path, usize::MAX);
    append_entry(&mut log, &reserve_entry("b", 0), true).expect("append");
    drop(log);

    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen catalog");
    assert_eq!(catalog.next_version("a").expect("reserve"), 1);
    assert_eq!(catalog.next_version("b").expect("reserve"), 1);
}

#[test]
fn test_failed_rollback_is_reported() {
    let dir = tmp_dir();
    {
        MetadataCatalog::open(dir.path(), true).expect("open catalog");
    }
    let mut log = FlakyLog::open(&dir.path().join("catalog.log"), 3);
    log.fail_truncate = true;
    let err = append_entry(&mut log, &reserve_entry("a", 0), true).expect_err("disk full");
    assert!(matches!(err, AppendError::Wedged { .. }));
}

#[test]
fn test_remove_version() {
    let dir = tmp_dir();
    {
        let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
        for _ in 0..2 {
            let v = catalog.next_version("a").expect("reserve");
            catalog.commit("a", v, vec![], 0, 8).expect("commit");
        }
        let removed = catalog.remove("a", 1).expect("remove");
        assert_eq!(removed.version, 1);
        assert!(catalog.get("a", 1).expect_err("removed").is_not_found());
        assert!(catalog.remove("a", 1).expect_err("removed twice").is_not_found());
        assert_eq!(catalog.get_latest("a").expect("latest").version, 0);
    }

    let catalog = MetadataCatalog::open(dir.path(), true).expect("reopen catalog");
    assert_eq!(catalog.len(), 1);
    // Deleting a version never frees its number.
    assert_eq!(catalog.next_version("a").expect("reserve"), 2);
}

#[test]
fn test_invalid_names_are_rejected() {
    let dir = tmp_dir();
    let catalog = MetadataCatalog::open(dir.path(), true).expect("open catalog");
    assert!(matches!(catalog.next_version(""), Err(StoreError::InvalidName(_))));
    assert!(matches!(catalog.next_version("a\0b"), Err(StoreError::InvalidName(_))));
    let long = "x".repeat(2000);
    assert!(matches!(catalog.next_version(&long), Err(StoreError::InvalidName(_))));
}

#[test]
fn test_concurrent_reservations_are_distinct() {
    let dir = tmp_dir();
    let catalog = Arc::new(MetadataCatalog::open(dir.path(), false).expect("open catalog"));

    let mut versions: Vec<u64> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let catalog = catalog.clone();
                s.spawn(move || {
                    (0..10)
                        .map(|_| catalog.next_version("shared.pdf").expect("reserve"))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().expect("join")).collect()
    });

    versions.sort();
    assert_eq!(versions, (0..80).collect::<Vec<u64>>());
}
