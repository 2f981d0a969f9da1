//! Durable metadata index plus the in-memory dirty-bitmap map.
//!
//! The sqlite side holds one row per logical path (WAL mode, upserts keyed on
//! the path). The bitmap side accumulates dirty bits in memory, keyed
//! `hash_hex -> part_idx -> Bitmap`, and persists them as packed byte arrays
//! next to the data parts.

use crate::bitmap::Bitmap;
use crate::layout;
use log::debug;
use rofs_models::{EngineError, MetaRow};
use rusqlite::{Connection, OptionalExtension, params};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

fn sql_err(e: rusqlite::Error) -> EngineError {
    EngineError::Metadata(e.to_string())
}

pub struct MetaStore {
    conn: Mutex<Connection>,
    root: PathBuf,
    bitmaps: RwLock<HashMap<String, BTreeMap<u64, Bitmap>>>,
}

impl MetaStore {
    /// Opens (or creates) the database under `root` and ensures the table
    /// exists. Any failure here is fatal to the mount.
    pub fn open(root: &Path) -> Result<Self, EngineError> {
        fs::create_dir_all(root)?;
        let conn = Connection::open(layout::meta_db(root)).map_err(sql_err)?;
        // WAL mode for concurrent readers + single writer without blocking.
        conn.pragma_update(None, "journal_mode", "wal").map_err(sql_err)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS objects (
                path          TEXT    PRIMARY KEY,
                local_path    TEXT    NOT NULL,
                size          INTEGER NOT NULL,
                timestamp     INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                dirty         INTEGER NOT NULL
            );",
        )
        .map_err(sql_err)?;
        Ok(MetaStore {
            conn: Mutex::new(conn),
            root: root.to_path_buf(),
            bitmaps: RwLock::new(HashMap::new()),
        })
    }

    pub fn get(&self, path: &str) -> Result<Option<MetaRow>, EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT path, local_path, size, timestamp, last_accessed, dirty
             FROM objects WHERE path = ?1",
            params![path],
            |row| {
                Ok(MetaRow {
                    path: row.get(0)?,
                    local_path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    timestamp: row.get::<_, i64>(3)? as u64,
                    last_accessed: row.get::<_, i64>(4)? as u64,
                    dirty: row.get::<_, i64>(5)? != 0,
                })
            },
        )
        .optional()
        .map_err(sql_err)
    }

    /// Upsert keyed on the path.
    pub fn put(&self, row: &MetaRow) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO objects (path, local_path, size, timestamp, last_accessed, dirty)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(path) DO UPDATE SET
                local_path = excluded.local_path,
                size = excluded.size,
                timestamp = excluded.timestamp,
                last_accessed = excluded.last_accessed,
                dirty = excluded.dirty",
            params![
                row.path,
                row.local_path,
                row.size as i64,
                row.timestamp as i64,
                row.last_accessed as i64,
                row.dirty as i64
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// No-op if the key is absent.
    pub fn update_access_time(&self, path: &str, t: u64) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE objects SET last_accessed = ?2 WHERE path = ?1",
            params![path, t as i64],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// No-op if the key is absent.
    pub fn mark_dirty(&self, path: &str, dirty: bool) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE objects SET dirty = ?2 WHERE path = ?1",
            params![path, dirty as i64],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    /// Removes the metadata row only; parts and bitmap files are the caller's
    /// responsibility.
    pub fn remove(&self, path: &str) -> Result<(), EngineError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM objects WHERE path = ?1", params![path])
            .map_err(sql_err)?;
        Ok(())
    }

    pub fn all_entries(&self) -> Result<Vec<MetaRow>, EngineError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn
            .prepare(
                "SELECT path, local_path, size, timestamp, last_accessed, dirty
                 FROM objects ORDER BY path",
            )
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MetaRow {
                    path: row.get(0)?,
                    local_path: row.get(1)?,
                    size: row.get::<_, i64>(2)? as u64,
                    timestamp: row.get::<_, i64>(3)? as u64,
                    last_accessed: row.get::<_, i64>(4)? as u64,
                    dirty: row.get::<_, i64>(5)? != 0,
                })
            })
            .map_err(sql_err)?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r.map_err(sql_err)?);
        }
        Ok(out)
    }

    // ---- dirty bitmaps ----------------------------------------------------

    /// Sets one dirty bit, auto-growing the part's vector. Narrow write-lock
    /// window; never held across I/O.
    pub fn mark_dirty_block(&self, hash_hex: &str, part_idx: u64, block_idx: u64) {
        let mut map = self.bitmaps.write().unwrap();
        map.entry(hash_hex.to_string())
            .or_default()
            .entry(part_idx)
            .or_default()
            .set(block_idx);
    }

    /// True iff the given block's bit is set (absent bitmap reads as clear).
    pub fn dirty_block(&self, hash_hex: &str, part_idx: u64, block_idx: u64) -> bool {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex)
            .and_then(|parts| parts.get(&part_idx))
            .map(|bm| bm.get(block_idx))
            .unwrap_or(false)
    }

    /// Copy of every in-memory bitmap of the object, for the shadow-snapshot
    /// flush protocol.
    pub fn bitmap_snapshot(&self, hash_hex: &str) -> BTreeMap<u64, Bitmap> {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex).cloned().unwrap_or_default()
    }

    /// True iff any bit of the object is set.
    pub fn has_dirty_bits(&self, hash_hex: &str) -> bool {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex)
            .map(|parts| parts.values().any(|bm| !bm.is_empty()))
            .unwrap_or(false)
    }

    /// Clears `original AND NOT snapshot` for every part in the snapshot,
    /// then drops empty vectors. Returns true iff any bit remains set
    /// (concurrent writes during the flush).
    pub fn clear_flushed(&self, hash_hex: &str, snapshot: &BTreeMap<u64, Bitmap>) -> bool {
        let mut map = self.bitmaps.write().unwrap();
        let Some(parts) = map.get_mut(hash_hex) else { return false };
        for (part_idx, snap) in snapshot {
            if let Some(bm) = parts.get_mut(part_idx) {
                bm.clear_bits_in(snap);
            }
        }
        parts.retain(|_, bm| !bm.is_empty());
        let remaining = !parts.is_empty();
        if !remaining {
            map.remove(hash_hex);
        }
        remaining
    }

    /// Persists every in-memory bitmap of the object (write-truncate of the
    /// packed array; empty bitmaps written as empty files). The in-memory
    /// state is untouched either way; on error the caller must not clear the
    /// row's dirty flag.
    pub fn flush_bitmaps(&self, hash_hex: &str) -> Result<(), EngineError> {
        // Read lock only: persisting must not block foreground writers for
        // longer than the snapshot copy.
        let snapshot = self.bitmap_snapshot(hash_hex);
        let dir = layout::object_bitmap_dir(&self.root, hash_hex);
        fs::create_dir_all(&dir)?;
        if snapshot.is_empty() {
            // nothing in memory: every existing file now means "no dirty bits"
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                if layout::bitmap_part_idx(&entry.file_name().to_string_lossy()).is_some() {
                    fs::remove_file(entry.path())?;
                }
            }
            return Ok(());
        }
        for (part_idx, bm) in &snapshot {
            let path = layout::bitmap_path(&self.root, hash_hex, *part_idx);
            fs::write(&path, bm.as_bytes())?;
        }
        debug!("persisted {} bitmap(s) for {}", snapshot.len(), hash_hex);
        Ok(())
    }

    /// Loads one persisted bitmap into memory. A missing file means no dirty
    /// bits and is not an error. Reads the whole file: each of its bytes
    /// already packs 8 bits.
    pub fn load_bitmap(&self, hash_hex: &str, part_idx: u64) -> Result<(), EngineError> {
        let path = layout::bitmap_path(&self.root, hash_hex, part_idx);
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let bm = Bitmap::from_bytes(bytes);
        if bm.is_empty() {
            return Ok(());
        }
        let mut map = self.bitmaps.write().unwrap();
        map.entry(hash_hex.to_string()).or_default().insert(part_idx, bm);
        Ok(())
    }

    /// True iff the part's bitmap is already in memory.
    pub fn bitmap_loaded(&self, hash_hex: &str, part_idx: u64) -> bool {
        let map = self.bitmaps.read().unwrap();
        map.get(hash_hex).map(|p| p.contains_key(&part_idx)).unwrap_or(false)
    }

    /// Recovery path: pulls every persisted bitmap of the object into memory
    /// (used by writeback after a restart, when the row says dirty but the
    /// process has no bits yet).
    pub fn load_all_bitmaps(&self, hash_hex: &str) -> Result<(), EngineError> {
        let dir = layout::object_bitmap_dir(&self.root, hash_hex);
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            if let Some(part_idx) = layout::bitmap_part_idx(&entry.file_name().to_string_lossy()) {
                if !self.bitmap_loaded(hash_hex, part_idx) {
                    self.load_bitmap(hash_hex, part_idx)?;
                }
            }
        }
        Ok(())
    }

    /// Truncation support: drops every bit at global block index
    /// `keep_blocks` and above across the object's part bitmaps.
    pub fn truncate_bits(&self, hash_hex: &str, keep_blocks: u64, blocks_per_part: u64) {
        let mut map = self.bitmaps.write().unwrap();
        let Some(parts) = map.get_mut(hash_hex) else { return };
        parts.retain(|part_idx, bm| {
            let base = part_idx * blocks_per_part;
            if base >= keep_blocks {
                return false;
            }
            bm.clear_from(keep_blocks - base);
            !bm.is_empty()
        });
        if parts.is_empty() {
            map.remove(hash_hex);
        }
    }

    /// Drops the object's in-memory bitmaps (unlink, eviction).
    pub fn drop_bitmaps(&self, hash_hex: &str) {
        self.bitmaps.write().unwrap().remove(hash_hex);
    }

    /// Rekeys the object's in-memory bitmaps (rename).
    pub fn rekey_bitmaps(&self, old_hash: &str, new_hash: &str) {
        let mut map = self.bitmaps.write().unwrap();
        if let Some(parts) = map.remove(old_hash) {
            map.insert(new_hash.to_string(), parts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_store() -> (MetaStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();
        (store, dir)
    }

    fn row(path: &str) -> MetaRow {
        MetaRow {
            path: path.to_string(),
            local_path: format!("/cache{}", path),
            size: 10,
            timestamp: 100,
            last_accessed: 100,
            dirty: false,
        }
    }

    #[test]
    fn put_get_upsert_remove() {
        let (store, _dir) = open_store();
        assert!(store.get("/a").unwrap().is_none());

        let mut r = row("/a");
        store.put(&r).unwrap();
        assert_eq!(store.get("/a").unwrap().unwrap(), r);

        r.size = 99;
        r.dirty = true;
        store.put(&r).unwrap();
        assert_eq!(store.get("/a").unwrap().unwrap().size, 99);
        assert!(store.get("/a").unwrap().unwrap().dirty);

        store.remove("/a").unwrap();
        assert!(store.get("/a").unwrap().is_none());
    }

    #[test]
    fn updates_on_absent_keys_succeed() {
        let (store, _dir) = open_store();
        store.update_access_time("/missing", 5).unwrap();
        store.mark_dirty("/missing", true).unwrap();
        assert!(store.get("/missing").unwrap().is_none());
    }

    #[test]
    fn all_entries_lists_everything() {
        let (store, _dir) = open_store();
        store.put(&row("/a")).unwrap();
        store.put(&row("/b")).unwrap();
        let all = store.all_entries().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].path, "/a");
    }

    #[test]
    fn survives_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = MetaStore::open(dir.path()).unwrap();
            let mut r = row("/persist");
            r.dirty = true;
            store.put(&r).unwrap();
        }
        let store = MetaStore::open(dir.path()).unwrap();
        let r = store.get("/persist").unwrap().unwrap();
        assert!(r.dirty);
        assert_eq!(r.size, 10);
    }

    #[test]
    fn bitmap_persistence_round_trip() {
        let (store, _dir) = open_store();
        let hh = "ab".repeat(32);
        store.mark_dirty_block(&hh, 0, 3);
        store.mark_dirty_block(&hh, 2, 70);
        store.flush_bitmaps(&hh).unwrap();

        // forget and reload
        store.drop_bitmaps(&hh);
        assert!(!store.has_dirty_bits(&hh));
        store.load_all_bitmaps(&hh).unwrap();
        assert!(store.dirty_block(&hh, 0, 3));
        assert!(store.dirty_block(&hh, 2, 70));
        assert!(!store.dirty_block(&hh, 0, 4));

        let snap = store.bitmap_snapshot(&hh);
        assert_eq!(snap.len(), 2);
    }

    #[test]
    fn missing_bitmap_file_is_no_dirty_bits() {
        let (store, _dir) = open_store();
        let hh = "cd".repeat(32);
        store.load_bitmap(&hh, 7).unwrap();
        assert!(!store.has_dirty_bits(&hh));
    }

    #[test]
    fn clear_flushed_honors_shadow_snapshot() {
        let (store, _dir) = open_store();
        let hh = "ef".repeat(32);
        store.mark_dirty_block(&hh, 0, 1);
        let snapshot = store.bitmap_snapshot(&hh);
        // concurrent write lands after the snapshot
        store.mark_dirty_block(&hh, 0, 2);
        let remaining = store.clear_flushed(&hh, &snapshot);
        assert!(remaining);
        assert!(!store.dirty_block(&hh, 0, 1));
        assert!(store.dirty_block(&hh, 0, 2));

        let snapshot = store.bitmap_snapshot(&hh);
        assert!(!store.clear_flushed(&hh, &snapshot));
        assert!(!store.has_dirty_bits(&hh));
    }

    #[test]
    fn flush_with_no_bits_removes_stale_files() {
        let (store, _dir) = open_store();
        let hh = "aa".repeat(32);
        store.mark_dirty_block(&hh, 1, 5);
        store.flush_bitmaps(&hh).unwrap();
        let snapshot = store.bitmap_snapshot(&hh);
        store.clear_flushed(&hh, &snapshot);
        store.flush_bitmaps(&hh).unwrap();
        store.load_all_bitmaps(&hh).unwrap();
        assert!(!store.has_dirty_bits(&hh));
    }
}
