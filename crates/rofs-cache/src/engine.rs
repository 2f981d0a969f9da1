//! The block cache decision layer: resolves objects, materializes missing
//! blocks from the remote, absorbs writes as dirty blocks, and carries the
//! namespace operations (create, rename, unlink, readdir).
//!
//! One engine instance owns the metadata store and the bitmap map for the
//! whole process; it is shared behind an `Arc` between the FUSE dispatcher
//! and the background workers.

use crate::layout;
use crate::store::MetaStore;
use log::{debug, warn};
use rofs_models::{BackendError, CacheConfig, EngineError, MetaRow, RemoteBackend, RemoteInfo, RemoteIntent, WriteRun};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
}

fn parent_of(path: &str) -> String {
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string())
}

fn join_child(dir: &str, name: &str) -> String {
    if dir == "/" { format!("/{}", name) } else { format!("{}/{}", dir, name) }
}

pub struct CacheEngine<B: RemoteBackend> {
    cfg: CacheConfig,
    store: MetaStore,
    backend: B,
    // advisory per-object lock serializing writebacks of the same object
    flush_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    // namespace changes waiting to reach the remote store
    intents: Mutex<VecDeque<RemoteIntent>>,
}

impl<B: RemoteBackend> CacheEngine<B> {
    pub fn new(cfg: CacheConfig, backend: B) -> Result<Self, EngineError> {
        cfg.validate()?;
        let store = MetaStore::open(&cfg.cache_root)?;
        fs::create_dir_all(cfg.cache_root.join("data"))?;
        fs::create_dir_all(cfg.cache_root.join("bitmap"))?;
        let engine = CacheEngine {
            cfg,
            store,
            backend,
            flush_locks: Mutex::new(HashMap::new()),
            intents: Mutex::new(VecDeque::new()),
        };
        // the root directory always exists
        if engine.store.get("/")?.is_none() {
            engine.store.put(&engine.dir_row("/"))?;
        }
        Ok(engine)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.cfg
    }

    pub fn store(&self) -> &MetaStore {
        &self.store
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn dir_row(&self, path: &str) -> MetaRow {
        let t = now();
        MetaRow {
            path: path.to_string(),
            local_path: String::new(),
            size: 0,
            timestamp: t,
            last_accessed: t,
            dirty: false,
        }
    }

    fn file_row(&self, path: &str, size: u64, timestamp: u64) -> MetaRow {
        let hh = layout::hash_hex(path);
        MetaRow {
            path: path.to_string(),
            local_path: layout::data_path(&self.cfg.cache_root, &hh, 0).to_string_lossy().to_string(),
            size,
            timestamp,
            last_accessed: now(),
            dirty: false,
        }
    }

    fn row_from_info(&self, path: &str, info: &RemoteInfo) -> MetaRow {
        if info.is_dir {
            let mut row = self.dir_row(path);
            row.timestamp = info.timestamp;
            row
        } else {
            self.file_row(path, info.size, info.timestamp)
        }
    }

    fn queue_intent(&self, intent: RemoteIntent) {
        self.intents.lock().unwrap().push_back(intent);
    }

    /// Snapshot of the queued namespace intents (tests, diagnostics).
    pub fn pending_intents(&self) -> Vec<RemoteIntent> {
        self.intents.lock().unwrap().iter().cloned().collect()
    }

    /// Pushes queued namespace operations to the remote, oldest first. A
    /// transient failure requeues the intent and aborts so the next writeback
    /// tick retries; anything else is logged and dropped (e.g. creating a
    /// path the remote already has).
    pub fn drain_intents(&self) -> Result<(), EngineError> {
        loop {
            let Some(intent) = self.intents.lock().unwrap().pop_front() else {
                return Ok(());
            };
            let res = match &intent {
                RemoteIntent::Create { path, directory } => self.backend.create(path, *directory),
                RemoteIntent::Rename { old_path, new_path } => self.backend.rename(old_path, new_path),
                RemoteIntent::Delete { path } => match self.backend.delete(path) {
                    // deleting something the remote never saw is the intended end state
                    Err(BackendError::NotFound(_)) => Ok(()),
                    r => r,
                },
            };
            match res {
                Ok(()) => {}
                Err(e @ BackendError::Transient(_)) => {
                    self.intents.lock().unwrap().push_front(intent);
                    return Err(e.into());
                }
                Err(e) => warn!("dropping remote intent {:?}: {}", intent, e),
            }
        }
    }

    fn flush_lock(&self, path: &str) -> Arc<Mutex<()>> {
        let mut locks = self.flush_locks.lock().unwrap();
        locks.entry(path.to_string()).or_default().clone()
    }

    /// Directory entries every present path must have (§ invariant: ancestors
    /// exist). Local-only; the remote presumably has them already.
    fn ensure_ancestors(&self, path: &str) -> Result<(), EngineError> {
        let mut missing = Vec::new();
        let mut cur = parent_of(path);
        loop {
            if self.store.get(&cur)?.is_some() {
                break;
            }
            missing.push(cur.clone());
            if cur == "/" {
                break;
            }
            cur = parent_of(&cur);
        }
        for dir in missing.into_iter().rev() {
            self.store.put(&self.dir_row(&dir))?;
        }
        Ok(())
    }

    // ---- attribute / namespace operations ---------------------------------

    /// Metadata lookup; on a local miss asks the remote and materializes a
    /// row from the answer.
    pub fn getattr(&self, path: &str) -> Result<MetaRow, EngineError> {
        if let Some(row) = self.store.get(path)? {
            return Ok(row);
        }
        match self.backend.info(path) {
            Ok(info) => {
                self.ensure_ancestors(path)?;
                let row = self.row_from_info(path, &info);
                self.store.put(&row)?;
                Ok(row)
            }
            Err(BackendError::NotFound(p)) => Err(EngineError::NotFound(p)),
            Err(e) => Err(e.into()),
        }
    }

    /// Union of the local prefix scan and one remote listing. Remote failures
    /// degrade to the local view.
    pub fn readdir(&self, path: &str) -> Result<Vec<MetaRow>, EngineError> {
        let row = self.getattr(path)?;
        if !row.is_dir() {
            return Err(EngineError::NotADirectory(path.to_string()));
        }
        let prefix = if path == "/" { "/".to_string() } else { format!("{}/", path) };
        let mut children: BTreeMap<String, MetaRow> = BTreeMap::new();
        for entry in self.store.all_entries()? {
            if entry.path != path
                && entry.path.starts_with(&prefix)
                && !entry.path[prefix.len()..].contains('/')
            {
                children.insert(entry.path.clone(), entry);
            }
        }
        match self.backend.list(path) {
            Ok(names) => {
                for name in names {
                    let child = join_child(path, &name);
                    if !children.contains_key(&child) {
                        match self.getattr(&child) {
                            Ok(row) => {
                                children.insert(child, row);
                            }
                            Err(e) => debug!("skipping remote listing entry {}: {}", child, e),
                        }
                    }
                }
            }
            Err(e) => debug!("remote listing of {} unavailable, local view only: {}", path, e),
        }
        self.store.update_access_time(path, now())?;
        Ok(children.into_values().collect())
    }

    pub fn create_file(&self, path: &str) -> Result<MetaRow, EngineError> {
        if self.store.get(path)?.is_some() {
            return Err(EngineError::AlreadyExists(path.to_string()));
        }
        self.ensure_ancestors(path)?;
        let row = self.file_row(path, 0, now());
        self.store.put(&row)?;
        self.queue_intent(RemoteIntent::Create { path: path.to_string(), directory: false });
        Ok(row)
    }

    pub fn mkdir(&self, path: &str) -> Result<MetaRow, EngineError> {
        if self.store.get(path)?.is_some() {
            return Err(EngineError::AlreadyExists(path.to_string()));
        }
        self.ensure_ancestors(path)?;
        let row = self.dir_row(path);
        self.store.put(&row)?;
        self.queue_intent(RemoteIntent::Create { path: path.to_string(), directory: true });
        Ok(row)
    }

    /// Removes the object locally even when it carries unflushed dirty data:
    /// deletion is what the caller asked for. The remote DELETE is queued.
    pub fn unlink(&self, path: &str) -> Result<(), EngineError> {
        let row = self.store.get(path)?.ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        if row.is_dir() {
            return Err(EngineError::IsADirectory(path.to_string()));
        }
        let hh = layout::hash_hex(path);
        self.remove_object_files(&hh)?;
        self.store.drop_bitmaps(&hh);
        self.store.remove(path)?;
        self.queue_intent(RemoteIntent::Delete { path: path.to_string() });
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<(), EngineError> {
        let row = self.store.get(path)?.ok_or_else(|| EngineError::NotFound(path.to_string()))?;
        if !row.is_dir() {
            return Err(EngineError::NotADirectory(path.to_string()));
        }
        let prefix = format!("{}/", path);
        if self.store.all_entries()?.iter().any(|e| e.path.starts_with(&prefix)) {
            return Err(EngineError::NotEmpty(path.to_string()));
        }
        self.store.remove(path)?;
        self.queue_intent(RemoteIntent::Delete { path: path.to_string() });
        Ok(())
    }

    /// Key rewrite plus relocation of every materialized part and bitmap to
    /// the new hash layout. Dirty state carries over. Renaming a directory
    /// rekeys everything under it.
    pub fn rename(&self, old_path: &str, new_path: &str) -> Result<(), EngineError> {
        let row = self.store.get(old_path)?.ok_or_else(|| EngineError::NotFound(old_path.to_string()))?;

        // single-writer wins: an existing destination file is replaced
        if let Some(dest) = self.store.get(new_path)? {
            if dest.is_dir() {
                return Err(EngineError::IsADirectory(new_path.to_string()));
            }
            let dest_hh = layout::hash_hex(new_path);
            self.remove_object_files(&dest_hh)?;
            self.store.drop_bitmaps(&dest_hh);
            self.store.remove(new_path)?;
        }

        let old_prefix = format!("{}/", old_path);
        let mut affected = vec![row.clone()];
        if row.is_dir() {
            for entry in self.store.all_entries()? {
                if entry.path.starts_with(&old_prefix) {
                    affected.push(entry);
                }
            }
        }

        self.ensure_ancestors(new_path)?;
        for entry in affected {
            let moved_path = format!("{}{}", new_path, &entry.path[old_path.len()..]);
            let old_hh = layout::hash_hex(&entry.path);
            let new_hh = layout::hash_hex(&moved_path);
            self.move_object_files(&old_hh, &new_hh)?;
            self.store.rekey_bitmaps(&old_hh, &new_hh);
            let mut moved = entry.clone();
            moved.path = moved_path;
            if !moved.local_path.is_empty() {
                moved.local_path =
                    layout::data_path(&self.cfg.cache_root, &new_hh, 0).to_string_lossy().to_string();
            }
            self.store.put(&moved)?;
            self.store.remove(&entry.path)?;
        }

        self.queue_intent(RemoteIntent::Rename {
            old_path: old_path.to_string(),
            new_path: new_path.to_string(),
        });
        Ok(())
    }

    pub fn utimens(&self, path: &str, mtime: u64) -> Result<MetaRow, EngineError> {
        let mut row = self.getattr(path)?;
        row.timestamp = mtime;
        self.store.put(&row)?;
        Ok(row)
    }

    // ---- data path ---------------------------------------------------------

    /// Length of the materialized portion of part `part_idx` once the object
    /// is fully present, given the authoritative size.
    fn part_logical_len(&self, size: u64, part_idx: u64) -> u64 {
        let part_off = part_idx * self.cfg.part_bytes;
        size.saturating_sub(part_off).min(self.cfg.part_bytes)
    }

    /// Makes `[start, end)` of the object readable locally: loads bitmaps,
    /// finds blocks that are neither locally authored (bit set) nor covered
    /// by the part file, coalesces them into maximal runs and fetches each
    /// run. Fetched bytes land in the part file; no dirty bits change here,
    /// so an interrupted fetch leaves no inconsistent state behind.
    fn ensure_present(&self, row: &MetaRow, start: u64, end: u64) -> Result<(), EngineError> {
        let end = end.min(row.size);
        if start >= end {
            return Ok(());
        }
        let hh = layout::hash_hex(&row.path);
        let pb = self.cfg.part_bytes;
        let bb = self.cfg.block_bytes;
        let first_part = start / pb;
        let last_part = (end - 1) / pb;
        for part_idx in first_part..=last_part {
            let part_off = part_idx * pb;
            let logical = self.part_logical_len(row.size, part_idx);
            let lo = start.max(part_off) - part_off;
            let hi = (end - part_off).min(logical);
            if lo >= hi {
                continue;
            }
            if !self.store.bitmap_loaded(&hh, part_idx) {
                self.store.load_bitmap(&hh, part_idx)?;
            }
            let dp = layout::data_path(&self.cfg.cache_root, &hh, part_idx);
            let file_len = fs::metadata(&dp).map(|m| m.len()).unwrap_or(0);

            // maximal contiguous runs of missing blocks, in part-relative bytes
            let mut runs: Vec<(u64, u64)> = Vec::new();
            for blk in lo / bb..=(hi - 1) / bb {
                let bstart = blk * bb;
                let bend = (bstart + bb).min(logical);
                let present = self.store.dirty_block(&hh, part_idx, blk) || file_len >= bend;
                if !present {
                    match runs.last_mut() {
                        Some((_, e)) if *e == bstart => *e = bend,
                        _ => runs.push((bstart, bend)),
                    }
                }
            }
            if runs.is_empty() {
                continue;
            }
            if let Some(parent) = dp.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().read(true).write(true).create(true).open(&dp)?;
            for (s, e) in runs {
                let data = self.backend.fetch(&row.path, part_off + s, e - s)?;
                file.write_all_at(&data, s)?;
                debug!("materialized [{}, {}) of {} part {}", s, e, row.path, part_idx);
            }
        }
        Ok(())
    }

    /// Positional read across part files. Short or missing part files read as
    /// zeros (sparse materialization).
    fn read_local(&self, row: &MetaRow, offset: u64, buf: &mut [u8]) -> Result<(), EngineError> {
        let hh = layout::hash_hex(&row.path);
        let pb = self.cfg.part_bytes;
        let mut filled = 0usize;
        while filled < buf.len() {
            let abs = offset + filled as u64;
            let part_idx = abs / pb;
            let rel = abs % pb;
            let n = ((pb - rel) as usize).min(buf.len() - filled);
            let dp = layout::data_path(&self.cfg.cache_root, &hh, part_idx);
            match File::open(&dp) {
                Ok(file) => {
                    let mut pos = 0usize;
                    while pos < n {
                        let r = file.read_at(&mut buf[filled + pos..filled + n], rel + pos as u64)?;
                        if r == 0 {
                            break; // EOF inside the part: the rest reads as zeros
                        }
                        pos += r;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            filled += n;
        }
        Ok(())
    }

    /// Positional write across part files, creating parents as needed.
    fn write_local(&self, hash_hex: &str, offset: u64, data: &[u8]) -> Result<(), EngineError> {
        let pb = self.cfg.part_bytes;
        let mut written = 0usize;
        while written < data.len() {
            let abs = offset + written as u64;
            let part_idx = abs / pb;
            let rel = abs % pb;
            let n = ((pb - rel) as usize).min(data.len() - written);
            let dp = layout::data_path(&self.cfg.cache_root, hash_hex, part_idx);
            if let Some(parent) = dp.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().write(true).create(true).open(&dp)?;
            file.write_all_at(&data[written..written + n], rel)?;
            written += n;
        }
        Ok(())
    }

    /// Serves a read from the local materialization, fetching whatever is
    /// missing first. Reads past EOF return short.
    pub fn read(&self, path: &str, offset: u64, size: u64) -> Result<Vec<u8>, EngineError> {
        let row = self.getattr(path)?;
        if row.is_dir() {
            return Err(EngineError::IsADirectory(path.to_string()));
        }
        if size == 0 || offset >= row.size {
            return Ok(Vec::new());
        }
        let end = (offset + size).min(row.size);
        self.ensure_present(&row, offset, end)?;
        let mut buf = vec![0u8; (end - offset) as usize];
        self.read_local(&row, offset, &mut buf)?;
        self.store.update_access_time(path, now())?;
        Ok(buf)
    }

    /// Absorbs a write locally: bytes land in the part files first, then the
    /// covered blocks are marked dirty (a crash in between leaves bytes
    /// without bits, never bits without bytes). Partially covered edge blocks
    /// are read-modify-written so a dirty block never carries uninitialized
    /// remote gaps.
    pub fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, EngineError> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut row = match self.store.get(path)? {
            Some(row) => row,
            None => match self.backend.info(path) {
                Ok(info) => {
                    self.ensure_ancestors(path)?;
                    let row = self.row_from_info(path, &info);
                    self.store.put(&row)?;
                    row
                }
                Err(BackendError::NotFound(_)) => self.create_file(path)?,
                Err(e) => return Err(e.into()),
            },
        };
        if row.is_dir() {
            return Err(EngineError::IsADirectory(path.to_string()));
        }
        let hh = layout::hash_hex(path);
        if row.local_path.is_empty() {
            // evicted object being re-materialized
            row.local_path =
                layout::data_path(&self.cfg.cache_root, &hh, 0).to_string_lossy().to_string();
        }

        let bb = self.cfg.block_bytes;
        let bpp = self.cfg.blocks_per_part();
        let end = offset + data.len() as u64;

        // read-modify-write the partially covered edge blocks; an aligned
        // write shorter than one block has no lead edge but still leaves its
        // tail block partially covered
        let lead = offset - offset % bb;
        let lead_handled = lead < offset;
        if lead_handled {
            self.ensure_present(&row, lead, (lead + bb).min(row.size))?;
        }
        let tail = end - end % bb;
        if tail < end && !(lead_handled && tail == lead) {
            self.ensure_present(&row, tail, (tail + bb).min(row.size))?;
        }

        self.write_local(&hh, offset, data).map_err(|e| match e {
            // a full local disk must not commit the affected blocks
            EngineError::Io(io) if io.kind() == std::io::ErrorKind::StorageFull => EngineError::NoSpace,
            other => other,
        })?;

        for blk in offset / bb..=(end - 1) / bb {
            let part_idx = blk / bpp;
            let block_in_part = blk % bpp;
            // merge with any bits already persisted for this part
            if !self.store.bitmap_loaded(&hh, part_idx) {
                self.store.load_bitmap(&hh, part_idx)?;
            }
            self.store.mark_dirty_block(&hh, part_idx, block_in_part);
        }

        row.size = row.size.max(end);
        row.dirty = true;
        row.timestamp = now();
        row.last_accessed = now();
        self.store.put(&row)?;
        // persist the bits: a crash before writeback must still flush them
        self.store.flush_bitmaps(&hh)?;
        Ok(data.len() as u32)
    }

    /// Adjusts the authoritative size. Shrinking trims or deletes tail parts
    /// and drops dirty bits past the new end; growing zero-fills. The
    /// affected last block goes dirty so the next writeback propagates the
    /// new size.
    pub fn truncate(&self, path: &str, new_size: u64) -> Result<MetaRow, EngineError> {
        let mut row = self.getattr(path)?;
        if row.is_dir() {
            return Err(EngineError::IsADirectory(path.to_string()));
        }
        let hh = layout::hash_hex(path);
        let pb = self.cfg.part_bytes;
        let bb = self.cfg.block_bytes;
        let bpp = self.cfg.blocks_per_part();
        if row.local_path.is_empty() {
            row.local_path =
                layout::data_path(&self.cfg.cache_root, &hh, 0).to_string_lossy().to_string();
        }

        if new_size < row.size {
            let keep_parts = if new_size == 0 { 0 } else { (new_size - 1) / pb + 1 };
            let dir = layout::object_data_dir(&self.cfg.cache_root, &hh);
            if let Ok(entries) = fs::read_dir(&dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name().to_string_lossy().to_string();
                    let Some(idx) = name.strip_prefix("part_").and_then(|s| s.parse::<u64>().ok())
                    else {
                        continue;
                    };
                    if idx >= keep_parts {
                        fs::remove_file(entry.path())?;
                    } else if idx == keep_parts - 1 {
                        let keep = new_size - idx * pb;
                        let f = OpenOptions::new().write(true).open(entry.path())?;
                        if f.metadata()?.len() > keep {
                            f.set_len(keep)?;
                        }
                    }
                }
            }
            // dirty bits past the new end are meaningless now
            let keep_blocks = if new_size == 0 { 0 } else { (new_size - 1) / bb + 1 };
            self.store.truncate_bits(&hh, keep_blocks, bpp);
        } else if new_size > row.size {
            let first_part = row.size / pb;
            let last_part = (new_size - 1) / pb;
            for part_idx in first_part..=last_part {
                let target = self.part_logical_len(new_size, part_idx);
                let dp = layout::data_path(&self.cfg.cache_root, &hh, part_idx);
                if let Some(parent) = dp.parent() {
                    fs::create_dir_all(parent)?;
                }
                let f = OpenOptions::new().write(true).create(true).open(&dp)?;
                if f.metadata()?.len() < target {
                    f.set_len(target)?;
                }
            }
        }

        // mark the affected last block dirty so the size change flushes
        let blk = if new_size == 0 { 0 } else { (new_size - 1) / bb };
        let part_idx = blk / bpp;
        if !self.store.bitmap_loaded(&hh, part_idx) {
            self.store.load_bitmap(&hh, part_idx)?;
        }
        self.store.mark_dirty_block(&hh, part_idx, blk % bpp);

        row.size = new_size;
        row.dirty = true;
        row.timestamp = now();
        self.store.put(&row)?;
        self.store.flush_bitmaps(&hh)?;
        Ok(row)
    }

    // ---- writeback / eviction support --------------------------------------

    /// Flushes one object's dirty blocks to the remote following the
    /// shadow-snapshot protocol: the bitmap copy taken at flush start is the
    /// only thing cleared on success, so bits dirtied concurrently survive to
    /// the next cycle. Returns true iff a remote flush was issued.
    pub fn flush_object(&self, path: &str) -> Result<bool, EngineError> {
        let Some(row) = self.store.get(path)? else { return Ok(false) };
        if !row.dirty || row.is_dir() {
            return Ok(false);
        }
        let lock = self.flush_lock(path);
        let _guard = lock.lock().unwrap();
        // re-read under the flush lock: another cycle may have finished first
        let Some(row) = self.store.get(path)? else { return Ok(false) };
        if !row.dirty {
            return Ok(false);
        }

        let hh = layout::hash_hex(path);
        if !self.store.has_dirty_bits(&hh) {
            // restart recovery: the row says dirty, the bits live on disk
            self.store.load_all_bitmaps(&hh)?;
        }
        let snapshot = self.store.bitmap_snapshot(&hh);
        if snapshot.values().all(|bm| bm.is_empty()) {
            // dirty flag without bits: restore the invariant
            self.store.mark_dirty(path, false)?;
            return Ok(false);
        }

        let pb = self.cfg.part_bytes;
        let bb = self.cfg.block_bytes;
        let mut runs: Vec<WriteRun> = Vec::new();
        for (part_idx, bm) in &snapshot {
            let part_off = part_idx * pb;
            for (first, last) in bm.runs(self.cfg.merge_gap_blocks) {
                let start = part_off + first * bb;
                let end = (part_off + (last + 1) * bb).min(row.size);
                if start >= end {
                    continue;
                }
                // merged gap blocks may never have been materialized
                self.ensure_present(&row, start, end)?;
                let mut buf = vec![0u8; (end - start) as usize];
                self.read_local(&row, start, &mut buf)?;
                runs.push(WriteRun { offset: start, data: buf });
            }
        }

        // a failure here leaves bitmaps and the dirty flag untouched; the
        // next writeback tick retries
        self.backend.flush(path, row.size, &runs)?;

        let remaining = self.store.clear_flushed(&hh, &snapshot);
        self.store.flush_bitmaps(&hh)?;
        if !remaining {
            self.store.mark_dirty(path, false)?;
        }
        debug!("flushed {} run(s) of {} ({} bytes total)", runs.len(), path,
               runs.iter().map(|r| r.data.len()).sum::<usize>());
        Ok(true)
    }

    /// fsync/flush entry point: everything queued for this mount reaches the
    /// remote before the call returns.
    pub fn sync_object(&self, path: &str) -> Result<(), EngineError> {
        self.drain_intents()?;
        self.flush_object(path)?;
        Ok(())
    }

    /// On-disk footprint of one object's part files.
    pub fn object_disk_bytes(&self, path: &str) -> u64 {
        let hh = layout::hash_hex(path);
        let dir = layout::object_data_dir(&self.cfg.cache_root, &hh);
        let Ok(entries) = fs::read_dir(&dir) else { return 0 };
        entries
            .flatten()
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    }

    /// Aggregate on-disk footprint of every cached object.
    pub fn total_disk_bytes(&self) -> Result<u64, EngineError> {
        Ok(self
            .store
            .all_entries()?
            .iter()
            .filter(|r| !r.local_path.is_empty())
            .map(|r| self.object_disk_bytes(&r.path))
            .sum())
    }

    /// Drops a clean object's local materialization. The metadata row stays,
    /// with `local_path` cleared, so a later access re-fetches. Returns the
    /// bytes reclaimed.
    pub fn evict_object(&self, row: &MetaRow) -> Result<u64, EngineError> {
        debug_assert!(!row.dirty);
        let hh = layout::hash_hex(&row.path);
        let freed = self.object_disk_bytes(&row.path);
        self.remove_object_files(&hh)?;
        self.store.drop_bitmaps(&hh);
        let mut cleared = row.clone();
        cleared.local_path = String::new();
        self.store.put(&cleared)?;
        debug!("evicted {} ({} bytes)", row.path, freed);
        Ok(freed)
    }

    fn remove_object_files(&self, hash_hex: &str) -> Result<(), EngineError> {
        for dir in [
            layout::object_data_dir(&self.cfg.cache_root, hash_hex),
            layout::object_bitmap_dir(&self.cfg.cache_root, hash_hex),
        ] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn move_object_files(&self, old_hash: &str, new_hash: &str) -> Result<(), EngineError> {
        for (old_dir, new_dir) in [
            (
                layout::object_data_dir(&self.cfg.cache_root, old_hash),
                layout::object_data_dir(&self.cfg.cache_root, new_hash),
            ),
            (
                layout::object_bitmap_dir(&self.cfg.cache_root, old_hash),
                layout::object_bitmap_dir(&self.cfg.cache_root, new_hash),
            ),
        ] {
            if !old_dir.exists() {
                continue;
            }
            if let Some(parent) = new_dir.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::remove_dir_all(&new_dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            fs::rename(&old_dir, &new_dir)?;
        }
        Ok(())
    }
}
