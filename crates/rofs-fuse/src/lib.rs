//! FUSE operation dispatcher: translates kernel filesystem calls into cache
//! engine operations and engine errors into negated errno values. Keeps the
//! inode/path table; everything stateful lives in the engine.

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow, consts,
};
use libc::{EEXIST, EINVAL, ENOSYS, O_ACCMODE, O_APPEND, O_TRUNC};
use log::{debug, error};
use rofs_cache::CacheEngine;
use rofs_models::{BackendError, EngineError, MetaRow, RemoteBackend};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const TTL_FILE: Duration = Duration::from_secs(1);
const TTL_DIR: Duration = Duration::from_secs(1);
const ROOT_INO: u64 = 1;

fn map_error(error: &EngineError) -> libc::c_int {
    use libc::{EACCES, EAGAIN, EIO, EISDIR, ENOENT, ENOSPC, ENOTDIR, ENOTEMPTY};
    match error {
        EngineError::NotFound(_) => ENOENT,
        EngineError::AlreadyExists(_) => EEXIST,
        EngineError::NotADirectory(_) => ENOTDIR,
        EngineError::IsADirectory(_) => EISDIR,
        EngineError::NotEmpty(_) => ENOTEMPTY,
        EngineError::NoSpace => ENOSPC,
        EngineError::Config(_) => EINVAL,
        EngineError::Metadata(e) => {
            error!("metadata store failure: {}", e);
            EIO
        }
        EngineError::Io(e) => e.raw_os_error().unwrap_or(EIO),
        EngineError::Backend(b) => match b {
            BackendError::NotFound(_) => ENOENT,
            BackendError::Unauthorized => EACCES,
            BackendError::Conflict(_) => EEXIST,
            BackendError::Transient(e) => {
                error!("remote still unavailable after retries: {}", e);
                EAGAIN
            }
            BackendError::Fatal(e) => {
                error!("remote failure: {}", e);
                EIO
            }
            BackendError::Integrity { expected, got } => {
                error!("remote range mismatch: expected {} bytes, got {}", expected, got);
                EIO
            }
        },
    }
}

pub struct RemoteFS<B: RemoteBackend> {
    engine: Arc<CacheEngine<B>>,

    // inode/path management; the engine is keyed by path, the kernel by ino
    ino_to_path: HashMap<u64, String>,
    path_to_ino: HashMap<String, u64>,
    next_ino: u64,

    // file handle management
    next_fh: u64,
    open_flags: HashMap<u64, i32>,
}

impl<B: RemoteBackend> RemoteFS<B> {
    pub fn new(engine: Arc<CacheEngine<B>>) -> Self {
        let mut ino_to_path = HashMap::new();
        let mut path_to_ino = HashMap::new();
        ino_to_path.insert(ROOT_INO, "/".to_string());
        path_to_ino.insert("/".to_string(), ROOT_INO);
        Self {
            engine,
            ino_to_path,
            path_to_ino,
            next_ino: 2,
            next_fh: 3,
            open_flags: HashMap::new(),
        }
    }

    fn assign_ino(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.path_to_ino.get(path) {
            return *ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.ino_to_path.insert(ino, path.to_string());
        self.path_to_ino.insert(path.to_string(), ino);
        ino
    }

    fn path_of(&self, ino: u64) -> Option<String> {
        self.ino_to_path.get(&ino).cloned()
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Option<String> {
        let dir = self.path_of(parent)?;
        let name = name.to_string_lossy();
        Some(if dir == "/" { format!("/{}", name) } else { format!("{}/{}", dir, name) })
    }

    fn forget_path(&mut self, path: &str) {
        if let Some(ino) = self.path_to_ino.remove(path) {
            self.ino_to_path.remove(&ino);
        }
    }

    /// Renames rewrite the whole subtree in the inode table so open handles
    /// keep resolving.
    fn rekey_prefix(&mut self, old_path: &str, new_path: &str) {
        let old_prefix = format!("{}/", old_path);
        let affected: Vec<(u64, String)> = self
            .ino_to_path
            .iter()
            .filter(|(_, p)| p.as_str() == old_path || p.starts_with(&old_prefix))
            .map(|(i, p)| (*i, p.clone()))
            .collect();
        for (ino, path) in affected {
            let moved = format!("{}{}", new_path, &path[old_path.len()..]);
            self.path_to_ino.remove(&path);
            self.ino_to_path.insert(ino, moved.clone());
            self.path_to_ino.insert(moved, ino);
        }
    }

    fn attr_for(&mut self, row: &MetaRow, req: &Request<'_>) -> FileAttr {
        let ino = self.assign_ino(&row.path);
        let mtime = UNIX_EPOCH + Duration::from_secs(row.timestamp);
        let atime = UNIX_EPOCH + Duration::from_secs(row.last_accessed);
        let (kind, perm, nlink) = if row.is_dir() {
            (FileType::Directory, 0o755, 2)
        } else {
            (FileType::RegularFile, 0o644, 1)
        };
        FileAttr {
            ino,
            size: row.size,
            blocks: (row.size + 511) / 512, // posix stat blocks are 512 bytes
            atime,
            mtime,
            ctime: mtime,
            crtime: mtime,
            kind,
            perm,
            nlink,
            uid: req.uid(),
            gid: req.gid(),
            rdev: 0,
            flags: 0,
            // preferred I/O size, matches the cache block granularity
            blksize: self.engine.config().block_bytes as u32,
        }
    }

    fn reply_entry(&mut self, row: &MetaRow, req: &Request<'_>, reply: ReplyEntry) {
        let ttl = if row.is_dir() { TTL_DIR } else { TTL_FILE };
        let attr = self.attr_for(row, req);
        reply.entry(&ttl, &attr, 0);
    }
}

impl<B: RemoteBackend> Filesystem for RemoteFS<B> {
    fn init(&mut self, _req: &Request<'_>, _config: &mut fuser::KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("fuse layer destroyed");
    }

    fn lookup(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.getattr(&path) {
            Ok(row) => self.reply_entry(&row, req, reply),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn getattr(&mut self, req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        match self.engine.getattr(&path) {
            Ok(row) => {
                let ttl = if row.is_dir() { TTL_DIR } else { TTL_FILE };
                let attr = self.attr_for(&row, req);
                reply.attr(&ttl, &attr);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn setattr(
        &mut self,
        req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };

        if let Some(new_size) = size {
            match self.engine.truncate(&path, new_size) {
                Ok(_) => {}
                Err(e) => {
                    reply.error(map_error(&e));
                    return;
                }
            }
        }
        if let Some(t) = mtime {
            let secs = match t {
                TimeOrNow::SpecificTime(st) => {
                    st.duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0)
                }
                TimeOrNow::Now => SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0),
            };
            if let Err(e) = self.engine.utimens(&path, secs) {
                reply.error(map_error(&e));
                return;
            }
        }
        // mode/uid/gid are accepted no-ops: the remote store has no owner model

        match self.engine.getattr(&path) {
            Ok(row) => {
                let ttl = if row.is_dir() { TTL_DIR } else { TTL_FILE };
                let attr = self.attr_for(&row, req);
                reply.attr(&ttl, &attr);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.create_file(&path) {
            Ok(row) => self.reply_entry(&row, req, reply),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.create_file(&path) {
            Ok(row) => {
                let attr = self.attr_for(&row, req);
                let fh = self.next_fh;
                self.next_fh += 1;
                self.open_flags.insert(fh, flags);
                reply.created(&TTL_FILE, &attr, 0, fh, consts::FOPEN_DIRECT_IO);
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn mkdir(&mut self, req: &Request<'_>, parent: u64, name: &OsStr, _mode: u32, _umask: u32, reply: ReplyEntry) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.mkdir(&path) {
            Ok(row) => self.reply_entry(&row, req, reply),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.unlink(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(path) = self.child_path(parent, name) else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.engine.rmdir(&path) {
            Ok(()) => {
                self.forget_path(&path);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        new_parent: u64,
        new_name: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old_path), Some(new_path)) =
            (self.child_path(parent, name), self.child_path(new_parent, new_name))
        else {
            reply.error(libc::ENOENT);
            return;
        };
        if flags & libc::RENAME_EXCHANGE != 0 {
            reply.error(ENOSYS);
            return;
        }
        if flags & libc::RENAME_NOREPLACE != 0 {
            match self.engine.getattr(&new_path) {
                Ok(_) => {
                    reply.error(EEXIST);
                    return;
                }
                Err(EngineError::NotFound(_)) => {}
                Err(e) => {
                    reply.error(map_error(&e));
                    return;
                }
            }
        }
        match self.engine.rename(&old_path, &new_path) {
            Ok(()) => {
                self.forget_path(&new_path);
                self.rekey_prefix(&old_path, &new_path);
                reply.ok();
            }
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        // the row must exist before data I/O; no bytes move yet
        if let Err(e) = self.engine.getattr(&path) {
            reply.error(map_error(&e));
            return;
        }
        if flags & O_TRUNC != 0 && (flags & O_ACCMODE) != libc::O_RDONLY {
            if let Err(e) = self.engine.truncate(&path, 0) {
                reply.error(map_error(&e));
                return;
            }
        }
        let fh = self.next_fh;
        self.next_fh += 1;
        self.open_flags.insert(fh, flags);
        reply.opened(fh, consts::FOPEN_KEEP_CACHE);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        match self.engine.read(&path, offset as u64, size as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        if offset < 0 {
            reply.error(EINVAL);
            return;
        }
        let mut off = offset as u64;
        let append =
            flags & O_APPEND != 0 || self.open_flags.get(&fh).map(|f| f & O_APPEND != 0).unwrap_or(false);
        if append {
            match self.engine.getattr(&path) {
                Ok(row) => off = row.size,
                Err(e) => {
                    reply.error(map_error(&e));
                    return;
                }
            }
        }
        match self.engine.write(&path, off, data) {
            Ok(n) => reply.written(n),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        match self.engine.sync_object(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        match self.engine.sync_object(&path) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(map_error(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        // no forced flush on close; writeback owns the data
        self.open_flags.remove(&fh);
        reply.ok();
    }

    fn readdir(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, offset: i64, mut reply: ReplyDirectory) {
        let Some(path) = self.path_of(ino) else {
            reply.error(libc::ESTALE);
            return;
        };
        let entries = match self.engine.readdir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(map_error(&e));
                return;
            }
        };

        if offset == 0 {
            let parent = Path::new(&path)
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| "/".to_string());
            let parent_ino = self.assign_ino(&parent);
            if reply.add(ino, 1, FileType::Directory, ".") || reply.add(parent_ino, 2, FileType::Directory, "..") {
                reply.ok();
                return;
            }
        }

        let start = (offset - 2).max(0) as usize;
        for (i, row) in entries.iter().enumerate().skip(start) {
            let kind = if row.is_dir() { FileType::Directory } else { FileType::RegularFile };
            let name = Path::new(&row.path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let child_ino = self.assign_ino(&row.path);
            // stable cookie: 3 + index
            if reply.add(child_ino, (i as i64) + 3, kind, &name) {
                break;
            }
        }
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let capacity = self.engine.config().capacity_bytes;
        let used = self.engine.total_disk_bytes().unwrap_or(0);
        let bsize: u32 = 512;
        let blocks = capacity / bsize as u64;
        let free = capacity.saturating_sub(used) / bsize as u64;
        reply.statfs(blocks, free, free, 0, 0, bsize, 255, bsize);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    // links are not part of the remote store's model
    fn link(&mut self, _req: &Request<'_>, _ino: u64, _new_parent: u64, _new_name: &OsStr, reply: ReplyEntry) {
        reply.error(ENOSYS);
    }

    fn symlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, _link: &Path, reply: ReplyEntry) {
        reply.error(ENOSYS);
    }

    fn readlink(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyData) {
        reply.error(ENOSYS);
    }
}
