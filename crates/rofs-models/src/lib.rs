use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Granularity of dirty/presence tracking inside a part.
pub const DEFAULT_BLOCK_BYTES: u64 = 64 * 1024;
/// Granularity of on-disk materialization and remote transfer.
pub const DEFAULT_PART_BYTES: u64 = 16 * 1024 * 1024;
/// Soft ceiling for the local cache before eviction kicks in.
pub const DEFAULT_CAPACITY_BYTES: u64 = 10 * 1024 * 1024 * 1024;
/// Writeback period.
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;
/// Dirty runs separated by at most this many clean blocks are merged into one PUT.
pub const DEFAULT_MERGE_GAP_BLOCKS: u64 = 4;

/// Engine configuration, populated from CLI flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub cache_root: PathBuf,
    pub remote_base_url: String,
    pub capacity_bytes: u64,
    pub part_bytes: u64,
    pub block_bytes: u64,
    pub flush_interval_ms: u64,
    pub merge_gap_blocks: u64,
}

impl CacheConfig {
    pub fn new(cache_root: PathBuf, remote_base_url: String) -> Self {
        CacheConfig {
            cache_root,
            remote_base_url,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
            part_bytes: DEFAULT_PART_BYTES,
            block_bytes: DEFAULT_BLOCK_BYTES,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            merge_gap_blocks: DEFAULT_MERGE_GAP_BLOCKS,
        }
    }

    /// Rejects configurations the layout math cannot work with.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.block_bytes == 0 || self.part_bytes == 0 {
            return Err(EngineError::Config("part_bytes and block_bytes must be non-zero".into()));
        }
        if self.part_bytes % self.block_bytes != 0 {
            return Err(EngineError::Config(format!(
                "part_bytes ({}) must be a multiple of block_bytes ({})",
                self.part_bytes, self.block_bytes
            )));
        }
        if self.remote_base_url.is_empty() {
            return Err(EngineError::Config("remote_base_url is required".into()));
        }
        Ok(())
    }

    /// Blocks per full part.
    pub fn blocks_per_part(&self) -> u64 {
        self.part_bytes / self.block_bytes
    }
}

/// One metadata row, keyed by absolute logical path.
///
/// `local_path` points at part 0 of the materialization (other parts are
/// derived by convention); it is empty for directories and for evicted files.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaRow {
    pub path: String,
    pub local_path: String,
    pub size: u64,
    /// Last-modified, seconds since epoch.
    pub timestamp: u64,
    /// For LRU eviction.
    pub last_accessed: u64,
    pub dirty: bool,
}

impl MetaRow {
    /// Directory rule: no materialization and zero size. Regular files keep
    /// their conventional `local_path` from creation, so the two never mix.
    pub fn is_dir(&self) -> bool {
        self.local_path.is_empty() && self.size == 0
    }
}

/// Stat-equivalent answer from `GET /api/info/{path}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub size: u64,
    pub timestamp: u64,
    pub is_dir: bool,
}

/// A contiguous span of bytes to PUT during writeback.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRun {
    pub offset: u64,
    pub data: Vec<u8>,
}

/// Namespace operations that must eventually reach the remote store. Queued
/// by the engine, drained by the writeback manager ahead of data flushes.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteIntent {
    Create { path: String, directory: bool },
    Rename { old_path: String, new_path: String },
    Delete { path: String },
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("conflict: {0}")]
    Conflict(String),
    /// Timeout or 5xx; retried internally, surfaced only once the retry
    /// budget is exhausted.
    #[error("transient: {0}")]
    Transient(String),
    #[error("remote failure: {0}")]
    Fatal(String),
    /// Declared and delivered byte counts disagree; the fetched range is
    /// discarded by the caller.
    #[error("integrity: expected {expected} bytes, got {got}")]
    Integrity { expected: u64, got: u64 },
}

/// Everything a cache-engine operation can fail with. Mapped to an errno only
/// at the FUSE boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("metadata store: {0}")]
    Metadata(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a directory: {0}")]
    NotADirectory(String),
    #[error("is a directory: {0}")]
    IsADirectory(String),
    #[error("directory not empty: {0}")]
    NotEmpty(String),
    #[error("cache capacity exhausted")]
    NoSpace,
    #[error("bad configuration: {0}")]
    Config(String),
}

/// The remote store as the cache engine sees it. One method per remote
/// endpoint; implementations are synchronous and shared across threads.
pub trait RemoteBackend: Send + Sync {
    /// Stat equivalent. `GET /api/info/{path}`.
    fn info(&self, path: &str) -> Result<RemoteInfo, BackendError>;
    /// Directory listing (names only). `GET /api/list/{path}`.
    fn list(&self, path: &str) -> Result<Vec<String>, BackendError>;
    /// Ranged read; must return exactly `length` bytes or fail.
    /// `GET /api/data/{path}` with a `Range` header.
    fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError>;
    /// Writeback of coalesced dirty runs. Succeeds only if every run did.
    /// `PUT /api/data/{path}` with a `Content-Range` header per run.
    fn flush(&self, path: &str, size: u64, runs: &[WriteRun]) -> Result<(), BackendError>;
    /// `POST /api/create/{path}?directory={bool}`.
    fn create(&self, path: &str, directory: bool) -> Result<(), BackendError>;
    /// `POST /api/rename` with a JSON body.
    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), BackendError>;
    /// `DELETE /api/delete/{path}`.
    fn delete(&self, path: &str) -> Result<(), BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_rejects_misaligned_part_size() {
        let mut cfg = CacheConfig::new(PathBuf::from("/tmp/x"), "http://r".into());
        cfg.part_bytes = 100;
        cfg.block_bytes = 64;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn config_defaults_are_valid() {
        let cfg = CacheConfig::new(PathBuf::from("/tmp/x"), "http://r".into());
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.blocks_per_part(), 256);
    }

    #[test]
    fn directory_rule() {
        let dir = MetaRow {
            path: "/a".into(),
            local_path: String::new(),
            size: 0,
            timestamp: 0,
            last_accessed: 0,
            dirty: false,
        };
        assert!(dir.is_dir());
        let file = MetaRow { local_path: "/cache/data/ab/cd/abcd/part_00000000".into(), ..dir.clone() };
        assert!(!file.is_dir());
    }
}
