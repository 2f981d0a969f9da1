//! In-memory reference backend, stands in for the remote HTTP server in tests.
//! Every call is recorded so tests can assert which remote requests were (or
//! were not) issued.

use rofs_models::{BackendError, RemoteBackend, RemoteInfo, WriteRun};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug, Clone, PartialEq)]
pub enum StubCall {
    Info(String),
    List(String),
    Fetch { path: String, offset: u64, length: u64 },
    /// One entry per PUT run, with its Content-Range pieces.
    Put { path: String, offset: u64, data: Vec<u8>, total: u64 },
    Create { path: String, directory: bool },
    Rename { old_path: String, new_path: String },
    Delete(String),
}

#[derive(Debug, Clone)]
struct StubEntry {
    is_dir: bool,
    data: Vec<u8>,
    timestamp: u64,
}

pub struct StubBackend {
    entries: Mutex<HashMap<String, StubEntry>>,
    calls: Mutex<Vec<StubCall>>,
    /// When non-zero, the next flush runs fail with a transient error.
    flush_failures: AtomicU32,
}

impl StubBackend {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        entries.insert("/".to_string(), StubEntry { is_dir: true, data: Vec::new(), timestamp: 0 });
        StubBackend {
            entries: Mutex::new(entries),
            calls: Mutex::new(Vec::new()),
            flush_failures: AtomicU32::new(0),
        }
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        self.entries.lock().unwrap().insert(
            path.to_string(),
            StubEntry { is_dir: false, data: data.to_vec(), timestamp: 1 },
        );
    }

    pub fn add_dir(&self, path: &str) {
        self.entries.lock().unwrap().insert(
            path.to_string(),
            StubEntry { is_dir: true, data: Vec::new(), timestamp: 1 },
        );
    }

    pub fn file_data(&self, path: &str) -> Option<Vec<u8>> {
        self.entries.lock().unwrap().get(path).map(|e| e.data.clone())
    }

    pub fn calls(&self) -> Vec<StubCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    pub fn puts_for(&self, path: &str) -> Vec<StubCall> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, StubCall::Put { path: p, .. } if p == path))
            .collect()
    }

    /// Make the next `n` flush runs fail with a transient error.
    pub fn fail_flushes(&self, n: u32) {
        self.flush_failures.store(n, Ordering::SeqCst);
    }

    fn record(&self, call: StubCall) {
        self.calls.lock().unwrap().push(call);
    }

    fn parent_of(path: &str) -> String {
        Path::new(path)
            .parent()
            .map(|p| p.to_string_lossy().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string())
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteBackend for StubBackend {
    fn info(&self, path: &str) -> Result<RemoteInfo, BackendError> {
        self.record(StubCall::Info(path.to_string()));
        let entries = self.entries.lock().unwrap();
        let e = entries
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        Ok(RemoteInfo { size: e.data.len() as u64, timestamp: e.timestamp, is_dir: e.is_dir })
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        self.record(StubCall::List(path.to_string()));
        let entries = self.entries.lock().unwrap();
        let dir = entries
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        if !dir.is_dir {
            return Err(BackendError::Fatal(format!("{} is not a directory", path)));
        }
        let mut names: Vec<String> = entries
            .keys()
            .filter(|k| k.as_str() != path && Self::parent_of(k) == path)
            .filter_map(|k| Path::new(k).file_name().map(|n| n.to_string_lossy().to_string()))
            .collect();
        names.sort();
        Ok(names)
    }

    fn fetch(&self, path: &str, offset: u64, length: u64) -> Result<Vec<u8>, BackendError> {
        self.record(StubCall::Fetch { path: path.to_string(), offset, length });
        let entries = self.entries.lock().unwrap();
        let e = entries
            .get(path)
            .ok_or_else(|| BackendError::NotFound(path.to_string()))?;
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > e.data.len() {
            // the real server answers a short 206; the transport reports that
            // as an integrity failure
            return Err(BackendError::Integrity {
                expected: length,
                got: e.data.len().saturating_sub(start) as u64,
            });
        }
        Ok(e.data[start..end].to_vec())
    }

    fn flush(&self, path: &str, size: u64, runs: &[WriteRun]) -> Result<(), BackendError> {
        if runs.is_empty() {
            // mirrors the transport: with no run to carry the new size, the
            // object is replaced by one whole-object PUT with an empty body
            if self
                .flush_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BackendError::Transient("injected flush failure".into()));
            }
            self.record(StubCall::Put { path: path.to_string(), offset: 0, data: Vec::new(), total: size });
        }
        for run in runs {
            if self
                .flush_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(BackendError::Transient("injected flush failure".into()));
            }
            self.record(StubCall::Put {
                path: path.to_string(),
                offset: run.offset,
                data: run.data.clone(),
                total: size,
            });
            let mut entries = self.entries.lock().unwrap();
            let e = entries
                .entry(path.to_string())
                .or_insert_with(|| StubEntry { is_dir: false, data: Vec::new(), timestamp: 0 });
            let end = run.offset as usize + run.data.len();
            if e.data.len() < end {
                e.data.resize(end, 0);
            }
            e.data[run.offset as usize..end].copy_from_slice(&run.data);
            e.timestamp += 1;
        }
        // the declared size is authoritative: a truncate must shrink (and an
        // extension zero-fill) the remote copy even when no run covers the tail
        let mut entries = self.entries.lock().unwrap();
        let e = entries
            .entry(path.to_string())
            .or_insert_with(|| StubEntry { is_dir: false, data: Vec::new(), timestamp: 0 });
        e.data.resize(size as usize, 0);
        Ok(())
    }

    fn create(&self, path: &str, directory: bool) -> Result<(), BackendError> {
        self.record(StubCall::Create { path: path.to_string(), directory });
        let mut entries = self.entries.lock().unwrap();
        entries
            .entry(path.to_string())
            .or_insert_with(|| StubEntry { is_dir: directory, data: Vec::new(), timestamp: 0 });
        Ok(())
    }

    fn rename(&self, old_path: &str, new_path: &str) -> Result<(), BackendError> {
        self.record(StubCall::Rename { old_path: old_path.to_string(), new_path: new_path.to_string() });
        let mut entries = self.entries.lock().unwrap();
        match entries.remove(old_path) {
            Some(e) => {
                entries.insert(new_path.to_string(), e);
                Ok(())
            }
            // renaming something the remote never saw is fine: the data will
            // arrive under the new name at the next writeback
            None => Ok(()),
        }
    }

    fn delete(&self, path: &str) -> Result<(), BackendError> {
        self.record(StubCall::Delete(path.to_string()));
        self.entries.lock().unwrap().remove(path);
        Ok(())
    }
}
