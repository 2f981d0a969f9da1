//! Background eviction and writeback. Two cooperative workers: one enforces
//! the cache-size ceiling by LRU-evicting clean objects, the other
//! periodically pushes dirty objects (and queued namespace intents) to the
//! remote. Both run as plain threads over the shared engine; the per-cycle
//! entry points are public so tests can drive them synchronously.

use crate::engine::CacheEngine;
use log::{debug, error, warn};
use rofs_models::{EngineError, RemoteBackend};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Evict down to this fraction of capacity once the ceiling is crossed.
const EVICTION_HYSTERESIS: f64 = 0.9;
/// How often the eviction worker re-checks the footprint.
const EVICTION_CHECK_INTERVAL: Duration = Duration::from_secs(2);
/// Granularity of the stop-flag poll inside worker sleeps.
const TICK: Duration = Duration::from_millis(200);

/// One writeback cycle: queued namespace intents first (create/rename/delete
/// must precede the data PUTs they order), then every dirty row.
pub fn run_writeback_once<B: RemoteBackend>(engine: &CacheEngine<B>) -> Result<(), EngineError> {
    engine.drain_intents()?;
    let mut flushed = 0u32;
    for row in engine.store().all_entries()? {
        if !row.dirty {
            continue;
        }
        match engine.flush_object(&row.path) {
            Ok(true) => flushed += 1,
            Ok(false) => {}
            // keep going: one object's failure must not starve the rest
            Err(e) => warn!("writeback of {} failed, will retry: {}", row.path, e),
        }
    }
    if flushed > 0 {
        debug!("writeback cycle flushed {} object(s)", flushed);
    }
    Ok(())
}

/// One eviction pass: when the aggregate part-file footprint exceeds the
/// ceiling, drop clean objects in ascending last-access order until it sinks
/// below `capacity * 0.9`. Dirty objects are never touched; if they alone
/// exceed capacity there is nothing safe to delete and we only log pressure.
pub fn run_eviction_once<B: RemoteBackend>(engine: &CacheEngine<B>) -> Result<(), EngineError> {
    let capacity = engine.config().capacity_bytes;
    let mut total = engine.total_disk_bytes()?;
    if total <= capacity {
        return Ok(());
    }
    let target = (capacity as f64 * EVICTION_HYSTERESIS) as u64;

    let mut candidates: Vec<_> = engine
        .store()
        .all_entries()?
        .into_iter()
        .filter(|r| !r.dirty && !r.local_path.is_empty())
        .collect();
    candidates.sort_by_key(|r| r.last_accessed);

    for row in candidates {
        if total <= target {
            break;
        }
        // the row may have gone dirty since the scan
        match engine.store().get(&row.path)? {
            Some(current) if !current.dirty => {
                total = total.saturating_sub(engine.evict_object(&current)?);
            }
            _ => {}
        }
    }

    if total > capacity {
        warn!(
            "cache pressure: {} bytes on disk exceed the {} byte ceiling but the rest is dirty",
            total, capacity
        );
    }
    Ok(())
}

/// Owns the two worker threads. Dropping without `shutdown` detaches them.
pub struct Manager {
    stop: Arc<AtomicBool>,
    handles: Vec<JoinHandle<()>>,
}

impl Manager {
    pub fn start<B: RemoteBackend + 'static>(engine: Arc<CacheEngine<B>>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flush_interval = Duration::from_millis(engine.config().flush_interval_ms);

        let writeback = {
            let engine = engine.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("rofs-writeback".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        sleep_until(&stop, flush_interval);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = run_writeback_once(&engine) {
                            warn!("writeback cycle aborted: {}", e);
                        }
                    }
                })
                .expect("failed to spawn the writeback worker")
        };

        let eviction = {
            let engine = engine.clone();
            let stop = stop.clone();
            std::thread::Builder::new()
                .name("rofs-eviction".into())
                .spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        sleep_until(&stop, EVICTION_CHECK_INTERVAL);
                        if stop.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = run_eviction_once(&engine) {
                            error!("eviction cycle failed: {}", e);
                        }
                    }
                })
                .expect("failed to spawn the eviction worker")
        };

        Manager { stop, handles: vec![writeback, eviction] }
    }

    /// Stops both workers and runs one final writeback so a clean unmount
    /// leaves nothing dirty behind.
    pub fn shutdown<B: RemoteBackend>(mut self, engine: &CacheEngine<B>) {
        self.stop.store(true, Ordering::Relaxed);
        for h in self.handles.drain(..) {
            let _ = h.join();
        }
        if let Err(e) = run_writeback_once(engine) {
            warn!("final writeback on shutdown failed: {}", e);
        }
    }
}

fn sleep_until(stop: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline && !stop.load(Ordering::Relaxed) {
        std::thread::sleep(TICK.min(deadline.saturating_duration_since(Instant::now())));
    }
}
