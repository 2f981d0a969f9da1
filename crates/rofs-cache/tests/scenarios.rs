//! End-to-end cache behavior against the in-memory stub backend: cold reads,
//! local writes, writeback, read-modify-write, eviction, rename, restarts.

use rofs_api::stub::{StubBackend, StubCall};
use rofs_cache::manager::{run_eviction_once, run_writeback_once};
use rofs_cache::{CacheEngine, layout};
use rofs_models::CacheConfig;
use std::path::Path;
use tempfile::TempDir;

const PART: u64 = 64 * 1024;
const BLOCK: u64 = 4 * 1024;
const CAPACITY: u64 = 1024 * 1024;

fn test_config(root: &Path) -> CacheConfig {
    let mut cfg = CacheConfig::new(root.join("cache"), "http://r".into());
    cfg.part_bytes = PART;
    cfg.block_bytes = BLOCK;
    cfg.capacity_bytes = CAPACITY;
    cfg
}

fn test_engine() -> (CacheEngine<StubBackend>, TempDir) {
    let dir = TempDir::new().unwrap();
    let engine = CacheEngine::new(test_config(dir.path()), StubBackend::new()).unwrap();
    (engine, dir)
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
fn cold_read_materializes_from_remote() {
    let (engine, dir) = test_engine();
    engine.backend().add_file("/a.txt", &[b'A'; 4096]);

    let data = engine.read("/a.txt", 0, 4096).unwrap();
    assert_eq!(data, vec![b'A'; 4096]);

    let row = engine.store().get("/a.txt").unwrap().unwrap();
    assert!(!row.dirty);
    assert_eq!(row.size, 4096);

    // exactly one ranged fetch, and a part file at least that long
    let fetches: Vec<_> = engine
        .backend()
        .calls()
        .into_iter()
        .filter(|c| matches!(c, StubCall::Fetch { .. }))
        .collect();
    assert_eq!(fetches, vec![StubCall::Fetch { path: "/a.txt".into(), offset: 0, length: 4096 }]);

    let hh = layout::hash_hex("/a.txt");
    let part0 = layout::data_path(&dir.path().join("cache"), &hh, 0);
    assert!(part0.metadata().unwrap().len() >= 4096);
}

#[test]
fn write_is_absorbed_locally() {
    let (engine, _dir) = test_engine();
    engine.write("/b.txt", 0, b"hello").unwrap();

    assert_eq!(engine.read("/b.txt", 0, 5).unwrap(), b"hello");
    let row = engine.store().get("/b.txt").unwrap().unwrap();
    assert!(row.dirty);
    assert_eq!(row.size, 5);

    let hh = layout::hash_hex("/b.txt");
    assert!(engine.store().dirty_block(&hh, 0, 0));
    assert!(engine.backend().puts_for("/b.txt").is_empty());
}

#[test]
fn writeback_flushes_and_clears_bits() {
    let (engine, _dir) = test_engine();
    engine.write("/b.txt", 0, b"hello").unwrap();

    run_writeback_once(&engine).unwrap();

    let puts = engine.backend().puts_for("/b.txt");
    assert_eq!(
        puts,
        vec![StubCall::Put { path: "/b.txt".into(), offset: 0, data: b"hello".to_vec(), total: 5 }]
    );

    let row = engine.store().get("/b.txt").unwrap().unwrap();
    assert!(!row.dirty);
    assert_eq!(row.size, 5);
    let hh = layout::hash_hex("/b.txt");
    assert!(!engine.store().has_dirty_bits(&hh));
    assert_eq!(engine.backend().file_data("/b.txt").unwrap(), b"hello");
}

#[test]
fn writeback_is_idempotent() {
    let (engine, _dir) = test_engine();
    engine.write("/b.txt", 0, b"hello").unwrap();
    run_writeback_once(&engine).unwrap();
    engine.backend().clear_calls();

    run_writeback_once(&engine).unwrap();
    assert!(engine.backend().puts_for("/b.txt").is_empty());
}

#[test]
fn partial_block_write_reads_the_block_first() {
    let (engine, _dir) = test_engine();
    let remote = pattern(8192);
    engine.backend().add_file("/c.txt", &remote);

    engine.write("/c.txt", 100, b"XYZ").unwrap();

    // the leading edge block had to be materialized before the overlay
    let calls = engine.backend().calls();
    assert!(
        calls.contains(&StubCall::Fetch { path: "/c.txt".into(), offset: 0, length: 4096 }),
        "expected a whole-block fetch before the partial overlay, got {:?}",
        calls
    );

    let mut expect = remote.clone();
    expect[100..103].copy_from_slice(b"XYZ");
    assert_eq!(engine.read("/c.txt", 0, 8192).unwrap(), expect);
}

#[test]
fn aligned_short_write_reads_the_block_first() {
    let (engine, _dir) = test_engine();
    let remote = pattern(8192);
    engine.backend().add_file("/c2.txt", &remote);

    // starts on a block boundary but covers only part of the block
    engine.write("/c2.txt", 0, b"abc").unwrap();

    let calls = engine.backend().calls();
    assert!(
        calls.contains(&StubCall::Fetch { path: "/c2.txt".into(), offset: 0, length: 4096 }),
        "expected a whole-block fetch before the aligned partial overlay, got {:?}",
        calls
    );

    let mut expect = remote.clone();
    expect[0..3].copy_from_slice(b"abc");
    assert_eq!(engine.read("/c2.txt", 0, 8192).unwrap(), expect);
}

#[test]
fn flush_failure_keeps_dirty_state_for_retry() {
    let (engine, _dir) = test_engine();
    engine.write("/b.txt", 0, b"hello").unwrap();
    engine.backend().fail_flushes(1);

    run_writeback_once(&engine).unwrap(); // failure is logged, not returned
    let row = engine.store().get("/b.txt").unwrap().unwrap();
    assert!(row.dirty);
    let hh = layout::hash_hex("/b.txt");
    assert!(engine.store().has_dirty_bits(&hh));

    run_writeback_once(&engine).unwrap();
    assert!(!engine.store().get("/b.txt").unwrap().unwrap().dirty);
    assert_eq!(engine.backend().file_data("/b.txt").unwrap(), b"hello");
}

#[test]
fn eviction_respects_dirty_objects() {
    let (engine, _dir) = test_engine();

    // 1 MiB of clean data pulled from the remote: 4 files x 256 KiB
    for i in 0..4 {
        let path = format!("/clean{}", i);
        engine.backend().add_file(&path, &pattern(256 * 1024));
        engine.read(&path, 0, 256 * 1024).unwrap();
    }
    // 0.5 MiB of local dirty data: 2 files x 256 KiB
    for i in 0..2 {
        engine.write(&format!("/dirty{}", i), 0, &pattern(256 * 1024)).unwrap();
    }
    assert!(engine.total_disk_bytes().unwrap() > CAPACITY);

    run_eviction_once(&engine).unwrap();

    let total = engine.total_disk_bytes().unwrap();
    let dirty_bytes: u64 = (0..2).map(|i| engine.object_disk_bytes(&format!("/dirty{}", i))).sum();
    assert_eq!(dirty_bytes, 512 * 1024, "dirty objects must be fully retained");
    assert!(
        total - dirty_bytes <= 900 * 1024,
        "clean on-disk bytes should sink below the hysteresis target, got {}",
        total - dirty_bytes
    );

    // dirty data still reads back without any remote help
    engine.backend().clear_calls();
    assert_eq!(engine.read("/dirty0", 0, 16).unwrap(), pattern(16));
    assert!(
        !engine.backend().calls().iter().any(|c| matches!(c, StubCall::Fetch { .. })),
        "dirty data must be served locally"
    );
}

#[test]
fn evicted_objects_are_refetched_on_access() {
    let (engine, _dir) = test_engine();
    let body = pattern(8192);
    engine.backend().add_file("/e.txt", &body);
    engine.read("/e.txt", 0, 8192).unwrap();

    let row = engine.store().get("/e.txt").unwrap().unwrap();
    engine.evict_object(&row).unwrap();
    let row = engine.store().get("/e.txt").unwrap().unwrap();
    assert!(row.local_path.is_empty());
    assert_eq!(engine.object_disk_bytes("/e.txt"), 0);

    engine.backend().clear_calls();
    assert_eq!(engine.read("/e.txt", 0, 8192).unwrap(), body);
    assert!(engine.backend().calls().iter().any(|c| matches!(c, StubCall::Fetch { .. })));
}

#[test]
fn rename_carries_data_and_dirty_state() {
    let (engine, dir) = test_engine();
    engine.write("/d.txt", 0, b"payload").unwrap();

    engine.rename("/d.txt", "/d2.txt").unwrap();

    assert!(engine.store().get("/d.txt").unwrap().is_none());
    let row = engine.store().get("/d2.txt").unwrap().unwrap();
    assert!(row.dirty);
    assert_eq!(row.size, 7);

    // parts and bitmaps are reachable from the new hash layout
    let new_hh = layout::hash_hex("/d2.txt");
    let root = dir.path().join("cache");
    assert!(layout::data_path(&root, &new_hh, 0).exists());
    assert!(layout::bitmap_path(&root, &new_hh, 0).exists());

    // reading the new name needs no remote fetch
    engine.backend().clear_calls();
    assert_eq!(engine.read("/d2.txt", 0, 7).unwrap(), b"payload");
    assert!(!engine.backend().calls().iter().any(|c| matches!(c, StubCall::Fetch { .. })));

    // on writeback the remote sees the rename before the data lands
    run_writeback_once(&engine).unwrap();
    let calls = engine.backend().calls();
    let rename_pos = calls
        .iter()
        .position(|c| matches!(c, StubCall::Rename { old_path, .. } if old_path == "/d.txt"))
        .expect("rename intent must reach the remote");
    let put_pos = calls
        .iter()
        .position(|c| matches!(c, StubCall::Put { path, .. } if path == "/d2.txt"))
        .expect("renamed object must be flushed");
    assert!(rename_pos < put_pos);
    assert_eq!(engine.backend().file_data("/d2.txt").unwrap(), b"payload");
}

#[test]
fn restart_preserves_writes_and_dirty_state() {
    let dir = TempDir::new().unwrap();
    let body = pattern(10_000);
    {
        let engine = CacheEngine::new(test_config(dir.path()), StubBackend::new()).unwrap();
        engine.write("/crash.txt", 0, &body[..5000]).unwrap();
        engine.write("/crash.txt", 5000, &body[5000..]).unwrap();
        // no writeback: the process "crashes" here
    }

    let engine = CacheEngine::new(test_config(dir.path()), StubBackend::new()).unwrap();
    assert_eq!(engine.read("/crash.txt", 0, 10_000).unwrap(), body);
    let row = engine.store().get("/crash.txt").unwrap().unwrap();
    assert!(row.dirty);

    run_writeback_once(&engine).unwrap();
    assert_eq!(engine.backend().file_data("/crash.txt").unwrap(), body);
    assert!(!engine.store().get("/crash.txt").unwrap().unwrap().dirty);
}

#[test]
fn truncate_shrinks_locally_and_remotely() {
    let (engine, _dir) = test_engine();
    engine.backend().add_file("/t.txt", &pattern(9000));
    engine.read("/t.txt", 0, 9000).unwrap();

    engine.truncate("/t.txt", 100).unwrap();
    let row = engine.store().get("/t.txt").unwrap().unwrap();
    assert!(row.dirty);
    assert_eq!(row.size, 100);
    assert_eq!(engine.read("/t.txt", 0, 4096).unwrap(), pattern(9000)[..100]);

    run_writeback_once(&engine).unwrap();
    assert_eq!(engine.backend().file_data("/t.txt").unwrap(), pattern(9000)[..100].to_vec());
}

#[test]
fn truncate_to_zero_flushes_an_empty_put() {
    let (engine, _dir) = test_engine();
    engine.backend().add_file("/z.txt", &pattern(5000));
    engine.read("/z.txt", 0, 5000).unwrap();

    engine.truncate("/z.txt", 0).unwrap();
    assert!(engine.store().get("/z.txt").unwrap().unwrap().dirty);
    engine.backend().clear_calls();

    run_writeback_once(&engine).unwrap();

    // no dirty run can carry the new size: the remote gets one whole-object
    // PUT with an empty body
    let puts = engine.backend().puts_for("/z.txt");
    assert_eq!(
        puts,
        vec![StubCall::Put { path: "/z.txt".into(), offset: 0, data: Vec::new(), total: 0 }]
    );
    assert_eq!(engine.backend().file_data("/z.txt").unwrap(), Vec::<u8>::new());

    let row = engine.store().get("/z.txt").unwrap().unwrap();
    assert!(!row.dirty);
    assert_eq!(row.size, 0);
    assert_eq!(engine.read("/z.txt", 0, 100).unwrap(), Vec::<u8>::new());
}

#[test]
fn unlink_removes_locally_and_queues_remote_delete() {
    let (engine, _dir) = test_engine();
    engine.write("/gone.txt", 0, b"bye").unwrap();
    engine.unlink("/gone.txt").unwrap();

    assert!(engine.store().get("/gone.txt").unwrap().is_none());
    assert_eq!(engine.object_disk_bytes("/gone.txt"), 0);
    assert!(matches!(engine.read("/gone.txt", 0, 3), Err(rofs_models::EngineError::NotFound(_))));

    run_writeback_once(&engine).unwrap();
    assert!(engine
        .backend()
        .calls()
        .contains(&StubCall::Delete("/gone.txt".into())));
    assert!(engine.backend().puts_for("/gone.txt").is_empty());
}

#[test]
fn readdir_merges_local_and_remote_views() {
    let (engine, _dir) = test_engine();
    engine.backend().add_dir("/docs");
    engine.backend().add_file("/docs/remote.txt", b"r");
    engine.write("/docs/local.txt", 0, b"l").unwrap();

    let names: Vec<String> = engine
        .readdir("/docs")
        .unwrap()
        .into_iter()
        .map(|r| r.path)
        .collect();
    assert_eq!(names, vec!["/docs/local.txt".to_string(), "/docs/remote.txt".to_string()]);
}

#[test]
fn ancestors_exist_for_every_materialized_path() {
    let (engine, _dir) = test_engine();
    engine.backend().add_file("/deep/nested/file.bin", b"x");
    engine.getattr("/deep/nested/file.bin").unwrap();

    let deep = engine.store().get("/deep").unwrap().unwrap();
    let nested = engine.store().get("/deep/nested").unwrap().unwrap();
    assert!(deep.is_dir() && nested.is_dir());
}
