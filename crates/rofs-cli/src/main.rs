use clap::Parser;
use daemonize::Daemonize;
use fuser::MountOption;
use log::{error, info};
use rofs_api::HttpBackend;
use rofs_cache::{CacheEngine, Manager};
use rofs_fuse::RemoteFS;
use rofs_models::{
    CacheConfig, DEFAULT_BLOCK_BYTES, DEFAULT_CAPACITY_BYTES, DEFAULT_FLUSH_INTERVAL_MS,
    DEFAULT_MERGE_GAP_BLOCKS, DEFAULT_PART_BYTES,
};
use signal_hook::{consts::signal::*, iterator::Signals};
use std::fs::{File, create_dir_all};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

#[derive(Parser, Debug)]
#[command(name = "rofs", version = "0.1.0", about = "Mount a remote object store with a local write-back cache")]
struct Cli {
    /// Mount point for the remote store
    #[arg(short, long)]
    mount_point: String,

    /// Base URL of the remote object store
    #[arg(short, long)]
    remote_address: String,

    /// Root directory for the local cache (metadata, parts, bitmaps)
    #[arg(short, long)]
    cache_root: PathBuf,

    /// Soft ceiling for the cache footprint, in bytes
    #[arg(long, default_value_t = DEFAULT_CAPACITY_BYTES)]
    capacity_bytes: u64,

    /// Part granularity in bytes (unit of materialization and transfer)
    #[arg(long, default_value_t = DEFAULT_PART_BYTES)]
    part_bytes: u64,

    /// Block granularity in bytes (unit of dirty tracking)
    #[arg(long, default_value_t = DEFAULT_BLOCK_BYTES)]
    block_bytes: u64,

    /// Writeback period in milliseconds
    #[arg(long, default_value_t = DEFAULT_FLUSH_INTERVAL_MS)]
    flush_interval_ms: u64,

    /// Merge dirty runs separated by at most this many clean blocks
    #[arg(long, default_value_t = DEFAULT_MERGE_GAP_BLOCKS)]
    merge_gap_blocks: u64,

    /// Detach and run in the background
    #[arg(long, action = clap::ArgAction::SetTrue)]
    daemon: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let mut cfg = CacheConfig::new(cli.cache_root.clone(), cli.remote_address.clone());
    cfg.capacity_bytes = cli.capacity_bytes;
    cfg.part_bytes = cli.part_bytes;
    cfg.block_bytes = cli.block_bytes;
    cfg.flush_interval_ms = cli.flush_interval_ms;
    cfg.merge_gap_blocks = cli.merge_gap_blocks;
    if let Err(e) = cfg.validate() {
        eprintln!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    // daemonize before anything spawns threads (the tokio runtime inside the
    // backend would not survive the fork)
    if cli.daemon {
        let stdout = File::create("/tmp/rofs.log").expect("failed to create log file");
        let stderr = File::create("/tmp/rofs.err").expect("failed to create error log file");
        let daemonize = Daemonize::new()
            .pid_file("/tmp/rofs.pid")
            .stdout(stdout)
            .stderr(stderr)
            .working_directory("/")
            .umask(0o027);
        daemonize.start().expect("daemonization failed");
    }

    let backend = match HttpBackend::new(cli.remote_address.clone()) {
        Ok(be) => be,
        Err(e) => {
            eprintln!("cannot reach the remote store: {}", e);
            std::process::exit(1);
        }
    };

    // a broken metadata database makes the mount unusable: give up loudly
    let engine = Arc::new(
        CacheEngine::new(cfg, backend).expect("cache engine initialization failed"),
    );
    let manager = Manager::start(engine.clone());
    let fs = RemoteFS::new(engine.clone());

    create_dir_all(&cli.mount_point).expect("mount point does not exist and cannot be created");
    let options = vec![MountOption::FSName("rofs".to_string()), MountOption::RW];
    let session = fuser::spawn_mount2(fs, &cli.mount_point, &options).expect("failed to mount");

    let pair = Arc::new((Mutex::new(false), Condvar::new()));
    let pair_clone = pair.clone();

    let mut signals = Signals::new([SIGINT, SIGTERM, SIGQUIT, SIGHUP]).expect("unable to register signal handlers");
    thread::spawn(move || {
        for signal in signals.forever() {
            match signal {
                SIGINT | SIGTERM | SIGQUIT | SIGHUP => {
                    let (lock, cvar) = &*pair_clone;
                    let mut stop = lock.lock().unwrap();
                    *stop = true;
                    cvar.notify_one();
                    info!("signal {} received", signal);
                    break;
                }
                other => {
                    error!("signal not handled: {}", other);
                }
            }
        }
    });

    info!("rofs mounted on {}", cli.mount_point);
    info!("remote store: {}", cli.remote_address);

    // wait for the signal
    let (lock, cvar) = &*pair;
    let _stop = cvar.wait_while(lock.lock().unwrap(), |s| !*s).expect("mutex poisoned");

    info!("unmounting rofs...");
    drop(session);
    // final writeback so nothing dirty is left behind
    manager.shutdown(&engine);
    info!("rofs unmounted");
}
