//! The cache engine: materializes remote objects into a local on-disk cache,
//! absorbs writes as dirty blocks, and reconciles with the remote store.
//!
//! Layout on disk (under the configured cache root):
//!   data/{hh[0:2]}/{hh[2:4]}/{hh}/part_NNNNNNNN        object parts
//!   bitmap/{hh[0:2]}/{hh[2:4]}/{hh}/part_NNNNNNNN.bmp  packed dirty bitmaps
//!   metadata.db                                         sqlite index

pub mod bitmap;
pub mod engine;
pub mod layout;
pub mod manager;
pub mod store;

pub use bitmap::Bitmap;
pub use engine::CacheEngine;
pub use manager::Manager;
pub use store::MetaStore;
