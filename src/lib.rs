//! littlefs image toolkit
//!
//! An engine for reading and writing littlefs filesystem images directly
//! against a flat backing store (a file or partition dump), without a
//! mounted driver. Images are manipulated the way a tar tool manipulates
//! an archive (list, extract, create, append, delete) while preserving
//! the format's redundancy and consistency invariants on every mutation.
//!
//! ## Layout of an image
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ Blocks 0-1: superblock metadata pair          │
//! │  - magic "littlefs", version, geometry        │
//! │  - root directory pair address                │
//! ├───────────────────────────────────────────────┤
//! │ Blocks 2-3: root directory metadata pair      │
//! │  - tagged entry log, CRC-closed commits       │
//! ├───────────────────────────────────────────────┤
//! │ Data blocks: CTZ skip-list chains             │
//! │  - payload + ctz(i)+1 back-pointers per block │
//! │  - small files live inline in metadata        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`error`] - error taxonomy for image operations
//! - [`store`] - block addressing over the backing store, autodetection
//! - [`superblock`] - root record: magic, version, geometry, limits
//! - [`tag`] - tagged records of the metadata commit log
//! - [`metadata`] - redundant pairs: commit, compaction, torn recovery
//! - [`dir`] - directory tree resolution and enumeration
//! - [`ctz`] - CTZ skip-list file storage
//! - [`alloc`] - per-operation free-block allocation
//! - [`engine`] - create / append / list / extract / delete
//!
//! ## Example
//!
//! ```rust,no_run
//! use lfstool::{ImageEngine, Result};
//!
//! fn main() -> Result<()> {
//!     let mut engine = ImageEngine::open("disk.img", None, None)?;
//!     for entry in engine.list()? {
//!         println!("{} ({} bytes)", entry.path, entry.size);
//!     }
//!     Ok(())
//! }
//! ```

pub mod alloc;
pub mod ctz;
pub mod dir;
pub mod engine;
pub mod error;
pub mod metadata;
pub mod store;
pub mod superblock;
pub mod tag;

pub use alloc::BlockAllocator;
pub use engine::{ImageEngine, ListEntry, OpReport};
pub use error::{LfsError, Result};
pub use metadata::{DirEntry, EntryData, MetadataPair, PairAddr};
pub use store::{BlockStore, Geometry};
pub use superblock::Superblock;

/// Toolkit version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
