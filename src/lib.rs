//! A small fixed-geometry filesystem over sector-granular block storage.
//!
//! The pieces, bottom up:
//! 1. Sector device: trait for raw sector I/O, with a file-backed emulator
//!    for development and testing.
//! 2. Free map: one bit per sector, first-fit allocation.
//! 3. File header: a pointer tree of up to four indirection levels mapping
//!    byte offsets to sectors; depth is chosen from the file's size.
//! 4. Directory: a fixed-capacity name table, itself stored as ordinary
//!    file content through a header.
//! 5. `SectorFs`: path resolution, create/open/remove/list, and the open
//!    descriptor table over the two bootstrap files.
//!
//! Byte-granular reads and writes are intentionally not provided here; a
//! transfer layer above this crate turns offsets into sectors through
//! [`SectorFs::sector_for`] and moves the bytes itself.

mod alloc;
mod dir;
mod error;
mod fs;
pub mod io;
mod node;

pub use crate::alloc::FreeMap;
pub use crate::dir::{Directory, EntryKind, ListEntry, NAME_MAX_LEN, NUM_DIR_ENTRIES};
pub use crate::error::{FsError, Result};
pub use crate::fs::{
    Fd, SectorFs, FREE_MAP_SECTOR, NUM_SECTORS, PATH_MAX_DEPTH, ROOT_DIR_SECTOR, SECTOR_SIZE,
};
pub use crate::node::{
    capacity_bytes, capacity_sectors, level_for, FileHeader, MAX_LEVEL, NUM_HEADER_POINTERS,
    NUM_INDIRECT_POINTERS,
};
