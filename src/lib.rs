//! Crash-consistent, block-structured on-disk filesystem with hash-indexed directories and an
//! extent block-mapping mode for files that opt into it.
//!
//! Five layers, each depending only on the one below: [`device`] (the block device boundary),
//! [`bio`] (the buffer cache), [`log`] (the write-ahead journal that makes groups of block writes
//! crash-atomic), [`fs::inode`] (inodes and their block maps), [`fs::dir`] (the hash-indexed
//! directory format built out of inodes), and [`fs::path`] (turning a string into a directory
//! walk). [`fs::FileSystem`] is the handle tying a mounted image's superblock, journal, and inode
//! table together; [`mkfs`] builds a fresh image from nothing.

pub mod bio;
pub mod device;
pub mod error;
pub mod fs;
pub mod lock;
pub mod log;
pub mod mkfs;
pub mod param;

pub use device::{BlockDevice, FileDevice, MemDevice};
pub use error::{FsError, FsResult};
pub use fs::dir::{dirlink, dirlookup, dirunlink};
pub use fs::inode::{InodeGuard, InodeType, RcInode};
pub use fs::path::{namei, namei_nofollow, nameiparent};
pub use fs::stat::Stat;
pub use fs::FileSystem;
