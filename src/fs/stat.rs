//! Metadata snapshot returned by [`crate::fs::inode::InodeGuard::stat`].

use crate::fs::inode::InodeType;

/// A point-in-time copy of an inode's metadata.
///
/// Unlike [`crate::fs::inode::Dinode`] this is never written back to disk, so it carries no
/// on-disk layout obligations: fields are whatever shape is convenient for a caller, including
/// the extended mode triple (`rw_mode`/`super_mode`/`show_mode`) the original layout keeps
/// alongside the standard Unix fields.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Stat {
    pub dev: i32,
    pub ino: u32,
    pub kind: InodeType,
    pub nlink: u16,
    pub size: u64,
    pub rw_mode: u32,
    pub super_mode: u32,
    pub show_mode: u32,
}
