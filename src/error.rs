//! Recoverable failures a caller can match on.
//!
//! Consistency violations (a double free on a bitmap bit, a table with no free slot, an address
//! beyond the file's layout) are not part of this type: those abort via `panic!`/`assert!` at the
//! point of detection, per the class-1/class-2 split described in the design notes.

use std::fmt;

/// Every recoverable failure this crate's public operations can return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    /// No inode bears the requested name in this directory.
    NotFound,
    /// An entry with this name already exists.
    AlreadyExists,
    /// Expected a directory, found something else.
    NotADirectory,
    /// Expected a non-directory, found a directory.
    IsADirectory,
    /// Read or write offset is out of range for the file.
    BadOffset,
    /// Write would grow the file past `MAXFILE` blocks.
    FileTooLarge,
    /// Symlink resolution exceeded the hop cap.
    SymlinkLoop,
    /// A directory's primary bucket and overflow region are both exhausted.
    DirectoryFull,
    /// No free data block remains on this device.
    OutOfSpace,
    /// No free inode remains on this device.
    OutOfInodes,
    /// A caller-supplied buffer ended before the requested transfer completed.
    CopyFault { transferred: usize },
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::AlreadyExists => write!(f, "file exists"),
            FsError::NotADirectory => write!(f, "not a directory"),
            FsError::IsADirectory => write!(f, "is a directory"),
            FsError::BadOffset => write!(f, "offset out of range"),
            FsError::FileTooLarge => write!(f, "file too large"),
            FsError::SymlinkLoop => write!(f, "too many levels of symbolic links"),
            FsError::DirectoryFull => write!(f, "directory is full"),
            FsError::OutOfSpace => write!(f, "no space left on device"),
            FsError::OutOfInodes => write!(f, "no free inodes left on device"),
            FsError::CopyFault { transferred } => {
                write!(f, "copy fault after {transferred} bytes")
            }
        }
    }
}

impl std::error::Error for FsError {}

/// Shorthand used throughout the crate's public surface.
pub type FsResult<T> = Result<T, FsError>;
