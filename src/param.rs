//! Layout and capacity constants shared by every storage module.
//!
//! Values are split between two lineages: the small in-memory limits (`NINODE`, `MAXOPBLOCKS`,
//! `LOGSIZE`, ...) come from the teaching kernel's `param.rs`; the on-disk layout numbers
//! (`NDIRECT`, hash bucket count, overflow range, `MAXFSIZE`) come from the hash-indexed directory
//! design and are new relative to that kernel's single-indirect filesystem.

use static_assertions::const_assert;

/// Bytes per disk block.
pub const BSIZE: usize = 1024;

/// Directory entry name length, not including a terminator.
pub const DIRSIZ: usize = 14;

/// Direct block pointers kept inline in an inode.
pub const NDIRECT: usize = 12;

/// Block pointers that fit in one indirect block.
pub const NINDIRECT: usize = BSIZE / core::mem::size_of::<u32>();

/// Maximum file size in blocks: direct + single + double + triple indirect.
pub const MAXFILE: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT + NINDIRECT * NINDIRECT * NINDIRECT;

/// Magic number stamped into the superblock.
pub const FSMAGIC: u32 = 0x10203040;

/// Inode number of the root directory.
pub const ROOTINO: u32 = 1;

/// Bits addressed by one bitmap block.
pub const BPB: u32 = (BSIZE * 8) as u32;

/// Number of hash buckets in a directory's primary area.
pub const HASHRANGE: u32 = 443;

/// First logical block of the primary hash area (block 0 holds `.`/`..`).
pub const HASH_AREA_START: u32 = 1;

/// Dirents per bucket.
pub const BUCKET_DIRENTS: usize = 16;

/// Encoded size of one directory entry: a 2-byte inode number plus a `DIRSIZ`-byte name field.
pub const DIRENT_SIZE: u32 = 16;

/// Added to a name's hash to get its bucket index; keeps bucket 0 from aliasing block 0 (which
/// holds the fixed `.`/`..` entries rather than a hashed bucket).
pub const BUCKET_INDEX_OFFSET: u32 = 16;

/// First logical block of the directory overflow area.
pub const OVERFLOW_BLOCK_START: u32 = 113;

/// One past the last logical block of the directory overflow area.
pub const OVERFLOW_BLOCK_END: u32 = 115;

/// Maximum directory size, in blocks. Larger than the primary + overflow area actually in use;
/// the remainder is unused headroom inherited from the original layout.
pub const MAXFSIZE_BLOCKS: u32 = 119;

/// In-memory inode table capacity.
pub const NINODE: usize = 50;

/// Maximum distinct blocks a single filesystem operation may write before it must commit.
pub const MAXOPBLOCKS: usize = 10;

/// Log capacity in blocks.
pub const LOGSIZE: usize = MAXOPBLOCKS * 3;

/// Buffer cache capacity in blocks.
pub const NBUF: usize = LOGSIZE;

/// Longest path this crate will resolve, including the terminator budget.
pub const MAXPATH: usize = 128;

/// Maximum symlink hops `fs::path::dive` will follow before giving up.
pub const MAX_SYMLINK_DEPTH: u32 = 10;

const_assert!(NINDIRECT > 0);
// The primary hash area (buckets 0..HASHRANGE, 16 dirents of 16 bytes each) must fit in the
// blocks before the overflow area starts.
const_assert!((HASHRANGE as usize) * BUCKET_DIRENTS * 16 <= (OVERFLOW_BLOCK_START as usize) * BSIZE);
