//! Superblock service and the bitmap allocators for data blocks and inodes.
//!
//! Five layers make up this crate, from the device up: blocks (this module and [`crate::bio`]),
//! log ([`crate::log`]), inodes ([`inode`]), directories ([`dir`]), and names ([`path`]). Each
//! layer depends only on the one below it.

pub mod dir;
pub mod inode;
pub mod path;
pub mod stat;

use std::sync::Arc;

use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::device::BlockDevice;
use crate::error::{FsError, FsResult};
use crate::lock::Spinlock;
use crate::log::{FsTransaction, Log};
use crate::param::{BPB, BSIZE, FSMAGIC};

use inode::Itable;

/// On-disk, fixed-position description of the image's layout and free-space counters.
///
/// Field order matches the original layout exactly (inode bitmap before the inode table, which
/// both precede the data bitmap) so images produced by [`crate::mkfs`] and images read at mount
/// agree without a translation step.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct SuperblockDisk {
    pub magic: u32,
    pub size: u32,
    pub nblocks: u32,
    pub ninodes: u32,
    pub nlog: u32,
    pub logstart: u32,
    pub inodestart: u32,
    pub bmapstart: u32,
    pub ibmapstart: u32,
    pub free_inodes: u32,
    pub free_blocks: u32,
}

/// Block number at which the superblock is always found.
pub const SUPERBLOCK_NO: u32 = 1;

impl SuperblockDisk {
    fn read(cache: &Bcache) -> Self {
        let bytes = cache.read_through(SUPERBLOCK_NO);
        let mut sb = SuperblockDisk::new_zeroed();
        let size = core::mem::size_of::<SuperblockDisk>();
        sb.as_bytes_mut().copy_from_slice(&bytes[..size]);
        assert_eq!(sb.magic, FSMAGIC, "bad filesystem magic number");
        sb
    }

    fn write(&self, cache: &Bcache) {
        let mut bytes = [0u8; BSIZE];
        let size = core::mem::size_of::<SuperblockDisk>();
        bytes[..size].copy_from_slice(self.as_bytes());
        cache.write_through(SUPERBLOCK_NO, &bytes);
    }

    pub fn inode_block(&self, inum: u32) -> u32 {
        self.inodestart + inum / inode::inodes_per_block()
    }

    pub fn bitmap_block(&self, block_no: u32) -> u32 {
        self.bmapstart + block_no / BPB
    }

    pub fn ibitmap_block(&self, inum: u32) -> u32 {
        self.ibmapstart + inum / BPB
    }
}

/// A mounted filesystem: superblock, free-space counters, the in-memory inode table, and the
/// journal that makes writes to all three crash-atomic.
///
/// Exposed as a handle rather than a process-wide singleton (unlike the kernel this design is
/// based on) so a test binary can mount more than one image in a single run.
pub struct FileSystem {
    pub(crate) cache: Bcache,
    pub(crate) log: Arc<Log>,
    sb: Spinlock<SuperblockDisk>,
    pub(crate) itable: Itable,
}

impl FileSystem {
    /// Mounts the filesystem found on `device`, replaying any pending journal transaction first.
    pub fn mount(device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let cache = Bcache::new(device);
        let sb = SuperblockDisk::read(&cache);
        let log = Log::new(cache.clone(), sb.logstart, sb.nlog as usize);
        Arc::new(FileSystem { cache, log, sb: Spinlock::new(sb), itable: Itable::new() })
    }

    pub fn superblock(&self) -> SuperblockDisk {
        *self.sb.lock()
    }

    /// Starts one filesystem operation; the returned guard commits the transaction (if it is the
    /// last one outstanding) when dropped.
    pub fn begin_transaction(&self) -> FsTransaction<'_> {
        FsTransaction::begin(&self.log)
    }

    fn zero_block(&self, tx: &FsTransaction<'_>, block_no: u32) {
        let buf = self.cache.read(block_no);
        buf.with_data_mut(|data| data.fill(0));
        tx.write(&buf);
    }

    /// Allocates and zeroes a free data block. Panics if none remain: callers must check
    /// `free_blocks` (or be prepared to receive `Err(FsError::OutOfSpace)` from the layer above)
    /// before trying this, per the allocator's own fatal/recoverable split described for the
    /// directory growth path.
    pub fn alloc_block(&self, tx: &FsTransaction<'_>) -> FsResult<u32> {
        let sb = self.superblock();
        if sb.free_blocks == 0 {
            return Err(FsError::OutOfSpace);
        }

        for block_no in 0..sb.size {
            let bitmap_bno = sb.bitmap_block(block_no);
            let buf = self.cache.read(bitmap_bno);
            let bit = (block_no % BPB) as usize;
            let found = buf.with_data_mut(|data| {
                let byte = &mut data[bit / 8];
                if *byte & (1 << (bit % 8)) == 0 {
                    *byte |= 1 << (bit % 8);
                    true
                } else {
                    false
                }
            });
            if found {
                tx.write(&buf);
                drop(buf);
                self.adjust_free_blocks(-1);
                self.zero_block(tx, block_no);
                return Ok(block_no);
            }
        }

        unreachable!("free_blocks counter said a block was available but the bitmap is full");
    }

    /// Frees a previously allocated data block. A double free is a consistency violation, not a
    /// recoverable error, and aborts.
    pub fn free_block(&self, tx: &FsTransaction<'_>, block_no: u32) {
        let sb = self.superblock();
        let bitmap_bno = sb.bitmap_block(block_no);
        let buf = self.cache.read(bitmap_bno);
        let bit = (block_no % BPB) as usize;
        buf.with_data_mut(|data| {
            let byte = &mut data[bit / 8];
            assert_ne!(*byte & (1 << (bit % 8)), 0, "freeing a free block");
            *byte &= !(1 << (bit % 8));
        });
        tx.write(&buf);
        self.adjust_free_blocks(1);
    }

    fn adjust_free_blocks(&self, delta: i64) {
        let mut sb = self.sb.lock();
        sb.free_blocks = (sb.free_blocks as i64 + delta) as u32;
        sb.write(&self.cache);
    }

    /// Allocates a free inode number of the given kind. Returns `Err(FsError::OutOfInodes)` if
    /// the image has none left.
    pub fn alloc_inode(&self, tx: &FsTransaction<'_>, kind: inode::InodeType) -> FsResult<u32> {
        let sb = self.superblock();
        if sb.free_inodes == 0 {
            return Err(FsError::OutOfInodes);
        }

        for inum in 1..sb.ninodes {
            let ibitmap_bno = sb.ibitmap_block(inum);
            let buf = self.cache.read(ibitmap_bno);
            let bit = (inum % BPB) as usize;
            let found = buf.with_data_mut(|data| {
                let byte = &mut data[bit / 8];
                if *byte & (1 << (bit % 8)) == 0 {
                    *byte |= 1 << (bit % 8);
                    true
                } else {
                    false
                }
            });
            if found {
                tx.write(&buf);
                drop(buf);
                self.adjust_free_inodes(-1);
                inode::init_on_disk(self, tx, inum, kind);
                return Ok(inum);
            }
        }

        unreachable!("free_inodes counter said an inode was available but the bitmap is full");
    }

    /// Frees a previously allocated inode number. Freeing one that is already free is a
    /// consistency violation.
    pub fn free_inode(&self, tx: &FsTransaction<'_>, inum: u32) {
        let sb = self.superblock();
        let ibitmap_bno = sb.ibitmap_block(inum);
        let buf = self.cache.read(ibitmap_bno);
        let bit = (inum % BPB) as usize;
        buf.with_data_mut(|data| {
            let byte = &mut data[bit / 8];
            assert_ne!(*byte & (1 << (bit % 8)), 0, "freeing a free inode");
            *byte &= !(1 << (bit % 8));
        });
        tx.write(&buf);
        self.adjust_free_inodes(1);
    }

    fn adjust_free_inodes(&self, delta: i64) {
        let mut sb = self.sb.lock();
        sb.free_inodes = (sb.free_inodes as i64 + delta) as u32;
        sb.write(&self.cache);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::mkfs::build_image;
    use crate::fs::inode::InodeType;

    fn mounted(nblocks: u32, ninodes: u32) -> Arc<FileSystem> {
        let device: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDevice::new(nblocks));
        build_image(&device, ninodes)
    }

    #[test]
    fn alloc_then_free_block_restores_the_counter_and_bitmap() {
        let fs = mounted(2000, 64);
        let before = fs.superblock().free_blocks;

        let tx = fs.begin_transaction();
        let bno = fs.alloc_block(&tx).unwrap();
        assert_eq!(fs.superblock().free_blocks, before - 1);
        fs.free_block(&tx, bno);
        drop(tx);

        assert_eq!(fs.superblock().free_blocks, before);
    }

    #[test]
    fn alloc_block_returns_a_freshly_zeroed_block() {
        let fs = mounted(2000, 64);
        let tx = fs.begin_transaction();
        let bno = fs.alloc_block(&tx).unwrap();
        let buf = fs.cache.read(bno);
        buf.with_data(|data| assert!(data.iter().all(|&b| b == 0)));
    }

    #[test]
    #[should_panic(expected = "freeing a free block")]
    fn double_free_of_a_data_block_is_fatal() {
        let fs = mounted(2000, 64);
        let tx = fs.begin_transaction();
        let bno = fs.alloc_block(&tx).unwrap();
        fs.free_block(&tx, bno);
        fs.free_block(&tx, bno);
    }

    #[test]
    fn alloc_block_reports_out_of_space_once_the_device_is_full() {
        // Small device: metadata eats most of it, leaving only a few data blocks.
        let fs = mounted(40, 8);
        let tx = fs.begin_transaction();
        let mut allocated = Vec::new();
        loop {
            match fs.alloc_block(&tx) {
                Ok(bno) => allocated.push(bno),
                Err(FsError::OutOfSpace) => break,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert!(!allocated.is_empty());
        assert_eq!(fs.superblock().free_blocks, 0);
    }

    #[test]
    fn alloc_inode_decrements_free_inodes_and_ialloc_round_trips_with_drop() {
        let fs = mounted(2000, 64);
        let before = fs.superblock().free_inodes;
        {
            let tx = fs.begin_transaction();
            let file = fs.ialloc(&tx, InodeType::File).unwrap();
            assert_eq!(fs.superblock().free_inodes, before - 1);
            // Link count starts at 1 on a freshly allocated inode; drop it back to 0 so the
            // handle's drop path reclaims the inode number.
            {
                let mut guard = file.lock();
                guard.nlink = 0;
                guard.update(&tx);
            }
        }
        assert_eq!(fs.superblock().free_inodes, before);
    }
}
