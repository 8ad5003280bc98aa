//! Builds a fresh filesystem image on a blank block device.
//!
//! Lays out the superblock, log area, inode table, and both bitmaps directly against the device
//! (there is no mounted filesystem yet to route these writes through), then mounts the result and
//! uses the ordinary runtime path — [`FileSystem::ialloc`], [`crate::fs::dir::dirlink`], the full
//! block-map translator — to seed the root directory and any initial files. This is more general
//! than the original image builder, whose own file-append routine only understood direct and
//! single-indirect blocks: by reusing the mounted runtime instead of re-implementing block
//! placement, seeded files are bounded only by `MAXFILE`, the same as any file written later.

use std::sync::Arc;

use zerocopy::AsBytes;

use crate::device::BlockDevice;
use crate::error::FsResult;
use crate::fs::inode::{self, InodeType};
use crate::fs::{dir, SuperblockDisk, SUPERBLOCK_NO};
use crate::fs::FileSystem;
use crate::param::{BPB, BSIZE, FSMAGIC, LOGSIZE, ROOTINO};

fn mark_bits_used(device: &Arc<dyn BlockDevice>, bitmap_start: u32, first: u32, count: u32) {
    for i in first..first + count {
        let block_no = bitmap_start + i / BPB;
        let mut data = [0u8; BSIZE];
        device.read_block(block_no, &mut data);
        let bit = (i % BPB) as usize;
        data[bit / 8] |= 1 << (bit % 8);
        device.write_block(block_no, &data);
    }
}

fn write_superblock(device: &Arc<dyn BlockDevice>, sb: &SuperblockDisk) {
    let mut bytes = [0u8; BSIZE];
    let size = core::mem::size_of::<SuperblockDisk>();
    bytes[..size].copy_from_slice(sb.as_bytes());
    device.write_block(SUPERBLOCK_NO, &bytes);
}

/// Zeroes `device` end to end and writes a fresh, empty filesystem with room for `ninodes`
/// inodes: a superblock, an empty log, an inode table, both bitmaps (with every block that isn't
/// a data block pre-marked used), and a root directory containing only `.` and `..`. Returns the
/// freshly mounted handle.
///
/// Panics if `device` is too small to hold its own metadata plus at least one data block.
pub fn build_image(device: &Arc<dyn BlockDevice>, ninodes: u32) -> Arc<FileSystem> {
    let nblocks = device.num_blocks();
    let zero = [0u8; BSIZE];
    for b in 0..nblocks {
        device.write_block(b, &zero);
    }

    let log_start = 2u32;
    let nlog = LOGSIZE as u32;
    let ipb = inode::inodes_per_block();
    let inode_blocks = (ninodes + ipb - 1) / ipb;
    let inodestart = log_start + nlog;
    let bmap_blocks = (nblocks + BPB - 1) / BPB;
    let bmapstart = inodestart + inode_blocks;
    let ibmap_blocks = (ninodes + BPB - 1) / BPB;
    let ibmapstart = bmapstart + bmap_blocks;
    let data_start = ibmapstart + ibmap_blocks;
    assert!(data_start < nblocks, "mkfs: image too small to hold {ninodes} inodes' worth of metadata");

    let sb = SuperblockDisk {
        magic: FSMAGIC,
        size: nblocks,
        nblocks: nblocks - data_start,
        ninodes,
        nlog,
        logstart: log_start,
        inodestart,
        bmapstart,
        ibmapstart,
        free_inodes: ninodes - 1,
        free_blocks: nblocks - data_start,
    };

    // Every block before `data_start` (boot block, superblock, log, inode table, both bitmaps)
    // is covered by the data bitmap too, so it must be marked used or a later `alloc_block` would
    // hand it out as if it were free.
    mark_bits_used(device, bmapstart, 0, data_start);
    // Inode 0 is never allocated; marking it used keeps the bitmap consistent with that, even
    // though `alloc_inode` already skips it unconditionally.
    mark_bits_used(device, ibmapstart, 0, 1);

    write_superblock(device, &sb);

    let fs = FileSystem::mount(device.clone());
    let tx = fs.begin_transaction();
    let root = fs.ialloc(&tx, InodeType::Dir).expect("mkfs: allocating the root inode");
    assert_eq!(root.inum, ROOTINO, "mkfs: root must be allocated as inode number 1");
    {
        let mut guard = root.lock();
        dir::init_empty(&mut guard, ROOTINO, ROOTINO, &tx);
    }
    drop(tx);
    fs
}

/// Creates a regular file named `name` in the root directory with the given content. A thin
/// convenience wrapper over the same path a running filesystem would use to create a file; kept
/// here because image-building callers (and this crate's own tests) tend to want it.
pub fn add_file(fs: &Arc<FileSystem>, name: &str, content: &[u8]) -> FsResult<()> {
    let tx = fs.begin_transaction();
    let file = fs.ialloc(&tx, InodeType::File)?;
    {
        let mut guard = file.lock();
        guard.write(0, content, &tx)?;
    }
    let root = fs.root();
    {
        let mut root_guard = root.lock();
        dir::dirlink(&mut root_guard, name, file.inum, &tx, fs)?;
    }
    Ok(())
}
