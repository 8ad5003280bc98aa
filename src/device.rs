//! The block device boundary. Spec-external in the original design (the disk driver is a
//! collaborator, not something this crate implements) but given a real, small implementation here
//! so the rest of the crate is testable without a kernel underneath it.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Mutex;

use crate::param::BSIZE;

/// Anything that can serve fixed-size blocks by number.
///
/// Implementations are expected to be internally synchronized: the buffer cache may call
/// `read_block`/`write_block` from multiple threads.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block_no: u32, buf: &mut [u8; BSIZE]);
    fn write_block(&self, block_no: u32, buf: &[u8; BSIZE]);
    fn num_blocks(&self) -> u32;
}

/// A device backed by an in-process byte buffer. Used by the test suite and by
/// [`crate::mkfs::build_image`] when no image file is wanted.
pub struct MemDevice {
    blocks: Mutex<Vec<[u8; BSIZE]>>,
}

impl MemDevice {
    pub fn new(num_blocks: u32) -> Self {
        MemDevice { blocks: Mutex::new(vec![[0u8; BSIZE]; num_blocks as usize]) }
    }
}

impl BlockDevice for MemDevice {
    fn read_block(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        let blocks = self.blocks.lock().unwrap();
        buf.copy_from_slice(&blocks[block_no as usize]);
    }

    fn write_block(&self, block_no: u32, buf: &[u8; BSIZE]) {
        let mut blocks = self.blocks.lock().unwrap();
        blocks[block_no as usize].copy_from_slice(buf);
    }

    fn num_blocks(&self) -> u32 {
        self.blocks.lock().unwrap().len() as u32
    }
}

/// A device backed by a regular file, sized to an exact multiple of `BSIZE` at construction.
pub struct FileDevice {
    file: Mutex<File>,
    num_blocks: u32,
}

impl FileDevice {
    /// Opens (creating if absent) `path` and extends it to `num_blocks` blocks.
    pub fn open(path: &std::path::Path, num_blocks: u32) -> io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        file.set_len((num_blocks as u64) * (BSIZE as u64))?;
        Ok(FileDevice { file: Mutex::new(file), num_blocks })
    }
}

impl BlockDevice for FileDevice {
    fn read_block(&self, block_no: u32, buf: &mut [u8; BSIZE]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_no as u64) * (BSIZE as u64))).expect("seek failed");
        file.read_exact(buf).expect("block read failed");
    }

    fn write_block(&self, block_no: u32, buf: &[u8; BSIZE]) {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start((block_no as u64) * (BSIZE as u64))).expect("seek failed");
        file.write_all(buf).expect("block write failed");
    }

    fn num_blocks(&self) -> u32 {
        self.num_blocks
    }
}
