//! Write-ahead log: groups the writes of one filesystem operation into a single, crash-atomic
//! transaction.
//!
//! A writer calls [`Log::begin_op`], mutates buffers, routes every dirty one through
//! [`Log::write`], and lets the returned [`FsTransaction`] guard call `end_op` on drop. When the
//! last concurrently outstanding operation ends, the log commits: it copies the dirty blocks to a
//! reserved log area, writes a header recording which blocks were logged (the true commit point),
//! installs each block to its home location, then erases the header.

use std::sync::{Arc, Condvar, Mutex};

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::bio::Bcache;
use crate::param::{BSIZE, LOGSIZE};

#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct LogHeaderDisk {
    n: u32,
    block: [u32; LOGSIZE],
}

const_assert!(core::mem::size_of::<LogHeaderDisk>() < BSIZE);

struct State {
    outstanding: usize,
    committing: bool,
    blocks: ArrayVec<u32, LOGSIZE>,
}

/// The journal for one mounted filesystem.
pub struct Log {
    cache: Bcache,
    start: u32,
    size: usize,
    state: Mutex<State>,
    cond: Condvar,
}

impl Log {
    /// Opens the log area `[start, start+size)` and replays any committed-but-not-installed
    /// transaction left behind by a prior crash.
    pub fn new(cache: Bcache, start: u32, size: usize) -> Arc<Self> {
        assert!(size <= LOGSIZE, "log area larger than LOGSIZE");
        let log = Arc::new(Log {
            cache,
            start,
            size,
            state: Mutex::new(State { outstanding: 0, committing: false, blocks: ArrayVec::new() }),
            cond: Condvar::new(),
        });
        log.recover_from_log();
        log
    }

    fn header_block_no(&self) -> u32 {
        self.start
    }

    fn read_head(&self) -> ArrayVec<u32, LOGSIZE> {
        let bytes = self.cache.read_through(self.header_block_no());
        let mut header = LogHeaderDisk { n: 0, block: [0; LOGSIZE] };
        let header_size = core::mem::size_of::<LogHeaderDisk>();
        header.as_bytes_mut().copy_from_slice(&bytes[..header_size]);
        header.block[..header.n as usize].iter().copied().collect()
    }

    fn write_head(&self, blocks: &[u32]) {
        let mut header = LogHeaderDisk { n: blocks.len() as u32, block: [0; LOGSIZE] };
        header.block[..blocks.len()].copy_from_slice(blocks);
        let mut bytes = [0u8; BSIZE];
        let header_size = core::mem::size_of::<LogHeaderDisk>();
        bytes[..header_size].copy_from_slice(header.as_bytes());
        self.cache.write_through(self.header_block_no(), &bytes);
    }

    /// Copies every logged block from the log area to its home location.
    fn install_trans(&self, blocks: &[u32]) {
        for (i, &home) in blocks.iter().enumerate() {
            let log_bno = self.start + 1 + i as u32;
            let data = self.cache.read_through(log_bno);
            self.cache.write_through(home, &data);
        }
    }

    fn recover_from_log(&self) {
        let blocks = self.read_head();
        if !blocks.is_empty() {
            self.install_trans(&blocks);
            self.write_head(&[]);
        }
    }

    /// Advisory: true once the log is close enough to full that a caller growing a file in a
    /// loop should flush the current transaction before continuing.
    pub fn is_full(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.blocks.len() + (state.outstanding + 1) * crate::param::MAXOPBLOCKS > self.size
    }

    /// Starts one filesystem operation, blocking while the log cannot yet guarantee room for it.
    pub fn begin_op(&self) {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.committing {
                state = self.cond.wait(state).unwrap();
            } else if state.blocks.len() + (state.outstanding + 1) * crate::param::MAXOPBLOCKS
                > self.size
            {
                state = self.cond.wait(state).unwrap();
            } else {
                state.outstanding += 1;
                break;
            }
        }
    }

    /// Ends one filesystem operation, committing the transaction if it was the last one
    /// outstanding.
    pub fn end_op(&self) {
        let mut do_commit = false;
        {
            let mut state = self.state.lock().unwrap();
            state.outstanding -= 1;
            assert!(!state.committing, "end_op: commit already in progress");
            if state.outstanding == 0 {
                do_commit = true;
                state.committing = true;
            } else {
                self.cond.notify_all();
            }
        }

        if do_commit {
            self.commit();
            let mut state = self.state.lock().unwrap();
            state.committing = false;
            self.cond.notify_all();
        }
    }

    /// Records that `block_no`'s in-cache content must be part of the current transaction.
    /// Absorbs duplicate writes to the same block within one transaction.
    pub fn write(&self, block_no: u32) {
        let mut state = self.state.lock().unwrap();
        assert!(state.outstanding >= 1, "log write outside a transaction");
        if !state.blocks.contains(&block_no) {
            assert!(state.blocks.len() < self.size - 1, "transaction too big for log");
            state.blocks.push(block_no);
        }
    }

    fn commit(&self) {
        let blocks: Vec<u32> = {
            let state = self.state.lock().unwrap();
            state.blocks.iter().copied().collect()
        };
        if blocks.is_empty() {
            return;
        }

        for (i, &bno) in blocks.iter().enumerate() {
            let data = self.cache.read_through(bno);
            self.cache.write_through(self.start + 1 + i as u32, &data);
        }

        self.write_head(&blocks);
        self.install_trans(&blocks);
        self.write_head(&[]);

        let mut state = self.state.lock().unwrap();
        state.blocks.clear();
    }
}

/// RAII guard for one filesystem operation: `Drop` calls [`Log::end_op`].
pub struct FsTransaction<'a> {
    log: &'a Log,
}

impl<'a> FsTransaction<'a> {
    pub fn begin(log: &'a Log) -> Self {
        log.begin_op();
        FsTransaction { log }
    }

    /// Marks a buffer's current content to be written through at commit time.
    pub fn write(&self, buf: &crate::bio::Buf) {
        self.log.write(buf.block_no());
    }

    /// If the log cannot safely absorb another full-sized operation's worth of writes, commits
    /// the current transaction and opens a fresh one in its place. Callers that allocate an
    /// unbounded number of blocks in a single logical operation (directory growth being the one
    /// case in this crate) must call this between allocations so no single transaction ever grows
    /// past the log's capacity.
    pub fn flush_if_log_full(&self) {
        if self.log.is_full() {
            self.log.end_op();
            self.log.begin_op();
        }
    }
}

impl Drop for FsTransaction<'_> {
    fn drop(&mut self) {
        self.log.end_op();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{BlockDevice, MemDevice};

    const LOG_START: u32 = 2;

    #[test]
    fn a_transaction_installs_its_writes_to_their_home_blocks() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(64));
        let cache = Bcache::new(device.clone());
        let log = Log::new(cache.clone(), LOG_START, LOGSIZE);

        {
            let tx = FsTransaction::begin(&log);
            let buf = cache.read(40);
            buf.with_data_mut(|d| d[0] = 0xab);
            tx.write(&buf);
        }

        let mut home = [0u8; BSIZE];
        device.read_block(40, &mut home);
        assert_eq!(home[0], 0xab);
    }

    #[test]
    fn duplicate_writes_to_the_same_block_in_one_transaction_are_absorbed() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(64));
        let cache = Bcache::new(device);
        let log = Log::new(cache.clone(), LOG_START, LOGSIZE);

        let tx = FsTransaction::begin(&log);
        for i in 0..5 {
            let buf = cache.read(40);
            buf.with_data_mut(|d| d[0] = i);
            tx.write(&buf);
        }
        let state = log.state.lock().unwrap();
        assert_eq!(state.blocks.len(), 1);
    }

    #[test]
    fn recovery_installs_a_transaction_a_crash_left_committed_but_not_installed() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(64));

        // Simulate a crash right after commit wrote the header and the logged copy, but before
        // (or during) installing it to block 40's home location: write the header claiming block
        // 40 is logged, and place the new content in the log's data area, while leaving block 40
        // itself at its old value.
        let mut header = [0u8; BSIZE];
        header[0..4].copy_from_slice(&1u32.to_le_bytes());
        header[4..8].copy_from_slice(&40u32.to_le_bytes());
        device.write_block(LOG_START, &header);

        let mut logged = [0u8; BSIZE];
        logged[0] = 0xcd;
        device.write_block(LOG_START + 1, &logged);

        let mut stale_home = [0u8; BSIZE];
        stale_home[0] = 0x00;
        device.write_block(40, &stale_home);

        // Mounting replays the log before any caller can observe the device.
        let cache = Bcache::new(device.clone());
        let _log = Log::new(cache, LOG_START, LOGSIZE);

        let mut home = [0u8; BSIZE];
        device.read_block(40, &mut home);
        assert_eq!(home[0], 0xcd, "recovery must install the logged block to its home location");

        let mut header_after = [0u8; BSIZE];
        device.read_block(LOG_START, &mut header_after);
        assert_eq!(
            u32::from_le_bytes(header_after[0..4].try_into().unwrap()),
            0,
            "recovery must clear the header once the transaction is installed"
        );
    }
}
