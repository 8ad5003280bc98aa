//! Buffer cache: a fixed-size, reference-counted, lockable window onto disk blocks.
//!
//! Every read and write to the device passes through here so in-flight writers and readers of the
//! same block observe one consistent copy. The cache never writes a dirty block back to the
//! device on its own; that only happens when the journal installs a committed transaction (or, for
//! the handful of blocks that are never logged, via [`Bcache::write_through`]).

use std::sync::{Arc, Mutex};

use crate::device::BlockDevice;
use crate::param::{BSIZE, NBUF};

struct Slot {
    block_no: Option<u32>,
    refcnt: usize,
    data: [u8; BSIZE],
    use_tick: u64,
}

impl Slot {
    fn empty() -> Self {
        Slot { block_no: None, refcnt: 0, data: [0u8; BSIZE], use_tick: 0 }
    }
}

struct Inner {
    device: Arc<dyn BlockDevice>,
    slots: Mutex<Vec<Slot>>,
    tick: Mutex<u64>,
}

/// The buffer cache proper. Cheaply clonable; every [`Buf`] keeps the cache alive.
#[derive(Clone)]
pub struct Bcache {
    inner: Arc<Inner>,
}

impl Bcache {
    pub fn new(device: Arc<dyn BlockDevice>) -> Self {
        let slots = (0..NBUF).map(|_| Slot::empty()).collect();
        Bcache { inner: Arc::new(Inner { device, slots: Mutex::new(slots), tick: Mutex::new(0) }) }
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.inner.device
    }

    fn next_tick(&self) -> u64 {
        let mut tick = self.inner.tick.lock().unwrap();
        *tick += 1;
        *tick
    }

    /// Returns a handle to `block_no`, loading it from the device on a cache miss.
    pub fn read(&self, block_no: u32) -> Buf {
        let tick = self.next_tick();
        let mut slots = self.inner.slots.lock().unwrap();

        if let Some(index) = slots.iter().position(|s| s.block_no == Some(block_no)) {
            slots[index].refcnt += 1;
            slots[index].use_tick = tick;
            return Buf { bno: block_no, index, cache: self.clone() };
        }

        let index = slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.refcnt == 0)
            .min_by_key(|(_, s)| s.use_tick)
            .map(|(i, _)| i)
            .expect("bcache: no free buffer slots");

        let mut data = [0u8; BSIZE];
        self.inner.device.read_block(block_no, &mut data);
        slots[index] = Slot { block_no: Some(block_no), refcnt: 1, data, use_tick: tick };

        Buf { bno: block_no, index, cache: self.clone() }
    }

    /// Writes `data` to `block_no` both in the cache (if resident) and on the device immediately.
    /// Used for blocks that bypass the journal: the superblock-free boot sector and the journal's
    /// own header and log-area writes.
    pub fn write_through(&self, block_no: u32, data: &[u8; BSIZE]) {
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.iter_mut().find(|s| s.block_no == Some(block_no)) {
            slot.data = *data;
        }
        drop(slots);
        self.inner.device.write_block(block_no, data);
    }

    pub fn read_through(&self, block_no: u32) -> [u8; BSIZE] {
        let slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.iter().find(|s| s.block_no == Some(block_no)) {
            return slot.data;
        }
        drop(slots);
        let mut data = [0u8; BSIZE];
        self.inner.device.read_block(block_no, &mut data);
        data
    }

    fn release(&self, index: usize) {
        let mut slots = self.inner.slots.lock().unwrap();
        slots[index].refcnt -= 1;
    }
}

/// A referenced, in-memory copy of one disk block.
pub struct Buf {
    bno: u32,
    index: usize,
    cache: Bcache,
}

impl Buf {
    pub fn block_no(&self) -> u32 {
        self.bno
    }

    pub fn with_data<R>(&self, f: impl FnOnce(&[u8; BSIZE]) -> R) -> R {
        let slots = self.cache.inner.slots.lock().unwrap();
        f(&slots[self.index].data)
    }

    pub fn with_data_mut<R>(&self, f: impl FnOnce(&mut [u8; BSIZE]) -> R) -> R {
        let mut slots = self.cache.inner.slots.lock().unwrap();
        f(&mut slots[self.index].data)
    }

}

impl Drop for Buf {
    fn drop(&mut self) {
        self.cache.release(self.index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;

    #[test]
    fn read_caches_a_block_so_a_second_read_sees_uncommitted_changes() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(16));
        let cache = Bcache::new(device);

        let buf = cache.read(3);
        buf.with_data_mut(|d| d[0] = 0x42);
        drop(buf);

        let buf = cache.read(3);
        buf.with_data(|d| assert_eq!(d[0], 0x42));
    }

    #[test]
    fn write_through_updates_both_the_cache_and_the_device_immediately() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(16));
        let cache = Bcache::new(device.clone());

        let mut data = [0u8; BSIZE];
        data[0] = 0x7;
        cache.write_through(5, &data);

        let mut on_device = [0u8; BSIZE];
        device.read_block(5, &mut on_device);
        assert_eq!(on_device[0], 0x7);
        assert_eq!(cache.read_through(5)[0], 0x7);
    }

    #[test]
    fn evicts_the_least_recently_used_unreferenced_slot_once_full() {
        let device: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(NBUF as u32 + 4));
        let cache = Bcache::new(device);

        // Fill every slot, then release all of them so they are eviction candidates.
        for bno in 0..NBUF as u32 {
            drop(cache.read(bno));
        }
        // One more distinct block must evict block 0 (least recently used) rather than panic.
        let buf = cache.read(NBUF as u32);
        assert_eq!(buf.block_no(), NBUF as u32);
    }
}
