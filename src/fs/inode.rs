//! In-memory inode table and the on-disk inode format, including both block-mapping modes.
//!
//! Mirrors the buffer cache's shape one layer up: a fixed-size table of slots, each independently
//! lockable, reference-counted by [`RcInode`] handles rather than by the table itself. A slot's
//! metadata (which device/inum it holds, how many references exist) is protected by a spinlock
//! separate from the sleeplock guarding the inode's own fields, so looking a slot up never blocks
//! behind another thread's in-flight disk I/O on that slot.

use std::convert::TryInto;
use std::sync::{Arc, MutexGuard};

use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, FsResult};
use crate::fs::FileSystem;
use crate::lock::{Sleeplock, Spinlock};
use crate::log::FsTransaction;
use crate::param::{BSIZE, NDIRECT, NINDIRECT, NINODE};

/// Number of `(packed_pointer, first_logical_block)` pairs that fit in the address array when an
/// inode is in extent mode. One array slot (of `NDIRECT + 3`) is left unused since the array has
/// odd length.
pub const EXTENT_PAIRS: usize = (NDIRECT + 3) / 2;

/// Inode kinds, stored as the on-disk `type` field.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u16)]
pub enum InodeType {
    Unused = 0,
    Dir = 1,
    File = 2,
    Device = 3,
    Symlink = 4,
    /// A regular file whose address array is interpreted as extent pairs instead of the standard
    /// direct/indirect layout.
    ExtentFile = 5,
}

impl InodeType {
    fn from_disk(v: u16) -> Self {
        match v {
            0 => InodeType::Unused,
            1 => InodeType::Dir,
            2 => InodeType::File,
            3 => InodeType::Device,
            4 => InodeType::Symlink,
            5 => InodeType::ExtentFile,
            other => panic!("inode table: unrecognized on-disk type {other}"),
        }
    }
}

/// Read/write bits for the extended mode triple the original layout carries alongside the
/// standard Unix fields. Kept as plain bit constants rather than a `bitflags` type since nothing
/// in this crate branches on individual bits; callers that care can match on them directly.
pub const RW_NONE: u32 = 0;
pub const RW_READ: u32 = 1 << 1;
pub const RW_WRITE: u32 = 1 << 0;
pub const RW_READWRITE: u32 = RW_READ | RW_WRITE;

/// On-disk inode record. Exactly 128 bytes so `BSIZE` (1024) holds an integral number of them.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct Dinode {
    kind: u16,
    major: u16,
    minor: u16,
    nlink: u16,
    size: u32,
    rw_mode: u32,
    super_mode: u32,
    addrs: [u32; NDIRECT + 3],
    show_mode: u32,
    reserved: [u8; 44],
}

static_assertions::const_assert_eq!(core::mem::size_of::<Dinode>(), 128);
static_assertions::const_assert_eq!(BSIZE % 128, 0);

/// Number of [`Dinode`] records packed into one block.
pub fn inodes_per_block() -> u32 {
    (BSIZE / core::mem::size_of::<Dinode>()) as u32
}

/// An inode's block-mapping state, tagged by which on-disk interpretation the address array
/// currently has. Keeping the two modes as distinct variants (rather than one reinterpreted
/// array, as the on-disk format technically allows) makes it impossible for a call site to walk
/// extent pairs as if they were direct pointers or vice versa.
#[derive(Clone, Copy)]
pub enum Addrs {
    Standard([u32; NDIRECT + 3]),
    Extent([(u32, u32); EXTENT_PAIRS]),
}

impl Addrs {
    fn empty_for(kind: InodeType) -> Self {
        if kind == InodeType::ExtentFile {
            Addrs::Extent([(0, 0); EXTENT_PAIRS])
        } else {
            Addrs::Standard([0; NDIRECT + 3])
        }
    }

    fn from_raw(kind: InodeType, raw: [u32; NDIRECT + 3]) -> Self {
        if kind == InodeType::ExtentFile {
            let mut pairs = [(0u32, 0u32); EXTENT_PAIRS];
            for (i, pair) in pairs.iter_mut().enumerate() {
                *pair = (raw[2 * i], raw[2 * i + 1]);
            }
            Addrs::Extent(pairs)
        } else {
            Addrs::Standard(raw)
        }
    }

    fn to_raw(self) -> [u32; NDIRECT + 3] {
        match self {
            Addrs::Standard(a) => a,
            Addrs::Extent(pairs) => {
                let mut raw = [0u32; NDIRECT + 3];
                for (i, (packed, first)) in pairs.iter().enumerate() {
                    raw[2 * i] = *packed;
                    raw[2 * i + 1] = *first;
                }
                raw
            }
        }
    }
}

/// The in-memory copy of one inode's fields, cached behind a sleeplock in its table slot.
pub struct InodeInner {
    pub(crate) valid: bool,
    pub(crate) kind: InodeType,
    pub(crate) major: u16,
    pub(crate) minor: u16,
    pub(crate) nlink: u16,
    pub(crate) size: u32,
    pub(crate) rw_mode: u32,
    pub(crate) super_mode: u32,
    pub(crate) show_mode: u32,
    pub(crate) addrs: Addrs,
}

impl InodeInner {
    fn empty() -> Self {
        InodeInner {
            valid: false,
            kind: InodeType::Unused,
            major: 0,
            minor: 0,
            nlink: 0,
            size: 0,
            rw_mode: RW_NONE,
            super_mode: 0,
            show_mode: 0,
            addrs: Addrs::Standard([0; NDIRECT + 3]),
        }
    }
}

fn u32_at(block: &[u8; BSIZE], slot: usize) -> u32 {
    u32::from_le_bytes(block[slot * 4..slot * 4 + 4].try_into().unwrap())
}

fn set_u32_at(block: &mut [u8; BSIZE], slot: usize, value: u32) {
    block[slot * 4..slot * 4 + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_dinode(fs: &FileSystem, inum: u32) -> Dinode {
    let sb = fs.superblock();
    let block_no = sb.inode_block(inum);
    let buf = fs.cache.read(block_no);
    let offset = (inum % inodes_per_block()) as usize * core::mem::size_of::<Dinode>();
    buf.with_data(|data| {
        let mut d = Dinode::new_zeroed();
        d.as_bytes_mut().copy_from_slice(&data[offset..offset + core::mem::size_of::<Dinode>()]);
        d
    })
}

fn write_dinode(fs: &FileSystem, tx: &FsTransaction<'_>, inum: u32, dinode: &Dinode) {
    let sb = fs.superblock();
    let block_no = sb.inode_block(inum);
    let buf = fs.cache.read(block_no);
    let offset = (inum % inodes_per_block()) as usize * core::mem::size_of::<Dinode>();
    buf.with_data_mut(|data| data[offset..offset + core::mem::size_of::<Dinode>()].copy_from_slice(dinode.as_bytes()));
    tx.write(&buf);
}

/// Stamps a freshly allocated inode number with its initial on-disk record. Defaults for the
/// extended mode triple (read+write, no supervisor bit, visible) match what the image builder
/// gives every inode it creates.
pub(crate) fn init_on_disk(fs: &FileSystem, tx: &FsTransaction<'_>, inum: u32, kind: InodeType) {
    let dinode = Dinode {
        kind: kind as u16,
        major: 0,
        minor: 0,
        nlink: 1,
        size: 0,
        rw_mode: RW_READWRITE,
        super_mode: 0,
        addrs: [0; NDIRECT + 3],
        show_mode: 1,
        reserved: [0; 44],
    };
    write_dinode(fs, tx, inum, &dinode);
}

fn load_inner(fs: &FileSystem, inum: u32) -> InodeInner {
    let d = read_dinode(fs, inum);
    let kind = InodeType::from_disk(d.kind);
    InodeInner {
        valid: true,
        kind,
        major: d.major,
        minor: d.minor,
        nlink: d.nlink,
        size: d.size,
        rw_mode: d.rw_mode,
        super_mode: d.super_mode,
        show_mode: d.show_mode,
        addrs: Addrs::from_raw(kind, d.addrs),
    }
}

fn update_inner(fs: &FileSystem, tx: &FsTransaction<'_>, inum: u32, inner: &InodeInner) {
    let dinode = Dinode {
        kind: inner.kind as u16,
        major: inner.major,
        minor: inner.minor,
        nlink: inner.nlink,
        size: inner.size,
        rw_mode: inner.rw_mode,
        super_mode: inner.super_mode,
        addrs: inner.addrs.to_raw(),
        show_mode: inner.show_mode,
        reserved: [0; 44],
    };
    write_dinode(fs, tx, inum, &dinode);
}

struct SlotMeta {
    dev: u32,
    inum: u32,
    refcnt: usize,
}

/// The in-memory inode table: `NINODE` lockable slots, looked up by `(dev, inum)`.
pub struct Itable {
    meta: Spinlock<Vec<SlotMeta>>,
    locks: Vec<Sleeplock<InodeInner>>,
}

impl Itable {
    pub fn new() -> Self {
        let meta = (0..NINODE).map(|_| SlotMeta { dev: 0, inum: 0, refcnt: 0 }).collect();
        let locks = (0..NINODE).map(|_| Sleeplock::new(InodeInner::empty())).collect();
        Itable { meta: Spinlock::new(meta), locks }
    }

    /// Returns the slot index for `(dev, inum)`, bumping its reference count. Reuses a slot
    /// already tracking this `(dev, inum)` even with a zero refcount (matching a reference that
    /// is mid-finalization in [`RcInode`]'s drop path) before falling back to an unused slot.
    fn get(&self, dev: u32, inum: u32) -> usize {
        let mut meta = self.meta.lock();
        if let Some(i) = meta.iter().position(|s| s.dev == dev && s.inum == inum) {
            meta[i].refcnt += 1;
            return i;
        }
        let i = meta
            .iter()
            .position(|s| s.refcnt == 0)
            .expect("inode table: no free in-memory slots");
        meta[i] = SlotMeta { dev, inum, refcnt: 1 };
        drop(meta);
        *self.locks[i].lock() = InodeInner::empty();
        i
    }

    fn dup(&self, index: usize) {
        self.meta.lock()[index].refcnt += 1;
    }

    /// Decrements the slot's refcount and reports whether it reached zero.
    fn release(&self, index: usize) -> bool {
        let mut meta = self.meta.lock();
        meta[index].refcnt -= 1;
        meta[index].refcnt == 0
    }

    fn clear(&self, index: usize) {
        self.meta.lock()[index] = SlotMeta { dev: 0, inum: 0, refcnt: 0 };
    }
}

impl Default for Itable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    /// Returns a referenced, unloaded handle for `(dev, inum)`.
    pub fn iget(self: &Arc<Self>, dev: u32, inum: u32) -> RcInode {
        let index = self.itable.get(dev, inum);
        RcInode { fs: self.clone(), dev, inum, index }
    }

    /// Returns a handle for the root directory.
    pub fn root(self: &Arc<Self>) -> RcInode {
        self.iget(0, crate::param::ROOTINO)
    }

    /// Allocates a fresh inode of `kind` and returns a referenced handle to it.
    pub fn ialloc(self: &Arc<Self>, tx: &FsTransaction<'_>, kind: InodeType) -> FsResult<RcInode> {
        let inum = self.alloc_inode(tx, kind)?;
        Ok(self.iget(0, inum))
    }
}

/// A referenced handle to an in-memory inode table slot.
///
/// Dropping the last reference finalizes the inode: if it has no links left, its content is
/// truncated and the inode number is freed, all inside a transaction this drop begins itself
/// (there being no scheduler here to make that unsafe, unlike the kernel this design follows).
pub struct RcInode {
    fs: Arc<FileSystem>,
    pub dev: u32,
    pub inum: u32,
    index: usize,
}

impl Clone for RcInode {
    fn clone(&self) -> Self {
        self.fs.itable.dup(self.index);
        RcInode { fs: self.fs.clone(), dev: self.dev, inum: self.inum, index: self.index }
    }
}

impl RcInode {
    /// Locks the inode, loading its fields from disk on first access.
    pub fn lock(&self) -> InodeGuard<'_> {
        let mut guard = self.fs.itable.locks[self.index].lock();
        if !guard.valid {
            *guard = load_inner(&self.fs, self.inum);
        }
        InodeGuard { fs: &self.fs, dev: self.dev, inum: self.inum, guard }
    }
}

impl Drop for RcInode {
    fn drop(&mut self) {
        if !self.fs.itable.release(self.index) {
            return;
        }

        // Refcount just reached zero: no other `RcInode` can observe this slot except one
        // freshly obtained via `iget` for this same `(dev, inum)`, which is a legitimate
        // resurrection, not a race on a stale slot.
        let mut inner = self.fs.itable.locks[self.index].lock();
        if inner.valid && inner.nlink == 0 {
            let tx = self.fs.begin_transaction();
            itrunc(&self.fs, &tx, &mut inner);
            let freed_inum = self.inum;
            inner.kind = InodeType::Unused;
            update_inner(&self.fs, &tx, freed_inum, &inner);
            self.fs.free_inode(&tx, freed_inum);
            inner.valid = false;
            drop(inner);
            self.fs.itable.clear(self.index);
        }
    }
}

/// A locked inode: the fields behind the sleeplock, plus identity and a filesystem handle for the
/// block-level operations reading and writing them requires.
pub struct InodeGuard<'a> {
    fs: &'a FileSystem,
    pub dev: u32,
    pub inum: u32,
    guard: MutexGuard<'a, InodeInner>,
}

impl<'a> std::ops::Deref for InodeGuard<'a> {
    type Target = InodeInner;
    fn deref(&self) -> &InodeInner {
        &self.guard
    }
}

impl<'a> std::ops::DerefMut for InodeGuard<'a> {
    fn deref_mut(&mut self) -> &mut InodeInner {
        &mut self.guard
    }
}

impl<'a> InodeGuard<'a> {
    pub fn kind(&self) -> InodeType {
        self.guard.kind
    }

    pub fn size(&self) -> u32 {
        self.guard.size
    }

    /// Writes the current in-memory fields back to the inode's on-disk record.
    pub fn update(&self, tx: &FsTransaction<'_>) {
        update_inner(self.fs, tx, self.inum, &self.guard);
    }

    /// Frees every data block reachable from this inode and resets its size to zero. Does not
    /// free the inode number itself; callers that want that call [`FileSystem::free_inode`]
    /// separately (as [`RcInode`]'s drop path does).
    pub fn truncate(&mut self, tx: &FsTransaction<'_>) {
        itrunc(self.fs, tx, &mut self.guard);
        self.update(tx);
    }

    /// Ensures logical block `bn` is backed by an allocated (and therefore zeroed) disk block,
    /// without reading or writing any content. Used by directory growth, which needs a bucket's
    /// worth of blocks to exist before it can treat every slot in it as a zeroed, empty dirent.
    pub(crate) fn ensure_block_allocated(&mut self, bn: usize, tx: &FsTransaction<'_>) {
        match &mut self.guard.addrs {
            Addrs::Standard(a) => {
                bmap_alloc_standard(self.fs, tx, a, bn);
            }
            Addrs::Extent(_) => panic!("directories are never extent-mode"),
        }
    }

    /// Grows the in-memory size to `new_size` if it is larger than the current size, and persists
    /// the inode. Callers must have already ensured every block in the new range is allocated.
    pub(crate) fn force_size(&mut self, new_size: u32, tx: &FsTransaction<'_>) {
        if new_size > self.guard.size {
            self.guard.size = new_size;
        }
        self.update(tx);
    }

    /// Returns a snapshot of this inode's metadata.
    pub fn stat(&self) -> crate::fs::stat::Stat {
        crate::fs::stat::Stat {
            dev: self.dev as i32,
            ino: self.inum,
            kind: self.guard.kind,
            nlink: self.guard.nlink,
            size: self.guard.size as u64,
            rw_mode: self.guard.rw_mode,
            super_mode: self.guard.super_mode,
            show_mode: self.guard.show_mode,
        }
    }

    /// Copies up to `buf.len()` bytes starting at `off` into `buf`. Returns the number of bytes
    /// actually copied, short of `buf.len()` only when `off` lands at or past the current size.
    pub fn read(&mut self, off: u32, buf: &mut [u8]) -> FsResult<usize> {
        self.read_into(off, buf.len() as u32, |tot, src| {
            buf[tot as usize..tot as usize + src.len()].copy_from_slice(src);
            Ok(())
        })
    }

    /// Copies `buf` to `off`, growing the file and allocating blocks as needed.
    pub fn write(&mut self, off: u32, buf: &[u8], tx: &FsTransaction<'_>) -> FsResult<usize> {
        self.write_from(off, buf.len() as u32, tx, |tot, dst| {
            dst.copy_from_slice(&buf[tot as usize..tot as usize + dst.len()]);
            Ok(())
        })
    }

    /// Walks the file in block-sized chunks starting at `off`, handing each chunk's current bytes
    /// to `f`. Never allocates: every block within the current size is expected to already exist,
    /// and a hole there is a consistency violation, not a short read.
    pub fn read_into(
        &mut self,
        off: u32,
        n: u32,
        mut f: impl FnMut(u32, &[u8]) -> FsResult<()>,
    ) -> FsResult<usize> {
        let size = self.guard.size;
        if off > size {
            return Ok(0);
        }
        let n = if off.saturating_add(n) > size { size - off } else { n };

        let mut tot = 0u32;
        let mut pos = off;
        while tot < n {
            let bn = (pos as usize) / BSIZE;
            let block_no = match &self.guard.addrs {
                Addrs::Standard(a) => bmap_get_standard(self.fs, a, bn),
                Addrs::Extent(p) => bmap_get_extent(self.fs, p, bn as u32),
            }
            .expect("inode read: hole within file size");

            let begin = (pos as usize) % BSIZE;
            let chunk = (n - tot).min((BSIZE - begin) as u32);
            let buf = self.fs.cache.read(block_no);
            buf.with_data(|data| f(tot, &data[begin..begin + chunk as usize]))?;

            tot += chunk;
            pos += chunk;
        }
        Ok(tot as usize)
    }

    /// Walks the file in block-sized chunks starting at `off`, handing each chunk's bytes to `f`
    /// for writing, allocating blocks (and growing the file) as needed.
    pub fn write_from(
        &mut self,
        off: u32,
        n: u32,
        tx: &FsTransaction<'_>,
        mut f: impl FnMut(u32, &mut [u8]) -> FsResult<()>,
    ) -> FsResult<usize> {
        if off > self.guard.size {
            return Err(FsError::BadOffset);
        }
        let end = off.checked_add(n).ok_or(FsError::BadOffset)?;
        if end as usize > crate::param::MAXFILE * BSIZE {
            return Err(FsError::FileTooLarge);
        }

        let mut tot = 0u32;
        let mut pos = off;
        while tot < n {
            let bn = (pos as usize) / BSIZE;
            let block_no = match &mut self.guard.addrs {
                Addrs::Standard(a) => bmap_alloc_standard(self.fs, tx, a, bn),
                Addrs::Extent(p) => bmap_alloc_extent(self.fs, tx, p, bn as u32)?,
            };

            let begin = (pos as usize) % BSIZE;
            let chunk = (n - tot).min((BSIZE - begin) as u32);
            let buf = self.fs.cache.read(block_no);
            let result = buf.with_data_mut(|data| f(tot, &mut data[begin..begin + chunk as usize]));
            if result.is_err() {
                return Err(FsError::CopyFault { transferred: tot as usize });
            }
            tx.write(&buf);

            tot += chunk;
            pos += chunk;
        }

        if pos > self.guard.size {
            self.guard.size = pos;
        }
        self.update(tx);
        Ok(tot as usize)
    }
}

fn non_zero(v: u32) -> Option<u32> {
    if v == 0 {
        None
    } else {
        Some(v)
    }
}

fn read_slot(fs: &FileSystem, block_no: u32, slot: usize) -> Option<u32> {
    let buf = fs.cache.read(block_no);
    non_zero(buf.with_data(|d| u32_at(d, slot)))
}

/// Looks up (without allocating) the disk block backing logical block `bn` of a standard-mode
/// inode, returning `None` on a hole.
fn bmap_get_standard(fs: &FileSystem, addrs: &[u32; NDIRECT + 3], bn: usize) -> Option<u32> {
    if bn < NDIRECT {
        return non_zero(addrs[bn]);
    }
    let bn = bn - NDIRECT;
    if bn < NINDIRECT {
        let ind = non_zero(addrs[NDIRECT])?;
        return read_slot(fs, ind, bn);
    }
    let bn = bn - NINDIRECT;
    if bn < NINDIRECT * NINDIRECT {
        let l1 = non_zero(addrs[NDIRECT + 1])?;
        let l1v = read_slot(fs, l1, bn / NINDIRECT)?;
        return read_slot(fs, l1v, bn % NINDIRECT);
    }
    let bn = bn - NINDIRECT * NINDIRECT;
    let l1 = non_zero(addrs[NDIRECT + 2])?;
    let l1v = read_slot(fs, l1, bn / (NINDIRECT * NINDIRECT))?;
    let l2v = read_slot(fs, l1v, (bn % (NINDIRECT * NINDIRECT)) / NINDIRECT)?;
    read_slot(fs, l2v, (bn % (NINDIRECT * NINDIRECT)) % NINDIRECT)
}

fn bmap_get_extent(_fs: &FileSystem, pairs: &[(u32, u32); EXTENT_PAIRS], bn: u32) -> Option<u32> {
    for (packed, first) in pairs.iter() {
        if *packed == 0 {
            break;
        }
        let start = packed >> 8;
        let len = packed & 0xff;
        if bn >= *first && bn < *first + len {
            return Some(start + (bn - *first));
        }
    }
    None
}

/// Ensures `addrs[bn]`'s raw u32 array has a non-zero entry at `slot`, allocating a block and
/// writing it back if not. Shared by every indirection level (single/double/triple), replacing
/// the three near-identical loops the original block-map walk needs with one.
fn ensure_slot(fs: &FileSystem, tx: &FsTransaction<'_>, block_no: u32, slot: usize) -> u32 {
    let buf = fs.cache.read(block_no);
    let existing = buf.with_data(|d| u32_at(d, slot));
    if existing != 0 {
        return existing;
    }
    let addr = fs.alloc_block(tx).expect("bmap: out of space allocating an indirect slot");
    buf.with_data_mut(|d| set_u32_at(d, slot, addr));
    tx.write(&buf);
    addr
}

fn bmap_alloc_standard(fs: &FileSystem, tx: &FsTransaction<'_>, addrs: &mut [u32; NDIRECT + 3], bn: usize) -> u32 {
    assert!(bn < crate::param::MAXFILE, "bmap: logical block {bn} beyond MAXFILE");

    if bn < NDIRECT {
        if addrs[bn] == 0 {
            addrs[bn] = fs.alloc_block(tx).expect("bmap: out of space allocating a direct block");
        }
        return addrs[bn];
    }
    let bn = bn - NDIRECT;
    if bn < NINDIRECT {
        if addrs[NDIRECT] == 0 {
            addrs[NDIRECT] = fs.alloc_block(tx).expect("bmap: out of space allocating the indirect block");
        }
        return ensure_slot(fs, tx, addrs[NDIRECT], bn);
    }
    let bn = bn - NINDIRECT;
    if bn < NINDIRECT * NINDIRECT {
        if addrs[NDIRECT + 1] == 0 {
            addrs[NDIRECT + 1] =
                fs.alloc_block(tx).expect("bmap: out of space allocating the double-indirect block");
        }
        let l1 = ensure_slot(fs, tx, addrs[NDIRECT + 1], bn / NINDIRECT);
        return ensure_slot(fs, tx, l1, bn % NINDIRECT);
    }
    let bn = bn - NINDIRECT * NINDIRECT;
    assert!(bn < NINDIRECT * NINDIRECT * NINDIRECT, "bmap: logical block beyond MAXFILE");
    if addrs[NDIRECT + 2] == 0 {
        addrs[NDIRECT + 2] =
            fs.alloc_block(tx).expect("bmap: out of space allocating the triple-indirect block");
    }
    let l1 = ensure_slot(fs, tx, addrs[NDIRECT + 2], bn / (NINDIRECT * NINDIRECT));
    let l2 = ensure_slot(fs, tx, l1, (bn % (NINDIRECT * NINDIRECT)) / NINDIRECT);
    ensure_slot(fs, tx, l2, (bn % (NINDIRECT * NINDIRECT)) % NINDIRECT)
}

/// Extent-mode equivalent of [`bmap_alloc_standard`]: looks up `bn` within the existing pairs,
/// extends the last pair's run when the freshly allocated block happens to be contiguous with it,
/// and otherwise opens a new pair. Errors once all `EXTENT_PAIRS` slots are in use.
fn bmap_alloc_extent(
    fs: &FileSystem,
    tx: &FsTransaction<'_>,
    pairs: &mut [(u32, u32); EXTENT_PAIRS],
    bn: u32,
) -> FsResult<u32> {
    let mut used = 0;
    for (i, (packed, first)) in pairs.iter().enumerate() {
        if *packed == 0 {
            break;
        }
        let start = packed >> 8;
        let len = packed & 0xff;
        if bn >= *first && bn < *first + len {
            return Ok(start + (bn - *first));
        }
        used = i + 1;
    }

    let new_block = fs.alloc_block(tx)?;

    if used > 0 {
        let (packed, first) = pairs[used - 1];
        let start = packed >> 8;
        let len = packed & 0xff;
        if new_block == start + len && len < 0xff {
            pairs[used - 1] = ((start << 8) | (len + 1), first);
            return Ok(new_block);
        }
    }

    if used >= EXTENT_PAIRS {
        fs.free_block(tx, new_block);
        return Err(FsError::FileTooLarge);
    }
    pairs[used] = ((new_block << 8) | 1, bn);
    Ok(new_block)
}

/// Recursively frees every block reachable from `block_no` when it is treated as a pointer block
/// `depth` levels above the data (`1`: its entries are data blocks; `2`: its entries are
/// single-indirect blocks; `3`: its entries are double-indirect blocks).
fn free_indirect_level(fs: &FileSystem, tx: &FsTransaction<'_>, block_no: u32, depth: u32) {
    let entries: Vec<u32> = {
        let buf = fs.cache.read(block_no);
        buf.with_data(|d| (0..NINDIRECT).map(|i| u32_at(d, i)).collect())
    };
    for entry in entries {
        if entry == 0 {
            continue;
        }
        if depth > 1 {
            free_indirect_level(fs, tx, entry, depth - 1);
        }
        fs.free_block(tx, entry);
    }
}

fn itrunc_standard(fs: &FileSystem, tx: &FsTransaction<'_>, addrs: &mut [u32; NDIRECT + 3]) {
    for slot in addrs.iter_mut().take(NDIRECT) {
        if *slot != 0 {
            fs.free_block(tx, *slot);
            *slot = 0;
        }
    }
    if addrs[NDIRECT] != 0 {
        free_indirect_level(fs, tx, addrs[NDIRECT], 1);
        fs.free_block(tx, addrs[NDIRECT]);
        addrs[NDIRECT] = 0;
    }
    if addrs[NDIRECT + 1] != 0 {
        free_indirect_level(fs, tx, addrs[NDIRECT + 1], 2);
        fs.free_block(tx, addrs[NDIRECT + 1]);
        addrs[NDIRECT + 1] = 0;
    }
    if addrs[NDIRECT + 2] != 0 {
        free_indirect_level(fs, tx, addrs[NDIRECT + 2], 3);
        // The triple-indirect root itself, distinct from the NDIRECT + 1 slot already freed
        // above.
        fs.free_block(tx, addrs[NDIRECT + 2]);
        addrs[NDIRECT + 2] = 0;
    }
}

fn itrunc_extent(fs: &FileSystem, tx: &FsTransaction<'_>, pairs: &mut [(u32, u32); EXTENT_PAIRS]) {
    for pair in pairs.iter_mut() {
        let (packed, _first) = *pair;
        if packed == 0 {
            continue;
        }
        let start = packed >> 8;
        let len = packed & 0xff;
        for offset in 0..len {
            fs.free_block(tx, start + offset);
        }
        *pair = (0, 0);
    }
}

fn itrunc(fs: &FileSystem, tx: &FsTransaction<'_>, inner: &mut InodeInner) {
    match &mut inner.addrs {
        Addrs::Standard(a) => itrunc_standard(fs, tx, a),
        Addrs::Extent(p) => itrunc_extent(fs, tx, p),
    }
    inner.size = 0;
}
