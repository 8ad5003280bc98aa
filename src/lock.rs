//! The two-tier lock hierarchy: a `Spinlock` guards short, non-sleeping critical sections (table
//! slot discovery, superblock counters); a `Sleeplock` guards a single inode's fields and is held
//! across block I/O.
//!
//! Both are `std::sync::Mutex` underneath — there is no scheduler here to spin against versus
//! sleep against, since this crate runs hosted rather than inside a booted kernel. The two names
//! are kept distinct anyway, matching the corresponding kernel's split between a raw
//! interrupt-disabling spinlock and a process-blocking sleeplock, because the distinction still
//! documents which lock a given field lives under and in what order they must be acquired.

use std::sync::{Mutex, MutexGuard};

/// Guards state that is only ever touched for a handful of instructions: slot bookkeeping,
/// free counters. Never held across a block read or write.
pub struct Spinlock<T> {
    inner: Mutex<T>,
}

impl<T> Spinlock<T> {
    pub const fn new(value: T) -> Self {
        Spinlock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}

/// Guards a single inode's in-memory fields. Held across the block reads and writes that make up
/// one inode operation, unlike `Spinlock`.
pub struct Sleeplock<T> {
    inner: Mutex<T>,
}

impl<T> Sleeplock<T> {
    pub const fn new(value: T) -> Self {
        Sleeplock { inner: Mutex::new(value) }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.inner.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
