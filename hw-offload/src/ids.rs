// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Fixed-range identifier pools (component A).

use parking_lot::Mutex;

use crate::error::invariant_violated;

/// Allocates and frees small dense ids from a fixed range `[base, limit)`.
///
/// Ids are handed out in no particular order beyond "any free one": callers must not rely on
/// allocation order. Freeing an id that was never allocated, or that is already free, is a bug
/// in the caller and aborts the process via [`invariant_violated`].
#[derive(Debug)]
pub struct IdPool {
    base: u32,
    limit: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Ids below this watermark (relative to `base`) have been handed out at least once.
    next: u32,
    /// Ids freed and available for reuse, ahead of `next`.
    free: Vec<u32>,
    /// Whether each id below `next` is currently allocated. Indexed relative to `base`.
    allocated: Vec<bool>,
}

impl IdPool {
    #[must_use]
    pub fn new(base: u32, limit: u32) -> Self {
        assert!(base < limit, "id pool range must be non-empty");
        Self {
            base,
            limit,
            inner: Mutex::new(Inner {
                next: 0,
                free: Vec::new(),
                allocated: Vec::new(),
            }),
        }
    }

    /// Allocate an id, or `None` if the pool is exhausted.
    pub fn alloc(&self) -> Option<u32> {
        let mut inner = self.inner.lock();
        if let Some(id) = inner.free.pop() {
            let idx = (id - self.base) as usize;
            debug_assert!(!inner.allocated[idx]);
            inner.allocated[idx] = true;
            return Some(id);
        }
        let span = self.limit - self.base;
        if inner.next >= span {
            return None;
        }
        let id = self.base + inner.next;
        inner.next += 1;
        inner.allocated.push(true);
        Some(id)
    }

    /// Return an id to the pool.
    ///
    /// # Panics
    /// Aborts the process if `id` is out of range, was never allocated, or is already free:
    /// each of these is a double-free or foreign-id bug in the caller, not a recoverable error.
    pub fn free(&self, id: u32) {
        if id < self.base || id >= self.limit {
            invariant_violated(&format!("free of out-of-range id {id}"));
        }
        let mut inner = self.inner.lock();
        let idx = (id - self.base) as usize;
        match inner.allocated.get(idx) {
            Some(true) => {
                inner.allocated[idx] = false;
                inner.free.push(id);
            }
            _ => invariant_violated(&format!("double free of id {id}")),
        }
    }

    /// Number of ids currently allocated. Exposed for tests and invariant checks.
    #[must_use]
    pub fn in_use(&self) -> usize {
        let inner = self.inner.lock();
        inner.allocated.iter().filter(|x| **x).count()
    }
}
