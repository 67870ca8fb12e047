//! Instrumented heap driver for tests.
//!
//! [`CountingHeap`] forwards to [`SystemHeap`] while counting every call,
//! and can be told to refuse requests: all of them, or any that would push
//! the live byte count past a capacity. Refusals are logged the same way a
//! real driver logs exhaustion.

use alloc::sync::Arc;
use core::{
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use crate::{HeapDriver, ResultCode, SystemHeap, round8};

/// Counters shared between a [`CountingHeap`] and the test observing it.
#[derive(Debug)]
pub struct HeapStats {
    allocations: AtomicUsize,
    frees: AtomicUsize,
    resizes: AtomicUsize,
    failures: AtomicUsize,
    live_bytes: AtomicUsize,
    fail_all: AtomicBool,
    capacity: AtomicUsize,
}

impl Default for HeapStats {
    fn default() -> Self {
        Self {
            allocations: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
            resizes: AtomicUsize::new(0),
            failures: AtomicUsize::new(0),
            live_bytes: AtomicUsize::new(0),
            fail_all: AtomicBool::new(false),
            capacity: AtomicUsize::new(usize::MAX),
        }
    }
}

impl HeapStats {
    /// Makes every subsequent allocate and resize fail.
    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::Relaxed);
    }

    /// Limits the number of live bytes. `None` removes the limit.
    pub fn set_capacity(&self, capacity: Option<usize>) {
        self.capacity
            .store(capacity.unwrap_or(usize::MAX), Ordering::Relaxed);
    }

    /// Successful allocations.
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.allocations.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn frees(&self) -> usize {
        self.frees.load(Ordering::Relaxed)
    }

    /// Successful resizes.
    #[must_use]
    pub fn resizes(&self) -> usize {
        self.resizes.load(Ordering::Relaxed)
    }

    /// Refused allocations and resizes.
    #[must_use]
    pub fn failures(&self) -> usize {
        self.failures.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn live_bytes(&self) -> usize {
        self.live_bytes.load(Ordering::Relaxed)
    }

    /// Total number of driver calls of any kind.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.allocations() + self.frees() + self.resizes() + self.failures()
    }

    fn admits(&self, released: usize, requested: usize) -> bool {
        if self.fail_all.load(Ordering::Relaxed) {
            return false;
        }
        let Some(requested) = round8(requested) else {
            return false;
        };
        let live = self.live_bytes() - released;
        live.checked_add(requested)
            .is_some_and(|total| total <= self.capacity.load(Ordering::Relaxed))
    }
}

#[derive(Debug, Default)]
pub struct CountingHeap {
    inner: SystemHeap,
    stats: Arc<HeapStats>,
}

impl CountingHeap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a heap that refuses to hold more than `capacity` live bytes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let heap = Self::default();
        heap.stats.set_capacity(Some(capacity));
        heap
    }

    /// Returns a handle to the counters, usable after the heap has been
    /// moved into an environment.
    #[must_use]
    pub fn stats(&self) -> Arc<HeapStats> {
        Arc::clone(&self.stats)
    }
}

unsafe impl HeapDriver for CountingHeap {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let stats = &self.stats;
        if !stats.admits(0, size.get()) {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            crate::warn!(
                ResultCode::NoMem,
                "failed to allocate {size} bytes of memory"
            );
            return None;
        }
        let ptr = self.inner.allocate(size)?;
        let usable = unsafe { self.inner.usable_size(ptr) };
        stats.allocations.fetch_add(1, Ordering::Relaxed);
        stats.live_bytes.fetch_add(usable, Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let stats = &self.stats;
        let usable = unsafe { self.inner.usable_size(ptr) };
        stats.frees.fetch_add(1, Ordering::Relaxed);
        stats.live_bytes.fetch_sub(usable, Ordering::Relaxed);
        unsafe { self.inner.free(ptr) }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let stats = &self.stats;
        let old = unsafe { self.inner.usable_size(ptr) };
        if !stats.admits(old, size.get()) {
            stats.failures.fetch_add(1, Ordering::Relaxed);
            crate::warn!(
                ResultCode::NoMem,
                "failed memory resize {old} to {size} bytes"
            );
            return None;
        }
        let new_ptr = unsafe { self.inner.resize(ptr, size)? };
        let new = unsafe { self.inner.usable_size(new_ptr) };
        stats.resizes.fetch_add(1, Ordering::Relaxed);
        stats.live_bytes.fetch_sub(old, Ordering::Relaxed);
        stats.live_bytes.fetch_add(new, Ordering::Relaxed);
        Some(new_ptr)
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { self.inner.usable_size(ptr) }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_counts_and_live_bytes() {
        let heap = CountingHeap::new();
        let stats = heap.stats();
        let a = heap.allocate(size(10)).unwrap();
        let b = heap.allocate(size(16)).unwrap();
        assert_eq!(stats.allocations(), 2);
        assert_eq!(stats.live_bytes(), 32);
        unsafe {
            let a = heap.resize(a, size(100)).unwrap();
            assert_eq!(stats.live_bytes(), 120);
            heap.free(a);
            heap.free(b);
        }
        assert_eq!(stats.frees(), 2);
        assert_eq!(stats.resizes(), 1);
        assert_eq!(stats.live_bytes(), 0);
        assert_eq!(stats.calls(), 5);
    }

    #[test]
    fn test_capacity_and_fail_all() {
        let heap = CountingHeap::with_capacity(32);
        let stats = heap.stats();
        let a = heap.allocate(size(24)).unwrap();
        assert!(heap.allocate(size(16)).is_none());
        let b = heap.allocate(size(8)).unwrap();
        assert_eq!(stats.failures(), 1);

        stats.set_capacity(None);
        stats.set_fail_all(true);
        assert!(heap.allocate(size(1)).is_none());
        assert!(unsafe { heap.resize(a, size(8)) }.is_none());
        assert_eq!(stats.failures(), 3);

        stats.set_fail_all(false);
        unsafe {
            heap.free(a);
            heap.free(b);
        }
        assert_eq!(stats.live_bytes(), 0);
    }
}
