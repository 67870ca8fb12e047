//! Heap driver over the global Rust allocator.
//!
//! The global allocator cannot report the usable size of a block, and
//! needs the original layout to release one, so every block carries an
//! 8-byte size header in front of the caller-visible pointer.

use alloc::alloc;
use core::{alloc::Layout, num::NonZeroUsize, ptr::NonNull};

use crate::{
    HeapDriver, ResultCode,
    driver::{
        ALIGNMENT,
        header::{self, HEADER_SIZE},
        round8,
    },
};

/// The default heap driver.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHeap;

impl SystemHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

/// Layout of a block holding `size` caller-visible bytes.
fn block_layout(size: usize) -> Option<Layout> {
    let total = size.checked_add(HEADER_SIZE)?;
    Layout::from_size_align(total, ALIGNMENT).ok()
}

/// Layout of a block previously built by [`block_layout`].
///
/// # Safety
///
/// `block_layout(size)` must have succeeded before.
unsafe fn known_layout(size: usize) -> Layout {
    unsafe { Layout::from_size_align_unchecked(size + HEADER_SIZE, ALIGNMENT) }
}

unsafe impl HeapDriver for SystemHeap {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let requested = size.get();
        let Some((size, layout)) = round8(requested).and_then(|n| Some((n, block_layout(n)?)))
        else {
            crate::warn!(
                ResultCode::NoMem,
                "failed to allocate {requested} bytes of memory"
            );
            return None;
        };
        let Some(base) = NonNull::new(unsafe { alloc::alloc(layout) }) else {
            crate::warn!(
                ResultCode::NoMem,
                "failed to allocate {size} bytes of memory"
            );
            return None;
        };
        Some(unsafe { header::attach(base, size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe {
            let (base, size) = header::detach(ptr);
            alloc::dealloc(base.as_ptr(), known_layout(size));
        }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let (base, old_size) = unsafe { header::detach(ptr) };
        let requested = size.get();
        let Some((new_size, new_layout)) =
            round8(requested).and_then(|n| Some((n, block_layout(n)?)))
        else {
            crate::warn!(
                ResultCode::NoMem,
                "failed memory resize {old_size} to {requested} bytes"
            );
            return None;
        };
        let new_base =
            unsafe { alloc::realloc(base.as_ptr(), known_layout(old_size), new_layout.size()) };
        let Some(new_base) = NonNull::new(new_base) else {
            crate::warn!(
                ResultCode::NoMem,
                "failed memory resize {old_size} to {new_size} bytes"
            );
            return None;
        };
        Some(unsafe { header::attach(new_base, new_size) })
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe { header::detach(ptr).1 }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    struct TestHeap {
        heap: SystemHeap,
    }

    impl TestHeap {
        fn allocate(&self, n: usize) -> Option<NonNull<u8>> {
            let ptr = self.heap.allocate(size(n))?;
            unsafe {
                ptr.write_bytes(0x33, n);
            }
            Some(ptr)
        }

        unsafe fn free(&self, ptr: NonNull<u8>, n: usize) {
            unsafe {
                for i in 0..n {
                    assert_eq!(ptr.add(i).read(), 0x33);
                }
                ptr.write_bytes(0x55, n);
                self.heap.free(ptr);
            }
        }
    }

    #[test]
    fn test_alignment_all_small_sizes() {
        let heap = TestHeap { heap: SystemHeap };
        for n in 1..=300 {
            let ptr = heap.allocate(n).unwrap();
            assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 0, "size {n}");
            unsafe {
                heap.free(ptr, n);
            }
        }
    }

    #[test]
    fn test_usable_size_is_rounded_request() {
        let heap = SystemHeap;
        for (n, expected) in [(1, 8), (8, 8), (9, 16), (100, 104), (4096, 4096)] {
            let ptr = heap.allocate(size(n)).unwrap();
            unsafe {
                assert_eq!(heap.usable_size(ptr), expected);
                heap.free(ptr);
            }
        }
    }

    #[test]
    fn test_resize_preserves_contents() {
        let heap = TestHeap { heap: SystemHeap };
        let ptr = heap.allocate(40).unwrap();
        unsafe {
            let grown = heap.heap.resize(ptr, size(4000)).unwrap();
            assert_eq!(heap.heap.usable_size(grown), 4000);
            assert_eq!(grown.as_ptr().addr() % ALIGNMENT, 0);
            let shrunk = heap.heap.resize(grown, size(16)).unwrap();
            assert_eq!(heap.heap.usable_size(shrunk), 16);
            heap.free(shrunk, 16);
        }
    }

    #[test]
    fn test_oversized_request_fails_without_panic() {
        let heap = SystemHeap;
        assert!(heap.allocate(size(usize::MAX)).is_none());
        assert!(heap.allocate(size(isize::MAX as usize)).is_none());

        let ptr = heap.allocate(size(32)).unwrap();
        unsafe {
            ptr.write_bytes(0x77, 32);
            assert!(heap.resize(ptr, size(usize::MAX - 3)).is_none());
            assert_eq!(heap.usable_size(ptr), 32);
            assert_eq!(ptr.add(31).read(), 0x77);
            heap.free(ptr);
        }
    }
}
