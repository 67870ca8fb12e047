//! Heap driver over the C library's `malloc` family.
//!
//! Where the platform can report the usable size of a `malloc`ed block,
//! blocks are handed out as-is. Elsewhere every block carries the same
//! 8-byte size header that [`SystemHeap`](crate::SystemHeap) uses.

use core::{ffi::c_void, num::NonZeroUsize, ptr::NonNull};

use cfg_if::cfg_if;

use crate::{
    HeapDriver, ResultCode,
    driver::{
        header::{self, HEADER_SIZE},
        round8,
    },
};

cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        const NATIVE_SIZE: bool = true;

        unsafe fn native_size(ptr: *mut c_void) -> usize {
            unsafe { libc::malloc_usable_size(ptr) }
        }
    } else if #[cfg(target_vendor = "apple")] {
        const NATIVE_SIZE: bool = true;

        unsafe fn native_size(ptr: *mut c_void) -> usize {
            unsafe { libc::malloc_size(ptr.cast_const()) }
        }
    } else {
        const NATIVE_SIZE: bool = false;

        unsafe fn native_size(_ptr: *mut c_void) -> usize {
            0
        }
    }
}

/// Heap driver backed by `malloc`, `realloc` and `free`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibcHeap;

impl LibcHeap {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Returns `true` if block sizes come from the C library rather than
    /// from a size header.
    #[must_use]
    pub const fn has_native_size() -> bool {
        NATIVE_SIZE
    }
}

unsafe impl HeapDriver for LibcHeap {
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let requested = size.get();
        if NATIVE_SIZE {
            let ptr = NonNull::new(unsafe { libc::malloc(requested) }.cast::<u8>());
            if ptr.is_none() {
                crate::warn!(
                    ResultCode::NoMem,
                    "failed to allocate {requested} bytes of memory"
                );
            }
            return ptr;
        }

        let size = round8(requested)?;
        let base = size
            .checked_add(HEADER_SIZE)
            .and_then(|total| NonNull::new(unsafe { libc::malloc(total) }.cast::<u8>()));
        let Some(base) = base else {
            crate::warn!(ResultCode::NoMem, "failed to allocate {size} bytes of memory");
            return None;
        };
        Some(unsafe { header::attach(base, size) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        let base = if NATIVE_SIZE {
            ptr
        } else {
            unsafe { header::detach(ptr).0 }
        };
        unsafe { libc::free(base.as_ptr().cast()) }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let requested = size.get();
        if NATIVE_SIZE {
            let new_ptr = NonNull::new(unsafe { libc::realloc(ptr.as_ptr().cast(), requested) });
            if new_ptr.is_none() {
                crate::warn!(
                    ResultCode::NoMem,
                    "failed memory resize {} to {requested} bytes",
                    unsafe { self.usable_size(ptr) }
                );
            }
            return new_ptr.map(NonNull::cast);
        }

        let (base, old_size) = unsafe { header::detach(ptr) };
        let new_size = round8(requested)?;
        let new_base = new_size.checked_add(HEADER_SIZE).and_then(|total| {
            NonNull::new(unsafe { libc::realloc(base.as_ptr().cast(), total) }.cast::<u8>())
        });
        let Some(new_base) = new_base else {
            crate::warn!(
                ResultCode::NoMem,
                "failed memory resize {old_size} to {new_size} bytes"
            );
            return None;
        };
        Some(unsafe { header::attach(new_base, new_size) })
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        if NATIVE_SIZE {
            unsafe { native_size(ptr.as_ptr().cast()) }
        } else {
            unsafe { header::detach(ptr).1 }
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::ALIGNMENT;

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_usable_size_covers_request() {
        let heap = LibcHeap::new();
        for n in [1, 7, 8, 100, 1000, 65536] {
            let ptr = heap.allocate(size(n)).unwrap();
            unsafe {
                assert!(heap.usable_size(ptr) >= n);
                assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 0);
                heap.free(ptr);
            }
        }
    }

    #[test]
    fn test_resize_keeps_prefix() {
        let heap = LibcHeap::new();
        let ptr = heap.allocate(size(24)).unwrap();
        unsafe {
            for i in 0..24 {
                ptr.add(i).write(i as u8);
            }
            let grown = heap.resize(ptr, size(10_000)).unwrap();
            assert!(heap.usable_size(grown) >= 10_000);
            for i in 0..24 {
                assert_eq!(grown.add(i).read(), i as u8);
            }
            heap.free(grown);
        }
    }

    #[cfg(any(target_os = "linux", target_os = "android", target_vendor = "apple"))]
    #[test]
    fn test_usable_size_comes_from_libc() {
        assert!(LibcHeap::has_native_size());
        let heap = LibcHeap::new();
        let ptr = heap.allocate(size(40)).unwrap();
        unsafe {
            let native = native_size(ptr.as_ptr().cast());
            assert!(native >= 40);
            assert_eq!(heap.usable_size(ptr), native);
            heap.free(ptr);
        }
    }
}
