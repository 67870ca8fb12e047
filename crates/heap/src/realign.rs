//! Adapter that lifts a weakly aligned driver to [`ALIGNMENT`].
//!
//! Each block is over-allocated by [`ALIGNMENT`] bytes. The caller-visible
//! pointer is the first aligned address strictly after the driver's block
//! start, and the byte right before it records the distance back:
//!
//! ```text
//! base             base + offset - 1   base + offset
//! │ padding ...    │ offset: u8        │ caller-visible bytes ...
//! ```
//!
//! `offset` is always in `1..=ALIGNMENT`.

use core::{num::NonZeroUsize, ptr::NonNull};

use crate::{ALIGNMENT, HeapDriver, HeapError};

pub(crate) struct Realigned<D> {
    inner: D,
}

impl<D> Realigned<D> {
    pub(crate) const fn new(inner: D) -> Self {
        Self { inner }
    }

    fn offset_for(base: NonNull<u8>) -> usize {
        ALIGNMENT - base.as_ptr().addr() % ALIGNMENT
    }

    /// # Safety
    ///
    /// `base` must be valid for writes of `offset_for(base)` bytes.
    unsafe fn place(base: NonNull<u8>) -> NonNull<u8> {
        let offset = Self::offset_for(base);
        unsafe {
            let ptr = base.add(offset);
            #[expect(clippy::cast_possible_truncation)]
            ptr.sub(1).write(offset as u8);
            ptr
        }
    }

    /// # Safety
    ///
    /// `ptr` must have been returned by [`place`](Self::place).
    unsafe fn split(ptr: NonNull<u8>) -> (NonNull<u8>, usize) {
        unsafe {
            let offset = usize::from(ptr.sub(1).read());
            (ptr.sub(offset), offset)
        }
    }
}

unsafe impl<D> HeapDriver for Realigned<D>
where
    D: HeapDriver,
{
    fn init(&self) -> Result<(), HeapError> {
        self.inner.init()
    }

    fn shutdown(&self) {
        self.inner.shutdown();
    }

    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let total = size.checked_add(ALIGNMENT)?;
        let base = self.inner.allocate(total)?;
        Some(unsafe { Self::place(base) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>) {
        unsafe {
            let (base, _) = Self::split(ptr);
            self.inner.free(base);
        }
    }

    unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>> {
        let total = size.checked_add(ALIGNMENT)?;
        unsafe {
            let (base, old_offset) = Self::split(ptr);
            let old_usable = self.inner.usable_size(base) - old_offset;
            let new_base = self.inner.resize(base, total)?;
            let new_offset = Self::offset_for(new_base);
            if new_offset != old_offset {
                new_base.add(old_offset).copy_to(
                    new_base.add(new_offset),
                    old_usable.min(size.get()),
                );
            }
            Some(Self::place(new_base))
        }
    }

    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        unsafe {
            let (base, offset) = Self::split(ptr);
            self.inner.usable_size(base) - offset
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::SystemHeap;

    /// Driver whose blocks all start one byte past an 8-byte boundary.
    pub(crate) struct OddHeap {
        inner: SystemHeap,
    }

    impl OddHeap {
        pub(crate) const fn new() -> Self {
            Self { inner: SystemHeap }
        }
    }

    unsafe impl HeapDriver for OddHeap {
        fn alignment(&self) -> usize {
            1
        }

        fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>> {
            let base = self.inner.allocate(size.checked_add(1)?)?;
            Some(unsafe { base.add(1) })
        }

        unsafe fn free(&self, ptr: NonNull<u8>) {
            unsafe { self.inner.free(ptr.sub(1)) }
        }

        unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>> {
            let base = unsafe { self.inner.resize(ptr.sub(1), size.checked_add(1)?)? };
            Some(unsafe { base.add(1) })
        }

        unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
            unsafe { self.inner.usable_size(ptr.sub(1)) - 1 }
        }
    }

    fn size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[test]
    fn test_odd_heap_is_misaligned() {
        let heap = OddHeap::new();
        let ptr = heap.allocate(size(16)).unwrap();
        assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 1);
        unsafe {
            heap.free(ptr);
        }
    }

    #[test]
    fn test_realigned_blocks_are_aligned() {
        let heap = Realigned::new(OddHeap::new());
        for n in 1..=200 {
            let ptr = heap.allocate(size(n)).unwrap();
            assert_eq!(ptr.as_ptr().addr() % ALIGNMENT, 0);
            unsafe {
                assert!(heap.usable_size(ptr) >= n);
                ptr.write_bytes(0xaa, n);
                heap.free(ptr);
            }
        }
    }

    #[test]
    fn test_realigned_resize_moves_contents_with_offset() {
        let heap = Realigned::new(OddHeap::new());
        let ptr = heap.allocate(size(32)).unwrap();
        unsafe {
            for i in 0..32 {
                ptr.add(i).write(i as u8);
            }
            let grown = heap.resize(ptr, size(5000)).unwrap();
            assert_eq!(grown.as_ptr().addr() % ALIGNMENT, 0);
            for i in 0..32 {
                assert_eq!(grown.add(i).read(), i as u8);
            }
            let shrunk = heap.resize(grown, size(8)).unwrap();
            for i in 0..8 {
                assert_eq!(shrunk.add(i).read(), i as u8);
            }
            heap.free(shrunk);
        }
    }
}
