//! The low-level heap driver contract.

use core::{num::NonZeroUsize, ptr::NonNull};

use crate::HeapError;

/// Alignment guaranteed for every pointer handed out by the environment.
pub const ALIGNMENT: usize = 8;

/// Rounds `n` up to the next multiple of [`ALIGNMENT`].
///
/// Returns `None` on overflow.
#[must_use]
pub const fn round8(n: usize) -> Option<usize> {
    n.checked_next_multiple_of(ALIGNMENT)
}

/// A pluggable source of raw memory.
///
/// Drivers never panic or unwind on exhaustion; every failure is reported
/// as `None`. A driver may log a diagnostic on failure, but must not change
/// control flow because of it.
///
/// Size and null-pointer validation happen in the
/// [`Environment`](crate::Environment), so a driver only ever sees non-null
/// pointers it handed out itself and non-zero sizes below
/// [`MAX_ALLOCATION_SIZE`](crate::MAX_ALLOCATION_SIZE).
///
/// # Safety
///
/// Implementors must guarantee that:
///
/// - a pointer returned from [`allocate`](Self::allocate) or
///   [`resize`](Self::resize) is valid for reads and writes of at least the
///   requested number of bytes, does not overlap any other live block, and
///   is aligned to at least [`alignment`](Self::alignment) bytes
/// - [`usable_size`](Self::usable_size) never reports fewer bytes than were
///   requested for a live block
/// - a failed [`resize`](Self::resize) leaves the original block valid and
///   unchanged
pub unsafe trait HeapDriver: Send + Sync {
    /// Prepares the driver for use. Called once before the first
    /// allocation, and again after a [`shutdown`](Self::shutdown).
    fn init(&self) -> Result<(), HeapError> {
        Ok(())
    }

    fn shutdown(&self) {}

    /// The alignment of every block this driver returns.
    ///
    /// Drivers returning less than [`ALIGNMENT`] are wrapped by the
    /// environment, which pads and realigns each block.
    fn alignment(&self) -> usize {
        ALIGNMENT
    }

    /// Allocates a block of at least `size` bytes.
    fn allocate(&self, size: NonZeroUsize) -> Option<NonNull<u8>>;

    /// Releases a block.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this driver and not freed since.
    unsafe fn free(&self, ptr: NonNull<u8>);

    /// Changes the size of a block, moving it if necessary.
    ///
    /// On failure the original block is left untouched and still owned by
    /// the caller.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this driver and not freed since.
    unsafe fn resize(&self, ptr: NonNull<u8>, size: NonZeroUsize) -> Option<NonNull<u8>>;

    /// Reports how many bytes of the block are usable.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this driver and not freed since.
    unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize;
}

/// Size header kept in front of blocks whose usable size the platform
/// cannot report.
///
/// ```text
/// base          base + HEADER_SIZE
/// │ size: u64   │ caller-visible bytes ...
/// ```
pub(crate) mod header {
    use core::ptr::NonNull;

    use super::ALIGNMENT;

    pub(crate) const HEADER_SIZE: usize = ALIGNMENT;

    /// Records `size` at `base` and returns the caller-visible pointer.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`ALIGNMENT`] and valid for writes of
    /// `HEADER_SIZE + size` bytes.
    pub(crate) unsafe fn attach(base: NonNull<u8>, size: usize) -> NonNull<u8> {
        unsafe {
            base.cast::<u64>().write(size as u64);
            base.add(HEADER_SIZE)
        }
    }

    /// Recovers the block start and recorded size from a caller-visible
    /// pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`attach`].
    pub(crate) unsafe fn detach(ptr: NonNull<u8>) -> (NonNull<u8>, usize) {
        unsafe {
            let base = ptr.sub(HEADER_SIZE);
            #[expect(clippy::cast_possible_truncation)]
            let size = base.cast::<u64>().read() as usize;
            (base, size)
        }
    }
}
