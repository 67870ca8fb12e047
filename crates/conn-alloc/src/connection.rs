//! The per-connection allocator.
//!
//! A [`ConnAllocator`] sits in front of an [`Environment`] and adds three
//! things to it:
//!
//! - a lookaside pool that serves small requests without touching the
//!   environment
//! - a sticky failure latch: after one failed allocation every further
//!   allocation fails immediately, until [`api_exit`](ConnAllocator::api_exit)
//!   reports the failure to the caller of the public operation
//! - byte-accounting diversion, where frees are tallied instead of
//!   performed
//!
//! Code that issues many allocations in a row can therefore ignore
//! individual failures as long as it does not dereference a failed result;
//! the latch guarantees the operation ends in [`ResultCode::NoMem`].

use core::{mem::MaybeUninit, ptr::NonNull};

use heap::{ALIGNMENT, Environment, MAX_ALLOCATION_SIZE, ResultCode, checked_size};
use snafu::ensure;

use crate::{
    error::{AllocError, LatchedSnafu, OutOfMemorySnafu, SizeLimitSnafu},
    lookaside::{Buffer, Lookaside, LookasideConfig, LookasideStatus},
    memdebug::{self, MemType},
};

/// Bytes a request of `n` needs from a lookaside slot. Sizes of zero or
/// less need none.
fn slot_request(n: i64) -> usize {
    usize::try_from(n).unwrap_or(0)
}

/// Allocator state owned by one database connection.
///
/// The allocator is not synchronized. Callers serialize every operation on
/// one connection, typically by holding the connection's lock.
pub struct ConnAllocator<'env> {
    env: &'env Environment,
    lookaside: Lookaside,
    malloc_failed: bool,
    bytes_freed: Option<usize>,
    error_code: ResultCode,
}

impl<'env> ConnAllocator<'env> {
    /// Creates an allocator with the default lookaside pool.
    #[must_use]
    pub fn new(env: &'env Environment) -> Self {
        Self::with_config(env, LookasideConfig::default())
    }

    /// Creates an allocator with a pool of the given shape.
    ///
    /// If the pool's buffer cannot be allocated the connection runs without
    /// one.
    #[must_use]
    pub fn with_config(env: &'env Environment, config: LookasideConfig) -> Self {
        let mut this = Self {
            env,
            lookaside: Lookaside::empty(),
            malloc_failed: false,
            bytes_freed: None,
            error_code: ResultCode::Ok,
        };
        let rc = this.configure_lookaside(config);
        debug_assert!(rc.is_ok());
        this
    }

    #[must_use]
    pub fn env(&self) -> &'env Environment {
        self.env
    }

    /// Returns `true` while the failure latch is set.
    #[must_use]
    pub fn malloc_failed(&self) -> bool {
        self.malloc_failed
    }

    /// The result code recorded by the last [`api_exit`](Self::api_exit)
    /// that reported a failure.
    #[must_use]
    pub fn error_code(&self) -> ResultCode {
        self.error_code
    }

    fn set_latch(&mut self) {
        if !self.malloc_failed {
            heap::debug!(
                ResultCode::NoMem,
                "connection allocation failed, refusing further requests"
            );
        }
        self.malloc_failed = true;
    }

    fn reject_size(&mut self, n: i64) -> AllocError {
        heap::debug!(
            ResultCode::NoMem,
            "rejected connection allocation of {n} bytes, limit is {MAX_ALLOCATION_SIZE}"
        );
        self.set_latch();
        SizeLimitSnafu { requested: n }.build()
    }

    fn allocate_sized(&mut self, n: i64) -> Result<(NonNull<u8>, usize), AllocError> {
        ensure!(!self.malloc_failed, LatchedSnafu);
        debug_assert!(
            self.bytes_freed.is_none(),
            "allocation while byte accounting is active"
        );

        if let Some(ptr) = self.lookaside.try_take(slot_request(n)) {
            memdebug::set_type(ptr, MemType::LOOKASIDE | MemType::DB);
            return Ok((ptr, slot_request(n)));
        }

        let Some(size) = checked_size(n) else {
            return Err(self.reject_size(n));
        };
        memdebug::assert_unlatched(self.malloc_failed);
        let Some(ptr) = self.env.allocate(n) else {
            self.set_latch();
            return OutOfMemorySnafu { requested: n }.fail();
        };
        memdebug::set_type(ptr, MemType::HEAP | MemType::DB);
        Ok((ptr, size.get()))
    }

    /// Allocates `n` bytes, from the lookaside pool if possible.
    ///
    /// Any `n` up to the slot size, zero and negative sizes included, is
    /// served from a free slot. Otherwise `n` must lie in
    /// `1..MAX_ALLOCATION_SIZE`.
    ///
    /// Fails without consulting any allocator if the latch is set. Every
    /// other failure, including an out-of-range `n`, sets the latch.
    pub fn allocate_raw(&mut self, n: i64) -> Result<NonNull<u8>, AllocError> {
        self.allocate_sized(n).map(|(ptr, _)| ptr)
    }

    /// Allocates `n` bytes and zeroes them.
    pub fn allocate_zeroed(&mut self, n: i64) -> Result<NonNull<u8>, AllocError> {
        let (ptr, size) = self.allocate_sized(n)?;
        unsafe {
            ptr.write_bytes(0, size);
        }
        Ok(ptr)
    }

    /// Releases a block. `None` is a no-op.
    ///
    /// While byte accounting is active the block's size is tallied and the
    /// block stays allocated.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn free(&mut self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        let in_lookaside = self.lookaside.contains(ptr);
        if in_lookaside {
            assert!(
                memdebug::has_type(ptr, MemType::LOOKASIDE),
                "lookaside slot freed twice"
            );
        } else {
            assert!(
                memdebug::has_type(ptr, MemType::DB),
                "freeing a block this connection does not own"
            );
        }

        if let Some(total) = self.bytes_freed {
            let size = unsafe { self.allocation_size(Some(ptr)) };
            self.bytes_freed = Some(total + size);
            return;
        }

        if in_lookaside {
            memdebug::clear(ptr);
            unsafe {
                self.lookaside.give_back(ptr);
            }
            return;
        }

        assert!(memdebug::has_type(ptr, MemType::HEAP));
        assert!(memdebug::no_type(ptr, MemType::LOOKASIDE));
        memdebug::clear(ptr);
        unsafe {
            self.env.free(Some(ptr));
        }
    }

    /// Resizes a block to `n` bytes.
    ///
    /// - `ptr == None` behaves as [`allocate_raw(n)`](Self::allocate_raw).
    /// - A lookaside slot asked to hold no more than the slot size is
    ///   returned unchanged.
    /// - A lookaside slot asked to grow moves to a new block. Only the slot
    ///   size is known, so the whole slot is copied; bytes past the old
    ///   requested size are unspecified in the new block.
    ///
    /// On failure the latch is set and `ptr` stays valid and unchanged; the
    /// caller still owns it.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn resize(
        &mut self,
        ptr: Option<NonNull<u8>>,
        n: i64,
    ) -> Result<NonNull<u8>, AllocError> {
        ensure!(!self.malloc_failed, LatchedSnafu);
        let Some(ptr) = ptr else {
            return self.allocate_raw(n);
        };
        assert!(
            memdebug::has_type(ptr, MemType::DB),
            "resizing a block this connection does not own"
        );
        if self.lookaside.contains(ptr) {
            let slot_size = self.lookaside.slot_size();
            if slot_request(n) <= slot_size {
                return Ok(ptr);
            }
            let new_ptr = self.allocate_raw(n)?;
            unsafe {
                ptr.copy_to_nonoverlapping(new_ptr, slot_size);
                self.free(Some(ptr));
            }
            return Ok(new_ptr);
        }

        if checked_size(n).is_none() {
            return Err(self.reject_size(n));
        }
        assert!(memdebug::has_type(ptr, MemType::HEAP));
        memdebug::assert_unlatched(self.malloc_failed);
        let Some(new_ptr) = (unsafe { self.env.resize(Some(ptr), n) }) else {
            self.set_latch();
            return OutOfMemorySnafu { requested: n }.fail();
        };
        memdebug::clear(ptr);
        memdebug::set_type(new_ptr, MemType::HEAP | MemType::DB);
        Ok(new_ptr)
    }

    /// Resizes a block, releasing it if the resize fails.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    pub unsafe fn realloc_or_free(
        &mut self,
        ptr: Option<NonNull<u8>>,
        n: i64,
    ) -> Result<NonNull<u8>, AllocError> {
        let result = unsafe { self.resize(ptr, n) };
        if result.is_err() {
            unsafe {
                self.free(ptr);
            }
        }
        result
    }

    /// Reports the usable size of a block. `None` reports zero.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by this allocator and not freed since.
    #[must_use]
    pub unsafe fn allocation_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        match ptr {
            Some(ptr) if self.lookaside.contains(ptr) => self.lookaside.slot_size(),
            ptr => unsafe { self.env.allocation_size(ptr) },
        }
    }

    /// The checkpoint at the end of every public operation.
    ///
    /// If the latch is set, or `rc` already reports running out of memory,
    /// the latch is cleared, [`error_code`](Self::error_code) becomes
    /// [`ResultCode::NoMem`] and `NoMem` is returned. Otherwise `rc` is
    /// returned unchanged.
    pub fn api_exit(&mut self, rc: ResultCode) -> ResultCode {
        if !self.malloc_failed && !rc.is_nomem() {
            return rc;
        }
        if self.malloc_failed {
            heap::debug!(ResultCode::NoMem, "clearing allocation latch at api exit");
        }
        self.malloc_failed = false;
        self.error_code = ResultCode::NoMem;
        ResultCode::NoMem
    }

    /// Runs one public operation and applies [`api_exit`](Self::api_exit)
    /// to its result.
    pub fn with_api_exit<F>(&mut self, f: F) -> ResultCode
    where
        F: FnOnce(&mut Self) -> ResultCode,
    {
        let rc = f(self);
        self.api_exit(rc)
    }

    /// Starts tallying freed bytes instead of freeing.
    pub fn begin_bytes_freed(&mut self) {
        debug_assert!(self.bytes_freed.is_none(), "byte accounting already active");
        self.bytes_freed = Some(0);
    }

    /// Stops tallying and returns the bytes counted since
    /// [`begin_bytes_freed`](Self::begin_bytes_freed).
    pub fn end_bytes_freed(&mut self) -> usize {
        self.bytes_freed.take().unwrap_or(0)
    }

    /// Runs `f` with byte accounting active and returns the bytes its frees
    /// would have released.
    pub fn count_bytes_freed<F>(&mut self, f: F) -> usize
    where
        F: FnOnce(&mut Self),
    {
        self.begin_bytes_freed();
        f(self);
        self.end_bytes_freed()
    }

    /// Replaces the lookaside pool with one allocated from the environment.
    ///
    /// Returns [`ResultCode::Busy`] while slots are checked out. Otherwise
    /// returns [`ResultCode::Ok`], even if the new buffer could not be
    /// allocated, in which case the connection runs without a pool.
    #[must_use]
    pub fn configure_lookaside(&mut self, config: LookasideConfig) -> ResultCode {
        if let Err(rc) = self.release_lookaside() {
            return rc;
        }
        let config = config.normalized();
        let Some(total) = config
            .buffer_size()
            .and_then(|size| i64::try_from(size).ok())
            .filter(|_| config.is_enabled())
        else {
            heap::info!(ResultCode::Ok, "lookaside disabled");
            return ResultCode::Ok;
        };
        let Some(base) = self.env.allocate(total) else {
            heap::info!(
                ResultCode::NoMem,
                "lookaside disabled, no memory for {total} bytes"
            );
            return ResultCode::Ok;
        };
        let usable = unsafe { self.env.allocation_size(Some(base)) };
        let slot_count = usable / config.slot_size;
        unsafe {
            self.lookaside
                .install(base, config.slot_size, slot_count, Buffer::Owned(base));
        }
        heap::info!(
            ResultCode::Ok,
            "lookaside configured with {slot_count} slots of {} bytes",
            config.slot_size
        );
        ResultCode::Ok
    }

    /// Replaces the lookaside pool with one carved out of `buf`.
    ///
    /// `buf` is aligned up to [`ALIGNMENT`] and holds at most
    /// `config.slot_count` slots. Same return values as
    /// [`configure_lookaside`](Self::configure_lookaside).
    #[must_use]
    pub fn configure_lookaside_with_buffer(
        &mut self,
        buf: &'env mut [MaybeUninit<u8>],
        config: LookasideConfig,
    ) -> ResultCode {
        if let Err(rc) = self.release_lookaside() {
            return rc;
        }
        let config = config.normalized();
        let skip = buf.as_ptr().addr().wrapping_neg() % ALIGNMENT;
        let buf = buf.get_mut(skip..).unwrap_or_default();
        let slot_count = (buf.len() / config.slot_size.max(1)).min(config.slot_count);
        let Some(base) = NonNull::new(buf.as_mut_ptr().cast::<u8>()).filter(|_| slot_count > 0)
        else {
            heap::info!(ResultCode::Ok, "lookaside disabled");
            return ResultCode::Ok;
        };
        unsafe {
            self.lookaside
                .install(base, config.slot_size, slot_count, Buffer::Borrowed);
        }
        heap::info!(
            ResultCode::Ok,
            "lookaside configured with {slot_count} slots of {} bytes in a caller buffer",
            config.slot_size
        );
        ResultCode::Ok
    }

    fn release_lookaside(&mut self) -> Result<(), ResultCode> {
        if self.lookaside.outstanding() > 0 {
            return Err(ResultCode::Busy);
        }
        let buffer = self.lookaside.uninstall();
        unsafe {
            self.env.free(buffer);
        }
        Ok(())
    }

    /// Stops serving requests from the pool. Calls nest.
    pub fn disable_lookaside(&mut self) {
        self.lookaside.disable();
    }

    /// Undoes one [`disable_lookaside`](Self::disable_lookaside).
    pub fn enable_lookaside(&mut self) {
        self.lookaside.enable();
    }

    /// Returns `true` if the pool currently serves requests.
    #[must_use]
    pub fn lookaside_enabled(&self) -> bool {
        self.lookaside.is_enabled()
    }

    #[must_use]
    pub fn lookaside_slot_size(&self) -> usize {
        self.lookaside.slot_size()
    }

    #[must_use]
    pub fn lookaside_slot_count(&self) -> usize {
        self.lookaside.slot_count()
    }

    /// Reads a lookaside counter as `(current, high_water)`.
    ///
    /// For [`LookasideStatus::Used`], `reset` lowers the high-water mark to
    /// the current count; for the other kinds it zeroes the counter.
    pub fn lookaside_status(&mut self, kind: LookasideStatus, reset: bool) -> (usize, usize) {
        self.lookaside.status(kind, reset)
    }
}

impl Drop for ConnAllocator<'_> {
    fn drop(&mut self) {
        let out = self.lookaside.outstanding();
        if out > 0 {
            heap::error!(
                ResultCode::Misuse,
                "connection dropped with {out} lookaside slots outstanding"
            );
            return;
        }
        let buffer = self.lookaside.uninstall();
        unsafe {
            self.env.free(buffer);
        }
    }
}
