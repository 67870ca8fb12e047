//! The environment allocator.
//!
//! An [`Environment`] owns one [`HeapDriver`] and validates every request
//! before the driver sees it: sizes must be in `1..MAX_ALLOCATION_SIZE`,
//! null pointers are handled here, and every returned pointer is aligned
//! to [`ALIGNMENT`].
//!
//! Isolated instances pass their own `Environment` by reference. Everything
//! else shares [`Environment::default_env`], which is built on first use and
//! lives for the rest of the process.

use alloc::boxed::Box;
use core::{
    num::NonZeroUsize,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
};

use spin::{Mutex, Once};

use crate::{ALIGNMENT, HeapDriver, HeapError, ResultCode, SystemHeap, realign::Realigned};

/// Upper bound (exclusive) on a single request.
///
/// Kept well below `i32::MAX` so that a driver adding its own bookkeeping
/// to the request never overflows.
pub const MAX_ALLOCATION_SIZE: i64 = 0x7fff_ff00;

/// Converts a requested byte count into a size the driver accepts.
///
/// Returns `None` for `n <= 0` and for `n >= MAX_ALLOCATION_SIZE`.
#[must_use]
pub fn checked_size(n: i64) -> Option<NonZeroUsize> {
    if n >= MAX_ALLOCATION_SIZE {
        return None;
    }
    NonZeroUsize::new(usize::try_from(n).ok()?)
}

fn log_rejected(n: i64) {
    let code = if n > 0 {
        ResultCode::TooBig
    } else {
        ResultCode::NoMem
    };
    crate::debug!(
        code,
        "rejected allocation request of {n} bytes, limit is {MAX_ALLOCATION_SIZE}"
    );
}

static DEFAULT_ENV: Once<Environment> = Once::new();

/// The process-level allocator every connection ultimately draws from.
///
/// Wraps one [`HeapDriver`], rejects sizes outside
/// `1..MAX_ALLOCATION_SIZE` before the driver sees them, and initializes
/// the driver on first use.
pub struct Environment {
    driver: Box<dyn HeapDriver>,
    initialized: AtomicBool,
    init_lock: Mutex<()>,
}

impl Environment {
    /// Creates an environment over `driver`.
    ///
    /// A driver that cannot guarantee [`ALIGNMENT`] is wrapped so that it
    /// can.
    pub fn new<D>(driver: D) -> Self
    where
        D: HeapDriver + 'static,
    {
        let driver: Box<dyn HeapDriver> = if driver.alignment() < ALIGNMENT {
            Box::new(Realigned::new(driver))
        } else {
            Box::new(driver)
        };
        Self {
            driver,
            initialized: AtomicBool::new(false),
            init_lock: Mutex::new(()),
        }
    }

    /// Creates an environment over [`SystemHeap`].
    #[must_use]
    pub fn system() -> Self {
        Self::new(SystemHeap)
    }

    /// Returns the process-wide environment used when no explicit one is
    /// supplied.
    ///
    /// It is constructed exactly once, on the first call.
    pub fn default_env() -> &'static Self {
        DEFAULT_ENV.call_once(Self::system)
    }

    /// Runs the driver's initialization hook unless it already ran.
    pub fn initialize(&self) -> Result<(), HeapError> {
        if self.initialized.load(Ordering::Acquire) {
            return Ok(());
        }
        let _guard = self.init_lock.lock();
        if self.initialized.load(Ordering::Relaxed) {
            return Ok(());
        }
        self.driver.init()?;
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    /// Runs the driver's shutdown hook if it was initialized.
    ///
    /// The next allocation initializes the driver again.
    pub fn shutdown(&self) {
        let _guard = self.init_lock.lock();
        if self.initialized.swap(false, Ordering::AcqRel) {
            self.driver.shutdown();
        }
    }

    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn ensure_initialized(&self) -> bool {
        match self.initialize() {
            Ok(()) => true,
            Err(err) => {
                crate::error!(ResultCode::Error, "{err} (at {})", err.location());
                false
            }
        }
    }

    /// Allocates `n` bytes.
    ///
    /// Returns `None` if `n` is out of range or the driver is exhausted.
    #[must_use]
    pub fn allocate(&self, n: i64) -> Option<NonNull<u8>> {
        if !self.ensure_initialized() {
            return None;
        }
        let Some(size) = checked_size(n) else {
            log_rejected(n);
            return None;
        };
        let ptr = self.driver.allocate(size)?;
        debug_assert!(ptr.as_ptr().addr().is_multiple_of(ALIGNMENT));
        Some(ptr)
    }

    /// Allocates `n` bytes and zeroes them.
    #[must_use]
    pub fn allocate_zeroed(&self, n: i64) -> Option<NonNull<u8>> {
        let ptr = self.allocate(n)?;
        let size = checked_size(n)?;
        unsafe {
            ptr.write_bytes(0, size.get());
        }
        Some(ptr)
    }

    /// Releases a block. `None` is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this environment's `allocate` family and must
    /// not have been freed since.
    pub unsafe fn free(&self, ptr: Option<NonNull<u8>>) {
        let Some(ptr) = ptr else {
            return;
        };
        unsafe {
            self.driver.free(ptr);
        }
    }

    /// Resizes a block to `n` bytes.
    ///
    /// - `ptr == None` behaves as [`allocate(n)`](Self::allocate).
    /// - `n <= 0` frees `ptr` and returns `None`.
    /// - On failure `None` is returned and `ptr` stays valid and unchanged.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this environment's `allocate` family and must
    /// not have been freed since.
    #[must_use]
    pub unsafe fn resize(&self, ptr: Option<NonNull<u8>>, n: i64) -> Option<NonNull<u8>> {
        if !self.ensure_initialized() {
            return None;
        }
        let Some(ptr) = ptr else {
            return self.allocate(n);
        };
        if n <= 0 {
            unsafe {
                self.free(Some(ptr));
            }
            return None;
        }
        let Some(size) = checked_size(n) else {
            log_rejected(n);
            return None;
        };
        let new_ptr = unsafe { self.driver.resize(ptr, size)? };
        debug_assert!(new_ptr.as_ptr().addr().is_multiple_of(ALIGNMENT));
        Some(new_ptr)
    }

    /// Reports the usable size of a block. `None` reports zero.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this environment's `allocate` family and must
    /// not have been freed since.
    #[must_use]
    pub unsafe fn allocation_size(&self, ptr: Option<NonNull<u8>>) -> usize {
        ptr.map_or(0, |ptr| unsafe { self.driver.usable_size(ptr) })
    }
}
