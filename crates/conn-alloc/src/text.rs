//! NUL-terminated strings owned by a connection.

use core::{
    ffi::CStr,
    fmt::{self, Write as _},
    ptr::NonNull,
};

use crate::{AllocError, ConnAllocator};

const INITIAL_CAPACITY: usize = 64;

/// Converts a byte count into a request size, saturating so that oversized
/// counts are rejected by the size check instead of wrapping.
fn request(len: usize) -> i64 {
    len.checked_add(1)
        .and_then(|n| i64::try_from(n).ok())
        .unwrap_or(i64::MAX)
}

impl ConnAllocator<'_> {
    /// Copies `s`, including its terminator, into a new block.
    ///
    /// `None` yields `Ok(None)` and leaves the latch alone.
    pub fn str_dup(&mut self, s: Option<&CStr>) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(s) = s else {
            return Ok(None);
        };
        let bytes = s.to_bytes_with_nul();
        let ptr = self.allocate_raw(request(bytes.len() - 1))?;
        unsafe {
            ptr.copy_from_nonoverlapping(NonNull::from(bytes).cast(), bytes.len());
        }
        Ok(Some(ptr))
    }

    /// Copies the first `n` bytes of `s` into a new block of `n + 1` bytes
    /// and terminates it.
    ///
    /// If `s` is shorter than `n`, the rest of the block is zero-filled.
    /// `None` yields `Ok(None)` and leaves the latch alone.
    pub fn str_ndup(
        &mut self,
        s: Option<&[u8]>,
        n: usize,
    ) -> Result<Option<NonNull<u8>>, AllocError> {
        let Some(s) = s else {
            return Ok(None);
        };
        let ptr = self.allocate_raw(request(n))?;
        let copied = s.len().min(n);
        unsafe {
            ptr.copy_from_nonoverlapping(NonNull::from(s).cast(), copied);
            ptr.add(copied).write_bytes(0, n + 1 - copied);
        }
        Ok(Some(ptr))
    }

    /// Renders `args` into a new NUL-terminated block.
    ///
    /// The block grows through [`realloc_or_free`](Self::realloc_or_free),
    /// so nothing leaks if memory runs out halfway. A `Display`
    /// implementation that reports an error truncates the output.
    pub fn mprintf(&mut self, args: fmt::Arguments<'_>) -> Result<NonNull<u8>, AllocError> {
        let mut text = TextBuf::new(self, INITIAL_CAPACITY)?;
        let _ = text.write_fmt(args);
        text.finish()
    }

    /// Replaces the string in `slot` with the rendering of `args`.
    ///
    /// The previous string is freed whether or not rendering succeeds; on
    /// failure `slot` is left empty.
    ///
    /// # Safety
    ///
    /// A string in `slot` must have been returned by this allocator and not
    /// freed since.
    pub unsafe fn set_string(
        &mut self,
        slot: &mut Option<NonNull<u8>>,
        args: fmt::Arguments<'_>,
    ) -> Result<(), AllocError> {
        let rendered = self.mprintf(args);
        unsafe {
            self.free(slot.take());
        }
        *slot = Some(rendered?);
        Ok(())
    }
}

/// Growable text buffer in connection-owned memory.
///
/// One byte of capacity is always kept for the terminator.
struct TextBuf<'a, 'env> {
    alloc: &'a mut ConnAllocator<'env>,
    ptr: Option<NonNull<u8>>,
    len: usize,
    cap: usize,
    error: Option<AllocError>,
}

impl<'a, 'env> TextBuf<'a, 'env> {
    fn new(alloc: &'a mut ConnAllocator<'env>, cap: usize) -> Result<Self, AllocError> {
        let ptr = alloc.allocate_raw(request(cap - 1))?;
        Ok(Self {
            alloc,
            ptr: Some(ptr),
            len: 0,
            cap,
            error: None,
        })
    }

    fn reserve(&mut self, additional: usize) -> Result<NonNull<u8>, AllocError> {
        let needed = self.len + additional + 1;
        if let Some(ptr) = self.ptr
            && needed <= self.cap
        {
            return Ok(ptr);
        }
        let cap = needed.max(self.cap.saturating_mul(2));
        let new_ptr = unsafe { self.alloc.realloc_or_free(self.ptr.take(), request(cap - 1))? };
        self.ptr = Some(new_ptr);
        self.cap = cap;
        Ok(new_ptr)
    }

    fn finish(mut self) -> Result<NonNull<u8>, AllocError> {
        if let Some(err) = self.error.take() {
            return Err(err);
        }
        let ptr = self.reserve(0)?;
        unsafe {
            ptr.add(self.len).write(0);
        }
        Ok(ptr)
    }
}

impl fmt::Write for TextBuf<'_, '_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        if self.error.is_some() {
            return Err(fmt::Error);
        }
        let ptr = match self.reserve(s.len()) {
            Ok(ptr) => ptr,
            Err(err) => {
                self.error = Some(err);
                return Err(fmt::Error);
            }
        };
        unsafe {
            ptr.add(self.len)
                .copy_from_nonoverlapping(NonNull::from(s.as_bytes()).cast(), s.len());
        }
        self.len += s.len();
        Ok(())
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::string::String;

    use heap::{Environment, ResultCode, testing::CountingHeap};

    use super::*;
    use crate::{LookasideConfig, LookasideStatus};

    unsafe fn read(ptr: NonNull<u8>) -> String {
        unsafe {
            CStr::from_ptr(ptr.as_ptr().cast())
                .to_str()
                .unwrap()
                .to_owned()
        }
    }

    #[test]
    fn test_str_dup() {
        let env = Environment::system();
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::new(64, 4));
        let ptr = conn.str_dup(Some(c"hello")).unwrap().unwrap();
        unsafe {
            assert_eq!(read(ptr), "hello");
            conn.free(Some(ptr));
        }
        assert_eq!(conn.str_dup(None).unwrap(), None);

        let empty = conn.str_dup(Some(c"")).unwrap().unwrap();
        unsafe {
            assert_eq!(read(empty), "");
            conn.free(Some(empty));
        }
    }

    #[test]
    fn test_str_ndup() {
        let env = Environment::system();
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::disabled());
        let ptr = conn.str_ndup(Some(b"abcdef".as_slice()), 3).unwrap().unwrap();
        unsafe {
            assert_eq!(read(ptr), "abc");
            conn.free(Some(ptr));
        }

        let ptr = conn.str_ndup(Some(b"ab".as_slice()), 5).unwrap().unwrap();
        unsafe {
            assert_eq!(read(ptr), "ab");
            for i in 2..=5 {
                assert_eq!(ptr.add(i).read(), 0);
            }
            conn.free(Some(ptr));
        }
        assert_eq!(conn.str_ndup(None, 10).unwrap(), None);
    }

    #[test]
    fn test_null_input_ignores_latch() {
        let heap = CountingHeap::new();
        let stats = heap.stats();
        let env = Environment::new(heap);
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::disabled());
        stats.set_fail_all(true);
        assert!(conn.str_dup(Some(c"x")).is_err());
        assert!(conn.malloc_failed());
        assert_eq!(conn.str_dup(None).unwrap(), None);
        assert!(conn.str_dup(Some(c"x")).unwrap_err().is_latched());
        assert_eq!(conn.api_exit(ResultCode::Ok), ResultCode::NoMem);
    }

    #[test]
    fn test_str_ndup_oversized_is_rejected() {
        let env = Environment::system();
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::disabled());
        let err = conn.str_ndup(Some(b"".as_slice()), usize::MAX).unwrap_err();
        assert!(matches!(err, AllocError::SizeLimit { .. }));
        assert!(conn.malloc_failed());
    }

    #[test]
    fn test_mprintf_grows_out_of_lookaside() {
        let env = Environment::system();
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::new(64, 4));
        let short = conn.mprintf(format_args!("{}-{}", 1, "two")).unwrap();
        unsafe {
            assert_eq!(read(short), "1-two");
            assert_eq!(conn.allocation_size(Some(short)), 64);
        }

        let word = "lookaside";
        let long = conn.mprintf(format_args!("{word:>200}|")).unwrap();
        unsafe {
            let text = read(long);
            assert_eq!(text.len(), 201);
            assert!(text.ends_with("lookaside|"));
            conn.free(Some(short));
            conn.free(Some(long));
        }
        assert_eq!(conn.lookaside_status(LookasideStatus::Used, false).0, 0);
    }

    #[test]
    fn test_mprintf_failure_leaks_nothing() {
        let heap = CountingHeap::new();
        let stats = heap.stats();
        let env = Environment::new(heap);
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::disabled());
        stats.set_capacity(Some(128));
        let err = conn.mprintf(format_args!("{:>500}", 0)).unwrap_err();
        assert!(matches!(err, AllocError::OutOfMemory { .. }));
        assert_eq!(stats.live_bytes(), 0);
        assert_eq!(conn.api_exit(ResultCode::Ok), ResultCode::NoMem);
    }

    #[test]
    fn test_set_string_replaces_previous() {
        let heap = CountingHeap::new();
        let stats = heap.stats();
        let env = Environment::new(heap);
        let mut conn = ConnAllocator::with_config(&env, LookasideConfig::disabled());
        let mut slot = None;
        unsafe {
            conn.set_string(&mut slot, format_args!("first {}", 1)).unwrap();
            assert_eq!(read(slot.unwrap()), "first 1");
            conn.set_string(&mut slot, format_args!("second")).unwrap();
            assert_eq!(read(slot.unwrap()), "second");
            assert_eq!(stats.frees(), 1);

            stats.set_fail_all(true);
            assert!(conn.set_string(&mut slot, format_args!("third")).is_err());
            assert_eq!(slot, None);
            assert_eq!(stats.live_bytes(), 0);
        }
    }
}
