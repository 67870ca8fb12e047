//! Connection-private pool of fixed-size slots.
//!
//! The pool is one contiguous buffer cut into `slot_count` slots of
//! `slot_size` bytes. Free slots are tracked by index on an explicit stack
//! instead of by links stored inside the slots, so a slot's bytes belong to
//! its caller alone while it is checked out.
//!
//! Whether a pointer belongs to the pool is decided by comparing it against
//! the buffer bounds, never by searching the free stack.

use alloc::vec::Vec;
use core::{mem, ptr::NonNull};

use heap::ALIGNMENT;

/// Shape of a lookaside pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookasideConfig {
    /// Bytes per slot.
    pub slot_size: usize,
    /// Number of slots.
    pub slot_count: usize,
}

impl Default for LookasideConfig {
    fn default() -> Self {
        Self::new(1200, 100)
    }
}

impl LookasideConfig {
    #[must_use]
    pub const fn new(slot_size: usize, slot_count: usize) -> Self {
        Self {
            slot_size,
            slot_count,
        }
    }

    /// A configuration without a pool. Every request goes to the
    /// environment.
    #[must_use]
    pub const fn disabled() -> Self {
        Self::new(0, 0)
    }

    /// Rounds the slot size down to a multiple of [`ALIGNMENT`] and turns
    /// degenerate shapes into [`disabled`](Self::disabled).
    ///
    /// A slot must be larger than one pointer to be useful.
    #[must_use]
    pub const fn normalized(self) -> Self {
        let slot_size = self.slot_size / ALIGNMENT * ALIGNMENT;
        if slot_size <= mem::size_of::<*mut u8>() || self.slot_count == 0 {
            return Self::disabled();
        }
        Self::new(slot_size, self.slot_count)
    }

    #[must_use]
    pub const fn is_enabled(self) -> bool {
        self.normalized().slot_count > 0
    }

    /// Total buffer size, or `None` on overflow.
    #[must_use]
    pub const fn buffer_size(self) -> Option<usize> {
        self.slot_size.checked_mul(self.slot_count)
    }
}

/// Counter selected by
/// [`ConnAllocator::lookaside_status`](crate::ConnAllocator::lookaside_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookasideStatus {
    /// Slots currently checked out, with the high-water mark.
    Used,
    /// Requests served from the pool.
    Hit,
    /// Requests too large for a slot.
    MissSize,
    /// Requests that fit but found the pool empty.
    MissFull,
}

/// Where the pool's buffer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Buffer {
    None,
    /// Allocated from the environment; released by the connection.
    Owned(NonNull<u8>),
    /// Lent by the caller.
    Borrowed,
}

pub(crate) struct Lookaside {
    base: Option<NonNull<u8>>,
    start: usize,
    end: usize,
    slot_size: usize,
    free: Vec<usize>,
    buffer: Buffer,
    out: usize,
    max_out: usize,
    disabled: u32,
    hit: usize,
    miss_size: usize,
    miss_full: usize,
}

// The pool is only touched through `&mut ConnAllocator`.
unsafe impl Send for Lookaside {}

impl Lookaside {
    pub(crate) const fn empty() -> Self {
        Self {
            base: None,
            start: 0,
            end: 0,
            slot_size: 0,
            free: Vec::new(),
            buffer: Buffer::None,
            out: 0,
            max_out: 0,
            disabled: 0,
            hit: 0,
            miss_size: 0,
            miss_full: 0,
        }
    }

    /// Cuts `base` into `slot_count` slots of `slot_size` bytes.
    ///
    /// Must only be called while no slot is checked out. The nesting
    /// counter of [`disable`](Self::disable) and the hit counters survive.
    ///
    /// # Safety
    ///
    /// `base` must be aligned to [`ALIGNMENT`] and valid for reads and writes
    /// of `slot_size * slot_count` bytes for as long as the pool uses it.
    pub(crate) unsafe fn install(
        &mut self,
        base: NonNull<u8>,
        slot_size: usize,
        slot_count: usize,
        buffer: Buffer,
    ) {
        debug_assert_eq!(self.out, 0);
        debug_assert!(slot_size.is_multiple_of(ALIGNMENT));
        debug_assert!(base.as_ptr().addr().is_multiple_of(ALIGNMENT));
        self.base = Some(base);
        self.start = base.as_ptr().addr();
        self.end = self.start + slot_size * slot_count;
        self.slot_size = slot_size;
        self.free.clear();
        self.free.extend(0..slot_count);
        self.buffer = buffer;
    }

    /// Forgets the buffer and returns it if the environment owns it.
    pub(crate) fn uninstall(&mut self) -> Option<NonNull<u8>> {
        debug_assert_eq!(self.out, 0);
        let buffer = mem::replace(&mut self.buffer, Buffer::None);
        self.base = None;
        self.start = 0;
        self.end = 0;
        self.slot_size = 0;
        self.free = Vec::new();
        match buffer {
            Buffer::Owned(ptr) => Some(ptr),
            Buffer::None | Buffer::Borrowed => None,
        }
    }

    /// Returns `true` if a buffer is installed and the pool is not disabled.
    pub(crate) fn is_enabled(&self) -> bool {
        self.base.is_some() && self.disabled == 0
    }

    pub(crate) fn disable(&mut self) {
        self.disabled += 1;
    }

    pub(crate) fn enable(&mut self) {
        debug_assert!(self.disabled > 0, "unbalanced lookaside enable");
        self.disabled = self.disabled.saturating_sub(1);
    }

    pub(crate) fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub(crate) fn slot_count(&self) -> usize {
        (self.end - self.start) / self.slot_size.max(1)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.out
    }

    pub(crate) fn contains(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr().addr();
        self.start <= addr && addr < self.end
    }

    /// Checks out a slot for a request of `size` bytes, counting the
    /// outcome.
    pub(crate) fn try_take(&mut self, size: usize) -> Option<NonNull<u8>> {
        if !self.is_enabled() {
            return None;
        }
        if size > self.slot_size {
            self.miss_size += 1;
            return None;
        }
        let (Some(base), Some(index)) = (self.base, self.free.pop()) else {
            self.miss_full += 1;
            return None;
        };
        self.hit += 1;
        self.out += 1;
        self.max_out = self.max_out.max(self.out);
        Some(unsafe { base.add(index * self.slot_size) })
    }

    /// Returns a slot to the free stack.
    ///
    /// # Safety
    ///
    /// `ptr` must be a slot handed out by [`try_take`](Self::try_take) and
    /// not returned since.
    pub(crate) unsafe fn give_back(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.contains(ptr));
        let offset = ptr.as_ptr().addr() - self.start;
        debug_assert!(offset.is_multiple_of(self.slot_size));
        debug_assert!(self.out > 0, "lookaside slot returned twice");
        self.free.push(offset / self.slot_size);
        self.out -= 1;
    }

    /// Reads a counter as `(current, high_water)`. With `reset`, the
    /// high-water mark restarts from the current value.
    pub(crate) fn status(&mut self, kind: LookasideStatus, reset: bool) -> (usize, usize) {
        let counter = match kind {
            LookasideStatus::Used => {
                let status = (self.out, self.max_out);
                if reset {
                    self.max_out = self.out;
                }
                return status;
            }
            LookasideStatus::Hit => &mut self.hit,
            LookasideStatus::MissSize => &mut self.miss_size,
            LookasideStatus::MissFull => &mut self.miss_full,
        };
        let status = (0, *counter);
        if reset {
            *counter = 0;
        }
        status
    }
}
