//! Pluggable heap drivers and the environment allocator built on them.
//!
//! This crate is the bottom half of the engine's memory layer. It knows
//! nothing about connections or caches; it turns a raw [`HeapDriver`] into
//! an [`Environment`] that validates every request and never panics on
//! exhaustion.
//!
//! # Drivers
//!
//! ## [`SystemHeap`]
//!
//! The default driver. Blocks come from the global Rust allocator and carry
//! an 8-byte size header so that [`Environment::allocation_size`] can be
//! answered without help from the allocator.
//!
//! ## [`LibcHeap`] (feature `libc`)
//!
//! Blocks come from `malloc`. On platforms where the C library can report
//! the usable size of a block, no header is needed.
//!
//! ## Custom drivers
//!
//! Anything implementing [`HeapDriver`] can be installed with
//! [`Environment::new`]. A driver that cannot align blocks to [`ALIGNMENT`]
//! only has to say so through [`HeapDriver::alignment`]; the environment
//! pads its blocks.
//!
//! # Usage
//!
//! ```rust
//! use heap::Environment;
//!
//! let env = Environment::system();
//! let ptr = env.allocate(100).unwrap();
//! assert_eq!(ptr.as_ptr().addr() % heap::ALIGNMENT, 0);
//! unsafe {
//!     assert!(env.allocation_size(Some(ptr)) >= 100);
//!     let ptr = env.resize(Some(ptr), 200).unwrap();
//!     env.free(Some(ptr));
//! }
//!
//! // Out-of-range requests are refused, not clamped.
//! assert!(env.allocate(0).is_none());
//! assert!(env.allocate(heap::MAX_ALLOCATION_SIZE).is_none());
//! ```
//!
//! # Diagnostics
//!
//! Drivers report exhaustion through the [`log`] module, tagged with
//! [`ResultCode::NoMem`]. Records are dropped until a sink is installed
//! with [`log::set_logger`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use self::{
    code::ResultCode,
    driver::{ALIGNMENT, HeapDriver, round8},
    env::{Environment, MAX_ALLOCATION_SIZE, checked_size},
    error::{HeapError, Location},
    system::SystemHeap,
};

#[cfg(feature = "libc")]
pub use self::libc_heap::LibcHeap;

mod code;
mod driver;
mod env;
pub mod error;
#[cfg(feature = "libc")]
mod libc_heap;
pub mod log;
mod realign;
mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
