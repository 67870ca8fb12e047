//! Per-connection allocation on top of a shared [`Environment`].
//!
//! Every dynamic allocation a database connection makes goes through its
//! [`ConnAllocator`]. Small requests are served from a connection-private
//! lookaside pool of fixed-size slots; everything else is forwarded to the
//! environment.
//!
//! # Failure handling
//!
//! The first failed allocation sets a sticky latch on the connection. From
//! then on every allocation on that connection fails with
//! [`AllocError::Latched`] without consulting any allocator, until
//! [`ConnAllocator::api_exit`] reports the failure as
//! [`ResultCode::NoMem`] and clears the latch. A public operation therefore
//! only needs one check, at its exit:
//!
//! ```rust
//! use conn_alloc::{ConnAllocator, LookasideConfig};
//! use heap::{Environment, ResultCode};
//!
//! let env = Environment::system();
//! let mut conn = ConnAllocator::with_config(&env, LookasideConfig::new(128, 16));
//!
//! let rc = conn.with_api_exit(|conn| {
//!     let a = conn.allocate_raw(40).ok();
//!     let b = conn.allocate_zeroed(4000).ok();
//!     unsafe {
//!         conn.free(a);
//!         conn.free(b);
//!     }
//!     ResultCode::Ok
//! });
//! assert_eq!(rc, ResultCode::Ok);
//! ```
//!
//! # Features
//!
//! - `memdebug`: tag every block with its origin and check the tag when
//!   the block comes back. See [`memdebug`].

#![cfg_attr(not(test), no_std)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

pub use heap::{Environment, ResultCode};

pub use self::{
    connection::ConnAllocator,
    error::AllocError,
    lookaside::{LookasideConfig, LookasideStatus},
};

mod connection;
pub mod error;
mod lookaside;
pub mod memdebug;
mod text;
