//! Origin tags for blocks handed out by a connection.
//!
//! With the `memdebug` feature every block is tagged when it is handed out
//! and the tag is checked when it comes back, catching frees of foreign
//! pointers and double frees of lookaside slots. Without the feature every
//! hook compiles to nothing and every check passes.

use core::ptr::NonNull;

use bitflags::bitflags;

bitflags! {
    /// Where a block came from and who may release it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MemType: u8 {
        /// Served by the environment.
        const HEAP = 1 << 0;
        /// Served from a lookaside slot.
        const LOOKASIDE = 1 << 1;
        /// Owned by a connection and released through it.
        const DB = 1 << 2;
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "memdebug")] {
        use alloc::collections::BTreeMap;

        use spin::Mutex;

        static REGISTRY: Mutex<BTreeMap<usize, MemType>> = Mutex::new(BTreeMap::new());

        fn key(ptr: NonNull<u8>) -> usize {
            ptr.as_ptr().addr()
        }
    }
}

/// Tags `ptr`, replacing any previous tag.
#[inline]
pub fn set_type(ptr: NonNull<u8>, ty: MemType) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "memdebug")] {
            REGISTRY.lock().insert(key(ptr), ty);
        } else {
            let _ = (ptr, ty);
        }
    }
}

/// Returns `true` if `ptr` carries any of the bits in `ty`.
#[inline]
#[must_use]
pub fn has_type(ptr: NonNull<u8>, ty: MemType) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(feature = "memdebug")] {
            REGISTRY
                .lock()
                .get(&key(ptr))
                .is_some_and(|tag| tag.intersects(ty))
        } else {
            let _ = (ptr, ty);
            true
        }
    }
}

/// Returns `true` if `ptr` carries none of the bits in `ty`.
#[inline]
#[must_use]
pub fn no_type(ptr: NonNull<u8>, ty: MemType) -> bool {
    cfg_if::cfg_if! {
        if #[cfg(feature = "memdebug")] {
            REGISTRY
                .lock()
                .get(&key(ptr))
                .is_none_or(|tag| !tag.intersects(ty))
        } else {
            let _ = (ptr, ty);
            true
        }
    }
}

/// Forgets the tag of `ptr`.
#[inline]
pub fn clear(ptr: NonNull<u8>) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "memdebug")] {
            REGISTRY.lock().remove(&key(ptr));
        } else {
            let _ = ptr;
        }
    }
}

/// Panics if the environment is about to be consulted while the
/// connection's failure latch is set.
#[inline]
#[track_caller]
pub fn assert_unlatched(latched: bool) {
    cfg_if::cfg_if! {
        if #[cfg(feature = "memdebug")] {
            assert!(!latched, "environment consulted while allocation is latched");
        } else {
            let _ = latched;
        }
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_are_distinct() {
        let all = MemType::HEAP | MemType::LOOKASIDE | MemType::DB;
        assert_eq!(all.bits().count_ones(), 3);
    }

    #[cfg(not(feature = "memdebug"))]
    #[test]
    fn test_hooks_are_inert() {
        let mut byte = 0_u8;
        let ptr = NonNull::from(&mut byte);
        set_type(ptr, MemType::HEAP);
        assert!(has_type(ptr, MemType::LOOKASIDE));
        assert!(no_type(ptr, MemType::HEAP));
        clear(ptr);
        assert_unlatched(true);
    }

    #[cfg(feature = "memdebug")]
    #[test]
    fn test_registry_tracks_tags() {
        let mut byte = 0_u8;
        let ptr = NonNull::from(&mut byte);
        assert!(!has_type(ptr, MemType::DB));
        assert!(no_type(ptr, MemType::DB));

        set_type(ptr, MemType::LOOKASIDE | MemType::DB);
        assert!(has_type(ptr, MemType::DB));
        assert!(has_type(ptr, MemType::HEAP | MemType::LOOKASIDE));
        assert!(no_type(ptr, MemType::HEAP));

        clear(ptr);
        assert!(!has_type(ptr, MemType::LOOKASIDE));
    }

    #[cfg(feature = "memdebug")]
    #[test]
    #[should_panic = "latched"]
    fn test_latched_environment_access_panics() {
        assert_unlatched(true);
    }
}
