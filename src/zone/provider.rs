use std::ptr::NonNull;

use thiserror::Error;

/// Errors surfaced by the zone layer and its collaborators.
///
/// Only resource-level failures are reported this way. Corruption,
/// double-free, and accounting mismatches are deliberately fatal panics:
/// recovering from them could mask exploitation.
#[derive(Debug, Error)]
pub enum ZoneError {
    #[error("address space reservation failed: {0}")]
    ReserveFailed(#[source] std::io::Error),
    #[error("page population failed: {0}")]
    PopulateFailed(#[source] std::io::Error),
    #[error("page depopulation failed: {0}")]
    DepopulateFailed(#[source] std::io::Error),
    #[error("address space release failed: {0}")]
    ReleaseFailed(#[source] std::io::Error),
    #[error("invalid zone configuration: {0}")]
    BadConfig(String),
    #[error("element size {elem_size} does not fit a chunk of {chunk_bytes} bytes")]
    ElementTooLarge { elem_size: usize, chunk_bytes: usize },
    #[error("stale or invalid zone handle")]
    StaleHandle,
    #[error("zone is not destructible")]
    NotDestructible,
}

/// Backing-page provider for zone chunks.
///
/// Zones reserve address space for whole chunks up front and populate or
/// depopulate physical pages behind that reservation as they grow and shrink.
/// The default implementation is [`PlatformProvider`]; tests may substitute
/// their own to observe or fail these transitions.
pub trait PageProvider: Send + Sync {
    /// Reserve `bytes` of address space without backing pages.
    ///
    /// # Safety
    /// Performs raw VM syscalls; the returned range must only be accessed
    /// after a successful [`populate`](Self::populate).
    unsafe fn reserve(&self, bytes: usize) -> Result<NonNull<u8>, ZoneError>;

    /// Back `[ptr, ptr + bytes)` with physical pages (read/write).
    ///
    /// No zeroing guarantee: repopulated ranges may hold stale data. Zeroing
    /// is the zone layer's responsibility (the zero-fill allocation flag).
    ///
    /// # Safety
    /// `ptr` must lie within a live reservation from [`reserve`](Self::reserve)
    /// and `bytes` must not extend past its end.
    unsafe fn populate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError>;

    /// Return physical pages to the system, keeping the range reserved.
    ///
    /// # Safety
    /// Same range requirements as [`populate`](Self::populate); the range must
    /// not be accessed again until repopulated.
    unsafe fn depopulate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError>;

    /// Release the address range entirely (after which pointers are invalid).
    ///
    /// # Safety
    /// `ptr`/`bytes` must describe exactly one reservation from
    /// [`reserve`](Self::reserve), with no live references into it.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError>;

    /// OS page size.
    fn page_size(&self) -> usize;
}

/// [`PageProvider`] backed by the platform VM primitives.
#[derive(Debug, Default)]
pub struct PlatformProvider;

#[cfg(all(unix, not(any(loom, miri))))]
mod unix {
    use std::io;
    use std::ptr::NonNull;

    use super::{PageProvider, PlatformProvider, ZoneError};

    impl PageProvider for PlatformProvider {
        unsafe fn reserve(&self, bytes: usize) -> Result<NonNull<u8>, ZoneError> {
            // Safety: FFI call to mmap.
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    bytes,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                )
            };

            if ptr == libc::MAP_FAILED {
                return Err(ZoneError::ReserveFailed(io::Error::last_os_error()));
            }

            match NonNull::new(ptr.cast::<u8>()) {
                Some(p) => Ok(p),
                None => Err(ZoneError::ReserveFailed(io::Error::other(
                    "mmap returned null",
                ))),
            }
        }

        unsafe fn populate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(
                    ptr.as_ptr().cast::<libc::c_void>(),
                    bytes,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            } != 0
            {
                return Err(ZoneError::PopulateFailed(io::Error::last_os_error()));
            }

            #[cfg(target_os = "linux")]
            {
                // Chunks are populated when a zone is actively growing; ask for
                // immediate physical backing to avoid a burst of minor faults.
                // Safety: FFI call to madvise.
                unsafe {
                    libc::madvise(
                        ptr.as_ptr().cast::<libc::c_void>(),
                        bytes,
                        libc::MADV_WILLNEED,
                    )
                };
            }

            Ok(())
        }

        unsafe fn depopulate(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            // MADV_FREE marks pages for lazy reclamation (the cheapest
            // decommit); mprotect(PROT_NONE) removes access so a stale element
            // reference faults instead of silently reading freed memory.
            //
            // MADV_FREE: macOS (all versions), Linux >= 4.5.
            // Safety: FFI call to madvise.
            if unsafe {
                libc::madvise(ptr.as_ptr().cast::<libc::c_void>(), bytes, libc::MADV_FREE)
            } != 0
            {
                return Err(ZoneError::DepopulateFailed(io::Error::last_os_error()));
            }
            // Safety: FFI call to mprotect.
            if unsafe {
                libc::mprotect(ptr.as_ptr().cast::<libc::c_void>(), bytes, libc::PROT_NONE)
            } != 0
            {
                return Err(ZoneError::DepopulateFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
            // Safety: FFI call to munmap.
            if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), bytes) } != 0 {
                return Err(ZoneError::ReleaseFailed(io::Error::last_os_error()));
            }
            Ok(())
        }

        fn page_size(&self) -> usize {
            use crate::sync::OnceLock;
            static CACHED: OnceLock<usize> = OnceLock::new();
            *CACHED.get_or_init(|| {
                // Safety: FFI call to sysconf.
                let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
                assert!(
                    raw > 0,
                    "sysconf(_SC_PAGESIZE) failed: {}",
                    io::Error::last_os_error()
                );
                // PORTABILITY: 64-bit targets only; page size fits in usize.
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                {
                    raw as usize
                }
            })
        }
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed provider (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls; loom runs inside a
// single OS process with its own scheduler. Instead we back every
// "reservation" with a plain heap allocation.  `populate`/`depopulate` are
// intentional no-ops: the memory is always accessible once reserved.
//
// This is sufficient for testing the *synchronization* logic of the zone
// layer (loom) and detecting undefined behaviour in unsafe pointer code
// (Miri); page-fault behaviour is exercised by normal builds.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri))]
impl PageProvider for PlatformProvider {
    unsafe fn reserve(&self, bytes: usize) -> Result<NonNull<u8>, ZoneError> {
        if bytes == 0 {
            return Err(ZoneError::ReserveFailed(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "zero-size reservation",
            )));
        }
        let layout = std::alloc::Layout::from_size_align(bytes, 4096)
            .map_err(|e| ZoneError::ReserveFailed(std::io::Error::other(e)))?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            ZoneError::ReserveFailed(std::io::Error::new(
                std::io::ErrorKind::OutOfMemory,
                "alloc returned null",
            ))
        })
    }

    unsafe fn populate(&self, _ptr: NonNull<u8>, _bytes: usize) -> Result<(), ZoneError> {
        Ok(()) // heap memory is always accessible
    }

    unsafe fn depopulate(&self, _ptr: NonNull<u8>, _bytes: usize) -> Result<(), ZoneError> {
        Ok(()) // no-op; memory remains accessible
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) -> Result<(), ZoneError> {
        let layout = std::alloc::Layout::from_size_align(bytes, 4096)
            .map_err(|e| ZoneError::ReleaseFailed(std::io::Error::other(e)))?;
        // Safety: ptr was allocated with the same layout via `reserve`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }

    fn page_size(&self) -> usize {
        4096
    }
}

#[cfg(all(test, not(any(loom, miri))))]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_populate_release() {
        let p = PlatformProvider;
        let size = p.page_size();
        // Safety: Test code.
        unsafe {
            let ptr = p.reserve(size).expect("reserve failed");
            p.populate(ptr, size).expect("populate failed");

            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), size);
            slice[0] = 42;
            assert_eq!(slice[0], 42);

            p.depopulate(ptr, size).expect("depopulate failed");
            p.release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_reserve_zero_size_fails() {
        let p = PlatformProvider;
        // mmap with 0 size fails with EINVAL.
        // Safety: Test code.
        let result = unsafe { p.reserve(0) };
        assert!(result.is_err(), "reserving 0 bytes should fail");
    }

    #[test]
    fn test_depopulate_then_repopulate() {
        let p = PlatformProvider;
        let size = p.page_size();
        // Safety: Test code.
        unsafe {
            let ptr = p.reserve(size).expect("reserve failed");
            p.populate(ptr, size).expect("populate failed");
            *(ptr.as_ptr()) = 42;

            p.depopulate(ptr, size).expect("depopulate failed");
            p.populate(ptr, size).expect("repopulate failed");

            // Content is undefined after depopulation; just write fresh.
            *(ptr.as_ptr()) = 84;
            assert_eq!(*(ptr.as_ptr().cast_const()), 84);

            p.release(ptr, size).expect("release failed");
        }
    }

    #[test]
    fn test_partial_populate() {
        let p = PlatformProvider;
        let page = p.page_size();
        let total = page * 4;

        // Safety: Test code.
        unsafe {
            let ptr = p.reserve(total).expect("reserve failed");
            let mid = NonNull::new(ptr.as_ptr().add(page)).unwrap();

            p.populate(mid, page * 2).expect("partial populate failed");

            let slice = std::slice::from_raw_parts_mut(mid.as_ptr(), page * 2);
            slice[0] = 10;
            slice[page * 2 - 1] = 20;
            assert_eq!(slice[0], 10);
            assert_eq!(slice[page * 2 - 1], 20);

            p.release(ptr, total).expect("release failed");
        }
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = PlatformProvider.page_size();
        assert!(size > 0);
        assert_eq!(size & (size - 1), 0, "page size {size} is not power of two");
    }

    #[test]
    fn test_multiple_reservations_independent() {
        let p = PlatformProvider;
        let page = p.page_size();
        // Safety: Test code.
        unsafe {
            let a = p.reserve(page).expect("reserve a failed");
            let b = p.reserve(page).expect("reserve b failed");
            assert_ne!(a, b);

            p.populate(a, page).expect("populate a failed");
            p.populate(b, page).expect("populate b failed");
            *(a.as_ptr()) = 1;
            *(b.as_ptr()) = 2;

            p.release(a, page).expect("release a failed");
            assert_eq!(*(b.as_ptr()), 2);
            p.release(b, page).expect("release b failed");
        }
    }
}
