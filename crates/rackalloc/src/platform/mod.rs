//! OS virtual-memory primitives consumed by the allocator core.
//!
//! Everything here is a thin wrapper: mapping failures come back as null and
//! the caller turns them into an empty allocation result.

#[cfg(target_os = "linux")]
pub mod linux;
#[cfg(target_os = "linux")]
pub use linux as sys;

#[cfg(target_os = "macos")]
pub mod macos;
#[cfg(target_os = "macos")]
pub use macos as sys;

#[cfg(target_os = "windows")]
pub mod windows;
#[cfg(target_os = "windows")]
pub use windows as sys;

use core::ptr;

/// Map anonymous zeroed memory. Returns null on failure.
///
/// # Safety
/// `size` must be page-aligned and non-zero.
#[inline]
pub unsafe fn map_anonymous(size: usize) -> *mut u8 {
    sys::map_anonymous(size)
}

/// Map `size` bytes aligned to `align` (a power of two, >= page size).
/// Over-maps by `align` and trims the unaligned head and tail.
///
/// # Safety
/// `size` and `align` must be page-aligned and non-zero.
pub unsafe fn map_aligned(size: usize, align: usize) -> *mut u8 {
    debug_assert!(align.is_power_of_two());
    let span = match size.checked_add(align) {
        Some(s) => s,
        None => return ptr::null_mut(),
    };
    let raw = sys::map_anonymous(span);
    if raw.is_null() {
        return ptr::null_mut();
    }
    let start = crate::util::align_up(raw as usize, align);
    let head = start - raw as usize;
    let tail = span - head - size;
    if head > 0 {
        sys::unmap(raw, head);
    }
    if tail > 0 {
        sys::unmap((start + size) as *mut u8, tail);
    }
    start as *mut u8
}

/// Unmap previously mapped memory.
///
/// # Safety
/// `ptr`/`size` must describe memory obtained from this module.
#[inline]
pub unsafe fn unmap(ptr: *mut u8, size: usize) {
    sys::unmap(ptr, size);
}

/// Tell the kernel the physical pages behind the range may be reclaimed.
/// The range stays mapped; contents afterwards are unspecified (zero on Linux).
///
/// # Safety
/// `ptr` and `size` must be page-aligned and inside a live mapping.
#[inline]
pub unsafe fn advise_free(ptr: *mut u8, size: usize) {
    sys::advise_free(ptr, size);
}

pub fn num_cpus() -> usize {
    sys::num_cpus()
}

/// Cheap per-thread identifier used for magazine affinity.
#[inline]
pub fn thread_id() -> usize {
    sys::thread_id()
}

/// Fast, non-cryptographic random u64 (stack address + counter, mixed).
pub fn fast_random_u64() -> u64 {
    static COUNTER: core::sync::atomic::AtomicU64 = core::sync::atomic::AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, core::sync::atomic::Ordering::Relaxed);
    let stack_addr = &count as *const _ as u64;
    let mut x = stack_addr.wrapping_mul(0x517c_c1b7_2722_0a95).wrapping_add(count);
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::util::{init_page_size, page_size};

    #[test]
    fn map_aligned_honours_alignment() {
        init_page_size();
        let align = 1 << 18;
        unsafe {
            let p = map_aligned(align, align);
            assert!(!p.is_null());
            assert_eq!(p as usize % align, 0);
            // Fresh anonymous memory reads as zero.
            assert_eq!(*p, 0);
            *p.add(align - 1) = 7;
            unmap(p, align);
        }
    }

    #[test]
    fn advise_free_keeps_mapping_usable() {
        init_page_size();
        let ps = page_size();
        unsafe {
            let p = map_anonymous(ps * 2);
            assert!(!p.is_null());
            *p = 0xAB;
            advise_free(p, ps);
            // Still mapped: writing again must not fault.
            *p = 0xCD;
            assert_eq!(*p, 0xCD);
            unmap(p, ps * 2);
        }
    }

    #[test]
    fn random_values_differ() {
        assert_ne!(fast_random_u64(), fast_random_u64());
    }
}
