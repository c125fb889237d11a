use core::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;

/// Align `value` up to the next multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

/// Align `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline(always)]
pub const fn align_down(value: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Check if `value` is aligned to `align`.
#[inline(always)]
pub const fn is_aligned(value: usize, align: usize) -> bool {
    value & (align - 1) == 0
}

/// Runtime page size. Starts at the universal 4096 default so `page_size()`
/// never has to branch; `init_page_size()` replaces it with the sysconf value.
static PAGE_SIZE_CACHED: AtomicUsize = AtomicUsize::new(4096);
static PAGE_SIZE_INIT: Once = Once::new();

/// Read the page size from the OS. Idempotent; called by every `Rack::new`.
pub fn init_page_size() {
    PAGE_SIZE_INIT.call_once(|| {
        #[cfg(unix)]
        let ps = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        #[cfg(not(unix))]
        let ps: libc::c_long = 4096;
        let ps = if ps > 0 { ps as usize } else { 4096 };
        PAGE_SIZE_CACHED.store(ps, Ordering::Release);
    });
}

#[inline(always)]
pub fn page_size() -> usize {
    PAGE_SIZE_CACHED.load(Ordering::Relaxed)
}

/// Upper bound on thread magazines per rack (the depot is extra).
pub const MAX_MAGAZINES: usize = 64;

/// Magazine index reserved for the depot. Never produced by thread hashing.
pub const DEPOT_INDEX: usize = 0;

/// Default number of empty regions the depot keeps mapped before unmapping.
pub const DEFAULT_DEPOT_RETAINED_REGIONS: usize = 2;

/// A region (or magazine) is "dense" while at least 3/4 of its payload is in use.
#[inline(always)]
pub const fn density_threshold(bytes: usize) -> usize {
    bytes - (bytes >> 2)
}

/// splitmix64 finalizer, used to spread thread ids and region bases.
#[inline(always)]
pub const fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
