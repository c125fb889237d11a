//! Region registry: the set of region bases a rack has mapped.
//!
//! An open-addressing hash ring of bases, stored in its own anonymous mapping
//! so registering a region never calls back into a heap. Removed entries leave
//! a tombstone; the ring is rebuilt at twice the size once live entries plus
//! tombstones pass 3/4 of the capacity.

use crate::platform;
use crate::region::Region;
use crate::sync::Mutex;
use crate::util::{align_up, page_size, splitmix64};
use core::ptr;

const EMPTY: usize = 0;
const TOMBSTONE: usize = usize::MAX;

const INITIAL_CAPACITY: usize = 64;

struct Ring {
    slots: *mut usize,
    capacity: usize,
    live: usize,
    tombstones: usize,
}

unsafe impl Send for Ring {}

impl Ring {
    const fn empty() -> Self {
        Ring {
            slots: ptr::null_mut(),
            capacity: 0,
            live: 0,
            tombstones: 0,
        }
    }

    fn bytes_for(capacity: usize) -> usize {
        align_up(capacity * core::mem::size_of::<usize>(), page_size())
    }

    unsafe fn with_capacity(capacity: usize) -> Option<Ring> {
        debug_assert!(capacity.is_power_of_two());
        let slots = platform::map_anonymous(Self::bytes_for(capacity)) as *mut usize;
        if slots.is_null() {
            return None;
        }
        Some(Ring {
            slots,
            capacity,
            live: 0,
            tombstones: 0,
        })
    }

    unsafe fn release(&mut self) {
        if !self.slots.is_null() {
            platform::unmap(self.slots as *mut u8, Self::bytes_for(self.capacity));
        }
        *self = Ring::empty();
    }

    #[inline]
    fn slot(&self, i: usize) -> *mut usize {
        unsafe { self.slots.add(i) }
    }

    #[inline]
    fn home(&self, base: usize, shift: u32) -> usize {
        splitmix64((base >> shift) as u64) as usize & (self.capacity - 1)
    }

    fn find(&self, base: usize, shift: u32) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let mut i = self.home(base, shift);
        for _ in 0..self.capacity {
            let v = unsafe { *self.slot(i) };
            if v == base {
                return Some(i);
            }
            if v == EMPTY {
                return None;
            }
            i = (i + 1) & (self.capacity - 1);
        }
        None
    }

    /// Insert without growing; the caller guarantees a free slot.
    fn place(&mut self, base: usize, shift: u32) {
        let mut i = self.home(base, shift);
        loop {
            let v = unsafe { *self.slot(i) };
            if v == EMPTY || v == TOMBSTONE {
                if v == TOMBSTONE {
                    self.tombstones -= 1;
                }
                unsafe { *self.slot(i) = base };
                self.live += 1;
                return;
            }
            i = (i + 1) & (self.capacity - 1);
        }
    }

    fn needs_growth(&self) -> bool {
        (self.live + self.tombstones + 1) * 4 > self.capacity * 3
    }

    fn bases(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.capacity)
            .map(move |i| unsafe { *self.slot(i) })
            .filter(|&v| v != EMPTY && v != TOMBSTONE)
    }
}

/// Set of live region bases, with lookup from any interior pointer.
pub struct RegionRegistry {
    ring: Mutex<Ring>,
    region_shift: u32,
}

impl RegionRegistry {
    pub const fn new(region_shift: u32) -> Self {
        RegionRegistry {
            ring: Mutex::new(Ring::empty()),
            region_shift,
        }
    }

    #[inline]
    fn mask(&self) -> usize {
        !((1usize << self.region_shift) - 1)
    }

    /// Map the initial ring up front so the first region insert cannot fail
    /// for lack of one.
    pub fn reserve(&self) -> bool {
        let mut ring = self.ring.lock();
        ring.capacity > 0 || self.grow(&mut ring)
    }

    /// Record a freshly mapped region. Returns `false` if the ring could not
    /// grow.
    pub fn insert(&self, region: Region) -> bool {
        let mut ring = self.ring.lock();
        if ring.needs_growth() && !self.grow(&mut ring) {
            return false;
        }
        ring.place(region.base(), self.region_shift);
        true
    }

    #[cold]
    fn grow(&self, ring: &mut Ring) -> bool {
        let capacity = if ring.capacity == 0 {
            INITIAL_CAPACITY
        } else if (ring.live + 1) * 2 > ring.capacity {
            ring.capacity * 2
        } else {
            // Mostly tombstones: rebuild at the same size.
            ring.capacity
        };
        let Some(mut next) = (unsafe { Ring::with_capacity(capacity) }) else {
            log::warn!("region registry could not grow to {capacity} entries");
            return false;
        };
        for base in ring.bases() {
            next.place(base, self.region_shift);
        }
        unsafe { ring.release() };
        *ring = next;
        log::debug!("region registry rebuilt with capacity {capacity}");
        true
    }

    /// Forget `region`, running `unmap` before the ring is unlocked. A
    /// reader inside `with_region` therefore never sees the mapping vanish.
    pub fn remove(&self, region: Region, unmap: impl FnOnce()) {
        let mut ring = self.ring.lock();
        if let Some(i) = ring.find(region.base(), self.region_shift) {
            unsafe { *ring.slot(i) = TOMBSTONE };
            ring.live -= 1;
            ring.tombstones += 1;
        }
        unmap();
    }

    /// The region containing `ptr`, if it belongs to this registry.
    pub fn lookup(&self, ptr: *const u8) -> Option<Region> {
        self.with_region(ptr, |region| region)
    }

    /// Run `f` on the region containing `ptr` with the ring locked, so the
    /// region stays mapped for the duration. `f` must not block on a
    /// magazine lock.
    pub fn with_region<R>(&self, ptr: *const u8, f: impl FnOnce(Region) -> R) -> Option<R> {
        let base = ptr as usize & self.mask();
        if base == 0 {
            return None;
        }
        let ring = self.ring.lock();
        ring.find(base, self.region_shift)?;
        Some(f(unsafe { Region::from_base(base) }))
    }

    pub fn len(&self) -> usize {
        self.ring.lock().live
    }

    /// Append every registered base to `out`.
    pub fn collect_bases(&self, out: &mut Vec<usize>) {
        let ring = self.ring.lock();
        out.extend(ring.bases());
    }
}

impl Drop for RegionRegistry {
    fn drop(&mut self) {
        unsafe { self.ring.lock().release() };
    }
}
