//! Magazines: thread-affine arenas of regions and free lists.
//!
//! Every function on `MagazineInner` runs with the magazine lock held (it is
//! only reachable through a `MutexGuard`). Anything that would block on the
//! OS while holding that lock is returned to the caller as a `Followup`.

use crate::fatal::{self, Corruption};
use crate::free_entry::FreeEntry;
use crate::free_list::FreeListTable;
use crate::platform;
use crate::region::Region;
use crate::size_class::Geometry;
use crate::stats::RackStats;
use crate::sync::{Mutex, RawMutex};
use crate::util::{align_down, align_up, density_threshold, page_size, DEPOT_INDEX};
use core::ptr::NonNull;

/// A block parked in the single-slot cache. Still counted as in use.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct LastFree {
    pub region: Region,
    pub index: usize,
    pub msize: usize,
}

impl LastFree {
    #[inline]
    pub fn ptr(&self) -> *mut u8 {
        self.region.block_ptr(self.index)
    }
}

/// Work a free left for after the magazine lock is dropped.
#[must_use]
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Followup {
    Nothing,
    /// The magazine crossed its density threshold; move a region to the depot.
    Recirculate,
    /// Advise `[addr, addr + len)` and unpin the region (depot only).
    Advise { region: Region, addr: usize, len: usize },
    /// The region was detached from the depot; unregister and unmap it.
    Unmap(Region),
}

pub(crate) struct MagazineInner {
    index: usize,
    geo: Geometry,
    pub(crate) lists: FreeListTable,
    pub(crate) last_free: Option<LastFree>,
    pub(crate) last_region: Option<Region>,
    /// Quanta at the start of `last_region` left untouched.
    unclaimed_head: usize,
    /// Quanta at the end of `last_region` not yet handed out.
    unclaimed_tail: usize,
    recirc_first: Option<Region>,
    recirc_last: Option<Region>,
    pub(crate) recirc_count: usize,
    pub(crate) num_objects: usize,
    pub(crate) bytes_in_objects: usize,
    pub(crate) bytes_in_magazine: usize,
    advise_on_free: bool,
    retained_regions: usize,
}

/// One arena: its state behind a lock, plus the lock that serializes mapping
/// a fresh region.
#[repr(C, align(128))]
pub(crate) struct Magazine {
    pub inner: Mutex<MagazineInner>,
    pub alloc_lock: RawMutex,
}

impl Magazine {
    pub fn new(index: usize, geo: Geometry, cookie: u64, advise_on_free: bool, retained: usize) -> Self {
        Magazine {
            inner: Mutex::new(MagazineInner::new(index, geo, cookie, advise_on_free, retained)),
            alloc_lock: RawMutex::new(),
        }
    }
}

impl MagazineInner {
    pub fn new(index: usize, geo: Geometry, cookie: u64, advise_on_free: bool, retained: usize) -> Self {
        MagazineInner {
            index,
            geo,
            lists: FreeListTable::new(geo.params.num_slots, cookie, geo.region_mask()),
            last_free: None,
            last_region: None,
            unclaimed_head: 0,
            unclaimed_tail: 0,
            recirc_first: None,
            recirc_last: None,
            recirc_count: 0,
            num_objects: 0,
            bytes_in_objects: 0,
            bytes_in_magazine: 0,
            advise_on_free,
            retained_regions: retained,
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn is_depot(&self) -> bool {
        self.index == DEPOT_INDEX
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[inline]
    pub fn unclaimed_head(&self) -> usize {
        self.unclaimed_head
    }

    #[inline]
    pub fn unclaimed_tail(&self) -> usize {
        self.unclaimed_tail
    }

    /// Quantum index where the unclaimed tail of `last_region` begins.
    #[inline]
    pub fn unclaimed_tail_start(&self) -> usize {
        self.last_region
            .map_or(usize::MAX, |r| r.num_quanta() - self.unclaimed_tail)
    }

    /// Hand the first `msize` unclaimed tail quanta to the block before them.
    #[inline]
    pub fn claim_tail(&mut self, msize: usize) {
        debug_assert!(msize <= self.unclaimed_tail);
        self.unclaimed_tail -= msize;
    }

    // ---------------------------------------------------------------------
    // Free lists
    // ---------------------------------------------------------------------

    /// Mark `[index, index + msize)` free and push it on its slot. Returns
    /// whether the entry went out of band.
    pub fn free_list_add(&mut self, region: Region, index: usize, msize: usize) -> bool {
        region.mark_free(index, msize);
        let entry = FreeEntry::for_block(region, index, msize);
        self.lists.push(self.geo.slot_for(msize), entry);
        entry.is_out_of_band()
    }

    /// Unlink the free block at `index` and release its OOB slot. Tags are
    /// left for the caller to rewrite.
    pub fn free_list_remove(&mut self, region: Region, index: usize, msize: usize) {
        let entry = FreeEntry::find_for_block(region, index, msize);
        self.lists.unlink(self.geo.slot_for(msize), entry);
        entry.release();
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    fn note_allocated(&mut self, region: Region, msize: usize) {
        let bytes = self.geo.bytes_for(msize);
        let h = region.header();
        h.bytes_used.set(h.bytes_used.get() + bytes);
        h.objects_in_use.set(h.objects_in_use.get() + 1);
        self.num_objects += 1;
        self.bytes_in_objects += bytes;
        if h.recirc_suitable.get() && h.bytes_used.get() >= density_threshold(self.geo.payload_bytes()) {
            h.recirc_suitable.set(false);
        }
    }

    /// Grow an in-use block's accounting by `msize` quanta.
    pub fn note_grown(&mut self, region: Region, msize: usize) {
        let bytes = self.geo.bytes_for(msize);
        let h = region.header();
        h.bytes_used.set(h.bytes_used.get() + bytes);
        self.bytes_in_objects += bytes;
    }

    /// One in-use block became two (`split`) or two became one.
    pub fn note_object_count(&mut self, region: Region, split: bool) {
        let h = region.header();
        if split {
            h.objects_in_use.set(h.objects_in_use.get() + 1);
            self.num_objects += 1;
        } else {
            h.objects_in_use.set(h.objects_in_use.get() - 1);
            self.num_objects -= 1;
        }
    }

    fn alloc_from_free_list(&mut self, msize: usize) -> Option<NonNull<u8>> {
        let found = self.lists.first_nonempty_from(self.geo.slot_for(msize))?;
        let entry = self.lists.head(found)?;
        let (region, index) = entry.block(self.geo.region_mask());
        let block_msize = region.free_block_msize(index);
        if block_msize < msize || self.geo.slot_for(block_msize) != found {
            fatal::corruption(Corruption::BoundaryTagMismatch, region.block_ptr(index) as usize);
        }
        self.lists.unlink(found, entry);
        entry.release();

        region.mark_in_use(index, msize);
        let leftover = block_msize - msize;
        if leftover > 0 {
            self.free_list_add(region, index + msize, leftover);
        }
        self.note_allocated(region, msize);
        NonNull::new(region.block_ptr(index))
    }

    fn alloc_from_tail(&mut self, msize: usize) -> Option<NonNull<u8>> {
        let region = self.last_region?;
        if self.unclaimed_tail < msize {
            return None;
        }
        let index = region.num_quanta() - self.unclaimed_tail;
        region.mark_in_use(index, msize);
        self.unclaimed_tail -= msize;
        self.note_allocated(region, msize);
        NonNull::new(region.block_ptr(index))
    }

    /// Serve `msize` from memory the magazine already owns: the last-free
    /// cache, then the free lists, then the unclaimed tail.
    pub fn alloc_fast(&mut self, msize: usize, zeroed: bool) -> Option<NonNull<u8>> {
        if let Some(cached) = self.last_free {
            if cached.msize == msize {
                self.last_free = None;
                let ptr = cached.ptr();
                if zeroed {
                    unsafe { core::ptr::write_bytes(ptr, 0, self.geo.bytes_for(msize)) };
                }
                return NonNull::new(ptr);
            }
        }
        if let Some(ptr) = self.alloc_from_free_list(msize) {
            if zeroed {
                unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, self.geo.bytes_for(msize)) };
            }
            return Some(ptr);
        }
        // Unclaimed space has never been written.
        self.alloc_from_tail(msize)
    }

    // ---------------------------------------------------------------------
    // Deallocation
    // ---------------------------------------------------------------------

    /// Return the in-use block `[index, index + msize)` to the free lists,
    /// coalescing with free neighbours.
    pub fn free_no_lock(&mut self, region: Region, index: usize, msize: usize) -> Followup {
        let mut start = index;
        let mut total = msize;

        // Unlink both neighbours before inserting the merged block so the OOB
        // slots they held are available again.
        let before = region.free_block_before(index);
        let after = region.free_block_at(index + msize).map(|m| (index + msize, m));
        region.clear_block_tags(index, msize);
        if let Some((prev_start, prev_msize)) = before {
            self.free_list_remove(region, prev_start, prev_msize);
            region.clear_block_tags(prev_start, prev_msize);
            start = prev_start;
            total += prev_msize;
        }
        if let Some((next_start, next_msize)) = after {
            self.free_list_remove(region, next_start, next_msize);
            region.clear_block_tags(next_start, next_msize);
            total += next_msize;
        }
        let oob = self.free_list_add(region, start, total);

        let bytes = self.geo.bytes_for(msize);
        let h = region.header();
        h.bytes_used.set(h.bytes_used.get() - bytes);
        h.objects_in_use.set(h.objects_in_use.get() - 1);
        self.num_objects -= 1;
        self.bytes_in_objects -= bytes;

        if self.is_depot() {
            return self.depot_after_free(region, start, total, index, msize, oob);
        }

        if self.advise_on_free {
            if let Some((addr, len)) = region.advisable_range(start, total, oob) {
                unsafe { platform::advise_free(addr as *mut u8, len) };
            }
        }
        if !h.recirc_suitable.get() && h.bytes_used.get() < density_threshold(self.geo.payload_bytes()) {
            h.recirc_suitable.set(true);
        }
        if self.wants_recirculation() {
            Followup::Recirculate
        } else {
            Followup::Nothing
        }
    }

    /// Depot side effects of a free: unmap an empty surplus region, or advise
    /// the pages the freed block just completed.
    fn depot_after_free(
        &mut self,
        region: Region,
        start: usize,
        total: usize,
        freed: usize,
        freed_msize: usize,
        oob: bool,
    ) -> Followup {
        let h = region.header();
        if h.bytes_used.get() == 0 && !h.is_pinned() && self.recirc_count > self.retained_regions {
            self.detach_region(region);
            return Followup::Unmap(region);
        }
        let Some((lo, len)) = region.advisable_range(start, total, oob) else {
            return Followup::Nothing;
        };
        // Pages outside the freed block's own span were complete before and
        // have already been advised.
        let page = page_size();
        let freed_lo = align_down(region.block_ptr(freed) as usize, page);
        let freed_hi = align_up(region.block_ptr(freed + freed_msize) as usize, page);
        let lo2 = lo.max(freed_lo);
        let hi2 = (lo + len).min(freed_hi);
        if lo2 >= hi2 {
            return Followup::Nothing;
        }
        h.pin();
        Followup::Advise {
            region,
            addr: lo2,
            len: hi2 - lo2,
        }
    }

    /// Magazine-level trigger: more than one and a half regions' worth of
    /// slack and usage below the density threshold.
    pub fn wants_recirculation(&self) -> bool {
        let allocated = self.bytes_in_magazine;
        let used = self.bytes_in_objects;
        allocated - used > self.geo.payload_bytes() * 3 / 2 && used < density_threshold(allocated)
    }

    /// Push the cached block through the real free path.
    pub fn flush_last_free(&mut self) -> Followup {
        match self.last_free.take() {
            Some(cached) => self.free_no_lock(cached.region, cached.index, cached.msize),
            None => Followup::Nothing,
        }
    }

    // ---------------------------------------------------------------------
    // Region lifecycle
    // ---------------------------------------------------------------------

    /// Make a freshly mapped region the bump-allocation target. The first
    /// `head` quanta are left unclaimed.
    pub fn attach_new_region(&mut self, region: Region, head: usize) {
        self.finalize_region();
        let n = region.num_quanta();
        debug_assert!(head < n);
        self.last_region = Some(region);
        self.unclaimed_head = head;
        self.unclaimed_tail = n - head;
        self.bytes_in_magazine += self.geo.payload_bytes();
        self.recirc_append(region);
    }

    /// Turn the unclaimed head and tail of `last_region` into free blocks.
    ///
    /// The tail merges with the block immediately before it and the head with
    /// the block immediately after it; nothing further is coalesced.
    pub fn finalize_region(&mut self) {
        let Some(region) = self.last_region.take() else {
            return;
        };
        let n = region.num_quanta();
        if self.unclaimed_tail > 0 {
            let mut start = n - self.unclaimed_tail;
            let mut total = self.unclaimed_tail;
            if let Some((prev_start, prev_msize)) = region.free_block_before(start) {
                self.free_list_remove(region, prev_start, prev_msize);
                region.clear_block_tags(prev_start, prev_msize);
                start = prev_start;
                total += prev_msize;
            }
            self.free_list_add(region, start, total);
        }
        if self.unclaimed_head > 0 {
            let mut total = self.unclaimed_head;
            if let Some(next_msize) = region.free_block_at(total) {
                self.free_list_remove(region, total, next_msize);
                region.clear_block_tags(total, next_msize);
                total += next_msize;
            }
            self.free_list_add(region, 0, total);
        }
        self.unclaimed_head = 0;
        self.unclaimed_tail = 0;
    }

    /// Remove every free block of `region` from this magazine and drop its
    /// accounting. The region must be finalized first if it is `last_region`;
    /// this is done here, along with flushing a cached block inside it.
    pub fn detach_region(&mut self, region: Region) {
        if self.last_free.is_some_and(|c| c.region == region) {
            // The owner is about to change; a recirculation request from this
            // flush is moot.
            let _ = self.flush_last_free();
        }
        if self.last_region == Some(region) {
            self.finalize_region();
        }
        for (index, tag) in region.blocks() {
            if tag.is_tail() {
                fatal::corruption(Corruption::BoundaryTagMismatch, region.block_ptr(index) as usize);
            }
            if tag.is_free() {
                self.free_list_remove(region, index, tag.msize());
            }
        }
        let h = region.header();
        self.num_objects -= h.objects_in_use.get();
        self.bytes_in_objects -= h.bytes_used.get();
        self.bytes_in_magazine -= self.geo.payload_bytes();
        self.recirc_remove(region);
    }

    /// Adopt a finalized region: link all its free blocks here.
    pub fn reattach_region(&mut self, region: Region) {
        for (index, tag) in region.blocks() {
            if tag.is_tail() {
                fatal::corruption(Corruption::BoundaryTagMismatch, region.block_ptr(index) as usize);
            }
            if tag.is_free() {
                self.free_list_add(region, index, tag.msize());
            }
        }
        let h = region.header();
        self.num_objects += h.objects_in_use.get();
        self.bytes_in_objects += h.bytes_used.get();
        self.bytes_in_magazine += self.geo.payload_bytes();
        h.recirc_suitable
            .set(h.bytes_used.get() < density_threshold(self.geo.payload_bytes()));
        self.recirc_append(region);
    }

    // ---------------------------------------------------------------------
    // Recirculation list
    // ---------------------------------------------------------------------

    fn recirc_append(&mut self, region: Region) {
        let h = region.header();
        debug_assert!(!h.in_recirc_list.get());
        h.recirc_prev.set(self.recirc_last);
        h.recirc_next.set(None);
        match self.recirc_last {
            Some(last) => last.header().recirc_next.set(Some(region)),
            None => self.recirc_first = Some(region),
        }
        self.recirc_last = Some(region);
        h.in_recirc_list.set(true);
        self.recirc_count += 1;
    }

    fn recirc_remove(&mut self, region: Region) {
        let h = region.header();
        debug_assert!(h.in_recirc_list.get());
        let prev = h.recirc_prev.get();
        let next = h.recirc_next.get();
        match prev {
            Some(p) => p.header().recirc_next.set(next),
            None => self.recirc_first = next,
        }
        match next {
            Some(n) => n.header().recirc_prev.set(prev),
            None => self.recirc_last = prev,
        }
        h.recirc_prev.set(None);
        h.recirc_next.set(None);
        h.in_recirc_list.set(false);
        self.recirc_count -= 1;
    }

    /// Regions owned by this magazine, oldest first.
    pub fn regions(&self) -> RegionList {
        RegionList {
            next: self.recirc_first,
        }
    }

    /// Oldest unpinned region that is flagged sparse (or any, with `any`).
    pub fn recirc_candidate(&self, any: bool) -> Option<Region> {
        self.regions().find(|r| {
            let h = r.header();
            (any || h.recirc_suitable.get()) && !h.is_pinned()
        })
    }

    /// Depot: a region holding a free block of at least `msize`, trying the
    /// exact slot first and skipping pinned regions by moving to larger slots.
    pub fn depot_find_region(&self, msize: usize) -> Option<Region> {
        let mut slot = self.geo.slot_for(msize);
        while let Some(found) = self.lists.first_nonempty_from(slot) {
            let entry = self.lists.head(found)?;
            let (region, _) = entry.block(self.geo.region_mask());
            if !region.header().is_pinned() {
                return Some(region);
            }
            slot = found + 1;
            if slot >= self.lists.num_slots() {
                break;
            }
        }
        None
    }

    /// Depot: an empty, unpinned region beyond the retained reserve.
    pub fn depot_surplus_empty_region(&self) -> Option<Region> {
        if self.recirc_count <= self.retained_regions {
            return None;
        }
        self.regions().find(|r| {
            let h = r.header();
            h.bytes_used.get() == 0 && !h.is_pinned()
        })
    }

    pub fn add_stats(&self, stats: &mut RackStats) {
        stats.blocks_in_use += self.num_objects;
        stats.bytes_in_use += self.bytes_in_objects;
        stats.bytes_in_magazines += self.bytes_in_magazine;
        if self.is_depot() {
            stats.depot_regions += self.recirc_count;
        }
    }
}

// Free entries hold raw pointers into regions; they are only touched while
// the owning magazine's lock is held.
unsafe impl Send for MagazineInner {}

/// Walk of a magazine's region list.
pub(crate) struct RegionList {
    next: Option<Region>,
}

impl Iterator for RegionList {
    type Item = Region;

    fn next(&mut self) -> Option<Region> {
        let region = self.next?;
        self.next = region.header().recirc_next.get();
        Some(region)
    }
}
