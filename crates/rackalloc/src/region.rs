//! Regions: size-aligned OS mappings carved into quanta.
//!
//! Layout (offsets from the region base, see `Geometry`):
//!
//! ```text
//! +--------------+------------------+-----------+------------------------+
//! | RegionHeader | BlockTag[quanta] | OobEntry[] | data quanta ...        |
//! +--------------+------------------+-----------+------------------------+
//! 0              tags_offset        oob_offset  data_offset (page aligned)
//! ```
//!
//! The header fields are mutated only while the owning magazine's lock is
//! held, except `mag_index` and `pinned_to_depot`, which other threads read
//! without it.

use crate::fatal::{self, Corruption};
use crate::free_entry::{OobEntry, OOB_IN_USE};
use crate::platform;
use crate::size_class::Geometry;
use crate::tag::BlockTag;
use crate::util::{align_down, align_up, is_aligned, page_size};
use core::cell::Cell;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

#[repr(C)]
pub(crate) struct RegionHeader {
    data: Cell<*mut u8>,
    num_quanta: Cell<u32>,
    quantum_shift: Cell<u32>,
    oob_capacity: Cell<u32>,
    /// Index of the magazine (or the depot) that owns this region.
    pub(crate) mag_index: AtomicUsize,
    /// Non-zero while pages of this region are being advised outside the
    /// depot lock.
    pub(crate) pinned_to_depot: AtomicU32,
    pub(crate) bytes_used: Cell<usize>,
    pub(crate) objects_in_use: Cell<usize>,
    pub(crate) recirc_suitable: Cell<bool>,
    pub(crate) in_recirc_list: Cell<bool>,
    pub(crate) recirc_prev: Cell<Option<Region>>,
    pub(crate) recirc_next: Cell<Option<Region>>,
}

impl RegionHeader {
    #[inline]
    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned_to_depot.load(Ordering::Acquire) != 0
    }

    #[inline]
    pub(crate) fn pin(&self) {
        self.pinned_to_depot.fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub(crate) fn unpin(&self) {
        let prev = self.pinned_to_depot.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0);
    }

    #[inline]
    pub(crate) fn owner(&self) -> usize {
        self.mag_index.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_owner(&self, mag_index: usize) {
        self.mag_index.store(mag_index, Ordering::Release);
    }
}

/// Byte offsets of the header fields an out-of-process reader needs.
pub(crate) const HEADER_DATA_OFFSET: usize = core::mem::offset_of!(RegionHeader, data);
pub(crate) const HEADER_QUANTA_OFFSET: usize = core::mem::offset_of!(RegionHeader, num_quanta);

/// Handle to a live region. Copyable; carries no ownership.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Region(NonNull<RegionHeader>);

unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl core::fmt::Debug for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Region({:#x})", self.base())
    }
}

impl Region {
    /// Map and initialise a region for `mag_index`. Returns `None` when the OS
    /// refuses the mapping.
    ///
    /// # Safety
    /// `geo` must have been produced by `Geometry::new` after page-size init.
    pub(crate) unsafe fn create(geo: &Geometry, mag_index: usize) -> Option<Region> {
        let base = platform::map_aligned(geo.region_size, geo.region_size);
        let header = NonNull::new(base as *mut RegionHeader)?;
        // Fresh anonymous memory is zero: every tag reads MIDDLE (unclaimed)
        // and every OOB entry reads unused.
        header.as_ptr().write(RegionHeader {
            data: Cell::new(base.add(geo.data_offset)),
            num_quanta: Cell::new(geo.num_quanta as u32),
            quantum_shift: Cell::new(geo.params.quantum_shift),
            oob_capacity: Cell::new(geo.params.oob_capacity as u32),
            mag_index: AtomicUsize::new(mag_index),
            pinned_to_depot: AtomicU32::new(0),
            bytes_used: Cell::new(0),
            objects_in_use: Cell::new(0),
            recirc_suitable: Cell::new(false),
            in_recirc_list: Cell::new(false),
            recirc_prev: Cell::new(None),
            recirc_next: Cell::new(None),
        });
        Some(Region(header))
    }

    /// Unmap the region.
    ///
    /// # Safety
    /// No pointer into the region may be used afterwards.
    pub(crate) unsafe fn destroy(self, geo: &Geometry) {
        platform::unmap(self.0.as_ptr() as *mut u8, geo.region_size);
    }

    /// # Safety
    /// `base` must be the base of a live region created by `create`.
    #[inline]
    pub(crate) unsafe fn from_base(base: usize) -> Region {
        Region(NonNull::new_unchecked(base as *mut RegionHeader))
    }

    #[inline]
    pub fn base(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub(crate) fn header<'a>(self) -> &'a RegionHeader {
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub(crate) fn data(self) -> *mut u8 {
        self.header().data.get()
    }

    #[inline]
    pub(crate) fn num_quanta(self) -> usize {
        self.header().num_quanta.get() as usize
    }

    #[inline]
    pub(crate) fn quantum_shift(self) -> u32 {
        self.header().quantum_shift.get()
    }

    #[inline]
    pub(crate) fn oob_capacity(self) -> usize {
        self.header().oob_capacity.get() as usize
    }

    #[inline]
    fn tags(self) -> *mut BlockTag {
        let tags_offset = align_up(
            core::mem::size_of::<RegionHeader>(),
            core::mem::align_of::<BlockTag>(),
        );
        (self.base() + tags_offset) as *mut BlockTag
    }

    #[inline]
    fn oob_table(self) -> *mut OobEntry {
        let tags_end = self.tags() as usize + self.num_quanta() * core::mem::size_of::<BlockTag>();
        align_up(tags_end, core::mem::align_of::<OobEntry>()) as *mut OobEntry
    }

    // ---------------------------------------------------------------------
    // Quantum addressing
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn block_ptr(self, index: usize) -> *mut u8 {
        debug_assert!(index <= self.num_quanta());
        unsafe { self.data().add(index << self.quantum_shift()) }
    }

    /// Quantum index of `ptr`, if it is a quantum boundary inside the data area.
    #[inline]
    pub(crate) fn index_of(self, ptr: *const u8) -> Option<usize> {
        let data = self.data() as usize;
        let addr = ptr as usize;
        if addr < data {
            return None;
        }
        let offset = addr - data;
        if !is_aligned(offset, 1 << self.quantum_shift()) {
            return None;
        }
        let index = offset >> self.quantum_shift();
        (index < self.num_quanta()).then_some(index)
    }

    #[inline]
    pub(crate) fn contains_data(self, ptr: *const u8) -> bool {
        let data = self.data() as usize;
        let end = data + (self.num_quanta() << self.quantum_shift());
        (data..end).contains(&(ptr as usize))
    }

    // ---------------------------------------------------------------------
    // Boundary tags
    // ---------------------------------------------------------------------

    #[inline]
    pub(crate) fn tag(self, index: usize) -> BlockTag {
        debug_assert!(index < self.num_quanta());
        unsafe { self.tags().add(index).read() }
    }

    #[inline]
    fn set_tag(self, index: usize, tag: BlockTag) {
        debug_assert!(index < self.num_quanta());
        unsafe { self.tags().add(index).write(tag) }
    }

    fn mark(self, index: usize, msize: usize, free: bool) {
        debug_assert!(msize > 0 && index + msize <= self.num_quanta());
        self.set_tag(index, BlockTag::head(msize, free));
        if msize > 1 {
            self.set_tag(index + msize - 1, BlockTag::tail(msize, free));
        }
    }

    #[inline]
    pub(crate) fn mark_free(self, index: usize, msize: usize) {
        self.mark(index, msize, true);
    }

    #[inline]
    pub(crate) fn mark_in_use(self, index: usize, msize: usize) {
        self.mark(index, msize, false);
    }

    #[inline]
    pub(crate) fn mark_middle(self, index: usize) {
        self.set_tag(index, BlockTag::MIDDLE);
    }

    /// Erase both boundary tags of a block that is being merged away.
    #[inline]
    pub(crate) fn clear_block_tags(self, index: usize, msize: usize) {
        self.mark_middle(index);
        if msize > 1 {
            self.mark_middle(index + msize - 1);
        }
    }

    /// Msize of the free block starting at `index`, checking that its tail
    /// replica agrees. Aborts on disagreement.
    pub(crate) fn free_block_msize(self, index: usize) -> usize {
        let head = self.tag(index);
        let msize = head.msize();
        if !head.is_head() || !head.is_free() || msize == 0 || index + msize > self.num_quanta() {
            fatal::corruption(Corruption::BoundaryTagMismatch, self.block_ptr(index) as usize);
        }
        if msize > 1 {
            let tail = self.tag(index + msize - 1);
            if !tail.is_tail() || tail.msize() != msize || !tail.is_free() {
                fatal::corruption(Corruption::BoundaryTagMismatch, self.block_ptr(index) as usize);
            }
        }
        msize
    }

    /// Start index and msize of the free block ending right before `index`,
    /// if there is one.
    pub(crate) fn free_block_before(self, index: usize) -> Option<(usize, usize)> {
        if index == 0 {
            return None;
        }
        let last = self.tag(index - 1);
        if last.is_middle() || !last.is_free() {
            return None;
        }
        let msize = last.msize_ending_here();
        if msize > index {
            fatal::corruption(Corruption::BoundaryTagMismatch, self.block_ptr(index - 1) as usize);
        }
        let start = index - msize;
        if self.free_block_msize(start) != msize {
            fatal::corruption(Corruption::BoundaryTagMismatch, self.block_ptr(start) as usize);
        }
        Some((start, msize))
    }

    /// Msize of the free block starting at `index`, if there is one.
    pub(crate) fn free_block_at(self, index: usize) -> Option<usize> {
        if index >= self.num_quanta() {
            return None;
        }
        let tag = self.tag(index);
        if tag.is_head() && tag.is_free() {
            Some(self.free_block_msize(index))
        } else {
            None
        }
    }

    /// Start and tag of the block whose span covers `index`, found by walking
    /// back over middle tags. `None` when the nearest tag behind `index`
    /// closes a block, i.e. `index` sits in unclaimed space.
    pub(crate) fn head_covering(self, index: usize) -> Option<(usize, BlockTag)> {
        let mut i = index;
        loop {
            let tag = self.tag(i);
            if tag.is_head() {
                return (i + tag.msize() > index).then_some((i, tag));
            }
            if tag.is_tail() || i == 0 {
                return None;
            }
            i -= 1;
        }
    }

    // ---------------------------------------------------------------------
    // Out-of-band free entries
    // ---------------------------------------------------------------------

    /// Blocks that start on a page and cover at least one page may have all
    /// their pages advised, so their links cannot live inside them.
    #[inline]
    pub(crate) fn wants_oob(self, index: usize, msize: usize) -> bool {
        let page = page_size();
        is_aligned(self.block_ptr(index) as usize, page)
            && (msize << self.quantum_shift()) >= page
    }

    #[inline]
    pub(crate) fn oob_entry(self, slot: usize) -> *mut OobEntry {
        debug_assert!(slot < self.oob_capacity());
        unsafe { self.oob_table().add(slot) }
    }

    /// Claim the first unused OOB slot for the block at `index`.
    pub(crate) fn oob_claim(self, index: usize) -> Option<u16> {
        for slot in 0..self.oob_capacity() {
            let entry = unsafe { &mut *self.oob_entry(slot) };
            if entry.quantum & OOB_IN_USE == 0 {
                entry.quantum = OOB_IN_USE | index as u32;
                return Some(slot as u16);
            }
        }
        None
    }

    /// Find the OOB slot describing the block at `index`.
    pub(crate) fn oob_find(self, index: usize) -> Option<u16> {
        (0..self.oob_capacity())
            .find(|&slot| unsafe { (*self.oob_entry(slot)).quantum } == OOB_IN_USE | index as u32)
            .map(|slot| slot as u16)
    }

    pub(crate) fn oob_release(self, slot: u16) {
        unsafe {
            let entry = self.oob_entry(slot as usize);
            ptr::write_bytes(entry, 0, 1);
        }
    }

    /// Quantum index recorded in an OOB slot. Aborts if the entry is unused
    /// or points past the region.
    pub(crate) fn oob_block_index(self, slot: u16) -> usize {
        let q = unsafe { (*self.oob_entry(slot as usize)).quantum };
        let index = (q & !OOB_IN_USE) as usize;
        if q & OOB_IN_USE == 0 || index >= self.num_quanta() {
            fatal::corruption(Corruption::OobOutOfRegion, self.oob_entry(slot as usize) as usize);
        }
        index
    }

    // ---------------------------------------------------------------------
    // Advise ranges
    // ---------------------------------------------------------------------

    /// Whole pages inside the free block at `index` that can be handed to the
    /// OS. An in-place block keeps its first quantum (the list node) resident.
    pub(crate) fn advisable_range(self, index: usize, msize: usize, oob: bool) -> Option<(usize, usize)> {
        let page = page_size();
        let start = self.block_ptr(index) as usize;
        let end = start + (msize << self.quantum_shift());
        let lo = if oob {
            align_up(start, page)
        } else {
            align_up(start + (1 << self.quantum_shift()), page)
        };
        let hi = align_down(end, page);
        (lo < hi).then(|| (lo, hi - lo))
    }

    /// Iterate over every block as `(index, tag)`, skipping unclaimed space.
    pub(crate) fn blocks(self) -> Blocks {
        Blocks {
            region: self,
            index: 0,
        }
    }
}

/// Forward walk over block heads. Middle tags (unclaimed space) are skipped
/// one quantum at a time; a stray tail tag is reported as a head-less block.
pub(crate) struct Blocks {
    region: Region,
    index: usize,
}

impl Iterator for Blocks {
    type Item = (usize, BlockTag);

    fn next(&mut self) -> Option<Self::Item> {
        let n = self.region.num_quanta();
        while self.index < n {
            let index = self.index;
            let tag = self.region.tag(index);
            if tag.is_middle() {
                self.index += 1;
                continue;
            }
            self.index += if tag.is_head() { tag.msize().max(1) } else { 1 };
            return Some((index, tag));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::TINY;
    use crate::util::init_page_size;

    fn with_region(f: impl FnOnce(&Geometry, Region)) {
        init_page_size();
        let geo = Geometry::new(TINY).unwrap();
        unsafe {
            let region = Region::create(&geo, 1).expect("map region");
            f(&geo, region);
            region.destroy(&geo);
        }
    }

    #[test]
    fn fresh_region_is_unclaimed() {
        with_region(|geo, r| {
            assert_eq!(r.base() % geo.region_size, 0);
            assert_eq!(r.num_quanta(), geo.num_quanta);
            assert_eq!(r.data() as usize, r.base() + geo.data_offset);
            assert!(r.tag(0).is_middle());
            assert_eq!(r.blocks().count(), 0);
            assert_eq!(r.header().owner(), 1);
        });
    }

    #[test]
    fn marks_write_both_ends() {
        with_region(|_, r| {
            r.mark_free(10, 5);
            assert!(r.tag(10).is_head() && r.tag(10).is_free());
            assert!(r.tag(14).is_tail());
            assert!(r.tag(12).is_middle());
            assert_eq!(r.free_block_msize(10), 5);
            assert_eq!(r.free_block_before(15), Some((10, 5)));
            assert_eq!(r.free_block_at(10), Some(5));

            r.mark_in_use(15, 1);
            assert_eq!(r.free_block_at(15), None);
            r.clear_block_tags(10, 5);
            assert!(r.tag(10).is_middle() && r.tag(14).is_middle());
        });
    }

    #[test]
    fn single_quantum_free_block_found_backwards() {
        with_region(|_, r| {
            r.mark_free(3, 1);
            r.mark_in_use(4, 2);
            assert_eq!(r.free_block_before(4), Some((3, 1)));
        });
    }

    #[test]
    fn covering_head_found_through_middle_tags() {
        with_region(|_, r| {
            r.mark_free(20, 6);
            r.mark_in_use(26, 3);
            assert_eq!(r.head_covering(23).map(|(i, t)| (i, t.is_free())), Some((20, true)));
            assert_eq!(r.head_covering(27).map(|(i, t)| (i, t.is_free())), Some((26, false)));
            assert_eq!(r.head_covering(20).map(|(i, _)| i), Some(20));
            // Past the last tail: unclaimed.
            assert_eq!(r.head_covering(30), None);
        });
    }

    #[test]
    fn index_of_rejects_interior_and_foreign_pointers() {
        with_region(|_, r| {
            let p = r.block_ptr(7);
            assert_eq!(r.index_of(p), Some(7));
            assert_eq!(r.index_of(unsafe { p.add(1) }), None);
            assert_eq!(r.index_of(r.base() as *const u8), None);
        });
    }

    #[test]
    fn oob_slots_claim_find_release() {
        with_region(|_, r| {
            let a = r.oob_claim(256).unwrap();
            let b = r.oob_claim(512).unwrap();
            assert_ne!(a, b);
            assert_eq!(r.oob_find(512), Some(b));
            assert_eq!(r.oob_block_index(a), 256);
            r.oob_release(a);
            assert_eq!(r.oob_find(256), None);
            assert_eq!(r.oob_claim(1024), Some(a));
        });
    }

    #[test]
    fn oob_eligibility_needs_page_start_and_page_span() {
        with_region(|_, r| {
            let per_page = page_size() >> r.quantum_shift();
            assert!(r.wants_oob(0, per_page));
            assert!(!r.wants_oob(0, per_page - 1));
            assert!(!r.wants_oob(1, per_page * 2));
        });
    }

    #[test]
    fn advisable_range_skips_in_place_node() {
        with_region(|_, r| {
            let per_page = page_size() >> r.quantum_shift();
            let (lo, len) = r.advisable_range(0, per_page * 3, true).unwrap();
            assert_eq!(lo, r.data() as usize);
            assert_eq!(len, page_size() * 3);
            let (lo, len) = r.advisable_range(0, per_page * 3, false).unwrap();
            assert_eq!(lo, r.data() as usize + page_size());
            assert_eq!(len, page_size() * 2);
            assert!(r.advisable_range(1, 4, false).is_none());
        });
    }

    #[test]
    fn sub_page_blocks_have_nothing_to_advise() {
        with_region(|_, r| {
            let per_page = page_size() >> r.quantum_shift();
            // Fits inside one page, either link placement.
            assert!(r.advisable_range(2, 3, true).is_none());
            assert!(r.advisable_range(per_page, 1, false).is_none());
            // Straddles a page boundary without covering a whole page.
            assert!(r.advisable_range(per_page - 2, per_page, true).is_none());
            // A page-aligned block exactly one page long keeps its node page.
            assert!(r.advisable_range(per_page, per_page, false).is_none());
            assert!(r.advisable_range(per_page, per_page, true).is_some());
        });
    }

    #[test]
    fn blocks_walk_skips_unclaimed() {
        with_region(|_, r| {
            r.mark_in_use(0, 2);
            r.mark_free(2, 3);
            r.mark_in_use(10, 1);
            let seen: Vec<_> = r.blocks().map(|(i, t)| (i, t.msize(), t.is_free())).collect();
            assert_eq!(seen, vec![(0, 2, false), (2, 3, true), (10, 1, false)]);
        });
    }
}
