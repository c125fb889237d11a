//! The rack: one size class's magazines, depot and region registry.
//!
//! Lock order is magazine, then depot, then registry. A region's owner index
//! only changes while both the old and the new owner are locked, so holding
//! either one pins the answer.

use crate::config::{ConfigError, RackConfig};
use crate::consistency::{self, ConsistencyReport};
use crate::fatal::{self, Corruption};
use crate::magazine::{Followup, LastFree, Magazine, MagazineInner};
use crate::platform;
use crate::region::Region;
use crate::registry::RegionRegistry;
use crate::size_class::{Geometry, ParamsError, SizeClassParams, SMALL, TINY};
use crate::stats::{RackCounters, RackStats};
use crate::sync::MutexGuard;
use crate::util::{init_page_size, page_size, splitmix64, DEPOT_INDEX};
use core::ptr::NonNull;
use thiserror::Error;

type Guard<'a> = MutexGuard<'a, MagazineInner>;

/// Owner re-checks that spin before yielding the CPU.
const LOCK_HOP_SPINS: usize = 16;

/// Advise ranges gathered per depot unlock while scanning a region.
const ADVISE_BATCH: usize = 16;

/// Most pages a randomized region start may skip.
const MAX_RANDOM_HEAD_PAGES: u64 = 8;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RackError {
    #[error("invalid size-class parameters: {0}")]
    InvalidParams(#[from] ParamsError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("could not map the region registry")]
    RegistryMapFailed,
}

pub struct Rack {
    geo: Geometry,
    config: RackConfig,
    /// Index 0 is the depot; thread magazines follow.
    magazines: Box<[Magazine]>,
    registry: RegionRegistry,
    counters: RackCounters,
}

impl Rack {
    pub fn new(params: SizeClassParams, config: RackConfig) -> Result<Rack, RackError> {
        init_page_size();
        config.validate()?;
        let geo = Geometry::new(params)?;
        let cookie = platform::fast_random_u64();
        let count = config.resolved_magazine_count();
        let magazines = (0..=count)
            .map(|i| {
                Magazine::new(
                    i,
                    geo,
                    cookie,
                    config.advise_on_free,
                    config.depot_retained_regions,
                )
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let registry = RegionRegistry::new(params.region_shift);
        if !registry.reserve() {
            return Err(RackError::RegistryMapFailed);
        }
        log::debug!(
            "{} rack: {} magazines, {} quanta of {} bytes per region",
            params.name,
            count,
            geo.num_quanta,
            geo.quantum
        );
        Ok(Rack {
            geo,
            config,
            magazines,
            registry,
            counters: RackCounters::default(),
        })
    }

    /// Tiny rack configured from the environment.
    pub fn tiny() -> Result<Rack, RackError> {
        Rack::new(TINY, RackConfig::from_env())
    }

    /// Small rack configured from the environment.
    pub fn small() -> Result<Rack, RackError> {
        Rack::new(SMALL, RackConfig::from_env())
    }

    #[inline]
    pub fn geometry(&self) -> &Geometry {
        &self.geo
    }

    #[inline]
    pub fn config(&self) -> &RackConfig {
        &self.config
    }

    /// Thread magazines, excluding the depot.
    #[inline]
    pub fn magazine_count(&self) -> usize {
        self.magazines.len() - 1
    }

    #[inline]
    fn depot(&self) -> &Magazine {
        &self.magazines[DEPOT_INDEX]
    }

    #[inline]
    fn home_magazine(&self) -> usize {
        let n = self.magazine_count() as u64;
        1 + (splitmix64(platform::thread_id() as u64) % n) as usize
    }

    // ---------------------------------------------------------------------
    // Ownership
    // ---------------------------------------------------------------------

    /// The region holding `ptr`, if this rack mapped it.
    pub fn region_of(&self, ptr: *const u8) -> Option<Region> {
        self.registry.lookup(ptr)
    }

    /// Whether `ptr` falls inside the data area of one of this rack's regions.
    /// Freed blocks still count.
    pub fn claimed_by(&self, ptr: *const u8) -> bool {
        self.registry
            .with_region(ptr, |region| region.contains_data(ptr))
            .unwrap_or(false)
    }

    /// Index of the magazine owning the region that holds `ptr`, with
    /// `DEPOT_INDEX` for the depot. The owner may change once this returns.
    pub fn owning_magazine(&self, ptr: *const u8) -> Option<usize> {
        self.registry.with_region(ptr, |region| region.header().owner())
    }

    fn region_or_abort(&self, ptr: *const u8) -> Region {
        match self.registry.lookup(ptr) {
            Some(region) => region,
            None => fatal::corruption(Corruption::NotAllocated, ptr as usize),
        }
    }

    /// Lock whichever magazine currently owns `region`. The owner can move
    /// between reading it and acquiring its lock, so re-check and hop.
    fn lock_owner(&self, region: Region) -> Guard<'_> {
        let mut hops = 0;
        loop {
            let owner = region.header().owner();
            let Some(magazine) = self.magazines.get(owner) else {
                fatal::corruption(Corruption::NotAllocated, region.base());
            };
            let guard = magazine.inner.lock();
            if region.header().owner() == owner {
                return guard;
            }
            drop(guard);
            hops += 1;
            if hops > LOCK_HOP_SPINS {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    /// Index and msize of the live block at `ptr`; aborts on anything else.
    fn in_use_block(guard: &MagazineInner, region: Region, ptr: *const u8) -> (usize, usize) {
        let Some(index) = region.index_of(ptr) else {
            fatal::corruption(Corruption::NotAllocated, ptr as usize);
        };
        if guard
            .last_free
            .is_some_and(|cached| cached.region == region && cached.index == index)
        {
            fatal::corruption(Corruption::DoubleFree, ptr as usize);
        }
        let tag = region.tag(index);
        if !tag.is_head() {
            // A block freed earlier may since have merged into a neighbour,
            // leaving its old head inside a larger free block.
            let kind = match region.head_covering(index) {
                Some((_, covering)) if covering.is_free() => Corruption::DoubleFree,
                _ => Corruption::NotAllocated,
            };
            fatal::corruption(kind, ptr as usize);
        }
        if tag.is_free() {
            fatal::corruption(Corruption::DoubleFree, ptr as usize);
        }
        (index, tag.msize())
    }

    // ---------------------------------------------------------------------
    // Allocation
    // ---------------------------------------------------------------------

    /// Allocate `msize` quanta. Returns `None` when `msize` exceeds the size
    /// class or the OS refuses a new region.
    pub fn allocate(&self, msize: usize, zeroed: bool) -> Option<NonNull<u8>> {
        let msize = msize.max(1);
        if msize > self.geo.params.max_msize {
            return None;
        }
        let mag_index = self.home_magazine();
        let magazine = &self.magazines[mag_index];
        loop {
            let mut guard = magazine.inner.lock();
            if let Some(ptr) = guard.alloc_fast(msize, zeroed) {
                return Some(ptr);
            }
            if self.refill_from_depot(&mut guard, msize) {
                if let Some(ptr) = guard.alloc_fast(msize, zeroed) {
                    return Some(ptr);
                }
            }
            if magazine.alloc_lock.try_lock() {
                drop(guard);
                let result = self.map_region_and_allocate(mag_index, msize, zeroed);
                magazine.alloc_lock.unlock();
                return result;
            }
            // Someone else is mapping for this magazine; wait and retry.
            drop(guard);
            magazine.alloc_lock.wait_released();
        }
    }

    /// Allocate for a request of `size` bytes.
    pub fn allocate_bytes(&self, size: usize, zeroed: bool) -> Option<NonNull<u8>> {
        self.allocate(self.geo.msize_for(size), zeroed)
    }

    #[cold]
    fn map_region_and_allocate(&self, mag_index: usize, msize: usize, zeroed: bool) -> Option<NonNull<u8>> {
        let Some(region) = (unsafe { Region::create(&self.geo, mag_index) }) else {
            log::warn!("{}: region mapping failed", self.geo.params.name);
            return None;
        };
        if !self.registry.insert(region) {
            unsafe { region.destroy(&self.geo) };
            return None;
        }
        RackCounters::bump(&self.counters.regions_mapped);
        log::debug!(
            "{}: mapped region {:#x} for magazine {}",
            self.geo.params.name,
            region.base(),
            mag_index
        );
        let head = self.random_head_quanta();
        let mut guard = self.magazines[mag_index].inner.lock();
        guard.attach_new_region(region, head);
        guard.alloc_fast(msize, zeroed)
    }

    fn random_head_quanta(&self) -> usize {
        if !self.config.randomize_region_start {
            return 0;
        }
        let page = page_size();
        // Keep at least three quarters of the region usable.
        let max_pages = ((self.geo.payload_bytes() / 4) / page) as u64;
        let pages = platform::fast_random_u64() % (max_pages.min(MAX_RANDOM_HEAD_PAGES) + 1);
        (pages as usize * page) >> self.geo.params.quantum_shift
    }

    /// Pull a depot region with a free block of at least `msize` into the
    /// locked magazine.
    fn refill_from_depot(&self, guard: &mut Guard<'_>, msize: usize) -> bool {
        let mut depot = self.depot().inner.lock();
        let Some(region) = depot.depot_find_region(msize) else {
            return false;
        };
        depot.detach_region(region);
        region.header().set_owner(guard.index());
        drop(depot);
        guard.reattach_region(region);
        RackCounters::bump(&self.counters.depot_transfers_out);
        log::debug!(
            "{}: region {:#x} moved from depot to magazine {}",
            self.geo.params.name,
            region.base(),
            guard.index()
        );
        true
    }

    /// Fill `out` with blocks of `size` bytes from memory the magazine
    /// already owns. Never maps; returns how many were written.
    pub fn batch_allocate(&self, size: usize, out: &mut [*mut u8]) -> usize {
        let msize = self.geo.msize_for(size);
        if msize > self.geo.params.max_msize {
            return 0;
        }
        let mut guard = self.magazines[self.home_magazine()].inner.lock();
        let mut count = 0;
        for slot in out.iter_mut() {
            match guard.alloc_fast(msize, false) {
                Some(ptr) => {
                    *slot = ptr.as_ptr();
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    // ---------------------------------------------------------------------
    // Deallocation
    // ---------------------------------------------------------------------

    /// Free `ptr`. `region` and `known_size` may be supplied by a caller that
    /// already resolved them; otherwise they are looked up.
    ///
    /// # Safety
    /// `ptr` must not be used after this call. Freeing a pointer this rack
    /// did not hand out, or freeing twice, aborts the process.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>, region: Option<Region>, known_size: Option<usize>) {
        let ptr = ptr.as_ptr();
        let region = region.unwrap_or_else(|| self.region_or_abort(ptr));
        let mut guard = self.lock_owner(region);
        let (index, msize) = Self::in_use_block(&guard, region, ptr);
        if known_size.is_some_and(|size| self.geo.msize_for(size) > msize) {
            fatal::corruption(Corruption::BoundaryTagMismatch, ptr as usize);
        }
        let followup = if guard.is_depot() {
            guard.free_no_lock(region, index, msize)
        } else {
            let parked = LastFree {
                region,
                index,
                msize,
            };
            match guard.last_free.replace(parked) {
                Some(previous) => guard.free_no_lock(previous.region, previous.index, previous.msize),
                None => Followup::Nothing,
            }
        };
        self.finish(guard, followup);
    }

    /// Free every non-null pointer in `ptrs`, keeping a magazine locked
    /// across consecutive pointers it owns.
    ///
    /// # Safety
    /// As for `deallocate`, for each pointer.
    pub unsafe fn batch_deallocate(&self, ptrs: &[*mut u8]) {
        let mut held: Option<Guard<'_>> = None;
        for &ptr in ptrs {
            if ptr.is_null() {
                continue;
            }
            let region = self.region_or_abort(ptr);
            let mut guard = match held.take() {
                Some(guard) if region.header().owner() == guard.index() => guard,
                other => {
                    drop(other);
                    self.lock_owner(region)
                }
            };
            let (index, msize) = Self::in_use_block(&guard, region, ptr);
            match guard.free_no_lock(region, index, msize) {
                Followup::Nothing => held = Some(guard),
                followup => self.finish(guard, followup),
            }
        }
    }

    /// Release `guard` and carry out whatever the free deferred.
    fn finish(&self, guard: Guard<'_>, followup: Followup) {
        match followup {
            Followup::Nothing => drop(guard),
            Followup::Recirculate => {
                self.recirculate(guard, false);
            }
            Followup::Advise { region, addr, len } => {
                drop(guard);
                unsafe { platform::advise_free(addr as *mut u8, len) };
                region.header().unpin();
            }
            Followup::Unmap(region) => {
                drop(guard);
                self.release_region(region);
            }
        }
    }

    #[cold]
    fn release_region(&self, region: Region) {
        log::debug!("{}: unmapping empty region {:#x}", self.geo.params.name, region.base());
        self.registry.remove(region, || unsafe { region.destroy(&self.geo) });
        RackCounters::bump(&self.counters.regions_unmapped);
    }

    // ---------------------------------------------------------------------
    // Resize in place
    // ---------------------------------------------------------------------

    /// Shrink the block at `ptr` to `new_size` bytes, freeing the tail.
    /// Returns `ptr`; a request that does not shrink by a quantum is a no-op.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this rack.
    pub unsafe fn try_shrink_in_place(&self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> NonNull<u8> {
        let region = self.region_or_abort(ptr.as_ptr());
        let mut guard = self.lock_owner(region);
        let (index, msize) = Self::in_use_block(&guard, region, ptr.as_ptr());
        let new_msize = self.geo.msize_for(new_size);
        if new_msize >= msize {
            return ptr;
        }
        let tail = msize - new_msize;
        region.mark_in_use(index, new_msize);
        region.mark_in_use(index + new_msize, tail);
        guard.note_object_count(region, true);
        let followup = guard.free_no_lock(region, index + new_msize, tail);
        self.finish(guard, followup);
        ptr
    }

    /// Grow the block at `ptr` to `new_size` bytes without moving it.
    /// Returns `false` when the space after it is not available; the caller
    /// then falls back to allocate, copy and free.
    ///
    /// # Safety
    /// `ptr` must be a live allocation from this rack.
    pub unsafe fn try_realloc_in_place(&self, ptr: NonNull<u8>, _old_size: usize, new_size: usize) -> bool {
        let region = self.region_or_abort(ptr.as_ptr());
        let mut guard = self.lock_owner(region);
        let (index, msize) = Self::in_use_block(&guard, region, ptr.as_ptr());
        let new_msize = self.geo.msize_for(new_size);
        if new_msize <= msize {
            return true;
        }
        if new_msize > self.geo.params.max_msize {
            return false;
        }
        // Depot pages may be mid-advise.
        if guard.is_depot() && region.header().is_pinned() {
            return false;
        }
        let next = index + msize;
        let need = new_msize - msize;

        // A cached block right after us, or right after the free block that
        // follows us, goes back through the free path so it coalesces.
        let mut followup = Followup::Nothing;
        if let Some(cached) = guard.last_free {
            let follows = cached.index == next
                || region
                    .free_block_at(next)
                    .is_some_and(|free| next + free == cached.index);
            if cached.region == region && follows {
                followup = guard.flush_last_free();
            }
        }

        if guard.last_region == Some(region)
            && guard.unclaimed_tail_start() == next
            && guard.unclaimed_tail() >= need
        {
            guard.claim_tail(need);
            region.clear_block_tags(index, msize);
            region.mark_in_use(index, new_msize);
            guard.note_grown(region, need);
            self.finish(guard, followup);
            return true;
        }

        let Some(next_msize) = region.free_block_at(next) else {
            self.finish(guard, followup);
            return false;
        };
        if msize + next_msize < new_msize {
            self.finish(guard, followup);
            return false;
        }
        guard.free_list_remove(region, next, next_msize);
        region.clear_block_tags(index, msize);
        region.clear_block_tags(next, next_msize);
        region.mark_in_use(index, new_msize);
        let leftover = msize + next_msize - new_msize;
        guard.note_grown(region, need + leftover);
        if leftover > 0 {
            region.mark_in_use(index + new_msize, leftover);
            guard.note_object_count(region, true);
            let second = guard.free_no_lock(region, index + new_msize, leftover);
            if followup == Followup::Nothing {
                followup = second;
            } else {
                debug_assert!(matches!(second, Followup::Nothing | Followup::Recirculate));
            }
        }
        self.finish(guard, followup);
        true
    }

    /// Usable bytes of the live block at `ptr`; 0 for anything else,
    /// including freed blocks and pointers this rack does not own.
    ///
    /// The region is read with the registry locked so a concurrent unmap of
    /// an emptied depot region cannot pull it away. The registry sits below
    /// the magazines in the lock order, so the owner is only try-locked and
    /// the whole lookup retried on contention.
    pub fn size_of(&self, ptr: *const u8) -> usize {
        let mut attempts = 0;
        loop {
            let outcome = self.registry.with_region(ptr, |region| {
                let owner = region.header().owner();
                let Some(magazine) = self.magazines.get(owner) else {
                    return Some(0);
                };
                let guard = magazine.inner.try_lock()?;
                (region.header().owner() == owner).then(|| self.live_size(&guard, region, ptr))
            });
            match outcome {
                None => return 0,
                Some(Some(size)) => return size,
                Some(None) => {}
            }
            attempts += 1;
            if attempts > LOCK_HOP_SPINS {
                std::thread::yield_now();
            } else {
                core::hint::spin_loop();
            }
        }
    }

    fn live_size(&self, guard: &MagazineInner, region: Region, ptr: *const u8) -> usize {
        let Some(index) = region.index_of(ptr) else {
            return 0;
        };
        if guard
            .last_free
            .is_some_and(|cached| cached.region == region && cached.index == index)
        {
            return 0;
        }
        let tag = region.tag(index);
        if tag.is_head() && !tag.is_free() {
            self.geo.bytes_for(tag.msize())
        } else {
            0
        }
    }

    // ---------------------------------------------------------------------
    // Recirculation and pressure relief
    // ---------------------------------------------------------------------

    /// Move one region from the locked magazine to the depot. With `any`
    /// the region need not be flagged sparse. Returns whether one moved.
    fn recirculate(&self, mut guard: Guard<'_>, any: bool) -> bool {
        debug_assert!(!guard.is_depot());
        let Some(region) = guard.recirc_candidate(any) else {
            return false;
        };
        let from = guard.index();
        guard.detach_region(region);
        let mut depot = self.depot().inner.lock();
        region.header().set_owner(DEPOT_INDEX);
        depot.reattach_region(region);
        drop(guard);
        RackCounters::bump(&self.counters.depot_transfers_in);
        log::debug!(
            "{}: region {:#x} recirculated from magazine {} to depot",
            self.geo.params.name,
            region.base(),
            from
        );

        if !self.config.advise_on_free {
            depot = self.advise_region(depot, region);
        }
        match depot.depot_surplus_empty_region() {
            Some(surplus) => {
                depot.detach_region(surplus);
                drop(depot);
                self.release_region(surplus);
            }
            None => drop(depot),
        }
        true
    }

    /// Advise every whole free page of a depot region. The depot lock is
    /// dropped around each batch of syscalls with the region pinned, then
    /// the scan resumes from the block now covering the cursor.
    fn advise_region<'a>(&'a self, mut depot: Guard<'a>, region: Region) -> Guard<'a> {
        let n = region.num_quanta();
        let mut cursor = 0;
        loop {
            let mut batch = [(0usize, 0usize); ADVISE_BATCH];
            let mut count = 0;
            while cursor < n && count < ADVISE_BATCH {
                let tag = region.tag(cursor);
                if !tag.is_head() || tag.msize() == 0 {
                    fatal::corruption(Corruption::BoundaryTagMismatch, region.block_ptr(cursor) as usize);
                }
                let msize = tag.msize();
                if tag.is_free() {
                    let oob = crate::free_entry::FreeEntry::find_for_block(region, cursor, msize).is_out_of_band();
                    if let Some(range) = region.advisable_range(cursor, msize, oob) {
                        batch[count] = range;
                        count += 1;
                    }
                }
                cursor += msize;
            }
            if count == 0 {
                return depot;
            }
            region.header().pin();
            drop(depot);
            for &(addr, len) in &batch[..count] {
                unsafe { platform::advise_free(addr as *mut u8, len) };
            }
            depot = self.depot().inner.lock();
            region.header().unpin();
            if cursor >= n {
                return depot;
            }
            // Frees while unlocked may have merged across the cursor.
            while cursor > 0 && !region.tag(cursor).is_head() {
                cursor -= 1;
            }
        }
    }

    /// Respond to OS memory pressure: move every magazine region to the
    /// depot, advising free pages, and unmap empty regions beyond the
    /// depot's reserve. Walks every region; not for latency-sensitive paths.
    pub fn relieve_pressure(&self) {
        let mut moved = 0;
        for index in 1..self.magazines.len() {
            loop {
                let mut guard = self.magazines[index].inner.lock();
                // This sweep moves everything anyway.
                let _ = guard.flush_last_free();
                guard.finalize_region();
                if !self.recirculate(guard, true) {
                    break;
                }
                moved += 1;
            }
        }
        let mut unmapped = 0;
        loop {
            let mut depot = self.depot().inner.lock();
            let Some(region) = depot.depot_surplus_empty_region() else {
                break;
            };
            depot.detach_region(region);
            drop(depot);
            self.release_region(region);
            unmapped += 1;
        }
        log::info!(
            "{}: pressure relief moved {} regions to the depot, unmapped {}",
            self.geo.params.name,
            moved,
            unmapped
        );
    }

    // ---------------------------------------------------------------------
    // Introspection
    // ---------------------------------------------------------------------

    /// Walk every region and free list. Reports faults without aborting.
    pub fn consistency_report(&self) -> ConsistencyReport {
        let mut report = ConsistencyReport::default();
        for magazine in self.magazines.iter() {
            let mut part = ConsistencyReport::default();
            consistency::check_magazine(&magazine.inner.lock(), &mut part);
            report.merge(&part);
        }
        let registered = self.registry.len();
        let owned = report.regions_checked;
        if registered != owned {
            report.fault(format_args!(
                "registry holds {} regions but magazines own {}",
                registered, owned
            ));
        }
        report
    }

    /// `true` if `consistency_report` finds no faults. Faults are logged.
    pub fn check_consistency(&self) -> bool {
        let report = self.consistency_report();
        if !report.is_ok() {
            log::warn!(
                "{}: consistency check found {} faults",
                self.geo.params.name,
                report.faults
            );
        }
        report.is_ok()
    }

    pub fn statistics(&self) -> RackStats {
        let mut stats = RackStats::default();
        for magazine in self.magazines.iter() {
            magazine.inner.lock().add_stats(&mut stats);
        }
        self.counters.fill(&mut stats);
        stats
    }

    /// Append the base address of every mapped region to `out`.
    pub fn region_bases(&self, out: &mut Vec<usize>) {
        self.registry.collect_bases(out);
    }
}

impl Drop for Rack {
    fn drop(&mut self) {
        let mut bases = Vec::new();
        self.registry.collect_bases(&mut bases);
        for base in bases {
            unsafe { Region::from_base(base).destroy(&self.geo) };
        }
    }
}
