//! Full-heap consistency walk.
//!
//! Unlike the checks on the alloc/free paths this never aborts: every problem
//! is counted and logged, and the caller decides what to do with the report.

use crate::free_entry::FreeEntry;
use crate::magazine::MagazineInner;
use crate::region::Region;
use core::fmt;

/// Result of a consistency walk across all magazines.
#[derive(Debug, Default, Clone)]
pub struct ConsistencyReport {
    pub regions_checked: usize,
    pub blocks_checked: usize,
    pub free_entries_checked: usize,
    pub faults: usize,
    /// Description of the first fault found.
    pub first_fault: Option<String>,
}

impl ConsistencyReport {
    pub fn is_ok(&self) -> bool {
        self.faults == 0
    }

    pub fn merge(&mut self, other: &ConsistencyReport) {
        self.regions_checked += other.regions_checked;
        self.blocks_checked += other.blocks_checked;
        self.free_entries_checked += other.free_entries_checked;
        self.faults += other.faults;
        if self.first_fault.is_none() {
            self.first_fault.clone_from(&other.first_fault);
        }
    }

    pub(crate) fn fault(&mut self, args: fmt::Arguments<'_>) {
        log::warn!("consistency: {args}");
        if self.first_fault.is_none() {
            self.first_fault = Some(args.to_string());
        }
        self.faults += 1;
    }
}

/// Check every region owned by `mag` and every entry on its free lists.
pub(crate) fn check_magazine(mag: &MagazineInner, report: &mut ConsistencyReport) {
    let geo = mag.geometry();
    let mut owned: Vec<Region> = Vec::new();
    let mut free_blocks = 0;
    let mut objects = 0;
    let mut bytes = 0;

    for region in mag.regions() {
        report.regions_checked += 1;
        owned.push(region);
        let h = region.header();
        if h.owner() != mag.index() {
            report.fault(format_args!(
                "region {:#x} on magazine {} records owner {}",
                region.base(),
                mag.index(),
                h.owner()
            ));
        }
        let walk = walk_region(mag, region, report);
        if walk.bytes != h.bytes_used.get() || walk.objects != h.objects_in_use.get() {
            report.fault(format_args!(
                "region {:#x} counts {} bytes in {} objects, tags show {} in {}",
                region.base(),
                h.bytes_used.get(),
                h.objects_in_use.get(),
                walk.bytes,
                walk.objects
            ));
        }
        free_blocks += walk.free_blocks;
        objects += walk.objects;
        bytes += walk.bytes;
    }

    if objects != mag.num_objects || bytes != mag.bytes_in_objects {
        report.fault(format_args!(
            "magazine {} counts {} bytes in {} objects, regions hold {} in {}",
            mag.index(),
            mag.bytes_in_objects,
            mag.num_objects,
            bytes,
            objects
        ));
    }
    if mag.bytes_in_magazine != owned.len() * geo.payload_bytes() {
        report.fault(format_args!(
            "magazine {} accounts {} payload bytes for {} regions",
            mag.index(),
            mag.bytes_in_magazine,
            owned.len()
        ));
    }

    let listed = check_free_lists(mag, &owned, free_blocks, report);
    if listed != free_blocks {
        report.fault(format_args!(
            "magazine {} lists {} free entries but its regions hold {} free blocks",
            mag.index(),
            listed,
            free_blocks
        ));
    }
}

#[derive(Default)]
struct RegionWalk {
    free_blocks: usize,
    objects: usize,
    bytes: usize,
}

fn walk_region(mag: &MagazineInner, region: Region, report: &mut ConsistencyReport) -> RegionWalk {
    let geo = mag.geometry();
    let n = region.num_quanta();
    let (head_end, tail_start) = if mag.last_region == Some(region) {
        (mag.unclaimed_head(), n - mag.unclaimed_tail())
    } else {
        (0, n)
    };
    let mut walk = RegionWalk::default();
    let mut previous_free = false;
    let mut index = head_end;

    while index < tail_start {
        let tag = region.tag(index);
        let msize = tag.msize();
        if !tag.is_head() || msize == 0 || index + msize > tail_start {
            report.fault(format_args!(
                "region {:#x} quantum {}: expected a block start, found {:?}",
                region.base(),
                index,
                tag
            ));
            return walk;
        }
        report.blocks_checked += 1;
        if msize > 1 {
            let end = region.tag(index + msize - 1);
            if !end.is_tail() || end.msize() != msize || end.is_free() != tag.is_free() {
                report.fault(format_args!(
                    "region {:#x} quantum {}: head {:?} disagrees with tail {:?}",
                    region.base(),
                    index,
                    tag,
                    end
                ));
            }
            if let Some(stray) = (index + 1..index + msize - 1).find(|&i| !region.tag(i).is_middle()) {
                report.fault(format_args!(
                    "region {:#x} quantum {}: stray tag inside block at {}",
                    region.base(),
                    stray,
                    index
                ));
            }
        }
        if tag.is_free() {
            if previous_free {
                report.fault(format_args!(
                    "region {:#x} quantum {}: two adjacent free blocks",
                    region.base(),
                    index
                ));
            }
            walk.free_blocks += 1;
        } else {
            if msize > geo.params.max_msize {
                report.fault(format_args!(
                    "region {:#x} quantum {}: in-use block of {} quanta exceeds the class maximum",
                    region.base(),
                    index,
                    msize
                ));
            }
            walk.objects += 1;
            walk.bytes += geo.bytes_for(msize);
        }
        previous_free = tag.is_free();
        index += msize;
    }
    walk
}

/// Walk every slot, following links with the non-aborting readers. Returns
/// the number of entries seen.
fn check_free_lists(mag: &MagazineInner, owned: &[Region], limit: usize, report: &mut ConsistencyReport) -> usize {
    let geo = mag.geometry();
    let lists = &mag.lists;
    let mask = lists.region_mask();
    let cookie = lists.cookie();
    let mut seen = 0;

    for slot in 0..lists.num_slots() {
        let head = lists.head(slot);
        if head.is_some() != lists.is_marked(slot) {
            report.fault(format_args!("slot {slot}: bitmap disagrees with list head"));
        }
        let mut previous: Option<FreeEntry> = None;
        let mut current = head;
        while let Some(entry) = current {
            if seen > limit {
                report.fault(format_args!("slot {slot}: free list longer than the free block count"));
                return seen;
            }
            let Some((region, index)) = locate(entry, owned, mask) else {
                report.fault(format_args!(
                    "slot {slot}: entry {:#x} is outside this magazine's regions",
                    entry.link_word()
                ));
                break;
            };
            seen += 1;
            report.free_entries_checked += 1;

            let tag = region.tag(index);
            if !tag.is_head() || !tag.is_free() || geo.slot_for(tag.msize().max(1)) != slot {
                report.fault(format_args!(
                    "slot {slot}: entry for {:#x} describes {:?}",
                    region.block_ptr(index) as usize,
                    tag
                ));
            }

            match entry.try_previous_word(cookie).map(|w| decode_owned(w, mask, owned)) {
                Ok(Some(back)) if back == previous => {}
                Ok(Some(_)) => report.fault(format_args!(
                    "slot {slot}: previous link of {:#x} does not point back",
                    entry.link_word()
                )),
                _ => report.fault(format_args!(
                    "slot {slot}: previous link of {:#x} fails its checksum",
                    entry.link_word()
                )),
            }
            current = match entry.try_next_word(cookie).map(|w| decode_owned(w, mask, owned)) {
                Ok(Some(next)) => next,
                _ => {
                    report.fault(format_args!(
                        "slot {slot}: next link of {:#x} fails its checksum",
                        entry.link_word()
                    ));
                    None
                }
            };
            previous = Some(entry);
        }
    }
    seen
}

/// Decode a link word that passed its checksum. An out-of-band word naming a
/// region outside `owned` is refused before `decode` reads that region.
fn decode_owned(word: u64, mask: usize, owned: &[Region]) -> Option<Option<FreeEntry>> {
    if let Some(base) = FreeEntry::oob_region_base(word, mask) {
        if !owned.iter().any(|r| r.base() == base) {
            return None;
        }
    }
    FreeEntry::decode(word, mask).ok()
}

/// Resolve an entry to its block, but only inside regions known to belong to
/// the magazine, so a bad link is never dereferenced.
fn locate(entry: FreeEntry, owned: &[Region], mask: usize) -> Option<(Region, usize)> {
    match entry {
        FreeEntry::InPlace(node) => {
            let addr = node.as_ptr() as usize;
            let region = *owned.iter().find(|r| r.base() == addr & mask)?;
            region.index_of(addr as *const u8).map(|index| (region, index))
        }
        FreeEntry::OutOfBand { region, slot } => {
            if !owned.contains(&region) {
                return None;
            }
            let q = unsafe { (*region.oob_entry(slot as usize)).quantum };
            let index = (q & !crate::free_entry::OOB_IN_USE) as usize;
            (q & crate::free_entry::OOB_IN_USE != 0 && index < region.num_quanta()).then_some((region, index))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::{Geometry, TINY};
    use crate::util::init_page_size;

    #[test]
    fn links_into_foreign_regions_are_refused_unread() {
        init_page_size();
        let geo = Geometry::new(TINY).unwrap();
        let mask = geo.region_mask();
        unsafe {
            let region = Region::create(&geo, 1).expect("map region");
            let owned = [region];
            let oob = region.base() as u64 | (3 << 1) | 1;
            assert!(matches!(
                decode_owned(oob, mask, &owned),
                Some(Some(FreeEntry::OutOfBand { slot: 3, .. }))
            ));
            assert!(matches!(decode_owned(0, mask, &owned), Some(None)));

            // Names a region nobody mapped; decoding it would fault.
            let stray = (region.base() + 64 * geo.region_size) as u64 | 1;
            assert!(decode_owned(stray, mask, &owned).is_none());
            assert!(decode_owned(oob, mask, &[]).is_none());
            region.destroy(&geo);
        }
    }
}
