//! Where a free block keeps its list links.
//!
//! Small free blocks hold a two-word node in their own first quantum. Blocks
//! that start on a page boundary and span at least a page keep the node in
//! the region's out-of-band table instead, so every page of the block can be
//! returned to the OS without losing the list.
//!
//! Links are stored as words: `0` is "none", an even word is the address of an
//! in-place node, an odd word is `region_base | slot << 1 | 1`. Each stored word
//! is sealed with an 8-bit checksum (see `checksum`).

use crate::checksum::{seal, unseal};
use crate::fatal::{self, Corruption};
use crate::region::Region;
use core::ptr::NonNull;

/// Marks an OOB table entry as describing a free block.
pub const OOB_IN_USE: u32 = 1 << 31;

const OOB_TAG: u64 = 1;
const OOB_SLOT_MASK: u64 = 0xFFFF << 1;

/// Node written into the first quantum of an in-place free block.
#[repr(C)]
pub struct InPlaceNode {
    previous: u64,
    next: u64,
}

/// Out-of-band table entry: links plus the quantum index of the block it
/// describes (`OOB_IN_USE | index`, or zero when unused).
#[repr(C)]
pub struct OobEntry {
    pub(crate) previous: u64,
    pub(crate) next: u64,
    pub(crate) quantum: u32,
    _pad: u32,
}

/// A free-list element, wherever its links live.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FreeEntry {
    InPlace(NonNull<InPlaceNode>),
    OutOfBand { region: Region, slot: u16 },
}

/// A stored link failed verification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BadLink {
    pub storage: usize,
}

impl FreeEntry {
    /// Pick the representation for a block that is about to become free.
    /// OOB-eligible blocks fall back to in-place when the table is full.
    pub fn for_block(region: Region, index: usize, msize: usize) -> FreeEntry {
        if region.wants_oob(index, msize) {
            if let Some(slot) = region.oob_claim(index) {
                return FreeEntry::OutOfBand { region, slot };
            }
        }
        FreeEntry::in_place_at(region, index)
    }

    /// Locate the entry already describing the free block at `index`.
    pub fn find_for_block(region: Region, index: usize, msize: usize) -> FreeEntry {
        if region.wants_oob(index, msize) {
            if let Some(slot) = region.oob_find(index) {
                return FreeEntry::OutOfBand { region, slot };
            }
        }
        FreeEntry::in_place_at(region, index)
    }

    #[inline]
    fn in_place_at(region: Region, index: usize) -> FreeEntry {
        let node = region.block_ptr(index) as *mut InPlaceNode;
        // Block pointers are inside a mapping and never null.
        FreeEntry::InPlace(unsafe { NonNull::new_unchecked(node) })
    }

    /// Give back the OOB slot, if any. The entry must already be unlinked.
    #[inline]
    pub fn release(self) {
        if let FreeEntry::OutOfBand { region, slot } = self {
            region.oob_release(slot);
        }
    }

    #[inline]
    pub fn is_out_of_band(self) -> bool {
        matches!(self, FreeEntry::OutOfBand { .. })
    }

    /// The block this entry describes, as `(region, quantum index)`.
    pub fn block(self, region_mask: usize) -> (Region, usize) {
        match self {
            FreeEntry::InPlace(node) => {
                let addr = node.as_ptr() as usize;
                let region = unsafe { Region::from_base(addr & region_mask) };
                match region.index_of(addr as *const u8) {
                    Some(index) => (region, index),
                    None => fatal::corruption(Corruption::ChecksumMismatch, addr),
                }
            }
            FreeEntry::OutOfBand { region, slot } => (region, region.oob_block_index(slot)),
        }
    }

    #[inline]
    pub fn link_word(self) -> u64 {
        match self {
            FreeEntry::InPlace(node) => node.as_ptr() as u64,
            FreeEntry::OutOfBand { region, slot } => {
                region.base() as u64 | ((slot as u64) << 1) | OOB_TAG
            }
        }
    }

    /// Base of the region an out-of-band link word names, without reading
    /// it. `None` for in-place words and the null link.
    #[inline]
    pub fn oob_region_base(word: u64, region_mask: usize) -> Option<usize> {
        (word & OOB_TAG != 0).then(|| word as usize & region_mask)
    }

    /// Decode a verified link word. OOB references must name a slot inside
    /// the table of the region they point into.
    pub fn decode(word: u64, region_mask: usize) -> Result<Option<FreeEntry>, BadLink> {
        if word == 0 {
            return Ok(None);
        }
        if word & OOB_TAG == 0 {
            let node = word as usize as *mut InPlaceNode;
            return Ok(Some(FreeEntry::InPlace(unsafe { NonNull::new_unchecked(node) })));
        }
        let region = unsafe { Region::from_base((word as usize) & region_mask) };
        let slot = ((word & OOB_SLOT_MASK) >> 1) as u16;
        let stray = (word as usize) & !region_mask & !((OOB_SLOT_MASK | OOB_TAG) as usize);
        if stray != 0 || slot as usize >= region.oob_capacity() {
            return Err(BadLink {
                storage: word as usize,
            });
        }
        Ok(Some(FreeEntry::OutOfBand { region, slot }))
    }

    #[inline]
    fn previous_slot(self) -> *mut u64 {
        match self {
            FreeEntry::InPlace(node) => unsafe { core::ptr::addr_of_mut!((*node.as_ptr()).previous) },
            FreeEntry::OutOfBand { region, slot } => unsafe {
                core::ptr::addr_of_mut!((*region.oob_entry(slot as usize)).previous)
            },
        }
    }

    #[inline]
    fn next_slot(self) -> *mut u64 {
        match self {
            FreeEntry::InPlace(node) => unsafe { core::ptr::addr_of_mut!((*node.as_ptr()).next) },
            FreeEntry::OutOfBand { region, slot } => unsafe {
                core::ptr::addr_of_mut!((*region.oob_entry(slot as usize)).next)
            },
        }
    }

    fn read_link(slot: *mut u64, cookie: u64) -> Result<u64, BadLink> {
        let stored = unsafe { slot.read() };
        unseal(stored, cookie, slot as usize).ok_or(BadLink {
            storage: slot as usize,
        })
    }

    fn load(slot: *mut u64, cookie: u64, region_mask: usize) -> Option<FreeEntry> {
        let word = match Self::read_link(slot, cookie) {
            Ok(word) => word,
            Err(bad) => fatal::corruption(Corruption::ChecksumMismatch, bad.storage),
        };
        match Self::decode(word, region_mask) {
            Ok(entry) => entry,
            Err(bad) => fatal::corruption(Corruption::OobOutOfRegion, bad.storage),
        }
    }

    #[inline]
    fn store(slot: *mut u64, cookie: u64, link: Option<FreeEntry>) {
        let word = link.map_or(0, FreeEntry::link_word);
        unsafe { slot.write(seal(word, cookie, slot as usize)) }
    }

    /// Previous element, aborting if the stored link fails its checksum.
    #[inline]
    pub fn previous(self, cookie: u64, region_mask: usize) -> Option<FreeEntry> {
        Self::load(self.previous_slot(), cookie, region_mask)
    }

    /// Next element, aborting if the stored link fails its checksum.
    #[inline]
    pub fn next(self, cookie: u64, region_mask: usize) -> Option<FreeEntry> {
        Self::load(self.next_slot(), cookie, region_mask)
    }

    #[inline]
    pub fn set_previous(self, cookie: u64, link: Option<FreeEntry>) {
        Self::store(self.previous_slot(), cookie, link);
    }

    #[inline]
    pub fn set_next(self, cookie: u64, link: Option<FreeEntry>) {
        Self::store(self.next_slot(), cookie, link);
    }

    /// Verified `next` word for the consistency checker, which reports a bad
    /// checksum instead of aborting. Decode it with `decode`.
    pub fn try_next_word(self, cookie: u64) -> Result<u64, BadLink> {
        Self::read_link(self.next_slot(), cookie)
    }

    /// Like `try_next_word` for the `previous` link.
    pub fn try_previous_word(self, cookie: u64) -> Result<u64, BadLink> {
        Self::read_link(self.previous_slot(), cookie)
    }
}
