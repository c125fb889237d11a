//! Per-magazine table of segregated free lists.
//!
//! Slot `s < num_slots - 1` holds free blocks of exactly `s + 1` quanta; the
//! last slot holds every larger block. A bitmap with one bit per slot marks
//! non-empty lists so a fit is found with `trailing_zeros`.

use crate::fatal::{self, Corruption};
use crate::free_entry::FreeEntry;

pub struct FreeListTable {
    heads: Box<[Option<FreeEntry>]>,
    bitmap: Box<[u64]>,
    cookie: u64,
    region_mask: usize,
}

impl FreeListTable {
    pub fn new(num_slots: usize, cookie: u64, region_mask: usize) -> Self {
        FreeListTable {
            heads: vec![None; num_slots].into_boxed_slice(),
            bitmap: vec![0u64; num_slots.div_ceil(64)].into_boxed_slice(),
            cookie,
            region_mask,
        }
    }

    #[inline]
    pub fn num_slots(&self) -> usize {
        self.heads.len()
    }

    #[inline]
    pub fn head(&self, slot: usize) -> Option<FreeEntry> {
        self.heads[slot]
    }

    #[inline]
    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    #[inline]
    pub fn region_mask(&self) -> usize {
        self.region_mask
    }

    #[inline]
    pub fn is_marked(&self, slot: usize) -> bool {
        self.bitmap[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    #[inline]
    fn mark(&mut self, slot: usize) {
        self.bitmap[slot / 64] |= 1u64 << (slot % 64);
    }

    #[inline]
    fn unmark(&mut self, slot: usize) {
        self.bitmap[slot / 64] &= !(1u64 << (slot % 64));
    }

    /// Push `entry` at the head of `slot`.
    pub fn push(&mut self, slot: usize, entry: FreeEntry) {
        let old_head = self.heads[slot];
        entry.set_previous(self.cookie, None);
        entry.set_next(self.cookie, old_head);
        if let Some(old) = old_head {
            old.set_previous(self.cookie, Some(entry));
        }
        self.heads[slot] = Some(entry);
        self.mark(slot);
    }

    /// Unlink `entry` from `slot`. Aborts if the links around it were tampered
    /// with or if it claims to be a head it is not.
    pub fn unlink(&mut self, slot: usize, entry: FreeEntry) {
        let previous = entry.previous(self.cookie, self.region_mask);
        let next = entry.next(self.cookie, self.region_mask);
        match previous {
            Some(prev) => prev.set_next(self.cookie, next),
            None => {
                if self.heads[slot] != Some(entry) {
                    fatal::corruption(Corruption::FreeListHeadMismatch, entry.link_word() as usize);
                }
                self.heads[slot] = next;
                if next.is_none() {
                    self.unmark(slot);
                }
            }
        }
        if let Some(next) = next {
            next.set_previous(self.cookie, previous);
        }
    }

    /// First non-empty slot at or above `slot`.
    pub fn first_nonempty_from(&self, slot: usize) -> Option<usize> {
        let mut word_index = slot / 64;
        if word_index >= self.bitmap.len() {
            return None;
        }
        let mut word = self.bitmap[word_index] & (u64::MAX << (slot % 64));
        loop {
            if word != 0 {
                return Some(word_index * 64 + word.trailing_zeros() as usize);
            }
            word_index += 1;
            if word_index == self.bitmap.len() {
                return None;
            }
            word = self.bitmap[word_index];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::ptr::NonNull;

    const COOKIE: u64 = 0x0123_4567_89ab_cdef;

    /// 16-byte aligned backing store for in-place nodes.
    fn nodes(n: usize) -> Vec<u128> {
        vec![0u128; n]
    }

    fn entry(store: &mut [u128], i: usize) -> FreeEntry {
        FreeEntry::InPlace(NonNull::new(&mut store[i] as *mut u128 as *mut _).unwrap())
    }

    fn collect(table: &FreeListTable, slot: usize) -> Vec<FreeEntry> {
        let mut out = Vec::new();
        let mut cur = table.head(slot);
        while let Some(e) = cur {
            out.push(e);
            cur = e.next(table.cookie(), table.region_mask());
        }
        out
    }

    #[test]
    fn push_is_lifo() {
        let mut store = nodes(4);
        let mut t = FreeListTable::new(64, COOKIE, !0xFFFF);
        let (a, b, c) = (entry(&mut store, 0), entry(&mut store, 1), entry(&mut store, 2));
        t.push(3, a);
        t.push(3, b);
        t.push(3, c);
        assert_eq!(collect(&t, 3), vec![c, b, a]);
        assert!(t.is_marked(3));
    }

    #[test]
    fn unlink_middle_head_and_last() {
        let mut store = nodes(4);
        let mut t = FreeListTable::new(64, COOKIE, !0xFFFF);
        let (a, b, c) = (entry(&mut store, 0), entry(&mut store, 1), entry(&mut store, 2));
        t.push(5, a);
        t.push(5, b);
        t.push(5, c);
        t.unlink(5, b);
        assert_eq!(collect(&t, 5), vec![c, a]);
        t.unlink(5, c);
        assert_eq!(collect(&t, 5), vec![a]);
        assert_eq!(a.previous(COOKIE, !0xFFFF), None);
        t.unlink(5, a);
        assert!(collect(&t, 5).is_empty());
        assert!(!t.is_marked(5));
        assert_eq!(t.first_nonempty_from(0), None);
    }

    #[test]
    fn search_crosses_bitmap_words() {
        let mut store = nodes(2);
        let mut t = FreeListTable::new(256, COOKIE, !0xFFFF);
        t.push(200, entry(&mut store, 0));
        assert_eq!(t.first_nonempty_from(0), Some(200));
        assert_eq!(t.first_nonempty_from(200), Some(200));
        assert_eq!(t.first_nonempty_from(201), None);
        t.push(7, entry(&mut store, 1));
        assert_eq!(t.first_nonempty_from(3), Some(7));
        assert_eq!(t.first_nonempty_from(8), Some(200));
    }
}
