//! Free-list link sealing.
//!
//! Each stored link word carries an 8-bit checksum of
//! `(link ^ cookie ^ storage address)` in its top byte. The cookie is random
//! per rack, the storage address ties the word to where it was written, so a
//! stale, scribbled or transplanted link fails verification on the next read.

/// Link payloads never use the top byte (user-space addresses are < 2^56).
pub const LINK_PAYLOAD_MASK: u64 = (1 << 56) - 1;

#[inline(always)]
pub fn link_checksum(link: u64, cookie: u64, storage_addr: usize) -> u8 {
    let input = link ^ cookie ^ (storage_addr as u64);
    let h = input.wrapping_mul(0xbf58_476d_1ce4_e5b9);
    let h = h ^ (h >> 31);
    // Fold all 64 bits so every input bit influences the stored byte.
    let h = h ^ (h >> 32);
    let h = h ^ (h >> 16);
    (h ^ (h >> 8)) as u8
}

/// Encode `link` for storage at `storage_addr`.
#[inline(always)]
pub fn seal(link: u64, cookie: u64, storage_addr: usize) -> u64 {
    debug_assert_eq!(link & !LINK_PAYLOAD_MASK, 0);
    if cfg!(feature = "free-list-checksums") {
        link | ((link_checksum(link, cookie, storage_addr) as u64) << 56)
    } else {
        link
    }
}

/// Decode a stored word, returning `None` if the checksum does not match.
#[inline(always)]
pub fn unseal(stored: u64, cookie: u64, storage_addr: usize) -> Option<u64> {
    let link = stored & LINK_PAYLOAD_MASK;
    if cfg!(feature = "free-list-checksums") {
        let expected = link_checksum(link, cookie, storage_addr);
        if (stored >> 56) as u8 != expected {
            return None;
        }
    } else if stored != link {
        return None;
    }
    Some(link)
}
