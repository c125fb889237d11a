//! Per-quantum boundary tags.
//!
//! Every block records `(msize, free)` on its first quantum and, when it spans
//! two or more quanta, a replica on its last quantum marked as the tail.
//! Interior quanta and never-claimed space hold the zero tag.

/// Largest msize a tag can carry.
pub const MAX_TAG_MSIZE: usize = (1 << 14) - 1;

const MSIZE_MASK: u16 = 0x3FFF;
const TAIL_BIT: u16 = 1 << 14;
const FREE_BIT: u16 = 1 << 15;

#[derive(Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct BlockTag(u16);

impl BlockTag {
    pub const MIDDLE: BlockTag = BlockTag(0);

    #[inline]
    pub fn head(msize: usize, free: bool) -> Self {
        debug_assert!(msize > 0 && msize <= MAX_TAG_MSIZE);
        let mut bits = msize as u16;
        if free {
            bits |= FREE_BIT;
        }
        BlockTag(bits)
    }

    #[inline]
    pub fn tail(msize: usize, free: bool) -> Self {
        debug_assert!(msize > 1);
        BlockTag(Self::head(msize, free).0 | TAIL_BIT)
    }

    /// Reinterpret a raw tag read from another process.
    #[inline]
    pub fn from_bits(bits: u16) -> Self {
        BlockTag(bits)
    }

    #[inline]
    pub fn msize(self) -> usize {
        (self.0 & MSIZE_MASK) as usize
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.0 & FREE_BIT != 0
    }

    #[inline]
    pub fn is_tail(self) -> bool {
        self.0 & TAIL_BIT != 0
    }

    #[inline]
    pub fn is_middle(self) -> bool {
        self.0 == 0
    }

    /// True for the tag written at a block's first quantum.
    #[inline]
    pub fn is_head(self) -> bool {
        !self.is_middle() && !self.is_tail()
    }

    /// Msize of the block that ends at this quantum, read from its last tag.
    /// A one-quantum block has no tail replica, so a head tag here means 1.
    #[inline]
    pub fn msize_ending_here(self) -> usize {
        if self.is_tail() {
            self.msize()
        } else {
            1
        }
    }
}

impl core::fmt::Debug for BlockTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.is_middle() {
            return f.write_str("Middle");
        }
        f.debug_struct(if self.is_tail() { "Tail" } else { "Head" })
            .field("msize", &self.msize())
            .field("free", &self.is_free())
            .finish()
    }
}
