//! Size-class parameters for the unified tiny/small engine.
//!
//! Both engines run the same magazine/region code; they differ only in the
//! constants below, fixed when a `Rack` is built.

use crate::free_entry::OobEntry;
use crate::region::RegionHeader;
use crate::tag::{BlockTag, MAX_TAG_MSIZE};
use crate::util::{align_up, page_size};
use thiserror::Error;

/// Construction-time constants of one size class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SizeClassParams {
    pub name: &'static str,
    /// log2 of the quantum (allocation granularity) in bytes.
    pub quantum_shift: u32,
    /// log2 of the region size; regions are aligned to their own size.
    pub region_shift: u32,
    /// Free-list slots. Slots `0..num_slots-1` hold msize `slot + 1` exactly,
    /// the last slot holds everything `>= num_slots`.
    pub num_slots: usize,
    /// Largest msize this class hands out.
    pub max_msize: usize,
    /// Out-of-band free entries per region.
    pub oob_capacity: usize,
}

/// 16-byte quanta, 256 KiB regions, requests up to 1008 bytes.
pub const TINY: SizeClassParams = SizeClassParams {
    name: "tiny",
    quantum_shift: 4,
    region_shift: 18,
    num_slots: 64,
    max_msize: 63,
    oob_capacity: 16,
};

/// 512-byte quanta, 8 MiB regions, requests up to 127.5 KiB.
pub const SMALL: SizeClassParams = SizeClassParams {
    name: "small",
    quantum_shift: 9,
    region_shift: 23,
    num_slots: 256,
    max_msize: 255,
    oob_capacity: 64,
};

/// Out-of-band links pack the slot index into bits 1..=16 of the region base,
/// so regions must be aligned past bit 16.
const MIN_REGION_SHIFT: u32 = 17;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamsError {
    #[error("quantum of 2^{0} bytes is smaller than a free-list node")]
    QuantumTooSmall(u32),
    #[error("region alignment 2^{0} is below the 2^17 needed for out-of-band links")]
    RegionTooSmall(u32),
    #[error("region holds {0} quanta, more than a block tag can describe")]
    TooManyQuanta(usize),
    #[error("region leaves no room for data after {0} bytes of metadata")]
    NoPayload(usize),
    #[error("max msize {max_msize} must be below the slot count {num_slots}")]
    MaxMsizeOutOfRange { max_msize: usize, num_slots: usize },
    #[error("at least two free-list slots are required")]
    TooFewSlots,
    #[error("out-of-band table capacity {0} exceeds 65535")]
    OobCapacity(usize),
}

/// Byte layout of a region for one `SizeClassParams` and the runtime page size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Geometry {
    pub params: SizeClassParams,
    pub quantum: usize,
    pub region_size: usize,
    /// Offset of the tag array from the region base.
    pub tags_offset: usize,
    /// Offset of the OOB table from the region base.
    pub oob_offset: usize,
    /// Offset of the first data quantum; page aligned.
    pub data_offset: usize,
    pub num_quanta: usize,
}

impl Geometry {
    pub fn new(params: SizeClassParams) -> Result<Self, ParamsError> {
        if params.quantum_shift < 4 {
            return Err(ParamsError::QuantumTooSmall(params.quantum_shift));
        }
        if params.region_shift < MIN_REGION_SHIFT || params.region_shift >= usize::BITS - 1 {
            return Err(ParamsError::RegionTooSmall(params.region_shift));
        }
        if params.num_slots < 2 {
            return Err(ParamsError::TooFewSlots);
        }
        if params.max_msize == 0 || params.max_msize >= params.num_slots {
            return Err(ParamsError::MaxMsizeOutOfRange {
                max_msize: params.max_msize,
                num_slots: params.num_slots,
            });
        }
        if params.oob_capacity > u16::MAX as usize {
            return Err(ParamsError::OobCapacity(params.oob_capacity));
        }

        let quantum = 1usize << params.quantum_shift;
        let region_size = 1usize << params.region_shift;
        let page = page_size();

        let tags_offset = align_up(
            core::mem::size_of::<RegionHeader>(),
            core::mem::align_of::<BlockTag>(),
        );
        let layout = |quanta: usize| {
            let oob_offset = align_up(
                tags_offset + quanta * core::mem::size_of::<BlockTag>(),
                core::mem::align_of::<OobEntry>(),
            );
            let meta_end = oob_offset + params.oob_capacity * core::mem::size_of::<OobEntry>();
            (oob_offset, align_up(meta_end, page.max(quantum)))
        };

        // Fewer quanta means less metadata, so walking down from the upper
        // bound converges on the first count whose metadata still fits.
        let mut num_quanta = region_size >> params.quantum_shift;
        let (oob_offset, data_offset) = loop {
            let (oob_offset, data_offset) = layout(num_quanta);
            if data_offset >= region_size {
                return Err(ParamsError::NoPayload(data_offset));
            }
            if data_offset + (num_quanta << params.quantum_shift) <= region_size {
                break (oob_offset, data_offset);
            }
            num_quanta = (region_size - data_offset) >> params.quantum_shift;
        };

        if num_quanta > MAX_TAG_MSIZE {
            return Err(ParamsError::TooManyQuanta(num_quanta));
        }
        if num_quanta <= params.max_msize {
            return Err(ParamsError::NoPayload(data_offset));
        }

        Ok(Geometry {
            params,
            quantum,
            region_size,
            tags_offset,
            oob_offset,
            data_offset,
            num_quanta,
        })
    }

    /// Bytes a region contributes to its magazine.
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.num_quanta << self.params.quantum_shift
    }

    #[inline]
    pub fn region_mask(&self) -> usize {
        !(self.region_size - 1)
    }

    /// Round a byte count up to quanta (minimum one).
    #[inline]
    pub fn msize_for(&self, bytes: usize) -> usize {
        bytes.div_ceil(self.quantum).max(1)
    }

    #[inline]
    pub fn bytes_for(&self, msize: usize) -> usize {
        msize << self.params.quantum_shift
    }

    #[inline]
    pub fn max_bytes(&self) -> usize {
        self.bytes_for(self.params.max_msize)
    }

    #[inline]
    pub fn slot_for(&self, msize: usize) -> usize {
        debug_assert!(msize > 0);
        (msize - 1).min(self.params.num_slots - 1)
    }

    #[inline]
    pub fn catch_all_slot(&self) -> usize {
        self.params.num_slots - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::init_page_size;

    #[test]
    fn tiny_geometry() {
        init_page_size();
        let g = Geometry::new(TINY).unwrap();
        assert_eq!(g.quantum, 16);
        assert_eq!(g.region_size, 256 * 1024);
        assert_eq!(g.data_offset % page_size(), 0);
        assert!(g.num_quanta > 12_000 && g.num_quanta < 16_384);
        assert!(g.oob_offset + TINY.oob_capacity * core::mem::size_of::<OobEntry>() <= g.data_offset);
        assert!(g.data_offset + g.payload_bytes() <= g.region_size);
    }

    #[test]
    fn small_geometry() {
        init_page_size();
        let g = Geometry::new(SMALL).unwrap();
        assert_eq!(g.quantum, 512);
        assert!(g.num_quanta > 16_000);
        assert!(g.num_quanta <= MAX_TAG_MSIZE);
    }

    #[test]
    fn msize_rounding() {
        init_page_size();
        let g = Geometry::new(TINY).unwrap();
        assert_eq!(g.msize_for(0), 1);
        assert_eq!(g.msize_for(1), 1);
        assert_eq!(g.msize_for(16), 1);
        assert_eq!(g.msize_for(17), 2);
        assert_eq!(g.bytes_for(3), 48);
        assert_eq!(g.max_bytes(), 1008);
    }

    #[test]
    fn slots_clamp_to_catch_all() {
        init_page_size();
        let g = Geometry::new(TINY).unwrap();
        assert_eq!(g.slot_for(1), 0);
        assert_eq!(g.slot_for(63), 62);
        assert_eq!(g.slot_for(64), 63);
        assert_eq!(g.slot_for(5000), 63);
    }

    #[test]
    fn rejects_bad_params() {
        init_page_size();
        let mut p = TINY;
        p.quantum_shift = 3;
        assert_eq!(Geometry::new(p), Err(ParamsError::QuantumTooSmall(3)));

        let mut p = TINY;
        p.region_shift = 16;
        assert_eq!(Geometry::new(p), Err(ParamsError::RegionTooSmall(16)));

        let mut p = TINY;
        p.max_msize = 64;
        assert!(matches!(
            Geometry::new(p),
            Err(ParamsError::MaxMsizeOutOfRange { .. })
        ));

        let mut p = TINY;
        p.region_shift = 20;
        assert!(matches!(Geometry::new(p), Err(ParamsError::TooManyQuanta(_))));
    }
}
