//! Heap enumeration through a memory reader.
//!
//! Debuggers and crash reporters inspect a heap they cannot call into. They
//! supply a `RemoteReader` that copies bytes out of the target, and
//! `enumerate_region` rebuilds the block list from the region header and tag
//! array alone.

use crate::region::{RegionHeader, HEADER_DATA_OFFSET, HEADER_QUANTA_OFFSET};
use crate::size_class::{Geometry, ParamsError, SizeClassParams};
use crate::tag::BlockTag;
use thiserror::Error;

/// Reads `len` bytes at `address` in the target process.
pub trait RemoteReader {
    fn read(&self, address: usize, len: usize) -> Option<Vec<u8>>;
}

/// Reader for the current process.
pub struct LocalReader {
    _private: (),
}

impl LocalReader {
    /// # Safety
    /// Every address later passed to `read` must be mapped and readable for
    /// the requested length.
    pub unsafe fn new() -> Self {
        LocalReader { _private: () }
    }
}

impl RemoteReader for LocalReader {
    fn read(&self, address: usize, len: usize) -> Option<Vec<u8>> {
        if address == 0 {
            return None;
        }
        let bytes = unsafe { core::slice::from_raw_parts(address as *const u8, len) };
        Some(bytes.to_vec())
    }
}

/// One block as seen by an enumerator.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockRecord {
    pub address: usize,
    pub size: usize,
    pub in_use: bool,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntrospectError {
    #[error("could not read {len} bytes at {address:#x}")]
    ReadFailed { address: usize, len: usize },
    #[error("{0:#x} does not hold a region of this size class")]
    NotARegion(usize),
    #[error("corrupt block tag at quantum {index} of region {base:#x}")]
    CorruptTag { base: usize, index: usize },
    #[error(transparent)]
    Params(#[from] ParamsError),
}

fn read(reader: &dyn RemoteReader, address: usize, len: usize) -> Result<Vec<u8>, IntrospectError> {
    match reader.read(address, len) {
        Some(bytes) if bytes.len() >= len => Ok(bytes),
        _ => Err(IntrospectError::ReadFailed { address, len }),
    }
}

/// Report every block of the region at `region_base` to `visitor`. Unclaimed
/// space is skipped. Returns the number of blocks reported.
pub fn enumerate_region(
    reader: &dyn RemoteReader,
    region_base: usize,
    params: SizeClassParams,
    mut visitor: impl FnMut(BlockRecord),
) -> Result<usize, IntrospectError> {
    let geo = Geometry::new(params)?;
    let header = read(reader, region_base, core::mem::size_of::<RegionHeader>())?;

    const WORD: usize = core::mem::size_of::<usize>();
    let mut word = [0u8; WORD];
    word.copy_from_slice(&header[HEADER_DATA_OFFSET..HEADER_DATA_OFFSET + WORD]);
    let data = usize::from_ne_bytes(word);
    let mut quanta = [0u8; 4];
    quanta.copy_from_slice(&header[HEADER_QUANTA_OFFSET..HEADER_QUANTA_OFFSET + 4]);
    let num_quanta = u32::from_ne_bytes(quanta) as usize;
    if data != region_base + geo.data_offset || num_quanta != geo.num_quanta {
        return Err(IntrospectError::NotARegion(region_base));
    }

    let raw = read(reader, region_base + geo.tags_offset, num_quanta * 2)?;
    let tag_at = |i: usize| BlockTag::from_bits(u16::from_ne_bytes([raw[2 * i], raw[2 * i + 1]]));

    let mut reported = 0;
    let mut index = 0;
    while index < num_quanta {
        let tag = tag_at(index);
        if tag.is_middle() {
            index += 1;
            continue;
        }
        let msize = tag.msize();
        if tag.is_tail() || msize == 0 || index + msize > num_quanta {
            return Err(IntrospectError::CorruptTag {
                base: region_base,
                index,
            });
        }
        visitor(BlockRecord {
            address: data + geo.bytes_for(index),
            size: geo.bytes_for(msize),
            in_use: !tag.is_free(),
        });
        reported += 1;
        index += msize;
    }
    Ok(reported)
}
