//! Header words of the two mapped cache files.
//!
//! Index file: `magic [0..6) | rw-flag u16 [6..8) | reader-count u32 [8..12) |
//! version u32 [12..16) | serialized radix [16..)`.
//! Cache file: `magic [0..6) | columnlet bytes [6..)`.
//!
//! The rw-flag, reader-count and version are process-wide state shared
//! through the mapping. The flag and version use release-store/acquire-load
//! pairs; the reader count is a plain atomic counter.

use crate::error::Result;
use crate::mem::MappedRegion;

pub const MAGIC: &[u8; 6] = b"PIXELS";

pub const INDEX_RW_FLAG_OFFSET: usize = 6;
pub const INDEX_READER_COUNT_OFFSET: usize = 8;
pub const INDEX_VERSION_OFFSET: usize = 12;
pub const INDEX_RADIX_OFFSET: usize = 16;

pub const CACHE_DATA_OFFSET: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum RwFlag {
    Readable = 0,
    Writing = 1,
}

impl From<u16> for RwFlag {
    #[inline]
    fn from(value: u16) -> Self {
        if value == 0 {
            RwFlag::Readable
        } else {
            RwFlag::Writing
        }
    }
}

#[inline]
pub fn write_magic(region: &MappedRegion) -> Result<()> {
    region.put_bytes(0, MAGIC)
}

#[inline]
pub fn check_magic(region: &MappedRegion) -> Result<bool> {
    Ok(region.get_bytes(0, MAGIC.len())? == MAGIC)
}

/// Stamp both magics and zero the protocol words of a fresh cache.
#[inline]
pub fn initialize(index: &MappedRegion, cache: &MappedRegion) -> Result<()> {
    write_magic(index)?;
    write_magic(cache)?;
    index.put_u16_volatile(INDEX_RW_FLAG_OFFSET, RwFlag::Readable as u16)?;
    index.put_u32_volatile(INDEX_READER_COUNT_OFFSET, 0)?;
    index.put_u32_volatile(INDEX_VERSION_OFFSET, 0)?;
    Ok(())
}

#[inline]
pub fn rw_flag(index: &MappedRegion) -> Result<RwFlag> {
    Ok(RwFlag::from(index.get_u16_volatile(INDEX_RW_FLAG_OFFSET)?))
}

/// Release-store so all prior writes are visible before the flag flips.
#[inline]
pub fn set_rw_flag(index: &MappedRegion, flag: RwFlag) -> Result<()> {
    index.put_u16_volatile(INDEX_RW_FLAG_OFFSET, flag as u16)
}

#[inline]
pub fn version(index: &MappedRegion) -> Result<u32> {
    index.get_u32_volatile(INDEX_VERSION_OFFSET)
}

#[inline]
pub fn set_version(index: &MappedRegion, version: u32) -> Result<()> {
    index.put_u32_volatile(INDEX_VERSION_OFFSET, version)
}

#[inline]
pub fn reader_count(index: &MappedRegion) -> Result<u32> {
    index.get_u32_volatile(INDEX_READER_COUNT_OFFSET)
}

/// Returns the count before the increment.
#[inline]
pub fn inc_reader_count(index: &MappedRegion) -> Result<u32> {
    index.fetch_add_u32(INDEX_READER_COUNT_OFFSET, 1)
}

/// Returns the count before the decrement.
#[inline]
pub fn dec_reader_count(index: &MappedRegion) -> Result<u32> {
    index.fetch_sub_u32(INDEX_READER_COUNT_OFFSET, 1)
}
