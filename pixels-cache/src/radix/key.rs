/// Serialized byte length of a cache key.
pub const CACHE_KEY_LEN: usize = 12;

/// Composite key of one cached columnlet: the block id assigned by the
/// distributed filesystem, the row group within the file, and the column
/// within the row group.
///
/// Keys are serialized big-endian so that the radix groups columnlets of
/// the same block under a shared edge prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CacheKey {
    pub block_id: u64,
    pub row_group_id: u16,
    pub column_id: u16,
}

impl CacheKey {
    #[inline]
    pub fn new(block_id: u64, row_group_id: u16, column_id: u16) -> Self {
        CacheKey {
            block_id,
            row_group_id,
            column_id,
        }
    }

    #[inline]
    pub fn to_bytes(self) -> [u8; CACHE_KEY_LEN] {
        let mut buf = [0u8; CACHE_KEY_LEN];
        buf[0..8].copy_from_slice(&self.block_id.to_be_bytes());
        buf[8..10].copy_from_slice(&self.row_group_id.to_be_bytes());
        buf[10..12].copy_from_slice(&self.column_id.to_be_bytes());
        buf
    }

    #[inline]
    pub fn from_bytes(buf: &[u8; CACHE_KEY_LEN]) -> Self {
        CacheKey {
            block_id: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            row_group_id: u16::from_be_bytes(buf[8..10].try_into().unwrap()),
            column_id: u16::from_be_bytes(buf[10..12].try_into().unwrap()),
        }
    }
}
