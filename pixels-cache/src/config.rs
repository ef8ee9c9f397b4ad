use crate::reader::{CacheReader, CacheReaderBuilder};
use crate::writer::{CacheWriter, CacheWriterBuilder};
use byte_unit::Byte;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CACHE_LOCATION: &str = "/dev/shm/pixels.cache";
const DEFAULT_INDEX_LOCATION: &str = "/dev/shm/pixels.index";
const DEFAULT_CACHE_SIZE: Byte = Byte::from_u64(1024 * 1024 * 1024); // by default 1GB
const DEFAULT_INDEX_SIZE: Byte = Byte::from_u64(64 * 1024 * 1024); // by default 64MB
const DEFAULT_LEASE_TTL_SECS: u64 = 10;

/// Host-level cache configuration.
///
/// The cache and index files are fixed-size and typically live on tmpfs;
/// both sizes are set once and keep their value for the lifetime of the
/// mapped files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    cache_location: String,
    cache_size: Byte,
    index_location: String,
    index_size: Byte,
    cache_enabled: bool,
    read_direct: bool,
    absolute_balancer_enabled: bool,
    lease_ttl_secs: u64,
}

impl Default for CacheConfig {
    #[inline]
    fn default() -> Self {
        CacheConfig {
            cache_location: String::from(DEFAULT_CACHE_LOCATION),
            cache_size: DEFAULT_CACHE_SIZE,
            index_location: String::from(DEFAULT_INDEX_LOCATION),
            index_size: DEFAULT_INDEX_SIZE,
            cache_enabled: true,
            read_direct: false,
            absolute_balancer_enabled: false,
            lease_ttl_secs: DEFAULT_LEASE_TTL_SECS,
        }
    }
}

impl CacheConfig {
    #[inline]
    pub fn cache_location(mut self, location: impl Into<String>) -> Self {
        self.cache_location = location.into();
        self
    }

    #[inline]
    pub fn cache_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.cache_size = Byte::from(size);
        self
    }

    #[inline]
    pub fn index_location(mut self, location: impl Into<String>) -> Self {
        self.index_location = location.into();
        self
    }

    #[inline]
    pub fn index_size<T>(mut self, size: T) -> Self
    where
        Byte: From<T>,
    {
        self.index_size = Byte::from(size);
        self
    }

    #[inline]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.cache_enabled = enabled;
        self
    }

    #[inline]
    pub fn read_direct(mut self, read_direct: bool) -> Self {
        self.read_direct = read_direct;
        self
    }

    #[inline]
    pub fn absolute_balancer(mut self, enabled: bool) -> Self {
        self.absolute_balancer_enabled = enabled;
        self
    }

    #[inline]
    pub fn lease_ttl_secs(mut self, secs: u64) -> Self {
        self.lease_ttl_secs = secs;
        self
    }

    /// Whether readers should copy instead of returning mapped slices.
    #[inline]
    pub fn is_read_direct(&self) -> bool {
        self.read_direct
    }

    /// Time-to-live of the write-authority lease enforced by the external
    /// coordination store.
    #[inline]
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    /// A writer builder pre-populated from this config. The source factory
    /// and coordination store still have to be attached.
    pub fn writer_builder(&self) -> CacheWriterBuilder {
        CacheWriter::builder()
            .cache_location(self.cache_location.as_str())
            .cache_size(self.cache_size.as_u64() as usize)
            .index_location(self.index_location.as_str())
            .index_size(self.index_size.as_u64() as usize)
            .absolute_balancer(self.absolute_balancer_enabled)
    }

    /// A reader builder pre-populated from this config.
    pub fn reader_builder(&self) -> CacheReaderBuilder {
        CacheReader::builder()
            .cache_location(self.cache_location.as_str())
            .cache_size(self.cache_size.as_u64() as usize)
            .index_location(self.index_location.as_str())
            .index_size(self.index_size.as_u64() as usize)
            .enabled(self.cache_enabled)
    }
}
