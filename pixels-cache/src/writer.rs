use crate::coord::{self, CompactLayout, CoordStore};
use crate::error::Result;
use crate::header::{self, RwFlag, CACHE_DATA_OFFSET};
use crate::mem::MappedRegion;
use crate::mq::MappedBusWriter;
use crate::physical::SourceReaderFactory;
use crate::radix::{CacheIdx, CacheKey, Radix};
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Bus record published before the writer flips the rw-flag to writing.
pub const MSG_UPDATE_BEGIN: u32 = 1;
/// Bus record published after a rebuild flipped the rw-flag back.
pub const MSG_UPDATE_COMPLETE: u32 = 2;

const DEFAULT_DRAIN_SPIN_BUDGET: usize = 10_000;

/// Outcome of one rebuild, surfaced to the orchestrator as a numeric code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    Ok,
    /// The columnlet list for this host was empty; the rebuild still ran
    /// and committed an empty generation.
    NoWorkToDo,
    /// The cache file filled up; the prefix that fit is committed.
    CapacityExceeded,
    /// Source I/O failed; the cache is left in writing state and the next
    /// rebuild must retry.
    Failed,
}

impl WriteStatus {
    #[inline]
    pub fn as_code(self) -> i32 {
        match self {
            WriteStatus::Ok | WriteStatus::NoWorkToDo => 0,
            WriteStatus::CapacityExceeded => 2,
            WriteStatus::Failed => -1,
        }
    }
}

/// The single cache writer of one host.
///
/// Owns the in-memory radix and both mapped files, and rebuilds the whole
/// cache for each new generation published by the coordination store. At
/// most one writer exists per host; the coordinator leases write authority,
/// the cache itself does not check for dueling writers.
pub struct CacheWriter {
    cache: MappedRegion,
    index: MappedRegion,
    radix: Radix,
    factory: Arc<dyn SourceReaderFactory>,
    coord: Arc<dyn CoordStore>,
    host: String,
    absolute_balancer: bool,
    bus: Option<MappedBusWriter>,
    drain_spin_budget: usize,
    // append cursor into the cache data region, used by write().
    write_cursor: u64,
}

pub struct CacheWriterBuilder {
    cache_location: String,
    cache_size: usize,
    index_location: String,
    index_size: usize,
    overwrite: bool,
    host: String,
    absolute_balancer: bool,
    drain_spin_budget: usize,
    factory: Option<Arc<dyn SourceReaderFactory>>,
    coord: Option<Arc<dyn CoordStore>>,
    bus: Option<MappedBusWriter>,
}

impl Default for CacheWriterBuilder {
    #[inline]
    fn default() -> Self {
        CacheWriterBuilder {
            cache_location: String::new(),
            cache_size: 0,
            index_location: String::new(),
            index_size: 0,
            overwrite: true,
            host: String::new(),
            absolute_balancer: false,
            drain_spin_budget: DEFAULT_DRAIN_SPIN_BUDGET,
            factory: None,
            coord: None,
            bus: None,
        }
    }
}

impl CacheWriterBuilder {
    #[inline]
    pub fn cache_location(mut self, location: impl Into<String>) -> Self {
        self.cache_location = location.into();
        self
    }

    #[inline]
    pub fn cache_size(mut self, size: usize) -> Self {
        self.cache_size = size;
        self
    }

    #[inline]
    pub fn index_location(mut self, location: impl Into<String>) -> Self {
        self.index_location = location.into();
        self
    }

    #[inline]
    pub fn index_size(mut self, size: usize) -> Self {
        self.index_size = size;
        self
    }

    /// With `overwrite = false` an existing pair of files with valid magic
    /// is reused and the radix is reconstructed from the index file.
    #[inline]
    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    #[inline]
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    #[inline]
    pub fn absolute_balancer(mut self, enabled: bool) -> Self {
        self.absolute_balancer = enabled;
        self
    }

    #[inline]
    pub fn drain_spin_budget(mut self, budget: usize) -> Self {
        self.drain_spin_budget = budget;
        self
    }

    #[inline]
    pub fn source_factory(mut self, factory: Arc<dyn SourceReaderFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    #[inline]
    pub fn coord_store(mut self, coord: Arc<dyn CoordStore>) -> Self {
        self.coord = Some(coord);
        self
    }

    /// Attach a bus writer so cohabiting processes are notified of rebuild
    /// boundaries.
    #[inline]
    pub fn bus(mut self, bus: MappedBusWriter) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn build(self) -> Result<CacheWriter> {
        use crate::error::Error;
        if self.cache_location.is_empty() || self.index_location.is_empty() {
            return Err(Error::InvalidArgument("cache and index locations are required"));
        }
        if self.cache_size <= CACHE_DATA_OFFSET || self.index_size <= header::INDEX_RADIX_OFFSET {
            return Err(Error::InvalidArgument("cache and index sizes are too small"));
        }
        let factory = self
            .factory
            .ok_or(Error::InvalidArgument("source reader factory is required"))?;
        let coord = self
            .coord
            .ok_or(Error::InvalidArgument("coordination store is required"))?;
        let index = MappedRegion::map(&self.index_location, self.index_size)?;
        let cache = MappedRegion::map(&self.cache_location, self.cache_size)?;
        let radix = if !self.overwrite
            && header::check_magic(&index)?
            && header::check_magic(&cache)?
        {
            Radix::reconstruct(&index)?
        } else {
            header::initialize(&index, &cache)?;
            Radix::new()
        };
        Ok(CacheWriter {
            cache,
            index,
            radix,
            factory,
            coord,
            host: self.host,
            absolute_balancer: self.absolute_balancer,
            bus: self.bus,
            drain_spin_budget: self.drain_spin_budget,
            write_cursor: 0,
        })
    }
}

impl CacheWriter {
    #[inline]
    pub fn builder() -> CacheWriterBuilder {
        CacheWriterBuilder::default()
    }

    /// Rebuild the whole cache for `version`.
    ///
    /// Consumes the file list this host was assigned by the coordination
    /// store; a missing key or an unreachable store means there is nothing
    /// to do for this generation. The completion status is published back
    /// to the store.
    pub fn update_all(&mut self, version: u32, layout: &CompactLayout) -> WriteStatus {
        let key = coord::file_list_key(version, &self.host);
        let files = match self.coord.get(&key) {
            Ok(Some(value)) => coord::parse_file_list(&value),
            Ok(None) => {
                debug!(key = %key, "found no allocated files, no updates are needed");
                return WriteStatus::Ok;
            }
            Err(e) => {
                warn!(error = %e, "coordination store unavailable, skipping rebuild");
                return WriteStatus::Ok;
            }
        };
        let status = match self.internal_update(version, layout, &files) {
            Ok(status) => status,
            Err(e) => {
                error!(error = %e, version, "cache rebuild failed");
                WriteStatus::Failed
            }
        };
        self.publish_status(version, status);
        status
    }

    fn internal_update(
        &mut self,
        version: u32,
        layout: &CompactLayout,
        files: &[String],
    ) -> Result<WriteStatus> {
        let columnlets = layout.cached_columnlets();
        self.notify_bus(MSG_UPDATE_BEGIN, version);
        debug!(version, "set index rw-flag to writing");
        header::set_rw_flag(&self.index, RwFlag::Writing)?;
        self.drain_readers();
        self.radix.remove_all();
        self.write_cursor = 0;
        let mut status = if files.is_empty() || columnlets.is_empty() {
            WriteStatus::NoWorkToDo
        } else {
            WriteStatus::Ok
        };
        let data_capacity = (self.cache.size() - CACHE_DATA_OFFSET) as u64;
        'files: for file in files {
            let path = if self.absolute_balancer {
                self.factory.ensure_local(file)?
            } else {
                file.clone()
            };
            let reader = self.factory.open(&path)?;
            let block_id = reader.block_id();
            for &(row_group_id, column_id) in columnlets {
                let footer = reader.row_group_footer(row_group_id)?;
                let chunk = footer.chunk(column_id)?;
                if self.write_cursor + chunk.length as u64 > data_capacity {
                    debug!(
                        cursor = self.write_cursor,
                        "cache writes exceeded the cache size, stopping"
                    );
                    status = WriteStatus::CapacityExceeded;
                    break 'files;
                }
                let columnlet = reader.read(chunk.offset, chunk.length as usize)?;
                self.cache
                    .put_bytes(CACHE_DATA_OFFSET + self.write_cursor as usize, &columnlet)?;
                self.radix.put(
                    CacheKey::new(block_id, row_group_id, column_id),
                    CacheIdx::new(self.write_cursor, chunk.length),
                );
                debug!(
                    file = %path,
                    row_group_id,
                    column_id,
                    offset = self.write_cursor,
                    length = chunk.length,
                    "cached columnlet"
                );
                self.write_cursor += chunk.length as u64;
            }
        }
        debug!(end = self.write_cursor, "cache data region write finished");
        let index_end = self.radix.serialize(&self.index)?;
        debug!(end = index_end, "cache index write finished");
        header::set_version(&self.index, version)?;
        header::set_rw_flag(&self.index, RwFlag::Readable)?;
        debug!(version, "set index rw-flag to readable");
        self.notify_bus(MSG_UPDATE_COMPLETE, version);
        Ok(status)
    }

    /// Spin until no reader is inside a lookup, bounded by the spin budget.
    /// Past the budget the rebuild proceeds anyway; a stale reader detects
    /// the version change when it finishes.
    fn drain_readers(&self) {
        for _ in 0..self.drain_spin_budget {
            match header::reader_count(&self.index) {
                Ok(0) | Err(_) => return,
                Ok(_) => std::thread::yield_now(),
            }
        }
        warn!("reader drain budget exhausted, proceeding with rebuild");
    }

    #[inline]
    fn notify_bus(&self, msg_type: u32, version: u32) {
        if let Some(bus) = &self.bus {
            if let Err(e) = bus.write(msg_type, &version.to_be_bytes()) {
                warn!(error = %e, msg_type, "failed to publish cache update notification");
            }
        }
    }

    #[inline]
    fn publish_status(&self, version: u32, status: WriteStatus) {
        let key = coord::status_key(version, &self.host);
        if let Err(e) = self.coord.put(&key, &status.as_code().to_string()) {
            warn!(error = %e, key = %key, "failed to publish cache status");
        }
    }

    /// Append one columnlet at the current write cursor without touching
    /// the header words. Unit-test and benchmark entry point; `update_all`
    /// is the production path.
    pub fn write(&mut self, key: CacheKey, value: &[u8]) -> Result<()> {
        self.cache
            .put_bytes(CACHE_DATA_OFFSET + self.write_cursor as usize, value)?;
        self.radix
            .put(key, CacheIdx::new(self.write_cursor, value.len() as u32));
        self.write_cursor += value.len() as u64;
        Ok(())
    }

    /// Serialize the radix into the index file. Unit-test companion of
    /// [`CacheWriter::write`].
    #[inline]
    pub fn flush(&mut self) -> Result<()> {
        self.radix.serialize(&self.index)?;
        Ok(())
    }

    #[inline]
    pub fn radix(&self) -> &Radix {
        &self.radix
    }
}
