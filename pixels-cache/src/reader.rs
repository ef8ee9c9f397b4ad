use crate::error::{Error, Result};
use crate::header::{self, RwFlag, CACHE_DATA_OFFSET, INDEX_RADIX_OFFSET};
use crate::mem::MappedRegion;
use crate::radix::{
    decode_child, CacheIdx, CacheKey, NodeHeader, CACHE_IDX_LEN, NODE_CHILD_LEN, NODE_HEADER_LEN,
};
use scopeguard::defer;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

/// A lookup handle over the shared cache of this host.
///
/// Many readers run concurrently with each other and with the single
/// writer; the only shared mutation on this path is the reader-count word.
/// A reader never surfaces an error: anything that goes wrong during a
/// lookup is a miss and the caller falls through to the distributed
/// filesystem.
///
/// Lookups parse the serialized radix directly out of the mapped index
/// file; nothing is copied onto the heap unless [`CacheReader::get_direct`]
/// is used.
pub struct CacheReader {
    index: MappedRegion,
    cache: MappedRegion,
    enabled: bool,
    corrupt_logged: AtomicBool,
}

#[derive(Default)]
pub struct CacheReaderBuilder {
    cache_location: String,
    cache_size: usize,
    index_location: String,
    index_size: usize,
    disabled: bool,
}

impl CacheReaderBuilder {
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

    /// A disabled reader misses on every lookup without touching the
    /// mapped files' protocol words.
    #[inline]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.disabled = !enabled;
        self
    }

    pub fn build(self) -> Result<CacheReader> {
        if self.cache_location.is_empty() || self.index_location.is_empty() {
            return Err(Error::InvalidArgument("cache and index locations are required"));
        }
        let index = MappedRegion::map(&self.index_location, self.index_size)?;
        let cache = MappedRegion::map(&self.cache_location, self.cache_size)?;
        Ok(CacheReader {
            index,
            cache,
            enabled: !self.disabled,
            corrupt_logged: AtomicBool::new(false),
        })
    }
}

impl CacheReader {
    #[inline]
    pub fn builder() -> CacheReaderBuilder {
        CacheReaderBuilder::default()
    }

    /// Look up the locator of `key` in the current generation.
    ///
    /// Returns `None` when the key is not cached, when the writer is
    /// rebuilding, when a complete rebuild raced this lookup, or when the
    /// serialized index cannot be parsed.
    #[inline]
    pub fn search(&self, key: CacheKey) -> Option<CacheIdx> {
        let (idx, _) = self.lookup(key, false)?;
        Some(idx)
    }

    /// Zero-copy lookup: a slice of the mapped cache file.
    ///
    /// The slice is valid only while this reader is alive; it must not be
    /// retained across cache close or across a rebuild, which reuses the
    /// underlying byte range for the next generation.
    pub fn get(&self, key: CacheKey) -> Option<&[u8]> {
        let idx = self.search(key)?;
        match self
            .cache
            .get_bytes(CACHE_DATA_OFFSET + idx.offset as usize, idx.length as usize)
        {
            Ok(slice) => Some(slice),
            Err(e) => {
                self.log_corrupt(e);
                None
            }
        }
    }

    /// Copying lookup for the `cache.read.direct` path. The bytes are
    /// copied inside the reader-counted section, so the copy always belongs
    /// to the generation whose locator was found.
    #[inline]
    pub fn get_direct(&self, key: CacheKey) -> Option<Vec<u8>> {
        let (_, bytes) = self.lookup(key, true)?;
        bytes
    }

    /// Protocol core shared by the locator and copying paths: flag check,
    /// counted critical section with a guarded decrement on every exit,
    /// version snapshot before the walk and re-check after it.
    fn lookup(&self, key: CacheKey, copy: bool) -> Option<(CacheIdx, Option<Vec<u8>>)> {
        if !self.enabled {
            return None;
        }
        if header::rw_flag(&self.index).ok()? != RwFlag::Readable {
            return None;
        }
        header::inc_reader_count(&self.index).ok()?;
        defer! {
            let _ = header::dec_reader_count(&self.index);
        }
        // re-read after the increment: the writer observes our increment
        // only if it happens before its next read of the counter, so a
        // writing flag seen here means we must back out.
        if header::rw_flag(&self.index).ok()? != RwFlag::Readable {
            return None;
        }
        let v0 = header::version(&self.index).ok()?;
        let found = match self.walk(&key.to_bytes()) {
            Ok(found) => found?,
            Err(e) => {
                self.log_corrupt(e);
                return None;
            }
        };
        let bytes = if copy {
            match self.cache.get_bytes(
                CACHE_DATA_OFFSET + found.offset as usize,
                found.length as usize,
            ) {
                Ok(slice) => Some(slice.to_vec()),
                Err(e) => {
                    self.log_corrupt(e);
                    return None;
                }
            }
        } else {
            None
        };
        // a different version means a complete rebuild raced us and the
        // locator may describe the new generation's bytes.
        if header::version(&self.index).ok()? != v0 {
            return None;
        }
        Some((found, bytes))
    }

    /// Walk the serialized radix in place. At each node: match the incoming
    /// edge against the next slice of the key, then linearly scan the child
    /// table for the next key byte's leader.
    fn walk(&self, key: &[u8]) -> Result<Option<CacheIdx>> {
        let mut offset = INDEX_RADIX_OFFSET;
        let mut pos = 0usize;
        loop {
            let raw = self
                .index
                .get_bytes(offset, NODE_HEADER_LEN)
                .map_err(|_| Error::CorruptIndex("node header out of range"))?;
            let node = NodeHeader::decode(u32::from_be_bytes(raw.try_into().unwrap()));
            if offset + node.node_len() > self.index.size() {
                return Err(Error::CorruptIndex("node exceeds index region"));
            }
            let edge_offset = offset + NODE_HEADER_LEN + node.child_count * NODE_CHILD_LEN;
            if node.edge_len > 0 {
                if key.len() - pos < node.edge_len {
                    return Ok(None);
                }
                let edge = self.index.get_bytes(edge_offset, node.edge_len)?;
                if edge != &key[pos..pos + node.edge_len] {
                    return Ok(None);
                }
                pos += node.edge_len;
            }
            if pos == key.len() {
                if !node.is_key {
                    return Ok(None);
                }
                let raw = self.index.get_bytes(edge_offset + node.edge_len, CACHE_IDX_LEN)?;
                return Ok(Some(CacheIdx::from_bytes(raw.try_into().unwrap())));
            }
            let mut entry_offset = offset + NODE_HEADER_LEN;
            let mut next = None;
            for _ in 0..node.child_count {
                let raw = self.index.get_bytes(entry_offset, NODE_CHILD_LEN)?;
                let (leader, child) = decode_child(u64::from_be_bytes(raw.try_into().unwrap()));
                if leader == key[pos] {
                    next = Some(child as usize);
                    break;
                }
                entry_offset += NODE_CHILD_LEN;
            }
            let Some(child) = next else {
                return Ok(None);
            };
            if child <= offset {
                return Err(Error::CorruptIndex("child offset not strictly forward"));
            }
            offset = child;
        }
    }

    #[cold]
    fn log_corrupt(&self, e: Error) {
        if !self.corrupt_logged.swap(true, Ordering::Relaxed) {
            warn!(error = %e, "cache index unreadable, lookups degrade to misses");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coord::{self, CompactLayout, CoordStore, MemCoordStore};
    use crate::physical::mock::MockFactory;
    use crate::writer::{CacheWriter, WriteStatus};
    use crossbeam_utils::sync::WaitGroup;
    use std::sync::Arc;
    use tempfile::TempDir;

    const CACHE_SIZE: usize = 64 * 1024;
    const INDEX_SIZE: usize = 64 * 1024;

    struct Fixture {
        dir: TempDir,
        coord: Arc<MemCoordStore>,
        factory: Arc<MockFactory>,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                dir: TempDir::new().unwrap(),
                coord: Arc::new(MemCoordStore::new()),
                factory: Arc::new(MockFactory::new()),
            }
        }

        fn path(&self, name: &str) -> String {
            self.dir.path().join(name).to_str().unwrap().to_string()
        }

        fn writer(&self) -> CacheWriter {
            CacheWriter::builder()
                .cache_location(self.path("pixels.cache"))
                .cache_size(CACHE_SIZE)
                .index_location(self.path("pixels.index"))
                .index_size(INDEX_SIZE)
                .host("test-host")
                .source_factory(self.factory.clone())
                .coord_store(self.coord.clone())
                .build()
                .unwrap()
        }

        fn reader(&self) -> CacheReader {
            CacheReader::builder()
                .cache_location(self.path("pixels.cache"))
                .cache_size(CACHE_SIZE)
                .index_location(self.path("pixels.index"))
                .index_size(INDEX_SIZE)
                .build()
                .unwrap()
        }

        fn assign_files(&self, version: u32, files: &str) {
            self.coord
                .put(&coord::file_list_key(version, "test-host"), files)
                .unwrap();
        }
    }

    #[test]
    fn test_disabled_reader_always_misses() {
        let fx = Fixture::new();
        let mut writer = fx.writer();
        writer.write(CacheKey::new(1, 0, 0), b"payload").unwrap();
        writer.flush().unwrap();
        let reader = CacheReader::builder()
            .cache_location(fx.path("pixels.cache"))
            .cache_size(CACHE_SIZE)
            .index_location(fx.path("pixels.index"))
            .index_size(INDEX_SIZE)
            .enabled(false)
            .build()
            .unwrap();
        assert_eq!(reader.search(CacheKey::new(1, 0, 0)), None);
    }

    #[test]
    fn test_miss_while_writing() {
        let fx = Fixture::new();
        let mut writer = fx.writer();
        writer.write(CacheKey::new(1, 0, 0), b"payload").unwrap();
        writer.flush().unwrap();
        let reader = fx.reader();
        assert!(reader.search(CacheKey::new(1, 0, 0)).is_some());
        // simulate a writer mid-rebuild in another process.
        let index = MappedRegion::map(fx.path("pixels.index"), INDEX_SIZE).unwrap();
        header::set_rw_flag(&index, RwFlag::Writing).unwrap();
        assert_eq!(reader.search(CacheKey::new(1, 0, 0)), None);
        assert_eq!(header::reader_count(&index).unwrap(), 0);
        header::set_rw_flag(&index, RwFlag::Readable).unwrap();
        assert!(reader.search(CacheKey::new(1, 0, 0)).is_some());
    }

    #[test]
    fn test_reader_count_balanced() {
        let fx = Fixture::new();
        let mut writer = fx.writer();
        writer.write(CacheKey::new(1, 0, 0), b"payload").unwrap();
        writer.flush().unwrap();
        let reader = fx.reader();
        // hit, miss and corrupt outcomes all leave the count at zero.
        assert!(reader.search(CacheKey::new(1, 0, 0)).is_some());
        assert!(reader.search(CacheKey::new(2, 0, 0)).is_none());
        let index = MappedRegion::map(fx.path("pixels.index"), INDEX_SIZE).unwrap();
        assert_eq!(header::reader_count(&index).unwrap(), 0);
    }

    #[test]
    fn test_corrupt_index_degrades_to_miss() {
        let fx = Fixture::new();
        let mut writer = fx.writer();
        writer.write(CacheKey::new(1, 0, 0), b"payload").unwrap();
        writer.flush().unwrap();
        let index = MappedRegion::map(fx.path("pixels.index"), INDEX_SIZE).unwrap();
        // impossible header: edge far beyond the region.
        let bogus = crate::radix::NodeHeader {
            is_key: false,
            edge_len: INDEX_SIZE,
            child_count: 0,
        };
        index
            .put_bytes(INDEX_RADIX_OFFSET, &bogus.encode().to_be_bytes())
            .unwrap();
        let reader = fx.reader();
        assert_eq!(reader.search(CacheKey::new(1, 0, 0)), None);
        assert_eq!(header::reader_count(&index).unwrap(), 0);
    }

    /// Install generation 1 with key K at 512 bytes of 0xAA, then rebuild
    /// to generation 2 with K at 256 bytes of 0xBB while readers hammer
    /// the key. Every observation must be the old locator with old bytes,
    /// the new locator with new bytes, or a miss.
    #[test]
    fn test_concurrent_rebuild_never_mixes_generations() {
        let fx = Fixture::new();
        fx.factory
            .add_file("/pixels/v1.pxl", 1, vec![vec![vec![0xAAu8; 512]]]);
        fx.factory
            .add_file("/pixels/v2.pxl", 1, vec![vec![vec![0xBBu8; 256]]]);
        fx.assign_files(1, "/pixels/v1.pxl");
        fx.assign_files(2, "/pixels/v2.pxl");
        let layout = CompactLayout::new(1, vec![(0, 0)]);
        let mut writer = fx.writer();
        assert_eq!(writer.update_all(1, &layout), WriteStatus::Ok);

        let key = CacheKey::new(1, 0, 0);
        let wg = WaitGroup::new();
        let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let reader = fx.reader();
            let wg = wg.clone();
            let stop = stop.clone();
            handles.push(std::thread::spawn(move || {
                drop(wg);
                let mut observations = [0usize; 2];
                while !stop.load(Ordering::Acquire) {
                    match reader.get_direct(key) {
                        Some(bytes) if bytes.len() == 512 => {
                            assert!(bytes.iter().all(|&b| b == 0xAA));
                            observations[0] += 1;
                        }
                        Some(bytes) if bytes.len() == 256 => {
                            assert!(bytes.iter().all(|&b| b == 0xBB));
                            observations[1] += 1;
                        }
                        Some(bytes) => panic!("locator of unknown generation: {}", bytes.len()),
                        None => {}
                    }
                }
                observations
            }));
        }
        // let all readers spin up before rebuilding.
        wg.wait();
        assert_eq!(writer.update_all(2, &layout), WriteStatus::Ok);
        stop.store(true, Ordering::Release);
        let mut new_gen = 0;
        for handle in handles {
            let observations = handle.join().unwrap();
            new_gen += observations[1];
        }
        // after the rebuild completes, readers must see the new entry.
        assert!(new_gen > 0 || fx.reader().get(key).map(|s| s.len()) == Some(256));
        let index = MappedRegion::map(fx.path("pixels.index"), INDEX_SIZE).unwrap();
        assert_eq!(header::reader_count(&index).unwrap(), 0);
        assert_eq!(header::version(&index).unwrap(), 2);
    }
}
