//! Seam to the columnar file reader that decodes source files.
//!
//! The cache never interprets columnlet bytes; it only needs the block id
//! of an open file, the chunk extents recorded in a row-group footer, and
//! raw range reads. The real decoder lives outside this crate.

use crate::error::{Error, Result};

/// Extent of one column chunk inside a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkExtent {
    pub offset: u64,
    pub length: u32,
}

/// Per-column chunk extents of one row group.
#[derive(Debug, Clone, Default)]
pub struct RowGroupFooter {
    chunks: Vec<ChunkExtent>,
}

impl RowGroupFooter {
    #[inline]
    pub fn new(chunks: Vec<ChunkExtent>) -> Self {
        RowGroupFooter { chunks }
    }

    #[inline]
    pub fn chunk(&self, column_id: u16) -> Result<ChunkExtent> {
        self.chunks
            .get(column_id as usize)
            .copied()
            .ok_or(Error::SourceIOFailure(format!(
                "no chunk for column {column_id}"
            )))
    }
}

/// One open source file.
pub trait SourceReader {
    /// Block id assigned by the distributed filesystem to the file's first
    /// block; used to detect file replacement.
    fn block_id(&self) -> u64;

    fn row_group_footer(&self, row_group_id: u16) -> Result<RowGroupFooter>;

    fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>>;
}

/// Opens source files for the cache writer.
pub trait SourceReaderFactory: Send + Sync {
    fn open(&self, path: &str) -> Result<Box<dyn SourceReader + '_>>;

    /// Replace `path` with a host-local replica before reading.
    ///
    /// Experimental locality step behind `absolute_balancer_enabled`; the
    /// default keeps the path unchanged.
    #[inline]
    fn ensure_local(&self, path: &str) -> Result<String> {
        Ok(path.to_string())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    pub(crate) struct MockFile {
        block_id: u64,
        data: Vec<u8>,
        extents: Vec<Vec<ChunkExtent>>,
    }

    impl MockFile {
        fn new(block_id: u64, row_groups: Vec<Vec<Vec<u8>>>) -> MockFile {
            let mut data = Vec::new();
            let mut extents = Vec::with_capacity(row_groups.len());
            for columns in row_groups {
                let mut row_group = Vec::with_capacity(columns.len());
                for chunk in columns {
                    row_group.push(ChunkExtent {
                        offset: data.len() as u64,
                        length: chunk.len() as u32,
                    });
                    data.extend_from_slice(&chunk);
                }
                extents.push(row_group);
            }
            MockFile {
                block_id,
                data,
                extents,
            }
        }
    }

    /// In-memory stand-in for the external columnar file reader.
    #[derive(Default)]
    pub(crate) struct MockFactory {
        files: Mutex<HashMap<String, Arc<MockFile>>>,
        fail_reads: AtomicBool,
    }

    impl MockFactory {
        pub fn new() -> MockFactory {
            MockFactory::default()
        }

        /// Register a file as `row_groups[row_group][column] = chunk bytes`.
        pub fn add_file(&self, path: &str, block_id: u64, row_groups: Vec<Vec<Vec<u8>>>) {
            self.files
                .lock()
                .insert(path.to_string(), Arc::new(MockFile::new(block_id, row_groups)));
        }

        pub fn fail_reads(&self, fail: bool) {
            self.fail_reads.store(fail, Ordering::Release);
        }
    }

    struct MockReader {
        file: Arc<MockFile>,
        fail: bool,
    }

    impl SourceReader for MockReader {
        fn block_id(&self) -> u64 {
            self.file.block_id
        }

        fn row_group_footer(&self, row_group_id: u16) -> Result<RowGroupFooter> {
            self.file
                .extents
                .get(row_group_id as usize)
                .map(|chunks| RowGroupFooter::new(chunks.clone()))
                .ok_or(Error::SourceIOFailure(format!(
                    "no row group {row_group_id}"
                )))
        }

        fn read(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
            if self.fail {
                return Err(Error::SourceIOFailure("injected read failure".to_string()));
            }
            let start = offset as usize;
            let end = start
                .checked_add(length)
                .filter(|&end| end <= self.file.data.len())
                .ok_or(Error::SourceIOFailure("read past end of file".to_string()))?;
            Ok(self.file.data[start..end].to_vec())
        }
    }

    impl SourceReaderFactory for MockFactory {
        fn open(&self, path: &str) -> Result<Box<dyn SourceReader + '_>> {
            let file = self
                .files
                .lock()
                .get(path)
                .cloned()
                .ok_or(Error::SourceIOFailure(format!("no such file {path}")))?;
            Ok(Box::new(MockReader {
                file,
                fail: self.fail_reads.load(Ordering::Acquire),
            }))
        }
    }
}
