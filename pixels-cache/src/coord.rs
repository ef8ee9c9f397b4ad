//! Seam to the cluster coordination store that tells each host what to
//! cache, plus the key grammar shared with it.
//!
//! The store assigns `cache-location/{version}/{host}` a semicolon-joined
//! list of source file paths, and the layout carries the ordered
//! `{row_group}:{column}` columnlet list with the `cache_border` cutoff.
//! The writer publishes its completion status under
//! `cache-status/{version}/{host}`.

use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::HashMap;

pub trait CoordStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;

    fn put(&self, key: &str, value: &str) -> Result<()>;
}

#[inline]
pub fn file_list_key(version: u32, host: &str) -> String {
    format!("cache-location/{version}/{host}")
}

#[inline]
pub fn status_key(version: u32, host: &str) -> String {
    format!("cache-status/{version}/{host}")
}

#[inline]
pub fn parse_file_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

/// Ordered columnlet layout of one cache generation. Only the prefix up to
/// `cache_border` is cached; the externally computed order is the admission
/// policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactLayout {
    cache_border: usize,
    columnlet_order: Vec<(u16, u16)>,
}

impl CompactLayout {
    #[inline]
    pub fn new(cache_border: usize, columnlet_order: Vec<(u16, u16)>) -> Self {
        CompactLayout {
            cache_border,
            columnlet_order,
        }
    }

    /// Parse the coordination value `"{border};{rg}:{col},{rg}:{col},..."`.
    pub fn parse(value: &str) -> Result<CompactLayout> {
        let malformed = |_| Error::CoordinationFailure(format!("malformed layout: {value}"));
        let (border, order) = value
            .split_once(';')
            .ok_or_else(|| Error::CoordinationFailure(format!("malformed layout: {value}")))?;
        let cache_border = border.trim().parse::<usize>().map_err(malformed)?;
        let mut columnlet_order = Vec::new();
        for pair in order.split(',').filter(|s| !s.is_empty()) {
            let (rg, col) = pair
                .split_once(':')
                .ok_or_else(|| Error::CoordinationFailure(format!("malformed layout: {value}")))?;
            columnlet_order.push((
                rg.trim().parse::<u16>().map_err(malformed)?,
                col.trim().parse::<u16>().map_err(malformed)?,
            ));
        }
        Ok(CompactLayout {
            cache_border,
            columnlet_order,
        })
    }

    /// The columnlets to cache, in admission order.
    #[inline]
    pub fn cached_columnlets(&self) -> &[(u16, u16)] {
        let border = self.cache_border.min(self.columnlet_order.len());
        &self.columnlet_order[..border]
    }
}

/// In-process store used by tests and examples.
#[derive(Default)]
pub struct MemCoordStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemCoordStore {
    #[inline]
    pub fn new() -> Self {
        MemCoordStore::default()
    }
}

impl CoordStore for MemCoordStore {
    #[inline]
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    #[inline]
    fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}
