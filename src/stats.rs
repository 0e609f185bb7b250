//! Per-file page access statistics.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::{Error, Result};

/// Export format magic and version. The layout is little-endian and stable
/// across runs: `magic || version:u16 || page_size:u32 || n_pages:u64 ||
/// (cold:u32, cached:u32, writes:u32) * n_pages`.
const EXPORT_MAGIC: [u8; 4] = *b"WFST";
const EXPORT_VERSION: u16 = 1;

#[derive(Clone, Copy, Default)]
struct PageCounters {
    cold: u32,
    cached: u32,
    writes: u32,
}

/// Collects per-page access counts for one file.
///
/// Counters saturate instead of wrapping; a page that has been read four
/// billion times is "hot" by any measure.
pub struct FileStatisticsCollector {
    page_size: u32,
    pages: Mutex<Vec<PageCounters>>,
}

impl FileStatisticsCollector {
    pub fn new(page_size: u32, file_size: u64) -> Self {
        let collector = Self {
            page_size,
            pages: Mutex::new(Vec::new()),
        };
        collector.resize(file_size);
        collector
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Reshapes to cover `file_size`, keeping counts of pages that remain in
    /// range.
    pub fn resize(&self, file_size: u64) {
        let n_pages = file_size.div_ceil(self.page_size as u64) as usize;
        self.pages.lock().resize(n_pages, PageCounters::default());
    }

    fn bump(&self, offset: u64, len: usize, f: impl Fn(&mut PageCounters)) {
        if len == 0 {
            return;
        }
        let first = offset / self.page_size as u64;
        let last = (offset + len as u64 - 1) / self.page_size as u64;
        let mut pages = self.pages.lock();
        if pages.len() <= last as usize {
            pages.resize(last as usize + 1, PageCounters::default());
        }
        for page in &mut pages[first as usize..=last as usize] {
            f(page);
        }
    }

    /// Records a read served by the host (or a page-buffer miss).
    pub fn record_cold(&self, offset: u64, len: usize) {
        self.bump(offset, len, |p| p.cold = p.cold.saturating_add(1));
    }

    /// Records a read served from memory: a page hit, a read-ahead hit, or a
    /// BUFFER file read.
    pub fn record_cached(&self, offset: u64, len: usize) {
        self.bump(offset, len, |p| p.cached = p.cached.saturating_add(1));
    }

    pub fn record_write(&self, offset: u64, len: usize) {
        self.bump(offset, len, |p| p.writes = p.writes.saturating_add(1));
    }

    /// Serializes the histogram into the stable binary layout.
    pub fn export(&self) -> Vec<u8> {
        let pages = self.pages.lock();
        let mut out = Vec::with_capacity(4 + 2 + 4 + 8 + pages.len() * 12);
        out.extend_from_slice(&EXPORT_MAGIC);
        out.extend_from_slice(&EXPORT_VERSION.to_le_bytes());
        out.extend_from_slice(&self.page_size.to_le_bytes());
        out.extend_from_slice(&(pages.len() as u64).to_le_bytes());
        for page in pages.iter() {
            out.extend_from_slice(&page.cold.to_le_bytes());
            out.extend_from_slice(&page.cached.to_le_bytes());
            out.extend_from_slice(&page.writes.to_le_bytes());
        }
        out
    }

    #[cfg(test)]
    pub(crate) fn totals(&self) -> (u64, u64, u64) {
        let pages = self.pages.lock();
        pages.iter().fold((0, 0, 0), |(c, h, w), p| {
            (c + p.cold as u64, h + p.cached as u64, w + p.writes as u64)
        })
    }
}

/// Collectors by file name. Enabling is idempotent; collectors survive the
/// file being closed and re-opened so a cold/warm comparison across runs of
/// the same query is possible.
#[derive(Default)]
pub(crate) struct StatisticsRegistry {
    page_size: u32,
    collectors: Mutex<FxHashMap<String, Arc<FileStatisticsCollector>>>,
}

impl StatisticsRegistry {
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            collectors: Mutex::new(FxHashMap::default()),
        }
    }

    /// Enables or disables collection for `name`. Returns the (new or
    /// existing) collector when enabling, `None` when disabling.
    pub fn enable(
        &self,
        name: &str,
        enable: bool,
        file_size: u64,
    ) -> Option<Arc<FileStatisticsCollector>> {
        let mut collectors = self.collectors.lock();
        if enable {
            Some(
                collectors
                    .entry(name.to_owned())
                    .or_insert_with(|| {
                        Arc::new(FileStatisticsCollector::new(self.page_size, file_size))
                    })
                    .clone(),
            )
        } else {
            collectors.remove(name);
            None
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<FileStatisticsCollector>> {
        self.collectors.lock().get(name).cloned()
    }

    pub fn export(&self, name: &str) -> Result<Vec<u8>> {
        self.get(name)
            .map(|collector| collector.export())
            .ok_or_else(|| Error::invalid(format!("no statistics collected for {name}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_by_page() {
        let collector = FileStatisticsCollector::new(4096, 10_000);
        collector.record_cold(0, 4096);
        collector.record_cached(4096, 100);
        collector.record_write(8000, 200);
        let (cold, cached, writes) = collector.totals();
        assert_eq!((cold, cached, writes), (1, 1, 2));
    }

    #[test]
    fn export_layout() {
        let collector = FileStatisticsCollector::new(4096, 8192);
        collector.record_cold(0, 1);
        let bytes = collector.export();
        assert_eq!(&bytes[0..4], b"WFST");
        assert_eq!(u16::from_le_bytes([bytes[4], bytes[5]]), 1);
        assert_eq!(
            u32::from_le_bytes(bytes[6..10].try_into().unwrap()),
            4096
        );
        assert_eq!(
            u64::from_le_bytes(bytes[10..18].try_into().unwrap()),
            2
        );
        // first page: cold=1, cached=0, writes=0
        assert_eq!(
            u32::from_le_bytes(bytes[18..22].try_into().unwrap()),
            1
        );
        assert_eq!(bytes.len(), 18 + 2 * 12);
    }

    #[test]
    fn writes_past_eof_grow_the_histogram() {
        let collector = FileStatisticsCollector::new(4096, 0);
        collector.record_write(4096 * 3, 10);
        assert_eq!(collector.export().len(), 18 + 4 * 12);
    }

    #[test]
    fn enable_is_idempotent() {
        let registry = StatisticsRegistry::new(4096);
        let a = registry.enable("t.csv", true, 0).unwrap();
        let b = registry.enable("t.csv", true, 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(registry.enable("t.csv", false, 0).is_none());
        assert!(registry.get("t.csv").is_none());
        assert!(matches!(
            registry.export("t.csv"),
            Err(Error::Invalid(_))
        ));
    }
}
