//! Bounded global page cache with LRU eviction and dirty write-back.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::file::WebFile;
use crate::host::HostRuntime;
use crate::registry::FileId;
use crate::{Error, Result};

/// Page size `P`. Frames, statistics histograms and read clamping all agree
/// on this value.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;
/// Default pool footprint.
pub const DEFAULT_POOL_BYTES: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct PageBufferConfig {
    pub page_size: usize,
    pub pool_bytes: usize,
}

impl Default for PageBufferConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            pool_bytes: DEFAULT_POOL_BYTES,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    Write,
}

type PageKey = (FileId, u64);

struct Frame {
    file: Option<Arc<WebFile>>,
    page_no: u64,
    /// Allocated to `page_size` on first use.
    data: Box<[u8]>,
    /// Valid bytes; the last page of a file is short.
    len: usize,
    dirty: bool,
    pins: u32,
    /// Monotone access stamp; the unpinned frame with the smallest stamp is
    /// the eviction victim.
    epoch: u64,
}

impl Frame {
    fn key(&self) -> Option<PageKey> {
        self.file.as_ref().map(|f| (f.file_id(), self.page_no))
    }
}

struct Inner {
    frames: Vec<Frame>,
    table: FxHashMap<PageKey, usize>,
    next_epoch: u64,
}

/// The shared page pool. All engine reads and writes on non-direct files go
/// through here; BUFFER and `force_direct_io` files never do.
pub struct FilePageBuffer {
    page_size: usize,
    inner: Mutex<Inner>,
}

impl FilePageBuffer {
    pub fn new(config: PageBufferConfig) -> Self {
        let frame_count = (config.pool_bytes / config.page_size).max(1);
        let frames = (0..frame_count)
            .map(|_| Frame {
                file: None,
                page_no: 0,
                data: Box::default(),
                len: 0,
                dirty: false,
                pins: 0,
                epoch: 0,
            })
            .collect();
        Self {
            page_size: config.page_size,
            inner: Mutex::new(Inner {
                frames,
                table: FxHashMap::default(),
                next_epoch: 1,
            }),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pins the frame holding `(file, page_no)`, loading it on a miss.
    ///
    /// Returns `None` when every frame is pinned: the caller falls back to a
    /// bypass read or write straight against the file.
    pub fn get_page(
        &self,
        host: &dyn HostRuntime,
        file: &Arc<WebFile>,
        page_no: u64,
        intent: AccessIntent,
    ) -> Result<Option<PinnedPage<'_>>> {
        let mut inner = self.inner.lock();
        let key = (file.file_id(), page_no);
        let epoch = inner.next_epoch;
        inner.next_epoch += 1;

        if let Some(&idx) = inner.table.get(&key) {
            let frame = &mut inner.frames[idx];
            frame.pins += 1;
            frame.epoch = epoch;
            drop(inner);
            if intent == AccessIntent::Read
                && let Some(stats) = file.state.read().file_stats.as_ref()
            {
                stats.record_cached(page_no * self.page_size as u64, self.page_size);
            }
            return Ok(Some(PinnedPage {
                buffer: self,
                frame: idx,
                intent,
            }));
        }

        let Some(idx) = Self::pick_victim(&inner) else {
            return Ok(None);
        };

        // Evict. A dirty victim is written back first; a write-back failure
        // leaves the frame clean-but-lost and surfaces to this caller.
        if let Some(victim_key) = inner.frames[idx].key() {
            inner.table.remove(&victim_key);
            if inner.frames[idx].dirty {
                let victim_file = inner.frames[idx].file.clone().expect("keyed frame has file");
                let offset = inner.frames[idx].page_no * self.page_size as u64;
                let len = inner.frames[idx].len;
                inner.frames[idx].dirty = false;
                debug!(
                    file = victim_file.file_name(),
                    page = inner.frames[idx].page_no,
                    "writing back dirty page before eviction"
                );
                let data = std::mem::take(&mut inner.frames[idx].data);
                let result = victim_file.write_raw(host, &data[..len], offset);
                inner.frames[idx].data = data;
                if let Err(err) = result {
                    warn!(
                        file = victim_file.file_name(),
                        "page write-back failed: {err}"
                    );
                    inner.frames[idx].file = None;
                    return Err(Error::io(format!(
                        "failed to write back page of {}: {err}",
                        victim_file.file_name()
                    )));
                }
            }
            inner.frames[idx].file = None;
        }

        // Load into the freed frame.
        if inner.frames[idx].data.len() != self.page_size {
            inner.frames[idx].data = vec![0u8; self.page_size].into_boxed_slice();
        }
        let mut data = std::mem::take(&mut inner.frames[idx].data);
        let loaded = file.read_raw(host, &mut data, page_no * self.page_size as u64);
        inner.frames[idx].data = data;
        let len = loaded?;

        let frame = &mut inner.frames[idx];
        frame.file = Some(file.clone());
        frame.page_no = page_no;
        frame.len = len;
        frame.dirty = false;
        frame.pins = 1;
        frame.epoch = epoch;
        inner.table.insert(key, idx);
        drop(inner);
        if intent == AccessIntent::Read
            && let Some(stats) = file.state.read().file_stats.as_ref()
        {
            stats.record_cold(page_no * self.page_size as u64, self.page_size);
        }
        Ok(Some(PinnedPage {
            buffer: self,
            frame: idx,
            intent,
        }))
    }

    fn pick_victim(inner: &Inner) -> Option<usize> {
        inner
            .frames
            .iter()
            .enumerate()
            .filter(|(_, f)| f.pins == 0)
            .min_by_key(|(_, f)| f.epoch)
            .map(|(idx, _)| idx)
    }

    /// Reads `dst.len()` bytes at `offset` through the pool, clamped to the
    /// file size. Pages for which no unpinned frame exists are served by a
    /// bypass read.
    pub fn read(
        &self,
        host: &dyn HostRuntime,
        file: &Arc<WebFile>,
        dst: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let file_size = file.size();
        if dst.is_empty() || offset >= file_size {
            return Ok(0);
        }
        let len = dst.len().min((file_size - offset) as usize);
        let mut done = 0;
        while done < len {
            let position = offset + done as u64;
            let page_no = position / self.page_size as u64;
            let page_offset = (position % self.page_size as u64) as usize;
            let chunk = (self.page_size - page_offset).min(len - done);
            match self.get_page(host, file, page_no, AccessIntent::Read)? {
                Some(page) => {
                    page.read_into(page_offset, &mut dst[done..done + chunk]);
                }
                None => {
                    file.read_raw(host, &mut dst[done..done + chunk], position)?;
                    if let Some(stats) = file.state.read().file_stats.as_ref() {
                        stats.record_cold(position, chunk);
                    }
                }
            }
            done += chunk;
        }
        Ok(len)
    }

    /// Writes `src` at `offset` through the pool, extending the file size
    /// and marking touched pages dirty. Dirty pages reach the host on
    /// eviction or flush.
    pub fn write(
        &self,
        host: &dyn HostRuntime,
        file: &Arc<WebFile>,
        src: &[u8],
        offset: u64,
    ) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let mut done = 0;
        while done < src.len() {
            let position = offset + done as u64;
            let page_no = position / self.page_size as u64;
            let page_offset = (position % self.page_size as u64) as usize;
            let chunk = (self.page_size - page_offset).min(src.len() - done);
            match self.get_page(host, file, page_no, AccessIntent::Write)? {
                Some(page) => {
                    page.write_from(page_offset, &src[done..done + chunk]);
                }
                None => {
                    file.write_raw(host, &src[done..done + chunk], position)?;
                }
            }
            done += chunk;
        }

        let mut state = file.state.write();
        state.file_size = state.file_size.max(offset + src.len() as u64);
        if let Some(stats) = &state.file_stats {
            stats.record_write(offset, src.len());
        }
        Ok(src.len())
    }

    /// Writes back every dirty frame of `file_id`, leaving the frames clean
    /// and resident.
    pub fn flush_file(&self, host: &dyn HostRuntime, file_id: FileId) -> Result<()> {
        self.flush_where(host, |key| key.0 == file_id)
    }

    /// Writes back every dirty frame of every file.
    pub fn flush_files(&self, host: &dyn HostRuntime) -> Result<()> {
        self.flush_where(host, |_| true)
    }

    fn flush_where(&self, host: &dyn HostRuntime, select: impl Fn(&PageKey) -> bool) -> Result<()> {
        let mut inner = self.inner.lock();
        for idx in 0..inner.frames.len() {
            let Some(key) = inner.frames[idx].key() else {
                continue;
            };
            if !select(&key) || !inner.frames[idx].dirty {
                continue;
            }
            let file = inner.frames[idx].file.clone().expect("keyed frame has file");
            let offset = inner.frames[idx].page_no * self.page_size as u64;
            let len = inner.frames[idx].len;
            inner.frames[idx].dirty = false;
            let data = std::mem::take(&mut inner.frames[idx].data);
            let result = file.write_raw(host, &data[..len], offset);
            inner.frames[idx].data = data;
            if let Err(err) = result {
                warn!(file = file.file_name(), "flush write-back failed: {err}");
                return Err(Error::io(format!(
                    "failed to flush page of {}: {err}",
                    file.file_name()
                )));
            }
        }
        Ok(())
    }

    /// Drops every frame of `file_id` if none of them is pinned or dirty.
    /// Dirty frames hold writes the host has not seen; callers flush first.
    pub fn try_drop_file(&self, file_id: FileId) -> bool {
        let mut inner = self.inner.lock();
        let blocked = inner
            .frames
            .iter()
            .any(|f| f.key().is_some_and(|k| k.0 == file_id) && (f.pins > 0 || f.dirty));
        if blocked {
            return false;
        }
        Self::discard_frames(&mut inner, file_id);
        true
    }

    /// Drops every unpinned frame of `file_id`, discarding dirty contents.
    /// Used by truncation after an explicit flush.
    pub fn invalidate_file(&self, file_id: FileId) {
        let mut inner = self.inner.lock();
        Self::discard_frames(&mut inner, file_id);
    }

    fn discard_frames(inner: &mut Inner, file_id: FileId) {
        for frame in &mut inner.frames {
            if frame.pins == 0 && frame.key().is_some_and(|k| k.0 == file_id) {
                inner.table.remove(&(file_id, frame.page_no));
                frame.file = None;
                frame.dirty = false;
                frame.len = 0;
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn resident_pages(&self, file_id: FileId) -> Vec<u64> {
        let inner = self.inner.lock();
        let mut pages: Vec<u64> = inner
            .table
            .keys()
            .filter(|(fid, _)| *fid == file_id)
            .map(|(_, page)| *page)
            .collect();
        pages.sort_unstable();
        pages
    }

    fn unpin(&self, frame: usize, mark_dirty: bool) {
        let mut inner = self.inner.lock();
        let frame = &mut inner.frames[frame];
        frame.pins -= 1;
        if mark_dirty {
            frame.dirty = true;
        }
    }
}

/// A pinned page frame. Not evictable while alive; dropping it unpins, and
/// a write-intent pin marks the frame dirty on release.
pub struct PinnedPage<'a> {
    buffer: &'a FilePageBuffer,
    frame: usize,
    intent: AccessIntent,
}

impl PinnedPage<'_> {
    /// Copies page bytes starting at `page_offset` into `dst`. Bytes past
    /// the frame's valid length read as zero.
    pub fn read_into(&self, page_offset: usize, dst: &mut [u8]) {
        let inner = self.buffer.inner.lock();
        let frame = &inner.frames[self.frame];
        let valid = frame.len.saturating_sub(page_offset);
        let n = dst.len().min(valid);
        dst[..n].copy_from_slice(&frame.data[page_offset..page_offset + n]);
        dst[n..].fill(0);
    }

    /// Copies `src` into the page at `page_offset`, zero-filling any gap
    /// between the previous valid length and the write start.
    pub fn write_from(&self, page_offset: usize, src: &[u8]) {
        let mut inner = self.buffer.inner.lock();
        let page_size = self.buffer.page_size;
        let frame = &mut inner.frames[self.frame];
        assert!(page_offset + src.len() <= page_size, "write exceeds page");
        if page_offset > frame.len {
            frame.data[frame.len..page_offset].fill(0);
        }
        frame.data[page_offset..page_offset + src.len()].copy_from_slice(src);
        frame.len = frame.len.max(page_offset + src.len());
    }

    pub fn len(&self) -> usize {
        self.buffer.inner.lock().frames[self.frame].len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for PinnedPage<'_> {
    fn drop(&mut self) {
        self.buffer
            .unpin(self.frame, self.intent == AccessIntent::Write);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::file::WebFileHandle;
    use crate::filesystem::{FileSystemConfig, OpenFlags, WebFileSystem};
    use crate::testing::MockHost;

    const PAGE: usize = 64;

    fn fixture(
        contents: &[u8],
        pool_pages: usize,
    ) -> (Arc<MockHost>, Arc<WebFileSystem>, WebFileHandle, FilePageBuffer) {
        let host = MockHost::new();
        host.put_native("data.bin", contents);
        let fs = WebFileSystem::new(host.clone(), FileSystemConfig::default(), PAGE as u32);
        let handle = fs.open_file("data.bin", OpenFlags::default()).unwrap();
        let pages = FilePageBuffer::new(PageBufferConfig {
            page_size: PAGE,
            pool_bytes: PAGE * pool_pages,
        });
        (host, fs, handle, pages)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn second_read_is_a_cache_hit() {
        let contents = patterned(PAGE);
        let (host, fs, handle, pages) = fixture(&contents, 4);
        let file = handle.file().clone();

        let mut out = vec![0u8; PAGE];
        assert_eq!(pages.read(fs.host(), &file, &mut out, 0).unwrap(), PAGE);
        assert_eq!(out, contents);
        let cold_reads = host.reads();

        out.fill(0);
        assert_eq!(pages.read(fs.host(), &file, &mut out, 0).unwrap(), PAGE);
        assert_eq!(out, contents);
        assert_eq!(host.reads(), cold_reads);
    }

    #[test]
    fn sequential_scan_evicts_in_lru_order() {
        let contents = patterned(PAGE * 6);
        let (_host, fs, handle, pages) = fixture(&contents, 4);
        let file = handle.file().clone();

        let mut out = vec![0u8; PAGE];
        for page_no in 0..6u64 {
            pages
                .read(fs.host(), &file, &mut out, page_no * PAGE as u64)
                .unwrap();
        }
        let resident = pages.resident_pages(file.file_id());
        assert_eq!(resident.len(), 4);
        // the first pages read were the first evicted
        assert_eq!(resident, vec![2, 3, 4, 5]);
    }

    #[test]
    fn dirty_pages_reach_the_host_on_eviction() {
        let contents = patterned(PAGE * 6);
        let (host, fs, handle, pages) = fixture(&contents, 2);
        let file = handle.file().clone();

        pages.write(fs.host(), &file, b"edited", 0).unwrap();
        assert_eq!(&host.native_contents("data.bin").unwrap()[..6], &contents[..6]);

        // walk enough pages to evict page 0
        let mut out = vec![0u8; PAGE];
        for page_no in 1..5u64 {
            pages
                .read(fs.host(), &file, &mut out, page_no * PAGE as u64)
                .unwrap();
        }
        assert_eq!(&host.native_contents("data.bin").unwrap()[..6], b"edited");
    }

    #[test]
    fn flush_writes_back_and_keeps_pages_resident() {
        let contents = patterned(PAGE * 2);
        let (host, fs, handle, pages) = fixture(&contents, 4);
        let file = handle.file().clone();

        pages.write(fs.host(), &file, b"patch", PAGE as u64).unwrap();
        pages.flush_file(fs.host(), file.file_id()).unwrap();
        assert_eq!(
            &host.native_contents("data.bin").unwrap()[PAGE..PAGE + 5],
            b"patch"
        );
        assert_eq!(pages.resident_pages(file.file_id()), vec![1]);

        // clean now: dropping is allowed
        assert!(pages.try_drop_file(file.file_id()));
        assert!(pages.resident_pages(file.file_id()).is_empty());
    }

    #[test]
    fn all_frames_pinned_falls_back_to_bypass() {
        let contents = patterned(PAGE * 4);
        let (host, fs, handle, pages) = fixture(&contents, 2);
        let file = handle.file().clone();

        let p0 = pages
            .get_page(fs.host(), &file, 0, AccessIntent::Read)
            .unwrap()
            .expect("frame available");
        let p1 = pages
            .get_page(fs.host(), &file, 1, AccessIntent::Read)
            .unwrap()
            .expect("frame available");

        assert!(pages
            .get_page(fs.host(), &file, 2, AccessIntent::Read)
            .unwrap()
            .is_none());

        // the loop-based read still succeeds through the bypass
        let reads_before = host.reads();
        let mut out = vec![0u8; PAGE];
        assert_eq!(
            pages
                .read(fs.host(), &file, &mut out, 2 * PAGE as u64)
                .unwrap(),
            PAGE
        );
        assert_eq!(out, &contents[2 * PAGE..3 * PAGE]);
        assert!(host.reads() > reads_before);
        assert_eq!(pages.resident_pages(file.file_id()), vec![0, 1]);

        drop(p0);
        drop(p1);
    }

    #[test]
    fn try_drop_refuses_pinned_and_dirty_frames() {
        let contents = patterned(PAGE * 2);
        let (_host, fs, handle, pages) = fixture(&contents, 4);
        let file = handle.file().clone();

        let pin = pages
            .get_page(fs.host(), &file, 0, AccessIntent::Read)
            .unwrap()
            .expect("frame available");
        assert!(!pages.try_drop_file(file.file_id()));
        drop(pin);
        assert!(pages.try_drop_file(file.file_id()));

        pages.write(fs.host(), &file, b"dirty", 0).unwrap();
        assert!(!pages.try_drop_file(file.file_id()));
        pages.flush_file(fs.host(), file.file_id()).unwrap();
        assert!(pages.try_drop_file(file.file_id()));
    }

    #[test]
    fn writes_extend_the_file() {
        let (_host, fs, handle, pages) = fixture(b"", 4);
        let file = handle.file().clone();

        let offset = (PAGE + 10) as u64;
        pages.write(fs.host(), &file, b"tail", offset).unwrap();
        assert_eq!(file.size(), offset + 4);

        let mut out = vec![0u8; 4];
        assert_eq!(pages.read(fs.host(), &file, &mut out, offset).unwrap(), 4);
        assert_eq!(&out, b"tail");

        // the zero-fill gap reads back as zeros
        let mut gap = vec![0xAAu8; 10];
        assert_eq!(
            pages.read(fs.host(), &file, &mut gap, PAGE as u64).unwrap(),
            10
        );
        assert_eq!(gap, vec![0u8; 10]);
    }

    #[test]
    fn eof_and_empty_reads_return_zero() {
        let contents = patterned(PAGE);
        let (host, fs, handle, pages) = fixture(&contents, 4);
        let file = handle.file().clone();

        let reads_before = host.reads();
        let mut out = [0u8; 8];
        assert_eq!(
            pages
                .read(fs.host(), &file, &mut out, PAGE as u64 + 1)
                .unwrap(),
            0
        );
        assert_eq!(pages.read(fs.host(), &file, &mut [], 0).unwrap(), 0);
        assert_eq!(host.reads(), reads_before);
    }
}
