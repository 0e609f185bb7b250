//! Per-file state and the reference-counted open handle.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::buffer::DataBuffer;
use crate::filesystem::WebFileSystem;
use crate::host::HostRuntime;
use crate::registry::{DataProtocol, FileId};
use crate::stats::FileStatisticsCollector;
use crate::{Error, Result};

/// Mutable per-file state, guarded by the file lock.
///
/// Shared acquisition covers plain reads; protocol switches, size changes
/// and truncation take the lock exclusively. There is no upgrade path: a
/// reader that discovers it must mutate drops the shared guard, reacquires
/// exclusively and rechecks.
pub(crate) struct FileState {
    pub data_protocol: DataProtocol,
    /// Original location. Survives promotion to BUFFER so the origin of the
    /// bytes stays visible in file info.
    pub data_url: Option<String>,
    /// Host descriptor prebound by the embedder, skipping the host open.
    pub data_fd: Option<u32>,
    pub file_size: u64,
    /// Present exactly when the protocol is BUFFER (or the file was fully
    /// inlined by the host).
    pub data_buffer: Option<DataBuffer>,
    pub file_stats: Option<Arc<FileStatisticsCollector>>,
}

/// One registered or opened file.
pub struct WebFile {
    file_id: FileId,
    file_name: String,
    handle_count: AtomicUsize,
    pub(crate) state: RwLock<FileState>,
}

impl WebFile {
    pub(crate) fn for_url(
        file_id: FileId,
        file_name: impl Into<String>,
        protocol: DataProtocol,
        url: impl Into<String>,
    ) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            handle_count: AtomicUsize::new(0),
            state: RwLock::new(FileState {
                data_protocol: protocol,
                data_url: Some(url.into()),
                data_fd: None,
                file_size: 0,
                data_buffer: None,
                file_stats: None,
            }),
        }
    }

    pub(crate) fn for_buffer(
        file_id: FileId,
        file_name: impl Into<String>,
        buffer: DataBuffer,
    ) -> Self {
        Self {
            file_id,
            file_name: file_name.into(),
            handle_count: AtomicUsize::new(0),
            state: RwLock::new(FileState {
                data_protocol: DataProtocol::Buffer,
                data_url: None,
                data_fd: None,
                file_size: buffer.size(),
                data_buffer: Some(buffer),
                file_stats: None,
            }),
        }
    }

    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn handle_count(&self) -> usize {
        self.handle_count.load(Ordering::Acquire)
    }

    pub(crate) fn add_handle(&self) {
        self.handle_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_handle(&self) -> usize {
        self.handle_count.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub fn size(&self) -> u64 {
        self.state.read().file_size
    }

    pub fn protocol(&self) -> DataProtocol {
        self.state.read().data_protocol
    }

    /// Switches the file to BUFFER in place, keeping `data_url`.
    pub(crate) fn promote_to_buffer(state: &mut FileState, bytes: Vec<u8>) {
        let buffer = DataBuffer::from_bytes(bytes);
        state.file_size = buffer.size();
        state.data_buffer = Some(buffer);
        state.data_protocol = DataProtocol::Buffer;
        state.data_fd = None;
    }

    /// Plain positional read with no caching and no statistics, used by the
    /// page buffer to fill frames. Reads are clamped to the file size; a
    /// read at or past the end returns 0.
    pub(crate) fn read_raw(
        &self,
        host: &dyn HostRuntime,
        dst: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        let state = self.state.read();
        if offset >= state.file_size || dst.is_empty() {
            return Ok(0);
        }
        let len = dst.len().min((state.file_size - offset) as usize);
        match state.data_protocol {
            DataProtocol::Buffer => {
                let buffer = state.data_buffer.as_ref().expect("BUFFER file has bytes");
                Ok(buffer.read_at(offset, &mut dst[..len]))
            }
            DataProtocol::Native | DataProtocol::Http => {
                host.read(self.file_id, &mut dst[..len], offset)
            }
        }
    }

    /// Plain positional write used for page write-back. Serializes against
    /// other writers through the exclusive state lock; does not touch the
    /// recorded file size.
    pub(crate) fn write_raw(
        &self,
        host: &dyn HostRuntime,
        src: &[u8],
        offset: u64,
    ) -> Result<usize> {
        let mut state = self.state.write();
        match state.data_protocol {
            DataProtocol::Buffer => {
                let buffer = state.data_buffer.as_mut().expect("BUFFER file has bytes");
                buffer.write_at(offset, src);
                Ok(src.len())
            }
            DataProtocol::Native => host.write(self.file_id, src, offset),
            DataProtocol::Http => Err(Error::not_supported("writes to HTTP sources")),
        }
    }
}

/// A borrow of a registered file that keeps it alive.
///
/// Dropping the handle runs the close flow: the handle count drops, and a
/// non-BUFFER file with no remaining handles is closed at the host and
/// unregistered.
pub struct WebFileHandle {
    fs: Arc<WebFileSystem>,
    file: Arc<WebFile>,
    position: AtomicU64,
}

impl WebFileHandle {
    /// Increments the file's handle count. Only the filesystem constructs
    /// handles, from its open and register flows.
    pub(crate) fn new(fs: Arc<WebFileSystem>, file: Arc<WebFile>) -> Self {
        file.add_handle();
        Self {
            fs,
            file,
            position: AtomicU64::new(0),
        }
    }

    pub fn file(&self) -> &Arc<WebFile> {
        &self.file
    }

    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Acquire)
    }

    pub fn seek(&self, position: u64) {
        self.position.store(position, Ordering::Release);
    }

    /// Reads at the handle position and advances it by the bytes read.
    pub fn read(&self, dst: &mut [u8]) -> Result<usize> {
        let position = self.position();
        let n = self.read_at(dst, position)?;
        self.position.store(position + n as u64, Ordering::Release);
        Ok(n)
    }

    /// Writes at the handle position and advances it by the bytes written.
    pub fn write(&self, src: &[u8]) -> Result<usize> {
        let position = self.position();
        let n = self.write_at(src, position)?;
        self.position.store(position + n as u64, Ordering::Release);
        Ok(n)
    }

    /// Positional read along the direct (unpaged) route: BUFFER files serve
    /// from memory, other protocols go through this thread's read-ahead
    /// window. Zero-length requests and reads at or past the end return 0
    /// without host I/O.
    pub fn read_at(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let state = self.file.state.read();
        if dst.is_empty() || offset >= state.file_size {
            return Ok(0);
        }
        let len = dst.len().min((state.file_size - offset) as usize);
        let dst = &mut dst[..len];
        match state.data_protocol {
            DataProtocol::Buffer => {
                let buffer = state.data_buffer.as_ref().expect("BUFFER file has bytes");
                let n = buffer.read_at(offset, dst);
                if let Some(stats) = &state.file_stats {
                    stats.record_cached(offset, n);
                }
                Ok(n)
            }
            DataProtocol::Native | DataProtocol::Http => {
                let readahead = self.fs.readahead_for_current_thread();
                let mut readahead = readahead.lock();
                readahead.read(self.fs.host(), self.file.file_id(), &state, dst, offset)
            }
        }
    }

    /// Positional write along the direct route. The request either completes
    /// in full or fails; partial host writes are surfaced as errors rather
    /// than silently short.
    pub fn write_at(&self, src: &[u8], offset: u64) -> Result<usize> {
        if src.is_empty() {
            return Ok(0);
        }
        let mut state = self.file.state.write();
        match state.data_protocol {
            DataProtocol::Buffer => {
                let buffer = state.data_buffer.as_mut().expect("BUFFER file has bytes");
                buffer.write_at(offset, src);
                state.file_size = buffer.size();
            }
            DataProtocol::Native => {
                let mut written = 0;
                while written < src.len() {
                    let n = self.fs.host().write(
                        self.file.file_id(),
                        &src[written..],
                        offset + written as u64,
                    )?;
                    if n == 0 {
                        return Err(Error::io(format!(
                            "host wrote 0 of {} bytes to {}",
                            src.len() - written,
                            self.file.file_name()
                        )));
                    }
                    written += n;
                }
                state.file_size = state.file_size.max(offset + src.len() as u64);
            }
            DataProtocol::Http => {
                return Err(Error::not_supported("writes to HTTP sources"));
            }
        }
        if let Some(stats) = &state.file_stats {
            stats.record_write(offset, src.len());
        }
        drop(state);
        self.fs.invalidate_readaheads(self.file.file_id());
        Ok(src.len())
    }

    /// Truncates or extends the file to `new_size`.
    pub fn truncate(&self, new_size: u64) -> Result<()> {
        let mut state = self.file.state.write();
        match state.data_protocol {
            DataProtocol::Buffer => {
                let buffer = state.data_buffer.as_mut().expect("BUFFER file has bytes");
                buffer.resize(new_size as usize);
            }
            DataProtocol::Native => {
                self.fs.host().truncate(self.file.file_id(), new_size)?;
            }
            DataProtocol::Http => {
                return Err(Error::not_supported("truncating HTTP sources"));
            }
        }
        state.file_size = new_size;
        if let Some(stats) = &state.file_stats {
            stats.resize(new_size);
        }
        drop(state);
        self.fs.invalidate_readaheads(self.file.file_id());
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        match self.file.protocol() {
            DataProtocol::Buffer => Ok(()),
            _ => self.fs.host().sync(self.file.file_id()),
        }
    }

    pub fn last_modified(&self) -> Result<i64> {
        match self.file.protocol() {
            DataProtocol::Buffer => Ok(0),
            _ => self.fs.host().last_modified(self.file.file_id()),
        }
    }

    pub fn file_size(&self) -> u64 {
        self.file.size()
    }
}

impl Drop for WebFileHandle {
    fn drop(&mut self) {
        self.fs.close_handle(&self.file);
    }
}
