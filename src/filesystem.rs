//! The filesystem context and the engine-facing buffered adapter.

use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::buffer::DataBuffer;
use crate::file::{WebFile, WebFileHandle};
use crate::host::HostRuntime;
use crate::page_buffer::{FilePageBuffer, PageBufferConfig};
use crate::readahead::{ReadAheadBuffer, ReadAheadRegistry};
use crate::registry::{glob_to_regex, DataProtocol, FileId, FileRegistry};
use crate::stats::{FileStatisticsCollector, StatisticsRegistry};
use crate::{Error, Result};

/// Filesystem-level configuration, a sub-object of the database config.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct FileSystemConfig {
    /// Whether a non-ranged HTTP source may be downloaded whole and kept in
    /// memory instead of failing the open.
    pub allow_full_http_reads: bool,
}

impl Default for FileSystemConfig {
    fn default() -> Self {
        Self {
            allow_full_http_reads: true,
        }
    }
}

/// Per-open configuration the engine passes through the adapter.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenFlags {
    /// Truncate to zero after opening, creating the file if needed.
    pub create_new: bool,
    /// Route this handle around the page buffer.
    pub direct_io: bool,
}

/// The explicit filesystem context: host adapter, registry, statistics and
/// read-ahead state. Everything that used to be reachable only through a
/// process-global in the ancestry of this design is owned here.
pub struct WebFileSystem {
    host: Arc<dyn HostRuntime>,
    /// The `fs_mutex`: guards both registry maps as one unit.
    registry: Mutex<FileRegistry>,
    stats: StatisticsRegistry,
    readahead: ReadAheadRegistry,
    config: FileSystemConfig,
}

impl WebFileSystem {
    pub fn new(host: Arc<dyn HostRuntime>, config: FileSystemConfig, page_size: u32) -> Arc<Self> {
        Arc::new(Self {
            host,
            registry: Mutex::new(FileRegistry::default()),
            stats: StatisticsRegistry::new(page_size),
            readahead: ReadAheadRegistry::default(),
            config,
        })
    }

    pub(crate) fn host(&self) -> &dyn HostRuntime {
        self.host.as_ref()
    }

    pub fn config(&self) -> &FileSystemConfig {
        &self.config
    }

    pub(crate) fn readahead_for_current_thread(
        &self,
    ) -> Arc<parking_lot::Mutex<ReadAheadBuffer>> {
        self.readahead.for_current_thread()
    }

    pub(crate) fn invalidate_readaheads(&self, file_id: FileId) {
        self.readahead.invalidate(file_id);
    }

    pub(crate) fn lookup(&self, name: &str) -> Option<Arc<WebFile>> {
        self.registry.lock().by_name(name).cloned()
    }

    pub(crate) fn lookup_id(&self, file_id: FileId) -> Option<Arc<WebFile>> {
        self.registry.lock().by_id(file_id).cloned()
    }

    /// Registers `name` as a view onto `url`. Re-registering the same
    /// name/url pair hands out another handle to the existing file;
    /// registering the same name against a different url fails.
    pub fn register_url(
        self: &Arc<Self>,
        name: &str,
        url: &str,
        size: Option<u64>,
    ) -> Result<WebFileHandle> {
        let (protocol, location) = DataProtocol::infer(url);
        let mut registry = self.registry.lock();
        if let Some(existing) = registry.by_name(name) {
            let state = existing.state.read();
            if state.data_url.as_deref() == Some(location) {
                let existing = existing.clone();
                drop(state);
                drop(registry);
                return Ok(WebFileHandle::new(self.clone(), existing));
            }
            return Err(Error::AlreadyRegistered(name.to_owned()));
        }
        let file_id = registry.allocate_id();
        let file = Arc::new(WebFile::for_url(file_id, name, protocol, location));
        if let Some(size) = size {
            file.state.write().file_size = size;
        }
        registry.insert(file.clone());
        debug!(name, url, file_id, "registered url-backed file");
        drop(registry);
        self.attach_statistics(&file);
        Ok(WebFileHandle::new(self.clone(), file))
    }

    /// Registers (or replaces) `name` with in-process bytes. An existing
    /// record keeps its id and url but switches protocol to BUFFER; a
    /// previously NATIVE file has its host handle closed once the registry
    /// lock is released.
    pub fn register_buffer(self: &Arc<Self>, name: &str, bytes: Vec<u8>) -> Result<WebFileHandle> {
        let mut registry = self.registry.lock();
        let mut deferred_close: Option<FileId> = None;
        let file = if let Some(existing) = registry.by_name(name) {
            let existing = existing.clone();
            let mut state = existing.state.write();
            if state.data_protocol == DataProtocol::Native {
                deferred_close = Some(existing.file_id());
            }
            WebFile::promote_to_buffer(&mut state, bytes);
            drop(state);
            existing
        } else {
            let file_id = registry.allocate_id();
            let file = Arc::new(WebFile::for_buffer(
                file_id,
                name,
                DataBuffer::from_bytes(bytes),
            ));
            registry.insert(file.clone());
            file
        };
        debug!(name, file_id = file.file_id(), "registered buffer-backed file");
        drop(registry);
        if let Some(file_id) = deferred_close {
            self.host.close(file_id);
        }
        self.attach_statistics(&file);
        Ok(WebFileHandle::new(self.clone(), file))
    }

    /// Removes `name` if no handle holds it. Returns whether the name is
    /// gone (absent names count as dropped).
    pub fn try_drop(&self, name: &str) -> bool {
        let mut registry = self.registry.lock();
        let Some(file) = registry.by_name(name).cloned() else {
            return true;
        };
        if file.handle_count() > 0 {
            return false;
        }
        registry.remove(&file);
        drop(registry);
        if file.protocol() != DataProtocol::Buffer {
            self.host.close(file.file_id());
        }
        self.invalidate_readaheads(file.file_id());
        debug!(name, "dropped file");
        true
    }

    /// Removes every file with no live handle.
    pub fn drop_dangling(&self) {
        let dangling = self.registry.lock().drain_dangling();
        for file in dangling {
            if file.protocol() != DataProtocol::Buffer {
                self.host.close(file.file_id());
            }
            self.invalidate_readaheads(file.file_id());
        }
    }

    /// Prebinds a host descriptor, letting a later open skip the host call.
    pub fn set_fd(&self, file_id: FileId, fd: u32) -> Result<()> {
        let file = self
            .lookup_id(file_id)
            .ok_or_else(|| Error::key(format!("unknown file id {file_id}")))?;
        file.state.write().data_fd = Some(fd);
        Ok(())
    }

    pub fn file_info_by_name(&self, name: &str) -> Result<serde_json::Value> {
        let file = self
            .lookup(name)
            .ok_or_else(|| Error::key(format!("unknown file {name}")))?;
        Ok(self.file_info(&file))
    }

    pub fn file_info_by_id(&self, file_id: FileId) -> Result<serde_json::Value> {
        let file = self
            .lookup_id(file_id)
            .ok_or_else(|| Error::key(format!("unknown file id {file_id}")))?;
        Ok(self.file_info(&file))
    }

    fn file_info(&self, file: &WebFile) -> serde_json::Value {
        let state = file.state.read();
        let mut info = json!({
            "fileId": file.file_id(),
            "fileName": file.file_name(),
            "fileSize": state.file_size as f64,
            "dataProtocol": state.data_protocol.code(),
        });
        let map = info.as_object_mut().expect("info is an object");
        if let Some(url) = &state.data_url {
            map.insert("dataUrl".into(), json!(url));
        }
        if let Some(fd) = state.data_fd {
            map.insert("dataNativeFd".into(), json!(fd));
        }
        if state.data_protocol == DataProtocol::Http && self.config.allow_full_http_reads {
            map.insert("allowFullHttpReads".into(), json!(true));
        }
        info
    }

    /// Names matching `pattern`: registered names matched in-process,
    /// unioned with the host's own glob expansion, sorted and deduped.
    pub fn glob_names(&self, pattern: &str) -> Result<Vec<String>> {
        let matcher = glob_to_regex(pattern)?;
        let mut names = self.registry.lock().matching_names(&matcher);
        names.extend(self.host.glob(pattern));
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// The open flow: resolve or create the record under the registry lock,
    /// construct the handle (so the file cannot be dropped underneath us),
    /// then perform the host open under the exclusive file lock.
    pub fn open_file(self: &Arc<Self>, path: &str, flags: OpenFlags) -> Result<WebFileHandle> {
        let (file, handle) = {
            let mut registry = self.registry.lock();
            let file = match registry.by_name(path) {
                Some(file) => file.clone(),
                None => {
                    let file_id = registry.allocate_id();
                    let (protocol, location) = DataProtocol::infer(path);
                    let file = Arc::new(WebFile::for_url(file_id, path, protocol, location));
                    registry.insert(file.clone());
                    file
                }
            };
            let handle = WebFileHandle::new(self.clone(), file.clone());
            (file, handle)
        };

        {
            let mut state = file.state.write();
            match state.data_protocol {
                DataProtocol::Buffer => {
                    if flags.create_new {
                        let buffer = state.data_buffer.as_mut().expect("BUFFER file has bytes");
                        buffer.resize(0);
                        state.file_size = 0;
                    }
                }
                DataProtocol::Native if state.data_fd.is_some() => {
                    // Prebound descriptor; nothing to open at the host.
                }
                DataProtocol::Native | DataProtocol::Http => {
                    let descriptor = crate::host::HostFile {
                        file_id: file.file_id(),
                        file_name: file.file_name().to_owned(),
                        protocol: state.data_protocol,
                        data_url: state.data_url.clone(),
                        data_fd: state.data_fd,
                        allow_full_http_reads: self.config.allow_full_http_reads,
                    };
                    match self.host.open(&descriptor) {
                        Ok(opened) => {
                            if let Some(bytes) = opened.inline_buffer {
                                debug!(path, "host returned inline contents, promoting to BUFFER");
                                WebFile::promote_to_buffer(&mut state, bytes);
                            } else {
                                state.file_size = opened.file_size;
                            }
                            if flags.create_new {
                                match state.data_protocol {
                                    DataProtocol::Buffer => {
                                        let buffer = state
                                            .data_buffer
                                            .as_mut()
                                            .expect("BUFFER file has bytes");
                                        buffer.resize(0);
                                    }
                                    _ => self.host.truncate(file.file_id(), 0)?,
                                }
                                state.file_size = 0;
                            }
                        }
                        Err(err) => {
                            drop(state);
                            self.registry.lock().remove(&file);
                            return Err(err);
                        }
                    }
                }
            }
            if state.file_stats.is_none()
                && let Some(collector) = self.stats.get(path)
            {
                collector.resize(state.file_size);
                state.file_stats = Some(collector);
            }
        }
        Ok(handle)
    }

    /// The close flow, run from handle destruction.
    ///
    /// The exclusive file lock is only tried, never awaited: if another
    /// thread is mid-operation on this file it will observe the zero handle
    /// count itself. `host.close` runs outside the registry lock, and the
    /// count is rechecked under it before the record goes away.
    pub(crate) fn close_handle(&self, file: &Arc<WebFile>) {
        let state = file.state.try_write();
        if file.release_handle() > 0 {
            return;
        }
        let Some(state) = state else {
            return;
        };
        if state.data_protocol == DataProtocol::Buffer {
            return;
        }
        self.host.close(file.file_id());
        drop(state);
        let mut registry = self.registry.lock();
        if file.handle_count() == 0 {
            registry.remove(file);
        }
    }

    /// Enables or disables statistics collection for `name`, attaching the
    /// collector to the file if it is registered.
    pub fn enable_statistics(
        &self,
        name: &str,
        enable: bool,
    ) -> Option<Arc<FileStatisticsCollector>> {
        let file = self.lookup(name);
        let size = file.as_ref().map(|f| f.size()).unwrap_or(0);
        let collector = self.stats.enable(name, enable, size);
        if let Some(file) = file {
            file.state.write().file_stats = collector.clone();
        }
        collector
    }

    pub fn export_statistics(&self, name: &str) -> Result<Vec<u8>> {
        self.stats.export(name)
    }

    fn attach_statistics(&self, file: &Arc<WebFile>) {
        if let Some(collector) = self.stats.get(file.file_name()) {
            let mut state = file.state.write();
            collector.resize(state.file_size);
            state.file_stats = Some(collector);
        }
    }

    #[cfg(test)]
    pub(crate) fn registered_count(&self) -> usize {
        self.registry.lock().len()
    }
}

/// The adapter the engine talks to. Routes BUFFER and direct-I/O handles
/// straight to the file layer, everything else through the page buffer.
pub struct BufferedFileSystem {
    fs: Arc<WebFileSystem>,
    pages: Arc<FilePageBuffer>,
}

/// An open file as the engine sees it.
pub struct BufferedFileHandle {
    handle: WebFileHandle,
    direct: bool,
}

impl BufferedFileHandle {
    pub fn file(&self) -> &Arc<WebFile> {
        self.handle.file()
    }

    pub fn position(&self) -> u64 {
        self.handle.position()
    }

    fn direct_route(&self) -> bool {
        self.direct || self.handle.file().protocol() == DataProtocol::Buffer
    }
}

impl BufferedFileSystem {
    pub fn new(fs: Arc<WebFileSystem>, page_config: PageBufferConfig) -> Arc<Self> {
        Arc::new(Self {
            fs,
            pages: Arc::new(FilePageBuffer::new(page_config)),
        })
    }

    pub fn filesystem(&self) -> &Arc<WebFileSystem> {
        &self.fs
    }

    pub fn page_buffer(&self) -> &Arc<FilePageBuffer> {
        &self.pages
    }

    pub fn open(&self, path: &str, flags: OpenFlags) -> Result<BufferedFileHandle> {
        let handle = self.fs.open_file(path, flags)?;
        Ok(BufferedFileHandle {
            handle,
            direct: flags.direct_io,
        })
    }

    /// Seek is a handle-local position update; nothing is validated until
    /// the next read or write.
    pub fn seek(&self, handle: &BufferedFileHandle, position: u64) {
        handle.handle.seek(position);
    }

    pub fn read(&self, handle: &BufferedFileHandle, dst: &mut [u8]) -> Result<usize> {
        let position = handle.handle.position();
        let n = self.read_at(handle, dst, position)?;
        handle.handle.seek(position + n as u64);
        Ok(n)
    }

    pub fn read_at(&self, handle: &BufferedFileHandle, dst: &mut [u8], offset: u64) -> Result<usize> {
        if handle.direct_route() {
            handle.handle.read_at(dst, offset)
        } else {
            self.pages
                .read(self.fs.host(), handle.handle.file(), dst, offset)
        }
    }

    pub fn write(&self, handle: &BufferedFileHandle, src: &[u8]) -> Result<usize> {
        let position = handle.handle.position();
        let n = self.write_at(handle, src, position)?;
        handle.handle.seek(position + n as u64);
        Ok(n)
    }

    pub fn write_at(&self, handle: &BufferedFileHandle, src: &[u8], offset: u64) -> Result<usize> {
        if handle.direct_route() {
            handle.handle.write_at(src, offset)
        } else {
            let n = self
                .pages
                .write(self.fs.host(), handle.handle.file(), src, offset)?;
            self.fs.invalidate_readaheads(handle.handle.file().file_id());
            Ok(n)
        }
    }

    /// Truncation flushes and invalidates the file's pages first so no
    /// stale frame resurrects discarded bytes.
    pub fn truncate(&self, handle: &BufferedFileHandle, new_size: u64) -> Result<()> {
        let file_id = handle.handle.file().file_id();
        self.pages.flush_file(self.fs.host(), file_id)?;
        self.pages.invalidate_file(file_id);
        handle.handle.truncate(new_size)
    }

    pub fn file_size(&self, handle: &BufferedFileHandle) -> u64 {
        handle.handle.file_size()
    }

    pub fn last_modified(&self, handle: &BufferedFileHandle) -> Result<i64> {
        handle.handle.last_modified()
    }

    pub fn sync(&self, handle: &BufferedFileHandle) -> Result<()> {
        self.pages
            .flush_file(self.fs.host(), handle.handle.file().file_id())?;
        handle.handle.sync()
    }

    /// Every file is seekable through the handle position.
    pub fn can_seek(&self) -> bool {
        true
    }

    /// Report random access as cheap so the engine keeps its random-read
    /// plans enabled.
    pub fn on_disk_file(&self) -> bool {
        true
    }

    pub fn glob(&self, pattern: &str) -> Result<Vec<String>> {
        self.fs.glob_names(pattern)
    }

    pub fn dir_exists(&self, path: &str) -> bool {
        self.fs.host().dir_exists(path)
    }

    pub fn dir_create(&self, path: &str) -> Result<()> {
        self.fs.host().dir_create(path)
    }

    pub fn dir_remove(&self, path: &str) -> Result<()> {
        self.fs.host().dir_remove(path)
    }

    pub fn list_files(&self, path: &str) -> Result<Vec<String>> {
        self.fs.host().list_files(path)
    }

    pub fn file_exists(&self, path: &str) -> bool {
        self.fs.lookup(path).is_some() || self.fs.host().file_exists(path)
    }

    /// Moves within the host namespace. Registered in-memory names are not
    /// movable; their identity is their registration.
    pub fn file_move(&self, from: &str, to: &str) -> Result<()> {
        if self.fs.lookup(from).is_some() {
            return Err(Error::invalid(format!(
                "cannot move registered file {from}"
            )));
        }
        self.fs.host().file_move(from, to)
    }

    /// Flushes dirty pages of `name` back to the host.
    pub fn flush_file(&self, name: &str) -> Result<()> {
        if let Some(file) = self.fs.lookup(name) {
            self.pages.flush_file(self.fs.host(), file.file_id())?;
        }
        Ok(())
    }

    /// Flushes all dirty pages.
    pub fn flush_files(&self) -> Result<()> {
        self.pages.flush_files(self.fs.host())
    }

    /// Drops `name` from the page buffer and the registry, refusing while
    /// frames are pinned or dirty or handles are live.
    pub fn try_drop_file(&self, name: &str) -> bool {
        let Some(file) = self.fs.lookup(name) else {
            return true;
        };
        if !self.pages.try_drop_file(file.file_id()) {
            return false;
        }
        self.fs.try_drop(name)
    }
}
