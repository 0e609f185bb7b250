//! The database facade: engine lifecycle, file registration, statistics and
//! the connection factory.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use tracing::debug;

use crate::connection::Connection;
use crate::engine::{EngineFactory, QueryEngine, TokenizeResult};
use crate::file::WebFileHandle;
use crate::filesystem::{
    BufferedFileSystem, FileSystemConfig, OpenFlags, WebFileSystem,
};
use crate::page_buffer::{PageBufferConfig, DEFAULT_PAGE_SIZE};
use crate::registry::FileId;
use crate::{Error, Result};

/// Database configuration, parsed from the `open` payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebDBConfig {
    /// Empty or `":memory:"` selects a writable in-memory database; any
    /// other path opens read-only.
    pub path: String,
    pub maximum_threads: u32,
    /// When false, 64-bit integer result columns are rewritten to double
    /// precision before serialization.
    pub emit_bigint: bool,
    pub filesystem: FileSystemConfig,
}

impl Default for WebDBConfig {
    fn default() -> Self {
        Self {
            path: String::new(),
            maximum_threads: 1,
            emit_bigint: true,
            filesystem: FileSystemConfig::default(),
        }
    }
}

impl WebDBConfig {
    pub fn in_memory(&self) -> bool {
        self.path.is_empty() || self.path == ":memory:"
    }

    pub fn read_only(&self) -> bool {
        !self.in_memory()
    }
}

struct DbState {
    config: WebDBConfig,
    filesystem: Arc<BufferedFileSystem>,
    engine: Arc<dyn QueryEngine>,
    /// Handles held on behalf of the embedder so registered files survive
    /// with no active engine handle.
    pinned_web_files: FxHashMap<String, WebFileHandle>,
}

/// Owns one engine instance plus the filesystem it runs on.
///
/// Reconfiguring through [`open`](Self::open) builds a fresh filesystem and
/// engine; connections created before that keep the old engine alive until
/// they are dropped, but see no new files.
pub struct WebDB {
    host: Arc<dyn crate::host::HostRuntime>,
    factory: Arc<dyn EngineFactory>,
    state: Mutex<DbState>,
}

impl WebDB {
    /// Creates the database with the default (in-memory) configuration.
    pub fn new(
        host: Arc<dyn crate::host::HostRuntime>,
        factory: Arc<dyn EngineFactory>,
    ) -> Result<Self> {
        let state = Self::build_state(&host, &factory, WebDBConfig::default())?;
        Ok(Self {
            host,
            factory,
            state: Mutex::new(state),
        })
    }

    /// Reconstructs the engine against `config_json`: fresh filesystem,
    /// fresh page buffer, no registered files, no pins.
    pub fn open(&self, config_json: &str) -> Result<()> {
        let config: WebDBConfig = if config_json.trim().is_empty() {
            WebDBConfig::default()
        } else {
            serde_json::from_str(config_json)
                .map_err(|err| Error::invalid(format!("bad database config: {err}")))?
        };
        debug!(path = config.path, "reconstructing engine");
        let state = Self::build_state(&self.host, &self.factory, config)?;
        *self.state.lock() = state;
        Ok(())
    }

    /// Re-opens with the current configuration.
    pub fn reset(&self) -> Result<()> {
        let config = self.state.lock().config.clone();
        let state = Self::build_state(&self.host, &self.factory, config)?;
        *self.state.lock() = state;
        Ok(())
    }

    fn build_state(
        host: &Arc<dyn crate::host::HostRuntime>,
        factory: &Arc<dyn EngineFactory>,
        config: WebDBConfig,
    ) -> Result<DbState> {
        let web_fs = WebFileSystem::new(
            host.clone(),
            config.filesystem.clone(),
            DEFAULT_PAGE_SIZE as u32,
        );
        let filesystem = BufferedFileSystem::new(web_fs, PageBufferConfig::default());
        let engine = factory.create(filesystem.clone(), &config)?;
        Ok(DbState {
            config,
            filesystem,
            engine,
            pinned_web_files: FxHashMap::default(),
        })
    }

    pub fn config(&self) -> WebDBConfig {
        self.state.lock().config.clone()
    }

    pub fn filesystem(&self) -> Arc<BufferedFileSystem> {
        self.state.lock().filesystem.clone()
    }

    /// Opens a new session.
    pub fn connect(&self) -> Result<Connection> {
        let (engine, filesystem, emit_bigint) = {
            let state = self.state.lock();
            (
                state.engine.clone(),
                state.filesystem.clone(),
                state.config.emit_bigint,
            )
        };
        let conn = engine.connect()?;
        Ok(Connection::new(conn, filesystem, emit_bigint))
    }

    /// Registers `name` against a url and pins it so it outlives engine
    /// handles.
    pub fn register_file_url(&self, name: &str, url: &str, size: Option<u64>) -> Result<()> {
        let mut state = self.state.lock();
        Self::drop_pinned(&mut state, name)?;
        let handle = state
            .filesystem
            .filesystem()
            .register_url(name, url, size)?;
        state.pinned_web_files.insert(name.to_owned(), handle);
        Ok(())
    }

    /// Registers `name` with in-process bytes, replacing any previous
    /// registration, and pins it.
    pub fn register_file_buffer(&self, name: &str, bytes: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        Self::drop_pinned(&mut state, name)?;
        let handle = state.filesystem.filesystem().register_buffer(name, bytes)?;
        state.pinned_web_files.insert(name.to_owned(), handle);
        Ok(())
    }

    /// Releases a previous registration of `name`. The page buffer must not
    /// be holding modified or pinned frames for it.
    fn drop_pinned(state: &mut DbState, name: &str) -> Result<()> {
        if let Some(file) = state.filesystem.filesystem().lookup(name)
            && !state.filesystem.page_buffer().try_drop_file(file.file_id())
        {
            return Err(Error::invalid(
                "File is already registered and is still buffered",
            ));
        }
        state.pinned_web_files.remove(name);
        Ok(())
    }

    /// Drops `name` entirely: page frames, pin, registry record. Fails
    /// `Busy` while other handles or pinned frames hold it.
    pub fn drop_file(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.filesystem.filesystem().lookup(name)
            && !state.filesystem.page_buffer().try_drop_file(file.file_id())
        {
            return Err(Error::Busy);
        }
        state.pinned_web_files.remove(name);
        match state.filesystem.filesystem().try_drop(name) {
            true => Ok(()),
            false => Err(Error::Busy),
        }
    }

    /// Drops every file no handle is holding, releasing all pins first.
    pub fn drop_files(&self) {
        let mut state = self.state.lock();
        state.pinned_web_files.clear();
        state.filesystem.filesystem().drop_dangling();
    }

    /// Writes every dirty page back to the host.
    pub fn flush_files(&self) -> Result<()> {
        self.state.lock().filesystem.flush_files()
    }

    /// Writes the dirty pages of one file back to the host.
    pub fn flush_file(&self, name: &str) -> Result<()> {
        self.state.lock().filesystem.flush_file(name)
    }

    pub fn set_file_fd(&self, file_id: FileId, fd: u32) -> Result<()> {
        self.state.lock().filesystem.filesystem().set_fd(file_id, fd)
    }

    pub fn get_file_info_by_name(&self, name: &str) -> Result<serde_json::Value> {
        self.state
            .lock()
            .filesystem
            .filesystem()
            .file_info_by_name(name)
    }

    pub fn get_file_info_by_id(&self, file_id: FileId) -> Result<serde_json::Value> {
        self.state
            .lock()
            .filesystem
            .filesystem()
            .file_info_by_id(file_id)
    }

    /// File info for every registered name matching the pattern.
    pub fn glob_file_infos(&self, pattern: &str) -> Result<Vec<serde_json::Value>> {
        let filesystem = self.state.lock().filesystem.clone();
        let names = filesystem.glob(pattern)?;
        Ok(names
            .iter()
            .filter_map(|name| filesystem.filesystem().file_info_by_name(name).ok())
            .collect())
    }

    pub fn enable_file_statistics(&self, name: &str, enable: bool) {
        self.state
            .lock()
            .filesystem
            .filesystem()
            .enable_statistics(name, enable);
    }

    /// The collected statistics of `name` in the stable binary layout.
    pub fn export_file_statistics(&self, name: &str) -> Result<Vec<u8>> {
        self.state
            .lock()
            .filesystem
            .filesystem()
            .export_statistics(name)
    }

    /// Reads the whole registered file into an owned buffer.
    pub fn copy_file_to_buffer(&self, name: &str) -> Result<Vec<u8>> {
        let filesystem = self.state.lock().filesystem.clone();
        if filesystem.filesystem().lookup(name).is_none() {
            return Err(Error::key(format!("unknown file {name}")));
        }
        let handle = filesystem.open(name, OpenFlags::default())?;
        let size = filesystem.file_size(&handle) as usize;
        let mut out = vec![0u8; size];
        let mut done = 0;
        while done < size {
            let n = filesystem.read_at(&handle, &mut out[done..], done as u64)?;
            if n == 0 {
                break;
            }
            done += n;
        }
        out.truncate(done);
        Ok(out)
    }

    /// Copies the contents of `name` into the host file `out`.
    pub fn copy_file_to_path(&self, name: &str, out: &str) -> Result<()> {
        let filesystem = self.state.lock().filesystem.clone();
        let src = filesystem.open(name, OpenFlags::default())?;
        let dst = filesystem.open(
            out,
            OpenFlags {
                create_new: true,
                direct_io: false,
            },
        )?;
        let size = filesystem.file_size(&src);
        let mut chunk = vec![0u8; 64 * 1024];
        let mut offset = 0u64;
        while offset < size {
            let n = filesystem.read_at(&src, &mut chunk, offset)?;
            if n == 0 {
                break;
            }
            filesystem.write_at(&dst, &chunk[..n], offset)?;
            offset += n as u64;
        }
        filesystem.flush_file(out)?;
        Ok(())
    }

    /// Tokenizes `text` for editor highlighting; pass-through from the
    /// engine.
    pub fn tokenize(&self, text: &str) -> TokenizeResult {
        let engine = self.state.lock().engine.clone();
        engine.tokenize(text)
    }
}
