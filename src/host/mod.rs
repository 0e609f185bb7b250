//! The host runtime boundary.
//!
//! Everything the core cannot do inside the sandbox — opening real files,
//! issuing HTTP range requests, listing directories — goes through the
//! [`HostRuntime`] trait. The core never reaches for the platform directly,
//! so the same registry/paging machinery runs against `std::fs` natively and
//! against OPFS + `XMLHttpRequest` inside a web worker.
//!
//! Adapters keep their scratch state (open handles, pending glob results)
//! per execution context internally; the core hands them a self-contained
//! [`HostFile`] descriptor on open and addresses subsequent calls by file id.

mod native;
#[cfg(target_family = "wasm")]
mod web;

pub use native::NativeHostRuntime;
#[cfg(target_family = "wasm")]
pub use web::WebHostRuntime;

use crate::registry::{DataProtocol, FileId};
use crate::Result;

/// Descriptor handed to [`HostRuntime::open`].
///
/// Carries everything the host needs to locate the source, so the adapter
/// never has to consult the file registry.
#[derive(Debug, Clone)]
pub struct HostFile {
    pub file_id: FileId,
    pub file_name: String,
    pub protocol: DataProtocol,
    pub data_url: Option<String>,
    pub data_fd: Option<u32>,
    /// Whether a non-ranged HTTP source may be answered by downloading the
    /// whole body inline.
    pub allow_full_http_reads: bool,
}

impl HostFile {
    /// The path or url the host should open.
    pub fn location(&self) -> &str {
        self.data_url.as_deref().unwrap_or(&self.file_name)
    }
}

/// Result of opening a file through the host.
#[derive(Debug)]
pub struct OpenedFile {
    pub file_size: u64,
    /// When the source cannot serve ranged reads (e.g. an HTTP server
    /// without `Range` support), the host returns the complete contents here
    /// and the caller promotes the file to an in-memory buffer.
    pub inline_buffer: Option<Vec<u8>>,
}

/// Capability set the sandboxed environment provides to the filesystem.
///
/// Offsets and sizes are plain `u64`; hosts whose numeric type cannot carry
/// more than 2^53 (a JavaScript `number`) are outside contract above that.
pub trait HostRuntime: Send + Sync {
    fn open(&self, file: &HostFile) -> Result<OpenedFile>;

    /// Closes the host-side handle. Infallible by contract: a close that
    /// fails has nothing actionable for the caller, adapters log and drop.
    fn close(&self, file_id: FileId);

    fn sync(&self, file_id: FileId) -> Result<()>;

    fn truncate(&self, file_id: FileId, new_size: u64) -> Result<()>;

    /// Last modification time in seconds since the epoch.
    fn last_modified(&self, file_id: FileId) -> Result<i64>;

    /// Reads up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes read. Zero means end of file.
    fn read(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<usize>;

    /// Writes `buf` at `offset`, returning the number of bytes written.
    fn write(&self, file_id: FileId, buf: &[u8], offset: u64) -> Result<usize>;

    fn dir_exists(&self, path: &str) -> bool;

    fn dir_create(&self, path: &str) -> Result<()>;

    fn dir_remove(&self, path: &str) -> Result<()>;

    fn list_files(&self, path: &str) -> Result<Vec<String>>;

    fn file_exists(&self, path: &str) -> bool;

    fn file_move(&self, from: &str, to: &str) -> Result<()>;

    /// Expands `pattern` against the host's own namespace. Names already in
    /// the registry are matched by the caller; the union is the glob result.
    fn glob(&self, pattern: &str) -> Vec<String>;
}
