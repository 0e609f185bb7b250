//! Virtual filesystem and file-page buffering core for an embedded
//! analytical database running in a sandboxed (browser-like) host.
//!
//! The crate turns heterogeneous data sources — in-process buffers, files
//! behind the host's native filesystem, and remote HTTP urls — into one
//! coherent, seekable, cacheable file interface:
//!
//! - a [file registry](WebFileSystem) mapping logical names to data sources
//!   of three protocols ([`DataProtocol`]),
//! - a bounded, shared [page buffer](FilePageBuffer) with LRU eviction,
//!   dirty write-back and a direct-I/O bypass,
//! - per-thread read-ahead for sequential scans over non-buffered
//!   protocols,
//! - per-file page [access statistics](FileStatisticsCollector),
//! - and the [`WebDB`] facade wiring an opaque SQL engine (supplied through
//!   the [`EngineFactory`] traits) to all of it, with query results
//!   marshalled as Arrow IPC buffers.
//!
//! The platform boundary is the [`HostRuntime`] trait: `std::fs` natively,
//! OPFS sync access handles plus synchronous XHR in a web worker.

mod buffer;
mod connection;
mod db;
mod engine;
mod error;
mod file;
mod filesystem;
mod host;
mod ipc;
mod page_buffer;
mod readahead;
mod registry;
mod stats;
#[cfg(test)]
mod testing;

pub use buffer::DataBuffer;
pub use connection::Connection;
pub use db::{WebDB, WebDBConfig};
pub use engine::{
    ArrowInsertOptions, CsvInsertOptions, EngineConnection, EngineFactory, JsonInsertOptions,
    JsonTableShape, PreparedQuery, QueryEngine, QueryResult, ScalarParam, TokenizeResult,
};
pub use error::Error;
pub use file::{WebFile, WebFileHandle};
pub use filesystem::{
    BufferedFileHandle, BufferedFileSystem, FileSystemConfig, OpenFlags, WebFileSystem,
};
#[cfg(target_family = "wasm")]
pub use host::WebHostRuntime;
pub use host::{HostFile, HostRuntime, NativeHostRuntime, OpenedFile};
pub use page_buffer::{
    AccessIntent, FilePageBuffer, PageBufferConfig, PinnedPage, DEFAULT_PAGE_SIZE,
    DEFAULT_POOL_BYTES,
};
pub use registry::{DataProtocol, FileId};
pub use stats::FileStatisticsCollector;

pub type Result<T, E = Error> = std::result::Result<T, E>;
