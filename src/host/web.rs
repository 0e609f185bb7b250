//! Browser host adapter: OPFS sync access handles + synchronous XHR.
//!
//! Because [`FileSystemSyncAccessHandle`] acquisition is asynchronous while
//! the core's I/O is blocking, handles are acquired up front with
//! [`WebHostRuntime::acquire`] (from the worker's async setup code) and the
//! blocking calls operate on the pooled handle. This only works inside a
//! dedicated worker, the same restriction the sync access API itself has.
//!
//! HTTP sources are served with synchronous `XMLHttpRequest` range requests;
//! a server that ignores `Range` gets its body downloaded whole and handed
//! back inline so the caller can keep the file in memory.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{
    FileSystemDirectoryHandle, FileSystemFileHandle, FileSystemGetDirectoryOptions,
    FileSystemGetFileOptions, FileSystemReadWriteOptions, FileSystemSyncAccessHandle,
    WorkerGlobalScope, XmlHttpRequest,
};

use super::{HostFile, HostRuntime, OpenedFile};
use crate::registry::{glob_to_regex, DataProtocol, FileId};
use crate::{Error, Result};

enum WebHandle {
    Opfs(FileSystemSyncAccessHandle),
    Http { url: String, size: u64 },
}

#[derive(Default)]
pub struct WebHostRuntime {
    /// Access handles acquired ahead of time, keyed by the normalized
    /// segment key of [`pool_key`].
    pooled: Mutex<FxHashMap<String, FileSystemSyncAccessHandle>>,
    /// Handles of currently open files.
    open: Mutex<FxHashMap<FileId, WebHandle>>,
}

// Safety: the JS handle objects inside `pooled` and `open` pin this type to
// the dedicated-worker thread it was built on, and a wasm build has no
// second thread to move them to, so `Send`/`Sync` hold vacuously. What the
// bounds must not paper over is the maps themselves: `acquire`/`release`
// run from the worker's async setup and interleave, across their await
// points, with blocking reads and writes on the same thread. The two
// mutexes keep every map update whole across those suspension points.
unsafe impl Send for WebHostRuntime {}
unsafe impl Sync for WebHostRuntime {}

impl WebHostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the OPFS access handle backing `path`, creating the file
    /// and intermediate directories as needed. Must run (from the worker's
    /// async setup) before the core opens the file.
    pub async fn acquire(&self, path: &str) -> Result<()> {
        let segments = path_segments(path)?;
        let handle = open_access_handle(&segments).await?;
        self.pooled.lock().insert(segments.join("/"), handle);
        Ok(())
    }

    /// Releases a pooled handle that the core is not using.
    pub fn release(&self, path: &str) {
        if let Ok(key) = pool_key(path)
            && let Some(handle) = self.pooled.lock().remove(&key)
        {
            handle.close();
        }
    }

    fn with_opfs<T>(
        &self,
        file_id: FileId,
        f: impl FnOnce(&FileSystemSyncAccessHandle) -> Result<T>,
    ) -> Result<T> {
        let open = self.open.lock();
        match open.get(&file_id) {
            Some(WebHandle::Opfs(handle)) => f(handle),
            Some(WebHandle::Http { .. }) => {
                Err(Error::not_supported("operation on an HTTP source"))
            }
            None => Err(Error::key(format!("unknown file id {file_id}"))),
        }
    }
}

impl HostRuntime for WebHostRuntime {
    fn open(&self, file: &HostFile) -> Result<OpenedFile> {
        match file.protocol {
            DataProtocol::Http => {
                let url = file
                    .data_url
                    .clone()
                    .ok_or_else(|| Error::invalid("HTTP file without a url"))?;
                let probe = http_head(&url)?;
                if probe.accepts_ranges {
                    self.open.lock().insert(
                        file.file_id,
                        WebHandle::Http {
                            url,
                            size: probe.content_length,
                        },
                    );
                    Ok(OpenedFile {
                        file_size: probe.content_length,
                        inline_buffer: None,
                    })
                } else if file.allow_full_http_reads {
                    let body = http_get(&url, None)?;
                    Ok(OpenedFile {
                        file_size: body.len() as u64,
                        inline_buffer: Some(body),
                    })
                } else {
                    Err(Error::Http {
                        code: probe.status,
                        message: format!("server does not accept range requests: {url}"),
                    })
                }
            }
            _ => {
                let key = pool_key(file.location())?;
                let handle = self
                    .pooled
                    .lock()
                    .remove(&key)
                    .ok_or_else(|| Error::io(format!("no acquired OPFS handle for {key}")))?;
                let file_size = handle.get_size().map_err(Error::from)? as u64;
                self.open.lock().insert(file.file_id, WebHandle::Opfs(handle));
                Ok(OpenedFile {
                    file_size,
                    inline_buffer: None,
                })
            }
        }
    }

    fn close(&self, file_id: FileId) {
        if let Some(WebHandle::Opfs(handle)) = self.open.lock().remove(&file_id) {
            handle.close();
        }
    }

    fn sync(&self, file_id: FileId) -> Result<()> {
        self.with_opfs(file_id, |handle| Ok(handle.flush().map_err(Error::from)?))
    }

    fn truncate(&self, file_id: FileId, new_size: u64) -> Result<()> {
        self.with_opfs(file_id, |handle| {
            Ok(handle
                .truncate_with_f64(new_size as f64)
                .map_err(Error::from)?)
        })
    }

    fn last_modified(&self, _file_id: FileId) -> Result<i64> {
        // The sync access API exposes no mtime.
        Ok(0)
    }

    fn read(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<usize> {
        let open = self.open.lock();
        match open.get(&file_id) {
            Some(WebHandle::Opfs(handle)) => {
                let options = FileSystemReadWriteOptions::new();
                options.set_at(offset as f64);
                let n = handle
                    .read_with_u8_array_and_options(buf, &options)
                    .map_err(Error::from)?;
                Ok(n as usize)
            }
            Some(WebHandle::Http { url, size }) => {
                if offset >= *size {
                    return Ok(0);
                }
                let end = (*size).min(offset + buf.len() as u64);
                let body = http_get(url, Some((offset, end - 1)))?;
                let n = body.len().min(buf.len());
                buf[..n].copy_from_slice(&body[..n]);
                Ok(n)
            }
            None => Err(Error::key(format!("unknown file id {file_id}"))),
        }
    }

    fn write(&self, file_id: FileId, buf: &[u8], offset: u64) -> Result<usize> {
        let open = self.open.lock();
        match open.get(&file_id) {
            Some(WebHandle::Opfs(handle)) => {
                let options = FileSystemReadWriteOptions::new();
                options.set_at(offset as f64);
                let n = handle
                    .write_with_u8_array_and_options(buf, &options)
                    .map_err(Error::from)?;
                Ok(n as usize)
            }
            Some(WebHandle::Http { .. }) => {
                Err(Error::not_supported("writes to HTTP sources"))
            }
            None => Err(Error::key(format!("unknown file id {file_id}"))),
        }
    }

    fn dir_exists(&self, path: &str) -> bool {
        let Ok(prefix) = pool_key(path) else {
            return false;
        };
        self.pooled
            .lock()
            .keys()
            .any(|name| name.starts_with(&format!("{prefix}/")))
    }

    fn dir_create(&self, _path: &str) -> Result<()> {
        // Directories materialize when handles under them are acquired.
        Ok(())
    }

    fn dir_remove(&self, path: &str) -> Result<()> {
        let prefix = pool_key(path)?;
        let mut pooled = self.pooled.lock();
        let doomed: Vec<String> = pooled
            .keys()
            .filter(|name| name.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect();
        for name in doomed {
            if let Some(handle) = pooled.remove(&name) {
                handle.close();
            }
        }
        Ok(())
    }

    fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let prefix = pool_key(path)?;
        Ok(self
            .pooled
            .lock()
            .keys()
            .filter(|name| name.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect())
    }

    fn file_exists(&self, path: &str) -> bool {
        let Ok(key) = pool_key(path) else {
            return false;
        };
        self.pooled.lock().contains_key(&key)
    }

    fn file_move(&self, _from: &str, _to: &str) -> Result<()> {
        Err(Error::not_supported("renames on pooled OPFS handles"))
    }

    fn glob(&self, pattern: &str) -> Vec<String> {
        let Ok(matcher) = glob_to_regex(pattern) else {
            return Vec::new();
        };
        self.pooled
            .lock()
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect()
    }
}

struct HttpProbe {
    status: u16,
    content_length: u64,
    accepts_ranges: bool,
}

fn http_head(url: &str) -> Result<HttpProbe> {
    let xhr = XmlHttpRequest::new().map_err(Error::from)?;
    xhr.open_with_async("HEAD", url, false).map_err(Error::from)?;
    xhr.send().map_err(Error::from)?;
    let status = xhr.status().map_err(Error::from)?;
    if !(200..300).contains(&status) {
        return Err(Error::Http {
            code: status,
            message: format!("HEAD {url} failed"),
        });
    }
    let content_length = xhr
        .get_response_header("Content-Length")
        .ok()
        .flatten()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let accepts_ranges = xhr
        .get_response_header("Accept-Ranges")
        .ok()
        .flatten()
        .is_some_and(|v| v.eq_ignore_ascii_case("bytes"));
    Ok(HttpProbe {
        status,
        content_length,
        accepts_ranges,
    })
}

/// Synchronous GET, optionally ranged. Binary data travels through the
/// classic user-defined charset override: each char code's low byte is one
/// payload byte.
fn http_get(url: &str, range: Option<(u64, u64)>) -> Result<Vec<u8>> {
    let xhr = XmlHttpRequest::new().map_err(Error::from)?;
    xhr.open_with_async("GET", url, false).map_err(Error::from)?;
    xhr.override_mime_type("text/plain; charset=x-user-defined")
        .map_err(Error::from)?;
    if let Some((start, end)) = range {
        xhr.set_request_header("Range", &format!("bytes={start}-{end}"))
            .map_err(Error::from)?;
    }
    xhr.send().map_err(Error::from)?;
    let status = xhr.status().map_err(Error::from)?;
    if !(200..300).contains(&status) {
        return Err(Error::Http {
            code: status,
            message: format!("GET {url} failed"),
        });
    }
    let text = xhr
        .response_text()
        .map_err(Error::from)?
        .unwrap_or_default();
    Ok(text.chars().map(|c| (c as u32 & 0xFF) as u8).collect())
}

/// Splits a path into its normalized segments, the key format of the
/// handle pool. Empty and `.` segments collapse; `..` never resolves
/// inside the origin-private namespace and is rejected.
fn path_segments(path: &str) -> Result<Vec<String>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(Error::invalid(format!(
                    "parent components do not resolve in the sandbox: {path}"
                )));
            }
            segment => segments.push(segment.to_owned()),
        }
    }
    if segments.is_empty() {
        return Err(Error::invalid(format!("not a file path: {path:?}")));
    }
    Ok(segments)
}

/// The pool key for `path`.
fn pool_key(path: &str) -> Result<String> {
    path_segments(path).map(|segments| segments.join("/"))
}

/// Downcasts a host-returned value, folding a wrong runtime type into this
/// adapter's error convention.
fn cast<T: JsCast>(value: JsValue, what: &str) -> Result<T> {
    value
        .dyn_into::<T>()
        .map_err(|_| Error::io(format!("host returned an unexpected value for {what}")))
}

/// Walks the origin-private root down through `segments`, creating
/// directories and the file as needed, and opens the blocking access
/// handle on the final segment.
async fn open_access_handle(segments: &[String]) -> Result<FileSystemSyncAccessHandle> {
    let scope: WorkerGlobalScope = cast(js_sys::global().into(), "the worker scope")?;
    let mut dir: FileSystemDirectoryHandle = cast(
        JsFuture::from(scope.navigator().storage().get_directory())
            .await
            .map_err(Error::from)?,
        "the storage root",
    )?;

    let (file_name, dir_names) = segments.split_last().expect("segments are never empty");
    let dir_options = FileSystemGetDirectoryOptions::new();
    dir_options.set_create(true);
    for name in dir_names {
        dir = cast(
            JsFuture::from(dir.get_directory_handle_with_options(name, &dir_options))
                .await
                .map_err(Error::from)?,
            name,
        )?;
    }

    let file_options = FileSystemGetFileOptions::new();
    file_options.set_create(true);
    let file: FileSystemFileHandle = cast(
        JsFuture::from(dir.get_file_handle_with_options(file_name, &file_options))
            .await
            .map_err(Error::from)?,
        file_name,
    )?;
    cast(
        JsFuture::from(file.create_sync_access_handle())
            .await
            .map_err(Error::from)?,
        file_name,
    )
}
