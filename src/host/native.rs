//! `std::fs` host adapter for native targets.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::UNIX_EPOCH;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use super::{HostFile, HostRuntime, OpenedFile};
use crate::registry::{glob_to_regex, DataProtocol, FileId};
use crate::{Error, Result};

/// Scratch state of one calling thread: the handles it has opened so far.
///
/// Handles are never shared across threads; each thread that touches a file
/// opens its own descriptor on first access.
#[derive(Default)]
struct LocalState {
    open_handles: FxHashMap<FileId, File>,
}

/// Host runtime backed by the local filesystem.
///
/// HTTP sources are rejected with [`Error::NotSupported`]; embedders that
/// want remote files in a native process bring their own adapter.
#[derive(Default)]
pub struct NativeHostRuntime {
    /// Path of every file the core has opened, so late-coming threads can
    /// open their own descriptor.
    paths: Mutex<FxHashMap<FileId, PathBuf>>,
    /// Registry of per-thread states. The registry lock only guards the map;
    /// individual states are owned by their thread.
    states: Mutex<FxHashMap<ThreadId, Arc<Mutex<LocalState>>>>,
}

impl NativeHostRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn local_state(&self) -> Arc<Mutex<LocalState>> {
        let mut states = self.states.lock();
        states
            .entry(thread::current().id())
            .or_insert_with(|| Arc::new(Mutex::new(LocalState::default())))
            .clone()
    }

    fn with_handle<T>(&self, file_id: FileId, f: impl FnOnce(&mut File) -> Result<T>) -> Result<T> {
        let state = self.local_state();
        let mut state = state.lock();
        if !state.open_handles.contains_key(&file_id) {
            let path = self
                .paths
                .lock()
                .get(&file_id)
                .cloned()
                .ok_or_else(|| Error::key(format!("unknown file id {file_id}")))?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)?;
            state.open_handles.insert(file_id, file);
        }
        f(state.open_handles.get_mut(&file_id).expect("just inserted"))
    }
}

impl HostRuntime for NativeHostRuntime {
    fn open(&self, file: &HostFile) -> Result<OpenedFile> {
        if file.protocol == DataProtocol::Http {
            return Err(Error::not_supported(
                "HTTP sources require a host with network access",
            ));
        }
        let path = PathBuf::from(file.location());
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let file_size = handle.metadata()?.len();
        self.paths.lock().insert(file.file_id, path);
        self.local_state()
            .lock()
            .open_handles
            .insert(file.file_id, handle);
        Ok(OpenedFile {
            file_size,
            inline_buffer: None,
        })
    }

    fn close(&self, file_id: FileId) {
        self.paths.lock().remove(&file_id);
        let states: Vec<_> = self.states.lock().values().cloned().collect();
        for state in states {
            state.lock().open_handles.remove(&file_id);
        }
    }

    fn sync(&self, file_id: FileId) -> Result<()> {
        self.with_handle(file_id, |file| Ok(file.sync_data()?))
    }

    fn truncate(&self, file_id: FileId, new_size: u64) -> Result<()> {
        self.with_handle(file_id, |file| Ok(file.set_len(new_size)?))
    }

    fn last_modified(&self, file_id: FileId) -> Result<i64> {
        self.with_handle(file_id, |file| {
            let modified = file.metadata()?.modified()?;
            let secs = modified
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or(0);
            Ok(secs)
        })
    }

    fn read(&self, file_id: FileId, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.with_handle(file_id, |file| {
            file.seek(SeekFrom::Start(offset))?;
            let mut total = 0;
            while total < buf.len() {
                let n = file.read(&mut buf[total..])?;
                if n == 0 {
                    break;
                }
                total += n;
            }
            Ok(total)
        })
    }

    fn write(&self, file_id: FileId, buf: &[u8], offset: u64) -> Result<usize> {
        self.with_handle(file_id, |file| {
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(buf.len())
        })
    }

    fn dir_exists(&self, path: &str) -> bool {
        fs::metadata(path).map(|m| m.is_dir()).unwrap_or(false)
    }

    fn dir_create(&self, path: &str) -> Result<()> {
        Ok(fs::create_dir_all(path)?)
    }

    fn dir_remove(&self, path: &str) -> Result<()> {
        Ok(fs::remove_dir_all(path)?)
    }

    fn list_files(&self, path: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(path)? {
            names.push(entry?.path().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    fn file_exists(&self, path: &str) -> bool {
        fs::metadata(path).map(|m| m.is_file()).unwrap_or(false)
    }

    fn file_move(&self, from: &str, to: &str) -> Result<()> {
        Ok(fs::rename(from, to)?)
    }

    fn glob(&self, pattern: &str) -> Vec<String> {
        // Expand against the parent directory of the pattern; patterns with
        // wildcards in intermediate components are not expanded natively.
        let path = PathBuf::from(pattern);
        let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) else {
            return match self.file_exists(pattern) {
                true => vec![pattern.to_owned()],
                false => Vec::new(),
            };
        };
        let Some(file_pattern) = path.file_name().map(|n| n.to_string_lossy()) else {
            return Vec::new();
        };
        let Ok(matcher) = glob_to_regex(&file_pattern) else {
            return Vec::new();
        };
        let Ok(entries) = fs::read_dir(parent) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if matcher.is_match(&name) {
                out.push(parent.join(name).to_string_lossy().into_owned());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn host_file(file_id: FileId, path: &std::path::Path) -> HostFile {
        HostFile {
            file_id,
            file_name: path.to_string_lossy().into_owned(),
            protocol: DataProtocol::Native,
            data_url: None,
            data_fd: None,
            allow_full_http_reads: false,
        }
    }

    #[test]
    fn open_write_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let host = NativeHostRuntime::new();

        let opened = host.open(&host_file(1, &path)).unwrap();
        assert_eq!(opened.file_size, 0);
        assert!(opened.inline_buffer.is_none());

        assert_eq!(host.write(1, b"hello world", 0).unwrap(), 11);
        let mut buf = [0u8; 5];
        assert_eq!(host.read(1, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        host.truncate(1, 5).unwrap();
        let mut rest = [0u8; 16];
        assert_eq!(host.read(1, &mut rest, 0).unwrap(), 5);
        host.close(1);
        assert!(host.read(1, &mut rest, 0).is_err());
    }

    #[test]
    fn http_is_rejected() {
        let host = NativeHostRuntime::new();
        let file = HostFile {
            file_id: 7,
            file_name: "remote.parquet".into(),
            protocol: DataProtocol::Http,
            data_url: Some("https://example.com/remote.parquet".into()),
            data_fd: None,
            allow_full_http_reads: true,
        };
        assert!(matches!(host.open(&file), Err(Error::NotSupported(_))));
    }

    #[test]
    fn glob_matches_directory_entries() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["a.csv", "b.csv", "c.json"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let host = NativeHostRuntime::new();
        let pattern = dir.path().join("*.csv").to_string_lossy().into_owned();
        let mut matches = host.glob(&pattern);
        matches.sort();
        assert_eq!(matches.len(), 2);
        assert!(matches[0].ends_with("a.csv"));
        assert!(matches[1].ends_with("b.csv"));
    }
}
