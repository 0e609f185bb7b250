//! The virtual file registry: name ↔ id ↔ file record.

use std::sync::Arc;

use regex::Regex;
use rustc_hash::FxHashMap;

use crate::file::WebFile;
use crate::{Error, Result};

/// Opaque file identifier, stable within a process lifetime. Ids may be
/// reused after their file is dropped.
pub type FileId = u32;

/// Where a registered file's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataProtocol {
    /// Bytes live in the process, in a [`DataBuffer`](crate::DataBuffer).
    Buffer,
    /// Opened through the host's native filesystem.
    Native,
    /// Read through host HTTP GETs, range-supporting preferred.
    Http,
}

impl DataProtocol {
    /// Infers the protocol from a url or path string, returning the protocol
    /// and the location with any scheme prefix stripped.
    pub fn infer(url: &str) -> (Self, &str) {
        if url.starts_with("http://") || url.starts_with("https://") {
            (Self::Http, url)
        } else if let Some(path) = url.strip_prefix("file://") {
            (Self::Native, path)
        } else {
            (Self::Native, url)
        }
    }

    /// Wire encoding used in file-info JSON.
    pub fn code(self) -> u8 {
        match self {
            Self::Buffer => 0,
            Self::Native => 1,
            Self::Http => 2,
        }
    }
}

/// Translates a glob pattern into an anchored regex.
///
/// `*` matches within one path segment, `**` across segments, `?` a single
/// character; everything else is literal.
pub(crate) fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' => {
                if chars.peek() == Some(&'*') {
                    chars.next();
                    out.push_str(".*");
                } else {
                    out.push_str("[^/]*");
                }
            }
            '?' => out.push_str("[^/]"),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    Regex::new(&out).map_err(|err| Error::invalid(format!("bad glob pattern: {err}")))
}

/// Both registry maps plus the id allocator, guarded as one unit by the
/// filesystem's `fs_mutex`. Non-reentrant: nothing in here calls back into
/// the filesystem.
#[derive(Default)]
pub(crate) struct FileRegistry {
    files_by_id: FxHashMap<FileId, Arc<WebFile>>,
    files_by_name: FxHashMap<String, Arc<WebFile>>,
    next_file_id: FileId,
}

impl FileRegistry {
    pub fn allocate_id(&mut self) -> FileId {
        loop {
            let id = self.next_file_id;
            self.next_file_id = self.next_file_id.wrapping_add(1);
            if !self.files_by_id.contains_key(&id) {
                return id;
            }
        }
    }

    pub fn insert(&mut self, file: Arc<WebFile>) {
        self.files_by_id.insert(file.file_id(), file.clone());
        self.files_by_name.insert(file.file_name().to_owned(), file);
    }

    pub fn by_name(&self, name: &str) -> Option<&Arc<WebFile>> {
        self.files_by_name.get(name)
    }

    pub fn by_id(&self, id: FileId) -> Option<&Arc<WebFile>> {
        self.files_by_id.get(&id)
    }

    /// Removes the record from both maps. The `Arc` keeps the file alive for
    /// any handle still holding it.
    pub fn remove(&mut self, file: &WebFile) {
        self.files_by_id.remove(&file.file_id());
        self.files_by_name.remove(file.file_name());
    }

    /// Removes every file with no live handle, returning the removed records
    /// so the caller can close host resources outside the lock.
    pub fn drain_dangling(&mut self) -> Vec<Arc<WebFile>> {
        let dangling: Vec<Arc<WebFile>> = self
            .files_by_name
            .values()
            .filter(|file| file.handle_count() == 0)
            .cloned()
            .collect();
        for file in &dangling {
            self.remove(file);
        }
        dangling
    }

    /// Registered names matching an anchored glob pattern.
    pub fn matching_names(&self, matcher: &Regex) -> Vec<String> {
        self.files_by_name
            .keys()
            .filter(|name| matcher.is_match(name))
            .cloned()
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.files_by_name.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_inference() {
        assert_eq!(
            DataProtocol::infer("https://example.com/x.parquet"),
            (DataProtocol::Http, "https://example.com/x.parquet")
        );
        assert_eq!(
            DataProtocol::infer("http://example.com/x"),
            (DataProtocol::Http, "http://example.com/x")
        );
        assert_eq!(
            DataProtocol::infer("file:///tmp/data.csv"),
            (DataProtocol::Native, "/tmp/data.csv")
        );
        assert_eq!(
            DataProtocol::infer("plain/path.csv"),
            (DataProtocol::Native, "plain/path.csv")
        );
    }

    #[test]
    fn glob_translation_is_anchored() {
        let m = glob_to_regex("data/*.csv").unwrap();
        assert!(m.is_match("data/a.csv"));
        assert!(!m.is_match("data/sub/a.csv"));
        assert!(!m.is_match("xdata/a.csv"));
        assert!(!m.is_match("data/a.csv.bak"));

        let m = glob_to_regex("**/*.parquet").unwrap();
        assert!(m.is_match("a/b/c.parquet"));

        let m = glob_to_regex("file-?.bin").unwrap();
        assert!(m.is_match("file-1.bin"));
        assert!(!m.is_match("file-10.bin"));

        // regex metacharacters in names are literal
        let m = glob_to_regex("a+b.csv").unwrap();
        assert!(m.is_match("a+b.csv"));
        assert!(!m.is_match("aab.csv"));
    }

    #[test]
    fn id_allocation_skips_live_ids() {
        let mut registry = FileRegistry::default();
        let a = registry.allocate_id();
        let b = registry.allocate_id();
        assert_ne!(a, b);
    }
}
