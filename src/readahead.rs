//! Per-thread read-ahead windows for sequential access over non-buffered
//! protocols.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::file::FileState;
use crate::host::HostRuntime;
use crate::registry::FileId;
use crate::Result;

/// Smallest window fetched on a miss. Sequential scans with small request
/// sizes amortize one host round trip over many reads.
pub(crate) const READAHEAD_MIN: usize = 32 * 1024;

struct Window {
    file_id: FileId,
    offset: u64,
    data: Vec<u8>,
}

/// One thread's prefetch window: a single contiguous byte range of a single
/// file. Writers and truncation invalidate it through the registry.
#[derive(Default)]
pub(crate) struct ReadAheadBuffer {
    window: Option<Window>,
}

impl ReadAheadBuffer {
    fn hit(&self, file_id: FileId, offset: u64, len: usize) -> bool {
        self.window.as_ref().is_some_and(|w| {
            w.file_id == file_id
                && offset >= w.offset
                && offset + len as u64 <= w.offset + w.data.len() as u64
        })
    }

    /// Serves `dst` from the window, refilling it on a miss. The caller has
    /// already clamped `dst` to the file size and holds the file's shared
    /// lock, so the size cannot move underneath us.
    pub fn read(
        &mut self,
        host: &dyn HostRuntime,
        file_id: FileId,
        state: &FileState,
        dst: &mut [u8],
        offset: u64,
    ) -> Result<usize> {
        if self.hit(file_id, offset, dst.len()) {
            let window = self.window.as_ref().expect("hit implies a window");
            let start = (offset - window.offset) as usize;
            dst.copy_from_slice(&window.data[start..start + dst.len()]);
            if let Some(stats) = &state.file_stats {
                stats.record_cached(offset, dst.len());
            }
            return Ok(dst.len());
        }

        let window_len = dst
            .len()
            .max(READAHEAD_MIN)
            .min((state.file_size - offset) as usize);
        let mut data = vec![0u8; window_len];
        let fetched = match host.read(file_id, &mut data, offset) {
            Ok(n) => n,
            // A failed refill degrades to a plain host read of the request.
            Err(_) => {
                let n = host.read(file_id, dst, offset)?;
                if let Some(stats) = &state.file_stats {
                    stats.record_cold(offset, n);
                }
                return Ok(n);
            }
        };
        data.truncate(fetched);
        if let Some(stats) = &state.file_stats {
            stats.record_cold(offset, fetched);
        }
        let n = dst.len().min(fetched);
        dst[..n].copy_from_slice(&data[..n]);
        self.window = Some(Window {
            file_id,
            offset,
            data,
        });
        Ok(n)
    }

    pub fn invalidate(&mut self, file_id: FileId) {
        if self.window.as_ref().is_some_and(|w| w.file_id == file_id) {
            self.window = None;
        }
    }

    #[cfg(test)]
    pub(crate) fn holds(&self, file_id: FileId) -> bool {
        self.window.as_ref().is_some_and(|w| w.file_id == file_id)
    }
}

/// All read-ahead buffers of one filesystem, one per thread that has read
/// through it. The registry lock guards the map only; each buffer has its
/// own mutex because invalidation crosses threads.
#[derive(Default)]
pub(crate) struct ReadAheadRegistry {
    buffers: Mutex<FxHashMap<ThreadId, Arc<Mutex<ReadAheadBuffer>>>>,
}

impl ReadAheadRegistry {
    pub fn for_current_thread(&self) -> Arc<Mutex<ReadAheadBuffer>> {
        self.buffers
            .lock()
            .entry(thread::current().id())
            .or_default()
            .clone()
    }

    /// Clears every thread's window onto `file_id`.
    pub fn invalidate(&self, file_id: FileId) {
        let buffers: Vec<_> = self.buffers.lock().values().cloned().collect();
        for buffer in buffers {
            buffer.lock().invalidate(file_id);
        }
    }
}
