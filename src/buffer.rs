//! Growable owned byte region backing in-memory files.

/// An owned, contiguous, growable byte buffer.
///
/// The buffer is never shared: ownership moves into the [`WebFile`] it backs.
/// Growth is exponential (2.25× the current capacity, or the requested size
/// if larger) so repeated appends stay amortized-cheap; shrinking below half
/// the capacity reallocates down so a truncated file does not hold on to its
/// peak footprint.
///
/// [`WebFile`]: crate::file::WebFile
#[derive(Debug, Default)]
pub struct DataBuffer {
    data: Vec<u8>,
}

impl DataBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self { data: bytes }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Resizes the logical size to `n` bytes, zero-filling any extension.
    pub fn resize(&mut self, n: usize) {
        let cap = self.data.capacity();
        if n > cap {
            let grown = cap.saturating_mul(2).saturating_add(cap / 4).max(n);
            self.data.reserve_exact(grown - self.data.len());
        } else if n < cap / 2 {
            let mut shrunk = Vec::with_capacity(n);
            shrunk.extend_from_slice(&self.data[..n]);
            self.data = shrunk;
        }
        self.data.resize(n, 0);
    }

    /// Copies `src` into the buffer at `offset`, extending it when the write
    /// reaches past the current size.
    pub fn write_at(&mut self, offset: u64, src: &[u8]) {
        let end = offset as usize + src.len();
        if end > self.data.len() {
            self.resize(end);
        }
        self.data[offset as usize..end].copy_from_slice(src);
    }

    /// Copies up to `dst.len()` bytes starting at `offset` into `dst`,
    /// returning how many bytes were available.
    pub fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize {
        let size = self.data.len() as u64;
        if offset >= size {
            return 0;
        }
        let n = dst.len().min((size - offset) as usize);
        dst[..n].copy_from_slice(&self.data[offset as usize..offset as usize + n]);
        n
    }
}

impl From<Vec<u8>> for DataBuffer {
    fn from(bytes: Vec<u8>) -> Self {
        Self::from_bytes(bytes)
    }
}
