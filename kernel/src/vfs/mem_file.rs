use super::{File, Result};
use crate::sync::Mutex;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicUsize, Ordering};

/// A fixed-length file held in kernel memory.
#[derive(Debug, Default)]
pub struct MemFile {
    data: Mutex<Vec<u8>>,
    reads: AtomicUsize,
    writes: AtomicUsize,
}

impl MemFile {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of `read_at` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }

    /// Number of `write_at` calls served so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

fn span(len: usize, offset: u64, want: usize) -> core::ops::Range<usize> {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(len);
    start..start.saturating_add(want).min(len)
}

impl File for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.lock();
        let range = span(data.len(), offset, buf.len());
        let n = range.len();
        buf[..n].copy_from_slice(&data[range]);
        Ok(n)
    }

    // Files do not grow; bytes past the end are dropped.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        let mut data = self.data.lock();
        let range = span(data.len(), offset, buf.len());
        let n = range.len();
        data[range].copy_from_slice(&buf[..n]);
        Ok(n)
    }
}
