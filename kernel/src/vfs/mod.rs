//! The part of the file layer that paging consumes: positioned reads and
//! writes on an open file.

pub mod mem_file;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Error {
    /// the underlying device failed
    #[error("I/O error")]
    Io,
}

pub type Result<T> = core::result::Result<T, Error>;

/// An open file.
///
/// Both operations return the number of bytes transferred, which is less
/// than requested only at the end of the file.
pub trait File: Send + Sync {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
}
