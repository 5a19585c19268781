//! Log reader capabilities.
//!
//! A [`LogReaderProvider`] hands out independent [`LogReader`]s over a live,
//! possibly still growing, byte stream. Both traits are object safe so that
//! local streams and bridge-backed stand-ins can be used interchangeably.

use std::io::SeekFrom;

use async_trait::async_trait;

use crate::error::StreamError;

/// A live remote or local byte stream.
#[async_trait]
pub trait LogReader: Send + Sync {
    /// Read up to `n` bytes from the current position.
    ///
    /// Returns [`StreamError::Eof`] once the stream is closed and drained.
    async fn read(&mut self, n: usize) -> Result<Vec<u8>, StreamError>;

    /// Read up to `n` bytes starting at an absolute `offset`, without moving
    /// the current position.
    async fn read_at(&mut self, n: usize, offset: u64) -> Result<Vec<u8>, StreamError>;

    /// Move the current position and return the new absolute position.
    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError>;

    /// Current size and whether the stream has been closed by its writer.
    ///
    /// Unreachable streams report `(-1, true)`.
    async fn size(&mut self) -> (i64, bool);

    /// Release the reader.
    async fn close(&mut self) -> Result<(), StreamError>;
}

/// Produces log readers for one pipeline activity.
#[async_trait]
pub trait LogReaderProvider: Send + Sync {
    /// Whether a reader can currently be produced.
    fn available(&self) -> bool;

    /// Produce a new reader positioned at the start of the stream.
    async fn reader(&self) -> Result<Box<dyn LogReader>, StreamError>;

    /// Release the provider.
    async fn close(&self) -> Result<(), StreamError>;
}

/// Stand-in provider for "no logs attached".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NoLogs;

#[async_trait]
impl LogReaderProvider for NoLogs {
    fn available(&self) -> bool {
        false
    }

    async fn reader(&self) -> Result<Box<dyn LogReader>, StreamError> {
        Err(StreamError::Unavailable)
    }

    async fn close(&self) -> Result<(), StreamError> {
        Ok(())
    }
}
