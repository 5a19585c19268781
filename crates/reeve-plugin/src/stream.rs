//! In-memory live log stream.
//!
//! A [`LogStream`] is an append-only buffer written by one producer and read
//! by any number of independent readers. Readers block for more data while
//! the stream is open and report end-of-stream once it is closed and
//! drained.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reeve_proto::{LogReader, LogReaderProvider, StreamError};
use tokio::sync::Notify;

#[derive(Debug, Default)]
struct State {
    data: Vec<u8>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    changed: Notify,
}

/// Append-only shared log buffer.
///
/// Cloning yields another handle to the same stream.
#[derive(Debug, Clone, Default)]
pub struct LogStream {
    shared: Arc<Shared>,
}

impl LogStream {
    /// Create an open, empty stream.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a closed stream holding `bytes`.
    #[must_use]
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        let stream = Self::new();
        {
            let mut state = stream.shared.state.lock();
            state.data = bytes.into();
            state.closed = true;
        }
        stream
    }

    /// Append bytes.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::Closed`] once the stream has been closed.
    pub fn write(&self, bytes: &[u8]) -> Result<usize, StreamError> {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(StreamError::Closed);
            }
            state.data.extend_from_slice(bytes);
        }
        self.shared.changed.notify_waiters();
        Ok(bytes.len())
    }

    /// Stop accepting writes. Readers drain what is buffered, then see
    /// end-of-stream.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        self.shared.changed.notify_waiters();
    }

    /// Returns true once the stream has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().data.len()
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A new reader positioned at the start.
    #[must_use]
    pub fn reader(&self) -> StreamReader {
        StreamReader {
            shared: Arc::clone(&self.shared),
            position: 0,
            closed: false,
        }
    }
}

/// Independent reader over a [`LogStream`].
#[derive(Debug)]
pub struct StreamReader {
    shared: Arc<Shared>,
    position: u64,
    closed: bool,
}

impl StreamReader {
    /// Copy up to `n` bytes at `offset`, waiting while the stream is open
    /// and has nothing there yet.
    async fn wait_read(&self, n: usize, offset: u64) -> Result<Vec<u8>, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        loop {
            let changed = self.shared.changed.notified();
            {
                let state = self.shared.state.lock();
                let len = state.data.len() as u64;
                if offset < len {
                    let start = offset as usize;
                    let end = start.saturating_add(n).min(state.data.len());
                    return Ok(state.data[start..end].to_vec());
                }
                if state.closed {
                    return Err(StreamError::Eof);
                }
                if n == 0 {
                    return Ok(Vec::new());
                }
            }
            changed.await;
        }
    }
}

#[async_trait]
impl LogReader for StreamReader {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        let data = self.wait_read(n, self.position).await?;
        self.position += data.len() as u64;
        Ok(data)
    }

    async fn read_at(&mut self, n: usize, offset: u64) -> Result<Vec<u8>, StreamError> {
        self.wait_read(n, offset).await
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError> {
        if self.closed {
            return Err(StreamError::Closed);
        }
        let len = self.shared.state.lock().data.len() as i64;
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => (self.position as i64)
                .checked_add(delta)
                .and_then(|p| u64::try_from(p).ok()),
            SeekFrom::End(delta) => len.checked_add(delta).and_then(|p| u64::try_from(p).ok()),
        };
        let position =
            target.ok_or_else(|| StreamError::InvalidSeek(format!("{pos:?} before start of stream")))?;
        self.position = position;
        Ok(position)
    }

    async fn size(&mut self) -> (i64, bool) {
        let state = self.shared.state.lock();
        (state.data.len() as i64, state.closed)
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.closed = true;
        Ok(())
    }
}

/// Log provider over an optional [`LogStream`].
///
/// Unavailable when there is no stream.
#[derive(Debug, Clone, Default)]
pub struct StreamProvider {
    stream: Option<LogStream>,
}

impl StreamProvider {
    /// Create a provider.
    #[must_use]
    pub const fn new(stream: Option<LogStream>) -> Self {
        Self { stream }
    }

    /// The stream, if any.
    #[must_use]
    pub const fn stream(&self) -> Option<&LogStream> {
        self.stream.as_ref()
    }
}

impl From<LogStream> for StreamProvider {
    fn from(stream: LogStream) -> Self {
        Self::new(Some(stream))
    }
}

#[async_trait]
impl LogReaderProvider for StreamProvider {
    fn available(&self) -> bool {
        self.stream.is_some()
    }

    async fn reader(&self) -> Result<Box<dyn LogReader>, StreamError> {
        match &self.stream {
            Some(stream) => Ok(Box::new(stream.reader())),
            None => Err(StreamError::Unavailable),
        }
    }

    async fn close(&self) -> Result<(), StreamError> {
        if let Some(stream) = &self.stream {
            stream.close();
        }
        Ok(())
    }
}
