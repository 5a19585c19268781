//! Streamed log bridge.
//!
//! When a status notification carries available logs, the host serves the
//! log provider on a fresh connection. Each reader the plugin asks for gets
//! a further connection of its own, so remote logs are read incrementally
//! instead of being shipped whole.
//!
//! Closing a [`LogReaderProviderClient`] is deferred-propagating: every
//! reader it produced closes its connection once its current operation has
//! completed, and refuses further operations.

use std::io::SeekFrom;
use std::sync::Arc;

use async_trait::async_trait;
use reeve_proto::{LogReader, LogReaderProvider, StreamError};
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{PluginError, RemoteError};
use crate::protocol::{
    ReadAtParams, ReadParams, ReadReply, ReaderReply, SeekParams, SeekReply, SizeReply, methods,
};
use crate::rpc::{Dispatch, RpcClient, Service, parse_params, to_json, unknown_method};

// ─────────────────────────────────────────────────────────────
// Host side
// ─────────────────────────────────────────────────────────────

/// Serves a local log provider.
pub struct LogReaderProviderServer {
    provider: Arc<dyn LogReaderProvider>,
    broker: Broker,
}

impl LogReaderProviderServer {
    /// Serve `provider`, opening reader connections on `broker`.
    #[must_use]
    pub fn new(provider: Arc<dyn LogReaderProvider>, broker: Broker) -> Self {
        Self { provider, broker }
    }

    async fn open_reader(&self) -> Result<ReaderReply, RemoteError> {
        let reader = self.provider.reader().await.map_err(stream_to_remote)?;
        let conn = self.broker.allocate();
        let server = LogReaderServer::new(reader, self.broker.config().max_read_chunk);
        self.broker
            .accept_and_serve(conn, server)
            .map_err(|e| e.to_remote())?;
        debug!(conn, "serving log reader");
        Ok(ReaderReply { conn })
    }
}

#[async_trait]
impl Service for LogReaderProviderServer {
    async fn call(&self, method: &str, _params: Value) -> Result<Value, RemoteError> {
        match method {
            methods::READER => to_json(&self.open_reader().await?),
            // the provider belongs to the host; the plugin only drops its view
            methods::PROVIDER_CLOSE => Ok(Value::Null),
            other => Err(unknown_method(other)),
        }
    }

    fn dispatch(&self) -> Dispatch {
        Dispatch::Concurrent
    }
}

/// Serves one local log reader.
///
/// Requests are handled in order so reads observe a consistent position.
/// The reader is closed once the connection stops being served.
pub struct LogReaderServer {
    reader: AsyncMutex<Box<dyn LogReader>>,
    max_read_chunk: usize,
}

impl LogReaderServer {
    /// Serve `reader`, returning at most `max_read_chunk` bytes per read.
    #[must_use]
    pub fn new(reader: Box<dyn LogReader>, max_read_chunk: usize) -> Self {
        Self {
            reader: AsyncMutex::new(reader),
            max_read_chunk: max_read_chunk.max(1),
        }
    }
}

#[async_trait]
impl Service for LogReaderServer {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        let mut reader = self.reader.lock().await;
        match method {
            methods::READ => {
                let ReadParams { n } = parse_params(params)?;
                let data = reader
                    .read(n.min(self.max_read_chunk))
                    .await
                    .map_err(stream_to_remote)?;
                to_json(&ReadReply { data })
            }
            methods::READ_AT => {
                let ReadAtParams { n, offset } = parse_params(params)?;
                let data = reader
                    .read_at(n.min(self.max_read_chunk), offset)
                    .await
                    .map_err(stream_to_remote)?;
                to_json(&ReadReply { data })
            }
            methods::SEEK => {
                let params: SeekParams = parse_params(params)?;
                let pos = params.to_seek_from().map_err(|e| e.to_remote())?;
                let position = reader.seek(pos).await.map_err(stream_to_remote)?;
                to_json(&SeekReply { position })
            }
            methods::SIZE => {
                let (size, closed) = reader.size().await;
                to_json(&SizeReply { size, closed })
            }
            // closing the connection is what releases the reader
            methods::READER_CLOSE => Ok(Value::Null),
            other => Err(unknown_method(other)),
        }
    }

    async fn finish(&self) {
        if let Err(e) = self.reader.lock().await.close().await {
            warn!(error = %e, "failed to close log reader");
        }
    }
}

fn stream_to_remote(err: StreamError) -> RemoteError {
    PluginError::from(err).to_remote()
}

// ─────────────────────────────────────────────────────────────
// Plugin side
// ─────────────────────────────────────────────────────────────

/// Log provider backed by a provider connection to the host.
pub struct LogReaderProviderClient {
    client: RpcClient,
    broker: Broker,
    close_requested: CancellationToken,
}

impl LogReaderProviderClient {
    /// Wrap a dialed provider connection.
    #[must_use]
    pub fn new(client: RpcClient, broker: Broker) -> Self {
        Self {
            client,
            broker,
            close_requested: CancellationToken::new(),
        }
    }

    /// The provider connection.
    #[must_use]
    pub fn conn(&self) -> crate::protocol::ConnId {
        self.client.conn()
    }
}

#[async_trait]
impl LogReaderProvider for LogReaderProviderClient {
    fn available(&self) -> bool {
        !self.close_requested.is_cancelled() && !self.client.is_closed()
    }

    async fn reader(&self) -> Result<Box<dyn LogReader>, StreamError> {
        if self.close_requested.is_cancelled() {
            return Err(StreamError::Closed);
        }
        let ReaderReply { conn } = self.client.invoke(methods::READER, &()).await?;
        let client = self.broker.dial(conn).await?;
        Ok(Box::new(LogReaderClient::new(
            client,
            self.close_requested.child_token(),
        )))
    }

    async fn close(&self) -> Result<(), StreamError> {
        self.close_requested.cancel();
        self.client.close().await;
        Ok(())
    }
}

/// Log reader backed by a reader connection to the host.
pub struct LogReaderClient {
    client: RpcClient,
    op_lock: Arc<AsyncMutex<()>>,
    close_requested: CancellationToken,
    _watcher: DropGuard,
}

impl LogReaderClient {
    /// Wrap a dialed reader connection.
    ///
    /// Once `close_requested` fires, the connection is closed as soon as no
    /// operation is in flight. Dropping the reader closes it too.
    #[must_use]
    pub fn new(client: RpcClient, close_requested: CancellationToken) -> Self {
        let op_lock = Arc::new(AsyncMutex::new(()));
        let dropped = CancellationToken::new();
        tokio::spawn(close_when_requested(
            client.clone(),
            Arc::clone(&op_lock),
            close_requested.clone(),
            dropped.clone(),
        ));
        Self {
            client,
            op_lock,
            close_requested,
            _watcher: dropped.drop_guard(),
        }
    }

    /// The reader connection.
    #[must_use]
    pub fn conn(&self) -> crate::protocol::ConnId {
        self.client.conn()
    }

    async fn read_reply<P>(&self, method: &str, params: &P, n: usize) -> Result<Vec<u8>, StreamError>
    where
        P: serde::Serialize + Sync,
    {
        let _op = self.begin().await?;
        let ReadReply { mut data } = self.client.invoke(method, params).await?;
        data.truncate(n);
        Ok(data)
    }

    async fn begin(&self) -> Result<tokio::sync::MutexGuard<'_, ()>, StreamError> {
        if self.close_requested.is_cancelled() {
            return Err(StreamError::Closed);
        }
        let guard = self.op_lock.lock().await;
        if self.client.is_closed() {
            return Err(StreamError::Closed);
        }
        Ok(guard)
    }
}

async fn close_when_requested(
    client: RpcClient,
    op_lock: Arc<AsyncMutex<()>>,
    close_requested: CancellationToken,
    dropped: CancellationToken,
) {
    tokio::select! {
        () = close_requested.cancelled() => {
            let _op = op_lock.lock().await;
            debug!(conn = client.conn(), "closing log reader on provider close");
            client.close().await;
        }
        () = dropped.cancelled() => {
            debug!(conn = client.conn(), "closing dropped log reader");
            client.close().await;
        }
        () = client.closed() => {}
    }
}

#[async_trait]
impl LogReader for LogReaderClient {
    async fn read(&mut self, n: usize) -> Result<Vec<u8>, StreamError> {
        self.read_reply(methods::READ, &ReadParams { n }, n).await
    }

    async fn read_at(&mut self, n: usize, offset: u64) -> Result<Vec<u8>, StreamError> {
        self.read_reply(methods::READ_AT, &ReadAtParams { n, offset }, n)
            .await
    }

    async fn seek(&mut self, pos: SeekFrom) -> Result<u64, StreamError> {
        let params = SeekParams::try_from(pos)?;
        let _op = self.begin().await?;
        let SeekReply { position } = self.client.invoke(methods::SEEK, &params).await?;
        Ok(position)
    }

    async fn size(&mut self) -> (i64, bool) {
        let Ok(_op) = self.begin().await else {
            return (-1, true);
        };
        match self.client.invoke::<_, SizeReply>(methods::SIZE, &()).await {
            Ok(SizeReply { size, closed }) => (size, closed),
            Err(e) => {
                debug!(conn = self.client.conn(), error = %e, "size query failed");
                (-1, true)
            }
        }
    }

    async fn close(&mut self) -> Result<(), StreamError> {
        self.client.close().await;
        Ok(())
    }
}
