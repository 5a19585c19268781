//! Connection broker.
//!
//! Multiplexes any number of logical connections over one byte transport:
//! - [`Broker`]: owns the transport tasks and the connection registry
//! - [`Side`]: which end of the transport this broker is, deciding the
//!   identifiers it allocates
//! - [`ServiceHandle`]: joinable, cancellable background task serving one
//!   accepted connection
//!
//! A connection is opened by one side calling [`Broker::allocate`] and
//! [`Broker::accept_and_serve`], passing the identifier to the peer inside
//! some call, and the peer calling [`Broker::dial`] with it.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::error::{PluginError, PluginResult};
use crate::protocol::{self, CONTROL_CONN, ConnId, Frame, FrameBody};
use crate::rpc::{Dispatch, RpcClient, Service};

/// Which end of the transport a broker sits on.
///
/// The host allocates odd identifiers and the plugin even ones, so that
/// identifiers allocated concurrently by both sides never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    /// The process that launched the plugin.
    Host,
    /// The plugin process.
    Plugin,
}

impl Side {
    /// First identifier this side allocates.
    #[must_use]
    pub const fn first_id(self) -> ConnId {
        match self {
            Self::Host => 1,
            Self::Plugin => 2,
        }
    }

    /// Returns true if `id` belongs to this side's numbering space.
    #[must_use]
    pub const fn owns(self, id: ConnId) -> bool {
        id != CONTROL_CONN && id % 2 == self.first_id() % 2
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Plugin => f.write_str("plugin"),
        }
    }
}

type Inbox = mpsc::UnboundedSender<FrameBody>;

/// Shared state behind every [`Broker`] handle and every connection.
pub(crate) struct BrokerInner {
    side: Side,
    config: BrokerConfig,
    next_id: AtomicU32,
    outbound: mpsc::Sender<Frame>,
    /// Connections waiting for the peer to dial.
    acceptors: Mutex<HashMap<ConnId, Inbox>>,
    /// Open connections, keyed by identifier.
    channels: Mutex<HashMap<ConnId, Inbox>>,
    shutdown: CancellationToken,
}

impl BrokerInner {
    /// Queue a frame for the transport.
    pub(crate) async fn send(&self, conn: ConnId, body: FrameBody) -> PluginResult<()> {
        if self.shutdown.is_cancelled() {
            return Err(PluginError::Connection("transport closed".to_string()));
        }
        self.outbound
            .send(Frame::new(conn, body))
            .await
            .map_err(|_| PluginError::Connection("transport closed".to_string()))
    }

    /// Queue a frame without waiting for room.
    pub(crate) fn try_send(&self, conn: ConnId, body: FrameBody) {
        if let Err(e) = self.outbound.try_send(Frame::new(conn, body)) {
            debug!(conn, error = %e, "frame not queued");
        }
    }

    /// Forget an open connection. Returns false if it was already gone.
    pub(crate) fn detach(&self, conn: ConnId) -> bool {
        self.channels.lock().remove(&conn).is_some()
    }

    /// A token cancelled when the transport is torn down.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub(crate) const fn config(&self) -> &BrokerConfig {
        &self.config
    }

    fn teardown(&self) {
        if !self.shutdown.is_cancelled() {
            info!(side = %self.side, "transport closed");
        }
        self.shutdown.cancel();
        self.acceptors.lock().clear();
        self.channels.lock().clear();
    }

    async fn route(&self, frame: Frame) {
        let Frame { conn, body } = frame;
        match body {
            FrameBody::Open => self.route_open(conn).await,
            FrameBody::Close => {
                let inbox = self.channels.lock().remove(&conn);
                match inbox {
                    Some(inbox) => {
                        debug!(conn, "peer closed connection");
                        let _ = inbox.send(FrameBody::Close);
                    }
                    None => debug!(conn, "close for unknown connection"),
                }
            }
            body => {
                let inbox = self.channels.lock().get(&conn).cloned();
                match inbox {
                    Some(inbox) => {
                        if inbox.send(body).is_err() {
                            debug!(conn, "connection stopped listening");
                        }
                    }
                    None => warn!(conn, frame = ?body, "dropping frame for unknown connection"),
                }
            }
        }
    }

    async fn route_open(&self, conn: ConnId) {
        let accepted = {
            let mut acceptors = self.acceptors.lock();
            acceptors.remove(&conn).inspect(|inbox| {
                self.channels.lock().insert(conn, inbox.clone());
            })
        };
        match accepted {
            Some(inbox) => {
                debug!(conn, "peer dialed connection");
                let _ = inbox.send(FrameBody::Open);
            }
            None => {
                warn!(conn, "refusing dial for connection nobody accepts");
                let reason = format!("connection {conn} is not being accepted");
                if let Err(e) = self.send(conn, FrameBody::Refused { reason }).await {
                    debug!(conn, error = %e, "refusal not delivered");
                }
            }
        }
    }

    /// Wait for the peer to dial an accepted connection.
    async fn await_open(
        &self,
        conn: ConnId,
        inbox: &mut mpsc::UnboundedReceiver<FrameBody>,
        cancel: &CancellationToken,
    ) -> bool {
        let first = tokio::select! {
            () = cancel.cancelled() => None,
            () = tokio::time::sleep(self.config.accept_timeout) => None,
            body = inbox.recv() => body,
        };
        let first = match first {
            Some(body) => Some(body),
            None => {
                let still_waiting = self.acceptors.lock().remove(&conn).is_some();
                if still_waiting {
                    debug!(conn, "stopped accepting before peer dialed");
                    None
                } else {
                    // the dial was routed while we gave up
                    inbox.recv().await
                }
            }
        };
        matches!(first, Some(FrameBody::Open))
    }

    async fn serve(
        self: Arc<Self>,
        conn: ConnId,
        mut inbox: mpsc::UnboundedReceiver<FrameBody>,
        service: Arc<dyn Service>,
        cancel: CancellationToken,
        await_open: bool,
    ) {
        let opened = !await_open || self.await_open(conn, &mut inbox, &cancel).await;
        if opened && await_open {
            if let Err(e) = self.send(conn, FrameBody::Accepted).await {
                debug!(conn, error = %e, "acceptance not delivered");
            }
        }

        let dispatch = service.dispatch();
        let mut in_flight = JoinSet::new();
        let mut peer_closed = false;
        while opened {
            let body = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(conn, error = %e, "request task failed");
                    }
                    continue;
                }
                body = inbox.recv() => body,
            };
            match body {
                Some(FrameBody::Request { seq, method, params }) => {
                    debug!(conn, seq, %method, ?dispatch, "serving request");
                    if dispatch == Dispatch::Concurrent {
                        in_flight.spawn(Arc::clone(&self).respond(
                            conn,
                            seq,
                            method,
                            params,
                            Arc::clone(&service),
                        ));
                        continue;
                    }
                    // a torn down transport cannot carry the response
                    let outcome = tokio::select! {
                        outcome = service.call(&method, params) => outcome,
                        () = self.shutdown.cancelled() => break,
                    };
                    if let Err(e) = self.send(conn, FrameBody::response(seq, outcome)).await {
                        debug!(conn, seq, error = %e, "response not delivered");
                        break;
                    }
                }
                Some(FrameBody::Close) | None => {
                    peer_closed = true;
                    break;
                }
                Some(other) => warn!(conn, frame = ?other, "unexpected frame on served connection"),
            }
        }

        // requests already being handled complete unless the transport is gone
        let drained = tokio::select! {
            () = async { while in_flight.join_next().await.is_some() {} } => true,
            () = self.shutdown.cancelled() => false,
        };
        if !drained {
            in_flight.abort_all();
        }

        if opened && !peer_closed && self.detach(conn) {
            if let Err(e) = self.send(conn, FrameBody::Close).await {
                debug!(conn, error = %e, "close not delivered");
            }
        }
        service.finish().await;
        debug!(conn, "stopped serving connection");
    }

    /// Handle one request on its own task.
    async fn respond(
        self: Arc<Self>,
        conn: ConnId,
        seq: u64,
        method: String,
        params: serde_json::Value,
        service: Arc<dyn Service>,
    ) {
        let outcome = service.call(&method, params).await;
        if !self.channels.lock().contains_key(&conn) {
            debug!(conn, seq, %method, "connection closed before response");
            return;
        }
        if let Err(e) = self.send(conn, FrameBody::response(seq, outcome)).await {
            debug!(conn, seq, error = %e, "response not delivered");
        }
    }
}

async fn read_frames<R>(inner: Arc<BrokerInner>, mut frames: FramedRead<R, LengthDelimitedCodec>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(bytes)) => match Frame::decode(&bytes) {
                Ok(frame) => inner.route(frame).await,
                Err(e) => warn!(error = %e, "dropping undecodable frame"),
            },
            Some(Err(e)) => {
                warn!(error = %e, "transport read failed");
                break;
            }
            None => break,
        }
    }
    inner.teardown();
}

async fn write_frames<W>(
    inner: Arc<BrokerInner>,
    mut outbound: mpsc::Receiver<Frame>,
    mut sink: FramedWrite<W, LengthDelimitedCodec>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            () = inner.shutdown.cancelled() => break,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };
        let bytes = match frame.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(conn = frame.conn, error = %e, "dropping unencodable frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Bytes::from(bytes)).await {
            warn!(error = %e, "transport write failed");
            break;
        }
    }
    // flush what is already queued so a final close reaches the peer
    while let Ok(frame) = outbound.try_recv() {
        let Ok(bytes) = frame.encode() else { continue };
        if sink.send(Bytes::from(bytes)).await.is_err() {
            break;
        }
    }
    let _ = SinkExt::<Bytes>::close(&mut sink).await;
    inner.teardown();
}

/// Multiplexes logical connections over one transport.
///
/// Cloning yields another handle to the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    /// Start a broker on `transport`.
    ///
    /// Spawns the transport reader and writer tasks; must be called within a
    /// tokio runtime.
    pub fn new<T>(transport: T, side: Side, config: BrokerConfig) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(transport);
        let (outbound, outbound_rx) = mpsc::channel(config.channel_buffer.max(1));
        let inner = Arc::new(BrokerInner {
            side,
            config,
            next_id: AtomicU32::new(side.first_id()),
            outbound,
            acceptors: Mutex::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });

        let frames = FramedRead::new(read_half, protocol::codec(config.max_frame_length));
        let sink = FramedWrite::new(write_half, protocol::codec(config.max_frame_length));
        tokio::spawn(read_frames(Arc::clone(&inner), frames));
        tokio::spawn(write_frames(Arc::clone(&inner), outbound_rx, sink));
        info!(%side, "broker started");

        Self { inner }
    }

    /// Which end of the transport this broker is.
    #[must_use]
    pub fn side(&self) -> Side {
        self.inner.side
    }

    /// The broker's configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        self.inner.config()
    }

    /// Allocate a fresh connection identifier.
    ///
    /// Identifiers are never reused for the lifetime of the transport.
    pub fn allocate(&self) -> ConnId {
        self.inner.next_id.fetch_add(2, Ordering::Relaxed)
    }

    /// Serve `service` on `id` once the peer dials it.
    ///
    /// The acceptor is registered before this returns, so the identifier can
    /// be handed to the peer right away. Serving stops when the peer closes
    /// the connection, the handle is cancelled, no dial arrives within the
    /// accept timeout, or the transport closes.
    pub fn accept_and_serve<S: Service>(&self, id: ConnId, service: S) -> PluginResult<ServiceHandle> {
        if id == CONTROL_CONN {
            return Err(PluginError::Protocol(
                "the control connection is not dialed".to_string(),
            ));
        }
        let inbox = self.register(id, true)?;
        Ok(self.spawn_service(id, inbox, Arc::new(service), true))
    }

    /// Serve `service` on the control connection.
    pub fn serve_control<S: Service>(&self, service: S) -> PluginResult<ServiceHandle> {
        let inbox = self.register(CONTROL_CONN, false)?;
        Ok(self.spawn_service(CONTROL_CONN, inbox, Arc::new(service), false))
    }

    /// Open a connection the peer is accepting.
    ///
    /// Fails with a connection error if the peer refuses, does not answer
    /// within the dial timeout, or the transport closes.
    pub async fn dial(&self, id: ConnId) -> PluginResult<RpcClient> {
        if id == CONTROL_CONN {
            return Err(PluginError::Protocol(
                "the control connection is not dialed".to_string(),
            ));
        }
        let mut inbox = self.register(id, false)?;
        self.inner.send(id, FrameBody::Open).await.inspect_err(|_| {
            self.inner.detach(id);
        })?;

        let answer = tokio::time::timeout(self.inner.config.dial_timeout, inbox.recv()).await;
        match answer {
            Ok(Some(FrameBody::Accepted)) => {
                debug!(conn = id, "dialed connection");
                Ok(RpcClient::start(id, Arc::clone(&self.inner), inbox))
            }
            Ok(Some(FrameBody::Refused { reason })) => {
                self.inner.detach(id);
                Err(PluginError::Connection(format!("dial {id} refused: {reason}")))
            }
            Ok(Some(other)) => {
                self.inner.detach(id);
                Err(PluginError::Protocol(format!("unexpected answer to dial {id}: {other:?}")))
            }
            Ok(None) => Err(PluginError::Connection(format!(
                "transport closed while dialing {id}"
            ))),
            Err(_) => {
                if self.inner.detach(id) {
                    self.inner.try_send(id, FrameBody::Close);
                }
                Err(PluginError::Connection(format!("dial {id} timed out")))
            }
        }
    }

    /// Client on the control connection.
    pub fn control_client(&self) -> PluginResult<RpcClient> {
        let inbox = self.register(CONTROL_CONN, false)?;
        Ok(RpcClient::start(CONTROL_CONN, Arc::clone(&self.inner), inbox))
    }

    /// Returns true once the transport has been torn down.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Resolves once the transport has been torn down.
    pub async fn closed(&self) {
        self.inner.shutdown.cancelled().await;
    }

    /// Tear down the transport, stopping every service and failing every
    /// pending dial and call.
    pub fn shutdown(&self) {
        self.inner.teardown();
    }

    /// Number of open connections, the control connection included.
    #[must_use]
    pub fn open_connections(&self) -> usize {
        self.inner.channels.lock().len()
    }

    fn register(
        &self,
        id: ConnId,
        accepting: bool,
    ) -> PluginResult<mpsc::UnboundedReceiver<FrameBody>> {
        if self.is_closed() {
            return Err(PluginError::Connection("transport closed".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let mut acceptors = self.inner.acceptors.lock();
        let mut channels = self.inner.channels.lock();
        if acceptors.contains_key(&id) || channels.contains_key(&id) {
            return Err(PluginError::Connection(format!("connection {id} already in use")));
        }
        if accepting {
            acceptors.insert(id, tx);
        } else {
            channels.insert(id, tx);
        }
        Ok(rx)
    }

    fn spawn_service(
        &self,
        id: ConnId,
        inbox: mpsc::UnboundedReceiver<FrameBody>,
        service: Arc<dyn Service>,
        await_open: bool,
    ) -> ServiceHandle {
        let cancel = self.inner.child_token();
        let task = tokio::spawn(Arc::clone(&self.inner).serve(
            id,
            inbox,
            service,
            cancel.clone(),
            await_open,
        ));
        ServiceHandle {
            conn: id,
            cancel,
            task,
        }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("side", &self.inner.side)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Background task serving one connection.
#[derive(Debug)]
pub struct ServiceHandle {
    conn: ConnId,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServiceHandle {
    /// The served connection.
    #[must_use]
    pub const fn conn(&self) -> ConnId {
        self.conn
    }

    /// Stop serving. Requests already being handled complete first.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the task has ended and its finish hook has run.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the task to end.
    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(conn = self.conn, error = %e, "service task failed");
        }
    }

    /// Cancel and wait for the task to end.
    pub async fn shutdown(self) {
        self.cancel();
        self.join().await;
    }
}

#[cfg(test)]
#[path = "broker_tests.rs"]
mod tests;
