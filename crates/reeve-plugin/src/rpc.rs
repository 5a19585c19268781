//! Request/response calls over one logical connection.
//!
//! The side that dials a connection is its client and holds an
//! [`RpcClient`]; the side that accepts it serves a [`Service`]. Responses
//! are correlated by sequence number, so any number of callers may share one
//! client concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::broker::BrokerInner;
use crate::error::{ErrorKind, PluginError, PluginResult, RemoteError};
use crate::protocol::{ConnId, FrameBody};

/// How a served connection handles its requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dispatch {
    /// One at a time, in the order the client issued them.
    #[default]
    Sequential,
    /// Each request on its own task, so a slow or re-entrant call does not
    /// hold up the rest. Responses may complete out of order.
    Concurrent,
}

/// Server half of a logical connection.
#[async_trait]
pub trait Service: Send + Sync + 'static {
    /// Handle one request.
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError>;

    /// How requests on this connection are dispatched.
    fn dispatch(&self) -> Dispatch {
        Dispatch::Sequential
    }

    /// Runs exactly once after the connection stops being served.
    async fn finish(&self) {}
}

/// Decode request parameters.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, RemoteError> {
    serde_json::from_value(params).map_err(|e| RemoteError::protocol(format!("invalid params: {e}")))
}

/// Encode a result.
pub fn to_json<T: Serialize>(value: &T) -> Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError::domain(format!("failed to encode result: {e}")))
}

/// Error returned for a method the service does not know.
#[must_use]
pub fn unknown_method(method: &str) -> RemoteError {
    RemoteError::new(ErrorKind::NotImplemented, format!("unknown method: {method}"))
}

type Waiter = oneshot::Sender<Result<Value, RemoteError>>;

struct ClientState {
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: CancellationToken,
}

struct ClientInner {
    conn: ConnId,
    broker: Arc<BrokerInner>,
    next_seq: AtomicU64,
    state: Arc<ClientState>,
}

impl ClientInner {
    fn closed_error(&self) -> PluginError {
        PluginError::Connection(format!("connection {} closed", self.conn))
    }

    async fn close(&self) {
        if self.state.closed.is_cancelled() {
            return;
        }
        self.state.closed.cancel();
        if self.broker.detach(self.conn) {
            debug!(conn = self.conn, "closing connection");
            if let Err(e) = self.broker.send(self.conn, FrameBody::Close).await {
                debug!(conn = self.conn, error = %e, "close not delivered");
            }
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        if self.state.closed.is_cancelled() {
            return;
        }
        self.state.closed.cancel();
        if self.broker.detach(self.conn) {
            self.broker.try_send(self.conn, FrameBody::Close);
        }
    }
}

/// Client half of a logical connection.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

impl RpcClient {
    /// Start a client on a connection whose frames arrive on `inbox`.
    pub(crate) fn start(
        conn: ConnId,
        broker: Arc<BrokerInner>,
        inbox: mpsc::UnboundedReceiver<FrameBody>,
    ) -> Self {
        let state = Arc::new(ClientState {
            pending: Mutex::new(HashMap::new()),
            closed: broker.child_token(),
        });
        tokio::spawn(dispatch_responses(conn, Arc::clone(&state), inbox));
        Self {
            inner: Arc::new(ClientInner {
                conn,
                broker,
                next_seq: AtomicU64::new(1),
                state,
            }),
        }
    }

    /// The connection this client calls over.
    #[must_use]
    pub fn conn(&self) -> ConnId {
        self.inner.conn
    }

    /// Returns true once the connection is closed, by either side or by
    /// transport loss.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.closed.is_cancelled()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.state.closed.cancelled().await;
    }

    /// Call `method` and wait for its result.
    ///
    /// There is no timeout; callers that need one race this future against
    /// their own timer. Abandoning the future does not cancel the remote work.
    pub async fn call(&self, method: &str, params: Value) -> PluginResult<Value> {
        let inner = &self.inner;
        let seq = inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        inner.state.pending.lock().insert(seq, tx);
        if inner.state.closed.is_cancelled() {
            inner.state.pending.lock().remove(&seq);
            return Err(inner.closed_error());
        }

        let request = FrameBody::Request {
            seq,
            method: method.to_string(),
            params,
        };
        if let Err(e) = inner.broker.send(inner.conn, request).await {
            inner.state.pending.lock().remove(&seq);
            return Err(e);
        }

        match rx.await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(remote)) => Err(PluginError::from_remote(remote)),
            Err(_) => Err(inner.closed_error()),
        }
    }

    /// Call `method` with typed parameters and result.
    pub async fn invoke<P, R>(&self, method: &str, params: &P) -> PluginResult<R>
    where
        P: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params)?;
        let result = self.call(method, params).await?;
        serde_json::from_value(result)
            .map_err(|e| PluginError::Protocol(format!("invalid result for {method}: {e}")))
    }

    /// Close the connection. Idempotent.
    pub async fn close(&self) {
        self.inner.close().await;
    }
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("conn", &self.inner.conn)
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn dispatch_responses(
    conn: ConnId,
    state: Arc<ClientState>,
    mut inbox: mpsc::UnboundedReceiver<FrameBody>,
) {
    loop {
        let body = tokio::select! {
            () = state.closed.cancelled() => None,
            body = inbox.recv() => body,
        };
        match body {
            Some(FrameBody::Response { seq, result, error }) => {
                let outcome = match error {
                    Some(err) => Err(err),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                match state.pending.lock().remove(&seq) {
                    Some(waiter) => {
                        let _ = waiter.send(outcome);
                    }
                    None => debug!(conn, seq, "dropping response nobody waits for"),
                }
            }
            Some(FrameBody::Close) => {
                debug!(conn, "connection closed by peer");
                break;
            }
            Some(other) => warn!(conn, frame = ?other, "unexpected frame on dialed connection"),
            None => break,
        }
    }
    state.closed.cancel();
    state.pending.lock().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, serde::Deserialize, PartialEq)]
    struct Params {
        n: usize,
    }

    #[test]
    fn test_parse_params() {
        let params: Params = parse_params(serde_json::json!({"n": 3})).unwrap();
        assert_eq!(params, Params { n: 3 });
    }

    #[test]
    fn test_parse_params_rejects_wrong_shape() {
        let err = parse_params::<Params>(serde_json::json!(["n", 3])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Protocol);
    }

    #[test]
    fn test_unknown_method_is_not_implemented() {
        let err = unknown_method("Plugin.Frobnicate");
        assert_eq!(err.kind, ErrorKind::NotImplemented);
        assert!(err.message.contains("Plugin.Frobnicate"));
    }
}
