//! Tests for the connection broker.

use super::*;
use crate::error::RemoteError;
use crate::rpc::{Dispatch, unknown_method};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::time::Duration;
use test_case::test_case;

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn pair_with(config: BrokerConfig) -> (Broker, Broker) {
    let (host_io, plugin_io) = tokio::io::duplex(64 * 1024);
    (
        Broker::new(host_io, Side::Host, config),
        Broker::new(plugin_io, Side::Plugin, config),
    )
}

fn pair() -> (Broker, Broker) {
    pair_with(BrokerConfig::new())
}

#[derive(Default)]
struct Echo {
    finished: Arc<AtomicBool>,
    order: Arc<Mutex<Vec<u64>>>,
    dispatch: Dispatch,
}

impl Echo {
    fn concurrent() -> Self {
        Self {
            dispatch: Dispatch::Concurrent,
            ..Self::default()
        }
    }
}

#[async_trait]
impl Service for Echo {
    async fn call(&self, method: &str, params: Value) -> Result<Value, RemoteError> {
        match method {
            "echo" => Ok(params),
            "fail" => Err(RemoteError::domain("boom")),
            "eof" => Err(PluginError::Eof.to_remote()),
            "record" => {
                let n = params.as_u64().unwrap_or_default();
                // later requests sleep less, so out-of-order serving would show
                tokio::time::sleep(Duration::from_millis(10 * 10_u64.saturating_sub(n))).await;
                self.order.lock().push(n);
                Ok(Value::Null)
            }
            "sleep" => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Value::Null)
            }
            other => Err(unknown_method(other)),
        }
    }

    fn dispatch(&self) -> Dispatch {
        self.dispatch
    }

    async fn finish(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ========== Side Tests ==========

#[test_case(Side::Host, 1, true ; "host owns odd")]
#[test_case(Side::Host, 2, false ; "host does not own even")]
#[test_case(Side::Plugin, 2, true ; "plugin owns even")]
#[test_case(Side::Plugin, 3, false ; "plugin does not own odd")]
#[test_case(Side::Host, 0, false ; "host does not own control")]
#[test_case(Side::Plugin, 0, false ; "plugin does not own control")]
fn side_owns(side: Side, id: ConnId, expected: bool) {
    assert_eq!(side.owns(id), expected);
}

#[test]
fn side_display() {
    assert_eq!(Side::Host.to_string(), "host");
    assert_eq!(Side::Plugin.to_string(), "plugin");
}

// ========== Allocation Tests ==========

#[tokio::test]
async fn allocate_follows_side_parity() {
    let (host, plugin) = pair();
    assert_eq!(host.allocate(), 1);
    assert_eq!(host.allocate(), 3);
    assert_eq!(plugin.allocate(), 2);
    assert_eq!(plugin.allocate(), 4);
}

#[tokio::test]
async fn allocate_is_distinct_in_tight_loop() {
    let (host, _plugin) = pair();
    let ids: Vec<ConnId> = (0..10_000).map(|_| host.allocate()).collect();
    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());
    assert!(ids.iter().all(|id| Side::Host.owns(*id)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn allocate_is_distinct_across_tasks() {
    let (host, _plugin) = pair();
    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let host = host.clone();
            tokio::spawn(async move { (0..500).map(|_| host.allocate()).collect::<Vec<_>>() })
        })
        .collect();
    let mut all = HashSet::new();
    for task in tasks {
        for id in task.await.unwrap() {
            assert!(all.insert(id), "identifier {id} allocated twice");
        }
    }
    assert_eq!(all.len(), 4000);
}

mod proptest_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn both_sides_allocate_disjoint_ids(host_count in 1usize..200, plugin_count in 1usize..200) {
            let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
            let (host_ids, plugin_ids) = runtime.block_on(async {
                let (host, plugin) = pair();
                let host_ids: HashSet<ConnId> = (0..host_count).map(|_| host.allocate()).collect();
                let plugin_ids: HashSet<ConnId> = (0..plugin_count).map(|_| plugin.allocate()).collect();
                (host_ids, plugin_ids)
            });
            prop_assert_eq!(host_ids.len(), host_count);
            prop_assert_eq!(plugin_ids.len(), plugin_count);
            prop_assert!(host_ids.is_disjoint(&plugin_ids));
            prop_assert!(!host_ids.contains(&CONTROL_CONN) && !plugin_ids.contains(&CONTROL_CONN));
        }
    }
}

// ========== Dial / Accept Tests ==========

#[tokio::test]
async fn dial_and_call() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();

    let client = plugin.dial(id).await.unwrap();
    assert_eq!(client.conn(), id);
    let reply = client.call("echo", json!({"hello": "world"})).await.unwrap();
    assert_eq!(reply, json!({"hello": "world"}));
}

#[tokio::test]
async fn remote_errors_keep_their_kind() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let err = client.call("fail", Value::Null).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
    assert!(client.call("eof", Value::Null).await.unwrap_err().is_eof());
    assert!(matches!(
        client.call("nope", Value::Null).await.unwrap_err(),
        PluginError::NotImplemented(_)
    ));
}

#[tokio::test]
async fn dial_unaccepted_id_is_refused() {
    let (host, plugin) = pair();
    let err = plugin.dial(host.allocate()).await.unwrap_err();
    assert!(err.is_connection(), "unexpected error: {err}");
    assert!(err.to_string().contains("refused"));

    // the session survives the failed dial
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();
    assert!(plugin.dial(id).await.is_ok());
}

#[tokio::test]
async fn dial_control_connection_is_rejected() {
    let (_host, plugin) = pair();
    assert!(matches!(
        plugin.dial(CONTROL_CONN).await,
        Err(PluginError::Protocol(_))
    ));
}

#[tokio::test]
async fn second_dial_of_open_id_fails() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();
    let _client = plugin.dial(id).await.unwrap();
    assert!(plugin.dial(id).await.unwrap_err().is_connection());
}

#[tokio::test]
async fn accept_same_id_twice_fails() {
    let (host, _plugin) = pair();
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();
    assert!(host.accept_and_serve(id, Echo::default()).is_err());
}

#[tokio::test]
async fn accept_times_out_without_dial() {
    let (host, _plugin) = pair_with(BrokerConfig::new().with_accept_timeout(Duration::from_millis(50)));
    let service = Echo::default();
    let finished = Arc::clone(&service.finished);
    let handle = host.accept_and_serve(host.allocate(), service).unwrap();

    tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
}

#[tokio::test]
async fn dial_times_out_when_peer_is_silent() {
    let (host_io, _silent) = tokio::io::duplex(1024);
    let host = Broker::new(
        host_io,
        Side::Host,
        BrokerConfig::new().with_dial_timeout(Duration::from_millis(50)),
    );
    let err = host.dial(2).await.unwrap_err();
    assert!(err.to_string().contains("timed out"));
}

// ========== Lifecycle Tests ==========

#[tokio::test]
async fn client_close_ends_service_and_runs_finish() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::default();
    let finished = Arc::clone(&service.finished);
    let handle = host.accept_and_serve(id, service).unwrap();

    let client = plugin.dial(id).await.unwrap();
    client.close().await;
    client.close().await;
    assert!(client.is_closed());

    tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    assert!(matches!(
        client.call("echo", Value::Null).await,
        Err(PluginError::Connection(_))
    ));
}

#[tokio::test]
async fn dropping_client_closes_connection() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let handle = host.accept_and_serve(id, Echo::default()).unwrap();
    drop(plugin.dial(id).await.unwrap());
    tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
}

#[tokio::test]
async fn cancelling_handle_closes_client() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let handle = host.accept_and_serve(id, Echo::default()).unwrap();
    let client = plugin.dial(id).await.unwrap();

    handle.shutdown().await;
    tokio::time::timeout(TEST_TIMEOUT, client.closed()).await.unwrap();
    assert!(client.call("echo", Value::Null).await.is_err());
}

#[tokio::test]
async fn transport_teardown_stops_everything() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::default();
    let finished = Arc::clone(&service.finished);
    let _handle = host.accept_and_serve(id, service).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("sleep", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    plugin.shutdown();

    let result = tokio::time::timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(PluginError::Connection(_))));
    tokio::time::timeout(TEST_TIMEOUT, host.closed()).await.unwrap();
    assert!(host.is_closed());
    assert!(host.dial(2).await.is_err());
    assert!(host.accept_and_serve(host.allocate(), Echo::default()).is_err());
    assert!(client.is_closed());
    // the in-flight request is abandoned, not awaited
    wait_until(|| finished.load(Ordering::SeqCst)).await;
}

#[tokio::test]
async fn transport_teardown_runs_finish_of_idle_services() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::default();
    let finished = Arc::clone(&service.finished);
    let _handle = host.accept_and_serve(id, service).unwrap();
    let _client = plugin.dial(id).await.unwrap();

    host.shutdown();
    wait_until(|| finished.load(Ordering::SeqCst)).await;
    tokio::time::timeout(TEST_TIMEOUT, plugin.closed()).await.unwrap();
}

// ========== Ordering Tests ==========

#[tokio::test]
async fn requests_are_served_in_issuance_order() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::default();
    let order = Arc::clone(&service.order);
    let _handle = host.accept_and_serve(id, service).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let calls: Vec<_> = (0..10_u64)
        .map(|n| client.call("record", json!(n)))
        .collect();
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
}

#[tokio::test]
async fn concurrent_calls_are_correlated() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let _handle = host.accept_and_serve(id, Echo::default()).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let tasks: Vec<_> = (0..50)
        .map(|n| {
            let client = client.clone();
            tokio::spawn(async move { (n, client.call("echo", json!(n)).await) })
        })
        .collect();
    for task in tasks {
        let (n, reply) = task.await.unwrap();
        assert_eq!(reply.unwrap(), json!(n));
    }
}

// ========== Control Connection Tests ==========

#[tokio::test]
async fn control_connection_needs_no_dial() {
    let (host, plugin) = pair();
    let _handle = plugin.serve_control(Echo::default()).unwrap();
    let control = host.control_client().unwrap();
    assert_eq!(control.conn(), CONTROL_CONN);
    assert_eq!(control.call("echo", json!("ping")).await.unwrap(), json!("ping"));
    assert!(host.control_client().is_err());
}

#[tokio::test]
async fn connections_in_both_directions() {
    let (host, plugin) = pair();
    let host_id = host.allocate();
    let plugin_id = plugin.allocate();
    let _a = host.accept_and_serve(host_id, Echo::default()).unwrap();
    let _b = plugin.accept_and_serve(plugin_id, Echo::default()).unwrap();

    let to_host = plugin.dial(host_id).await.unwrap();
    let to_plugin = host.dial(plugin_id).await.unwrap();
    assert_eq!(to_host.call("echo", json!(1)).await.unwrap(), json!(1));
    assert_eq!(to_plugin.call("echo", json!(2)).await.unwrap(), json!(2));
    assert_eq!(host.open_connections(), 2);
}

#[tokio::test]
async fn concurrent_service_answers_as_requests_complete() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::concurrent();
    let order = Arc::clone(&service.order);
    let _handle = host.accept_and_serve(id, service).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let calls: Vec<_> = (0..10_u64)
        .map(|n| client.call("record", json!(n)))
        .collect();
    for result in futures::future::join_all(calls).await {
        result.unwrap();
    }
    assert_eq!(*order.lock(), (0..10).rev().collect::<Vec<_>>());
}

#[tokio::test]
async fn slow_request_does_not_hold_up_concurrent_service() {
    let (host, plugin) = pair();
    let _handle = plugin.serve_control(Echo::concurrent()).unwrap();
    let control = host.control_client().unwrap();

    let slow = {
        let control = control.clone();
        tokio::spawn(async move { control.call("sleep", Value::Null).await })
    };
    let reply = tokio::time::timeout(Duration::from_secs(1), control.call("echo", json!("fast")))
        .await
        .expect("echo waited behind the slow request");
    assert_eq!(reply.unwrap(), json!("fast"));
    assert!(!slow.is_finished());
}

#[tokio::test]
async fn cancelled_concurrent_service_completes_requests_in_flight() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::concurrent();
    let finished = Arc::clone(&service.finished);
    let handle = host.accept_and_serve(id, service).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("record", json!(0)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    handle.cancel();

    let result = tokio::time::timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap();
    assert!(result.is_ok(), "in-flight request was dropped: {result:?}");
    tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
    tokio::time::timeout(TEST_TIMEOUT, client.closed()).await.unwrap();
}

#[tokio::test]
async fn transport_teardown_abandons_concurrent_requests() {
    let (host, plugin) = pair();
    let id = host.allocate();
    let service = Echo::concurrent();
    let finished = Arc::clone(&service.finished);
    let handle = host.accept_and_serve(id, service).unwrap();
    let client = plugin.dial(id).await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.call("sleep", Value::Null).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    host.shutdown();

    assert!(tokio::time::timeout(TEST_TIMEOUT, pending).await.unwrap().unwrap().is_err());
    tokio::time::timeout(TEST_TIMEOUT, handle.join()).await.unwrap();
    assert!(finished.load(Ordering::SeqCst));
}
