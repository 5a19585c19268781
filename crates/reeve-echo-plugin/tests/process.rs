//! Launches the echo plugin binary the way the host does and drives it over
//! the real handshake and TCP transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use reeve_plugin::handshake::MAGIC_COOKIE_KEY;
use reeve_plugin::{
    HandshakeConfig, HostConfig, LogStream, Plugin, PluginError, PluginProcess, PluginResult,
    ReeveApi, StreamProvider,
};
use reeve_proto::{Message, MessageSource, Pipeline, PipelineStatus, Status, Trigger};

const PLUGIN: &str = env!("CARGO_BIN_EXE_reeve-echo-plugin");
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct RecordingApi {
    messages: Mutex<Vec<Message>>,
    triggers: Mutex<Vec<Trigger>>,
}

#[async_trait]
impl ReeveApi for RecordingApi {
    async fn notify_messages(&self, messages: Vec<Message>) -> PluginResult<()> {
        self.messages.lock().extend(messages);
        Ok(())
    }

    async fn notify_triggers(&self, triggers: Vec<Trigger>) -> PluginResult<()> {
        self.triggers.lock().extend(triggers);
        Ok(())
    }

    async fn close(&self) -> PluginResult<()> {
        Ok(())
    }
}

fn config() -> HostConfig {
    HostConfig::new(PLUGIN).with_startup_timeout(TEST_TIMEOUT)
}

async fn launch() -> PluginProcess {
    tokio::time::timeout(TEST_TIMEOUT, PluginProcess::launch(config()))
        .await
        .expect("launch timed out")
        .expect("launch failed")
}

#[tokio::test]
async fn plugin_answers_handshake_and_name() {
    let process = launch().await;
    assert!(process.id().is_some());
    assert_eq!(process.client().name().await.unwrap(), "echo");

    let status = process.shutdown().await.unwrap();
    assert!(status.success(), "plugin exited with {status}");
}

#[tokio::test]
async fn full_lifecycle_over_process_boundary() {
    let process = launch().await;
    let client = process.client();
    let api = Arc::new(RecordingApi::default());

    let capabilities = client
        .register(HashMap::from([("prefix".into(), "# ".into())]), api.clone())
        .await
        .unwrap();
    assert!(capabilities.discover && capabilities.resolve && capabilities.notify);
    assert!(capabilities.has_cli_method("last-log"));
    assert!(client.callback_conn().is_some());

    let trigger = Trigger::from([("name".to_string(), "build".to_string())]);
    let pipelines = client.discover(trigger).await.unwrap();
    assert_eq!(pipelines[0].name(), "build");

    let env = client.resolve(vec!["SECRET_KEY".into()]).await.unwrap();
    assert!(env["SECRET_KEY"].secret);

    let echoed = client.cli_method("echo".into(), vec!["hi".into()]).await.unwrap();
    assert_eq!(echoed, "# hi");

    client.cli_method("push".into(), vec!["repo=reeve".into()]).await.unwrap();
    assert_eq!(api.triggers.lock()[0]["repo"], "reeve");

    let options = HashMap::from([("reply".to_string(), "worker".to_string())]);
    client
        .message(MessageSource::Api, Message::new("echo", options, b"ping".to_vec()))
        .await
        .unwrap();
    assert_eq!(api.messages.lock()[0].target, "worker");

    client.unregister().await.unwrap();
    let status = process.shutdown().await.unwrap();
    assert!(status.success(), "plugin exited with {status}");
}

#[tokio::test]
async fn plugin_reads_live_logs_across_processes() {
    let process = launch().await;
    let client = process.client();
    client.register(HashMap::new(), Arc::new(RecordingApi::default())).await.unwrap();

    let stream = LogStream::new();
    stream.write(b"step 1\n").unwrap();
    let status = PipelineStatus::new(Pipeline::named("build"), "a1", Status::Running)
        .with_logs(Arc::new(StreamProvider::from(stream.clone())));
    client.notify(status).await.unwrap();
    assert_eq!(client.log_connections().len(), 1);

    stream.write(b"step 2\n").unwrap();
    stream.close();

    let logs = tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if let Ok(logs) = client.cli_method("last-log".into(), vec!["a1".into()]).await {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("logs were not collected");
    assert_eq!(logs, "step 1\nstep 2\n");

    process.shutdown().await.unwrap();
}

#[tokio::test]
async fn wrong_cookie_makes_plugin_refuse() {
    let handshake = HandshakeConfig::new().with_magic_cookie(MAGIC_COOKIE_KEY, "wrong");
    let result = PluginProcess::launch(config().with_handshake(handshake)).await;
    assert!(matches!(result, Err(PluginError::Handshake(_))));
}

#[tokio::test]
async fn version_mismatch_is_rejected_by_host() {
    let handshake = HandshakeConfig::new().with_protocol_version(2);
    let result = PluginProcess::launch(config().with_handshake(handshake)).await;
    match result {
        Err(PluginError::Handshake(message)) => assert!(message.contains("protocol version")),
        other => panic!("unexpected launch result {other:?}"),
    }
}

#[tokio::test]
async fn binary_refuses_to_run_directly() {
    let output = tokio::process::Command::new(PLUGIN)
        .env_remove(MAGIC_COOKIE_KEY)
        .output()
        .await
        .unwrap();
    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not meant to be executed directly"), "stderr: {stderr}");
}
