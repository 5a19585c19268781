//! # reeve-echo-plugin
//!
//! A reference plugin that implements every plugin operation by echoing it:
//! discovered pipelines mirror their trigger, resolved values mirror their
//! keys, and pipeline logs are read back over the log bridge and kept for the
//! `last-log` CLI method.
//!
//! Declared operations are read from `REEVE_ECHO_CAPABILITIES`, a
//! whitespace-separated subset of `message discover resolve notify`.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reeve_plugin::{Plugin, PluginError, PluginResult, ReeveApi, bool_env_or, env_fields};
use reeve_proto::{
    Capabilities, Env, FullMessage, LogReaderProvider, Message, MessageSource, Param, Pipeline,
    PipelineStatus, RunConfig, Step, StreamError, Trigger,
};
use tracing::{debug, info, warn};

/// Name the plugin reports.
pub const PLUGIN_NAME: &str = "echo";

/// Environment variable selecting the declared operations.
pub const CAPABILITIES_ENV: &str = "REEVE_ECHO_CAPABILITIES";

/// Environment variable controlling replies to messages with a `reply` option.
pub const REPLY_ENV: &str = "REEVE_ECHO_REPLY";

/// Operations declared when [`CAPABILITIES_ENV`] is unset.
pub const DEFAULT_CAPABILITIES: &str = "message discover resolve notify";

/// Keys with this prefix resolve to secret values.
pub const SECRET_PREFIX: &str = "SECRET_";

/// Number of activities whose logs are kept; older ones are dropped.
pub const KEPT_LOGS: usize = 16;

const READ_CHUNK: usize = 32 * 1024;

/// The echo plugin.
pub struct EchoPlugin {
    capabilities: Capabilities,
    reply: bool,
    state: Mutex<State>,
    logs: Arc<Mutex<CollectedLogs>>,
}

/// Logs of the most recent activities, oldest first.
#[derive(Default)]
struct CollectedLogs {
    order: VecDeque<String>,
    logs: HashMap<String, Vec<u8>>,
}

impl CollectedLogs {
    fn insert(&mut self, activity: String, bytes: Vec<u8>) {
        if self.logs.insert(activity.clone(), bytes).is_some() {
            self.order.retain(|kept| *kept != activity);
        }
        self.order.push_back(activity);
        while self.order.len() > KEPT_LOGS {
            if let Some(oldest) = self.order.pop_front() {
                debug!(activity = %oldest, "dropping collected logs");
                self.logs.remove(&oldest);
            }
        }
    }

    fn get(&self, activity: &str) -> Option<&Vec<u8>> {
        self.logs.get(activity)
    }
}

#[derive(Default)]
struct State {
    api: Option<Arc<dyn ReeveApi>>,
    settings: HashMap<String, String>,
    registered: bool,
    messages: Vec<FullMessage>,
    last_activity: Option<String>,
}

impl EchoPlugin {
    /// Create a plugin declaring the given operations.
    #[must_use]
    pub fn new(operations: &HashSet<String>, reply: bool) -> Self {
        let mut capabilities = Capabilities::none()
            .with_cli_method("echo", "Print the arguments")
            .with_cli_method("push", "Push a trigger built from KEY=VALUE arguments to the host")
            .with_cli_method("messages", "List the messages received so far")
            .with_cli_method("last-log", "Print the logs collected for an activity")
            .with_cli_method("settings", "Print the registration settings");
        capabilities.message = operations.contains("message");
        capabilities.discover = operations.contains("discover");
        capabilities.resolve = operations.contains("resolve");
        capabilities.notify = operations.contains("notify");

        Self {
            capabilities,
            reply,
            state: Mutex::new(State::default()),
            logs: Arc::new(Mutex::new(CollectedLogs::default())),
        }
    }

    /// Create a plugin configured from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(
            &env_fields(CAPABILITIES_ENV, DEFAULT_CAPABILITIES),
            bool_env_or(REPLY_ENV, true),
        )
    }

    /// Whether the host registered the plugin and has not unregistered it.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.state.lock().registered
    }

    /// Logs collected for `activity_id`, if the plugin finished reading them
    /// and the activity is among the last [`KEPT_LOGS`].
    #[must_use]
    pub fn collected_logs(&self, activity_id: &str) -> Option<Vec<u8>> {
        self.logs.lock().get(activity_id).cloned()
    }

    fn api(&self) -> PluginResult<Arc<dyn ReeveApi>> {
        self.state
            .lock()
            .api
            .clone()
            .ok_or_else(|| PluginError::Remote("plugin is not registered".to_string()))
    }

    fn setting(&self, key: &str) -> Option<String> {
        self.state.lock().settings.get(key).cloned()
    }

    async fn push(&self, args: Vec<String>) -> PluginResult<String> {
        let mut trigger = Trigger::new();
        for arg in args {
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| PluginError::Remote(format!("expected KEY=VALUE, got `{arg}`")))?;
            trigger.insert(key.to_string(), value.to_string());
        }
        if trigger.is_empty() {
            return Err(PluginError::Remote("push needs at least one KEY=VALUE".to_string()));
        }

        self.api()?.notify_triggers(vec![trigger]).await?;
        Ok("pushed 1 trigger".to_string())
    }

    fn list_messages(&self) -> String {
        self.state
            .lock()
            .messages
            .iter()
            .map(|full| {
                format!(
                    "{} -> {}: {}\n",
                    full.source,
                    full.message.target,
                    String::from_utf8_lossy(&full.message.data)
                )
            })
            .collect()
    }

    fn last_log(&self, args: &[String]) -> PluginResult<String> {
        let activity = match args.first() {
            Some(activity) => activity.clone(),
            None => self
                .state
                .lock()
                .last_activity
                .clone()
                .ok_or_else(|| PluginError::Remote("no activity notified yet".to_string()))?,
        };
        self.collected_logs(&activity)
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .ok_or_else(|| PluginError::Remote(format!("no logs collected for {activity}")))
    }

    fn list_settings(&self) -> String {
        let state = self.state.lock();
        let mut lines: Vec<String> =
            state.settings.iter().map(|(k, v)| format!("{k}={v}\n")).collect();
        lines.sort();
        lines.concat()
    }
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self::new(&DEFAULT_CAPABILITIES.split_whitespace().map(str::to_string).collect(), true)
    }
}

/// Read a provider's stream to the end and release the reader and provider.
async fn collect_logs(provider: Arc<dyn LogReaderProvider>) -> Result<Vec<u8>, StreamError> {
    let mut reader = provider.reader().await?;
    let mut collected = Vec::new();
    let result = loop {
        match reader.read(READ_CHUNK).await {
            Ok(chunk) => collected.extend_from_slice(&chunk),
            Err(StreamError::Eof) => break Ok(collected),
            Err(e) => break Err(e),
        }
    };
    if let Err(e) = reader.close().await {
        debug!(error = %e, "log reader close failed");
    }
    if let Err(e) = provider.close().await {
        debug!(error = %e, "log provider close failed");
    }
    result
}

fn echo_pipeline(trigger: &Trigger) -> Pipeline {
    let mut attributes: Vec<String> = trigger.iter().map(|(k, v)| format!("{k}={v}")).collect();
    attributes.sort();

    let name = trigger.get("name").map_or(PLUGIN_NAME, String::as_str);
    let mut pipeline = Pipeline::named(name);
    pipeline.definition.headline = attributes.join(" ");
    pipeline.definition.steps.push(Step {
        name: "echo".to_string(),
        run: RunConfig {
            task: "busybox".to_string(),
            command: Some(Param::list(std::iter::once("echo".to_string()).chain(attributes))),
            ..RunConfig::default()
        },
        ..Step::default()
    });
    pipeline
}

#[async_trait]
impl Plugin for EchoPlugin {
    async fn name(&self) -> PluginResult<String> {
        Ok(PLUGIN_NAME.to_string())
    }

    async fn register(
        &self,
        settings: HashMap<String, String>,
        api: Arc<dyn ReeveApi>,
    ) -> PluginResult<Capabilities> {
        info!(settings = settings.len(), "registered");
        let mut state = self.state.lock();
        state.settings = settings;
        state.api = Some(api);
        state.registered = true;
        Ok(self.capabilities.clone())
    }

    async fn unregister(&self) -> PluginResult<()> {
        info!("unregistered");
        self.state.lock().registered = false;
        Ok(())
    }

    async fn message(&self, source: MessageSource, message: Message) -> PluginResult<()> {
        debug!(%source, target = %message.target, "message received");
        let reply_to = message.options.get("reply").cloned();
        let data = message.data.clone();
        self.state.lock().messages.push(FullMessage::new(source, message));

        if let Some(target) = reply_to.filter(|_| self.reply) {
            let reply = Message::new(target, HashMap::new(), data);
            self.api()?.notify_messages(vec![reply]).await?;
        }
        Ok(())
    }

    async fn discover(&self, trigger: Trigger) -> PluginResult<Vec<Pipeline>> {
        if trigger.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![echo_pipeline(&trigger)])
    }

    async fn resolve(&self, env: Vec<String>) -> PluginResult<HashMap<String, Env>> {
        Ok(env
            .into_iter()
            .map(|key| {
                let value = self.setting(&key).unwrap_or_else(|| format!("echo:{key}"));
                let resolved = if key.starts_with(SECRET_PREFIX) {
                    Env::new(value).secret()
                } else {
                    Env::new(value)
                };
                (key, resolved)
            })
            .collect())
    }

    async fn notify(&self, status: PipelineStatus) -> PluginResult<()> {
        info!(
            pipeline = %status.pipeline.name(),
            activity = %status.activity_id,
            status = %status.status,
            logs = status.logs_available(),
            "status received"
        );
        self.state.lock().last_activity = Some(status.activity_id.clone());

        let Some(provider) = status.logs.filter(|logs| logs.available()) else {
            return Ok(());
        };
        let activity = status.activity_id;
        let logs = Arc::clone(&self.logs);
        tokio::spawn(async move {
            match collect_logs(provider).await {
                Ok(bytes) => {
                    debug!(%activity, bytes = bytes.len(), "logs collected");
                    logs.lock().insert(activity, bytes);
                }
                Err(e) => warn!(%activity, error = %e, "log collection failed"),
            }
        });
        Ok(())
    }

    async fn cli_method(&self, method: String, args: Vec<String>) -> PluginResult<String> {
        match method.as_str() {
            "echo" => {
                let text = args.join(" ");
                Ok(match self.setting("prefix") {
                    Some(prefix) => format!("{prefix}{text}"),
                    None => text,
                })
            }
            "push" => self.push(args).await,
            "messages" => Ok(self.list_messages()),
            "last-log" => self.last_log(&args),
            "settings" => Ok(self.list_settings()),
            _ => Err(PluginError::NotImplemented(format!("CLIMethod {method}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reeve_plugin::{LogStream, StreamProvider};
    use reeve_proto::Status;
    use std::time::Duration;
    use test_case::test_case;

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

    async fn registered(settings: &[(&str, &str)]) -> (EchoPlugin, Arc<RecordingApi>) {
        let plugin = EchoPlugin::default();
        let api = Arc::new(RecordingApi::default());
        let settings = settings.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        plugin.register(settings, api.clone()).await.unwrap();
        (plugin, api)
    }

    fn fields(s: &str) -> HashSet<String> {
        s.split_whitespace().map(str::to_string).collect()
    }

    #[test_case("", false, false; "none")]
    #[test_case("discover", true, false; "discover only")]
    #[test_case("discover notify", true, true; "discover and notify")]
    fn capabilities_follow_operations(operations: &str, discover: bool, notify: bool) {
        let plugin = EchoPlugin::new(&fields(operations), true);
        assert_eq!(plugin.capabilities.discover, discover);
        assert_eq!(plugin.capabilities.notify, notify);
        assert!(plugin.capabilities.has_cli_method("echo"));
    }

    #[tokio::test]
    async fn register_and_unregister() {
        let (plugin, _api) = registered(&[]).await;
        assert!(plugin.is_registered());
        plugin.unregister().await.unwrap();
        assert!(!plugin.is_registered());
    }

    #[tokio::test]
    async fn echo_applies_prefix_setting() {
        let (plugin, _api) = registered(&[("prefix", "> ")]).await;
        let out = plugin.cli_method("echo".into(), vec!["a".into(), "b".into()]).await.unwrap();
        assert_eq!(out, "> a b");
    }

    #[tokio::test]
    async fn push_sends_trigger_to_host() {
        let (plugin, api) = registered(&[]).await;
        plugin.cli_method("push".into(), vec!["repo=reeve".into()]).await.unwrap();
        assert_eq!(api.triggers.lock()[0]["repo"], "reeve");

        let err = plugin.cli_method("push".into(), vec!["bad".into()]).await.unwrap_err();
        assert!(matches!(err, PluginError::Remote(_)));
    }

    #[tokio::test]
    async fn push_requires_registration() {
        let plugin = EchoPlugin::default();
        let err = plugin.cli_method("push".into(), vec!["a=b".into()]).await.unwrap_err();
        assert!(matches!(err, PluginError::Remote(_)));
    }

    #[tokio::test]
    async fn message_with_reply_option_answers() {
        let (plugin, api) = registered(&[]).await;
        let options = HashMap::from([("reply".to_string(), "other".to_string())]);
        plugin
            .message(MessageSource::Api, Message::new("echo", options, b"ping".to_vec()))
            .await
            .unwrap();
        plugin
            .message(MessageSource::Server, Message::broadcast(HashMap::new(), b"quiet".to_vec()))
            .await
            .unwrap();

        let replies = api.messages.lock().clone();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].target, "other");
        assert_eq!(replies[0].data, b"ping");

        let listing = plugin.cli_method("messages".into(), Vec::new()).await.unwrap();
        assert_eq!(listing.lines().count(), 2);
        assert!(listing.starts_with("*api -> echo: ping"));
    }

    #[tokio::test]
    async fn replies_can_be_disabled() {
        let plugin = EchoPlugin::new(&fields(DEFAULT_CAPABILITIES), false);
        let api = Arc::new(RecordingApi::default());
        plugin.register(HashMap::new(), api.clone()).await.unwrap();
        let options = HashMap::from([("reply".to_string(), "other".to_string())]);
        plugin.message(MessageSource::Api, Message::new("echo", options, Vec::new())).await.unwrap();
        assert!(api.messages.lock().is_empty());
    }

    #[tokio::test]
    async fn discover_mirrors_trigger() {
        let plugin = EchoPlugin::default();
        assert!(plugin.discover(Trigger::new()).await.unwrap().is_empty());

        let trigger = Trigger::from([
            ("name".to_string(), "build".to_string()),
            ("branch".to_string(), "main".to_string()),
        ]);
        let pipelines = plugin.discover(trigger).await.unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(pipelines[0].name(), "build");
        assert_eq!(pipelines[0].definition.headline, "branch=main name=build");
        assert_eq!(pipelines[0].definition.steps.len(), 1);
    }

    #[tokio::test]
    async fn resolve_marks_secrets_and_prefers_settings() {
        let (plugin, _api) = registered(&[("USER", "reeve")]).await;
        let env = plugin
            .resolve(vec!["USER".into(), "SECRET_TOKEN".into(), "HOME".into()])
            .await
            .unwrap();
        assert_eq!(env["USER"].value, "reeve");
        assert_eq!(env["HOME"].value, "echo:HOME");
        assert!(env["SECRET_TOKEN"].secret);
        assert!(!env["HOME"].secret);
    }

    #[tokio::test]
    async fn notify_collects_live_logs() {
        let plugin = EchoPlugin::default();
        let stream = LogStream::new();
        stream.write(b"hello ").unwrap();
        let status = PipelineStatus::new(Pipeline::named("build"), "a1", Status::Running)
            .with_logs(Arc::new(StreamProvider::from(stream.clone())));
        plugin.notify(status).await.unwrap();

        stream.write(b"world").unwrap();
        stream.close();

        let logs = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(logs) = plugin.collected_logs("a1") {
                    return logs;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(logs, b"hello world");
        assert_eq!(plugin.cli_method("last-log".into(), Vec::new()).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn last_log_without_activity_fails() {
        let plugin = EchoPlugin::default();
        assert!(plugin.cli_method("last-log".into(), Vec::new()).await.is_err());
        assert!(plugin.cli_method("last-log".into(), vec!["x".into()]).await.is_err());
    }

    #[tokio::test]
    async fn settings_are_listed_sorted() {
        let (plugin, _api) = registered(&[("b", "2"), ("a", "1")]).await;
        let out = plugin.cli_method("settings".into(), Vec::new()).await.unwrap();
        assert_eq!(out, "a=1\nb=2\n");
    }

    #[tokio::test]
    async fn unknown_method_is_not_implemented() {
        let plugin = EchoPlugin::default();
        let err = plugin.cli_method("deploy".into(), Vec::new()).await.unwrap_err();
        assert!(matches!(err, PluginError::NotImplemented(_)));
    }

    #[test]
    fn collected_logs_keep_only_recent_activities() {
        let mut logs = CollectedLogs::default();
        for n in 0..=KEPT_LOGS {
            logs.insert(format!("a{n}"), n.to_string().into_bytes());
        }
        assert!(logs.get("a0").is_none());
        assert_eq!(logs.get("a1").unwrap(), b"1");
        assert_eq!(logs.get(&format!("a{KEPT_LOGS}")).unwrap(), KEPT_LOGS.to_string().as_bytes());
        assert_eq!(logs.order.len(), KEPT_LOGS);
    }

    #[test]
    fn collected_logs_refresh_a_repeated_activity() {
        let mut logs = CollectedLogs::default();
        logs.insert("a0".to_string(), b"first".to_vec());
        for n in 1..KEPT_LOGS {
            logs.insert(format!("a{n}"), Vec::new());
        }
        logs.insert("a0".to_string(), b"second".to_vec());
        logs.insert("late".to_string(), Vec::new());

        assert_eq!(logs.get("a0").unwrap(), b"second");
        assert!(logs.get("a1").is_none());
        assert_eq!(logs.order.len(), KEPT_LOGS);
    }
}
