//! Host callback API for plugins driven from the command line.

use async_trait::async_trait;
use parking_lot::Mutex;
use reeve_plugin::{PluginResult, ReeveApi};
use reeve_proto::{Message, Trigger};
use tracing::info;

/// Records and logs what a plugin pushes back while a command runs.
#[derive(Debug, Default)]
pub struct LoggingApi {
    messages: Mutex<Vec<Message>>,
    triggers: Mutex<Vec<Trigger>>,
}

impl LoggingApi {
    /// Create an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages pushed so far.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Triggers pushed so far.
    #[must_use]
    pub fn triggers(&self) -> Vec<Trigger> {
        self.triggers.lock().clone()
    }
}

#[async_trait]
impl ReeveApi for LoggingApi {
    async fn notify_messages(&self, messages: Vec<Message>) -> PluginResult<()> {
        for message in &messages {
            info!(
                target = %message.target,
                bytes = message.data.len(),
                "plugin pushed message"
            );
        }
        self.messages.lock().extend(messages);
        Ok(())
    }

    async fn notify_triggers(&self, triggers: Vec<Trigger>) -> PluginResult<()> {
        for trigger in &triggers {
            let mut attributes: Vec<_> = trigger.iter().map(|(k, v)| format!("{k}={v}")).collect();
            attributes.sort();
            info!(trigger = %attributes.join(" "), "plugin pushed trigger");
        }
        self.triggers.lock().extend(triggers);
        Ok(())
    }

    async fn close(&self) -> PluginResult<()> {
        info!("callback API closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn records_pushes() {
        let api = LoggingApi::new();
        api.notify_messages(vec![Message::broadcast(HashMap::new(), b"hi".to_vec())])
            .await
            .unwrap();
        api.notify_triggers(vec![Trigger::from([("repo".to_string(), "reeve".to_string())])])
            .await
            .unwrap();
        api.close().await.unwrap();

        assert_eq!(api.messages().len(), 1);
        assert_eq!(api.triggers()[0]["repo"], "reeve");
    }
}
