//! Host-side plugin launcher.

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::broker::{Broker, Side};
use crate::client::PluginClient;
use crate::config::HostConfig;
use crate::error::{PluginError, PluginResult};
use crate::handshake::{HandshakeLine, NETWORK_TCP};

/// A running plugin process and the facade talking to it.
pub struct PluginProcess {
    child: Child,
    broker: Broker,
    client: Arc<PluginClient>,
    config: HostConfig,
}

impl PluginProcess {
    /// Start the plugin, complete the handshake, and connect to it.
    ///
    /// The child is killed if any step fails.
    pub async fn launch(config: HostConfig) -> PluginResult<Self> {
        let name = plugin_name(&config);
        let mut child = Command::new(&config.program)
            .args(&config.args)
            .env(&config.handshake.magic_cookie_key, &config.handshake.magic_cookie_value)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PluginError::Handshake(format!("failed to start {}: {e}", config.program.display()))
            })?;
        info!(plugin = %name, pid = child.id(), "plugin started");

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(name.clone(), BufReader::new(stderr).lines()));
        }
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PluginError::Handshake("plugin stdout not captured".to_string()))?;
        let mut stdout = BufReader::new(stdout).lines();

        let line = match tokio::time::timeout(config.startup_timeout, stdout.next_line()).await {
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => {
                return Err(PluginError::Handshake(
                    "plugin exited before completing the handshake".to_string(),
                ));
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                return Err(PluginError::Handshake(format!(
                    "no handshake within {:?}",
                    config.startup_timeout
                )));
            }
        };
        debug!(plugin = %name, %line, "handshake received");

        let handshake: HandshakeLine = line.parse()?;
        config.handshake.verify(&handshake)?;
        if handshake.network != NETWORK_TCP {
            return Err(PluginError::Handshake(format!(
                "unsupported network {:?}",
                handshake.network
            )));
        }
        tokio::spawn(forward_output(name.clone(), stdout));

        let stream = TcpStream::connect(&handshake.address).await?;
        stream.set_nodelay(true)?;
        let broker = Broker::new(stream, Side::Host, config.broker);
        let client = Arc::new(PluginClient::new(broker.clone())?);
        info!(plugin = %name, address = %handshake.address, "plugin connected");

        Ok(Self {
            child,
            broker,
            client,
            config,
        })
    }

    /// The facade for calling the plugin.
    #[must_use]
    pub fn client(&self) -> Arc<PluginClient> {
        Arc::clone(&self.client)
    }

    /// The broker carrying the plugin's connections.
    #[must_use]
    pub const fn broker(&self) -> &Broker {
        &self.broker
    }

    /// Operating system id of the plugin process, while it runs.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Release the callback API, close the transport, and wait for the
    /// plugin to exit, killing it after the grace period.
    pub async fn shutdown(mut self) -> PluginResult<ExitStatus> {
        self.client.close().await;
        self.broker.shutdown();

        match tokio::time::timeout(self.config.shutdown_grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                info!(plugin = %plugin_name(&self.config), %status, "plugin exited");
                Ok(status)
            }
            Err(_) => {
                warn!(plugin = %plugin_name(&self.config), "plugin did not exit in time, killing");
                self.child.kill().await?;
                Ok(self.child.wait().await?)
            }
        }
    }
}

impl std::fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginProcess")
            .field("program", &self.config.program)
            .field("pid", &self.child.id())
            .finish_non_exhaustive()
    }
}

fn plugin_name(config: &HostConfig) -> String {
    config
        .program
        .file_name()
        .map_or_else(|| config.program.display().to_string(), |name| name.to_string_lossy().into_owned())
}

/// Forward plugin output into the host's logs.
async fn forward_output<R>(plugin: String, mut lines: Lines<BufReader<R>>)
where
    R: AsyncRead + Unpin,
{
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(plugin = %plugin, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "stopped reading plugin output");
                break;
            }
        }
    }
}
