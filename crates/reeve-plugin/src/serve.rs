//! Plugin process entry point.

use std::env;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::info;

use crate::broker::{Broker, Side};
use crate::config::{BrokerConfig, ServeConfig};
use crate::error::{PluginError, PluginResult};
use crate::handshake::NETWORK_TCP;
use crate::plugin::Plugin;
use crate::server::PluginServer;

/// Serve `plugin` to the host that started this process.
///
/// Checks the magic cookie, listens on the configured address, announces it
/// on stdout, and serves the first connection until the host goes away.
/// Nothing else may be written to stdout.
pub async fn serve(plugin: Arc<dyn Plugin>, config: ServeConfig) -> PluginResult<()> {
    let cookie = env::var(&config.handshake.magic_cookie_key).ok();
    config.handshake.check_cookie(cookie.as_deref())?;

    let listener = TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;
    let line = config.handshake.line(NETWORK_TCP, addr.to_string());
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{line}\n").as_bytes()).await?;
    stdout.flush().await?;
    info!(%addr, "plugin listening");

    let (stream, peer) = tokio::time::timeout(config.accept_timeout, listener.accept())
        .await
        .map_err(|_| PluginError::Handshake("host did not connect in time".to_string()))??;
    stream.set_nodelay(true)?;
    info!(%peer, "host connected");
    drop(listener);

    serve_transport(stream, plugin, config.broker).await
}

/// Serve `plugin` over an established transport until it closes.
pub async fn serve_transport<T>(
    transport: T,
    plugin: Arc<dyn Plugin>,
    config: BrokerConfig,
) -> PluginResult<()>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    let broker = Broker::new(transport, Side::Plugin, config);
    let control = broker.serve_control(PluginServer::new(plugin, broker.clone()))?;
    broker.closed().await;
    control.cancel();
    info!("host disconnected");
    Ok(())
}
