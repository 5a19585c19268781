//! Echo plugin binary entrypoint.
//!
//! Started by a Reeve host; refuses to run otherwise.

use std::io;
use std::sync::Arc;

use reeve_echo_plugin::EchoPlugin;
use reeve_plugin::ServeConfig;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the handshake, so logs go to stderr
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let plugin = Arc::new(EchoPlugin::from_env());
    reeve_plugin::serve(plugin, ServeConfig::new()).await?;
    Ok(())
}
