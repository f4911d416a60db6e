use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use livefeed_server::{Args, ServerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "livefeed=info,liblivefeed=info,livefeed_server=info,tower_http=info".into()
            }),
        )
        .init();

    let args = Args::parse();
    let config = ServerConfig::from_args(&args)?;

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    tracing::info!("ctrl-c received, shutting down");
                    shutdown.cancel();
                }
                Err(err) => tracing::warn!(error = %err, "cannot listen for ctrl-c"),
            }
        });
    }

    livefeed_server::run(config, shutdown).await
}
