mod auth;
mod config;
mod connection;
mod logging;
mod multiplexer;
mod registry;
mod relay;

use anyhow::{Context, Result};
use auth::{Authenticator, OpenAuthenticator, StaticAuthenticator};
use config::{load_settings, AuthSource};
use relay::Relay;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let settings = load_settings()?;
    let _log_guard = logging::init_logging(
        settings.debug,
        settings.log_dir.as_deref(),
        &settings.relay.server_id,
    );

    let authenticator: Box<dyn Authenticator> = match &settings.auth {
        AuthSource::Users(path) => Box::new(StaticAuthenticator::from_file(path)?),
        AuthSource::Open => {
            warn!(event = "relay_open_mode", "every non-empty username is accepted");
            Box::new(OpenAuthenticator::default())
        }
    };

    let addr = settings.relay.addr();
    let relay = Relay::bind(settings.relay, authenticator)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!(event = "relay_signal", signal = "ctrl_c"),
            Err(err) => warn!(event = "relay_signal_error", error = %err),
        }
        let _ = shutdown_tx.send(true);
    });

    if let Err(err) = relay.run(shutdown_rx).await {
        error!(event = "relay_error", error = %err);
        return Err(err.into());
    }
    Ok(())
}
