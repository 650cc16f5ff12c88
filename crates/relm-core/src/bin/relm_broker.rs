//! Standalone callback broker, run inside sandboxes so that sandboxed code
//! can reach the host-side model handler without dialing out.

use std::net::{Ipv4Addr, SocketAddr};

use relm_core::{CallbackBroker, RelmError, SANDBOX_BROKER_PORT};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), RelmError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let port = match std::env::var("RELM_BROKER_PORT") {
        Ok(raw) => raw.parse::<u16>().map_err(|_| {
            RelmError::Configuration(format!("invalid RELM_BROKER_PORT value '{raw}'"))
        })?,
        Err(_) => SANDBOX_BROKER_PORT,
    };

    let broker = CallbackBroker::default();
    let mut server = broker
        .serve(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
        .await?;
    info!(addr = %server.addr(), "callback broker listening");

    tokio::signal::ctrl_c()
        .await
        .map_err(|error| RelmError::Http(format!("failed to wait for shutdown: {error}")))?;
    info!("shutting down");
    server.shutdown().await;
    Ok(())
}
