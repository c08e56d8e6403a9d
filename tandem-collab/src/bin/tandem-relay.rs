//! Standalone relay.
//!
//! Usage: `tandem-relay [ADDR]`. Without an argument the address comes from
//! `TANDEM_RELAY_ADDR`, falling back to `127.0.0.1:9090`.

use log::{error, info};
use tandem_collab::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TANDEM_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    info!("Starting tandem relay on {}...", config.bind_addr);

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
