//! Standalone edit-log service.
//!
//! Configured from the environment:
//! - `BIMSYNC_BIND_ADDR` (default `127.0.0.1:9090`)
//! - `BIMSYNC_DATA_DIR` RocksDB directory
//! - `BIMSYNC_BROADCAST_CAPACITY` per-model fan-out buffer
//!
//! Log verbosity follows `RUST_LOG`.

use bimsync_collab::server::{LogServer, ServerConfig};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting bimsync log service on {}...", config.bind_addr);

    let server = match LogServer::open(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open edit log: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Server error: {e}");
        std::process::exit(1);
    }
}
