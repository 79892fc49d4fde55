//! serial-echo: a single-client-at-a-time TCP echo server
//!
//! Accepts one connection, writes every byte it receives straight back
//! until the peer closes, then accepts the next one.
//!
//! Features:
//! - Raw byte echo, no framing
//! - Serial sessions with a listen backlog of 1
//! - Configuration via CLI arguments or TOML file

mod config;
mod server;
mod session;

use config::Config;
use server::EchoServer;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let server = EchoServer::bind(config.listen_addr())?;
    server.run()
}
