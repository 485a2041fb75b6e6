//! Relay server binary.
//!
//! Configured from the environment:
//! - `NOTES_BIND_ADDR` (default `127.0.0.1:4000`)
//! - `NOTES_STORAGE_PATH` (RocksDB directory; unset = in-memory)
//! - `NOTES_SAVE_DELAY_MS` (default 1000)
//! - `NOTES_OUTBOUND_CAPACITY` (default 256)
//! - `RUST_LOG` (default `info`)

use std::path::PathBuf;
use std::process::ExitCode;
use std::str::FromStr;
use std::time::Duration;

use log::{error, info};
use notes_collab::{RelayServer, ServerConfig};

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: std::env::var("NOTES_BIND_ADDR").unwrap_or(defaults.bind_addr),
        storage_path: std::env::var_os("NOTES_STORAGE_PATH").map(PathBuf::from),
        save_delay: parse_positive(std::env::var("NOTES_SAVE_DELAY_MS").ok())
            .map(Duration::from_millis)
            .unwrap_or(defaults.save_delay),
        outbound_capacity: parse_positive(std::env::var("NOTES_OUTBOUND_CAPACITY").ok())
            .unwrap_or(defaults.outbound_capacity),
    }
}

/// Parse a strictly positive number; anything else means "use the default".
fn parse_positive<T>(value: Option<String>) -> Option<T>
where
    T: FromStr + PartialOrd + Default,
{
    value?
        .trim()
        .parse::<T>()
        .ok()
        .filter(|n| *n > T::default())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env();
    info!(
        "Starting notes relay on {} (store: {}, save delay: {:?})",
        config.bind_addr,
        config
            .storage_path
            .as_ref()
            .map_or("in-memory".to_string(), |p| p.display().to_string()),
        config.save_delay,
    );

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to start: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
    };

    match server.run_until(shutdown).await {
        Ok(()) => {
            info!("Relay stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Relay failed: {e}");
            ExitCode::FAILURE
        }
    }
}
