use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;

use fanout::config::{AddressKey, DEFAULT_LOG_FILE, DEFAULT_PORT, MAX_CONNECTIONS, ServerConfig};

#[derive(Debug, Parser)]
#[command(name = "fanout", version, about = "Relays every byte a peer sends to all other peers")]
struct Cli {
    /// TCP port to listen on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Bind this address only instead of the dual-stack wildcard.
    #[arg(long)]
    bind: Option<IpAddr>,

    #[arg(long, default_value = DEFAULT_LOG_FILE)]
    log_file: PathBuf,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long, default_value_t = MAX_CONNECTIONS)]
    max_connections: usize,

    /// Address that identifies a host when evicting duplicate connections.
    #[arg(long, value_enum, default_value_t = AddressKey::Local)]
    dedup_key: AddressKey,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig {
        port: cli.port,
        bind: cli.bind,
        log_file: cli.log_file,
        capacity: cli.max_connections,
        address_key: cli.dedup_key,
        ..ServerConfig::default()
    };

    let log = fanout::log::init(&config.log_file, &cli.log_level)?;

    fanout::server::run(config, log)
}
