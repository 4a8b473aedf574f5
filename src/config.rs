use std::net::IpAddr;
use std::os::fd::RawFd;
use std::path::PathBuf;
use std::time::Duration;

pub const PROGRAM_NAME: &str = "fanout";

pub const DEFAULT_PORT: u16 = 9909;
pub const DEFAULT_LOG_FILE: &str = "server.log";

pub const MAX_CONNECTIONS: usize = 1022;

pub const PAGE_SIZE: usize = 8192;

pub const PAGE_LIMIT: usize = 10;

// FD_SETSIZE
pub const MAX_DESCRIPTOR: RawFd = 1024;

pub const LISTEN_BACKLOG: i32 = 128;

/// Which address identifies "the same host" when deduplicating connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum AddressKey {
    /// The local address the accepted socket is bound to.
    #[default]
    Local,
    /// The remote peer's IP address.
    Peer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveConfig {
    pub retries: u32,
    pub idle: Duration,
    pub interval: Duration,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            retries: 9,
            idle: Duration::from_secs(25),
            interval: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: Option<IpAddr>,
    pub log_file: PathBuf,
    pub capacity: usize,
    pub max_descriptor: RawFd,
    pub page_size: usize,
    pub page_limit: usize,
    pub keepalive: KeepaliveConfig,
    pub address_key: AddressKey,
    pub backlog: i32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: None,
            log_file: PathBuf::from(DEFAULT_LOG_FILE),
            capacity: MAX_CONNECTIONS,
            max_descriptor: MAX_DESCRIPTOR,
            page_size: PAGE_SIZE,
            page_limit: PAGE_LIMIT,
            keepalive: KeepaliveConfig::default(),
            address_key: AddressKey::default(),
            backlog: LISTEN_BACKLOG,
        }
    }
}

pub fn courtesy_message() -> String {
    format!("{PROGRAM_NAME}: This server can not handle any more connections at this moment.\n")
}
