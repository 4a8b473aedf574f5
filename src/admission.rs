use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd, RawFd};

use mio::net::{TcpListener, TcpStream};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{self, AddressKey, ServerConfig};
use crate::table::{Connection, ConnectionTable};
use crate::transport::{self, IoStatus};

#[derive(Debug)]
pub struct Admitted {
    pub stream: TcpStream,
    pub fd: RawFd,
    pub peer: SocketAddr,
    pub local: Option<SocketAddr>,
    /// Deduplication key chosen by [`AddressKey`].
    pub address: String,
}

#[derive(Debug, Error)]
pub enum AdmitError {
    #[error("accept failed: {0}")]
    Accept(#[source] io::Error),
    #[error("could not make socket {fd} non-blocking: {source}")]
    NonBlocking {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
}

/// Accepts one pending connection from `listener`.
///
/// Returns `Ok(None)` once the accept queue is empty. A socket that cannot
/// be made non-blocking is closed and only that connection fails.
pub fn admit(listener: &TcpListener, config: &ServerConfig) -> Result<Option<Admitted>, AdmitError> {
    let (stream, peer) = match transport::accept(listener).map_err(AdmitError::Accept)? {
        IoStatus::Ready(accepted) => accepted,
        IoStatus::WouldBlock => return Ok(None),
    };
    let fd = stream.as_raw_fd();

    transport::configure_keepalive(&stream, &config.keepalive);
    if let Err(err) = transport::suppress_sigpipe(&stream) {
        warn!(fd, ?err, "failed to set SO_NOSIGPIPE");
    }
    transport::set_nonblocking(&stream).map_err(|source| AdmitError::NonBlocking { fd, source })?;

    let local = match stream.local_addr() {
        Ok(addr) => Some(addr),
        Err(err) => {
            warn!(fd, ?err, "could not resolve local address");
            None
        }
    };

    let address = match config.address_key {
        AddressKey::Local => local.map(|addr| addr.ip().to_string()).unwrap_or_default(),
        AddressKey::Peer => peer.ip().to_string(),
    };

    info!(
        host = %peer.ip(),
        service = peer.port(),
        local_address = %address,
        fd,
        "new connection"
    );

    Ok(Some(Admitted {
        stream,
        fd,
        peer,
        local,
        address,
    }))
}

pub fn evict_same_address<S>(table: &mut ConnectionTable<S>, address: &str) -> Vec<Connection<S>> {
    let mut evicted = Vec::new();
    while let Some(slot) = table.find_by_address(address).map(|conn| conn.slot) {
        if let Some(conn) = table.remove(slot) {
            info!(fd = conn.fd, slot, address, "evicting connection from same address");
            evicted.push(conn);
        }
    }
    evicted
}

pub fn refuse<S: AsFd + AsRawFd>(stream: &S) {
    warn!(fd = stream.as_raw_fd(), "server overloaded, caution advised");

    let message = config::courtesy_message();
    let report = transport::send_all(stream, message.as_bytes());
    if let Some(err) = &report.error {
        warn!(fd = stream.as_raw_fd(), ?err, "failed to send overload message");
    } else if !report.is_complete(message.len()) {
        warn!(
            fd = stream.as_raw_fd(),
            sent = report.sent,
            "could not send the peer the full overload message"
        );
    }
}
