use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use anyhow::{Context, Result, bail};
use mio::net::TcpListener;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::log::LogSink;
use crate::reactor::{Reactor, ServerContext};
use crate::signal::{SignalSource, TERMINATION_SIGNALS};

fn candidates(config: &ServerConfig) -> Vec<SocketAddr> {
    match config.bind {
        Some(ip) => vec![SocketAddr::new(ip, config.port)],
        None => vec![
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), config.port),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), config.port),
        ],
    }
}

/// Binds the first candidate address that accepts a bind, then listens.
///
/// The IPv6 wildcard is tried first with `IPV6_V6ONLY` off, so one socket
/// serves both families where the platform allows it.
pub fn bind(config: &ServerConfig) -> Result<TcpListener> {
    for addr in candidates(config) {
        let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
            Ok(socket) => socket,
            Err(err) => {
                warn!(%addr, ?err, "socket creation failed");
                continue;
            }
        };

        if addr.is_ipv6() {
            if let Err(err) = socket.set_only_v6(false) {
                warn!(%addr, ?err, "could not enable dual-stack");
            }
        }
        if let Err(err) = socket.set_reuse_address(true) {
            warn!(%addr, ?err, "could not set SO_REUSEADDR");
        }
        if let Err(err) = socket.bind(&addr.into()) {
            warn!(%addr, ?err, "bind failed");
            continue;
        }

        socket
            .set_nonblocking(true)
            .with_context(|| format!("failed to make {addr} non-blocking"))?;
        socket
            .listen(config.backlog)
            .with_context(|| format!("failed to listen on {addr}"))?;

        let listener: std::net::TcpListener = socket.into();
        return Ok(TcpListener::from_std(listener));
    }

    error!(port = config.port, "failed to set up a socket");
    bail!("no address could be bound on port {}", config.port)
}

pub fn run(config: ServerConfig, log: impl LogSink + 'static) -> Result<()> {
    let mut signals = SignalSource::new().context("failed to create the wakeup pipe")?;
    signals
        .install(&TERMINATION_SIGNALS)
        .context("failed to install signal handlers")?;

    let listener = bind(&config)?;
    let port = listener.local_addr().map(|addr| addr.port()).unwrap_or(config.port);
    info!(port, "listening for connections");

    let ctx = ServerContext::new(config, log, signals);
    let mut reactor = Reactor::new(listener, ctx)?;
    reactor.run()?;

    Ok(())
}
