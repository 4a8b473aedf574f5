use std::io::{self, ErrorKind, Read};
use std::net::SocketAddr;
use std::os::fd::{AsFd, AsRawFd};

use mio::net::{TcpListener, TcpStream};
use socket2::{SockRef, TcpKeepalive};
use tracing::warn;

use crate::config::KeepaliveConfig;

#[cfg(not(target_vendor = "apple"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
// Apple has no MSG_NOSIGNAL; the socket carries SO_NOSIGPIPE instead.
#[cfg(target_vendor = "apple")]
const SEND_FLAGS: libc::c_int = 0;

#[derive(Debug, PartialEq, Eq)]
pub enum IoStatus<T> {
    Ready(T),
    WouldBlock,
}

#[derive(Debug)]
pub struct SendReport {
    pub sent: usize,
    pub error: Option<io::Error>,
}

impl SendReport {
    pub fn is_complete(&self, expected: usize) -> bool {
        self.error.is_none() && self.sent == expected
    }
}

pub fn set_nonblocking<S: AsFd>(socket: &S) -> io::Result<()> {
    SockRef::from(socket).set_nonblocking(true)
}

#[cfg(target_vendor = "apple")]
pub fn suppress_sigpipe<S: AsFd>(socket: &S) -> io::Result<()> {
    SockRef::from(socket).set_nosigpipe(true)
}

#[cfg(not(target_vendor = "apple"))]
pub fn suppress_sigpipe<S: AsFd>(_socket: &S) -> io::Result<()> {
    Ok(())
}

pub fn configure_keepalive<S: AsFd + AsRawFd>(socket: &S, config: &KeepaliveConfig) {
    let params = TcpKeepalive::new()
        .with_time(config.idle)
        .with_interval(config.interval)
        .with_retries(config.retries);

    if let Err(err) = SockRef::from(socket).set_tcp_keepalive(&params) {
        warn!(fd = socket.as_raw_fd(), ?err, "failed to configure keep-alive");
    }
}

pub fn bytes_available<S: AsRawFd>(socket: &S) -> io::Result<usize> {
    let mut pending: libc::c_int = 0;
    // SAFETY: FIONREAD writes a single c_int through the pointer, which
    // refers to a live local.
    let rc = unsafe { libc::ioctl(socket.as_raw_fd(), libc::FIONREAD, &mut pending) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(pending.max(0) as usize)
}

pub fn accept(listener: &TcpListener) -> io::Result<IoStatus<(TcpStream, SocketAddr)>> {
    loop {
        match listener.accept() {
            Ok(accepted) => return Ok(IoStatus::Ready(accepted)),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
            Err(err) => return Err(err),
        }
    }
}

pub fn recv<R: Read>(mut source: R, buf: &mut [u8]) -> io::Result<IoStatus<usize>> {
    loop {
        match source.read(buf) {
            Ok(n) => return Ok(IoStatus::Ready(n)),
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) if err.kind() == ErrorKind::WouldBlock => return Ok(IoStatus::WouldBlock),
            Err(err) => return Err(err),
        }
    }
}

/// Sends until `buf` is written out or a send fails. A vanished peer
/// yields `EPIPE`, never SIGPIPE.
pub fn send_all<S: AsFd>(socket: &S, buf: &[u8]) -> SendReport {
    let sock = SockRef::from(socket);
    let mut sent = 0;

    while sent < buf.len() {
        match sock.send_with_flags(&buf[sent..], SEND_FLAGS) {
            Ok(0) => break,
            Ok(n) => sent += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return SendReport { sent, error: Some(err) },
        }
    }

    SendReport { sent, error: None }
}
