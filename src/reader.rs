use std::os::fd::AsRawFd;

use mio::net::TcpStream;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::transport::{self, IoStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub page_size: usize,
    pub page_limit: usize,
}

impl ReadLimits {
    pub fn max_len(&self) -> usize {
        self.page_size.saturating_mul(self.page_limit)
    }
}

impl From<&ServerConfig> for ReadLimits {
    fn from(config: &ServerConfig) -> Self {
        Self {
            page_size: config.page_size,
            page_limit: config.page_limit,
        }
    }
}

fn next_page(limits: &ReadLimits, held: usize) -> usize {
    limits.page_size.min(limits.max_len().saturating_sub(held))
}

#[derive(Debug, Error)]
pub enum ReadOutcome {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("receive failed: {0}")]
    Failed(#[source] std::io::Error),
    #[error("socket had nothing to read")]
    WouldBlock,
    #[error("buffer allocation failed")]
    OutOfMemory,
    #[error("peer exceeded {limit} buffered bytes")]
    AbusiveLength { limit: usize },
}

impl ReadOutcome {
    pub fn ends_connection(&self) -> bool {
        matches!(
            self,
            Self::PeerClosed | Self::Failed(_) | Self::AbusiveLength { .. }
        )
    }
}

/// Reads every byte `stream` has immediately available.
///
/// The buffer grows one page at a time and each page is filled by a single
/// receive. The last page is cut short so the buffer never passes
/// `limits.max_len()`. After a receive the queued byte count decides whether to loop.
/// Once `limits.max_len()` bytes are held and the peer still has data
/// queued, the read is abandoned as [`ReadOutcome::AbusiveLength`].
pub fn read_frame(stream: &TcpStream, limits: &ReadLimits) -> Result<Vec<u8>, ReadOutcome> {
    let fd = stream.as_raw_fd();
    let max_len = limits.max_len();
    let mut buf: Vec<u8> = Vec::new();

    loop {
        if buf.len() >= max_len {
            info!(fd, limit = max_len, "peer exceeded read limit, likely a flood");
            return Err(ReadOutcome::AbusiveLength { limit: max_len });
        }

        let start = buf.len();
        let page = next_page(limits, start);
        if buf.try_reserve_exact(page).is_err() {
            return Err(ReadOutcome::OutOfMemory);
        }
        buf.resize(start + page, 0);

        match transport::recv(stream, &mut buf[start..]) {
            Ok(IoStatus::Ready(0)) => {
                info!(fd, "socket hung up");
                return Err(ReadOutcome::PeerClosed);
            }
            Ok(IoStatus::Ready(n)) => {
                buf.truncate(start + n);
                match transport::bytes_available(stream) {
                    Ok(0) => return Ok(buf),
                    Ok(pending) => debug!(fd, pending, buffered = buf.len(), "more data queued"),
                    Err(err) => {
                        info!(fd, ?err, "could not query pending bytes");
                        return Err(ReadOutcome::PeerClosed);
                    }
                }
            }
            Ok(IoStatus::WouldBlock) => {
                buf.truncate(start);
                if buf.is_empty() {
                    return Err(ReadOutcome::WouldBlock);
                }
                return Ok(buf);
            }
            Err(err) => return Err(ReadOutcome::Failed(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::{socket_pair, wait_for_bytes};
    use std::io::Write;

    const LIMITS: ReadLimits = ReadLimits {
        page_size: 64,
        page_limit: 10,
    };

    #[test]
    fn reads_a_short_message_in_one_page() {
        let (mut client, server) = socket_pair();
        client.write_all(b"hi").expect("write");
        wait_for_bytes(&server, 2);

        let buf = read_frame(&server, &LIMITS).expect("data");
        assert_eq!(buf, b"hi");
    }

    #[test]
    fn reads_across_several_pages() {
        let (mut client, server) = socket_pair();
        let payload: Vec<u8> = (0..300u32).map(|i| (i % 251) as u8).collect();
        client.write_all(&payload).expect("write");
        wait_for_bytes(&server, payload.len());

        let buf = read_frame(&server, &LIMITS).expect("data");
        assert_eq!(buf, payload);
    }

    #[test]
    fn exactly_the_limit_is_still_accepted() {
        let (mut client, server) = socket_pair();
        let payload = vec![b'a'; LIMITS.max_len()];
        client.write_all(&payload).expect("write");
        wait_for_bytes(&server, payload.len());

        let buf = read_frame(&server, &LIMITS).expect("data");
        assert_eq!(buf.len(), LIMITS.max_len());
    }

    #[test]
    fn last_page_stops_at_the_limit() {
        assert_eq!(next_page(&LIMITS, 0), 64);
        assert_eq!(next_page(&LIMITS, 600), 40);
        assert_eq!(next_page(&LIMITS, LIMITS.max_len() - 1), 1);
        assert_eq!(next_page(&LIMITS, LIMITS.max_len()), 0);
    }

    #[test]
    fn abusive_read_consumes_exactly_the_limit() {
        let (mut client, server) = socket_pair();
        client.write_all(&vec![b'b'; LIMITS.max_len() + 1]).expect("write");
        wait_for_bytes(&server, LIMITS.max_len() + 1);
        let outcome = read_frame(&server, &LIMITS).expect_err("over the limit");
        assert!(matches!(outcome, ReadOutcome::AbusiveLength { .. }));
        assert_eq!(transport::bytes_available(&server).expect("FIONREAD"), 1);
    }

    #[test]
    fn flooding_peer_is_classified_abusive() {
        let (mut client, server) = socket_pair();
        let payload = vec![b'x'; LIMITS.page_size * 50];
        client.write_all(&payload).expect("write");
        wait_for_bytes(&server, payload.len());

        let outcome = read_frame(&server, &LIMITS).expect_err("flood");
        assert!(matches!(outcome, ReadOutcome::AbusiveLength { limit } if limit == 640));
        assert!(outcome.ends_connection());
    }

    #[test]
    fn empty_socket_would_block() {
        let (_client, server) = socket_pair();
        let outcome = read_frame(&server, &LIMITS).expect_err("nothing queued");
        assert!(matches!(outcome, ReadOutcome::WouldBlock));
        assert!(!outcome.ends_connection());
    }

    #[test]
    fn orderly_shutdown_is_peer_closed() {
        let (client, server) = socket_pair();
        drop(client);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        loop {
            match read_frame(&server, &LIMITS) {
                Err(ReadOutcome::PeerClosed) => break,
                Err(ReadOutcome::WouldBlock) if std::time::Instant::now() < deadline => {
                    std::thread::sleep(std::time::Duration::from_millis(5));
                }
                other => panic!("unexpected read result: {other:?}"),
            }
        }
    }
}
