use std::os::fd::{AsFd, RawFd};

use tracing::{debug, warn};

use crate::readiness::ReadinessSet;
use crate::table::{Connection, ConnectionTable};
use crate::transport;

/// Descriptors in the readiness set that are never broadcast targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReservedFds {
    pub listener: RawFd,
    pub wakeup: RawFd,
}

impl ReservedFds {
    fn excludes(&self, fd: RawFd, sender: RawFd) -> bool {
        fd == sender || fd == self.listener || fd == self.wakeup
    }
}

/// Per-broadcast tally.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub short: usize,
    pub failed: usize,
}

/// Sends `buf` to every registered connection except `sender`.
///
/// Recipients are visited in ascending descriptor order. A failed or short
/// send is logged and the broadcast moves on to the next peer.
pub fn broadcast<S: AsFd>(
    buf: &[u8],
    sender: RawFd,
    reserved: ReservedFds,
    readiness: &ReadinessSet,
    table: &ConnectionTable<S>,
) -> Delivery {
    let mut delivery = Delivery::default();

    let mut targets: Vec<&Connection<S>> = table
        .iter()
        .filter(|conn| !reserved.excludes(conn.fd, sender) && readiness.contains(conn.fd))
        .collect();
    targets.sort_unstable_by_key(|conn| conn.fd);

    for conn in targets {
        let fd = conn.fd;
        let report = transport::send_all(&conn.stream, buf);
        match report.error {
            Some(ref err) => {
                warn!(fd, sent = report.sent, expected = buf.len(), ?err, "send failed");
                delivery.failed += 1;
            }
            None if !report.is_complete(buf.len()) => {
                warn!(fd, sent = report.sent, expected = buf.len(), "short send");
                delivery.short += 1;
            }
            None => delivery.delivered += 1,
        }
    }

    debug!(sender, len = buf.len(), ?delivery, "broadcast");
    delivery
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::socket_pair;
    use std::io::Read;
    use std::net::TcpStream as StdStream;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    struct Peer {
        client: StdStream,
        fd: RawFd,
    }

    fn registered_peers(n: usize) -> (ReadinessSet, ConnectionTable, Vec<Peer>) {
        let mut readiness = ReadinessSet::new().expect("poll");
        let mut table = ConnectionTable::new(8);
        let mut peers = Vec::new();

        for slot in 0..n {
            let (client, mut server) = socket_pair();
            let fd = server.as_raw_fd();
            readiness.register(&mut server, fd).expect("register");
            table.insert(slot, fd, format!("10.0.0.{slot}"), server);
            client
                .set_read_timeout(Some(Duration::from_millis(200)))
                .expect("timeout");
            peers.push(Peer { client, fd });
        }
        (readiness, table, peers)
    }

    fn read_some(client: &mut StdStream) -> Vec<u8> {
        let mut buf = [0u8; 64];
        match client.read(&mut buf) {
            Ok(n) => buf[..n].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    #[test]
    fn everyone_but_the_sender_receives() {
        let (readiness, table, mut peers) = registered_peers(3);
        let reserved = ReservedFds {
            listener: -1,
            wakeup: -2,
        };

        let delivery = broadcast(b"hi", peers[0].fd, reserved, &readiness, &table);
        assert_eq!(delivery.delivered, 2);
        assert_eq!(delivery.failed + delivery.short, 0);

        assert_eq!(read_some(&mut peers[1].client), b"hi");
        assert_eq!(read_some(&mut peers[2].client), b"hi");
        assert!(read_some(&mut peers[0].client).is_empty());
    }

    #[test]
    fn reserved_descriptors_are_skipped() {
        let (readiness, table, mut peers) = registered_peers(3);
        let reserved = ReservedFds {
            listener: peers[1].fd,
            wakeup: peers[2].fd,
        };

        let delivery = broadcast(b"x", peers[0].fd, reserved, &readiness, &table);
        assert_eq!(delivery, Delivery::default());
        assert!(read_some(&mut peers[1].client).is_empty());
    }

    #[test]
    fn a_dead_peer_does_not_stop_delivery() {
        let (readiness, table, mut peers) = registered_peers(3);
        let reserved = ReservedFds {
            listener: -1,
            wakeup: -2,
        };
        let dead = peers.remove(1);
        drop(dead.client);
        std::thread::sleep(Duration::from_millis(50));

        // The first write to a reset peer may still succeed; keep sending
        // until the kernel reports the failure.
        let mut failed = 0;
        for _ in 0..20 {
            let delivery = broadcast(b"ping", peers[0].fd, reserved, &readiness, &table);
            failed += delivery.failed;
            assert_eq!(delivery.delivered + delivery.failed + delivery.short, 2);
        }

        assert!(failed > 0);
        assert!(read_some(&mut peers[1].client).starts_with(b"ping"));
    }

    #[test]
    fn unregistered_table_entry_is_not_a_target() {
        let mut readiness = ReadinessSet::new().expect("poll");
        let mut table = ConnectionTable::new(4);
        let (_sender, sender_stream) = socket_pair();
        let (mut watched, mut watched_stream) = socket_pair();
        let (mut stray, stray_stream) = socket_pair();
        let sender_fd = sender_stream.as_raw_fd();
        let watched_fd = watched_stream.as_raw_fd();

        readiness
            .register(&mut watched_stream, watched_fd)
            .expect("register");
        // Highest slots hold the lowest descriptors.
        table.insert(3, sender_fd, "a".into(), sender_stream);
        table.insert(2, watched_fd, "b".into(), watched_stream);
        table.insert(0, stray_stream.as_raw_fd(), "c".into(), stray_stream);
        for client in [&mut watched, &mut stray] {
            client
                .set_read_timeout(Some(Duration::from_millis(200)))
                .expect("timeout");
        }

        let reserved = ReservedFds {
            listener: -1,
            wakeup: -2,
        };
        let delivery = broadcast(b"only you", sender_fd, reserved, &readiness, &table);
        assert_eq!(delivery.delivered, 1);
        assert_eq!(read_some(&mut watched), b"only you");
        assert!(read_some(&mut stray).is_empty());
    }
}
