use std::collections::BTreeSet;
use std::io;
use std::os::fd::RawFd;

use mio::event::Source;
use mio::{Events, Interest, Poll, Token};

/// Descriptors the reactor waits on.
///
/// Every source is registered for readability under a token equal to its
/// descriptor, so sorting ready events by token yields ascending
/// descriptor order.
#[derive(Debug)]
pub struct ReadinessSet {
    poll: Poll,
    registered: BTreeSet<RawFd>,
}

pub fn token(fd: RawFd) -> Token {
    Token(fd as usize)
}

pub fn descriptor(token: Token) -> RawFd {
    token.0 as RawFd
}

impl ReadinessSet {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            registered: BTreeSet::new(),
        })
    }

    pub fn register<S>(&mut self, source: &mut S, fd: RawFd) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.poll
            .registry()
            .register(source, token(fd), Interest::READABLE)?;
        self.registered.insert(fd);
        Ok(())
    }

    /// Stops watching `fd`. The descriptor is forgotten even if the
    /// registry call fails, since the caller closes it right after.
    pub fn deregister<S>(&mut self, source: &mut S, fd: RawFd) -> io::Result<()>
    where
        S: Source + ?Sized,
    {
        self.registered.remove(&fd);
        self.poll.registry().deregister(source)
    }

    pub fn wait(&mut self, events: &mut Events) -> io::Result<()> {
        self.poll.poll(events, None)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.registered.contains(&fd)
    }

    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.registered.iter().copied()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.registered.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::tests::socket_pair;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    #[test]
    fn tracks_registered_descriptors_in_order() {
        let mut set = ReadinessSet::new().expect("poll");
        let (_c1, mut s1) = socket_pair();
        let (_c2, mut s2) = socket_pair();
        let (fd1, fd2) = (s1.as_raw_fd(), s2.as_raw_fd());

        set.register(&mut s2, fd2).expect("register");
        set.register(&mut s1, fd1).expect("register");

        let mut expected = vec![fd1, fd2];
        expected.sort_unstable();
        assert_eq!(set.iter().collect::<Vec<_>>(), expected);

        set.deregister(&mut s1, fd1).expect("deregister");
        assert!(!set.contains(fd1));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn wait_reports_readable_socket_by_descriptor_token() {
        let mut set = ReadinessSet::new().expect("poll");
        let (mut client, mut server) = socket_pair();
        let fd = server.as_raw_fd();
        set.register(&mut server, fd).expect("register");

        client.write_all(b"ping").expect("write");

        let mut events = Events::with_capacity(8);
        set.poll
            .poll(&mut events, Some(Duration::from_secs(5)))
            .expect("poll");
        let ready: Vec<RawFd> = events.iter().map(|e| descriptor(e.token())).collect();
        assert_eq!(ready, vec![fd]);
    }
}
