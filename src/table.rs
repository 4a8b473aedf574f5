use std::os::fd::RawFd;

use mio::net::TcpStream;

pub type SlotId = usize;

#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    pub stream: S,
    pub fd: RawFd,
    pub address: String,
    pub slot: SlotId,
}

#[derive(Debug)]
pub struct ConnectionTable<S = TcpStream> {
    slots: Vec<Option<Connection<S>>>,
}

impl<S> ConnectionTable<S> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn find_empty_slot(&self) -> Option<SlotId> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn insert(&mut self, slot: SlotId, fd: RawFd, address: String, stream: S) {
        debug_assert!(self.slots[slot].is_none(), "slot {slot} already occupied");
        self.slots[slot] = Some(Connection {
            stream,
            fd,
            address,
            slot,
        });
    }

    // Dropping the returned connection closes its socket.
    pub fn remove(&mut self, slot: SlotId) -> Option<Connection<S>> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    pub fn find<P>(&self, mut pred: P) -> Option<&Connection<S>>
    where
        P: FnMut(&Connection<S>) -> bool,
    {
        self.slots.iter().flatten().find(|conn| pred(conn))
    }

    pub fn find_by_socket(&self, fd: RawFd) -> Option<&Connection<S>> {
        self.find(|conn| conn.fd == fd)
    }

    pub fn find_by_address(&self, address: &str) -> Option<&Connection<S>> {
        self.find(|conn| conn.address == address)
    }

    pub fn occupied(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection<S>> {
        self.slots.iter().flatten()
    }
}
