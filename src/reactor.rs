//! The single-threaded event loop.
//!
//! One [`Reactor`] owns the listener, the wakeup pipe, the readiness set
//! and the connection table. It blocks only in the readiness wait. Ready
//! descriptors are handled in ascending order: the wakeup pipe may stop the
//! loop, the listener admits peers, and every other descriptor is read and
//! its bytes fanned out to everyone else.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use mio::Events;
use mio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::admission::{self, AdmitError, Admitted};
use crate::broadcast::{self, ReservedFds};
use crate::config::ServerConfig;
use crate::error::ReactorError;
use crate::log::LogSink;
use crate::readiness::{self, ReadinessSet};
use crate::reader::{self, ReadLimits, ReadOutcome};
use crate::signal::{SignalSource, Wakeup};
use crate::table::{Connection, ConnectionTable};

/// Everything process-wide the reactor needs, passed in explicitly.
pub struct ServerContext {
    pub config: ServerConfig,
    pub log: Box<dyn LogSink>,
    pub signals: SignalSource,
}

impl ServerContext {
    pub fn new(config: ServerConfig, log: impl LogSink + 'static, signals: SignalSource) -> Self {
        Self {
            config,
            log: Box::new(log),
            signals,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReactorState {
    Idle,
    Running,
    Draining,
    Stopped,
}

/// Counters published by the reactor thread for observers on other threads.
#[derive(Debug, Default)]
pub struct ReactorStats {
    active: AtomicUsize,
    evicted: AtomicU64,
    refused: AtomicU64,
    closed: AtomicU64,
}

impl ReactorStats {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn refused(&self) -> u64 {
        self.refused.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    fn set_active(&self, n: usize) {
        self.active.store(n, Ordering::Relaxed);
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Ready {
    fd: RawFd,
    read_closed: bool,
}

enum Flow {
    Continue,
    Stop,
}

pub struct Reactor {
    listener: TcpListener,
    readiness: ReadinessSet,
    table: ConnectionTable,
    ctx: ServerContext,
    limits: ReadLimits,
    reserved: ReservedFds,
    active: usize,
    state: ReactorState,
    stats: Arc<ReactorStats>,
}

impl Reactor {
    /// Registers the listener and the wakeup pipe. `listener` must already
    /// be listening and non-blocking.
    pub fn new(mut listener: TcpListener, mut ctx: ServerContext) -> Result<Self, ReactorError> {
        let mut readiness = ReadinessSet::new().map_err(ReactorError::Setup)?;

        let listener_fd = listener.as_raw_fd();
        readiness
            .register(&mut listener, listener_fd)
            .map_err(|source| ReactorError::Register {
                fd: listener_fd,
                source,
            })?;

        let wakeup_fd = ctx.signals.fd();
        readiness
            .register(ctx.signals.receiver_mut(), wakeup_fd)
            .map_err(|source| ReactorError::Register {
                fd: wakeup_fd,
                source,
            })?;

        Ok(Self {
            listener,
            readiness,
            table: ConnectionTable::new(ctx.config.capacity),
            limits: ReadLimits::from(&ctx.config),
            reserved: ReservedFds {
                listener: listener_fd,
                wakeup: wakeup_fd,
            },
            ctx,
            active: 0,
            state: ReactorState::Idle,
            stats: Arc::new(ReactorStats::default()),
        })
    }

    pub fn state(&self) -> ReactorState {
        self.state
    }

    pub fn active_count(&self) -> usize {
        self.active
    }

    pub fn stats(&self) -> Arc<ReactorStats> {
        Arc::clone(&self.stats)
    }

    pub fn waker(&self) -> Wakeup {
        self.ctx.signals.waker()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until a wakeup arrives or a fatal error occurs, then drains.
    ///
    /// Returns `Ok(())` for a requested shutdown. A reactor that already
    /// ran returns immediately.
    pub fn run(&mut self) -> Result<(), ReactorError> {
        if self.state != ReactorState::Idle {
            return Ok(());
        }
        self.state = ReactorState::Running;
        info!(
            listener = self.reserved.listener,
            wakeup = self.reserved.wakeup,
            "reactor running"
        );

        let mut events = Events::with_capacity(self.table.capacity() + 2);
        let mut ready: Vec<Ready> = Vec::new();

        let outcome = loop {
            if let Err(err) = self.readiness.wait(&mut events) {
                if matches!(err.kind(), ErrorKind::Interrupted | ErrorKind::WouldBlock) {
                    continue;
                }
                break Err(ReactorError::Wait(err));
            }

            ready.clear();
            ready.extend(events.iter().map(|event| Ready {
                fd: readiness::descriptor(event.token()),
                read_closed: event.is_read_closed() || event.is_error(),
            }));
            ready.sort_unstable_by_key(|r| r.fd);

            match self.dispatch(&ready) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => break Ok(()),
                Err(err) => break Err(err),
            }
        };

        if let Err(err) = &outcome {
            error!(%err, "fatal error, shutting down");
        }
        self.shutdown();
        outcome
    }

    /// Flushes the log and stops. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if matches!(self.state, ReactorState::Draining | ReactorState::Stopped) {
            return;
        }
        self.state = ReactorState::Draining;

        if let Err(err) = self.ctx.log.flush() {
            error!(?err, "log flush failed, logs might have been lost");
        }

        self.state = ReactorState::Stopped;
        info!(active = self.active, "reactor stopped");
    }

    fn dispatch(&mut self, ready: &[Ready]) -> Result<Flow, ReactorError> {
        for r in ready {
            if r.fd == self.reserved.wakeup {
                if !self.ctx.signals.notify() {
                    info!("shutdown requested");
                    return Ok(Flow::Stop);
                }
            } else if r.fd == self.reserved.listener {
                self.accept_pending();
            } else {
                self.service(r.fd, r.read_closed)?;
            }
        }
        Ok(Flow::Continue)
    }

    /// Admits until the accept queue is empty; readiness is edge-triggered.
    fn accept_pending(&mut self) {
        loop {
            match admission::admit(&self.listener, &self.ctx.config) {
                Ok(Some(admitted)) => self.install(admitted),
                Ok(None) => break,
                Err(err @ AdmitError::Accept(_)) => {
                    warn!(%err, "accept failed");
                    break;
                }
                Err(err) => warn!(%err, "dropping connection"),
            }
        }
    }

    fn install(&mut self, admitted: Admitted) {
        let Admitted {
            mut stream,
            fd,
            address,
            ..
        } = admitted;

        if fd >= self.ctx.config.max_descriptor || self.active >= self.table.capacity() {
            self.refuse(stream);
            return;
        }

        for conn in admission::evict_same_address(&mut self.table, &address) {
            ReactorStats::bump(&self.stats.evicted);
            self.release(conn);
        }

        let Some(slot) = self.table.find_empty_slot() else {
            self.refuse(stream);
            return;
        };

        if let Err(err) = self.readiness.register(&mut stream, fd) {
            error!(fd, ?err, "failed to set up a socket");
            return;
        }

        self.table.insert(slot, fd, address, stream);
        self.active += 1;
        self.stats.set_active(self.active);
        debug_assert_eq!(self.active, self.table.occupied());
        debug!(fd, slot, active = self.active, "connection registered");
    }

    fn refuse(&mut self, stream: TcpStream) {
        ReactorStats::bump(&self.stats.refused);
        admission::refuse(&stream);
    }

    fn service(&mut self, fd: RawFd, read_closed: bool) -> Result<(), ReactorError> {
        loop {
            let Some(conn) = self.table.find_by_socket(fd) else {
                return Ok(());
            };

            match reader::read_frame(&conn.stream, &self.limits) {
                Ok(buf) => {
                    broadcast::broadcast(&buf, fd, self.reserved, &self.readiness, &self.table);
                    // An EOF queued behind the data raises no further edge.
                    if !read_closed {
                        return Ok(());
                    }
                }
                Err(ReadOutcome::WouldBlock) => return Ok(()),
                Err(ReadOutcome::OutOfMemory) => return Err(ReactorError::OutOfMemory { fd }),
                Err(outcome) => {
                    self.close(fd, &outcome);
                    return Ok(());
                }
            }
        }
    }

    fn close(&mut self, fd: RawFd, reason: &ReadOutcome) {
        let Some(slot) = self.table.find_by_socket(fd).map(|conn| conn.slot) else {
            return;
        };
        if let Some(conn) = self.table.remove(slot) {
            info!(fd, slot, %reason, "closing connection");
            ReactorStats::bump(&self.stats.closed);
            self.release(conn);
        }
    }

    /// Deregisters a connection already taken out of the table and closes it.
    fn release(&mut self, mut conn: Connection) {
        if let Err(err) = self.readiness.deregister(&mut conn.stream, conn.fd) {
            debug!(fd = conn.fd, ?err, "deregister failed");
        }
        self.active -= 1;
        self.stats.set_active(self.active);
    }
}
