//! Termination signals delivered through a self-pipe.
//!
//! The signal handler writes one byte into a non-blocking pipe whose read
//! end sits in the reactor's readiness set. A signal that lands just before
//! the reactor blocks therefore still wakes it.

use std::io::{self, ErrorKind, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::{mem, ptr};

use libc::c_int;
use mio::unix::pipe;
use tracing::debug;

/// Signals that stop the server, unless the environment already ignores them.
pub const TERMINATION_SIGNALS: [c_int; 6] = [
    libc::SIGALRM,
    libc::SIGHUP,
    libc::SIGINT,
    libc::SIGPIPE,
    libc::SIGQUIT,
    libc::SIGTERM,
];

const WAKE_BYTE: &[u8] = b"x";

/// Write end of the pipe the installed handler writes to; -1 when unset.
static HANDLER_FD: AtomicI32 = AtomicI32::new(-1);

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno_location() }
}

#[cfg(any(target_vendor = "apple", target_os = "freebsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__error() }
}

#[cfg(any(target_os = "netbsd", target_os = "openbsd"))]
unsafe fn errno_location() -> *mut c_int {
    unsafe { libc::__errno() }
}

extern "C" fn on_signal(sig: c_int) {
    // Only async-signal-safe calls below.
    unsafe {
        let errno = errno_location();
        let saved = *errno;
        let fd = HANDLER_FD.load(Ordering::Relaxed);

        if libc::write(fd, WAKE_BYTE.as_ptr().cast(), 1) == -1 && *errno != libc::EAGAIN {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
        }
        *errno = saved;
    }
}

fn check(rc: c_int) -> io::Result<()> {
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Owner of the wakeup pipe.
#[derive(Debug)]
pub struct SignalSource {
    receiver: pipe::Receiver,
    sender: Arc<pipe::Sender>,
    installed: bool,
}

/// Cloneable handle that wakes the reactor exactly like a signal would.
#[derive(Debug, Clone)]
pub struct Wakeup {
    sender: Arc<pipe::Sender>,
}

impl Wakeup {
    pub fn wake(&self) -> io::Result<()> {
        let mut sender = &*self.sender;
        match sender.write(WAKE_BYTE) {
            Ok(_) => Ok(()),
            // A full pipe already holds a pending wakeup.
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }
}

impl SignalSource {
    /// Creates the non-blocking pipe without touching signal dispositions.
    pub fn new() -> io::Result<Self> {
        let (sender, receiver) = pipe::new()?;
        Ok(Self {
            receiver,
            sender: Arc::new(sender),
            installed: false,
        })
    }

    /// Routes every signal in `signals` that is not currently ignored to the
    /// pipe. Returns the signals that were installed.
    pub fn install(&mut self, signals: &[c_int]) -> io::Result<Vec<c_int>> {
        let mut caught = Vec::new();

        // SAFETY: sigset_t and sigaction are plain C structs for which the
        // all-zero pattern is valid; every pointer passed refers to a live
        // local or is null where the call permits it.
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            check(libc::sigemptyset(&mut mask))?;

            for &sig in signals {
                let mut current: libc::sigaction = mem::zeroed();
                check(libc::sigaction(sig, ptr::null(), &mut current))?;
                if current.sa_sigaction != libc::SIG_IGN {
                    check(libc::sigaddset(&mut mask, sig))?;
                    caught.push(sig);
                }
            }

            if caught.is_empty() {
                return Ok(caught);
            }
            HANDLER_FD.store(self.sender.as_raw_fd(), Ordering::SeqCst);
            self.installed = true;

            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = on_signal as extern "C" fn(c_int) as libc::sighandler_t;
            action.sa_mask = mask;
            action.sa_flags = libc::SA_RESTART;

            for &sig in &caught {
                check(libc::sigaction(sig, &action, ptr::null_mut()))?;
            }
        }

        debug!(?caught, "termination handlers installed");
        Ok(caught)
    }

    /// Read end of the pipe, for registration in the readiness set.
    pub fn receiver_mut(&mut self) -> &mut pipe::Receiver {
        &mut self.receiver
    }

    pub fn fd(&self) -> RawFd {
        self.receiver.as_raw_fd()
    }

    pub fn waker(&self) -> Wakeup {
        Wakeup {
            sender: Arc::clone(&self.sender),
        }
    }

    /// Drains one wakeup byte. Returns `true` while the server should keep
    /// running: only an empty pipe (a spurious wakeup) keeps it going.
    pub fn notify(&mut self) -> bool {
        let mut byte = [0u8; 1];
        let mut receiver = &self.receiver;
        match receiver.read(&mut byte) {
            Ok(_) => false,
            Err(err) if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) => true,
            Err(err) => {
                debug!(?err, "wakeup pipe read failed");
                false
            }
        }
    }
}

impl Drop for SignalSource {
    fn drop(&mut self) {
        if self.installed {
            let _ = HANDLER_FD.compare_exchange(
                self.sender.as_raw_fd(),
                -1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
    }
}
