use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Conditions that stop the whole server.
#[derive(Debug, Error)]
pub enum ReactorError {
    #[error("failed to create the readiness set: {0}")]
    Setup(#[source] io::Error),

    #[error("failed to register descriptor {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("readiness wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("out of memory while reading from socket {fd}")]
    OutOfMemory { fd: RawFd },
}
