//! Error types.
//!
//! Everything in [`TargetError`] is fatal: it can only happen during startup
//! (or indicates a corrupted gadget) and the process is expected to report it
//! and exit without entering the dispatch loop.

use std::io;
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TargetError {
    #[error("unable to open {path}: {source}")]
    DeviceOpen {
        path: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("peripheral memory map failed: {0}")]
    DeviceMap(#[source] io::Error),

    #[error("failed to allocate {what}: {source}")]
    BufferAlloc {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to allocate executable memory: {0}")]
    CodeAlloc(#[source] nix::Error),

    #[error("failed to assemble gadget template: {0}")]
    Assemble(String),

    #[error("gadget template mismatch at word {index}: \
        expected {expected:08x}, found {found:08x}")]
    TemplateMismatch {
        index: usize,
        expected: u32,
        found: u32,
    },

    #[error("failed to register fault handler: {0}")]
    FaultHandler(#[source] nix::Error),

    #[error("error while binding socket to {addr}: {source}")]
    SocketBind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("invalid {what} {value}: {reason}")]
    InvalidConfig {
        what: &'static str,
        value: usize,
        reason: &'static str,
    },

    #[error("couldn't pin to CPU core {core}: {source}")]
    Pinning {
        core: usize,
        #[source]
        source: nix::Error,
    },
}

/// A failure while serving a single request. Only [`DispatchError::Integrity`]
/// is fatal.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("error while receiving message: {0}")]
    Receive(#[source] io::Error),

    #[error("error while sending reply: {0}")]
    Reply(#[source] io::Error),

    /// The leak primitive found the target in an inconsistent state.
    #[error("integrity check failed: {0}")]
    Integrity(#[from] TargetError),
}

impl DispatchError {
    /// Returns true when the dispatch loop must not continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Integrity(_))
    }
}

pub type TargetResult<T> = Result<T, TargetError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn template_mismatch_message() {
        let e = TargetError::TemplateMismatch {
            index: 7, expected: 0xd503_201f, found: 0xdead_beef,
        };
        assert_eq!(e.to_string(),
            "gadget template mismatch at word 7: expected d503201f, found deadbeef"
        );
    }
}
