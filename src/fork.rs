//! Parent/child handshake around `fork()`
//!
//! The parent must not touch shared sessions until the child has let go of
//! its inherited copies, so the child writes one byte on a pipe once its
//! cleanup is done and the parent blocks on reading it.

use crate::realcalls;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::OwnedFd;
use tracing::{debug, warn};

/// Who we are after a fork
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkOutcome {
    /// The parent, holding the child's pid
    Parent(libc::pid_t),
    Child,
}

/// Both ends of the handshake pipe, created before forking
#[derive(Debug)]
pub struct ForkGuard {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl ForkGuard {
    /// Create the pipe; `None` means fork without a handshake
    pub fn prepare() -> Option<Self> {
        match realcalls::pipe() {
            Ok((rx, tx)) => Some(Self { rx, tx }),
            Err(e) => {
                warn!("Fork handshake pipe unavailable: {}", e);
                None
            }
        }
    }

    /// Parent side: wait until the child has finished its cleanup
    pub fn wait_for_child(self) {
        drop(self.tx);
        let mut rx = File::from(self.rx);
        let mut byte = [0u8; 1];
        // EOF means the child died before signalling, which releases us too
        match rx.read(&mut byte) {
            Ok(_) => debug!("Child released fork handshake"),
            Err(e) => warn!("Fork handshake read failed: {}", e),
        }
    }

    /// Child side: tell the parent cleanup is done
    pub fn release_parent(self) {
        drop(self.rx);
        let mut tx = File::from(self.tx);
        if let Err(e) = tx.write_all(&[1]) {
            warn!("Fork handshake write failed: {}", e);
        }
    }
}
