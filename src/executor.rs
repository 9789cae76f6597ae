//! Bounded execution of remote operations
//!
//! The collaborator traits are async; the shim is not. Every remote call is
//! driven to completion on a private current-thread runtime and abandoned
//! with [`Error::Timeout`] once the configured bound elapses.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::warn;

/// Runs remote futures synchronously under a timeout
#[derive(Debug)]
pub struct Executor {
    runtime: Runtime,
    timeout: Duration,
}

impl Executor {
    /// Create an executor with its own runtime
    pub fn new(timeout: Duration) -> Result<Self> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        Ok(Self { runtime, timeout })
    }

    /// Timeout applied to each operation
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Block on `fut`, failing with `Error::Timeout` if it does not finish in time
    pub fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timeout = self.timeout;
        self.runtime.block_on(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Remote operation exceeded {:?}", timeout);
                    Err(Error::Timeout)
                }
            }
        })
    }

    /// Replace the runtime in a forked child without dropping the inherited one.
    ///
    /// The inherited runtime's poll instance is shared with the parent, so
    /// tearing it down here would deregister the parent's sockets.
    pub fn reset_after_fork(&mut self) -> Result<()> {
        let fresh = Builder::new_current_thread().enable_all().build()?;
        let inherited = std::mem::replace(&mut self.runtime, fresh);
        std::mem::forget(inherited);
        Ok(())
    }
}
