//! Re-entrancy guard
//!
//! While the shim is doing its own work (opening the backing file, looking up
//! credentials, talking to a local share) an interposer wrapped around libc
//! would see those calls too. The busy counter tells it to pass them straight
//! through. It is readable without taking the dispatcher lock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared busy counter
#[derive(Debug, Clone, Default)]
pub struct BusyFlag {
    depth: Arc<AtomicUsize>,
}

impl BusyFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shim-internal work is in progress
    pub fn is_busy(&self) -> bool {
        self.depth.load(Ordering::Acquire) > 0
    }

    /// Mark shim-internal work until the guard is dropped
    pub fn enter(&self) -> BusyGuard {
        self.depth.fetch_add(1, Ordering::AcqRel);
        BusyGuard {
            depth: Arc::clone(&self.depth),
        }
    }
}

/// Decrements the busy counter on drop
#[derive(Debug)]
pub struct BusyGuard {
    depth: Arc<AtomicUsize>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::AcqRel);
    }
}
