//! Process-wide dispatcher for interposers
//!
//! An interposer wrapping libc has nowhere to keep a [`Dispatcher`] but a
//! global. It checks [`is_busy`] first, without taking the lock, so calls the
//! shim makes on its own behalf go straight to the OS instead of deadlocking.

use crate::busy::BusyFlag;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use std::sync::{Mutex, OnceLock};
use tracing::error;

struct Installed {
    busy: BusyFlag,
    dispatcher: Mutex<Dispatcher>,
}

static GLOBAL: OnceLock<Installed> = OnceLock::new();

/// Install the process-wide dispatcher; fails if one is already installed
pub fn install(dispatcher: Dispatcher) -> Result<()> {
    let installed = Installed {
        busy: dispatcher.busy_flag(),
        dispatcher: Mutex::new(dispatcher),
    };
    GLOBAL
        .set(installed)
        .map_err(|_| Error::Config("dispatcher already installed".to_string()))
}

pub fn is_installed() -> bool {
    GLOBAL.get().is_some()
}

/// Whether the installed dispatcher is doing its own work
pub fn is_busy() -> bool {
    GLOBAL.get().map(|g| g.busy.is_busy()).unwrap_or(false)
}

/// Run `f` against the installed dispatcher.
///
/// Returns `None` when nothing is installed or the shim is busy, meaning the
/// caller should use the real call.
pub fn with<T, F>(f: F) -> Option<T>
where
    F: FnOnce(&mut Dispatcher) -> T,
{
    let installed = GLOBAL.get()?;
    if installed.busy.is_busy() {
        return None;
    }
    let mut guard = match installed.dispatcher.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            error!("Dispatcher lock poisoned; continuing with its state");
            poisoned.into_inner()
        }
    };
    Some(f(&mut guard))
}
