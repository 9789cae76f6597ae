//! Transparent SMB filesystem shim
//!
//! POSIX-shaped file operations that route paths under a virtual prefix
//! (`/smb/WORKGROUP/SERVER/share/...`) to pooled SMB sessions and pass
//! everything else through to the real operating system.

#![allow(missing_docs)]
#![deny(unsafe_code)]

pub mod busy;
pub mod config;
pub mod credentials;
pub mod dir;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod fork;
pub mod global;
pub mod handles;
pub mod netbios;
pub mod path;
pub mod realcalls;
pub mod registry;
pub mod remote;
pub mod stat;

#[cfg(test)]
pub mod e2e_tests;

pub use config::ShimConfig;
pub use dispatch::{Dispatcher, SysResult};
pub use error::{Errno, Error, Result};
pub use fork::ForkOutcome;
pub use path::{PathResolver, VirtualPath};
pub use remote::{LocalNetwork, MemoryNetwork};
