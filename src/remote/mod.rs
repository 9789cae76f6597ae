//! Remote protocol interface
//!
//! The shim never speaks SMB on the wire itself. It drives a client through
//! these traits: an [`SmbConnector`] that resolves names and opens
//! connections, and one [`SmbConnection`] per session.
//!
//! Errors follow a fixed convention so the registry can tell stages apart:
//! `Error::Remote(LogonFailure | AccessDenied)` from `session_setup` means the
//! credentials were refused, `Error::Remote(_)` from `connect` means the
//! NetBIOS session request was rejected.

pub mod local;
pub mod memory;

use crate::config::ClientIdentity;
use crate::credentials::Credentials;
use crate::error::Result;
use crate::stat::FileAttributes;
use async_trait::async_trait;
use bitflags::bitflags;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::net::IpAddr;

pub use local::LocalNetwork;
pub use memory::MemoryNetwork;

bitflags! {
    /// POSIX open flags understood by the shim
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct OpenFlags: i32 {
        const WRONLY = libc::O_WRONLY;
        const RDWR = libc::O_RDWR;
        const CREAT = libc::O_CREAT;
        const EXCL = libc::O_EXCL;
        const TRUNC = libc::O_TRUNC;
        const APPEND = libc::O_APPEND;
        const NONBLOCK = libc::O_NONBLOCK;
        const DIRECTORY = libc::O_DIRECTORY;
        const CLOEXEC = libc::O_CLOEXEC;
    }
}

impl OpenFlags {
    /// Read-only access (`O_RDONLY` is zero)
    pub const RDONLY: OpenFlags = OpenFlags::empty();

    /// Whether the flags allow reading
    pub fn readable(self) -> bool {
        !self.contains(OpenFlags::WRONLY)
    }

    /// Whether the flags allow writing
    pub fn writable(self) -> bool {
        self.intersects(OpenFlags::WRONLY | OpenFlags::RDWR)
    }
}

/// Remote file identifier returned by `open`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RemoteFid(pub u64);

/// Kind of resource a share exports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareType {
    Disk,
    Printer,
    Ipc,
}

/// Attributes of a remote file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub attributes: FileAttributes,
    pub access_time: DateTime<Utc>,
    pub write_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
}

impl FileInfo {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(FileAttributes::DIRECTORY)
    }
}

/// One exported share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareInfo {
    pub name: String,
    pub share_type: ShareType,
    pub comment: String,
}

/// What a server enumeration should return
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerKind {
    /// Workgroups / domains known to the browse master
    Domains,
    /// Servers in one workgroup
    Servers,
}

/// A server or workgroup known to a browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub name: String,
    pub comment: String,
}

/// A job queued on a printer share
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintJob {
    pub id: u32,
    pub name: String,
    pub size: u64,
    pub submitted: DateTime<Utc>,
}

/// Changes applied by `set_path_info`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetInfo {
    pub attributes: Option<FileAttributes>,
    pub access_time: Option<DateTime<Utc>>,
    pub write_time: Option<DateTime<Utc>>,
}

/// Resolves names and establishes connections
#[async_trait]
pub trait SmbConnector: Send + Sync {
    /// Resolve a host or NetBIOS name to an address
    async fn resolve_host(&self, name: &str) -> Result<IpAddr>;

    /// Locate the master browser of `workgroup`
    async fn find_master_browser(&self, workgroup: &str) -> Result<IpAddr>;

    /// Open a transport to `addr` and request a NetBIOS session as `called_name`
    async fn connect(
        &self,
        addr: IpAddr,
        called_name: &str,
        client: &ClientIdentity,
    ) -> Result<Box<dyn SmbConnection>>;
}

/// An established connection to one server.
///
/// Implementations must not perform network I/O when dropped; orderly
/// teardown goes through [`SmbConnection::shutdown`].
#[async_trait]
pub trait SmbConnection: Send {
    async fn negotiate(&mut self) -> Result<()>;

    async fn session_setup(&mut self, credentials: &Credentials) -> Result<()>;

    async fn tree_connect(&mut self, share: &str) -> Result<ShareType>;

    async fn open(&mut self, path: &str, flags: OpenFlags, mode: u32) -> Result<RemoteFid>;

    async fn read(&mut self, fid: RemoteFid, offset: u64, len: usize) -> Result<Bytes>;

    async fn write(&mut self, fid: RemoteFid, offset: u64, data: &[u8]) -> Result<usize>;

    async fn close(&mut self, fid: RemoteFid) -> Result<()>;

    async fn file_info(&mut self, fid: RemoteFid) -> Result<FileInfo>;

    async fn set_file_size(&mut self, fid: RemoteFid, size: u64) -> Result<()>;

    async fn path_info(&mut self, path: &str) -> Result<FileInfo>;

    async fn set_path_info(&mut self, path: &str, info: &SetInfo) -> Result<()>;

    /// List entries matching a `\dir\*` pattern
    async fn list(&mut self, pattern: &str) -> Result<Vec<FileInfo>>;

    async fn list_shares(&mut self) -> Result<Vec<ShareInfo>>;

    async fn list_servers(&mut self, workgroup: &str, kind: ServerKind)
        -> Result<Vec<ServerInfo>>;

    async fn list_print_jobs(&mut self) -> Result<Vec<PrintJob>>;

    async fn cancel_print_job(&mut self, id: u32) -> Result<()>;

    async fn mkdir(&mut self, path: &str) -> Result<()>;

    async fn rmdir(&mut self, path: &str) -> Result<()>;

    async fn unlink(&mut self, path: &str) -> Result<()>;

    async fn rename(&mut self, from: &str, to: &str) -> Result<()>;

    /// Log off and disconnect
    async fn shutdown(&mut self) -> Result<()>;

    /// Give up the connection without any network traffic (forked child)
    fn abandon(self: Box<Self>) {
        std::mem::forget(self);
    }
}

/// Split an SMB path (`\a\b`) into its components
pub(crate) fn smb_components(path: &str) -> impl Iterator<Item = &str> {
    path.split('\\').filter(|c| !c.is_empty())
}

/// Directory part of a `\dir\*` listing pattern
pub(crate) fn pattern_dir(pattern: &str) -> &str {
    pattern
        .strip_suffix('*')
        .unwrap_or(pattern)
        .trim_end_matches('\\')
}
