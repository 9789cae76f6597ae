//! Error types for the SMB filesystem shim

pub use nix::errno::Errno;
use std::convert::TryFrom;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use thiserror::Error;

/// Result type for shim operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shim operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from a local resource (backing file, pipe, local share)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unsupported virtual path
    #[error("Invalid virtual path: {0}")]
    Path(String),

    /// Connecting a session failed at some stage
    #[error("Connection to {server} failed: {reason}")]
    Connection {
        server: String,
        reason: ConnectFailure,
    },

    /// Operation-level failure reported by the remote side
    #[error("Remote operation failed: {0}")]
    Remote(NtStatus),

    /// No local fd slots or handle-table entries left
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Bitmap and handle table disagree
    #[error("Internal consistency fault: {0}")]
    InternalConsistency(String),

    /// A remote operation did not complete within the configured timeout
    #[error("Operation timed out")]
    Timeout,

    /// The fd is not a live shim handle of the required kind
    #[error("Bad file descriptor: {0}")]
    BadHandle(RawFd),

    /// Not implemented for SMB paths
    #[error("Operation not supported: {0}")]
    NotSupported(&'static str),

    /// A condition with a direct POSIX errno
    #[error("{0}")]
    Os(Errno),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Stage at which establishing a session failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectFailure {
    /// Empty server name
    NoServer,
    /// Host name could not be resolved
    Unresolvable,
    /// No master browser answered for the workgroup
    NoMasterBrowser,
    /// NetBIOS session request rejected under every called name
    SessionRejected,
    /// Dialect negotiation failed
    Negotiation,
    /// Both the supplied and the anonymous credentials were rejected
    AuthenticationRejected,
    /// Tree connect to the share failed
    TreeConnect(NtStatus),
}

impl fmt::Display for ConnectFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectFailure::NoServer => write!(f, "no server name"),
            ConnectFailure::Unresolvable => write!(f, "host name not resolvable"),
            ConnectFailure::NoMasterBrowser => write!(f, "no master browser found"),
            ConnectFailure::SessionRejected => write!(f, "session request rejected"),
            ConnectFailure::Negotiation => write!(f, "protocol negotiation failed"),
            ConnectFailure::AuthenticationRejected => write!(f, "authentication rejected"),
            ConnectFailure::TreeConnect(status) => write!(f, "tree connect failed: {}", status),
        }
    }
}

impl Error {
    /// Map this error to the POSIX errno a caller of the shim observes
    pub fn errno(&self) -> Errno {
        match self {
            Error::Io(e) => e.raw_os_error().map(Errno::from_i32).unwrap_or(Errno::EIO),
            Error::Path(_) => Errno::ENOENT,
            Error::Connection { reason, .. } => match reason {
                ConnectFailure::NoServer | ConnectFailure::AuthenticationRejected => Errno::EPERM,
                ConnectFailure::TreeConnect(status) => status.errno(),
                _ => Errno::ENOENT,
            },
            Error::Remote(status) => status.errno(),
            Error::ResourceExhausted(_) => Errno::EMFILE,
            Error::InternalConsistency(_) => Errno::EIO,
            Error::Timeout => Errno::ETIMEDOUT,
            Error::BadHandle(_) => Errno::EBADF,
            Error::NotSupported(_) => Errno::ENOTSUP,
            Error::Os(errno) => *errno,
            Error::Config(_) => Errno::EINVAL,
        }
    }

    /// Whether the session that produced this error can no longer be trusted
    pub fn breaks_session(&self) -> bool {
        matches!(
            self,
            Error::Timeout
                | Error::Remote(NtStatus::NetworkNameDeleted)
                | Error::Remote(NtStatus::ConnectionDisconnected)
        )
    }
}

impl From<Errno> for Error {
    fn from(errno: Errno) -> Self {
        Error::Os(errno)
    }
}

/// SMB protocol status codes (subset of NTSTATUS)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum NtStatus {
    /// The operation completed successfully
    Success = 0x00000000,
    /// No more files
    NoMoreFiles = 0x80000006,
    /// The request is not supported
    NotSupported = 0xC00000BB,
    /// Access denied
    AccessDenied = 0xC0000022,
    /// The file does not exist
    NoSuchFile = 0xC000000F,
    /// End of file reached
    EndOfFile = 0xC0000011,
    /// The object name is invalid
    ObjectNameInvalid = 0xC0000033,
    /// The object name is not found
    ObjectNameNotFound = 0xC0000034,
    /// Cannot create a file that already exists
    ObjectNameCollision = 0xC0000035,
    /// A path component does not exist
    ObjectPathNotFound = 0xC000003A,
    /// The file is open with an incompatible share mode
    SharingViolation = 0xC0000043,
    /// The specified handle is invalid
    InvalidHandle = 0xC0000008,
    /// The parameter is incorrect
    InvalidParameter = 0xC000000D,
    /// The user name or password is incorrect
    LogonFailure = 0xC000006D,
    /// Account is disabled
    AccountDisabled = 0xC0000072,
    /// The disk is full
    DiskFull = 0xC000007F,
    /// Insufficient resources
    InsufficientResources = 0xC000009A,
    /// The media is write protected
    MediaWriteProtected = 0xC00000A2,
    /// The request timed out
    IoTimeout = 0xC00000B5,
    /// The target is a directory
    FileIsADirectory = 0xC00000BA,
    /// Bad network path
    BadNetworkPath = 0xC00000BE,
    /// The specified network name is no longer available
    NetworkNameDeleted = 0xC00000C9,
    /// Bad network name
    BadNetworkName = 0xC00000CC,
    /// The directory is not empty
    DirectoryNotEmpty = 0xC0000101,
    /// A path component is not a directory
    NotADirectory = 0xC0000103,
    /// The file cannot be deleted
    CannotDelete = 0xC0000121,
    /// The transport connection was reset
    ConnectionDisconnected = 0xC000020C,
    /// The remote system is not reachable
    HostUnreachable = 0xC000023D,
}

impl TryFrom<u32> for NtStatus {
    type Error = u32;

    fn try_from(value: u32) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00000000 => Ok(NtStatus::Success),
            0x80000006 => Ok(NtStatus::NoMoreFiles),
            0xC00000BB => Ok(NtStatus::NotSupported),
            0xC0000022 => Ok(NtStatus::AccessDenied),
            0xC000000F => Ok(NtStatus::NoSuchFile),
            0xC0000011 => Ok(NtStatus::EndOfFile),
            0xC0000033 => Ok(NtStatus::ObjectNameInvalid),
            0xC0000034 => Ok(NtStatus::ObjectNameNotFound),
            0xC0000035 => Ok(NtStatus::ObjectNameCollision),
            0xC000003A => Ok(NtStatus::ObjectPathNotFound),
            0xC0000043 => Ok(NtStatus::SharingViolation),
            0xC0000008 => Ok(NtStatus::InvalidHandle),
            0xC000000D => Ok(NtStatus::InvalidParameter),
            0xC000006D => Ok(NtStatus::LogonFailure),
            0xC0000072 => Ok(NtStatus::AccountDisabled),
            0xC000007F => Ok(NtStatus::DiskFull),
            0xC000009A => Ok(NtStatus::InsufficientResources),
            0xC00000A2 => Ok(NtStatus::MediaWriteProtected),
            0xC00000B5 => Ok(NtStatus::IoTimeout),
            0xC00000BA => Ok(NtStatus::FileIsADirectory),
            0xC00000BE => Ok(NtStatus::BadNetworkPath),
            0xC00000C9 => Ok(NtStatus::NetworkNameDeleted),
            0xC00000CC => Ok(NtStatus::BadNetworkName),
            0xC0000101 => Ok(NtStatus::DirectoryNotEmpty),
            0xC0000103 => Ok(NtStatus::NotADirectory),
            0xC0000121 => Ok(NtStatus::CannotDelete),
            0xC000020C => Ok(NtStatus::ConnectionDisconnected),
            0xC000023D => Ok(NtStatus::HostUnreachable),
            other => Err(other),
        }
    }
}

impl NtStatus {
    /// Check if this is a success status
    pub fn is_success(self) -> bool {
        self == NtStatus::Success
    }

    /// Check if this is an error status
    pub fn is_error(self) -> bool {
        (self as u32) & 0xC0000000 == 0xC0000000
    }

    /// Create from a raw u32 value; unknown codes become InvalidParameter
    pub fn from_u32(value: u32) -> Self {
        value.try_into().unwrap_or(NtStatus::InvalidParameter)
    }

    /// The errno a POSIX caller sees for this status
    pub fn errno(self) -> Errno {
        match self {
            NtStatus::Success => Errno::UnknownErrno,
            NtStatus::NoMoreFiles | NtStatus::EndOfFile => Errno::ENODATA,
            NtStatus::NotSupported => Errno::ENOTSUP,
            NtStatus::AccessDenied | NtStatus::CannotDelete => Errno::EACCES,
            NtStatus::NoSuchFile
            | NtStatus::ObjectNameNotFound
            | NtStatus::ObjectPathNotFound
            | NtStatus::BadNetworkPath
            | NtStatus::BadNetworkName => Errno::ENOENT,
            NtStatus::ObjectNameInvalid | NtStatus::InvalidParameter => Errno::EINVAL,
            NtStatus::ObjectNameCollision => Errno::EEXIST,
            NtStatus::SharingViolation => Errno::EBUSY,
            NtStatus::InvalidHandle => Errno::EBADF,
            NtStatus::LogonFailure | NtStatus::AccountDisabled => Errno::EPERM,
            NtStatus::DiskFull => Errno::ENOSPC,
            NtStatus::InsufficientResources => Errno::ENOMEM,
            NtStatus::MediaWriteProtected => Errno::EROFS,
            NtStatus::IoTimeout => Errno::ETIMEDOUT,
            NtStatus::FileIsADirectory => Errno::EISDIR,
            NtStatus::NotADirectory => Errno::ENOTDIR,
            NtStatus::DirectoryNotEmpty => Errno::ENOTEMPTY,
            NtStatus::NetworkNameDeleted | NtStatus::ConnectionDisconnected => Errno::EIO,
            NtStatus::HostUnreachable => Errno::EHOSTUNREACH,
        }
    }
}

impl fmt::Display for NtStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            NtStatus::Success => "Success",
            NtStatus::NoMoreFiles => "No more files",
            NtStatus::NotSupported => "Not supported",
            NtStatus::AccessDenied => "Access denied",
            NtStatus::NoSuchFile => "No such file",
            NtStatus::EndOfFile => "End of file",
            NtStatus::ObjectNameInvalid => "Object name invalid",
            NtStatus::ObjectNameNotFound => "Object name not found",
            NtStatus::ObjectNameCollision => "Object name collision",
            NtStatus::ObjectPathNotFound => "Object path not found",
            NtStatus::SharingViolation => "Sharing violation",
            NtStatus::InvalidHandle => "Invalid handle",
            NtStatus::InvalidParameter => "Invalid parameter",
            NtStatus::LogonFailure => "Logon failure",
            NtStatus::AccountDisabled => "Account disabled",
            NtStatus::DiskFull => "Disk full",
            NtStatus::InsufficientResources => "Insufficient resources",
            NtStatus::MediaWriteProtected => "Media write protected",
            NtStatus::IoTimeout => "I/O timeout",
            NtStatus::FileIsADirectory => "File is a directory",
            NtStatus::BadNetworkPath => "Bad network path",
            NtStatus::NetworkNameDeleted => "Network name deleted",
            NtStatus::BadNetworkName => "Bad network name",
            NtStatus::DirectoryNotEmpty => "Directory not empty",
            NtStatus::NotADirectory => "Not a directory",
            NtStatus::CannotDelete => "Cannot delete",
            NtStatus::ConnectionDisconnected => "Connection disconnected",
            NtStatus::HostUnreachable => "Host unreachable",
        };
        write!(f, "{} (0x{:08X})", msg, *self as u32)
    }
}
