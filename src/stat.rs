//! POSIX stat synthesis for remote entries

use bitflags::bitflags;
use chrono::{DateTime, Utc};

bitflags! {
    /// DOS file attributes as reported by the remote side
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct FileAttributes: u32 {
        const READONLY = 0x00000001;
        const HIDDEN = 0x00000002;
        const SYSTEM = 0x00000004;
        const DIRECTORY = 0x00000010;
        const ARCHIVE = 0x00000020;
        const NORMAL = 0x00000080;
    }
}

/// Preferred I/O block size reported for remote files
pub const REMOTE_BLOCK_SIZE: u64 = 4096;

const S_IFDIR: u32 = libc::S_IFDIR as u32;
const S_IFREG: u32 = libc::S_IFREG as u32;

/// Portable subset of `struct stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub blksize: u64,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
}

impl FileStat {
    /// Whether the mode describes a directory
    pub fn is_dir(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == S_IFDIR
    }

    /// Whether the mode describes a regular file
    pub fn is_file(&self) -> bool {
        self.mode & (libc::S_IFMT as u32) == S_IFREG
    }

    /// Stat for a remote entry
    pub fn from_remote(
        dev: u64,
        ino: u64,
        attributes: FileAttributes,
        size: u64,
        atime: DateTime<Utc>,
        mtime: DateTime<Utc>,
        ctime: DateTime<Utc>,
    ) -> Self {
        let (uid, gid) = owner();
        Self {
            dev,
            ino,
            mode: mode_from_attributes(attributes),
            nlink: 1,
            uid,
            gid,
            size,
            blksize: REMOTE_BLOCK_SIZE,
            blocks: size.div_ceil(512),
            atime: atime.timestamp(),
            mtime: mtime.timestamp(),
            ctime: ctime.timestamp(),
        }
    }

    /// Stat for a synthesized browse directory (root, workgroup, server, share)
    pub fn directory(dev: u64, ino: u64, size: u64) -> Self {
        let (uid, gid) = owner();
        Self {
            dev,
            ino,
            mode: S_IFDIR | 0o555,
            nlink: 1,
            uid,
            gid,
            size,
            blksize: REMOTE_BLOCK_SIZE,
            blocks: 0,
            ..Default::default()
        }
    }

    /// Convert the OS `struct stat`
    pub fn from_libc(st: &libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid,
            gid: st.st_gid,
            size: st.st_size as u64,
            blksize: st.st_blksize as u64,
            blocks: st.st_blocks as u64,
            atime: st.st_atime as i64,
            mtime: st.st_mtime as i64,
            ctime: st.st_ctime as i64,
        }
    }
}

fn owner() -> (u32, u32) {
    (
        nix::unistd::getuid().as_raw(),
        nix::unistd::getgid().as_raw(),
    )
}

/// Map DOS attributes onto permission bits.
///
/// Files are readable by everyone; the write bit follows READONLY and the
/// execute bits carry ARCHIVE (user), SYSTEM (group) and HIDDEN (other).
pub fn mode_from_attributes(attributes: FileAttributes) -> u32 {
    let mut mode = if attributes.contains(FileAttributes::DIRECTORY) {
        S_IFDIR | 0o555
    } else {
        S_IFREG | 0o444
    };
    if !attributes.contains(FileAttributes::READONLY) {
        mode |= 0o200;
    }
    if attributes.contains(FileAttributes::ARCHIVE) {
        mode |= 0o100;
    }
    if attributes.contains(FileAttributes::SYSTEM) {
        mode |= 0o010;
    }
    if attributes.contains(FileAttributes::HIDDEN) {
        mode |= 0o001;
    }
    mode
}

/// Inverse of [`mode_from_attributes`] for chmod
pub fn attributes_from_mode(mode: u32, is_dir: bool) -> FileAttributes {
    let mut attributes = FileAttributes::empty();
    if is_dir {
        attributes |= FileAttributes::DIRECTORY;
    }
    if mode & 0o200 == 0 {
        attributes |= FileAttributes::READONLY;
    }
    if mode & 0o100 != 0 {
        attributes |= FileAttributes::ARCHIVE;
    }
    if mode & 0o010 != 0 {
        attributes |= FileAttributes::SYSTEM;
    }
    if mode & 0o001 != 0 {
        attributes |= FileAttributes::HIDDEN;
    }
    if attributes.is_empty() {
        attributes = FileAttributes::NORMAL;
    }
    attributes
}

/// 64-bit FNV-1a; stable across processes and releases
fn fnv1a(data: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf29ce484222325;
    const PRIME: u64 = 0x100000001b3;
    data.iter()
        .fold(OFFSET, |hash, &b| (hash ^ b as u64).wrapping_mul(PRIME))
}

/// Inode number for a canonical virtual path
pub fn inode_for(canonical_path: &str) -> u64 {
    // 0 is reserved by some tools to mean "deleted"
    fnv1a(canonical_path.as_bytes()).max(1)
}

/// Device number for a `(server, share)` pair
pub fn device_for(server: &str, share: &str) -> u64 {
    fnv1a(server.as_bytes()) ^ fnv1a(share.as_bytes())
}
