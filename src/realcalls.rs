//! Pass-through to the real operating system
//!
//! Wrappers over `nix` used for every call the shim does not own. Errors
//! come back as the `errno` the kernel set.

use crate::handles::DirRecord;
use crate::stat::FileStat;
use libc::{c_int, c_void, mode_t, off_t};
use nix::errno::Errno;
use nix::fcntl::{self, AtFlags, FcntlArg, FdFlag, OFlag};
use nix::sys::stat::{self, FchmodatFlags, Mode, UtimensatFlags};
use nix::sys::time::TimeSpec;
use nix::sys::uio;
use nix::unistd::{self, AccessFlags, ForkResult, Gid, Uid, UnlinkatFlags, Whence};
use nix::Result;
use std::ffi::CStr;
use std::mem::size_of;
use std::os::fd::{BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Take ownership of an fd returned by a raw call
#[allow(unsafe_code)]
pub fn adopt(fd: RawFd) -> Result<OwnedFd> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    // SAFETY: the caller just obtained `fd` from the kernel and owns it
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Borrow a caller's fd for the duration of one call
#[allow(unsafe_code)]
fn borrow<'a>(fd: RawFd) -> Result<BorrowedFd<'a>> {
    if fd < 0 {
        return Err(Errno::EBADF);
    }
    // SAFETY: the fd is only used for the single call it was borrowed for; a
    // closed number makes that call fail with EBADF
    Ok(unsafe { BorrowedFd::borrow_raw(fd) })
}

fn mode(bits: u32) -> Mode {
    Mode::from_bits_truncate(bits as mode_t)
}

pub fn open(path: &str, flags: c_int, perm: u32) -> Result<RawFd> {
    fcntl::open(path, OFlag::from_bits_retain(flags), mode(perm))
}

pub fn read(fd: RawFd, buf: &mut [u8]) -> Result<usize> {
    unistd::read(fd, buf)
}

pub fn write(fd: RawFd, buf: &[u8]) -> Result<usize> {
    unistd::write(borrow(fd)?, buf)
}

pub fn pread(fd: RawFd, buf: &mut [u8], offset: i64) -> Result<usize> {
    uio::pread(borrow(fd)?, buf, offset as off_t)
}

pub fn pwrite(fd: RawFd, buf: &[u8], offset: i64) -> Result<usize> {
    uio::pwrite(borrow(fd)?, buf, offset as off_t)
}

pub fn lseek(fd: RawFd, offset: i64, whence: c_int) -> Result<i64> {
    let whence = match whence {
        libc::SEEK_SET => Whence::SeekSet,
        libc::SEEK_CUR => Whence::SeekCur,
        libc::SEEK_END => Whence::SeekEnd,
        libc::SEEK_DATA => Whence::SeekData,
        libc::SEEK_HOLE => Whence::SeekHole,
        _ => return Err(Errno::EINVAL),
    };
    unistd::lseek(fd, offset as off_t, whence).map(|pos| pos as i64)
}

pub fn close(fd: RawFd) -> Result<()> {
    unistd::close(fd)
}

pub fn dup(fd: RawFd) -> Result<RawFd> {
    unistd::dup(fd)
}

pub fn dup2(fd: RawFd, target: RawFd) -> Result<RawFd> {
    unistd::dup2(fd, target)
}

/// `fcntl` commands that take an integer argument; others give `EINVAL`
pub fn fcntl(fd: RawFd, cmd: c_int, arg: c_int) -> Result<c_int> {
    let arg = match cmd {
        libc::F_DUPFD => FcntlArg::F_DUPFD(arg),
        libc::F_DUPFD_CLOEXEC => FcntlArg::F_DUPFD_CLOEXEC(arg),
        libc::F_GETFD => FcntlArg::F_GETFD,
        libc::F_SETFD => FcntlArg::F_SETFD(FdFlag::from_bits_retain(arg)),
        libc::F_GETFL => FcntlArg::F_GETFL,
        libc::F_SETFL => FcntlArg::F_SETFL(OFlag::from_bits_retain(arg)),
        _ => return Err(Errno::EINVAL),
    };
    fcntl::fcntl(fd, arg)
}

pub fn fstat(fd: RawFd) -> Result<FileStat> {
    stat::fstat(fd).map(|st| FileStat::from_libc(&st))
}

pub fn stat(path: &str) -> Result<FileStat> {
    stat::stat(path).map(|st| FileStat::from_libc(&st))
}

pub fn lstat(path: &str) -> Result<FileStat> {
    stat::lstat(path).map(|st| FileStat::from_libc(&st))
}

pub fn access(path: &str, amode: c_int) -> Result<()> {
    unistd::access(path, AccessFlags::from_bits_retain(amode))
}

pub fn chdir(path: &str) -> Result<()> {
    unistd::chdir(path)
}

pub fn getcwd() -> Result<String> {
    Ok(unistd::getcwd()?.to_string_lossy().into_owned())
}

pub fn mkdir(path: &str, perm: u32) -> Result<()> {
    unistd::mkdir(path, mode(perm))
}

pub fn rmdir(path: &str) -> Result<()> {
    unistd::unlinkat(None, path, UnlinkatFlags::RemoveDir)
}

pub fn unlink(path: &str) -> Result<()> {
    unistd::unlink(path)
}

pub fn rename(from: &str, to: &str) -> Result<()> {
    fcntl::renameat(None, from, None, to)
}

pub fn chmod(path: &str, perm: u32) -> Result<()> {
    stat::fchmodat(None, path, mode(perm), FchmodatFlags::FollowSymlink)
}

/// An id of `u32::MAX` (`-1`) leaves that owner unchanged
pub fn chown(path: &str, uid: u32, gid: u32) -> Result<()> {
    let uid = (uid != u32::MAX).then(|| Uid::from_raw(uid));
    let gid = (gid != u32::MAX).then(|| Gid::from_raw(gid));
    unistd::chown(path, uid, gid)
}

/// Set access and modification times in seconds; `None` means now
pub fn utimes(path: &str, times: Option<(i64, i64)>) -> Result<()> {
    let (atime, mtime) = match times {
        Some((atime, mtime)) => (
            TimeSpec::new(atime as libc::time_t, 0),
            TimeSpec::new(mtime as libc::time_t, 0),
        ),
        None => (TimeSpec::UTIME_NOW, TimeSpec::UTIME_NOW),
    };
    stat::utimensat(None, path, &atime, &mtime, UtimensatFlags::FollowSymlink)
}

pub fn truncate(path: &str, len: i64) -> Result<()> {
    unistd::truncate(path, len as off_t)
}

pub fn ftruncate(fd: RawFd, len: i64) -> Result<()> {
    unistd::ftruncate(borrow(fd)?, len as off_t)
}

pub fn readlink(path: &str) -> Result<String> {
    Ok(fcntl::readlink(path)?.to_string_lossy().into_owned())
}

pub fn link(from: &str, to: &str) -> Result<()> {
    unistd::linkat(None, from, None, to, AtFlags::empty())
}

pub fn symlink(target: &str, path: &str) -> Result<()> {
    unistd::symlinkat(target, None, path)
}

/// Close-on-exec pipe: `(read end, write end)`
pub fn pipe() -> Result<(OwnedFd, OwnedFd)> {
    unistd::pipe2(OFlag::O_CLOEXEC)
}

/// Returns 0 in the child and the child's pid in the parent
#[allow(unsafe_code)]
pub fn fork() -> Result<libc::pid_t> {
    // SAFETY: the child only touches shim state behind the dispatcher it
    // was forked from, and that state is rebuilt before it is used
    match unsafe { unistd::fork() }? {
        ForkResult::Child => Ok(0),
        ForkResult::Parent { child } => Ok(child.as_raw()),
    }
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
struct LinuxDirent64 {
    d_ino: u64,
    d_off: i64,
    d_reclen: u16,
    d_type: u8,
}

/// Read up to `max` records from a real directory fd.
///
/// The directory offset is left just past the last record returned.
#[allow(unsafe_code)]
pub fn getdents(fd: RawFd, max: usize) -> Result<Vec<DirRecord>> {
    let max = max.max(1);
    let mut buf = vec![0u8; max * size_of::<libc::dirent64>()];
    // SAFETY: the kernel writes at most `buf.len()` bytes into `buf`
    let n = unsafe {
        libc::syscall(
            libc::SYS_getdents64,
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Errno::last());
    }

    let mut records = Vec::new();
    let mut pos = 0usize;
    let end = n as usize;
    while pos < end && records.len() < max {
        // SAFETY: the kernel wrote whole records up to `end`
        let d = unsafe { (buf.as_ptr().add(pos) as *const LinuxDirent64).read_unaligned() };
        let reclen = d.d_reclen as usize;
        let name_bytes = &buf[pos + size_of::<LinuxDirent64>()..pos + reclen];
        let name = CStr::from_bytes_until_nul(name_bytes)
            .map_err(|_| Errno::EIO)?
            .to_string_lossy()
            .into_owned();
        records.push(DirRecord {
            inode: d.d_ino,
            offset: d.d_off,
            d_type: d.d_type,
            name,
        });
        pos += reclen;
    }

    if pos < end {
        if let Some(last) = records.last() {
            lseek(fd, last.offset, libc::SEEK_SET)?;
        }
    }
    Ok(records)
}
