//! POSIX-shaped entry points
//!
//! Every method first decides whether the call is ours: path-based calls ask
//! the [`PathResolver`], fd-based calls ask the handle bitmap. Calls that are
//! not ours, and every call made while the shim is busy with its own work,
//! go straight to the real operating system.

use crate::busy::BusyFlag;
use crate::config::ShimConfig;
use crate::credentials::{CredentialProvider, EnvCredentials};
use crate::dir;
use crate::error::{Errno, Error, NtStatus, Result};
use crate::executor::Executor;
use crate::fork::{ForkGuard, ForkOutcome};
use crate::handles::{Closed, DirRecord, DirSnapshot, HandleTable};
use crate::path::{join_local, PathResolver, VirtualPath};
use crate::realcalls;
use crate::registry::{ConnectTarget, ConnectionRegistry, SessionId};
use crate::remote::{FileInfo, OpenFlags, SetInfo, ShareType, SmbConnector};
use crate::stat::{attributes_from_mode, inode_for, FileStat};
use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Result of an intercepted call: a value or the errno the caller sees
pub type SysResult<T> = std::result::Result<T, Errno>;

/// Issue one remote call on a session and record whether it broke the session
macro_rules! remote {
    ($self:ident, $sid:expr, |$conn:ident| $call:expr) => {{
        let sid = $sid;
        let result = match $self.registry.connection(sid) {
            Ok($conn) => $self.executor.run($call),
            Err(e) => Err(e),
        };
        $self.registry.observe(sid, result)
    }};
}

/// Translate a shim error into an errno, logging by severity
fn translate(op: &str, target: &dyn fmt::Display, err: Error) -> Errno {
    match &err {
        Error::InternalConsistency(_) => error!("{} {}: {}", op, target, err),
        Error::Timeout | Error::Connection { .. } | Error::ResourceExhausted(_) => {
            warn!("{} {}: {}", op, target, err)
        }
        _ => debug!("{} {}: {}", op, target, err),
    }
    err.errno()
}

fn stat_from_info(dev: u64, ino: u64, info: &FileInfo) -> FileStat {
    FileStat::from_remote(
        dev,
        ino,
        info.attributes,
        info.size,
        info.access_time,
        info.write_time,
        info.change_time,
    )
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(secs, 0).ok_or(Error::Os(Errno::EINVAL))
}

/// Routes POSIX file operations to SMB sessions or the real OS.
///
/// All shim state lives here; every entry point takes `&mut self`.
pub struct Dispatcher {
    resolver: PathResolver,
    connector: Arc<dyn SmbConnector>,
    credentials: Arc<dyn CredentialProvider>,
    registry: ConnectionRegistry,
    handles: HandleTable,
    executor: Executor,
    busy: BusyFlag,
    cwd: String,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("resolver", &self.resolver)
            .field("registry", &self.registry)
            .field("handles", &self.handles)
            .field("cwd", &self.cwd)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher using environment credentials
    pub fn new(mut config: ShimConfig, connector: Arc<dyn SmbConnector>) -> Result<Self> {
        config.validate()?;
        let credentials = Arc::new(EnvCredentials::new(&config.username, &config.password));
        let cwd = config.initial_cwd.to_string_lossy().into_owned();
        info!(
            "SMB shim on {} (workgroup {}, timeout {:?})",
            config.prefix, config.workgroup, config.op_timeout
        );
        Ok(Self {
            resolver: PathResolver::new(&config.prefix, &config.workgroup),
            connector,
            credentials,
            registry: ConnectionRegistry::new(config.client.clone(), config.session_idle_timeout),
            handles: HandleTable::new(&config.backing_file, config.max_handles),
            executor: Executor::new(config.op_timeout)?,
            busy: BusyFlag::new(),
            cwd,
        })
    }

    /// Replace the credential provider
    pub fn with_credentials(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    /// Busy flag an interposer can check without taking any lock
    pub fn busy_flag(&self) -> BusyFlag {
        self.busy.clone()
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Whether `path` would be handled by the shim
    pub fn is_ours(&self, path: &str) -> bool {
        self.classify(path).is_some()
    }

    /// Whether `fd` is a shim descriptor
    pub fn is_our_fd(&self, fd: RawFd) -> bool {
        !self.busy.is_busy() && self.handles.is_ours(fd)
    }

    fn classify(&self, path: &str) -> Option<VirtualPath> {
        if self.busy.is_busy() {
            return None;
        }
        self.resolver.classify(path, &self.cwd)
    }

    fn session_for(&mut self, vp: &VirtualPath) -> Result<SessionId> {
        let default_wg = self.resolver.default_workgroup();
        let (server, share) = vp.connect_target(default_wg);
        let workgroup = vp.workgroup().unwrap_or(default_wg);
        let target = ConnectTarget::new(&server, &share, workgroup);
        self.registry.acquire(
            &self.executor,
            self.connector.as_ref(),
            self.credentials.as_ref(),
            &target,
        )
    }

    /// A local path as the kernel must see it. The real working directory is
    /// stale while ours is virtual, so relative paths are resolved here.
    fn local<'a>(&self, path: &'a str) -> Cow<'a, str> {
        if path.starts_with('/') || self.resolver.classify(&self.cwd, "/").is_none() {
            return Cow::Borrowed(path);
        }
        Cow::Owned(join_local(&self.cwd, path))
    }

    fn inode(&self, vp: &VirtualPath) -> u64 {
        inode_for(&self.resolver.canonical(vp))
    }

    // ---- open / close -------------------------------------------------

    pub fn open(&mut self, path: &str, flags: i32, mode: u32) -> SysResult<RawFd> {
        let Some(vp) = self.classify(path) else {
            return realcalls::open(&self.local(path), flags, mode);
        };
        let _busy = self.busy.enter();
        let flags = OpenFlags::from_bits_truncate(flags);
        self.open_virtual(vp, path.ends_with('/'), flags, mode)
            .map_err(|e| translate("open", &path, e))
    }

    pub fn creat(&mut self, path: &str, mode: u32) -> SysResult<RawFd> {
        self.open(path, libc::O_CREAT | libc::O_WRONLY | libc::O_TRUNC, mode)
    }

    fn open_virtual(
        &mut self,
        vp: VirtualPath,
        trailing_slash: bool,
        flags: OpenFlags,
        mode: u32,
    ) -> Result<RawFd> {
        let wants_dir = vp.is_browse()
            || vp.is_share_root()
            || trailing_slash
            || flags.contains(OpenFlags::DIRECTORY);
        if wants_dir {
            if flags.writable() {
                return Err(Error::Remote(NtStatus::FileIsADirectory));
            }
            return self.open_dir(vp);
        }

        let sid = self.session_for(&vp)?;
        let remote_path = vp.remote_path();
        match remote!(self, sid, |conn| conn.open(&remote_path, flags, mode)) {
            Ok(fid) => match self.handles.insert_file(sid, fid, vp, flags) {
                Ok(fd) => {
                    self.registry.retain(sid);
                    debug!("Opened {} as fd {}", remote_path, fd);
                    Ok(fd)
                }
                Err(e) => {
                    if let Err(close) = remote!(self, sid, |conn| conn.close(fid)) {
                        debug!("Closing {} after failed open: {}", remote_path, close);
                    }
                    Err(e)
                }
            },
            Err(Error::Timeout) => Err(Error::Timeout),
            Err(e) if flags.writable() => Err(e),
            // Might be a directory opened without O_DIRECTORY
            Err(e) => self.open_dir(vp).map_err(|_| e),
        }
    }

    fn open_dir(&mut self, vp: VirtualPath) -> Result<RawFd> {
        let sid = self.session_for(&vp)?;
        let session = self.registry.session(sid)?;
        let (share_type, dev) = (session.share_type(), session.dev());
        let entries = {
            let result = match self.registry.connection(sid) {
                Ok(conn) => {
                    dir::list_entries(&self.executor, conn, share_type, &vp, &self.resolver)
                }
                Err(e) => Err(e),
            };
            self.registry.observe(sid, result)?
        };
        let wg = self.resolver.default_workgroup();
        let self_canonical = self.resolver.canonical(&vp);
        let parent_canonical = self.resolver.canonical(&vp.parent(wg));
        let snapshot = DirSnapshot::new(vp, dev, &self_canonical, &parent_canonical, entries);
        let fd = self.handles.insert_dir(snapshot)?;
        debug!("Opened directory {} as fd {}", self_canonical, fd);
        Ok(fd)
    }

    pub fn close(&mut self, fd: RawFd) -> SysResult<()> {
        if !self.is_our_fd(fd) {
            return realcalls::close(fd);
        }
        let _busy = self.busy.enter();
        self.close_handle(fd).map_err(|e| translate("close", &fd, e))
    }

    fn close_handle(&mut self, fd: RawFd) -> Result<()> {
        let session = self.handles.file(fd).ok().map(|f| f.session);
        let closed = self.handles.close(fd)?;
        self.finish_close(session, closed)
    }

    /// Release what a closed descriptor held
    fn finish_close(&mut self, session: Option<SessionId>, closed: Closed) -> Result<()> {
        let result = match closed {
            Closed::LastRef(file) => remote!(self, file.session, |conn| conn.close(file.fid)),
            Closed::Alias | Closed::Dir(_) => Ok(()),
        };
        if let Some(sid) = session {
            self.registry.release(sid);
        }
        result
    }

    // ---- I/O ----------------------------------------------------------

    pub fn read(&mut self, fd: RawFd, buf: &mut [u8]) -> SysResult<usize> {
        if !self.is_our_fd(fd) {
            return realcalls::read(fd, buf);
        }
        let _busy = self.busy.enter();
        self.read_at(fd, buf, None)
            .map_err(|e| translate("read", &fd, e))
    }

    pub fn pread(&mut self, fd: RawFd, buf: &mut [u8], offset: i64) -> SysResult<usize> {
        if !self.is_our_fd(fd) {
            return realcalls::pread(fd, buf, offset);
        }
        let _busy = self.busy.enter();
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        self.read_at(fd, buf, Some(offset as u64))
            .map_err(|e| translate("pread", &fd, e))
    }

    /// Read at `offset`, or at the shared file offset (advancing it) when `None`
    fn read_at(&mut self, fd: RawFd, buf: &mut [u8], offset: Option<u64>) -> Result<usize> {
        if self.handles.is_dir(fd) {
            return Err(Error::Os(Errno::EISDIR));
        }
        let file = self.handles.file(fd)?;
        if !file.flags.readable() {
            return Err(Error::BadHandle(fd));
        }
        let (sid, fid) = (file.session, file.fid);
        let at = offset.unwrap_or(file.offset);
        let len = buf.len();
        let data = remote!(self, sid, |conn| conn.read(fid, at, len))?;
        let n = data.len().min(len);
        buf[..n].copy_from_slice(&data[..n]);
        if offset.is_none() {
            self.handles.file_mut(fd)?.offset = at + n as u64;
        }
        Ok(n)
    }

    pub fn write(&mut self, fd: RawFd, buf: &[u8]) -> SysResult<usize> {
        if !self.is_our_fd(fd) {
            return realcalls::write(fd, buf);
        }
        let _busy = self.busy.enter();
        self.write_at(fd, buf, None)
            .map_err(|e| translate("write", &fd, e))
    }

    pub fn pwrite(&mut self, fd: RawFd, buf: &[u8], offset: i64) -> SysResult<usize> {
        if !self.is_our_fd(fd) {
            return realcalls::pwrite(fd, buf, offset);
        }
        let _busy = self.busy.enter();
        if offset < 0 {
            return Err(Errno::EINVAL);
        }
        self.write_at(fd, buf, Some(offset as u64))
            .map_err(|e| translate("pwrite", &fd, e))
    }

    fn write_at(&mut self, fd: RawFd, buf: &[u8], offset: Option<u64>) -> Result<usize> {
        if self.handles.is_dir(fd) {
            return Err(Error::Os(Errno::EISDIR));
        }
        let file = self.handles.file(fd)?;
        if !file.flags.writable() {
            return Err(Error::BadHandle(fd));
        }
        let (sid, fid, append) = (file.session, file.fid, file.flags.contains(OpenFlags::APPEND));
        let mut at = offset.unwrap_or(file.offset);
        if offset.is_none() && append {
            at = remote!(self, sid, |conn| conn.file_info(fid))?.size;
        }
        let n = remote!(self, sid, |conn| conn.write(fid, at, buf))?;
        if offset.is_none() {
            self.handles.file_mut(fd)?.offset = at + n as u64;
        }
        Ok(n)
    }

    pub fn lseek(&mut self, fd: RawFd, offset: i64, whence: i32) -> SysResult<i64> {
        if !self.is_our_fd(fd) {
            return realcalls::lseek(fd, offset, whence);
        }
        let _busy = self.busy.enter();
        self.seek_handle(fd, offset, whence)
            .map_err(|e| translate("lseek", &fd, e))
    }

    fn seek_handle(&mut self, fd: RawFd, offset: i64, whence: i32) -> Result<i64> {
        if self.handles.is_dir(fd) {
            return self.handles.dir_mut(fd)?.lseek(offset, whence);
        }
        let file = self.handles.file(fd)?;
        let (sid, fid, current) = (file.session, file.fid, file.offset);
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => current as i64,
            libc::SEEK_END => remote!(self, sid, |conn| conn.file_info(fid))?.size as i64,
            _ => return Err(Error::Os(Errno::EINVAL)),
        };
        let target = base.checked_add(offset).ok_or(Error::Os(Errno::EINVAL))?;
        if target < 0 {
            return Err(Error::Os(Errno::EINVAL));
        }
        self.handles.file_mut(fd)?.offset = target as u64;
        Ok(target)
    }

    // ---- descriptor management ----------------------------------------

    pub fn dup(&mut self, fd: RawFd) -> SysResult<RawFd> {
        if !self.is_our_fd(fd) {
            return realcalls::dup(fd);
        }
        let _busy = self.busy.enter();
        self.dup_handle(fd, None)
            .map_err(|e| translate("dup", &fd, e))
    }

    fn dup_handle(&mut self, fd: RawFd, min: Option<RawFd>) -> Result<RawFd> {
        let sid = self.handles.file(fd)?.session;
        let new_fd = match min {
            Some(min) => self.handles.dup_from(fd, min)?,
            None => self.handles.dup(fd)?,
        };
        self.registry.retain(sid);
        Ok(new_fd)
    }

    pub fn dup2(&mut self, fd: RawFd, target: RawFd) -> SysResult<RawFd> {
        let fd_ours = self.is_our_fd(fd);
        let target_ours = self.is_our_fd(target);
        if !fd_ours && !target_ours {
            return realcalls::dup2(fd, target);
        }
        let _busy = self.busy.enter();
        if !fd_ours {
            // A real fd replaces a shim descriptor
            self.close_handle(target)
                .map_err(|e| translate("dup2", &target, e))?;
            return realcalls::dup2(fd, target);
        }
        self.dup2_handle(fd, target)
            .map_err(|e| translate("dup2", &fd, e))
    }

    fn dup2_handle(&mut self, fd: RawFd, target: RawFd) -> Result<RawFd> {
        let sid = self.handles.file(fd)?.session;
        if fd == target {
            return Ok(fd);
        }
        let replaced = self.handles.file(target).ok().map(|f| f.session);
        let (closed, new_fd) = self.handles.dup2(fd, target);
        let released = match closed {
            Some(closed) => self.finish_close(replaced, closed),
            None => Ok(()),
        };
        let new_fd = new_fd?;
        self.registry.retain(sid);
        released.map(|()| new_fd)
    }

    /// `fcntl` on shim descriptors.
    ///
    /// `F_GETFL`/`F_SETFL` work on the recorded open flags, `F_GETFD`/`F_SETFD`
    /// act on the backing fd, `F_DUPFD`/`F_DUPFD_CLOEXEC` alias the file.
    /// Other commands succeed without effect.
    pub fn fcntl(&mut self, fd: RawFd, cmd: i32, arg: i32) -> SysResult<i32> {
        if !self.is_our_fd(fd) {
            return realcalls::fcntl(fd, cmd, arg);
        }
        let _busy = self.busy.enter();
        self.fcntl_handle(fd, cmd, arg)
            .map_err(|e| translate("fcntl", &fd, e))
    }

    fn fcntl_handle(&mut self, fd: RawFd, cmd: i32, arg: i32) -> Result<i32> {
        match cmd {
            libc::F_GETFL => {
                if self.handles.is_dir(fd) {
                    return Ok(libc::O_RDONLY | libc::O_DIRECTORY);
                }
                Ok(self.handles.file(fd)?.flags.bits())
            }
            libc::F_SETFL => {
                if self.handles.is_dir(fd) {
                    return Ok(0);
                }
                let settable = OpenFlags::APPEND | OpenFlags::NONBLOCK;
                let file = self.handles.file_mut(fd)?;
                file.flags = (file.flags - settable) | (OpenFlags::from_bits_truncate(arg) & settable);
                Ok(0)
            }
            libc::F_GETFD | libc::F_SETFD => {
                Ok(realcalls::fcntl(self.handles.backing_fd(fd)?, cmd, arg)?)
            }
            libc::F_DUPFD | libc::F_DUPFD_CLOEXEC => {
                if arg < 0 {
                    return Err(Error::Os(Errno::EINVAL));
                }
                self.dup_handle(fd, Some(arg))
            }
            other => {
                debug!("fcntl {} on shim fd {} ignored", other, fd);
                Ok(0)
            }
        }
    }

    // ---- attributes ---------------------------------------------------

    pub fn fstat(&mut self, fd: RawFd) -> SysResult<FileStat> {
        if !self.is_our_fd(fd) {
            return realcalls::fstat(fd);
        }
        let _busy = self.busy.enter();
        self.fstat_handle(fd)
            .map_err(|e| translate("fstat", &fd, e))
    }

    fn fstat_handle(&mut self, fd: RawFd) -> Result<FileStat> {
        if self.handles.is_dir(fd) {
            let snapshot = self.handles.dir(fd)?;
            let ino = self.inode(snapshot.path());
            return Ok(FileStat::directory(snapshot.dev(), ino, snapshot.len_bytes()));
        }
        let file = self.handles.file(fd)?;
        let (sid, fid) = (file.session, file.fid);
        let ino = self.inode(&file.path);
        let dev = self.registry.session(sid)?.dev();
        let info = remote!(self, sid, |conn| conn.file_info(fid))?;
        Ok(stat_from_info(dev, ino, &info))
    }

    pub fn stat(&mut self, path: &str) -> SysResult<FileStat> {
        let Some(vp) = self.classify(path) else {
            return realcalls::stat(&self.local(path));
        };
        let _busy = self.busy.enter();
        self.stat_virtual(&vp)
            .map_err(|e| translate("stat", &path, e))
    }

    /// There are no symlinks in the namespace, so this is `stat`
    pub fn lstat(&mut self, path: &str) -> SysResult<FileStat> {
        let Some(vp) = self.classify(path) else {
            return realcalls::lstat(&self.local(path));
        };
        let _busy = self.busy.enter();
        self.stat_virtual(&vp)
            .map_err(|e| translate("lstat", &path, e))
    }

    fn stat_virtual(&mut self, vp: &VirtualPath) -> Result<FileStat> {
        let sid = self.session_for(vp)?;
        let dev = self.registry.session(sid)?.dev();
        let ino = self.inode(vp);
        if vp.is_browse() || vp.is_share_root() {
            return Ok(FileStat::directory(dev, ino, 0));
        }
        let remote_path = vp.remote_path();
        let info = remote!(self, sid, |conn| conn.path_info(&remote_path))?;
        Ok(stat_from_info(dev, ino, &info))
    }

    pub fn access(&mut self, path: &str, mode: i32) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::access(&self.local(path), mode);
        };
        let _busy = self.busy.enter();
        let st = self
            .stat_virtual(&vp)
            .map_err(|e| translate("access", &path, e))?;
        if mode & libc::W_OK != 0 && st.mode & 0o200 == 0 {
            return Err(Errno::EACCES);
        }
        Ok(())
    }

    pub fn chmod(&mut self, path: &str, mode: u32) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::chmod(&self.local(path), mode);
        };
        let _busy = self.busy.enter();
        self.chmod_virtual(&vp, mode)
            .map_err(|e| translate("chmod", &path, e))
    }

    fn chmod_virtual(&mut self, vp: &VirtualPath, mode: u32) -> Result<()> {
        let st = self.stat_virtual(vp)?;
        if vp.is_browse() || vp.is_share_root() {
            // Browse levels have no attributes to change
            return Ok(());
        }
        let sid = self.session_for(vp)?;
        let info = SetInfo {
            attributes: Some(attributes_from_mode(mode, st.is_dir())),
            ..Default::default()
        };
        let remote_path = vp.remote_path();
        remote!(self, sid, |conn| conn.set_path_info(&remote_path, &info))
    }

    /// Ownership cannot be expressed over SMB; accepted if the path exists
    pub fn chown(&mut self, path: &str, uid: u32, gid: u32) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::chown(&self.local(path), uid, gid);
        };
        let _busy = self.busy.enter();
        self.stat_virtual(&vp)
            .map(drop)
            .map_err(|e| translate("chown", &path, e))
    }

    /// Set access and modification times in seconds; `None` means now
    pub fn utime(&mut self, path: &str, times: Option<(i64, i64)>) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::utimes(&self.local(path), times);
        };
        let _busy = self.busy.enter();
        self.utime_virtual(&vp, times)
            .map_err(|e| translate("utime", &path, e))
    }

    fn utime_virtual(&mut self, vp: &VirtualPath, times: Option<(i64, i64)>) -> Result<()> {
        if vp.is_browse() || vp.is_share_root() {
            return Err(Error::Remote(NtStatus::AccessDenied));
        }
        let (atime, mtime) = match times {
            Some((atime, mtime)) => (timestamp(atime)?, timestamp(mtime)?),
            None => (Utc::now(), Utc::now()),
        };
        let info = SetInfo {
            attributes: None,
            access_time: Some(atime),
            write_time: Some(mtime),
        };
        let sid = self.session_for(vp)?;
        let remote_path = vp.remote_path();
        remote!(self, sid, |conn| conn.set_path_info(&remote_path, &info))
    }

    pub fn truncate(&mut self, path: &str, len: i64) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::truncate(&self.local(path), len);
        };
        let _busy = self.busy.enter();
        if len < 0 {
            return Err(Errno::EINVAL);
        }
        self.truncate_virtual(&vp, len as u64)
            .map_err(|e| translate("truncate", &path, e))
    }

    fn truncate_virtual(&mut self, vp: &VirtualPath, len: u64) -> Result<()> {
        if vp.is_browse() || vp.is_share_root() {
            return Err(Error::Remote(NtStatus::FileIsADirectory));
        }
        let sid = self.session_for(vp)?;
        let remote_path = vp.remote_path();
        let fid = remote!(self, sid, |conn| conn.open(&remote_path, OpenFlags::WRONLY, 0))?;
        let result = remote!(self, sid, |conn| conn.set_file_size(fid, len));
        let closed = remote!(self, sid, |conn| conn.close(fid));
        result.and(closed)
    }

    pub fn ftruncate(&mut self, fd: RawFd, len: i64) -> SysResult<()> {
        if !self.is_our_fd(fd) {
            return realcalls::ftruncate(fd, len);
        }
        let _busy = self.busy.enter();
        if len < 0 {
            return Err(Errno::EINVAL);
        }
        self.ftruncate_handle(fd, len as u64)
            .map_err(|e| translate("ftruncate", &fd, e))
    }

    fn ftruncate_handle(&mut self, fd: RawFd, len: u64) -> Result<()> {
        if self.handles.is_dir(fd) {
            return Err(Error::Os(Errno::EINVAL));
        }
        let file = self.handles.file(fd)?;
        if !file.flags.writable() {
            return Err(Error::Os(Errno::EINVAL));
        }
        let (sid, fid) = (file.session, file.fid);
        remote!(self, sid, |conn| conn.set_file_size(fid, len))
    }

    // ---- namespace ----------------------------------------------------

    pub fn chdir(&mut self, path: &str) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            realcalls::chdir(&self.local(path))?;
            self.cwd = realcalls::getcwd()?;
            return Ok(());
        };
        let _busy = self.busy.enter();
        let st = self
            .stat_virtual(&vp)
            .map_err(|e| translate("chdir", &path, e))?;
        if !st.is_dir() {
            return Err(Errno::ENOTDIR);
        }
        self.cwd = self.resolver.canonical(&vp);
        debug!("Working directory is now {}", self.cwd);
        Ok(())
    }

    /// The tracked working directory, virtual or local
    pub fn getcwd(&self) -> String {
        self.cwd.clone()
    }

    pub fn mkdir(&mut self, path: &str, mode: u32) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::mkdir(&self.local(path), mode);
        };
        let _busy = self.busy.enter();
        self.dir_call(&vp, false)
            .map_err(|e| translate("mkdir", &path, e))
    }

    pub fn rmdir(&mut self, path: &str) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::rmdir(&self.local(path));
        };
        let _busy = self.busy.enter();
        self.dir_call(&vp, true)
            .map_err(|e| translate("rmdir", &path, e))
    }

    /// Create or remove a directory below a share root
    fn dir_call(&mut self, vp: &VirtualPath, remove: bool) -> Result<()> {
        if vp.is_browse() {
            return Err(Error::Remote(NtStatus::AccessDenied));
        }
        if vp.is_share_root() {
            return Err(Error::Remote(if remove {
                NtStatus::AccessDenied
            } else {
                NtStatus::ObjectNameCollision
            }));
        }
        let sid = self.session_for(vp)?;
        let remote_path = vp.remote_path();
        if remove {
            remote!(self, sid, |conn| conn.rmdir(&remote_path))
        } else {
            remote!(self, sid, |conn| conn.mkdir(&remote_path))
        }
    }

    pub fn unlink(&mut self, path: &str) -> SysResult<()> {
        let Some(vp) = self.classify(path) else {
            return realcalls::unlink(&self.local(path));
        };
        let _busy = self.busy.enter();
        self.unlink_virtual(&vp)
            .map_err(|e| translate("unlink", &path, e))
    }

    fn unlink_virtual(&mut self, vp: &VirtualPath) -> Result<()> {
        if vp.is_browse() || vp.is_share_root() {
            return Err(Error::Remote(NtStatus::AccessDenied));
        }
        let sid = self.session_for(vp)?;
        if self.registry.session(sid)?.share_type() == ShareType::Printer {
            let name = vp.file_name();
            let jobs = remote!(self, sid, |conn| conn.list_print_jobs())?;
            let job = jobs
                .iter()
                .find(|j| j.name == name)
                .ok_or(Error::Remote(NtStatus::ObjectNameNotFound))?;
            info!("Cancelling print job {} ({})", job.id, job.name);
            let id = job.id;
            return remote!(self, sid, |conn| conn.cancel_print_job(id));
        }
        let remote_path = vp.remote_path();
        remote!(self, sid, |conn| conn.unlink(&remote_path))
    }

    pub fn rename(&mut self, from: &str, to: &str) -> SysResult<()> {
        let (src, dst) = (self.classify(from), self.classify(to));
        let (src, dst) = match (src, dst) {
            (None, None) => return realcalls::rename(&self.local(from), &self.local(to)),
            (Some(src), Some(dst)) => (src, dst),
            _ => return Err(Errno::EXDEV),
        };
        let _busy = self.busy.enter();
        self.rename_virtual(&src, &dst)
            .map_err(|e| translate("rename", &from, e))
    }

    fn rename_virtual(&mut self, src: &VirtualPath, dst: &VirtualPath) -> Result<()> {
        let same_share = match (src, dst) {
            (
                VirtualPath::InShare {
                    server: s1,
                    share: h1,
                    ..
                },
                VirtualPath::InShare {
                    server: s2,
                    share: h2,
                    ..
                },
            ) => s1.eq_ignore_ascii_case(s2) && h1.eq_ignore_ascii_case(h2),
            _ => false,
        };
        if !same_share {
            return Err(Error::Os(Errno::EXDEV));
        }
        if src.is_share_root() || dst.is_share_root() {
            return Err(Error::Remote(NtStatus::AccessDenied));
        }
        let sid = self.session_for(src)?;
        let (from, to) = (src.remote_path(), dst.remote_path());
        match remote!(self, sid, |conn| conn.rename(&from, &to)) {
            Err(e @ Error::Remote(NtStatus::ObjectNameCollision)) => {
                // The target is only removed once the source is known to exist
                remote!(self, sid, |conn| conn.path_info(&from))?;
                debug!("Rename {} -> {} collided, replacing target", from, to);
                if let Err(unlink) = remote!(self, sid, |conn| conn.unlink(&to)) {
                    debug!("Unlinking {} failed: {}", to, unlink);
                    return Err(e);
                }
                remote!(self, sid, |conn| conn.rename(&from, &to))
            }
            other => other,
        }
    }

    /// There are no symlinks in the namespace
    pub fn readlink(&mut self, path: &str) -> SysResult<String> {
        let Some(vp) = self.classify(path) else {
            return realcalls::readlink(&self.local(path));
        };
        let _busy = self.busy.enter();
        self.stat_virtual(&vp)
            .map_err(|e| translate("readlink", &path, e))?;
        Err(Errno::EINVAL)
    }

    pub fn link(&mut self, from: &str, to: &str) -> SysResult<()> {
        if self.classify(from).is_none() && self.classify(to).is_none() {
            return realcalls::link(&self.local(from), &self.local(to));
        }
        Err(Errno::ENOTSUP)
    }

    pub fn symlink(&mut self, target: &str, path: &str) -> SysResult<()> {
        if self.classify(path).is_none() {
            return realcalls::symlink(target, &self.local(path));
        }
        Err(Errno::ENOTSUP)
    }

    // ---- directories --------------------------------------------------

    /// Open a directory stream; local directories get a real fd
    pub fn opendir(&mut self, path: &str) -> SysResult<RawFd> {
        let Some(vp) = self.classify(path) else {
            return realcalls::open(
                &self.local(path),
                libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
                0,
            );
        };
        let _busy = self.busy.enter();
        self.open_dir(vp)
            .map_err(|e| translate("opendir", &path, e))
    }

    /// Next entry, or `None` at the end of the stream
    pub fn readdir(&mut self, fd: RawFd) -> SysResult<Option<DirRecord>> {
        Ok(self.getdents(fd, 1)?.pop())
    }

    /// Up to `max` entries from the stream position
    pub fn getdents(&mut self, fd: RawFd, max: usize) -> SysResult<Vec<DirRecord>> {
        if !self.is_our_fd(fd) {
            return realcalls::getdents(fd, max);
        }
        let _busy = self.busy.enter();
        match self.handles.dir_mut(fd) {
            Ok(snapshot) => Ok(snapshot.take(max)),
            Err(_) => Err(Errno::ENOTDIR),
        }
    }

    pub fn telldir(&mut self, fd: RawFd) -> SysResult<i64> {
        self.lseek(fd, 0, libc::SEEK_CUR)
    }

    pub fn seekdir(&mut self, fd: RawFd, pos: i64) -> SysResult<()> {
        self.lseek(fd, pos, libc::SEEK_SET).map(drop)
    }

    pub fn rewinddir(&mut self, fd: RawFd) -> SysResult<()> {
        self.seekdir(fd, 0)
    }

    pub fn closedir(&mut self, fd: RawFd) -> SysResult<()> {
        self.close(fd)
    }

    // ---- process lifecycle --------------------------------------------

    /// Fork the process; the child gives up every inherited handle and session
    pub fn fork(&mut self) -> SysResult<ForkOutcome> {
        let _busy = self.busy.enter();
        let guard = ForkGuard::prepare();
        let pid = realcalls::fork()?;
        if pid == 0 {
            self.after_fork_child();
            if let Some(guard) = guard {
                guard.release_parent();
            }
            Ok(ForkOutcome::Child)
        } else {
            if let Some(guard) = guard {
                guard.wait_for_child();
            }
            Ok(ForkOutcome::Parent(pid))
        }
    }

    fn after_fork_child(&mut self) {
        let dropped = self.handles.drain();
        debug!("Forked child dropped {} inherited open files", dropped.len());
        self.registry.abandon_all();
        if let Err(e) = self.executor.reset_after_fork() {
            error!("Could not rebuild runtime after fork: {}", e);
        }
    }

    /// Close every handle and log off every session
    pub fn shutdown(&mut self) {
        let _busy = self.busy.enter();
        for file in self.handles.drain() {
            if let Err(e) = remote!(self, file.session, |conn| conn.close(file.fid)) {
                debug!("Closing {:?} at shutdown: {}", file.path, e);
            }
        }
        self.registry.shutdown_all(&self.executor);
    }
}
