//! Virtual file descriptors
//!
//! Every shim handle is backed by a real OS fd opened on a throwaway file,
//! so the number can never collide with a descriptor the kernel hands out
//! elsewhere. The fd is simultaneously a set bit in the [`HandleBitmap`] and
//! a key in the table; all three come and go together.

pub mod bitmap;
pub mod snapshot;

pub use bitmap::HandleBitmap;
pub use snapshot::{DirEntry, DirRecord, DirSnapshot, EntryKind, DIRENT_RECORD_SIZE};

use crate::error::{Error, Result};
use crate::path::VirtualPath;
use crate::realcalls;
use crate::registry::SessionId;
use crate::remote::{OpenFlags, RemoteFid};
use std::collections::HashMap;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tracing::{error, warn};

/// Identifier of an [`OpenFile`] shared by dup'ed descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenFileId(u64);

/// A remote open file; dup'ed descriptors share one of these, offset included
#[derive(Debug, Clone)]
pub struct OpenFile {
    pub session: SessionId,
    pub fid: RemoteFid,
    pub path: VirtualPath,
    pub flags: OpenFlags,
    pub offset: u64,
    refs: usize,
}

impl OpenFile {
    /// Number of descriptors referring to this file
    pub fn refs(&self) -> usize {
        self.refs
    }
}

#[derive(Debug)]
enum HandleKind {
    File(OpenFileId),
    Dir(Box<DirSnapshot>),
}

#[derive(Debug)]
struct Handle {
    backing: OwnedFd,
    kind: HandleKind,
}

/// Result of closing a descriptor
#[derive(Debug)]
pub enum Closed {
    /// Other descriptors still refer to the open file
    Alias,
    /// The last reference; the remote handle must be closed by the caller
    LastRef(OpenFile),
    Dir(Box<DirSnapshot>),
}

/// fd -> open file or directory snapshot
#[derive(Debug)]
pub struct HandleTable {
    bitmap: HandleBitmap,
    handles: HashMap<RawFd, Handle>,
    files: HashMap<OpenFileId, OpenFile>,
    backing_file: PathBuf,
    next_file: u64,
}

impl HandleTable {
    pub fn new(backing_file: &Path, capacity: usize) -> Self {
        Self {
            bitmap: HandleBitmap::new(capacity),
            handles: HashMap::new(),
            files: HashMap::new(),
            backing_file: backing_file.to_path_buf(),
            next_file: 0,
        }
    }

    /// Whether `fd` belongs to the shim; consults the bitmap only
    pub fn is_ours(&self, fd: RawFd) -> bool {
        self.bitmap.contains(fd)
    }

    /// Number of live descriptors
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Number of distinct open files
    pub fn open_files(&self) -> usize {
        self.files.len()
    }

    pub fn bitmap(&self) -> &HandleBitmap {
        &self.bitmap
    }

    /// Register a freshly opened remote file
    pub fn insert_file(
        &mut self,
        session: SessionId,
        fid: RemoteFid,
        path: VirtualPath,
        flags: OpenFlags,
    ) -> Result<RawFd> {
        let backing = self.open_backing()?;
        self.next_file += 1;
        let id = OpenFileId(self.next_file);
        let fd = self.register(backing, HandleKind::File(id))?;
        self.files.insert(
            id,
            OpenFile {
                session,
                fid,
                path,
                flags,
                offset: 0,
                refs: 1,
            },
        );
        Ok(fd)
    }

    /// Register a directory listing
    pub fn insert_dir(&mut self, snapshot: DirSnapshot) -> Result<RawFd> {
        let backing = self.open_backing()?;
        self.register(backing, HandleKind::Dir(Box::new(snapshot)))
    }

    fn open_backing(&self) -> Result<OwnedFd> {
        Ok(File::open(&self.backing_file)?.into())
    }

    fn register(&mut self, backing: OwnedFd, kind: HandleKind) -> Result<RawFd> {
        let fd = backing.as_raw_fd();
        if !self.bitmap.in_range(fd) {
            warn!(
                "fd {} exceeds handle capacity {}",
                fd,
                self.bitmap.capacity()
            );
            return Err(Error::ResourceExhausted(format!(
                "fd {} beyond capacity {}",
                fd,
                self.bitmap.capacity()
            )));
        }
        if self.bitmap.contains(fd) || self.handles.contains_key(&fd) {
            error!("fd {} handed out by the kernel is already registered", fd);
            // The existing entry owns this fd number
            std::mem::forget(backing);
            return Err(Error::InternalConsistency(format!(
                "fd {} already registered",
                fd
            )));
        }
        self.bitmap.set(fd);
        self.handles.insert(fd, Handle { backing, kind });
        Ok(fd)
    }

    fn handle(&self, fd: RawFd) -> Result<&Handle> {
        self.handles.get(&fd).ok_or(Error::BadHandle(fd))
    }

    pub fn is_dir(&self, fd: RawFd) -> bool {
        matches!(
            self.handles.get(&fd),
            Some(Handle {
                kind: HandleKind::Dir(_),
                ..
            })
        )
    }

    /// The real fd behind a shim descriptor
    pub fn backing_fd(&self, fd: RawFd) -> Result<RawFd> {
        Ok(self.handle(fd)?.backing.as_raw_fd())
    }

    fn file_id(&self, fd: RawFd) -> Result<OpenFileId> {
        match self.handle(fd)?.kind {
            HandleKind::File(id) => Ok(id),
            HandleKind::Dir(_) => Err(Error::BadHandle(fd)),
        }
    }

    pub fn file(&self, fd: RawFd) -> Result<&OpenFile> {
        let id = self.file_id(fd)?;
        self.files
            .get(&id)
            .ok_or_else(|| Error::InternalConsistency(format!("fd {} has no open file", fd)))
    }

    pub fn file_mut(&mut self, fd: RawFd) -> Result<&mut OpenFile> {
        let id = self.file_id(fd)?;
        self.files
            .get_mut(&id)
            .ok_or_else(|| Error::InternalConsistency(format!("fd {} has no open file", fd)))
    }

    pub fn dir(&self, fd: RawFd) -> Result<&DirSnapshot> {
        match &self.handle(fd)?.kind {
            HandleKind::Dir(snapshot) => Ok(snapshot),
            HandleKind::File(_) => Err(Error::BadHandle(fd)),
        }
    }

    pub fn dir_mut(&mut self, fd: RawFd) -> Result<&mut DirSnapshot> {
        match self.handles.get_mut(&fd) {
            Some(Handle {
                kind: HandleKind::Dir(snapshot),
                ..
            }) => Ok(snapshot),
            _ => Err(Error::BadHandle(fd)),
        }
    }

    /// Alias `fd` on the lowest free descriptor
    pub fn dup(&mut self, fd: RawFd) -> Result<RawFd> {
        let id = self.file_id(fd)?;
        let backing = self.handle(fd)?.backing.try_clone()?;
        self.alias(id, backing)
    }

    /// Alias `fd` on the lowest free descriptor at or above `min`
    pub fn dup_from(&mut self, fd: RawFd, min: RawFd) -> Result<RawFd> {
        let id = self.file_id(fd)?;
        let raw = realcalls::fcntl(self.backing_fd(fd)?, libc::F_DUPFD_CLOEXEC, min)?;
        let backing = realcalls::adopt(raw)?;
        self.alias(id, backing)
    }

    /// Alias `fd` onto exactly `target`, closing a shim descriptor there first.
    ///
    /// The replaced handle comes back even when aliasing fails, so the caller
    /// can always release it.
    pub fn dup2(&mut self, fd: RawFd, target: RawFd) -> (Option<Closed>, Result<RawFd>) {
        let found = self.file_id(fd).and_then(|id| Ok((id, self.backing_fd(fd)?)));
        let (id, source) = match found {
            Ok(found) => found,
            Err(e) => return (None, Err(e)),
        };
        if fd == target {
            return (None, Ok(target));
        }
        // dup2 replaces the old target atomically, so its number must not be
        // closed in between
        match self.detach(target) {
            Ok((replaced, closed)) => {
                let attached = self.attach(id, source, target, Some(replaced));
                (Some(closed), attached)
            }
            Err(_) => (None, self.attach(id, source, target, None)),
        }
    }

    fn attach(
        &mut self,
        id: OpenFileId,
        source: RawFd,
        target: RawFd,
        replaced: Option<OwnedFd>,
    ) -> Result<RawFd> {
        let raw = realcalls::dup2(source, target)?;
        if let Some(old) = replaced {
            // The kernel already closed it
            std::mem::forget(old);
        }
        let backing = realcalls::adopt(raw)?;
        self.alias(id, backing)
    }

    fn alias(&mut self, id: OpenFileId, backing: OwnedFd) -> Result<RawFd> {
        let fd = self.register(backing, HandleKind::File(id))?;
        if let Some(file) = self.files.get_mut(&id) {
            file.refs += 1;
        }
        Ok(fd)
    }

    /// Release a descriptor and its backing fd
    pub fn close(&mut self, fd: RawFd) -> Result<Closed> {
        let (backing, closed) = self.detach(fd)?;
        drop(backing);
        Ok(closed)
    }

    /// Unregister `fd`, handing back its still-open backing fd
    fn detach(&mut self, fd: RawFd) -> Result<(OwnedFd, Closed)> {
        let handle = self.handles.remove(&fd).ok_or(Error::BadHandle(fd))?;
        self.bitmap.clear(fd);
        let closed = self.unref(fd, handle.kind)?;
        Ok((handle.backing, closed))
    }

    fn unref(&mut self, fd: RawFd, kind: HandleKind) -> Result<Closed> {
        match kind {
            HandleKind::Dir(snapshot) => Ok(Closed::Dir(snapshot)),
            HandleKind::File(id) => {
                let file = self.files.get_mut(&id).ok_or_else(|| {
                    Error::InternalConsistency(format!("fd {} has no open file", fd))
                })?;
                file.refs -= 1;
                if file.refs > 0 {
                    return Ok(Closed::Alias);
                }
                self.files
                    .remove(&id)
                    .map(Closed::LastRef)
                    .ok_or_else(|| Error::InternalConsistency(format!("fd {} vanished", fd)))
            }
        }
    }

    /// Remove every descriptor, returning the open files that were live
    pub fn drain(&mut self) -> Vec<OpenFile> {
        for fd in self.handles.keys() {
            self.bitmap.clear(*fd);
        }
        self.handles.clear();
        self.files.drain().map(|(_, file)| file).collect()
    }
}
