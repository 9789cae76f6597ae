//! In-memory directory listings behind directory handles

use crate::error::{Errno, Result};
use crate::path::VirtualPath;
use crate::stat::{inode_for, FileAttributes};
use chrono::{DateTime, Utc};
use std::mem;

/// Byte size of one directory record, as seen by `lseek` and `fstat`
pub const DIRENT_RECORD_SIZE: usize = mem::size_of::<libc::dirent>();

/// What an entry stands for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Workgroup,
    Server,
    Share,
    PrintJob,
    Directory,
    File,
}

impl EntryKind {
    /// Whether the entry lists as a directory
    pub fn is_dir(self) -> bool {
        !matches!(self, EntryKind::File | EntryKind::PrintJob)
    }

    /// `d_type` value for `getdents`
    pub fn d_type(self) -> u8 {
        if self.is_dir() {
            libc::DT_DIR
        } else {
            libc::DT_REG
        }
    }
}

/// One entry of a snapshot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub attributes: FileAttributes,
    pub access_time: DateTime<Utc>,
    pub write_time: DateTime<Utc>,
    pub change_time: DateTime<Utc>,
    pub inode: u64,
}

impl DirEntry {
    /// A directory-like entry with no remote attributes
    pub fn synthetic(name: &str, kind: EntryKind, inode: u64) -> Self {
        let epoch = DateTime::<Utc>::default();
        Self {
            name: name.to_string(),
            kind,
            size: 0,
            attributes: FileAttributes::DIRECTORY,
            access_time: epoch,
            write_time: epoch,
            change_time: epoch,
            inode,
        }
    }
}

/// One record returned by `readdir`/`getdents`, shim or local alike
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub inode: u64,
    /// Position of the following record, valid for `seekdir`
    pub offset: i64,
    pub d_type: u8,
    pub name: String,
}

impl DirRecord {
    fn from_entry(entry: &DirEntry, index: usize) -> Self {
        Self {
            inode: entry.inode,
            offset: ((index + 1) * DIRENT_RECORD_SIZE) as i64,
            d_type: entry.kind.d_type(),
            name: entry.name.clone(),
        }
    }
}

/// A complete listing taken at opendir time plus a cursor
#[derive(Debug, Clone)]
pub struct DirSnapshot {
    path: VirtualPath,
    dev: u64,
    entries: Vec<DirEntry>,
    cursor: usize,
}

impl DirSnapshot {
    /// Build a snapshot; `.` and `..` are added when the listing lacks them
    pub fn new(
        path: VirtualPath,
        dev: u64,
        self_canonical: &str,
        parent_canonical: &str,
        listed: Vec<DirEntry>,
    ) -> Self {
        let has_dot = listed.iter().any(|e| e.name == ".");
        let has_dotdot = listed.iter().any(|e| e.name == "..");
        let mut entries = Vec::with_capacity(listed.len() + 2);
        if !has_dot {
            entries.push(DirEntry::synthetic(
                ".",
                EntryKind::Directory,
                inode_for(self_canonical),
            ));
        }
        if !has_dotdot {
            entries.push(DirEntry::synthetic(
                "..",
                EntryKind::Directory,
                inode_for(parent_canonical),
            ));
        }
        entries.extend(listed);
        Self {
            path,
            dev,
            entries,
            cursor: 0,
        }
    }

    pub fn path(&self) -> &VirtualPath {
        &self.path
    }

    pub fn dev(&self) -> u64 {
        self.dev
    }

    pub fn entries(&self) -> &[DirEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Size reported by fstat on the directory handle
    pub fn len_bytes(&self) -> u64 {
        (self.entries.len() * DIRENT_RECORD_SIZE) as u64
    }

    /// Next entry, or `None` at the end
    pub fn read(&mut self) -> Option<&DirEntry> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some(entry)
    }

    /// Up to `max` records from the cursor
    pub fn take(&mut self, max: usize) -> Vec<DirRecord> {
        let start = self.cursor;
        let end = start.saturating_add(max).min(self.entries.len());
        self.cursor = end;
        self.entries[start..end]
            .iter()
            .enumerate()
            .map(|(i, entry)| DirRecord::from_entry(entry, start + i))
            .collect()
    }

    pub fn tell(&self) -> usize {
        self.cursor
    }

    /// Move the cursor to entry `pos`, clamped to the end
    pub fn seek(&mut self, pos: usize) {
        self.cursor = pos.min(self.entries.len());
    }

    pub fn rewind(&mut self) {
        self.cursor = 0;
    }

    /// `lseek` in units of [`DIRENT_RECORD_SIZE`]; only `SEEK_SET` and `SEEK_CUR`
    pub fn lseek(&mut self, offset: i64, whence: i32) -> Result<i64> {
        let record = DIRENT_RECORD_SIZE as i64;
        let base = match whence {
            libc::SEEK_SET => 0,
            libc::SEEK_CUR => self.cursor as i64 * record,
            _ => return Err(Errno::EINVAL.into()),
        };
        let target = base.checked_add(offset).ok_or(Errno::EINVAL)?;
        if target < 0 {
            return Err(Errno::EINVAL.into());
        }
        self.seek((target / record) as usize);
        Ok(self.cursor as i64 * record)
    }
}
