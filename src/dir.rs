//! Directory listings for every level of the virtual namespace

use crate::error::Result;
use crate::executor::Executor;
use crate::handles::{DirEntry, EntryKind};
use crate::path::{PathResolver, VirtualPath, IPC_SHARE};
use crate::remote::{FileInfo, ServerKind, ShareType, SmbConnection};
use crate::stat::{inode_for, FileAttributes};
use tracing::debug;

/// Fetch the complete listing of `path` over `conn`
pub fn list_entries(
    exec: &Executor,
    conn: &mut dyn SmbConnection,
    share_type: ShareType,
    path: &VirtualPath,
    resolver: &PathResolver,
) -> Result<Vec<DirEntry>> {
    let wg = resolver.default_workgroup();
    let inode = |name: &str| inode_for(&resolver.canonical(&path.child(name, wg)));

    let entries: Vec<DirEntry> = match path {
        VirtualPath::Root => exec
            .run(conn.list_servers(wg, ServerKind::Domains))?
            .into_iter()
            .map(|s| DirEntry::synthetic(&s.name, EntryKind::Workgroup, inode(&s.name)))
            .collect(),
        VirtualPath::Workgroup { workgroup } => exec
            .run(conn.list_servers(workgroup, ServerKind::Servers))?
            .into_iter()
            .map(|s| DirEntry::synthetic(&s.name, EntryKind::Server, inode(&s.name)))
            .collect(),
        VirtualPath::ServerShares { .. } => exec
            .run(conn.list_shares())?
            .into_iter()
            .filter(|s| s.share_type != ShareType::Ipc && s.name != IPC_SHARE)
            .map(|s| DirEntry::synthetic(&s.name, EntryKind::Share, inode(&s.name)))
            .collect(),
        VirtualPath::InShare { .. } if share_type == ShareType::Printer => exec
            .run(conn.list_print_jobs())?
            .into_iter()
            .map(|job| DirEntry {
                inode: inode(&job.name),
                name: job.name,
                kind: EntryKind::PrintJob,
                size: job.size,
                attributes: FileAttributes::NORMAL,
                access_time: job.submitted,
                write_time: job.submitted,
                change_time: job.submitted,
            })
            .collect(),
        VirtualPath::InShare { .. } => exec
            .run(conn.list(&path.list_pattern()))?
            .into_iter()
            .filter(|info| info.name != "." && info.name != "..")
            .map(|info| entry_from_info(info, inode))
            .collect(),
    };

    debug!("Listed {:?}: {} entries", path, entries.len());
    Ok(entries)
}

fn entry_from_info(info: FileInfo, inode: impl Fn(&str) -> u64) -> DirEntry {
    DirEntry {
        inode: inode(&info.name),
        kind: if info.is_directory() {
            EntryKind::Directory
        } else {
            EntryKind::File
        },
        size: info.size,
        attributes: info.attributes,
        access_time: info.access_time,
        write_time: info.write_time,
        change_time: info.change_time,
        name: info.name,
    }
}
