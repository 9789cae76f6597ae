//! Local directories exported as SMB shares
//!
//! Each export maps `SERVER/SHARE` onto a directory of the local filesystem.
//! Servers get loopback addresses in export order and all of them live in a
//! single workgroup whose master browser is the first server exported.

use super::{
    pattern_dir, smb_components, FileInfo, OpenFlags, PrintJob, RemoteFid, ServerInfo,
    ServerKind, SetInfo, ShareInfo, ShareType, SmbConnection, SmbConnector,
};
use crate::config::ClientIdentity;
use crate::credentials::Credentials;
use crate::error::{Error, NtStatus, Result};
use crate::netbios::{NetBiosName, WILDCARD_SERVER_NAME};
use crate::path::IPC_SHARE;
use crate::stat::FileAttributes;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::fs::{FileTimes, Metadata};
use std::io::{self, SeekFrom};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct LocalServer {
    name: String,
    addr: IpAddr,
    shares: BTreeMap<String, PathBuf>,
}

#[derive(Debug, Clone, Default)]
struct Exports {
    workgroup: String,
    servers: Vec<LocalServer>,
}

/// Network of local directory exports
#[derive(Debug, Clone)]
pub struct LocalNetwork {
    exports: Arc<Exports>,
}

impl LocalNetwork {
    pub fn new(workgroup: &str) -> Self {
        Self {
            exports: Arc::new(Exports {
                workgroup: workgroup.to_string(),
                servers: Vec::new(),
            }),
        }
    }

    /// Export `root` as `\\server\share`
    pub fn export(&mut self, server: &str, share: &str, root: impl AsRef<Path>) -> Result<()> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::Config(format!(
                "Export root is not a directory: {:?}",
                root
            )));
        }
        let root = root.canonicalize()?;
        let exports = Arc::make_mut(&mut self.exports);
        let index = match exports
            .servers
            .iter()
            .position(|s| s.name.eq_ignore_ascii_case(server))
        {
            Some(index) => index,
            None => {
                let n = exports.servers.len() as u8 + 1;
                exports.servers.push(LocalServer {
                    name: server.to_string(),
                    addr: IpAddr::V4(Ipv4Addr::new(127, 0, 0, n)),
                    shares: BTreeMap::new(),
                });
                exports.servers.len() - 1
            }
        };
        info!("Exporting {:?} as \\\\{}\\{}", root, server, share);
        exports.servers[index]
            .shares
            .insert(share.to_string(), root);
        Ok(())
    }

    /// Parse and apply a `SERVER/SHARE=DIR` export description
    pub fn add_export(&mut self, export: &str) -> Result<()> {
        let (target, dir) = export
            .split_once('=')
            .ok_or_else(|| Error::Config(format!("Export must be SERVER/SHARE=DIR: {}", export)))?;
        let (server, share) = target
            .split_once('/')
            .filter(|(server, share)| !server.is_empty() && !share.is_empty())
            .ok_or_else(|| Error::Config(format!("Export must be SERVER/SHARE=DIR: {}", export)))?;
        self.export(server, share, dir)
    }

    pub fn workgroup(&self) -> &str {
        &self.exports.workgroup
    }

    fn server(&self, addr: IpAddr) -> Option<&LocalServer> {
        self.exports.servers.iter().find(|s| s.addr == addr)
    }
}

#[async_trait]
impl SmbConnector for LocalNetwork {
    async fn resolve_host(&self, name: &str) -> Result<IpAddr> {
        if let Ok(addr) = name.parse::<IpAddr>() {
            return Ok(addr);
        }
        let wanted = NetBiosName::parse(name).name;
        self.exports
            .servers
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(&wanted))
            .map(|s| s.addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))
    }

    async fn find_master_browser(&self, workgroup: &str) -> Result<IpAddr> {
        if !workgroup.eq_ignore_ascii_case(&self.exports.workgroup) {
            return Err(Error::Remote(NtStatus::BadNetworkPath));
        }
        self.exports
            .servers
            .first()
            .map(|s| s.addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))
    }

    async fn connect(
        &self,
        addr: IpAddr,
        called_name: &str,
        client: &ClientIdentity,
    ) -> Result<Box<dyn SmbConnection>> {
        let server = self
            .server(addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))?;
        if called_name != WILDCARD_SERVER_NAME && !called_name.eq_ignore_ascii_case(&server.name)
        {
            return Err(Error::Remote(NtStatus::BadNetworkName));
        }
        debug!("Local connection from {} to {}", client.workstation, server.name);
        Ok(Box::new(LocalConnection {
            network: self.clone(),
            server: server.clone(),
            root: None,
            files: HashMap::new(),
            next_fid: 0,
        }))
    }
}

struct LocalFile {
    path: PathBuf,
    file: File,
}

/// One connection to a local export
pub struct LocalConnection {
    network: LocalNetwork,
    server: LocalServer,
    root: Option<PathBuf>,
    files: HashMap<u64, LocalFile>,
    next_fid: u64,
}

impl LocalConnection {
    /// Map an SMB path under the connected share onto the local filesystem
    fn resolve_path(&self, path: &str) -> Result<PathBuf> {
        let root = self
            .root
            .as_ref()
            .ok_or(Error::Remote(NtStatus::NetworkNameDeleted))?;
        let mut full_path = root.clone();
        for component in smb_components(path) {
            match component {
                "." => continue,
                ".." => return Err(Error::Remote(NtStatus::AccessDenied)),
                other => full_path.push(other),
            }
        }
        // Symlinks must not lead out of the export
        if let Ok(canonical) = full_path.canonicalize() {
            if !canonical.starts_with(root) {
                return Err(Error::Remote(NtStatus::AccessDenied));
            }
        }
        Ok(full_path)
    }

    fn file(&mut self, fid: RemoteFid) -> Result<&mut LocalFile> {
        self.files
            .get_mut(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))
    }
}

fn status_from_io(err: io::Error) -> Error {
    let status = match err.raw_os_error() {
        Some(libc::ENOENT) => NtStatus::ObjectNameNotFound,
        Some(libc::EEXIST) => NtStatus::ObjectNameCollision,
        Some(libc::EACCES) | Some(libc::EPERM) => NtStatus::AccessDenied,
        Some(libc::ENOTEMPTY) => NtStatus::DirectoryNotEmpty,
        Some(libc::ENOTDIR) => NtStatus::NotADirectory,
        Some(libc::EISDIR) => NtStatus::FileIsADirectory,
        Some(libc::ENOSPC) => NtStatus::DiskFull,
        Some(libc::EROFS) => NtStatus::MediaWriteProtected,
        _ => return Error::Io(err),
    };
    Error::Remote(status)
}

fn metadata_to_info(name: &str, metadata: &Metadata) -> FileInfo {
    let time = |t: io::Result<SystemTime>| -> DateTime<Utc> {
        t.map(DateTime::<Utc>::from).unwrap_or_default()
    };

    let mut attributes = FileAttributes::empty();
    if metadata.is_dir() {
        attributes |= FileAttributes::DIRECTORY;
    }
    if metadata.permissions().readonly() {
        attributes |= FileAttributes::READONLY;
    }
    if name.starts_with('.') {
        attributes |= FileAttributes::HIDDEN;
    }
    if attributes.is_empty() {
        attributes = FileAttributes::NORMAL;
    }

    let modified = time(metadata.modified());
    FileInfo {
        name: name.to_string(),
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        attributes,
        access_time: time(metadata.accessed()),
        write_time: modified,
        change_time: modified,
    }
}

fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

#[async_trait]
impl SmbConnection for LocalConnection {
    async fn negotiate(&mut self) -> Result<()> {
        Ok(())
    }

    async fn session_setup(&mut self, credentials: &Credentials) -> Result<()> {
        debug!(
            "Local session for {:?} on {}",
            credentials, self.server.name
        );
        Ok(())
    }

    async fn tree_connect(&mut self, share: &str) -> Result<ShareType> {
        if share == IPC_SHARE {
            self.root = None;
            return Ok(ShareType::Ipc);
        }
        let root = self
            .server
            .shares
            .get(share)
            .ok_or(Error::Remote(NtStatus::BadNetworkName))?;
        self.root = Some(root.clone());
        Ok(ShareType::Disk)
    }

    async fn open(&mut self, path: &str, flags: OpenFlags, _mode: u32) -> Result<RemoteFid> {
        let full_path = self.resolve_path(path)?;
        if let Ok(metadata) = fs::metadata(&full_path).await {
            if metadata.is_dir() {
                return Err(Error::Remote(NtStatus::FileIsADirectory));
            }
        }

        let mut options = OpenOptions::new();
        options
            .read(flags.readable())
            .write(flags.writable())
            .truncate(flags.contains(OpenFlags::TRUNC) && flags.writable());
        if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
            options.create_new(true);
        } else if flags.contains(OpenFlags::CREAT) {
            options.create(true);
        }
        // O_CREAT without write access still has to create the file
        if flags.contains(OpenFlags::CREAT) && !flags.writable() {
            options.write(true);
        }
        let file = options.open(&full_path).await.map_err(status_from_io)?;

        self.next_fid += 1;
        self.files.insert(
            self.next_fid,
            LocalFile {
                path: full_path,
                file,
            },
        );
        Ok(RemoteFid(self.next_fid))
    }

    async fn read(&mut self, fid: RemoteFid, offset: u64, len: usize) -> Result<Bytes> {
        let open = self.file(fid)?;
        open.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(status_from_io)?;
        let mut buffer = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = open
                .file
                .read(&mut buffer[filled..])
                .await
                .map_err(status_from_io)?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(Bytes::from(buffer))
    }

    async fn write(&mut self, fid: RemoteFid, offset: u64, data: &[u8]) -> Result<usize> {
        let open = self.file(fid)?;
        open.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(status_from_io)?;
        open.file.write_all(data).await.map_err(status_from_io)?;
        open.file.flush().await.map_err(status_from_io)?;
        Ok(data.len())
    }

    async fn close(&mut self, fid: RemoteFid) -> Result<()> {
        let mut open = self
            .files
            .remove(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
        open.file.flush().await.map_err(status_from_io)?;
        Ok(())
    }

    async fn file_info(&mut self, fid: RemoteFid) -> Result<FileInfo> {
        let open = self.file(fid)?;
        let metadata = open.file.metadata().await.map_err(status_from_io)?;
        Ok(metadata_to_info(file_name(&open.path), &metadata))
    }

    async fn set_file_size(&mut self, fid: RemoteFid, size: u64) -> Result<()> {
        let open = self.file(fid)?;
        open.file.set_len(size).await.map_err(status_from_io)
    }

    async fn path_info(&mut self, path: &str) -> Result<FileInfo> {
        let full_path = self.resolve_path(path)?;
        let metadata = fs::metadata(&full_path).await.map_err(status_from_io)?;
        let name = smb_components(path).last().unwrap_or("");
        Ok(metadata_to_info(name, &metadata))
    }

    async fn set_path_info(&mut self, path: &str, info: &SetInfo) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        if let Some(attributes) = info.attributes {
            let mut permissions = fs::metadata(&full_path)
                .await
                .map_err(status_from_io)?
                .permissions();
            permissions.set_readonly(attributes.contains(FileAttributes::READONLY));
            fs::set_permissions(&full_path, permissions)
                .await
                .map_err(status_from_io)?;
        }
        if info.access_time.is_some() || info.write_time.is_some() {
            let mut times = FileTimes::new();
            if let Some(t) = info.access_time {
                times = times.set_accessed(t.into());
            }
            if let Some(t) = info.write_time {
                times = times.set_modified(t.into());
            }
            let file = std::fs::File::open(&full_path).map_err(status_from_io)?;
            file.set_times(times).map_err(status_from_io)?;
        }
        Ok(())
    }

    async fn list(&mut self, pattern: &str) -> Result<Vec<FileInfo>> {
        let dir = self.resolve_path(pattern_dir(pattern))?;
        let mut entries = fs::read_dir(&dir).await.map_err(status_from_io)?;
        let mut infos = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(status_from_io)? {
            let Ok(name) = entry.file_name().into_string() else {
                debug!("Skipping non UTF-8 name in {:?}", dir);
                continue;
            };
            match entry.metadata().await {
                Ok(metadata) => infos.push(metadata_to_info(&name, &metadata)),
                Err(e) => debug!("Skipping {:?}: {}", entry.path(), e),
            }
        }
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn list_shares(&mut self) -> Result<Vec<ShareInfo>> {
        let mut shares = vec![ShareInfo {
            name: IPC_SHARE.to_string(),
            share_type: ShareType::Ipc,
            comment: "IPC Service".to_string(),
        }];
        shares.extend(self.server.shares.iter().map(|(name, root)| ShareInfo {
            name: name.clone(),
            share_type: ShareType::Disk,
            comment: root.display().to_string(),
        }));
        Ok(shares)
    }

    async fn list_servers(
        &mut self,
        workgroup: &str,
        kind: ServerKind,
    ) -> Result<Vec<ServerInfo>> {
        let exports = &self.network.exports;
        Ok(match kind {
            ServerKind::Domains => vec![ServerInfo {
                name: exports.workgroup.clone(),
                comment: String::new(),
            }],
            ServerKind::Servers if workgroup.eq_ignore_ascii_case(&exports.workgroup) => exports
                .servers
                .iter()
                .map(|s| ServerInfo {
                    name: s.name.clone(),
                    comment: String::new(),
                })
                .collect(),
            ServerKind::Servers => Vec::new(),
        })
    }

    async fn list_print_jobs(&mut self) -> Result<Vec<PrintJob>> {
        Ok(Vec::new())
    }

    async fn cancel_print_job(&mut self, _id: u32) -> Result<()> {
        Err(Error::Remote(NtStatus::NotSupported))
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::create_dir(&full_path).await.map_err(status_from_io)
    }

    async fn rmdir(&mut self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        fs::remove_dir(&full_path).await.map_err(status_from_io)
    }

    async fn unlink(&mut self, path: &str) -> Result<()> {
        let full_path = self.resolve_path(path)?;
        let metadata = fs::symlink_metadata(&full_path)
            .await
            .map_err(status_from_io)?;
        if metadata.is_dir() {
            return Err(Error::Remote(NtStatus::FileIsADirectory));
        }
        fs::remove_file(&full_path).await.map_err(status_from_io)
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        let from = self.resolve_path(from)?;
        let to = self.resolve_path(to)?;
        fs::symlink_metadata(&from).await.map_err(status_from_io)?;
        // SMB rename does not replace an existing target
        if fs::try_exists(&to).await.map_err(status_from_io)? {
            return Err(Error::Remote(NtStatus::ObjectNameCollision));
        }
        fs::rename(&from, &to).await.map_err(status_from_io)
    }

    async fn shutdown(&mut self) -> Result<()> {
        for (_, mut open) in self.files.drain() {
            let _ = open.file.flush().await;
        }
        self.root = None;
        Ok(())
    }
}
