//! In-memory simulated SMB network
//!
//! Workgroups, servers, users, shares and file trees live in one shared
//! structure, so every connection to the same share observes the same data.
//! Used by the test suites and handy for embedding demos.

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
use std::net::IpAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

/// Operation counters, for asserting on connection reuse and leaks
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetStats {
    pub resolves: usize,
    pub master_lookups: usize,
    pub connects: usize,
    pub rejected_session_requests: usize,
    pub session_setups: usize,
    pub anonymous_logins: usize,
    pub tree_connects: usize,
    pub shutdowns: usize,
    pub open_files: usize,
}

#[derive(Debug, Clone)]
struct Meta {
    attributes: FileAttributes,
    access_time: DateTime<Utc>,
    write_time: DateTime<Utc>,
    change_time: DateTime<Utc>,
}

impl Meta {
    fn now(attributes: FileAttributes) -> Self {
        let now = Utc::now();
        Self {
            attributes,
            access_time: now,
            write_time: now,
            change_time: now,
        }
    }
}

#[derive(Debug, Clone)]
enum Node {
    File { data: Vec<u8>, meta: Meta },
    Dir { children: BTreeMap<String, Node>, meta: Meta },
}

impl Node {
    fn empty_dir() -> Self {
        Node::Dir {
            children: BTreeMap::new(),
            meta: Meta::now(FileAttributes::DIRECTORY),
        }
    }

    fn info(&self, name: &str) -> FileInfo {
        let (size, meta) = match self {
            Node::File { data, meta } => (data.len() as u64, meta),
            Node::Dir { meta, .. } => (0, meta),
        };
        FileInfo {
            name: name.to_string(),
            size,
            attributes: meta.attributes,
            access_time: meta.access_time,
            write_time: meta.write_time,
            change_time: meta.change_time,
        }
    }

    fn meta_mut(&mut self) -> &mut Meta {
        match self {
            Node::File { meta, .. } | Node::Dir { meta, .. } => meta,
        }
    }
}

#[derive(Debug)]
struct Share {
    share_type: ShareType,
    comment: String,
    root: Node,
    jobs: Vec<PrintJob>,
}

#[derive(Debug)]
struct Server {
    workgroup: String,
    addr: IpAddr,
    accepts_own_name: bool,
    allow_anonymous: bool,
    users: HashMap<String, String>,
    shares: BTreeMap<String, Share>,
}

#[derive(Debug)]
enum OpenTarget {
    File(Vec<String>),
    Job(u32),
}

#[derive(Debug)]
struct OpenFid {
    server: String,
    share: String,
    target: OpenTarget,
}

#[derive(Debug, Default)]
struct NetState {
    servers: BTreeMap<String, Server>,
    masters: HashMap<String, String>,
    stats: NetStats,
    open: HashMap<u64, OpenFid>,
    next_fid: u64,
    next_job: u32,
    latency: Duration,
}

impl NetState {
    fn server_by_addr(&self, addr: IpAddr) -> Option<&str> {
        self.servers
            .iter()
            .find(|(_, s)| s.addr == addr)
            .map(|(name, _)| name.as_str())
    }

    fn share_mut(&mut self, server: &str, share: &str) -> Result<&mut Share> {
        self.servers
            .get_mut(server)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?
            .shares
            .get_mut(share)
            .ok_or(Error::Remote(NtStatus::BadNetworkName))
    }
}

/// A simulated network of SMB servers
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<Mutex<NetState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, NetState> {
        // A panicking test thread must not wedge the others
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a server to a workgroup; the first server of a workgroup is its master browser
    pub fn add_server(&self, workgroup: &str, name: &str, addr: IpAddr) {
        let mut state = self.state();
        state
            .masters
            .entry(workgroup.to_string())
            .or_insert_with(|| name.to_string());
        state.servers.insert(
            name.to_string(),
            Server {
                workgroup: workgroup.to_string(),
                addr,
                accepts_own_name: true,
                allow_anonymous: true,
                users: HashMap::new(),
                shares: BTreeMap::new(),
            },
        );
    }

    /// Register an account on a server
    pub fn add_user(&self, server: &str, username: &str, password: &str) -> Result<()> {
        let mut state = self.state();
        let srv = state
            .servers
            .get_mut(server)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?;
        srv.users.insert(username.to_string(), password.to_string());
        Ok(())
    }

    /// Whether a server accepts anonymous session setup
    pub fn set_allow_anonymous(&self, server: &str, allow: bool) -> Result<()> {
        let mut state = self.state();
        let srv = state
            .servers
            .get_mut(server)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?;
        srv.allow_anonymous = allow;
        Ok(())
    }

    /// Make a server refuse session requests addressed to its own name
    pub fn set_rejects_own_name(&self, server: &str) -> Result<()> {
        let mut state = self.state();
        let srv = state
            .servers
            .get_mut(server)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?;
        srv.accepts_own_name = false;
        Ok(())
    }

    /// Export a new, empty share
    pub fn add_share(&self, server: &str, share: &str, share_type: ShareType) -> Result<()> {
        let mut state = self.state();
        let srv = state
            .servers
            .get_mut(server)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?;
        srv.shares.insert(
            share.to_string(),
            Share {
                share_type,
                comment: String::new(),
                root: Node::empty_dir(),
                jobs: Vec::new(),
            },
        );
        Ok(())
    }

    /// Create a file (and any missing parent directories) with `data`
    pub fn put_file(&self, server: &str, share: &str, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        let share = state.share_mut(server, share)?;
        let comps: Vec<String> = path
            .split(['/', '\\'])
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        let (name, dirs) = comps
            .split_last()
            .ok_or(Error::Remote(NtStatus::ObjectNameInvalid))?;
        let mut node = &mut share.root;
        for dir in dirs {
            node = match node {
                Node::Dir { children, .. } => children
                    .entry(dir.clone())
                    .or_insert_with(Node::empty_dir),
                Node::File { .. } => return Err(Error::Remote(NtStatus::NotADirectory)),
            };
        }
        match node {
            Node::Dir { children, .. } => {
                children.insert(
                    name.clone(),
                    Node::File {
                        data: data.to_vec(),
                        meta: Meta::now(FileAttributes::ARCHIVE),
                    },
                );
                Ok(())
            }
            Node::File { .. } => Err(Error::Remote(NtStatus::NotADirectory)),
        }
    }

    /// Contents of a file, if it exists
    pub fn file_contents(&self, server: &str, share: &str, path: &str) -> Option<Vec<u8>> {
        let mut state = self.state();
        let share = state.share_mut(server, share).ok()?;
        let comps: Vec<&str> = path.split(['/', '\\']).filter(|c| !c.is_empty()).collect();
        match lookup(&share.root, &comps)? {
            Node::File { data, .. } => Some(data.clone()),
            Node::Dir { .. } => None,
        }
    }

    /// Queue a print job on a printer share
    pub fn add_print_job(&self, server: &str, share: &str, name: &str, size: u64) -> Result<u32> {
        let mut state = self.state();
        state.next_job += 1;
        let id = state.next_job;
        let share = state.share_mut(server, share)?;
        share.jobs.push(PrintJob {
            id,
            name: name.to_string(),
            size,
            submitted: Utc::now(),
        });
        Ok(id)
    }

    /// Delay applied before every remote operation
    pub fn set_latency(&self, latency: Duration) {
        self.state().latency = latency;
    }

    /// Snapshot of the operation counters
    pub fn stats(&self) -> NetStats {
        let state = self.state();
        NetStats {
            open_files: state.open.len(),
            ..state.stats.clone()
        }
    }

    async fn delay(&self) {
        let latency = self.state().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn lookup<'a>(root: &'a Node, comps: &[&str]) -> Option<&'a Node> {
    let mut node = root;
    for comp in comps {
        node = match node {
            Node::Dir { children, .. } => children.get(*comp)?,
            Node::File { .. } => return None,
        };
    }
    Some(node)
}

fn lookup_mut<'a>(root: &'a mut Node, comps: &[String]) -> Result<&'a mut Node> {
    let mut node = root;
    for comp in comps {
        node = match node {
            Node::Dir { children, .. } => children
                .get_mut(comp)
                .ok_or(Error::Remote(NtStatus::ObjectNameNotFound))?,
            Node::File { .. } => return Err(Error::Remote(NtStatus::ObjectPathNotFound)),
        };
    }
    Ok(node)
}

/// Children of the parent directory of `comps`, plus the final name
fn parent_children<'a>(
    root: &'a mut Node,
    comps: &'a [String],
) -> Result<(&'a mut BTreeMap<String, Node>, &'a str)> {
    let (name, dirs) = comps
        .split_last()
        .ok_or(Error::Remote(NtStatus::AccessDenied))?;
    match lookup_mut(root, dirs).map_err(|_| Error::Remote(NtStatus::ObjectPathNotFound))? {
        Node::Dir { children, .. } => Ok((children, name.as_str())),
        Node::File { .. } => Err(Error::Remote(NtStatus::ObjectPathNotFound)),
    }
}

fn split_path(path: &str) -> Vec<String> {
    smb_components(path).map(str::to_string).collect()
}

#[async_trait]
impl SmbConnector for MemoryNetwork {
    async fn resolve_host(&self, name: &str) -> Result<IpAddr> {
        self.delay().await;
        let mut state = self.state();
        state.stats.resolves += 1;
        if let Ok(addr) = name.parse::<IpAddr>() {
            return Ok(addr);
        }
        let wanted = NetBiosName::parse(name).name;
        state
            .servers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(&wanted))
            .map(|(_, s)| s.addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))
    }

    async fn find_master_browser(&self, workgroup: &str) -> Result<IpAddr> {
        self.delay().await;
        let mut state = self.state();
        state.stats.master_lookups += 1;
        let master = state
            .masters
            .get(workgroup)
            .ok_or(Error::Remote(NtStatus::BadNetworkPath))?;
        state
            .servers
            .get(master)
            .map(|s| s.addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))
    }

    async fn connect(
        &self,
        addr: IpAddr,
        called_name: &str,
        client: &ClientIdentity,
    ) -> Result<Box<dyn SmbConnection>> {
        self.delay().await;
        let mut state = self.state();
        state.stats.connects += 1;
        let server = state
            .server_by_addr(addr)
            .ok_or(Error::Remote(NtStatus::HostUnreachable))?
            .to_string();
        let srv = &state.servers[&server];
        let own_name = srv.accepts_own_name && called_name.eq_ignore_ascii_case(&server);
        if !own_name && called_name != WILDCARD_SERVER_NAME {
            state.stats.rejected_session_requests += 1;
            return Err(Error::Remote(NtStatus::BadNetworkName));
        }
        debug!(
            "Memory connection from {} to {} as {}",
            client.workstation, server, called_name
        );
        Ok(Box::new(MemoryConnection {
            net: self.clone(),
            server,
            share: None,
            authenticated: false,
            negotiated: false,
        }))
    }
}

/// One connection into a [`MemoryNetwork`]
#[derive(Debug)]
pub struct MemoryConnection {
    net: MemoryNetwork,
    server: String,
    share: Option<String>,
    negotiated: bool,
    authenticated: bool,
}

impl MemoryConnection {
    fn share_name(&self) -> Result<&str> {
        self.share
            .as_deref()
            .ok_or(Error::Remote(NtStatus::NetworkNameDeleted))
    }

    fn with_share<T>(&self, f: impl FnOnce(&mut Share) -> Result<T>) -> Result<T> {
        let share = self.share_name()?;
        let mut state = self.net.state();
        f(state.share_mut(&self.server, share)?)
    }
}

#[async_trait]
impl SmbConnection for MemoryConnection {
    async fn negotiate(&mut self) -> Result<()> {
        self.net.delay().await;
        self.negotiated = true;
        Ok(())
    }

    async fn session_setup(&mut self, credentials: &Credentials) -> Result<()> {
        self.net.delay().await;
        if !self.negotiated {
            return Err(Error::Remote(NtStatus::InvalidParameter));
        }
        let mut state = self.net.state();
        state.stats.session_setups += 1;
        let srv = state
            .servers
            .get(&self.server)
            .ok_or(Error::Remote(NtStatus::NetworkNameDeleted))?;
        let accepted = if credentials.is_anonymous() {
            srv.allow_anonymous
        } else {
            srv.users.get(&credentials.username) == Some(&credentials.password)
        };
        if !accepted {
            return Err(Error::Remote(NtStatus::LogonFailure));
        }
        if credentials.is_anonymous() {
            state.stats.anonymous_logins += 1;
        }
        self.authenticated = true;
        Ok(())
    }

    async fn tree_connect(&mut self, share: &str) -> Result<ShareType> {
        self.net.delay().await;
        if !self.authenticated {
            return Err(Error::Remote(NtStatus::AccessDenied));
        }
        let mut state = self.net.state();
        state.stats.tree_connects += 1;
        let share_type = if share == IPC_SHARE {
            ShareType::Ipc
        } else {
            state.share_mut(&self.server, share)?.share_type
        };
        self.share = Some(share.to_string());
        Ok(share_type)
    }

    async fn open(&mut self, path: &str, flags: OpenFlags, _mode: u32) -> Result<RemoteFid> {
        self.net.delay().await;
        let comps = split_path(path);
        let share = self.share_name()?.to_string();
        let mut state = self.net.state();
        let target = {
            let sh = state.share_mut(&self.server, &share)?;
            if sh.share_type == ShareType::Printer {
                let name = comps.last().cloned().unwrap_or_else(|| "job".to_string());
                let id = sh.jobs.iter().map(|j| j.id).max().unwrap_or(0) + 1;
                sh.jobs.push(PrintJob {
                    id,
                    name,
                    size: 0,
                    submitted: Utc::now(),
                });
                OpenTarget::Job(id)
            } else {
                let (children, name) = parent_children(&mut sh.root, &comps)?;
                match children.get_mut(name) {
                    Some(Node::Dir { .. }) => {
                        return Err(Error::Remote(NtStatus::FileIsADirectory));
                    }
                    Some(Node::File { data, meta }) => {
                        if flags.contains(OpenFlags::CREAT | OpenFlags::EXCL) {
                            return Err(Error::Remote(NtStatus::ObjectNameCollision));
                        }
                        if flags.writable() && meta.attributes.contains(FileAttributes::READONLY)
                        {
                            return Err(Error::Remote(NtStatus::AccessDenied));
                        }
                        if flags.contains(OpenFlags::TRUNC) && flags.writable() {
                            data.clear();
                            meta.write_time = Utc::now();
                        }
                    }
                    None if flags.contains(OpenFlags::CREAT) => {
                        children.insert(
                            name.to_string(),
                            Node::File {
                                data: Vec::new(),
                                meta: Meta::now(FileAttributes::ARCHIVE),
                            },
                        );
                    }
                    None => return Err(Error::Remote(NtStatus::ObjectNameNotFound)),
                }
                OpenTarget::File(comps)
            }
        };
        state.next_fid += 1;
        let fid = state.next_fid;
        state.open.insert(
            fid,
            OpenFid {
                server: self.server.clone(),
                share,
                target,
            },
        );
        Ok(RemoteFid(fid))
    }

    async fn read(&mut self, fid: RemoteFid, offset: u64, len: usize) -> Result<Bytes> {
        self.net.delay().await;
        let mut state = self.net.state();
        let open = state
            .open
            .get(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
        let (server, share) = (open.server.clone(), open.share.clone());
        let comps = match &open.target {
            OpenTarget::File(comps) => comps.clone(),
            OpenTarget::Job(_) => return Err(Error::Remote(NtStatus::AccessDenied)),
        };
        let sh = state.share_mut(&server, &share)?;
        match lookup_mut(&mut sh.root, &comps)? {
            Node::File { data, meta } => {
                meta.access_time = Utc::now();
                let start = (offset as usize).min(data.len());
                let end = start.saturating_add(len).min(data.len());
                Ok(Bytes::copy_from_slice(&data[start..end]))
            }
            Node::Dir { .. } => Err(Error::Remote(NtStatus::FileIsADirectory)),
        }
    }

    async fn write(&mut self, fid: RemoteFid, offset: u64, buf: &[u8]) -> Result<usize> {
        self.net.delay().await;
        let mut state = self.net.state();
        let open = state
            .open
            .get(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
        let (server, share) = (open.server.clone(), open.share.clone());
        match &open.target {
            OpenTarget::Job(id) => {
                let id = *id;
                let sh = state.share_mut(&server, &share)?;
                if let Some(job) = sh.jobs.iter_mut().find(|j| j.id == id) {
                    job.size += buf.len() as u64;
                }
                Ok(buf.len())
            }
            OpenTarget::File(comps) => {
                let comps = comps.clone();
                let sh = state.share_mut(&server, &share)?;
                match lookup_mut(&mut sh.root, &comps)? {
                    Node::File { data, meta } => {
                        let start = offset as usize;
                        let end = start + buf.len();
                        if data.len() < end {
                            data.resize(end, 0);
                        }
                        data[start..end].copy_from_slice(buf);
                        meta.write_time = Utc::now();
                        Ok(buf.len())
                    }
                    Node::Dir { .. } => Err(Error::Remote(NtStatus::FileIsADirectory)),
                }
            }
        }
    }

    async fn close(&mut self, fid: RemoteFid) -> Result<()> {
        self.net.delay().await;
        self.net
            .state()
            .open
            .remove(&fid.0)
            .map(|_| ())
            .ok_or(Error::Remote(NtStatus::InvalidHandle))
    }

    async fn file_info(&mut self, fid: RemoteFid) -> Result<FileInfo> {
        self.net.delay().await;
        let mut state = self.net.state();
        let open = state
            .open
            .get(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
        let (server, share) = (open.server.clone(), open.share.clone());
        match &open.target {
            OpenTarget::File(comps) => {
                let comps = comps.clone();
                let sh = state.share_mut(&server, &share)?;
                let node = lookup_mut(&mut sh.root, &comps)?;
                Ok(node.info(comps.last().map(String::as_str).unwrap_or("")))
            }
            OpenTarget::Job(id) => {
                let id = *id;
                let sh = state.share_mut(&server, &share)?;
                let job = sh
                    .jobs
                    .iter()
                    .find(|j| j.id == id)
                    .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
                Ok(job_info(job))
            }
        }
    }

    async fn set_file_size(&mut self, fid: RemoteFid, size: u64) -> Result<()> {
        self.net.delay().await;
        let mut state = self.net.state();
        let open = state
            .open
            .get(&fid.0)
            .ok_or(Error::Remote(NtStatus::InvalidHandle))?;
        let (server, share) = (open.server.clone(), open.share.clone());
        let comps = match &open.target {
            OpenTarget::File(comps) => comps.clone(),
            OpenTarget::Job(_) => return Err(Error::Remote(NtStatus::NotSupported)),
        };
        let sh = state.share_mut(&server, &share)?;
        match lookup_mut(&mut sh.root, &comps)? {
            Node::File { data, meta } => {
                data.resize(size as usize, 0);
                meta.write_time = Utc::now();
                Ok(())
            }
            Node::Dir { .. } => Err(Error::Remote(NtStatus::FileIsADirectory)),
        }
    }

    async fn path_info(&mut self, path: &str) -> Result<FileInfo> {
        self.net.delay().await;
        let comps = split_path(path);
        self.with_share(|sh| {
            if sh.share_type == ShareType::Printer && !comps.is_empty() {
                return sh
                    .jobs
                    .iter()
                    .find(|j| j.name == comps[comps.len() - 1])
                    .map(job_info)
                    .ok_or(Error::Remote(NtStatus::ObjectNameNotFound));
            }
            let node = lookup_mut(&mut sh.root, &comps)?;
            Ok(node.info(comps.last().map(String::as_str).unwrap_or("")))
        })
    }

    async fn set_path_info(&mut self, path: &str, info: &SetInfo) -> Result<()> {
        self.net.delay().await;
        let comps = split_path(path);
        self.with_share(|sh| {
            let node = lookup_mut(&mut sh.root, &comps)?;
            let is_dir = matches!(node, Node::Dir { .. });
            let meta = node.meta_mut();
            if let Some(mut attributes) = info.attributes {
                attributes.remove(FileAttributes::DIRECTORY);
                if is_dir {
                    attributes |= FileAttributes::DIRECTORY;
                }
                meta.attributes = attributes;
            }
            if let Some(t) = info.access_time {
                meta.access_time = t;
            }
            if let Some(t) = info.write_time {
                meta.write_time = t;
            }
            meta.change_time = Utc::now();
            Ok(())
        })
    }

    async fn list(&mut self, pattern: &str) -> Result<Vec<FileInfo>> {
        self.net.delay().await;
        let comps = split_path(pattern_dir(pattern));
        self.with_share(|sh| match lookup_mut(&mut sh.root, &comps)? {
            Node::Dir { children, .. } => Ok(children
                .iter()
                .map(|(name, node)| node.info(name))
                .collect()),
            Node::File { .. } => Err(Error::Remote(NtStatus::NotADirectory)),
        })
    }

    async fn list_shares(&mut self) -> Result<Vec<ShareInfo>> {
        self.net.delay().await;
        let state = self.net.state();
        let srv = state
            .servers
            .get(&self.server)
            .ok_or(Error::Remote(NtStatus::NetworkNameDeleted))?;
        let mut shares = vec![ShareInfo {
            name: IPC_SHARE.to_string(),
            share_type: ShareType::Ipc,
            comment: "IPC Service".to_string(),
        }];
        shares.extend(srv.shares.iter().map(|(name, s)| ShareInfo {
            name: name.clone(),
            share_type: s.share_type,
            comment: s.comment.clone(),
        }));
        Ok(shares)
    }

    async fn list_servers(
        &mut self,
        workgroup: &str,
        kind: ServerKind,
    ) -> Result<Vec<ServerInfo>> {
        self.net.delay().await;
        let state = self.net.state();
        let names: Vec<String> = match kind {
            ServerKind::Domains => state.masters.keys().cloned().collect(),
            ServerKind::Servers => state
                .servers
                .iter()
                .filter(|(_, s)| s.workgroup == workgroup)
                .map(|(name, _)| name.clone())
                .collect(),
        };
        let mut servers: Vec<ServerInfo> = names
            .into_iter()
            .map(|name| ServerInfo {
                name,
                comment: String::new(),
            })
            .collect();
        servers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(servers)
    }

    async fn list_print_jobs(&mut self) -> Result<Vec<PrintJob>> {
        self.net.delay().await;
        self.with_share(|sh| Ok(sh.jobs.clone()))
    }

    async fn cancel_print_job(&mut self, id: u32) -> Result<()> {
        self.net.delay().await;
        self.with_share(|sh| {
            let before = sh.jobs.len();
            sh.jobs.retain(|j| j.id != id);
            if sh.jobs.len() == before {
                Err(Error::Remote(NtStatus::NoSuchFile))
            } else {
                Ok(())
            }
        })
    }

    async fn mkdir(&mut self, path: &str) -> Result<()> {
        self.net.delay().await;
        let comps = split_path(path);
        self.with_share(|sh| {
            let (children, name) = parent_children(&mut sh.root, &comps)?;
            if children.contains_key(name) {
                return Err(Error::Remote(NtStatus::ObjectNameCollision));
            }
            children.insert(name.to_string(), Node::empty_dir());
            Ok(())
        })
    }

    async fn rmdir(&mut self, path: &str) -> Result<()> {
        self.net.delay().await;
        let comps = split_path(path);
        self.with_share(|sh| {
            let (children, name) = parent_children(&mut sh.root, &comps)?;
            match children.get(name) {
                Some(Node::Dir { children: inner, .. }) if !inner.is_empty() => {
                    Err(Error::Remote(NtStatus::DirectoryNotEmpty))
                }
                Some(Node::Dir { .. }) => {
                    children.remove(name);
                    Ok(())
                }
                Some(Node::File { .. }) => Err(Error::Remote(NtStatus::NotADirectory)),
                None => Err(Error::Remote(NtStatus::ObjectNameNotFound)),
            }
        })
    }

    async fn unlink(&mut self, path: &str) -> Result<()> {
        self.net.delay().await;
        let comps = split_path(path);
        self.with_share(|sh| {
            let (children, name) = parent_children(&mut sh.root, &comps)?;
            match children.get(name) {
                Some(Node::File { meta, .. })
                    if meta.attributes.contains(FileAttributes::READONLY) =>
                {
                    Err(Error::Remote(NtStatus::CannotDelete))
                }
                Some(Node::File { .. }) => {
                    children.remove(name);
                    Ok(())
                }
                Some(Node::Dir { .. }) => Err(Error::Remote(NtStatus::FileIsADirectory)),
                None => Err(Error::Remote(NtStatus::ObjectNameNotFound)),
            }
        })
    }

    async fn rename(&mut self, from: &str, to: &str) -> Result<()> {
        self.net.delay().await;
        let from = split_path(from);
        let to = split_path(to);
        self.with_share(|sh| {
            {
                let (children, name) = parent_children(&mut sh.root, &from)?;
                if !children.contains_key(name) {
                    return Err(Error::Remote(NtStatus::ObjectNameNotFound));
                }
            }
            {
                let (children, name) = parent_children(&mut sh.root, &to)?;
                if children.contains_key(name) {
                    return Err(Error::Remote(NtStatus::ObjectNameCollision));
                }
            }
            let node = {
                let (children, name) = parent_children(&mut sh.root, &from)?;
                children
                    .remove(name)
                    .ok_or(Error::Remote(NtStatus::ObjectNameNotFound))?
            };
            let (children, name) = parent_children(&mut sh.root, &to)?;
            children.insert(name.to_string(), node);
            Ok(())
        })
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.net.state().stats.shutdowns += 1;
        self.share = None;
        self.authenticated = false;
        Ok(())
    }
}

fn job_info(job: &PrintJob) -> FileInfo {
    FileInfo {
        name: job.name.clone(),
        size: job.size,
        attributes: FileAttributes::NORMAL,
        access_time: job.submitted,
        write_time: job.submitted,
        change_time: job.submitted,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network() -> MemoryNetwork {
        let net = MemoryNetwork::new();
        net.add_server("WG", "HOST", "10.0.0.2".parse().unwrap());
        net.add_user("HOST", "alice", "pw").unwrap();
        net.add_share("HOST", "docs", ShareType::Disk).unwrap();
        net.put_file("HOST", "docs", "dir/a.txt", b"hello").unwrap();
        net
    }

    async fn session(net: &MemoryNetwork) -> Box<dyn SmbConnection> {
        let addr = net.resolve_host("HOST").await.unwrap();
        let mut conn = net
            .connect(addr, "HOST", &ClientIdentity::default())
            .await
            .unwrap();
        conn.negotiate().await.unwrap();
        conn.session_setup(&Credentials::new("alice", "pw", "WG"))
            .await
            .unwrap();
        conn.tree_connect("docs").await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_read_existing_file() {
        let net = network();
        let mut conn = session(&net).await;
        let fid = conn
            .open("\\dir\\a.txt", OpenFlags::RDONLY, 0)
            .await
            .unwrap();
        let data = conn.read(fid, 1, 3).await.unwrap();
        assert_eq!(&data[..], b"ell");
        conn.close(fid).await.unwrap();
        assert_eq!(net.stats().open_files, 0);
    }

    #[tokio::test]
    async fn test_bad_password_rejected() {
        let net = network();
        let addr = net.resolve_host("HOST").await.unwrap();
        let mut conn = net
            .connect(addr, "HOST", &ClientIdentity::default())
            .await
            .unwrap();
        conn.negotiate().await.unwrap();
        let err = conn
            .session_setup(&Credentials::new("alice", "wrong", "WG"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Remote(NtStatus::LogonFailure)));
    }

    #[tokio::test]
    async fn test_rejects_unknown_called_name() {
        let net = network();
        net.set_rejects_own_name("HOST").unwrap();
        let addr = net.resolve_host("HOST").await.unwrap();
        let client = ClientIdentity::default();
        assert!(net.connect(addr, "HOST", &client).await.is_err());
        assert!(net.connect(addr, WILDCARD_SERVER_NAME, &client).await.is_ok());
    }

    #[tokio::test]
    async fn test_rename_refuses_existing_target() {
        let net = network();
        net.put_file("HOST", "docs", "b.txt", b"b").unwrap();
        let mut conn = session(&net).await;
        let err = conn.rename("\\dir\\a.txt", "\\b.txt").await.unwrap_err();
        assert!(matches!(err, Error::Remote(NtStatus::ObjectNameCollision)));
        conn.rename("\\dir\\a.txt", "\\c.txt").await.unwrap();
        assert_eq!(net.file_contents("HOST", "docs", "c.txt").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_list_and_rmdir() {
        let net = network();
        let mut conn = session(&net).await;
        let entries = conn.list("\\*").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_directory());
        let err = conn.rmdir("\\dir").await.unwrap_err();
        assert!(matches!(err, Error::Remote(NtStatus::DirectoryNotEmpty)));
    }
}
