//! Pool of authenticated SMB sessions
//!
//! A session is identified by `(server, share, workgroup, username)`. The
//! registry owns every live connection; open handles refer to sessions by
//! [`SessionId`] and bump the session's user count while they live.

use crate::config::ClientIdentity;
use crate::credentials::{CredentialProvider, Credentials};
use crate::error::{ConnectFailure, Error, NtStatus, Result};
use crate::executor::Executor;
use crate::netbios::{NetBiosName, NetBiosNameType, WILDCARD_SERVER_NAME};
use crate::remote::{ShareType, SmbConnection, SmbConnector};
use crate::stat::device_for;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Stable identifier of a pooled session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub(crate) u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// What to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    /// Server token, possibly carrying a NetBIOS suffix (`WG#1D`)
    pub server: String,
    pub share: String,
    /// Workgroup named by the path being accessed
    pub workgroup: String,
}

impl ConnectTarget {
    pub fn new(server: &str, share: &str, workgroup: &str) -> Self {
        Self {
            server: server.to_string(),
            share: share.to_string(),
            workgroup: workgroup.to_string(),
        }
    }
}

/// Pool key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub server: String,
    pub share: String,
    pub workgroup: String,
    pub username: String,
}

/// One authenticated, tree-connected session
pub struct Session {
    id: SessionId,
    key: SessionKey,
    conn: Box<dyn SmbConnection>,
    share_type: ShareType,
    dev: u64,
    users: usize,
    broken: bool,
    last_used: Instant,
}

impl Session {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn share_type(&self) -> ShareType {
        self.share_type
    }

    /// Device number reported by stat for files of this share
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Number of live handles using this session
    pub fn users(&self) -> usize {
        self.users
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("share_type", &self.share_type)
            .field("users", &self.users)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

/// Owns every pooled session plus the name-resolution caches
#[derive(Debug)]
pub struct ConnectionRegistry {
    client: ClientIdentity,
    idle_timeout: Option<Duration>,
    sessions: HashMap<SessionId, Session>,
    by_key: HashMap<SessionKey, SessionId>,
    hosts: HashMap<String, IpAddr>,
    master_browsers: HashMap<NetBiosName, IpAddr>,
    next_id: u64,
}

impl ConnectionRegistry {
    pub fn new(client: ClientIdentity, idle_timeout: Option<Duration>) -> Self {
        Self {
            client,
            idle_timeout,
            sessions: HashMap::new(),
            by_key: HashMap::new(),
            hosts: HashMap::new(),
            master_browsers: HashMap::new(),
            next_id: 0,
        }
    }

    /// Number of pooled sessions
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn sessions(&self) -> impl Iterator<Item = &Session> + '_ {
        self.sessions.values()
    }

    pub fn session(&self, id: SessionId) -> Result<&Session> {
        self.sessions
            .get(&id)
            .ok_or_else(|| Error::InternalConsistency(format!("unknown {}", id)))
    }

    /// The connection behind a session, for issuing a remote call
    pub fn connection(&mut self, id: SessionId) -> Result<&mut (dyn SmbConnection + 'static)> {
        let session = self
            .sessions
            .get_mut(&id)
            .ok_or_else(|| Error::InternalConsistency(format!("unknown {}", id)))?;
        session.last_used = Instant::now();
        Ok(session.conn.as_mut())
    }

    /// Record the outcome of a remote call made on `id`
    pub fn observe<T>(&mut self, id: SessionId, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.breaks_session() {
                if let Some(session) = self.sessions.get_mut(&id) {
                    warn!(
                        "Marking {} to \\\\{}\\{} broken: {}",
                        id, session.key.server, session.key.share, e
                    );
                    session.broken = true;
                }
            }
        }
        result
    }

    /// A handle started using `id`
    pub fn retain(&mut self, id: SessionId) {
        if let Some(session) = self.sessions.get_mut(&id) {
            session.users += 1;
        }
    }

    /// A handle stopped using `id`
    pub fn release(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };
        session.users = session.users.saturating_sub(1);
        if session.users == 0 && session.broken && self.by_key.get(&session.key) != Some(&id) {
            debug!("Dropping replaced {}", id);
            self.sessions.remove(&id);
        }
    }

    /// Find or establish the session for `target`
    pub fn acquire(
        &mut self,
        exec: &Executor,
        connector: &dyn SmbConnector,
        credentials: &dyn CredentialProvider,
        target: &ConnectTarget,
    ) -> Result<SessionId> {
        if target.server.is_empty() {
            return Err(Error::Connection {
                server: String::new(),
                reason: ConnectFailure::NoServer,
            });
        }

        self.evict_idle(exec);

        let creds = credentials.credentials(&target.server, &target.share, &target.workgroup);
        let key = SessionKey {
            server: target.server.clone(),
            share: target.share.clone(),
            workgroup: target.workgroup.clone(),
            username: creds.username.clone(),
        };

        if let Some(&id) = self.by_key.get(&key) {
            let broken = self.sessions.get(&id).map(|s| s.broken).unwrap_or(true);
            if !broken {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.last_used = Instant::now();
                }
                return Ok(id);
            }
            self.retire(id);
        }

        let (conn, share_type) = self.establish(exec, connector, target, &creds)?;

        self.next_id += 1;
        let id = SessionId(self.next_id);
        info!(
            "Connected {} to \\\\{}\\{} as {:?}",
            id, target.server, target.share, creds
        );
        let dev = device_for(&target.server, &target.share);
        self.by_key.insert(key.clone(), id);
        self.sessions.insert(
            id,
            Session {
                id,
                key,
                conn,
                share_type,
                dev,
                users: 0,
                broken: false,
                last_used: Instant::now(),
            },
        );
        Ok(id)
    }

    fn establish(
        &mut self,
        exec: &Executor,
        connector: &dyn SmbConnector,
        target: &ConnectTarget,
        creds: &Credentials,
    ) -> Result<(Box<dyn SmbConnection>, ShareType)> {
        let server = target.server.as_str();
        let fail = |reason: ConnectFailure| Error::Connection {
            server: server.to_string(),
            reason,
        };

        let name = NetBiosName::parse(server);
        let addr = self.locate(exec, connector, &name).map_err(|e| match e {
            Error::Timeout => Error::Timeout,
            _ if name.is_browser() => fail(ConnectFailure::NoMasterBrowser),
            _ => fail(ConnectFailure::Unresolvable),
        })?;

        let mut conn = match exec.run(connector.connect(addr, &name.name, &self.client)) {
            Ok(conn) => conn,
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) => {
                debug!(
                    "Session request to {} as {} rejected ({}), retrying as {}",
                    addr, name.name, e, WILDCARD_SERVER_NAME
                );
                match exec.run(connector.connect(addr, WILDCARD_SERVER_NAME, &self.client)) {
                    Ok(conn) => conn,
                    Err(Error::Timeout) => return Err(Error::Timeout),
                    Err(e) => {
                        warn!("Session request to {} rejected: {}", server, e);
                        self.forget_address(&name);
                        return Err(fail(ConnectFailure::SessionRejected));
                    }
                }
            }
        };

        let result = Self::authenticate(exec, conn.as_mut(), target, creds);
        match result {
            Ok(share_type) => Ok((conn, share_type)),
            Err(e) => {
                if let Err(shutdown) = exec.run(conn.shutdown()) {
                    debug!("Shutdown after failed connect to {}: {}", server, shutdown);
                }
                Err(match e {
                    Error::Timeout => Error::Timeout,
                    Error::Connection { reason, .. } => fail(reason),
                    other => other,
                })
            }
        }
    }

    fn authenticate(
        exec: &Executor,
        conn: &mut dyn SmbConnection,
        target: &ConnectTarget,
        creds: &Credentials,
    ) -> Result<ShareType> {
        let fail = |reason: ConnectFailure| Error::Connection {
            server: target.server.clone(),
            reason,
        };

        exec.run(conn.negotiate()).map_err(|e| match e {
            Error::Timeout => Error::Timeout,
            _ => fail(ConnectFailure::Negotiation),
        })?;

        match exec.run(conn.session_setup(creds)) {
            Ok(()) => {}
            Err(Error::Timeout) => return Err(Error::Timeout),
            Err(e) if !creds.is_anonymous() => {
                debug!(
                    "Session setup as {} failed ({}), retrying anonymously",
                    creds.username, e
                );
                let anonymous = Credentials::anonymous(&creds.workgroup);
                exec.run(conn.session_setup(&anonymous)).map_err(|e| match e {
                    Error::Timeout => Error::Timeout,
                    _ => fail(ConnectFailure::AuthenticationRejected),
                })?;
            }
            Err(_) => return Err(fail(ConnectFailure::AuthenticationRejected)),
        }

        exec.run(conn.tree_connect(&target.share)).map_err(|e| match e {
            Error::Timeout => Error::Timeout,
            Error::Remote(status) => fail(ConnectFailure::TreeConnect(status)),
            _ => fail(ConnectFailure::TreeConnect(NtStatus::BadNetworkName)),
        })
    }

    /// Resolve a server token to an address, through the caches
    fn locate(
        &mut self,
        exec: &Executor,
        connector: &dyn SmbConnector,
        name: &NetBiosName,
    ) -> Result<IpAddr> {
        if name.is_browser() {
            if let Some(&addr) = self.master_browsers.get(name) {
                return Ok(addr);
            }
            let addr = match name.name_type {
                Some(NetBiosNameType::BrowseMaster) => {
                    // Any master browser can enumerate the workgroup list
                    exec.run(connector.find_master_browser(&name.name))
                        .or_else(|_| exec.run(connector.resolve_host(&name.to_string())))?
                }
                _ => exec.run(connector.find_master_browser(&name.name))?,
            };
            debug!("Master browser for {} is {}", name, addr);
            self.master_browsers.insert(name.clone(), addr);
            return Ok(addr);
        }

        let host = name.name.to_ascii_lowercase();
        if let Some(&addr) = self.hosts.get(&host) {
            return Ok(addr);
        }
        let addr = exec.run(connector.resolve_host(&name.name))?;
        debug!("Resolved {} to {}", name.name, addr);
        self.hosts.insert(host, addr);
        Ok(addr)
    }

    fn forget_address(&mut self, name: &NetBiosName) {
        if name.is_browser() {
            self.master_browsers.remove(name);
        } else {
            self.hosts.remove(&name.name.to_ascii_lowercase());
        }
    }

    /// Take a broken session out of the pool; it lingers until its last
    /// handle is released
    fn retire(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get(&id) else {
            return;
        };
        debug!("Retiring {} ({:?})", id, session.key);
        if self.by_key.get(&session.key) == Some(&id) {
            self.by_key.remove(&session.key);
        }
        if session.users == 0 {
            self.sessions.remove(&id);
        }
    }

    /// Tear down sessions without users that have been idle too long
    pub fn evict_idle(&mut self, exec: &Executor) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let now = Instant::now();
        let idle: Vec<SessionId> = self
            .sessions
            .values()
            .filter(|s| s.users == 0 && now.duration_since(s.last_used) >= timeout)
            .map(|s| s.id)
            .collect();
        for id in idle {
            if let Some(mut session) = self.sessions.remove(&id) {
                info!(
                    "Evicting idle {} to \\\\{}\\{}",
                    id, session.key.server, session.key.share
                );
                self.by_key.remove(&session.key);
                if let Err(e) = exec.run(session.conn.shutdown()) {
                    debug!("Shutdown of {} failed: {}", id, e);
                }
            }
        }
    }

    /// Orderly teardown of every session
    pub fn shutdown_all(&mut self, exec: &Executor) {
        self.by_key.clear();
        for (id, mut session) in self.sessions.drain() {
            if session.users > 0 {
                warn!("Shutting down {} with {} live handles", id, session.users);
            }
            if let Err(e) = exec.run(session.conn.shutdown()) {
                debug!("Shutdown of {} failed: {}", id, e);
            }
        }
    }

    /// Forget every session without any network traffic (forked child)
    pub fn abandon_all(&mut self) {
        self.by_key.clear();
        for (_, session) in self.sessions.drain() {
            session.conn.abandon();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use crate::remote::MemoryNetwork;

    fn network() -> MemoryNetwork {
        let net = MemoryNetwork::new();
        net.add_server("WG", "HOST", "10.0.0.2".parse().unwrap());
        net.add_user("HOST", "alice", "pw").unwrap();
        net.add_share("HOST", "docs", ShareType::Disk).unwrap();
        net
    }

    fn fixture() -> (Executor, ConnectionRegistry) {
        (
            Executor::new(Duration::from_secs(5)).unwrap(),
            ConnectionRegistry::new(ClientIdentity::default(), None),
        )
    }

    #[test]
    fn test_sessions_are_reused() {
        let net = network();
        let (exec, mut reg) = fixture();
        let creds = StaticCredentials::new("alice", "pw");
        let target = ConnectTarget::new("HOST", "docs", "WG");
        let a = reg.acquire(&exec, &net, &creds, &target).unwrap();
        let b = reg.acquire(&exec, &net, &creds, &target).unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.len(), 1);
        let stats = net.stats();
        assert_eq!(stats.connects, 1);
        assert_eq!(stats.resolves, 1);
        assert_eq!(reg.session(a).unwrap().share_type(), ShareType::Disk);
    }

    #[test]
    fn test_different_user_gets_own_session() {
        let net = network();
        net.add_user("HOST", "bob", "pw").unwrap();
        let (exec, mut reg) = fixture();
        let target = ConnectTarget::new("HOST", "docs", "WG");
        let a = reg
            .acquire(&exec, &net, &StaticCredentials::new("alice", "pw"), &target)
            .unwrap();
        let b = reg
            .acquire(&exec, &net, &StaticCredentials::new("bob", "pw"), &target)
            .unwrap();
        assert_ne!(a, b);
        // Name resolution is cached across sessions
        assert_eq!(net.stats().resolves, 1);
    }

    #[test]
    fn test_empty_server_is_eperm() {
        let net = network();
        let (exec, mut reg) = fixture();
        let err = reg
            .acquire(
                &exec,
                &net,
                &StaticCredentials::new("alice", "pw"),
                &ConnectTarget::new("", "docs", "WG"),
            )
            .unwrap_err();
        assert_eq!(err.errno(), nix::errno::Errno::EPERM);
    }

    #[test]
    fn test_anonymous_fallback() {
        let net = network();
        let (exec, mut reg) = fixture();
        let creds = StaticCredentials::new("alice", "wrong");
        reg.acquire(&exec, &net, &creds, &ConnectTarget::new("HOST", "docs", "WG"))
            .unwrap();
        let stats = net.stats();
        assert_eq!(stats.session_setups, 2);
        assert_eq!(stats.anonymous_logins, 1);
    }

    #[test]
    fn test_auth_rejected_without_anonymous() {
        let net = network();
        net.set_allow_anonymous("HOST", false).unwrap();
        let (exec, mut reg) = fixture();
        let err = reg
            .acquire(
                &exec,
                &net,
                &StaticCredentials::new("alice", "wrong"),
                &ConnectTarget::new("HOST", "docs", "WG"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection {
                reason: ConnectFailure::AuthenticationRejected,
                ..
            }
        ));
        assert_eq!(err.errno(), nix::errno::Errno::EPERM);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_called_name_retry() {
        let net = network();
        net.set_rejects_own_name("HOST").unwrap();
        let (exec, mut reg) = fixture();
        reg.acquire(
            &exec,
            &net,
            &StaticCredentials::new("alice", "pw"),
            &ConnectTarget::new("HOST", "docs", "WG"),
        )
        .unwrap();
        let stats = net.stats();
        assert_eq!(stats.connects, 2);
        assert_eq!(stats.rejected_session_requests, 1);
    }

    #[test]
    fn test_master_browser_is_cached() {
        let net = network();
        let (exec, mut reg) = fixture();
        let creds = StaticCredentials::new("alice", "pw");
        reg.acquire(&exec, &net, &creds, &ConnectTarget::new("WG#1D", "IPC$", "WG"))
            .unwrap();
        reg.shutdown_all(&exec);
        reg.acquire(&exec, &net, &creds, &ConnectTarget::new("WG#1D", "IPC$", "WG"))
            .unwrap();
        assert_eq!(net.stats().master_lookups, 1);
    }

    #[test]
    fn test_browser_cache_keeps_name_types_apart() {
        let net = network();
        let (exec, mut reg) = fixture();
        let master = NetBiosName::parse("WG#1D");
        let browse = NetBiosName::parse("WG#01");
        reg.locate(&exec, &net, &master).unwrap();
        reg.locate(&exec, &net, &browse).unwrap();
        assert_eq!(net.stats().master_lookups, 2);

        reg.forget_address(&master);
        reg.locate(&exec, &net, &browse).unwrap();
        assert_eq!(net.stats().master_lookups, 2);
        reg.locate(&exec, &net, &master).unwrap();
        assert_eq!(net.stats().master_lookups, 3);
    }

    #[test]
    fn test_unknown_share_maps_tree_connect_status() {
        let net = network();
        let (exec, mut reg) = fixture();
        let err = reg
            .acquire(
                &exec,
                &net,
                &StaticCredentials::new("alice", "pw"),
                &ConnectTarget::new("HOST", "nope", "WG"),
            )
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Connection {
                reason: ConnectFailure::TreeConnect(NtStatus::BadNetworkName),
                ..
            }
        ));
        assert_eq!(err.errno(), nix::errno::Errno::ENOENT);
        assert_eq!(net.stats().shutdowns, 1);
    }

    #[test]
    fn test_broken_session_is_replaced() {
        let net = network();
        let (exec, mut reg) = fixture();
        let creds = StaticCredentials::new("alice", "pw");
        let target = ConnectTarget::new("HOST", "docs", "WG");
        let a = reg.acquire(&exec, &net, &creds, &target).unwrap();
        let _: Result<()> = reg.observe(a, Err(Error::Timeout));
        assert!(reg.session(a).unwrap().is_broken());
        let b = reg.acquire(&exec, &net, &creds, &target).unwrap();
        assert_ne!(a, b);
        assert!(reg.session(a).is_err());
    }

    #[test]
    fn test_idle_eviction_spares_used_sessions() {
        let net = network();
        let exec = Executor::new(Duration::from_secs(5)).unwrap();
        let mut reg = ConnectionRegistry::new(ClientIdentity::default(), Some(Duration::ZERO));
        let creds = StaticCredentials::new("alice", "pw");
        let a = reg
            .acquire(&exec, &net, &creds, &ConnectTarget::new("HOST", "docs", "WG"))
            .unwrap();
        reg.retain(a);
        reg.evict_idle(&exec);
        assert_eq!(reg.len(), 1);
        reg.release(a);
        reg.evict_idle(&exec);
        assert!(reg.is_empty());
        assert_eq!(net.stats().shutdowns, 1);
    }

    #[test]
    fn test_abandon_sends_nothing() {
        let net = network();
        let (exec, mut reg) = fixture();
        reg.acquire(
            &exec,
            &net,
            &StaticCredentials::new("alice", "pw"),
            &ConnectTarget::new("HOST", "docs", "WG"),
        )
        .unwrap();
        reg.abandon_all();
        assert!(reg.is_empty());
        assert_eq!(net.stats().shutdowns, 0);
    }
}
