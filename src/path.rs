//! Virtual path resolution
//!
//! Decides whether a path belongs to the SMB namespace and, if it does, splits
//! it into workgroup, server, share and in-share path. Everything here is pure
//! string work; nothing touches the network or the filesystem.
//!
//! Layout below the prefix: `/<workgroup>/<server>/<share>/<path...>`.
//!
//! Inside a path, `#` escapes the following `/` or `#`, so `my#/share` is a
//! single component `my/share` and `a##` is `a#`. A `#` followed by anything
//! else is literal, which keeps NetBIOS suffixes such as `WG#1D` readable.

use crate::netbios::{NetBiosName, NetBiosNameType};

/// Share used for browsing (workgroup, server and share enumeration)
pub const IPC_SHARE: &str = "IPC$";

/// A path inside the virtual SMB namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VirtualPath {
    /// The namespace root; lists the workgroups on the network
    Root,
    /// A workgroup; lists its servers
    Workgroup { workgroup: String },
    /// A server; lists its shares
    ServerShares { workgroup: String, server: String },
    /// A file or directory inside a share (`path` is `/`-separated, empty for the share root)
    InShare {
        workgroup: String,
        server: String,
        share: String,
        path: String,
    },
}

impl VirtualPath {
    /// Build a virtual path from already-normalized components below the prefix
    fn from_components(mut comps: Vec<String>, default_workgroup: &str) -> Self {
        match comps.len() {
            0 => VirtualPath::Root,
            1 => {
                let token = comps.remove(0);
                let parsed = NetBiosName::parse(&token);
                if parsed.name_type == Some(NetBiosNameType::FileServer) {
                    VirtualPath::ServerShares {
                        workgroup: default_workgroup.to_string(),
                        server: token,
                    }
                } else {
                    VirtualPath::Workgroup { workgroup: token }
                }
            }
            2 => {
                let server = comps.remove(1);
                let workgroup = comps.remove(0);
                VirtualPath::ServerShares { workgroup, server }
            }
            _ => {
                let path = comps[3..].join("/");
                let mut head = comps.into_iter();
                let workgroup = head.next().unwrap_or_default();
                let server = head.next().unwrap_or_default();
                let share = head.next().unwrap_or_default();
                VirtualPath::InShare {
                    workgroup,
                    server,
                    share: if share.is_empty() {
                        IPC_SHARE.to_string()
                    } else {
                        share
                    },
                    path,
                }
            }
        }
    }

    /// Components below the prefix, unescaped
    pub fn components(&self) -> Vec<String> {
        match self {
            VirtualPath::Root => Vec::new(),
            VirtualPath::Workgroup { workgroup } => vec![workgroup.clone()],
            VirtualPath::ServerShares { workgroup, server } => {
                vec![workgroup.clone(), server.clone()]
            }
            VirtualPath::InShare {
                workgroup,
                server,
                share,
                path,
            } => {
                let mut comps = vec![workgroup.clone(), server.clone(), share.clone()];
                comps.extend(
                    path.split('/')
                        .filter(|c| !c.is_empty())
                        .map(str::to_string),
                );
                comps
            }
        }
    }

    /// The entry `name` inside this directory
    pub fn child(&self, name: &str, default_workgroup: &str) -> Self {
        let mut comps = self.components();
        comps.push(name.to_string());
        Self::from_components(comps, default_workgroup)
    }

    /// The directory containing this path (the root is its own parent)
    pub fn parent(&self, default_workgroup: &str) -> Self {
        let mut comps = self.components();
        comps.pop();
        Self::from_components(comps, default_workgroup)
    }

    /// Whether this path is a browsing level rather than share content
    pub fn is_browse(&self) -> bool {
        !matches!(self, VirtualPath::InShare { .. })
    }

    /// Whether this is the root directory of a share
    pub fn is_share_root(&self) -> bool {
        matches!(self, VirtualPath::InShare { path, .. } if path.is_empty())
    }

    /// The workgroup the path belongs to, if it names one
    pub fn workgroup(&self) -> Option<&str> {
        match self {
            VirtualPath::Root => None,
            VirtualPath::Workgroup { workgroup }
            | VirtualPath::ServerShares { workgroup, .. }
            | VirtualPath::InShare { workgroup, .. } => Some(workgroup),
        }
    }

    /// The `(server token, share)` pair a session must be opened against
    pub fn connect_target(&self, default_workgroup: &str) -> (String, String) {
        match self {
            VirtualPath::Root => (
                NetBiosName::browse_master(default_workgroup).to_string(),
                IPC_SHARE.to_string(),
            ),
            VirtualPath::Workgroup { workgroup } => (
                NetBiosName::master_browser(workgroup).to_string(),
                IPC_SHARE.to_string(),
            ),
            VirtualPath::ServerShares { server, .. } => (server.clone(), IPC_SHARE.to_string()),
            VirtualPath::InShare { server, share, .. } => (server.clone(), share.clone()),
        }
    }

    /// The in-share path in SMB form (`\dir\file`, `\` for the share root)
    pub fn remote_path(&self) -> String {
        match self {
            VirtualPath::InShare { path, .. } if !path.is_empty() => {
                format!("\\{}", path.replace('/', "\\"))
            }
            _ => "\\".to_string(),
        }
    }

    /// Wildcard pattern listing the contents of this directory
    pub fn list_pattern(&self) -> String {
        let base = self.remote_path();
        if base == "\\" {
            "\\*".to_string()
        } else {
            format!("{}\\*", base)
        }
    }

    /// Last component, or an empty string for the root
    pub fn file_name(&self) -> String {
        self.components().pop().unwrap_or_default()
    }
}

/// Classifies raw paths against the namespace prefix
#[derive(Debug, Clone)]
pub struct PathResolver {
    prefix: Vec<String>,
    default_workgroup: String,
}

impl PathResolver {
    /// Create a resolver for `prefix` (e.g. `/smb/`)
    pub fn new(prefix: &str, default_workgroup: &str) -> Self {
        Self {
            prefix: normalize(split_components(prefix)),
            default_workgroup: default_workgroup.to_string(),
        }
    }

    /// Workgroup assumed when a path does not name one
    pub fn default_workgroup(&self) -> &str {
        &self.default_workgroup
    }

    /// Resolve `raw` against `cwd` and normalize it to an absolute escaped path
    pub fn clean(&self, raw: &str, cwd: &str) -> String {
        join_components(&normalize(split_components(&absolute(raw, cwd))))
    }

    /// Classify `raw` (resolved against `cwd`); `None` means the path is not ours
    pub fn classify(&self, raw: &str, cwd: &str) -> Option<VirtualPath> {
        if raw.is_empty() {
            return None;
        }
        let comps = normalize(split_components(&absolute(raw, cwd)));
        if comps.len() < self.prefix.len() || comps[..self.prefix.len()] != self.prefix[..] {
            return None;
        }
        let rest = comps[self.prefix.len()..].to_vec();
        Some(VirtualPath::from_components(rest, &self.default_workgroup))
    }

    /// The canonical escaped string form of `path`
    pub fn canonical(&self, path: &VirtualPath) -> String {
        let mut comps = self.prefix.clone();
        comps.extend(path.components());
        join_components(&comps)
    }
}

/// Lexically resolve a local `raw` path against `cwd`; no escapes apply
pub fn join_local(cwd: &str, raw: &str) -> String {
    let comps = absolute(raw, cwd)
        .split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect();
    format!("/{}", normalize(comps).join("/"))
}

fn absolute(raw: &str, cwd: &str) -> String {
    if raw.starts_with('/') {
        raw.to_string()
    } else {
        format!("{}/{}", cwd, raw)
    }
}

/// Split on unescaped `/`, resolving `#/` and `##` escapes
fn split_components(path: &str) -> Vec<String> {
    let mut comps = Vec::new();
    let mut current = String::new();
    let mut chars = path.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '#' => match chars.peek() {
                Some(&next) if next == '/' || next == '#' => {
                    current.push(next);
                    chars.next();
                }
                _ => current.push('#'),
            },
            '/' => {
                if !current.is_empty() {
                    comps.push(std::mem::take(&mut current));
                }
            }
            other => current.push(other),
        }
    }
    if !current.is_empty() {
        comps.push(current);
    }
    comps
}

/// Drop `.` and apply `..`; `..` above the root stays at the root
fn normalize(comps: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(comps.len());
    for comp in comps {
        match comp.as_str() {
            "." => {}
            ".." => {
                out.pop();
            }
            _ => out.push(comp),
        }
    }
    out
}

fn escape_component(comp: &str) -> String {
    let chars: Vec<char> = comp.chars().collect();
    let mut out = String::with_capacity(comp.len());
    for (i, &c) in chars.iter().enumerate() {
        match c {
            '/' => out.push_str("#/"),
            '#' => {
                // A bare '#' only needs escaping where the parser would read it as one
                match chars.get(i + 1) {
                    None | Some('#') | Some('/') => out.push_str("##"),
                    Some(_) => out.push('#'),
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn join_components(comps: &[String]) -> String {
    if comps.is_empty() {
        return "/".to_string();
    }
    let mut out = String::new();
    for comp in comps {
        out.push('/');
        out.push_str(&escape_component(comp));
    }
    out
}
