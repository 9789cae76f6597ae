//! NetBIOS name handling
//!
//! Servers in the virtual namespace may be written as plain host names or as
//! NetBIOS names carrying a `#XX` type suffix. The suffix decides how the
//! registry reaches the target: `WORKGROUP#1D` and `WORKGROUP#01` name the
//! workgroup's master browser, `NAME#20` names a file server.

use crate::error::{Error, Result};
use std::convert::TryFrom;

/// Maximum NetBIOS name length (before padding)
pub const NETBIOS_NAME_MAX_LEN: usize = 15;

/// Called name to retry with when a server rejects its own name
pub const WILDCARD_SERVER_NAME: &str = "*SMBSERVER";

/// NetBIOS name types (16th byte)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetBiosNameType {
    /// Workstation service
    Workstation = 0x00,
    /// Browse master for the local subnet (`__MSBROWSE__`)
    BrowseMaster = 0x01,
    /// Messenger service
    Messenger = 0x03,
    /// File server service
    FileServer = 0x20,
    /// Domain master browser
    DomainMasterBrowser = 0x1B,
    /// Domain controller
    DomainController = 0x1C,
    /// Master browser
    MasterBrowser = 0x1D,
    /// Browser service elections
    BrowserElections = 0x1E,
}

impl TryFrom<u8> for NetBiosNameType {
    type Error = u8;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NetBiosNameType::Workstation),
            0x01 => Ok(NetBiosNameType::BrowseMaster),
            0x03 => Ok(NetBiosNameType::Messenger),
            0x20 => Ok(NetBiosNameType::FileServer),
            0x1B => Ok(NetBiosNameType::DomainMasterBrowser),
            0x1C => Ok(NetBiosNameType::DomainController),
            0x1D => Ok(NetBiosNameType::MasterBrowser),
            0x1E => Ok(NetBiosNameType::BrowserElections),
            other => Err(other),
        }
    }
}

impl NetBiosNameType {
    /// Whether this suffix asks for a browse master rather than a host
    pub fn is_browser(self) -> bool {
        matches!(
            self,
            NetBiosNameType::MasterBrowser | NetBiosNameType::BrowseMaster
        )
    }
}

/// A server token split into its name and optional type suffix
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetBiosName {
    pub name: String,
    pub name_type: Option<NetBiosNameType>,
}

impl NetBiosName {
    /// Parse `NAME` or `NAME#XX` where `XX` is a hex type byte.
    ///
    /// A `#` not followed by exactly two hex digits is part of the name.
    pub fn parse(token: &str) -> Self {
        if let Some(idx) = token.rfind('#') {
            let suffix = &token[idx + 1..];
            if suffix.len() == 2 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
                if let Ok(byte) = u8::from_str_radix(suffix, 16) {
                    if let Ok(name_type) = NetBiosNameType::try_from(byte) {
                        return Self {
                            name: token[..idx].to_string(),
                            name_type: Some(name_type),
                        };
                    }
                }
            }
        }
        Self {
            name: token.to_string(),
            name_type: None,
        }
    }

    /// Name of a workgroup's master browser
    pub fn master_browser(workgroup: &str) -> Self {
        Self {
            name: workgroup.to_string(),
            name_type: Some(NetBiosNameType::MasterBrowser),
        }
    }

    /// Name of the local browse master, used to enumerate workgroups
    pub fn browse_master(workgroup: &str) -> Self {
        Self {
            name: workgroup.to_string(),
            name_type: Some(NetBiosNameType::BrowseMaster),
        }
    }

    /// Whether this token must be resolved through master-browser discovery
    pub fn is_browser(&self) -> bool {
        self.name_type.map(NetBiosNameType::is_browser).unwrap_or(false)
    }

    /// Check the name fits in a NetBIOS name field
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Path("empty NetBIOS name".to_string()));
        }
        if self.name.len() > NETBIOS_NAME_MAX_LEN && self.name_type.is_some() {
            return Err(Error::Path(format!(
                "NetBIOS name '{}' exceeds maximum length {}",
                self.name, NETBIOS_NAME_MAX_LEN
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for NetBiosName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.name_type {
            Some(t) => write!(f, "{}#{:02X}", self.name, t as u8),
            None => write!(f, "{}", self.name),
        }
    }
}
