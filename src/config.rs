//! Shim configuration

use crate::error::{Error, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Default virtual namespace prefix
pub const DEFAULT_PREFIX: &str = "/smb/";

/// Identity this client presents during negotiation
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// Client GUID
    pub client_guid: Uuid,
    /// Workstation name
    pub workstation: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self {
            client_guid: Uuid::new_v4(),
            workstation: String::from("RUST-SMBW"),
        }
    }
}

/// Configuration for the SMB filesystem shim
#[derive(Debug, Clone)]
pub struct ShimConfig {
    /// Namespace prefix claimed by the shim, e.g. `/smb/`
    pub prefix: String,
    /// Workgroup used for browsing when the path does not name one
    pub workgroup: String,
    /// Default user name handed to the credential provider
    pub username: String,
    /// Default password handed to the credential provider
    pub password: String,
    /// Working directory the shim starts from
    pub initial_cwd: PathBuf,
    /// Throwaway file opened to obtain fd numbers
    pub backing_file: PathBuf,
    /// Capacity of the handle bitmap; fds at or above it are refused
    pub max_handles: usize,
    /// Upper bound on a single remote operation
    pub op_timeout: Duration,
    /// Evict unused sessions idle for longer than this (None keeps them forever)
    pub session_idle_timeout: Option<Duration>,
    /// Negotiation identity
    pub client: ClientIdentity,
}

impl Default for ShimConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            workgroup: String::from("WORKGROUP"),
            username: String::from("guest"),
            password: String::new(),
            initial_cwd: env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
            backing_file: PathBuf::from("/dev/null"),
            max_handles: 4096,
            op_timeout: Duration::from_secs(30),
            session_idle_timeout: None,
            client: ClientIdentity::default(),
        }
    }
}

impl ShimConfig {
    /// Build a configuration from the process environment.
    ///
    /// Recognized variables: `SMBW_PREFIX`, `WORKGROUP`, `USER`, `PASSWORD`,
    /// `SMBW_TIMEOUT_SECS`, `SMBW_IDLE_SECS`, `SMBW_MAX_HANDLES`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a configuration from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(prefix) = lookup("SMBW_PREFIX") {
            config.prefix = prefix;
        }
        if let Some(workgroup) = lookup("WORKGROUP") {
            config.workgroup = workgroup;
        }
        if let Some(user) = lookup("USER") {
            config.username = user;
        }
        if let Some(password) = lookup("PASSWORD") {
            config.password = password;
        }
        if let Some(secs) = lookup("SMBW_TIMEOUT_SECS") {
            config.op_timeout = Duration::from_secs(parse_number("SMBW_TIMEOUT_SECS", &secs)?);
        }
        if let Some(secs) = lookup("SMBW_IDLE_SECS") {
            config.session_idle_timeout =
                Some(Duration::from_secs(parse_number("SMBW_IDLE_SECS", &secs)?));
        }
        if let Some(max) = lookup("SMBW_MAX_HANDLES") {
            config.max_handles = parse_number("SMBW_MAX_HANDLES", &max)? as usize;
        }

        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is usable and normalize the prefix
    pub fn validate(&mut self) -> Result<()> {
        if !self.prefix.starts_with('/') {
            return Err(Error::Config(format!(
                "prefix must be absolute: {}",
                self.prefix
            )));
        }
        if !self.prefix.ends_with('/') {
            self.prefix.push('/');
        }
        if self.prefix == "/" {
            return Err(Error::Config("prefix cannot be the root".to_string()));
        }
        if self.max_handles == 0 {
            return Err(Error::Config("max_handles must be positive".to_string()));
        }
        if self.op_timeout.is_zero() {
            return Err(Error::Config("op_timeout must be positive".to_string()));
        }
        Ok(())
    }
}

fn parse_number(key: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} is not a number: {}", key, value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = ShimConfig::default();
        assert_eq!(config.prefix, "/smb/");
        assert_eq!(config.username, "guest");
        assert_eq!(config.op_timeout, Duration::from_secs(30));
        assert!(config.session_idle_timeout.is_none());
    }

    #[test]
    fn test_from_lookup() {
        let config = ShimConfig::from_lookup(lookup(&[
            ("SMBW_PREFIX", "/net"),
            ("USER", "alice"),
            ("PASSWORD", "secret"),
            ("WORKGROUP", "OFFICE"),
            ("SMBW_TIMEOUT_SECS", "5"),
            ("SMBW_IDLE_SECS", "60"),
        ]))
        .unwrap();

        assert_eq!(config.prefix, "/net/");
        assert_eq!(config.username, "alice");
        assert_eq!(config.password, "secret");
        assert_eq!(config.workgroup, "OFFICE");
        assert_eq!(config.op_timeout, Duration::from_secs(5));
        assert_eq!(config.session_idle_timeout, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_rejects_bad_values() {
        assert!(ShimConfig::from_lookup(lookup(&[("SMBW_PREFIX", "smb")])).is_err());
        assert!(ShimConfig::from_lookup(lookup(&[("SMBW_PREFIX", "/")])).is_err());
        assert!(ShimConfig::from_lookup(lookup(&[("SMBW_TIMEOUT_SECS", "soon")])).is_err());
        assert!(ShimConfig::from_lookup(lookup(&[("SMBW_MAX_HANDLES", "0")])).is_err());
    }
}
