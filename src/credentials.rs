//! Credential lookup for new sessions

use std::env;
use std::fmt;

/// Authentication material for one session
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub workgroup: String,
}

impl Credentials {
    pub fn new(username: &str, password: &str, workgroup: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            workgroup: workgroup.to_string(),
        }
    }

    /// Empty user and password in the same workgroup
    pub fn anonymous(workgroup: &str) -> Self {
        Self::new("", "", workgroup)
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

// Keep passwords out of logs
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("workgroup", &self.workgroup)
            .finish_non_exhaustive()
    }
}

/// Supplies credentials for a `(server, share)` about to be connected.
///
/// `workgroup` is the workgroup named by the path being accessed.
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self, server: &str, share: &str, workgroup: &str) -> Credentials;
}

/// Looks up `USER` and `PASSWORD` in the environment at connect time,
/// falling back to fixed defaults.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    default_user: String,
    default_password: String,
}

impl EnvCredentials {
    pub fn new(default_user: &str, default_password: &str) -> Self {
        Self {
            default_user: default_user.to_string(),
            default_password: default_password.to_string(),
        }
    }
}

impl CredentialProvider for EnvCredentials {
    fn credentials(&self, _server: &str, _share: &str, workgroup: &str) -> Credentials {
        let username = env::var("USER").unwrap_or_else(|_| self.default_user.clone());
        let password = env::var("PASSWORD").unwrap_or_else(|_| self.default_password.clone());
        Credentials {
            username,
            password,
            workgroup: workgroup.to_string(),
        }
    }
}

/// Fixed credentials for every server
#[derive(Debug, Clone)]
pub struct StaticCredentials {
    username: String,
    password: String,
}

impl StaticCredentials {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
        }
    }
}

impl CredentialProvider for StaticCredentials {
    fn credentials(&self, _server: &str, _share: &str, workgroup: &str) -> Credentials {
        Credentials::new(&self.username, &self.password, workgroup)
    }
}

impl<F> CredentialProvider for F
where
    F: Fn(&str, &str, &str) -> Credentials + Send + Sync,
{
    fn credentials(&self, server: &str, share: &str, workgroup: &str) -> Credentials {
        self(server, share, workgroup)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_hides_password() {
        let creds = Credentials::new("alice", "hunter2", "WG");
        let debug = format!("{:?}", creds);
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_anonymous() {
        assert!(Credentials::anonymous("WG").is_anonymous());
        assert!(!Credentials::new("u", "", "WG").is_anonymous());
    }

    #[test]
    fn test_closure_provider() {
        let provider = |server: &str, _share: &str, wg: &str| {
            Credentials::new(&format!("user-{}", server), "pw", wg)
        };
        let creds = provider.credentials("HOST", "share", "WG");
        assert_eq!(creds.username, "user-HOST");
        assert_eq!(creds.workgroup, "WG");
    }

    #[test]
    fn test_static_provider() {
        let provider = StaticCredentials::new("bob", "pw");
        let creds = provider.credentials("HOST", "share", "OFFICE");
        assert_eq!(creds, Credentials::new("bob", "pw", "OFFICE"));
    }
}
