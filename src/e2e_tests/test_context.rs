//! Test context for end-to-end testing
//!
//! Exports two scratch directories as `\\FILESERVER\docs` and
//! `\\FILESERVER\public` in workgroup `WG` and builds a dispatcher over them
//! with the namespace rooted at `/smb/`.

use crate::config::ShimConfig;
use crate::credentials::StaticCredentials;
use crate::dispatch::Dispatcher;
use crate::error::Result;
use crate::remote::LocalNetwork;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const WORKGROUP: &str = "WG";
pub const SERVER: &str = "FILESERVER";

/// Dispatcher plus the directories behind its shares
pub struct TestContext {
    pub dispatcher: Dispatcher,
    pub test_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Result<Self> {
        let test_dir = tempfile::tempdir()?;
        std::fs::create_dir(test_dir.path().join("docs"))?;
        std::fs::create_dir(test_dir.path().join("public"))?;

        let mut network = LocalNetwork::new(WORKGROUP);
        network.export(SERVER, "docs", test_dir.path().join("docs"))?;
        network.export(SERVER, "public", test_dir.path().join("public"))?;

        let config = ShimConfig {
            prefix: "/smb/".to_string(),
            workgroup: WORKGROUP.to_string(),
            initial_cwd: PathBuf::from("/"),
            op_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(config, Arc::new(network))?
            .with_credentials(Arc::new(StaticCredentials::new("tester", "secret")));

        Ok(Self {
            dispatcher,
            test_dir,
        })
    }

    /// Virtual path of `rel` inside `share`
    pub fn path(&self, share: &str, rel: &str) -> String {
        if rel.is_empty() {
            format!("/smb/{}/{}/{}", WORKGROUP, SERVER, share)
        } else {
            format!("/smb/{}/{}/{}/{}", WORKGROUP, SERVER, share, rel)
        }
    }

    /// Local file behind `rel` inside `share`
    pub fn local(&self, share: &str, rel: &str) -> PathBuf {
        self.test_dir.path().join(share).join(rel)
    }

    /// Open, read to EOF and close
    pub fn read_all(&mut self, path: &str) -> std::result::Result<Vec<u8>, nix::errno::Errno> {
        let fd = self.dispatcher.open(path, libc::O_RDONLY, 0)?;
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = self.dispatcher.read(fd, &mut buf)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        self.dispatcher.close(fd)?;
        Ok(out)
    }
}
