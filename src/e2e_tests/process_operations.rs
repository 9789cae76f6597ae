//! Tests for fork handling and shutdown

use super::TestContext;
use crate::fork::ForkOutcome;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(unsafe_code)]
    fn test_child_close_leaves_parent_handle() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "shared.txt"), b"parent data").unwrap();
        let path = ctx.path("docs", "shared.txt");

        let fd = ctx.dispatcher.open(&path, libc::O_RDONLY, 0).unwrap();
        match ctx.dispatcher.fork().unwrap() {
            ForkOutcome::Child => {
                let d = &mut ctx.dispatcher;
                let clean = !d.is_our_fd(fd) && d.handles().is_empty() && d.registry().is_empty();
                // The fd number is no longer the child's to close
                let _ = d.close(fd);
                unsafe { libc::_exit(if clean { 0 } else { 1 }) };
            }
            ForkOutcome::Parent(pid) => {
                let status = waitpid(Pid::from_raw(pid), None).unwrap();
                assert_eq!(status, WaitStatus::Exited(Pid::from_raw(pid), 0));

                let d = &mut ctx.dispatcher;
                assert!(d.is_our_fd(fd));
                let mut buf = [0u8; 11];
                assert_eq!(d.read(fd, &mut buf).unwrap(), 11);
                assert_eq!(&buf, b"parent data");
                d.close(fd).unwrap();
            }
        }
    }

    #[test]
    #[allow(unsafe_code)]
    fn test_session_survives_child_exit() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "before.txt"), b"before").unwrap();
        let path = ctx.path("docs", "before.txt");
        ctx.dispatcher.stat(&path).unwrap();
        assert_eq!(ctx.dispatcher.registry().len(), 1);

        match ctx.dispatcher.fork().unwrap() {
            ForkOutcome::Child => unsafe { libc::_exit(0) },
            ForkOutcome::Parent(pid) => {
                waitpid(Pid::from_raw(pid), None).unwrap();
                assert_eq!(ctx.dispatcher.registry().len(), 1);
                assert_eq!(ctx.read_all(&path).unwrap(), b"before".to_vec());
            }
        }
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "open.txt"), b"open").unwrap();
        let path = ctx.path("docs", "open.txt");
        let share = ctx.path("public", "");

        let d = &mut ctx.dispatcher;
        let file = d.open(&path, libc::O_RDONLY, 0).unwrap();
        let dir = d.opendir(&share).unwrap();
        d.shutdown();
        assert!(d.handles().is_empty());
        assert!(d.registry().is_empty());
        assert!(!d.is_our_fd(file));
        assert!(!d.is_our_fd(dir));
    }
}
