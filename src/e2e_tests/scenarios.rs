//! End-to-end scenarios across path classification, sessions and handles

use super::TestContext;
use crate::path::{PathResolver, VirtualPath};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_in_share_path() {
        let resolver = PathResolver::new("/smb/", "WORKGROUP");
        let vp = resolver
            .classify("/smb/WORKGROUP/FILESERVER/docs/report.txt", "/")
            .unwrap();
        assert_eq!(
            vp,
            VirtualPath::InShare {
                workgroup: "WORKGROUP".to_string(),
                server: "FILESERVER".to_string(),
                share: "docs".to_string(),
                path: "report.txt".to_string(),
            }
        );
    }

    #[test]
    fn test_classify_root_and_foreign() {
        let resolver = PathResolver::new("/smb/", "WORKGROUP");
        assert_eq!(resolver.classify("/smb/", "/"), Some(VirtualPath::Root));
        assert_eq!(resolver.classify("/home/user/file", "/"), None);
    }

    #[test]
    fn test_two_handles_share_remote_state() {
        let mut ctx = TestContext::new().unwrap();
        let path = ctx.path("docs", "a.txt");
        std::fs::write(ctx.local("docs", "a.txt"), b"........").unwrap();

        let d = &mut ctx.dispatcher;
        let writer = d.open(&path, libc::O_WRONLY, 0).unwrap();
        let reader = d.open(&path, libc::O_RDONLY, 0).unwrap();
        assert_ne!(writer, reader);
        // Both opens went through one pooled session
        assert_eq!(d.registry().len(), 1);

        d.write(writer, b"written").unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(d.read(reader, &mut buf).unwrap(), 8);
        assert_eq!(&buf, b"written.");

        d.close(writer).unwrap();
        d.close(reader).unwrap();
        assert!(d.handles().is_empty());
    }

    #[test]
    fn test_full_file_workflow() {
        let mut ctx = TestContext::new().unwrap();
        let dir = ctx.path("docs", "work");
        let file = ctx.path("docs", "work/notes.txt");

        let d = &mut ctx.dispatcher;
        d.mkdir(&dir, 0o755).unwrap();
        let fd = d.creat(&file, 0o644).unwrap();
        d.write(fd, b"first line\n").unwrap();
        d.close(fd).unwrap();

        let st = d.stat(&file).unwrap();
        assert!(st.is_file());
        assert_eq!(st.size, 11);

        d.truncate(&file, 5).unwrap();
        assert_eq!(ctx.read_all(&file).unwrap(), b"first".to_vec());

        let d = &mut ctx.dispatcher;
        d.unlink(&file).unwrap();
        d.rmdir(&dir).unwrap();
        assert!(!ctx.local("docs", "work").exists());
    }

    #[test]
    fn test_chdir_makes_relative_paths_ours() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "rel.txt"), b"relative").unwrap();
        let share = ctx.path("docs", "");

        ctx.dispatcher.chdir(&share).unwrap();
        assert_eq!(ctx.dispatcher.getcwd(), share);
        assert!(ctx.dispatcher.is_ours("rel.txt"));
        assert_eq!(ctx.read_all("rel.txt").unwrap(), b"relative".to_vec());

        ctx.dispatcher.chdir("..").unwrap();
        assert_eq!(ctx.dispatcher.getcwd(), "/smb/WG/FILESERVER");
    }

    #[test]
    fn test_relative_local_path_from_virtual_cwd() {
        let mut ctx = TestContext::new().unwrap();
        let local = ctx.test_dir.path().join("outside.txt");
        std::fs::write(&local, b"outside").unwrap();
        let share = ctx.path("docs", "");
        // Four levels up from /smb/WG/FILESERVER/docs is the real root
        let relative = format!("../../../..{}", local.to_str().unwrap());

        ctx.dispatcher.chdir(&share).unwrap();
        assert!(!ctx.dispatcher.is_ours(&relative));
        let st = ctx.dispatcher.stat(&relative).unwrap();
        assert_eq!(st.size, 7);
        assert_eq!(ctx.read_all(&relative).unwrap(), b"outside".to_vec());

        let made = format!("../../../..{}", ctx.test_dir.path().join("made").to_str().unwrap());
        ctx.dispatcher.mkdir(&made, 0o755).unwrap();
        assert!(ctx.test_dir.path().join("made").is_dir());
        assert_eq!(ctx.dispatcher.getcwd(), share);
    }

    #[test]
    fn test_local_paths_untouched() {
        let mut ctx = TestContext::new().unwrap();
        let local = ctx.test_dir.path().join("plain.txt");
        let local = local.to_str().unwrap().to_string();

        let d = &mut ctx.dispatcher;
        let fd = d.creat(&local, 0o600).unwrap();
        assert!(!d.is_our_fd(fd));
        d.write(fd, b"local").unwrap();
        d.close(fd).unwrap();
        assert_eq!(std::fs::read(&local).unwrap(), b"local".to_vec());
        assert!(d.registry().is_empty());
    }
}
