//! Tests for unlink and rmdir

use super::TestContext;
use nix::errno::Errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlink_file() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "delete_me.txt"), b"test content").unwrap();
        let path = ctx.path("docs", "delete_me.txt");

        ctx.dispatcher.unlink(&path).unwrap();
        assert!(!ctx.local("docs", "delete_me.txt").exists());
        assert_eq!(ctx.dispatcher.unlink(&path), Err(Errno::ENOENT));
    }

    #[test]
    fn test_rmdir_requires_empty() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::create_dir(ctx.local("docs", "full")).unwrap();
        std::fs::write(ctx.local("docs", "full/file"), b"").unwrap();
        let dir = ctx.path("docs", "full");
        let file = ctx.path("docs", "full/file");

        let d = &mut ctx.dispatcher;
        assert_eq!(d.rmdir(&dir), Err(Errno::ENOTEMPTY));
        d.unlink(&file).unwrap();
        d.rmdir(&dir).unwrap();
        assert!(!ctx.local("docs", "full").exists());
    }

    #[test]
    fn test_browse_levels_are_read_only() {
        let mut ctx = TestContext::new().unwrap();
        let share = ctx.path("docs", "");
        let d = &mut ctx.dispatcher;
        assert_eq!(d.unlink(&share), Err(Errno::EACCES));
        assert_eq!(d.rmdir(&share), Err(Errno::EACCES));
        assert_eq!(d.mkdir(&share, 0o755), Err(Errno::EEXIST));
        assert_eq!(d.mkdir("/smb/WG/FILESERVER", 0o755), Err(Errno::EACCES));
        assert_eq!(d.unlink("/smb/WG"), Err(Errno::EACCES));
    }

    #[test]
    fn test_links_not_supported() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "target"), b"").unwrap();
        let target = ctx.path("docs", "target");
        let link = ctx.path("docs", "link");
        let d = &mut ctx.dispatcher;
        assert_eq!(d.link(&target, &link), Err(Errno::ENOTSUP));
        assert_eq!(d.symlink(&target, &link), Err(Errno::ENOTSUP));
        assert_eq!(d.readlink(&target), Err(Errno::EINVAL));
    }
}
