//! Tests for rename within and across shares

use super::TestContext;
use nix::errno::Errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_file() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "old_name.txt"), b"rename test content").unwrap();
        let (from, to) = (ctx.path("docs", "old_name.txt"), ctx.path("docs", "new_name.txt"));

        ctx.dispatcher.rename(&from, &to).unwrap();
        assert!(!ctx.local("docs", "old_name.txt").exists());
        assert_eq!(
            std::fs::read(ctx.local("docs", "new_name.txt")).unwrap(),
            b"rename test content".to_vec()
        );
    }

    #[test]
    fn test_rename_into_subdirectory() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::create_dir(ctx.local("docs", "subdir")).unwrap();
        std::fs::write(ctx.local("docs", "move_me.txt"), b"moving").unwrap();
        let (from, to) = (
            ctx.path("docs", "move_me.txt"),
            ctx.path("docs", "subdir/moved.txt"),
        );

        ctx.dispatcher.rename(&from, &to).unwrap();
        assert!(ctx.local("docs", "subdir/moved.txt").exists());
    }

    #[test]
    fn test_rename_over_existing_replaces_it() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "source.txt"), b"source").unwrap();
        std::fs::write(ctx.local("docs", "target.txt"), b"target").unwrap();
        let (from, to) = (ctx.path("docs", "source.txt"), ctx.path("docs", "target.txt"));

        ctx.dispatcher.rename(&from, &to).unwrap();
        assert_eq!(
            std::fs::read(ctx.local("docs", "target.txt")).unwrap(),
            b"source".to_vec()
        );
    }

    #[test]
    fn test_rename_missing_source() {
        let mut ctx = TestContext::new().unwrap();
        let (from, to) = (ctx.path("docs", "ghost.txt"), ctx.path("docs", "other.txt"));
        assert_eq!(ctx.dispatcher.rename(&from, &to), Err(Errno::ENOENT));
    }

    #[test]
    fn test_rename_missing_source_keeps_target() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "keep.txt"), b"keep me").unwrap();
        let (from, to) = (ctx.path("docs", "missing.txt"), ctx.path("docs", "keep.txt"));

        assert_eq!(ctx.dispatcher.rename(&from, &to), Err(Errno::ENOENT));
        assert_eq!(
            std::fs::read(ctx.local("docs", "keep.txt")).unwrap(),
            b"keep me".to_vec()
        );
    }

    #[test]
    fn test_rename_from_missing_directory_keeps_target() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "plain.txt"), b"plain").unwrap();
        let (from, to) = (ctx.path("docs", "missing/inner.txt"), ctx.path("docs", "plain.txt"));

        assert_eq!(ctx.dispatcher.rename(&from, &to), Err(Errno::ENOENT));
        assert!(ctx.local("docs", "plain.txt").exists());
    }

    #[test]
    fn test_rename_across_boundaries_is_exdev() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "stay.txt"), b"stay").unwrap();
        let from = ctx.path("docs", "stay.txt");
        let other_share = ctx.path("public", "stay.txt");
        let local = ctx.test_dir.path().join("stay.txt");
        let local = local.to_str().unwrap().to_string();

        let d = &mut ctx.dispatcher;
        assert_eq!(d.rename(&from, &other_share), Err(Errno::EXDEV));
        assert_eq!(d.rename(&from, &local), Err(Errno::EXDEV));
        assert_eq!(d.rename(&local, &from), Err(Errno::EXDEV));
        assert!(ctx.local("docs", "stay.txt").exists());
    }
}
