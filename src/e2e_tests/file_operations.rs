//! Tests for basic file operations (create, read, write, seek, close)

use super::TestContext;
use nix::errno::Errno;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_write_read() {
        let mut ctx = TestContext::new().unwrap();
        let path = ctx.path("docs", "test_create.txt");

        let fd = ctx.dispatcher.creat(&path, 0o644).unwrap();
        assert_eq!(ctx.dispatcher.write(fd, b"Hello, SMB!").unwrap(), 11);
        ctx.dispatcher.close(fd).unwrap();

        assert_eq!(
            std::fs::read(ctx.local("docs", "test_create.txt")).unwrap(),
            b"Hello, SMB!".to_vec()
        );
        assert_eq!(ctx.read_all(&path).unwrap(), b"Hello, SMB!".to_vec());
    }

    #[test]
    fn test_exclusive_create_fails_on_existing() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "exists.txt"), b"x").unwrap();
        let path = ctx.path("docs", "exists.txt");
        assert_eq!(
            ctx.dispatcher
                .open(&path, libc::O_CREAT | libc::O_EXCL | libc::O_WRONLY, 0o644),
            Err(Errno::EEXIST)
        );
    }

    #[test]
    fn test_open_missing_file() {
        let mut ctx = TestContext::new().unwrap();
        let path = ctx.path("docs", "missing.txt");
        assert_eq!(
            ctx.dispatcher.open(&path, libc::O_RDONLY, 0),
            Err(Errno::ENOENT)
        );
        assert!(ctx.dispatcher.handles().is_empty());
    }

    #[test]
    fn test_pread_pwrite_leave_offset() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "p.txt"), b"0123456789").unwrap();
        let path = ctx.path("docs", "p.txt");

        let d = &mut ctx.dispatcher;
        let fd = d.open(&path, libc::O_RDWR, 0).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(d.pread(fd, &mut buf, 4).unwrap(), 3);
        assert_eq!(&buf, b"456");
        assert_eq!(d.pwrite(fd, b"ab", 8).unwrap(), 2);
        assert_eq!(d.lseek(fd, 0, libc::SEEK_CUR).unwrap(), 0);
        assert_eq!(d.read(fd, &mut buf).unwrap(), 3);
        assert_eq!(&buf, b"012");
        assert_eq!(d.pread(fd, &mut buf, -1), Err(Errno::EINVAL));
        d.close(fd).unwrap();

        assert_eq!(
            std::fs::read(ctx.local("docs", "p.txt")).unwrap(),
            b"01234567ab".to_vec()
        );
    }

    #[test]
    fn test_seek_end_uses_remote_size() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "size.txt"), b"twelve bytes").unwrap();
        let path = ctx.path("docs", "size.txt");

        let d = &mut ctx.dispatcher;
        let fd = d.open(&path, libc::O_RDONLY, 0).unwrap();
        assert_eq!(d.lseek(fd, 0, libc::SEEK_END).unwrap(), 12);
        assert_eq!(d.lseek(fd, -5, libc::SEEK_END).unwrap(), 7);
        let mut buf = [0u8; 16];
        assert_eq!(d.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"bytes");
        assert_eq!(d.lseek(fd, 0, 42), Err(Errno::EINVAL));
        d.close(fd).unwrap();
    }

    #[test]
    fn test_fstat_and_ftruncate() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "t.txt"), b"truncate me").unwrap();
        let path = ctx.path("docs", "t.txt");

        let d = &mut ctx.dispatcher;
        let fd = d.open(&path, libc::O_RDWR, 0).unwrap();
        assert_eq!(d.fstat(fd).unwrap().size, 11);
        d.ftruncate(fd, 4).unwrap();
        assert_eq!(d.fstat(fd).unwrap().size, 4);
        assert_eq!(d.ftruncate(fd, -1), Err(Errno::EINVAL));
        d.close(fd).unwrap();
    }

    #[test]
    fn test_dup2_onto_shim_fd_releases_it() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "one.txt"), b"one").unwrap();
        std::fs::write(ctx.local("docs", "two.txt"), b"two").unwrap();
        let (one, two) = (ctx.path("docs", "one.txt"), ctx.path("docs", "two.txt"));

        let d = &mut ctx.dispatcher;
        let a = d.open(&one, libc::O_RDONLY, 0).unwrap();
        let b = d.open(&two, libc::O_RDONLY, 0).unwrap();
        assert_eq!(d.dup2(a, b).unwrap(), b);
        assert_eq!(d.handles().open_files(), 1);

        let mut buf = [0u8; 3];
        d.read(b, &mut buf).unwrap();
        assert_eq!(&buf, b"one");
        d.close(a).unwrap();
        d.close(b).unwrap();
        assert!(d.handles().is_empty());
        assert!(d.registry().sessions().all(|s| s.users() == 0));
    }

    #[test]
    fn test_dup2_real_fd_over_shim_fd() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "x.txt"), b"x").unwrap();
        let path = ctx.path("docs", "x.txt");

        let d = &mut ctx.dispatcher;
        let shim = d.open(&path, libc::O_RDONLY, 0).unwrap();
        let real = d.open("/dev/null", libc::O_RDONLY, 0).unwrap();
        assert_eq!(d.dup2(real, shim).unwrap(), shim);
        assert!(!d.is_our_fd(shim));
        assert!(d.handles().is_empty());
        d.close(shim).unwrap();
        d.close(real).unwrap();
    }

    #[test]
    fn test_chmod_toggles_readonly() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "ro.txt"), b"ro").unwrap();
        let path = ctx.path("docs", "ro.txt");

        let d = &mut ctx.dispatcher;
        d.chmod(&path, 0o444).unwrap();
        assert_eq!(d.access(&path, libc::W_OK), Err(Errno::EACCES));
        assert!(d.access(&path, libc::R_OK).is_ok());
        d.chmod(&path, 0o644).unwrap();
        assert!(d.access(&path, libc::W_OK).is_ok());
        d.chown(&path, 0, 0).unwrap();
    }

    #[test]
    fn test_utime_sets_mtime() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "old.txt"), b"old").unwrap();
        let path = ctx.path("docs", "old.txt");

        let d = &mut ctx.dispatcher;
        d.utime(&path, Some((1_000_000_000, 1_100_000_000))).unwrap();
        assert_eq!(d.stat(&path).unwrap().mtime, 1_100_000_000);
    }
}
