//! Tests for browsing the namespace and reading directory streams

use super::TestContext;
use crate::handles::DirRecord;
use nix::errno::Errno;

fn names(records: Vec<DirRecord>) -> Vec<String> {
    records.into_iter().map(|r| r.name).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_browse_every_level() {
        let mut ctx = TestContext::new().unwrap();
        let d = &mut ctx.dispatcher;

        let root = d.opendir("/smb/").unwrap();
        assert_eq!(names(d.getdents(root, 16).unwrap()), vec![".", "..", "WG"]);
        d.closedir(root).unwrap();

        let wg = d.opendir("/smb/WG").unwrap();
        assert_eq!(
            names(d.getdents(wg, 16).unwrap()),
            vec![".", "..", "FILESERVER"]
        );
        d.closedir(wg).unwrap();

        let server = d.opendir("/smb/WG/FILESERVER").unwrap();
        assert_eq!(
            names(d.getdents(server, 16).unwrap()),
            vec![".", "..", "docs", "public"]
        );
        d.closedir(server).unwrap();
    }

    #[test]
    fn test_share_listing_is_a_snapshot() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("docs", "a.txt"), b"a").unwrap();
        std::fs::create_dir(ctx.local("docs", "sub")).unwrap();
        let share = ctx.path("docs", "");
        let late = ctx.local("docs", "late.txt");

        let d = &mut ctx.dispatcher;
        let fd = d.opendir(&share).unwrap();
        std::fs::write(late, b"late").unwrap();

        let mut listed = names(d.getdents(fd, 16).unwrap());
        listed.sort();
        assert_eq!(listed, vec![".", "..", "a.txt", "sub"]);
        assert!(d.readdir(fd).unwrap().is_none());
        d.closedir(fd).unwrap();
    }

    #[test]
    fn test_seekdir_replays_entries() {
        let mut ctx = TestContext::new().unwrap();
        for name in ["one", "two", "three"] {
            std::fs::write(ctx.local("docs", name), name).unwrap();
        }
        let share = ctx.path("docs", "");

        let d = &mut ctx.dispatcher;
        let fd = d.opendir(&share).unwrap();
        d.readdir(fd).unwrap();
        let pos = d.telldir(fd).unwrap();
        let next = d.readdir(fd).unwrap().unwrap();
        d.readdir(fd).unwrap();
        d.seekdir(fd, pos).unwrap();
        assert_eq!(d.readdir(fd).unwrap().unwrap(), next);
        assert_eq!(d.lseek(fd, 0, libc::SEEK_END), Err(Errno::EINVAL));

        let st = d.fstat(fd).unwrap();
        assert!(st.is_dir());
        assert_eq!(st.size, 5 * crate::handles::DIRENT_RECORD_SIZE as u64);
        d.closedir(fd).unwrap();
    }

    #[test]
    fn test_dot_entries_have_path_inodes() {
        let mut ctx = TestContext::new().unwrap();
        let share = ctx.path("docs", "");
        let d = &mut ctx.dispatcher;
        let fd = d.opendir(&share).unwrap();
        let records = d.getdents(fd, 2).unwrap();
        assert_eq!(records[0].inode, d.stat(&share).unwrap().ino);
        assert_eq!(records[1].inode, d.stat("/smb/WG/FILESERVER").unwrap().ino);
        d.closedir(fd).unwrap();
    }

    #[test]
    fn test_directory_fds_cannot_be_duped() {
        let mut ctx = TestContext::new().unwrap();
        let share = ctx.path("docs", "");
        let d = &mut ctx.dispatcher;
        let fd = d.opendir(&share).unwrap();
        assert_eq!(d.dup(fd), Err(Errno::EBADF));
        assert_eq!(d.write(fd, b"x"), Err(Errno::EISDIR));
        d.closedir(fd).unwrap();
    }

    #[test]
    fn test_local_directory_stream() {
        let mut ctx = TestContext::new().unwrap();
        std::fs::write(ctx.local("public", "plain"), b"").unwrap();
        let dir = ctx.local("public", "");
        let dir = dir.to_str().unwrap().to_string();

        let d = &mut ctx.dispatcher;
        let fd = d.opendir(&dir).unwrap();
        assert!(!d.is_our_fd(fd));
        let mut listed = names(d.getdents(fd, 16).unwrap());
        listed.sort();
        assert_eq!(listed, vec![".", "..", "plain"]);
        d.closedir(fd).unwrap();
    }

    #[test]
    fn test_unknown_share() {
        let mut ctx = TestContext::new().unwrap();
        assert_eq!(
            ctx.dispatcher.opendir("/smb/WG/FILESERVER/nope"),
            Err(Errno::ENOENT)
        );
        assert_eq!(
            ctx.dispatcher.stat("/smb/WG/NOSUCHHOST/docs"),
            Err(Errno::ENOENT)
        );
    }
}
