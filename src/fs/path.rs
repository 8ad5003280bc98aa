//! Path parsing and resolution: turning a `/`-separated string into a locked inode.
//!
//! Paths are plain `&str` here rather than the `CStr`-based wrapper types a `no_std` kernel needs
//! to keep alive without an allocator: this crate always has one, and string slices are the
//! native way to express "not longer than `DIRSIZ`" with the standard library's own tools.

use std::sync::Arc;

use crate::error::{FsError, FsResult};
use crate::fs::dir::dirlookup;
use crate::fs::inode::{InodeType, RcInode};
use crate::fs::FileSystem;
use crate::param::{MAXPATH, MAX_SYMLINK_DEPTH};

/// Splits the first path element off `path`, returning `(name, rest)`. Skips any number of
/// leading and separating slashes. Returns `None` once nothing but slashes remain.
///
/// ```text
/// skipelem("a/bb/c")  == Some(("a",  "bb/c"))
/// skipelem("///a//bb") == Some(("a", "bb"))
/// skipelem("a")        == Some(("a", ""))
/// skipelem("")         == None
/// skipelem("////")     == None
/// ```
pub fn skipelem(path: &str) -> Option<(&str, &str)> {
    let bytes = path.as_bytes();
    let start = bytes.iter().position(|&c| c != b'/')?;
    let rest = &path[start..];
    let len = rest.find('/').unwrap_or(rest.len());
    let name = &rest[..len];
    let after = &rest[len..];
    let next_start = after.as_bytes().iter().position(|&c| c != b'/').unwrap_or(after.len());
    Some((name, &after[next_start..]))
}

/// Resolves `path` to a referenced, unlocked inode handle. `nameiparent` instead stops one
/// element early and also returns that last element's name (used by callers that are about to
/// create or unlink it).
///
/// There is no per-process table in this library to own a current working directory, so the
/// starting point is taken as an explicit parameter instead: `cwd` stands in for the kernel
/// service spec.md §1 places out of scope. A path beginning with `/` always starts at the root
/// regardless of `cwd`; otherwise resolution starts at `cwd` if given, and at the root if not
/// (the natural behavior for a caller with no notion of a working directory at all).
///
/// Each intermediate element must be a directory; a `Symlink` encountered along the way (other
/// than possibly the final element, left to the caller) is followed transparently, up to
/// [`MAX_SYMLINK_DEPTH`] hops before giving up with [`FsError::SymlinkLoop`].
fn namex(
    fs: &Arc<FileSystem>,
    path: &str,
    name_only: bool,
    cwd: Option<&RcInode>,
) -> FsResult<(RcInode, String)> {
    let mut ip = if path.starts_with('/') {
        fs.root()
    } else {
        match cwd {
            Some(start) => start.clone(),
            None => fs.root(),
        }
    };
    let mut rest = path;
    let mut last_name = String::new();

    loop {
        let (name, next) = match skipelem(rest) {
            Some(pair) => pair,
            None => return Ok((ip, last_name)),
        };

        let guard = ip.lock();
        if guard.kind() != InodeType::Dir {
            drop(guard);
            return Err(FsError::NotADirectory);
        }
        if name_only && next.is_empty() {
            drop(guard);
            return Ok((ip, name.to_string()));
        }
        let mut guard = guard;
        let (next_ip, _off) = dirlookup(&mut guard, name, fs)?;
        drop(guard);

        ip = next_ip;
        rest = next;
        last_name = name.to_string();

        if rest.is_empty() {
            return Ok((ip, last_name));
        }
    }
}

/// Resolves `path` to a locked-then-released handle on the final element, following symlinks
/// (including a symlink as the final element) up to [`MAX_SYMLINK_DEPTH`] hops. `cwd` is the
/// starting point for a relative path; see [`namex`].
pub fn namei(fs: &Arc<FileSystem>, path: &str, cwd: Option<&RcInode>) -> FsResult<RcInode> {
    let (ip, _) = namex(fs, path, false, cwd)?;
    dive(fs, ip, 0, cwd)
}

/// Like [`namei`] but does not resolve a trailing symlink: used by callers (`O_CREATE`, `rm`,
/// `rename`) that need to operate on the link itself.
pub fn namei_nofollow(fs: &Arc<FileSystem>, path: &str, cwd: Option<&RcInode>) -> FsResult<RcInode> {
    let (ip, _) = namex(fs, path, false, cwd)?;
    Ok(ip)
}

/// Resolves all but the last path element, returning the parent directory and the final
/// element's name (not looked up: it may not exist yet).
pub fn nameiparent<'p>(
    fs: &Arc<FileSystem>,
    path: &'p str,
    cwd: Option<&RcInode>,
) -> FsResult<(RcInode, String)> {
    namex(fs, path, true, cwd)
}

/// Follows `ip` through up to `MAX_SYMLINK_DEPTH - depth` more symlink hops if it is one. A
/// relative symlink target resolves against the same `cwd` the original lookup used.
fn dive(fs: &Arc<FileSystem>, ip: RcInode, depth: u32, cwd: Option<&RcInode>) -> FsResult<RcInode> {
    let mut ip = ip;
    let mut depth = depth;
    loop {
        let kind = ip.lock().kind();
        if kind != InodeType::Symlink {
            return Ok(ip);
        }
        if depth >= MAX_SYMLINK_DEPTH {
            return Err(FsError::SymlinkLoop);
        }
        let mut target = [0u8; MAXPATH];
        let n = {
            let mut guard = ip.lock();
            guard.read(0, &mut target)?
        };
        let target = std::str::from_utf8(&target[..n])
            .map_err(|_| FsError::NotFound)?
            .to_string();
        let (next, _) = namex(fs, &target, false, cwd)?;
        ip = next;
        depth += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use crate::fs::dir;
    use crate::mkfs::{add_file, build_image};

    fn mounted(nblocks: u32, ninodes: u32) -> Arc<FileSystem> {
        let device: Arc<dyn crate::device::BlockDevice> = Arc::new(MemDevice::new(nblocks));
        build_image(&device, ninodes)
    }

    fn symlink(fs: &Arc<FileSystem>, parent: &RcInode, name: &str, target: &str) -> RcInode {
        let tx = fs.begin_transaction();
        let link = fs.ialloc(&tx, InodeType::Symlink).unwrap();
        {
            let mut guard = link.lock();
            guard.write(0, target.as_bytes(), &tx).unwrap();
        }
        {
            let mut pg = parent.lock();
            dir::dirlink(&mut pg, name, link.inum, &tx, fs).unwrap();
        }
        link
    }

    #[test]
    fn skipelem_strips_separators() {
        assert_eq!(skipelem("a/bb/c"), Some(("a", "bb/c")));
        assert_eq!(skipelem("///a//bb"), Some(("a", "bb")));
        assert_eq!(skipelem("a"), Some(("a", "")));
        assert_eq!(skipelem(""), None);
        assert_eq!(skipelem("////"), None);
    }

    #[test]
    fn namei_resolves_absolute_and_relative_paths() {
        let fs = mounted(2000, 64);
        add_file(&fs, "hello.txt", b"hi").unwrap();

        let abs = namei(&fs, "/hello.txt", None).unwrap();
        assert_eq!(abs.inum, namei(&fs, "hello.txt", Some(&fs.root())).unwrap().inum);

        // A leading `/` always means root, even when a cwd is supplied.
        let via_root_despite_cwd = namei(&fs, "/hello.txt", Some(&fs.root()));
        assert!(via_root_despite_cwd.is_ok());
    }

    #[test]
    fn nameiparent_stops_one_element_short() {
        let fs = mounted(2000, 64);
        let tx = fs.begin_transaction();
        let dir_inode = fs.ialloc(&tx, InodeType::Dir).unwrap();
        {
            let mut g = dir_inode.lock();
            dir::init_empty(&mut g, dir_inode.inum, fs.root().inum, &tx);
        }
        {
            let mut root = fs.root().lock();
            dir::dirlink(&mut root, "sub", dir_inode.inum, &tx, &fs).unwrap();
        }
        drop(tx);

        let (parent, name) = nameiparent(&fs, "/sub/leaf.txt", None).unwrap();
        assert_eq!(parent.inum, dir_inode.inum);
        assert_eq!(name, "leaf.txt");
    }

    #[test]
    fn nameiparent_rejects_a_regular_file_as_the_penultimate_element() {
        // `nameiparent("/regularfile/newname")` must fail as soon as it discovers that
        // `/regularfile` is not a directory, even though "newname" is the final path element and
        // would otherwise trigger the name-only shortcut before any directory ever gets looked
        // into. A caller like `dirlink` never itself checks that its target is a directory.
        let fs = mounted(2000, 64);
        add_file(&fs, "regularfile", b"hi").unwrap();

        assert_eq!(nameiparent(&fs, "/regularfile/newname", None), Err(FsError::NotADirectory));
    }

    #[test]
    fn relative_lookup_with_no_cwd_falls_back_to_root() {
        let fs = mounted(2000, 64);
        add_file(&fs, "hello.txt", b"hi").unwrap();
        let found = namei(&fs, "hello.txt", None).unwrap();
        assert_eq!(found.inum, namei(&fs, "/hello.txt", None).unwrap().inum);
    }

    #[test]
    fn symlink_chain_of_nine_resolves() {
        let fs = mounted(2000, 64);
        add_file(&fs, "target.txt", b"payload").unwrap();

        let root = fs.root();
        // link9 -> target.txt, link8 -> link9, ..., link1 -> link2.
        symlink(&fs, &root, "link9", "/target.txt");
        for i in (1..9).rev() {
            symlink(&fs, &root, &format!("link{i}"), &format!("/link{}", i + 1));
        }

        let resolved = namei(&fs, "/link1", None).unwrap();
        let mut buf = [0u8; 7];
        resolved.lock().read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"payload");
    }

    #[test]
    fn symlink_chain_of_eleven_fails() {
        let fs = mounted(2000, 64);
        add_file(&fs, "target.txt", b"payload").unwrap();

        let root = fs.root();
        symlink(&fs, &root, "link11", "/target.txt");
        for i in (1..11).rev() {
            symlink(&fs, &root, &format!("link{i}"), &format!("/link{}", i + 1));
        }

        assert_eq!(namei(&fs, "/link1", None), Err(FsError::SymlinkLoop));
    }

    #[test]
    fn two_link_symlink_cycle_fails_after_hop_cap() {
        let fs = mounted(2000, 64);
        let root = fs.root();
        symlink(&fs, &root, "a", "/b");
        symlink(&fs, &root, "b", "/a");

        assert_eq!(namei(&fs, "/a", None), Err(FsError::SymlinkLoop));
    }

    #[test]
    fn namei_nofollow_returns_the_link_itself() {
        let fs = mounted(2000, 64);
        add_file(&fs, "target.txt", b"payload").unwrap();
        let root = fs.root();
        let link = symlink(&fs, &root, "link", "/target.txt");

        let looked_up = namei_nofollow(&fs, "/link", None).unwrap();
        assert_eq!(looked_up.inum, link.inum);
        assert_eq!(looked_up.lock().kind(), InodeType::Symlink);
    }
}
