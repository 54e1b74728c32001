//! Path resolution.
//!
//! Only one inode is locked at a time while walking, so walking ".." can
//! never deadlock against a walk going the other way.

use super::*;
use error::FsError;
use fs::FileSystem;
use inode::Inode;
use trans::OpContext;

use std::sync::Arc;

/// Split off the first element of `path`:
///
///   skip_elem("a/bb/c") = Some(("a", "bb/c"))
///   skip_elem("///a//bb") = Some(("a", "bb"))
///   skip_elem("a") = Some(("a", ""))
///   skip_elem("") = skip_elem("////") = None
fn skip_elem(path: &str) -> Result<Option<(&str, &str)>> {
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        return Ok(None);
    }
    let (name, rest) = path.split_once('/').unwrap_or((path, ""));
    if name.len() > FILE_NAME_MAX_LENGTH {
        return Err(FsError::NameTooLong);
    }
    Ok(Some((name, rest.trim_start_matches('/'))))
}

impl FileSystem {
    fn walk(
        &self,
        ctx: &mut OpContext,
        cwd: Option<&Arc<Inode>>,
        path: &str,
        want_parent: bool,
    ) -> Result<(Arc<Inode>, String)> {
        let tree = self.inodes();
        let mut inode = match cwd {
            Some(cwd) if !path.starts_with('/') => tree.share(cwd),
            _ => tree.get(ROOT_INODE_NO),
        };

        let mut rest = path;
        loop {
            let (name, next) = match skip_elem(rest) {
                Ok(Some(elem)) => elem,
                Ok(None) => break,
                Err(err) => {
                    tree.put(ctx, inode);
                    return Err(err);
                }
            };

            let mut dir = tree.lock(&inode);
            if !dir.is_dir() {
                drop(dir);
                tree.put(ctx, inode);
                return Err(FsError::NotDirectory);
            }
            if want_parent && next.is_empty() {
                drop(dir);
                return Ok((inode, name.to_string()));
            }
            let found = tree.lookup(&mut dir, name);
            drop(dir);

            let Some((inode_no, _)) = found else {
                tree.put(ctx, inode);
                return Err(FsError::NotFound);
            };
            let next_inode = tree.get(inode_no);
            tree.put(ctx, inode);
            inode = next_inode;
            rest = next;
        }

        if want_parent {
            tree.put(ctx, inode);
            return Err(FsError::InvalidArgument("path has no last element"));
        }
        Ok((inode, String::new()))
    }

    /// Resolve `path`, relative to `cwd` (the root when absent) unless it
    /// starts with '/'.
    pub fn namei(
        &self,
        ctx: &mut OpContext,
        cwd: Option<&Arc<Inode>>,
        path: &str,
    ) -> Result<Arc<Inode>> {
        self.walk(ctx, cwd, path, false).map(|(inode, _)| inode)
    }

    /// Resolve all but the last element of `path`; returns the parent
    /// directory and the last element.
    pub fn namei_parent(
        &self,
        ctx: &mut OpContext,
        cwd: Option<&Arc<Inode>>,
        path: &str,
    ) -> Result<(Arc<Inode>, String)> {
        self.walk(ctx, cwd, path, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block_device::MemDisk;
    use disk::InodeType;

    fn fs() -> FileSystem {
        let image = MemDisk::new(1000);
        let params = mkfs::MkfsParams {
            num_blocks: 1000,
            num_inodes: 64,
            num_log_blocks: 31,
        };
        mkfs::mkfs(&image, &params).unwrap();
        FileSystem::open(Arc::new(image), Config::default()).unwrap()
    }

    #[test]
    fn test_skip_elem() {
        assert_eq!(skip_elem("a/bb/c").unwrap(), Some(("a", "bb/c")));
        assert_eq!(skip_elem("///a//bb").unwrap(), Some(("a", "bb")));
        assert_eq!(skip_elem("a").unwrap(), Some(("a", "")));
        assert_eq!(skip_elem("a/").unwrap(), Some(("a", "")));
        assert_eq!(skip_elem("").unwrap(), None);
        assert_eq!(skip_elem("////").unwrap(), None);
        assert!(matches!(
            skip_elem("abcdefghijklmno/x"),
            Err(FsError::NameTooLong)
        ));
    }

    #[test]
    fn test_namei_walks_directories() {
        let fs = fs();
        let tree = fs.inodes();
        fs.transaction(|ctx| {
            let root = tree.get(ROOT_INODE_NO);
            let a = tree.create(ctx, &root, "a", InodeType::Directory, 0, 0).unwrap();
            let b = tree.create(ctx, &a, "b", InodeType::Regular, 0, 0).unwrap();
            let b_no = b.inode_no();
            for inode in [root, a, b] {
                tree.put(ctx, inode);
            }

            let found = fs.namei(ctx, None, "/a//b").unwrap();
            assert_eq!(found.inode_no(), b_no);
            tree.put(ctx, found);

            let root = fs.namei(ctx, None, "/").unwrap();
            assert_eq!(root.inode_no(), ROOT_INODE_NO);
            let dot_dot = fs.namei(ctx, None, "/a/..").unwrap();
            assert_eq!(dot_dot.inode_no(), ROOT_INODE_NO);
            tree.put(ctx, dot_dot);

            let a = fs.namei(ctx, Some(&root), "a").unwrap();
            let relative = fs.namei(ctx, Some(&a), "b").unwrap();
            assert_eq!(relative.inode_no(), b_no);
            for inode in [root, a, relative] {
                tree.put(ctx, inode);
            }
        });
    }

    #[test]
    fn test_namei_errors() {
        let fs = fs();
        let tree = fs.inodes();
        fs.transaction(|ctx| {
            let root = tree.get(ROOT_INODE_NO);
            let file = tree.create(ctx, &root, "f", InodeType::Regular, 0, 0).unwrap();
            tree.put(ctx, file);
            tree.put(ctx, root);

            assert!(matches!(fs.namei(ctx, None, "/nope"), Err(FsError::NotFound)));
            assert!(matches!(fs.namei(ctx, None, "/f/x"), Err(FsError::NotDirectory)));
            assert!(matches!(
                fs.namei(ctx, None, "/abcdefghijklmnop"),
                Err(FsError::NameTooLong)
            ));
            assert!(matches!(
                fs.namei_parent(ctx, None, "/"),
                Err(FsError::InvalidArgument(_))
            ));

            let (parent, name) = fs.namei_parent(ctx, None, "/f").unwrap();
            assert_eq!((parent.inode_no(), name.as_str()), (ROOT_INODE_NO, "f"));
            tree.put(ctx, parent);
        });
        // every reference taken while walking was given back
        assert_eq!(fs.inodes().get(ROOT_INODE_NO).ref_count(), 1);
    }
}
