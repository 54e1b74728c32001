//! FUSE front end. Kernel inode numbers are file system inode numbers, so
//! the root is 1 on both sides.

use super::*;
use disk::InodeType;
use error::FsError;
use fs::FileSystem;
use inode::{Inode, Stat};
use trans::OpContext;

use fuser::{
    FileAttr, FileType, Filesystem, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request,
};
use log::{debug, warn};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

impl From<InodeType> for FileType {
    fn from(typ: InodeType) -> Self {
        match typ {
            InodeType::Directory => FileType::Directory,
            InodeType::Regular => FileType::RegularFile,
            InodeType::Device => FileType::CharDevice,
            InodeType::Invalid => panic!("file type of a free inode"),
        }
    }
}

fn device_number(major: u16, minor: u16) -> u32 {
    ((major as u32) << 8) | minor as u32
}

fn file_name(name: &OsStr) -> Result<&str> {
    name.to_str()
        .ok_or(FsError::InvalidArgument("file name is not UTF-8"))
}

pub struct LogFs {
    fs: Arc<FileSystem>,
    /// inodes the kernel holds open, by file handle
    handles: HashMap<u64, Arc<Inode>>,
    next_handle: u64,
    uid: u32,
    gid: u32,
}

impl LogFs {
    const TTL: Duration = Duration::from_secs(1);
    const GENERATION: u64 = 0;

    pub fn new(fs: Arc<FileSystem>) -> Self {
        Self {
            fs,
            handles: HashMap::new(),
            next_handle: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        }
    }

    pub fn num_handles(&self) -> usize {
        self.handles.len()
    }

    fn attr(&self, stat: &Stat) -> FileAttr {
        FileAttr {
            ino: stat.inode_no as u64,
            size: stat.num_bytes as u64,
            blocks: stat.num_bytes.div_ceil(BSIZE) as u64,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: stat.typ.into(),
            perm: if stat.typ == InodeType::Directory {
                0o755
            } else {
                0o644
            },
            nlink: stat.num_links as u32,
            uid: self.uid,
            gid: self.gid,
            rdev: device_number(stat.major, stat.minor),
            blksize: BSIZE as u32,
            flags: 0,
        }
    }

    fn stat(&self, inode: &Arc<Inode>) -> Stat {
        self.fs.inodes().lock(inode).stat()
    }

    /// Reference `ino`, rejecting numbers of free inodes.
    fn get(&self, ino: u64) -> Result<Arc<Inode>> {
        let tree = self.fs.inodes();
        let inode_no = ino as usize;
        if !tree.is_allocated(inode_no) {
            return Err(FsError::NotFound);
        }
        Ok(tree.get(inode_no))
    }

    /// Run `f` on `ino` inside one transaction.
    fn with_inode<T>(
        &self,
        ino: u64,
        f: impl FnOnce(&mut OpContext, &Arc<Inode>) -> Result<T>,
    ) -> Result<T> {
        self.fs.transaction(|ctx| {
            let inode = self.get(ino)?;
            let out = f(ctx, &inode);
            self.fs.inodes().put(ctx, inode);
            out
        })
    }

    fn lookup_entry(&self, parent: u64, name: &str) -> Result<FileAttr> {
        let tree = self.fs.inodes();
        self.with_inode(parent, |ctx, dir| {
            let found = {
                let mut guard = tree.lock(dir);
                if !guard.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                tree.lookup(&mut guard, name)
            };
            let (inode_no, _) = found.ok_or(FsError::NotFound)?;
            let inode = tree.get(inode_no);
            let attr = self.attr(&self.stat(&inode));
            tree.put(ctx, inode);
            Ok(attr)
        })
    }

    /// Create `name` in `parent`, returning the new inode with one
    /// reference held.
    fn create_entry(
        &self,
        parent: u64,
        name: &str,
        typ: InodeType,
        major: u16,
        minor: u16,
    ) -> Result<(FileAttr, Arc<Inode>)> {
        let tree = self.fs.inodes();
        self.with_inode(parent, |ctx, dir| {
            let inode = tree.create(ctx, dir, name, typ, major, minor)?;
            Ok((self.attr(&self.stat(&inode)), inode))
        })
    }

    fn release_inode(&self, inode: Arc<Inode>) {
        self.fs.transaction(|ctx| self.fs.inodes().put(ctx, inode));
    }

    fn remove_entry(&self, parent: u64, name: &str, want_dir: bool) -> Result<()> {
        let tree = self.fs.inodes();
        self.with_inode(parent, |ctx, dir| {
            let found = {
                let mut guard = tree.lock(dir);
                if !guard.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                tree.lookup(&mut guard, name)
            };
            let (inode_no, _) = found.ok_or(FsError::NotFound)?;
            let inode = tree.get(inode_no);
            let is_dir = tree.lock(&inode).is_dir();
            tree.put(ctx, inode);
            match (want_dir, is_dir) {
                (true, false) => Err(FsError::NotDirectory),
                (false, true) => Err(FsError::IsDirectory),
                _ => tree.unlink(ctx, dir, name),
            }
        })
    }

    fn read_inode(&self, ino: u64, offset: usize, size: usize) -> Result<Vec<u8>> {
        let tree = self.fs.inodes();
        let inode = self.get(ino)?;
        let data = {
            let mut guard = tree.lock(&inode);
            if guard.is_dir() {
                Err(FsError::IsDirectory)
            } else {
                let mut data = vec![0u8; size.min(guard.num_bytes().saturating_sub(offset))];
                let n = tree.read(&mut guard, &mut data, offset);
                data.truncate(n);
                Ok(data)
            }
        };
        self.release_inode(inode);
        data
    }

    /// Writes past the end zero-fill the gap first; files have no holes.
    fn write_inode(&self, ino: u64, offset: usize, data: &[u8]) -> Result<usize> {
        let inode = self.get(ino)?;
        let size = self.stat(&inode).num_bytes;
        let filled = if offset > size {
            self.fs.resize(&inode, offset)
        } else {
            Ok(())
        };
        let written = filled.and_then(|()| self.fs.write_inode(&inode, data, offset));
        self.release_inode(inode);
        written
    }

    fn set_size(&self, ino: u64, size: usize) -> Result<FileAttr> {
        let inode = self.get(ino)?;
        let attr = self
            .fs
            .resize(&inode, size)
            .map(|()| self.attr(&self.stat(&inode)));
        self.release_inode(inode);
        attr
    }

    fn read_directory(&self, ino: u64) -> Result<Vec<(String, u64, FileType)>> {
        let tree = self.fs.inodes();
        self.with_inode(ino, |ctx, dir| {
            let entries = {
                let mut guard = tree.lock(dir);
                if !guard.is_dir() {
                    return Err(FsError::NotDirectory);
                }
                tree.read_dir(&mut guard)
            };
            let mut listing = Vec::with_capacity(entries.len());
            for (name, inode_no, _) in entries {
                let inode = tree.get(inode_no);
                let typ = tree.lock(&inode).typ();
                tree.put(ctx, inode);
                listing.push((name, inode_no as u64, typ.into()));
            }
            Ok(listing)
        })
    }

    fn link_entry(&self, ino: u64, newparent: u64, newname: &str) -> Result<FileAttr> {
        let tree = self.fs.inodes();
        self.with_inode(ino, |ctx, inode| {
            let dir = self.get(newparent)?;
            let linked = tree.link(ctx, &dir, newname, inode);
            tree.put(ctx, dir);
            linked.map(|()| self.attr(&self.stat(inode)))
        })
    }

    fn add_handle(&mut self, inode: Arc<Inode>) -> u64 {
        let fh = self.next_handle;
        self.next_handle += 1;
        self.handles.insert(fh, inode);
        fh
    }
}

impl Filesystem for LogFs {
    fn destroy(&mut self) {
        if !self.handles.is_empty() {
            warn!("unmounting with {} open handles", self.handles.len());
        }
        for (_, inode) in std::mem::take(&mut self.handles) {
            self.release_inode(inode);
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let sb = self.fs.super_block();
        let free_blocks = self.fs.num_free_blocks() as u64;
        reply.statfs(
            sb.num_blocks as u64,
            free_blocks,
            free_blocks,
            sb.num_inodes as u64 - 1,
            self.fs.inodes().num_free_inodes() as u64,
            BSIZE as u32,
            FILE_NAME_MAX_LENGTH as u32,
            BSIZE as u32,
        );
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match file_name(name).and_then(|name| self.lookup_entry(parent, name)) {
            Ok(attr) => reply.entry(&Self::TTL, &attr, Self::GENERATION),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, reply: ReplyAttr) {
        match self.with_inode(ino, |_, inode| Ok(self.attr(&self.stat(inode)))) {
            Ok(attr) => reply.attr(&Self::TTL, &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<fuser::TimeOrNow>,
        _mtime: Option<fuser::TimeOrNow>,
        _ctime: Option<std::time::SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<std::time::SystemTime>,
        _chgtime: Option<std::time::SystemTime>,
        _bkuptime: Option<std::time::SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let attr = match size {
            Some(size) => self.set_size(ino, size as usize),
            // nothing else is stored
            None => self.with_inode(ino, |_, inode| Ok(self.attr(&self.stat(inode)))),
        };
        match attr {
            Ok(attr) => reply.attr(&Self::TTL, &attr),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.get(ino) {
            Ok(inode) => {
                let fh = self.add_handle(inode);
                reply.opened(fh, flags as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.handles.remove(&fh) {
            Some(inode) => {
                self.release_inode(inode);
                reply.ok();
            }
            None => reply.error(libc::EBADF),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock: Option<u64>,
        reply: ReplyData,
    ) {
        match self.read_inode(ino, offset as usize, size as usize) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.write_inode(ino, offset as usize, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.read_directory(ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };

        let _ = entries
            .into_iter()
            .enumerate()
            .skip(offset as usize)
            .try_for_each(|(i, (name, inode_no, kind))| {
                if reply.add(inode_no, (i + 1) as i64, kind, name) {
                    return ControlFlow::Break(());
                }
                ControlFlow::Continue(())
            });
        reply.ok();
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let created = file_name(name)
            .and_then(|name| self.create_entry(parent, name, InodeType::Regular, 0, 0));
        match created {
            Ok((attr, inode)) => {
                let fh = self.add_handle(inode);
                reply.created(&Self::TTL, &attr, Self::GENERATION, fh, flags as u32);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let created = file_name(name)
            .and_then(|name| self.create_entry(parent, name, InodeType::Directory, 0, 0));
        match created {
            Ok((attr, inode)) => {
                self.release_inode(inode);
                reply.entry(&Self::TTL, &attr, Self::GENERATION);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let (typ, major, minor) = match mode & libc::S_IFMT {
            libc::S_IFREG => (InodeType::Regular, 0, 0),
            libc::S_IFCHR => (InodeType::Device, (rdev >> 8) as u16, (rdev & 0xff) as u16),
            other => {
                debug!("mknod: unsupported file type {other:o}");
                reply.error(libc::EINVAL);
                return;
            }
        };
        let created =
            file_name(name).and_then(|name| self.create_entry(parent, name, typ, major, minor));
        match created {
            Ok((attr, inode)) => {
                self.release_inode(inode);
                reply.entry(&Self::TTL, &attr, Self::GENERATION);
            }
            Err(err) => reply.error(err.errno()),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        match file_name(newname).and_then(|name| self.link_entry(ino, newparent, name)) {
            Ok(attr) => reply.entry(&Self::TTL, &attr, Self::GENERATION),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match file_name(name).and_then(|name| self.remove_entry(parent, name, false)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match file_name(name).and_then(|name| self.remove_entry(parent, name, true)) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }
}
