//! Open file table: descriptors and the current directory of one client.

use super::*;
use disk::InodeType;
use error::FsError;
use fs::FileSystem;
use inode::{Inode, Stat};
use trans::OpContext;

use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub read: bool,
    pub write: bool,
    pub create: bool,
    pub truncate: bool,
}

impl OpenFlags {
    pub const READ: OpenFlags = OpenFlags {
        read: true,
        write: false,
        create: false,
        truncate: false,
    };

    pub const READ_WRITE: OpenFlags = OpenFlags {
        read: true,
        write: true,
        create: false,
        truncate: false,
    };

    pub const CREATE: OpenFlags = OpenFlags {
        read: true,
        write: true,
        create: true,
        truncate: false,
    };
}

/// An open file, shared by every descriptor duplicated from it.
pub struct File {
    inode: Arc<Inode>,
    readable: bool,
    writable: bool,
    offset: Mutex<usize>,
}

pub struct FileTable {
    fs: Arc<FileSystem>,
    /// None stands for the root directory
    cwd: Option<Arc<Inode>>,
    files: Vec<Option<Arc<File>>>,
}

impl FileTable {
    pub fn new(fs: Arc<FileSystem>) -> Self {
        let max_open_files = fs.config().max_open_files;
        Self {
            fs,
            cwd: None,
            files: vec![None; max_open_files],
        }
    }

    fn file(&self, fd: usize) -> Result<&Arc<File>> {
        self.files
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(FsError::BadDescriptor)
    }

    fn free_slot(&self) -> Result<usize> {
        self.files
            .iter()
            .position(Option::is_none)
            .ok_or(FsError::TooManyOpenFiles)
    }

    fn open_inode(&self, ctx: &mut OpContext, path: &str, flags: OpenFlags) -> Result<Arc<Inode>> {
        let fs = &self.fs;
        let tree = fs.inodes();
        let inode = if flags.create {
            let (dir, name) = fs.namei_parent(ctx, self.cwd.as_ref(), path)?;
            let existing = {
                let mut guard = tree.lock(&dir);
                tree.lookup(&mut guard, &name)
            };
            let created = match existing {
                Some((inode_no, _)) => Ok(tree.get(inode_no)),
                None => tree.create(ctx, &dir, &name, InodeType::Regular, 0, 0),
            };
            tree.put(ctx, dir);
            created?
        } else {
            fs.namei(ctx, self.cwd.as_ref(), path)?
        };

        let mut guard = tree.lock(&inode);
        let checked = if guard.is_dir() && (flags.write || flags.truncate) {
            Err(FsError::IsDirectory)
        } else if !flags.read && !flags.write {
            Err(FsError::InvalidArgument("open for neither reading nor writing"))
        } else if flags.truncate && guard.typ() == InodeType::Regular {
            tree.truncate(ctx, &mut guard, 0)
        } else {
            Ok(())
        };
        drop(guard);
        match checked {
            Ok(()) => Ok(inode),
            Err(err) => {
                tree.put(ctx, inode);
                Err(err)
            }
        }
    }

    pub fn open(&mut self, path: &str, flags: OpenFlags) -> Result<usize> {
        let fd = self.free_slot()?;
        let inode = self.fs.transaction(|ctx| self.open_inode(ctx, path, flags))?;
        self.files[fd] = Some(Arc::new(File {
            inode,
            readable: flags.read,
            writable: flags.write,
            offset: Mutex::new(0),
        }));
        Ok(fd)
    }

    /// New descriptor sharing the open file, offset included.
    pub fn dup(&mut self, fd: usize) -> Result<usize> {
        let file = Arc::clone(self.file(fd)?);
        let new_fd = self.free_slot()?;
        self.files[new_fd] = Some(file);
        Ok(new_fd)
    }

    pub fn close(&mut self, fd: usize) -> Result<()> {
        let file = self
            .files
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(FsError::BadDescriptor)?;
        if let Some(file) = Arc::into_inner(file) {
            let tree = self.fs.inodes();
            self.fs.transaction(|ctx| tree.put(ctx, file.inode));
        }
        Ok(())
    }

    pub fn close_all(&mut self) {
        for fd in 0..self.files.len() {
            if self.files[fd].is_some() {
                // the slot is in use, so closing cannot fail
                let _ = self.close(fd);
            }
        }
        if let Some(cwd) = self.cwd.take() {
            let tree = self.fs.inodes();
            self.fs.transaction(|ctx| tree.put(ctx, cwd));
        }
    }

    fn read_file(&self, file: &File, buf: &mut [u8], offset: usize) -> Result<usize> {
        if !file.readable {
            return Err(FsError::BadDescriptor);
        }
        let tree = self.fs.inodes();
        let mut guard = tree.lock(&file.inode);
        Ok(tree.read(&mut guard, buf, offset))
    }

    fn write_file(&self, file: &File, buf: &[u8], offset: usize) -> Result<usize> {
        if !file.writable {
            return Err(FsError::BadDescriptor);
        }
        self.fs.write_inode(&file.inode, buf, offset)
    }

    pub fn read(&self, fd: usize, buf: &mut [u8]) -> Result<usize> {
        let file = self.file(fd)?;
        let mut offset = file.offset.lock();
        let n = self.read_file(file, buf, *offset)?;
        *offset += n;
        Ok(n)
    }

    pub fn write(&self, fd: usize, buf: &[u8]) -> Result<usize> {
        let file = self.file(fd)?;
        let mut offset = file.offset.lock();
        let n = self.write_file(file, buf, *offset)?;
        *offset += n;
        Ok(n)
    }

    pub fn read_at(&self, fd: usize, buf: &mut [u8], offset: usize) -> Result<usize> {
        self.read_file(self.file(fd)?, buf, offset)
    }

    pub fn write_at(&self, fd: usize, buf: &[u8], offset: usize) -> Result<usize> {
        self.write_file(self.file(fd)?, buf, offset)
    }

    pub fn seek(&self, fd: usize, offset: usize) -> Result<()> {
        *self.file(fd)?.offset.lock() = offset;
        Ok(())
    }

    pub fn fstat(&self, fd: usize) -> Result<Stat> {
        let file = self.file(fd)?;
        Ok(self.fs.inodes().lock(&file.inode).stat())
    }

    pub fn chdir(&mut self, path: &str) -> Result<()> {
        let tree = self.fs.inodes();
        let cwd = self.cwd.take();
        let result = self.fs.transaction(|ctx| {
            let inode = match self.fs.namei(ctx, cwd.as_ref(), path) {
                Ok(inode) => inode,
                Err(err) => return (cwd, Err(err)),
            };
            if !tree.lock(&inode).is_dir() {
                tree.put(ctx, inode);
                return (cwd, Err(FsError::NotDirectory));
            }
            if let Some(old) = cwd {
                tree.put(ctx, old);
            }
            (Some(inode), Ok(()))
        });
        self.cwd = result.0;
        result.1
    }

    /// A copy of the table for a child: same open files, same directory.
    pub fn fork(&self) -> FileTable {
        FileTable {
            fs: Arc::clone(&self.fs),
            cwd: self.cwd.as_ref().map(|cwd| self.fs.inodes().share(cwd)),
            files: self.files.clone(),
        }
    }

    pub fn num_open(&self) -> usize {
        self.files.iter().filter(|file| file.is_some()).count()
    }
}

impl Drop for FileTable {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            self.close_all();
        }
    }
}
