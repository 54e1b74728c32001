//! Inode tree.
//!
//! In-memory inodes are shared through `Arc<Inode>` handles that each stand
//! for one counted reference, obtained from `get`/`share` and handed back to
//! `put`. The list lock guards membership and every `Lifetime` transition;
//! the per-inode lock guards the cached entry. The list lock is never held
//! while waiting for an inode lock or doing I/O.

use super::*;
use block_cache::BlockCache;
use disk::{indirect_addr, set_indirect_addr, DirEntry, InodeEntry, InodeType, SuperBlock};
use error::FsError;
use trans::OpContext;

use log::trace;
use parking_lot::{Mutex, MutexGuard};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifetime {
    /// kept in the list for reuse, nobody holds it
    Cached,
    Referenced(usize),
    /// last reference dropped with no links left, being cleared; stays
    /// listed until the invalid entry is synced
    PendingFree,
}

struct InodeState {
    /// inode has been read from disk?
    valid: bool,
    /// copy of disk inode
    entry: InodeEntry,
}

/// inode in memory
pub struct Inode {
    inode_no: usize,
    /// changed only under the list lock
    lifetime: Mutex<Lifetime>,
    state: Mutex<InodeState>,
}

impl Inode {
    fn new(inode_no: usize) -> Self {
        Self {
            inode_no,
            lifetime: Mutex::new(Lifetime::Referenced(1)),
            state: Mutex::new(InodeState {
                valid: false,
                entry: InodeEntry::default(),
            }),
        }
    }

    pub fn inode_no(&self) -> usize {
        self.inode_no
    }

    /// References currently handed out.
    pub fn ref_count(&self) -> usize {
        match *self.lifetime.lock() {
            Lifetime::Referenced(n) => n,
            Lifetime::Cached | Lifetime::PendingFree => 0,
        }
    }
}

/// A locked inode.
pub struct InodeGuard<'a> {
    inode: &'a Inode,
    state: MutexGuard<'a, InodeState>,
}

impl InodeGuard<'_> {
    pub fn inode_no(&self) -> usize {
        self.inode.inode_no
    }

    pub fn entry(&self) -> &InodeEntry {
        &self.state.entry
    }

    pub fn entry_mut(&mut self) -> &mut InodeEntry {
        &mut self.state.entry
    }

    pub fn typ(&self) -> InodeType {
        self.state.entry.typ
    }

    pub fn num_bytes(&self) -> usize {
        self.state.entry.num_bytes as usize
    }

    pub fn num_links(&self) -> usize {
        self.state.entry.num_links as usize
    }

    pub fn is_dir(&self) -> bool {
        self.typ() == InodeType::Directory
    }

    pub fn stat(&self) -> Stat {
        let entry = &self.state.entry;
        Stat {
            inode_no: self.inode.inode_no,
            typ: entry.typ,
            num_links: entry.num_links as usize,
            num_bytes: entry.num_bytes as usize,
            major: entry.major,
            minor: entry.minor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub inode_no: usize,
    pub typ: InodeType,
    pub num_links: usize,
    pub num_bytes: usize,
    pub major: u16,
    pub minor: u16,
}

#[derive(Default)]
struct InodeList {
    inodes: HashMap<usize, Arc<Inode>>,
    /// unreferenced inodes, most recently released first
    cached: VecDeque<usize>,
}

impl InodeList {
    fn uncache(&mut self, inode_no: usize) {
        if let Some(pos) = self.cached.iter().position(|&no| no == inode_no) {
            self.cached.remove(pos);
        }
    }

    fn shrink_to(&mut self, capacity: usize) {
        while self.inodes.len() > capacity {
            let Some(inode_no) = self.cached.pop_back() else {
                break;
            };
            self.inodes.remove(&inode_no);
        }
    }
}

pub struct InodeTree {
    sb: SuperBlock,
    cache: Arc<BlockCache>,
    list: Mutex<InodeList>,
    capacity: usize,
}

impl InodeTree {
    pub fn new(cache: Arc<BlockCache>, capacity: usize) -> Self {
        Self {
            sb: *cache.super_block(),
            cache,
            list: Mutex::new(InodeList::default()),
            capacity,
        }
    }

    pub fn block_cache(&self) -> &BlockCache {
        &self.cache
    }

    /// Claim a free on-disk inode slot for `typ`.
    pub fn alloc(&self, ctx: &mut OpContext, typ: InodeType) -> usize {
        assert_ne!(typ, InodeType::Invalid);
        let num_inodes = self.sb.num_inodes as usize;
        for inode_no in ROOT_INODE_NO..num_inodes {
            let mut block = self.cache.acquire(self.sb.inode_block(inode_no));
            if InodeEntry::load(block.data(), inode_no).typ != InodeType::Invalid {
                continue;
            }
            let entry = InodeEntry {
                typ,
                ..Default::default()
            };
            entry.store(block.data_mut(), inode_no);
            self.cache.sync(Some(ctx), &block);
            trace!("alloc inode {inode_no} as {typ:?}");
            return inode_no;
        }
        panic!("ialloc: no inodes");
    }

    /// Find the in-memory inode `inode_no`, loading it on first use. An
    /// inode still being freed by its last `put` is waited out first.
    pub fn get(&self, inode_no: usize) -> Arc<Inode> {
        assert!(
            inode_no > 0 && inode_no < self.sb.num_inodes as usize,
            "get of inode {inode_no} out of range"
        );
        loop {
            let mut list = self.list.lock();
            if let Some(inode) = list.inodes.get(&inode_no).cloned() {
                let freeing = {
                    let mut lifetime = inode.lifetime.lock();
                    let current = *lifetime;
                    match current {
                        Lifetime::Referenced(n) => *lifetime = Lifetime::Referenced(n + 1),
                        Lifetime::Cached => *lifetime = Lifetime::Referenced(1),
                        Lifetime::PendingFree => {}
                    }
                    current == Lifetime::PendingFree
                };
                if !freeing {
                    list.uncache(inode_no);
                }
                drop(list);
                // wait out a load or a free still in flight
                drop(inode.state.lock());
                if freeing {
                    std::thread::yield_now();
                    continue;
                }
                return inode;
            }

            let inode = Arc::new(Inode::new(inode_no));
            let mut state = inode.state.lock();
            list.inodes.insert(inode_no, Arc::clone(&inode));
            list.shrink_to(self.capacity);
            drop(list);
            self.load(&mut state, inode_no);
            drop(state);
            return inode;
        }
    }

    fn load(&self, state: &mut InodeState, inode_no: usize) {
        let block = self.cache.acquire(self.sb.inode_block(inode_no));
        state.entry = InodeEntry::load(block.data(), inode_no);
        state.valid = true;
        assert_ne!(
            state.entry.typ,
            InodeType::Invalid,
            "get of unallocated inode {inode_no}"
        );
    }

    /// Hand out one more reference.
    pub fn share(&self, inode: &Arc<Inode>) -> Arc<Inode> {
        let _list = self.list.lock();
        let mut lifetime = inode.lifetime.lock();
        let current = *lifetime;
        match current {
            Lifetime::Referenced(n) => *lifetime = Lifetime::Referenced(n + 1),
            other => panic!("share of inode {} in state {other:?}", inode.inode_no),
        }
        Arc::clone(inode)
    }

    /// Drop a reference. The last reference to an inode without links
    /// frees it on disk.
    pub fn put(&self, ctx: &mut OpContext, inode: Arc<Inode>) {
        let mut list = self.list.lock();
        let mut lifetime = inode.lifetime.lock();
        let current = *lifetime;
        match current {
            Lifetime::Referenced(1) => {}
            Lifetime::Referenced(n) => {
                *lifetime = Lifetime::Referenced(n - 1);
                return;
            }
            other => panic!("put of inode {} in state {other:?}", inode.inode_no),
        }

        // the only holder cannot be holding the lock while giving up its
        // reference, so this never waits
        let Some(state) = inode.state.try_lock() else {
            panic!("put of inode {} while it is locked", inode.inode_no);
        };
        if !(state.valid && state.entry.num_links == 0) {
            *lifetime = Lifetime::Cached;
            drop(lifetime);
            drop(state);
            list.cached.push_front(inode.inode_no);
            list.shrink_to(self.capacity);
            return;
        }

        // stays listed until the cleared entry is synced, so a concurrent
        // `get` waits instead of loading a second copy
        *lifetime = Lifetime::PendingFree;
        drop(lifetime);
        drop(list);

        let mut guard = InodeGuard {
            inode: &*inode,
            state,
        };
        self.clear(ctx, &mut guard);
        guard.entry_mut().typ = InodeType::Invalid;
        self.sync(Some(ctx), &mut guard, true);
        guard.state.valid = false;
        drop(guard);
        self.list.lock().inodes.remove(&inode.inode_no);
        trace!("free inode {}", inode.inode_no);
    }

    /// Lock `inode`, which must be referenced.
    pub fn lock<'a>(&self, inode: &'a Arc<Inode>) -> InodeGuard<'a> {
        assert!(
            inode.ref_count() > 0,
            "lock of unreferenced inode {}",
            inode.inode_no
        );
        let mut guard = InodeGuard {
            inode: &**inode,
            state: inode.state.lock(),
        };
        if !guard.state.valid {
            self.sync(None, &mut guard, false);
        }
        guard
    }

    pub fn unlock(&self, guard: InodeGuard<'_>) {
        drop(guard);
    }

    /// Write the cached entry back when `do_write` holds and it is valid;
    /// load it from disk when it is not yet valid.
    pub fn sync(&self, ctx: Option<&mut OpContext>, inode: &mut InodeGuard<'_>, do_write: bool) {
        let inode_no = inode.inode.inode_no;
        if !inode.state.valid {
            self.load(&mut inode.state, inode_no);
        } else if do_write {
            let mut block = self.cache.acquire(self.sb.inode_block(inode_no));
            inode.state.entry.store(block.data_mut(), inode_no);
            self.cache.sync(ctx, &block);
        }
    }

    /// Physical block holding logical block `index` of `inode`. Without a
    /// transaction nothing is allocated and holes map to `None`.
    pub fn map(
        &self,
        ctx: Option<&mut OpContext>,
        inode: &mut InodeGuard<'_>,
        index: usize,
    ) -> Option<usize> {
        match ctx {
            Some(ctx) => Some(self.map_alloc(ctx, inode, index)),
            None => self.map_existing(inode, index),
        }
    }

    fn map_existing(&self, inode: &InodeGuard<'_>, index: usize) -> Option<usize> {
        let entry = inode.entry();
        let block_no = if index < INODE_NUM_DIRECT {
            entry.addrs[index]
        } else {
            let index = index - INODE_NUM_DIRECT;
            assert!(index < INODE_NUM_INDIRECT, "inode_map: out of range");
            if entry.indirect == 0 {
                return None;
            }
            let block = self.cache.acquire(entry.indirect as usize);
            indirect_addr(block.data(), index)
        };
        (block_no != 0).then_some(block_no as usize)
    }

    fn map_alloc(&self, ctx: &mut OpContext, inode: &mut InodeGuard<'_>, index: usize) -> usize {
        if index < INODE_NUM_DIRECT {
            let addr = inode.entry().addrs[index];
            if addr != 0 {
                return addr as usize;
            }
            let block_no = self.cache.alloc(ctx);
            inode.entry_mut().addrs[index] = block_no as u32;
            return block_no;
        }

        let index = index - INODE_NUM_DIRECT;
        assert!(index < INODE_NUM_INDIRECT, "inode_map: out of range");
        if inode.entry().indirect == 0 {
            inode.entry_mut().indirect = self.cache.alloc(ctx) as u32;
        }
        let mut block = self.cache.acquire(inode.entry().indirect as usize);
        let addr = indirect_addr(block.data(), index);
        if addr != 0 {
            return addr as usize;
        }
        let block_no = self.cache.alloc(ctx);
        set_indirect_addr(block.data_mut(), index, block_no as u32);
        self.cache.sync(Some(ctx), &block);
        block_no
    }

    /// Read from `offset` into `dest`, stopping at the end of the file.
    pub fn read(&self, inode: &mut InodeGuard<'_>, dest: &mut [u8], offset: usize) -> usize {
        let num_bytes = inode.num_bytes();
        if offset >= num_bytes {
            return 0;
        }
        let count = dest.len().min(num_bytes - offset);
        let mut done = 0;
        while done < count {
            let pos = offset + done;
            let Some(block_no) = self.map(None, inode, pos / BSIZE) else {
                break;
            };
            let block = self.cache.acquire(block_no);
            let start = pos % BSIZE;
            let len = (BSIZE - start).min(count - done);
            dest[done..done + len].copy_from_slice(&block.data()[start..start + len]);
            done += len;
        }
        done
    }

    /// Write `src` at `offset`, growing the file if it ends past its end.
    pub fn write(
        &self,
        ctx: &mut OpContext,
        inode: &mut InodeGuard<'_>,
        src: &[u8],
        offset: usize,
    ) -> Result<usize> {
        if offset > inode.num_bytes() {
            return Err(FsError::InvalidArgument("write starts past end of file"));
        }
        let end = offset
            .checked_add(src.len())
            .filter(|&end| end <= INODE_MAX_BYTES)
            .ok_or(FsError::FileTooLarge)?;

        let before = *inode.entry();
        let mut done = 0;
        while done < src.len() {
            let pos = offset + done;
            let block_no = self.map_alloc(ctx, inode, pos / BSIZE);
            let mut block = self.cache.acquire(block_no);
            let start = pos % BSIZE;
            let len = (BSIZE - start).min(src.len() - done);
            block.data_mut()[start..start + len].copy_from_slice(&src[done..done + len]);
            self.cache.sync(Some(&mut *ctx), &block);
            done += len;
        }

        if end > inode.num_bytes() {
            inode.entry_mut().num_bytes = end as u32;
        }
        if *inode.entry() != before {
            self.sync(Some(ctx), inode, true);
        }
        Ok(done)
    }

    fn dir_entry_at(&self, dir: &mut InodeGuard<'_>, offset: usize) -> DirEntry {
        let mut buf = [0u8; DIR_ENTRY_SIZE];
        let n = self.read(dir, &mut buf, offset);
        assert_eq!(n, DIR_ENTRY_SIZE, "short directory read at {offset}");
        DirEntry::decode(&buf)
    }

    /// Find `name` in `dir`: its inode number and the entry's offset.
    pub fn lookup(&self, dir: &mut InodeGuard<'_>, name: &str) -> Option<(usize, usize)> {
        assert!(dir.is_dir(), "lookup in non-directory {}", dir.inode_no());
        (0..dir.num_bytes())
            .step_by(DIR_ENTRY_SIZE)
            .find_map(|offset| {
                let entry = self.dir_entry_at(dir, offset);
                (entry.inode_no != 0 && entry.matches(name))
                    .then_some((entry.inode_no as usize, offset))
            })
    }

    /// Add `name -> inode_no` to `dir`, reusing the first free slot.
    /// Returns the entry's offset.
    pub fn insert(
        &self,
        ctx: &mut OpContext,
        dir: &mut InodeGuard<'_>,
        name: &str,
        inode_no: usize,
    ) -> Result<usize> {
        let entry = DirEntry::new(inode_no, name)?;
        if self.lookup(dir, name).is_some() {
            return Err(FsError::Exists);
        }
        let offset = (0..dir.num_bytes())
            .step_by(DIR_ENTRY_SIZE)
            .find(|&offset| self.dir_entry_at(dir, offset).inode_no == 0)
            .unwrap_or(dir.num_bytes());
        self.write(ctx, dir, &entry.encode(), offset)?;
        Ok(offset)
    }

    /// Zero the entry at `offset`. The directory never shrinks.
    pub fn remove(&self, ctx: &mut OpContext, dir: &mut InodeGuard<'_>, offset: usize) {
        assert!(dir.is_dir(), "remove in non-directory {}", dir.inode_no());
        assert!(
            offset % DIR_ENTRY_SIZE == 0 && offset < dir.num_bytes(),
            "remove of bad directory offset {offset}"
        );
        let empty = DirEntry::default().encode();
        if let Err(err) = self.write(ctx, dir, &empty, offset) {
            panic!("remove: rewriting entry at {offset}: {err}");
        }
    }

    /// Entries in use, as (name, inode number, offset).
    pub fn read_dir(&self, dir: &mut InodeGuard<'_>) -> Vec<(String, usize, usize)> {
        assert!(dir.is_dir(), "read_dir of non-directory {}", dir.inode_no());
        (0..dir.num_bytes())
            .step_by(DIR_ENTRY_SIZE)
            .filter_map(|offset| {
                let entry = self.dir_entry_at(dir, offset);
                (entry.inode_no != 0).then(|| (entry.name(), entry.inode_no as usize, offset))
            })
            .collect()
    }

    /// Only "." and ".." left?
    pub fn is_dir_empty(&self, dir: &mut InodeGuard<'_>) -> bool {
        self.read_dir(dir)
            .iter()
            .all(|(name, _, _)| name == "." || name == "..")
    }

    /// Free every block of `inode` from logical block `first` on.
    fn free_blocks_from(&self, ctx: &mut OpContext, inode: &mut InodeGuard<'_>, first: usize) {
        for index in first..INODE_NUM_DIRECT {
            let addr = inode.entry().addrs[index];
            if addr != 0 {
                self.cache.free(ctx, addr as usize);
                inode.entry_mut().addrs[index] = 0;
            }
        }

        let indirect = inode.entry().indirect as usize;
        if indirect == 0 {
            return;
        }
        let first = first.saturating_sub(INODE_NUM_DIRECT);
        let mut block = self.cache.acquire(indirect);
        let mut changed = false;
        for index in first..INODE_NUM_INDIRECT {
            let addr = indirect_addr(block.data(), index);
            if addr != 0 {
                self.cache.free(ctx, addr as usize);
                set_indirect_addr(block.data_mut(), index, 0);
                changed = true;
            }
        }
        if first == 0 {
            drop(block);
            self.cache.free(ctx, indirect);
            inode.entry_mut().indirect = 0;
        } else if changed {
            self.cache.sync(Some(ctx), &block);
        }
    }

    /// Discard the contents of `inode`.
    pub fn clear(&self, ctx: &mut OpContext, inode: &mut InodeGuard<'_>) {
        self.free_blocks_from(ctx, inode, 0);
        inode.entry_mut().num_bytes = 0;
        self.sync(Some(ctx), inode, true);
    }

    /// Shrink `inode` to `size` bytes.
    pub fn truncate(
        &self,
        ctx: &mut OpContext,
        inode: &mut InodeGuard<'_>,
        size: usize,
    ) -> Result<()> {
        if size > inode.num_bytes() {
            return Err(FsError::InvalidArgument("truncate can only shrink"));
        }
        if size == 0 {
            self.clear(ctx, inode);
            return Ok(());
        }
        self.free_blocks_from(ctx, inode, size.div_ceil(BSIZE));
        if size % BSIZE != 0 {
            if let Some(block_no) = self.map_existing(inode, size / BSIZE) {
                let mut block = self.cache.acquire(block_no);
                block.data_mut()[size % BSIZE..].fill(0);
                self.cache.sync(Some(&mut *ctx), &block);
            }
        }
        inode.entry_mut().num_bytes = size as u32;
        self.sync(Some(ctx), inode, true);
        Ok(())
    }

    /// Make a new inode of `typ` named `name` in `dir`. Directories get
    /// "." and ".." and add a link to their parent.
    pub fn create(
        &self,
        ctx: &mut OpContext,
        dir: &Arc<Inode>,
        name: &str,
        typ: InodeType,
        major: u16,
        minor: u16,
    ) -> Result<Arc<Inode>> {
        DirEntry::new(0, name)?;
        let mut parent = self.lock(dir);
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        if self.lookup(&mut parent, name).is_some() {
            return Err(FsError::Exists);
        }

        let inode_no = self.alloc(ctx, typ);
        let inode = self.get(inode_no);
        let mut child = self.lock(&inode);
        {
            let entry = child.entry_mut();
            entry.major = major;
            entry.minor = minor;
            entry.num_links = 1;
        }
        self.sync(Some(&mut *ctx), &mut child, true);

        if typ == InodeType::Directory {
            self.insert(ctx, &mut child, ".", inode_no)?;
            self.insert(ctx, &mut child, "..", parent.inode_no())?;
            parent.entry_mut().num_links += 1;
            self.sync(Some(&mut *ctx), &mut parent, true);
        }
        drop(child);
        self.insert(ctx, &mut parent, name, inode_no)?;
        drop(parent);
        Ok(inode)
    }

    /// Give `inode` another name `name` in `dir`.
    pub fn link(
        &self,
        ctx: &mut OpContext,
        dir: &Arc<Inode>,
        name: &str,
        inode: &Arc<Inode>,
    ) -> Result<()> {
        let mut target = self.lock(inode);
        if target.is_dir() {
            return Err(FsError::PermissionDenied);
        }
        target.entry_mut().num_links += 1;
        self.sync(Some(&mut *ctx), &mut target, true);
        drop(target);

        let mut parent = self.lock(dir);
        let inserted = if parent.is_dir() {
            self.insert(ctx, &mut parent, name, inode.inode_no)
        } else {
            Err(FsError::NotDirectory)
        };
        drop(parent);
        if let Err(err) = inserted {
            let mut target = self.lock(inode);
            target.entry_mut().num_links -= 1;
            self.sync(Some(ctx), &mut target, true);
            return Err(err);
        }
        Ok(())
    }

    /// Remove `name` from `dir`. The inode itself goes away with its last
    /// reference once no links are left.
    pub fn unlink(&self, ctx: &mut OpContext, dir: &Arc<Inode>, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::InvalidArgument("cannot unlink . or .."));
        }
        let mut parent = self.lock(dir);
        if !parent.is_dir() {
            return Err(FsError::NotDirectory);
        }
        let (inode_no, offset) = self.lookup(&mut parent, name).ok_or(FsError::NotFound)?;
        let inode = self.get(inode_no);
        let mut child = self.lock(&inode);
        assert!(child.num_links() > 0, "unlink: inode {inode_no} has no links");
        if child.is_dir() && !self.is_dir_empty(&mut child) {
            drop(child);
            drop(parent);
            self.put(ctx, inode);
            return Err(FsError::NotEmpty);
        }

        self.remove(ctx, &mut parent, offset);
        if child.is_dir() {
            // its ".." entry
            parent.entry_mut().num_links -= 1;
            self.sync(Some(&mut *ctx), &mut parent, true);
        }
        drop(parent);
        child.entry_mut().num_links -= 1;
        self.sync(Some(&mut *ctx), &mut child, true);
        drop(child);
        self.put(ctx, inode);
        Ok(())
    }

    /// Is `inode_no` in range and in use on disk? Lets callers holding
    /// numbers from outside reject stale ones instead of halting in `get`.
    pub fn is_allocated(&self, inode_no: usize) -> bool {
        if inode_no == 0 || inode_no >= self.sb.num_inodes as usize {
            return false;
        }
        let block = self.cache.acquire(self.sb.inode_block(inode_no));
        InodeEntry::load(block.data(), inode_no).typ != InodeType::Invalid
    }

    pub fn num_free_inodes(&self) -> usize {
        (ROOT_INODE_NO..self.sb.num_inodes as usize)
            .filter(|&inode_no| !self.is_allocated(inode_no))
            .count()
    }

    pub fn num_cached_inodes(&self) -> usize {
        self.list.lock().inodes.len()
    }
}
