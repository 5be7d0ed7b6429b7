use std::cell::{OnceCell, RefCell};
use std::collections::HashMap;
use std::io::Read;
use std::num::NonZeroUsize;
use std::rc::Rc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use uuid::Uuid;

use crate::btrfs::Btrfs;
use crate::error::{Error, Result};
use crate::extent::{decode_extent, Extent, ExtentStream, FileStream};
use crate::structures::*;
use crate::tree::{BTree, ItemIter};

const INODE_CACHE_SIZE: usize = 8192;
const PATH_CACHE_SIZE: usize = 1024;
/// Symlink resolution gives up where the kernel would return ELOOP.
const MAX_LINK_DEPTH: usize = 40;
/// Upper bound on ref-chain walks so a corrupt tree cannot loop us forever.
const MAX_PATH_DEPTH: usize = 1024;

/// The shared, cached state of one subvolume: its tree plus the inode and
/// path caches. [`Subvolume`] handles are cheap views onto this.
pub(crate) struct SubvolumeState {
    objectid: u64,
    tree: BTree,
    inodes: RefCell<LruCache<u64, Rc<btrfs_inode_item>>>,
    paths: RefCell<LruCache<u64, String>>,
}

impl SubvolumeState {
    pub(crate) fn new(objectid: u64, tree: BTree) -> Self {
        SubvolumeState {
            objectid,
            tree,
            inodes: RefCell::new(LruCache::new(NonZeroUsize::new(INODE_CACHE_SIZE).unwrap())),
            paths: RefCell::new(LruCache::new(NonZeroUsize::new(PATH_CACHE_SIZE).unwrap())),
        }
    }
}

/// An independently rooted directory tree within the filesystem. The
/// `FS_TREE` subvolume (objectid 5) always exists and has the empty path.
#[derive(Clone)]
pub struct Subvolume<'fs> {
    fs: &'fs Btrfs,
    state: Rc<SubvolumeState>,
    parent: Option<Rc<Inode<'fs>>>,
}

impl<'fs> Subvolume<'fs> {
    pub(crate) fn new(fs: &'fs Btrfs, state: Rc<SubvolumeState>) -> Self {
        Subvolume {
            fs,
            state,
            parent: None,
        }
    }

    /// Attach the directory inode this subvolume was reached through, so
    /// `..` from its root resolves outward.
    pub(crate) fn with_parent(mut self, parent: Option<Rc<Inode<'fs>>>) -> Self {
        self.parent = parent;
        self
    }

    pub fn objectid(&self) -> u64 {
        self.state.objectid
    }

    pub(crate) fn tree(&self) -> &BTree {
        &self.state.tree
    }

    fn root_item(&self) -> Result<&btrfs_root_item> {
        self.state.tree.root_item().ok_or_else(|| {
            Error::Internal(format!(
                "subvolume {} has no root item",
                self.state.objectid
            ))
        })
    }

    pub fn uuid(&self) -> Result<Uuid> {
        Ok(Uuid::from_bytes(self.root_item()?.uuid))
    }

    /// The root directory of this subvolume.
    pub fn root(&self) -> Result<Inode<'fs>> {
        let dirid = self.root_item()?.root_dirid;
        Ok(self.inode(dirid, Some(BTRFS_FT_DIR), self.parent.clone()))
    }

    /// The path of this subvolume relative to `FS_TREE`, built by chasing
    /// `ROOT_BACKREF` items upward through the root tree.
    pub fn path(&self) -> Result<String> {
        let mut parts: Vec<String> = Vec::new();
        let mut objectid = self.state.objectid;

        for _ in 0..MAX_PATH_DEPTH {
            if objectid == BTRFS_FS_TREE_OBJECTID {
                parts.reverse();
                return Ok(parts.join("/"));
            }

            let (item, data) =
                self.fs
                    .root_tree()
                    .find(Some(objectid), Some(BTRFS_ROOT_BACKREF_KEY), None)?;
            let root_ref = btrfs_root_ref::parse(&data)?;
            parts.push(String::from_utf8_lossy(&root_ref.name).into_owned());

            let parent = self.fs.open_subvolume(item.key.offset)?;
            let dir_path = parent.resolve_path(root_ref.dirid)?;
            if !dir_path.is_empty() {
                parts.push(dir_path);
            }

            objectid = item.key.offset;
        }
        Err(Error::Internal(format!(
            "subvolume {} backref chain does not terminate",
            self.state.objectid
        )))
    }

    /// Construct an inode handle. `type_hint` is the file type recorded in
    /// the directory entry this inode was found through, `parent` the
    /// directory it was found in.
    pub fn inode(
        &self,
        inum: u64,
        type_hint: Option<u8>,
        parent: Option<Rc<Inode<'fs>>>,
    ) -> Inode<'fs> {
        Inode {
            subvolume: self.clone(),
            inum,
            type_hint,
            parent,
            record: OnceCell::new(),
            link: OnceCell::new(),
        }
    }

    /// Look up an inode by path. Empty segments and `.` are ignored, `..`
    /// steps to the parent (or stays put at a root), and intermediate
    /// symlinks are resolved. Name lookup goes through the `DIR_ITEM`
    /// name-hash index of the subvolume the current node belongs to, so
    /// `..` may carry the walk back across a subvolume boundary.
    pub fn get(&self, path: &str, base: Option<&Inode<'fs>>) -> Result<Inode<'fs>> {
        let mut node = match base {
            Some(node) => node.clone(),
            None => self.root()?,
        };

        for part in path.split('/') {
            if part.is_empty() || part == "." {
                continue;
            }
            if part == ".." {
                if let Some(parent) = node.parent().cloned() {
                    node = (*parent).clone();
                }
                continue;
            }

            let mut depth = 0;
            while node.is_symlink()? {
                depth += 1;
                if depth > MAX_LINK_DEPTH {
                    return Err(Error::NotFound(format!(
                        "too many levels of symbolic links: {path}"
                    )));
                }
                node = node.link_inode()?;
            }

            let subvolume = node.subvolume().clone();
            let hash = name_hash(part.as_bytes()) as u64;
            let (_, data) = match subvolume.state.tree.find(
                Some(node.inum()),
                Some(BTRFS_DIR_ITEM_KEY),
                Some(hash),
            ) {
                Ok(found) => found,
                Err(Error::NotFound(_)) => {
                    return Err(Error::NotFound(format!(
                        "no such file or directory: {path}"
                    )))
                }
                Err(e) => return Err(e),
            };

            let dir_item = btrfs_dir_item::parse(&data)?;
            let parent = Some(Rc::new(node.clone()));
            match dir_item.location.item_type {
                BTRFS_ROOT_ITEM_KEY => {
                    node = self
                        .fs
                        .open_subvolume(dir_item.location.objectid)?
                        .with_parent(parent)
                        .root()?;
                }
                BTRFS_INODE_ITEM_KEY => {
                    node = subvolume.inode(
                        dir_item.location.objectid,
                        Some(dir_item.r#type),
                        parent,
                    );
                }
                other => {
                    return Err(Error::Internal(format!(
                        "unknown dir_item location type {other}"
                    )))
                }
            }
        }

        Ok(node)
    }

    /// Directory path of `objectid` within this subvolume: an `INODE_REF`
    /// walk up to the subvolume root.
    pub fn resolve_path(&self, objectid: u64) -> Result<String> {
        if let Some(path) = self.state.paths.borrow_mut().get(&objectid) {
            return Ok(path.clone());
        }

        let mut names: Vec<String> = Vec::new();
        let mut current = objectid;
        for _ in 0..MAX_PATH_DEPTH {
            if current == BTRFS_FIRST_FREE_OBJECTID {
                names.reverse();
                let path = names.join("/");
                self.state.paths.borrow_mut().put(objectid, path.clone());
                return Ok(path);
            }

            let (item, data) =
                self.state
                    .tree
                    .find(Some(current), Some(BTRFS_INODE_REF_KEY), None)?;
            let inode_ref = btrfs_inode_ref::parse(&data)?;
            names.push(String::from_utf8_lossy(&inode_ref.name).into_owned());
            current = item.key.offset;
        }
        Err(Error::Internal(format!(
            "inode ref chain of {objectid} does not terminate"
        )))
    }

    pub(crate) fn inode_record(&self, inum: u64) -> Result<Rc<btrfs_inode_item>> {
        if let Some(record) = self.state.inodes.borrow_mut().get(&inum) {
            return Ok(Rc::clone(record));
        }
        let (_, data) = self
            .state
            .tree
            .find(Some(inum), Some(BTRFS_INODE_ITEM_KEY), None)?;
        let record = Rc::new(btrfs_inode_item::parse(&data)?);
        self.state.inodes.borrow_mut().put(inum, Rc::clone(&record));
        Ok(record)
    }
}

/// One inode of a subvolume. The on-disk record is read lazily on first
/// field access and never mutated.
#[derive(Clone)]
pub struct Inode<'fs> {
    subvolume: Subvolume<'fs>,
    inum: u64,
    type_hint: Option<u8>,
    parent: Option<Rc<Inode<'fs>>>,
    record: OnceCell<Rc<btrfs_inode_item>>,
    link: OnceCell<String>,
}

impl<'fs> Inode<'fs> {
    pub fn inum(&self) -> u64 {
        self.inum
    }

    pub fn subvolume(&self) -> &Subvolume<'fs> {
        &self.subvolume
    }

    /// The directory this inode was reached through, if any. Advisory: it
    /// backs `..` and relative symlinks.
    pub fn parent(&self) -> Option<&Rc<Inode<'fs>>> {
        self.parent.as_ref()
    }

    /// The parsed on-disk inode record.
    pub fn record(&self) -> Result<Rc<btrfs_inode_item>> {
        if let Some(record) = self.record.get() {
            return Ok(Rc::clone(record));
        }
        let record = self.subvolume.inode_record(self.inum)?;
        let _ = self.record.set(Rc::clone(&record));
        Ok(record)
    }

    pub fn size(&self) -> Result<u64> {
        Ok(self.record()?.size)
    }

    pub fn uid(&self) -> Result<u32> {
        Ok(self.record()?.uid)
    }

    pub fn gid(&self) -> Result<u32> {
        Ok(self.record()?.gid)
    }

    pub fn mode(&self) -> Result<u32> {
        Ok(self.record()?.mode)
    }

    pub fn nlink(&self) -> Result<u32> {
        Ok(self.record()?.nlink)
    }

    pub fn rdev(&self) -> Result<u64> {
        Ok(self.record()?.rdev)
    }

    pub fn flags(&self) -> Result<u64> {
        Ok(self.record()?.flags)
    }

    /// The S_IFMT file type. A known type hint from the directory entry
    /// wins; otherwise the mode decides.
    pub fn file_type(&self) -> Result<u32> {
        if let Some(mode) = self.type_hint.and_then(file_type_mode) {
            return Ok(mode);
        }
        Ok(self.record()?.mode & S_IFMT)
    }

    pub fn is_dir(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFDIR)
    }

    pub fn is_file(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFREG)
    }

    pub fn is_symlink(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFLNK)
    }

    pub fn is_block_device(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFBLK)
    }

    pub fn is_character_device(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFCHR)
    }

    pub fn is_device(&self) -> Result<bool> {
        Ok(self.is_block_device()? || self.is_character_device()?)
    }

    pub fn is_fifo(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFIFO)
    }

    pub fn is_socket(&self) -> Result<bool> {
        Ok(self.file_type()? == S_IFSOCK)
    }

    pub fn is_ipc(&self) -> Result<bool> {
        Ok(self.is_fifo()? || self.is_socket()?)
    }

    pub fn atime_ns(&self) -> Result<u64> {
        Ok(self.record()?.atime.nanos())
    }

    pub fn ctime_ns(&self) -> Result<u64> {
        Ok(self.record()?.ctime.nanos())
    }

    pub fn mtime_ns(&self) -> Result<u64> {
        Ok(self.record()?.mtime.nanos())
    }

    pub fn otime_ns(&self) -> Result<u64> {
        Ok(self.record()?.otime.nanos())
    }

    pub fn atime(&self) -> Result<SystemTime> {
        let ts = self.record()?.atime;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(ts.sec, ts.nsec))
    }

    pub fn ctime(&self) -> Result<SystemTime> {
        let ts = self.record()?.ctime;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(ts.sec, ts.nsec))
    }

    pub fn mtime(&self) -> Result<SystemTime> {
        let ts = self.record()?.mtime;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(ts.sec, ts.nsec))
    }

    pub fn otime(&self) -> Result<SystemTime> {
        let ts = self.record()?.otime;
        Ok(SystemTime::UNIX_EPOCH + Duration::new(ts.sec, ts.nsec))
    }

    /// The symlink target. Fails with `NotASymlink` on anything else.
    pub fn link(&self) -> Result<String> {
        if !self.is_symlink()? {
            return Err(Error::NotASymlink(self.inum));
        }
        if let Some(link) = self.link.get() {
            return Ok(link.clone());
        }
        let mut stream = self.open()?;
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf)?;
        let target = String::from_utf8_lossy(&buf).into_owned();
        let _ = self.link.set(target.clone());
        Ok(target)
    }

    /// Resolve the symlink target to an inode. Absolute targets restart
    /// from the subvolume root, relative ones from this inode's parent.
    pub fn link_inode(&self) -> Result<Inode<'fs>> {
        let link = self.link()?;
        let base = if link.starts_with('/') {
            None
        } else {
            self.parent.as_deref()
        };
        self.subvolume.get(&link, base)
    }

    /// Look up a path relative to this inode.
    pub fn get(&self, path: &str) -> Result<Inode<'fs>> {
        self.subvolume.get(path, Some(self))
    }

    /// The directories containing this inode, one per hard link.
    pub fn parents(&self) -> Result<Vec<Inode<'fs>>> {
        let mut out = Vec::new();
        for entry in self.subvolume.tree().cursor().iter(
            Some(self.inum),
            Some(BTRFS_INODE_REF_KEY),
            Some(0),
            true,
        ) {
            let (item, data) = entry?;
            let inode_ref = btrfs_inode_ref::parse(&data)?;
            if inode_ref.name == b".." {
                if let Some(parent) = &self.parent {
                    out.push((**parent).clone());
                }
            } else {
                out.push(self.subvolume.inode(item.key.offset, Some(BTRFS_FT_DIR), None));
            }
        }
        Ok(out)
    }

    /// All paths to this inode, one per hard link, relative to the
    /// subvolume root. With `full` the subvolume's own path is prepended.
    pub fn paths(&self, full: bool) -> Result<PathsIter<'fs>> {
        let root = if full {
            self.subvolume.path()?
        } else {
            String::new()
        };
        Ok(PathsIter {
            subvolume: self.subvolume.clone(),
            inum: self.inum,
            root,
            items: self.subvolume.tree().cursor().iter(
                Some(self.inum),
                Some(BTRFS_INODE_REF_KEY),
                Some(0),
                true,
            ),
            done: false,
        })
    }

    /// The first path to this inode within its subvolume.
    pub fn path(&self) -> Result<String> {
        match self.paths(false)?.next() {
            Some(path) => path,
            None => Err(Error::NotFound(format!("inode {} has no paths", self.inum))),
        }
    }

    /// The first path to this inode, prefixed with the subvolume path.
    pub fn full_path(&self) -> Result<String> {
        match self.paths(true)?.next() {
            Some(path) => path,
            None => Err(Error::NotFound(format!("inode {} has no paths", self.inum))),
        }
    }

    /// Iterate directory entries: `.` and `..` first, then the `DIR_INDEX`
    /// items in insertion order.
    pub fn iterdir(&self) -> Result<DirIter<'fs>> {
        if !self.is_dir()? {
            return Err(Error::NotADirectory(self.inum));
        }
        Ok(DirIter {
            dir: self.clone(),
            // Indices 0 and 1 are reserved for `.` and `..`.
            items: self.subvolume.tree().cursor().iter(
                Some(self.inum),
                Some(BTRFS_DIR_INDEX_KEY),
                Some(2),
                true,
            ),
            state: DirIterState::Dot,
            done: false,
        })
    }

    /// Directory listing as a map. Iteration order is not preserved; use
    /// [`Inode::iterdir`] for on-disk order.
    pub fn listdir(&self) -> Result<HashMap<String, Inode<'fs>>> {
        let mut out = HashMap::new();
        for entry in self.iterdir()? {
            let (name, inode) = entry?;
            out.insert(name, inode);
        }
        Ok(out)
    }

    /// The extent list backing this file, or `None` for inline and empty
    /// files.
    pub fn extents(&self) -> Result<Option<Vec<Extent>>> {
        Ok(self.open()?.extents().map(<[Extent]>::to_vec))
    }

    /// Open the file contents as a byte stream.
    ///
    /// Inline data decodes once into a buffer; everything else becomes an
    /// [`ExtentStream`] with sparse gaps materialized as zero runs.
    pub fn open(&self) -> Result<FileStream> {
        let size = self.size()?;
        if size == 0 {
            return Ok(FileStream::from_buffer(Vec::new()));
        }

        let mut offset = 0_u64;
        let mut extents: Vec<Extent> = Vec::new();

        for entry in self.subvolume.tree().cursor().iter(
            Some(self.inum),
            Some(BTRFS_EXTENT_DATA_KEY),
            Some(0),
            true,
        ) {
            let (item, data) = entry?;
            let extent = btrfs_file_extent_item::parse(&data)?;

            if extent.r#type == BTRFS_FILE_EXTENT_INLINE {
                // Inline data is the whole file; no further extents follow.
                let payload = data
                    .get(BTRFS_FILE_EXTENT_INLINE_HEADER_SIZE..)
                    .ok_or_else(|| Error::Invalid("inline extent without payload".into()))?;
                let mut buf = decode_extent(
                    payload,
                    extent.compression,
                    extent.encryption,
                    self.subvolume.fs.sector_size(),
                )?;
                buf.truncate(size as usize);
                return Ok(FileStream::from_buffer(buf));
            }

            if extent.r#type != BTRFS_FILE_EXTENT_REG
                && extent.r#type != BTRFS_FILE_EXTENT_PREALLOC
            {
                return Err(Error::Invalid(format!(
                    "unknown file extent type {}",
                    extent.r#type
                )));
            }

            if offset < item.key.offset {
                // The records skipped a range: materialize the hole.
                let gap = item.key.offset - offset;
                extents.push(Extent::sparse(gap));
                offset += gap;
            }

            extents.push(Extent {
                compression: extent.compression,
                encryption: extent.encryption,
                disk_offset: extent.disk_bytenr,
                disk_length: extent.disk_num_bytes,
                offset: extent.offset,
                length: extent.num_bytes,
            });
            offset += extent.num_bytes;
        }

        if offset < size {
            extents.push(Extent::sparse(size - offset));
        }

        Ok(FileStream::Extents(ExtentStream::new(
            Rc::clone(self.subvolume.fs.logical()),
            extents,
            size,
            self.subvolume.fs.sector_size(),
        )))
    }
}

impl std::fmt::Debug for Inode<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "<inode {}:{}>", self.subvolume.objectid(), self.inum)
    }
}

#[derive(Debug)]
enum DirIterState {
    Dot,
    DotDot,
    Entries,
}

/// Lazy directory iterator: `.`, `..`, then each `DIR_INDEX` entry.
#[derive(Debug)]
pub struct DirIter<'fs> {
    dir: Inode<'fs>,
    items: ItemIter,
    state: DirIterState,
    done: bool,
}

impl<'fs> Iterator for DirIter<'fs> {
    type Item = Result<(String, Inode<'fs>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.state {
            DirIterState::Dot => {
                self.state = DirIterState::DotDot;
                return Some(Ok((".".to_string(), self.dir.clone())));
            }
            DirIterState::DotDot => {
                self.state = DirIterState::Entries;
                let parent = self
                    .dir
                    .parent()
                    .map(|p| (**p).clone())
                    .unwrap_or_else(|| self.dir.clone());
                return Some(Ok(("..".to_string(), parent)));
            }
            DirIterState::Entries => {}
        }

        let (_, data) = match self.items.next()? {
            Ok(entry) => entry,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };
        let result = (|| -> Result<(String, Inode<'fs>)> {
            let dir_item = btrfs_dir_item::parse(&data)?;
            let name = String::from_utf8_lossy(&dir_item.name).into_owned();
            let parent = Some(Rc::new(self.dir.clone()));

            match dir_item.location.item_type {
                BTRFS_ROOT_ITEM_KEY => {
                    let subvolume = self
                        .dir
                        .subvolume
                        .fs
                        .open_subvolume(dir_item.location.objectid)?
                        .with_parent(parent);
                    Ok((name, subvolume.root()?))
                }
                BTRFS_INODE_ITEM_KEY => Ok((
                    name,
                    self.dir.subvolume.inode(
                        dir_item.location.objectid,
                        Some(dir_item.r#type),
                        parent,
                    ),
                )),
                other => Err(Error::Internal(format!(
                    "unknown dir_item location type {other}"
                ))),
            }
        })();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}

/// Lazy hard-link path iterator; see [`Inode::paths`].
pub struct PathsIter<'fs> {
    subvolume: Subvolume<'fs>,
    inum: u64,
    root: String,
    items: ItemIter,
    done: bool,
}

impl Iterator for PathsIter<'_> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let (item, data) = match self.items.next()? {
            Ok(entry) => entry,
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        if item.key.offset == self.inum {
            // A ref pointing at itself marks the subvolume root.
            self.done = true;
            return Some(Ok(self.root.clone()));
        }

        let result = (|| -> Result<String> {
            let inode_ref = btrfs_inode_ref::parse(&data)?;
            let name = String::from_utf8_lossy(&inode_ref.name).into_owned();

            let mut parts = vec![name];
            let parent_path = self.subvolume.resolve_path(item.key.offset)?;
            if !parent_path.is_empty() {
                parts.push(parent_path);
            }
            if !self.root.is_empty() {
                parts.push(self.root.clone());
            }
            parts.reverse();
            Ok(parts.join("/"))
        })();
        if result.is_err() {
            self.done = true;
        }
        Some(result)
    }
}
