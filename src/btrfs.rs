use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{Read, Seek, SeekFrom};
use std::num::NonZeroUsize;
use std::rc::Rc;

use log::debug;
use lru::LruCache;
use uuid::Uuid;

use crate::chunk::{ChunkStream, Device, ReadSeek};
use crate::error::{Error, Result};
use crate::inode::{Inode, Subvolume, SubvolumeState};
use crate::structures::*;
use crate::tree::BTree;

const TREE_CACHE_SIZE: usize = 32;
const SUBVOLUME_CACHE_SIZE: usize = 16;

/// Iterator over the `(disk_key, chunk)` pairs packed into the
/// superblock's embedded system chunk array.
pub struct SysChunkIter<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> SysChunkIter<'a> {
    pub fn new(sb: &'a btrfs_super_block) -> SysChunkIter<'a> {
        let size = (sb.sys_chunk_array_size as usize).min(sb.sys_chunk_array.len());
        SysChunkIter {
            buf: &sb.sys_chunk_array[..size],
            pos: 0,
        }
    }
}

impl Iterator for SysChunkIter<'_> {
    type Item = Result<(btrfs_disk_key, btrfs_chunk)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }

        let mut r = &self.buf[self.pos..];
        let before = r.len();
        let result = btrfs_disk_key::read_from(&mut r)
            .and_then(|key| Ok((key, btrfs_chunk::read_from(&mut r)?)));
        match result {
            Ok(entry) => {
                self.pos += before - r.len();
                Some(Ok(entry))
            }
            Err(_) => {
                // Stop on the first malformed record; the array must be
                // consumed exactly.
                self.pos = self.buf.len();
                Some(Err(Error::Invalid(
                    "malformed system chunk array".into(),
                )))
            }
        }
    }
}

/// A read-only view of one Btrfs volume, possibly spanning several devices.
///
/// Opening bootstraps the logical address space from the superblock's
/// system chunk array, installs the remaining chunks from the chunk tree,
/// opens the root tree and resolves the default subvolume. Everything is
/// immutable afterwards; inner caches make repeated lookups cheap.
#[derive(Debug)]
pub struct Btrfs {
    sb: btrfs_super_block,
    label: String,
    uuid: Uuid,
    metadata_uuid: Uuid,
    logical: Rc<ChunkStream>,
    root_tree: BTree,
    default_subvolid: u64,
    trees: RefCell<LruCache<u64, BTree>>,
    subvolumes: RefCell<LruCache<u64, Rc<SubvolumeState>>>,
}

impl Btrfs {
    /// Open a filesystem from the devices of one volume, in any order.
    /// Every stream must carry a superblock of the same filesystem.
    pub fn open(streams: Vec<Box<dyn ReadSeek>>) -> Result<Btrfs> {
        if streams.is_empty() {
            return Err(Error::Invalid("at least one device is required".into()));
        }

        let mut sb_devices: Vec<(btrfs_super_block, Device)> = Vec::new();
        for stream in streams {
            let device: Device = Rc::new(RefCell::new(stream));
            let sb = {
                let mut fh = device.borrow_mut();
                fh.seek(SeekFrom::Start(BTRFS_SUPER_INFO_OFFSET))?;
                let mut buf = vec![0_u8; BTRFS_SUPER_INFO_SIZE];
                fh.read_exact(&mut buf)?;
                btrfs_super_block::parse(&buf)?
            };
            if sb.magic != BTRFS_MAGIC {
                return Err(Error::Invalid(format!(
                    "bad superblock magic {:#x}",
                    sb.magic
                )));
            }
            sb_devices.push((sb, device));
        }

        let fsid = sb_devices[0].0.fsid;
        if sb_devices.iter().any(|(sb, _)| sb.fsid != fsid) {
            return Err(Error::Invalid(
                "devices belong to different filesystems (mixed fsids)".into(),
            ));
        }

        // The superblock with the highest generation is authoritative.
        sb_devices.sort_by_key(|(sb, _)| std::cmp::Reverse(sb.generation));
        let devices: HashMap<u64, Device> = sb_devices
            .iter()
            .map(|(sb, device)| (sb.dev_item.devid, Rc::clone(device)))
            .collect();
        let sb = sb_devices[0].0.clone();
        debug!(
            "superblock: generation {} label {:?} devices {}/{}",
            sb.generation,
            sb.label_string(),
            devices.len(),
            sb.num_devices
        );

        if sb.sys_chunk_array_size == 0 {
            return Err(Error::Invalid("empty system chunk array".into()));
        }

        let logical = Rc::new(ChunkStream::new(devices));

        // Seed the logical address space with the bootstrap chunks, enough
        // to read the chunk tree, which installs all the rest.
        for entry in SysChunkIter::new(&sb) {
            let (key, chunk) = entry?;
            if key.item_type != BTRFS_CHUNK_ITEM_KEY {
                return Err(Error::Invalid(format!(
                    "invalid item type in sys_chunk_array: {key:?}"
                )));
            }
            logical.add(key.offset, &chunk)?;
        }

        let chunk_tree = BTree::from_offset(Rc::clone(&logical), sb.nodesize, sb.chunk_root);
        let chunk_items: Vec<_> = chunk_tree
            .cursor()
            .iter(
                Some(BTRFS_FIRST_CHUNK_TREE_OBJECTID),
                Some(BTRFS_CHUNK_ITEM_KEY),
                Some(0),
                true,
            )
            .collect();
        for entry in chunk_items {
            let (item, data) = entry?;
            logical.add(item.key.offset, &btrfs_chunk::parse(&data)?)?;
        }

        let root_tree = BTree::from_offset(Rc::clone(&logical), sb.nodesize, sb.root);

        let mut fs = Btrfs {
            label: sb.label_string(),
            uuid: Uuid::from_bytes(sb.fsid),
            metadata_uuid: Uuid::from_bytes(sb.metadata_uuid),
            logical,
            root_tree,
            default_subvolid: BTRFS_FS_TREE_OBJECTID,
            trees: RefCell::new(LruCache::new(NonZeroUsize::new(TREE_CACHE_SIZE).unwrap())),
            subvolumes: RefCell::new(LruCache::new(
                NonZeroUsize::new(SUBVOLUME_CACHE_SIZE).unwrap(),
            )),
            sb,
        };

        // The FS_TREE subvolume always exists.
        fs.open_subvolume(BTRFS_FS_TREE_OBJECTID)?;

        fs.default_subvolid = fs.find_default_subvolid()?;
        fs.default_subvolume()?.root()?;

        Ok(fs)
    }

    /// The default subvolume is named by a directory item of the root
    /// tree's directory object.
    fn find_default_subvolid(&self) -> Result<u64> {
        let (_, data) = self.root_tree.find(
            Some(BTRFS_ROOT_TREE_DIR_OBJECTID),
            Some(BTRFS_DIR_ITEM_KEY),
            None,
        )?;
        let dir_item = btrfs_dir_item::parse(&data)?;
        Ok(dir_item.location.objectid)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn metadata_uuid(&self) -> Uuid {
        self.metadata_uuid
    }

    pub fn sector_size(&self) -> u32 {
        self.sb.sectorsize
    }

    pub fn node_size(&self) -> u32 {
        self.sb.nodesize
    }

    pub fn stripe_size(&self) -> u32 {
        self.sb.stripesize
    }

    pub fn num_devices(&self) -> u64 {
        self.sb.num_devices
    }

    pub fn generation(&self) -> u64 {
        self.sb.generation
    }

    pub fn superblock(&self) -> &btrfs_super_block {
        &self.sb
    }

    pub(crate) fn root_tree(&self) -> &BTree {
        &self.root_tree
    }

    pub(crate) fn logical(&self) -> &Rc<ChunkStream> {
        &self.logical
    }

    /// The root inode of the default subvolume.
    pub fn root(&self) -> Result<Inode<'_>> {
        self.default_subvolume()?.root()
    }

    pub fn default_subvolume(&self) -> Result<Subvolume<'_>> {
        self.open_subvolume(self.default_subvolid)
    }

    /// Look up an inode by path in the default subvolume.
    pub fn get(&self, path: &str) -> Result<Inode<'_>> {
        self.default_subvolume()?.get(path, None)
    }

    /// Look up an inode by number in the default subvolume.
    pub fn get_inode(&self, inum: u64) -> Result<Inode<'_>> {
        let inode = self.default_subvolume()?.inode(inum, None, None);
        inode.record()?;
        Ok(inode)
    }

    /// Open a subvolume by objectid. Subvolume state is cached, so
    /// reopening is cheap.
    pub fn open_subvolume(&self, objectid: u64) -> Result<Subvolume<'_>> {
        if let Some(state) = self.subvolumes.borrow_mut().get(&objectid) {
            return Ok(Subvolume::new(self, Rc::clone(state)));
        }
        let tree = self.open_tree(objectid)?;
        let state = Rc::new(SubvolumeState::new(objectid, tree));
        self.subvolumes
            .borrow_mut()
            .put(objectid, Rc::clone(&state));
        Ok(Subvolume::new(self, state))
    }

    /// Open a tree by objectid through its `ROOT_ITEM` in the root tree.
    pub fn open_tree(&self, objectid: u64) -> Result<BTree> {
        if let Some(tree) = self.trees.borrow_mut().get(&objectid) {
            return Ok(tree.clone());
        }
        let (_, data) = self
            .root_tree
            .find(Some(objectid), Some(BTRFS_ROOT_ITEM_KEY), None)?;
        let root_item = btrfs_root_item::parse(&data)?;
        let tree = BTree::from_root_item(Rc::clone(&self.logical), self.sb.nodesize, root_item);
        self.trees.borrow_mut().put(objectid, tree.clone());
        Ok(tree)
    }

    /// Breadth-first enumeration of all subvolumes, starting from
    /// `FS_TREE` and following `ROOT_REF` items.
    pub fn subvolumes(&self) -> SubvolumeIter<'_> {
        SubvolumeIter {
            fs: self,
            pending: VecDeque::new(),
            scan: VecDeque::new(),
            yielded_fs_tree: false,
            done: false,
        }
    }

    /// Find a subvolume by its path.
    pub fn find_subvolume(&self, path: &str) -> Result<Option<Subvolume<'_>>> {
        for subvolume in self.subvolumes() {
            let subvolume = subvolume?;
            if subvolume.path()? == path {
                return Ok(Some(subvolume));
            }
        }
        Ok(None)
    }
}

/// Lazy breadth-first subvolume enumeration; see [`Btrfs::subvolumes`].
pub struct SubvolumeIter<'fs> {
    fs: &'fs Btrfs,
    pending: VecDeque<u64>,
    scan: VecDeque<u64>,
    yielded_fs_tree: bool,
    done: bool,
}

impl<'fs> Iterator for SubvolumeIter<'fs> {
    type Item = Result<Subvolume<'fs>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        if !self.yielded_fs_tree {
            self.yielded_fs_tree = true;
            self.scan.push_back(BTRFS_FS_TREE_OBJECTID);
            return match self.fs.open_subvolume(BTRFS_FS_TREE_OBJECTID) {
                Ok(subvolume) => Some(Ok(subvolume)),
                Err(e) => {
                    self.done = true;
                    Some(Err(e))
                }
            };
        }

        loop {
            if let Some(objectid) = self.pending.pop_front() {
                self.scan.push_back(objectid);
                return Some(self.fs.open_subvolume(objectid));
            }

            let parent = self.scan.pop_front()?;
            for entry in self.fs.root_tree.cursor().iter(
                Some(parent),
                Some(BTRFS_ROOT_REF_KEY),
                Some(0),
                true,
            ) {
                match entry {
                    // The child subvolume id is the ref's key offset.
                    Ok((item, _)) => self.pending.push_back(item.key.offset),
                    Err(e) => {
                        self.done = true;
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, WriteBytesExt};

    use super::*;

    fn push_sys_chunk(buf: &mut Vec<u8>, logical: u64, stripes: &[(u64, u64)]) {
        buf.write_u64::<LittleEndian>(BTRFS_FIRST_CHUNK_TREE_OBJECTID)
            .unwrap();
        buf.write_u8(BTRFS_CHUNK_ITEM_KEY).unwrap();
        buf.write_u64::<LittleEndian>(logical).unwrap();

        buf.write_u64::<LittleEndian>(0x400000).unwrap(); // length
        buf.write_u64::<LittleEndian>(2).unwrap(); // owner
        buf.write_u64::<LittleEndian>(0x10000).unwrap(); // stripe_len
        buf.write_u64::<LittleEndian>(BTRFS_BLOCK_GROUP_SYSTEM).unwrap();
        buf.write_u32::<LittleEndian>(0x10000).unwrap();
        buf.write_u32::<LittleEndian>(0x10000).unwrap();
        buf.write_u32::<LittleEndian>(4096).unwrap();
        buf.write_u16::<LittleEndian>(stripes.len() as u16).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
        for (devid, offset) in stripes {
            buf.write_u64::<LittleEndian>(*devid).unwrap();
            buf.write_u64::<LittleEndian>(*offset).unwrap();
            buf.extend_from_slice(&[0_u8; 16]);
        }
    }

    fn super_block_with_array(array: Vec<u8>) -> btrfs_super_block {
        let size = array.len() as u32;
        let mut sys_chunk_array = array;
        sys_chunk_array.resize(BTRFS_SYSTEM_CHUNK_ARRAY_SIZE, 0);
        btrfs_super_block {
            fsid: [0; 16],
            bytenr: BTRFS_SUPER_INFO_OFFSET,
            flags: 0,
            magic: BTRFS_MAGIC,
            generation: 1,
            root: 0,
            chunk_root: 0,
            log_root: 0,
            total_bytes: 0,
            bytes_used: 0,
            root_dir_objectid: 6,
            num_devices: 1,
            sectorsize: 4096,
            nodesize: 16384,
            stripesize: 4096,
            sys_chunk_array_size: size,
            chunk_root_generation: 1,
            compat_flags: 0,
            compat_ro_flags: 0,
            incompat_flags: 0,
            csum_type: 0,
            root_level: 0,
            chunk_root_level: 0,
            log_root_level: 0,
            dev_item: btrfs_dev_item {
                devid: 1,
                total_bytes: 0,
                bytes_used: 0,
                io_align: 0,
                io_width: 0,
                sector_size: 4096,
                r#type: 0,
                generation: 0,
                start_offset: 0,
                dev_group: 0,
                seek_speed: 0,
                bandwidth: 0,
                uuid: [0; 16],
                fsid: [0; 16],
            },
            label: [0; BTRFS_LABEL_SIZE],
            cache_generation: 0,
            uuid_tree_generation: 0,
            metadata_uuid: [0; 16],
            nr_global_roots: 0,
            sys_chunk_array,
        }
    }

    #[test]
    fn sys_chunk_iter_yields_each_record() {
        let mut array = Vec::new();
        push_sys_chunk(&mut array, 0x100000, &[(1, 0x100000)]);
        push_sys_chunk(&mut array, 0x500000, &[(1, 0x500000), (2, 0x500000)]);
        let sb = super_block_with_array(array);

        let entries: Vec<_> = SysChunkIter::new(&sb).map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0.offset, 0x100000);
        assert_eq!(entries[0].1.num_stripes, 1);
        assert_eq!(entries[1].0.offset, 0x500000);
        assert_eq!(entries[1].1.stripes.len(), 2);
    }

    #[test]
    fn sys_chunk_iter_rejects_truncated_records() {
        let mut array = Vec::new();
        push_sys_chunk(&mut array, 0x100000, &[(1, 0x100000)]);
        array.truncate(array.len() - 7);
        let sb = super_block_with_array(array);

        let entries: Vec<_> = SysChunkIter::new(&sb).collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_err());
    }
}
