use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt};
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

pub const BTRFS_CSUM_SIZE: usize = 32;
pub const BTRFS_FSID_SIZE: usize = 16;
pub const BTRFS_UUID_SIZE: usize = 16;
pub const BTRFS_SUPER_INFO_OFFSET: u64 = 65536;
pub const BTRFS_SUPER_INFO_SIZE: usize = 4096;

pub const BTRFS_SYSTEM_CHUNK_ARRAY_SIZE: usize = 2048;
pub const BTRFS_LABEL_SIZE: usize = 256;

/// ASCII for "_BHRfS_M", no terminating nul.
pub const BTRFS_MAGIC: u64 = 0x4D5F53665248425F;

pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
pub const BTRFS_CHUNK_TREE_OBJECTID: u64 = 3;
pub const BTRFS_DEV_TREE_OBJECTID: u64 = 4;
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
pub const BTRFS_ROOT_TREE_DIR_OBJECTID: u64 = 6;
pub const BTRFS_CSUM_TREE_OBJECTID: u64 = 7;
pub const BTRFS_QUOTA_TREE_OBJECTID: u64 = 8;
pub const BTRFS_UUID_TREE_OBJECTID: u64 = 9;
pub const BTRFS_FREE_SPACE_TREE_OBJECTID: u64 = 10;
pub const BTRFS_BLOCK_GROUP_TREE_OBJECTID: u64 = 11;

/// All regular files and directories have objectids from here on up.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;
pub const BTRFS_FIRST_CHUNK_TREE_OBJECTID: u64 = 256;

pub const BTRFS_INODE_ITEM_KEY: u8 = 1;
pub const BTRFS_INODE_REF_KEY: u8 = 12;
pub const BTRFS_INODE_EXTREF_KEY: u8 = 13;
pub const BTRFS_XATTR_ITEM_KEY: u8 = 24;
pub const BTRFS_ORPHAN_ITEM_KEY: u8 = 48;
pub const BTRFS_DIR_ITEM_KEY: u8 = 84;
pub const BTRFS_DIR_INDEX_KEY: u8 = 96;
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
pub const BTRFS_EXTENT_CSUM_KEY: u8 = 128;
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;
pub const BTRFS_ROOT_REF_KEY: u8 = 156;
pub const BTRFS_EXTENT_ITEM_KEY: u8 = 168;
pub const BTRFS_METADATA_ITEM_KEY: u8 = 169;
pub const BTRFS_BLOCK_GROUP_ITEM_KEY: u8 = 192;
pub const BTRFS_DEV_EXTENT_KEY: u8 = 204;
pub const BTRFS_DEV_ITEM_KEY: u8 = 216;
pub const BTRFS_CHUNK_ITEM_KEY: u8 = 228;

/* directory entry / inode file types */
pub const BTRFS_FT_UNKNOWN: u8 = 0;
pub const BTRFS_FT_REG_FILE: u8 = 1;
pub const BTRFS_FT_DIR: u8 = 2;
pub const BTRFS_FT_CHRDEV: u8 = 3;
pub const BTRFS_FT_BLKDEV: u8 = 4;
pub const BTRFS_FT_FIFO: u8 = 5;
pub const BTRFS_FT_SOCK: u8 = 6;
pub const BTRFS_FT_SYMLINK: u8 = 7;

/* S_IFMT values the file types map onto */
pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/* block group / chunk type flags */
pub const BTRFS_BLOCK_GROUP_DATA: u64 = 1 << 0;
pub const BTRFS_BLOCK_GROUP_SYSTEM: u64 = 1 << 1;
pub const BTRFS_BLOCK_GROUP_METADATA: u64 = 1 << 2;
pub const BTRFS_BLOCK_GROUP_RAID0: u64 = 1 << 3;
pub const BTRFS_BLOCK_GROUP_RAID1: u64 = 1 << 4;
pub const BTRFS_BLOCK_GROUP_DUP: u64 = 1 << 5;
pub const BTRFS_BLOCK_GROUP_RAID10: u64 = 1 << 6;
pub const BTRFS_BLOCK_GROUP_RAID5: u64 = 1 << 7;
pub const BTRFS_BLOCK_GROUP_RAID6: u64 = 1 << 8;
pub const BTRFS_BLOCK_GROUP_RAID1C3: u64 = 1 << 9;
pub const BTRFS_BLOCK_GROUP_RAID1C4: u64 = 1 << 10;

pub const BTRFS_BLOCK_GROUP_PROFILE_MASK: u64 = BTRFS_BLOCK_GROUP_RAID0
    | BTRFS_BLOCK_GROUP_RAID1
    | BTRFS_BLOCK_GROUP_RAID1C3
    | BTRFS_BLOCK_GROUP_RAID1C4
    | BTRFS_BLOCK_GROUP_RAID5
    | BTRFS_BLOCK_GROUP_RAID6
    | BTRFS_BLOCK_GROUP_DUP
    | BTRFS_BLOCK_GROUP_RAID10;
pub const BTRFS_BLOCK_GROUP_RAID1_MASK: u64 =
    BTRFS_BLOCK_GROUP_RAID1 | BTRFS_BLOCK_GROUP_RAID1C3 | BTRFS_BLOCK_GROUP_RAID1C4;
pub const BTRFS_BLOCK_GROUP_RAID56_MASK: u64 = BTRFS_BLOCK_GROUP_RAID5 | BTRFS_BLOCK_GROUP_RAID6;
pub const BTRFS_BLOCK_GROUP_STRIPE_MASK: u64 =
    BTRFS_BLOCK_GROUP_RAID0 | BTRFS_BLOCK_GROUP_RAID10 | BTRFS_BLOCK_GROUP_RAID56_MASK;

/* file extent types and compression algorithms */
pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

pub const BTRFS_COMPRESS_NONE: u8 = 0;
pub const BTRFS_COMPRESS_ZLIB: u8 = 1;
pub const BTRFS_COMPRESS_LZO: u8 = 2;
pub const BTRFS_COMPRESS_ZSTD: u8 = 3;

/// on-disc format is little-endian
pub type LE16 = u16;
pub type LE32 = u32;
pub type LE64 = u64;

pub type BtrfsUuid = [u8; BTRFS_UUID_SIZE];
pub type BtrfsFsid = [u8; BTRFS_FSID_SIZE];

pub const BTRFS_DISK_KEY_SIZE: usize = 17;
pub const BTRFS_HEADER_SIZE: usize = 101;
pub const BTRFS_ITEM_SIZE: usize = 25;
pub const BTRFS_KEY_PTR_SIZE: usize = 33;
pub const BTRFS_STRIPE_SIZE: usize = 32;
pub const BTRFS_CHUNK_HEADER_SIZE: usize = 48;
pub const BTRFS_DEV_ITEM_SIZE: usize = 98;
pub const BTRFS_INODE_ITEM_SIZE: usize = 160;
pub const BTRFS_ROOT_ITEM_SIZE: usize = 439;
pub const BTRFS_DIR_ITEM_HEADER_SIZE: usize = 30;
pub const BTRFS_INODE_REF_HEADER_SIZE: usize = 10;
pub const BTRFS_ROOT_REF_HEADER_SIZE: usize = 18;
pub const BTRFS_FILE_EXTENT_INLINE_HEADER_SIZE: usize = 21;
pub const BTRFS_FILE_EXTENT_REG_SIZE: usize = 53;

const_assert_eq!(BTRFS_ITEM_SIZE, BTRFS_DISK_KEY_SIZE + 8);
const_assert_eq!(BTRFS_KEY_PTR_SIZE, BTRFS_DISK_KEY_SIZE + 16);
const_assert_eq!(
    BTRFS_FILE_EXTENT_REG_SIZE,
    BTRFS_FILE_EXTENT_INLINE_HEADER_SIZE + 32
);

/// The directory name hash: crc32c with the register seeded to `~1` and no
/// output inversion. `crc32c_append` takes and returns finalized checksums,
/// so undo its final xor to get the raw register back.
pub fn name_hash(name: &[u8]) -> u32 {
    crc32c::crc32c_append(1, name) ^ 0xFFFF_FFFF
}

fn read_array<const N: usize>(r: &mut &[u8]) -> Result<[u8; N]> {
    let mut buf = [0_u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn read_vec(r: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    if r.len() < len {
        return Err(Error::Invalid(format!(
            "record truncated: need {len} bytes, have {}",
            r.len()
        )));
    }
    let mut buf = vec![0_u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

fn skip(r: &mut &[u8], len: usize) -> Result<()> {
    if r.len() < len {
        return Err(Error::Invalid(format!(
            "record truncated: need {len} bytes, have {}",
            r.len()
        )));
    }
    *r = &r[len..];
    Ok(())
}

/// Per-profile redundancy attributes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RaidProfile {
    pub ncopies: u16,
    pub nparity: u16,
    pub tolerated_failures: u16,
}

pub fn raid_profile(chunk_type: LE64) -> Result<RaidProfile> {
    let (ncopies, nparity, tolerated_failures) = match chunk_type & BTRFS_BLOCK_GROUP_PROFILE_MASK {
        0 => (1, 0, 0), // SINGLE
        BTRFS_BLOCK_GROUP_RAID0 => (1, 0, 0),
        BTRFS_BLOCK_GROUP_RAID1 => (2, 0, 1),
        BTRFS_BLOCK_GROUP_DUP => (2, 0, 0),
        BTRFS_BLOCK_GROUP_RAID10 => (2, 0, 1),
        BTRFS_BLOCK_GROUP_RAID5 => (1, 1, 1),
        BTRFS_BLOCK_GROUP_RAID6 => (1, 2, 2),
        BTRFS_BLOCK_GROUP_RAID1C3 => (3, 0, 2),
        BTRFS_BLOCK_GROUP_RAID1C4 => (4, 0, 3),
        other => return Err(Error::Invalid(format!("unknown chunk profile {other:#x}"))),
    };
    Ok(RaidProfile {
        ncopies,
        nparity,
        tolerated_failures,
    })
}

/// Map a directory-entry file type onto the S_IFMT bits, if it names one.
pub fn file_type_mode(ft: u8) -> Option<u32> {
    match ft {
        BTRFS_FT_REG_FILE => Some(S_IFREG),
        BTRFS_FT_DIR => Some(S_IFDIR),
        BTRFS_FT_CHRDEV => Some(S_IFCHR),
        BTRFS_FT_BLKDEV => Some(S_IFBLK),
        BTRFS_FT_FIFO => Some(S_IFIFO),
        BTRFS_FT_SOCK => Some(S_IFSOCK),
        BTRFS_FT_SYMLINK => Some(S_IFLNK),
        _ => None,
    }
}

/// The 17-byte key ordering every item in every tree.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct btrfs_disk_key {
    pub objectid: LE64,
    pub item_type: u8,
    pub offset: LE64,
}

impl btrfs_disk_key {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        Ok(btrfs_disk_key {
            objectid: r.read_u64::<LittleEndian>()?,
            item_type: r.read_u8()?,
            offset: r.read_u64::<LittleEndian>()?,
        })
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        Self::read_from(&mut buf)
    }
}

impl std::fmt::Debug for btrfs_disk_key {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "({} {} {})", self.objectid, self.item_type, self.offset)
    }
}

/// Stored at the start of every tree node.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_header {
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub chunk_tree_uuid: BtrfsUuid,
    pub generation: LE64,
    pub owner: LE64,
    pub nritems: LE32,
    pub level: u8,
}

impl btrfs_header {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        skip(r, BTRFS_CSUM_SIZE)?;
        Ok(btrfs_header {
            fsid: read_array(r)?,
            bytenr: r.read_u64::<LittleEndian>()?,
            flags: r.read_u64::<LittleEndian>()?,
            chunk_tree_uuid: read_array(r)?,
            generation: r.read_u64::<LittleEndian>()?,
            owner: r.read_u64::<LittleEndian>()?,
            nritems: r.read_u32::<LittleEndian>()?,
            level: r.read_u8()?,
        })
    }
}

/// Leaf item descriptor. `offset` counts from the end of the node header.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_item {
    pub key: btrfs_disk_key,
    pub offset: LE32,
    pub size: LE32,
}

impl btrfs_item {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        Ok(btrfs_item {
            key: btrfs_disk_key::read_from(r)?,
            offset: r.read_u32::<LittleEndian>()?,
            size: r.read_u32::<LittleEndian>()?,
        })
    }
}

/// Branch pointer. Non-leaf nodes are full of these.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_key_ptr {
    pub key: btrfs_disk_key,
    pub blockptr: LE64,
    pub generation: LE64,
}

impl btrfs_key_ptr {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        Ok(btrfs_key_ptr {
            key: btrfs_disk_key::read_from(r)?,
            blockptr: r.read_u64::<LittleEndian>()?,
            generation: r.read_u64::<LittleEndian>()?,
        })
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: BtrfsUuid,
}

impl btrfs_stripe {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        Ok(btrfs_stripe {
            devid: r.read_u64::<LittleEndian>()?,
            offset: r.read_u64::<LittleEndian>()?,
            dev_uuid: read_array(r)?,
        })
    }
}

/// A chunk item: one region of the logical address space and the device
/// stripes backing it. The stripe array follows the fixed header on disk.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_chunk {
    pub length: LE64,
    pub owner: LE64,
    pub stripe_len: LE64,
    pub r#type: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub num_stripes: LE16,
    pub sub_stripes: LE16,
    pub stripes: Vec<btrfs_stripe>,
}

impl btrfs_chunk {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        let length = r.read_u64::<LittleEndian>()?;
        let owner = r.read_u64::<LittleEndian>()?;
        let stripe_len = r.read_u64::<LittleEndian>()?;
        let r#type = r.read_u64::<LittleEndian>()?;
        let io_align = r.read_u32::<LittleEndian>()?;
        let io_width = r.read_u32::<LittleEndian>()?;
        let sector_size = r.read_u32::<LittleEndian>()?;
        let num_stripes = r.read_u16::<LittleEndian>()?;
        let sub_stripes = r.read_u16::<LittleEndian>()?;
        if num_stripes == 0 {
            return Err(Error::Invalid("chunk with zero stripes".into()));
        }
        let mut stripes = Vec::with_capacity(num_stripes as usize);
        for _ in 0..num_stripes {
            stripes.push(btrfs_stripe::read_from(r)?);
        }
        Ok(btrfs_chunk {
            length,
            owner,
            stripe_len,
            r#type,
            io_align,
            io_width,
            sector_size,
            num_stripes,
            sub_stripes,
            stripes,
        })
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        Self::read_from(&mut buf)
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_dev_item {
    pub devid: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub io_align: LE32,
    pub io_width: LE32,
    pub sector_size: LE32,
    pub r#type: LE64,
    pub generation: LE64,
    pub start_offset: LE64,
    pub dev_group: LE32,
    pub seek_speed: u8,
    pub bandwidth: u8,
    pub uuid: BtrfsUuid,
    pub fsid: BtrfsFsid,
}

impl btrfs_dev_item {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        Ok(btrfs_dev_item {
            devid: r.read_u64::<LittleEndian>()?,
            total_bytes: r.read_u64::<LittleEndian>()?,
            bytes_used: r.read_u64::<LittleEndian>()?,
            io_align: r.read_u32::<LittleEndian>()?,
            io_width: r.read_u32::<LittleEndian>()?,
            sector_size: r.read_u32::<LittleEndian>()?,
            r#type: r.read_u64::<LittleEndian>()?,
            generation: r.read_u64::<LittleEndian>()?,
            start_offset: r.read_u64::<LittleEndian>()?,
            dev_group: r.read_u32::<LittleEndian>()?,
            seek_speed: r.read_u8()?,
            bandwidth: r.read_u8()?,
            uuid: read_array(r)?,
            fsid: read_array(r)?,
        })
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_timespec {
    pub sec: LE64,
    pub nsec: LE32,
}

impl btrfs_timespec {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        Ok(btrfs_timespec {
            sec: r.read_u64::<LittleEndian>()?,
            nsec: r.read_u32::<LittleEndian>()?,
        })
    }

    /// Seconds and nanoseconds combined into one nanosecond timestamp.
    pub fn nanos(&self) -> u64 {
        self.sec * 1_000_000_000 + self.nsec as u64
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_inode_item {
    pub generation: LE64,
    pub transid: LE64,
    pub size: LE64,
    pub nbytes: LE64,
    pub block_group: LE64,
    pub nlink: LE32,
    pub uid: LE32,
    pub gid: LE32,
    pub mode: LE32,
    pub rdev: LE64,
    pub flags: LE64,
    pub sequence: LE64,
    pub atime: btrfs_timespec,
    pub ctime: btrfs_timespec,
    pub mtime: btrfs_timespec,
    pub otime: btrfs_timespec,
}

impl btrfs_inode_item {
    pub fn read_from(r: &mut &[u8]) -> Result<Self> {
        let generation = r.read_u64::<LittleEndian>()?;
        let transid = r.read_u64::<LittleEndian>()?;
        let size = r.read_u64::<LittleEndian>()?;
        let nbytes = r.read_u64::<LittleEndian>()?;
        let block_group = r.read_u64::<LittleEndian>()?;
        let nlink = r.read_u32::<LittleEndian>()?;
        let uid = r.read_u32::<LittleEndian>()?;
        let gid = r.read_u32::<LittleEndian>()?;
        let mode = r.read_u32::<LittleEndian>()?;
        let rdev = r.read_u64::<LittleEndian>()?;
        let flags = r.read_u64::<LittleEndian>()?;
        let sequence = r.read_u64::<LittleEndian>()?;
        skip(r, 4 * 8)?; // reserved
        Ok(btrfs_inode_item {
            generation,
            transid,
            size,
            nbytes,
            block_group,
            nlink,
            uid,
            gid,
            mode,
            rdev,
            flags,
            sequence,
            atime: btrfs_timespec::read_from(r)?,
            ctime: btrfs_timespec::read_from(r)?,
            mtime: btrfs_timespec::read_from(r)?,
            otime: btrfs_timespec::read_from(r)?,
        })
    }

    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        Self::read_from(&mut buf)
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_root_item {
    pub inode: btrfs_inode_item,
    pub generation: LE64,
    pub root_dirid: LE64,
    pub bytenr: LE64,
    pub byte_limit: LE64,
    pub bytes_used: LE64,
    pub last_snapshot: LE64,
    pub flags: LE64,
    pub refs: LE32,
    pub drop_progress: btrfs_disk_key,
    pub drop_level: u8,
    pub level: u8,
    pub generation_v2: LE64,
    pub uuid: BtrfsUuid,
    pub parent_uuid: BtrfsUuid,
    pub received_uuid: BtrfsUuid,
    pub ctransid: LE64,
    pub otransid: LE64,
    pub stransid: LE64,
    pub rtransid: LE64,
    pub ctime: btrfs_timespec,
    pub otime: btrfs_timespec,
    pub stime: btrfs_timespec,
    pub rtime: btrfs_timespec,
}

impl btrfs_root_item {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        Ok(btrfs_root_item {
            inode: btrfs_inode_item::read_from(r)?,
            generation: r.read_u64::<LittleEndian>()?,
            root_dirid: r.read_u64::<LittleEndian>()?,
            bytenr: r.read_u64::<LittleEndian>()?,
            byte_limit: r.read_u64::<LittleEndian>()?,
            bytes_used: r.read_u64::<LittleEndian>()?,
            last_snapshot: r.read_u64::<LittleEndian>()?,
            flags: r.read_u64::<LittleEndian>()?,
            refs: r.read_u32::<LittleEndian>()?,
            drop_progress: btrfs_disk_key::read_from(r)?,
            drop_level: r.read_u8()?,
            level: r.read_u8()?,
            generation_v2: r.read_u64::<LittleEndian>()?,
            uuid: read_array(r)?,
            parent_uuid: read_array(r)?,
            received_uuid: read_array(r)?,
            ctransid: r.read_u64::<LittleEndian>()?,
            otransid: r.read_u64::<LittleEndian>()?,
            stransid: r.read_u64::<LittleEndian>()?,
            rtransid: r.read_u64::<LittleEndian>()?,
            ctime: btrfs_timespec::read_from(r)?,
            otime: btrfs_timespec::read_from(r)?,
            stime: btrfs_timespec::read_from(r)?,
            rtime: btrfs_timespec::read_from(r)?,
        })
    }
}

/// Used for both forward (`ROOT_REF`) and backward (`ROOT_BACKREF`) refs.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_root_ref {
    pub dirid: LE64,
    pub sequence: LE64,
    pub name: Vec<u8>,
}

impl btrfs_root_ref {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        let dirid = r.read_u64::<LittleEndian>()?;
        let sequence = r.read_u64::<LittleEndian>()?;
        let name_len = r.read_u16::<LittleEndian>()?;
        Ok(btrfs_root_ref {
            dirid,
            sequence,
            name: read_vec(r, name_len as usize)?,
        })
    }
}

#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_inode_ref {
    pub index: LE64,
    pub name: Vec<u8>,
}

impl btrfs_inode_ref {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        let index = r.read_u64::<LittleEndian>()?;
        let name_len = r.read_u16::<LittleEndian>()?;
        Ok(btrfs_inode_ref {
            index,
            name: read_vec(r, name_len as usize)?,
        })
    }
}

/// A directory entry: the name and the key (`location`) it points at, which
/// is either an `INODE_ITEM` in the same tree or a `ROOT_ITEM` for a nested
/// subvolume.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_dir_item {
    pub location: btrfs_disk_key,
    pub transid: LE64,
    pub r#type: u8,
    pub name: Vec<u8>,
    pub data: Vec<u8>,
}

impl btrfs_dir_item {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        let location = btrfs_disk_key::read_from(r)?;
        let transid = r.read_u64::<LittleEndian>()?;
        let data_len = r.read_u16::<LittleEndian>()?;
        let name_len = r.read_u16::<LittleEndian>()?;
        let r#type = r.read_u8()?;
        let name = read_vec(r, name_len as usize)?;
        let data = read_vec(r, data_len as usize)?;
        Ok(btrfs_dir_item {
            location,
            transid,
            r#type,
            name,
            data,
        })
    }
}

/// A file extent record. For `INLINE` extents the payload follows the
/// 21-byte header inside the leaf and the disk/offset fields are zero.
#[allow(non_camel_case_types)]
#[derive(Clone, Copy, Debug)]
pub struct btrfs_file_extent_item {
    pub generation: LE64,
    pub ram_bytes: LE64,
    pub compression: u8,
    pub encryption: u8,
    pub other_encoding: LE16,
    pub r#type: u8,
    pub disk_bytenr: LE64,
    pub disk_num_bytes: LE64,
    pub offset: LE64,
    pub num_bytes: LE64,
}

impl btrfs_file_extent_item {
    pub fn parse(mut buf: &[u8]) -> Result<Self> {
        let r = &mut buf;
        let generation = r.read_u64::<LittleEndian>()?;
        let ram_bytes = r.read_u64::<LittleEndian>()?;
        let compression = r.read_u8()?;
        let encryption = r.read_u8()?;
        let other_encoding = r.read_u16::<LittleEndian>()?;
        let r#type = r.read_u8()?;

        let mut item = btrfs_file_extent_item {
            generation,
            ram_bytes,
            compression,
            encryption,
            other_encoding,
            r#type,
            disk_bytenr: 0,
            disk_num_bytes: 0,
            offset: 0,
            num_bytes: 0,
        };
        if r#type != BTRFS_FILE_EXTENT_INLINE {
            item.disk_bytenr = r.read_u64::<LittleEndian>()?;
            item.disk_num_bytes = r.read_u64::<LittleEndian>()?;
            item.offset = r.read_u64::<LittleEndian>()?;
            item.num_bytes = r.read_u64::<LittleEndian>()?;
        }
        Ok(item)
    }
}

/// The superblock. Lives at `BTRFS_SUPER_INFO_OFFSET` on every device.
#[allow(non_camel_case_types)]
#[derive(Clone, Debug)]
pub struct btrfs_super_block {
    pub fsid: BtrfsFsid,
    pub bytenr: LE64,
    pub flags: LE64,
    pub magic: LE64,
    pub generation: LE64,
    pub root: LE64,
    pub chunk_root: LE64,
    pub log_root: LE64,
    pub total_bytes: LE64,
    pub bytes_used: LE64,
    pub root_dir_objectid: LE64,
    pub num_devices: LE64,
    pub sectorsize: LE32,
    pub nodesize: LE32,
    pub stripesize: LE32,
    pub sys_chunk_array_size: LE32,
    pub chunk_root_generation: LE64,
    pub compat_flags: LE64,
    pub compat_ro_flags: LE64,
    pub incompat_flags: LE64,
    pub csum_type: LE16,
    pub root_level: u8,
    pub chunk_root_level: u8,
    pub log_root_level: u8,
    pub dev_item: btrfs_dev_item,
    pub label: [u8; BTRFS_LABEL_SIZE],
    pub cache_generation: LE64,
    pub uuid_tree_generation: LE64,
    pub metadata_uuid: BtrfsFsid,
    pub nr_global_roots: LE64,
    pub sys_chunk_array: Vec<u8>,
}

impl btrfs_super_block {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < BTRFS_SUPER_INFO_SIZE {
            return Err(Error::Invalid(format!(
                "superblock truncated: {} bytes",
                buf.len()
            )));
        }
        let mut buf = &buf[..BTRFS_SUPER_INFO_SIZE];
        let r = &mut buf;
        skip(r, BTRFS_CSUM_SIZE)?;
        let fsid = read_array(r)?;
        let bytenr = r.read_u64::<LittleEndian>()?;
        let flags = r.read_u64::<LittleEndian>()?;
        let magic = r.read_u64::<LittleEndian>()?;
        let generation = r.read_u64::<LittleEndian>()?;
        let root = r.read_u64::<LittleEndian>()?;
        let chunk_root = r.read_u64::<LittleEndian>()?;
        let log_root = r.read_u64::<LittleEndian>()?;
        skip(r, 8)?; // unused log_root_transid
        let total_bytes = r.read_u64::<LittleEndian>()?;
        let bytes_used = r.read_u64::<LittleEndian>()?;
        let root_dir_objectid = r.read_u64::<LittleEndian>()?;
        let num_devices = r.read_u64::<LittleEndian>()?;
        let sectorsize = r.read_u32::<LittleEndian>()?;
        let nodesize = r.read_u32::<LittleEndian>()?;
        skip(r, 4)?; // unused leafsize
        let stripesize = r.read_u32::<LittleEndian>()?;
        let sys_chunk_array_size = r.read_u32::<LittleEndian>()?;
        let chunk_root_generation = r.read_u64::<LittleEndian>()?;
        let compat_flags = r.read_u64::<LittleEndian>()?;
        let compat_ro_flags = r.read_u64::<LittleEndian>()?;
        let incompat_flags = r.read_u64::<LittleEndian>()?;
        let csum_type = r.read_u16::<LittleEndian>()?;
        let root_level = r.read_u8()?;
        let chunk_root_level = r.read_u8()?;
        let log_root_level = r.read_u8()?;
        let dev_item = btrfs_dev_item::read_from(r)?;
        let label = read_array(r)?;
        let cache_generation = r.read_u64::<LittleEndian>()?;
        let uuid_tree_generation = r.read_u64::<LittleEndian>()?;
        let metadata_uuid = read_array(r)?;
        let nr_global_roots = r.read_u64::<LittleEndian>()?;
        skip(r, 27 * 8)?; // reserved
        let sys_chunk_array = read_vec(r, BTRFS_SYSTEM_CHUNK_ARRAY_SIZE)?;
        // backup roots and padding follow; nothing in them is needed

        if sys_chunk_array_size as usize > BTRFS_SYSTEM_CHUNK_ARRAY_SIZE {
            return Err(Error::Invalid(format!(
                "sys_chunk_array_size {sys_chunk_array_size} exceeds the array"
            )));
        }

        Ok(btrfs_super_block {
            fsid,
            bytenr,
            flags,
            magic,
            generation,
            root,
            chunk_root,
            log_root,
            total_bytes,
            bytes_used,
            root_dir_objectid,
            num_devices,
            sectorsize,
            nodesize,
            stripesize,
            sys_chunk_array_size,
            chunk_root_generation,
            compat_flags,
            compat_ro_flags,
            incompat_flags,
            csum_type,
            root_level,
            chunk_root_level,
            log_root_level,
            dev_item,
            label,
            cache_generation,
            uuid_tree_generation,
            metadata_uuid,
            nr_global_roots,
            sys_chunk_array,
        })
    }

    /// The label up to the first nul, decoded lossily.
    pub fn label_string(&self) -> String {
        let end = self
            .label
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(BTRFS_LABEL_SIZE);
        String::from_utf8_lossy(&self.label[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{LittleEndian, WriteBytesExt};

    use super::*;

    #[test]
    fn key_ordering_is_lexicographic() {
        let k = |objectid, item_type, offset| btrfs_disk_key {
            objectid,
            item_type,
            offset,
        };
        assert!(k(1, 200, 500) < k(2, 1, 0));
        assert!(k(5, BTRFS_DIR_ITEM_KEY, 9) < k(5, BTRFS_DIR_INDEX_KEY, 0));
        assert!(k(5, BTRFS_DIR_ITEM_KEY, 1) < k(5, BTRFS_DIR_ITEM_KEY, 2));
        assert_eq!(k(5, 1, 2), k(5, 1, 2));
    }

    #[test]
    fn parse_key_roundtrip() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(256).unwrap();
        buf.write_u8(BTRFS_CHUNK_ITEM_KEY).unwrap();
        buf.write_u64::<LittleEndian>(0x100000).unwrap();
        let key = btrfs_disk_key::parse(&buf).unwrap();
        assert_eq!(key.objectid, 256);
        assert_eq!(key.item_type, BTRFS_CHUNK_ITEM_KEY);
        assert_eq!(key.offset, 0x100000);
    }

    #[test]
    fn parse_inode_item() {
        let mut buf = Vec::new();
        for v in [7_u64, 8, 1234, 4096, 0] {
            buf.write_u64::<LittleEndian>(v).unwrap();
        }
        for v in [2_u32, 1000, 1000, 0o100644] {
            buf.write_u32::<LittleEndian>(v).unwrap();
        }
        buf.write_u64::<LittleEndian>(0).unwrap(); // rdev
        buf.write_u64::<LittleEndian>(0).unwrap(); // flags
        buf.write_u64::<LittleEndian>(0).unwrap(); // sequence
        buf.extend_from_slice(&[0_u8; 32]); // reserved
        for _ in 0..4 {
            buf.write_u64::<LittleEndian>(1_600_000_000).unwrap();
            buf.write_u32::<LittleEndian>(500).unwrap();
        }
        assert_eq!(buf.len(), BTRFS_INODE_ITEM_SIZE);

        let inode = btrfs_inode_item::parse(&buf).unwrap();
        assert_eq!(inode.size, 1234);
        assert_eq!(inode.nlink, 2);
        assert_eq!(inode.mode, 0o100644);
        assert_eq!(inode.atime.nanos(), 1_600_000_000 * 1_000_000_000 + 500);
    }

    #[test]
    fn parse_dir_item_with_name() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(257).unwrap();
        buf.write_u8(BTRFS_INODE_ITEM_KEY).unwrap();
        buf.write_u64::<LittleEndian>(0).unwrap();
        buf.write_u64::<LittleEndian>(11).unwrap(); // transid
        buf.write_u16::<LittleEndian>(0).unwrap(); // data_len
        buf.write_u16::<LittleEndian>(5).unwrap(); // name_len
        buf.write_u8(BTRFS_FT_REG_FILE).unwrap();
        buf.extend_from_slice(b"hello");

        let item = btrfs_dir_item::parse(&buf).unwrap();
        assert_eq!(item.location.objectid, 257);
        assert_eq!(item.r#type, BTRFS_FT_REG_FILE);
        assert_eq!(item.name, b"hello");
        assert!(item.data.is_empty());
    }

    #[test]
    fn parse_chunk_with_stripes() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(0x400000).unwrap(); // length
        buf.write_u64::<LittleEndian>(2).unwrap(); // owner
        buf.write_u64::<LittleEndian>(0x10000).unwrap(); // stripe_len
        buf.write_u64::<LittleEndian>(BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID1)
            .unwrap();
        buf.write_u32::<LittleEndian>(0x10000).unwrap();
        buf.write_u32::<LittleEndian>(0x10000).unwrap();
        buf.write_u32::<LittleEndian>(4096).unwrap();
        buf.write_u16::<LittleEndian>(2).unwrap(); // num_stripes
        buf.write_u16::<LittleEndian>(0).unwrap(); // sub_stripes
        for devid in [1_u64, 2] {
            buf.write_u64::<LittleEndian>(devid).unwrap();
            buf.write_u64::<LittleEndian>(0x800000 * devid).unwrap();
            buf.extend_from_slice(&[devid as u8; 16]);
        }

        let chunk = btrfs_chunk::parse(&buf).unwrap();
        assert_eq!(chunk.length, 0x400000);
        assert_eq!(chunk.num_stripes, 2);
        assert_eq!(chunk.stripes[1].devid, 2);
        assert_eq!(chunk.stripes[1].offset, 0x1000000);
    }

    #[test]
    fn parse_file_extent_variants() {
        let mut buf = Vec::new();
        buf.write_u64::<LittleEndian>(9).unwrap();
        buf.write_u64::<LittleEndian>(64).unwrap();
        buf.write_u8(BTRFS_COMPRESS_NONE).unwrap();
        buf.write_u8(0).unwrap();
        buf.write_u16::<LittleEndian>(0).unwrap();
        buf.write_u8(BTRFS_FILE_EXTENT_INLINE).unwrap();
        assert_eq!(buf.len(), BTRFS_FILE_EXTENT_INLINE_HEADER_SIZE);
        buf.extend_from_slice(b"inline data");

        let inline = btrfs_file_extent_item::parse(&buf).unwrap();
        assert_eq!(inline.r#type, BTRFS_FILE_EXTENT_INLINE);
        assert_eq!(inline.disk_bytenr, 0);

        let mut buf = buf[..BTRFS_FILE_EXTENT_INLINE_HEADER_SIZE].to_vec();
        buf[20] = BTRFS_FILE_EXTENT_REG;
        buf.write_u64::<LittleEndian>(0x1000000).unwrap();
        buf.write_u64::<LittleEndian>(0x4000).unwrap();
        buf.write_u64::<LittleEndian>(0x1000).unwrap();
        buf.write_u64::<LittleEndian>(0x3000).unwrap();
        assert_eq!(buf.len(), BTRFS_FILE_EXTENT_REG_SIZE);

        let reg = btrfs_file_extent_item::parse(&buf).unwrap();
        assert_eq!(reg.disk_bytenr, 0x1000000);
        assert_eq!(reg.disk_num_bytes, 0x4000);
        assert_eq!(reg.offset, 0x1000);
        assert_eq!(reg.num_bytes, 0x3000);
    }

    #[test]
    fn raid_profiles() {
        let p = |flags| raid_profile(flags).unwrap();
        assert_eq!(p(BTRFS_BLOCK_GROUP_DATA).tolerated_failures, 0);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID0).tolerated_failures, 0);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID1).tolerated_failures, 1);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID1C3).ncopies, 3);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID1C4).tolerated_failures, 3);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID5).nparity, 1);
        assert_eq!(p(BTRFS_BLOCK_GROUP_RAID6).nparity, 2);
        assert_eq!(p(BTRFS_BLOCK_GROUP_DUP).ncopies, 2);
        assert!(raid_profile(BTRFS_BLOCK_GROUP_RAID0 | BTRFS_BLOCK_GROUP_RAID1).is_err());
    }

    #[test]
    fn name_hash_is_stable_and_distinct() {
        let a = name_hash(b"default");
        assert_eq!(a, name_hash(b"default"));
        assert_ne!(a, name_hash(b"defaulu"));
        assert_ne!(name_hash(b""), 0);
    }
}
