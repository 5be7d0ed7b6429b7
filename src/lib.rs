//! Read-only access to Btrfs filesystem images.
//!
//! Pass every device of a volume as a seekable stream and get a POSIX-like
//! view back: subvolumes, directories, inodes, symlinks, file contents with
//! zlib/lzo/zstd compression and sparse extents, on top of the chunk-mapped
//! logical address space with RAID mirror failover.
//!
//! ```no_run
//! use std::fs::File;
//! use std::io::Read;
//!
//! use btrfs_kit::{Btrfs, ReadSeek};
//!
//! # fn main() -> btrfs_kit::Result<()> {
//! let image = File::open("disk.img")?;
//! let fs = Btrfs::open(vec![Box::new(image) as Box<dyn ReadSeek>])?;
//! let mut contents = Vec::new();
//! fs.get("etc/hostname")?.open()?.read_to_end(&mut contents)?;
//! # Ok(())
//! # }
//! ```

pub mod btrfs;
pub mod chunk;
pub mod error;
pub mod extent;
pub mod inode;
pub mod structures;
pub mod tree;

pub use crate::btrfs::{Btrfs, SubvolumeIter, SysChunkIter};
pub use crate::chunk::{ChunkStream, Device, ReadSeek};
pub use crate::error::{Error, Result};
pub use crate::extent::{decode_extent, Extent, ExtentStream, FileStream};
pub use crate::inode::{DirIter, Inode, PathsIter, Subvolume};
pub use crate::structures::name_hash;
pub use crate::tree::{BTree, Cursor, ItemIter};
