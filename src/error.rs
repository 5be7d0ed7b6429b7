use std::io;

use thiserror::Error;

/// Everything that can go wrong while reading a Btrfs volume.
///
/// Parsing failures are fatal for the call that hit them but do not poison
/// the filesystem; unaffected regions can still be served.
#[derive(Debug, Error)]
pub enum Error {
    /// Structurally invalid on-disk data: bad magic, mixed fsids, malformed
    /// chunk array, truncated records.
    #[error("invalid btrfs data: {0}")]
    Invalid(String),

    /// A key or a path does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    #[error("inode {0} is not a directory")]
    NotADirectory(u64),

    #[error("inode {0} is not a symlink")]
    NotASymlink(u64),

    /// The image requires a capability this crate does not have: extent
    /// encryption, RAID5/6 reconstruction, or a codec compiled out.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A state the on-disk format promises cannot happen.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<Error> for io::Error {
    fn from(err: Error) -> io::Error {
        match err {
            Error::Io(e) => e,
            Error::Unsupported(_) => io::Error::new(io::ErrorKind::Unsupported, err),
            Error::NotFound(_) => io::Error::new(io::ErrorKind::NotFound, err),
            Error::Invalid(_) => io::Error::new(io::ErrorKind::InvalidData, err),
            _ => io::Error::new(io::ErrorKind::Other, err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
