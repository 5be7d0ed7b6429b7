use std::io::{self, Read, Seek, SeekFrom};
use std::rc::Rc;

use flate2::read::ZlibDecoder;

use crate::chunk::ChunkStream;
use crate::error::{Error, Result};
use crate::structures::*;

/// One run of file bytes: where they live on disk (through the logical
/// address space) and how they are encoded. A `(0, 0)` disk offset/length
/// pair is a sparse hole.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Extent {
    pub compression: u8,
    pub encryption: u8,
    pub disk_offset: u64,
    pub disk_length: u64,
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub const SPARSE_ZERO: Extent = Extent {
        compression: 0,
        encryption: 0,
        disk_offset: 0,
        disk_length: 0,
        offset: 0,
        length: 0,
    };

    pub(crate) fn sparse(length: u64) -> Extent {
        Extent {
            length,
            ..Extent::SPARSE_ZERO
        }
    }

    pub fn is_sparse(&self) -> bool {
        (self.disk_offset, self.disk_length) == (0, 0)
    }
}

/// Decode one extent's worth of data.
///
/// The encryption byte is required to be zero; Btrfs has never shipped
/// extent encryption.
pub fn decode_extent(
    buf: &[u8],
    compression: u8,
    encryption: u8,
    sector_size: u32,
) -> Result<Vec<u8>> {
    if encryption != 0 {
        return Err(Error::Unsupported(format!(
            "extent encryption type {encryption}"
        )));
    }

    match compression {
        BTRFS_COMPRESS_NONE => Ok(buf.to_vec()),
        BTRFS_COMPRESS_ZLIB => {
            let mut out = Vec::new();
            ZlibDecoder::new(buf)
                .read_to_end(&mut out)
                .map_err(|e| Error::Invalid(format!("bad zlib extent: {e}")))?;
            Ok(out)
        }
        BTRFS_COMPRESS_LZO => decode_lzo(buf, sector_size),
        BTRFS_COMPRESS_ZSTD => decode_zstd(buf),
        other => Err(Error::Unsupported(format!("compression type {other}"))),
    }
}

/// Btrfs frames LZO extents itself: a leading u32 with the total compressed
/// size, then `(u32 segment_len, segment)` pairs. Segment headers never
/// straddle a sector boundary; the writer pads to the next sector when
/// fewer than four bytes remain. A zero length terminates.
/// Reference: fs/btrfs/lzo.c.
#[cfg(feature = "lzo")]
fn decode_lzo(buf: &[u8], sector_size: u32) -> Result<Vec<u8>> {
    use byteorder::{ByteOrder, LittleEndian};

    let sector_size = sector_size as usize;
    let worst = lzo_worst_compress(sector_size);
    let mut out = Vec::new();
    let mut pos = 4; // total compressed size, not needed for decoding

    loop {
        if pos + 4 > buf.len() {
            break;
        }
        let segment_len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
        pos += 4;
        if segment_len == 0 {
            break;
        }

        let payload = buf
            .get(pos..pos + segment_len)
            .ok_or_else(|| Error::Invalid("lzo segment escapes the extent".into()))?;
        pos += segment_len;

        let mut segment = vec![0_u8; worst];
        let (decoded, err) = rust_lzo::LZOContext::decompress_to_slice(payload, &mut segment);
        if !matches!(err, rust_lzo::LZOError::OK) {
            return Err(Error::Invalid("lzo segment did not decompress".into()));
        }
        out.extend_from_slice(decoded);

        let sector_remaining = sector_size - (pos % sector_size);
        if sector_remaining < 4 {
            pos += sector_remaining;
        }
    }

    Ok(out)
}

#[cfg(not(feature = "lzo"))]
fn decode_lzo(_buf: &[u8], _sector_size: u32) -> Result<Vec<u8>> {
    Err(Error::Unsupported(
        "LZO compressed extent (built without the `lzo` feature)".into(),
    ))
}

/// Worst-case LZO expansion of one sector.
#[cfg(feature = "lzo")]
fn lzo_worst_compress(size: usize) -> usize {
    size + (size / 16) + 64 + 3
}

#[cfg(feature = "zstd")]
fn decode_zstd(buf: &[u8]) -> Result<Vec<u8>> {
    zstd::stream::decode_all(buf).map_err(|e| Error::Invalid(format!("bad zstd extent: {e}")))
}

#[cfg(not(feature = "zstd"))]
fn decode_zstd(_buf: &[u8]) -> Result<Vec<u8>> {
    Err(Error::Unsupported(
        "zstd compressed extent (built without the `zstd` feature)".into(),
    ))
}

/// A byte stream stitched together from an ordered extent list.
///
/// `extent_offsets` holds the cumulative start of every extent after the
/// first, so the extent containing a position is a binary search away.
pub struct ExtentStream {
    stream: Rc<ChunkStream>,
    extents: Vec<Extent>,
    extent_offsets: Vec<u64>,
    size: u64,
    sector_size: u32,
    pos: u64,
}

impl ExtentStream {
    pub(crate) fn new(
        stream: Rc<ChunkStream>,
        extents: Vec<Extent>,
        size: u64,
        sector_size: u32,
    ) -> Self {
        let mut extent_offsets = Vec::with_capacity(extents.len().saturating_sub(1));
        let mut offset = 0_u64;
        for extent in &extents {
            if offset != 0 {
                extent_offsets.push(offset);
            }
            offset += extent.length;
        }
        ExtentStream {
            stream,
            extents,
            extent_offsets,
            size,
            sector_size,
            pos: 0,
        }
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Serve up to `want` bytes from the one extent containing `pos`. An
    /// empty result means the extent list is exhausted.
    fn read_in_extent(&self, pos: u64, want: usize) -> Result<Vec<u8>> {
        let extent_idx = self.extent_offsets.partition_point(|&o| o <= pos);
        if extent_idx >= self.extents.len() {
            return Ok(Vec::new());
        }
        let extent_start = if extent_idx == 0 {
            0
        } else {
            self.extent_offsets[extent_idx - 1]
        };
        let extent = &self.extents[extent_idx];

        let mut extent_pos = pos - extent_start;
        let extent_remaining = extent.length.saturating_sub(extent_pos);
        if extent_remaining == 0 {
            return Ok(Vec::new());
        }
        let count = (want as u64).min(extent_remaining).min(self.size - pos) as usize;

        if extent.is_sparse() {
            return Ok(vec![0_u8; count]);
        }

        // The record's own offset shifts the window into the disk extent.
        extent_pos += extent.offset;

        if (extent.compression, extent.encryption) == (BTRFS_COMPRESS_NONE, 0) {
            // Straight through, no staging buffer.
            return self
                .stream
                .read_exact_at(extent.disk_offset + extent_pos, count);
        }

        let raw = self
            .stream
            .read_exact_at(extent.disk_offset, extent.disk_length as usize)?;
        let decoded = decode_extent(&raw, extent.compression, extent.encryption, self.sector_size)?;
        let start = extent_pos as usize;
        decoded
            .get(start..start + count)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| {
                Error::Invalid(format!(
                    "extent at {:#x} decoded to {} bytes, expected at least {}",
                    extent.disk_offset,
                    decoded.len(),
                    start + count
                ))
            })
    }
}

impl Read for ExtentStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let chunk = self
            .read_in_extent(self.pos, buf.len())
            .map_err(io::Error::from)?;
        if chunk.is_empty() {
            return Ok(0);
        }
        buf[..chunk.len()].copy_from_slice(&chunk);
        self.pos += chunk.len() as u64;
        Ok(chunk.len())
    }

    /// Hand each extent a window as large as the remainder so compressed
    /// extents are decoded once, not once per default-sized read.
    fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        let remaining = self.size.saturating_sub(self.pos) as usize;
        let start = out.len();
        out.resize(start + remaining, 0);
        let mut filled = 0;
        while filled < remaining {
            let n = self.read(&mut out[start + filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        out.truncate(start + filled);
        Ok(filled)
    }
}

impl Seek for ExtentStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(delta) => self.size as i128 + delta as i128,
            SeekFrom::Current(delta) => self.pos as i128 + delta as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}

/// The data stream behind [`crate::Inode::open`]: either an in-memory
/// buffer (inline and empty files) or an [`ExtentStream`].
pub enum FileStream {
    Buffered(io::Cursor<Vec<u8>>),
    Extents(ExtentStream),
}

impl FileStream {
    pub(crate) fn from_buffer(buf: Vec<u8>) -> Self {
        FileStream::Buffered(io::Cursor::new(buf))
    }

    /// The extent list, or `None` for buffer-backed (inline) files.
    pub fn extents(&self) -> Option<&[Extent]> {
        match self {
            FileStream::Buffered(_) => None,
            FileStream::Extents(stream) => Some(stream.extents()),
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            FileStream::Buffered(cursor) => cursor.get_ref().len() as u64,
            FileStream::Extents(stream) => stream.size(),
        }
    }
}

impl Read for FileStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            FileStream::Buffered(cursor) => cursor.read(buf),
            FileStream::Extents(stream) => stream.read(buf),
        }
    }

    fn read_to_end(&mut self, out: &mut Vec<u8>) -> io::Result<usize> {
        match self {
            FileStream::Buffered(cursor) => cursor.read_to_end(out),
            FileStream::Extents(stream) => stream.read_to_end(out),
        }
    }
}

impl Seek for FileStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            FileStream::Buffered(cursor) => cursor.seek(pos),
            FileStream::Extents(stream) => stream.seek(pos),
        }
    }
}
