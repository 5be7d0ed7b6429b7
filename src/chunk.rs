use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::rc::Rc;

use log::debug;
use more_asserts::debug_assert_le;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::structures::*;

/// A device of the volume: any seekable byte source. The filesystem only
/// ever seeks and reads; it never closes the stream.
pub trait ReadSeek: Read + Seek {}
impl<T: Read + Seek> ReadSeek for T {}

/// Devices are shared between the chunk map and the superblock bookkeeping.
pub type Device = Rc<RefCell<Box<dyn ReadSeek>>>;

/// One contiguous region on a single device participating in a chunk.
/// `device` is `None` when the backing disk was not supplied.
pub struct Stripe {
    pub devid: LE64,
    pub offset: LE64,
    pub dev_uuid: Uuid,
    pub device: Option<Device>,
}

impl std::fmt::Debug for Stripe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stripe")
            .field("devid", &self.devid)
            .field("offset", &self.offset)
            .field("dev_uuid", &self.dev_uuid)
            .field("device", &self.device.as_ref().map(|_| "Device"))
            .finish()
    }
}

/// A chunk: a region of the logical address space and its resolved stripes.
#[derive(Debug)]
pub struct Chunk {
    pub offset: LE64,
    pub length: LE64,
    pub stripe_length: LE64,
    pub r#type: LE64,
    pub num_stripes: u64,
    pub sub_stripes: u64,
    pub data_stripes: u64,
    pub stripes: Vec<Stripe>,
}

/// A seekable byte source over the logical address space. Every metadata
/// read except the superblock itself goes through here.
///
/// Chunks are kept ordered by logical offset and found by binary search.
/// Reads below the first chunk (and in gaps between chunks) produce zero
/// bytes; reads past the last chunk stop short.
pub struct ChunkStream {
    devices: HashMap<u64, Device>,
    chunks: RefCell<Vec<Chunk>>,
}

impl std::fmt::Debug for ChunkStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStream")
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .field("chunks", &self.chunks)
            .finish()
    }
}

impl ChunkStream {
    pub fn new(devices: HashMap<u64, Device>) -> Self {
        ChunkStream {
            devices,
            chunks: RefCell::new(Vec::new()),
        }
    }

    /// Install a chunk at `offset`. Idempotent: if an installed chunk
    /// already covers `offset` the call is a no-op. Fails when more stripes
    /// are missing their device than the profile tolerates.
    pub fn add(&self, offset: u64, chunk: &btrfs_chunk) -> Result<()> {
        {
            let chunks = self.chunks.borrow();
            let idx = chunks.partition_point(|c| c.offset <= offset);
            if idx > 0 {
                let existing = &chunks[idx - 1];
                if existing.offset + existing.length > offset {
                    return Ok(());
                }
            }
        }

        if chunk.stripe_len == 0 {
            return Err(Error::Invalid(format!(
                "chunk at {offset:#x} has zero stripe length"
            )));
        }
        if chunk.r#type & BTRFS_BLOCK_GROUP_RAID10 != 0 && chunk.sub_stripes == 0 {
            return Err(Error::Invalid(format!(
                "RAID10 chunk at {offset:#x} has zero sub-stripes"
            )));
        }

        let profile = raid_profile(chunk.r#type)?;
        if chunk.num_stripes <= profile.nparity {
            return Err(Error::Invalid(format!(
                "chunk at {offset:#x} has fewer stripes than parity devices"
            )));
        }
        let data_stripes = (chunk.num_stripes - profile.nparity) / profile.ncopies;
        if data_stripes == 0 {
            return Err(Error::Invalid(format!(
                "chunk at {offset:#x} has no data stripes"
            )));
        }

        let mut stripes = Vec::with_capacity(chunk.stripes.len());
        let mut missing_devices = 0;
        for stripe in &chunk.stripes {
            let device = self.devices.get(&stripe.devid).cloned();
            let dev_uuid = Uuid::from_bytes(stripe.dev_uuid);

            if device.is_none() {
                if missing_devices < profile.tolerated_failures {
                    missing_devices += 1;
                } else {
                    return Err(Error::Internal(format!(
                        "Missing stripe disk for chunk offset {offset:#x}: {} ({dev_uuid})",
                        stripe.devid
                    )));
                }
            }

            stripes.push(Stripe {
                devid: stripe.devid,
                offset: stripe.offset,
                dev_uuid,
                device,
            });
        }

        debug!(
            "add chunk: offset {offset:#x} length {:#x} type {:#x} stripes {}",
            chunk.length, chunk.r#type, chunk.num_stripes
        );

        let mut chunks = self.chunks.borrow_mut();
        let idx = chunks.partition_point(|c| c.offset <= offset);
        chunks.insert(
            idx,
            Chunk {
                offset,
                length: chunk.length,
                stripe_length: chunk.stripe_len,
                r#type: chunk.r#type,
                num_stripes: chunk.num_stripes as u64,
                sub_stripes: chunk.sub_stripes as u64,
                data_stripes: data_stripes as u64,
                stripes,
            },
        );
        Ok(())
    }

    /// Read up to `length` bytes from the logical address space. The result
    /// is shorter than `length` only when the range runs past the last
    /// installed chunk.
    pub fn read_at(&self, mut offset: u64, length: usize) -> Result<Vec<u8>> {
        let chunks = self.chunks.borrow();
        let mut remaining = length as u64;
        let mut out = Vec::with_capacity(length);

        while remaining > 0 {
            let idx = chunks.partition_point(|c| c.offset <= offset);
            if idx == 0 {
                // Below the lowest chunk: zero fill until it starts.
                let Some(first) = chunks.first() else { break };
                let count = remaining.min(first.offset - offset);
                out.resize(out.len() + count as usize, 0);
                offset += count;
                remaining -= count;
                continue;
            }

            let chunk = &chunks[idx - 1];
            let mut chunk_offset = offset - chunk.offset;
            if chunk_offset >= chunk.length {
                // In a gap between chunks: zeros until the next one.
                let Some(next) = chunks.get(idx) else { break };
                let count = remaining.min(next.offset - offset);
                out.resize(out.len() + count as usize, 0);
                offset += count;
                remaining -= count;
                continue;
            }

            let mut chunk_remaining = chunk.length - chunk_offset;
            while remaining > 0 && chunk_remaining > 0 {
                let (stripe_num, stripe_idx, stripe_offset, stripe_remaining) =
                    stripe_read_info(chunk, chunk_offset);
                let count = stripe_remaining.min(remaining);
                let (stripe, device) = self.resolve_stripe(chunk, stripe_idx)?;

                let physical = stripe.offset + stripe_offset + stripe_num * chunk.stripe_length;
                debug!(
                    "read {count:#x} bytes at logical {offset:#x}: devid {} physical {physical:#x}",
                    stripe.devid
                );

                let mut device = device.borrow_mut();
                device.seek(SeekFrom::Start(physical))?;
                let start = out.len();
                out.resize(start + count as usize, 0);
                device.read_exact(&mut out[start..])?;

                offset += count;
                remaining -= count;
                chunk_offset += count;
                chunk_remaining -= count;
            }
        }

        Ok(out)
    }

    /// `read_at`, but a short read is an error.
    pub fn read_exact_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let buf = self.read_at(offset, length)?;
        if buf.len() != length {
            return Err(Error::Invalid(format!(
                "short read at logical {offset:#x}: {} of {length} bytes",
                buf.len()
            )));
        }
        Ok(buf)
    }

    /// Pick the stripe at `stripe_idx`, routing around missing devices.
    /// Tolerance was enforced in `add`, so a surviving mirror exists for
    /// every profile except RAID5/6, where a degraded read is fatal.
    fn resolve_stripe<'a>(
        &self,
        chunk: &'a Chunk,
        mut stripe_idx: u64,
    ) -> Result<(&'a Stripe, Device)> {
        for _ in 0..=chunk.num_stripes {
            let stripe = &chunk.stripes[(stripe_idx % chunk.num_stripes) as usize];
            if let Some(device) = &stripe.device {
                return Ok((stripe, Rc::clone(device)));
            }

            if chunk.r#type & BTRFS_BLOCK_GROUP_DUP != 0 {
                stripe_idx = 1;
            } else if chunk.r#type & BTRFS_BLOCK_GROUP_RAID56_MASK != 0 {
                return Err(Error::Unsupported(
                    "RAID5/6 reconstruction from parity".into(),
                ));
            } else {
                stripe_idx += 1;
            }
        }
        Err(Error::Internal(format!(
            "no stripe with a present device in chunk at {:#x}",
            chunk.offset
        )))
    }

    #[cfg(test)]
    fn chunk_count(&self) -> usize {
        self.chunks.borrow().len()
    }
}

/// Split a chunk-relative offset into `(stripe_num, stripe_idx,
/// in_stripe_offset, remaining)` per the chunk's profile.
/// Reference: `__btrfs_map_block`.
fn stripe_read_info(chunk: &Chunk, offset: u64) -> (u64, u64, u64, u64) {
    let mut stripe_num = offset / chunk.stripe_length;
    let stripe_offset = offset % chunk.stripe_length;
    let mut stripe_idx = 0;

    if chunk.r#type & BTRFS_BLOCK_GROUP_RAID0 != 0 {
        stripe_idx = stripe_num % chunk.num_stripes;
        stripe_num /= chunk.num_stripes;
    } else if chunk.r#type & BTRFS_BLOCK_GROUP_RAID1_MASK != 0 {
        // Any mirror will do.
    } else if chunk.r#type & BTRFS_BLOCK_GROUP_DUP != 0 {
        // Either duplicate will do.
    } else if chunk.r#type & BTRFS_BLOCK_GROUP_RAID10 != 0 {
        let factor = chunk.num_stripes / chunk.sub_stripes;
        stripe_idx = stripe_num % factor;
        stripe_num /= factor;
    } else if chunk.r#type & BTRFS_BLOCK_GROUP_RAID56_MASK != 0 {
        stripe_idx = stripe_num % chunk.data_stripes;
        stripe_num /= chunk.data_stripes;
        stripe_idx = (stripe_num + stripe_idx) % chunk.num_stripes;
    } else {
        stripe_idx = stripe_num % chunk.num_stripes;
        stripe_num /= chunk.num_stripes;
    }

    let stripe_remaining = if chunk.r#type & BTRFS_BLOCK_GROUP_STRIPE_MASK != 0 {
        chunk.stripe_length - stripe_offset
    } else {
        chunk.length - offset
    };
    debug_assert_le!(stripe_offset, chunk.stripe_length);

    (stripe_num, stripe_idx, stripe_offset, stripe_remaining)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn device(data: Vec<u8>) -> Device {
        Rc::new(RefCell::new(Box::new(Cursor::new(data)) as Box<dyn ReadSeek>))
    }

    fn devices(entries: Vec<(u64, Vec<u8>)>) -> HashMap<u64, Device> {
        entries.into_iter().map(|(id, d)| (id, device(d))).collect()
    }

    fn raw_chunk(
        length: u64,
        stripe_len: u64,
        r#type: u64,
        sub_stripes: u16,
        stripes: Vec<(u64, u64)>,
    ) -> btrfs_chunk {
        btrfs_chunk {
            length,
            owner: BTRFS_EXTENT_TREE_OBJECTID,
            stripe_len,
            r#type,
            io_align: 0x10000,
            io_width: 0x10000,
            sector_size: 4096,
            num_stripes: stripes.len() as u16,
            sub_stripes,
            stripes: stripes
                .into_iter()
                .map(|(devid, offset)| btrfs_stripe {
                    devid,
                    offset,
                    dev_uuid: [devid as u8; 16],
                })
                .collect(),
        }
    }

    #[test]
    fn single_profile_reads_through_one_stripe() {
        let mut data = vec![0_u8; 0x200];
        for (i, b) in data.iter_mut().enumerate() {
            *b = i as u8;
        }
        let stream = ChunkStream::new(devices(vec![(1, data)]));
        stream
            .add(
                0x1000,
                &raw_chunk(0x100, 0x40, BTRFS_BLOCK_GROUP_DATA, 0, vec![(1, 0x80)]),
            )
            .unwrap();

        // Interior read maps straight onto the device.
        let buf = stream.read_at(0x1010, 0x20).unwrap();
        assert_eq!(buf.as_slice(), &(0x90..0xB0).map(|b| b as u8).collect::<Vec<_>>()[..]);

        // Below the first chunk reads as zeros up into the chunk.
        let buf = stream.read_at(0xFFC, 8).unwrap();
        assert_eq!(buf.as_slice(), &[0, 0, 0, 0, 0x80, 0x81, 0x82, 0x83]);

        // Past the last chunk the read stops short.
        let buf = stream.read_at(0x10F0, 0x40).unwrap();
        assert_eq!(buf.len(), 0x10);
    }

    #[test]
    fn add_is_idempotent_for_covered_offsets() {
        let stream = ChunkStream::new(devices(vec![(1, vec![0_u8; 0x1000])]));
        let chunk = raw_chunk(0x100, 0x40, BTRFS_BLOCK_GROUP_SYSTEM, 0, vec![(1, 0)]);
        stream.add(0x1000, &chunk).unwrap();
        stream.add(0x1000, &chunk).unwrap();
        assert_eq!(stream.chunk_count(), 1);
    }

    #[test]
    fn raid0_interleaves_stripes() {
        let stream = ChunkStream::new(devices(vec![
            (1, vec![b'A'; 0x100]),
            (2, vec![b'B'; 0x100]),
        ]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID0,
                    0,
                    vec![(1, 0), (2, 0)],
                ),
            )
            .unwrap();

        let buf = stream.read_at(0, 0x100).unwrap();
        let mut expected = Vec::new();
        for unit in [b'A', b'B', b'A', b'B'] {
            expected.extend(std::iter::repeat(unit).take(0x40));
        }
        assert_eq!(buf, expected);
    }

    #[test]
    fn raid1_fails_over_to_surviving_mirror() {
        // Device 1 is gone; RAID1 tolerates one missing disk.
        let stream = ChunkStream::new(devices(vec![(2, vec![b'M'; 0x100])]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_METADATA | BTRFS_BLOCK_GROUP_RAID1,
                    0,
                    vec![(1, 0), (2, 0)],
                ),
            )
            .unwrap();

        let buf = stream.read_at(0, 0x80).unwrap();
        assert_eq!(buf, vec![b'M'; 0x80]);
    }

    #[test]
    fn missing_device_beyond_tolerance_fails_at_add() {
        let stream = ChunkStream::new(devices(vec![(1, vec![0_u8; 0x100])]));
        let err = stream
            .add(
                0x2000,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID0,
                    0,
                    vec![(1, 0), (2, 0)],
                ),
            )
            .unwrap_err();
        match err {
            Error::Internal(msg) => {
                assert!(msg.starts_with("Missing stripe disk for chunk offset"))
            }
            other => panic!("expected Internal, got {other:?}"),
        }
    }

    #[test]
    fn raid10_reads_one_mirror_of_each_group() {
        let stream = ChunkStream::new(devices(vec![
            (1, vec![b'x'; 0x100]),
            (2, vec![b'y'; 0x100]),
        ]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID10,
                    2,
                    vec![(1, 0), (2, 0)],
                ),
            )
            .unwrap();

        // Two stripes, two sub-stripes: one mirror group, always index 0.
        let buf = stream.read_at(0, 0x80).unwrap();
        assert_eq!(buf, vec![b'x'; 0x80]);

        // Drop the preferred mirror; the read routes to the other one.
        let stream = ChunkStream::new(devices(vec![(2, vec![b'y'; 0x100])]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID10,
                    2,
                    vec![(1, 0), (2, 0)],
                ),
            )
            .unwrap();
        let buf = stream.read_at(0, 0x40).unwrap();
        assert_eq!(buf, vec![b'y'; 0x40]);
    }

    #[test]
    fn raid5_maps_with_rotating_parity() {
        // Three devices, stripe length 0x40, two data stripes per row.
        let stream = ChunkStream::new(devices(vec![
            (1, vec![b'1'; 0x100]),
            (2, vec![b'2'; 0x100]),
            (3, vec![b'3'; 0x100]),
        ]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID5,
                    0,
                    vec![(1, 0), (2, 0), (3, 0)],
                ),
            )
            .unwrap();

        // Row 0 reads devices 1 and 2; row 1 rotates onto devices 2 and 3.
        let buf = stream.read_at(0, 0x100).unwrap();
        let mut expected = Vec::new();
        for unit in [b'1', b'2', b'2', b'3'] {
            expected.extend(std::iter::repeat(unit).take(0x40));
        }
        assert_eq!(buf, expected);
    }

    #[test]
    fn degraded_raid5_read_is_unsupported() {
        // Device 2 is missing; RAID5 tolerates one loss at add time but
        // cannot serve reads that land on the lost stripe.
        let stream = ChunkStream::new(devices(vec![
            (1, vec![b'1'; 0x100]),
            (3, vec![b'3'; 0x100]),
        ]));
        stream
            .add(
                0,
                &raw_chunk(
                    0x100,
                    0x40,
                    BTRFS_BLOCK_GROUP_DATA | BTRFS_BLOCK_GROUP_RAID5,
                    0,
                    vec![(1, 0), (2, 0), (3, 0)],
                ),
            )
            .unwrap();

        // First stripe lives on device 1 and still reads fine.
        assert_eq!(stream.read_at(0, 0x40).unwrap(), vec![b'1'; 0x40]);
        // The second stripe needs device 2.
        match stream.read_at(0x40, 0x40).unwrap_err() {
            Error::Unsupported(_) => {}
            other => panic!("expected Unsupported, got {other:?}"),
        }
    }
}
