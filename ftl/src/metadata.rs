//! The metadata anchor: a crash-safe slot for small snapshots.
//!
//! Every snapshot is one ECC frame appended to the anchor partition:
//! a magic tag, a monotonic sequence number, the cursor state of every
//! partition, then an opaque blob from the layer above. Recovery scans the
//! whole anchor partition and takes the highest sequence number it finds,
//! so wrapping back to the first block needs no bookkeeping beyond the
//! counter itself.

use flash_device::{BlockDevice, EccCodec, SubpageIndex};

use crate::partition::PARTITION_STATE_SIZE;
use crate::{Ftl, FtlError};

const MAGIC: [u8; 4] = *b"FTLM";

/// magic + sequence + partition count
const FIXED_HEADER: usize = 4 + 4 + 1;
const BLOB_LEN_SIZE: usize = 2;

struct ParsedMeta {
    sequence: u32,
    state_start: usize,
    blob_start: usize,
    blob_len: usize,
}

fn parse(payload: &[u8], partition_count: usize) -> Option<ParsedMeta> {
    if payload.len() < FIXED_HEADER {
        return None;
    }
    if payload[0..4] != MAGIC {
        return None;
    }
    let sequence = u32::from_le_bytes([payload[4], payload[5], payload[6], payload[7]]);
    if payload[8] as usize != partition_count {
        return None;
    }
    let state_start = FIXED_HEADER;
    let blob_len_at = state_start + partition_count * PARTITION_STATE_SIZE;
    if payload.len() < blob_len_at + BLOB_LEN_SIZE {
        return None;
    }
    let blob_len = u16::from_le_bytes([payload[blob_len_at], payload[blob_len_at + 1]]) as usize;
    let blob_start = blob_len_at + BLOB_LEN_SIZE;
    if payload.len() < blob_start + blob_len {
        return None;
    }
    Some(ParsedMeta {
        sequence,
        state_start,
        blob_start,
        blob_len,
    })
}

impl<D, C, const SUBPAGE: usize> Ftl<D, C, SUBPAGE>
where
    D: BlockDevice,
    C: EccCodec,
{
    /// Largest blob a metadata snapshot can carry
    pub fn metadata_capacity(&self) -> usize {
        let count = self.partition_count() * PARTITION_STATE_SIZE;
        self.data_per_subpage(true) - FIXED_HEADER - count - BLOB_LEN_SIZE
    }

    /// Persist `blob` together with the current cursor state of every
    /// partition. The newest snapshot wins at load time.
    pub fn write_metadata(&mut self, blob: &[u8]) -> Result<(), FtlError<D::Error>> {
        if blob.len() > self.metadata_capacity() {
            return Err(FtlError::TooMuchData);
        }

        let anchor = self.index_partition();
        let capacity = self.subpages_in_partition(anchor);
        if self.partition(anchor).next_subpage().as_u32() >= capacity {
            debug!("metadata anchor exhausted, wrapping to the first block");
            self.partitions[anchor.index()].set_cursor(0, 0, 0);
        }

        self.sequence += 1;
        let mut frame = [0u8; SUBPAGE];
        frame[0..4].copy_from_slice(&MAGIC);
        frame[4..8].copy_from_slice(&self.sequence.to_le_bytes());
        frame[8] = self.partition_count() as u8;
        let mut at = FIXED_HEADER;
        for index in 0..self.partition_count() {
            frame[at..at + PARTITION_STATE_SIZE]
                .copy_from_slice(&self.partitions[index].encode_state());
            at += PARTITION_STATE_SIZE;
        }
        frame[at..at + BLOB_LEN_SIZE].copy_from_slice(&(blob.len() as u16).to_le_bytes());
        at += BLOB_LEN_SIZE;
        frame[at..at + blob.len()].copy_from_slice(blob);

        let total = at + blob.len();
        let subpage = self.write_ecc(anchor, &frame[..total])?;
        trace!(
            "metadata snapshot {} written to anchor subpage {}",
            self.sequence,
            subpage.as_u32()
        );
        Ok(())
    }

    /// Find the newest metadata snapshot, restore the persisted cursor
    /// state of every partition except the anchor itself, position the
    /// anchor cursor after the snapshot, and copy the blob into `out`.
    ///
    /// Returns the blob length, or `None` when the anchor holds no valid
    /// snapshot (a virgin or foreign partition).
    pub fn load_latest_metadata(
        &mut self,
        out: &mut [u8],
    ) -> Result<Option<usize>, FtlError<D::Error>> {
        let anchor = self.index_partition();
        let capacity = self.subpages_in_partition(anchor);
        let partition_count = self.partition_count();

        let mut frame = [0u8; SUBPAGE];
        let mut best: Option<(u32, u32)> = None;
        for subpage in 0..capacity {
            let header = match self.read(anchor, &mut frame, SubpageIndex::new(subpage)) {
                Ok(header) => header,
                // holes are expected after a wrap; damage just loses that slot
                Err(FtlError::NoData) | Err(FtlError::CorruptFrame) => continue,
                Err(other) => return Err(other),
            };
            if let Some(meta) = parse(&frame[..header.data_length as usize], partition_count) {
                if best.map_or(true, |(sequence, _)| meta.sequence > sequence) {
                    best = Some((meta.sequence, subpage));
                }
            }
        }

        let Some((sequence, subpage)) = best else {
            trace!("metadata anchor is empty");
            return Ok(None);
        };
        debug!(
            "latest metadata snapshot {} at anchor subpage {}",
            sequence, subpage
        );

        let header = self.read(anchor, &mut frame, SubpageIndex::new(subpage))?;
        let meta = parse(&frame[..header.data_length as usize], partition_count)
            .ok_or(FtlError::CorruptFrame)?;

        let geometry = self.geometry;
        let mut at = meta.state_start;
        for index in 0..partition_count {
            if index != anchor.index() {
                let applied = self.partitions[index]
                    .apply_state(&frame[at..at + PARTITION_STATE_SIZE], &geometry);
                if !applied {
                    return Err(FtlError::CorruptState);
                }
            }
            at += PARTITION_STATE_SIZE;
        }

        self.sequence = sequence;
        self.position_anchor_after(subpage)?;

        if out.len() < meta.blob_len {
            return Err(FtlError::BufferTooSmall);
        }
        out[..meta.blob_len].copy_from_slice(&frame[meta.blob_start..meta.blob_start + meta.blob_len]);
        Ok(Some(meta.blob_len))
    }

    /// Place the anchor cursor on the first writable slot after the newest
    /// snapshot: directly behind it when the rest of its block is virgin,
    /// otherwise at the next block boundary (which the next write will
    /// erase).
    fn position_anchor_after(&mut self, subpage: u32) -> Result<(), FtlError<D::Error>> {
        let anchor = self.index_partition();
        let spb = self.geometry.subpages_per_block();
        let block_end = (subpage / spb + 1) * spb;

        let mut tail_clean = true;
        for candidate in subpage + 1..block_end {
            self.load_scratch(anchor, SubpageIndex::new(candidate))?;
            if !self.scratch_is_blank() {
                tail_clean = false;
                break;
            }
        }

        let part = &mut self.partitions[anchor.index()];
        if tail_clean {
            part.set_cursor(subpage + 1, block_end, 0);
        } else {
            part.set_cursor(block_end, block_end, 0);
        }
        Ok(())
    }
}
