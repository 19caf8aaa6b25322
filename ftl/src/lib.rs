//! Flash translation layer: partitioned, framed, subpage-addressed I/O over
//! a raw erase-before-write block device.
//!
//! The layer owns the device, its geometry and a small partition table. Raw
//! reads and writes address whole subpages anywhere in a partition; framed
//! writes append at the partition's cursor, wrap the payload in a small
//! header, optionally protect the whole subpage with ECC parity, and erase
//! blocks on demand as the cursor reaches them. A metadata anchor gives the
//! layer above a crash-safe place for small snapshots.

#![no_std]

mod error;
mod fmt;
mod frame;
mod metadata;
mod partition;
#[cfg(test)]
mod tests;

use flash_device::{BlockDevice, BlockIndex, EccCodec, EccStatus, Geometry, PageIndex, SubpageIndex};

pub use error::FtlError;
pub use frame::{SubpageHeader, HEADER_SIZE};
pub use partition::{Partition, PartitionId, PartitionSpec};

/// Capacity of the partition table
pub const MAX_PARTITIONS: usize = 4;

/// Largest parity block any supported codec produces for one subpage
pub const MAX_PARITY_SIZE: usize = 48;

/// Bytes reserved for the metadata anchor partition in the derived layout
pub const INDEX_RESERVE: u64 = 4 * 1024 * 1024;

pub struct Ftl<D, C, const SUBPAGE: usize> {
    device: D,
    codec: C,
    geometry: Geometry,
    partitions: [Partition; MAX_PARTITIONS],
    partition_count: u8,
    anchor: PartitionId,
    data: PartitionId,
    sequence: u32,
    ecc_size: usize,
    scratch: [u8; SUBPAGE],
    parity: [u8; MAX_PARITY_SIZE],
}

impl<D, C, const SUBPAGE: usize> Ftl<D, C, SUBPAGE>
where
    D: BlockDevice,
    C: EccCodec,
{
    /// Build the layer with the derived layout: a metadata anchor partition
    /// of [`INDEX_RESERVE`] bytes at the start of the device, the rest as
    /// one data partition.
    pub fn new(device: D, codec: C, geometry: Geometry) -> Result<Self, FtlError<D::Error>> {
        if geometry.capacity() < INDEX_RESERVE {
            return Err(FtlError::InsufficientStorage);
        }
        let block_size = geometry.block_size() as u64;
        let mut index_blocks = (INDEX_RESERVE / block_size) as u32;
        if INDEX_RESERVE % block_size > 0 {
            index_blocks += 1;
        }
        let data_blocks = geometry
            .block_count()
            .checked_sub(index_blocks)
            .filter(|&blocks| blocks > 0)
            .ok_or(FtlError::InsufficientStorage)?;
        Self::with_partitions(
            device,
            codec,
            geometry,
            &[
                PartitionSpec {
                    base: 0,
                    size: index_blocks,
                },
                PartitionSpec {
                    base: index_blocks,
                    size: data_blocks,
                },
            ],
        )
    }

    /// Build the layer from a static partition table. The first partition
    /// becomes the metadata anchor, the second (or only) one the default
    /// data partition.
    pub fn with_partitions(
        device: D,
        codec: C,
        geometry: Geometry,
        specs: &[PartitionSpec],
    ) -> Result<Self, FtlError<D::Error>> {
        if !geometry.is_valid() || geometry.subpage_size as usize != SUBPAGE {
            return Err(FtlError::InvalidGeometry);
        }
        if specs.is_empty() || specs.len() > MAX_PARTITIONS {
            return Err(FtlError::TooManyPartitions);
        }
        let mut claimed = 0u32;
        for spec in specs {
            if spec.size == 0 || spec.base + spec.size > geometry.block_count() {
                return Err(FtlError::OutOfRange);
            }
            claimed += spec.size;
        }
        if claimed > geometry.block_count() {
            return Err(FtlError::InsufficientStorage);
        }

        let ecc_size = codec.parity_size(SUBPAGE);
        if ecc_size > MAX_PARITY_SIZE || HEADER_SIZE + ecc_size >= SUBPAGE {
            return Err(FtlError::InvalidGeometry);
        }

        let mut partitions = [Partition::new(PartitionSpec { base: 0, size: 0 }); MAX_PARTITIONS];
        for (slot, spec) in partitions.iter_mut().zip(specs) {
            *slot = Partition::new(*spec);
        }

        info!(
            "translation layer up: {} partitions, ecc {} bytes per subpage",
            specs.len(),
            ecc_size
        );

        Ok(Ftl {
            device,
            codec,
            geometry,
            partitions,
            partition_count: specs.len() as u8,
            anchor: PartitionId(0),
            data: PartitionId(if specs.len() > 1 { 1 } else { 0 }),
            sequence: 0,
            ecc_size,
            scratch: [0xFF; SUBPAGE],
            parity: [0; MAX_PARITY_SIZE],
        })
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Parity bytes per ECC-framed subpage
    pub fn ecc_size(&self) -> usize {
        self.ecc_size
    }

    /// Partition holding the metadata anchor
    pub fn index_partition(&self) -> PartitionId {
        self.anchor
    }

    /// Default data partition
    pub fn data_partition(&self) -> PartitionId {
        self.data
    }

    pub fn partition_count(&self) -> usize {
        self.partition_count as usize
    }

    pub fn partition_id(&self, index: usize) -> Option<PartitionId> {
        (index < self.partition_count as usize).then(|| PartitionId(index as u8))
    }

    pub fn partition(&self, id: PartitionId) -> &Partition {
        &self.partitions[id.index()]
    }

    /// Payload bytes that fit into one framed subpage
    pub fn data_per_subpage(&self, ecc: bool) -> usize {
        SUBPAGE - HEADER_SIZE - if ecc { self.ecc_size } else { 0 }
    }

    /// Number of subpages in a partition
    pub fn subpages_in_partition(&self, id: PartitionId) -> u32 {
        self.partition(id).subpage_count(&self.geometry)
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Tear the layer down and hand the device back.
    pub fn into_device(self) -> D {
        self.device
    }

    /// Erase one partition-relative block.
    pub fn erase(&mut self, id: PartitionId, block: BlockIndex) -> Result<(), FtlError<D::Error>> {
        let part = self.partition(id);
        let absolute = part.block_of(block);
        if block.as_u32() >= part.size() || absolute.as_u32() >= self.geometry.block_count() {
            return Err(FtlError::OutOfRange);
        }
        self.device.erase(absolute).map_err(FtlError::Device)
    }

    /// Erase every block of the partition, in order, bailing on the first
    /// failure, and reset its cursors.
    pub fn format(&mut self, id: PartitionId) -> Result<(), FtlError<D::Error>> {
        let part = self.partition(id);
        let first = part.block_of(BlockIndex::new(0));
        let size = part.size();
        debug!("formatting {} blocks from block {}", size, first.as_u32());
        self.device
            .erase_bulk(first, size)
            .map_err(FtlError::Device)?;
        let geometry = self.geometry;
        self.partitions[id.index()].reset_formatted(&geometry);
        Ok(())
    }

    fn target(
        &self,
        id: PartitionId,
        subpage: SubpageIndex,
    ) -> Result<(PageIndex, usize), FtlError<D::Error>> {
        let part = self.partition(id);
        if subpage.as_u32() >= part.subpage_count(&self.geometry) {
            return Err(FtlError::OutOfRange);
        }
        Ok((
            part.page_of(&self.geometry, subpage),
            self.geometry.subpage_offset_in_page(subpage),
        ))
    }

    /// Copy one raw subpage into `buf`. No framing, no cursor movement.
    pub fn read_raw(
        &mut self,
        id: PartitionId,
        buf: &mut [u8],
        subpage: SubpageIndex,
    ) -> Result<(), FtlError<D::Error>> {
        if buf.len() < SUBPAGE {
            return Err(FtlError::BufferTooSmall);
        }
        let (page, offset) = self.target(id, subpage)?;
        self.device
            .read(&mut buf[..SUBPAGE], page, offset)
            .map_err(FtlError::Device)
    }

    /// Program one raw subpage from `buf`. Externally addressed; the
    /// partition cursor does not move.
    pub fn write_raw(
        &mut self,
        id: PartitionId,
        buf: &[u8],
        subpage: SubpageIndex,
    ) -> Result<(), FtlError<D::Error>> {
        if buf.len() < SUBPAGE {
            return Err(FtlError::BufferTooSmall);
        }
        let (page, offset) = self.target(id, subpage)?;
        self.device
            .write(&buf[..SUBPAGE], page, offset)
            .map_err(FtlError::Device)
    }

    /// Frame `data` without ECC and append it at the partition cursor.
    /// Returns the subpage the frame landed on.
    pub fn write(
        &mut self,
        id: PartitionId,
        data: &[u8],
    ) -> Result<SubpageIndex, FtlError<D::Error>> {
        if data.len() > self.data_per_subpage(false) {
            return Err(FtlError::TooMuchData);
        }
        let header = SubpageHeader {
            data_length: data.len() as u16,
            ecc: false,
        };
        // Unused tail bytes stay 0xFF so the cells stay erased
        self.scratch.fill(0xFF);
        self.scratch[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        self.scratch[HEADER_SIZE..HEADER_SIZE + data.len()].copy_from_slice(data);
        self.program_at_cursor(id)
    }

    /// Frame `data` with ECC over the whole subpage and append it at the
    /// partition cursor. Returns the subpage the frame landed on.
    pub fn write_ecc(
        &mut self,
        id: PartitionId,
        data: &[u8],
    ) -> Result<SubpageIndex, FtlError<D::Error>> {
        if data.len() > self.data_per_subpage(true) {
            return Err(FtlError::TooMuchData);
        }
        let header = SubpageHeader {
            data_length: data.len() as u16,
            ecc: true,
        };
        // Parity is computed with its own area zeroed, so verification can
        // regenerate the same bytes after the area is blanked again.
        self.scratch.fill(0x00);
        self.scratch[..HEADER_SIZE].copy_from_slice(&header.to_bytes());
        let payload = HEADER_SIZE + self.ecc_size;
        self.scratch[payload..payload + data.len()].copy_from_slice(data);
        self.codec
            .compute(&self.scratch, &mut self.parity[..self.ecc_size]);
        self.scratch[HEADER_SIZE..payload].copy_from_slice(&self.parity[..self.ecc_size]);
        self.program_at_cursor(id)
    }

    /// Read a framed subpage: verify and strip the frame, copy the payload
    /// into `buf` and return the header.
    pub fn read(
        &mut self,
        id: PartitionId,
        buf: &mut [u8],
        subpage: SubpageIndex,
    ) -> Result<SubpageHeader, FtlError<D::Error>> {
        let (page, offset) = self.target(id, subpage)?;
        self.device
            .read(&mut self.scratch, page, offset)
            .map_err(FtlError::Device)?;

        if SubpageHeader::is_blank(&self.scratch) {
            return Err(FtlError::NoData);
        }
        let mut header = SubpageHeader::from_bytes(&self.scratch);
        if header.data_length as usize > SUBPAGE - HEADER_SIZE {
            return Err(FtlError::CorruptFrame);
        }

        let mut payload = HEADER_SIZE;
        if header.ecc {
            let n = self.ecc_size;
            self.parity[..n].copy_from_slice(&self.scratch[HEADER_SIZE..HEADER_SIZE + n]);
            self.scratch[HEADER_SIZE..HEADER_SIZE + n].fill(0);
            match self.codec.verify(&mut self.scratch, &self.parity[..n]) {
                EccStatus::Ok => {}
                EccStatus::Corrected => {
                    debug!("corrected a bit flip in subpage {}", subpage.as_u32());
                    // The flipped bit may have been in the header
                    header = SubpageHeader::from_bytes(&self.scratch);
                }
                _ => return Err(FtlError::CorruptFrame),
            }
            payload += n;
        }

        let length = header.data_length as usize;
        if length > self.data_per_subpage(header.ecc) {
            return Err(FtlError::CorruptFrame);
        }
        if buf.len() < length {
            return Err(FtlError::BufferTooSmall);
        }
        buf[..length].copy_from_slice(&self.scratch[payload..payload + length]);
        Ok(header)
    }

    /// Bring the partition cursor back in sync with the flash contents:
    /// skip forward over subpages programmed since the cursor state was
    /// last persisted.
    pub fn recover_cursor(&mut self, id: PartitionId) -> Result<(), FtlError<D::Error>> {
        let part = self.partition(id);
        if part.next_subpage() > part.erased_until() {
            return Err(FtlError::CorruptState);
        }
        let capacity = part.subpage_count(&self.geometry);
        let spb = self.geometry.subpages_per_block();

        let mut next = part.next_subpage().as_u32();
        while next < capacity {
            self.load_scratch(id, SubpageIndex::new(next))?;
            if self.scratch_is_blank() {
                break;
            }
            next += 1;
        }

        let part = &mut self.partitions[id.index()];
        if next != part.next_subpage().as_u32() {
            debug!("cursor moved to subpage {} during recovery", next);
            // Everything up to the end of the last written block must have
            // been erased for those writes to happen.
            let erased_floor = ((next - 1) / spb + 1) * spb;
            let erased = part.erased_until().as_u32().max(erased_floor);
            let free = part.free_until().as_u32();
            part.set_cursor(next, erased, free);
        }
        Ok(())
    }

    fn load_scratch(
        &mut self,
        id: PartitionId,
        subpage: SubpageIndex,
    ) -> Result<(), FtlError<D::Error>> {
        let (page, offset) = self.target(id, subpage)?;
        self.device
            .read(&mut self.scratch, page, offset)
            .map_err(FtlError::Device)
    }

    fn scratch_is_blank(&self) -> bool {
        self.scratch.iter().all(|&byte| byte == 0xFF)
    }

    /// Find the slot for the next framed write, erasing the block under it
    /// when the cursor has caught up with the erased watermark.
    fn slot_for_append(&mut self, id: PartitionId) -> Result<SubpageIndex, FtlError<D::Error>> {
        let spb = self.geometry.subpages_per_block();
        let part = self.partition(id);
        let next = part.next_subpage().as_u32();
        if next >= part.subpage_count(&self.geometry) {
            return Err(FtlError::OutOfRange);
        }
        if next > part.erased_until().as_u32() {
            return Err(FtlError::CorruptState);
        }
        if next == part.erased_until().as_u32() {
            let block = BlockIndex::new(next / spb);
            self.erase(id, block)?;
            self.partitions[id.index()].mark_erased_until((block.as_u32() + 1) * spb);
        }
        Ok(SubpageIndex::new(next))
    }

    fn program_at_cursor(&mut self, id: PartitionId) -> Result<SubpageIndex, FtlError<D::Error>> {
        let subpage = self.slot_for_append(id)?;
        let (page, offset) = self.target(id, subpage)?;
        self.device
            .write(&self.scratch, page, offset)
            .map_err(FtlError::Device)?;
        // The cursor only moves once the device accepted the program; a
        // failed flush leaves the slot unconsumed.
        self.partitions[id.index()].advance();
        Ok(subpage)
    }
}
