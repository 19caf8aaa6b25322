use flash_device::{BlockIndex, Geometry, PageIndex, SubpageIndex};

/// Identifies a partition within its device's table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PartitionId(pub(crate) u8);

impl PartitionId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// Static shape of a partition, in erase blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PartitionSpec {
    /// First block of the partition
    pub base: u32,
    /// Length in blocks
    pub size: u32,
}

/// A contiguous run of erase blocks with an append cursor.
///
/// `next_subpage` is where the next framed write lands; `erased_until` is
/// the first subpage past the cursor that is not known to be erased;
/// `free_until` marks subpages whose content is obsolete. The cursor never
/// passes the erased watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Partition {
    base: u32,
    size: u32,
    next_subpage: u32,
    erased_until: u32,
    free_until: u32,
}

/// Bytes of persisted cursor state per partition
pub(crate) const PARTITION_STATE_SIZE: usize = 12;

impl Partition {
    pub(crate) fn new(spec: PartitionSpec) -> Self {
        Partition {
            base: spec.base,
            size: spec.size,
            next_subpage: 0,
            erased_until: 0,
            free_until: 0,
        }
    }

    /// First block, relative to the device
    pub fn base(&self) -> u32 {
        self.base
    }

    /// Length in blocks
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Subpage the next framed write will occupy
    pub fn next_subpage(&self) -> SubpageIndex {
        SubpageIndex::new(self.next_subpage)
    }

    /// First subpage past the cursor not known to be erased
    pub fn erased_until(&self) -> SubpageIndex {
        SubpageIndex::new(self.erased_until)
    }

    /// Subpages below this watermark hold no live data
    pub fn free_until(&self) -> SubpageIndex {
        SubpageIndex::new(self.free_until)
    }

    /// Number of subpages the partition contains
    pub fn subpage_count(&self, geometry: &Geometry) -> u32 {
        self.size * geometry.subpages_per_block()
    }

    /// Device page holding the given partition-relative subpage
    pub(crate) fn page_of(&self, geometry: &Geometry, subpage: SubpageIndex) -> PageIndex {
        let relative = geometry.page_of_subpage(subpage);
        PageIndex::new(self.base * geometry.pages_per_block + relative.as_u32())
    }

    /// Device block holding the given partition-relative block
    pub(crate) fn block_of(&self, block: BlockIndex) -> BlockIndex {
        BlockIndex::new(self.base + block.as_u32())
    }

    pub(crate) fn advance(&mut self) {
        self.next_subpage += 1;
    }

    pub(crate) fn mark_erased_until(&mut self, subpage: u32) {
        self.erased_until = subpage;
    }

    pub(crate) fn set_cursor(&mut self, next: u32, erased: u32, free: u32) {
        self.next_subpage = next;
        self.erased_until = erased;
        self.free_until = free;
    }

    pub(crate) fn reset_formatted(&mut self, geometry: &Geometry) {
        self.next_subpage = 0;
        self.erased_until = self.subpage_count(geometry);
        self.free_until = 0;
    }

    pub(crate) fn encode_state(&self) -> [u8; PARTITION_STATE_SIZE] {
        let mut raw = [0u8; PARTITION_STATE_SIZE];
        raw[0..4].copy_from_slice(&self.next_subpage.to_le_bytes());
        raw[4..8].copy_from_slice(&self.erased_until.to_le_bytes());
        raw[8..12].copy_from_slice(&self.free_until.to_le_bytes());
        raw
    }

    /// Apply a persisted cursor snapshot. Returns false when the snapshot
    /// is not internally consistent with this partition's shape.
    pub(crate) fn apply_state(&mut self, raw: &[u8], geometry: &Geometry) -> bool {
        let next = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let erased = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
        let free = u32::from_le_bytes([raw[8], raw[9], raw[10], raw[11]]);
        let capacity = self.subpage_count(geometry);
        if next > erased || erased > capacity || free > next {
            return false;
        }
        self.set_cursor(next, erased, free);
        true
    }
}
