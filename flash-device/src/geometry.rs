use crate::{BlockIndex, PageIndex, SubpageIndex};

/// Immutable shape of a flash device.
///
/// All translated I/O is derived from these four values. The subpage is the
/// addressable unit: a power-of-two slice of a page, no larger than the page
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Geometry {
    /// Total number of pages in the device
    pub total_pages: u32,
    /// Size of a page in bytes, the smallest program unit
    pub page_size: u32,
    /// Size of a subpage in bytes, must divide the page size
    pub subpage_size: u32,
    /// Number of pages per erase block
    pub pages_per_block: u32,
}

impl Geometry {
    /// Check the structural invariants between the four sizes.
    pub fn is_valid(&self) -> bool {
        self.total_pages > 0
            && self.page_size > 0
            && self.subpage_size > 0
            && self.pages_per_block > 0
            && self.subpage_size <= self.page_size
            && self.page_size % self.subpage_size == 0
            && self.total_pages % self.pages_per_block == 0
    }

    /// Size of an erase block in bytes
    pub const fn block_size(&self) -> u32 {
        self.page_size * self.pages_per_block
    }

    /// Number of erase blocks in the device
    pub const fn block_count(&self) -> u32 {
        self.total_pages / self.pages_per_block
    }

    /// Total device capacity in bytes
    pub const fn capacity(&self) -> u64 {
        self.total_pages as u64 * self.page_size as u64
    }

    pub const fn subpages_per_page(&self) -> u32 {
        self.page_size / self.subpage_size
    }

    pub const fn subpages_per_block(&self) -> u32 {
        self.pages_per_block * self.subpages_per_page()
    }

    pub const fn total_subpages(&self) -> u32 {
        self.total_pages * self.subpages_per_page()
    }

    /// First subpage of the given block
    pub const fn first_subpage_of_block(&self, block: BlockIndex) -> SubpageIndex {
        SubpageIndex(block.0 * self.subpages_per_block())
    }

    /// Page containing the given subpage
    pub fn page_of_subpage(&self, subpage: SubpageIndex) -> PageIndex {
        subpage.as_page_index(self.subpages_per_page())
    }

    /// Byte offset of the given subpage within its page
    pub fn subpage_offset_in_page(&self, subpage: SubpageIndex) -> usize {
        subpage.offset_in_page(self.subpages_per_page(), self.subpage_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Geometry of the SD-card rig the original stack ran on
    fn mmc() -> Geometry {
        Geometry {
            total_pages: 32768,
            page_size: 512,
            subpage_size: 512,
            pages_per_block: 2048,
        }
    }

    // Large-page NAND with four subpages per page
    fn nand() -> Geometry {
        Geometry {
            total_pages: 32768,
            page_size: 2048,
            subpage_size: 512,
            pages_per_block: 1024,
        }
    }

    #[test]
    fn validation() {
        assert!(mmc().is_valid());
        assert!(nand().is_valid());

        let mut bad = mmc();
        bad.subpage_size = 513;
        assert!(!bad.is_valid());

        let mut bad = nand();
        bad.subpage_size = 4096;
        assert!(!bad.is_valid());

        let mut bad = mmc();
        bad.total_pages = 0;
        assert!(!bad.is_valid());
    }

    #[test]
    fn block_arithmetic() {
        let g = mmc();
        assert_eq!(g.block_size(), 512 * 2048);
        assert_eq!(g.block_count(), 16);
        assert_eq!(g.capacity(), 16 * 1024 * 1024);
        assert_eq!(g.subpages_per_page(), 1);
        assert_eq!(g.subpages_per_block(), 2048);
    }

    #[test]
    fn first_subpage_of_block() {
        let g = mmc();
        assert_eq!(g.first_subpage_of_block(BlockIndex::new(0)).as_u32(), 0);
        assert_eq!(g.first_subpage_of_block(BlockIndex::new(1)).as_u32(), 2048);
        assert_eq!(g.first_subpage_of_block(BlockIndex::new(42)).as_u32(), 86016);

        let g = nand();
        assert_eq!(g.first_subpage_of_block(BlockIndex::new(1)).as_u32(), 4096);
        assert_eq!(g.first_subpage_of_block(BlockIndex::new(42)).as_u32(), 172032);
    }

    #[test]
    fn subpage_to_page() {
        let g = nand();
        assert_eq!(g.page_of_subpage(SubpageIndex::new(0)).as_u32(), 0);
        assert_eq!(g.page_of_subpage(SubpageIndex::new(3)).as_u32(), 0);
        assert_eq!(g.page_of_subpage(SubpageIndex::new(4)).as_u32(), 1);
        assert_eq!(g.subpage_offset_in_page(SubpageIndex::new(0)), 0);
        assert_eq!(g.subpage_offset_in_page(SubpageIndex::new(3)), 1536);
        assert_eq!(g.subpage_offset_in_page(SubpageIndex::new(5)), 512);
    }
}
