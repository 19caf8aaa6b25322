use core::ops::{Add, AddAssign};

/// Index of a page in the flash device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PageIndex(pub(crate) u32);

impl PageIndex {
    pub fn new(index: u32) -> Self {
        PageIndex(index)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_block_index(&self, pages_per_block: u32) -> BlockIndex {
        BlockIndex(self.0 / pages_per_block)
    }
}

impl From<PageIndex> for u32 {
    fn from(pi: PageIndex) -> Self {
        pi.as_u32()
    }
}

impl Add<u32> for PageIndex {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        PageIndex(self.0 + rhs)
    }
}

impl AddAssign<u32> for PageIndex {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// Index of an erase block in the flash device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BlockIndex(pub(crate) u32);

impl BlockIndex {
    pub fn new(index: u32) -> Self {
        BlockIndex(index)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    /// First page of this block
    pub fn first_page(&self, pages_per_block: u32) -> PageIndex {
        PageIndex(self.0 * pages_per_block)
    }
}

impl From<BlockIndex> for u32 {
    fn from(bi: BlockIndex) -> Self {
        bi.as_u32()
    }
}

impl Add<u32> for BlockIndex {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        BlockIndex(self.0 + rhs)
    }
}

impl AddAssign<u32> for BlockIndex {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}

/// Index of a subpage, the translation layer's unit of I/O.
///
/// Subpage indices are relative to whatever contains them: a partition for
/// translated I/O, the whole device otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SubpageIndex(pub(crate) u32);

impl SubpageIndex {
    pub fn new(index: u32) -> Self {
        SubpageIndex(index)
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }

    pub fn as_page_index(&self, subpages_per_page: u32) -> PageIndex {
        PageIndex(self.0 / subpages_per_page)
    }

    pub fn as_block_index(&self, subpages_per_block: u32) -> BlockIndex {
        BlockIndex(self.0 / subpages_per_block)
    }

    /// Byte offset of this subpage within its enclosing page
    pub fn offset_in_page(&self, subpages_per_page: u32, subpage_size: u32) -> usize {
        ((self.0 % subpages_per_page) * subpage_size) as usize
    }
}

impl From<SubpageIndex> for u32 {
    fn from(si: SubpageIndex) -> Self {
        si.as_u32()
    }
}

impl Add<u32> for SubpageIndex {
    type Output = Self;

    fn add(self, rhs: u32) -> Self::Output {
        SubpageIndex(self.0 + rhs)
    }
}

impl AddAssign<u32> for SubpageIndex {
    fn add_assign(&mut self, rhs: u32) {
        self.0 += rhs;
    }
}
