//! Lazy positional iteration over a collection.

use flash_device::BlockDevice;
use flash_device::EccCodec;

use crate::{CollectionId, Osl, OslError};

/// Walks a collection from its oldest object to its newest.
///
/// The iterator only carries a position; each step borrows the store, so it
/// stays valid across appends and sees objects added behind it.
#[derive(Debug, Clone, Copy)]
pub struct StreamIter {
    id: CollectionId,
    position: u32,
}

impl StreamIter {
    pub(crate) fn new(id: CollectionId) -> Self {
        StreamIter { id, position: 0 }
    }

    /// Index the next call to [`Self::next`] will read
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Copy the next object into `out`. Returns `false` once the end of
    /// the collection is reached.
    pub fn next<D, C, const SUBPAGE: usize>(
        &mut self,
        osl: &mut Osl<D, C, SUBPAGE>,
        out: &mut [u8],
    ) -> Result<bool, OslError<D::Error>>
    where
        D: BlockDevice,
        C: EccCodec,
    {
        if self.position >= osl.len(self.id)? {
            return Ok(false);
        }
        osl.get(self.id, self.position, out)?;
        self.position += 1;
        Ok(true)
    }
}
