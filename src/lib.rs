//! Object storage layer: named, append-only collections of fixed-size
//! records in one shared log on a flash translation layer partition.
//!
//! Records are packed into subpage-sized frames through a single write
//! buffer; each record points back at its predecessor in the same
//! collection, so a collection is a backward chain from its tail. Reads
//! resolve records through the write buffer, a one-subpage read cache, or
//! the translation layer. A checkpoint persists the open-collection table
//! through the layer's metadata anchor; recovery at startup rehydrates it
//! and re-syncs the partition cursor.

#![no_std]

mod cache;
mod collection;
mod fmt;
mod iter;
mod record;

use flash_device::{BlockDevice, EccCodec, SubpageIndex};
use ftl::{Ftl, FtlError, PartitionId};

pub use cache::STEP_CACHE_SIZE;
pub use collection::{Collection, CollectionKind, NAME_MAX};
pub use iter::StreamIter;
pub use record::{RecordHeader, RecordLocation, MAX_RECORD_DATA, RECORD_HEADER_SIZE};

use cache::StepCache;
use collection::COLLECTION_STATE_SIZE;

/// Capacity of the open-collection table
pub const MAX_OPEN_COLLECTIONS: usize = 8;

/// Errors of the object storage layer, generic over the device error.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum OslError<E> {
    /// Error from the translation layer underneath
    #[error("translation layer error")]
    Ftl(FtlError<E>),
    /// No object at the given index, or unknown descriptor
    #[error("no such object")]
    NotFound,
    /// Collection name longer than [`NAME_MAX`]
    #[error("collection name too long")]
    NameTooLong,
    /// Open-collection table is full
    #[error("too many open collections")]
    TooManyOpen,
    /// A collection of that name exists with a different kind or size
    #[error("collection exists with a different shape")]
    Mismatch,
    /// Datum size differs from the collection's object size, or the object
    /// size cannot fit a subpage
    #[error("datum size mismatch")]
    SizeMismatch,
    /// A record chain contradicts the collection bookkeeping
    #[error("record chain is inconsistent")]
    CorruptChain,
    /// The persisted checkpoint cannot be decoded
    #[error("checkpoint is malformed")]
    CorruptCheckpoint,
}

impl<E> From<FtlError<E>> for OslError<E> {
    fn from(error: FtlError<E>) -> Self {
        OslError::Ftl(error)
    }
}

/// Opaque descriptor for an open collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CollectionId(pub(crate) u8);

impl CollectionId {
    fn index(&self) -> usize {
        self.0 as usize
    }
}

pub struct Osl<D, C, const SUBPAGE: usize> {
    ftl: Ftl<D, C, SUBPAGE>,
    data: PartitionId,
    write_buf: [u8; SUBPAGE],
    /// Usable bytes of the write buffer: one ECC frame's payload
    buffer_size: usize,
    cursor: usize,
    read_buf: [u8; SUBPAGE],
    read_subpage: Option<u32>,
    collections: [Collection; MAX_OPEN_COLLECTIONS],
    open_count: u8,
    cache: StepCache,
}

impl<D, C, const SUBPAGE: usize> Osl<D, C, SUBPAGE>
where
    D: BlockDevice,
    C: EccCodec,
{
    /// Bring up the store on the given data partition and run recovery:
    /// load the newest checkpoint if there is one, otherwise persist an
    /// empty one so the device is marked as initialised.
    pub fn new(ftl: Ftl<D, C, SUBPAGE>, data: PartitionId) -> Result<Self, OslError<D::Error>> {
        let buffer_size = ftl.data_per_subpage(true);
        let mut osl = Osl {
            ftl,
            data,
            write_buf: [0; SUBPAGE],
            buffer_size,
            cursor: 0,
            read_buf: [0; SUBPAGE],
            read_subpage: None,
            collections: [Collection::blank(); MAX_OPEN_COLLECTIONS],
            open_count: 0,
            cache: StepCache::new(),
        };
        osl.recover()?;
        Ok(osl)
    }

    fn recover(&mut self) -> Result<(), OslError<D::Error>> {
        let mut blob = [0u8; SUBPAGE];
        match self.ftl.load_latest_metadata(&mut blob)? {
            Some(length) => {
                if length % COLLECTION_STATE_SIZE != 0 {
                    return Err(OslError::CorruptCheckpoint);
                }
                let count = length / COLLECTION_STATE_SIZE;
                if count > MAX_OPEN_COLLECTIONS {
                    return Err(OslError::CorruptCheckpoint);
                }
                for index in 0..count {
                    let at = index * COLLECTION_STATE_SIZE;
                    self.collections[index] =
                        Collection::decode(&blob[at..at + COLLECTION_STATE_SIZE])
                            .ok_or(OslError::CorruptCheckpoint)?;
                }
                self.open_count = count as u8;
                // skip whatever was appended after the checkpoint
                self.ftl.recover_cursor(self.data)?;
                info!("recovered {} collections from the latest checkpoint", count);
            }
            None => {
                debug!("no checkpoint found, starting empty");
                self.open_count = 0;
                self.write_checkpoint_blob()?;
            }
        }
        Ok(())
    }

    /// Open or create an append-only stream.
    pub fn open_stream(
        &mut self,
        name: &str,
        object_size: u16,
    ) -> Result<CollectionId, OslError<D::Error>> {
        self.open(name, CollectionKind::Stream, object_size)
    }

    /// Open or create a FIFO queue.
    pub fn open_queue(
        &mut self,
        name: &str,
        object_size: u16,
    ) -> Result<CollectionId, OslError<D::Error>> {
        self.open(name, CollectionKind::Queue, object_size)
    }

    fn open(
        &mut self,
        name: &str,
        kind: CollectionKind,
        object_size: u16,
    ) -> Result<CollectionId, OslError<D::Error>> {
        if name.len() > NAME_MAX {
            return Err(OslError::NameTooLong);
        }
        if object_size == 0 || RECORD_HEADER_SIZE + object_size as usize > self.buffer_size {
            return Err(OslError::SizeMismatch);
        }
        for index in 0..self.open_count as usize {
            if self.collections[index].name() == name {
                let existing = &self.collections[index];
                if existing.kind != kind || existing.object_size != object_size {
                    return Err(OslError::Mismatch);
                }
                return Ok(CollectionId(index as u8));
            }
        }
        if self.open_count as usize == MAX_OPEN_COLLECTIONS {
            return Err(OslError::TooManyOpen);
        }
        let slot = self.open_count;
        self.collections[slot as usize] = Collection::create(name, kind, object_size);
        self.open_count += 1;
        info!("created collection {} in slot {}", name, slot);
        Ok(CollectionId(slot))
    }

    /// Append one datum of exactly the collection's object size.
    pub fn append(&mut self, id: CollectionId, datum: &[u8]) -> Result<(), OslError<D::Error>> {
        let (num_objects, tail, object_size) = {
            let collection = self.collection(id)?;
            (collection.num_objects, collection.tail, collection.object_size)
        };
        if datum.len() != object_size as usize {
            return Err(OslError::SizeMismatch);
        }

        let header = RecordHeader {
            predecessor: if num_objects == 0 {
                RecordLocation::NONE
            } else {
                tail
            },
            length: object_size,
            is_first: num_objects == 0,
            has_meta: false,
        };

        let offset = match self.buffer_write(&header, datum) {
            Some(offset) => offset,
            None => {
                // full buffer: flush once and retry
                self.flush()?;
                self.buffer_write(&header, datum)
                    .ok_or(OslError::SizeMismatch)?
            }
        };

        let subpage = self.ftl.partition(self.data).next_subpage().as_u32();
        let collection = &mut self.collections[id.index()];
        collection.tail = RecordLocation {
            subpage,
            offset: offset as i16,
        };
        if collection.num_objects == 0 {
            collection.head = collection.tail;
        }
        collection.num_objects += 1;
        Ok(())
    }

    /// Copy the object at `index` (0 = oldest) into `out`.
    pub fn get(
        &mut self,
        id: CollectionId,
        index: u32,
        out: &mut [u8],
    ) -> Result<(), OslError<D::Error>> {
        let (num_objects, object_size) = {
            let collection = self.collection(id)?;
            (collection.num_objects, collection.object_size)
        };
        if out.len() != object_size as usize {
            return Err(OslError::SizeMismatch);
        }
        if index >= num_objects {
            return Err(OslError::NotFound);
        }
        let location = self.locate(id, index)?;
        self.record_datum(location, out)
    }

    /// Number of objects currently in the collection.
    pub fn len(&self, id: CollectionId) -> Result<u32, OslError<D::Error>> {
        Ok(self.collection(id)?.num_objects)
    }

    /// Iterate the collection from its oldest object.
    pub fn iter(&self, id: CollectionId) -> StreamIter {
        StreamIter::new(id)
    }

    /// Copy the queue's oldest object into `out` without removing it.
    pub fn queue_peek(
        &mut self,
        id: CollectionId,
        out: &mut [u8],
    ) -> Result<(), OslError<D::Error>> {
        let head = self.queue_head(id, out.len())?;
        self.record_datum(head, out)
    }

    /// Pop the queue's oldest object into `out` and advance the head.
    pub fn queue_remove(
        &mut self,
        id: CollectionId,
        out: &mut [u8],
    ) -> Result<(), OslError<D::Error>> {
        let head = self.queue_head(id, out.len())?;
        self.record_datum(head, out)?;

        let num_objects = self.collections[id.index()].num_objects;
        if num_objects == 1 {
            let collection = &mut self.collections[id.index()];
            collection.head = RecordLocation::NONE;
            collection.tail = RecordLocation::NONE;
            collection.num_objects = 0;
        } else {
            // the second-oldest object becomes the head
            let new_head = self.locate(id, 1)?;
            let collection = &mut self.collections[id.index()];
            collection.head = new_head;
            collection.num_objects -= 1;
        }
        // removal renumbers every index
        self.cache.reset();
        Ok(())
    }

    /// Flush buffered records and persist the collection table through the
    /// metadata anchor.
    pub fn checkpoint(&mut self) -> Result<(), OslError<D::Error>> {
        if self.cursor > 0 {
            self.flush()?;
        }
        self.write_checkpoint_blob()
    }

    pub fn collection(&self, id: CollectionId) -> Result<&Collection, OslError<D::Error>> {
        if id.index() >= self.open_count as usize {
            return Err(OslError::NotFound);
        }
        Ok(&self.collections[id.index()])
    }

    pub fn open_count(&self) -> usize {
        self.open_count as usize
    }

    /// Usable bytes per write-buffer fill
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Next free byte of the write buffer
    pub fn buffer_cursor(&self) -> usize {
        self.cursor
    }

    pub fn ftl(&self) -> &Ftl<D, C, SUBPAGE> {
        &self.ftl
    }

    pub fn ftl_mut(&mut self) -> &mut Ftl<D, C, SUBPAGE> {
        &mut self.ftl
    }

    /// Tear the store down and hand the translation layer back.
    pub fn into_ftl(self) -> Ftl<D, C, SUBPAGE> {
        self.ftl
    }

    fn write_checkpoint_blob(&mut self) -> Result<(), OslError<D::Error>> {
        let mut blob = [0u8; MAX_OPEN_COLLECTIONS * COLLECTION_STATE_SIZE];
        let mut at = 0;
        for index in 0..self.open_count as usize {
            blob[at..at + COLLECTION_STATE_SIZE].copy_from_slice(&self.collections[index].encode());
            at += COLLECTION_STATE_SIZE;
        }
        debug!("checkpointing {} collections", self.open_count);
        self.ftl.write_metadata(&blob[..at])?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OslError<D::Error>> {
        trace!(
            "flushing the write buffer to subpage {}",
            self.ftl.partition(self.data).next_subpage().as_u32()
        );
        self.ftl.write_ecc(self.data, &self.write_buf[..self.buffer_size])?;
        self.write_buf.fill(0);
        self.cursor = 0;
        Ok(())
    }

    /// Place a record at the buffer cursor. Returns its offset, or `None`
    /// when the record does not fit into what is left of the buffer.
    fn buffer_write(&mut self, header: &RecordHeader, datum: &[u8]) -> Option<usize> {
        let need = RECORD_HEADER_SIZE + datum.len();
        if self.cursor + need > self.buffer_size {
            return None;
        }
        let offset = self.cursor;
        self.write_buf[offset..offset + RECORD_HEADER_SIZE].copy_from_slice(&header.encode());
        self.write_buf[offset + RECORD_HEADER_SIZE..offset + need].copy_from_slice(datum);
        self.cursor += need;
        Some(offset)
    }

    fn queue_head(
        &mut self,
        id: CollectionId,
        datum_len: usize,
    ) -> Result<RecordLocation, OslError<D::Error>> {
        let collection = self.collection(id)?;
        if collection.kind != CollectionKind::Queue {
            return Err(OslError::Mismatch);
        }
        if datum_len != collection.object_size as usize {
            return Err(OslError::SizeMismatch);
        }
        if collection.num_objects == 0 {
            return Err(OslError::NotFound);
        }
        Ok(collection.head)
    }

    /// Walk the backward chain to the record holding object `index`.
    fn locate(
        &mut self,
        id: CollectionId,
        index: u32,
    ) -> Result<RecordLocation, OslError<D::Error>> {
        let (num_objects, tail, object_size) = {
            let collection = self.collection(id)?;
            (collection.num_objects, collection.tail, collection.object_size)
        };
        debug_assert!(index < num_objects);
        if object_size == 0 {
            return Err(OslError::CorruptChain);
        }

        self.cache.focus(id.0);
        let (mut location, mut steps_back) = match self.cache.lookup(index) {
            Some((cached, cached_location)) => (cached_location, cached - index),
            None => (tail, num_objects - 1 - index),
        };

        while steps_back > 0 {
            let header = self.record_header(location)?;
            if header.is_first {
                // about to walk past the oldest record
                return Err(OslError::CorruptChain);
            }
            let span = (header.length / object_size) as u32;
            if span == 0 {
                return Err(OslError::CorruptChain);
            }
            steps_back = steps_back
                .checked_sub(span)
                .ok_or(OslError::CorruptChain)?;
            location = header.predecessor;
        }

        self.cache.insert(index, location);
        Ok(location)
    }

    fn record_header(
        &mut self,
        location: RecordLocation,
    ) -> Result<RecordHeader, OslError<D::Error>> {
        let end = self.buffer_size;
        if location.offset < 0 || location.offset as usize + RECORD_HEADER_SIZE > end {
            return Err(OslError::CorruptChain);
        }
        let offset = location.offset as usize;
        let buffer = self.resolve(location.subpage)?;
        Ok(RecordHeader::decode(
            &buffer[offset..offset + RECORD_HEADER_SIZE],
        ))
    }

    fn record_datum(
        &mut self,
        location: RecordLocation,
        out: &mut [u8],
    ) -> Result<(), OslError<D::Error>> {
        let end = self.buffer_size;
        if location.offset < 0 {
            return Err(OslError::CorruptChain);
        }
        let start = location.offset as usize + RECORD_HEADER_SIZE;
        if start + out.len() > end {
            return Err(OslError::CorruptChain);
        }
        let buffer = self.resolve(location.subpage)?;
        out.copy_from_slice(&buffer[start..start + out.len()]);
        Ok(())
    }

    /// Find the subpage's bytes: still in the write buffer, already in the
    /// read buffer, or loaded from flash into the read buffer now.
    fn resolve(&mut self, subpage: u32) -> Result<&[u8], OslError<D::Error>> {
        if subpage == self.ftl.partition(self.data).next_subpage().as_u32() {
            return Ok(&self.write_buf);
        }
        if self.read_subpage == Some(subpage) {
            return Ok(&self.read_buf);
        }
        trace!("loading subpage {} into the read buffer", subpage);
        self.read_subpage = None;
        self.ftl
            .read(self.data, &mut self.read_buf, SubpageIndex::new(subpage))?;
        self.read_subpage = Some(subpage);
        Ok(&self.read_buf)
    }
}
