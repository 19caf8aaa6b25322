/// Errors of the translation layer, generic over the device error.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FtlError<E> {
    /// Error from the underlying block device
    #[error("block device error")]
    Device(E),
    /// Block or subpage index outside the partition, or the partition's
    /// append range is exhausted
    #[error("address out of partition range")]
    OutOfRange,
    /// Data does not fit into one subpage frame
    #[error("too much data for a subpage frame")]
    TooMuchData,
    /// Caller buffer cannot hold the transfer
    #[error("buffer too small")]
    BufferTooSmall,
    /// Device too small for the requested partition layout
    #[error("insufficient storage for partition layout")]
    InsufficientStorage,
    /// The subpage has never been written since the last erase
    #[error("subpage holds no data")]
    NoData,
    /// The frame failed its integrity checks
    #[error("corrupt subpage frame")]
    CorruptFrame,
    /// Persisted partition state contradicts itself or the flash contents
    #[error("inconsistent partition state")]
    CorruptState,
    /// Partition table capacity exceeded
    #[error("too many partitions")]
    TooManyPartitions,
    /// Geometry constraints violated (subpage/page mismatch, codec too wide)
    #[error("invalid device geometry")]
    InvalidGeometry,
}
