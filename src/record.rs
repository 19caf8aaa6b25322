//! On-disk record framing inside subpage payloads.

/// On-disk size of a record header
pub const RECORD_HEADER_SIZE: usize = 8;

/// Largest datum a record can carry (14-bit length field)
pub const MAX_RECORD_DATA: usize = (1 << 14) - 1;

const IS_FIRST: u16 = 1 << 14;
const HAS_META: u16 = 1 << 15;
const LENGTH_MASK: u16 = IS_FIRST - 1;

/// Absolute position of a record: the data partition subpage it lives on
/// and its byte offset within that subpage's payload.
///
/// While a record still sits in the write buffer, its subpage is the
/// partition's next free one; the address becomes durable unchanged when
/// the buffer flushes there.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordLocation {
    pub subpage: u32,
    pub offset: i16,
}

impl RecordLocation {
    /// Placeholder for "no record": only meaningful together with a
    /// record's `is_first` flag, since (0, 0) is also a real address.
    pub const NONE: RecordLocation = RecordLocation {
        subpage: 0,
        offset: 0,
    };

    pub(crate) fn encode(&self) -> [u8; 6] {
        let mut raw = [0u8; 6];
        raw[0..4].copy_from_slice(&self.subpage.to_le_bytes());
        raw[4..6].copy_from_slice(&self.offset.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8]) -> Self {
        RecordLocation {
            subpage: u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]),
            offset: i16::from_le_bytes([raw[4], raw[5]]),
        }
    }
}

/// Header preceding every record datum.
///
/// Wire layout: predecessor location (6 bytes), then a packed u16 LE with
/// the datum length in its low 14 bits, `is_first` at bit 14 and
/// `has_meta` at bit 15.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordHeader {
    pub predecessor: RecordLocation,
    pub length: u16,
    pub is_first: bool,
    pub has_meta: bool,
}

impl RecordHeader {
    pub(crate) fn encode(&self) -> [u8; RECORD_HEADER_SIZE] {
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw[0..6].copy_from_slice(&self.predecessor.encode());
        let mut packed = self.length & LENGTH_MASK;
        if self.is_first {
            packed |= IS_FIRST;
        }
        if self.has_meta {
            packed |= HAS_META;
        }
        raw[6..8].copy_from_slice(&packed.to_le_bytes());
        raw
    }

    pub(crate) fn decode(raw: &[u8]) -> Self {
        let packed = u16::from_le_bytes([raw[6], raw[7]]);
        RecordHeader {
            predecessor: RecordLocation::decode(&raw[0..6]),
            length: packed & LENGTH_MASK,
            is_first: packed & IS_FIRST != 0,
            has_meta: packed & HAS_META != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let header = RecordHeader {
            predecessor: RecordLocation {
                subpage: 0xDEAD_BEEF,
                offset: 417,
            },
            length: 8,
            is_first: false,
            has_meta: false,
        };
        let raw = header.encode();
        assert_eq!(RecordHeader::decode(&raw), header);
    }

    #[test]
    fn flags_do_not_bleed_into_length() {
        let header = RecordHeader {
            predecessor: RecordLocation::NONE,
            length: MAX_RECORD_DATA as u16,
            is_first: true,
            has_meta: true,
        };
        let decoded = RecordHeader::decode(&header.encode());
        assert_eq!(decoded.length, MAX_RECORD_DATA as u16);
        assert!(decoded.is_first);
        assert!(decoded.has_meta);

        // flag bits sit above the 14-bit length
        let raw = header.encode();
        assert_eq!(raw[7] & 0xC0, 0xC0);
    }

    #[test]
    fn location_wire_layout() {
        let location = RecordLocation {
            subpage: 0x0102_0304,
            offset: -1,
        };
        assert_eq!(location.encode(), [0x04, 0x03, 0x02, 0x01, 0xFF, 0xFF]);
        assert_eq!(RecordLocation::decode(&location.encode()), location);
    }
}
