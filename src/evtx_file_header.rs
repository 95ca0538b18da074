use crate::err::{DeserializationResult, InputError};
use crate::utils::bytes;

use bitflags::bitflags;
use log::debug;

pub const EVTX_FILE_HEADER_SIZE: usize = 4096;

const EVTX_FILE_HEADER_MAGIC: &[u8; 8] = b"ElfFile\x00";

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct EvtxFileHeader {
    pub first_chunk_number: u64,
    pub last_chunk_number: u64,
    pub next_record_id: u64,
    pub header_size: u32,
    pub minor_version: u16,
    pub major_version: u16,
    pub header_block_size: u16,
    pub chunk_count: u16,
    pub flags: HeaderFlags,
    // Checksum is of first 120 bytes of header
    pub checksum: u32,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct HeaderFlags: u32 {
        const EMPTY = 0x0;
        const DIRTY = 0x1;
        const FULL = 0x2;
        const NO_CRC32 = 0x4;
    }
}

impl EvtxFileHeader {
    /// Parses the header at the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<EvtxFileHeader, InputError> {
        if data.len() < EVTX_FILE_HEADER_SIZE {
            return Err(InputError::TruncatedFileHeader { have: data.len() });
        }

        let magic = bytes::read_array::<8>(data, 0).unwrap_or_default();
        if &magic != EVTX_FILE_HEADER_MAGIC {
            return Err(InputError::InvalidFileHeaderMagic { magic });
        }

        // Every field lies within the first 128 bytes, which the length check above guarantees.
        let header = Self::read_fields(data).map_err(|_| InputError::TruncatedFileHeader {
            have: data.len(),
        })?;

        debug!("EVTX file header: {:?}", header);
        Ok(header)
    }

    fn read_fields(data: &[u8]) -> DeserializationResult<EvtxFileHeader> {
        let flags = bytes::read_u32_le_r(data, 120, "file header flags")?;

        Ok(EvtxFileHeader {
            first_chunk_number: bytes::read_u64_le_r(data, 8, "first chunk number")?,
            last_chunk_number: bytes::read_u64_le_r(data, 16, "last chunk number")?,
            next_record_id: bytes::read_u64_le_r(data, 24, "next record id")?,
            header_size: bytes::read_u32_le_r(data, 32, "file header size")?,
            minor_version: bytes::read_u16_le_r(data, 36, "minor version")?,
            major_version: bytes::read_u16_le_r(data, 38, "major version")?,
            header_block_size: bytes::read_u16_le_r(data, 40, "header block size")?,
            chunk_count: bytes::read_u16_le_r(data, 42, "chunk count")?,
            flags: HeaderFlags::from_bits_retain(flags),
            checksum: bytes::read_u32_le_r(data, 124, "file header checksum")?,
        })
    }

    /// CRC32 of the first 120 header bytes against the stored checksum. Advisory only.
    pub fn validate_checksum(&self, data: &[u8]) -> bool {
        let Some(covered) = data.get(..120) else {
            return false;
        };

        let checksum = crc32fast::hash(covered);
        debug!(
            "File header checksum expected: {:08x}, found: {:08x}",
            self.checksum, checksum
        );

        checksum == self.checksum
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(HeaderFlags::DIRTY)
    }

    pub fn is_full(&self) -> bool {
        self.flags.contains(HeaderFlags::FULL)
    }
}
