use crate::ChunkOffset;
use crate::err::{ChunkError, ChunkResult, DeserializationError, DeserializationResult};
use crate::evtx_parser::ParserSettings;
use crate::evtx_record::{EVTX_RECORD_HEADER_SIZE, EvtxRecord, EvtxRecordHeader};
use crate::string_cache::StringCache;
use crate::template_cache::TemplateCache;
use crate::utils::bytes;

use bitflags::bitflags;
use log::{debug, trace};
use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

pub const EVTX_CHUNK_SIZE: usize = 65536;
pub const EVTX_CHUNK_HEADER_SIZE: usize = 512;

const EVTX_CHUNK_HEADER_MAGIC: &[u8; 8] = b"ElfChnk\x00";
/// The low half of the record magic, which is all the scan looks at.
const RECORD_MAGIC: u16 = 0x2a2a;
/// Header plus the trailing copy of the size.
const MIN_RECORD_SIZE: u32 = EVTX_RECORD_HEADER_SIZE as u32 + 4;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ChunkFlags: u32 {
        const EMPTY = 0x0;
        const DIRTY = 0x1;
        const NO_CRC32 = 0x4;
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct EvtxChunkHeader {
    pub first_event_record_number: u64,
    pub last_event_record_number: u64,
    pub first_event_record_id: u64,
    pub last_event_record_id: u64,
    pub header_size: u32,
    pub last_event_record_data_offset: u32,
    pub free_space_offset: u32,
    pub events_checksum: u32,
    pub flags: ChunkFlags,
    pub header_chunk_checksum: u32,
    /// Bucket heads of the name hash table. There are 64 of them.
    pub strings_offsets: Vec<ChunkOffset>,
    /// Bucket heads of the template hash table. There are 32 of them.
    pub template_offsets: Vec<ChunkOffset>,
}

impl Debug for EvtxChunkHeader {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        fmt.debug_struct("EvtxChunkHeader")
            .field("first_event_record_number", &self.first_event_record_number)
            .field("last_event_record_number", &self.last_event_record_number)
            .field("first_event_record_id", &self.first_event_record_id)
            .field("last_event_record_id", &self.last_event_record_id)
            .field("free_space_offset", &self.free_space_offset)
            .field("flags", &self.flags)
            .field("checksum", &self.header_chunk_checksum)
            .finish()
    }
}

impl EvtxChunkHeader {
    /// Parses the 512-byte header at the start of `data`. The magic has already been checked.
    pub fn from_bytes(data: &[u8]) -> DeserializationResult<EvtxChunkHeader> {
        Ok(EvtxChunkHeader {
            first_event_record_number: bytes::read_u64_le_r(data, 8, "first record number")?,
            last_event_record_number: bytes::read_u64_le_r(data, 16, "last record number")?,
            first_event_record_id: bytes::read_u64_le_r(data, 24, "first record id")?,
            last_event_record_id: bytes::read_u64_le_r(data, 32, "last record id")?,
            header_size: bytes::read_u32_le_r(data, 40, "chunk header size")?,
            last_event_record_data_offset: bytes::read_u32_le_r(data, 44, "last record offset")?,
            free_space_offset: bytes::read_u32_le_r(data, 48, "free space offset")?,
            events_checksum: bytes::read_u32_le_r(data, 52, "events checksum")?,
            // 64 reserved bytes
            flags: ChunkFlags::from_bits_retain(bytes::read_u32_le_r(data, 120, "chunk flags")?),
            header_chunk_checksum: bytes::read_u32_le_r(data, 124, "chunk header checksum")?,
            strings_offsets: bytes::read_u32_vec_le_r(data, 128, 64, "string table")?,
            template_offsets: bytes::read_u32_vec_le_r(data, 384, 32, "template table")?,
        })
    }
}

/// A view over one chunk of the file image.
///
/// The chunk owns the name and template caches shared by all of its records. Records borrow the
/// chunk, so the caches live exactly as long as the chunk does.
pub struct EvtxChunk<'a> {
    pub data: &'a [u8],
    pub header: EvtxChunkHeader,
    pub string_cache: StringCache,
    pub template_cache: TemplateCache,
    pub settings: Arc<ParserSettings>,
}

impl<'a> EvtxChunk<'a> {
    /// Will fail if the data starts with an invalid evtx chunk header.
    pub fn new(data: &'a [u8], settings: Arc<ParserSettings>) -> ChunkResult<EvtxChunk<'a>> {
        if data.len() < EVTX_CHUNK_HEADER_SIZE {
            return Err(ChunkError::IncompleteChunk { have: data.len() });
        }

        let magic = bytes::read_array_r::<8>(data, 0, "chunk magic")?;
        if &magic != EVTX_CHUNK_HEADER_MAGIC {
            return Err(ChunkError::InvalidChunkMagic { magic });
        }

        let header = EvtxChunkHeader::from_bytes(data)?;

        Ok(EvtxChunk {
            data,
            header,
            string_cache: StringCache::new(),
            template_cache: TemplateCache::new(),
            settings,
        })
    }

    /// CRC32 of bytes `0..120` and `128..512` against the stored header checksum.
    pub fn validate_header_checksum(&self) -> ChunkResult<()> {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&self.data[..120]);
        hasher.update(&self.data[128..EVTX_CHUNK_HEADER_SIZE]);
        let found = hasher.finalize();

        debug!(
            "Chunk header checksum expected: {:08x}, found: {:08x}",
            self.header.header_chunk_checksum, found
        );

        if found == self.header.header_chunk_checksum {
            Ok(())
        } else {
            Err(ChunkError::InvalidHeaderChecksum {
                expected: self.header.header_chunk_checksum,
                found,
            })
        }
    }

    /// CRC32 of the record area, up to the free space offset.
    pub fn validate_data_checksum(&self) -> ChunkResult<()> {
        let end = (self.header.free_space_offset as usize).clamp(EVTX_CHUNK_HEADER_SIZE, self.data.len());
        let found = crc32fast::hash(&self.data[EVTX_CHUNK_HEADER_SIZE..end]);

        debug!(
            "Chunk data checksum expected: {:08x}, found: {:08x}",
            self.header.events_checksum, found
        );

        if found == self.header.events_checksum {
            Ok(())
        } else {
            Err(ChunkError::InvalidDataChecksum {
                expected: self.header.events_checksum,
                found,
            })
        }
    }

    pub fn validate_checksum(&self) -> ChunkResult<()> {
        self.validate_header_checksum()?;
        self.validate_data_checksum()
    }

    pub fn is_dirty(&self) -> bool {
        self.header.flags.contains(ChunkFlags::DIRTY)
    }

    /// Lazily scans the records of the chunk in storage order.
    pub fn records(&'a self) -> IterChunkRecords<'a> {
        let free_space = self.header.free_space_offset as usize;
        let limit = if (EVTX_CHUNK_HEADER_SIZE..=self.data.len()).contains(&free_space) {
            free_space
        } else {
            self.data.len()
        };

        IterChunkRecords {
            chunk: self,
            offset_from_chunk_start: EVTX_CHUNK_HEADER_SIZE,
            limit,
            exhausted: false,
        }
    }
}

impl Debug for EvtxChunk<'_> {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        writeln!(fmt, "\nEvtxChunk")?;
        writeln!(fmt, "-----------------------")?;
        writeln!(fmt, "{:#?}", &self.header)?;
        writeln!(fmt, "{} cached names", self.string_cache.len())?;
        writeln!(fmt, "{} cached templates", self.template_cache.len())?;
        Ok(())
    }
}

/// Records of one chunk, found by following each record's declared size.
///
/// The scan ends at the free space offset, at the first position that does not start with the
/// record magic, or after a record whose size cannot be trusted.
pub struct IterChunkRecords<'a> {
    chunk: &'a EvtxChunk<'a>,
    offset_from_chunk_start: usize,
    limit: usize,
    exhausted: bool,
}

impl IterChunkRecords<'_> {
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    pub fn offset_from_chunk_start(&self) -> usize {
        self.offset_from_chunk_start
    }
}

impl<'a> Iterator for IterChunkRecords<'a> {
    type Item = DeserializationResult<EvtxRecord<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.exhausted {
            return None;
        }

        let offset = self.offset_from_chunk_start;
        let data = &self.chunk.data[..self.limit];

        if data.len().saturating_sub(offset) < EVTX_RECORD_HEADER_SIZE
            || bytes::read_u16_le(data, offset) != Some(RECORD_MAGIC)
        {
            debug!("End of records at chunk offset {}", offset);
            self.exhausted = true;
            return None;
        }

        let header = match EvtxRecordHeader::from_bytes(data, offset) {
            Ok(header) => header,
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };

        if header.data_size < MIN_RECORD_SIZE || offset + header.data_size as usize > data.len() {
            self.exhausted = true;
            return Some(Err(DeserializationError::mismatch(
                "EvtxRecord",
                offset as u64,
                format!(
                    "record {} declares {} bytes, {} are available",
                    header.event_record_id,
                    header.data_size,
                    data.len() - offset
                ),
            )));
        }

        self.offset_from_chunk_start += header.data_size as usize;

        if !header.has_valid_magic() {
            return Some(Err(DeserializationError::InvalidRecordMagic {
                magic: header.magic,
                offset: offset as u64,
            }));
        }

        trace!(
            "Record {} at chunk offset {} ({} bytes)",
            header.event_record_id, offset, header.data_size
        );

        Some(Ok(EvtxRecord::new(
            self.chunk,
            header,
            offset as ChunkOffset,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ensure_env_logger_initialized;
    use crate::evtx_parser::ParserSettings;
    use pretty_assertions::assert_eq;

    /// StreamStart followed by EndOfStream.
    const EMPTY_FRAGMENT: [u8; 5] = [0x0f, 0x01, 0x01, 0x00, 0x00];

    fn record(id: u64, magic: [u8; 4]) -> Vec<u8> {
        let size = (EVTX_RECORD_HEADER_SIZE + EMPTY_FRAGMENT.len() + 4) as u32;
        let mut out = Vec::new();
        out.extend_from_slice(&magic);
        out.extend_from_slice(&size.to_le_bytes());
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&130_000_000_000_000_000_u64.to_le_bytes());
        out.extend_from_slice(&EMPTY_FRAGMENT);
        out.extend_from_slice(&size.to_le_bytes());
        out
    }

    fn chunk_bytes(records: &[Vec<u8>]) -> Vec<u8> {
        let mut data = vec![0_u8; EVTX_CHUNK_HEADER_SIZE];
        data[..8].copy_from_slice(EVTX_CHUNK_HEADER_MAGIC);
        data[8..16].copy_from_slice(&1_u64.to_le_bytes());
        data[16..24].copy_from_slice(&(records.len() as u64).to_le_bytes());
        data[40..44].copy_from_slice(&128_u32.to_le_bytes());
        for record in records {
            data.extend_from_slice(record);
        }

        let free_space = data.len() as u32;
        data[48..52].copy_from_slice(&free_space.to_le_bytes());
        let events_checksum = crc32fast::hash(&data[EVTX_CHUNK_HEADER_SIZE..]);
        data[52..56].copy_from_slice(&events_checksum.to_le_bytes());

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(&data[..120]);
        hasher.update(&data[128..EVTX_CHUNK_HEADER_SIZE]);
        data[124..128].copy_from_slice(&hasher.finalize().to_le_bytes());

        data.resize(EVTX_CHUNK_SIZE, 0);
        data
    }

    fn settings() -> Arc<ParserSettings> {
        Arc::new(ParserSettings::default())
    }

    #[test]
    fn test_parses_evtx_chunk_header() {
        ensure_env_logger_initialized();
        let data = chunk_bytes(&[record(1, *b"\x2a\x2a\x00\x00")]);
        let chunk = EvtxChunk::new(&data, settings()).unwrap();

        assert_eq!(chunk.header.first_event_record_number, 1);
        assert_eq!(chunk.header.last_event_record_number, 1);
        assert_eq!(chunk.header.header_size, 128);
        assert_eq!(chunk.header.free_space_offset, 545);
        assert_eq!(chunk.header.strings_offsets.len(), 64);
        assert_eq!(chunk.header.template_offsets.len(), 32);
        assert!(!chunk.is_dirty());
    }

    #[test]
    fn test_validate_checksum() {
        ensure_env_logger_initialized();
        let mut data = chunk_bytes(&[record(1, *b"\x2a\x2a\x00\x00")]);
        assert!(EvtxChunk::new(&data, settings()).unwrap().validate_checksum().is_ok());

        // Flip a byte of the record area.
        data[EVTX_CHUNK_HEADER_SIZE + 12] ^= 0xff;
        assert!(matches!(
            EvtxChunk::new(&data, settings()).unwrap().validate_checksum(),
            Err(ChunkError::InvalidDataChecksum { .. })
        ));

        // Bytes 120..128 are not covered by the header checksum.
        let mut data = chunk_bytes(&[]);
        data[121] ^= 0xff;
        assert!(EvtxChunk::new(&data, settings()).unwrap().validate_header_checksum().is_ok());
        data[60] ^= 0xff;
        assert!(matches!(
            EvtxChunk::new(&data, settings()).unwrap().validate_header_checksum(),
            Err(ChunkError::InvalidHeaderChecksum { .. })
        ));
    }

    #[test]
    fn test_rejects_bad_magic_and_short_chunk() {
        let mut data = chunk_bytes(&[]);
        data[3] = b'X';
        assert!(matches!(
            EvtxChunk::new(&data, settings()),
            Err(ChunkError::InvalidChunkMagic { .. })
        ));

        assert!(matches!(
            EvtxChunk::new(&data[..100], settings()),
            Err(ChunkError::IncompleteChunk { have: 100 })
        ));
    }

    #[test]
    fn test_scans_records_by_declared_size() {
        ensure_env_logger_initialized();
        let magic = *b"\x2a\x2a\x00\x00";
        let data = chunk_bytes(&[record(7, magic), record(8, magic), record(9, magic)]);
        let chunk = EvtxChunk::new(&data, settings()).unwrap();

        let records: Vec<_> = chunk.records().map(|r| r.unwrap()).collect();
        let ids: Vec<u64> = records.iter().map(|r| r.header.event_record_id).collect();

        assert_eq!(ids, vec![7, 8, 9]);
        assert!(records.iter().all(|r| r.magic() == 0x2a2a));
        assert_eq!(records[1].offset, 545);
    }

    #[test]
    fn test_scan_stops_at_unused_tail_when_free_space_is_bogus() {
        let magic = *b"\x2a\x2a\x00\x00";
        let mut data = chunk_bytes(&[record(1, magic), record(2, magic)]);
        // Point free space outside the chunk so that only the magic check ends the scan.
        data[48..52].copy_from_slice(&u32::MAX.to_le_bytes());
        let chunk = EvtxChunk::new(&data, settings()).unwrap();

        let mut records = chunk.records();
        assert_eq!(records.by_ref().count(), 2);
        assert!(records.exhausted());
    }

    #[test]
    fn test_full_magic_mismatch_is_scoped_to_the_record() {
        let data = chunk_bytes(&[
            record(1, *b"\x2a\x2a\x00\x00"),
            record(2, *b"\x2a\x2a\x01\x00"),
            record(3, *b"\x2a\x2a\x00\x00"),
        ]);
        let chunk = EvtxChunk::new(&data, settings()).unwrap();

        let results: Vec<_> = chunk.records().collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[1],
            Err(DeserializationError::InvalidRecordMagic {
                magic: [0x2a, 0x2a, 0x01, 0x00],
                offset: 545
            })
        ));
        assert_eq!(results[2].as_ref().unwrap().header.event_record_id, 3);
    }

    #[test]
    fn test_oversized_record_ends_the_scan() {
        let magic = *b"\x2a\x2a\x00\x00";
        let mut bad = record(1, magic);
        bad[4..8].copy_from_slice(&0x0010_0000_u32.to_le_bytes());
        let data = chunk_bytes(&[bad, record(2, magic)]);
        let chunk = EvtxChunk::new(&data, settings()).unwrap();

        let results: Vec<_> = chunk.records().collect();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(DeserializationError::StructuralMismatch { kind: "EvtxRecord", offset: 512, .. })
        ));
    }
}
