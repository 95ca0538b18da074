use crate::ChunkOffset;
use crate::binxml::assemble::assemble_fragment;
use crate::binxml::deserializer::read_fragment;
use crate::binxml::value_variant::FileTime;
use crate::err::{DeserializationResult, EvtxError, Result};
use crate::evtx_chunk::EvtxChunk;
use crate::model::deserialized::BinXmlFragment;
use crate::model::xml::XmlDocument;
use crate::utils::{bytes, dump_around};

use log::{Level, debug, log_enabled};
use std::cell::OnceCell;

pub const EVTX_RECORD_HEADER_SIZE: usize = 24;

const EVTX_RECORD_MAGIC: [u8; 4] = [0x2a, 0x2a, 0x00, 0x00];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvtxRecordHeader {
    pub magic: [u8; 4],
    pub data_size: u32,
    pub event_record_id: u64,
    pub timestamp: FileTime,
}

impl EvtxRecordHeader {
    /// Reads the header fields at `offset` without judging them.
    pub fn from_bytes(data: &[u8], offset: usize) -> DeserializationResult<EvtxRecordHeader> {
        Ok(EvtxRecordHeader {
            magic: bytes::read_array_r::<4>(data, offset, "record magic")?,
            data_size: bytes::read_u32_le_r(data, offset + 4, "record size")?,
            event_record_id: bytes::read_u64_le_r(data, offset + 8, "record id")?,
            timestamp: FileTime(bytes::read_u64_le_r(data, offset + 16, "record timestamp")?),
        })
    }

    pub fn has_valid_magic(&self) -> bool {
        self.magic == EVTX_RECORD_MAGIC
    }

    pub fn record_data_size(&self) -> u32 {
        // 24 - record header size
        // 4 - copy of size record size
        self.data_size.saturating_sub(EVTX_RECORD_HEADER_SIZE as u32 + 4)
    }
}

/// A record of a chunk. Decoding its BXML is deferred until the root is first requested.
#[derive(Debug)]
pub struct EvtxRecord<'a> {
    chunk: &'a EvtxChunk<'a>,
    pub header: EvtxRecordHeader,
    /// Chunk offset of the record header.
    pub offset: ChunkOffset,
    root: OnceCell<DeserializationResult<BinXmlFragment>>,
}

/// A record detached from its chunk, with its document fully materialized.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedEvtxRecord<T> {
    pub event_record_id: u64,
    pub timestamp: FileTime,
    pub data: T,
}

impl<'a> EvtxRecord<'a> {
    pub(crate) fn new(chunk: &'a EvtxChunk<'a>, header: EvtxRecordHeader, offset: ChunkOffset) -> Self {
        EvtxRecord {
            chunk,
            header,
            offset,
            root: OnceCell::new(),
        }
    }

    pub fn chunk(&self) -> &'a EvtxChunk<'a> {
        self.chunk
    }

    /// The low 16 bits of the record magic, `0x2a2a` for every record the chunk scan yields.
    pub fn magic(&self) -> u16 {
        u16::from_le_bytes([self.header.magic[0], self.header.magic[1]])
    }

    pub fn event_record_id(&self) -> u64 {
        self.header.event_record_id
    }

    pub fn timestamp(&self) -> FileTime {
        self.header.timestamp
    }

    /// The decoded root fragment. Decoded on first access; later calls return the same tree or
    /// the same error.
    pub fn root(&self) -> DeserializationResult<&BinXmlFragment> {
        self.root
            .get_or_init(|| self.read_root())
            .as_ref()
            .map_err(Clone::clone)
    }

    fn read_root(&self) -> DeserializationResult<BinXmlFragment> {
        let settings = &self.chunk.settings;
        let data_offset = self.offset + EVTX_RECORD_HEADER_SIZE as u32;
        let declared = self.header.record_data_size();

        debug!(
            "Record {}: decoding {} bytes of binxml at chunk offset {}",
            self.header.event_record_id, declared, data_offset
        );

        let fragment = read_fragment(self.chunk, data_offset, declared)?;

        if fragment.byte_span() != declared {
            settings.size_disagreement(
                "RootNode",
                u64::from(data_offset),
                format!(
                    "record {} fragment used {} bytes but the record declares {}",
                    self.header.event_record_id,
                    fragment.byte_span(),
                    declared
                ),
            )?;
        }

        let size_copy_offset = self.offset as usize + self.header.data_size as usize - 4;
        let size_copy = bytes::read_u32_le_r(self.chunk.data, size_copy_offset, "record size copy")?;
        if size_copy != self.header.data_size {
            settings.size_disagreement(
                "EvtxRecord",
                size_copy_offset as u64,
                format!(
                    "record {} trailing size {} disagrees with its header size {}",
                    self.header.event_record_id, size_copy, self.header.data_size
                ),
            )?;
        }

        Ok(fragment)
    }

    /// Expands templates and binds substitutions into an owned document.
    pub fn to_document(&self) -> DeserializationResult<XmlDocument> {
        assemble_fragment(self.root()?, self.chunk.settings.get_max_depth())
    }

    /// Materializes the record, tagging any failure with the record id.
    pub fn into_serialized(self) -> Result<SerializedEvtxRecord<XmlDocument>> {
        let event_record_id = self.header.event_record_id;

        match self.to_document() {
            Ok(data) => Ok(SerializedEvtxRecord {
                event_record_id,
                timestamp: self.header.timestamp,
                data,
            }),
            Err(source) => {
                if log_enabled!(Level::Debug) {
                    debug!(
                        "Record {} failed to decode ({}), bytes around the failure:\n{}",
                        event_record_id,
                        source,
                        dump_around(self.chunk.data, source.offset() as usize, 64)
                    );
                }

                Err(EvtxError::FailedToParseRecord {
                    record_id: event_record_id,
                    source,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ParserSettings;
    use crate::Strictness;
    use crate::binxml::value_variant::BinXmlValue;
    use crate::ensure_env_logger_initialized;
    use crate::err::DeserializationError;
    use crate::evtx_chunk::{EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE};
    use crate::model::xml::XmlNode;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// `<Data>hi</Data>` as a standalone fragment.
    fn data_element() -> Vec<u8> {
        let mut out = vec![0x0f, 0x01, 0x01, 0x00];
        // OpenStartElement, dependency id, data size patched below
        out.extend_from_slice(&[0x01, 0xff, 0xff]);
        let size_at = out.len();
        out.extend_from_slice(&[0; 4]);
        let element_data_start = out.len();

        // Inline name: offset of the entry itself, then the entry.
        let name_at = (EVTX_CHUNK_HEADER_SIZE + EVTX_RECORD_HEADER_SIZE + out.len() + 4) as u32;
        out.extend_from_slice(&name_at.to_le_bytes());
        out.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        out.extend_from_slice(&4_u16.to_le_bytes());
        out.extend("Data".encode_utf16().flat_map(u16::to_le_bytes));
        out.extend_from_slice(&[0, 0]);

        // CloseStartElement, Value(String "hi"), CloseElement
        out.push(0x02);
        out.extend_from_slice(&[0x05, 0x01, 0x02, 0x00]);
        out.extend("hi".encode_utf16().flat_map(u16::to_le_bytes));
        out.push(0x04);

        let size = (out.len() - element_data_start) as u32;
        out[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());

        out.push(0x00);
        out
    }

    fn chunk_with_record(bxml: &[u8], trailing_size: Option<u32>) -> Vec<u8> {
        let size = (EVTX_RECORD_HEADER_SIZE + bxml.len() + 4) as u32;

        let mut data = vec![0_u8; EVTX_CHUNK_HEADER_SIZE];
        data[..8].copy_from_slice(b"ElfChnk\x00");
        data.extend_from_slice(&EVTX_RECORD_MAGIC);
        data.extend_from_slice(&size.to_le_bytes());
        data.extend_from_slice(&42_u64.to_le_bytes());
        data.extend_from_slice(&129_761_722_633_545_630_u64.to_le_bytes());
        data.extend_from_slice(bxml);
        data.extend_from_slice(&trailing_size.unwrap_or(size).to_le_bytes());

        let free_space = data.len() as u32;
        data[48..52].copy_from_slice(&free_space.to_le_bytes());
        data.resize(EVTX_CHUNK_SIZE, 0);
        data
    }

    #[test]
    fn test_record_decodes_to_document() {
        ensure_env_logger_initialized();
        let data = chunk_with_record(&data_element(), None);
        let chunk = EvtxChunk::new(&data, Arc::new(ParserSettings::default())).unwrap();

        let record = chunk.records().next().unwrap().unwrap();
        assert_eq!(record.magic(), 0x2a2a);
        assert_eq!(record.event_record_id(), 42);
        assert_eq!(
            record.root().unwrap().byte_span(),
            record.header.record_data_size()
        );

        let document = record.to_document().unwrap();
        let element = document.root_element().unwrap();
        assert_eq!(element.name.as_str(), "Data");
        assert_eq!(
            element.children,
            vec![XmlNode::Value(BinXmlValue::StringType("hi".to_string()))]
        );

        let serialized = record.into_serialized().unwrap();
        assert_eq!(serialized.event_record_id, 42);
        assert_eq!(serialized.timestamp.to_string(), "2012-03-14T04:17:43.354563Z");
    }

    #[test]
    fn test_root_is_memoized() {
        let data = chunk_with_record(&data_element(), None);
        let chunk = EvtxChunk::new(&data, Arc::new(ParserSettings::default())).unwrap();
        let record = chunk.records().next().unwrap().unwrap();

        let first = record.root().unwrap() as *const BinXmlFragment;
        let second = record.root().unwrap() as *const BinXmlFragment;
        assert_eq!(first, second);
    }

    #[test]
    fn test_trailing_size_copy_follows_strictness() {
        ensure_env_logger_initialized();
        let data = chunk_with_record(&data_element(), Some(7));

        let lenient = EvtxChunk::new(&data, Arc::new(ParserSettings::default())).unwrap();
        assert!(lenient.records().next().unwrap().unwrap().root().is_ok());

        let strict = EvtxChunk::new(
            &data,
            Arc::new(ParserSettings::new().strictness(Strictness::Strict)),
        )
        .unwrap();
        let record = strict.records().next().unwrap().unwrap();
        assert!(matches!(
            record.root(),
            Err(DeserializationError::StructuralMismatch {
                kind: "EvtxRecord",
                ..
            })
        ));
    }

    #[test]
    fn test_fragment_shorter_than_record_follows_strictness() {
        let mut bxml = data_element();
        bxml.extend_from_slice(&[0, 0, 0, 0]);
        let data = chunk_with_record(&bxml, None);

        let lenient = EvtxChunk::new(&data, Arc::new(ParserSettings::default())).unwrap();
        assert!(lenient.records().next().unwrap().unwrap().to_document().is_ok());

        let strict = EvtxChunk::new(
            &data,
            Arc::new(ParserSettings::new().strictness(Strictness::Strict)),
        )
        .unwrap();
        let err = strict
            .records()
            .next()
            .unwrap()
            .unwrap()
            .into_serialized()
            .unwrap_err();
        assert!(matches!(
            err,
            EvtxError::FailedToParseRecord {
                record_id: 42,
                source: DeserializationError::StructuralMismatch {
                    kind: "RootNode",
                    ..
                }
            }
        ));
    }
}
