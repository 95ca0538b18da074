use crate::ChunkOffset;

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, EvtxError>;

pub type DeserializationResult<T> = std::result::Result<T, DeserializationError>;
pub type ChunkResult<T> = std::result::Result<T, ChunkError>;

/// Errors raised while decoding BXML or record framing inside a single chunk.
///
/// Offsets are relative to the start of the chunk the bytes belong to.
/// The type is `Clone` because a failed template decode is memoized and handed to every
/// record that references it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeserializationError {
    #[error("offset {offset}: buffer too small for {what} (need {need} bytes, have {have})")]
    OutOfBounds {
        what: &'static str,
        offset: u64,
        need: usize,
        have: usize,
    },

    #[error("offset {offset}: tried to read an invalid byte `0x{value:02x}` as binxml token")]
    UnknownNodeType { value: u8, offset: u64 },

    #[error("offset {offset}: value variant `0x{value:02x}` is not supported")]
    UnsupportedVariantType { value: u8, offset: u64 },

    #[error("offset {offset}: malformed `{kind}`: {message}")]
    StructuralMismatch {
        kind: &'static str,
        offset: u64,
        message: String,
    },

    #[error("offset {offset}: nesting limit of {limit} exceeded while decoding `{kind}`")]
    DepthExceeded {
        kind: &'static str,
        offset: u64,
        limit: u32,
    },

    #[error(
        "offset {offset}: substitution index {index} is out of range (substitution array has {len} values)"
    )]
    SubstitutionIndexOutOfRange { index: u16, len: usize, offset: u64 },

    #[error("failed to decode template at offset {template_offset}: {source}")]
    TemplateDecode {
        template_offset: ChunkOffset,
        #[source]
        source: Box<DeserializationError>,
    },

    #[error("offset {offset}: invalid EVTX record header magic, expected `2a2a0000`, found `{magic:02X?}`")]
    InvalidRecordMagic { magic: [u8; 4], offset: u64 },
}

impl DeserializationError {
    pub(crate) fn mismatch(kind: &'static str, offset: u64, message: impl Into<String>) -> Self {
        DeserializationError::StructuralMismatch {
            kind,
            offset,
            message: message.into(),
        }
    }

    /// Byte offset (chunk relative) that triggered the failure.
    pub fn offset(&self) -> u64 {
        match self {
            DeserializationError::OutOfBounds { offset, .. }
            | DeserializationError::UnknownNodeType { offset, .. }
            | DeserializationError::UnsupportedVariantType { offset, .. }
            | DeserializationError::StructuralMismatch { offset, .. }
            | DeserializationError::DepthExceeded { offset, .. }
            | DeserializationError::SubstitutionIndexOutOfRange { offset, .. }
            | DeserializationError::InvalidRecordMagic { offset, .. } => *offset,
            DeserializationError::TemplateDecode { source, .. } => source.offset(),
        }
    }

    /// Failures that leave the surrounding structure intact. In lenient mode a leaf value that
    /// fails this way is replaced by a placeholder instead of failing the record.
    pub(crate) fn is_recoverable_leaf_error(&self) -> bool {
        !matches!(
            self,
            DeserializationError::DepthExceeded { .. }
                | DeserializationError::SubstitutionIndexOutOfRange { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Invalid EVTX chunk header magic, expected `ElfChnk0`, found `{magic:2X?}`")]
    InvalidChunkMagic { magic: [u8; 8] },

    #[error("Chunk is truncated (have {have} bytes)")]
    IncompleteChunk { have: usize },

    #[error("Failed to read chunk header: {0}")]
    FailedToParseChunkHeader(#[from] DeserializationError),

    #[error("chunk header CRC32 invalid, expected {expected:08x}, found {found:08x}")]
    InvalidHeaderChecksum { expected: u32, found: u32 },

    #[error("chunk data CRC32 invalid, expected {expected:08x}, found {found:08x}")]
    InvalidDataChecksum { expected: u32, found: u32 },
}

#[derive(Debug, Error)]
pub enum InputError {
    #[error("Failed to open file {}: {}", path.display(), source)]
    FailedToOpenFile {
        source: io::Error,
        path: PathBuf,
    },

    #[error("Invalid EVTX file header magic, expected `ElfFile0`, found `{magic:2X?}`")]
    InvalidFileHeaderMagic { magic: [u8; 8] },

    #[error("Input is too short to hold an EVTX file header (have {have} bytes)")]
    TruncatedFileHeader { have: usize },
}

#[derive(Debug, Error)]
pub enum EvtxError {
    #[error(transparent)]
    InputError(#[from] InputError),

    #[error("Failed to parse chunk number {chunk_id}: {source}")]
    FailedToParseChunk {
        chunk_id: u64,
        #[source]
        source: ChunkError,
    },

    #[error("Failed to parse record number {record_id}: {source}")]
    FailedToParseRecord {
        record_id: u64,
        #[source]
        source: DeserializationError,
    },

    #[error(transparent)]
    DeserializationError(#[from] DeserializationError),
}
