//! Decoder for the Binary XML (BXML) payload of Windows Event Log (EVTX) files.

#![deny(unused_must_use)]
#![forbid(unsafe_code)]

pub use evtx_chunk::{
    ChunkFlags, EVTX_CHUNK_HEADER_SIZE, EVTX_CHUNK_SIZE, EvtxChunk, EvtxChunkHeader,
    IterChunkRecords,
};
pub use evtx_file_header::{EVTX_FILE_HEADER_SIZE, EvtxFileHeader, HeaderFlags};
pub use evtx_parser::{
    DEFAULT_MAX_DEPTH, EvtxParser, IterChunks, IterRecords, ParserSettings, Strictness,
};
pub use evtx_record::{
    EVTX_RECORD_HEADER_SIZE, EvtxRecord, EvtxRecordHeader, SerializedEvtxRecord,
};
pub use string_cache::StringCache;
pub use template_cache::TemplateCache;

pub use binxml::assemble::assemble_fragment;
pub use binxml::name::BinXmlName;
pub use binxml::value_variant::{BinXmlValue, BinXmlValueType, FileTime, Sid, SystemTime};
pub use model::deserialized::{BXmlNode, BinXmlFragment, NodeArena, NodeId, NodeKind};
pub use model::xml::{XmlAttribute, XmlDocument, XmlElement, XmlNode};

pub mod binxml;
pub mod err;
pub mod model;

mod evtx_chunk;
mod evtx_file_header;
mod evtx_parser;
mod evtx_record;
mod string_cache;
mod template_cache;
mod utils;

pub use utils::INVALID_TIMESTAMP_SENTINEL;

/// Offset of a byte relative to the start of its chunk.
pub type ChunkOffset = u32;
/// Offset of a byte relative to the start of the file.
pub type FileOffset = u64;

// For tests, we only initialize logging once.
#[cfg(test)]
use std::sync::Once;

#[cfg(test)]
static LOGGER_INIT: Once = Once::new();

// Rust runs the tests concurrently, so unless we synchronize logging access
// it will crash when attempting to run `cargo test` with some logging facilities.
#[cfg(test)]
pub fn ensure_env_logger_initialized() {
    LOGGER_INIT.call_once(env_logger::init);
}
