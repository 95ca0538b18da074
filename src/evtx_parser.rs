use crate::err::{
    ChunkError, DeserializationError, DeserializationResult, EvtxError, InputError, Result,
};
use crate::evtx_chunk::{EVTX_CHUNK_SIZE, EvtxChunk};
use crate::evtx_file_header::{EVTX_FILE_HEADER_SIZE, EvtxFileHeader};
use crate::evtx_record::SerializedEvtxRecord;
use crate::model::xml::XmlDocument;

use encoding::EncodingRef;
use encoding::all::WINDOWS_1252;
use log::{debug, warn};
#[cfg(feature = "multithreading")]
use rayon::prelude::*;
use std::collections::VecDeque;
use std::fmt::{self, Debug};
use std::fs;
use std::ops::Range;
use std::path::Path;
use std::sync::Arc;

/// Default recursion budget for nested elements, templates and fragments.
pub const DEFAULT_MAX_DEPTH: u32 = 128;

/// How size fields that disagree with the decoded content are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strictness {
    /// Any disagreement fails the record with `StructuralMismatch`.
    Strict,
    /// Disagreements are logged and decoding continues. Substitution values that fail to
    /// decode are kept as raw bytes.
    #[default]
    Lenient,
}

#[derive(Clone)]
pub struct ParserSettings {
    /// Controls the number of threads used for parsing chunks concurrently.
    num_threads: usize,
    /// If enabled, chunks with an invalid header or data checksum will be skipped.
    validate_checksums: bool,
    /// Enumerate every chunk that fits in the input, not only the ones the file header counts.
    include_inactive_chunks: bool,
    strictness: Strictness,
    max_depth: u32,
    /// The codec used to decode ANSI strings.
    ansi_codec: EncodingRef,
}

impl Debug for ParserSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParserSettings")
            .field("num_threads", &self.num_threads)
            .field("validate_checksums", &self.validate_checksums)
            .field("include_inactive_chunks", &self.include_inactive_chunks)
            .field("strictness", &self.strictness)
            .field("max_depth", &self.max_depth)
            .field("ansi_codec", &self.ansi_codec.name())
            .finish()
    }
}

impl PartialEq for ParserSettings {
    fn eq(&self, other: &Self) -> bool {
        self.num_threads == other.num_threads
            && self.validate_checksums == other.validate_checksums
            && self.include_inactive_chunks == other.include_inactive_chunks
            && self.strictness == other.strictness
            && self.max_depth == other.max_depth
            && self.ansi_codec.name() == other.ansi_codec.name()
    }
}

impl Default for ParserSettings {
    fn default() -> Self {
        ParserSettings {
            num_threads: 0,
            validate_checksums: false,
            include_inactive_chunks: false,
            strictness: Strictness::default(),
            max_depth: DEFAULT_MAX_DEPTH,
            ansi_codec: WINDOWS_1252,
        }
    }
}

impl ParserSettings {
    pub fn new() -> Self {
        ParserSettings::default()
    }

    /// Sets the number of worker threads.
    /// `0` will let rayon decide, `1` decodes on the calling thread.
    /// Without the `multithreading` feature this is always `1`.
    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = if cfg!(feature = "multithreading") {
            num_threads
        } else {
            1
        };
        self
    }

    pub fn validate_checksums(mut self, validate_checksums: bool) -> Self {
        self.validate_checksums = validate_checksums;
        self
    }

    pub fn include_inactive_chunks(mut self, include_inactive_chunks: bool) -> Self {
        self.include_inactive_chunks = include_inactive_chunks;
        self
    }

    pub fn strictness(mut self, strictness: Strictness) -> Self {
        self.strictness = strictness;
        self
    }

    pub fn max_depth(mut self, max_depth: u32) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn ansi_codec(mut self, ansi_codec: EncodingRef) -> Self {
        self.ansi_codec = ansi_codec;
        self
    }

    pub fn get_num_threads(&self) -> &usize {
        &self.num_threads
    }

    pub fn should_validate_checksums(&self) -> bool {
        self.validate_checksums
    }

    pub fn should_include_inactive_chunks(&self) -> bool {
        self.include_inactive_chunks
    }

    pub fn get_strictness(&self) -> Strictness {
        self.strictness
    }

    pub fn get_max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn get_ansi_codec(&self) -> EncodingRef {
        self.ansi_codec
    }

    /// Applies the strictness level to a size field that disagrees with what was decoded.
    pub(crate) fn size_disagreement(
        &self,
        kind: &'static str,
        offset: u64,
        message: String,
    ) -> DeserializationResult<()> {
        match self.strictness {
            Strictness::Strict => Err(DeserializationError::mismatch(kind, offset, message)),
            Strictness::Lenient => {
                warn!("offset {}: `{}` {}", offset, kind, message);
                Ok(())
            }
        }
    }
}

/// An EVTX file image held in memory.
///
/// All chunk and record views borrow from the parser's buffer; decoding never performs I/O.
pub struct EvtxParser {
    data: Vec<u8>,
    header: EvtxFileHeader,
    config: Arc<ParserSettings>,
}

impl Debug for EvtxParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EvtxParser")
            .field("len", &self.data.len())
            .field("header", &self.header)
            .field("config", &self.config)
            .finish()
    }
}

impl EvtxParser {
    /// Reads the whole file into memory.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read(path).map_err(|source| InputError::FailedToOpenFile {
            source,
            path: path.to_path_buf(),
        })?;

        Self::from_buffer(data)
    }

    pub fn from_buffer(data: Vec<u8>) -> Result<Self> {
        let header = EvtxFileHeader::from_bytes(&data)?;

        Ok(EvtxParser {
            data,
            header,
            config: Arc::new(ParserSettings::default()),
        })
    }

    pub fn with_configuration(mut self, configuration: ParserSettings) -> Self {
        if configuration.should_validate_checksums() && !self.header.validate_checksum(&self.data)
        {
            warn!("EVTX file header checksum is invalid");
        }

        self.config = Arc::new(configuration);
        self
    }

    pub fn header(&self) -> &EvtxFileHeader {
        &self.header
    }

    pub fn settings(&self) -> &ParserSettings {
        &self.config
    }

    /// The number of chunks `chunks()` enumerates.
    ///
    /// This is the header's chunk count, capped by how many whole chunks the input holds.
    pub fn chunk_count(&self) -> usize {
        let fitting = self.data.len().saturating_sub(EVTX_FILE_HEADER_SIZE) / EVTX_CHUNK_SIZE;

        if self.config.should_include_inactive_chunks() {
            fitting
        } else {
            fitting.min(usize::from(self.header.chunk_count))
        }
    }

    /// Chunk views in file order. Each call starts over from the first chunk.
    pub fn chunks(&self) -> IterChunks<'_> {
        IterChunks {
            parser: self,
            next_chunk: 0,
            chunk_count: self.chunk_count(),
        }
    }

    /// Every record of every chunk, decoded and materialized, in file order.
    ///
    /// Chunks are decoded in parallel batches when `multithreading` is enabled. A record that
    /// fails to decode yields an error and iteration continues with the next record.
    pub fn records(&self) -> IterRecords<'_> {
        IterRecords::new(self)
    }

    /// Returns `Ok(None)` when checksum validation is enabled and the chunk fails it.
    fn allocate_chunk(&self, index: usize) -> Result<Option<EvtxChunk<'_>>> {
        let start = EVTX_FILE_HEADER_SIZE + index * EVTX_CHUNK_SIZE;
        let chunk_id = index as u64;

        let data = self
            .data
            .get(start..start + EVTX_CHUNK_SIZE)
            .ok_or_else(|| EvtxError::FailedToParseChunk {
                chunk_id,
                source: ChunkError::IncompleteChunk {
                    have: self.data.len().saturating_sub(start),
                },
            })?;

        let chunk = EvtxChunk::new(data, Arc::clone(&self.config))
            .map_err(|source| EvtxError::FailedToParseChunk { chunk_id, source })?;

        if self.config.should_validate_checksums()
            && let Err(e) = chunk.validate_checksum()
        {
            warn!("Chunk {} failed checksum validation, skipping: {}", index, e);
            return Ok(None);
        }

        debug!("Allocated chunk {}: {:?}", index, chunk.header);
        Ok(Some(chunk))
    }

    fn decode_chunk(&self, index: usize) -> Vec<Result<SerializedEvtxRecord<XmlDocument>>> {
        let chunk = match self.allocate_chunk(index) {
            Ok(Some(chunk)) => chunk,
            Ok(None) => return vec![],
            Err(e) => return vec![Err(e)],
        };

        chunk
            .records()
            .map(|record| match record {
                Ok(record) => record.into_serialized(),
                Err(e) => Err(EvtxError::from(e)),
            })
            .collect()
    }
}

pub struct IterChunks<'p> {
    parser: &'p EvtxParser,
    next_chunk: usize,
    chunk_count: usize,
}

impl<'p> Iterator for IterChunks<'p> {
    type Item = Result<EvtxChunk<'p>>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next_chunk < self.chunk_count {
            let index = self.next_chunk;
            self.next_chunk += 1;

            match self.parser.allocate_chunk(index) {
                Ok(Some(chunk)) => return Some(Ok(chunk)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }

        None
    }
}

pub struct IterRecords<'p> {
    parser: &'p EvtxParser,
    next_chunk: usize,
    chunk_count: usize,
    batch_size: usize,
    #[cfg(feature = "multithreading")]
    pool: Option<rayon::ThreadPool>,
    buffered: VecDeque<Result<SerializedEvtxRecord<XmlDocument>>>,
}

impl<'p> IterRecords<'p> {
    fn new(parser: &'p EvtxParser) -> Self {
        let num_threads = *parser.settings().get_num_threads();

        #[cfg(feature = "multithreading")]
        let (batch_size, pool) = match num_threads {
            0 => (rayon::current_num_threads(), None),
            1 => (1, None),
            n => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => (n, Some(pool)),
                Err(e) => {
                    warn!("Failed to build a thread pool of {} threads: {}", n, e);
                    (1, None)
                }
            },
        };

        #[cfg(not(feature = "multithreading"))]
        let batch_size = {
            let _ = num_threads;
            1
        };

        IterRecords {
            parser,
            next_chunk: 0,
            chunk_count: parser.chunk_count(),
            batch_size: batch_size.max(1),
            #[cfg(feature = "multithreading")]
            pool,
            buffered: VecDeque::new(),
        }
    }

    fn decode_batch(
        &self,
        chunks: Range<usize>,
    ) -> Vec<Vec<Result<SerializedEvtxRecord<XmlDocument>>>> {
        let parser = self.parser;

        #[cfg(feature = "multithreading")]
        if self.batch_size > 1 {
            let work = || {
                chunks
                    .clone()
                    .into_par_iter()
                    .map(|index| parser.decode_chunk(index))
                    .collect::<Vec<_>>()
            };

            return match &self.pool {
                Some(pool) => pool.install(work),
                None => work(),
            };
        }

        chunks.map(|index| parser.decode_chunk(index)).collect()
    }
}

impl Iterator for IterRecords<'_> {
    type Item = Result<SerializedEvtxRecord<XmlDocument>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(record) = self.buffered.pop_front() {
                return Some(record);
            }

            if self.next_chunk >= self.chunk_count {
                return None;
            }

            let end = (self.next_chunk + self.batch_size).min(self.chunk_count);
            debug!("Decoding chunks {}..{}", self.next_chunk, end);
            let batch = self.decode_batch(self.next_chunk..end);
            self.next_chunk = end;

            self.buffered.extend(batch.into_iter().flatten());
        }
    }
}
