use crate::ChunkOffset;
use crate::binxml::name::BinXmlName;
use crate::err::DeserializationResult;

use ahash::RandomState;
use hashbrown::HashMap;
use log::trace;
use std::sync::{PoisonError, RwLock};

/// Per-chunk cache of decoded names, keyed by the chunk offset of the string entry.
///
/// Populated on first use. When two decoders race on the same offset the first stored
/// value wins and both callers observe it.
#[derive(Debug)]
pub struct StringCache {
    names: RwLock<HashMap<ChunkOffset, BinXmlName, RandomState>>,
}

impl Default for StringCache {
    fn default() -> Self {
        StringCache::new()
    }
}

impl StringCache {
    pub fn new() -> Self {
        StringCache {
            names: RwLock::new(HashMap::with_hasher(RandomState::new())),
        }
    }

    pub fn get(&self, offset: ChunkOffset) -> Option<BinXmlName> {
        self.names
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&offset)
            .cloned()
    }

    /// Returns the cached name, decoding and storing it on a miss. Decode failures are not
    /// cached.
    pub(crate) fn get_or_insert_with(
        &self,
        offset: ChunkOffset,
        decode: impl FnOnce() -> DeserializationResult<BinXmlName>,
    ) -> DeserializationResult<BinXmlName> {
        if let Some(name) = self.get(offset) {
            return Ok(name);
        }

        trace!("string cache miss at offset {}", offset);
        let name = decode()?;
        Ok(self.insert_if_absent(offset, name))
    }

    /// Stores `name` unless the offset is already cached, returning the cached value.
    pub(crate) fn insert_if_absent(&self, offset: ChunkOffset, name: BinXmlName) -> BinXmlName {
        self.names
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(offset)
            .or_insert(name)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.names.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
