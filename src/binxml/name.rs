use crate::ChunkOffset;
use crate::err::DeserializationResult as Result;
use crate::string_cache::StringCache;
use crate::utils::ByteCursor;

use log::trace;
use std::fmt;
use std::sync::Arc;

/// An element, attribute, entity or processing-instruction name.
///
/// Names are shared through the chunk string cache, so cloning is cheap.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Clone)]
pub struct BinXmlName {
    str: Arc<str>,
}

impl fmt::Display for BinXmlName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.str)
    }
}

#[derive(Debug, PartialEq, PartialOrd, Clone)]
pub(crate) struct BinXmlNameLink {
    pub next_string: Option<ChunkOffset>,
    pub hash: u16,
}

impl BinXmlNameLink {
    pub(crate) fn from_cursor(cursor: &mut ByteCursor<'_>) -> Result<Self> {
        let next_string = cursor.u32_named("next_string")?;
        let hash = cursor.u16_named("name_hash")?;

        Ok(BinXmlNameLink {
            next_string: if next_string > 0 {
                Some(next_string)
            } else {
                None
            },
            hash,
        })
    }
}

impl BinXmlName {
    pub fn from_str(s: &str) -> Self {
        BinXmlName { str: Arc::from(s) }
    }

    pub fn as_str(&self) -> &str {
        &self.str
    }

    /// Reads a full string table entry: link, hash, character count, characters and NUL.
    pub(crate) fn read_entry(cursor: &mut ByteCursor<'_>) -> Result<(BinXmlNameLink, Self)> {
        let link = BinXmlNameLink::from_cursor(cursor)?;
        let name = cursor.len_prefixed_utf16_string(true, "name")?;

        Ok((link, BinXmlName::from_str(&name)))
    }

    /// Reads a name reference (a `u32` chunk offset) and resolves it through the string cache.
    ///
    /// When the offset points right after the reference, the entry is stored inline and the
    /// cursor is moved past it. Otherwise the entry lives elsewhere in the chunk and the cursor
    /// only moves past the reference.
    pub(crate) fn from_binxml_cursor(
        cursor: &mut ByteCursor<'_>,
        chunk_data: &[u8],
        cache: &StringCache,
    ) -> Result<Self> {
        let name_offset = cursor.u32_named("name_offset")?;

        if name_offset as usize == cursor.pos() {
            trace!("name is here");
            let (_, name) = Self::read_entry(cursor)?;
            return Ok(cache.insert_if_absent(name_offset, name));
        }

        cache.get_or_insert_with(name_offset, || {
            let mut entry = ByteCursor::with_pos(chunk_data, name_offset as usize)?;
            Self::read_entry(&mut entry).map(|(_, name)| name)
        })
    }
}
