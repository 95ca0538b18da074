use crate::ChunkOffset;
use crate::err::{DeserializationError, DeserializationResult};
use crate::model::deserialized::TemplateDefinition;

use ahash::RandomState;
use hashbrown::HashMap;
use log::debug;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

pub type CachedTemplate = DeserializationResult<Arc<TemplateDefinition>>;

type Slot = Arc<OnceLock<CachedTemplate>>;

/// Per-chunk memo of non-resident template definitions, keyed by chunk offset.
///
/// Each offset is decoded at most once. The first caller runs the decode while concurrent
/// callers for the same offset block on the slot and reuse the outcome, including a failure.
/// Callers for other offsets are not blocked: the map lock is only held to find the slot.
#[derive(Debug, Default)]
pub struct TemplateCache {
    slots: Mutex<HashMap<ChunkOffset, Slot, RandomState>>,
    decode_count: AtomicUsize,
}

impl TemplateCache {
    pub fn new() -> Self {
        TemplateCache::default()
    }

    pub(crate) fn get_or_decode(
        &self,
        offset: ChunkOffset,
        decode: impl FnOnce() -> DeserializationResult<TemplateDefinition>,
    ) -> CachedTemplate {
        let slot = Arc::clone(
            self.slots
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(offset)
                .or_default(),
        );

        slot.get_or_init(|| {
            self.decode_count.fetch_add(1, Ordering::Relaxed);
            debug!("template cache miss, decoding template at offset {}", offset);

            decode()
                .map(Arc::new)
                .map_err(|e| DeserializationError::TemplateDecode {
                    template_offset: offset,
                    source: Box::new(e),
                })
        })
        .clone()
    }

    /// Returns the memoized outcome for `offset` if a decode for it has completed.
    pub fn get(&self, offset: ChunkOffset) -> Option<CachedTemplate> {
        let slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        slots.get(&offset).and_then(|slot| slot.get().cloned())
    }

    /// How many times a template body was actually decoded from the chunk bytes.
    pub fn decode_count(&self) -> usize {
        self.decode_count.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
