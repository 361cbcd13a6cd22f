use super::CrackState;
use crate::bits::BitBuf;
use crate::error::CrackError;
use crate::model::{ElementId, ElementKind};
use crate::value::Value;
use log::{debug, trace};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct CacheKey {
    schema: u64,
    choice: ElementId,
    fingerprint: [u8; 16],
}

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    alternative: usize,
    /// Bits past the choice's start that the ordered search depended on.
    reach: u64,
}

/// Remembers which alternative of a choice matched for a given prefix of upcoming data.
///
/// The key is the choice's schema element plus an MD5 fingerprint of the next few bytes and of
/// the relation values still waiting for an object. An entry is only recorded when the ordered
/// search looked at nothing beyond the fingerprinted window, so a hit selects exactly what the
/// ordered search would have.
#[derive(Debug, Default)]
pub struct ChoiceCache {
    entries: HashMap<CacheKey, CacheEntry>,
    capacity: usize,
    hits: u64,
    misses: u64,
}

impl ChoiceCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            capacity,
            hits: 0,
            misses: 0,
        }
    }

    fn key(schema: u64, choice: ElementId, window: &BitBuf, context: &[u8]) -> CacheKey {
        let mut digest = md5::Context::new();
        digest.consume(window.len().to_le_bytes());
        digest.consume(window.as_bytes());
        digest.consume(context);
        CacheKey {
            schema,
            choice,
            fingerprint: digest.compute().0,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let found = self.entries.get(key).copied();
        if found.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        found
    }

    fn insert(&mut self, key: CacheKey, entry: CacheEntry) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.entries.clear();
        }
        self.entries.insert(key, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl CrackState<'_> {
    pub(super) fn crack_choice(&mut self, id: ElementId) -> Result<(), CrackError> {
        let begin = self.cursor.position();
        let depth = self.cursor.limit_depth();
        let size = self.container_size(id)?;
        if let Some(bits) = size {
            self.push_bound(id, begin, bits);
        }
        let result = self.select_alternative(id, begin);
        self.truncate_bounds(depth);
        result?;
        // A sized choice occupies its whole slot even when the alternative is shorter.
        if let Some(bits) = size {
            if self.cursor.position() < begin + bits {
                self.cursor
                    .seek(begin + bits)
                    .map_err(|e| self.cursor_failure(id, e))?;
            }
        }
        Ok(())
    }

    fn select_alternative(&mut self, id: ElementId, begin: u64) -> Result<(), CrackError> {
        let ElementKind::Choice(def) = self.dom.kind(id) else {
            return Ok(());
        };
        let alternatives = def.alternatives.clone();
        let origin = self.dom.node(id).origin;

        let key = if self.settings.choice_cache {
            let window = self.cursor.window(self.settings.cache_window_bytes);
            let context = self.pending_context();
            let key = ChoiceCache::key(self.schema_id, origin, &window, &context);
            Some((key, begin + window.len()))
        } else {
            None
        };
        let cached = key
            .as_ref()
            .and_then(|(k, _)| self.cache.get(k))
            .filter(|entry| entry.alternative < alternatives.len());
        let first = cached.map(|entry| entry.alternative);
        let order: Vec<usize> = first
            .into_iter()
            .chain((0..alternatives.len()).filter(|i| Some(*i) != first))
            .collect();

        let nodes = self.dom.len();
        let outer_reach = self.cursor.reset_reach();
        let outer_anchor = std::mem::replace(&mut self.anchored_at, usize::MAX);
        let result = self.try_alternatives(id, begin, &alternatives, &order, first);
        if let Some(entry) = cached {
            self.cursor.extend_reach(begin + entry.reach);
        }
        let reach = self.cursor.reach();
        let anchored = self.anchored_at;
        self.cursor.extend_reach(outer_reach);
        self.anchored_at = outer_anchor.min(anchored);
        let index = result?;

        if let Some((key, window_end)) = key {
            if reach <= window_end && anchored >= nodes {
                let reach = reach - begin;
                self.cache.insert(key, CacheEntry { alternative: index, reach });
            } else {
                trace!(
                    "{}Not caching '{}': the search read to bit {reach}, past bit {window_end}",
                    self.indent(),
                    self.dom.name(id)
                );
            }
        }
        Ok(())
    }

    /// Relation values cracked before the choice whose objects are not known yet. Any of them
    /// may size or place an element inside an alternative.
    fn pending_context(&self) -> Vec<u8> {
        let mut context = Vec::new();
        for binding in self.bindings.iter().filter(|b| b.object.is_none()) {
            let node = self.dom.node(binding.subject);
            context.extend((node.origin.index() as u64).to_le_bytes());
            context.extend((binding.index as u64).to_le_bytes());
            let value = node.value.as_ref().and_then(Value::as_i64);
            context.extend(value.unwrap_or(i64::MIN).to_le_bytes());
        }
        context
    }

    /// Tries alternatives in `order` and returns the index of the one that cracked.
    fn try_alternatives(
        &mut self,
        id: ElementId,
        begin: u64,
        alternatives: &[ElementId],
        order: &[usize],
        cached: Option<usize>,
    ) -> Result<usize, CrackError> {
        for &index in order {
            let checkpoint = self.checkpoint();
            let clone = self.dom.instantiate(alternatives[index], id);
            self.set_selected(id, Some(clone));
            trace!(
                "{}Trying alternative '{}'{}",
                self.indent(),
                self.dom.name(clone),
                if Some(index) == cached { " (cached)" } else { "" }
            );
            match self.crack_node(clone) {
                Ok(()) => {
                    debug!("{}Selected '{}'", self.indent(), self.dom.name(clone));
                    return Ok(index);
                }
                Err(e) if e.is_recoverable() => {
                    self.rollback(checkpoint);
                    self.set_selected(id, None);
                    if let Err(e) = self.cursor.seek(begin) {
                        return Err(self.cursor_failure(id, e));
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(self.mismatch(id, "No valid children were found."))
    }

    fn set_selected(&mut self, id: ElementId, selected: Option<ElementId>) {
        if let ElementKind::Choice(def) = &mut self.dom.node_mut(id).kind {
            def.selected = selected;
        }
    }
}
