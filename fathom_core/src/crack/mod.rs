//! The cracking engine: walks a model over a bit stream and fills in a [`Tree`].
//!
//! Cracking is depth-first and left to right. Choices and sequences take a checkpoint before
//! every attempt and roll the arena, the cursor and the relation bindings back when the
//! attempt fails with a recoverable error.

mod array;
mod choice;
mod size;
#[cfg(test)]
mod tests;

pub use choice::ChoiceCache;

use crate::bits::{BitBuf, BitCursor, CursorError};
use crate::codec::{decode_number, strip_terminator, token_literal};
use crate::config::CrackerSettings;
use crate::encoding::StringEncoding;
use crate::error::{CrackError, CrackingFailure, ExpressionError, FailureKind};
use crate::expr::{Vars, eval_bool};
use crate::model::{Dom, ElementId, ElementKind, LengthUnit, Placement, RelationKind, Walk};
use crate::placement;
use crate::resolve::{relation_get, try_resolve};
use crate::schema::Schema;
use crate::tree::Tree;
use crate::value::Value;
use log::{debug, trace};
use size::ScalarSize;

/// Cracks inputs against a schema. One cracker keeps its choice cache across inputs, so
/// reuse it for a stream of similar inputs; it is not meant to be shared between threads.
#[derive(Debug)]
pub struct Cracker {
    settings: CrackerSettings,
    cache: ChoiceCache,
}

impl Default for Cracker {
    fn default() -> Self {
        Self::new(CrackerSettings::default())
    }
}

impl Cracker {
    pub fn new(settings: CrackerSettings) -> Self {
        let cache = ChoiceCache::new(settings.cache_capacity);
        Self { settings, cache }
    }

    pub fn settings(&self) -> &CrackerSettings {
        &self.settings
    }

    pub fn cache(&self) -> &ChoiceCache {
        &self.cache
    }

    /// Cracks `model` from the cursor's position, then applies placements.
    ///
    /// # Arguments
    ///
    /// * `schema` - The schema holding the model.
    /// * `model` - Name of the root data model.
    /// * `cursor` - The input; bits after the model are left unread.
    ///
    /// # Returns
    ///
    /// * `Result<Tree, CrackError>` - The cracked tree, or the first unrecovered failure.
    pub fn crack(
        &mut self,
        schema: &Schema,
        model: &str,
        cursor: &mut BitCursor,
    ) -> Result<Tree, CrackError> {
        let mut tree = Tree::empty(schema, model)?;
        let root = tree.root();
        debug!(model, position = cursor.position(); "Cracking data model");
        let mut state = CrackState {
            dom: tree.dom_mut(),
            cursor,
            cache: &mut self.cache,
            settings: &self.settings,
            schema_id: schema.id(),
            root,
            bindings: Vec::new(),
            bounds: Vec::new(),
            scope_roots: vec![root],
            anchored_at: usize::MAX,
            depth: 0,
        };
        state.crack_node(root)?;
        placement::reconcile(tree.dom_mut(), root)?;
        tree.prune_unbound_relations();
        Ok(tree)
    }

    pub fn crack_bytes(
        &mut self,
        schema: &Schema,
        model: &str,
        data: &[u8],
    ) -> Result<Tree, CrackError> {
        let mut cursor = BitCursor::new(data.to_vec());
        self.crack(schema, model, &mut cursor)
    }
}

/// A relation whose subject has been cracked. The object is resolved lazily because it may
/// not exist yet (an entry or an alternative that comes later).
#[derive(Debug, Clone)]
struct Binding {
    subject: ElementId,
    index: usize,
    kind: RelationKind,
    object: Option<ElementId>,
}

/// The container that owns one of the cursor's limits.
#[derive(Debug, Clone, Copy)]
struct Bound {
    owner: ElementId,
    begin: u64,
    end: u64,
}

#[derive(Debug, Clone, Copy)]
struct Checkpoint {
    nodes: usize,
    bindings: usize,
    position: u64,
    limits: usize,
}

pub(crate) struct CrackState<'a> {
    dom: &'a mut Dom,
    cursor: &'a mut BitCursor,
    cache: &'a mut ChoiceCache,
    settings: &'a CrackerSettings,
    schema_id: u64,
    root: ElementId,
    bindings: Vec<Binding>,
    /// Parallel to the cursor's limit stack.
    bounds: Vec<Bound>,
    /// Roots of the subtrees being cracked; the last one bounds lookahead.
    scope_roots: Vec<ElementId>,
    /// Oldest node whose position an offset was measured from.
    anchored_at: usize,
    depth: usize,
}

impl CrackState<'_> {
    fn indent(&self) -> String {
        " ".repeat(self.depth * 2)
    }

    fn failure(&self, kind: FailureKind, id: ElementId, message: impl Into<String>) -> CrackError {
        CrackError::new(
            kind,
            CrackingFailure {
                element: self.dom.full_name(id),
                element_type: self.dom.kind(id).type_name(),
                message: message.into(),
                position: self.cursor.position(),
            },
        )
    }

    fn mismatch(&self, id: ElementId, message: impl Into<String>) -> CrackError {
        self.failure(FailureKind::StructuralMismatch, id, message)
    }

    fn cursor_failure(&self, id: ElementId, err: CursorError) -> CrackError {
        let kind = match err {
            CursorError::TooWide(_) => FailureKind::StructuralMismatch,
            CursorError::Bounded {
                position,
                needed,
                bound,
            } => return self.overread(id, position.saturating_add(needed), bound),
            _ => FailureKind::InsufficientData,
        };
        self.failure(kind, id, err.to_string())
    }

    /// A read that would end at `until` crossed the limit ending at `bound`. Blocks and
    /// sequences fail outright; a choice's slot only rejects the alternative.
    fn overread(&self, id: ElementId, until: u64, bound: u64) -> CrackError {
        let Some(limit) = self.bounds.iter().rev().find(|b| b.end == bound) else {
            return self.failure(
                FailureKind::InsufficientData,
                id,
                format!("Reading to bit {until} would cross the bound at bit {bound}."),
            );
        };
        let (size, read) = (limit.end - limit.begin, until.saturating_sub(limit.begin));
        if matches!(self.dom.kind(limit.owner), ElementKind::Choice(_)) {
            return self.failure(
                FailureKind::InsufficientData,
                id,
                format!("Choice slot is {size} bits but the alternative needs {read} bits."),
            );
        }
        self.failure(
            FailureKind::Overread,
            limit.owner,
            format!("Length is {size} bits but already read {read} bits."),
        )
    }

    /// Caps the cursor at `begin + bits` on behalf of `owner`.
    fn push_bound(&mut self, owner: ElementId, begin: u64, bits: u64) {
        let end = begin.saturating_add(bits);
        self.cursor.push_limit(end);
        self.bounds.push(Bound { owner, begin, end });
    }

    fn truncate_bounds(&mut self, depth: usize) {
        self.cursor.truncate_limits(depth);
        self.bounds.truncate(depth);
    }

    fn expression_failure(&self, id: ElementId, source: ExpressionError) -> CrackError {
        CrackError::Expression {
            element: self.dom.full_name(id),
            source,
        }
    }

    fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            nodes: self.dom.len(),
            bindings: self.bindings.len(),
            position: self.cursor.position(),
            limits: self.cursor.limit_depth(),
        }
    }

    fn rollback(&mut self, checkpoint: Checkpoint) {
        self.dom.truncate(checkpoint.nodes);
        self.bindings.truncate(checkpoint.bindings);
        for binding in &mut self.bindings {
            if binding.object.is_some_and(|o| o.index() >= checkpoint.nodes) {
                binding.object = None;
            }
        }
        self.truncate_bounds(checkpoint.limits);
        if let Err(e) = self.cursor.seek(checkpoint.position) {
            debug!("Rollback could not restore position {}: {e}", checkpoint.position);
        }
    }

    fn bind_relations(&mut self, subject: ElementId) {
        let count = self.dom.node(subject).relations.len();
        for index in 0..count {
            let relation = &self.dom.node(subject).relations[index];
            let kind = relation.kind;
            let object = try_resolve(self.dom, &relation.of, subject);
            self.bindings.push(Binding {
                subject,
                index,
                kind,
                object,
            });
        }
    }

    /// The cracked relation of `kind` whose object is `object`, as (subject, relation index).
    fn bound(&mut self, object: ElementId, kind: RelationKind) -> Option<(ElementId, usize)> {
        for i in 0..self.bindings.len() {
            if self.bindings[i].kind != kind {
                continue;
            }
            if self.bindings[i].object.is_none() {
                let Binding { subject, index, .. } = self.bindings[i];
                let of = &self.dom.node(subject).relations[index].of;
                self.bindings[i].object = try_resolve(self.dom, of, subject);
            }
            let binding = &self.bindings[i];
            if binding.object == Some(object) {
                return Some((binding.subject, binding.index));
            }
        }
        None
    }

    /// The logical quantity carried by a cracked relation subject.
    fn relation_logical(&self, subject: ElementId, index: usize) -> Result<i64, CrackError> {
        let node = self.dom.node(subject);
        let relation = &node.relations[index];
        let raw = node.value.as_ref().and_then(Value::as_i64).ok_or_else(|| {
            self.mismatch(subject, format!("{:?} relation value is not numeric.", relation.kind))
        })?;
        relation_get(relation, raw).map_err(|e| self.expression_failure(subject, e))
    }

    /// Where an element with a cracked offset relation must begin.
    fn offset_target(&mut self, id: ElementId) -> Result<Option<u64>, CrackError> {
        let Some((subject, index)) = self.bound(id, RelationKind::Offset) else {
            return Ok(None);
        };
        let logical = self.relation_logical(subject, index)?;
        let relation = self.dom.node(subject).relations[index].clone();
        let scaled = match relation.length_type {
            LengthUnit::Bits => Some(logical),
            _ => logical.checked_mul(8),
        }
        .ok_or_else(|| self.mismatch(id, format!("Offset {logical} is out of range.")))?;
        let anchor_node = if !relation.relative {
            self.root
        } else if let Some(name) = &relation.relative_to {
            try_resolve(self.dom, name, subject)
                .filter(|a| self.dom.node(*a).begin.is_some())
                .ok_or_else(|| {
                    self.mismatch(id, format!("Offset anchor '{name}' has not been cracked."))
                })?
        } else {
            subject
        };
        let anchor = self.dom.node(anchor_node).begin.unwrap_or(0);
        self.anchored_at = self.anchored_at.min(anchor_node.index());
        let target = (anchor as i64).checked_add(scaled).filter(|t| *t >= 0).ok_or_else(|| {
            self.mismatch(id, format!("Offset {scaled} bits from {anchor} is out of range."))
        })?;
        trace!("{}Offset of '{}' is bit {target}", self.indent(), self.dom.name(id));
        Ok(Some(target as u64))
    }

    pub(crate) fn crack_node(&mut self, id: ElementId) -> Result<(), CrackError> {
        if let Some(target) = self.offset_target(id)? {
            let position = self.cursor.position();
            if target < position {
                return Err(self.mismatch(
                    id,
                    format!("Offset is {target} bits but already read {position} bits."),
                ));
            }
            self.cursor
                .seek(target)
                .map_err(|e| self.cursor_failure(id, e))?;
        }

        let begin = self.cursor.position();
        {
            let node = self.dom.node_mut(id);
            node.begin = Some(begin);
            node.end = None;
        }
        let marker = if self.dom.kind(id).is_container() { "-+" } else { "--" };
        debug!(
            "{}{marker} {} '{}' at bit {begin}",
            self.indent(),
            self.dom.kind(id).type_name(),
            self.dom.name(id)
        );

        self.depth += 1;
        let result = match self.dom.kind(id) {
            ElementKind::Block(_) => self.crack_block(id),
            ElementKind::Choice(_) => self.crack_choice(id),
            ElementKind::Sequence(_) => self.crack_sequence(id),
            _ => self.crack_scalar(id),
        };
        self.depth -= 1;
        if let Err(e) = result {
            debug!("{}X  {e}", self.indent());
            return Err(e);
        }

        let end = self.cursor.position();
        self.dom.node_mut(id).end = Some(end);
        self.check_constraint(id)?;
        self.bind_relations(id);
        trace!("{}   '{}' spans [{begin}, {end})", self.indent(), self.dom.name(id));
        Ok(())
    }

    fn check_constraint(&mut self, id: ElementId) -> Result<(), CrackError> {
        let node = self.dom.node(id);
        let Some(source) = node.constraint.clone() else {
            return Ok(());
        };
        let (begin, end) = (node.begin.unwrap_or(0), node.end.unwrap_or(0));
        let value = match &node.value {
            Some(v) if !node.kind.is_container() => v.clone(),
            _ => Value::Bits(self.cursor.bits_between(begin, end).unwrap_or_default()),
        };
        let vars = Vars::new()
            .with("value", value)
            .with("size", ((end - begin) / 8) as i64);
        match eval_bool(&source, &vars) {
            Ok(true) => Ok(()),
            Ok(false) => Err(self.failure(
                FailureKind::ConstraintViolation,
                id,
                format!("Constraint '{source}' failed."),
            )),
            Err(e) => Err(self.expression_failure(id, e)),
        }
    }

    /// Cracks an absolutely placed element at its offset and returns to where the enclosing
    /// block left off.
    fn crack_out_of_line(&mut self, id: ElementId) -> Result<(), CrackError> {
        let target = self.offset_target(id)?.ok_or_else(|| {
            self.mismatch(id, "Absolute placement needs a cracked offset relation.")
        })?;
        let resume = self.cursor.position();
        let limits = self.cursor.take_limits();
        let bounds = std::mem::take(&mut self.bounds);
        self.scope_roots.push(id);
        let result = match self.cursor.seek(target) {
            Ok(()) => self.crack_node(id),
            Err(e) => Err(self.cursor_failure(id, e)),
        };
        self.scope_roots.pop();
        self.cursor.restore_limits(limits);
        self.bounds = bounds;
        if let Err(e) = self.cursor.seek(resume) {
            debug!("Could not return to bit {resume}: {e}");
        }
        result
    }

    fn crack_block(&mut self, id: ElementId) -> Result<(), CrackError> {
        let begin = self.cursor.position();
        let depth = self.cursor.limit_depth();
        let mut size = self.container_size(id)?;
        if let Some(bits) = size {
            self.push_bound(id, begin, bits);
        }
        let result = self.crack_block_children(id, begin, &mut size);
        self.truncate_bounds(depth);
        result
    }

    fn crack_block_children(
        &mut self,
        id: ElementId,
        begin: u64,
        size: &mut Option<u64>,
    ) -> Result<(), CrackError> {
        let children = self.dom.children(id, Walk::Live).to_vec();
        for child in &children {
            if self.dom.node(*child).placement == Some(Placement::Absolute) {
                self.crack_out_of_line(*child)?;
            } else {
                self.crack_node(*child)?;
            }
            if size.is_none() {
                if let Some(bits) = self.container_size(id)? {
                    let read = self.cursor.position() - begin;
                    if read > bits {
                        return Err(self.failure(
                            FailureKind::Overread,
                            id,
                            format!("Length is {bits} bits but already read {read} bits."),
                        ));
                    }
                    self.push_bound(id, begin, bits);
                    *size = Some(bits);
                }
            }
        }
        if let Some(bits) = *size {
            let read = self.cursor.position() - begin;
            if read < bits {
                if children.is_empty() {
                    self.cursor
                        .seek(begin + bits)
                        .map_err(|e| self.cursor_failure(id, e))?;
                } else {
                    // An under-read remainder is not skipped: a block with children must
                    // account for its whole length.
                    return Err(self.mismatch(
                        id,
                        format!("Length is {bits} bits but only read {read} bits."),
                    ));
                }
            }
        }
        Ok(())
    }

    fn crack_scalar(&mut self, id: ElementId) -> Result<(), CrackError> {
        let size = self.scalar_size(id)?;
        let declared = self.dom.node(id).length.is_some();
        let explicit = declared || self.bound(id, RelationKind::Size).is_some();
        let node = self.dom.node(id);
        let literal = if node.token {
            Some(token_literal(node).map_err(|e| self.mismatch(id, e))?)
        } else {
            None
        };

        let value = match (node.kind.clone(), size) {
            (ElementKind::Number(def), ScalarSize::Bits(bits)) => {
                let raw = self.read_checked(id, bits, literal.as_ref())?;
                decode_number(&def, raw.uint_at(0, bits as u32))
            }
            (ElementKind::String(def), ScalarSize::Bits(bits)) => {
                if bits % 8 != 0 {
                    return Err(self.mismatch(
                        id,
                        format!("String length of {bits} bits is not a whole number of bytes."),
                    ));
                }
                let raw = self.read_checked(id, bits, literal.as_ref())?.into_bytes();
                let raw = if def.null_terminated && !explicit {
                    strip_terminator(def.encoding, raw)
                } else {
                    raw
                };
                self.decode_text(id, def.encoding, &raw)?
            }
            (ElementKind::String(def), ScalarSize::Chars(count)) => {
                let raw = self.read_chars(id, def.encoding, Some(count))?;
                self.decode_text(id, def.encoding, &raw)?
            }
            (ElementKind::String(def), ScalarSize::NullTerminated) => {
                let raw = self.read_chars(id, def.encoding, None)?;
                self.decode_text(id, def.encoding, &raw)?
            }
            (_, ScalarSize::Bits(bits)) => {
                Value::Bits(self.read_checked(id, bits, literal.as_ref())?)
            }
            (kind, other) => {
                return Err(self.mismatch(
                    id,
                    format!("{} cannot be read as {other:?}.", kind.type_name()),
                ));
            }
        };
        trace!("{}   value {value}", self.indent());
        self.dom.node_mut(id).value = Some(value);
        Ok(())
    }

    /// Reads `bits` bits, comparing them against a token literal first.
    fn read_checked(
        &mut self,
        id: ElementId,
        bits: u64,
        literal: Option<&BitBuf>,
    ) -> Result<BitBuf, CrackError> {
        let raw = self
            .cursor
            .read(bits)
            .map_err(|e| self.cursor_failure(id, e))?;
        if let Some(literal) = literal {
            if raw != *literal {
                return Err(self.mismatch(
                    id,
                    format!(
                        "Token did not match: expected 0x{} but found 0x{}.",
                        literal.to_hex(),
                        raw.to_hex()
                    ),
                ));
            }
        }
        Ok(raw)
    }

    fn decode_text(
        &self,
        id: ElementId,
        encoding: StringEncoding,
        raw: &[u8],
    ) -> Result<Value, CrackError> {
        encoding
            .decode(raw)
            .map(Value::Str)
            .map_err(|e| self.mismatch(id, e.to_string()))
    }

    /// Reads whole characters: `count` of them, or up to and including a terminator.
    fn read_chars(
        &mut self,
        id: ElementId,
        encoding: StringEncoding,
        count: Option<u64>,
    ) -> Result<Vec<u8>, CrackError> {
        let unit = encoding.unit_bytes() as u64 * 8;
        let mut bytes = Vec::new();
        let mut read = 0;
        loop {
            if count == Some(read) {
                break;
            }
            let first = self
                .cursor
                .peek(unit)
                .map_err(|e| self.cursor_failure(id, e))?
                .into_bytes();
            if count.is_none() && first.iter().all(|b| *b == 0) {
                self.cursor
                    .read(unit)
                    .map_err(|e| self.cursor_failure(id, e))?;
                break;
            }
            let width = encoding
                .char_width(&first)
                .map_err(|e| self.mismatch(id, e.to_string()))?;
            let ch = self
                .cursor
                .read(width as u64 * 8)
                .map_err(|e| self.cursor_failure(id, e))?;
            bytes.extend(ch.into_bytes());
            read += 1;
        }
        Ok(bytes)
    }
}
