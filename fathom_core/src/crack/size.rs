//! Working out how many bits an element occupies before reading it.
//!
//! Sizes come, in order of preference, from a cracked size relation, the element's declared
//! length or fixed width, a token's literal, or a deterministic read (terminators and
//! character counts). Anything else is found by looking ahead: the elements that follow are
//! scanned for tokens to search for and for fixed sizes to subtract from what remains.

use super::CrackState;
use crate::codec::{declared_bits, token_literal};
use crate::error::{CrackError, FailureKind};
use crate::model::{ElementId, ElementKind, LengthUnit, Placement, RelationKind};
use crate::resolve::try_resolve;
use log::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ScalarSize {
    Bits(u64),
    Chars(u64),
    NullTerminated,
}

/// How a scan over the following elements ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    /// Everything scanned had a known size.
    Sized,
    /// An element whose size is only known by reading it.
    Deterministic,
    Unsized,
    /// An element pinned to an absolute bit position by an offset relation.
    End(u64),
}

#[derive(Debug, Clone, Copy)]
struct TokenMark {
    element: ElementId,
    /// Bits of known-size elements between the unsized element and this token.
    offset: u64,
    required: bool,
}

impl CrackState<'_> {
    /// Bits given by a cracked size relation targeting `id`.
    pub(super) fn relation_size(&mut self, id: ElementId) -> Result<Option<u64>, CrackError> {
        let Some((subject, index)) = self.bound(id, RelationKind::Size) else {
            return Ok(None);
        };
        let logical = self.relation_logical(subject, index)?;
        if logical < 0 {
            return Err(self.mismatch(
                id,
                format!(
                    "Size relation from '{}' is negative ({logical}).",
                    self.dom.full_name(subject)
                ),
            ));
        }
        let bits = match self.dom.node(subject).relations[index].length_type {
            LengthUnit::Bits => Some(logical as u64),
            _ => (logical as u64).checked_mul(8),
        }
        .ok_or_else(|| self.mismatch(id, format!("Size of {logical} bytes is out of range.")))?;
        trace!("{}Size of '{}' is {bits} bits", self.indent(), self.dom.name(id));
        Ok(Some(bits))
    }

    /// Size of a container, if a relation or declared length fixes it.
    pub(super) fn container_size(&mut self, id: ElementId) -> Result<Option<u64>, CrackError> {
        if let Some(bits) = self.relation_size(id)? {
            return Ok(Some(bits));
        }
        let node = self.dom.node(id);
        Ok(declared_bits(&node.kind, node.length))
    }

    /// Padding needed at absolute bit `at` to reach the next alignment boundary.
    pub(super) fn padding_bits(&self, id: ElementId, at: u64) -> Option<u64> {
        let ElementKind::Padding(def) = self.dom.kind(id) else {
            return None;
        };
        let reference = match &def.aligned_to {
            Some(anchor) => try_resolve(self.dom, anchor, id).and_then(|a| self.dom.node(a).begin),
            None => self
                .dom
                .parent(id)
                .and_then(|p| self.dom.node(p).begin)
                .or(Some(0)),
        }?;
        let alignment = u64::from(def.alignment);
        let offset = at.checked_sub(reference)?;
        Some((alignment - offset % alignment) % alignment)
    }

    /// Size known without reading any data and without knowing where the element starts.
    fn static_size(&mut self, id: ElementId) -> Result<Option<u64>, CrackError> {
        if let ElementKind::Number(def) = self.dom.kind(id) {
            return Ok(Some(u64::from(def.size)));
        }
        if let Some(bits) = self.relation_size(id)? {
            return Ok(Some(bits));
        }
        let node = self.dom.node(id);
        if let Some(bits) = declared_bits(&node.kind, node.length) {
            return Ok(Some(bits));
        }
        if node.token {
            let literal = token_literal(node).map_err(|e| self.mismatch(id, e))?;
            return Ok(Some(literal.len()));
        }
        Ok(None)
    }

    fn is_deterministic(&self, id: ElementId) -> bool {
        let node = self.dom.node(id);
        match &node.kind {
            ElementKind::String(def) => {
                def.null_terminated
                    || node.length.is_some_and(|l| l.unit == LengthUnit::Chars)
            }
            ElementKind::Padding(_) => true,
            _ => false,
        }
    }

    pub(super) fn scalar_size(&mut self, id: ElementId) -> Result<ScalarSize, CrackError> {
        if matches!(self.dom.kind(id), ElementKind::Padding(_)) {
            let at = self.cursor.position();
            return self.padding_bits(id, at).map(ScalarSize::Bits).ok_or_else(|| {
                self.failure(FailureKind::Unsized, id, "Alignment anchor has not been cracked.")
            });
        }
        if let Some(bits) = self.static_size(id)? {
            return Ok(ScalarSize::Bits(bits));
        }
        let node = self.dom.node(id);
        if let ElementKind::String(def) = &node.kind {
            if let Some(length) = node.length.filter(|l| l.unit == LengthUnit::Chars) {
                return Ok(ScalarSize::Chars(length.value));
            }
            if def.null_terminated {
                return Ok(ScalarSize::NullTerminated);
            }
        }
        self.lookahead(id).map(ScalarSize::Bits)
    }

    /// Finds the size of an unsized element from what follows it.
    fn lookahead(&mut self, id: ElementId) -> Result<u64, CrackError> {
        let mut pos = 0;
        let mut tokens = Vec::new();
        let outcome = self.scan_following(id, &mut pos, &mut tokens)?;
        let here = self.cursor.position();
        trace!(
            "{}Lookahead for '{}': {outcome:?}, {} tokens, {pos} fixed bits",
            self.indent(),
            self.dom.name(id),
            tokens.len()
        );

        if let Scan::End(target) = outcome {
            return target.checked_sub(here + pos).ok_or_else(|| {
                self.mismatch(
                    id,
                    format!("Following element starts at bit {target}, before bit {}.", here + pos),
                )
            });
        }

        let mut closest: Option<u64> = None;
        for token in &tokens {
            let literal = token_literal(self.dom.node(token.element))
                .map_err(|e| self.mismatch(id, e))?;
            let from = here + token.offset;
            match self.cursor.find(&literal, from) {
                Some(found) => {
                    let size = found - from;
                    closest = Some(closest.map_or(size, |c| c.min(size)));
                    if token.required {
                        break;
                    }
                }
                None if token.required => {
                    return Err(self.mismatch(
                        id,
                        format!("Missing required token '{}'.", self.dom.full_name(token.element)),
                    ));
                }
                None => {}
            }
        }
        if let Some(size) = closest {
            return Ok(size);
        }

        match outcome {
            Scan::Sized => {
                let remaining = self.cursor.remaining_bits_exact();
                remaining.checked_sub(pos).ok_or_else(|| {
                    self.failure(
                        FailureKind::InsufficientData,
                        id,
                        format!("Only {remaining} bits remain but {pos} bits follow."),
                    )
                })
            }
            _ => Err(self.failure(FailureKind::Unsized, id, "Element is unsized.")),
        }
    }

    /// Scans the elements after `id`, climbing out of containers, until the size of `id` is
    /// pinned down or cannot be.
    fn scan_following(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<TokenMark>,
    ) -> Result<Scan, CrackError> {
        let mut current = id;
        loop {
            let mut next = self.dom.next_sibling(current);
            while let Some(sibling) = next {
                match self.scan(sibling, pos, tokens, true)? {
                    Scan::Sized => {}
                    other => return Ok(other),
                }
                next = self.dom.next_sibling(sibling);
            }
            if self.scope_roots.last() == Some(&current) {
                return Ok(Scan::Sized);
            }
            let Some(parent) = self.dom.parent(current) else {
                return Ok(Scan::Sized);
            };
            if self.container_size(parent)?.is_some() {
                return Ok(Scan::Sized);
            }
            if let ElementKind::Sequence(def) = self.dom.kind(parent) {
                let (template, min, max, entries) =
                    (def.template, def.min_occurs, def.max_occurs, def.entries.len() as u64);
                let limit = self.count_from_relation(parent)?.or(max);
                if limit.is_none_or(|limit| entries < limit) {
                    let before = tokens.len();
                    let mut inner = 0;
                    let more_required = entries < min;
                    let scanned = self.scan(template, &mut inner, tokens, more_required)?;
                    for token in &mut tokens[before..] {
                        token.offset += *pos;
                    }
                    if tokens.len() == before {
                        return Ok(if scanned == Scan::Sized { Scan::Unsized } else { scanned });
                    }
                }
            }
            current = parent;
        }
    }

    fn scan(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<TokenMark>,
        required: bool,
    ) -> Result<Scan, CrackError> {
        let node = self.dom.node(id);
        if node.placement == Some(Placement::Absolute) {
            return Ok(Scan::Sized);
        }
        if node.token {
            tokens.push(TokenMark {
                element: id,
                offset: *pos,
                required,
            });
        }
        if let Some(target) = self.offset_target(id)? {
            return Ok(Scan::End(target));
        }

        match self.dom.kind(id).clone() {
            ElementKind::Block(children) => {
                if let Some(bits) = self.container_size(id)? {
                    *pos += bits;
                    return Ok(Scan::Sized);
                }
                for child in children {
                    match self.scan(child, pos, tokens, required)? {
                        Scan::Sized => {}
                        other => return Ok(other),
                    }
                }
                Ok(Scan::Sized)
            }
            ElementKind::Choice(def) => {
                if let Some(bits) = self.container_size(id)? {
                    *pos += bits;
                    return Ok(Scan::Sized);
                }
                let mut common = None;
                for alternative in def.alternatives {
                    let mut size = 0;
                    let mut scratch = Vec::new();
                    if self.scan(alternative, &mut size, &mut scratch, false)? != Scan::Sized
                        || common.is_some_and(|c| c != size)
                    {
                        return Ok(Scan::Unsized);
                    }
                    common = Some(size);
                }
                *pos += common.unwrap_or(0);
                Ok(Scan::Sized)
            }
            ElementKind::Sequence(_) => {
                if let Some(bits) = self.container_size(id)? {
                    *pos += bits;
                    return Ok(Scan::Sized);
                }
                self.scan_array(id, pos, tokens, required)
            }
            _ => match self.static_size(id)? {
                Some(bits) => {
                    *pos += bits;
                    Ok(Scan::Sized)
                }
                None if self.is_deterministic(id) => Ok(Scan::Deterministic),
                None => Ok(Scan::Unsized),
            },
        }
    }

    fn scan_array(
        &mut self,
        id: ElementId,
        pos: &mut u64,
        tokens: &mut Vec<TokenMark>,
        required: bool,
    ) -> Result<Scan, CrackError> {
        let ElementKind::Sequence(def) = self.dom.kind(id) else {
            return Ok(Scan::Unsized);
        };
        let (template, min, max) = (def.template, def.min_occurs, def.max_occurs);
        let fixed = match self.count_from_relation(id)? {
            Some(count) => Some(count),
            None if Some(min) == max => max,
            None => None,
        };
        if fixed == Some(0) {
            return Ok(Scan::Sized);
        }

        let before = tokens.len();
        let mut entry = 0;
        let scanned = self.scan(template, &mut entry, tokens, required && min > 0)?;
        for token in &mut tokens[before..] {
            token.offset += *pos;
        }
        let found_tokens = tokens.len() > before;
        match (scanned, fixed) {
            (Scan::Sized, Some(count)) => {
                *pos += entry * count;
                Ok(Scan::Sized)
            }
            // Entries may or may not follow; keep scanning with the template's tokens as
            // optional stopping points.
            _ if found_tokens => Ok(Scan::Sized),
            (Scan::Sized, None) => Ok(Scan::Unsized),
            _ => Ok(Scan::Deterministic),
        }
    }

    /// True when the element right after `id` is a token whose literal is next in the data.
    pub(super) fn following_token_matches(&mut self, id: ElementId) -> Result<bool, CrackError> {
        let mut current = id;
        loop {
            if let Some(next) = self.dom.next_sibling(current) {
                let node = self.dom.node(next);
                if !node.token {
                    return Ok(false);
                }
                let literal = token_literal(node).map_err(|e| self.mismatch(next, e))?;
                return Ok(self
                    .cursor
                    .peek(literal.len())
                    .is_ok_and(|upcoming| upcoming == literal));
            }
            if self.scope_roots.last() == Some(&current) {
                return Ok(false);
            }
            match self.dom.parent(current) {
                Some(parent) if matches!(self.dom.kind(parent), ElementKind::Block(_)) => {
                    current = parent;
                }
                _ => return Ok(false),
            }
        }
    }
}
