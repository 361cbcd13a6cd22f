//! Serializing a tree back to bits.
//!
//! Rendering is a single left-to-right pass that records every element's span. Relation
//! subjects depend on the spans of their objects, and their own width may shift those spans,
//! so subjects are recomputed and the tree re-rendered until the values settle.

use crate::bits::BitBuf;
use crate::codec::encode_scalar;
use crate::error::GenerateError;
use crate::fixup::FixupValue;
use crate::model::{Dom, ElementId, ElementKind, LengthUnit, RelationKind, Walk};
use crate::resolve::{relation_set, resolve};
use crate::tree::Tree;
use crate::value::Value;
use log::{trace, warn};
use std::collections::HashMap;

const MAX_PASSES: usize = 8;

#[derive(Debug, Clone, Default)]
pub(crate) struct Rendered {
    bits: BitBuf,
    spans: HashMap<ElementId, (u64, u64)>,
    /// Values computed for relation subjects.
    internal: HashMap<ElementId, Value>,
}

impl Tree {
    /// Renders the whole tree. The result is memoized until the tree is mutated.
    pub fn generate(&self) -> Result<BitBuf, GenerateError> {
        self.with_rendered(|r| r.bits.clone())
    }

    pub fn generate_bytes(&self) -> Result<Vec<u8>, GenerateError> {
        Ok(self.generate()?.into_bytes())
    }

    /// Bits one element contributes to the rendered output.
    pub fn value_bits(&self, id: ElementId) -> Result<Option<BitBuf>, GenerateError> {
        self.with_rendered(|r| {
            r.spans
                .get(&id)
                .map(|(begin, end)| r.bits.slice(*begin, end - begin))
        })
    }

    /// Span `[begin, end)` of an element in the rendered output.
    pub fn rendered_span(&self, id: ElementId) -> Result<Option<(u64, u64)>, GenerateError> {
        self.with_rendered(|r| r.spans.get(&id).copied())
    }

    /// The value an element is rendered with: recomputed for relation subjects, the stored
    /// value otherwise.
    pub fn internal_value(&self, id: ElementId) -> Result<Option<Value>, GenerateError> {
        let stored = self.value(id).cloned();
        self.with_rendered(|r| r.internal.get(&id).cloned().or(stored))
    }

    fn with_rendered<T>(&self, f: impl FnOnce(&Rendered) -> T) -> Result<T, GenerateError> {
        if let Some(rendered) = self.rendered.borrow().as_ref() {
            return Ok(f(rendered));
        }
        let fresh = render(&self.dom, self.root)?;
        let out = f(&fresh);
        self.rendered.replace(Some(fresh));
        Ok(out)
    }
}

fn render(dom: &Dom, root: ElementId) -> Result<Rendered, GenerateError> {
    let mut internal = HashMap::new();
    let mut rendered = render_pass(dom, root, &internal)?;
    for pass in 1..=MAX_PASSES {
        let mut next = subject_values(dom, root, &rendered)?;
        fixup_values(dom, root, &rendered, &mut next)?;
        if next == internal {
            trace!("Relations settled after {pass} passes");
            rendered.internal = internal;
            return Ok(rendered);
        }
        internal = next;
        rendered = render_pass(dom, root, &internal)?;
    }
    warn!("Relations did not settle after {MAX_PASSES} passes");
    rendered.internal = internal;
    Ok(rendered)
}

fn render_pass(
    dom: &Dom,
    root: ElementId,
    overrides: &HashMap<ElementId, Value>,
) -> Result<Rendered, GenerateError> {
    let mut renderer = Renderer {
        dom,
        overrides,
        out: BitBuf::new(),
        spans: HashMap::new(),
    };
    renderer.node(root)?;
    Ok(Rendered {
        bits: renderer.out,
        spans: renderer.spans,
        internal: HashMap::new(),
    })
}

struct Renderer<'a> {
    dom: &'a Dom,
    overrides: &'a HashMap<ElementId, Value>,
    out: BitBuf,
    spans: HashMap<ElementId, (u64, u64)>,
}

impl Renderer<'_> {
    fn node(&mut self, id: ElementId) -> Result<(), GenerateError> {
        let dom = self.dom;
        let begin = self.out.len();
        self.spans.insert(id, (begin, begin));
        match dom.kind(id) {
            ElementKind::Block(children) => {
                for child in children {
                    self.node(*child)?;
                }
            }
            ElementKind::Choice(def) => {
                if let Some(alternative) = def.selected.or(def.alternatives.first().copied()) {
                    self.node(alternative)?;
                }
            }
            ElementKind::Sequence(def) => {
                for entry in &def.entries {
                    self.node(*entry)?;
                }
            }
            ElementKind::Padding(def) => {
                let reference = match &def.aligned_to {
                    Some(anchor) => {
                        let anchor = resolve(dom, anchor, id, Walk::Live)?;
                        self.spans.get(&anchor).map_or(0, |(b, _)| *b)
                    }
                    None => dom
                        .parent(id)
                        .and_then(|p| self.spans.get(&p))
                        .map_or(0, |(b, _)| *b),
                };
                let alignment = u64::from(def.alignment);
                let offset = begin.saturating_sub(reference);
                let pad = (alignment - offset % alignment) % alignment;
                match &dom.node(id).value {
                    Some(Value::Bits(cracked)) if cracked.len() == pad => self.out.extend(cracked),
                    _ => self.out.extend(&BitBuf::zeros(pad)),
                }
            }
            _ => {
                let node = dom.node(id);
                let value = self.overrides.get(&id).or(node.value.as_ref());
                let bits = encode_scalar(node, value).map_err(|reason| GenerateError::Encoding {
                    element: dom.full_name(id),
                    reason,
                })?;
                self.out.extend(&bits);
            }
        }
        self.spans.insert(id, (begin, self.out.len()));
        Ok(())
    }
}

fn span(rendered: &Rendered, id: ElementId) -> (u64, u64) {
    rendered.spans.get(&id).copied().unwrap_or((0, 0))
}

fn in_unit(bits: u64, unit: LengthUnit) -> i64 {
    match unit {
        LengthUnit::Bits => bits as i64,
        _ => (bits / 8) as i64,
    }
}

/// Recomputes every relation subject from the spans of the last rendering.
fn subject_values(
    dom: &Dom,
    root: ElementId,
    rendered: &Rendered,
) -> Result<HashMap<ElementId, Value>, GenerateError> {
    let mut values = HashMap::new();
    for subject in dom.preorder(root, Walk::Live) {
        for relation in &dom.node(subject).relations {
            let object = resolve(dom, &relation.of, subject, Walk::Live)?;
            let logical = match relation.kind {
                RelationKind::Size => {
                    let (begin, end) = span(rendered, object);
                    in_unit(end - begin, relation.length_type)
                }
                RelationKind::Count => match dom.kind(object) {
                    ElementKind::Sequence(def) => def.entries.len() as i64,
                    _ => 0,
                },
                RelationKind::Offset => {
                    let target = span(rendered, object).0;
                    let anchor = if !relation.relative {
                        0
                    } else if let Some(name) = &relation.relative_to {
                        span(rendered, resolve(dom, name, subject, Walk::Live)?).0
                    } else {
                        span(rendered, subject).0
                    };
                    let distance = target as i64 - anchor as i64;
                    match relation.length_type {
                        LengthUnit::Bits => distance,
                        _ => distance / 8,
                    }
                }
            };
            let raw = relation_set(relation, logical).map_err(|source| GenerateError::Expression {
                element: dom.full_name(subject),
                source,
            })?;
            values.insert(subject, subject_value(dom, subject, raw)?);
        }
    }
    Ok(values)
}

/// Recomputes every fixup from the bits of the last rendering. A subject inside the region it
/// covers is summed as zeros.
fn fixup_values(
    dom: &Dom,
    root: ElementId,
    rendered: &Rendered,
    values: &mut HashMap<ElementId, Value>,
) -> Result<(), GenerateError> {
    for subject in dom.preorder(root, Walk::Live) {
        let Some(fixup) = &dom.node(subject).fixup else {
            continue;
        };
        let object = resolve(dom, &fixup.of, subject, Walk::Live)?;
        let (begin, end) = span(rendered, object);
        let own = span(rendered, subject);
        let inside = own.0 < own.1 && begin <= own.0 && own.1 <= end;
        let region = if inside {
            let mut region = rendered.bits.slice(begin, own.0 - begin);
            region.extend(&BitBuf::zeros(own.1 - own.0));
            region.extend(&rendered.bits.slice(own.1, end - own.1));
            region
        } else {
            rendered.bits.slice(begin, end - begin)
        };
        let offset = inside.then(|| ((own.0 - begin) / 8) as usize);
        let value = match fixup.kind.compute(region.as_bytes(), offset) {
            FixupValue::Number(sum) => Value::UInt(sum),
            FixupValue::Digest(digest) => Value::Bits(BitBuf::from_vec(digest)),
        };
        trace!("Fixup {} = {value}", dom.full_name(subject));
        values.insert(subject, value);
    }
    Ok(())
}

fn subject_value(dom: &Dom, subject: ElementId, raw: i64) -> Result<Value, GenerateError> {
    let node = dom.node(subject);
    match &node.kind {
        ElementKind::Number(def) if !def.signed && raw >= 0 => Ok(Value::UInt(raw as u64)),
        ElementKind::Number(_) => Ok(Value::Int(raw)),
        ElementKind::String(_) => {
            let width = match node.length {
                Some(length) if length.unit != LengthUnit::Bits => length.value as usize,
                Some(length) => (length.value / 8) as usize,
                None => 0,
            };
            Ok(Value::Str(format!("{raw:0>width$}")))
        }
        other => Err(GenerateError::Encoding {
            element: dom.full_name(subject),
            reason: format!("{} cannot carry a relation value", other.type_name()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crack::Cracker;
    use crate::fixup::{Fixup, FixupKind};
    use crate::model::Relation;
    use crate::schema::{ElementDef, Schema};

    fn tlv() -> Schema {
        Schema::build(vec![
            ElementDef::block("Tlv")
                .child(ElementDef::number("tag", 8).value(7))
                .child(
                    ElementDef::number("len", 16)
                        .big_endian()
                        .relation(Relation::size_of("data")),
                )
                .child(ElementDef::blob("data").hex_value("aabbcc")),
        ])
        .unwrap()
    }

    #[test]
    fn size_relation_is_recomputed_from_rendered_object() {
        let mut tree = Tree::with_defaults(&tlv(), "Tlv").unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), vec![7, 0, 3, 0xaa, 0xbb, 0xcc]);

        let data = tree.find("Tlv.data").unwrap();
        tree.set_value(data, Value::Bits(BitBuf::from_bytes(&[1, 2, 3, 4, 5])));
        assert_eq!(tree.generate_bytes().unwrap(), vec![7, 0, 5, 1, 2, 3, 4, 5]);
        let len = tree.find("Tlv.len").unwrap();
        assert_eq!(tree.internal_value(len).unwrap(), Some(Value::UInt(5)));
    }

    #[test]
    fn rendering_is_memoized_until_mutation() {
        let mut tree = Tree::with_defaults(&tlv(), "Tlv").unwrap();
        let first = tree.generate().unwrap();
        assert!(tree.rendered.borrow().is_some(), "generate must memoize");
        let tag = tree.find("Tlv.tag").unwrap();
        tree.set_value(tag, Value::UInt(9));
        assert!(tree.rendered.borrow().is_none(), "set_value must drop the memo");
        let second = tree.generate().unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn padding_aligns_relative_to_parent() {
        let schema = Schema::build(vec![
            ElementDef::block("P")
                .child(ElementDef::number("a", 8).value(1))
                .child(ElementDef::padding("pad", 32))
                .child(ElementDef::number("b", 8).value(2)),
        ])
        .unwrap();
        let tree = Tree::with_defaults(&schema, "P").unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), vec![1, 0, 0, 0, 2]);
    }

    #[test]
    fn numeric_string_subjects_are_zero_padded() {
        let schema = Schema::build(vec![
            ElementDef::block("S")
                .child(ElementDef::string("len").length(3).relation(Relation::size_of("body")))
                .child(ElementDef::string("body").value("hello")),
        ])
        .unwrap();
        let tree = Tree::with_defaults(&schema, "S").unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), b"005hello".to_vec());
    }

    #[test]
    fn count_and_offset_relations_follow_the_layout() {
        let schema = Schema::build(vec![
            ElementDef::block("M")
                .child(ElementDef::number("count", 8).relation(Relation::count_of("items")))
                .child(ElementDef::number("where", 8).relation(Relation::offset_of("tail")))
                .child(ElementDef::number("items", 8).value(0xee).occurs(2))
                .child(ElementDef::number("tail", 8).value(0xff)),
        ])
        .unwrap();
        let tree = Tree::with_defaults(&schema, "M").unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), vec![2, 4, 0xee, 0xee, 0xff]);
    }

    #[test]
    fn crc_is_recomputed_after_the_data_changes() {
        let schema = Schema::build(vec![
            ElementDef::block("F")
                .child(ElementDef::blob("data").hex_value("313233343536373839"))
                .child(
                    ElementDef::number("crc", 32)
                        .big_endian()
                        .fixup(Fixup::new(FixupKind::Crc32, "data")),
                ),
        ])
        .unwrap();
        let mut tree = Tree::with_defaults(&schema, "F").unwrap();
        let bytes = tree.generate_bytes().unwrap();
        assert_eq!(bytes[9..], [0xcb, 0xf4, 0x39, 0x26]);

        let data = tree.find("F.data").unwrap();
        tree.set_value(data, Value::Bits(BitBuf::new()));
        assert_eq!(tree.generate_bytes().unwrap(), vec![0, 0, 0, 0]);
    }

    #[test]
    fn checksum_inside_its_region_is_summed_as_zero() {
        let schema = Schema::build(vec![
            ElementDef::block("Ip").child(
                ElementDef::block("header")
                    .child(ElementDef::number("a", 16).big_endian().value(0x4500))
                    .child(
                        ElementDef::number("sum", 16)
                            .big_endian()
                            .value(0xffff)
                            .fixup(Fixup::new(FixupKind::Internet, "header")),
                    )
                    .child(ElementDef::number("b", 16).big_endian().value(0x0073)),
            ),
        ])
        .unwrap();
        let tree = Tree::with_defaults(&schema, "Ip").unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), vec![0x45, 0, 0xba, 0x8c, 0, 0x73]);
    }

    #[test]
    fn cracked_checksum_is_corrected_on_generation() {
        let schema = Schema::build(vec![
            ElementDef::block("S")
                .child(ElementDef::blob("body").length(3))
                .child(ElementDef::number("sum", 8).fixup(Fixup::new(FixupKind::Sum8, "body"))),
        ])
        .unwrap();
        let tree = Cracker::default().crack_bytes(&schema, "S", &[1, 2, 3, 0x99]).unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), vec![1, 2, 3, 6]);
    }

    #[test]
    fn cracked_padding_bits_are_kept() {
        let schema = Schema::build(vec![
            ElementDef::block("P")
                .child(ElementDef::number("a", 8))
                .child(ElementDef::padding("pad", 32))
                .child(ElementDef::number("b", 8)),
        ])
        .unwrap();
        let data = [1, 0xde, 0xad, 0xbe, 2];
        let tree = Cracker::default().crack_bytes(&schema, "P", &data).unwrap();
        assert_eq!(tree.generate_bytes().unwrap(), data.to_vec());
    }
}
