//! The element arena shared by schema templates and cracked trees.
//!
//! Every element lives in a [`Dom`] and is addressed by a stable [`ElementId`]. Containers
//! refer to their children by id. Choice alternatives and Sequence templates are *detached*
//! nodes: they point at their container as parent but are only reachable through the live
//! tree once cloned in as a selection or an entry.

use crate::encoding::StringEncoding;
use crate::fixup::Fixup;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(u32);

impl ElementId {
    pub fn index(self) -> usize {
        self.0 as usize
    }

    /// Stand-in for a child that is allocated after its parent.
    pub(crate) fn placeholder() -> ElementId {
        ElementId(u32::MAX)
    }
}

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Endian {
    #[default]
    Little,
    Big,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LengthUnit {
    Bits,
    #[default]
    Bytes,
    Chars,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Length {
    pub value: u64,
    pub unit: LengthUnit,
}

impl Length {
    pub fn bits(value: u64) -> Self {
        Self {
            value,
            unit: LengthUnit::Bits,
        }
    }

    pub fn bytes(value: u64) -> Self {
        Self {
            value,
            unit: LengthUnit::Bytes,
        }
    }

    pub fn chars(value: u64) -> Self {
        Self {
            value,
            unit: LengthUnit::Chars,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RelationKind {
    Size,
    Count,
    Offset,
}

impl RelationKind {
    /// Name under which the measured quantity is exposed to relation expressions.
    pub fn variable(self) -> &'static str {
        match self {
            RelationKind::Size => "size",
            RelationKind::Count => "count",
            RelationKind::Offset => "offset",
        }
    }
}

/// A size, count or offset binding. The element holding it is the subject; `of` names the
/// object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Relation {
    pub kind: RelationKind,
    pub of: String,
    /// Unit of a size relation's value. Only bits and bytes are meaningful.
    #[serde(default)]
    pub length_type: LengthUnit,
    #[serde(default)]
    pub relative: bool,
    #[serde(default)]
    pub relative_to: Option<String>,
    #[serde(default)]
    pub expression_get: Option<String>,
    #[serde(default)]
    pub expression_set: Option<String>,
}

impl Relation {
    fn new(kind: RelationKind, of: &str) -> Self {
        Self {
            kind,
            of: of.to_string(),
            length_type: LengthUnit::Bytes,
            relative: false,
            relative_to: None,
            expression_get: None,
            expression_set: None,
        }
    }

    pub fn size_of(of: &str) -> Self {
        Self::new(RelationKind::Size, of)
    }

    pub fn count_of(of: &str) -> Self {
        Self::new(RelationKind::Count, of)
    }

    pub fn offset_of(of: &str) -> Self {
        Self::new(RelationKind::Offset, of)
    }

    pub fn in_bits(mut self) -> Self {
        self.length_type = LengthUnit::Bits;
        self
    }

    pub fn relative(mut self) -> Self {
        self.relative = true;
        self
    }

    pub fn relative_to(mut self, anchor: &str) -> Self {
        self.relative = true;
        self.relative_to = Some(anchor.to_string());
        self
    }

    pub fn expressions(mut self, get: &str, set: &str) -> Self {
        self.expression_get = Some(get.to_string());
        self.expression_set = Some(set.to_string());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Placement {
    Before(String),
    After(String),
    Absolute,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumberDef {
    pub size: u32,
    pub signed: bool,
    pub endian: Endian,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringDef {
    pub encoding: StringEncoding,
    pub null_terminated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddingDef {
    pub alignment: u32,
    pub aligned_to: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceDef {
    pub alternatives: Vec<ElementId>,
    pub selected: Option<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceDef {
    pub template: ElementId,
    pub min_occurs: u64,
    pub max_occurs: Option<u64>,
    /// Number of entries produced when generating from an uncracked template.
    pub occurs: u64,
    pub entries: Vec<ElementId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    Number(NumberDef),
    String(StringDef),
    Blob,
    Padding(PaddingDef),
    Block(Vec<ElementId>),
    Choice(ChoiceDef),
    Sequence(SequenceDef),
}

impl ElementKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            ElementKind::Number(_) => "Number",
            ElementKind::String(_) => "String",
            ElementKind::Blob => "Blob",
            ElementKind::Padding(_) => "Padding",
            ElementKind::Block(_) => "Block",
            ElementKind::Choice(_) => "Choice",
            ElementKind::Sequence(_) => "Array",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(
            self,
            ElementKind::Block(_) | ElementKind::Choice(_) | ElementKind::Sequence(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub parent: Option<ElementId>,
    /// The schema element this node was cloned from.
    pub origin: ElementId,
    pub kind: ElementKind,
    pub length: Option<Length>,
    pub token: bool,
    /// Declared default, replaced by the cracked value.
    pub value: Option<Value>,
    pub relations: Vec<Relation>,
    pub fixup: Option<Fixup>,
    pub placement: Option<Placement>,
    pub constraint: Option<String>,
    pub begin: Option<u64>,
    pub end: Option<u64>,
}

impl Node {
    pub fn new(name: &str, kind: ElementKind) -> Self {
        Self {
            name: name.to_string(),
            parent: None,
            origin: ElementId(0),
            kind,
            length: None,
            token: false,
            value: None,
            relations: Vec::new(),
            fixup: None,
            placement: None,
            constraint: None,
            begin: None,
            end: None,
        }
    }
}

/// Which children a walk follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Walk {
    /// Block children, the selected alternative and the cracked entries.
    Live,
    /// Block children, every alternative and the sequence template.
    Template,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dom {
    nodes: Vec<Node>,
}

impl Dom {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alloc(&mut self, node: Node) -> ElementId {
        let id = ElementId(self.nodes.len() as u32);
        self.nodes.push(node);
        id
    }

    /// Drops every node allocated at or after `len`.
    pub fn truncate(&mut self, len: usize) {
        self.nodes.truncate(len);
    }

    pub fn contains(&self, id: ElementId) -> bool {
        id.index() < self.nodes.len()
    }

    pub fn node(&self, id: ElementId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: ElementId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    pub fn name(&self, id: ElementId) -> &str {
        &self.node(id).name
    }

    pub fn kind(&self, id: ElementId) -> &ElementKind {
        &self.node(id).kind
    }

    pub fn parent(&self, id: ElementId) -> Option<ElementId> {
        self.node(id).parent
    }

    pub fn children(&self, id: ElementId, walk: Walk) -> &[ElementId] {
        match (&self.node(id).kind, walk) {
            (ElementKind::Block(children), _) => children,
            (ElementKind::Choice(def), Walk::Live) => match &def.selected {
                Some(selected) => std::slice::from_ref(selected),
                None => &[],
            },
            (ElementKind::Choice(def), Walk::Template) => &def.alternatives,
            (ElementKind::Sequence(def), Walk::Live) => &def.entries,
            (ElementKind::Sequence(def), Walk::Template) => std::slice::from_ref(&def.template),
            _ => &[],
        }
    }

    pub fn child_named(&self, id: ElementId, name: &str, walk: Walk) -> Option<ElementId> {
        self.children(id, walk)
            .iter()
            .copied()
            .find(|c| self.name(*c) == name)
    }

    pub fn ancestors(&self, id: ElementId) -> impl Iterator<Item = ElementId> + '_ {
        std::iter::successors(self.parent(id), |p| self.parent(*p))
    }

    pub fn root_of(&self, id: ElementId) -> ElementId {
        self.ancestors(id).last().unwrap_or(id)
    }

    /// True when `ancestor` is `id` or one of its ancestors.
    pub fn contains_in_subtree(&self, ancestor: ElementId, id: ElementId) -> bool {
        id == ancestor || self.ancestors(id).any(|a| a == ancestor)
    }

    pub fn full_name(&self, id: ElementId) -> String {
        let mut names: Vec<&str> = self.ancestors(id).map(|a| self.name(a)).collect();
        names.reverse();
        names.push(self.name(id));
        names.join(".")
    }

    pub fn preorder(&self, id: ElementId, walk: Walk) -> Vec<ElementId> {
        let mut out = Vec::new();
        let mut stack = vec![id];
        while let Some(next) = stack.pop() {
            out.push(next);
            stack.extend(self.children(next, walk).iter().rev());
        }
        out
    }

    pub fn index_in_parent(&self, id: ElementId, walk: Walk) -> Option<usize> {
        let parent = self.parent(id)?;
        self.children(parent, walk).iter().position(|c| *c == id)
    }

    pub fn next_sibling(&self, id: ElementId) -> Option<ElementId> {
        let parent = self.parent(id)?;
        let siblings = self.children(parent, Walk::Live);
        let index = siblings.iter().position(|c| *c == id)?;
        siblings.get(index + 1).copied()
    }

    /// Copies the template structure under `id` out of this arena. The first node is the
    /// subtree root; ids inside the copy are local indices.
    fn extract(&self, id: ElementId) -> Vec<Node> {
        let order = self.preorder(id, Walk::Template);
        let local: HashMap<ElementId, ElementId> = order
            .iter()
            .enumerate()
            .map(|(i, src)| (*src, ElementId(i as u32)))
            .collect();
        let map = |src: &ElementId| local[src];
        order
            .iter()
            .map(|src| {
                let mut node = self.node(*src).clone();
                node.parent = node.parent.and_then(|p| local.get(&p).copied());
                node.begin = None;
                node.end = None;
                match &mut node.kind {
                    ElementKind::Block(children) => {
                        *children = children.iter().map(map).collect();
                    }
                    ElementKind::Choice(def) => {
                        def.alternatives = def.alternatives.iter().map(map).collect();
                        def.selected = None;
                    }
                    ElementKind::Sequence(def) => {
                        def.template = map(&def.template);
                        def.entries.clear();
                    }
                    _ => {}
                }
                node
            })
            .collect()
    }

    fn graft_nodes(&mut self, nodes: Vec<Node>, parent: Option<ElementId>) -> ElementId {
        let base = self.nodes.len() as u32;
        let shift = |id: ElementId| ElementId(id.0 + base);
        for (i, mut node) in nodes.into_iter().enumerate() {
            node.parent = if i == 0 {
                parent
            } else {
                node.parent.map(shift)
            };
            match &mut node.kind {
                ElementKind::Block(children) => {
                    children.iter_mut().for_each(|c| *c = shift(*c));
                }
                ElementKind::Choice(def) => {
                    def.alternatives.iter_mut().for_each(|c| *c = shift(*c));
                }
                ElementKind::Sequence(def) => def.template = shift(def.template),
                _ => {}
            }
            self.nodes.push(node);
        }
        ElementId(base)
    }

    /// Deep-copies the template structure rooted at `id` in `src` into this arena under
    /// `parent`. Choices come over unselected and sequences empty.
    pub fn import(&mut self, src: &Dom, id: ElementId, parent: Option<ElementId>) -> ElementId {
        let nodes = src.extract(id);
        self.graft_nodes(nodes, parent)
    }

    /// Clones a detached template that lives in this arena.
    pub fn instantiate(&mut self, template: ElementId, parent: ElementId) -> ElementId {
        let nodes = self.extract(template);
        self.graft_nodes(nodes, Some(parent))
    }

    /// Marks every node as its own origin. Used once when a schema arena is finished.
    pub(crate) fn stamp_origins(&mut self) {
        for (i, node) in self.nodes.iter_mut().enumerate() {
            node.origin = ElementId(i as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn number(name: &str) -> Node {
        Node::new(
            name,
            ElementKind::Number(NumberDef {
                size: 8,
                signed: false,
                endian: Endian::Little,
            }),
        )
    }

    fn sample() -> (Dom, ElementId) {
        let mut dom = Dom::new();
        let root = dom.alloc(Node::new("Root", ElementKind::Block(Vec::new())));
        let len = dom.alloc(number("len"));
        let alt = dom.alloc(number("alt"));
        let choice = dom.alloc(Node::new(
            "pick",
            ElementKind::Choice(ChoiceDef {
                alternatives: vec![alt],
                selected: None,
            }),
        ));
        dom.node_mut(len).parent = Some(root);
        dom.node_mut(choice).parent = Some(root);
        dom.node_mut(alt).parent = Some(choice);
        dom.node_mut(root).kind = ElementKind::Block(vec![len, choice]);
        dom.stamp_origins();
        (dom, root)
    }

    #[test]
    fn live_and_template_walks_differ_for_choices() {
        let (dom, root) = sample();
        assert_eq!(dom.preorder(root, Walk::Live).len(), 3);
        assert_eq!(dom.preorder(root, Walk::Template).len(), 4);
        let alt = ElementId(2);
        assert_eq!(dom.full_name(alt), "Root.pick.alt");
        assert_eq!(dom.next_sibling(ElementId(1)), Some(ElementId(3)));
    }

    #[test]
    fn import_copies_structure_and_keeps_origins() {
        let (schema, root) = sample();
        let mut tree = Dom::new();
        let copy = tree.import(&schema, root, None);
        assert_eq!(tree.len(), 4);
        assert_eq!(tree.full_name(ElementId(3)), "Root.pick.alt");
        assert_eq!(tree.node(copy).parent, None);
        let origins: Vec<_> = (0..4).map(|i| tree.node(ElementId(i)).origin).collect();
        assert_eq!(
            origins,
            vec![ElementId(0), ElementId(1), ElementId(3), ElementId(2)],
            "preorder copy must remember where each node came from"
        );
    }

    #[test]
    fn instantiate_then_truncate_rolls_back() {
        let (mut dom, _) = sample();
        let choice = ElementId(3);
        let checkpoint = dom.len();
        let clone = dom.instantiate(ElementId(2), choice);
        assert_eq!(dom.parent(clone), Some(choice));
        assert_eq!(dom.name(clone), "alt");
        dom.truncate(checkpoint);
        assert_eq!(dom.len(), checkpoint);
    }
}
