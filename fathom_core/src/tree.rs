//! A cracked (or default-populated) instance of one data model.

use crate::error::SchemaError;
use crate::generate::Rendered;
use crate::model::{Dom, ElementId, ElementKind, Relation, Walk};
use crate::resolve::try_resolve;
use crate::schema::Schema;
use crate::value::Value;
use log::debug;
use std::cell::RefCell;

/// Owns the element arena of one instance. The rendered bit string is memoized and dropped
/// on every mutation, so a tree is cheap to generate repeatedly but is not `Sync`.
#[derive(Debug, Clone)]
pub struct Tree {
    pub(crate) dom: Dom,
    pub(crate) root: ElementId,
    pub(crate) rendered: RefCell<Option<Rendered>>,
}

impl Tree {
    /// The model as declared: choices unselected, sequences empty. This is what the cracker
    /// fills in.
    pub fn empty(schema: &Schema, model: &str) -> Result<Self, SchemaError> {
        let source = schema.model(model)?;
        let mut dom = Dom::new();
        let root = dom.import(schema.dom(), source, None);
        Ok(Self {
            dom,
            root,
            rendered: RefCell::new(None),
        })
    }

    /// The model with every choice set to its first alternative and every sequence expanded
    /// to its generation count. Suitable for generating without any input.
    pub fn with_defaults(schema: &Schema, model: &str) -> Result<Self, SchemaError> {
        let mut tree = Self::empty(schema, model)?;
        let root = tree.root;
        tree.expand_defaults(root);
        Ok(tree)
    }

    fn expand_defaults(&mut self, id: ElementId) {
        match self.dom.kind(id).clone() {
            ElementKind::Block(children) => {
                for child in children {
                    self.expand_defaults(child);
                }
            }
            ElementKind::Choice(def) => {
                let Some(first) = def.alternatives.first().copied() else {
                    return;
                };
                let clone = self.dom.instantiate(first, id);
                if let ElementKind::Choice(def) = &mut self.dom.node_mut(id).kind {
                    def.selected = Some(clone);
                }
                self.expand_defaults(clone);
            }
            ElementKind::Sequence(def) => {
                let base = self.dom.name(id).to_string();
                for index in 0..def.occurs {
                    let entry = self.dom.instantiate(def.template, id);
                    self.dom.node_mut(entry).name = format!("{base}_{index}");
                    if let ElementKind::Sequence(seq) = &mut self.dom.node_mut(id).kind {
                        seq.entries.push(entry);
                    }
                    self.expand_defaults(entry);
                }
            }
            _ => {}
        }
    }

    pub fn root(&self) -> ElementId {
        self.root
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    /// Mutable access to the arena. Drops the rendered memo.
    pub(crate) fn dom_mut(&mut self) -> &mut Dom {
        self.invalidate();
        &mut self.dom
    }

    /// Looks up an element by its full dotted name, starting with the model name.
    pub fn find(&self, path: &str) -> Option<ElementId> {
        let mut segments = path.split('.');
        if segments.next()? != self.dom.name(self.root) {
            return None;
        }
        segments.try_fold(self.root, |current, segment| {
            self.dom.child_named(current, segment, Walk::Live)
        })
    }

    pub fn name(&self, id: ElementId) -> &str {
        self.dom.name(id)
    }

    pub fn full_name(&self, id: ElementId) -> String {
        self.dom.full_name(id)
    }

    pub fn kind(&self, id: ElementId) -> &ElementKind {
        self.dom.kind(id)
    }

    /// Live children: block members, the selected alternative or the cracked entries.
    pub fn children(&self, id: ElementId) -> &[ElementId] {
        self.dom.children(id, Walk::Live)
    }

    /// Default or cracked value of a scalar. Relation subjects are recomputed when
    /// generating; see [`Tree::internal_value`].
    pub fn value(&self, id: ElementId) -> Option<&Value> {
        self.dom.node(id).value.as_ref()
    }

    pub fn set_value(&mut self, id: ElementId, value: Value) {
        self.dom_mut().node_mut(id).value = Some(value);
    }

    /// Bit span `[begin, end)` the element occupied in the cracked input.
    pub fn span(&self, id: ElementId) -> Option<(u64, u64)> {
        let node = self.dom.node(id);
        Some((node.begin?, node.end?))
    }

    pub fn relations(&self, id: ElementId) -> &[Relation] {
        &self.dom.node(id).relations
    }

    pub fn selected(&self, id: ElementId) -> Option<ElementId> {
        match self.dom.kind(id) {
            ElementKind::Choice(def) => def.selected,
            _ => None,
        }
    }

    pub fn entries(&self, id: ElementId) -> &[ElementId] {
        match self.dom.kind(id) {
            ElementKind::Sequence(def) => &def.entries,
            _ => &[],
        }
    }

    /// Every element reachable through the live tree, in document order.
    pub fn elements(&self) -> Vec<ElementId> {
        self.dom.preorder(self.root, Walk::Live)
    }

    pub fn invalidate(&self) {
        self.rendered.replace(None);
    }

    /// Drops relations whose object is not part of the live tree, such as those naming an
    /// element inside an alternative that was not selected.
    pub(crate) fn prune_unbound_relations(&mut self) {
        for id in self.elements() {
            let relations = std::mem::take(&mut self.dom.node_mut(id).relations);
            let kept: Vec<Relation> = relations
                .into_iter()
                .filter(|rel| {
                    let bound = try_resolve(&self.dom, &rel.of, id).is_some();
                    if !bound {
                        let subject = self.dom.full_name(id);
                        debug!("Dropping {:?} relation of '{}' on '{subject}'", rel.kind, rel.of);
                    }
                    bound
                })
                .collect();
            self.dom.node_mut(id).relations = kept;
        }
        self.invalidate();
    }
}
