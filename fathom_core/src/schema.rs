//! Schema templates: the serde-facing element definitions, their lowering into an immutable
//! arena, and build-time validation.

use crate::bits::BitBuf;
use crate::encoding::StringEncoding;
use crate::error::SchemaError;
use crate::fixup::Fixup;
use crate::model::{
    ChoiceDef, Dom, ElementId, ElementKind, Endian, Length, LengthUnit, Node, NumberDef,
    PaddingDef, Placement, Relation, RelationKind, SequenceDef, StringDef, Walk,
};
use crate::resolve::resolve;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefValue {
    Int(i64),
    Text(String),
}

impl From<i64> for DefValue {
    fn from(v: i64) -> Self {
        DefValue::Int(v)
    }
}

impl From<i32> for DefValue {
    fn from(v: i32) -> Self {
        DefValue::Int(i64::from(v))
    }
}

impl From<&str> for DefValue {
    fn from(s: &str) -> Self {
        DefValue::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ValueType {
    #[default]
    String,
    Hex,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum DefKind {
    Number {
        size: u32,
        #[serde(default)]
        signed: bool,
        #[serde(default)]
        endian: Endian,
    },
    #[serde(rename_all = "kebab-case")]
    String {
        #[serde(default)]
        encoding: StringEncoding,
        #[serde(default)]
        null_terminated: bool,
    },
    Blob,
    #[serde(rename_all = "kebab-case")]
    Padding {
        alignment: u32,
        #[serde(default)]
        aligned_to: Option<String>,
    },
    Block {
        #[serde(default)]
        children: Vec<ElementDef>,
    },
    Choice {
        #[serde(default)]
        alternatives: Vec<ElementDef>,
    },
    Sequence {
        template: Box<ElementDef>,
    },
    /// Expands to a copy of the named model.
    Ref {
        model: String,
    },
}

/// One element of a schema document, as written by a front-end.
///
/// Elements carrying `occurs`, `min-occurs` or `max-occurs` are wrapped in a Sequence of the
/// same name when the schema is built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ElementDef {
    pub name: String,
    #[serde(flatten)]
    pub kind: DefKind,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub length_type: LengthUnit,
    #[serde(default)]
    pub token: bool,
    #[serde(default)]
    pub value: Option<DefValue>,
    #[serde(default)]
    pub value_type: ValueType,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub fixup: Option<Fixup>,
    #[serde(default)]
    pub placement: Option<Placement>,
    #[serde(default)]
    pub constraint: Option<String>,
    #[serde(default)]
    pub occurs: Option<u64>,
    #[serde(default)]
    pub min_occurs: Option<u64>,
    #[serde(default)]
    pub max_occurs: Option<u64>,
}

impl ElementDef {
    pub fn new(name: &str, kind: DefKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            length: None,
            length_type: LengthUnit::Bytes,
            token: false,
            value: None,
            value_type: ValueType::String,
            relations: Vec::new(),
            fixup: None,
            placement: None,
            constraint: None,
            occurs: None,
            min_occurs: None,
            max_occurs: None,
        }
    }

    pub fn number(name: &str, size: u32) -> Self {
        Self::new(
            name,
            DefKind::Number {
                size,
                signed: false,
                endian: Endian::Little,
            },
        )
    }

    pub fn string(name: &str) -> Self {
        Self::new(
            name,
            DefKind::String {
                encoding: StringEncoding::default(),
                null_terminated: false,
            },
        )
    }

    pub fn blob(name: &str) -> Self {
        Self::new(name, DefKind::Blob)
    }

    pub fn padding(name: &str, alignment: u32) -> Self {
        Self::new(
            name,
            DefKind::Padding {
                alignment,
                aligned_to: None,
            },
        )
    }

    pub fn block(name: &str) -> Self {
        Self::new(
            name,
            DefKind::Block {
                children: Vec::new(),
            },
        )
    }

    pub fn choice(name: &str) -> Self {
        Self::new(
            name,
            DefKind::Choice {
                alternatives: Vec::new(),
            },
        )
    }

    pub fn sequence(name: &str, template: ElementDef) -> Self {
        Self::new(
            name,
            DefKind::Sequence {
                template: Box::new(template),
            },
        )
    }

    pub fn reference(name: &str, model: &str) -> Self {
        Self::new(
            name,
            DefKind::Ref {
                model: model.to_string(),
            },
        )
    }

    pub fn signed(mut self) -> Self {
        if let DefKind::Number { signed, .. } = &mut self.kind {
            *signed = true;
        }
        self
    }

    pub fn big_endian(mut self) -> Self {
        if let DefKind::Number { endian, .. } = &mut self.kind {
            *endian = Endian::Big;
        }
        self
    }

    pub fn encoding(mut self, value: StringEncoding) -> Self {
        if let DefKind::String { encoding, .. } = &mut self.kind {
            *encoding = value;
        }
        self
    }

    pub fn null_terminated(mut self) -> Self {
        if let DefKind::String {
            null_terminated, ..
        } = &mut self.kind
        {
            *null_terminated = true;
        }
        self
    }

    pub fn aligned_to(mut self, anchor: &str) -> Self {
        if let DefKind::Padding { aligned_to, .. } = &mut self.kind {
            *aligned_to = Some(anchor.to_string());
        }
        self
    }

    pub fn child(mut self, child: ElementDef) -> Self {
        match &mut self.kind {
            DefKind::Block { children } => children.push(child),
            DefKind::Choice { alternatives } => alternatives.push(child),
            _ => {}
        }
        self
    }

    pub fn length(mut self, bytes: u64) -> Self {
        self.length = Some(bytes);
        self.length_type = LengthUnit::Bytes;
        self
    }

    pub fn length_bits(mut self, bits: u64) -> Self {
        self.length = Some(bits);
        self.length_type = LengthUnit::Bits;
        self
    }

    pub fn length_chars(mut self, chars: u64) -> Self {
        self.length = Some(chars);
        self.length_type = LengthUnit::Chars;
        self
    }

    pub fn value(mut self, value: impl Into<DefValue>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn hex_value(mut self, hex: &str) -> Self {
        self.value = Some(DefValue::Text(hex.to_string()));
        self.value_type = ValueType::Hex;
        self
    }

    pub fn token(mut self) -> Self {
        self.token = true;
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn fixup(mut self, fixup: Fixup) -> Self {
        self.fixup = Some(fixup);
        self
    }

    pub fn before(mut self, anchor: &str) -> Self {
        self.placement = Some(Placement::Before(anchor.to_string()));
        self
    }

    pub fn after(mut self, anchor: &str) -> Self {
        self.placement = Some(Placement::After(anchor.to_string()));
        self
    }

    pub fn absolute(mut self) -> Self {
        self.placement = Some(Placement::Absolute);
        self
    }

    pub fn constraint(mut self, expression: &str) -> Self {
        self.constraint = Some(expression.to_string());
        self
    }

    pub fn occurs(mut self, count: u64) -> Self {
        self.occurs = Some(count);
        self
    }

    pub fn min_occurs(mut self, count: u64) -> Self {
        self.min_occurs = Some(count);
        self
    }

    pub fn max_occurs(mut self, count: u64) -> Self {
        self.max_occurs = Some(count);
        self
    }

    fn is_repeated(&self) -> bool {
        self.occurs.is_some() || self.min_occurs.is_some() || self.max_occurs.is_some()
    }
}

/// A set of named models, as loaded from TOML or JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaDocument {
    #[serde(rename = "model", default)]
    pub models: Vec<ElementDef>,
}

impl SchemaDocument {
    pub fn from_toml_str(content: &str) -> Result<Self, SchemaError> {
        toml::from_str(content).map_err(|e| SchemaError::Document(e.to_string()))
    }

    pub fn from_json_str(content: &str) -> Result<Self, SchemaError> {
        serde_json::from_str(content).map_err(|e| SchemaError::Document(e.to_string()))
    }

    /// Loads a document, choosing JSON for `.json` files and TOML otherwise.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read schema file at {:?}: {}", path, e))?;
        let is_json = path.extension().is_some_and(|ext| ext == "json");
        let document = if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_toml_str(&content)
        };
        document.map_err(|e| anyhow::anyhow!("Failed to parse schema file {:?}: {}", path, e))
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        Schema::build(self.models)
    }
}

/// An immutable forest of model templates. Share it behind an `Arc` to crack on several
/// threads at once.
#[derive(Debug, Clone)]
pub struct Schema {
    id: u64,
    dom: Dom,
    models: Vec<(String, ElementId)>,
}

static NEXT_SCHEMA_ID: AtomicU64 = AtomicU64::new(1);

impl Schema {
    pub fn build(models: Vec<ElementDef>) -> Result<Self, SchemaError> {
        let definitions: HashMap<String, ElementDef> = models
            .iter()
            .map(|m| (m.name.clone(), m.clone()))
            .collect();
        let mut lowering = Lowering {
            dom: Dom::new(),
            definitions: &definitions,
            expanding: Vec::new(),
        };
        let mut roots = Vec::new();
        for model in &models {
            if roots.iter().any(|(name, _)| name == &model.name) {
                return Err(SchemaError::DuplicateName {
                    parent: "<schema>".to_string(),
                    name: model.name.clone(),
                });
            }
            lowering.expanding.push(model.name.clone());
            let root = lowering.lower(model, None)?;
            lowering.expanding.pop();
            if !matches!(lowering.dom.kind(root), ElementKind::Block(_)) {
                return Err(invalid(&lowering.dom, root, "a data model must be a block"));
            }
            roots.push((model.name.clone(), root));
        }
        let mut dom = lowering.dom;
        dom.stamp_origins();
        for (_, root) in &roots {
            validate(&dom, *root)?;
        }
        Ok(Self {
            id: NEXT_SCHEMA_ID.fetch_add(1, Ordering::Relaxed),
            dom,
            models: roots,
        })
    }

    /// Process-unique identity, used to keep choice-cache entries of different schemas apart.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dom(&self) -> &Dom {
        &self.dom
    }

    pub fn model(&self, name: &str) -> Result<ElementId, SchemaError> {
        self.models
            .iter()
            .find(|(model, _)| model == name)
            .map(|(_, id)| *id)
            .ok_or_else(|| SchemaError::UnknownModel(name.to_string()))
    }

    pub fn model_names(&self) -> impl Iterator<Item = &str> {
        self.models.iter().map(|(name, _)| name.as_str())
    }
}

fn invalid(dom: &Dom, id: ElementId, reason: &str) -> SchemaError {
    SchemaError::Invalid {
        element: dom.full_name(id),
        reason: reason.to_string(),
    }
}

struct Lowering<'a> {
    dom: Dom,
    definitions: &'a HashMap<String, ElementDef>,
    expanding: Vec<String>,
}

impl Lowering<'_> {
    fn lower(
        &mut self,
        def: &ElementDef,
        parent: Option<ElementId>,
    ) -> Result<ElementId, SchemaError> {
        if def.is_repeated() && !matches!(def.kind, DefKind::Sequence { .. }) {
            return self.lower_repeated(def, parent);
        }
        if let DefKind::Ref { model } = &def.kind {
            return self.lower_reference(def, model, parent);
        }

        let kind = match &def.kind {
            DefKind::Number {
                size,
                signed,
                endian,
            } => ElementKind::Number(NumberDef {
                size: *size,
                signed: *signed,
                endian: *endian,
            }),
            DefKind::String {
                encoding,
                null_terminated,
            } => ElementKind::String(StringDef {
                encoding: *encoding,
                null_terminated: *null_terminated,
            }),
            DefKind::Blob => ElementKind::Blob,
            DefKind::Padding {
                alignment,
                aligned_to,
            } => ElementKind::Padding(PaddingDef {
                alignment: *alignment,
                aligned_to: aligned_to.clone(),
            }),
            DefKind::Block { .. } => ElementKind::Block(Vec::new()),
            DefKind::Choice { .. } => ElementKind::Choice(ChoiceDef {
                alternatives: Vec::new(),
                selected: None,
            }),
            // The template is lowered below, once this node has an id.
            DefKind::Sequence { .. } => ElementKind::Sequence(SequenceDef {
                template: ElementId::placeholder(),
                min_occurs: 0,
                max_occurs: None,
                occurs: 1,
                entries: Vec::new(),
            }),
            DefKind::Ref { .. } => unreachable!("references are expanded above"),
        };

        let mut node = Node::new(&def.name, kind);
        node.parent = parent;
        node.length = def.length.map(|value| Length {
            value,
            unit: def.length_type,
        });
        node.token = def.token;
        node.relations = def.relations.clone();
        node.fixup = def.fixup.clone();
        node.placement = def.placement.clone();
        node.constraint = def.constraint.clone();
        let id = self.dom.alloc(node);
        let value = match &def.value {
            Some(v) => Some(convert_value(&self.dom, id, v, def.value_type)?),
            None => None,
        };
        self.dom.node_mut(id).value = value;

        match &def.kind {
            DefKind::Block { children } => {
                let ids = children
                    .iter()
                    .map(|c| self.lower(c, Some(id)))
                    .collect::<Result<Vec<_>, _>>()?;
                self.dom.node_mut(id).kind = ElementKind::Block(ids);
            }
            DefKind::Choice { alternatives } => {
                let ids = alternatives
                    .iter()
                    .map(|c| self.lower(c, Some(id)))
                    .collect::<Result<Vec<_>, _>>()?;
                if let ElementKind::Choice(choice) = &mut self.dom.node_mut(id).kind {
                    choice.alternatives = ids;
                }
            }
            DefKind::Sequence { template } => {
                let template = self.lower(template, Some(id))?;
                let (min, max) = match (def.occurs, def.min_occurs, def.max_occurs) {
                    (Some(n), _, _) => (n, Some(n)),
                    (None, min, max) => (min.unwrap_or(0), max),
                };
                if let ElementKind::Sequence(seq) = &mut self.dom.node_mut(id).kind {
                    seq.template = template;
                    seq.min_occurs = min;
                    seq.max_occurs = max;
                    seq.occurs = generation_count(min, max, def.occurs);
                }
            }
            _ => {}
        }
        Ok(id)
    }

    /// Wraps an element carrying occurrence bounds in a Sequence of the same name.
    fn lower_repeated(
        &mut self,
        def: &ElementDef,
        parent: Option<ElementId>,
    ) -> Result<ElementId, SchemaError> {
        let mut template = def.clone();
        template.occurs = None;
        template.min_occurs = None;
        template.max_occurs = None;
        template.placement = None;
        let mut sequence = ElementDef::sequence(&def.name, template);
        sequence.placement = def.placement.clone();
        sequence.occurs = def.occurs;
        sequence.min_occurs = Some(def.min_occurs.unwrap_or(1));
        sequence.max_occurs = def.max_occurs;
        self.lower(&sequence, parent)
    }

    fn lower_reference(
        &mut self,
        def: &ElementDef,
        model: &str,
        parent: Option<ElementId>,
    ) -> Result<ElementId, SchemaError> {
        if self.expanding.iter().any(|m| m == model) {
            return Err(SchemaError::RecursiveReference(model.to_string()));
        }
        let target = self
            .definitions
            .get(model)
            .ok_or_else(|| SchemaError::UnknownModel(model.to_string()))?;
        let mut expanded = target.clone();
        expanded.name = def.name.clone();
        expanded.relations.extend(def.relations.iter().cloned());
        expanded.fixup = def.fixup.clone().or(expanded.fixup);
        if def.length.is_some() {
            expanded.length = def.length;
            expanded.length_type = def.length_type;
        }
        expanded.placement = def.placement.clone().or(expanded.placement);
        expanded.constraint = def.constraint.clone().or(expanded.constraint);
        expanded.token |= def.token;
        self.expanding.push(model.to_string());
        let id = self.lower(&expanded, parent);
        self.expanding.pop();
        id
    }
}

fn generation_count(min: u64, max: Option<u64>, occurs: Option<u64>) -> u64 {
    let wanted = occurs.unwrap_or(min.max(1));
    max.map_or(wanted, |max| wanted.min(max))
}

fn parse_int(text: &str) -> Option<i64> {
    let text = text.trim();
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => i64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

fn parse_hex(text: &str) -> Option<Vec<u8>> {
    let digits: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&digits[i..i + 2], 16).ok())
        .collect()
}

fn convert_value(
    dom: &Dom,
    id: ElementId,
    value: &DefValue,
    value_type: ValueType,
) -> Result<Value, SchemaError> {
    let bad = |reason: &str| invalid(dom, id, reason);
    let bytes = |text: &str| match value_type {
        ValueType::Hex => parse_hex(text).ok_or_else(|| bad("value is not valid hex")),
        ValueType::String => Ok(text.as_bytes().to_vec()),
    };
    match (dom.kind(id), value) {
        (ElementKind::Number(def), DefValue::Int(v)) => Ok(if def.signed {
            Value::Int(*v)
        } else {
            Value::UInt(u64::try_from(*v).map_err(|_| bad("unsigned number has a negative value"))?)
        }),
        (ElementKind::Number(_), DefValue::Text(text)) => {
            let v = parse_int(text).ok_or_else(|| bad("number value is not an integer"))?;
            convert_value(dom, id, &DefValue::Int(v), value_type)
        }
        (ElementKind::String(def), DefValue::Text(text)) => match value_type {
            ValueType::String => Ok(Value::Str(text.clone())),
            ValueType::Hex => {
                let raw = bytes(text)?;
                def.encoding
                    .decode(&raw)
                    .map(Value::Str)
                    .map_err(|e| bad(&e.to_string()))
            }
        },
        (ElementKind::String(_), DefValue::Int(v)) => Ok(Value::Str(v.to_string())),
        (ElementKind::Blob | ElementKind::Padding(_), DefValue::Text(text)) => {
            Ok(Value::Bits(BitBuf::from_vec(bytes(text)?)))
        }
        (ElementKind::Blob | ElementKind::Padding(_), DefValue::Int(_)) => {
            Err(bad("blob values must be text or hex"))
        }
        _ => Err(bad("containers cannot carry a value")),
    }
}

fn validate(dom: &Dom, root: ElementId) -> Result<(), SchemaError> {
    for id in dom.preorder(root, Walk::Template) {
        let node = dom.node(id);
        let mut seen: Vec<&str> = Vec::new();
        for child in dom.children(id, Walk::Template) {
            let name = dom.name(*child);
            if seen.contains(&name) && !matches!(node.kind, ElementKind::Sequence(_)) {
                return Err(SchemaError::DuplicateName {
                    parent: dom.full_name(id),
                    name: name.to_string(),
                });
            }
            seen.push(name);
        }
        if node.name.is_empty() || node.name.contains('.') {
            return Err(invalid(dom, id, "element names must be non-empty and contain no '.'"));
        }

        if let Some(length) = node.length {
            let chars_ok = matches!(node.kind, ElementKind::String(_));
            if length.unit == LengthUnit::Chars && !chars_ok {
                return Err(invalid(
                    dom,
                    id,
                    &format!("{} does not support lengthType chars", node.kind.type_name()),
                ));
            }
            if matches!(node.kind, ElementKind::Number(_) | ElementKind::Padding(_)) {
                return Err(invalid(dom, id, "length is implied by the element's size"));
            }
        }

        match &node.kind {
            ElementKind::Number(def) if !(1..=64).contains(&def.size) => {
                return Err(invalid(dom, id, "number size must be between 1 and 64 bits"));
            }
            ElementKind::Padding(def) => {
                if def.alignment == 0 {
                    return Err(invalid(dom, id, "padding alignment must be positive"));
                }
                if let Some(anchor) = &def.aligned_to {
                    resolve(dom, anchor, id, Walk::Template)?;
                }
            }
            _ => {}
        }

        if node.token && node.value.is_none() {
            return Err(invalid(dom, id, "token elements need a value"));
        }

        for relation in &node.relations {
            if relation.length_type == LengthUnit::Chars {
                return Err(invalid(dom, id, "relations measure bits or bytes, not chars"));
            }
            let object = resolve(dom, &relation.of, id, Walk::Template)?;
            if relation.kind == RelationKind::Count
                && !matches!(dom.kind(object), ElementKind::Sequence(_))
            {
                return Err(invalid(
                    dom,
                    id,
                    &format!("count relation target '{}' is not an array", relation.of),
                ));
            }
            if let Some(anchor) = &relation.relative_to {
                resolve(dom, anchor, id, Walk::Template)?;
            }
        }

        if let Some(fixup) = &node.fixup {
            resolve(dom, &fixup.of, id, Walk::Template)?;
            if !node.relations.is_empty() {
                return Err(invalid(dom, id, "an element cannot carry both relations and a fixup"));
            }
            match (&node.kind, fixup.kind.width()) {
                (ElementKind::Number(def), Some(width)) if def.size >= width => {}
                (ElementKind::Blob, None) => {}
                (_, Some(width)) => {
                    return Err(invalid(
                        dom,
                        id,
                        &format!("fixup needs a number of at least {width} bits"),
                    ));
                }
                (_, None) => return Err(invalid(dom, id, "digest fixups need a blob")),
            }
        }

        match &node.placement {
            Some(Placement::Before(anchor) | Placement::After(anchor)) => {
                resolve(dom, anchor, id, Walk::Template)?;
            }
            Some(Placement::Absolute) | None => {}
        }
    }
    Ok(())
}
