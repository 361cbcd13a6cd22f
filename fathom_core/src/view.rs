//! A serializable snapshot of a cracked tree, for printing and for diffing in tests.

use crate::model::{ElementId, ElementKind};
use crate::tree::Tree;
use crate::value::Value;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ViewValue {
    Int(i64),
    UInt(u64),
    Text(String),
    /// Lowercase hex of the raw bits.
    Hex(String),
}

impl From<&Value> for ViewValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Int(v) => ViewValue::Int(*v),
            Value::UInt(v) => ViewValue::UInt(*v),
            Value::Str(s) => ViewValue::Text(s.clone()),
            Value::Bits(b) => ViewValue::Hex(b.to_hex()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ElementView {
    pub name: String,
    pub full_name: String,
    #[serde(rename = "type")]
    pub element_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ViewValue>,
    /// Bit span in the cracked input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span: Option<(u64, u64)>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ElementView>,
}

impl Tree {
    pub fn view(&self) -> ElementView {
        self.view_of(self.root())
    }

    pub fn view_of(&self, id: ElementId) -> ElementView {
        let kind = self.kind(id);
        ElementView {
            name: self.name(id).to_string(),
            full_name: self.full_name(id),
            element_type: kind.type_name(),
            value: match kind {
                ElementKind::Block(_) | ElementKind::Choice(_) | ElementKind::Sequence(_) => None,
                _ => self.value(id).map(ViewValue::from),
            },
            span: self.span(id),
            children: self.children(id).iter().map(|c| self.view_of(*c)).collect(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.view())
    }
}
