pub mod bits;
mod codec;
pub mod config;
pub mod crack;
pub mod encoding;
pub mod error;
pub mod expr;
pub mod fixup;
mod generate;
pub mod model;
pub mod mutator;
mod placement;
pub mod resolve;
pub mod schema;
pub mod tree;
pub mod value;
pub mod view;

pub use bits::{BitBuf, BitCursor};
pub use crack::{ChoiceCache, Cracker};
pub use error::{CrackError, CrackingFailure, FailureKind, GenerateError, SchemaError};
pub use fixup::{Fixup, FixupKind};
pub use model::{ElementId, ElementKind, Relation};
pub use schema::{ElementDef, Schema, SchemaDocument};
pub use tree::Tree;
pub use value::Value;
