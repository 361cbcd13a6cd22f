use thiserror::Error;

/// Classification of a structural failure raised while cracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The data does not match the element (token mismatch, bad encoding, no alternative fit).
    StructuralMismatch,
    /// The stream or the enclosing bound ended early.
    InsufficientData,
    /// A constraint predicate rejected the cracked value.
    ConstraintViolation,
    /// The element's length cannot be determined.
    Unsized,
    /// A container read past the length its size relation declared.
    Overread,
    /// Placement anchors depend on each other.
    PlacementCycle,
}

/// A failure attributed to one element of the cracked tree.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{element_type} '{element}' failed to crack. {message}")]
pub struct CrackingFailure {
    /// Full dotted name of the offending element.
    pub element: String,
    pub element_type: &'static str,
    pub message: String,
    /// Absolute bit position of the cursor when the failure was raised.
    pub position: u64,
}

/// Errors raised by the relation and constraint expression evaluator.
///
/// These are never recoverable: a broken expression is a defect in the model, not a sign that
/// the data took a different shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExpressionError {
    #[error("syntax error in expression '{expr}': {reason}")]
    Syntax { expr: String, reason: String },
    #[error("error evaluating expression '{expr}': {reason}")]
    Runtime { expr: String, reason: String },
}

/// Configuration errors in a schema: detected when the schema is built, or when a relation
/// has to be resolved and cannot be.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("unknown data model '{0}'")]
    UnknownModel(String),
    #[error("'{path}' referenced from '{scope}' does not resolve to any element")]
    Unresolved { path: String, scope: String },
    #[error("'{path}' referenced from '{scope}' is ambiguous between {candidates:?}")]
    Ambiguous {
        path: String,
        scope: String,
        candidates: Vec<String>,
    },
    #[error("'{parent}' has more than one child named '{name}'")]
    DuplicateName { parent: String, name: String },
    #[error("'{element}': {reason}")]
    Invalid { element: String, reason: String },
    #[error("model '{0}' references itself")]
    RecursiveReference(String),
    #[error("failed to parse schema document: {0}")]
    Document(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CrackError {
    #[error("{0}")]
    StructuralMismatch(CrackingFailure),
    #[error("{0}")]
    InsufficientData(CrackingFailure),
    #[error("{0}")]
    ConstraintViolation(CrackingFailure),
    #[error("{0}")]
    Unsized(CrackingFailure),
    #[error("{0}")]
    Overread(CrackingFailure),
    #[error("{0}")]
    PlacementCycle(CrackingFailure),
    #[error("expression error on '{element}': {source}")]
    Expression {
        element: String,
        source: ExpressionError,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl CrackError {
    pub fn new(kind: FailureKind, failure: CrackingFailure) -> Self {
        match kind {
            FailureKind::StructuralMismatch => CrackError::StructuralMismatch(failure),
            FailureKind::InsufficientData => CrackError::InsufficientData(failure),
            FailureKind::ConstraintViolation => CrackError::ConstraintViolation(failure),
            FailureKind::Unsized => CrackError::Unsized(failure),
            FailureKind::Overread => CrackError::Overread(failure),
            FailureKind::PlacementCycle => CrackError::PlacementCycle(failure),
        }
    }

    /// Whether a Choice or Sequence may roll back and try something else.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CrackError::StructuralMismatch(_)
                | CrackError::InsufficientData(_)
                | CrackError::ConstraintViolation(_)
        )
    }

    pub fn kind(&self) -> Option<FailureKind> {
        Some(match self {
            CrackError::StructuralMismatch(_) => FailureKind::StructuralMismatch,
            CrackError::InsufficientData(_) => FailureKind::InsufficientData,
            CrackError::ConstraintViolation(_) => FailureKind::ConstraintViolation,
            CrackError::Unsized(_) => FailureKind::Unsized,
            CrackError::Overread(_) => FailureKind::Overread,
            CrackError::PlacementCycle(_) => FailureKind::PlacementCycle,
            CrackError::Expression { .. } | CrackError::Schema(_) => return None,
        })
    }

    pub fn failure(&self) -> Option<&CrackingFailure> {
        match self {
            CrackError::StructuralMismatch(f)
            | CrackError::InsufficientData(f)
            | CrackError::ConstraintViolation(f)
            | CrackError::Unsized(f)
            | CrackError::Overread(f)
            | CrackError::PlacementCycle(f) => Some(f),
            CrackError::Expression { .. } | CrackError::Schema(_) => None,
        }
    }

    /// Full name of the element the error is attributed to, when there is one.
    pub fn element(&self) -> Option<&str> {
        match self {
            CrackError::Expression { element, .. } => Some(element),
            other => other.failure().map(|f| f.element.as_str()),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GenerateError {
    #[error("expression error on '{element}': {source}")]
    Expression {
        element: String,
        source: ExpressionError,
    },
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("cannot encode '{element}': {reason}")]
    Encoding { element: String, reason: String },
}
