//! Name resolution for relations, placements and padding anchors, plus the get/set transforms
//! applied to relation values.

use crate::error::{ExpressionError, SchemaError};
use crate::expr::{Expression, Vars};
use crate::model::{Dom, ElementId, Relation, Walk};

fn descend(dom: &Dom, from: ElementId, rest: &[&str], walk: Walk) -> Option<ElementId> {
    rest.iter()
        .try_fold(from, |current, segment| dom.child_named(current, segment, walk))
}

/// Resolves a dotted `path` as seen from `scope`.
///
/// Each enclosing container, starting at `scope` itself, is checked for a child named like
/// the first segment and then for its own name; the remaining segments descend from there.
/// If no enclosing scope matches, the whole tree is searched. In a template walk the match
/// must be unique; a live walk takes the first match in document order, since array entries
/// legitimately repeat names.
pub fn resolve(
    dom: &Dom,
    path: &str,
    scope: ElementId,
    walk: Walk,
) -> Result<ElementId, SchemaError> {
    let unresolved = || SchemaError::Unresolved {
        path: path.to_string(),
        scope: dom.full_name(scope),
    };
    let segments: Vec<&str> = path.split('.').collect();
    let Some((first, rest)) = segments.split_first() else {
        return Err(unresolved());
    };
    if first.is_empty() {
        return Err(unresolved());
    }

    for candidate in std::iter::once(scope).chain(dom.ancestors(scope)) {
        if let Some(child) = dom.child_named(candidate, first, walk) {
            if let Some(found) = descend(dom, child, rest, walk) {
                return Ok(found);
            }
        }
        if dom.name(candidate) == *first {
            if let Some(found) = descend(dom, candidate, rest, walk) {
                return Ok(found);
            }
        }
    }

    let root = dom.root_of(scope);
    let matches: Vec<ElementId> = dom
        .preorder(root, walk)
        .into_iter()
        .filter(|id| dom.name(*id) == *first)
        .filter_map(|id| descend(dom, id, rest, walk))
        .collect();
    match (matches.as_slice(), walk) {
        ([], _) => Err(unresolved()),
        ([only], _) => Ok(*only),
        ([first_match, ..], Walk::Live) => Ok(*first_match),
        (many, Walk::Template) => Err(SchemaError::Ambiguous {
            path: path.to_string(),
            scope: dom.full_name(scope),
            candidates: many.iter().map(|id| dom.full_name(*id)).collect(),
        }),
    }
}

/// Live resolution that treats "not there (yet)" as `None`.
pub fn try_resolve(dom: &Dom, path: &str, scope: ElementId) -> Option<ElementId> {
    resolve(dom, path, scope, Walk::Live).ok()
}

fn apply(rel: &Relation, source: Option<&String>, input: i64) -> Result<i64, ExpressionError> {
    match source {
        Some(source) => {
            let vars = Vars::new()
                .with(rel.kind.variable(), input)
                .with("value", input);
            Expression::parse(source)?.eval_int(&vars)
        }
        None => Ok(input),
    }
}

/// Raw subject value to the logical quantity it stands for.
pub fn relation_get(rel: &Relation, raw: i64) -> Result<i64, ExpressionError> {
    apply(rel, rel.expression_get.as_ref(), raw)
}

/// Logical quantity to the raw value written into the subject.
pub fn relation_set(rel: &Relation, logical: i64) -> Result<i64, ExpressionError> {
    apply(rel, rel.expression_set.as_ref(), logical)
}
