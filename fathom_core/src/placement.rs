//! Moves placed elements to their final position once cracking has finished.
//!
//! Absolute elements are moved first, into the model root ordered by where they were read.
//! Before/after elements follow, ordered so that an element anchored on another placed
//! element moves after its anchor. Relations touching a moved subtree are rewritten to the
//! new full names so they keep resolving to the same elements.

use crate::error::{CrackError, CrackingFailure, FailureKind, SchemaError};
use crate::model::{Dom, ElementId, ElementKind, Placement, Walk};
use crate::resolve::{resolve, try_resolve};
use log::{debug, trace};

struct Anchored {
    id: ElementId,
    anchor: ElementId,
    after: bool,
}

/// A relation endpoint captured before anything moved. `index` is `None` for the subject's
/// fixup.
struct RelationSnapshot {
    subject: ElementId,
    index: Option<usize>,
    object: ElementId,
    relative_to: Option<ElementId>,
}

pub(crate) fn reconcile(dom: &mut Dom, root: ElementId) -> Result<(), CrackError> {
    let placed: Vec<ElementId> = dom
        .preorder(root, Walk::Live)
        .into_iter()
        .filter(|id| dom.node(*id).placement.is_some())
        .collect();
    if placed.is_empty() {
        return Ok(());
    }

    let mut absolute = Vec::new();
    let mut anchored = Vec::new();
    for id in &placed {
        match dom.node(*id).placement.clone() {
            Some(Placement::Absolute) => absolute.push(*id),
            Some(Placement::Before(name)) => anchored.push(anchor_of(dom, *id, &name, false)?),
            Some(Placement::After(name)) => anchored.push(anchor_of(dom, *id, &name, true)?),
            None => {}
        }
    }
    let anchored = order_anchored(dom, anchored)?;
    let snapshot = snapshot_relations(dom, root);

    absolute.sort_by_key(|id| dom.node(*id).begin.unwrap_or(0));
    for id in &absolute {
        move_into_root(dom, root, *id)?;
    }
    for placement in &anchored {
        move_next_to(dom, placement)?;
    }

    for id in &placed {
        dom.node_mut(*id).placement = None;
    }
    let moved = |dom: &Dom, id: ElementId| placed.iter().any(|p| dom.contains_in_subtree(*p, id));
    for entry in snapshot {
        let touches = moved(dom, entry.subject)
            || moved(dom, entry.object)
            || entry.relative_to.is_some_and(|r| moved(dom, r));
        if !touches {
            continue;
        }
        let of = dom.full_name(entry.object);
        let relative_to = entry.relative_to.map(|r| dom.full_name(r));
        let node = dom.node_mut(entry.subject);
        let Some(index) = entry.index else {
            if let Some(fixup) = &mut node.fixup {
                trace!("Rewriting fixup '{}' to '{of}'", fixup.of);
                fixup.of = of;
            }
            continue;
        };
        let relation = &mut node.relations[index];
        trace!("Rewriting relation '{}' to '{of}'", relation.of);
        relation.of = of;
        if relative_to.is_some() {
            relation.relative_to = relative_to;
        }
    }
    Ok(())
}

fn anchor_of(dom: &Dom, id: ElementId, name: &str, after: bool) -> Result<Anchored, CrackError> {
    let anchor = resolve(dom, name, id, Walk::Live)?;
    if dom.contains_in_subtree(id, anchor) {
        return Err(cycle(dom, &[id]));
    }
    Ok(Anchored { id, anchor, after })
}

fn cycle(dom: &Dom, ids: &[ElementId]) -> CrackError {
    let names: Vec<String> = ids.iter().map(|id| dom.full_name(*id)).collect();
    let first = ids[0];
    CrackError::new(
        FailureKind::PlacementCycle,
        CrackingFailure {
            element: dom.full_name(first),
            element_type: dom.kind(first).type_name(),
            message: format!("Placement anchors form a cycle: {}.", names.join(", ")),
            position: dom.node(first).begin.unwrap_or(0),
        },
    )
}

/// Orders placements so every element moves after the placed element it is anchored on.
fn order_anchored(dom: &Dom, pending: Vec<Anchored>) -> Result<Vec<Anchored>, CrackError> {
    let placed_anchor = |p: &Anchored, others: &[Anchored]| {
        others
            .iter()
            .any(|o| o.id != p.id && dom.contains_in_subtree(o.id, p.anchor))
    };
    let mut pending = pending;
    let mut ordered = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|p| !placed_anchor(p, &pending))
            .ok_or_else(|| {
                let ids: Vec<ElementId> = pending.iter().map(|p| p.id).collect();
                cycle(dom, &ids)
            })?;
        ordered.push(pending.remove(ready));
    }
    Ok(ordered)
}

fn snapshot_relations(dom: &Dom, root: ElementId) -> Vec<RelationSnapshot> {
    let mut out = Vec::new();
    for subject in dom.preorder(root, Walk::Live) {
        for (index, relation) in dom.node(subject).relations.iter().enumerate() {
            let Some(object) = try_resolve(dom, &relation.of, subject) else {
                continue;
            };
            let relative_to = relation
                .relative_to
                .as_ref()
                .and_then(|name| try_resolve(dom, name, subject));
            out.push(RelationSnapshot {
                subject,
                index: Some(index),
                object,
                relative_to,
            });
        }
        let fixup = dom.node(subject).fixup.as_ref();
        if let Some(object) = fixup.and_then(|f| try_resolve(dom, &f.of, subject)) {
            out.push(RelationSnapshot {
                subject,
                index: None,
                object,
                relative_to: None,
            });
        }
    }
    out
}

fn detach(dom: &mut Dom, id: ElementId) -> Result<(), CrackError> {
    let Some(parent) = dom.parent(id) else {
        return Err(invalid(dom, id, "the model root cannot be placed"));
    };
    if !matches!(dom.kind(parent), ElementKind::Block(_)) {
        return Err(invalid(dom, id, "only block members can be placed"));
    }
    if let ElementKind::Block(children) = &mut dom.node_mut(parent).kind {
        children.retain(|c| *c != id);
    }
    Ok(())
}

fn unique_name(dom: &Dom, parent: ElementId, base: &str) -> String {
    if dom.child_named(parent, base, Walk::Live).is_none() {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base}_{n}"))
        .find(|candidate| dom.child_named(parent, candidate, Walk::Live).is_none())
        .unwrap_or_else(|| base.to_string())
}

fn insert_child(
    dom: &mut Dom,
    parent: ElementId,
    id: ElementId,
    at: usize,
) -> Result<(), CrackError> {
    let name = unique_name(dom, parent, dom.name(id));
    if name != dom.name(id) {
        debug!("Renaming placed '{}' to '{name}'", dom.full_name(id));
    }
    if !matches!(dom.kind(parent), ElementKind::Block(_)) {
        return Err(invalid(dom, id, "placement destination is not a block"));
    }
    if let ElementKind::Block(children) = &mut dom.node_mut(parent).kind {
        let at = at.min(children.len());
        children.insert(at, id);
    }
    let node = dom.node_mut(id);
    node.name = name;
    node.parent = Some(parent);
    Ok(())
}

fn move_into_root(dom: &mut Dom, root: ElementId, id: ElementId) -> Result<(), CrackError> {
    detach(dom, id)?;
    let begin = dom.node(id).begin.unwrap_or(0);
    let at = dom
        .children(root, Walk::Live)
        .iter()
        .position(|c| dom.node(*c).begin.is_some_and(|b| b > begin))
        .unwrap_or(dom.children(root, Walk::Live).len());
    insert_child(dom, root, id, at)?;
    debug!("Placed '{}' at bit {begin}", dom.full_name(id));
    Ok(())
}

fn move_next_to(dom: &mut Dom, placement: &Anchored) -> Result<(), CrackError> {
    let Some(parent) = dom.parent(placement.anchor) else {
        return Err(invalid(dom, placement.id, "cannot be placed beside the model root"));
    };
    if !matches!(dom.kind(parent), ElementKind::Block(_)) {
        return Err(invalid(dom, placement.id, "placement destination is not a block"));
    }
    detach(dom, placement.id)?;
    let index = dom
        .children(parent, Walk::Live)
        .iter()
        .position(|c| *c == placement.anchor)
        .unwrap_or(0);
    insert_child(dom, parent, placement.id, index + usize::from(placement.after))?;
    debug!(
        "Placed '{}' {} '{}'",
        dom.full_name(placement.id),
        if placement.after { "after" } else { "before" },
        dom.full_name(placement.anchor)
    );
    Ok(())
}

fn invalid(dom: &Dom, id: ElementId, reason: &str) -> CrackError {
    CrackError::Schema(SchemaError::Invalid {
        element: dom.full_name(id),
        reason: reason.to_string(),
    })
}
