use crate::bits::BitBuf;
use crate::model::{ElementId, ElementKind, NumberDef};
use crate::tree::Tree;
use crate::value::Value;
use rand::Rng;
use std::collections::HashSet;

/// A `Mutator` produces a new tree from a cracked one by changing element values.
///
/// Mutators never touch the bits directly: they change values and let generation
/// recompute sizes, counts and offsets, so the output stays structurally consistent.
///
/// # Type Parameters
/// * `R`: The type of random number generator used for mutation decisions.
pub trait Mutator<R: Rng + ?Sized> {
    /// Applies a mutation strategy to a copy of `tree`.
    ///
    /// # Arguments
    /// * `tree`: The cracked tree to start from. It is left untouched.
    /// * `rng`: A mutable reference to a random number generator.
    ///
    /// # Returns
    /// `Result<Tree, anyhow::Error>`:
    ///   - `Ok(tree)`: The mutated copy.
    ///   - `Err(error)`: If the mutation could not be applied.
    fn mutate(&mut self, tree: &Tree, rng: &mut R) -> Result<Tree, anyhow::Error>;
}

/// Scalars whose value may be changed: not tokens, and not relation or fixup subjects,
/// whose values are recomputed on generation anyway.
pub fn mutable_leaves(tree: &Tree) -> Vec<ElementId> {
    let subjects: HashSet<ElementId> = tree
        .elements()
        .into_iter()
        .filter(|id| !tree.relations(*id).is_empty())
        .collect();
    tree.elements()
        .into_iter()
        .filter(|id| {
            let node = tree.dom().node(*id);
            !node.kind.is_container()
                && !matches!(node.kind, ElementKind::Padding(_))
                && !node.token
                && node.fixup.is_none()
                && !subjects.contains(id)
        })
        .collect()
}

fn number_limits(def: &NumberDef) -> (i128, i128) {
    let bits = def.size.min(64);
    if def.signed {
        let half = 1i128 << (bits - 1);
        (-half, half - 1)
    } else {
        (0, (1i128 << bits) - 1)
    }
}

/// Changes one number leaf: a small wrapping step or a boundary value of its width.
#[derive(Debug, Default, Clone, Copy)]
pub struct NumberEdgeMutator;

impl<R: Rng + ?Sized> Mutator<R> for NumberEdgeMutator {
    fn mutate(&mut self, tree: &Tree, rng: &mut R) -> Result<Tree, anyhow::Error> {
        let numbers: Vec<(ElementId, NumberDef)> = mutable_leaves(tree)
            .into_iter()
            .filter_map(|id| match tree.kind(id) {
                ElementKind::Number(def) => Some((id, def.clone())),
                _ => None,
            })
            .collect();
        let mut out = tree.clone();
        if numbers.is_empty() {
            return Ok(out);
        }
        let (id, def) = &numbers[rng.random_range(0..numbers.len())];
        let (low, high) = number_limits(def);
        let current = tree.value(*id).and_then(Value::as_i64).map_or(0, i128::from);
        let next = match rng.random_range(0..4u8) {
            0 => low,
            1 => high,
            2 => (low + high) / 2 + 1,
            _ => {
                let step = i128::from(rng.random_range(1u8..=15u8));
                let span = high - low + 1;
                low + (current - low + step).rem_euclid(span)
            }
        };
        let value = if def.signed {
            Value::Int(next as i64)
        } else {
            Value::UInt(next as u64)
        };
        out.set_value(*id, value);
        Ok(out)
    }
}

/// Picks one string or blob leaf and adds a small random value to one of its bytes.
///
/// An empty leaf first gains a single zero byte.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlipSingleByteMutator;

impl FlipSingleByteMutator {
    pub fn flip_bytes<R: Rng + ?Sized>(bytes: &mut Vec<u8>, rng: &mut R) {
        if bytes.is_empty() {
            bytes.push(0);
        }
        let random_add_value = rng.random_range(1u8..=15u8);
        let index = rng.random_range(0..bytes.len());
        bytes[index] = bytes[index].wrapping_add(random_add_value);
    }
}

impl<R: Rng + ?Sized> Mutator<R> for FlipSingleByteMutator {
    fn mutate(&mut self, tree: &Tree, rng: &mut R) -> Result<Tree, anyhow::Error> {
        let leaves: Vec<ElementId> = mutable_leaves(tree)
            .into_iter()
            .filter(|id| matches!(tree.kind(*id), ElementKind::Blob | ElementKind::String(_)))
            .collect();
        let mut out = tree.clone();
        if leaves.is_empty() {
            return Ok(out);
        }
        let id = leaves[rng.random_range(0..leaves.len())];
        let value = match (tree.kind(id), tree.value(id)) {
            (ElementKind::String(def), Some(Value::Str(text))) => {
                let mut bytes = def.encoding.encode(text)?;
                Self::flip_bytes(&mut bytes, rng);
                match def.encoding.decode(&bytes) {
                    Ok(text) => Value::Str(text),
                    Err(_) => Value::Bits(BitBuf::from_vec(bytes)),
                }
            }
            (_, Some(Value::Bits(bits))) => {
                let mut bytes = bits.as_bytes().to_vec();
                Self::flip_bytes(&mut bytes, rng);
                Value::Bits(BitBuf::from_vec(bytes))
            }
            _ => {
                let mut bytes = Vec::new();
                Self::flip_bytes(&mut bytes, rng);
                Value::Bits(BitBuf::from_vec(bytes))
            }
        };
        out.set_value(id, value);
        Ok(out)
    }
}

/// Delegates each call to one of its mutators, chosen uniformly.
pub struct RandomMutator<R: Rng + ?Sized> {
    mutators: Vec<Box<dyn Mutator<R>>>,
}

impl<R: Rng + ?Sized> RandomMutator<R> {
    pub fn new(mutators: Vec<Box<dyn Mutator<R>>>) -> Self {
        Self { mutators }
    }
}

impl<R: Rng + ?Sized> Default for RandomMutator<R> {
    fn default() -> Self {
        Self::new(vec![Box::new(NumberEdgeMutator), Box::new(FlipSingleByteMutator)])
    }
}

impl<R: Rng + ?Sized> Mutator<R> for RandomMutator<R> {
    fn mutate(&mut self, tree: &Tree, rng: &mut R) -> Result<Tree, anyhow::Error> {
        if self.mutators.is_empty() {
            return Ok(tree.clone());
        }
        let index = rng.random_range(0..self.mutators.len());
        self.mutators[index].mutate(tree, rng)
    }
}
