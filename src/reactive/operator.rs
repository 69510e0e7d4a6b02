//! Item operators: per-item transforms and stateful pools.
//!
//! Transforms are a closed tagged enum rather than boxed closures so they can
//! be carried inside connection requests, compared in tests, and logged. Each
//! applies to one binding and yields at most one binding; a `None` under
//! downstream demand makes the owning node re-pull upstream.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::pattern::{Binding, Var};
use crate::rule::Unifier;

// ---------------------------------------------------------------------------
// Transforms
// ---------------------------------------------------------------------------

/// A stateless per-item mapping carried by transformation streams and
/// connection output ports.
#[derive(Debug, Clone)]
pub enum Transform {
    /// Merge a fixed prefix binding into each item; drops items that
    /// contradict the prefix.
    MergePrefix(Binding),
    /// Restrict each item to the given variables.
    Project(Arc<Vec<Var>>),
    /// Map rule-head answers back into the requesting atom's variables.
    UnUnify(Arc<Unifier>),
}

impl Transform {
    pub fn apply(&self, item: &Binding) -> Option<Binding> {
        match self {
            Transform::MergePrefix(prefix) => item.merged(prefix),
            Transform::Project(vars) => Some(item.restricted(vars.iter())),
            Transform::UnUnify(unifier) => unifier.un_unify(item),
        }
    }
}

impl fmt::Display for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transform::MergePrefix(prefix) => write!(f, "merge{prefix}"),
            Transform::Project(vars) => {
                write!(f, "project[")?;
                for (i, v) in vars.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Transform::UnUnify(_) => write!(f, "un-unify"),
        }
    }
}

/// Apply a chain of transforms in order; `None` if any stage drops the item.
pub fn apply_chain(chain: &[Transform], item: Binding) -> Option<Binding> {
    let mut current = item;
    for transform in chain {
        current = transform.apply(&current)?;
    }
    Some(current)
}

// ---------------------------------------------------------------------------
// Pools
// ---------------------------------------------------------------------------

/// Receiver id inside one reactive graph (mirrors `NodeId` in the parent
/// module; duplicated here to keep the operator layer free-standing).
pub type Receiver = usize;

/// Stateful buffering policy behind a pooling stream.
///
/// Accounting contract: `accept` and `replay_for` return the number of item
/// copies the pool now owes receivers as a result of the call. The owning
/// node reports one answer-created per owed copy and one answer-consumed per
/// `next_for` delivery, so buffered items keep the termination monitor's
/// in-flight count positive.
pub trait Pool: Send + 'static {
    /// Feed one item; returns the number of owed copies created.
    fn accept(&mut self, item: Binding, receivers: &[Receiver]) -> usize;

    /// Take the next item owed to `receiver`, if any.
    fn next_for(&mut self, receiver: Receiver) -> Option<Binding>;

    /// Admit a late receiver; returns the number of buffered copies it is
    /// now owed.
    fn replay_for(&mut self, receiver: Receiver) -> usize;
}

/// Plain FIFO buffer for a single receiver.
#[derive(Debug, Default)]
pub struct FifoPool {
    queue: VecDeque<Binding>,
}

impl FifoPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pool for FifoPool {
    fn accept(&mut self, item: Binding, _receivers: &[Receiver]) -> usize {
        self.queue.push_back(item);
        1
    }

    fn next_for(&mut self, _receiver: Receiver) -> Option<Binding> {
        self.queue.pop_front()
    }

    fn replay_for(&mut self, _receiver: Receiver) -> usize {
        // Single-receiver pool: everything buffered was counted at accept.
        0
    }
}

/// Deduplicating fan-out pool: every receiver sees each distinct item exactly
/// once, including receivers that register after items arrived.
#[derive(Debug, Default)]
pub struct DistinctReplayPool {
    items: Vec<Binding>,
    seen: HashSet<Binding>,
    cursors: HashMap<Receiver, usize>,
}

impl DistinctReplayPool {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Pool for DistinctReplayPool {
    fn accept(&mut self, item: Binding, receivers: &[Receiver]) -> usize {
        if !self.seen.insert(item.clone()) {
            return 0;
        }
        self.items.push(item);
        receivers.len()
    }

    fn next_for(&mut self, receiver: Receiver) -> Option<Binding> {
        let cursor = self.cursors.entry(receiver).or_insert(0);
        if *cursor < self.items.len() {
            let item = self.items[*cursor].clone();
            *cursor += 1;
            Some(item)
        } else {
            None
        }
    }

    fn replay_for(&mut self, receiver: Receiver) -> usize {
        let cursor = *self.cursors.entry(receiver).or_insert(0);
        self.items.len() - cursor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::SymbolId;

    fn item(var: &str, value: u64) -> Binding {
        Binding::new().bind(Var::new(var), SymbolId(value))
    }

    #[test]
    fn distinct_pool_drops_duplicates() {
        let mut pool = DistinctReplayPool::new();
        assert_eq!(pool.accept(item("x", 1), &[0]), 1);
        assert_eq!(pool.accept(item("x", 2), &[0]), 1);
        assert_eq!(pool.accept(item("x", 1), &[0]), 0);
        assert_eq!(pool.next_for(0), Some(item("x", 1)));
        assert_eq!(pool.next_for(0), Some(item("x", 2)));
        assert_eq!(pool.next_for(0), None);
    }

    #[test]
    fn distinct_pool_replays_to_late_receivers() {
        let mut pool = DistinctReplayPool::new();
        pool.accept(item("x", 1), &[0]);
        pool.accept(item("x", 2), &[0]);
        assert_eq!(pool.next_for(0), Some(item("x", 1)));

        // A receiver arriving now is owed both items from the start.
        assert_eq!(pool.replay_for(1), 2);
        assert_eq!(pool.next_for(1), Some(item("x", 1)));
        assert_eq!(pool.next_for(1), Some(item("x", 2)));
        assert_eq!(pool.next_for(1), None);
    }

    #[test]
    fn merge_prefix_drops_contradicting_items() {
        let transform = Transform::MergePrefix(item("x", 1));
        assert_eq!(
            transform.apply(&item("y", 2)),
            Some(item("y", 2).bind(Var::new("x"), SymbolId(1)))
        );
        assert_eq!(transform.apply(&item("x", 9)), None);
    }

    #[test]
    fn chain_applies_in_order() {
        let chain = vec![
            Transform::MergePrefix(item("x", 1)),
            Transform::Project(Arc::new(vec![Var::new("x")])),
        ];
        assert_eq!(apply_chain(&chain, item("y", 2)), Some(item("x", 1)));
    }
}
