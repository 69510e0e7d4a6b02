//! In-memory triple store and the traversal boundary.
//!
//! The reasoner only ever sees the store through `TraversalCursor`, a
//! single-item pull iterator over one atom under fixed bounds. The store keeps
//! per-position indexes so a cursor scans the smallest candidate list, and a
//! traversal counter so callers can observe how many cursors an execution
//! actually opened (the processor memoisation tests depend on it).

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::pattern::{Binding, SymbolId, Term, TriplePattern};

// ---------------------------------------------------------------------------
// Triples
// ---------------------------------------------------------------------------

/// A ground fact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Triple {
    pub subject: SymbolId,
    pub predicate: SymbolId,
    pub object: SymbolId,
}

impl Triple {
    pub fn new(subject: SymbolId, predicate: SymbolId, object: SymbolId) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

/// Indexed in-memory triple store.
///
/// Immutable once execution starts: cursors hold an `Arc` to the store and
/// mutation requires `&mut self`, so the borrow checker enforces the freeze.
#[derive(Debug, Default)]
pub struct KnowledgeGraph {
    triples: Vec<Triple>,
    seen: HashSet<Triple>,
    by_subject: HashMap<SymbolId, Vec<usize>>,
    by_predicate: HashMap<SymbolId, Vec<usize>>,
    by_object: HashMap<SymbolId, Vec<usize>>,
    traversals: AtomicU64,
}

impl KnowledgeGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a triple; returns false if it was already present.
    pub fn insert(&mut self, triple: Triple) -> bool {
        if !self.seen.insert(triple) {
            return false;
        }
        let idx = self.triples.len();
        self.triples.push(triple);
        self.by_subject.entry(triple.subject).or_default().push(idx);
        self.by_predicate
            .entry(triple.predicate)
            .or_default()
            .push(idx);
        self.by_object.entry(triple.object).or_default().push(idx);
        true
    }

    pub fn len(&self) -> usize {
        self.triples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triples.is_empty()
    }

    /// How many traversal cursors have been opened against this store.
    pub fn traversals(&self) -> u64 {
        self.traversals.load(Ordering::Relaxed)
    }

    /// Open a lazy cursor over one atom under the given bounds.
    pub fn cursor(
        self: &Arc<Self>,
        pattern: TriplePattern,
        bounds: Binding,
    ) -> TraversalCursor {
        self.traversals.fetch_add(1, Ordering::Relaxed);
        let candidates = self.candidate_indices(&pattern, &bounds);
        TraversalCursor {
            graph: Arc::clone(self),
            pattern,
            bounds,
            candidates: candidates.into_iter(),
        }
    }

    /// Pick the candidate list from the most selective grounded position.
    fn candidate_indices(&self, pattern: &TriplePattern, bounds: &Binding) -> Vec<usize> {
        let resolve = |term: &Term| -> Option<SymbolId> {
            match term {
                Term::Const(c) => Some(*c),
                Term::Var(v) => bounds.get(v),
            }
        };
        let lists = [
            resolve(&pattern.subject).map(|s| self.by_subject.get(&s)),
            resolve(&pattern.predicate).map(|p| self.by_predicate.get(&p)),
            resolve(&pattern.object).map(|o| self.by_object.get(&o)),
        ];
        let mut best: Option<&Vec<usize>> = None;
        for list in lists.into_iter().flatten() {
            // A grounded position with no index entry matches nothing.
            let Some(list) = list else {
                return Vec::new();
            };
            if best.is_none_or(|b| list.len() < b.len()) {
                best = Some(list);
            }
        }
        match best {
            Some(list) => list.clone(),
            None => (0..self.triples.len()).collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Single-item pull iterator over one atom's matches.
///
/// Each `next()` scans forward to the next matching triple; no result is
/// materialised ahead of demand.
pub struct TraversalCursor {
    graph: Arc<KnowledgeGraph>,
    pattern: TriplePattern,
    bounds: Binding,
    candidates: std::vec::IntoIter<usize>,
}

impl TraversalCursor {
    /// Match one triple against the pattern and bounds, producing the
    /// binding over the pattern's variables.
    fn match_triple(&self, triple: &Triple) -> Option<Binding> {
        let positions = [
            (&self.pattern.subject, triple.subject),
            (&self.pattern.predicate, triple.predicate),
            (&self.pattern.object, triple.object),
        ];
        let mut out = Binding::new();
        for (term, value) in positions {
            match term {
                Term::Const(c) => {
                    if *c != value {
                        return None;
                    }
                }
                Term::Var(v) => {
                    if let Some(bound) = self.bounds.get(v)
                        && bound != value
                    {
                        return None;
                    }
                    out.try_insert(v.clone(), value)?;
                }
            }
        }
        Some(out)
    }
}

impl Iterator for TraversalCursor {
    type Item = Binding;

    fn next(&mut self) -> Option<Binding> {
        while let Some(idx) = self.candidates.next() {
            let triple = self.graph.triples[idx];
            if let Some(binding) = self.match_triple(&triple) {
                return Some(binding);
            }
        }
        None
    }
}
