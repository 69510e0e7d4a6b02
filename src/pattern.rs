//! Query data model: variables, terms, triple patterns, conjunctions and
//! bindings.
//!
//! `Binding` doubles as the `Bounds` memoisation key: it is an ordered map with
//! value equality and hashing, so two requests that constrain the same
//! variables to the same symbols share one processor.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, SeshatResult};

// ---------------------------------------------------------------------------
// Symbols, variables, terms
// ---------------------------------------------------------------------------

/// Opaque identifier of a graph symbol (entity or relation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SymbolId(pub u64);

impl fmt::Display for SymbolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A named query variable.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Var(String);

impl Var {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Var {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.0)
    }
}

/// One position of a triple pattern: either a variable or a constant symbol.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Term {
    Var(Var),
    Const(SymbolId),
}

impl Term {
    pub fn var(name: impl Into<String>) -> Self {
        Term::Var(Var::new(name))
    }

    pub fn constant(id: SymbolId) -> Self {
        Term::Const(id)
    }

    pub fn as_var(&self) -> Option<&Var> {
        match self {
            Term::Var(v) => Some(v),
            Term::Const(_) => None,
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(v) => v.fmt(f),
            Term::Const(c) => c.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// Patterns
// ---------------------------------------------------------------------------

/// An atomic constraint over the knowledge graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TriplePattern {
    pub subject: Term,
    pub predicate: Term,
    pub object: Term,
}

impl TriplePattern {
    pub fn new(subject: Term, predicate: Term, object: Term) -> Self {
        Self {
            subject,
            predicate,
            object,
        }
    }

    /// The three positions in subject, predicate, object order.
    pub fn terms(&self) -> [&Term; 3] {
        [&self.subject, &self.predicate, &self.object]
    }

    /// Distinct variables of the pattern, in position order.
    pub fn vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for term in self.terms() {
            if let Term::Var(v) = term
                && !out.contains(v)
            {
                out.push(v.clone());
            }
        }
        out
    }
}

impl fmt::Display for TriplePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.subject, self.predicate, self.object)
    }
}

/// A conjunction of triple patterns, resolved in written order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Conjunction {
    pub atoms: Vec<TriplePattern>,
}

impl Conjunction {
    pub fn new(atoms: Vec<TriplePattern>) -> Self {
        Self { atoms }
    }

    /// Distinct variables across all atoms, in first-occurrence order.
    pub fn vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for atom in &self.atoms {
            for v in atom.vars() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }
}

impl fmt::Display for Conjunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for atom in &self.atoms {
            if !first {
                write!(f, " & ")?;
            }
            atom.fmt(f)?;
            first = false;
        }
        Ok(())
    }
}

/// A disjunction of alternative conjunctions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Disjunction {
    pub branches: Vec<Conjunction>,
}

impl Disjunction {
    pub fn new(branches: Vec<Conjunction>) -> Self {
        Self { branches }
    }

    /// Union of branch variables, in first-occurrence order.
    pub fn vars(&self) -> Vec<Var> {
        let mut out = Vec::new();
        for branch in &self.branches {
            for v in branch.vars() {
                if !out.contains(&v) {
                    out.push(v);
                }
            }
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Bindings
// ---------------------------------------------------------------------------

/// A partial assignment of variables to symbols.
///
/// Ordered map representation gives deterministic iteration, value equality
/// and hashing, which is what lets a `Binding` serve directly as a processor
/// memoisation key.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Binding(BTreeMap<Var, SymbolId>);

/// A `Binding` playing the role of a memoisation key: the variables a
/// downstream consumer has already fixed.
pub type Bounds = Binding;

impl Binding {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert, used heavily in tests.
    pub fn bind(mut self, var: Var, value: SymbolId) -> Self {
        self.0.insert(var, value);
        self
    }

    pub fn get(&self, var: &Var) -> Option<SymbolId> {
        self.0.get(var).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Var, SymbolId)> {
        self.0.iter().map(|(v, s)| (v, *s))
    }

    /// Insert one assignment; `None` on conflict with an existing one.
    pub fn try_insert(&mut self, var: Var, value: SymbolId) -> Option<()> {
        match self.0.get(&var) {
            Some(existing) if *existing != value => None,
            Some(_) => Some(()),
            None => {
                self.0.insert(var, value);
                Some(())
            }
        }
    }

    /// Union of two bindings; `None` if they disagree on a shared variable.
    pub fn merged(&self, other: &Binding) -> Option<Binding> {
        let mut out = self.clone();
        for (var, value) in other.iter() {
            out.try_insert(var.clone(), value)?;
        }
        Some(out)
    }

    /// The sub-binding over the given variables.
    pub fn restricted<'a>(&self, vars: impl IntoIterator<Item = &'a Var>) -> Binding {
        let mut out = Binding::new();
        for var in vars {
            if let Some(value) = self.get(var) {
                out.0.insert(var.clone(), value);
            }
        }
        out
    }

    /// Answer export as a JSON object keyed by variable name.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::Value::Object(
            self.0
                .iter()
                .map(|(v, s)| (v.name().to_string(), serde_json::json!(s.0)))
                .collect(),
        )
    }
}

impl fmt::Display for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for (var, value) in self.iter() {
            if !first {
                write!(f, ", ")?;
            }
            write!(f, "{var}={value}")?;
            first = false;
        }
        write!(f, "}}")
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Check a projection list against the variables a pattern can bind.
pub fn validate_selection(selected: &[Var], available: &[Var]) -> SeshatResult<()> {
    for var in selected {
        if !available.contains(var) {
            return Err(QueryError::UnknownSelectVar {
                var: var.name().to_string(),
            }
            .into());
        }
    }
    Ok(())
}
