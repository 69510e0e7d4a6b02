//! Rules, rule sets and atom/head unification.
//!
//! A rule derives its head triple whenever its body conjunction holds. The
//! `Unifier` bridges the variable spaces of a queried atom and a rule head:
//! `unify_bounds` translates the atom's bounds into head bounds before asking
//! the rule controller, and `un_unify` translates derived head answers back
//! into the atom's variables, filtering answers whose constants clash.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{QueryError, SeshatResult};
use crate::pattern::{Binding, Conjunction, SymbolId, Term, TriplePattern, Var};

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// A named derivation rule: `head :- body`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub head: TriplePattern,
    pub body: Conjunction,
}

impl Rule {
    pub fn new(name: impl Into<String>, head: TriplePattern, body: Conjunction) -> Self {
        Self {
            name: name.into(),
            head,
            body,
        }
    }
}

/// A validated collection of rules, shared read-only across the execution.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: Vec<Arc<Rule>>,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a rule, enforcing unique names and range restriction (every head
    /// variable must occur in the body).
    pub fn insert(&mut self, rule: Rule) -> SeshatResult<()> {
        if self.rules.iter().any(|r| r.name == rule.name) {
            return Err(QueryError::DuplicateRule { rule: rule.name }.into());
        }
        if rule.body.atoms.is_empty() {
            return Err(QueryError::EmptyConjunction.into());
        }
        let body_vars = rule.body.vars();
        for var in rule.head.vars() {
            if !body_vars.contains(&var) {
                return Err(QueryError::MalformedRule {
                    rule: rule.name,
                    var: var.name().to_string(),
                }
                .into());
            }
        }
        self.rules.push(Arc::new(rule));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<Rule>> {
        self.rules.iter().find(|r| r.name == name).cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Rules whose head can unify with the given atom, with the unifier that
    /// witnesses it.
    pub fn applicable(&self, atom: &TriplePattern) -> Vec<(Arc<Rule>, Unifier)> {
        self.rules
            .iter()
            .filter_map(|rule| {
                Unifier::between(atom, &rule.head).map(|u| (Arc::clone(rule), u))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unification
// ---------------------------------------------------------------------------

/// Positional unifier between a queried atom and a rule head.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unifier {
    /// Atom variable aligned with a head variable.
    var_pairs: Vec<(Var, Var)>,
    /// Atom variable fixed by a head constant.
    atom_consts: Vec<(Var, SymbolId)>,
    /// Head variable fixed by an atom constant.
    head_consts: Vec<(Var, SymbolId)>,
}

impl Unifier {
    /// Structural unification of the three positions; `None` when two
    /// constants clash, meaning the rule can never derive this atom.
    pub fn between(atom: &TriplePattern, head: &TriplePattern) -> Option<Unifier> {
        let mut unifier = Unifier {
            var_pairs: Vec::new(),
            atom_consts: Vec::new(),
            head_consts: Vec::new(),
        };
        for (a, h) in atom.terms().into_iter().zip(head.terms()) {
            match (a, h) {
                (Term::Var(av), Term::Var(hv)) => {
                    unifier.var_pairs.push((av.clone(), hv.clone()));
                }
                (Term::Var(av), Term::Const(hc)) => {
                    unifier.atom_consts.push((av.clone(), *hc));
                }
                (Term::Const(ac), Term::Var(hv)) => {
                    unifier.head_consts.push((hv.clone(), *ac));
                }
                (Term::Const(ac), Term::Const(hc)) => {
                    if ac != hc {
                        return None;
                    }
                }
            }
        }
        Some(unifier)
    }

    /// Translate atom-space bounds into head-space bounds.
    ///
    /// `None` means the bounds contradict the head (a bound atom variable
    /// clashes with a head constant, or two aligned positions disagree), so
    /// the rule is inapplicable under these bounds.
    pub fn unify_bounds(&self, bounds: &Binding) -> Option<Binding> {
        let mut out = Binding::new();
        for (head_var, value) in &self.head_consts {
            out.try_insert(head_var.clone(), *value)?;
        }
        for (atom_var, head_var) in &self.var_pairs {
            if let Some(value) = bounds.get(atom_var) {
                out.try_insert(head_var.clone(), value)?;
            }
        }
        for (atom_var, value) in &self.atom_consts {
            if let Some(bound) = bounds.get(atom_var)
                && bound != *value
            {
                return None;
            }
        }
        Some(out)
    }

    /// Translate a head-space answer back into atom-space.
    ///
    /// `None` filters answers that cannot ground this atom (an aligned head
    /// variable is missing, disagrees across duplicate positions, or a head
    /// constant position came back with the wrong symbol).
    pub fn un_unify(&self, answer: &Binding) -> Option<Binding> {
        let mut out = Binding::new();
        for (atom_var, head_var) in &self.var_pairs {
            let value = answer.get(head_var)?;
            out.try_insert(atom_var.clone(), value)?;
        }
        for (atom_var, value) in &self.atom_consts {
            out.try_insert(atom_var.clone(), *value)?;
        }
        for (head_var, value) in &self.head_consts {
            if let Some(answered) = answer.get(head_var)
                && answered != *value
            {
                return None;
            }
        }
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sym(id: u64) -> SymbolId {
        SymbolId(id)
    }

    fn parent_head() -> TriplePattern {
        // ($a, ancestor-of, $b)
        TriplePattern::new(Term::var("a"), Term::constant(sym(10)), Term::var("b"))
    }

    #[test]
    fn rule_set_rejects_unbound_head_vars() {
        let mut rules = RuleSet::new();
        let bad = Rule::new(
            "bad",
            TriplePattern::new(Term::var("x"), Term::constant(sym(1)), Term::var("z")),
            Conjunction::new(vec![TriplePattern::new(
                Term::var("x"),
                Term::constant(sym(2)),
                Term::var("y"),
            )]),
        );
        let err = rules.insert(bad).unwrap_err();
        assert!(matches!(
            err,
            crate::error::SeshatError::Query(QueryError::MalformedRule { .. })
        ));
    }

    #[test]
    fn rule_set_rejects_duplicate_names() {
        let mut rules = RuleSet::new();
        let rule = Rule::new(
            "r",
            parent_head(),
            Conjunction::new(vec![TriplePattern::new(
                Term::var("a"),
                Term::constant(sym(11)),
                Term::var("b"),
            )]),
        );
        rules.insert(rule.clone()).unwrap();
        assert!(rules.insert(rule).is_err());
    }

    #[test]
    fn unify_bounds_translates_atom_bounds_to_head_space() {
        // Atom ($x, ancestor-of, $y) with $x bound.
        let atom =
            TriplePattern::new(Term::var("x"), Term::constant(sym(10)), Term::var("y"));
        let unifier = Unifier::between(&atom, &parent_head()).unwrap();
        let bounds = Binding::new().bind(Var::new("x"), sym(42));
        let head_bounds = unifier.unify_bounds(&bounds).unwrap();
        assert_eq!(head_bounds.get(&Var::new("a")), Some(sym(42)));
        assert_eq!(head_bounds.get(&Var::new("b")), None);
    }

    #[test]
    fn un_unify_maps_head_answers_back_and_filters_clashes() {
        // Atom with a constant subject: (alice, ancestor-of, $y).
        let atom = TriplePattern::new(
            Term::constant(sym(1)),
            Term::constant(sym(10)),
            Term::var("y"),
        );
        let unifier = Unifier::between(&atom, &parent_head()).unwrap();

        let good = Binding::new()
            .bind(Var::new("a"), sym(1))
            .bind(Var::new("b"), sym(2));
        let back = unifier.un_unify(&good).unwrap();
        assert_eq!(back.get(&Var::new("y")), Some(sym(2)));

        // Head answer about a different subject is filtered out.
        let clash = Binding::new()
            .bind(Var::new("a"), sym(9))
            .bind(Var::new("b"), sym(2));
        assert!(unifier.un_unify(&clash).is_none());
    }

    #[test]
    fn constant_clash_means_no_unifier() {
        let atom = TriplePattern::new(
            Term::var("x"),
            Term::constant(sym(99)),
            Term::var("y"),
        );
        assert!(Unifier::between(&atom, &parent_head()).is_none());
    }

    #[test]
    fn repeated_atom_var_requires_agreeing_head_values() {
        // ($x, rel, $x) against ($a, rel, $b): answers with a != b are dropped.
        let atom =
            TriplePattern::new(Term::var("x"), Term::constant(sym(10)), Term::var("x"));
        let unifier = Unifier::between(&atom, &parent_head()).unwrap();
        let diverging = Binding::new()
            .bind(Var::new("a"), sym(1))
            .bind(Var::new("b"), sym(2));
        assert!(unifier.un_unify(&diverging).is_none());
        let agreeing = Binding::new()
            .bind(Var::new("a"), sym(3))
            .bind(Var::new("b"), sym(3));
        assert_eq!(
            unifier.un_unify(&agreeing).unwrap().get(&Var::new("x")),
            Some(sym(3))
        );
    }
}
