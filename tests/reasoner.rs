//! End-to-end reasoner tests: full actor executions over small stores.
//!
//! Every async test is wrapped in a timeout so a termination-detection bug
//! shows up as a failure instead of a hung suite.

use std::collections::HashSet;
use std::time::Duration;

use seshat::error::{QueryError, SeshatError};
use seshat::executor::{AnswerStream, QueryOptions, Reasoner};
use seshat::graph::{KnowledgeGraph, Triple};
use seshat::pattern::{Binding, Conjunction, Disjunction, SymbolId, Term, TriplePattern, Var};
use seshat::rule::{Rule, RuleSet};

const PARENT: u64 = 100;
const LIKES: u64 = 101;
const ANCESTOR: u64 = 102;
const GRANDPARENT: u64 = 103;

const ALICE: u64 = 1;
const BOB: u64 = 2;
const CAROL: u64 = 3;
const DAVE: u64 = 4;

fn sym(id: u64) -> SymbolId {
    SymbolId(id)
}

fn var(name: &str) -> Var {
    Var::new(name)
}

fn atom(subject: Term, predicate: u64, object: Term) -> TriplePattern {
    TriplePattern::new(subject, Term::constant(sym(predicate)), object)
}

fn family_store() -> KnowledgeGraph {
    let mut store = KnowledgeGraph::new();
    store.insert(Triple::new(sym(ALICE), sym(PARENT), sym(BOB)));
    store.insert(Triple::new(sym(BOB), sym(PARENT), sym(CAROL)));
    store.insert(Triple::new(sym(ALICE), sym(LIKES), sym(CAROL)));
    store
}

async fn drain(stream: &mut AnswerStream) -> Vec<Binding> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect_all())
        .await
        .expect("query hung")
        .expect("query failed")
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Plain retrieval
// ---------------------------------------------------------------------------

#[tokio::test]
async fn single_atom_query_enumerates_matches() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    let expected: HashSet<Binding> = [
        Binding::new()
            .bind(var("x"), sym(ALICE))
            .bind(var("y"), sym(BOB)),
        Binding::new()
            .bind(var("x"), sym(BOB))
            .bind(var("y"), sym(CAROL)),
    ]
    .into_iter()
    .collect();
    assert_eq!(answers.into_iter().collect::<HashSet<_>>(), expected);
}

#[tokio::test]
async fn bounds_restrict_the_enumeration() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]);
    let bounds = Binding::new().bind(var("x"), sym(ALICE));
    let mut stream = reasoner
        .execute(query, bounds, QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].get(&var("y")), Some(sym(BOB)));
}

#[tokio::test]
async fn two_atom_join_chains_bindings() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    // (x parent y), (y parent z): grandparent by joining.
    let query = Conjunction::new(vec![
        atom(Term::var("x"), PARENT, Term::var("y")),
        atom(Term::var("y"), PARENT, Term::var("z")),
    ]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].get(&var("x")), Some(sym(ALICE)));
    assert_eq!(answers[0].get(&var("z")), Some(sym(CAROL)));
}

#[tokio::test]
async fn join_with_empty_final_stage_terminates() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    // Stage one yields prefixes, but no prefix finds a match in stage two;
    // the execution must still drain to a clean done signal.
    let query = Conjunction::new(vec![
        atom(Term::var("x"), PARENT, Term::var("y")),
        atom(Term::var("y"), LIKES, Term::var("z")),
    ]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert!(answers.is_empty());
}

#[tokio::test]
async fn empty_result_terminates_cleanly() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), 999, Term::var("y"))]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert!(answers.is_empty());
    // The stream stays settled after done.
    assert!(stream.next().await.is_none());
}

// ---------------------------------------------------------------------------
// Projection
// ---------------------------------------------------------------------------

#[tokio::test]
async fn select_projects_and_deduplicates() {
    init_tracing();
    let mut store = family_store();
    // A second middle generation: two derivations of (alice, carol).
    store.insert(Triple::new(sym(ALICE), sym(PARENT), sym(DAVE)));
    store.insert(Triple::new(sym(DAVE), sym(PARENT), sym(CAROL)));
    let reasoner = Reasoner::new(store, RuleSet::new());
    let query = Conjunction::new(vec![
        atom(Term::var("x"), PARENT, Term::var("y")),
        atom(Term::var("y"), PARENT, Term::var("z")),
    ]);
    let options = QueryOptions {
        select: Some(vec![var("x"), var("z")]),
    };
    let mut stream = reasoner.execute(query, Binding::new(), options).unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(
        answers,
        vec![
            Binding::new()
                .bind(var("x"), sym(ALICE))
                .bind(var("z"), sym(CAROL))
        ]
    );
}

#[tokio::test]
async fn unknown_select_var_is_rejected_up_front() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]);
    let options = QueryOptions {
        select: Some(vec![var("nope")]),
    };
    let err = reasoner
        .execute(query, Binding::new(), options)
        .err()
        .expect("validation should fail");
    assert!(matches!(
        err,
        SeshatError::Query(QueryError::UnknownSelectVar { .. })
    ));
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

fn grandparent_rules() -> RuleSet {
    let mut rules = RuleSet::new();
    rules
        .insert(Rule::new(
            "grandparent",
            atom(Term::var("x"), GRANDPARENT, Term::var("z")),
            Conjunction::new(vec![
                atom(Term::var("x"), PARENT, Term::var("y")),
                atom(Term::var("y"), PARENT, Term::var("z")),
            ]),
        ))
        .unwrap();
    rules
}

fn ancestor_rules() -> RuleSet {
    let mut rules = RuleSet::new();
    rules
        .insert(Rule::new(
            "ancestor-base",
            atom(Term::var("x"), ANCESTOR, Term::var("y")),
            Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]),
        ))
        .unwrap();
    rules
        .insert(Rule::new(
            "ancestor-step",
            atom(Term::var("x"), ANCESTOR, Term::var("z")),
            Conjunction::new(vec![
                atom(Term::var("x"), PARENT, Term::var("y")),
                atom(Term::var("y"), ANCESTOR, Term::var("z")),
            ]),
        ))
        .unwrap();
    rules
}

#[tokio::test]
async fn rule_derives_answers_absent_from_the_store() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), grandparent_rules());
    let query = Conjunction::new(vec![atom(Term::var("a"), GRANDPARENT, Term::var("b"))]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].get(&var("a")), Some(sym(ALICE)));
    assert_eq!(answers[0].get(&var("b")), Some(sym(CAROL)));
}

#[tokio::test]
async fn recursive_rules_terminate_on_cyclic_data() {
    init_tracing();
    let mut store = KnowledgeGraph::new();
    // A parent cycle: alice -> bob -> carol -> alice.
    store.insert(Triple::new(sym(ALICE), sym(PARENT), sym(BOB)));
    store.insert(Triple::new(sym(BOB), sym(PARENT), sym(CAROL)));
    store.insert(Triple::new(sym(CAROL), sym(PARENT), sym(ALICE)));
    let reasoner = Reasoner::new(store, ancestor_rules());
    let query = Conjunction::new(vec![atom(Term::var("a"), ANCESTOR, Term::var("b"))]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    // On a 3-cycle everyone is an ancestor of everyone, including themselves.
    assert_eq!(answers.len(), 9);
    let distinct: HashSet<_> = answers.into_iter().collect();
    assert_eq!(distinct.len(), 9);
}

#[tokio::test]
async fn bound_recursive_query_stays_restricted() {
    init_tracing();
    let mut store = KnowledgeGraph::new();
    store.insert(Triple::new(sym(ALICE), sym(PARENT), sym(BOB)));
    store.insert(Triple::new(sym(BOB), sym(PARENT), sym(CAROL)));
    let reasoner = Reasoner::new(store, ancestor_rules());
    let query = Conjunction::new(vec![atom(Term::var("a"), ANCESTOR, Term::var("b"))]);
    let bounds = Binding::new().bind(var("a"), sym(BOB));
    let mut stream = reasoner
        .execute(query, bounds, QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].get(&var("b")), Some(sym(CAROL)));
}

#[test]
fn malformed_rule_is_rejected_at_insert() {
    let mut rules = RuleSet::new();
    let err = rules
        .insert(Rule::new(
            "unground",
            atom(Term::var("x"), ANCESTOR, Term::var("z")),
            Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]),
        ))
        .unwrap_err();
    assert!(matches!(
        err,
        SeshatError::Query(QueryError::MalformedRule { .. })
    ));
}

// ---------------------------------------------------------------------------
// Memoisation and backpressure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn equal_bounds_share_one_traversal() {
    init_tracing();
    let mut store = KnowledgeGraph::new();
    store.insert(Triple::new(sym(ALICE), sym(PARENT), sym(BOB)));
    store.insert(Triple::new(sym(CAROL), sym(PARENT), sym(DAVE)));
    let reasoner = Reasoner::new(store, RuleSet::new());
    // Stage two is independent of stage one, so both stage-one prefixes
    // request the same (pattern, empty-bounds) processor.
    let query = Conjunction::new(vec![
        atom(Term::var("x"), PARENT, Term::var("y")),
        atom(Term::var("z"), PARENT, Term::var("w")),
    ]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 4);
    // One traversal per distinct (pattern, bounds), not per prefix.
    assert_eq!(reasoner.store().traversals(), 2);
}

#[tokio::test]
async fn no_pull_means_no_traversal() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]);
    let stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    // Give setup messages time to run; without a pull no cursor may open.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reasoner.store().traversals(), 0);
    drop(stream);
}

// ---------------------------------------------------------------------------
// Disjunction
// ---------------------------------------------------------------------------

#[tokio::test]
async fn disjunction_unions_branch_answers() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Disjunction::new(vec![
        Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]),
        Conjunction::new(vec![atom(Term::var("x"), LIKES, Term::var("y"))]),
    ]);
    let mut stream = reasoner
        .execute_disjunction(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let answers = drain(&mut stream).await;
    assert_eq!(answers.len(), 3);
}

// ---------------------------------------------------------------------------
// Validation and teardown
// ---------------------------------------------------------------------------

#[tokio::test]
async fn empty_conjunction_is_rejected() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let err = reasoner
        .execute(Conjunction::new(vec![]), Binding::new(), QueryOptions::default())
        .err()
        .expect("empty query should fail");
    assert!(matches!(
        err,
        SeshatError::Query(QueryError::EmptyConjunction)
    ));
}

#[tokio::test]
async fn close_cancels_a_running_execution() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), RuleSet::new());
    let query = Conjunction::new(vec![atom(Term::var("x"), PARENT, Term::var("y"))]);
    let mut stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    let first = tokio::time::timeout(Duration::from_secs(10), stream.next())
        .await
        .expect("query hung")
        .expect("one answer expected");
    assert!(first.is_ok());
    stream.close();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn dropping_the_stream_mid_execution_does_not_hang() {
    init_tracing();
    let reasoner = Reasoner::new(family_store(), grandparent_rules());
    let query = Conjunction::new(vec![atom(Term::var("a"), GRANDPARENT, Term::var("b"))]);
    let stream = reasoner
        .execute(query, Binding::new(), QueryOptions::default())
        .unwrap();
    drop(stream);
    // Teardown is asynchronous; a short breath lets the actors stop.
    tokio::time::sleep(Duration::from_millis(50)).await;
}
