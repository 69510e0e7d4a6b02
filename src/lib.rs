//! # seshat
//!
//! A reactive knowledge-graph reasoner: recursive rule resolution as a
//! pull-based actor dataflow.
//!
//! ## Architecture
//!
//! - **Data model** (`pattern`, `rule`, `graph`): triple patterns,
//!   conjunctions, bindings, validated rule sets and an indexed in-memory
//!   triple store behind a lazy traversal cursor
//! - **Reactive primitives** (`reactive`): an arena operator graph with a
//!   strict pull/receive protocol — sources, transforms, pooling streams and
//!   the compound join stream
//! - **Actors** (`actor`, `processor`, `controller`, `registry`): one
//!   processor per (pattern, bounds), memoised by per-pattern controllers;
//!   processors exchange items over explicit connections
//! - **Termination** (`monitor`): distributed quiescence detection turning
//!   exhausted sources and a drained dataflow into a clean done signal
//! - **Execution** (`executor`): `Reasoner` and the pull-based `AnswerStream`
//!
//! ## Library usage
//!
//! ```no_run
//! use seshat::executor::{QueryOptions, Reasoner};
//! use seshat::graph::{KnowledgeGraph, Triple};
//! use seshat::pattern::{Binding, Conjunction, SymbolId, Term, TriplePattern};
//! use seshat::rule::RuleSet;
//!
//! # async fn demo() -> seshat::error::SeshatResult<()> {
//! let mut store = KnowledgeGraph::new();
//! store.insert(Triple::new(SymbolId(1), SymbolId(10), SymbolId(2)));
//!
//! let reasoner = Reasoner::new(store, RuleSet::new());
//! let query = Conjunction::new(vec![TriplePattern::new(
//!     Term::var("x"),
//!     Term::constant(SymbolId(10)),
//!     Term::var("y"),
//! )]);
//! let mut answers = reasoner.execute(query, Binding::new(), QueryOptions::default())?;
//! while let Some(answer) = answers.next().await {
//!     println!("{}", answer?);
//! }
//! # Ok(())
//! # }
//! ```

pub mod actor;
pub mod connection;
pub mod controller;
pub mod error;
pub mod executor;
pub mod graph;
pub mod monitor;
pub mod pattern;
pub mod processor;
pub mod reactive;
pub mod registry;
pub mod rule;
