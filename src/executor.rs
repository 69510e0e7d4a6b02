//! Public query execution surface: `Reasoner` and `AnswerStream`.
//!
//! `Reasoner::execute` assembles a fresh actor network (registry, monitor,
//! root controller) and returns an `AnswerStream`. The stream is the
//! consumer's end of the pull chain: every `next()` sends one pull to the
//! root processor and waits for exactly one of answer, done or failure.
//! Nothing anywhere in the network computes ahead of these pulls.
//!
//! Must be used inside a tokio runtime; the actors are tokio tasks.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::actor::Driver;
use crate::controller::RootSpec;
use crate::error::{QueryError, SeshatError, SeshatResult};
use crate::graph::KnowledgeGraph;
use crate::pattern::{Binding, Conjunction, Disjunction, Var, validate_selection};
use crate::processor::{Processor, RootMessage};
use crate::registry::ControllerRegistry;
use crate::rule::RuleSet;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Per-query options.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Project answers onto these variables; `None` keeps all query variables.
    pub select: Option<Vec<Var>>,
}

// ---------------------------------------------------------------------------
// Reasoner
// ---------------------------------------------------------------------------

/// Entry point binding a knowledge graph and a rule set.
pub struct Reasoner {
    store: Arc<KnowledgeGraph>,
    rules: Arc<RuleSet>,
}

impl Reasoner {
    pub fn new(store: KnowledgeGraph, rules: RuleSet) -> Self {
        Self {
            store: Arc::new(store),
            rules: Arc::new(rules),
        }
    }

    /// The shared store (useful for inspecting traversal counts).
    pub fn store(&self) -> &Arc<KnowledgeGraph> {
        &self.store
    }

    /// Execute a conjunctive query under the given bounds.
    pub fn execute(
        &self,
        query: Conjunction,
        bounds: Binding,
        options: QueryOptions,
    ) -> SeshatResult<AnswerStream> {
        if query.atoms.is_empty() {
            return Err(QueryError::EmptyConjunction.into());
        }
        if let Some(select) = &options.select {
            validate_selection(select, &query.vars())?;
        }
        let registry = ControllerRegistry::new(Arc::clone(&self.store), Arc::clone(&self.rules));
        let (stream, root_spec) = AnswerStream::new(Arc::clone(&registry), options);
        tracing::info!(query = %query, bounds = %bounds, "executing conjunction");
        registry.root_conjunction(Arc::new(query), bounds, root_spec);
        Ok(stream)
    }

    /// Execute a disjunctive query under the given bounds.
    pub fn execute_disjunction(
        &self,
        query: Disjunction,
        bounds: Binding,
        options: QueryOptions,
    ) -> SeshatResult<AnswerStream> {
        if query.branches.is_empty() {
            return Err(QueryError::EmptyDisjunction.into());
        }
        if query.branches.iter().any(|b| b.atoms.is_empty()) {
            return Err(QueryError::EmptyConjunction.into());
        }
        if let Some(select) = &options.select {
            validate_selection(select, &query.vars())?;
        }
        let registry = ControllerRegistry::new(Arc::clone(&self.store), Arc::clone(&self.rules));
        let (stream, root_spec) = AnswerStream::new(Arc::clone(&registry), options);
        tracing::info!(branches = query.branches.len(), bounds = %bounds, "executing disjunction");
        registry.root_disjunction(Arc::new(query), bounds, root_spec);
        Ok(stream)
    }
}

// ---------------------------------------------------------------------------
// Answer stream
// ---------------------------------------------------------------------------

enum RootState {
    /// Waiting for the root controller to create its processor.
    Pending(oneshot::Receiver<Driver<Processor>>),
    Ready(Driver<Processor>),
    Gone,
}

/// Pull-based stream of query answers.
///
/// Yields answers one per `next()`, then `None` after the execution's done
/// signal, or a single `Err` if the execution failed. Dropping the stream
/// (or calling [`close`](AnswerStream::close)) tears the actor network down.
pub struct AnswerStream {
    registry: Arc<ControllerRegistry>,
    rx: mpsc::UnboundedReceiver<RootMessage>,
    root: RootState,
    finished: bool,
}

impl AnswerStream {
    fn new(registry: Arc<ControllerRegistry>, options: QueryOptions) -> (Self, RootSpec) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (driver_tx, driver_rx) = oneshot::channel();
        let spec = RootSpec {
            tx,
            filter: options.select.map(Arc::new),
            driver_tx,
        };
        let stream = Self {
            registry,
            rx,
            root: RootState::Pending(driver_rx),
            finished: false,
        };
        (stream, spec)
    }

    async fn root_driver(&mut self) -> Option<Driver<Processor>> {
        loop {
            match &self.root {
                RootState::Ready(driver) => return Some(driver.clone()),
                RootState::Gone => return None,
                RootState::Pending(_) => {
                    let RootState::Pending(rx) = std::mem::replace(&mut self.root, RootState::Gone)
                    else {
                        unreachable!("state checked above");
                    };
                    match rx.await {
                        Ok(driver) => self.root = RootState::Ready(driver),
                        // Root never created: the execution died during setup.
                        Err(_) => return None,
                    }
                }
            }
        }
    }

    /// Pull one answer. Backpressure is end to end: nothing is computed
    /// without this call.
    pub async fn next(&mut self) -> Option<Result<Binding, SeshatError>> {
        if self.finished {
            return None;
        }
        let Some(root) = self.root_driver().await else {
            self.finished = true;
            let cause = self
                .registry
                .cause()
                .map(|c| (*c).clone())
                .unwrap_or(SeshatError::Cancelled);
            return Some(Err(cause));
        };
        root.execute(|p| p.root_pull());
        match self.rx.recv().await {
            Some(RootMessage::Answer(binding)) => Some(Ok(binding)),
            Some(RootMessage::Done) => {
                self.finished = true;
                self.registry.terminate(None);
                None
            }
            Some(RootMessage::Failed(error)) => {
                self.finished = true;
                Some(Err(error))
            }
            None => {
                self.finished = true;
                self.registry.cause().map(|c| Err((*c).clone()))
            }
        }
    }

    /// Collect every remaining answer; fails on the first execution error.
    pub async fn collect_all(&mut self) -> SeshatResult<Vec<Binding>> {
        let mut answers = Vec::new();
        while let Some(result) = self.next().await {
            answers.push(result?);
        }
        Ok(answers)
    }

    /// Explicit early teardown; cancels the execution if still running.
    pub fn close(&mut self) {
        if !self.finished {
            self.finished = true;
            self.registry
                .terminate(Some(Arc::new(SeshatError::Cancelled)));
        }
    }
}

impl Drop for AnswerStream {
    fn drop(&mut self) {
        let cause = if self.finished {
            None
        } else {
            Some(Arc::new(SeshatError::Cancelled))
        };
        // Idempotent: stops every actor still alive for this execution.
        self.registry.terminate(cause);
    }
}
