//! Execution-wide controller registry and terminate broadcast.
//!
//! One registry per query execution. It memoises controllers by pattern
//! (dashmap, since resolution happens concurrently from many controller
//! actors), hands out the shared store/rule-set/monitor context, and keeps a
//! roster of every actor spawned for the execution so a single `terminate`
//! reaches them all, exactly once.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;

use crate::actor::{self, Driver};
use crate::connection::ProviderRef;
use crate::controller::{Controller, ControllerSpec, RootSpec};
use crate::error::{ControlError, SeshatResult, TerminationCause};
use crate::graph::KnowledgeGraph;
use crate::monitor::Monitor;
use crate::pattern::{Binding, Conjunction, Disjunction, TriplePattern};
use crate::processor::Processor;
use crate::rule::RuleSet;

// ---------------------------------------------------------------------------
// Terminate fan-out
// ---------------------------------------------------------------------------

/// Anything the registry can send a terminate to.
pub(crate) trait Addressable: Send + Sync {
    fn send_terminate(&self, cause: Option<TerminationCause>);
}

impl Addressable for Driver<Processor> {
    fn send_terminate(&self, cause: Option<TerminationCause>) {
        self.execute(move |p| p.terminate(cause));
    }
}

impl Addressable for Driver<Controller> {
    fn send_terminate(&self, cause: Option<TerminationCause>) {
        self.execute(move |c| c.terminate(cause));
    }
}

impl Addressable for Driver<Monitor> {
    fn send_terminate(&self, _cause: Option<TerminationCause>) {
        self.execute(|m| m.terminate());
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

pub struct ControllerRegistry {
    store: Arc<KnowledgeGraph>,
    rules: Arc<RuleSet>,
    monitor: Driver<Monitor>,
    atoms: DashMap<TriplePattern, Driver<Controller>>,
    conjunctions: DashMap<Conjunction, Driver<Controller>>,
    rule_controllers: DashMap<String, Driver<Controller>>,
    /// Every actor of the execution; pushes and the terminate broadcast are
    /// serialised by this lock so no actor misses the broadcast.
    tracked: Mutex<Vec<Box<dyn Addressable>>>,
    terminated: AtomicBool,
    cause: Mutex<Option<TerminationCause>>,
}

impl ControllerRegistry {
    /// Spawn the monitor and assemble the per-execution context. Must be
    /// called inside a tokio runtime.
    pub(crate) fn new(store: Arc<KnowledgeGraph>, rules: Arc<RuleSet>) -> Arc<Self> {
        let monitor = actor::spawn(|_| Monitor::new());
        Arc::new(Self {
            store,
            rules,
            monitor: monitor.clone(),
            atoms: DashMap::new(),
            conjunctions: DashMap::new(),
            rule_controllers: DashMap::new(),
            tracked: Mutex::new(vec![Box::new(monitor)]),
            terminated: AtomicBool::new(false),
            cause: Mutex::new(None),
        })
    }

    pub(crate) fn store(&self) -> Arc<KnowledgeGraph> {
        Arc::clone(&self.store)
    }

    pub(crate) fn rules(&self) -> Arc<RuleSet> {
        Arc::clone(&self.rules)
    }

    pub(crate) fn monitor(&self) -> &Driver<Monitor> {
        &self.monitor
    }

    // -- controller resolution ---------------------------------------------

    /// Controller for a provider pattern, created on first use.
    pub(crate) fn resolve(
        self: &Arc<Self>,
        provider: ProviderRef,
    ) -> SeshatResult<Driver<Controller>> {
        if self.is_terminated() {
            return Err(ControlError::RequestAfterTermination {
                provider: provider.to_string(),
            }
            .into());
        }
        let controller = match provider {
            ProviderRef::Atom(pattern) => self
                .atoms
                .entry(pattern.clone())
                .or_insert_with(|| self.spawn_controller(ControllerSpec::Atom(pattern), None))
                .clone(),
            ProviderRef::Conjunction(conj) => self
                .conjunctions
                .entry(conj.clone())
                .or_insert_with(|| {
                    self.spawn_controller(ControllerSpec::Conjunction(Arc::new(conj)), None)
                })
                .clone(),
            ProviderRef::Rule(name) => {
                let rule = self
                    .rules
                    .get(&name)
                    .ok_or(ControlError::UnknownRule { rule: name.clone() })?;
                self.rule_controllers
                    .entry(name)
                    .or_insert_with(|| self.spawn_controller(ControllerSpec::Rule(rule), None))
                    .clone()
            }
        };
        Ok(controller)
    }

    /// Spawn the root conjunction controller and kick off its processor.
    pub(crate) fn root_conjunction(
        self: &Arc<Self>,
        conj: Arc<Conjunction>,
        bounds: Binding,
        root: RootSpec,
    ) {
        let controller = self.spawn_controller(ControllerSpec::Conjunction(conj), Some(root));
        controller.execute(move |c| c.initialise(bounds));
    }

    /// Spawn the root disjunction controller and kick off its processor.
    pub(crate) fn root_disjunction(
        self: &Arc<Self>,
        disj: Arc<Disjunction>,
        bounds: Binding,
        root: RootSpec,
    ) {
        let controller = self.spawn_controller(ControllerSpec::Disjunction(disj), Some(root));
        controller.execute(move |c| c.initialise(bounds));
    }

    fn spawn_controller(
        self: &Arc<Self>,
        spec: ControllerSpec,
        root: Option<RootSpec>,
    ) -> Driver<Controller> {
        let registry = Arc::clone(self);
        let controller = actor::spawn(move |driver| Controller::new(driver, registry, spec, root));
        self.track(Box::new(controller.clone()));
        controller
    }

    // -- lifecycle ----------------------------------------------------------

    /// Enrol an actor in the terminate broadcast. Actors enrolled after
    /// termination are terminated immediately instead.
    pub(crate) fn track(&self, target: Box<dyn Addressable>) {
        let mut tracked = self.tracked.lock().expect("registry roster poisoned");
        if self.terminated.load(Ordering::SeqCst) {
            target.send_terminate(self.cause());
            return;
        }
        tracked.push(target);
    }

    /// Terminate every actor of the execution, exactly once. `None` is a
    /// clean teardown; `Some` carries a failure to the consumer.
    pub fn terminate(&self, cause: Option<TerminationCause>) {
        let tracked = self.tracked.lock().expect("registry roster poisoned");
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.cause.lock().expect("registry cause poisoned") = cause.clone();
        for target in tracked.iter() {
            target.send_terminate(cause.clone());
        }
        tracing::debug!(actors = tracked.len(), failed = cause.is_some(), "execution torn down");
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn cause(&self) -> Option<TerminationCause> {
        self.cause.lock().expect("registry cause poisoned").clone()
    }
}
