//! Controller actors: per-pattern processor factories and connection brokers.
//!
//! One controller exists per resolvable pattern (atom, conjunction, rule, or
//! the root disjunction). It owns the bounds -> processor map; because the
//! map is only touched from the controller's own message handlers, each
//! distinct bounds gets exactly one processor and exactly one `set_up`.
//! Controllers also broker the connection handshake: they resolve a request's
//! provider pattern to the provider controller, which normalises the bounds
//! to its own variables and forwards to the memoised processor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::actor::{self, Actor, Driver};
use crate::connection::ConnectionBuilder;
use crate::error::TerminationCause;
use crate::pattern::{Binding, Conjunction, Disjunction, TriplePattern, Var};
use crate::processor::{Processor, Role, RootChannel, RootMessage};
use crate::registry::ControllerRegistry;
use crate::rule::Rule;

/// The pattern a controller resolves.
#[derive(Clone)]
pub(crate) enum ControllerSpec {
    Conjunction(Arc<Conjunction>),
    Disjunction(Arc<Disjunction>),
    Atom(TriplePattern),
    Rule(Arc<Rule>),
}

/// Consumer-facing plumbing handed to the root controller; its first (and
/// only) processor becomes the root processor.
pub(crate) struct RootSpec {
    pub tx: mpsc::UnboundedSender<RootMessage>,
    pub filter: Option<Arc<Vec<Var>>>,
    pub driver_tx: oneshot::Sender<Driver<Processor>>,
}

pub struct Controller {
    driver: Driver<Controller>,
    registry: Arc<ControllerRegistry>,
    spec: ControllerSpec,
    processors: HashMap<Binding, Driver<Processor>>,
    root: Option<RootSpec>,
    stopped: bool,
}

impl Actor for Controller {
    fn name(&self) -> &'static str {
        "controller"
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}

impl Controller {
    pub(crate) fn new(
        driver: Driver<Controller>,
        registry: Arc<ControllerRegistry>,
        spec: ControllerSpec,
        root: Option<RootSpec>,
    ) -> Self {
        Self {
            driver,
            registry,
            spec,
            processors: HashMap::new(),
            root,
            stopped: false,
        }
    }

    /// Kick off the root execution by creating the processor for the query
    /// bounds.
    pub(crate) fn initialise(&mut self, bounds: Binding) {
        if self.stopped {
            return;
        }
        let _ = self.processor_for(bounds);
    }

    /// Resolve a request's provider pattern and forward the builder to the
    /// provider controller.
    pub fn route_connection_request(&mut self, builder: ConnectionBuilder) {
        if self.stopped {
            tracing::trace!("dropping connection request after termination");
            return;
        }
        match self.registry.resolve(builder.provider().clone()) {
            Ok(provider) => {
                provider.execute(move |c| c.establish_connection(builder));
            }
            Err(error) => {
                tracing::error!(error = %error, "connection routing failed");
                self.registry.terminate(Some(Arc::new(error)));
            }
        }
    }

    /// Provider side: normalise the requested bounds to this pattern's own
    /// variables, then hand the builder to the memoised processor.
    pub fn establish_connection(&mut self, builder: ConnectionBuilder) {
        if self.stopped {
            tracing::trace!("rejecting connection after termination");
            return;
        }
        let bounds = self.normalise(builder.bounds());
        let builder = builder.with_bounds(bounds.clone());
        let processor = self.processor_for(bounds);
        processor.execute(move |p| p.accept_connection(builder));
    }

    pub fn terminate(&mut self, _cause: Option<TerminationCause>) {
        // Processors are terminated by the registry broadcast directly.
        self.stopped = true;
    }

    /// Drop bound variables the pattern does not mention, so requests that
    /// differ only in irrelevant bounds share a processor.
    fn normalise(&self, bounds: &Binding) -> Binding {
        let vars = match &self.spec {
            ControllerSpec::Conjunction(conj) => conj.vars(),
            ControllerSpec::Disjunction(disj) => disj.vars(),
            ControllerSpec::Atom(pattern) => pattern.vars(),
            ControllerSpec::Rule(rule) => rule.head.vars(),
        };
        bounds.restricted(vars.iter())
    }

    /// The single atomic check-and-create for (pattern, bounds).
    fn processor_for(&mut self, bounds: Binding) -> Driver<Processor> {
        if let Some(existing) = self.processors.get(&bounds) {
            return existing.clone();
        }

        let role = match &self.spec {
            ControllerSpec::Conjunction(conj) => Role::Conjunction(Arc::clone(conj)),
            ControllerSpec::Disjunction(disj) => Role::Disjunction(Arc::clone(disj)),
            ControllerSpec::Atom(pattern) => Role::Atom(pattern.clone()),
            ControllerSpec::Rule(rule) => Role::Rule(Arc::clone(rule)),
        };
        let (root_channel, driver_tx) = match self.root.take() {
            Some(root) => (
                Some(RootChannel {
                    tx: root.tx,
                    filter: root.filter,
                    done: false,
                }),
                Some(root.driver_tx),
            ),
            None => (None, None),
        };

        let registry = Arc::clone(&self.registry);
        let own = self.driver.clone();
        let route = Box::new(move |builder: ConnectionBuilder| {
            own.execute(move |c| c.route_connection_request(builder));
        });
        let processor_bounds = bounds.clone();
        let processor = actor::spawn(move |driver| {
            Processor::new(driver, route, registry, role, processor_bounds, root_channel)
        });
        processor.execute(|p| p.set_up());
        if let Some(tx) = driver_tx {
            let _ = tx.send(processor.clone());
        }
        self.registry.track(Box::new(processor.clone()));
        tracing::debug!(bounds = %bounds, "processor created");
        self.processors.insert(bounds, processor.clone());
        processor
    }
}
