//! Processor actors: one per (pattern, bounds), each owning a reactive graph.
//!
//! A processor is where the synchronous reactive layer meets the actor world.
//! Its message handlers call into the owned [`Graph`], then execute the
//! returned effects: monitor accounting, pulls and item sends across
//! connections, and compound-stream growth. Any protocol error inside the
//! graph is fatal to the whole execution; the processor reports it to the
//! registry, which terminates every actor and surfaces the cause to the
//! consumer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::actor::{Actor, Driver};
use crate::connection::{Connection, ConnectionBuilder, ConnectionRequest, ProviderRef, RequestId};
use crate::error::{ReactiveError, SeshatError, SeshatResult, TerminationCause};
use crate::pattern::{Binding, Conjunction, Disjunction, TriplePattern, Var};
use crate::reactive::operator::{DistinctReplayPool, Transform};
use crate::reactive::{Effect, Graph, NodeId, ProcessorId, ReactiveId};
use crate::registry::ControllerRegistry;
use crate::rule::Rule;

// ---------------------------------------------------------------------------
// Roles and root plumbing
// ---------------------------------------------------------------------------

/// What this processor resolves.
#[derive(Clone)]
pub(crate) enum Role {
    Conjunction(Arc<Conjunction>),
    Disjunction(Arc<Disjunction>),
    Atom(TriplePattern),
    Rule(Arc<Rule>),
}

/// Messages from the root processor to the consumer's answer stream.
#[derive(Debug)]
pub(crate) enum RootMessage {
    Answer(Binding),
    Done,
    Failed(SeshatError),
}

/// Present only on the root processor: the channel to the consumer plus the
/// optional answer projection.
pub(crate) struct RootChannel {
    pub tx: mpsc::UnboundedSender<RootMessage>,
    pub filter: Option<Arc<Vec<Var>>>,
    pub done: bool,
}

// ---------------------------------------------------------------------------
// Processor
// ---------------------------------------------------------------------------

pub struct Processor {
    driver: Driver<Processor>,
    id: ProcessorId,
    controller_route: Box<dyn Fn(ConnectionBuilder) + Send>,
    registry: Arc<ControllerRegistry>,
    role: Role,
    bounds: Binding,
    graph: Graph,
    hub: Option<NodeId>,
    sink: Option<NodeId>,
    root: Option<RootChannel>,
    inputs: HashMap<NodeId, Connection>,
    outputs: HashMap<NodeId, Connection>,
    requested: HashSet<RequestId>,
    stopped: bool,
}

impl Actor for Processor {
    fn name(&self) -> &'static str {
        "processor"
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}

impl Processor {
    pub(crate) fn new(
        driver: Driver<Processor>,
        controller_route: Box<dyn Fn(ConnectionBuilder) + Send>,
        registry: Arc<ControllerRegistry>,
        role: Role,
        bounds: Binding,
        root: Option<RootChannel>,
    ) -> Self {
        Self {
            driver,
            id: ProcessorId::fresh(),
            controller_route,
            registry,
            role,
            bounds,
            graph: Graph::new(),
            hub: None,
            sink: None,
            root,
            inputs: HashMap::new(),
            outputs: HashMap::new(),
            requested: HashSet::new(),
            stopped: false,
        }
    }

    pub(crate) fn id(&self) -> ProcessorId {
        self.id
    }

    fn rid(&self, node: NodeId) -> ReactiveId {
        ReactiveId {
            processor: self.id,
            node,
        }
    }

    fn hub(&self) -> SeshatResult<NodeId> {
        self.hub.ok_or_else(|| {
            ReactiveError::IllegalState {
                context: "processor used before set_up",
            }
            .into()
        })
    }

    /// Escalate an internal failure to the whole execution.
    fn fail(&mut self, error: SeshatError) {
        tracing::error!(processor = %self.id, error = %error, "processor failed, terminating execution");
        let registry = Arc::clone(&self.registry);
        registry.terminate(Some(Arc::new(error)));
    }

    // -----------------------------------------------------------------------
    // Message handlers
    // -----------------------------------------------------------------------

    /// Build the processor's reactive graph. Sent by the owning controller
    /// immediately after spawn, before any other message.
    pub fn set_up(&mut self) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_set_up() {
            self.fail(error);
        }
    }

    /// The provider half of the handshake: create an output port fed by the
    /// hub, hand the finished connection back to the receiver.
    pub fn accept_connection(&mut self, builder: ConnectionBuilder) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_accept_connection(builder) {
            self.fail(error);
        }
    }

    /// The receiver half: the connection is live, replay any buffered pull.
    pub fn finalise_connection(&mut self, connection: Connection) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_finalise_connection(connection) {
            self.fail(error);
        }
    }

    /// A remote receiver pulled on one of our output ports.
    pub fn endpoint_pull(&mut self, port: NodeId) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_endpoint_pull(port) {
            self.fail(error);
        }
    }

    /// An item arrived over a connection at one of our input ports.
    pub fn endpoint_receive(&mut self, port: NodeId, item: Binding) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_endpoint_receive(port, item) {
            self.fail(error);
        }
    }

    /// The consumer asked for one more answer (root processor only).
    pub fn root_pull(&mut self) {
        if self.stopped {
            return;
        }
        if let Err(error) = self.try_root_pull() {
            self.fail(error);
        }
    }

    /// The monitor detected quiescence; tell the consumer we are done.
    pub fn finished(&mut self) {
        if let Some(root) = &mut self.root {
            root.done = true;
            let _ = root.tx.send(RootMessage::Done);
        }
    }

    /// Stop this actor. A cause is forwarded to the consumer if we are the
    /// root; `None` is clean teardown.
    pub fn terminate(&mut self, cause: Option<TerminationCause>) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        if let (Some(root), Some(cause)) = (&self.root, cause) {
            let _ = root.tx.send(RootMessage::Failed((*cause).clone()));
        }
        tracing::trace!(processor = %self.id, "processor terminated");
    }

    // -----------------------------------------------------------------------
    // Graph construction
    // -----------------------------------------------------------------------

    fn try_set_up(&mut self) -> SeshatResult<()> {
        let mut fx = Vec::new();
        match self.role.clone() {
            Role::Atom(pattern) => self.set_up_atom(pattern, &mut fx)?,
            Role::Rule(rule) => self.set_up_rule(rule, &mut fx)?,
            Role::Conjunction(conj) => self.set_up_conjunction(conj, &mut fx)?,
            Role::Disjunction(disj) => self.set_up_disjunction(disj, &mut fx)?,
        }
        self.apply_effects(fx)
    }

    /// Traversal source plus one input port per rule whose head unifies with
    /// the atom under the current bounds.
    fn set_up_atom(&mut self, pattern: TriplePattern, fx: &mut Vec<Effect>) -> SeshatResult<()> {
        let hub = self.graph.add_pooling(Box::new(DistinctReplayPool::new()));
        self.hub = Some(hub);

        let store = self.registry.store();
        let cursor_pattern = pattern.clone();
        let cursor_bounds = self.bounds.clone();
        let source = self.graph.add_source(Box::new(move || {
            Box::new(store.cursor(cursor_pattern, cursor_bounds))
        }));
        self.graph.register(source, hub, fx)?;
        let terminus = self.rid(source);
        self.registry
            .monitor()
            .execute(move |m| m.register_terminus(terminus));

        for (rule, unifier) in self.registry.rules().applicable(&pattern) {
            let Some(head_bounds) = unifier.unify_bounds(&self.bounds) else {
                // Rule head contradicts the bounds; it cannot contribute.
                continue;
            };
            let port = self.graph.add_input_port();
            self.graph.register(port, hub, fx)?;
            self.request_connection(
                port,
                ProviderRef::Rule(rule.name.clone()),
                head_bounds,
                vec![Transform::UnUnify(Arc::new(unifier))],
            );
        }
        tracing::debug!(processor = %self.id, pattern = %pattern, bounds = %self.bounds, "atom processor ready");
        Ok(())
    }

    /// One input port to the body conjunction, projecting answers onto the
    /// head variables.
    fn set_up_rule(&mut self, rule: Arc<Rule>, fx: &mut Vec<Effect>) -> SeshatResult<()> {
        let hub = self.graph.add_pooling(Box::new(DistinctReplayPool::new()));
        self.hub = Some(hub);

        let head_vars = Arc::new(rule.head.vars());
        let project = self.graph.add_transform(Transform::Project(head_vars));
        let port = self.graph.add_input_port();
        self.graph.register(port, project, fx)?;
        self.graph.register(project, hub, fx)?;
        // Head variables occur in the body, so head bounds apply directly.
        self.request_connection(
            port,
            ProviderRef::Conjunction(rule.body.clone()),
            self.bounds.clone(),
            Vec::new(),
        );
        tracing::debug!(processor = %self.id, rule = %rule.name, bounds = %self.bounds, "rule processor ready");
        Ok(())
    }

    /// Compound stream over the body atoms, fanned into a distinct hub; the
    /// root conjunction additionally projects and bridges to the consumer.
    fn set_up_conjunction(
        &mut self,
        conj: Arc<Conjunction>,
        fx: &mut Vec<Effect>,
    ) -> SeshatResult<()> {
        let hub = self.graph.add_pooling(Box::new(DistinctReplayPool::new()));
        self.hub = Some(hub);

        let compound = self.graph.add_compound(conj.atoms.len());
        match self.root.as_ref().and_then(|r| r.filter.clone()) {
            Some(filter) => {
                let project = self.graph.add_transform(Transform::Project(filter));
                self.graph.register(compound, project, fx)?;
                self.graph.register(project, hub, fx)?;
            }
            None => self.graph.register(compound, hub, fx)?,
        }
        self.attach_root_sink(hub, fx)?;
        self.grow_stage(compound, 0, Binding::new(), fx)?;
        tracing::debug!(processor = %self.id, conjunction = %*conj, bounds = %self.bounds, "conjunction processor ready");
        Ok(())
    }

    /// One input port per branch conjunction, fanned into a distinct hub.
    /// Disjunction processors exist only at the root.
    fn set_up_disjunction(
        &mut self,
        disj: Arc<Disjunction>,
        fx: &mut Vec<Effect>,
    ) -> SeshatResult<()> {
        let hub = self.graph.add_pooling(Box::new(DistinctReplayPool::new()));
        self.hub = Some(hub);

        let filter = self.root.as_ref().and_then(|r| r.filter.clone());
        for branch in &disj.branches {
            let port = self.graph.add_input_port();
            match &filter {
                Some(vars) => {
                    let project = self
                        .graph
                        .add_transform(Transform::Project(Arc::clone(vars)));
                    self.graph.register(port, project, fx)?;
                    self.graph.register(project, hub, fx)?;
                }
                None => self.graph.register(port, hub, fx)?,
            }
            self.request_connection(
                port,
                ProviderRef::Conjunction(branch.clone()),
                self.bounds.clone(),
                Vec::new(),
            );
        }
        self.attach_root_sink(hub, fx)?;
        tracing::debug!(processor = %self.id, branches = disj.branches.len(), "disjunction processor ready");
        Ok(())
    }

    /// Wire the consumer bridge when this processor is the root.
    fn attach_root_sink(&mut self, hub: NodeId, fx: &mut Vec<Effect>) -> SeshatResult<()> {
        if self.root.is_none() {
            return Ok(());
        }
        let sink = self.graph.add_root_sink();
        self.graph.register(hub, sink, fx)?;
        self.sink = Some(sink);
        let driver = self.driver.clone();
        self.registry
            .monitor()
            .execute(move |m| m.register_root(driver));
        Ok(())
    }

    /// Open the input port for `stage` under a prefix binding (compound
    /// stream growth). Returns the merge node feeding the compound, so the
    /// caller can forward outstanding demand to the new stage.
    fn grow_stage(
        &mut self,
        compound: NodeId,
        stage: usize,
        prefix: Binding,
        fx: &mut Vec<Effect>,
    ) -> SeshatResult<NodeId> {
        let Role::Conjunction(conj) = &self.role else {
            return Err(ReactiveError::IllegalState {
                context: "compound growth outside a conjunction processor",
            }
            .into());
        };
        let atom = conj
            .atoms
            .get(stage)
            .ok_or(ReactiveError::IllegalState {
                context: "compound stage out of range",
            })?
            .clone();
        let bounds = self.bounds.merged(&prefix).ok_or(ReactiveError::IllegalState {
            context: "compound prefix contradicts processor bounds",
        })?;

        let port = self.graph.add_input_port();
        let merge = self.graph.add_transform(Transform::MergePrefix(prefix));
        self.graph.register(port, merge, fx)?;
        self.graph
            .register_compound_provider(compound, merge, stage + 1, fx)?;
        self.request_connection(port, ProviderRef::Atom(atom), bounds, Vec::new());
        Ok(merge)
    }

    // -----------------------------------------------------------------------
    // Connections
    // -----------------------------------------------------------------------

    /// Ask the owning controller to broker a connection for `input`.
    ///
    /// Duplicate requests (same port, provider and bounds) are dropped. The
    /// monitor learns of the pending connection before anything else happens,
    /// so it cannot declare quiescence while the provider is setting up.
    fn request_connection(
        &mut self,
        input: NodeId,
        provider: ProviderRef,
        bounds: Binding,
        transforms: Vec<Transform>,
    ) {
        let request = ConnectionRequest {
            input,
            receiver: self.driver.clone(),
            receiver_processor: self.id,
            provider,
            bounds,
            transforms: Vec::new(),
        };
        if !self.requested.insert(request.id()) {
            return;
        }
        let mut builder = ConnectionBuilder::new(request);
        for transform in transforms {
            builder = builder.with_map(transform);
        }
        let pending = self.rid(input);
        self.registry
            .monitor()
            .execute(move |m| m.connection_pending(pending));
        (self.controller_route)(builder);
    }

    fn try_accept_connection(&mut self, builder: ConnectionBuilder) -> SeshatResult<()> {
        let hub = self.hub()?;
        let chain = Arc::new(builder.transforms().to_vec());
        let receiver_input = builder.receiver_input();

        let port = self.graph.add_output_port(chain);
        let mut fx = Vec::new();
        self.graph.register(hub, port, &mut fx)?;

        let connection = builder.build(self.driver.clone(), port);
        self.outputs.insert(port, connection.clone());

        let provider_port = self.rid(port);
        self.registry
            .monitor()
            .execute(move |m| m.register_path(receiver_input, provider_port));

        let finalise = connection.clone();
        connection
            .receiver()
            .execute(move |p| p.finalise_connection(finalise));
        self.apply_effects(fx)
    }

    fn try_finalise_connection(&mut self, connection: Connection) -> SeshatResult<()> {
        let port = connection.receiver_port();
        self.inputs.insert(port, connection.clone());
        let opened = self.rid(port);
        self.registry
            .monitor()
            .execute(move |m| m.connection_open(opened));
        // Replay a pull buffered while the port was not ready, at most once.
        if self.graph.port_ready(port)? {
            connection.pull();
        }
        Ok(())
    }

    fn try_endpoint_pull(&mut self, port: NodeId) -> SeshatResult<()> {
        let mut fx = Vec::new();
        self.graph.remote_pull(port, &mut fx)?;
        self.apply_effects(fx)
    }

    fn try_endpoint_receive(&mut self, port: NodeId, item: Binding) -> SeshatResult<()> {
        let mut fx = Vec::new();
        self.graph.port_receive(port, item, &mut fx)?;
        self.apply_effects(fx)
    }

    fn try_root_pull(&mut self) -> SeshatResult<()> {
        let done = match &self.root {
            Some(root) => root.done,
            None => {
                return Err(ReactiveError::IllegalState {
                    context: "root pull on a non-root processor",
                }
                .into());
            }
        };
        if done {
            self.finished();
            return Ok(());
        }
        let hub = self.hub()?;
        let sink = self.sink.ok_or(ReactiveError::IllegalState {
            context: "root pull before set_up",
        })?;
        let mut fx = Vec::new();
        self.graph.pull(sink, hub, &mut fx)?;
        self.apply_effects(fx)
    }

    // -----------------------------------------------------------------------
    // Effect execution
    // -----------------------------------------------------------------------

    /// Execute graph effects in order. Growth effects expand in place, so the
    /// monitor sees their pending connections before later consumptions.
    fn apply_effects(&mut self, fx: Vec<Effect>) -> SeshatResult<()> {
        let monitor = self.registry.monitor().clone();
        let mut queue: VecDeque<Effect> = fx.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::AnswerCreated(node) => {
                    let id = self.rid(node);
                    monitor.execute(move |m| m.answer_created(id));
                }
                Effect::AnswerConsumed(node) => {
                    let id = self.rid(node);
                    monitor.execute(move |m| m.answer_consumed(id));
                }
                Effect::SourceExhausted(node) => {
                    let id = self.rid(node);
                    monitor.execute(move |m| m.source_exhausted(id));
                }
                Effect::PathRegistered { receiver, provider } => {
                    let receiver = self.rid(receiver);
                    let provider = self.rid(provider);
                    monitor.execute(move |m| m.register_path(receiver, provider));
                }
                Effect::ConnectionPull(port) => {
                    let connection =
                        self.inputs.get(&port).ok_or(ReactiveError::IllegalState {
                            context: "pull effect on an unconnected input port",
                        })?;
                    connection.pull();
                }
                Effect::ConnectionEmit { port, item } => {
                    let connection =
                        self.outputs.get(&port).ok_or(ReactiveError::IllegalState {
                            context: "emit effect on an unconnected output port",
                        })?;
                    connection.receive(item);
                }
                Effect::GrowCompound {
                    compound,
                    stage,
                    prefix,
                } => {
                    let mut grown = Vec::new();
                    let merge = self.grow_stage(compound, stage, prefix, &mut grown)?;
                    // The compound re-pulled its providers before this stage
                    // existed; forward any still-unmet demand to it now, or
                    // the new stage would never be pulled and the execution
                    // could not drain.
                    if self.graph.has_demand(compound) {
                        self.graph.pull(compound, merge, &mut grown)?;
                    }
                    // Prepend so growth-local effects keep their causal slot.
                    for effect in grown.into_iter().rev() {
                        queue.push_front(effect);
                    }
                }
                Effect::RootEmit(item) => {
                    let root = self.root.as_ref().ok_or(ReactiveError::IllegalState {
                        context: "root emission on a non-root processor",
                    })?;
                    let _ = root.tx.send(RootMessage::Answer(item));
                }
            }
        }
        Ok(())
    }
}
