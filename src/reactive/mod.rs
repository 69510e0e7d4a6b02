//! Reactive dataflow primitives: a pull-based operator graph local to one
//! processor actor.
//!
//! The graph is an arena: nodes are addressed by `NodeId`, edges live in
//! per-node subscriber/provider registries, and there are no back-pointers.
//! All graph entry points are synchronous. Anything that must leave the actor
//! (monitor accounting, cross-connection sends, graph growth requests) is
//! returned as an ordered list of [`Effect`]s for the host processor to
//! execute. This keeps the protocol logic single-threaded and testable
//! without any actors running.
//!
//! Protocol, per edge: a subscriber pulls at most once and may not pull again
//! until answered; a publisher delivers only against an outstanding pull.
//! Violations are hard errors.

pub mod operator;
pub mod source;
pub mod stream;

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::ReactiveError;
use crate::pattern::Binding;

use operator::{Pool, Transform, apply_chain};
use source::{IteratorSupplier, SourceNode};
use stream::{
    CompoundNode, InputPortNode, OutputPortNode, PoolingNode, RootSinkNode, TransformNode,
};

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Index of a node within one processor's graph.
pub type NodeId = usize;

/// Process-wide unique processor identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessorId(u64);

impl ProcessorId {
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ProcessorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Globally unique address of a reactive node, used by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReactiveId {
    pub processor: ProcessorId,
    pub node: NodeId,
}

impl fmt::Display for ReactiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/n{}", self.processor, self.node)
    }
}

// ---------------------------------------------------------------------------
// Effects
// ---------------------------------------------------------------------------

/// An action the host processor must take after a graph operation.
///
/// Effects are emitted in causal order; the processor executes them in that
/// order so monitor accounting messages are enqueued before the item sends
/// they account for.
#[derive(Debug)]
pub enum Effect {
    /// Node brought a new item into flight (monitor: count +1).
    AnswerCreated(NodeId),
    /// Node took an item out of flight (monitor: count -1).
    AnswerConsumed(NodeId),
    /// A source reached exhaustion (emitted exactly once per source).
    SourceExhausted(NodeId),
    /// An edge was registered (monitor path bookkeeping).
    PathRegistered { receiver: NodeId, provider: NodeId },
    /// An input port needs a pull sent across its connection.
    ConnectionPull(NodeId),
    /// An output port has an item to send across its connection.
    ConnectionEmit { port: NodeId, item: Binding },
    /// A compound stream wants the next stage opened under a prefix.
    GrowCompound {
        compound: NodeId,
        stage: usize,
        prefix: Binding,
    },
    /// An answer reached the root sink; hand it to the consumer.
    RootEmit(Binding),
}

// ---------------------------------------------------------------------------
// Edge registries
// ---------------------------------------------------------------------------

/// Downstream bookkeeping of one publisher: who is registered, who has an
/// unanswered pull.
struct SubscriberRegistry {
    registered: Vec<NodeId>,
    pulling: BTreeSet<NodeId>,
    single: bool,
}

impl SubscriberRegistry {
    fn new(single: bool) -> Self {
        Self {
            registered: Vec::new(),
            pulling: BTreeSet::new(),
            single,
        }
    }

    fn register(&mut self, publisher: NodeId, subscriber: NodeId) -> Result<(), ReactiveError> {
        if self.registered.contains(&subscriber) {
            return Err(ReactiveError::DuplicateSubscriber {
                publisher,
                subscriber,
            });
        }
        if self.single && !self.registered.is_empty() {
            return Err(ReactiveError::SingleSubscriberExceeded {
                publisher,
                subscriber,
            });
        }
        self.registered.push(subscriber);
        Ok(())
    }

    /// Record a pull; `Ok(false)` when one is already outstanding.
    fn set_pulling(
        &mut self,
        publisher: NodeId,
        subscriber: NodeId,
    ) -> Result<bool, ReactiveError> {
        if !self.registered.contains(&subscriber) {
            return Err(ReactiveError::UnregisteredSubscriber {
                publisher,
                subscriber,
            });
        }
        Ok(self.pulling.insert(subscriber))
    }

    /// Clear a pull on delivery; false if none was outstanding.
    fn finish_pull(&mut self, subscriber: NodeId) -> bool {
        self.pulling.remove(&subscriber)
    }

    fn any_pulling(&self) -> bool {
        !self.pulling.is_empty()
    }

    fn is_pulling(&self, subscriber: NodeId) -> bool {
        self.pulling.contains(&subscriber)
    }

    fn pulling_snapshot(&self) -> Vec<NodeId> {
        self.pulling.iter().copied().collect()
    }
}

/// Upstream bookkeeping of one subscriber: registered providers and which of
/// them hold an unanswered pull from us.
struct ProviderRegistry {
    registered: Vec<NodeId>,
    pulled: BTreeSet<NodeId>,
}

impl ProviderRegistry {
    fn new() -> Self {
        Self {
            registered: Vec::new(),
            pulled: BTreeSet::new(),
        }
    }

    fn register(&mut self, subscriber: NodeId, provider: NodeId) -> Result<(), ReactiveError> {
        if self.registered.contains(&provider) {
            return Err(ReactiveError::DuplicateProvider {
                subscriber,
                provider,
            });
        }
        self.registered.push(provider);
        Ok(())
    }

    fn mark_pulled(&mut self, provider: NodeId) {
        self.pulled.insert(provider);
    }

    /// Clear the outstanding pull on receipt; false means a protocol breach.
    fn clear_pulled(&mut self, provider: NodeId) -> bool {
        self.pulled.remove(&provider)
    }

    /// Providers with no outstanding pull from us.
    fn unpulled_snapshot(&self) -> Vec<NodeId> {
        self.registered
            .iter()
            .copied()
            .filter(|p| !self.pulled.contains(p))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

enum NodeKind {
    Source(SourceNode),
    Transform(TransformNode),
    Pooling(PoolingNode),
    Compound(CompoundNode),
    InputPort(InputPortNode),
    OutputPort(OutputPortNode),
    RootSink(RootSinkNode),
}

#[derive(Clone, Copy)]
enum KindTag {
    Source,
    Transform,
    Pooling,
    Compound,
    InputPort,
    OutputPort,
    RootSink,
}

struct Node {
    kind: NodeKind,
    subscribers: SubscriberRegistry,
    providers: ProviderRegistry,
}

// ---------------------------------------------------------------------------
// Graph
// ---------------------------------------------------------------------------

/// Internal worklist entries; processed until quiescent.
enum Op {
    Pull {
        subscriber: NodeId,
        publisher: NodeId,
    },
    Deliver {
        publisher: NodeId,
        subscriber: NodeId,
        item: Binding,
    },
}

/// One processor's reactive operator graph.
#[derive(Default)]
pub struct Graph {
    nodes: Vec<Node>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    // -- construction -------------------------------------------------------

    fn add(&mut self, kind: NodeKind, single_subscriber: bool) -> NodeId {
        let id = self.nodes.len();
        self.nodes.push(Node {
            kind,
            subscribers: SubscriberRegistry::new(single_subscriber),
            providers: ProviderRegistry::new(),
        });
        id
    }

    pub fn add_source(&mut self, supplier: IteratorSupplier) -> NodeId {
        self.add(NodeKind::Source(SourceNode::new(supplier)), true)
    }

    pub fn add_transform(&mut self, op: Transform) -> NodeId {
        self.add(NodeKind::Transform(TransformNode { op }), true)
    }

    pub fn add_pooling(&mut self, pool: Box<dyn Pool>) -> NodeId {
        self.add(NodeKind::Pooling(PoolingNode { pool }), false)
    }

    pub fn add_compound(&mut self, stages: usize) -> NodeId {
        self.add(NodeKind::Compound(CompoundNode::new(stages)), true)
    }

    pub fn add_input_port(&mut self) -> NodeId {
        self.add(NodeKind::InputPort(InputPortNode::new()), true)
    }

    pub fn add_output_port(&mut self, transforms: Arc<Vec<Transform>>) -> NodeId {
        self.add(NodeKind::OutputPort(OutputPortNode::new(transforms)), true)
    }

    pub fn add_root_sink(&mut self) -> NodeId {
        self.add(NodeKind::RootSink(RootSinkNode), true)
    }

    // -- wiring -------------------------------------------------------------

    /// Register the edge publisher -> subscriber on both sides.
    ///
    /// Registering onto a pooling node that already buffered items counts the
    /// replayed copies the late subscriber is now owed.
    pub fn register(
        &mut self,
        publisher: NodeId,
        subscriber: NodeId,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        if publisher == subscriber {
            return Err(ReactiveError::IllegalState {
                context: "node registered onto itself",
            });
        }
        self.nodes[publisher]
            .subscribers
            .register(publisher, subscriber)?;
        self.nodes[subscriber]
            .providers
            .register(subscriber, publisher)?;
        fx.push(Effect::PathRegistered {
            receiver: subscriber,
            provider: publisher,
        });
        if let NodeKind::Pooling(pooling) = &mut self.nodes[publisher].kind {
            let owed = pooling.pool.replay_for(subscriber);
            for _ in 0..owed {
                fx.push(Effect::AnswerCreated(publisher));
            }
        }
        Ok(())
    }

    /// Register a provider feeding a compound stream at the given stage depth.
    pub fn register_compound_provider(
        &mut self,
        compound: NodeId,
        provider: NodeId,
        depth: usize,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        self.register(provider, compound, fx)?;
        match &mut self.nodes[compound].kind {
            NodeKind::Compound(node) => {
                node.depths.insert(provider, depth);
                Ok(())
            }
            _ => Err(ReactiveError::IllegalState {
                context: "compound provider registered on a non-compound node",
            }),
        }
    }

    // -- entry points -------------------------------------------------------

    /// Subscriber pulls on publisher; runs the graph to quiescence.
    pub fn pull(
        &mut self,
        subscriber: NodeId,
        publisher: NodeId,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        self.run(
            Op::Pull {
                subscriber,
                publisher,
            },
            fx,
        )
    }

    /// The remote receiver of a connection pulled on our output port.
    ///
    /// Idempotent while a remote pull is outstanding.
    pub fn remote_pull(
        &mut self,
        port: NodeId,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        match &mut self.nodes[port].kind {
            NodeKind::OutputPort(out) => {
                if out.remote_pulling {
                    return Ok(());
                }
                out.remote_pulling = true;
            }
            _ => {
                return Err(ReactiveError::IllegalState {
                    context: "remote pull on a non-output-port node",
                });
            }
        }
        for provider in self.nodes[port].providers.unpulled_snapshot() {
            self.run(
                Op::Pull {
                    subscriber: port,
                    publisher: provider,
                },
                fx,
            )?;
        }
        Ok(())
    }

    /// An item arrived over a connection at one of our input ports.
    pub fn port_receive(
        &mut self,
        port: NodeId,
        item: Binding,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        let local_subscriber = match &mut self.nodes[port].kind {
            NodeKind::InputPort(input) => {
                if !input.ready {
                    return Err(ReactiveError::ReceiveBeforeReady { port });
                }
                if !input.remote_pulled {
                    return Err(ReactiveError::ReceiveWithoutPull {
                        node: port,
                        provider: port,
                    });
                }
                input.remote_pulled = false;
                let pulling = self.nodes[port].subscribers.pulling_snapshot();
                match pulling.first() {
                    Some(sub) => *sub,
                    None => {
                        return Err(ReactiveError::IllegalState {
                            context: "input port received without local demand",
                        });
                    }
                }
            }
            _ => {
                return Err(ReactiveError::IllegalState {
                    context: "connection receive on a non-input-port node",
                });
            }
        };
        self.run(
            Op::Deliver {
                publisher: port,
                subscriber: local_subscriber,
                item,
            },
            fx,
        )
    }

    /// Mark an input port's connection finalised. Returns true when a pull
    /// buffered while the port was not ready must now cross the connection
    /// (the caller sends it; it happens at most once).
    pub fn port_ready(&mut self, port: NodeId) -> Result<bool, ReactiveError> {
        let pending = self.nodes[port].subscribers.any_pulling();
        match &mut self.nodes[port].kind {
            NodeKind::InputPort(input) => {
                input.ready = true;
                if pending && !input.remote_pulled {
                    input.remote_pulled = true;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            _ => Err(ReactiveError::IllegalState {
                context: "finalise on a non-input-port node",
            }),
        }
    }

    // -- inspection ---------------------------------------------------------

    /// Whether `subscriber` has an unanswered pull on `publisher`.
    pub fn is_pulling(&self, publisher: NodeId, subscriber: NodeId) -> bool {
        self.nodes[publisher].subscribers.is_pulling(subscriber)
    }

    /// Whether any subscriber of `publisher` has an unanswered pull.
    pub fn has_demand(&self, publisher: NodeId) -> bool {
        self.nodes[publisher].subscribers.any_pulling()
    }

    #[cfg(test)]
    fn source_started(&self, id: NodeId) -> bool {
        match &self.nodes[id].kind {
            NodeKind::Source(src) => src.is_started(),
            _ => false,
        }
    }

    fn tag(&self, id: NodeId) -> KindTag {
        match &self.nodes[id].kind {
            NodeKind::Source(_) => KindTag::Source,
            NodeKind::Transform(_) => KindTag::Transform,
            NodeKind::Pooling(_) => KindTag::Pooling,
            NodeKind::Compound(_) => KindTag::Compound,
            NodeKind::InputPort(_) => KindTag::InputPort,
            NodeKind::OutputPort(_) => KindTag::OutputPort,
            NodeKind::RootSink(_) => KindTag::RootSink,
        }
    }

    // -- dispatch -----------------------------------------------------------

    fn run(&mut self, seed: Op, fx: &mut Vec<Effect>) -> Result<(), ReactiveError> {
        let mut ops = VecDeque::new();
        ops.push_back(seed);
        while let Some(op) = ops.pop_front() {
            match op {
                Op::Pull {
                    subscriber,
                    publisher,
                } => self.do_pull(subscriber, publisher, &mut ops, fx)?,
                Op::Deliver {
                    publisher,
                    subscriber,
                    item,
                } => self.do_deliver(publisher, subscriber, item, &mut ops, fx)?,
            }
        }
        Ok(())
    }

    fn do_pull(
        &mut self,
        subscriber: NodeId,
        publisher: NodeId,
        ops: &mut VecDeque<Op>,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        let newly = self.nodes[publisher]
            .subscribers
            .set_pulling(publisher, subscriber)?;
        if !newly {
            // A pull is already outstanding on this edge.
            return Ok(());
        }
        self.nodes[subscriber].providers.mark_pulled(publisher);

        match self.tag(publisher) {
            KindTag::Source => {
                let (item, newly_exhausted) = match &mut self.nodes[publisher].kind {
                    NodeKind::Source(src) => {
                        let was = src.is_exhausted();
                        let item = src.produce();
                        let now = src.is_exhausted();
                        (item, now && !was)
                    }
                    _ => unreachable!("tag dispatch"),
                };
                match item {
                    Some(item) => {
                        fx.push(Effect::AnswerCreated(publisher));
                        ops.push_back(Op::Deliver {
                            publisher,
                            subscriber,
                            item,
                        });
                    }
                    None => {
                        if newly_exhausted {
                            fx.push(Effect::SourceExhausted(publisher));
                        }
                    }
                }
            }
            KindTag::Transform => {
                self.pull_upstream(publisher, ops);
            }
            KindTag::Pooling => {
                let item = match &mut self.nodes[publisher].kind {
                    NodeKind::Pooling(pooling) => pooling.pool.next_for(subscriber),
                    _ => unreachable!("tag dispatch"),
                };
                match item {
                    Some(item) => ops.push_back(Op::Deliver {
                        publisher,
                        subscriber,
                        item,
                    }),
                    None => self.pull_upstream(publisher, ops),
                }
            }
            KindTag::Compound => {
                let item = match &mut self.nodes[publisher].kind {
                    NodeKind::Compound(compound) => compound.buffer.next_for(subscriber),
                    _ => unreachable!("tag dispatch"),
                };
                match item {
                    Some(item) => ops.push_back(Op::Deliver {
                        publisher,
                        subscriber,
                        item,
                    }),
                    None => self.pull_upstream(publisher, ops),
                }
            }
            KindTag::InputPort => {
                if let NodeKind::InputPort(input) = &mut self.nodes[publisher].kind
                    && input.ready
                    && !input.remote_pulled
                {
                    input.remote_pulled = true;
                    fx.push(Effect::ConnectionPull(publisher));
                }
                // Not ready: the pull stays buffered in the pulling state and
                // crosses the connection at finalisation.
            }
            KindTag::OutputPort | KindTag::RootSink => {
                return Err(ReactiveError::IllegalState {
                    context: "pull on a terminal node",
                });
            }
        }
        Ok(())
    }

    /// Forward demand to every provider without an outstanding pull.
    fn pull_upstream(&mut self, node: NodeId, ops: &mut VecDeque<Op>) {
        for provider in self.nodes[node].providers.unpulled_snapshot() {
            ops.push_back(Op::Pull {
                subscriber: node,
                publisher: provider,
            });
        }
    }

    fn do_deliver(
        &mut self,
        publisher: NodeId,
        subscriber: NodeId,
        item: Binding,
        ops: &mut VecDeque<Op>,
        fx: &mut Vec<Effect>,
    ) -> Result<(), ReactiveError> {
        if !self.nodes[subscriber].providers.clear_pulled(publisher) {
            return Err(ReactiveError::ReceiveWithoutPull {
                node: subscriber,
                provider: publisher,
            });
        }
        if !self.nodes[publisher].subscribers.finish_pull(subscriber) {
            return Err(ReactiveError::ReceiveWithoutPull {
                node: subscriber,
                provider: publisher,
            });
        }

        match self.tag(subscriber) {
            KindTag::Transform => {
                let output = match &self.nodes[subscriber].kind {
                    NodeKind::Transform(t) => t.op.apply(&item),
                    _ => unreachable!("tag dispatch"),
                };
                // Creation is reported before the matching consumption so the
                // monitor's in-flight count never dips to zero mid-hop.
                match output {
                    Some(output) => {
                        fx.push(Effect::AnswerCreated(subscriber));
                        fx.push(Effect::AnswerConsumed(subscriber));
                        let downstream = self.nodes[subscriber].subscribers.pulling_snapshot();
                        match downstream.first() {
                            Some(down) => ops.push_back(Op::Deliver {
                                publisher: subscriber,
                                subscriber: *down,
                                item: output,
                            }),
                            None => {
                                return Err(ReactiveError::IllegalState {
                                    context: "transform delivered without downstream demand",
                                });
                            }
                        }
                    }
                    None => {
                        // Dropped by the transform; demand is still unmet.
                        fx.push(Effect::AnswerConsumed(subscriber));
                        if self.nodes[subscriber].subscribers.any_pulling() {
                            self.pull_upstream(subscriber, ops);
                        }
                    }
                }
            }
            KindTag::Pooling => {
                let receivers = self.nodes[subscriber].subscribers.registered.clone();
                let owed = match &mut self.nodes[subscriber].kind {
                    NodeKind::Pooling(pooling) => pooling.pool.accept(item, &receivers),
                    _ => unreachable!("tag dispatch"),
                };
                for _ in 0..owed {
                    fx.push(Effect::AnswerCreated(subscriber));
                }
                fx.push(Effect::AnswerConsumed(subscriber));
                let mut unsatisfied = false;
                for receiver in self.nodes[subscriber].subscribers.pulling_snapshot() {
                    let next = match &mut self.nodes[subscriber].kind {
                        NodeKind::Pooling(pooling) => pooling.pool.next_for(receiver),
                        _ => unreachable!("tag dispatch"),
                    };
                    match next {
                        Some(item) => ops.push_back(Op::Deliver {
                            publisher: subscriber,
                            subscriber: receiver,
                            item,
                        }),
                        None => unsatisfied = true,
                    }
                }
                if unsatisfied {
                    self.pull_upstream(subscriber, ops);
                }
            }
            KindTag::Compound => {
                let (stages, depth) = match &self.nodes[subscriber].kind {
                    NodeKind::Compound(compound) => {
                        let depth =
                            compound.depths.get(&publisher).copied().ok_or(
                                ReactiveError::IllegalState {
                                    context: "compound provider has no stage depth",
                                },
                            )?;
                        (compound.stages, depth)
                    }
                    _ => unreachable!("tag dispatch"),
                };
                let mut delivered = false;
                if depth >= stages {
                    // Complete answer: buffer, then satisfy waiting demand.
                    let owed = match &mut self.nodes[subscriber].kind {
                        NodeKind::Compound(compound) => compound.buffer.accept(item, &[]),
                        _ => unreachable!("tag dispatch"),
                    };
                    for _ in 0..owed {
                        fx.push(Effect::AnswerCreated(subscriber));
                    }
                    fx.push(Effect::AnswerConsumed(subscriber));
                    let waiting = self.nodes[subscriber].subscribers.pulling_snapshot();
                    if let Some(down) = waiting.first() {
                        let buffered = match &mut self.nodes[subscriber].kind {
                            NodeKind::Compound(compound) => compound.buffer.next_for(*down),
                            _ => unreachable!("tag dispatch"),
                        };
                        if let Some(item) = buffered {
                            ops.push_back(Op::Deliver {
                                publisher: subscriber,
                                subscriber: *down,
                                item,
                            });
                            delivered = true;
                        }
                    }
                } else {
                    // Prefix: grow the graph for the next stage, once per
                    // distinct (stage, prefix) pair. The growth effect comes
                    // before the consumption so the monitor learns about the
                    // pending connection before the in-flight count drops.
                    let grow = match &mut self.nodes[subscriber].kind {
                        NodeKind::Compound(compound) => {
                            compound.opened.insert((depth, item.clone()))
                        }
                        _ => unreachable!("tag dispatch"),
                    };
                    if grow {
                        fx.push(Effect::GrowCompound {
                            compound: subscriber,
                            stage: depth,
                            prefix: item,
                        });
                    }
                    fx.push(Effect::AnswerConsumed(subscriber));
                }
                if !delivered && self.nodes[subscriber].subscribers.any_pulling() {
                    self.pull_upstream(subscriber, ops);
                }
            }
            KindTag::OutputPort => {
                let output = match &self.nodes[subscriber].kind {
                    NodeKind::OutputPort(out) => {
                        if !out.remote_pulling {
                            return Err(ReactiveError::IllegalState {
                                context: "output port received without remote demand",
                            });
                        }
                        apply_chain(&out.transforms, item)
                    }
                    _ => unreachable!("tag dispatch"),
                };
                match output {
                    Some(output) => {
                        fx.push(Effect::AnswerCreated(subscriber));
                        fx.push(Effect::AnswerConsumed(subscriber));
                        if let NodeKind::OutputPort(out) = &mut self.nodes[subscriber].kind {
                            out.remote_pulling = false;
                        }
                        fx.push(Effect::ConnectionEmit {
                            port: subscriber,
                            item: output,
                        });
                    }
                    None => {
                        // The chain filtered the item; the remote pull stands.
                        fx.push(Effect::AnswerConsumed(subscriber));
                        ops.push_back(Op::Pull {
                            subscriber,
                            publisher,
                        });
                    }
                }
            }
            KindTag::RootSink => {
                fx.push(Effect::AnswerConsumed(subscriber));
                fx.push(Effect::RootEmit(item));
            }
            KindTag::Source | KindTag::InputPort => {
                return Err(ReactiveError::IllegalState {
                    context: "delivery to a non-consuming node",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::operator::DistinctReplayPool;
    use super::*;
    use crate::pattern::{SymbolId, Var};

    fn item(value: u64) -> Binding {
        Binding::new().bind(Var::new("x"), SymbolId(value))
    }

    fn source_of(values: Vec<u64>) -> IteratorSupplier {
        Box::new(move || Box::new(values.into_iter().map(item)))
    }

    /// source -> distinct hub -> root sink
    fn linear_graph(values: Vec<u64>) -> (Graph, NodeId, NodeId, NodeId) {
        let mut g = Graph::new();
        let src = g.add_source(source_of(values));
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let sink = g.add_root_sink();
        let mut fx = Vec::new();
        g.register(src, hub, &mut fx).unwrap();
        g.register(hub, sink, &mut fx).unwrap();
        (g, src, hub, sink)
    }

    fn root_emits(fx: &[Effect]) -> Vec<Binding> {
        fx.iter()
            .filter_map(|e| match e {
                Effect::RootEmit(b) => Some(b.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn no_pull_means_no_computation() {
        let (g, src, _, _) = linear_graph(vec![1, 2]);
        assert!(!g.source_started(src));
    }

    #[test]
    fn one_pull_yields_one_answer() {
        let (mut g, _, hub, sink) = linear_graph(vec![1, 2]);
        let mut fx = Vec::new();
        g.pull(sink, hub, &mut fx).unwrap();
        assert_eq!(root_emits(&fx), vec![item(1)]);
    }

    #[test]
    fn duplicate_items_are_deduplicated_then_source_exhausts() {
        let (mut g, src, hub, sink) = linear_graph(vec![1, 2, 1]);
        let mut answers = Vec::new();
        let mut exhausted = false;
        for _ in 0..3 {
            let mut fx = Vec::new();
            g.pull(sink, hub, &mut fx).unwrap();
            answers.extend(root_emits(&fx));
            exhausted |= fx
                .iter()
                .any(|e| matches!(e, Effect::SourceExhausted(n) if *n == src));
        }
        assert_eq!(answers, vec![item(1), item(2)]);
        assert!(exhausted);
    }

    #[test]
    fn pull_after_exhaustion_is_silent() {
        let (mut g, src, hub, sink) = linear_graph(vec![1]);
        for _ in 0..3 {
            let mut fx = Vec::new();
            g.pull(sink, hub, &mut fx).unwrap();
        }
        // Third pull after exhaustion: no panic, no duplicate notice.
        let mut fx = Vec::new();
        g.pull(sink, hub, &mut fx).unwrap();
        assert!(
            !fx.iter()
                .any(|e| matches!(e, Effect::SourceExhausted(n) if *n == src))
        );
    }

    #[test]
    fn duplicate_registration_is_an_error() {
        let (mut g, src, hub, _) = linear_graph(vec![1]);
        let mut fx = Vec::new();
        let err = g.register(src, hub, &mut fx).unwrap_err();
        assert!(matches!(err, ReactiveError::DuplicateSubscriber { .. }));
    }

    #[test]
    fn single_subscriber_publishers_reject_fanout() {
        let mut g = Graph::new();
        let src = g.add_source(source_of(vec![1]));
        let hub_a = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let hub_b = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let mut fx = Vec::new();
        g.register(src, hub_a, &mut fx).unwrap();
        let err = g.register(src, hub_b, &mut fx).unwrap_err();
        assert!(matches!(err, ReactiveError::SingleSubscriberExceeded { .. }));
    }

    #[test]
    fn transform_drop_triggers_upstream_repull() {
        // Items x=9 then x=1; prefix fixes x=1, so the first item is dropped
        // and one pull still produces the second.
        let mut g = Graph::new();
        let src = g.add_source(source_of(vec![9, 1]));
        let t = g.add_transform(Transform::MergePrefix(item(1)));
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let sink = g.add_root_sink();
        let mut fx = Vec::new();
        g.register(src, t, &mut fx).unwrap();
        g.register(t, hub, &mut fx).unwrap();
        g.register(hub, sink, &mut fx).unwrap();

        let mut fx = Vec::new();
        g.pull(sink, hub, &mut fx).unwrap();
        assert_eq!(root_emits(&fx), vec![item(1)]);
    }

    #[test]
    fn port_buffers_pull_until_ready_and_replays_once() {
        let mut g = Graph::new();
        let port = g.add_input_port();
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let sink = g.add_root_sink();
        let mut fx = Vec::new();
        g.register(port, hub, &mut fx).unwrap();
        g.register(hub, sink, &mut fx).unwrap();

        let mut fx = Vec::new();
        g.pull(sink, hub, &mut fx).unwrap();
        // Demand reached the port but nothing crossed the connection yet.
        assert!(!fx.iter().any(|e| matches!(e, Effect::ConnectionPull(_))));

        assert!(g.port_ready(port).unwrap());
        // Second finalise-style check must not replay again.
        assert!(!g.port_ready(port).unwrap());

        let mut fx = Vec::new();
        g.port_receive(port, item(7), &mut fx).unwrap();
        assert_eq!(root_emits(&fx), vec![item(7)]);
    }

    #[test]
    fn receive_without_pull_is_fatal() {
        let mut g = Graph::new();
        let port = g.add_input_port();
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let mut fx = Vec::new();
        g.register(port, hub, &mut fx).unwrap();
        g.port_ready(port).unwrap();

        let mut fx = Vec::new();
        let err = g.port_receive(port, item(1), &mut fx).unwrap_err();
        assert!(matches!(err, ReactiveError::ReceiveWithoutPull { .. }));
    }

    #[test]
    fn receive_before_ready_is_fatal() {
        let mut g = Graph::new();
        let port = g.add_input_port();
        let mut fx = Vec::new();
        let err = g.port_receive(port, item(1), &mut fx).unwrap_err();
        assert!(matches!(err, ReactiveError::ReceiveBeforeReady { .. }));
    }

    #[test]
    fn compound_grows_once_per_distinct_prefix() {
        let mut g = Graph::new();
        let compound = g.add_compound(2);
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let sink = g.add_root_sink();
        // Stage-0 provider delivering depth-1 prefixes.
        let src = g.add_source(source_of(vec![5, 5, 6]));
        let mut fx = Vec::new();
        g.register_compound_provider(compound, src, 1, &mut fx)
            .unwrap();
        g.register(compound, hub, &mut fx).unwrap();
        g.register(hub, sink, &mut fx).unwrap();

        let mut grows = 0;
        for _ in 0..4 {
            let mut fx = Vec::new();
            g.pull(sink, hub, &mut fx).unwrap();
            grows += fx
                .iter()
                .filter(|e| matches!(e, Effect::GrowCompound { .. }))
                .count();
        }
        // Prefixes 5 and 6: two distinct expansions despite the duplicate.
        assert_eq!(grows, 2);
    }

    #[test]
    fn output_port_applies_its_transform_chain() {
        let mut g = Graph::new();
        let src = g.add_source(source_of(vec![3]));
        let hub = g.add_pooling(Box::new(DistinctReplayPool::new()));
        let chain = Arc::new(vec![Transform::Project(Arc::new(vec![Var::new("x")]))]);
        let port = g.add_output_port(chain);
        let mut fx = Vec::new();
        g.register(src, hub, &mut fx).unwrap();
        g.register(hub, port, &mut fx).unwrap();

        let mut fx = Vec::new();
        g.remote_pull(port, &mut fx).unwrap();
        let emitted: Vec<_> = fx
            .iter()
            .filter_map(|e| match e {
                Effect::ConnectionEmit { item, .. } => Some(item.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(emitted, vec![item(3)]);
    }

    #[test]
    fn late_pool_subscriber_is_owed_replayed_items() {
        let (mut g, _, hub, sink) = linear_graph(vec![1, 2]);
        let mut fx = Vec::new();
        g.pull(sink, hub, &mut fx).unwrap();

        // A second consumer arrives after one item was pooled.
        let late = g.add_root_sink();
        let mut fx = Vec::new();
        g.register(hub, late, &mut fx).unwrap();
        let created = fx
            .iter()
            .filter(|e| matches!(e, Effect::AnswerCreated(n) if *n == hub))
            .count();
        assert_eq!(created, 1);

        let mut fx = Vec::new();
        g.pull(late, hub, &mut fx).unwrap();
        assert_eq!(root_emits(&fx), vec![item(1)]);
    }
}
