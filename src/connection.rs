//! Cross-processor connection handshake: request, builder, connection.
//!
//! A receiver processor opens an input port, wraps a `ConnectionRequest` in a
//! `ConnectionBuilder` (appending per-connection transforms via `with_map`)
//! and routes it towards the provider side. Controllers broker the builder
//! (possibly redirecting its bounds), the provider processor turns it into a
//! `Connection` and finalises it back at the receiver. From then on the two
//! ports exchange only `pull()` and `receive(item)` over the actors' drivers.

use std::fmt;

use crate::actor::Driver;
use crate::pattern::{Binding, Conjunction, TriplePattern};
use crate::processor::Processor;
use crate::reactive::operator::Transform;
use crate::reactive::{NodeId, ProcessorId, ReactiveId};

// ---------------------------------------------------------------------------
// Provider references
// ---------------------------------------------------------------------------

/// What a connection wants answers for, addressed by pattern rather than by
/// actor (the registry resolves it to a controller).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ProviderRef {
    Atom(TriplePattern),
    Conjunction(Conjunction),
    Rule(String),
}

impl fmt::Display for ProviderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderRef::Atom(pattern) => write!(f, "atom {pattern}"),
            ProviderRef::Conjunction(conj) => write!(f, "conjunction {conj}"),
            ProviderRef::Rule(name) => write!(f, "rule '{name}'"),
        }
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Identity of a connection request; processors use it to avoid requesting
/// the same provider twice for one port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestId {
    input: ReactiveId,
    provider: ProviderRef,
    bounds: Binding,
}

/// A receiver's ask for an upstream connection.
pub struct ConnectionRequest {
    pub input: NodeId,
    pub receiver: Driver<Processor>,
    pub receiver_processor: ProcessorId,
    pub provider: ProviderRef,
    pub bounds: Binding,
    /// Applied provider-side to every item crossing the connection, in order.
    pub transforms: Vec<Transform>,
}

impl ConnectionRequest {
    pub fn id(&self) -> RequestId {
        RequestId {
            input: ReactiveId {
                processor: self.receiver_processor,
                node: self.input,
            },
            provider: self.provider.clone(),
            bounds: self.bounds.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Request in the provider controller's hands, open for adjustment before the
/// provider processor accepts it.
pub struct ConnectionBuilder {
    request: ConnectionRequest,
}

impl ConnectionBuilder {
    pub fn new(request: ConnectionRequest) -> Self {
        Self { request }
    }

    pub fn bounds(&self) -> &Binding {
        &self.request.bounds
    }

    pub fn provider(&self) -> &ProviderRef {
        &self.request.provider
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.request.transforms
    }

    /// Global address of the receiving input port, for monitor bookkeeping.
    pub fn receiver_input(&self) -> ReactiveId {
        ReactiveId {
            processor: self.request.receiver_processor,
            node: self.request.input,
        }
    }

    /// Redirect to a different processor bounds (controllers normalise the
    /// requested bounds to the variables their pattern can use).
    pub fn with_bounds(mut self, bounds: Binding) -> Self {
        self.request.bounds = bounds;
        self
    }

    /// Append a transform to the connection's chain.
    pub fn with_map(mut self, transform: Transform) -> Self {
        self.request.transforms.push(transform);
        self
    }

    /// Consume the builder once the provider processor has created its
    /// output port (which carries the transform chain).
    pub fn build(self, provider: Driver<Processor>, provider_port: NodeId) -> Connection {
        Connection {
            receiver: self.request.receiver,
            provider,
            receiver_port: self.request.input,
            provider_port,
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

/// An established edge between an input port and an output port in two
/// different processors. Clonable; both endpoints hold a copy.
#[derive(Clone)]
pub struct Connection {
    receiver: Driver<Processor>,
    provider: Driver<Processor>,
    receiver_port: NodeId,
    provider_port: NodeId,
}

impl Connection {
    pub fn receiver_port(&self) -> NodeId {
        self.receiver_port
    }

    pub fn provider_port(&self) -> NodeId {
        self.provider_port
    }

    pub fn receiver(&self) -> &Driver<Processor> {
        &self.receiver
    }

    /// Ask the provider for one item (fire-and-forget).
    pub fn pull(&self) {
        let port = self.provider_port;
        self.provider.execute(move |p| p.endpoint_pull(port));
    }

    /// Deliver one item to the receiver (fire-and-forget).
    pub fn receive(&self, item: Binding) {
        let port = self.receiver_port;
        self.receiver.execute(move |p| p.endpoint_receive(port, item));
    }
}
