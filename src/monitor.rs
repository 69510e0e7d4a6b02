//! Distributed termination detection.
//!
//! One monitor actor per execution receives accounting notices from every
//! processor: reactive path registrations, terminus (source) registrations
//! and exhaustions, answer creations and consumptions, and pending
//! connections for providers still being set up. The execution is finished
//! exactly when every registered terminus has exhausted, the in-flight answer
//! count is zero, and no connection is pending; the monitor then tells the
//! root processor, which surfaces the done signal to the consumer.
//!
//! Soundness leans on two orderings. Processors report a hop's creation (or a
//! pending connection) before the matching consumption, and the actor
//! mailbox delivers messages in enqueue order, so the count the monitor sees
//! never dips to zero while work is still in flight.

use std::collections::{HashMap, HashSet};

use crate::actor::{Actor, Driver};
use crate::processor::Processor;
use crate::reactive::ReactiveId;

/// Execution progress as the monitor sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Some terminus can still produce.
    Running,
    /// All termini exhausted; answers still in flight.
    Draining,
    /// Quiescent: the done signal has been (or is being) sent.
    Terminated,
}

/// Per-execution termination detector.
pub struct Monitor {
    phase: Phase,
    /// receiver -> providers, for tracing the reactive topology.
    paths: HashMap<ReactiveId, Vec<ReactiveId>>,
    termini: HashSet<ReactiveId>,
    exhausted: HashSet<ReactiveId>,
    answers: i64,
    pending_connections: HashSet<ReactiveId>,
    root: Option<Driver<Processor>>,
    signalled: bool,
    stopped: bool,
}

impl Actor for Monitor {
    fn name(&self) -> &'static str {
        "monitor"
    }

    fn stopped(&self) -> bool {
        self.stopped
    }
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Self {
        Self {
            phase: Phase::Running,
            paths: HashMap::new(),
            termini: HashSet::new(),
            exhausted: HashSet::new(),
            answers: 0,
            pending_connections: HashSet::new(),
            root: None,
            signalled: false,
            stopped: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The processor to signal when the execution finishes.
    pub fn register_root(&mut self, root: Driver<Processor>) {
        self.root = Some(root);
        // Termination may already have been detected before the root driver
        // arrived (degenerate executions with an instantly empty source).
        if self.phase == Phase::Terminated {
            self.signal_root();
        }
    }

    pub fn register_path(&mut self, receiver: ReactiveId, provider: ReactiveId) {
        self.paths.entry(receiver).or_default().push(provider);
    }

    /// Register a leaf that must exhaust before the execution can finish.
    pub fn register_terminus(&mut self, id: ReactiveId) {
        self.termini.insert(id);
    }

    pub fn source_exhausted(&mut self, id: ReactiveId) {
        self.exhausted.insert(id);
        tracing::trace!(source = %id, "source exhausted");
        self.recompute();
    }

    pub fn answer_created(&mut self, id: ReactiveId) {
        let _ = id;
        self.answers += 1;
    }

    pub fn answer_consumed(&mut self, id: ReactiveId) {
        let _ = id;
        self.answers -= 1;
        self.recompute();
    }

    /// A connection was requested towards a provider that may still be
    /// setting up; blocks termination until opened.
    pub fn connection_pending(&mut self, input: ReactiveId) {
        self.pending_connections.insert(input);
    }

    pub fn connection_open(&mut self, input: ReactiveId) {
        self.pending_connections.remove(&input);
        self.recompute();
    }

    pub fn terminate(&mut self) {
        self.stopped = true;
    }

    fn recompute(&mut self) {
        if self.phase == Phase::Terminated {
            return;
        }
        let drained =
            !self.termini.is_empty() && self.termini.iter().all(|t| self.exhausted.contains(t));
        if !drained {
            self.phase = Phase::Running;
            return;
        }
        if self.answers == 0 && self.pending_connections.is_empty() {
            self.phase = Phase::Terminated;
            tracing::debug!(
                termini = self.termini.len(),
                paths = self.paths.len(),
                "execution terminated"
            );
            self.signal_root();
        } else {
            self.phase = Phase::Draining;
        }
    }

    fn signal_root(&mut self) {
        if self.signalled {
            return;
        }
        if let Some(root) = &self.root {
            root.execute(|p| p.finished());
            self.signalled = true;
        }
    }
}
