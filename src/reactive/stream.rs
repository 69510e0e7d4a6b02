//! Interior stream nodes: transforms, pools, compound joins, ports and the
//! root sink.
//!
//! These are plain state carriers; the pull/receive protocol around them
//! lives in the parent module's `Graph` dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::NodeId;
use super::operator::{FifoPool, Pool, Transform};
use crate::pattern::Binding;

/// 1-in/1-out stateless mapping node.
pub struct TransformNode {
    pub op: Transform,
}

/// Stateful pooling node (buffering, dedup, fan-out).
pub struct PoolingNode {
    pub pool: Box<dyn Pool>,
}

/// The conjunction join: merges stage prefixes into complete answers.
///
/// Providers register at a stage depth. An item arriving from a depth-`k`
/// provider with `k < stages` is a prefix: it is consumed and handed to the
/// host processor to open the stage-`k` input port bound by it (graph
/// growth). An item from a depth-`stages` provider is a complete answer and
/// is buffered FIFO for the single downstream subscriber.
pub struct CompoundNode {
    pub stages: usize,
    /// Provider node -> how many leading atoms its items already bind.
    pub depths: HashMap<NodeId, usize>,
    pub buffer: FifoPool,
    /// (stage, prefix) pairs already expanded; duplicates are not re-opened.
    pub opened: HashSet<(usize, Binding)>,
}

impl CompoundNode {
    pub fn new(stages: usize) -> Self {
        Self {
            stages,
            depths: HashMap::new(),
            buffer: FifoPool::new(),
            opened: HashSet::new(),
        }
    }
}

/// Receiving half of a cross-processor connection.
///
/// Lifecycle: created not-ready, marked ready by the provider's finalise
/// message. A pull arriving while not ready is recorded locally and replayed
/// across the connection exactly once at finalisation.
pub struct InputPortNode {
    pub ready: bool,
    /// An un-answered pull is outstanding on the remote provider.
    pub remote_pulled: bool,
}

impl InputPortNode {
    pub fn new() -> Self {
        Self {
            ready: false,
            remote_pulled: false,
        }
    }
}

impl Default for InputPortNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Providing half of a cross-processor connection, carrying the connection's
/// transform chain (applied provider-side, before the item crosses actors).
pub struct OutputPortNode {
    pub transforms: Arc<Vec<Transform>>,
    /// The remote receiver has pulled and not yet been answered.
    pub remote_pulling: bool,
}

impl OutputPortNode {
    pub fn new(transforms: Arc<Vec<Transform>>) -> Self {
        Self {
            transforms,
            remote_pulling: false,
        }
    }
}

/// Terminal subscriber of the root processor; items reaching it are handed
/// to the executor's answer channel.
pub struct RootSinkNode;
