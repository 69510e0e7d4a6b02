//! Source nodes: the leaves of a reactive graph.
//!
//! A source wraps a lazily-created iterator. Nothing is created until the
//! first pull reaches the node, and after exhaustion further pulls are
//! answered with silence rather than errors (idempotent exhaustion).

use crate::pattern::Binding;

pub type ItemIterator = Box<dyn Iterator<Item = Binding> + Send>;
pub type IteratorSupplier = Box<dyn FnOnce() -> ItemIterator + Send>;

/// Leaf node producing items on demand from a supplier-created iterator.
pub struct SourceNode {
    supplier: Option<IteratorSupplier>,
    iter: Option<ItemIterator>,
    exhausted: bool,
}

impl SourceNode {
    pub fn new(supplier: IteratorSupplier) -> Self {
        Self {
            supplier: Some(supplier),
            iter: None,
            exhausted: false,
        }
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Whether the backing iterator has been created yet. Stays false until
    /// the first pull arrives; the backpressure tests key off this.
    pub fn is_started(&self) -> bool {
        self.iter.is_some() || self.exhausted
    }

    /// Produce the next item, creating the iterator on first use. Returns
    /// `None` exactly at and after exhaustion; the caller reports the
    /// exhaustion notice only on the first `None`.
    pub fn produce(&mut self) -> Option<Binding> {
        if self.exhausted {
            return None;
        }
        if self.iter.is_none() {
            let supplier = self
                .supplier
                .take()
                .expect("supplier present until first use");
            self.iter = Some(supplier());
        }
        let item = self.iter.as_mut().and_then(|it| it.next());
        if item.is_none() {
            self.exhausted = true;
            self.iter = None;
        }
        item
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pattern::{SymbolId, Var};

    fn items(values: &[u64]) -> IteratorSupplier {
        let values: Vec<Binding> = values
            .iter()
            .map(|v| Binding::new().bind(Var::new("x"), SymbolId(*v)))
            .collect();
        Box::new(move || Box::new(values.into_iter()))
    }

    #[test]
    fn source_is_lazy_until_first_produce() {
        let mut source = SourceNode::new(items(&[1]));
        assert!(!source.is_started());
        assert!(source.produce().is_some());
        assert!(source.is_started());
    }

    #[test]
    fn exhaustion_is_idempotent() {
        let mut source = SourceNode::new(items(&[1]));
        assert!(source.produce().is_some());
        assert!(source.produce().is_none());
        assert!(source.is_exhausted());
        assert!(source.produce().is_none());
    }
}
