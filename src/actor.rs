//! Minimal actor substrate: one tokio task per actor, draining a mailbox of
//! boxed closures.
//!
//! A message is `FnOnce(&mut A)`, so handlers get exclusive access to actor
//! state without locks. `Driver<A>` is the cheap, clonable address used to
//! enqueue work; sends never block and never fail visibly (a stopped actor
//! simply drops late messages, which is the semantics teardown wants).
//!
//! The mailbox is a tokio unbounded mpsc channel, which delivers messages in
//! global enqueue order. The termination monitor's accounting depends on that
//! ordering, so the channel choice is a correctness decision, not a tuning one.

use tokio::sync::mpsc;

type Message<A> = Box<dyn FnOnce(&mut A) + Send>;

/// State driven by a mailbox loop.
pub trait Actor: Send + 'static {
    /// Short name used in trace output.
    fn name(&self) -> &'static str;

    /// Once true, the mailbox loop exits after the current message.
    fn stopped(&self) -> bool;
}

/// Clonable handle for enqueueing work on an actor.
pub struct Driver<A: Actor> {
    tx: mpsc::UnboundedSender<Message<A>>,
}

impl<A: Actor> Clone for Driver<A> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<A: Actor> Driver<A> {
    /// Enqueue a handler to run with exclusive access to the actor's state.
    ///
    /// Fire-and-forget: if the actor already stopped, the message is dropped.
    pub fn execute(&self, handler: impl FnOnce(&mut A) + Send + 'static) {
        let _ = self.tx.send(Box::new(handler));
    }
}

/// Spawn an actor on the current tokio runtime.
///
/// The builder receives the actor's own driver so the actor can hand out its
/// address from inside handlers (for connections, monitor paths, and the like).
pub fn spawn<A, F>(build: F) -> Driver<A>
where
    A: Actor,
    F: FnOnce(Driver<A>) -> A,
{
    let (tx, mut rx) = mpsc::unbounded_channel();
    let driver = Driver { tx };
    let mut actor = build(driver.clone());
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            message(&mut actor);
            if actor.stopped() {
                break;
            }
        }
        tracing::trace!(actor = actor.name(), "actor stopped");
    });
    driver
}
