//! Rich diagnostic error types for the seshat reasoner.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Errors inside the actor network are fatal
//! to the whole execution: the failing actor reports to the registry, which
//! terminates every actor and surfaces the cause on the consumer's answer stream.

use std::sync::Arc;

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the seshat reasoner.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the consumer.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum SeshatError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Reactive(#[from] ReactiveError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Query(#[from] QueryError),

    #[error("query execution cancelled by the consumer")]
    #[diagnostic(
        code(seshat::executor::cancelled),
        help(
            "The answer stream was closed or dropped before the execution \
             finished. This is the normal teardown path, not a fault."
        )
    )]
    Cancelled,
}

/// Convenience alias used throughout the crate.
pub type SeshatResult<T> = Result<T, SeshatError>;

/// Shared execution-failure cause, cloned into every dependent actor.
pub type TerminationCause = Arc<SeshatError>;

// ---------------------------------------------------------------------------
// Reactive protocol errors
// ---------------------------------------------------------------------------

/// Violations of the pull/receive contract inside a reactive graph.
///
/// These indicate a bug in operator wiring, never bad user input, so the help
/// text points at the protocol rule that was broken.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ReactiveError {
    #[error("node {node} received an item from provider {provider} without an outstanding pull")]
    #[diagnostic(
        code(seshat::reactive::receive_without_pull),
        help(
            "Every receive must match a prior pull on the same edge. A provider \
             pushed an item spontaneously, or delivered twice for one pull."
        )
    )]
    ReceiveWithoutPull { node: usize, provider: usize },

    #[error("input port {port} received an item before its connection was finalised")]
    #[diagnostic(
        code(seshat::reactive::receive_before_ready),
        help(
            "Items may only cross a connection after the provider's finalise \
             message has marked the receiving port ready."
        )
    )]
    ReceiveBeforeReady { port: usize },

    #[error("subscriber {subscriber} registered twice on publisher {publisher}")]
    #[diagnostic(
        code(seshat::reactive::duplicate_subscriber),
        help("Each edge of the reactive graph may be registered exactly once.")
    )]
    DuplicateSubscriber { publisher: usize, subscriber: usize },

    #[error("provider {provider} registered twice on subscriber {subscriber}")]
    #[diagnostic(
        code(seshat::reactive::duplicate_provider),
        help("Each edge of the reactive graph may be registered exactly once.")
    )]
    DuplicateProvider { subscriber: usize, provider: usize },

    #[error("publisher {publisher} accepts a single subscriber; {subscriber} is one too many")]
    #[diagnostic(
        code(seshat::reactive::single_subscriber),
        help(
            "Sources, transformation streams and compound streams feed exactly \
             one downstream node. Fan-out goes through a pooling stream."
        )
    )]
    SingleSubscriberExceeded { publisher: usize, subscriber: usize },

    #[error("pull on publisher {publisher} from {subscriber}, which is not a registered subscriber")]
    #[diagnostic(
        code(seshat::reactive::unregistered_subscriber),
        help("Register the edge before pulling across it.")
    )]
    UnregisteredSubscriber { publisher: usize, subscriber: usize },

    #[error("reactive graph in an illegal state: {context}")]
    #[diagnostic(
        code(seshat::reactive::illegal_state),
        help("Internal invariant violation in the reactive graph. This is a bug.")
    )]
    IllegalState { context: &'static str },
}

// ---------------------------------------------------------------------------
// Controller / registry errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ControlError {
    #[error("connection request for {provider} arrived after the execution terminated")]
    #[diagnostic(
        code(seshat::control::request_after_termination),
        help(
            "The registry has already broadcast terminate; late requests are \
             rejected rather than spawning actors that would leak."
        )
    )]
    RequestAfterTermination { provider: String },

    #[error("no rule named '{rule}' in the rule set")]
    #[diagnostic(
        code(seshat::control::unknown_rule),
        help("A connection request referenced a rule the rule set does not contain.")
    )]
    UnknownRule { rule: String },
}

// ---------------------------------------------------------------------------
// Query / rule-set errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum QueryError {
    #[error("conjunction has no atoms")]
    #[diagnostic(
        code(seshat::query::empty_conjunction),
        help("A query or rule body must contain at least one triple pattern.")
    )]
    EmptyConjunction,

    #[error("disjunction has no branches")]
    #[diagnostic(
        code(seshat::query::empty_disjunction),
        help("A disjunctive query must contain at least one branch conjunction.")
    )]
    EmptyDisjunction,

    #[error("select variable '{var}' does not occur in the query")]
    #[diagnostic(
        code(seshat::query::unknown_select_var),
        help("Every projected variable must be bound by some atom of the query.")
    )]
    UnknownSelectVar { var: String },

    #[error("rule '{rule}' is malformed: head variable '{var}' does not occur in the body")]
    #[diagnostic(
        code(seshat::query::malformed_rule),
        help(
            "Rules must be range-restricted: every variable of the head must be \
             bound by the body, otherwise derived triples would be unground."
        )
    )]
    MalformedRule { rule: String, var: String },

    #[error("duplicate rule name '{rule}'")]
    #[diagnostic(
        code(seshat::query::duplicate_rule),
        help("Rule names identify rule controllers and must be unique per rule set.")
    )]
    DuplicateRule { rule: String },
}
