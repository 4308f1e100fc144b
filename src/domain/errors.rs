//! Error taxonomy for the runtime core.
//!
//! Handler-local failures never escape the event loop as panics or raw
//! errors; they are converted into in-band TASK/ERROR messages. The types
//! here cover everything else: bus lifecycle, node waits, group
//! aggregation, and runner surface errors.

use thiserror::Error;

/// Errors surfaced by the message bus.
#[derive(Error, Debug)]
pub enum BusError {
    /// Non-blocking consume found the queue empty. Callers treat this as
    /// "nothing to do", not as a failure.
    #[error("bus queue is empty")]
    NotReady,

    /// The bus channel was closed (all senders or the receiver dropped).
    #[error("bus channel closed")]
    Closed,
}

/// Errors surfaced by the run-node state store.
#[derive(Error, Debug)]
pub enum NodeError {
    /// No node registered under the given id.
    #[error("node not found: {0}")]
    NotFound(String),

    /// A completion wait exceeded its deadline.
    #[error("timed out after {waited_ms}ms waiting for node {node_id} to complete")]
    WaitTimeout {
        /// Id of the node being waited on.
        node_id: String,
        /// How long the caller waited before giving up.
        waited_ms: u64,
    },
}

/// Errors surfaced by group fan-out / fan-in coordination.
#[derive(Error, Debug)]
pub enum GroupError {
    /// No group registered under the given id.
    #[error("group not found: {0}")]
    NotFound(String),

    /// A group's results can be aggregated at most once.
    #[error("group already retired: {0}")]
    Retired(String),

    /// Fail-fast: one unrecoverable branch fails the whole group.
    #[error("group {group_id} member {node_id} failed: {reason}")]
    MemberFailed {
        /// The failed group.
        group_id: String,
        /// The member node that failed.
        node_id: String,
        /// Human-readable failure reason.
        reason: String,
    },
}

/// Failure of a single framework handler while processing one message.
///
/// The dispatch wrapper converts this into a TASK/ERROR message carrying
/// the handler name and reason; it is never propagated upward as-is.
#[derive(Error, Debug)]
#[error("handler '{handler}' failed: {reason}")]
pub struct HandlerError {
    /// Name of the handler that failed.
    pub handler: String,
    /// Human-readable failure reason.
    pub reason: String,
}

impl HandlerError {
    /// Convenience constructor.
    pub fn new(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            reason: reason.into(),
        }
    }
}

/// Top-level runtime errors returned by the task runner's public surface.
#[derive(Error, Debug)]
pub enum RuntimeError {
    /// The task's swarm failed validation during `pre_run`.
    #[error("swarm is not initialized: {0}")]
    SwarmNotInitialized(String),

    /// `run` was called before `pre_run` built the seed messages.
    #[error("no seed messages were built; call pre_run first")]
    NoSeedMessages,

    /// A second `run` was attempted on the same runner.
    #[error("task {0} is already running")]
    AlreadyRunning(String),

    /// Bus-level failure.
    #[error(transparent)]
    Bus(#[from] BusError),

    /// Node-store failure.
    #[error(transparent)]
    Node(#[from] NodeError),

    /// Group-coordination failure.
    #[error(transparent)]
    Group(#[from] GroupError),
}
