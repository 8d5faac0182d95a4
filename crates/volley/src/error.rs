//! Error types for every layer of the engine.
//!
//! Errors are split by who sees them:
//! - [`TriggerError`] is returned synchronously from the manager facade
//!   (configuration, malformed requests, no matching trigger).
//! - [`TriggerExecutionError`] travels through a firing's promise.
//! - [`DeferredError`] and [`ContextError`] flag programming defects such as
//!   resolving a promise twice or dispatching a context twice.

use std::sync::Arc;

use thiserror::Error;

use crate::condition::ConditionError;

/// Misuse of a [`Deferred`](crate::Deferred) or [`Promise`](crate::Promise).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DeferredError {
    #[error("deferred is already resolved or rejected")]
    AlreadyResolved,

    #[error("a callback is already attached to this promise")]
    CallbackAlreadyAttached,
}

/// Failure delivered through a firing's promise.
///
/// Cheap to clone so every awaiting caller gets an owned copy.
#[derive(Debug, Error, Clone)]
pub enum TriggerExecutionError {
    /// The trigger body returned an error.
    #[error("trigger failed: {0:#}")]
    Failed(Arc<anyhow::Error>),

    /// The request handed to the trigger is not the type it was registered with.
    #[error("request type mismatch: trigger expects {expected}")]
    RequestTypeMismatch { expected: &'static str },

    /// The trigger body panicked. The worker survives.
    #[error("trigger panicked: {0}")]
    Panicked(String),

    /// The execution was abandoned by its strategy before it ran.
    #[error("execution cancelled before it ran")]
    Cancelled,
}

impl TriggerExecutionError {
    /// Build a [`TriggerExecutionError::Failed`] from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Self::Failed(Arc::new(anyhow::Error::msg(message)))
    }
}

impl From<anyhow::Error> for TriggerExecutionError {
    fn from(error: anyhow::Error) -> Self {
        Self::Failed(Arc::new(error))
    }
}

impl From<ContextError> for TriggerExecutionError {
    fn from(error: ContextError) -> Self {
        Self::Failed(Arc::new(anyhow::Error::new(error)))
    }
}

/// Illegal transition of an [`ExecutionContext`](crate::ExecutionContext).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("execution {id} is already running")]
    AlreadyExecuting { id: String },

    #[error("execution {id} has already completed")]
    AlreadyCompleted { id: String },

    #[error(transparent)]
    Deferred(#[from] DeferredError),
}

/// Registration and lifecycle failures of the trigger registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry is already started")]
    AlreadyStarted,

    #[error("registry is not started")]
    NotStarted,

    #[error("registry is shut down")]
    ShutDown,

    #[error("trigger '{name}' was registered without an action")]
    MissingAction { name: String },

    #[error("invalid condition for trigger '{name}': {source}")]
    InvalidCondition {
        name: String,
        #[source]
        source: ConditionError,
    },

    #[error("trigger '{name}' expects {requested} but earlier registrations expect {existing}")]
    RequestTypeConflict {
        name: String,
        existing: &'static str,
        requested: &'static str,
    },

    #[error("trigger '{name}' can never match: an unconditional trigger is registered before it")]
    UnreachableTrigger { name: String },

    #[error("failed to start strategy: {0}")]
    Strategy(#[from] StrategyError),
}

/// Failures raised by a [`HandlingStrategy`](crate::HandlingStrategy).
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy '{strategy}' is not running")]
    NotRunning { strategy: &'static str },

    #[error("strategy '{strategy}' queue is full (capacity {capacity})")]
    QueueFull {
        strategy: &'static str,
        capacity: usize,
    },

    #[error("strategy '{strategy}' did not drain in time, {pending} executions still pending")]
    ShutdownTimeout {
        strategy: &'static str,
        pending: usize,
    },

    #[error("strategy '{strategy}' worker '{worker}' panicked")]
    WorkerPanicked {
        strategy: &'static str,
        worker: String,
    },

    #[error("strategy '{strategy}' could not spawn workers: {source}")]
    Spawn {
        strategy: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("strategy '{strategy}' was shut down and cannot be restarted")]
    Stopped { strategy: &'static str },

    #[error("invalid strategy configuration: {0}")]
    InvalidConfig(String),
}

/// Synchronous failure of a manager call.
///
/// None of these ever reach a promise. Routing failures (`NotStarted`,
/// `ShutDown`, `NoMatchingTrigger`, `MalformedRequest`) happen before an
/// execution context exists. A `Strategy` failure means a context was built
/// and assigned an id, but the strategy refused it and it never ran.
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger manager is not started")]
    NotStarted,

    #[error("trigger manager is shut down")]
    ShutDown,

    #[error("no matching trigger for event '{name}'")]
    NoMatchingTrigger { name: String },

    #[error("malformed request for event '{name}': {reason}")]
    MalformedRequest { name: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),
}

/// Result alias for manager calls.
pub type Result<T, E = TriggerError> = std::result::Result<T, E>;
