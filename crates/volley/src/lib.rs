//! # Volley
//!
//! An in-process event-dispatch engine: triggers are registered against
//! event names, optionally guarded by a condition over the request, and run
//! asynchronously on a pluggable concurrency backend. Firing an event
//! returns a promise that settles exactly once with a response or a failure.
//!
//! ## Core Concepts
//!
//! - [`Trigger`] = the business logic bound to an event name
//! - [`HandlingStrategy`] = the threads that run it
//! - [`TriggerPromise`] = the caller's view of one firing
//!
//! ## Architecture
//!
//! ```text
//! Transport (HTTP, stdin, ...)
//!     │
//!     ▼ fire(name, request)
//! TriggerManager
//!     │
//!     ├─► TriggerRegistry.trigger_configs(name)   (frozen at start)
//!     │
//!     ├─► first config whose Condition matches
//!     │
//!     ▼
//! ExecutionContext ── promise() ──► returned to caller
//!     │
//!     ▼ handle(ctx)
//! HandlingStrategy ──────────────────────────────┐
//!     │                                          │
//!     ├─► SpinQueue:  busy-spin ring, N pollers  │
//!     ├─► Executor:   tokio blocking pool        │
//!     └─► RingBuffer: ring + WaitStrategy        │
//!                                                ▼
//!                                   worker: ctx.execute()
//!                                                │
//!                                                ▼
//!                              Trigger.execute() ─► finish() / reject()
//! ```
//!
//! ## Key Invariants
//!
//! 1. **Exactly-once settlement** - A promise is resolved or rejected once; a
//!    second attempt is an error, and the first outcome stands
//! 2. **Exactly-once delivery** - A promise's callback runs once, whether it is
//!    attached before, after, or while the promise settles
//! 3. **Frozen routing** - Registrations are immutable after `start()`
//! 4. **First match wins** - Configs under one name are tried in
//!    registration order
//! 5. **Workers survive triggers** - Trigger errors and panics become
//!    rejections, never dead worker threads
//! 6. **Synchronous routing failures** - Unknown names, unmatched conditions
//!    and malformed requests fail `fire()` itself, never the promise
//!
//! ## Example
//!
//! ```ignore
//! use serde::{Deserialize, Serialize};
//! use volley::{request, trigger_fn, TriggerManager};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct Greet {
//!     name: String,
//! }
//!
//! let manager = TriggerManager::builder().build()?;
//! manager
//!     .register_trigger("greet")
//!     .with_expression("name == \"\"")
//!     .with_action(trigger_fn::<Greet, _>(|_, ctx| Ok(ctx.finish("hello stranger")?)))
//!     .register()?;
//! manager
//!     .register_trigger("greet")
//!     .with_action(trigger_fn::<Greet, _>(|req, ctx| {
//!         Ok(ctx.finish(format!("hello {}", req.name))?)
//!     }))
//!     .register()?;
//! manager.start()?;
//!
//! let reply = manager.fire("greet", request(Greet { name: "ada".into() }))?.await?;
//! manager.shutdown()?;
//! ```
//!
//! ## What This Is Not
//!
//! Volley does not persist triggers or in-flight executions, does not
//! deliver across processes, and never retries a failed trigger.

mod application;
mod condition;
mod config;
mod context;
mod deferred;
mod error;
mod manager;
mod registry;
mod strategy;
mod support;
mod trigger;


// Re-export the completion primitive
pub use deferred::{Deferred, Promise, PromiseState};

// Re-export trigger types
pub use trigger::{
    request, trigger_fn, FnTrigger, Request, RequestType, Response, Trigger, TriggerRequest,
    TriggerResponse,
};

// Re-export condition types
pub use condition::{Condition, ConditionError, Expression};

// Re-export execution types
pub use application::{
    ApplicationContext, ApplicationContextBuilder, IdGenerator, RandomIdGenerator,
    TimeBasedIdGenerator,
};
pub use context::{ExecutionContext, ExecutionStatus, TriggerPromise};

// Re-export registry types
pub use registry::{RegistryPhase, TriggerConfig, TriggerRegistration, TriggerRegistry};

// Re-export strategies
pub use strategy::{
    ExecutorStrategy, ExecutorStrategyBuilder, HandlingStrategy, RingBufferStrategy,
    RingBufferStrategyBuilder, SpinQueueStrategy, WaitStrategy,
};

// Re-export configuration
pub use config::{ManagerConfig, StrategyConfig};

// Re-export the facade
pub use manager::{TriggerManager, TriggerManagerBuilder};

// Re-export error types
pub use error::{
    ContextError, DeferredError, RegistryError, Result, StrategyError, TriggerError,
    TriggerExecutionError,
};
