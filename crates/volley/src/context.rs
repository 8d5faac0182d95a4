//! Per-firing execution context.
//!
//! ```text
//! CREATED --pending()--> PENDING --execute()--> EXECUTING --finish()/reject()--> FINISHED | REJECTED
//! ```
//!
//! The terminal states are not stored separately: they are read off the
//! context's deferred, so exactly-once completion is decided by the
//! deferred's own compare-and-set and nothing else.

use std::any::Any;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, trace_span, warn};

use crate::application::ApplicationContext;
use crate::deferred::{Deferred, Promise, PromiseState};
use crate::error::{ContextError, DeferredError, TriggerExecutionError};
use crate::registry::TriggerConfig;
use crate::trigger::{Request, Response, TriggerResponse};

/// Promise handed back to the firing caller.
pub type TriggerPromise = Promise<Response, TriggerExecutionError>;

const CREATED: u8 = 0;
const PENDING: u8 = 1;
const EXECUTING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Created,
    Pending,
    Executing,
    Finished,
    Rejected,
}

impl ExecutionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Rejected)
    }
}

/// One firing of one trigger.
///
/// A cheap, clonable handle: strategies move it between threads, and a
/// trigger may keep a clone to complete the firing later.
#[derive(Clone)]
pub struct ExecutionContext {
    inner: Arc<Inner>,
}

struct Inner {
    id: String,
    config: TriggerConfig,
    request: Request,
    application: ApplicationContext,
    phase: AtomicU8,
    created_at: DateTime<Utc>,
    deferred: Deferred<Response, TriggerExecutionError>,
}

impl ExecutionContext {
    pub fn new(config: TriggerConfig, request: Request, application: ApplicationContext) -> Self {
        let id = application.next_id();
        Self {
            inner: Arc::new(Inner {
                id,
                config,
                request,
                application,
                phase: AtomicU8::new(CREATED),
                created_at: Utc::now(),
                deferred: Deferred::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn config(&self) -> &TriggerConfig {
        &self.inner.config
    }

    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    pub fn application(&self) -> &ApplicationContext {
        &self.inner.application
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    pub fn status(&self) -> ExecutionStatus {
        match self.inner.deferred.state() {
            PromiseState::Resolved => ExecutionStatus::Finished,
            PromiseState::Rejected => ExecutionStatus::Rejected,
            PromiseState::Pending => match self.inner.phase.load(Ordering::SeqCst) {
                CREATED => ExecutionStatus::Created,
                PENDING => ExecutionStatus::Pending,
                _ => ExecutionStatus::Executing,
            },
        }
    }

    /// Mark the context as handed to a strategy. No-op past `CREATED`.
    pub fn pending(&self) {
        let _ = self.inner.phase.compare_exchange(
            CREATED,
            PENDING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Run the bound trigger on the calling thread.
    ///
    /// Fails if the context is already executing or completed. Trigger
    /// errors and panics never escape: they reject the promise instead, so
    /// the calling worker keeps running.
    pub fn execute(&self) -> Result<(), ContextError> {
        self.claim()?;

        let span = trace_span!(
            "execute",
            event = %self.inner.config.name(),
            execution_id = %self.inner.id,
        );
        let _entered = span.enter();

        let action = self.inner.config.action();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| action.run(self)));

        let failure = match outcome {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(cause)) => {
                warn!(error = %cause, "trigger execution failed");
                cause
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(panic = %message, "trigger panicked");
                TriggerExecutionError::Panicked(message)
            }
        };

        if self.inner.deferred.reject(failure).is_err() {
            error!("trigger failed after it had already completed its execution");
        }
        Ok(())
    }

    /// Resolve the firing with a response.
    pub fn finish<R: TriggerResponse>(&self, response: R) -> Result<(), ContextError> {
        self.finish_with(Arc::new(response))
    }

    pub fn finish_with(&self, response: Response) -> Result<(), ContextError> {
        self.inner
            .deferred
            .resolve(response)
            .map_err(|e| self.double_completion(e))
    }

    /// Reject the firing with a failure cause.
    pub fn reject(&self, cause: TriggerExecutionError) -> Result<(), ContextError> {
        self.inner
            .deferred
            .reject(cause)
            .map_err(|e| self.double_completion(e))
    }

    /// Reject a context that never ran with [`TriggerExecutionError::Cancelled`].
    pub fn cancel(&self) -> Result<(), ContextError> {
        self.claim()?;
        self.reject(TriggerExecutionError::Cancelled)
    }

    /// Read-only view of the firing's outcome.
    pub fn promise(&self) -> TriggerPromise {
        self.inner.deferred.promise()
    }

    fn claim(&self) -> Result<(), ContextError> {
        let mut current = self.inner.phase.load(Ordering::SeqCst);
        loop {
            if self.inner.deferred.is_resolved() {
                return Err(ContextError::AlreadyCompleted {
                    id: self.inner.id.clone(),
                });
            }
            if current == EXECUTING {
                return Err(ContextError::AlreadyExecuting {
                    id: self.inner.id.clone(),
                });
            }
            match self.inner.phase.compare_exchange(
                current,
                EXECUTING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(actual) => current = actual,
            }
        }
    }

    fn double_completion(&self, error: DeferredError) -> ContextError {
        error!(
            execution_id = %self.inner.id,
            event = %self.inner.config.name(),
            "execution completed twice"
        );
        ContextError::Deferred(error)
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.inner.id)
            .field("event", &self.inner.config.name())
            .field("status", &self.status())
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
