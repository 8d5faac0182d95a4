//! Test support for applications built on volley.
//!
//! - [`InlineStrategy`] runs every firing on the caller's thread, so a test
//!   can fire and assert without waiting.
//! - [`RecordingStrategy`] accepts firings without running them; the test
//!   decides when (and whether) they execute.
//! - [`EchoTrigger`], [`FailingTrigger`] and [`CountingTrigger`] cover the
//!   common trigger shapes.
//! - [`wait_for`] blocks on a promise with a timeout.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde_json::Value;
use tracing::debug;
use volley::{
    ExecutionContext, HandlingStrategy, Response, StrategyError, Trigger, TriggerExecutionError,
    TriggerPromise,
};

// ============================================================================
// Strategies
// ============================================================================

/// Executes each context synchronously inside `handle`.
#[derive(Debug, Default)]
pub struct InlineStrategy {
    handled: AtomicUsize,
}

impl InlineStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }
}

impl HandlingStrategy for InlineStrategy {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError> {
        self.handled.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = ctx.execute() {
            debug!(error = %e, "inline strategy got a context that was already run");
        }
        Ok(())
    }
}

/// Queues contexts until the test runs them.
#[derive(Debug, Default)]
pub struct RecordingStrategy {
    recorded: Mutex<Vec<ExecutionContext>>,
    starts: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl RecordingStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contexts handed over and not yet taken.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Event names of the recorded contexts, oldest first.
    pub fn events(&self) -> Vec<String> {
        self.lock()
            .iter()
            .map(|ctx| ctx.config().name().to_string())
            .collect()
    }

    pub fn take(&self) -> Vec<ExecutionContext> {
        std::mem::take(&mut *self.lock())
    }

    /// Execute every recorded context on the current thread. Returns how
    /// many ran.
    pub fn run_all(&self) -> usize {
        let recorded = self.take();
        let count = recorded.len();
        for ctx in recorded {
            let _ = ctx.execute();
        }
        count
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExecutionContext>> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl HandlingStrategy for RecordingStrategy {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError> {
        self.lock().push(ctx);
        Ok(())
    }

    fn start(&self) -> Result<(), StrategyError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn shutdown(&self) -> Result<(), StrategyError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Triggers
// ============================================================================

/// Responds with the request it was given.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoTrigger;

impl Trigger for EchoTrigger {
    type Request = Value;

    fn execute(&self, request: &Value, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError> {
        ctx.finish(request.clone())?;
        Ok(())
    }
}

/// Always fails with the given message.
#[derive(Debug, Clone)]
pub struct FailingTrigger {
    message: String,
}

impl FailingTrigger {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Trigger for FailingTrigger {
    type Request = Value;

    fn execute(&self, _: &Value, _: &ExecutionContext) -> Result<(), TriggerExecutionError> {
        Err(anyhow::anyhow!("{}", self.message).into())
    }
}

/// Counts executions and responds with the running count.
#[derive(Debug, Clone, Default)]
pub struct CountingTrigger {
    count: Arc<AtomicUsize>,
}

impl CountingTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    /// A handle that keeps observing the count after the trigger is registered.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.count.clone()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Trigger for CountingTrigger {
    type Request = Value;

    fn execute(&self, _: &Value, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError> {
        let n = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.finish(n)?;
        Ok(())
    }
}

// ============================================================================
// Waiting
// ============================================================================

/// Block until `promise` settles or `timeout` passes. `None` on timeout.
///
/// Uses the promise's callback slot, so nothing else may be attached to it.
pub fn wait_for(
    promise: &TriggerPromise,
    timeout: Duration,
) -> Option<Result<Response, TriggerExecutionError>> {
    let (tx, rx) = mpsc::channel();
    let fail_tx = tx.clone();
    promise
        .then(
            move |response| {
                let _ = tx.send(Ok(response.clone()));
            },
            move |cause| {
                let _ = fail_tx.send(Err(cause.clone()));
            },
        )
        .ok()?;
    rx.recv_timeout(timeout).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use volley::{request, TriggerManager};

    fn manager(strategy: Arc<dyn HandlingStrategy>) -> TriggerManager {
        TriggerManager::builder()
            .with_handling_strategy(strategy)
            .build()
            .unwrap()
    }

    #[test]
    fn test_inline_strategy_settles_before_fire_returns() {
        let inline = Arc::new(InlineStrategy::new());
        let m = manager(inline.clone());
        m.register_trigger("echo")
            .with_action(EchoTrigger)
            .register()
            .unwrap();
        m.start().unwrap();

        let promise = m.fire("echo", request(json!({"a": 1}))).unwrap();
        assert!(promise.is_resolved());
        assert_eq!(inline.handled(), 1);
        let value = wait_for(&promise, Duration::from_secs(1)).unwrap().unwrap();
        assert_eq!(value.downcast_ref::<Value>(), Some(&json!({"a": 1})));
    }

    #[test]
    fn test_recording_strategy_defers_execution() {
        let recording = Arc::new(RecordingStrategy::new());
        let counting = CountingTrigger::new();
        let counter = counting.counter();
        let m = manager(recording.clone());
        m.register_trigger("count")
            .with_action(counting)
            .register()
            .unwrap();
        m.start().unwrap();
        assert_eq!(recording.starts(), 1);

        let first = m.fire("count", request(json!({}))).unwrap();
        let second = m.fire("count", request(json!({}))).unwrap();
        assert_eq!(recording.events(), vec!["count", "count"]);
        assert!(!first.is_resolved());

        assert_eq!(recording.run_all(), 2);
        assert!(recording.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert!(first.is_resolved() && second.is_resolved());

        m.shutdown().unwrap();
        assert_eq!(recording.shutdowns(), 1);
    }

    #[test]
    fn test_failing_trigger_and_wait_timeout() {
        let recording = Arc::new(RecordingStrategy::new());
        let m = manager(recording.clone());
        m.register_trigger("fail")
            .with_action(FailingTrigger::new("nope"))
            .register()
            .unwrap();
        m.start().unwrap();

        let promise = m.fire("fail", request(json!({}))).unwrap();
        let recorded = recording.take();
        let ctx = recorded[0].clone();
        let runner = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            ctx.execute().unwrap();
        });
        let err = wait_for(&promise, Duration::from_secs(5)).unwrap().unwrap_err();
        assert!(err.to_string().contains("nope"));
        runner.join().unwrap();

        let never = m.fire("fail", request(json!({}))).unwrap();
        assert!(wait_for(&never, Duration::from_millis(10)).is_none());
    }
}
