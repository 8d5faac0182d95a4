use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};

use super::{run_context, HandlingStrategy, Lifecycle};
use crate::context::ExecutionContext;
use crate::error::StrategyError;
use crate::support::RingBuffer;

const NAME: &str = "spin_queue";

/// Bounded queue drained by a fixed pool of busy-polling threads.
///
/// `handle` retries the enqueue in a tight loop until there is room: it
/// never blocks on a lock and never drops work, at the cost of burning CPU
/// on both sides while the queue is saturated or idle.
///
/// Shutdown stops the workers at their next poll and rejects every context
/// still queued with [`TriggerExecutionError::Cancelled`](crate::TriggerExecutionError::Cancelled).
#[derive(Debug)]
pub struct SpinQueueStrategy {
    lifecycle: Lifecycle,
    queue: Arc<RingBuffer<ExecutionContext>>,
    consumers: usize,
    cancelled: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl SpinQueueStrategy {
    /// `capacity` must be a power of two, `consumers` at least one.
    pub fn new(capacity: usize, consumers: usize) -> Result<Self, StrategyError> {
        if consumers == 0 {
            return Err(StrategyError::InvalidConfig(
                "spin queue needs at least one consumer".into(),
            ));
        }
        Ok(Self {
            lifecycle: Lifecycle::new(NAME),
            queue: Arc::new(RingBuffer::with_capacity(capacity)?),
            consumers,
            cancelled: Arc::new(AtomicBool::new(false)),
            workers: Mutex::new(Vec::with_capacity(consumers)),
        })
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    fn spawn_workers(&self) -> Result<Vec<JoinHandle<()>>, StrategyError> {
        let mut handles = Vec::with_capacity(self.consumers);
        for i in 0..self.consumers {
            let queue = self.queue.clone();
            let cancelled = self.cancelled.clone();
            let spawned = thread::Builder::new()
                .name(format!("volley-spin-{i}"))
                .spawn(move || consume(&queue, &cancelled));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    self.cancelled.store(true, Ordering::SeqCst);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(StrategyError::Spawn {
                        strategy: NAME,
                        source,
                    });
                }
            }
        }
        Ok(handles)
    }
}

fn consume(queue: &RingBuffer<ExecutionContext>, cancelled: &AtomicBool) {
    debug!(strategy = NAME, "worker started");
    while !cancelled.load(Ordering::Relaxed) {
        match queue.try_pop() {
            Some(ctx) => run_context(NAME, &ctx),
            None => hint::spin_loop(),
        }
    }
    debug!(strategy = NAME, "worker exiting");
}

impl HandlingStrategy for SpinQueueStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError> {
        let _producer = self.lifecycle.enter()?;
        ctx.pending();
        let mut ctx = ctx;
        loop {
            match self.queue.try_push(ctx) {
                Ok(()) => return Ok(()),
                Err(back) => {
                    ctx = back;
                    hint::spin_loop();
                }
            }
        }
    }

    fn start(&self) -> Result<(), StrategyError> {
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }
        match self.spawn_workers() {
            Ok(handles) => {
                *self.workers.lock().unwrap_or_else(PoisonError::into_inner) = handles;
                self.lifecycle.finish_start();
                info!(
                    strategy = NAME,
                    workers = self.consumers,
                    capacity = self.queue.capacity(),
                    "strategy started"
                );
                Ok(())
            }
            Err(e) => {
                self.lifecycle.abort_start();
                Err(e)
            }
        }
    }

    fn shutdown(&self) -> Result<(), StrategyError> {
        if !self.lifecycle.begin_shutdown() {
            return Ok(());
        }
        self.lifecycle.wait_for_producers();
        self.cancelled.store(true, Ordering::SeqCst);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut result = Ok(());
        for handle in handles {
            let worker = handle.thread().name().unwrap_or("volley-spin").to_string();
            if handle.join().is_err() && result.is_ok() {
                result = Err(StrategyError::WorkerPanicked {
                    strategy: NAME,
                    worker,
                });
            }
        }

        let mut cancelled = 0usize;
        while let Some(ctx) = self.queue.try_pop() {
            if ctx.cancel().is_ok() {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            warn!(strategy = NAME, cancelled, "queued executions cancelled on shutdown");
        }

        self.lifecycle.finish_shutdown();
        info!(strategy = NAME, "strategy shut down");
        result
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ApplicationContext;
    use crate::error::TriggerExecutionError;
    use crate::registry::TriggerConfig;
    use crate::trigger::{request, trigger_fn};
    use serde_json::{json, Value};
    use std::time::Duration;

    fn context(config: &TriggerConfig) -> ExecutionContext {
        ExecutionContext::new(config.clone(), request(json!({})), ApplicationContext::default())
    }

    #[test]
    fn test_rejects_invalid_construction() {
        assert!(SpinQueueStrategy::new(3, 1).is_err());
        assert!(SpinQueueStrategy::new(8, 0).is_err());
    }

    #[test]
    fn test_handle_before_start_fails() {
        let strategy = SpinQueueStrategy::new(8, 1).unwrap();
        let config = TriggerConfig::new("e", trigger_fn::<Value, _>(|_, ctx| Ok(ctx.finish(())?)));
        assert!(matches!(
            strategy.handle(context(&config)),
            Err(StrategyError::NotRunning { .. })
        ));
    }

    #[test]
    fn test_executes_on_worker_thread() {
        let strategy = SpinQueueStrategy::new(8, 2).unwrap();
        strategy.start().unwrap();
        let config = TriggerConfig::new(
            "e",
            trigger_fn::<Value, _>(|_, ctx| {
                let name = thread::current().name().unwrap_or_default().to_string();
                Ok(ctx.finish(name)?)
            }),
        );

        let ctx = context(&config);
        let promise = ctx.promise();
        strategy.handle(ctx).unwrap();
        let value = futures::executor::block_on(promise).unwrap();
        assert!(value
            .downcast_ref::<String>()
            .unwrap()
            .starts_with("volley-spin-"));

        strategy.shutdown().unwrap();
        strategy.shutdown().unwrap();
        assert!(!strategy.is_running());
    }

    #[test]
    fn test_shutdown_cancels_queued_contexts() {
        let strategy = SpinQueueStrategy::new(16, 1).unwrap();
        strategy.start().unwrap();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        let config = TriggerConfig::new(
            "e",
            trigger_fn::<Value, _>(move |_, ctx| {
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5));
                Ok(ctx.finish(())?)
            }),
        );

        let promises: Vec<_> = (0..4)
            .map(|_| {
                let ctx = context(&config);
                let promise = ctx.promise();
                strategy.handle(ctx).unwrap();
                promise
            })
            .collect();

        // Let the single worker pick up the first context and block in it.
        thread::sleep(Duration::from_millis(50));
        let shutdown = thread::scope(|s| {
            let handle = s.spawn(|| strategy.shutdown());
            thread::sleep(Duration::from_millis(20));
            release_tx.send(()).unwrap();
            handle.join().unwrap()
        });
        shutdown.unwrap();

        let mut finished = 0;
        let mut cancelled = 0;
        for promise in &promises {
            match promise.outcome() {
                Some(Ok(_)) => finished += 1,
                Some(Err(TriggerExecutionError::Cancelled)) => cancelled += 1,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(finished + cancelled, 4);
        assert!(cancelled >= 1);
    }

    #[test]
    fn test_full_queue_holds_producer_until_space() {
        let strategy = SpinQueueStrategy::new(2, 1).unwrap();
        strategy.start().unwrap();
        let (entered_tx, entered_rx) = std::sync::mpsc::channel::<()>();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let entered_tx = Mutex::new(entered_tx);
        let release_rx = Mutex::new(release_rx);
        let config = TriggerConfig::new(
            "e",
            trigger_fn::<Value, _>(move |_, ctx| {
                let _ = entered_tx.lock().unwrap().send(());
                // Blocks until the sender is dropped.
                let _ = release_rx
                    .lock()
                    .unwrap()
                    .recv_timeout(Duration::from_secs(5));
                Ok(ctx.finish(())?)
            }),
        );

        let contexts: Vec<_> = (0..4).map(|_| context(&config)).collect();
        let promises: Vec<_> = contexts.iter().map(ExecutionContext::promise).collect();
        let mut contexts = contexts.into_iter();

        // The worker takes the first context and blocks inside it.
        strategy.handle(contexts.next().unwrap()).unwrap();
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // Two more fill the ring.
        strategy.handle(contexts.next().unwrap()).unwrap();
        strategy.handle(contexts.next().unwrap()).unwrap();
        let last = contexts.next().unwrap();

        let returned = AtomicBool::new(false);
        thread::scope(|s| {
            let producer = s.spawn(|| {
                let result = strategy.handle(last);
                returned.store(true, Ordering::SeqCst);
                result
            });

            thread::sleep(Duration::from_millis(100));
            assert!(
                !returned.load(Ordering::SeqCst),
                "handle returned while the queue was full"
            );

            drop(release_tx);
            producer.join().unwrap().unwrap();
        });
        assert!(returned.load(Ordering::SeqCst));

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while promises.iter().any(|p| !p.is_resolved()) {
            assert!(std::time::Instant::now() < deadline, "queued work never ran");
            thread::sleep(Duration::from_millis(1));
        }
        assert!(promises.iter().all(|p| matches!(p.outcome(), Some(Ok(_)))));
        strategy.shutdown().unwrap();
    }
}
