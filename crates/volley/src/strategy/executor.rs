use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::thread;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use super::{run_context, wait_until_deadline, HandlingStrategy, Lifecycle};
use crate::context::ExecutionContext;
use crate::error::StrategyError;

const NAME: &str = "executor";
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Fixed-size thread pool backed by a dedicated tokio runtime.
///
/// Executions run on the runtime's blocking pool, capped at `workers`
/// threads; excess work waits in the runtime's queue. The queue is
/// unbounded unless `queue_capacity` is set, in which case `handle` fails
/// fast with [`StrategyError::QueueFull`] once that many executions are
/// queued or running.
///
/// Shutdown stops accepting work and waits up to `drain_timeout` for
/// queued and running executions to finish.
#[derive(Debug)]
pub struct ExecutorStrategy {
    lifecycle: Lifecycle,
    workers: usize,
    queue_capacity: Option<usize>,
    drain_timeout: Duration,
    permits: Option<Arc<Semaphore>>,
    in_flight: Arc<AtomicUsize>,
    runtime: Mutex<Option<Runtime>>,
    handle: OnceLock<Handle>,
}

impl ExecutorStrategy {
    pub fn builder() -> ExecutorStrategyBuilder {
        ExecutorStrategyBuilder::default()
    }

    /// A pool with `workers` threads and an unbounded queue.
    pub fn new(workers: usize) -> Result<Self, StrategyError> {
        Self::builder().workers(workers).build()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> Option<usize> {
        self.queue_capacity
    }

    /// Executions accepted but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight(Arc<AtomicUsize>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl HandlingStrategy for ExecutorStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError> {
        let _producer = self.lifecycle.enter()?;
        let handle = self
            .handle
            .get()
            .ok_or(StrategyError::NotRunning { strategy: NAME })?;

        let permit = match &self.permits {
            Some(permits) => Some(permits.clone().try_acquire_owned().map_err(|_| {
                StrategyError::QueueFull {
                    strategy: NAME,
                    capacity: self.queue_capacity.unwrap_or_default(),
                }
            })?),
            None => None,
        };

        ctx.pending();
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let in_flight = InFlight(self.in_flight.clone());
        handle.spawn_blocking(move || {
            let _permit = permit;
            let _in_flight = in_flight;
            run_context(NAME, &ctx);
        });
        Ok(())
    }

    fn start(&self) -> Result<(), StrategyError> {
        if !self.lifecycle.begin_start()? {
            return Ok(());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .max_blocking_threads(self.workers)
            .thread_name("volley-executor")
            .enable_time()
            .build();
        let runtime = match runtime {
            Ok(runtime) => runtime,
            Err(source) => {
                self.lifecycle.abort_start();
                return Err(StrategyError::Spawn {
                    strategy: NAME,
                    source,
                });
            }
        };

        let _ = self.handle.set(runtime.handle().clone());
        *self.runtime.lock().unwrap_or_else(PoisonError::into_inner) = Some(runtime);
        self.lifecycle.finish_start();
        info!(
            strategy = NAME,
            workers = self.workers,
            capacity = ?self.queue_capacity,
            "strategy started"
        );
        Ok(())
    }

    fn shutdown(&self) -> Result<(), StrategyError> {
        if !self.lifecycle.begin_shutdown() {
            return Ok(());
        }
        self.lifecycle.wait_for_producers();

        let drained = wait_until_deadline(self.drain_timeout, || self.in_flight() == 0);
        if let Some(runtime) = self
            .runtime
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            runtime.shutdown_background();
        }
        self.lifecycle.finish_shutdown();

        if drained {
            info!(strategy = NAME, "strategy shut down");
            Ok(())
        } else {
            let pending = self.in_flight();
            warn!(strategy = NAME, pending, "strategy shut down before draining");
            Err(StrategyError::ShutdownTimeout {
                strategy: NAME,
                pending,
            })
        }
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

// A runtime dropped on an async thread panics, so never drop it in place.
impl Drop for ExecutorStrategy {
    fn drop(&mut self) {
        let runtime = self
            .runtime
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorStrategyBuilder {
    workers: usize,
    queue_capacity: Option<usize>,
    drain_timeout: Duration,
}

impl Default for ExecutorStrategyBuilder {
    fn default() -> Self {
        Self {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            queue_capacity: None,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl ExecutorStrategyBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Bound the number of queued plus running executions.
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<ExecutorStrategy, StrategyError> {
        if self.workers == 0 {
            return Err(StrategyError::InvalidConfig(
                "executor needs at least one worker".into(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(StrategyError::InvalidConfig(
                "executor queue capacity must be positive".into(),
            ));
        }
        Ok(ExecutorStrategy {
            lifecycle: Lifecycle::new(NAME),
            workers: self.workers,
            queue_capacity: self.queue_capacity,
            drain_timeout: self.drain_timeout,
            permits: self.queue_capacity.map(|c| Arc::new(Semaphore::new(c))),
            in_flight: Arc::new(AtomicUsize::new(0)),
            runtime: Mutex::new(None),
            handle: OnceLock::new(),
        })
    }
}
