use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::{run_context, wait_until_deadline, HandlingStrategy, Lifecycle, WaitStrategy, Waiter};
use crate::context::ExecutionContext;
use crate::error::StrategyError;
use crate::support::RingBuffer;

const NAME: &str = "ring_buffer";
const DEFAULT_CAPACITY: usize = 1024;
const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Disruptor-style pipeline over a pre-allocated ring.
///
/// Any number of producers publish into the ring; `consumers` threads
/// claim entries in publish order. Both sides wait under the configured
/// [`WaitStrategy`], producers only while the ring is full and consumers
/// only while it is empty.
///
/// Shutdown drains every published context (bounded by `drain_timeout`),
/// then alerts and joins the consumers. Contexts still queued after a
/// timed-out drain are cancelled.
#[derive(Debug)]
pub struct RingBufferStrategy {
    lifecycle: Lifecycle,
    shared: Arc<Shared>,
    consumers: usize,
    drain_timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
struct Shared {
    ring: RingBuffer<ExecutionContext>,
    wait_strategy: WaitStrategy,
    readable: Waiter,
    writable: Waiter,
    alert: AtomicBool,
    published: AtomicUsize,
    processed: AtomicUsize,
}

impl RingBufferStrategy {
    pub fn builder() -> RingBufferStrategyBuilder {
        RingBufferStrategyBuilder::default()
    }

    pub fn capacity(&self) -> usize {
        self.shared.ring.capacity()
    }

    pub fn consumers(&self) -> usize {
        self.consumers
    }

    pub fn wait_strategy(&self) -> WaitStrategy {
        self.shared.wait_strategy
    }

    fn spawn_workers(&self) -> Result<Vec<JoinHandle<()>>, StrategyError> {
        let mut handles = Vec::with_capacity(self.consumers);
        for i in 0..self.consumers {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("volley-ring-{i}"))
                .spawn(move || consume(&shared));
            match spawned {
                Ok(handle) => handles.push(handle),
                Err(source) => {
                    self.shared.alert.store(true, Ordering::SeqCst);
                    self.shared.readable.signal_all();
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

fn consume(shared: &Shared) {
    debug!(strategy = NAME, "consumer started");
    loop {
        if let Some(ctx) = shared.ring.try_pop() {
            shared.writable.signal();
            run_context(NAME, &ctx);
            shared.processed.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        if !shared
            .readable
            .wait_until(&shared.alert, || shared.ring.has_next())
        {
            break;
        }
    }
    debug!(strategy = NAME, "consumer exiting");
}

impl HandlingStrategy for RingBufferStrategy {
    fn name(&self) -> &'static str {
        NAME
    }

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError> {
        let _producer = self.lifecycle.enter()?;
        let shared = &self.shared;
        ctx.pending();

        let mut ctx = ctx;
        loop {
            match shared.ring.try_push(ctx) {
                Ok(()) => break,
                Err(back) => {
                    ctx = back;
                    // Consumers are only alerted after every producer left,
                    // so this wait ends with free space.
                    if !shared
                        .writable
                        .wait_until(&shared.alert, || shared.ring.has_space())
                    {
                        return Err(StrategyError::NotRunning { strategy: NAME });
                    }
                }
            }
        }
        shared.published.fetch_add(1, Ordering::SeqCst);
        shared.readable.signal();
        Ok(())
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
                    capacity = self.capacity(),
                    wait_strategy = ?self.shared.wait_strategy,
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

        let shared = &self.shared;
        let drained = wait_until_deadline(self.drain_timeout, || {
            shared.processed.load(Ordering::SeqCst) >= shared.published.load(Ordering::SeqCst)
        });
        let pending = shared
            .published
            .load(Ordering::SeqCst)
            .saturating_sub(shared.processed.load(Ordering::SeqCst));

        shared.alert.store(true, Ordering::SeqCst);
        shared.readable.signal_all();
        shared.writable.signal_all();

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let mut result = Ok(());
        for handle in handles {
            let worker = handle.thread().name().unwrap_or("volley-ring").to_string();
            if handle.join().is_err() && result.is_ok() {
                result = Err(StrategyError::WorkerPanicked {
                    strategy: NAME,
                    worker,
                });
            }
        }

        while let Some(ctx) = shared.ring.try_pop() {
            let _ = ctx.cancel();
        }
        self.lifecycle.finish_shutdown();

        if !drained {
            warn!(strategy = NAME, pending, "strategy shut down before draining");
            if result.is_ok() {
                result = Err(StrategyError::ShutdownTimeout {
                    strategy: NAME,
                    pending,
                });
            }
        } else {
            info!(strategy = NAME, "strategy shut down");
        }
        result
    }

    fn is_running(&self) -> bool {
        self.lifecycle.is_running()
    }
}

#[derive(Debug, Clone)]
pub struct RingBufferStrategyBuilder {
    capacity: usize,
    consumers: usize,
    wait_strategy: WaitStrategy,
    drain_timeout: Duration,
}

impl Default for RingBufferStrategyBuilder {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            consumers: 1,
            wait_strategy: WaitStrategy::default(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

impl RingBufferStrategyBuilder {
    /// Ring size; must be a power of two.
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn consumers(mut self, consumers: usize) -> Self {
        self.consumers = consumers;
        self
    }

    pub fn wait_strategy(mut self, wait_strategy: WaitStrategy) -> Self {
        self.wait_strategy = wait_strategy;
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<RingBufferStrategy, StrategyError> {
        if self.consumers == 0 {
            return Err(StrategyError::InvalidConfig(
                "ring buffer needs at least one consumer".into(),
            ));
        }
        Ok(RingBufferStrategy {
            lifecycle: Lifecycle::new(NAME),
            shared: Arc::new(Shared {
                ring: RingBuffer::with_capacity(self.capacity)?,
                wait_strategy: self.wait_strategy,
                readable: Waiter::new(self.wait_strategy),
                writable: Waiter::new(self.wait_strategy),
                alert: AtomicBool::new(false),
                published: AtomicUsize::new(0),
                processed: AtomicUsize::new(0),
            }),
            consumers: self.consumers,
            drain_timeout: self.drain_timeout,
            workers: Mutex::new(Vec::with_capacity(self.consumers)),
        })
    }
}
