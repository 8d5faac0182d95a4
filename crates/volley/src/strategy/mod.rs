//! Pluggable concurrency backends that run execution contexts.
//!
//! A [`HandlingStrategy`] takes ownership of a pending [`ExecutionContext`]
//! and guarantees it is executed exactly once on one of its workers. Three
//! implementations ship with the crate:
//!
//! | Strategy               | Producer side                 | Workers            | Shutdown          |
//! |------------------------|-------------------------------|--------------------|-------------------|
//! | [`SpinQueueStrategy`]  | busy-spins until enqueued     | busy-poll          | cancels leftovers |
//! | [`ExecutorStrategy`]   | submits to a pool             | tokio blocking pool| drains (bounded)  |
//! | [`RingBufferStrategy`] | waits only when the ring full | [`WaitStrategy`]   | drains (bounded)  |

mod executor;
mod ring_buffer;
mod spin_queue;
mod wait;

pub use executor::{ExecutorStrategy, ExecutorStrategyBuilder};
pub use ring_buffer::{RingBufferStrategy, RingBufferStrategyBuilder};
pub use spin_queue::SpinQueueStrategy;
pub use wait::WaitStrategy;

pub(crate) use wait::Waiter;

use std::fmt;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::error;

use crate::context::ExecutionContext;
use crate::error::StrategyError;

/// Concurrency backend for running triggers.
///
/// `start` and `shutdown` are idempotent. `handle` fails with
/// [`StrategyError::NotRunning`] outside `start..shutdown`; a context
/// accepted by `handle` always reaches a terminal state, either executed or
/// cancelled, before `shutdown` returns (or `shutdown` reports why not).
pub trait HandlingStrategy: Send + Sync + fmt::Debug + 'static {
    fn name(&self) -> &'static str;

    fn handle(&self, ctx: ExecutionContext) -> Result<(), StrategyError>;

    fn start(&self) -> Result<(), StrategyError> {
        Ok(())
    }

    fn shutdown(&self) -> Result<(), StrategyError> {
        Ok(())
    }

    fn is_running(&self) -> bool {
        true
    }
}

/// Execute on the current thread, logging double dispatch.
pub(crate) fn run_context(strategy: &'static str, ctx: &ExecutionContext) {
    if let Err(e) = ctx.execute() {
        error!(
            strategy,
            execution_id = %ctx.id(),
            error = %e,
            "execution context dispatched twice"
        );
    }
}

const IDLE: u8 = 0;
const STARTING: u8 = 1;
const RUNNING: u8 = 2;
const STOPPING: u8 = 3;
const STOPPED: u8 = 4;

/// Start/stop bookkeeping shared by the built-in strategies.
///
/// Producers register themselves before checking the running flag, and
/// shutdown flips the flag before waiting for registered producers, so no
/// producer can slip a context in after shutdown stopped waiting.
#[derive(Debug)]
pub(crate) struct Lifecycle {
    name: &'static str,
    state: AtomicU8,
    producers: AtomicUsize,
}

pub(crate) struct ProducerGuard<'a> {
    producers: &'a AtomicUsize,
}

impl Drop for ProducerGuard<'_> {
    fn drop(&mut self) {
        self.producers.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            state: AtomicU8::new(IDLE),
            producers: AtomicUsize::new(0),
        }
    }

    /// `Ok(true)` if the caller must bring the strategy up, `Ok(false)` if
    /// it is already up or coming up.
    pub(crate) fn begin_start(&self) -> Result<bool, StrategyError> {
        match self
            .state
            .compare_exchange(IDLE, STARTING, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => Ok(true),
            Err(STARTING | RUNNING) => Ok(false),
            Err(_) => Err(StrategyError::Stopped {
                strategy: self.name,
            }),
        }
    }

    pub(crate) fn finish_start(&self) {
        self.state.store(RUNNING, Ordering::SeqCst);
    }

    /// Marks a failed start; the strategy cannot be started again.
    pub(crate) fn abort_start(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    pub(crate) fn is_running(&self) -> bool {
        self.state.load(Ordering::SeqCst) == RUNNING
    }

    pub(crate) fn enter(&self) -> Result<ProducerGuard<'_>, StrategyError> {
        self.producers.fetch_add(1, Ordering::SeqCst);
        let guard = ProducerGuard {
            producers: &self.producers,
        };
        if self.state.load(Ordering::SeqCst) != RUNNING {
            return Err(StrategyError::NotRunning {
                strategy: self.name,
            });
        }
        Ok(guard)
    }

    /// `true` if the caller must tear the strategy down. A never-started
    /// strategy moves straight to stopped.
    pub(crate) fn begin_shutdown(&self) -> bool {
        if self
            .state
            .compare_exchange(IDLE, STOPPED, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return false;
        }
        loop {
            match self.state.compare_exchange(
                RUNNING,
                STOPPING,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                // A concurrent start has not finished yet.
                Err(STARTING) => thread::yield_now(),
                Err(_) => return false,
            }
        }
    }

    pub(crate) fn finish_shutdown(&self) {
        self.state.store(STOPPED, Ordering::SeqCst);
    }

    /// Wait until every producer that passed `enter` has left.
    pub(crate) fn wait_for_producers(&self) {
        while self.producers.load(Ordering::SeqCst) > 0 {
            thread::yield_now();
        }
    }
}

/// Poll `done` until it holds or `timeout` elapses. Returns whether it held.
pub(crate) fn wait_until_deadline(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if done() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
}
