use std::hint;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const SPIN_TRIES: u32 = 100;
const PARK_TIMEOUT: Duration = Duration::from_millis(1);

/// How an idle ring-buffer consumer waits for the next execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitStrategy {
    /// Spin on the CPU. Lowest latency, burns a core per consumer.
    BusySpin,
    /// Spin briefly, then yield the thread.
    #[default]
    Yielding,
    /// Spin briefly, then sleep on a condition variable until signalled.
    Blocking,
}

/// Parks consumers according to a [`WaitStrategy`].
#[derive(Debug)]
pub(crate) struct Waiter {
    strategy: WaitStrategy,
    lock: Mutex<()>,
    ready: Condvar,
    sleepers: AtomicUsize,
}

impl Waiter {
    pub(crate) fn new(strategy: WaitStrategy) -> Self {
        Self {
            strategy,
            lock: Mutex::new(()),
            ready: Condvar::new(),
            sleepers: AtomicUsize::new(0),
        }
    }

    /// Wait until `ready` holds (`true`) or `alert` is raised (`false`).
    pub(crate) fn wait_until(&self, alert: &AtomicBool, ready: impl Fn() -> bool) -> bool {
        let mut tries = 0u32;
        loop {
            if ready() {
                return true;
            }
            if alert.load(Ordering::SeqCst) {
                return false;
            }
            match self.strategy {
                WaitStrategy::BusySpin => hint::spin_loop(),
                _ if tries < SPIN_TRIES => {
                    tries += 1;
                    hint::spin_loop();
                }
                WaitStrategy::Yielding => thread::yield_now(),
                WaitStrategy::Blocking => return self.block(alert, &ready),
            }
        }
    }

    fn block(&self, alert: &AtomicBool, ready: &impl Fn() -> bool) -> bool {
        let mut guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.sleepers.fetch_add(1, Ordering::SeqCst);
        let woke = loop {
            if ready() {
                break true;
            }
            if alert.load(Ordering::SeqCst) {
                break false;
            }
            // The timeout bounds a wakeup lost between `ready()` and the wait.
            guard = self
                .ready
                .wait_timeout(guard, PARK_TIMEOUT)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        };
        self.sleepers.fetch_sub(1, Ordering::SeqCst);
        woke
    }

    /// Wake sleeping consumers after publishing work.
    pub(crate) fn signal(&self) {
        if self.strategy == WaitStrategy::Blocking && self.sleepers.load(Ordering::SeqCst) > 0 {
            self.signal_all();
        }
    }

    /// Wake every sleeper unconditionally, e.g. after raising the alert.
    pub(crate) fn signal_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.ready.notify_all();
    }
}
