//! Serde-loadable strategy and manager configuration.
//!
//! ```json
//! {
//!   "default_strategy": {
//!     "kind": "ring_buffer",
//!     "capacity": 4096,
//!     "consumers": 2,
//!     "wait_strategy": "blocking"
//!   }
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StrategyError;
use crate::strategy::{
    ExecutorStrategy, HandlingStrategy, RingBufferStrategy, SpinQueueStrategy, WaitStrategy,
};

fn default_capacity() -> usize {
    1024
}

fn default_consumers() -> usize {
    1
}

fn default_drain_timeout_ms() -> u64 {
    30_000
}

/// Which handling strategy to build, with its knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StrategyConfig {
    SpinQueue {
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default = "default_consumers")]
        consumers: usize,
    },
    Executor {
        /// Defaults to the available parallelism.
        #[serde(default)]
        workers: Option<usize>,
        #[serde(default)]
        queue_capacity: Option<usize>,
        #[serde(default = "default_drain_timeout_ms")]
        drain_timeout_ms: u64,
    },
    RingBuffer {
        #[serde(default = "default_capacity")]
        capacity: usize,
        #[serde(default = "default_consumers")]
        consumers: usize,
        #[serde(default)]
        wait_strategy: WaitStrategy,
        #[serde(default = "default_drain_timeout_ms")]
        drain_timeout_ms: u64,
    },
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self::Executor {
            workers: None,
            queue_capacity: None,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl StrategyConfig {
    pub fn build(&self) -> Result<Arc<dyn HandlingStrategy>, StrategyError> {
        let strategy: Arc<dyn HandlingStrategy> = match *self {
            Self::SpinQueue {
                capacity,
                consumers,
            } => Arc::new(SpinQueueStrategy::new(capacity, consumers)?),
            Self::Executor {
                workers,
                queue_capacity,
                drain_timeout_ms,
            } => {
                let mut builder = ExecutorStrategy::builder()
                    .drain_timeout(Duration::from_millis(drain_timeout_ms));
                if let Some(workers) = workers {
                    builder = builder.workers(workers);
                }
                if let Some(capacity) = queue_capacity {
                    builder = builder.queue_capacity(capacity);
                }
                Arc::new(builder.build()?)
            }
            Self::RingBuffer {
                capacity,
                consumers,
                wait_strategy,
                drain_timeout_ms,
            } => Arc::new(
                RingBufferStrategy::builder()
                    .capacity(capacity)
                    .consumers(consumers)
                    .wait_strategy(wait_strategy)
                    .drain_timeout(Duration::from_millis(drain_timeout_ms))
                    .build()?,
            ),
        };
        Ok(strategy)
    }
}

/// Top-level configuration for a [`TriggerManager`](crate::TriggerManager).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    #[serde(default)]
    pub default_strategy: StrategyConfig,
}

impl ManagerConfig {
    pub fn from_json(raw: &str) -> Result<Self, StrategyError> {
        serde_json::from_str(raw).map_err(|e| StrategyError::InvalidConfig(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_executor() {
        let config = ManagerConfig::from_json("{}").unwrap();
        assert_eq!(config.default_strategy, StrategyConfig::default());
        assert_eq!(config.default_strategy.build().unwrap().name(), "executor");
    }

    #[test]
    fn test_parse_each_kind() {
        let spin = ManagerConfig::from_json(
            r#"{"default_strategy": {"kind": "spin_queue", "consumers": 3}}"#,
        )
        .unwrap();
        assert_eq!(
            spin.default_strategy,
            StrategyConfig::SpinQueue {
                capacity: 1024,
                consumers: 3
            }
        );

        let ring = ManagerConfig::from_json(
            r#"{"default_strategy": {"kind": "ring_buffer", "capacity": 64, "wait_strategy": "busy_spin"}}"#,
        )
        .unwrap();
        let built = ring.default_strategy.build().unwrap();
        assert_eq!(built.name(), "ring_buffer");

        let executor = ManagerConfig::from_json(
            r#"{"default_strategy": {"kind": "executor", "workers": 2, "queue_capacity": 8}}"#,
        )
        .unwrap();
        assert_eq!(executor.default_strategy.build().unwrap().name(), "executor");
    }

    #[test]
    fn test_invalid_config_is_reported() {
        assert!(ManagerConfig::from_json(r#"{"default_strategy": {"kind": "fifo"}}"#).is_err());

        let bad_ring = StrategyConfig::RingBuffer {
            capacity: 1000,
            consumers: 1,
            wait_strategy: WaitStrategy::Yielding,
            drain_timeout_ms: 10,
        };
        assert!(matches!(
            bad_ring.build(),
            Err(StrategyError::InvalidConfig(_))
        ));
    }
}
