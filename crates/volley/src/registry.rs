//! Trigger registrations and their two-phase storage.
//!
//! Before `start()` registrations go into a concurrent map of growable
//! lists. `start()` freezes that map into an immutable snapshot that any
//! number of firing threads read without synchronization, and brings up
//! every distinct handling strategy the configs reference.
//!
//! ```text
//! NEW --start()--> STARTING --> STARTED --shutdown()--> SHUT_DOWN
//!  └──────────────────────shutdown()─────────────────────────┘
//! ```
//!
//! `start()` and `shutdown()` are serialized: a shutdown that arrives while
//! strategies are still coming up waits for them and then stops them.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use dashmap::DashMap;
use serde_json::Value;
use smallvec::SmallVec;
use tracing::{debug, error, info};

use crate::condition::{Condition, ConditionError, Expression};
use crate::error::{RegistryError, StrategyError};
use crate::strategy::HandlingStrategy;
use crate::trigger::{erase, Action, RequestType, Trigger};

/// An immutable registration: a trigger bound to an event name, with an
/// optional condition and an optional dedicated strategy.
#[derive(Clone)]
pub struct TriggerConfig {
    name: Arc<str>,
    action: Arc<dyn Action>,
    request_type: RequestType,
    condition: Option<Arc<dyn Condition>>,
    strategy: Option<Arc<dyn HandlingStrategy>>,
}

impl TriggerConfig {
    pub fn new<T: Trigger>(name: impl Into<Arc<str>>, trigger: T) -> Self {
        let action = erase(trigger);
        Self {
            name: name.into(),
            request_type: action.request_type(),
            action,
            condition: None,
            strategy: None,
        }
    }

    pub fn with_condition(mut self, condition: impl Condition) -> Self {
        self.condition = Some(Arc::new(condition));
        self
    }

    /// Run this trigger on its own strategy instead of the manager default.
    pub fn with_strategy(mut self, strategy: Arc<dyn HandlingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn condition(&self) -> Option<&Arc<dyn Condition>> {
        self.condition.as_ref()
    }

    pub fn strategy(&self) -> Option<&Arc<dyn HandlingStrategy>> {
        self.strategy.as_ref()
    }

    /// Whether this config is eligible for a request with these fields.
    /// Unconditional configs always are.
    pub fn matches(&self, fields: &Value) -> bool {
        self.condition.as_ref().map_or(true, |c| c.matches(fields))
    }

    pub(crate) fn action(&self) -> &Arc<dyn Action> {
        &self.action
    }
}

impl fmt::Debug for TriggerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerConfig")
            .field("name", &self.name)
            .field("request_type", &self.request_type)
            .field("condition", &self.condition.as_ref().map(|c| c.describe()))
            .field("strategy", &self.strategy.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Builder returned by `register_trigger`. Nothing is registered until
/// [`register`](Self::register) is called.
#[must_use = "a trigger registration does nothing until `register()` is called"]
pub struct TriggerRegistration<'a> {
    registry: &'a TriggerRegistry,
    name: String,
    action: Option<(Arc<dyn Action>, RequestType)>,
    condition: Option<Result<Arc<dyn Condition>, ConditionError>>,
    strategy: Option<Arc<dyn HandlingStrategy>>,
}

impl<'a> TriggerRegistration<'a> {
    pub(crate) fn new(registry: &'a TriggerRegistry, name: impl Into<String>) -> Self {
        Self {
            registry,
            name: name.into(),
            action: None,
            condition: None,
            strategy: None,
        }
    }

    pub fn with_action<T: Trigger>(mut self, trigger: T) -> Self {
        let action = erase(trigger);
        let request_type = action.request_type();
        self.action = Some((action, request_type));
        self
    }

    pub fn with_condition(mut self, condition: impl Condition) -> Self {
        self.condition = Some(Ok(Arc::new(condition)));
        self
    }

    /// Guard the trigger with an expression such as `kind == "a" && n > 2`.
    /// A parse error is reported by [`register`](Self::register).
    pub fn with_expression(mut self, source: &str) -> Self {
        self.condition = Some(
            Expression::parse(source).map(|e| Arc::new(e) as Arc<dyn Condition>),
        );
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn HandlingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn register(self) -> Result<(), RegistryError> {
        let Some((action, request_type)) = self.action else {
            return Err(RegistryError::MissingAction { name: self.name });
        };
        let condition = match self.condition {
            Some(Ok(condition)) => Some(condition),
            Some(Err(source)) => {
                return Err(RegistryError::InvalidCondition {
                    name: self.name,
                    source,
                })
            }
            None => None,
        };
        self.registry.register(TriggerConfig {
            name: self.name.into(),
            action,
            request_type,
            condition,
            strategy: self.strategy,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryPhase {
    New,
    /// Snapshot taken, strategies still coming up.
    Starting,
    Started,
    ShutDown,
}

const NEW: u8 = 0;
const STARTING: u8 = 1;
const STARTED: u8 = 2;
const SHUT_DOWN: u8 = 3;

type StrategyList = SmallVec<[Arc<dyn HandlingStrategy>; 4]>;

#[derive(Default)]
pub struct TriggerRegistry {
    phase: AtomicU8,
    transition: Mutex<()>,
    pending: DashMap<String, Vec<TriggerConfig>>,
    frozen: OnceLock<HashMap<String, Box<[TriggerConfig]>>>,
    strategies: OnceLock<StrategyList>,
}

impl TriggerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> RegistryPhase {
        match self.phase.load(Ordering::SeqCst) {
            NEW => RegistryPhase::New,
            STARTING => RegistryPhase::Starting,
            STARTED => RegistryPhase::Started,
            _ => RegistryPhase::ShutDown,
        }
    }

    pub fn register_trigger(&self, name: impl Into<String>) -> TriggerRegistration<'_> {
        TriggerRegistration::new(self, name)
    }

    /// Append a config under its name.
    ///
    /// Rejected once the registry has started, if its request type differs
    /// from earlier configs under the same name, or if an unconditional
    /// config already sits in front of it.
    pub fn register(&self, config: TriggerConfig) -> Result<(), RegistryError> {
        // The phase is checked under the entry guard: `start()` cannot
        // snapshot this shard until the guard is released.
        let mut entry = self.pending.entry(config.name().to_string()).or_default();
        match self.phase() {
            RegistryPhase::New => {}
            RegistryPhase::Starting | RegistryPhase::Started => {
                return Err(RegistryError::AlreadyStarted)
            }
            RegistryPhase::ShutDown => return Err(RegistryError::ShutDown),
        }

        if let Some(existing) = entry.first() {
            if existing.request_type() != config.request_type() {
                return Err(RegistryError::RequestTypeConflict {
                    name: config.name().to_string(),
                    existing: existing.request_type().name(),
                    requested: config.request_type().name(),
                });
            }
        }
        if entry.iter().any(|c| c.condition().is_none()) {
            return Err(RegistryError::UnreachableTrigger {
                name: config.name().to_string(),
            });
        }

        debug!(
            event = %config.name(),
            request_type = config.request_type().name(),
            conditional = config.condition().is_some(),
            "trigger registered"
        );
        entry.push(config);
        Ok(())
    }

    /// Freeze registrations and start every distinct strategy once.
    ///
    /// `default_strategy` is the strategy used by configs without their own;
    /// it is started alongside them. Idempotent: a concurrent caller returns
    /// only once the strategies are up. Fails after shutdown.
    pub fn start(
        &self,
        default_strategy: Option<Arc<dyn HandlingStrategy>>,
    ) -> Result<(), RegistryError> {
        let _transition = self.lock_transition();
        match self.phase.load(Ordering::SeqCst) {
            NEW => {}
            STARTED => return Ok(()),
            _ => return Err(RegistryError::ShutDown),
        }
        // Registrations check the phase under their entry guard, so every
        // one either lands before the snapshot below or is rejected.
        self.phase.store(STARTING, Ordering::SeqCst);

        let frozen: HashMap<String, Box<[TriggerConfig]>> = self
            .pending
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| (entry.key().clone(), entry.value().clone().into_boxed_slice()))
            .collect();
        let triggers: usize = frozen.values().map(|configs| configs.len()).sum();
        let events = frozen.len();

        let mut strategies = StrategyList::new();
        let referenced = frozen
            .values()
            .flat_map(|configs| configs.iter().filter_map(|c| c.strategy().cloned()));
        for strategy in default_strategy.into_iter().chain(referenced) {
            if !strategies.iter().any(|s| same_strategy(s, &strategy)) {
                strategies.push(strategy);
            }
        }
        let _ = self.frozen.set(frozen);

        for (i, strategy) in strategies.iter().enumerate() {
            if let Err(e) = strategy.start() {
                error!(strategy = strategy.name(), error = %e, "strategy failed to start");
                for started in &strategies[..i] {
                    if let Err(e) = started.shutdown() {
                        error!(strategy = started.name(), error = %e, "strategy failed to stop");
                    }
                }
                self.phase.store(SHUT_DOWN, Ordering::SeqCst);
                return Err(e.into());
            }
        }

        info!(
            events,
            triggers,
            strategies = strategies.len(),
            "trigger registry started"
        );
        let _ = self.strategies.set(strategies);
        self.phase.store(STARTED, Ordering::SeqCst);
        Ok(())
    }

    /// Stop every strategy started by [`start`](Self::start). Idempotent;
    /// every strategy is stopped even if an earlier one fails, and the first
    /// failure is returned.
    pub fn shutdown(&self) -> Result<(), RegistryError> {
        let _transition = self.lock_transition();
        if self.phase.swap(SHUT_DOWN, Ordering::SeqCst) != STARTED {
            return Ok(());
        }

        let mut first: Option<StrategyError> = None;
        for strategy in self.strategies() {
            if let Err(e) = strategy.shutdown() {
                error!(strategy = strategy.name(), error = %e, "strategy failed to stop");
                first.get_or_insert(e);
            }
        }
        info!("trigger registry shut down");
        match first {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    /// The configs registered under `name`, in registration order. Empty if
    /// none were registered. Only available while started.
    pub fn trigger_configs(&self, name: &str) -> Result<&[TriggerConfig], RegistryError> {
        match self.phase() {
            RegistryPhase::New | RegistryPhase::Starting => {
                return Err(RegistryError::NotStarted)
            }
            RegistryPhase::ShutDown => return Err(RegistryError::ShutDown),
            RegistryPhase::Started => {}
        }
        let frozen = self.frozen.get().ok_or(RegistryError::NotStarted)?;
        Ok(frozen.get(name).map_or(&[][..], |configs| &configs[..]))
    }

    /// Event names with at least one trigger, once started.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.frozen
            .get()
            .into_iter()
            .flat_map(|frozen| frozen.keys().map(String::as_str))
    }

    fn lock_transition(&self) -> std::sync::MutexGuard<'_, ()> {
        self.transition.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Strategies brought up by `start()`.
    pub fn strategies(&self) -> &[Arc<dyn HandlingStrategy>] {
        self.strategies.get().map_or(&[][..], |s| &s[..])
    }
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerRegistry")
            .field("phase", &self.phase())
            .field("events", &self.pending.len())
            .finish()
    }
}

fn same_strategy(a: &Arc<dyn HandlingStrategy>, b: &Arc<dyn HandlingStrategy>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
