//! The firing facade.

use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use serde_json::Value;
use tracing::{error, trace};

use crate::application::ApplicationContext;
use crate::config::{ManagerConfig, StrategyConfig};
use crate::context::{ExecutionContext, TriggerPromise};
use crate::error::{RegistryError, Result, TriggerError, TriggerExecutionError};
use crate::registry::{RegistryPhase, TriggerConfig, TriggerRegistration, TriggerRegistry};
use crate::strategy::HandlingStrategy;
use crate::trigger::{Request, Response};

/// Registers triggers, then fires them by event name.
///
/// # Example
///
/// ```ignore
/// let manager = TriggerManager::builder().build()?;
/// manager
///     .register_trigger("greet")
///     .with_action(trigger_fn::<Greet, _>(|req, ctx| Ok(ctx.finish(format!("hi {}", req.name))?)))
///     .register()?;
/// manager.start()?;
///
/// let response = manager.fire("greet", request(Greet { name: "ada".into() }))?.await?;
/// ```
pub struct TriggerManager {
    registry: TriggerRegistry,
    application: ApplicationContext,
    default_strategy: Mutex<Arc<dyn HandlingStrategy>>,
    active_strategy: OnceLock<Arc<dyn HandlingStrategy>>,
}

impl TriggerManager {
    pub fn builder() -> TriggerManagerBuilder {
        TriggerManagerBuilder::default()
    }

    pub fn registry(&self) -> &TriggerRegistry {
        &self.registry
    }

    pub fn application_context(&self) -> &ApplicationContext {
        &self.application
    }

    /// Start registering a trigger under `name`.
    pub fn register_trigger(&self, name: impl Into<String>) -> TriggerRegistration<'_> {
        self.registry.register_trigger(name)
    }

    /// Register a fully built config under its own name.
    pub fn register_trigger_config(&self, config: TriggerConfig) -> Result<()> {
        Ok(self.registry.register(config)?)
    }

    /// The strategy used by triggers that have none of their own.
    pub fn handling_strategy(&self) -> Arc<dyn HandlingStrategy> {
        match self.active_strategy.get() {
            Some(strategy) => strategy.clone(),
            None => self.lock_default().clone(),
        }
    }

    /// Replace the default strategy. Only allowed before [`start`](Self::start).
    pub fn set_handling_strategy(&self, strategy: Arc<dyn HandlingStrategy>) -> Result<()> {
        let mut default = self.lock_default();
        match self.registry.phase() {
            RegistryPhase::New => {
                *default = strategy;
                Ok(())
            }
            RegistryPhase::Starting | RegistryPhase::Started => {
                Err(RegistryError::AlreadyStarted.into())
            }
            RegistryPhase::ShutDown => Err(TriggerError::ShutDown),
        }
    }

    /// Freeze registrations and start the strategies. Idempotent.
    pub fn start(&self) -> Result<()> {
        let default = self.lock_default();
        self.registry.start(Some(default.clone()))?;
        let _ = self.active_strategy.set(default.clone());
        Ok(())
    }

    /// Stop every strategy. Idempotent; firing afterwards fails.
    pub fn shutdown(&self) -> Result<()> {
        Ok(self.registry.shutdown()?)
    }

    /// Decode a raw JSON payload into the request type registered for `name`.
    pub fn decode_request_for_event(&self, name: &str, raw: &str) -> Result<Request> {
        let configs = self.configs_for(name)?;
        let config = configs
            .first()
            .ok_or_else(|| TriggerError::NoMatchingTrigger {
                name: name.to_string(),
            })?;
        config
            .request_type()
            .decode(raw)
            .map_err(|e| TriggerError::MalformedRequest {
                name: name.to_string(),
                reason: e.to_string(),
            })
    }

    /// Fire `name` on the matching trigger's strategy.
    ///
    /// Errors are synchronous: if this returns `Err`, nothing was executed.
    pub fn fire(&self, name: &str, request: Request) -> Result<TriggerPromise> {
        self.dispatch(name, request, None)
    }

    /// Fire with callbacks instead of a returned promise.
    pub fn fire_with_callbacks<D, F>(
        &self,
        name: &str,
        request: Request,
        done: D,
        fail: F,
    ) -> Result<()>
    where
        D: FnOnce(&Response) + Send + 'static,
        F: FnOnce(&TriggerExecutionError) + Send + 'static,
    {
        let promise = self.dispatch(name, request, None)?;
        if let Err(e) = promise.then(done, fail) {
            error!(event = name, error = %e, "could not attach firing callbacks");
        }
        Ok(())
    }

    /// Fire on `strategy`, ignoring the strategy the trigger was registered with.
    pub fn fire_with_strategy(
        &self,
        name: &str,
        request: Request,
        strategy: &Arc<dyn HandlingStrategy>,
    ) -> Result<TriggerPromise> {
        self.dispatch(name, request, Some(strategy))
    }

    /// Decode `raw` for `name` and fire it.
    pub fn fire_raw(&self, name: &str, raw: &str) -> Result<TriggerPromise> {
        let request = self.decode_request_for_event(name, raw)?;
        self.fire(name, request)
    }

    fn dispatch(
        &self,
        name: &str,
        request: Request,
        strategy_override: Option<&Arc<dyn HandlingStrategy>>,
    ) -> Result<TriggerPromise> {
        let configs = self.configs_for(name)?;
        let config = select(name, configs, &request)?;

        let request_type = config.request_type();
        if !request_type.accepts(&*request) {
            return Err(TriggerError::MalformedRequest {
                name: name.to_string(),
                reason: format!(
                    "expected {}, got {}",
                    request_type.name(),
                    request.type_name()
                ),
            });
        }

        let strategy = match strategy_override.or(config.strategy()) {
            Some(strategy) => strategy.clone(),
            None => self.handling_strategy(),
        };

        let ctx = ExecutionContext::new(config.clone(), request, self.application.clone());
        ctx.pending();
        let promise = ctx.promise();
        trace!(
            event = name,
            execution_id = %ctx.id(),
            strategy = strategy.name(),
            "firing"
        );
        strategy.handle(ctx)?;
        Ok(promise)
    }

    fn configs_for(&self, name: &str) -> Result<&[TriggerConfig]> {
        self.registry.trigger_configs(name).map_err(|e| match e {
            RegistryError::NotStarted => TriggerError::NotStarted,
            RegistryError::ShutDown => TriggerError::ShutDown,
            other => other.into(),
        })
    }

    fn lock_default(&self) -> std::sync::MutexGuard<'_, Arc<dyn HandlingStrategy>> {
        self.default_strategy
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// First config in registration order whose condition matches. Request
/// fields are only serialized if some config has a condition.
fn select<'a>(
    name: &str,
    configs: &'a [TriggerConfig],
    request: &Request,
) -> Result<&'a TriggerConfig> {
    let mut fields: Option<Value> = None;
    for config in configs {
        let Some(condition) = config.condition() else {
            return Ok(config);
        };
        let fields = match &mut fields {
            Some(fields) => fields,
            empty => empty.insert(serde_json::to_value(&**request).map_err(|e| {
                TriggerError::MalformedRequest {
                    name: name.to_string(),
                    reason: e.to_string(),
                }
            })?),
        };
        if condition.matches(fields) {
            return Ok(config);
        }
    }
    Err(TriggerError::NoMatchingTrigger {
        name: name.to_string(),
    })
}

impl fmt::Debug for TriggerManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TriggerManager")
            .field("registry", &self.registry)
            .field("strategy", &self.handling_strategy().name())
            .finish()
    }
}

#[derive(Default)]
pub struct TriggerManagerBuilder {
    application: Option<ApplicationContext>,
    strategy: Option<Arc<dyn HandlingStrategy>>,
    strategy_config: Option<StrategyConfig>,
}

impl TriggerManagerBuilder {
    pub fn with_application_context(mut self, application: ApplicationContext) -> Self {
        self.application = Some(application);
        self
    }

    /// Default strategy. Takes precedence over [`with_config`](Self::with_config).
    pub fn with_handling_strategy(mut self, strategy: Arc<dyn HandlingStrategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.strategy_config = Some(config.default_strategy);
        self
    }

    pub fn build(self) -> Result<TriggerManager> {
        let strategy = match self.strategy {
            Some(strategy) => strategy,
            None => self.strategy_config.unwrap_or_default().build()?,
        };
        Ok(TriggerManager {
            registry: TriggerRegistry::new(),
            application: self.application.unwrap_or_default(),
            default_strategy: Mutex::new(strategy),
            active_strategy: OnceLock::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrategyError;
    use crate::trigger::{request, trigger_fn};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug)]
    struct Inline;

    impl HandlingStrategy for Inline {
        fn name(&self) -> &'static str {
            "inline"
        }

        fn handle(&self, ctx: ExecutionContext) -> std::result::Result<(), StrategyError> {
            let _ = ctx.execute();
            Ok(())
        }
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Order {
        kind: String,
        qty: u32,
    }

    fn manager() -> TriggerManager {
        TriggerManager::builder()
            .with_handling_strategy(Arc::new(Inline))
            .build()
            .unwrap()
    }

    fn tagged(tag: &'static str) -> impl crate::Trigger<Request = Order> {
        trigger_fn::<Order, _>(move |_, ctx| Ok(ctx.finish(tag)?))
    }

    fn tag_of(promise: &TriggerPromise) -> &'static str {
        match promise.outcome() {
            Some(Ok(v)) => v.downcast_ref::<&'static str>().copied().unwrap(),
            other => panic!("unexpected outcome {other:?}"),
        }
    }

    #[test]
    fn test_first_matching_config_wins() {
        let m = manager();
        m.register_trigger("order")
            .with_action(tagged("bulk"))
            .with_expression("qty >= 100")
            .register()
            .unwrap();
        m.register_trigger("order")
            .with_action(tagged("express"))
            .with_expression("kind == \"express\"")
            .register()
            .unwrap();
        m.register_trigger("order")
            .with_action(tagged("default"))
            .register()
            .unwrap();
        m.start().unwrap();

        let fire = |kind: &str, qty| {
            m.fire("order", request(Order { kind: kind.into(), qty }))
                .unwrap()
        };
        assert_eq!(tag_of(&fire("express", 500)), "bulk");
        assert_eq!(tag_of(&fire("express", 1)), "express");
        assert_eq!(tag_of(&fire("normal", 1)), "default");
    }

    #[test]
    fn test_no_match_is_synchronous() {
        let m = manager();
        m.register_trigger("order")
            .with_action(tagged("only"))
            .with_expression("kind == \"a\"")
            .register()
            .unwrap();
        m.start().unwrap();

        let err = m
            .fire("order", request(Order { kind: "b".into(), qty: 1 }))
            .unwrap_err();
        assert!(matches!(err, TriggerError::NoMatchingTrigger { .. }));
        assert!(matches!(
            m.fire("nothing", request(json!({}))),
            Err(TriggerError::NoMatchingTrigger { .. })
        ));
    }

    #[test]
    fn test_lifecycle_errors() {
        let m = manager();
        m.register_trigger("order")
            .with_action(tagged("x"))
            .register()
            .unwrap();
        let req = || request(Order { kind: "a".into(), qty: 1 });

        assert!(matches!(m.fire("order", req()), Err(TriggerError::NotStarted)));
        m.start().unwrap();
        m.start().unwrap();
        assert!(matches!(
            m.set_handling_strategy(Arc::new(Inline)),
            Err(TriggerError::Registry(RegistryError::AlreadyStarted))
        ));
        m.shutdown().unwrap();
        m.shutdown().unwrap();
        assert!(matches!(m.fire("order", req()), Err(TriggerError::ShutDown)));
    }

    #[test]
    fn test_decode_and_fire_raw() {
        let m = manager();
        m.register_trigger("order")
            .with_action(trigger_fn::<Order, _>(|req, ctx| Ok(ctx.finish(req.qty * 2)?)))
            .register()
            .unwrap();
        m.start().unwrap();

        let decoded = m
            .decode_request_for_event("order", r#"{"kind":"a","qty":4}"#)
            .unwrap();
        assert_eq!(decoded.downcast_ref::<Order>().unwrap().qty, 4);

        let promise = m.fire_raw("order", r#"{"kind":"a","qty":21}"#).unwrap();
        let value = futures::executor::block_on(promise).unwrap();
        assert_eq!(value.downcast_ref::<u32>(), Some(&42));

        assert!(matches!(
            m.fire_raw("order", r#"{"qty":"many"}"#),
            Err(TriggerError::MalformedRequest { .. })
        ));
        assert!(matches!(
            m.fire("order", request("wrong type".to_string())),
            Err(TriggerError::MalformedRequest { .. })
        ));
    }

    #[test]
    fn test_fire_with_callbacks_and_failures() {
        let m = manager();
        m.register_trigger("boom")
            .with_action(trigger_fn::<Value, _>(|_, _| {
                Err(TriggerExecutionError::msg("exploded"))
            }))
            .register()
            .unwrap();
        m.start().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        m.fire_with_callbacks(
            "boom",
            request(json!({})),
            |_| panic!("should not succeed"),
            move |e| tx.send(e.to_string()).unwrap(),
        )
        .unwrap();
        assert!(rx.recv().unwrap().contains("exploded"));
    }

    #[test]
    fn test_strategy_override() {
        #[derive(Debug)]
        struct Refusing;

        impl HandlingStrategy for Refusing {
            fn name(&self) -> &'static str {
                "refusing"
            }

            fn handle(&self, _: ExecutionContext) -> std::result::Result<(), StrategyError> {
                Err(StrategyError::NotRunning { strategy: "refusing" })
            }
        }

        let m = manager();
        m.register_trigger("order")
            .with_action(tagged("x"))
            .register()
            .unwrap();
        m.start().unwrap();

        let refusing: Arc<dyn HandlingStrategy> = Arc::new(Refusing);
        let req = request(Order { kind: "a".into(), qty: 1 });
        assert!(matches!(
            m.fire_with_strategy("order", req, &refusing),
            Err(TriggerError::Strategy(StrategyError::NotRunning { .. }))
        ));
    }

    #[test]
    fn test_only_strategy_refusals_consume_an_execution_id() {
        use crate::application::IdGenerator;
        use std::sync::atomic::{AtomicUsize, Ordering};

        #[derive(Clone, Default)]
        struct Counting(Arc<AtomicUsize>);

        impl IdGenerator for Counting {
            fn create(&self) -> String {
                self.0.fetch_add(1, Ordering::SeqCst).to_string()
            }
        }

        #[derive(Debug)]
        struct Full;

        impl HandlingStrategy for Full {
            fn name(&self) -> &'static str {
                "full"
            }

            fn handle(&self, _: ExecutionContext) -> std::result::Result<(), StrategyError> {
                Err(StrategyError::QueueFull { strategy: "full", capacity: 0 })
            }
        }

        let ids = Counting::default();
        let m = TriggerManager::builder()
            .with_application_context(
                ApplicationContext::builder().with_id_generator(ids.clone()).build(),
            )
            .with_handling_strategy(Arc::new(Full))
            .build()
            .unwrap();
        m.register_trigger("order")
            .with_action(tagged("x"))
            .with_expression("qty > 10")
            .register()
            .unwrap();
        m.start().unwrap();

        let small = || request(Order { kind: "a".into(), qty: 1 });
        assert!(matches!(m.fire("order", small()), Err(TriggerError::NoMatchingTrigger { .. })));
        assert!(matches!(m.fire_raw("order", "{}"), Err(TriggerError::MalformedRequest { .. })));
        assert_eq!(ids.0.load(Ordering::SeqCst), 0);

        let large = request(Order { kind: "a".into(), qty: 50 });
        assert!(matches!(
            m.fire("order", large),
            Err(TriggerError::Strategy(StrategyError::QueueFull { .. }))
        ));
        assert_eq!(ids.0.load(Ordering::SeqCst), 1);
    }
}
