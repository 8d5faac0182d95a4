//! End-to-end firing through the manager with real and test strategies.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use volley::{
    request, trigger_fn, ApplicationContext, ExecutionContext, HandlingStrategy, IdGenerator,
    ManagerConfig, RegistryError, SpinQueueStrategy, Trigger, TriggerConfig,
    TriggerExecutionError, TriggerError, TriggerManager, TriggerPromise,
};
use volley_testing::{
    wait_for, CountingTrigger, EchoTrigger, FailingTrigger, InlineStrategy, RecordingStrategy,
};

// ============================================================================
// Fixtures
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Ticket {
    field: String,
    priority: u8,
}

fn tagged(tag: &'static str) -> impl Trigger<Request = Ticket> {
    trigger_fn::<Ticket, _>(move |_, ctx| Ok(ctx.finish(tag)?))
}

fn inline_manager() -> (TriggerManager, Arc<InlineStrategy>) {
    let inline = Arc::new(InlineStrategy::new());
    let manager = TriggerManager::builder()
        .with_handling_strategy(inline.clone())
        .build()
        .unwrap();
    (manager, inline)
}

const WAIT: Duration = Duration::from_secs(5);

// ============================================================================
// Routing
// ============================================================================

#[test]
fn test_conditional_config_beats_later_unconditional() {
    let (manager, _) = inline_manager();
    manager
        .register_trigger("ticket")
        .with_expression(r#"field == "a""#)
        .with_action(tagged("conditional"))
        .register()
        .unwrap();
    manager
        .register_trigger("ticket")
        .with_action(tagged("fallback"))
        .register()
        .unwrap();
    manager.start().unwrap();

    let hit = manager
        .fire("ticket", request(Ticket { field: "a".into(), priority: 1 }))
        .unwrap();
    let miss = manager
        .fire("ticket", request(Ticket { field: "b".into(), priority: 1 }))
        .unwrap();

    let tag = |p: &TriggerPromise| {
        let response = wait_for(p, WAIT).unwrap().unwrap();
        *response.downcast_ref::<&'static str>().unwrap()
    };
    assert_eq!(tag(&hit), "conditional");
    assert_eq!(tag(&miss), "fallback");
}

#[test]
fn test_predicate_conditions() {
    let (manager, _) = inline_manager();
    manager
        .register_trigger("ticket")
        .with_condition(|fields: &Value| fields["priority"].as_u64() > Some(5))
        .with_action(tagged("urgent"))
        .register()
        .unwrap();
    manager.start().unwrap();

    let urgent = manager
        .fire("ticket", request(Ticket { field: "x".into(), priority: 9 }))
        .unwrap();
    assert!(matches!(urgent.outcome(), Some(Ok(_))));
    assert!(matches!(
        manager.fire("ticket", request(Ticket { field: "x".into(), priority: 1 })),
        Err(TriggerError::NoMatchingTrigger { .. })
    ));
}

#[test]
fn test_unknown_event_never_reaches_a_strategy() {
    let (manager, inline) = inline_manager();
    manager
        .register_trigger("echo")
        .with_action(EchoTrigger)
        .register()
        .unwrap();
    manager.start().unwrap();

    let err = manager.fire("nope", request(json!({}))).unwrap_err();
    assert!(matches!(err, TriggerError::NoMatchingTrigger { ref name } if name == "nope"));
    assert_eq!(inline.handled(), 0);
}

// ============================================================================
// Lifecycle
// ============================================================================

#[test]
fn test_registration_closes_at_start() {
    let (manager, _) = inline_manager();
    manager.start().unwrap();
    manager.start().unwrap();

    let late = manager
        .register_trigger("late")
        .with_action(EchoTrigger)
        .register();
    assert!(matches!(late, Err(RegistryError::AlreadyStarted)));

    manager.shutdown().unwrap();
    manager.shutdown().unwrap();
    assert!(matches!(
        manager.fire("late", request(json!({}))),
        Err(TriggerError::ShutDown)
    ));
}

#[test]
fn test_dedicated_strategy_isolates_a_trigger() {
    let (manager, inline) = inline_manager();
    let recording = Arc::new(RecordingStrategy::new());
    manager
        .register_trigger_config(
            TriggerConfig::new("isolated", CountingTrigger::new()).with_strategy(recording.clone()),
        )
        .unwrap();
    manager
        .register_trigger("shared")
        .with_action(EchoTrigger)
        .register()
        .unwrap();
    manager.start().unwrap();
    assert_eq!(recording.starts(), 1);

    manager.fire("isolated", request(json!({}))).unwrap();
    manager.fire("shared", request(json!({}))).unwrap();
    assert_eq!(recording.events(), vec!["isolated"]);
    assert_eq!(inline.handled(), 1);

    // A per-call override wins over both.
    let override_strategy: Arc<dyn HandlingStrategy> = inline.clone();
    let promise = manager
        .fire_with_strategy("isolated", request(json!({})), &override_strategy)
        .unwrap();
    assert!(promise.is_resolved());
    assert_eq!(recording.len(), 1);

    manager.shutdown().unwrap();
    assert_eq!(recording.shutdowns(), 1);
}

// ============================================================================
// Execution
// ============================================================================

#[test]
fn test_spin_queue_worker_survives_panicking_trigger() {
    let manager = TriggerManager::builder()
        .with_handling_strategy(Arc::new(SpinQueueStrategy::new(16, 1).unwrap()))
        .build()
        .unwrap();
    manager
        .register_trigger("explode")
        .with_action(trigger_fn::<Value, _>(|_, _| panic!("trigger bug")))
        .register()
        .unwrap();
    let counting = CountingTrigger::new();
    let counter = counting.counter();
    manager
        .register_trigger("count")
        .with_action(counting)
        .register()
        .unwrap();
    manager.start().unwrap();

    let exploded = manager.fire("explode", request(json!({}))).unwrap();
    match wait_for(&exploded, WAIT) {
        Some(Err(TriggerExecutionError::Panicked(message))) => assert_eq!(message, "trigger bug"),
        other => panic!("unexpected outcome {other:?}"),
    }

    let counted = manager.fire("count", request(json!({}))).unwrap();
    assert!(wait_for(&counted, WAIT).unwrap().is_ok());
    assert_eq!(counter.load(Ordering::SeqCst), 1);
    manager.shutdown().unwrap();
}

#[test]
fn test_failure_is_delivered_to_fail_callback() {
    let (manager, _) = inline_manager();
    manager
        .register_trigger("fail")
        .with_action(FailingTrigger::new("disk full"))
        .register()
        .unwrap();
    manager.start().unwrap();

    let (tx, rx) = std::sync::mpsc::channel();
    manager
        .fire_with_callbacks(
            "fail",
            request(json!({})),
            |_| panic!("unexpected success"),
            move |cause| tx.send(cause.to_string()).unwrap(),
        )
        .unwrap();
    assert!(rx.recv_timeout(WAIT).unwrap().contains("disk full"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trigger_completes_from_another_thread() {
    let manager = TriggerManager::builder()
        .with_config(ManagerConfig::from_json(r#"{"default_strategy": {"kind": "executor", "workers": 2}}"#).unwrap())
        .build()
        .unwrap();
    manager
        .register_trigger("later")
        .with_action(trigger_fn::<Value, _>(|req, ctx: &ExecutionContext| {
            let ctx = ctx.clone();
            let echo = req.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                ctx.finish(echo).unwrap();
            });
            Ok(())
        }))
        .register()
        .unwrap();
    manager.start().unwrap();

    let promise = manager.fire_raw("later", r#"{"k": "v"}"#).unwrap();
    let response = tokio::time::timeout(WAIT, promise).await.unwrap().unwrap();
    assert_eq!(response.downcast_ref::<Value>(), Some(&json!({"k": "v"})));
    manager.shutdown().unwrap();
}

#[test]
fn test_application_services_and_ids_reach_triggers() {
    struct Fixed;

    impl IdGenerator for Fixed {
        fn create(&self) -> String {
            "exec-1".to_string()
        }
    }

    struct Greeting(&'static str);

    let application = ApplicationContext::builder()
        .with_id_generator(Fixed)
        .with(Greeting("hello"))
        .build();
    let manager = TriggerManager::builder()
        .with_application_context(application)
        .with_handling_strategy(Arc::new(InlineStrategy::new()))
        .build()
        .unwrap();
    manager
        .register_trigger("greet")
        .with_action(trigger_fn::<Value, _>(|req, ctx| {
            let greeting = ctx
                .application()
                .get::<Greeting>()
                .ok_or_else(|| TriggerExecutionError::msg("greeting service missing"))?;
            let name = req["name"].as_str().unwrap_or("stranger");
            Ok(ctx.finish(format!("{} {} ({})", greeting.0, name, ctx.id()))?)
        }))
        .register()
        .unwrap();
    manager.start().unwrap();

    let promise = manager.fire_raw("greet", r#"{"name": "ada"}"#).unwrap();
    let response = wait_for(&promise, WAIT).unwrap().unwrap();
    assert_eq!(
        response.downcast_ref::<String>().map(String::as_str),
        Some("hello ada (exec-1)")
    );
}

#[test]
fn test_malformed_raw_payload_is_synchronous() {
    let (manager, inline) = inline_manager();
    manager
        .register_trigger("ticket")
        .with_action(tagged("t"))
        .register()
        .unwrap();
    manager.start().unwrap();

    assert!(matches!(
        manager.fire_raw("ticket", r#"{"field": 3}"#),
        Err(TriggerError::MalformedRequest { .. })
    ));
    assert!(matches!(
        manager.decode_request_for_event("ticket", "not json"),
        Err(TriggerError::MalformedRequest { .. })
    ));
    assert_eq!(inline.handled(), 0);
}
