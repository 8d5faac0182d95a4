//! # Greeter Example
//!
//! Reads `<event> <json>` lines from stdin, fires each one, and prints the
//! response. Strategy configuration comes from the JSON file named by the
//! first argument or `VOLLEY_CONFIG`, falling back to the executor default.
//!
//! ```text
//! $ echo 'greet {"name": "ada"}' | cargo run -p greeter-demo
//! ok   greet "hello ada"
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use volley::{trigger_fn, ApplicationContext, ManagerConfig, Trigger, TriggerManager};

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct Greet {
    #[serde(default)]
    name: String,
    #[serde(default)]
    language: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Farewell {
    name: String,
}

// ============================================================================
// Services
// ============================================================================

/// Counts greetings across all workers.
#[derive(Default)]
struct Tally(AtomicU64);

// ============================================================================
// Triggers
// ============================================================================

fn anonymous() -> impl Trigger<Request = Greet> {
    trigger_fn::<Greet, _>(|_, ctx| Ok(ctx.finish("hello, whoever you are")?))
}

fn french() -> impl Trigger<Request = Greet> {
    trigger_fn::<Greet, _>(|req, ctx| Ok(ctx.finish(format!("bonjour {}", req.name))?))
}

fn plain() -> impl Trigger<Request = Greet> {
    trigger_fn::<Greet, _>(|req, ctx| {
        let seen = ctx
            .application()
            .get::<Tally>()
            .map(|tally| tally.0.fetch_add(1, Ordering::Relaxed) + 1)
            .unwrap_or_default();
        Ok(ctx.finish(format!("hello {} (greeting #{seen})", req.name))?)
    })
}

fn farewell() -> impl Trigger<Request = Farewell> {
    trigger_fn::<Farewell, _>(|req, ctx| {
        if req.name.trim().is_empty() {
            return Err(anyhow::anyhow!("cannot say goodbye to nobody").into());
        }
        Ok(ctx.finish(format!("goodbye {}", req.name))?)
    })
}

// ============================================================================
// Setup
// ============================================================================

fn load_config() -> Result<ManagerConfig> {
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("VOLLEY_CONFIG").ok());
    let Some(path) = path else {
        return Ok(ManagerConfig::default());
    };
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?;
    ManagerConfig::from_json(&raw).with_context(|| format!("parsing {path}"))
}

fn build_manager(config: ManagerConfig) -> Result<TriggerManager> {
    let application = ApplicationContext::builder()
        .with(Tally::default())
        .build();
    let manager = TriggerManager::builder()
        .with_application_context(application)
        .with_config(config)
        .build()?;

    // Conditional configs first: an unconditional one ends the chain.
    manager
        .register_trigger("greet")
        .with_expression(r#"name == """#)
        .with_action(anonymous())
        .register()?;
    manager
        .register_trigger("greet")
        .with_expression(r#"language == "fr""#)
        .with_action(french())
        .register()?;
    manager
        .register_trigger("greet")
        .with_action(plain())
        .register()?;
    manager
        .register_trigger("farewell")
        .with_action(farewell())
        .register()?;

    Ok(manager)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let manager = Arc::new(build_manager(load_config()?)?);
    manager.start()?;
    info!(
        strategy = manager.handling_strategy().name(),
        "greeter ready, reading events from stdin"
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut pending = Vec::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (event, payload) = line.split_once(' ').unwrap_or((line, "{}"));
        let event = event.to_string();

        // Routing failures surface here, before anything runs.
        let promise = match manager.fire_raw(&event, payload) {
            Ok(promise) => promise,
            Err(e) => {
                warn!(event = %event, error = %e, "rejected");
                println!("err  {event} {e}");
                continue;
            }
        };

        pending.push(tokio::spawn(async move {
            match promise.await {
                Ok(response) => {
                    let body = serde_json::to_string(&*response)
                        .unwrap_or_else(|e| format!("<unserializable: {e}>"));
                    println!("ok   {event} {body}");
                }
                Err(e) => println!("fail {event} {e}"),
            }
        }));
    }

    for task in pending {
        task.await?;
    }
    manager.shutdown()?;
    info!("greeter stopped");
    Ok(())
}
