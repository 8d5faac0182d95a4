//! Triggers and the payloads they exchange.
//!
//! Requests and responses cross the engine type-erased, as
//! `Arc<dyn TriggerRequest>` and `Arc<dyn TriggerResponse>`. Both traits are
//! blanket-implemented for any `Serialize + Debug + Send + Sync + 'static`
//! type, stay serializable through `erased-serde` (conditions read request
//! fields as JSON, transports serialize responses), and can be downcast back
//! to the concrete type.
//!
//! A trigger declares its request type as an associated type. Registration
//! records it as a [`RequestType`], which is what the manager uses to decode
//! raw payloads and to reject requests of the wrong type.

use std::any::{self, Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::context::ExecutionContext;
use crate::error::TriggerExecutionError;

/// A decoded request, as carried by an execution context.
pub type Request = Arc<dyn TriggerRequest>;

/// A trigger's response, as delivered through a promise.
pub type Response = Arc<dyn TriggerResponse>;

/// Payload accepted by a trigger.
pub trait TriggerRequest: erased_serde::Serialize + Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    fn type_name(&self) -> &'static str;
}

impl<T> TriggerRequest for T
where
    T: Serialize + Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        any::type_name::<T>()
    }
}

erased_serde::serialize_trait_object!(TriggerRequest);

impl dyn TriggerRequest {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.as_any().is::<T>()
    }
}

/// Payload produced by a trigger.
pub trait TriggerResponse: erased_serde::Serialize + Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;
}

impl<T> TriggerResponse for T
where
    T: Serialize + Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }
}

erased_serde::serialize_trait_object!(TriggerResponse);

impl dyn TriggerResponse {
    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Wrap a value as a type-erased [`Request`].
pub fn request<R: TriggerRequest>(value: R) -> Request {
    Arc::new(value)
}

/// The request type a trigger was registered with.
#[derive(Clone, Copy)]
pub struct RequestType {
    id: TypeId,
    name: &'static str,
    decode: fn(&str) -> Result<Request, serde_json::Error>,
}

impl RequestType {
    pub fn of<R>() -> Self
    where
        R: TriggerRequest + DeserializeOwned,
    {
        Self {
            id: TypeId::of::<R>(),
            name: any::type_name::<R>(),
            decode: decode_as::<R>,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Decode a raw JSON payload into this request type.
    pub fn decode(&self, raw: &str) -> Result<Request, serde_json::Error> {
        (self.decode)(raw)
    }

    pub fn accepts(&self, request: &dyn TriggerRequest) -> bool {
        Any::type_id(request.as_any()) == self.id
    }
}

impl PartialEq for RequestType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RequestType {}

impl fmt::Debug for RequestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

fn decode_as<R>(raw: &str) -> Result<Request, serde_json::Error>
where
    R: TriggerRequest + DeserializeOwned,
{
    Ok(Arc::new(serde_json::from_str::<R>(raw)?))
}

/// Business logic bound to an event name.
///
/// `execute` completes the firing by calling [`ExecutionContext::finish`]
/// (or `reject`). It may also hand a clone of the context to another thread
/// and complete later. Returning `Err` rejects the firing; panics are caught
/// and reported the same way.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Serialize, Deserialize)]
/// struct Greet { name: String }
///
/// struct GreetTrigger;
///
/// impl Trigger for GreetTrigger {
///     type Request = Greet;
///
///     fn execute(&self, req: &Greet, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError> {
///         ctx.finish(format!("hello {}", req.name))?;
///         Ok(())
///     }
/// }
/// ```
pub trait Trigger: Send + Sync + 'static {
    type Request: TriggerRequest + DeserializeOwned;

    fn execute(
        &self,
        request: &Self::Request,
        ctx: &ExecutionContext,
    ) -> Result<(), TriggerExecutionError>;
}

/// Closure-backed trigger. Build with [`trigger_fn`].
pub struct FnTrigger<R, F> {
    f: F,
    _request: PhantomData<fn(&R)>,
}

impl<R, F> Trigger for FnTrigger<R, F>
where
    R: TriggerRequest + DeserializeOwned,
    F: Fn(&R, &ExecutionContext) -> Result<(), TriggerExecutionError> + Send + Sync + 'static,
{
    type Request = R;

    fn execute(&self, request: &R, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError> {
        (self.f)(request, ctx)
    }
}

/// Adapt a closure into a [`Trigger`] for request type `R`.
pub fn trigger_fn<R, F>(f: F) -> FnTrigger<R, F>
where
    R: TriggerRequest + DeserializeOwned,
    F: Fn(&R, &ExecutionContext) -> Result<(), TriggerExecutionError> + Send + Sync + 'static,
{
    FnTrigger {
        f,
        _request: PhantomData,
    }
}

/// Type-erased trigger stored in a config.
pub(crate) trait Action: Send + Sync + 'static {
    fn request_type(&self) -> RequestType;

    fn run(&self, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError>;
}

struct TypedAction<T>(T);

impl<T: Trigger> Action for TypedAction<T> {
    fn request_type(&self) -> RequestType {
        RequestType::of::<T::Request>()
    }

    fn run(&self, ctx: &ExecutionContext) -> Result<(), TriggerExecutionError> {
        let request = ctx
            .request()
            .downcast_ref::<T::Request>()
            .ok_or(TriggerExecutionError::RequestTypeMismatch {
                expected: any::type_name::<T::Request>(),
            })?;
        self.0.execute(request, ctx)
    }
}

pub(crate) fn erase<T: Trigger>(trigger: T) -> Arc<dyn Action> {
    Arc::new(TypedAction(trigger))
}
