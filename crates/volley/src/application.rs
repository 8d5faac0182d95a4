//! Application-wide services handed to every execution.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// Source of execution identifiers.
pub trait IdGenerator: Send + Sync + 'static {
    fn create(&self) -> String;
}

/// Time-ordered UUIDs (v7), so ids sort roughly by creation time.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeBasedIdGenerator;

impl IdGenerator for TimeBasedIdGenerator {
    fn create(&self) -> String {
        Uuid::now_v7().to_string()
    }
}

/// Random UUIDs (v4).
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn create(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

/// Shared services available to triggers through their execution context.
///
/// Cloning is cheap; all clones see the same services. Services are looked
/// up by type:
///
/// ```ignore
/// let app = ApplicationContext::builder().with(Mailer::new()).build();
/// // inside a trigger
/// let mailer = ctx.application().get::<Mailer>().expect("mailer registered");
/// ```
#[derive(Clone)]
pub struct ApplicationContext {
    inner: Arc<Inner>,
}

struct Inner {
    id_generator: Arc<dyn IdGenerator>,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ApplicationContext {
    pub fn builder() -> ApplicationContextBuilder {
        ApplicationContextBuilder::default()
    }

    pub fn id_generator(&self) -> &dyn IdGenerator {
        self.inner.id_generator.as_ref()
    }

    pub fn next_id(&self) -> String {
        self.inner.id_generator.create()
    }

    /// Look up a service registered with [`ApplicationContextBuilder::with`].
    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner
            .services
            .get(&TypeId::of::<T>())
            .and_then(|service| service.downcast_ref::<T>())
    }
}

impl Default for ApplicationContext {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("services", &self.inner.services.len())
            .finish()
    }
}

#[derive(Default)]
pub struct ApplicationContextBuilder {
    id_generator: Option<Arc<dyn IdGenerator>>,
    services: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ApplicationContextBuilder {
    pub fn with_id_generator(mut self, generator: impl IdGenerator) -> Self {
        self.id_generator = Some(Arc::new(generator));
        self
    }

    /// Register a service. A later service of the same type replaces it.
    pub fn with<T: Any + Send + Sync>(mut self, service: T) -> Self {
        self.services.insert(TypeId::of::<T>(), Arc::new(service));
        self
    }

    pub fn build(self) -> ApplicationContext {
        ApplicationContext {
            inner: Arc::new(Inner {
                id_generator: self
                    .id_generator
                    .unwrap_or_else(|| Arc::new(TimeBasedIdGenerator)),
                services: self.services,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct Sequential(AtomicU64);

    impl IdGenerator for Sequential {
        fn create(&self) -> String {
            self.0.fetch_add(1, Ordering::SeqCst).to_string()
        }
    }

    #[derive(Debug, PartialEq)]
    struct Greeting(&'static str);

    #[test]
    fn test_time_based_ids_are_unique_and_ordered() {
        let gen = TimeBasedIdGenerator;
        let first = gen.create();
        let second = gen.create();
        assert_ne!(first, second);
        assert!(first < second);
        assert!(Uuid::parse_str(&first).is_ok());
    }

    #[test]
    fn test_custom_id_generator() {
        let app = ApplicationContext::builder()
            .with_id_generator(Sequential(AtomicU64::new(7)))
            .build();
        assert_eq!(app.next_id(), "7");
        assert_eq!(app.next_id(), "8");
    }

    #[test]
    fn test_services_are_looked_up_by_type() {
        let app = ApplicationContext::builder()
            .with(Greeting("hi"))
            .with(5u8)
            .build();
        assert_eq!(app.get::<Greeting>(), Some(&Greeting("hi")));
        assert_eq!(app.get::<u8>(), Some(&5));
        assert!(app.get::<String>().is_none());
        assert_eq!(app.clone().get::<u8>(), Some(&5));
    }
}
