//! Service base capabilities.
//!
//! Services, controllers and schedulers all share the same base capability
//! set: a config accessor, a sibling-service accessor and a logger scoped to
//! the instance's type name, all reached through a non-owning [`AppHandle`]
//! back-reference. Instances are owned exclusively by the application and are
//! constructed with the shared handle during assembly.

use crate::config::AppConfig;
use crate::error::Result;
use crate::extension::MemberSlots;
use crate::logger::Logger;
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::any::Any;
use std::future::Future;
use std::sync::{Arc, Weak};

/// Upcasting support for concrete service types.
///
/// Implemented for every `'static + Send + Sync` type; gives the assembler
/// access to the concrete `TypeId` behind `dyn Service` and lets
/// [`AppHandle::service_as`] downcast shared instances.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_arc(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// The short type name (without module path) used to derive instance names.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    full.rsplit("::").next().unwrap_or(full)
}

/// A niladic async method exposed by a service for lifecycle discovery.
///
/// During assembly each service's listed methods are checked against the
/// metadata registry; methods tagged with a lifecycle phase become hooks.
pub struct HookMethod {
    pub name: &'static str,
    pub invoke: Arc<dyn Fn() -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

/// Box a service method into a [`HookMethod`].
pub fn hook_method<S, F, Fut>(name: &'static str, instance: &Arc<S>, f: F) -> HookMethod
where
    S: Service,
    F: Fn(Arc<S>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    let instance = Arc::clone(instance);
    HookMethod {
        name,
        invoke: Arc::new(move || Box::pin(f(Arc::clone(&instance)))),
    }
}

/// Base trait for everything the application owns: services, controllers and
/// schedulers.
pub trait Service: AsAny + Send + Sync + 'static {
    /// Name derived from the declaring type.
    fn type_name(&self) -> &'static str {
        short_type_name::<Self>()
    }

    /// The instance's own methods offered for lifecycle discovery.
    fn hook_methods(self: Arc<Self>) -> Vec<HookMethod> {
        Vec::new()
    }
}

/// Construction seam for services.
///
/// `describe` is the registration-time counterpart of a decorator: it runs
/// before the first instance is built and attaches route / lifecycle
/// metadata to the registry. A failing `init` aborts assembly entirely.
pub trait ServiceInit: Service + Sized {
    fn init(app: AppHandle) -> anyhow::Result<Self>;

    /// Attach declarative metadata for this type. Attachment is idempotent;
    /// the registry keeps the first descriptor per (type, method).
    fn describe() {}
}

pub(crate) type ServiceMap = DashMap<String, Arc<dyn Service>>;
pub(crate) type ConstructService =
    Box<dyn FnOnce(AppHandle) -> anyhow::Result<Arc<dyn Service>> + Send>;

/// A named, type-erased service constructor entry.
pub struct ServiceDef {
    pub name: String,
    pub(crate) construct: ConstructService,
}

impl ServiceDef {
    pub fn new<S: ServiceInit>(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            construct: Box::new(|app| {
                S::describe();
                Ok(Arc::new(S::init(app)?) as Arc<dyn Service>)
            }),
        }
    }
}

/// Cloneable, non-owning back-reference to the application.
///
/// Holds the config and a logger directly; the service map and the typed
/// app-member slots are reached through weak references, so a handle never
/// keeps a torn-down application alive.
#[derive(Clone)]
pub struct AppHandle {
    config: Arc<AppConfig>,
    logger: Logger,
    services: Weak<ServiceMap>,
    members: Weak<MemberSlots>,
}

impl AppHandle {
    pub(crate) fn attached(
        config: Arc<AppConfig>,
        logger: Logger,
        services: &Arc<ServiceMap>,
        members: &Arc<MemberSlots>,
    ) -> Self {
        Self {
            config,
            logger,
            services: Arc::downgrade(services),
            members: Arc::downgrade(members),
        }
    }

    /// A handle not attached to any application; sibling and member lookups
    /// return `None`. Useful in tests.
    pub fn detached(config: AppConfig, logger: Logger) -> Self {
        Self {
            config: Arc::new(config),
            logger,
            services: Weak::new(),
            members: Weak::new(),
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Logger scoped to the given instance name.
    pub fn scoped_logger(&self, name: &str) -> Logger {
        self.logger.extend(name)
    }

    /// Look up a sibling service by its registered name.
    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        let map = self.services.upgrade()?;
        let entry = map.get(name)?;
        Some(Arc::clone(entry.value()))
    }

    /// Look up a sibling service and downcast it to its concrete type.
    pub fn service_as<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.service(name)?.as_any_arc().downcast::<T>().ok()
    }

    /// Look up a typed app member contributed by an extension.
    pub fn member<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.members.upgrade()?.get::<T>()
    }

    /// JWT helper bound to the configured signing secret.
    pub fn jwt(&self) -> crate::util::Jwt {
        crate::util::Jwt::new(&self.config.auth_salt)
    }

    /// Spawn a fire-and-forget task; failures are logged, never propagated.
    pub fn run_in_background<Fut>(&self, fut: Fut)
    where
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let logger = self.logger.clone();
        tokio::spawn(async move {
            if let Err(e) = fut.await {
                logger.error(format!("[background] {e:#}"));
            }
        });
    }
}
