//! Controllers: services whose methods can be routes.
//!
//! A controller lists its handler methods by name; during assembly each name
//! is checked against the metadata registry and, when a route descriptor is
//! attached, a request pipeline is wired for it.

use crate::error::Result;
use crate::pipeline::Ctx;
use crate::service::{AppHandle, Service, ServiceInit};
use futures::future::BoxFuture;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

pub type RouteInvoke =
    Arc<dyn Fn(Arc<Ctx>, Option<Value>) -> BoxFuture<'static, Result<Option<Value>>> + Send + Sync>;

/// A controller method offered for route discovery.
pub struct RouteHandler {
    pub name: &'static str,
    pub invoke: RouteInvoke,
}

/// Box a controller method into a [`RouteHandler`].
///
/// The handler receives the request context and the validated input (when
/// the route declares an input spec); a non-empty return value becomes the
/// response body.
pub fn handler<C, F, Fut>(name: &'static str, controller: &Arc<C>, f: F) -> RouteHandler
where
    C: Send + Sync + 'static,
    F: Fn(Arc<C>, Arc<Ctx>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Value>>> + Send + 'static,
{
    let controller = Arc::clone(controller);
    RouteHandler {
        name,
        invoke: Arc::new(move |ctx, input| Box::pin(f(Arc::clone(&controller), ctx, input))),
    }
}

/// A service whose methods may carry route descriptors.
pub trait Controller: Service {
    /// The instance's handler methods, walked at assembly time.
    fn routes(self: Arc<Self>) -> Vec<RouteHandler>;
}

pub(crate) type ConstructController =
    Box<dyn FnOnce(AppHandle) -> anyhow::Result<Arc<dyn Controller>> + Send>;

/// Type-erased controller constructor entry.
pub struct ControllerDef {
    pub(crate) construct: ConstructController,
}

impl ControllerDef {
    pub fn new<C: Controller + ServiceInit>() -> Self {
        Self {
            construct: Box::new(|app| {
                C::describe();
                Ok(Arc::new(C::init(app)?) as Arc<dyn Controller>)
            }),
        }
    }
}
