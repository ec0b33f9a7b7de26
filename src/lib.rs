//! ensemble — application composition for HTTP services.
//!
//! An application is declared as data: services, controllers, schedulers,
//! middlewares and extensions are collected into an [`AppDescriptor`],
//! assembled into an immutable [`App`], and driven through an ordered
//! lifecycle (`setup`, `listen`, `run`, `close`) by [`App::run`].
//!
//! ```no_run
//! use ensemble::prelude::*;
//! use serde_json::{json, Value};
//! use std::sync::Arc;
//!
//! struct GreetController;
//!
//! impl Service for GreetController {}
//!
//! impl ServiceInit for GreetController {
//!     fn init(_app: AppHandle) -> anyhow::Result<Self> {
//!         Ok(Self)
//!     }
//!
//!     fn describe() {
//!         attach_route::<Self>(
//!             "greet",
//!             RouteMeta::new("/greet").method(HttpMethod::Get).input(
//!                 InputSpec::schema(json!({
//!                     "type": "object",
//!                     "properties": {"name": {"type": "string"}},
//!                     "required": ["name"]
//!                 })),
//!             ),
//!         );
//!     }
//! }
//!
//! impl Controller for GreetController {
//!     fn routes(self: Arc<Self>) -> Vec<RouteHandler> {
//!         vec![handler("greet", &self, |_c, _ctx, input| async move {
//!             let input = input.unwrap_or(Value::Null);
//!             Ok(Some(json!({ "greeting": format!("hello, {}", input["name"]) })))
//!         })]
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let app = AppDescriptor::new()
//!         .config(AppConfig::from_env())
//!         .controller(ControllerDef::new::<GreetController>())
//!         .build()?;
//!     let shutdown = app.clone().run().await?;
//!     tokio::signal::ctrl_c().await?;
//!     shutdown.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod extension;
pub mod lifecycle;
pub mod logger;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod service;
pub mod util;
pub mod validate;

pub use app::{App, AppDescriptor, Shutdown};
pub use config::AppConfig;
pub use error::{BizError, BizKind, EnsembleError, Result};

/// The common imports for declaring an application.
pub mod prelude {
    pub use crate::app::{App, AppDescriptor, Shutdown};
    pub use crate::config::AppConfig;
    pub use crate::controller::{handler, Controller, ControllerDef, RouteHandler};
    pub use crate::error::{BizError, EnsembleError, Result};
    pub use crate::event::ReadyInfo;
    pub use crate::extension::{AppMember, Extension};
    pub use crate::lifecycle::{hook, HookEntry, Phase};
    pub use crate::logger::Logger;
    pub use crate::pipeline::{middleware, Ctx, JsonMap, MiddlewareFn, Next};
    pub use crate::registry::{attach_lifecycle, attach_route, HttpMethod, InputSpec, RouteMeta, Tap};
    pub use crate::scheduler::{Scheduler, SchedulerDef, Timer};
    pub use crate::service::{
        hook_method, AppHandle, HookMethod, Service, ServiceDef, ServiceInit,
    };
}
