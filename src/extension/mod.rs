//! Extension descriptors and the merge mechanism.
//!
//! Extensions contribute app members, services, middlewares and lifecycle
//! hooks as structured descriptors. The assembler applies them in list
//! order, strictly before any middleware is bound to the transport, so the
//! final ordering is extension-order-then-declared-order, never interleaved.
//!
//! App members land in named, statically typed slots keyed by their concrete
//! type (instead of open-ended dynamic property injection); retrieval goes
//! through `App::member::<T>()` / `AppHandle::member::<T>()`.

use crate::lifecycle::{HookEntry, Phase};
use crate::pipeline::MiddlewareFn;
use crate::service::{AppHandle, ServiceDef};
use dashmap::DashMap;
use std::any::{Any, TypeId};
use std::sync::Arc;

type InstallFn = Box<dyn FnOnce(AppHandle) -> Arc<dyn Any + Send + Sync> + Send>;

/// A typed application member contributed by an extension.
///
/// The install function receives the application handle, so the member is
/// bound to the application it is installed on.
pub struct AppMember {
    pub name: String,
    type_id: TypeId,
    install: InstallFn,
}

impl AppMember {
    pub fn new<T, F>(name: impl Into<String>, install: F) -> Self
    where
        T: Send + Sync + 'static,
        F: FnOnce(AppHandle) -> T + Send + 'static,
    {
        Self {
            name: name.into(),
            type_id: TypeId::of::<T>(),
            install: Box::new(move |app| Arc::new(install(app))),
        }
    }
}

/// Type-keyed storage for installed app members.
pub(crate) struct MemberSlots {
    slots: DashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl MemberSlots {
    pub(crate) fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    pub(crate) fn install(&self, member: AppMember, app: AppHandle) {
        let value = (member.install)(app);
        self.slots.insert(member.type_id, value);
    }

    pub(crate) fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        let entry = self.slots.get(&TypeId::of::<T>())?;
        Arc::clone(entry.value()).downcast::<T>().ok()
    }
}

/// An ordered extension descriptor.
#[derive(Default)]
pub struct Extension {
    pub name: String,
    pub app_members: Vec<AppMember>,
    pub services: Vec<ServiceDef>,
    pub middlewares: Vec<MiddlewareFn>,
    pub lifecycle_hooks: Vec<(Phase, HookEntry)>,
}

impl Extension {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn app_member(mut self, member: AppMember) -> Self {
        self.app_members.push(member);
        self
    }

    pub fn service(mut self, def: ServiceDef) -> Self {
        self.services.push(def);
        self
    }

    pub fn middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn lifecycle(mut self, phase: Phase, hook: HookEntry) -> Self {
        self.lifecycle_hooks.push((phase, hook));
        self
    }
}
