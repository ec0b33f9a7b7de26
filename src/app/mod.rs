//! Application assembly and the run cycle.
//!
//! An [`AppDescriptor`] collects configuration, member definitions and
//! lifecycle hooks; [`AppDescriptor::build`] turns it into an immutable
//! [`App`] aggregate with every instance constructed, every route wired and
//! every scheduler prepared. Assembly failures abort before anything
//! observable happens.
//!
//! [`App::run`] then drives the startup sequence: `setup` hooks, listener
//! bind, `listen` hooks, scheduler start, `run` hooks, ready signal. The
//! returned [`Shutdown`] token drives the reverse: `close` hooks, graceful
//! listener drain, scheduler stop, closed signal. Each application goes
//! through this cycle at most once.

use crate::config::AppConfig;
use crate::controller::ControllerDef;
use crate::error::{EnsembleError, Result};
use crate::event::{ReadyInfo, Signals};
use crate::extension::{Extension, MemberSlots};
use crate::lifecycle::{
    self, HookEntry, Phase, PhaseHooks, Stage, StageCell,
};
use crate::logger::Logger;
use crate::pipeline::{build_router, wire_controller, HttpEntry, MiddlewareFn, RoutePipeline};
use crate::registry;
use crate::scheduler::{self, ScheduledTask, SchedulerDef};
use crate::service::{AppHandle, AsAny, Service, ServiceDef, ServiceMap};
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle as ServerHandle;
use dashmap::DashMap;
use futures::FutureExt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// Everything an application is composed from.
#[derive(Default)]
pub struct AppDescriptor {
    config: AppConfig,
    services: Vec<ServiceDef>,
    controllers: Vec<ControllerDef>,
    schedulers: Vec<SchedulerDef>,
    middlewares: Vec<MiddlewareFn>,
    extensions: Vec<Extension>,
    hooks: PhaseHooks,
    logger: Option<Logger>,
}

impl AppDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }

    pub fn service(mut self, def: ServiceDef) -> Self {
        self.services.push(def);
        self
    }

    pub fn controller(mut self, def: ControllerDef) -> Self {
        self.controllers.push(def);
        self
    }

    pub fn scheduler(mut self, def: SchedulerDef) -> Self {
        self.schedulers.push(def);
        self
    }

    /// App-level middleware, run for every route before the error boundary.
    pub fn middleware(mut self, middleware: MiddlewareFn) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub fn extension(mut self, extension: Extension) -> Self {
        self.extensions.push(extension);
        self
    }

    /// Explicit lifecycle hook; runs before any discovered or
    /// extension-contributed hook of the same phase.
    pub fn lifecycle(mut self, phase: Phase, entry: HookEntry) -> Self {
        self.hooks.push(phase, entry);
        self
    }

    pub fn logger(mut self, logger: Logger) -> Self {
        self.logger = Some(logger);
        self
    }

    /// Construct the application aggregate. Any member constructor failure,
    /// unroutable controller or invalid scheduler timer rejects the whole
    /// build.
    pub fn build(self) -> Result<Arc<App>> {
        let config = Arc::new(self.config);
        let logger = self.logger.unwrap_or_default();

        let services: Arc<ServiceMap> = Arc::new(DashMap::new());
        let members = Arc::new(MemberSlots::new());
        let handle = AppHandle::attached(Arc::clone(&config), logger.clone(), &services, &members);

        // Instances in registration order, kept for hook discovery.
        let mut ordered: Vec<(String, Arc<dyn Service>)> = Vec::new();
        let mut register = |def: ServiceDef| -> Result<()> {
            let ServiceDef { name, construct } = def;
            let instance = construct(handle.clone())
                .map_err(|e| EnsembleError::assembly(format!("service {name}: {e:#}")))?;
            logger.info(format!("register service: {name}"));
            if services.insert(name.clone(), Arc::clone(&instance)).is_some() {
                // Later registration replaces, keeping the first slot's position.
                let slot = ordered.iter_mut().find(|(n, _)| *n == name);
                if let Some((_, existing)) = slot {
                    *existing = instance;
                }
            } else {
                ordered.push((name, instance));
            }
            Ok(())
        };

        for def in self.services {
            register(def)?;
        }

        let mut middlewares = self.middlewares;
        let mut extension_hooks: Vec<(Phase, HookEntry)> = Vec::new();
        for extension in self.extensions {
            logger.info(format!("register extension: {}", extension.name));
            for member in extension.app_members {
                logger.info(format!("register appMember: {}", member.name));
                members.install(member, handle.clone());
            }
            for def in extension.services {
                register(def)?;
            }
            middlewares.extend(extension.middlewares);
            extension_hooks.extend(extension.lifecycle_hooks);
        }
        drop(register);

        let mut controllers = Vec::with_capacity(self.controllers.len());
        for def in self.controllers {
            let instance = (def.construct)(handle.clone())
                .map_err(|e| EnsembleError::assembly(format!("controller: {e:#}")))?;
            controllers.push(instance);
        }

        let mut scheduler_instances = Vec::with_capacity(self.schedulers.len());
        for def in self.schedulers {
            let instance = (def.construct)(handle.clone())
                .map_err(|e| EnsembleError::assembly(format!("scheduler: {e:#}")))?;
            scheduler_instances.push(instance);
        }

        // Hook order per phase: explicit, then discovered from annotated
        // methods in registration order, then extension hooks.
        let mut hooks = self.hooks;
        for (_, instance) in &ordered {
            discover_hooks(Arc::clone(instance), &mut hooks, &logger);
        }
        for instance in &controllers {
            discover_hooks(Arc::clone(instance) as Arc<dyn Service>, &mut hooks, &logger);
        }
        for instance in &scheduler_instances {
            discover_hooks(Arc::clone(instance) as Arc<dyn Service>, &mut hooks, &logger);
        }
        for (phase, entry) in extension_hooks {
            hooks.push(phase, entry);
        }

        let mut pipelines: Vec<Arc<RoutePipeline>> = Vec::new();
        for controller in controllers {
            pipelines.extend(wire_controller(controller, &logger)?);
        }

        let mut scheduled = Vec::with_capacity(scheduler_instances.len());
        for instance in scheduler_instances {
            logger.info(format!("register scheduler: {}", instance.type_name()));
            scheduled.push(scheduler::prepare(instance, &logger)?);
        }

        Ok(Arc::new(App {
            config,
            logger,
            handle,
            services,
            members,
            middlewares,
            hooks,
            pipelines,
            scheduled: Mutex::new(Some(scheduled)),
            signals: Arc::new(Signals::new()),
            stage: StageCell::new(),
        }))
    }
}

fn discover_hooks(instance: Arc<dyn Service>, hooks: &mut PhaseHooks, logger: &Logger) {
    let type_id = instance.as_any().type_id();
    let owner = instance.type_name();
    for method in instance.hook_methods() {
        let Some(phase) = registry::lifecycle_meta(type_id, method.name) else {
            continue;
        };
        let name = format!("{owner}.{}", method.name);
        logger.info(format!("register lifeCycle: {phase} -> {name}"));
        let invoke = method.invoke;
        hooks.push(
            phase,
            HookEntry {
                name,
                invoke: Arc::new(move |_app| invoke()),
            },
        );
    }
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

/// The assembled application aggregate.
pub struct App {
    config: Arc<AppConfig>,
    logger: Logger,
    handle: AppHandle,
    services: Arc<ServiceMap>,
    members: Arc<MemberSlots>,
    middlewares: Vec<MiddlewareFn>,
    hooks: PhaseHooks,
    pipelines: Vec<Arc<RoutePipeline>>,
    scheduled: Mutex<Option<Vec<ScheduledTask>>>,
    signals: Arc<Signals>,
    stage: StageCell,
}

impl App {
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn handle(&self) -> &AppHandle {
        &self.handle
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.services.get(name).map(|e| Arc::clone(e.value()))
    }

    pub fn service_as<T: Service>(&self, name: &str) -> Option<Arc<T>> {
        self.service(name)?.as_any_arc().downcast::<T>().ok()
    }

    pub fn member<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.members.get::<T>()
    }

    /// Observe the ready signal: fires once, after the `run` phase settles.
    pub fn on_ready(&self, f: impl Fn(&ReadyInfo) + Send + Sync + 'static) {
        self.signals.on_ready(f);
    }

    /// Observe the closed signal: fires once, at the end of shutdown.
    pub fn on_closed(&self, f: impl Fn() + Send + Sync + 'static) {
        self.signals.on_closed(f);
    }

    /// Observe request-handling errors that escaped the error boundary.
    pub fn on_error(&self, f: impl Fn(&EnsembleError) + Send + Sync + 'static) {
        self.signals.on_error(f);
    }

    /// Drive the startup sequence to completion.
    ///
    /// On success the listener is accepting requests, every scheduler is
    /// running and the ready signal has fired; the returned [`Shutdown`]
    /// token is the only way to stop the application. A `setup` hook failure
    /// aborts before the listener binds; a bind failure aborts before
    /// `listen` hooks run.
    pub async fn run(self: Arc<Self>) -> Result<Shutdown> {
        self.stage.advance(Stage::Idle, Stage::Setup)?;
        self.logger.info(format!("config: {}", self.config.summary()));

        lifecycle::run_phase(
            Phase::Setup,
            self.hooks.hooks(Phase::Setup),
            &self.handle,
            &self.logger,
        )
        .await?;

        let addr = self.resolve_addr()?;
        let entry = Arc::new(HttpEntry {
            handle: self.handle.clone(),
            logger: self.logger.clone(),
            middlewares: self.middlewares.clone(),
            signals: Arc::clone(&self.signals),
        });
        let router = build_router(&self.pipelines, &entry);

        let server = ServerHandle::new();
        let server_task = match self.config.tls_material() {
            Some((key, cert)) => {
                let tls = RustlsConfig::from_pem_file(cert, key).await?;
                tokio::spawn(
                    axum_server::bind_rustls(addr, tls)
                        .handle(server.clone())
                        .serve(router.into_make_service()),
                )
            }
            None => tokio::spawn(
                axum_server::bind(addr)
                    .handle(server.clone())
                    .serve(router.into_make_service()),
            ),
        };

        let Some(bound) = server.listening().await else {
            return Err(match server_task.await {
                Ok(Err(e)) => EnsembleError::Io(e),
                Ok(Ok(())) => EnsembleError::assembly("listener closed before binding"),
                Err(e) => EnsembleError::Other(anyhow::anyhow!("server task failed: {e}")),
            });
        };
        self.stage.advance(Stage::Setup, Stage::Listening)?;

        // Past this point the listener is live; a failing startup hook must
        // take it (and any started scheduler task) back down.
        if let Err(e) = lifecycle::run_phase(
            Phase::Listen,
            self.hooks.hooks(Phase::Listen),
            &self.handle,
            &self.logger,
        )
        .await
        {
            server.shutdown();
            let _ = server_task.await;
            return Err(e);
        }

        let tasks = self.scheduled.lock().unwrap().take().unwrap_or_default();
        let scheduler_tasks: Vec<JoinHandle<()>> = tasks.into_iter().map(|t| t.start()).collect();

        if let Err(e) = lifecycle::run_phase(
            Phase::Run,
            self.hooks.hooks(Phase::Run),
            &self.handle,
            &self.logger,
        )
        .await
        {
            for task in &scheduler_tasks {
                task.abort();
            }
            server.shutdown();
            let _ = server_task.await;
            return Err(e);
        }
        self.stage.advance(Stage::Listening, Stage::Running)?;

        let scheme = if self.config.tls_material().is_some() {
            "https"
        } else {
            "http"
        };
        self.logger.info(format!("app start at {scheme}://{bound}"));
        self.signals.emit_ready(&ReadyInfo { addr: bound });

        Ok(Shutdown {
            app: self,
            server,
            server_task,
            scheduler_tasks,
        })
    }

    fn resolve_addr(&self) -> Result<SocketAddr> {
        let target = format!("{}:{}", self.config.hostname, self.config.local_port);
        target
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| EnsembleError::assembly(format!("cannot resolve {target}")))
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown").finish_non_exhaustive()
    }
}

/// Token returned by [`App::run`]; consuming it stops the application.
pub struct Shutdown {
    app: Arc<App>,
    server: ServerHandle,
    server_task: JoinHandle<std::io::Result<()>>,
    scheduler_tasks: Vec<JoinHandle<()>>,
}

impl Shutdown {
    /// The address the listener is bound to.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.listening().now_or_never().flatten()
    }

    /// Stop the application: `close` hooks first (failures logged, never
    /// fatal), then a graceful listener drain, then scheduler teardown and
    /// the closed signal.
    pub async fn shutdown(self) -> Result<()> {
        let app = self.app;
        app.stage.advance(Stage::Running, Stage::Closing)?;

        lifecycle::run_phase_settled(
            Phase::Close,
            app.hooks.hooks(Phase::Close),
            &app.handle,
            &app.logger,
        )
        .await;

        self.server.graceful_shutdown(None);
        let drained = match self.server_task.await {
            Ok(result) => result.map_err(EnsembleError::Io),
            Err(e) => Err(EnsembleError::Other(anyhow::anyhow!(
                "server task failed: {e}"
            ))),
        };

        for task in self.scheduler_tasks {
            task.abort();
        }

        app.signals.emit_closed();
        app.stage.advance(Stage::Closing, Stage::Closed)?;
        app.logger.info("app closed");
        drained
    }
}
