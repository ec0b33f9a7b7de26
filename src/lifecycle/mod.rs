//! Lifecycle orchestration.
//!
//! An application moves through four ordered phases — `setup`, `listen`,
//! `run`, `close` — executed once per run cycle. Hooks registered against a
//! phase all start in submission order and run concurrently; the phase
//! completes only when every hook has settled (a join-all barrier), and no
//! hook of the next phase starts before that.
//!
//! Hook order within a phase: explicit hooks from the application
//! descriptor, then hooks discovered from annotated service methods in
//! service-registration order, then extension-contributed hooks in extension
//! order.

use crate::error::{EnsembleError, Result};
use crate::logger::Logger;
use crate::service::AppHandle;
use futures::future::{join_all, try_join_all, BoxFuture};
use std::future::Future;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// One of the four ordered lifecycle phases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    Setup,
    Listen,
    Run,
    Close,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Setup, Phase::Listen, Phase::Run, Phase::Close];

    pub fn name(&self) -> &'static str {
        match self {
            Phase::Setup => "setup",
            Phase::Listen => "listen",
            Phase::Run => "run",
            Phase::Close => "close",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An asynchronous callback registered against a lifecycle phase.
pub type HookFn = Arc<dyn Fn(AppHandle) -> BoxFuture<'static, Result<()>> + Send + Sync>;

pub struct HookEntry {
    pub name: String,
    pub invoke: HookFn,
}

impl Clone for HookEntry {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            invoke: Arc::clone(&self.invoke),
        }
    }
}

/// Box an async closure into a [`HookEntry`].
pub fn hook<F, Fut>(name: impl Into<String>, f: F) -> HookEntry
where
    F: Fn(AppHandle) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    HookEntry {
        name: name.into(),
        invoke: Arc::new(move |app| Box::pin(f(app))),
    }
}

/// Hook lists for all four phases, in registration order.
#[derive(Default)]
pub struct PhaseHooks {
    setup: Vec<HookEntry>,
    listen: Vec<HookEntry>,
    run: Vec<HookEntry>,
    close: Vec<HookEntry>,
}

impl PhaseHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, entry: HookEntry) {
        self.list_mut(phase).push(entry);
    }

    /// Builder-style variant of [`push`](Self::push).
    pub fn with(mut self, phase: Phase, entry: HookEntry) -> Self {
        self.push(phase, entry);
        self
    }

    pub fn hooks(&self, phase: Phase) -> &[HookEntry] {
        match phase {
            Phase::Setup => &self.setup,
            Phase::Listen => &self.listen,
            Phase::Run => &self.run,
            Phase::Close => &self.close,
        }
    }

    pub fn count(&self, phase: Phase) -> usize {
        self.hooks(phase).len()
    }

    fn list_mut(&mut self, phase: Phase) -> &mut Vec<HookEntry> {
        match phase {
            Phase::Setup => &mut self.setup,
            Phase::Listen => &mut self.listen,
            Phase::Run => &mut self.run,
            Phase::Close => &mut self.close,
        }
    }
}

/// Run every hook of a phase concurrently and wait for all of them.
///
/// The first rejection is returned as [`EnsembleError::Hook`]; for the
/// startup phases this propagates out of `run()` (a `setup` failure aborts
/// before the listener binds).
pub(crate) async fn run_phase(
    phase: Phase,
    hooks: &[HookEntry],
    app: &AppHandle,
    logger: &Logger,
) -> Result<()> {
    logger.info(format!("[lifecycle] {} ({} hooks)", phase, hooks.len()));

    let pending: Vec<_> = hooks
        .iter()
        .map(|entry| {
            let fut = (entry.invoke)(app.clone());
            let name = entry.name.clone();
            async move {
                fut.await.map_err(|e| EnsembleError::Hook {
                    phase,
                    name,
                    source: anyhow::Error::new(e),
                })
            }
        })
        .collect();

    try_join_all(pending).await?;
    Ok(())
}

/// Run every hook of a phase, logging failures instead of propagating them.
///
/// Used for the `close` phase: a failing close hook must not prevent
/// listener teardown.
pub(crate) async fn run_phase_settled(
    phase: Phase,
    hooks: &[HookEntry],
    app: &AppHandle,
    logger: &Logger,
) {
    logger.info(format!("[lifecycle] {} ({} hooks)", phase, hooks.len()));

    let pending: Vec<_> = hooks
        .iter()
        .map(|entry| {
            let fut = (entry.invoke)(app.clone());
            let name = entry.name.clone();
            async move { (name, fut.await) }
        })
        .collect();

    for (name, result) in join_all(pending).await {
        if let Err(e) = result {
            logger.error(format!("{phase} hook {name} failed: {e}"));
        }
    }
}

/// Lifecycle stages of the application aggregate.
///
/// Transitions are forward-only; an application never returns to an earlier
/// stage and is not reusable for a second run cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum Stage {
    Idle = 0,
    Setup = 1,
    Listening = 2,
    Running = 3,
    Closing = 4,
    Closed = 5,
}

impl Stage {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Setup => "setup",
            Stage::Listening => "listening",
            Stage::Running => "running",
            Stage::Closing => "closing",
            Stage::Closed => "closed",
        }
    }

    fn from_u8(v: u8) -> Stage {
        match v {
            0 => Stage::Idle,
            1 => Stage::Setup,
            2 => Stage::Listening,
            3 => Stage::Running,
            4 => Stage::Closing,
            _ => Stage::Closed,
        }
    }
}

/// Atomic holder for the current [`Stage`].
pub(crate) struct StageCell(AtomicU8);

impl StageCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(Stage::Idle as u8))
    }

    /// Move `from` -> `to`, failing if the current stage is not `from`.
    pub(crate) fn advance(&self, from: Stage, to: Stage) -> Result<()> {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|actual| EnsembleError::InvalidState {
                expected: from.name(),
                actual: Stage::from_u8(actual).name(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::AppHandle;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    fn test_handle() -> AppHandle {
        AppHandle::detached(crate::config::AppConfig::default(), Logger::new("TEST"))
    }

    #[tokio::test]
    async fn phase_runs_every_hook_exactly_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut hooks = PhaseHooks::new();
        for i in 0..3 {
            let counter = Arc::clone(&counter);
            hooks.push(
                Phase::Setup,
                hook(format!("hook-{i}"), move |_app| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            );
        }

        let logger = Logger::new("TEST");
        run_phase(Phase::Setup, hooks.hooks(Phase::Setup), &test_handle(), &logger)
            .await
            .unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn phase_barrier_waits_for_slow_hooks() {
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut hooks = PhaseHooks::new();
        let slow = Arc::clone(&order);
        hooks.push(
            Phase::Setup,
            hook("slow", move |_app| {
                let slow = Arc::clone(&slow);
                async move {
                    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
                    slow.lock().unwrap().push("slow");
                    Ok(())
                }
            }),
        );
        let fast = Arc::clone(&order);
        hooks.push(
            Phase::Setup,
            hook("fast", move |_app| {
                let fast = Arc::clone(&fast);
                async move {
                    fast.lock().unwrap().push("fast");
                    Ok(())
                }
            }),
        );

        let logger = Logger::new("TEST");
        run_phase(Phase::Setup, hooks.hooks(Phase::Setup), &test_handle(), &logger)
            .await
            .unwrap();

        // Completion order differs from submission order, but both settled
        // before the barrier released.
        assert_eq!(*order.lock().unwrap(), vec!["fast", "slow"]);
    }

    #[tokio::test]
    async fn failing_hook_rejects_the_phase() {
        let mut hooks = PhaseHooks::new();
        hooks.push(
            Phase::Setup,
            hook("broken", |_app| async {
                Err(anyhow::anyhow!("db unreachable").into())
            }),
        );

        let logger = Logger::new("TEST");
        let err = run_phase(Phase::Setup, hooks.hooks(Phase::Setup), &test_handle(), &logger)
            .await
            .unwrap_err();
        match err {
            EnsembleError::Hook { phase, name, .. } => {
                assert_eq!(phase, Phase::Setup);
                assert_eq!(name, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn settled_phase_swallows_failures() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut hooks = PhaseHooks::new();
        hooks.push(
            Phase::Close,
            hook("broken", |_app| async {
                Err(anyhow::anyhow!("flush failed").into())
            }),
        );
        let counter = Arc::clone(&ran);
        hooks.push(
            Phase::Close,
            hook("ok", move |_app| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }),
        );

        let logger = Logger::new("TEST");
        run_phase_settled(Phase::Close, hooks.hooks(Phase::Close), &test_handle(), &logger).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stage_transitions_are_forward_only() {
        let cell = StageCell::new();
        cell.advance(Stage::Idle, Stage::Setup).unwrap();
        cell.advance(Stage::Setup, Stage::Listening).unwrap();

        // A second run cycle cannot start.
        let err = cell.advance(Stage::Idle, Stage::Setup).unwrap_err();
        match err {
            EnsembleError::InvalidState { expected, actual } => {
                assert_eq!(expected, "idle");
                assert_eq!(actual, "listening");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
