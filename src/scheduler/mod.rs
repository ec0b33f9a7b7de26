//! Scheduler engine.
//!
//! Each scheduler descriptor becomes one self-driving recurring task,
//! started only after the HTTP listener is bound and never restarted within
//! a run cycle. Two timer disciplines:
//!
//! - **Cron**: an external cron evaluator yields the matching instants; each
//!   fire spawns `invoke()` on its own task, so overlapping runs are
//!   possible (documented behavior, deliberately preserved).
//! - **Interval**: a self-rescheduling loop — the next invocation is
//!   scheduled `interval` after the previous one settles, which guarantees
//!   no overlap and a start-to-start gap of at least `interval`.
//!
//! Invocation failures are caught and logged with the scheduler's name; they
//! never stop the schedule and never reach the application error signal.

use crate::error::{EnsembleError, Result};
use crate::logger::Logger;
use crate::service::{AppHandle, Service, ServiceInit};
use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Timer discipline for a recurring task.
#[derive(Clone, Debug)]
pub enum Timer {
    /// A cron expression evaluated by the external cron engine.
    Cron(String),
    /// A fixed delay between the end of one invocation and the start of the
    /// next.
    Interval(Duration),
}

/// A service driven by a recurring timer.
#[async_trait]
pub trait Scheduler: Service {
    fn timer(&self) -> Timer;

    /// Fire the first invocation immediately on start instead of waiting for
    /// the first matching instant / interval.
    fn immediately(&self) -> bool {
        false
    }

    async fn invoke(&self) -> anyhow::Result<()>;
}

pub(crate) type ConstructScheduler =
    Box<dyn FnOnce(AppHandle) -> anyhow::Result<Arc<dyn Scheduler>> + Send>;

/// Type-erased scheduler constructor entry.
pub struct SchedulerDef {
    pub(crate) construct: ConstructScheduler,
}

impl SchedulerDef {
    pub fn new<S: Scheduler + ServiceInit>() -> Self {
        Self {
            construct: Box::new(|app| {
                S::describe();
                Ok(Arc::new(S::init(app)?) as Arc<dyn Scheduler>)
            }),
        }
    }
}

enum PreparedTimer {
    Cron(cron::Schedule),
    Interval(Duration),
}

impl std::fmt::Debug for ScheduledTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledTask").finish_non_exhaustive()
    }
}

/// A scheduler with its timer resolved, ready to start.
pub(crate) struct ScheduledTask {
    name: String,
    timer: PreparedTimer,
    immediately: bool,
    scheduler: Arc<dyn Scheduler>,
    logger: Logger,
}

/// Resolve a scheduler's timer. A malformed cron expression is an
/// assembly-time failure.
pub(crate) fn prepare(scheduler: Arc<dyn Scheduler>, app_logger: &Logger) -> Result<ScheduledTask> {
    let name = scheduler.type_name().to_string();
    let timer = match scheduler.timer() {
        Timer::Cron(expr) => PreparedTimer::Cron(cron::Schedule::from_str(&expr).map_err(|e| {
            EnsembleError::assembly(format!("scheduler {name}: bad cron expression {expr:?}: {e}"))
        })?),
        Timer::Interval(interval) => PreparedTimer::Interval(interval),
    };

    Ok(ScheduledTask {
        logger: app_logger.extend(&name),
        immediately: scheduler.immediately(),
        name,
        timer,
        scheduler,
    })
}

impl ScheduledTask {
    pub(crate) fn start(self) -> JoinHandle<()> {
        match self.timer {
            PreparedTimer::Cron(schedule) => tokio::spawn(run_cron(
                self.name,
                schedule,
                self.immediately,
                self.scheduler,
                self.logger,
            )),
            PreparedTimer::Interval(interval) => tokio::spawn(run_interval(
                self.name,
                interval,
                self.immediately,
                self.scheduler,
                self.logger,
            )),
        }
    }
}

fn fire(name: &str, scheduler: &Arc<dyn Scheduler>, logger: &Logger) -> JoinHandle<()> {
    let name = name.to_string();
    let scheduler = Arc::clone(scheduler);
    let logger = logger.clone();
    tokio::spawn(async move {
        if let Err(e) = scheduler.invoke().await {
            logger.error(format!("{name} error: {e:#}"));
        }
    })
}

async fn run_cron(
    name: String,
    schedule: cron::Schedule,
    immediately: bool,
    scheduler: Arc<dyn Scheduler>,
    logger: Logger,
) {
    if immediately {
        fire(&name, &scheduler, &logger);
    }

    loop {
        let now = chrono::Utc::now();
        let Some(next) = schedule.after(&now).next() else {
            logger.warn(format!("{name}: no further matching instants, stopping"));
            break;
        };
        let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        // Fires are independent tasks: a slow invocation does not delay the
        // schedule, and overlapping runs are possible.
        fire(&name, &scheduler, &logger);
    }
}

async fn run_interval(
    name: String,
    interval: Duration,
    immediately: bool,
    scheduler: Arc<dyn Scheduler>,
    logger: Logger,
) {
    if !immediately {
        tokio::time::sleep(interval).await;
    }

    loop {
        if let Err(e) = scheduler.invoke().await {
            logger.error(format!("{name} error: {e:#}"));
        }
        tokio::time::sleep(interval).await;
    }
}
