//! Periodic tasks and async jobs on the ambient tokio runtime.
//!
//! The sync scheduler registers one periodic task per backend instance;
//! uploads can be handed off as jobs whose handle is polled for completion.

use futures_util::future::BoxFuture;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

/// A task body run once per tick. Each run completes before the next tick
/// is taken, so runs of one task never overlap.
pub type PeriodicTask = Box<dyn FnMut() -> BoxFuture<'static, ()> + Send>;

pub trait TaskScheduler: Send + Sync {
    /// Run `task` every `interval`, starting immediately.
    fn schedule_periodic(&self, name: &str, interval: Duration, task: PeriodicTask)
        -> PeriodicHandle;

    /// Run `fut` as a background job.
    fn spawn_job<T, F>(&self, fut: F) -> JobHandle<T>
    where
        Self: Sized,
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static;
}

/// Handle on a periodic task. Dropping it leaves the task running.
#[derive(Debug)]
pub struct PeriodicHandle {
    name: String,
    handle: JoinHandle<()>,
}

impl PeriodicHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Handle on a background job.
#[derive(Debug)]
pub struct JobHandle<T> {
    id: Uuid,
    handle: JoinHandle<T>,
}

impl<T> JobHandle<T> {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Wait for the job. Fails when the job panicked or was aborted.
    pub async fn join(self) -> Result<T, tokio::task::JoinError> {
        self.handle.await
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl TokioScheduler {
    pub fn new() -> Self {
        Self
    }
}

impl TaskScheduler for TokioScheduler {
    fn schedule_periodic(
        &self,
        name: &str,
        every: Duration,
        mut task: PeriodicTask,
    ) -> PeriodicHandle {
        let task_name = name.to_string();
        let every = every.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = interval(every);
            // A run that overruns its slot drops the missed ticks instead of bursting.
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                task().await;
            }
        });
        tracing::info!(task = %name, interval_secs = every.as_secs_f64(), "Periodic task scheduled");
        PeriodicHandle {
            name: task_name,
            handle,
        }
    }

    fn spawn_job<T, F>(&self, fut: F) -> JobHandle<T>
    where
        T: Send + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let id = Uuid::new_v4();
        tracing::debug!(job_id = %id, "Job spawned");
        JobHandle {
            id,
            handle: tokio::spawn(fut),
        }
    }
}
