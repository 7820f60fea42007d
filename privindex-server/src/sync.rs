//! # Index Synchronization
//!
//! Keeps each instance's in-memory index in line with the index published
//! to its storage. One cycle for one instance walks:
//!
//! ```text
//! Idle ─▶ Checking ─▶ Downloading ─▶ Rebuilding ─▶ Swapped
//!   ▲         │ up to date / error │ error        │ error
//!   └─────────┴────────────────────┴──────────────┘
//! ```
//!
//! The replacement index is built completely before a single pointer swap,
//! so readers see either the old or the new index. Any failure leaves the
//! held index untouched. A cycle that overruns its deadline is abandoned
//! and the next tick starts over.
//!
//! Syncing uses the instance's admin secret; instances without one are
//! skipped.

use crate::auth_cache::AuthMode;
use crate::backend::{OperationStatus, PackageRepo};
use crate::error::{AppError, AppResult};
use crate::index::PackageIndex;
use crate::lock::acquire_exclusive;
use crate::scheduler::{PeriodicHandle, TaskScheduler};
use crate::workflow::{BackendInstance, IndexSignature, WorkflowState, INDEX_LOCK_TIMEOUT};
use futures_util::FutureExt;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Lock wait when copying the local index in and out of the temp file.
const INDEX_COPY_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Checking,
    Downloading,
    Rebuilding,
    Swapped,
}

impl fmt::Display for SyncPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SyncPhase::Idle => "idle",
            SyncPhase::Checking => "checking",
            SyncPhase::Downloading => "downloading",
            SyncPhase::Rebuilding => "rebuilding",
            SyncPhase::Swapped => "swapped",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The held index already matches storage.
    UpToDate,
    /// A new index with `packages` entries replaced the old one.
    Swapped { packages: usize },
    /// Nothing was attempted.
    Skipped(String),
    Failed { phase: SyncPhase, message: String },
}

impl SyncOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, SyncOutcome::Failed { .. })
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncOutcome::UpToDate => write!(f, "up-to-date"),
            SyncOutcome::Swapped { packages } => write!(f, "swapped ({packages} packages)"),
            SyncOutcome::Skipped(reason) => write!(f, "skipped: {reason}"),
            SyncOutcome::Failed { phase, message } => write!(f, "failed while {phase}: {message}"),
        }
    }
}

/// Scratch copy of the index, removed on drop even if the cycle is cancelled.
struct TempIndexFile(PathBuf);

impl TempIndexFile {
    fn beside(index_path: &Path) -> Self {
        let mut name = index_path.as_os_str().to_owned();
        name.push(format!(".tmp.{}", Uuid::new_v4().simple()));
        Self(PathBuf::from(name))
    }

    fn path(&self) -> &Path {
        &self.0
    }
}

impl Drop for TempIndexFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.0.display(), error = %e, "Failed to remove temp index"),
        }
    }
}

async fn locked_copy(lock_path: &Path, from: &Path, to: &Path) -> AppResult<()> {
    let _guard = acquire_exclusive(lock_path, INDEX_COPY_LOCK_TIMEOUT).await?;
    tokio::fs::copy(from, to).await?;
    Ok(())
}

fn failed(phase: SyncPhase, err: impl fmt::Display) -> SyncOutcome {
    SyncOutcome::Failed {
        phase,
        message: err.to_string(),
    }
}

/// Run one sync cycle for instance `name`.
pub async fn sync_instance(state: &WorkflowState, name: &str) -> SyncOutcome {
    let instance = match state.instance(name) {
        Ok(instance) => Arc::clone(instance),
        Err(e) => return failed(SyncPhase::Idle, e),
    };
    let outcome = run_cycle(state, &instance).await;
    let terminal = match outcome {
        SyncOutcome::Swapped { .. } => SyncPhase::Swapped,
        _ => SyncPhase::Idle,
    };
    instance.set_sync_phase(terminal);

    match &outcome {
        SyncOutcome::Failed { phase, message } => {
            tracing::error!(instance = %name, phase = %phase, message = %message, "Index sync failed")
        }
        SyncOutcome::Skipped(reason) => {
            tracing::warn!(instance = %name, reason = %reason, "Index sync skipped")
        }
        other => tracing::info!(instance = %name, outcome = %other, "Index sync finished"),
    }
    outcome
}

async fn run_cycle(state: &WorkflowState, instance: &BackendInstance) -> SyncOutcome {
    let name = instance.name();
    let Some(secret) = state.admin_secret(name) else {
        return SyncOutcome::Skipped(format!(
            "secret of \"{name}\" is not provided, skip index sync."
        ));
    };

    instance.set_sync_phase(SyncPhase::Checking);
    let backend = match state
        .authorized_backend(name, secret.as_ref(), AuthMode::Read)
        .await
    {
        Ok(backend) => backend,
        Err(e) => return failed(SyncPhase::Checking, e),
    };

    let tmp = TempIndexFile::beside(instance.index_path());
    let up_to_date = match check_up_to_date(instance, backend.as_ref(), &tmp).await {
        Ok(up_to_date) => up_to_date,
        Err(e) => return failed(SyncPhase::Checking, e),
    };
    if up_to_date {
        return SyncOutcome::UpToDate;
    }

    instance.set_sync_phase(SyncPhase::Downloading);
    match backend.download_index(tmp.path()).await {
        Ok(result) if result.status == OperationStatus::Succeeded => {}
        Ok(result) => {
            return failed(
                SyncPhase::Downloading,
                format!("\"{name}\" failed to download index: {}", result.message),
            )
        }
        Err(e) => return failed(SyncPhase::Downloading, e),
    }

    instance.set_sync_phase(SyncPhase::Rebuilding);
    let (index, signature) = match rebuild(state, instance, &tmp).await {
        Ok(rebuilt) => rebuilt,
        Err(e) => return failed(SyncPhase::Rebuilding, e),
    };

    let packages = index.len();
    instance.swap_index(index, signature);
    SyncOutcome::Swapped { packages }
}

async fn check_up_to_date(
    instance: &BackendInstance,
    backend: &dyn PackageRepo,
    tmp: &TempIndexFile,
) -> AppResult<bool> {
    // Compare a copy so the index lock is held only for the copy. Without a
    // local index the backend still decides, against a path that is absent.
    if tokio::fs::try_exists(instance.index_path()).await? {
        locked_copy(instance.index_lock_path(), instance.index_path(), tmp.path()).await?;
    }
    backend.local_index_is_up_to_date(tmp.path()).await
}

async fn rebuild(
    state: &WorkflowState,
    instance: &BackendInstance,
    tmp: &TempIndexFile,
) -> AppResult<(PackageIndex, Option<IndexSignature>)> {
    let content = tokio::fs::read_to_string(tmp.path()).await?;
    let index = state.registry().parse_index(&content)?;

    // Persist first; the in-memory swap only follows a good write.
    let _guard = acquire_exclusive(instance.index_lock_path(), INDEX_LOCK_TIMEOUT).await?;
    tokio::fs::copy(tmp.path(), instance.index_path()).await?;
    let signature = IndexSignature::of(instance.index_path()).await?;
    Ok((index, signature))
}

/// Run one cycle, abandoning it once `deadline` passes.
pub async fn run_cycle_with_deadline(
    state: &WorkflowState,
    name: &str,
    deadline: Duration,
) -> SyncOutcome {
    match tokio::time::timeout(deadline, sync_instance(state, name)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let phase = state
                .instance(name)
                .map(|instance| {
                    let phase = instance.sync_phase();
                    instance.set_sync_phase(SyncPhase::Idle);
                    phase
                })
                .unwrap_or(SyncPhase::Idle);
            tracing::warn!(instance = %name, phase = %phase, "Index sync deadline exceeded");
            failed(
                phase,
                format!("deadline of {:.1}s exceeded", deadline.as_secs_f64()),
            )
        }
    }
}

/// One scheduled tick: drop expired auth decisions, then run a cycle.
pub async fn sync_tick(state: &WorkflowState, name: &str, deadline: Duration) -> SyncOutcome {
    if let Ok(instance) = state.instance(name) {
        let purged = instance.auth_cache().purge_expired();
        if purged > 0 {
            tracing::debug!(instance = %name, purged, "Expired auth decisions dropped");
        }
    }
    run_cycle_with_deadline(state, name, deadline).await
}

/// One cycle for every instance, in config order.
pub async fn sync_all(state: &WorkflowState) -> Vec<(String, SyncOutcome)> {
    let mut outcomes = Vec::new();
    for name in state.instance_names() {
        outcomes.push((name.to_string(), sync_instance(state, name).await));
    }
    outcomes
}

/// Rebuild the index from a full storage listing and publish it.
///
/// Requires write access. Returns the number of packages published.
pub async fn publish_index(
    state: &WorkflowState,
    name: &str,
    secret: &dyn crate::backend::RepoSecret,
) -> AppResult<usize> {
    let backend = state
        .authorized_backend(name, secret, AuthMode::Write)
        .await?;
    let pkg_refs = backend.collect_all_published_packages().await?;
    let index = PackageIndex::from_refs(pkg_refs)?;

    let instance = state.instance(name)?;
    let tmp = TempIndexFile::beside(instance.index_path());
    tokio::fs::write(tmp.path(), index.to_toml_string()?).await?;

    let result = backend.upload_index(tmp.path()).await?;
    if result.status != OperationStatus::Succeeded {
        return Err(AppError::Unavailable(format!(
            "\"{name}\" failed to upload index: {}",
            result.message
        )));
    }
    tracing::info!(instance = %name, packages = index.len(), "Index published");
    Ok(index.len())
}

/// Periodic sync tasks, one per instance.
#[derive(Debug)]
pub struct IndexSyncScheduler {
    handles: Vec<PeriodicHandle>,
}

impl IndexSyncScheduler {
    /// Schedule every instance at its `sync_index_interval`.
    pub fn spawn<S: TaskScheduler>(
        scheduler: &S,
        state: Arc<WorkflowState>,
        deadline: Duration,
    ) -> Self {
        let mut handles = Vec::new();
        let names: Vec<String> = state.instance_names().map(str::to_string).collect();
        for name in names {
            let interval = match state.instance(&name) {
                Ok(instance) => Duration::from_secs(instance.config().common().sync_index_interval.max(1)),
                Err(_) => continue,
            };
            let state = Arc::clone(&state);
            let task_name = format!("sync-index-{name}");
            let handle = scheduler.schedule_periodic(
                &task_name,
                interval,
                Box::new(move || {
                    let state = Arc::clone(&state);
                    let name = name.clone();
                    async move {
                        sync_tick(&state, &name, deadline).await;
                    }
                    .boxed()
                }),
            );
            handles.push(handle);
        }
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn shutdown(self) {
        for handle in &self.handles {
            tracing::debug!(task = %handle.name(), "Stopping periodic task");
            handle.abort();
        }
    }
}
