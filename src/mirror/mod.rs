//! Cron-scheduled, zone-pinned mirroring tasks: periodically
//! copies content between a local repository and an external git remote.
//!
//! The actual git I/O is an explicit, opaque external collaborator
//! (`MirrorIo::run`, called with nothing but a scratch `workdir`) — the
//! same "interface, not implementation" boundary the metadata layer draws
//! around `PrincipalResolver` (see [`crate::metadata::identity`]). This
//! crate only decides *when* and *whether* a task runs; it never touches
//! git itself.

pub mod access;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::Mutex;

use crate::errors::DogmaError;
use crate::mirror::access::{MirrorAccessController, Verdict};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorDirection {
    RemoteToLocal,
    LocalToRemote,
}

/// Credential material for a mirror, a tagged sum type
/// opaque to this crate — handed to [`MirrorIo`] verbatim, never
/// inspected or logged.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    AccessToken(String),
    SshKey(Vec<u8>),
    None,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            Credential::Password(_) => "Password",
            Credential::AccessToken(_) => "AccessToken",
            Credential::SshKey(_) => "SshKey",
            Credential::None => "None",
        };
        write!(f, "Credential::{kind}(..)")
    }
}

#[derive(Debug, Clone)]
pub struct MirrorTask {
    pub id: String,
    pub enabled: bool,
    pub direction: MirrorDirection,
    pub local_project: String,
    pub local_repo: String,
    pub local_path: String,
    pub remote_uri: String,
    pub remote_branch: String,
    pub credential_ref: String,
    pub gitignore: Option<String>,
    pub zone: Option<String>,
    /// A 6-field (seconds-first) cron expression, e.g. `"0 */5 * * * *"`.
    pub schedule: String,
}

impl MirrorTask {
    fn compiled_schedule(&self) -> Result<Schedule, DogmaError> {
        Schedule::from_str(&self.schedule)
            .map_err(|e| DogmaError::Internal(format!("task {}: invalid cron expression: {e}", self.id)))
    }

    /// A task with `zone=Some(z)` runs only on the leader of zone `z`; a
    /// task with `zone=None` runs only in the cluster's configured
    /// default zone. A zone absent from the cluster's known zones never
    /// runs anywhere.
    fn runs_on(&self, current_zone: Option<&str>, default_zone: Option<&str>, known_zones: &[String]) -> bool {
        match &self.zone {
            Some(z) => known_zones.iter().any(|k| k == z) && Some(z.as_str()) == current_zone,
            None => current_zone == default_zone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorOutcome {
    Success,
    UpToDate,
    Failed,
}

#[derive(Debug, Clone)]
pub struct MirrorRunResult {
    pub outcome: MirrorOutcome,
    pub description: String,
}

impl MirrorRunResult {
    pub fn success(revision: i64) -> Self {
        Self { outcome: MirrorOutcome::Success, description: format!("mirrored to revision {revision}") }
    }

    pub fn up_to_date() -> Self {
        Self { outcome: MirrorOutcome::UpToDate, description: "already up to date".to_string() }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self { outcome: MirrorOutcome::Failed, description: reason.into() }
    }
}

/// The opaque remote↔local sync itself. Never implemented by this crate —
/// a production deployment supplies a real implementation (invoking `git`
/// or `libgit2` against `workdir`); tests supply a fake.
#[async_trait]
pub trait MirrorIo: Send + Sync {
    async fn run(&self, task: &MirrorTask, credential: &Credential, workdir: &Path) -> Result<MirrorRunResult, DogmaError>;
}

/// Lifecycle events a task run emits to registered listeners.
pub trait MirrorListener: Send + Sync {
    fn on_start(&self, _task: &MirrorTask) {}
    fn on_complete(&self, _task: &MirrorTask, _result: &MirrorRunResult) {}
    fn on_error(&self, _task: &MirrorTask, _error: &DogmaError) {}
}

#[derive(Debug, Clone, Default)]
pub struct TaskStatus {
    pub last_run_millis: Option<i64>,
    pub last_result: Option<MirrorRunResultSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorRunResultSummary {
    pub outcome: MirrorOutcome,
    pub description: String,
}

impl From<&MirrorRunResult> for MirrorRunResultSummary {
    fn from(r: &MirrorRunResult) -> Self {
        Self { outcome: r.outcome, description: r.description.clone() }
    }
}

/// Owns the task catalogue, the access controller, and per-task
/// last-run bookkeeping, and drives due tasks to completion. Zone
/// filtering and cron due-checks are pure functions ([`MirrorTask::runs_on`],
/// [`Self::is_due`]) so scheduling logic is testable without a real clock.
pub struct MirrorScheduler {
    tasks: Mutex<BTreeMap<String, MirrorTask>>,
    last_run: Mutex<BTreeMap<String, DateTime<Utc>>>,
    statuses: Mutex<BTreeMap<String, TaskStatus>>,
    io: Arc<dyn MirrorIo>,
    access: MirrorAccessController,
    listeners: Mutex<Vec<Arc<dyn MirrorListener>>>,
    workdir_root: PathBuf,
    current_zone: Option<String>,
    default_zone: Option<String>,
    known_zones: Vec<String>,
}

impl MirrorScheduler {
    pub fn new(
        io: Arc<dyn MirrorIo>,
        access: MirrorAccessController,
        workdir_root: impl Into<PathBuf>,
        current_zone: Option<String>,
        default_zone: Option<String>,
        known_zones: Vec<String>,
    ) -> Self {
        Self {
            tasks: Mutex::new(BTreeMap::new()),
            last_run: Mutex::new(BTreeMap::new()),
            statuses: Mutex::new(BTreeMap::new()),
            io,
            access,
            listeners: Mutex::new(Vec::new()),
            workdir_root: workdir_root.into(),
            current_zone,
            default_zone,
            known_zones,
        }
    }

    pub async fn add_task(&self, task: MirrorTask) -> Result<(), DogmaError> {
        task.compiled_schedule()?;
        self.tasks.lock().await.insert(task.id.clone(), task);
        Ok(())
    }

    pub async fn remove_task(&self, id: &str) {
        self.tasks.lock().await.remove(id);
        self.last_run.lock().await.remove(id);
        self.statuses.lock().await.remove(id);
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), DogmaError> {
        let mut tasks = self.tasks.lock().await;
        let task = tasks.get_mut(id).ok_or_else(|| DogmaError::EntryNotFound(format!("mirror task {id}")))?;
        task.enabled = enabled;
        Ok(())
    }

    pub async fn register_listener(&self, listener: Arc<dyn MirrorListener>) {
        self.listeners.lock().await.push(listener);
    }

    pub async fn status(&self, id: &str) -> Option<TaskStatus> {
        self.statuses.lock().await.get(id).cloned()
    }

    /// Whether a schedule has an occurrence due at or before `now`, given
    /// its task last ran at `since` (or has never run).
    fn is_due(schedule: &Schedule, since: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let after = since.unwrap_or_else(|| now - chrono::Duration::days(1));
        schedule.after(&after).next().is_some_and(|next| next <= now)
    }

    /// Runs every task that is enabled, zone-pinned to this node, and due
    /// as of `now`. Pure with respect to the clock (caller supplies `now`)
    /// so tests can drive it without sleeping.
    pub async fn run_due(&self, now: DateTime<Utc>) -> Vec<(String, MirrorRunResult)> {
        let due: Vec<MirrorTask> = {
            let tasks = self.tasks.lock().await;
            let last_run = self.last_run.lock().await;
            tasks
                .values()
                .filter(|t| t.enabled)
                .filter(|t| t.runs_on(self.current_zone.as_deref(), self.default_zone.as_deref(), &self.known_zones))
                .filter(|t| match t.compiled_schedule() {
                    Ok(sched) => Self::is_due(&sched, last_run.get(&t.id).copied(), now),
                    Err(_) => false,
                })
                .cloned()
                .collect()
        };

        let mut results = Vec::with_capacity(due.len());
        for task in due {
            self.last_run.lock().await.insert(task.id.clone(), now);
            let result = self.run_one(&task).await;
            results.push((task.id.clone(), result));
        }
        results
    }

    async fn run_one(&self, task: &MirrorTask) -> MirrorRunResult {
        tracing::debug!(task = %task.id, remote = %task.remote_uri, "running mirror task");
        self.notify_start(task).await;

        if self.access.check(&task.remote_uri) == Verdict::Deny {
            tracing::warn!(task = %task.id, remote = %task.remote_uri, "mirror task denied by access control");
            let result = MirrorRunResult::failed(format!("remote URI denied by access control: {}", task.remote_uri));
            self.record(task, &result).await;
            self.notify_complete(task, &result).await;
            return result;
        }

        let workdir = self.workdir_root.join(&task.id);
        if let Err(e) = tokio::fs::create_dir_all(&workdir).await {
            let err = DogmaError::Io(e);
            self.notify_error(task, &err).await;
            let result = MirrorRunResult::failed(err.to_string());
            self.record(task, &result).await;
            return result;
        }

        let result = match self.io.run(task, &Credential::None, &workdir).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(task = %task.id, error = %e, "mirror task failed");
                self.notify_error(task, &e).await;
                MirrorRunResult::failed(e.to_string())
            }
        };
        self.record(task, &result).await;
        self.notify_complete(task, &result).await;
        result
    }

    async fn record(&self, task: &MirrorTask, result: &MirrorRunResult) {
        self.statuses.lock().await.insert(
            task.id.clone(),
            TaskStatus {
                last_run_millis: Some(Utc::now().timestamp_millis()),
                last_result: Some(result.into()),
            },
        );
    }

    async fn notify_start(&self, task: &MirrorTask) {
        for l in self.listeners.lock().await.iter() {
            l.on_start(task);
        }
    }

    async fn notify_complete(&self, task: &MirrorTask, result: &MirrorRunResult) {
        for l in self.listeners.lock().await.iter() {
            l.on_complete(task, result);
        }
    }

    async fn notify_error(&self, task: &MirrorTask, error: &DogmaError) {
        for l in self.listeners.lock().await.iter() {
            l.on_error(task, error);
        }
    }

    /// Spawns a background loop that calls [`Self::run_due`] every `tick`.
    /// The returned handle should be aborted on shutdown.
    pub fn spawn(self: Arc<Self>, tick: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(tick);
            loop {
                interval.tick().await;
                self.run_due(Utc::now()).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeIo {
        calls: AtomicUsize,
        outcome: MirrorOutcome,
    }

    #[async_trait]
    impl MirrorIo for FakeIo {
        async fn run(&self, _task: &MirrorTask, _credential: &Credential, _workdir: &Path) -> Result<MirrorRunResult, DogmaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(match self.outcome {
                MirrorOutcome::Success => MirrorRunResult::success(7),
                MirrorOutcome::UpToDate => MirrorRunResult::up_to_date(),
                MirrorOutcome::Failed => MirrorRunResult::failed("simulated failure"),
            })
        }
    }

    fn task(id: &str, zone: Option<&str>, schedule: &str) -> MirrorTask {
        MirrorTask {
            id: id.to_string(),
            enabled: true,
            direction: MirrorDirection::RemoteToLocal,
            local_project: "widgets".into(),
            local_repo: "configs".into(),
            local_path: "/".into(),
            remote_uri: "https://github.com/acme/configs.git".into(),
            remote_branch: "main".into(),
            credential_ref: "acme-token".into(),
            gitignore: None,
            zone: zone.map(str::to_string),
            schedule: schedule.to_string(),
        }
    }

    fn scheduler(io: Arc<FakeIo>, zone: Option<&str>, default_zone: Option<&str>, known: Vec<&str>) -> MirrorScheduler {
        let access = MirrorAccessController::new(vec![crate::mirror::access::AccessRule::allow(1, "https://github.com/*")]);
        MirrorScheduler::new(
            io,
            access,
            std::env::temp_dir().join("dogma-mirror-tests"),
            zone.map(str::to_string),
            default_zone.map(str::to_string),
            known.into_iter().map(str::to_string).collect(),
        )
    }

    #[tokio::test]
    async fn due_task_runs_and_reports_success() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, None, None, vec![]);
        sched.add_task(task("t1", None, "* * * * * *")).await.unwrap();

        let now = Utc::now();
        let results = sched.run_due(now).await;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].1.outcome, MirrorOutcome::Success);
        assert_eq!(io.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disabled_task_never_runs() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, None, None, vec![]);
        let mut t = task("t1", None, "* * * * * *");
        t.enabled = false;
        sched.add_task(t).await.unwrap();

        let results = sched.run_due(Utc::now()).await;
        assert!(results.is_empty());
        assert_eq!(io.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn zone_pinned_task_only_runs_on_its_zone_leader() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched_wrong_zone = scheduler(Arc::clone(&io) as Arc<FakeIo>, Some("us-east"), None, vec!["us-west", "us-east"]);
        sched_wrong_zone.add_task(task("t1", Some("us-west"), "* * * * * *")).await.unwrap();
        assert!(sched_wrong_zone.run_due(Utc::now()).await.is_empty());

        let sched_right_zone = scheduler(Arc::clone(&io) as Arc<FakeIo>, Some("us-west"), None, vec!["us-west", "us-east"]);
        sched_right_zone.add_task(task("t1", Some("us-west"), "* * * * * *")).await.unwrap();
        assert_eq!(sched_right_zone.run_due(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn task_with_unknown_zone_never_runs_anywhere() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, Some("us-west"), None, vec!["us-east"]);
        sched.add_task(task("t1", Some("us-west"), "* * * * * *")).await.unwrap();
        assert!(sched.run_due(Utc::now()).await.is_empty());
    }

    #[tokio::test]
    async fn unpinned_task_runs_only_in_default_zone() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, Some("us-west"), Some("us-east"), vec!["us-west", "us-east"]);
        sched.add_task(task("t1", None, "* * * * * *")).await.unwrap();
        assert!(sched.run_due(Utc::now()).await.is_empty());

        let sched2 = scheduler(io, Some("us-east"), Some("us-east"), vec!["us-west", "us-east"]);
        sched2.add_task(task("t1", None, "* * * * * *")).await.unwrap();
        assert_eq!(sched2.run_due(Utc::now()).await.len(), 1);
    }

    #[tokio::test]
    async fn denied_remote_uri_fails_without_invoking_io() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let access = MirrorAccessController::new(vec![crate::mirror::access::AccessRule::deny(1, "*")]);
        let sched = MirrorScheduler::new(
            Arc::clone(&io) as Arc<FakeIo>,
            access,
            std::env::temp_dir().join("dogma-mirror-tests-deny"),
            None,
            None,
            vec![],
        );
        sched.add_task(task("t1", None, "* * * * * *")).await.unwrap();
        let results = sched.run_due(Utc::now()).await;
        assert_eq!(results[0].1.outcome, MirrorOutcome::Failed);
        assert_eq!(io.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn status_reflects_the_last_run() {
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::UpToDate });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, None, None, vec![]);
        sched.add_task(task("t1", None, "* * * * * *")).await.unwrap();
        sched.run_due(Utc::now()).await;
        let status = sched.status("t1").await.unwrap();
        assert_eq!(status.last_result.unwrap().outcome, MirrorOutcome::UpToDate);
    }

    #[tokio::test]
    async fn listeners_observe_start_and_complete() {
        struct Recorder {
            starts: std::sync::Mutex<Vec<String>>,
            completes: std::sync::Mutex<Vec<MirrorOutcome>>,
        }
        impl MirrorListener for Recorder {
            fn on_start(&self, task: &MirrorTask) {
                self.starts.lock().unwrap().push(task.id.clone());
            }
            fn on_complete(&self, _task: &MirrorTask, result: &MirrorRunResult) {
                self.completes.lock().unwrap().push(result.outcome);
            }
        }
        let io = Arc::new(FakeIo { calls: AtomicUsize::new(0), outcome: MirrorOutcome::Success });
        let sched = scheduler(Arc::clone(&io) as Arc<FakeIo>, None, None, vec![]);
        let recorder = Arc::new(Recorder { starts: std::sync::Mutex::new(Vec::new()), completes: std::sync::Mutex::new(Vec::new()) });
        sched.register_listener(recorder.clone()).await;
        sched.add_task(task("t1", None, "* * * * * *")).await.unwrap();
        sched.run_due(Utc::now()).await;
        assert_eq!(*recorder.starts.lock().unwrap(), vec!["t1".to_string()]);
        assert_eq!(*recorder.completes.lock().unwrap(), vec![MirrorOutcome::Success]);
    }

    #[test]
    fn invalid_cron_expression_is_rejected_eagerly() {
        let t = task("t1", None, "not a cron expression");
        assert!(t.compiled_schedule().is_err());
    }
}
