//! Simulates a single-leader quorum log over N in-process replicas: no
//! lost acknowledged revision, and no revision renumbering across a
//! majority-surviving leader change, without pulling in a full Raft
//! implementation.
//!
//! The log is the source of truth: a command is only ever appended to it
//! once a majority of replicas are reachable to accept the proposal, so a
//! revision number, once handed to a replica, is never reused or
//! reassigned. Unreachable replicas simply fall behind; they catch up by
//! replaying the log in order whenever `submit` (or `catch_up_all`) next
//! runs with them reachable again.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::errors::DogmaError;
use crate::executor::standalone::StandaloneExecutor;
use crate::executor::{Command, CommandExecutor, CommandOutcome};
use crate::metadata::identity::Principal;
use crate::object_store::ObjectStore;
use crate::revlog::RevisionLog;

struct Replica<S: ObjectStore, L: RevisionLog> {
    executor: Arc<StandaloneExecutor<S, L>>,
    applied: AtomicUsize,
    available: AtomicBool,
    catch_up_lock: AsyncMutex<()>,
}

pub struct ReplicatedExecutor<S: ObjectStore, L: RevisionLog> {
    /// Each entry carries the principal that submitted it alongside the
    /// command, so replay re-authorizes identically on every replica
    /// rather than trusting the leader's decision blindly.
    log: AsyncMutex<Vec<(Command, Principal)>>,
    replicas: Vec<Replica<S, L>>,
    leader: usize,
    quorum: usize,
}

impl<S: ObjectStore, L: RevisionLog> ReplicatedExecutor<S, L> {
    pub fn new(replicas: Vec<Arc<StandaloneExecutor<S, L>>>, leader: usize) -> Self {
        assert!(!replicas.is_empty(), "a replicated executor needs at least one replica");
        assert!(leader < replicas.len(), "leader index out of range");
        let quorum = replicas.len() / 2 + 1;
        let replicas = replicas
            .into_iter()
            .map(|executor| Replica {
                executor,
                applied: AtomicUsize::new(0),
                available: AtomicBool::new(true),
                catch_up_lock: AsyncMutex::new(()),
            })
            .collect();
        Self { log: AsyncMutex::new(Vec::new()), replicas, leader, quorum }
    }

    /// Test/ops hook: simulates a replica going offline or recovering.
    pub fn set_available(&self, replica: usize, available: bool) {
        self.replicas[replica].available.store(available, Ordering::Release);
    }

    pub fn available_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.available.load(Ordering::Acquire)).count()
    }

    fn has_quorum(&self) -> bool {
        self.available_count() >= self.quorum
    }

    /// Replays whatever log entries `replica` hasn't yet applied, up to
    /// and including `up_to`, applying each exactly once. Returns the
    /// outcome of applying entry `up_to` specifically if this call is the
    /// one that performed it, or `None` if some earlier call on this
    /// replica already did (so the caller must not re-derive a result from
    /// it — the command was never meant to execute twice).
    async fn catch_up(&self, replica: &Replica<S, L>, up_to: usize) -> Option<Result<CommandOutcome, DogmaError>> {
        let _guard = replica.catch_up_lock.lock().await;
        loop {
            let next = replica.applied.load(Ordering::Acquire);
            if next > up_to {
                return None;
            }
            let (command, principal) = {
                let log = self.log.lock().await;
                log.get(next).cloned().expect("log entry must exist for an already-accepted index")
            };
            let result = replica.executor.submit(command, &principal).await;
            replica.applied.store(next + 1, Ordering::Release);
            if next == up_to {
                return Some(result);
            }
        }
    }

    /// Drives every reachable replica to the current log length, e.g.
    /// after flipping a replica back to available.
    pub async fn catch_up_all(&self) {
        let up_to = self.log.lock().await.len();
        if up_to == 0 {
            return;
        }
        for replica in &self.replicas {
            if replica.available.load(Ordering::Acquire) {
                self.catch_up(replica, up_to - 1).await;
            }
        }
    }

    /// Replication-lag tolerance for reads (spec §4.5): a reader served by
    /// `replica` may pass a last-known revision for `project/repo`. This
    /// polls that replica's locally applied head until it reaches
    /// `last_known_rev` or `wait` elapses, whichever comes first, so a
    /// client never reads a revision older than one it just wrote against
    /// a different replica. Never errors on timeout — like a watch
    /// timing out to `NotModified`, the caller decides whether a
    /// still-stale head is acceptable to read anyway.
    pub async fn await_replica_head(
        &self,
        replica: usize,
        project: &str,
        repo: &str,
        last_known_rev: i64,
        wait: Duration,
    ) -> Result<i64, DogmaError> {
        let executor = &self.replicas[replica].executor;
        let deadline = Instant::now() + wait;
        loop {
            let head = executor.repositories().get(project, repo)?.head();
            if head >= last_known_rev || Instant::now() >= deadline {
                return Ok(head);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::time::sleep(Duration::from_millis(5).min(remaining)).await;
        }
    }
}

#[async_trait]
impl<S: ObjectStore, L: RevisionLog> CommandExecutor for ReplicatedExecutor<S, L> {
    async fn submit(&self, command: Command, principal: &Principal) -> Result<CommandOutcome, DogmaError> {
        tracing::debug!(command = command.kind(), "proposing command to replica set");
        let is_status_transition = matches!(command, Command::UpdateServerStatus { .. });
        if !is_status_transition && !self.has_quorum() {
            tracing::warn!("rejecting proposal: no quorum of replicas available");
            return Err(DogmaError::Internal("no quorum of replicas available to accept the proposal".into()));
        }

        let index = {
            let mut log = self.log.lock().await;
            log.push((command, principal.clone()));
            log.len() - 1
        };

        let mut ok_count = 0usize;
        let mut leader_outcome = None;
        for (i, replica) in self.replicas.iter().enumerate() {
            if !replica.available.load(Ordering::Acquire) {
                continue;
            }
            if let Some(result) = self.catch_up(replica, index).await {
                if i == self.leader {
                    leader_outcome = Some(result);
                }
            }
            ok_count += 1;
        }

        if !is_status_transition && ok_count < self.quorum {
            return Err(DogmaError::Internal("failed to replicate to a majority of replicas".into()));
        }

        match leader_outcome {
            Some(result) => result,
            // The leader had already applied this index before this call
            // (or was unreachable this round); no follower is re-executed
            // to manufacture a result, since the command already ran
            // exactly once wherever it was applied.
            None => Ok(CommandOutcome::Unit),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::{Repositories, RepositoryProvisioner};
    use crate::object_store::FsObjectStore;
    use crate::revlog::FsRevisionLog;
    use std::path::PathBuf;

    struct TempProvisioner {
        root: PathBuf,
    }

    impl RepositoryProvisioner<FsObjectStore, FsRevisionLog> for TempProvisioner {
        fn provision(&self, project: &str, repo: &str) -> Result<(Arc<FsObjectStore>, Arc<FsRevisionLog>), DogmaError> {
            let base = self.root.join(project).join(repo);
            let store = Arc::new(FsObjectStore::open(base.join("objects"), 1024 * 1024)?);
            let log = Arc::new(FsRevisionLog::open(base.join("log"))?);
            Ok((store, log))
        }
    }

    fn replica(root: &std::path::Path, name: &str) -> Arc<StandaloneExecutor<FsObjectStore, FsRevisionLog>> {
        let provisioner = Box::new(TempProvisioner { root: root.join(name).join("repos") });
        let repositories = Repositories::new(provisioner);
        let metadata_store = Arc::new(FsObjectStore::open(root.join(name).join("meta-objects"), 1024 * 1024).unwrap());
        let metadata_log = Arc::new(FsRevisionLog::open(root.join(name).join("meta-log")).unwrap());
        Arc::new(StandaloneExecutor::new(repositories, crate::commit_engine::CommitEngine::new(metadata_store, metadata_log)))
    }

    fn alice() -> Principal {
        Principal::User("alice".into())
    }

    #[tokio::test]
    async fn replicates_to_all_available_replicas_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = ReplicatedExecutor::new(replicas, 0);

        let outcome = exec
            .submit(
                Command::Metadata(crate::executor::MetadataCommand::AddProject {
                    author: "alice".into(),
                    name: "widgets".into(),
                }),
                &alice(),
            )
            .await
            .unwrap();
        assert!(outcome.revision().is_some());

        assert_eq!(exec.replicas[0].applied.load(Ordering::Acquire), 1);
        assert_eq!(exec.replicas[1].applied.load(Ordering::Acquire), 1);
        assert_eq!(exec.replicas[2].applied.load(Ordering::Acquire), 1);
    }

    #[tokio::test]
    async fn fails_without_a_quorum_of_available_replicas() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = ReplicatedExecutor::new(replicas, 0);
        exec.set_available(1, false);
        exec.set_available(2, false);

        let result = exec
            .submit(
                Command::Metadata(crate::executor::MetadataCommand::AddProject {
                    author: "alice".into(),
                    name: "widgets".into(),
                }),
                &alice(),
            )
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn a_lagging_replica_catches_up_without_losing_or_renumbering_revisions() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = ReplicatedExecutor::new(replicas, 0);

        exec.set_available(2, false);
        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddProject {
                author: "alice".into(),
                name: "widgets".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();
        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddRepo {
                author: "alice".into(),
                project: "widgets".into(),
                name: "configs".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();
        assert_eq!(exec.replicas[2].applied.load(Ordering::Acquire), 0);

        exec.set_available(2, true);
        exec.catch_up_all().await;
        assert_eq!(exec.replicas[2].applied.load(Ordering::Acquire), 2);

        let doc = exec.replicas[2].executor.metadata().read().unwrap();
        assert!(doc.projects.contains_key("widgets"));
        assert!(doc.projects["widgets"].repos.contains_key("configs"));
    }

    #[tokio::test]
    async fn leader_unreachable_this_round_still_replicates_but_reports_no_revision() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = ReplicatedExecutor::new(replicas, 0);
        exec.set_available(0, false);

        let outcome = exec
            .submit(
                Command::Metadata(crate::executor::MetadataCommand::AddProject {
                    author: "alice".into(),
                    name: "widgets".into(),
                }),
                &alice(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Unit));
        assert_eq!(exec.replicas[1].applied.load(Ordering::Acquire), 1);
        assert_eq!(exec.replicas[2].applied.load(Ordering::Acquire), 1);

        exec.set_available(0, true);
        exec.catch_up_all().await;
        assert_eq!(exec.replicas[0].applied.load(Ordering::Acquire), 1);
        let doc = exec.replicas[0].executor.metadata().read().unwrap();
        assert!(doc.projects.contains_key("widgets"));
    }

    #[tokio::test]
    async fn await_replica_head_blocks_until_a_lagging_replica_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = Arc::new(ReplicatedExecutor::new(replicas, 0));

        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddProject {
                author: "alice".into(),
                name: "widgets".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();
        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddRepo {
                author: "alice".into(),
                project: "widgets".into(),
                name: "configs".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();

        exec.set_available(2, false);
        exec.submit(
            Command::Push {
                project: "widgets".into(),
                repo: "configs".into(),
                author: Author::new("alice", "alice@example.com"),
                base_rev: -1,
                message: CommitMessage::summary_only("add setting"),
                changes: vec![Change::upsert_json("/a.json", serde_json::json!({"x": 1}))],
            },
            &alice(),
        )
        .await
        .unwrap();

        // Replica 2 is now two revisions behind `configs`; bring it back
        // online but only drive its catch-up after a short delay, so
        // `await_replica_head` genuinely blocks rather than finding the
        // head already caught up.
        exec.set_available(2, true);
        let catch_up = tokio::spawn({
            let exec = Arc::clone(&exec);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                exec.catch_up_all().await;
            }
        });
        let head = exec.await_replica_head(2, "widgets", "configs", 2, Duration::from_millis(500)).await.unwrap();
        assert_eq!(head, 2);
        catch_up.await.unwrap();
    }

    #[tokio::test]
    async fn await_replica_head_times_out_without_erroring_when_replica_never_catches_up() {
        let dir = tempfile::tempdir().unwrap();
        let replicas = vec![replica(dir.path(), "a"), replica(dir.path(), "b"), replica(dir.path(), "c")];
        let exec = ReplicatedExecutor::new(replicas, 0);

        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddProject {
                author: "alice".into(),
                name: "widgets".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();
        exec.submit(
            Command::Metadata(crate::executor::MetadataCommand::AddRepo {
                author: "alice".into(),
                project: "widgets".into(),
                name: "configs".into(),
            }),
            &alice(),
        )
        .await
        .unwrap();

        let head = exec.await_replica_head(0, "widgets", "configs", 999, Duration::from_millis(20)).await.unwrap();
        assert!(head < 999);
    }
}
