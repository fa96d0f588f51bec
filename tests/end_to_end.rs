//! End-to-end scenarios spanning the commit engine, watch layer, the
//! replicated executor, and role resolution together, the way a caller
//! driving the public API actually would.

use std::sync::Arc;
use std::time::Duration;

use dogma_core::commit_engine::change::Change;
use dogma_core::commit_engine::commit::{Author, CommitMessage};
use dogma_core::commit_engine::query::Query;
use dogma_core::commit_engine::CommitEngine;
use dogma_core::errors::DogmaError;
use dogma_core::executor::standalone::StandaloneExecutor;
use dogma_core::executor::{Command, CommandExecutor, MetadataCommand, Repositories, RepositoryProvisioner, ServerStatus};
use dogma_core::metadata::identity::Principal;
use dogma_core::metadata::role::{ProjectRole, RepositoryRole};
use dogma_core::object_store::FsObjectStore;
use dogma_core::revlog::FsRevisionLog;
use dogma_core::watch::{watch_file, watch_repository, RevisionNotifier, WatchFileOutcome, WatchRepoOutcome};

fn engine(dir: &std::path::Path) -> CommitEngine<FsObjectStore, FsRevisionLog> {
    let store = Arc::new(FsObjectStore::open(dir.join("objects"), 4 * 1024 * 1024).unwrap());
    let log = Arc::new(FsRevisionLog::open(dir.join("log")).unwrap());
    CommitEngine::new(store, log)
}

#[tokio::test]
async fn push_then_read_round_trips_json_content() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());

    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("add settings"),
            vec![Change::upsert_json("/settings.json", serde_json::json!({"retries": 3}))],
        )
        .await
        .unwrap();

    let entry = engine.get(-1, "/settings.json").unwrap();
    assert_eq!(entry.as_json().unwrap()["retries"], 3);
}

#[tokio::test]
async fn json_path_query_extracts_a_nested_field() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("add settings"),
            vec![Change::upsert_json(
                "/settings.json",
                serde_json::json!({"limits": {"maxConnections": 128}}),
            )],
        )
        .await
        .unwrap();

    let query = Query::of_json_path("/settings.json", vec!["$.limits.maxConnections".to_string()]);
    let entry = engine.query(-1, &query).unwrap();
    assert_eq!(entry.as_json().unwrap(), &serde_json::json!(128));
}

#[tokio::test]
async fn diff_and_history_report_successive_commits() {
    let dir = tempfile::tempdir().unwrap();
    let engine = engine(dir.path());
    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("create"),
            vec![Change::upsert_json("/a.json", serde_json::json!({"x": 1}))],
        )
        .await
        .unwrap();
    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("update"),
            vec![Change::upsert_json("/a.json", serde_json::json!({"x": 2}))],
        )
        .await
        .unwrap();

    let history = engine.history(1, 2, "/**", 10).unwrap();
    assert_eq!(history.len(), 2);

    let diff = engine.diff(1, 2, "/**").unwrap();
    assert_eq!(diff.len(), 1);
}

#[tokio::test]
async fn watching_the_repository_wakes_up_on_a_new_commit() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(dir.path()));
    let notifier = Arc::new(RevisionNotifier::new());

    let waiter = {
        let engine = Arc::clone(&engine);
        let notifier = Arc::clone(&notifier);
        tokio::spawn(async move { watch_repository(&engine, &notifier, 0, "/**", Duration::from_secs(5)).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("create"),
            vec![Change::upsert_json("/a.json", serde_json::json!(1))],
        )
        .await
        .unwrap();
    notifier.notify_commit();

    let outcome = waiter.await.unwrap().unwrap();
    assert!(matches!(outcome, WatchRepoOutcome::Updated(r) if r.revision == 1));
}

#[tokio::test]
async fn watching_a_single_file_returns_its_new_content() {
    let dir = tempfile::tempdir().unwrap();
    let engine = Arc::new(engine(dir.path()));
    let notifier = Arc::new(RevisionNotifier::new());
    let query = Query::identity("/a.json");

    let waiter = {
        let engine = Arc::clone(&engine);
        let notifier = Arc::clone(&notifier);
        let query = query.clone();
        tokio::spawn(async move { watch_file(&engine, &notifier, 0, &query, Duration::from_secs(5), false).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    engine
        .push(
            -1,
            Author::new("alice", "alice@example.com"),
            CommitMessage::summary_only("create"),
            vec![Change::upsert_json("/a.json", serde_json::json!({"v": 1}))],
        )
        .await
        .unwrap();
    notifier.notify_commit();

    let outcome = waiter.await.unwrap().unwrap();
    match outcome {
        WatchFileOutcome::Updated(r) => assert_eq!(r.entry.as_json().unwrap()["v"], 1),
        WatchFileOutcome::NotModified => panic!("expected an update"),
    }
}

struct TempProvisioner {
    root: std::path::PathBuf,
}

impl RepositoryProvisioner<FsObjectStore, FsRevisionLog> for TempProvisioner {
    fn provision(&self, project: &str, repo: &str) -> Result<(Arc<FsObjectStore>, Arc<FsRevisionLog>), DogmaError> {
        let base = self.root.join(project).join(repo);
        let store = Arc::new(FsObjectStore::open(base.join("objects"), 1024 * 1024)?);
        let log = Arc::new(FsRevisionLog::open(base.join("log"))?);
        Ok((store, log))
    }
}

#[tokio::test]
async fn read_only_server_status_blocks_ordinary_pushes_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Box::new(TempProvisioner { root: dir.path().join("repos") });
    let repositories = Repositories::new(provisioner);
    let metadata_store = Arc::new(FsObjectStore::open(dir.path().join("meta-objects"), 1024 * 1024).unwrap());
    let metadata_log = Arc::new(FsRevisionLog::open(dir.path().join("meta-log")).unwrap());
    let exec = StandaloneExecutor::new(repositories, CommitEngine::new(metadata_store, metadata_log));
    let alice = Principal::User("alice".into());

    exec.submit(Command::CreateProject { author: "alice".into(), name: "widgets".into() }, &alice).await.unwrap();
    exec.submit(
        Command::CreateRepository { author: "alice".into(), project: "widgets".into(), name: "configs".into() },
        &alice,
    )
    .await
    .unwrap();
    exec.submit(Command::UpdateServerStatus { status: ServerStatus::ReplicationOnly }, &alice).await.unwrap();

    let blocked = exec
        .submit(
            Command::Push {
                project: "widgets".into(),
                repo: "configs".into(),
                author: Author::new("alice", "alice@example.com"),
                base_rev: -1,
                message: CommitMessage::summary_only("blocked"),
                changes: vec![Change::upsert_json("/a.json", serde_json::json!(1))],
            },
            &alice,
        )
        .await;
    assert_matches::assert_matches!(blocked, Err(DogmaError::ReadOnly));
}

#[tokio::test]
async fn a_project_member_is_denied_when_changing_repository_roles_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let provisioner = Box::new(TempProvisioner { root: dir.path().join("repos") });
    let repositories = Repositories::new(provisioner);
    let metadata_store = Arc::new(FsObjectStore::open(dir.path().join("meta-objects"), 1024 * 1024).unwrap());
    let metadata_log = Arc::new(FsRevisionLog::open(dir.path().join("meta-log")).unwrap());
    let exec = StandaloneExecutor::new(repositories, CommitEngine::new(metadata_store, metadata_log));

    let alice = Principal::User("alice".into());
    let bob = Principal::User("bob".into());

    exec.submit(Command::CreateProject { author: "alice".into(), name: "widgets".into() }, &alice).await.unwrap();
    exec.submit(
        Command::CreateRepository { author: "alice".into(), project: "widgets".into(), name: "configs".into() },
        &alice,
    )
    .await
    .unwrap();
    exec.submit(
        Command::Metadata(MetadataCommand::AddMember {
            author: "alice".into(),
            project: "widgets".into(),
            user: "bob".into(),
            role: ProjectRole::Member,
        }),
        &alice,
    )
    .await
    .unwrap();
    exec.submit(
        Command::Metadata(MetadataCommand::AddUserRepositoryRole {
            author: "alice".into(),
            project: "widgets".into(),
            repo: "configs".into(),
            user: "bob".into(),
            role: RepositoryRole::Write,
        }),
        &alice,
    )
    .await
    .unwrap();

    // Bob is a project MEMBER with repository WRITE, not ADMIN — he may
    // push but must not be able to grant roles on the repository himself.
    let denied = exec
        .submit(
            Command::Metadata(MetadataCommand::UpdateRepositoryProjectRoles {
                author: "bob".into(),
                project: "widgets".into(),
                repo: "configs".into(),
                member_role: Some(RepositoryRole::Admin),
                guest_role: None,
            }),
            &bob,
        )
        .await;
    assert_matches::assert_matches!(
        denied,
        Err(DogmaError::Authorization { needed: RepositoryRole::Admin, actual: Some(RepositoryRole::Write) })
    );

    // The role table is untouched: Bob still can't read it as admin, and
    // a legitimate push from him still succeeds since WRITE was never
    // revoked.
    let pushed = exec
        .submit(
            Command::Push {
                project: "widgets".into(),
                repo: "configs".into(),
                author: Author::new("bob", "bob@example.com"),
                base_rev: -1,
                message: CommitMessage::summary_only("bob's change"),
                changes: vec![Change::upsert_json("/a.json", serde_json::json!(1))],
            },
            &bob,
        )
        .await;
    assert!(pushed.is_ok());
}
