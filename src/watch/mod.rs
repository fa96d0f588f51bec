//! Long-poll watch semantics: deliver the first revision after
//! `lastKnownRev` that touches a path or pattern, bounded by a wait budget,
//! with cancellation and no missed wakeups.

pub mod watcher;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use crate::commit_engine::entry::Entry;
use crate::commit_engine::query::Query;
use crate::commit_engine::CommitEngine;
use crate::errors::DogmaError;
use crate::object_store::ObjectStore;
use crate::revlog::{RevisionLog, MAX_MAX_COMMITS};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchRepoResult {
    pub revision: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchFileResult {
    pub revision: i64,
    pub entry: Entry,
}

pub enum WatchRepoOutcome {
    Updated(WatchRepoResult),
    NotModified,
}

pub enum WatchFileOutcome {
    Updated(WatchFileResult),
    NotModified,
}

/// Per-repository notification fan-out. Every push calls `notify_commit`;
/// long-pollers create their `notified()` future *before* re-checking the
/// head, so a commit landing between the check and the wait is never
/// missed — the standard `tokio::sync::Notify` race-free pattern.
#[derive(Default)]
pub struct RevisionNotifier {
    notify: Notify,
}

impl RevisionNotifier {
    pub fn new() -> Self {
        Self { notify: Notify::new() }
    }

    pub fn notify_commit(&self) {
        self.notify.notify_waiters();
    }
}

/// Server-side wait budget clip: the caller's requested wait clamped to the
/// local policy ceiling (`max_wait`). The client transport deadline must
/// exceed the clamped value by some slack; that is the transport's concern,
/// not this crate's.
pub fn clip_wait(requested: Duration, max_wait: Duration) -> Duration {
    requested.min(max_wait)
}

pub async fn watch_repository<S: ObjectStore, L: RevisionLog>(
    engine: &CommitEngine<S, L>,
    notifier: &RevisionNotifier,
    last_known_rev: i64,
    pattern: &str,
    wait: Duration,
) -> Result<WatchRepoOutcome, DogmaError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let notified = notifier.notify.notified();
        if let Some(revision) = next_matching_revision(engine, last_known_rev, pattern)? {
            return Ok(WatchRepoOutcome::Updated(WatchRepoResult { revision }));
        }
        tokio::select! {
            _ = notified => continue,
            _ = tokio::time::sleep_until(deadline) => return Ok(WatchRepoOutcome::NotModified),
        }
    }
}

/// Like [`watch_repository`], but also returns the queried entry content
/// at the new revision. `error_on_entry_not_found` controls whether a
/// missing target is reported as an error or simply treated as "keep
/// waiting".
pub async fn watch_file<S: ObjectStore, L: RevisionLog>(
    engine: &CommitEngine<S, L>,
    notifier: &RevisionNotifier,
    last_known_rev: i64,
    query: &Query,
    wait: Duration,
    error_on_entry_not_found: bool,
) -> Result<WatchFileOutcome, DogmaError> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let notified = notifier.notify.notified();
        if let Some(revision) = next_matching_revision(engine, last_known_rev, &query.path)? {
            match engine.query(revision, query) {
                Ok(entry) => return Ok(WatchFileOutcome::Updated(WatchFileResult { revision, entry })),
                Err(DogmaError::EntryNotFound(_)) if error_on_entry_not_found => {
                    return Err(DogmaError::EntryNotFound(query.path.clone()))
                }
                Err(DogmaError::EntryNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        tokio::select! {
            _ = notified => continue,
            _ = tokio::time::sleep_until(deadline) => return Ok(WatchFileOutcome::NotModified),
        }
    }
}

fn next_matching_revision<S: ObjectStore, L: RevisionLog>(
    engine: &CommitEngine<S, L>,
    last_known_rev: i64,
    pattern: &str,
) -> Result<Option<i64>, DogmaError> {
    let head = engine.head();
    if head <= last_known_rev {
        return Ok(None);
    }
    let commits = engine.history(last_known_rev + 1, head, pattern, MAX_MAX_COMMITS)?;
    Ok(commits.first().map(|c| c.revision))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commit_engine::change::Change;
    use crate::commit_engine::commit::{Author, CommitMessage};
    use crate::object_store::FsObjectStore;
    use crate::revlog::FsRevisionLog;
    use std::sync::Arc;
    use std::time::Duration;

    fn engine() -> (tempfile::TempDir, CommitEngine<FsObjectStore, FsRevisionLog>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FsObjectStore::open(dir.path().join("objects"), 1024 * 1024).unwrap());
        let log = Arc::new(FsRevisionLog::open(dir.path().join("log")).unwrap());
        (dir, CommitEngine::new(store, log))
    }

    #[tokio::test]
    async fn returns_immediately_when_already_past_last_known() {
        let (_dir, engine) = engine();
        engine
            .push(
                -1,
                Author::new("t", "t@example.com"),
                CommitMessage::summary_only("init"),
                vec![Change::upsert_json("/a.json", serde_json::json!(1))],
            )
            .await
            .unwrap();
        let notifier = RevisionNotifier::new();
        let outcome = watch_repository(&engine, &notifier, 0, "/**", Duration::from_millis(50)).await.unwrap();
        assert!(matches!(outcome, WatchRepoOutcome::Updated(WatchRepoResult { revision: 1 })));
    }

    #[tokio::test]
    async fn times_out_with_not_modified() {
        let (_dir, engine) = engine();
        let notifier = RevisionNotifier::new();
        let outcome = watch_repository(&engine, &notifier, 0, "/**", Duration::from_millis(20)).await.unwrap();
        assert!(matches!(outcome, WatchRepoOutcome::NotModified));
    }

    #[tokio::test]
    async fn wakes_up_on_notification_after_matching_push() {
        let (_dir, engine) = engine();
        let notifier = RevisionNotifier::new();
        let waiter = watch_repository(&engine, &notifier, 0, "/a.json", Duration::from_secs(5));

        let pushed = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            engine
                .push(
                    -1,
                    Author::new("t", "t@example.com"),
                    CommitMessage::summary_only("init"),
                    vec![Change::upsert_json("/a.json", serde_json::json!(1))],
                )
                .await
                .unwrap();
            notifier.notify_commit();
        };

        let (outcome, _) = tokio::join!(waiter, pushed);
        assert!(matches!(outcome.unwrap(), WatchRepoOutcome::Updated(WatchRepoResult { revision: 1 })));
    }

    #[tokio::test]
    async fn watch_file_returns_entry_at_new_revision() {
        let (_dir, engine) = engine();
        engine
            .push(
                -1,
                Author::new("t", "t@example.com"),
                CommitMessage::summary_only("init"),
                vec![Change::upsert_json("/a.json", serde_json::json!({"x": 1}))],
            )
            .await
            .unwrap();
        let notifier = RevisionNotifier::new();
        let query = Query::of_json("/a.json");
        let outcome = watch_file(&engine, &notifier, 0, &query, Duration::from_millis(50), false).await.unwrap();
        match outcome {
            WatchFileOutcome::Updated(result) => {
                assert_eq!(result.revision, 1);
                assert_eq!(result.entry.as_json().unwrap(), &serde_json::json!({"x": 1}));
            }
            WatchFileOutcome::NotModified => panic!("expected update"),
        }
    }

    #[test]
    fn clip_wait_never_exceeds_policy_ceiling() {
        assert_eq!(clip_wait(Duration::from_secs(120), Duration::from_secs(60)), Duration::from_secs(60));
        assert_eq!(clip_wait(Duration::from_secs(10), Duration::from_secs(60)), Duration::from_secs(10));
    }
}
