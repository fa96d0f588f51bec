//! Per-repository revision log: a gap-free, strictly +1
//! sequence of commit records, each pointing at a root tree digest in the
//! object store.
//!
//! `append` is the serialization point for a repository — at most one
//! caller ever wins a given revision number — which is why every
//! `RevisionLog` is wrapped in an `Arc<tokio::sync::Mutex<_>>` by its owner
//! rather than being internally locked here; callers that only read never
//! contend with it.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::commit_engine::change::Change;
use crate::errors::DogmaError;
use crate::hash::ObjectHash;

/// Markup of a commit's long-form `detail`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Markup {
    Plain,
    Markdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitMeta {
    pub author: String,
    pub timestamp_millis: i64,
    pub summary: String,
    pub detail: String,
    pub markup: Markup,
}

/// One entry in the log: the revision it was assigned, the metadata given
/// by the caller, the digest of the resulting root tree, and the revision
/// it was built on top of (0 for the repository's first commit).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitRecord {
    pub revision: i64,
    pub meta: CommitMeta,
    pub root_tree: ObjectHash,
    pub parent_revision: i64,
    /// Changes as actually applied (post-normalization), so `history` can
    /// report `changes` without recomputing a tree diff.
    pub changes: Vec<Change>,
}

pub trait RevisionLog: Send + Sync {
    fn head(&self) -> i64;
    fn get(&self, revision: i64) -> Result<CommitRecord, DogmaError>;
    /// Appends the next record. Fails with `ChangeConflict` if
    /// `parent_revision != head()` — the caller raced another writer.
    fn append(
        &self,
        meta: CommitMeta,
        root_tree: ObjectHash,
        parent_revision: i64,
        changes: Vec<Change>,
    ) -> Result<i64, DogmaError>;
    /// Inclusive range, descending if `from > to`, ascending otherwise,
    /// capped at `max_count`.
    fn range(&self, from: i64, to: i64, max_count: usize) -> Result<Vec<CommitRecord>, DogmaError>;
}

/// Upper bound on a single `range` call, regardless of what the caller asks
/// for.
pub const MAX_MAX_COMMITS: usize = 10_000;

/// Append-only, newline-delimited-JSON log file plus an in-memory mirror.
///
/// Recovery discipline: every record is written with `write_all` followed
/// by `sync_data`, so a crash either leaves the previous, fully-written
/// record as the last line (head did not advance) or the new record fully
/// present (head advanced) — never a half-written line, matching the
/// "write-object-then-append-log discipline" the object store also
/// follows.
pub struct FsRevisionLog {
    path: PathBuf,
    records: std::sync::Mutex<Vec<CommitRecord>>,
}

impl FsRevisionLog {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, DogmaError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let records = if path.is_file() {
            load_records(&path)?
        } else {
            Vec::new()
        };
        Ok(Self {
            path,
            records: std::sync::Mutex::new(records),
        })
    }
}

fn load_records(path: &Path) -> Result<Vec<CommitRecord>, DogmaError> {
    let raw = std::fs::read_to_string(path)?;
    raw.lines()
        .filter(|l| !l.is_empty())
        .map(|l| serde_json::from_str(l).map_err(|e| DogmaError::Codec(e.to_string())))
        .collect()
}

impl RevisionLog for FsRevisionLog {
    fn head(&self) -> i64 {
        self.records.lock().unwrap().last().map_or(0, |r| r.revision)
    }

    fn get(&self, revision: i64) -> Result<CommitRecord, DogmaError> {
        let records = self.records.lock().unwrap();
        records
            .iter()
            .find(|r| r.revision == revision)
            .cloned()
            .ok_or(DogmaError::RevisionNotFound(revision))
    }

    fn append(
        &self,
        meta: CommitMeta,
        root_tree: ObjectHash,
        parent_revision: i64,
        changes: Vec<Change>,
    ) -> Result<i64, DogmaError> {
        let mut records = self.records.lock().unwrap();
        let head = records.last().map_or(0, |r| r.revision);
        if parent_revision != head {
            return Err(DogmaError::ChangeConflict(format!(
                "head advanced to {head} while pushing against {parent_revision}"
            )));
        }
        let revision = head + 1;
        let record = CommitRecord {
            revision,
            meta,
            root_tree,
            parent_revision,
            changes,
        };
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let mut line = serde_json::to_vec(&record).map_err(|e| DogmaError::Codec(e.to_string()))?;
        line.push(b'\n');
        file.write_all(&line)?;
        file.sync_data()?;
        records.push(record);
        Ok(revision)
    }

    fn range(&self, from: i64, to: i64, max_count: usize) -> Result<Vec<CommitRecord>, DogmaError> {
        let max_count = max_count.min(MAX_MAX_COMMITS);
        let records = self.records.lock().unwrap();
        let (lo, hi, descending) = if from > to { (to, from, true) } else { (from, to, false) };
        let mut out: Vec<CommitRecord> = records
            .iter()
            .filter(|r| r.revision >= lo && r.revision <= hi)
            .cloned()
            .collect();
        if descending {
            out.reverse();
        }
        out.truncate(max_count);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(summary: &str) -> CommitMeta {
        CommitMeta {
            author: "test".into(),
            timestamp_millis: 0,
            summary: summary.into(),
            detail: String::new(),
            markup: Markup::Plain,
        }
    }

    #[test]
    fn appends_are_gap_free() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsRevisionLog::open(dir.path().join("log")).unwrap();
        assert_eq!(log.head(), 0);
        let r1 = log.append(meta("one"), ObjectHash::of(b"t1"), 0, vec![]).unwrap();
        let r2 = log.append(meta("two"), ObjectHash::of(b"t2"), r1, vec![]).unwrap();
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
        assert_eq!(log.head(), 2);
    }

    #[test]
    fn append_against_stale_parent_conflicts() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsRevisionLog::open(dir.path().join("log")).unwrap();
        log.append(meta("one"), ObjectHash::of(b"t1"), 0, vec![]).unwrap();
        let err = log.append(meta("two"), ObjectHash::of(b"t2"), 0, vec![]).unwrap_err();
        assert_matches::assert_matches!(err, DogmaError::ChangeConflict(_));
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let log = FsRevisionLog::open(&path).unwrap();
            log.append(meta("one"), ObjectHash::of(b"t1"), 0, vec![]).unwrap();
        }
        let reopened = FsRevisionLog::open(&path).unwrap();
        assert_eq!(reopened.head(), 1);
        assert_eq!(reopened.get(1).unwrap().meta.summary, "one");
    }

    #[test]
    fn range_orders_by_direction() {
        let dir = tempfile::tempdir().unwrap();
        let log = FsRevisionLog::open(dir.path().join("log")).unwrap();
        log.append(meta("one"), ObjectHash::of(b"t1"), 0, vec![]).unwrap();
        log.append(meta("two"), ObjectHash::of(b"t2"), 1, vec![]).unwrap();
        log.append(meta("three"), ObjectHash::of(b"t3"), 2, vec![]).unwrap();

        let asc = log.range(1, 3, 10).unwrap();
        assert_eq!(asc.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![1, 2, 3]);

        let desc = log.range(3, 1, 10).unwrap();
        assert_eq!(desc.iter().map(|r| r.revision).collect::<Vec<_>>(), vec![3, 2, 1]);
    }

    quickcheck::quickcheck! {
        /// For any number of sequential appends, the resulting revisions are
        /// exactly `1..=n` in order: no gaps, no repeats, no renumbering.
        fn sequential_appends_are_exactly_one_through_n(n: u8) -> bool {
            let n = (n % 40) as i64;
            let dir = tempfile::tempdir().unwrap();
            let log = FsRevisionLog::open(dir.path().join("log")).unwrap();
            let mut parent = 0;
            let mut revisions = Vec::new();
            for i in 0..n {
                let rev = log.append(meta(&format!("c{i}")), ObjectHash::of(format!("t{i}").as_bytes()), parent, vec![]).unwrap();
                revisions.push(rev);
                parent = rev;
            }
            revisions == (1..=n).collect::<Vec<_>>()
        }
    }
}
