//! Applies changes against a repository's materialized tree and produces
//! new commits: read/find/query/merge/history/diff/push/transform.

pub mod change;
pub mod commit;
pub mod entry;
pub mod pattern;
pub mod query;
pub mod textdiff;

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashSet;
use chrono::Utc;

use crate::commit_engine::change::{apply_json_patch, diff_json_patch, Change, ChangeContent};
use crate::commit_engine::commit::{Author, Commit, CommitMessage, PushResult};
use crate::commit_engine::entry::Entry;
use crate::commit_engine::pattern::Pattern;
use crate::commit_engine::query::{deep_merge, entry_as_merge_value, MergeSource, Query};
use crate::commit_engine::textdiff::{apply_unified_diff, unified_diff};
use crate::errors::DogmaError;
use crate::object_store::tree::{BlobKind, Tree, TreeNode};
use crate::object_store::{canonicalize_json, ObjectStore};
use crate::revlog::{CommitMeta, Markup, RevisionLog};
use crate::utils::is_valid_path;

/// Maximum net-new-content size a single push's text/JSON payload may
/// serialize to, independent of storage quota — guards against a single
/// pathological payload blowing up the tree walk — a defensive bound any
/// production store of this shape would carry.
pub const MAX_CHANGE_PAYLOAD_BYTES: usize = 64 * 1024 * 1024;

/// One repository's commit engine: an object store plus a revision log,
/// with push serialized per instance via `push_lock`.
pub struct CommitEngine<S: ObjectStore, L: RevisionLog> {
    store: Arc<S>,
    log: Arc<L>,
    push_lock: tokio::sync::Mutex<()>,
}

impl<S: ObjectStore, L: RevisionLog> CommitEngine<S, L> {
    pub fn new(store: Arc<S>, log: Arc<L>) -> Self {
        Self {
            store,
            log,
            push_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn head(&self) -> i64 {
        self.log.head()
    }

    /// Resolves a requested revision (absolute ≥ 1, or relative ≤ −1 where
    /// −1 = HEAD) against the repository's current head.
    pub fn resolve_revision(&self, requested: i64) -> Result<i64, DogmaError> {
        Self::resolve_against(requested, self.log.head())
    }

    fn resolve_against(requested: i64, head: i64) -> Result<i64, DogmaError> {
        let resolved = match requested.cmp(&0) {
            std::cmp::Ordering::Less => head + requested + 1,
            std::cmp::Ordering::Equal => {
                return Err(DogmaError::InvalidPush("revision 0 is reserved".into()))
            }
            std::cmp::Ordering::Greater => requested,
        };
        if resolved < 1 || resolved > head {
            return Err(DogmaError::RevisionNotFound(requested));
        }
        Ok(resolved)
    }

    fn load_root(&self, revision: i64) -> Result<Tree, DogmaError> {
        if revision == 0 {
            return Ok(Tree::new());
        }
        let record = self.log.get(revision)?;
        Tree::read(self.store.as_ref(), &record.root_tree)
    }

    fn split_path(path: &str) -> Vec<&str> {
        path.trim_start_matches('/').split('/').filter(|s| !s.is_empty()).collect()
    }

    fn get_node(&self, tree: &Tree, path: &str) -> Result<Option<TreeNode>, DogmaError> {
        let segs = Self::split_path(path);
        if segs.is_empty() {
            return Ok(None);
        }
        let mut current = tree.clone();
        for (i, seg) in segs.iter().enumerate() {
            let entry = match current.get(seg) {
                Some(e) => e,
                None => return Ok(None),
            };
            if i == segs.len() - 1 {
                return Ok(Some(entry.node.clone()));
            }
            match &entry.node {
                TreeNode::Tree { hash } => current = Tree::read(self.store.as_ref(), hash)?,
                TreeNode::Blob { .. } => return Ok(None),
            }
        }
        Ok(None)
    }

    fn path_exists(&self, tree: &Tree, path: &str) -> Result<bool, DogmaError> {
        Ok(self.get_node(tree, path)?.is_some())
    }

    fn try_get_json(&self, tree: &Tree, path: &str) -> Result<Option<serde_json::Value>, DogmaError> {
        match self.get_node(tree, path)? {
            Some(TreeNode::Blob { kind: BlobKind::Json, hash }) => {
                let bytes = self.store.read(&hash)?;
                Ok(Some(
                    serde_json::from_slice(&bytes).map_err(|e| DogmaError::Codec(e.to_string()))?,
                ))
            }
            Some(_) => Err(DogmaError::ChangeFormat(format!("{path} is not a JSON entry"))),
            None => Ok(None),
        }
    }

    fn try_get_text(&self, tree: &Tree, path: &str) -> Result<Option<String>, DogmaError> {
        match self.get_node(tree, path)? {
            Some(TreeNode::Blob { kind: BlobKind::Text, hash }) => {
                let bytes = self.store.read(&hash)?;
                Ok(Some(String::from_utf8(bytes).map_err(|e| DogmaError::Codec(e.to_string()))?))
            }
            Some(_) => Err(DogmaError::ChangeFormat(format!("{path} is not a text entry"))),
            None => Ok(None),
        }
    }

    fn set_node(&self, tree: &Tree, path: &str, node: TreeNode) -> Result<Tree, DogmaError> {
        let segs = Self::split_path(path);
        if segs.is_empty() {
            return Err(DogmaError::InvalidName(path.to_string()));
        }
        Self::set_node_rec(self.store.as_ref(), tree, &segs, node)
    }

    fn set_node_rec(store: &S, tree: &Tree, segs: &[&str], node: TreeNode) -> Result<Tree, DogmaError> {
        if segs.len() == 1 {
            return Ok(tree.with_entry(segs[0], node));
        }
        let head = segs[0];
        let child_tree = match tree.get(head) {
            Some(entry) => match &entry.node {
                TreeNode::Tree { hash } => Tree::read(store, hash)?,
                TreeNode::Blob { .. } => Tree::new(),
            },
            None => Tree::new(),
        };
        let updated_child = Self::set_node_rec(store, &child_tree, &segs[1..], node)?;
        let hash = updated_child.write(store)?;
        Ok(tree.with_entry(head, TreeNode::Tree { hash }))
    }

    fn set_json(&self, tree: &Tree, path: &str, value: &serde_json::Value) -> Result<Tree, DogmaError> {
        let hash = self.store.write(&canonicalize_json(value))?;
        self.set_node(tree, path, TreeNode::Blob { kind: BlobKind::Json, hash })
    }

    fn set_text(&self, tree: &Tree, path: &str, text: &str) -> Result<Tree, DogmaError> {
        if text.len() > MAX_CHANGE_PAYLOAD_BYTES {
            return Err(DogmaError::InvalidPush(format!("{path} exceeds maximum payload size")));
        }
        let hash = self.store.write(text.as_bytes())?;
        self.set_node(tree, path, TreeNode::Blob { kind: BlobKind::Text, hash })
    }

    fn remove_entry(&self, tree: &Tree, path: &str) -> Result<Tree, DogmaError> {
        let segs = Self::split_path(path);
        if segs.is_empty() {
            return Err(DogmaError::InvalidName(path.to_string()));
        }
        Self::remove_rec(self.store.as_ref(), tree, &segs)
    }

    fn remove_rec(store: &S, tree: &Tree, segs: &[&str]) -> Result<Tree, DogmaError> {
        if segs.len() == 1 {
            if tree.get(segs[0]).is_none() {
                return Err(DogmaError::ChangeConflict(format!("path does not exist: {}", segs[0])));
            }
            return Ok(tree.without_entry(segs[0]));
        }
        let head = segs[0];
        let entry = tree
            .get(head)
            .ok_or_else(|| DogmaError::ChangeConflict(format!("path does not exist: {head}")))?;
        let hash = match &entry.node {
            TreeNode::Tree { hash } => *hash,
            TreeNode::Blob { .. } => return Err(DogmaError::ChangeConflict(format!("{head} is not a directory"))),
        };
        let child = Tree::read(store, &hash)?;
        let updated = Self::remove_rec(store, &child, &segs[1..])?;
        let new_hash = updated.write(store)?;
        Ok(tree.with_entry(head, TreeNode::Tree { hash: new_hash }))
    }

    fn apply_json_patch_at(&self, tree: &Tree, path: &str, patch: &serde_json::Value) -> Result<Tree, DogmaError> {
        let current = self
            .try_get_json(tree, path)?
            .ok_or_else(|| DogmaError::EntryNotFound(path.to_string()))?;
        let updated = apply_json_patch(&current, patch)?;
        self.set_json(tree, path, &updated)
    }

    fn walk(&self, tree: &Tree, path: &str, revision: i64) -> Result<Entry, DogmaError> {
        if Self::split_path(path).is_empty() {
            return Ok(Entry::directory("/", revision));
        }
        match self.get_node(tree, path)? {
            None => Err(DogmaError::EntryNotFound(path.to_string())),
            Some(TreeNode::Tree { .. }) => Ok(Entry::directory(path, revision)),
            Some(TreeNode::Blob { kind, hash }) => {
                let bytes = self.store.read(&hash)?;
                match kind {
                    BlobKind::Json => Ok(Entry::json(
                        path,
                        serde_json::from_slice(&bytes).map_err(|e| DogmaError::Codec(e.to_string()))?,
                        revision,
                    )),
                    BlobKind::Text => Ok(Entry::text(
                        path,
                        String::from_utf8(bytes).map_err(|e| DogmaError::Codec(e.to_string()))?,
                        revision,
                    )),
                }
            }
        }
    }

    pub fn get(&self, requested_rev: i64, path: &str) -> Result<Entry, DogmaError> {
        if !is_valid_path(path) {
            return Err(DogmaError::InvalidName(path.to_string()));
        }
        let head = self.log.head();
        let revision = Self::resolve_against(requested_rev, head)?;
        let tree = self.load_root(revision)?;
        self.walk(&tree, path, revision)
    }

    pub fn find(&self, requested_rev: i64, pattern: &str) -> Result<BTreeMap<String, Entry>, DogmaError> {
        let head = self.log.head();
        let revision = Self::resolve_against(requested_rev, head)?;
        let tree = self.load_root(revision)?;
        let compiled = Pattern::parse(pattern);
        let mut out = BTreeMap::new();
        self.collect(&tree, "", revision, &compiled, &mut out)?;
        Ok(out)
    }

    fn collect(
        &self,
        tree: &Tree,
        prefix: &str,
        revision: i64,
        pattern: &Pattern,
        out: &mut BTreeMap<String, Entry>,
    ) -> Result<(), DogmaError> {
        for entry in &tree.entries {
            let path = format!("{prefix}/{}", entry.name);
            match &entry.node {
                TreeNode::Tree { hash } => {
                    if pattern.matches(&path) {
                        out.insert(path.clone(), Entry::directory(path.clone(), revision));
                    }
                    let child = Tree::read(self.store.as_ref(), hash)?;
                    self.collect(&child, &path, revision, pattern, out)?;
                }
                TreeNode::Blob { kind, hash } => {
                    if pattern.matches(&path) {
                        let bytes = self.store.read(hash)?;
                        let e = match kind {
                            BlobKind::Json => Entry::json(
                                path.clone(),
                                serde_json::from_slice(&bytes).map_err(|e| DogmaError::Codec(e.to_string()))?,
                                revision,
                            ),
                            BlobKind::Text => Entry::text(
                                path.clone(),
                                String::from_utf8(bytes).map_err(|e| DogmaError::Codec(e.to_string()))?,
                                revision,
                            ),
                        };
                        out.insert(path, e);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn query(&self, requested_rev: i64, query: &Query) -> Result<Entry, DogmaError> {
        let entry = self.get(requested_rev, &query.path)?;
        crate::commit_engine::query::evaluate(&entry, &query.query_type)
    }

    pub fn merge(&self, requested_rev: i64, sources: &[MergeSource]) -> Result<Entry, DogmaError> {
        let head = self.log.head();
        let revision = Self::resolve_against(requested_rev, head)?;
        let tree = self.load_root(revision)?;
        let mut values = Vec::new();
        let mut any_present = false;
        for src in sources {
            match self.walk(&tree, &src.path, revision) {
                Ok(entry) => {
                    any_present = true;
                    values.push(entry_as_merge_value(&entry)?);
                }
                Err(DogmaError::EntryNotFound(_)) if src.optional => continue,
                Err(e) => return Err(e),
            }
        }
        if !any_present {
            return Err(DogmaError::EntryNotFound("no merge sources present".into()));
        }
        let merged = deep_merge(values)?;
        Ok(Entry::json("/merged", merged, revision))
    }

    pub fn history(&self, from: i64, to: i64, pattern: &str, max_commits: usize) -> Result<Vec<Commit>, DogmaError> {
        let head = self.log.head();
        let from_r = Self::resolve_against(from, head)?;
        let to_r = Self::resolve_against(to, head)?;
        let records = self.log.range(from_r, to_r, max_commits)?;
        let compiled = Pattern::parse(pattern);
        Ok(records
            .into_iter()
            .filter(|r| r.changes.iter().any(|c| compiled.matches(&c.path)))
            .map(|r| record_to_commit(&r))
            .collect())
    }

    /// The minimal `Change` set that transforms the matched entries at
    /// `from` into those at `to`. Identical content yields no entry.
    pub fn diff(&self, from: i64, to: i64, pattern: &str) -> Result<Vec<Change>, DogmaError> {
        let head = self.log.head();
        let from_r = Self::resolve_against(from, head)?;
        let to_r = Self::resolve_against(to, head)?;
        let old = self.find(from_r, pattern)?;
        let new = self.find(to_r, pattern)?;
        let mut out = Vec::new();

        for (path, new_entry) in &new {
            match old.get(path) {
                None => match &new_entry.content {
                    crate::commit_engine::entry::EntryContent::Json(v) => {
                        out.push(Change::upsert_json(path.clone(), v.clone()))
                    }
                    crate::commit_engine::entry::EntryContent::Text(t) => {
                        out.push(Change::upsert_text(path.clone(), t.clone()))
                    }
                    crate::commit_engine::entry::EntryContent::Directory => {}
                },
                Some(old_entry) => {
                    if old_entry == new_entry {
                        continue;
                    }
                    match (&old_entry.content, &new_entry.content) {
                        (
                            crate::commit_engine::entry::EntryContent::Json(old_v),
                            crate::commit_engine::entry::EntryContent::Json(new_v),
                        ) => {
                            if canonicalize_json(old_v) != canonicalize_json(new_v) {
                                out.push(Change {
                                    path: path.clone(),
                                    content: ChangeContent::ApplyJsonPatch(diff_json_patch(old_v, new_v)),
                                });
                            }
                        }
                        (
                            crate::commit_engine::entry::EntryContent::Text(old_t),
                            crate::commit_engine::entry::EntryContent::Text(new_t),
                        ) => {
                            if old_t != new_t {
                                out.push(Change {
                                    path: path.clone(),
                                    content: ChangeContent::ApplyTextPatch(unified_diff(old_t, new_t)),
                                });
                            }
                        }
                        _ => out.push(Change::remove(path.clone())),
                    }
                }
            }
        }
        for path in old.keys() {
            if !new.contains_key(path) {
                out.push(Change::remove(path.clone()));
            }
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Applies `changes` against the tree at `base_tree`, returning the new
    /// tree, the changes as actually applied (normalized), and whether any
    /// change had a net effect.
    fn apply_changes(&self, base_tree: &Tree, changes: &[Change]) -> Result<(Tree, Vec<Change>, bool), DogmaError> {
        let mut tree = base_tree.clone();
        let mut actual = Vec::new();
        let mut any_applied = false;

        for change in changes {
            match &change.content {
                ChangeContent::UpsertJson(value) => match self.try_get_json(&tree, &change.path)? {
                    None => {
                        tree = self.set_json(&tree, &change.path, value)?;
                        actual.push(change.clone());
                        any_applied = true;
                    }
                    Some(current) => {
                        if canonicalize_json(&current) == canonicalize_json(value) {
                            continue;
                        }
                        let patch = diff_json_patch(&current, value);
                        tree = self.apply_json_patch_at(&tree, &change.path, &patch)?;
                        actual.push(Change {
                            path: change.path.clone(),
                            content: ChangeContent::ApplyJsonPatch(patch),
                        });
                        any_applied = true;
                    }
                },
                ChangeContent::UpsertText(text) => {
                    if self.try_get_text(&tree, &change.path)?.as_deref() == Some(text.as_str()) {
                        continue;
                    }
                    tree = self.set_text(&tree, &change.path, text)?;
                    actual.push(change.clone());
                    any_applied = true;
                }
                ChangeContent::Remove => {
                    if !self.path_exists(&tree, &change.path)? {
                        return Err(DogmaError::ChangeConflict(format!(
                            "cannot remove missing path {}",
                            change.path
                        )));
                    }
                    tree = self.remove_entry(&tree, &change.path)?;
                    actual.push(change.clone());
                    any_applied = true;
                }
                ChangeContent::Rename(new_path) => {
                    if self.path_exists(&tree, new_path)? {
                        return Err(DogmaError::ChangeConflict(format!("rename target exists: {new_path}")));
                    }
                    let node = self
                        .get_node(&tree, &change.path)?
                        .ok_or_else(|| DogmaError::EntryNotFound(change.path.clone()))?;
                    tree = self.remove_entry(&tree, &change.path)?;
                    tree = self.set_node(&tree, new_path, node)?;
                    actual.push(change.clone());
                    any_applied = true;
                }
                ChangeContent::ApplyJsonPatch(patch) => {
                    tree = self.apply_json_patch_at(&tree, &change.path, patch)?;
                    actual.push(change.clone());
                    any_applied = true;
                }
                ChangeContent::ApplyTextPatch(diff) => {
                    let current = self.try_get_text(&tree, &change.path)?.unwrap_or_default();
                    let applied = apply_unified_diff(&current, diff)?;
                    tree = self.set_text(&tree, &change.path, &applied)?;
                    actual.push(change.clone());
                    any_applied = true;
                }
            }
        }
        Ok((tree, actual, any_applied))
    }

    fn validate_changes(changes: &[Change]) -> Result<(), DogmaError> {
        if changes.is_empty() {
            return Err(DogmaError::InvalidPush("push must contain at least one change".into()));
        }
        let mut seen = AHashSet::default();
        for c in changes {
            if !is_valid_path(&c.path) {
                return Err(DogmaError::InvalidPush(format!("invalid path: {}", c.path)));
            }
            if !seen.insert(c.path.as_str()) {
                return Err(DogmaError::InvalidPush(format!("duplicate target path in push: {}", c.path)));
            }
        }
        Ok(())
    }

    /// Pushes `changes` on top of `base_rev`. If `base_rev` is relative
    /// (≤ 0, i.e. the caller did not pin an explicit revision), a race with
    /// a concurrent push retries against the new head; an explicit
    /// (absolute) `base_rev` that has gone stale fails with
    /// `ChangeConflict` instead.
    pub async fn push(
        &self,
        base_rev: i64,
        author: Author,
        message: CommitMessage,
        changes: Vec<Change>,
    ) -> Result<PushResult, DogmaError> {
        Self::validate_changes(&changes)?;
        let explicit = base_rev > 0;
        let _guard = self.push_lock.lock().await;

        loop {
            let head = self.log.head();
            let resolved_base = Self::resolve_against(base_rev, head).or_else(|e| {
                if base_rev < 0 && head == 0 {
                    Ok(0)
                } else {
                    Err(e)
                }
            })?;
            if explicit && resolved_base != head {
                return Err(DogmaError::ChangeConflict(format!(
                    "base revision {resolved_base} is not head ({head})"
                )));
            }

            let base_tree = self.load_root(head)?;
            let (new_tree, actual_changes, any_applied) = self.apply_changes(&base_tree, &changes)?;
            if !any_applied {
                return Err(DogmaError::RedundantChange);
            }

            let root_hash = new_tree.write(self.store.as_ref())?;
            let timestamp_millis = Utc::now().timestamp_millis();
            let meta = CommitMeta {
                author: format!("{} <{}>", author.name, author.email),
                timestamp_millis,
                summary: message.summary.clone(),
                detail: message.detail_text().to_string(),
                markup: match &message.detail {
                    Some(crate::commit_engine::commit::CommitDetail::Markdown(_)) => Markup::Markdown,
                    _ => Markup::Plain,
                },
            };

            match self.log.append(meta, root_hash, head, actual_changes) {
                Ok(revision) => {
                    tracing::debug!(revision, base = head, "pushed commit");
                    return Ok(PushResult { revision, timestamp_millis });
                }
                Err(DogmaError::ChangeConflict(_)) if !explicit => {
                    tracing::debug!(base = head, "push raced a concurrent commit, retrying");
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Server-side read-modify-write: reads the entry at `path`, applies
    /// `transform_fn`, and pushes the result as a single `UpsertJson`
    /// change. Retries once on conflict.
    pub async fn transform_json<F>(
        &self,
        path: &str,
        author: Author,
        message: CommitMessage,
        transform_fn: F,
    ) -> Result<PushResult, DogmaError>
    where
        F: Fn(i64, &serde_json::Value) -> Result<serde_json::Value, DogmaError>,
    {
        let mut attempts = 0;
        loop {
            let head = self.head();
            let current = self.get(head.max(1), path).ok();
            let current_value = current.as_ref().and_then(|e| e.as_json()).cloned().unwrap_or(serde_json::Value::Null);
            let new_value = transform_fn(head, &current_value)?;
            let changes = vec![Change::upsert_json(path, new_value)];
            match self
                .push(-1, author.clone(), message.clone(), changes)
                .await
            {
                Ok(r) => return Ok(r),
                Err(DogmaError::ChangeConflict(_)) if attempts == 0 => {
                    attempts += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn record_to_commit(record: &crate::revlog::CommitRecord) -> Commit {
    let (name, email) = split_author(&record.meta.author);
    let detail = if record.meta.detail.is_empty() {
        None
    } else {
        Some(match record.meta.markup {
            Markup::Markdown => crate::commit_engine::commit::CommitDetail::Markdown(record.meta.detail.clone()),
            Markup::Plain => crate::commit_engine::commit::CommitDetail::Plaintext(record.meta.detail.clone()),
        })
    };
    Commit {
        revision: record.revision,
        author: Author::new(name, email),
        commit_message: CommitMessage { summary: record.meta.summary.clone(), detail },
        changes: record.changes.clone(),
        timestamp_millis: record.meta.timestamp_millis,
    }
}

fn split_author(raw: &str) -> (String, String) {
    match raw.split_once(" <") {
        Some((name, rest)) => (name.to_string(), rest.trim_end_matches('>').to_string()),
        None => (raw.to_string(), String::new()),
    }
}
