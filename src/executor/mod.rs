//! The replicated command executor: totals the order of write
//! commands, gates them on server status and per-repository quota, and
//! hands accepted commands to the commit engine / metadata layer.
//!
//! Two implementations share the [`CommandExecutor`] trait: a
//! [`standalone::StandaloneExecutor`] that applies commands in acceptance
//! order on a single node, and a [`replicated::ReplicatedExecutor`] that
//! simulates a single-leader quorum log over N in-process replicas. Reads
//! never go through the executor — they hit the commit engine directly.

pub mod quota;
pub mod replicated;
pub mod standalone;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::commit_engine::change::Change;
use crate::commit_engine::commit::{Author, CommitMessage};
use crate::commit_engine::CommitEngine;
use crate::errors::DogmaError;
use crate::metadata::identity::Principal;
use crate::metadata::role::{ProjectRole, RepositoryRole};
use crate::metadata::{RepositoryStatus, WriteQuota};
use crate::object_store::ObjectStore;
use crate::revlog::RevisionLog;
use crate::watch::RevisionNotifier;

/// A single JSON-transform applied by a `Transform` command. Carried as an
/// `Arc` (rather than a plain `Fn` generic) so `Command` stays a concrete,
/// cloneable value the replicated executor can fan out to every replica.
pub type TransformFn =
    Arc<dyn Fn(i64, &serde_json::Value) -> Result<serde_json::Value, DogmaError> + Send + Sync>;

#[derive(Clone)]
pub enum Command {
    CreateProject { author: String, name: String },
    RemoveProject { author: String, name: String },
    UnremoveProject { author: String, name: String },
    PurgeProject { author: String, name: String },

    CreateRepository { author: String, project: String, name: String },
    RemoveRepository { author: String, project: String, name: String },
    UnremoveRepository { author: String, project: String, name: String },
    PurgeRepository { author: String, project: String, name: String },

    Push {
        project: String,
        repo: String,
        author: Author,
        base_rev: i64,
        message: CommitMessage,
        changes: Vec<Change>,
    },
    /// Same as `Push`, but bypasses the read-only gate. Never bypasses
    /// quota, role, or conflict checks.
    ForcePush {
        project: String,
        repo: String,
        author: Author,
        base_rev: i64,
        message: CommitMessage,
        changes: Vec<Change>,
    },
    Transform {
        project: String,
        repo: String,
        author: Author,
        path: String,
        message: CommitMessage,
        transform: TransformFn,
    },

    UpdateServerStatus { status: ServerStatus },
    Metadata(MetadataCommand),
}

impl Command {
    /// Stable, loggable name for this command's variant, independent of its
    /// payload — so a log line never accidentally includes an author name
    /// or commit message.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateProject { .. } => "create_project",
            Command::RemoveProject { .. } => "remove_project",
            Command::UnremoveProject { .. } => "unremove_project",
            Command::PurgeProject { .. } => "purge_project",
            Command::CreateRepository { .. } => "create_repository",
            Command::RemoveRepository { .. } => "remove_repository",
            Command::UnremoveRepository { .. } => "unremove_repository",
            Command::PurgeRepository { .. } => "purge_repository",
            Command::Push { .. } => "push",
            Command::ForcePush { .. } => "force_push",
            Command::Transform { .. } => "transform",
            Command::UpdateServerStatus { .. } => "update_server_status",
            Command::Metadata(_) => "metadata",
        }
    }
}

/// Every metadata mutation in the catalogue, always executed as a single
/// `Transform` against `/metadata.json` of the internal `dogma` repository
/// (see [`crate::metadata::MetadataStore`]).
#[derive(Debug, Clone)]
pub enum MetadataCommand {
    AddProject { author: String, name: String },
    RemoveProject { author: String, name: String },
    RestoreProject { author: String, name: String },
    PurgeProject { author: String, name: String },
    AddMember { author: String, project: String, user: String, role: ProjectRole },
    RemoveMember { author: String, project: String, user: String },
    AddRepo { author: String, project: String, name: String },
    RemoveRepo { author: String, project: String, name: String },
    RestoreRepo { author: String, project: String, name: String },
    PurgeRepo { author: String, project: String, name: String },
    UpdateRepositoryStatus { author: String, project: String, repo: String, status: RepositoryStatus },
    UpdateRepositoryProjectRoles {
        author: String,
        project: String,
        repo: String,
        member_role: Option<RepositoryRole>,
        guest_role: Option<RepositoryRole>,
    },
    AddUserRepositoryRole { author: String, project: String, repo: String, user: String, role: RepositoryRole },
    RemoveUserRepositoryRole { author: String, project: String, repo: String, user: String },
    AddProjectAppIdentity { author: String, project: String, app_id: String, role: ProjectRole },
    RemoveProjectAppIdentity { author: String, project: String, app_id: String },
    AddAppIdentityRepositoryRole { author: String, project: String, repo: String, app_id: String, role: RepositoryRole },
    UpdateAppIdentityRepositoryRole { author: String, project: String, repo: String, app_id: String, role: RepositoryRole },
    RemoveAppIdentityRepositoryRole { author: String, project: String, repo: String, app_id: String },
    SetRepositoryQuota { author: String, project: String, repo: String, quota: Option<WriteQuota> },
    CreateToken { author: String, app_id: String, secret: String, is_system_admin: bool },
    CreateCertificate { author: String, app_id: String, certificate_id: String, is_system_admin: bool },
    ActivateIdentity { author: String, app_id: String },
    DeactivateIdentity { author: String, app_id: String },
    DestroyIdentity { author: String, app_id: String },
    PurgeAppIdentity { author: String, app_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Writable,
    ReplicationOnly,
}

/// Lock-free snapshot of the server's read-only gate, mutated only through
/// `UpdateServerStatus`.
#[derive(Default)]
pub struct ServerStatusGate {
    replication_only: AtomicBool,
}

impl ServerStatusGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> ServerStatus {
        if self.replication_only.load(Ordering::Acquire) {
            ServerStatus::ReplicationOnly
        } else {
            ServerStatus::Writable
        }
    }

    pub fn set(&self, status: ServerStatus) {
        self.replication_only.store(status == ServerStatus::ReplicationOnly, Ordering::Release);
    }

    /// `ForcePush` and the status transition itself bypass this gate;
    /// everything else fails with `ReadOnly` while replication-only.
    pub fn check_writable(&self, force: bool) -> Result<(), DogmaError> {
        if force || self.get() == ServerStatus::Writable {
            Ok(())
        } else {
            Err(DogmaError::ReadOnly)
        }
    }
}

#[derive(Debug, Clone)]
pub enum CommandOutcome {
    Revision(i64),
    Unit,
}

impl CommandOutcome {
    pub fn revision(&self) -> Option<i64> {
        match self {
            CommandOutcome::Revision(r) => Some(*r),
            CommandOutcome::Unit => None,
        }
    }
}

#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// `principal` is who is asking, resolved by the caller's transport
    /// from a [`crate::metadata::identity::Credential`] via
    /// [`crate::metadata::identity::PrincipalResolver`]; every implementor
    /// must check it against the command's required role before applying
    /// anything, returning [`DogmaError::Authorization`] on denial.
    async fn submit(&self, command: Command, principal: &Principal) -> Result<CommandOutcome, DogmaError>;
}

/// Provisions the physical object store + revision log backing a newly
/// created repository. An external collaborator boundary, same treatment
/// as `PrincipalResolver`/`MirrorIo`: this crate does not know whether
/// that means a fresh directory on disk, a fresh in-memory pair for
/// tests, or a namespaced bucket.
pub trait RepositoryProvisioner<S: ObjectStore, L: RevisionLog>: Send + Sync {
    fn provision(&self, project: &str, repo: &str) -> Result<(Arc<S>, Arc<L>), DogmaError>;
}

/// The live set of repository commit engines, keyed by `(project, repo)`,
/// plus one [`RevisionNotifier`] per repository for the watch layer. One
/// `tokio::sync::Mutex`-serialized engine per repository, held in a
/// `DashMap` — the same `(project, repo)`-keyed dual-store shape the
/// teacher uses for its pack waitlist.
pub struct Repositories<S: ObjectStore, L: RevisionLog> {
    engines: DashMap<(String, String), Arc<CommitEngine<S, L>>>,
    notifiers: DashMap<(String, String), Arc<RevisionNotifier>>,
    provisioner: Box<dyn RepositoryProvisioner<S, L>>,
}

impl<S: ObjectStore, L: RevisionLog> Repositories<S, L> {
    pub fn new(provisioner: Box<dyn RepositoryProvisioner<S, L>>) -> Self {
        Self {
            engines: DashMap::new(),
            notifiers: DashMap::new(),
            provisioner,
        }
    }

    pub fn get(&self, project: &str, repo: &str) -> Result<Arc<CommitEngine<S, L>>, DogmaError> {
        self.engines
            .get(&(project.to_string(), repo.to_string()))
            .map(|e| Arc::clone(&e))
            .ok_or_else(|| DogmaError::RepositoryNotFound { project: project.to_string(), repo: repo.to_string() })
    }

    pub fn notifier_for(&self, project: &str, repo: &str) -> Arc<RevisionNotifier> {
        Arc::clone(
            self.notifiers
                .entry((project.to_string(), repo.to_string()))
                .or_insert_with(|| Arc::new(RevisionNotifier::new())),
        )
    }

    /// Idempotent: a second call for an already-provisioned repository
    /// returns the existing engine rather than re-provisioning.
    pub fn provision(&self, project: &str, repo: &str) -> Result<Arc<CommitEngine<S, L>>, DogmaError> {
        let key = (project.to_string(), repo.to_string());
        if let Some(existing) = self.engines.get(&key) {
            return Ok(Arc::clone(&existing));
        }
        let (store, log) = self.provisioner.provision(project, repo)?;
        let engine = Arc::new(CommitEngine::new(store, log));
        self.engines.insert(key.clone(), Arc::clone(&engine));
        self.notifiers.entry(key).or_insert_with(|| Arc::new(RevisionNotifier::new()));
        Ok(engine)
    }

    /// Hard delete from the registry. Physical storage reclamation is the
    /// provisioner's concern, not this registry's.
    pub fn purge(&self, project: &str, repo: &str) {
        let key = (project.to_string(), repo.to_string());
        self.engines.remove(&key);
        self.notifiers.remove(&key);
    }

    /// Drops every repository belonging to `project` from the registry,
    /// used when a project is purged.
    pub fn purge_project(&self, project: &str) {
        let victims: Vec<(String, String)> =
            self.engines.iter().map(|e| e.key().clone()).filter(|(p, _)| p == project).collect();
        for key in victims {
            self.engines.remove(&key);
            self.notifiers.remove(&key);
        }
    }

    pub fn heads(&self) -> BTreeMap<(String, String), i64> {
        self.engines.iter().map(|e| (e.key().clone(), e.value().head())).collect()
    }
}
