//! Projects, repositories, members, and app identities as a single JSON
//! document. All mutations are read-modify-write transforms
//! against `/metadata.json` in the `dogma` repository of the internal
//! project, reusing the commit engine's atomicity — a conflicting
//! concurrent mutation surfaces as an ordinary `ChangeConflict`.

pub mod identity;
pub mod role;

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::commit_engine::commit::{Author, CommitMessage};
use crate::commit_engine::CommitEngine;
use crate::errors::DogmaError;
use crate::metadata::identity::{AppIdentity, IdentityState, Principal};
use crate::metadata::role::{self, PrincipalContext, ProjectRole, RepositoryRole, RepositoryRoles};
use crate::object_store::ObjectStore;
use crate::revlog::RevisionLog;
use crate::utils::is_valid_name;

pub const METADATA_PATH: &str = "/metadata.json";
pub const INTERNAL_DOGMA_REPO: &str = role::RESERVED_METADATA_REPO;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAndTimestamp {
    pub user: String,
    pub timestamp_millis: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepositoryStatus {
    Active,
    ReadOnly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteQuota {
    pub permits: u64,
    pub period_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryMetadata {
    pub name: String,
    pub created: UserAndTimestamp,
    pub status: RepositoryStatus,
    pub removed: Option<UserAndTimestamp>,
    pub roles: RepositoryRoles,
    pub quota: Option<WriteQuota>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectMetadata {
    pub name: String,
    pub created: UserAndTimestamp,
    pub removed: Option<UserAndTimestamp>,
    pub members: BTreeMap<String, ProjectRole>,
    pub app_identities: BTreeMap<String, ProjectRole>,
    pub repos: BTreeMap<String, RepositoryMetadata>,
}

impl ProjectMetadata {
    fn new(name: &str, author: &str) -> Self {
        ProjectMetadata {
            name: name.to_string(),
            created: UserAndTimestamp { user: author.to_string(), timestamp_millis: Utc::now().timestamp_millis() },
            removed: None,
            members: BTreeMap::new(),
            app_identities: BTreeMap::new(),
            repos: BTreeMap::new(),
        }
    }
}

/// Bumped whenever [`MetadataDocument`]'s shape changes; [`migrate`] brings
/// an older document up to this version on read.
pub const SCHEMA_VERSION: u32 = 1;

fn current_schema_version() -> u32 {
    SCHEMA_VERSION
}

/// The whole metadata document: every project, keyed by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataDocument {
    #[serde(default = "current_schema_version")]
    pub schema_version: u32,
    pub projects: BTreeMap<String, ProjectMetadata>,
    pub app_identities: BTreeMap<String, AppIdentity>,
}

impl Default for MetadataDocument {
    fn default() -> Self {
        Self { schema_version: SCHEMA_VERSION, projects: BTreeMap::new(), app_identities: BTreeMap::new() }
    }
}

/// Normalizes a document read from storage to [`SCHEMA_VERSION`]. A
/// document with no `schema_version` field predates this constant
/// (version 0); each branch below is where a future version bump would
/// add its own one-time transform before stamping the document current.
fn migrate(raw: serde_json::Value) -> Result<MetadataDocument, DogmaError> {
    let version = raw.get("schema_version").and_then(|v| v.as_u64()).unwrap_or(0);
    let mut doc: MetadataDocument = serde_json::from_value(raw).map_err(|e| DogmaError::Codec(e.to_string()))?;
    if version < 1 {
        // version 0 -> 1: schema_version introduced, no field changes.
    }
    doc.schema_version = SCHEMA_VERSION;
    Ok(doc)
}

/// Wraps a [`CommitEngine`] pointed at the internal project's `dogma`
/// repository, exposing every metadata mutation named in §4.6 as a single
/// atomic transform.
pub struct MetadataStore<S: ObjectStore, L: RevisionLog> {
    engine: CommitEngine<S, L>,
}

impl<S: ObjectStore, L: RevisionLog> MetadataStore<S, L> {
    pub fn new(engine: CommitEngine<S, L>) -> Self {
        Self { engine }
    }

    pub fn read(&self) -> Result<MetadataDocument, DogmaError> {
        let head = self.engine.head();
        if head == 0 {
            return Ok(MetadataDocument::default());
        }
        let entry = self.engine.get(-1, METADATA_PATH)?;
        let value = entry.as_json().ok_or_else(|| DogmaError::Codec("metadata.json is not JSON".into()))?;
        migrate(value.clone())
    }

    async fn mutate(&self, author: &str, summary: &str, f: impl Fn(&mut MetadataDocument) -> Result<(), DogmaError>) -> Result<i64, DogmaError> {
        let mut doc = self.read()?;
        f(&mut doc)?;
        let value = serde_json::to_value(&doc).map_err(|e| DogmaError::Codec(e.to_string()))?;
        let result = self
            .engine
            .push(
                -1,
                Author::new(author, format!("{author}@internal")),
                CommitMessage::summary_only(summary),
                vec![crate::commit_engine::change::Change::upsert_json(METADATA_PATH, value)],
            )
            .await;
        match result {
            Ok(r) => Ok(r.revision),
            Err(DogmaError::RedundantChange) => Ok(self.engine.head()),
            Err(e) => Err(e),
        }
    }

    /// Whether `principal` is a registered, active, system-admin app
    /// identity. `Principal::User` can never be a system admin — only a
    /// machine identity carries that flag (§4.2) — and an identity that
    /// isn't `ACTIVE` never counts, matching [`AppIdentity::is_usable`].
    pub fn is_system_admin(&self, principal: &Principal) -> Result<bool, DogmaError> {
        Ok(is_system_admin_in(&self.read()?, principal))
    }

    /// `principal`'s role on `project`, or `None` if it holds no
    /// membership (or the project doesn't exist).
    pub fn project_role_of(&self, principal: &Principal, project: &str) -> Result<Option<ProjectRole>, DogmaError> {
        Ok(project_role_in(&self.read()?, project, principal))
    }

    /// Runs the role-resolution algorithm (`role::resolve_repository_role`)
    /// for `principal` against `project`/`repo`'s current role map. A repo
    /// that doesn't exist yet resolves against an empty role map, so a
    /// system admin or project owner is still recognized as such ahead of
    /// whatever `RepositoryNotFound` the actual mutation would raise.
    pub fn effective_repository_role(
        &self,
        principal: &Principal,
        project: &str,
        repo: &str,
    ) -> Result<Option<RepositoryRole>, DogmaError> {
        let doc = self.read()?;
        let is_guest_app_identity = match principal {
            Principal::AppIdentity(id) => doc.app_identities.get(id).map(|a| a.allows_guest_access()).unwrap_or(false),
            Principal::User(_) => false,
        };
        let ctx = PrincipalContext {
            id: principal.id(),
            is_system_admin: is_system_admin_in(&doc, principal),
            project_role: project_role_in(&doc, project, principal),
            is_app_identity_with_guest_access: is_guest_app_identity,
        };
        let roles = doc
            .projects
            .get(project)
            .and_then(|p| p.repos.get(repo))
            .map(|r| r.roles.clone())
            .unwrap_or_default();
        Ok(role::resolve_repository_role(&ctx, repo, &roles))
    }

    pub async fn add_project(&self, author: &str, name: &str) -> Result<i64, DogmaError> {
        if !is_valid_name(name) {
            return Err(DogmaError::InvalidName(name.to_string()));
        }
        let author = author.to_string();
        let name = name.to_string();
        self.mutate(&author, &format!("Add project {name}"), move |doc| {
            if doc.projects.contains_key(&name) {
                return Err(DogmaError::ProjectExists(name.clone()));
            }
            let mut project = ProjectMetadata::new(&name, &author);
            project.members.insert(author.clone(), ProjectRole::Owner);
            doc.projects.insert(name.clone(), project);
            Ok(())
        })
        .await
    }

    pub async fn remove_project(&self, author: &str, name: &str) -> Result<i64, DogmaError> {
        let name = name.to_string();
        self.mutate(author, &format!("Remove project {name}"), move |doc| {
            let project = doc
                .projects
                .get_mut(&name)
                .ok_or_else(|| DogmaError::ProjectNotFound(name.clone()))?;
            project.removed = Some(UserAndTimestamp { user: "system".into(), timestamp_millis: 0 });
            Ok(())
        })
        .await
    }

    pub async fn restore_project(&self, author: &str, name: &str) -> Result<i64, DogmaError> {
        let name = name.to_string();
        self.mutate(author, &format!("Restore project {name}"), move |doc| {
            let project = doc
                .projects
                .get_mut(&name)
                .ok_or_else(|| DogmaError::ProjectNotFound(name.clone()))?;
            project.removed = None;
            Ok(())
        })
        .await
    }

    pub async fn purge_project(&self, author: &str, name: &str) -> Result<i64, DogmaError> {
        let name = name.to_string();
        self.mutate(author, &format!("Purge project {name}"), move |doc| {
            if doc.projects.remove(&name).is_none() {
                return Err(DogmaError::ProjectNotFound(name.clone()));
            }
            Ok(())
        })
        .await
    }

    pub async fn add_member(&self, author: &str, project: &str, user: &str, role: ProjectRole) -> Result<i64, DogmaError> {
        let (project, user) = (project.to_string(), user.to_string());
        self.mutate(author, &format!("Add member {user} to {project}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            p.members.insert(user.clone(), role);
            Ok(())
        })
        .await
    }

    pub async fn remove_member(&self, author: &str, project: &str, user: &str) -> Result<i64, DogmaError> {
        let (project, user) = (project.to_string(), user.to_string());
        self.mutate(author, &format!("Remove member {user} from {project}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            p.members.remove(&user);
            for repo in p.repos.values_mut() {
                repo.roles.users.remove(&user);
            }
            Ok(())
        })
        .await
    }

    /// Grants `app_id` membership of `project` at `role`, the app-identity
    /// counterpart of [`Self::add_member`]. A repository role cannot be
    /// granted to an app identity until it holds project membership here.
    pub async fn add_project_app_identity(&self, author: &str, project: &str, app_id: &str, role: ProjectRole) -> Result<i64, DogmaError> {
        let (project, app_id) = (project.to_string(), app_id.to_string());
        self.mutate(author, &format!("Add app identity {app_id} to {project}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            p.app_identities.insert(app_id.clone(), role);
            Ok(())
        })
        .await
    }

    pub async fn remove_project_app_identity(&self, author: &str, project: &str, app_id: &str) -> Result<i64, DogmaError> {
        let (project, app_id) = (project.to_string(), app_id.to_string());
        self.mutate(author, &format!("Remove app identity {app_id} from {project}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            p.app_identities.remove(&app_id);
            for repo in p.repos.values_mut() {
                repo.roles.app_ids.remove(&app_id);
            }
            Ok(())
        })
        .await
    }

    pub async fn add_repo(&self, author: &str, project: &str, repo: &str) -> Result<i64, DogmaError> {
        if !is_valid_name(repo) {
            return Err(DogmaError::InvalidName(repo.to_string()));
        }
        let (project, repo, author_s) = (project.to_string(), repo.to_string(), author.to_string());
        self.mutate(author, &format!("Add repository {project}/{repo}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            if p.repos.contains_key(&repo) {
                return Err(DogmaError::RepositoryExists { project: project.clone(), repo: repo.clone() });
            }
            p.repos.insert(
                repo.clone(),
                RepositoryMetadata {
                    name: repo.clone(),
                    created: UserAndTimestamp { user: author_s.clone(), timestamp_millis: Utc::now().timestamp_millis() },
                    status: RepositoryStatus::Active,
                    removed: None,
                    roles: RepositoryRoles::default(),
                    quota: None,
                },
            );
            Ok(())
        })
        .await
    }

    pub async fn remove_repo(&self, author: &str, project: &str, repo: &str) -> Result<i64, DogmaError> {
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Remove repository {project}/{repo}"), move |doc| {
            let r = repo_mut(doc, &project, &repo)?;
            r.removed = Some(UserAndTimestamp { user: "system".into(), timestamp_millis: 0 });
            Ok(())
        })
        .await
    }

    pub async fn restore_repo(&self, author: &str, project: &str, repo: &str) -> Result<i64, DogmaError> {
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Restore repository {project}/{repo}"), move |doc| {
            let r = repo_mut(doc, &project, &repo)?;
            r.removed = None;
            Ok(())
        })
        .await
    }

    pub async fn purge_repo(&self, author: &str, project: &str, repo: &str) -> Result<i64, DogmaError> {
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Purge repository {project}/{repo}"), move |doc| {
            let p = doc
                .projects
                .get_mut(&project)
                .ok_or_else(|| DogmaError::ProjectNotFound(project.clone()))?;
            if p.repos.remove(&repo).is_none() {
                return Err(DogmaError::RepositoryNotFound { project: project.clone(), repo: repo.clone() });
            }
            Ok(())
        })
        .await
    }

    /// `READ_ONLY` disables non-forced writes; enforced by the command
    /// executor's read-only gate, not here.
    pub async fn update_repository_status(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        status: RepositoryStatus,
    ) -> Result<i64, DogmaError> {
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Set {project}/{repo} status"), move |doc| {
            repo_mut(doc, &project, &repo)?.status = status.clone();
            Ok(())
        })
        .await
    }

    pub async fn set_repository_quota(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        quota: Option<WriteQuota>,
    ) -> Result<i64, DogmaError> {
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Set quota for {project}/{repo}"), move |doc| {
            repo_mut(doc, &project, &repo)?.quota = quota.clone();
            Ok(())
        })
        .await
    }

    /// Rejects granting `WRITE` to guests (`GUEST` may not hold `WRITE`)
    /// and rejects any attempt to touch the reserved `dogma` repository.
    pub async fn update_repository_project_roles(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        member_role: Option<RepositoryRole>,
        guest_role: Option<RepositoryRole>,
    ) -> Result<i64, DogmaError> {
        if repo == INTERNAL_DOGMA_REPO {
            return Err(DogmaError::InvalidPush(format!("{INTERNAL_DOGMA_REPO} is not reachable through project roles")));
        }
        if matches!(guest_role, Some(RepositoryRole::Write) | Some(RepositoryRole::Admin)) {
            return Err(DogmaError::InvalidPush("guests may not hold WRITE or ADMIN".into()));
        }
        let (project, repo) = (project.to_string(), repo.to_string());
        self.mutate(author, &format!("Update roles for {project}/{repo}"), move |doc| {
            let r = repo_mut(doc, &project, &repo)?;
            r.roles.project_member_role = member_role;
            r.roles.project_guest_role = guest_role;
            Ok(())
        })
        .await
    }

    pub async fn add_user_repository_role(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        user: &str,
        granted_role: RepositoryRole,
    ) -> Result<i64, DogmaError> {
        let (project_s, repo_s, user_s) = (project.to_string(), repo.to_string(), user.to_string());
        let project_member_check = project.to_string();
        let user_member_check = user.to_string();
        self.mutate(author, &format!("Grant {user} {granted_role:?} on {project_s}/{repo_s}"), move |doc| {
            let is_member = doc
                .projects
                .get(&project_member_check)
                .map(|p| p.members.contains_key(&user_member_check))
                .unwrap_or(false);
            if !is_member {
                return Err(DogmaError::InvalidPush(format!(
                    "{user_member_check} must be a project member before a repository role can be granted"
                )));
            }
            repo_mut(doc, &project_s, &repo_s)?.roles.users.insert(user_s.clone(), granted_role);
            Ok(())
        })
        .await
    }

    pub async fn remove_user_repository_role(&self, author: &str, project: &str, repo: &str, user: &str) -> Result<i64, DogmaError> {
        let (project, repo, user) = (project.to_string(), repo.to_string(), user.to_string());
        self.mutate(author, &format!("Revoke {user}'s role on {project}/{repo}"), move |doc| {
            repo_mut(doc, &project, &repo)?.roles.users.remove(&user);
            Ok(())
        })
        .await
    }

    pub async fn create_token(&self, author: &str, app_id: &str, secret: String, is_system_admin: bool) -> Result<i64, DogmaError> {
        let app_id = app_id.to_string();
        self.mutate(author, &format!("Create token identity {app_id}"), move |doc| {
            if doc.app_identities.contains_key(&app_id) {
                return Err(DogmaError::InvalidPush(format!("app identity already exists: {app_id}")));
            }
            doc.app_identities.insert(
                app_id.clone(),
                AppIdentity::TokenIdentity {
                    app_id: app_id.clone(),
                    secret: secret.clone(),
                    is_system_admin,
                    state: IdentityState::Active,
                    allow_guest_access: false,
                },
            );
            Ok(())
        })
        .await
    }

    pub async fn create_certificate(
        &self,
        author: &str,
        app_id: &str,
        certificate_id: String,
        is_system_admin: bool,
    ) -> Result<i64, DogmaError> {
        let app_id = app_id.to_string();
        self.mutate(author, &format!("Create certificate identity {app_id}"), move |doc| {
            if doc.app_identities.contains_key(&app_id) {
                return Err(DogmaError::InvalidPush(format!("app identity already exists: {app_id}")));
            }
            doc.app_identities.insert(
                app_id.clone(),
                AppIdentity::CertificateIdentity {
                    app_id: app_id.clone(),
                    certificate_id: certificate_id.clone(),
                    is_system_admin,
                    state: IdentityState::Active,
                    allow_guest_access: false,
                },
            );
            Ok(())
        })
        .await
    }

    /// Grants (or replaces) `app_id`'s role on `project`/`repo`, mirroring
    /// [`Self::add_user_repository_role`]'s membership precondition: an app
    /// identity must already be a project-level app identity before it can
    /// hold a repository role.
    pub async fn add_app_identity_repository_role(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        app_id: &str,
        granted_role: RepositoryRole,
    ) -> Result<i64, DogmaError> {
        let (project_s, repo_s, app_id_s) = (project.to_string(), repo.to_string(), app_id.to_string());
        let project_member_check = project.to_string();
        let app_id_member_check = app_id.to_string();
        self.mutate(author, &format!("Grant {app_id} {granted_role:?} on {project_s}/{repo_s}"), move |doc| {
            let is_member = doc
                .projects
                .get(&project_member_check)
                .map(|p| p.app_identities.contains_key(&app_id_member_check))
                .unwrap_or(false);
            if !is_member {
                return Err(DogmaError::InvalidPush(format!(
                    "{app_id_member_check} must be a project app identity before a repository role can be granted"
                )));
            }
            repo_mut(doc, &project_s, &repo_s)?.roles.app_ids.insert(app_id_s.clone(), granted_role);
            Ok(())
        })
        .await
    }

    pub async fn update_app_identity_repository_role(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        app_id: &str,
        granted_role: RepositoryRole,
    ) -> Result<i64, DogmaError> {
        self.add_app_identity_repository_role(author, project, repo, app_id, granted_role).await
    }

    pub async fn remove_app_identity_repository_role(
        &self,
        author: &str,
        project: &str,
        repo: &str,
        app_id: &str,
    ) -> Result<i64, DogmaError> {
        let (project, repo, app_id) = (project.to_string(), repo.to_string(), app_id.to_string());
        self.mutate(author, &format!("Revoke {app_id}'s role on {project}/{repo}"), move |doc| {
            repo_mut(doc, &project, &repo)?.roles.app_ids.remove(&app_id);
            Ok(())
        })
        .await
    }

    pub async fn deactivate_identity(&self, author: &str, app_id: &str) -> Result<i64, DogmaError> {
        self.set_identity_state(author, app_id, IdentityState::Inactive).await
    }

    pub async fn activate_identity(&self, author: &str, app_id: &str) -> Result<i64, DogmaError> {
        self.set_identity_state(author, app_id, IdentityState::Active).await
    }

    /// Soft-delete: flips the identity to `DELETING`, awaiting
    /// `purge_app_identity`.
    pub async fn destroy_identity(&self, author: &str, app_id: &str) -> Result<i64, DogmaError> {
        self.set_identity_state(author, app_id, IdentityState::Deleting).await
    }

    async fn set_identity_state(&self, author: &str, app_id: &str, state: IdentityState) -> Result<i64, DogmaError> {
        let app_id = app_id.to_string();
        self.mutate(author, &format!("Set {app_id} state to {state:?}"), move |doc| {
            let identity = doc
                .app_identities
                .get_mut(&app_id)
                .ok_or_else(|| DogmaError::EntryNotFound(format!("app identity {app_id}")))?;
            replace_state(identity, state);
            Ok(())
        })
        .await
    }

    /// Removes `app_id` from every project's repository role maps, then
    /// from the global registry.
    pub async fn purge_app_identity(&self, author: &str, app_id: &str) -> Result<i64, DogmaError> {
        let app_id = app_id.to_string();
        self.mutate(author, &format!("Purge app identity {app_id}"), move |doc| {
            for project in doc.projects.values_mut() {
                project.app_identities.remove(&app_id);
                for repo in project.repos.values_mut() {
                    repo.roles.app_ids.remove(&app_id);
                }
            }
            doc.app_identities.remove(&app_id);
            Ok(())
        })
        .await
    }
}

fn is_system_admin_in(doc: &MetadataDocument, principal: &Principal) -> bool {
    match principal {
        Principal::AppIdentity(id) => doc.app_identities.get(id).map(|a| a.is_usable() && a.is_system_admin()).unwrap_or(false),
        Principal::User(_) => false,
    }
}

fn project_role_in(doc: &MetadataDocument, project: &str, principal: &Principal) -> Option<ProjectRole> {
    let p = doc.projects.get(project)?;
    match principal {
        Principal::User(id) => p.members.get(id).copied(),
        Principal::AppIdentity(id) => p.app_identities.get(id).copied(),
    }
}

fn repo_mut<'a>(doc: &'a mut MetadataDocument, project: &str, repo: &str) -> Result<&'a mut RepositoryMetadata, DogmaError> {
    let p = doc
        .projects
        .get_mut(project)
        .ok_or_else(|| DogmaError::ProjectNotFound(project.to_string()))?;
    p.repos
        .get_mut(repo)
        .ok_or_else(|| DogmaError::RepositoryNotFound { project: project.to_string(), repo: repo.to_string() })
}

fn replace_state(identity: &mut AppIdentity, state: IdentityState) {
    match identity {
        AppIdentity::TokenIdentity { state: s, .. } => *s = state,
        AppIdentity::CertificateIdentity { state: s, .. } => *s = state,
    }
}
