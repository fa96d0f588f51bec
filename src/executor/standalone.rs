//! Single-node command executor: applies each submitted command in
//! acceptance order directly against local state. No replication, no
//! majority ack — the trivial case of [`super::CommandExecutor`].

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::commit_engine::change::Change;
use crate::commit_engine::commit::{Author, CommitMessage};
use crate::commit_engine::CommitEngine;
use crate::errors::DogmaError;
use crate::executor::quota::QuotaGate;
use crate::executor::{Command, CommandExecutor, CommandOutcome, MetadataCommand, Repositories, ServerStatus, ServerStatusGate};
use crate::metadata::identity::Principal;
use crate::metadata::role::{ProjectRole, RepositoryRole};
use crate::metadata::MetadataStore;
use crate::object_store::ObjectStore;
use crate::revlog::RevisionLog;

/// What a command needs of the submitting principal, per the
/// authorization-required command vocabulary (§6).
enum Requirement {
    SystemAdmin,
    ProjectOwner(String),
    Repository { project: String, repo: String, min: RepositoryRole },
}

/// Classifies a [`Command`] by the role its submitter must hold.
fn requirement(command: &Command) -> Requirement {
    match command {
        Command::CreateProject { .. }
        | Command::RemoveProject { .. }
        | Command::UnremoveProject { .. }
        | Command::PurgeProject { .. }
        | Command::UpdateServerStatus { .. } => Requirement::SystemAdmin,

        Command::CreateRepository { project, .. }
        | Command::RemoveRepository { project, .. }
        | Command::UnremoveRepository { project, .. }
        | Command::PurgeRepository { project, .. } => Requirement::ProjectOwner(project.clone()),

        Command::Push { project, repo, .. } | Command::ForcePush { project, repo, .. } | Command::Transform { project, repo, .. } => {
            Requirement::Repository { project: project.clone(), repo: repo.clone(), min: RepositoryRole::Write }
        }

        Command::Metadata(cmd) => metadata_command_requirement(cmd),
    }
}

/// Classifies a [`MetadataCommand`] by the role its submitter must hold.
/// Global identity-registry operations (`CreateToken`/`CreateCertificate`
/// and the activate/deactivate/destroy/purge lifecycle) are system-admin
/// gated even though §6's table doesn't name them explicitly, since they
/// mint or revoke the very credentials that can themselves carry
/// `isSystemAdmin`.
fn metadata_command_requirement(cmd: &MetadataCommand) -> Requirement {
    match cmd {
        MetadataCommand::AddProject { .. }
        | MetadataCommand::RemoveProject { .. }
        | MetadataCommand::RestoreProject { .. }
        | MetadataCommand::PurgeProject { .. }
        | MetadataCommand::CreateToken { .. }
        | MetadataCommand::CreateCertificate { .. }
        | MetadataCommand::ActivateIdentity { .. }
        | MetadataCommand::DeactivateIdentity { .. }
        | MetadataCommand::DestroyIdentity { .. }
        | MetadataCommand::PurgeAppIdentity { .. } => Requirement::SystemAdmin,

        MetadataCommand::AddMember { project, .. }
        | MetadataCommand::RemoveMember { project, .. }
        | MetadataCommand::AddProjectAppIdentity { project, .. }
        | MetadataCommand::RemoveProjectAppIdentity { project, .. }
        | MetadataCommand::AddRepo { project, .. }
        | MetadataCommand::RemoveRepo { project, .. }
        | MetadataCommand::RestoreRepo { project, .. }
        | MetadataCommand::PurgeRepo { project, .. } => Requirement::ProjectOwner(project.clone()),

        MetadataCommand::UpdateRepositoryStatus { project, repo, .. }
        | MetadataCommand::UpdateRepositoryProjectRoles { project, repo, .. }
        | MetadataCommand::AddUserRepositoryRole { project, repo, .. }
        | MetadataCommand::RemoveUserRepositoryRole { project, repo, .. }
        | MetadataCommand::AddAppIdentityRepositoryRole { project, repo, .. }
        | MetadataCommand::UpdateAppIdentityRepositoryRole { project, repo, .. }
        | MetadataCommand::RemoveAppIdentityRepositoryRole { project, repo, .. }
        | MetadataCommand::SetRepositoryQuota { project, repo, .. } => {
            Requirement::Repository { project: project.clone(), repo: repo.clone(), min: RepositoryRole::Admin }
        }
    }
}

/// The path an automatic "create a new repository" commit writes, so
/// revision 1 of every repository carries real content rather than an
/// empty tree, mirroring the "commit 1 is an automatic create commit"
/// lifecycle rule.
const REPOSITORY_MARKER_PATH: &str = "/.dogma/repository.json";

pub struct StandaloneExecutor<S: ObjectStore, L: RevisionLog> {
    repositories: Repositories<S, L>,
    metadata: MetadataStore<S, L>,
    quota: QuotaGate,
    status: ServerStatusGate,
}

impl<S: ObjectStore, L: RevisionLog> StandaloneExecutor<S, L> {
    pub fn new(repositories: Repositories<S, L>, metadata_engine: CommitEngine<S, L>) -> Self {
        Self {
            repositories,
            metadata: MetadataStore::new(metadata_engine),
            quota: QuotaGate::new(),
            status: ServerStatusGate::new(),
        }
    }

    pub fn repositories(&self) -> &Repositories<S, L> {
        &self.repositories
    }

    pub fn metadata(&self) -> &MetadataStore<S, L> {
        &self.metadata
    }

    pub fn status(&self) -> &ServerStatusGate {
        &self.status
    }

    fn check_quota(&self, project: &str, repo: &str) -> Result<(), DogmaError> {
        self.quota.check(project, repo)
    }

    /// Refreshes the quota gate's bucket for `project/repo` from whatever
    /// metadata currently says, after any mutation that might have
    /// changed it.
    async fn resync_quota(&self, project: &str, repo: &str) -> Result<(), DogmaError> {
        let doc = self.metadata.read()?;
        let quota = doc.projects.get(project).and_then(|p| p.repos.get(repo)).and_then(|r| r.quota.as_ref());
        self.quota.configure(project, repo, quota);
        Ok(())
    }

    /// A metadata document with no app identities registered yet has no
    /// possible way to hold a system-admin credential, since only an app
    /// identity can carry `isSystemAdmin` — so the very first system-admin
    /// gated command (typically the first `CreateToken`) is let through
    /// unconditionally. Registering any app identity, admin or not, closes
    /// this window for good.
    fn bootstrap_open(&self) -> Result<bool, DogmaError> {
        Ok(self.metadata.read()?.app_identities.is_empty())
    }

    async fn authorize(&self, command: &Command, principal: &Principal) -> Result<(), DogmaError> {
        match requirement(command) {
            Requirement::SystemAdmin => {
                if self.metadata.is_system_admin(principal)? || self.bootstrap_open()? {
                    Ok(())
                } else {
                    Err(DogmaError::Authorization { needed: RepositoryRole::Admin, actual: None })
                }
            }
            Requirement::ProjectOwner(project) => {
                if self.metadata.is_system_admin(principal)?
                    || self.metadata.project_role_of(principal, &project)? == Some(ProjectRole::Owner)
                {
                    Ok(())
                } else {
                    Err(DogmaError::Authorization { needed: RepositoryRole::Admin, actual: None })
                }
            }
            Requirement::Repository { project, repo, min } => {
                let actual = self.metadata.effective_repository_role(principal, &project, &repo)?;
                if actual.map(|role| role >= min).unwrap_or(false) {
                    Ok(())
                } else {
                    Err(DogmaError::Authorization { needed: min, actual })
                }
            }
        }
    }
}

#[async_trait]
impl<S: ObjectStore, L: RevisionLog> CommandExecutor for StandaloneExecutor<S, L> {
    async fn submit(&self, command: Command, principal: &Principal) -> Result<CommandOutcome, DogmaError> {
        tracing::debug!(command = command.kind(), "dispatching command");
        self.authorize(&command, principal).await?;
        match command {
            Command::UpdateServerStatus { status } => {
                self.status.set(status);
                Ok(CommandOutcome::Unit)
            }

            Command::CreateProject { author, name } => {
                let rev = self.metadata.add_project(&author, &name).await?;
                Ok(CommandOutcome::Revision(rev))
            }
            Command::RemoveProject { author, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.remove_project(&author, &name).await?;
                Ok(CommandOutcome::Revision(rev))
            }
            Command::UnremoveProject { author, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.restore_project(&author, &name).await?;
                Ok(CommandOutcome::Revision(rev))
            }
            Command::PurgeProject { author, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.purge_project(&author, &name).await?;
                self.repositories.purge_project(&name);
                Ok(CommandOutcome::Revision(rev))
            }

            Command::CreateRepository { author, project, name } => {
                self.status.check_writable(false)?;
                self.metadata.add_repo(&author, &project, &name).await?;
                let engine = self.repositories.provision(&project, &name)?;
                let marker = serde_json::json!({ "name": name, "createdBy": author, "createdAtMillis": Utc::now().timestamp_millis() });
                let result = engine
                    .push(
                        -1,
                        Author::new(&author, format!("{author}@internal")),
                        CommitMessage::summary_only(format!("Create a new repository: {name}")),
                        vec![Change::upsert_json(REPOSITORY_MARKER_PATH, marker)],
                    )
                    .await?;
                Ok(CommandOutcome::Revision(result.revision))
            }
            Command::RemoveRepository { author, project, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.remove_repo(&author, &project, &name).await?;
                Ok(CommandOutcome::Revision(rev))
            }
            Command::UnremoveRepository { author, project, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.restore_repo(&author, &project, &name).await?;
                Ok(CommandOutcome::Revision(rev))
            }
            Command::PurgeRepository { author, project, name } => {
                self.status.check_writable(false)?;
                let rev = self.metadata.purge_repo(&author, &project, &name).await?;
                self.repositories.purge(&project, &name);
                Ok(CommandOutcome::Revision(rev))
            }

            Command::Push { project, repo, author, base_rev, message, changes } => {
                self.status.check_writable(false)?;
                self.check_quota(&project, &repo)?;
                let engine = self.repositories.get(&project, &repo)?;
                let result = engine.push(base_rev, author, message, changes).await?;
                self.repositories.notifier_for(&project, &repo).notify_commit();
                Ok(CommandOutcome::Revision(result.revision))
            }
            Command::ForcePush { project, repo, author, base_rev, message, changes } => {
                self.status.check_writable(true)?;
                self.check_quota(&project, &repo)?;
                let engine = self.repositories.get(&project, &repo)?;
                let result = engine.push(base_rev, author, message, changes).await?;
                self.repositories.notifier_for(&project, &repo).notify_commit();
                Ok(CommandOutcome::Revision(result.revision))
            }
            Command::Transform { project, repo, author, path, message, transform } => {
                self.status.check_writable(false)?;
                self.check_quota(&project, &repo)?;
                let engine = self.repositories.get(&project, &repo)?;
                let result = engine
                    .transform_json(&path, author, message, move |rev, value| transform(rev, value))
                    .await?;
                self.repositories.notifier_for(&project, &repo).notify_commit();
                Ok(CommandOutcome::Revision(result.revision))
            }

            Command::Metadata(cmd) => self.apply_metadata_command(cmd).await,
        }
    }
}

impl<S: ObjectStore, L: RevisionLog> StandaloneExecutor<S, L> {
    async fn apply_metadata_command(&self, cmd: MetadataCommand) -> Result<CommandOutcome, DogmaError> {
        self.status.check_writable(false)?;
        let rev = match cmd {
            MetadataCommand::AddProject { author, name } => self.metadata.add_project(&author, &name).await?,
            MetadataCommand::RemoveProject { author, name } => self.metadata.remove_project(&author, &name).await?,
            MetadataCommand::RestoreProject { author, name } => self.metadata.restore_project(&author, &name).await?,
            MetadataCommand::PurgeProject { author, name } => {
                let rev = self.metadata.purge_project(&author, &name).await?;
                self.repositories.purge_project(&name);
                rev
            }
            MetadataCommand::AddMember { author, project, user, role } => {
                self.metadata.add_member(&author, &project, &user, role).await?
            }
            MetadataCommand::RemoveMember { author, project, user } => {
                self.metadata.remove_member(&author, &project, &user).await?
            }
            MetadataCommand::AddRepo { author, project, name } => {
                let rev = self.metadata.add_repo(&author, &project, &name).await?;
                self.repositories.provision(&project, &name)?;
                rev
            }
            MetadataCommand::RemoveRepo { author, project, name } => {
                self.metadata.remove_repo(&author, &project, &name).await?
            }
            MetadataCommand::RestoreRepo { author, project, name } => {
                self.metadata.restore_repo(&author, &project, &name).await?
            }
            MetadataCommand::PurgeRepo { author, project, name } => {
                let rev = self.metadata.purge_repo(&author, &project, &name).await?;
                self.repositories.purge(&project, &name);
                rev
            }
            MetadataCommand::UpdateRepositoryStatus { author, project, repo, status } => {
                self.metadata.update_repository_status(&author, &project, &repo, status).await?
            }
            MetadataCommand::UpdateRepositoryProjectRoles { author, project, repo, member_role, guest_role } => {
                self.metadata
                    .update_repository_project_roles(&author, &project, &repo, member_role, guest_role)
                    .await?
            }
            MetadataCommand::AddUserRepositoryRole { author, project, repo, user, role } => {
                self.metadata.add_user_repository_role(&author, &project, &repo, &user, role).await?
            }
            MetadataCommand::RemoveUserRepositoryRole { author, project, repo, user } => {
                self.metadata.remove_user_repository_role(&author, &project, &repo, &user).await?
            }
            MetadataCommand::AddProjectAppIdentity { author, project, app_id, role } => {
                self.metadata.add_project_app_identity(&author, &project, &app_id, role).await?
            }
            MetadataCommand::RemoveProjectAppIdentity { author, project, app_id } => {
                self.metadata.remove_project_app_identity(&author, &project, &app_id).await?
            }
            MetadataCommand::AddAppIdentityRepositoryRole { author, project, repo, app_id, role } => {
                self.metadata.add_app_identity_repository_role(&author, &project, &repo, &app_id, role).await?
            }
            MetadataCommand::UpdateAppIdentityRepositoryRole { author, project, repo, app_id, role } => {
                self.metadata.update_app_identity_repository_role(&author, &project, &repo, &app_id, role).await?
            }
            MetadataCommand::RemoveAppIdentityRepositoryRole { author, project, repo, app_id } => {
                self.metadata.remove_app_identity_repository_role(&author, &project, &repo, &app_id).await?
            }
            MetadataCommand::SetRepositoryQuota { author, project, repo, quota } => {
                let rev = self.metadata.set_repository_quota(&author, &project, &repo, quota).await?;
                self.resync_quota(&project, &repo).await?;
                rev
            }
            MetadataCommand::CreateToken { author, app_id, secret, is_system_admin } => {
                self.metadata.create_token(&author, &app_id, secret, is_system_admin).await?
            }
            MetadataCommand::CreateCertificate { author, app_id, certificate_id, is_system_admin } => {
                self.metadata.create_certificate(&author, &app_id, certificate_id, is_system_admin).await?
            }
            MetadataCommand::ActivateIdentity { author, app_id } => {
                self.metadata.activate_identity(&author, &app_id).await?
            }
            MetadataCommand::DeactivateIdentity { author, app_id } => {
                self.metadata.deactivate_identity(&author, &app_id).await?
            }
            MetadataCommand::DestroyIdentity { author, app_id } => {
                self.metadata.destroy_identity(&author, &app_id).await?
            }
            MetadataCommand::PurgeAppIdentity { author, app_id } => {
                self.metadata.purge_app_identity(&author, &app_id).await?
            }
        };
        Ok(CommandOutcome::Revision(rev))
    }
}
