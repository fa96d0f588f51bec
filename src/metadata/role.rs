//! Role vocabularies and the effective-role resolution algorithm.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProjectRole {
    Guest,
    Member,
    Owner,
}

/// `ADMIN ⊐ WRITE ⊐ READ`; the derived `Ord` follows declaration order so
/// `RepositoryRole::Admin > RepositoryRole::Write > RepositoryRole::Read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RepositoryRole {
    Read,
    Write,
    Admin,
}

/// Per-repository role map: a direct grant plus the roles inherited from
/// project membership.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryRoles {
    /// Role granted to project members, if any.
    pub project_member_role: Option<RepositoryRole>,
    /// Role granted to project guests, if any. Never `Write` or higher —
    /// rejected at the mutation boundary, not here.
    pub project_guest_role: Option<RepositoryRole>,
    pub users: std::collections::BTreeMap<String, RepositoryRole>,
    pub app_ids: std::collections::BTreeMap<String, RepositoryRole>,
}

/// What the caller of [`resolve_repository_role`] knows about one principal.
pub struct PrincipalContext<'a> {
    pub id: &'a str,
    pub is_system_admin: bool,
    pub project_role: Option<ProjectRole>,
    /// App identities opted into guest access still resolve a guest role;
    /// app identities that did not opt in get `None` in that position even
    /// if the project itself grants guests a role.
    pub is_app_identity_with_guest_access: bool,
}

/// `dogma` is the reserved metadata repository of every project; it is
/// never reachable through the ordinary role lattice.
pub const RESERVED_METADATA_REPO: &str = "dogma";

/// Resolves the effective [`RepositoryRole`] of a principal against one
/// repository's role map, per the algorithm in §4.6:
///
/// 1. System admins get `ADMIN` unconditionally.
/// 2. `repo_name == "dogma"` is admin-only regardless of project role.
/// 3. Project owners get `ADMIN`.
/// 4. Otherwise the max of the direct grant and the role inherited from
///    project membership (member/guest), under `ADMIN ⊐ WRITE ⊐ READ`.
pub fn resolve_repository_role(
    principal: &PrincipalContext,
    repo_name: &str,
    roles: &RepositoryRoles,
) -> Option<RepositoryRole> {
    if principal.is_system_admin {
        return Some(RepositoryRole::Admin);
    }
    if repo_name == RESERVED_METADATA_REPO {
        return None;
    }
    if principal.project_role == Some(ProjectRole::Owner) {
        return Some(RepositoryRole::Admin);
    }

    let direct = roles.users.get(principal.id).copied().or_else(|| {
        roles.app_ids.get(principal.id).copied()
    });

    let inherited = match principal.project_role {
        Some(ProjectRole::Member) => roles.project_member_role,
        Some(ProjectRole::Guest) => roles.project_guest_role,
        _ => {
            if principal.is_app_identity_with_guest_access {
                roles.project_guest_role
            } else {
                None
            }
        }
    };

    match (direct, inherited) {
        (None, None) => None,
        (Some(d), None) => Some(d),
        (None, Some(i)) => Some(i),
        (Some(d), Some(i)) => Some(d.max(i)),
    }
}
