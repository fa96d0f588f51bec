//! Machine identities and the principal-resolution boundary.
//!
//! Credential verification (checking a bearer secret or a client
//! certificate against its source of truth) is an external collaborator:
//! this crate defines the trait a caller must satisfy, never a concrete
//! implementation.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum IdentityState {
    Active,
    Inactive,
    Deleting,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum AppIdentity {
    TokenIdentity {
        app_id: String,
        secret: String,
        is_system_admin: bool,
        state: IdentityState,
        allow_guest_access: bool,
    },
    CertificateIdentity {
        app_id: String,
        certificate_id: String,
        is_system_admin: bool,
        state: IdentityState,
        allow_guest_access: bool,
    },
}

impl AppIdentity {
    pub fn app_id(&self) -> &str {
        match self {
            AppIdentity::TokenIdentity { app_id, .. } => app_id,
            AppIdentity::CertificateIdentity { app_id, .. } => app_id,
        }
    }

    pub fn state(&self) -> IdentityState {
        match self {
            AppIdentity::TokenIdentity { state, .. } => *state,
            AppIdentity::CertificateIdentity { state, .. } => *state,
        }
    }

    pub fn is_system_admin(&self) -> bool {
        match self {
            AppIdentity::TokenIdentity { is_system_admin, .. } => *is_system_admin,
            AppIdentity::CertificateIdentity { is_system_admin, .. } => *is_system_admin,
        }
    }

    pub fn allows_guest_access(&self) -> bool {
        match self {
            AppIdentity::TokenIdentity { allow_guest_access, .. } => *allow_guest_access,
            AppIdentity::CertificateIdentity { allow_guest_access, .. } => *allow_guest_access,
        }
    }

    /// `DELETING` is a soft-delete awaiting `purgeAppIdentity`; such an
    /// identity must resolve no role at all.
    pub fn is_usable(&self) -> bool {
        self.state() == IdentityState::Active
    }
}

/// A credential presented by a caller, opaque to this crate — the bearer
/// secret or certificate material itself is never modeled here, only what
/// it resolves to.
#[derive(Debug, Clone)]
pub enum Credential {
    BearerToken(String),
    ClientCertificate(Vec<u8>),
}

/// Who is making a call, once a transport has already verified a
/// [`Credential`] against its external source of truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(String),
    AppIdentity(String),
}

impl Principal {
    /// The bare id, regardless of which variant — the same string a
    /// [`RepositoryRoles`](crate::metadata::role::RepositoryRoles) map or a
    /// project's member/app-identity map would key on.
    pub fn id(&self) -> &str {
        match self {
            Principal::User(id) => id,
            Principal::AppIdentity(id) => id,
        }
    }
}

/// Boundary a transport must satisfy: given a verified credential, name
/// the principal behind it. This crate never constructs one; it only
/// consumes the trait when resolving roles.
pub trait PrincipalResolver: Send + Sync {
    fn resolve(&self, credential: &Credential) -> Result<Principal, crate::errors::DogmaError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deleting_identity_is_not_usable() {
        let id = AppIdentity::TokenIdentity {
            app_id: "bot".into(),
            secret: "s".into(),
            is_system_admin: false,
            state: IdentityState::Deleting,
            allow_guest_access: false,
        };
        assert!(!id.is_usable());
    }

    #[test]
    fn active_identity_is_usable() {
        let id = AppIdentity::CertificateIdentity {
            app_id: "bot".into(),
            certificate_id: "c1".into(),
            is_system_admin: true,
            state: IdentityState::Active,
            allow_guest_access: false,
        };
        assert!(id.is_usable());
        assert!(id.is_system_admin());
    }
}
