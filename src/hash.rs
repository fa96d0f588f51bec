//! Content digest for the object store.
//!
//! Every blob and tree is addressed by a 20-byte digest of its canonicalized
//! bytes (see `internal::object_store`). Unlike Git we do not need a
//! selectable hash algorithm — the store has one, fixed format.

use std::fmt::Display;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

/// A 20-byte content digest, hex-displayed.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHash(pub [u8; 20]);

impl ObjectHash {
    pub const LEN: usize = 20;

    /// Digest of `data`.
    pub fn of(data: &[u8]) -> Self {
        let digest = Sha1::digest(data);
        let mut bytes = [0u8; 20];
        bytes.copy_from_slice(digest.as_slice());
        ObjectHash(bytes)
    }

    /// The all-zero digest, used as a sentinel parent for revision 1.
    pub const fn zero() -> Self {
        ObjectHash([0u8; 20])
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 20]
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ObjectHash({})", self.to_hex())
    }
}

impl Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl AsRef<[u8]> for ObjectHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl FromStr for ObjectHash {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 40 {
            return Err(format!("expected 40 hex chars, got {}", s.len()));
        }
        let bytes = hex::decode(s).map_err(|e| e.to_string())?;
        let mut h = [0u8; 20];
        h.copy_from_slice(&bytes);
        Ok(ObjectHash(h))
    }
}
