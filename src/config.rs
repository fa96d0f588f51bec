//! Server-wide configuration: storage root, per-repository write quotas,
//! watch wait-budget policy, and the replicated cluster topology.
//!
//! Loaded from TOML at startup; every section has a `Default` so a node can
//! run from an empty config file during local development, mirroring the
//! teacher's `PackConfig`/`LfsConfig` pattern.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory under which `<project>/<repo>/objects` and
    /// `<project>/<repo>/refs` are laid out.
    pub data_dir: PathBuf,
    /// Soft cap, in bytes, on the in-memory blob/tree read-through cache.
    pub object_cache_bytes: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            object_cache_bytes: 64 * 1024 * 1024,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct WatchConfig {
    /// Hard ceiling on a single long-poll wait, regardless of what the
    /// caller requested (§4.4 "wait budget").
    pub max_wait_millis: u64,
    /// Default wait when the caller did not specify one.
    pub default_wait_millis: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            max_wait_millis: 60_000,
            default_wait_millis: 1_000,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct QuotaConfig {
    /// Default token-bucket permits per period for a repository that has
    /// not configured its own quota in metadata.
    pub default_permits: u64,
    pub default_period_seconds: u64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            default_permits: 100,
            default_period_seconds: 1,
        }
    }
}

/// One replica in the cluster's quorum log.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ReplicaConfig {
    pub id: String,
    pub zone: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    /// Empty means standalone (single-node, no replication).
    pub replicas: Vec<ReplicaConfig>,
    /// This node's replica id; must appear in `replicas` unless standalone.
    pub self_id: String,
    /// Zone the default (unpinned) mirror tasks run in.
    pub default_zone: Option<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            replicas: Vec::new(),
            self_id: "standalone".to_string(),
            default_zone: None,
        }
    }
}

impl ClusterConfig {
    pub fn is_standalone(&self) -> bool {
        self.replicas.len() <= 1
    }

    /// Every zone a replica is pinned to, plus `default_zone` if set. A
    /// mirror task naming a zone absent from this set is never due,
    /// regardless of which node evaluates it.
    pub fn known_zones(&self) -> Vec<String> {
        let mut zones: Vec<String> = self.replicas.iter().filter_map(|r| r.zone.clone()).collect();
        if let Some(z) = &self.default_zone {
            if !zones.contains(z) {
                zones.push(z.clone());
            }
        }
        zones.sort();
        zones.dedup();
        zones
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub storage: StorageConfig,
    pub watch: WatchConfig,
    pub quota: QuotaConfig,
    pub cluster: ClusterConfig,
}

impl ServerConfig {
    /// Parse a TOML config file; missing sections fall back to their
    /// `Default`, missing file is not an error (standalone defaults apply).
    pub fn load(path: &std::path::Path) -> Result<Self, crate::errors::DogmaError> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                toml::from_str(&raw).map_err(|e| crate::errors::DogmaError::Internal(e.to_string()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ServerConfig::default();
        assert!(cfg.cluster.is_standalone());
        assert_eq!(cfg.quota.default_permits, 100);
    }

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = ServerConfig::load(std::path::Path::new("/nonexistent/dogma.toml")).unwrap();
        assert!(cfg.cluster.is_standalone());
    }

    #[test]
    fn known_zones_combines_replica_zones_and_default_zone() {
        let cluster = ClusterConfig {
            replicas: vec![
                ReplicaConfig { id: "a".into(), zone: Some("us-west".into()) },
                ReplicaConfig { id: "b".into(), zone: Some("us-east".into()) },
                ReplicaConfig { id: "c".into(), zone: None },
            ],
            self_id: "a".into(),
            default_zone: Some("us-east".into()),
        };
        assert_eq!(cluster.known_zones(), vec!["us-east".to_string(), "us-west".to_string()]);
    }
}
