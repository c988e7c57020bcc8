//! Deployment manifest generator.
//!
//! Builds the descriptor strictly from validated shares plus the resolved
//! engine and declared workload parameters, then gates redeployment on a
//! content hash. The manifest deliberately carries no timestamp so that
//! identical inputs hash identically across runs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::{NodeConfig, ResourceLimits};
use crate::engine::EngineChoice;
use crate::error::{ProvisionError, Result};
use crate::mounts::MountSummary;

/// One host-path-to-container-path bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    /// Append `:z` so the engine relabels under an enforcing MAC policy.
    pub relabel: bool,
}

impl BindMount {
    /// Render as an engine CLI volume argument.
    pub fn render(&self) -> String {
        let mut out = format!("{}:{}", self.source.display(), self.target.display());
        if self.relabel {
            out.push_str(":z");
        }
        out
    }
}

/// The persisted deployment descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub image: String,
    pub node_name: String,
    pub server_url: String,
    pub engine: String,
    /// Binds derived only from shares that validated successfully.
    pub binds: Vec<BindMount>,
    /// BTreeMap for stable serialization order.
    pub env: BTreeMap<String, String>,
    pub resources: ResourceLimits,
}

impl DeploymentManifest {
    /// Assemble the manifest from validated mounts and declared workload
    /// parameters. Credentials are never consulted here, by construction.
    pub fn build(
        config: &NodeConfig,
        engine: &EngineChoice,
        mounts: &MountSummary,
        mac_enforcing: bool,
    ) -> Self {
        let binds = mounts
            .succeeded()
            .map(|r| BindMount {
                source: r.mount_point.clone(),
                target: PathBuf::from("/media").join(&r.share.name),
                relabel: mac_enforcing,
            })
            .collect();

        let mut env = BTreeMap::new();
        env.insert("serverURL".to_string(), config.node.server_url.clone());
        env.insert("nodeName".to_string(), config.node.name.clone());

        Self {
            image: config.node.image.clone(),
            node_name: config.node.name.clone(),
            server_url: config.node.server_url.clone(),
            engine: engine.kind.as_str().to_string(),
            binds,
            env,
            resources: config.resources.clone(),
        }
    }

    /// SHA-256 over the canonical JSON serialization.
    pub fn content_hash(&self) -> String {
        // Serialization of a fixed struct with BTreeMap env is canonical.
        let bytes = serde_json::to_vec(self).expect("manifest serializes");
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Whether the launcher needs to act.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestOutcome {
    /// Hash matches the previous run; the running instance is preserved.
    Unchanged { hash: String },
    /// Manifest written; redeploy required.
    Written { hash: String },
}

impl ManifestOutcome {
    pub fn hash(&self) -> &str {
        match self {
            ManifestOutcome::Unchanged { hash } | ManifestOutcome::Written { hash } => hash,
        }
    }

    pub fn redeploy_needed(&self) -> bool {
        matches!(self, ManifestOutcome::Written { .. })
    }
}

/// Persistent manifest + hash store at a known, auditable path.
pub struct ManifestStore {
    manifest_path: PathBuf,
}

impl ManifestStore {
    pub fn new(manifest_path: PathBuf) -> Self {
        Self { manifest_path }
    }

    pub fn system_default() -> Self {
        Self::new(PathBuf::from("/etc/nodeup/manifest.json"))
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    fn hash_path(&self) -> PathBuf {
        self.manifest_path.with_extension("json.sha256")
    }

    pub fn previous_hash(&self) -> Option<String> {
        std::fs::read_to_string(self.hash_path())
            .ok()
            .map(|s| s.trim().to_string())
    }

    /// Persist the manifest and its hash; skip everything when the hash
    /// matches the previous run (unless `force`).
    pub fn store(&self, manifest: &DeploymentManifest, force: bool) -> Result<ManifestOutcome> {
        let hash = manifest.content_hash();

        if !force && self.previous_hash().as_deref() == Some(hash.as_str()) {
            tracing::info!("[Manifest] Unchanged (hash {})", &hash[..12]);
            return Ok(ManifestOutcome::Unchanged { hash });
        }

        if let Some(parent) = self.manifest_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(manifest)
            .map_err(|e| ProvisionError::Config(format!("manifest serialization: {}", e)))?;
        std::fs::write(&self.manifest_path, json)?;
        std::fs::write(self.hash_path(), &hash)?;
        tracing::info!(
            "[Manifest] Wrote {:?} (hash {})",
            self.manifest_path,
            &hash[..12]
        );
        Ok(ManifestOutcome::Written { hash })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures::SAMPLE;
    use crate::engine::{EngineChoice, EngineKind};
    use crate::mounts::{MountResult, MountStatus};

    fn fixture() -> (NodeConfig, EngineChoice, MountSummary) {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        let engine = EngineChoice {
            kind: EngineKind::Docker,
            compose: None,
        };
        let results = config
            .shares
            .iter()
            .map(|share| MountResult {
                mount_point: share.mount_point(&config.node.mount_root),
                share: share.clone(),
                status: MountStatus::Success,
                error: None,
            })
            .collect();
        (config, engine, MountSummary { results })
    }

    #[test]
    fn test_binds_exclude_failed_shares() {
        let (config, engine, mut mounts) = fixture();
        mounts.results[1].status = MountStatus::Timeout;

        let manifest = DeploymentManifest::build(&config, &engine, &mounts, false);
        assert_eq!(manifest.binds.len(), 2);
        assert!(manifest
            .binds
            .iter()
            .all(|b| b.source != Path::new("/mnt/nodeup/tv")));
    }

    #[test]
    fn test_manifest_never_contains_secrets() {
        let (config, engine, mounts) = fixture();
        let manifest = DeploymentManifest::build(&config, &engine, &mounts, false);
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!json.contains("password"));
    }

    #[test]
    fn test_hash_is_stable_and_input_sensitive() {
        let (config, engine, mounts) = fixture();
        let a = DeploymentManifest::build(&config, &engine, &mounts, false);
        let b = DeploymentManifest::build(&config, &engine, &mounts, false);
        assert_eq!(a.content_hash(), b.content_hash());

        let mut config2 = config.clone();
        config2.node.image = "ghcr.io/haveagitgat/tdarr_node:2.45".to_string();
        let c = DeploymentManifest::build(&config2, &engine, &mounts, false);
        assert_ne!(a.content_hash(), c.content_hash());
    }

    #[test]
    fn test_relabel_suffix() {
        let bind = BindMount {
            source: PathBuf::from("/mnt/nodeup/movies"),
            target: PathBuf::from("/media/movies"),
            relabel: true,
        };
        assert_eq!(bind.render(), "/mnt/nodeup/movies:/media/movies:z");
    }

    #[test]
    fn test_store_gates_on_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::new(dir.path().join("manifest.json"));
        let (config, engine, mounts) = fixture();
        let manifest = DeploymentManifest::build(&config, &engine, &mounts, false);

        let first = store.store(&manifest, false).unwrap();
        assert!(first.redeploy_needed());

        let second = store.store(&manifest, false).unwrap();
        assert!(!second.redeploy_needed());
        assert_eq!(first.hash(), second.hash());

        // Force bypasses the gate.
        let forced = store.store(&manifest, true).unwrap();
        assert!(forced.redeploy_needed());

        // A content change re-arms the gate.
        let mut changed = manifest.clone();
        changed.image = "other:latest".to_string();
        assert!(store.store(&changed, false).unwrap().redeploy_needed());
    }
}
