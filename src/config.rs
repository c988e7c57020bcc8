//! Declarative node configuration.
//!
//! The side config is user-edited between runs; nodeup only reads it.
//! Loaded from an ordered candidate path list, working directory first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Authentication mode for a remote share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Credentialed,
    Guest,
}

/// One declared remote share to automount locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareSpec {
    /// Unique share name; doubles as the directory name under the mount
    /// root unless `mount_point` overrides it.
    pub name: String,
    /// Server hostname or address.
    pub server: String,
    /// Exported path on the server, e.g. "media" or "pool/video".
    pub path: String,
    #[serde(default)]
    pub auth: AuthMode,
    /// Absolute mount point override.
    #[serde(default)]
    pub mount_point: Option<PathBuf>,
}

impl ShareSpec {
    pub fn mount_point(&self, mount_root: &Path) -> PathBuf {
        self.mount_point
            .clone()
            .unwrap_or_else(|| mount_root.join(&self.name))
    }

    /// UNC-style remote address, `//server/path`.
    pub fn remote_address(&self) -> String {
        format!("//{}/{}", self.server, self.path)
    }
}

/// Credentials for one remote server. One record may back several
/// credentialed shares on the same server.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialConfig {
    pub server: String,
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub domain: Option<String>,
}

// The secret must never reach log output, including via {:?}.
impl std::fmt::Debug for CredentialConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialConfig")
            .field("server", &self.server)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

/// Workload parameters for the worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Identity reported to the coordinating server.
    pub name: String,
    /// Coordinating server endpoint, e.g. "http://tdarr.lan:8266".
    pub server_url: String,
    /// Worker container image reference.
    pub image: String,
    /// Root directory the automounter manages.
    #[serde(default = "default_mount_root")]
    pub mount_root: PathBuf,
}

fn default_mount_root() -> PathBuf {
    PathBuf::from("/mnt/nodeup")
}

/// Resource limits passed to the engine at launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default)]
    pub cpus: Option<f64>,
    /// e.g. "4g"
    #[serde(default)]
    pub memory: Option<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: None,
            memory: None,
        }
    }
}

/// Automount behavior knobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomountSettings {
    /// Idle seconds before a share is released.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u32,
    /// Numeric ownership applied to mounted files.
    #[serde(default = "default_uid")]
    pub uid: u32,
    #[serde(default = "default_uid")]
    pub gid: u32,
    /// Per-share mount trigger budget during validation.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

fn default_idle_timeout() -> u32 {
    300
}
fn default_uid() -> u32 {
    1000
}
fn default_probe_timeout() -> u64 {
    10
}

impl Default for AutomountSettings {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout(),
            uid: default_uid(),
            gid: default_uid(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Install behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSettings {
    /// Allow nodeup to install missing packages and engines.
    #[serde(default = "default_true")]
    pub auto_install: bool,
}

fn default_true() -> bool {
    true
}

impl Default for InstallSettings {
    fn default() -> Self {
        Self { auto_install: true }
    }
}

/// Full declarative configuration for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub automount: AutomountSettings,
    #[serde(default)]
    pub install: InstallSettings,
    #[serde(default)]
    pub shares: Vec<ShareSpec>,
    #[serde(default)]
    pub credentials: Vec<CredentialConfig>,
}

/// Candidate config locations, probed in order.
fn candidate_paths() -> Vec<PathBuf> {
    vec![
        PathBuf::from("nodeup.toml"),
        PathBuf::from("/etc/nodeup/nodeup.toml"),
    ]
}

impl NodeConfig {
    /// Load from an explicit path, or the first existing candidate.
    ///
    /// Unlike other provisioner configs there is no default fallback:
    /// shares and the server endpoint cannot be invented.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ProvisionError> {
        let paths = match explicit {
            Some(p) => vec![p.to_path_buf()],
            None => candidate_paths(),
        };

        for path in &paths {
            if path.exists() {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    ProvisionError::Config(format!("failed to read {:?}: {}", path, e))
                })?;
                let config: NodeConfig = toml::from_str(&content).map_err(|e| {
                    ProvisionError::Config(format!("failed to parse {:?}: {}", path, e))
                })?;
                config.validate()?;
                tracing::info!("[Config] Loaded node config from {:?}", path);
                return Ok(config);
            }
        }

        Err(ProvisionError::Config(format!(
            "no config file found (searched: {})",
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }

    pub fn parse(content: &str) -> Result<Self, ProvisionError> {
        let config: NodeConfig = toml::from_str(content)
            .map_err(|e| ProvisionError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Invariants: share names unique, mount points pairwise distinct,
    /// every credentialed share backed by a credential record.
    pub fn validate(&self) -> Result<(), ProvisionError> {
        if self.shares.is_empty() {
            return Err(ProvisionError::Config(
                "no shares declared; at least one [[shares]] entry is required".to_string(),
            ));
        }

        let mut names = HashSet::new();
        let mut mount_points = HashSet::new();
        for share in &self.shares {
            if !names.insert(share.name.as_str()) {
                return Err(ProvisionError::Config(format!(
                    "duplicate share name '{}'",
                    share.name
                )));
            }
            let mp = share.mount_point(&self.node.mount_root);
            if !mount_points.insert(mp.clone()) {
                return Err(ProvisionError::Config(format!(
                    "duplicate mount point {:?}",
                    mp
                )));
            }
            if share.auth == AuthMode::Credentialed && self.credential_for(&share.server).is_none()
            {
                return Err(ProvisionError::Config(format!(
                    "share '{}' is credentialed but no [[credentials]] entry matches server '{}'",
                    share.name, share.server
                )));
            }
        }

        let mut servers = HashSet::new();
        for cred in &self.credentials {
            if !servers.insert(cred.server.as_str()) {
                return Err(ProvisionError::Config(format!(
                    "duplicate credentials for server '{}'",
                    cred.server
                )));
            }
        }

        Ok(())
    }

    pub fn credential_for(&self, server: &str) -> Option<&CredentialConfig> {
        self.credentials.iter().find(|c| c.server == server)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    /// A valid three-share config used across module tests.
    pub const SAMPLE: &str = r#"
[node]
name = "garage-node"
server_url = "http://tdarr.lan:8266"
image = "ghcr.io/haveagitgat/tdarr_node:latest"
mount_root = "/mnt/nodeup"

[resources]
cpus = 4.0
memory = "6g"

[install]
auto_install = true

[[credentials]]
server = "nas.lan"
username = "media"
password = "hunter2"
domain = "WORKGROUP"

[[shares]]
name = "movies"
server = "nas.lan"
path = "movies"
auth = "credentialed"

[[shares]]
name = "tv"
server = "nas.lan"
path = "tv"
auth = "credentialed"

[[shares]]
name = "scratch"
server = "openshare.lan"
path = "scratch"
auth = "guest"
"#;
}
