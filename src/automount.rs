//! Automount configurator.
//!
//! Renders the autofs master entry and per-share map for the declared
//! shares, replaces the files atomically, and reloads the automount
//! daemon. Rendering is deterministic: identical inputs produce
//! byte-identical files.

use std::path::{Path, PathBuf};

use crate::config::{AuthMode, AutomountSettings, ShareSpec};
use crate::credentials;
use crate::error::Result;
use crate::{command, config::NodeConfig};

/// SELinux context granting container processes access to mounted files.
const CONTAINER_FILE_CONTEXT: &str = "system_u:object_r:container_file_t:s0";

/// Where the rendered automount fragments live. Namespaced so unrelated
/// host configuration is never touched.
#[derive(Debug, Clone)]
pub struct AutomountPaths {
    /// Map file, e.g. /etc/auto.nodeup
    pub map_path: PathBuf,
    /// Master fragment, e.g. /etc/auto.master.d/nodeup.autofs
    pub master_path: PathBuf,
}

impl AutomountPaths {
    pub fn system_default() -> Self {
        Self {
            map_path: PathBuf::from("/etc/auto.nodeup"),
            master_path: PathBuf::from("/etc/auto.master.d/nodeup.autofs"),
        }
    }
}

/// Outcome of applying the automount configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutomountOutcome {
    pub map_changed: bool,
    pub master_changed: bool,
}

impl AutomountOutcome {
    pub fn any_changed(self) -> bool {
        self.map_changed || self.master_changed
    }
}

/// Render one map line for a share.
///
/// Credentialed shares reference their credential file; guest shares carry
/// the explicit `guest` flag and never a credentials path.
pub fn render_map_line(
    share: &ShareSpec,
    settings: &AutomountSettings,
    creds_dir: &Path,
    mac_enforcing: bool,
) -> String {
    let mut options = vec![
        "-fstype=cifs".to_string(),
        "rw".to_string(),
        "iocharset=utf8".to_string(),
        format!("uid={}", settings.uid),
        format!("gid={}", settings.gid),
    ];

    match share.auth {
        AuthMode::Credentialed => options.push(format!(
            "credentials={}",
            credentials::credential_path(creds_dir, &share.server).display()
        )),
        AuthMode::Guest => options.push("guest".to_string()),
    }

    if mac_enforcing {
        options.push(format!("context=\"{}\"", CONTAINER_FILE_CONTEXT));
    }

    format!("{} {} :{}", share.name, options.join(","), share.remote_address())
}

/// Render the full map file, one line per share in declaration order.
pub fn render_map(
    shares: &[ShareSpec],
    settings: &AutomountSettings,
    creds_dir: &Path,
    mac_enforcing: bool,
) -> String {
    let mut out = String::from("# Managed by nodeup. Do not edit; declared in nodeup.toml.\n");
    for share in shares {
        out.push_str(&render_map_line(share, settings, creds_dir, mac_enforcing));
        out.push('\n');
    }
    out
}

/// Render the master fragment binding the mount root to the map with an
/// idle-unmount timeout. `--ghost` keeps empty mount-point directories
/// visible so the trigger paths exist.
pub fn render_master(mount_root: &Path, map_path: &Path, settings: &AutomountSettings) -> String {
    format!(
        "# Managed by nodeup.\n{} {} --timeout={} --ghost\n",
        mount_root.display(),
        map_path.display(),
        settings.idle_timeout_secs
    )
}

/// Write `content` to `path` via a temp file in the same directory and an
/// atomic rename, so the daemon never observes a partial file. Returns
/// whether the content differed from what was on disk.
fn write_atomic_if_changed(path: &Path, content: &str) -> Result<bool> {
    if let Ok(existing) = std::fs::read(path) {
        if existing == content.as_bytes() {
            return Ok(false);
        }
    }

    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent)?;
    let tmp = tempfile::NamedTempFile::new_in(parent)?;
    std::fs::write(tmp.path(), content.as_bytes())?;
    tmp.persist(path)
        .map_err(|e| crate::error::ProvisionError::Io(e.error))?;
    Ok(true)
}

pub struct AutomountConfigurator {
    paths: AutomountPaths,
    creds_dir: PathBuf,
}

impl AutomountConfigurator {
    pub fn new(paths: AutomountPaths, creds_dir: PathBuf) -> Self {
        Self { paths, creds_dir }
    }

    /// Render and install the map and master files.
    pub fn apply(&self, config: &NodeConfig, mac_enforcing: bool) -> Result<AutomountOutcome> {
        let map = render_map(
            &config.shares,
            &config.automount,
            &self.creds_dir,
            mac_enforcing,
        );
        let master = render_master(
            &config.node.mount_root,
            &self.paths.map_path,
            &config.automount,
        );

        std::fs::create_dir_all(&config.node.mount_root)?;

        let map_changed = write_atomic_if_changed(&self.paths.map_path, &map)?;
        let master_changed = write_atomic_if_changed(&self.paths.master_path, &master)?;

        let outcome = AutomountOutcome {
            map_changed,
            master_changed,
        };
        if outcome.any_changed() {
            tracing::info!(
                "[Automount] Updated configuration (map_changed={}, master_changed={})",
                map_changed,
                master_changed
            );
        } else {
            tracing::info!("[Automount] Configuration unchanged");
        }
        Ok(outcome)
    }

    /// Reload the automount daemon so the new map takes effect without a
    /// reboot. Falls back to a restart when reload is unsupported.
    pub async fn reload_daemon(&self) -> Result<()> {
        let reload = command::run_default("systemctl", &["reload", "autofs"]).await?;
        if reload.success() {
            return Ok(());
        }
        tracing::warn!(
            "[Automount] reload failed ({}), restarting autofs",
            reload.last_stderr_line()
        );
        let restart = command::run_default("systemctl", &["restart", "autofs"]).await?;
        if restart.success() {
            Ok(())
        } else {
            Err(crate::error::ProvisionError::Command(format!(
                "autofs restart failed: {}",
                restart.last_stderr_line()
            )))
        }
    }

    /// Remove the namespaced map and master fragments. Used when every
    /// share failed validation, so the host is not left with a broken
    /// half-applied mount configuration.
    pub fn remove_config(&self) -> Result<bool> {
        let mut removed = false;
        for path in [&self.paths.map_path, &self.paths.master_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {
                    tracing::info!("[Automount] Rolled back {:?}", path);
                    removed = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }

    pub fn paths(&self) -> &AutomountPaths {
        &self.paths
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures::SAMPLE;

    fn sample() -> NodeConfig {
        NodeConfig::parse(SAMPLE).unwrap()
    }

    fn settings() -> AutomountSettings {
        AutomountSettings::default()
    }

    #[test]
    fn test_credentialed_line_references_credential_file() {
        let config = sample();
        let line = render_map_line(
            &config.shares[0],
            &settings(),
            Path::new("/etc/nodeup/creds"),
            false,
        );
        assert_eq!(
            line,
            "movies -fstype=cifs,rw,iocharset=utf8,uid=1000,gid=1000,\
             credentials=/etc/nodeup/creds/nas.lan.cred ://nas.lan/movies"
        );
    }

    #[test]
    fn test_guest_line_never_references_credentials() {
        let config = sample();
        let line = render_map_line(
            &config.shares[2],
            &settings(),
            Path::new("/etc/nodeup/creds"),
            false,
        );
        assert!(line.contains(",guest"));
        assert!(!line.contains("credentials="));
    }

    #[test]
    fn test_mac_context_suffix() {
        let config = sample();
        let line = render_map_line(
            &config.shares[0],
            &settings(),
            Path::new("/etc/nodeup/creds"),
            true,
        );
        assert!(line.contains("context=\"system_u:object_r:container_file_t:s0\""));
    }

    #[test]
    fn test_rendering_is_deterministic() {
        let config = sample();
        let a = render_map(&config.shares, &settings(), Path::new("/c"), true);
        let b = render_map(&config.shares, &settings(), Path::new("/c"), true);
        assert_eq!(a, b);
        assert_eq!(a.lines().count(), 4); // header + 3 shares
    }

    #[test]
    fn test_master_entry() {
        let master = render_master(
            Path::new("/mnt/nodeup"),
            Path::new("/etc/auto.nodeup"),
            &settings(),
        );
        assert!(master.contains("/mnt/nodeup /etc/auto.nodeup --timeout=300 --ghost"));
    }

    #[test]
    fn test_apply_then_unchanged_then_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = sample();
        config.node.mount_root = dir.path().join("mnt");
        let paths = AutomountPaths {
            map_path: dir.path().join("auto.nodeup"),
            master_path: dir.path().join("auto.master.d/nodeup.autofs"),
        };
        let configurator = AutomountConfigurator::new(paths.clone(), dir.path().join("creds"));

        let first = configurator.apply(&config, false).unwrap();
        assert!(first.map_changed && first.master_changed);

        let second = configurator.apply(&config, false).unwrap();
        assert!(!second.any_changed());

        assert!(configurator.remove_config().unwrap());
        assert!(!paths.map_path.exists());
        assert!(!paths.master_path.exists());
        // Rollback of already-removed config is a no-op, not an error.
        assert!(!configurator.remove_config().unwrap());
    }
}
