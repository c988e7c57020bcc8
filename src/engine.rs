//! Capability resolver: container engine + compose tool.
//!
//! Ordered preference with demote-on-failure: an already-usable podman, an
//! already-usable docker, auto-installed docker, auto-installed podman.
//! With auto-install disabled, resolution fails fatally and the error
//! names the exact manual command.

use std::time::Duration;

use async_trait::async_trait;

use crate::command;
use crate::error::{ProvisionError, Result};
use crate::pkg::{LogicalPackage, PackageInstaller};
use crate::probe::HostProfile;
use crate::retry::{wait_until, RetryPolicy};

/// The resolved container runtime kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum EngineKind {
    Docker,
    Podman,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Docker => "docker",
            EngineKind::Podman => "podman",
        }
    }
}

/// The compose tool nested under the chosen engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum ComposeCommand {
    /// `docker compose` (plugin).
    DockerPlugin,
    /// Standalone `docker-compose` binary.
    DockerStandalone,
    /// `podman-compose`.
    PodmanCompose,
}

impl ComposeCommand {
    pub fn invocation(self) -> &'static [&'static str] {
        match self {
            ComposeCommand::DockerPlugin => &["docker", "compose"],
            ComposeCommand::DockerStandalone => &["docker-compose"],
            ComposeCommand::PodmanCompose => &["podman-compose"],
        }
    }
}

/// The resolved engine + compose tool for this run. Derived once, cached
/// only for the run's duration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineChoice {
    pub kind: EngineKind,
    pub compose: Option<ComposeCommand>,
}

/// Resolution outcome: the choice plus whether anything was installed to
/// get there, so the run report can tell convergence from mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineResolution {
    pub choice: EngineChoice,
    /// An engine or compose package was installed during this resolution.
    pub installed: bool,
}

/// Seam over the live host's engine state, so the resolution chain is
/// testable without daemons.
#[async_trait]
pub trait EngineProbe: Send + Sync {
    /// Engine CLI present and responsive (`<engine> info` succeeds).
    async fn usable(&self, kind: EngineKind) -> bool;

    /// Start/enable the engine daemon and wait for readiness.
    async fn activate(&self, kind: EngineKind) -> bool;

    /// Detect an already-available compose tool for the engine.
    async fn compose_available(&self, kind: EngineKind) -> Option<ComposeCommand>;

    /// Fallback compose install via the generic language package index.
    async fn pip_install(&self, package: &str) -> bool;
}

/// Live host probe.
pub struct HostEngineProbe;

#[async_trait]
impl EngineProbe for HostEngineProbe {
    async fn usable(&self, kind: EngineKind) -> bool {
        matches!(
            command::run(kind.as_str(), &["info"], Duration::from_secs(20)).await,
            Ok(out) if out.success()
        )
    }

    async fn activate(&self, kind: EngineKind) -> bool {
        if kind == EngineKind::Docker {
            let enabled =
                command::run_default("systemctl", &["enable", "--now", "docker"]).await;
            if !matches!(enabled, Ok(ref out) if out.success()) {
                tracing::warn!("[CapabilityResolver] Could not enable docker service");
                return false;
            }
            // Daemon readiness is not instant after enable.
            let policy = RetryPolicy::new(6, Duration::from_secs(1), Duration::from_secs(8));
            wait_until(policy, "docker daemon ready", move || self.usable(kind))
                .await
                .is_ready()
        } else {
            // Podman is daemonless; usability alone decides.
            self.usable(kind).await
        }
    }

    async fn compose_available(&self, kind: EngineKind) -> Option<ComposeCommand> {
        let candidates: &[ComposeCommand] = match kind {
            EngineKind::Docker => &[ComposeCommand::DockerPlugin, ComposeCommand::DockerStandalone],
            EngineKind::Podman => &[ComposeCommand::PodmanCompose],
        };
        for candidate in candidates {
            let invocation = candidate.invocation();
            let mut args: Vec<&str> = invocation[1..].to_vec();
            args.push("version");
            if let Ok(out) = command::run(invocation[0], &args, Duration::from_secs(20)).await {
                if out.success() {
                    return Some(*candidate);
                }
            }
        }
        None
    }

    async fn pip_install(&self, package: &str) -> bool {
        matches!(
            command::run_default("pip3", &["install", "--user", package]).await,
            Ok(out) if out.success()
        )
    }
}

fn logical_for(kind: EngineKind) -> LogicalPackage {
    match kind {
        EngineKind::Docker => LogicalPackage::Docker,
        EngineKind::Podman => LogicalPackage::Podman,
    }
}

/// Try to install and activate one engine. Errors demote; they never
/// abort the chain. `Some(mutated)` means the engine is ready, with
/// `mutated` telling whether a package was actually installed.
async fn try_install_engine(
    kind: EngineKind,
    installer: &dyn PackageInstaller,
    probe: &dyn EngineProbe,
) -> Option<bool> {
    let logical = logical_for(kind);
    if installer.native_packages(logical).is_empty() {
        tracing::info!(
            "[CapabilityResolver] {} not packaged for {} hosts, demoting",
            kind.as_str(),
            installer.family().as_str()
        );
        return None;
    }
    match installer.ensure_installed(logical).await {
        Ok(mutated) => {
            if probe.activate(kind).await {
                Some(mutated)
            } else {
                None
            }
        }
        Err(e) => {
            tracing::warn!(
                "[CapabilityResolver] {} install failed, demoting: {}",
                kind.as_str(),
                e
            );
            None
        }
    }
}

/// Resolve the engine for this run.
pub async fn resolve_engine(
    profile: &HostProfile,
    auto_install: bool,
    installer: &dyn PackageInstaller,
    probe: &dyn EngineProbe,
) -> Result<EngineResolution> {
    // (a) an already-running alternate engine is usable as-is
    if probe.usable(EngineKind::Podman).await {
        tracing::info!("[CapabilityResolver] Using already-usable podman");
        return finish(EngineKind::Podman, auto_install, installer, probe, false).await;
    }

    // (b) already-installed primary engine
    if probe.usable(EngineKind::Docker).await || probe.activate(EngineKind::Docker).await {
        tracing::info!("[CapabilityResolver] Using installed docker");
        return finish(EngineKind::Docker, auto_install, installer, probe, false).await;
    }

    if !auto_install {
        return Err(ProvisionError::DependencyInstallFailure {
            reason: "no usable container engine found and auto-install is disabled".to_string(),
            remediation: installer.manual_install_hint(logical_for(preferred_install(profile))),
        });
    }

    // (c) auto-install the primary engine
    let primary = preferred_install(profile);
    if let Some(mutated) = try_install_engine(primary, installer, probe).await {
        tracing::info!("[CapabilityResolver] Installed {}", primary.as_str());
        return finish(primary, auto_install, installer, probe, mutated).await;
    }

    // (d) auto-install the fallback engine
    let fallback = other(primary);
    if let Some(mutated) = try_install_engine(fallback, installer, probe).await {
        tracing::info!(
            "[CapabilityResolver] {} failed, fell back to {}",
            primary.as_str(),
            fallback.as_str()
        );
        return finish(fallback, auto_install, installer, probe, mutated).await;
    }

    Err(ProvisionError::DependencyInstallFailure {
        reason: "no container engine could be installed".to_string(),
        remediation: installer.manual_install_hint(logical_for(fallback)),
    })
}

/// Primary engine to install for this host. Immutable hosts only package
/// podman; everywhere else docker is first choice.
pub(crate) fn preferred_install(profile: &HostProfile) -> EngineKind {
    if profile.family == crate::probe::DistroFamily::ImmutableOstree {
        EngineKind::Podman
    } else {
        EngineKind::Docker
    }
}

fn other(kind: EngineKind) -> EngineKind {
    match kind {
        EngineKind::Docker => EngineKind::Podman,
        EngineKind::Podman => EngineKind::Docker,
    }
}

/// Compose resolution nested under the chosen engine: native package
/// first, then the generic language package index. Same demote-on-failure
/// shape; total compose failure is soft because the launcher drives the
/// engine CLI directly.
async fn finish(
    kind: EngineKind,
    auto_install: bool,
    installer: &dyn PackageInstaller,
    probe: &dyn EngineProbe,
    engine_installed: bool,
) -> Result<EngineResolution> {
    let mut installed = engine_installed;
    let done = |compose: Option<ComposeCommand>, installed: bool| {
        Ok(EngineResolution {
            choice: EngineChoice { kind, compose },
            installed,
        })
    };

    if let Some(compose) = probe.compose_available(kind).await {
        return done(Some(compose), installed);
    }

    if auto_install {
        let (native, pip_package) = match kind {
            EngineKind::Docker => (LogicalPackage::DockerComposePlugin, "docker-compose"),
            EngineKind::Podman => (LogicalPackage::PodmanCompose, "podman-compose"),
        };
        let mut compose_ready = false;
        match installer.ensure_installed(native).await {
            Ok(mutated) => {
                installed |= mutated;
                compose_ready = true;
            }
            Err(e) => {
                tracing::debug!(
                    "[CapabilityResolver] {} not installable natively: {}",
                    native.as_str(),
                    e
                );
            }
        }
        if !compose_ready {
            if let Ok(mutated) = installer.ensure_installed(LogicalPackage::Pip).await {
                installed |= mutated;
                if probe.pip_install(pip_package).await {
                    installed = true;
                    compose_ready = true;
                }
            }
        }
        if compose_ready {
            if let Some(compose) = probe.compose_available(kind).await {
                return done(Some(compose), installed);
            }
        }
    }

    tracing::warn!(
        "[CapabilityResolver] No compose tool available for {}; continuing without",
        kind.as_str()
    );
    done(None, installed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::{DistroFamily, FilesystemMode};
    use std::collections::HashSet;
    use std::sync::Mutex;

    fn arch_profile() -> HostProfile {
        HostProfile {
            family: DistroFamily::ArchLike,
            package_manager: "pacman",
            has_systemd: true,
            filesystem_mode: FilesystemMode::Normal,
            mac_enforcing: false,
        }
    }

    /// Scripted probe: which engines are usable/activatable, which
    /// installs succeed.
    struct FakeWorld {
        usable: Mutex<HashSet<&'static str>>,
        activatable: HashSet<&'static str>,
        installable: HashSet<&'static str>,
        install_attempts: Mutex<Vec<&'static str>>,
    }

    impl FakeWorld {
        fn new() -> Self {
            Self {
                usable: Mutex::new(HashSet::new()),
                activatable: HashSet::new(),
                installable: HashSet::new(),
                install_attempts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl EngineProbe for FakeWorld {
        async fn usable(&self, kind: EngineKind) -> bool {
            self.usable.lock().unwrap().contains(kind.as_str())
        }
        async fn activate(&self, kind: EngineKind) -> bool {
            if self.activatable.contains(kind.as_str()) {
                self.usable.lock().unwrap().insert(kind.as_str());
                true
            } else {
                false
            }
        }
        async fn compose_available(&self, _kind: EngineKind) -> Option<ComposeCommand> {
            None
        }
        async fn pip_install(&self, _package: &str) -> bool {
            false
        }
    }

    #[async_trait]
    impl PackageInstaller for FakeWorld {
        fn family(&self) -> DistroFamily {
            DistroFamily::ArchLike
        }
        fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
            crate::pkg::PacmanInstaller.native_packages(logical)
        }
        async fn is_installed(&self, _logical: LogicalPackage) -> crate::error::Result<bool> {
            Ok(false)
        }
        async fn ensure_installed(&self, logical: LogicalPackage) -> crate::error::Result<bool> {
            self.install_attempts.lock().unwrap().push(logical.as_str());
            if self.installable.contains(logical.as_str()) {
                Ok(true)
            } else {
                Err(ProvisionError::DependencyInstallFailure {
                    reason: format!("{} unavailable", logical.as_str()),
                    remediation: self.manual_install_hint(logical),
                })
            }
        }
        async fn refresh_index(&self) -> crate::error::Result<bool> {
            Ok(true)
        }
        fn manual_install_hint(&self, logical: LogicalPackage) -> String {
            format!("pacman -S --noconfirm {}", logical.as_str())
        }
    }

    #[tokio::test]
    async fn test_prefers_running_podman() {
        let mut world = FakeWorld::new();
        world.usable.get_mut().unwrap().insert("podman");
        let res = resolve_engine(&arch_profile(), true, &world, &world)
            .await
            .unwrap();
        assert_eq!(res.choice.kind, EngineKind::Podman);
        assert!(!res.installed);
        assert!(world.install_attempts.lock().unwrap().iter().all(|p| *p != "docker"));
    }

    #[tokio::test]
    async fn test_uses_installed_docker() {
        let mut world = FakeWorld::new();
        world.usable.get_mut().unwrap().insert("docker");
        let res = resolve_engine(&arch_profile(), true, &world, &world)
            .await
            .unwrap();
        assert_eq!(res.choice.kind, EngineKind::Docker);
        // Nothing was installed; the run report must read as converged.
        assert!(!res.installed);
        let attempts = world.install_attempts.lock().unwrap();
        assert!(attempts.iter().all(|p| *p != "docker" && *p != "podman"));
    }

    #[tokio::test]
    async fn test_docker_compose_install_chain_is_attempted() {
        let mut world = FakeWorld::new();
        world.usable.get_mut().unwrap().insert("docker");
        let res = resolve_engine(&arch_profile(), true, &world, &world)
            .await
            .unwrap();
        // Native plugin package first, then the pip fallback; both fail
        // here and the resolution degrades to no compose.
        let attempts = world.install_attempts.lock().unwrap();
        assert!(attempts.contains(&"docker-compose-plugin"));
        assert!(attempts.contains(&"pip"));
        assert!(res.choice.compose.is_none());
    }

    #[tokio::test]
    async fn test_failed_docker_install_demotes_to_podman() {
        let mut world = FakeWorld::new();
        // docker install fails, podman install succeeds and activates
        world.installable.insert("podman");
        world.activatable.insert("podman");
        let res = resolve_engine(&arch_profile(), true, &world, &world)
            .await
            .unwrap();
        assert_eq!(res.choice.kind, EngineKind::Podman);
        assert!(res.installed);
        let attempts = world.install_attempts.lock().unwrap();
        assert!(attempts.contains(&"docker"));
        assert!(attempts.contains(&"podman"));
    }

    #[tokio::test]
    async fn test_auto_install_disabled_is_fatal_with_remediation() {
        let world = FakeWorld::new();
        let err = resolve_engine(&arch_profile(), false, &world, &world)
            .await
            .unwrap_err();
        match err {
            ProvisionError::DependencyInstallFailure { remediation, .. } => {
                assert_eq!(remediation, "pacman -S --noconfirm docker");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(world.install_attempts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_chain_is_fatal() {
        let world = FakeWorld::new();
        let err = resolve_engine(&arch_profile(), true, &world, &world)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::DependencyInstallFailure { .. }
        ));
    }
}
