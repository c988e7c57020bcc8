//! Package installer abstraction.
//!
//! Logical dependency names map to native package names per distro family;
//! installs query first and mutate only on a miss, which is what makes the
//! dependency layer idempotent. Commands are typed argument vectors, never
//! eval'd strings.

use async_trait::async_trait;

use crate::command;
use crate::error::{ProvisionError, Result};
use crate::probe::DistroFamily;

/// Logical dependencies the orchestrator knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalPackage {
    CifsUtils,
    Autofs,
    Docker,
    Podman,
    DockerComposePlugin,
    PodmanCompose,
    Pip,
}

impl LogicalPackage {
    pub fn as_str(self) -> &'static str {
        match self {
            LogicalPackage::CifsUtils => "cifs-utils",
            LogicalPackage::Autofs => "autofs",
            LogicalPackage::Docker => "docker",
            LogicalPackage::Podman => "podman",
            LogicalPackage::DockerComposePlugin => "docker-compose-plugin",
            LogicalPackage::PodmanCompose => "podman-compose",
            LogicalPackage::Pip => "pip",
        }
    }
}

/// Native CLI seam for one distro family.
///
/// `refresh_index` failures are always soft (named policy): a stale index
/// is reported with `Ok(false)` and only the subsequent install result
/// decides success.
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    fn family(&self) -> DistroFamily;

    /// Native package names behind a logical name. Empty means the family
    /// has no way to provide it.
    fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str];

    async fn is_installed(&self, logical: LogicalPackage) -> Result<bool>;

    /// Install the packages behind `logical` if any are missing.
    /// Returns true when something was actually installed.
    async fn ensure_installed(&self, logical: LogicalPackage) -> Result<bool>;

    /// Refresh the package index. Soft failure: returns Ok(false).
    async fn refresh_index(&self) -> Result<bool>;

    /// The manual command an operator would run, for remediation messages.
    fn manual_install_hint(&self, logical: LogicalPackage) -> String;
}

/// Build the installer for a probed family.
pub fn installer_for(family: DistroFamily) -> Box<dyn PackageInstaller> {
    match family {
        DistroFamily::ArchLike => Box::new(PacmanInstaller),
        DistroFamily::DebianLike => Box::new(AptInstaller),
        DistroFamily::RpmLike => Box::new(DnfInstaller),
        DistroFamily::ImmutableOstree => Box::new(RpmOstreeInstaller),
    }
}

async fn query(program: &str, args: &[&str]) -> Result<bool> {
    Ok(command::run_default(program, args).await?.success())
}

async fn install(program: &str, args: &[&str], pkg: &str, hint: &str) -> Result<()> {
    let out = command::run_default(program, args).await?;
    if out.success() {
        tracing::info!("[PackageInstaller] Installed {}", pkg);
        Ok(())
    } else {
        Err(ProvisionError::DependencyInstallFailure {
            reason: format!("{} install failed: {}", pkg, out.last_stderr_line()),
            remediation: hint.to_string(),
        })
    }
}

async fn soft_refresh(program: &str, args: &[&str]) -> Result<bool> {
    match command::run_default(program, args).await {
        Ok(out) if out.success() => Ok(true),
        Ok(out) => {
            tracing::warn!(
                "[PackageInstaller] Index refresh failed (continuing with stale index): {}",
                out.last_stderr_line()
            );
            Ok(false)
        }
        Err(e) => {
            tracing::warn!(
                "[PackageInstaller] Index refresh failed (continuing with stale index): {}",
                e
            );
            Ok(false)
        }
    }
}

macro_rules! ensure_via_query {
    ($self:ident, $logical:ident) => {{
        if $self.native_packages($logical).is_empty() {
            return Err(ProvisionError::DependencyInstallFailure {
                reason: format!(
                    "'{}' is not available on {} hosts",
                    $logical.as_str(),
                    $self.family().as_str()
                ),
                remediation: "install it manually".to_string(),
            });
        }
        if $self.is_installed($logical).await? {
            tracing::debug!(
                "[PackageInstaller] {} already installed, skipping",
                $logical.as_str()
            );
            return Ok(false);
        }
    }};
}

/// Arch-family installer (pacman).
pub struct PacmanInstaller;

#[async_trait]
impl PackageInstaller for PacmanInstaller {
    fn family(&self) -> DistroFamily {
        DistroFamily::ArchLike
    }

    fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
        match logical {
            LogicalPackage::CifsUtils => &["cifs-utils"],
            LogicalPackage::Autofs => &["autofs"],
            LogicalPackage::Docker => &["docker"],
            LogicalPackage::Podman => &["podman"],
            LogicalPackage::DockerComposePlugin => &["docker-compose"],
            LogicalPackage::PodmanCompose => &["podman-compose"],
            LogicalPackage::Pip => &["python-pip"],
        }
    }

    async fn is_installed(&self, logical: LogicalPackage) -> Result<bool> {
        for &pkg in self.native_packages(logical) {
            if !query("pacman", &["-Qi", pkg]).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ensure_installed(&self, logical: LogicalPackage) -> Result<bool> {
        ensure_via_query!(self, logical);
        let hint = self.manual_install_hint(logical);
        for &pkg in self.native_packages(logical) {
            install("pacman", &["-S", "--noconfirm", "--needed", pkg], pkg, &hint).await?;
        }
        Ok(true)
    }

    async fn refresh_index(&self) -> Result<bool> {
        soft_refresh("pacman", &["-Sy"]).await
    }

    fn manual_install_hint(&self, logical: LogicalPackage) -> String {
        format!(
            "pacman -S --noconfirm {}",
            self.native_packages(logical).join(" ")
        )
    }
}

/// Debian-family installer (apt-get / dpkg-query).
pub struct AptInstaller;

#[async_trait]
impl PackageInstaller for AptInstaller {
    fn family(&self) -> DistroFamily {
        DistroFamily::DebianLike
    }

    fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
        match logical {
            LogicalPackage::CifsUtils => &["cifs-utils"],
            LogicalPackage::Autofs => &["autofs"],
            LogicalPackage::Docker => &["docker.io"],
            LogicalPackage::Podman => &["podman"],
            // Pairs with docker.io; ships the `docker compose` subcommand.
            LogicalPackage::DockerComposePlugin => &["docker-compose-v2"],
            LogicalPackage::PodmanCompose => &["podman-compose"],
            LogicalPackage::Pip => &["python3-pip"],
        }
    }

    async fn is_installed(&self, logical: LogicalPackage) -> Result<bool> {
        for &pkg in self.native_packages(logical) {
            let out = command::run_default(
                "dpkg-query",
                &["-W", "--showformat=${db:Status-Status}", pkg],
            )
            .await?;
            if !(out.success() && out.stdout.trim() == "installed") {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ensure_installed(&self, logical: LogicalPackage) -> Result<bool> {
        ensure_via_query!(self, logical);
        let hint = self.manual_install_hint(logical);
        for &pkg in self.native_packages(logical) {
            install(
                "apt-get",
                &["install", "-y", "--no-install-recommends", pkg],
                pkg,
                &hint,
            )
            .await?;
        }
        Ok(true)
    }

    async fn refresh_index(&self) -> Result<bool> {
        soft_refresh("apt-get", &["update"]).await
    }

    fn manual_install_hint(&self, logical: LogicalPackage) -> String {
        format!(
            "apt-get install -y {}",
            self.native_packages(logical).join(" ")
        )
    }
}

/// RPM-family installer (dnf / rpm).
pub struct DnfInstaller;

#[async_trait]
impl PackageInstaller for DnfInstaller {
    fn family(&self) -> DistroFamily {
        DistroFamily::RpmLike
    }

    fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
        match logical {
            LogicalPackage::CifsUtils => &["cifs-utils"],
            LogicalPackage::Autofs => &["autofs"],
            LogicalPackage::Docker => &["moby-engine"],
            LogicalPackage::Podman => &["podman"],
            LogicalPackage::DockerComposePlugin => &["docker-compose"],
            LogicalPackage::PodmanCompose => &["podman-compose"],
            LogicalPackage::Pip => &["python3-pip"],
        }
    }

    async fn is_installed(&self, logical: LogicalPackage) -> Result<bool> {
        for &pkg in self.native_packages(logical) {
            if !query("rpm", &["-q", pkg]).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ensure_installed(&self, logical: LogicalPackage) -> Result<bool> {
        ensure_via_query!(self, logical);
        let hint = self.manual_install_hint(logical);
        for &pkg in self.native_packages(logical) {
            install("dnf", &["install", "-y", pkg], pkg, &hint).await?;
        }
        Ok(true)
    }

    async fn refresh_index(&self) -> Result<bool> {
        soft_refresh("dnf", &["makecache", "--refresh"]).await
    }

    fn manual_install_hint(&self, logical: LogicalPackage) -> String {
        format!("dnf install -y {}", self.native_packages(logical).join(" "))
    }
}

/// rpm-ostree installer for immutable hosts. Layering is idempotent via
/// `--idempotent`; a reboot may still be required for layered packages,
/// which the plan surfaces to the operator.
pub struct RpmOstreeInstaller;

#[async_trait]
impl PackageInstaller for RpmOstreeInstaller {
    fn family(&self) -> DistroFamily {
        DistroFamily::ImmutableOstree
    }

    fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
        match logical {
            LogicalPackage::CifsUtils => &["cifs-utils"],
            LogicalPackage::Autofs => &["autofs"],
            // Immutable hosts ship podman; docker is not layered.
            LogicalPackage::Docker => &[],
            LogicalPackage::DockerComposePlugin => &[],
            LogicalPackage::Podman => &["podman"],
            LogicalPackage::PodmanCompose => &["podman-compose"],
            LogicalPackage::Pip => &["python3-pip"],
        }
    }

    async fn is_installed(&self, logical: LogicalPackage) -> Result<bool> {
        for &pkg in self.native_packages(logical) {
            if !query("rpm", &["-q", pkg]).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn ensure_installed(&self, logical: LogicalPackage) -> Result<bool> {
        ensure_via_query!(self, logical);
        let hint = self.manual_install_hint(logical);
        for &pkg in self.native_packages(logical) {
            install(
                "rpm-ostree",
                &["install", "--idempotent", "--apply-live", pkg],
                pkg,
                &hint,
            )
            .await?;
        }
        Ok(true)
    }

    async fn refresh_index(&self) -> Result<bool> {
        // rpm-ostree refreshes metadata as part of install; nothing to do.
        Ok(true)
    }

    fn manual_install_hint(&self, logical: LogicalPackage) -> String {
        format!(
            "rpm-ostree install --idempotent {}",
            self.native_packages(logical).join(" ")
        )
    }
}
