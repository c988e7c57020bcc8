//! Provisioning pipeline: plan first, confirm once, then apply.
//!
//! Phases run strictly sequentially; no phase starts before the previous
//! phase's outcome is fully determined. Destructive steps are collected
//! into the plan and confirmed in one consolidated prompt, which also
//! gives a natural non-interactive mode (`--yes`).

use std::io::Write as _;
use std::path::PathBuf;
use std::time::Duration;

use crate::automount::{AutomountConfigurator, AutomountPaths};
use crate::config::NodeConfig;
use crate::credentials;
use crate::engine::{self, EngineKind, EngineProbe, HostEngineProbe};
use crate::error::{ProvisionError, Result};
use crate::launch::{self, ShellEngineCli};
use crate::manifest::{DeploymentManifest, ManifestStore};
use crate::mounts;
use crate::pkg::{self, LogicalPackage, PackageInstaller};
use crate::probe::{self, DistroFamily, HostProfile};
use crate::report::{PhaseOutcome, RunReport};
use crate::{command, manifest::ManifestOutcome};

/// CLI-facing knobs with a deterministic effect on the pipeline.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOptions {
    pub config_path: Option<PathBuf>,
    /// Skip the consolidated confirmation prompt.
    pub assume_yes: bool,
    /// Bypass the manifest hash gate.
    pub force_redeploy: bool,
    /// Stop after manifest generation; do not touch the instance.
    pub skip_start: bool,
    /// Never install anything; fail with remediation instead.
    pub no_auto_install: bool,
    /// Override the declared node identity.
    pub node_name: Option<String>,
    /// Override the declared server endpoint.
    pub server_url: Option<String>,
}

/// Filesystem locations the pipeline owns. Overridable for inspection and
/// tests; all namespaced so unrelated host configuration is never touched.
#[derive(Debug, Clone)]
pub struct PipelinePaths {
    pub automount: AutomountPaths,
    pub creds_dir: PathBuf,
    pub manifest_path: PathBuf,
}

impl PipelinePaths {
    pub fn system_default() -> Self {
        Self {
            automount: AutomountPaths::system_default(),
            creds_dir: PathBuf::from("/etc/nodeup/creds"),
            manifest_path: PathBuf::from("/etc/nodeup/manifest.json"),
        }
    }
}

/// The computed set of required changes, presented before anything
/// mutates.
#[derive(Debug, Clone)]
pub struct ProvisionPlan {
    pub profile: HostProfile,
    /// Logical packages that are missing and would be installed.
    pub missing_packages: Vec<LogicalPackage>,
    /// Engine that would be auto-installed because none responds.
    pub engine_install: Option<EngineKind>,
    /// Read-only root must be unlocked before installing (destructive).
    pub needs_unlock: bool,
    pub share_count: usize,
    pub instance: &'static str,
}

impl ProvisionPlan {
    pub fn has_destructive_steps(&self) -> bool {
        self.needs_unlock
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Host: {} ({}), systemd={}, rootfs={:?}, mac_enforcing={}\n",
            self.profile.family.as_str(),
            self.profile.package_manager,
            self.profile.has_systemd,
            self.profile.filesystem_mode,
            self.profile.mac_enforcing
        ));
        if self.missing_packages.is_empty() {
            out.push_str("Packages: nothing to install\n");
        } else {
            out.push_str(&format!(
                "Packages to install: {}\n",
                self.missing_packages
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }
        match self.engine_install {
            None => out.push_str("Engine: one already usable, nothing to install\n"),
            Some(kind) => out.push_str(&format!(
                "Engine to install: {} (none currently usable)\n",
                kind.as_str()
            )),
        }
        if self.needs_unlock {
            out.push_str(
                "DESTRUCTIVE: root filesystem is read-only and will be unlocked for the install\n",
            );
        }
        out.push_str(&format!(
            "Automount: {} share(s); worker instance '{}'\n",
            self.share_count, self.instance
        ));
        out
    }
}

/// Compute the plan without mutating anything.
pub async fn compute_plan(
    config: &NodeConfig,
    profile: &HostProfile,
    installer: &dyn PackageInstaller,
    probe: &dyn EngineProbe,
) -> Result<ProvisionPlan> {
    let mut missing = Vec::new();
    for logical in [LogicalPackage::CifsUtils, LogicalPackage::Autofs] {
        if !installer.is_installed(logical).await? {
            missing.push(logical);
        }
    }

    // An engine install belongs in the confirmation too; probing is
    // read-only.
    let engine_install = if probe.usable(EngineKind::Podman).await
        || probe.usable(EngineKind::Docker).await
    {
        None
    } else {
        Some(engine::preferred_install(profile))
    };

    Ok(ProvisionPlan {
        profile: profile.clone(),
        needs_unlock: profile.read_only_root()
            && (!missing.is_empty() || engine_install.is_some()),
        missing_packages: missing,
        engine_install,
        share_count: config.shares.len(),
        instance: launch::INSTANCE_NAME,
    })
}

/// One consolidated yes/no prompt. Only reached when `--yes` is absent.
fn confirm(plan: &ProvisionPlan) -> bool {
    eprintln!("{}", plan.render());
    eprint!("Proceed? [y/N] ");
    let _ = std::io::stderr().flush();
    let mut answer = String::new();
    if std::io::stdin().read_line(&mut answer).is_err() {
        return false;
    }
    matches!(answer.trim(), "y" | "Y" | "yes")
}

/// Unlock a read-only root before package installs. SteamOS-style hosts
/// expose this as a dedicated toggle; re-locked after installs.
async fn set_readonly(profile: &HostProfile, enabled: bool) -> Result<()> {
    if profile.family != DistroFamily::ArchLike {
        // rpm-ostree layers packages without unlocking.
        return Ok(());
    }
    let arg = if enabled { "enable" } else { "disable" };
    let out = command::run_default("steamos-readonly", &[arg]).await?;
    if out.success() {
        Ok(())
    } else {
        Err(ProvisionError::Command(format!(
            "steamos-readonly {} failed: {}",
            arg,
            out.last_stderr_line()
        )))
    }
}

/// Package phase outcome from the list of packages actually installed.
/// All-present runs must read as converged, not mutated.
fn packages_outcome(installed: &[&str]) -> PhaseOutcome {
    if installed.is_empty() {
        PhaseOutcome::Unchanged
    } else {
        PhaseOutcome::Changed(format!("installed {}", installed.join(", ")))
    }
}

/// Note appended to the fatal mounts record after a total validation
/// failure. A reload failure after removal must surface: autofs would
/// otherwise keep serving the deleted map silently.
fn rollback_note(removed: Result<bool>, reload: Option<Result<()>>) -> String {
    match (removed, reload) {
        (Ok(true), Some(Ok(()))) => "automount configuration rolled back".to_string(),
        (Ok(true), Some(Err(e))) => format!(
            "automount configuration removed but daemon reload failed ({}); reload autofs manually",
            e
        ),
        (Ok(true), None) => "automount configuration removed".to_string(),
        (Ok(false), _) => "no automount configuration to roll back".to_string(),
        (Err(_), _) => "rollback failed; remove the map files manually".to_string(),
    }
}

fn apply_overrides(config: &mut NodeConfig, opts: &ProvisionOptions) {
    if let Some(name) = &opts.node_name {
        config.node.name = name.clone();
    }
    if let Some(url) = &opts.server_url {
        config.node.server_url = url.clone();
    }
    if opts.no_auto_install {
        config.install.auto_install = false;
    }
}

/// Run the full pipeline. Always returns a report; the caller decides the
/// exit code from `report.status()`.
pub async fn provision(opts: ProvisionOptions, paths: PipelinePaths) -> RunReport {
    let mut report = RunReport::new();

    let mut config = match NodeConfig::load(opts.config_path.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            report.mark_fatal("config", e.to_string());
            return report;
        }
    };
    apply_overrides(&mut config, &opts);
    report.record("config", PhaseOutcome::Unchanged);

    // --- Environment Prober -------------------------------------------
    let profile = match probe::probe_host().await {
        Ok(p) => p,
        Err(e) => {
            report.mark_fatal("prober", e.to_string());
            return report;
        }
    };
    report.record(
        "prober",
        PhaseOutcome::Completed(format!("{} host", profile.family.as_str())),
    );

    let installer = pkg::installer_for(profile.family);
    let probe_impl = HostEngineProbe;

    // --- Plan + consolidated confirmation -----------------------------
    let plan = match compute_plan(&config, &profile, installer.as_ref(), &probe_impl).await {
        Ok(p) => p,
        Err(e) => {
            report.mark_fatal("plan", e.to_string());
            return report;
        }
    };
    if !opts.assume_yes && !confirm(&plan) {
        report.mark_fatal("plan", "aborted by operator at confirmation".to_string());
        return report;
    }

    // --- Package Installer --------------------------------------------
    if plan.missing_packages.is_empty() {
        report.record("packages", PhaseOutcome::Unchanged);
    } else if !config.install.auto_install {
        let hint = installer.manual_install_hint(plan.missing_packages[0]);
        report.mark_fatal(
            "packages",
            format!(
                "{} missing and auto-install disabled; run manually: {}",
                plan.missing_packages
                    .iter()
                    .map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
                hint
            ),
        );
        return report;
    } else {
        // Index refresh failures are always soft (named policy).
        let fresh = installer.refresh_index().await.unwrap_or(false);
        if !fresh {
            report.record(
                "package-index",
                PhaseOutcome::Skipped("refresh failed, using stale index".to_string()),
            );
        }

        if plan.needs_unlock {
            if let Err(e) = set_readonly(&profile, false).await {
                report.mark_fatal("packages", format!("filesystem unlock failed: {}", e));
                return report;
            }
        }
        let mut installed = Vec::new();
        for logical in &plan.missing_packages {
            match installer.ensure_installed(*logical).await {
                Ok(true) => installed.push(logical.as_str()),
                Ok(false) => {}
                Err(e) => {
                    // Relock before aborting; the unlock must not outlive
                    // the run that needed it.
                    if plan.needs_unlock {
                        let _ = set_readonly(&profile, true).await;
                    }
                    report.mark_fatal("packages", e.to_string());
                    return report;
                }
            }
        }
        report.record("packages", packages_outcome(&installed));
        if plan.needs_unlock {
            if let Err(e) = set_readonly(&profile, true).await {
                report.record(
                    "filesystem-relock",
                    PhaseOutcome::Failed(format!("{}; re-enable read-only mode manually", e)),
                );
            }
        }
    }

    // --- Capability Resolver ------------------------------------------
    let resolution = match engine::resolve_engine(
        &profile,
        config.install.auto_install,
        installer.as_ref(),
        &probe_impl,
    )
    .await
    {
        Ok(r) => r,
        Err(e) => {
            report.mark_fatal("engine", e.to_string());
            return report;
        }
    };
    let choice = resolution.choice;
    let engine_note = format!(
        "{} (compose: {})",
        choice.kind.as_str(),
        choice
            .compose
            .map(|c| c.invocation().join(" "))
            .unwrap_or_else(|| "none".to_string())
    );
    report.record(
        "engine",
        if resolution.installed {
            PhaseOutcome::Changed(engine_note)
        } else {
            PhaseOutcome::Completed(engine_note)
        },
    );

    // --- Credential Store Manager -------------------------------------
    match credentials::sync_all(&paths.creds_dir, &config.credentials) {
        Ok(files) => {
            let changed = files.iter().filter(|f| f.changed).count();
            if changed == 0 {
                report.record("credentials", PhaseOutcome::Unchanged);
            } else {
                report.record(
                    "credentials",
                    PhaseOutcome::Changed(format!("{} file(s) rewritten", changed)),
                );
            }
        }
        Err(e) => {
            report.mark_fatal("credentials", e.to_string());
            return report;
        }
    }

    // --- Automount Configurator ---------------------------------------
    let configurator =
        AutomountConfigurator::new(paths.automount.clone(), paths.creds_dir.clone());
    let automount_outcome = match configurator.apply(&config, profile.mac_enforcing) {
        Ok(outcome) => outcome,
        Err(e) => {
            report.mark_fatal("automount", e.to_string());
            return report;
        }
    };
    if automount_outcome.any_changed() {
        if let Err(e) = configurator.reload_daemon().await {
            report.mark_fatal("automount", format!("daemon reload failed: {}", e));
            return report;
        }
        report.record("automount", PhaseOutcome::Changed("map rewritten".to_string()));
    } else {
        report.record("automount", PhaseOutcome::Unchanged);
    }

    // --- Mount Validator (containment boundary) -----------------------
    let summary = mounts::validate_shares(
        &config.shares,
        &config.node.mount_root,
        Duration::from_secs(config.automount.probe_timeout_secs),
    )
    .await;

    if summary.total_failure() {
        // Roll back the configuration this run wrote so the host is not
        // left with a broken automount setup.
        let removed = configurator.remove_config();
        let reload = match &removed {
            Ok(true) => Some(configurator.reload_daemon().await),
            _ => None,
        };
        report.mark_fatal(
            "mounts",
            format!(
                "all {} share(s) failed validation; {}",
                summary.results.len(),
                rollback_note(removed, reload)
            ),
        );
        return report;
    }
    if summary.partial_failure() {
        let failed: Vec<&str> = summary.failed().map(|r| r.share.name.as_str()).collect();
        report.record(
            "mounts",
            PhaseOutcome::Failed(format!(
                "{} of {} share(s) failed ({}); continuing degraded",
                failed.len(),
                summary.results.len(),
                failed.join(", ")
            )),
        );
        report.mark_degraded();
    } else {
        report.record(
            "mounts",
            PhaseOutcome::Changed(format!("{} share(s) validated", summary.success_count())),
        );
    }

    // --- Manifest Generator -------------------------------------------
    let manifest = DeploymentManifest::build(&config, &choice, &summary, profile.mac_enforcing);
    let store = ManifestStore::new(paths.manifest_path.clone());
    let manifest_outcome = match store.store(&manifest, opts.force_redeploy) {
        Ok(o) => o,
        Err(e) => {
            report.mark_fatal("manifest", e.to_string());
            return report;
        }
    };
    match &manifest_outcome {
        ManifestOutcome::Unchanged { hash } => report.record(
            "manifest",
            PhaseOutcome::Skipped(format!("unchanged (hash {})", &hash[..12])),
        ),
        ManifestOutcome::Written { hash } => report.record(
            "manifest",
            PhaseOutcome::Changed(format!("hash {}", &hash[..12])),
        ),
    }

    // --- Service Launcher ---------------------------------------------
    if opts.skip_start {
        report.record(
            "launcher",
            PhaseOutcome::Skipped("start skipped on request".to_string()),
        );
        return report;
    }
    let cli = ShellEngineCli::new(choice.kind);
    match launch::deploy(&cli, &manifest, manifest_outcome.redeploy_needed()).await {
        Ok(outcome) => report.record("launcher", PhaseOutcome::Changed(format!("{:?}", outcome))),
        Err(e) => {
            report.mark_fatal("launcher", e.to_string());
            return report;
        }
    }

    report
}

/// `nodeup rollback`: remove the namespaced automount configuration.
pub async fn rollback(paths: PipelinePaths) -> Result<bool> {
    let configurator = AutomountConfigurator::new(paths.automount, paths.creds_dir);
    let removed = configurator.remove_config()?;
    if removed {
        configurator.reload_daemon().await?;
    }
    Ok(removed)
}

/// `nodeup status`: previous manifest hash plus instance state, observed
/// from whichever engine responds.
pub async fn status(paths: PipelinePaths) -> String {
    let store = ManifestStore::new(paths.manifest_path);
    let hash = store
        .previous_hash()
        .map(|h| h[..12.min(h.len())].to_string())
        .unwrap_or_else(|| "none".to_string());

    let probe_impl = HostEngineProbe;
    let mut instance = "unknown (no engine responding)".to_string();
    for kind in [crate::engine::EngineKind::Podman, crate::engine::EngineKind::Docker] {
        if engine::EngineProbe::usable(&probe_impl, kind).await {
            let cli = ShellEngineCli::new(kind);
            instance = match launch::EngineCli::state(&cli, launch::INSTANCE_NAME).await {
                Ok(state) => format!("{:?} ({})", state, kind.as_str()),
                Err(e) => format!("error: {}", e),
            };
            break;
        }
    }

    format!(
        "manifest hash: {}\ninstance '{}': {}\n",
        hash,
        launch::INSTANCE_NAME,
        instance
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_fixtures::SAMPLE;
    use crate::probe::FilesystemMode;
    use async_trait::async_trait;

    struct NothingInstalled;

    #[async_trait]
    impl PackageInstaller for NothingInstalled {
        fn family(&self) -> DistroFamily {
            DistroFamily::ArchLike
        }
        fn native_packages(&self, logical: LogicalPackage) -> &'static [&'static str] {
            crate::pkg::PacmanInstaller.native_packages(logical)
        }
        async fn is_installed(&self, _logical: LogicalPackage) -> Result<bool> {
            Ok(false)
        }
        async fn ensure_installed(&self, _logical: LogicalPackage) -> Result<bool> {
            Ok(true)
        }
        async fn refresh_index(&self) -> Result<bool> {
            Ok(true)
        }
        fn manual_install_hint(&self, logical: LogicalPackage) -> String {
            format!("pacman -S {}", logical.as_str())
        }
    }

    /// Scripted engine probe: which kinds respond to `usable`.
    struct EnginesUsable(&'static [&'static str]);

    #[async_trait]
    impl EngineProbe for EnginesUsable {
        async fn usable(&self, kind: EngineKind) -> bool {
            self.0.contains(&kind.as_str())
        }
        async fn activate(&self, _kind: EngineKind) -> bool {
            false
        }
        async fn compose_available(
            &self,
            _kind: EngineKind,
        ) -> Option<crate::engine::ComposeCommand> {
            None
        }
        async fn pip_install(&self, _package: &str) -> bool {
            false
        }
    }

    fn profile(mode: FilesystemMode) -> HostProfile {
        HostProfile {
            family: DistroFamily::ArchLike,
            package_manager: "pacman",
            has_systemd: true,
            filesystem_mode: mode,
            mac_enforcing: false,
        }
    }

    #[tokio::test]
    async fn test_plan_lists_missing_packages_and_unlock() {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        let plan = compute_plan(
            &config,
            &profile(FilesystemMode::ReadOnly),
            &NothingInstalled,
            &EnginesUsable(&[]),
        )
        .await
        .unwrap();
        assert_eq!(
            plan.missing_packages,
            vec![LogicalPackage::CifsUtils, LogicalPackage::Autofs]
        );
        assert_eq!(plan.engine_install, Some(EngineKind::Docker));
        assert!(plan.needs_unlock);
        assert!(plan.has_destructive_steps());
        let rendered = plan.render();
        assert!(rendered.contains("cifs-utils, autofs"));
        assert!(rendered.contains("Engine to install: docker"));
        assert!(rendered.contains("DESTRUCTIVE"));
        assert!(rendered.contains("3 share(s)"));
    }

    #[tokio::test]
    async fn test_plan_without_unlock_on_normal_root() {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        let plan = compute_plan(
            &config,
            &profile(FilesystemMode::Normal),
            &NothingInstalled,
            &EnginesUsable(&[]),
        )
        .await
        .unwrap();
        assert!(!plan.needs_unlock);
        assert!(!plan.has_destructive_steps());
    }

    #[tokio::test]
    async fn test_plan_omits_engine_when_one_responds() {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        let plan = compute_plan(
            &config,
            &profile(FilesystemMode::Normal),
            &NothingInstalled,
            &EnginesUsable(&["podman"]),
        )
        .await
        .unwrap();
        assert_eq!(plan.engine_install, None);
        assert!(plan.render().contains("Engine: one already usable"));
    }

    #[test]
    fn test_packages_outcome_reads_converged_when_nothing_installed() {
        assert_eq!(packages_outcome(&[]), PhaseOutcome::Unchanged);
        assert_eq!(
            packages_outcome(&["cifs-utils", "autofs"]),
            PhaseOutcome::Changed("installed cifs-utils, autofs".to_string())
        );
    }

    #[test]
    fn test_rollback_note_surfaces_reload_failure() {
        let note = rollback_note(
            Ok(true),
            Some(Err(ProvisionError::Command("systemctl reload failed".to_string()))),
        );
        assert!(note.contains("daemon reload failed"));
        assert!(note.contains("reload autofs manually"));

        assert_eq!(
            rollback_note(Ok(true), Some(Ok(()))),
            "automount configuration rolled back"
        );
        assert_eq!(
            rollback_note(Ok(false), None),
            "no automount configuration to roll back"
        );
        assert!(rollback_note(
            Err(ProvisionError::Command("unlink failed".to_string())),
            None
        )
        .contains("remove the map files manually"));
    }

    #[tokio::test]
    async fn test_provision_reports_config_failure() {
        let opts = ProvisionOptions {
            config_path: Some(PathBuf::from("/definitely/missing.toml")),
            assume_yes: true,
            ..Default::default()
        };
        let report = provision(opts, test_paths()).await;
        assert_eq!(report.status(), crate::report::RunStatus::Failure);
        assert_eq!(report.phases().len(), 1);
    }

    fn test_paths() -> PipelinePaths {
        let dir = std::env::temp_dir().join("nodeup-pipeline-test");
        PipelinePaths {
            automount: AutomountPaths {
                map_path: dir.join("auto.nodeup"),
                master_path: dir.join("nodeup.autofs"),
            },
            creds_dir: dir.join("creds"),
            manifest_path: dir.join("manifest.json"),
        }
    }
}
