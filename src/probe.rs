//! Environment prober: classifies the host before anything mutates it.
//!
//! Produces a [`HostProfile`] that later phases receive by value. The
//! profile is computed fresh on every run and never persisted.

use std::path::Path;

use crate::error::ProvisionError;

/// Coarse classification of the host's package-management lineage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum DistroFamily {
    ArchLike,
    DebianLike,
    RpmLike,
    /// rpm-ostree based hosts with an immutable root (Fedora IoT/CoreOS).
    ImmutableOstree,
}

impl DistroFamily {
    pub fn as_str(self) -> &'static str {
        match self {
            DistroFamily::ArchLike => "arch-like",
            DistroFamily::DebianLike => "debian-like",
            DistroFamily::RpmLike => "rpm-like",
            DistroFamily::ImmutableOstree => "immutable-ostree",
        }
    }
}

/// Root filesystem mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FilesystemMode {
    Normal,
    ReadOnly,
}

/// Everything later phases need to know about the host.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct HostProfile {
    pub family: DistroFamily,
    pub package_manager: &'static str,
    pub has_systemd: bool,
    pub filesystem_mode: FilesystemMode,
    /// SELinux (or equivalent) is enforcing; bind mounts need relabeling.
    pub mac_enforcing: bool,
}

impl HostProfile {
    pub fn read_only_root(&self) -> bool {
        self.filesystem_mode == FilesystemMode::ReadOnly
    }
}

/// Map an os-release ID (or one of its ID_LIKE entries) to a family.
fn family_for_id(id: &str) -> Option<DistroFamily> {
    match id {
        "arch" | "archarm" | "manjaro" | "endeavouros" | "artix" => Some(DistroFamily::ArchLike),
        "debian" | "ubuntu" | "raspbian" | "linuxmint" | "pop" => Some(DistroFamily::DebianLike),
        "fedora" | "rhel" | "centos" | "rocky" | "almalinux" | "nobara" => {
            Some(DistroFamily::RpmLike)
        }
        _ => None,
    }
}

fn os_release_value<'a>(content: &'a str, key: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let rest = line.strip_prefix(key)?.strip_prefix('=')?;
        Some(rest.trim_matches('"'))
    })
}

/// Classify os-release content into a distro family.
///
/// `ID` is consulted first, then each entry of `ID_LIKE` in order. Hosts
/// with an ostree-managed root (VARIANT_ID or the ostree marker) classify
/// as `ImmutableOstree` even when their ID is rpm-lineage.
pub fn classify_os_release(content: &str, has_ostree: bool) -> Result<DistroFamily, ProvisionError> {
    let id = os_release_value(content, "ID").unwrap_or("");

    if has_ostree {
        // Only rpm-ostree hosts are supported among immutable variants.
        if family_for_id(id) == Some(DistroFamily::RpmLike)
            || matches!(id, "fedora-coreos" | "fedora-iot")
        {
            return Ok(DistroFamily::ImmutableOstree);
        }
    }

    if let Some(family) = family_for_id(id) {
        return Ok(family);
    }

    if let Some(id_like) = os_release_value(content, "ID_LIKE") {
        for like in id_like.split_whitespace() {
            if let Some(family) = family_for_id(like) {
                return Ok(family);
            }
        }
    }

    Err(ProvisionError::UnsupportedEnvironment(format!(
        "unrecognized distro id '{}' (and no usable ID_LIKE fallback)",
        id
    )))
}

/// True when the root mount in a /proc/mounts dump carries the `ro` flag.
pub fn root_is_read_only(proc_mounts: &str) -> bool {
    for line in proc_mounts.lines() {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        let mount_point = fields.next();
        let _fstype = fields.next();
        let options = fields.next();
        if mount_point == Some("/") {
            if let Some(options) = options {
                return options.split(',').any(|o| o == "ro");
            }
        }
    }
    false
}

fn package_manager_for(family: DistroFamily) -> &'static str {
    match family {
        DistroFamily::ArchLike => "pacman",
        DistroFamily::DebianLike => "apt-get",
        DistroFamily::RpmLike => "dnf",
        DistroFamily::ImmutableOstree => "rpm-ostree",
    }
}

/// Probe the live host.
///
/// Fails only with `UnsupportedEnvironment`; all secondary probes degrade
/// to conservative defaults when their source files are unreadable.
pub async fn probe_host() -> Result<HostProfile, ProvisionError> {
    let os_release = tokio::fs::read_to_string("/etc/os-release")
        .await
        .map_err(|e| {
            ProvisionError::UnsupportedEnvironment(format!("cannot read /etc/os-release: {}", e))
        })?;

    let has_ostree = Path::new("/run/ostree-booted").exists();
    let family = classify_os_release(&os_release, has_ostree)?;

    let proc_mounts = tokio::fs::read_to_string("/proc/mounts")
        .await
        .unwrap_or_default();
    let filesystem_mode = if root_is_read_only(&proc_mounts) {
        FilesystemMode::ReadOnly
    } else {
        FilesystemMode::Normal
    };

    let mac_enforcing = tokio::fs::read_to_string("/sys/fs/selinux/enforce")
        .await
        .map(|v| v.trim() == "1")
        .unwrap_or(false);

    let has_systemd = Path::new("/run/systemd/system").exists();

    let profile = HostProfile {
        family,
        package_manager: package_manager_for(family),
        has_systemd,
        filesystem_mode,
        mac_enforcing,
    };

    tracing::info!(
        "[Prober] family={} pkg={} systemd={} rootfs={:?} mac_enforcing={}",
        profile.family.as_str(),
        profile.package_manager,
        profile.has_systemd,
        profile.filesystem_mode,
        profile.mac_enforcing
    );

    Ok(profile)
}
