//! Mount validator.
//!
//! Triggers each declared share with a bounded directory probe and
//! verifies the automounter actually mounted it. Shares are checked
//! sequentially on purpose: there is one host-wide automountd and
//! concurrent triggers contend on it.
//!
//! This is the containment boundary: nothing past this module may depend
//! on an unverified mount.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::ShareSpec;

/// Classification of one share's validation probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountStatus {
    /// The probe returned and the mount point is backed by a CIFS mount.
    Success,
    /// The probe did not return within the budget.
    Timeout,
    /// The probe returned but no mount appeared at the mount point.
    NotMounted,
}

/// Ephemeral per-share validation result; recomputed every run.
#[derive(Debug, Clone)]
pub struct MountResult {
    pub share: ShareSpec,
    pub mount_point: PathBuf,
    pub status: MountStatus,
    pub error: Option<String>,
}

impl MountResult {
    pub fn is_success(&self) -> bool {
        self.status == MountStatus::Success
    }
}

/// Aggregate over all declared shares.
#[derive(Debug, Clone)]
pub struct MountSummary {
    pub results: Vec<MountResult>,
}

impl MountSummary {
    pub fn succeeded(&self) -> impl Iterator<Item = &MountResult> {
        self.results.iter().filter(|r| r.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &MountResult> {
        self.results.iter().filter(|r| !r.is_success())
    }

    pub fn success_count(&self) -> usize {
        self.succeeded().count()
    }

    /// Every share failed: fatal, rollback is offered.
    pub fn total_failure(&self) -> bool {
        !self.results.is_empty() && self.success_count() == 0
    }

    /// Some but not all shares failed: run proceeds degraded.
    pub fn partial_failure(&self) -> bool {
        let n = self.success_count();
        n > 0 && n < self.results.len()
    }
}

/// What the bounded probe observed, before consulting the mount table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Returned,
    TimedOut,
    Failed,
}

/// Pure classification: probe observation + a /proc/mounts dump.
pub fn classify(outcome: ProbeOutcome, proc_mounts: &str, mount_point: &Path) -> MountStatus {
    match outcome {
        ProbeOutcome::TimedOut => MountStatus::Timeout,
        ProbeOutcome::Returned | ProbeOutcome::Failed => {
            if is_mounted(proc_mounts, mount_point) {
                MountStatus::Success
            } else {
                MountStatus::NotMounted
            }
        }
    }
}

/// True when `mount_point` appears as a mount in a /proc/mounts dump.
pub fn is_mounted(proc_mounts: &str, mount_point: &Path) -> bool {
    let needle = mount_point.to_string_lossy();
    proc_mounts.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let _device = fields.next();
        fields.next() == Some(needle.as_ref())
    })
}

/// Trigger one share by listing its mount point, bounded by `budget`.
async fn probe_share(mount_point: &Path, budget: Duration) -> (ProbeOutcome, Option<String>) {
    let listing = tokio::fs::read_dir(mount_point);
    match tokio::time::timeout(budget, listing).await {
        Ok(Ok(_)) => (ProbeOutcome::Returned, None),
        Ok(Err(e)) => (ProbeOutcome::Failed, Some(e.to_string())),
        Err(_) => (
            ProbeOutcome::TimedOut,
            Some(format!("no response within {:?}", budget)),
        ),
    }
}

/// Validate every declared share sequentially.
pub async fn validate_shares(
    shares: &[ShareSpec],
    mount_root: &Path,
    budget: Duration,
) -> MountSummary {
    let mut results = Vec::with_capacity(shares.len());

    for share in shares {
        let mount_point = share.mount_point(mount_root);
        tracing::info!(
            "[MountValidator] Probing '{}' at {:?} (budget {:?})",
            share.name,
            mount_point,
            budget
        );

        let (outcome, error) = probe_share(&mount_point, budget).await;
        let proc_mounts = tokio::fs::read_to_string("/proc/mounts")
            .await
            .unwrap_or_default();
        let status = classify(outcome, &proc_mounts, &mount_point);

        match &status {
            MountStatus::Success => {
                tracing::info!("[MountValidator] '{}' mounted", share.name);
            }
            MountStatus::Timeout => {
                tracing::warn!("[MountValidator] '{}' timed out", share.name);
            }
            MountStatus::NotMounted => {
                tracing::warn!(
                    "[MountValidator] '{}' did not mount: {}",
                    share.name,
                    error.as_deref().unwrap_or("unknown reason")
                );
            }
        }

        results.push(MountResult {
            share: share.clone(),
            mount_point,
            status,
            error,
        });
    }

    MountSummary { results }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthMode, NodeConfig};
    use crate::config::test_fixtures::SAMPLE;

    const MOUNTS: &str = "\
//nas.lan/movies /mnt/nodeup/movies cifs rw,relatime 0 0
//nas.lan/tv /mnt/nodeup/tv cifs rw,relatime 0 0
tmpfs /tmp tmpfs rw 0 0
";

    #[test]
    fn test_is_mounted() {
        assert!(is_mounted(MOUNTS, Path::new("/mnt/nodeup/movies")));
        assert!(!is_mounted(MOUNTS, Path::new("/mnt/nodeup/scratch")));
        // A prefix of a mounted path is not itself mounted.
        assert!(!is_mounted(MOUNTS, Path::new("/mnt/nodeup")));
    }

    #[test]
    fn test_classify() {
        let mp = Path::new("/mnt/nodeup/movies");
        assert_eq!(
            classify(ProbeOutcome::Returned, MOUNTS, mp),
            MountStatus::Success
        );
        assert_eq!(
            classify(ProbeOutcome::TimedOut, MOUNTS, mp),
            MountStatus::Timeout
        );
        assert_eq!(
            classify(ProbeOutcome::Returned, MOUNTS, Path::new("/mnt/nodeup/scratch")),
            MountStatus::NotMounted
        );
        // A failed listing can still be a live mount (permission denied on
        // a mounted share); the mount table is authoritative.
        assert_eq!(
            classify(ProbeOutcome::Failed, MOUNTS, mp),
            MountStatus::Success
        );
    }

    fn summary_with(statuses: &[MountStatus]) -> MountSummary {
        let config = NodeConfig::parse(SAMPLE).unwrap();
        let results = statuses
            .iter()
            .cloned()
            .enumerate()
            .map(|(i, status)| MountResult {
                share: config.shares[i % config.shares.len()].clone(),
                mount_point: PathBuf::from(format!("/mnt/nodeup/{}", i)),
                status,
                error: None,
            })
            .collect();
        MountSummary { results }
    }

    #[test]
    fn test_partial_and_total_failure() {
        let partial = summary_with(&[
            MountStatus::Success,
            MountStatus::Timeout,
            MountStatus::Success,
        ]);
        assert!(partial.partial_failure());
        assert!(!partial.total_failure());
        assert_eq!(partial.success_count(), 2);

        let total = summary_with(&[
            MountStatus::Timeout,
            MountStatus::NotMounted,
            MountStatus::Timeout,
        ]);
        assert!(total.total_failure());
        assert!(!total.partial_failure());

        let clean = summary_with(&[MountStatus::Success, MountStatus::Success]);
        assert!(!clean.total_failure());
        assert!(!clean.partial_failure());
    }

    #[tokio::test]
    async fn test_validate_against_local_directories() {
        // Plain directories list fine but are not mounts: NotMounted.
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::parse(SAMPLE).unwrap();
        config.shares.truncate(1);
        config.shares[0].auth = AuthMode::Guest;
        std::fs::create_dir_all(dir.path().join("movies")).unwrap();

        let summary =
            validate_shares(&config.shares, dir.path(), Duration::from_secs(2)).await;
        assert_eq!(summary.results.len(), 1);
        assert_eq!(summary.results[0].status, MountStatus::NotMounted);
        assert!(summary.total_failure());
    }
}
