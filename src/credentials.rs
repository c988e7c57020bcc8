//! Credential store manager.
//!
//! One owner-only file per remote server, rewritten only when its content
//! actually changes. Secrets come from the side config and go nowhere
//! else: not into the manifest, not into logs.

use std::io::Write as _;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};

use crate::config::CredentialConfig;
use crate::error::{ProvisionError, Result};

/// Owner read/write only.
const CREDENTIAL_MODE: u32 = 0o600;

/// Result of syncing one credential file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CredentialFile {
    pub server: String,
    pub path: PathBuf,
    pub changed: bool,
}

/// Render the mount.cifs credentials format for one record.
pub fn render_record(cred: &CredentialConfig) -> String {
    let mut out = String::new();
    out.push_str(&format!("username={}\n", cred.username));
    out.push_str(&format!("password={}\n", cred.password));
    if let Some(domain) = &cred.domain {
        out.push_str(&format!("domain={}\n", domain));
    }
    out
}

/// Path of the credential file for `server` under `dir`.
pub fn credential_path(dir: &Path, server: &str) -> PathBuf {
    dir.join(format!("{}.cred", server))
}

fn permission_denied(path: &Path, e: std::io::Error) -> ProvisionError {
    if e.kind() == std::io::ErrorKind::PermissionDenied {
        ProvisionError::CredentialWritePermissionDenied {
            path: path.to_path_buf(),
            reason: e.to_string(),
        }
    } else {
        ProvisionError::Io(e)
    }
}

/// Write (or leave untouched) the credential file for one record.
///
/// Content is compared byte-for-byte against the existing file; identical
/// content skips the write so a process holding the file open is not
/// disturbed. Mode bits are enforced on every run regardless.
pub fn sync_credential(dir: &Path, cred: &CredentialConfig) -> Result<CredentialFile> {
    std::fs::create_dir_all(dir).map_err(|e| permission_denied(dir, e))?;

    let path = credential_path(dir, &cred.server);
    let desired = render_record(cred);

    let existing = match std::fs::read(&path) {
        Ok(bytes) => Some(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => return Err(permission_denied(&path, e)),
    };

    let changed = existing.as_deref() != Some(desired.as_bytes());
    if changed {
        // The file must be owner-only from creation onward; a create with
        // umask-default bits followed by a chmod would expose the secret
        // between the two calls.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(CREDENTIAL_MODE)
            .open(&path)
            .map_err(|e| permission_denied(&path, e))?;
        file.write_all(desired.as_bytes())
            .map_err(|e| permission_denied(&path, e))?;
        tracing::info!(
            "[CredentialStore] Wrote credentials for '{}' to {:?}",
            cred.server,
            path
        );
    } else {
        tracing::debug!(
            "[CredentialStore] Credentials for '{}' unchanged, skipping write",
            cred.server
        );
    }

    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(CREDENTIAL_MODE))
        .map_err(|e| permission_denied(&path, e))?;

    Ok(CredentialFile {
        server: cred.server.clone(),
        path,
        changed,
    })
}

/// Sync every declared record. Returns per-file results in declaration
/// order; any failure aborts (security invariant, never a warning).
pub fn sync_all(dir: &Path, creds: &[CredentialConfig]) -> Result<Vec<CredentialFile>> {
    creds.iter().map(|c| sync_credential(dir, c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred(password: &str) -> CredentialConfig {
        CredentialConfig {
            server: "nas.lan".to_string(),
            username: "media".to_string(),
            password: password.to_string(),
            domain: Some("WORKGROUP".to_string()),
        }
    }

    #[test]
    fn test_render_record() {
        let rendered = render_record(&cred("hunter2"));
        assert_eq!(
            rendered,
            "username=media\npassword=hunter2\ndomain=WORKGROUP\n"
        );
    }

    #[test]
    fn test_render_without_domain() {
        let mut c = cred("pw");
        c.domain = None;
        assert_eq!(render_record(&c), "username=media\npassword=pw\n");
    }

    #[test]
    fn test_fresh_credential_file_is_owner_only() {
        let dir = tempfile::tempdir().unwrap();
        let first = sync_credential(dir.path(), &cred("pw")).unwrap();
        let mode = std::fs::metadata(&first.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_first_write_then_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let first = sync_credential(dir.path(), &cred("hunter2")).unwrap();
        assert!(first.changed);

        let second = sync_credential(dir.path(), &cred("hunter2")).unwrap();
        assert!(!second.changed);
        assert_eq!(first.path, second.path);
    }

    #[test]
    fn test_secret_change_rewrites_and_keeps_mode() {
        let dir = tempfile::tempdir().unwrap();
        sync_credential(dir.path(), &cred("old-secret")).unwrap();
        let result = sync_credential(dir.path(), &cred("new-secret")).unwrap();
        assert!(result.changed);

        let content = std::fs::read_to_string(&result.path).unwrap();
        assert!(content.contains("password=new-secret"));

        let mode = std::fs::metadata(&result.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_mode_enforced_even_when_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let first = sync_credential(dir.path(), &cred("pw")).unwrap();
        // Loosen the mode out-of-band; the next run must tighten it back.
        std::fs::set_permissions(&first.path, std::fs::Permissions::from_mode(0o644)).unwrap();
        sync_credential(dir.path(), &cred("pw")).unwrap();
        let mode = std::fs::metadata(&first.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
