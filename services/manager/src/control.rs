//! Control socket address derivation.
//!
//! The daemon control surface itself lives upstream; this module is the one
//! piece the manager owns: deriving the platform control-socket address and
//! creating the unix listener with the right permissions. The derivation is
//! pure given its inputs (install status, effective uid, tmp dir).

use std::path::Path;

use sha2::{Digest, Sha256};

/// Fixed control socket address when the agent is installed and the manager
/// runs as root.
pub const CONTROL_SOCKET_ROOT: &str = "unix:///run/foreman.sock";

/// Fixed control socket address when the agent is installed but the manager
/// runs unprivileged.
pub const CONTROL_SOCKET_UNPRIVILEGED: &str = "unix:///run/foreman/foreman.sock";

/// Unix socket paths must fit in sockaddr_un; anything at or above this
/// length needs the hashed fallback.
const MAX_SOCKET_PATH_LEN: usize = 104;

/// Derive the control socket address.
///
/// Installed agents use a fixed path depending on privilege. Otherwise the
/// address lives under the tmp dir; when that path would not fit in a
/// sockaddr it falls back to `/tmp/foreman/<sha256 of the original>.sock`,
/// which stays short while remaining unique per original location.
pub fn control_address(installed: bool, root: bool, tmp_dir: &Path) -> String {
    if installed {
        if root {
            return CONTROL_SOCKET_ROOT.to_string();
        }
        return CONTROL_SOCKET_UNPRIVILEGED.to_string();
    }

    let address = format!(
        "unix://{}.sock",
        tmp_dir.join("foreman-control").display()
    );
    if address.len() < MAX_SOCKET_PATH_LEN {
        return address;
    }

    let digest = Sha256::digest(address.as_bytes());
    format!("unix:///tmp/foreman/{}.sock", hex::encode(digest))
}

/// Create the control listener for a `unix://` address.
///
/// Removes a stale socket file, creates the parent directory, binds, and
/// tightens permissions to 0700 when root (0770 otherwise, allowing group
/// access). The listener is closed again if permissions cannot be set.
#[cfg(unix)]
pub fn create_control_listener(
    address: &str,
    root: bool,
) -> std::io::Result<tokio::net::UnixListener> {
    use std::os::unix::fs::PermissionsExt;

    let path = Path::new(address.strip_prefix("unix://").unwrap_or(address));

    if path.exists() {
        let _ = std::fs::remove_file(path);
    }
    if let Some(dir) = path.parent() {
        if !dir.exists() {
            std::fs::create_dir_all(dir)?;
        }
    }

    let listener = tokio::net::UnixListener::bind(path)?;

    let mode = if root { 0o700 } else { 0o770 };
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        drop(listener);
        let _ = std::fs::remove_file(path);
        return Err(err);
    }

    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn installed_addresses_are_fixed() {
        let tmp = PathBuf::from("/tmp");
        assert_eq!(control_address(true, true, &tmp), CONTROL_SOCKET_ROOT);
        assert_eq!(
            control_address(true, false, &tmp),
            CONTROL_SOCKET_UNPRIVILEGED
        );
    }

    #[test]
    fn short_tmp_path_is_used_directly() {
        let addr = control_address(false, false, Path::new("/tmp/t"));
        assert_eq!(addr, "unix:///tmp/t/foreman-control.sock");
    }

    #[test]
    fn long_tmp_path_falls_back_to_hash() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(120)));
        let addr = control_address(false, false, &long);
        assert!(addr.starts_with("unix:///tmp/foreman/"));
        assert!(addr.ends_with(".sock"));
        assert!(addr.len() < MAX_SOCKET_PATH_LEN);

        // Deterministic: same input, same fallback.
        assert_eq!(addr, control_address(false, false, &long));

        // Distinct originals map to distinct fallbacks.
        let other = PathBuf::from(format!("/tmp/{}", "y".repeat(120)));
        assert_ne!(addr, control_address(false, false, &other));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn listener_is_created_with_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let addr = control_address(false, false, dir.path());
        let listener = create_control_listener(&addr, false).unwrap();

        let path = addr.strip_prefix("unix://").unwrap();
        let mode = std::fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o770);
        drop(listener);
    }
}
