//! Mount-path validation for sandbox-attached volumes.

use crate::error::{Error, Result};

/// Safe mount path prefixes. Paths must start with one of these and have at
/// least one component after the prefix.
pub const ALLOWED_MOUNT_PREFIXES: [&str; 4] = ["/workspace/", "/data/", "/mnt/", "/volumes/"];

/// Validate that a mount path is safe to hand to the in-VM agent.
///
/// The path must be absolute and canonical (no `..`, no `//`, no trailing
/// slash), start with an allowed prefix and name a subdirectory beneath it.
pub fn validate_mount_path(path: &str) -> Result<()> {
    if !path.starts_with('/') {
        return Err(Error::InvalidMountPath(
            "mount path must be absolute".to_string(),
        ));
    }

    if path.contains("..") || path.contains("//") || (path.len() > 1 && path.ends_with('/')) {
        return Err(Error::InvalidMountPath(
            "mount path must be canonical (no '..', '//' or trailing '/')".to_string(),
        ));
    }

    let prefix = ALLOWED_MOUNT_PREFIXES
        .iter()
        .find(|p| path.starts_with(**p))
        .ok_or_else(|| {
            Error::InvalidMountPath(format!(
                "mount path must start with one of {}",
                ALLOWED_MOUNT_PREFIXES.join(", ")
            ))
        })?;

    if path[prefix.len()..].is_empty() {
        return Err(Error::InvalidMountPath(
            "mount path must include a subdirectory after the prefix".to_string(),
        ));
    }

    Ok(())
}
