//! Volume identity, name grammar and lifecycle status.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Prefix that distinguishes volume ids from volume names.
pub const VOLUME_ID_PREFIX: &str = "vol_";

/// Maximum volume name length (inclusive).
pub const MAX_VOLUME_NAME_LEN: usize = 63;

/// Opaque volume identifier of the form `vol_<32 hex chars>`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VolumeId(String);

impl VolumeId {
    /// Generate a fresh volume id.
    pub fn generate() -> Self {
        Self(format!("{VOLUME_ID_PREFIX}{}", Uuid::new_v4().simple()))
    }

    /// Parse an id string, verifying the `vol_` prefix.
    pub fn parse(s: &str) -> Result<Self> {
        if !is_volume_id(s) {
            return Err(Error::InvalidVolumeId(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The filesystem-legal form of this id: underscores become hyphens.
    ///
    /// The FUSE filesystem only accepts alphanumerics and hyphens in volume
    /// names, so `vol_abc` is formatted as `vol-abc`.
    pub fn fs_name(&self) -> String {
        self.0.replace('_', "-")
    }
}

impl fmt::Display for VolumeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for VolumeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether an id-or-name argument refers to a volume by id.
pub fn is_volume_id(s: &str) -> bool {
    s.starts_with(VOLUME_ID_PREFIX)
}

/// Validate a volume name against the slug grammar
/// `^[a-z]([a-z0-9-]{0,61}[a-z0-9])?$`:
/// starts with a lowercase letter, continues with lowercase alphanumerics and
/// hyphens, ends with a lowercase alphanumeric, 1-63 characters total.
pub fn validate_volume_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    if bytes.is_empty() || bytes.len() > MAX_VOLUME_NAME_LEN {
        return Err(Error::InvalidVolumeName(format!(
            "name must be 1-{MAX_VOLUME_NAME_LEN} characters, got {}",
            bytes.len()
        )));
    }
    if !bytes[0].is_ascii_lowercase() {
        return Err(Error::InvalidVolumeName(
            "name must start with a lowercase letter".to_string(),
        ));
    }
    if bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        if !(last.is_ascii_lowercase() || last.is_ascii_digit()) {
            return Err(Error::InvalidVolumeName(
                "name must end with a lowercase letter or digit".to_string(),
            ));
        }
        for &b in &bytes[1..bytes.len() - 1] {
            if !(b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-') {
                return Err(Error::InvalidVolumeName(format!(
                    "name contains invalid character {:?}",
                    b as char
                )));
            }
        }
    }
    Ok(())
}

/// Volume lifecycle status.
///
/// Moves monotonically `creating -> available -> deleting`. A volume in any
/// state other than `available` must not be newly attached to a sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeStatus {
    Creating,
    Available,
    Deleting,
}

impl VolumeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Creating => "creating",
            Self::Available => "available",
            Self::Deleting => "deleting",
        }
    }

    /// Whether a volume in this state may be newly attached to a sandbox.
    pub fn is_attachable(&self) -> bool {
        matches!(self, Self::Available)
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "creating" => Ok(Self::Creating),
            "available" => Ok(Self::Available),
            "deleting" => Ok(Self::Deleting),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for VolumeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
