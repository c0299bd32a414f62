//! Sandbox-run ledger statuses.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of a sandbox run.
///
/// `end_reason` is set exactly when a run reaches `stopped`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a sandbox run ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Killed,
    Timeout,
    Error,
    Shutdown,
}

impl EndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Killed => "killed",
            Self::Timeout => "timeout",
            Self::Error => "error",
            Self::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "killed" => Ok(Self::Killed),
            "timeout" => Ok(Self::Timeout),
            "error" => Ok(Self::Error),
            "shutdown" => Ok(Self::Shutdown),
            other => Err(Error::InvalidStatus(other.to_string())),
        }
    }
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [RunStatus::Running, RunStatus::Paused, RunStatus::Stopped] {
            assert_eq!(RunStatus::parse(status.as_str()).unwrap(), status);
        }
    }

    #[test]
    fn end_reason_roundtrip() {
        for reason in [
            EndReason::Killed,
            EndReason::Timeout,
            EndReason::Error,
            EndReason::Shutdown,
        ] {
            assert_eq!(EndReason::parse(reason.as_str()).unwrap(), reason);
        }
        assert!(EndReason::parse("oom").is_err());
    }
}
