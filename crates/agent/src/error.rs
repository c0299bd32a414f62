//! Agent error types.

use thiserror::Error;

/// Stage of the mount pipeline, carried on every stage failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountStage {
    WriteToken,
    Restore,
    Format,
    JournalMode,
    StartReplication,
    Mount,
    Verify,
    Unmount,
    Checkpoint,
    StopReplication,
}

impl MountStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WriteToken => "write_token",
            Self::Restore => "restore",
            Self::Format => "format",
            Self::JournalMode => "journal_mode",
            Self::StartReplication => "start_replication",
            Self::Mount => "mount",
            Self::Verify => "verify",
            Self::Unmount => "unmount",
            Self::Checkpoint => "checkpoint",
            Self::StopReplication => "stop_replication",
        }
    }
}

impl std::fmt::Display for MountStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mount agent errors.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("mount stage {stage} failed: {message}")]
    Stage { stage: MountStage, message: String },

    #[error("a volume is already mounted in this VM")]
    AlreadyMounted,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Wrap a message with its pipeline stage.
    pub fn stage(stage: MountStage, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }
}

/// Result type for agent operations.
pub type AgentResult<T> = std::result::Result<T, AgentError>;
