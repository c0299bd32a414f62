//! Core domain types and shared logic for the Cistern volume subsystem.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Volume identifiers and the volume name grammar
//! - Volume and sandbox-run lifecycle statuses
//! - Lifecycle events and the delivery seam
//! - Mount-path validation for sandbox-attached volumes
//! - The application configuration model

pub mod config;
pub mod error;
pub mod events;
pub mod mount_path;
pub mod run;
pub mod volume;

pub use error::{Error, Result};
pub use events::{EventDelivery, NoopDelivery, SandboxEvent, VolumeEvent};
pub use mount_path::validate_mount_path;
pub use run::{EndReason, RunStatus};
pub use volume::{VolumeId, VolumeStatus, validate_volume_name};

/// Default limit for volume listings.
pub const DEFAULT_LIST_LIMIT: i64 = 100;

/// Maximum limit for volume and sandbox-run listings.
pub const MAX_LIST_LIMIT: i64 = 100;

/// Default page size for file listings.
pub const DEFAULT_FILE_LIST_LIMIT: usize = 100;

/// Maximum page size for file listings.
pub const MAX_FILE_LIST_LIMIT: usize = 1000;
