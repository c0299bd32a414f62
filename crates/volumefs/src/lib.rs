//! Out-of-band file access for volumes with no live sandbox.
//!
//! The control plane never mounts a volume. Instead it pulls the current
//! metadata snapshot down with the replication tool, opens an embedded
//! filesystem against the snapshot and the volume's data prefix, performs
//! the operation, and pushes the mutated snapshot back in one-shot sync
//! mode.
//!
//! Convergence with a concurrently mounted sandbox is **eventual and
//! last-writer-wins at metadata-snapshot granularity**: whichever side
//! pushes `{vol}-meta/` last owns the result. Callers of this crate accept
//! that contract.

pub mod cache;
pub mod client;
pub mod engine;
pub mod error;
pub mod pool;
pub mod tools;

pub use client::{Client, ClientOptions};
pub use engine::{FileEntry, FileKind, FsEngine, ListDirResult};
pub use error::{FsError, FsResult};
pub use pool::Pool;
pub use tools::RestoreOutcome;
