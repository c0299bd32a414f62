//! Everything that runs against one sandbox VM's volume session.
//!
//! - [`mount`]: the restore / format-if-fresh / replicate / FUSE-mount
//!   pipeline and its graceful teardown
//! - [`api`]: the in-VM `POST /shutdown` endpoint
//! - [`proxy`]: the in-netns object-store access proxy
//! - [`minter`]: downscoped-token minting, used by the orchestrator before
//!   the VM boots

pub mod api;
pub mod error;
pub mod minter;
pub mod mount;
pub mod proxy;

pub use error::{AgentError, AgentResult, MountStage};
pub use minter::{DownscopedToken, MintError, TokenMinter};
pub use mount::{MountConfig, MountRegistry, Mounter, ToolPaths};
pub use proxy::{FileTokenProvider, Proxy, ProxyConfig, TokenProvider};
