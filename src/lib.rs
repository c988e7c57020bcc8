//! nodeup: provisioning orchestrator for containerized transcode worker
//! nodes.
//!
//! Probes the host, resolves a container engine, installs dependencies,
//! configures on-demand CIFS automounts, validates them, and deploys the
//! worker container. Runs are idempotent: repeated invocations converge
//! instead of duplicating work.

pub mod automount;
pub mod command;
pub mod config;
pub mod credentials;
pub mod engine;
pub mod error;
pub mod launch;
pub mod manifest;
pub mod mounts;
pub mod pipeline;
pub mod pkg;
pub mod probe;
pub mod report;
pub mod retry;

pub use config::{AuthMode, NodeConfig, ShareSpec};
pub use engine::{EngineChoice, EngineKind};
pub use error::ProvisionError;
pub use manifest::DeploymentManifest;
pub use pipeline::{PipelinePaths, ProvisionOptions};
pub use probe::{DistroFamily, HostProfile};
pub use report::{RunReport, RunStatus};
