//! Kubernetes backend: one locked-down, run-once Job per execution.

mod config;
mod job;
mod sandbox;

pub use config::{DEFAULT_IMAGE, KubernetesConfig};
pub use job::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, NETWORK_LABEL, UNIT_LABEL};
pub use sandbox::OrchestratorSandbox;
