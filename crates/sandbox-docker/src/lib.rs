//! Docker backend: one hardened, throwaway container per execution.

mod config;
mod container;
mod sandbox;

pub use config::{DEFAULT_IMAGE, DockerConfig};
pub use container::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, UNIT_LABEL};
pub use sandbox::ContainerSandbox;
