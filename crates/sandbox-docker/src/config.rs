use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "python:3.12-slim";

/// Connection and runtime settings for [`crate::ContainerSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DockerConfig {
    /// Engine socket. `None` uses the local defaults (`DOCKER_HOST` or
    /// `/var/run/docker.sock`).
    pub socket: Option<PathBuf>,
    /// Image every unit runs. Must already be present on the engine.
    pub image: String,
    /// Command prefix; the code is appended as the final argument.
    pub interpreter: Vec<String>,
    /// `uid:gid` the code runs as.
    pub user: String,
    /// Engine API request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            socket: None,
            image: DEFAULT_IMAGE.to_owned(),
            interpreter: vec!["python3".to_owned(), "-c".to_owned()],
            user: "65534:65534".to_owned(),
            request_timeout_secs: 120,
        }
    }
}
