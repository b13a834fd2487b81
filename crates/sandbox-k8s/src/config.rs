use serde::{Deserialize, Serialize};

pub const DEFAULT_IMAGE: &str = "python:3.12-slim";

/// Connection and runtime settings for [`crate::OrchestratorSandbox`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KubernetesConfig {
    /// Namespace jobs are created in. Must exist.
    pub namespace: String,
    pub image: String,
    /// Command prefix; the code is appended as the final argument.
    pub interpreter: Vec<String>,
    /// Server-side retention of finished jobs (`ttlSecondsAfterFinished`).
    /// Jobs are deleted explicitly after every call; this only matters when
    /// the calling process dies first.
    pub ttl_seconds_after_finished: i32,
    /// Non-root uid/gid the pod runs as.
    pub run_as_user: i64,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_owned(),
            image: DEFAULT_IMAGE.to_owned(),
            interpreter: vec!["python3".to_owned(), "-c".to_owned()],
            ttl_seconds_after_finished: 300,
            run_as_user: 65534,
        }
    }
}
