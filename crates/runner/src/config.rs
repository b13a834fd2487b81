use std::path::Path;

use sandbox::{NetworkMode, Preset, ResourceLimits};
use sandbox_docker::DockerConfig;
use sandbox_k8s::KubernetesConfig;
use serde::Deserialize;
use tracing::info;

use crate::error::{RunnerError, RunnerResult};

/// Which backend runs the code, with its settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendSettings {
    Docker(DockerConfig),
    Kubernetes(KubernetesConfig),
}

impl BackendSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Docker(_) => "docker",
            Self::Kubernetes(_) => "kubernetes",
        }
    }
}

/// A loaded settings file with its limits already validated.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub backend: BackendSettings,
    pub limits: ResourceLimits,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsFile {
    backend: BackendSettings,
    #[serde(default)]
    limits: LimitsSection,
}

/// A preset plus per-field overrides. Without a preset the production
/// limits are the base.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LimitsSection {
    preset: Option<Preset>,
    timeout_seconds: Option<u32>,
    memory_limit_mb: Option<u32>,
    cpu_quota: Option<f64>,
    disk_quota_mb: Option<u32>,
    max_processes: Option<u32>,
    network_mode: Option<NetworkMode>,
    allowed_domains: Option<Vec<String>>,
}

impl LimitsSection {
    fn resolve(self) -> sandbox::Result<ResourceLimits> {
        let mut builder = self.preset.unwrap_or(Preset::Production).limits().to_builder();
        if let Some(v) = self.timeout_seconds {
            builder = builder.timeout_seconds(v);
        }
        if let Some(v) = self.memory_limit_mb {
            builder = builder.memory_limit_mb(v);
        }
        if let Some(v) = self.cpu_quota {
            builder = builder.cpu_quota(v);
        }
        if let Some(v) = self.disk_quota_mb {
            builder = builder.disk_quota_mb(v);
        }
        if let Some(v) = self.max_processes {
            builder = builder.max_processes(v);
        }
        if let Some(v) = self.network_mode {
            builder = builder.network_mode(v);
        }
        if let Some(v) = self.allowed_domains {
            builder = builder.allowed_domains(v);
        }
        builder.build()
    }
}

/// Load and validate settings from a YAML file.
///
/// A relative Docker socket path is resolved against the file's parent
/// directory.
pub async fn load(path: &Path) -> RunnerResult<Settings> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| RunnerError::Config(format!("read {}: {e}", path.display())))?;
    let mut file: SettingsFile = serde_yaml_ng::from_str(&content)
        .map_err(|e| RunnerError::Config(format!("parse {}: {e}", path.display())))?;

    if let (BackendSettings::Docker(docker), Some(config_dir)) = (&mut file.backend, path.parent())
        && let Some(socket) = &mut docker.socket
        && socket.is_relative()
    {
        *socket = config_dir.join(&*socket);
    }

    let limits = file
        .limits
        .resolve()
        .map_err(|e| RunnerError::Config(format!("{}: {e}", path.display())))?;

    info!(
        path = %path.display(),
        backend = file.backend.kind(),
        timeout_secs = limits.timeout_seconds(),
        network = %limits.network_mode(),
        "settings loaded"
    );
    Ok(Settings {
        backend: file.backend,
        limits,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    async fn load_yaml(yaml: &str) -> RunnerResult<Settings> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.yaml");
        tokio::fs::write(&path, yaml).await.unwrap();
        load(&path).await
    }

    #[tokio::test]
    async fn load_docker_settings() {
        let settings = load_yaml(
            r#"
backend:
  kind: docker
  socket: /var/run/docker.sock
  image: python:3.11-slim
  interpreter: ["python3", "-u", "-c"]
limits:
  preset: testing
"#,
        )
        .await
        .unwrap();

        assert_eq!(
            settings.backend,
            BackendSettings::Docker(DockerConfig {
                socket: Some(PathBuf::from("/var/run/docker.sock")),
                image: "python:3.11-slim".to_owned(),
                interpreter: vec!["python3".into(), "-u".into(), "-c".into()],
                ..DockerConfig::default()
            })
        );
        assert_eq!(settings.limits, ResourceLimits::testing());
    }

    #[tokio::test]
    async fn load_kubernetes_settings() {
        let settings = load_yaml(
            r#"
backend:
  kind: kubernetes
  namespace: sandboxes
  ttl_seconds_after_finished: 60
"#,
        )
        .await
        .unwrap();

        assert_eq!(
            settings.backend,
            BackendSettings::Kubernetes(KubernetesConfig {
                namespace: "sandboxes".to_owned(),
                ttl_seconds_after_finished: 60,
                ..KubernetesConfig::default()
            })
        );
        assert_eq!(settings.backend.kind(), "kubernetes");
    }

    #[tokio::test]
    async fn missing_limits_section_means_production() {
        let settings = load_yaml("backend:\n  kind: docker\n").await.unwrap();
        assert_eq!(settings.limits, ResourceLimits::production());
    }

    #[tokio::test]
    async fn overrides_apply_on_top_of_preset() {
        let settings = load_yaml(
            r#"
backend:
  kind: docker
limits:
  preset: data_processing
  timeout_seconds: 120
  max_processes: 8
"#,
        )
        .await
        .unwrap();

        let base = ResourceLimits::data_processing();
        assert_eq!(settings.limits.timeout_seconds(), 120);
        assert_eq!(settings.limits.max_processes(), 8);
        assert_eq!(settings.limits.memory_limit_mb(), base.memory_limit_mb());
        assert_eq!(settings.limits.cpu_quota(), base.cpu_quota());
    }

    #[tokio::test]
    async fn allowlist_domains_are_normalized() {
        let settings = load_yaml(
            r#"
backend:
  kind: docker
limits:
  network_mode: allowlist
  allowed_domains: [PyPI.org, " files.pythonhosted.org"]
"#,
        )
        .await
        .unwrap();

        assert_eq!(settings.limits.network_mode(), NetworkMode::Allowlist);
        let domains: Vec<_> = settings.limits.allowed_domains().iter().cloned().collect();
        assert_eq!(domains, ["files.pythonhosted.org", "pypi.org"]);
    }

    #[tokio::test]
    async fn out_of_range_limits_are_rejected() {
        let err = load_yaml(
            r#"
backend:
  kind: docker
limits:
  timeout_seconds: 600
  cpu_quota: 0
"#,
        )
        .await
        .unwrap_err();

        let message = err.to_string();
        assert!(message.contains("timeout_seconds"), "got: {message}");
        assert!(message.contains("cpu_quota"), "got: {message}");
    }

    #[tokio::test]
    async fn unknown_backend_kind_is_rejected() {
        let err = load_yaml("backend:\n  kind: firecracker\n").await.unwrap_err();
        assert!(matches!(err, RunnerError::Config(_)), "got: {err}");
    }

    #[tokio::test]
    async fn unknown_fields_are_rejected() {
        let err = load_yaml("backend:\n  kind: docker\n  imgae: python\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("imgae"), "got: {err}");

        let err = load_yaml("backend:\n  kind: docker\nlimits:\n  timeout: 5\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timeout"), "got: {err}");
    }

    #[tokio::test]
    async fn unknown_preset_is_rejected() {
        let err = load_yaml("backend:\n  kind: docker\nlimits:\n  preset: staging\n")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("staging"), "got: {err}");
    }

    #[tokio::test]
    async fn load_resolves_relative_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sandbox.yaml");
        tokio::fs::write(&path, "backend:\n  kind: docker\n  socket: run/docker.sock\n")
            .await
            .unwrap();

        let settings = load(&path).await.unwrap();
        assert_eq!(
            settings.backend,
            BackendSettings::Docker(DockerConfig {
                socket: Some(dir.path().join("run/docker.sock")),
                ..DockerConfig::default()
            })
        );
    }

    #[tokio::test]
    async fn load_fails_on_missing_file() {
        let err = load(Path::new("/nonexistent/sandbox.yaml")).await.unwrap_err();
        assert!(err.to_string().contains("read /nonexistent/sandbox.yaml"), "got: {err}");
    }
}
