use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    CreateContainerOptions, InspectContainerOptions, KillContainerOptions, ListContainersOptions,
    LogOutput, LogsOptions, RemoveContainerOptions, StartContainerOptions, StatsOptions,
    StopContainerOptions, WaitContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::{API_DEFAULT_VERSION, Docker};
use futures_util::StreamExt;
use tokio::time::MissedTickBehavior;
use sandbox::output::SplitOutput;
use sandbox::unit::{Stopwatch, enforceable_network, reject_blank, unit_name, whole_millis};
use sandbox::{
    ExecutionResult, MetricsSink, NetworkMode, ResourceLimits, Sandbox, SandboxError,
    TIMEOUT_EXIT_CODE, TracingMetrics, telemetry,
};
use tracing::{debug, info, warn};

use crate::config::DockerConfig;
use crate::container::{MANAGED_BY_LABEL, MANAGED_BY_VALUE, container_config};

const BACKEND: &str = "docker";

const UNIT_PREFIX: &str = "sandbox";

/// Grace period handed to the engine's stop before it kills the unit.
const STOP_GRACE_SECS: i64 = 2;

/// Added to the execution timeout so the engine client never gives up on a
/// wait call before our own deadline fires.
const REQUEST_TIMEOUT_MARGIN_SECS: u64 = 30;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

const MEMORY_SAMPLE_INTERVAL: Duration = Duration::from_millis(500);

/// Runs each `execute()` call in a fresh, hardened container.
///
/// Unit lifecycle: created -> running -> {succeeded | failed | timed out} ->
/// removed. The engine client is a cheap-clone handle with no per-call state,
/// so one sandbox can serve concurrent calls.
pub struct ContainerSandbox {
    docker: Docker,
    config: DockerConfig,
    limits: ResourceLimits,
    network: NetworkMode,
    metrics: Arc<dyn MetricsSink>,
}

impl ContainerSandbox {
    /// Connect to the engine and check that the image is present.
    ///
    /// Fails fast on an unsupported network policy, an unreachable engine or
    /// a missing image.
    pub async fn connect(config: DockerConfig, limits: ResourceLimits) -> sandbox::Result<Self> {
        enforceable_network(&limits)?;

        let request_timeout = config
            .request_timeout_secs
            .max(u64::from(limits.timeout_seconds()) + REQUEST_TIMEOUT_MARGIN_SECS);
        let docker = match &config.socket {
            Some(path) => Docker::connect_with_socket(
                &path.to_string_lossy(),
                request_timeout,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_local_defaults()
                .map(|docker| docker.with_timeout(Duration::from_secs(request_timeout))),
        }
        .map_err(|e| SandboxError::BackendNotAvailable(format!("docker client: {e}")))?;

        docker
            .ping()
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("docker ping: {e}")))?;

        match docker.inspect_image(&config.image).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {
                return Err(SandboxError::ImageNotAvailable(config.image.clone()));
            }
            Err(e) => {
                return Err(SandboxError::BackendNotAvailable(format!(
                    "inspect image {}: {e}",
                    config.image
                )));
            }
        }

        info!(image = %config.image, "docker sandbox ready");
        Self::with_client(docker, config, limits)
    }

    /// Wrap an existing engine client without contacting it.
    pub fn with_client(
        docker: Docker,
        config: DockerConfig,
        limits: ResourceLimits,
    ) -> sandbox::Result<Self> {
        let network = enforceable_network(&limits)?;
        Ok(Self {
            docker,
            config,
            limits,
            network,
            metrics: Arc::new(TracingMetrics),
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsSink>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Remove every container created by this crate that is older than
    /// `max_age`, including ones orphaned by a crashed caller. Returns how
    /// many were swept.
    pub async fn sweep_stale(&self, max_age: Duration) -> sandbox::Result<usize> {
        let filters = HashMap::from([(
            "label".to_owned(),
            vec![format!("{MANAGED_BY_LABEL}={MANAGED_BY_VALUE}")],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| SandboxError::BackendNotAvailable(format!("list containers: {e}")))?;

        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(max_age);

        let mut swept = 0;
        for container in containers {
            let (Some(id), Some(created)) = (container.id, container.created) else {
                continue;
            };
            if created > cutoff {
                continue;
            }
            self.cleanup(&id).await;
            swept += 1;
        }
        info!(swept, "stale containers swept");
        Ok(swept)
    }

    async fn run(&self, id: &str, stopwatch: Stopwatch) -> sandbox::Result<ExecutionResult> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| SandboxError::StartFailed(format!("start container {id}: {e}")))?;
        debug!(id, "container running");

        // The deadline runs from the start of provisioning, the same origin
        // as `execution_time`.
        let remaining = self.limits.timeout().saturating_sub(stopwatch.elapsed());
        let mut peak_memory = None;
        match tokio::time::timeout(remaining, self.watch_exit(id, &mut peak_memory)).await {
            Ok(exit) => {
                let exit_code = exit?;
                let output = self.collect_output(id, exit_code).await;
                let elapsed = stopwatch.elapsed();
                info!(id, exit_code, elapsed_ms = whole_millis(elapsed), "container exited");
                Ok(
                    ExecutionResult::completed(output.stdout, output.stderr, exit_code, elapsed)
                        .with_memory_used_mb(peak_memory),
                )
            }
            Err(_) => {
                let elapsed = stopwatch.elapsed();
                warn!(id, timeout_secs = self.limits.timeout_seconds(), "execution timed out");
                let memory_used_mb = higher(peak_memory, self.sample_memory(id).await);
                self.stop(id).await;
                let output = self.collect_output(id, TIMEOUT_EXIT_CODE).await;
                Ok(ExecutionResult::timeout(
                    output.stdout,
                    output.stderr,
                    self.limits.timeout_seconds(),
                    elapsed,
                )
                .with_memory_used_mb(memory_used_mb))
            }
        }
    }

    /// Wait for exit, sampling memory while the unit is still running. With
    /// cgroup v2 the engine reports no usage for a stopped container, so a
    /// sample taken after exit is usually empty.
    async fn watch_exit(&self, id: &str, peak_memory: &mut Option<f64>) -> sandbox::Result<i64> {
        let mut exit = std::pin::pin!(self.wait_exit(id));
        let mut ticks = tokio::time::interval(MEMORY_SAMPLE_INTERVAL);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                code = &mut exit => return code,
                _ = ticks.tick() => {
                    *peak_memory = higher(*peak_memory, self.sample_memory(id).await);
                }
            }
        }
    }

    async fn wait_exit(&self, id: &str) -> sandbox::Result<i64> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut wait = std::pin::pin!(self.docker.wait_container(id, Some(options)));
        match wait.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            // The client reports non-zero exits as an error carrying the code.
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(e)) => Err(SandboxError::ExecFailed(format!("wait container {id}: {e}"))),
            None => Err(SandboxError::ExecFailed(format!(
                "wait container {id}: no exit status"
            ))),
        }
    }

    /// Best-effort memory reading in MB: the engine's recorded peak where it
    /// keeps one (cgroup v1), current usage otherwise. Errors only drop the
    /// sample.
    async fn sample_memory(&self, id: &str) -> Option<f64> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stats = std::pin::pin!(self.docker.stats(id, Some(options)));
        match stats.next().await {
            Some(Ok(sample)) => {
                let bytes = sample.memory_stats.max_usage.or(sample.memory_stats.usage)?;
                Some(bytes as f64 / BYTES_PER_MB)
            }
            Some(Err(e)) => {
                debug!(id, error = %e, "memory sample unavailable");
                None
            }
            None => None,
        }
    }

    /// Read both log streams. Multiplexed frames keep their stream; merged
    /// console frames go through the shared attribution heuristic.
    async fn collect_output(&self, id: &str, exit_code: i64) -> SplitOutput {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: "all".to_owned(),
            ..Default::default()
        };
        let mut logs = std::pin::pin!(self.docker.logs(id, Some(options)));
        let mut output = SplitOutput::default();
        while let Some(frame) = logs.next().await {
            match frame {
                Ok(LogOutput::StdOut { message }) => {
                    output.stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    output.stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::Console { message }) => {
                    output.push_merged(&String::from_utf8_lossy(&message), exit_code);
                }
                Ok(LogOutput::StdIn { .. }) => {}
                Err(e) => {
                    warn!(id, error = %e, "failed to read container logs");
                    break;
                }
            }
        }
        output
    }

    /// Graceful stop, falling back to kill.
    async fn stop(&self, id: &str) {
        let options = StopContainerOptions { t: STOP_GRACE_SECS };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => debug!(id, "container stopped"),
            Err(e) if is_gone(&e) => {}
            Err(e) => {
                warn!(id, error = %e, "graceful stop failed, killing");
                if let Err(e) = self
                    .docker
                    .kill_container(id, None::<KillContainerOptions<String>>)
                    .await
                    && !is_gone(&e)
                {
                    warn!(id, error = %e, "failed to kill container");
                }
            }
        }
    }

    /// Idempotent teardown. Never fails; problems are logged and counted.
    async fn cleanup(&self, id: &str) {
        match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(details) => {
                if details.state.and_then(|s| s.running).unwrap_or(false) {
                    self.stop(id).await;
                }
            }
            Err(e) if is_gone(&e) => {
                debug!(id, "container already gone");
                return;
            }
            Err(e) => warn!(id, error = %e, "failed to inspect container before removal"),
        }

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(id, Some(options)).await {
            Ok(()) => info!(id, "container removed"),
            // 409: removal already in progress.
            Err(e) if is_gone(&e) || status_code(&e) == Some(409) => {
                debug!(id, "container already gone");
            }
            Err(e) => {
                warn!(id, error = %e, "failed to remove container");
                telemetry::record_cleanup_failure(self.metrics.as_ref(), BACKEND);
            }
        }
    }
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    fn backend(&self) -> &str {
        BACKEND
    }

    fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    async fn execute(&self, code: &str) -> sandbox::Result<ExecutionResult> {
        if let Some(rejected) = reject_blank(code) {
            debug!("empty input, nothing provisioned");
            return Ok(rejected);
        }

        let stopwatch = Stopwatch::start();
        let id = unit_name(UNIT_PREFIX, code);
        let container = container_config(&id, code, &self.limits, self.network, &self.config);
        let options = CreateContainerOptions {
            name: id.clone(),
            platform: None,
        };

        if let Err(e) = self.docker.create_container(Some(options), container).await {
            // A timed-out create can still leave a unit behind.
            self.cleanup(&id).await;
            return Err(if is_not_found(&e) {
                SandboxError::ImageNotAvailable(self.config.image.clone())
            } else {
                SandboxError::CreationFailed(format!("create container {id}: {e}"))
            });
        }
        info!(id = %id, image = %self.config.image, "container created");

        let outcome = self.run(&id, stopwatch).await;
        self.cleanup(&id).await;

        if let Ok(result) = &outcome {
            telemetry::record_execution(self.metrics.as_ref(), BACKEND, result);
        }
        outcome
    }
}

fn higher(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    a.into_iter().chain(b).reduce(f64::max)
}

fn status_code(e: &DockerError) -> Option<u16> {
    match e {
        DockerError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

fn is_not_found(e: &DockerError) -> bool {
    status_code(e) == Some(404)
}

/// 404: no such container. 304: already stopped.
fn is_gone(e: &DockerError) -> bool {
    matches!(status_code(e), Some(304 | 404))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    /// Plain-HTTP client aimed at a port nothing listens on. Building it
    /// never touches the network.
    fn unreachable_client() -> Docker {
        Docker::connect_with_http("http://127.0.0.1:9", 1, API_DEFAULT_VERSION).unwrap()
    }

    fn allowlist_limits() -> ResourceLimits {
        ResourceLimits::builder()
            .network_mode(NetworkMode::Allowlist)
            .allowed_domains(["pypi.org"])
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn empty_code_never_touches_backend() {
        let sandbox = ContainerSandbox::with_client(
            unreachable_client(),
            DockerConfig::default(),
            ResourceLimits::testing(),
        )
        .unwrap();

        let result = sandbox.execute("  \n").await.unwrap();
        assert!(!result.success());
        assert!(result.error_message().unwrap().contains("empty input"));
    }

    #[tokio::test]
    async fn unreachable_engine_is_a_setup_error() {
        let sandbox = ContainerSandbox::with_client(
            unreachable_client(),
            DockerConfig::default(),
            ResourceLimits::testing(),
        )
        .unwrap();

        let err = sandbox.execute("print(1)").await.unwrap_err();
        assert!(matches!(err, SandboxError::CreationFailed(_)), "got: {err}");
    }

    #[tokio::test]
    async fn connect_fails_fast_without_engine() {
        let config = DockerConfig {
            socket: Some(PathBuf::from("/nonexistent/sandbox-docker.sock")),
            request_timeout_secs: 1,
            ..DockerConfig::default()
        };
        let err = ContainerSandbox::connect(config, ResourceLimits::testing())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::BackendNotAvailable(_)), "got: {err}");
    }

    #[tokio::test]
    async fn allowlist_is_refused_before_connecting() {
        let config = DockerConfig {
            socket: Some(PathBuf::from("/nonexistent/sandbox-docker.sock")),
            ..DockerConfig::default()
        };
        let err = ContainerSandbox::connect(config, allowlist_limits())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SandboxError::UnsupportedNetwork(_)), "got: {err}");
    }

    #[tokio::test]
    async fn with_client_refuses_allowlist() {
        let err = ContainerSandbox::with_client(
            unreachable_client(),
            DockerConfig::default(),
            allowlist_limits(),
        )
        .err()
        .unwrap();
        assert!(err.is_config_error());
    }

    #[test]
    fn peak_memory_keeps_the_highest_sample() {
        assert_eq!(higher(None, None), None);
        assert_eq!(higher(Some(3.0), None), Some(3.0));
        assert_eq!(higher(None, Some(2.0)), Some(2.0));
        assert_eq!(higher(Some(3.0), Some(5.5)), Some(5.5));
    }

    #[test]
    fn gone_statuses() {
        let not_found = DockerError::DockerResponseServerError {
            status_code: 404,
            message: "No such container".into(),
        };
        let not_modified = DockerError::DockerResponseServerError {
            status_code: 304,
            message: String::new(),
        };
        let conflict = DockerError::DockerResponseServerError {
            status_code: 409,
            message: "removal in progress".into(),
        };
        assert!(is_gone(&not_found));
        assert!(is_not_found(&not_found));
        assert!(is_gone(&not_modified));
        assert!(!is_gone(&conflict));
        assert_eq!(status_code(&conflict), Some(409));
    }
}
