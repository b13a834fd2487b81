use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams};
use kube::Client;
use kube::config::{Config, KubeConfigOptions};
use sandbox::output::attribute_merged_output;
use sandbox::unit::{Stopwatch, enforceable_network, reject_blank, unit_name, whole_millis};
use sandbox::{
    ExecutionResult, GENERIC_FAILURE_EXIT_CODE, MetricsSink, NetworkMode, ResourceLimits, Sandbox,
    SandboxError, TracingMetrics, telemetry,
};
use tracing::{debug, info, warn};

use crate::config::KubernetesConfig;
use crate::job::{
    CONTAINER_NAME, JobPhase, deny_all_policy, image_pull_failure, job_manifest, job_phase,
    pod_exit_code, unit_selector,
};

const BACKEND: &str = "kubernetes";

const UNIT_PREFIX: &str = "sandbox";

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failed status reads tolerated before the call is abandoned.
const MAX_POLL_ERRORS: u32 = 3;

/// Runs each `execute()` call as a one-shot Job in a fixed namespace.
///
/// Unit lifecycle: created -> [network policy] -> job submitted -> {succeeded
/// | failed | deadline exceeded | image unpullable} -> logs fetched -> job and
/// policy deleted. `kube::Client` is a cheap-clone handle, so one sandbox can
/// serve concurrent calls.
pub struct OrchestratorSandbox {
    jobs: Api<Job>,
    pods: Api<Pod>,
    policies: Api<NetworkPolicy>,
    config: KubernetesConfig,
    limits: ResourceLimits,
    network: NetworkMode,
    metrics: Arc<dyn MetricsSink>,
}

impl OrchestratorSandbox {
    /// Connect using in-cluster credentials, falling back to the local
    /// kubeconfig, and check that the namespace exists.
    pub async fn connect(config: KubernetesConfig, limits: ResourceLimits) -> sandbox::Result<Self> {
        enforceable_network(&limits)?;

        let kube_config = match Config::incluster() {
            Ok(kube_config) => kube_config,
            Err(e) => {
                debug!(error = %e, "not in a cluster, reading kubeconfig");
                Config::from_kubeconfig(&KubeConfigOptions::default())
                    .await
                    .map_err(|e| SandboxError::BackendNotAvailable(format!("kubeconfig: {e}")))?
            }
        };
        let client = Client::try_from(kube_config)
            .map_err(|e| SandboxError::BackendNotAvailable(format!("kubernetes client: {e}")))?;

        verify_namespace(&client, &config.namespace).await?;

        info!(namespace = %config.namespace, image = %config.image, "kubernetes sandbox ready");
        Self::with_client(client, config, limits)
    }

    /// Wrap an existing client without contacting the cluster.
    pub fn with_client(
        client: Client,
        config: KubernetesConfig,
        limits: ResourceLimits,
    ) -> sandbox::Result<Self> {
        let network = enforceable_network(&limits)?;
        Ok(Self {
            jobs: Api::namespaced(client.clone(), &config.namespace),
            pods: Api::namespaced(client.clone(), &config.namespace),
            policies: Api::namespaced(client, &config.namespace),
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

    /// Poll the job until it finishes or the client deadline passes. Every
    /// API call is bounded by the time left.
    async fn supervise(&self, name: &str, stopwatch: Stopwatch) -> sandbox::Result<ExecutionResult> {
        let timeout = self.limits.timeout();
        let mut poll_errors = 0;

        loop {
            let remaining = timeout.saturating_sub(stopwatch.elapsed());
            if remaining.is_zero() {
                return Ok(self.timed_out(name, stopwatch));
            }

            let Ok(polled) = tokio::time::timeout(remaining, self.jobs.get(name)).await else {
                return Ok(self.timed_out(name, stopwatch));
            };
            match polled {
                Ok(job) => {
                    poll_errors = 0;
                    match job_phase(&job) {
                        JobPhase::Running => {
                            debug!(job = name, "job still running");
                            self.check_image(name, stopwatch).await?;
                        }
                        JobPhase::DeadlineExceeded => return Ok(self.timed_out(name, stopwatch)),
                        phase => return Ok(self.finish(name, phase, stopwatch).await),
                    }
                }
                Err(e) if is_not_found(&e) => {
                    warn!(job = name, "job disappeared while running");
                    return Ok(ExecutionResult::rejected(
                        format!("job {name} disappeared before reporting a result"),
                        stopwatch.elapsed(),
                    ));
                }
                Err(e) => {
                    poll_errors += 1;
                    warn!(job = name, error = %e, poll_errors, "failed to read job status");
                    if poll_errors >= MAX_POLL_ERRORS {
                        return Err(SandboxError::ExecFailed(format!("read job {name}: {e}")));
                    }
                }
            }

            let remaining = timeout.saturating_sub(stopwatch.elapsed());
            tokio::time::sleep(POLL_INTERVAL.min(remaining)).await;
        }
    }

    /// Fail fast when the pod is stuck on an image it can never pull instead
    /// of waiting out the deadline. List failures are left to the next poll.
    async fn check_image(&self, name: &str, stopwatch: Stopwatch) -> sandbox::Result<()> {
        let remaining = self.limits.timeout().saturating_sub(stopwatch.elapsed());
        let params = ListParams::default().labels(&unit_selector(name));
        let pods = match tokio::time::timeout(remaining, self.pods.list(&params)).await {
            Ok(Ok(list)) => list.items,
            Ok(Err(e)) => {
                debug!(job = name, error = %e, "failed to list job pods");
                return Ok(());
            }
            Err(_) => return Ok(()),
        };

        match pods.iter().find_map(image_pull_failure) {
            Some(reason) => {
                warn!(job = name, image = %self.config.image, reason, "image cannot be pulled");
                Err(SandboxError::ImageNotAvailable(format!(
                    "{} ({reason})",
                    self.config.image
                )))
            }
            None => Ok(()),
        }
    }

    fn creation_error(&self, e: &kube::Error, message: String) -> SandboxError {
        if is_not_found(e) {
            SandboxError::NamespaceNotFound(self.config.namespace.clone())
        } else {
            SandboxError::CreationFailed(message)
        }
    }

    /// No logs are fetched for a timed-out job; it is deleted right after.
    fn timed_out(&self, name: &str, stopwatch: Stopwatch) -> ExecutionResult {
        let elapsed = stopwatch.elapsed();
        warn!(job = name, timeout_secs = self.limits.timeout_seconds(), "execution timed out");
        ExecutionResult::timeout(
            String::new(),
            String::new(),
            self.limits.timeout_seconds(),
            elapsed,
        )
    }

    /// Read exit code and logs from the job's pod.
    async fn finish(&self, name: &str, phase: JobPhase, stopwatch: Stopwatch) -> ExecutionResult {
        let fallback_exit = if phase == JobPhase::Succeeded {
            0
        } else {
            GENERIC_FAILURE_EXIT_CODE
        };

        let params = ListParams::default().labels(&unit_selector(name));
        let pod = match self.pods.list(&params).await {
            Ok(list) => list.items.into_iter().next(),
            Err(e) => {
                warn!(job = name, error = %e, "failed to list job pods");
                None
            }
        };
        let Some((pod_name, exit_code)) = pod.and_then(|pod| {
            let exit_code = pod_exit_code(&pod).unwrap_or(fallback_exit);
            pod.metadata.name.map(|pod_name| (pod_name, exit_code))
        }) else {
            return ExecutionResult::completed(
                String::new(),
                String::new(),
                fallback_exit,
                stopwatch.elapsed(),
            )
            .with_error_message(format!("no pod found for job {name}"));
        };

        let params = LogParams {
            container: Some(CONTAINER_NAME.to_owned()),
            ..Default::default()
        };
        let result = match self.pods.logs(&pod_name, &params).await {
            Ok(logs) => {
                let output = attribute_merged_output(logs, exit_code);
                ExecutionResult::completed(output.stdout, output.stderr, exit_code, stopwatch.elapsed())
            }
            Err(e) => {
                warn!(job = name, pod = %pod_name, error = %e, "failed to fetch pod logs");
                ExecutionResult::completed(String::new(), String::new(), exit_code, stopwatch.elapsed())
                    .with_error_message(format!("fetch logs for pod {pod_name}: {e}"))
            }
        };
        info!(
            job = name,
            exit_code,
            elapsed_ms = whole_millis(result.execution_duration()),
            "job finished"
        );
        result
    }

    /// Idempotent teardown. Never fails; problems are logged and counted.
    async fn cleanup(&self, name: &str) {
        match self.jobs.delete(name, &DeleteParams::background()).await {
            Ok(_) => info!(job = name, "job deleted"),
            Err(e) if is_not_found(&e) => debug!(job = name, "job already gone"),
            Err(e) => {
                warn!(job = name, error = %e, "failed to delete job");
                telemetry::record_cleanup_failure(self.metrics.as_ref(), BACKEND);
            }
        }

        if self.network != NetworkMode::None {
            return;
        }
        match self.policies.delete(name, &DeleteParams::default()).await {
            Ok(_) => debug!(job = name, "network policy deleted"),
            Err(e) if is_not_found(&e) => debug!(job = name, "network policy already gone"),
            Err(e) => {
                warn!(job = name, error = %e, "failed to delete network policy");
                telemetry::record_cleanup_failure(self.metrics.as_ref(), BACKEND);
            }
        }
    }
}

#[async_trait]
impl Sandbox for OrchestratorSandbox {
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
        let name = unit_name(UNIT_PREFIX, code);
        let job = job_manifest(&name, code, &self.limits, self.network, &self.config);

        // The policy has to exist before the pod does.
        if self.network == NetworkMode::None {
            let policy = deny_all_policy(&name, &self.config);
            if let Err(e) = self.policies.create(&PostParams::default(), &policy).await {
                self.cleanup(&name).await;
                return Err(self.creation_error(&e, format!("create network policy {name}: {e}")));
            }
            debug!(job = %name, "network policy created");
        }

        if let Err(e) = self.jobs.create(&PostParams::default(), &job).await {
            // The create may have landed even though the response was lost.
            self.cleanup(&name).await;
            return Err(self.creation_error(&e, format!("create job {name}: {e}")));
        }
        info!(job = %name, namespace = %self.config.namespace, "job submitted");

        let outcome = self.supervise(&name, stopwatch).await;
        self.cleanup(&name).await;

        if let Ok(result) = &outcome {
            telemetry::record_execution(self.metrics.as_ref(), BACKEND, result);
        }
        outcome
    }
}

async fn verify_namespace(client: &Client, namespace: &str) -> sandbox::Result<()> {
    let namespaces: Api<Namespace> = Api::all(client.clone());
    match namespaces.get(namespace).await {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Err(SandboxError::NamespaceNotFound(namespace.to_owned())),
        Err(e) => Err(SandboxError::BackendNotAvailable(format!(
            "get namespace {namespace}: {e}"
        ))),
    }
}

fn is_not_found(e: &kube::Error) -> bool {
    matches!(e, kube::Error::Api(response) if response.code == 404)
}
