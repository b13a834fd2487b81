use std::sync::Arc;

use sandbox::{MetricsSink, Sandbox, TracingMetrics};
use sandbox_docker::ContainerSandbox;
use sandbox_k8s::OrchestratorSandbox;
use tracing::info;

use crate::config::{BackendSettings, Settings};
use crate::error::RunnerResult;

/// Build the configured backend. Fails fast if it is unreachable.
pub async fn connect(settings: &Settings) -> RunnerResult<Box<dyn Sandbox>> {
    connect_with_metrics(settings, Arc::new(TracingMetrics)).await
}

pub async fn connect_with_metrics(
    settings: &Settings,
    metrics: Arc<dyn MetricsSink>,
) -> RunnerResult<Box<dyn Sandbox>> {
    let limits = settings.limits.clone();
    let sandbox: Box<dyn Sandbox> = match &settings.backend {
        BackendSettings::Docker(config) => Box::new(
            ContainerSandbox::connect(config.clone(), limits)
                .await?
                .with_metrics(metrics),
        ),
        BackendSettings::Kubernetes(config) => Box::new(
            OrchestratorSandbox::connect(config.clone(), limits)
                .await?
                .with_metrics(metrics),
        ),
    };
    info!(backend = sandbox.backend(), "sandbox connected");
    Ok(sandbox)
}
