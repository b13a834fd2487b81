//! Job manifests and status interpretation.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, EmptyDirVolumeSource, EnvVar, Pod, PodSecurityContext, PodSpec,
    PodTemplateSpec, ResourceRequirements, SeccompProfile, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicySpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use sandbox::{NetworkMode, ResourceLimits};

use crate::config::KubernetesConfig;

pub const MANAGED_BY_LABEL: &str = "sandbox.managed-by";
pub const MANAGED_BY_VALUE: &str = "sandbox-k8s";
/// Set on the job and its pod template. Pod lookups and the per-job
/// NetworkPolicy both select on it.
pub const UNIT_LABEL: &str = "sandbox.unit";
/// Network mode requested for the pod. Informational; isolation comes from
/// the per-job NetworkPolicy.
pub const NETWORK_LABEL: &str = "sandbox.network";

pub(crate) const CONTAINER_NAME: &str = "sandbox";

/// Seconds the orchestrator waits past the client deadline before it kills
/// the job itself.
pub(crate) const DEADLINE_GRACE_SECS: i64 = 10;

const SCRATCH_VOLUME: &str = "scratch";

/// Waiting reasons after which the pod will never start.
const IMAGE_PULL_FAILURES: [&str; 4] = [
    "ErrImagePull",
    "ImagePullBackOff",
    "InvalidImageName",
    "ErrImageNeverPull",
];

/// Where a job stands after one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JobPhase {
    Running,
    Succeeded,
    Failed,
    /// `activeDeadlineSeconds` fired.
    DeadlineExceeded,
}

pub(crate) fn job_manifest(
    name: &str,
    code: &str,
    limits: &ResourceLimits,
    network: NetworkMode,
    config: &KubernetesConfig,
) -> Job {
    let labels = BTreeMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (UNIT_LABEL.to_owned(), name.to_owned()),
        (NETWORK_LABEL.to_owned(), network.as_str().to_owned()),
    ]);

    let mut command = config.interpreter.clone();
    command.push(code.to_owned());

    // Requests equal limits: Guaranteed QoS, no bursting.
    let resources = BTreeMap::from([
        ("cpu".to_owned(), Quantity(cpu_millis(limits.cpu_quota()))),
        ("memory".to_owned(), Quantity(format!("{}Mi", limits.memory_limit_mb()))),
    ]);

    let container = Container {
        name: CONTAINER_NAME.to_owned(),
        image: Some(config.image.clone()),
        command: Some(command),
        working_dir: Some("/tmp".to_owned()),
        env: Some(vec![
            env("HOME", "/tmp"),
            env("PYTHONUNBUFFERED", "1"),
            env("PYTHONDONTWRITEBYTECODE", "1"),
        ]),
        resources: Some(ResourceRequirements {
            limits: Some(resources.clone()),
            requests: Some(resources),
            ..Default::default()
        }),
        security_context: Some(SecurityContext {
            allow_privilege_escalation: Some(false),
            privileged: Some(false),
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_owned()]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volume_mounts: Some(vec![VolumeMount {
            name: SCRATCH_VOLUME.to_owned(),
            mount_path: "/tmp".to_owned(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod_spec = PodSpec {
        containers: vec![container],
        restart_policy: Some("Never".to_owned()),
        automount_service_account_token: Some(false),
        enable_service_links: Some(false),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user: Some(config.run_as_user),
            run_as_group: Some(config.run_as_user),
            fs_group: Some(config.run_as_user),
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_owned(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        volumes: Some(vec![Volume {
            name: SCRATCH_VOLUME.to_owned(),
            empty_dir: Some(EmptyDirVolumeSource {
                medium: Some("Memory".to_owned()),
                size_limit: Some(Quantity(format!("{}Mi", limits.disk_quota_mb()))),
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(config.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(0),
            ttl_seconds_after_finished: Some(config.ttl_seconds_after_finished),
            active_deadline_seconds: Some(
                i64::from(limits.timeout_seconds()) + DEADLINE_GRACE_SECS,
            ),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(pod_spec),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Label selector matching the unit's pod.
pub(crate) fn unit_selector(name: &str) -> String {
    format!("{UNIT_LABEL}={name}")
}

/// Deny-all policy for one job's pod: both directions listed, no rules.
///
/// Only enforced when the cluster runs a NetworkPolicy-aware CNI.
pub(crate) fn deny_all_policy(name: &str, config: &KubernetesConfig) -> NetworkPolicy {
    NetworkPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: Some(config.namespace.clone()),
            labels: Some(BTreeMap::from([
                (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
                (UNIT_LABEL.to_owned(), name.to_owned()),
            ])),
            ..Default::default()
        },
        spec: Some(NetworkPolicySpec {
            pod_selector: LabelSelector {
                match_labels: Some(BTreeMap::from([(UNIT_LABEL.to_owned(), name.to_owned())])),
                ..Default::default()
            },
            policy_types: Some(vec!["Ingress".to_owned(), "Egress".to_owned()]),
            ..Default::default()
        }),
    }
}

pub(crate) fn job_phase(job: &Job) -> JobPhase {
    let Some(status) = &job.status else {
        return JobPhase::Running;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return JobPhase::Succeeded,
            "Failed" if condition.reason.as_deref() == Some("DeadlineExceeded") => {
                return JobPhase::DeadlineExceeded;
            }
            "Failed" => return JobPhase::Failed,
            _ => {}
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        JobPhase::Succeeded
    } else if status.failed.unwrap_or(0) > 0 {
        JobPhase::Failed
    } else {
        JobPhase::Running
    }
}

/// Exit code of the sandbox container, once it has terminated.
pub(crate) fn pod_exit_code(pod: &Pod) -> Option<i64> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|status| status.name == CONTAINER_NAME)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|terminated| i64::from(terminated.exit_code))
}

/// Waiting reason of the sandbox container when its image cannot be pulled.
pub(crate) fn image_pull_failure(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .filter(|status| status.name == CONTAINER_NAME)
        .find_map(|status| status.state.as_ref()?.waiting.as_ref()?.reason.as_deref())
        .filter(|reason| IMAGE_PULL_FAILURES.contains(reason))
}

fn cpu_millis(cpu_quota: f64) -> String {
    let millis = (cpu_quota * 1000.0).round() as i64;
    format!("{}m", millis.max(1))
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_owned(),
        value: Some(value.to_owned()),
        ..Default::default()
    }
}
