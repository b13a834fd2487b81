//! Translation of [`ResourceLimits`] into an engine container definition.

use std::collections::HashMap;

use bollard::container::Config;
use bollard::models::HostConfig;
use sandbox::{NetworkMode, ResourceLimits};

use crate::config::DockerConfig;

/// Label carried by every unit this crate creates; `sweep_stale` keys on it.
pub const MANAGED_BY_LABEL: &str = "sandbox.managed-by";
pub const MANAGED_BY_VALUE: &str = "sandbox-docker";
pub const UNIT_LABEL: &str = "sandbox.unit";

/// Writable scratch directories. Everything else is read-only.
const SCRATCH_DIRS: [&str; 2] = ["/tmp", "/var/tmp"];

const BYTES_PER_MB: i64 = 1024 * 1024;
const NANOS_PER_CPU: f64 = 1_000_000_000.0;

/// Build the create request for one unit.
pub(crate) fn container_config(
    name: &str,
    code: &str,
    limits: &ResourceLimits,
    network: NetworkMode,
    config: &DockerConfig,
) -> Config<String> {
    let mut cmd = config.interpreter.clone();
    cmd.push(code.to_owned());

    let labels = HashMap::from([
        (MANAGED_BY_LABEL.to_owned(), MANAGED_BY_VALUE.to_owned()),
        (UNIT_LABEL.to_owned(), name.to_owned()),
    ]);

    Config {
        image: Some(config.image.clone()),
        cmd: Some(cmd),
        env: Some(vec![
            "HOME=/tmp".to_owned(),
            "PYTHONUNBUFFERED=1".to_owned(),
            "PYTHONDONTWRITEBYTECODE=1".to_owned(),
        ]),
        user: Some(config.user.clone()),
        working_dir: Some("/tmp".to_owned()),
        labels: Some(labels),
        network_disabled: Some(network == NetworkMode::None),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        tty: Some(false),
        host_config: Some(host_config(limits, network)),
        ..Default::default()
    }
}

fn host_config(limits: &ResourceLimits, network: NetworkMode) -> HostConfig {
    let memory = i64::from(limits.memory_limit_mb()) * BYTES_PER_MB;
    let scratch = format!("rw,noexec,nosuid,nodev,size={}m", limits.disk_quota_mb());

    HostConfig {
        memory: Some(memory),
        // Equal to `memory`: no swap on top of the limit.
        memory_swap: Some(memory),
        nano_cpus: Some(nano_cpus(limits.cpu_quota())),
        pids_limit: Some(i64::from(limits.max_processes())),
        readonly_rootfs: Some(true),
        tmpfs: Some(
            SCRATCH_DIRS
                .iter()
                .map(|dir| ((*dir).to_owned(), scratch.clone()))
                .collect(),
        ),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        network_mode: Some(network_mode(network).to_owned()),
        privileged: Some(false),
        ..Default::default()
    }
}

fn network_mode(network: NetworkMode) -> &'static str {
    match network {
        NetworkMode::Unrestricted => "bridge",
        // Allowlist never reaches here: construction refuses it.
        NetworkMode::None | NetworkMode::Allowlist => "none",
    }
}

fn nano_cpus(cpu_quota: f64) -> i64 {
    (cpu_quota * NANOS_PER_CPU).round() as i64
}
