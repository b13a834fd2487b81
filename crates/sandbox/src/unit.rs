//! Helpers shared by every backend for one ephemeral execution unit.

use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::error::{Result, SandboxError};
use crate::limits::{NetworkMode, ResourceLimits};
use crate::result::ExecutionResult;

/// Kubernetes object names are capped at 63 characters.
const MAX_UNIT_NAME_LEN: usize = 63;

/// Measures `execution_time` the same way for every backend: started before
/// provisioning, frozen when teardown begins.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    started: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// Milliseconds for log fields, saturating instead of truncating.
pub fn whole_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Fast path for blank input: nothing is provisioned.
pub fn reject_blank(code: &str) -> Option<ExecutionResult> {
    if code.trim().is_empty() {
        Some(ExecutionResult::rejected(
            "empty input: no code to execute",
            Duration::ZERO,
        ))
    } else {
        None
    }
}

/// The network mode a backend can actually enforce for `limits`.
///
/// Per-domain egress filtering is not implemented by any backend, so a
/// non-empty allowlist is refused instead of being widened to full access.
/// An empty allowlist grants nothing and maps to `None`.
pub fn enforceable_network(limits: &ResourceLimits) -> Result<NetworkMode> {
    match limits.effective_network() {
        NetworkMode::Allowlist => Err(SandboxError::UnsupportedNetwork(format!(
            "per-domain egress filtering is not available (requested: {}); \
             use network_mode=none or unrestricted",
            limits
                .allowed_domains()
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        ))),
        mode => Ok(mode),
    }
}

/// Name for a new unit: `{prefix}-{unix millis}-{code hash}-{random}`.
///
/// Lowercase alphanumerics and dashes only, so the result is a valid container
/// name and RFC 1123 label. The hash and suffix give uniqueness, nothing more.
pub fn unit_name(prefix: &str, code: &str) -> String {
    let digest = format!("{:x}", Sha256::digest(code.as_bytes()));
    let hash = digest.get(..8).unwrap_or(&digest);
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    let nonce = nonce.get(..6).unwrap_or(&nonce);
    let millis = chrono::Utc::now().timestamp_millis();

    let prefix: String = prefix
        .chars()
        .map(|c| c.to_ascii_lowercase())
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    let prefix = prefix.trim_matches('-');
    let prefix = if prefix.is_empty() { "sandbox" } else { prefix };

    let suffix = format!("-{millis}-{hash}-{nonce}");
    let room = MAX_UNIT_NAME_LEN.saturating_sub(suffix.len());
    let prefix = prefix.get(..room.min(prefix.len())).unwrap_or(prefix);
    format!("{prefix}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_code_is_rejected() {
        for code in ["", "   ", "\n\t "] {
            let result = reject_blank(code).unwrap();
            assert!(!result.success());
            assert!(result.error_message().unwrap().contains("empty input"));
            assert_eq!(result.execution_time(), 0.0);
        }
        assert!(reject_blank("print(1)").is_none());
    }

    #[test]
    fn millis_saturate() {
        assert_eq!(whole_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(whole_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn allowlist_with_domains_is_refused() {
        let limits = ResourceLimits::builder()
            .network_mode(NetworkMode::Allowlist)
            .allowed_domains(["pypi.org"])
            .build()
            .unwrap();
        let err = enforceable_network(&limits).unwrap_err();
        assert!(matches!(err, SandboxError::UnsupportedNetwork(_)));
        assert!(err.to_string().contains("pypi.org"), "got: {err}");
    }

    #[test]
    fn enforceable_modes_pass_through() {
        let empty_allowlist = ResourceLimits::builder()
            .network_mode(NetworkMode::Allowlist)
            .build()
            .unwrap();
        assert_eq!(enforceable_network(&empty_allowlist).unwrap(), NetworkMode::None);
        assert_eq!(
            enforceable_network(&ResourceLimits::development()).unwrap(),
            NetworkMode::Unrestricted
        );
        assert_eq!(
            enforceable_network(&ResourceLimits::production()).unwrap(),
            NetworkMode::None
        );
    }

    #[test]
    fn unit_name_is_dns_label() {
        let name = unit_name("Sandbox_Job", "print('hi')");
        assert!(name.len() <= MAX_UNIT_NAME_LEN, "{name}");
        assert!(name.starts_with("sandboxjob-"), "{name}");
        assert!(
            name.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'),
            "{name}"
        );
    }

    #[test]
    fn unit_name_embeds_code_hash() {
        let a = unit_name("sandbox", "print(1)");
        let b = unit_name("sandbox", "print(2)");
        let hash_of = |name: &str| name.split('-').nth(2).map(str::to_owned);
        assert_ne!(hash_of(&a), hash_of(&b));
        assert_eq!(hash_of(&a), hash_of(&unit_name("sandbox", "print(1)")));
    }

    #[test]
    fn unit_names_differ_for_same_code() {
        let a = unit_name("sandbox", "x = 1");
        let b = unit_name("sandbox", "x = 1");
        assert_ne!(a, b);
    }

    #[test]
    fn long_prefix_is_truncated() {
        let name = unit_name(&"a".repeat(100), "x");
        assert!(name.len() <= MAX_UNIT_NAME_LEN, "{name}");
    }

    #[test]
    fn empty_prefix_falls_back() {
        assert!(unit_name("__", "x").starts_with("sandbox-"));
    }
}
