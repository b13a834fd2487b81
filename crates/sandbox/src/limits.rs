use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};

pub const TIMEOUT_SECONDS_RANGE: RangeInclusive<u32> = 1..=599;
pub const MEMORY_LIMIT_MB_RANGE: RangeInclusive<u32> = 64..=16383;
pub const DISK_QUOTA_MB_RANGE: RangeInclusive<u32> = 1..=16383;
pub const MAX_PROCESSES_RANGE: RangeInclusive<u32> = 1..=100;
/// Exclusive upper bound for `cpu_quota`.
pub const MAX_CPU_QUOTA: f64 = 16.0;

/// Network access granted to an execution unit.
///
/// Variants are ordered from strictest to most permissive, so `Ord` doubles
/// as the strictness relation used by [`ResourceLimits::is_within`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkMode {
    None,
    Allowlist,
    Unrestricted,
}

impl NetworkMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Allowlist => "allowlist",
            Self::Unrestricted => "unrestricted",
        }
    }
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NetworkMode {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "none" => Ok(Self::None),
            "allowlist" => Ok(Self::Allowlist),
            "unrestricted" => Ok(Self::Unrestricted),
            other => Err(SandboxError::InvalidConfig(format!(
                "unknown network_mode {other:?} (expected none, allowlist or unrestricted)"
            ))),
        }
    }
}

/// Named limit sets for common workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Preset {
    Development,
    Production,
    Testing,
    DataProcessing,
}

impl Preset {
    pub const ALL: [Preset; 4] = [
        Preset::Development,
        Preset::Production,
        Preset::Testing,
        Preset::DataProcessing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
            Self::Testing => "testing",
            Self::DataProcessing => "data_processing",
        }
    }

    pub fn limits(self) -> ResourceLimits {
        let (timeout_seconds, memory_limit_mb, cpu_quota, disk_quota_mb, max_processes, network) =
            match self {
                Self::Development => (300, 2048, 2.0, 1024, 50, NetworkMode::Unrestricted),
                Self::Production => (30, 512, 1.0, 100, 10, NetworkMode::None),
                Self::Testing => (10, 256, 0.5, 50, 5, NetworkMode::None),
                Self::DataProcessing => (300, 4096, 4.0, 2048, 20, NetworkMode::None),
            };
        ResourceLimits {
            timeout_seconds,
            memory_limit_mb,
            cpu_quota,
            disk_quota_mb,
            max_processes,
            network_mode: network,
            allowed_domains: BTreeSet::new(),
        }
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Preset {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|preset| preset.as_str() == s)
            .ok_or_else(|| SandboxError::InvalidConfig(format!("unknown limits preset {s:?}")))
    }
}

/// Validated, immutable execution constraints.
///
/// The only ways to obtain one are [`Preset::limits`], the preset shortcuts,
/// [`LimitsBuilder::build`] and deserialization (which runs the builder), so
/// every instance in circulation is within range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "LimitsBuilder")]
pub struct ResourceLimits {
    timeout_seconds: u32,
    memory_limit_mb: u32,
    cpu_quota: f64,
    disk_quota_mb: u32,
    max_processes: u32,
    network_mode: NetworkMode,
    allowed_domains: BTreeSet<String>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Preset::Production.limits()
    }
}

impl ResourceLimits {
    pub fn builder() -> LimitsBuilder {
        LimitsBuilder::default()
    }

    /// Start a builder seeded with this instance's values.
    pub fn to_builder(&self) -> LimitsBuilder {
        LimitsBuilder {
            timeout_seconds: self.timeout_seconds,
            memory_limit_mb: self.memory_limit_mb,
            cpu_quota: self.cpu_quota,
            disk_quota_mb: self.disk_quota_mb,
            max_processes: self.max_processes,
            network_mode: self.network_mode,
            allowed_domains: self.allowed_domains.iter().cloned().collect(),
        }
    }

    pub fn development() -> Self {
        Preset::Development.limits()
    }

    pub fn production() -> Self {
        Preset::Production.limits()
    }

    pub fn testing() -> Self {
        Preset::Testing.limits()
    }

    pub fn data_processing() -> Self {
        Preset::DataProcessing.limits()
    }

    pub fn timeout_seconds(&self) -> u32 {
        self.timeout_seconds
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }

    pub fn memory_limit_mb(&self) -> u32 {
        self.memory_limit_mb
    }

    pub fn cpu_quota(&self) -> f64 {
        self.cpu_quota
    }

    pub fn disk_quota_mb(&self) -> u32 {
        self.disk_quota_mb
    }

    pub fn max_processes(&self) -> u32 {
        self.max_processes
    }

    pub fn network_mode(&self) -> NetworkMode {
        self.network_mode
    }

    pub fn allowed_domains(&self) -> &BTreeSet<String> {
        &self.allowed_domains
    }

    /// The network mode a backend has to enforce.
    ///
    /// An allowlist without domains grants nothing and collapses to `None`.
    pub fn effective_network(&self) -> NetworkMode {
        match self.network_mode {
            NetworkMode::Allowlist if self.allowed_domains.is_empty() => NetworkMode::None,
            mode => mode,
        }
    }

    /// True when every bound of `self` fits inside `other`.
    pub fn is_within(&self, other: &ResourceLimits) -> bool {
        self.timeout_seconds <= other.timeout_seconds
            && self.memory_limit_mb <= other.memory_limit_mb
            && self.cpu_quota <= other.cpu_quota
            && self.disk_quota_mb <= other.disk_quota_mb
            && self.max_processes <= other.max_processes
            && self.network_within(other)
    }

    fn network_within(&self, other: &ResourceLimits) -> bool {
        match (self.network_mode, other.network_mode) {
            (NetworkMode::Allowlist, NetworkMode::Allowlist) => {
                self.allowed_domains.is_subset(&other.allowed_domains)
            }
            (mine, theirs) => mine <= theirs,
        }
    }

    /// Plain JSON form, the inverse of [`ResourceLimits::from_value`].
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::json!({
            "timeout_seconds": self.timeout_seconds,
            "memory_limit_mb": self.memory_limit_mb,
            "cpu_quota": self.cpu_quota,
            "disk_quota_mb": self.disk_quota_mb,
            "max_processes": self.max_processes,
            "network_mode": self.network_mode.as_str(),
            "allowed_domains": self.allowed_domains.iter().collect::<Vec<_>>(),
        })
    }

    /// Parse and validate limits from JSON. Missing fields take the
    /// production defaults.
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value::<LimitsBuilder>(value)
            .map_err(|e| SandboxError::InvalidConfig(format!("limits: {e}")))?
            .build()
    }
}

/// Unvalidated limit values. [`LimitsBuilder::build`] is the single
/// validation point.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitsBuilder {
    timeout_seconds: u32,
    memory_limit_mb: u32,
    cpu_quota: f64,
    disk_quota_mb: u32,
    max_processes: u32,
    network_mode: NetworkMode,
    allowed_domains: Vec<String>,
}

impl Default for LimitsBuilder {
    fn default() -> Self {
        ResourceLimits::default().to_builder()
    }
}

impl LimitsBuilder {
    pub fn timeout_seconds(mut self, value: u32) -> Self {
        self.timeout_seconds = value;
        self
    }

    pub fn memory_limit_mb(mut self, value: u32) -> Self {
        self.memory_limit_mb = value;
        self
    }

    pub fn cpu_quota(mut self, value: f64) -> Self {
        self.cpu_quota = value;
        self
    }

    pub fn disk_quota_mb(mut self, value: u32) -> Self {
        self.disk_quota_mb = value;
        self
    }

    pub fn max_processes(mut self, value: u32) -> Self {
        self.max_processes = value;
        self
    }

    pub fn network_mode(mut self, value: NetworkMode) -> Self {
        self.network_mode = value;
        self
    }

    pub fn allowed_domains<I, S>(mut self, domains: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_domains = domains.into_iter().map(Into::into).collect();
        self
    }

    /// Validate every field and report all problems in one error.
    pub fn build(self) -> Result<ResourceLimits> {
        let mut errors = Vec::new();

        check_range("timeout_seconds", self.timeout_seconds, TIMEOUT_SECONDS_RANGE, &mut errors);
        check_range("memory_limit_mb", self.memory_limit_mb, MEMORY_LIMIT_MB_RANGE, &mut errors);
        check_range("disk_quota_mb", self.disk_quota_mb, DISK_QUOTA_MB_RANGE, &mut errors);
        check_range("max_processes", self.max_processes, MAX_PROCESSES_RANGE, &mut errors);
        if !(self.cpu_quota.is_finite() && self.cpu_quota > 0.0 && self.cpu_quota < MAX_CPU_QUOTA) {
            errors.push(format!(
                "cpu_quota must be > 0 and < {MAX_CPU_QUOTA}, got {}",
                self.cpu_quota
            ));
        }

        let mut allowed_domains = BTreeSet::new();
        for domain in &self.allowed_domains {
            let normalized = domain.trim().to_ascii_lowercase();
            if normalized.is_empty() || normalized.chars().any(char::is_whitespace) {
                errors.push(format!("invalid allowed domain {domain:?}"));
            } else {
                allowed_domains.insert(normalized);
            }
        }
        if !allowed_domains.is_empty() && self.network_mode != NetworkMode::Allowlist {
            errors.push(format!(
                "allowed_domains requires network_mode=allowlist, got {}",
                self.network_mode
            ));
        }

        if !errors.is_empty() {
            return Err(SandboxError::InvalidConfig(errors.join("; ")));
        }

        Ok(ResourceLimits {
            timeout_seconds: self.timeout_seconds,
            memory_limit_mb: self.memory_limit_mb,
            cpu_quota: self.cpu_quota,
            disk_quota_mb: self.disk_quota_mb,
            max_processes: self.max_processes,
            network_mode: self.network_mode,
            allowed_domains,
        })
    }
}

impl TryFrom<LimitsBuilder> for ResourceLimits {
    type Error = SandboxError;

    fn try_from(builder: LimitsBuilder) -> Result<Self> {
        builder.build()
    }
}

fn check_range(field: &str, value: u32, range: RangeInclusive<u32>, errors: &mut Vec<String>) {
    if !range.contains(&value) {
        errors.push(format!(
            "{field} must be between {} and {}, got {value}",
            range.start(),
            range.end()
        ));
    }
}
