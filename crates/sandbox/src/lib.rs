mod error;
mod limits;
pub mod output;
mod result;
mod sandbox;
pub mod telemetry;
pub mod unit;

pub use error::{Result, SandboxError};
pub use limits::{
    DISK_QUOTA_MB_RANGE, LimitsBuilder, MAX_CPU_QUOTA, MAX_PROCESSES_RANGE, MEMORY_LIMIT_MB_RANGE,
    NetworkMode, Preset, ResourceLimits, TIMEOUT_SECONDS_RANGE,
};
pub use result::{ExecutionResult, GENERIC_FAILURE_EXIT_CODE, TIMEOUT_EXIT_CODE};
pub use sandbox::Sandbox;
pub use telemetry::{MetricsSink, TracingMetrics};
